//! Shared fixture for the end-to-end tests.
//!
//! A "course" lives in a temp directory:
//! - `forge/` holds bare repositories laid out like forge project paths and
//!   is used as the clone base (`file://` URLs, no network);
//! - `cs101/lab1` is the primary project with a `problem` branch;
//! - every group project starts with `main` equal to `problem`;
//! - forge API calls go to a [`MemoryForge`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

use labsync_core::config::AppConfig;
use labsync_core::db::Database;
use labsync_core::forge::MemoryForge;
use labsync_core::models::CycleReport;
use labsync_core::{CycleFilter, PollEngine, Registry, RosterFile};

pub const LAB: &str = "lab1";
pub const PRIMARY_PROJECT: &str = "cs101/lab1";

pub struct Course {
    pub dir: TempDir,
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub forge: Arc<MemoryForge>,
    pub roster: Arc<RosterFile>,
    pub engine: PollEngine,
    pub problem_base: Oid,
}

pub fn sig(name: &str) -> Signature<'static> {
    Signature::now(name, &format!("{name}@example.edu")).unwrap()
}

/// Commit `files` on top of `parent` in `repo` and point `refname` at it.
pub fn commit_files(
    repo: &Repository,
    refname: &str,
    parent: Option<Oid>,
    files: &[(&str, &str)],
    message: &str,
) -> Oid {
    let parent = parent.map(|p| repo.find_commit(p).unwrap());
    let base_tree = parent.as_ref().map(|p| p.tree().unwrap());
    let mut builder = repo.treebuilder(base_tree.as_ref()).unwrap();
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(Some(refname), &sig("Student"), &sig("Student"), message, &tree, &parents)
        .unwrap()
}

impl Course {
    /// A course with one lab, graded through issues, and the given groups.
    pub fn new(groups: &[&str]) -> Self {
        Self::with_mode(groups, "issue")
    }

    pub fn with_mode(groups: &[&str], mode: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let primary = Repository::init_bare(project_dir(&root, PRIMARY_PROJECT)).unwrap();
        let problem_base = commit_files(
            &primary,
            "refs/heads/problem",
            None,
            &[
                ("Foo.java", "class Foo {\n    int answer() { return 0; }\n}\n"),
                ("README", "Lab 1\n"),
            ],
            "Problem statement",
        );

        let mut roster = String::new();
        for group in groups {
            roster.push_str(&format!(
                "[[groups]]\nid = \"{group}\"\nmembers = [\"{group}-alice\", \"{group}-bob\"]\n\n"
            ));
        }
        std::fs::write(root.join("roster.toml"), roster).unwrap();

        let toml = format!(
            r#"
[daemon]
course = "cs101"
data_dir = "{root}/data"
lineage_warn_after_cycles = 2

[forge]
api_url = "https://forge.test/api/v4"
git_base_url = "file://{root}/forge"
graders = ["ta1", "ta2"]
system_users = ["ci-bot"]

[retry]
max_attempts = 1

[grading]
mode = "{mode}"
maximum_reserve_secs = 3600

[roster]
file = "{root}/roster.toml"

[[labs]]
id = "{LAB}"
primary_project = "{PRIMARY_PROJECT}"
group_namespace = "cs101/groups"
problem_branches = ["problem"]
"#,
            root = root.display()
        );
        let config: AppConfig = toml::from_str(&toml).unwrap();
        config.validate().unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let forge = Arc::new(MemoryForge::new("labsync"));
        let roster = Arc::new(RosterFile::new(config.roster.file.clone()));
        for group in groups {
            create_group_project(&root, &forge, group);
        }
        let engine = engine(&config, &db, &forge, &roster);

        Self {
            dir,
            config,
            db,
            forge,
            roster,
            engine,
            problem_base,
        }
    }

    /// Replace the engine with a fresh one over the same database, forge
    /// and roster, as after a daemon restart.
    pub fn restart(&mut self) {
        self.engine = engine(&self.config, &self.db, &self.forge, &self.roster);
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn project(&self, group: &str) -> String {
        project_path(group)
    }

    pub fn primary(&self) -> Repository {
        Repository::open_bare(project_dir(self.dir.path(), PRIMARY_PROJECT)).unwrap()
    }

    pub fn origin(&self, group: &str) -> Repository {
        Repository::open_bare(project_dir(self.dir.path(), &self.project(group))).unwrap()
    }

    pub fn head(&self, group: &str, branch: &str) -> Oid {
        self.origin(group)
            .find_reference(&format!("refs/heads/{branch}"))
            .unwrap()
            .target()
            .unwrap()
    }

    /// A student commit on the group's `main`.
    pub fn student_commit(&self, group: &str, files: &[(&str, &str)], message: &str) -> Oid {
        let parent = self.head(group, "main");
        commit_files(&self.origin(group), "refs/heads/main", Some(parent), files, message)
    }

    /// Push an annotated tag to the group project and make the forge list it.
    pub fn push_tag(&self, group: &str, tag: &str, commit: Oid, message: &str) {
        let origin = self.origin(group);
        let target = origin.find_object(commit, None).unwrap();
        origin.tag(tag, &target, &sig("Student"), message, false).unwrap();
        self.forge
            .add_tag(&self.project(group), tag, &commit.to_string(), Some(message));
    }

    /// Commit on a primary project branch.
    pub fn primary_commit(
        &self,
        branch: &str,
        parent: Oid,
        files: &[(&str, &str)],
        message: &str,
    ) -> Oid {
        commit_files(&self.primary(), &format!("refs/heads/{branch}"), Some(parent), files, message)
    }

    pub async fn poll(&self) -> CycleReport {
        self.engine
            .run_cycle(&CycleFilter::all(), &AtomicBool::new(false))
            .await
            .unwrap()
    }

    pub fn registry(&self) -> Registry {
        Registry::new(&self.config, Arc::clone(&self.db), self.roster.clone())
    }
}

fn project_path(group: &str) -> String {
    format!("cs101/groups/{group}/{LAB}")
}

fn project_dir(root: &Path, project: &str) -> PathBuf {
    root.join("forge").join(format!("{project}.git"))
}

fn create_group_project(root: &Path, forge: &MemoryForge, group: &str) {
    let project = project_path(group);
    let origin = Repository::init_bare(project_dir(root, &project)).unwrap();
    let primary_url = format!("file://{}", project_dir(root, PRIMARY_PROJECT).display());
    let mut remote = origin.remote_anonymous(&primary_url).unwrap();
    remote
        .fetch(&["+refs/heads/problem:refs/heads/main"], None, None)
        .unwrap();
    forge.create_project(&project);
}

fn engine(
    config: &AppConfig,
    db: &Arc<Database>,
    forge: &Arc<MemoryForge>,
    roster: &Arc<RosterFile>,
) -> PollEngine {
    PollEngine::new(config.clone(), Arc::clone(db), forge.clone(), roster.clone()).unwrap()
}
