//! End-to-end tests for submission detection and grading.
//!
//! These drive the real `PollEngine` against local bare repositories
//! (`file://` clone URLs) and an in-memory forge, then play the part of
//! students (pushing tags) and graders (editing labels).

mod common;

use std::sync::atomic::AtomicBool;

use common::{Course, LAB};
use labsync_core::models::{GradingStatus, ThreadKind};
use labsync_core::CycleFilter;

const SOLVED: (&str, &str) = ("Foo.java", "class Foo {\n    int answer() { return 42; }\n}\n");

// ===========================================================================
// Detection
// ===========================================================================

#[tokio::test]
async fn test_tag_becomes_submission_with_grading_issue() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve lab 1");
    course.push_tag("g1", "submission-1", commit, "Please grade\nSecond line");

    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert_eq!(outcome.new_submissions, vec!["submission-1"]);
    assert_eq!(outcome.registered.len(), 1);
    assert!(outcome.error.is_none());

    let subs = course.db.list_submissions(LAB, "g1").unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].sequence, 1);
    assert_eq!(subs[0].commit_hash, commit.to_string());
    assert_eq!(subs[0].problem_branch, "problem");

    let threads = course.forge.threads(&course.project("g1"));
    assert_eq!(threads.len(), 1);
    let thread = &threads[0];
    assert_eq!(thread.kind, ThreadKind::Issue);
    assert_eq!(thread.title, "Grading for g1 on lab1");
    assert!(thread.description.contains("@g1-alice @g1-bob"));
    assert_eq!(thread.labels, vec!["waiting-for-grading"]);
    assert_eq!(thread.notes.len(), 1);
    assert!(thread.notes[0].contains("submission-1"));
    assert!(thread.notes[0].contains("> Please grade\n> Second line"));
}

#[tokio::test]
async fn test_polling_again_changes_nothing() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;

    let second = course.poll().await;
    assert!(second.group(LAB, "g1").unwrap().is_quiet());
    assert_eq!(course.db.list_submissions(LAB, "g1").unwrap().len(), 1);
    let threads = course.forge.threads(&course.project("g1"));
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].notes.len(), 1);
}

#[tokio::test]
async fn test_restart_does_not_rediscover_submissions() {
    let mut course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;

    course.restart();
    let report = course.poll().await;
    assert!(report.group(LAB, "g1").unwrap().is_quiet());
    assert_eq!(course.forge.threads(&course.project("g1"))[0].notes.len(), 1);
}

#[tokio::test]
async fn test_tags_get_increasing_sequence_numbers() {
    let course = Course::new(&["g1"]);
    let first = course.student_commit("g1", &[("A.java", "a")], "first");
    course.push_tag("g1", "submission-a", first, "first try");
    let second = course.student_commit("g1", &[SOLVED], "second");
    course.push_tag("g1", "submission-b", second, "second try");

    let report = course.poll().await;
    assert_eq!(
        report.group(LAB, "g1").unwrap().new_submissions,
        vec!["submission-a", "submission-b"]
    );
    let subs = course.db.list_submissions(LAB, "g1").unwrap();
    let sequences: Vec<i64> = subs.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);

    // Both share the group's single thread.
    let requests = course.db.list_grading_requests(LAB, "g1").unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].thread, requests[1].thread);
    assert_eq!(course.forge.threads(&course.project("g1")).len(), 1);
}

#[tokio::test]
async fn test_second_tag_on_same_commit_is_not_a_submission() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;

    course.push_tag("g1", "submission-again", commit, "same thing");
    let report = course.poll().await;
    assert!(report.group(LAB, "g1").unwrap().new_submissions.is_empty());
    assert_eq!(course.db.list_submissions(LAB, "g1").unwrap().len(), 1);
    assert!(course
        .db
        .seen_tags(LAB, "g1")
        .unwrap()
        .contains("submission-again"));
}

#[tokio::test]
async fn test_malformed_tag_is_reported_once() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "Submission-1", commit, "wrong case");

    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert!(outcome.new_submissions.is_empty());
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("Submission-1"));

    let again = course.poll().await;
    assert!(again.group(LAB, "g1").unwrap().is_quiet());
}

#[tokio::test]
async fn test_tag_outside_problem_lineage_is_held_back() {
    let course = Course::new(&["g1"]);
    let origin = course.origin("g1");
    let stray = common::commit_files(
        &origin,
        "refs/heads/scratch",
        None,
        &[("x", "y")],
        "unrelated",
    );
    course.push_tag("g1", "submission-1", stray, "oops");

    for expected_attempts in 1..=2 {
        let report = course.poll().await;
        let outcome = report.group(LAB, "g1").unwrap();
        assert_eq!(outcome.held_back, vec!["submission-1"]);
        assert!(outcome.new_submissions.is_empty());
        let held = course.db.list_held_tags(LAB).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].attempts, expected_attempts);
    }
    assert!(course.db.list_submissions(LAB, "g1").unwrap().is_empty());
}

#[tokio::test]
async fn test_later_tag_waits_for_earlier_held_tag() {
    let course = Course::new(&["g1"]);
    let origin = course.origin("g1");
    // The forge lists submission-a before its commit is fetchable.
    let early = common::commit_files(
        &origin,
        "refs/pending/a",
        Some(course.problem_base),
        &[("A.java", "a")],
        "first",
    );
    course
        .forge
        .add_tag(&course.project("g1"), "submission-a", &early.to_string(), None);
    let later = course.student_commit("g1", &[SOLVED], "second");
    course.push_tag("g1", "submission-b", later, "second try");

    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert!(outcome.new_submissions.is_empty());
    assert_eq!(outcome.held_back, vec!["submission-a", "submission-b"]);
    assert!(course.db.list_submissions(LAB, "g1").unwrap().is_empty());

    origin
        .reference("refs/tags/submission-a", early, false, "tag")
        .unwrap();
    let report = course.poll().await;
    assert_eq!(
        report.group(LAB, "g1").unwrap().new_submissions,
        vec!["submission-a", "submission-b"]
    );
    let recorded: Vec<(String, i64)> = course
        .db
        .list_submissions(LAB, "g1")
        .unwrap()
        .into_iter()
        .map(|s| (s.tag, s.sequence))
        .collect();
    assert_eq!(
        recorded,
        vec![("submission-a".to_string(), 1), ("submission-b".to_string(), 2)]
    );
}

#[tokio::test]
async fn test_held_tag_stops_blocking_once_warned() {
    let course = Course::new(&["g1"]);
    let origin = course.origin("g1");
    let stray = common::commit_files(
        &origin,
        "refs/heads/scratch",
        None,
        &[("x", "y")],
        "unrelated",
    );
    course.push_tag("g1", "submission-a", stray, "oops");
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-b", commit, "done");

    let first = course.poll().await;
    assert!(first.group(LAB, "g1").unwrap().new_submissions.is_empty());

    // lineage_warn_after_cycles = 2
    let second = course.poll().await;
    let outcome = second.group(LAB, "g1").unwrap();
    assert_eq!(outcome.new_submissions, vec!["submission-b"]);
    assert_eq!(outcome.held_back, vec!["submission-a"]);
}

#[tokio::test]
async fn test_group_filter_limits_the_cycle() {
    let course = Course::new(&["g1", "g2"]);
    for group in ["g1", "g2"] {
        let commit = course.student_commit(group, &[SOLVED], "Solve");
        course.push_tag(group, "submission-1", commit, "done");
    }

    let report = course
        .engine
        .run_cycle(&CycleFilter::group(LAB, "g2"), &AtomicBool::new(false))
        .await
        .unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].group_id, "g2");
    assert!(course.db.list_submissions(LAB, "g1").unwrap().is_empty());
    assert_eq!(course.db.list_submissions(LAB, "g2").unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_request_stops_before_next_group() {
    let course = Course::new(&["g1", "g2"]);
    let report = course
        .engine
        .run_cycle(&CycleFilter::all(), &AtomicBool::new(true))
        .await
        .unwrap();
    assert!(report.interrupted);
    assert!(report.groups.is_empty());
}

// ===========================================================================
// Grading
// ===========================================================================

#[tokio::test]
async fn test_grader_label_completes_and_history_only_grows() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;
    let request = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();
    let project = course.project("g1");

    course
        .forge
        .relabel(&project, &request.thread, "ta1", "waiting-for-grading", "grading")
        .unwrap();
    let report = course.poll().await;
    assert_eq!(
        report.group(LAB, "g1").unwrap().status_changes,
        vec![(request.id, GradingStatus::InProgress)]
    );

    course
        .forge
        .relabel(&project, &request.thread, "ta1", "grading", "complete")
        .unwrap();
    course.poll().await;

    let graded = course.db.get_grading_request(request.id).unwrap();
    assert_eq!(graded.status, GradingStatus::Complete);
    assert_eq!(graded.grader.as_deref(), Some("ta1"));
    let statuses: Vec<GradingStatus> = graded.history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            GradingStatus::AwaitingGrading,
            GradingStatus::InProgress,
            GradingStatus::Complete
        ]
    );
    assert!(graded.history.windows(2).all(|w| w[0].at <= w[1].at));

    // Resubmitting opens a new request; the graded one keeps its history.
    let fixed = course.student_commit("g1", &[("Bar.java", "class Bar {}")], "More");
    course.push_tag("g1", "submission-2", fixed, "again");
    course.poll().await;
    assert_eq!(
        course.db.get_grading_request(request.id).unwrap().history,
        graded.history
    );
    let latest = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();
    assert_ne!(latest.id, request.id);
    assert_eq!(latest.status, GradingStatus::AwaitingGrading);
    let thread = course.forge.thread(&project, &latest.thread).unwrap();
    assert_eq!(thread.labels, vec!["waiting-for-grading"]);
}

#[tokio::test]
async fn test_student_label_change_is_rejected_and_annotated_once() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;
    let request = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();
    let project = course.project("g1");

    course
        .forge
        .relabel(&project, &request.thread, "g1-alice", "waiting-for-grading", "complete")
        .unwrap();
    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert!(outcome.status_changes.is_empty());
    assert_eq!(outcome.warnings.len(), 1);

    let after = course.db.get_grading_request(request.id).unwrap();
    assert_eq!(after.status, GradingStatus::AwaitingGrading);
    assert_eq!(after.history.len(), 1);

    let notes = course.forge.thread(&project, &request.thread).unwrap().notes;
    assert_eq!(notes.len(), 2);
    assert!(notes[1].contains("@g1-alice"));

    course.poll().await;
    let notes = course.forge.thread(&project, &request.thread).unwrap().notes;
    assert_eq!(notes.len(), 2);
}

#[tokio::test]
async fn test_system_user_label_change_is_ignored() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;
    let request = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();

    course
        .forge
        .add_label(&course.project("g1"), &request.thread, "ci-bot", "pipeline-passed")
        .unwrap();
    let report = course.poll().await;
    assert!(report.group(LAB, "g1").unwrap().is_quiet());
    assert_eq!(
        course.db.get_grading_request(request.id).unwrap().status,
        GradingStatus::AwaitingGrading
    );
}

#[tokio::test]
async fn test_resubmission_waits_for_review_in_progress() {
    let course = Course::new(&["g1"]);
    let project = course.project("g1");
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;
    let first = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();

    // The grader starts reviewing and the students resubmit before the
    // next poll: the review is seen first, so the new tag waits.
    course
        .forge
        .relabel(&project, &first.thread, "ta2", "waiting-for-grading", "grading")
        .unwrap();
    let again = course.student_commit("g1", &[("Bar.java", "class Bar {}")], "More");
    course.push_tag("g1", "submission-2", again, "one more thing");

    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert_eq!(outcome.new_submissions, vec!["submission-2"]);
    assert_eq!(outcome.status_changes, vec![(first.id, GradingStatus::InProgress)]);
    assert_eq!(outcome.deferred.len(), 1);
    assert_eq!(course.forge.thread(&project, &first.thread).unwrap().labels, vec!["grading"]);

    let report = course.poll().await;
    assert_eq!(report.group(LAB, "g1").unwrap().deferred.len(), 1);

    course
        .forge
        .relabel(&project, &first.thread, "ta2", "grading", "incomplete")
        .unwrap();
    let report = course.poll().await;
    let outcome = report.group(LAB, "g1").unwrap();
    assert_eq!(outcome.status_changes, vec![(first.id, GradingStatus::Incomplete)]);
    assert_eq!(outcome.registered.len(), 1);

    let latest = course.db.latest_grading_request(LAB, "g1").unwrap().unwrap();
    assert_eq!(latest.status, GradingStatus::AwaitingGrading);
    assert_eq!(
        course.db.get_grading_request(first.id).unwrap().status,
        GradingStatus::Incomplete
    );
}

#[tokio::test]
async fn test_roster_change_updates_thread_description() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");
    course.poll().await;

    std::fs::write(
        course.root().join("roster.toml"),
        "[[groups]]\nid = \"g1\"\nmembers = [\"g1-alice\", \"g1-bob\", \"g1-carol\"]\n",
    )
    .unwrap();
    course.poll().await;

    let thread = &course.forge.threads(&course.project("g1"))[0];
    assert!(thread.description.contains("@g1-carol"));
    let group = course.db.get_group(LAB, "g1").unwrap().unwrap();
    assert_eq!(group.members.len(), 3);
}

#[tokio::test]
async fn test_merge_request_mode_publishes_submission_branch() {
    let course = Course::with_mode(&["g1"], "merge_request");
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");

    let report = course.poll().await;
    assert_eq!(report.group(LAB, "g1").unwrap().registered.len(), 1);
    assert_eq!(course.head("g1", "grading-submission"), commit);

    let threads = course.forge.threads(&course.project("g1"));
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].kind, ThreadKind::MergeRequest);
    assert_eq!(threads[0].source_branch, "grading-submission");
    assert_eq!(threads[0].target_branch, "problem");
}

#[tokio::test]
async fn test_missing_project_fails_only_that_group() {
    let course = Course::new(&["g1"]);
    std::fs::write(
        course.root().join("roster.toml"),
        "[[groups]]\nid = \"a-ghost\"\n\n[[groups]]\nid = \"g1\"\nmembers = [\"g1-alice\"]\n",
    )
    .unwrap();
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");

    let report = course.poll().await;
    assert_eq!(report.failed_groups(), 1);
    assert!(report.group(LAB, "a-ghost").unwrap().error.is_some());
    assert_eq!(
        report.group(LAB, "g1").unwrap().new_submissions,
        vec!["submission-1"]
    );
}

#[tokio::test]
async fn test_forge_outage_aborts_cycle_until_it_recovers() {
    let course = Course::new(&["g1"]);
    let commit = course.student_commit("g1", &[SOLVED], "Solve");
    course.push_tag("g1", "submission-1", commit, "done");

    course.forge.fail_next(1);
    let failed = course
        .engine
        .run_cycle(&CycleFilter::all(), &AtomicBool::new(false))
        .await;
    assert!(failed.is_err());
    assert!(course.db.list_submissions(LAB, "g1").unwrap().is_empty());

    let report = course.poll().await;
    assert_eq!(
        report.group(LAB, "g1").unwrap().new_submissions,
        vec!["submission-1"]
    );
}
