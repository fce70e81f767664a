//! Poll scheduler that runs poll cycles on a configurable interval and
//! supports webhook-triggered targeted polls.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{error, info, warn};

use labsync_core::errors::EngineError;
use labsync_core::models::CycleReport;
use labsync_core::{CycleFilter, PollEngine};
use labsync_web::PollTrigger;

/// Tracks aggregate statistics across poll cycles.
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub total_submissions: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            total_cycles: AtomicU64::new(0),
            total_submissions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
        }
    }
}

/// The poll scheduler.
///
/// Runs full cycles over the configured labs on a timer and targeted cycles
/// for webhook triggers. A failed cycle, fatal or not, is logged and the
/// next period runs as usual.
pub struct Scheduler {
    engine: Arc<PollEngine>,
    poll_interval: Duration,
    /// Labs polled by scheduled cycles; empty means all enabled labs.
    labs: Vec<String>,
    trigger_rx: mpsc::Receiver<PollTrigger>,
    stop: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<PollEngine>,
        poll_interval: Duration,
        labs: Vec<String>,
        trigger_rx: mpsc::Receiver<PollTrigger>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            poll_interval,
            labs,
            trigger_rx,
            stop,
            stats: Arc::new(SchedulerStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Main scheduler loop. Returns once `shutdown` is notified or the stop
    /// flag is seen between cycles.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            labs = ?self.labs,
            "scheduler started"
        );

        // The first tick fires immediately, so the daemon polls right after
        // startup.
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    let filter = CycleFilter::labs(self.labs.clone());
                    self.run_cycle(&filter, "scheduled").await;
                }
                Some(trigger) = self.trigger_rx.recv() => {
                    if !self.labs.is_empty() && !self.labs.contains(&trigger.lab) {
                        info!(
                            lab = %trigger.lab,
                            "ignoring trigger for a lab this daemon does not poll"
                        );
                        continue;
                    }
                    info!(
                        lab = %trigger.lab,
                        group = ?trigger.group,
                        "targeted poll requested via webhook"
                    );
                    self.run_cycle(&trigger.filter(), "webhook").await;
                }
            }
        }

        info!(
            cycles = self.stats.total_cycles.load(Ordering::SeqCst),
            "scheduler stopped"
        );
    }

    async fn run_cycle(&self, filter: &CycleFilter, trigger: &str) {
        let cycle_num = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle = cycle_num, trigger, "starting poll cycle");

        match self.engine.run_cycle(filter, &self.stop).await {
            Ok(report) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                self.stats
                    .total_submissions
                    .fetch_add(report.new_submissions() as u64, Ordering::SeqCst);
                log_report(cycle_num, &report);
            }
            Err(EngineError::AlreadyRunning) => {
                warn!(
                    cycle = cycle_num,
                    trigger,
                    "skipping poll cycle: previous cycle still running"
                );
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    cycle = cycle_num,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "poll cycle failed"
                );
            }
        }
    }
}

fn log_report(cycle: u64, report: &CycleReport) {
    for group in report.groups.iter().filter(|g| !g.is_quiet()) {
        if let Some(ref err) = group.error {
            warn!(lab = %group.lab_id, group = %group.group_id, error = %err, "group skipped");
            continue;
        }
        for warning in &group.warnings {
            warn!(lab = %group.lab_id, group = %group.group_id, "{}", warning);
        }
        for (request, status) in &group.status_changes {
            info!(
                lab = %group.lab_id,
                group = %group.group_id,
                request,
                %status,
                "grading status changed"
            );
        }
        if !group.new_submissions.is_empty() || !group.registered.is_empty() {
            info!(
                lab = %group.lab_id,
                group = %group.group_id,
                new = ?group.new_submissions,
                registered = group.registered.len(),
                deferred = group.deferred.len(),
                "submissions processed"
            );
        }
    }

    info!(
        cycle,
        groups = report.groups.len(),
        new_submissions = report.new_submissions(),
        failed_groups = report.failed_groups(),
        interrupted = report.interrupted,
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "poll cycle completed"
    );
}
