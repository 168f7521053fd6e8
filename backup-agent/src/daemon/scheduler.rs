//! Triggers backup runs on an interval or a cron expression.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period between runs, first run one period after start
    Interval(Duration),
    /// Six-field cron expression (seconds first)
    Cron(String),
}

/// Work performed on every trigger.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);
}

/// Runs the task at most once at a time.
#[derive(Clone)]
pub struct JobRunner {
    task: Arc<dyn ScheduledTask>,
    busy: Arc<Mutex<()>>,
}

impl JobRunner {
    pub fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Run the task unless a run is already in flight. Returns whether it ran.
    pub async fn trigger(&self, source: &'static str) -> bool {
        let Ok(_guard) = self.busy.try_lock() else {
            warn!(trigger = source, "Previous backup still running, skipping this trigger");
            return false;
        };
        info!(trigger = source, "Backup triggered");
        self.task.run().await;
        true
    }

    /// Wait for an in-flight run to finish.
    pub async fn wait_idle(&self) {
        let _guard = self.busy.lock().await;
    }
}

pub struct Scheduler {
    schedule: Schedule,
    run_on_start: bool,
    runner: JobRunner,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        schedule: Schedule,
        run_on_start: bool,
        task: Arc<dyn ScheduledTask>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            schedule,
            run_on_start,
            runner: JobRunner::new(task),
            cancel,
        }
    }

    /// Trigger runs until cancelled, then wait for the current run to finish.
    pub async fn run(self) -> anyhow::Result<()> {
        if self.run_on_start && !self.cancel.is_cancelled() {
            self.runner.trigger("startup").await;
        }

        let result = match &self.schedule {
            Schedule::Interval(period) => {
                self.run_interval(*period).await;
                Ok(())
            }
            Schedule::Cron(expression) => self.run_cron(expression).await,
        };

        self.runner.wait_idle().await;
        info!("Scheduler stopped");
        result
    }

    async fn run_interval(&self, period: Duration) {
        info!(period = %humantime::format_duration(period), "Interval schedule started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.runner.trigger("interval").await;
                }
            }
        }
    }

    async fn run_cron(&self, expression: &str) -> anyhow::Result<()> {
        let mut scheduler = JobScheduler::new().await?;
        let runner = self.runner.clone();

        let job = Job::new_async(expression, move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.trigger("cron").await;
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        info!(cron = %expression, "Cron schedule started");

        self.cancel.cancelled().await;
        scheduler.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledTask for Counter {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Blocking {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ScheduledTask for Blocking {
        async fn run(&self) {
            self.started.notify_one();
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let task = Arc::new(Blocking {
            started: Notify::new(),
            release: Notify::new(),
        });
        let runner = JobRunner::new(task.clone());

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.trigger("first").await }
        });
        task.started.notified().await;

        assert!(!runner.trigger("second").await);

        task.release.notify_one();
        assert!(first.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_schedule_runs_each_period() {
        let task = Arc::new(Counter::default());
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            Schedule::Interval(Duration::from_secs(3600)),
            false,
            task.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(3 * 3600 + 1800)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_start() {
        let task = Arc::new(Counter::default());
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            Schedule::Interval(Duration::from_secs(3600)),
            true,
            task.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_cron_expression_is_an_error() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            Schedule::Cron("not a cron".into()),
            false,
            Arc::new(Counter::default()),
            cancel,
        );
        assert!(scheduler.run().await.is_err());
    }
}
