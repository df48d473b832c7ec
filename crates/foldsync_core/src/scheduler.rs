//! Background task scheduling.
//!
//! The engine's periodic work (flush, pack, snapshot, recovery, activity
//! poll) is described by [`TaskKind`]s with an interval each. A
//! [`TaskScheduler`] decides which tasks are due at a given time, so tests
//! drive it step by step with a manual clock; [`BackgroundTasks`] runs the
//! same schedule on a thread until cancelled.

use crate::clock::{millis, Clock};
use crate::config::Config;
use crate::error::CoreResult;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A kind of periodic work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    /// Write buffered updates whose flush policy says so.
    Flush,
    /// Pack own update files.
    Pack,
    /// Write snapshots and collect garbage.
    Snapshot,
    /// Resume interrupted moves.
    Recovery,
    /// Read other instances' activity logs.
    ActivityPoll,
}

impl TaskKind {
    /// Every task kind, in execution order within one tick.
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Flush,
        TaskKind::ActivityPoll,
        TaskKind::Pack,
        TaskKind::Snapshot,
        TaskKind::Recovery,
    ];

    /// Short name used in logs and the CLI.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::Flush => "flush",
            TaskKind::Pack => "pack",
            TaskKind::Snapshot => "snapshot",
            TaskKind::Recovery => "recovery",
            TaskKind::ActivityPoll => "activity-poll",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something that performs scheduled tasks.
pub trait TaskRunner: Send + Sync + 'static {
    /// Performs one task.
    fn run_task(&self, kind: TaskKind) -> CoreResult<()>;
}

/// Cooperative cancellation flag shared with a running task loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Intervals and last-run times of every task.
#[derive(Debug)]
pub struct TaskScheduler {
    intervals: BTreeMap<TaskKind, u64>,
    last_run: Mutex<BTreeMap<TaskKind, Timestamp>>,
}

impl TaskScheduler {
    /// A schedule with the intervals from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new([
            (TaskKind::Flush, config.flush_interval),
            (TaskKind::Pack, config.pack_interval),
            (TaskKind::Snapshot, config.snapshot_interval),
            (TaskKind::Recovery, config.recovery_interval),
            (TaskKind::ActivityPoll, config.activity_poll_interval),
        ])
    }

    /// A schedule with explicit intervals. Kinds not listed never run.
    #[must_use]
    pub fn new(intervals: impl IntoIterator<Item = (TaskKind, Duration)>) -> Self {
        Self {
            intervals: intervals
                .into_iter()
                .map(|(kind, interval)| (kind, millis(interval)))
                .collect(),
            last_run: Mutex::new(BTreeMap::new()),
        }
    }

    /// Interval of a task, if scheduled.
    #[must_use]
    pub fn interval(&self, kind: TaskKind) -> Option<Duration> {
        self.intervals
            .get(&kind)
            .map(|&ms| Duration::from_millis(ms))
    }

    /// Tasks due at `now`. A task that never ran is due immediately.
    #[must_use]
    pub fn due(&self, now: Timestamp) -> Vec<TaskKind> {
        let last_run = self.last_run.lock();
        TaskKind::ALL
            .into_iter()
            .filter(|kind| match (self.intervals.get(kind), last_run.get(kind)) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(&interval), Some(&last)) => now.saturating_sub(last) >= interval,
            })
            .collect()
    }

    /// Records that a task ran at `now`.
    pub fn mark_run(&self, kind: TaskKind, now: Timestamp) {
        self.last_run.lock().insert(kind, now);
    }

    /// Runs every task due at `now` and returns the kinds that ran.
    ///
    /// A failing task is logged and still counts as run, so one broken root
    /// cannot turn the loop into a busy retry.
    pub fn tick<R: TaskRunner + ?Sized>(&self, runner: &R, now: Timestamp) -> Vec<TaskKind> {
        let due = self.due(now);
        for &kind in &due {
            if let Err(err) = runner.run_task(kind) {
                tracing::warn!(task = %kind, error = %err, "background task failed");
            }
            self.mark_run(kind, now);
        }
        due
    }

    fn shortest_interval(&self) -> Duration {
        self.intervals
            .values()
            .min()
            .map_or(Duration::from_secs(1), |&ms| Duration::from_millis(ms.max(10)))
    }
}

/// A task loop running on its own thread.
#[derive(Debug)]
pub struct BackgroundTasks {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Starts a thread that ticks `scheduler` until the token is cancelled.
    pub fn spawn<R: TaskRunner>(
        runner: Arc<R>,
        scheduler: TaskScheduler,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let token = CancelToken::new();
        let loop_token = token.clone();
        let pause = scheduler.shortest_interval();
        let handle = thread::Builder::new()
            .name("foldsync-tasks".into())
            .spawn(move || {
                tracing::debug!("background tasks started");
                while !loop_token.is_cancelled() {
                    scheduler.tick(runner.as_ref(), clock.now());
                    thread::park_timeout(pause);
                }
                tracing::debug!("background tasks stopped");
            })?;
        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    /// The token that stops the loop.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Cancels the loop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("background task thread panicked");
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CoreError;

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<TaskKind>>,
    }

    impl TaskRunner for Recorder {
        fn run_task(&self, kind: TaskKind) -> CoreResult<()> {
            self.ran.lock().push(kind);
            if kind == TaskKind::Pack {
                return Err(CoreError::invalid_operation("pack failed"));
            }
            Ok(())
        }
    }

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new([
            (TaskKind::Flush, Duration::from_millis(100)),
            (TaskKind::Pack, Duration::from_secs(10)),
        ])
    }

    #[test]
    fn due_respects_intervals() {
        let scheduler = scheduler();
        assert_eq!(scheduler.due(0), vec![TaskKind::Flush, TaskKind::Pack]);
        scheduler.mark_run(TaskKind::Flush, 0);
        scheduler.mark_run(TaskKind::Pack, 0);
        assert!(scheduler.due(50).is_empty());
        assert_eq!(scheduler.due(100), vec![TaskKind::Flush]);
        assert_eq!(scheduler.due(10_000).len(), 2);
    }

    #[test]
    fn tick_runs_due_tasks_and_survives_failures() {
        let scheduler = scheduler();
        let runner = Recorder::default();
        assert_eq!(scheduler.tick(&runner, 0).len(), 2);
        assert!(scheduler.tick(&runner, 10).is_empty());
        assert_eq!(scheduler.tick(&runner, 200), vec![TaskKind::Flush]);
        assert_eq!(runner.ran.lock().len(), 3);
    }

    #[test]
    fn intervals_come_from_config() {
        let config = Config::default();
        let scheduler = TaskScheduler::from_config(&config);
        assert_eq!(
            scheduler.interval(TaskKind::Pack),
            Some(config.pack_interval)
        );
    }

    #[test]
    fn background_loop_stops_on_cancel() {
        let runner = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::new(0));
        let tasks = BackgroundTasks::spawn(runner.clone(), scheduler(), clock).unwrap();
        let start = std::time::Instant::now();
        while runner.ran.lock().is_empty() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        tasks.stop();
        assert!(!runner.ran.lock().is_empty());
    }
}
