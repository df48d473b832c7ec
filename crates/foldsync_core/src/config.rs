//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// When buffered local updates are written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every update is written as soon as it is appended.
    Immediate,
    /// Flush once this many updates are buffered for a document.
    UpdateCount(usize),
    /// Flush once a document has been idle for this long.
    Idle(Duration),
}

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance-local state directory (index, counters, cursors).
    pub state_dir: PathBuf,

    /// Directory of the move record store. Defaults to `<state_dir>/moves`.
    ///
    /// Several processes on one machine may point at the same directory.
    pub move_store_dir: Option<PathBuf>,

    /// Flush policy for local updates.
    pub flush_policy: FlushPolicy,

    /// Update files younger than this are never packed.
    pub pack_min_age: Duration,

    /// Minimum number of contiguous updates worth one pack.
    pub pack_min_run: usize,

    /// Whether packs and snapshots are written LZ4-compressed.
    pub compress: bool,

    /// Changes since the newest snapshot that trigger a new one.
    pub snapshot_threshold: u64,

    /// A foreign move untouched for this long is surfaced as stuck.
    pub stale_after: Duration,

    /// Terminal move records are kept this long, then removed.
    pub move_retention: Duration,

    /// Failed index transactions allowed before a move is rolled back.
    pub max_move_attempts: u32,

    /// How often buffered updates are checked against the flush policy.
    pub flush_interval: Duration,

    /// How often own update files are packed.
    pub pack_interval: Duration,

    /// How often snapshots and garbage collection run.
    pub snapshot_interval: Duration,

    /// How often the recovery coordinator scans move records.
    pub recovery_interval: Duration,

    /// How often other instances' activity logs are polled.
    pub activity_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foldsync"),
            move_store_dir: None,
            flush_policy: FlushPolicy::Idle(Duration::from_secs(2)),
            pack_min_age: Duration::from_secs(60),
            pack_min_run: 10,
            compress: true,
            snapshot_threshold: 100,
            stale_after: Duration::from_secs(5 * 60),
            move_retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_move_attempts: 3,
            flush_interval: Duration::from_millis(500),
            pack_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(5 * 60),
            recovery_interval: Duration::from_secs(5 * 60),
            activity_poll_interval: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Creates a configuration with default values and the given state
    /// directory.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the move record store directory.
    #[must_use]
    pub fn move_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.move_store_dir = Some(dir.into());
        self
    }

    /// Resolved move record store directory.
    #[must_use]
    pub fn resolved_move_store_dir(&self) -> PathBuf {
        self.move_store_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("moves"))
    }

    /// Sets the flush policy.
    #[must_use]
    pub const fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    /// Sets the minimum age of packable update files.
    #[must_use]
    pub const fn pack_min_age(mut self, age: Duration) -> Self {
        self.pack_min_age = age;
        self
    }

    /// Sets the minimum pack run length.
    #[must_use]
    pub const fn pack_min_run(mut self, run: usize) -> Self {
        self.pack_min_run = run;
        self
    }

    /// Sets whether packs and snapshots are compressed.
    #[must_use]
    pub const fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    /// Sets the snapshot threshold.
    #[must_use]
    pub const fn snapshot_threshold(mut self, changes: u64) -> Self {
        self.snapshot_threshold = changes;
        self
    }

    /// Sets the staleness window for foreign moves.
    #[must_use]
    pub const fn stale_after(mut self, window: Duration) -> Self {
        self.stale_after = window;
        self
    }

    /// Sets how long terminal move records are retained.
    #[must_use]
    pub const fn move_retention(mut self, retention: Duration) -> Self {
        self.move_retention = retention;
        self
    }

    /// Sets the number of index transaction attempts per move.
    #[must_use]
    pub const fn max_move_attempts(mut self, attempts: u32) -> Self {
        self.max_move_attempts = attempts;
        self
    }

    /// Sets the activity poll interval.
    #[must_use]
    pub const fn activity_poll_interval(mut self, interval: Duration) -> Self {
        self.activity_poll_interval = interval;
        self
    }

    /// Sets the pack and snapshot intervals.
    #[must_use]
    pub const fn consolidation_intervals(mut self, pack: Duration, snapshot: Duration) -> Self {
        self.pack_interval = pack;
        self.snapshot_interval = snapshot;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.pack_min_run, 10);
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert!(config.compress);
        assert_eq!(
            config.resolved_move_store_dir(),
            PathBuf::from(".foldsync/moves")
        );
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new("/tmp/state")
            .flush_policy(FlushPolicy::Immediate)
            .pack_min_run(3)
            .compress(false)
            .move_store_dir("/tmp/shared-moves");

        assert_eq!(config.flush_policy, FlushPolicy::Immediate);
        assert_eq!(config.pack_min_run, 3);
        assert!(!config.compress);
        assert_eq!(
            config.resolved_move_store_dir(),
            PathBuf::from("/tmp/shared-moves")
        );
    }
}
