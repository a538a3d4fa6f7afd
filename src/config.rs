use std::path::PathBuf;
use std::time::Duration;

/// Whether a runtime-priority write may be rejected with `Blocked` while the
/// undumped backlog exceeds the hard cap, or is always admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    BlockRuntime,
    NonblockRuntime,
}

/// Configuration for the leveled profile store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the level files
    pub dir: PathBuf,

    /// File-name prefix for level files (default: "profiles")
    pub prefix: String,

    /// Backpressure behavior for runtime-priority writes (default: NonblockRuntime)
    pub mode: RuntimeMode,

    /// Read-buffer size for streaming level scans (default: 1MB)
    pub rw_buffer_size: usize,

    /// Maximum area of the mutable in-memory level before it is exchanged (default: 64MB)
    pub rwlevel_max_size: u64,

    /// Maximum undumped bytes (mutable + frozen levels) before a dump is urged (default: 128MB)
    pub max_undumped_size: u64,

    /// Maximum number of on-disk level-0 dumps before a merge is triggered (default: 4)
    pub max_levels0: usize,

    /// Entries untouched for longer than this are eligible for expiration (default: none)
    pub expire_time: Option<Duration>,

    /// Force an exchange+dump after this long without one (default: 60s)
    pub max_dump_period: Duration,

    /// How often the dump task checks its thresholds (default: 1s)
    pub dump_check_interval: Duration,

    /// How often the merge task checks merge-worthiness (default: 10s)
    pub merge_interval: Duration,

    /// How often the expiration task refreshes the threshold (default: 60s)
    pub expire_check_interval: Duration,

    /// Merge policy configuration
    pub merge: MergeConfig,
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Minimum number of on-disk levels before a ratio-triggered merge runs (default: 2)
    pub min_merge_levels: usize,

    /// Merge when reclaimable bytes reach this fraction of the total on-disk
    /// area (default: 0.3)
    pub merge_free_ratio: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_merge_levels: 2,
            merge_free_ratio: 0.3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./profiledb"),
            prefix: "profiles".to_string(),
            mode: RuntimeMode::NonblockRuntime,
            rw_buffer_size: 1024 * 1024,                // 1MB
            rwlevel_max_size: 64 * 1024 * 1024,         // 64MB
            max_undumped_size: 128 * 1024 * 1024,       // 128MB
            max_levels0: 4,
            expire_time: None,
            max_dump_period: Duration::from_secs(60),
            dump_check_interval: Duration::from_secs(1),
            merge_interval: Duration::from_secs(10),
            expire_check_interval: Duration::from_secs(60),
            merge: MergeConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn rw_buffer_size(mut self, size: usize) -> Self {
        self.rw_buffer_size = size;
        self
    }

    pub fn rwlevel_max_size(mut self, size: u64) -> Self {
        self.rwlevel_max_size = size;
        self
    }

    pub fn max_undumped_size(mut self, size: u64) -> Self {
        self.max_undumped_size = size;
        self
    }

    pub fn max_levels0(mut self, count: usize) -> Self {
        self.max_levels0 = count;
        self
    }

    pub fn expire_time(mut self, expire: Duration) -> Self {
        self.expire_time = Some(expire);
        self
    }

    pub fn max_dump_period(mut self, period: Duration) -> Self {
        self.max_dump_period = period;
        self
    }

    pub fn dump_check_interval(mut self, interval: Duration) -> Self {
        self.dump_check_interval = interval;
        self
    }

    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    pub fn expire_check_interval(mut self, interval: Duration) -> Self {
        self.expire_check_interval = interval;
        self
    }

    pub fn merge(mut self, config: MergeConfig) -> Self {
        self.merge = config;
        self
    }

    /// Hard cap on undumped bytes past which NonblockRuntime mode starts
    /// returning `Blocked` to runtime-priority writers.
    pub fn undumped_hard_cap(&self) -> u64 {
        self.max_undumped_size.saturating_mul(2)
    }
}

impl MergeConfig {
    pub fn min_merge_levels(mut self, count: usize) -> Self {
        self.min_merge_levels = count.max(2);
        self
    }

    pub fn merge_free_ratio(mut self, ratio: f64) -> Self {
        self.merge_free_ratio = ratio;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.dir, PathBuf::from("./profiledb"));
        assert_eq!(config.prefix, "profiles");
        assert_eq!(config.mode, RuntimeMode::NonblockRuntime);
        assert_eq!(config.rwlevel_max_size, 64 * 1024 * 1024);
        assert_eq!(config.max_undumped_size, 128 * 1024 * 1024);
        assert_eq!(config.max_levels0, 4);
        assert!(config.expire_time.is_none());

        assert_eq!(config.merge.min_merge_levels, 2);
        assert!((config.merge.merge_free_ratio - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_builder() {
        let config = StorageConfig::new("/tmp/profiles")
            .prefix("sessions")
            .mode(RuntimeMode::BlockRuntime)
            .rw_buffer_size(256 * 1024)
            .rwlevel_max_size(8 * 1024 * 1024)
            .max_undumped_size(16 * 1024 * 1024)
            .max_levels0(2)
            .expire_time(Duration::from_secs(3600))
            .max_dump_period(Duration::from_secs(5))
            .merge_interval(Duration::from_secs(2))
            .merge(MergeConfig::default().min_merge_levels(3).merge_free_ratio(0.5));

        assert_eq!(config.dir, PathBuf::from("/tmp/profiles"));
        assert_eq!(config.prefix, "sessions");
        assert_eq!(config.mode, RuntimeMode::BlockRuntime);
        assert_eq!(config.rw_buffer_size, 256 * 1024);
        assert_eq!(config.rwlevel_max_size, 8 * 1024 * 1024);
        assert_eq!(config.max_levels0, 2);
        assert_eq!(config.expire_time, Some(Duration::from_secs(3600)));
        assert_eq!(config.max_dump_period, Duration::from_secs(5));
        assert_eq!(config.merge_interval, Duration::from_secs(2));
        assert_eq!(config.merge.min_merge_levels, 3);
        assert!((config.merge.merge_free_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_undumped_hard_cap() {
        let config = StorageConfig::default().max_undumped_size(100);
        assert_eq!(config.undumped_hard_cap(), 200);
    }

    #[test]
    fn test_min_merge_levels_floor() {
        let merge = MergeConfig::default().min_merge_levels(0);
        assert_eq!(merge.min_merge_levels, 2);
    }
}
