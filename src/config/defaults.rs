//! Default constants for sparsebcd configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Learner Defaults
// =============================================================================

/// Default number of training epochs
pub const DEFAULT_MAX_NUM_EPOCHS: usize = 10;

/// Default number of feature-group bits (one feature block)
pub const DEFAULT_NUM_FEATURE_GROUP_BITS: u32 = 0;

/// Largest supported number of feature-group bits
pub const MAX_FEATURE_GROUP_BITS: u32 = 16;

/// Features seen at most this many times are dropped before training
pub const DEFAULT_TAIL_FEATURE_FILTER: f32 = 4.0;

/// Upper bound on the raw bytes read into one shard (256 MiB)
pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024 * 1024;

/// Default file name for model dumps
pub const DEFAULT_NAME_DUMP: &str = "dump.txt";

// =============================================================================
// Parameter Server Defaults
// =============================================================================

/// Default number of workers
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get().min(8))
        .unwrap_or(2)
}

/// Default SGD step size
pub const DEFAULT_LEARNING_RATE: f32 = 0.1;

/// Default L2 penalty
pub const DEFAULT_L2: f32 = 0.0;

// =============================================================================
// Scheduler Defaults
// =============================================================================

/// Default number of retries of a failed job before the run aborts
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 0;

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "SPARSEBCD_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        assert!(default_num_workers() >= 1);
        assert_eq!(DEFAULT_NUM_FEATURE_GROUP_BITS % 4, 0);
        assert!(DEFAULT_CHUNK_BYTES > 0);
    }
}
