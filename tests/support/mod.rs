use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sparsebcd_rs::config::{LearnerConfig, LearnerSection, SchedulerConfig, ServerConfig};
use sparsebcd_rs::FeatureId;

/// Ids that only occur in positive rows.
pub const POSITIVE_IDS: [FeatureId; 8] = [1_048_577, 2_097_169, 3_145_761, 4_194_353, 5_242_945, 6_291_537, 7_340_129, 8_388_721];
/// Ids that only occur in negative rows.
pub const NEGATIVE_IDS: [FeatureId; 8] = [9_437_203, 10_485_795, 11_534_387, 12_582_979, 13_631_571, 14_680_163, 15_728_755, 16_777_347];

/// Write a linearly separable libsvm file: every row carries two ids of its
/// class plus three shared noise ids.
#[allow(dead_code)]
pub fn write_dataset(dir: &Path, name: &str, rows: usize, seed: u64) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = String::new();
    for _ in 0..rows {
        let positive = rng.random_bool(0.5);
        let (label, ids) = if positive {
            ("1", &POSITIVE_IDS)
        } else {
            ("-1", &NEGATIVE_IDS)
        };
        out.push_str(label);
        for _ in 0..2 {
            let id = ids[rng.random_range(0..ids.len())];
            write!(out, " {id}:1").unwrap();
        }
        for _ in 0..3 {
            let noise: FeatureId = 100 + rng.random_range(0..40u64);
            write!(out, " {noise}").unwrap();
        }
        out.push('\n');
    }
    let path = dir.join(name);
    fs::write(&path, out).unwrap();
    path
}

#[allow(dead_code)]
pub fn test_config(train: &Path, val: Option<&Path>, workers: usize, sync_mode: bool) -> LearnerConfig {
    LearnerConfig {
        learner: LearnerSection {
            data_in: train.display().to_string(),
            data_val: val.map(|v| v.display().to_string()),
            max_num_epochs: 3,
            num_feature_group_bits: 4,
            tail_feature_filter: 1.0,
            chunk_bytes: 4096,
            ..LearnerSection::default()
        },
        server: ServerConfig {
            sync_mode,
            num_workers: workers,
            learning_rate: 5.0,
            ..ServerConfig::default()
        },
        scheduler: SchedulerConfig {
            job_timeout_secs: Some(120),
            ..SchedulerConfig::default()
        },
    }
}
