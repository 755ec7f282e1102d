//! Pool usage accounting and the end-of-run report.

use crate::agent::AgentKey;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

/// Counters the pool maintains under its own lock.
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    created: u32,
    reused: u32,
    work_dirs: HashSet<PathBuf>,
    runtime_images: HashSet<PathBuf>,
    option_sets: HashSet<Vec<String>>,
    reuse_by_id: BTreeMap<u32, u32>,
    pool_sizes: Vec<usize>,
}

impl PoolStats {
    pub fn record_creation(&mut self, id: u32, key: &AgentKey) {
        self.created += 1;
        self.reuse_by_id.insert(id, 0);
        self.note_key(key);
    }

    pub fn record_reuse(&mut self, id: u32, key: &AgentKey) {
        self.reused += 1;
        *self.reuse_by_id.entry(id).or_insert(0) += 1;
        self.note_key(key);
    }

    /// Idle-pool size after a save, sampled for the report statistics.
    pub fn record_pool_size(&mut self, size: usize) {
        self.pool_sizes.push(size);
    }

    fn note_key(&mut self, key: &AgentKey) {
        self.work_dirs.insert(key.work_dir.clone());
        self.runtime_images.insert(key.runtime_image.clone());
        self.option_sets.insert(key.options.clone());
    }

    pub fn report(&self, run_id: &str) -> PoolReport {
        let reuse: Vec<f64> = self.reuse_by_id.values().map(|&n| f64::from(n)).collect();
        let sizes: Vec<f64> = self.pool_sizes.iter().map(|&n| n as f64).collect();
        let (reuse_mean, reuse_stddev) = mean_stddev(&reuse);
        let (pool_size_mean, pool_size_stddev) = mean_stddev(&sizes);
        PoolReport {
            run_id: run_id.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            created: self.created,
            reused: self.reused,
            distinct_work_dirs: self.work_dirs.len(),
            distinct_runtime_images: self.runtime_images.len(),
            distinct_option_sets: self.option_sets.len(),
            reuse_counts: self.reuse_by_id.clone(),
            reuse_mean,
            reuse_stddev,
            pool_size_mean,
            pool_size_stddev,
        }
    }
}

/// What a run's pooling looked like: how many channels existed, how much
/// reuse they saw, and how large the idle pool ran.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub run_id: String,
    pub generated_at: String,
    pub created: u32,
    pub reused: u32,
    pub distinct_work_dirs: usize,
    pub distinct_runtime_images: usize,
    pub distinct_option_sets: usize,
    /// Reuse count per channel id.
    pub reuse_counts: BTreeMap<u32, u32>,
    pub reuse_mean: f64,
    pub reuse_stddev: f64,
    pub pool_size_mean: f64,
    pub pool_size_stddev: f64,
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "agent pool usage ({}):", self.run_id)?;
        writeln!(
            f,
            "  channels created: {}, reuses: {}",
            self.created, self.reused
        )?;
        writeln!(
            f,
            "  distinct work dirs: {}, runtime images: {}, option sets: {}",
            self.distinct_work_dirs, self.distinct_runtime_images, self.distinct_option_sets
        )?;
        writeln!(
            f,
            "  reuse per channel: mean {:.2}, stddev {:.2}",
            self.reuse_mean, self.reuse_stddev
        )?;
        write!(
            f,
            "  idle pool size: mean {:.2}, stddev {:.2}",
            self.pool_size_mean, self.pool_size_stddev
        )?;
        for (id, count) in &self.reuse_counts {
            write!(f, "\n    channel #{id}: {count} reuse(s)")?;
        }
        Ok(())
    }
}

/// Population mean and standard deviation; zeros for an empty sample.
fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dir: &str) -> AgentKey {
        AgentKey::new(dir, "/opt/runtime", Vec::new())
    }

    #[test]
    fn test_mean_stddev_empty_and_single() {
        assert_eq!(mean_stddev(&[]), (0.0, 0.0));
        let (mean, stddev) = mean_stddev(&[5.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(stddev, 0.0);
    }

    #[test]
    fn test_mean_stddev_known_population() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let (mean, stddev) = mean_stddev(&values);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_counts_creations_and_reuses() {
        let mut stats = PoolStats::default();
        stats.record_creation(1, &key("/work/a"));
        stats.record_creation(2, &key("/work/b"));
        stats.record_reuse(1, &key("/work/a"));
        stats.record_reuse(1, &key("/work/a"));
        stats.record_pool_size(1);
        stats.record_pool_size(2);

        let report = stats.report("run-1");
        assert_eq!(report.created, 2);
        assert_eq!(report.reused, 2);
        assert_eq!(report.distinct_work_dirs, 2);
        assert_eq!(report.distinct_runtime_images, 1);
        assert_eq!(report.reuse_counts.get(&1), Some(&2));
        assert_eq!(report.reuse_counts.get(&2), Some(&0));
        assert!((report.reuse_mean - 1.0).abs() < 1e-9);
        assert!((report.pool_size_mean - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_report_display_and_json() {
        let mut stats = PoolStats::default();
        stats.record_creation(7, &key("/work/a"));
        stats.record_reuse(7, &key("/work/a"));
        let report = stats.report("run-2");

        let text = report.to_string();
        assert!(text.contains("agent pool usage (run-2)"), "{text}");
        assert!(text.contains("channels created: 1, reuses: 1"), "{text}");
        assert!(text.contains("channel #7: 1 reuse(s)"), "{text}");

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["created"], 1);
        assert_eq!(json["reuse_counts"]["7"], 1);
    }
}
