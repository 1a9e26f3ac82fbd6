//! Stress tests for the vault.
//!
//! These drivers issue large numbers of unawaited operations, from one or
//! many tasks, and report throughput. Each driver checks nothing itself;
//! callers assert on the returned [`StressTestResult`] and on vault state.

use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vaultkv_core::{Vault, VaultResult};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        tracing::info!(
            name,
            total = self.total_ops,
            successful = self.successful_ops,
            failed = self.failed_ops,
            duration = ?self.duration,
            ops_per_second = format_args!("{:.2}", self.ops_per_second),
            "stress run finished"
        );
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent tasks (for concurrent tests).
    pub tasks: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            tasks: 4,
            key_count: 64,
        }
    }
}

fn key_for(i: usize, config: &StressConfig) -> String {
    format!("key_{}", i % config.key_count.max(1))
}

fn tally<T>(results: Vec<VaultResult<T>>) -> (usize, usize) {
    let failed = results.iter().filter(|r| r.is_err()).count();
    (results.len() - failed, failed)
}

/// Issues `operations` sets without awaiting any, then awaits them all.
///
/// Key `key_i` ends holding the largest `n < operations` with
/// `n % key_count == i`.
pub async fn stress_unawaited_writes(vault: &Vault, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let pending: Vec<_> = (0..config.operations)
        .map(|i| vault.set(key_for(i, config), i))
        .collect();
    let (successful, failed) = tally(join_all(pending).await);
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Interleaves set, get and remove on a shared key space.
///
/// Every third operation is a remove, so key `key_i` ends absent exactly
/// when its last scheduled operation was a remove.
pub async fn stress_mixed_operations(vault: &Vault, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut writes = Vec::new();
    let mut reads = Vec::new();

    for i in 0..config.operations {
        let key = key_for(i, config);
        match i % 3 {
            0 => writes.push(vault.set(key, i)),
            1 => reads.push(vault.get(key)),
            _ => writes.push(vault.remove(key)),
        }
    }

    let (ok_w, failed_w) = tally(join_all(writes).await);
    let (ok_r, failed_r) = tally(join_all(reads).await);
    StressTestResult::new(ok_w + ok_r, failed_w + failed_r, start.elapsed())
}

/// Runs writers on several tasks, each owning a disjoint slice of keys.
///
/// Each task checks its own read-after-write before moving on, and counts
/// a stale read as a failure.
pub async fn stress_concurrent_writers(vault: &Vault, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_task = config.operations / config.tasks.max(1);

    let start = Instant::now();
    let handles: Vec<_> = (0..config.tasks)
        .map(|t| {
            let vault = vault.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            tokio::spawn(async move {
                for i in 0..ops_per_task {
                    let key = format!("task_{t}_{}", i % 8);
                    let _ = vault.set(key.clone(), i);
                    match vault.get(key).await {
                        Ok(Some(v)) if v == Value::from(i) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("Writer task panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Issues sets with a clear every `clear_every` operations.
///
/// Nothing issued before the last clear survives it.
pub async fn stress_clear_storms(
    vault: &Vault,
    config: &StressConfig,
    clear_every: usize,
) -> StressTestResult {
    let start = Instant::now();
    let mut pending = Vec::with_capacity(config.operations);
    for i in 0..config.operations {
        if clear_every > 0 && i % clear_every == clear_every - 1 {
            pending.push(vault.clear());
        } else {
            pending.push(vault.set(key_for(i, config), i));
        }
    }
    let (successful, failed) = tally(join_all(pending).await);
    StressTestResult::new(successful, failed, start.elapsed())
}
