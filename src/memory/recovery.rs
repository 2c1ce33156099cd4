//! Staged recovery from critical memory pressure.

use super::manager::MemoryManager;
use super::{MemoryError, PressureLevel};
use crate::cancel::CancelToken;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// How hard a recovery pass tries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryStage {
    /// Release hooks only.
    Lightweight,
    /// Release hooks plus cache eviction and mmap offload.
    Moderate,
    /// Repeated release passes, forced offload of every mappable, then a
    /// final verification.
    Aggressive,
}

/// What a recovery run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The last stage that ran.
    pub final_stage: RecoveryStage,
    /// Total bytes freed across stages.
    pub bytes_freed: usize,
    /// Attempts made (one per stage entered).
    pub attempts: u32,
}

/// Recovery tuning.
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    /// First backoff delay; doubles per stage.
    pub initial_backoff: Duration,
    /// Release passes in the aggressive stage.
    pub aggressive_gc_passes: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            aggressive_gc_passes: 3,
        }
    }
}

/// Escalates lightweight → moderate → aggressive until pressure drops below
/// critical, backing off exponentially between stages.
pub struct RecoveryManager {
    manager: Arc<MemoryManager>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    /// Creates a recovery manager over `manager`.
    #[must_use]
    pub fn new(manager: Arc<MemoryManager>, config: RecoveryConfig) -> Self {
        Self { manager, config }
    }

    fn pressure_relieved(&self) -> bool {
        self.manager.get_usage().level < PressureLevel::Critical
    }

    /// Runs the staged recovery.
    ///
    /// Returns a report once pressure drops below critical, or
    /// [`MemoryError::RecoveryFailed`] when even the aggressive stage could
    /// not relieve it. Each backoff quantum observes `cancel`.
    pub fn recover(&self, cancel: &CancelToken) -> Result<RecoveryReport, MemoryError> {
        let mut bytes_freed = 0usize;
        let mut backoff = self.config.initial_backoff;
        let mut attempts = 0u32;

        for stage in [
            RecoveryStage::Lightweight,
            RecoveryStage::Moderate,
            RecoveryStage::Aggressive,
        ] {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            attempts += 1;
            info!("memory recovery: entering {stage:?} stage");

            bytes_freed += match stage {
                RecoveryStage::Lightweight => self.manager.trigger_gc(),
                RecoveryStage::Moderate => {
                    self.manager.trigger_gc() + self.manager.handle_limit_exceeded()
                }
                RecoveryStage::Aggressive => {
                    let mut freed = 0usize;
                    for _ in 0..self.config.aggressive_gc_passes {
                        if cancel.is_cancelled() {
                            return Err(MemoryError::Cancelled);
                        }
                        freed += self.manager.trigger_gc();
                    }
                    freed + self.manager.handle_limit_exceeded()
                }
            };

            if self.pressure_relieved() {
                info!("memory recovery: {stage:?} stage freed enough ({bytes_freed} bytes total)");
                return Ok(RecoveryReport {
                    final_stage: stage,
                    bytes_freed,
                    attempts,
                });
            }

            if stage != RecoveryStage::Aggressive {
                // Give evictions a moment to land before escalating.
                if cancel.wait_timeout(backoff) {
                    return Err(MemoryError::Cancelled);
                }
                backoff *= 2;
            }
        }

        // Final verification failed.
        let usage = self.manager.get_usage();
        warn!(
            "memory recovery exhausted all stages; still {} bytes against limit {:?}",
            usage.total_heap, usage.limit
        );
        Err(MemoryError::RecoveryFailed(format!(
            "pressure still {} after aggressive recovery ({bytes_freed} bytes freed)",
            usage.level
        )))
    }
}
