//! Retry-with-relaxed-thresholds policy, applied by callers between independent scans.
//!
//! The scan core never retries; a retry is a brand-new scan started with thresholds
//! from [`RelaxationPolicy::relax`].

use serde::{Deserialize, Serialize};

use crate::types::{ScanSnapshot, ScanStatus, SourceSelector, Thresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxationPolicy {
    pub max_attempts: u32,
    pub latency_step_ms: u64,
    pub latency_ceiling_ms: u64,
    pub jitter_step_ms: u64,
    pub jitter_ceiling_ms: u64,
}

impl Default for RelaxationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            latency_step_ms: 1_500,
            latency_ceiling_ms: 4_000,
            jitter_step_ms: 1_000,
            jitter_ceiling_ms: 2_000,
        }
    }
}

impl RelaxationPolicy {
    /// Only sources that can yield a different pool on the next attempt are retried.
    pub fn applies_to(&self, source: &SourceSelector) -> bool {
        matches!(source, SourceSelector::OfficialRanges { .. } | SourceSelector::ExternalUrl { .. })
    }

    /// True when a scan that has finished as `snapshot` deserves retry number `attempt` (1-based).
    pub fn should_retry(&self, source: &SourceSelector, snapshot: &ScanSnapshot, attempt: u32) -> bool {
        snapshot.status == ScanStatus::Completed
            && snapshot.found_good == 0
            && attempt >= 1
            && attempt <= self.max_attempts
            && self.applies_to(source)
    }

    /// Thresholds for retry `attempt` (1-based): maxima grow by `step × 2^(attempt−1)` up to
    /// their ceiling, throughput minima are dropped. `None` once attempts are spent.
    pub fn relax(&self, original: &Thresholds, attempt: u32) -> Option<Thresholds> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let grow = |base: u64, step: u64, ceiling: u64| {
            base.saturating_add(step.saturating_mul(factor)).min(ceiling).max(base)
        };
        Some(Thresholds {
            max_latency_ms: grow(original.max_latency_ms, self.latency_step_ms, self.latency_ceiling_ms),
            max_jitter_ms: grow(original.max_jitter_ms, self.jitter_step_ms, self.jitter_ceiling_ms),
            min_download_mbps: 0.0,
            min_upload_mbps: 0.0,
        })
    }
}
