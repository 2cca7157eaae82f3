//! Provider health status, tracked by the provider manager (C7) and
//! returned by every provider's `health_check`.

use std::time::Duration;

/// Coarse health classification used to decide routing and demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// `error_count == 0`.
    Healthy,
    /// `0 < error_count < 5`.
    Degraded,
    /// `error_count >= 5`.
    Unhealthy,
}

/// A provider's current health, as tracked by the manager.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub state: HealthState,
    pub healthy: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub timestamp_millis: u64,
}

impl HealthStatus {
    /// Derive a status from an error count and clock reading:
    /// `0 -> healthy`, `< 5 -> degraded`, `>= 5 -> unhealthy`.
    #[must_use]
    pub fn from_error_count(error_count: u32, last_error: Option<String>, timestamp_millis: u64) -> Self {
        let state = if error_count == 0 {
            HealthState::Healthy
        } else if error_count < 5 {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };
        Self {
            state,
            healthy: state != HealthState::Unhealthy,
            error_count,
            last_error,
            timestamp_millis,
        }
    }
}

/// Duration after which a provider's health is considered stale and should
/// be re-checked proactively by a caller that cares (the core itself only
/// checks health reactively, on error).
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
