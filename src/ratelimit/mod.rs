pub mod algorithm;
pub mod key;
pub mod metrics;
pub mod observe;
pub mod pipeline;
pub mod policy;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use pipeline::RateLimiter;
pub use policy::{
    AccessCheck,
    AccessList,
    Algorithm,
    FailureMode,
    KeyStrategy,
    PolicyError,
    RateLimitPolicy,
};

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Outcome of evaluating one request against an algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
    pub reason: Option<&'static str>,
    /// Share of the quota in use after this request, clamped to `[0, 1]`.
    pub utilization: f64,
}

impl Decision {
    pub fn admit(limit: u64, remaining: u64, reset_at: DateTime<Utc>, utilization: f64) -> Self {
        Self {
            admitted: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            reason: None,
            utilization: utilization.clamp(0.0, 1.0),
        }
    }

    pub fn deny(limit: u64, reset_at: DateTime<Utc>, retry_after: Duration, utilization: f64) -> Self {
        Self {
            admitted: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
            reason: Some(RATE_LIMIT_EXCEEDED),
            utilization: utilization.clamp(0.0, 1.0),
        }
    }

    /// Whole seconds until `reset_at`, rounded up.
    pub fn reset_after_secs(&self, now: DateTime<Utc>) -> u64 {
        ceil_secs((self.reset_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Retry hint in whole seconds, never below one for a denial.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.map_or(0, |d| ceil_secs(d).max(1))
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// What the pipeline concluded for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Admitted(Decision),
    Limited(Decision),
    /// Allow-listed; no counters touched.
    Bypassed,
    /// Deny-listed.
    Blocked,
    /// Store failed under `FailOpen`.
    FailedOpen,
    /// Store failed under `FailClosed`.
    Unavailable,
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_) | Self::Bypassed | Self::FailedOpen)
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Admitted(decision) | Self::Limited(decision) => Some(decision),
            _ => None,
        }
    }
}
