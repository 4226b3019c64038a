//! Check outcomes and the trait the diagnostics runner calls.

use std::fmt;
use std::time::Duration;

/// Data reported by a healthy server
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceData {
    /// Round trip of the stats request
    pub response_time: Duration,
    /// `curr_connections` stat
    pub connections: i64,
    /// `uptime` stat, in seconds
    pub uptime: i64,
}

impl ServiceData {
    pub fn response_time_secs(&self) -> f64 {
        self.response_time.as_secs_f64()
    }
}

impl fmt::Display for ServiceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "response_time={:.6}s connections={} uptime={}s",
            self.response_time_secs(),
            self.connections,
            self.uptime
        )
    }
}

/// Result of a single check invocation
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The service is up; `data` is present only when stats were retrieved
    Success {
        message: String,
        data: Option<ServiceData>,
    },
    /// The service is down or could not be reached
    Failure { message: String },
}

impl CheckOutcome {
    pub fn success(message: impl Into<String>, data: Option<ServiceData>) -> Self {
        CheckOutcome::Success {
            message: message.into(),
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        CheckOutcome::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            CheckOutcome::Success { message, .. } | CheckOutcome::Failure { message } => message,
        }
    }

    pub fn data(&self) -> Option<&ServiceData> {
        match self {
            CheckOutcome::Success { data, .. } => data.as_ref(),
            CheckOutcome::Failure { .. } => None,
        }
    }
}

/// A single diagnostic check.
///
/// Implementations never fail: every problem is folded into the returned
/// [`CheckOutcome`].
pub trait Check {
    /// Run the check once
    fn check(&self) -> CheckOutcome;

    /// Human-readable name shown next to the outcome
    fn label(&self) -> &str;
}
