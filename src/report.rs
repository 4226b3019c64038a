//! Human-readable rendering of a check outcome.

use crate::outcome::{Check, CheckOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// A check outcome stamped with when and what was checked
#[derive(Debug, Clone)]
pub struct Report {
    pub label: String,
    pub checked_at: DateTime<Utc>,
    pub outcome: CheckOutcome,
}

impl Report {
    /// Run `check` once and stamp the result
    pub fn run(check: &dyn Check) -> Self {
        let checked_at = Utc::now();
        let outcome = check.check();
        Self {
            label: check.label().to_string(),
            checked_at,
            outcome,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.outcome.is_success() { "OK" } else { "FAIL" };
        write!(
            f,
            "[{}] {}: {} {}",
            self.checked_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.label,
            status,
            self.outcome.message()
        )?;
        if let Some(data) = self.outcome.data() {
            write!(f, "\n  {}", data)?;
        }
        Ok(())
    }
}
