//! Termination causes for preemptible capacity.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lead time between a termination notice and the instance going away.
pub const NOTICE_PERIOD: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    MarkedForTermination,
    Price,
    NoCapacity,
    Scheduled,
    ServiceInitiated,
    ExperimentInitiated,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::MarkedForTermination => "marked-for-termination",
            TerminationReason::Price => "price",
            TerminationReason::NoCapacity => "no-capacity",
            TerminationReason::Scheduled => "scheduled",
            TerminationReason::ServiceInitiated => "service-initiated",
            TerminationReason::ExperimentInitiated => "experiment-initiated",
        };
        f.write_str(s)
    }
}

/// Bucket a provider cause string. Unknown causes still resolve, as
/// `MarkedForTermination`, so the owning request can reach a terminal status.
pub fn classify(cause: &str) -> TerminationReason {
    match cause.trim().to_ascii_lowercase().as_str() {
        "marked-for-termination" => TerminationReason::MarkedForTermination,
        "instance-terminated-by-price" => TerminationReason::Price,
        "instance-terminated-no-capacity" | "instance-terminated-capacity-oversubscribed" => {
            TerminationReason::NoCapacity
        }
        "instance-terminated-by-schedule" => TerminationReason::Scheduled,
        "instance-terminated-by-service" => TerminationReason::ServiceInitiated,
        "instance-terminated-by-experiment" => TerminationReason::ExperimentInitiated,
        other => {
            warn!(cause = other, "unrecognized termination cause");
            TerminationReason::MarkedForTermination
        }
    }
}

/// A provider's notice that it is taking an instance back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationNotice {
    pub instance_id: String,
    pub cause: String,
    pub noticed_at: DateTime<Utc>,
}

impl TerminationNotice {
    pub fn new(instance_id: impl Into<String>, cause: impl Into<String>, noticed_at: DateTime<Utc>) -> Self {
        TerminationNotice {
            instance_id: instance_id.into(),
            cause: cause.into(),
            noticed_at,
        }
    }

    pub fn reason(&self) -> TerminationReason {
        classify(&self.cause)
    }

    /// Time left before the instance is gone. Zero once the notice period has
    /// lapsed, and also for notices stamped in the future.
    pub fn grace_period(&self, now: DateTime<Utc>) -> Duration {
        let Ok(elapsed) = (now - self.noticed_at).to_std() else {
            return Duration::ZERO;
        };
        NOTICE_PERIOD.saturating_sub(elapsed)
    }

    pub fn lapsed(&self, now: DateTime<Utc>) -> bool {
        self.grace_period(now).is_zero()
    }
}
