use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codes::ProvCode;
use crate::normalize::{Backend, NodePhase, Normalized};
use crate::spot::TerminationReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Terminate,
}

/// Canonical request status, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Running,
    Complete,
    CompleteWithError,
    Warning,
    Error,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Running => "running",
            RequestStatus::Complete => "complete",
            RequestStatus::CompleteWithError => "complete_with_error",
            RequestStatus::Warning => "warning",
            RequestStatus::Error => "error",
        }
    }

    /// `Warning` is reported while the request keeps progressing; it is not terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Complete | RequestStatus::CompleteWithError | RequestStatus::Error
        )
    }

    /// Statuses only ever move up this order.
    pub(crate) fn rank(self) -> u8 {
        match self {
            RequestStatus::Running => 0,
            RequestStatus::Warning => 1,
            RequestStatus::Complete => 2,
            RequestStatus::CompleteWithError => 3,
            RequestStatus::Error => 4,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical per-machine result, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeResult {
    #[serde(rename = "succeed")]
    Succeeded,
    #[serde(rename = "executing")]
    Executing,
    #[serde(rename = "fail")]
    Failed,
}

impl NodeResult {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeResult::Succeeded => "succeed",
            NodeResult::Executing => "executing",
            NodeResult::Failed => "fail",
        }
    }
}

/// One node tracked by a request.
///
/// `machine_id` is the backend-native instance identifier; the resource
/// manager uses the same value to refer to the node. `result` and `reason`
/// change only through the normalizer, via the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    #[serde(default)]
    pub name: String,
    pub(crate) result: NodeResult,
    #[serde(default)]
    pub(crate) phase: Option<NodePhase>,
    #[serde(default)]
    pub native_status: String,
    #[serde(default)]
    pub(crate) reason: Option<TerminationReason>,
    #[serde(default)]
    pub private_ip: Option<String>,
    pub launched_at: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    /// Absent from the backend's answer at the last observation.
    #[serde(default)]
    pub(crate) gone: bool,
    /// A terminate call for this node is owed to the backend.
    #[serde(default)]
    pub(crate) reclaim_pending: bool,
}

impl Machine {
    /// A node submitted to the backend but not observed yet.
    pub fn pending(machine_id: impl Into<String>, launched_at: DateTime<Utc>) -> Self {
        Machine {
            machine_id: machine_id.into(),
            name: String::new(),
            result: NodeResult::Executing,
            phase: None,
            native_status: String::new(),
            reason: None,
            private_ip: None,
            launched_at,
            message: String::new(),
            gone: false,
            reclaim_pending: false,
        }
    }

    pub fn result(&self) -> NodeResult {
        self.result
    }

    pub fn phase(&self) -> Option<NodePhase> {
        self.phase
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    pub fn reclaim_pending(&self) -> bool {
        self.reclaim_pending
    }

    pub(crate) fn apply(&mut self, native_status: &str, normalized: Normalized) {
        self.native_status = native_status.to_string();
        self.phase = Some(normalized.phase);
        self.result = normalized.result;
        self.message = normalized.diagnostic.unwrap_or_default();
    }
}

/// A code attached to a request, kept for diagnostics even when another
/// code decided the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedCode {
    pub code: ProvCode,
    #[serde(default)]
    pub detail: Option<String>,
    pub attached_at: DateTime<Utc>,
}

/// One create or terminate operation, tracked to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub kind: RequestKind,
    pub backend: Backend,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub rc_account: Option<String>,
    #[serde(default)]
    pub requested_count: u32,
    /// Nodes the backend agreed to create; may exceed `machines.len()` until
    /// the backend lists all of them.
    #[serde(default)]
    pub accepted_count: u32,
    pub(crate) status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub(crate) codes: Vec<AttachedCode>,
    /// Code whose severity produced the current status.
    #[serde(default)]
    pub(crate) decisive: Option<AttachedCode>,
    /// Set once the resource manager has been shown a terminal status.
    #[serde(default)]
    pub observed_terminal: bool,
}

impl Request {
    pub fn new(
        request_id: impl Into<String>,
        kind: RequestKind,
        backend: Backend,
        created_at: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Request {
            request_id: request_id.into(),
            kind,
            backend,
            template_id: None,
            rc_account: None,
            requested_count: 0,
            accepted_count: 0,
            status: RequestStatus::Running,
            created_at,
            valid_until,
            machines: Vec::new(),
            codes: Vec::new(),
            decisive: None,
            observed_terminal: false,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Every code attached over the request's lifetime, oldest first.
    pub fn codes(&self) -> &[AttachedCode] {
        &self.codes
    }

    pub fn decisive_code(&self) -> Option<&AttachedCode> {
        self.decisive.as_ref()
    }

    pub fn machine(&self, machine_id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.machine_id == machine_id)
    }

    pub fn count(&self, result: NodeResult) -> usize {
        self.machines.iter().filter(|m| m.result == result).count()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.machine_id.clone()).collect()
    }

    /// Accepted nodes the backend has not listed yet.
    pub fn unlisted(&self) -> u32 {
        let listed = u32::try_from(self.machines.len()).unwrap_or(u32::MAX);
        self.accepted_count.saturating_sub(listed)
    }

    /// Nodes still owed a terminate call.
    pub fn pending_reclaim(&self) -> Vec<String> {
        self.machines
            .iter()
            .filter(|m| m.reclaim_pending)
            .map(|m| m.machine_id.clone())
            .collect()
    }

    pub(crate) fn reclaimed(&mut self, instance_ids: &[String]) {
        for machine in self.machines.iter_mut().filter(|m| instance_ids.contains(&m.machine_id)) {
            machine.reclaim_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings() {
        assert_eq!(serde_json::to_string(&RequestStatus::CompleteWithError).unwrap(), "\"complete_with_error\"");
        assert_eq!(serde_json::to_string(&NodeResult::Succeeded).unwrap(), "\"succeed\"");
        assert_eq!(serde_json::to_string(&NodeResult::Failed).unwrap(), "\"fail\"");
        assert_eq!(RequestStatus::Warning.as_str(), "warning");
    }

    #[test]
    fn warning_is_not_terminal() {
        assert!(!RequestStatus::Running.is_terminal());
        assert!(!RequestStatus::Warning.is_terminal());
        assert!(RequestStatus::Complete.is_terminal());
        assert!(RequestStatus::CompleteWithError.is_terminal());
        assert!(RequestStatus::Error.is_terminal());
    }
}
