//! Per-backend native status tables.
//!
//! Each backend owns a closed enum of the statuses it reports and maps it into
//! a backend-neutral [`NodePhase`]. Tables never fall back to one another.
//! The phase is then turned into a canonical [`NodeResult`] according to the
//! request kind. Anything a table does not recognize becomes
//! [`NodeResult::Failed`]: an unknown status must never read as success.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::request::{NodeResult, RequestKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Aws,
    Azure,
    CycleCloud,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Aws => "aws",
            Backend::Azure => "azure",
            Backend::CycleCloud => "cyclecloud",
        }
    }

    /// Only spot capacity on aws emits termination notices.
    pub fn supports_preemptible(self) -> bool {
        matches!(self, Backend::Aws)
    }

    pub fn default_creation_timeout(self) -> Duration {
        match self {
            Backend::Aws => Duration::from_secs(10 * 60),
            Backend::Azure | Backend::CycleCloud => Duration::from_secs(15 * 60),
        }
    }

    pub fn default_termination_timeout(self) -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Backend::Aws),
            "azure" => Ok(Backend::Azure),
            "cyclecloud" => Ok(Backend::CycleCloud),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Backend-neutral lifecycle position of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Provisioning,
    Ready,
    Releasing,
    Released,
    Failed,
    Unrecognized,
}

/// aws instance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ec2State {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
}

impl FromStr for Ec2State {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Ec2State::Pending),
            "running" => Ok(Ec2State::Running),
            "shutting-down" => Ok(Ec2State::ShuttingDown),
            "stopping" => Ok(Ec2State::Stopping),
            "stopped" => Ok(Ec2State::Stopped),
            "terminated" => Ok(Ec2State::Terminated),
            _ => Err(()),
        }
    }
}

impl Ec2State {
    pub fn phase(self) -> NodePhase {
        match self {
            Ec2State::Pending => NodePhase::Provisioning,
            Ec2State::Running => NodePhase::Ready,
            Ec2State::ShuttingDown | Ec2State::Stopping => NodePhase::Releasing,
            Ec2State::Stopped | Ec2State::Terminated => NodePhase::Released,
        }
    }
}

/// azure instance-view status codes, `ProvisioningState/*` and `PowerState/*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureStatus {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Canceled,
    Deleting,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
}

impl FromStr for AzureStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, value) = s.split_once('/').ok_or(())?;
        let value = value.to_ascii_lowercase();
        match (family.to_ascii_lowercase().as_str(), value.as_str()) {
            ("provisioningstate", "creating") => Ok(AzureStatus::Creating),
            ("provisioningstate", "updating") => Ok(AzureStatus::Updating),
            ("provisioningstate", "succeeded") => Ok(AzureStatus::Succeeded),
            ("provisioningstate", "failed") => Ok(AzureStatus::Failed),
            ("provisioningstate", "canceled") => Ok(AzureStatus::Canceled),
            ("provisioningstate", "deleting") => Ok(AzureStatus::Deleting),
            ("powerstate", "starting") => Ok(AzureStatus::Starting),
            ("powerstate", "running") => Ok(AzureStatus::Running),
            ("powerstate", "stopping") => Ok(AzureStatus::Stopping),
            ("powerstate", "stopped") => Ok(AzureStatus::Stopped),
            ("powerstate", "deallocating") => Ok(AzureStatus::Deallocating),
            ("powerstate", "deallocated") => Ok(AzureStatus::Deallocated),
            _ => Err(()),
        }
    }
}

impl AzureStatus {
    pub fn phase(self) -> NodePhase {
        match self {
            // A succeeded deployment without a power state has not booted yet.
            AzureStatus::Creating
            | AzureStatus::Updating
            | AzureStatus::Succeeded
            | AzureStatus::Starting => NodePhase::Provisioning,
            AzureStatus::Running => NodePhase::Ready,
            AzureStatus::Deleting | AzureStatus::Stopping | AzureStatus::Deallocating => {
                NodePhase::Releasing
            }
            AzureStatus::Stopped | AzureStatus::Deallocated => NodePhase::Released,
            AzureStatus::Failed | AzureStatus::Canceled => NodePhase::Failed,
        }
    }
}

/// cyclecloud node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleCloudState {
    Off,
    Acquiring,
    Preparing,
    Allocation,
    Validation,
    Booting,
    Software,
    Configuring,
    Ready,
    Started,
    Terminating,
    Deallocating,
    Deallocated,
    Terminated,
    Failed,
    Unavailable,
}

impl FromStr for CycleCloudState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Off" => Ok(CycleCloudState::Off),
            "Acquiring" => Ok(CycleCloudState::Acquiring),
            "Preparing" => Ok(CycleCloudState::Preparing),
            "Allocation" => Ok(CycleCloudState::Allocation),
            "Validation" => Ok(CycleCloudState::Validation),
            "Booting" => Ok(CycleCloudState::Booting),
            "Software" => Ok(CycleCloudState::Software),
            "Configuring" => Ok(CycleCloudState::Configuring),
            "Ready" => Ok(CycleCloudState::Ready),
            "Started" => Ok(CycleCloudState::Started),
            "Terminating" => Ok(CycleCloudState::Terminating),
            "Deallocating" => Ok(CycleCloudState::Deallocating),
            "Deallocated" => Ok(CycleCloudState::Deallocated),
            "Terminated" => Ok(CycleCloudState::Terminated),
            "Failed" => Ok(CycleCloudState::Failed),
            "Unavailable" => Ok(CycleCloudState::Unavailable),
            _ => Err(()),
        }
    }
}

impl CycleCloudState {
    pub fn phase(self) -> NodePhase {
        match self {
            CycleCloudState::Off
            | CycleCloudState::Acquiring
            | CycleCloudState::Preparing
            | CycleCloudState::Allocation
            | CycleCloudState::Validation
            | CycleCloudState::Booting
            | CycleCloudState::Software
            | CycleCloudState::Configuring
            | CycleCloudState::Ready => NodePhase::Provisioning,
            CycleCloudState::Started => NodePhase::Ready,
            CycleCloudState::Terminating | CycleCloudState::Deallocating => NodePhase::Releasing,
            CycleCloudState::Terminated | CycleCloudState::Deallocated => NodePhase::Released,
            CycleCloudState::Failed | CycleCloudState::Unavailable => NodePhase::Failed,
        }
    }
}

/// What a backend client reports about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeObservation {
    pub instance_id: String,
    #[serde(default)]
    pub name: String,
    pub native_status: String,
    #[serde(default)]
    pub private_ip: Option<String>,
}

impl NodeObservation {
    pub fn new(instance_id: impl Into<String>, native_status: impl Into<String>) -> Self {
        NodeObservation {
            instance_id: instance_id.into(),
            name: String::new(),
            native_status: native_status.into(),
            private_ip: None,
        }
    }

    pub fn with_address(mut self, name: impl Into<String>, private_ip: impl Into<String>) -> Self {
        self.name = name.into();
        self.private_ip = Some(private_ip.into());
        self
    }

    pub fn reachable(&self) -> bool {
        self.private_ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }
}

/// Outcome of normalizing one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub phase: NodePhase,
    pub result: NodeResult,
    pub diagnostic: Option<String>,
}

pub fn phase_of(backend: Backend, native_status: &str) -> NodePhase {
    let parsed = match backend {
        Backend::Aws => native_status.parse::<Ec2State>().map(Ec2State::phase),
        Backend::Azure => native_status.parse::<AzureStatus>().map(AzureStatus::phase),
        Backend::CycleCloud => native_status.parse::<CycleCloudState>().map(CycleCloudState::phase),
    };
    parsed.unwrap_or(NodePhase::Unrecognized)
}

/// Canonical result of a native status for a node being created.
pub fn normalize(backend: Backend, native_status: &str) -> NodeResult {
    normalize_for(backend, RequestKind::Create, native_status, true).result
}

pub fn normalize_for(
    backend: Backend,
    kind: RequestKind,
    native_status: &str,
    reachable: bool,
) -> Normalized {
    let phase = phase_of(backend, native_status);
    let result = match (kind, phase) {
        (_, NodePhase::Unrecognized) => NodeResult::Failed,
        (RequestKind::Create, NodePhase::Ready) if reachable => NodeResult::Succeeded,
        (RequestKind::Create, NodePhase::Ready | NodePhase::Provisioning) => NodeResult::Executing,
        (RequestKind::Create, _) => NodeResult::Failed,
        (RequestKind::Terminate, NodePhase::Released) => NodeResult::Succeeded,
        (RequestKind::Terminate, _) => NodeResult::Executing,
    };
    let diagnostic = (phase == NodePhase::Unrecognized).then(|| {
        warn!(backend = %backend, status = native_status, "unrecognized native status");
        format!("unrecognized {} status '{}'", backend, native_status)
    });
    Normalized { phase, result, diagnostic }
}

/// A node the backend no longer reports at all.
pub fn vanished(kind: RequestKind) -> Normalized {
    let result = match kind {
        RequestKind::Create => NodeResult::Failed,
        RequestKind::Terminate => NodeResult::Succeeded,
    };
    Normalized {
        phase: NodePhase::Released,
        result,
        diagnostic: Some("node no longer exists on the backend".to_string()),
    }
}

/// A node reclaimed by the provider cannot serve a create request.
pub fn preempted(kind: RequestKind, current: NodeResult) -> NodeResult {
    match kind {
        RequestKind::Create => NodeResult::Failed,
        RequestKind::Terminate => current,
    }
}

/// A node still executing when its request's deadline passes.
pub fn expired(current: NodeResult) -> NodeResult {
    match current {
        NodeResult::Executing => NodeResult::Failed,
        settled => settled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AWS: &[&str] = &["pending", "running", "shutting-down", "stopping", "stopped", "terminated"];
    const AZURE: &[&str] = &[
        "ProvisioningState/creating",
        "ProvisioningState/updating",
        "ProvisioningState/succeeded",
        "ProvisioningState/failed",
        "ProvisioningState/canceled",
        "ProvisioningState/deleting",
        "PowerState/starting",
        "PowerState/running",
        "PowerState/stopping",
        "PowerState/stopped",
        "PowerState/deallocating",
        "PowerState/deallocated",
    ];
    const CYCLECLOUD: &[&str] = &[
        "Off", "Acquiring", "Preparing", "Allocation", "Validation", "Booting", "Software",
        "Configuring", "Ready", "Started", "Terminating", "Deallocating", "Deallocated",
        "Terminated", "Failed", "Unavailable",
    ];

    fn vocabulary(backend: Backend) -> &'static [&'static str] {
        match backend {
            Backend::Aws => AWS,
            Backend::Azure => AZURE,
            Backend::CycleCloud => CYCLECLOUD,
        }
    }

    #[test]
    fn every_declared_status_is_recognized_and_deterministic() {
        for backend in [Backend::Aws, Backend::Azure, Backend::CycleCloud] {
            for status in vocabulary(backend) {
                assert_ne!(phase_of(backend, status), NodePhase::Unrecognized, "{} {}", backend, status);
                for kind in [RequestKind::Create, RequestKind::Terminate] {
                    let first = normalize_for(backend, kind, status, true);
                    let second = normalize_for(backend, kind, status, true);
                    assert_eq!(first, second);
                    assert!(first.diagnostic.is_none());
                }
            }
        }
    }

    #[test]
    fn unknown_status_fails_with_diagnostic() {
        for backend in [Backend::Aws, Backend::Azure, Backend::CycleCloud] {
            for kind in [RequestKind::Create, RequestKind::Terminate] {
                let n = normalize_for(backend, kind, "hibernating-sideways", true);
                assert_eq!(n.result, NodeResult::Failed);
                assert_eq!(n.phase, NodePhase::Unrecognized);
                assert!(n.diagnostic.is_some());
            }
        }
        assert_eq!(normalize(Backend::Aws, ""), NodeResult::Failed);
    }

    #[test]
    fn tables_do_not_borrow_from_each_other() {
        assert_eq!(phase_of(Backend::Aws, "Started"), NodePhase::Unrecognized);
        assert_eq!(phase_of(Backend::CycleCloud, "running"), NodePhase::Unrecognized);
        assert_eq!(phase_of(Backend::Azure, "terminated"), NodePhase::Unrecognized);
    }

    #[test]
    fn create_results() {
        assert_eq!(normalize(Backend::CycleCloud, "Started"), NodeResult::Succeeded);
        assert_eq!(normalize(Backend::CycleCloud, "Booting"), NodeResult::Executing);
        assert_eq!(normalize(Backend::CycleCloud, "Failed"), NodeResult::Failed);
        assert_eq!(normalize(Backend::CycleCloud, "Deallocated"), NodeResult::Failed);
        assert_eq!(normalize(Backend::Aws, "running"), NodeResult::Succeeded);
        assert_eq!(normalize(Backend::Aws, "terminated"), NodeResult::Failed);
        assert_eq!(normalize(Backend::Azure, "PowerState/running"), NodeResult::Succeeded);
        assert_eq!(normalize(Backend::Azure, "ProvisioningState/succeeded"), NodeResult::Executing);
    }

    #[test]
    fn started_without_address_keeps_executing() {
        let n = normalize_for(Backend::CycleCloud, RequestKind::Create, "Started", false);
        assert_eq!(n.result, NodeResult::Executing);
    }

    #[test]
    fn terminate_results() {
        let released = normalize_for(Backend::Aws, RequestKind::Terminate, "terminated", true);
        assert_eq!(released.result, NodeResult::Succeeded);
        let draining = normalize_for(Backend::Aws, RequestKind::Terminate, "shutting-down", true);
        assert_eq!(draining.result, NodeResult::Executing);
        let failed = normalize_for(Backend::CycleCloud, RequestKind::Terminate, "Failed", true);
        assert_eq!(failed.result, NodeResult::Executing);
        assert_eq!(vanished(RequestKind::Terminate).result, NodeResult::Succeeded);
        assert_eq!(vanished(RequestKind::Create).result, NodeResult::Failed);
    }

    #[test]
    fn expiry_only_touches_executing() {
        assert_eq!(expired(NodeResult::Executing), NodeResult::Failed);
        assert_eq!(expired(NodeResult::Succeeded), NodeResult::Succeeded);
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("CycleCloud".parse::<Backend>(), Ok(Backend::CycleCloud));
        assert!("gcp".parse::<Backend>().is_err());
    }
}
