//! JSON documents exchanged with the resource manager.

use serde::{Deserialize, Serialize};

use crate::codes::ProvCode;
use crate::request::{NodeResult, RequestStatus};
use crate::template::Template;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeInput {
    #[serde(default)]
    pub template: TemplateSelection,
    #[serde(default)]
    pub rc_account: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSelection {
    #[serde(default)]
    pub template_id: Option<String>,
    /// Signed so a negative count is reported as a bad count, not a parse error.
    #[serde(default)]
    pub machine_count: i64,
}

/// Answer to `createNode` and `terminateNode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAck {
    pub request_id: String,
    pub status: RequestStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusInput {
    #[serde(default)]
    pub requests: Vec<RequestRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusOutput {
    pub requests: Vec<RequestReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReport {
    pub request_id: String,
    pub status: RequestStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ProvCode>,
    pub machines: Vec<MachineReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineReport {
    pub machine_id: String,
    pub name: String,
    pub result: NodeResult,
    /// Native backend status, passed through untouched.
    pub status: String,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    /// Seconds since the epoch.
    #[serde(rename = "launchtime")]
    pub launch_time: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachinesInput {
    #[serde(default)]
    pub machines: Vec<MachineRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    pub machine_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnRequestsOutput {
    pub requests: Vec<ReturnedMachine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnedMachine {
    pub machine: String,
    pub machine_id: String,
    /// Seconds left before the backend takes the node.
    pub grace_period: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatesOutput {
    pub templates: Vec<Template>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesOutput {
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub machine_id: String,
    pub name: String,
    pub request_id: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(rename = "launchtime")]
    pub launch_time: i64,
}

/// Printed when a verb could not run at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub status: RequestStatus,
    pub code: ProvCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_input_tolerates_missing_fields() {
        let input: CreateNodeInput = serde_json::from_str(r#"{"template": {"machineCount": -2}}"#).unwrap();
        assert_eq!(input.template.template_id, None);
        assert_eq!(input.template.machine_count, -2);
        let empty: CreateNodeInput = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.template.machine_count, 0);
    }

    #[test]
    fn machine_report_uses_protocol_names() {
        let report = MachineReport {
            machine_id: "i-1".into(),
            name: "execute-1".into(),
            result: NodeResult::Succeeded,
            status: "Started".into(),
            private_ip_address: Some("10.0.0.4".into()),
            launch_time: 1_700_000_000,
            message: String::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["machineId"], "i-1");
        assert_eq!(json["result"], "succeed");
        assert_eq!(json["privateIpAddress"], "10.0.0.4");
        assert_eq!(json["launchtime"], 1_700_000_000);
    }
}
