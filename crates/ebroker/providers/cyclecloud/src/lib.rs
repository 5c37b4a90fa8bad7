use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ebroker_core::error::BackendErrorKind;
use ebroker_core::{Backend, BackendError, LaunchSpec, Launched, NodeObservation, NodeProvider};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const LOOKUP_ATTEMPTS: u32 = 3;
const LOOKUP_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CycleCloudConfig {
    pub server: String,
    pub cluster: String,
    pub user: String,
    pub password: Option<String>,
    pub call_timeout: Duration,
}

/// REST client for a CycleCloud cluster.
pub struct CycleCloud {
    client: reqwest::Client,
    config: CycleCloudConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateNodes<'a> {
    request_id: &'a str,
    sets: Vec<NodeSet<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeSet<'a> {
    nodearray: &'a str,
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    definition: Option<Definition<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    node_attributes: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Definition<'a> {
    machine_type: &'a str,
}

#[derive(Deserialize)]
struct CreateResult {
    #[serde(default)]
    sets: Vec<SetResult>,
}

#[derive(Deserialize)]
struct SetResult {
    #[serde(default)]
    added: u32,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TerminateNodes<'a> {
    ids: &'a [String],
}

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Node {
    node_id: String,
    #[serde(default)]
    name: String,
    #[serde(alias = "State")]
    status: String,
    #[serde(default)]
    private_ip: Option<String>,
}

impl From<Node> for NodeObservation {
    fn from(node: Node) -> Self {
        NodeObservation {
            instance_id: node.node_id,
            name: node.name,
            native_status: node.status,
            private_ip: node.private_ip.filter(|ip| !ip.is_empty()),
        }
    }
}

impl CycleCloud {
    pub fn new(config: CycleCloudConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| BackendError::from(format!("Failed to build http client: {}", e)))?;
        Ok(CycleCloud { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/clusters/{}/{}",
            self.config.server.trim_end_matches('/'),
            self.config.cluster,
            path
        )
    }

    /// Send a call and return its body, classifying every failure.
    async fn call(&self, request: RequestBuilder) -> Result<String, BackendError> {
        let pending = request
            .basic_auth(&self.config.user, self.config.password.as_deref())
            .header("accept", "application/json")
            .send();
        let response = tokio::time::timeout(self.config.call_timeout, pending)
            .await
            .map_err(|_| BackendError::timeout(format!("no answer within {:?}", self.config.call_timeout)))?
            .map_err(request_error)?;

        let status = response.status();
        let text = response.text().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        Ok(text)
    }

    async fn list_nodes(&self, query: &[(&str, &str)]) -> Result<Vec<Node>, BackendError> {
        let body = self.call(self.client.get(self.url("nodes")).query(query)).await?;
        let list: NodeList = parse(&body)?;
        Ok(list.nodes)
    }
}

fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::timeout(format!("Request timed out: {}", e))
    } else {
        BackendError::transient(format!("Request failed: {}", e))
    }
}

fn status_error(status: StatusCode, text: &str) -> BackendError {
    let message = format!("API Error ({}): {}", status, text);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::transient(message)
    } else {
        BackendError::new(BackendErrorKind::Rejected, message)
    }
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, BackendError> {
    if body.trim().is_empty() {
        return Err(BackendError::new(BackendErrorKind::Empty, "empty response body"));
    }
    serde_json::from_str(body).map_err(|e| BackendError::unrecognized(format!("Failed to parse response: {}", e)))
}

#[async_trait]
impl NodeProvider for CycleCloud {
    fn backend(&self) -> Backend {
        Backend::CycleCloud
    }

    async fn launch(&self, spec: LaunchSpec<'_>) -> Result<Launched, BackendError> {
        let template = spec.template;
        let mut node_attributes: BTreeMap<String, String> = template.user_data_pairs().into_iter().collect();
        if let Some(account) = spec.rc_account.filter(|a| !a.is_empty()) {
            node_attributes.insert("rc_account".to_string(), account.to_string());
        }
        let payload = CreateNodes {
            request_id: spec.request_id,
            sets: vec![NodeSet {
                nodearray: template.node_array.as_deref().unwrap_or(&template.template_id),
                count: spec.count,
                definition: template.machine_type.as_deref().map(|machine_type| Definition { machine_type }),
                node_attributes,
            }],
        };
        let body = self.call(self.client.post(self.url("nodes/create")).json(&payload)).await?;
        let result: CreateResult = parse(&body)?;
        let accepted: u32 = result.sets.iter().map(|s| s.added).sum();
        if accepted == 0 {
            let reasons: Vec<String> = result.sets.into_iter().filter_map(|s| s.message).collect();
            return Err(BackendError::from(format!("No nodes added: {}", reasons.join("; "))));
        }

        // The nodes exist from here on. Listing them is a courtesy: whatever
        // is missing is looked up by request id on later polls.
        for attempt in 1..=LOOKUP_ATTEMPTS {
            match self.nodes_for_request(spec.request_id).await {
                Ok(nodes) if !nodes.is_empty() => {
                    debug!(request = spec.request_id, accepted, found = nodes.len(), "nodes created");
                    return Ok(Launched { accepted, nodes });
                }
                Ok(_) => {}
                Err(e) => warn!(request = spec.request_id, attempt, error = %e, "could not list created nodes"),
            }
            if attempt < LOOKUP_ATTEMPTS {
                tokio::time::sleep(LOOKUP_DELAY).await;
            }
        }
        warn!(request = spec.request_id, accepted, "created nodes not listed yet");
        Ok(Launched { accepted, nodes: Vec::new() })
    }

    async fn describe(&self, instance_ids: &[String]) -> Result<Vec<NodeObservation>, BackendError> {
        let query: Vec<(&str, &str)> = instance_ids.iter().map(|id| ("ids", id.as_str())).collect();
        let nodes = self.list_nodes(&query).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| instance_ids.contains(&n.node_id))
            .map(NodeObservation::from)
            .collect())
    }

    async fn nodes_for_request(&self, request_id: &str) -> Result<Vec<NodeObservation>, BackendError> {
        let nodes = self.list_nodes(&[("request_id", request_id)]).await?;
        Ok(nodes.into_iter().map(NodeObservation::from).collect())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), BackendError> {
        let payload = TerminateNodes { ids: instance_ids };
        self.call(self.client.post(self.url("nodes/terminate")).json(&payload)).await?;
        debug!(nodes = ?instance_ids, "terminate accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    use ebroker_core::Template;

    /// Answer each incoming connection with the next canned response and
    /// report the request line and body that came in.
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, mpsc::Receiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut length = 0;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header == "\r\n" || header.is_empty() {
                        break;
                    }
                    if let Some(v) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                        length = v.trim().parse().unwrap();
                    }
                }
                let mut payload = vec![0; length];
                reader.read_exact(&mut payload).unwrap();
                tx.send((request_line.trim().to_string(), String::from_utf8(payload).unwrap())).unwrap();
                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .unwrap();
            }
        });
        (url, rx)
    }

    fn client(server: String) -> CycleCloud {
        CycleCloud::new(CycleCloudConfig {
            server,
            cluster: "hpc".into(),
            user: "admin".into(),
            password: Some("secret".into()),
            call_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn template() -> Template {
        serde_json::from_str(
            r#"{"templateId": "execute", "maxNumber": 4, "machineType": "Standard_F4s_v2", "userData": "role=worker"}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn launch_creates_then_lists_nodes() {
        let (url, seen) = serve(vec![
            (200, r#"{"operationId": "op-1", "sets": [{"added": 2}]}"#),
            (
                200,
                r#"{"nodes": [
                    {"NodeId": "n-1", "Name": "execute-1", "Status": "Acquiring"},
                    {"NodeId": "n-2", "Name": "execute-2", "Status": "Acquiring", "PrivateIp": ""}
                ]}"#,
            ),
        ]);
        let template = template();
        let spec = LaunchSpec { request_id: "req-7", template: &template, count: 2, rc_account: Some("physics") };
        let launched = client(url).launch(spec).await.unwrap();
        assert_eq!(launched.accepted, 2);
        let nodes = launched.nodes;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].instance_id, "n-1");
        assert_eq!(nodes[1].private_ip, None);

        let (line, body) = seen.recv().unwrap();
        assert_eq!(line, "POST /clusters/hpc/nodes/create HTTP/1.1");
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["requestId"], "req-7");
        assert_eq!(body["sets"][0]["nodearray"], "execute");
        assert_eq!(body["sets"][0]["definition"]["machineType"], "Standard_F4s_v2");
        assert_eq!(body["sets"][0]["nodeAttributes"]["role"], "worker");
        assert_eq!(body["sets"][0]["nodeAttributes"]["rc_account"], "physics");
        let (line, _) = seen.recv().unwrap();
        assert!(line.starts_with("GET /clusters/hpc/nodes?request_id=req-7"));
    }

    #[tokio::test]
    async fn describe_keeps_only_asked_nodes() {
        let (url, _seen) = serve(vec![(
            200,
            r#"{"nodes": [
                {"NodeId": "n-1", "Name": "execute-1", "Status": "Started", "PrivateIp": "10.0.0.5"},
                {"NodeId": "n-9", "Name": "other", "Status": "Started"}
            ]}"#,
        )]);
        let nodes = client(url).describe(&["n-1".to_string()]).await.unwrap();
        assert_eq!(nodes, vec![NodeObservation::new("n-1", "Started").with_address("execute-1", "10.0.0.5")]);
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let (url, _seen) = serve(vec![
            (503, "busy"),
            (400, r#"{"error": "unknown nodearray"}"#),
            (200, "<html>maintenance</html>"),
            (200, ""),
        ]);
        let cc = client(url);
        let ids = vec!["n-1".to_string()];
        assert_eq!(cc.describe(&ids).await.unwrap_err().kind, BackendErrorKind::Transient);
        let rejected = cc.describe(&ids).await.unwrap_err();
        assert_eq!(rejected.kind, BackendErrorKind::Rejected);
        assert!(rejected.message.contains("unknown nodearray"));
        assert_eq!(cc.describe(&ids).await.unwrap_err().kind, BackendErrorKind::Unrecognized);
        assert_eq!(cc.describe(&ids).await.unwrap_err().kind, BackendErrorKind::Empty);
    }

    #[tokio::test]
    async fn launch_with_nothing_added_is_rejected() {
        let (url, _seen) = serve(vec![(200, r#"{"sets": [{"added": 0, "message": "quota exceeded"}]}"#)]);
        let template = template();
        let spec = LaunchSpec { request_id: "req-8", template: &template, count: 1, rc_account: None };
        let err = client(url).launch(spec).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Rejected);
        assert!(err.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn accepted_launch_survives_failed_listing() {
        let (url, seen) = serve(vec![
            (200, r#"{"sets": [{"added": 2}]}"#),
            (503, "busy"),
            (200, r#"{"nodes": []}"#),
            (503, "busy"),
        ]);
        let template = template();
        let spec = LaunchSpec { request_id: "req-9", template: &template, count: 2, rc_account: None };
        let launched = client(url).launch(spec).await.unwrap();
        assert_eq!(launched, Launched { accepted: 2, nodes: Vec::new() });
        assert_eq!(seen.iter().take(4).count(), 4);
    }

    #[tokio::test]
    async fn nodes_for_request_lists_by_request_id() {
        let (url, seen) = serve(vec![(200, r#"{"nodes": [{"NodeId": "n-3", "Name": "execute-3", "Status": "Allocation"}]}"#)]);
        let nodes = client(url).nodes_for_request("req-9").await.unwrap();
        let mut expected = NodeObservation::new("n-3", "Allocation");
        expected.name = "execute-3".to_string();
        assert_eq!(nodes, vec![expected]);
        let (line, _) = seen.recv().unwrap();
        assert!(line.starts_with("GET /clusters/hpc/nodes?request_id=req-9"));
    }

    #[tokio::test]
    async fn terminate_posts_ids() {
        let (url, seen) = serve(vec![(200, "")]);
        client(url).terminate(&["n-1".to_string(), "n-2".to_string()]).await.unwrap();
        let (line, body) = seen.recv().unwrap();
        assert_eq!(line, "POST /clusters/hpc/nodes/terminate HTTP/1.1");
        assert_eq!(body, r#"{"ids":["n-1","n-2"]}"#);
    }
}
