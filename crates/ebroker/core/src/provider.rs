use async_trait::async_trait;

use crate::error::BackendError;
use crate::normalize::{Backend, NodeObservation};
use crate::spot::TerminationNotice;
use crate::template::Template;

/// What the gateway asks a backend to create.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub request_id: &'a str,
    pub template: &'a Template,
    pub count: u32,
    /// Resource-manager account the nodes are billed to, tagged on each node.
    pub rc_account: Option<&'a str>,
}

/// Outcome of a create call the backend accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Launched {
    /// Nodes the backend agreed to create.
    pub accepted: u32,
    /// Those of them already listed. The rest are found later through
    /// [`NodeProvider::nodes_for_request`].
    pub nodes: Vec<NodeObservation>,
}

/// Client for one backend's native API.
///
/// Implementations report raw native statuses only; normalization happens in
/// the lifecycle. Errors are classified by [`BackendError::kind`] so the
/// lifecycle can tell a throttled call from a refused one.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    fn backend(&self) -> Backend;

    /// Submit the nodes of `spec`. `Err` means nothing was created; once the
    /// backend has accepted the submission this returns `Ok`, even when the
    /// new nodes cannot be listed yet.
    async fn launch(&self, spec: LaunchSpec<'_>) -> Result<Launched, BackendError>;

    /// Current native status of the given instances. Instances the backend no
    /// longer knows are left out of the result.
    async fn describe(&self, instance_ids: &[String]) -> Result<Vec<NodeObservation>, BackendError>;

    /// Every node the backend created for `request_id`.
    async fn nodes_for_request(&self, request_id: &str) -> Result<Vec<NodeObservation>, BackendError>;

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), BackendError>;

    /// Pending reclaim notices for preemptible capacity.
    async fn poll_termination_notices(&self) -> Result<Vec<TerminationNotice>, BackendError> {
        Ok(Vec::new())
    }
}
