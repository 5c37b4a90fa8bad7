//! Request state machine.
//!
//! `RUNNING` moves to `COMPLETE`, `COMPLETE_WITH_ERROR` or `ERROR` (terminal)
//! and may pass through `WARNING` on the way. Status only ever moves up
//! [`RequestStatus::rank`]; once terminal a request is never touched again.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::codes::{ProvCode, Registry};
use crate::error::BackendError;
use crate::normalize::{self, Backend, NodeObservation, NodePhase};
use crate::request::{AttachedCode, Machine, NodeResult, Request, RequestKind, RequestStatus};
use crate::spot::TerminationNotice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request_validity: Duration,
    pub creation: Duration,
    pub termination: Duration,
    /// How long an observed terminal request is kept before collection.
    pub retention: Duration,
}

impl Timeouts {
    pub fn for_backend(backend: Backend) -> Self {
        Timeouts {
            request_validity: Duration::from_secs(30 * 60),
            creation: backend.default_creation_timeout(),
            termination: backend.default_termination_timeout(),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// The earlier of the validity window and the backend timeout for `kind`.
    pub fn deadline(&self, kind: RequestKind, created_at: DateTime<Utc>) -> DateTime<Utc> {
        let backend_limit = match kind {
            RequestKind::Create => self.creation,
            RequestKind::Terminate => self.termination,
        };
        let window = self.request_validity.min(backend_limit);
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|delta| created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Everything one status poll learned from the backend.
#[derive(Debug)]
pub struct PollCycle {
    pub observations: Result<Vec<NodeObservation>, BackendError>,
    pub notices: Vec<TerminationNotice>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: RequestStatus,
    pub to: RequestStatus,
    /// Instances the gateway should ask the backend to terminate.
    pub reclaim: Vec<String>,
}

impl Transition {
    fn unchanged(status: RequestStatus) -> Self {
        Transition { from: status, to: status, reclaim: Vec::new() }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct Lifecycle<'r> {
    registry: &'r Registry,
}

impl<'r> Lifecycle<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Lifecycle { registry }
    }

    /// Attach a code outside a poll, e.g. when a verb refuses its input.
    pub fn attach(
        &self,
        request: &mut Request,
        code: ProvCode,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = request.status;
        if request.is_terminal() {
            return Transition::unchanged(from);
        }
        let to = self.settle(request, vec![AttachedCode { code, detail, attached_at: now }]);
        Transition { from, to, reclaim: Vec::new() }
    }

    pub fn poll(&self, request: &mut Request, cycle: PollCycle) -> Transition {
        let from = request.status;
        if request.is_terminal() {
            debug!(request = %request.request_id, status = %from, "request already terminal");
            let mut unchanged = Transition::unchanged(from);
            unchanged.reclaim = request.pending_reclaim();
            return unchanged;
        }
        let kind = request.kind;
        let now = cycle.now;
        let before: HashMap<String, NodeResult> = request
            .machines
            .iter()
            .map(|m| (m.machine_id.clone(), m.result))
            .collect();
        let mut attached = Vec::new();

        match cycle.observations {
            Ok(observed) => self.observe(request, &observed, now),
            Err(e) => match e.poll_code() {
                None => debug!(request = %request.request_id, error = %e, "backend query failed, retrying next poll"),
                Some(code) => attached.push(AttachedCode { code, detail: Some(e.message), attached_at: now }),
            },
        }

        for notice in &cycle.notices {
            let Some(machine) = request.machines.iter_mut().find(|m| m.machine_id == notice.instance_id) else {
                continue;
            };
            let reason = notice.reason();
            if machine.reason != Some(reason) {
                info!(
                    request = %request.request_id,
                    machine = %machine.machine_id,
                    reason = %reason,
                    "machine reclaimed by provider"
                );
            }
            // Past the notice period the instance is gone, listed or not.
            if notice.lapsed(now) {
                let last = machine.native_status.clone();
                machine.apply(&last, normalize::vanished(kind));
            }
            machine.reason = Some(reason);
            machine.result = normalize::preempted(kind, machine.result);
            machine.message = format!("reclaimed by provider: {}", reason);
        }

        let unlisted = request.unlisted();
        if now >= request.valid_until && (request.count(NodeResult::Executing) > 0 || unlisted > 0) {
            let mut late = Vec::new();
            for machine in request.machines.iter_mut().filter(|m| m.result == NodeResult::Executing) {
                machine.result = normalize::expired(machine.result);
                machine.message = "timed out".to_string();
                late.push(machine.machine_id.clone());
            }
            if unlisted > 0 {
                late.push(format!("{} never listed", unlisted));
            }
            let code = match kind {
                RequestKind::Create => ProvCode::CreationTimeout,
                RequestKind::Terminate => ProvCode::TerminationTimeout,
            };
            attached.push(AttachedCode { code, detail: Some(late.join(",")), attached_at: now });
        }

        if request.count(NodeResult::Executing) == 0 && unlisted == 0 {
            attached.push(self.resolve(request, now));
        }

        let to = self.settle(request, attached);
        let reclaim = mark_reclaimable(request, &before);
        if from != to {
            info!(
                request = %request.request_id,
                from = %from,
                to = %to,
                succeeded = request.count(NodeResult::Succeeded),
                failed = request.count(NodeResult::Failed),
                "request status changed"
            );
        }
        Transition { from, to, reclaim }
    }

    /// Message for the request's current status.
    pub fn message(&self, request: &Request) -> String {
        match &request.decisive {
            Some(c) => self.registry.message(c.code, c.detail.as_deref()),
            None => String::new(),
        }
    }

    fn observe(&self, request: &mut Request, observed: &[NodeObservation], now: DateTime<Utc>) {
        let by_id: HashMap<&str, &NodeObservation> =
            observed.iter().map(|o| (o.instance_id.as_str(), o)).collect();
        let (kind, backend) = (request.kind, request.backend);

        // Nodes of a create request that the backend listed after launch.
        if kind == RequestKind::Create {
            for obs in observed {
                if request.machine(&obs.instance_id).is_none() {
                    info!(request = %request.request_id, machine = %obs.instance_id, "tracking node listed after launch");
                    let mut machine = Machine::pending(&obs.instance_id, now);
                    machine.name = obs.name.clone();
                    request.machines.push(machine);
                }
            }
        }

        for machine in &mut request.machines {
            match by_id.get(machine.machine_id.as_str()) {
                Some(obs) => {
                    let normalized = normalize::normalize_for(backend, kind, &obs.native_status, obs.reachable());
                    if !obs.name.is_empty() {
                        machine.name = obs.name.clone();
                    }
                    if obs.private_ip.is_some() {
                        machine.private_ip = obs.private_ip.clone();
                    }
                    machine.gone = false;
                    machine.apply(&obs.native_status, normalized);
                }
                None => {
                    let last = machine.native_status.clone();
                    machine.gone = true;
                    machine.apply(&last, normalize::vanished(kind));
                }
            }
            if machine.reason.is_some() {
                machine.result = normalize::preempted(kind, machine.result);
            }
            debug!(
                request = %request.request_id,
                machine = %machine.machine_id,
                native = %machine.native_status,
                result = machine.result.as_str(),
                "machine observed"
            );
        }
    }

    /// Code describing a request whose machines have all settled.
    fn resolve(&self, request: &Request, now: DateTime<Utc>) -> AttachedCode {
        let attach = |code, detail| AttachedCode { code, detail, attached_at: now };
        if request.kind == RequestKind::Create {
            if request.machines.is_empty() {
                return attach(ProvCode::NotExistNode, Some(request.request_id.clone()));
            }
            if request.machines.iter().all(|m| m.gone) {
                return attach(ProvCode::NotExistNode, Some(request.instance_ids().join(",")));
            }
        }
        let mut failed: Vec<String> = request
            .machines
            .iter()
            .filter(|m| m.result == NodeResult::Failed || m.reason.is_some())
            .map(|m| m.machine_id.clone())
            .collect();
        let tracked = u32::try_from(request.machines.len()).unwrap_or(u32::MAX);
        if request.kind == RequestKind::Create && tracked < request.requested_count {
            failed.push(format!("({} of {} requested were accepted)", tracked, request.requested_count));
        }
        match (failed.is_empty(), request.kind) {
            (true, _) => attach(ProvCode::Ok, None),
            (false, RequestKind::Create) => attach(ProvCode::ErrNodeCreation, Some(failed.join(","))),
            (false, RequestKind::Terminate) => attach(ProvCode::ErrNodeTermination, Some(failed.join(","))),
        }
    }

    /// Record codes and move the status to the highest one they drive. Among
    /// codes of equal rank the earliest attached is decisive.
    fn settle(&self, request: &mut Request, codes: Vec<AttachedCode>) -> RequestStatus {
        let mut best: Option<(RequestStatus, &AttachedCode)> = None;
        for code in &codes {
            let status = self.registry.severity(code.code).status();
            if best.is_none_or(|(s, _)| status.rank() > s.rank()) {
                best = Some((status, code));
            }
        }
        if let Some((status, code)) = best {
            if status.rank() > request.status.rank() {
                request.status = status;
                request.decisive = Some(code.clone());
            }
        }
        request.codes.extend(codes);
        request.status
    }
}

/// Instances the gateway should ask the backend to terminate after this poll.
fn mark_reclaimable(request: &mut Request, before: &HashMap<String, NodeResult>) -> Vec<String> {
    match request.kind {
        // Nodes that failed or expired in this poll but still exist stay
        // owed a terminate call until the backend accepts one.
        RequestKind::Create => {
            for machine in request.machines.iter_mut() {
                let newly_failed = machine.result == NodeResult::Failed
                    && before.get(&machine.machine_id) != Some(&NodeResult::Failed);
                if newly_failed
                    && machine.reason.is_none()
                    && !machine.gone
                    && machine.phase != Some(NodePhase::Released)
                {
                    machine.reclaim_pending = true;
                }
            }
            request.pending_reclaim()
        }
        // Nodes not yet on their way out get the terminate call again.
        RequestKind::Terminate if !request.is_terminal() => request
            .machines
            .iter()
            .filter(|m| {
                matches!(
                    m.phase,
                    Some(NodePhase::Failed | NodePhase::Ready | NodePhase::Provisioning)
                )
            })
            .map(|m| m.machine_id.clone())
            .collect(),
        RequestKind::Terminate => Vec::new(),
    }
}
