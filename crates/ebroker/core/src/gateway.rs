//! Verb dispatch for the resource manager.
//!
//! Every verb is answered with a protocol document. Input the broker refuses
//! is still recorded as a request so that later status queries agree with
//! what the verb returned.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codes::{ProvCode, Registry};
use crate::error::BrokerError;
use crate::lifecycle::{Lifecycle, PollCycle, Timeouts};
use crate::normalize::{self, NodePhase};
use crate::protocol::{
    CreateNodeInput, FailureReport, MachineReport, MachinesInput, NodeReport, NodesOutput, RequestAck,
    RequestReport, ReturnRequestsOutput, ReturnedMachine, StatusInput, StatusOutput,
    TemplatesOutput,
};
use crate::provider::{LaunchSpec, NodeProvider};
use crate::request::{Machine, NodeResult, Request, RequestKind};
use crate::store::RequestStore;
use crate::template::{Template, TemplateCatalog};

pub struct Gateway {
    provider: Box<dyn NodeProvider>,
    store: RequestStore,
    catalog: TemplateCatalog,
    timeouts: Timeouts,
    registry: &'static Registry,
}

type Refusal = (ProvCode, Option<String>);

impl Gateway {
    pub fn new(
        provider: Box<dyn NodeProvider>,
        store: RequestStore,
        catalog: TemplateCatalog,
        timeouts: Timeouts,
    ) -> Result<Self, BrokerError> {
        Ok(Gateway {
            provider,
            store,
            catalog,
            timeouts,
            registry: Registry::global()?,
        })
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    fn lifecycle(&self) -> Lifecycle<'static> {
        Lifecycle::new(self.registry)
    }

    pub async fn create_node(&self, input: CreateNodeInput) -> Result<RequestAck, BrokerError> {
        let now = Utc::now();
        let request_id = format!("req-{}", Uuid::new_v4());
        let mut request = Request::new(
            &request_id,
            RequestKind::Create,
            self.provider.backend(),
            now,
            self.timeouts.deadline(RequestKind::Create, now),
        );
        request.template_id = input.template.template_id.clone();
        request.rc_account = input.rc_account.clone();
        request.requested_count = u32::try_from(input.template.machine_count).unwrap_or(0);
        let lifecycle = self.lifecycle();

        match self.check_create(&input) {
            Err((code, detail)) => {
                info!(request = %request_id, code = %code, "create refused");
                lifecycle.attach(&mut request, code, detail, now);
            }
            Ok((template, count)) => {
                let spec = LaunchSpec {
                    request_id: &request_id,
                    template,
                    count,
                    rc_account: input.rc_account.as_deref(),
                };
                match self.provider.launch(spec).await {
                    Ok(launched) => {
                        info!(
                            request = %request_id,
                            template = %template.template_id,
                            count,
                            accepted = launched.accepted,
                            listed = launched.nodes.len(),
                            "nodes launched"
                        );
                        request.accepted_count = launched.accepted;
                        request.machines = launched
                            .nodes
                            .iter()
                            .map(|node| {
                                let mut machine = Machine::pending(&node.instance_id, now);
                                machine.name = node.name.clone();
                                machine
                            })
                            .collect();
                        if launched.accepted == 0 {
                            lifecycle.attach(&mut request, ProvCode::Empty, Some("from launch".to_string()), now);
                        }
                    }
                    Err(e) if e.outcome_unknown() => {
                        // The nodes may exist; look for them by request id.
                        warn!(request = %request_id, error = %e, "launch outcome unknown, tracking by request id");
                        request.accepted_count = count;
                        if let Some(code) = e.poll_code() {
                            lifecycle.attach(&mut request, code, Some(e.message), now);
                        }
                    }
                    Err(e) => {
                        warn!(request = %request_id, error = %e, "launch rejected");
                        lifecycle.attach(&mut request, ProvCode::RejectedByBackend, Some(e.message), now);
                    }
                }
            }
        }

        self.store.save(&request)?;
        Ok(self.ack(&request))
    }

    fn check_create<'t>(&'t self, input: &CreateNodeInput) -> Result<(&'t Template, u32), Refusal> {
        let template_id = match input.template.template_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return Err((ProvCode::BadTemplate, None)),
        };
        let count = input.template.machine_count;
        if count < 1 {
            return Err((ProvCode::BadNodeCount, Some(count.to_string())));
        }
        let template = self
            .catalog
            .find(template_id)
            .ok_or_else(|| (ProvCode::NotExistTemplate, Some(template_id.to_string())))?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        if count > template.max_number {
            return Err((
                ProvCode::BadNodeCount,
                Some(format!("{} (template {} allows at most {})", count, template_id, template.max_number)),
            ));
        }
        if template.preemptible && !self.provider.backend().supports_preemptible() {
            return Err((
                ProvCode::BadTemplate,
                Some(format!("{} (preemptible capacity is not offered by {})", template_id, self.provider.backend())),
            ));
        }
        Ok((template, count))
    }

    pub async fn get_request_status(&self, input: StatusInput) -> Result<StatusOutput, BrokerError> {
        let mut requests = Vec::with_capacity(input.requests.len());
        for r in &input.requests {
            requests.push(self.poll_request(&r.request_id).await?);
        }
        Ok(StatusOutput { requests })
    }

    async fn poll_request(&self, request_id: &str) -> Result<RequestReport, BrokerError> {
        let guard = match self.store.lock(request_id).await {
            Ok(guard) => guard,
            Err(BrokerError::Refused { .. }) => return Ok(self.unknown(request_id)),
            Err(BrokerError::LockTimeout(_)) => {
                // Another invocation is advancing this request: report the
                // last saved state without advancing it.
                warn!(request = request_id, "request busy, reporting saved state");
                return Ok(match self.store.load(request_id)? {
                    Some(request) => self.report(&request),
                    None => self.unknown(request_id),
                });
            }
            Err(e) => return Err(e),
        };
        let Some(mut request) = self.store.load(request_id)? else {
            return Ok(self.unknown(request_id));
        };

        let reclaim = if request.is_terminal() {
            request.pending_reclaim()
        } else {
            let instance_ids = request.instance_ids();
            let mut observations = if instance_ids.is_empty() {
                Ok(Vec::new())
            } else {
                self.provider.describe(&instance_ids).await
            };
            guard.refresh();
            if request.kind == RequestKind::Create && request.unlisted() > 0 {
                match self.provider.nodes_for_request(request_id).await {
                    Ok(listed) => {
                        if let Ok(observed) = observations.as_mut() {
                            let known: HashSet<String> = observed.iter().map(|o| o.instance_id.clone()).collect();
                            observed.extend(listed.into_iter().filter(|o| !known.contains(&o.instance_id)));
                        }
                    }
                    Err(e) => warn!(request = request_id, error = %e, "could not list the request's nodes"),
                }
                guard.refresh();
            }
            let notices = if request.backend.supports_preemptible() {
                let notices = self.provider.poll_termination_notices().await.unwrap_or_else(|e| {
                    warn!(request = request_id, error = %e, "could not read termination notices");
                    Vec::new()
                });
                guard.refresh();
                notices
            } else {
                Vec::new()
            };
            let transition = self.lifecycle().poll(
                &mut request,
                PollCycle { observations, notices, now: Utc::now() },
            );
            transition.reclaim
        };
        if !reclaim.is_empty() && self.reclaim(request_id, &reclaim).await {
            request.reclaimed(&reclaim);
        }
        if request.is_terminal() {
            request.observed_terminal = true;
        }
        self.store.save(&request)?;
        Ok(self.report(&request))
    }

    /// Ask the backend to terminate `instance_ids`; false when it refused.
    async fn reclaim(&self, request_id: &str, instance_ids: &[String]) -> bool {
        match self.provider.terminate(instance_ids).await {
            Ok(()) => {
                info!(request = request_id, nodes = ?instance_ids, "terminate issued");
                true
            }
            Err(e) => {
                error!(request = request_id, nodes = ?instance_ids, error = %e, "failed to reclaim nodes, will retry");
                false
            }
        }
    }

    /// Issue terminate calls still owed for nodes of finished requests. Does
    /// not count as the resource manager seeing the request.
    async fn retry_reclaims(&self) -> Result<(), BrokerError> {
        for request in self.store.list()? {
            if !request.is_terminal() || request.pending_reclaim().is_empty() {
                continue;
            }
            let _guard = match self.store.lock(&request.request_id).await {
                Ok(guard) => guard,
                Err(BrokerError::LockTimeout(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some(mut request) = self.store.load(&request.request_id)? else {
                continue;
            };
            let owed = request.pending_reclaim();
            if !owed.is_empty() && self.reclaim(&request.request_id, &owed).await {
                request.reclaimed(&owed);
                self.store.save(&request)?;
            }
        }
        Ok(())
    }

    pub async fn terminate_node(&self, input: MachinesInput) -> Result<RequestAck, BrokerError> {
        let now = Utc::now();
        let request_id = format!("ret-{}", Uuid::new_v4());
        let mut request = Request::new(
            &request_id,
            RequestKind::Terminate,
            self.provider.backend(),
            now,
            self.timeouts.deadline(RequestKind::Terminate, now),
        );
        let lifecycle = self.lifecycle();

        let mut seen = HashSet::new();
        for m in input.machines.iter().filter(|m| !m.machine_id.trim().is_empty()) {
            if seen.insert(m.machine_id.clone()) {
                let mut machine = Machine::pending(&m.machine_id, now);
                machine.name = m.name.clone();
                request.machines.push(machine);
            }
        }

        if request.machines.is_empty() {
            lifecycle.attach(&mut request, ProvCode::Empty, Some("machine list".to_string()), now);
        } else {
            let ids = request.instance_ids();
            match self.provider.terminate(&ids).await {
                Ok(()) => info!(request = %request_id, nodes = ?ids, "terminate submitted"),
                Err(e) => {
                    warn!(request = %request_id, error = %e, "terminate submission failed, will retry");
                    lifecycle.attach(&mut request, ProvCode::ErrBackendRequest, Some(e.message), now);
                }
            }
        }

        self.store.save(&request)?;
        Ok(self.ack(&request))
    }

    /// Machines the backend has taken or is about to take back.
    pub async fn get_return_requests(&self, input: MachinesInput) -> Result<ReturnRequestsOutput, BrokerError> {
        let now = Utc::now();
        let mut names: HashMap<String, String> = HashMap::new();
        if input.machines.is_empty() {
            for node in self.available_nodes()? {
                names.insert(node.machine_id, node.name);
            }
        } else {
            for m in input.machines {
                names.insert(m.machine_id, m.name);
            }
        }
        if names.is_empty() {
            return Ok(ReturnRequestsOutput::default());
        }

        let backend = self.provider.backend();
        let mut ids: Vec<String> = names.keys().cloned().collect();
        ids.sort();

        let mut grace: HashMap<String, u64> = HashMap::new();
        if backend.supports_preemptible() {
            match self.provider.poll_termination_notices().await {
                Ok(notices) => {
                    for notice in notices.iter().filter(|n| names.contains_key(&n.instance_id)) {
                        grace.insert(notice.instance_id.clone(), notice.grace_period(now).as_secs());
                    }
                }
                Err(e) => warn!(error = %e, "could not read termination notices"),
            }
        }

        let mut broken = Vec::new();
        match self.provider.describe(&ids).await {
            Ok(observed) => {
                let phases: HashMap<&str, NodePhase> = observed
                    .iter()
                    .map(|o| (o.instance_id.as_str(), normalize::phase_of(backend, &o.native_status)))
                    .collect();
                for id in &ids {
                    match phases.get(id.as_str()) {
                        None | Some(NodePhase::Released | NodePhase::Releasing) => {
                            grace.entry(id.clone()).or_insert(0);
                        }
                        Some(NodePhase::Failed) => {
                            grace.entry(id.clone()).or_insert(0);
                            broken.push(id.clone());
                        }
                        Some(_) => {}
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not describe nodes, reporting notices only"),
        }

        if !broken.is_empty() {
            // Not tied to a request; the next return query asks again.
            self.reclaim("return", &broken).await;
        }

        let requests = ids
            .into_iter()
            .filter_map(|id| {
                let grace_period = *grace.get(&id)?;
                let machine = names.get(&id).filter(|n| !n.is_empty()).cloned().unwrap_or_else(|| id.clone());
                Some(ReturnedMachine { machine, machine_id: id, grace_period })
            })
            .collect();
        Ok(ReturnRequestsOutput { requests })
    }

    pub fn get_available_templates(&self) -> TemplatesOutput {
        TemplatesOutput { templates: self.catalog.templates.clone() }
    }

    pub fn get_available_nodes(&self) -> Result<NodesOutput, BrokerError> {
        Ok(NodesOutput { nodes: self.available_nodes()? })
    }

    /// Succeeded machines of create requests that no terminate request targets.
    fn available_nodes(&self) -> Result<Vec<NodeReport>, BrokerError> {
        let requests = self.store.list()?;
        let returned: HashSet<&str> = requests
            .iter()
            .filter(|r| r.kind == RequestKind::Terminate)
            .flat_map(|r| r.machines.iter().map(|m| m.machine_id.as_str()))
            .collect();
        let nodes = requests
            .iter()
            .filter(|r| r.kind == RequestKind::Create)
            .flat_map(|r| r.machines.iter().map(move |m| (r, m)))
            .filter(|(_, m)| m.result() == NodeResult::Succeeded && !returned.contains(m.machine_id.as_str()))
            .map(|(r, m)| NodeReport {
                machine_id: m.machine_id.clone(),
                name: m.name.clone(),
                request_id: r.request_id.clone(),
                template_id: r.template_id.clone(),
                private_ip_address: m.private_ip.clone(),
                launch_time: m.launched_at.timestamp(),
            })
            .collect();
        Ok(nodes)
    }

    pub fn list_requests(&self) -> Result<Vec<Request>, BrokerError> {
        self.store.list()
    }

    /// Retry owed terminate calls, then delete observed terminal requests
    /// past retention. Returns the removed ids.
    pub async fn collect_garbage(&self) -> Result<Vec<String>, BrokerError> {
        self.retry_reclaims().await?;
        self.store.collect_garbage(Utc::now(), self.timeouts.retention)
    }

    /// Protocol document for a failure that kept a verb from running.
    pub fn failure(&self, err: &BrokerError) -> FailureReport {
        let code = err.code();
        FailureReport {
            status: self.registry.severity(code).status(),
            code,
            message: self.registry.message(code, Some(&err.detail())),
        }
    }

    fn ack(&self, request: &Request) -> RequestAck {
        RequestAck {
            request_id: request.request_id.clone(),
            status: request.status(),
            message: self.lifecycle().message(request),
        }
    }

    fn unknown(&self, request_id: &str) -> RequestReport {
        debug!(request = request_id, "status asked for an unknown request");
        let code = ProvCode::UnsupportedReq;
        RequestReport {
            request_id: request_id.to_string(),
            status: self.registry.severity(code).status(),
            message: self.registry.message(code, Some(request_id)),
            code: Some(code),
            machines: Vec::new(),
        }
    }

    fn report(&self, request: &Request) -> RequestReport {
        RequestReport {
            request_id: request.request_id.clone(),
            status: request.status(),
            message: self.lifecycle().message(request),
            code: request.decisive_code().map(|c| c.code),
            machines: request
                .machines
                .iter()
                .map(|m| MachineReport {
                    machine_id: m.machine_id.clone(),
                    name: m.name.clone(),
                    result: m.result(),
                    status: m.native_status.clone(),
                    private_ip_address: m.private_ip.clone(),
                    launch_time: m.launched_at.timestamp(),
                    message: m.message.clone(),
                })
                .collect(),
        }
    }
}
