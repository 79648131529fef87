//! One provider agent process and the pipe to it.
//!
//! Writes to the agent are serialized by the container's agent lock. Every
//! request gets a fresh correlation id and an entry in the outstanding table
//! before it is written; a reader task per running agent matches responses
//! back to those entries and reports them through the router callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agent_protocol::channel::{ChannelError, FrameReader, FrameWriter};
use agent_protocol::message::{
    Bitness, CimErrorCode, CimException, CimRequest, CimResponse, ClassRequest, ClassResponse,
    IndicationResponse, InitializeAgent, OperationalStatus, ProviderModule, RequestKind,
    ResponseBody, UserContext,
};
use agent_protocol::wire::{AgentMessage, Outbound};
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::ResponseAggregator;
use crate::context::RouterContext;
use crate::error::RouterError;
use crate::executor::AgentLaunch;
use crate::logger::EVENT_TARGET;
use crate::outstanding::{OutstandingEntry, OutstandingRequestTable};

/// Outcome of one attempt to hand a request to the agent.
pub(crate) enum Dispatch {
    Delivered(CimResponse),
    /// The request never reached the agent and may be sent again.
    NotProcessed,
}

/// Everything guarded by the agent lock.
#[derive(Default)]
struct AgentState {
    writer: Option<FrameWriter>,
    pid: Option<u32>,
    /// Last module sent on the current pipe.
    module_cache: Option<ProviderModule>,
    /// Bumped on every initialization; a reader only tears down its own pipe.
    generation: u64,
    initialized: bool,
}

pub struct AgentContainer {
    agent_name: String,
    module_or_group: String,
    is_group: bool,
    user: String,
    user_context: UserContext,
    bitness: Bitness,
    ctx: Arc<RouterContext>,
    agent: Mutex<AgentState>,
    initialized: AtomicBool,
    outstanding: OutstandingRequestTable,
}

impl AgentContainer {
    /// Creates an idle container. No process is started until the first
    /// request arrives.
    pub fn new(
        module: &ProviderModule,
        user: impl Into<String>,
        user_context: UserContext,
        ctx: Arc<RouterContext>,
    ) -> Self {
        Self {
            agent_name: module.agent_name(),
            module_or_group: module.group_or_module().to_string(),
            is_group: module.is_grouped(),
            user: user.into(),
            user_context,
            bitness: module.bitness,
            ctx,
            agent: Mutex::new(AgentState::default()),
            initialized: AtomicBool::new(false),
            outstanding: OutstandingRequestTable::new(),
        }
    }

    /// `grp:<group>` or `mod:<module>`.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn module_or_group(&self) -> &str {
        &self.module_or_group
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.agent.lock().await.pid
    }

    /// Sends `request` to the agent, starting it first if needed.
    ///
    /// Returns a pending response once the request is written; the result
    /// follows through `RouterCallbacks::on_async_response`. With an
    /// `aggregator` the result is only delivered once every agent of the
    /// fan-out has answered. Failures come back as responses carrying an
    /// error, never as `Err`.
    pub async fn process_message(
        self: &Arc<Self>,
        request: Arc<CimRequest>,
        aggregator: Option<Arc<ResponseAggregator>>,
    ) -> CimResponse {
        let mut attempt: u32 = 0;
        loop {
            if let Dispatch::Delivered(response) = self.dispatch(&request, aggregator.as_ref()).await {
                return response;
            }
            match request.kind() {
                RequestKind::StopAllProviders
                | RequestKind::NotifyConfigChange
                | RequestKind::SubscriptionInitComplete
                | RequestKind::IndicationServiceDisabled
                | RequestKind::DeleteSubscription
                | RequestKind::DisableModule => {
                    return self.settle_unprocessed(&request, aggregator.as_ref()).await;
                }
                _ => {
                    attempt += 1;
                    self.ctx.metrics.requests_retried.add(1, &[]);
                    debug!(agent = %self.agent_name, message_id = %request.message_id, attempt, "request not processed, retrying");
                    retry_pause(attempt).await;
                }
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        request: &Arc<CimRequest>,
        aggregator: Option<&Arc<ResponseAggregator>>,
    ) -> Dispatch {
        let mut agent = self.agent.lock().await;

        // 1) after stop-all only stop-all gets through
        if self.ctx.all_providers_stopped() && request.kind() != RequestKind::StopAllProviders {
            drop(agent);
            let error = CimException::from(RouterError::ShuttingDown);
            return Dispatch::Delivered(self.fail_request(request, aggregator, error).await);
        }

        // 2) lazy start
        if !agent.initialized {
            if let Err(err) = self.initialize(&mut agent).await {
                drop(agent);
                warn!(agent = %self.agent_name, user = %self.user, "{err}");
                return Dispatch::Delivered(self.fail_request(request, aggregator, err.into()).await);
            }
        }

        // 3) the entry must exist before the agent can possibly answer
        let local_id = self.register(request, aggregator);

        // 4) the agent still holds an identical module from the last request
        let module = request.provider_module();
        let elide = module.is_some() && module == agent.module_cache.as_ref();

        let result = match agent.writer.as_mut() {
            Some(writer) => writer.write_message(&Outbound::request(request, &local_id, elide)).await,
            None => Err(ChannelError::Closed),
        };

        match result {
            Ok(()) => {
                if !elide && module.is_some() {
                    agent.module_cache = module.cloned();
                }
                drop(agent);
                self.ctx.metrics.requests_dispatched.add(1, &[]);
                debug!(
                    agent = %self.agent_name,
                    message_id = %request.message_id,
                    local_id = %local_id,
                    elided = elide,
                    "request sent to agent"
                );
                let mut response = request.build_response();
                response.async_pending = true;
                Dispatch::Delivered(response)
            }
            // the pipe is intact but this request can never be sent
            Err(err) if !err.is_disconnect() => {
                self.outstanding.remove(&local_id);
                drop(agent);
                warn!(agent = %self.agent_name, message_id = %request.message_id, "request cannot be sent: {err}");
                let error = CimException::failed(format!("cannot send request to provider agent: {err}"));
                Dispatch::Delivered(self.fail_request(request, aggregator, error).await)
            }
            Err(err) => {
                self.outstanding.remove(&local_id);
                warn!(agent = %self.agent_name, message_id = %request.message_id, "write to agent failed: {err}");
                Dispatch::NotProcessed
            }
        }
    }

    fn register(&self, request: &Arc<CimRequest>, aggregator: Option<&Arc<ResponseAggregator>>) -> String {
        loop {
            let local_id = Uuid::new_v4().to_string();
            let entry = OutstandingEntry {
                original_id: request.message_id.clone(),
                request: Arc::clone(request),
                aggregator: aggregator.cloned(),
            };
            if self.outstanding.insert(local_id.clone(), entry) {
                return local_id;
            }
        }
    }

    /// Answer for a request that was never processed and must not be
    /// retried.
    async fn settle_unprocessed(
        &self,
        request: &Arc<CimRequest>,
        aggregator: Option<&Arc<ResponseAggregator>>,
    ) -> CimResponse {
        let mut response = request.build_response();
        if request.kind() == RequestKind::DisableModule {
            response.body = ResponseBody::ModuleStatus(vec![OperationalStatus::Stopped]);
        }
        self.settle(request, aggregator, response).await
    }

    async fn fail_request(
        &self,
        request: &Arc<CimRequest>,
        aggregator: Option<&Arc<ResponseAggregator>>,
        error: CimException,
    ) -> CimResponse {
        let response = request.build_response().with_error(error);
        self.settle(request, aggregator, response).await
    }

    /// A response produced here instead of by the agent. Part of a fan-out,
    /// it counts as this agent's outcome and is marked pending; the
    /// aggregate goes out through the callback once complete.
    async fn settle(
        &self,
        request: &Arc<CimRequest>,
        aggregator: Option<&Arc<ResponseAggregator>>,
        mut response: CimResponse,
    ) -> CimResponse {
        let Some(aggregator) = aggregator else {
            return response;
        };
        if aggregator.is_complete(response.error.as_ref()) {
            let mut aggregate = response.clone();
            aggregate.error = aggregator.exception();
            self.ctx.callbacks.on_async_response(request, aggregate).await;
        }
        response.async_pending = true;
        response
    }

    async fn initialize(self: &Arc<Self>, agent: &mut AgentState) -> Result<(), RouterError> {
        let max = self.ctx.config.max_provider_processes().await;
        if !self.ctx.processes().try_acquire(max) {
            return Err(RouterError::MaxProcessesReached(max));
        }

        let (pid, reader, writer) = match self.start_agent().await {
            Ok(started) => started,
            Err(err) => {
                self.ctx.processes().release();
                self.ctx.metrics.agents_failed.add(1, &[]);
                return Err(err);
            }
        };

        agent.generation += 1;
        agent.writer = Some(writer);
        agent.pid = Some(pid);
        agent.module_cache = None;
        agent.initialized = true;
        self.initialized.store(true, Ordering::SeqCst);

        let generation = agent.generation;
        let container = Arc::clone(self);
        tokio::spawn(async move { container.read_responses(reader, generation).await });

        self.ctx.metrics.agents_started.add(1, &[]);
        info!(
            target: EVENT_TARGET,
            agent = %self.agent_name,
            user = %self.user,
            pid,
            "provider agent started"
        );
        Ok(())
    }

    async fn start_agent(&self) -> Result<(u32, FrameReader, FrameWriter), RouterError> {
        let launch = AgentLaunch {
            bitness: self.bitness,
            module_or_group: self.module_or_group.clone(),
            home: self.ctx.config.home().await,
            user: self.user.clone(),
            user_context: self.user_context,
        };
        let process = self.ctx.executor.start_provider_agent(&launch).await.map_err(|err| {
            RouterError::AgentStartFailed { name: self.module_or_group.clone(), reason: format!("{err:#}") }
        })?;
        let pid = process.pid;
        let mut reader = FrameReader::new(process.reader);
        let mut writer = FrameWriter::new(process.writer);

        let init = InitializeAgent {
            home: launch.home,
            config_properties: self.ctx.config.non_default_properties().await,
            bind_verbose: self.ctx.settings.bind_verbose,
            subscription_init_complete: self.ctx.subscription_init_complete(),
        };
        if let Err(reason) = handshake(&mut reader, &mut writer, init).await {
            drop(reader);
            drop(writer);
            self.ctx.executor.reap_provider_agent(pid).await;
            return Err(RouterError::Handshake { name: self.module_or_group.clone(), reason });
        }
        Ok((pid, reader, writer))
    }

    /// Stops the agent if it is running. A clean shutdown retries in-flight
    /// requests on a new agent; an unclean one fails them and reports the
    /// module or group as failed. Calling it on a stopped container does
    /// nothing.
    pub async fn uninitialize(self: &Arc<Self>, clean_shutdown: bool) {
        self.teardown(clean_shutdown, None).await;
    }

    async fn teardown(self: &Arc<Self>, clean: bool, generation: Option<u64>) {
        // 1) close the pipe and take everything in flight on it
        let (pid, entries) = {
            let mut agent = self.agent.lock().await;
            if !agent.initialized || generation.is_some_and(|g| g != agent.generation) {
                return;
            }
            if let Some(mut writer) = agent.writer.take() {
                let _ = writer.close().await;
            }
            agent.module_cache = None;
            agent.initialized = false;
            self.initialized.store(false, Ordering::SeqCst);
            self.ctx.processes().release();
            (agent.pid.take(), self.outstanding.drain())
        };

        self.ctx.metrics.agent_exits.add(1, &[KeyValue::new("clean", clean)]);
        info!(
            target: EVENT_TARGET,
            agent = %self.agent_name,
            user = %self.user,
            clean,
            in_flight = entries.len(),
            "provider agent stopped"
        );

        // 2) decide the fate of each request
        let lost = (!clean).then(|| CimException::from(RouterError::LostConnection(self.module_or_group.clone())));
        let mut completed = Vec::new();
        let mut retries = Vec::new();
        for entry in entries {
            let kind = entry.request.kind();
            match (entry.aggregator.clone(), kind) {
                (Some(aggregator), _) if kind.is_aggregated() => {
                    if !aggregator.is_complete(lost.as_ref()) {
                        continue;
                    }
                    let merged = aggregator.exception();
                    if merged.is_none() && matches!(kind, RequestKind::EnableModule | RequestKind::DisableModule) {
                        retries.push(entry);
                    } else {
                        let mut response = entry.request.build_response();
                        response.error = merged;
                        completed.push((entry, response));
                    }
                }
                (_, RequestKind::DeleteSubscription) => {
                    let response = entry.request.build_response();
                    completed.push((entry, response));
                }
                _ if clean => retries.push(entry),
                _ => {
                    let mut response = entry.request.build_response();
                    response.error = lost.clone();
                    completed.push((entry, response));
                }
            }
        }

        // 3) deliver, outside every lock
        for (entry, response) in completed {
            self.ctx.callbacks.on_async_response(&entry.request, response).await;
        }
        if !retries.is_empty() {
            self.schedule_retries(retries).await;
        }
        if !clean {
            self.ctx
                .callbacks
                .on_module_group_failure(&self.module_or_group, &self.user, self.user_context, self.is_group)
                .await;
        }
        if let Some(pid) = pid {
            self.ctx.executor.reap_provider_agent(pid).await;
        }
    }

    async fn schedule_retries(self: &Arc<Self>, retries: Vec<OutstandingEntry>) {
        match Handle::try_current() {
            Ok(handle) => {
                debug!(agent = %self.agent_name, count = retries.len(), "retrying requests on a new agent");
                handle.spawn(Arc::clone(self).retry_requests(retries));
            }
            Err(err) => {
                error!(agent = %self.agent_name, "cannot schedule retries: {err}");
                let error = CimException::from(RouterError::ThreadAllocation(self.module_or_group.clone()));
                for entry in retries {
                    let response = entry.request.build_response().with_error(error.clone());
                    self.ctx.callbacks.on_async_response(&entry.request, response).await;
                }
            }
        }
    }

    // Boxed so the future type does not refer back to itself through
    // process_message.
    fn retry_requests(self: Arc<Self>, retries: Vec<OutstandingEntry>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            for entry in retries {
                let response = self.process_message(Arc::clone(&entry.request), None).await;
                if !response.async_pending {
                    self.ctx.callbacks.on_async_response(&entry.request, response).await;
                }
            }
        })
    }

    async fn read_responses(self: Arc<Self>, mut reader: FrameReader, generation: u64) {
        let clean = loop {
            match reader.read_message::<AgentMessage>().await {
                Ok(None) => break true,
                Ok(Some(AgentMessage::Response(response))) => self.handle_response(response).await,
                Ok(Some(AgentMessage::ProcessIndication(mut indication))) => {
                    indication.oop_agent_name = Some(self.agent_name.clone());
                    self.ctx.callbacks.on_indication(indication).await;
                }
                Ok(Some(AgentMessage::GetClass(request))) => {
                    self.answer_class_request(request, generation).await;
                }
                Ok(Some(other)) => {
                    warn!(agent = %self.agent_name, "unexpected message from agent: {other:?}");
                }
                Err(ChannelError::Codec(err)) => {
                    warn!(agent = %self.agent_name, "ignoring malformed frame: {err}");
                }
                Err(ChannelError::Closed) => break false,
                Err(err) => {
                    warn!(agent = %self.agent_name, "agent pipe failed: {err}");
                    break false;
                }
            }
        };
        debug!(agent = %self.agent_name, clean, "agent reader finished");
        self.teardown(clean, Some(generation)).await;
    }

    async fn handle_response(&self, mut response: CimResponse) {
        // intermediate chunks leave the entry in place
        if !response.complete {
            let Some(entry) = self.outstanding.get(&response.message_id) else {
                self.discard(&response);
                return;
            };
            response.message_id = entry.original_id.clone();
            self.ctx.callbacks.on_response_chunk(&entry.request, response).await;
            return;
        }

        let Some(entry) = self.outstanding.remove(&response.message_id) else {
            self.discard(&response);
            return;
        };
        response.message_id = entry.original_id.clone();
        if let Some(aggregator) = &entry.aggregator {
            if !aggregator.is_complete(response.error.as_ref()) {
                return;
            }
            response.error = aggregator.exception();
        }

        // the dispatching caller returns its pending response first
        drop(self.agent.lock().await);
        self.ctx.callbacks.on_async_response(&entry.request, response).await;
    }

    fn discard(&self, response: &CimResponse) {
        self.ctx.metrics.responses_discarded.add(1, &[]);
        debug!(agent = %self.agent_name, message_id = %response.message_id, "no outstanding request for response, discarding");
    }

    async fn answer_class_request(&self, request: ClassRequest, generation: u64) {
        let class = self.ctx.callbacks.lookup_class(&request.namespace, &request.class_name).await;
        let error = class.is_none().then(|| {
            CimException::new(
                CimErrorCode::NotFound,
                format!("class {}:{} not found", request.namespace, request.class_name),
            )
        });
        let reply = AgentMessage::ClassResponse(ClassResponse { message_id: request.message_id, class, error });

        let mut agent = self.agent.lock().await;
        if agent.generation != generation {
            return;
        }
        if let Some(writer) = agent.writer.as_mut() {
            if let Err(err) = writer.write_message(&reply).await {
                warn!(agent = %self.agent_name, "failed to answer class request: {err}");
            }
        }
    }

    /// Forwards the server's answer to an indication this agent produced.
    pub async fn send_indication_response(&self, response: &IndicationResponse) {
        let mut agent = self.agent.lock().await;
        if let Some(writer) = agent.writer.as_mut() {
            let message = AgentMessage::IndicationResponse(response.clone());
            if let Err(err) = writer.write_message(&message).await {
                warn!(agent = %self.agent_name, "failed to forward indication response: {err}");
            }
        }
    }

    /// Wakes the agent with a null frame so it can unload idle providers.
    pub async fn unload_idle_providers(&self) {
        let mut agent = self.agent.lock().await;
        if !agent.initialized {
            return;
        }
        if let Some(writer) = agent.writer.as_mut() {
            if let Err(err) = writer.write_null().await {
                debug!(agent = %self.agent_name, "idle ping not delivered: {err}");
            }
        }
    }

    /// Completes and forgets requests whose client connection has gone.
    /// Internal pull requests and fan-out requests are left alone.
    pub async fn clean_disconnected_client_requests(&self) {
        let connections = &self.ctx.connections;
        let stale = self.outstanding.remove_where(|entry| {
            !entry.request.internal_operation
                && entry.aggregator.is_none()
                && entry.request.client_queue().is_some_and(|queue| !connections.is_client_active(queue))
        });
        for entry in stale {
            info!(agent = %self.agent_name, message_id = %entry.original_id, "client disconnected, completing request");
            let response = entry.request.build_response();
            self.ctx.callbacks.on_async_response(&entry.request, response).await;
        }
    }

    /// Fails internal pull requests that belong to enumeration context
    /// `context_id`.
    pub async fn clean_closed_pull_requests(&self, context_id: &str) {
        let closed = self
            .outstanding
            .remove_where(|entry| entry.request.internal_operation && entry.original_id == context_id);
        for entry in closed {
            info!(agent = %self.agent_name, context_id, "enumeration context closed, completing request");
            let response = entry.request.build_response().with_error(RouterError::ProviderTimeout.into());
            self.ctx.callbacks.on_async_response(&entry.request, response).await;
        }
    }
}

impl std::fmt::Debug for AgentContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContainer")
            .field("agent_name", &self.agent_name)
            .field("user", &self.user)
            .field("initialized", &self.is_initialized())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

async fn handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    init: InitializeAgent,
) -> Result<(), String> {
    writer
        .write_message(&AgentMessage::InitializeAgent(init))
        .await
        .map_err(|err| err.to_string())?;
    match reader.read_message::<AgentMessage>().await {
        Ok(None) => Ok(()),
        Ok(Some(_)) => Err("agent answered the handshake with a message instead of a null frame".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

/// Yield for the first few retries so the reader can observe a dead pipe,
/// then back off.
async fn retry_pause(attempt: u32) {
    if attempt <= 3 {
        tokio::task::yield_now().await;
    } else {
        sleep(Duration::from_millis(10 * u64::from(attempt.min(20)))).await;
    }
}
