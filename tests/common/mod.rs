#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use agent_protocol::channel::{FrameReader, FrameWriter};
use agent_protocol::message::{
    CimException, CimRequest, CimResponse, IndicationRequest, IndicationResponse, InitializeAgent,
    OperationalStatus, ProviderId, ProviderModule, RequestBody, ResponseBody, UserContext,
};
use agent_protocol::{AgentHandler, AgentMessage, Responder};
use agent_router::callbacks::{ConnectionMonitor, RouterCallbacks};
use agent_router::config::{ConfigManager, MapConfigManager};
use agent_router::context::RouterContext;
use agent_router::executor::{AgentLaunch, AgentProcess, Executor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::duplex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn module(name: &str) -> ProviderModule {
    ProviderModule::new(name)
}

pub fn operation(id: &str, module: &ProviderModule, payload: Value) -> CimRequest {
    CimRequest::operation(id, "invokeMethod", payload).with_provider(ProviderId::new(module.clone(), "Provider"))
}

pub fn config() -> ConfigManager {
    ConfigManager(MapConfigManager::new())
}

#[derive(Debug, Clone)]
pub enum Event {
    Indication(IndicationRequest),
    Chunk { request: CimRequest, response: CimResponse },
    Failure { module_or_group: String, user: String, user_context: UserContext, is_group: bool },
    Response { request: CimRequest, response: CimResponse },
}

impl Event {
    pub fn into_response(self) -> (CimRequest, CimResponse) {
        match self {
            Event::Response { request, response } => (request, response),
            other => panic!("expected a response, got {other:?}"),
        }
    }
}

pub struct RecordingCallbacks {
    events: UnboundedSender<Event>,
    classes: Mutex<HashMap<(String, String), Value>>,
}

impl RecordingCallbacks {
    pub fn new() -> (Arc<Self>, Events) {
        let (events, rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(Self { events, classes: Mutex::new(HashMap::new()) });
        (callbacks, Events { rx, skipped: Vec::new() })
    }

    pub fn add_class(&self, namespace: &str, class_name: &str, class: Value) {
        self.classes.lock().insert((namespace.to_string(), class_name.to_string()), class);
    }
}

#[async_trait]
impl RouterCallbacks for RecordingCallbacks {
    async fn on_indication(&self, indication: IndicationRequest) {
        let _ = self.events.send(Event::Indication(indication));
    }

    async fn on_response_chunk(&self, request: &CimRequest, response: CimResponse) {
        let _ = self.events.send(Event::Chunk { request: request.clone(), response });
    }

    async fn on_module_group_failure(
        &self,
        module_or_group: &str,
        user: &str,
        user_context: UserContext,
        is_group: bool,
    ) {
        let _ = self.events.send(Event::Failure {
            module_or_group: module_or_group.to_string(),
            user: user.to_string(),
            user_context,
            is_group,
        });
    }

    async fn on_async_response(&self, request: &CimRequest, response: CimResponse) {
        let _ = self.events.send(Event::Response { request: request.clone(), response });
    }

    async fn lookup_class(&self, namespace: &str, class_name: &str) -> Option<Value> {
        self.classes.lock().get(&(namespace.to_string(), class_name.to_string())).cloned()
    }
}

/// Receiving end of [`RecordingCallbacks`]. Events passed over while waiting
/// for a specific kind are kept and matched by later waits.
pub struct Events {
    rx: UnboundedReceiver<Event>,
    skipped: Vec<Event>,
}

impl Events {
    pub async fn next(&mut self) -> Event {
        if !self.skipped.is_empty() {
            return self.skipped.remove(0);
        }
        within(self.rx.recv()).await.expect("callbacks dropped")
    }

    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&Event) -> bool) -> Event {
        if let Some(pos) = self.skipped.iter().position(&mut predicate) {
            return self.skipped.remove(pos);
        }
        loop {
            let event = within(self.rx.recv()).await.expect("callbacks dropped");
            if predicate(&event) {
                return event;
            }
            self.skipped.push(event);
        }
    }

    pub async fn response(&mut self) -> (CimRequest, CimResponse) {
        match self.wait_for(|e| matches!(e, Event::Response { .. })).await {
            Event::Response { request, response } => (request, response),
            _ => unreachable!(),
        }
    }

    pub async fn chunk(&mut self) -> CimResponse {
        match self.wait_for(|e| matches!(e, Event::Chunk { .. })).await {
            Event::Chunk { response, .. } => response,
            _ => unreachable!(),
        }
    }

    pub async fn failure(&mut self) -> (String, String, bool) {
        match self.wait_for(|e| matches!(e, Event::Failure { .. })).await {
            Event::Failure { module_or_group, user, is_group, .. } => (module_or_group, user, is_group),
            _ => unreachable!(),
        }
    }

    pub async fn indication(&mut self) -> IndicationRequest {
        match self.wait_for(|e| matches!(e, Event::Indication(_))).await {
            Event::Indication(indication) => indication,
            _ => unreachable!(),
        }
    }

    /// Asserts nothing (new or skipped) arrives within `period`.
    pub async fn assert_quiet(&mut self, period: Duration) {
        assert!(self.skipped.is_empty(), "unexpected events: {:?}", self.skipped);
        if let Ok(Some(event)) = timeout(period, self.rx.recv()).await {
            panic!("unexpected event: {event:?}");
        }
    }

    /// Everything received within `period`, including skipped events.
    pub async fn drain(&mut self, period: Duration) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.skipped);
        while let Ok(Some(event)) = timeout(period, self.rx.recv()).await {
            events.push(event);
        }
        events
    }
}

/// Connections are alive unless explicitly closed.
#[derive(Default)]
pub struct TestConnections {
    closed: Mutex<HashSet<u32>>,
}

impl TestConnections {
    pub fn close(&self, queue_id: u32) {
        self.closed.lock().insert(queue_id);
    }
}

impl ConnectionMonitor for TestConnections {
    fn is_client_active(&self, queue_id: u32) -> bool {
        !self.closed.lock().contains(&queue_id)
    }
}

/// The agent end of one pipe, driven step by step by the test.
pub struct ScriptedAgent {
    pub pid: u32,
    pub launch: AgentLaunch,
    pub init: Option<InitializeAgent>,
    reader: Option<FrameReader>,
    writer: Option<FrameWriter>,
}

/// A request as it arrived: the raw frame and its decoded form.
pub struct Received {
    pub raw: Value,
    pub request: CimRequest,
}

impl ScriptedAgent {
    fn reader(&mut self) -> &mut FrameReader {
        self.reader.as_mut().expect("input closed")
    }

    fn writer(&mut self) -> &mut FrameWriter {
        self.writer.as_mut().expect("output closed")
    }

    async fn handshake(&mut self, accept: bool) {
        match within(self.reader().read_message::<AgentMessage>()).await.unwrap() {
            Some(AgentMessage::InitializeAgent(init)) => self.init = Some(init),
            other => panic!("expected initialize_agent, got {other:?}"),
        }
        if accept {
            self.writer().write_null().await.unwrap();
        } else {
            let bogus = AgentMessage::IndicationResponse(IndicationResponse {
                message_id: "nope".into(),
                oop_agent_name: None,
                error: None,
            });
            self.writer().write_message(&bogus).await.unwrap();
        }
    }

    /// Next frame as raw JSON; `None` for a null frame.
    pub async fn recv_raw(&mut self) -> Option<Value> {
        within(self.reader().read_message::<Value>()).await.unwrap()
    }

    pub async fn recv(&mut self) -> AgentMessage {
        let raw = self.recv_raw().await.expect("unexpected null frame");
        serde_json::from_value(raw).unwrap()
    }

    pub async fn recv_request(&mut self) -> Received {
        let raw = self.recv_raw().await.expect("unexpected null frame");
        match serde_json::from_value::<AgentMessage>(raw.clone()).unwrap() {
            AgentMessage::Request(request) => Received { raw, request },
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: AgentMessage) {
        self.writer().write_message(&message).await.unwrap();
    }

    /// Answers `request` with `body`, keeping the wire id.
    pub async fn respond(&mut self, request: &CimRequest, body: ResponseBody) {
        let response = request.build_response().with_body(body);
        self.send(AgentMessage::Response(response)).await;
    }

    pub async fn fail(&mut self, request: &CimRequest, error: CimException) {
        let response = request.build_response().with_error(error);
        self.send(AgentMessage::Response(response)).await;
    }

    pub async fn chunk(&mut self, request: &CimRequest, payload: Value) {
        let mut response = request.build_response().with_body(ResponseBody::Payload(payload));
        response.complete = false;
        self.send(AgentMessage::Response(response)).await;
    }

    /// Clean exit signal.
    pub async fn send_null(&mut self) {
        self.writer().write_null().await.unwrap();
    }

    /// Stops reading; host writes start failing.
    pub fn close_input(&mut self) {
        self.reader = None;
    }

    /// Closes the pipe towards the host, which sees an unclean disconnect.
    pub fn close_output(&mut self) {
        self.writer = None;
    }
}

/// Executor whose agents are [`ScriptedAgent`]s handed to the test. The
/// handshake is answered automatically before the agent is handed over.
pub struct ScriptedExecutor {
    agents: UnboundedSender<ScriptedAgent>,
    next_pid: AtomicU32,
    fail_start: AtomicBool,
    reject_handshake: AtomicBool,
    reaped: Mutex<Vec<u32>>,
}

pub struct ScriptedAgents {
    rx: UnboundedReceiver<ScriptedAgent>,
}

impl ScriptedAgents {
    pub async fn next(&mut self) -> ScriptedAgent {
        within(self.rx.recv()).await.expect("executor dropped")
    }

    pub async fn assert_none(&mut self, period: Duration) {
        if let Ok(Some(agent)) = timeout(period, self.rx.recv()).await {
            panic!("unexpected agent start for {:?}", agent.launch);
        }
    }
}

impl ScriptedExecutor {
    pub fn new() -> (Arc<Self>, ScriptedAgents) {
        let (agents, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            agents,
            next_pid: AtomicU32::new(100),
            fail_start: AtomicBool::new(false),
            reject_handshake: AtomicBool::new(false),
            reaped: Mutex::new(Vec::new()),
        });
        (executor, ScriptedAgents { rx })
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn reject_next_handshake(&self) {
        self.reject_handshake.store(true, Ordering::SeqCst);
    }

    pub fn reaped(&self) -> Vec<u32> {
        self.reaped.lock().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn start_provider_agent(&self, launch: &AgentLaunch) -> anyhow::Result<AgentProcess> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            anyhow::bail!("executable not found");
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (host_write, agent_read) = duplex(1 << 20);
        let (agent_write, host_read) = duplex(1 << 20);

        let mut agent = ScriptedAgent {
            pid,
            launch: launch.clone(),
            init: None,
            reader: Some(FrameReader::new(agent_read)),
            writer: Some(FrameWriter::new(agent_write)),
        };
        let accept = !self.reject_handshake.swap(false, Ordering::SeqCst);
        let agents = self.agents.clone();
        tokio::spawn(async move {
            agent.handshake(accept).await;
            if accept {
                let _ = agents.send(agent);
            }
        });

        Ok(AgentProcess { pid, reader: Box::new(host_read), writer: Box::new(host_write) })
    }

    async fn reap_provider_agent(&self, pid: u32) {
        self.reaped.lock().push(pid);
    }
}

pub fn scripted_context(
    executor: &Arc<ScriptedExecutor>,
    callbacks: &Arc<RecordingCallbacks>,
) -> RouterContext {
    RouterContext::new(config(), executor.clone(), callbacks.clone())
}

/// Agent handler for `InProcessExecutor`. Operation payloads steer it:
/// `"chunks": n`, `"delay_ms": n`, `"fail": "message"`, `"hang": true`
/// (never answers).
pub struct TestAgent {
    pub user: String,
    pub exit_when_idle: bool,
    /// Fails every broadcast request with this message.
    pub broadcast_error: Option<String>,
    pub inits: Arc<Mutex<Vec<InitializeAgent>>>,
}

impl TestAgent {
    pub fn new(launch: &AgentLaunch) -> Self {
        Self {
            user: launch.user.clone(),
            exit_when_idle: false,
            broadcast_error: None,
            inits: Arc::default(),
        }
    }
}

#[async_trait]
impl AgentHandler for TestAgent {
    async fn initialize(&self, init: &InitializeAgent) -> anyhow::Result<()> {
        self.inits.lock().push(init.clone());
        Ok(())
    }

    async fn handle_request(&self, request: CimRequest, responder: Responder) {
        if request.kind().is_aggregated() {
            if let Some(message) = &self.broadcast_error {
                responder.fail(CimException::failed(message.clone()));
                return;
            }
        }
        match request.body {
            RequestBody::Operation { operation, payload } => {
                if payload.get("hang").is_some() {
                    std::future::pending::<()>().await;
                }
                if let Some(ms) = payload.get("delay_ms").and_then(Value::as_u64) {
                    sleep(Duration::from_millis(ms)).await;
                }
                for index in 0..payload.get("chunks").and_then(Value::as_u64).unwrap_or(0) {
                    responder.chunk(json!({ "chunk": index }));
                }
                if let Some(message) = payload.get("fail").and_then(Value::as_str) {
                    responder.fail(CimException::failed(message));
                    return;
                }
                responder.complete(ResponseBody::Payload(json!({
                    "operation": operation,
                    "payload": payload,
                    "user": self.user,
                })));
            }
            RequestBody::EnableModule { .. } => {
                responder.complete(ResponseBody::ModuleStatus(vec![OperationalStatus::Ok]))
            }
            RequestBody::DisableModule { .. } => {
                responder.complete(ResponseBody::ModuleStatus(vec![OperationalStatus::Stopped]))
            }
            _ => responder.complete(ResponseBody::Empty),
        }
    }

    async fn unload_idle(&self) -> bool {
        self.exit_when_idle
    }
}
