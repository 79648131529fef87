//! Runtime for the agent side of the pipe.
//!
//! A provider agent implements [`AgentHandler`] and hands it to [`run`]
//! together with its input and output streams (stdin / stdout for a real
//! agent process):
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     agent_protocol::run(MyAgent::default(), tokio::io::stdin(), tokio::io::stdout()).await
//! }
//! ```
//!
//! The runtime answers the initialization handshake, restores elided
//! provider modules, runs every request on its own task and funnels all
//! outbound frames through a single writer task.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelError, FrameReader, FrameWriter};
use crate::message::{
    CimException, CimRequest, CimResponse, ClassRequest, ClassResponse, IndicationRequest,
    IndicationResponse, InitializeAgent, RequestKind, ResponseBody,
};
use crate::wire::{AgentMessage, ModuleCache};

#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    /// Called once with the handshake message, before the agent reports
    /// ready. An error aborts the agent.
    async fn initialize(&self, _init: &InitializeAgent) -> Result<()> {
        Ok(())
    }

    /// Handle one request. Every request must eventually be answered through
    /// `responder`; a responder dropped unanswered sends a failure response.
    async fn handle_request(&self, request: CimRequest, responder: Responder);

    /// The host sent an idle wake-up ping. Return `true` to exit cleanly.
    async fn unload_idle(&self) -> bool {
        false
    }

    async fn indication_response(&self, _response: IndicationResponse) {}

    async fn class_response(&self, _response: ClassResponse) {}
}

enum Outgoing {
    Message(AgentMessage),
    Null,
}

/// Answers one request. Chunks may be sent any number of times before the
/// final response.
pub struct Responder {
    request: Option<CimRequest>,
    outbox: UnboundedSender<Outgoing>,
}

impl Responder {
    fn new(request: &CimRequest, outbox: UnboundedSender<Outgoing>) -> Self {
        Self { request: Some(request.clone()), outbox }
    }

    fn send(&self, message: AgentMessage) {
        // a closed outbox means the pipe is gone; nothing left to tell
        let _ = self.outbox.send(Outgoing::Message(message));
    }

    fn response(&self) -> Option<CimResponse> {
        self.request.as_ref().map(CimRequest::build_response)
    }

    pub fn chunk(&self, payload: Value) {
        if let Some(mut chunk) = self.response() {
            chunk.complete = false;
            chunk.body = ResponseBody::Payload(payload);
            self.send(AgentMessage::Response(chunk));
        }
    }

    pub fn complete(mut self, body: ResponseBody) {
        if let Some(response) = self.response() {
            self.request = None;
            self.send(AgentMessage::Response(response.with_body(body)));
        }
    }

    pub fn fail(mut self, error: CimException) {
        if let Some(response) = self.response() {
            self.request = None;
            self.send(AgentMessage::Response(response.with_error(error)));
        }
    }

    /// Sends an already built final response. Its message id is forced to
    /// the request's.
    pub fn respond(mut self, mut response: CimResponse) {
        if let Some(request) = self.request.take() {
            response.message_id = request.message_id;
            response.complete = true;
            self.send(AgentMessage::Response(response));
        }
    }

    /// Emits an indication on behalf of a provider.
    pub fn indication(&self, payload: Value) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.send(AgentMessage::ProcessIndication(IndicationRequest {
            message_id: message_id.clone(),
            payload,
            oop_agent_name: None,
        }));
        message_id
    }

    /// Asks the host for a class definition; the answer arrives through
    /// [`AgentHandler::class_response`].
    pub fn get_class(&self, namespace: &str, class_name: &str) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.send(AgentMessage::GetClass(ClassRequest {
            message_id: message_id.clone(),
            namespace: namespace.to_string(),
            class_name: class_name.to_string(),
        }));
        message_id
    }

    pub fn kind(&self) -> Option<RequestKind> {
        self.request.as_ref().map(CimRequest::kind)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(response) = self.response() {
            warn!(message_id = %response.message_id, "request dropped without a response");
            self.send(AgentMessage::Response(
                response.with_error(CimException::failed("provider returned no response")),
            ));
        }
    }
}

/// Serve the host until it closes the pipe, a stop-all request has been
/// answered, or the handler agrees to exit on an idle ping.
pub async fn run<H, R, W>(handler: H, reader: R, writer: W) -> Result<()>
where
    H: AgentHandler,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let handler = Arc::new(handler);
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    // 1) handshake: one initialize message in, one null frame out
    let init = match reader.read_message::<AgentMessage>().await? {
        Some(AgentMessage::InitializeAgent(init)) => init,
        Some(other) => bail!("expected initialize_agent, got {other:?}"),
        None => bail!("expected initialize_agent, got a null message"),
    };
    handler.initialize(&init).await?;
    writer.write_null().await?;
    info!(home = %init.home, "provider agent initialized");

    // 2) single writer task
    let (outbox, mut queue) = mpsc::unbounded_channel::<Outgoing>();
    // dropping `run` aborts the writer too, so a cancelled agent writes nothing more
    let writer_task = AbortOnDropHandle::new(tokio::spawn(async move {
        while let Some(out) = queue.recv().await {
            let res = match out {
                Outgoing::Message(message) => match writer.write_message(&message).await {
                    // the host still waits for this id, so it gets a failure instead
                    Err(err @ ChannelError::TooLarge { .. }) => match message {
                        AgentMessage::Response(response) => {
                            warn!(message_id = %response.message_id, "response not sent: {err}");
                            let failure = CimResponse {
                                error: Some(CimException::failed(err.to_string())),
                                complete: true,
                                body: ResponseBody::default(),
                                ..response
                            };
                            writer.write_message(&AgentMessage::Response(failure)).await
                        }
                        _ => {
                            warn!("message to host dropped: {err}");
                            Ok(())
                        }
                    },
                    res => res,
                },
                Outgoing::Null => writer.write_null().await,
            };
            if let Err(err) = res {
                warn!("agent writer stopped: {err}");
                break;
            }
        }
        let _ = writer.close().await;
    }));

    // 3) dispatch loop
    let mut modules = ModuleCache::default();
    let mut inflight = JoinSet::new();
    let clean_exit = loop {
        while inflight.try_join_next().is_some() {}

        match reader.read_message::<AgentMessage>().await {
            Ok(None) => {
                debug!("idle ping");
                if handler.unload_idle().await {
                    break true;
                }
            }
            Ok(Some(AgentMessage::Request(mut request))) => {
                modules.restore(&mut request);
                let responder = Responder::new(&request, outbox.clone());
                if request.kind() == RequestKind::StopAllProviders {
                    while inflight.join_next().await.is_some() {}
                    handler.handle_request(request, responder).await;
                    break true;
                }
                let handler = Arc::clone(&handler);
                inflight.spawn(async move { handler.handle_request(request, responder).await });
            }
            Ok(Some(AgentMessage::IndicationResponse(response))) => {
                handler.indication_response(response).await;
            }
            Ok(Some(AgentMessage::ClassResponse(response))) => {
                handler.class_response(response).await;
            }
            Ok(Some(other)) => warn!("unexpected message from host: {other:?}"),
            Err(ChannelError::Codec(err)) => warn!("ignoring malformed frame: {err}"),
            Err(ChannelError::Closed) => break false,
            Err(err) => {
                warn!("host pipe failed: {err}");
                break false;
            }
        }
    };

    // 4) wind down
    if clean_exit {
        while inflight.join_next().await.is_some() {}
        let _ = outbox.send(Outgoing::Null);
    } else {
        inflight.shutdown().await;
    }
    drop(outbox);
    let _ = writer_task.await;
    info!(clean_exit, "provider agent exiting");
    Ok(())
}
