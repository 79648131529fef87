//! Reference provider agent. Speaks the agent protocol on stdin / stdout and
//! answers every provider operation by echoing it back.
//!
//! An operation payload may ask for extra behaviour:
//! - `"chunks": n` sends `n` intermediate chunks before the final response
//! - `"indication": value` emits an indication carrying `value`

use agent_protocol::message::{CimRequest, OperationalStatus, RequestBody, ResponseBody};
use agent_protocol::{AgentHandler, Responder};
use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo_agent", about = "Echoing provider agent")]
struct Cli {
    /// Exit cleanly on the first idle ping.
    #[arg(long, env = "ECHO_AGENT_EXIT_WHEN_IDLE")]
    exit_when_idle: bool,

    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Module or group this agent serves.
    #[arg(long, env = "AGENT_MODULE", default_value = "")]
    module: String,

    /// Identity the agent was started for.
    #[arg(long, env = "AGENT_USER", default_value = "")]
    user: String,
}

struct EchoAgent {
    module: String,
    user: String,
    exit_when_idle: bool,
}

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn handle_request(&self, request: CimRequest, responder: Responder) {
        debug!(message_id = %request.message_id, kind = %request.kind(), "request");
        match request.body {
            RequestBody::Operation { operation, payload } => {
                let chunks = payload.get("chunks").and_then(|v| v.as_u64()).unwrap_or(0);
                for index in 0..chunks {
                    responder.chunk(json!({ "chunk": index }));
                }
                if let Some(value) = payload.get("indication") {
                    responder.indication(value.clone());
                }
                let provider_module = request
                    .context
                    .provider
                    .as_ref()
                    .and_then(|p| p.module.as_ref())
                    .map(|m| m.name.clone());
                responder.complete(ResponseBody::Payload(json!({
                    "operation": operation,
                    "payload": payload,
                    "module": provider_module,
                    "agent": self.module,
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
        if self.exit_when_idle {
            info!(module = %self.module, "idle, exiting");
        }
        self.exit_when_idle
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let agent = EchoAgent { module: cli.module, user: cli.user, exit_when_idle: cli.exit_when_idle };
    agent_protocol::run(agent, tokio::io::stdin(), tokio::io::stdout()).await
}
