use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use agent_protocol::AgentHandler;
use agent_protocol::message::{Bitness, UserContext};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long reaping waits for an agent to exit before killing it.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunch {
    pub bitness: Bitness,
    /// Module or group name, without the `grp:`/`mod:` prefix.
    pub module_or_group: String,
    pub home: String,
    /// Identity the agent runs as.
    pub user: String,
    pub user_context: UserContext,
}

/// A started agent: its id plus the two pipe endpoints.
pub struct AgentProcess {
    pub pid: u32,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Starts and reaps agent processes on the router's behalf.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn start_provider_agent(&self, launch: &AgentLaunch) -> Result<AgentProcess>;

    /// Waits for a stopped agent so it does not linger. Called without any
    /// container lock held.
    async fn reap_provider_agent(&self, pid: u32);
}

/// Runs `program` as a child process speaking the agent protocol on its
/// stdin / stdout. The launch parameters are passed as environment
/// variables (`AGENT_MODULE`, `AGENT_USER`, `AGENT_USER_CONTEXT`,
/// `AGENT_HOME`, `AGENT_BITNESS`).
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    children: DashMap<u32, Child>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), children: DashMap::new() }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn start_provider_agent(&self, launch: &AgentLaunch) -> Result<AgentProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("AGENT_MODULE", &launch.module_or_group)
            .env("AGENT_USER", &launch.user)
            .env("AGENT_USER_CONTEXT", launch.user_context.as_ref())
            .env("AGENT_HOME", &launch.home)
            .env("AGENT_BITNESS", launch.bitness.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;

        let pid = child.id().ok_or_else(|| anyhow!("agent exited before it could be tracked"))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("agent stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("agent stdout unavailable"))?;
        self.children.insert(pid, child);
        info!(pid, module = %launch.module_or_group, user = %launch.user, "spawned provider agent");

        Ok(AgentProcess { pid, reader: Box::new(stdout), writer: Box::new(stdin) })
    }

    async fn reap_provider_agent(&self, pid: u32) {
        let Some((_, mut child)) = self.children.remove(&pid) else {
            return;
        };
        match timeout(REAP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "reaped provider agent"),
            Ok(Err(err)) => warn!(pid, "waiting for provider agent failed: {err}"),
            Err(_) => {
                warn!(pid, "provider agent did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }
}

/// Runs agents as tasks on the current runtime, connected through in-memory
/// pipes. `factory` builds a fresh handler for every start.
pub struct InProcessExecutor<F> {
    factory: F,
    next_pid: AtomicU32,
    tasks: DashMap<u32, JoinHandle<()>>,
    launches: Mutex<Vec<AgentLaunch>>,
    capacity: usize,
}

impl<F, H> InProcessExecutor<F>
where
    F: Fn(&AgentLaunch) -> H + Send + Sync + 'static,
    H: AgentHandler,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            next_pid: AtomicU32::new(1000),
            tasks: DashMap::new(),
            launches: Mutex::new(Vec::new()),
            capacity: 64 * 1024,
        }
    }

    /// Every launch so far, in order.
    pub fn launches(&self) -> Vec<AgentLaunch> {
        self.launches.lock().clone()
    }

    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|t| !t.value().is_finished()).count()
    }

    /// Aborts an agent as if its process crashed. The host sees its pipe
    /// close without a shutdown signal.
    pub fn kill(&self, pid: u32) -> bool {
        match self.tasks.get(&pid) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl<F, H> Executor for InProcessExecutor<F>
where
    F: Fn(&AgentLaunch) -> H + Send + Sync + 'static,
    H: AgentHandler,
{
    async fn start_provider_agent(&self, launch: &AgentLaunch) -> Result<AgentProcess> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let handler = (self.factory)(launch);
        let (host, agent) = tokio::io::duplex(self.capacity);
        let (agent_read, agent_write) = tokio::io::split(agent);
        let (host_read, host_write) = tokio::io::split(host);

        let task = tokio::spawn(async move {
            if let Err(err) = agent_protocol::run(handler, agent_read, agent_write).await {
                warn!(pid, "in-process agent failed: {err:#}");
            }
        });
        self.tasks.insert(pid, task);
        self.launches.lock().push(launch.clone());

        Ok(AgentProcess { pid, reader: Box::new(host_read), writer: Box::new(host_write) })
    }

    async fn reap_provider_agent(&self, pid: u32) {
        if let Some((_, task)) = self.tasks.remove(&pid) {
            if !task.is_finished() {
                task.abort();
            }
            let _ = task.await;
        }
    }
}
