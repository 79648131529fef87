use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_protocol::message::UserContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::callbacks::{AlwaysConnected, ConnectionMonitor, RouterCallbacks};
use crate::config::ConfigManager;
use crate::executor::Executor;
use crate::logger::RouterMetrics;

/// Identities used when resolving which user an agent runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Identity of the server itself.
    pub server_user: String,
    pub privileged_user: String,
    /// Applied to modules that do not declare a user context.
    pub default_user_context: UserContext,
    /// Passed to every agent in its handshake.
    pub bind_verbose: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            server_user: "cimsrvr".to_string(),
            privileged_user: "root".to_string(),
            default_user_context: UserContext::Privileged,
            bind_verbose: false,
        }
    }
}

/// Number of initialized agents, bounded by `maxProviderProcesses`.
#[derive(Debug, Default)]
pub struct ProcessCounter {
    active: Mutex<u32>,
}

impl ProcessCounter {
    /// Takes a slot unless `max` (0 = unlimited) slots are in use.
    pub fn try_acquire(&self, max: u32) -> bool {
        let mut active = self.active.lock();
        if max != 0 && *active >= max {
            return false;
        }
        *active += 1;
        true
    }

    pub fn release(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
    }

    pub fn active(&self) -> u32 {
        *self.active.lock()
    }
}

/// State shared by the router and every agent container.
pub struct RouterContext {
    pub config: ConfigManager,
    pub executor: Arc<dyn Executor>,
    pub callbacks: Arc<dyn RouterCallbacks>,
    pub connections: Arc<dyn ConnectionMonitor>,
    pub settings: RouterSettings,
    pub metrics: RouterMetrics,
    processes: ProcessCounter,
    all_providers_stopped: AtomicBool,
    subscription_init_complete: AtomicBool,
}

impl RouterContext {
    pub fn new(
        config: ConfigManager,
        executor: Arc<dyn Executor>,
        callbacks: Arc<dyn RouterCallbacks>,
    ) -> Self {
        Self {
            config,
            executor,
            callbacks,
            connections: Arc::new(AlwaysConnected),
            settings: RouterSettings::default(),
            metrics: RouterMetrics::new(),
            processes: ProcessCounter::default(),
            all_providers_stopped: AtomicBool::new(false),
            subscription_init_complete: AtomicBool::new(false),
        }
    }

    pub fn with_connections(mut self, connections: Arc<dyn ConnectionMonitor>) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn processes(&self) -> &ProcessCounter {
        &self.processes
    }

    /// Number of agents currently initialized.
    pub fn active_processes(&self) -> u32 {
        self.processes.active()
    }

    pub fn all_providers_stopped(&self) -> bool {
        self.all_providers_stopped.load(Ordering::SeqCst)
    }

    /// One-way: once set, only stop-all requests reach agents.
    pub(crate) fn set_all_providers_stopped(&self) {
        self.all_providers_stopped.store(true, Ordering::SeqCst);
    }

    pub fn subscription_init_complete(&self) -> bool {
        self.subscription_init_complete.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscription_init_complete(&self, complete: bool) {
        self.subscription_init_complete.store(complete, Ordering::SeqCst);
    }
}
