use std::fmt;
use std::sync::Arc;

use agent_protocol::message::{ProviderModule, UserContext};
use dashmap::DashMap;
use tracing::debug;

use crate::container::AgentContainer;
use crate::context::RouterContext;

/// Identity of one agent: `grp:`/`mod:` name plus the user it runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub agent_name: String,
    pub user: String,
}

impl AgentKey {
    pub fn new(agent_name: impl Into<String>, user: impl Into<String>) -> Self {
        Self { agent_name: agent_name.into(), user: user.into() }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.agent_name, self.user)
    }
}

/// Every container ever created. Keys are never removed; a container whose
/// agent stopped stays registered and starts a new agent on demand.
///
/// Lookups return cloned `Arc`s so no map shard is locked while a container
/// is being used.
#[derive(Default)]
pub struct AgentRegistry {
    containers: DashMap<AgentKey, Arc<AgentContainer>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_or_create(
        &self,
        module: &ProviderModule,
        user: &str,
        user_context: UserContext,
        ctx: &Arc<RouterContext>,
    ) -> Arc<AgentContainer> {
        let key = AgentKey::new(module.agent_name(), user);
        let container = self.containers.entry(key).or_insert_with(|| {
            debug!(agent = %module.agent_name(), user, "creating agent container");
            Arc::new(AgentContainer::new(module, user, user_context, Arc::clone(ctx)))
        });
        Arc::clone(container.value())
    }

    pub fn get(&self, key: &AgentKey) -> Option<Arc<AgentContainer>> {
        self.containers.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of every container.
    pub fn all(&self) -> Vec<Arc<AgentContainer>> {
        self.containers.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Snapshot of the containers with a running agent.
    pub fn initialized(&self) -> Vec<Arc<AgentContainer>> {
        self.containers
            .iter()
            .filter(|c| c.value().is_initialized())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// Running containers serving `agent_name`, for any user.
    pub fn initialized_for(&self, agent_name: &str) -> Vec<Arc<AgentContainer>> {
        self.containers
            .iter()
            .filter(|c| c.key().agent_name == agent_name && c.value().is_initialized())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::RouterCallbacks;
    use crate::config::{ConfigManager, MapConfigManager};
    use crate::executor::{AgentLaunch, AgentProcess, Executor};
    use agent_protocol::message::{CimRequest, CimResponse, IndicationRequest};
    use async_trait::async_trait;

    struct NoExecutor;

    #[async_trait]
    impl Executor for NoExecutor {
        async fn start_provider_agent(&self, _launch: &AgentLaunch) -> anyhow::Result<AgentProcess> {
            anyhow::bail!("not in this test")
        }
        async fn reap_provider_agent(&self, _pid: u32) {}
    }

    struct NoCallbacks;

    #[async_trait]
    impl RouterCallbacks for NoCallbacks {
        async fn on_indication(&self, _indication: IndicationRequest) {}
        async fn on_response_chunk(&self, _request: &CimRequest, _response: CimResponse) {}
        async fn on_module_group_failure(&self, _m: &str, _u: &str, _c: UserContext, _g: bool) {}
        async fn on_async_response(&self, _request: &CimRequest, _response: CimResponse) {}
    }

    fn ctx() -> Arc<RouterContext> {
        Arc::new(RouterContext::new(
            ConfigManager(MapConfigManager::new()),
            Arc::new(NoExecutor),
            Arc::new(NoCallbacks),
        ))
    }

    #[test]
    fn same_key_returns_same_container() {
        let ctx = ctx();
        let registry = AgentRegistry::new();
        let module = ProviderModule::new("OSProvider");

        let a = registry.lookup_or_create(&module, "alice", UserContext::Requestor, &ctx);
        let b = registry.lookup_or_create(&module, "alice", UserContext::Requestor, &ctx);
        let c = registry.lookup_or_create(&module, "bob", UserContext::Requestor, &ctx);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&AgentKey::new("mod:OSProvider", "bob")).is_some());
    }

    #[test]
    fn modules_of_one_group_share_a_container() {
        let ctx = ctx();
        let registry = AgentRegistry::new();
        let one = ProviderModule::new("A").with_group("Shared");
        let two = ProviderModule::new("B").with_group("Shared");

        let a = registry.lookup_or_create(&one, "root", UserContext::Privileged, &ctx);
        let b = registry.lookup_or_create(&two, "root", UserContext::Privileged, &ctx);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.agent_name(), "grp:Shared");
        assert!(a.is_group());
    }

    #[test]
    fn new_containers_are_not_initialized() {
        let ctx = ctx();
        let registry = AgentRegistry::new();
        registry.lookup_or_create(&ProviderModule::new("X"), "root", UserContext::Privileged, &ctx);

        assert_eq!(registry.all().len(), 1);
        assert!(registry.initialized().is_empty());
        assert!(registry.initialized_for("mod:X").is_empty());
    }

    #[test]
    fn key_display() {
        assert_eq!(AgentKey::new("grp:G", "alice").to_string(), "grp:G:alice");
    }
}
