//! Entry point for the server: routes each request to one agent, to the
//! agents of one module, or to every running agent.

use std::sync::Arc;

use agent_protocol::message::{
    CimRequest, CimResponse, IndicationResponse, OperationalStatus, ProviderModule, RequestBody,
    ResponseBody, UserContext,
};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::aggregator::ResponseAggregator;
use crate::container::AgentContainer;
use crate::context::RouterContext;
use crate::error::RouterError;
use crate::registry::AgentRegistry;

pub struct Router {
    ctx: Arc<RouterContext>,
    registry: AgentRegistry,
}

impl Router {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx: Arc::new(ctx), registry: AgentRegistry::new() }
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Routes `request`.
    ///
    /// The returned response is either final (`async_pending == false`) or a
    /// placeholder whose real result arrives later through
    /// `RouterCallbacks::on_async_response`. Never fails; errors are carried
    /// in the response.
    pub async fn process_message(&self, request: impl Into<Arc<CimRequest>>) -> CimResponse {
        let request = request.into();
        debug!(message_id = %request.message_id, kind = %request.kind(), "routing request");

        match &request.body {
            RequestBody::StopAllProviders => {
                self.ctx.set_all_providers_stopped();
                info!("stopping all provider agents");
                self.forward_to_all(request).await
            }
            RequestBody::NotifyConfigChange { current_value_modified: false, property_name, .. } => {
                debug!(property = %property_name, "only the planned value changed, agents not notified");
                request.build_response()
            }
            RequestBody::NotifyConfigChange { .. } => self.forward_to_all(request).await,
            RequestBody::SubscriptionInitComplete => {
                self.ctx.set_subscription_init_complete(true);
                self.forward_to_all(request).await
            }
            RequestBody::IndicationServiceDisabled => {
                self.ctx.set_subscription_init_complete(false);
                self.forward_to_all(request).await
            }
            RequestBody::EnableModule { provider_module } => {
                let target = OperationalStatus::Ok;
                self.forward_to_module_agents(Arc::clone(&request), provider_module, target).await
            }
            RequestBody::DisableModule { provider_module } => {
                let target = OperationalStatus::Stopped;
                self.forward_to_module_agents(Arc::clone(&request), provider_module, target).await
            }
            RequestBody::Operation { .. }
            | RequestBody::CreateSubscription { .. }
            | RequestBody::ModifySubscription { .. }
            | RequestBody::DeleteSubscription { .. }
            | RequestBody::ExportIndication { .. } => self.forward_to_agent(request).await,
        }
    }

    /// Broadcast to every running agent.
    async fn forward_to_all(&self, request: Arc<CimRequest>) -> CimResponse {
        let containers = self.registry.initialized();
        if containers.is_empty() {
            return request.build_response();
        }
        self.fan_out(request, containers).await
    }

    /// Broadcast to the running agents of one module or group. With none
    /// running the module is already in the `target` state.
    async fn forward_to_module_agents(
        &self,
        request: Arc<CimRequest>,
        module: &ProviderModule,
        target: OperationalStatus,
    ) -> CimResponse {
        let containers = self.registry.initialized_for(&module.agent_name());
        if containers.is_empty() {
            debug!(module = %module.name, status = ?target, "no running agent for module");
            return request.build_response().with_body(ResponseBody::ModuleStatus(vec![target]));
        }
        self.fan_out(request, containers).await
    }

    async fn fan_out(&self, request: Arc<CimRequest>, containers: Vec<Arc<AgentContainer>>) -> CimResponse {
        let expected = u32::try_from(containers.len()).unwrap_or(u32::MAX);
        let aggregator = Arc::new(ResponseAggregator::new(expected));
        debug!(message_id = %request.message_id, kind = %request.kind(), agents = expected, "broadcasting request");

        join_all(
            containers
                .iter()
                .map(|container| container.process_message(Arc::clone(&request), Some(Arc::clone(&aggregator)))),
        )
        .await;

        let mut response = request.build_response();
        response.async_pending = true;
        response
    }

    async fn forward_to_agent(&self, request: Arc<CimRequest>) -> CimResponse {
        match self.lookup_agent(&request) {
            Ok(container) => container.process_message(request, None).await,
            Err(err) => {
                warn!(message_id = %request.message_id, "cannot route request: {err}");
                request.build_response().with_error(err.into())
            }
        }
    }

    /// The container serving the request's provider module for the user the
    /// module's user context selects. Created on first use.
    pub fn lookup_agent(&self, request: &CimRequest) -> Result<Arc<AgentContainer>, RouterError> {
        let module = request
            .provider_module()
            .ok_or_else(|| RouterError::MissingProviderModule(request.message_id.clone()))?;
        let user_context = module.user_context.unwrap_or(self.ctx.settings.default_user_context);
        let user = self.resolve_user(module, user_context, request)?;
        Ok(self.registry.lookup_or_create(module, &user, user_context, &self.ctx))
    }

    fn resolve_user(
        &self,
        module: &ProviderModule,
        user_context: UserContext,
        request: &CimRequest,
    ) -> Result<String, RouterError> {
        let settings = &self.ctx.settings;
        match user_context {
            UserContext::Requestor => Ok(request
                .context
                .identity
                .clone()
                .filter(|identity| !identity.is_empty())
                .unwrap_or_else(|| settings.server_user.clone())),
            UserContext::Designated => module
                .designated_user
                .clone()
                .filter(|user| !user.is_empty())
                .ok_or_else(|| RouterError::DesignatedUserMissing(module.name.clone())),
            UserContext::Privileged => Ok(settings.privileged_user.clone()),
            UserContext::CimServer => Ok(settings.server_user.clone()),
        }
    }

    /// Sends the server's answer to an indication back to the agent that
    /// produced it.
    pub async fn handle_indication_response(&self, response: IndicationResponse) {
        let Some(agent_name) = response.oop_agent_name.as_deref() else {
            warn!(message_id = %response.message_id, "indication response without agent name, dropping");
            return;
        };
        for container in self.registry.initialized_for(agent_name) {
            container.send_indication_response(&response).await;
        }
    }

    /// Periodic maintenance: lets agents unload idle providers and completes
    /// requests of clients that have gone away.
    pub async fn idle_time_cleanup(&self) {
        for container in self.registry.initialized() {
            container.unload_idle_providers().await;
            container.clean_disconnected_client_requests().await;
        }
    }

    /// Fails the in-flight internal requests of a pull operation whose
    /// enumeration context is being closed.
    pub async fn enumeration_context_cleanup(&self, context_id: &str) {
        for container in self.registry.initialized() {
            container.clean_closed_pull_requests(context_id).await;
        }
    }
}
