//! Upward notifications. The router never calls into the enclosing server
//! except through these traits.

use agent_protocol::message::{CimRequest, CimResponse, IndicationRequest, UserContext};
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait RouterCallbacks: Send + Sync {
    /// An agent produced an indication. `oop_agent_name` is set so the
    /// answer can be routed back with `Router::handle_indication_response`.
    async fn on_indication(&self, indication: IndicationRequest);

    /// An intermediate chunk for `request`. More chunks or a final response
    /// follow.
    async fn on_response_chunk(&self, request: &CimRequest, response: CimResponse);

    /// An agent serving `module_or_group` for `user` went away uncleanly.
    async fn on_module_group_failure(
        &self,
        module_or_group: &str,
        user: &str,
        user_context: UserContext,
        is_group: bool,
    );

    /// The final response to a request that was answered as pending. The
    /// response carries the caller's original message id.
    async fn on_async_response(&self, request: &CimRequest, response: CimResponse);

    /// Class definition requested by an agent. `None` answers "not found".
    async fn lookup_class(&self, _namespace: &str, _class_name: &str) -> Option<Value> {
        None
    }
}

/// Tells whether the client connection a request came in on is still open.
pub trait ConnectionMonitor: Send + Sync {
    fn is_client_active(&self, queue_id: u32) -> bool;
}

/// Treats every connection as open; nothing is ever swept.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl ConnectionMonitor for AlwaysConnected {
    fn is_client_active(&self, _queue_id: u32) -> bool {
        true
    }
}
