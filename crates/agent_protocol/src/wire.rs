//! Envelope for everything that travels over an agent pipe.
//!
//! Each frame carries one JSON document of the form
//! `{"type": "<variant>", "body": {...}}`. The null message is not an
//! envelope at all: it is a zero-length frame (see [`crate::channel`]).

use serde::{Deserialize, Serialize};

use crate::message::{
    CimRequest, CimResponse, ClassRequest, ClassResponse, IndicationRequest, IndicationResponse,
    InitializeAgent, OperationContext, ProviderId, ProviderModule, RequestBody,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum AgentMessage {
    // host → agent
    InitializeAgent(InitializeAgent),
    Request(CimRequest),
    IndicationResponse(IndicationResponse),
    ClassResponse(ClassResponse),
    // agent → host
    Response(CimResponse),
    ProcessIndication(IndicationRequest),
    GetClass(ClassRequest),
}

/// Serializes as `AgentMessage::Request` without owning or touching the
/// request it was built from.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Request(RequestView<'a>),
}

impl<'a> Outbound<'a> {
    /// `message_id` replaces the caller's id on the wire. With
    /// `elide_module` the provider module is left out; the agent reuses the
    /// one it saw last.
    pub fn request(request: &'a CimRequest, message_id: &'a str, elide_module: bool) -> Self {
        Outbound::Request(RequestView {
            message_id,
            body: &request.body,
            context: ContextView::new(&request.context, elide_module),
            queue_ids: &request.queue_ids,
            internal_operation: request.internal_operation,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RequestView<'a> {
    message_id: &'a str,
    body: &'a RequestBody,
    context: ContextView<'a>,
    queue_ids: &'a [u32],
    internal_operation: bool,
}

#[derive(Debug, Serialize)]
struct ContextView<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderView<'a>>,
}

impl<'a> ContextView<'a> {
    fn new(context: &'a OperationContext, elide_module: bool) -> Self {
        Self {
            identity: context.identity.as_deref(),
            provider: context.provider.as_ref().map(|p| ProviderView::new(p, elide_module)),
        }
    }
}

#[derive(Debug, Serialize)]
struct ProviderView<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<&'a ProviderModule>,
    provider: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_manager_path: Option<&'a str>,
}

impl<'a> ProviderView<'a> {
    fn new(provider: &'a ProviderId, elide_module: bool) -> Self {
        Self {
            module: if elide_module { None } else { provider.module.as_ref() },
            provider: &provider.provider,
            provider_manager_path: provider.provider_manager_path.as_deref(),
        }
    }
}

/// Agent-side counterpart of module elision: remembers the last module
/// received and fills it back into requests that arrive without one.
#[derive(Debug, Default)]
pub struct ModuleCache {
    last: Option<ProviderModule>,
}

impl ModuleCache {
    pub fn restore(&mut self, request: &mut CimRequest) {
        let Some(provider) = request.context.provider.as_mut() else {
            return;
        };
        if let Some(module) = &provider.module {
            self.last = Some(module.clone());
        } else {
            provider.module = self.last.clone();
        }
    }

    pub fn last(&self) -> Option<&ProviderModule> {
        self.last.as_ref()
    }
}
