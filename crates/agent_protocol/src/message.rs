use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Free-form properties of a provider module instance.
pub type Properties = Map<String, Value>;

pub const GROUP_PREFIX: &str = "grp:";
pub const MODULE_PREFIX: &str = "mod:";

// -----------------------------------------------------------------------------
// Provider identity
// -----------------------------------------------------------------------------

/// Whose identity an agent process runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum UserContext {
    Requestor = 2,
    Designated = 3,
    Privileged = 4,
    CimServer = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Bitness {
    #[default]
    Default,
    Bits32,
    Bits64,
}

/// Registration record of a provider module. Agents receive it with every
/// provider operation; equality is structural over every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderModule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<UserContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designated_user: Option<String>,
    #[serde(default)]
    pub bitness: Bitness,
    #[serde(default)]
    pub properties: Properties,
}

impl ProviderModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            user_context: None,
            designated_user: None,
            bitness: Bitness::Default,
            properties: Properties::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into()).filter(|g: &String| !g.is_empty());
        self
    }

    pub fn with_user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = Some(user_context);
        self
    }

    pub fn with_designated_user(mut self, user: impl Into<String>) -> Self {
        self.designated_user = Some(user.into());
        self
    }

    pub fn with_bitness(mut self, bitness: Bitness) -> Self {
        self.bitness = bitness;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// The group name when the module belongs to a group, the module name
    /// otherwise.
    pub fn group_or_module(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    pub fn is_grouped(&self) -> bool {
        self.group.is_some()
    }

    /// `grp:<group>` or `mod:<module>`; one agent process serves each name
    /// per user.
    pub fn agent_name(&self) -> String {
        match &self.group {
            Some(group) => format!("{GROUP_PREFIX}{group}"),
            None => format!("{MODULE_PREFIX}{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderId {
    /// `None` on the wire means "the module sent with the previous request".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<ProviderModule>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_manager_path: Option<String>,
}

impl ProviderId {
    pub fn new(module: ProviderModule, provider: impl Into<String>) -> Self {
        Self {
            module: Some(module),
            provider: provider.into(),
            provider_manager_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Operation,
    CreateSubscription,
    ModifySubscription,
    DeleteSubscription,
    ExportIndication,
    EnableModule,
    DisableModule,
    StopAllProviders,
    NotifyConfigChange,
    SubscriptionInitComplete,
    IndicationServiceDisabled,
}

impl RequestKind {
    /// Kinds that fan out to several agents and complete through a
    /// response aggregator.
    pub fn is_aggregated(self) -> bool {
        matches!(
            self,
            RequestKind::StopAllProviders
                | RequestKind::NotifyConfigChange
                | RequestKind::SubscriptionInitComplete
                | RequestKind::IndicationServiceDisabled
                | RequestKind::EnableModule
                | RequestKind::DisableModule
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    /// A provider operation. The payload is opaque to the router.
    Operation { operation: String, payload: Value },
    CreateSubscription { payload: Value },
    ModifySubscription { payload: Value },
    DeleteSubscription { payload: Value },
    ExportIndication { payload: Value },
    EnableModule { provider_module: ProviderModule },
    DisableModule { provider_module: ProviderModule },
    StopAllProviders,
    NotifyConfigChange {
        property_name: String,
        new_value: Option<String>,
        current_value_modified: bool,
    },
    SubscriptionInitComplete,
    IndicationServiceDisabled,
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::Operation { .. } => RequestKind::Operation,
            RequestBody::CreateSubscription { .. } => RequestKind::CreateSubscription,
            RequestBody::ModifySubscription { .. } => RequestKind::ModifySubscription,
            RequestBody::DeleteSubscription { .. } => RequestKind::DeleteSubscription,
            RequestBody::ExportIndication { .. } => RequestKind::ExportIndication,
            RequestBody::EnableModule { .. } => RequestKind::EnableModule,
            RequestBody::DisableModule { .. } => RequestKind::DisableModule,
            RequestBody::StopAllProviders => RequestKind::StopAllProviders,
            RequestBody::NotifyConfigChange { .. } => RequestKind::NotifyConfigChange,
            RequestBody::SubscriptionInitComplete => RequestKind::SubscriptionInitComplete,
            RequestBody::IndicationServiceDisabled => RequestKind::IndicationServiceDisabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CimRequest {
    /// Assigned by the caller. Not guaranteed unique.
    pub message_id: String,
    pub body: RequestBody,
    #[serde(default)]
    pub context: OperationContext,
    /// Originating queues, innermost first; `queue_ids[0]` is the client
    /// connection.
    #[serde(default)]
    pub queue_ids: Vec<u32>,
    /// Issued by the server on behalf of a pull operation; `message_id` is
    /// then the enumeration context id.
    #[serde(default)]
    pub internal_operation: bool,
}

impl CimRequest {
    pub fn new(message_id: impl Into<String>, body: RequestBody) -> Self {
        Self {
            message_id: message_id.into(),
            body,
            context: OperationContext::default(),
            queue_ids: Vec::new(),
            internal_operation: false,
        }
    }

    pub fn operation(
        message_id: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            message_id,
            RequestBody::Operation { operation: operation.into(), payload },
        )
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.context.provider = Some(provider);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.context.identity = Some(identity.into());
        self
    }

    pub fn with_queue_ids(mut self, queue_ids: Vec<u32>) -> Self {
        self.queue_ids = queue_ids;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal_operation = true;
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }

    /// The module carried in the operation context, if any.
    pub fn provider_module(&self) -> Option<&ProviderModule> {
        self.context.provider.as_ref().and_then(|p| p.module.as_ref())
    }

    pub fn client_queue(&self) -> Option<u32> {
        self.queue_ids.first().copied()
    }

    /// An empty, complete response of the matching kind.
    pub fn build_response(&self) -> CimResponse {
        let body = match self.kind() {
            RequestKind::EnableModule | RequestKind::DisableModule => {
                ResponseBody::ModuleStatus(Vec::new())
            }
            _ => ResponseBody::Empty,
        };
        CimResponse {
            message_id: self.message_id.clone(),
            kind: self.kind(),
            error: None,
            complete: true,
            async_pending: false,
            body,
        }
    }
}

// -----------------------------------------------------------------------------
// Responses
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum CimErrorCode {
    Failed,
    AccessDenied,
    InvalidParameter,
    NotSupported,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct CimException {
    pub code: CimErrorCode,
    pub message: String,
}

impl CimException {
    pub fn new(code: CimErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CimErrorCode::Failed, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Ok,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    #[default]
    Empty,
    Payload(Value),
    ModuleStatus(Vec<OperationalStatus>),
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CimResponse {
    pub message_id: String,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CimException>,
    /// `false` for an intermediate chunk; more chunks or a final response
    /// follow.
    #[serde(default = "yes")]
    pub complete: bool,
    /// The real result will arrive later through the async-response callback.
    #[serde(default)]
    pub async_pending: bool,
    #[serde(default)]
    pub body: ResponseBody,
}

impl CimResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn with_error(mut self, error: CimException) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Payload(value) => Some(value),
            _ => None,
        }
    }

    pub fn module_status(&self) -> Option<&[OperationalStatus]> {
        match &self.body {
            ResponseBody::ModuleStatus(status) => Some(status),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Agent control messages
// -----------------------------------------------------------------------------

/// First message on every pipe. The agent answers with a null frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeAgent {
    pub home: String,
    /// Configuration properties whose current value differs from the default.
    #[serde(default)]
    pub config_properties: Vec<(String, String)>,
    #[serde(default)]
    pub bind_verbose: bool,
    #[serde(default)]
    pub subscription_init_complete: bool,
}

/// Indication generated by a provider inside an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicationRequest {
    pub message_id: String,
    pub payload: Value,
    /// Set by the router to the agent name it was received from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oop_agent_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicationResponse {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oop_agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CimException>,
}

impl IndicationRequest {
    pub fn acknowledge(&self) -> IndicationResponse {
        IndicationResponse {
            message_id: self.message_id.clone(),
            oop_agent_name: self.oop_agent_name.clone(),
            error: None,
        }
    }
}

/// An agent asking the host for a class definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub message_id: String,
    pub namespace: String,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassResponse {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CimException>,
}
