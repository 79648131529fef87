use agent_protocol::message::{CimErrorCode, CimException};
use thiserror::Error;

/// Failures raised inside the router. They never cross the router's public
/// API as errors; callers always receive them folded into a response.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("The maximum number of provider agent processes has been reached ({0})")]
    MaxProcessesReached(u32),

    #[error("Failed to start provider agent \"{name}\": {reason}")]
    AgentStartFailed { name: String, reason: String },

    #[error("Provider agent \"{name}\" failed to initialize: {reason}")]
    Handshake { name: String, reason: String },

    #[error("Lost connection with provider agent \"{0}\"")]
    LostConnection(String),

    #[error("Failed to allocate a thread to retry a request in \"{0}\"")]
    ThreadAllocation(String),

    #[error("Request not processed, server shutting down")]
    ShuttingDown,

    #[error("Provider module \"{0}\" has no designated user")]
    DesignatedUserMissing(String),

    #[error("Request {0} does not name a provider module")]
    MissingProviderModule(String),

    #[error("Provider response Timeout")]
    ProviderTimeout,
}

impl From<RouterError> for CimException {
    fn from(err: RouterError) -> Self {
        let code = match &err {
            RouterError::MissingProviderModule(_) => CimErrorCode::InvalidParameter,
            RouterError::DesignatedUserMissing(_) => CimErrorCode::AccessDenied,
            _ => CimErrorCode::Failed,
        };
        CimException::new(code, err.to_string())
    }
}
