pub mod agent;
pub mod channel;
pub mod message;
pub mod wire;

pub use agent::{AgentHandler, Responder, run};
pub use channel::{ChannelError, FrameReader, FrameWriter};
pub use wire::AgentMessage;
