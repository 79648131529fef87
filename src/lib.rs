//! Routes provider requests to out-of-process provider agents.
//!
//! A [`router::Router`] owns one [`container::AgentContainer`] per module or
//! group and user. Containers start their agent through an
//! [`executor::Executor`] on first use, talk to it over a framed pipe and
//! report results through [`callbacks::RouterCallbacks`].

pub mod aggregator;
pub mod callbacks;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod executor;
pub mod logger;
pub mod maintenance;
pub mod outstanding;
pub mod registry;
pub mod router;

pub use agent_protocol;
