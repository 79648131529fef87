use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the structured agent lifecycle events written to the JSON log.
pub const EVENT_TARGET: &str = "agent_event";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `"info,agent_router=debug"`.
    pub log_level: String,
    /// With a directory, logs go to daily rolling files instead of stderr.
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub event_file: String,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self { log_level: log_level.into(), log_dir, ..Self::default() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_file: "agent_router.log".to_string(),
            event_file: "agent_events.json".to_string(),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
///
/// - no `log_dir`: human readable lines on stderr
/// - `log_dir`: a rolling text log plus a rolling JSON log holding only
///   [`EVENT_TARGET`] events
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(dir) = &config.log_dir else {
        Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
            .try_init()
            .context("installing tracing subscriber")?;
        return Ok(());
    };

    fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

    // 1) plain-text rolling log for everything the filter lets through
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.log_file);
    let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

    // 2) JSON rolling log with agent lifecycle events only
    let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.event_file);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{EVENT_TARGET}=info")));

    Registry::default()
        .with(env_filter)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

/// Router counters on the global meter. Without an installed meter provider
/// they record nothing.
#[derive(Clone)]
pub struct RouterMetrics {
    pub agents_started: Counter<u64>,
    pub agents_failed: Counter<u64>,
    pub agent_exits: Counter<u64>,
    pub requests_dispatched: Counter<u64>,
    pub requests_retried: Counter<u64>,
    pub responses_discarded: Counter<u64>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        let meter = global::meter("agent-router");
        Self {
            agents_started: meter
                .u64_counter("agents_started")
                .with_description("Provider agent processes started")
                .build(),
            agents_failed: meter
                .u64_counter("agents_failed")
                .with_description("Provider agents that failed to start or initialize")
                .build(),
            agent_exits: meter
                .u64_counter("agent_exits")
                .with_description("Provider agent disconnects, by cleanliness")
                .build(),
            requests_dispatched: meter.u64_counter("requests_dispatched").build(),
            requests_retried: meter.u64_counter("requests_retried").build(),
            responses_discarded: meter
                .u64_counter("responses_discarded")
                .with_description("Agent responses with no outstanding request")
                .build(),
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
