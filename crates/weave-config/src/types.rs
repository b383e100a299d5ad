//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [engine]                 # scheduling, retry and retention defaults
//! [agent]                  # agent endpoint
//! [logging]                # log level and file output
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weave_workflow::{EngineConfig, RetryPolicy};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaveConfig {
    /// Workflow engine configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,

    /// Agent endpoint configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSection>,

    /// Logging configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSection>,
}

impl WeaveConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole, not merged field by field.
    pub fn merge(&mut self, other: WeaveConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }

        if other.agent.is_some() {
            self.agent = other.agent;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// The engine section, or its defaults.
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// The agent section, or its defaults.
    pub fn agent(&self) -> AgentSection {
        self.agent.clone().unwrap_or_default()
    }

    /// The logging section, or its defaults.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        let engine = self.engine();
        if engine.default_step_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "engine.default_step_timeout_secs",
                "must be greater than zero",
            ));
        }
        if engine.retry_base_delay_ms > engine.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "engine.retry_base_delay_ms",
                format!(
                    "{} exceeds retry_max_delay_ms ({})",
                    engine.retry_base_delay_ms, engine.retry_max_delay_ms
                ),
            ));
        }
        if engine.event_capacity == 0 {
            return Err(ConfigError::invalid(
                "engine.event_capacity",
                "must be greater than zero",
            ));
        }

        if self.agent().request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "agent.request_timeout_secs",
                "must be greater than zero",
            ));
        }

        let level = self.logging().level;
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("'{}' is not one of {}", level, LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// `[engine]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Step timeout when neither the step nor its workflow sets one.
    pub default_step_timeout_secs: u64,
    /// Backoff before the first retry; doubles with each further retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single backoff.
    pub retry_max_delay_ms: u64,
    /// Buffer size of the live event channel.
    pub event_capacity: usize,
    /// Age after which finished executions are cleaned up.
    pub retention_hours: u64,
    /// Directory containing workflow TOML definitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_dir: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 30,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            event_capacity: 256,
            retention_hours: 24,
            workflow_dir: None,
        }
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        EngineConfig {
            default_step_timeout_secs: section.default_step_timeout_secs,
            retry: RetryPolicy::new(
                Duration::from_millis(section.retry_base_delay_ms),
                Duration::from_millis(section.retry_max_delay_ms),
            ),
            event_capacity: section.event_capacity,
            retention_hours: section.retention_hours,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// `[agent]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Base URL of the agent registry.
    pub base_url: String,
    /// Transport-level timeout for one HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            request_timeout_secs: 60,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rolling log files. Defaults to `<config dir>/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Write the log file as JSON lines.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
