//! Configuration system for the weave workflow engine.
//!
//! Provides TOML-based configuration with:
//! - Engine defaults (`[engine]`): step timeout, retry backoff, retention
//! - The agent endpoint (`[agent]`)
//! - Logging (`[logging]`)
//! - Config file layering (user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
