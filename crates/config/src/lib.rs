//! Layered configuration for the fleet orchestration core.
//!
//! Settings are resolved defaults → optional TOML file → environment
//! variables (prefix `FLEET_`), the same three-tier precedence the
//! teacher's `sentinel-config` crate applies, using the `config` crate
//! instead of a bespoke KDL parser since this core has no routing DSL to
//! express. Loading a config file is a thin convenience, not a feature
//! this core implements end-to-end — reading it from disk, watching it
//! for changes, and hot-reloading routes live in the out-of-scope HTTP
//! admin surface (spec.md §1).

mod agent;
mod control_plane;

pub use agent::AgentRuntimeConfig;
pub use control_plane::{ControlPlaneConfig, GrpcConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration is invalid: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Load the control-plane configuration from defaults, an optional file
/// at `path`, then environment variables prefixed `FLEET_CONTROL_`.
pub fn load_control_plane(path: Option<&str>) -> Result<ControlPlaneConfig, ConfigError> {
    use validator::Validate;

    let mut builder = config::Config::builder().add_source(ControlPlaneConfig::defaults_source());
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("FLEET_CONTROL")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: ControlPlaneConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the Agent runtime configuration the same way, under the
/// `FLEET_AGENT_` environment prefix.
pub fn load_agent_runtime(path: Option<&str>) -> Result<AgentRuntimeConfig, ConfigError> {
    use validator::Validate;

    let mut builder = config::Config::builder().add_source(AgentRuntimeConfig::defaults_source());
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("FLEET_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AgentRuntimeConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
