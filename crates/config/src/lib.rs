//! Configuration loading: discovery, `${ENV}` substitution, format dispatch
//! (TOML, YAML, JSON) and validation.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        apply_env_overrides, clear_config_dir, config_dir, discover_and_load, find_config_file,
        load_config, load_or_discover, set_config_dir, validate,
    },
    schema::{
        AgentsConfig, ApiConfig, AuditConfig, AuthConfig, AuthMode, ExecConfig, GatewayConfig,
        PincerConfig, ProviderConfig, SessionsConfig, ToolsConfig,
    },
};
