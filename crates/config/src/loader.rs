use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    anyhow::{Context, bail},
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{
    env_subst::substitute_env,
    schema::{AuthMode, PincerConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["pincer.toml", "pincer.yaml", "pincer.yml", "pincer.json"];

pub const TOKEN_ENV: &str = "PINCER_TOKEN";
pub const PASSWORD_ENV: &str = "PINCER_PASSWORD";

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, discovery only looks there.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load config from the given path (any supported format), then apply
/// environment overrides.
pub fn load_config(path: &Path) -> anyhow::Result<PincerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./pincer.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/pincer/pincer.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to defaults (plus environment overrides) when nothing is found
/// or the file fails to load.
pub fn discover_and_load() -> PincerConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = PincerConfig::default();
    apply_env_overrides(&mut config);
    config
}

/// Load `path` when given (errors propagate), otherwise discover.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<PincerConfig> {
    match path {
        Some(p) => load_config(p),
        None => Ok(discover_and_load()),
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    config_dir().and_then(|dir| first_existing(&dir))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/pincer/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("pincer"))
}

/// `PINCER_TOKEN` / `PINCER_PASSWORD` win over the file.
pub fn apply_env_overrides(config: &mut PincerConfig) {
    apply_overrides_with(config, |name| std::env::var(name).ok());
}

pub fn apply_overrides_with(config: &mut PincerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
        debug!("gateway token taken from {TOKEN_ENV}");
        config.gateway.auth.token = Some(Secret::new(token));
    }
    if let Some(password) = lookup(PASSWORD_ENV).filter(|p| !p.is_empty()) {
        debug!("gateway password taken from {PASSWORD_ENV}");
        config.gateway.auth.password = Some(Secret::new(password));
    }
}

/// Reject configurations the gateway cannot run with.
pub fn validate(config: &PincerConfig) -> anyhow::Result<()> {
    let gw = &config.gateway;
    match gw.auth.resolved_mode() {
        AuthMode::Token if gw.auth.token.is_none() => {
            bail!("gateway.auth.mode is \"token\" but no token is configured (set {TOKEN_ENV})")
        },
        AuthMode::Password if gw.auth.password.is_none() => bail!(
            "gateway.auth.mode is \"password\" but no password is configured (set {PASSWORD_ENV})"
        ),
        AuthMode::None if !is_loopback_host(&gw.bind) => {
            warn!(bind = %gw.bind, "auth mode is none on a non-loopback bind");
        },
        _ => {},
    }
    if gw.max_connections_per_ip == 0 || gw.connection_window_ms == 0 {
        bail!("gateway.maxConnectionsPerIp and gateway.connectionWindowMs must be positive");
    }
    if gw.messages_per_minute == 0 || gw.message_burst == 0 {
        bail!("gateway.messagesPerMinute and gateway.messageBurst must be positive");
    }
    if gw.max_message_bytes == 0 || gw.max_json_depth == 0 {
        bail!("gateway.maxMessageBytes and gateway.maxJsonDepth must be positive");
    }
    if gw.ping_interval_ms == 0 || gw.tick_interval_ms == 0 {
        bail!("gateway.pingIntervalMs and gateway.tickIntervalMs must be positive");
    }
    if gw.pong_timeout_ms <= gw.ping_interval_ms {
        bail!("gateway.pongTimeoutMs must exceed gateway.pingIntervalMs");
    }
    if config.sessions.max_context_messages == 0 {
        bail!("sessions.maxContextMessages must be positive");
    }
    if config.sessions.ttl_secs == 0 || config.sessions.sweep_interval_secs == 0 {
        bail!("sessions.ttlSecs and sessions.sweepIntervalSecs must be positive");
    }
    if config.audit.capacity == 0 {
        bail!("audit.capacity must be positive");
    }
    if let Some(ref default) = config.agents.default
        && !config.agents.list.is_empty()
        && !config.agents.list.iter().any(|a| &a.id == default)
    {
        bail!("agents.default \"{default}\" does not name a configured agent");
    }
    Ok(())
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "::1" | "[::1]") || host.starts_with("127.")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<PincerConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "pincer.toml",
            r#"
[gateway]
port = 9000
allowedOrigins = ["https://app.example"]
maxConnectionsPerIp = 5

[gateway.auth]
mode = "token"
token = "s3cret"

[sessions]
maxContextMessages = 20

[[agents.list]]
id = "ops"
model = "gpt-4o"
tools = { requireApproval = ["exec"] }
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.bind, "127.0.0.1");
        assert_eq!(cfg.gateway.max_connections_per_ip, 5);
        assert_eq!(cfg.gateway.allowed_origins, vec!["https://app.example"]);
        assert_eq!(cfg.gateway.auth.resolved_mode(), AuthMode::Token);
        assert_eq!(cfg.sessions.max_context_messages, 20);
        assert_eq!(cfg.agents.list[0].id, "ops");
        assert_eq!(cfg.agents.list[0].tools.require_approval, vec!["exec"]);
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = write(dir.path(), "pincer.yaml", "gateway:\n  port: 7000\naudit:\n  capacity: 10\n");
        let cfg = load_config(&yaml).unwrap();
        assert_eq!(cfg.gateway.port, 7000);
        assert_eq!(cfg.audit.capacity, 10);

        let json = write(dir.path(), "pincer.json", r#"{"api": {"loopbackExempt": false}}"#);
        let cfg = load_config(&json).unwrap();
        assert!(!cfg.api.loopback_exempt);
        assert_eq!(cfg.gateway.port, crate::schema::DEFAULT_PORT);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "pincer.ini", "port=1");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn env_overrides_secrets() {
        let mut cfg = PincerConfig::default();
        apply_overrides_with(&mut cfg, |name| match name {
            TOKEN_ENV => Some("from-env".into()),
            _ => None,
        });
        assert_eq!(
            cfg.gateway.auth.token.as_ref().unwrap().expose_secret(),
            "from-env"
        );
        assert!(cfg.gateway.auth.password.is_none());
        assert_eq!(cfg.gateway.auth.resolved_mode(), AuthMode::Token);
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut cfg = PincerConfig::default();
        cfg.gateway.auth.token = Some(Secret::new("hidden".into()));
        let out = serde_json::to_string(&cfg).unwrap();
        assert!(!out.contains("hidden"));
    }

    #[test]
    fn validation() {
        assert!(validate(&PincerConfig::default()).is_ok());

        let mut cfg = PincerConfig::default();
        cfg.gateway.auth.mode = Some(AuthMode::Token);
        assert!(validate(&cfg).is_err());

        let mut cfg = PincerConfig::default();
        cfg.gateway.message_burst = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = PincerConfig::default();
        cfg.gateway.pong_timeout_ms = cfg.gateway.ping_interval_ms;
        assert!(validate(&cfg).is_err());

        let mut cfg = PincerConfig::default();
        cfg.agents.list = vec![pincer_agents::AgentConfig::default()];
        cfg.agents.default = Some("ghost".into());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn discovery_uses_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pincer.yml", "gateway:\n  port: 6100\n");
        set_config_dir(dir.path().to_path_buf());
        let found = find_config_file();
        let cfg = discover_and_load();
        clear_config_dir();

        assert_eq!(found.unwrap(), dir.path().join("pincer.yml"));
        assert_eq!(cfg.gateway.port, 6100);
    }
}
