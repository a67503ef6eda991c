use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use pincer_config::PincerConfig;

#[derive(Parser)]
#[command(name = "pincer", about = "Pincer: chat gateway for AI agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `gateway.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `gateway.port`.
        #[arg(long)]
        port: Option<u16>,
        /// Config file; discovered when omitted.
        #[arg(long, env = "PINCER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Load and validate config, then print the resolved settings.
    Doctor {
        #[arg(long, env = "PINCER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Query `/health` of a running gateway.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:18789")]
        url: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(path: Option<&Path>) -> anyhow::Result<PincerConfig> {
    let config = pincer_config::load_or_discover(path)?;
    pincer_config::validate(&config).context("invalid configuration")?;
    Ok(config)
}

async fn run_gateway(
    bind: Option<String>,
    port: Option<u16>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = pincer_config::load_or_discover(config.as_deref())?;
    if let Some(bind) = bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    pincer_config::validate(&config).context("invalid configuration")?;
    pincer_gateway::start_gateway(config, None).await
}

fn doctor(config: Option<PathBuf>) -> anyhow::Result<()> {
    let source = config.clone().or_else(pincer_config::find_config_file);
    match &source {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: defaults"),
    }
    let config = load(config.as_deref())?;
    let gw = &config.gateway;
    println!("listen: {}:{}", gw.bind, gw.port);
    println!("auth mode: {}", gw.auth.resolved_mode().as_str());
    println!(
        "connections: {} per IP per {}ms",
        gw.max_connections_per_ip, gw.connection_window_ms
    );
    println!(
        "messages: {}/min, burst {}, max {} bytes, depth {}",
        gw.messages_per_minute, gw.message_burst, gw.max_message_bytes, gw.max_json_depth
    );
    println!(
        "timeouts: handshake {}ms, ping {}ms, pong {}ms",
        gw.handshake_timeout_ms, gw.ping_interval_ms, gw.pong_timeout_ms
    );
    println!(
        "sessions: ttl {}s, max context {}",
        config.sessions.ttl_secs, config.sessions.max_context_messages
    );
    println!("agents: {}", config.agents.list.len().max(1));
    println!("ok");
    Ok(())
}

async fn status(url: &str) -> anyhow::Result<()> {
    let endpoint = format!("{}/health", url.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::get(&endpoint)
        .await
        .with_context(|| format!("gateway unreachable at {url}"))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "pincer starting");

    match cli.command {
        Commands::Gateway { bind, port, config } => run_gateway(bind, port, config).await,
        Commands::Doctor { config } => doctor(config),
        Commands::Status { url } => status(&url).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn gateway_flags_parse() {
        let cli = Cli::try_parse_from([
            "pincer",
            "--log-level",
            "debug",
            "gateway",
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Gateway { bind, port, .. } => {
                assert_eq!(bind.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            },
            _ => panic!("expected gateway"),
        }
    }

    #[test]
    fn status_has_default_url() {
        let cli = Cli::try_parse_from(["pincer", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { ref url } if url == "http://127.0.0.1:18789"));
    }
}
