//! sshfwd - forward local TCP ports through an SSH session

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshfwd::{
    config::{Config, ConfigManager},
    forward::BindFailurePolicy,
    Engine, EngineSettings, ShutdownCoordinator, SshTransport, Transport,
};

/// CLI arguments for sshfwd
#[derive(Parser, Debug)]
#[command(name = "sshfwd")]
#[command(about = "Forward local TCP ports through an SSH session")]
#[command(version)]
#[command(long_about = "
sshfwd - forward local TCP ports through an SSH session

Every forward rule binds a local address; each accepted connection is
relayed over its own direct-tcpip channel to the rule's remote address,
resolved and dialed by the SSH server.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file (YAML or TOML)

Environment variables:
  SSHFWD_SSH_HOST      - SSH server host
  SSHFWD_SSH_PORT      - SSH server port
  SSHFWD_SSH_USER      - SSH user
  SSHFWD_SSH_PASSWORD  - SSH password
  SSHFWD_IDLE_TIMEOUT  - Close sessions idle for this long (e.g., 5m)
  SSHFWD_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file (YAML or TOML)")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level (overrides config file)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// What to do when a forward rule cannot bind its local address
    #[arg(long, value_name = "abort|skip", help = "Bind failure policy (overrides config file)")]
    pub on_bind_failure: Option<BindFailurePolicy>,

    /// Maximum number of concurrent relay sessions
    #[arg(long, help = "Maximum number of concurrent relay sessions")]
    pub max_sessions: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load_from_file(&args.config)?;
    config.merge_with_cli_args(
        args.log_level.as_deref(),
        args.on_bind_failure,
        args.max_sessions,
    );
    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config)?;

    info!("Starting sshfwd v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", args.config.display());
    log_cli_overrides(&args);

    if args.validate_config {
        print_summary(&config);
        info!("Configuration is valid");
        return Ok(());
    }

    let rules = config.rules()?;
    let transport = Arc::new(
        SshTransport::connect(&config.ssh)
            .await
            .context("Failed to establish SSH session")?,
    );

    let coordinator = ShutdownCoordinator::new();
    let engine = Engine::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        rules,
        EngineSettings::from(&config.engine),
    );
    let handle = engine.start(&coordinator).await?;

    info!("sshfwd started, press Ctrl+C or send SIGTERM to stop");

    let signals = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
            signals.trigger();
        }
    });

    let engine_result = handle.wait().await;

    if let Err(e) = transport.disconnect().await {
        warn!("{:#}", e);
    }

    engine_result?;
    info!("Shutdown complete");
    Ok(())
}

fn log_cli_overrides(args: &CliArgs) {
    if let Some(level) = &args.log_level {
        info!("CLI override: log level set to {}", level);
    }
    if let Some(policy) = args.on_bind_failure {
        info!("CLI override: bind failure policy set to {}", policy);
    }
    if let Some(max) = args.max_sessions {
        info!("CLI override: max sessions set to {}", max);
    }
}

fn print_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  SSH server: {}@{}:{}", config.ssh.user, config.ssh.host, config.ssh.port);
    info!(
        "  Authentication: {}",
        match (&config.ssh.identity_file, &config.ssh.password) {
            (Some(_), Some(_)) => "publickey, password",
            (Some(_), None) => "publickey",
            _ => "password",
        }
    );
    info!(
        "  Host key: {}",
        if config.ssh.host_key.is_some() {
            "pinned"
        } else {
            "not pinned"
        }
    );
    for rule in &config.forwards {
        info!("  Forward: {} -> {}", rule.local, rule.remote);
    }
    info!("  On bind failure: {}", config.engine.on_bind_failure);
    info!(
        "  Max sessions: {}",
        config
            .engine
            .max_sessions
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );
    info!("  Idle timeout: {:?}", config.engine.idle_timeout);
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(config.logging.ansi),
        )
        .with(env_filter)
        .init();

    Ok(())
}
