//! Keepalive Proxy - HTTP forward proxy with resilient upstream connections

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keepalive_proxy::{
    config::{ConfigManager, ConfigOverrides},
    dialer::Connector,
    socks::Socks5Connector,
    Config, ErrorPolicy, FaultSupervisor, ProxyServer, ResilientDialer, ShutdownCoordinator, Target,
};

/// CLI arguments for Keepalive Proxy
#[derive(Parser, Debug)]
#[command(name = "keepalive-proxy")]
#[command(about = "HTTP forward proxy with resilient, kept-alive upstream connections")]
#[command(version)]
#[command(long_about = "
Keepalive Proxy - HTTP forward proxy with resilient upstream connections

Upstream connections go through a SOCKS5 relay (or directly in pure mode),
are retried with linear backoff, and are kept warm with null packets.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  KEEPALIVE_PROXY_SOCKS           - SOCKS5 relay address (e.g., 127.0.0.1:1081)
  KEEPALIVE_PROXY_SOCKS_USERNAME  - SOCKS5 relay username
  KEEPALIVE_PROXY_SOCKS_PASSWORD  - SOCKS5 relay password
  KEEPALIVE_PROXY_PORT            - Listen port
  KEEPALIVE_PROXY_PURE            - Dial targets directly (true/false)
  KEEPALIVE_PROXY_PROBE           - Send null packets (true/false)
  KEEPALIVE_PROXY_PROBE_INTERVAL  - Null packet interval (e.g., 30s)
  KEEPALIVE_PROXY_ERROR_POLICY    - retry, ignore or fatal
  KEEPALIVE_PROXY_READ_TIMEOUT    - Read timeout (e.g., 5s)
  KEEPALIVE_PROXY_WRITE_TIMEOUT   - Write timeout (e.g., 5s)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    #[arg(long, help = "SOCKS5 relay as host:port (e.g., 127.0.0.1:1081 or proxy.lan:1081)")]
    pub socks: Option<Target>,

    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    #[arg(long, help = "Dial targets directly instead of through the SOCKS5 relay")]
    pub pure: bool,

    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", help = "Keep client tunnels open while idle")]
    pub keepalive: Option<bool>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Idle timeout for kept-alive tunnels (e.g., 60s)")]
    pub keepalive_timeout: Option<Duration>,

    #[arg(long, help = "Maximum number of concurrent sessions")]
    pub max_idle_conns: Option<usize>,

    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", help = "Send null packets on idle upstream connections")]
    pub probe: Option<bool>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Null packet interval (e.g., 30s)")]
    pub probe_interval: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Upper bound on the null packet interval (e.g., 5s)")]
    pub min_probe_interval: Option<Duration>,

    #[arg(long, help = "Null packet size in bytes")]
    pub probe_size: Option<usize>,

    #[arg(long, help = "What to do with connection errors: retry, ignore or fatal")]
    pub error_policy: Option<ErrorPolicy>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Read timeout (e.g., 5s)")]
    pub read_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Write timeout (e.g., 5s)")]
    pub write_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            socks: self.socks.clone(),
            port: self.port,
            pure: self.pure.then_some(true),
            keepalive: self.keepalive,
            keepalive_timeout: self.keepalive_timeout,
            max_idle_conns: self.max_idle_conns,
            probe: self.probe,
            probe_interval: self.probe_interval,
            min_probe_interval: self.min_probe_interval,
            probe_size: self.probe_size,
            error_policy: self.error_policy,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing
    init_tracing(&args)?;

    info!("Starting Keepalive Proxy v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(&args.overrides());

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    if config.upstream.pure {
        let dialer = ResilientDialer::direct(config.server.read_timeout, config.retry.clone());
        run_proxy(config, dialer).await
    } else {
        let connector =
            Socks5Connector::new(config.upstream.socks_addr.clone()).with_auth(config.relay_auth());
        let dialer = ResilientDialer::via_socks5(connector, config.retry.clone());
        run_proxy(config, dialer).await
    }
}

/// Why the proxy stopped
enum Exit {
    Signal,
    ServerStopped(Result<()>),
    Fault(keepalive_proxy::FatalFault),
}

async fn run_proxy<C>(config: Config, dialer: ResilientDialer<C>) -> Result<()>
where
    C: Connector + 'static,
{
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let mut supervisor = FaultSupervisor::new();

    let server = Arc::new(ProxyServer::new(
        &config,
        dialer,
        supervisor.reporter(),
        &shutdown_coordinator,
    ));
    let listener = server.bind().await?;
    let mut server_handle = tokio::spawn(Arc::clone(&server).run(listener));

    info!("Keepalive Proxy started, press Ctrl+C or send SIGTERM/SIGINT to shut down");

    let exit = tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
            Exit::Signal
        }
        Some(fault) = supervisor.next_fault() => Exit::Fault(fault),
        joined = &mut server_handle => Exit::ServerStopped(
            joined.unwrap_or_else(|e| Err(anyhow!("Server task failed: {}", e)))
        ),
    };

    match exit {
        Exit::ServerStopped(result) => {
            shutdown_coordinator.trigger();
            result
        }
        Exit::Fault(fault) => {
            error!("Fatal error occurred: {}", fault);
            shutdown_coordinator.trigger();
            Err(anyhow!(fault).context("Shutting down after fatal connection fault"))
        }
        Exit::Signal => {
            info!("Initiating graceful shutdown...");
            shutdown_coordinator.trigger();

            match server_handle.await {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) if !e.is_cancelled() => error!("Server task failed: {}", e),
                _ => {}
            }

            shutdown_coordinator.drain().await;
            info!("Server shutdown complete");
            Ok(())
        }
    }
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Listen address: {}", config.server.listen_addr);
    if config.upstream.pure {
        info!("  Upstream: direct (pure mode)");
    } else {
        info!(
            "  Upstream: SOCKS5 relay {}{}",
            config.upstream.socks_addr,
            if config.relay_auth().is_some() { " (with auth)" } else { "" }
        );
    }
    info!(
        "  Retry: up to {} attempts, backoff unit {:?}, cap {:?}",
        config.retry.max_attempts, config.retry.backoff_unit, config.retry.max_backoff
    );
    if config.probe.enabled {
        info!(
            "  Null packets: {} bytes every {:?}, error policy {}",
            config.probe.size,
            config.probe.effective_interval(),
            config.probe.error_policy
        );
    } else {
        info!("  Null packets: disabled");
    }
    info!(
        "  Keep-alive: {} (idle timeout {:?})",
        if config.server.keepalive { "on" } else { "off" },
        config.server.tunnel_idle_timeout()
    );
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
