//! Configuration Manager

use super::Config;
use crate::dialer::Target;
use crate::keepalive::ErrorPolicy;
use crate::socks::RelayAuth;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "KEEPALIVE_PROXY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Same as [`load_from_env`](Self::load_from_env) with an injectable lookup
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(socks) = lookup("SOCKS") {
            config.upstream.socks_addr = socks
                .parse::<Target>()
                .with_context(|| format!("Invalid {}SOCKS: {}", ENV_PREFIX, socks))?;
        }

        if let Some(port) = lookup("PORT") {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid {}PORT: {}", ENV_PREFIX, port))?;
            config.server.listen_addr.set_port(port);
        }

        if let Some(pure) = lookup("PURE") {
            config.upstream.pure = pure
                .parse::<bool>()
                .with_context(|| format!("Invalid {}PURE: {}", ENV_PREFIX, pure))?;
        }

        if let Some(enabled) = lookup("PROBE") {
            config.probe.enabled = enabled
                .parse::<bool>()
                .with_context(|| format!("Invalid {}PROBE: {}", ENV_PREFIX, enabled))?;
        }

        if let Some(interval) = lookup("PROBE_INTERVAL") {
            config.probe.interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid {}PROBE_INTERVAL: {}", ENV_PREFIX, interval))?;
        }

        if let Some(policy) = lookup("ERROR_POLICY") {
            config.probe.error_policy = policy
                .parse::<ErrorPolicy>()
                .with_context(|| format!("Invalid {}ERROR_POLICY", ENV_PREFIX))?;
        }

        if let Some(timeout) = lookup("READ_TIMEOUT") {
            config.server.read_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}READ_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(timeout) = lookup("WRITE_TIMEOUT") {
            config.server.write_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}WRITE_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        config.upstream.username = lookup("SOCKS_USERNAME").or(config.upstream.username);
        config.upstream.password = lookup("SOCKS_PASSWORD").or(config.upstream.password);

        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub socks: Option<Target>,
    pub port: Option<u16>,
    pub pure: Option<bool>,
    pub keepalive: Option<bool>,
    pub keepalive_timeout: Option<Duration>,
    pub max_idle_conns: Option<usize>,
    pub probe: Option<bool>,
    pub probe_interval: Option<Duration>,
    pub min_probe_interval: Option<Duration>,
    pub probe_size: Option<usize>,
    pub error_policy: Option<ErrorPolicy>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_retry_config()
            .with_context(|| "Retry configuration validation failed")?;

        self.validate_probe_config()
            .with_context(|| "Probe configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_idle_conns == 0 {
            bail!("max_idle_conns must be greater than 0");
        }

        if self.server.read_timeout.is_zero() {
            bail!("read_timeout must be greater than 0");
        }

        if self.server.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if self.server.keepalive && self.server.keepalive_timeout.is_zero() {
            bail!("keepalive_timeout must be greater than 0 when keepalive is enabled");
        }

        Ok(())
    }

    /// Validate upstream configuration
    fn validate_upstream_config(&self) -> Result<()> {
        match (&self.upstream.username, &self.upstream.password) {
            (Some(user), Some(pass)) => {
                if user.is_empty() || user.len() > 255 {
                    bail!("upstream username must be 1-255 bytes");
                }
                if pass.is_empty() || pass.len() > 255 {
                    bail!("upstream password must be 1-255 bytes");
                }
            }
            (None, None) => {}
            _ => bail!("upstream username and password must be set together"),
        }

        Ok(())
    }

    /// Validate retry configuration
    fn validate_retry_config(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }

        if let Some(cap) = self.retry.max_backoff {
            if cap < self.retry.backoff_unit {
                bail!("max_backoff cannot be shorter than backoff_unit");
            }
        }

        Ok(())
    }

    /// Validate probe configuration
    fn validate_probe_config(&self) -> Result<()> {
        if !self.probe.enabled {
            return Ok(());
        }

        if self.probe.size == 0 {
            bail!("probe size must be at least 1 byte");
        }

        if self.probe.size > 65536 {
            bail!("probe size cannot exceed 64KiB");
        }

        if self.probe.effective_interval().is_zero() {
            bail!("probe interval and min_interval must be greater than 0");
        }

        if self.upstream.pure && self.probe.effective_interval() >= self.server.read_timeout {
            tracing::warn!(
                "Probe interval {:?} does not beat read_timeout {:?}; idle direct connections will time out",
                self.probe.effective_interval(),
                self.server.read_timeout
            );
        }

        Ok(())
    }

    /// The relay credentials, if both halves are configured
    pub fn relay_auth(&self) -> Option<RelayAuth> {
        match (&self.upstream.username, &self.upstream.password) {
            (Some(username), Some(password)) => Some(RelayAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &ConfigOverrides) {
        if let Some(socks) = &overrides.socks {
            self.upstream.socks_addr = socks.clone();
            tracing::info!("CLI override: socks relay set to {}", socks);
        }

        if let Some(port) = overrides.port {
            self.server.listen_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(pure) = overrides.pure {
            self.upstream.pure = pure;
            tracing::info!("CLI override: pure mode {}", if pure { "on" } else { "off" });
        }

        if let Some(keepalive) = overrides.keepalive {
            self.server.keepalive = keepalive;
            tracing::info!("CLI override: keep-alive {}", if keepalive { "on" } else { "off" });
        }

        if let Some(timeout) = overrides.keepalive_timeout {
            self.server.keepalive_timeout = timeout;
            tracing::info!("CLI override: keep-alive timeout set to {:?}", timeout);
        }

        if let Some(max_idle) = overrides.max_idle_conns {
            self.server.max_idle_conns = max_idle;
            tracing::info!("CLI override: max idle connections set to {}", max_idle);
        }

        if let Some(probe) = overrides.probe {
            self.probe.enabled = probe;
            tracing::info!("CLI override: null packets {}", if probe { "on" } else { "off" });
        }

        if let Some(interval) = overrides.probe_interval {
            self.probe.interval = interval;
            tracing::info!("CLI override: probe interval set to {:?}", interval);
        }

        if let Some(interval) = overrides.min_probe_interval {
            self.probe.min_interval = interval;
            tracing::info!("CLI override: minimum probe interval set to {:?}", interval);
        }

        if let Some(size) = overrides.probe_size {
            self.probe.size = size;
            tracing::info!("CLI override: probe size set to {} bytes", size);
        }

        if let Some(policy) = overrides.error_policy {
            self.probe.error_policy = policy;
            tracing::info!("CLI override: error policy set to {}", policy);
        }

        if let Some(timeout) = overrides.read_timeout {
            self.server.read_timeout = timeout;
            tracing::info!("CLI override: read timeout set to {:?}", timeout);
        }

        if let Some(timeout) = overrides.write_timeout {
            self.server.write_timeout = timeout;
            tracing::info!("CLI override: write timeout set to {:?}", timeout);
        }
    }
}
