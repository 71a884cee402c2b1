// # puffsyncd - Puff Counter Daemon
//
// Keeps a session connected to the device behind a radio bridge and prints
// every reconciled puff event to stdout as one JSON object per line. Logs go
// to stderr.
//
// This is a thin integration layer: connection handling, reconciliation and
// reconnection all live in puffsync-core.
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Bridge
// - `PUFFSYNC_BRIDGE_PATH`: File or FIFO written by the radio bridge (required)
// - `PUFFSYNC_DEVICE_ID`: Stable id of the bridged device (default: `bridge`)
// - `PUFFSYNC_DEVICE_NAME`: Advertised name, checked against the name filter
//
// ### Baselines
// - `PUFFSYNC_BASELINE_PATH`: Baseline file; in-memory when unset
//
// ### Reconnection
// - `PUFFSYNC_RECONNECT_DELAY_MS`: Delay before an automatic attempt (default: 1200)
// - `PUFFSYNC_RECONNECT_MAX_DELAY_MS`: Enables doubling backoff up to this delay
// - `PUFFSYNC_RECONNECT_MAX_ATTEMPTS`: Give up after this many failed attempts
//
// Automatic reconnection only follows the loss of a live link. A failed first
// connect exits with code 2.
//
// ### Logging
// - `PUFFSYNC_LOG_LEVEL`: trace, debug, info, warn or error (default: info)
//
// ## Example
//
// ```bash
// export PUFFSYNC_BRIDGE_PATH=/run/puffsync/bridge.fifo
// export PUFFSYNC_DEVICE_ID=C4:7F:51:0A:22:9E
// export PUFFSYNC_DEVICE_NAME=Purifier-ACQD-01
// export PUFFSYNC_BASELINE_PATH=/var/lib/puffsync/baselines.json
//
// puffsyncd | jq .delta
// ```

mod bridge;

use anyhow::{Context, Result};
use puffsync_core::traits::{DeviceFilter, DeviceIdentity};
use puffsync_core::{
    BaselineStoreConfig, ConnectionStatus, DeviceSession, ReconnectPolicy, SessionConfig,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::bridge::BridgeTransport;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum PuffsyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<PuffsyncExitCode> for ExitCode {
    fn from(code: PuffsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

const DEFAULT_DEVICE_ID: &str = "bridge";
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1200;

/// Application configuration
#[derive(Debug)]
struct Config {
    bridge_path: PathBuf,
    device_id: String,
    device_name: Option<String>,
    baseline_path: Option<PathBuf>,
    reconnect_delay_ms: u64,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    log_level: String,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{} has an invalid value '{}'", name, value))
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bridge_path = lookup("PUFFSYNC_BRIDGE_PATH").context(
            "PUFFSYNC_BRIDGE_PATH is required. \
            Set it via: export PUFFSYNC_BRIDGE_PATH=/run/puffsync/bridge.fifo",
        )?;

        Ok(Self {
            bridge_path: PathBuf::from(bridge_path),
            device_id: lookup("PUFFSYNC_DEVICE_ID")
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            device_name: lookup("PUFFSYNC_DEVICE_NAME").filter(|name| !name.is_empty()),
            baseline_path: lookup("PUFFSYNC_BASELINE_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            reconnect_delay_ms: parse_var(&lookup, "PUFFSYNC_RECONNECT_DELAY_MS")?
                .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            reconnect_max_delay_ms: parse_var(&lookup, "PUFFSYNC_RECONNECT_MAX_DELAY_MS")?,
            reconnect_max_attempts: parse_var(&lookup, "PUFFSYNC_RECONNECT_MAX_ATTEMPTS")?,
            log_level: lookup("PUFFSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.bridge_path.as_os_str().is_empty() {
            anyhow::bail!("PUFFSYNC_BRIDGE_PATH cannot be empty");
        }

        if self.device_id.trim().is_empty() {
            anyhow::bail!("PUFFSYNC_DEVICE_ID cannot be empty");
        }

        if let Some(ref path) = self.baseline_path {
            check_parent_exists("PUFFSYNC_BASELINE_PATH", path)?;
        }

        if !(100..=600_000).contains(&self.reconnect_delay_ms) {
            anyhow::bail!(
                "PUFFSYNC_RECONNECT_DELAY_MS must be between 100 and 600000. Got: {}",
                self.reconnect_delay_ms
            );
        }

        if let Some(max_delay) = self.reconnect_max_delay_ms
            && (max_delay < self.reconnect_delay_ms || max_delay > 3_600_000)
        {
            anyhow::bail!(
                "PUFFSYNC_RECONNECT_MAX_DELAY_MS must be between PUFFSYNC_RECONNECT_DELAY_MS ({}) \
                and 3600000. Got: {}",
                self.reconnect_delay_ms,
                max_delay
            );
        }

        if self.reconnect_max_attempts == Some(0) {
            anyhow::bail!(
                "PUFFSYNC_RECONNECT_MAX_ATTEMPTS must be at least 1. \
                Unset it to retry until the device comes back."
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "PUFFSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn device(&self) -> DeviceIdentity {
        let device = DeviceIdentity::new(self.device_id.trim());
        match &self.device_name {
            Some(name) => device.with_name(name),
            None => device,
        }
    }

    fn session_config(&self) -> SessionConfig {
        let reconnect = match self.reconnect_max_delay_ms {
            Some(max_delay_ms) => ReconnectPolicy {
                initial_delay_ms: self.reconnect_delay_ms,
                max_delay_ms,
                backoff_multiplier: 2.0,
                max_attempts: self.reconnect_max_attempts,
            },
            None => ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts,
                ..ReconnectPolicy::fixed(std::time::Duration::from_millis(
                    self.reconnect_delay_ms,
                ))
            },
        };

        let baseline_store = match &self.baseline_path {
            Some(path) => BaselineStoreConfig::File { path: path.clone() },
            None => BaselineStoreConfig::Memory,
        };

        SessionConfig {
            device_filter: DeviceFilter::default(),
            reconnect,
            baseline_store,
            ..SessionConfig::default()
        }
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn check_parent_exists(var: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        anyhow::bail!(
            "{} parent directory does not exist: {}. \
                Create it first: sudo mkdir -p {}",
            var,
            parent.display(),
            parent.display()
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return PuffsyncExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return PuffsyncExitCode::ConfigError.into();
    }

    // stdout carries the event stream
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return PuffsyncExitCode::ConfigError.into();
    }

    info!("Starting puffsyncd");
    info!(bridge = %config.bridge_path.display(), device = %config.device(), "Configuration loaded");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return PuffsyncExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            PuffsyncExitCode::RuntimeError
        } else {
            PuffsyncExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(config: Config) -> Result<()> {
    let session_config = config.session_config();
    let store = session_config
        .baseline_store
        .open()
        .await
        .context("failed to open baseline store")?;
    let transport = Arc::new(BridgeTransport::new(&config.bridge_path, config.device()));
    let session = DeviceSession::new(transport, store, session_config)?;

    let mut events = session.subscribe_events();
    let mut statuses = session.subscribe_status();

    // A failed first connect is fatal; the service manager owns restarts
    let device = session
        .connect()
        .await
        .context("initial connect to the bridge failed")?;
    info!(device = %device, "Connected to bridge");

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
            Some(status) = statuses.recv() => {
                info!(%status, "Connection status");
                if status == ConnectionStatus::Disconnected
                    && let Some(reason) = session.last_error()
                {
                    warn!("Disconnected: {}", reason);
                }
            }
            signal = &mut shutdown => {
                info!("Received shutdown signal: {}", signal?);
                break;
            }
        }
    }

    session.shutdown().await?;
    info!("Baselines flushed, daemon stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
