//! # Configuration
//!
//! TOML input structs with every field optional, resolved against defaults
//! into [`SessionConfig`], [`ListenerConfig`] and [`Config`]. Resolution
//! rejects values the engine or the queues cannot run with.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::arq::KcpConfig;
use crate::wire::MAX_DATAGRAM;

pub const CONFIG_VERSION: u32 = 1;

// ─── Raw TOML input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub version: u32,
    pub session: SessionConfigInput,
    pub listener: ListenerConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub tick_interval_ms: Option<u64>,
    pub inbound_capacity: Option<usize>,
    pub read_ready_capacity: Option<usize>,
    pub socket_poll_ms: Option<u64>,
    pub mtu: Option<usize>,
    pub send_window: Option<u16>,
    pub recv_window: Option<u16>,
    pub min_rto_ms: Option<u32>,
    pub max_rto_ms: Option<u32>,
    pub fast_resend: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenerConfigInput {
    pub accept_backlog: Option<usize>,
    pub packet_queue: Option<usize>,
    pub accept_timeout_ms: Option<u64>,
    pub read_buffer: Option<usize>,
    pub socket_poll_ms: Option<u64>,
}

// ─── Resolved configuration ─────────────────────────────────────────────────

/// Per-session scheduling and engine parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Period of the engine clock tick.
    pub tick_interval: Duration,
    /// Bound of the inbound datagram channel.
    pub inbound_capacity: usize,
    /// Bound of the read-ready wakeup queue.
    pub read_ready_capacity: usize,
    /// Socket read timeout used by client-role readers to notice death.
    pub socket_poll: Duration,
    pub engine: KcpConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            inbound_capacity: 1024,
            read_ready_capacity: 1024,
            socket_poll: Duration::from_millis(100),
            engine: KcpConfig::default(),
        }
    }
}

/// Listener queueing and socket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Capacity of the accept queue.
    pub accept_backlog: usize,
    /// Capacity of the reader → demultiplexer queue.
    pub packet_queue: usize,
    /// How long the demultiplexer waits for accept-queue room before it
    /// rejects a new session.
    pub accept_timeout: Duration,
    /// Receive buffer per datagram.
    pub read_buffer: usize,
    /// Socket read timeout used by the reader to notice shutdown.
    pub socket_poll: Duration,
    /// Configuration for sessions the listener creates.
    pub session: SessionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 128,
            packet_queue: 8192,
            accept_timeout: Duration::from_secs(1),
            read_buffer: MAX_DATAGRAM,
            socket_poll: Duration::from_millis(50),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    pub session: SessionConfig,
    pub listener: ListenerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            session: SessionConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

impl SessionConfigInput {
    pub fn resolve(self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();
        let engine_defaults = KcpConfig::default();

        let tick_interval = self
            .tick_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval);
        if tick_interval.is_zero() {
            bail!("session.tick_interval_ms must be positive");
        }

        let engine = KcpConfig {
            mtu: self.mtu.unwrap_or(engine_defaults.mtu),
            send_window: self.send_window.unwrap_or(engine_defaults.send_window),
            recv_window: self.recv_window.unwrap_or(engine_defaults.recv_window),
            min_rto: self.min_rto_ms.unwrap_or(engine_defaults.min_rto),
            max_rto: self.max_rto_ms.unwrap_or(engine_defaults.max_rto),
            fast_resend: self.fast_resend.unwrap_or(engine_defaults.fast_resend),
            interval: tick_interval.as_millis().min(u32::MAX as u128) as u32,
        };
        engine.validate().context("invalid [session] engine settings")?;

        Ok(SessionConfig {
            tick_interval,
            inbound_capacity: positive(
                "session.inbound_capacity",
                self.inbound_capacity.unwrap_or(defaults.inbound_capacity),
            )?,
            read_ready_capacity: positive(
                "session.read_ready_capacity",
                self.read_ready_capacity
                    .unwrap_or(defaults.read_ready_capacity),
            )?,
            socket_poll: self
                .socket_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.socket_poll)
                .max(Duration::from_millis(1)),
            engine,
        })
    }
}

impl ListenerConfigInput {
    pub fn resolve(self, session: SessionConfig) -> Result<ListenerConfig> {
        let defaults = ListenerConfig::default();
        let read_buffer = self.read_buffer.unwrap_or(defaults.read_buffer);
        if read_buffer < session.engine.mtu {
            bail!(
                "listener.read_buffer ({}) is smaller than session.mtu ({})",
                read_buffer,
                session.engine.mtu
            );
        }
        Ok(ListenerConfig {
            accept_backlog: positive(
                "listener.accept_backlog",
                self.accept_backlog.unwrap_or(defaults.accept_backlog),
            )?,
            packet_queue: positive(
                "listener.packet_queue",
                self.packet_queue.unwrap_or(defaults.packet_queue),
            )?,
            accept_timeout: self
                .accept_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.accept_timeout),
            read_buffer,
            socket_poll: self
                .socket_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.socket_poll)
                .max(Duration::from_millis(1)),
            session,
        })
    }
}

impl ConfigInput {
    pub fn resolve(self) -> Result<Config> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("unsupported config version {}", version);
        }
        let session = self.session.resolve()?;
        let listener = self.listener.resolve(session.clone())?;
        Ok(Config {
            version,
            session,
            listener,
        })
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Config::default());
        }
        let parsed: ConfigInput = toml::from_str(input).context("invalid config TOML")?;
        parsed.resolve()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }
}

fn positive(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        bail!("{name} must be positive");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::OVERHEAD;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = Config::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listener.accept_backlog, 128);
        assert_eq!(cfg.listener.packet_queue, 8192);
        assert_eq!(cfg.session.tick_interval, Duration::from_millis(10));
        assert_eq!(cfg.session.read_ready_capacity, 1024);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [session]
            tick_interval_ms = 20
            mtu = 1200
            send_window = 64
            min_rto_ms = 50
            max_rto_ms = 2000

            [listener]
            accept_backlog = 16
            accept_timeout_ms = 250
        "#;

        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.session.tick_interval, Duration::from_millis(20));
        assert_eq!(cfg.session.engine.mtu, 1200);
        assert_eq!(cfg.session.engine.send_window, 64);
        assert_eq!(cfg.session.engine.interval, 20);
        assert_eq!(cfg.session.engine.recv_window, 128);
        assert_eq!(cfg.listener.accept_backlog, 16);
        assert_eq!(cfg.listener.accept_timeout, Duration::from_millis(250));
        assert_eq!(cfg.listener.session, cfg.session);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = Config::from_toml_str("version = 7").unwrap_err();
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn rejects_inverted_rto_bounds() {
        let toml = "[session]\nmin_rto_ms = 500\nmax_rto_ms = 100\n";
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(format!("{err:#}").contains("exceeds max_rto"), "{err:#}");
    }

    #[test]
    fn rejects_mtu_not_larger_than_header() {
        let toml = format!("[session]\nmtu = {OVERHEAD}\n");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn rejects_zero_backlog() {
        let toml = "[listener]\naccept_backlog = 0\n";
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("listener.accept_backlog"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Config::from_toml_str("session = [").is_err());
    }
}
