//! # kcpmux
//!
//! Reliable, ordered, record-oriented sessions multiplexed over UDP.
//!
//! A [`Listener`] owns one socket and fans inbound datagrams out to
//! per-peer [`Session`]s, which it hands out through a bounded accept queue.
//! [`dial`] opens a session over its own connected socket. Each session runs
//! an ARQ engine on a periodic tick and exposes blocking `read` plus
//! non-blocking, backpressured `write`.
//!
//! ## Crate structure
//!
//! - [`session`]: Per-session tick loop, read/write surface, liveness
//! - [`listener`]: Shared-socket reader, demultiplexer, accept queue
//! - [`dialer`]: Outbound sessions on a connected socket
//! - [`engine`]: The ARQ engine contract sessions drive
//! - [`arq`]: KCP-style reference engine
//! - [`wire`]: Segment header layout, conversation id
//! - [`transport`]: Datagram I/O abstraction over `UdpSocket`
//! - [`sim`]: In-memory datagram network for tests
//! - [`config`]: TOML configuration
//! - [`stats`]: Serializable session and listener counters
//! - [`error`]: Session error type
//! - [`clock`]: Millisecond engine clock

pub mod arq;
pub mod clock;
pub mod config;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod listener;
pub mod session;
mod signal;
pub mod sim;
pub mod stats;
pub mod transport;
pub mod wire;

pub use arq::{Kcp, KcpConfig};
pub use config::{Config, ListenerConfig, SessionConfig};
pub use dialer::{dial, dial_conv, dial_with};
pub use engine::{ArqEngine, EngineFactory};
pub use error::SessionError;
pub use listener::Listener;
pub use session::{Role, Session};
pub use stats::{ListenerStats, SessionStats};
