//! Outbound sessions over a dedicated, connected UDP socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rand::RngExt as _;
use tracing::debug;

use crate::config::SessionConfig;
use crate::session::Session;
use crate::transport::ConnectedUdp;

/// Dial `addr` with the default configuration and a random conversation id.
pub fn dial(addr: impl ToSocketAddrs) -> Result<Session> {
    dial_with(addr, &SessionConfig::default())
}

pub fn dial_with(addr: impl ToSocketAddrs, config: &SessionConfig) -> Result<Session> {
    // Random ids only keep concurrent conversations apart; they carry no
    // security meaning.
    let conv = rand::rng().random::<u32>();
    dial_conv(addr, conv, config)
}

/// Dial with a caller-chosen conversation id.
pub fn dial_conv(addr: impl ToSocketAddrs, conv: u32, config: &SessionConfig) -> Result<Session> {
    let remote = addr
        .to_socket_addrs()
        .context("failed to resolve remote address")?
        .next()
        .ok_or_else(|| anyhow!("remote address resolved to nothing"))?;

    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).context("failed to bind dial socket")?;
    socket
        .set_read_timeout(Some(config.socket_poll))
        .context("failed to set dial socket read timeout")?;
    let transport = ConnectedUdp::connect(socket, remote)
        .with_context(|| format!("failed to connect to {remote}"))?;

    let session = Session::client(conv, Arc::new(transport), remote, config)
        .context("failed to start session")?;
    debug!(conv, peer = %remote, "dialed");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use std::io;
    use std::time::Duration;

    #[test]
    fn dial_unresolvable_fails() {
        let err = dial("definitely-not-a-host.invalid:4000").unwrap_err();
        assert!(err.to_string().contains("resolve"), "{err:#}");
    }

    #[test]
    fn dial_conv_pins_the_id() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let session = dial_conv(
            server.local_addr().unwrap(),
            0xDEAD_BEEF,
            &SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(session.conv(), 0xDEAD_BEEF);
        assert_eq!(session.remote_addr(), server.local_addr().unwrap());
        assert_eq!(session.role(), crate::session::Role::Client);
    }

    #[test]
    fn refused_peer_kills_the_client_session() {
        let vacant = {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap()
        };
        let session = dial_conv(vacant, 1, &SessionConfig::default()).unwrap();
        session.write(b"anyone there").unwrap();

        match session.read_timeout(&mut [0u8; 16], Duration::from_secs(5)) {
            Err(SessionError::Transport(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused)
            }
            other => panic!("expected connection refused, got {other:?}"),
        }
        assert!(session.is_dead());
    }
}
