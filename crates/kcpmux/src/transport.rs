//! # Datagram Transport
//!
//! The session layer writes frames with `send_to` and reads them with
//! `recv_from`, nothing more. A listener shares one unconnected socket among
//! all its sessions; a dialed session owns a socket connected to its single
//! peer, wrapped in [`ConnectedUdp`] so it presents the same shape.
//!
//! Sends never park the caller: the session writes while holding its engine
//! lock, so a full socket buffer must surface as `WouldBlock` rather than
//! stall every reader and writer. On unix both adapters pass `MSG_DONTWAIT`
//! per call; the socket itself stays blocking so reads keep their timeout.
//!
//! Readers rely on `recv_from` returning periodically (a socket read timeout)
//! so they can notice shutdown; see [`is_poll_timeout`].

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Unreliable datagram I/O.
pub trait DatagramTransport: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramTransport for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        #[cfg(unix)]
        {
            dontwait::send_to(self, buf, addr)
        }
        #[cfg(not(unix))]
        {
            UdpSocket::send_to(self, buf, addr)
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// A UDP socket connected to exactly one peer.
///
/// `send_to` ignores its address argument and `recv_from` reports the peer,
/// since the kernel already filters datagrams from anyone else.
#[derive(Debug)]
pub struct ConnectedUdp {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl ConnectedUdp {
    /// Connect `socket` to `peer`.
    pub fn connect(socket: UdpSocket, peer: SocketAddr) -> io::Result<Self> {
        socket.connect(peer)?;
        Ok(ConnectedUdp { socket, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl DatagramTransport for ConnectedUdp {
    fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        #[cfg(unix)]
        {
            dontwait::send(&self.socket, buf)
        }
        #[cfg(not(unix))]
        {
            self.socket.send(buf)
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv(buf).map(|n| (n, self.peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ─── Non-blocking Send ──────────────────────────────────────────────────────

#[cfg(unix)]
mod dontwait {
    use std::io;
    use std::mem;
    use std::net::{SocketAddr, UdpSocket};
    use std::os::unix::io::AsRawFd;

    /// `sendto(2)` with `MSG_DONTWAIT`.
    pub(super) fn send_to(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let (storage, len) = raw_addr(addr);
        // SAFETY: `buf` and `storage` outlive the call and `len` does not
        // exceed the size of `storage`.
        let ret = unsafe {
            libc::sendto(
                socket.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        sent(ret)
    }

    /// `send(2)` with `MSG_DONTWAIT` on a connected socket.
    pub(super) fn send(socket: &UdpSocket, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` outlives the call.
        let ret = unsafe {
            libc::send(
                socket.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        sent(ret)
    }

    fn sent(ret: libc::ssize_t) -> io::Result<usize> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn raw_addr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: all-zero bytes are a valid `sockaddr_storage`, and it is
        // large and aligned enough for either address family.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }
}

/// Whether a read error only means "nothing arrived before the poll timeout".
pub fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connected_udp_reports_peer() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let conn = ConnectedUdp::connect(client, server_addr).unwrap();
        assert_eq!(conn.peer(), server_addr);

        // The address argument is ignored.
        let bogus: SocketAddr = "127.0.0.1:9".parse().unwrap();
        conn.send_to(b"ping", bogus).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = DatagramTransport::recv_from(&server, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, conn.local_addr().unwrap());

        DatagramTransport::send_to(&server, b"pong", from).unwrap();
        let (n, from) = conn.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, server_addr);
    }

    #[test]
    fn unconnected_send_reaches_v6_peer() {
        // Hosts without IPv6 loopback have nothing to check.
        let Ok(server) = UdpSocket::bind("[::1]:0") else {
            return;
        };
        let client = UdpSocket::bind("[::1]:0").unwrap();
        let to = server.local_addr().unwrap();
        DatagramTransport::send_to(&client, b"six", to).unwrap();

        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = DatagramTransport::recv_from(&server, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"six");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[test]
    fn sends_leave_the_socket_blocking_for_reads() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(30)))
            .unwrap();
        let conn = ConnectedUdp::connect(client, server.local_addr().unwrap()).unwrap();
        conn.send_to(b"x", conn.peer()).unwrap();

        // The read timeout, not an immediate WouldBlock, ends an empty read.
        let start = std::time::Instant::now();
        let err = conn.recv_from(&mut [0u8; 4]).unwrap_err();
        assert!(is_poll_timeout(&err), "unexpected error kind {:?}", err.kind());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn read_timeout_is_a_poll_timeout() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut buf = [0u8; 16];
        let err = DatagramTransport::recv_from(&socket, &mut buf).unwrap_err();
        assert!(is_poll_timeout(&err), "unexpected error kind {:?}", err.kind());
    }

    #[test]
    fn other_errors_are_not_poll_timeouts() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_poll_timeout(&err));
    }
}
