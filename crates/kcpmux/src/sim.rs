//! # In-Memory Datagram Network
//!
//! A process-local stand-in for UDP used to exercise listeners and sessions
//! without sockets. Endpoints get synthetic `10.0.0.1:<port>` addresses and
//! deliver into each other's bounded queues. Datagrams to unknown addresses,
//! into full queues, or from a blocked endpoint vanish exactly as they would
//! on a real network.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::DatagramTransport;

const ENDPOINT_QUEUE: usize = 4096;

type Route = Sender<(Bytes, SocketAddr)>;

/// Shared routing table for in-memory endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<HashMap<SocketAddr, Route>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(10_000)),
        }
    }

    /// Attach a new endpoint with a fresh address.
    pub fn endpoint(&self) -> MemoryEndpoint {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.endpoint_at(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), port)))
    }

    /// Attach an endpoint at a fixed address, replacing any previous one.
    pub fn endpoint_at(&self, addr: SocketAddr) -> MemoryEndpoint {
        let (tx, rx) = bounded(ENDPOINT_QUEUE);
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, tx);
        MemoryEndpoint {
            addr,
            inbox: rx,
            network: self.clone(),
            poll: Duration::from_millis(20),
            blocked: AtomicBool::new(false),
            fail_with: Mutex::new(None),
            sent: AtomicU64::new(0),
        }
    }

    fn route(&self, addr: &SocketAddr) -> Option<Route> {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .cloned()
    }

    fn detach(&self, addr: &SocketAddr) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One attached address on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    addr: SocketAddr,
    inbox: Receiver<(Bytes, SocketAddr)>,
    network: MemoryNetwork,
    poll: Duration,
    blocked: AtomicBool,
    fail_with: Mutex<Option<io::ErrorKind>>,
    sent: AtomicU64,
}

impl MemoryEndpoint {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Silently drop everything this endpoint sends while `blocked`.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Make every subsequent `send_to` fail with `kind` (`None` to heal).
    pub fn fail_sends(&self, kind: Option<io::ErrorKind>) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    /// Datagrams successfully handed to `send_to`, including dropped ones.
    pub fn datagrams_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Inject a datagram as if it came from `from`.
    pub fn inject(&self, from: SocketAddr, payload: &[u8]) {
        if let Some(route) = self.network.route(&self.addr) {
            let _ = route.try_send((Bytes::copy_from_slice(payload), from));
        }
    }
}

impl DatagramTransport for MemoryEndpoint {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if let Some(kind) = *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(io::Error::new(kind, "injected send failure"));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.blocked.load(Ordering::SeqCst) {
            return Ok(buf.len());
        }
        if let Some(route) = self.network.route(&addr) {
            let _ = route.try_send((Bytes::copy_from_slice(buf), self.addr));
        }
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbox.recv_timeout(self.poll) {
            Ok((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.network.detach(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::is_poll_timeout;

    #[test]
    fn endpoints_exchange_datagrams() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        let b = net.endpoint();
        assert_ne!(a.addr(), b.addr());

        a.send_to(b"hi", b.addr()).unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, a.addr());
    }

    #[test]
    fn blocked_endpoint_drops_silently() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        let b = net.endpoint();
        a.set_blocked(true);
        assert_eq!(a.send_to(b"lost", b.addr()).unwrap(), 4);
        assert_eq!(a.datagrams_sent(), 1);

        let mut buf = [0u8; 8];
        let err = b.recv_from(&mut buf).unwrap_err();
        assert!(is_poll_timeout(&err));
    }

    #[test]
    fn injected_failures_surface() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        a.fail_sends(Some(io::ErrorKind::ConnectionRefused));
        let err = a.send_to(b"x", a.addr()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        a.fail_sends(None);
        assert!(a.send_to(b"x", a.addr()).is_ok());
    }

    #[test]
    fn dropped_endpoint_detaches() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        let b = net.endpoint();
        let b_addr = b.addr();
        drop(b);
        assert!(net.route(&b_addr).is_none());
        assert!(a.send_to(b"void", b_addr).is_ok());
    }
}
