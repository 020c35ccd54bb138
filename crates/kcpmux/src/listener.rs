//! # Listener
//!
//! One shared datagram socket, many sessions. Two threads do the work:
//!
//! ```text
//!   socket ──reader──▶ [packet queue] ──demux──▶ session inbound channels
//!                                          │
//!                                          └──▶ [accept queue] ──▶ accept()
//! ```
//!
//! The reader drops runts and never blocks on a full queue. The demultiplexer
//! keys sessions by source address, creates one on first sight and publishes
//! it to the accept queue before forwarding the datagram that created it.
//! When the accept queue stays full for `accept_timeout` the new session is
//! rejected; the next datagram from that address tries again.
//!
//! The table holds only each session's inbound sender and a weak handle.
//! Sessions report their death over a close channel and the demultiplexer
//! drops their entry.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::{
    bounded, select, unbounded, Receiver, SendTimeoutError, Sender, TrySendError,
};
use tracing::{debug, trace, warn};

use crate::arq::Kcp;
use crate::config::ListenerConfig;
use crate::engine::{ArqEngine, EngineFactory};
use crate::session::{CloseHook, Session, Shared};
use crate::signal::Latch;
use crate::stats::{bump, ListenerCounters, ListenerStats};
use crate::transport::{is_poll_timeout, DatagramTransport};
use crate::wire::{conversation_id, is_runt};

/// A datagram in transit from the reader to the demultiplexer.
struct Envelope {
    from: SocketAddr,
    payload: Bytes,
}

// ─── Listener ───────────────────────────────────────────────────────────────

/// Accepts sessions arriving on a shared datagram socket.
pub struct Listener {
    local_addr: SocketAddr,
    accept_rx: Receiver<Session>,
    shutdown: Arc<Latch>,
    counters: Arc<ListenerCounters>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Bind a UDP socket with the default configuration.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::bind_with(addr, ListenerConfig::default())
    }

    pub fn bind_with(addr: impl ToSocketAddrs, config: ListenerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).context("failed to bind listener socket")?;
        socket
            .set_read_timeout(Some(config.socket_poll))
            .context("failed to set listener read timeout")?;
        Self::from_transport(Arc::new(socket), config)
    }

    /// Serve an existing transport. Its `recv_from` must return periodically.
    pub fn from_transport(
        transport: Arc<dyn DatagramTransport>,
        config: ListenerConfig,
    ) -> Result<Self> {
        let engine_config = config.session.engine.clone();
        engine_config
            .validate()
            .context("invalid session engine configuration")?;
        let factory: EngineFactory = Arc::new(move |conv| {
            Box::new(Kcp::new(conv, engine_config.clone())) as Box<dyn ArqEngine>
        });
        Self::with_engine(transport, config, factory)
    }

    /// Serve `transport`, building each session's engine with `factory`.
    pub fn with_engine(
        transport: Arc<dyn DatagramTransport>,
        config: ListenerConfig,
        factory: EngineFactory,
    ) -> Result<Self> {
        let local_addr = transport
            .local_addr()
            .context("listener transport has no local address")?;

        let (packet_tx, packet_rx) = bounded(config.packet_queue);
        let (accept_tx, accept_rx) = bounded(config.accept_backlog);
        let (closed_tx, closed_rx) = unbounded();
        let shutdown = Arc::new(Latch::new());
        let counters = Arc::new(ListenerCounters::default());

        let reader = {
            let transport = transport.clone();
            let shutdown = shutdown.clone();
            let counters = counters.clone();
            let read_buffer = config.read_buffer;
            let backoff = config.socket_poll;
            thread::Builder::new()
                .name(format!("kcp-listen-{}", local_addr.port()))
                .spawn(move || {
                    run_reader(transport, packet_tx, shutdown, counters, read_buffer, backoff)
                })
                .context("failed to spawn listener reader")?
        };

        let demux = Demux {
            transport,
            config,
            factory,
            routes: HashMap::new(),
            accept_tx,
            closed_tx,
            counters: counters.clone(),
        };
        let demux_shutdown = shutdown.clone();
        let demux_handle = thread::Builder::new()
            .name(format!("kcp-demux-{}", local_addr.port()))
            .spawn(move || demux.run(packet_rx, closed_rx, demux_shutdown));
        let demux_handle = match demux_handle {
            Ok(handle) => handle,
            Err(err) => {
                shutdown.fire();
                let _ = reader.join();
                return Err(err).context("failed to spawn listener demultiplexer");
            }
        };

        debug!(addr = %local_addr, "listener bound");
        Ok(Listener {
            local_addr,
            accept_rx,
            shutdown,
            counters,
            threads: Mutex::new(vec![reader, demux_handle]),
        })
    }

    /// Block until a new session arrives. `None` once the listener is shut
    /// down.
    pub fn accept(&self) -> Option<Session> {
        if self.shutdown.is_fired() {
            return None;
        }
        select! {
            recv(self.accept_rx) -> msg => msg.ok(),
            recv(self.shutdown.watch()) -> _ => None,
        }
    }

    /// Like [`accept`](Self::accept), also giving up after `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Option<Session> {
        if self.shutdown.is_fired() {
            return None;
        }
        select! {
            recv(self.accept_rx) -> msg => msg.ok(),
            recv(self.shutdown.watch()) -> _ => None,
            default(timeout) => None,
        }
    }

    /// Stop reading and demultiplexing. Sessions already created stay alive
    /// and can still send, but receive nothing further. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.fire() {
            debug!(addr = %self.local_addr, "listener shutting down");
        }
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_fired()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Socket Reader ──────────────────────────────────────────────────────────

fn run_reader(
    transport: Arc<dyn DatagramTransport>,
    packets: Sender<Envelope>,
    shutdown: Arc<Latch>,
    counters: Arc<ListenerCounters>,
    read_buffer: usize,
    backoff: Duration,
) {
    let mut buf = vec![0u8; read_buffer];
    while !shutdown.is_fired() {
        match transport.recv_from(&mut buf) {
            Ok((n, from)) => {
                bump(&counters.datagrams_received);
                let frame = &buf[..n];
                if is_runt(frame) {
                    bump(&counters.runts);
                    trace!(peer = %from, len = n, "runt dropped");
                    continue;
                }
                let envelope = Envelope {
                    from,
                    payload: Bytes::copy_from_slice(frame),
                };
                match packets.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        bump(&counters.queue_dropped);
                        trace!(peer = %from, "packet queue full, datagram dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(err) if is_poll_timeout(&err) => {}
            Err(err) => {
                warn!(error = %err, "listener socket read failed");
                thread::sleep(backoff);
            }
        }
    }
    trace!("listener reader exited");
}

// ─── Demultiplexer ──────────────────────────────────────────────────────────

struct Route {
    inbound: Sender<Bytes>,
    session: Weak<Shared>,
}

struct Demux {
    transport: Arc<dyn DatagramTransport>,
    config: ListenerConfig,
    factory: EngineFactory,
    routes: HashMap<SocketAddr, Route>,
    accept_tx: Sender<Session>,
    closed_tx: Sender<SocketAddr>,
    counters: Arc<ListenerCounters>,
}

impl Demux {
    fn run(
        mut self,
        packets: Receiver<Envelope>,
        closed: Receiver<SocketAddr>,
        shutdown: Arc<Latch>,
    ) {
        loop {
            select! {
                recv(packets) -> msg => match msg {
                    Ok(envelope) => self.dispatch(envelope),
                    Err(_) => break,
                },
                recv(closed) -> msg => {
                    if let Ok(addr) = msg {
                        self.forget(addr);
                    }
                }
                recv(shutdown.watch()) -> _ => break,
            }
        }
        trace!(routes = self.routes.len(), "demultiplexer exited");
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { from, payload } = envelope;
        let Some(conv) = conversation_id(&payload) else {
            bump(&self.counters.runts);
            return;
        };

        if !self.routes.contains_key(&from) && !self.admit(from, conv) {
            return;
        }
        let Some(route) = self.routes.get(&from) else {
            return;
        };
        match route.inbound.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                bump(&self.counters.inbound_dropped);
                trace!(peer = %from, conv, "session inbound full, datagram dropped");
            }
            Err(TrySendError::Disconnected(_)) => self.remove(from),
        }
    }

    /// Create a session for a new address and publish it. Returns whether
    /// the address now has a route.
    fn admit(&mut self, from: SocketAddr, conv: u32) -> bool {
        let closed_tx = self.closed_tx.clone();
        let on_close: CloseHook = Box::new(move || {
            let _ = closed_tx.send(from);
        });
        let engine = (self.factory)(conv);
        let (session, inbound) = match Session::server(
            engine,
            self.transport.clone(),
            from,
            &self.config.session,
            on_close,
        ) {
            Ok(created) => created,
            Err(err) => {
                warn!(peer = %from, conv, error = %err, "failed to start session");
                return false;
            }
        };
        let route = Route {
            inbound,
            session: session.downgrade(),
        };

        match self
            .accept_tx
            .send_timeout(session, self.config.accept_timeout)
        {
            Ok(()) => {
                self.routes.insert(from, route);
                self.sync_active();
                bump(&self.counters.sessions_created);
                debug!(peer = %from, conv, "session accepted into queue");
                true
            }
            Err(SendTimeoutError::Timeout(session)) => {
                bump(&self.counters.sessions_rejected);
                warn!(peer = %from, conv, "accept queue full, session rejected");
                drop(session);
                false
            }
            Err(SendTimeoutError::Disconnected(session)) => {
                drop(session);
                false
            }
        }
    }

    /// Drop the entry for `addr` if its session has died.
    fn forget(&mut self, addr: SocketAddr) {
        let dead = self
            .routes
            .get(&addr)
            .is_some_and(|route| route.session.upgrade().map_or(true, |s| s.is_dead()));
        if dead {
            self.remove(addr);
        }
    }

    fn remove(&mut self, addr: SocketAddr) {
        if self.routes.remove(&addr).is_some() {
            bump(&self.counters.sessions_removed);
            self.sync_active();
            trace!(peer = %addr, "session route removed");
        }
    }

    fn sync_active(&self) {
        self.counters.active_sessions.store(
            self.routes.len() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }
}
