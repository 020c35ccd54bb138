//! # Sessions
//!
//! A [`Session`] wraps one [`ArqEngine`] and gives it a thread to live on:
//!
//! ```text
//!   inbound frames ─┐
//!                   ├──▶ tick loop ──lock──▶ engine ──output──▶ transport
//!   tick deadline ──┘                          ▲
//!                                              │ lock
//!              write() / read() ───────────────┘
//! ```
//!
//! Every engine call happens under one mutex. The tick loop feeds inbound
//! frames and advances the engine clock on a fixed deadline, so a steady
//! inbound stream cannot starve retransmission. Readers park on a bounded
//! wakeup queue plus the liveness latch; writers never block.
//!
//! Server-role sessions receive frames already demultiplexed by a
//! [`Listener`](crate::listener::Listener). Client-role sessions own a reader
//! thread on their point-to-point socket.
//!
//! Death is monotonic. A transport fault kills the session and is reported
//! once, to the next read or write; afterwards every call sees
//! [`SessionError::Closed`].

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::arq::Kcp;
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::engine::{ArqEngine, OutputFn, RecvError, SendError};
use crate::error::SessionError;
use crate::signal::{Latch, ReadySignal};
use crate::stats::{add, bump, SessionCounters, SessionStats};
use crate::transport::{is_poll_timeout, DatagramTransport};
use crate::wire::{is_runt, MAX_DATAGRAM};

/// Which side created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed; owns its socket and reader thread.
    Client,
    /// Created by a listener on first contact.
    Server,
}

pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

// ─── Shared State ───────────────────────────────────────────────────────────

pub(crate) struct Shared {
    conv: u32,
    role: Role,
    remote: SocketAddr,
    transport: Arc<dyn DatagramTransport>,
    engine: Mutex<Box<dyn ArqEngine>>,
    liveness: Latch,
    read_ready: ReadySignal,
    fault: Mutex<Option<io::Error>>,
    counters: SessionCounters,
    clock: Clock,
    on_close: Mutex<Option<CloseHook>>,
}

impl Shared {
    fn new(
        mut engine: Box<dyn ArqEngine>,
        role: Role,
        transport: Arc<dyn DatagramTransport>,
        remote: SocketAddr,
        config: &SessionConfig,
        on_close: Option<CloseHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Shared>| {
            engine.set_output(output_sink(weak.clone()));
            Shared {
                conv: engine.conv(),
                role,
                remote,
                transport,
                engine: Mutex::new(engine),
                liveness: Latch::new(),
                read_ready: ReadySignal::new(config.read_ready_capacity),
                fault: Mutex::new(None),
                counters: SessionCounters::default(),
                clock: Clock::new(),
                on_close: Mutex::new(on_close),
            }
        })
    }

    fn lock_engine(&self) -> MutexGuard<'_, Box<dyn ArqEngine>> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.liveness.is_fired()
    }

    /// Mark the session dead. Only the first call has any effect; its fault,
    /// if any, is kept for the next read or write.
    fn die(&self, fault: Option<io::Error>) {
        let first = {
            let mut slot = self.fault.lock().unwrap_or_else(|e| e.into_inner());
            let first = self.liveness.fire();
            if first {
                if let Some(err) = fault {
                    warn!(conv = self.conv, peer = %self.remote, error = %err, "session transport fault");
                    *slot = Some(err);
                }
            }
            first
        };
        if !first {
            return;
        }

        let hook = self
            .on_close
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }
        debug!(conv = self.conv, peer = %self.remote, role = ?self.role, "session closed");
    }

    fn check_alive(&self) -> Result<(), SessionError> {
        if !self.liveness.is_fired() {
            return Ok(());
        }
        match self.fault.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(err) => Err(SessionError::Transport(err)),
            None => Err(SessionError::Closed),
        }
    }

    /// Write one engine frame. Runs under the engine lock.
    fn transmit(&self, frame: &[u8]) {
        if self.liveness.is_fired() {
            return;
        }
        match self.transport.send_to(frame, self.remote) {
            Ok(_) => bump(&self.counters.datagrams_out),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                bump(&self.counters.output_dropped);
                trace!(conv = self.conv, peer = %self.remote, "output dropped, socket busy");
            }
            Err(err) => self.die(Some(err)),
        }
    }

    fn feed(&self, frame: &[u8]) {
        bump(&self.counters.frames_in);
        let readable = {
            let mut engine = self.lock_engine();
            if let Err(err) = engine.input(frame) {
                bump(&self.counters.frames_rejected);
                trace!(conv = self.conv, peer = %self.remote, error = %err, "frame rejected");
                return;
            }
            engine.peek_size().is_some()
        };
        if readable {
            self.read_ready.notify();
        }
    }

    fn tick(&self) {
        let now = self.clock.now_ms();
        self.lock_engine().update(now);
    }
}

/// The engine's output: a weak handle so the engine never keeps its own
/// session alive.
fn output_sink(shared: Weak<Shared>) -> OutputFn {
    Box::new(move |frame: &[u8]| {
        if let Some(shared) = shared.upgrade() {
            shared.transmit(frame);
        }
    })
}

// ─── Session ────────────────────────────────────────────────────────────────

/// A reliable, ordered, record-oriented conversation with one peer.
///
/// Dropping the handle closes the session and joins its threads.
pub struct Session {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Start a client-role session running the reference engine.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] when `config.engine` does
    /// not pass [`KcpConfig::validate`](crate::arq::KcpConfig::validate).
    ///
    /// `transport` should reach only `remote` (see
    /// [`ConnectedUdp`](crate::transport::ConnectedUdp)) and must return from
    /// `recv_from` periodically.
    pub fn client(
        conv: u32,
        transport: Arc<dyn DatagramTransport>,
        remote: SocketAddr,
        config: &SessionConfig,
    ) -> io::Result<Self> {
        config
            .engine
            .validate()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let engine = Box::new(Kcp::new(conv, config.engine.clone()));
        Self::client_with_engine(engine, transport, remote, config)
    }

    /// Start a client-role session around a caller-supplied engine.
    pub fn client_with_engine(
        engine: Box<dyn ArqEngine>,
        transport: Arc<dyn DatagramTransport>,
        remote: SocketAddr,
        config: &SessionConfig,
    ) -> io::Result<Self> {
        let (inbound_tx, inbound_rx) = bounded(config.inbound_capacity);
        let shared = Shared::new(engine, Role::Client, transport, remote, config, None);
        let session = Session::start(shared, inbound_rx, config.tick_interval)?;

        let reader_shared = session.shared.clone();
        let reader = thread::Builder::new()
            .name(format!("kcp-read-{:08x}", session.conv()))
            .spawn(move || run_reader(reader_shared, inbound_tx))?;
        session.track(reader);

        debug!(conv = session.conv(), peer = %remote, "client session started");
        Ok(session)
    }

    /// Start a server-role session. Frames arrive through the returned
    /// sender; `on_close` runs once when the session dies.
    pub(crate) fn server(
        engine: Box<dyn ArqEngine>,
        transport: Arc<dyn DatagramTransport>,
        remote: SocketAddr,
        config: &SessionConfig,
        on_close: CloseHook,
    ) -> io::Result<(Self, Sender<Bytes>)> {
        let (inbound_tx, inbound_rx) = bounded(config.inbound_capacity);
        let shared = Shared::new(engine, Role::Server, transport, remote, config, Some(on_close));
        let session = Session::start(shared, inbound_rx, config.tick_interval)?;
        debug!(conv = session.conv(), peer = %remote, "server session started");
        Ok((session, inbound_tx))
    }

    fn start(
        shared: Arc<Shared>,
        inbound: Receiver<Bytes>,
        tick_interval: Duration,
    ) -> io::Result<Self> {
        let tick_shared = shared.clone();
        let ticker = thread::Builder::new()
            .name(format!("kcp-tick-{:08x}", shared.conv))
            .spawn(move || run_ticker(tick_shared, inbound, tick_interval));
        match ticker {
            Ok(handle) => Ok(Session {
                shared,
                threads: Mutex::new(vec![handle]),
            }),
            Err(err) => {
                shared.die(None);
                Err(err)
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Queue `payload` as one record.
    ///
    /// Returns [`SessionError::WindowFull`] without queueing anything when
    /// the send window has no room. Empty payloads are accepted and ignored.
    pub fn write(&self, payload: &[u8]) -> Result<usize, SessionError> {
        self.shared.check_alive()?;
        if payload.is_empty() {
            return Ok(0);
        }

        let counters = &self.shared.counters;
        let mut engine = self.shared.lock_engine();
        if !engine.can_send() {
            bump(&counters.window_full);
            return Err(SessionError::WindowFull);
        }
        match engine.try_send(payload) {
            Ok(()) => {
                bump(&counters.records_written);
                add(&counters.bytes_written, payload.len() as u64);
                Ok(payload.len())
            }
            Err(SendError::WindowFull) => {
                bump(&counters.window_full);
                Err(SessionError::WindowFull)
            }
            Err(SendError::TooLarge { len, max }) => Err(SessionError::TooLarge { len, max }),
            Err(SendError::Empty) => Ok(0),
        }
    }

    /// Block until the next record is available and copy it into `buf`.
    ///
    /// A record larger than `buf` is left queued and reported as
    /// [`SessionError::BufferTooSmall`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.read_until(buf, None)
    }

    /// Like [`read`](Self::read), giving up after `timeout`.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, SessionError> {
        self.read_until(buf, Some(Instant::now() + timeout))
    }

    fn read_until(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, SessionError> {
        let timer = deadline.map(at).unwrap_or_else(never);
        loop {
            self.shared.check_alive()?;

            {
                let mut engine = self.shared.lock_engine();
                if let Some(size) = engine.peek_size() {
                    if size > buf.len() {
                        return Err(SessionError::BufferTooSmall {
                            needed: size,
                            capacity: buf.len(),
                        });
                    }
                    match engine.recv(buf) {
                        Ok(n) => {
                            bump(&self.shared.counters.records_read);
                            add(&self.shared.counters.bytes_read, n as u64);
                            // One hint can cover several records; pass it on
                            // to the next parked reader.
                            if engine.peek_size().is_some() {
                                self.shared.read_ready.notify();
                            }
                            return Ok(n);
                        }
                        Err(RecvError::BufferTooSmall { needed, capacity }) => {
                            return Err(SessionError::BufferTooSmall { needed, capacity });
                        }
                        Err(RecvError::Empty) => {}
                    }
                }
            }

            select! {
                recv(self.shared.read_ready.waiter()) -> _ => {}
                recv(self.shared.liveness.watch()) -> _ => {}
                recv(timer) -> _ => return Err(SessionError::TimedOut),
            }
        }
    }

    /// Kill the session and wake every blocked caller. Idempotent.
    pub fn close(&self) {
        self.shared.die(None);
    }

    pub fn is_dead(&self) -> bool {
        self.shared.is_dead()
    }

    pub fn conv(&self) -> u32 {
        self.shared.conv
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.transport.local_addr()
    }

    pub fn stats(&self) -> SessionStats {
        let engine = self.shared.lock_engine().stats();
        self.shared.counters.snapshot(self.shared.conv, engine)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.shared.conv)
            .field("role", &self.shared.role)
            .field("remote", &self.shared.remote)
            .field("dead", &self.shared.is_dead())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.die(None);
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
}

// ─── Background Loops ───────────────────────────────────────────────────────

fn run_ticker(shared: Arc<Shared>, inbound: Receiver<Bytes>, interval: Duration) {
    let detached: Receiver<Bytes> = never();
    let mut inbound_open = true;
    let mut next_tick = Instant::now();

    loop {
        let now = Instant::now();
        if now >= next_tick {
            shared.tick();
            next_tick += interval;
            if next_tick <= now {
                next_tick = now + interval;
            }
        }

        let source = if inbound_open { &inbound } else { &detached };
        select! {
            recv(source) -> msg => match msg {
                Ok(frame) => shared.feed(&frame),
                // Listener gone: keep ticking so queued data still drains.
                Err(_) => inbound_open = false,
            },
            recv(shared.liveness.watch()) -> _ => break,
            default(next_tick.saturating_duration_since(now)) => {}
        }
    }
    trace!(conv = shared.conv, "tick loop exited");
}

fn run_reader(shared: Arc<Shared>, inbound: Sender<Bytes>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shared.is_dead() {
        match shared.transport.recv_from(&mut buf) {
            Ok((n, _)) => {
                let frame = &buf[..n];
                if is_runt(frame) {
                    continue;
                }
                if inbound.try_send(Bytes::copy_from_slice(frame)).is_err() {
                    trace!(conv = shared.conv, "inbound full, frame dropped");
                }
            }
            Err(err) if is_poll_timeout(&err) => {}
            Err(err) => {
                shared.die(Some(err));
                break;
            }
        }
    }
    trace!(conv = shared.conv, "reader exited");
}
