//! # Reference ARQ Engine
//!
//! A KCP-style selective-repeat engine implementing [`ArqEngine`].
//!
//! The sender fragments records into MSS-sized segments, keeps them in a send
//! buffer bounded by the smaller of its own window and the peer's advertised
//! window, and resends them when their retransmission timeout expires or when
//! enough later segments have been acknowledged (fast resend). The receiver
//! reorders by sequence number and releases only complete records.
//!
//! ## Key design decisions
//!
//! - **Cumulative + selective ACKs**: every segment carries `una`; each pushed
//!   segment is also acknowledged individually
//! - **ACKs ride the clock**: acknowledgements are batched and flushed on
//!   [`update`](ArqEngine::update), never from inside `input`
//! - **No congestion window**: the send window is the only throttle
//! - **Coalescing**: segments are packed into datagrams up to the MTU

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use thiserror::Error;

use crate::engine::{ArqEngine, InputError, OutputFn, RecvError, SendError};
use crate::stats::EngineStats;
use crate::wire::{Command, SegmentHeader, MAX_DATAGRAM, OVERHEAD};

/// Interval between window probes when the peer advertises zero space.
const PROBE_INIT_MS: u32 = 7_000;
const PROBE_LIMIT_MS: u32 = 120_000;

/// Hard cap on fragments per record imposed by the one-byte `frg` field.
const MAX_FRAGMENTS: usize = 255;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Engine tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpConfig {
    /// Largest datagram the engine emits (header included).
    pub mtu: usize,
    /// Maximum segments queued or in flight.
    pub send_window: u16,
    /// Maximum segments held for the application.
    pub recv_window: u16,
    /// Lower bound of the retransmission timeout, in ms.
    pub min_rto: u32,
    /// Upper bound of the retransmission timeout, in ms.
    pub max_rto: u32,
    /// Resend a segment after this many later segments were acknowledged
    /// (0 disables fast resend).
    pub fast_resend: u32,
    /// Flush interval in ms.
    pub interval: u32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            mtu: 1400,
            send_window: 32,
            recv_window: 128,
            min_rto: 30,
            max_rto: 5_000,
            fast_resend: 2,
            interval: 10,
        }
    }
}

/// Why a [`KcpConfig`] cannot drive an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KcpConfigError {
    #[error("mtu must be in {min}..={max}, got {0}", min = OVERHEAD + 1, max = MAX_DATAGRAM)]
    Mtu(usize),
    #[error("send and receive windows must be non-zero")]
    ZeroWindow,
    #[error("min_rto ({min_rto}) exceeds max_rto ({max_rto})")]
    RtoBounds { min_rto: u32, max_rto: u32 },
}

impl KcpConfig {
    /// Check that the engine can carry payload with these parameters.
    pub fn validate(&self) -> Result<(), KcpConfigError> {
        if self.mtu <= OVERHEAD || self.mtu > MAX_DATAGRAM {
            return Err(KcpConfigError::Mtu(self.mtu));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(KcpConfigError::ZeroWindow);
        }
        if self.min_rto > self.max_rto {
            return Err(KcpConfigError::RtoBounds {
                min_rto: self.min_rto,
                max_rto: self.max_rto,
            });
        }
        Ok(())
    }

    /// Payload bytes per segment. Never zero, even for an mtu that
    /// [`validate`](Self::validate) rejects.
    pub fn mss(&self) -> usize {
        self.mtu.saturating_sub(OVERHEAD).max(1)
    }

    /// Largest record [`Kcp::try_send`] accepts.
    pub fn max_record(&self) -> usize {
        self.mss() * MAX_FRAGMENTS.min(self.recv_window as usize)
    }
}

// ─── RTT Estimator ──────────────────────────────────────────────────────────

/// RFC 6298 SRTT/RTTVAR estimator producing a clamped RTO.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: u32,
    rttvar: u32,
    rto: u32,
    samples: u64,
    min_rto: u32,
    max_rto: u32,
    interval: u32,
}

impl RttEstimator {
    pub fn new(min_rto: u32, max_rto: u32, interval: u32) -> Self {
        let max_rto = max_rto.max(min_rto);
        RttEstimator {
            srtt: 0,
            rttvar: 0,
            rto: 200u32.clamp(min_rto, max_rto),
            samples: 0,
            min_rto,
            max_rto,
            interval,
        }
    }

    /// Fold in one RTT sample (ms).
    pub fn update(&mut self, rtt: u32) {
        self.samples += 1;
        if self.samples == 1 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            // α = 1/8, β = 1/4
            let delta = rtt.abs_diff(self.srtt);
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = ((7 * self.srtt as u64 + rtt as u64) / 8).max(1) as u32;
        }
        let rto = self.srtt + self.interval.max(4 * self.rttvar);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }

    pub fn srtt(&self) -> u32 {
        self.srtt
    }

    pub fn rto(&self) -> u32 {
        self.rto
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

// ─── Segment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Segment {
    frg: u8,
    sn: u32,
    ts: u32,
    resend_ts: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: Bytes,
}

impl Segment {
    fn new(frg: u8, data: Bytes) -> Self {
        Segment {
            frg,
            sn: 0,
            ts: 0,
            resend_ts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
            data,
        }
    }
}

/// Signed distance between two wrapping 32-bit counters.
#[inline]
fn diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

// ─── Datagram Builder ───────────────────────────────────────────────────────

/// Packs segments into MTU-sized datagrams and hands them to the output.
struct Emitter<'a> {
    buf: &'a mut BytesMut,
    output: &'a mut Option<OutputFn>,
    mtu: usize,
    datagrams: &'a mut u64,
}

impl Emitter<'_> {
    fn push(&mut self, header: SegmentHeader, data: &[u8]) {
        if self.buf.len() + OVERHEAD + data.len() > self.mtu {
            self.flush();
        }
        header.encode(&mut *self.buf);
        self.buf.extend_from_slice(data);
    }

    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if let Some(output) = self.output.as_mut() {
            output(&self.buf[..]);
            *self.datagrams += 1;
        }
        self.buf.clear();
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// KCP-style reliable engine for one conversation.
pub struct Kcp {
    conv: u32,
    config: KcpConfig,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    rmt_wnd: u16,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    rtt: RttEstimator,
    current: u32,
    ts_flush: u32,
    updated: bool,

    probe: u8,
    ts_probe: u32,
    probe_wait: u32,

    output: Option<OutputFn>,
    buffer: BytesMut,
    stats: EngineStats,
}

impl Kcp {
    /// Build an engine. Callers should [`validate`](KcpConfig::validate)
    /// `config` first; an invalid one yields an engine that never panics
    /// but may refuse every record.
    pub fn new(conv: u32, config: KcpConfig) -> Self {
        let mss = config.mss();
        Kcp {
            conv,
            mss,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rmt_wnd: config.recv_window,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            rtt: RttEstimator::new(config.min_rto, config.max_rto, config.interval),
            current: 0,
            ts_flush: 0,
            updated: false,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            output: None,
            buffer: BytesMut::with_capacity(config.mtu),
            stats: EngineStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &KcpConfig {
        &self.config
    }

    /// Receive window we advertise to the peer.
    fn wnd_unused(&self) -> u16 {
        (self.config.recv_window as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if diff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        if let Some(pos) = self.snd_buf.iter().position(|seg| seg.sn == sn) {
            self.snd_buf.remove(pos);
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if diff(sn, seg.sn) < 0 {
                break;
            }
            if seg.sn != sn {
                seg.fastack += 1;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map_or(self.snd_nxt, |seg| seg.sn);
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if diff(sn, self.rcv_nxt.wrapping_add(self.config.recv_window as u32)) >= 0
            || diff(sn, self.rcv_nxt) < 0
        {
            self.stats.duplicates += 1;
            return;
        }

        // rcv_buf is sorted by sn; walk from the back since data mostly
        // arrives in order.
        let mut insert_at = self.rcv_buf.len();
        for (idx, existing) in self.rcv_buf.iter().enumerate().rev() {
            if existing.sn == sn {
                self.stats.duplicates += 1;
                return;
            }
            if diff(sn, existing.sn) > 0 {
                break;
            }
            insert_at = idx;
        }
        self.rcv_buf.insert(insert_at, seg);
        self.move_to_queue();
    }

    fn move_to_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.config.recv_window as usize {
                if let Some(seg) = self.rcv_buf.pop_front() {
                    self.rcv_queue.push_back(seg);
                }
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }

    fn flush(&mut self) {
        if !self.updated {
            return;
        }
        let current = self.current;
        let wnd = self.wnd_unused();
        let rcv_nxt = self.rcv_nxt;
        let conv = self.conv;

        let header = |cmd: Command, frg: u8, ts: u32, sn: u32, len: u32| SegmentHeader {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una: rcv_nxt,
            len,
        };

        let mut emitter = Emitter {
            buf: &mut self.buffer,
            output: &mut self.output,
            mtu: self.config.mtu,
            datagrams: &mut self.stats.datagrams_out,
        };

        for (sn, ts) in self.acklist.drain(..) {
            emitter.push(header(Command::Ack, 0, ts, sn, 0), &[]);
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT_MS;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if diff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT_MS);
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT_MS);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
        if self.probe & ASK_SEND != 0 {
            emitter.push(header(Command::WindowProbe, 0, 0, 0, 0), &[]);
        }
        if self.probe & ASK_TELL != 0 {
            emitter.push(header(Command::WindowTell, 0, 0, 0, 0), &[]);
        }
        self.probe = 0;

        let cwnd = self.config.send_window.min(self.rmt_wnd) as u32;
        while diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            seg.ts = current;
            seg.resend_ts = current;
            seg.rto = self.rtt.rto();
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.config.fast_resend > 0 {
            self.config.fast_resend
        } else {
            u32::MAX
        };
        let rto = self.rtt.rto();
        let max_rto = self.config.max_rto;

        for seg in self.snd_buf.iter_mut() {
            let needsend = if seg.xmit == 0 {
                seg.xmit = 1;
                seg.rto = rto;
                seg.resend_ts = current.wrapping_add(seg.rto);
                self.stats.segments_sent += 1;
                true
            } else if diff(current, seg.resend_ts) >= 0 {
                seg.xmit += 1;
                seg.rto = (seg.rto + seg.rto / 2).min(max_rto);
                seg.resend_ts = current.wrapping_add(seg.rto);
                self.stats.retransmits += 1;
                true
            } else if seg.fastack >= resent {
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                self.stats.fast_retransmits += 1;
                true
            } else {
                false
            };

            if needsend {
                seg.ts = current;
                emitter.push(
                    header(Command::Push, seg.frg, seg.ts, seg.sn, seg.data.len() as u32),
                    &seg.data,
                );
            }
        }

        emitter.flush();
    }
}

impl ArqEngine for Kcp {
    fn conv(&self) -> u32 {
        self.conv
    }

    fn set_output(&mut self, output: OutputFn) {
        self.output = Some(output);
    }

    fn input(&mut self, frame: &[u8]) -> Result<(), InputError> {
        if frame.len() < OVERHEAD {
            return Err(InputError::Truncated);
        }

        let mut cursor = frame;
        let mut latest_ack: Option<u32> = None;

        while cursor.len() >= OVERHEAD {
            let header = SegmentHeader::decode(&mut cursor).ok_or(InputError::Malformed)?;
            if header.conv != self.conv {
                return Err(InputError::ConvMismatch {
                    expected: self.conv,
                    got: header.conv,
                });
            }
            let len = header.len as usize;
            if cursor.len() < len {
                return Err(InputError::Truncated);
            }
            let (data, rest) = cursor.split_at(len);
            cursor = rest;

            self.rmt_wnd = header.wnd;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    if diff(self.current, header.ts) >= 0 {
                        self.rtt.update(diff(self.current, header.ts) as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    latest_ack = match latest_ack {
                        Some(sn) if diff(header.sn, sn) <= 0 => Some(sn),
                        _ => Some(header.sn),
                    };
                }
                Command::Push => {
                    self.stats.segments_received += 1;
                    let limit = self.rcv_nxt.wrapping_add(self.config.recv_window as u32);
                    if diff(header.sn, limit) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        let mut seg = Segment::new(header.frg, Bytes::copy_from_slice(data));
                        seg.sn = header.sn;
                        seg.ts = header.ts;
                        self.parse_data(seg);
                    }
                }
                Command::WindowProbe => {
                    self.probe |= ASK_TELL;
                }
                Command::WindowTell => {}
            }
        }

        if let Some(sn) = latest_ack {
            self.parse_fastack(sn);
        }
        Ok(())
    }

    fn update(&mut self, now_ms: u32) {
        self.current = now_ms;
        if !self.updated {
            self.updated = true;
            self.ts_flush = now_ms;
        }

        let mut slap = diff(self.current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = self.current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.config.interval);
            if diff(self.current, self.ts_flush) >= 0 {
                self.ts_flush = self.current.wrapping_add(self.config.interval);
            }
            self.flush();
        }
    }

    fn can_send(&self) -> bool {
        self.waiting() < self.config.send_window as usize
    }

    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::Empty);
        }
        let count = payload.len().div_ceil(self.mss);
        if count > MAX_FRAGMENTS.min(self.config.recv_window as usize) {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max: self.config.max_record(),
            });
        }
        if !self.can_send() {
            return Err(SendError::WindowFull);
        }

        for (idx, chunk) in payload.chunks(self.mss).enumerate() {
            let frg = (count - idx - 1) as u8;
            self.snd_queue
                .push_back(Segment::new(frg, Bytes::copy_from_slice(chunk)));
        }
        Ok(())
    }

    fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        let size = self.peek_size().ok_or(RecvError::Empty)?;
        if size > buf.len() {
            return Err(RecvError::BufferTooSmall {
                needed: size,
                capacity: buf.len(),
            });
        }

        let recover = self.rcv_queue.len() >= self.config.recv_window as usize;

        let mut written = 0;
        while let Some(seg) = self.rcv_queue.pop_front() {
            buf[written..written + seg.data.len()].copy_from_slice(&seg.data);
            written += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }

        self.move_to_queue();

        if recover && self.rcv_queue.len() < self.config.recv_window as usize {
            self.probe |= ASK_TELL;
        }
        Ok(written)
    }

    fn waiting(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            srtt_ms: self.rtt.srtt(),
            rto_ms: self.rtt.rto(),
            ..self.stats.clone()
        }
    }
}
