//! # ARQ Engine Contract
//!
//! The session layer drives a reliable-delivery engine it does not own the
//! algorithm of. Anything implementing [`ArqEngine`] can sit behind a
//! [`Session`](crate::session::Session): the session serializes every call
//! through its own lock, feeds inbound frames, advances the clock and moves
//! application records in and out.
//!
//! Flow control goes through [`ArqEngine::can_send`] / [`ArqEngine::try_send`];
//! the session never inspects sequence counters.

use std::sync::Arc;

use thiserror::Error;

use crate::stats::EngineStats;

/// Callback invoked with each ready-to-send datagram.
///
/// Called while the session lock is held, so it must not call back into the
/// session.
pub type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// Constructs a fresh engine for a conversation id.
pub type EngineFactory = Arc<dyn Fn(u32) -> Box<dyn ArqEngine> + Send + Sync>;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Why an application record was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send window is full")]
    WindowFull,
    #[error("record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("empty record")]
    Empty,
}

/// Why no record was dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("no complete record available")]
    Empty,
    #[error("record of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("frame truncated")]
    Truncated,
    #[error("malformed segment header")]
    Malformed,
    #[error("conversation {got:#010x} does not match {expected:#010x}")]
    ConvMismatch { expected: u32, got: u32 },
}

// ─── Engine Trait ───────────────────────────────────────────────────────────

/// Reliable, ordered delivery core for one conversation.
pub trait ArqEngine: Send {
    /// Conversation id this engine is scoped to.
    fn conv(&self) -> u32;

    /// Register the function that transmits produced frames.
    fn set_output(&mut self, output: OutputFn);

    /// Feed one received datagram.
    fn input(&mut self, frame: &[u8]) -> Result<(), InputError>;

    /// Advance the engine clock. May invoke the output any number of times.
    fn update(&mut self, now_ms: u32);

    /// Whether a new record would currently be admitted.
    fn can_send(&self) -> bool;

    /// Enqueue a record for reliable delivery. On error nothing is enqueued.
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError>;

    /// Size of the next complete record, if any.
    fn peek_size(&self) -> Option<usize>;

    /// Dequeue the next complete record into `buf`. A record that does not
    /// fit is kept for a later call.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError>;

    /// Segments queued or in flight and not yet acknowledged.
    fn waiting(&self) -> usize;

    fn stats(&self) -> EngineStats {
        EngineStats::default()
    }
}
