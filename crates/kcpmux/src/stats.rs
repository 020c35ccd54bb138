//! # Session and Listener Statistics
//!
//! Counters are kept in atomics on the hot path and copied into plain
//! `Serialize` snapshots on demand, ready for JSON export.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── Engine Stats ───────────────────────────────────────────────────────────

/// Counters maintained by an ARQ engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Datagrams handed to the output callback.
    pub datagrams_out: u64,
    /// Segments pushed for the first time.
    pub segments_sent: u64,
    /// Segments resent after their retransmission timeout.
    pub retransmits: u64,
    /// Segments resent early because later segments were acknowledged.
    pub fast_retransmits: u64,
    /// Data segments received (including duplicates).
    pub segments_received: u64,
    /// Data segments discarded as already received.
    pub duplicates: u64,
    /// Smoothed round-trip time in ms.
    pub srtt_ms: u32,
    /// Current retransmission timeout in ms.
    pub rto_ms: u32,
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Snapshot of one session's activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub conv: u32,
    /// Records accepted by `write`.
    pub records_written: u64,
    pub bytes_written: u64,
    /// Records returned by `read`.
    pub records_read: u64,
    pub bytes_read: u64,
    /// Writes refused because the send window was full.
    pub window_full: u64,
    /// Frames fed to the engine.
    pub frames_in: u64,
    /// Frames the engine rejected (wrong conversation, malformed).
    pub frames_rejected: u64,
    /// Datagrams written to the transport.
    pub datagrams_out: u64,
    /// Datagrams the transport refused without a fatal error.
    pub output_dropped: u64,
    pub engine: EngineStats,
}

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub records_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub records_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub window_full: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub output_dropped: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self, conv: u32, engine: EngineStats) -> SessionStats {
        SessionStats {
            conv,
            records_written: load(&self.records_written),
            bytes_written: load(&self.bytes_written),
            records_read: load(&self.records_read),
            bytes_read: load(&self.bytes_read),
            window_full: load(&self.window_full),
            frames_in: load(&self.frames_in),
            frames_rejected: load(&self.frames_rejected),
            datagrams_out: load(&self.datagrams_out),
            output_dropped: load(&self.output_dropped),
            engine,
        }
    }
}

// ─── Listener Stats ─────────────────────────────────────────────────────────

/// Snapshot of a listener's demultiplexing activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStats {
    /// Datagrams read from the socket.
    pub datagrams_received: u64,
    /// Datagrams shorter than one segment header.
    pub runts: u64,
    /// Datagrams dropped because the demux queue was full.
    pub queue_dropped: u64,
    /// Datagrams dropped because a session's inbound channel was full.
    pub inbound_dropped: u64,
    /// Sessions published to the accept queue.
    pub sessions_created: u64,
    /// Sessions dropped because the accept queue stayed full.
    pub sessions_rejected: u64,
    /// Table entries removed after their session died.
    pub sessions_removed: u64,
    /// Entries currently in the session table.
    pub active_sessions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ListenerCounters {
    pub datagrams_received: AtomicU64,
    pub runts: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub inbound_dropped: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub sessions_removed: AtomicU64,
    pub active_sessions: AtomicU64,
}

impl ListenerCounters {
    pub fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            datagrams_received: load(&self.datagrams_received),
            runts: load(&self.runts),
            queue_dropped: load(&self.queue_dropped),
            inbound_dropped: load(&self.inbound_dropped),
            sessions_created: load(&self.sessions_created),
            sessions_rejected: load(&self.sessions_rejected),
            sessions_removed: load(&self.sessions_removed),
            active_sessions: load(&self.active_sessions),
        }
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_snapshot_copies_counters() {
        let counters = SessionCounters::default();
        bump(&counters.records_written);
        add(&counters.bytes_written, 42);
        bump(&counters.window_full);

        let snap = counters.snapshot(7, EngineStats::default());
        assert_eq!(snap.conv, 7);
        assert_eq!(snap.records_written, 1);
        assert_eq!(snap.bytes_written, 42);
        assert_eq!(snap.window_full, 1);
        assert_eq!(snap.records_read, 0);
    }

    #[test]
    fn listener_snapshot_serializes() {
        let counters = ListenerCounters::default();
        bump(&counters.sessions_created);
        bump(&counters.runts);
        let json = serde_json::to_value(counters.snapshot()).unwrap();
        assert_eq!(json["sessions_created"], 1);
        assert_eq!(json["runts"], 1);
        assert_eq!(json["active_sessions"], 0);
    }
}
