//! Client statistics: monotonic counters plus session timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Point-in-time statistics snapshot returned by `get_stats`.
///
/// Counters never decrease within a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    pub error_count: u64,
    pub buffer_overflows: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Lock-light tracker shared between the engine and client handles.
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_count: AtomicU64,
    error_count: AtomicU64,
    buffer_overflows: AtomicU64,
    timestamps: Mutex<Timestamps>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    connected_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch_activity();
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch_activity();
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connected(&self) {
        let now = Utc::now();
        let mut ts = self.lock_timestamps();
        ts.connected_at = Some(now);
        ts.last_activity_at = Some(now);
    }

    pub fn touch_activity(&self) {
        self.lock_timestamps().last_activity_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> ClientStats {
        let ts = *self.lock_timestamps();
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            connected_at: ts.connected_at,
            last_activity_at: ts.last_activity_at,
        }
    }

    fn lock_timestamps(&self) -> std::sync::MutexGuard<'_, Timestamps> {
        self.timestamps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
