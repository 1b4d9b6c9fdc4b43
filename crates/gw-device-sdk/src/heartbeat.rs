//! Heartbeat liveness monitor.
//!
//! The engine ticks the monitor with the current instant; the monitor
//! answers with what to do next. A session baseline is taken when the
//! connection is established, so a peer that never answers a single
//! ping still trips the threshold.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatOptions;

/// What the engine should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Nothing due.
    Idle,
    /// Send a Ping now (then call [`HeartbeatMonitor::record_ping`]).
    PingDue,
    /// The missed-pong threshold was reached: close the transport.
    Expired,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    options: HeartbeatOptions,
    last_ping_sent: Option<Instant>,
    last_pong_received: Option<Instant>,
    /// A ping has been sent and no pong has answered it yet.
    awaiting_pong: bool,
    missed_pongs: u32,
    /// Whether the currently outstanding ping already counted as a miss.
    /// Each unanswered ping contributes at most one miss.
    miss_counted: bool,
}

impl HeartbeatMonitor {
    pub fn new(options: HeartbeatOptions) -> Self {
        Self {
            options,
            last_ping_sent: None,
            last_pong_received: None,
            awaiting_pong: false,
            missed_pongs: 0,
            miss_counted: false,
        }
    }

    /// Start a session: the connect instant is the pong baseline.
    pub fn on_connected(&mut self, now: Instant) {
        self.last_ping_sent = None;
        self.last_pong_received = Some(now);
        self.awaiting_pong = false;
        self.missed_pongs = 0;
        self.miss_counted = false;
    }

    /// Clear all session state.
    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.last_pong_received = None;
        self.awaiting_pong = false;
        self.missed_pongs = 0;
        self.miss_counted = false;
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
        self.awaiting_pong = true;
        self.miss_counted = false;
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong_received = Some(now);
        self.awaiting_pong = false;
        self.missed_pongs = 0;
        self.miss_counted = false;
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    /// Evaluate liveness at `now`. Misses are checked before the ping
    /// cadence so an expiry is reported as soon as it is due.
    pub fn tick(&mut self, now: Instant) -> HeartbeatVerdict {
        if !self.options.enabled {
            return HeartbeatVerdict::Idle;
        }

        if let Some(pong) = self.last_pong_received {
            if self.awaiting_pong
                && !self.miss_counted
                && now.duration_since(pong) > self.options.timeout
            {
                self.missed_pongs += 1;
                self.miss_counted = true;
                if self.missed_pongs >= self.options.missed_pongs_before_disconnect {
                    return HeartbeatVerdict::Expired;
                }
            }
        }

        if self.ping_due(now) {
            HeartbeatVerdict::PingDue
        } else {
            HeartbeatVerdict::Idle
        }
    }

    /// The next instant at which [`tick`](Self::tick) can change its
    /// answer; `None` while disabled or between sessions.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if !self.options.enabled || self.last_pong_received.is_none() {
            return None;
        }

        let next_ping = match self.last_ping_sent {
            Some(ping) => ping + self.options.interval,
            None => now,
        };

        let liveness = self.last_pong_received.and_then(|pong| {
            (self.awaiting_pong && !self.miss_counted)
                .then(|| pong + self.options.timeout + Duration::from_millis(1))
        });

        Some(match liveness {
            Some(liveness) => next_ping.min(liveness),
            None => next_ping,
        })
    }

    fn ping_due(&self, now: Instant) -> bool {
        match self.last_ping_sent {
            Some(ping) => now.duration_since(ping) >= self.options.interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(threshold: u32) -> HeartbeatOptions {
        HeartbeatOptions {
            enabled: true,
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(150),
            missed_pongs_before_disconnect: threshold,
            answer_pings: true,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn first_ping_is_due_immediately() {
        let mut hb = HeartbeatMonitor::new(options(2));
        let t0 = Instant::now();
        hb.on_connected(t0);
        assert_eq!(hb.tick(t0), HeartbeatVerdict::PingDue);
        hb.record_ping(t0);
        assert_eq!(hb.tick(t0), HeartbeatVerdict::Idle);
    }

    #[tokio::test]
    async fn pong_resets_misses() {
        let mut hb = HeartbeatMonitor::new(options(2));
        let t0 = Instant::now();
        hb.on_connected(t0);
        hb.record_ping(t0);
        assert_ne!(hb.tick(t0 + ms(151)), HeartbeatVerdict::Expired);
        assert_eq!(hb.missed_pongs(), 1);
        hb.record_pong(t0 + ms(160));
        assert_eq!(hb.missed_pongs(), 0);
        // Fresh baseline; nothing outstanding, only the next ping is due.
        assert_eq!(hb.tick(t0 + ms(180)), HeartbeatVerdict::PingDue);
        assert_eq!(hb.missed_pongs(), 0);
    }

    #[tokio::test]
    async fn one_unanswered_ping_counts_one_miss() {
        let mut hb = HeartbeatMonitor::new(options(5));
        let t0 = Instant::now();
        hb.on_connected(t0);
        hb.record_ping(t0);
        // Repeated ticks past the timeout must not double-count.
        hb.tick(t0 + ms(151));
        hb.tick(t0 + ms(152));
        hb.tick(t0 + ms(153));
        assert_eq!(hb.missed_pongs(), 1);
    }

    #[tokio::test]
    async fn expires_at_threshold_exactly() {
        let mut hb = HeartbeatMonitor::new(options(2));
        let t0 = Instant::now();
        hb.on_connected(t0);

        hb.record_ping(t0);
        assert_ne!(hb.tick(t0 + ms(151)), HeartbeatVerdict::Expired); // miss 1, below threshold
        assert_eq!(hb.missed_pongs(), 1);

        hb.record_ping(t0 + ms(151));
        assert_eq!(hb.tick(t0 + ms(200)), HeartbeatVerdict::Expired); // miss 2 trips
        assert_eq!(hb.missed_pongs(), 2);
    }

    #[tokio::test]
    async fn threshold_three_needs_three_misses() {
        let mut hb = HeartbeatMonitor::new(options(3));
        let t0 = Instant::now();
        hb.on_connected(t0);

        hb.record_ping(t0);
        assert_ne!(hb.tick(t0 + ms(151)), HeartbeatVerdict::Expired);
        hb.record_ping(t0 + ms(151));
        assert_ne!(hb.tick(t0 + ms(160)), HeartbeatVerdict::Expired);
        hb.record_ping(t0 + ms(160));
        assert_eq!(hb.tick(t0 + ms(170)), HeartbeatVerdict::Expired);
    }

    #[tokio::test]
    async fn disabled_monitor_is_inert() {
        let mut hb = HeartbeatMonitor::new(HeartbeatOptions {
            enabled: false,
            ..options(1)
        });
        let t0 = Instant::now();
        hb.on_connected(t0);
        assert_eq!(hb.tick(t0 + ms(10_000)), HeartbeatVerdict::Idle);
        assert_eq!(hb.next_deadline(t0), None);
    }

    #[tokio::test]
    async fn next_deadline_tracks_ping_and_liveness() {
        let mut hb = HeartbeatMonitor::new(options(2));
        let t0 = Instant::now();
        hb.on_connected(t0);
        // No ping yet: due now.
        assert_eq!(hb.next_deadline(t0), Some(t0));
        hb.record_ping(t0);
        // Outstanding ping: next ping at +100 beats the liveness check
        // at pong-baseline +151.
        assert_eq!(hb.next_deadline(t0), Some(t0 + ms(100)));
        hb.record_pong(t0 + ms(5));
        // Nothing outstanding: next ping only.
        assert_eq!(hb.next_deadline(t0 + ms(6)), Some(t0 + ms(100)));
    }
}
