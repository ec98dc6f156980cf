//! Timing parameters and the runtime-adjustable send pacer.
//!
//! Reliable delivery here is timer-driven rather than window-driven:
//! - the **send loop** writes at most one segment per pacing tick,
//! - the **resend loop** periodically sweeps data segments that have gone
//!   unacknowledged for longer than a fixed threshold,
//! - the **heartbeat loop** emits a keep-alive after a full idle cycle.
//!
//! [`TimerConfig`] collects every one of those knobs.  [`SendPacer`] is the
//! cheap handle a [`crate::connection::Connection`] keeps so the application
//! can change the pacing interval while the send loop is running.
//!
//! The resend threshold is fixed per segment (no exponential back-off); a
//! back-off policy would slot into [`TimerConfig::resend_threshold`].

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Smallest pacing interval accepted; `tokio::time::interval` rejects zero.
const MIN_SEND_INTERVAL: Duration = Duration::from_nanos(1);

/// Adjustable timing and sizing parameters for one connection or listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// Pause between two dequeued sends.
    pub send_interval: Duration,
    /// Age after which an unacknowledged data segment is retransmitted.
    pub resend_threshold: Duration,
    /// How often the resend loop sweeps the resend store.
    pub resend_scan_interval: Duration,
    /// Idle period after which a heartbeat is sent.
    pub heartbeat_cycle: Duration,
    /// Datagrams the client inspects while waiting for its `ConnAck`.
    pub handshake_attempts: u32,
    /// How long each handshake attempt waits for a datagram.
    pub handshake_attempt_timeout: Duration,
    /// How long `close` waits for the peer's `FinAck`.
    pub fin_ack_timeout: Duration,
    /// How long `close` waits for outstanding data to be acknowledged.
    pub linger: Duration,
    /// Capacity of the inbound datagram channel per connection.
    pub inbound_capacity: usize,
    /// Capacity of the listener's accept queue.
    pub accept_backlog: usize,
    /// How far past the next expected sequence number a data segment may be
    /// buffered.  Segments further ahead are dropped without an `Ack`.
    pub reorder_window: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_nanos(1000),
            resend_threshold: Duration::from_millis(1000),
            resend_scan_interval: Duration::from_millis(100),
            heartbeat_cycle: Duration::from_secs(30 * 60),
            handshake_attempts: 3,
            handshake_attempt_timeout: Duration::from_secs(1),
            fin_ack_timeout: Duration::from_secs(2),
            linger: Duration::from_secs(5),
            inbound_capacity: 1 << 5,
            accept_backlog: 1 << 10,
            reorder_window: 1 << 12,
        }
    }
}

impl TimerConfig {
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_resend_threshold(mut self, threshold: Duration) -> Self {
        self.resend_threshold = threshold;
        self
    }

    pub fn with_resend_scan_interval(mut self, interval: Duration) -> Self {
        self.resend_scan_interval = interval;
        self
    }

    pub fn with_heartbeat_cycle(mut self, cycle: Duration) -> Self {
        self.heartbeat_cycle = cycle;
        self
    }

    pub fn with_handshake(mut self, attempts: u32, attempt_timeout: Duration) -> Self {
        self.handshake_attempts = attempts;
        self.handshake_attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_fin_ack_timeout(mut self, timeout: Duration) -> Self {
        self.fin_ack_timeout = timeout;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    pub fn with_reorder_window(mut self, window: u32) -> Self {
        self.reorder_window = window;
        self
    }

    /// Short timers for loopback tests: 1 ms pacing, 50 ms resend.
    pub fn fast() -> Self {
        Self::default()
            .with_send_interval(Duration::from_millis(1))
            .with_resend_threshold(Duration::from_millis(50))
            .with_resend_scan_interval(Duration::from_millis(10))
            .with_handshake(3, Duration::from_millis(200))
            .with_fin_ack_timeout(Duration::from_millis(500))
            .with_linger(Duration::from_secs(2))
    }
}

/// Build a ticker that never bursts to catch up on missed ticks.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(MIN_SEND_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Handle used to change the send loop's pacing interval at runtime.
#[derive(Debug, Clone)]
pub struct SendPacer {
    tx: watch::Sender<Duration>,
}

impl SendPacer {
    /// Create a pacer and the receiver the send loop watches.
    pub fn new(initial: Duration) -> (Self, watch::Receiver<Duration>) {
        let (tx, rx) = watch::channel(initial.max(MIN_SEND_INTERVAL));
        (Self { tx }, rx)
    }

    /// Replace the pacing interval.  Segments already queued are kept.
    pub fn set(&self, interval: Duration) {
        self.tx.send_replace(interval.max(MIN_SEND_INTERVAL));
    }

    pub fn current(&self) -> Duration {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = TimerConfig::default();
        assert_eq!(cfg.send_interval, Duration::from_micros(1));
        assert_eq!(cfg.resend_threshold, Duration::from_millis(1000));
        assert_eq!(cfg.heartbeat_cycle, Duration::from_secs(1800));
        assert_eq!(cfg.handshake_attempts, 3);
        assert_eq!(cfg.inbound_capacity, 32);
        assert_eq!(cfg.reorder_window, 4096);
    }

    #[test]
    fn pacer_clamps_zero() {
        let (pacer, rx) = SendPacer::new(Duration::ZERO);
        assert_eq!(*rx.borrow(), MIN_SEND_INTERVAL);
        pacer.set(Duration::ZERO);
        assert_eq!(pacer.current(), MIN_SEND_INTERVAL);
    }

    #[tokio::test]
    async fn pacer_change_is_observed() {
        let (pacer, mut rx) = SendPacer::new(Duration::from_millis(1));
        pacer.set(Duration::from_millis(20));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Duration::from_millis(20));
    }
}
