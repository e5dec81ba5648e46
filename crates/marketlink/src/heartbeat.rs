//! Liveness tracking for a channel.
//!
//! The monitor only detects staleness. Whether a stale channel gets replaced
//! is decided by the registry and the feed.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::protocol::WsMessage;

/// Tracks heartbeat activity and hands out the ping schedule.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    stale_threshold: Duration,
    state: Mutex<HeartbeatState>,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    attached_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, stale_threshold: Duration) -> Self {
        Self {
            interval,
            stale_threshold,
            state: Mutex::new(HeartbeatState::default()),
        }
    }

    /// Start measuring from now. Called when the channel opens.
    pub fn attach(&self) {
        self.state.lock().attached_at = Some(Instant::now());
    }

    /// Record any received `ping` or `pong`.
    pub fn record(&self) {
        self.state.lock().last_heartbeat_at = Some(Instant::now());
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.state.lock().last_heartbeat_at
    }

    /// No heartbeat for longer than the stale threshold.
    ///
    /// Measured from the last heartbeat, or from attachment when none has
    /// arrived yet. A monitor that was never attached is not stale.
    pub fn is_stale(&self) -> bool {
        let state = self.state.lock();
        match state.last_heartbeat_at.or(state.attached_at) {
            Some(since) => since.elapsed() > self.stale_threshold,
            None => false,
        }
    }

    pub fn has_recent_heartbeat(&self) -> bool {
        self.last_heartbeat_at()
            .is_some_and(|at| at.elapsed() <= self.stale_threshold)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// The outbound heartbeat frame.
    pub fn ping_frame(&self) -> WsMessage {
        WsMessage::text("ping")
    }

    /// Ping schedule; the first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(75))
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_threshold_without_heartbeat() {
        let hb = monitor();
        assert!(!hb.is_stale());
        hb.attach();

        advance(Duration::from_secs(74)).await;
        assert!(!hb.is_stale());
        assert!(!hb.has_recent_heartbeat());

        advance(Duration::from_secs(2)).await;
        assert!(hb.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn any_heartbeat_refreshes_liveness() {
        let hb = monitor();
        hb.attach();
        advance(Duration::from_secs(60)).await;
        hb.record();
        advance(Duration::from_secs(60)).await;
        assert!(!hb.is_stale());
        assert!(hb.has_recent_heartbeat());

        advance(Duration::from_secs(16)).await;
        assert!(hb.is_stale());
        assert!(!hb.has_recent_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_waits_one_interval() {
        let hb = monitor();
        let start = Instant::now();
        let mut ticker = hb.ticker();
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(hb.ping_frame(), WsMessage::text("ping"));
    }
}
