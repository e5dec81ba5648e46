//! Synchronization configuration.

use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Configuration for channels, heartbeats, the registry and fallback polling.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    // Reconnection settings
    /// Delay before the first reconnect after an unclean close.
    pub reconnect_base_delay: Duration,
    /// Upper bound for any single reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,
    /// Unclean closes absorbed before handing over to fallback polling.
    pub max_retries: u32,

    // Handshake
    /// A channel still connecting after this long is stale.
    pub connect_timeout: Duration,
    /// Pause between the liveness probe and the protocol-init message.
    pub init_delay: Duration,
    /// Whether the MessagePack codec is available locally.
    pub enable_msgpack: bool,
    /// Whether inflate is available locally.
    pub enable_compression: bool,
    /// Advertise compressed binary frames during negotiation.
    pub supports_compressed_binary: bool,

    // Heartbeat settings
    /// Interval between `ping` frames.
    pub heartbeat_interval: Duration,
    /// No heartbeat activity for this long marks the channel stale.
    pub stale_threshold: Duration,

    // Registry
    /// How long a closed channel lingers before it is purged.
    pub gc_grace: Duration,

    // Channels
    /// Capacity of each channel's command queue.
    pub command_channel_capacity: usize,
    /// Frames larger than this are dropped.
    pub max_message_size: usize,

    // Fallback polling
    /// Interval between REST refreshes while polling.
    pub poll_interval: Duration,
    /// Interval between reconnect-probe rolls while polling.
    pub probe_interval: Duration,
    /// Probe probability on the first roll.
    pub probe_initial_probability: f64,
    /// Probability lost per probe attempt.
    pub probe_probability_step: f64,
    /// Probability never drops below this.
    pub probe_probability_floor: f64,
    /// Force a probe when none fired for this long (None = unbounded).
    pub max_probe_silence: Option<Duration>,
    /// Externally requested refreshes run at most once per this window.
    pub refresh_throttle: Duration,
    /// Bursts of refresh requests within this window are coalesced.
    pub refresh_debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_backoff_factor: 1.5,
            reconnect_jitter: 0.0,
            max_retries: 5,
            connect_timeout: Duration::from_secs(10),
            init_delay: Duration::from_millis(100),
            enable_msgpack: true,
            enable_compression: true,
            supports_compressed_binary: false,
            heartbeat_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(75),
            gc_grace: Duration::from_secs(5),
            command_channel_capacity: 64,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            poll_interval: Duration::from_secs(10),
            probe_interval: Duration::from_secs(15),
            probe_initial_probability: 0.2,
            probe_probability_step: 0.05,
            probe_probability_floor: 0.02,
            max_probe_silence: Some(Duration::from_secs(300)),
            refresh_throttle: Duration::from_secs(15),
            refresh_debounce: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base reconnect delay.
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the maximum reconnect delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the reconnection jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the delay before the protocol-init message.
    #[must_use]
    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Enable or disable the local MessagePack codec.
    #[must_use]
    pub fn enable_msgpack(mut self, enabled: bool) -> Self {
        self.enable_msgpack = enabled;
        self
    }

    /// Enable or disable local inflate support.
    #[must_use]
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the staleness threshold.
    #[must_use]
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set the GC grace window for closed channels.
    #[must_use]
    pub fn gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    /// Set the fallback polling interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the reconnect-probe interval.
    #[must_use]
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the maximum silence between reconnect probes.
    #[must_use]
    pub fn max_probe_silence(mut self, silence: Option<Duration>) -> Self {
        self.max_probe_silence = silence;
        self
    }

    /// Set the refresh throttle window.
    #[must_use]
    pub fn refresh_throttle(mut self, window: Duration) -> Self {
        self.refresh_throttle = window;
        self
    }

    /// Set the refresh debounce window.
    #[must_use]
    pub fn refresh_debounce(mut self, window: Duration) -> Self {
        self.refresh_debounce = window;
        self
    }

    /// Backoff policy derived from the reconnection settings.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
            max_retries: self.max_retries,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.backoff().validate()?;
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be > 0".to_string());
        }
        if self.stale_threshold <= self.heartbeat_interval {
            return Err("Stale threshold must exceed the heartbeat interval".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.max_message_size == 0 {
            return Err("Max message size must be > 0".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be > 0".to_string());
        }
        if self.probe_interval.is_zero() {
            return Err("Probe interval must be > 0".to_string());
        }
        for (name, p) in [
            ("Probe initial probability", self.probe_initial_probability),
            ("Probe probability step", self.probe_probability_step),
            ("Probe probability floor", self.probe_probability_floor),
        ] {
            if !(0.0..=1.0).contains(&p) || !p.is_finite() {
                return Err(format!("{name} must be between 0.0 and 1.0"));
            }
        }
        if self.probe_probability_floor == 0.0 && self.max_probe_silence.is_none() {
            return Err("Probe floor of 0 requires a max probe silence".to_string());
        }
        if self.max_probe_silence.is_some_and(|s| s.is_zero()) {
            return Err("Max probe silence must be > 0".to_string());
        }
        Ok(())
    }
}
