//! REST fallback used once a channel has spent its retry budget.
//!
//! While polling, a probe task periodically rolls for a reconnect attempt.
//! The chance starts at `probe_initial_probability` and drops by
//! `probe_probability_step` per roll down to `probe_probability_floor`. A
//! probe is forced when none has fired for `max_probe_silence`.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, interval_at, sleep},
};
use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    dispatcher::panic_message,
    error::SyncResult,
    report::{ErrorContext, ErrorKind, ErrorReporter, TracingReporter},
};

/// Fetches fresh data over REST.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

/// Attempts a fresh channel; resolves to whether it opened.
pub type ReconnectProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Chance of probing on roll number `rolls` (zero-based).
pub fn probe_probability(rolls: u32, initial: f64, step: f64, floor: f64) -> f64 {
    (initial - f64::from(rolls) * step).max(floor).clamp(0.0, 1.0)
}

/// Run `fetch`, reporting errors and panics instead of propagating them.
async fn run_fetch(fetch: &FetchFn, reporter: &dyn ErrorReporter, what: &str) {
    match AssertUnwindSafe(fetch()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            reporter.report(ErrorKind::Fetch, &ErrorContext::new(format!("{what} failed: {err}")));
        }
        Err(panic) => reporter.report(
            ErrorKind::Fetch,
            &ErrorContext::new(format!("{what} panicked: {}", panic_message(panic.as_ref()))),
        ),
    }
}

#[derive(Clone, Copy, Debug)]
struct ProbePolicy {
    interval: Duration,
    initial: f64,
    step: f64,
    floor: f64,
    max_silence: Option<Duration>,
}

#[derive(Default)]
struct Tasks {
    poll: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
}

struct PollerInner {
    policy: ProbePolicy,
    default_interval: Duration,
    reporter: Arc<dyn ErrorReporter>,
    tasks: Mutex<Tasks>,
    generation: AtomicU64,
    probe_rolls: AtomicU32,
    probe_attempts: AtomicU32,
    seed: Option<u64>,
}

impl PollerInner {
    fn stop(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        let was_polling = tasks.poll.is_some();
        if let Some(task) = tasks.poll.take() {
            task.abort();
        }
        if let Some(task) = tasks.probe.take() {
            task.abort();
        }
        was_polling
    }
}

/// Periodic REST refresh with randomized reconnect probing.
#[derive(Clone)]
pub struct FallbackPoller {
    inner: Arc<PollerInner>,
}

impl fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("polling", &self.is_polling())
            .field("probe_attempts", &self.probe_attempts())
            .finish()
    }
}

impl FallbackPoller {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    pub fn with_reporter(config: &SyncConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                policy: ProbePolicy {
                    interval: config.probe_interval,
                    initial: config.probe_initial_probability,
                    step: config.probe_probability_step,
                    floor: config.probe_probability_floor,
                    max_silence: config.max_probe_silence,
                },
                default_interval: config.poll_interval,
                reporter,
                tasks: Mutex::new(Tasks::default()),
                generation: AtomicU64::new(0),
                probe_rolls: AtomicU32::new(0),
                probe_attempts: AtomicU32::new(0),
                seed: None,
            }),
        }
    }

    /// Seed the probe dice.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.seed = Some(seed);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Interval used when the caller has no preference.
    pub fn default_interval(&self) -> Duration {
        self.inner.default_interval
    }

    /// Call `fetch` now and then every `interval` until stopped.
    ///
    /// Returns `false` if already polling.
    pub fn start(&self, fetch: FetchFn, interval: Duration) -> bool {
        self.spawn(fetch, interval, None)
    }

    /// Like [`start`](Self::start), plus a background reconnect probe. A
    /// probe that reports success stops the poller.
    pub fn start_with_probe(
        &self,
        fetch: FetchFn,
        interval: Duration,
        probe: ReconnectProbe,
    ) -> bool {
        self.spawn(fetch, interval, Some(probe))
    }

    fn spawn(&self, fetch: FetchFn, poll_interval: Duration, probe: Option<ReconnectProbe>) -> bool {
        let mut tasks = self.inner.tasks.lock();
        if tasks.poll.is_some() {
            return false;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.probe_rolls.store(0, Ordering::SeqCst);
        self.inner.probe_attempts.store(0, Ordering::SeqCst);
        info!(interval_ms = poll_interval.as_millis() as u64, "Fallback polling started");

        let inner = Arc::clone(&self.inner);
        tasks.poll = Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                run_fetch(&fetch, inner.reporter.as_ref(), "fallback poll").await;
            }
        }));

        if let Some(probe) = probe {
            let inner = Arc::clone(&self.inner);
            tasks.probe = Some(tokio::spawn(probe_loop(inner, probe, generation)));
        }
        true
    }

    /// Stop polling and probing. Returns whether polling was active.
    pub fn stop(&self) -> bool {
        let was_polling = self.inner.stop();
        if was_polling {
            info!("Fallback polling stopped");
        }
        was_polling
    }

    pub fn is_polling(&self) -> bool {
        self.inner.tasks.lock().poll.is_some()
    }

    /// Reconnect probes fired since polling started.
    pub fn probe_attempts(&self) -> u32 {
        self.inner.probe_attempts.load(Ordering::SeqCst)
    }

    /// Probability used on the next roll.
    pub fn next_probe_probability(&self) -> f64 {
        let policy = self.inner.policy;
        probe_probability(
            self.inner.probe_rolls.load(Ordering::SeqCst),
            policy.initial,
            policy.step,
            policy.floor,
        )
    }
}

async fn probe_loop(inner: Arc<PollerInner>, probe: ReconnectProbe, generation: u64) {
    let policy = inner.policy;
    let mut rng = match inner.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut last_probe = Instant::now();
    let mut ticker = interval_at(Instant::now() + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let rolls = inner.probe_rolls.fetch_add(1, Ordering::SeqCst);
        let probability = probe_probability(rolls, policy.initial, policy.step, policy.floor);
        let forced = policy
            .max_silence
            .is_some_and(|silence| last_probe.elapsed() >= silence);
        if !forced && !rng.random_bool(probability) {
            continue;
        }

        last_probe = Instant::now();
        let attempt = inner.probe_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, probability, forced, "Probing for reconnect");

        let connected = AssertUnwindSafe(probe()).catch_unwind().await.unwrap_or(false);
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if connected {
            info!(attempt, "Reconnect probe succeeded, leaving polling mode");
            inner.stop();
            return;
        }
    }
}

/// Shared last-fetch clock for throttling ad-hoc refreshes.
#[derive(Clone)]
pub struct RefreshThrottle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    throttle: Duration,
    debounce: Duration,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last_fetch: Option<Instant>,
    pending: bool,
}

/// What happened to a refresh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshDecision {
    /// A fetch will run after the debounce window.
    Scheduled,
    /// Folded into a fetch that is already scheduled.
    Coalesced,
    /// A fetch ran within the throttle window.
    Throttled,
}

impl fmt::Debug for RefreshThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshThrottle")
            .field("throttle", &self.inner.throttle)
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

impl RefreshThrottle {
    pub fn new(throttle: Duration, debounce: Duration, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                throttle,
                debounce,
                reporter,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self::new(config.refresh_throttle, config.refresh_debounce, reporter)
    }

    /// Ask for a refresh. Must be called from within a Tokio runtime.
    pub fn request(&self, fetch: FetchFn) -> RefreshDecision {
        {
            let mut state = self.inner.state.lock();
            if state.pending {
                return RefreshDecision::Coalesced;
            }
            if state
                .last_fetch
                .is_some_and(|at| at.elapsed() < self.inner.throttle)
            {
                return RefreshDecision::Throttled;
            }
            state.pending = true;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(inner.debounce).await;
            {
                let mut state = inner.state.lock();
                state.pending = false;
                state.last_fetch = Some(Instant::now());
            }
            run_fetch(&fetch, inner.reporter.as_ref(), "refresh").await;
        });
        RefreshDecision::Scheduled
    }

    /// Record a fetch that happened outside [`request`](Self::request).
    pub fn mark_fetched(&self) {
        self.inner.state.lock().last_fetch = Some(Instant::now());
    }

    pub fn last_fetch(&self) -> Option<Instant> {
        self.inner.state.lock().last_fetch
    }
}
