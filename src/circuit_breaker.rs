//! Per-service circuit breaker with generation-scoped statistics.
//!
//! State lives behind one mutex. Every state change and every rolling-interval reset starts a
//! new *generation* and clears the counts. A call remembers the generation it was admitted in;
//! when it finishes, its outcome is dropped if the generation has moved on, so a straggler from
//! before a trip can never skew the statistics of the probes that followed it.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{CircuitBreakerEvent, GatewayEvent, Telemetry};
use crate::ResilienceError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("breakerMinRequests must be > 0 (got {provided})")]
    InvalidMinRequests { provided: u32 },
    #[error("breakerFailureRatio must be in (0, 1] (got {0})")]
    InvalidFailureRatio(f64),
    #[error("breakerOpenCooldown must be > 0 (got {0:?})")]
    InvalidCooldown(Duration),
    #[error("breakerHalfOpenProbes must be > 0 (got {provided})")]
    InvalidProbeLimit { provided: u32 },
}

/// Validated trip and recovery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    min_requests: u32,
    failure_ratio: f64,
    open_cooldown: Duration,
    half_open_probes: u32,
    interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 5,
            failure_ratio: 0.5,
            open_cooldown: Duration::from_secs(45),
            half_open_probes: 3,
            interval: Duration::from_secs(15),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation. A zero `interval` disables the rolling reset.
    pub fn new(
        min_requests: u32,
        failure_ratio: f64,
        open_cooldown: Duration,
        half_open_probes: u32,
        interval: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if min_requests == 0 {
            return Err(CircuitBreakerError::InvalidMinRequests { provided: min_requests });
        }
        if !(failure_ratio > 0.0 && failure_ratio <= 1.0) {
            return Err(CircuitBreakerError::InvalidFailureRatio(failure_ratio));
        }
        if open_cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(open_cooldown));
        }
        if half_open_probes == 0 {
            return Err(CircuitBreakerError::InvalidProbeLimit { provided: half_open_probes });
        }
        Ok(Self { min_requests, failure_ratio, open_cooldown, half_open_probes, interval })
    }

    pub fn min_requests(&self) -> u32 {
        self.min_requests
    }

    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// Time spent Open before probing.
    pub fn open_cooldown(&self) -> Duration {
        self.open_cooldown
    }

    pub fn half_open_probes(&self) -> u32 {
        self.half_open_probes
    }

    /// Rolling statistics window while Closed.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests
            && f64::from(counts.failures) / f64::from(counts.requests) >= self.failure_ratio
    }
}

/// Outcome tallies of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Admitted calls, including ones still in flight.
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.successes = self.successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn on_release(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }
}

/// How an admitted call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Dropped by its caller before completing.
    Abandoned,
}

type Transition = (CircuitState, CircuitState);

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed: end of the statistics window (0 = none). Open: end of cooldown.
    expiry_millis: u64,
    opened_at_millis: u64,
}

impl BreakerState {
    fn new(config: &CircuitBreakerConfig, now: u64) -> Self {
        let mut state = Self {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry_millis: 0,
            opened_at_millis: 0,
        };
        state.new_generation(config, now);
        state
    }

    fn new_generation(&mut self, config: &CircuitBreakerConfig, now: u64) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = Counts::default();
        self.expiry_millis = match self.state {
            CircuitState::Closed if config.interval.is_zero() => 0,
            CircuitState::Closed => now.saturating_add(duration_millis(config.interval)),
            CircuitState::Open => now.saturating_add(duration_millis(config.open_cooldown)),
            CircuitState::HalfOpen => 0,
        };
    }

    fn set_state(
        &mut self,
        to: CircuitState,
        config: &CircuitBreakerConfig,
        now: u64,
        transitions: &mut Vec<Transition>,
    ) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        if to == CircuitState::Open {
            self.opened_at_millis = now;
        }
        self.new_generation(config, now);
        transitions.push((from, to));
    }

    /// Apply time-driven changes (window roll, cooldown end) before reading state.
    fn refresh(&mut self, config: &CircuitBreakerConfig, now: u64, transitions: &mut Vec<Transition>) {
        match self.state {
            CircuitState::Closed => {
                if self.expiry_millis != 0 && self.expiry_millis <= now {
                    self.new_generation(config, now);
                }
            }
            CircuitState::Open => {
                if self.expiry_millis <= now {
                    self.set_state(CircuitState::HalfOpen, config, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

/// Circuit breaker guarding one downstream service.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(name.into(), config, Arc::new(MonotonicClock::default()), Telemetry::disabled())
    }

    pub(crate) fn with_parts(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        let state = BreakerState::new(&config, clock.now_millis());
        Self { shared: Arc::new(Shared { name, config, state: Mutex::new(state), clock, telemetry }) }
    }

    /// Override the clock (useful for deterministic tests). Resets the breaker.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        Self::with_parts(
            self.shared.name.clone(),
            self.shared.config.clone(),
            Arc::new(clock),
            self.shared.telemetry.clone(),
        )
    }

    /// Route transition notifications to `telemetry`. Resets the breaker.
    pub fn with_telemetry(self, telemetry: Telemetry) -> Self {
        Self::with_parts(
            self.shared.name.clone(),
            self.shared.config.clone(),
            self.shared.clock.clone(),
            telemetry,
        )
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut guard = self.lock();
            guard.refresh(&self.shared.config, self.shared.clock.now_millis(), &mut transitions);
            guard.state
        };
        self.notify(transitions);
        state
    }

    /// Counts of the current generation.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Force Closed with fresh counts.
    pub fn reset(&self) {
        let mut transitions = Vec::new();
        {
            let mut guard = self.lock();
            let now = self.shared.clock.now_millis();
            if guard.state == CircuitState::Closed {
                guard.new_generation(&self.shared.config, now);
            } else {
                guard.set_state(CircuitState::Closed, &self.shared.config, now, &mut transitions);
            }
        }
        self.notify(transitions);
    }

    /// Run `operation` under the breaker; any `Err` counts as a failure.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` without invoking `operation` while Open, or while
    /// Half-Open once the probe quota is used. Returns `ResilienceError::Inner(E)` untouched if
    /// the operation itself fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_classified(operation, |result| result.is_ok()).await
    }

    /// Like [`execute`](Self::execute), with a caller-supplied success test. Use it when some
    /// errors (a downstream "not found") mean the service is healthy.
    pub async fn execute_classified<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        is_success: C,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let generation = self.before_call()?;
        let mut guard = OutcomeGuard { breaker: self, generation, armed: true };
        let result = operation().await;
        guard.armed = false;
        let outcome = if is_success(&result) { Outcome::Success } else { Outcome::Failure };
        self.after_call(generation, outcome);
        result.map_err(ResilienceError::Inner)
    }

    fn before_call<E>(&self) -> Result<u64, ResilienceError<E>> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut guard = self.lock();
            let now = self.shared.clock.now_millis();
            guard.refresh(&self.shared.config, now, &mut transitions);
            let saturated = guard.state == CircuitState::HalfOpen
                && guard.counts.requests >= self.shared.config.half_open_probes;
            if guard.state == CircuitState::Open || saturated {
                Err(ResilienceError::CircuitOpen {
                    service: self.shared.name.clone(),
                    open_for: Duration::from_millis(now.saturating_sub(guard.opened_at_millis)),
                })
            } else {
                guard.counts.on_request();
                Ok(guard.generation)
            }
        };
        self.notify(transitions);
        admitted
    }

    fn after_call(&self, generation: u64, outcome: Outcome) {
        let mut transitions = Vec::new();
        {
            let mut guard = self.lock();
            let config = &self.shared.config;
            let now = self.shared.clock.now_millis();
            guard.refresh(config, now, &mut transitions);
            if guard.generation != generation {
                tracing::trace!(service = %self.shared.name, "dropping outcome from stale generation");
            } else {
                match (guard.state, outcome) {
                    (CircuitState::Closed, Outcome::Abandoned) => guard.counts.on_release(),
                    (CircuitState::Closed, outcome) => {
                        if outcome == Outcome::Success {
                            guard.counts.on_success();
                        } else {
                            guard.counts.on_failure();
                        }
                        if config.ready_to_trip(&guard.counts) {
                            guard.set_state(CircuitState::Open, config, now, &mut transitions);
                        }
                    }
                    (CircuitState::HalfOpen, Outcome::Success) => {
                        guard.counts.on_success();
                        if guard.counts.consecutive_successes >= config.half_open_probes {
                            guard.set_state(CircuitState::Closed, config, now, &mut transitions);
                        }
                    }
                    (CircuitState::HalfOpen, _) => {
                        guard.counts.on_failure();
                        guard.set_state(CircuitState::Open, config, now, &mut transitions);
                    }
                    (CircuitState::Open, _) => {}
                }
            }
        }
        self.notify(transitions);
    }

    fn notify(&self, transitions: Vec<Transition>) {
        for (from, to) in transitions {
            let service = &self.shared.name;
            match to {
                CircuitState::Open => tracing::warn!(service = %service, from = %from, "circuit breaker → open"),
                CircuitState::HalfOpen => tracing::info!(service = %service, "circuit breaker → half-open"),
                CircuitState::Closed => tracing::info!(service = %service, from = %from, "circuit breaker → closed"),
            }
            self.shared.telemetry.emit(GatewayEvent::CircuitBreaker(CircuitBreakerEvent {
                service: service.clone(),
                from,
                to,
            }));
        }
    }
}

/// Settles a call that never reports back. A panic is a failure. A cancelled call gives its
/// slot back while Closed and fails the probe while Half-Open, so a probe slot is never leaked.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome =
            if std::thread::panicking() { Outcome::Failure } else { Outcome::Abandoned };
        self.breaker.after_call(self.generation, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new("user", CircuitBreakerConfig::default()).with_clock(clock.clone())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, ResilienceError<TestError>> {
        b.execute(|| async { Ok::<_, TestError>(7) }).await
    }

    async fn fail(b: &CircuitBreaker) -> Result<u32, ResilienceError<TestError>> {
        b.execute(|| async { Err::<u32, _>(TestError("down")) }).await
    }

    async fn trip(b: &CircuitBreaker) {
        for _ in 0..5 {
            let _ = fail(b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_invalid_config() {
        let cooldown = Duration::from_secs(1);
        assert!(matches!(
            CircuitBreakerConfig::new(0, 0.5, cooldown, 1, Duration::ZERO),
            Err(CircuitBreakerError::InvalidMinRequests { provided: 0 })
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, 0.0, cooldown, 1, Duration::ZERO),
            Err(CircuitBreakerError::InvalidFailureRatio(_))
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, 0.5, Duration::ZERO, 1, Duration::ZERO),
            Err(CircuitBreakerError::InvalidCooldown(_))
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, 0.5, cooldown, 0, Duration::ZERO),
            Err(CircuitBreakerError::InvalidProbeLimit { provided: 0 })
        ));
    }

    #[tokio::test]
    async fn passes_errors_through_untouched() {
        let b = breaker(&ManualClock::default());
        assert_eq!(succeed(&b).await.unwrap(), 7);
        let err = fail(&b).await.unwrap_err();
        assert_eq!(err.into_inner(), Some(TestError("down")));
    }

    #[tokio::test]
    async fn trips_once_ratio_reached_with_min_requests() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        // F F F S S: three of five failed
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = succeed(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = succeed(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        let calls = &AtomicUsize::new(0);
        let err = b
            .execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stays_closed_below_ratio() {
        let b = breaker(&ManualClock::default());
        for _ in 0..6 {
            let _ = succeed(&b).await;
        }
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        // 5 of 11 < 0.5
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn counts_reset_when_window_rolls() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        clock.advance(15_000);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.counts().failures, 1);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_probe_quota_then_closes() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        trip(&b).await;
        clock.advance(45_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // hold three probes in flight so none report back yet
        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..3 {
            let b = b.clone();
            let mut rx = rx.clone();
            probes.push(tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = rx.wait_for(|go| *go).await;
                    Ok::<_, TestError>(())
                })
                .await
            }));
        }
        tokio::task::yield_now().await;
        while b.counts().requests < 3 {
            tokio::task::yield_now().await;
        }
        assert!(succeed(&b).await.unwrap_err().is_circuit_open());

        tx.send_replace(true);
        for probe in probes {
            assert!(probe.await.unwrap().is_ok());
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.counts(), Counts::default());
    }

    #[tokio::test]
    async fn probe_failure_reopens_and_restarts_cooldown() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        trip(&b).await;
        clock.advance(45_000);
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        clock.advance(44_999);
        assert_eq!(b.state(), CircuitState::Open);
        clock.advance(1);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn stale_outcome_does_not_touch_new_generation() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let straggler = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = rx.await;
                    Err::<(), _>(TestError("late"))
                })
                .await
            })
        };
        while b.counts().requests < 1 {
            tokio::task::yield_now().await;
        }
        trip(&b).await;
        clock.advance(45_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let _ = tx.send(());
        assert!(straggler.await.unwrap().is_err());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.counts().failures, 0);
    }

    #[tokio::test]
    async fn classified_business_errors_count_as_success() {
        let b = breaker(&ManualClock::default());
        for _ in 0..10 {
            let _ = b
                .execute_classified(
                    || async { Err::<(), _>(TestError("not found")) },
                    |r| matches!(r, Err(TestError("not found"))),
                )
                .await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.counts().successes, 10);
    }

    #[tokio::test]
    async fn panicking_probe_counts_as_failure() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        trip(&b).await;
        clock.advance(45_000);

        fn explode() -> Result<(), TestError> {
            panic!("boom")
        }

        let result = std::panic::AssertUnwindSafe(b.execute(|| async { explode() }))
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn cancelled_call_releases_its_slot_while_closed() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        for _ in 0..10 {
            let mut call = Box::pin(b.execute(std::future::pending::<Result<u32, TestError>>));
            assert!((&mut call).now_or_never().is_none());
            assert_eq!(b.counts().requests, 1);
            drop(call);
        }
        assert_eq!(b.counts(), Counts::default());
        assert_eq!(b.state(), CircuitState::Closed);

        // a later failure is judged against completed calls only
        fail(&b).await.unwrap_err();
        assert_eq!(b.counts().requests, 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancelled_probe_reopens() {
        let clock = ManualClock::default();
        let b = breaker(&clock);
        trip(&b).await;
        clock.advance(45_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let mut call = Box::pin(b.execute(std::future::pending::<Result<u32, TestError>>));
        assert!((&mut call).now_or_never().is_none());
        drop(call);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn transitions_are_reported() {
        let clock = ManualClock::default();
        let sink = MemorySink::new();
        let b = breaker(&clock).with_telemetry(Telemetry::recording(sink.clone()));
        trip(&b).await;
        clock.advance(45_000);
        for _ in 0..3 {
            succeed(&b).await.unwrap();
        }
        let seen: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::CircuitBreaker(c) => Some((c.from, c.to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn reset_closes_open_breaker() {
        let b = breaker(&ManualClock::default());
        trip(&b).await;
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b).await.unwrap(), 7);
    }
}
