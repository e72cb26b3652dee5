//! Per-backend circuit breakers.
//!
//! ## Usage
//!
//! The engine asks [`BreakerBank::route`] where a call may run before executing
//! it, then reports the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].
//!
//! ```text
//! Closed --N failures--> Open --cool-down--> HalfOpen --success--> Closed
//!                          ^                     |
//!                          +-------failure-------+
//! ```
//!
//! A half-open breaker admits one probe at a time. If the probe never reports
//! back, another one is admitted after a further cool-down.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    call_key::Backend,
    clock::{duration_nanos, elapsed_since},
    config::{BreakerConfig, FallbackTable},
};

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed = 0,
    /// Calls are rejected until the cool-down elapses.
    Open = 1,
    /// A single probe call decides whether to close again.
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Lock-free breaker for one backend.
pub struct CircuitBreaker {
    backend: Backend,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at: AtomicU64,
    probe_in_flight: AtomicBool,
    probe_started_at: AtomicU64,
    failure_threshold: u32,
    cooldown_nanos: u64,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(backend: Backend, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            backend,
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            probe_started_at: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
            cooldown_nanos: duration_nanos(cooldown),
        }
    }

    /// Backend guarded by this breaker.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a call may be executed at `now`. May move an open breaker to
    /// half-open and claim its probe slot.
    pub fn should_allow(&self, now: u64) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if elapsed_since(now, self.opened_at.load(Ordering::Acquire)) < self.cooldown_nanos {
                    return false;
                }
                // The probe slot is already held from the moment the breaker
                // opened; only its start time moves.
                self.probe_started_at.store(now, Ordering::Release);
                let won = self
                    .state
                    .compare_exchange(
                        BreakerState::Open as u8,
                        BreakerState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if !won {
                    return false;
                }
                info!(backend = %self.backend, "circuit breaker half-open, admitting probe");
                true
            }
            BreakerState::HalfOpen => self.claim_probe(now),
        }
    }

    fn claim_probe(&self, now: u64) -> bool {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.probe_started_at.store(now, Ordering::Release);
            return true;
        }
        // A probe that never reported back is abandoned after a cool-down.
        let started = self.probe_started_at.load(Ordering::Acquire);
        if elapsed_since(now, started) >= self.cooldown_nanos {
            return self
                .probe_started_at
                .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        false
    }

    /// Records a successful call. Only a half-open breaker closes; an open
    /// one waits for its cool-down and probe.
    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => self.consecutive_failures.store(0, Ordering::Release),
            BreakerState::HalfOpen => {
                if self
                    .state
                    .compare_exchange(
                        BreakerState::HalfOpen as u8,
                        BreakerState::Closed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.probe_in_flight.store(false, Ordering::Release);
                    info!(backend = %self.backend, "circuit breaker closed after probe");
                }
            }
            // Calls admitted before the breaker opened may still land here.
            BreakerState::Open => {}
        }
    }

    /// Records a failed call at `now`.
    pub fn record_failure(&self, now: u64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state() {
            BreakerState::HalfOpen => {
                self.open(now, BreakerState::HalfOpen, failures);
            }
            BreakerState::Closed if failures >= self.failure_threshold => {
                self.open(now, BreakerState::Closed, failures);
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    /// Opens the breaker immediately, regardless of the failure count.
    pub fn trip(&self, now: u64) {
        match self.state() {
            BreakerState::Open => {}
            from => self.open(now, from, self.consecutive_failures.load(Ordering::Acquire)),
        }
    }

    fn open(&self, now: u64, from: BreakerState, failures: u32) {
        self.opened_at.store(now, Ordering::Release);
        if self
            .state
            .compare_exchange(
                from as u8,
                BreakerState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.probe_in_flight.store(true, Ordering::Release);
            warn!(
                backend = %self.backend,
                from = %from,
                failures,
                "circuit breaker opened"
            );
        }
    }

    /// Closes the breaker from any state, e.g. after a successful recovery.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self.state.swap(BreakerState::Closed as u8, Ordering::AcqRel);
        self.probe_in_flight.store(false, Ordering::Release);
        if previous != BreakerState::Closed as u8 {
            info!(backend = %self.backend, "circuit breaker reset");
        }
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            backend: self.backend,
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            opened_at_nanos: self.opened_at.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BreakerSnapshot {
    /// Guarded backend.
    pub backend: Backend,
    /// State at snapshot time.
    pub state: BreakerState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the breaker last opened; zero if it never did.
    pub opened_at_nanos: u64,
}

/// One breaker per backend.
pub struct BreakerBank {
    breakers: [CircuitBreaker; Backend::COUNT],
}

impl BreakerBank {
    /// Creates closed breakers for every backend.
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            breakers: Backend::ALL
                .map(|backend| CircuitBreaker::new(backend, config.failure_threshold, config.cooldown)),
        }
    }

    /// Breaker of `backend`.
    pub fn get(&self, backend: Backend) -> &CircuitBreaker {
        &self.breakers[backend.index()]
    }

    /// Every breaker's state.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(CircuitBreaker::snapshot).collect()
    }

    /// Backends whose breaker is open.
    pub fn open_backends(&self) -> impl Iterator<Item = Backend> + '_ {
        self.breakers
            .iter()
            .filter(|breaker| breaker.state() == BreakerState::Open)
            .map(CircuitBreaker::backend)
    }

    /// Backend a call for `backend` should run on at `now`: the backend itself
    /// if its breaker admits the call, otherwise the first fallback in the chain
    /// that `usable` accepts and whose breaker admits it. `None` means there is
    /// no recovery path.
    pub fn route(
        &self,
        backend: Backend,
        fallback: &FallbackTable,
        now: u64,
        mut usable: impl FnMut(Backend) -> bool,
    ) -> Option<Backend> {
        if self.get(backend).should_allow(now) {
            return Some(backend);
        }
        fallback
            .chain(backend)
            .find(|&candidate| usable(candidate) && self.get(candidate).should_allow(now))
    }

    /// Closes every breaker.
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(Backend::Vulkan, threshold, Duration::from_secs(5))
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let breaker = breaker(6);
        for _ in 0..5 {
            breaker.record_failure(0);
            assert_eq!(breaker.state(), BreakerState::Closed);
            assert!(breaker.should_allow(0));
        }
        breaker.record_failure(0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.should_allow(SECOND));
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = breaker(3);
        breaker.record_failure(0);
        breaker.record_failure(0);
        breaker.record_success();
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn admits_exactly_one_probe_after_cooldown() {
        let breaker = breaker(1);
        breaker.record_failure(10);
        assert!(!breaker.should_allow(10 + 4 * SECOND));

        let after = 10 + 5 * SECOND;
        assert!(breaker.should_allow(after));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.should_allow(after));
        assert!(!breaker.should_allow(after + SECOND));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.should_allow(after + SECOND));
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = breaker(1);
        breaker.record_failure(0);
        assert!(breaker.should_allow(5 * SECOND));
        breaker.record_failure(5 * SECOND);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.should_allow(6 * SECOND));
        assert!(breaker.should_allow(10 * SECOND));
    }

    #[test]
    fn abandoned_probe_is_replaced_after_cooldown() {
        let breaker = breaker(1);
        breaker.record_failure(0);
        assert!(breaker.should_allow(5 * SECOND));
        assert!(!breaker.should_allow(9 * SECOND));
        assert!(breaker.should_allow(10 * SECOND));
    }

    #[test]
    fn success_while_open_stays_open() {
        let breaker = breaker(1);
        breaker.record_failure(0);
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.should_allow(SECOND));
        assert_eq!(breaker.snapshot().consecutive_failures, 1);

        // The regular probe still closes it.
        assert!(breaker.should_allow(5 * SECOND));
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn reset_closes_an_open_breaker() {
        let breaker = breaker(1);
        breaker.trip(0);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.should_allow(0));
    }

    #[test]
    fn trip_opens_immediately() {
        let breaker = breaker(5);
        breaker.trip(0);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn routes_through_fallback_chain() {
        let mut config = BreakerConfig::default();
        config.failure_threshold = 1;
        let bank = BreakerBank::new(&config);
        let table = FallbackTable::default();

        assert_eq!(
            bank.route(Backend::Direct3D12, &table, 0, |_| true),
            Some(Backend::Direct3D12)
        );
        bank.get(Backend::Direct3D12).record_failure(0);
        assert_eq!(
            bank.route(Backend::Direct3D12, &table, 0, |_| true),
            Some(Backend::Direct3D11)
        );
        // Unusable D3D11 is skipped.
        assert_eq!(
            bank.route(Backend::Direct3D12, &table, 0, |b| b != Backend::Direct3D11),
            Some(Backend::OpenGl)
        );
        bank.get(Backend::Direct3D11).record_failure(0);
        bank.get(Backend::OpenGl).record_failure(0);
        assert_eq!(bank.route(Backend::Direct3D12, &table, 0, |_| true), None);
        assert_eq!(bank.open_backends().count(), 3);

        bank.reset_all();
        assert_eq!(bank.open_backends().count(), 0);
    }
}
