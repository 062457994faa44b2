//! Stateful fault injectors.
//!
//! Every injector follows the same lifecycle:
//!
//! - [`Injector::activate`] resets runtime state, records an
//!   `injection_start` event and starts any background loop.
//! - [`Injector::deactivate`] is idempotent: it cancels the loop, releases
//!   held resources and records `injection_end` with a final snapshot.
//! - [`Injector::state`] returns an immutable snapshot at any time.
//!
//! Request-shaped injectors hook into each call through
//! [`Injector::intercept`] / [`Injector::observe`]; driver injectors
//! (concurrency, idempotency replays) decide how many calls are issued.
//! Internal failures are recorded on the timeline and never propagate,
//! except for [`Interception::Fatal`], which models an unrecoverable
//! condition the scenario is designed to detect.

mod clock_skew;
mod concurrent;
mod cpu;
mod failure;
mod idempotency;
mod latency;
mod memory;
mod rate_limit;

pub use clock_skew::{ClockSkewInjector, ClockStats};
pub use concurrent::{
    detect_race, ConcurrencyStats, ConcurrentRequestsInjector, RaceKind, RaceReport,
};
pub use cpu::{CpuPressureInjector, CpuStats};
pub use failure::{FailureInjector, FailureStats};
pub use idempotency::{IdempotencyInjector, IdempotencyStats, IdempotencyViolation};
pub use latency::{LatencyInjector, LatencyStats};
pub use memory::{MemoryPressureInjector, MemoryStats};
pub use rate_limit::{RateLimitInjector, RateLimitStats};

use crate::behavior::{BehaviorOutcome, CallInfo, CallRecord};
use crate::clock::Clock;
use crate::faults::{Injection, InjectionType};
use crate::timeline::Timeline;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors raised inside an injector.  They are recorded on the timeline,
/// not returned to the executor.
#[derive(Error, Debug)]
pub enum InjectorError {
    #[error("failed to allocate {requested_bytes} bytes: {source}")]
    Allocation {
        requested_bytes: usize,
        #[source]
        source: std::collections::TryReserveError,
    },

    #[error("failed to spawn background worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("background worker panicked")]
    WorkerPanicked,
}

/// What an injector decided for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    /// Let the call continue (possibly after a delay already applied).
    Proceed,
    /// Answer the call with this outcome instead of invoking the behavior.
    Fail(BehaviorOutcome),
    /// Raise an unrecoverable condition to the executor.
    Fatal(String),
}

/// Calls produced by a request driver.
#[derive(Debug, Clone, Default)]
pub struct DriveReport {
    /// Final record of each logical request, in issue order.
    pub calls: Vec<CallRecord>,
    pub race: Option<RaceReport>,
}

/// Injector that decides how many calls are issued for one invocation.
pub trait RequestDriver: Sync {
    fn drive(
        &self,
        invoke: &(dyn Fn(&Value) -> CallRecord + Sync),
        input: &Value,
        timeline: &Timeline,
    ) -> DriveReport;
}

/// Common contract of every fault injector.
pub trait Injector: Send + Sync {
    fn injection_type(&self) -> InjectionType;

    fn activate(&mut self, timeline: &Timeline);

    /// Safe to call repeatedly or without a prior activation.
    fn deactivate(&mut self, timeline: &Timeline);

    fn is_active(&self) -> bool;

    fn state(&self) -> InjectorState;

    fn intercept(&self, _call: &CallInfo<'_>, _timeline: &Timeline) -> Interception {
        Interception::Proceed
    }

    fn observe(&self, _call: &CallInfo<'_>, _record: &CallRecord, _timeline: &Timeline) {}

    fn driver(&self) -> Option<&dyn RequestDriver> {
        None
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        None
    }
}

/// Snapshot of an injector's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectorState {
    pub injection_type: InjectionType,
    pub active: bool,
    pub activations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at_ms: Option<f64>,
    pub stats: InjectorStats,
}

/// Type-specific runtime statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InjectorStats {
    Latency(LatencyStats),
    Failure(FailureStats),
    Cpu(CpuStats),
    Memory(MemoryStats),
    Clock(ClockStats),
    Concurrency(ConcurrencyStats),
    RateLimit(RateLimitStats),
    Idempotency(IdempotencyStats),
}

/// Activation bookkeeping shared by all injectors.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lifecycle {
    active: bool,
    activations: u32,
    activated_at_ms: Option<f64>,
    deactivated_at_ms: Option<f64>,
}

impl Lifecycle {
    /// Mark active and record `injection_start`.
    pub(crate) fn begin(
        &mut self,
        injection_type: InjectionType,
        timeline: &Timeline,
        detail: Value,
    ) {
        self.active = true;
        self.activations += 1;
        self.activated_at_ms = Some(timeline.elapsed_ms());
        self.deactivated_at_ms = None;
        log::debug!("activated {injection_type}");
        timeline.injection_start(injection_type, detail);
    }

    /// Mark inactive and record `injection_end`.  Returns `false` when the
    /// injector was not active (nothing recorded).
    pub(crate) fn end(&mut self, injection_type: InjectionType, timeline: &Timeline) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.deactivated_at_ms = Some(timeline.elapsed_ms());
        log::debug!("deactivated {injection_type}");
        true
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn snapshot(
        &self,
        injection_type: InjectionType,
        stats: InjectorStats,
    ) -> InjectorState {
        InjectorState {
            injection_type,
            active: self.active,
            activations: self.activations,
            activated_at_ms: self.activated_at_ms,
            deactivated_at_ms: self.deactivated_at_ms,
            stats,
        }
    }
}

/// Build a fresh injector for `injection`, seeded for reproducibility.
pub fn build_injector(injection: &Injection, seed: u64) -> Box<dyn Injector> {
    let t = injection.injection_type();
    match injection {
        Injection::NetworkLatency(c) => Box::new(LatencyInjector::new(c.clone(), seed)),
        Injection::NetworkPartition(c)
        | Injection::DatabaseFailure(c)
        | Injection::ServiceUnavailable(c) => Box::new(FailureInjector::new(t, c.clone(), seed)),
        Injection::CpuPressure(c) => Box::new(CpuPressureInjector::new(c.clone())),
        Injection::MemoryPressure(c) => Box::new(MemoryPressureInjector::new(c.clone())),
        Injection::ClockSkew(c) => Box::new(ClockSkewInjector::new(c.clone())),
        Injection::ConcurrentRequests(c) => Box::new(ConcurrentRequestsInjector::new(c.clone())),
        Injection::RateLimitStorm(c) | Injection::RateLimit(c) => {
            Box::new(RateLimitInjector::new(t, c.clone()))
        }
        Injection::IdempotencyCheck(c) => Box::new(IdempotencyInjector::new(c.clone())),
    }
}

pub(crate) fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    ChaCha20Rng::from_seed(key)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve a JSON pointer, treating `""` as the whole document.
pub(crate) fn pointer<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        Some(value)
    } else {
        value.pointer(path)
    }
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
