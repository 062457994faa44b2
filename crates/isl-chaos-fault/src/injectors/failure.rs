//! Network partition, database failure and service outage.
//!
//! All three share one model: answer the first `fail_attempts` calls with a
//! configured error shape, then let calls through ("recover").  The first
//! successful call after injected failures is recorded as a `recovery`.

use super::{lock, rng_from_seed, Injector, InjectorState, InjectorStats, Interception, Lifecycle};
use crate::behavior::{BehaviorOutcome, CallInfo, CallRecord};
use crate::faults::{FailureConfig, FailureShape, InjectionType};
use crate::timeline::Timeline;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStats {
    pub error_code: String,
    /// Calls seen while active.
    pub attempts: u64,
    pub failures_injected: u64,
    pub passed_through: u64,
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at_ms: Option<f64>,
}

pub struct FailureInjector {
    injection_type: InjectionType,
    config: FailureConfig,
    shape: FailureShape,
    seed: u64,
    rng: Mutex<ChaCha20Rng>,
    stats: Mutex<FailureStats>,
    lifecycle: Lifecycle,
}

impl FailureInjector {
    pub fn new(injection_type: InjectionType, config: FailureConfig, seed: u64) -> Self {
        let shape = config
            .error
            .unwrap_or_else(|| FailureShape::default_for(injection_type));
        Self {
            injection_type,
            shape,
            seed,
            rng: Mutex::new(rng_from_seed(seed)),
            stats: Mutex::new(Self::fresh_stats(shape)),
            config,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn shape(&self) -> FailureShape {
        self.shape
    }

    fn fresh_stats(shape: FailureShape) -> FailureStats {
        FailureStats {
            error_code: shape.code().to_string(),
            ..Default::default()
        }
    }

    fn message(&self) -> String {
        self.config
            .message
            .clone()
            .unwrap_or_else(|| self.shape.default_message().to_string())
    }

    /// Decide whether this call fails, updating counters.
    fn should_fail(&self) -> bool {
        let mut stats = lock(&self.stats);
        stats.attempts += 1;
        let budget_left = self
            .config
            .fail_attempts
            .map_or(true, |n| stats.failures_injected < u64::from(n));
        let hit = budget_left
            && (self.config.failure_rate >= 1.0
                || lock(&self.rng).gen::<f64>() < self.config.failure_rate);
        if hit {
            stats.failures_injected += 1;
        } else {
            stats.passed_through += 1;
        }
        hit
    }
}

impl Injector for FailureInjector {
    fn injection_type(&self) -> InjectionType {
        self.injection_type
    }

    fn activate(&mut self, timeline: &Timeline) {
        *lock(&self.stats) = Self::fresh_stats(self.shape);
        *lock(&self.rng) = rng_from_seed(self.seed);
        self.lifecycle.begin(
            self.injection_type,
            timeline,
            json!({
                "error": self.shape,
                "code": self.shape.code(),
                "failAttempts": self.config.fail_attempts,
                "failureRate": self.config.failure_rate,
                "fatal": self.config.fatal,
            }),
        );
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(self.injection_type, timeline) {
            let stats = lock(&self.stats).clone();
            timeline.injection_end(self.injection_type, json!(stats));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        let stats = lock(&self.stats).clone();
        self.lifecycle
            .snapshot(self.injection_type, InjectorStats::Failure(stats))
    }

    fn intercept(&self, call: &CallInfo<'_>, _timeline: &Timeline) -> Interception {
        if !self.is_active() || !self.should_fail() {
            return Interception::Proceed;
        }
        if self.shape == FailureShape::Timeout && self.config.timeout_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.timeout_ms));
        }
        log::debug!(
            "{} failing call {} of {} with {}",
            self.injection_type,
            call.sequence,
            call.behavior,
            self.shape.code()
        );
        if self.config.fatal {
            Interception::Fatal(format!("{}: {}", self.shape.code(), self.message()))
        } else {
            Interception::Fail(BehaviorOutcome::failure(self.shape.code(), self.message()))
        }
    }

    fn observe(&self, call: &CallInfo<'_>, record: &CallRecord, timeline: &Timeline) {
        if !self.is_active() || !record.reached_behavior() || !record.succeeded() {
            return;
        }
        let mut stats = lock(&self.stats);
        if stats.failures_injected == 0 || stats.recovered {
            return;
        }
        stats.recovered = true;
        stats.recovered_at_ms = Some(timeline.elapsed_ms());
        let failures = stats.failures_injected;
        drop(stats);
        timeline.recovery(
            self.injection_type,
            json!({ "afterFailures": failures, "attempt": call.attempt }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::TimelineEventType;
    use serde_json::Value;

    fn call(input: &Value, attempt: u32) -> CallInfo<'_> {
        CallInfo {
            behavior: "Charge",
            input,
            attempt,
            sequence: u64::from(attempt),
        }
    }

    fn ok_record(input: &Value, attempt: u32) -> CallRecord {
        CallRecord {
            sequence: u64::from(attempt),
            attempt,
            input: input.clone(),
            outcome: Some(BehaviorOutcome::ok(json!({"charged": true}))),
            thrown: None,
            intercepted_by: None,
            fatal: None,
            duration_ms: 0.1,
        }
    }

    #[test]
    fn fails_then_recovers() {
        let timeline = Timeline::new();
        let mut injector = FailureInjector::new(
            InjectionType::DatabaseFailure,
            FailureConfig {
                fail_attempts: Some(2),
                ..Default::default()
            },
            0,
        );
        injector.activate(&timeline);
        let input = json!({});

        for attempt in 1..=2 {
            match injector.intercept(&call(&input, attempt), &timeline) {
                Interception::Fail(outcome) => {
                    assert_eq!(outcome.error_code(), Some("ECONNREFUSED"))
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
        assert_eq!(injector.intercept(&call(&input, 3), &timeline), Interception::Proceed);
        injector.observe(&call(&input, 3), &ok_record(&input, 3), &timeline);
        injector.observe(&call(&input, 4), &ok_record(&input, 4), &timeline);

        let recoveries: Vec<_> = timeline
            .events()
            .into_iter()
            .filter(|e| e.event_type == TimelineEventType::Recovery)
            .collect();
        assert_eq!(recoveries.len(), 1);

        let InjectorStats::Failure(stats) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        assert_eq!(stats.failures_injected, 2);
        assert_eq!(stats.passed_through, 1);
        assert!(stats.recovered);
    }

    #[test]
    fn never_recovers_without_budget() {
        let timeline = Timeline::new();
        let mut injector = FailureInjector::new(
            InjectionType::ServiceUnavailable,
            FailureConfig::default(),
            0,
        );
        injector.activate(&timeline);
        let input = json!({});
        for attempt in 1..=10 {
            assert!(matches!(
                injector.intercept(&call(&input, attempt), &timeline),
                Interception::Fail(_)
            ));
        }
    }

    #[test]
    fn fatal_failures_escalate() {
        let timeline = Timeline::new();
        let mut injector = FailureInjector::new(
            InjectionType::NetworkPartition,
            FailureConfig {
                fatal: true,
                error: Some(FailureShape::Deadlock),
                ..Default::default()
            },
            0,
        );
        injector.activate(&timeline);
        let input = json!({});
        match injector.intercept(&call(&input, 1), &timeline) {
            Interception::Fatal(msg) => assert!(msg.starts_with("DEADLOCK_DETECTED")),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn inactive_injector_lets_calls_through() {
        let timeline = Timeline::new();
        let injector =
            FailureInjector::new(InjectionType::NetworkPartition, FailureConfig::default(), 0);
        let input = json!({});
        assert_eq!(injector.intercept(&call(&input, 1), &timeline), Interception::Proceed);
    }

    #[test]
    fn zero_failure_rate_never_fails() {
        let timeline = Timeline::new();
        let mut injector = FailureInjector::new(
            InjectionType::DatabaseFailure,
            FailureConfig {
                failure_rate: 0.0,
                ..Default::default()
            },
            3,
        );
        injector.activate(&timeline);
        let input = json!({});
        for attempt in 1..=5 {
            assert_eq!(
                injector.intercept(&call(&input, attempt), &timeline),
                Interception::Proceed
            );
        }
    }
}
