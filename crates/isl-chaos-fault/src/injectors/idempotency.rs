//! Idempotency tracking.
//!
//! Each inbound request is keyed by a SHA-256 over the behavior name and the
//! canonical form of its input (or of the configured `key_fields`).  A key
//! seen again within `window_ms` is a duplicate; a duplicate whose result
//! differs from the first result for that key is a violation.  With
//! `replays > 1` the injector also drives the invocation, sending the same
//! request that many times in sequence.

use super::{
    lock, pointer, DriveReport, Injector, InjectorState, InjectorStats, Interception, Lifecycle,
    RequestDriver,
};
use crate::behavior::{CallInfo, CallRecord};
use crate::canonical::{canonical_json, sha256_hex};
use crate::faults::{IdempotencyConfig, InjectionType};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyStats {
    pub requests: u64,
    pub unique_keys: u64,
    pub duplicates: u64,
    pub violations: u64,
    pub replays: u32,
}

/// A duplicate request that produced a different result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyViolation {
    pub key: String,
    pub sequence: u64,
    pub expected: Value,
    pub actual: Value,
}

#[derive(Debug)]
struct Seen {
    first_seen: Instant,
    result: Option<Value>,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: BTreeMap<String, Seen>,
    violations: Vec<IdempotencyViolation>,
    stats: IdempotencyStats,
}

pub struct IdempotencyInjector {
    config: IdempotencyConfig,
    ledger: Mutex<Ledger>,
    lifecycle: Lifecycle,
}

impl IdempotencyInjector {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Content-derived key for one request.
    pub fn request_key(&self, behavior: &str, input: &Value) -> String {
        let material = if self.config.key_fields.is_empty() {
            canonical_json(input)
        } else {
            let parts: Vec<Value> = self
                .config
                .key_fields
                .iter()
                .map(|field| pointer(input, field).cloned().unwrap_or(Value::Null))
                .collect();
            canonical_json(&Value::Array(parts))
        };
        sha256_hex(&format!("{behavior}:{material}"))
    }

    pub fn violations(&self) -> Vec<IdempotencyViolation> {
        lock(&self.ledger).violations.clone()
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    fn fresh_ledger(&self) -> Ledger {
        Ledger {
            stats: IdempotencyStats {
                replays: self.config.replays,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Injector for IdempotencyInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::IdempotencyCheck
    }

    fn activate(&mut self, timeline: &Timeline) {
        *lock(&self.ledger) = self.fresh_ledger();
        self.lifecycle.begin(
            InjectionType::IdempotencyCheck,
            timeline,
            json!({
                "windowMs": self.config.window_ms,
                "replays": self.config.replays,
                "keyFields": self.config.key_fields,
            }),
        );
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(InjectionType::IdempotencyCheck, timeline) {
            let stats = lock(&self.ledger).stats.clone();
            timeline.injection_end(InjectionType::IdempotencyCheck, json!(stats));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        let stats = lock(&self.ledger).stats.clone();
        self.lifecycle
            .snapshot(InjectionType::IdempotencyCheck, InjectorStats::Idempotency(stats))
    }

    fn intercept(&self, call: &CallInfo<'_>, _timeline: &Timeline) -> Interception {
        if !self.is_active() {
            return Interception::Proceed;
        }
        let key = self.request_key(call.behavior, call.input);
        let window = self.window();
        let now = Instant::now();
        let mut guard = lock(&self.ledger);
        let ledger = &mut *guard;
        ledger.stats.requests += 1;
        match ledger.entries.entry(key) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(seen.get().first_seen) < window {
                    ledger.stats.duplicates += 1;
                } else {
                    let seen = seen.get_mut();
                    seen.first_seen = now;
                    seen.result = None;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Seen {
                    first_seen: now,
                    result: None,
                });
                ledger.stats.unique_keys += 1;
            }
        }
        Interception::Proceed
    }

    fn observe(&self, call: &CallInfo<'_>, record: &CallRecord, _timeline: &Timeline) {
        if !self.is_active() || !record.reached_behavior() {
            return;
        }
        let key = self.request_key(call.behavior, call.input);
        let actual = record.result_fingerprint();
        let mut guard = lock(&self.ledger);
        let ledger = &mut *guard;
        let Some(seen) = ledger.entries.get_mut(&key) else {
            return;
        };
        let expected = match seen.result.clone() {
            None => {
                seen.result = Some(actual);
                return;
            }
            Some(expected) if expected == actual => return,
            Some(expected) => expected,
        };
        log::warn!(
            "idempotency violation on {} (call {}): result changed on replay",
            call.behavior,
            call.sequence
        );
        ledger.stats.violations += 1;
        ledger.violations.push(IdempotencyViolation {
            key,
            sequence: call.sequence,
            expected,
            actual,
        });
    }

    fn driver(&self) -> Option<&dyn RequestDriver> {
        if self.is_active() && self.config.replays > 1 {
            Some(self)
        } else {
            None
        }
    }
}

impl RequestDriver for IdempotencyInjector {
    fn drive(
        &self,
        invoke: &(dyn Fn(&Value) -> CallRecord + Sync),
        input: &Value,
        _timeline: &Timeline,
    ) -> DriveReport {
        let calls = (0..self.config.replays.max(1)).map(|_| invoke(input)).collect();
        DriveReport { calls, race: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorOutcome;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn stats(injector: &IdempotencyInjector) -> IdempotencyStats {
        match injector.state().stats {
            InjectorStats::Idempotency(stats) => stats,
            other => panic!("wrong stats kind {other:?}"),
        }
    }

    /// Run one call through intercept/observe the way the executor does.
    fn send(
        injector: &IdempotencyInjector,
        timeline: &Timeline,
        input: &Value,
        sequence: u64,
        data: Value,
    ) {
        let call = CallInfo {
            behavior: "CreateOrder",
            input,
            attempt: 1,
            sequence,
        };
        assert_eq!(injector.intercept(&call, timeline), Interception::Proceed);
        let record = CallRecord {
            sequence,
            attempt: 1,
            input: input.clone(),
            outcome: Some(BehaviorOutcome::ok(data)),
            thrown: None,
            intercepted_by: None,
            fatal: None,
            duration_ms: 0.0,
        };
        injector.observe(&call, &record, timeline);
    }

    #[test]
    fn key_ignores_field_order() {
        let injector = IdempotencyInjector::new(IdempotencyConfig::default());
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(injector.request_key("X", &a), injector.request_key("X", &b));
        assert_ne!(injector.request_key("X", &a), injector.request_key("Y", &a));
    }

    #[test]
    fn key_fields_narrow_the_key() {
        let injector = IdempotencyInjector::new(IdempotencyConfig {
            key_fields: vec!["/orderId".into()],
            ..Default::default()
        });
        let a = json!({"orderId": 9, "note": "first"});
        let b = json!({"orderId": 9, "note": "retry"});
        assert_eq!(injector.request_key("X", &a), injector.request_key("X", &b));
    }

    #[test]
    fn consistent_replays_are_duplicates_not_violations() {
        let timeline = Timeline::new();
        let mut injector = IdempotencyInjector::new(IdempotencyConfig::default());
        injector.activate(&timeline);
        let input = json!({"orderId": 1});
        send(&injector, &timeline, &input, 0, json!({"id": 100}));
        send(&injector, &timeline, &input, 1, json!({"id": 100}));

        let s = stats(&injector);
        assert_eq!((s.requests, s.unique_keys, s.duplicates, s.violations), (2, 1, 1, 0));
    }

    #[test]
    fn changed_result_is_a_violation() {
        let timeline = Timeline::new();
        let mut injector = IdempotencyInjector::new(IdempotencyConfig::default());
        injector.activate(&timeline);
        let input = json!({"orderId": 1});
        send(&injector, &timeline, &input, 0, json!({"id": 100}));
        send(&injector, &timeline, &input, 1, json!({"id": 101}));

        let violations = injector.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].sequence, 1);
        assert_eq!(stats(&injector).violations, 1);
    }

    #[test]
    fn expired_window_starts_over() {
        let timeline = Timeline::new();
        let mut injector = IdempotencyInjector::new(IdempotencyConfig {
            window_ms: 5,
            ..Default::default()
        });
        injector.activate(&timeline);
        let input = json!({});
        send(&injector, &timeline, &input, 0, json!(1));
        std::thread::sleep(Duration::from_millis(15));
        send(&injector, &timeline, &input, 1, json!(2));
        let s = stats(&injector);
        assert_eq!((s.duplicates, s.violations), (0, 0));
    }

    #[test]
    fn drives_sequential_replays() {
        let timeline = Timeline::new();
        let mut injector = IdempotencyInjector::new(IdempotencyConfig {
            replays: 3,
            ..Default::default()
        });
        assert!(injector.driver().is_none());
        injector.activate(&timeline);

        let sent = AtomicU64::new(0);
        let invoke = |input: &Value| CallRecord {
            sequence: sent.fetch_add(1, Ordering::SeqCst),
            attempt: 1,
            input: input.clone(),
            outcome: Some(BehaviorOutcome::ok(json!({}))),
            thrown: None,
            intercepted_by: None,
            fatal: None,
            duration_ms: 0.0,
        };
        let report = injector
            .driver()
            .expect("driver while active")
            .drive(&invoke, &json!({}), &timeline);
        assert_eq!(report.calls.len(), 3);
        assert!(report.race.is_none());
        assert_eq!(sent.load(Ordering::SeqCst), 3);
    }
}
