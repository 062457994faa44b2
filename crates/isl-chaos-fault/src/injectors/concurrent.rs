//! Concurrent requests: issues overlapping calls with identical input and
//! inspects the results for race symptoms.
//!
//! ```text
//!   all_at_once   ║║║║║            (barrier release)
//!   staggered     ║ ║ ║ ║ ║        (stagger_ms apart)
//!   burst         ║║  ║║  ║        (burst_size, burst_pause_ms)
//! ```

use super::{
    lock, pointer, DriveReport, Injector, InjectorState, InjectorStats, Lifecycle, RequestDriver,
};
use crate::behavior::CallRecord;
use crate::faults::{ConcurrencyPattern, ConcurrentConfig, InjectionType};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::time::Duration;

/// Symptom of a race condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceKind {
    /// Successful calls with identical input returned different results.
    DivergentResults,
    /// Two successful results share a value that must be unique.
    UniquenessViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceReport {
    pub kinds: Vec<RaceKind>,
    pub total_calls: usize,
    pub successful_calls: usize,
    /// Distinct successful results (ignoring the unique field).
    pub distinct_results: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicate_values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStats {
    pub pattern: ConcurrencyPattern,
    pub requested: usize,
    pub calls_issued: usize,
    pub successes: usize,
    pub failures: usize,
    pub max_in_flight: usize,
    pub race_detected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub race_kinds: Vec<RaceKind>,
}

/// Inspect calls that shared one input for race symptoms.
pub fn detect_race(calls: &[CallRecord], unique_field: Option<&str>) -> Option<RaceReport> {
    let successes: Vec<&CallRecord> = calls
        .iter()
        .filter(|c| c.reached_behavior() && c.succeeded())
        .collect();

    let mut fingerprints = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut duplicates = Vec::new();
    for call in &successes {
        let mut data = call
            .outcome
            .as_ref()
            .and_then(|o| o.data.clone())
            .unwrap_or(Value::Null);
        if let Some(field) = unique_field {
            if let Some(value) = pointer(&data, field).cloned() {
                let key = crate::canonical::canonical_json(&value);
                if !seen.insert(key) && !duplicates.contains(&value) {
                    duplicates.push(value);
                }
                if let Some(slot) = data.pointer_mut(field) {
                    *slot = Value::Null;
                }
            }
        }
        fingerprints.insert(crate::canonical::canonical_json(&data));
    }

    let mut kinds = Vec::new();
    if fingerprints.len() > 1 {
        kinds.push(RaceKind::DivergentResults);
    }
    if !duplicates.is_empty() {
        kinds.push(RaceKind::UniquenessViolation);
    }
    if kinds.is_empty() {
        return None;
    }
    Some(RaceReport {
        kinds,
        total_calls: calls.len(),
        successful_calls: successes.len(),
        distinct_results: fingerprints.len(),
        duplicate_values: duplicates,
    })
}

pub struct ConcurrentRequestsInjector {
    config: ConcurrentConfig,
    stats: Mutex<ConcurrencyStats>,
    lifecycle: Lifecycle,
}

impl ConcurrentRequestsInjector {
    pub fn new(config: ConcurrentConfig) -> Self {
        let stats = Mutex::new(Self::fresh_stats(&config));
        Self {
            config,
            stats,
            lifecycle: Lifecycle::default(),
        }
    }

    fn fresh_stats(config: &ConcurrentConfig) -> ConcurrencyStats {
        ConcurrencyStats {
            pattern: config.pattern,
            requested: config.count,
            ..Default::default()
        }
    }
}

/// One driven invocation: the shared call site plus in-flight tracking.
struct Requests<'a> {
    invoke: &'a (dyn Fn(&Value) -> CallRecord + Sync),
    input: &'a Value,
    timeline: &'a Timeline,
    current: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Requests<'_> {
    fn call(&self) -> CallRecord {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let record = (self.invoke)(self.input);
        self.current.fetch_sub(1, Ordering::SeqCst);
        record
    }

    /// Issue `count` calls numbered from `first`, released together.
    fn wave(&self, first: usize, count: usize, out: &mut Vec<(usize, CallRecord)>) {
        let barrier = Barrier::new(count);
        std::thread::scope(|s| {
            let handles: Vec<_> = (first..first + count)
                .map(|index| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        (index, self.call())
                    })
                })
                .collect();
            self.collect(handles, out);
        });
    }

    fn staggered(&self, count: usize, gap: Duration, out: &mut Vec<(usize, CallRecord)>) {
        std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(count);
            for index in 0..count {
                if index > 0 && !gap.is_zero() {
                    std::thread::sleep(gap);
                }
                handles.push(s.spawn(move || (index, self.call())));
            }
            self.collect(handles, out);
        });
    }

    fn collect(
        &self,
        handles: Vec<std::thread::ScopedJoinHandle<'_, (usize, CallRecord)>>,
        out: &mut Vec<(usize, CallRecord)>,
    ) {
        for handle in handles {
            match handle.join() {
                Ok(entry) => out.push(entry),
                Err(_) => self.timeline.error(
                    Some(InjectionType::ConcurrentRequests),
                    json!({ "reason": "request thread panicked" }),
                ),
            }
        }
    }
}

impl RequestDriver for ConcurrentRequestsInjector {
    fn drive(
        &self,
        invoke: &(dyn Fn(&Value) -> CallRecord + Sync),
        input: &Value,
        timeline: &Timeline,
    ) -> DriveReport {
        let requests = Requests {
            invoke,
            input,
            timeline,
            current: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        };
        let count = self.config.count;
        let mut issued = Vec::with_capacity(count);
        match self.config.pattern {
            ConcurrencyPattern::AllAtOnce => requests.wave(0, count, &mut issued),
            ConcurrencyPattern::Staggered => requests.staggered(
                count,
                Duration::from_millis(self.config.stagger_ms),
                &mut issued,
            ),
            ConcurrencyPattern::Burst => {
                let size = self.config.burst_size.max(1);
                let mut first = 0;
                while first < count {
                    if first > 0 && self.config.burst_pause_ms > 0 {
                        std::thread::sleep(Duration::from_millis(self.config.burst_pause_ms));
                    }
                    let wave = size.min(count - first);
                    requests.wave(first, wave, &mut issued);
                    first += wave;
                }
            }
        }
        issued.sort_by_key(|(index, _)| *index);
        let calls: Vec<CallRecord> = issued.into_iter().map(|(_, call)| call).collect();
        let race = detect_race(&calls, self.config.unique_field.as_deref());

        let mut stats = lock(&self.stats);
        stats.calls_issued += calls.len();
        stats.successes += calls.iter().filter(|c| c.succeeded()).count();
        stats.failures += calls.iter().filter(|c| !c.succeeded()).count();
        stats.max_in_flight = stats
            .max_in_flight
            .max(requests.max_in_flight.load(Ordering::SeqCst));
        if let Some(report) = &race {
            log::warn!(
                "race detected across {} concurrent calls: {:?}",
                report.total_calls,
                report.kinds
            );
            stats.race_detected = true;
            for kind in &report.kinds {
                if !stats.race_kinds.contains(kind) {
                    stats.race_kinds.push(*kind);
                }
            }
        }
        DriveReport { calls, race }
    }
}

impl Injector for ConcurrentRequestsInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::ConcurrentRequests
    }

    fn activate(&mut self, timeline: &Timeline) {
        *lock(&self.stats) = Self::fresh_stats(&self.config);
        self.lifecycle.begin(
            InjectionType::ConcurrentRequests,
            timeline,
            json!({
                "count": self.config.count,
                "pattern": self.config.pattern,
                "uniqueField": self.config.unique_field,
            }),
        );
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(InjectionType::ConcurrentRequests, timeline) {
            let stats = lock(&self.stats).clone();
            timeline.injection_end(InjectionType::ConcurrentRequests, json!(stats));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        let stats = lock(&self.stats).clone();
        self.lifecycle
            .snapshot(InjectionType::ConcurrentRequests, InjectorStats::Concurrency(stats))
    }

    fn driver(&self) -> Option<&dyn RequestDriver> {
        if self.is_active() {
            Some(self)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorOutcome;
    use std::sync::atomic::AtomicU64;

    fn record(sequence: u64, input: &Value, outcome: BehaviorOutcome) -> CallRecord {
        CallRecord {
            sequence,
            attempt: 1,
            input: input.clone(),
            outcome: Some(outcome),
            thrown: None,
            intercepted_by: None,
            fatal: None,
            duration_ms: 0.0,
        }
    }

    fn drive_counter(pattern: ConcurrencyPattern) -> (DriveReport, ConcurrencyStats) {
        let timeline = Timeline::new();
        let mut injector = ConcurrentRequestsInjector::new(ConcurrentConfig {
            count: 5,
            pattern,
            stagger_ms: 1,
            burst_size: 2,
            burst_pause_ms: 1,
            unique_field: None,
        });
        injector.activate(&timeline);

        let counter = AtomicU64::new(0);
        let sequence = AtomicU64::new(0);
        let invoke = |input: &Value| {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let seq = sequence.fetch_add(1, Ordering::SeqCst);
            record(seq, input, BehaviorOutcome::ok(json!({ "count": count })))
        };
        let driver = injector.driver().expect("driver while active");
        let report = driver.drive(&invoke, &json!({"op": "increment"}), &timeline);
        let InjectorStats::Concurrency(stats) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        injector.deactivate(&timeline);
        (report, stats)
    }

    #[test]
    fn counter_increments_surface_a_race() {
        let (report, stats) = drive_counter(ConcurrencyPattern::AllAtOnce);
        assert_eq!(report.calls.len(), 5);
        let race = report.race.expect("race detected");
        assert_eq!(race.kinds, vec![RaceKind::DivergentResults]);
        assert_eq!(race.distinct_results, 5);
        assert!(stats.race_detected);
        assert_eq!(stats.calls_issued, 5);
        assert!(stats.max_in_flight >= 1);
    }

    #[test]
    fn every_pattern_issues_the_requested_count() {
        for pattern in [ConcurrencyPattern::Staggered, ConcurrencyPattern::Burst] {
            let (report, stats) = drive_counter(pattern);
            assert_eq!(report.calls.len(), 5, "{pattern:?}");
            assert_eq!(stats.successes, 5);
        }
    }

    #[test]
    fn identical_results_are_not_a_race() {
        let input = json!({"id": 1});
        let calls: Vec<_> = (0..4)
            .map(|i| record(i, &input, BehaviorOutcome::ok(json!({"status": "done"}))))
            .collect();
        assert!(detect_race(&calls, None).is_none());
    }

    #[test]
    fn rejected_duplicates_are_not_a_race() {
        let input = json!({"email": "a@b.c"});
        let mut calls = vec![record(0, &input, BehaviorOutcome::ok(json!({"id": 1})))];
        calls.extend(
            (1..4).map(|i| record(i, &input, BehaviorOutcome::failure("DUPLICATE", "exists"))),
        );
        assert!(detect_race(&calls, Some("/id")).is_none());
    }

    #[test]
    fn duplicate_unique_values_are_flagged() {
        let input = json!({});
        let calls = vec![
            record(0, &input, BehaviorOutcome::ok(json!({"id": 7, "status": "ok"}))),
            record(1, &input, BehaviorOutcome::ok(json!({"id": 7, "status": "ok"}))),
            record(2, &input, BehaviorOutcome::ok(json!({"id": 8, "status": "ok"}))),
        ];
        let race = detect_race(&calls, Some("/id")).expect("race");
        assert_eq!(race.kinds, vec![RaceKind::UniquenessViolation]);
        assert_eq!(race.duplicate_values, vec![json!(7)]);
        assert_eq!(race.distinct_results, 1);
    }

    #[test]
    fn inactive_injector_offers_no_driver() {
        let injector = ConcurrentRequestsInjector::new(ConcurrentConfig::default());
        assert!(injector.driver().is_none());
    }
}
