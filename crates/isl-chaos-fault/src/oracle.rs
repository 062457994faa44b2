//! Assertion oracle: evaluates scenario assertions against what a run
//! produced.
//!
//! # Assertion semantics
//!
//! | Kind             | Pass condition                                          |
//! |------------------|---------------------------------------------------------|
//! | `success`        | Final call succeeded                                    |
//! | `error`          | Final call failed (with the given code, if any)         |
//! | `compare`        | Pointer into `{result, calls, injectors}` satisfies op  |
//! | `max_duration`   | Scenario finished within the bound                      |
//! | `no_race`        | No race detected by the concurrent driver               |
//! | `race_detected`  | The concurrent driver detected a race                   |
//! | `idempotent`     | No replay of the same request changed its result        |
//! | `rate_limited`   | A limiter applied (the given) action at least once      |
//! | `recovered`      | A failure injector recovered and the final call passed  |
//! | `injector_error` | An `error` event was recorded on the timeline           |
//! | `custom`         | The registered predicate returned `true`                |
//!
//! Evaluation never aborts the scenario: a predicate that errors or panics
//! yields a failed [`AssertionResult`].

use crate::behavior::{panic_message, BehaviorOutcome, CallRecord};
use crate::canonical::canonical_json;
use crate::faults::{InjectionType, RateLimitAction};
use crate::injectors::{InjectorState, InjectorStats, RaceReport};
use crate::scenario::{Assertion, CompareOp};
use crate::timeline::{TimelineEvent, TimelineEventType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Everything an assertion may inspect after a run.
#[derive(Debug, Clone, Default)]
pub struct AssertionSubject {
    /// Every call issued, in order.
    pub calls: Vec<CallRecord>,
    /// Final snapshot of each injector, in declaration order.
    pub injectors: Vec<InjectorState>,
    pub timeline: Vec<TimelineEvent>,
    pub race: Option<RaceReport>,
    pub duration_ms: f64,
}

impl AssertionSubject {
    pub fn final_call(&self) -> Option<&CallRecord> {
        self.calls.last()
    }

    /// Outcome of the final call, or a failure when nothing was called.
    pub fn final_outcome(&self) -> BehaviorOutcome {
        self.final_call().map_or_else(
            || BehaviorOutcome::failure("NOT_INVOKED", "behavior was never invoked"),
            CallRecord::effective_outcome,
        )
    }

    /// JSON document addressed by `compare` pointers.
    pub fn document(&self) -> Value {
        json!({
            "result": self.final_outcome(),
            "calls": self.calls,
            "injectors": self.injectors,
        })
    }

    fn stats(&self) -> impl Iterator<Item = &InjectorStats> {
        self.injectors.iter().map(|s| &s.stats)
    }
}

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub description: String,
    pub kind: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

/// User-supplied predicate for `custom` assertions.
pub type CustomPredicate = Arc<dyn Fn(&AssertionSubject) -> Result<bool, String> + Send + Sync>;

struct Check {
    passed: bool,
    message: Option<String>,
    expected: Option<Value>,
    actual: Option<Value>,
}

impl Check {
    fn new(passed: bool, expected: Value, actual: Value) -> Self {
        Self {
            passed,
            message: None,
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            expected: None,
            actual: None,
        }
    }

    fn note(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_expected(mut self, expected: &Value) -> Self {
        self.expected = Some(expected.clone());
        self
    }
}

/// Evaluates assertions, holding the registry of custom predicates.
#[derive(Clone, Default)]
pub struct AssertionOracle {
    predicates: BTreeMap<String, CustomPredicate>,
}

impl AssertionOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate for `custom { name }` assertions.
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&AssertionSubject) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn evaluate_all(
        &self,
        assertions: &[Assertion],
        subject: &AssertionSubject,
    ) -> Vec<AssertionResult> {
        assertions.iter().map(|a| self.evaluate(a, subject)).collect()
    }

    pub fn evaluate(&self, assertion: &Assertion, subject: &AssertionSubject) -> AssertionResult {
        let check = match catch_unwind(AssertUnwindSafe(|| self.check(assertion, subject))) {
            Ok(check) => check,
            Err(payload) => Check::fail(format!(
                "assertion evaluation panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        if !check.passed {
            log::debug!("assertion failed: {assertion}");
        }
        AssertionResult {
            description: assertion.to_string(),
            kind: assertion.kind().to_string(),
            passed: check.passed,
            message: check.message,
            expected: check.expected,
            actual: check.actual,
        }
    }

    fn check(&self, assertion: &Assertion, subject: &AssertionSubject) -> Check {
        match assertion {
            Assertion::Success => {
                let outcome = subject.final_outcome();
                Check::new(outcome.success, json!(true), json!(outcome.success))
            }
            Assertion::Error { code } => {
                let outcome = subject.final_outcome();
                let actual = outcome.error_code().map(str::to_string);
                let passed = !outcome.success
                    && code.as_ref().map_or(true, |want| actual.as_deref() == Some(want));
                Check::new(passed, json!(code), json!(actual))
            }
            Assertion::Compare { path, op, value } => {
                compare(&subject.document(), path, *op, value.as_ref())
            }
            Assertion::MaxDuration { ms } => Check::new(
                subject.duration_ms <= *ms,
                json!(ms),
                json!(subject.duration_ms),
            ),
            Assertion::NoRace => {
                let kinds = subject.race.as_ref().map(|r| r.kinds.clone()).unwrap_or_default();
                Check::new(kinds.is_empty(), json!([]), json!(kinds))
            }
            Assertion::RaceDetected => {
                let raced = subject.race.is_some();
                let check = Check::new(raced, json!(true), json!(raced));
                if self.saw(subject, InjectionType::ConcurrentRequests) {
                    check
                } else {
                    check.note("no concurrent_requests injection was active")
                }
            }
            Assertion::Idempotent => idempotent(subject),
            Assertion::RateLimited { action } => {
                let mut limited = 0u64;
                for stats in subject.stats() {
                    if let InjectorStats::RateLimit(s) = stats {
                        limited += match action {
                            None => s.limited,
                            Some(RateLimitAction::Reject) => s.rejected,
                            Some(RateLimitAction::Throttle) => s.throttled,
                            Some(RateLimitAction::Redirect) => s.redirected,
                            Some(RateLimitAction::DeadLetter) => s.dead_lettered,
                        };
                    }
                }
                Check::new(limited > 0, json!({ "atLeast": 1 }), json!(limited))
            }
            Assertion::Recovered => {
                let recovered = subject
                    .stats()
                    .any(|s| matches!(s, InjectorStats::Failure(f) if f.recovered));
                let success = subject.final_outcome().success;
                Check::new(
                    recovered && success,
                    json!({ "recovered": true, "success": true }),
                    json!({ "recovered": recovered, "success": success }),
                )
            }
            Assertion::InjectorError { injection_type } => {
                let errors = subject
                    .timeline
                    .iter()
                    .filter(|e| e.event_type == TimelineEventType::Error)
                    .filter(|e| injection_type.is_none() || e.injection_type == *injection_type)
                    .count();
                Check::new(errors > 0, json!({ "atLeast": 1 }), json!(errors))
            }
            Assertion::Custom { name } => self.custom(name, subject),
        }
    }

    fn saw(&self, subject: &AssertionSubject, injection_type: InjectionType) -> bool {
        subject.injectors.iter().any(|s| s.injection_type == injection_type)
    }

    fn custom(&self, name: &str, subject: &AssertionSubject) -> Check {
        let Some(predicate) = self.predicates.get(name) else {
            return Check::fail(format!("no predicate registered as {name:?}"));
        };
        match catch_unwind(AssertUnwindSafe(|| predicate(subject))) {
            Ok(Ok(passed)) => Check::new(passed, json!(true), json!(passed)),
            Ok(Err(reason)) => Check::fail(format!("predicate {name:?} failed: {reason}")),
            Err(payload) => Check::fail(format!(
                "predicate {name:?} panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

impl std::fmt::Debug for AssertionOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionOracle")
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Violations reported by idempotency injectors, or, without one, calls
/// with identical input that produced different results.
fn idempotent(subject: &AssertionSubject) -> Check {
    let tracked: Vec<u64> = subject
        .stats()
        .filter_map(|s| match s {
            InjectorStats::Idempotency(i) => Some(i.violations),
            _ => None,
        })
        .collect();
    if !tracked.is_empty() {
        let violations: u64 = tracked.iter().sum();
        return Check::new(violations == 0, json!(0), json!(violations));
    }

    let mut by_input: BTreeMap<String, Value> = BTreeMap::new();
    let mut violations = 0u64;
    for call in subject.calls.iter().filter(|c| c.reached_behavior()) {
        let fingerprint = call.result_fingerprint();
        match by_input.get(&canonical_json(&call.input)) {
            Some(first) if *first != fingerprint => violations += 1,
            Some(_) => {}
            None => {
                by_input.insert(canonical_json(&call.input), fingerprint);
            }
        }
    }
    Check::new(violations == 0, json!(0), json!(violations))
        .note("no idempotency_check injection; compared calls with identical input")
}

fn compare(document: &Value, path: &str, op: CompareOp, expected: Option<&Value>) -> Check {
    // JSON null counts as absent.
    let actual = crate::injectors::pointer(document, path).filter(|v| !v.is_null());
    if op == CompareOp::Exists {
        let found = actual.is_some();
        return Check::new(found, json!(true), json!(found));
    }
    let Some(expected) = expected else {
        return Check::fail(format!("operator {op} needs a value"));
    };
    let Some(actual) = actual else {
        return if op == CompareOp::Ne {
            Check::new(true, expected.clone(), Value::Null).note(format!("nothing at {path}"))
        } else {
            Check::fail(format!("nothing at {path}")).with_expected(expected)
        };
    };
    let passed = match op {
        CompareOp::Eq => json_eq(actual, expected),
        CompareOp::Ne => !json_eq(actual, expected),
        ordering => match json_cmp(actual, expected) {
            Some(ord) => match ordering {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            },
            None => {
                return Check::fail(format!("cannot order {actual} against {expected}"))
                    .with_expected(expected)
            }
        },
    };
    Check::new(passed, expected.clone(), actual.clone())
}

/// Equality that treats `1` and `1.0` as equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
