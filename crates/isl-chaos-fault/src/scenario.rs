//! Chaos scenarios: what to inject, how to drive the behavior, and what to
//! assert afterwards.
//!
//! A [`ChaosScenario`] is immutable once built.  Before execution it is
//! compiled into an [`ExecutionPlan`]: a flat list of activate / invoke /
//! wait / deactivate operations that the executor interprets in order.

use crate::faults::{Injection, InjectionType, RateLimitAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Why a scenario declaration was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScenarioError {
    #[error("scenario has no name")]
    MissingName,

    #[error("scenario does not name a behavior")]
    MissingBehavior,

    #[error("injection {index} has no type")]
    MissingInjectionType { index: usize },

    #[error("unknown injection type {0:?}")]
    UnknownInjectionType(String),

    #[error("invalid parameters for {injection_type}: {reason}")]
    InvalidParameters {
        injection_type: String,
        reason: String,
    },

    #[error("invalid step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("invalid assertion {index}: {reason}")]
    InvalidAssertion { index: usize, reason: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error("steps never invoke the behavior")]
    NoInvoke,

    #[error("malformed scenario declaration: {0}")]
    MalformedDeclaration(String),
}

// ── Steps ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Activate the injection at `index`.
    Inject { index: usize },
    /// Call the behavior, with the scenario input unless overridden.
    Invoke {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    Wait { ms: u64 },
    /// Deactivate the injection at `index`.
    Recover { index: usize },
}

/// One operation of a compiled scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Activate(usize),
    Invoke(Value),
    Wait(u64),
    Deactivate(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn invocations(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Invoke(_)))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,
    #[serde(default, alias = "backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

// ── Assertions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Exists,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Exists => "exists",
        })
    }
}

/// A predicate evaluated after the scenario ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    Success,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// JSON pointer into `{ "result", "calls", "injectors" }`.
    Compare {
        path: String,
        op: CompareOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    MaxDuration { ms: f64 },
    NoRace,
    RaceDetected,
    Idempotent,
    RateLimited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<RateLimitAction>,
    },
    Recovered,
    InjectorError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        injection_type: Option<InjectionType>,
    },
    Custom { name: String },
}

impl Assertion {
    /// Wire name of the assertion kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Assertion::Success => "success",
            Assertion::Error { .. } => "error",
            Assertion::Compare { .. } => "compare",
            Assertion::MaxDuration { .. } => "max_duration",
            Assertion::NoRace => "no_race",
            Assertion::RaceDetected => "race_detected",
            Assertion::Idempotent => "idempotent",
            Assertion::RateLimited { .. } => "rate_limited",
            Assertion::Recovered => "recovered",
            Assertion::InjectorError { .. } => "injector_error",
            Assertion::Custom { .. } => "custom",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Assertion::Compare { path, op, value } => {
                if !path.is_empty() && !path.starts_with('/') {
                    return Err(format!("path must be a JSON pointer, got {path:?}"));
                }
                if *op != CompareOp::Exists && value.is_none() {
                    return Err(format!("operator {op} needs a value"));
                }
                Ok(())
            }
            Assertion::MaxDuration { ms } if !ms.is_finite() || *ms < 0.0 => {
                Err(format!("max duration must be non-negative, got {ms}"))
            }
            Assertion::Custom { name } if name.trim().is_empty() => {
                Err("custom assertion needs a name".into())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::Success => write!(f, "behavior succeeds"),
            Assertion::Error { code: Some(code) } => write!(f, "behavior fails with {code}"),
            Assertion::Error { code: None } => write!(f, "behavior fails"),
            Assertion::Compare {
                path,
                op: CompareOp::Exists,
                ..
            } => write!(f, "{path} exists"),
            Assertion::Compare { path, op, value } => {
                let value = value.as_ref().map_or_else(String::new, Value::to_string);
                write!(f, "{path} {op} {value}")
            }
            Assertion::MaxDuration { ms } => write!(f, "completes within {ms}ms"),
            Assertion::NoRace => write!(f, "no race detected"),
            Assertion::RaceDetected => write!(f, "race detected"),
            Assertion::Idempotent => write!(f, "replays are idempotent"),
            Assertion::RateLimited { action: Some(a) } => write!(f, "rate limited ({a:?})"),
            Assertion::RateLimited { action: None } => write!(f, "rate limited"),
            Assertion::Recovered => write!(f, "recovers after injected failures"),
            Assertion::InjectorError {
                injection_type: Some(t),
            } => write!(f, "{t} reports an error"),
            Assertion::InjectorError { injection_type: None } => {
                write!(f, "an injector reports an error")
            }
            Assertion::Custom { name } => write!(f, "custom:{name}"),
        }
    }
}

// ── Scenario ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosScenario {
    pub name: String,
    pub behavior_name: String,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Input passed to the behavior unless a step overrides it.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ChaosScenario {
    /// Distinct injection types used by this scenario.
    pub fn injection_types(&self) -> BTreeSet<InjectionType> {
        self.injections.iter().map(Injection::injection_type).collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }

    /// Structural checks shared by the builder and the domain parser.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return Err(ScenarioError::MissingName);
        }
        if self.behavior_name.trim().is_empty() {
            return Err(ScenarioError::MissingBehavior);
        }
        for injection in &self.injections {
            injection
                .validate()
                .map_err(|reason| ScenarioError::InvalidParameters {
                    injection_type: injection.injection_type().to_string(),
                    reason,
                })?;
        }
        for (index, assertion) in self.assertions.iter().enumerate() {
            assertion
                .validate()
                .map_err(|reason| ScenarioError::InvalidAssertion { index, reason })?;
        }
        if self.retry.is_some_and(|r| r.max_attempts == 0) {
            return Err(ScenarioError::InvalidRetry(
                "max_attempts must be at least 1".into(),
            ));
        }
        self.plan().map(|_| ())
    }

    /// Compile the scenario into an execution plan.
    ///
    /// Without steps: activate every injection in declared order, then
    /// invoke once.  With steps: injections no `inject` step mentions are
    /// activated up front, then the steps run in order.  Deactivation of
    /// whatever is still active is left to the executor.
    pub fn plan(&self) -> Result<ExecutionPlan, ScenarioError> {
        let count = self.injections.len();
        if self.steps.is_empty() {
            let mut steps: Vec<PlanStep> = (0..count).map(PlanStep::Activate).collect();
            steps.push(PlanStep::Invoke(self.input.clone()));
            return Ok(ExecutionPlan { steps });
        }

        let referenced: BTreeSet<usize> = self
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Inject { index } => Some(*index),
                _ => None,
            })
            .collect();
        let mut active = vec![false; count];
        let mut injected = vec![false; count];
        let mut steps = Vec::with_capacity(self.steps.len() + count);
        for index in (0..count).filter(|i| !referenced.contains(i)) {
            active[index] = true;
            steps.push(PlanStep::Activate(index));
        }

        let bad = |index: usize, reason: String| ScenarioError::InvalidStep { index, reason };
        for (position, step) in self.steps.iter().enumerate() {
            match step {
                Step::Inject { index } => {
                    let i = *index;
                    if i >= count {
                        return Err(bad(position, format!("no injection at index {i}")));
                    }
                    if injected[i] {
                        return Err(bad(position, format!("injection {i} injected twice")));
                    }
                    injected[i] = true;
                    active[i] = true;
                    steps.push(PlanStep::Activate(i));
                }
                Step::Recover { index } => {
                    let i = *index;
                    if i >= count {
                        return Err(bad(position, format!("no injection at index {i}")));
                    }
                    if !active[i] {
                        return Err(bad(position, format!("injection {i} is not active")));
                    }
                    active[i] = false;
                    steps.push(PlanStep::Deactivate(i));
                }
                Step::Invoke { input } => {
                    let input = input.clone().unwrap_or_else(|| self.input.clone());
                    steps.push(PlanStep::Invoke(input));
                }
                Step::Wait { ms } => steps.push(PlanStep::Wait(*ms)),
            }
        }

        let plan = ExecutionPlan { steps };
        if plan.invocations() == 0 {
            return Err(ScenarioError::NoInvoke);
        }
        Ok(plan)
    }
}

impl fmt::Display for ChaosScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.name, self.behavior_name)?;
        for injection in &self.injections {
            write!(f, " [{injection}]")?;
        }
        Ok(())
    }
}

// ── Parsing ─────────────────────────────────────────────────────

/// Parse an injection declaration.
///
/// Parameters may sit next to `type` or inside a `params` object.
pub fn parse_injection(index: usize, decl: &Value) -> Result<Injection, ScenarioError> {
    let Some(object) = decl.as_object() else {
        return Err(ScenarioError::MissingInjectionType { index });
    };
    let Some(type_name) = object.get("type").and_then(Value::as_str) else {
        return Err(ScenarioError::MissingInjectionType { index });
    };
    if InjectionType::parse(type_name).is_none() {
        return Err(ScenarioError::UnknownInjectionType(type_name.to_string()));
    }

    let mut flat = Map::new();
    for (key, value) in object {
        if key != "params" {
            flat.insert(key.clone(), value.clone());
        }
    }
    if let Some(Value::Object(params)) = object.get("params") {
        for (key, value) in params {
            flat.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    let invalid = |reason: String| ScenarioError::InvalidParameters {
        injection_type: type_name.to_string(),
        reason,
    };
    let injection: Injection =
        serde_json::from_value(Value::Object(flat)).map_err(|e| invalid(e.to_string()))?;
    injection.validate().map_err(invalid)?;
    Ok(injection)
}

pub fn parse_assertion(index: usize, decl: &Value) -> Result<Assertion, ScenarioError> {
    let assertion: Assertion = serde_json::from_value(decl.clone()).map_err(|e| {
        ScenarioError::InvalidAssertion {
            index,
            reason: e.to_string(),
        }
    })?;
    assertion
        .validate()
        .map_err(|reason| ScenarioError::InvalidAssertion { index, reason })?;
    Ok(assertion)
}

pub fn parse_step(index: usize, decl: &Value) -> Result<Step, ScenarioError> {
    serde_json::from_value(decl.clone()).map_err(|e| ScenarioError::InvalidStep {
        index,
        reason: e.to_string(),
    })
}

// ── Builder ─────────────────────────────────────────────────────

/// Builder for constructing scenarios in code.
///
/// # Example
///
/// ```
/// use isl_chaos_fault::faults::{FailureConfig, Injection};
/// use isl_chaos_fault::scenario::{Assertion, ScenarioBuilder};
///
/// let scenario = ScenarioBuilder::new("db-outage", "CreateUser")
///     .inject(Injection::DatabaseFailure(FailureConfig {
///         fail_attempts: Some(2),
///         ..Default::default()
///     }))
///     .retry(3, 0)
///     .assert(Assertion::Recovered)
///     .tag("dependency")
///     .build()
///     .unwrap();
///
/// assert_eq!(scenario.injections.len(), 1);
/// assert_eq!(scenario.plan().unwrap().invocations(), 1);
/// ```
pub struct ScenarioBuilder {
    scenario: ChaosScenario,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<String>, behavior_name: impl Into<String>) -> Self {
        Self {
            scenario: ChaosScenario {
                name: name.into(),
                behavior_name: behavior_name.into(),
                injections: Vec::new(),
                assertions: Vec::new(),
                steps: Vec::new(),
                tags: Vec::new(),
                input: Value::Object(Map::new()),
                retry: None,
                description: None,
            },
        }
    }

    pub fn inject(mut self, injection: Injection) -> Self {
        self.scenario.injections.push(injection);
        self
    }

    pub fn assert(mut self, assertion: Assertion) -> Self {
        self.scenario.assertions.push(assertion);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.scenario.steps.push(step);
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.scenario.input = input;
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.scenario.retry = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.scenario.tags.push(tag.into());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.scenario.description = Some(text.into());
        self
    }

    /// Validate and return the scenario.
    pub fn build(self) -> Result<ChaosScenario, ScenarioError> {
        self.scenario.validate()?;
        Ok(self.scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::{CpuConfig, LatencyConfig};
    use serde_json::json;

    fn two_injections() -> ScenarioBuilder {
        ScenarioBuilder::new("s", "Pay")
            .inject(Injection::NetworkLatency(LatencyConfig::default()))
            .inject(Injection::CpuPressure(CpuConfig::default()))
    }

    #[test]
    fn default_plan_activates_then_invokes() {
        let scenario = two_injections().input(json!({"amount": 5})).build().unwrap();
        let plan = scenario.plan().unwrap();
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Activate(0),
                PlanStep::Activate(1),
                PlanStep::Invoke(json!({"amount": 5})),
            ]
        );
    }

    #[test]
    fn unreferenced_injections_activate_first() {
        let scenario = two_injections()
            .step(Step::Invoke { input: None })
            .step(Step::Inject { index: 1 })
            .step(Step::Wait { ms: 5 })
            .step(Step::Invoke {
                input: Some(json!({"retry": true})),
            })
            .step(Step::Recover { index: 1 })
            .build()
            .unwrap();
        let plan = scenario.plan().unwrap();
        assert_eq!(plan.steps[0], PlanStep::Activate(0));
        assert_eq!(plan.steps[2], PlanStep::Activate(1));
        assert_eq!(plan.steps[4], PlanStep::Invoke(json!({"retry": true})));
        assert_eq!(plan.steps[5], PlanStep::Deactivate(1));
        assert_eq!(plan.invocations(), 2);
    }

    #[test]
    fn plan_rejects_bad_steps() {
        let twice = two_injections()
            .step(Step::Inject { index: 0 })
            .step(Step::Inject { index: 0 })
            .step(Step::Invoke { input: None })
            .build();
        assert!(matches!(twice, Err(ScenarioError::InvalidStep { index: 1, .. })));

        let missing = two_injections()
            .step(Step::Inject { index: 7 })
            .step(Step::Invoke { input: None })
            .build();
        assert!(matches!(missing, Err(ScenarioError::InvalidStep { index: 0, .. })));

        let no_invoke = two_injections().step(Step::Wait { ms: 1 }).build();
        assert_eq!(no_invoke, Err(ScenarioError::NoInvoke));

        let recover_inactive = two_injections()
            .step(Step::Invoke { input: None })
            .step(Step::Recover { index: 0 })
            .step(Step::Recover { index: 0 })
            .build();
        assert!(matches!(
            recover_inactive,
            Err(ScenarioError::InvalidStep { index: 2, .. })
        ));
    }

    #[test]
    fn parse_injection_accepts_nested_params() {
        let flat = parse_injection(0, &json!({"type": "memory_pressure", "target_mb": 8})).unwrap();
        let nested = parse_injection(
            0,
            &json!({"type": "memory_pressure", "params": {"target_mb": 8}}),
        )
        .unwrap();
        assert_eq!(flat, nested);
    }

    #[test]
    fn parse_injection_errors() {
        assert_eq!(
            parse_injection(0, &json!({"type": "disk_full"})),
            Err(ScenarioError::UnknownInjectionType("disk_full".into()))
        );
        assert_eq!(
            parse_injection(3, &json!({"latency_ms": 5})),
            Err(ScenarioError::MissingInjectionType { index: 3 })
        );
        assert!(matches!(
            parse_injection(0, &json!({"type": "cpu_pressure", "percentage": 150})),
            Err(ScenarioError::InvalidParameters { .. })
        ));
        assert!(matches!(
            parse_injection(0, &json!({"type": "network_latency", "latency_ms": "slow"})),
            Err(ScenarioError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn parse_assertions() {
        assert_eq!(
            parse_assertion(0, &json!({"kind": "success"})).unwrap(),
            Assertion::Success
        );
        assert_eq!(
            parse_assertion(0, &json!({"kind": "rate_limited", "action": "throttle"})).unwrap(),
            Assertion::RateLimited {
                action: Some(RateLimitAction::Throttle)
            }
        );
        assert!(parse_assertion(
            1,
            &json!({"kind": "compare", "path": "result", "op": "eq", "value": 1})
        )
        .is_err());
        assert!(
            parse_assertion(1, &json!({"kind": "compare", "path": "/result", "op": "gt"})).is_err()
        );
        assert!(parse_assertion(2, &json!({"kind": "telepathy"})).is_err());
    }

    #[test]
    fn zero_retry_attempts_rejected() {
        let err = two_injections().retry(0, 0).build();
        assert!(matches!(err, Err(ScenarioError::InvalidRetry(_))));
    }

    #[test]
    fn retry_policy_accepts_both_spellings() {
        let snake: RetryPolicy =
            serde_json::from_value(json!({"max_attempts": 4, "backoff_ms": 10})).unwrap();
        let camel: RetryPolicy =
            serde_json::from_value(json!({"maxAttempts": 4, "backoffMs": 10})).unwrap();
        assert_eq!(snake, camel);
        assert_eq!(snake.max_attempts, 4);
        assert_eq!(serde_json::to_value(snake).unwrap()["maxAttempts"], 4);
    }

    #[test]
    fn scenario_serializes_in_camel_case() {
        let scenario = two_injections().assert(Assertion::NoRace).build().unwrap();
        let value = serde_json::to_value(&scenario).unwrap();
        assert_eq!(value["behaviorName"], "Pay");
        assert_eq!(value["injections"][0]["type"], "network_latency");
        assert_eq!(value["assertions"][0]["kind"], "no_race");
        let back: ChaosScenario = serde_json::from_value(value).unwrap();
        assert_eq!(back, scenario);
    }

    #[test]
    fn assertion_display() {
        let a = Assertion::Compare {
            path: "/result/data/count".into(),
            op: CompareOp::Ge,
            value: Some(json!(3)),
        };
        assert_eq!(a.to_string(), "/result/data/count >= 3");
        assert_eq!(
            Assertion::Error { code: Some("E1".into()) }.to_string(),
            "behavior fails with E1"
        );
    }
}
