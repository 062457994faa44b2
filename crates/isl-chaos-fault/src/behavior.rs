//! Execution contract for the behavior under test.
//!
//! The engine treats the implementation as an opaque, possibly
//! side-effecting call.  A returned [`BehaviorOutcome`] (success or
//! failure) is a normal result to assert against; an `Err(BehaviorError)`
//! models a thrown exception.

use crate::clock::Clock;
use crate::faults::InjectionType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Code reported for a call whose implementation raised an error.
pub const THROWN_CODE: &str = "EXCEPTION";
/// Code reported for a call stopped by an unrecoverable injector condition.
pub const FATAL_CODE: &str = "INJECTOR_FATAL";

/// Error payload of a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub code: String,
    pub message: String,
}

/// Result returned by the behavior under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl BehaviorOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OutcomeError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// An exception raised by the behavior under test.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BehaviorError {
    pub message: String,
}

impl BehaviorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-call context handed to the implementation.
pub struct CallContext<'a> {
    /// 1-based attempt number within the executor's retry loop.
    pub attempt: u32,
    /// Scenario-wide call sequence number.
    pub sequence: u64,
    clock: &'a dyn Clock,
}

impl<'a> CallContext<'a> {
    pub fn new(attempt: u32, sequence: u64, clock: &'a dyn Clock) -> Self {
        Self {
            attempt,
            sequence,
            clock,
        }
    }

    /// Current time as seen by the implementation (skewed when a clock
    /// skew injection is active).
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock
    }
}

/// The behavior implementation being verified.
pub trait BehaviorImpl: Send + Sync {
    fn execute(
        &self,
        behavior: &str,
        input: &Value,
        ctx: &CallContext<'_>,
    ) -> Result<BehaviorOutcome, BehaviorError>;
}

impl<F> BehaviorImpl for F
where
    F: Fn(&str, &Value, &CallContext<'_>) -> Result<BehaviorOutcome, BehaviorError> + Send + Sync,
{
    fn execute(
        &self,
        behavior: &str,
        input: &Value,
        ctx: &CallContext<'_>,
    ) -> Result<BehaviorOutcome, BehaviorError> {
        self(behavior, input, ctx)
    }
}

/// Description of one call as seen by the injectors.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo<'a> {
    pub behavior: &'a str,
    pub input: &'a Value,
    pub attempt: u32,
    pub sequence: u64,
}

/// Record of one executed (or intercepted) call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub sequence: u64,
    pub attempt: u32,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BehaviorOutcome>,
    /// Message of a thrown exception (or caught panic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thrown: Option<String>,
    /// Injection that answered the call instead of the behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercepted_by: Option<InjectionType>,
    /// Unrecoverable injector condition raised on this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    pub duration_ms: f64,
}

impl CallRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.success)
    }

    /// Whether the call reached the behavior implementation.
    pub fn reached_behavior(&self) -> bool {
        self.intercepted_by.is_none() && self.fatal.is_none()
    }

    /// The outcome as assertions see it: a thrown error or fatal injector
    /// condition reads as a failure with a reserved code.
    pub fn effective_outcome(&self) -> BehaviorOutcome {
        match (&self.outcome, &self.thrown, &self.fatal) {
            (Some(outcome), _, _) => outcome.clone(),
            (None, Some(thrown), _) => BehaviorOutcome::failure(THROWN_CODE, thrown.clone()),
            (None, None, Some(fatal)) => BehaviorOutcome::failure(FATAL_CODE, fatal.clone()),
            (None, None, None) => BehaviorOutcome::failure(THROWN_CODE, "call produced no outcome"),
        }
    }

    /// Stable representation of what the call produced, used to compare
    /// results across calls with identical input.
    pub fn result_fingerprint(&self) -> Value {
        match (&self.outcome, &self.thrown) {
            (Some(outcome), _) => serde_json::json!({
                "success": outcome.success,
                "data": outcome.data,
                "code": outcome.error_code(),
            }),
            (None, Some(thrown)) => serde_json::json!({ "thrown": thrown }),
            (None, None) => serde_json::json!({ "fatal": self.fatal }),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
