//! Append-only event log of one scenario execution.
//!
//! A [`Timeline`] is created by the executor for each scenario run and
//! handed (by clone) to every injector.  Background loops write to it from
//! their own threads, so the log lives behind a mutex; timestamps are taken
//! while the lock is held, which keeps events strictly ordered by
//! `relative_time_ms`.

use crate::faults::InjectionType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    InjectionStart,
    InjectionEnd,
    Recovery,
    Error,
}

/// One immutable entry in the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    /// Milliseconds since the timeline was created (microsecond precision).
    pub relative_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_type: Option<InjectionType>,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug)]
struct TimelineInner {
    origin: Instant,
    events: Mutex<Vec<TimelineEvent>>,
}

/// Shared handle to a scenario's event log.
#[derive(Debug, Clone)]
pub struct Timeline {
    inner: Arc<TimelineInner>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                origin: Instant::now(),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Milliseconds elapsed since the timeline was created.
    pub fn elapsed_ms(&self) -> f64 {
        round_micros(self.inner.origin.elapsed().as_secs_f64() * 1000.0)
    }

    /// Append an event stamped with the current relative time.
    pub fn record(
        &self,
        event_type: TimelineEventType,
        injection_type: Option<InjectionType>,
        detail: Value,
    ) {
        let mut events = self.lock();
        let mut relative_time_ms = self.elapsed_ms();
        if let Some(last) = events.last() {
            relative_time_ms = relative_time_ms.max(last.relative_time_ms);
        }
        events.push(TimelineEvent {
            event_type,
            relative_time_ms,
            injection_type,
            detail,
        });
    }

    pub fn injection_start(&self, injection_type: InjectionType, detail: Value) {
        self.record(TimelineEventType::InjectionStart, Some(injection_type), detail);
    }

    pub fn injection_end(&self, injection_type: InjectionType, detail: Value) {
        self.record(TimelineEventType::InjectionEnd, Some(injection_type), detail);
    }

    pub fn recovery(&self, injection_type: InjectionType, detail: Value) {
        self.record(TimelineEventType::Recovery, Some(injection_type), detail);
    }

    pub fn error(&self, injection_type: Option<InjectionType>, detail: Value) {
        self.record(TimelineEventType::Error, injection_type, detail);
    }

    /// Copy of all events recorded so far.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Error events, optionally restricted to one injection type.
    pub fn errors(&self, injection_type: Option<InjectionType>) -> Vec<TimelineEvent> {
        self.lock()
            .iter()
            .filter(|e| e.event_type == TimelineEventType::Error)
            .filter(|e| injection_type.is_none() || e.injection_type == injection_type)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TimelineEvent>> {
        // Events are plain data; a panicking writer cannot leave them torn.
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

fn round_micros(ms: f64) -> f64 {
    (ms * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn empty_timeline() {
        let tl = Timeline::new();
        assert!(tl.is_empty());
        assert!(tl.errors(None).is_empty());
    }

    #[test]
    fn events_are_time_ordered() {
        let tl = Timeline::new();
        tl.injection_start(InjectionType::CpuPressure, json!({}));
        tl.error(Some(InjectionType::MemoryPressure), json!({"reason": "oom"}));
        tl.injection_end(InjectionType::CpuPressure, json!({"bursts": 3}));

        let events = tl.events();
        assert_eq!(events.len(), 3);
        assert!(events
            .windows(2)
            .all(|w| w[0].relative_time_ms <= w[1].relative_time_ms));
        assert_eq!(events[2].event_type, TimelineEventType::InjectionEnd);
    }

    #[test]
    fn concurrent_writers_keep_order() {
        let tl = Timeline::new();
        thread::scope(|s| {
            for _ in 0..4 {
                let tl = tl.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        tl.recovery(InjectionType::DatabaseFailure, Value::Null);
                    }
                });
            }
        });

        let events = tl.events();
        assert_eq!(events.len(), 200);
        assert!(events
            .windows(2)
            .all(|w| w[0].relative_time_ms <= w[1].relative_time_ms));
    }

    #[test]
    fn errors_filter_by_type() {
        let tl = Timeline::new();
        tl.error(Some(InjectionType::MemoryPressure), json!("alloc"));
        tl.error(None, json!("executor"));
        assert_eq!(tl.errors(None).len(), 2);
        assert_eq!(tl.errors(Some(InjectionType::MemoryPressure)).len(), 1);
        assert!(tl.errors(Some(InjectionType::CpuPressure)).is_empty());
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let tl = Timeline::new();
        tl.injection_start(InjectionType::ClockSkew, json!({"mode": "fixed"}));
        let value = serde_json::to_value(&tl.events()[0]).unwrap();
        assert_eq!(value["type"], "injection_start");
        assert_eq!(value["injectionType"], "clock_skew");
        assert!(value["relativeTimeMs"].is_number());
    }
}
