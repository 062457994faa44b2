//! Clock skew: swaps the clock seen by the behavior for a skewed one.

use super::{Injector, InjectorState, InjectorStats, Lifecycle};
use crate::clock::{Clock, SkewedClock};
use crate::faults::{ClockSkewConfig, ClockSkewMode, InjectionType};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockStats {
    pub mode: ClockSkewMode,
    /// Clock reads made by the behavior while skewed.
    pub reads: u64,
    pub last_offset_ms: i64,
    pub max_abs_offset_ms: i64,
}

pub struct ClockSkewInjector {
    clock: Arc<SkewedClock>,
    lifecycle: Lifecycle,
}

impl ClockSkewInjector {
    pub fn new(config: ClockSkewConfig) -> Self {
        Self {
            clock: Arc::new(SkewedClock::new(config)),
            lifecycle: Lifecycle::default(),
        }
    }

    fn stats(&self) -> ClockStats {
        ClockStats {
            mode: self.clock.config().mode,
            reads: self.clock.reads(),
            last_offset_ms: self.clock.last_offset_ms(),
            max_abs_offset_ms: self.clock.max_abs_offset_ms(),
        }
    }
}

impl Injector for ClockSkewInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::ClockSkew
    }

    fn activate(&mut self, timeline: &Timeline) {
        self.clock.engage();
        let cfg = self.clock.config();
        let detail = json!({
            "mode": cfg.mode,
            "offsetMs": cfg.offset_ms,
            "driftMsPerSec": cfg.drift_ms_per_sec,
            "amplitudeMs": cfg.amplitude_ms,
            "periodMs": cfg.period_ms,
        });
        self.lifecycle.begin(InjectionType::ClockSkew, timeline, detail);
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(InjectionType::ClockSkew, timeline) {
            self.clock.disengage();
            timeline.injection_end(InjectionType::ClockSkew, json!(self.stats()));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        self.lifecycle
            .snapshot(InjectionType::ClockSkew, InjectorStats::Clock(self.stats()))
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        if self.is_active() {
            Some(self.clock.clone() as Arc<dyn Clock>)
        } else {
            None
        }
    }
}
