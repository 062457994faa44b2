//! Coverage of a chaos run.
//!
//! Three ratios, each reported as a rounded 0–100 integer:
//!
//! - injection types observed / all known injection types
//! - scenarios executed / scenarios defined
//! - behaviors targeted / behaviors in the domain
//!
//! The overall figure weights them 0.3 / 0.5 / 0.2.  A ratio with a zero
//! denominator counts as 0.

use crate::executor::ScenarioResult;
use isl_chaos_fault::InjectionType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const INJECTION_WEIGHT: f64 = 0.3;
const SCENARIO_WEIGHT: f64 = 0.5;
const BEHAVIOR_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub injection_type_coverage: u32,
    pub scenario_coverage: u32,
    pub behavior_coverage: u32,
    pub overall_coverage: u32,
}

/// Raw counts behind a [`Coverage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageStats {
    pub injection_types_observed: BTreeSet<InjectionType>,
    pub scenarios_executed: usize,
    pub behaviors_targeted: BTreeSet<String>,
}

/// Accumulates what executed scenarios exercised.
#[derive(Debug, Clone, Default)]
pub struct CoverageCollector {
    stats: CoverageStats,
}

impl CoverageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed scenario.  Only injections the plan actually
    /// activated count as observed.
    pub fn record(&mut self, result: &ScenarioResult) {
        self.stats.scenarios_executed += 1;
        self.stats
            .behaviors_targeted
            .insert(result.behavior_name.clone());
        self.stats.injection_types_observed.extend(
            result
                .injections
                .iter()
                .filter(|i| i.activated)
                .map(|i| i.injection_type),
        );
    }

    pub fn stats(&self) -> &CoverageStats {
        &self.stats
    }

    pub fn finish(&self, scenarios_defined: usize, behaviors_in_domain: usize) -> Coverage {
        let injection = ratio(
            self.stats.injection_types_observed.len(),
            InjectionType::ALL.len(),
        );
        let scenario = ratio(self.stats.scenarios_executed, scenarios_defined);
        let behavior = ratio(self.stats.behaviors_targeted.len(), behaviors_in_domain);
        let overall =
            INJECTION_WEIGHT * injection + SCENARIO_WEIGHT * scenario + BEHAVIOR_WEIGHT * behavior;
        Coverage {
            injection_type_coverage: percent(injection),
            scenario_coverage: percent(scenario),
            behavior_coverage: percent(behavior),
            overall_coverage: percent(overall),
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        (numerator as f64 / denominator as f64).min(1.0)
    }
}

fn percent(fraction: f64) -> u32 {
    (fraction * 100.0).round() as u32
}
