//! Chaos report generation and rendering.

use crate::coverage::{Coverage, CoverageCollector};
use crate::executor::{InjectionResult, ScenarioResult};
use isl_chaos_fault::{AssertionResult, InjectionType, TimelineEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the report needs to know about the domain under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub behaviors: Vec<String>,
}

/// A scenario the run was asked to cover, executed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDefinition {
    pub name: String,
    pub behavior_name: String,
    #[serde(default)]
    pub injection_types: Vec<InjectionType>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Why the scenario was not executed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Risky,
    Unsafe,
}

impl Verdict {
    pub fn classify(failed: usize, score: u32) -> Self {
        if failed > 0 && score < 50 {
            Verdict::Unsafe
        } else if failed == 0 && score >= 80 {
            Verdict::Verified
        } else {
            Verdict::Risky
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Verified => "verified",
            Verdict::Risky => "risky",
            Verdict::Unsafe => "unsafe",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub score: u32,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub behavior_name: String,
    pub status: ScenarioStatus,
    pub duration_ms: f64,
    pub injection_types: Vec<InjectionType>,
    pub injections: Vec<InjectionResult>,
    pub assertions: Vec<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Per-injection-type statistics across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionStats {
    pub injection_type: InjectionType,
    pub activations: u64,
    pub scenarios: usize,
    pub passed: usize,
    /// Percentage of scenarios using this type that passed.
    pub pass_rate: u32,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowestScenario {
    pub name: String,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub total_duration_ms: f64,
    pub scenario_duration_ms: f64,
    pub average_scenario_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowest_scenario: Option<SlowestScenario>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosReport {
    pub domain: DomainInfo,
    pub summary: Summary,
    pub scenarios: Vec<ScenarioReport>,
    pub coverage: Coverage,
    pub injection_stats: Vec<InjectionStats>,
    pub timing: Timing,
}

impl ChaosReport {
    pub fn verdict(&self) -> Verdict {
        self.summary.verdict
    }
}

/// `round(((passed + skipped / 2) / total) * 100)`, or 100 for an empty run.
pub fn score(passed: usize, skipped: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    (((passed as f64 + skipped as f64 * 0.5) / total as f64) * 100.0).round() as u32
}

/// Build the report for a run.
///
/// `defined` is the full scenario set; a definition without a matching
/// result (by name) is reported as skipped.  Results without a definition
/// are still reported.  The output depends only on the inputs.
pub fn generate_chaos_report(
    results: &[ScenarioResult],
    defined: &[ScenarioDefinition],
    domain: &DomainInfo,
    total_duration_ms: f64,
) -> ChaosReport {
    let by_name: BTreeMap<&str, &ScenarioResult> =
        results.iter().map(|r| (r.name.as_str(), r)).collect();
    let defined_names: BTreeSet<&str> = defined.iter().map(|d| d.name.as_str()).collect();

    let mut scenarios = Vec::with_capacity(defined.len());
    for definition in defined {
        scenarios.push(match by_name.get(definition.name.as_str()) {
            Some(result) => executed_report(result, definition.injection_types.clone()),
            None => skipped_report(definition),
        });
    }
    for result in results.iter().filter(|r| !defined_names.contains(r.name.as_str())) {
        let types = result.injection_types().collect();
        scenarios.push(executed_report(result, types));
    }

    let count = |status| scenarios.iter().filter(|s| s.status == status).count();
    let passed = count(ScenarioStatus::Passed);
    let failed = count(ScenarioStatus::Failed);
    let skipped = count(ScenarioStatus::Skipped);
    let total = passed + failed + skipped;
    let score = score(passed, skipped, total);

    let mut collector = CoverageCollector::new();
    for result in results {
        collector.record(result);
    }
    let coverage = collector.finish(total, domain.behaviors.len());

    ChaosReport {
        domain: domain.clone(),
        summary: Summary {
            total,
            passed,
            failed,
            skipped,
            score,
            verdict: Verdict::classify(failed, score),
        },
        scenarios,
        coverage,
        injection_stats: injection_stats(results),
        timing: timing(results, total_duration_ms),
    }
}

fn executed_report(result: &ScenarioResult, injection_types: Vec<InjectionType>) -> ScenarioReport {
    ScenarioReport {
        name: result.name.clone(),
        behavior_name: result.behavior_name.clone(),
        status: if result.passed {
            ScenarioStatus::Passed
        } else {
            ScenarioStatus::Failed
        },
        duration_ms: result.duration_ms,
        injection_types,
        injections: result.injections.clone(),
        assertions: result.assertions.clone(),
        error: result.error.clone(),
        skip_reason: None,
        timeline: result.timeline.clone(),
        tags: result.tags.clone(),
    }
}

fn skipped_report(definition: &ScenarioDefinition) -> ScenarioReport {
    ScenarioReport {
        name: definition.name.clone(),
        behavior_name: definition.behavior_name.clone(),
        status: ScenarioStatus::Skipped,
        duration_ms: 0.0,
        injection_types: definition.injection_types.clone(),
        injections: Vec::new(),
        assertions: Vec::new(),
        error: None,
        skip_reason: Some(
            definition
                .skip_reason
                .clone()
                .unwrap_or_else(|| "not executed".to_string()),
        ),
        timeline: Vec::new(),
        tags: definition.tags.clone(),
    }
}

#[derive(Default)]
struct TypeTally {
    activations: u64,
    scenarios: BTreeSet<String>,
    passed: BTreeSet<String>,
    errors: usize,
}

/// Statistics for every injection type used by an executed scenario,
/// ordered by type.
pub fn injection_stats(results: &[ScenarioResult]) -> Vec<InjectionStats> {
    let mut tallies: BTreeMap<InjectionType, TypeTally> = BTreeMap::new();
    for result in results {
        for injection in &result.injections {
            let tally = tallies.entry(injection.injection_type).or_default();
            tally.activations += u64::from(injection.state.activations);
            tally.errors += injection.errors.len();
            tally.scenarios.insert(result.name.clone());
            if result.passed {
                tally.passed.insert(result.name.clone());
            }
        }
    }
    tallies
        .into_iter()
        .map(|(injection_type, tally)| {
            let scenarios = tally.scenarios.len();
            let passed = tally.passed.len();
            InjectionStats {
                injection_type,
                activations: tally.activations,
                scenarios,
                passed,
                pass_rate: if scenarios == 0 {
                    0
                } else {
                    ((passed as f64 / scenarios as f64) * 100.0).round() as u32
                },
                errors: tally.errors,
            }
        })
        .collect()
}

fn timing(results: &[ScenarioResult], total_duration_ms: f64) -> Timing {
    let scenario_duration_ms: f64 = results.iter().map(|r| r.duration_ms).sum();
    let slowest = results
        .iter()
        .filter(|r| r.duration_ms.is_finite())
        .max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms));
    Timing {
        total_duration_ms,
        scenario_duration_ms,
        average_scenario_ms: if results.is_empty() {
            0.0
        } else {
            scenario_duration_ms / results.len() as f64
        },
        slowest_scenario: slowest.map(|r| SlowestScenario {
            name: r.name.clone(),
            duration_ms: r.duration_ms,
        }),
    }
}

// ── Rendering ───────────────────────────────────────────────────

/// Format a chaos report for human consumption.
pub fn format_report(report: &ChaosReport) -> String {
    let mut output = String::new();
    let summary = &report.summary;

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output.push_str(&format!("  Chaos Verification Report: {}\n", report.domain.name));
    output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

    output.push_str(&format!("Verdict:                {}\n", summary.verdict));
    output.push_str(&format!("Score:                  {}/100\n", summary.score));
    output.push_str(&format!(
        "Scenarios:              {} total, {} passed, {} failed, {} skipped\n",
        summary.total, summary.passed, summary.failed, summary.skipped
    ));
    output.push('\n');

    let c = &report.coverage;
    output.push_str("─── Coverage ──────────────────────────────────────────────────────────\n");
    output.push_str(&format!("Injection types:        {}%\n", c.injection_type_coverage));
    output.push_str(&format!("Scenarios:              {}%\n", c.scenario_coverage));
    output.push_str(&format!("Behaviors:              {}%\n", c.behavior_coverage));
    output.push_str(&format!("Overall:                {}%\n", c.overall_coverage));
    output.push('\n');

    if !report.injection_stats.is_empty() {
        output.push_str("─── Injections ────────────────────────────────────────────────────────\n");
        for stats in &report.injection_stats {
            output.push_str(&format!(
                "{:<22}  {} activations, {}/{} passed ({}%)",
                stats.injection_type.as_str(),
                stats.activations,
                stats.passed,
                stats.scenarios,
                stats.pass_rate
            ));
            if stats.errors > 0 {
                output.push_str(&format!(", {} errors", stats.errors));
            }
            output.push('\n');
        }
        output.push('\n');
    }

    output.push_str("─── Scenarios ─────────────────────────────────────────────────────────\n");
    for scenario in &report.scenarios {
        output.push_str(&format_scenario(scenario));
    }
    output.push('\n');

    let t = &report.timing;
    output.push_str("─── Timing ────────────────────────────────────────────────────────────\n");
    output.push_str(&format!("Total:                  {:.1}ms\n", t.total_duration_ms));
    output.push_str(&format!("Average per scenario:   {:.1}ms\n", t.average_scenario_ms));
    if let Some(slowest) = &t.slowest_scenario {
        output.push_str(&format!(
            "Slowest:                {} ({:.1}ms)\n",
            slowest.name, slowest.duration_ms
        ));
    }

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output
}

/// One scenario line plus its failed assertions.
pub fn format_scenario(scenario: &ScenarioReport) -> String {
    let mark = match scenario.status {
        ScenarioStatus::Passed => "PASS",
        ScenarioStatus::Failed => "FAIL",
        ScenarioStatus::Skipped => "SKIP",
    };
    let mut output = format!(
        "[{mark}] {} → {} ({:.1}ms)\n",
        scenario.name, scenario.behavior_name, scenario.duration_ms
    );
    if let Some(reason) = &scenario.skip_reason {
        output.push_str(&format!("       skipped: {reason}\n"));
    }
    if let Some(error) = &scenario.error {
        output.push_str(&format!("       error: {error}\n"));
    }
    for assertion in scenario.assertions.iter().filter(|a| !a.passed) {
        output.push_str(&format!("       ✗ {}", assertion.description));
        if let Some(message) = &assertion.message {
            output.push_str(&format!(": {message}"));
        }
        output.push('\n');
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use isl_chaos_fault::injectors::{InjectorStats, LatencyStats};
    use isl_chaos_fault::InjectorState;

    fn result(name: &str, passed: bool, types: &[InjectionType]) -> ScenarioResult {
        ScenarioResult {
            name: name.into(),
            behavior_name: "Pay".into(),
            passed,
            duration_ms: 10.0,
            injections: types
                .iter()
                .map(|&injection_type| InjectionResult {
                    injection_type,
                    activated: true,
                    state: InjectorState {
                        injection_type,
                        active: false,
                        activations: 1,
                        activated_at_ms: Some(0.0),
                        deactivated_at_ms: Some(1.0),
                        stats: InjectorStats::Latency(LatencyStats::default()),
                    },
                    errors: Vec::new(),
                })
                .collect(),
            assertions: Vec::new(),
            error: (!passed).then(|| "assertion failed".to_string()),
            calls: Vec::new(),
            race: None,
            timeline: Vec::new(),
            tags: Vec::new(),
        }
    }

    fn definition(name: &str) -> ScenarioDefinition {
        ScenarioDefinition {
            name: name.into(),
            behavior_name: "Pay".into(),
            injection_types: Vec::new(),
            tags: Vec::new(),
            skip_reason: None,
        }
    }

    fn domain() -> DomainInfo {
        DomainInfo {
            name: "Payments".into(),
            version: None,
            behaviors: vec!["Pay".into(), "Refund".into()],
        }
    }

    #[test]
    fn score_and_verdict_example() {
        // 10 defined, 8 executed: 6 passed, 2 failed, 2 skipped.
        let defined: Vec<_> = (0..10).map(|i| definition(&format!("s{i}"))).collect();
        let results: Vec<_> = (0..8)
            .map(|i| result(&format!("s{i}"), i < 6, &[InjectionType::NetworkLatency]))
            .collect();
        let report = generate_chaos_report(&results, &defined, &domain(), 100.0);
        let s = &report.summary;
        assert_eq!((s.total, s.passed, s.failed, s.skipped), (10, 6, 2, 2));
        assert_eq!(s.score, 70);
        assert_eq!(s.verdict, Verdict::Risky);
        assert_eq!(report.coverage.scenario_coverage, 80);
        assert_eq!(report.coverage.behavior_coverage, 50);
        assert_eq!(report.scenarios[9].skip_reason.as_deref(), Some("not executed"));
    }

    #[test]
    fn verdict_thresholds() {
        assert_eq!(score(0, 0, 0), 100);
        assert_eq!(Verdict::classify(0, 100), Verdict::Verified);
        assert_eq!(Verdict::classify(0, 80), Verdict::Verified);
        assert_eq!(Verdict::classify(0, 79), Verdict::Risky);
        assert_eq!(Verdict::classify(1, 50), Verdict::Risky);
        assert_eq!(Verdict::classify(1, 49), Verdict::Unsafe);

        let empty = generate_chaos_report(&[], &[], &domain(), 0.0);
        assert_eq!(empty.summary.score, 100);
        assert_eq!(empty.summary.verdict, Verdict::Verified);
    }

    #[test]
    fn report_is_deterministic() {
        let defined = vec![definition("a"), definition("b"), definition("c")];
        let results = vec![
            result("a", true, &[InjectionType::CpuPressure, InjectionType::ClockSkew]),
            result("b", false, &[InjectionType::CpuPressure]),
        ];
        let first =
            serde_json::to_string(&generate_chaos_report(&results, &defined, &domain(), 42.0))
                .unwrap();
        let second =
            serde_json::to_string(&generate_chaos_report(&results, &defined, &domain(), 42.0))
                .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn injection_stats_per_type() {
        let results = vec![
            result("a", true, &[InjectionType::CpuPressure, InjectionType::ClockSkew]),
            result("b", false, &[InjectionType::CpuPressure]),
        ];
        let stats = injection_stats(&results);
        assert_eq!(stats.len(), 2);
        let cpu = stats
            .iter()
            .find(|s| s.injection_type == InjectionType::CpuPressure)
            .unwrap();
        assert_eq!((cpu.activations, cpu.scenarios, cpu.passed, cpu.pass_rate), (2, 2, 1, 50));
    }

    #[test]
    fn timing_tracks_slowest() {
        let mut slow = result("slow", true, &[]);
        slow.duration_ms = 90.0;
        let results = vec![result("fast", true, &[]), slow];
        let t = timing(&results, 120.0);
        assert_eq!(t.scenario_duration_ms, 100.0);
        assert_eq!(t.average_scenario_ms, 50.0);
        assert_eq!(t.slowest_scenario.unwrap().name, "slow");
    }

    #[test]
    fn format_report_lists_scenarios() {
        let mut skipped = definition("later");
        skipped.skip_reason = Some("stopped after failure of b".into());
        let defined = vec![definition("a"), definition("b"), skipped];
        let results = vec![
            result("a", true, &[InjectionType::NetworkLatency]),
            result("b", false, &[]),
        ];
        let report = generate_chaos_report(&results, &defined, &domain(), 20.0);
        let text = format_report(&report);
        assert!(text.contains("Chaos Verification Report: Payments"));
        assert!(text.contains("[PASS] a → Pay"));
        assert!(text.contains("[FAIL] b → Pay"));
        assert!(text.contains("skipped: stopped after failure of b"));
        assert!(text.contains("network_latency"));
        assert!(text.contains("Verdict:                risky"));
    }
}
