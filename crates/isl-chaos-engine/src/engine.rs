//! Top-level façade: domain → scenarios → results → report → proof.

use crate::domain::{DefinedScenario, Domain};
use crate::executor::{Executor, ScenarioResult};
use crate::proof::{build_proof_bundle, ProofBundle, ProofError, DEFAULT_PROOF_VERSION};
use crate::report::{generate_chaos_report, ChaosReport, DomainInfo, ScenarioDefinition, Verdict};
use isl_chaos_fault::behavior::panic_message;
use isl_chaos_fault::oracle::AssertionSubject;
use isl_chaos_fault::{AssertionOracle, BehaviorImpl};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use thiserror::Error;

/// Structural problems that stop a run before any scenario executes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("domain {0:?} declares no behaviors")]
    NoBehaviors(String),

    #[error("scenario name {0:?} is declared more than once")]
    DuplicateScenario(String),

    #[error("invalid domain document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Proof(#[from] ProofError),
}

/// Engine configuration.  Every field has a default, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root seed for every injector RNG.
    pub seed: u64,
    /// Keep running after a scenario fails.
    pub continue_on_failure: bool,
    /// Run only scenarios carrying at least one of these tags.
    pub include_tags: Vec<String>,
    /// Never run scenarios carrying any of these tags.
    pub exclude_tags: Vec<String>,
    /// Run only these scenarios (by name).
    pub scenario_names: Vec<String>,
    pub proof_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            continue_on_failure: true,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            scenario_names: Vec::new(),
            proof_version: DEFAULT_PROOF_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Whether a declared scenario passes the configured filters.
    pub fn selects(&self, name: &str, tags: &[String]) -> bool {
        let has = |wanted: &[String]| tags.iter().any(|t| wanted.contains(t));
        (self.scenario_names.is_empty() || self.scenario_names.iter().any(|n| n == name))
            && (self.include_tags.is_empty() || has(&self.include_tags))
            && !has(&self.exclude_tags)
    }
}

/// Everything one engine run produced.
#[derive(Debug, Clone)]
pub struct ChaosRun {
    pub report: ChaosReport,
    pub proof: ProofBundle,
    /// Canonical manifest content the proof signs.
    pub manifest: String,
    /// Canonical results content the proof signs.
    pub results: String,
    pub scenario_results: Vec<ScenarioResult>,
}

impl ChaosRun {
    pub fn passed(&self) -> bool {
        self.report.verdict() == Verdict::Verified
    }
}

/// Runs every scenario of a domain sequentially.
#[derive(Debug, Clone, Default)]
pub struct ChaosEngine {
    config: EngineConfig,
    oracle: AssertionOracle,
}

impl ChaosEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            oracle: AssertionOracle::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a predicate for `custom` assertions.
    pub fn with_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&AssertionSubject) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.oracle.register(name, predicate);
        self
    }

    pub fn run(
        &self,
        domain: &Domain,
        implementation: &dyn BehaviorImpl,
    ) -> Result<ChaosRun, EngineError> {
        domain.check()?;
        let started = Instant::now();
        let executor = Executor::new(self.oracle.clone(), self.config.seed);

        let selected: Vec<DefinedScenario> = domain
            .scenarios()
            .into_iter()
            .filter(|s| self.config.selects(&s.name, &s.tags))
            .collect();
        info!(
            "running {} chaos scenarios for domain {}",
            selected.len(),
            domain.name
        );

        let mut definitions = Vec::with_capacity(selected.len());
        let mut results = Vec::new();
        let mut stopped_by: Option<String> = None;
        for (index, defined) in selected.iter().enumerate() {
            let mut definition = ScenarioDefinition {
                name: defined.name.clone(),
                behavior_name: defined.behavior.clone(),
                injection_types: Vec::new(),
                tags: defined.tags.clone(),
                skip_reason: None,
            };
            let scenario = match &defined.parsed {
                Ok(scenario) => scenario,
                Err(e) => {
                    warn!("skipping scenario {}: {e}", defined.name);
                    definition.skip_reason = Some(e.to_string());
                    definitions.push(definition);
                    continue;
                }
            };
            definition.injection_types = scenario
                .injections
                .iter()
                .map(|i| i.injection_type())
                .collect();
            if let Some(failed) = &stopped_by {
                definition.skip_reason = Some(format!("stopped after failure of {failed}"));
                definitions.push(definition);
                continue;
            }
            definitions.push(definition);

            let result = catch_unwind(AssertUnwindSafe(|| {
                executor.run(scenario, index, implementation)
            }))
            .unwrap_or_else(|payload| {
                ScenarioResult::aborted(
                    scenario,
                    format!("executor panicked: {}", panic_message(payload.as_ref())),
                )
            });
            if !result.passed && !self.config.continue_on_failure {
                info!("stopping after failure of {}", result.name);
                stopped_by = Some(result.name.clone());
            }
            results.push(result);
        }

        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        let domain_info = DomainInfo {
            name: domain.name.clone(),
            version: domain.version.clone(),
            behaviors: domain.behaviors.iter().map(|b| b.name.clone()).collect(),
        };
        let report = generate_chaos_report(&results, &definitions, &domain_info, total_ms);
        let signed = build_proof_bundle(&report, &self.config.proof_version)?;
        info!(
            "domain {}: {} (score {}, {} passed, {} failed, {} skipped)",
            domain.name,
            report.summary.verdict,
            report.summary.score,
            report.summary.passed,
            report.summary.failed,
            report.summary.skipped
        );

        Ok(ChaosRun {
            report,
            proof: signed.bundle,
            manifest: signed.manifest,
            results: signed.results,
            scenario_results: results,
        })
    }
}

// ── Pipeline ────────────────────────────────────────────────────

/// What a CI gate needs from a chaos run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub report: ChaosReport,
    pub proof: ProofBundle,
    /// The verdict is `verified`.
    pub passed: bool,
}

/// A chaos stage callable by an orchestrating pipeline.
pub trait ChaosPipelineStep {
    fn execute(
        &self,
        domain: &Domain,
        implementation: &dyn BehaviorImpl,
    ) -> Result<PipelineOutput, EngineError>;
}

impl ChaosPipelineStep for ChaosEngine {
    fn execute(
        &self,
        domain: &Domain,
        implementation: &dyn BehaviorImpl,
    ) -> Result<PipelineOutput, EngineError> {
        let run = self.run(domain, implementation)?;
        let passed = run.passed();
        Ok(PipelineOutput {
            report: run.report,
            proof: run.proof,
            passed,
        })
    }
}
