//! Chaos verification engine for ISL behaviors.
//!
//! Runs declarative chaos scenarios against a behavior implementation and
//! turns the outcome into a scored, tamper-evident verdict:
//!
//! ```text
//! Domain ──parse──→ ChaosScenario* ──Executor──→ ScenarioResult*
//!                                                    │
//!        ProofBundle ←──sign── ChaosReport ←──score──┘
//! ```
//!
//! 1. **[`domain`]**: structured domain source and scenario declarations
//! 2. **[`executor`]**: runs one scenario with its injectors on a fresh timeline
//! 3. **[`report`]**: summary, score, verdict, per-injection stats, timing
//! 4. **[`coverage`]**: injection-type, scenario and behavior coverage
//! 5. **[`proof`]**: canonical hashing and integrity verification
//! 6. **[`engine`]**: the façade tying the above together, plus the
//!    pipeline-step contract
//!
//! # Example
//!
//! ```
//! use isl_chaos_engine::domain::Domain;
//! use isl_chaos_engine::engine::{ChaosEngine, EngineConfig};
//! use isl_chaos_engine::proof::verify_proof_integrity;
//! use isl_chaos_fault::{BehaviorError, BehaviorOutcome, CallContext};
//! use serde_json::Value;
//!
//! fn echo(_: &str, input: &Value, _: &CallContext<'_>) -> Result<BehaviorOutcome, BehaviorError> {
//!     Ok(BehaviorOutcome::ok(input.clone()))
//! }
//!
//! let domain = Domain::from_json(r#"{
//!     "name": "Orders",
//!     "behaviors": [{
//!         "name": "PlaceOrder",
//!         "scenarios": [{
//!             "name": "slow-network",
//!             "injections": [{ "type": "network_latency", "latency_ms": 2 }],
//!             "assertions": [{ "kind": "success" }]
//!         }]
//!     }]
//! }"#).unwrap();
//!
//! let run = ChaosEngine::new(EngineConfig::default()).run(&domain, &echo).unwrap();
//! assert_eq!(run.report.summary.passed, 1);
//! assert!(verify_proof_integrity(&run.proof, &run.manifest, &run.results).valid);
//! ```
//!
//! # Determinism
//!
//! Injector randomness is seeded from [`engine::EngineConfig::seed`] and the
//! scenario/injection positions.  Reports use BTreeMaps throughout, so
//! identical inputs produce byte-identical JSON.

pub mod coverage;
pub mod domain;
pub mod engine;
pub mod executor;
pub mod proof;
pub mod report;
pub mod serialize;

pub use coverage::{Coverage, CoverageCollector, CoverageStats};
pub use domain::{BehaviorDecl, DefinedScenario, Domain, ScenarioDecl};
pub use engine::{
    ChaosEngine, ChaosPipelineStep, ChaosRun, EngineConfig, EngineError, PipelineOutput,
};
pub use executor::{run_scenario, Executor, InjectionResult, ScenarioResult};
pub use proof::{
    build_proof_bundle, verify_proof_integrity, IntegrityCheck, ProofBundle, ProofError,
};
pub use report::{format_report, generate_chaos_report, ChaosReport, Verdict};
pub use serialize::SerializeError;
