//! CLI for the ISL chaos verification engine.
//!
//! # Usage
//!
//! ```bash
//! # Dry-run a domain's chaos scenarios against the built-in echo behavior
//! isl-chaos run --domain payments.json
//!
//! # Fixed seed, stop at the first failing scenario, keep artifacts
//! isl-chaos run --domain payments.json --seed 7 --stop-on-failure --output out/
//!
//! # Re-verify a saved proof bundle
//! isl-chaos verify --proof out/proof.json --manifest out/manifest.json --results out/results.json
//! ```
//!
//! `run` exits non-zero unless the verdict is `verified`; `verify` exits
//! non-zero when any hash does not match.

use clap::{Parser, Subcommand};
use isl_chaos_engine::domain::Domain;
use isl_chaos_engine::engine::{ChaosEngine, EngineConfig};
use isl_chaos_engine::proof::verify_proof_integrity;
use isl_chaos_engine::report::format_report;
use isl_chaos_engine::serialize::{load_proof, save_run};
use isl_chaos_fault::{BehaviorError, BehaviorOutcome, CallContext};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "isl-chaos")]
#[command(about = "Chaos verification for ISL behaviors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every chaos scenario declared by a domain.
    Run {
        /// Domain document (JSON).
        #[arg(short, long)]
        domain: PathBuf,

        /// Engine configuration (JSON); CLI flags override it.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Root seed for injector randomness.
        #[arg(short, long)]
        seed: Option<u64>,

        /// Skip the remaining scenarios after the first failure.
        #[arg(long)]
        stop_on_failure: bool,

        /// Run only scenarios carrying this tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Directory for report, proof, manifest and results files.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Re-verify a proof bundle against its manifest and results.
    Verify {
        #[arg(short, long)]
        proof: PathBuf,

        #[arg(short, long)]
        manifest: PathBuf,

        #[arg(short, long)]
        results: PathBuf,
    },
}

/// Stand-in implementation: every behavior returns its input as data.
fn echo(
    _behavior: &str,
    input: &Value,
    _ctx: &CallContext<'_>,
) -> Result<BehaviorOutcome, BehaviorError> {
    Ok(BehaviorOutcome::ok(input.clone()))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run {
            domain,
            config,
            seed,
            stop_on_failure,
            tags,
            output,
        } => cmd_run(&domain, config.as_deref(), seed, stop_on_failure, tags, output.as_deref()),
        Commands::Verify {
            proof,
            manifest,
            results,
        } => cmd_verify(&proof, &manifest, &results),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(message) => {
            eprintln!("Error: {message}");
            ExitCode::from(2)
        }
    }
}

fn cmd_run(
    domain_path: &Path,
    config_path: Option<&Path>,
    seed: Option<u64>,
    stop_on_failure: bool,
    tags: Vec<String>,
    output: Option<&Path>,
) -> Result<bool, String> {
    let mut config = match config_path {
        Some(path) => {
            let text = read(path)?;
            serde_json::from_str::<EngineConfig>(&text)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(seed) = seed {
        config.seed = seed;
    }
    if stop_on_failure {
        config.continue_on_failure = false;
    }
    if !tags.is_empty() {
        config.include_tags = tags;
    }

    let domain = Domain::from_json(&read(domain_path)?).map_err(|e| e.to_string())?;
    let run = ChaosEngine::new(config)
        .run(&domain, &echo)
        .map_err(|e| e.to_string())?;

    print!("{}", format_report(&run.report));
    println!("Integrity:              {}", run.proof.integrity_hash);

    if let Some(dir) = output {
        save_run(&run, dir).map_err(|e| format!("failed to write {}: {e}", dir.display()))?;
        println!("Artifacts:              {}", dir.display());
    }
    Ok(run.passed())
}

fn cmd_verify(proof: &Path, manifest: &Path, results: &Path) -> Result<bool, String> {
    let bundle = load_proof(proof).map_err(|e| format!("failed to load {}: {e}", proof.display()))?;
    let check = verify_proof_integrity(&bundle, &read(manifest)?, &read(results)?);
    if check.valid {
        println!("Proof valid ({}, signed {})", bundle.algorithm, bundle.signed_at);
        return Ok(true);
    }
    println!("Proof TAMPERED:");
    for mismatch in &check.mismatches {
        println!("  {mismatch}");
    }
    Ok(false)
}

fn read(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))
}
