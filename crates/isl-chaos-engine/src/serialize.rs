//! JSON persistence for reports, proofs and whole runs.

use crate::engine::ChaosRun;
use crate::proof::ProofBundle;
use crate::report::{format_report, ChaosReport};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during serialization.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub const REPORT_FILE: &str = "report.json";
pub const PROOF_FILE: &str = "proof.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const RESULTS_FILE: &str = "results.json";
pub const REPORT_TEXT_FILE: &str = "report.txt";

/// Save a chaos report as pretty-printed JSON.
pub fn save_report(report: &ChaosReport, path: &Path) -> Result<(), SerializeError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

pub fn load_report(path: &Path) -> Result<ChaosReport, SerializeError> {
    let file = File::open(path)?;
    let report = serde_json::from_reader(file)?;
    Ok(report)
}

pub fn save_proof(proof: &ProofBundle, path: &Path) -> Result<(), SerializeError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, proof)?;
    Ok(())
}

pub fn load_proof(path: &Path) -> Result<ProofBundle, SerializeError> {
    let file = File::open(path)?;
    let proof = serde_json::from_reader(file)?;
    Ok(proof)
}

/// Write every artifact of a run into `dir`, creating it if needed.
///
/// The manifest and results are written byte-for-byte as signed, so
/// `isl-chaos verify` can re-check them later.
pub fn save_run(run: &ChaosRun, dir: &Path) -> Result<Vec<PathBuf>, SerializeError> {
    fs::create_dir_all(dir)?;
    let written = vec![
        dir.join(REPORT_FILE),
        dir.join(PROOF_FILE),
        dir.join(MANIFEST_FILE),
        dir.join(RESULTS_FILE),
        dir.join(REPORT_TEXT_FILE),
    ];
    save_report(&run.report, &written[0])?;
    save_proof(&run.proof, &written[1])?;
    fs::write(&written[2], &run.manifest)?;
    fs::write(&written[3], &run.results)?;
    let mut text = File::create(&written[4])?;
    text.write_all(format_report(&run.report).as_bytes())?;
    log::info!("wrote run artifacts to {}", dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::engine::{ChaosEngine, EngineConfig};
    use crate::proof::verify_proof_integrity;
    use isl_chaos_fault::{BehaviorError, BehaviorOutcome, CallContext};
    use serde_json::Value;
    use tempfile::TempDir;

    fn echo(_: &str, input: &Value, _: &CallContext<'_>) -> Result<BehaviorOutcome, BehaviorError> {
        Ok(BehaviorOutcome::ok(input.clone()))
    }

    fn run() -> ChaosRun {
        let domain = Domain::from_json(
            r#"{ "name": "D", "behaviors": [{ "name": "Echo", "scenarios": [
                { "name": "smoke", "input": { "a": 1 }, "assertions": [{ "kind": "success" }] }
            ] }] }"#,
        )
        .unwrap();
        ChaosEngine::new(EngineConfig::default())
            .run(&domain, &echo)
            .unwrap()
    }

    #[test]
    fn test_report_and_proof_round_trip() {
        let dir = TempDir::new().unwrap();
        let run = run();

        let report_path = dir.path().join("r.json");
        save_report(&run.report, &report_path).unwrap();
        let loaded = load_report(&report_path).unwrap();
        assert_eq!(loaded.summary, run.report.summary);
        assert_eq!(loaded.coverage, run.report.coverage);
        assert_eq!(loaded.scenarios[0].name, "smoke");

        let proof_path = dir.path().join("p.json");
        save_proof(&run.proof, &proof_path).unwrap();
        assert_eq!(load_proof(&proof_path).unwrap(), run.proof);
    }

    #[test]
    fn test_saved_run_verifies() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested").join("out");
        let written = save_run(&run(), &out).unwrap();
        assert!(written.iter().all(|p| p.exists()));

        let proof = load_proof(&out.join(PROOF_FILE)).unwrap();
        let manifest = fs::read_to_string(out.join(MANIFEST_FILE)).unwrap();
        let results = fs::read_to_string(out.join(RESULTS_FILE)).unwrap();
        assert!(verify_proof_integrity(&proof, &manifest, &results).valid);

        let text = fs::read_to_string(out.join(REPORT_TEXT_FILE)).unwrap();
        assert!(text.contains("[PASS] smoke"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = load_report(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(SerializeError::Io(_))));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_proof(&path), Err(SerializeError::Json(_))));
    }
}
