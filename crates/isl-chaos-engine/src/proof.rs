//! Tamper-evident proof bundles over a chaos report.
//!
//! The report is split into two canonical JSON documents: the *manifest*
//! (what was tested) and the *results* (what happened).  Each is hashed
//! with SHA-256, and the integrity hash covers both:
//!
//! ```text
//! manifestHash  = sha256(manifest)
//! resultsHash   = sha256(results)
//! integrityHash = sha256("{manifestHash}:{resultsHash}")
//! ```
//!
//! Canonical serialization sorts object keys at every depth, so reports
//! that differ only in field order hash identically.

use crate::report::{ChaosReport, DomainInfo};
use chrono::{DateTime, SecondsFormat, Utc};
use isl_chaos_fault::canonical::{sha256_hex, to_canonical_json};
use isl_chaos_fault::InjectionType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ALGORITHM: &str = "sha256";
pub const DEFAULT_PROOF_VERSION: &str = "1.0.0";

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("failed to serialize proof content: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("proof bundle was tampered with: {}", .mismatches.join("; "))]
    Tampered { mismatches: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    pub manifest_hash: String,
    pub results_hash: String,
    pub integrity_hash: String,
    pub algorithm: String,
    /// RFC 3339 signing time.
    pub signed_at: String,
    pub version: String,
}

/// A bundle together with the content it signs.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedReport {
    pub bundle: ProofBundle,
    pub manifest: String,
    pub results: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub field: String,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: expected {}, got {}", self.field, self.expected, self.actual)
    }
}

/// Outcome of re-verifying a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheck {
    pub valid: bool,
    pub mismatches: Vec<Mismatch>,
}

impl IntegrityCheck {
    /// Surface tampering as an error.
    pub fn into_result(self) -> Result<(), ProofError> {
        if self.valid {
            Ok(())
        } else {
            Err(ProofError::Tampered {
                mismatches: self.mismatches.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    version: &'a str,
    domain: &'a DomainInfo,
    scenarios: Vec<ManifestEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry<'a> {
    name: &'a str,
    behavior_name: &'a str,
    injection_types: &'a [InjectionType],
    tags: &'a [String],
}

/// Canonical manifest: the domain and the scenarios the run covered.
pub fn proof_manifest(report: &ChaosReport, version: &str) -> Result<String, ProofError> {
    let manifest = Manifest {
        version,
        domain: &report.domain,
        scenarios: report
            .scenarios
            .iter()
            .map(|s| ManifestEntry {
                name: &s.name,
                behavior_name: &s.behavior_name,
                injection_types: &s.injection_types,
                tags: &s.tags,
            })
            .collect(),
    };
    Ok(to_canonical_json(&manifest)?)
}

/// Canonical results: everything the run produced.
pub fn proof_results(report: &ChaosReport) -> Result<String, ProofError> {
    let results = serde_json::json!({
        "summary": report.summary,
        "scenarios": report.scenarios,
        "coverage": report.coverage,
        "injectionStats": report.injection_stats,
        "timing": report.timing,
    });
    Ok(to_canonical_json(&results)?)
}

fn integrity_hash(manifest_hash: &str, results_hash: &str) -> String {
    sha256_hex(&format!("{manifest_hash}:{results_hash}"))
}

/// Sign already-serialized manifest and results content.
pub fn sign(manifest: &str, results: &str, version: &str, signed_at: DateTime<Utc>) -> ProofBundle {
    let manifest_hash = sha256_hex(manifest);
    let results_hash = sha256_hex(results);
    ProofBundle {
        integrity_hash: integrity_hash(&manifest_hash, &results_hash),
        manifest_hash,
        results_hash,
        algorithm: ALGORITHM.to_string(),
        signed_at: signed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        version: version.to_string(),
    }
}

/// Build a proof bundle for `report`, signed now.
pub fn build_proof_bundle(report: &ChaosReport, version: &str) -> Result<SignedReport, ProofError> {
    build_proof_bundle_at(report, version, Utc::now())
}

pub fn build_proof_bundle_at(
    report: &ChaosReport,
    version: &str,
    signed_at: DateTime<Utc>,
) -> Result<SignedReport, ProofError> {
    let manifest = proof_manifest(report, version)?;
    let results = proof_results(report)?;
    Ok(SignedReport {
        bundle: sign(&manifest, &results, version, signed_at),
        manifest,
        results,
    })
}

/// Recompute all three hashes from `manifest` and `results` and compare
/// them with the bundle.
pub fn verify_proof_integrity(
    bundle: &ProofBundle,
    manifest: &str,
    results: &str,
) -> IntegrityCheck {
    let manifest_hash = sha256_hex(manifest);
    let results_hash = sha256_hex(results);
    // Recomputed from the stored hashes so an edited bundle is caught even
    // when the content still matches.
    let integrity = integrity_hash(&bundle.manifest_hash, &bundle.results_hash);

    let mut mismatches = Vec::new();
    let mut compare = |field: &str, expected: &str, actual: String| {
        if expected != actual {
            mismatches.push(Mismatch {
                field: field.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    };
    compare("algorithm", ALGORITHM, bundle.algorithm.clone());
    compare("manifestHash", &bundle.manifest_hash, manifest_hash);
    compare("resultsHash", &bundle.results_hash, results_hash);
    compare("integrityHash", &bundle.integrity_hash, integrity);

    if !mismatches.is_empty() {
        log::warn!(
            "proof verification failed: {}",
            mismatches
                .iter()
                .map(|m| m.field.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    IntegrityCheck {
        valid: mismatches.is_empty(),
        mismatches,
    }
}
