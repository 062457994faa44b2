//! Structured domain source: behaviors and their chaos scenario
//! declarations.
//!
//! Scenario declarations stay untyped JSON until [`Domain::scenarios`]
//! parses them.  A malformed declaration, even one of the wrong shape, does
//! not fail the domain; it becomes a [`DefinedScenario`] carrying the parse
//! error so the engine can report it as skipped.

use crate::engine::EngineError;
use isl_chaos_fault::scenario::{parse_assertion, parse_injection, parse_step, RetryPolicy};
use isl_chaos_fault::{ChaosScenario, ScenarioError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub behaviors: Vec<BehaviorDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDecl {
    pub name: String,
    /// Raw declarations, decoded one by one into [`ScenarioDecl`].
    #[serde(default)]
    pub scenarios: Vec<Value>,
}

impl BehaviorDecl {
    /// Name of the declaration at `position`, or a positional stand-in when
    /// it has none.
    pub fn scenario_name(&self, position: usize) -> String {
        self.scenarios
            .get(position)
            .and_then(|decl| decl.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}#{position}", self.name))
    }
}

/// A chaos scenario as written in the domain source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub injections: Vec<Value>,
    #[serde(default)]
    pub assertions: Vec<Value>,
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_input")]
    pub input: Value,
    #[serde(default)]
    pub retry: Option<Value>,
}

fn empty_input() -> Value {
    Value::Object(Map::new())
}

impl ScenarioDecl {
    /// Parse and validate this declaration for `behavior`.
    pub fn parse(&self, behavior: &str) -> Result<ChaosScenario, ScenarioError> {
        let injections = self
            .injections
            .iter()
            .enumerate()
            .map(|(i, decl)| parse_injection(i, decl))
            .collect::<Result<Vec<_>, _>>()?;
        let assertions = self
            .assertions
            .iter()
            .enumerate()
            .map(|(i, decl)| parse_assertion(i, decl))
            .collect::<Result<Vec<_>, _>>()?;
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, decl)| parse_step(i, decl))
            .collect::<Result<Vec<_>, _>>()?;
        let retry = self
            .retry
            .as_ref()
            .map(|r| serde_json::from_value::<RetryPolicy>(r.clone()))
            .transpose()
            .map_err(|e| ScenarioError::InvalidRetry(e.to_string()))?;

        let scenario = ChaosScenario {
            name: self.name.clone(),
            behavior_name: behavior.to_string(),
            injections,
            assertions,
            steps,
            tags: self.tags.clone(),
            input: self.input.clone(),
            retry,
            description: self.description.clone(),
        };
        scenario.validate()?;
        Ok(scenario)
    }
}

/// A declared scenario with its parse outcome.
#[derive(Debug, Clone)]
pub struct DefinedScenario {
    pub name: String,
    pub behavior: String,
    pub tags: Vec<String>,
    pub parsed: Result<ChaosScenario, ScenarioError>,
}

impl Domain {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let domain: Domain = serde_json::from_str(text)?;
        domain.check()?;
        Ok(domain)
    }

    /// Reject domains with no behaviors or duplicate scenario names.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.behaviors.is_empty() {
            return Err(EngineError::NoBehaviors(self.name.clone()));
        }
        let mut seen = BTreeSet::new();
        for behavior in &self.behaviors {
            for position in 0..behavior.scenarios.len() {
                let name = behavior.scenario_name(position);
                if !seen.insert(name.clone()) {
                    return Err(EngineError::DuplicateScenario(name));
                }
            }
        }
        Ok(())
    }

    pub fn behavior_names(&self) -> BTreeSet<&str> {
        self.behaviors.iter().map(|b| b.name.as_str()).collect()
    }

    /// Every declared scenario in declaration order.
    pub fn scenarios(&self) -> Vec<DefinedScenario> {
        let mut defined = Vec::new();
        for behavior in &self.behaviors {
            for (position, raw) in behavior.scenarios.iter().enumerate() {
                let scenario = match serde_json::from_value::<ScenarioDecl>(raw.clone()) {
                    Ok(decl) => DefinedScenario {
                        name: decl.name.clone(),
                        behavior: behavior.name.clone(),
                        tags: decl.tags.clone(),
                        parsed: decl.parse(&behavior.name),
                    },
                    Err(e) => DefinedScenario {
                        name: behavior.scenario_name(position),
                        behavior: behavior.name.clone(),
                        tags: Vec::new(),
                        parsed: Err(ScenarioError::MalformedDeclaration(e.to_string())),
                    },
                };
                defined.push(scenario);
            }
        }
        defined
    }
}
