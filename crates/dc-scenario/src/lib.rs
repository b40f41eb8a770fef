//! dc-scenario: YAML scenario files describing collocation problems.
//!
//! A scenario names its states, writes the equations of motion and
//! constraints as expression strings, and carries known values, bounds, the
//! objective, one initial guess, and solver options. [`build_scenario`] turns
//! it into a ready [`dc_collocation::Problem`].

pub mod build;
pub mod schema;
pub mod validate;

pub use build::{BuiltScenario, build_scenario, initial_guess};
pub use schema::*;
pub use validate::{LATEST_VERSION, ValidationError, validate_scenario};

use std::path::Path;

use dc_collocation::CollocationError;
use dc_expr::ExprError;
use tracing::debug;

pub type ScenarioResult<T> = Result<T, ScenarioError>;

#[derive(thiserror::Error, Debug)]
pub enum ScenarioError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Expression error in {field}: {source}")]
    Expr {
        field: String,
        #[source]
        source: ExprError,
    },

    #[error("Initial guess names '{name}', which is not a {kind} of the problem")]
    UnknownGuess { name: String, kind: &'static str },

    #[error("Problem error: {0}")]
    Problem(#[from] CollocationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn from_yaml_str(content: &str) -> ScenarioResult<Scenario> {
    let scenario: Scenario = serde_yaml::from_str(content)?;
    validate_scenario(&scenario)?;
    Ok(scenario)
}

pub fn load_yaml(path: &Path) -> ScenarioResult<Scenario> {
    let content = std::fs::read_to_string(path)?;
    let scenario = from_yaml_str(&content)?;
    debug!(path = %path.display(), name = %scenario.name, "scenario loaded");
    Ok(scenario)
}

pub fn save_yaml(path: &Path, scenario: &Scenario) -> ScenarioResult<()> {
    validate_scenario(scenario)?;
    let content = serde_yaml::to_string(scenario)?;
    std::fs::write(path, content)?;
    Ok(())
}

pub fn load_json(path: &Path) -> ScenarioResult<Scenario> {
    let content = std::fs::read_to_string(path)?;
    let scenario: Scenario = serde_json::from_str(&content)?;
    validate_scenario(&scenario)?;
    Ok(scenario)
}

pub fn save_json(path: &Path, scenario: &Scenario) -> ScenarioResult<()> {
    validate_scenario(scenario)?;
    let content = serde_json::to_string_pretty(scenario)?;
    std::fs::write(path, content)?;
    Ok(())
}
