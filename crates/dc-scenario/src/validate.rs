//! Scenario validation.
//!
//! Checks what can be checked from the file alone. Symbol classification and
//! expression-level errors surface later, when the problem is built.

use std::collections::BTreeSet;

use crate::schema::{ConstraintDef, EquationsDef, FREE_KEYWORD, IntervalDef, ObjectiveDef, Scenario};

pub const LATEST_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Duplicate name: {name} in {context}")]
    DuplicateName { name: String, context: String },

    #[error("Missing reference: {name} in {context}")]
    MissingReference { name: String, context: String },

    #[error("Invalid value: {field} = {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unsupported version: {version}")]
    UnsupportedVersion { version: u32 },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_node_values(field: &str, values: &[f64], num_nodes: usize) -> Result<(), ValidationError> {
    if values.len() != num_nodes {
        return Err(invalid(
            field,
            format!("{} values", values.len()),
            "must have one value per node",
        ));
    }
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        return Err(invalid(field, v, "must be finite"));
    }
    Ok(())
}

pub fn validate_scenario(scenario: &Scenario) -> Result<(), ValidationError> {
    if scenario.version == 0 || scenario.version > LATEST_VERSION {
        return Err(ValidationError::UnsupportedVersion {
            version: scenario.version,
        });
    }
    if scenario.name.trim().is_empty() {
        return Err(invalid("name", "\"\"", "must not be empty"));
    }

    let n = scenario.num_nodes;
    if n < 2 {
        return Err(invalid("num_nodes", n, "at least two nodes are required"));
    }

    if scenario.states.is_empty() {
        return Err(invalid("states", "[]", "at least one state is required"));
    }
    let mut names = BTreeSet::new();
    for s in &scenario.states {
        if !names.insert(s.as_str()) {
            return Err(ValidationError::DuplicateName {
                name: s.clone(),
                context: "states".to_string(),
            });
        }
    }
    for (context, keys) in [
        ("known_parameters", scenario.known_parameters.keys().collect::<Vec<_>>()),
        ("known_trajectories", scenario.known_trajectories.keys().collect()),
    ] {
        for k in keys {
            if !names.insert(k.as_str()) {
                return Err(ValidationError::DuplicateName {
                    name: k.clone(),
                    context: context.to_string(),
                });
            }
        }
    }

    validate_equations(&scenario.equations, scenario.states.len())?;
    validate_interval(&scenario.interval)?;

    for (name, v) in &scenario.known_parameters {
        if !v.is_finite() {
            return Err(invalid(format!("known parameter '{name}'"), v, "must be finite"));
        }
    }
    for (name, values) in &scenario.known_trajectories {
        check_node_values(&format!("known trajectory '{name}'"), values, n)?;
    }
    for (name, [lower, upper]) in &scenario.bounds {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(invalid(
                format!("bounds of '{name}'"),
                format!("[{lower}, {upper}]"),
                "lower must not exceed upper",
            ));
        }
    }

    for (kind, constraints) in [
        ("instance constraint", &scenario.instance_constraints),
        ("path constraint", &scenario.path_constraints),
    ] {
        for (i, c) in constraints.iter().enumerate() {
            validate_constraint(kind, i, c)?;
        }
    }

    let free: BTreeSet<&str> = scenario
        .bounds
        .keys()
        .chain(&scenario.free)
        .map(String::as_str)
        .collect();
    validate_objective(scenario, &free)?;
    validate_initial_guess(scenario)?;
    Ok(())
}

fn validate_equations(equations: &EquationsDef, num_states: usize) -> Result<(), ValidationError> {
    if equations.len() != num_states {
        return Err(invalid(
            "equations",
            format!("{} equations", equations.len()),
            "need one equation per state",
        ));
    }
    if let EquationsDef::MassMatrix { mass, .. } = equations
        && (mass.len() != num_states || mass.iter().any(|row| row.len() != num_states))
    {
        return Err(invalid(
            "equations.mass_matrix.mass",
            format!("{} rows", mass.len()),
            "must be square with one row per state",
        ));
    }
    Ok(())
}

fn validate_interval(interval: &IntervalDef) -> Result<(), ValidationError> {
    match interval {
        IntervalDef::Fixed(h) if !h.is_finite() || *h <= 0.0 => {
            Err(invalid("interval", h, "must be positive and finite"))
        }
        IntervalDef::Keyword(word) if word != FREE_KEYWORD => Err(invalid(
            "interval",
            word,
            "must be a number or 'free'",
        )),
        IntervalDef::Named { free } if free.trim().is_empty() => {
            Err(invalid("interval.free", "\"\"", "must name the interval symbol"))
        }
        _ => Ok(()),
    }
}

fn validate_constraint(kind: &str, index: usize, c: &ConstraintDef) -> Result<(), ValidationError> {
    if c.expr().trim().is_empty() {
        return Err(invalid(format!("{kind} {index}"), "\"\"", "must not be empty"));
    }
    let (lower, upper) = c.bounds();
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(invalid(
            format!("{kind} {index} bounds"),
            format!("[{lower}, {upper}]"),
            "lower must not exceed upper",
        ));
    }
    Ok(())
}

fn validate_objective(scenario: &Scenario, free: &BTreeSet<&str>) -> Result<(), ValidationError> {
    match &scenario.objective {
        ObjectiveDef::MinimizeInterval => {
            if scenario.interval.free_symbol().is_none() {
                return Err(invalid(
                    "objective",
                    "minimize_interval",
                    "needs a free interval",
                ));
            }
        }
        ObjectiveDef::ControlEffort { trajectories: names }
        | ObjectiveDef::ParameterSum { parameters: names } => {
            for name in names {
                if !free.contains(name.as_str()) {
                    return Err(ValidationError::MissingReference {
                        name: name.clone(),
                        context: "objective (not a bounded or free unknown)".to_string(),
                    });
                }
            }
        }
        ObjectiveDef::Tracking { measurements } => {
            for (name, values) in measurements {
                if !scenario.states.contains(name) {
                    return Err(ValidationError::MissingReference {
                        name: name.clone(),
                        context: "objective measurements (not a state)".to_string(),
                    });
                }
                check_node_values(&format!("measurement '{name}'"), values, scenario.num_nodes)?;
            }
        }
    }
    Ok(())
}

fn validate_initial_guess(scenario: &Scenario) -> Result<(), ValidationError> {
    let guess = &scenario.initial_guess;
    if !guess.fill.is_finite() {
        return Err(invalid("initial_guess.fill", guess.fill, "must be finite"));
    }
    for (name, values) in &guess.states {
        if !scenario.states.contains(name) {
            return Err(ValidationError::MissingReference {
                name: name.clone(),
                context: "initial_guess.states".to_string(),
            });
        }
        check_node_values(&format!("initial guess of '{name}'"), values, scenario.num_nodes)?;
    }
    for (name, values) in &guess.trajectories {
        check_node_values(&format!("initial guess of '{name}'"), values, scenario.num_nodes)?;
    }
    if let Some((name, v)) = guess.parameters.iter().find(|(_, v)| !v.is_finite()) {
        return Err(invalid(format!("initial guess of '{name}'"), v, "must be finite"));
    }
    match (scenario.interval.free_symbol(), guess.interval) {
        (Some(_), None) => Err(invalid(
            "initial_guess.interval",
            "missing",
            "required when the interval is free",
        )),
        (Some(_), Some(h)) if !h.is_finite() || h <= 0.0 => Err(invalid(
            "initial_guess.interval",
            h,
            "must be positive and finite",
        )),
        (None, Some(h)) => Err(invalid(
            "initial_guess.interval",
            h,
            "only allowed when the interval is free",
        )),
        _ => Ok(()),
    }
}
