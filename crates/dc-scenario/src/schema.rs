//! Scenario schema definitions.

use std::collections::BTreeMap;

use dc_collocation::{CollocationMethod, EvalBackend, SolveOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub version: u32,
    pub name: String,
    /// State names, in layout order.
    pub states: Vec<String>,
    /// Further names that are functions of time. States, known trajectories,
    /// and names used inside `der()` or sampled as `x(T)` need not be listed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic: Vec<String>,
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub equations: EquationsDef,
    pub num_nodes: usize,
    pub interval: IntervalDef,
    #[serde(default)]
    pub known_parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub known_trajectories: BTreeMap<String, Vec<f64>>,
    /// Inclusive `[lower, upper]` per unknown; a bounded name becomes free.
    #[serde(default)]
    pub bounds: BTreeMap<String, [f64; 2]>,
    /// Unbounded free unknowns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub free: Vec<String>,
    #[serde(default)]
    pub instance_constraints: Vec<ConstraintDef>,
    #[serde(default)]
    pub path_constraints: Vec<ConstraintDef>,
    #[serde(default)]
    pub method: CollocationMethod,
    #[serde(default)]
    pub backend: EvalBackend,
    pub objective: ObjectiveDef,
    #[serde(default)]
    pub initial_guess: InitialGuessDef,
    #[serde(default)]
    pub solver: SolveOptions,
}

fn default_time() -> String {
    "t".to_string()
}

/// Equations of motion as expression strings.
///
/// ```yaml
/// equations:
///   implicit:
///     - der(x) - v
///     - der(v) + k * x
/// ```
///
/// or
///
/// ```yaml
/// equations:
///   mass_matrix:
///     mass: [["1", "0"], ["0", "m"]]
///     forcing: ["v", "-k * x"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EquationsDef {
    Implicit(Vec<String>),
    MassMatrix {
        mass: Vec<Vec<String>>,
        forcing: Vec<String>,
    },
}

impl EquationsDef {
    pub fn len(&self) -> usize {
        match self {
            EquationsDef::Implicit(eqs) => eqs.len(),
            EquationsDef::MassMatrix { forcing, .. } => forcing.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Node interval: a number, the keyword `free` (interval symbol `h`), or
/// `{ free: name }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IntervalDef {
    Fixed(f64),
    Keyword(String),
    Named { free: String },
}

pub const FREE_KEYWORD: &str = "free";
pub const DEFAULT_INTERVAL_SYMBOL: &str = "h";

impl IntervalDef {
    /// Name of the interval symbol when the interval is free.
    pub fn free_symbol(&self) -> Option<&str> {
        match self {
            IntervalDef::Fixed(_) => None,
            IntervalDef::Keyword(_) => Some(DEFAULT_INTERVAL_SYMBOL),
            IntervalDef::Named { free } => Some(free),
        }
    }
}

/// A constraint expression with optional bounds. A bare string, or a map
/// without bounds, is an equality to zero. Only `lower` leaves the upper side
/// open and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConstraintDef {
    Equality(String),
    Bounded {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lower: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper: Option<f64>,
    },
}

impl ConstraintDef {
    pub fn expr(&self) -> &str {
        match self {
            ConstraintDef::Equality(expr) | ConstraintDef::Bounded { expr, .. } => expr,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        match self {
            ConstraintDef::Equality(_)
            | ConstraintDef::Bounded {
                lower: None,
                upper: None,
                ..
            } => (0.0, 0.0),
            ConstraintDef::Bounded { lower, upper, .. } => (
                lower.unwrap_or(f64::NEG_INFINITY),
                upper.unwrap_or(f64::INFINITY),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectiveDef {
    /// Minimize the free node interval.
    MinimizeInterval,
    /// Quadrature of `r^2` over unknown trajectories, with node weights
    /// matching the collocation method.
    ControlEffort { trajectories: Vec<String> },
    /// Quadrature of `(x - measured)^2` over states.
    Tracking {
        measurements: BTreeMap<String, Vec<f64>>,
    },
    /// Sum of free parameters.
    ParameterSum { parameters: Vec<String> },
}

/// The one initial guess of a scenario. Entities not named are filled with
/// `fill`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct InitialGuessDef {
    pub fill: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, Vec<f64>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub trajectories: BTreeMap<String, Vec<f64>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, f64>,
    /// Required exactly when the interval is free.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equations_accept_map_form() {
        let implicit: Scenario = serde_yaml::from_str(
            "version: 1\nname: a\nstates: [x]\nequations:\n  implicit:\n    - der(x) + x\n\
             num_nodes: 3\ninterval: 0.5\nobjective:\n  type: minimize_interval\n",
        )
        .unwrap();
        assert_eq!(
            implicit.equations,
            EquationsDef::Implicit(vec!["der(x) + x".to_string()])
        );

        let mass: Scenario = serde_yaml::from_str(
            "version: 1\nname: b\nstates: [x]\nequations:\n  mass_matrix:\n    mass: [[\"2\"]]\n    forcing: [\"-x\"]\n\
             num_nodes: 3\ninterval: free\nobjective:\n  type: minimize_interval\n",
        )
        .unwrap();
        assert_eq!(mass.equations.len(), 1);
        assert!(matches!(mass.equations, EquationsDef::MassMatrix { .. }));
        assert_eq!(mass.interval.free_symbol(), Some(DEFAULT_INTERVAL_SYMBOL));

        let yaml = serde_yaml::to_string(&mass).unwrap();
        assert!(yaml.contains("mass_matrix:"));
        assert!(!yaml.contains('!'));
        let json = serde_json::to_string(&mass).unwrap();
        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(back.equations, mass.equations);
    }
}
