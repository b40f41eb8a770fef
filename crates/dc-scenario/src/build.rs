//! Conversion of a validated scenario into a collocation problem.

use std::collections::{BTreeMap, BTreeSet};

use dc_collocation::{
    EquationsOfMotion, InstanceConstraint, Interval, PathConstraint, Problem, ProblemBuilder,
    control_effort, minimize_interval, parameter_sum, tracking,
};
use dc_expr::{Expr, Parser, Symbol};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use crate::schema::{ConstraintDef, EquationsDef, IntervalDef, ObjectiveDef, Scenario};
use crate::{ScenarioError, ScenarioResult};

/// A built problem together with the scenario's initial guess.
pub struct BuiltScenario {
    pub problem: Problem,
    pub initial_guess: Vec<f64>,
}

/// Symbols of a scenario, resolved once so every expression agrees on kinds.
struct SymbolTable {
    parser: Parser,
    dynamic: BTreeSet<String>,
}

impl SymbolTable {
    fn new(scenario: &Scenario) -> Self {
        let dynamic: BTreeSet<String> = scenario
            .states
            .iter()
            .chain(&scenario.dynamic)
            .chain(scenario.known_trajectories.keys())
            .cloned()
            .collect();
        Self {
            parser: Parser::new().with_dynamic(&dynamic),
            dynamic,
        }
    }

    fn parse(&self, field: &str, src: &str) -> ScenarioResult<Expr> {
        self.parser.parse(src).map_err(|source| ScenarioError::Expr {
            field: field.to_string(),
            source,
        })
    }

    /// Symbol for a map key. Kind follows the registered names; names that
    /// only become dynamic through `der()` or sampling still compare equal.
    fn symbol(&self, name: &str) -> Symbol {
        if self.dynamic.contains(name) {
            Symbol::dynamic(name)
        } else {
            Symbol::constant(name)
        }
    }

    fn keyed<V: Clone>(&self, map: &BTreeMap<String, V>) -> BTreeMap<Symbol, V> {
        map.iter().map(|(k, v)| (self.symbol(k), v.clone())).collect()
    }
}

fn equations(table: &SymbolTable, def: &EquationsDef) -> ScenarioResult<EquationsOfMotion> {
    Ok(match def {
        EquationsDef::Implicit(eqs) => EquationsOfMotion::Implicit(
            eqs.iter()
                .enumerate()
                .map(|(i, src)| table.parse(&format!("equations[{i}]"), src))
                .collect::<ScenarioResult<_>>()?,
        ),
        EquationsDef::MassMatrix { mass, forcing } => {
            let mut rows = Vec::with_capacity(mass.len());
            for (i, row) in mass.iter().enumerate() {
                rows.push(
                    row.iter()
                        .enumerate()
                        .map(|(j, src)| table.parse(&format!("mass[{i}][{j}]"), src))
                        .collect::<ScenarioResult<Vec<_>>>()?,
                );
            }
            let forcing = forcing
                .iter()
                .enumerate()
                .map(|(i, src)| table.parse(&format!("forcing[{i}]"), src))
                .collect::<ScenarioResult<_>>()?;
            EquationsOfMotion::mass_matrix(rows, forcing)
        }
    })
}

fn constraints<T>(
    table: &SymbolTable,
    kind: &str,
    defs: &[ConstraintDef],
    make: impl Fn(Expr, f64, f64) -> T,
) -> ScenarioResult<Vec<T>> {
    defs.iter()
        .enumerate()
        .map(|(i, c)| {
            let expr = table.parse(&format!("{kind}[{i}]"), c.expr())?;
            let (lower, upper) = c.bounds();
            Ok(make(expr, lower, upper))
        })
        .collect()
}

/// Build the problem and initial guess a scenario describes. The scenario is
/// validated first.
pub fn build_scenario(scenario: &Scenario) -> ScenarioResult<BuiltScenario> {
    crate::validate_scenario(scenario)?;
    let table = SymbolTable::new(scenario);

    let states: Vec<Symbol> = scenario.states.iter().map(Symbol::dynamic).collect();
    let interval = match &scenario.interval {
        IntervalDef::Fixed(h) => Interval::Fixed(*h),
        other => {
            // validated: a free interval always names its symbol
            let name = other.free_symbol().unwrap_or_default();
            Interval::Free(Symbol::constant(name))
        }
    };

    let instance = constraints(
        &table,
        "instance_constraints",
        &scenario.instance_constraints,
        InstanceConstraint::bounded,
    )?;
    let path = constraints(
        &table,
        "path_constraints",
        &scenario.path_constraints,
        PathConstraint::new,
    )?;

    let bounds = scenario
        .bounds
        .iter()
        .map(|(k, [lo, hi])| (table.symbol(k), (*lo, *hi)))
        .collect();

    let objective = scenario.objective.clone();
    let objective_symbols: Vec<Symbol> = match &objective {
        ObjectiveDef::ControlEffort { trajectories } => {
            trajectories.iter().map(Symbol::dynamic).collect()
        }
        ObjectiveDef::ParameterSum { parameters } => {
            parameters.iter().map(Symbol::constant).collect()
        }
        ObjectiveDef::MinimizeInterval | ObjectiveDef::Tracking { .. } => Vec::new(),
    };

    let builder = ProblemBuilder::new(
        equations(&table, &scenario.equations)?,
        states,
        scenario.num_nodes,
        interval,
    )
    .time_symbol(Symbol::constant(&scenario.time))
    .known_parameters(table.keyed(&scenario.known_parameters))
    .known_trajectories(table.keyed(&scenario.known_trajectories))
    .instance_constraints(instance)
    .path_constraints(path)
    .bounds(bounds)
    .free_symbols(scenario.free.iter().map(|s| table.symbol(s)))
    .integration_method(scenario.method)
    .eval_backend(scenario.backend)
    .solve_options(scenario.solver.clone())
    .objective_from(move |layout| match &objective {
        ObjectiveDef::MinimizeInterval => minimize_interval(layout),
        ObjectiveDef::ControlEffort { .. } => control_effort(layout, &objective_symbols),
        ObjectiveDef::ParameterSum { .. } => parameter_sum(layout, &objective_symbols),
        ObjectiveDef::Tracking { measurements } => {
            let measured: Vec<(Symbol, Vec<f64>)> = measurements
                .iter()
                .map(|(k, v)| (Symbol::dynamic(k), v.clone()))
                .collect();
            tracking(layout, &measured)
        }
    });

    let problem = builder.build()?;
    let initial_guess = initial_guess(scenario, &problem)?;
    info!(
        scenario = %scenario.name,
        num_free = problem.num_free(),
        num_constraints = problem.num_constraints(),
        "scenario built"
    );
    Ok(BuiltScenario {
        problem,
        initial_guess,
    })
}

/// Assemble the initial free vector from the scenario's named guesses.
pub fn initial_guess(scenario: &Scenario, problem: &Problem) -> ScenarioResult<Vec<f64>> {
    let guess = &scenario.initial_guess;
    let layout = problem.layout();
    let n = layout.num_nodes();

    let rows = |names: &[Symbol], given: &BTreeMap<String, Vec<f64>>| {
        let mut m = DMatrix::from_element(names.len(), n, guess.fill);
        for (r, name) in names.iter().enumerate() {
            if let Some(values) = given.get(name.name()) {
                m.set_row(r, &DVector::from_column_slice(values).transpose());
            }
        }
        m
    };
    let states = rows(layout.states(), &guess.states);
    let trajectories = rows(layout.trajectories(), &guess.trajectories);

    for name in guess.trajectories.keys() {
        if !layout.trajectories().iter().any(|s| s.name() == name) {
            return Err(ScenarioError::UnknownGuess {
                name: name.clone(),
                kind: "unknown trajectory",
            });
        }
    }
    for name in guess.parameters.keys() {
        if !layout.parameters().iter().any(|s| s.name() == name) {
            return Err(ScenarioError::UnknownGuess {
                name: name.clone(),
                kind: "free parameter",
            });
        }
    }
    let parameters = DVector::from_iterator(
        layout.num_parameters(),
        layout
            .parameters()
            .iter()
            .map(|s| guess.parameters.get(s.name()).copied().unwrap_or(guess.fill)),
    );

    debug!(
        fill = guess.fill,
        named_states = guess.states.len(),
        named_trajectories = guess.trajectories.len(),
        named_parameters = guess.parameters.len(),
        "initial guess assembled"
    );
    Ok(problem.initial_guess_from(&states, &trajectories, &parameters, guess.interval)?)
}
