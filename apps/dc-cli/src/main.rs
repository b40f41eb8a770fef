use clap::{Parser, Subcommand};
use dc_collocation::{EntityKind, NamedSolution, Problem};
use dc_core::timing::{self, eval_timing};
use dc_nlp::SolveDiagnostics;
use dc_scenario::{BuiltScenario, ScenarioResult, build_scenario, load_yaml};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dc-cli")]
#[command(about = "Direct collocation for trajectory optimization and parameter identification", long_about = None)]
struct Cli {
    /// Log solver progress (info level unless RUST_LOG says otherwise)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a scenario and build its problem
    Check {
        /// Path to the scenario YAML file
        scenario_path: PathBuf,
    },
    /// Solve a scenario
    Solve {
        /// Path to the scenario YAML file
        scenario_path: PathBuf,
        /// Write the solution as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override the iteration limit from the scenario
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Print the evaluation timing breakdown
        #[arg(long)]
        timing: bool,
    },
    /// Print the free-vector index ranges
    Layout {
        /// Path to the scenario YAML file
        scenario_path: PathBuf,
        /// Print the ranges as JSON
        #[arg(long)]
        json: bool,
    },
}

/// What `solve --output` writes.
#[derive(Serialize)]
struct SolutionReport<'a> {
    scenario: &'a str,
    diagnostics: &'a SolveDiagnostics,
    max_constraint_violation: f64,
    solution: NamedSolution,
}

fn main() -> ScenarioResult<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Check { scenario_path } => cmd_check(&scenario_path),
        Commands::Solve {
            scenario_path,
            output,
            max_iterations,
            timing,
        } => cmd_solve(&scenario_path, output.as_deref(), max_iterations, timing),
        Commands::Layout {
            scenario_path,
            json,
        } => cmd_layout(&scenario_path, json),
    }
}

fn load_and_build(scenario_path: &Path) -> ScenarioResult<(String, BuiltScenario)> {
    let scenario = load_yaml(scenario_path)?;
    let built = build_scenario(&scenario)?;
    Ok((scenario.name, built))
}

fn print_summary(problem: &Problem) {
    let layout = problem.layout();
    let names = |symbols: &[dc_expr::Symbol]| {
        symbols
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("  Nodes: {}", layout.num_nodes());
    match layout.grid().fixed_interval() {
        Some(h) => println!("  Interval: {h}"),
        None => println!("  Interval: free"),
    }
    println!("  States: [{}]", names(layout.states()));
    println!("  Unknown trajectories: [{}]", names(layout.trajectories()));
    println!("  Free parameters: [{}]", names(layout.parameters()));
    println!("  Free variables: {}", problem.num_free());
    println!("  Constraints: {}", problem.num_constraints());
    println!("  Jacobian non-zeros: {}", problem.jacobian_nonzeros());
}

fn cmd_check(scenario_path: &Path) -> ScenarioResult<()> {
    println!("Checking scenario: {}", scenario_path.display());
    let (name, built) = load_and_build(scenario_path)?;
    println!("✓ Scenario '{name}' is valid");
    print_summary(&built.problem);
    Ok(())
}

fn cmd_solve(
    scenario_path: &Path,
    output: Option<&Path>,
    max_iterations: Option<usize>,
    timing: bool,
) -> ScenarioResult<()> {
    if timing {
        timing::enable_timing();
    }
    eval_timing::reset_all();
    let (name, mut built) = load_and_build(scenario_path)?;
    if let Some(limit) = max_iterations {
        let mut options = built.problem.solve_options().clone();
        options.ipm.max_iterations = limit;
        built.problem.set_solve_options(options);
    }
    println!("Solving scenario: {name}");
    print_summary(&built.problem);

    let solution = built.problem.solve(&built.initial_guess)?;
    let diagnostics = &solution.diagnostics;
    let violations = built.problem.constraint_violations(&solution.x)?;
    if !diagnostics.status.is_converged() {
        warn!(status = %diagnostics.status, "returning the best iterate found");
    }

    println!();
    println!("  Status: {}", diagnostics.status);
    println!("  Iterations: {}", diagnostics.iterations);
    println!("  Objective: {:.6e}", diagnostics.objective);
    println!("  Constraint violation: {:.3e}", diagnostics.constraint_violation);
    println!("  Dual infeasibility: {:.3e}", diagnostics.dual_infeasibility);
    let named = solution.free.to_named();
    if !named.parameters.is_empty() {
        println!("\nIdentified parameters:");
        for (p, v) in &named.parameters {
            println!("  {p} = {v:.6}");
        }
    }
    if let Some(h) = named.interval {
        println!("\nNode interval: {h:.6} (duration {:.6})", h * (named.times.len() - 1) as f64);
    }

    if timing::is_enabled() {
        println!();
        print!("{}", eval_timing::summary());
    }

    if let Some(path) = output {
        let report = SolutionReport {
            scenario: &name,
            diagnostics,
            max_constraint_violation: violations.max_abs(),
            solution: named,
        };
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("\n✓ Solution written to {}", path.display());
    }
    Ok(())
}

fn cmd_layout(scenario_path: &Path, json: bool) -> ScenarioResult<()> {
    let (_, built) = load_and_build(scenario_path)?;
    let ranges = built.problem.layout().ranges();
    if json {
        println!("{}", serde_json::to_string_pretty(&ranges)?);
        return Ok(());
    }
    println!("{:<20} {:<12} {:>8} {:>8}", "name", "kind", "start", "len");
    for r in ranges {
        let kind = match r.kind {
            EntityKind::State => "state",
            EntityKind::Trajectory => "trajectory",
            EntityKind::Parameter => "parameter",
            EntityKind::Interval => "interval",
        };
        println!("{:<20} {:<12} {:>8} {:>8}", r.name, kind, r.start, r.len);
    }
    println!("total: {}", built.problem.num_free());
    Ok(())
}
