use std::path::{Path, PathBuf};

use dc_collocation::CollocationError;
use dc_nlp::SolveStatus;
use dc_scenario::{
    ScenarioError, ValidationError, build_scenario, from_yaml_str, load_yaml, save_yaml,
};

fn scenario_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../apps/dc-cli/scenarios")
}

const SAMPLES: [&str; 4] = [
    "double_integrator.yaml",
    "decay_identification.yaml",
    "spring_identification.yaml",
    "minimum_time.yaml",
];

const MINIMAL: &str = r#"
version: 1
name: minimal
states: [x]
equations:
  implicit:
    - der(x) + x
num_nodes: 5
interval: 0.25
instance_constraints:
  - x(0) - 1
objective:
  type: tracking
  measurements:
    x: [1.0, 0.8, 0.6, 0.5, 0.4]
"#;

#[test]
fn samples_load_and_build() {
    for name in SAMPLES {
        let scenario = load_yaml(&scenario_dir().join(name))
            .unwrap_or_else(|e| panic!("Failed to load {name}: {e}"));
        let built = build_scenario(&scenario)
            .unwrap_or_else(|e| panic!("Failed to build {name}: {e}"));
        assert_eq!(built.initial_guess.len(), built.problem.num_free(), "{name}");
    }
}

#[test]
fn roundtrip_yaml_samples() {
    for name in SAMPLES {
        let scenario = load_yaml(&scenario_dir().join(name)).unwrap();
        let path = std::env::temp_dir().join(format!("dc_scenario_roundtrip_{name}"));
        save_yaml(&path, &scenario).unwrap();
        let loaded = load_yaml(&path).unwrap();
        assert_eq!(scenario, loaded, "{name}");
    }
}

#[test]
fn minimum_time_layout_has_free_interval() {
    let scenario = load_yaml(&scenario_dir().join("minimum_time.yaml")).unwrap();
    let built = build_scenario(&scenario).unwrap();
    let layout = built.problem.layout();
    assert!(layout.has_free_interval());
    assert_eq!(layout.num_trajectories(), 1);
    let hi = layout.interval_index().unwrap();
    assert_eq!(built.initial_guess[hi], 0.15);
    // 2 x 20 defects, 4 instance rows, 21 path rows
    assert_eq!(built.problem.num_constraints(), 40 + 4 + 21);
}

#[test]
fn decay_rate_is_identified() {
    let scenario = load_yaml(&scenario_dir().join("decay_identification.yaml")).unwrap();
    let built = build_scenario(&scenario).unwrap();
    let solution = built.problem.solve(&built.initial_guess).unwrap();
    assert_eq!(solution.status(), SolveStatus::Converged);
    let c = solution.free.parameter("c").unwrap();
    // Midpoint defects bias the estimate by O(h^2).
    assert!((c - 2.0).abs() < 0.02, "c = {c}");
}

#[test]
fn double_integrator_reaches_target() {
    let scenario = load_yaml(&scenario_dir().join("double_integrator.yaml")).unwrap();
    let built = build_scenario(&scenario).unwrap();
    let solution = built.problem.solve(&built.initial_guess).unwrap();
    assert_eq!(solution.status(), SolveStatus::Converged);
    let x = solution.free.state("x").unwrap();
    assert!((x[20] - 1.0).abs() < 1e-5);
    let violations = built.problem.constraint_violations(&solution.x).unwrap();
    assert!(violations.max_abs() < 1e-5);
}

#[test]
fn unsupported_version_is_rejected() {
    let yaml = MINIMAL.replace("version: 1", "version: 7");
    assert!(matches!(
        from_yaml_str(&yaml),
        Err(ScenarioError::Validation(ValidationError::UnsupportedVersion { version: 7 }))
    ));
}

#[test]
fn free_interval_needs_a_guess() {
    let yaml = MINIMAL.replace("interval: 0.25", "interval: free");
    assert!(matches!(
        from_yaml_str(&yaml),
        Err(ScenarioError::Validation(ValidationError::InvalidValue { .. }))
    ));
    let yaml = MINIMAL.replace("interval: 0.25", "interval: sometimes");
    assert!(from_yaml_str(&yaml).is_err());
}

#[test]
fn measurement_length_is_checked() {
    let yaml = MINIMAL.replace("[1.0, 0.8, 0.6, 0.5, 0.4]", "[1.0, 0.8]");
    assert!(matches!(
        from_yaml_str(&yaml),
        Err(ScenarioError::Validation(ValidationError::InvalidValue { .. }))
    ));
}

#[test]
fn parse_errors_name_the_field() {
    let yaml = MINIMAL.replace("der(x) + x", "der(x) + * x");
    let scenario = from_yaml_str(&yaml).unwrap();
    match build_scenario(&scenario) {
        Err(ScenarioError::Expr { field, .. }) => assert_eq!(field, "equations[0]"),
        Err(other) => panic!("unexpected {other}"),
        Ok(_) => panic!("expected a parse error"),
    }
}

#[test]
fn undeclared_symbol_is_a_configuration_error() {
    let yaml = MINIMAL.replace("der(x) + x", "der(x) + a * x");
    let scenario = from_yaml_str(&yaml).unwrap();
    assert!(matches!(
        build_scenario(&scenario),
        Err(ScenarioError::Problem(CollocationError::Configuration { .. }))
    ));

    let declared = yaml.replace("interval: 0.25", "interval: 0.25\nfree: [a]");
    let scenario = from_yaml_str(&declared).unwrap();
    let built = build_scenario(&scenario).unwrap();
    assert_eq!(built.problem.layout().num_parameters(), 1);
}

#[test]
fn objective_must_reference_free_unknowns() {
    let yaml = MINIMAL.replace(
        "  type: tracking\n  measurements:\n    x: [1.0, 0.8, 0.6, 0.5, 0.4]",
        "  type: control_effort\n  trajectories: [u]",
    );
    assert!(matches!(
        from_yaml_str(&yaml),
        Err(ScenarioError::Validation(ValidationError::MissingReference { .. }))
    ));
}

#[test]
fn initial_guess_must_name_unknowns() {
    let yaml = format!(
        "{MINIMAL}initial_guess:\n  trajectories:\n    u: [0.0, 0.0, 0.0, 0.0, 0.0]\n"
    );
    let scenario = from_yaml_str(&yaml).unwrap();
    assert!(matches!(
        build_scenario(&scenario),
        Err(ScenarioError::UnknownGuess { .. })
    ));
}
