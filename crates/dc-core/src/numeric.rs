/// Floating point type used throughout the workspace.
pub type Real = f64;

/// Position of the first non-finite entry, if any.
pub fn first_non_finite(values: &[Real]) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

/// Infinity norm; 0 for an empty slice.
pub fn inf_norm(values: &[Real]) -> Real {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// `n` evenly spaced values on `[start, end]` (inclusive).
pub fn linspace(start: Real, end: Real, n: usize) -> Vec<Real> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as Real;
            (0..n).map(|i| start + step * i as Real).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_non_finite_finds_inf() {
        assert_eq!(first_non_finite(&[1.0, 2.0, Real::INFINITY]), Some(2));
        assert_eq!(first_non_finite(&[Real::NAN, 2.0]), Some(0));
        assert_eq!(first_non_finite(&[1.0, 2.0]), None);
    }

    #[test]
    fn linspace_endpoints() {
        let v = linspace(0.0, 2.0, 5);
        assert_eq!(v, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(3.0, 4.0, 1), vec![3.0]);
    }

    proptest! {
        #[test]
        fn inf_norm_bounds_entries(values in proptest::collection::vec(-1e6f64..1e6, 0..32)) {
            let n = inf_norm(&values);
            for v in &values {
                prop_assert!(v.abs() <= n);
            }
        }
    }
}
