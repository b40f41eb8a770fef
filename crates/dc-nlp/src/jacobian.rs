//! Finite difference Jacobians and sparse/dense conversion.

use nalgebra::{DMatrix, DVector};

/// Compute Jacobian using forward finite differences.
///
/// For each column j, perturbs x[j] by epsilon and computes (f(x+e) - f(x))/epsilon.
pub fn finite_difference_jacobian<F, E>(
    x: &DVector<f64>,
    mut f: F,
    epsilon: f64,
) -> Result<DMatrix<f64>, E>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
{
    let n = x.len();
    let f_x = f(x)?;
    let m = f_x.len();

    let mut jac = DMatrix::zeros(m, n);
    let mut x_perturbed = x.clone();

    for j in 0..n {
        let dx = epsilon * x[j].abs().max(1.0);
        x_perturbed[j] = x[j] + dx;
        let f_perturbed = f(&x_perturbed)?;
        x_perturbed[j] = x[j];

        jac.set_column(j, &((f_perturbed - &f_x) / dx));
    }

    Ok(jac)
}

/// Compute Jacobian using central finite differences (more accurate but 2x cost).
pub fn central_difference_jacobian<F, E>(
    x: &DVector<f64>,
    mut f: F,
    epsilon: f64,
) -> Result<DMatrix<f64>, E>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
{
    let n = x.len();
    let m = f(x)?.len();

    let mut jac = DMatrix::zeros(m, n);
    let mut x_perturbed = x.clone();

    for j in 0..n {
        let dx = epsilon * x[j].abs().max(1.0);

        x_perturbed[j] = x[j] + dx;
        let f_plus = f(&x_perturbed)?;
        x_perturbed[j] = x[j] - dx;
        let f_minus = f(&x_perturbed)?;
        x_perturbed[j] = x[j];

        jac.set_column(j, &((f_plus - f_minus) / (2.0 * dx)));
    }

    Ok(jac)
}

/// Scatter COO triplets into a dense matrix. Duplicate entries are summed.
pub fn dense_from_triplets(
    nrows: usize,
    ncols: usize,
    rows: &[usize],
    cols: &[usize],
    values: &[f64],
) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(nrows, ncols);
    for ((&r, &c), &v) in rows.iter().zip(cols).zip(values) {
        out[(r, c)] += v;
    }
    out
}

/// `y += Jᵀ w` for a COO Jacobian.
pub fn add_transpose_product(rows: &[usize], cols: &[usize], values: &[f64], w: &[f64], y: &mut [f64]) {
    for ((&r, &c), &v) in rows.iter().zip(cols).zip(values) {
        y[c] += v * w[r];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Never = std::convert::Infallible;

    #[test]
    fn jacobian_linear() {
        // f(x) = 2*x, J = 2
        let f = |x: &DVector<f64>| -> Result<DVector<f64>, Never> {
            Ok(DVector::from_element(1, 2.0 * x[0]))
        };

        let x = DVector::from_element(1, 3.0);
        let jac = finite_difference_jacobian(&x, f, 1e-7).unwrap();

        assert!((jac[(0, 0)] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn central_difference_is_sharper() {
        // f(x, y) = (x^3 y, sin y)
        let f = |x: &DVector<f64>| -> Result<DVector<f64>, Never> {
            Ok(DVector::from_vec(vec![x[0].powi(3) * x[1], x[1].sin()]))
        };

        let x = DVector::from_vec(vec![1.5, 0.3]);
        let jac = central_difference_jacobian(&x, f, 1e-5).unwrap();

        assert!((jac[(0, 0)] - 3.0 * 2.25 * 0.3).abs() < 1e-8);
        assert!((jac[(0, 1)] - 3.375).abs() < 1e-8);
        assert!(jac[(1, 0)].abs() < 1e-12);
        assert!((jac[(1, 1)] - 0.3f64.cos()).abs() < 1e-8);
    }

    #[test]
    fn transpose_product_matches_dense() {
        let rows = [0, 1, 1, 0];
        let cols = [0, 0, 2, 0];
        let vals = [1.0, 2.0, 3.0, 4.0];
        let dense = dense_from_triplets(2, 3, &rows, &cols, &vals);
        assert_eq!(dense[(0, 0)], 5.0);

        assert_eq!(dense[(1, 2)], 3.0);

        let w = [0.5, 2.0];
        let mut z = [0.0; 3];
        add_transpose_product(&rows, &cols, &vals, &w, &mut z);
        let expected = dense.transpose() * DVector::from_row_slice(&w);
        assert_eq!(z.to_vec(), expected.as_slice().to_vec());
    }
}
