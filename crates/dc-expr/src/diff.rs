//! Symbolic differentiation.

use crate::expr::{Atom, Expr, Func};
use crate::symbol::Symbol;

impl Expr {
    /// Partial derivative with respect to one leaf.
    ///
    /// Symbols and `der()` leaves are independent variables. Sampled
    /// trajectories `x(T)` differentiate to zero; resolve them into plain
    /// symbols first (see [`Expr::try_map_at`]).
    pub fn diff_atom(&self, var: &Atom) -> Expr {
        match self {
            Expr::Const(_) | Expr::At(_, _) => Expr::zero(),
            Expr::Sym(s) => match var {
                Atom::Sym(v) if v == s => Expr::one(),
                _ => Expr::zero(),
            },
            Expr::Der(s) => match var {
                Atom::Der(v) if v == s => Expr::one(),
                _ => Expr::zero(),
            },
            Expr::Neg(a) => Expr::neg_expr(a.diff_atom(var)),
            Expr::Add(a, b) => Expr::add_expr(a.diff_atom(var), b.diff_atom(var)),
            Expr::Sub(a, b) => Expr::sub_expr(a.diff_atom(var), b.diff_atom(var)),
            Expr::Mul(a, b) => Expr::add_expr(
                Expr::mul_expr(a.diff_atom(var), (**b).clone()),
                Expr::mul_expr((**a).clone(), b.diff_atom(var)),
            ),
            Expr::Div(a, b) => {
                let da = a.diff_atom(var);
                let db = b.diff_atom(var);
                if db.is_zero() {
                    return Expr::div_expr(da, (**b).clone());
                }
                Expr::div_expr(
                    Expr::sub_expr(
                        Expr::mul_expr(da, (**b).clone()),
                        Expr::mul_expr((**a).clone(), db),
                    ),
                    Expr::pow_expr((**b).clone(), Expr::Const(2.0)),
                )
            }
            Expr::Pow(base, exponent) => diff_pow(base, exponent, var),
            Expr::Func(f, a) => {
                let da = a.diff_atom(var);
                if da.is_zero() {
                    return Expr::zero();
                }
                Expr::mul_expr(func_derivative(*f, a), da)
            }
        }
    }

    /// Partial derivative with respect to a plain symbol.
    pub fn diff(&self, var: &Symbol) -> Expr {
        self.diff_atom(&Atom::Sym(var.clone()))
    }
}

fn diff_pow(base: &Expr, exponent: &Expr, var: &Atom) -> Expr {
    let db = base.diff_atom(var);
    let de = exponent.diff_atom(var);
    match exponent.as_const() {
        // d(b^c) = c b^(c-1) b'
        Some(c) => Expr::mul_expr(
            Expr::mul_expr(
                Expr::Const(c),
                Expr::pow_expr(base.clone(), Expr::Const(c - 1.0)),
            ),
            db,
        ),
        // d(b^e) = b^e (e' ln b + e b'/b)
        None => {
            let log_term = Expr::mul_expr(de, Expr::func_expr(Func::Ln, base.clone()));
            let base_term = Expr::div_expr(Expr::mul_expr(exponent.clone(), db), base.clone());
            Expr::mul_expr(
                Expr::pow_expr(base.clone(), exponent.clone()),
                Expr::add_expr(log_term, base_term),
            )
        }
    }
}

/// f'(u) for the outer function, without the chain factor.
fn func_derivative(f: Func, u: &Expr) -> Expr {
    let u = u.clone();
    match f {
        Func::Sin => u.cos(),
        Func::Cos => Expr::neg_expr(u.sin()),
        Func::Tan => Expr::div_expr(Expr::one(), u.cos().powi(2)),
        Func::Exp => u.exp(),
        Func::Ln => Expr::div_expr(Expr::one(), u),
        Func::Sqrt => Expr::div_expr(Expr::Const(0.5), u.sqrt()),
        Func::Abs => Expr::div_expr(u.clone(), u.abs()),
        Func::Tanh => Expr::sub_expr(Expr::one(), u.tanh().powi(2)),
        Func::Asin => Expr::div_expr(
            Expr::one(),
            Expr::sub_expr(Expr::one(), u.powi(2)).sqrt(),
        ),
        Func::Acos => Expr::div_expr(
            Expr::Const(-1.0),
            Expr::sub_expr(Expr::one(), u.powi(2)).sqrt(),
        ),
        Func::Atan => Expr::div_expr(Expr::one(), Expr::add_expr(Expr::one(), u.powi(2))),
    }
}
