//! Expression tree, smart constructors and structural queries.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::error::{ExprError, ExprResult};
use crate::symbol::Symbol;

/// Elementary functions of one argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
    Tanh,
    Asin,
    Acos,
    Atan,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Sqrt => "sqrt",
            Func::Abs => "abs",
            Func::Tanh => "tanh",
            Func::Asin => "asin",
            Func::Acos => "acos",
            Func::Atan => "atan",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "exp" => Func::Exp,
            "ln" | "log" => Func::Ln,
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "tanh" => Func::Tanh,
            "asin" => Func::Asin,
            "acos" => Func::Acos,
            "atan" => Func::Atan,
            _ => return None,
        })
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tan => x.tan(),
            Func::Exp => x.exp(),
            Func::Ln => x.ln(),
            Func::Sqrt => x.sqrt(),
            Func::Abs => x.abs(),
            Func::Tanh => x.tanh(),
            Func::Asin => x.asin(),
            Func::Acos => x.acos(),
            Func::Atan => x.atan(),
        }
    }
}

/// Symbolic expression.
///
/// `Der` and `At` are leaves: `der(x)` is the time derivative of a state and
/// `x(T)` is a trajectory sampled at time `T` (instance constraints only).
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(f64),
    Sym(Symbol),
    Der(Symbol),
    At(Symbol, Box<Expr>),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Func(Func, Box<Expr>),
}

/// Independent variables of an expression: the leaves that can be
/// differentiated against or bound to a tape slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Atom {
    Sym(Symbol),
    Der(Symbol),
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Sym(s) => write!(f, "{s}"),
            Atom::Der(s) => write!(f, "der({s})"),
        }
    }
}

impl Expr {
    pub fn zero() -> Self {
        Expr::Const(0.0)
    }

    pub fn one() -> Self {
        Expr::Const(1.0)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 1.0)
    }

    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    // Smart constructors fold constants and drop identities so that
    // derivatives of sparse expressions collapse to exact zeros.

    pub fn add_expr(a: Expr, b: Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::Const(x + y),
            (Some(x), _) if x == 0.0 => b,
            (_, Some(y)) if y == 0.0 => a,
            _ => match b {
                Expr::Neg(inner) => Expr::sub_expr(a, *inner),
                b => Expr::Add(Box::new(a), Box::new(b)),
            },
        }
    }

    pub fn sub_expr(a: Expr, b: Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::Const(x - y),
            (_, Some(y)) if y == 0.0 => a,
            (Some(x), _) if x == 0.0 => Expr::neg_expr(b),
            _ if a == b => Expr::zero(),
            _ => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }

    pub fn mul_expr(a: Expr, b: Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::Const(x * y),
            (Some(x), _) if x == 0.0 => Expr::zero(),
            (_, Some(y)) if y == 0.0 => Expr::zero(),
            (Some(x), _) if x == 1.0 => b,
            (_, Some(y)) if y == 1.0 => a,
            (Some(x), _) if x == -1.0 => Expr::neg_expr(b),
            (_, Some(y)) if y == -1.0 => Expr::neg_expr(a),
            _ => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    pub fn div_expr(a: Expr, b: Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::Const(x / y),
            (Some(x), _) if x == 0.0 => Expr::zero(),
            (_, Some(y)) if y == 1.0 => a,
            _ => Expr::Div(Box::new(a), Box::new(b)),
        }
    }

    pub fn neg_expr(a: Expr) -> Expr {
        match a {
            Expr::Const(c) => Expr::Const(-c),
            Expr::Neg(inner) => *inner,
            a => Expr::Neg(Box::new(a)),
        }
    }

    pub fn pow_expr(base: Expr, exponent: Expr) -> Expr {
        match (base.as_const(), exponent.as_const()) {
            (Some(b), Some(e)) => Expr::Const(b.powf(e)),
            (_, Some(e)) if e == 0.0 => Expr::one(),
            (_, Some(e)) if e == 1.0 => base,
            (Some(b), _) if b == 1.0 => Expr::one(),
            _ => Expr::Pow(Box::new(base), Box::new(exponent)),
        }
    }

    pub fn func_expr(func: Func, arg: Expr) -> Expr {
        match arg.as_const() {
            Some(c) if func.apply(c).is_finite() => Expr::Const(func.apply(c)),
            _ => Expr::Func(func, Box::new(arg)),
        }
    }

    pub fn powf(self, exponent: impl Into<Expr>) -> Expr {
        Expr::pow_expr(self, exponent.into())
    }

    pub fn powi(self, exponent: i32) -> Expr {
        Expr::pow_expr(self, Expr::Const(exponent as f64))
    }

    pub fn sin(self) -> Expr {
        Expr::func_expr(Func::Sin, self)
    }

    pub fn cos(self) -> Expr {
        Expr::func_expr(Func::Cos, self)
    }

    pub fn tan(self) -> Expr {
        Expr::func_expr(Func::Tan, self)
    }

    pub fn exp(self) -> Expr {
        Expr::func_expr(Func::Exp, self)
    }

    pub fn ln(self) -> Expr {
        Expr::func_expr(Func::Ln, self)
    }

    pub fn sqrt(self) -> Expr {
        Expr::func_expr(Func::Sqrt, self)
    }

    pub fn abs(self) -> Expr {
        Expr::func_expr(Func::Abs, self)
    }

    pub fn tanh(self) -> Expr {
        Expr::func_expr(Func::Tanh, self)
    }

    pub fn asin(self) -> Expr {
        Expr::func_expr(Func::Asin, self)
    }

    pub fn acos(self) -> Expr {
        Expr::func_expr(Func::Acos, self)
    }

    pub fn atan(self) -> Expr {
        Expr::func_expr(Func::Atan, self)
    }

    /// Rebuild bottom-up through the smart constructors.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) | Expr::Der(_) => self.clone(),
            Expr::At(s, t) => Expr::At(s.clone(), Box::new(t.simplify())),
            Expr::Neg(a) => Expr::neg_expr(a.simplify()),
            Expr::Add(a, b) => Expr::add_expr(a.simplify(), b.simplify()),
            Expr::Sub(a, b) => Expr::sub_expr(a.simplify(), b.simplify()),
            Expr::Mul(a, b) => Expr::mul_expr(a.simplify(), b.simplify()),
            Expr::Div(a, b) => Expr::div_expr(a.simplify(), b.simplify()),
            Expr::Pow(a, b) => Expr::pow_expr(a.simplify(), b.simplify()),
            Expr::Func(f, a) => Expr::func_expr(*f, a.simplify()),
        }
    }

    /// True if a literal NaN or infinity survived simplification.
    pub fn has_non_finite_constant(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Const(c) = e {
                found |= !c.is_finite();
            }
        });
        found
    }

    /// Pre-order traversal.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Const(_) | Expr::Sym(_) | Expr::Der(_) => {}
            Expr::At(_, t) => t.visit(f),
            Expr::Neg(a) | Expr::Func(_, a) => a.visit(f),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Pow(a, b) => {
                a.visit(f);
                b.visit(f);
            }
        }
    }

    /// Every symbol mentioned anywhere, including inside `der()` and
    /// sampled trajectories and their time expressions.
    pub fn free_symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| match e {
            Expr::Sym(s) | Expr::Der(s) | Expr::At(s, _) => {
                out.insert(s.clone());
            }
            _ => {}
        });
        out
    }

    /// Every occurrence of each symbol, with the kind it was written with.
    /// Used to detect a name used both as a constant and a trajectory.
    pub fn symbol_occurrences(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        self.visit(&mut |e| match e {
            Expr::Sym(s) | Expr::Der(s) | Expr::At(s, _) => out.push(s.clone()),
            _ => {}
        });
        out
    }

    /// Symbols appearing inside `der()`.
    pub fn derivative_symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Der(s) = e {
                out.insert(s.clone());
            }
        });
        out
    }

    /// Sampled trajectories `x(T)` in traversal order.
    pub fn evaluated_trajectories(&self) -> Vec<(Symbol, Expr)> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::At(s, t) = e {
                out.push((s.clone(), (**t).clone()));
            }
        });
        out
    }

    /// Differentiable leaves.
    pub fn atoms(&self) -> BTreeSet<Atom> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| match e {
            Expr::Sym(s) => {
                out.insert(Atom::Sym(s.clone()));
            }
            Expr::Der(s) => {
                out.insert(Atom::Der(s.clone()));
            }
            _ => {}
        });
        out
    }

    /// Replace leaves found in `map`; everything else is kept.
    pub fn substitute(&self, map: &HashMap<Atom, Expr>) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Sym(s) => map
                .get(&Atom::Sym(s.clone()))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Expr::Der(s) => map
                .get(&Atom::Der(s.clone()))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Expr::At(s, t) => Expr::At(s.clone(), Box::new(t.substitute(map))),
            Expr::Neg(a) => Expr::neg_expr(a.substitute(map)),
            Expr::Add(a, b) => Expr::add_expr(a.substitute(map), b.substitute(map)),
            Expr::Sub(a, b) => Expr::sub_expr(a.substitute(map), b.substitute(map)),
            Expr::Mul(a, b) => Expr::mul_expr(a.substitute(map), b.substitute(map)),
            Expr::Div(a, b) => Expr::div_expr(a.substitute(map), b.substitute(map)),
            Expr::Pow(a, b) => Expr::pow_expr(a.substitute(map), b.substitute(map)),
            Expr::Func(f, a) => Expr::func_expr(*f, a.substitute(map)),
        }
    }

    /// Replace every sampled trajectory `x(T)` with `f(x, T)`.
    pub fn try_map_at<E>(
        &self,
        f: &mut impl FnMut(&Symbol, &Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        Ok(match self {
            Expr::Const(_) | Expr::Sym(_) | Expr::Der(_) => self.clone(),
            Expr::At(s, t) => f(s, t)?,
            Expr::Neg(a) => Expr::neg_expr(a.try_map_at(f)?),
            Expr::Add(a, b) => Expr::add_expr(a.try_map_at(f)?, b.try_map_at(f)?),
            Expr::Sub(a, b) => Expr::sub_expr(a.try_map_at(f)?, b.try_map_at(f)?),
            Expr::Mul(a, b) => Expr::mul_expr(a.try_map_at(f)?, b.try_map_at(f)?),
            Expr::Div(a, b) => Expr::div_expr(a.try_map_at(f)?, b.try_map_at(f)?),
            Expr::Pow(a, b) => Expr::pow_expr(a.try_map_at(f)?, b.try_map_at(f)?),
            Expr::Func(func, a) => Expr::func_expr(*func, a.try_map_at(f)?),
        })
    }

    /// Direct recursive evaluation. Slow; meant for one-off values such as
    /// instance times. Hot-path evaluation goes through [`crate::Tape`].
    pub fn eval_with(&self, lookup: &impl Fn(&Atom) -> Option<f64>) -> ExprResult<f64> {
        Ok(match self {
            Expr::Const(c) => *c,
            Expr::Sym(s) => {
                let atom = Atom::Sym(s.clone());
                lookup(&atom).ok_or_else(|| ExprError::Unbound {
                    atom: atom.to_string(),
                })?
            }
            Expr::Der(s) => {
                let atom = Atom::Der(s.clone());
                lookup(&atom).ok_or_else(|| ExprError::Unbound {
                    atom: atom.to_string(),
                })?
            }
            Expr::At(s, _) => {
                return Err(ExprError::UnresolvedTimeEvaluation {
                    symbol: s.to_string(),
                });
            }
            Expr::Neg(a) => -a.eval_with(lookup)?,
            Expr::Add(a, b) => a.eval_with(lookup)? + b.eval_with(lookup)?,
            Expr::Sub(a, b) => a.eval_with(lookup)? - b.eval_with(lookup)?,
            Expr::Mul(a, b) => a.eval_with(lookup)? * b.eval_with(lookup)?,
            Expr::Div(a, b) => a.eval_with(lookup)? / b.eval_with(lookup)?,
            Expr::Pow(a, b) => a.eval_with(lookup)?.powf(b.eval_with(lookup)?),
            Expr::Func(f, a) => f.apply(a.eval_with(lookup)?),
        })
    }

    /// Evaluate with a name → value map for symbols.
    pub fn eval_map(&self, values: &HashMap<Symbol, f64>) -> ExprResult<f64> {
        self.eval_with(&|atom| match atom {
            Atom::Sym(s) => values.get(s).copied(),
            Atom::Der(_) => None,
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Der(s) => write!(f, "der({s})"),
            Expr::At(s, t) => write!(f, "{s}({t})"),
            Expr::Neg(a) => write!(f, "-({a})"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a} * {b})"),
            Expr::Div(a, b) => write!(f, "({a} / {b})"),
            Expr::Pow(a, b) => write!(f, "({a} ^ {b})"),
            Expr::Func(func, a) => write!(f, "{}({a})", func.name()),
        }
    }
}

impl From<f64> for Expr {
    fn from(c: f64) -> Self {
        Expr::Const(c)
    }
}

impl From<Symbol> for Expr {
    fn from(s: Symbol) -> Self {
        Expr::Sym(s)
    }
}

impl From<&Symbol> for Expr {
    fn from(s: &Symbol) -> Self {
        Expr::Sym(s.clone())
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self {
        e.clone()
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $ctor:path) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(self, rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(self.clone(), rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Symbol {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(self.expr(), rhs.into())
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $ctor(Expr::Const(self), rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $ctor(Expr::Const(self), rhs.clone())
            }
        }

        impl $trait<&Symbol> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Symbol) -> Expr {
                $ctor(Expr::Const(self), rhs.expr())
            }
        }
    };
}

impl_binary_op!(Add, add, Expr::add_expr);
impl_binary_op!(Sub, sub, Expr::sub_expr);
impl_binary_op!(Mul, mul, Expr::mul_expr);
impl_binary_op!(Div, div, Expr::div_expr);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::neg_expr(self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::neg_expr(self.clone())
    }
}

impl Neg for &Symbol {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::neg_expr(self.expr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fold_constants() {
        let x = Symbol::constant("x");
        assert_eq!(Expr::Const(2.0) + 3.0, Expr::Const(5.0));
        assert_eq!(&x * 0.0, Expr::zero());
        assert_eq!(&x * 1.0, x.expr());
        assert_eq!(&x - &x, Expr::zero());
        assert_eq!(x.expr().powi(1), x.expr());
        assert_eq!(-(-x.expr()), x.expr());
    }

    #[test]
    fn free_symbols_cover_all_leaf_kinds() {
        let x = Symbol::dynamic("x");
        let k = Symbol::constant("k");
        let h = Symbol::constant("h");
        let e = x.der() + &k * x.expr() + x.at(10.0 * &h);
        let names: Vec<String> = e.free_symbols().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["h", "k", "x"]);
        assert_eq!(e.derivative_symbols().len(), 1);
        assert_eq!(e.evaluated_trajectories().len(), 1);
    }

    #[test]
    fn substitute_and_eval() {
        let x = Symbol::constant("x");
        let y = Symbol::constant("y");
        let e = (&x * 2.0 + y.expr().sin()).powi(2);
        let mut map = HashMap::new();
        map.insert(Atom::Sym(y.clone()), Expr::Const(0.0));
        let s = e.substitute(&map);
        assert!(!s.free_symbols().contains(&y));

        let mut values = HashMap::new();
        values.insert(x, 1.5);
        assert!((s.eval_map(&values).unwrap() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn eval_reports_unbound() {
        let e = Symbol::constant("q").expr() + 1.0;
        let err = e.eval_map(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ExprError::Unbound { .. }));
    }

    #[test]
    fn map_at_replaces_samples() {
        let x = Symbol::dynamic("x");
        let e = x.at(0.0) - 1.0;
        let mapped: Result<Expr, ()> =
            e.try_map_at(&mut |s, _| Ok(Symbol::constant(format!("{s}_0")).expr()));
        let mapped = mapped.unwrap();
        assert!(mapped.evaluated_trajectories().is_empty());
        assert_eq!(mapped.to_string(), "(x_0 - 1)");
    }

    #[test]
    fn detects_non_finite_literal() {
        let e = Expr::Const(1.0) / 0.0;
        assert!(e.has_non_finite_constant());
        assert!(!(Expr::Const(1.0) + 2.0).has_non_finite_constant());
    }
}
