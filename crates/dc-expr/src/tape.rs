//! Compilation of expressions into flat evaluation programs.
//!
//! A [`Tape`] is a straight-line list of instructions over indexed input
//! slots. Identical sub-expressions are emitted once, which matters for
//! Jacobian entries that share most of their structure with the residual.

use std::collections::HashMap;

use crate::error::{ExprError, ExprResult};
use crate::expr::{Atom, Expr, Func};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Instr {
    /// Constant stored by bit pattern so instructions can be hashed.
    Const(u64),
    Input(usize),
    Neg(usize),
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Powi(usize, i32),
    Powf(usize, usize),
    Func(Func, usize),
}

/// Compiled multi-output program.
#[derive(Clone, Debug)]
pub struct Tape {
    instrs: Vec<Instr>,
    outputs: Vec<usize>,
    num_inputs: usize,
}

struct Builder<'a, F> {
    instrs: Vec<Instr>,
    seen: HashMap<Instr, usize>,
    slot: &'a F,
    num_inputs: usize,
}

impl<F: Fn(&Atom) -> Option<usize>> Builder<'_, F> {
    fn push(&mut self, instr: Instr) -> usize {
        if let Some(&idx) = self.seen.get(&instr) {
            return idx;
        }
        let idx = self.instrs.len();
        self.instrs.push(instr);
        self.seen.insert(instr, idx);
        idx
    }

    fn input(&mut self, atom: Atom) -> ExprResult<usize> {
        match (self.slot)(&atom) {
            Some(i) if i < self.num_inputs => Ok(self.push(Instr::Input(i))),
            _ => Err(ExprError::Unbound {
                atom: atom.to_string(),
            }),
        }
    }

    fn emit(&mut self, e: &Expr) -> ExprResult<usize> {
        Ok(match e {
            Expr::Const(c) => self.push(Instr::Const(c.to_bits())),
            Expr::Sym(s) => self.input(Atom::Sym(s.clone()))?,
            Expr::Der(s) => self.input(Atom::Der(s.clone()))?,
            Expr::At(s, _) => {
                return Err(ExprError::UnresolvedTimeEvaluation {
                    symbol: s.to_string(),
                });
            }
            Expr::Neg(a) => {
                let a = self.emit(a)?;
                self.push(Instr::Neg(a))
            }
            Expr::Add(a, b) => {
                let (a, b) = (self.emit(a)?, self.emit(b)?);
                self.push(Instr::Add(a, b))
            }
            Expr::Sub(a, b) => {
                let (a, b) = (self.emit(a)?, self.emit(b)?);
                self.push(Instr::Sub(a, b))
            }
            Expr::Mul(a, b) => {
                let (a, b) = (self.emit(a)?, self.emit(b)?);
                self.push(Instr::Mul(a, b))
            }
            Expr::Div(a, b) => {
                let (a, b) = (self.emit(a)?, self.emit(b)?);
                self.push(Instr::Div(a, b))
            }
            Expr::Pow(a, b) => {
                let base = self.emit(a)?;
                match b.as_const() {
                    Some(c) if c.fract() == 0.0 && c.abs() <= i32::MAX as f64 => {
                        self.push(Instr::Powi(base, c as i32))
                    }
                    _ => {
                        let exponent = self.emit(b)?;
                        self.push(Instr::Powf(base, exponent))
                    }
                }
            }
            Expr::Func(f, a) => {
                let a = self.emit(a)?;
                self.push(Instr::Func(*f, a))
            }
        })
    }
}

impl Tape {
    /// Compile `exprs` into one program. `slot` maps every leaf to an input
    /// index below `num_inputs`; any unmapped leaf is an error.
    pub fn compile<F>(exprs: &[Expr], slot: &F, num_inputs: usize) -> ExprResult<Self>
    where
        F: Fn(&Atom) -> Option<usize>,
    {
        let mut builder = Builder {
            instrs: Vec::new(),
            seen: HashMap::new(),
            slot,
            num_inputs,
        };
        let outputs = exprs
            .iter()
            .map(|e| builder.emit(e))
            .collect::<ExprResult<Vec<_>>>()?;
        Ok(Self {
            instrs: builder.instrs,
            outputs,
            num_inputs,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Number of instructions after sharing.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Evaluate all outputs. `scratch` is resized on first use and can be
    /// reused across calls to avoid allocation.
    pub fn eval(&self, inputs: &[f64], scratch: &mut Vec<f64>, out: &mut [f64]) {
        debug_assert_eq!(inputs.len(), self.num_inputs);
        debug_assert_eq!(out.len(), self.outputs.len());
        scratch.resize(self.instrs.len(), 0.0);
        for (i, instr) in self.instrs.iter().enumerate() {
            let v = match *instr {
                Instr::Const(bits) => f64::from_bits(bits),
                Instr::Input(k) => inputs[k],
                Instr::Neg(a) => -scratch[a],
                Instr::Add(a, b) => scratch[a] + scratch[b],
                Instr::Sub(a, b) => scratch[a] - scratch[b],
                Instr::Mul(a, b) => scratch[a] * scratch[b],
                Instr::Div(a, b) => scratch[a] / scratch[b],
                Instr::Powi(a, n) => scratch[a].powi(n),
                Instr::Powf(a, b) => scratch[a].powf(scratch[b]),
                Instr::Func(f, a) => f.apply(scratch[a]),
            };
            scratch[i] = v;
        }
        for (o, &idx) in out.iter_mut().zip(&self.outputs) {
            *o = scratch[idx];
        }
    }

    /// Convenience wrapper that allocates its own buffers.
    pub fn eval_vec(&self, inputs: &[f64]) -> Vec<f64> {
        let mut scratch = Vec::new();
        let mut out = vec![0.0; self.outputs.len()];
        self.eval(inputs, &mut scratch, &mut out);
        out
    }
}
