//! Text front end for expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! sum     := product (('+' | '-') product)*
//! product := unary (('*' | '/') unary)*
//! unary   := '-' unary | power
//! power   := primary (('^' | '**') unary)?
//! primary := number | 'pi' | '(' sum ')'
//!          | 'der' '(' name ')' | func '(' sum ')' | name '(' sum ')' | name
//! ```
//!
//! `name(expr)` samples a trajectory at a time. A name is dynamic when it is
//! registered with [`Parser::with_dynamic`], appears inside `der()`, or is
//! sampled; every other name is a constant.

use std::collections::{BTreeSet, HashMap};

use crate::error::{ExprError, ExprResult};
use crate::expr::{Atom, Expr, Func};
use crate::symbol::Symbol;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> ExprResult<Vec<(Token, usize)>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text = &src[start..i];
            let value = text.parse::<f64>().map_err(|_| ExprError::Parse {
                what: format!("invalid number '{text}'"),
                offset: start,
            })?;
            out.push((Token::Num(value), start));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((Token::Ident(src[start..i].to_string()), start));
            continue;
        }
        let tok = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if bytes.get(i + 1) == Some(&b'*') => {
                i += 1;
                Token::Caret
            }
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            other => {
                return Err(ExprError::Parse {
                    what: format!("unexpected character '{other}'"),
                    offset: start,
                });
            }
        };
        i += 1;
        out.push((tok, start));
    }
    Ok(out)
}

/// Expression parser with a set of names known to be trajectories.
#[derive(Clone, Debug, Default)]
pub struct Parser {
    dynamic: BTreeSet<String>,
}

struct Cursor<'a> {
    tokens: &'a [(Token, usize)],
    pos: usize,
    end: usize,
    dynamic: &'a BTreeSet<String>,
    promoted: BTreeSet<String>,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, o)| *o)
    }

    fn error(&self, what: impl Into<String>) -> ExprError {
        ExprError::Parse {
            what: what.into(),
            offset: self.offset(),
        }
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token, what: &str) -> ExprResult<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn sum(&mut self) -> ExprResult<Expr> {
        let mut lhs = self.product()?;
        loop {
            if self.eat(&Token::Plus) {
                lhs = Expr::add_expr(lhs, self.product()?);
            } else if self.eat(&Token::Minus) {
                lhs = Expr::sub_expr(lhs, self.product()?);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn product(&mut self) -> ExprResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat(&Token::Star) {
                lhs = Expr::mul_expr(lhs, self.unary()?);
            } else if self.eat(&Token::Slash) {
                lhs = Expr::div_expr(lhs, self.unary()?);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn unary(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::neg_expr(self.unary()?));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> ExprResult<Expr> {
        let base = self.primary()?;
        if self.eat(&Token::Caret) {
            let exponent = self.unary()?;
            return Ok(Expr::pow_expr(base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> ExprResult<Expr> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input"));
        };
        match tok {
            Token::Num(v) => {
                self.pos += 1;
                Ok(Expr::Const(v))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.sum()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                self.pos += 1;
                self.named(name)
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn named(&mut self, name: String) -> ExprResult<Expr> {
        if name == "pi" {
            return Ok(Expr::Const(std::f64::consts::PI));
        }
        if self.peek() != Some(&Token::LParen) {
            return Ok(if self.dynamic.contains(&name) {
                Symbol::dynamic(&name).expr()
            } else {
                Symbol::constant(&name).expr()
            });
        }
        self.pos += 1;
        if name == "der" {
            let Some(Token::Ident(inner)) = self.peek().cloned() else {
                return Err(self.error("der() takes a symbol name"));
            };
            self.pos += 1;
            self.expect(Token::RParen, "')' after der argument")?;
            self.promoted.insert(inner.clone());
            return Ok(Symbol::dynamic(inner).der());
        }
        let arg = self.sum()?;
        self.expect(Token::RParen, "')'")?;
        if let Some(func) = Func::from_name(&name) {
            return Ok(Expr::func_expr(func, arg));
        }
        self.promoted.insert(name.clone());
        Ok(Symbol::dynamic(name).at(arg))
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register trajectory names.
    pub fn with_dynamic<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dynamic
            .extend(names.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn parse(&self, src: &str) -> ExprResult<Expr> {
        let tokens = tokenize(src)?;
        let mut cursor = Cursor {
            tokens: &tokens,
            pos: 0,
            end: src.len(),
            dynamic: &self.dynamic,
            promoted: BTreeSet::new(),
        };
        let expr = cursor.sum()?;
        if cursor.pos != tokens.len() {
            return Err(cursor.error("trailing input"));
        }

        // Names that turned out to be trajectories are dynamic everywhere.
        let promote: HashMap<Atom, Expr> = cursor
            .promoted
            .iter()
            .filter(|name| !self.dynamic.contains(*name))
            .map(|name| {
                let sym = Symbol::dynamic(name);
                (Atom::Sym(sym.clone()), sym.expr())
            })
            .collect();
        if promote.is_empty() {
            Ok(expr)
        } else {
            Ok(expr.substitute(&promote))
        }
    }
}

/// Parse with no pre-registered trajectories.
pub fn parse(src: &str) -> ExprResult<Expr> {
    Parser::new().parse(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolKind;

    #[test]
    fn precedence_and_associativity() {
        let e = parse("1 + 2 * 3 ^ 2 - 8 / 4 / 2").unwrap();
        assert_eq!(e, Expr::Const(18.0));
        let e = parse("-2 ^ 2").unwrap();
        assert_eq!(e, Expr::Const(-4.0));
        let e = parse("2 ** 3 ** 2").unwrap();
        assert_eq!(e, Expr::Const(512.0));
    }

    #[test]
    fn functions_and_constants() {
        let e = parse("cos(pi) + exp(0) + 1.5e1").unwrap();
        assert_eq!(e, Expr::Const(15.0));
    }

    #[test]
    fn derivative_promotes_name_everywhere() {
        let e = parse("der(x) + k * x").unwrap();
        let kinds: Vec<(String, SymbolKind)> = e
            .symbol_occurrences()
            .iter()
            .map(|s| (s.name().to_string(), s.kind()))
            .collect();
        assert!(kinds.contains(&("x".to_string(), SymbolKind::Dynamic)));
        assert!(!kinds.contains(&("x".to_string(), SymbolKind::Constant)));
        assert!(kinds.contains(&("k".to_string(), SymbolKind::Constant)));
    }

    #[test]
    fn registered_dynamic_and_sampling() {
        let parser = Parser::new().with_dynamic(["u"]);
        let e = parser.parse("u * x(10 * h) - 1").unwrap();
        let samples = e.evaluated_trajectories();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0.name(), "x");
        assert!(e.free_symbols().iter().any(|s| s.name() == "u" && s.is_dynamic()));
    }

    #[test]
    fn errors_carry_offsets() {
        match parse("1 + $") {
            Err(ExprError::Parse { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("unexpected {other:?}"),
        }
        match parse("(1 + 2") {
            Err(ExprError::Parse { offset, .. }) => assert_eq!(offset, 6),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("der(1)").is_err());
        assert!(parse("1 2").is_err());
    }
}
