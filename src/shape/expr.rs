//! Symbolic dimension expressions.
//!
//! A tensor dimension is either a concrete size or an integer expression over
//! named variables. Variables are bound to concrete values at schedule time,
//! which lets one compiled plan serve calls with different sizes.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Mul};

use crate::error::ShapeError;

/// Variable bindings supplied by the caller at schedule time.
pub type Bindings = HashMap<String, i64>;

/// An integer expression over dimension variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeExpr {
    Const(i64),
    Var(String),
    Add(Box<Self>, Box<Self>),
    Mul(Box<Self>, Box<Self>),
}

impl ShapeExpr {
    pub fn var(name: impl Into<String>) -> Self {
        ShapeExpr::Var(name.into())
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            ShapeExpr::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, ShapeExpr::Const(_))
    }

    /// Collect the variable names referenced by this expression.
    pub fn variables(&self, out: &mut Vec<String>) {
        match self {
            ShapeExpr::Const(_) => {}
            ShapeExpr::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            ShapeExpr::Add(l, r) | ShapeExpr::Mul(l, r) => {
                l.variables(out);
                r.variables(out);
            }
        }
    }

    /// Evaluate against bindings. Fails with `UnboundVariable` if a variable
    /// has no binding.
    pub fn eval(&self, bindings: &Bindings) -> Result<i64, ShapeError> {
        match self {
            ShapeExpr::Const(v) => Ok(*v),
            ShapeExpr::Var(name) => bindings
                .get(name)
                .copied()
                .ok_or_else(|| ShapeError::UnboundVariable { name: name.clone() }),
            ShapeExpr::Add(l, r) => Ok(l.eval(bindings)? + r.eval(bindings)?),
            ShapeExpr::Mul(l, r) => Ok(l.eval(bindings)? * r.eval(bindings)?),
        }
    }

    /// Fold constant subtrees and strip identities.
    pub fn simplify(self) -> Self {
        match self {
            ShapeExpr::Add(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (l, r) {
                    (ShapeExpr::Const(a), ShapeExpr::Const(b)) => ShapeExpr::Const(a + b),
                    (ShapeExpr::Const(0), e) | (e, ShapeExpr::Const(0)) => e,
                    (l, r) => ShapeExpr::Add(Box::new(l), Box::new(r)),
                }
            }
            ShapeExpr::Mul(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (l, r) {
                    (ShapeExpr::Const(a), ShapeExpr::Const(b)) => ShapeExpr::Const(a * b),
                    (ShapeExpr::Const(1), e) | (e, ShapeExpr::Const(1)) => e,
                    (ShapeExpr::Const(0), _) | (_, ShapeExpr::Const(0)) => ShapeExpr::Const(0),
                    (l, r) => ShapeExpr::Mul(Box::new(l), Box::new(r)),
                }
            }
            other => other,
        }
    }
}

impl From<i64> for ShapeExpr {
    fn from(v: i64) -> Self {
        ShapeExpr::Const(v)
    }
}

impl From<usize> for ShapeExpr {
    fn from(v: usize) -> Self {
        ShapeExpr::Const(v as i64)
    }
}

impl Add for ShapeExpr {
    type Output = ShapeExpr;
    fn add(self, rhs: Self) -> Self::Output {
        ShapeExpr::Add(Box::new(self), Box::new(rhs)).simplify()
    }
}

impl Mul for ShapeExpr {
    type Output = ShapeExpr;
    fn mul(self, rhs: Self) -> Self::Output {
        ShapeExpr::Mul(Box::new(self), Box::new(rhs)).simplify()
    }
}

impl fmt::Display for ShapeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeExpr::Const(v) => write!(f, "{v}"),
            ShapeExpr::Var(name) => write!(f, "{name}"),
            ShapeExpr::Add(l, r) => write!(f, "({l}+{r})"),
            ShapeExpr::Mul(l, r) => write!(f, "({l}*{r})"),
        }
    }
}
