//! Scalar data types and typed constants.

use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }

    /// The C type name used by source renderers.
    pub fn c_name(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
            DType::I32 => "int",
            DType::I64 => "long long",
            DType::U8 => "unsigned char",
            DType::Bool => "char",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::U8)
    }

    /// Result type of a binary operation between two dtypes, if any.
    ///
    /// Promotion is symmetric and always widens: float beats int,
    /// wider beats narrower. `Bool` only combines with itself.
    pub fn promote(self, other: DType) -> Option<DType> {
        use DType::*;
        if self == other {
            return Some(self);
        }
        match (self, other) {
            (Bool, _) | (_, Bool) => None,
            (F64, _) | (_, F64) => Some(F64),
            (F32, _) | (_, F32) => Some(F32),
            (I64, _) | (_, I64) => Some(I64),
            (I32, _) | (_, I32) => Some(I32),
            _ => Some(U8),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// A typed scalar constant embedded in the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    U8(u8),
    Bool(bool),
}

impl Const {
    pub fn dtype(&self) -> DType {
        match self {
            Const::F32(_) => DType::F32,
            Const::F64(_) => DType::F64,
            Const::I32(_) => DType::I32,
            Const::I64(_) => DType::I64,
            Const::U8(_) => DType::U8,
            Const::Bool(_) => DType::Bool,
        }
    }

    /// Value widened to f64 for evaluation and folding.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Const::F32(v) => v as f64,
            Const::F64(v) => v,
            Const::I32(v) => v as f64,
            Const::I64(v) => v as f64,
            Const::U8(v) => v as f64,
            Const::Bool(v) => v as u8 as f64,
        }
    }

    /// Convert to another dtype with C cast semantics.
    pub fn cast(self, dtype: DType) -> Const {
        let v = self.as_f64();
        match dtype {
            DType::F32 => Const::F32(v as f32),
            DType::F64 => Const::F64(v),
            DType::I32 => Const::I32(v as i32),
            DType::I64 => Const::I64(v as i64),
            DType::U8 => Const::U8(v as u8),
            DType::Bool => Const::Bool(v != 0.0),
        }
    }

    /// Render as a C literal.
    pub fn c_literal(&self) -> String {
        match *self {
            Const::F32(v) => {
                if v == v.trunc() && v.is_finite() {
                    format!("{v:.1}f")
                } else {
                    format!("{v}f")
                }
            }
            Const::F64(v) => {
                if v == v.trunc() && v.is_finite() {
                    format!("{v:.1}")
                } else {
                    format!("{v}")
                }
            }
            Const::I32(v) => format!("{v}"),
            Const::I64(v) => format!("{v}LL"),
            Const::U8(v) => format!("{v}"),
            Const::Bool(v) => format!("{}", v as u8),
        }
    }
}

// Constants participate in node identity, so they need Eq/Hash. Float
// constants hash by bit pattern; two NaN constants with different payloads
// simply fail to deduplicate.
impl Eq for Const {}

impl std::hash::Hash for Const {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match *self {
            Const::F32(v) => v.to_bits().hash(state),
            Const::F64(v) => v.to_bits().hash(state),
            Const::I32(v) => v.hash(state),
            Const::I64(v) => v.hash(state),
            Const::U8(v) => v.hash(state),
            Const::Bool(v) => v.hash(state),
        }
    }
}

impl From<f32> for Const {
    fn from(v: f32) -> Self {
        Const::F32(v)
    }
}

impl From<i64> for Const {
    fn from(v: i64) -> Self {
        Const::I64(v)
    }
}
