//! The FX value model.
//!
//! Every runtime value is a 32 bit cell. `i32` cells hold plain integers,
//! `f16` cells hold Q16.16 fixed point (value × 65536), and `gfx16` cells
//! hold packed pixel data which is never implicitly converted to anything
//! else. Strings exist only as metadata (published names, library call
//! targets); they never occupy a register.

use strum::{EnumIter, EnumString};

/// Q16.16 scale factor
pub const F16_ONE: i32 = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    I32,
    /// Q16.16 fixed point
    F16,
    /// Packed pixel value, exempt from implicit conversion
    Gfx16,
    Str,
    Array {
        elem: Box<ValueType>,
        len: u32,
    },
    /// Named-field aggregate; only reachable through attribute chains
    Struct {
        fields: Vec<(crate::intern::InternedSymbol, ValueType)>,
    },
    /// Handle to the pixel-array object of the output fixture
    PixBuf,
    /// Reference to a database attribute whose type is unknown until runtime
    DbRef,
}

impl ValueType {
    pub fn is_scalar(&self) -> bool {
        matches!(self, ValueType::I32 | ValueType::F16 | ValueType::Gfx16)
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, ValueType::F16)
    }
}

impl core::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::I32 => write!(f, "i32"),
            ValueType::F16 => write!(f, "f16"),
            ValueType::Gfx16 => write!(f, "gfx16"),
            ValueType::Str => write!(f, "str"),
            ValueType::Array { elem, len } => write!(f, "{elem}[{len}]"),
            ValueType::Struct { fields } => write!(f, "struct({})", fields.len()),
            ValueType::PixBuf => write!(f, "pixbuf"),
            ValueType::DbRef => write!(f, "dbref"),
        }
    }
}

/// Binary operators of the FX expression language. Comparisons always
/// produce an `i32` result regardless of operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter)]
pub enum BinOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

impl core::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Converts a literal like `123.456` to its Q16.16 raw encoding
/// (truncating, not rounding).
pub fn f16_from_f64(value: f64) -> i32 {
    (value * F16_ONE as f64) as i32
}

pub fn f16_to_f64(raw: i32) -> f64 {
    raw as f64 / F16_ONE as f64
}

/// Evaluates a binary operator over raw 32 bit cells. `fixed` selects the
/// Q16.16 rules for multiply and divide. Division and modulo by zero
/// saturate to zero; the builder rejects literal zero divisors before this
/// is ever reached at compile time, and the VM shares this function so the
/// runtime behavior is identical by construction.
pub fn eval_binop(op: BinOp, fixed: bool, lhs: i32, rhs: i32) -> i32 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => {
            if fixed {
                ((lhs as i64 * rhs as i64) / F16_ONE as i64) as i32
            } else {
                lhs.wrapping_mul(rhs)
            }
        }
        BinOp::Div => {
            if rhs == 0 {
                0
            } else if fixed {
                ((lhs as i64 * F16_ONE as i64) / rhs as i64) as i32
            } else {
                lhs.wrapping_div(rhs)
            }
        }
        BinOp::Mod => {
            if rhs == 0 {
                0
            } else {
                lhs.wrapping_rem(rhs)
            }
        }
        BinOp::And => ((lhs != 0) && (rhs != 0)) as i32,
        BinOp::Or => ((lhs != 0) || (rhs != 0)) as i32,
        BinOp::Eq => (lhs == rhs) as i32,
        BinOp::Ne => (lhs != rhs) as i32,
        BinOp::Lt => (lhs < rhs) as i32,
        BinOp::Le => (lhs <= rhs) as i32,
        BinOp::Gt => (lhs > rhs) as i32,
        BinOp::Ge => (lhs >= rhs) as i32,
    }
}
