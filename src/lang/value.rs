use super::types::VarType;
use serde::{Deserialize, Serialize};

/// Runtime value in a Cinder program.
///
/// Values are the only data that can exist on the operand stack or in a
/// variable slot. Strings are never stored inline: a `StringRef` is an
/// index into the string pool of the program being executed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer.
    Integer(i64),

    /// 64-bit floating-point number.
    Double(f64),

    /// Index into the string pool.
    StringRef(u16),
}

impl Value {
    /// The static type this value inhabits.
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Integer(_) => VarType::Integer,
            Value::Double(_) => VarType::Double,
            Value::StringRef(_) => VarType::String,
        }
    }

    /// Zero value for a slot of the given type.
    pub fn zero(ty: VarType) -> Self {
        match ty {
            VarType::Double => Value::Double(0.0),
            VarType::String => Value::StringRef(0),
            _ => Value::Integer(0),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Integer(0)
    }
}

impl std::fmt::Display for Value {
    /// Format a value for diagnostics. Strings show their pool id, since
    /// the pool is not reachable from here.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::Double(n) => write!(f, "{}", n),
            Value::StringRef(id) => write!(f, "@{}", id),
        }
    }
}
