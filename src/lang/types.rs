use serde::{Deserialize, Serialize};

/// Static type of a variable, expression, parameter or return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    Integer,
    Double,
    String,
    /// Only meaningful as a return type: nothing is pushed.
    Void,
    Invalid,
}

impl VarType {
    pub fn is_numeric(self) -> bool {
        matches!(self, VarType::Integer | VarType::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            VarType::Integer => "int",
            VarType::Double => "double",
            VarType::String => "string",
            VarType::Void => "void",
            VarType::Invalid => "<invalid>",
        }
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
