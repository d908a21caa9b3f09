use crate::lang::types::VarType;
use thiserror::Error;

/// Errors raised while translating an AST into bytecode. Any of them aborts
/// translation: no partial program is ever produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Arithmetic or comparison operand that is neither int nor double.
    #[error("type mismatch, required int or double (found {found})")]
    RequiredNumeric { found: VarType },

    /// Operand of `%`, bitwise/logical ops, `!`, conditions and ranges.
    #[error("required int (found {found})")]
    RequiredInt { found: VarType },

    /// Value stored into a variable or passed as an argument whose type
    /// can't be converted to the declared one.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: VarType, found: VarType },

    /// `x += e` / `x -= e` whose combined type differs from `x`'s type.
    #[error("type mismatch: '{var}' is {declared} but '{var} {op} ...' produces {found}")]
    CompoundTypeMismatch {
        var: String,
        op: &'static str,
        declared: VarType,
        found: VarType,
    },

    /// Only raised when `CompileOptions::strict_returns` is set.
    #[error("return type mismatch: function returns {declared}, expression is {found}")]
    ReturnTypeMismatch { declared: VarType, found: VarType },

    #[error("undeclared function '{0}'")]
    UndeclaredFunction(String),

    #[error("undeclared variable '{0}'")]
    UndeclaredVariable(String),

    #[error("'{name}' expects {expected} argument(s), got {found}")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("for loop range must be a '..' expression")]
    MalformedRange,

    #[error("'..' is only allowed as the range of a for loop")]
    RangeOutsideFor,

    #[error("label {label} was never bound")]
    UnboundLabel { label: usize },

    #[error("branch from {at} to {target} does not fit in a 16-bit offset")]
    BranchTooFar { at: usize, target: usize },

    #[error("too many {what} (limit {limit})")]
    LimitExceeded { what: &'static str, limit: usize },

    #[error("in function '{function}': {source}")]
    InFunction {
        function: String,
        #[source]
        source: Box<CompileError>,
    },

    /// Translator fault (shouldn't happen in normal use).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// Attach the name of the function being translated. Errors that
    /// already carry a function keep the innermost one.
    pub fn in_function(self, function: &str) -> Self {
        match self {
            CompileError::InFunction { .. } => self,
            other => CompileError::InFunction {
                function: function.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The error without its function context.
    pub fn root(&self) -> &CompileError {
        match self {
            CompileError::InFunction { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_keep_reference_wording() {
        let numeric = CompileError::RequiredNumeric {
            found: VarType::String,
        };
        assert!(numeric.to_string().starts_with("type mismatch, required int or double"));

        let int = CompileError::RequiredInt {
            found: VarType::Double,
        };
        assert!(int.to_string().starts_with("required int"));
    }

    #[test]
    fn test_in_function_wraps_once() {
        let err = CompileError::UndeclaredFunction("g".to_string())
            .in_function("inner")
            .in_function("outer");
        assert_eq!(err.to_string(), "in function 'inner': undeclared function 'g'");
        assert_eq!(err.root(), &CompileError::UndeclaredFunction("g".to_string()));
    }
}
