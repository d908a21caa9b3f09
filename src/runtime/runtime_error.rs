use crate::lang::types::VarType;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    /// Function executing when the error was raised.
    pub function: Option<String>,
    /// Byte offset of the failing instruction within that function.
    pub offset: Option<usize>,
    /// Active functions, outermost first.
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.message)?;

        if let (Some(function), Some(offset)) = (&self.function, self.offset) {
            write!(f, " (in '{}' at {:04})", function, offset)?;
        }

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        RuntimeError {
            message: msg.into(),
            function: None,
            offset: None,
            call_stack: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// Record where the error happened. The first location recorded wins.
    pub fn at(mut self, function: &str, offset: usize) -> Self {
        if self.function.is_none() {
            self.function = Some(function.to_string());
            self.offset = Some(offset);
        }
        self
    }
}

pub fn stack_underflow(op: &str) -> RuntimeError {
    RuntimeError::new(format!("stack underflow in {}", op))
}

pub fn type_error(expected: VarType, found: &str) -> RuntimeError {
    RuntimeError::new(format!("type error: expected {}, got {}", expected, found))
}

pub fn division_by_zero() -> RuntimeError {
    RuntimeError::new("division by zero")
}

pub fn unresolved_native(symbol: &str) -> RuntimeError {
    RuntimeError::new(format!("unresolved native function '{}'", symbol))
}

pub fn call_depth_exceeded(limit: usize, function: &str) -> RuntimeError {
    RuntimeError::new(format!(
        "call depth limit exceeded ({}) - possible infinite recursion in '{}'",
        limit, function
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location_and_stack() {
        let err = division_by_zero()
            .at("f", 12)
            .at("g", 3)
            .with_context("<top>")
            .with_context("f");
        let text = err.to_string();
        assert!(text.starts_with("runtime error: division by zero (in 'f' at 0012)"));
        assert!(text.contains("0: f"));
        assert!(text.contains("1: <top>"));
    }

    #[test]
    fn test_type_error_names_both_sides() {
        let err = type_error(VarType::Integer, "double");
        assert_eq!(err.message, "type error: expected int, got double");
    }
}
