//! Values and functions that cross the boundary between the interpreter
//! and its host.

use std::collections::HashMap;
use std::fmt;

use crate::lang::types::VarType;

/// A value as the host sees it: strings are owned text, not pool ids.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl HostValue {
    pub fn var_type(&self) -> VarType {
        match self {
            HostValue::Int(_) => VarType::Integer,
            HostValue::Double(_) => VarType::Double,
            HostValue::Str(_) => VarType::String,
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Int(n) => write!(f, "{}", n),
            HostValue::Double(d) => write!(f, "{}", d),
            HostValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Resolves the symbols named by `CALLNATIVE`.
pub trait NativeBridge {
    /// Call `symbol` with arguments in parameter order. `None` means the
    /// symbol is unknown to this bridge.
    fn call(&mut self, symbol: &str, args: &[HostValue]) -> Option<Result<Option<HostValue>, String>>;
}

pub type NativeFn = Box<dyn FnMut(&[HostValue]) -> Result<Option<HostValue>, String>>;

/// A [`NativeBridge`] backed by closures registered by name.
#[derive(Default)]
pub struct NativeTable {
    functions: HashMap<String, NativeFn>,
}

impl NativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        symbol: &str,
        function: impl FnMut(&[HostValue]) -> Result<Option<HostValue>, String> + 'static,
    ) -> &mut Self {
        self.functions.insert(symbol.to_string(), Box::new(function));
        self
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.functions.contains_key(symbol)
    }

    /// `sqrt`, `floor` and `abs` over doubles, and `strlen`.
    pub fn with_math() -> Self {
        let mut table = Self::new();
        table
            .register("sqrt", |args| unary_double(args, f64::sqrt))
            .register("floor", |args| unary_double(args, f64::floor))
            .register("abs", |args| unary_double(args, f64::abs))
            .register("strlen", |args| match args {
                [HostValue::Str(s)] => Ok(Some(HostValue::Int(s.chars().count() as i64))),
                _ => Err("strlen expects one string".to_string()),
            });
        table
    }
}

impl fmt::Debug for NativeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("NativeTable").field("functions", &names).finish()
    }
}

impl NativeBridge for NativeTable {
    fn call(&mut self, symbol: &str, args: &[HostValue]) -> Option<Result<Option<HostValue>, String>> {
        self.functions.get_mut(symbol).map(|function| function(args))
    }
}

fn unary_double(args: &[HostValue], f: fn(f64) -> f64) -> Result<Option<HostValue>, String> {
    match args {
        [HostValue::Double(d)] => Ok(Some(HostValue::Double(f(*d)))),
        [HostValue::Int(n)] => Ok(Some(HostValue::Double(f(*n as f64)))),
        _ => Err(format!("expected one number, got {} argument(s)", args.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_function_is_called() {
        let mut table = NativeTable::new();
        table.register("twice", |args| match args {
            [HostValue::Int(n)] => Ok(Some(HostValue::Int(n * 2))),
            _ => Err("bad args".to_string()),
        });
        assert_eq!(
            table.call("twice", &[HostValue::Int(21)]),
            Some(Ok(Some(HostValue::Int(42))))
        );
        assert_eq!(table.call("missing", &[]), None);
    }

    #[test]
    fn test_math_table() {
        let mut table = NativeTable::with_math();
        assert_eq!(
            table.call("sqrt", &[HostValue::Double(9.0)]),
            Some(Ok(Some(HostValue::Double(3.0))))
        );
        assert_eq!(
            table.call("strlen", &[HostValue::Str("héllo".to_string())]),
            Some(Ok(Some(HostValue::Int(5))))
        );
        assert!(matches!(table.call("abs", &[]), Some(Err(_))));
    }
}
