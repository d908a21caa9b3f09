use crate::bytecode::code::CodeObject;
use crate::bytecode::stack_check::{StackCheckError, check_program};
use crate::lang::types::VarType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Address of a variable: pre-order index of its scope and its ordinal
/// within that scope. Unique for the lifetime of a compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarAddr {
    pub scope: u16,
    pub slot: u16,
}

/// Where one scope's slots live inside a function's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLayout {
    pub scope: u16,
    pub base: usize,
    pub size: usize,
}

/// A translated function: signature, frame layout and instruction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytecodeFunction {
    pub id: u16,
    pub name: String,
    /// Scope the function is declared in.
    pub declaring_scope: u16,
    /// Scope of the function body, holding the parameters.
    pub scope: u16,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    /// Total variable slots a frame of this function needs.
    pub locals: usize,
    /// Scopes whose storage lives in this function's frame.
    pub layout: Vec<ScopeLayout>,
    pub code: CodeObject,
}

impl BytecodeFunction {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn returns_value(&self) -> bool {
        !matches!(self.return_type, VarType::Void | VarType::Invalid)
    }
}

/// Host function signature referenced by `CALLNATIVE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeDecl {
    pub symbol: String,
    pub params: Vec<VarType>,
    pub return_type: VarType,
}

/// A variable of `<top>`'s body scope, visible to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopVar {
    pub name: String,
    pub ty: VarType,
    pub addr: VarAddr,
}

// =============================================================================
// String pool
// =============================================================================

/// Append-only, deduplicated string constants. Id 0 is always "".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, u16>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::from(vec![String::new()])
    }

    /// Id of `text`, adding it if it is new. None once the u16 id space is
    /// exhausted.
    pub fn intern(&mut self, text: &str) -> Option<u16> {
        if let Some(&id) = self.index.get(text) {
            return Some(id);
        }
        let id = u16::try_from(self.strings.len()).ok()?;
        self.strings.push(text.to_string());
        self.index.insert(text.to_string(), id);
        Some(id)
    }

    pub fn lookup(&self, text: &str) -> Option<u16> {
        self.index.get(text).copied()
    }

    pub fn get(&self, id: u16) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<String>> for StringPool {
    fn from(mut strings: Vec<String>) -> Self {
        if strings.first().is_none_or(|s| !s.is_empty()) {
            strings.insert(0, String::new());
        }
        let mut index = HashMap::new();
        for (id, s) in strings.iter().enumerate() {
            index.entry(s.clone()).or_insert(id as u16);
        }
        Self { strings, index }
    }
}

impl From<StringPool> for Vec<String> {
    fn from(pool: StringPool) -> Self {
        pool.strings
    }
}

// =============================================================================
// Function registry
// =============================================================================

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot encode program image: {0}")]
    Encode(#[source] postcard::Error),

    #[error("cannot decode program image: {0}")]
    Decode(#[source] postcard::Error),

    #[error("program image failed verification: {0}")]
    Verify(#[from] StackCheckError),
}

/// A compiled bytecode program: every function by id, plus the read-only
/// tables they reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramBc {
    /// Convention: ids are assigned in declaration (traversal) order.
    pub functions: Vec<BytecodeFunction>,
    by_name: HashMap<String, u16>,
    pub strings: StringPool,
    pub natives: Vec<NativeDecl>,
    /// Number of scopes in the source tree; scope ids are `0..scope_count`.
    pub scope_count: usize,
    pub top_vars: Vec<TopVar>,
}

impl ProgramBc {
    pub const TOP: &'static str = "<top>";

    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            by_name: HashMap::new(),
            strings: StringPool::new(),
            natives: Vec::new(),
            scope_count: 0,
            top_vars: Vec::new(),
        }
    }

    /// Register a function and return its id. The first function with a
    /// given name owns that name for [`ProgramBc::function_by_name`].
    pub fn add_function(&mut self, mut function: BytecodeFunction) -> Option<u16> {
        let id = u16::try_from(self.functions.len()).ok()?;
        function.id = id;
        self.by_name.entry(function.name.clone()).or_insert(id);
        self.functions.push(function);
        Some(id)
    }

    pub fn add_native(&mut self, native: NativeDecl) -> Option<u16> {
        if let Some(id) = self.natives.iter().position(|n| *n == native) {
            return u16::try_from(id).ok();
        }
        let id = u16::try_from(self.natives.len()).ok()?;
        self.natives.push(native);
        Some(id)
    }

    pub fn function(&self, id: u16) -> Option<&BytecodeFunction> {
        self.functions.get(id as usize)
    }

    pub fn function_mut(&mut self, id: u16) -> Option<&mut BytecodeFunction> {
        self.functions.get_mut(id as usize)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&BytecodeFunction> {
        self.by_name.get(name).and_then(|&id| self.function(id))
    }

    pub fn top(&self) -> Option<&BytecodeFunction> {
        self.function_by_name(Self::TOP)
    }

    pub fn native(&self, id: u16) -> Option<&NativeDecl> {
        self.natives.get(id as usize)
    }

    /// Encode as a compact binary image.
    pub fn to_image(&self) -> Result<Vec<u8>, ImageError> {
        postcard::to_allocvec(self).map_err(ImageError::Encode)
    }

    /// Decode an image produced by [`ProgramBc::to_image`] and verify every
    /// function's stack discipline before handing it out.
    pub fn from_image(bytes: &[u8]) -> Result<Self, ImageError> {
        let program: ProgramBc = postcard::from_bytes(bytes).map_err(ImageError::Decode)?;
        check_program(&program)?;
        Ok(program)
    }
}

impl Default for ProgramBc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_pool_deduplicates() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello").unwrap();
        let b = pool.intern("world").unwrap();
        let c = pool.intern("hello").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), Some("hello"));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_string_pool_reserves_empty() {
        let mut pool = StringPool::new();
        assert_eq!(pool.get(0), Some(""));
        assert_eq!(pool.intern(""), Some(0));
    }

    #[test]
    fn test_string_pool_from_strings_rebuilds_index() {
        let pool = StringPool::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pool.lookup(""), Some(0));
        assert_eq!(pool.lookup("b"), Some(2));
    }

    #[test]
    fn test_function_registry_by_id_and_name() {
        let mut program = ProgramBc::new();
        let f = BytecodeFunction {
            id: 0,
            name: "f".to_string(),
            declaring_scope: 0,
            scope: 1,
            params: vec![VarType::Integer],
            return_type: VarType::Integer,
            locals: 1,
            layout: Vec::new(),
            code: CodeObject::default(),
        };
        let g = BytecodeFunction {
            name: "g".to_string(),
            ..f.clone()
        };
        assert_eq!(program.add_function(f), Some(0));
        assert_eq!(program.add_function(g), Some(1));
        assert_eq!(program.function_by_name("g").map(|g| g.id), Some(1));
        assert_eq!(program.function(0).map(|f| f.param_count()), Some(1));
        assert!(program.function(2).is_none());
    }

    #[test]
    fn test_natives_are_shared() {
        let mut program = ProgramBc::new();
        let decl = NativeDecl {
            symbol: "sqrt".to_string(),
            params: vec![VarType::Double],
            return_type: VarType::Double,
        };
        assert_eq!(program.add_native(decl.clone()), Some(0));
        assert_eq!(program.add_native(decl), Some(0));
    }
}
