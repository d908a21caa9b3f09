//! Symbol table: stable addresses for every variable and function.
//!
//! Scopes are numbered in pre-order as the translator first reaches them,
//! and a scope's variables get consecutive slots in declaration order.
//! Names resolve through the parent chain of the AST scope tree.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::VarAddr;
use crate::lang::program::{Program, Scope, ScopeId};
use crate::lang::types::VarType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub addr: VarAddr,
    pub ty: VarType,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    /// AST arena index -> pre-order scope id.
    scope_ids: HashMap<ScopeId, u16>,
    /// Slots per scope id, hidden scratch slots included.
    scope_sizes: Vec<usize>,
    variables: HashMap<(ScopeId, String), VarInfo>,
    functions: HashMap<(ScopeId, String), u16>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number the scope and give each of its variables a slot.
    pub fn enter_scope(&mut self, arena: ScopeId, scope: &Scope) -> Result<u16, CompileError> {
        if let Some(&id) = self.scope_ids.get(&arena) {
            return Ok(id);
        }
        let id = u16::try_from(self.scope_sizes.len()).map_err(|_| CompileError::LimitExceeded {
            what: "scopes",
            limit: u16::MAX as usize,
        })?;
        if scope.variables.len() > u16::MAX as usize {
            return Err(CompileError::LimitExceeded {
                what: "variables in one scope",
                limit: u16::MAX as usize,
            });
        }

        self.scope_ids.insert(arena, id);
        self.scope_sizes.push(scope.variables.len());

        for (slot, var) in scope.variables.iter().enumerate() {
            self.variables
                .entry((arena, var.name.clone()))
                .or_insert(VarInfo {
                    addr: VarAddr {
                        scope: id,
                        slot: slot as u16,
                    },
                    ty: var.ty,
                });
        }
        Ok(id)
    }

    pub fn declare_function(&mut self, arena: ScopeId, name: &str, id: u16) {
        self.functions.entry((arena, name.to_string())).or_insert(id);
    }

    pub fn scope_id(&self, arena: ScopeId) -> Option<u16> {
        self.scope_ids.get(&arena).copied()
    }

    pub fn scope_count(&self) -> usize {
        self.scope_sizes.len()
    }

    pub fn scope_size(&self, id: u16) -> usize {
        self.scope_sizes.get(id as usize).copied().unwrap_or(0)
    }

    pub fn lookup_var(&self, program: &Program, from: ScopeId, name: &str) -> Option<VarInfo> {
        self.walk(program, from, |arena| {
            self.variables.get(&(arena, name.to_string())).copied()
        })
    }

    pub fn lookup_function(&self, program: &Program, from: ScopeId, name: &str) -> Option<u16> {
        self.walk(program, from, |arena| {
            self.functions.get(&(arena, name.to_string())).copied()
        })
    }

    /// Reserve a hidden int slot at the end of scope `id`.
    pub fn alloc_scratch(&mut self, id: u16) -> Result<VarAddr, CompileError> {
        let size = self
            .scope_sizes
            .get_mut(id as usize)
            .ok_or_else(|| CompileError::internal(format!("unknown scope {}", id)))?;
        let slot = u16::try_from(*size).map_err(|_| CompileError::LimitExceeded {
            what: "variables in one scope",
            limit: u16::MAX as usize,
        })?;
        *size += 1;
        Ok(VarAddr { scope: id, slot })
    }

    fn walk<T>(
        &self,
        program: &Program,
        from: ScopeId,
        mut find: impl FnMut(ScopeId) -> Option<T>,
    ) -> Option<T> {
        let mut current = Some(from);
        while let Some(arena) = current {
            if let Some(found) = find(arena) {
                return Some(found);
            }
            current = program.scope(arena).and_then(|s| s.parent);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_program() -> (Program, ScopeId, ScopeId) {
        let mut program = Program::new();
        let top = program.top_scope();
        program.declare_var(top, "x", VarType::Integer);
        program.declare_var(top, "y", VarType::Double);
        let inner = program.add_scope(top);
        program.declare_var(inner, "x", VarType::String);
        (program, top, inner)
    }

    #[test]
    fn test_slots_follow_declaration_order() {
        let (program, top, _) = nested_program();
        let mut table = SymbolTable::new();
        let id = table.enter_scope(top, program.scope(top).unwrap()).unwrap();
        assert_eq!(id, 0);

        let y = table.lookup_var(&program, top, "y").unwrap();
        assert_eq!(y.addr, VarAddr { scope: 0, slot: 1 });
        assert_eq!(y.ty, VarType::Double);
    }

    #[test]
    fn test_inner_scope_shadows_outer() {
        let (program, top, inner) = nested_program();
        let mut table = SymbolTable::new();
        table.enter_scope(top, program.scope(top).unwrap()).unwrap();
        table.enter_scope(inner, program.scope(inner).unwrap()).unwrap();

        let x = table.lookup_var(&program, inner, "x").unwrap();
        assert_eq!(x.addr, VarAddr { scope: 1, slot: 0 });
        assert_eq!(x.ty, VarType::String);

        let y = table.lookup_var(&program, inner, "y").unwrap();
        assert_eq!(y.addr.scope, 0);
        assert!(table.lookup_var(&program, inner, "z").is_none());
    }

    #[test]
    fn test_enter_scope_is_idempotent() {
        let (program, top, _) = nested_program();
        let mut table = SymbolTable::new();
        let a = table.enter_scope(top, program.scope(top).unwrap()).unwrap();
        let b = table.enter_scope(top, program.scope(top).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.scope_count(), 1);
    }

    #[test]
    fn test_scratch_slots_extend_scope() {
        let (program, top, _) = nested_program();
        let mut table = SymbolTable::new();
        let id = table.enter_scope(top, program.scope(top).unwrap()).unwrap();
        let first = table.alloc_scratch(id).unwrap();
        let second = table.alloc_scratch(id).unwrap();
        assert_eq!(first.slot, 2);
        assert_eq!(second.slot, 3);
        assert_eq!(table.scope_size(id), 4);
    }

    #[test]
    fn test_functions_resolve_through_parents() {
        let (program, top, inner) = nested_program();
        let mut table = SymbolTable::new();
        table.declare_function(top, "f", 3);
        assert_eq!(table.lookup_function(&program, inner, "f"), Some(3));
        assert_eq!(table.lookup_function(&program, inner, "g"), None);
    }
}
