use super::node::{Block, Node};
use super::types::VarType;
use serde::{Deserialize, Serialize};

/// Arena index of a scope inside a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: VarType,
}

/// A declared function. Its parameters are also declared, in order, as the
/// leading variables of its body scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub return_type: VarType,
    pub params: Vec<VarDecl>,
    pub body: Block,
}

impl FunctionDecl {
    pub fn is_native(&self) -> bool {
        matches!(self.body.statements.as_slice(), [Node::NativeCall { .. }])
    }
}

/// One node of the scope tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub variables: Vec<VarDecl>,
    pub functions: Vec<FunctionDecl>,
    pub children: Vec<ScopeId>,
}

/// Parsed Cinder program: a tree of scopes rooted at [`Program::root`].
///
/// The root scope declares the implicit `<top>` function, whose body holds
/// the top-level statements and the host-visible variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    scopes: Vec<Scope>,
}

impl Program {
    pub const TOP: &'static str = "<top>";

    /// Create a program with an empty root scope and an empty `<top>`.
    pub fn new() -> Self {
        let mut program = Self {
            scopes: vec![Scope::default()],
        };
        program.declare_function(Self::root(), Self::TOP, VarType::Void, &[]);
        program
    }

    pub fn root() -> ScopeId {
        ScopeId(0)
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0)
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Body scope of `<top>`.
    pub fn top_scope(&self) -> ScopeId {
        self.top().map(|f| f.body.scope).unwrap_or(ScopeId(1))
    }

    pub fn top(&self) -> Option<&FunctionDecl> {
        self.scopes[0].functions.iter().find(|f| f.name == Self::TOP)
    }

    /// Add an empty child scope under `parent`.
    pub fn add_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            parent: Some(parent),
            ..Scope::default()
        });
        self.scopes[parent.0].children.push(id);
        id
    }

    pub fn declare_var(&mut self, scope: ScopeId, name: &str, ty: VarType) -> &mut Self {
        self.scopes[scope.0].variables.push(VarDecl {
            name: name.to_string(),
            ty,
        });
        self
    }

    /// Declare a function in `scope` and return its body scope. The body
    /// statements are attached later with [`Program::define`].
    pub fn declare_function(
        &mut self,
        scope: ScopeId,
        name: &str,
        return_type: VarType,
        params: &[(&str, VarType)],
    ) -> ScopeId {
        let body = self.add_scope(scope);
        for (param, ty) in params {
            self.declare_var(body, param, *ty);
        }
        self.scopes[scope.0].functions.push(FunctionDecl {
            name: name.to_string(),
            return_type,
            params: params
                .iter()
                .map(|(name, ty)| VarDecl {
                    name: name.to_string(),
                    ty: *ty,
                })
                .collect(),
            body: Block {
                scope: body,
                statements: Vec::new(),
            },
        });
        body
    }

    /// Declare a function whose body forwards to a host symbol.
    pub fn declare_native(
        &mut self,
        scope: ScopeId,
        name: &str,
        return_type: VarType,
        params: &[(&str, VarType)],
        symbol: &str,
    ) -> ScopeId {
        let body = self.declare_function(scope, name, return_type, params);
        self.define(
            body,
            vec![Node::NativeCall {
                symbol: symbol.to_string(),
            }],
        );
        body
    }

    /// Set the statements of the function whose body scope is `body`.
    pub fn define(&mut self, body: ScopeId, statements: Vec<Node>) -> &mut Self {
        let Some(parent) = self.scopes.get(body.0).and_then(|s| s.parent) else {
            return self;
        };
        if let Some(function) = self.scopes[parent.0]
            .functions
            .iter_mut()
            .find(|f| f.body.scope == body)
        {
            function.body.statements = statements;
        }
        self
    }

    /// Set the top-level statements.
    pub fn define_top(&mut self, statements: Vec<Node>) -> &mut Self {
        let top = self.top_scope();
        self.define(top, statements)
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_program_declares_top() {
        let program = Program::new();
        let top = program.top().unwrap();
        assert_eq!(top.name, "<top>");
        assert_eq!(top.body.scope, program.top_scope());
        assert_eq!(program.scope(program.top_scope()).unwrap().parent, Some(Program::root()));
    }

    #[test]
    fn test_function_params_become_body_variables() {
        let mut program = Program::new();
        let top = program.top_scope();
        let body = program.declare_function(
            top,
            "add",
            VarType::Integer,
            &[("a", VarType::Integer), ("b", VarType::Double)],
        );
        let scope = program.scope(body).unwrap();
        let names: Vec<_> = scope.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(scope.parent, Some(top));
        assert!(program.scope(top).unwrap().children.contains(&body));
    }

    #[test]
    fn test_define_attaches_statements() {
        let mut program = Program::new();
        let top = program.top_scope();
        let body = program.declare_function(top, "f", VarType::Void, &[]);
        program.define(body, vec![Node::Return(None)]);
        let f = &program.scope(top).unwrap().functions[0];
        assert_eq!(f.body.statements, vec![Node::Return(None)]);
    }

    #[test]
    fn test_native_declaration() {
        let mut program = Program::new();
        let top = program.top_scope();
        program.declare_native(top, "sqrt", VarType::Double, &[("x", VarType::Double)], "sqrt");
        assert!(program.scope(top).unwrap().functions[0].is_native());
    }
}
