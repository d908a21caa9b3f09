use tracing::{debug, warn};

use crate::{
    bytecode::{
        code::CodeBuilder,
        compile_error::CompileError,
        ir::{BytecodeFunction, NativeDecl, ProgramBc, ScopeLayout, TopVar, VarAddr},
        op::Op,
        scope::{SymbolTable, VarInfo},
    },
    lang::{
        node::{BinaryOp, Block, Node, StoreOp, UnaryOp},
        program::{FunctionDecl, Program, ScopeId},
        types::VarType,
    },
};

/// Translator switches.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Reject `return` expressions whose type cannot become the declared
    /// return type.
    pub strict_returns: bool,
}

pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    pub fn with_options(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Translate every function of `program` into a [`ProgramBc`].
    #[tracing::instrument(level = "debug", skip_all, fields(scopes = program.scope_count()))]
    pub fn compile_program(self, program: &Program) -> Result<ProgramBc, CompileError> {
        if program.top().is_none() {
            return Err(CompileError::UndeclaredFunction(Program::TOP.to_string()));
        }

        let mut translation = Translation {
            source: program,
            options: self.options,
            program_bc: ProgramBc::new(),
            symbols: SymbolTable::new(),
            types: Vec::new(),
            building: Vec::new(),
            current_scope: Program::root(),
        };
        translation.traverse_scope(Program::root())?;
        translation.finish()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// A function whose instruction stream is being written.
struct FunctionBuilder<'p> {
    id: u16,
    decl: &'p FunctionDecl,
    code: CodeBuilder,
    /// Scope ids whose slots live in this function's frame, in layout order.
    owned: Vec<u16>,
}

struct Translation<'p> {
    source: &'p Program,
    options: CompileOptions,
    program_bc: ProgramBc,
    symbols: SymbolTable,
    /// Types the operand stack will hold at this point of the function.
    types: Vec<VarType>,
    /// Innermost last. A function is pushed on entry and flushed into the
    /// registry on exit.
    building: Vec<FunctionBuilder<'p>>,
    /// AST scope that names resolve from.
    current_scope: ScopeId,
}

impl<'p> Translation<'p> {
    // =========================================================================
    // Scope traversal
    // =========================================================================

    /// Number this scope, declare its functions, descend into its children,
    /// then translate the functions declared here. Nested functions are
    /// therefore complete before any enclosing body is translated.
    fn traverse_scope(&mut self, arena: ScopeId) -> Result<(), CompileError> {
        let source = self.source;
        let scope = source
            .scope(arena)
            .ok_or_else(|| CompileError::internal(format!("unknown scope {}", arena.0)))?;
        let scope_id = self.symbols.enter_scope(arena, scope)?;

        let mut decls = Vec::with_capacity(scope.functions.len());
        for function in &scope.functions {
            let id = self.declare_function(arena, scope_id, function)?;
            decls.push((id, function));
        }

        for &child in &scope.children {
            self.traverse_scope(child)?;
        }

        for (id, function) in decls {
            self.translate_function(id, function)
                .map_err(|e| e.in_function(&function.name))?;
        }
        Ok(())
    }

    fn declare_function(
        &mut self,
        arena: ScopeId,
        scope_id: u16,
        function: &FunctionDecl,
    ) -> Result<u16, CompileError> {
        let record = BytecodeFunction {
            id: 0,
            name: function.name.clone(),
            declaring_scope: scope_id,
            scope: scope_id,
            params: function.params.iter().map(|p| p.ty).collect(),
            return_type: function.return_type,
            locals: 0,
            layout: Vec::new(),
            code: Default::default(),
        };
        let id = self
            .program_bc
            .add_function(record)
            .ok_or(CompileError::LimitExceeded {
                what: "functions",
                limit: u16::MAX as usize,
            })?;
        self.symbols.declare_function(arena, &function.name, id);
        Ok(id)
    }

    fn translate_function(&mut self, id: u16, decl: &'p FunctionDecl) -> Result<(), CompileError> {
        let body_scope = self.number_scope(decl.body.scope)?;
        let mut owned = vec![body_scope];
        if decl.name == Program::TOP {
            // anything declared directly in the root lives in <top>'s frame
            let root = self.number_scope(Program::root())?;
            owned.insert(0, root);
        }

        self.building.push(FunctionBuilder {
            id,
            decl,
            code: CodeBuilder::new(),
            owned,
        });
        let saved_types = std::mem::take(&mut self.types);
        let saved_scope = std::mem::replace(&mut self.current_scope, decl.body.scope);

        // Arguments arrive with the first parameter on top.
        for param in &decl.params {
            let var = self.resolve_var(&param.name)?;
            self.emit_store(var)?;
        }

        for statement in &decl.body.statements {
            self.translate_statement(statement)?;
        }

        self.emit(if decl.name == Program::TOP {
            Op::Stop
        } else {
            Op::Return
        })?;

        self.types = saved_types;
        self.current_scope = saved_scope;
        self.flush_function(body_scope)
    }

    /// Pop the innermost builder and store its stream and frame layout in
    /// the registry.
    fn flush_function(&mut self, body_scope: u16) -> Result<(), CompileError> {
        let builder = self
            .building
            .pop()
            .ok_or_else(|| CompileError::internal("no function is being built"))?;
        let code = builder.code.finish()?;

        let mut layout = Vec::with_capacity(builder.owned.len());
        let mut base = 0;
        for scope in builder.owned {
            let size = self.symbols.scope_size(scope);
            layout.push(ScopeLayout { scope, base, size });
            base += size;
        }

        debug!(
            function = %builder.decl.name,
            id = builder.id,
            bytes = code.len(),
            locals = base,
            "translated function"
        );

        let record = self
            .program_bc
            .function_mut(builder.id)
            .ok_or_else(|| CompileError::internal(format!("unknown function {}", builder.id)))?;
        record.scope = body_scope;
        record.locals = base;
        record.layout = layout;
        record.code = code;
        Ok(())
    }

    fn number_scope(&mut self, arena: ScopeId) -> Result<u16, CompileError> {
        if let Some(id) = self.symbols.scope_id(arena) {
            return Ok(id);
        }
        let scope = self
            .source
            .scope(arena)
            .ok_or_else(|| CompileError::internal(format!("unknown scope {}", arena.0)))?;
        self.symbols.enter_scope(arena, scope)
    }

    fn finish(mut self) -> Result<ProgramBc, CompileError> {
        if let Some(top) = self.source.top() {
            let top_scope = self.source.scope(top.body.scope);
            for var in top_scope.map(|s| s.variables.as_slice()).unwrap_or_default() {
                if let Some(info) = self
                    .symbols
                    .lookup_var(self.source, top.body.scope, &var.name)
                {
                    if self.program_bc.top_vars.iter().any(|v| v.name == var.name) {
                        continue;
                    }
                    self.program_bc.top_vars.push(TopVar {
                        name: var.name.clone(),
                        ty: info.ty,
                        addr: info.addr,
                    });
                }
            }
        }
        self.program_bc.scope_count = self.symbols.scope_count();
        Ok(self.program_bc)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    fn translate(&mut self, node: &'p Node) -> Result<(), CompileError> {
        match node {
            Node::IntLiteral(n) => {
                self.emit(Op::ILoad)?;
                self.code()?.add_i64(*n);
                self.types.push(VarType::Integer);
            }

            Node::DoubleLiteral(d) => {
                self.emit(Op::DLoad)?;
                self.code()?.add_f64(*d);
                self.types.push(VarType::Double);
            }

            Node::StringLiteral(s) => {
                let id = self
                    .program_bc
                    .strings
                    .intern(s)
                    .ok_or(CompileError::LimitExceeded {
                        what: "string constants",
                        limit: u16::MAX as usize + 1,
                    })?;
                self.emit(Op::SLoad)?;
                self.code()?.add_u16(id);
                self.types.push(VarType::String);
            }

            Node::Load(name) => {
                let var = self.resolve_var(name)?;
                self.emit_load(var)?;
            }

            Node::Store { name, op, value } => self.translate_store(name, *op, value)?,

            Node::Binary { op, left, right } => {
                if *op == BinaryOp::Range {
                    return Err(CompileError::RangeOutsideFor);
                }
                self.translate(right)?;
                self.translate(left)?;
                let result = self.translate_binop(*op)?;
                self.types.push(result);
            }

            Node::Unary { op, operand } => {
                self.translate(operand)?;
                let result = self.translate_unop(*op)?;
                self.types.push(result);
            }

            Node::Call { name, args } => self.translate_call(name, args)?,

            Node::Block(block) => self.translate_block(block)?,

            Node::If {
                condition,
                then_block,
                else_block,
            } => self.translate_if(condition, then_block, else_block.as_ref())?,

            Node::While { condition, body } => self.translate_while(condition, body)?,

            Node::For { var, range, body } => self.translate_for(var, range, body)?,

            Node::Return(value) => self.translate_return(value.as_deref())?,

            Node::Print(operands) => {
                for operand in operands {
                    self.translate(operand)?;
                    let ty = self.pop_type()?;
                    let op = match ty {
                        VarType::Integer => Op::IPrint,
                        VarType::Double => Op::DPrint,
                        VarType::String => Op::SPrint,
                        other => {
                            warn!(ty = %other, "print operand has no print form");
                            Op::Invalid
                        }
                    };
                    self.emit(op)?;
                }
            }

            Node::NativeCall { symbol } => self.translate_native(symbol)?,
        }

        Ok(())
    }

    /// Translate a node in statement position. A value it leaves behind,
    /// e.g. the result of `f();`, is popped so loops stay depth-neutral.
    fn translate_statement(&mut self, node: &'p Node) -> Result<(), CompileError> {
        let depth = self.types.len();
        self.translate(node)?;
        while self.types.len() > depth {
            if self.pop_type()? != VarType::Void {
                self.emit(Op::Pop)?;
            }
        }
        Ok(())
    }

    fn translate_block(&mut self, block: &'p Block) -> Result<(), CompileError> {
        let id = self.number_scope(block.scope)?;
        let builder = self.builder()?;
        if !builder.owned.contains(&id) {
            builder.owned.push(id);
        }

        let saved = std::mem::replace(&mut self.current_scope, block.scope);
        for statement in &block.statements {
            self.translate_statement(statement)?;
        }
        self.current_scope = saved;
        Ok(())
    }

    fn translate_store(&mut self, name: &str, op: StoreOp, value: &'p Node) -> Result<(), CompileError> {
        let var = self.resolve_var(name)?;
        self.translate(value)?;

        match op {
            StoreOp::Assign => self.convert_top(var.ty)?,
            StoreOp::AddAssign | StoreOp::SubAssign => {
                let (binop, symbol) = if op == StoreOp::AddAssign {
                    (BinaryOp::Add, "+=")
                } else {
                    (BinaryOp::Sub, "-=")
                };
                self.emit_load(var)?;
                let result = self.translate_binop(binop)?;
                if result != var.ty {
                    return Err(CompileError::CompoundTypeMismatch {
                        var: name.to_string(),
                        op: symbol,
                        declared: var.ty,
                        found: result,
                    });
                }
                self.types.push(result);
            }
        }

        self.pop_type()?;
        self.emit_store(var)
    }

    /// Pops both operand types (left on top), emits the typed instruction
    /// and returns the result type.
    fn translate_binop(&mut self, op: BinaryOp) -> Result<VarType, CompileError> {
        let left = self.pop_type()?;
        let right = self.pop_type()?;

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let ty = self.promote(left, right)?;
                let insn = match (op, ty) {
                    (BinaryOp::Add, VarType::Integer) => Op::IAdd,
                    (BinaryOp::Add, _) => Op::DAdd,
                    (BinaryOp::Sub, VarType::Integer) => Op::ISub,
                    (BinaryOp::Sub, _) => Op::DSub,
                    (BinaryOp::Mul, VarType::Integer) => Op::IMul,
                    (BinaryOp::Mul, _) => Op::DMul,
                    (_, VarType::Integer) => Op::IDiv,
                    _ => Op::DDiv,
                };
                self.emit(insn)?;
                Ok(ty)
            }

            BinaryOp::Mod
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::And
            | BinaryOp::Or => {
                require_int(left)?;
                require_int(right)?;
                self.emit(match op {
                    BinaryOp::Mod => Op::IMod,
                    BinaryOp::BitAnd | BinaryOp::And => Op::IAAnd,
                    BinaryOp::BitOr | BinaryOp::Or => Op::IAOr,
                    _ => Op::IAXor,
                })?;
                Ok(VarType::Integer)
            }

            BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Eq
            | BinaryOp::Ne => {
                let ty = self.promote(left, right)?;
                self.translate_cmp(op, ty)?;
                Ok(VarType::Integer)
            }

            BinaryOp::Range => Err(CompileError::RangeOutsideFor),
        }
    }

    /// Resolve the arithmetic result type of `left op right` and convert
    /// whichever operand is an int when the other is a double.
    fn promote(&mut self, left: VarType, right: VarType) -> Result<VarType, CompileError> {
        require_numeric(left)?;
        require_numeric(right)?;

        if left == VarType::Integer && right == VarType::Integer {
            return Ok(VarType::Integer);
        }
        if left == VarType::Integer {
            self.emit(Op::I2D)?;
        }
        if right == VarType::Integer {
            self.emit(Op::Swap)?;
            self.emit(Op::I2D)?;
            self.emit(Op::Swap)?;
        }
        Ok(VarType::Double)
    }

    /// Materialize a comparison as 0/1.
    ///
    /// ```text
    ///   ICMP | DCMP            cmp(left, right)
    ///   ILOAD0
    ///   IFICMPxx lfalse        jump when 0 xx cmp rules the relation out
    ///   ILOAD1
    ///   JA lafter
    /// lfalse:
    ///   ILOAD0
    /// lafter:
    /// ```
    fn translate_cmp(&mut self, op: BinaryOp, ty: VarType) -> Result<(), CompileError> {
        self.emit(if ty == VarType::Double {
            Op::DCmp
        } else {
            Op::ICmp
        })?;

        let branch = match op {
            BinaryOp::Eq => Op::IfICmpNe,
            BinaryOp::Ne => Op::IfICmpE,
            BinaryOp::Lt => Op::IfICmpLe,
            BinaryOp::Le => Op::IfICmpL,
            BinaryOp::Gt => Op::IfICmpGe,
            BinaryOp::Ge => Op::IfICmpG,
            other => {
                return Err(CompileError::internal(format!(
                    "'{}' is not a comparison",
                    other.symbol()
                )));
            }
        };

        let code = self.code()?;
        let lfalse = code.new_label();
        let lafter = code.new_label();
        code.add_op(Op::ILoad0);
        code.add_branch(branch, lfalse)?;
        code.add_op(Op::ILoad1);
        code.add_branch(Op::Ja, lafter)?;
        code.bind(lfalse)?;
        code.add_op(Op::ILoad0);
        code.bind(lafter)
    }

    fn translate_unop(&mut self, op: UnaryOp) -> Result<VarType, CompileError> {
        let ty = self.pop_type()?;
        match op {
            UnaryOp::Plus => {
                require_numeric(ty)?;
                Ok(ty)
            }
            UnaryOp::Minus => {
                require_numeric(ty)?;
                self.emit(if ty == VarType::Double {
                    Op::DNeg
                } else {
                    Op::INeg
                })?;
                Ok(ty)
            }
            UnaryOp::Not => {
                require_int(ty)?;
                self.emit(Op::ILoad1)?;
                self.emit(Op::IAXor)?;
                Ok(VarType::Integer)
            }
        }
    }

    fn translate_call(&mut self, name: &str, args: &'p [Node]) -> Result<(), CompileError> {
        let id = self
            .symbols
            .lookup_function(self.source, self.current_scope, name)
            .ok_or_else(|| CompileError::UndeclaredFunction(name.to_string()))?;
        let (params, return_type) = {
            let callee = self
                .program_bc
                .function(id)
                .ok_or_else(|| CompileError::internal(format!("unknown function {}", id)))?;
            (callee.params.clone(), callee.return_type)
        };

        if params.len() != args.len() {
            return Err(CompileError::ArgumentCount {
                name: name.to_string(),
                expected: params.len(),
                found: args.len(),
            });
        }

        // last argument first, so the first one ends up on top
        for (arg, ty) in args.iter().zip(&params).rev() {
            self.translate(arg)?;
            self.convert_top(*ty)?;
        }

        self.emit(Op::Call)?;
        self.code()?.add_u16(id);

        for _ in 0..params.len() {
            self.pop_type()?;
        }
        self.types.push(return_type);
        Ok(())
    }

    /// ```text
    ///   <condition>
    ///   ILOAD0
    ///   IFICMPE lfalse
    ///   <then>
    ///   JA lafter            (only with else)
    /// lfalse:
    ///   <else>
    /// lafter:
    /// ```
    fn translate_if(
        &mut self,
        condition: &'p Node,
        then_block: &'p Block,
        else_block: Option<&'p Block>,
    ) -> Result<(), CompileError> {
        self.translate(condition)?;
        require_int(self.pop_type()?)?;

        let lfalse = self.code()?.new_label();
        self.emit(Op::ILoad0)?;
        self.code()?.add_branch(Op::IfICmpE, lfalse)?;
        self.translate_block(then_block)?;

        match else_block {
            Some(else_block) => {
                let lafter = self.code()?.new_label();
                self.code()?.add_branch(Op::Ja, lafter)?;
                self.code()?.bind(lfalse)?;
                self.translate_block(else_block)?;
                self.code()?.bind(lafter)
            }
            None => self.code()?.bind(lfalse),
        }
    }

    fn translate_while(&mut self, condition: &'p Node, body: &'p Block) -> Result<(), CompileError> {
        let lstart = self.code()?.bound_label()?;
        let lafter = self.code()?.new_label();

        self.translate(condition)?;
        require_int(self.pop_type()?)?;

        self.emit(Op::ILoad1)?;
        self.code()?.add_branch(Op::IfICmpNe, lafter)?;
        self.translate_block(body)?;
        self.code()?.add_branch(Op::Ja, lstart)?;
        self.code()?.bind(lafter)
    }

    /// `for (i in a..b) body`:
    ///
    /// ```text
    ///   scratch = b
    ///   i = a
    /// lstart:
    ///   if (i > scratch) jmp lafter
    ///   body
    ///   i = i + 1
    ///   jmp lstart
    /// lafter:
    /// ```
    fn translate_for(&mut self, var: &str, range: &'p Node, body: &'p Block) -> Result<(), CompileError> {
        let Node::Binary {
            op: BinaryOp::Range,
            left: lower,
            right: upper,
        } = range
        else {
            return Err(CompileError::MalformedRange);
        };

        let var = self.resolve_var(var)?;
        require_int(var.ty)?;

        let scope = self.number_scope(self.current_scope)?;
        let scratch = VarInfo {
            addr: self.symbols.alloc_scratch(scope)?,
            ty: VarType::Integer,
        };

        self.translate(upper)?;
        self.int_bound()?;
        self.emit_var(Op::StoreCtxIVar, scratch.addr)?;

        self.translate(lower)?;
        self.int_bound()?;
        self.emit_var(Op::StoreCtxIVar, var.addr)?;

        let lstart = self.code()?.bound_label()?;
        let lafter = self.code()?.new_label();
        self.emit_var(Op::LoadCtxIVar, scratch.addr)?;
        self.emit_var(Op::LoadCtxIVar, var.addr)?;
        self.code()?.add_branch(Op::IfICmpG, lafter)?;

        self.translate_block(body)?;

        self.emit(Op::ILoad1)?;
        self.emit_var(Op::LoadCtxIVar, var.addr)?;
        self.emit(Op::IAdd)?;
        self.emit_var(Op::StoreCtxIVar, var.addr)?;
        self.code()?.add_branch(Op::Ja, lstart)?;
        self.code()?.bind(lafter)
    }

    /// Range bound on top of the stack: ints pass, doubles truncate.
    fn int_bound(&mut self) -> Result<(), CompileError> {
        match self.pop_type()? {
            VarType::Integer => Ok(()),
            VarType::Double => self.emit(Op::D2I),
            other => Err(CompileError::RequiredInt { found: other }),
        }
    }

    fn translate_return(&mut self, value: Option<&'p Node>) -> Result<(), CompileError> {
        let declared = self.builder()?.decl.return_type;

        match value {
            Some(value) => {
                self.translate(value)?;
                let found = *self
                    .types
                    .last()
                    .ok_or_else(|| CompileError::internal("type stack underflow"))?;
                if declared != VarType::Void {
                    self.coerce_top(declared)?;
                }
                let converted = self.pop_type()?;
                if self.options.strict_returns && converted != declared {
                    return Err(CompileError::ReturnTypeMismatch { declared, found });
                }
            }
            None => {
                if self.options.strict_returns && declared != VarType::Void {
                    return Err(CompileError::ReturnTypeMismatch {
                        declared,
                        found: VarType::Void,
                    });
                }
            }
        }

        self.emit(Op::Return)
    }

    /// Body of a native function: push the parameters the way a call would,
    /// hand them to the host, return its result.
    fn translate_native(&mut self, symbol: &str) -> Result<(), CompileError> {
        let decl = self.builder()?.decl;
        for param in decl.params.iter().rev() {
            let var = self.resolve_var(&param.name)?;
            self.emit_load(var)?;
        }

        let id = self
            .program_bc
            .add_native(NativeDecl {
                symbol: symbol.to_string(),
                params: decl.params.iter().map(|p| p.ty).collect(),
                return_type: decl.return_type,
            })
            .ok_or(CompileError::LimitExceeded {
                what: "native functions",
                limit: u16::MAX as usize,
            })?;

        self.emit(Op::CallNative)?;
        self.code()?.add_u16(id);
        for _ in 0..decl.params.len() {
            self.pop_type()?;
        }
        self.emit(Op::Return)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn builder(&mut self) -> Result<&mut FunctionBuilder<'p>, CompileError> {
        self.building
            .last_mut()
            .ok_or_else(|| CompileError::internal("no function is being built"))
    }

    fn code(&mut self) -> Result<&mut CodeBuilder, CompileError> {
        Ok(&mut self.builder()?.code)
    }

    fn emit(&mut self, op: Op) -> Result<(), CompileError> {
        self.code()?.add_op(op);
        Ok(())
    }

    fn emit_var(&mut self, op: Op, addr: VarAddr) -> Result<(), CompileError> {
        let code = self.code()?;
        code.add_op(op);
        code.add_u16(addr.scope);
        code.add_u16(addr.slot);
        Ok(())
    }

    fn emit_load(&mut self, var: VarInfo) -> Result<(), CompileError> {
        let op = match var.ty {
            VarType::Integer => Op::LoadCtxIVar,
            VarType::Double => Op::LoadCtxDVar,
            VarType::String => Op::LoadCtxSVar,
            _ => Op::Invalid,
        };
        if op == Op::Invalid {
            self.emit(op)?;
        } else {
            self.emit_var(op, var.addr)?;
        }
        self.types.push(var.ty);
        Ok(())
    }

    fn emit_store(&mut self, var: VarInfo) -> Result<(), CompileError> {
        match var.ty {
            VarType::Integer => self.emit_var(Op::StoreCtxIVar, var.addr),
            VarType::Double => self.emit_var(Op::StoreCtxDVar, var.addr),
            VarType::String => self.emit_var(Op::StoreCtxSVar, var.addr),
            _ => self.emit(Op::Invalid),
        }
    }

    fn resolve_var(&self, name: &str) -> Result<VarInfo, CompileError> {
        self.symbols
            .lookup_var(self.source, self.current_scope, name)
            .ok_or_else(|| CompileError::UndeclaredVariable(name.to_string()))
    }

    fn pop_type(&mut self) -> Result<VarType, CompileError> {
        self.types
            .pop()
            .ok_or_else(|| CompileError::internal("type stack underflow"))
    }

    /// Convert the value on top between int and double to match `target`.
    /// Any other combination is left alone.
    fn coerce_top(&mut self, target: VarType) -> Result<(), CompileError> {
        let top = *self
            .types
            .last()
            .ok_or_else(|| CompileError::internal("type stack underflow"))?;
        let op = match (top, target) {
            (VarType::Integer, VarType::Double) => Op::I2D,
            (VarType::Double, VarType::Integer) => Op::D2I,
            _ => return Ok(()),
        };
        self.emit(op)?;
        if let Some(slot) = self.types.last_mut() {
            *slot = target;
        }
        Ok(())
    }

    /// [`Self::coerce_top`], then require the top to be exactly `target`.
    fn convert_top(&mut self, target: VarType) -> Result<(), CompileError> {
        self.coerce_top(target)?;
        let found = *self
            .types
            .last()
            .ok_or_else(|| CompileError::internal("type stack underflow"))?;
        if found != target {
            return Err(CompileError::TypeMismatch {
                expected: target,
                found,
            });
        }
        Ok(())
    }
}

fn require_numeric(ty: VarType) -> Result<(), CompileError> {
    if ty.is_numeric() {
        Ok(())
    } else {
        Err(CompileError::RequiredNumeric { found: ty })
    }
}

fn require_int(ty: VarType) -> Result<(), CompileError> {
    if ty == VarType::Integer {
        Ok(())
    } else {
        Err(CompileError::RequiredInt { found: ty })
    }
}
