use std::cmp::Ordering;
use std::io::{self, Write};

use tracing::{debug, trace};

use crate::bytecode::code::Operand;
use crate::bytecode::ir::{BytecodeFunction, ProgramBc, TopVar};
use crate::bytecode::op::Op;
use crate::bytecode::stack_check::check_program;
use crate::lang::{types::VarType, value::Value};
use crate::runtime::native::{HostValue, NativeBridge, NativeTable};
use crate::runtime::runtime_error::{
    RuntimeError, call_depth_exceeded, division_by_zero, stack_underflow, type_error,
    unresolved_native,
};

#[derive(Debug, Clone)]
pub struct VmBcConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<u64>,
    pub max_stack_size: usize,
    /// Run the stack checker over the whole program before executing it.
    pub verify: bool,
}

impl Default for VmBcConfig {
    fn default() -> Self {
        VmBcConfig {
            max_call_depth: 10_000,
            max_steps: None,
            max_stack_size: 1_000_000,
            verify: true,
        }
    }
}

/// A `<top>` variable shared with the host: written before the run, read
/// back after a successful one.
#[derive(Debug, Clone, PartialEq)]
pub struct HostVar {
    pub name: String,
    pub value: HostValue,
}

impl HostVar {
    pub fn new(name: &str, value: HostValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug)]
struct Frame {
    function: u16,
    /// Where the caller resumes once this frame's callee returns.
    return_ip: usize,
    /// Operand stack height below this frame's arguments.
    stack_base: usize,
    vars_base: usize,
}

enum Flow {
    Next(usize),
    Call { callee: u16, return_ip: usize },
    Return,
    Halt,
}

pub struct VmBc<W: Write = io::Stdout> {
    out: W,
    config: VmBcConfig,
    stack: Vec<Value>,
    /// Variable storage of every active frame, innermost last. `None` is a
    /// slot nothing has been stored to yet.
    vars: Vec<Option<Value>>,
    frames: Vec<Frame>,
    /// Per scope id, the storage offset of each active instance, innermost
    /// last. A variable resolves through the innermost instance.
    scope_offsets: Vec<Vec<usize>>,
    /// Strings created during this run. Their ids continue after the
    /// program's own pool.
    runtime_strings: Vec<String>,
    steps: u64,
}

impl VmBc<io::Stdout> {
    pub fn new() -> Self {
        Self::with_config(VmBcConfig::default())
    }

    pub fn with_config(config: VmBcConfig) -> Self {
        Self::with_output(io::stdout(), config)
    }
}

impl Default for VmBc<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> VmBc<W> {
    pub fn with_output(out: W, config: VmBcConfig) -> Self {
        Self {
            out,
            config,
            stack: Vec::new(),
            vars: Vec::new(),
            frames: Vec::new(),
            scope_offsets: Vec::new(),
            runtime_strings: Vec::new(),
            steps: 0,
        }
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Operand stack as left by the last run.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Run with no host variables and no native functions.
    pub fn run_program(&mut self, program: &ProgramBc) -> Result<(), RuntimeError> {
        self.run(program, &mut [], &mut NativeTable::new())
    }

    /// Execute `<top>` until it returns or stops.
    ///
    /// Host variables are written into `<top>`'s frame before the first
    /// instruction and read back only if the run succeeds.
    #[tracing::instrument(level = "debug", skip_all, fields(functions = program.functions.len()))]
    pub fn run(
        &mut self,
        program: &ProgramBc,
        host_vars: &mut [HostVar],
        natives: &mut dyn NativeBridge,
    ) -> Result<(), RuntimeError> {
        self.reset(program);

        if self.config.verify {
            check_program(program).map_err(|e| RuntimeError::new(e.to_string()))?;
        }

        let top = program
            .top()
            .ok_or_else(|| RuntimeError::new("program has no <top> function"))?;
        self.enter(top)?;
        self.bind_host_vars(program, host_vars)?;

        debug!("execution started");
        let result = self.execute(program, top, natives);
        let flushed = self.out.flush();
        result?;
        flushed.map_err(io_error)?;
        debug!(steps = self.steps, "execution halted");

        self.read_back_host_vars(program, host_vars)
    }

    fn reset(&mut self, program: &ProgramBc) {
        self.stack.clear();
        self.vars.clear();
        self.frames.clear();
        self.scope_offsets = vec![Vec::new(); program.scope_count];
        self.runtime_strings.clear();
        self.steps = 0;
    }

    // =========================================================================
    // Host variables
    // =========================================================================

    fn bind_host_vars(&mut self, program: &ProgramBc, host_vars: &[HostVar]) -> Result<(), RuntimeError> {
        for var in host_vars {
            let Some(top_var) = find_top_var(program, &var.name) else {
                debug!(name = %var.name, "host variable is not a top-level variable");
                continue;
            };
            if var.value.var_type() != top_var.ty {
                return Err(RuntimeError::new(format!(
                    "host variable '{}' is {}, program declares {}",
                    var.name,
                    var.value.var_type(),
                    top_var.ty
                )));
            }
            let value = self.from_host(program, var.value.clone(), top_var.ty)?;
            let index = self.slot(top_var.addr.scope, top_var.addr.slot)?;
            self.vars[index] = Some(value);
        }
        Ok(())
    }

    fn read_back_host_vars(&mut self, program: &ProgramBc, host_vars: &mut [HostVar]) -> Result<(), RuntimeError> {
        for var in host_vars.iter_mut() {
            let Some(top_var) = find_top_var(program, &var.name) else {
                continue;
            };
            let index = self.slot(top_var.addr.scope, top_var.addr.slot)?;
            let value = self.vars[index].unwrap_or(Value::zero(top_var.ty));
            var.value = self.to_host(program, value)?;
        }
        Ok(())
    }

    fn to_host(&self, program: &ProgramBc, value: Value) -> Result<HostValue, RuntimeError> {
        Ok(match value {
            Value::Integer(n) => HostValue::Int(n),
            Value::Double(d) => HostValue::Double(d),
            Value::StringRef(id) => {
                HostValue::Str(lookup_string(program, &self.runtime_strings, id)?.to_string())
            }
        })
    }

    fn from_host(&mut self, program: &ProgramBc, value: HostValue, ty: VarType) -> Result<Value, RuntimeError> {
        match (value, ty) {
            (HostValue::Int(n), VarType::Integer) => Ok(Value::Integer(n)),
            (HostValue::Int(n), VarType::Double) => Ok(Value::Double(n as f64)),
            (HostValue::Double(d), VarType::Double) => Ok(Value::Double(d)),
            (HostValue::Double(d), VarType::Integer) => Ok(Value::Integer(d as i64)),
            (HostValue::Str(s), VarType::String) => Ok(Value::StringRef(self.intern(program, &s)?)),
            (other, ty) => Err(type_error(ty, other.var_type().name())),
        }
    }

    /// Id of `text` in the program pool, or in this run's overlay.
    fn intern(&mut self, program: &ProgramBc, text: &str) -> Result<u16, RuntimeError> {
        if let Some(id) = program.strings.lookup(text) {
            return Ok(id);
        }
        let index = match self.runtime_strings.iter().position(|s| s == text) {
            Some(index) => index,
            None => {
                self.runtime_strings.push(text.to_string());
                self.runtime_strings.len() - 1
            }
        };
        u16::try_from(program.strings.len() + index)
            .map_err(|_| RuntimeError::new("string pool exhausted"))
    }

    // =========================================================================
    // Frames
    // =========================================================================

    fn enter(&mut self, function: &BytecodeFunction) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(call_depth_exceeded(self.config.max_call_depth, &function.name));
        }
        let stack_base = self
            .stack
            .len()
            .checked_sub(function.param_count())
            .ok_or_else(|| stack_underflow("CALL"))?;

        let vars_base = self.vars.len();
        self.vars.resize(vars_base + function.locals, None);
        for layout in &function.layout {
            let offsets = self
                .scope_offsets
                .get_mut(layout.scope as usize)
                .ok_or_else(|| RuntimeError::new(format!("unknown scope id {}", layout.scope)))?;
            offsets.push(vars_base + layout.base);
        }

        self.frames.push(Frame {
            function: function.id,
            return_ip: 0,
            stack_base,
            vars_base,
        });
        Ok(())
    }

    /// Drop the innermost frame along with anything it left on the operand
    /// stack, then push its return value for the caller.
    fn leave(&mut self, function: &BytecodeFunction) -> Result<(), RuntimeError> {
        let base = self.frame_base();
        let value = if function.returns_value() {
            if self.stack.len() <= base {
                return Err(RuntimeError::new(format!(
                    "'{}' returned without a value",
                    function.name
                )));
            }
            self.stack.pop()
        } else {
            None
        };

        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::new("return with no active frame"))?;
        self.stack.truncate(frame.stack_base);
        for layout in &function.layout {
            if let Some(offsets) = self.scope_offsets.get_mut(layout.scope as usize) {
                offsets.pop();
            }
        }
        self.vars.truncate(frame.vars_base);

        if let Some(value) = value {
            self.stack.push(value);
        }
        Ok(())
    }

    fn call<'p>(&mut self, program: &'p ProgramBc, callee: u16) -> Result<&'p BytecodeFunction, RuntimeError> {
        let target = program
            .function(callee)
            .ok_or_else(|| RuntimeError::new(format!("unknown function id {}", callee)))?;
        self.enter(target)?;
        Ok(target)
    }

    fn frame_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(
        &mut self,
        program: &ProgramBc,
        top: &BytecodeFunction,
        natives: &mut dyn NativeBridge,
    ) -> Result<(), RuntimeError> {
        let mut function = top;
        let mut ip = 0;

        loop {
            let flow = self
                .step(program, function, ip, natives)
                .map_err(|e| self.locate(program, e, function, ip))?;

            match flow {
                Flow::Next(next) => ip = next,

                Flow::Call { callee, return_ip } => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.return_ip = return_ip;
                    }
                    function = self
                        .call(program, callee)
                        .map_err(|e| self.locate(program, e, function, ip))?;
                    ip = 0;
                }

                Flow::Return => {
                    // returning from <top> ends the run with its frame intact
                    if self.frames.len() <= 1 {
                        return Ok(());
                    }
                    self.leave(function)
                        .map_err(|e| self.locate(program, e, function, ip))?;
                    let (caller, return_ip) = match self.frames.last() {
                        Some(frame) => (frame.function, frame.return_ip),
                        None => return Err(RuntimeError::new("return with no caller")),
                    };
                    function = program
                        .function(caller)
                        .ok_or_else(|| RuntimeError::new(format!("unknown function id {}", caller)))?;
                    ip = return_ip;
                }

                Flow::Halt => return Ok(()),
            }
        }
    }

    fn locate(&self, program: &ProgramBc, error: RuntimeError, function: &BytecodeFunction, ip: usize) -> RuntimeError {
        let mut error = error.at(&function.name, ip);
        if error.call_stack.is_empty() {
            for frame in &self.frames {
                let name = program
                    .function(frame.function)
                    .map_or("<unknown>", |f| f.name.as_str());
                error = error.with_context(name);
            }
        }
        error
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::new(format!(
                    "execution step limit exceeded ({})",
                    max
                )));
            }
        }

        if self.stack.len() > self.config.max_stack_size {
            return Err(RuntimeError::new(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    fn step(
        &mut self,
        program: &ProgramBc,
        function: &BytecodeFunction,
        ip: usize,
        natives: &mut dyn NativeBridge,
    ) -> Result<Flow, RuntimeError> {
        self.tick()?;

        let insn = function
            .code
            .decode_at(ip)
            .map_err(|e| RuntimeError::new(e.to_string()))?;
        trace!(function = %function.name, ip, op = %insn.op, depth = self.stack.len(), "step");
        let op = insn.op;
        let next = insn.next();

        match (op, insn.operand) {
            // Literals
            (Op::DLoad, Operand::Double(d)) => self.push(Value::Double(d)),
            (Op::ILoad, Operand::Int(n)) => self.push(Value::Integer(n)),
            (Op::SLoad, Operand::Str(id)) => self.push(Value::StringRef(id)),
            (Op::DLoad0, _) => self.push(Value::Double(0.0)),
            (Op::ILoad0, _) => self.push(Value::Integer(0)),
            (Op::SLoad0, _) => self.push(Value::StringRef(0)),
            (Op::DLoad1, _) => self.push(Value::Double(1.0)),
            (Op::ILoad1, _) => self.push(Value::Integer(1)),
            (Op::DLoadM1, _) => self.push(Value::Double(-1.0)),
            (Op::ILoadM1, _) => self.push(Value::Integer(-1)),

            // Arithmetic: the left operand is on top
            (Op::DAdd, _) => self.double_binop(op, |a, b| a + b)?,
            (Op::DSub, _) => self.double_binop(op, |a, b| a - b)?,
            (Op::DMul, _) => self.double_binop(op, |a, b| a * b)?,
            (Op::DDiv, _) => self.double_binop(op, |a, b| a / b)?,
            (Op::IAdd, _) => self.int_binop(op, |a, b| Ok(a.wrapping_add(b)))?,
            (Op::ISub, _) => self.int_binop(op, |a, b| Ok(a.wrapping_sub(b)))?,
            (Op::IMul, _) => self.int_binop(op, |a, b| Ok(a.wrapping_mul(b)))?,
            (Op::IDiv, _) => self.int_binop(op, |a, b| {
                if b == 0 {
                    Err(division_by_zero())
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            (Op::IMod, _) => self.int_binop(op, |a, b| {
                if b == 0 {
                    Err(division_by_zero())
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            (Op::IAOr, _) => self.int_binop(op, |a, b| Ok(a | b))?,
            (Op::IAAnd, _) => self.int_binop(op, |a, b| Ok(a & b))?,
            (Op::IAXor, _) => self.int_binop(op, |a, b| Ok(a ^ b))?,
            (Op::DNeg, _) => {
                let d = self.pop_double(op)?;
                self.push(Value::Double(-d));
            }
            (Op::INeg, _) => {
                let n = self.pop_int(op)?;
                self.push(Value::Integer(n.wrapping_neg()));
            }

            // Output
            (Op::IPrint, _) => {
                let n = self.pop_int(op)?;
                write!(self.out, "{}", n).map_err(io_error)?;
            }
            (Op::DPrint, _) => {
                let d = self.pop_double(op)?;
                write!(self.out, "{}", d).map_err(io_error)?;
            }
            (Op::SPrint, _) => {
                let id = self.pop_string(op)?;
                let text = lookup_string(program, &self.runtime_strings, id)?;
                write!(self.out, "{}", text).map_err(io_error)?;
            }

            // Conversions and stack shuffling
            (Op::I2D, _) => {
                let n = self.pop_int(op)?;
                self.push(Value::Double(n as f64));
            }
            (Op::D2I, _) => {
                let d = self.pop_double(op)?;
                self.push(Value::Integer(d as i64));
            }
            (Op::Swap, _) => {
                let upper = self.pop(op)?;
                let lower = self.pop(op)?;
                self.push(upper);
                self.push(lower);
            }
            (Op::Pop, _) => {
                self.pop(op)?;
            }

            // Variables
            (Op::LoadCtxDVar, Operand::Var { scope, slot }) => self.load_var(scope, slot, VarType::Double)?,
            (Op::LoadCtxIVar, Operand::Var { scope, slot }) => self.load_var(scope, slot, VarType::Integer)?,
            (Op::LoadCtxSVar, Operand::Var { scope, slot }) => self.load_var(scope, slot, VarType::String)?,
            (Op::StoreCtxDVar, Operand::Var { scope, slot }) => {
                self.store_var(op, scope, slot, VarType::Double)?
            }
            (Op::StoreCtxIVar, Operand::Var { scope, slot }) => {
                self.store_var(op, scope, slot, VarType::Integer)?
            }
            (Op::StoreCtxSVar, Operand::Var { scope, slot }) => {
                self.store_var(op, scope, slot, VarType::String)?
            }

            // Comparison
            (Op::DCmp, _) => {
                let upper = self.pop_double(op)?;
                let lower = self.pop_double(op)?;
                // unordered (NaN) compares as greater
                let result = match upper.partial_cmp(&lower) {
                    Some(Ordering::Less) => -1,
                    Some(Ordering::Equal) => 0,
                    Some(Ordering::Greater) | None => 1,
                };
                self.push(Value::Integer(result));
            }
            (Op::ICmp, _) => {
                let upper = self.pop_int(op)?;
                let lower = self.pop_int(op)?;
                self.push(Value::Integer(upper.cmp(&lower) as i64));
            }

            // Control flow
            (Op::Ja, Operand::Target(target)) => return Ok(Flow::Next(target)),
            (Op::IfICmpNe, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u != l),
            (Op::IfICmpE, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u == l),
            (Op::IfICmpG, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u > l),
            (Op::IfICmpGe, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u >= l),
            (Op::IfICmpL, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u < l),
            (Op::IfICmpLe, Operand::Target(target)) => return self.branch(op, target, next, |u, l| u <= l),

            (Op::Call, Operand::Function(callee)) => {
                return Ok(Flow::Call {
                    callee,
                    return_ip: next,
                });
            }
            (Op::CallNative, Operand::Native(id)) => self.call_native(program, id, natives)?,
            (Op::Return, _) => return Ok(Flow::Return),
            (Op::Stop, _) => return Ok(Flow::Halt),

            // placeholder for unrepresentable operations, e.g. printing a void call
            (Op::Invalid, _) => debug!(function = %function.name, ip, "skipping INVALID"),
            (op, operand) => {
                return Err(RuntimeError::new(format!(
                    "malformed instruction {} {:?}",
                    op, operand
                )));
            }
        }

        Ok(Flow::Next(next))
    }

    fn branch(&mut self, op: Op, target: usize, next: usize, taken: fn(i64, i64) -> bool) -> Result<Flow, RuntimeError> {
        let upper = self.pop_int(op)?;
        let lower = self.pop_int(op)?;
        Ok(Flow::Next(if taken(upper, lower) { target } else { next }))
    }

    fn call_native(
        &mut self,
        program: &ProgramBc,
        id: u16,
        natives: &mut dyn NativeBridge,
    ) -> Result<(), RuntimeError> {
        let decl = program
            .native(id)
            .ok_or_else(|| RuntimeError::new(format!("unknown native id {}", id)))?;

        let mut args = Vec::with_capacity(decl.params.len());
        for _ in &decl.params {
            let value = self.pop(Op::CallNative)?;
            args.push(self.to_host(program, value)?);
        }

        let result = natives
            .call(&decl.symbol, &args)
            .ok_or_else(|| unresolved_native(&decl.symbol))?
            .map_err(|msg| RuntimeError::new(format!("native '{}' failed: {}", decl.symbol, msg)))?;

        match (decl.return_type, result) {
            (VarType::Void | VarType::Invalid, _) => Ok(()),
            (ty, Some(value)) => {
                let value = self.from_host(program, value, ty)?;
                self.push(value);
                Ok(())
            }
            (_, None) => Err(RuntimeError::new(format!(
                "native '{}' returned no value",
                decl.symbol
            ))),
        }
    }

    // =========================================================================
    // Stack and variable helpers
    // =========================================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop one value, never reaching below the current frame's arguments.
    fn pop(&mut self, op: Op) -> Result<Value, RuntimeError> {
        if self.stack.len() <= self.frame_base() {
            return Err(stack_underflow(op.mnemonic()));
        }
        self.stack.pop().ok_or_else(|| stack_underflow(op.mnemonic()))
    }

    fn pop_int(&mut self, op: Op) -> Result<i64, RuntimeError> {
        match self.pop(op)? {
            Value::Integer(n) => Ok(n),
            other => Err(type_error(VarType::Integer, other.var_type().name())),
        }
    }

    fn pop_double(&mut self, op: Op) -> Result<f64, RuntimeError> {
        match self.pop(op)? {
            Value::Double(d) => Ok(d),
            other => Err(type_error(VarType::Double, other.var_type().name())),
        }
    }

    fn pop_string(&mut self, op: Op) -> Result<u16, RuntimeError> {
        match self.pop(op)? {
            Value::StringRef(id) => Ok(id),
            other => Err(type_error(VarType::String, other.var_type().name())),
        }
    }

    fn int_binop(&mut self, op: Op, f: impl FnOnce(i64, i64) -> Result<i64, RuntimeError>) -> Result<(), RuntimeError> {
        let upper = self.pop_int(op)?;
        let lower = self.pop_int(op)?;
        let result = f(upper, lower)?;
        self.push(Value::Integer(result));
        Ok(())
    }

    fn double_binop(&mut self, op: Op, f: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let upper = self.pop_double(op)?;
        let lower = self.pop_double(op)?;
        self.push(Value::Double(f(upper, lower)));
        Ok(())
    }

    /// Storage index of a variable in the innermost active instance of its
    /// scope.
    fn slot(&self, scope: u16, slot: u16) -> Result<usize, RuntimeError> {
        let base = self
            .scope_offsets
            .get(scope as usize)
            .and_then(|offsets| offsets.last())
            .copied()
            .ok_or_else(|| {
                RuntimeError::new(format!(
                    "variable {}:{} is not in any active frame",
                    scope, slot
                ))
            })?;
        let index = base + slot as usize;
        if index >= self.vars.len() {
            return Err(RuntimeError::new(format!(
                "variable {}:{} is outside its frame",
                scope, slot
            )));
        }
        Ok(index)
    }

    fn load_var(&mut self, scope: u16, slot: u16, ty: VarType) -> Result<(), RuntimeError> {
        let index = self.slot(scope, slot)?;
        let value = self.vars[index].unwrap_or(Value::zero(ty));
        if value.var_type() != ty {
            return Err(type_error(ty, value.var_type().name()));
        }
        self.push(value);
        Ok(())
    }

    fn store_var(&mut self, op: Op, scope: u16, slot: u16, ty: VarType) -> Result<(), RuntimeError> {
        let value = self.pop(op)?;
        if value.var_type() != ty {
            return Err(type_error(ty, value.var_type().name()));
        }
        let index = self.slot(scope, slot)?;
        self.vars[index] = Some(value);
        Ok(())
    }
}

fn find_top_var<'p>(program: &'p ProgramBc, name: &str) -> Option<&'p TopVar> {
    program.top_vars.iter().find(|v| v.name == name)
}

fn lookup_string<'a>(program: &'a ProgramBc, runtime: &'a [String], id: u16) -> Result<&'a str, RuntimeError> {
    let pooled = program.strings.len();
    let text = if (id as usize) < pooled {
        program.strings.get(id)
    } else {
        runtime.get(id as usize - pooled).map(String::as_str)
    };
    text.ok_or_else(|| RuntimeError::new(format!("unknown string id {}", id)))
}

fn io_error(e: io::Error) -> RuntimeError {
    RuntimeError::new(format!("output error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::CodeBuilder;
    use crate::bytecode::compile::Compiler;
    use crate::bytecode::ir::{NativeDecl, ScopeLayout};
    use crate::lang::build::*;
    use crate::lang::program::Program;
    use pretty_assertions::assert_eq;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// A program whose `<top>` is the given stream, with two slots in scope 1.
    fn program_from(build: impl FnOnce(&mut CodeBuilder)) -> ProgramBc {
        let mut code = CodeBuilder::new();
        build(&mut code);
        let mut program = ProgramBc::new();
        program.scope_count = 2;
        program.add_function(BytecodeFunction {
            id: 0,
            name: "<top>".to_string(),
            declaring_scope: 0,
            scope: 1,
            params: Vec::new(),
            return_type: VarType::Void,
            locals: 2,
            layout: vec![ScopeLayout {
                scope: 1,
                base: 0,
                size: 2,
            }],
            code: code.finish().unwrap(),
        });
        program
    }

    fn run_with_config(
        program: &ProgramBc,
        config: VmBcConfig,
    ) -> Result<(Vec<Value>, String), RuntimeError> {
        let mut vm = VmBc::with_output(Vec::new(), config);
        vm.run_program(program)?;
        let stack = vm.stack().to_vec();
        Ok((stack, String::from_utf8(vm.into_output()).unwrap()))
    }

    fn run_code(build: impl FnOnce(&mut CodeBuilder)) -> Result<(Vec<Value>, String), RuntimeError> {
        run_with_config(&program_from(build), VmBcConfig::default())
    }

    fn assert_stack(build: impl FnOnce(&mut CodeBuilder), expected: Vec<Value>) {
        let (stack, _) = run_code(build).expect("execution should succeed");
        assert_eq!(stack, expected, "stack mismatch");
    }

    fn assert_error(build: impl FnOnce(&mut CodeBuilder), error_contains: &str) {
        match run_code(build) {
            Ok((stack, _)) => panic!(
                "expected error containing '{}', got stack: {:?}",
                error_contains, stack
            ),
            Err(e) => assert!(
                e.message.contains(error_contains),
                "expected error containing '{}', got: {}",
                error_contains,
                e.message
            ),
        }
    }

    fn iload(c: &mut CodeBuilder, n: i64) {
        c.add_op(Op::ILoad);
        c.add_i64(n);
    }

    fn dload(c: &mut CodeBuilder, d: f64) {
        c.add_op(Op::DLoad);
        c.add_f64(d);
    }

    fn var(c: &mut CodeBuilder, op: Op, slot: u16) {
        c.add_op(op);
        c.add_u16(1);
        c.add_u16(slot);
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    #[test]
    fn test_left_operand_is_on_top() {
        assert_stack(
            |c| {
                iload(c, 4);
                iload(c, 10);
                c.add_op(Op::ISub);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(6)],
        );
    }

    #[test]
    fn test_double_division() {
        assert_stack(
            |c| {
                dload(c, 4.0);
                dload(c, 10.0);
                c.add_op(Op::DDiv);
                c.add_op(Op::Stop);
            },
            vec![Value::Double(2.5)],
        );
    }

    #[test]
    fn test_integer_division_by_zero() {
        let err = run_code(|c| {
            iload(c, 0);
            iload(c, 5);
            c.add_op(Op::IDiv);
            c.add_op(Op::Stop);
        })
        .unwrap_err();
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.function.as_deref(), Some("<top>"));
        assert_eq!(err.offset, Some(18));
        assert_eq!(err.call_stack, vec!["<top>".to_string()]);
    }

    #[test]
    fn test_modulo_by_zero() {
        assert_error(
            |c| {
                c.add_op(Op::ILoad0);
                c.add_op(Op::ILoad1);
                c.add_op(Op::IMod);
                c.add_op(Op::Stop);
            },
            "division by zero",
        );
    }

    #[test]
    fn test_integer_overflow_wraps() {
        assert_stack(
            |c| {
                c.add_op(Op::ILoadM1);
                iload(c, i64::MIN);
                c.add_op(Op::IDiv);
                iload(c, 1);
                iload(c, i64::MAX);
                c.add_op(Op::IAdd);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(i64::MIN), Value::Integer(i64::MIN)],
        );
    }

    #[test]
    fn test_bitwise_and_negation() {
        assert_stack(
            |c| {
                iload(c, 0b1100);
                iload(c, 0b1010);
                c.add_op(Op::IAXor);
                c.add_op(Op::INeg);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(-0b0110)],
        );
    }

    #[test]
    fn test_comparisons() {
        assert_stack(
            |c| {
                dload(c, 1.0);
                dload(c, 2.0);
                c.add_op(Op::DCmp);
                iload(c, 5);
                iload(c, 2);
                c.add_op(Op::ICmp);
                c.add_op(Op::ILoad1);
                c.add_op(Op::ILoad1);
                c.add_op(Op::ICmp);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(1), Value::Integer(-1), Value::Integer(0)],
        );
    }

    #[test]
    fn test_nan_compares_as_greater() {
        assert_stack(
            |c| {
                dload(c, 1.0);
                dload(c, f64::NAN);
                c.add_op(Op::DCmp);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(1)],
        );
    }

    #[test]
    fn test_conversions_and_swap() {
        assert_stack(
            |c| {
                dload(c, 2.9);
                c.add_op(Op::D2I);
                iload(c, 3);
                c.add_op(Op::I2D);
                c.add_op(Op::Swap);
                c.add_op(Op::ILoad0);
                c.add_op(Op::Pop);
                c.add_op(Op::Stop);
            },
            vec![Value::Double(3.0), Value::Integer(2)],
        );
    }

    #[test]
    fn test_type_confusion_is_an_error() {
        assert_error(
            |c| {
                c.add_op(Op::DLoad1);
                c.add_op(Op::ILoad1);
                c.add_op(Op::IAdd);
                c.add_op(Op::Stop);
            },
            "type error: expected int, got double",
        );
    }

    // =========================================================================
    // Output
    // =========================================================================

    #[test]
    fn test_print_formats() {
        let (_, out) = run_code(|c| {
            iload(c, 42);
            c.add_op(Op::IPrint);
            dload(c, 2.5);
            c.add_op(Op::DPrint);
            dload(c, 3.0);
            c.add_op(Op::DPrint);
            c.add_op(Op::SLoad0);
            c.add_op(Op::SPrint);
            c.add_op(Op::Stop);
        })
        .unwrap();
        assert_eq!(out, "422.53");
    }

    #[test]
    fn test_print_string_from_pool() {
        let mut program = program_from(|c| {
            c.add_op(Op::SLoad);
            c.add_u16(1);
            c.add_op(Op::SPrint);
            c.add_op(Op::Stop);
        });
        program.strings.intern("hello");
        let (_, out) = run_with_config(&program, VmBcConfig::default()).unwrap();
        assert_eq!(out, "hello");
    }

    // =========================================================================
    // Variables and control flow
    // =========================================================================

    #[test]
    fn test_store_and_load() {
        assert_stack(
            |c| {
                iload(c, 7);
                var(c, Op::StoreCtxIVar, 0);
                var(c, Op::LoadCtxIVar, 0);
                var(c, Op::LoadCtxIVar, 0);
                c.add_op(Op::IAdd);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(14)],
        );
    }

    #[test]
    fn test_unwritten_slot_reads_as_zero() {
        assert_stack(
            |c| {
                var(c, Op::LoadCtxDVar, 1);
                c.add_op(Op::Stop);
            },
            vec![Value::Double(0.0)],
        );
    }

    #[test]
    fn test_store_checks_type() {
        assert_error(
            |c| {
                c.add_op(Op::DLoad1);
                var(c, Op::StoreCtxIVar, 0);
                c.add_op(Op::Stop);
            },
            "expected int",
        );
    }

    #[test]
    fn test_conditional_branch() {
        assert_stack(
            |c| {
                let taken = c.new_label();
                iload(c, 1);
                iload(c, 2);
                c.add_branch(Op::IfICmpG, taken).unwrap();
                iload(c, 100);
                c.add_op(Op::Stop);
                c.bind(taken).unwrap();
                iload(c, 200);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(200)],
        );
    }

    #[test]
    fn test_invalid_is_a_no_op() {
        assert_stack(
            |c| {
                c.add_op(Op::ILoad1);
                c.add_op(Op::Invalid);
                c.add_op(Op::Stop);
            },
            vec![Value::Integer(1)],
        );
    }

    #[test]
    fn test_out_of_range_ip() {
        let unverified = VmBcConfig {
            verify: false,
            ..VmBcConfig::default()
        };
        let program = program_from(|c| c.add_op(Op::ILoad1));
        let err = run_with_config(&program, unverified).unwrap_err();
        assert!(err.message.contains("out of range"));
        assert_eq!(err.offset, Some(1));
    }

    #[test]
    fn test_return_from_top_halts() {
        assert_stack(
            |c| {
                c.add_op(Op::ILoad1);
                c.add_op(Op::Return);
            },
            vec![Value::Integer(1)],
        );
    }

    // =========================================================================
    // Limits and verification
    // =========================================================================

    #[test]
    fn test_step_limit() {
        let program = program_from(|c| {
            let start = c.bound_label().unwrap();
            c.add_branch(Op::Ja, start).unwrap();
        });
        let config = VmBcConfig {
            max_steps: Some(100),
            ..VmBcConfig::default()
        };
        let err = run_with_config(&program, config).unwrap_err();
        assert!(err.message.contains("step limit exceeded"));
    }

    #[test]
    fn test_verification_rejects_underflow() {
        let program = program_from(|c| {
            c.add_op(Op::IAdd);
            c.add_op(Op::Stop);
        });
        let err = run_with_config(&program, VmBcConfig::default()).unwrap_err();
        assert!(err.message.contains("stack-check"));

        let unverified = VmBcConfig {
            verify: false,
            ..VmBcConfig::default()
        };
        let err = run_with_config(&program, unverified).unwrap_err();
        assert!(err.message.contains("stack underflow in IADD"));
    }

    #[test]
    fn test_call_depth_limit() {
        let mut program = Program::new();
        let top = program.top_scope();
        let body = program.declare_function(top, "forever", VarType::Void, &[]);
        program.define(body, vec![call("forever", vec![])]);
        program.define_top(vec![call("forever", vec![])]);
        let compiled = Compiler::new().compile_program(&program).unwrap();

        let config = VmBcConfig {
            max_call_depth: 50,
            ..VmBcConfig::default()
        };
        let err = run_with_config(&compiled, config).unwrap_err();
        assert!(err.message.contains("call depth limit exceeded (50)"));
        assert_eq!(err.call_stack.len(), 50);
    }

    // =========================================================================
    // Host boundary
    // =========================================================================

    #[test]
    fn test_unresolved_native() {
        let mut program = program_from(|c| {
            c.add_op(Op::CallNative);
            c.add_u16(0);
            c.add_op(Op::Stop);
        });
        program.add_native(NativeDecl {
            symbol: "beep".to_string(),
            params: Vec::new(),
            return_type: VarType::Void,
        });
        let err = run_with_config(&program, VmBcConfig::default()).unwrap_err();
        assert_eq!(err.message, "unresolved native function 'beep'");
    }

    #[test]
    fn test_host_var_type_mismatch() {
        let mut program = Program::new();
        let top = program.top_scope();
        program.declare_var(top, "x", VarType::Integer);
        let compiled = Compiler::new().compile_program(&program).unwrap();

        let mut vm = VmBc::with_output(Vec::new(), VmBcConfig::default());
        let mut vars = vec![HostVar::new("x", HostValue::Str("no".to_string()))];
        let err = vm
            .run(&compiled, &mut vars, &mut NativeTable::new())
            .unwrap_err();
        assert!(err.message.contains("host variable 'x' is string"));
    }

    #[test]
    fn test_runtime_strings_extend_the_pool() {
        let mut program = Program::new();
        let top = program.top_scope();
        program.declare_var(top, "s", VarType::String);
        program.define_top(vec![print(vec![load("s")])]);
        let compiled = Compiler::new().compile_program(&program).unwrap();

        let mut vm = VmBc::with_output(Vec::new(), VmBcConfig::default());
        let mut vars = vec![HostVar::new("s", HostValue::Str("from host".to_string()))];
        vm.run(&compiled, &mut vars, &mut NativeTable::new()).unwrap();
        assert_eq!(String::from_utf8(vm.into_output()).unwrap(), "from host");
        assert_eq!(vars[0].value, HostValue::Str("from host".to_string()));
    }
}
