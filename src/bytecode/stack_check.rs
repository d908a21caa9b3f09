use std::collections::HashSet;

use thiserror::Error;
use tracing::trace;

use crate::bytecode::code::Operand;
use crate::bytecode::ir::{BytecodeFunction, ProgramBc};
use crate::bytecode::op::Op;
use crate::lang::types::VarType;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("stack-check error in '{function}' at {offset}: {message}")]
pub struct StackCheckError {
    pub function: String,
    pub offset: usize,
    pub message: String,
}

impl StackCheckError {
    fn new(function: &BytecodeFunction, offset: usize, message: impl Into<String>) -> Self {
        Self {
            function: function.name.clone(),
            offset,
            message: message.into(),
        }
    }
}

/// Verify every function of a program.
pub fn check_program(program: &ProgramBc) -> Result<(), StackCheckError> {
    for function in &program.functions {
        check_function(program, function)?;
    }
    Ok(())
}

/// Follow every reachable path through `function` and make sure no
/// instruction pops more than the stack holds. Returns the deepest operand
/// stack any path reaches.
///
/// Arguments are on the stack at entry. Where paths join, the lower height
/// wins, since a leftover value on one path is never read by the code that
/// follows.
pub fn check_function(program: &ProgramBc, function: &BytecodeFunction) -> Result<usize, StackCheckError> {
    let code = &function.code;
    let insns = code
        .instructions()
        .map_err(|e| StackCheckError::new(function, 0, e.to_string()))?;
    if insns.is_empty() {
        return Err(StackCheckError::new(function, 0, "empty function body"));
    }
    let boundaries: HashSet<usize> = insns.iter().map(|i| i.offset).collect();

    let mut heights: Vec<Option<usize>> = vec![None; code.len()];
    let mut work = vec![0usize];
    heights[0] = Some(function.param_count());
    let mut max_depth = function.param_count();

    while let Some(offset) = work.pop() {
        let Some(height) = heights[offset] else {
            continue;
        };
        let insn = code
            .decode_at(offset)
            .map_err(|e| StackCheckError::new(function, offset, e.to_string()))?;

        let (pops, pushes) = effect(program, function, insn.op, insn.operand, offset)?;
        if height < pops {
            return Err(StackCheckError::new(
                function,
                offset,
                format!(
                    "stack underflow: {} needs {} value(s), stack holds {}",
                    insn.op, pops, height
                ),
            ));
        }
        let after = height - pops + pushes;
        max_depth = max_depth.max(after);

        let mut successors = Vec::with_capacity(2);
        if let Operand::Target(target) = insn.operand {
            if target >= code.len() {
                return Err(StackCheckError::new(
                    function,
                    offset,
                    format!("branch target {} out of range", target),
                ));
            }
            if !boundaries.contains(&target) {
                return Err(StackCheckError::new(
                    function,
                    offset,
                    format!("branch target {} is inside an instruction", target),
                ));
            }
            successors.push(target);
        }
        if !insn.op.is_terminator() {
            let next = insn.next();
            if next >= code.len() {
                return Err(StackCheckError::new(
                    function,
                    offset,
                    "control falls off the end of the function",
                ));
            }
            successors.push(next);
        }

        for successor in successors {
            match heights[successor] {
                Some(known) if known <= after => {}
                _ => {
                    heights[successor] = Some(after);
                    work.push(successor);
                }
            }
        }
    }

    trace!(function = %function.name, max_depth, "stack check passed");
    Ok(max_depth)
}

/// (pops, pushes) of one instruction. Calls take theirs from the callee's
/// signature; operands that name a table entry must exist.
fn effect(
    program: &ProgramBc,
    function: &BytecodeFunction,
    op: Op,
    operand: Operand,
    offset: usize,
) -> Result<(usize, usize), StackCheckError> {
    match operand {
        Operand::Function(id) => {
            let callee = program.function(id).ok_or_else(|| {
                StackCheckError::new(function, offset, format!("unknown function id {}", id))
            })?;
            Ok((callee.param_count(), usize::from(callee.returns_value())))
        }
        Operand::Native(id) => {
            let native = program.native(id).ok_or_else(|| {
                StackCheckError::new(function, offset, format!("unknown native id {}", id))
            })?;
            let returns = !matches!(native.return_type, VarType::Void | VarType::Invalid);
            Ok((native.params.len(), usize::from(returns)))
        }
        Operand::Str(id) if program.strings.get(id).is_none() => Err(StackCheckError::new(
            function,
            offset,
            format!("unknown string id {}", id),
        )),
        Operand::Var { scope, .. } if scope as usize >= program.scope_count => Err(
            StackCheckError::new(function, offset, format!("unknown scope id {}", scope)),
        ),
        _ => op.effect().ok_or_else(|| {
            StackCheckError::new(function, offset, format!("{} has no static effect", op))
        }),
    }
}
