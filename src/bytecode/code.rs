//! Instruction streams.
//!
//! [`CodeBuilder`] is the growable, label-aware stream the translator
//! writes into; [`CodeObject`] is the immutable result stored in a function
//! record. Both share one encoding: an opcode byte followed by its
//! little-endian operand (see [`OperandKind`]).

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{Op, OperandKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Translation-time placeholder for a branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelSlot {
    bound: Option<usize>,
    /// Offsets of branch operands waiting for this label.
    uses: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
    labels: Vec<LabelSlot>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next instruction will be written at.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn add_op(&mut self, op: Op) {
        self.bytes.push(op as u8);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Create a label that is not bound yet (forward reference).
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelSlot::default());
        Label(self.labels.len() - 1)
    }

    /// Create a label bound to the current position (backward reference).
    pub fn bound_label(&mut self) -> Result<Label, CompileError> {
        let label = self.new_label();
        self.bind(label)?;
        Ok(label)
    }

    /// Bind `label` to the current position and backfill every branch that
    /// referenced it.
    pub fn bind(&mut self, label: Label) -> Result<(), CompileError> {
        let target = self.position();
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or_else(|| CompileError::internal(format!("unknown label {}", label.0)))?;

        if slot.bound.is_some() {
            return Err(CompileError::internal(format!("label {} bound twice", label.0)));
        }
        slot.bound = Some(target);

        let uses = std::mem::take(&mut slot.uses);
        for at in uses {
            let offset = relative_offset(at, target)?;
            self.bytes[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        }
        Ok(())
    }

    /// Emit a branch instruction targeting `label`.
    pub fn add_branch(&mut self, op: Op, label: Label) -> Result<(), CompileError> {
        if !op.is_branch() {
            return Err(CompileError::internal(format!("{} is not a branch", op)));
        }
        self.add_op(op);
        let at = self.position();
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or_else(|| CompileError::internal(format!("unknown label {}", label.0)))?;

        let offset = match slot.bound {
            Some(target) => relative_offset(at, target)?,
            None => {
                slot.uses.push(at);
                0
            }
        };
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    /// Freeze the stream. Every label must have been bound.
    pub fn finish(self) -> Result<CodeObject, CompileError> {
        if let Some(index) = self.labels.iter().position(|l| l.bound.is_none()) {
            return Err(CompileError::UnboundLabel { label: index });
        }
        Ok(CodeObject { bytes: self.bytes })
    }
}

fn relative_offset(at: usize, target: usize) -> Result<i16, CompileError> {
    let delta = target as i64 - at as i64;
    i16::try_from(delta).map_err(|_| CompileError::BranchTooFar { at, target })
}

// =============================================================================
// Finished streams and decoding
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Double(f64),
    Str(u16),
    Var { scope: u16, slot: u16 },
    /// Absolute offset of the branch target.
    Target(usize),
    Function(u16),
    Native(u16),
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Insn {
    pub offset: usize,
    pub op: Op,
    pub operand: Operand,
}

impl Insn {
    /// Offset of the instruction that follows this one.
    pub fn next(&self) -> usize {
        self.offset + self.op.width()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("truncated {op} at {offset}")]
    Truncated { offset: usize, op: Op },

    #[error("instruction pointer {offset} out of range")]
    OutOfRange { offset: usize },

    #[error("branch at {offset} points before the start of the stream")]
    NegativeTarget { offset: usize },
}

/// An immutable, label-free instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    bytes: Vec<u8>,
}

impl CodeObject {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn decode_at(&self, offset: usize) -> Result<Insn, DecodeError> {
        let byte = *self
            .bytes
            .get(offset)
            .ok_or(DecodeError::OutOfRange { offset })?;
        let op = Op::from_byte(byte).ok_or(DecodeError::UnknownOpcode { offset, byte })?;

        let start = offset + 1;
        let raw = self
            .bytes
            .get(start..start + op.operand().width())
            .ok_or(DecodeError::Truncated { offset, op })?;

        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let operand = match op.operand() {
            OperandKind::None => Operand::None,
            OperandKind::Int64 => Operand::Int(i64::from_le_bytes(eight(raw))),
            OperandKind::Double => Operand::Double(f64::from_le_bytes(eight(raw))),
            OperandKind::StringId => Operand::Str(u16_at(0)),
            OperandKind::Var => Operand::Var {
                scope: u16_at(0),
                slot: u16_at(2),
            },
            OperandKind::Branch => {
                let delta = i16::from_le_bytes([raw[0], raw[1]]) as i64;
                let target = usize::try_from(start as i64 + delta)
                    .map_err(|_| DecodeError::NegativeTarget { offset })?;
                Operand::Target(target)
            }
            OperandKind::FunctionId => Operand::Function(u16_at(0)),
            OperandKind::NativeId => Operand::Native(u16_at(0)),
        };

        Ok(Insn {
            offset,
            op,
            operand,
        })
    }

    /// Decode the whole stream in order.
    pub fn instructions(&self) -> Result<Vec<Insn>, DecodeError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.bytes.len() {
            let insn = self.decode_at(offset)?;
            offset = insn.next();
            out.push(insn);
        }
        Ok(out)
    }
}

fn eight(raw: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_branch_is_backfilled() {
        let mut code = CodeBuilder::new();
        let after = code.new_label();
        code.add_branch(Op::Ja, after).unwrap();
        code.add_op(Op::ILoad1);
        code.bind(after).unwrap();
        code.add_op(Op::Stop);

        let code = code.finish().unwrap();
        let insns = code.instructions().unwrap();
        assert_eq!(insns[0].operand, Operand::Target(4));
        assert_eq!(insns[2].offset, 4);
        assert_eq!(insns[2].op, Op::Stop);
    }

    #[test]
    fn test_backward_branch() {
        let mut code = CodeBuilder::new();
        code.add_op(Op::ILoad0);
        let start = code.bound_label().unwrap();
        code.add_op(Op::Pop);
        code.add_branch(Op::Ja, start).unwrap();

        let code = code.finish().unwrap();
        let insns = code.instructions().unwrap();
        assert_eq!(insns[2].op, Op::Ja);
        assert_eq!(insns[2].operand, Operand::Target(1));
    }

    #[test]
    fn test_unbound_label_fails_finish() {
        let mut code = CodeBuilder::new();
        let label = code.new_label();
        code.add_branch(Op::IfICmpE, label).unwrap();
        assert!(matches!(code.finish(), Err(CompileError::UnboundLabel { .. })));
    }

    #[test]
    fn test_double_bind_is_internal_error() {
        let mut code = CodeBuilder::new();
        let label = code.bound_label().unwrap();
        assert!(matches!(code.bind(label), Err(CompileError::Internal(_))));
    }

    #[test]
    fn test_non_branch_rejected() {
        let mut code = CodeBuilder::new();
        let label = code.new_label();
        assert!(code.add_branch(Op::IAdd, label).is_err());
    }

    #[test]
    fn test_operands_round_trip_through_decoder() {
        let mut code = CodeBuilder::new();
        code.add_op(Op::ILoad);
        code.add_i64(-42);
        code.add_op(Op::DLoad);
        code.add_f64(2.5);
        code.add_op(Op::LoadCtxIVar);
        code.add_u16(3);
        code.add_u16(7);
        let code = code.finish().unwrap();

        let insns = code.instructions().unwrap();
        assert_eq!(insns[0].operand, Operand::Int(-42));
        assert_eq!(insns[1].operand, Operand::Double(2.5));
        assert_eq!(insns[2].operand, Operand::Var { scope: 3, slot: 7 });
        assert_eq!(insns[2].next(), code.len());
    }

    #[test]
    fn test_truncated_and_unknown() {
        let code = CodeObject {
            bytes: vec![Op::ILoad as u8, 1, 2],
        };
        assert!(matches!(code.decode_at(0), Err(DecodeError::Truncated { .. })));

        let code = CodeObject { bytes: vec![0xee] };
        assert!(matches!(code.decode_at(0), Err(DecodeError::UnknownOpcode { .. })));
        assert!(matches!(code.decode_at(5), Err(DecodeError::OutOfRange { offset: 5 })));
    }
}
