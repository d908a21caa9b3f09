use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Every instruction is one opcode byte followed by a fixed-width operand.
// Prefixes: `I` int, `D` double, `S` string. Binary ops consume the top of
// the stack as their left operand ("upper") and the value below it as the
// right operand ("lower").

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    /// Placeholder for unrepresentable cases; executes as a no-op.
    Invalid,

    // literals
    DLoad,
    ILoad,
    SLoad,
    DLoad0,
    ILoad0,
    SLoad0,
    DLoad1,
    ILoad1,
    DLoadM1,
    ILoadM1,

    // arithmetic
    DAdd,
    IAdd,
    DSub,
    ISub,
    DMul,
    IMul,
    DDiv,
    IDiv,
    IMod,
    DNeg,
    INeg,
    IAOr,
    IAAnd,
    IAXor,

    // I/O
    IPrint,
    DPrint,
    SPrint,

    // conversions and stack shuffling
    I2D,
    D2I,
    Swap,
    Pop,

    // scope-relative variables: operand is (scope-id, slot-id)
    LoadCtxDVar,
    LoadCtxIVar,
    LoadCtxSVar,
    StoreCtxDVar,
    StoreCtxIVar,
    StoreCtxSVar,

    // comparison: pushes cmp(upper, lower) as -1, 0 or 1
    DCmp,
    ICmp,

    // ==========================================================================
    // Control flow. Branch operands are i16 offsets relative to the operand's
    // own position. Conditional branches pop two ints and jump when
    // `upper OP lower` holds.
    // ==========================================================================
    Ja,
    IfICmpNe,
    IfICmpE,
    IfICmpG,
    IfICmpGe,
    IfICmpL,
    IfICmpLe,

    // calls
    Call,
    CallNative,
    Return,
    Stop,
}

/// Shape of the operand that follows an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int64,
    Double,
    StringId,
    /// Two u16s: scope-id then slot-id.
    Var,
    /// i16 relative offset.
    Branch,
    FunctionId,
    NativeId,
}

impl OperandKind {
    pub fn width(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Int64 | OperandKind::Double => 8,
            OperandKind::Var => 4,
            OperandKind::StringId
            | OperandKind::Branch
            | OperandKind::FunctionId
            | OperandKind::NativeId => 2,
        }
    }
}

impl Op {
    /// All opcodes, indexed by their encoding.
    pub const ALL: [Op; 51] = [
        Op::Invalid,
        Op::DLoad,
        Op::ILoad,
        Op::SLoad,
        Op::DLoad0,
        Op::ILoad0,
        Op::SLoad0,
        Op::DLoad1,
        Op::ILoad1,
        Op::DLoadM1,
        Op::ILoadM1,
        Op::DAdd,
        Op::IAdd,
        Op::DSub,
        Op::ISub,
        Op::DMul,
        Op::IMul,
        Op::DDiv,
        Op::IDiv,
        Op::IMod,
        Op::DNeg,
        Op::INeg,
        Op::IAOr,
        Op::IAAnd,
        Op::IAXor,
        Op::IPrint,
        Op::DPrint,
        Op::SPrint,
        Op::I2D,
        Op::D2I,
        Op::Swap,
        Op::Pop,
        Op::LoadCtxDVar,
        Op::LoadCtxIVar,
        Op::LoadCtxSVar,
        Op::StoreCtxDVar,
        Op::StoreCtxIVar,
        Op::StoreCtxSVar,
        Op::DCmp,
        Op::ICmp,
        Op::Ja,
        Op::IfICmpNe,
        Op::IfICmpE,
        Op::IfICmpG,
        Op::IfICmpGe,
        Op::IfICmpL,
        Op::IfICmpLe,
        Op::Call,
        Op::CallNative,
        Op::Return,
        Op::Stop,
    ];

    pub fn from_byte(byte: u8) -> Option<Op> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn operand(self) -> OperandKind {
        use Op::*;
        match self {
            DLoad => OperandKind::Double,
            ILoad => OperandKind::Int64,
            SLoad => OperandKind::StringId,
            LoadCtxDVar | LoadCtxIVar | LoadCtxSVar | StoreCtxDVar | StoreCtxIVar
            | StoreCtxSVar => OperandKind::Var,
            Ja | IfICmpNe | IfICmpE | IfICmpG | IfICmpGe | IfICmpL | IfICmpLe => {
                OperandKind::Branch
            }
            Call => OperandKind::FunctionId,
            CallNative => OperandKind::NativeId,
            _ => OperandKind::None,
        }
    }

    /// Total encoded width: opcode byte plus operand.
    pub fn width(self) -> usize {
        1 + self.operand().width()
    }

    /// Returns (pops, pushes), or None when the effect depends on the
    /// callee's signature.
    pub fn effect(self) -> Option<(usize, usize)> {
        use Op::*;
        Some(match self {
            Invalid => (0, 0),

            DLoad | ILoad | SLoad | DLoad0 | ILoad0 | SLoad0 | DLoad1 | ILoad1 | DLoadM1
            | ILoadM1 => (0, 1),

            DAdd | IAdd | DSub | ISub | DMul | IMul | DDiv | IDiv | IMod | IAOr | IAAnd
            | IAXor => (2, 1),
            DNeg | INeg => (1, 1),

            IPrint | DPrint | SPrint => (1, 0),

            I2D | D2I => (1, 1),
            Swap => (2, 2),
            Pop => (1, 0),

            LoadCtxDVar | LoadCtxIVar | LoadCtxSVar => (0, 1),
            StoreCtxDVar | StoreCtxIVar | StoreCtxSVar => (1, 0),

            DCmp | ICmp => (2, 1),

            Ja => (0, 0),
            IfICmpNe | IfICmpE | IfICmpG | IfICmpGe | IfICmpL | IfICmpLe => (2, 0),

            // the returned value, if any, is checked against the signature
            Return | Stop => (0, 0),

            Call | CallNative => return None,
        })
    }

    pub fn is_branch(self) -> bool {
        self.operand() == OperandKind::Branch
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(self, Op::Ja | Op::Return | Op::Stop)
    }

    pub fn mnemonic(self) -> &'static str {
        use Op::*;
        match self {
            Invalid => "INVALID",
            DLoad => "DLOAD",
            ILoad => "ILOAD",
            SLoad => "SLOAD",
            DLoad0 => "DLOAD0",
            ILoad0 => "ILOAD0",
            SLoad0 => "SLOAD0",
            DLoad1 => "DLOAD1",
            ILoad1 => "ILOAD1",
            DLoadM1 => "DLOADM1",
            ILoadM1 => "ILOADM1",
            DAdd => "DADD",
            IAdd => "IADD",
            DSub => "DSUB",
            ISub => "ISUB",
            DMul => "DMUL",
            IMul => "IMUL",
            DDiv => "DDIV",
            IDiv => "IDIV",
            IMod => "IMOD",
            DNeg => "DNEG",
            INeg => "INEG",
            IAOr => "IAOR",
            IAAnd => "IAAND",
            IAXor => "IAXOR",
            IPrint => "IPRINT",
            DPrint => "DPRINT",
            SPrint => "SPRINT",
            I2D => "I2D",
            D2I => "D2I",
            Swap => "SWAP",
            Pop => "POP",
            LoadCtxDVar => "LOADCTXDVAR",
            LoadCtxIVar => "LOADCTXIVAR",
            LoadCtxSVar => "LOADCTXSVAR",
            StoreCtxDVar => "STORECTXDVAR",
            StoreCtxIVar => "STORECTXIVAR",
            StoreCtxSVar => "STORECTXSVAR",
            DCmp => "DCMP",
            ICmp => "ICMP",
            Ja => "JA",
            IfICmpNe => "IFICMPNE",
            IfICmpE => "IFICMPE",
            IfICmpG => "IFICMPG",
            IfICmpGe => "IFICMPGE",
            IfICmpL => "IFICMPL",
            IfICmpLe => "IFICMPLE",
            Call => "CALL",
            CallNative => "CALLNATIVE",
            Return => "RETURN",
            Stop => "STOP",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_matches_table_order() {
        for (index, op) in Op::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index, "{} is out of place", op);
            assert_eq!(Op::from_byte(index as u8), Some(*op));
        }
    }

    #[test]
    fn test_unknown_byte() {
        assert_eq!(Op::from_byte(Op::ALL.len() as u8), None);
        assert_eq!(Op::from_byte(0xff), None);
    }

    #[test]
    fn test_widths() {
        assert_eq!(Op::IAdd.width(), 1);
        assert_eq!(Op::ILoad.width(), 9);
        assert_eq!(Op::DLoad.width(), 9);
        assert_eq!(Op::SLoad.width(), 3);
        assert_eq!(Op::LoadCtxIVar.width(), 5);
        assert_eq!(Op::IfICmpG.width(), 3);
        assert_eq!(Op::Call.width(), 3);
    }

    #[test]
    fn test_conditional_branches_pop_two() {
        for op in [Op::IfICmpNe, Op::IfICmpE, Op::IfICmpG, Op::IfICmpGe, Op::IfICmpL, Op::IfICmpLe] {
            assert!(op.is_branch());
            assert_eq!(op.effect(), Some((2, 0)));
        }
        assert_eq!(Op::Ja.effect(), Some((0, 0)));
    }

    #[test]
    fn test_call_effect_is_dynamic() {
        assert_eq!(Op::Call.effect(), None);
        assert_eq!(Op::CallNative.effect(), None);
    }
}
