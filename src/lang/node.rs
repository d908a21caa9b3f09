use super::program::ScopeId;
use serde::{Deserialize, Serialize};

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// Logical `&&`, evaluated on both sides.
    And,
    /// Logical `||`, evaluated on both sides.
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// `a..b`; only legal as the range of a `for` loop.
    Range,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Range => "..",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

/// Assignment flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// `x = e`
    Assign,
    /// `x += e`
    AddAssign,
    /// `x -= e`
    SubAssign,
}

/// A lexical block: the scope it introduces and its statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub scope: ScopeId,
    pub statements: Vec<Node>,
}

/// Abstract Syntax Tree node.
///
/// Variables and functions are referenced by name and resolved through the
/// scope chain of the enclosing block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    // ───────────────────────────── Literals ─────────────────────────────
    /// Stack effect: `( -- n )`
    IntLiteral(i64),

    /// Stack effect: `( -- d )`
    DoubleLiteral(f64),

    /// Stack effect: `( -- s )`
    StringLiteral(String),

    // ───────────────────────────── Variables ────────────────────────────
    /// Read a variable.
    ///
    /// Stack effect: `( -- x )`
    Load(String),

    /// Assign to a variable, optionally combining with its current value.
    ///
    /// Stack effect: `( -- )`
    Store {
        name: String,
        op: StoreOp,
        value: Box<Node>,
    },

    // ──────────────────────────── Expressions ───────────────────────────
    /// Stack effect: `( -- a op b )`
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },

    /// Stack effect: `( -- op a )`
    Unary { op: UnaryOp, operand: Box<Node> },

    /// Call a function declared in an enclosing scope.
    ///
    /// Stack effect: `( -- result )`, or `( -- )` for void functions.
    Call { name: String, args: Vec<Node> },

    // ──────────────────────────── Statements ────────────────────────────
    /// Nested block with its own scope.
    Block(Block),

    If {
        condition: Box<Node>,
        then_block: Block,
        else_block: Option<Block>,
    },

    While { condition: Box<Node>, body: Block },

    /// `for (var in lower..upper) body`, inclusive of `upper`.
    For {
        var: String,
        range: Box<Node>,
        body: Block,
    },

    Return(Option<Box<Node>>),

    /// Print each operand in order, without separators.
    Print(Vec<Node>),

    /// Body of a native function: forward the enclosing function's
    /// parameters to the host symbol.
    NativeCall { symbol: String },
}
