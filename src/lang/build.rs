//! Shorthand constructors for AST nodes.
//!
//! Hosts that produce Cinder programs without a parser (and the tests)
//! build trees with these instead of spelling out `Box::new` everywhere.

use super::node::{BinaryOp, Block, Node, StoreOp, UnaryOp};
use super::program::ScopeId;

pub fn int(n: i64) -> Node {
    Node::IntLiteral(n)
}

pub fn double(d: f64) -> Node {
    Node::DoubleLiteral(d)
}

pub fn string(s: &str) -> Node {
    Node::StringLiteral(s.to_string())
}

pub fn load(name: &str) -> Node {
    Node::Load(name.to_string())
}

pub fn store(name: &str, op: StoreOp, value: Node) -> Node {
    Node::Store {
        name: name.to_string(),
        op,
        value: Box::new(value),
    }
}

pub fn assign(name: &str, value: Node) -> Node {
    store(name, StoreOp::Assign, value)
}

pub fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
    Node::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub fn add(left: Node, right: Node) -> Node {
    binary(BinaryOp::Add, left, right)
}

pub fn sub(left: Node, right: Node) -> Node {
    binary(BinaryOp::Sub, left, right)
}

pub fn mul(left: Node, right: Node) -> Node {
    binary(BinaryOp::Mul, left, right)
}

pub fn range(lower: Node, upper: Node) -> Node {
    binary(BinaryOp::Range, lower, upper)
}

pub fn unary(op: UnaryOp, operand: Node) -> Node {
    Node::Unary {
        op,
        operand: Box::new(operand),
    }
}

pub fn call(name: &str, args: Vec<Node>) -> Node {
    Node::Call {
        name: name.to_string(),
        args,
    }
}

pub fn print(operands: Vec<Node>) -> Node {
    Node::Print(operands)
}

pub fn ret(value: Option<Node>) -> Node {
    Node::Return(value.map(Box::new))
}

pub fn block(scope: ScopeId, statements: Vec<Node>) -> Block {
    Block { scope, statements }
}

pub fn if_else(condition: Node, then_block: Block, else_block: Option<Block>) -> Node {
    Node::If {
        condition: Box::new(condition),
        then_block,
        else_block,
    }
}

pub fn while_loop(condition: Node, body: Block) -> Node {
    Node::While {
        condition: Box::new(condition),
        body,
    }
}

pub fn for_loop(var: &str, range: Node, body: Block) -> Node {
    Node::For {
        var: var.to_string(),
        range: Box::new(range),
        body,
    }
}
