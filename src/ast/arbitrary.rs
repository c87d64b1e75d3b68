//! Arbitrary expression generator and reference evaluator.
//!
//! The strategies here build random pure expression trees over integers
//! and doubles, and [`eval`] computes the value such a tree must produce,
//! bit for bit, when compiled and executed. Property tests and the fuzz
//! binary compare the two.
//!
//! The evaluator mirrors the machine semantics rather than plain Rust
//! semantics: integer arithmetic wraps, shifts mask their count to five
//! bits, double-to-int truncation yields `i32::MIN` for out-of-range and
//! NaN inputs (as `cvttsd2si` does), and floating-point comparisons follow
//! the flags an ordered compare produces, so NaN compares equal to
//! everything and is falsy in logical operators.

use std::cmp::Ordering;

use proptest::prelude::*;

use super::{AstNode, BinaryOp, NodeKind, UnaryOp};

/// Value of a pure expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// An Int32 result.
    Int(i32),
    /// A Double result.
    Double(f64),
}

impl Value {
    fn as_double(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Double(v) => v,
        }
    }

    fn as_int(self) -> i32 {
        match self {
            Value::Int(v) => v,
            Value::Double(v) => truncate(v),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Double(v) => matches!(v.partial_cmp(&0.0), Some(o) if o != Ordering::Equal),
        }
    }
}

/// Double-to-int conversion with `cvttsd2si` semantics.
fn truncate(d: f64) -> i32 {
    if d.is_nan() || d >= 2_147_483_648.0 || d < -2_147_483_648.0 {
        i32::MIN
    } else {
        d as i32
    }
}

/// Comparison through the integer flags an ordered floating-point compare
/// of `right` against `left` sets: unordered operands raise both the zero
/// and carry flags.
fn float_compare(op: BinaryOp, left: f64, right: f64) -> bool {
    let (zf, cf) = if left.is_nan() || right.is_nan() {
        (true, true)
    } else if right == left {
        (true, false)
    } else {
        (false, right < left)
    };
    match op {
        BinaryOp::Eq => zf,
        BinaryOp::Ne => !zf,
        BinaryOp::Gt => cf,
        BinaryOp::Ge => cf || zf,
        BinaryOp::Lt => !cf && !zf,
        BinaryOp::Le => !cf,
        _ => unreachable!("not a comparison operator"),
    }
}

/// Evaluate a pure expression tree.
///
/// # Panics
/// Panics on nodes that are not pure int/double expressions (variables,
/// calls, statements, string operations).
pub fn eval(node: &AstNode) -> Value {
    match &node.kind {
        NodeKind::Literal(super::Literal::Int32(v)) => Value::Int(*v),
        NodeKind::Literal(super::Literal::Double(v)) => Value::Double(*v),
        NodeKind::Binary { op, lhs, rhs } => {
            let left = eval(lhs);
            let right = eval(rhs);
            match (left, right) {
                (Value::Int(l), Value::Int(r)) => eval_int(*op, l, r),
                _ => eval_float(*op, left, right),
            }
        }
        NodeKind::Unary { op, operand } => {
            let value = eval(operand);
            match (op, value) {
                (UnaryOp::Negate, Value::Int(v)) => Value::Int(v.wrapping_mul(-1)),
                (UnaryOp::Negate, Value::Double(v)) => Value::Double(v * -1.0),
                (UnaryOp::LogicalNot, _) => Value::Int(!value.truthy() as i32),
                (UnaryOp::BitwiseNot, _) => Value::Int(value.as_int() ^ !0),
            }
        }
        _ => panic!("not a pure expression: {:?}", node.kind),
    }
}

fn eval_int(op: BinaryOp, l: i32, r: i32) -> Value {
    Value::Int(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => l.wrapping_div(r),
        BinaryOp::Mod => l.wrapping_rem(r),
        BinaryOp::Eq => (l == r) as i32,
        BinaryOp::Ne => (l != r) as i32,
        BinaryOp::Gt => (l > r) as i32,
        BinaryOp::Ge => (l >= r) as i32,
        BinaryOp::Lt => (l < r) as i32,
        BinaryOp::Le => (l <= r) as i32,
        BinaryOp::Shl => l.wrapping_shl(r as u32),
        BinaryOp::Shr => l.wrapping_shr(r as u32),
        BinaryOp::Xor => l ^ r,
        BinaryOp::Or => l | r,
        BinaryOp::And => l & r,
        BinaryOp::LogOr => (l != 0 || r != 0) as i32,
        BinaryOp::LogAnd => (l != 0 && r != 0) as i32,
        BinaryOp::Index => panic!("integers cannot be indexed"),
    })
}

fn eval_float(op: BinaryOp, left: Value, right: Value) -> Value {
    match op {
        BinaryOp::Add => Value::Double(left.as_double() + right.as_double()),
        BinaryOp::Sub => Value::Double(left.as_double() - right.as_double()),
        BinaryOp::Mul => Value::Double(left.as_double() * right.as_double()),
        BinaryOp::Div => Value::Double(left.as_double() / right.as_double()),
        BinaryOp::Mod => Value::Int(left.as_int().wrapping_rem(right.as_int())),
        BinaryOp::Eq
        | BinaryOp::Ne
        | BinaryOp::Gt
        | BinaryOp::Ge
        | BinaryOp::Lt
        | BinaryOp::Le => Value::Int(float_compare(op, left.as_double(), right.as_double()) as i32),
        BinaryOp::Shl => Value::Int(left.as_int().wrapping_shl(right.as_int() as u32)),
        BinaryOp::Shr => Value::Int(left.as_int().wrapping_shr(right.as_int() as u32)),
        BinaryOp::Xor => Value::Int(left.as_int() ^ right.as_int()),
        BinaryOp::Or => Value::Int(left.as_int() | right.as_int()),
        BinaryOp::And => Value::Int(left.as_int() & right.as_int()),
        BinaryOp::LogOr => Value::Int((left.truthy() || right.truthy()) as i32),
        BinaryOp::LogAnd => Value::Int((left.truthy() && right.truthy()) as i32),
        BinaryOp::Index => panic!("doubles cannot be indexed"),
    }
}

/// Generate an arbitrary pure expression over integers and doubles.
///
/// Division and remainder are left out: a random divisor can be zero (or
/// produce the overflowing `i32::MIN / -1` case), which faults in `idiv`.
/// The unit tests exercise those operators with controlled operands.
pub fn arb_pure_expr() -> impl Strategy<Value = AstNode> {
    let leaf = prop_oneof![
        (-1000..1000i32).prop_map(AstNode::int32),
        (-1.0e6..1.0e6f64).prop_map(AstNode::double),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (arb_binary_op(), inner.clone(), inner.clone())
                .prop_map(|(op, lhs, rhs)| AstNode::binary(op, lhs, rhs)),
            (arb_unary_op(), inner).prop_map(|(op, operand)| AstNode::unary(op, operand)),
        ]
    })
}

fn arb_binary_op() -> impl Strategy<Value = BinaryOp> {
    prop::sample::select(vec![
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Xor,
        BinaryOp::Or,
        BinaryOp::And,
        BinaryOp::LogOr,
        BinaryOp::LogAnd,
    ])
}

fn arb_unary_op() -> impl Strategy<Value = UnaryOp> {
    prop::sample::select(vec![UnaryOp::Negate, UnaryOp::LogicalNot, UnaryOp::BitwiseNot])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn evaluator_matches_hand_results() {
        // 5 * (8 - 3)
        let e = AstNode::binary(
            BinaryOp::Mul,
            AstNode::int32(5),
            AstNode::binary(BinaryOp::Sub, AstNode::int32(8), AstNode::int32(3)),
        );
        assert_eq!(eval(&e), Value::Int(25));

        // 1 + 2.5 promotes to double
        let e = AstNode::binary(BinaryOp::Add, AstNode::int32(1), AstNode::double(2.5));
        assert_eq!(eval(&e), Value::Double(3.5));

        // 5.6 % 8 truncates the left operand
        let e = AstNode::binary(BinaryOp::Mod, AstNode::double(5.6), AstNode::int32(8));
        assert_eq!(eval(&e), Value::Int(5));
    }

    #[test]
    fn truncation_saturates_to_indefinite() {
        assert_eq!(truncate(1.9), 1);
        assert_eq!(truncate(-1.9), -1);
        assert_eq!(truncate(1.0e12), i32::MIN);
        assert_eq!(truncate(f64::NAN), i32::MIN);
    }

    #[test]
    fn generated_trees_evaluate() {
        let mut runner = TestRunner::default();
        for _ in 0..64 {
            let tree = arb_pure_expr().new_tree(&mut runner).unwrap().current();
            // must not panic
            let _ = eval(&tree);
        }
    }
}
