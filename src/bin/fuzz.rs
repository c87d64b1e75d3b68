//! Differential fuzzing: generate random pure expressions, compile them,
//! and compare the executed result bit for bit against the reference
//! evaluator.
//!
//! Run with `cargo run --bin fuzz --features proptest [iterations]`.

use proptest::strategy::{Strategy, ValueTree};
use proptest::test_runner::TestRunner;

use exprjit::ast::arbitrary::{arb_pure_expr, eval, Value};
use exprjit::{AstNode, CodeBuffer, DataType, Function};

fn main() {
    let iterations: u32 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(10_000);

    let mut runner = TestRunner::default();
    for i in 0..iterations {
        let expr = arb_pure_expr()
            .new_tree(&mut runner)
            .expect("expression strategy failed")
            .current();
        check(expr);
        if (i + 1) % 1000 == 0 {
            println!("{} expressions checked", i + 1);
        }
    }
    println!("fuzzing finished");
}

fn check(expr: AstNode) {
    let expected = eval(&expr);
    let shape = format!("{expr:?}");
    let mut buf = CodeBuffer::new();
    match expected {
        Value::Int(v) => {
            let mut f = Function::new().statement(AstNode::ret(expr, DataType::Int32));
            f.compile(&mut buf).expect("compile failed");
            let got = unsafe { call_int(buf.executable_address()) };
            assert_eq!(got, v, "integer mismatch for {shape}");
        }
        Value::Double(v) => {
            let mut f = Function::new().statement(AstNode::ret(expr, DataType::Double));
            f.compile(&mut buf).expect("compile failed");
            let got = unsafe { call_double(buf.executable_address()) };
            assert_eq!(got.to_bits(), v.to_bits(), "double mismatch for {shape}");
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn call_int(address: *const u8) -> i32 {
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(address) };
    unsafe { f() }
}

#[cfg(target_arch = "x86_64")]
unsafe fn call_double(address: *const u8) -> f64 {
    let f: unsafe extern "win64" fn() -> f64 = unsafe { std::mem::transmute(address) };
    unsafe { f() }
}

#[cfg(target_arch = "x86")]
unsafe fn call_int(address: *const u8) -> i32 {
    let f: unsafe extern "cdecl" fn() -> i32 = unsafe { std::mem::transmute(address) };
    unsafe { f() }
}

#[cfg(target_arch = "x86")]
unsafe fn call_double(address: *const u8) -> f64 {
    let f: unsafe extern "cdecl" fn() -> f64 = unsafe { std::mem::transmute(address) };
    unsafe { f() }
}
