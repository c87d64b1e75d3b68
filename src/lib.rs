//! An in-process JIT compiler for a small C-like expression language.
//!
//! Callers construct an abstract syntax tree describing one function
//! (parameters, body, optional return), compile it into a buffer of
//! executable memory, and call the result directly through a function
//! pointer. Four value kinds are supported: 32-bit signed integers,
//! IEEE-754 doubles, pointer-sized unsigned integers, and heap-allocated
//! mutable strings, plus immutable C-string literals.
//!
//! The generated code follows the platform's native C calling convention:
//! the Microsoft x64 convention on x86-64 and cdecl on x86. Only those
//! two targets are supported.
//!
//! ```
//! use exprjit::{AstNode, CodeBuffer, DataType, Function};
//!
//! // return 5 * (8 / 3);
//! let mut f = Function::new().statement(AstNode::ret(
//!     AstNode::binary(
//!         exprjit::BinaryOp::Mul,
//!         AstNode::int32(5),
//!         AstNode::binary(exprjit::BinaryOp::Div, AstNode::int32(8), AstNode::int32(3)),
//!     ),
//!     DataType::Int32,
//! ));
//!
//! let mut buf = CodeBuffer::new();
//! f.compile(&mut buf).unwrap();
//!
//! #[cfg(target_arch = "x86_64")]
//! unsafe {
//!     let call: unsafe extern "win64" fn() -> i32 =
//!         std::mem::transmute(buf.executable_address());
//!     assert_eq!(call(), 10);
//! }
//! ```
#![deny(missing_docs)]

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("exprjit generates x86 and x86-64 machine code only");

pub mod ast;
pub mod codegen;

pub use ast::{AstNode, BinaryOp, DataType, Function, Literal, NodeKind, UnaryOp};
pub use codegen::buffer::CodeBuffer;
pub use codegen::error::{CodegenError, Result};
