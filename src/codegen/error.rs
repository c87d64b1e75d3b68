//! Error type for the code generator.

use miette::Diagnostic;
use thiserror::Error;

use crate::ast::DataType;

/// Error type for the code generator.
///
/// None of these are recoverable mid-emission: each aborts the compile
/// immediately, the compile-time state is discarded and the buffer is
/// cleared before the error is returned.
#[derive(Error, Diagnostic, Debug)]
pub enum CodegenError {
    /// A variable was referenced without a declaration in any enclosing
    /// scope.
    #[error("variable `{name}` is not declared")]
    #[diagnostic(code(exprjit::unknown_variable))]
    UnknownVariable {
        /// The undeclared name.
        name: String,
    },

    /// The same name was declared twice in one scope.
    #[error("variable `{name}` is already declared in this scope")]
    #[diagnostic(code(exprjit::duplicate_variable))]
    DuplicateVariable {
        /// The re-declared name.
        name: String,
    },

    /// A string literal was used without being registered on the function
    /// record, so no stack storage was laid out for it.
    #[error("string literal {literal:?} is not registered with the function")]
    #[diagnostic(code(exprjit::unregistered_literal))]
    UnregisteredStringLiteral {
        /// The literal text.
        literal: String,
    },

    /// `break` outside of a loop or switch.
    #[error("`break` outside of a loop or switch")]
    #[diagnostic(code(exprjit::stray_break))]
    StrayBreak,

    /// `continue` outside of a loop.
    #[error("`continue` outside of a loop")]
    #[diagnostic(code(exprjit::stray_continue))]
    StrayContinue,

    /// `case` with no enclosing switch.
    #[error("`case` outside of a switch")]
    #[diagnostic(code(exprjit::stray_case))]
    StrayCase,

    /// `default` with no enclosing switch.
    #[error("`default` outside of a switch")]
    #[diagnostic(code(exprjit::stray_default))]
    StrayDefault,

    /// More than one `default` label in a single switch.
    #[error("multiple `default` labels in one switch")]
    #[diagnostic(code(exprjit::duplicate_default))]
    DuplicateDefault,

    /// A local variable declared directly in a switch body would be
    /// skipped by the dispatch jump.
    #[error("local variable declared directly in a switch body; wrap it in a scope")]
    #[diagnostic(code(exprjit::declaration_in_switch))]
    DeclarationInSwitch,

    /// A node violates its structural contract.
    #[error("malformed syntax tree: {reason}")]
    #[diagnostic(code(exprjit::bad_ast))]
    BadAst {
        /// What the node got wrong.
        reason: &'static str,
    },

    /// No conversion exists between the two value kinds.
    #[error("unsupported cast from {from:?} to {to:?}")]
    #[diagnostic(code(exprjit::bad_cast))]
    BadCast {
        /// Source type.
        from: DataType,
        /// Requested type.
        to: DataType,
    },

    /// The shadow stack model detected an inconsistency; this is a bug in
    /// the generator rather than in the input.
    #[error("code generator invariant violated: {reason}")]
    #[diagnostic(code(exprjit::internal))]
    Internal {
        /// The violated invariant.
        reason: &'static str,
    },

    /// The operating system refused to allocate executable pages.
    #[error("failed to allocate executable memory")]
    #[diagnostic(code(exprjit::out_of_memory))]
    OutOfMemory(#[source] region::Error),
}

/// Result alias for code generation.
pub type Result<T> = std::result::Result<T, CodegenError>;
