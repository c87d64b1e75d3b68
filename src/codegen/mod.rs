//! Code generator: AST to native x86 / x86-64 machine code.
//!
//! A single depth-first pass over the tree emits code into a
//! [`CodeBuffer`] through the [`asm`] encoder. There is no register
//! allocation: every expression delivers its result in a canonical
//! location (the accumulator, or the first SSE register / x87 top for
//! doubles), and binary operations spill the left operand to the machine
//! stack while the right one is computed.
//!
//! The generator mirrors the machine stack with a shadow `stack_offset`:
//! the byte distance from the stack pointer down to the return-address
//! slot. Parameters live at negative offsets, locals at positive ones,
//! and all variable access is `[esp + stack_offset - slot]`. Scopes track
//! their variables so that leaving a scope (normally or through `break`,
//! `continue` or `return`) frees the right amount of stack and runs the
//! string destructors in inverse allocation order.
//!
//! Forward control flow is emitted with placeholder 32-bit displacements
//! and patched once the target is known; `break` / `continue` / `case`
//! record themselves on the frame of the nearest eligible enclosing
//! construct, found by walking the scope-parent stack.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::trace;

use crate::ast::{AstNode, BinaryOp, DataType, Function, Literal, NodeKind, UnaryOp};

pub mod asm;
pub mod buffer;
pub mod error;
pub mod runtime;
pub mod x86;


use asm::Assembler;
use buffer::CodeBuffer;
use error::{CodegenError, Result};
use runtime::STRING_SIZE;
#[cfg(target_arch = "x86_64")]
use x86::Xmm;
use x86::{Cond, Reg, DOUBLE_SIZE, PTR_SIZE};

/// Byte distance of a stack slot from the return-address slot.
///
/// Negative offsets are parameter slots, positive offsets are locals and
/// other pushed storage; zero is the return address itself and never
/// holds a variable.
pub type StackOffset = i32;

/// Whether plain pointer loads and stores need the 64-bit operand size.
const WIDE_PTR: bool = cfg!(target_arch = "x86_64");

macro_rules! invariant {
    ($cond:expr, $reason:expr) => {
        if !($cond) {
            return Err(CodegenError::Internal { reason: $reason });
        }
    };
}

impl Function {
    /// Compile this function into `buf`.
    ///
    /// On success the buffer holds a complete function body; its base
    /// address, cast to a function pointer matching the parameter and
    /// return types under the target's calling convention (Microsoft x64
    /// on x86-64, cdecl on x86), is directly callable. Result types
    /// inferred during the pass are written back into the nodes.
    ///
    /// On failure the buffer is cleared and all compile-time state is
    /// discarded; no partially emitted code survives.
    pub fn compile(&mut self, buf: &mut CodeBuffer) -> Result<()> {
        let mut gen = Codegen::new();
        match gen.run(self, buf) {
            Ok(()) => Ok(()),
            Err(err) => {
                buf.clear();
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct VarInfo {
    data_type: DataType,
    offset: StackOffset,
}

/// A recorded forward jump: where its displacement word lives and the
/// position it is relative to.
#[derive(Debug, Clone, Copy)]
struct Jump {
    anchor: u32,
    from: u32,
}

/// A `case` label found while emitting a switch body.
#[derive(Debug, Clone, Copy)]
struct CaseSite {
    value: i32,
    begin: u32,
}

/// What introduced a scope. `break`, `continue`, `case` and `default`
/// walk this stack outward to find the construct they belong to and leave
/// their patch records on its frame.
#[derive(Debug)]
enum ScopeParent {
    /// The outermost function scope.
    Function,
    /// A plain block or an if/else arm: jumps pass through.
    Block,
    /// A for or while loop.
    Loop {
        breaks: Vec<Jump>,
        continues: Vec<Jump>,
    },
    /// A switch statement.
    Switch {
        breaks: Vec<Jump>,
        cases: Vec<CaseSite>,
        default_site: Option<u32>,
    },
}

impl ScopeParent {
    fn new_loop() -> Self {
        ScopeParent::Loop {
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }

    fn new_switch() -> Self {
        ScopeParent::Switch {
            breaks: Vec::new(),
            cases: Vec::new(),
            default_site: None,
        }
    }
}

/// Per-compile state. A fresh value is created for every
/// [`Function::compile`] call, so compiles of distinct functions never
/// share anything.
struct Codegen {
    stack_offset: StackOffset,
    parameter_stack_offset: StackOffset,
    scopes: Vec<HashMap<String, VarInfo>>,
    scope_parents: Vec<ScopeParent>,
    string_literal_locations: BTreeMap<String, StackOffset>,
    /// Bytes of string-literal storage between the return-address slot
    /// and the first local.
    literal_region_size: StackOffset,
}

impl Codegen {
    fn new() -> Self {
        Self {
            stack_offset: 0,
            parameter_stack_offset: 0,
            scopes: Vec::new(),
            scope_parents: Vec::new(),
            string_literal_locations: BTreeMap::new(),
            literal_region_size: 0,
        }
    }

    fn run(&mut self, func: &mut Function, buf: &mut CodeBuffer) -> Result<()> {
        self.increment_scope(ScopeParent::Function);
        self.process_parameters(func, buf)?;
        let original_parameter_offset = self.parameter_stack_offset;
        invariant!(
            self.parameter_stack_offset <= 0,
            "parameter stack offset must be non-positive"
        );
        self.push_string_literals(&func.string_literals, buf)?;
        self.literal_region_size = self.stack_offset;

        self.emit_body(&mut func.statements, buf)?;
        self.deallocate_variables_and_decrement_scope(buf)?;

        invariant!(
            self.parameter_stack_offset == original_parameter_offset,
            "parameter stack offset changed during emission"
        );
        invariant!(self.scope_parents.is_empty(), "scope parents left open");
        invariant!(self.scopes.is_empty(), "scopes left open");
        invariant!(
            self.stack_offset == self.literal_region_size,
            "stack not balanced after the function body"
        );
        Ok(())
    }

    // --- prologue -----------------------------------------------------

    /// Assign parameter slots and, on x86-64, store the register-passed
    /// parameters into their shadow-space slots so every parameter can be
    /// addressed uniformly relative to the stack pointer.
    fn process_parameters(&mut self, func: &Function, buf: &mut CodeBuffer) -> Result<()> {
        // The return address sits at shadow offset 0; parameters are just
        // before it.
        self.parameter_stack_offset = -PTR_SIZE;
        invariant!(self.scopes.len() == 1, "parameters processed outside the function scope");
        invariant!(self.scopes[0].is_empty(), "function scope not empty");
        for (data_type, name) in &func.parameters {
            if self.scopes[0].contains_key(name) {
                return Err(CodegenError::DuplicateVariable { name: name.clone() });
            }
            self.scopes[0].insert(
                name.clone(),
                VarInfo {
                    data_type: *data_type,
                    offset: self.parameter_stack_offset,
                },
            );
            match data_type {
                DataType::Double => self.parameter_stack_offset -= DOUBLE_SIZE,
                DataType::Int32 | DataType::Pointer | DataType::CharStar => {
                    self.parameter_stack_offset -= PTR_SIZE;
                }
                _ => {
                    return Err(CodegenError::BadAst {
                        reason: "invalid parameter type",
                    })
                }
            }
        }

        #[cfg(target_arch = "x86_64")]
        {
            let int_regs = [Reg::Ecx, Reg::Edx, Reg::R8, Reg::R9];
            let sse_regs = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
            let mut a = Assembler::new(buf);
            for (i, (data_type, _)) in func.parameters.iter().take(4).enumerate() {
                let slot = (i as i32 + 1) * 8;
                if *data_type == DataType::Double {
                    a.movsd_store(Reg::Esp, slot, sse_regs[i])?;
                } else {
                    a.store(Reg::Esp, slot, int_regs[i], true)?;
                }
            }
            // parameters past the fourth are already on the stack above
            // the shadow space
        }
        #[cfg(target_arch = "x86")]
        let _ = buf;
        Ok(())
    }

    /// Push the bytes of every registered string literal onto the stack
    /// in pointer-sized chunks, lowest address first, and record each
    /// literal's anchor offset.
    fn push_string_literals(
        &mut self,
        literals: &BTreeSet<String>,
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        let ptr = PTR_SIZE as usize;
        let mut a = Assembler::new(buf);
        for s in literals {
            let bytes = s.as_bytes();
            // make sure pointer-multiple-length strings are NUL-terminated, too
            if bytes.len() % ptr == 0 {
                a.push_imm_ptr(0)?;
                self.stack_offset += PTR_SIZE;
            }
            let padded = bytes.len().div_ceil(ptr) * ptr;
            for start in (0..padded).step_by(ptr).rev() {
                let mut chunk = 0usize;
                for k in (0..ptr).rev() {
                    chunk = (chunk << 8) | bytes.get(start + k).copied().unwrap_or(0) as usize;
                }
                a.push_imm_ptr(chunk)?;
                self.stack_offset += PTR_SIZE;
            }
            invariant!(
                !self.string_literal_locations.contains_key(s),
                "string literal storage laid out twice"
            );
            self.string_literal_locations
                .insert(s.clone(), self.stack_offset);
            trace!("literal {:?} anchored at shadow offset {}", s, self.stack_offset);
        }
        Ok(())
    }

    // --- scopes and unwinding -----------------------------------------

    fn increment_scope(&mut self, parent: ScopeParent) {
        trace!("scope open ({:?} parents deep)", self.scope_parents.len());
        self.scope_parents.push(parent);
        self.scopes.push(HashMap::new());
    }

    /// Free the top scope's variables, pop the scope, and hand back its
    /// parent frame so loops and switches can patch the jumps recorded on
    /// it.
    fn deallocate_variables_and_decrement_scope(
        &mut self,
        buf: &mut CodeBuffer,
    ) -> Result<ScopeParent> {
        invariant!(!self.scopes.is_empty(), "scope stack underflow");
        let freed = self.deallocate_variables(self.scopes.len() - 1, buf)?;
        self.stack_offset -= freed;
        self.scopes.pop();
        let parent = self
            .scope_parents
            .pop()
            .ok_or(CodegenError::Internal {
                reason: "scope parent stack underflow",
            })?;
        trace!("scope closed, {} bytes freed", freed);
        Ok(parent)
    }

    /// Emit the stack cleanup for one scope: string destructor calls in
    /// inverse allocation order, then a single stack-pointer adjustment.
    /// Returns the number of bytes the adjustment removed. The shadow
    /// `stack_offset` is left untouched; callers decide whether the
    /// cleanup is a real scope end or an early exit.
    fn deallocate_variables(&mut self, scope_index: usize, buf: &mut CodeBuffer) -> Result<i32> {
        invariant!(scope_index < self.scopes.len(), "scope index out of range");
        let mut vars: Vec<VarInfo> = self.scopes[scope_index].values().copied().collect();
        // Later-allocated variables are always deeper in the stack.
        vars.sort_by(|a, b| b.offset.cmp(&a.offset));

        let mut total: i32 = 0;
        for (i, var) in vars.iter().enumerate() {
            let size = match var.data_type {
                // An int parameter occupies a full pointer slot, an int
                // local only four bytes; the offset sign tells them apart.
                DataType::Int32 => {
                    if var.offset < 0 {
                        PTR_SIZE
                    } else {
                        4
                    }
                }
                DataType::Double => DOUBLE_SIZE,
                DataType::Pointer | DataType::CharStar => PTR_SIZE,
                DataType::String => {
                    self.emit_string_destruction(var.offset, buf)?;
                    STRING_SIZE
                }
                _ => {
                    return Err(CodegenError::Internal {
                        reason: "variable without a deallocatable type",
                    })
                }
            };
            total += size;
            if i + 1 < vars.len() {
                let this = var.offset;
                let next = vars[i + 1].offset;
                invariant!(
                    this != 0 && next != 0,
                    "return address slot used as a variable"
                );
                // Opposite signs mean the walk crosses from locals to
                // parameters, skipping the return-address slot and the
                // string-literal region.
                let gap = if this > 0 && next < 0 {
                    PTR_SIZE + self.literal_region_size
                } else {
                    0
                };
                invariant!(
                    next == this - size - gap,
                    "stack variable slots do not line up"
                );
            }
        }
        invariant!(
            self.parameter_stack_offset <= 0,
            "parameter stack offset must be non-positive"
        );
        if scope_index == 0 {
            // The caller cleans the parameter slots under both calling
            // conventions and `ret` pops the return address; fold them out
            // of the adjustment.
            total += self.parameter_stack_offset + PTR_SIZE;
        }
        invariant!(total >= 0, "negative deallocation size");
        Assembler::new(buf).add_imm(Reg::Esp, total as u32)?;
        Ok(total)
    }

    /// Call the string destructor on the object at `offset`, preserving
    /// the accumulator and counter across the call.
    fn emit_string_destruction(&mut self, offset: StackOffset, buf: &mut CodeBuffer) -> Result<()> {
        let mut a = Assembler::new(buf);
        a.push_reg(Reg::Eax)?;
        a.push_reg(Reg::Ecx)?;
        self.stack_offset += 2 * PTR_SIZE;
        invariant!(offset <= self.stack_offset, "string slot out of range");
        Assembler::new(buf).lea(Reg::Ecx, Reg::Esp, self.stack_offset - offset)?;
        #[cfg(target_arch = "x86_64")]
        self.emit_aligned_helper_call(runtime::string_dtor as usize, buf)?;
        #[cfg(target_arch = "x86")]
        {
            let mut a = Assembler::new(buf);
            a.push_reg(Reg::Ecx)?;
            a.mov_imm_ptr(Reg::Eax, runtime::string_dtor as usize)?;
            a.call(Reg::Eax)?;
            a.drop_ptr()?;
        }
        let mut a = Assembler::new(buf);
        a.pop_reg(Reg::Ecx)?;
        a.pop_reg(Reg::Eax)?;
        self.stack_offset -= 2 * PTR_SIZE;
        Ok(())
    }

    /// Load a helper address and call it with the stack padded so that the
    /// call site satisfies the Microsoft x64 alignment rule: including the
    /// shadow space, the stack pointer is 16-byte aligned at the `call`.
    #[cfg(target_arch = "x86_64")]
    fn emit_aligned_helper_call(&mut self, address: usize, buf: &mut CodeBuffer) -> Result<()> {
        let depth = self.stack_offset + PTR_SIZE;
        let pad = ((16 - depth.rem_euclid(16)).rem_euclid(16) + 32) as u32;
        let mut a = Assembler::new(buf);
        a.mov_imm_ptr(Reg::Eax, address)?;
        a.sub_imm(Reg::Esp, pad)?;
        a.call(Reg::Eax)?;
        a.add_imm(Reg::Esp, pad)
    }

    fn find_var(&self, name: &str) -> Result<VarInfo> {
        for scope in self.scopes.iter().rev() {
            if let Some(info) = scope.get(name) {
                return Ok(*info);
            }
        }
        Err(CodegenError::UnknownVariable {
            name: name.to_owned(),
        })
    }

    // --- statement emission -------------------------------------------

    fn emit_body(&mut self, stmts: &mut [AstNode], buf: &mut CodeBuffer) -> Result<()> {
        for stmt in stmts {
            self.emit_statement(stmt, buf)?;
        }
        Ok(())
    }

    fn emit_statement(&mut self, stmt: &mut AstNode, buf: &mut CodeBuffer) -> Result<()> {
        self.emit_node(stmt, buf)?;
        // A double-valued statement leaves its result on the x87 register
        // stack; free it so eight such statements cannot overflow it.
        #[cfg(target_arch = "x86")]
        if stmt.data_type == DataType::Double && !matches!(stmt.kind, NodeKind::Return { .. }) {
            Assembler::new(buf).x87_pop()?;
        }
        Ok(())
    }

    fn emit_node(&mut self, node: &mut AstNode, buf: &mut CodeBuffer) -> Result<()> {
        match &mut node.kind {
            NodeKind::Literal(lit) => {
                node.data_type = lit.data_type();
                self.emit_literal(lit, buf)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                node.data_type = self.emit_binary(*op, lhs, rhs, buf)?;
                Ok(())
            }
            NodeKind::Unary { op, operand } => {
                node.data_type = self.emit_unary(*op, operand, buf)?;
                Ok(())
            }
            NodeKind::Cast { value } => {
                self.emit_node(value, buf)?;
                self.cast_if_necessary(node.data_type, value.data_type, buf)
            }
            NodeKind::FunctionCall { address, args } => self.emit_call(*address, args, buf),
            NodeKind::GetLocalVar { name } => {
                node.data_type = self.emit_get_var(name, buf)?;
                Ok(())
            }
            NodeKind::SetLocalVar { name, value } => {
                node.data_type = self.emit_set_var(name, value, buf)?;
                Ok(())
            }
            NodeKind::DeclareLocalVar {
                name,
                var_type,
                init,
            } => {
                if node.data_type != DataType::None {
                    return Err(CodegenError::BadAst {
                        reason: "a declaration never produces a value",
                    });
                }
                self.emit_declare(name, *var_type, init.as_deref_mut(), buf)
            }
            NodeKind::Return { value } => {
                self.emit_return(node.data_type, value.as_deref_mut(), buf)
            }
            NodeKind::IfElse {
                condition,
                if_body,
                else_body,
            } => self.emit_if_else(condition, if_body, else_body, buf),
            NodeKind::ForLoop {
                init,
                condition,
                step,
                body,
            } => self.emit_for(
                init.as_deref_mut(),
                condition.as_deref_mut(),
                step.as_deref_mut(),
                body,
                buf,
            ),
            NodeKind::WhileLoop { condition, body } => self.emit_while(condition, body, buf),
            NodeKind::Switch { value, body } => self.emit_switch(value, body, buf),
            NodeKind::Case { value } => self.emit_case(*value, buf),
            NodeKind::Default => self.emit_default(buf),
            NodeKind::Break => self.emit_break(buf),
            NodeKind::Continue => self.emit_continue(buf),
            NodeKind::Scope { body } => {
                self.increment_scope(ScopeParent::Block);
                self.emit_body(body, buf)?;
                self.deallocate_variables_and_decrement_scope(buf)?;
                Ok(())
            }
        }
    }

    // --- expressions --------------------------------------------------

    fn emit_literal(&mut self, lit: &Literal, buf: &mut CodeBuffer) -> Result<()> {
        let mut a = Assembler::new(buf);
        match lit {
            Literal::Int32(v) => a.mov_imm32(Reg::Eax, *v as u32),
            Literal::Double(v) => {
                a.push_imm64(v.to_bits())?;
                #[cfg(target_arch = "x86_64")]
                {
                    a.movsd_load(Xmm::Xmm0, Reg::Esp, 0)?;
                    a.drop_ptr()?;
                }
                #[cfg(target_arch = "x86")]
                {
                    a.fld(Reg::Esp, 0)?;
                    a.drop_qword()?;
                }
                Ok(())
            }
            Literal::Pointer(v) => a.mov_imm_ptr(Reg::Eax, *v),
            Literal::CharStar(s) => {
                let location = *self.string_literal_locations.get(s).ok_or_else(|| {
                    CodegenError::UnregisteredStringLiteral { literal: s.clone() }
                })?;
                a.lea(Reg::Eax, Reg::Esp, self.stack_offset - location)
            }
        }
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        lhs: &mut AstNode,
        rhs: &mut AstNode,
        buf: &mut CodeBuffer,
    ) -> Result<DataType> {
        self.emit_node(lhs, buf)?;

        // Save the left operand on the machine stack across the right
        // operand's emission. Strings spill their object pointer at
        // integer width.
        match lhs.data_type {
            DataType::Int32 | DataType::String => {
                Assembler::new(buf).push_reg(Reg::Eax)?;
                self.stack_offset += PTR_SIZE;
            }
            DataType::Double => {
                let mut a = Assembler::new(buf);
                #[cfg(target_arch = "x86_64")]
                a.push_xmm(Xmm::Xmm0)?;
                #[cfg(target_arch = "x86")]
                {
                    a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                    a.fstp(Reg::Esp, 0)?;
                }
                self.stack_offset += DOUBLE_SIZE;
            }
            _ => {
                return Err(CodegenError::BadAst {
                    reason: "binary operand must be an int, string, or double",
                })
            }
        }

        self.emit_node(rhs, buf)?;

        match (lhs.data_type, rhs.data_type) {
            (DataType::Int32, DataType::Int32) => self.emit_binary_int_int(op, buf),
            (DataType::Double, DataType::Double) => self.emit_binary_double_double(op, buf),
            (DataType::Int32, DataType::Double) => self.emit_binary_int_double(op, buf),
            (DataType::Double, DataType::Int32) => self.emit_binary_double_int(op, buf),
            (DataType::String, DataType::Int32) | (DataType::String, DataType::Double) => {
                self.emit_string_index(op, rhs.data_type, buf)
            }
            _ => Err(CodegenError::BadAst {
                reason: "unsupported binary operand types",
            }),
        }
    }

    /// Both operands are 32-bit integers: left spilled, right in the
    /// accumulator.
    fn emit_binary_int_int(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= PTR_SIZE;
        let mut a = Assembler::new(buf);
        a.mov(Reg::Ecx, Reg::Eax)?; // right operand
        a.pop_reg(Reg::Eax)?; // left operand
        match op {
            BinaryOp::Add => a.add(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Sub => a.sub(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Mul => a.imul(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Div => {
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
            }
            BinaryOp::Mod => {
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?; // idiv leaves the remainder in edx
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.cmp(Reg::Eax, Reg::Ecx)?;
                emit_bool_result(&mut a, signed_cond(op))?;
            }
            BinaryOp::Shl => a.shl(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Shr => a.sar(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Xor => a.xor(Reg::Eax, Reg::Ecx)?,
            BinaryOp::Or => a.or(Reg::Eax, Reg::Ecx)?,
            BinaryOp::And => a.and(Reg::Eax, Reg::Ecx)?,
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::cmp_imm32_size(Reg::Ecx, 0)
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Ecx, 0)?;
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::cmp_imm32_size(Reg::Ecx, 0)
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Ecx, 0)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "integers cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Both operands are doubles: left spilled, right in the canonical
    /// double location.
    #[cfg(target_arch = "x86_64")]
    fn emit_binary_double_double(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= DOUBLE_SIZE;
        let mut a = Assembler::new(buf);
        a.movsd(Xmm::Xmm1, Xmm::Xmm0)?; // right operand
        a.pop_xmm(Xmm::Xmm0)?; // left operand
        match op {
            BinaryOp::Add => {
                a.addsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Sub => {
                a.subsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mul => {
                a.mulsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Div => {
                a.divsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                // truncate both and take the integer remainder
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                a.cvttsd2si(Reg::Ecx, Xmm::Xmm1)?;
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.comisd(Xmm::Xmm1, Xmm::Xmm0)?;
                emit_bool_result(&mut a, float_cond_right_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                a.cvttsd2si(Reg::Ecx, Xmm::Xmm1)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm2, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm2)?;
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::comisd_size()
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.comisd(Xmm::Xmm1, Xmm::Xmm2)?;
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm2, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm2)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::comisd_size() + Assembler::jmp_size(Cond::Equal) + mov + jmp_always)
                        as i32,
                )?;
                a.comisd(Xmm::Xmm1, Xmm::Xmm2)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "doubles cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Both operands are doubles, x87 rendition: the spilled left operand
    /// is loaded on top of the right one, so st0 is the left operand.
    #[cfg(target_arch = "x86")]
    fn emit_binary_double_double(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= DOUBLE_SIZE;
        let mut a = Assembler::new(buf);
        a.fld(Reg::Esp, 0)?; // left to st0, right becomes st1
        a.drop_qword()?;
        match op {
            BinaryOp::Add => {
                a.faddp()?;
                return Ok(DataType::Double);
            }
            BinaryOp::Sub => {
                a.fsubrp()?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mul => {
                a.fmulp()?;
                return Ok(DataType::Double);
            }
            BinaryOp::Div => {
                a.fdivrp()?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                a.sub_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, DOUBLE_SIZE)?; // left
                a.fstp(Reg::Esp, 0)?; // right
                a.cvttsd2si_mem(Reg::Ecx, Reg::Esp, 0)?;
                a.cvttsd2si_mem(Reg::Eax, Reg::Esp, DOUBLE_SIZE)?;
                a.add_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.x87_compare_and_pop(Reg::Eax)?;
                emit_bool_result(&mut a, float_cond_left_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.sub_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, DOUBLE_SIZE)?;
                a.fstp(Reg::Esp, 0)?;
                a.cvttsd2si_mem(Reg::Ecx, Reg::Esp, 0)?;
                a.cvttsd2si_mem(Reg::Eax, Reg::Esp, DOUBLE_SIZE)?;
                a.add_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, 0)?; // park the left operand
                a.fld(Reg::Esp, DOUBLE_SIZE)?; // 0.0 against the right operand
                a.x87_compare_and_pop(Reg::Eax)?;
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::fld_size(Reg::Esp, 0)
                        + Assembler::fld_size(Reg::Esp, DOUBLE_SIZE)
                        + Assembler::x87_compare_size()
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.fld(Reg::Esp, 0)?; // left operand
                a.fld(Reg::Esp, DOUBLE_SIZE)?; // 0.0
                a.x87_compare_and_pop(Reg::Eax)?;
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.add_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, 0)?;
                a.fld(Reg::Esp, DOUBLE_SIZE)?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::fld_size(Reg::Esp, 0)
                        + Assembler::fld_size(Reg::Esp, DOUBLE_SIZE)
                        + Assembler::x87_compare_size()
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.fld(Reg::Esp, 0)?;
                a.fld(Reg::Esp, DOUBLE_SIZE)?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.add_imm(Reg::Esp, 2 * DOUBLE_SIZE as u32)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "doubles cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Integer left operand (spilled), double right operand.
    #[cfg(target_arch = "x86_64")]
    fn emit_binary_int_double(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= PTR_SIZE;
        let mut a = Assembler::new(buf);
        a.movsd(Xmm::Xmm1, Xmm::Xmm0)?; // right operand
        a.pop_reg(Reg::Eax)?; // left operand, still an int
        a.cvtsi2sd(Xmm::Xmm0, Reg::Eax)?; // left operand as a double
        match op {
            BinaryOp::Add => {
                a.addsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Sub => {
                a.subsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mul => {
                a.mulsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Div => {
                a.divsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                // the untouched integer left operand is still in eax
                a.cvttsd2si(Reg::Ecx, Xmm::Xmm1)?;
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.comisd(Xmm::Xmm1, Xmm::Xmm0)?;
                emit_bool_result(&mut a, float_cond_right_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.cvttsd2si(Reg::Ecx, Xmm::Xmm1)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm0, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm1)?; // right operand against 0.0
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?; // integer left operand
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm0, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm1)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "integers cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Integer left operand (spilled on the machine stack), double right
    /// operand on the x87 stack.
    #[cfg(target_arch = "x86")]
    fn emit_binary_int_double(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= PTR_SIZE;
        let mut a = Assembler::new(buf);
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                a.fild(Reg::Esp, 0)?; // left to st0 as a double, right becomes st1
                a.drop_ptr()?;
                match op {
                    BinaryOp::Add => a.faddp()?,
                    BinaryOp::Sub => a.fsubrp()?,
                    BinaryOp::Mul => a.fmulp()?,
                    BinaryOp::Div => a.fdivrp()?,
                    _ => unreachable!(),
                }
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, 0)?; // right operand
                a.cvttsd2si_mem(Reg::Ecx, Reg::Esp, 0)?;
                a.drop_qword()?;
                a.pop_reg(Reg::Eax)?; // left operand
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.fild(Reg::Esp, 0)?; // left to st0, right becomes st1
                a.drop_ptr()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                emit_bool_result(&mut a, float_cond_left_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, 0)?;
                a.cvttsd2si_mem(Reg::Ecx, Reg::Esp, 0)?;
                a.drop_qword()?;
                a.pop_reg(Reg::Eax)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.fld(Reg::Esp, 0)?; // 0.0 to st0, right becomes st1
                a.drop_qword()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.pop_reg(Reg::Eax)?; // left operand, after ax was clobbered
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.fld(Reg::Esp, 0)?;
                a.drop_qword()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.pop_reg(Reg::Eax)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "integers cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Double left operand (spilled), integer right operand in the
    /// accumulator.
    #[cfg(target_arch = "x86_64")]
    fn emit_binary_double_int(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= DOUBLE_SIZE;
        let mut a = Assembler::new(buf);
        a.pop_xmm(Xmm::Xmm0)?; // left operand
        a.cvtsi2sd(Xmm::Xmm1, Reg::Eax)?; // right operand as a double
        match op {
            BinaryOp::Add => {
                a.addsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Sub => {
                a.subsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mul => {
                a.mulsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Div => {
                a.divsd(Xmm::Xmm0, Xmm::Xmm1)?;
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                a.mov(Reg::Ecx, Reg::Eax)?; // integer right operand
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.comisd(Xmm::Xmm1, Xmm::Xmm0)?;
                emit_bool_result(&mut a, float_cond_right_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.mov(Reg::Ecx, Reg::Eax)?;
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm1, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm1)?; // left operand against 0.0
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?; // integer right operand
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm1, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm1)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "doubles cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// Double left operand spilled on the machine stack, integer right
    /// operand in the accumulator; the right operand is parked on the
    /// stack as well because most arms need to reload it around x87 work.
    #[cfg(target_arch = "x86")]
    fn emit_binary_double_int(&mut self, op: BinaryOp, buf: &mut CodeBuffer) -> Result<DataType> {
        self.stack_offset -= DOUBLE_SIZE;
        let mut a = Assembler::new(buf);
        a.push_reg(Reg::Eax)?;
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                a.fild(Reg::Esp, 0)?; // right as a double
                a.fld(Reg::Esp, PTR_SIZE)?; // left to st0, right becomes st1
                a.add_imm(Reg::Esp, (PTR_SIZE + DOUBLE_SIZE) as u32)?;
                match op {
                    BinaryOp::Add => a.faddp()?,
                    BinaryOp::Sub => a.fsubrp()?,
                    BinaryOp::Mul => a.fmulp()?,
                    BinaryOp::Div => a.fdivrp()?,
                    _ => unreachable!(),
                }
                return Ok(DataType::Double);
            }
            BinaryOp::Mod => {
                a.mov(Reg::Ecx, Reg::Eax)?; // right operand
                a.cvttsd2si_mem(Reg::Eax, Reg::Esp, PTR_SIZE)?; // left operand
                a.add_imm(Reg::Esp, (PTR_SIZE + DOUBLE_SIZE) as u32)?;
                a.cdq()?;
                a.idiv(Reg::Ecx)?;
                a.mov(Reg::Eax, Reg::Edx)?;
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Lt
            | BinaryOp::Le => {
                a.fld(Reg::Esp, PTR_SIZE)?; // left
                a.fild(Reg::Esp, 0)?; // right to st0, left becomes st1
                a.add_imm(Reg::Esp, (PTR_SIZE + DOUBLE_SIZE) as u32)?;
                a.x87_compare_and_pop(Reg::Eax)?;
                emit_bool_result(&mut a, float_cond_right_first(op))?;
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Xor | BinaryOp::Or | BinaryOp::And => {
                a.mov(Reg::Ecx, Reg::Eax)?;
                a.cvttsd2si_mem(Reg::Eax, Reg::Esp, PTR_SIZE)?;
                a.add_imm(Reg::Esp, (PTR_SIZE + DOUBLE_SIZE) as u32)?;
                emit_int_bitwise(&mut a, op)?;
            }
            BinaryOp::LogOr => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.fld(Reg::Esp, DOUBLE_SIZE + PTR_SIZE)?; // left operand
                a.fld(Reg::Esp, 0)?; // 0.0
                a.drop_qword()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.pop_reg(Reg::Eax)?; // right operand, after ax was clobbered
                a.jmp(
                    Cond::NotEqual,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::NotEqual)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::NotEqual, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.drop_qword()?; // discard the parked left operand
            }
            BinaryOp::LogAnd => {
                let mov = Assembler::mov_imm32_size();
                let jmp_always = Assembler::jmp_size(Cond::Always);
                a.push_imm64(0f64.to_bits())?;
                a.fld(Reg::Esp, DOUBLE_SIZE + PTR_SIZE)?;
                a.fld(Reg::Esp, 0)?;
                a.drop_qword()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                a.pop_reg(Reg::Eax)?;
                a.jmp(
                    Cond::Equal,
                    (Assembler::cmp_imm32_size(Reg::Eax, 0)
                        + Assembler::jmp_size(Cond::Equal)
                        + mov
                        + jmp_always) as i32,
                )?;
                a.cmp_imm32(Reg::Eax, 0)?;
                a.jmp(Cond::Equal, (mov + jmp_always) as i32)?;
                a.mov_imm32(Reg::Eax, 1)?;
                a.jmp(Cond::Always, mov as i32)?;
                a.mov_imm32(Reg::Eax, 0)?;
                a.drop_qword()?;
            }
            BinaryOp::Index => {
                return Err(CodegenError::BadAst {
                    reason: "doubles cannot be indexed",
                })
            }
        }
        Ok(DataType::Int32)
    }

    /// String indexing: the spilled left operand is the string object
    /// pointer, the right operand is coerced to an integer index.
    fn emit_string_index(
        &mut self,
        op: BinaryOp,
        rhs_type: DataType,
        buf: &mut CodeBuffer,
    ) -> Result<DataType> {
        self.cast_if_necessary(DataType::Int32, rhs_type, buf)?; // index in the accumulator
        if op != BinaryOp::Index {
            return Err(CodegenError::BadAst {
                reason: "strings support only indexing",
            });
        }
        Assembler::new(buf).pop_reg(Reg::Ecx)?; // string object pointer
        self.stack_offset -= PTR_SIZE;
        #[cfg(target_arch = "x86_64")]
        {
            Assembler::new(buf).mov(Reg::Edx, Reg::Eax)?; // index to the second argument register
            self.emit_aligned_helper_call(runtime::string_index as usize, buf)?;
        }
        #[cfg(target_arch = "x86")]
        {
            let mut a = Assembler::new(buf);
            a.push_reg(Reg::Eax)?;
            a.push_reg(Reg::Ecx)?;
            a.mov_imm_ptr(Reg::Eax, runtime::string_index as usize)?;
            a.call(Reg::Eax)?;
            a.drop_qword()?; // both arguments at once
        }
        Ok(DataType::Int32)
    }

    fn emit_unary(
        &mut self,
        op: UnaryOp,
        operand: &mut AstNode,
        buf: &mut CodeBuffer,
    ) -> Result<DataType> {
        self.emit_node(operand, buf)?;
        if operand.data_type == DataType::Int32 {
            let mut a = Assembler::new(buf);
            match op {
                UnaryOp::Negate => {
                    a.mov_imm32(Reg::Ecx, -1i32 as u32)?;
                    a.imul(Reg::Eax, Reg::Ecx)?;
                }
                UnaryOp::LogicalNot => {
                    a.cmp_imm32(Reg::Eax, 0)?;
                    emit_bool_result(&mut a, Cond::Equal)?;
                }
                UnaryOp::BitwiseNot => {
                    a.mov_imm32(Reg::Ecx, !0u32)?;
                    a.xor(Reg::Eax, Reg::Ecx)?;
                }
            }
            return Ok(DataType::Int32);
        }
        if operand.data_type != DataType::Double {
            return Err(CodegenError::BadAst {
                reason: "unary operand must be an int or double",
            });
        }
        let mut a = Assembler::new(buf);
        #[cfg(target_arch = "x86_64")]
        let result = match op {
            UnaryOp::Negate => {
                a.push_imm64((-1f64).to_bits())?;
                a.movsd_load(Xmm::Xmm1, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.mulsd(Xmm::Xmm0, Xmm::Xmm1)?;
                DataType::Double
            }
            UnaryOp::LogicalNot => {
                a.push_imm64(0f64.to_bits())?;
                a.movsd_load(Xmm::Xmm1, Reg::Esp, 0)?;
                a.drop_ptr()?;
                a.comisd(Xmm::Xmm0, Xmm::Xmm1)?;
                emit_bool_result(&mut a, Cond::Equal)?;
                DataType::Int32
            }
            UnaryOp::BitwiseNot => {
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                a.mov_imm32(Reg::Ecx, !0u32)?;
                a.xor(Reg::Eax, Reg::Ecx)?;
                DataType::Int32
            }
        };
        #[cfg(target_arch = "x86")]
        let result = match op {
            UnaryOp::Negate => {
                a.push_imm64((-1f64).to_bits())?;
                a.fld(Reg::Esp, 0)?;
                a.drop_qword()?;
                a.fmulp()?;
                DataType::Double
            }
            UnaryOp::LogicalNot => {
                a.push_imm64(0f64.to_bits())?;
                a.fld(Reg::Esp, 0)?;
                a.drop_qword()?;
                a.x87_compare_and_pop(Reg::Eax)?;
                emit_bool_result(&mut a, Cond::Equal)?;
                DataType::Int32
            }
            UnaryOp::BitwiseNot => {
                a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                a.fstp(Reg::Esp, 0)?;
                a.cvttsd2si_mem(Reg::Eax, Reg::Esp, 0)?;
                a.drop_qword()?;
                a.mov_imm32(Reg::Ecx, !0u32)?;
                a.xor(Reg::Eax, Reg::Ecx)?;
                DataType::Int32
            }
        };
        Ok(result)
    }

    // --- variables ----------------------------------------------------

    fn emit_get_var(&mut self, name: &str, buf: &mut CodeBuffer) -> Result<DataType> {
        let info = self.find_var(name)?;
        invariant!(info.offset <= self.stack_offset, "variable slot out of range");
        let offset = self.stack_offset - info.offset;
        let mut a = Assembler::new(buf);
        match info.data_type {
            DataType::Pointer | DataType::CharStar => a.load(Reg::Eax, Reg::Esp, offset, WIDE_PTR)?,
            DataType::Int32 => a.load(Reg::Eax, Reg::Esp, offset, false)?,
            DataType::Double => {
                #[cfg(target_arch = "x86_64")]
                a.movsd_load(Xmm::Xmm0, Reg::Esp, offset)?;
                #[cfg(target_arch = "x86")]
                a.fld(Reg::Esp, offset)?;
            }
            DataType::String => a.lea(Reg::Eax, Reg::Esp, offset)?,
            _ => {
                return Err(CodegenError::BadAst {
                    reason: "variable has no readable type",
                })
            }
        }
        Ok(info.data_type)
    }

    fn emit_set_var(
        &mut self,
        name: &str,
        value: &mut AstNode,
        buf: &mut CodeBuffer,
    ) -> Result<DataType> {
        let info = self.find_var(name)?;
        self.emit_node(value, buf)?;
        invariant!(info.offset <= self.stack_offset, "variable slot out of range");
        let offset = self.stack_offset - info.offset;
        match info.data_type {
            DataType::Pointer | DataType::CharStar => {
                self.cast_if_necessary(info.data_type, value.data_type, buf)?;
                Assembler::new(buf).store(Reg::Esp, offset, Reg::Eax, WIDE_PTR)?;
            }
            DataType::Int32 => {
                self.cast_if_necessary(info.data_type, value.data_type, buf)?;
                Assembler::new(buf).store(Reg::Esp, offset, Reg::Eax, false)?;
            }
            DataType::Double => {
                self.cast_if_necessary(info.data_type, value.data_type, buf)?;
                let mut a = Assembler::new(buf);
                #[cfg(target_arch = "x86_64")]
                a.movsd_store(Reg::Esp, offset, Xmm::Xmm0)?;
                #[cfg(target_arch = "x86")]
                {
                    // keep the assigned value as the statement result
                    a.fstp(Reg::Esp, offset)?;
                    a.fld(Reg::Esp, offset)?;
                }
            }
            DataType::String => {
                self.cast_if_necessary(DataType::CharStar, value.data_type, buf)?;
                #[cfg(target_arch = "x86_64")]
                {
                    let mut a = Assembler::new(buf);
                    a.mov(Reg::Edx, Reg::Eax)?; // the C string to the second argument register
                    a.lea(Reg::Ecx, Reg::Esp, offset)?;
                    self.emit_aligned_helper_call(runtime::string_assign as usize, buf)?;
                }
                #[cfg(target_arch = "x86")]
                {
                    let mut a = Assembler::new(buf);
                    a.lea(Reg::Ecx, Reg::Esp, offset)?;
                    a.push_reg(Reg::Eax)?;
                    a.push_reg(Reg::Ecx)?;
                    a.mov_imm_ptr(Reg::Eax, runtime::string_assign as usize)?;
                    a.call(Reg::Eax)?; // returns the string object pointer
                    a.drop_qword()?;
                }
            }
            _ => {
                return Err(CodegenError::BadAst {
                    reason: "variable has no assignable type",
                })
            }
        }
        Ok(info.data_type)
    }

    fn emit_declare(
        &mut self,
        name: &str,
        var_type: DataType,
        init: Option<&mut AstNode>,
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        let size = match var_type {
            DataType::Pointer | DataType::CharStar => PTR_SIZE,
            DataType::Int32 => 4,
            DataType::Double => DOUBLE_SIZE,
            DataType::String => STRING_SIZE,
            _ => {
                return Err(CodegenError::BadAst {
                    reason: "invalid variable declaration type",
                })
            }
        };
        Assembler::new(buf).sub_imm(Reg::Esp, size as u32)?;
        self.stack_offset += size;
        let top = self.scopes.last_mut().ok_or(CodegenError::Internal {
            reason: "no open scope for a declaration",
        })?;
        if top.contains_key(name) {
            return Err(CodegenError::DuplicateVariable {
                name: name.to_owned(),
            });
        }
        top.insert(
            name.to_owned(),
            VarInfo {
                data_type: var_type,
                offset: self.stack_offset,
            },
        );
        trace!("declare {name}: {var_type:?} at shadow offset {}", self.stack_offset);

        if let Some(init) = init {
            self.emit_node(init, buf)?;
            match var_type {
                DataType::Pointer | DataType::CharStar => {
                    self.cast_if_necessary(var_type, init.data_type, buf)?;
                    Assembler::new(buf).store(Reg::Esp, 0, Reg::Eax, WIDE_PTR)?;
                }
                DataType::Int32 => {
                    self.cast_if_necessary(var_type, init.data_type, buf)?;
                    Assembler::new(buf).store(Reg::Esp, 0, Reg::Eax, false)?;
                }
                DataType::Double => {
                    self.cast_if_necessary(var_type, init.data_type, buf)?;
                    let mut a = Assembler::new(buf);
                    #[cfg(target_arch = "x86_64")]
                    a.movsd_store(Reg::Esp, 0, Xmm::Xmm0)?;
                    #[cfg(target_arch = "x86")]
                    a.fstp(Reg::Esp, 0)?;
                }
                DataType::String => {
                    self.cast_if_necessary(DataType::CharStar, init.data_type, buf)?;
                    #[cfg(target_arch = "x86_64")]
                    {
                        let mut a = Assembler::new(buf);
                        a.mov(Reg::Edx, Reg::Eax)?;
                        a.mov(Reg::Ecx, Reg::Esp)?; // the object lives at the stack top
                        self.emit_aligned_helper_call(
                            runtime::string_from_cstr_ctor as usize,
                            buf,
                        )?;
                    }
                    #[cfg(target_arch = "x86")]
                    {
                        let mut a = Assembler::new(buf);
                        a.lea(Reg::Ecx, Reg::Esp, 0)?;
                        a.push_reg(Reg::Eax)?;
                        a.push_reg(Reg::Ecx)?;
                        a.mov_imm_ptr(Reg::Eax, runtime::string_from_cstr_ctor as usize)?;
                        a.call(Reg::Eax)?;
                        a.drop_qword()?;
                    }
                }
                _ => unreachable!("declaration type already validated"),
            }
        } else if var_type == DataType::String {
            #[cfg(target_arch = "x86_64")]
            {
                Assembler::new(buf).mov(Reg::Ecx, Reg::Esp)?;
                self.emit_aligned_helper_call(runtime::string_default_ctor as usize, buf)?;
            }
            #[cfg(target_arch = "x86")]
            {
                let mut a = Assembler::new(buf);
                a.push_reg(Reg::Esp)?;
                a.mov_imm_ptr(Reg::Eax, runtime::string_default_ctor as usize)?;
                a.call(Reg::Eax)?;
                a.drop_ptr()?;
            }
        }
        Ok(())
    }

    // --- casts --------------------------------------------------------

    /// Emit conversion code when `from` differs from `to`; see the cast
    /// matrix in the crate documentation.
    fn cast_if_necessary(
        &mut self,
        to: DataType,
        from: DataType,
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        use DataType::*;
        match (from, to) {
            (Int32, Int32) | (Pointer, Pointer) | (Double, Double) | (CharStar, CharStar) => Ok(()),
            (Int32, Pointer) => {
                #[cfg(target_arch = "x86_64")]
                {
                    Assembler::new(buf).mov(Reg::Ecx, Reg::Eax)?;
                    self.emit_aligned_helper_call(runtime::int32_to_ptr as usize, buf)?;
                }
                // on x86 the widths agree and no bits change
                #[cfg(target_arch = "x86")]
                let _ = buf;
                Ok(())
            }
            (Int32, Double) => {
                let mut a = Assembler::new(buf);
                #[cfg(target_arch = "x86_64")]
                a.cvtsi2sd(Xmm::Xmm0, Reg::Eax)?;
                #[cfg(target_arch = "x86")]
                {
                    a.push_reg(Reg::Eax)?;
                    a.fild(Reg::Esp, 0)?;
                    a.drop_ptr()?;
                }
                Ok(())
            }
            (Pointer, Int32) => {
                #[cfg(target_arch = "x86_64")]
                {
                    let mut a = Assembler::new(buf);
                    a.mov_imm64(Reg::Ecx, 0x0000_0000_FFFF_FFFF)?;
                    a.and(Reg::Eax, Reg::Ecx)?; // clean out the high bits
                }
                #[cfg(target_arch = "x86")]
                let _ = buf;
                Ok(())
            }
            (Pointer, Double) => {
                #[cfg(target_arch = "x86_64")]
                {
                    Assembler::new(buf).mov(Reg::Ecx, Reg::Eax)?;
                    self.emit_aligned_helper_call(runtime::ptr_to_double as usize, buf)?;
                }
                #[cfg(target_arch = "x86")]
                {
                    let mut a = Assembler::new(buf);
                    a.push_reg(Reg::Eax)?;
                    a.mov_imm_ptr(Reg::Eax, runtime::ptr_to_double as usize)?;
                    a.call(Reg::Eax)?;
                    a.drop_ptr()?;
                }
                Ok(())
            }
            (Double, Int32) => {
                let mut a = Assembler::new(buf);
                #[cfg(target_arch = "x86_64")]
                a.cvttsd2si(Reg::Eax, Xmm::Xmm0)?;
                #[cfg(target_arch = "x86")]
                {
                    a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                    a.fstp(Reg::Esp, 0)?;
                    a.cvttsd2si_mem(Reg::Eax, Reg::Esp, 0)?;
                    a.drop_qword()?;
                }
                Ok(())
            }
            (Double, Pointer) => {
                #[cfg(target_arch = "x86_64")]
                // the value is already in the first double argument register
                self.emit_aligned_helper_call(runtime::double_to_ptr as usize, buf)?;
                #[cfg(target_arch = "x86")]
                {
                    let mut a = Assembler::new(buf);
                    a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                    a.fstp(Reg::Esp, 0)?;
                    a.mov_imm_ptr(Reg::Eax, runtime::double_to_ptr as usize)?;
                    a.call(Reg::Eax)?;
                    a.drop_qword()?;
                }
                Ok(())
            }
            (String, CharStar) => {
                #[cfg(target_arch = "x86_64")]
                {
                    Assembler::new(buf).mov(Reg::Ecx, Reg::Eax)?;
                    self.emit_aligned_helper_call(runtime::string_cstr as usize, buf)?;
                }
                #[cfg(target_arch = "x86")]
                {
                    let mut a = Assembler::new(buf);
                    a.push_reg(Reg::Eax)?;
                    a.mov_imm_ptr(Reg::Eax, runtime::string_cstr as usize)?;
                    a.call(Reg::Eax)?;
                    a.drop_ptr()?;
                }
                Ok(())
            }
            _ => Err(CodegenError::BadCast { from, to }),
        }
    }

    // --- calls --------------------------------------------------------

    fn emit_call(
        &mut self,
        address: usize,
        args: &mut [AstNode],
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        if address == 0 {
            return Err(CodegenError::BadAst {
                reason: "function call without an address",
            });
        }
        let mut parameter_space: i32 = 0;

        #[cfg(target_arch = "x86_64")]
        {
            // Pre-pad so that after the register arguments are popped back
            // and the shadow space is reserved, the call site sees a
            // 16-byte aligned stack pointer.
            let popped = 8 * args.len().min(4) as i32;
            let depth = self.stack_offset + PTR_SIZE + 8 * args.len() as i32 - popped + 32;
            let pad = (16 - depth.rem_euclid(16)).rem_euclid(16);
            if pad > 0 {
                Assembler::new(buf).sub_imm(Reg::Esp, pad as u32)?;
                self.stack_offset += pad;
                parameter_space += pad;
            }
        }

        // arguments are evaluated right to left
        for arg in args.iter_mut().rev() {
            self.emit_node(arg, buf)?;
            match arg.data_type {
                DataType::Int32 | DataType::Pointer | DataType::CharStar | DataType::String => {
                    Assembler::new(buf).push_reg(Reg::Eax)?;
                    parameter_space += PTR_SIZE;
                    self.stack_offset += PTR_SIZE;
                }
                DataType::Double => {
                    let mut a = Assembler::new(buf);
                    a.sub_imm(Reg::Esp, DOUBLE_SIZE as u32)?;
                    #[cfg(target_arch = "x86_64")]
                    a.movsd_store(Reg::Esp, 0, Xmm::Xmm0)?;
                    #[cfg(target_arch = "x86")]
                    a.fstp(Reg::Esp, 0)?;
                    parameter_space += DOUBLE_SIZE;
                    self.stack_offset += DOUBLE_SIZE;
                }
                _ => {
                    return Err(CodegenError::BadAst {
                        reason: "invalid call argument type",
                    })
                }
            }
        }

        #[cfg(target_arch = "x86_64")]
        {
            // The first four arguments travel in registers; their spilled
            // copies are popped back into the slots the ABI dictates.
            let int_regs = [Reg::Ecx, Reg::Edx, Reg::R8, Reg::R9];
            let sse_regs = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
            for (i, arg) in args.iter().take(4).enumerate() {
                let mut a = Assembler::new(buf);
                if arg.data_type == DataType::Double {
                    a.pop_xmm(sse_regs[i])?;
                } else {
                    a.pop_reg(int_regs[i])?;
                }
                parameter_space -= 8;
                self.stack_offset -= 8;
            }
            Assembler::new(buf).sub_imm(Reg::Esp, 32)?; // shadow space
            parameter_space += 32;
            self.stack_offset += 32;
        }

        let mut a = Assembler::new(buf);
        a.mov_imm_ptr(Reg::Eax, address)?;
        a.call(Reg::Eax)?;
        a.add_imm(Reg::Esp, parameter_space as u32)?;
        self.stack_offset -= parameter_space;
        Ok(())
    }

    // --- control flow -------------------------------------------------

    /// Compare the canonical condition value against zero, setting the
    /// flags so that `Equal` means "condition is false".
    fn emit_condition_test(&mut self, data_type: DataType, buf: &mut CodeBuffer) -> Result<()> {
        let mut a = Assembler::new(buf);
        match data_type {
            DataType::Int32 | DataType::Pointer => a.cmp_imm32(Reg::Eax, 0),
            DataType::Double => {
                a.push_imm64(0f64.to_bits())?;
                #[cfg(target_arch = "x86_64")]
                {
                    a.movsd_load(Xmm::Xmm1, Reg::Esp, 0)?;
                    a.comisd(Xmm::Xmm1, Xmm::Xmm0)?;
                }
                #[cfg(target_arch = "x86")]
                {
                    a.fld(Reg::Esp, 0)?;
                    a.x87_compare_and_pop(Reg::Eax)?;
                }
                a.drop_qword()
            }
            _ => Err(CodegenError::BadAst {
                reason: "condition must be an int, pointer, or double",
            }),
        }
    }

    fn emit_if_else(
        &mut self,
        condition: &mut AstNode,
        if_body: &mut [AstNode],
        else_body: &mut [AstNode],
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        self.emit_node(condition, buf)?;
        self.emit_condition_test(condition.data_type, buf)?;
        let first_jump = Assembler::new(buf).jmp(Cond::Equal, 0)?;
        let before_if = buf.len();

        self.increment_scope(ScopeParent::Block);
        self.emit_body(if_body, buf)?;
        self.deallocate_variables_and_decrement_scope(buf)?;

        let second_jump = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let before_else = buf.len();

        self.increment_scope(ScopeParent::Block);
        self.emit_body(else_body, buf)?;
        self.deallocate_variables_and_decrement_scope(buf)?;

        let after_else = buf.len();
        let mut a = Assembler::new(buf);
        a.set_jump_distance(first_jump, before_else as i32 - before_if as i32);
        a.set_jump_distance(second_jump, after_else as i32 - before_else as i32);
        Ok(())
    }

    fn emit_while(
        &mut self,
        condition: &mut AstNode,
        body: &mut [AstNode],
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        self.increment_scope(ScopeParent::new_loop()); // condition scope
        let pre_condition = buf.len();
        self.emit_node(condition, buf)?;
        self.emit_condition_test(condition.data_type, buf)?;
        let condition_jump = Assembler::new(buf).jmp(Cond::Equal, 0)?;
        let post_condition = buf.len();

        self.increment_scope(ScopeParent::new_loop());
        self.emit_body(body, buf)?;
        let body_frame = self.deallocate_variables_and_decrement_scope(buf)?;

        let end_jump = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let end = buf.len();
        let condition_frame = self.deallocate_variables_and_decrement_scope(buf)?;

        let mut a = Assembler::new(buf);
        a.set_jump_distance(end_jump, pre_condition as i32 - end as i32); // backward
        a.set_jump_distance(condition_jump, end as i32 - post_condition as i32);
        for frame in [body_frame, condition_frame] {
            let ScopeParent::Loop { breaks, continues } = frame else {
                return Err(CodegenError::Internal {
                    reason: "while loop frame replaced during emission",
                });
            };
            for c in continues {
                a.set_jump_distance(c.anchor, pre_condition as i32 - c.from as i32);
            }
            for b in breaks {
                a.set_jump_distance(b.anchor, end as i32 - b.from as i32);
            }
        }
        Ok(())
    }

    fn emit_for(
        &mut self,
        init: Option<&mut AstNode>,
        condition: Option<&mut AstNode>,
        step: Option<&mut AstNode>,
        body: &mut [AstNode],
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        self.increment_scope(ScopeParent::new_loop()); // scope for the initializer
        if let Some(init) = init {
            self.emit_statement(init, buf)?;
        }
        let pre_condition = buf.len();
        let condition_jump = match condition {
            Some(condition) => {
                self.emit_node(condition, buf)?;
                self.emit_condition_test(condition.data_type, buf)?;
                Some(Assembler::new(buf).jmp(Cond::Equal, 0)?)
            }
            None => None,
        };
        let post_condition = buf.len();

        self.increment_scope(ScopeParent::new_loop());
        self.emit_body(body, buf)?;
        let body_frame = self.deallocate_variables_and_decrement_scope(buf)?;

        let pre_step = buf.len();
        if let Some(step) = step {
            self.emit_statement(step, buf)?;
        }
        let end_jump = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let end = buf.len();
        let init_frame = self.deallocate_variables_and_decrement_scope(buf)?;

        let mut a = Assembler::new(buf);
        invariant!(pre_condition < end, "for loop emitted no body");
        a.set_jump_distance(end_jump, pre_condition as i32 - end as i32); // backward
        if let Some(jump) = condition_jump {
            a.set_jump_distance(jump, end as i32 - post_condition as i32);
        }
        for frame in [body_frame, init_frame] {
            let ScopeParent::Loop { breaks, continues } = frame else {
                return Err(CodegenError::Internal {
                    reason: "for loop frame replaced during emission",
                });
            };
            for c in continues {
                invariant!(pre_step >= c.from, "continue would jump forward past the step");
                a.set_jump_distance(c.anchor, pre_step as i32 - c.from as i32);
            }
            for b in breaks {
                invariant!(end > b.from, "break would jump backward");
                a.set_jump_distance(b.anchor, end as i32 - b.from as i32);
            }
        }
        Ok(())
    }

    fn emit_switch(
        &mut self,
        value: &mut AstNode,
        body: &mut [AstNode],
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        self.increment_scope(ScopeParent::new_switch());
        self.emit_node(value, buf)?;
        self.cast_if_necessary(DataType::Int32, value.data_type, buf)?;

        // The dispatch comparisons are emitted after the body, once every
        // case label is known; jump forward over the body to reach them.
        let pre_body_jump = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let pre_body_from = buf.len();

        for stmt in body.iter_mut() {
            if matches!(stmt.kind, NodeKind::DeclareLocalVar { .. }) {
                return Err(CodegenError::DeclarationInSwitch);
            }
            self.emit_statement(stmt, buf)?;
        }
        let end = buf.len();

        let frame = self.deallocate_variables_and_decrement_scope(buf)?;
        let ScopeParent::Switch {
            breaks,
            cases,
            default_site,
        } = frame
        else {
            return Err(CodegenError::Internal {
                reason: "switch frame replaced during emission",
            });
        };

        // After the body runs, execution jumps over the comparisons.
        let post_body_jump = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let dispatch_begin = buf.len();

        for case in &cases {
            let mut a = Assembler::new(buf);
            a.cmp_imm32(Reg::Eax, case.value as u32)?;
            let anchor = a.jmp(Cond::Equal, 0)?;
            let from = buf.len();
            Assembler::new(&mut *buf).set_jump_distance(anchor, case.begin as i32 - from as i32);
        }
        if let Some(default_begin) = default_site {
            let anchor = Assembler::new(buf).jmp(Cond::Always, 0)?;
            let from = buf.len();
            Assembler::new(&mut *buf).set_jump_distance(anchor, default_begin as i32 - from as i32);
        }
        let dispatch_end = buf.len();

        let mut a = Assembler::new(buf);
        a.set_jump_distance(post_body_jump, dispatch_end as i32 - dispatch_begin as i32);
        a.set_jump_distance(pre_body_jump, dispatch_begin as i32 - pre_body_from as i32);
        for b in breaks {
            a.set_jump_distance(b.anchor, end as i32 - b.from as i32);
        }
        Ok(())
    }

    fn emit_case(&mut self, value: i32, buf: &mut CodeBuffer) -> Result<()> {
        let begin = buf.len();
        for index in (1..self.scope_parents.len()).rev() {
            if let ScopeParent::Switch { cases, .. } = &mut self.scope_parents[index] {
                cases.push(CaseSite { value, begin });
                return Ok(());
            }
        }
        Err(CodegenError::StrayCase)
    }

    fn emit_default(&mut self, buf: &mut CodeBuffer) -> Result<()> {
        let begin = buf.len();
        for index in (1..self.scope_parents.len()).rev() {
            if let ScopeParent::Switch { default_site, .. } = &mut self.scope_parents[index] {
                if default_site.is_some() {
                    return Err(CodegenError::DuplicateDefault);
                }
                *default_site = Some(begin);
                return Ok(());
            }
        }
        Err(CodegenError::StrayDefault)
    }

    /// Unwind the scopes out to the nearest loop or switch and record the
    /// jump on its frame. The logical scopes stay open: the jump leaves
    /// them lexically, not structurally.
    fn emit_break(&mut self, buf: &mut CodeBuffer) -> Result<()> {
        let original_offset = self.stack_offset;
        let mut removed = 0;
        let mut target = None;
        for index in (1..self.scopes.len()).rev() {
            // Each scope's adjustment moves the physical stack pointer;
            // keep the shadow offset in step for the destructor addresses.
            self.stack_offset = original_offset - removed;
            removed += self.deallocate_variables(index, buf)?;
            match self.scope_parents[index] {
                ScopeParent::Loop { .. } | ScopeParent::Switch { .. } => {
                    target = Some(index);
                    break;
                }
                ScopeParent::Block => {}
                ScopeParent::Function => {
                    return Err(CodegenError::Internal {
                        reason: "function frame nested inside itself",
                    })
                }
            }
        }
        self.stack_offset = original_offset;
        let Some(index) = target else {
            return Err(CodegenError::StrayBreak);
        };
        let anchor = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let from = buf.len();
        match &mut self.scope_parents[index] {
            ScopeParent::Loop { breaks, .. } | ScopeParent::Switch { breaks, .. } => {
                breaks.push(Jump { anchor, from });
            }
            _ => unreachable!("target frame was just matched"),
        }
        Ok(())
    }

    /// Like [`Self::emit_break`], but only a loop can catch it; switches
    /// are passed through.
    fn emit_continue(&mut self, buf: &mut CodeBuffer) -> Result<()> {
        let original_offset = self.stack_offset;
        let mut removed = 0;
        let mut target = None;
        for index in (1..self.scopes.len()).rev() {
            self.stack_offset = original_offset - removed;
            removed += self.deallocate_variables(index, buf)?;
            match self.scope_parents[index] {
                ScopeParent::Loop { .. } => {
                    target = Some(index);
                    break;
                }
                ScopeParent::Block | ScopeParent::Switch { .. } => {}
                ScopeParent::Function => {
                    return Err(CodegenError::Internal {
                        reason: "function frame nested inside itself",
                    })
                }
            }
        }
        self.stack_offset = original_offset;
        let Some(index) = target else {
            return Err(CodegenError::StrayContinue);
        };
        let anchor = Assembler::new(buf).jmp(Cond::Always, 0)?;
        let from = buf.len();
        match &mut self.scope_parents[index] {
            ScopeParent::Loop { continues, .. } => continues.push(Jump { anchor, from }),
            _ => unreachable!("target frame was just matched"),
        }
        Ok(())
    }

    fn emit_return(
        &mut self,
        return_type: DataType,
        value: Option<&mut AstNode>,
        buf: &mut CodeBuffer,
    ) -> Result<()> {
        match return_type {
            DataType::None => {
                if value.is_some() {
                    return Err(CodegenError::BadAst {
                        reason: "void return must not carry a value",
                    });
                }
            }
            DataType::Int32 | DataType::Pointer | DataType::Double => {
                let value = value.ok_or(CodegenError::BadAst {
                    reason: "typed return requires a value",
                })?;
                self.emit_node(value, buf)?;
                self.cast_if_necessary(return_type, value.data_type, buf)?;
            }
            _ => {
                return Err(CodegenError::BadAst {
                    reason: "invalid return type",
                })
            }
        }

        // Unwind every open scope, innermost first, then drop whatever is
        // left (the string-literal region) with one adjustment. The
        // logical scope stack stays open: a return is a mid-flow exit.
        let original_offset = self.stack_offset;
        let mut removed = 0;
        for index in (0..self.scopes.len()).rev() {
            // Each scope's adjustment moves the physical stack pointer;
            // keep the shadow offset in step for the destructor addresses.
            self.stack_offset = original_offset - removed;
            removed += self.deallocate_variables(index, buf)?;
        }
        self.stack_offset = original_offset;
        let to_remove = original_offset - removed;
        invariant!(to_remove >= 0, "return would unbalance the stack");
        let mut a = Assembler::new(buf);
        a.add_imm(Reg::Esp, to_remove as u32)?;
        a.ret()
    }
}

// --- small emission idioms shared across the arms ----------------------

/// Materialize a flags condition as 0 or 1 in the accumulator:
/// branch-if-true over `mov eax, 0; jmp +mov`, then `mov eax, 1`.
fn emit_bool_result(a: &mut Assembler, cond: Cond) -> Result<()> {
    a.jmp(
        cond,
        (Assembler::mov_imm32_size() + Assembler::jmp_size(Cond::Always)) as i32,
    )?;
    a.mov_imm32(Reg::Eax, 0)?;
    a.jmp(Cond::Always, Assembler::mov_imm32_size() as i32)?;
    a.mov_imm32(Reg::Eax, 1)
}

/// The bitwise tail once both operands are integers in eax / ecx.
fn emit_int_bitwise(a: &mut Assembler, op: BinaryOp) -> Result<()> {
    match op {
        BinaryOp::Shl => a.shl(Reg::Eax, Reg::Ecx),
        BinaryOp::Shr => a.sar(Reg::Eax, Reg::Ecx),
        BinaryOp::Xor => a.xor(Reg::Eax, Reg::Ecx),
        BinaryOp::Or => a.or(Reg::Eax, Reg::Ecx),
        BinaryOp::And => a.and(Reg::Eax, Reg::Ecx),
        _ => unreachable!("not a bitwise operator"),
    }
}

/// Condition for a signed integer compare `cmp left, right`.
fn signed_cond(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::Equal,
        BinaryOp::Ne => Cond::NotEqual,
        BinaryOp::Gt => Cond::Greater,
        BinaryOp::Ge => Cond::GreaterOrEqual,
        BinaryOp::Lt => Cond::Less,
        BinaryOp::Le => Cond::LessOrEqual,
        _ => unreachable!("not a comparison operator"),
    }
}

/// Condition when the flags came from comparing `right` against `left`
/// (`comisd right, left`, or an x87 compare with the right operand on
/// top).
fn float_cond_right_first(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::Equal,
        BinaryOp::Ne => Cond::NotEqual,
        BinaryOp::Gt => Cond::Below,
        BinaryOp::Ge => Cond::BelowOrEqual,
        BinaryOp::Lt => Cond::Above,
        BinaryOp::Le => Cond::AboveOrEqual,
        _ => unreachable!("not a comparison operator"),
    }
}

/// Condition when the flags came from an x87 compare with the left
/// operand on top of the register stack.
#[cfg(target_arch = "x86")]
fn float_cond_left_first(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::Equal,
        BinaryOp::Ne => Cond::NotEqual,
        BinaryOp::Gt => Cond::Above,
        BinaryOp::Ge => Cond::AboveOrEqual,
        BinaryOp::Lt => Cond::Below,
        BinaryOp::Le => Cond::BelowOrEqual,
        _ => unreachable!("not a comparison operator"),
    }
}
