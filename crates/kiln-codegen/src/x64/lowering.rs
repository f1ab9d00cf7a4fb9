//! MIR → x86-64 CGIR lowering
//!
//! Walks each MIR block in layout order, lowering expression trees bottom-up
//! into virtual registers. Conditional checks split the current CGIR block
//! after every branch, mirroring the MIR shape where exception checks sit in
//! the middle of a block with an implicit fallthrough.

use rustc_hash::FxHashMap;

use kiln_mir::arena::{BlockId, InstId, TypeId};
use kiln_mir::instr::{BinaryOp, CmpPredicate, ConvOp, InstKind, OverflowI128Op, OverflowOp, UnaryOp};
use kiln_mir::types::MirType;
use kiln_mir::{CompileContext, MirConst, MirFunction, Phase, TrapCode};

use crate::cgir::{CgBlockId, CgFunction, CgInst, CgOperand, CgReg, MemRef, OpWidth, RegClass};
use crate::x64::opcode::{CondCode, ExtWidth, RoundingMode, X64Op};
use crate::x64::regs;
use crate::CodegenError;

// Float-to-int range boundaries; see the conversion lowering below.
pub const MIN_F32_FIT_I32: u64 = 0xcf000000;
pub const MIN_F32_FIT_I64: u64 = 0xdf000000;
pub const MAX_F64_FIT_I32: u64 = 0xc1e0000000200000;
pub const MIN_F64_FIT_I64: u64 = 0xc3e0000000000000;
pub const MIN_F64_NOT_FIT_I64: u64 = 0x43e0000000000000;
pub const MIN_F32_NOT_FIT_I64: u64 = 0x5f000000;

const F32_SIGN_MASK: u64 = 0x8000_0000;
const F64_SIGN_MASK: u64 = 0x8000_0000_0000_0000;
const F32_CANONICAL_NAN: u64 = 0x7fc0_0000;
const F64_CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

type Result<T> = std::result::Result<T, CodegenError>;

/// Lower one MIR function to CGIR with virtual registers.
pub fn lower_function(ctx: &CompileContext, mir: &MirFunction) -> Result<CgFunction> {
    let mut lowering = Lowering::new(ctx, mir);
    lowering.run()?;
    Ok(lowering.cg)
}

struct Lowering<'a> {
    ctx: &'a CompileContext,
    mir: &'a MirFunction,
    cg: CgFunction,
    cur: CgBlockId,
    block_map: FxHashMap<BlockId, CgBlockId>,
    var_regs: Vec<CgReg>,
}

impl<'a> Lowering<'a> {
    fn new(ctx: &'a CompileContext, mir: &'a MirFunction) -> Self {
        Lowering {
            ctx,
            mir,
            cg: CgFunction::new(mir.func_idx),
            cur: CgBlockId(0),
            block_map: FxHashMap::default(),
            var_regs: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        let layout: Vec<BlockId> = self.mir.layout().to_vec();
        if layout.is_empty() {
            return Err(CodegenError::UnsupportedInstruction(
                "function has no basic blocks".to_string(),
            ));
        }

        // One virtual register per MIR variable.
        for var in self.mir.variables() {
            let (class, width) = self.class_and_width(var.ty)?;
            let reg = self.cg.create_vreg(class, width);
            self.var_regs.push(reg);
        }

        self.cur = self.get_or_create_cg_block(layout[0]);
        self.cg.append_block(self.cur);
        self.lower_entry_copies()?;

        for (pos, &block_id) in layout.iter().enumerate() {
            if pos > 0 {
                let cg_block = self.get_or_create_cg_block(block_id);
                self.cg.append_block(cg_block);
                self.cur = cg_block;
            }
            for stmt in self.mir.block(block_id).stmts.clone() {
                self.lower_stmt(stmt)?;
            }
            // Explicit jump to the next layout block when the statement list
            // fell off the end; peephole removes it if it is a fallthrough.
            if !self.ends_with_terminator() {
                if let Some(&next) = layout.get(pos + 1) {
                    let target = self.get_or_create_cg_block(next);
                    self.emit_branch(target);
                }
            }
        }
        Ok(())
    }

    // ==================== Emission helpers ====================

    fn emit(&mut self, op: X64Op, width: OpWidth, operands: Vec<CgOperand>) {
        self.cg.push_inst(self.cur, CgInst::new(op, width, operands));
    }

    fn new_gpr(&mut self, width: OpWidth) -> CgReg {
        self.cg.create_vreg(RegClass::Gpr, width)
    }

    fn new_fpr(&mut self, width: OpWidth) -> CgReg {
        self.cg.create_vreg(RegClass::Fpr, width)
    }

    fn reg_width(&self, reg: CgReg) -> OpWidth {
        if reg.is_virtual() {
            self.cg.vreg_info(reg).width
        } else {
            OpWidth::B64
        }
    }

    fn reg_class(&self, reg: CgReg) -> RegClass {
        if reg.is_virtual() {
            self.cg.vreg_info(reg).class
        } else {
            regs::class_of(reg)
        }
    }

    /// Plain register copy with the right move for the class.
    fn emit_copy(&mut self, dst: CgReg, src: CgReg, width: OpWidth) {
        let op = if self.reg_class(dst) == RegClass::Fpr {
            X64Op::Movs
        } else {
            X64Op::Mov
        };
        self.emit(op, width, vec![CgOperand::def(dst), CgOperand::use_(src)]);
    }

    fn materialize_int(&mut self, value: i64, width: OpWidth) -> CgReg {
        let dst = self.new_gpr(width);
        self.emit(
            X64Op::MovImm,
            width,
            vec![CgOperand::def(dst), CgOperand::Imm(value)],
        );
        dst
    }

    fn materialize_float_bits(&mut self, bits: u64, width: OpWidth) -> CgReg {
        let gpr = self.materialize_int(bits as i64, width);
        let dst = self.new_fpr(width);
        self.emit(
            X64Op::MovGprToFp,
            width,
            vec![CgOperand::def(dst), CgOperand::use_(gpr)],
        );
        dst
    }

    fn class_and_width(&self, ty: TypeId) -> Result<(RegClass, OpWidth)> {
        Ok(match self.ctx.types.get(ty) {
            MirType::I8 => (RegClass::Gpr, OpWidth::B8),
            MirType::I16 => (RegClass::Gpr, OpWidth::B16),
            MirType::I32 => (RegClass::Gpr, OpWidth::B32),
            MirType::I64 => (RegClass::Gpr, OpWidth::B64),
            MirType::F32 => (RegClass::Fpr, OpWidth::B32),
            MirType::F64 => (RegClass::Fpr, OpWidth::B64),
            MirType::Ptr { .. } => (RegClass::Gpr, OpWidth::B64),
            MirType::Void | MirType::Func { .. } => {
                return Err(CodegenError::UnexpectedType(Phase::Compilation))
            }
        })
    }

    // ==================== Blocks and branches ====================

    fn get_or_create_cg_block(&mut self, mir_block: BlockId) -> CgBlockId {
        if let Some(&cg) = self.block_map.get(&mir_block) {
            return cg;
        }
        let cg = self.cg.create_block();
        self.block_map.insert(mir_block, cg);
        cg
    }

    fn exception_cg_block(&mut self, code: TrapCode) -> CgBlockId {
        let mir_block = self
            .mir
            .exception_set_blocks()
            .get(&code)
            .copied()
            .expect("exception set block not materialized");
        self.get_or_create_cg_block(mir_block)
    }

    fn emit_branch(&mut self, target: CgBlockId) {
        self.emit(X64Op::Jmp, OpWidth::B64, vec![CgOperand::Block(target)]);
        self.cg.add_unique_successor(self.cur, target);
    }

    fn emit_cond_branch(&mut self, target: CgBlockId, cc: CondCode) {
        self.emit(X64Op::Jcc(cc), OpWidth::B64, vec![CgOperand::Block(target)]);
        self.cg.add_unique_successor(self.cur, target);
    }

    /// Split the current block after a conditional branch; the new block is
    /// the fallthrough successor.
    fn start_new_block_after_branch(&mut self) {
        let next = self.cg.create_block();
        self.cg.add_successor(self.cur, next);
        self.cg.append_block(next);
        self.cur = next;
    }

    fn ends_with_terminator(&self) -> bool {
        self.cg
            .block(self.cur)
            .insts
            .last()
            .is_some_and(|inst| inst.op.is_terminator())
    }

    // ==================== Entry ====================

    /// Copy incoming System-V arguments into the parameter variables.
    fn lower_entry_copies(&mut self) -> Result<()> {
        let params = self.ctx.types.func_params(self.mir.ty).to_vec();
        let mut int_idx = 0usize;
        let mut fp_idx = 0usize;
        let mut stack_off = 16i64; // above the saved RBP and return address
        for (i, &ty) in params.iter().enumerate() {
            let (class, width) = self.class_and_width(ty)?;
            let dst = self.var_regs[i];
            match class {
                RegClass::Gpr if int_idx < regs::INT_ARG_REGS.len() => {
                    let src = regs::INT_ARG_REGS[int_idx];
                    int_idx += 1;
                    self.emit_copy(dst, src, width);
                }
                RegClass::Fpr if fp_idx < regs::FLOAT_ARG_REGS.len() => {
                    let src = regs::FLOAT_ARG_REGS[fp_idx];
                    fp_idx += 1;
                    self.emit_copy(dst, src, width);
                }
                _ => {
                    let index = self.cg.frame.create_object(
                        8,
                        8,
                        crate::cgir::StackObjectKind::Fixed(stack_off),
                    );
                    stack_off += 8;
                    let op = if class == RegClass::Fpr {
                        X64Op::Movs
                    } else {
                        X64Op::Mov
                    };
                    self.emit(
                        op,
                        width,
                        vec![CgOperand::def(dst), CgOperand::FrameIndex(index)],
                    );
                }
            }
        }
        Ok(())
    }

    // ==================== Statements ====================

    fn lower_stmt(&mut self, id: InstId) -> Result<()> {
        let inst = self.mir.inst(id).clone();
        match inst.kind {
            InstKind::Dassign { value, var } => {
                let src = self.lower_expr(value)?;
                let dst = self.var_regs[var as usize];
                let width = self.reg_width(dst);
                self.emit_copy(dst, src, width);
            }
            InstKind::Br { target } => {
                let cg = self.get_or_create_cg_block(target);
                self.emit_branch(cg);
            }
            InstKind::BrIf {
                cond,
                true_block,
                false_block,
            } => {
                let target = self.get_or_create_cg_block(true_block);
                self.lower_branch_on(cond, target)?;
                match false_block {
                    Some(fb) => {
                        let cg = self.get_or_create_cg_block(fb);
                        self.emit_branch(cg);
                    }
                    None => self.start_new_block_after_branch(),
                }
            }
            InstKind::Switch {
                cond,
                default,
                cases,
            } => {
                let value = self.lower_expr(cond)?;
                let width = self.reg_width(value);
                for (case_value, case_block) in cases {
                    let imm = self.case_imm(case_value)?;
                    self.emit(
                        X64Op::Cmp,
                        width,
                        vec![CgOperand::use_(value), CgOperand::Imm(imm)],
                    );
                    let target = self.get_or_create_cg_block(case_block);
                    self.emit_cond_branch(target, CondCode::E);
                    self.start_new_block_after_branch();
                }
                let target = self.get_or_create_cg_block(default);
                self.emit_branch(target);
            }
            InstKind::Return { value } => {
                if let Some(value) = value {
                    let src = self.lower_expr(value)?;
                    let width = self.reg_width(src);
                    let (ret_reg, op) = if self.reg_class(src) == RegClass::Fpr {
                        (regs::XMM0, X64Op::Movs)
                    } else {
                        (regs::RAX, X64Op::Mov)
                    };
                    self.emit(
                        op,
                        width,
                        vec![CgOperand::def(ret_reg), CgOperand::use_(src)],
                    );
                }
                self.emit(X64Op::Ret, OpWidth::B64, vec![]);
            }
            InstKind::Store {
                value,
                base,
                index,
                scale,
                offset,
            } => {
                let value_reg = self.lower_expr(value)?;
                let mem = self.lower_mem(base, index, scale, offset)?;
                let width = self.reg_width(value_reg);
                let op = if self.reg_class(value_reg) == RegClass::Fpr {
                    X64Op::Movs
                } else {
                    X64Op::Mov
                };
                self.emit(
                    op,
                    width,
                    vec![CgOperand::Mem(mem), CgOperand::use_(value_reg)],
                );
            }
            InstKind::Call { callee, args } => {
                self.lower_call(CallTarget::Direct(callee), &args, inst.ty)?;
            }
            InstKind::ICall { callee, args } => {
                let target = self.lower_expr(callee)?;
                self.lower_call(CallTarget::Indirect(target), &args, inst.ty)?;
            }
            InstKind::Unreachable => {
                self.emit(X64Op::Ud2, OpWidth::B64, vec![]);
            }
            InstKind::WasmCheckMemoryAccess {
                base,
                boundary,
                offset,
            } => self.lower_check_memory_access(base, boundary, offset)?,
            InstKind::WasmCheckStackBoundary { boundary } => {
                let boundary_reg = self.lower_expr(boundary)?;
                self.emit(
                    X64Op::Cmp,
                    OpWidth::B64,
                    vec![CgOperand::use_(regs::RSP), CgOperand::use_(boundary_reg)],
                );
                let target = self.exception_cg_block(TrapCode::CallStackExhausted);
                self.emit_cond_branch(target, CondCode::Be);
                self.start_new_block_after_branch();
            }
            InstKind::WasmVisitStackGuard => {
                self.emit(
                    X64Op::Mov,
                    OpWidth::B64,
                    vec![
                        CgOperand::def(regs::RAX),
                        CgOperand::Mem(MemRef::base_disp(regs::RSP, -regs::STACK_GUARD_SIZE)),
                    ],
                );
            }
            _ => {
                // expression evaluated in statement position for effect
                self.lower_expr(id)?;
            }
        }
        Ok(())
    }

    fn case_imm(&self, case_value: InstId) -> Result<i64> {
        match &self.mir.inst(case_value).kind {
            InstKind::Const(c) => match self.ctx.consts.get(*c) {
                MirConst::Int { .. } => Ok(self.ctx.consts.get(*c).as_i64(&self.ctx.types)),
                MirConst::Float { .. } => {
                    Err(CodegenError::UnexpectedType(Phase::Compilation))
                }
            },
            _ => Err(CodegenError::UnsupportedInstruction(
                "switch case value must be a constant".to_string(),
            )),
        }
    }

    fn lower_check_memory_access(
        &mut self,
        base: Option<InstId>,
        boundary: InstId,
        offset: u64,
    ) -> Result<()> {
        let actual = match base {
            Some(base) => {
                let base_reg = self.lower_expr(base)?;
                // zero-extend the 32-bit address to 64 bits
                let wide = self.new_gpr(OpWidth::B64);
                self.emit(
                    X64Op::Mov,
                    OpWidth::B32,
                    vec![CgOperand::def(wide), CgOperand::use_(base_reg)],
                );
                let offset_reg = self.materialize_int(offset as i64, OpWidth::B64);
                self.emit(
                    X64Op::Add,
                    OpWidth::B64,
                    vec![CgOperand::def(wide), CgOperand::use_(offset_reg)],
                );
                wide
            }
            None => self.materialize_int(offset as i64, OpWidth::B64),
        };

        let boundary_reg = self.lower_expr(boundary)?;
        let boundary64 = self.new_gpr(OpWidth::B64);
        self.emit(
            X64Op::Mov,
            OpWidth::B32,
            vec![CgOperand::def(boundary64), CgOperand::use_(boundary_reg)],
        );
        self.emit(
            X64Op::Cmp,
            OpWidth::B64,
            vec![CgOperand::use_(actual), CgOperand::use_(boundary64)],
        );
        let target = self.exception_cg_block(TrapCode::OutOfBoundsMemory);
        self.emit_cond_branch(target, CondCode::A);
        self.start_new_block_after_branch();
        Ok(())
    }

    // ==================== Conditions ====================

    /// Integer predicate → condition code.
    fn int_cc(pred: CmpPredicate) -> CondCode {
        match pred {
            CmpPredicate::IEq => CondCode::E,
            CmpPredicate::INe => CondCode::Ne,
            CmpPredicate::IUgt => CondCode::A,
            CmpPredicate::IUge => CondCode::Ae,
            CmpPredicate::IUlt => CondCode::B,
            CmpPredicate::IUle => CondCode::Be,
            CmpPredicate::ISgt => CondCode::G,
            CmpPredicate::ISge => CondCode::Ge,
            CmpPredicate::ISlt => CondCode::L,
            CmpPredicate::ISle => CondCode::Le,
            _ => unreachable!("float predicate in int_cc"),
        }
    }

    /// Float predicate → (swap operands, condition code) for the UCOMIS
    /// forms that reduce to a single flag test.
    fn float_cc(pred: CmpPredicate) -> Option<(bool, CondCode)> {
        Some(match pred {
            CmpPredicate::FOgt => (false, CondCode::A),
            CmpPredicate::FOge => (false, CondCode::Ae),
            CmpPredicate::FOlt => (true, CondCode::A),
            CmpPredicate::FOle => (true, CondCode::Ae),
            CmpPredicate::FUgt => (true, CondCode::B),
            CmpPredicate::FUge => (true, CondCode::Be),
            CmpPredicate::FUlt => (false, CondCode::B),
            CmpPredicate::FUle => (false, CondCode::Be),
            CmpPredicate::FUeq => (false, CondCode::E),
            CmpPredicate::FOne => (false, CondCode::Ne),
            CmpPredicate::FOrd => (false, CondCode::Np),
            CmpPredicate::FUno => (false, CondCode::P),
            _ => return None,
        })
    }

    /// Emit the flag-setting compare for a fused condition and return the
    /// condition code to branch on; `None` when the condition must be
    /// materialized instead.
    fn lower_fused_cmp(&mut self, cond: InstId) -> Result<Option<CondCode>> {
        let &InstKind::Cmp { pred, lhs, rhs } = &self.mir.inst(cond).kind else {
            return Ok(None);
        };
        if pred.is_float() {
            let Some((swap, cc)) = Self::float_cc(pred) else {
                return Ok(None); // FOeq/FUne need two flag reads
            };
            let lhs_reg = self.lower_expr(lhs)?;
            let rhs_reg = self.lower_expr(rhs)?;
            let (a, b) = if swap {
                (rhs_reg, lhs_reg)
            } else {
                (lhs_reg, rhs_reg)
            };
            let width = self.reg_width(lhs_reg);
            self.emit(
                X64Op::Ucomis,
                width,
                vec![CgOperand::use_(a), CgOperand::use_(b)],
            );
            return Ok(Some(cc));
        }
        let lhs_reg = self.lower_expr(lhs)?;
        let rhs_reg = self.lower_expr(rhs)?;
        let width = self.reg_width(lhs_reg);
        self.emit(
            X64Op::Cmp,
            width,
            vec![CgOperand::use_(lhs_reg), CgOperand::use_(rhs_reg)],
        );
        Ok(Some(Self::int_cc(pred)))
    }

    /// Branch to `target` when `cond` is true.
    fn lower_branch_on(&mut self, cond: InstId, target: CgBlockId) -> Result<()> {
        if let Some(cc) = self.lower_fused_cmp(cond)? {
            self.emit_cond_branch(target, cc);
            return Ok(());
        }
        let reg = self.lower_expr(cond)?;
        let width = self.reg_width(reg);
        self.emit(
            X64Op::Test,
            width,
            vec![CgOperand::use_(reg), CgOperand::use_(reg)],
        );
        self.emit_cond_branch(target, CondCode::Ne);
        Ok(())
    }

    // ==================== Expressions ====================

    fn lower_expr(&mut self, id: InstId) -> Result<CgReg> {
        let inst = self.mir.inst(id).clone();
        match inst.kind {
            InstKind::Dread(var) => Ok(self.var_regs[var as usize]),
            InstKind::Const(c) => {
                let (_, width) = self.class_and_width(inst.ty)?;
                match *self.ctx.consts.get(c) {
                    MirConst::Int { .. } => {
                        let value = self.ctx.consts.get(c).as_i64(&self.ctx.types);
                        Ok(self.materialize_int(value, width))
                    }
                    MirConst::Float { bits, .. } => Ok(self.materialize_float_bits(bits, width)),
                }
            }
            InstKind::Unary { op, opnd } => self.lower_unary(op, opnd, inst.ty),
            InstKind::Binary { op, lhs, rhs } => self.lower_binary(op, lhs, rhs, inst.ty),
            InstKind::Cmp { pred, lhs, rhs } => self.lower_cmp_value(pred, lhs, rhs, inst.ty),
            InstKind::Select { cond, tval, fval } => self.lower_select(cond, tval, fval, inst.ty),
            InstKind::Conv { op, opnd } => self.lower_conv(op, opnd, inst.ty),
            InstKind::Load {
                src_ty,
                base,
                index,
                scale,
                offset,
                sext,
            } => self.lower_load(inst.ty, src_ty, base, index, scale, offset, sext),
            InstKind::Call { callee, ref args } => {
                let result = self.lower_call(CallTarget::Direct(callee), args, inst.ty)?;
                result.ok_or_else(|| {
                    CodegenError::UnsupportedInstruction("void call used as value".to_string())
                })
            }
            InstKind::ICall { callee, ref args } => {
                let target = self.lower_expr(callee)?;
                let result = self.lower_call(CallTarget::Indirect(target), args, inst.ty)?;
                result.ok_or_else(|| {
                    CodegenError::UnsupportedInstruction("void icall used as value".to_string())
                })
            }
            InstKind::Overflow { op, lhs, rhs } => self.lower_overflow(op, lhs, rhs, inst.ty),
            InstKind::OverflowI128 {
                op,
                lhs_lo,
                lhs_hi,
                rhs_lo,
                rhs_hi,
            } => self.lower_overflow_i128(op, lhs_lo, lhs_hi, rhs_lo, rhs_hi),
            other => Err(CodegenError::UnsupportedInstruction(format!(
                "{:?} in expression position",
                other
            ))),
        }
    }

    /// Indexed forms are folded through LEA so every memory operand carries
    /// at most one register.
    fn lower_mem(
        &mut self,
        base: InstId,
        index: Option<InstId>,
        scale: u8,
        offset: i32,
    ) -> Result<MemRef> {
        let base_reg = self.lower_expr(base)?;
        match index {
            None => Ok(MemRef::base_disp(base_reg, offset)),
            Some(index) => {
                let index_reg = self.lower_expr(index)?;
                let addr = self.new_gpr(OpWidth::B64);
                self.emit(
                    X64Op::Lea,
                    OpWidth::B64,
                    vec![
                        CgOperand::def(addr),
                        CgOperand::Mem(MemRef {
                            base: base_reg,
                            index: Some(index_reg),
                            scale,
                            disp: 0,
                        }),
                    ],
                );
                Ok(MemRef::base_disp(addr, offset))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_load(
        &mut self,
        dest_ty: TypeId,
        src_ty: TypeId,
        base: Option<InstId>,
        index: Option<InstId>,
        scale: u8,
        offset: i32,
        sext: bool,
    ) -> Result<CgReg> {
        let base = base.ok_or_else(|| {
            CodegenError::UnsupportedInstruction("load without base".to_string())
        })?;
        let mem = self.lower_mem(base, index, scale, offset)?;
        let (dest_class, dest_width) = self.class_and_width(dest_ty)?;
        let (_, src_width) = self.class_and_width(src_ty)?;

        if dest_class == RegClass::Fpr {
            let dst = self.new_fpr(dest_width);
            self.emit(
                X64Op::Movs,
                src_width,
                vec![CgOperand::def(dst), CgOperand::Mem(mem)],
            );
            return Ok(dst);
        }

        let dst = self.new_gpr(dest_width);
        if src_width == dest_width {
            self.emit(
                X64Op::Mov,
                dest_width,
                vec![CgOperand::def(dst), CgOperand::Mem(mem)],
            );
        } else {
            let ext = match src_width {
                OpWidth::B8 => ExtWidth::B8,
                OpWidth::B16 => ExtWidth::B16,
                OpWidth::B32 => ExtWidth::B32,
                OpWidth::B64 => unreachable!("widening load from 64 bits"),
            };
            if sext {
                self.emit(
                    X64Op::MovSx(ext),
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::Mem(mem)],
                );
            } else if ext == ExtWidth::B32 {
                // 32-bit mov zero-extends into the full register
                self.emit(
                    X64Op::Mov,
                    OpWidth::B32,
                    vec![CgOperand::def(dst), CgOperand::Mem(mem)],
                );
            } else {
                self.emit(
                    X64Op::MovZx(ext),
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::Mem(mem)],
                );
            }
        }
        Ok(dst)
    }

    // ==================== Unary ====================

    fn lower_unary(&mut self, op: UnaryOp, opnd: InstId, ty: TypeId) -> Result<CgReg> {
        let src = self.lower_expr(opnd)?;
        let (_, width) = self.class_and_width(ty)?;
        match op {
            UnaryOp::Clz => Ok(self.lower_clz(src, width)),
            UnaryOp::Ctz => Ok(self.lower_ctz(src, width)),
            UnaryOp::Popcnt => Ok(self.lower_popcnt(src, width)),
            UnaryOp::FpNeg => {
                let mask = self.sign_mask(width);
                let dst = self.new_fpr(width);
                self.emit_copy(dst, src, width);
                self.emit(
                    X64Op::Xorps,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(mask)],
                );
                Ok(dst)
            }
            UnaryOp::FpAbs => {
                let mask = self.abs_mask(width);
                let dst = self.new_fpr(width);
                self.emit_copy(dst, src, width);
                self.emit(
                    X64Op::Andps,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(mask)],
                );
                Ok(dst)
            }
            UnaryOp::FpSqrt => {
                let dst = self.new_fpr(width);
                self.emit(
                    X64Op::Sqrts,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(src)],
                );
                Ok(dst)
            }
            UnaryOp::FpRoundCeil => self.lower_round(src, width, RoundingMode::Up),
            UnaryOp::FpRoundFloor => self.lower_round(src, width, RoundingMode::Down),
            UnaryOp::FpRoundTrunc => self.lower_round(src, width, RoundingMode::Zero),
            UnaryOp::FpRoundNearest => self.lower_round(src, width, RoundingMode::Nearest),
        }
    }

    fn lower_round(&mut self, src: CgReg, width: OpWidth, mode: RoundingMode) -> Result<CgReg> {
        let dst = self.new_fpr(width);
        self.emit(
            X64Op::Rounds(mode),
            width,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        Ok(dst)
    }

    /// BSR + CMOVE with the `2*width-1` sentinel, then XOR with `width-1`.
    fn lower_clz(&mut self, src: CgReg, width: OpWidth) -> CgReg {
        let bits = width.bits() as i64;
        let scan = self.new_gpr(width);
        self.emit(
            X64Op::Bsr,
            width,
            vec![CgOperand::def(scan), CgOperand::use_(src)],
        );
        let sentinel = self.materialize_int(2 * bits - 1, width);
        let merged = self.new_gpr(width);
        self.emit_copy(merged, scan, width);
        self.emit(
            X64Op::Cmovcc(CondCode::E),
            width,
            vec![CgOperand::def(merged), CgOperand::use_(sentinel)],
        );
        let dst = self.new_gpr(width);
        self.emit_copy(dst, merged, width);
        self.emit(
            X64Op::Xor,
            width,
            vec![CgOperand::def(dst), CgOperand::Imm(bits - 1)],
        );
        dst
    }

    /// BSF + CMOVE with the width sentinel.
    fn lower_ctz(&mut self, src: CgReg, width: OpWidth) -> CgReg {
        let bits = width.bits() as i64;
        let scan = self.new_gpr(width);
        self.emit(
            X64Op::Bsf,
            width,
            vec![CgOperand::def(scan), CgOperand::use_(src)],
        );
        let sentinel = self.materialize_int(bits, width);
        let dst = self.new_gpr(width);
        self.emit_copy(dst, scan, width);
        self.emit(
            X64Op::Cmovcc(CondCode::E),
            width,
            vec![CgOperand::def(dst), CgOperand::use_(sentinel)],
        );
        dst
    }

    /// SWAR popcount; 32-bit uses immediate masks, 64-bit materializes them.
    fn lower_popcnt(&mut self, src: CgReg, width: OpWidth) -> CgReg {
        let is32 = width == OpWidth::B32;
        let mask1: i64 = if is32 { 0x55555555 } else { 0x5555555555555555 };
        let mask2: i64 = if is32 { 0x33333333 } else { 0x3333333333333333 };
        let mask3: i64 = if is32 { 0x0f0f0f0f } else { 0x0f0f0f0f0f0f0f0f };
        let mul: i64 = if is32 { 0x01010101 } else { 0x0101010101010101 };
        let final_shift: i64 = if is32 { 24 } else { 56 };

        let and_imm_or_reg = |this: &mut Self, dst: CgReg, imm: i64, mask_reg: Option<CgReg>| {
            match mask_reg {
                Some(mask) => this.emit(
                    X64Op::And,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(mask)],
                ),
                None => this.emit(
                    X64Op::And,
                    width,
                    vec![CgOperand::def(dst), CgOperand::Imm(imm)],
                ),
            }
        };

        let mask1_reg = (!is32).then(|| self.materialize_int(mask1, width));
        let mask2_reg = (!is32).then(|| self.materialize_int(mask2, width));

        // n - ((n >> 1) & mask1)
        let shr1 = self.new_gpr(width);
        self.emit_copy(shr1, src, width);
        self.emit(
            X64Op::Shr,
            width,
            vec![CgOperand::def(shr1), CgOperand::Imm(1)],
        );
        and_imm_or_reg(self, shr1, mask1, mask1_reg);
        let sub = self.new_gpr(width);
        self.emit_copy(sub, src, width);
        self.emit(
            X64Op::Sub,
            width,
            vec![CgOperand::def(sub), CgOperand::use_(shr1)],
        );

        // (n & mask2) + ((n >> 2) & mask2)
        let low = self.new_gpr(width);
        self.emit_copy(low, sub, width);
        and_imm_or_reg(self, low, mask2, mask2_reg);
        let high = self.new_gpr(width);
        self.emit_copy(high, sub, width);
        self.emit(
            X64Op::Shr,
            width,
            vec![CgOperand::def(high), CgOperand::Imm(2)],
        );
        and_imm_or_reg(self, high, mask2, mask2_reg);
        self.emit(
            X64Op::Add,
            width,
            vec![CgOperand::def(low), CgOperand::use_(high)],
        );

        // (n + (n >> 4)) & mask3
        let shr4 = self.new_gpr(width);
        self.emit_copy(shr4, low, width);
        self.emit(
            X64Op::Shr,
            width,
            vec![CgOperand::def(shr4), CgOperand::Imm(4)],
        );
        self.emit(
            X64Op::Add,
            width,
            vec![CgOperand::def(low), CgOperand::use_(shr4)],
        );
        let mask3_reg = (!is32).then(|| self.materialize_int(mask3, width));
        and_imm_or_reg(self, low, mask3, mask3_reg);

        // (n * 0x0101..) >> (width - 8)
        if is32 {
            self.emit(
                X64Op::Imul,
                width,
                vec![CgOperand::def(low), CgOperand::Imm(mul)],
            );
        } else {
            let mul_reg = self.materialize_int(mul, width);
            self.emit(
                X64Op::Imul,
                width,
                vec![CgOperand::def(low), CgOperand::use_(mul_reg)],
            );
        }
        self.emit(
            X64Op::Shr,
            width,
            vec![CgOperand::def(low), CgOperand::Imm(final_shift)],
        );
        low
    }

    fn sign_mask(&mut self, width: OpWidth) -> CgReg {
        let bits = if width == OpWidth::B32 {
            F32_SIGN_MASK
        } else {
            F64_SIGN_MASK
        };
        self.materialize_float_bits(bits, width)
    }

    fn abs_mask(&mut self, width: OpWidth) -> CgReg {
        let bits = if width == OpWidth::B32 {
            !F32_SIGN_MASK & 0xffff_ffff
        } else {
            !F64_SIGN_MASK
        };
        self.materialize_float_bits(bits, width)
    }

    // ==================== Binary ====================

    fn lower_binary(&mut self, op: BinaryOp, lhs: InstId, rhs: InstId, ty: TypeId) -> Result<CgReg> {
        let (_, width) = self.class_and_width(ty)?;
        match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::And
            | BinaryOp::Or
            | BinaryOp::Xor => {
                let alu = match op {
                    BinaryOp::Add => X64Op::Add,
                    BinaryOp::Sub => X64Op::Sub,
                    BinaryOp::Mul => X64Op::Imul,
                    BinaryOp::And => X64Op::And,
                    BinaryOp::Or => X64Op::Or,
                    BinaryOp::Xor => X64Op::Xor,
                    _ => unreachable!(),
                };
                let lhs_reg = self.lower_expr(lhs)?;
                let rhs_reg = self.lower_expr(rhs)?;
                let dst = self.new_gpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(alu, width, vec![CgOperand::def(dst), CgOperand::use_(rhs_reg)]);
                Ok(dst)
            }
            BinaryOp::DivS | BinaryOp::RemS => self.lower_div(lhs, rhs, width, true, op == BinaryOp::RemS),
            BinaryOp::DivU | BinaryOp::RemU => self.lower_div(lhs, rhs, width, false, op == BinaryOp::RemU),
            BinaryOp::Shl | BinaryOp::ShrS | BinaryOp::ShrU | BinaryOp::Rotl | BinaryOp::Rotr => {
                let shift = match op {
                    BinaryOp::Shl => X64Op::Shl,
                    BinaryOp::ShrS => X64Op::Sar,
                    BinaryOp::ShrU => X64Op::Shr,
                    BinaryOp::Rotl => X64Op::Rol,
                    BinaryOp::Rotr => X64Op::Ror,
                    _ => unreachable!(),
                };
                let lhs_reg = self.lower_expr(lhs)?;
                let rhs_reg = self.lower_expr(rhs)?;
                let dst = self.new_gpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(
                    X64Op::Mov,
                    width,
                    vec![CgOperand::def(regs::RCX), CgOperand::use_(rhs_reg)],
                );
                self.emit(
                    shift,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(regs::RCX)],
                );
                Ok(dst)
            }
            BinaryOp::FpAdd | BinaryOp::FpSub | BinaryOp::FpMul | BinaryOp::FpDiv => {
                let alu = match op {
                    BinaryOp::FpAdd => X64Op::Adds,
                    BinaryOp::FpSub => X64Op::Subs,
                    BinaryOp::FpMul => X64Op::Muls,
                    BinaryOp::FpDiv => X64Op::Divs,
                    _ => unreachable!(),
                };
                let lhs_reg = self.lower_expr(lhs)?;
                let rhs_reg = self.lower_expr(rhs)?;
                let dst = self.new_fpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(alu, width, vec![CgOperand::def(dst), CgOperand::use_(rhs_reg)]);
                Ok(dst)
            }
            BinaryOp::FpMin => self.lower_fmin_fmax(lhs, rhs, width, true),
            BinaryOp::FpMax => self.lower_fmin_fmax(lhs, rhs, width, false),
            BinaryOp::FpCopysign => {
                let lhs_reg = self.lower_expr(lhs)?;
                let rhs_reg = self.lower_expr(rhs)?;
                let sign = self.sign_mask(width);
                let sign_bits = self.new_fpr(width);
                self.emit_copy(sign_bits, rhs_reg, width);
                self.emit(
                    X64Op::Andps,
                    width,
                    vec![CgOperand::def(sign_bits), CgOperand::use_(sign)],
                );
                let mag = self.abs_mask(width);
                let dst = self.new_fpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(
                    X64Op::Andps,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(mag)],
                );
                self.emit(
                    X64Op::Orps,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(sign_bits)],
                );
                Ok(dst)
            }
        }
    }

    /// RDX:RAX division; the MIR frontend has already emitted the zero and
    /// overflow checks that apply in the current compile mode.
    fn lower_div(
        &mut self,
        lhs: InstId,
        rhs: InstId,
        width: OpWidth,
        signed: bool,
        remainder: bool,
    ) -> Result<CgReg> {
        let lhs_reg = self.lower_expr(lhs)?;
        let rhs_reg = self.lower_expr(rhs)?;
        self.emit(
            X64Op::Mov,
            width,
            vec![CgOperand::def(regs::RAX), CgOperand::use_(lhs_reg)],
        );
        if signed {
            self.emit(
                X64Op::Cdq,
                width,
                vec![CgOperand::def(regs::RDX), CgOperand::use_(regs::RAX)],
            );
            self.emit(
                X64Op::Idiv,
                width,
                vec![
                    CgOperand::use_(rhs_reg),
                    CgOperand::def(regs::RAX),
                    CgOperand::def(regs::RDX),
                ],
            );
        } else {
            self.emit(
                X64Op::MovImm,
                width,
                vec![CgOperand::def(regs::RDX), CgOperand::Imm(0)],
            );
            self.emit(
                X64Op::Div,
                width,
                vec![
                    CgOperand::use_(rhs_reg),
                    CgOperand::def(regs::RAX),
                    CgOperand::def(regs::RDX),
                ],
            );
        }
        let dst = self.new_gpr(width);
        let src = if remainder { regs::RDX } else { regs::RAX };
        self.emit(
            X64Op::Mov,
            width,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        Ok(dst)
    }

    /// wasm min/max semantics: NaN propagates as canonical NaN, equal
    /// operands merge sign bits so `-0` orders below `+0`.
    fn lower_fmin_fmax(
        &mut self,
        lhs: InstId,
        rhs: InstId,
        width: OpWidth,
        is_min: bool,
    ) -> Result<CgReg> {
        let a = self.lower_expr(lhs)?;
        let b = self.lower_expr(rhs)?;
        let dst = self.new_fpr(width);

        let take_b = self.cg.create_block();
        let nan = self.cg.create_block();
        let end = self.cg.create_block();

        self.emit_copy(dst, a, width);
        self.emit(
            X64Op::Ucomis,
            width,
            vec![CgOperand::use_(a), CgOperand::use_(b)],
        );
        self.emit_cond_branch(nan, CondCode::P);
        self.start_new_block_after_branch();
        self.emit_cond_branch(end, if is_min { CondCode::B } else { CondCode::A });
        self.start_new_block_after_branch();
        self.emit_cond_branch(take_b, if is_min { CondCode::A } else { CondCode::B });
        self.start_new_block_after_branch();
        // equal: merge signs so that -0/+0 order correctly
        let merge = if is_min { X64Op::Orps } else { X64Op::Andps };
        self.emit(merge, width, vec![CgOperand::def(dst), CgOperand::use_(b)]);
        self.emit_branch(end);

        self.cg.append_block(take_b);
        self.cur = take_b;
        self.emit_copy(dst, b, width);
        self.emit_branch(end);

        self.cg.append_block(nan);
        self.cur = nan;
        let nan_bits = if width == OpWidth::B32 {
            F32_CANONICAL_NAN
        } else {
            F64_CANONICAL_NAN
        };
        let nan_reg = self.materialize_float_bits(nan_bits, width);
        self.emit_copy(dst, nan_reg, width);
        self.emit_branch(end);

        self.cg.append_block(end);
        self.cur = end;
        Ok(dst)
    }

    // ==================== Compare / select ====================

    fn lower_cmp_value(
        &mut self,
        pred: CmpPredicate,
        lhs: InstId,
        rhs: InstId,
        ty: TypeId,
    ) -> Result<CgReg> {
        match pred {
            CmpPredicate::FFalse => return Ok(self.materialize_int(0, OpWidth::B32)),
            CmpPredicate::FTrue => return Ok(self.materialize_int(1, OpWidth::B32)),
            _ => {}
        }

        let flag = if pred.is_float() {
            match Self::float_cc(pred) {
                Some(_) => {
                    let cc = self
                        .lower_fused_cmp_inline(pred, lhs, rhs)?
                        .expect("single-flag float predicate");
                    let flag = self.new_gpr(OpWidth::B8);
                    self.emit(X64Op::Setcc(cc), OpWidth::B8, vec![CgOperand::def(flag)]);
                    flag
                }
                None => {
                    // FOeq = E && NP, FUne = NE || P
                    let lhs_reg = self.lower_expr(lhs)?;
                    let rhs_reg = self.lower_expr(rhs)?;
                    let width = self.reg_width(lhs_reg);
                    self.emit(
                        X64Op::Ucomis,
                        width,
                        vec![CgOperand::use_(lhs_reg), CgOperand::use_(rhs_reg)],
                    );
                    let ordered_eq = pred == CmpPredicate::FOeq;
                    let first = self.new_gpr(OpWidth::B8);
                    let second = self.new_gpr(OpWidth::B8);
                    let (cc1, cc2, combine) = if ordered_eq {
                        (CondCode::E, CondCode::Np, X64Op::And)
                    } else {
                        (CondCode::Ne, CondCode::P, X64Op::Or)
                    };
                    self.emit(X64Op::Setcc(cc1), OpWidth::B8, vec![CgOperand::def(first)]);
                    self.emit(X64Op::Setcc(cc2), OpWidth::B8, vec![CgOperand::def(second)]);
                    self.emit(
                        combine,
                        OpWidth::B8,
                        vec![CgOperand::def(first), CgOperand::use_(second)],
                    );
                    first
                }
            }
        } else {
            let cc = self
                .lower_fused_cmp_inline(pred, lhs, rhs)?
                .expect("integer predicate");
            let flag = self.new_gpr(OpWidth::B8);
            self.emit(X64Op::Setcc(cc), OpWidth::B8, vec![CgOperand::def(flag)]);
            flag
        };

        let (_, width) = self.class_and_width(ty)?;
        if width == OpWidth::B8 {
            return Ok(flag);
        }
        let dst = self.new_gpr(width);
        self.emit(
            X64Op::MovZx(ExtWidth::B8),
            width,
            vec![CgOperand::def(dst), CgOperand::use_(flag)],
        );
        Ok(dst)
    }

    /// Emit the compare for a known predicate and return its condition code.
    fn lower_fused_cmp_inline(
        &mut self,
        pred: CmpPredicate,
        lhs: InstId,
        rhs: InstId,
    ) -> Result<Option<CondCode>> {
        if pred.is_float() {
            let Some((swap, cc)) = Self::float_cc(pred) else {
                return Ok(None);
            };
            let lhs_reg = self.lower_expr(lhs)?;
            let rhs_reg = self.lower_expr(rhs)?;
            let (a, b) = if swap {
                (rhs_reg, lhs_reg)
            } else {
                (lhs_reg, rhs_reg)
            };
            let width = self.reg_width(lhs_reg);
            self.emit(
                X64Op::Ucomis,
                width,
                vec![CgOperand::use_(a), CgOperand::use_(b)],
            );
            return Ok(Some(cc));
        }
        let lhs_reg = self.lower_expr(lhs)?;
        let rhs_reg = self.lower_expr(rhs)?;
        let width = self.reg_width(lhs_reg);
        self.emit(
            X64Op::Cmp,
            width,
            vec![CgOperand::use_(lhs_reg), CgOperand::use_(rhs_reg)],
        );
        Ok(Some(Self::int_cc(pred)))
    }

    fn lower_select(
        &mut self,
        cond: InstId,
        tval: InstId,
        fval: InstId,
        ty: TypeId,
    ) -> Result<CgReg> {
        let (class, width) = self.class_and_width(ty)?;
        let t = self.lower_expr(tval)?;
        let f = self.lower_expr(fval)?;

        if class == RegClass::Gpr {
            // CMOV: dst = f; if cond then dst = t
            let cc = match self.lower_fused_cmp(cond)? {
                Some(cc) => cc,
                None => {
                    let reg = self.lower_expr(cond)?;
                    let cwidth = self.reg_width(reg);
                    self.emit(
                        X64Op::Test,
                        cwidth,
                        vec![CgOperand::use_(reg), CgOperand::use_(reg)],
                    );
                    CondCode::Ne
                }
            };
            // CMOV has no 8-bit form
            let cmov_width = if width == OpWidth::B8 { OpWidth::B32 } else { width };
            let dst = self.new_gpr(width);
            self.emit_copy(dst, f, width);
            self.emit(
                X64Op::Cmovcc(cc),
                cmov_width,
                vec![CgOperand::def(dst), CgOperand::use_(t)],
            );
            return Ok(dst);
        }

        // no CMOV for XMM: branch
        let take_f = self.cg.create_block();
        let end = self.cg.create_block();
        let dst = self.new_fpr(width);
        let cc = match self.lower_fused_cmp(cond)? {
            Some(cc) => cc,
            None => {
                let reg = self.lower_expr(cond)?;
                let cwidth = self.reg_width(reg);
                self.emit(
                    X64Op::Test,
                    cwidth,
                    vec![CgOperand::use_(reg), CgOperand::use_(reg)],
                );
                CondCode::Ne
            }
        };
        self.emit_cond_branch(take_f, cc.inverted());
        self.start_new_block_after_branch();
        self.emit_copy(dst, t, width);
        self.emit_branch(end);
        self.cg.append_block(take_f);
        self.cur = take_f;
        self.emit_copy(dst, f, width);
        self.emit_branch(end);
        self.cg.append_block(end);
        self.cur = end;
        Ok(dst)
    }

    // ==================== Conversions ====================

    fn lower_conv(&mut self, op: ConvOp, opnd: InstId, ty: TypeId) -> Result<CgReg> {
        let src_ty = self.mir.inst(opnd).ty;
        let src = self.lower_expr(opnd)?;
        let (_, dest_width) = self.class_and_width(ty)?;
        let (_, src_width) = self.class_and_width(src_ty)?;
        match op {
            ConvOp::Trunc | ConvOp::IntToPtr | ConvOp::PtrToInt => {
                let dst = self.new_gpr(dest_width);
                self.emit(
                    X64Op::Mov,
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::use_(src)],
                );
                Ok(dst)
            }
            ConvOp::Sext => {
                let ext = Self::ext_width(src_width);
                let dst = self.new_gpr(dest_width);
                self.emit(
                    X64Op::MovSx(ext),
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::use_(src)],
                );
                Ok(dst)
            }
            ConvOp::Uext => {
                let dst = self.new_gpr(dest_width);
                if src_width == OpWidth::B32 {
                    // 32-bit mov clears the high half
                    self.emit(
                        X64Op::Mov,
                        OpWidth::B32,
                        vec![CgOperand::def(dst), CgOperand::use_(src)],
                    );
                } else {
                    self.emit(
                        X64Op::MovZx(Self::ext_width(src_width)),
                        dest_width,
                        vec![CgOperand::def(dst), CgOperand::use_(src)],
                    );
                }
                Ok(dst)
            }
            ConvOp::Bitcast => {
                let src_is_fp = self.reg_class(src) == RegClass::Fpr;
                let dest_is_fp = matches!(self.ctx.types.get(ty), MirType::F32 | MirType::F64);
                let dst = match (src_is_fp, dest_is_fp) {
                    (false, true) => {
                        let dst = self.new_fpr(dest_width);
                        self.emit(
                            X64Op::MovGprToFp,
                            dest_width,
                            vec![CgOperand::def(dst), CgOperand::use_(src)],
                        );
                        dst
                    }
                    (true, false) => {
                        let dst = self.new_gpr(dest_width);
                        self.emit(
                            X64Op::MovFpToGpr,
                            dest_width,
                            vec![CgOperand::def(dst), CgOperand::use_(src)],
                        );
                        dst
                    }
                    _ => {
                        let dst = self.new_gpr(dest_width);
                        self.emit_copy(dst, src, dest_width);
                        dst
                    }
                };
                Ok(dst)
            }
            ConvOp::FpTrunc | ConvOp::FpExt => {
                let dst = self.new_fpr(dest_width);
                self.emit(
                    X64Op::Cvtf2f,
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::use_(src)],
                );
                Ok(dst)
            }
            ConvOp::SiToFp => {
                let dst = self.new_fpr(dest_width);
                self.emit(
                    X64Op::Cvti2f {
                        from64: src_width == OpWidth::B64,
                    },
                    dest_width,
                    vec![CgOperand::def(dst), CgOperand::use_(src)],
                );
                Ok(dst)
            }
            ConvOp::UiToFp => self.lower_uitofp(src, src_width, dest_width),
            ConvOp::WasmFpToSi => self.lower_fptosi(src, src_width, dest_width),
            ConvOp::WasmFpToUi => {
                if dest_width == OpWidth::B32 {
                    self.lower_fptoui32(src, src_width)
                } else {
                    self.lower_fptoui64(src, src_width)
                }
            }
        }
    }

    fn ext_width(width: OpWidth) -> ExtWidth {
        match width {
            OpWidth::B8 => ExtWidth::B8,
            OpWidth::B16 => ExtWidth::B16,
            OpWidth::B32 => ExtWidth::B32,
            OpWidth::B64 => ExtWidth::B32,
        }
    }

    fn lower_uitofp(&mut self, src: CgReg, src_width: OpWidth, dest_width: OpWidth) -> Result<CgReg> {
        if src_width == OpWidth::B32 {
            // zero-extend and use the 64-bit signed convert
            let wide = self.new_gpr(OpWidth::B64);
            self.emit(
                X64Op::Mov,
                OpWidth::B32,
                vec![CgOperand::def(wide), CgOperand::use_(src)],
            );
            let dst = self.new_fpr(dest_width);
            self.emit(
                X64Op::Cvti2f { from64: true },
                dest_width,
                vec![CgOperand::def(dst), CgOperand::use_(wide)],
            );
            return Ok(dst);
        }

        // u64: values with the sign bit set round via halving + doubling
        let dst = self.new_fpr(dest_width);
        let big = self.cg.create_block();
        let end = self.cg.create_block();
        self.emit(
            X64Op::Test,
            OpWidth::B64,
            vec![CgOperand::use_(src), CgOperand::use_(src)],
        );
        self.emit_cond_branch(big, CondCode::S);
        self.start_new_block_after_branch();
        self.emit(
            X64Op::Cvti2f { from64: true },
            dest_width,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        self.emit_branch(end);

        self.cg.append_block(big);
        self.cur = big;
        let half = self.new_gpr(OpWidth::B64);
        self.emit_copy(half, src, OpWidth::B64);
        self.emit(
            X64Op::Shr,
            OpWidth::B64,
            vec![CgOperand::def(half), CgOperand::Imm(1)],
        );
        let low_bit = self.new_gpr(OpWidth::B64);
        self.emit_copy(low_bit, src, OpWidth::B64);
        self.emit(
            X64Op::And,
            OpWidth::B64,
            vec![CgOperand::def(low_bit), CgOperand::Imm(1)],
        );
        self.emit(
            X64Op::Or,
            OpWidth::B64,
            vec![CgOperand::def(half), CgOperand::use_(low_bit)],
        );
        self.emit(
            X64Op::Cvti2f { from64: true },
            dest_width,
            vec![CgOperand::def(dst), CgOperand::use_(half)],
        );
        self.emit(
            X64Op::Adds,
            dest_width,
            vec![CgOperand::def(dst), CgOperand::use_(dst)],
        );
        self.emit_branch(end);

        self.cg.append_block(end);
        self.cur = end;
        Ok(dst)
    }

    /// Trapping float→signed-int: CVTT, sentinel test, NaN test, precise
    /// range bound test; f64→i32 additionally rejects positives above the
    /// bound via a compare against +0.0.
    fn lower_fptosi(&mut self, src: CgReg, src_width: OpWidth, dest_width: OpWidth) -> Result<CgReg> {
        let is_src_f64 = src_width == OpWidth::B64;
        let is_dest_i64 = dest_width == OpWidth::B64;
        let is_f64_to_i32 = is_src_f64 && !is_dest_i64;

        let end = self.cg.create_block();
        let nan = self.exception_cg_block(TrapCode::InvalidConversionToInteger);
        let overflow = self.exception_cg_block(TrapCode::IntegerOverflow);

        let dst = self.new_gpr(dest_width);
        self.emit(
            X64Op::Cvttf2i { to64: is_dest_i64 },
            src_width,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        // CMP dst,1 overflows exactly when dst is the INT_MIN sentinel
        self.emit(
            X64Op::Cmp,
            dest_width,
            vec![CgOperand::use_(dst), CgOperand::Imm(1)],
        );
        self.emit_cond_branch(end, CondCode::No);

        self.start_new_block_after_branch();
        self.emit(
            X64Op::Ucomis,
            src_width,
            vec![CgOperand::use_(src), CgOperand::use_(src)],
        );
        self.emit_cond_branch(nan, CondCode::P);

        self.start_new_block_after_branch();
        let bound_bits = match (is_src_f64, is_dest_i64) {
            (false, false) => MIN_F32_FIT_I32,
            (false, true) => MIN_F32_FIT_I64,
            (true, false) => MAX_F64_FIT_I32,
            (true, true) => MIN_F64_FIT_I64,
        };
        let bound = self.materialize_float_bits(bound_bits, src_width);
        self.emit(
            X64Op::Ucomis,
            src_width,
            vec![CgOperand::use_(src), CgOperand::use_(bound)],
        );
        let bound_cc = if is_f64_to_i32 {
            CondCode::Be
        } else {
            CondCode::Ne
        };
        self.emit_cond_branch(overflow, bound_cc);

        if is_f64_to_i32 {
            self.start_new_block_after_branch();
            let zero = self.materialize_float_bits(0, src_width);
            self.emit(
                X64Op::Ucomis,
                src_width,
                vec![CgOperand::use_(src), CgOperand::use_(zero)],
            );
            self.emit_cond_branch(overflow, CondCode::A);
        }

        self.cg.add_unique_successor(self.cur, end);
        self.cg.append_block(end);
        self.cur = end;
        Ok(dst)
    }

    fn lower_fptoui32(&mut self, src: CgReg, src_width: OpWidth) -> Result<CgReg> {
        let end = self.cg.create_block();
        let nan = self.exception_cg_block(TrapCode::InvalidConversionToInteger);
        let overflow = self.exception_cg_block(TrapCode::IntegerOverflow);

        let wide = self.new_gpr(OpWidth::B64);
        self.emit(
            X64Op::Cvttf2i { to64: true },
            src_width,
            vec![CgOperand::def(wide), CgOperand::use_(src)],
        );
        let neg_one = self.materialize_int(0xffff_ffff, OpWidth::B64);
        self.emit(
            X64Op::Cmp,
            OpWidth::B64,
            vec![CgOperand::use_(wide), CgOperand::use_(neg_one)],
        );
        self.emit_cond_branch(end, CondCode::Be);

        self.start_new_block_after_branch();
        self.emit(
            X64Op::Ucomis,
            src_width,
            vec![CgOperand::use_(src), CgOperand::use_(src)],
        );
        self.emit_cond_branch(nan, CondCode::P);

        self.start_new_block_after_branch();
        self.emit_branch(overflow);

        self.cg.append_block(end);
        self.cur = end;
        let dst = self.new_gpr(OpWidth::B32);
        self.emit(
            X64Op::Mov,
            OpWidth::B32,
            vec![CgOperand::def(dst), CgOperand::use_(wide)],
        );
        Ok(dst)
    }

    fn lower_fptoui64(&mut self, src: CgReg, src_width: OpWidth) -> Result<CgReg> {
        let is_src_f64 = src_width == OpWidth::B64;
        let handle_large = self.cg.create_block();
        let almost_large = self.cg.create_block();
        let end = self.cg.create_block();
        let nan = self.exception_cg_block(TrapCode::InvalidConversionToInteger);
        let overflow = self.exception_cg_block(TrapCode::IntegerOverflow);

        let dst = self.new_gpr(OpWidth::B64);
        let bound_bits = if is_src_f64 {
            MIN_F64_NOT_FIT_I64
        } else {
            MIN_F32_NOT_FIT_I64
        };
        let bound = self.materialize_float_bits(bound_bits, src_width);
        self.emit(
            X64Op::Ucomis,
            src_width,
            vec![CgOperand::use_(src), CgOperand::use_(bound)],
        );
        self.emit_cond_branch(handle_large, CondCode::Ae);

        self.start_new_block_after_branch();
        self.emit_cond_branch(nan, CondCode::P);

        self.start_new_block_after_branch();
        self.emit(
            X64Op::Cvttf2i { to64: true },
            src_width,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        self.emit(
            X64Op::Cmp,
            OpWidth::B64,
            vec![CgOperand::use_(dst), CgOperand::Imm(0)],
        );
        self.emit_cond_branch(end, CondCode::Ge);

        self.start_new_block_after_branch();
        self.emit_branch(overflow);

        self.cg.append_block(handle_large);
        self.cur = handle_large;
        let reduced = self.new_fpr(src_width);
        self.emit_copy(reduced, src, src_width);
        self.emit(
            X64Op::Subs,
            src_width,
            vec![CgOperand::def(reduced), CgOperand::use_(bound)],
        );
        self.emit(
            X64Op::Cvttf2i { to64: true },
            src_width,
            vec![CgOperand::def(dst), CgOperand::use_(reduced)],
        );
        self.emit(
            X64Op::Cmp,
            OpWidth::B64,
            vec![CgOperand::use_(dst), CgOperand::Imm(0)],
        );
        self.emit_cond_branch(overflow, CondCode::L);
        self.cg.add_successor(self.cur, almost_large);
        self.cg.append_block(almost_large);
        self.cur = almost_large;
        let top_bit = self.materialize_int(i64::MIN, OpWidth::B64);
        self.emit(
            X64Op::Add,
            OpWidth::B64,
            vec![CgOperand::def(dst), CgOperand::use_(top_bit)],
        );
        self.cg.add_successor(self.cur, end);
        self.cg.append_block(end);
        self.cur = end;
        Ok(dst)
    }

    // ==================== Checked arithmetic ====================

    fn lower_overflow(
        &mut self,
        op: OverflowOp,
        lhs: InstId,
        rhs: InstId,
        ty: TypeId,
    ) -> Result<CgReg> {
        let (_, width) = self.class_and_width(ty)?;
        let lhs_reg = self.lower_expr(lhs)?;
        let rhs_reg = self.lower_expr(rhs)?;

        let cc = if op.is_signed() { CondCode::O } else { CondCode::B };
        let dst = match op {
            OverflowOp::SaddOverflow | OverflowOp::UaddOverflow => {
                let dst = self.new_gpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(X64Op::Add, width, vec![CgOperand::def(dst), CgOperand::use_(rhs_reg)]);
                dst
            }
            OverflowOp::SsubOverflow | OverflowOp::UsubOverflow => {
                let dst = self.new_gpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(X64Op::Sub, width, vec![CgOperand::def(dst), CgOperand::use_(rhs_reg)]);
                dst
            }
            OverflowOp::SmulOverflow => {
                let dst = self.new_gpr(width);
                self.emit_copy(dst, lhs_reg, width);
                self.emit(X64Op::Imul, width, vec![CgOperand::def(dst), CgOperand::use_(rhs_reg)]);
                dst
            }
            OverflowOp::UmulOverflow => {
                // one-operand MUL: RDX:RAX = RAX * operand, CF on overflow
                self.emit(
                    X64Op::Mov,
                    width,
                    vec![CgOperand::def(regs::RAX), CgOperand::use_(lhs_reg)],
                );
                self.emit(
                    X64Op::Mul,
                    width,
                    vec![
                        CgOperand::use_(rhs_reg),
                        CgOperand::def(regs::RAX),
                        CgOperand::def(regs::RDX),
                    ],
                );
                let dst = self.new_gpr(width);
                self.emit(
                    X64Op::Mov,
                    width,
                    vec![CgOperand::def(dst), CgOperand::use_(regs::RAX)],
                );
                dst
            }
        };

        let target = self.exception_cg_block(TrapCode::IntegerOverflow);
        self.emit_cond_branch(target, cc);
        self.start_new_block_after_branch();
        Ok(dst)
    }

    fn lower_overflow_i128(
        &mut self,
        op: OverflowI128Op,
        lhs_lo: InstId,
        lhs_hi: InstId,
        rhs_lo: InstId,
        rhs_hi: InstId,
    ) -> Result<CgReg> {
        let (lo_op, hi_op) = match op {
            OverflowI128Op::Sadd128Overflow | OverflowI128Op::Uadd128Overflow => {
                (X64Op::Add, X64Op::Adc)
            }
            OverflowI128Op::Ssub128Overflow | OverflowI128Op::Usub128Overflow => {
                (X64Op::Sub, X64Op::Sbb)
            }
        };
        let cc = if op.is_signed() { CondCode::O } else { CondCode::B };

        let lhs_lo_reg = self.lower_expr(lhs_lo)?;
        let lhs_hi_reg = self.lower_expr(lhs_hi)?;
        let rhs_lo_reg = self.lower_expr(rhs_lo)?;
        let rhs_hi_reg = self.lower_expr(rhs_hi)?;

        let lo = self.new_gpr(OpWidth::B64);
        self.emit_copy(lo, lhs_lo_reg, OpWidth::B64);
        self.emit(
            lo_op,
            OpWidth::B64,
            vec![CgOperand::def(lo), CgOperand::use_(rhs_lo_reg)],
        );
        let hi = self.new_gpr(OpWidth::B64);
        self.emit_copy(hi, lhs_hi_reg, OpWidth::B64);
        self.emit(
            hi_op,
            OpWidth::B64,
            vec![CgOperand::def(hi), CgOperand::use_(rhs_hi_reg)],
        );

        let target = self.exception_cg_block(TrapCode::IntegerOverflow);
        self.emit_cond_branch(target, cc);
        self.start_new_block_after_branch();
        Ok(hi)
    }

    // ==================== Calls ====================

    fn lower_call(
        &mut self,
        target: CallTarget,
        args: &[InstId],
        ret_ty: TypeId,
    ) -> Result<Option<CgReg>> {
        let arg_regs: Vec<CgReg> = args
            .iter()
            .map(|&arg| self.lower_expr(arg))
            .collect::<Result<_>>()?;

        // assign argument locations
        let mut int_idx = 0usize;
        let mut fp_idx = 0usize;
        let mut stack_bytes = 0u32;
        enum Loc {
            Reg(CgReg),
            Stack(i32),
        }
        let mut locs = Vec::with_capacity(arg_regs.len());
        for &arg in &arg_regs {
            let loc = match self.reg_class(arg) {
                RegClass::Gpr if int_idx < regs::INT_ARG_REGS.len() => {
                    let reg = regs::INT_ARG_REGS[int_idx];
                    int_idx += 1;
                    Loc::Reg(reg)
                }
                RegClass::Fpr if fp_idx < regs::FLOAT_ARG_REGS.len() => {
                    let reg = regs::FLOAT_ARG_REGS[fp_idx];
                    fp_idx += 1;
                    Loc::Reg(reg)
                }
                _ => {
                    let off = stack_bytes as i32;
                    stack_bytes += 8;
                    Loc::Stack(off)
                }
            };
            locs.push(loc);
        }

        self.cg.frame.max_call_frame_size = self.cg.frame.max_call_frame_size.max(stack_bytes);
        if stack_bytes > 0 {
            self.cg.frame.adjusts_sp = true;
        }
        self.emit(
            X64Op::CallFrameSetup,
            OpWidth::B64,
            vec![CgOperand::Imm(stack_bytes as i64)],
        );

        for (&arg, loc) in arg_regs.iter().zip(&locs) {
            let width = self.reg_width(arg);
            let is_fp = self.reg_class(arg) == RegClass::Fpr;
            match *loc {
                Loc::Reg(phys) => {
                    let op = if is_fp { X64Op::Movs } else { X64Op::Mov };
                    self.emit(op, width, vec![CgOperand::def(phys), CgOperand::use_(arg)]);
                }
                Loc::Stack(off) => {
                    let op = if is_fp { X64Op::Movs } else { X64Op::Mov };
                    self.emit(
                        op,
                        width,
                        vec![
                            CgOperand::Mem(MemRef::base_disp(regs::RSP, off)),
                            CgOperand::use_(arg),
                        ],
                    );
                }
            }
        }

        let ret_kind = self.ctx.types.get(ret_ty).clone();
        let is_void = ret_kind.is_void();
        let ret_is_fp = ret_kind.is_float();
        let mut operands = Vec::new();
        if !is_void {
            let ret_phys = if ret_is_fp { regs::XMM0 } else { regs::RAX };
            operands.push(CgOperand::def(ret_phys));
        }
        match target {
            CallTarget::Direct(index) => operands.push(CgOperand::Func(index)),
            CallTarget::Indirect(reg) => operands.push(CgOperand::use_(reg)),
        }
        self.emit(X64Op::Call, OpWidth::B64, operands);

        self.emit(
            X64Op::CallFrameDestroy,
            OpWidth::B64,
            vec![CgOperand::Imm(stack_bytes as i64)],
        );

        if is_void {
            return Ok(None);
        }
        let (_, width) = self.class_and_width(ret_ty)?;
        let dst = if ret_is_fp {
            let dst = self.new_fpr(width);
            self.emit(
                X64Op::Movs,
                width,
                vec![CgOperand::def(dst), CgOperand::use_(regs::XMM0)],
            );
            dst
        } else {
            let dst = self.new_gpr(width);
            self.emit(
                X64Op::Mov,
                width,
                vec![CgOperand::def(dst), CgOperand::use_(regs::RAX)],
            );
            dst
        };
        Ok(Some(dst))
    }
}

enum CallTarget {
    Direct(u32),
    Indirect(CgReg),
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_mir::types::TypeInterner;

    fn new_func(ctx: &mut CompileContext, ret: TypeId) -> MirFunction {
        let instance_ptr = ctx.types.void_ptr();
        let ty = ctx.types.function(ret, vec![instance_ptr]);
        let mut func = MirFunction::new(0, ty);
        func.create_variable(instance_ptr);
        func
    }

    fn entry_ops(cg: &CgFunction) -> Vec<X64Op> {
        cg.layout()
            .iter()
            .flat_map(|&b| cg.block(b).insts.iter().map(|inst| inst.op))
            .collect()
    }

    fn imm_of(cg: &CgFunction, op: X64Op) -> Vec<i64> {
        cg.layout()
            .iter()
            .flat_map(|&b| cg.block(b).insts.iter())
            .filter(|inst| inst.op == op)
            .filter_map(|inst| {
                inst.operands.iter().find_map(|o| match o {
                    CgOperand::Imm(v) => Some(*v),
                    _ => None,
                })
            })
            .collect()
    }

    /// Subsequence check: `needles` appear in `haystack` in order.
    fn in_order(haystack: &[X64Op], needles: &[X64Op]) -> bool {
        let mut it = haystack.iter();
        needles.iter().all(|n| it.any(|h| h == n))
    }

    fn ret_unary(ctx: &mut CompileContext, op: UnaryOp, ty: TypeId, value: u64) -> CgFunction {
        let mut func = new_func(ctx, ty);
        let entry = func.create_block();
        func.append_block(entry);
        let c = ctx.consts.int(&ctx.types, ty, value);
        let cval = func.create_inst(entry, false, ty, InstKind::Const(c));
        let result = func.create_inst(entry, false, ty, InstKind::Unary { op, opnd: cval });
        func.create_inst(
            entry,
            true,
            ty,
            InstKind::Return {
                value: Some(result),
            },
        );
        lower_function(ctx, &func).unwrap()
    }

    #[test]
    fn test_clz32_sequence() {
        let mut ctx = CompileContext::new();
        let cg = ret_unary(&mut ctx, UnaryOp::Clz, TypeInterner::I32, 1);
        let ops = entry_ops(&cg);
        assert!(in_order(
            &ops,
            &[
                X64Op::Bsr,
                X64Op::MovImm,
                X64Op::Cmovcc(CondCode::E),
                X64Op::Xor,
            ]
        ));
        // sentinel 2*32-1 and the final xor with 31
        assert!(imm_of(&cg, X64Op::MovImm).contains(&63));
        assert!(imm_of(&cg, X64Op::Xor).contains(&31));
    }

    #[test]
    fn test_clz64_sentinels() {
        let mut ctx = CompileContext::new();
        let cg = ret_unary(&mut ctx, UnaryOp::Clz, TypeInterner::I64, 1);
        assert!(imm_of(&cg, X64Op::MovImm).contains(&127));
        assert!(imm_of(&cg, X64Op::Xor).contains(&63));
    }

    #[test]
    fn test_ctz_sequence() {
        let mut ctx = CompileContext::new();
        let cg = ret_unary(&mut ctx, UnaryOp::Ctz, TypeInterner::I32, 8);
        let ops = entry_ops(&cg);
        assert!(in_order(&ops, &[X64Op::Bsf, X64Op::MovImm, X64Op::Cmovcc(CondCode::E)]));
        // width sentinel for a zero input
        assert!(imm_of(&cg, X64Op::MovImm).contains(&32));
        assert!(!ops.contains(&X64Op::Bsr));
    }

    #[test]
    fn test_popcnt32_swar_constants() {
        let mut ctx = CompileContext::new();
        let cg = ret_unary(&mut ctx, UnaryOp::Popcnt, TypeInterner::I32, 0xffff_ffff);
        let ands = imm_of(&cg, X64Op::And);
        assert!(ands.contains(&0x55555555));
        assert!(ands.contains(&0x33333333));
        assert!(ands.contains(&0x0f0f0f0f));
        assert!(imm_of(&cg, X64Op::Imul).contains(&0x01010101));
        let shrs = imm_of(&cg, X64Op::Shr);
        assert!(shrs.contains(&1));
        assert!(shrs.contains(&2));
        assert!(shrs.contains(&4));
        assert!(shrs.contains(&24));
    }

    #[test]
    fn test_popcnt64_materializes_masks() {
        let mut ctx = CompileContext::new();
        let cg = ret_unary(&mut ctx, UnaryOp::Popcnt, TypeInterner::I64, 1);
        let movs = imm_of(&cg, X64Op::MovImm);
        assert!(movs.contains(&0x5555555555555555));
        assert!(movs.contains(&0x3333333333333333));
        assert!(movs.contains(&0x0f0f0f0f0f0f0f0f));
        assert!(movs.contains(&0x0101010101010101));
        assert!(imm_of(&cg, X64Op::Shr).contains(&56));
    }

    #[test]
    fn test_fused_compare_branch() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        let entry = func.create_block();
        func.append_block(entry);
        let then_block = func.create_block();
        let else_block = func.create_block();

        let ty = TypeInterner::I32;
        let a = ctx.consts.int(&ctx.types, ty, 1);
        let b = ctx.consts.int(&ctx.types, ty, 2);
        let lhs = func.create_inst(entry, false, ty, InstKind::Const(a));
        let rhs = func.create_inst(entry, false, ty, InstKind::Const(b));
        let cond = func.create_inst(
            entry,
            false,
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::ISlt,
                lhs,
                rhs,
            },
        );
        func.create_inst(
            entry,
            true,
            TypeInterner::VOID,
            InstKind::BrIf {
                cond,
                true_block: then_block,
                false_block: Some(else_block),
            },
        );
        for block in [then_block, else_block] {
            func.append_block(block);
            let zero = ctx.consts.int(&ctx.types, ty, 0);
            let z = func.create_inst(block, false, ty, InstKind::Const(zero));
            func.create_inst(block, true, ty, InstKind::Return { value: Some(z) });
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        // CMP feeds the branch directly; no SETCC/TEST materialization
        assert!(in_order(&ops, &[X64Op::Cmp, X64Op::Jcc(CondCode::L)]));
        assert!(!ops.iter().any(|op| matches!(op, X64Op::Setcc(_))));
    }

    #[test]
    fn test_fptosi_f32_to_i32_bounds() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        func.get_or_create_exception_set_block(TrapCode::InvalidConversionToInteger);
        func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let entry = func.create_block();
        func.append_block(entry);
        let c = ctx.consts.f32(1.5);
        let src = func.create_inst(entry, false, TypeInterner::F32, InstKind::Const(c));
        let conv = func.create_inst(
            entry,
            false,
            TypeInterner::I32,
            InstKind::Conv {
                op: ConvOp::WasmFpToSi,
                opnd: src,
            },
        );
        func.create_inst(
            entry,
            true,
            TypeInterner::I32,
            InstKind::Return { value: Some(conv) },
        );
        for (_, &block) in func.exception_set_blocks().clone().iter() {
            func.append_block(block);
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        assert!(in_order(
            &ops,
            &[
                X64Op::Cvttf2i { to64: false },
                X64Op::Cmp,
                X64Op::Jcc(CondCode::No),
                X64Op::Ucomis,
                X64Op::Jcc(CondCode::P),
                X64Op::Ucomis,
                X64Op::Jcc(CondCode::Ne),
            ]
        ));
        assert!(imm_of(&cg, X64Op::MovImm).contains(&(MIN_F32_FIT_I32 as i64)));
    }

    #[test]
    fn test_fptosi_f64_to_i32_uses_be_and_zero_check() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        func.get_or_create_exception_set_block(TrapCode::InvalidConversionToInteger);
        func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let entry = func.create_block();
        func.append_block(entry);
        let c = ctx.consts.f64(-1.9);
        let src = func.create_inst(entry, false, TypeInterner::F64, InstKind::Const(c));
        let conv = func.create_inst(
            entry,
            false,
            TypeInterner::I32,
            InstKind::Conv {
                op: ConvOp::WasmFpToSi,
                opnd: src,
            },
        );
        func.create_inst(
            entry,
            true,
            TypeInterner::I32,
            InstKind::Return { value: Some(conv) },
        );
        for (_, &block) in func.exception_set_blocks().clone().iter() {
            func.append_block(block);
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        assert!(in_order(
            &ops,
            &[
                X64Op::Cvttf2i { to64: false },
                X64Op::Jcc(CondCode::No),
                X64Op::Jcc(CondCode::P),
                X64Op::Jcc(CondCode::Be),
                X64Op::Jcc(CondCode::A),
            ]
        ));
        assert!(imm_of(&cg, X64Op::MovImm).contains(&(MAX_F64_FIT_I32 as i64)));
    }

    #[test]
    fn test_fptoui64_bound_constants() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I64);
        func.get_or_create_exception_set_block(TrapCode::InvalidConversionToInteger);
        func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let entry = func.create_block();
        func.append_block(entry);
        let c = ctx.consts.f64(2.0);
        let src = func.create_inst(entry, false, TypeInterner::F64, InstKind::Const(c));
        let conv = func.create_inst(
            entry,
            false,
            TypeInterner::I64,
            InstKind::Conv {
                op: ConvOp::WasmFpToUi,
                opnd: src,
            },
        );
        func.create_inst(
            entry,
            true,
            TypeInterner::I64,
            InstKind::Return { value: Some(conv) },
        );
        for (_, &block) in func.exception_set_blocks().clone().iter() {
            func.append_block(block);
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let movs = imm_of(&cg, X64Op::MovImm);
        assert!(movs.contains(&(MIN_F64_NOT_FIT_I64 as i64)));
        assert!(movs.contains(&i64::MIN));
        let ops = entry_ops(&cg);
        assert!(in_order(
            &ops,
            &[
                X64Op::Ucomis,
                X64Op::Jcc(CondCode::Ae),
                X64Op::Jcc(CondCode::P),
                X64Op::Cvttf2i { to64: true },
                X64Op::Jcc(CondCode::Ge),
                X64Op::Subs,
                X64Op::Jcc(CondCode::L),
                X64Op::Add,
            ]
        ));
    }

    #[test]
    fn test_memory_check_lowering() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        func.get_or_create_exception_set_block(TrapCode::OutOfBoundsMemory);
        let size_var = func.create_variable(TypeInterner::I32);
        let entry = func.create_block();
        func.append_block(entry);
        let addr_c = ctx.consts.int(&ctx.types, TypeInterner::I32, 100);
        let addr = func.create_inst(entry, false, TypeInterner::I32, InstKind::Const(addr_c));
        let boundary = func.create_inst(entry, false, TypeInterner::I32, InstKind::Dread(size_var));
        func.create_inst(
            entry,
            true,
            TypeInterner::VOID,
            InstKind::WasmCheckMemoryAccess {
                base: Some(addr),
                boundary,
                offset: 12,
            },
        );
        let zero = ctx.consts.int(&ctx.types, TypeInterner::I32, 0);
        let z = func.create_inst(entry, false, TypeInterner::I32, InstKind::Const(zero));
        func.create_inst(entry, true, TypeInterner::I32, InstKind::Return { value: Some(z) });
        for (_, &block) in func.exception_set_blocks().clone().iter() {
            func.append_block(block);
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        assert!(in_order(
            &ops,
            &[X64Op::Add, X64Op::Cmp, X64Op::Jcc(CondCode::A)]
        ));
        assert!(imm_of(&cg, X64Op::MovImm).contains(&12));
    }

    #[test]
    fn test_overflow_add_branches_on_of() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let entry = func.create_block();
        func.append_block(entry);
        let ty = TypeInterner::I32;
        let a = ctx.consts.int(&ctx.types, ty, i32::MAX as u64);
        let b = ctx.consts.int(&ctx.types, ty, 1);
        let lhs = func.create_inst(entry, false, ty, InstKind::Const(a));
        let rhs = func.create_inst(entry, false, ty, InstKind::Const(b));
        let sum = func.create_inst(
            entry,
            false,
            ty,
            InstKind::Overflow {
                op: OverflowOp::SaddOverflow,
                lhs,
                rhs,
            },
        );
        func.create_inst(entry, true, ty, InstKind::Return { value: Some(sum) });
        for (_, &block) in func.exception_set_blocks().clone().iter() {
            func.append_block(block);
        }

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        assert!(in_order(&ops, &[X64Op::Add, X64Op::Jcc(CondCode::O)]));
    }

    #[test]
    fn test_division_uses_rdx_rax() {
        let mut ctx = CompileContext::new();
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        let entry = func.create_block();
        func.append_block(entry);
        let ty = TypeInterner::I32;
        let a = ctx.consts.int(&ctx.types, ty, 7);
        let b = ctx.consts.int(&ctx.types, ty, 2);
        let lhs = func.create_inst(entry, false, ty, InstKind::Const(a));
        let rhs = func.create_inst(entry, false, ty, InstKind::Const(b));
        let quot = func.create_inst(
            entry,
            false,
            ty,
            InstKind::Binary {
                op: BinaryOp::DivS,
                lhs,
                rhs,
            },
        );
        func.create_inst(entry, true, ty, InstKind::Return { value: Some(quot) });

        let cg = lower_function(&ctx, &func).unwrap();
        let ops = entry_ops(&cg);
        assert!(in_order(&ops, &[X64Op::Cdq, X64Op::Idiv]));
    }

    #[test]
    fn test_call_marshals_into_abi_registers() {
        let mut ctx = CompileContext::new();
        let instance_ptr = ctx.types.void_ptr();
        let callee_ty = ctx.types.function(TypeInterner::I32, vec![instance_ptr, TypeInterner::I32]);
        let _ = callee_ty;
        let mut func = new_func(&mut ctx, TypeInterner::I32);
        let entry = func.create_block();
        func.append_block(entry);
        let inst_ptr = func.create_inst(entry, false, instance_ptr, InstKind::Dread(0));
        let c = ctx.consts.int(&ctx.types, TypeInterner::I32, 5);
        let arg = func.create_inst(entry, false, TypeInterner::I32, InstKind::Const(c));
        let call = func.create_inst(
            entry,
            false,
            TypeInterner::I32,
            InstKind::Call {
                callee: 1,
                args: vec![inst_ptr, arg],
            },
        );
        func.create_inst(
            entry,
            true,
            TypeInterner::I32,
            InstKind::Return { value: Some(call) },
        );

        let cg = lower_function(&ctx, &func).unwrap();
        let insts: Vec<&CgInst> = cg
            .layout()
            .iter()
            .flat_map(|&b| cg.block(b).insts.iter())
            .collect();
        // instance pointer into RDI, the i32 into ESI, result out of RAX
        let rdi_def = insts.iter().any(|inst| {
            inst.op == X64Op::Mov
                && matches!(inst.operands.first(), Some(CgOperand::Reg { reg, is_def: true }) if *reg == regs::RDI)
        });
        let rsi_def = insts.iter().any(|inst| {
            matches!(inst.operands.first(), Some(CgOperand::Reg { reg, is_def: true }) if *reg == regs::RSI)
        });
        assert!(rdi_def && rsi_def);
        let call_inst = insts.iter().find(|inst| inst.op == X64Op::Call).unwrap();
        assert!(matches!(call_inst.operands[0], CgOperand::Reg { reg, is_def: true } if reg == regs::RAX));
        assert!(matches!(call_inst.operands[1], CgOperand::Func(1)));
    }
}
