//! wasm → MIR frontend
//!
//! `FunctionBuilder` consumes already-decoded opcode events from the
//! runtime's bytecode visitor and emits MIR for one function. It manages
//! the control stack, materializes exception-set blocks on demand, keeps
//! cached memory base/size coherent across calls, and finalizes with the
//! set-block → handler → exception-return plumbing.

use kiln_mir::arena::{BlockId, InstId, TypeId};
use kiln_mir::function::VarIdx;
use kiln_mir::instr::{BinaryOp, CmpPredicate, ConvOp, InstKind, OverflowI128Op, OverflowOp, UnaryOp};
use kiln_mir::types::TypeInterner;
use kiln_mir::{CompileContext, MirFunction, TrapCode};

use crate::config::{CompileConfig, StackCheckMode};
use crate::layout::INSTANCE_GLOBAL_VAR_DATA_OFFSET;
use crate::module::{WasmModule, WasmType};
use crate::EngineError;

type Result<T> = std::result::Result<T, EngineError>;

/// A value on the frontend's operand stack: either an expression tree or a
/// variable slot, together with its wasm type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Operand {
    inst: Option<InstId>,
    var: Option<VarIdx>,
    ty: Option<WasmType>,
}

impl Operand {
    pub fn from_inst(inst: InstId, ty: WasmType) -> Self {
        Operand {
            inst: Some(inst),
            var: None,
            ty: Some(ty),
        }
    }

    pub fn from_var(var: VarIdx, ty: WasmType) -> Self {
        Operand {
            inst: None,
            var: Some(var),
            ty: Some(ty),
        }
    }

    pub fn empty() -> Self {
        Operand::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inst.is_none() && self.var.is_none()
    }

    pub fn ty(&self) -> WasmType {
        self.ty.unwrap_or(WasmType::Void)
    }

    pub fn var(&self) -> Option<VarIdx> {
        self.var
    }
}

/// Kind of an entry on the control stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlBlockKind {
    FuncEntry,
    Block,
    Loop,
    If,
}

/// One nested control block.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    kind: CtrlBlockKind,
    result: Operand,
    /// Operand-stack height at entry (owned by the visitor; echoed back on
    /// branches for unwinding).
    stack_size: u32,
    /// Where a `br` targeting this entry lands: the continuation for blocks
    /// and ifs, the header for loops, the return block for the function.
    jump_block: BlockId,
    /// Patched by `else`: the false edge of the if's branch.
    next_block: Option<BlockId>,
    /// The `br_if` emitted for an `if`, so `else`/`end` can patch it.
    branch_inst: Option<InstId>,
    branch_block: Option<BlockId>,
    reachable: bool,
}

impl BlockInfo {
    pub fn kind(&self) -> CtrlBlockKind {
        self.kind
    }

    pub fn result(&self) -> Operand {
        self.result
    }

    pub fn ty(&self) -> WasmType {
        self.result.ty()
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn jump_block(&self) -> BlockId {
        self.jump_block
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }
}

/// Builds MIR for one function from decoded opcode events.
pub struct FunctionBuilder<'a> {
    ctx: &'a mut CompileContext,
    module: &'a WasmModule,
    config: &'a CompileConfig,
    func: MirFunction,
    internal_idx: u32,
    cur_block: BlockId,
    control_stack: Vec<BlockInfo>,
    instance_addr: Option<InstId>,
    exception_return_block: BlockId,
    use_exception_return_after_call: bool,
    memory_base_var: Option<VarIdx>,
    memory_size_var: Option<VarIdx>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(
        ctx: &'a mut CompileContext,
        module: &'a WasmModule,
        config: &'a CompileConfig,
        internal_idx: u32,
    ) -> Result<Self> {
        if internal_idx >= module.num_internal_functions() {
            return Err(EngineError::UnexpectedFuncIdx(internal_idx));
        }
        let func_type = module.internal_func_type(internal_idx);
        let mut params = Vec::with_capacity(func_type.params.len() + 1);
        let instance_ptr = ctx.types.void_ptr();
        params.push(instance_ptr);
        for &param in &func_type.params {
            params.push(param.mir_type());
        }
        let ret = func_type.ret.mir_type();
        let mir_ty = ctx.types.function(ret, params.clone());

        let mut func = MirFunction::new(internal_idx, mir_ty);
        for ty in params {
            func.create_variable(ty);
        }

        Ok(FunctionBuilder {
            ctx,
            module,
            config,
            func,
            internal_idx,
            cur_block: BlockId(0),
            control_stack: Vec::new(),
            instance_addr: None,
            exception_return_block: BlockId(0),
            use_exception_return_after_call: false,
            memory_base_var: None,
            memory_size_var: None,
        })
    }

    /// Entry block, zero-initialized locals, the function-entry control
    /// frame, and the per-function instance plumbing (stack check, cached
    /// memory attributes).
    pub fn init_function(&mut self) -> Result<()> {
        let entry = self.func.create_block();
        self.func.append_block(entry);
        self.cur_block = entry;

        let locals = self.module.functions[self.internal_idx as usize]
            .locals
            .clone();
        for local_ty in locals {
            let mir_ty = local_ty.mir_type();
            let var = self.func.create_variable(mir_ty);
            let zero = match local_ty {
                WasmType::I32 | WasmType::I64 | WasmType::I8 | WasmType::I16 => {
                    self.int_const(mir_ty, 0)
                }
                WasmType::F32 => {
                    let constant = self.ctx.consts.f32(0.0);
                    self.expr(mir_ty, InstKind::Const(constant))
                }
                WasmType::F64 => {
                    let constant = self.ctx.consts.f64(0.0);
                    self.expr(mir_ty, InstKind::Const(constant))
                }
                WasmType::Void => return Err(EngineError::UnexpectedType(kiln_mir::Phase::MirEmission)),
            };
            self.dassign(zero, var);
        }

        let ret_ty = self.module.internal_func_type(self.internal_idx).ret;
        let return_block = self.func.create_block();
        self.enter_block(CtrlBlockKind::FuncEntry, ret_ty, 0, return_block, None, None);

        self.load_instance_attrs();
        Ok(())
    }

    fn load_instance_attrs(&mut self) {
        let void_ptr_ty = self.ctx.types.void_ptr();
        let instance_read = self.instance_ptr_expr(void_ptr_ty);
        let addr = self.expr(
            TypeInterner::I64,
            InstKind::Conv {
                op: ConvOp::PtrToInt,
                opnd: instance_read,
            },
        );
        self.instance_addr = Some(addr);

        self.exception_return_block = self.func.create_exception_return_block();

        let layout = self.module.layout;
        match self.config.stack_check {
            StackCheckMode::SoftCounted { limit } => {
                let exhausted = self
                    .func
                    .get_or_create_exception_set_block(TrapCode::CallStackExhausted);
                let cost = self.get_instance_element(TypeInterner::I32, layout.stack_cost_offset);
                let own_cost = self.module.functions[self.internal_idx as usize].stack_cost;
                let own = self.int_const(TypeInterner::I32, own_cost as u64);
                let new_cost = self.expr(
                    TypeInterner::I32,
                    InstKind::Binary {
                        op: BinaryOp::Add,
                        lhs: cost,
                        rhs: own,
                    },
                );
                let reusable = self.make_reusable(new_cost, TypeInterner::I32);
                self.set_instance_element(reusable, layout.stack_cost_offset);
                let limit = self.int_const(TypeInterner::I32, limit as u64);
                let is_exhausted = self.expr(
                    TypeInterner::I8,
                    InstKind::Cmp {
                        pred: CmpPredicate::IUgt,
                        lhs: reusable,
                        rhs: limit,
                    },
                );
                self.br_if_to(is_exhausted, exhausted);
            }
            StackCheckMode::GuardPage => {
                self.stmt(InstKind::WasmVisitStackGuard);
            }
            StackCheckMode::Boundary => {
                let exhausted = self
                    .func
                    .get_or_create_exception_set_block(TrapCode::CallStackExhausted);
                let boundary =
                    self.get_instance_element(TypeInterner::I64, layout.stack_boundary_offset);
                self.stmt(InstKind::WasmCheckStackBoundary { boundary });
                self.func.add_unique_successor(self.cur_block, exhausted);
            }
        }

        if self.config.cache_memory && self.module.has_memory {
            let base_var = self.func.create_variable(TypeInterner::I64);
            self.memory_base_var = Some(base_var);
            let base = self.get_instance_element(TypeInterner::I64, layout.memory_base_offset);
            self.dassign(base, base_var);

            if self.config.use_soft_mem_check {
                let size_var = self.func.create_variable(TypeInterner::I32);
                self.memory_size_var = Some(size_var);
                let size = self.get_instance_element(TypeInterner::I32, layout.memory_size_offset);
                self.dassign(size, size_var);
            }
        }
    }

    // ==================== Block and operand methods ====================

    /// Assign `rhs` to the variable operand `lhs`.
    pub fn make_assignment(&mut self, lhs: &Operand, rhs: &Operand) {
        if lhs.is_empty() || rhs.is_empty() {
            return;
        }
        let value = self.extract_operand(rhs);
        let var = lhs.var.expect("assignment target must be a variable");
        self.dassign(value, var);
    }

    pub fn block_info(&self, level: u32) -> &BlockInfo {
        let depth = self.control_stack.len() - 1 - level as usize;
        &self.control_stack[depth]
    }

    pub fn current_block_info(&mut self) -> &mut BlockInfo {
        self.control_stack.last_mut().expect("empty control stack")
    }

    pub fn control_depth(&self) -> u32 {
        self.control_stack.len() as u32
    }

    // ==================== Control instruction handlers ====================

    pub fn handle_unreachable(&mut self) {
        let target = self
            .func
            .get_or_create_exception_set_block(TrapCode::Unreachable);
        self.br_to(target);
        self.current_block_info().reachable = false;
    }

    pub fn handle_block(&mut self, ty: WasmType, stack_size: u32) {
        let jump_block = self.func.create_block();
        self.enter_block(CtrlBlockKind::Block, ty, stack_size, jump_block, None, None);
    }

    pub fn handle_loop(&mut self, ty: WasmType, stack_size: u32) {
        let header = self.func.create_block();
        self.br_to(header);
        self.set_insert_block(header);
        self.enter_block(CtrlBlockKind::Loop, ty, stack_size, header, None, None);
    }

    pub fn handle_if(&mut self, cond: Operand, ty: WasmType, stack_size: u32) {
        let then_block = self.func.create_block();
        let merge_block = self.func.create_block();
        let cond_inst = self.extract_operand(&cond);
        let branch_block = self.cur_block;
        let branch = self.stmt(InstKind::BrIf {
            cond: cond_inst,
            true_block: then_block,
            false_block: None,
        });
        self.func.add_successor(branch_block, then_block);
        self.enter_block(
            CtrlBlockKind::If,
            ty,
            stack_size,
            merge_block,
            Some(branch),
            Some(branch_block),
        );
        self.set_insert_block(then_block);
    }

    pub fn handle_else(&mut self) {
        let info = self.control_stack.last().cloned().expect("else outside if");
        debug_assert_eq!(info.kind, CtrlBlockKind::If);
        if info.reachable {
            self.br_to(info.jump_block);
        }

        let else_block = self.func.create_block();
        let branch = info.branch_inst.expect("if without branch");
        if let InstKind::BrIf { false_block, .. } = &mut self.func.inst_mut(branch).kind {
            *false_block = Some(else_block);
        }
        self.func
            .add_successor(info.branch_block.expect("if without branch block"), else_block);
        let top = self.control_stack.last_mut().unwrap();
        top.next_block = Some(else_block);
        top.reachable = true;
        self.set_insert_block(else_block);
    }

    /// Pop the current control frame; the visitor has already assigned the
    /// block result. Returns the result operand to push, if any.
    pub fn handle_end(&mut self) -> Operand {
        let info = self.control_stack.pop().expect("end with empty control stack");
        match info.kind {
            CtrlBlockKind::FuncEntry => {
                if info.reachable {
                    self.br_to(info.jump_block);
                }
                self.set_insert_block(info.jump_block);
                let result = if info.result.is_empty() {
                    None
                } else {
                    Some(self.extract_operand(&info.result))
                };
                let ret_ty = info
                    .result
                    .ty
                    .map_or(TypeInterner::VOID, WasmType::mir_type);
                self.func
                    .create_inst(self.cur_block, true, ret_ty, InstKind::Return { value: result });
                info.result
            }
            CtrlBlockKind::Block => {
                if info.reachable {
                    self.br_to(info.jump_block);
                }
                self.set_insert_block(info.jump_block);
                info.result
            }
            CtrlBlockKind::Loop => {
                // falling off a loop continues forward in a fresh block
                let continuation = self.func.create_block();
                if info.reachable {
                    self.br_to(continuation);
                }
                self.set_insert_block(continuation);
                info.result
            }
            CtrlBlockKind::If => {
                if info.reachable {
                    self.br_to(info.jump_block);
                }
                if info.next_block.is_none() {
                    // no else arm: the false edge falls through to the merge
                    let branch = info.branch_inst.expect("if without branch");
                    if let InstKind::BrIf { false_block, .. } =
                        &mut self.func.inst_mut(branch).kind
                    {
                        *false_block = Some(info.jump_block);
                    }
                    self.func.add_unique_successor(
                        info.branch_block.expect("if without branch block"),
                        info.jump_block,
                    );
                }
                self.set_insert_block(info.jump_block);
                info.result
            }
        }
    }

    /// `br level`; the visitor assigns the target's result beforehand.
    pub fn handle_branch(&mut self, level: u32) {
        let target = self.block_info(level).jump_block;
        self.br_to(target);
        self.current_block_info().reachable = false;
    }

    /// `br_if level`; the fallthrough continues in the current block.
    pub fn handle_branch_if(&mut self, cond: Operand, level: u32) {
        let target = self.block_info(level).jump_block;
        let cond_inst = self.extract_operand(&cond);
        self.br_if_to(cond_inst, target);
    }

    /// `br_table`: a switch over deduplicated levels, each through a
    /// trampoline that moves the stack-top result into the level's slot.
    pub fn handle_branch_table(&mut self, index: Operand, stack_top: Operand, table: &[u32], default: u32) {
        let index_inst = self.extract_operand(&index);

        let mut unique_levels: Vec<u32> = Vec::new();
        for &level in table.iter().chain(std::iter::once(&default)) {
            if !unique_levels.contains(&level) {
                unique_levels.push(level);
            }
        }

        // trampolines first, so the switch can reference them
        let mut trampolines: Vec<(u32, BlockId)> = Vec::new();
        for &level in &unique_levels {
            let block = self.func.create_block();
            trampolines.push((level, block));
        }
        let trampoline_of = |level: u32, list: &[(u32, BlockId)]| {
            list.iter().find(|(l, _)| *l == level).map(|(_, b)| *b).unwrap()
        };

        let default_block = trampoline_of(default, &trampolines);
        let mut cases = Vec::with_capacity(table.len());
        for (i, &level) in table.iter().enumerate() {
            let value = self.int_const(TypeInterner::I32, i as u64);
            cases.push((value, trampoline_of(level, &trampolines)));
        }

        let switch_block = self.cur_block;
        self.stmt(InstKind::Switch {
            cond: index_inst,
            default: default_block,
            cases,
        });
        for &(_, block) in &trampolines {
            self.func.add_unique_successor(switch_block, block);
        }

        for (level, block) in trampolines {
            self.set_insert_block(block);
            let info = self.block_info(level).clone();
            if !info.result.is_empty() && !stack_top.is_empty() {
                let result = info.result;
                self.make_assignment(&result, &stack_top);
            }
            let target = info.jump_block;
            self.br_to(target);
        }
        self.current_block_info().reachable = false;
    }

    pub fn handle_return(&mut self, value: Operand) {
        let (inst, ty) = if value.is_empty() {
            (None, TypeInterner::VOID)
        } else {
            (Some(self.extract_operand(&value)), value.ty().mir_type())
        };
        self.func
            .create_inst(self.cur_block, true, ty, InstKind::Return { value: inst });
        self.current_block_info().reachable = false;
    }

    /// Direct call by global function index; imports become indirect calls
    /// through their host trampoline address.
    pub fn handle_call(&mut self, func_idx: u32, args: &[Operand]) -> Result<Operand> {
        let num_imports = self.module.num_import_functions();
        let is_import = func_idx < num_imports;
        let ret = self.module.func_type(func_idx).ret;
        let mir_args = self.call_args(args);

        let ret_mir = ret.mir_type();
        let is_stmt = ret == WasmType::Void;
        let call = if is_import {
            let target_addr = self.module.imports[func_idx as usize].call_target;
            let target = self.int_const(TypeInterner::I64, target_addr);
            self.func.create_inst(
                self.cur_block,
                is_stmt,
                ret_mir,
                InstKind::ICall {
                    callee: target,
                    args: mir_args,
                },
            )
        } else {
            self.func.create_inst(
                self.cur_block,
                is_stmt,
                ret_mir,
                InstKind::Call {
                    callee: func_idx - num_imports,
                    args: mir_args,
                },
            )
        };

        let result_var = if is_stmt {
            None
        } else {
            let var = self.func.create_variable(ret_mir);
            self.dassign(call, var);
            Some(var)
        };

        self.check_call_exception(is_import);
        self.update_memory_base_and_size();

        Ok(match result_var {
            None => Operand::empty(),
            Some(var) => Operand::from_var(var, ret),
        })
    }

    /// `call_indirect`: verify index bounds, slot initialization, and type
    /// identity before loading the function pointer.
    pub fn handle_call_indirect(
        &mut self,
        type_idx: u32,
        index: Operand,
        args: &[Operand],
    ) -> Result<Operand> {
        let layout = self.module.layout;
        let index_inst = {
            let raw = self.extract_operand(&index);
            self.make_reusable(raw, TypeInterner::I32)
        };

        // index < table size
        let undefined = self
            .func
            .get_or_create_exception_set_block(TrapCode::UndefinedElement);
        let table_size = self.get_instance_element(TypeInterner::I32, layout.table_elem_size_offset);
        let oob = self.expr(
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::IUge,
                lhs: index_inst,
                rhs: table_size,
            },
        );
        self.br_if_to(oob, undefined);

        // table slot != -1
        let uninitialized = self
            .func
            .get_or_create_exception_set_block(TrapCode::UninitializedElement);
        let elem_base = self.get_instance_element(TypeInterner::I64, layout.table_elem_base_offset);
        let elem = self.load_indexed(TypeInterner::I32, elem_base, index_inst, 4);
        let elem = self.make_reusable(elem, TypeInterner::I32);
        let neg_one = self.int_const(TypeInterner::I32, u32::MAX as u64);
        let is_uninit = self.expr(
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::IEq,
                lhs: elem,
                rhs: neg_one,
            },
        );
        self.br_if_to(is_uninit, uninitialized);

        // declared type index == expected
        let mismatch = self
            .func
            .get_or_create_exception_set_block(TrapCode::IndirectCallTypeMismatch);
        let types_base =
            self.get_instance_element(TypeInterner::I64, layout.func_type_indexes_base_offset);
        let actual = self.load_indexed(TypeInterner::I32, types_base, elem, 4);
        let expected = self.int_const(TypeInterner::I32, type_idx as u64);
        let differs = self.expr(
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::INe,
                lhs: actual,
                rhs: expected,
            },
        );
        self.br_if_to(differs, mismatch);

        // load the function pointer and call through it
        let ptrs_base = self.get_instance_element(TypeInterner::I64, layout.func_ptrs_base_offset);
        let func_ptr = self.load_indexed(TypeInterner::I64, ptrs_base, elem, 8);

        let ret = self.module.types[type_idx as usize].ret;
        let ret_mir = ret.mir_type();
        let is_stmt = ret == WasmType::Void;
        let mir_args = self.call_args(args);
        let call = self.func.create_inst(
            self.cur_block,
            is_stmt,
            ret_mir,
            InstKind::ICall {
                callee: func_ptr,
                args: mir_args,
            },
        );

        let result_var = if is_stmt {
            None
        } else {
            let var = self.func.create_variable(ret_mir);
            self.dassign(call, var);
            Some(var)
        };

        self.check_call_exception(true);
        self.update_memory_base_and_size();

        Ok(match result_var {
            None => Operand::empty(),
            Some(var) => Operand::from_var(var, ret),
        })
    }

    // ==================== Parametric handlers ====================

    pub fn handle_select(&mut self, cond: Operand, tval: Operand, fval: Operand) -> Operand {
        let ty = tval.ty();
        let cond_inst = self.extract_operand(&cond);
        let t = self.extract_operand(&tval);
        let f = self.extract_operand(&fval);
        let select = self.expr(
            ty.mir_type(),
            InstKind::Select {
                cond: cond_inst,
                tval: t,
                fval: f,
            },
        );
        Operand::from_inst(select, ty)
    }

    // ==================== Variable handlers ====================

    /// wasm local index → variable index (slot 0 is the instance pointer).
    pub fn handle_get_local(&mut self, local_idx: u32) -> Operand {
        let var = local_idx + 1;
        let ty = self.wasm_type_of_var(var);
        Operand::from_var(var, ty)
    }

    pub fn handle_set_local(&mut self, local_idx: u32, value: Operand) {
        let var = local_idx + 1;
        let inst = self.extract_operand(&value);
        self.dassign(inst, var);
    }

    /// `local.tee`: assign and keep the value on the stack as the variable.
    pub fn handle_tee_local(&mut self, local_idx: u32, value: Operand) -> Operand {
        let ty = value.ty();
        self.handle_set_local(local_idx, value);
        Operand::from_var(local_idx + 1, ty)
    }

    pub fn handle_get_global(&mut self, global_idx: u32) -> Operand {
        let global = self.module.globals[global_idx as usize];
        let offset = INSTANCE_GLOBAL_VAR_DATA_OFFSET + global.offset as u64;
        let load = self.get_instance_element(global.ty.mir_type(), offset);
        let safe = self.make_reusable(load, global.ty.mir_type());
        Operand::from_inst(safe, global.ty)
    }

    pub fn handle_set_global(&mut self, global_idx: u32, value: Operand) {
        let global = self.module.globals[global_idx as usize];
        let offset = INSTANCE_GLOBAL_VAR_DATA_OFFSET + global.offset as u64;
        let inst = self.extract_operand(&value);
        self.set_instance_element(inst, offset);
    }

    // ==================== Memory handlers ====================

    /// Load `src_ty` from memory and extend to `dest_ty`.
    pub fn handle_load(
        &mut self,
        dest_ty: WasmType,
        src_ty: WasmType,
        sext: bool,
        base: Operand,
        offset: u32,
    ) -> Operand {
        let base_inst = self.extract_operand(&base);
        let access_bytes = wasm_type_bytes(src_ty);
        let (ptr, index, disp) = self.memory_location(base_inst, offset, access_bytes, src_ty);
        let load = self.expr(
            dest_ty.mir_type(),
            InstKind::Load {
                src_ty: src_ty.mir_type(),
                base: Some(ptr),
                index,
                scale: 1,
                offset: disp,
                sext,
            },
        );
        let safe = self.make_reusable(load, dest_ty.mir_type());
        Operand::from_inst(safe, dest_ty)
    }

    /// Store `value` as `dest_ty`, truncating a wider stack value first.
    pub fn handle_store(&mut self, dest_ty: WasmType, value: Operand, base: Operand, offset: u32) {
        let mut value_inst = self.extract_operand(&value);
        if value.ty() > dest_ty && value.ty().is_integer() {
            value_inst = self.expr(
                dest_ty.mir_type(),
                InstKind::Conv {
                    op: ConvOp::Trunc,
                    opnd: value_inst,
                },
            );
        }
        let base_inst = self.extract_operand(&base);
        let access_bytes = wasm_type_bytes(dest_ty);
        let (ptr, index, disp) = self.memory_location(base_inst, offset, access_bytes, dest_ty);
        self.stmt(InstKind::Store {
            value: value_inst,
            base: ptr,
            index,
            scale: 1,
            offset: disp,
        });
    }

    pub fn handle_memory_size(&mut self) -> Operand {
        let pages =
            self.get_instance_element(TypeInterner::I32, self.module.layout.memory_pages_offset);
        let safe = self.make_reusable(pages, TypeInterner::I32);
        Operand::from_inst(safe, WasmType::I32)
    }

    /// `memory.grow` calls the host, then rereads the cached base and size.
    pub fn handle_memory_grow(&mut self, delta: Operand) -> Operand {
        let target = self.int_const(TypeInterner::I64, self.module.callbacks.grow_memory);
        let instance = self.instance_addr.expect("builder not initialized");
        let delta_inst = self.extract_operand(&delta);
        let call = self.expr(
            TypeInterner::I32,
            InstKind::ICall {
                callee: target,
                args: vec![instance, delta_inst],
            },
        );
        let var = self.func.create_variable(TypeInterner::I32);
        self.dassign(call, var);

        self.update_memory_base_and_size();
        Operand::from_var(var, WasmType::I32)
    }

    // ==================== Numeric handlers ====================

    pub fn handle_const_i32(&mut self, value: i32) -> Operand {
        let inst = self.int_const(TypeInterner::I32, value as u32 as u64);
        Operand::from_inst(inst, WasmType::I32)
    }

    pub fn handle_const_i64(&mut self, value: i64) -> Operand {
        let inst = self.int_const(TypeInterner::I64, value as u64);
        Operand::from_inst(inst, WasmType::I64)
    }

    pub fn handle_const_f32(&mut self, value: f32) -> Operand {
        let constant = self.ctx.consts.f32(value);
        let inst = self.expr(TypeInterner::F32, InstKind::Const(constant));
        Operand::from_inst(inst, WasmType::F32)
    }

    pub fn handle_const_f64(&mut self, value: f64) -> Operand {
        let constant = self.ctx.consts.f64(value);
        let inst = self.expr(TypeInterner::F64, InstKind::Const(constant));
        Operand::from_inst(inst, WasmType::F64)
    }

    /// A wasm comparison producing an i32.
    pub fn handle_compare(&mut self, pred: CmpPredicate, lhs: Operand, rhs: Operand) -> Operand {
        let inst = self.compare_impl(pred, lhs, rhs, TypeInterner::I32);
        Operand::from_inst(inst, WasmType::I32)
    }

    /// `eqz`: compare against zero of the operand's type.
    pub fn handle_eqz(&mut self, opnd: Operand) -> Operand {
        let ty = opnd.ty();
        let lhs = self.extract_operand(&opnd);
        let zero = self.int_const(ty.mir_type(), 0);
        let cmp = self.expr(
            TypeInterner::I32,
            InstKind::Cmp {
                pred: CmpPredicate::IEq,
                lhs,
                rhs: zero,
            },
        );
        Operand::from_inst(cmp, WasmType::I32)
    }

    /// Fused compare + `if`.
    pub fn handle_fused_compare_if(
        &mut self,
        pred: CmpPredicate,
        lhs: Operand,
        rhs: Operand,
        ty: WasmType,
        stack_size: u32,
    ) {
        let cond = self.compare_impl(pred, lhs, rhs, TypeInterner::I8);
        self.handle_if(Operand::from_inst(cond, WasmType::I8), ty, stack_size);
    }

    /// Fused compare + `br_if`.
    pub fn handle_fused_compare_branch_if(
        &mut self,
        pred: CmpPredicate,
        lhs: Operand,
        rhs: Operand,
        level: u32,
    ) {
        let cond = self.compare_impl(pred, lhs, rhs, TypeInterner::I8);
        self.handle_branch_if(Operand::from_inst(cond, WasmType::I8), level);
    }

    /// Fused compare + `select`.
    pub fn handle_fused_compare_select(
        &mut self,
        pred: CmpPredicate,
        cmp_lhs: Operand,
        cmp_rhs: Operand,
        sel_tval: Operand,
        sel_fval: Operand,
    ) -> Operand {
        let cond = self.compare_impl(pred, cmp_lhs, cmp_rhs, TypeInterner::I8);
        self.handle_select(Operand::from_inst(cond, WasmType::I8), sel_tval, sel_fval)
    }

    pub fn handle_unary(&mut self, ty: WasmType, op: UnaryOp, opnd: Operand) -> Operand {
        let inst = self.extract_operand(&opnd);
        let result = self.expr(ty.mir_type(), InstKind::Unary { op, opnd: inst });
        Operand::from_inst(result, ty)
    }

    pub fn handle_binary(&mut self, ty: WasmType, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        let lhs_inst = self.extract_operand(&lhs);
        let rhs_inst = self.extract_operand(&rhs);
        let result = self.expr(
            ty.mir_type(),
            InstKind::Binary {
                op,
                lhs: lhs_inst,
                rhs: rhs_inst,
            },
        );
        Operand::from_inst(result, ty)
    }

    /// Shifts and rotates; the lowering masks counts via the hardware
    /// behavior, so this is plain binary emission.
    pub fn handle_shift(&mut self, ty: WasmType, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        self.handle_binary(ty, op, lhs, rhs)
    }

    /// Integer division and remainder with the required checks: a zero
    /// check in software mode, the INT_MIN/-1 overflow trap for signed
    /// division, and the -1 special case returning 0 for signed remainder.
    pub fn handle_idiv(&mut self, ty: WasmType, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        let mir_ty = ty.mir_type();
        let lhs_inst = {
            let raw = self.extract_operand(&lhs);
            self.make_reusable(raw, mir_ty)
        };
        let rhs_inst = {
            let raw = self.extract_operand(&rhs);
            self.make_reusable(raw, mir_ty)
        };

        if !self.config.cpu_exceptions {
            // hardware raises SIGFPE for division by zero otherwise
            let div_by_zero = self
                .func
                .get_or_create_exception_set_block(TrapCode::IntegerDivByZero);
            let zero = self.int_const(mir_ty, 0);
            let is_zero = self.expr(
                TypeInterner::I8,
                InstKind::Cmp {
                    pred: CmpPredicate::IEq,
                    lhs: rhs_inst,
                    rhs: zero,
                },
            );
            self.br_if_to(is_zero, div_by_zero);
        }

        let result_var = self.func.create_variable(mir_ty);
        let mut exit_block = None;

        if op == BinaryOp::DivS || op == BinaryOp::RemS {
            let int_min = if ty == WasmType::I32 {
                i32::MIN as u32 as u64
            } else {
                i64::MIN as u64
            };
            let min_const = self.int_const(mir_ty, int_min);
            let lhs_not_min = self.expr(
                TypeInterner::I8,
                InstKind::Cmp {
                    pred: CmpPredicate::INe,
                    lhs: lhs_inst,
                    rhs: min_const,
                },
            );
            let normal = self.func.create_block();
            self.br_if_to(lhs_not_min, normal);

            let neg_one = if ty == WasmType::I32 {
                u32::MAX as u64
            } else {
                u64::MAX
            };
            let neg_one_const = self.int_const(mir_ty, neg_one);
            let rhs_is_neg_one = self.expr(
                TypeInterner::I8,
                InstKind::Cmp {
                    pred: CmpPredicate::IEq,
                    lhs: rhs_inst,
                    rhs: neg_one_const,
                },
            );
            if op == BinaryOp::DivS {
                let overflow = self
                    .func
                    .get_or_create_exception_set_block(TrapCode::IntegerOverflow);
                let branch_block = self.cur_block;
                self.stmt(InstKind::BrIf {
                    cond: rhs_is_neg_one,
                    true_block: overflow,
                    false_block: Some(normal),
                });
                self.func.add_unique_successor(branch_block, overflow);
            } else {
                // INT_MIN % -1 is 0, without trapping
                let zero = self.int_const(mir_ty, 0);
                self.dassign(zero, result_var);
                let exit = self.func.create_block();
                let branch_block = self.cur_block;
                self.stmt(InstKind::BrIf {
                    cond: rhs_is_neg_one,
                    true_block: exit,
                    false_block: Some(normal),
                });
                self.func.add_successor(branch_block, exit);
                exit_block = Some(exit);
            }
            self.func.add_unique_successor(self.cur_block, normal);
            self.set_insert_block(normal);
        }

        let quotient = self.expr(
            mir_ty,
            InstKind::Binary {
                op,
                lhs: lhs_inst,
                rhs: rhs_inst,
            },
        );
        // keep the division observable even if the result is dropped
        self.dassign(quotient, result_var);
        if let Some(exit) = exit_block {
            self.br_to(exit);
            self.set_insert_block(exit);
        }
        let result = self.dread(result_var, mir_ty);
        Operand::from_inst(result, ty)
    }

    /// Trapping float→int conversion; the NaN and range checks are expanded
    /// during lowering against the precise per-pair boundary constants.
    pub fn handle_float_to_int(&mut self, dest_ty: WasmType, signed: bool, opnd: Operand) -> Operand {
        let op = if signed {
            ConvOp::WasmFpToSi
        } else {
            ConvOp::WasmFpToUi
        };
        let inst = self.extract_operand(&opnd);
        let conv = self.expr(dest_ty.mir_type(), InstKind::Conv { op, opnd: inst });

        let nan = self
            .func
            .get_or_create_exception_set_block(TrapCode::InvalidConversionToInteger);
        let overflow = self
            .func
            .get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        self.func.add_unique_successor(self.cur_block, nan);
        self.func.add_unique_successor(self.cur_block, overflow);

        let safe = self.make_reusable(conv, dest_ty.mir_type());
        Operand::from_inst(safe, dest_ty)
    }

    pub fn handle_int_extend(
        &mut self,
        dest_ty: WasmType,
        src_ty: WasmType,
        sext: bool,
        opnd: Operand,
    ) -> Operand {
        let mut inst = self.extract_operand(&opnd);
        if opnd.ty() > src_ty {
            inst = self.expr(
                src_ty.mir_type(),
                InstKind::Conv {
                    op: ConvOp::Trunc,
                    opnd: inst,
                },
            );
        }
        let op = if sext { ConvOp::Sext } else { ConvOp::Uext };
        let result = self.expr(dest_ty.mir_type(), InstKind::Conv { op, opnd: inst });
        Operand::from_inst(result, dest_ty)
    }

    pub fn handle_int_trunc(&mut self, opnd: Operand) -> Operand {
        let inst = self.extract_operand(&opnd);
        let result = self.expr(
            TypeInterner::I32,
            InstKind::Conv {
                op: ConvOp::Trunc,
                opnd: inst,
            },
        );
        Operand::from_inst(result, WasmType::I32)
    }

    /// Float↔float and int→float conversions.
    pub fn handle_convert(
        &mut self,
        dest_ty: WasmType,
        src_ty: WasmType,
        signed: bool,
        opnd: Operand,
    ) -> Operand {
        let op = if dest_ty == WasmType::F32 && src_ty == WasmType::F64 {
            ConvOp::FpTrunc
        } else if dest_ty == WasmType::F64 && src_ty == WasmType::F32 {
            ConvOp::FpExt
        } else if signed {
            ConvOp::SiToFp
        } else {
            ConvOp::UiToFp
        };
        let inst = self.extract_operand(&opnd);
        let result = self.expr(dest_ty.mir_type(), InstKind::Conv { op, opnd: inst });
        Operand::from_inst(result, dest_ty)
    }

    pub fn handle_bitcast(&mut self, dest_ty: WasmType, opnd: Operand) -> Operand {
        let inst = self.extract_operand(&opnd);
        let result = self.expr(
            dest_ty.mir_type(),
            InstKind::Conv {
                op: ConvOp::Bitcast,
                opnd: inst,
            },
        );
        Operand::from_inst(result, dest_ty)
    }

    // ==================== Platform feature handlers ====================

    /// Gas metering: `gas_left < delta` traps, then `gas_left -= delta`.
    pub fn handle_gas(&mut self, delta: u64) {
        if !self.config.gas_metering {
            return;
        }
        let layout = self.module.layout;
        let exhausted = self
            .func
            .get_or_create_exception_set_block(TrapCode::GasLimitExceeded);
        let gas = self.get_instance_element(TypeInterner::I64, layout.gas_offset);
        let gas = self.make_reusable(gas, TypeInterner::I64);
        let delta_const = self.int_const(TypeInterner::I64, delta);
        let out_of_gas = self.expr(
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::IUlt,
                lhs: gas,
                rhs: delta_const,
            },
        );
        self.br_if_to(out_of_gas, exhausted);
        let remaining = self.expr(
            TypeInterner::I64,
            InstKind::Binary {
                op: BinaryOp::Sub,
                lhs: gas,
                rhs: delta_const,
            },
        );
        self.set_instance_element(remaining, layout.gas_offset);
    }

    /// Checked arithmetic branching to the integer-overflow set block.
    /// Narrow types are computed in their width and extended back to i32.
    pub fn handle_checked_arithmetic(
        &mut self,
        signed: bool,
        ty: WasmType,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    ) -> Operand {
        let overflow_op = match (op, signed) {
            (BinaryOp::Add, true) => OverflowOp::SaddOverflow,
            (BinaryOp::Add, false) => OverflowOp::UaddOverflow,
            (BinaryOp::Sub, true) => OverflowOp::SsubOverflow,
            (BinaryOp::Sub, false) => OverflowOp::UsubOverflow,
            (BinaryOp::Mul, true) => OverflowOp::SmulOverflow,
            (BinaryOp::Mul, false) => OverflowOp::UmulOverflow,
            _ => unreachable!("checked arithmetic over non add/sub/mul"),
        };
        let is_small = ty == WasmType::I8 || ty == WasmType::I16;
        let mir_ty = ty.mir_type();

        let mut lhs_inst = self.extract_operand(&lhs);
        let mut rhs_inst = self.extract_operand(&rhs);
        if is_small {
            lhs_inst = self.expr(mir_ty, InstKind::Conv { op: ConvOp::Trunc, opnd: lhs_inst });
            rhs_inst = self.expr(mir_ty, InstKind::Conv { op: ConvOp::Trunc, opnd: rhs_inst });
        }

        let result = self.expr(
            mir_ty,
            InstKind::Overflow {
                op: overflow_op,
                lhs: lhs_inst,
                rhs: rhs_inst,
            },
        );
        let overflow = self
            .func
            .get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        self.func.add_unique_successor(self.cur_block, overflow);

        if is_small {
            return self.handle_int_extend(WasmType::I32, ty, signed, Operand::from_inst(result, ty));
        }
        Operand::from_inst(result, ty)
    }

    /// 128-bit checked arithmetic over lo/hi pairs; yields the high half.
    pub fn handle_checked_i128_arithmetic(
        &mut self,
        signed: bool,
        op: BinaryOp,
        lhs_lo: Operand,
        lhs_hi: Operand,
        rhs_lo: Operand,
        rhs_hi: Operand,
    ) -> Operand {
        let overflow_op = match (op, signed) {
            (BinaryOp::Add, true) => OverflowI128Op::Sadd128Overflow,
            (BinaryOp::Add, false) => OverflowI128Op::Uadd128Overflow,
            (BinaryOp::Sub, true) => OverflowI128Op::Ssub128Overflow,
            (BinaryOp::Sub, false) => OverflowI128Op::Usub128Overflow,
            _ => unreachable!("checked i128 arithmetic over non add/sub"),
        };
        let lhs_lo = self.extract_operand(&lhs_lo);
        let lhs_hi = self.extract_operand(&lhs_hi);
        let rhs_lo = self.extract_operand(&rhs_lo);
        let rhs_hi = self.extract_operand(&rhs_hi);
        let result = self.expr(
            TypeInterner::I64,
            InstKind::OverflowI128 {
                op: overflow_op,
                lhs_lo,
                lhs_hi,
                rhs_lo,
                rhs_hi,
            },
        );
        let overflow = self
            .func
            .get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        self.func.add_unique_successor(self.cur_block, overflow);
        Operand::from_inst(result, WasmType::I64)
    }

    // ==================== Finalization ====================

    /// Materialize the exception-set blocks, the shared handler, and the
    /// exception-return block, then hand back the finished function.
    pub fn finalize(mut self) -> MirFunction {
        let exception_id = self.func.create_variable(TypeInterner::I32);
        let handling = self.func.create_exception_handling_block();
        let exc_return = self.exception_return_block;

        let set_blocks: Vec<(TrapCode, BlockId)> = self
            .func
            .exception_set_blocks()
            .iter()
            .map(|(&code, &block)| (code, block))
            .collect();

        let generate_set_blocks = |this: &mut Self| {
            for &(code, block) in &set_blocks {
                this.set_insert_block(block);
                let id = this.int_const(TypeInterner::I32, code.as_i32() as u32 as u64);
                this.dassign(id, exception_id);
                this.br_to(handling);
            }
        };

        if self.config.cpu_exceptions {
            // division and memory faults arrive via hardware; only the rest
            // need the software plumbing
            let pure_soft = set_blocks
                .iter()
                .filter(|(code, _)| {
                    !matches!(code, TrapCode::IntegerDivByZero | TrapCode::OutOfBoundsMemory)
                })
                .count();
            if pure_soft > 0 {
                generate_set_blocks(&mut self);
                self.set_insert_block(handling);
                self.emit_exception_call(self.module.callbacks.set_exception, Some(exception_id));
                self.br_to(exc_return);
                self.set_insert_block(exc_return);
                self.emit_exception_call(self.module.callbacks.throw_exception, None);
                self.emit_typed_zero_return();
            } else if self.use_exception_return_after_call {
                self.set_insert_block(exc_return);
                self.emit_exception_call(self.module.callbacks.throw_exception, None);
                self.emit_typed_zero_return();
            }
            // otherwise both blocks stay detached and unreferenced
        } else {
            generate_set_blocks(&mut self);
            self.set_insert_block(handling);
            // without hardware rethrow the trigger callback records the
            // exception and the function unwinds by returning a typed zero
            self.emit_exception_call(self.module.callbacks.trigger_exception, Some(exception_id));
            self.br_to(exc_return);
            self.set_insert_block(exc_return);
            self.emit_typed_zero_return();
        }

        self.func
    }

    fn emit_exception_call(&mut self, callback: u64, exception_id: Option<VarIdx>) {
        let target = self.int_const(TypeInterner::I64, callback);
        let instance = self.instance_addr.expect("builder not initialized");
        let mut args = vec![instance];
        if let Some(var) = exception_id {
            let id = self.dread(var, TypeInterner::I32);
            args.push(id);
        }
        self.stmt(InstKind::ICall {
            callee: target,
            args,
        });
    }

    fn emit_typed_zero_return(&mut self) {
        let ret = self.module.internal_func_type(self.internal_idx).ret;
        let value = match ret {
            WasmType::Void => None,
            WasmType::F32 => {
                let constant = self.ctx.consts.f32(0.0);
                Some(self.expr(TypeInterner::F32, InstKind::Const(constant)))
            }
            WasmType::F64 => {
                let constant = self.ctx.consts.f64(0.0);
                Some(self.expr(TypeInterner::F64, InstKind::Const(constant)))
            }
            other => Some(self.int_const(other.mir_type(), 0)),
        };
        self.func.create_inst(
            self.cur_block,
            true,
            ret.mir_type(),
            InstKind::Return { value },
        );
    }

    // ==================== Instance access ====================

    fn instance_ptr_expr(&mut self, ptr_ty: TypeId) -> InstId {
        self.func
            .create_inst(self.cur_block, false, ptr_ty, InstKind::Dread(0))
    }

    fn get_instance_element(&mut self, ty: TypeId, offset: u64) -> InstId {
        let ptr_ty = self.ctx.types.pointer_to(ty);
        let base = self.instance_ptr_expr(ptr_ty);
        self.expr(
            ty,
            InstKind::Load {
                src_ty: ty,
                base: Some(base),
                index: None,
                scale: 1,
                offset: offset as i32,
                sext: false,
            },
        )
    }

    fn set_instance_element(&mut self, value: InstId, offset: u64) {
        let value_ty = self.func.inst(value).ty;
        let ptr_ty = self.ctx.types.pointer_to(value_ty);
        let base = self.instance_ptr_expr(ptr_ty);
        self.stmt(InstKind::Store {
            value,
            base,
            index: None,
            scale: 1,
            offset: offset as i32,
        });
    }

    /// `*(base_ptr + index * scale)` where `base` is an i64 address value.
    fn load_indexed(&mut self, ty: TypeId, base: InstId, index: InstId, scale: u8) -> InstId {
        let ptr_ty = self.ctx.types.pointer_to(ty);
        let ptr = self.expr(ptr_ty, InstKind::Conv { op: ConvOp::IntToPtr, opnd: base });
        let wide_index = self.expr(TypeInterner::I64, InstKind::Conv { op: ConvOp::Uext, opnd: index });
        self.expr(
            ty,
            InstKind::Load {
                src_ty: ty,
                base: Some(ptr),
                index: Some(wide_index),
                scale,
                offset: 0,
                sext: false,
            },
        )
    }

    /// Bounds check plus address computation for a linear-memory access;
    /// returns `(pointer expr, optional index, displacement)`.
    fn memory_location(
        &mut self,
        base: InstId,
        offset: u32,
        access_bytes: u32,
        access_ty: WasmType,
    ) -> (InstId, Option<InstId>, i32) {
        let const_base = match &self.func.inst(base).kind {
            InstKind::Const(c) => {
                let value = self.ctx.consts.get(*c);
                match value {
                    kiln_mir::MirConst::Int { .. } => {
                        Some(value.as_i64(&self.ctx.types) as u32 as u64)
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        if self.config.use_soft_mem_check {
            let boundary = self.memory_size_expr();
            let check_offset = offset as u64 + access_bytes as u64;
            let oob = self
                .func
                .get_or_create_exception_set_block(TrapCode::OutOfBoundsMemory);
            match const_base {
                Some(base_value) => {
                    self.stmt(InstKind::WasmCheckMemoryAccess {
                        base: None,
                        boundary,
                        offset: base_value + check_offset,
                    });
                }
                None => {
                    self.stmt(InstKind::WasmCheckMemoryAccess {
                        base: Some(base),
                        boundary,
                        offset: check_offset,
                    });
                }
            }
            self.func.add_unique_successor(self.cur_block, oob);
        }

        let mem_base = self.memory_base_expr();
        let ptr_ty = self.ctx.types.pointer_to(access_ty.mir_type());

        match const_base {
            Some(base_value) => {
                let total = base_value + offset as u64;
                if total <= i32::MAX as u64 {
                    // constant address folds fully into the displacement
                    let ptr = self.expr(ptr_ty, InstKind::Conv { op: ConvOp::IntToPtr, opnd: mem_base });
                    (ptr, None, total as i32)
                } else {
                    // x86-64 displacement is 32-bit; split into base + 0
                    let total_const = self.int_const(TypeInterner::I64, total);
                    let addr = self.expr(
                        TypeInterner::I64,
                        InstKind::Binary {
                            op: BinaryOp::Add,
                            lhs: mem_base,
                            rhs: total_const,
                        },
                    );
                    let ptr = self.expr(ptr_ty, InstKind::Conv { op: ConvOp::IntToPtr, opnd: addr });
                    (ptr, None, 0)
                }
            }
            None => {
                let index = self.expr(
                    TypeInterner::I64,
                    InstKind::Conv {
                        op: ConvOp::Uext,
                        opnd: base,
                    },
                );
                let ptr = self.expr(ptr_ty, InstKind::Conv { op: ConvOp::IntToPtr, opnd: mem_base });
                if offset <= i32::MAX as u32 {
                    (ptr, Some(index), offset as i32)
                } else {
                    let offset_const = self.int_const(TypeInterner::I64, offset as u64);
                    let shifted = self.expr(
                        TypeInterner::I64,
                        InstKind::Binary {
                            op: BinaryOp::Add,
                            lhs: index,
                            rhs: offset_const,
                        },
                    );
                    (ptr, Some(shifted), 0)
                }
            }
        }
    }

    fn memory_base_expr(&mut self) -> InstId {
        match self.memory_base_var {
            Some(var) => self.dread(var, TypeInterner::I64),
            None => {
                self.get_instance_element(TypeInterner::I64, self.module.layout.memory_base_offset)
            }
        }
    }

    fn memory_size_expr(&mut self) -> InstId {
        match self.memory_size_var {
            Some(var) => self.dread(var, TypeInterner::I32),
            None => {
                self.get_instance_element(TypeInterner::I32, self.module.layout.memory_size_offset)
            }
        }
    }

    /// Reread memory base and size after anything that may move them.
    fn update_memory_base_and_size(&mut self) {
        let layout = self.module.layout;
        if let Some(var) = self.memory_base_var {
            let base = self.get_instance_element(TypeInterner::I64, layout.memory_base_offset);
            self.dassign(base, var);
        }
        if let Some(var) = self.memory_size_var {
            let size = self.get_instance_element(TypeInterner::I32, layout.memory_size_offset);
            self.dassign(size, var);
        }
    }

    /// After a call that may have set the instance exception flag, bail out
    /// through the exception-return block.
    fn check_call_exception(&mut self, is_import_or_indirect: bool) {
        if self.config.cpu_exceptions && !is_import_or_indirect {
            return;
        }
        let exception =
            self.get_instance_element(TypeInterner::I32, self.module.layout.exception_offset);
        let zero = self.int_const(TypeInterner::I32, 0);
        let has_exception = self.expr(
            TypeInterner::I8,
            InstKind::Cmp {
                pred: CmpPredicate::INe,
                lhs: exception,
                rhs: zero,
            },
        );
        let target = self.exception_return_block;
        self.br_if_to(has_exception, target);
        self.use_exception_return_after_call = true;
    }

    // ==================== MIR utility methods ====================

    fn enter_block(
        &mut self,
        kind: CtrlBlockKind,
        ty: WasmType,
        stack_size: u32,
        jump_block: BlockId,
        branch_inst: Option<InstId>,
        branch_block: Option<BlockId>,
    ) {
        let result = if ty == WasmType::Void {
            Operand::empty()
        } else {
            let var = self.func.create_variable(ty.mir_type());
            Operand::from_var(var, ty)
        };
        self.control_stack.push(BlockInfo {
            kind,
            result,
            stack_size,
            jump_block,
            next_block: None,
            branch_inst,
            branch_block,
            reachable: true,
        });
    }

    /// A `dread` for variable operands, the instruction itself otherwise.
    fn extract_operand(&mut self, operand: &Operand) -> InstId {
        if let Some(inst) = operand.inst {
            return inst;
        }
        let var = operand.var.expect("empty operand extracted");
        let ty = self.func.variable_type(var);
        self.dread(var, ty)
    }

    /// Instance pointer plus extracted arguments, as every call expects.
    fn call_args(&mut self, args: &[Operand]) -> Vec<InstId> {
        let instance_ptr = self.ctx.types.void_ptr();
        let mut mir_args = Vec::with_capacity(args.len() + 1);
        mir_args.push(self.instance_ptr_expr(instance_ptr));
        for arg in args {
            mir_args.push(self.extract_operand(arg));
        }
        mir_args
    }

    fn compare_impl(
        &mut self,
        pred: CmpPredicate,
        lhs: Operand,
        rhs: Operand,
        result_ty: TypeId,
    ) -> InstId {
        let lhs_inst = self.extract_operand(&lhs);
        let rhs_inst = self.extract_operand(&rhs);
        self.expr(
            result_ty,
            InstKind::Cmp {
                pred,
                lhs: lhs_inst,
                rhs: rhs_inst,
            },
        )
    }

    fn expr(&mut self, ty: TypeId, kind: InstKind) -> InstId {
        self.func.create_inst(self.cur_block, false, ty, kind)
    }

    fn stmt(&mut self, kind: InstKind) -> InstId {
        self.func
            .create_inst(self.cur_block, true, TypeInterner::VOID, kind)
    }

    fn int_const(&mut self, ty: TypeId, value: u64) -> InstId {
        let constant = self.ctx.consts.int(&self.ctx.types, ty, value);
        self.expr(ty, InstKind::Const(constant))
    }

    fn dread(&mut self, var: VarIdx, ty: TypeId) -> InstId {
        self.expr(ty, InstKind::Dread(var))
    }

    fn dassign(&mut self, value: InstId, var: VarIdx) {
        self.stmt(InstKind::Dassign { value, var });
    }

    /// Park a value in a temp variable so later mutations of its source
    /// cannot invalidate it; reads go through `dread`.
    fn make_reusable(&mut self, value: InstId, ty: TypeId) -> InstId {
        let var = self.func.create_variable(ty);
        self.dassign(value, var);
        self.dread(var, ty)
    }

    fn set_insert_block(&mut self, block: BlockId) {
        self.cur_block = block;
        self.func.append_block(block);
    }

    fn br_to(&mut self, target: BlockId) {
        let from = self.cur_block;
        self.stmt(InstKind::Br { target });
        self.func.add_unique_successor(from, target);
    }

    /// `br_if` with an implicit fallthrough in the current block.
    fn br_if_to(&mut self, cond: InstId, target: BlockId) {
        let from = self.cur_block;
        self.stmt(InstKind::BrIf {
            cond,
            true_block: target,
            false_block: None,
        });
        self.func.add_unique_successor(from, target);
    }

    fn wasm_type_of_var(&self, var: VarIdx) -> WasmType {
        let ty = self.func.variable_type(var);
        if ty == TypeInterner::I32 {
            WasmType::I32
        } else if ty == TypeInterner::I64 {
            WasmType::I64
        } else if ty == TypeInterner::F32 {
            WasmType::F32
        } else if ty == TypeInterner::F64 {
            WasmType::F64
        } else if ty == TypeInterner::I8 {
            WasmType::I8
        } else if ty == TypeInterner::I16 {
            WasmType::I16
        } else {
            WasmType::I64
        }
    }

    /// The function under construction (for inspection in tests).
    pub fn func(&self) -> &MirFunction {
        &self.func
    }
}

fn wasm_type_bytes(ty: WasmType) -> u32 {
    match ty {
        WasmType::I8 => 1,
        WasmType::I16 => 2,
        WasmType::I32 | WasmType::F32 => 4,
        WasmType::I64 | WasmType::F64 => 8,
        WasmType::Void => 0,
    }
}

#[cfg(test)]
mod tests;
