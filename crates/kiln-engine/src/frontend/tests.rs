use kiln_mir::arena::BlockId;
use kiln_mir::instr::{BinaryOp, InstKind};
use kiln_mir::{CompileContext, MirFunction, TrapCode};

use super::{FunctionBuilder, Operand};
use crate::config::{CompileConfig, StackCheckMode};
use crate::layout::{HostCallbacks, ModuleLayout};
use crate::module::{WasmFuncType, WasmFunction, WasmGlobal, WasmImport, WasmModule, WasmType};

fn test_module(ret: WasmType, locals: Vec<WasmType>) -> WasmModule {
    WasmModule {
        types: vec![
            WasmFuncType {
                params: vec![],
                ret,
            },
            WasmFuncType {
                params: vec![WasmType::I32],
                ret: WasmType::I32,
            },
        ],
        imports: vec![WasmImport {
            type_idx: 1,
            call_target: 0xdead_0000,
        }],
        functions: vec![
            WasmFunction {
                type_idx: 0,
                locals,
                stack_cost: 48,
                callees: vec![],
            },
            WasmFunction {
                type_idx: 1,
                locals: vec![],
                stack_cost: 16,
                callees: vec![],
            },
        ],
        globals: vec![WasmGlobal {
            ty: WasmType::I64,
            offset: 8,
        }],
        has_memory: true,
        entry_points: vec![0],
        layout: ModuleLayout::default(),
        callbacks: HostCallbacks {
            grow_memory: 0x1111,
            set_exception: 0x2222,
            trigger_exception: 0x3333,
            throw_exception: 0x4444,
        },
    }
}

fn soft_config() -> CompileConfig {
    CompileConfig::default()
}

fn stmt_kinds(func: &MirFunction, block: BlockId) -> Vec<&'static str> {
    func.block(block)
        .stmts
        .iter()
        .map(|&s| match func.inst(s).kind {
            InstKind::Dassign { .. } => "dassign",
            InstKind::Br { .. } => "br",
            InstKind::BrIf { .. } => "br_if",
            InstKind::Switch { .. } => "switch",
            InstKind::Return { .. } => "return",
            InstKind::Store { .. } => "store",
            InstKind::Call { .. } => "call",
            InstKind::ICall { .. } => "icall",
            InstKind::Unreachable => "unreachable",
            InstKind::WasmCheckMemoryAccess { .. } => "check_mem",
            InstKind::WasmCheckStackBoundary { .. } => "check_stack",
            InstKind::WasmVisitStackGuard => "stack_guard",
            _ => "other",
        })
        .collect()
}

#[test]
fn test_init_zero_initializes_locals() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![WasmType::I32, WasmType::F64]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let func = builder.func();
    let entry = func.layout()[0];
    let kinds = stmt_kinds(func, entry);
    // two local zero-inits before the instance plumbing
    assert_eq!(kinds.iter().filter(|k| **k == "dassign").count() >= 2, true);
    // boundary stack check present in the default config
    assert!(kinds.contains(&"check_stack"));
    // instance pointer variable plus two params-free locals and memory cache vars
    assert!(func.num_variables() >= 3);
}

#[test]
fn test_guard_page_stack_check() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = CompileConfig {
        stack_check: StackCheckMode::GuardPage,
        ..soft_config()
    };
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let func = builder.func();
    let kinds = stmt_kinds(func, func.layout()[0]);
    assert!(kinds.contains(&"stack_guard"));
    assert!(!kinds.contains(&"check_stack"));
    // no set block materialized in guard mode
    assert!(!func
        .exception_set_blocks()
        .contains_key(&TrapCode::CallStackExhausted));
}

#[test]
fn test_soft_counted_stack_check() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = CompileConfig {
        stack_check: StackCheckMode::SoftCounted { limit: 1 << 20 },
        ..soft_config()
    };
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let func = builder.func();
    let kinds = stmt_kinds(func, func.layout()[0]);
    // counter update store plus the branch to the exhaustion block
    assert!(kinds.contains(&"store"));
    assert!(kinds.contains(&"br_if"));
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::CallStackExhausted));
}

#[test]
fn test_load_emits_bounds_check_and_reusable_result() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let addr = builder.handle_const_i32(64);
    let loaded = builder.handle_load(WasmType::I32, WasmType::I32, false, addr, 16);
    assert_eq!(loaded.ty(), WasmType::I32);

    let func = builder.func();
    let kinds = stmt_kinds(func, func.layout()[0]);
    assert!(kinds.contains(&"check_mem"));
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::OutOfBoundsMemory));
    // constant base folds into the check offset: 64 + 16 + 4
    let check = func
        .block(func.layout()[0])
        .stmts
        .iter()
        .find_map(|&s| match func.inst(s).kind {
            InstKind::WasmCheckMemoryAccess { base, offset, .. } => Some((base, offset)),
            _ => None,
        })
        .expect("memory check");
    assert_eq!(check.0, None);
    assert_eq!(check.1, 84);
}

#[test]
fn test_memory_grow_rereads_base_and_size() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let entry = builder.func().layout()[0];
    let before = stmt_kinds(builder.func(), entry)
        .iter()
        .filter(|k| **k == "dassign")
        .count();

    let delta = builder.handle_const_i32(1);
    let result = builder.handle_memory_grow(delta);
    assert_eq!(result.ty(), WasmType::I32);

    let after = stmt_kinds(builder.func(), entry)
        .iter()
        .filter(|k| **k == "dassign")
        .count();
    // result var + re-read of memory base and size
    assert!(after >= before + 3);
}

#[test]
fn test_idiv_signed_emits_checks() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let lhs = builder.handle_const_i32(i32::MIN);
    let rhs = builder.handle_const_i32(-1);
    let result = builder.handle_idiv(WasmType::I32, BinaryOp::DivS, lhs, rhs);
    assert_eq!(result.ty(), WasmType::I32);

    let func = builder.func();
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerDivByZero));
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerOverflow));
}

#[test]
fn test_rem_signed_returns_zero_without_trap() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let lhs = builder.handle_const_i32(i32::MIN);
    let rhs = builder.handle_const_i32(-1);
    let _ = builder.handle_idiv(WasmType::I32, BinaryOp::RemS, lhs, rhs);

    let func = builder.func();
    // rem_s must not create the overflow block; the -1 divisor path assigns 0
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerDivByZero));
    assert!(!func
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerOverflow));
}

#[test]
fn test_cpu_exception_mode_skips_div_zero_check() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = CompileConfig {
        cpu_exceptions: true,
        ..soft_config()
    };
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let lhs = builder.handle_const_i32(10);
    let rhs = builder.handle_const_i32(3);
    let _ = builder.handle_idiv(WasmType::I32, BinaryOp::DivU, lhs, rhs);

    assert!(!builder
        .func()
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerDivByZero));
}

#[test]
fn test_internal_call_checks_exception_and_reloads_memory() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let arg = builder.handle_const_i32(5);
    // global index 1 is internal function 0... global 1 = internal 0? imports=1, so global 1 → internal 0
    let result = builder.handle_call(1, &[arg]).unwrap();
    assert_eq!(result.ty(), WasmType::I32);

    let func = builder.func();
    let entry = func.layout()[0];
    let kinds = stmt_kinds(func, entry);
    assert!(kinds.contains(&"call"));
    // post-call exception branch to the exception-return block
    assert!(kinds.contains(&"br_if"));
    // memory base and size rereads follow the call
    let call_pos = kinds.iter().position(|k| *k == "call").unwrap();
    let reloads = kinds[call_pos..].iter().filter(|k| **k == "dassign").count();
    assert!(reloads >= 3);
}

#[test]
fn test_import_call_is_icall() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let arg = builder.handle_const_i32(5);
    let _ = builder.handle_call(0, &[arg]).unwrap();

    let func = builder.func();
    let kinds = stmt_kinds(func, func.layout()[0]);
    assert!(!kinds.contains(&"call"));
    // import goes through its host trampoline address
    let has_icall_assign = func.block(func.layout()[0]).stmts.iter().any(|&s| {
        matches!(
            func.inst(s).kind,
            InstKind::Dassign { value, .. }
                if matches!(func.inst(value).kind, InstKind::ICall { .. })
        )
    });
    assert!(has_icall_assign);
}

#[test]
fn test_call_indirect_check_order() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let index = builder.handle_const_i32(2);
    let arg = builder.handle_const_i32(9);
    let _ = builder.handle_call_indirect(1, index, &[arg]).unwrap();

    let func = builder.func();
    let undefined = func.exception_set_blocks()[&TrapCode::UndefinedElement];
    let uninitialized = func.exception_set_blocks()[&TrapCode::UninitializedElement];
    let mismatch = func.exception_set_blocks()[&TrapCode::IndirectCallTypeMismatch];

    // the three checks appear in order in the entry block's branch targets
    let entry = func.layout()[0];
    let mut targets = Vec::new();
    for &s in &func.block(entry).stmts {
        if let InstKind::BrIf { true_block, .. } = func.inst(s).kind {
            targets.push(true_block);
        }
    }
    let pos = |b: BlockId| targets.iter().position(|&t| t == b).unwrap();
    assert!(pos(undefined) < pos(uninitialized));
    assert!(pos(uninitialized) < pos(mismatch));
}

#[test]
fn test_gas_metering_sequence() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = CompileConfig {
        gas_metering: true,
        ..soft_config()
    };
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    builder.handle_gas(7);

    let func = builder.func();
    assert!(func
        .exception_set_blocks()
        .contains_key(&TrapCode::GasLimitExceeded));
    let kinds = stmt_kinds(func, func.layout()[0]);
    // check branch, then the decremented counter stored back
    assert!(kinds.contains(&"br_if"));
    assert_eq!(kinds.iter().rev().find(|k| **k == "store"), Some(&"store"));
}

#[test]
fn test_gas_disabled_emits_nothing() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let before = builder.func().num_insts();
    builder.handle_gas(7);
    assert_eq!(builder.func().num_insts(), before);
}

#[test]
fn test_branch_table_dedups_levels() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    builder.handle_block(WasmType::Void, 0);
    builder.handle_block(WasmType::Void, 0);
    let index = builder.handle_const_i32(1);
    let blocks_before = builder.func().num_blocks();
    builder.handle_branch_table(index, Operand::empty(), &[0, 0, 1], 0);
    let blocks_after = builder.func().num_blocks();
    // three table entries plus default over two unique levels → two trampolines
    assert_eq!(blocks_after - blocks_before, 2);
}

#[test]
fn test_if_else_end_structure() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let cond = builder.handle_const_i32(1);
    builder.handle_if(cond, WasmType::I32, 0);
    let one = builder.handle_const_i32(1);
    let result = builder.current_block_info().result();
    builder.make_assignment(&result, &one);
    builder.handle_else();
    let two = builder.handle_const_i32(2);
    let result = builder.current_block_info().result();
    builder.make_assignment(&result, &two);
    let merged = builder.handle_end();
    assert_eq!(merged.ty(), WasmType::I32);

    // the if branch got a false edge patched in by else
    let func = builder.func();
    let entry = func.layout()[0];
    let branch = func
        .block(entry)
        .stmts
        .iter()
        .find_map(|&s| match func.inst(s).kind {
            InstKind::BrIf {
                true_block,
                false_block,
                ..
            } => Some((true_block, false_block)),
            _ => None,
        })
        .expect("if branch");
    assert!(branch.1.is_some());
    assert_ne!(Some(branch.0), branch.1);
}

#[test]
fn test_loop_branches_backward() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    builder.handle_loop(WasmType::Void, 0);
    let header = builder.block_info(0).jump_block();
    builder.handle_branch(0);

    // the backward branch targets the loop header
    let func = builder.func();
    let found = func.layout().iter().any(|&b| {
        func.block(b).stmts.iter().any(|&s| {
            matches!(func.inst(s).kind, InstKind::Br { target } if target == header)
        })
    });
    assert!(found);
}

#[test]
fn test_finalize_soft_mode_plumbing() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    // provoke two different set blocks
    let addr = builder.handle_const_i32(0);
    let _ = builder.handle_load(WasmType::I32, WasmType::I32, false, addr, 0);
    builder.handle_unreachable();
    let func = {
        let result = builder.handle_end();
        let _ = result;
        builder.finalize()
    };

    let handling = func.exception_handling_block.expect("handler");
    let exc_return = func.exception_return_block.expect("exception return");

    // each set block assigns the trap code and branches to the handler
    for (&code, &block) in func.exception_set_blocks() {
        let stmts = &func.block(block).stmts;
        assert!(stmts.len() >= 2, "set block for {:?} too small", code);
        assert!(matches!(
            func.inst(*stmts.last().unwrap()).kind,
            InstKind::Br { target } if target == handling
        ));
    }

    // the handler calls the host set-exception callback then exits
    let handler_stmts = &func.block(handling).stmts;
    assert!(handler_stmts
        .iter()
        .any(|&s| matches!(func.inst(s).kind, InstKind::ICall { .. })));
    assert!(matches!(
        func.inst(*handler_stmts.last().unwrap()).kind,
        InstKind::Br { target } if target == exc_return
    ));

    // the exception-return block returns a typed zero (i32 here)
    let ret_stmts = &func.block(exc_return).stmts;
    assert!(matches!(
        func.inst(*ret_stmts.last().unwrap()).kind,
        InstKind::Return { value: Some(_) }
    ));
}

#[test]
fn test_finalize_cpu_mode_without_soft_exceptions() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = CompileConfig {
        cpu_exceptions: true,
        use_soft_mem_check: false,
        cache_memory: false,
        stack_check: StackCheckMode::GuardPage,
        ..soft_config()
    };
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let value = builder.handle_const_i32(3);
    let result = builder.current_block_info().result();
    builder.make_assignment(&result, &value);
    let _ = builder.handle_end();
    let func = builder.finalize();

    // no set blocks, no post-call checks: the plumbing blocks stay detached
    assert!(func.exception_set_blocks().is_empty());
    let exc_return = func.exception_return_block.expect("created at init");
    assert!(!func.layout().contains(&exc_return));
}

#[test]
fn test_get_global_reads_instance_data() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let global = builder.handle_get_global(0);
    assert_eq!(global.ty(), WasmType::I64);

    // the load addresses GlobalVarData (0x40) + offset 8
    let func = builder.func();
    let entry = func.layout()[0];
    let found = func.block(entry).stmts.iter().any(|&s| {
        if let InstKind::Dassign { value, .. } = func.inst(s).kind {
            matches!(
                func.inst(value).kind,
                InstKind::Load { offset: 0x48, .. }
            )
        } else {
            false
        }
    });
    assert!(found);
}

#[test]
fn test_checked_arithmetic_small_type_extends_back() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::I32, vec![]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let lhs = builder.handle_const_i32(100);
    let rhs = builder.handle_const_i32(100);
    let result =
        builder.handle_checked_arithmetic(true, WasmType::I8, BinaryOp::Add, lhs, rhs);
    // narrow result widened back to i32
    assert_eq!(result.ty(), WasmType::I32);
    assert!(builder
        .func()
        .exception_set_blocks()
        .contains_key(&TrapCode::IntegerOverflow));
}

#[test]
fn test_set_local_assigns_variable() {
    let mut ctx = CompileContext::new();
    let module = test_module(WasmType::Void, vec![WasmType::I32]);
    let config = soft_config();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    let value = builder.handle_const_i32(11);
    builder.handle_set_local(0, value);
    let read = builder.handle_get_local(0);
    assert_eq!(read.ty(), WasmType::I32);
    assert_eq!(read.var(), Some(1));
}
