//! End-to-end pipeline tests: frontend-built and text-parsed MIR through
//! lowering, register allocation, frame finalization, and peephole.

use std::sync::Arc;

use kiln_codegen::cgir::CgOperand;
use kiln_codegen::x64::opcode::X64Op;
use kiln_codegen::compile_mir_function;
use kiln_engine::{
    CompileConfig, FunctionBuilder, HostCallbacks, ModuleLayout, WasmFuncType, WasmFunction,
    WasmModule, WasmType,
};
use kiln_mir::instr::BinaryOp;
use kiln_mir::{parse_module, CompileContext};

fn test_module() -> Arc<WasmModule> {
    Arc::new(WasmModule {
        types: vec![WasmFuncType {
            params: vec![WasmType::I32, WasmType::I32],
            ret: WasmType::I32,
        }],
        imports: vec![],
        functions: vec![WasmFunction {
            type_idx: 0,
            locals: vec![WasmType::I32],
            stack_cost: 32,
            callees: vec![],
        }],
        globals: vec![],
        has_memory: true,
        entry_points: vec![0],
        layout: ModuleLayout::default(),
        callbacks: HostCallbacks {
            grow_memory: 0x1000,
            set_exception: 0x2000,
            trigger_exception: 0x3000,
            throw_exception: 0x4000,
        },
    })
}

/// No virtual registers, no frame indices, and a frame-pointer prolog after
/// the full pass pipeline.
fn assert_well_formed(cg: &kiln_codegen::CgFunction) {
    for &block in cg.layout() {
        for inst in &cg.block(block).insts {
            for opnd in &inst.operands {
                match opnd {
                    CgOperand::Reg { reg, .. } => {
                        assert!(reg.is_physical(), "virtual register survived allocation")
                    }
                    CgOperand::FrameIndex(_) => panic!("frame index survived finalization"),
                    CgOperand::Mem(mem) => {
                        assert!(mem.base.is_physical());
                        if let Some(index) = mem.index {
                            assert!(index.is_physical());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    let entry = cg.layout()[0];
    assert_eq!(cg.block(entry).insts[0].op, X64Op::Push);
    assert_eq!(cg.frame.stack_size % 16, 0);
}

#[test]
fn test_frontend_function_through_full_pipeline() {
    let module = test_module();
    let config = CompileConfig::default();
    let mut ctx = CompileContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx, &module, &config, 0).unwrap();
    builder.init_function().unwrap();

    // local0 = param0 / param1; return local0 + memory[local0]
    let a = builder.handle_get_local(0);
    let b = builder.handle_get_local(1);
    let quotient = builder.handle_idiv(WasmType::I32, BinaryOp::DivS, a, b);
    builder.handle_set_local(2, quotient);
    let addr = builder.handle_get_local(2);
    let loaded = builder.handle_load(WasmType::I32, WasmType::I32, false, addr, 4);
    let lhs = builder.handle_get_local(2);
    let sum = builder.handle_binary(WasmType::I32, BinaryOp::Add, lhs, loaded);
    let result = builder.current_block_info().result();
    builder.make_assignment(&result, &sum);
    let _ = builder.handle_end();
    let mir = builder.finalize();

    let cg = compile_mir_function(&ctx, &mir).unwrap();
    assert_well_formed(&cg);

    // the division checks and memory check produced exception branches
    let has_jcc = cg
        .layout()
        .iter()
        .flat_map(|&b| cg.block(b).insts.iter())
        .any(|inst| matches!(inst.op, X64Op::Jcc(_)));
    assert!(has_jcc);
}

#[test]
fn test_parsed_text_through_full_pipeline() {
    let source = "func %0 (void*, i32) -> i32 {\n\
         var $0 void*\n\
         var $1 i32\n\
         var $2 i32\n\
         @0:\n\
         $2 = add($1, const.i32 10)\n\
         br_if cmp isgt ($2, const.i32 100), @1, @2\n\
         @1:\n\
         return const.i32 0\n\
         @2:\n\
         return mul($2, const.i32 3)\n\
         }\n";
    let mut ctx = CompileContext::new();
    let module = parse_module(&mut ctx, source).unwrap();
    let cg = compile_mir_function(&ctx, module.function(0)).unwrap();
    assert_well_formed(&cg);
}

#[test]
fn test_parsed_call_chain_through_pipeline() {
    let source = "func %0 (void*) -> i64 {\n\
         var $0 void*\n\
         @0:\n\
         return call %1 ()\n\
         }\n\
         func %1 (void*) -> i64 {\n\
         var $0 void*\n\
         @0:\n\
         return const.i64 41\n\
         }\n";
    let mut ctx = CompileContext::new();
    let module = parse_module(&mut ctx, source).unwrap();
    for func in module.functions() {
        let cg = compile_mir_function(&ctx, func).unwrap();
        assert_well_formed(&cg);
    }
}
