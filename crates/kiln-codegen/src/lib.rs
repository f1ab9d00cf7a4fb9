//! Machine-level code generation for the Kiln WebAssembly compiler.
//!
//! Lowers MIR to CGIR (target opcodes over virtual registers), allocates
//! registers, inserts prolog/epilog and eliminates frame indices, then runs
//! the peephole pass. The byte encoder is an external collaborator reached
//! through the `CodeEmitter` trait.

pub mod cgir;
pub mod encode;
pub mod pass;
pub mod x64;

pub use cgir::function::CgFunction;
pub use encode::{CodeEmitter, EmittedCode, Reloc, RelocTarget};

use kiln_mir::{CompileContext, MirFunction, Phase};
use thiserror::Error;

/// Errors from lowering and the machine passes.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unexpected type during {0}")]
    UnexpectedType(Phase),
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("register allocation failed: {0}")]
    RegisterAllocation(String),
    #[error("encoder error: {0}")]
    Emit(String),
}

impl CodegenError {
    pub fn phase(&self) -> Phase {
        Phase::Compilation
    }
}

/// Run the full MIR→CGIR pipeline for one function: lowering, register
/// allocation, call expansion, prolog/epilog insertion, and peephole.
pub fn compile_mir_function(
    ctx: &CompileContext,
    func: &MirFunction,
) -> Result<CgFunction, CodegenError> {
    let mut cg = x64::lowering::lower_function(ctx, func)?;
    let mut rci = pass::reg_class_info::RegClassInfo::new();
    rci.run_on_function(&cg);
    pass::regalloc::run(&mut cg, &rci)?;
    pass::prolog_epilog::run(&mut cg);
    pass::peephole::run::<x64::peephole::X64Peephole>(&mut cg);
    Ok(cg)
}
