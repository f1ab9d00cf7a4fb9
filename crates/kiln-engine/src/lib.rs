//! Kiln compile engine.
//!
//! Drives the multi-pass pipeline: an event-driven wasm→MIR frontend, the
//! machine passes from `kiln-codegen`, per-module executable code memory,
//! and two schedulers — eager (compile everything up front) and lazy
//! (per-function stubs resolved by a background thread pool).

pub mod code_memory;
pub mod config;
pub mod frontend;
pub mod layout;
pub mod module;
pub mod pool;
pub mod scheduler;
pub mod stub;

pub use code_memory::CodeMemory;
pub use config::{CompileConfig, DispatchStrategy, StackCheckMode};
pub use frontend::{FunctionBuilder, Operand};
pub use layout::{HostCallbacks, ModuleLayout};
pub use module::{WasmFuncType, WasmFunction, WasmGlobal, WasmImport, WasmModule, WasmType};
pub use pool::ThreadPool;
pub use scheduler::{
    CompileTaskContext, CompiledModule, EagerCompiler, EmitterFactory, FunctionSource,
    LazyCompiler,
};

use kiln_codegen::CodegenError;
use kiln_mir::{ParseError, Phase};
use thiserror::Error;

/// Engine-level errors; each carries the phase it was raised in.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("codegen error: {0}")]
    Codegen(#[from] CodegenError),
    #[error("mmap failed: {0}")]
    MmapFailed(String),
    #[error("unexpected type during {0}")]
    UnexpectedType(Phase),
    #[error("unexpected function index {0}")]
    UnexpectedFuncIdx(u32),
    #[error("module compilation already failed")]
    ModuleFailed,
}

impl EngineError {
    pub fn phase(&self) -> Phase {
        match self {
            EngineError::Parse(_) => Phase::Parsing,
            EngineError::UnexpectedType(phase) => *phase,
            _ => Phase::Compilation,
        }
    }
}
