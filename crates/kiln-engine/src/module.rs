//! Decoded module description
//!
//! What the frontend needs from the runtime's module representation: the
//! type table, per-function locals and stack cost, import call targets, the
//! layout offsets, and host callback addresses. Bytecode decoding itself
//! stays in the runtime; it drives `FunctionBuilder` with opcode events.

use kiln_mir::arena::TypeId;
use kiln_mir::types::TypeInterner;
use kiln_mir::{CompileContext, MirModule};

use crate::layout::{HostCallbacks, ModuleLayout};

/// Wasm value types, including the narrow integers used by the checked
/// arithmetic extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WasmType {
    Void,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl WasmType {
    pub fn is_integer(self) -> bool {
        matches!(self, WasmType::I8 | WasmType::I16 | WasmType::I32 | WasmType::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, WasmType::F32 | WasmType::F64)
    }

    /// The MIR type for this wasm type.
    pub fn mir_type(self) -> TypeId {
        match self {
            WasmType::Void => TypeInterner::VOID,
            WasmType::I8 => TypeInterner::I8,
            WasmType::I16 => TypeInterner::I16,
            WasmType::I32 => TypeInterner::I32,
            WasmType::I64 => TypeInterner::I64,
            WasmType::F32 => TypeInterner::F32,
            WasmType::F64 => TypeInterner::F64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WasmFuncType {
    pub params: Vec<WasmType>,
    pub ret: WasmType,
}

/// An imported function: its type and the host trampoline address called in
/// its place.
#[derive(Debug, Clone)]
pub struct WasmImport {
    pub type_idx: u32,
    pub call_target: u64,
}

/// An internal (defined) function.
#[derive(Debug, Clone)]
pub struct WasmFunction {
    pub type_idx: u32,
    pub locals: Vec<WasmType>,
    /// Frame cost charged against the soft stack-depth counter.
    pub stack_cost: u32,
    /// Internal functions this one calls directly (drives depth-first
    /// dispatch).
    pub callees: Vec<u32>,
}

/// A module global: its type and byte offset within the instance's global
/// data area.
#[derive(Debug, Clone, Copy)]
pub struct WasmGlobal {
    pub ty: WasmType,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct WasmModule {
    pub types: Vec<WasmFuncType>,
    pub imports: Vec<WasmImport>,
    /// Internal functions, indexed by internal function index.
    pub functions: Vec<WasmFunction>,
    pub globals: Vec<WasmGlobal>,
    pub has_memory: bool,
    /// Internal indices the lazy scheduler starts from.
    pub entry_points: Vec<u32>,
    pub layout: ModuleLayout,
    pub callbacks: HostCallbacks,
}

impl WasmModule {
    pub fn num_import_functions(&self) -> u32 {
        self.imports.len() as u32
    }

    pub fn num_internal_functions(&self) -> u32 {
        self.functions.len() as u32
    }

    /// Function type by global (import-space) function index.
    pub fn func_type(&self, func_idx: u32) -> &WasmFuncType {
        let num_imports = self.num_import_functions();
        let type_idx = if func_idx < num_imports {
            self.imports[func_idx as usize].type_idx
        } else {
            self.functions[(func_idx - num_imports) as usize].type_idx
        };
        &self.types[type_idx as usize]
    }

    pub fn internal_func_type(&self, internal_idx: u32) -> &WasmFuncType {
        &self.types[self.functions[internal_idx as usize].type_idx as usize]
    }
}

/// Build the MIR function types for every internal function: the declared
/// parameters behind an implicit instance pointer.
pub fn build_all_mir_func_types(ctx: &mut CompileContext, module: &WasmModule) -> MirModule {
    let mut mir_module = MirModule::new();
    for func in &module.functions {
        let func_type = &module.types[func.type_idx as usize];
        let mut params = Vec::with_capacity(func_type.params.len() + 1);
        params.push(ctx.types.void_ptr());
        for &param in &func_type.params {
            params.push(param.mir_type());
        }
        let ret = func_type.ret.mir_type();
        mir_module.add_func_type(ctx.types.function(ret, params));
    }
    mir_module
}
