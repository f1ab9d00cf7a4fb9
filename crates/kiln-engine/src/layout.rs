//! Instance layout
//!
//! The backend encodes loads and stores against the runtime's `Instance`
//! record; these offsets are fixed by the runtime ABI and asserted here.
//! Per-module offsets arrive through `ModuleLayout` and become compile-time
//! constants in emitted code.

/// Fixed `Instance` field offsets (x86-64 layout).
pub const INSTANCE_GLOBAL_VAR_DATA_OFFSET: u64 = 0x40;
pub const INSTANCE_MEMORIES_OFFSET: u64 = 0x50;
pub const MEMORY_INSTANCE_MEM_SIZE_OFFSET: u64 = 0x08;
pub const MEMORY_INSTANCE_MEM_BASE_OFFSET: u64 = 0x10;
pub const INSTANCE_JIT_STACK_SIZE_OFFSET: u64 = 0x68;
pub const INSTANCE_JIT_STACK_BOUNDARY_OFFSET: u64 = 0x70;

/// Per-module offsets injected at compile time.
#[derive(Debug, Clone, Copy)]
pub struct ModuleLayout {
    pub stack_cost_offset: u64,
    pub stack_boundary_offset: u64,
    pub gas_offset: u64,
    pub exception_offset: u64,
    pub memory_base_offset: u64,
    pub memory_size_offset: u64,
    pub memory_pages_offset: u64,
    pub table_elem_size_offset: u64,
    pub table_elem_base_offset: u64,
    pub func_type_indexes_base_offset: u64,
    pub func_ptrs_base_offset: u64,
}

impl Default for ModuleLayout {
    fn default() -> Self {
        ModuleLayout {
            stack_cost_offset: 0x60,
            stack_boundary_offset: INSTANCE_JIT_STACK_BOUNDARY_OFFSET,
            gas_offset: 0x78,
            exception_offset: 0x80,
            memory_base_offset: INSTANCE_MEMORIES_OFFSET + MEMORY_INSTANCE_MEM_BASE_OFFSET,
            memory_size_offset: INSTANCE_MEMORIES_OFFSET + MEMORY_INSTANCE_MEM_SIZE_OFFSET,
            memory_pages_offset: 0x88,
            table_elem_size_offset: 0x90,
            table_elem_base_offset: 0x98,
            func_type_indexes_base_offset: 0xa0,
            func_ptrs_base_offset: 0xa8,
        }
    }
}

/// Host entry points called from emitted code; the addresses are baked into
/// code as 64-bit immediates. System-V AMD64, first argument is the
/// instance pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCallbacks {
    /// `growInstanceMemoryOnJIT(instance, delta_pages) -> i32`
    pub grow_memory: u64,
    /// `setInstanceExceptionOnJIT(instance, error_code)`
    pub set_exception: u64,
    /// `triggerInstanceExceptionOnJIT(instance, error_code)`
    pub trigger_exception: u64,
    /// `throwInstanceExceptionOnJIT(instance)`
    pub throw_exception: u64,
}
