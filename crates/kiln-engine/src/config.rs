//! Compile configuration
//!
//! Build-mode switches mirrored from the runtime: how stack overflow is
//! detected, whether linear-memory accesses get software bounds checks,
//! gas metering, and the lazy dispatch strategy.

/// How the function prologue detects stack overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheckMode {
    /// Maintain a per-instance stack-cost counter against a fixed limit.
    SoftCounted { limit: u32 },
    /// Probe `[sp - guard]` and let the guard page fault.
    GuardPage,
    /// Compare SP against the instance's stack boundary field.
    Boundary,
}

/// Order in which the lazy scheduler dispatches background compilations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Follow the static call graph depth-first from the entry points.
    DepthFirst,
    /// Every internal function, in index order.
    InOrder,
    /// Entry points only; everything else compiles on first call.
    EntryOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileConfig {
    pub stack_check: StackCheckMode,
    /// Emit software bounds checks before every linear-memory access.
    pub use_soft_mem_check: bool,
    /// Emit a gas check and decrement per metered opcode.
    pub gas_metering: bool,
    /// Cache memory base/size in locals at function entry.
    pub cache_memory: bool,
    /// Rely on hardware traps (SIGFPE/SIGSEGV) where possible and rethrow
    /// instead of returning a typed zero.
    pub cpu_exceptions: bool,
    pub dispatch: DispatchStrategy,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            stack_check: StackCheckMode::Boundary,
            use_soft_mem_check: true,
            gas_metering: false,
            cache_memory: true,
            cpu_exceptions: false,
            dispatch: DispatchStrategy::InOrder,
        }
    }
}
