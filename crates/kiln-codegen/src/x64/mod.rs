//! x86-64 target
//!
//! Opcode and register definitions, MIR→CGIR lowering, and the target
//! peephole hooks.

pub mod lowering;
pub mod opcode;
pub mod peephole;
pub mod regs;

pub use opcode::{CondCode, ExtWidth, RoundingMode, X64Op};
