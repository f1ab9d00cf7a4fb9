//! Encoder contract
//!
//! The byte encoder assembles a finished `CgFunction` into a relocatable
//! buffer. It is an external collaborator; the schedulers consume it through
//! `CodeEmitter` and patch the returned relocations at link time.

use crate::cgir::CgFunction;
use crate::CodegenError;

/// What a relocation resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// Internal function by index; resolves to its entry (or stub) address.
    Func(u32),
    /// Absolute address already known at compile time.
    Abs(u64),
}

/// A 4-byte PC-relative patch site within emitted code.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    /// Offset of the displacement field within the function's bytes.
    pub offset: usize,
    pub target: RelocTarget,
}

/// Relocatable machine code for one function.
#[derive(Debug, Default)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
}

/// Assembles typed machine instructions into a relocatable buffer.
pub trait CodeEmitter: Send {
    fn emit_function(&mut self, func: &CgFunction) -> Result<EmittedCode, CodegenError>;
}
