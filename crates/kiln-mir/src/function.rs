//! MIR functions
//!
//! A function owns its variables, basic blocks, and instruction arena.
//! Variable 0 is always the instance pointer argument. Exception-set blocks
//! are created on demand per trap code and wired up during finalization.

use std::collections::BTreeMap;

use crate::arena::{Arena, BlockId, InstId, TypeId};
use crate::block::MirBasicBlock;
use crate::instr::{InstKind, MirInst};

/// Dense variable index within a function.
pub type VarIdx = u32;

/// Runtime error codes carried as `i32` in the instance exception slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum TrapCode {
    Unreachable = 0,
    OutOfBoundsMemory = 1,
    IntegerDivByZero = 2,
    IntegerOverflow = 3,
    InvalidConversionToInteger = 4,
    CallStackExhausted = 5,
    GasLimitExceeded = 6,
    UndefinedElement = 7,
    UninitializedElement = 8,
    IndirectCallTypeMismatch = 9,
}

impl TrapCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A named slot inside a function: a dense index plus a type.
#[derive(Debug, Clone, Copy)]
pub struct Variable {
    pub idx: VarIdx,
    pub ty: TypeId,
}

/// A function under compilation.
#[derive(Debug)]
pub struct MirFunction {
    /// Index of this function in the module (internal function space).
    pub func_idx: u32,
    /// Interned function type.
    pub ty: TypeId,
    variables: Vec<Variable>,
    blocks: Vec<MirBasicBlock>,
    /// Emission order; blocks are created detached and appended when entered.
    layout: Vec<BlockId>,
    insts: Arena<InstId, MirInst>,
    /// On-demand block per trap code, ordered for deterministic emission.
    exception_set_blocks: BTreeMap<TrapCode, BlockId>,
    pub exception_handling_block: Option<BlockId>,
    pub exception_return_block: Option<BlockId>,
}

impl MirFunction {
    pub fn new(func_idx: u32, ty: TypeId) -> Self {
        MirFunction {
            func_idx,
            ty,
            variables: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            insts: Arena::new(),
            exception_set_blocks: BTreeMap::new(),
            exception_handling_block: None,
            exception_return_block: None,
        }
    }

    // ==================== Variables ====================

    /// Create a variable of the given type; indices are dense from 0.
    pub fn create_variable(&mut self, ty: TypeId) -> VarIdx {
        let idx = self.variables.len() as VarIdx;
        self.variables.push(Variable { idx, ty });
        idx
    }

    pub fn num_variables(&self) -> u32 {
        self.variables.len() as u32
    }

    pub fn variable_type(&self, idx: VarIdx) -> TypeId {
        self.variables[idx as usize].ty
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    // ==================== Blocks ====================

    /// Create a detached basic block; `append_block` puts it in the layout.
    pub fn create_block(&mut self) -> BlockId {
        let idx = self.blocks.len() as u32;
        self.blocks.push(MirBasicBlock::new(idx));
        BlockId(idx)
    }

    /// Append a block to the emission order.
    pub fn append_block(&mut self, id: BlockId) {
        debug_assert!(!self.layout.contains(&id));
        self.layout.push(id);
    }

    pub fn block(&self, id: BlockId) -> &MirBasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut MirBasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Blocks in emission order.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// Add a CFG edge, reflecting it in the successor's predecessor list.
    pub fn add_successor(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).successors.push(to);
        self.block_mut(to).predecessors.push(from);
    }

    /// Add a CFG edge unless it already exists.
    pub fn add_unique_successor(&mut self, from: BlockId, to: BlockId) {
        if !self.block(from).successors.contains(&to) {
            self.add_successor(from, to);
        }
    }

    // ==================== Instructions ====================

    /// Create an instruction; statements are appended to `block`, expressions
    /// are only referenced through operand trees.
    pub fn create_inst(
        &mut self,
        block: BlockId,
        is_stmt: bool,
        ty: TypeId,
        kind: InstKind,
    ) -> InstId {
        let id = self.insts.alloc(MirInst::new(kind, ty, is_stmt));
        if is_stmt {
            self.block_mut(block).stmts.push(id);
        }
        id
    }

    pub fn inst(&self, id: InstId) -> &MirInst {
        self.insts.get(id)
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut MirInst {
        self.insts.get_mut(id)
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    // ==================== Exception plumbing ====================

    /// The unique block that materializes `code` into the exception-id
    /// variable and branches to the handler; created detached on first use.
    pub fn get_or_create_exception_set_block(&mut self, code: TrapCode) -> BlockId {
        if let Some(&id) = self.exception_set_blocks.get(&code) {
            return id;
        }
        let id = self.create_block();
        self.exception_set_blocks.insert(code, id);
        id
    }

    pub fn exception_set_blocks(&self) -> &BTreeMap<TrapCode, BlockId> {
        &self.exception_set_blocks
    }

    pub fn create_exception_return_block(&mut self) -> BlockId {
        let id = self.create_block();
        self.exception_return_block = Some(id);
        id
    }

    pub fn create_exception_handling_block(&mut self) -> BlockId {
        let id = self.create_block();
        self.exception_handling_block = Some(id);
        id
    }

    /// Drop a never-wired block from the layout (it may not be present).
    pub fn remove_from_layout(&mut self, id: BlockId) {
        self.layout.retain(|&b| b != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeInterner;

    #[test]
    fn test_variable_indices_dense() {
        let mut func = MirFunction::new(0, TypeInterner::VOID);
        assert_eq!(func.create_variable(TypeInterner::I64), 0);
        assert_eq!(func.create_variable(TypeInterner::I32), 1);
        assert_eq!(func.variable_type(1), TypeInterner::I32);
        assert_eq!(func.num_variables(), 2);
    }

    #[test]
    fn test_block_edges_reflected() {
        let mut func = MirFunction::new(0, TypeInterner::VOID);
        let a = func.create_block();
        let b = func.create_block();
        func.add_successor(a, b);
        assert_eq!(func.block(a).successors, vec![b]);
        assert_eq!(func.block(b).predecessors, vec![a]);
    }

    #[test]
    fn test_unique_successor_dedup() {
        let mut func = MirFunction::new(0, TypeInterner::VOID);
        let a = func.create_block();
        let b = func.create_block();
        func.add_unique_successor(a, b);
        func.add_unique_successor(a, b);
        assert_eq!(func.block(a).successors.len(), 1);
        assert_eq!(func.block(b).predecessors.len(), 1);
    }

    #[test]
    fn test_exception_set_block_unique_per_code() {
        let mut func = MirFunction::new(0, TypeInterner::VOID);
        let a = func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let b = func.get_or_create_exception_set_block(TrapCode::IntegerOverflow);
        let c = func.get_or_create_exception_set_block(TrapCode::IntegerDivByZero);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(func.exception_set_blocks().len(), 2);
    }

    #[test]
    fn test_statements_vs_expressions() {
        let mut func = MirFunction::new(0, TypeInterner::VOID);
        let entry = func.create_block();
        func.append_block(entry);
        let expr = func.create_inst(entry, false, TypeInterner::I32, InstKind::Dread(0));
        let stmt = func.create_inst(
            entry,
            true,
            TypeInterner::VOID,
            InstKind::Return { value: Some(expr) },
        );
        // only the statement lands in the block
        assert_eq!(func.block(entry).stmts, vec![stmt]);
        assert!(func.inst(stmt).is_terminator());
        assert!(!func.inst(expr).is_stmt);
    }

    #[test]
    fn test_trap_code_values() {
        assert_eq!(TrapCode::Unreachable.as_i32(), 0);
        assert_eq!(TrapCode::GasLimitExceeded.as_i32(), 6);
        assert_eq!(TrapCode::IndirectCallTypeMismatch.as_i32(), 9);
    }
}
