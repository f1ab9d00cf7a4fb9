//! MIR basic blocks
//!
//! An ordered statement list plus predecessor/successor edges held as block
//! indices. Successor edges may repeat for multi-way branches; callers that
//! need set semantics use `add_unique_successor`.

use crate::arena::{BlockId, InstId};

#[derive(Debug, Clone, Default)]
pub struct MirBasicBlock {
    pub idx: u32,
    pub stmts: Vec<InstId>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
}

impl MirBasicBlock {
    pub fn new(idx: u32) -> Self {
        MirBasicBlock {
            idx,
            stmts: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        BlockId(self.idx)
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}
