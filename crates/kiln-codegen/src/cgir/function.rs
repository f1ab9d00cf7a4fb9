//! CGIR functions
//!
//! Owns blocks, the virtual-register table, and the frame. Block numbers are
//! creation order; the layout vector is emission order (lowering appends
//! exception blocks after the body, so the two differ).

use super::block::{CgBasicBlock, CgBlockId};
use super::frame::FrameInfo;
use super::instr::CgInst;
use super::operand::{CgReg, OpWidth, RegClass};

/// Class and width of a virtual register.
#[derive(Debug, Clone, Copy)]
pub struct VRegInfo {
    pub class: RegClass,
    pub width: OpWidth,
}

#[derive(Debug)]
pub struct CgFunction {
    pub func_idx: u32,
    blocks: Vec<CgBasicBlock>,
    layout: Vec<CgBlockId>,
    pub frame: FrameInfo,
    vregs: Vec<VRegInfo>,
}

impl CgFunction {
    pub fn new(func_idx: u32) -> Self {
        CgFunction {
            func_idx,
            blocks: Vec::new(),
            layout: Vec::new(),
            frame: FrameInfo::new(),
            vregs: Vec::new(),
        }
    }

    // ==================== Blocks ====================

    pub fn create_block(&mut self) -> CgBlockId {
        let number = self.blocks.len() as u32;
        self.blocks.push(CgBasicBlock::new(number));
        CgBlockId(number)
    }

    pub fn append_block(&mut self, id: CgBlockId) {
        debug_assert!(!self.layout.contains(&id));
        self.layout.push(id);
    }

    pub fn block(&self, id: CgBlockId) -> &CgBasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: CgBlockId) -> &mut CgBasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Blocks in emission order.
    pub fn layout(&self) -> &[CgBlockId] {
        &self.layout
    }

    /// The block emitted immediately after `id`, if any.
    pub fn layout_successor(&self, id: CgBlockId) -> Option<CgBlockId> {
        let pos = self.layout.iter().position(|&b| b == id)?;
        self.layout.get(pos + 1).copied()
    }

    pub fn add_successor(&mut self, from: CgBlockId, to: CgBlockId) {
        self.block_mut(from).successors.push(to);
        self.block_mut(to).predecessors.push(from);
    }

    pub fn add_unique_successor(&mut self, from: CgBlockId, to: CgBlockId) {
        if !self.block(from).successors.contains(&to) {
            self.add_successor(from, to);
        }
    }

    // ==================== Virtual registers ====================

    pub fn create_vreg(&mut self, class: RegClass, width: OpWidth) -> CgReg {
        let reg = CgReg::virt(self.vregs.len() as u32);
        self.vregs.push(VRegInfo { class, width });
        reg
    }

    pub fn vreg_info(&self, reg: CgReg) -> VRegInfo {
        self.vregs[reg.virt_index() as usize]
    }

    pub fn num_vregs(&self) -> u32 {
        self.vregs.len() as u32
    }

    // ==================== Instructions ====================

    pub fn push_inst(&mut self, block: CgBlockId, inst: CgInst) {
        self.block_mut(block).insts.push(inst);
    }

    /// Physical registers written anywhere in the function (post-allocation).
    pub fn used_phys_regs(&self) -> Vec<CgReg> {
        let mut out = Vec::new();
        for block in &self.blocks {
            for inst in &block.insts {
                for def in inst.defs() {
                    if def.is_physical() && !out.contains(&def) {
                        out.push(def);
                    }
                }
            }
        }
        out
    }
}
