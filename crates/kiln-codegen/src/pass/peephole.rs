//! Peephole driver
//!
//! Per-block pass with two target hooks: an end-of-block rewrite and a
//! per-instruction scan. Hooks may delete instructions at or after the
//! current index; the driver re-checks bounds every step.

use crate::cgir::{CgBlockId, CgFunction};

/// Target-specific rewrite hooks.
pub trait PeepholeHooks {
    fn peephole_block_end(cg: &mut CgFunction, block: CgBlockId);
    fn peephole_inst(cg: &mut CgFunction, block: CgBlockId, index: usize);
}

pub fn run<H: PeepholeHooks>(cg: &mut CgFunction) {
    for block in cg.layout().to_vec() {
        if cg.block(block).is_empty() {
            continue;
        }
        H::peephole_block_end(cg, block);
        let mut index = 0;
        while index < cg.block(block).insts.len() {
            H::peephole_inst(cg, block, index);
            index += 1;
        }
    }
}
