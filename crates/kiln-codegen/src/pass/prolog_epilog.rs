//! Prolog/epilog insertion and frame finalization
//!
//! Erases call-frame pseudos, spills/reloads the callee-saved registers the
//! allocator used, assigns frame offsets (fixed objects first, then CSR
//! slots, then locals through a first-fit scavenger), replaces frame-index
//! operands in DFS order carrying the SP adjustment, and finally emits the
//! RBP-based prolog and epilogs.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cgir::{
    CgBlockId, CgFunction, CgInst, CgOperand, CgReg, MemRef, OpWidth, StackObjectKind,
};
use crate::x64::opcode::X64Op;
use crate::x64::regs;

pub fn run(cg: &mut CgFunction) {
    let layout: Vec<CgBlockId> = cg.layout().to_vec();
    if layout.is_empty() {
        return;
    }
    let entry = layout[0];

    // 1. Call-frame size is tracked by lowering; pseudos are erased during
    //    the frame-index walk below.

    // 2. Save block is the entry; restore blocks are all return blocks.
    let restore_blocks: Vec<CgBlockId> = layout
        .iter()
        .copied()
        .filter(|&b| {
            cg.block(b)
                .insts
                .last()
                .is_some_and(|inst| inst.op == X64Op::Ret)
        })
        .collect();

    // 3. Determine saved callee-saved registers and give each a slot.
    let used = cg.used_phys_regs();
    let saved: Vec<CgReg> = regs::CALLEE_SAVED
        .iter()
        .copied()
        .filter(|r| used.contains(r))
        .collect();
    let align = 8u32.min(FrameLayout::STACK_ALIGN);
    let csr_slots: Vec<(CgReg, u32)> = saved
        .iter()
        .map(|&reg| {
            let slot = cg
                .frame
                .create_object(8, align, StackObjectKind::CalleeSave);
            (reg, slot)
        })
        .collect();

    // 4. Spills at the save block, reloads (reverse order) at restore blocks.
    let spills: Vec<CgInst> = csr_slots
        .iter()
        .map(|&(reg, slot)| {
            CgInst::new(
                X64Op::Mov,
                OpWidth::B64,
                vec![CgOperand::FrameIndex(slot), CgOperand::use_(reg)],
            )
        })
        .collect();
    let entry_block = cg.block_mut(entry);
    entry_block.insts.splice(0..0, spills);

    for &block in &restore_blocks {
        let reloads: Vec<CgInst> = csr_slots
            .iter()
            .rev()
            .map(|&(reg, slot)| {
                CgInst::new(
                    X64Op::Mov,
                    OpWidth::B64,
                    vec![CgOperand::def(reg), CgOperand::FrameIndex(slot)],
                )
            })
            .collect();
        let insts = &mut cg.block_mut(block).insts;
        let ret_pos = insts.len() - 1;
        insts.splice(ret_pos..ret_pos, reloads);
    }

    // 5. Every block between save and restore carries the CSRs live-in.
    for &block in &layout {
        if block == entry {
            continue;
        }
        for &reg in &saved {
            cg.block_mut(block).add_live_in(reg);
        }
    }

    // 6. Assign frame offsets.
    let stack_size = FrameLayout::assign_offsets(cg);

    // 7. Replace frame indices in DFS order, maintaining the SP adjustment.
    replace_frame_indices(cg, entry);

    // Prolog and epilogs.
    let prolog = vec![
        CgInst::new(X64Op::Push, OpWidth::B64, vec![CgOperand::use_(regs::RBP)]),
        CgInst::new(
            X64Op::Mov,
            OpWidth::B64,
            vec![CgOperand::def(regs::RBP), CgOperand::use_(regs::RSP)],
        ),
        CgInst::new(
            X64Op::Sub,
            OpWidth::B64,
            vec![CgOperand::def(regs::RSP), CgOperand::Imm(stack_size as i64)],
        ),
    ];
    let take = if stack_size > 0 { 3 } else { 2 };
    cg.block_mut(entry)
        .insts
        .splice(0..0, prolog.into_iter().take(take));

    for &block in &restore_blocks {
        let epilog = vec![
            CgInst::new(
                X64Op::Mov,
                OpWidth::B64,
                vec![CgOperand::def(regs::RSP), CgOperand::use_(regs::RBP)],
            ),
            CgInst::new(X64Op::Pop, OpWidth::B64, vec![CgOperand::def(regs::RBP)]),
        ];
        let insts = &mut cg.block_mut(block).insts;
        let ret_pos = insts.len() - 1;
        insts.splice(ret_pos..ret_pos, epilog);
    }
}

struct FrameLayout;

impl FrameLayout {
    const STACK_ALIGN: u32 = 16;

    /// Fixed objects keep their offsets; CSR slots go right below the frame
    /// pointer; locals fill the space below through a first-fit scan over
    /// free bytes left by alignment padding.
    fn assign_offsets(cg: &mut CgFunction) -> u32 {
        let num_objects = cg.frame.num_objects();

        // CSR slots first, in creation order.
        let mut depth = 0u32;
        for index in 0..num_objects {
            let obj = cg.frame.object(index);
            if obj.kind == StackObjectKind::CalleeSave {
                let size = obj.size;
                depth += size;
                cg.frame.set_object_offset(index, -(depth as i64));
            }
        }

        // Locals below, scavenging alignment gaps first.
        let mut free: Vec<(u32, u32)> = Vec::new();
        let mut max_align = 8u32;
        for index in 0..num_objects {
            let obj = cg.frame.object(index);
            if obj.kind != StackObjectKind::Local {
                continue;
            }
            let (size, obj_align) = (obj.size, obj.align.max(1));
            max_align = max_align.max(obj_align);

            if let Some(offset) = Self::scavenge(&mut free, size, obj_align) {
                cg.frame.set_object_offset(index, -(offset as i64));
                continue;
            }

            let unaligned = depth + size;
            let aligned = unaligned.next_multiple_of(obj_align);
            if aligned != unaligned {
                // padding bytes become scavengeable
                free.push((depth, depth + (aligned - unaligned)));
            }
            depth = aligned;
            cg.frame.set_object_offset(index, -(depth as i64));
        }

        let total = depth + cg.frame.max_call_frame_size;
        let stack_size = total.next_multiple_of(Self::STACK_ALIGN.max(max_align.min(16)));
        cg.frame.stack_size = stack_size;
        stack_size
    }

    /// First-fit over free byte ranges; returns the chosen end-offset depth.
    fn scavenge(free: &mut Vec<(u32, u32)>, size: u32, align: u32) -> Option<u32> {
        for i in 0..free.len() {
            let (lo, hi) = free[i];
            if hi - lo < size {
                continue;
            }
            let end = (lo + size).next_multiple_of(align);
            if end > hi {
                continue;
            }
            // carve [lo, end) out of the range
            if end == hi {
                free.remove(i);
            } else {
                free[i] = (end, hi);
            }
            return Some(end);
        }
        None
    }
}

/// DFS from the entry replacing `FrameIndex` operands with FP-relative
/// memory references, erasing call-frame pseudos while tracking the SP
/// adjustment at each block exit.
fn replace_frame_indices(cg: &mut CgFunction, entry: CgBlockId) {
    let mut visited: FxHashSet<CgBlockId> = FxHashSet::default();
    let mut exit_adj: FxHashMap<CgBlockId, i64> = FxHashMap::default();
    let mut stack = vec![(entry, 0i64)];

    while let Some((block, mut sp_adj)) = stack.pop() {
        if !visited.insert(block) {
            continue;
        }

        let offsets: Vec<Option<i64>> = cg.frame.objects().iter().map(|o| o.offset).collect();
        let insts = &mut cg.block_mut(block).insts;
        insts.retain_mut(|inst| match inst.op {
            X64Op::CallFrameSetup => {
                if let Some(CgOperand::Imm(amount)) = inst.operands.first() {
                    sp_adj += amount;
                }
                false
            }
            X64Op::CallFrameDestroy => {
                if let Some(CgOperand::Imm(amount)) = inst.operands.first() {
                    sp_adj -= amount;
                }
                false
            }
            _ => {
                for opnd in &mut inst.operands {
                    if let CgOperand::FrameIndex(index) = opnd {
                        let offset = offsets[*index as usize]
                            .expect("stack object has no offset");
                        *opnd = CgOperand::Mem(MemRef::base_disp(regs::RBP, offset as i32));
                    }
                }
                true
            }
        });

        // the reserved call frame keeps SP fixed through the function
        debug_assert_eq!(sp_adj, 0);
        exit_adj.insert(block, sp_adj);
        for &succ in &cg.block(block).successors {
            stack.push((succ, sp_adj));
        }
    }

    // Unreachable blocks (none expected) still need their pseudos cleared.
    let layout: Vec<CgBlockId> = cg.layout().to_vec();
    for block in layout {
        if visited.contains(&block) {
            continue;
        }
        let offsets: Vec<Option<i64>> = cg.frame.objects().iter().map(|o| o.offset).collect();
        let insts = &mut cg.block_mut(block).insts;
        insts.retain_mut(|inst| {
            if matches!(inst.op, X64Op::CallFrameSetup | X64Op::CallFrameDestroy) {
                return false;
            }
            for opnd in &mut inst.operands {
                if let CgOperand::FrameIndex(index) = opnd {
                    let offset = offsets[*index as usize].expect("stack object has no offset");
                    *opnd = CgOperand::Mem(MemRef::base_disp(regs::RBP, offset as i32));
                }
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgir::RegClass;

    fn ret_block(cg: &mut CgFunction) -> CgBlockId {
        let block = cg.create_block();
        cg.append_block(block);
        block
    }

    #[test]
    fn test_prolog_and_epilog_inserted() {
        let mut cg = CgFunction::new(0);
        let entry = ret_block(&mut cg);
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg);

        let insts = &cg.block(entry).insts;
        assert_eq!(insts[0].op, X64Op::Push);
        assert_eq!(insts[1].op, X64Op::Mov); // rbp <- rsp
        // epilog directly before ret
        let n = insts.len();
        assert_eq!(insts[n - 1].op, X64Op::Ret);
        assert_eq!(insts[n - 2].op, X64Op::Pop);
        assert_eq!(insts[n - 3].op, X64Op::Mov); // rsp <- rbp
    }

    #[test]
    fn test_csr_spill_and_reload() {
        let mut cg = CgFunction::new(0);
        let entry = ret_block(&mut cg);
        // a use of RBX forces it to be saved
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B64,
                vec![CgOperand::def(regs::RBX), CgOperand::Imm(1)],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg);

        let insts = &cg.block(entry).insts;
        // spill: a store of RBX into [rbp - 8] after the prolog
        let spill = insts
            .iter()
            .find(|inst| {
                inst.op == X64Op::Mov
                    && matches!(inst.operands.first(), Some(CgOperand::Mem(_)))
                    && inst.operands.get(1).and_then(|o| o.reg()) == Some(regs::RBX)
            })
            .expect("rbx spill");
        match spill.operands[0] {
            CgOperand::Mem(mem) => {
                assert_eq!(mem.base, regs::RBP);
                assert!(mem.disp < 0);
            }
            _ => unreachable!(),
        }
        // reload before the epilog
        let reload = insts.iter().any(|inst| {
            inst.op == X64Op::Mov
                && inst.operands.first().and_then(|o| o.reg()) == Some(regs::RBX)
                && matches!(inst.operands.get(1), Some(CgOperand::Mem(_)))
        });
        assert!(reload);
    }

    #[test]
    fn test_stack_size_rounded_and_objects_disjoint() {
        let mut cg = CgFunction::new(0);
        let entry = ret_block(&mut cg);
        for _ in 0..3 {
            cg.frame.create_object(8, 8, StackObjectKind::Local);
        }
        cg.frame.max_call_frame_size = 24;
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg);

        assert_eq!(cg.frame.stack_size % 16, 0);
        assert!(cg.frame.stack_size >= 3 * 8 + 24);
        // no two local/CSR objects overlap
        let mut ranges: Vec<(i64, i64)> = cg
            .frame
            .objects()
            .iter()
            .filter(|o| !matches!(o.kind, StackObjectKind::Fixed(_)))
            .map(|o| {
                let off = o.offset.expect("assigned");
                (off, off + o.size as i64)
            })
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping objects: {:?}", ranges);
        }
    }

    #[test]
    fn test_frame_indices_replaced_and_pseudos_erased() {
        let mut cg = CgFunction::new(0);
        let entry = ret_block(&mut cg);
        let slot = cg.frame.create_object(8, 8, StackObjectKind::Local);
        let v = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        let _ = v;
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::CallFrameSetup,
                OpWidth::B64,
                vec![CgOperand::Imm(0)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Mov,
                OpWidth::B64,
                vec![CgOperand::def(regs::RAX), CgOperand::FrameIndex(slot)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::CallFrameDestroy,
                OpWidth::B64,
                vec![CgOperand::Imm(0)],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg);

        for inst in &cg.block(entry).insts {
            assert!(!matches!(
                inst.op,
                X64Op::CallFrameSetup | X64Op::CallFrameDestroy
            ));
            for opnd in &inst.operands {
                assert!(!matches!(opnd, CgOperand::FrameIndex(_)));
            }
        }
        // the load now addresses [rbp + offset]
        let load = cg
            .block(entry)
            .insts
            .iter()
            .find(|inst| inst.operands.first().and_then(|o| o.reg()) == Some(regs::RAX))
            .expect("frame load");
        assert!(matches!(load.operands[1], CgOperand::Mem(mem) if mem.base == regs::RBP));
    }

    #[test]
    fn test_csr_live_in_added_to_non_entry_blocks() {
        let mut cg = CgFunction::new(0);
        let entry = ret_block(&mut cg);
        let second = ret_block(&mut cg);
        cg.add_successor(entry, second);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B64,
                vec![CgOperand::def(regs::R12), CgOperand::Imm(3)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(X64Op::Jmp, OpWidth::B64, vec![CgOperand::Block(second)]),
        );
        cg.push_inst(second, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg);

        assert!(cg.block(second).live_ins.contains(&regs::R12));
        assert!(!cg.block(entry).live_ins.contains(&regs::R12));
    }
}
