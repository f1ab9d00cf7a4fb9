//! Linear-scan register allocation
//!
//! Builds one conservative live interval per virtual register from a
//! block-level liveness fixpoint, then scans in start order assigning
//! registers from the class allocation order. Constraints:
//!
//! - an interval crossing a call site only takes a callee-saved register
//!   (float intervals spill, every XMM register is volatile);
//! - a register named explicitly by any instruction inside the interval's
//!   range is unavailable to it (argument marshalling, division, shifts);
//! - when nothing fits the interval spills to a fresh stack object and its
//!   uses go through the reserved scratch registers.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cgir::{CgBlockId, CgFunction, CgInst, CgOperand, CgReg, OpWidth, RegClass, StackObjectKind};
use crate::pass::reg_class_info::RegClassInfo;
use crate::x64::opcode::X64Op;
use crate::x64::regs;
use crate::CodegenError;

#[derive(Debug, Clone, Copy)]
enum Loc {
    Phys(CgReg),
    Slot(u32),
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    vreg: CgReg,
    start: usize,
    end: usize,
}

pub fn run(cg: &mut CgFunction, rci: &RegClassInfo) -> Result<(), CodegenError> {
    let layout: Vec<CgBlockId> = cg.layout().to_vec();

    // ==================== Linearize ====================

    let mut block_range: FxHashMap<CgBlockId, (usize, usize)> = FxHashMap::default();
    let mut num_positions = 0usize;
    for &block in &layout {
        let len = cg.block(block).insts.len();
        block_range.insert(block, (num_positions, num_positions + len));
        num_positions += len;
    }

    // ==================== Block liveness ====================

    let num_vregs = cg.num_vregs() as usize;
    let mut uses: FxHashMap<CgBlockId, FxHashSet<u32>> = FxHashMap::default();
    let mut defs: FxHashMap<CgBlockId, FxHashSet<u32>> = FxHashMap::default();
    for &block in &layout {
        let mut block_uses = FxHashSet::default();
        let mut block_defs: FxHashSet<u32> = FxHashSet::default();
        for inst in &cg.block(block).insts {
            for reg in inst.uses() {
                if reg.is_virtual() && !block_defs.contains(&reg.virt_index()) {
                    block_uses.insert(reg.virt_index());
                }
            }
            for reg in inst.defs() {
                if reg.is_virtual() {
                    block_defs.insert(reg.virt_index());
                }
            }
        }
        uses.insert(block, block_uses);
        defs.insert(block, block_defs);
    }

    let mut live_in: FxHashMap<CgBlockId, FxHashSet<u32>> = FxHashMap::default();
    let mut live_out: FxHashMap<CgBlockId, FxHashSet<u32>> = FxHashMap::default();
    for &block in &layout {
        live_in.insert(block, FxHashSet::default());
        live_out.insert(block, FxHashSet::default());
    }
    loop {
        let mut changed = false;
        for &block in layout.iter().rev() {
            let mut out: FxHashSet<u32> = FxHashSet::default();
            for &succ in &cg.block(block).successors {
                if let Some(succ_in) = live_in.get(&succ) {
                    out.extend(succ_in.iter().copied());
                }
            }
            let mut inn: FxHashSet<u32> = uses[&block].clone();
            for &v in &out {
                if !defs[&block].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != live_out[&block] {
                live_out.insert(block, out);
                changed = true;
            }
            if inn != live_in[&block] {
                live_in.insert(block, inn);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // ==================== Intervals and constraints ====================

    let mut starts: Vec<Option<usize>> = vec![None; num_vregs];
    let mut ends: Vec<Option<usize>> = vec![None; num_vregs];
    let mut extend = |v: u32, pos: usize, starts: &mut Vec<Option<usize>>, ends: &mut Vec<Option<usize>>| {
        let v = v as usize;
        starts[v] = Some(starts[v].map_or(pos, |s| s.min(pos)));
        ends[v] = Some(ends[v].map_or(pos, |e| e.max(pos)));
    };

    let mut blocked: FxHashMap<CgReg, Vec<usize>> = FxHashMap::default();
    let mut call_positions: Vec<usize> = Vec::new();

    for &block in &layout {
        let (bs, be) = block_range[&block];
        for &v in &live_in[&block] {
            extend(v, bs, &mut starts, &mut ends);
        }
        for &v in &live_out[&block] {
            extend(v, be.saturating_sub(1).max(bs), &mut starts, &mut ends);
        }
        for (i, inst) in cg.block(block).insts.iter().enumerate() {
            let pos = bs + i;
            if inst.op.is_call() {
                call_positions.push(pos);
            }
            for reg in inst.uses().into_iter().chain(inst.defs()) {
                if reg.is_virtual() {
                    extend(reg.virt_index(), pos, &mut starts, &mut ends);
                } else {
                    blocked.entry(reg).or_default().push(pos);
                }
            }
        }
    }

    let mut intervals: Vec<Interval> = (0..num_vregs as u32)
        .filter_map(|v| {
            Some(Interval {
                vreg: CgReg::virt(v),
                start: starts[v as usize]?,
                end: ends[v as usize]?,
            })
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.end));

    let crosses_call = |iv: &Interval| {
        call_positions
            .iter()
            .any(|&p| p > iv.start && p < iv.end)
    };
    let is_blocked = |reg: CgReg, iv: &Interval| {
        blocked
            .get(&reg)
            .is_some_and(|ps| ps.iter().any(|&p| p >= iv.start && p <= iv.end))
    };

    // ==================== Scan ====================

    let mut assignments: Vec<Option<Loc>> = vec![None; num_vregs];
    let mut active: Vec<Interval> = Vec::new();

    for iv in intervals {
        active.retain(|a| a.end >= iv.start);
        let class = cg.vreg_info(iv.vreg).class;
        let needs_csr = crosses_call(&iv);

        let mut chosen = None;
        for &candidate in &rci.order(class).order {
            if needs_csr && !regs::is_callee_saved(candidate) {
                continue;
            }
            if is_blocked(candidate, &iv) {
                continue;
            }
            let in_use = active.iter().any(|a| {
                matches!(assignments[a.vreg.virt_index() as usize], Some(Loc::Phys(p)) if p == candidate)
            });
            if in_use {
                continue;
            }
            chosen = Some(candidate);
            break;
        }

        let index = iv.vreg.virt_index() as usize;
        match chosen {
            Some(reg) => {
                assignments[index] = Some(Loc::Phys(reg));
                active.push(iv);
            }
            None => {
                let slot = cg
                    .frame
                    .create_object(8, 8, StackObjectKind::Local);
                assignments[index] = Some(Loc::Slot(slot));
            }
        }
    }

    rewrite(cg, &layout, &assignments)
}

/// Replace virtual registers with their assignments, routing spilled values
/// through the reserved scratch registers.
fn rewrite(
    cg: &mut CgFunction,
    layout: &[CgBlockId],
    assignments: &[Option<Loc>],
) -> Result<(), CodegenError> {
    for &block in layout {
        let old = std::mem::take(&mut cg.block_mut(block).insts);
        let mut new_insts: Vec<CgInst> = Vec::with_capacity(old.len());

        for mut inst in old {
            let mut gpr_pool = [regs::R10, regs::R11].into_iter();
            let mut fpr_pool = [regs::XMM14, regs::XMM15].into_iter();
            let mut scratch_map: FxHashMap<CgReg, (CgReg, u32, OpWidth, RegClass)> =
                FxHashMap::default();
            let mut reloads: Vec<CgReg> = Vec::new();
            let mut stores: Vec<CgReg> = Vec::new();

            let two_address = inst.op.is_two_address();
            let num_operands = inst.operands.len();
            for opnd_idx in 0..num_operands {
                let opnd = inst.operands[opnd_idx];
                let mut resolve = |vreg: CgReg,
                                   is_read: bool,
                                   is_write: bool,
                                   scratch_map: &mut FxHashMap<CgReg, (CgReg, u32, OpWidth, RegClass)>,
                                   reloads: &mut Vec<CgReg>,
                                   stores: &mut Vec<CgReg>|
                 -> Result<CgReg, CodegenError> {
                    match assignments[vreg.virt_index() as usize] {
                        Some(Loc::Phys(p)) => Ok(p),
                        Some(Loc::Slot(slot)) => {
                            let info = cg_vreg_info(cg, vreg);
                            let scratch = if let Some(&(s, ..)) = scratch_map.get(&vreg) {
                                s
                            } else {
                                let s = match info.0 {
                                    RegClass::Gpr => gpr_pool.next(),
                                    RegClass::Fpr => fpr_pool.next(),
                                }
                                .ok_or_else(|| {
                                    CodegenError::RegisterAllocation(
                                        "out of spill scratch registers".to_string(),
                                    )
                                })?;
                                scratch_map.insert(vreg, (s, slot, info.1, info.0));
                                s
                            };
                            if is_read && !reloads.contains(&vreg) {
                                reloads.push(vreg);
                            }
                            if is_write && !stores.contains(&vreg) {
                                stores.push(vreg);
                            }
                            Ok(scratch)
                        }
                        None => Err(CodegenError::RegisterAllocation(format!(
                            "virtual register v{} has no assignment",
                            vreg.virt_index()
                        ))),
                    }
                };

                match opnd {
                    CgOperand::Reg { reg, is_def } if reg.is_virtual() => {
                        let is_read = !is_def || (opnd_idx == 0 && two_address);
                        let resolved = resolve(
                            reg,
                            is_read,
                            is_def,
                            &mut scratch_map,
                            &mut reloads,
                            &mut stores,
                        )?;
                        inst.operands[opnd_idx] = CgOperand::Reg {
                            reg: resolved,
                            is_def,
                        };
                    }
                    CgOperand::Mem(mut mem) => {
                        if mem.base.is_virtual() {
                            mem.base = resolve(
                                mem.base,
                                true,
                                false,
                                &mut scratch_map,
                                &mut reloads,
                                &mut stores,
                            )?;
                        }
                        if let Some(index) = mem.index {
                            if index.is_virtual() {
                                mem.index = Some(resolve(
                                    index,
                                    true,
                                    false,
                                    &mut scratch_map,
                                    &mut reloads,
                                    &mut stores,
                                )?);
                            }
                        }
                        inst.operands[opnd_idx] = CgOperand::Mem(mem);
                    }
                    _ => {}
                }
            }

            for vreg in reloads {
                let (scratch, slot, width, class) = scratch_map[&vreg];
                let op = if class == RegClass::Fpr {
                    X64Op::Movs
                } else {
                    X64Op::Mov
                };
                new_insts.push(CgInst::new(
                    op,
                    width,
                    vec![CgOperand::def(scratch), CgOperand::FrameIndex(slot)],
                ));
            }
            let store_insts: Vec<CgInst> = stores
                .iter()
                .map(|vreg| {
                    let (scratch, slot, width, class) = scratch_map[vreg];
                    let op = if class == RegClass::Fpr {
                        X64Op::Movs
                    } else {
                        X64Op::Mov
                    };
                    CgInst::new(
                        op,
                        width,
                        vec![CgOperand::FrameIndex(slot), CgOperand::use_(scratch)],
                    )
                })
                .collect();
            new_insts.push(inst);
            new_insts.extend(store_insts);
        }

        cg.block_mut(block).insts = new_insts;
    }
    Ok(())
}

fn cg_vreg_info(cg: &CgFunction, vreg: CgReg) -> (RegClass, OpWidth) {
    let info = cg.vreg_info(vreg);
    (info.class, info.width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgir::MemRef;

    fn rci() -> RegClassInfo {
        let mut rci = RegClassInfo::new();
        rci.update(regs::RESERVED.to_vec(), regs::CALLEE_SAVED.to_vec());
        rci
    }

    /// dst = a + b in a single block; everything should land in registers.
    #[test]
    fn test_simple_allocation_no_spills() {
        let mut cg = CgFunction::new(0);
        let entry = cg.create_block();
        cg.append_block(entry);
        let a = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        let b = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B32,
                vec![CgOperand::def(a), CgOperand::Imm(1)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B32,
                vec![CgOperand::def(b), CgOperand::Imm(2)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Add,
                OpWidth::B32,
                vec![CgOperand::def(a), CgOperand::use_(b)],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg, &rci()).unwrap();

        for inst in &cg.block(entry).insts {
            for opnd in &inst.operands {
                if let CgOperand::Reg { reg, .. } = opnd {
                    assert!(reg.is_physical());
                    assert!(!regs::is_reserved(*reg));
                }
            }
        }
        assert_eq!(cg.frame.num_objects(), 0);
    }

    /// A value live across a call must not sit in a caller-saved register.
    #[test]
    fn test_call_crossing_value_gets_csr() {
        let mut cg = CgFunction::new(0);
        let entry = cg.create_block();
        cg.append_block(entry);
        let v = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        let out = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B64,
                vec![CgOperand::def(v), CgOperand::Imm(7)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(X64Op::Call, OpWidth::B64, vec![CgOperand::Func(1)]),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Mov,
                OpWidth::B64,
                vec![CgOperand::def(out), CgOperand::use_(v)],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg, &rci()).unwrap();

        // the def of v (first inst) must target a callee-saved register
        let first = &cg.block(entry).insts[0];
        let def = first.defs().next().unwrap();
        assert!(
            regs::is_callee_saved(def),
            "{} is not callee-saved",
            regs::reg_name(def)
        );
    }

    /// A register named explicitly inside the interval range is off-limits.
    #[test]
    fn test_explicit_phys_operand_blocks_register() {
        let mut cg = CgFunction::new(0);
        let entry = cg.create_block();
        cg.append_block(entry);
        let v = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        let cnt = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        let shifted = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B32,
                vec![CgOperand::def(v), CgOperand::Imm(8)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B32,
                vec![CgOperand::def(cnt), CgOperand::Imm(2)],
            ),
        );
        // shift sequence names RCX explicitly
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Mov,
                OpWidth::B32,
                vec![CgOperand::def(regs::RCX), CgOperand::use_(cnt)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Shl,
                OpWidth::B32,
                vec![CgOperand::def(v), CgOperand::use_(regs::RCX)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Mov,
                OpWidth::B32,
                vec![CgOperand::def(shifted), CgOperand::use_(v)],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg, &rci()).unwrap();

        // v spans the RCX-using shift, so it must not be in RCX
        let first = &cg.block(entry).insts[0];
        let def = first.defs().next().unwrap();
        assert_ne!(def, regs::RCX);
    }

    /// Force spilling by keeping more values live than allocatable GPRs.
    #[test]
    fn test_high_pressure_spills_through_scratch() {
        let mut cg = CgFunction::new(0);
        let entry = cg.create_block();
        cg.append_block(entry);
        let count = 16;
        let vregs: Vec<CgReg> = (0..count)
            .map(|_| cg.create_vreg(RegClass::Gpr, OpWidth::B64))
            .collect();
        for (i, &v) in vregs.iter().enumerate() {
            cg.push_inst(
                entry,
                CgInst::new(
                    X64Op::MovImm,
                    OpWidth::B64,
                    vec![CgOperand::def(v), CgOperand::Imm(i as i64)],
                ),
            );
        }
        // use them all afterwards so every interval spans the block
        let sum = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B64,
                vec![CgOperand::def(sum), CgOperand::Imm(0)],
            ),
        );
        for &v in &vregs {
            cg.push_inst(
                entry,
                CgInst::new(
                    X64Op::Add,
                    OpWidth::B64,
                    vec![CgOperand::def(sum), CgOperand::use_(v)],
                ),
            );
        }
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg, &rci()).unwrap();

        // some values spilled, and spill traffic uses the scratch registers
        assert!(cg.frame.num_objects() > 0);
        let uses_scratch = cg.block(entry).insts.iter().any(|inst| {
            inst.operands.iter().any(|opnd| {
                matches!(opnd, CgOperand::Reg { reg, .. } if *reg == regs::R10 || *reg == regs::R11)
            })
        });
        assert!(uses_scratch);
        // no virtual registers remain
        for inst in &cg.block(entry).insts {
            for opnd in &inst.operands {
                if let CgOperand::Reg { reg, .. } = opnd {
                    assert!(reg.is_physical());
                }
            }
        }
    }

    /// Values in memory operands are rewritten too.
    #[test]
    fn test_mem_operand_rewritten() {
        let mut cg = CgFunction::new(0);
        let entry = cg.create_block();
        cg.append_block(entry);
        let base = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        let val = cg.create_vreg(RegClass::Gpr, OpWidth::B64);
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::MovImm,
                OpWidth::B64,
                vec![CgOperand::def(base), CgOperand::Imm(0x1000)],
            ),
        );
        cg.push_inst(
            entry,
            CgInst::new(
                X64Op::Mov,
                OpWidth::B64,
                vec![
                    CgOperand::def(val),
                    CgOperand::Mem(MemRef::base_disp(base, 8)),
                ],
            ),
        );
        cg.push_inst(entry, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        run(&mut cg, &rci()).unwrap();

        let load = &cg.block(entry).insts[1];
        match load.operands[1] {
            CgOperand::Mem(mem) => assert!(mem.base.is_physical()),
            ref other => panic!("expected mem operand, got {:?}", other),
        }
    }
}
