//! x86-64 peephole rewrites
//!
//! Two rewrites, both flag-safe:
//! - an unconditional branch to the layout successor is deleted;
//! - `cmp/test → setcc cc → test r,r → jne` becomes `cmp/test → jcc cc`.

use crate::cgir::{CgBlockId, CgFunction, CgOperand};
use crate::pass::peephole::PeepholeHooks;
use crate::x64::opcode::{CondCode, X64Op};

pub struct X64Peephole;

impl PeepholeHooks for X64Peephole {
    fn peephole_block_end(cg: &mut CgFunction, block: CgBlockId) {
        let Some(last) = cg.block(block).insts.last() else {
            return;
        };
        if !last.op.is_unconditional_branch() {
            return;
        }
        let Some(target) = last.branch_target() else {
            return;
        };
        if cg.layout_successor(block) == Some(target) {
            cg.block_mut(block).insts.pop();
        }
    }

    fn peephole_inst(cg: &mut CgFunction, block: CgBlockId, index: usize) {
        if !cg.block(block).insts[index].op.is_compare() {
            return;
        }
        optimize_cmp(cg, block, index);
    }
}

/// cmp/test -> setcc cond -> test -> jne, optimized to: cmp/test -> jcc cond
fn optimize_cmp(cg: &mut CgFunction, block: CgBlockId, index: usize) {
    let insts = &cg.block(block).insts;
    let Some(setcc) = insts.get(index + 1) else {
        return;
    };
    let X64Op::Setcc(cc) = setcc.op else {
        return;
    };
    let Some(flag_reg) = setcc.operands.first().and_then(|o| o.reg()) else {
        return;
    };

    let Some(test) = insts.get(index + 2) else {
        return;
    };
    if test.op != X64Op::Test {
        return;
    }
    let both_flag = test.operands.len() == 2
        && test.operands[0].reg() == Some(flag_reg)
        && test.operands[1].reg() == Some(flag_reg);
    if !both_flag {
        return;
    }

    let Some(jcc) = insts.get(index + 3) else {
        return;
    };
    let X64Op::Jcc(jcc_cc) = jcc.op else {
        return;
    };
    if jcc_cc != CondCode::Ne {
        return;
    }

    let insts = &mut cg.block_mut(block).insts;
    insts.remove(index + 2);
    insts.remove(index + 1);
    insts[index + 1].op = X64Op::Jcc(cc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgir::{CgInst, CgReg, OpWidth, RegClass};
    use crate::pass::peephole;

    fn block_with(cg: &mut CgFunction) -> CgBlockId {
        let b = cg.create_block();
        cg.append_block(b);
        b
    }

    fn cmp_setcc_test_jne(cg: &mut CgFunction, block: CgBlockId, cc: CondCode, target: CgBlockId) -> CgReg {
        let a = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        let b = cg.create_vreg(RegClass::Gpr, OpWidth::B32);
        let flag = cg.create_vreg(RegClass::Gpr, OpWidth::B8);
        cg.push_inst(
            block,
            CgInst::new(
                X64Op::Cmp,
                OpWidth::B32,
                vec![CgOperand::use_(a), CgOperand::use_(b)],
            ),
        );
        cg.push_inst(
            block,
            CgInst::new(X64Op::Setcc(cc), OpWidth::B8, vec![CgOperand::def(flag)]),
        );
        cg.push_inst(
            block,
            CgInst::new(
                X64Op::Test,
                OpWidth::B8,
                vec![CgOperand::use_(flag), CgOperand::use_(flag)],
            ),
        );
        cg.push_inst(
            block,
            CgInst::new(
                X64Op::Jcc(CondCode::Ne),
                OpWidth::B64,
                vec![CgOperand::Block(target)],
            ),
        );
        flag
    }

    #[test]
    fn test_cmp_setcc_test_jne_rewrite() {
        let mut cg = CgFunction::new(0);
        let entry = block_with(&mut cg);
        let target = block_with(&mut cg);
        cmp_setcc_test_jne(&mut cg, entry, CondCode::L, target);
        cg.add_successor(entry, target);

        peephole::run::<X64Peephole>(&mut cg);

        let insts = &cg.block(entry).insts;
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].op, X64Op::Cmp);
        assert_eq!(insts[1].op, X64Op::Jcc(CondCode::L));
        assert_eq!(insts[1].branch_target(), Some(target));
    }

    #[test]
    fn test_rewrite_requires_jne() {
        let mut cg = CgFunction::new(0);
        let entry = block_with(&mut cg);
        let target = block_with(&mut cg);
        cmp_setcc_test_jne(&mut cg, entry, CondCode::L, target);
        // change the final branch to JE: pattern must not fire
        let last = cg.block_mut(entry).insts.last_mut().unwrap();
        last.op = X64Op::Jcc(CondCode::E);

        peephole::run::<X64Peephole>(&mut cg);
        assert_eq!(cg.block(entry).insts.len(), 4);
    }

    #[test]
    fn test_rewrite_requires_matching_test_reg() {
        let mut cg = CgFunction::new(0);
        let entry = block_with(&mut cg);
        let target = block_with(&mut cg);
        cmp_setcc_test_jne(&mut cg, entry, CondCode::G, target);
        // retarget the test at a different register
        let other = cg.create_vreg(RegClass::Gpr, OpWidth::B8);
        cg.block_mut(entry).insts[2].operands = vec![CgOperand::use_(other), CgOperand::use_(other)];

        peephole::run::<X64Peephole>(&mut cg);
        assert_eq!(cg.block(entry).insts.len(), 4);
    }

    #[test]
    fn test_branch_to_fallthrough_removed() {
        let mut cg = CgFunction::new(0);
        let first = block_with(&mut cg);
        let second = block_with(&mut cg);
        cg.add_successor(first, second);
        cg.push_inst(
            first,
            CgInst::new(X64Op::Jmp, OpWidth::B64, vec![CgOperand::Block(second)]),
        );
        cg.push_inst(second, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        peephole::run::<X64Peephole>(&mut cg);
        assert!(cg.block(first).insts.is_empty());
    }

    #[test]
    fn test_branch_to_non_fallthrough_kept() {
        let mut cg = CgFunction::new(0);
        let first = block_with(&mut cg);
        let skipped = block_with(&mut cg);
        let target = block_with(&mut cg);
        cg.add_successor(first, target);
        cg.push_inst(
            first,
            CgInst::new(X64Op::Jmp, OpWidth::B64, vec![CgOperand::Block(target)]),
        );
        cg.push_inst(skipped, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));
        cg.push_inst(target, CgInst::new(X64Op::Ret, OpWidth::B64, vec![]));

        peephole::run::<X64Peephole>(&mut cg);
        assert_eq!(cg.block(first).insts.len(), 1);
    }
}
