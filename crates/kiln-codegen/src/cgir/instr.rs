//! CGIR instructions
//!
//! An instruction is a target opcode, an operand width, and an operand list
//! with defs first. Two-address opcodes read their first (def) operand too.

use crate::x64::opcode::X64Op;

use super::operand::{CgOperand, CgReg, OpWidth};

#[derive(Debug, Clone)]
pub struct CgInst {
    pub op: X64Op,
    pub width: OpWidth,
    pub operands: Vec<CgOperand>,
}

impl CgInst {
    pub fn new(op: X64Op, width: OpWidth, operands: Vec<CgOperand>) -> Self {
        CgInst {
            op,
            width,
            operands,
        }
    }

    /// Registers written by this instruction (explicit operands only).
    pub fn defs(&self) -> impl Iterator<Item = CgReg> + '_ {
        self.operands.iter().filter_map(|opnd| match opnd {
            CgOperand::Reg { reg, is_def: true } => Some(*reg),
            _ => None,
        })
    }

    /// Registers read by this instruction, including memory address
    /// components and the tied first operand of two-address opcodes.
    pub fn uses(&self) -> Vec<CgReg> {
        let mut out = Vec::new();
        for (i, opnd) in self.operands.iter().enumerate() {
            match opnd {
                CgOperand::Reg { reg, is_def } => {
                    if !is_def || (i == 0 && self.op.is_two_address()) {
                        out.push(*reg);
                    }
                }
                CgOperand::Mem(mem) => {
                    out.push(mem.base);
                    if let Some(index) = mem.index {
                        out.push(index);
                    }
                }
                _ => {}
            }
        }
        out
    }

    pub fn branch_target(&self) -> Option<super::block::CgBlockId> {
        self.operands.iter().find_map(|opnd| opnd.block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgir::operand::MemRef;

    #[test]
    fn test_two_address_def_is_also_use() {
        let dst = CgReg::virt(0);
        let src = CgReg::virt(1);
        let inst = CgInst::new(
            X64Op::Add,
            OpWidth::B32,
            vec![CgOperand::def(dst), CgOperand::use_(src)],
        );
        assert_eq!(inst.defs().collect::<Vec<_>>(), vec![dst]);
        assert_eq!(inst.uses(), vec![dst, src]);
    }

    #[test]
    fn test_mem_operand_registers_are_uses() {
        let dst = CgReg::virt(0);
        let base = CgReg::virt(1);
        let index = CgReg::virt(2);
        let inst = CgInst::new(
            X64Op::Mov,
            OpWidth::B64,
            vec![
                CgOperand::def(dst),
                CgOperand::Mem(MemRef {
                    base,
                    index: Some(index),
                    scale: 1,
                    disp: 16,
                }),
            ],
        );
        assert_eq!(inst.uses(), vec![base, index]);
    }
}
