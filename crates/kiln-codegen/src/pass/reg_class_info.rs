//! Register-class allocation info
//!
//! Computes the preferred allocation order per register class with reserved
//! registers filtered out: volatile registers first, then callee-saved
//! aliases in the target's CSR order. Cached results are invalidated by a
//! tag bump whenever the reserved set or the CSR list changes.

use crate::cgir::function::CgFunction;
use crate::cgir::operand::{CgReg, RegClass};
use crate::x64::regs;

/// Per-class allocation order and cost summary.
#[derive(Debug, Clone, Default)]
pub struct RCInfo {
    pub order: Vec<CgReg>,
    pub num_regs: usize,
    pub min_cost: u8,
    /// Index of the last point in `order` where the register cost changes.
    pub last_cost_change: usize,
    /// Whether filtering left this class smaller than its raw register set.
    pub proper_subclass: bool,
    tag: u32,
}

#[derive(Debug)]
pub struct RegClassInfo {
    gpr: RCInfo,
    fpr: RCInfo,
    reserved: Vec<CgReg>,
    callee_saved: Vec<CgReg>,
    tag: u32,
}

impl RegClassInfo {
    pub fn new() -> Self {
        RegClassInfo {
            gpr: RCInfo::default(),
            fpr: RCInfo::default(),
            reserved: Vec::new(),
            callee_saved: Vec::new(),
            tag: 0,
        }
    }

    /// Refresh for a function; recomputes only when the reserved set or the
    /// CSR list differs from the cached ones.
    pub fn run_on_function(&mut self, _func: &CgFunction) {
        self.update(regs::RESERVED.to_vec(), regs::CALLEE_SAVED.to_vec());
    }

    pub fn update(&mut self, reserved: Vec<CgReg>, callee_saved: Vec<CgReg>) {
        if reserved != self.reserved || callee_saved != self.callee_saved {
            self.reserved = reserved;
            self.callee_saved = callee_saved;
            self.tag += 1;
        }
        if self.gpr.tag != self.tag {
            self.gpr = self.compute(RegClass::Gpr);
        }
        if self.fpr.tag != self.tag {
            self.fpr = self.compute(RegClass::Fpr);
        }
    }

    pub fn order(&self, class: RegClass) -> &RCInfo {
        match class {
            RegClass::Gpr => &self.gpr,
            RegClass::Fpr => &self.fpr,
        }
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    fn compute(&self, class: RegClass) -> RCInfo {
        let raw = regs::raw_allocation_order(class);
        let raw_len = raw.len();

        let mut order = Vec::new();
        let mut csr_aliases = Vec::new();
        let mut min_cost = u8::MAX;
        let mut last_cost = u16::MAX;
        let mut last_cost_change = 0;

        for reg in raw {
            if self.reserved.contains(&reg) {
                continue;
            }
            let cost = regs::reg_cost(reg);
            min_cost = min_cost.min(cost);
            if self.callee_saved.contains(&reg) {
                // aliases a CSR: placed after the volatile registers
                csr_aliases.push(reg);
            } else {
                if cost as u16 != last_cost {
                    last_cost_change = order.len();
                }
                order.push(reg);
                last_cost = cost as u16;
            }
        }
        for reg in csr_aliases {
            let cost = regs::reg_cost(reg);
            if cost as u16 != last_cost {
                last_cost_change = order.len();
            }
            order.push(reg);
            last_cost = cost as u16;
        }

        let num_regs = order.len();
        RCInfo {
            order,
            num_regs,
            min_cost: if min_cost == u8::MAX { 0 } else { min_cost },
            last_cost_change,
            proper_subclass: num_regs < raw_len,
            tag: self.tag,
        }
    }
}

impl Default for RegClassInfo {
    fn default() -> Self {
        RegClassInfo::new()
    }
}
