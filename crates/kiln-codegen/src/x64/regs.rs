//! x86-64 register definitions
//!
//! One flat numbering: GPRs 0..15, XMM registers 16..31. RSP and RBP are
//! reserved; R10/R11 and XMM14/XMM15 are lowering scratch and never
//! allocated.

use crate::cgir::operand::{CgReg, RegClass};

pub const RAX: CgReg = CgReg(0);
pub const RCX: CgReg = CgReg(1);
pub const RDX: CgReg = CgReg(2);
pub const RBX: CgReg = CgReg(3);
pub const RSP: CgReg = CgReg(4);
pub const RBP: CgReg = CgReg(5);
pub const RSI: CgReg = CgReg(6);
pub const RDI: CgReg = CgReg(7);
pub const R8: CgReg = CgReg(8);
pub const R9: CgReg = CgReg(9);
pub const R10: CgReg = CgReg(10);
pub const R11: CgReg = CgReg(11);
pub const R12: CgReg = CgReg(12);
pub const R13: CgReg = CgReg(13);
pub const R14: CgReg = CgReg(14);
pub const R15: CgReg = CgReg(15);

pub const XMM_BASE: u32 = 16;

pub const fn xmm(n: u32) -> CgReg {
    CgReg(XMM_BASE + n)
}

pub const XMM0: CgReg = xmm(0);
pub const XMM1: CgReg = xmm(1);
pub const XMM14: CgReg = xmm(14);
pub const XMM15: CgReg = xmm(15);

pub const NUM_PHYS_REGS: u32 = 32;

/// Guard space below SP probed by the stack-guard pseudo.
pub const STACK_GUARD_SIZE: i32 = 4096;

/// System-V integer argument registers, in order.
pub const INT_ARG_REGS: [CgReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// System-V float argument registers, in order.
pub const FLOAT_ARG_REGS: [CgReg; 8] = [
    xmm(0),
    xmm(1),
    xmm(2),
    xmm(3),
    xmm(4),
    xmm(5),
    xmm(6),
    xmm(7),
];

/// Callee-saved registers in target save order. RBP is reserved as the frame
/// pointer and handled by the prolog directly.
pub const CALLEE_SAVED: [CgReg; 5] = [RBX, R12, R13, R14, R15];

/// Registers never available to the allocator.
pub const RESERVED: [CgReg; 6] = [RSP, RBP, R10, R11, XMM14, XMM15];

pub fn class_of(reg: CgReg) -> RegClass {
    if reg.0 < XMM_BASE {
        RegClass::Gpr
    } else {
        RegClass::Fpr
    }
}

pub fn is_callee_saved(reg: CgReg) -> bool {
    CALLEE_SAVED.contains(&reg)
}

pub fn is_reserved(reg: CgReg) -> bool {
    RESERVED.contains(&reg)
}

/// Caller-saved (clobbered across calls).
pub fn is_volatile(reg: CgReg) -> bool {
    !is_callee_saved(reg) && reg != RSP && reg != RBP
}

/// Raw allocation order per class, before reserved filtering: volatile
/// registers first, then the callee-saved aliases in target order.
pub fn raw_allocation_order(class: RegClass) -> Vec<CgReg> {
    match class {
        RegClass::Gpr => vec![
            RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11, RBX, R12, R13, R14, R15,
        ],
        RegClass::Fpr => (0..16).map(xmm).collect(),
    }
}

/// Allocation cost per register; CSRs cost more than volatiles because they
/// force a save/restore in the prolog.
pub fn reg_cost(reg: CgReg) -> u8 {
    if is_callee_saved(reg) {
        1
    } else {
        0
    }
}

/// Name for diagnostics.
pub fn reg_name(reg: CgReg) -> String {
    const GPR_NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    if reg.is_virtual() {
        format!("v{}", reg.virt_index())
    } else if reg.0 < XMM_BASE {
        GPR_NAMES[reg.0 as usize].to_string()
    } else {
        format!("xmm{}", reg.0 - XMM_BASE)
    }
}
