//! x86-64 opcodes
//!
//! Typed opcodes consumed by the external byte encoder. ALU opcodes are
//! two-address: the first operand is both written and read. Scalar SSE
//! opcodes select the ss/sd form from the instruction width.

/// x86 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondCode {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl CondCode {
    /// The condition with inverted sense.
    pub fn inverted(self) -> CondCode {
        match self {
            CondCode::O => CondCode::No,
            CondCode::No => CondCode::O,
            CondCode::B => CondCode::Ae,
            CondCode::Ae => CondCode::B,
            CondCode::E => CondCode::Ne,
            CondCode::Ne => CondCode::E,
            CondCode::Be => CondCode::A,
            CondCode::A => CondCode::Be,
            CondCode::S => CondCode::Ns,
            CondCode::Ns => CondCode::S,
            CondCode::P => CondCode::Np,
            CondCode::Np => CondCode::P,
            CondCode::L => CondCode::Ge,
            CondCode::Ge => CondCode::L,
            CondCode::Le => CondCode::G,
            CondCode::G => CondCode::Le,
        }
    }
}

/// Rounding modes for ROUNDSS / ROUNDSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundingMode {
    Nearest,
    Down,
    Up,
    Zero,
}

/// Source width for widening moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtWidth {
    B8,
    B16,
    B32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X64Op {
    // ===== Moves =====
    Mov,
    MovImm,
    MovZx(ExtWidth),
    MovSx(ExtWidth),
    Lea,

    // ===== Integer ALU (two-address) =====
    Add,
    Adc,
    Sub,
    Sbb,
    Imul,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,

    // ===== Bit scans (dst, src) =====
    Bsr,
    Bsf,

    // ===== Division helpers =====
    /// CDQ / CQO by width: sign-extend RAX into RDX.
    Cdq,
    /// Signed divide of RDX:RAX by the operand.
    Idiv,
    /// Unsigned divide of RDX:RAX by the operand.
    Div,
    /// Unsigned one-operand multiply into RDX:RAX; CF/OF on overflow.
    Mul,

    // ===== Flags =====
    Cmp,
    Test,
    Setcc(CondCode),
    Cmovcc(CondCode),

    // ===== Control =====
    Jcc(CondCode),
    Jmp,
    Call,
    Ret,
    Push,
    Pop,
    Ud2,

    // ===== SSE scalar (two-address where applicable) =====
    Movs,
    Adds,
    Subs,
    Muls,
    Divs,
    Sqrts,
    Rounds(RoundingMode),
    Ucomis,
    /// Packed bitwise forms used for sign tricks on scalars.
    Andps,
    Orps,
    Xorps,
    /// CVTTSS2SI / CVTTSD2SI; `to64` selects the 64-bit destination form.
    Cvttf2i { to64: bool },
    /// CVTSI2SS / CVTSI2SD; `from64` selects the 64-bit source form.
    Cvti2f { from64: bool },
    /// CVTSS2SD / CVTSD2SS; direction from the instruction width (dest).
    Cvtf2f,
    /// MOVD/MOVQ GPR→XMM.
    MovGprToFp,
    /// MOVD/MOVQ XMM→GPR.
    MovFpToGpr,

    // ===== Frame pseudos, erased by prolog/epilog insertion =====
    CallFrameSetup,
    CallFrameDestroy,
}

impl X64Op {
    /// Two-address ALU forms: the first operand is read and written.
    pub fn is_two_address(self) -> bool {
        matches!(
            self,
            X64Op::Add
                | X64Op::Adc
                | X64Op::Sub
                | X64Op::Sbb
                | X64Op::Imul
                | X64Op::And
                | X64Op::Or
                | X64Op::Xor
                | X64Op::Not
                | X64Op::Neg
                | X64Op::Shl
                | X64Op::Shr
                | X64Op::Sar
                | X64Op::Rol
                | X64Op::Ror
                | X64Op::Cmovcc(_)
                | X64Op::Adds
                | X64Op::Subs
                | X64Op::Muls
                | X64Op::Divs
                | X64Op::Andps
                | X64Op::Orps
                | X64Op::Xorps
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(self, X64Op::Cmp | X64Op::Test | X64Op::Ucomis)
    }

    pub fn is_unconditional_branch(self) -> bool {
        matches!(self, X64Op::Jmp)
    }

    pub fn is_branch(self) -> bool {
        matches!(self, X64Op::Jmp | X64Op::Jcc(_))
    }

    pub fn is_call(self) -> bool {
        matches!(self, X64Op::Call)
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, X64Op::Jmp | X64Op::Ret | X64Op::Ud2)
    }
}
