//! MIR instructions
//!
//! A tagged sum over the opcode set. Every instruction carries its result
//! type; statements produce no value and sit in block statement lists, while
//! expressions form operand trees referenced by `InstId`.

use crate::arena::{BlockId, ConstId, InstId, TypeId};
use crate::function::VarIdx;

/// Unary operators (integer bit counts and float math).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Clz,
    Ctz,
    Popcnt,
    FpAbs,
    FpNeg,
    FpSqrt,
    FpRoundCeil,
    FpRoundFloor,
    FpRoundTrunc,
    FpRoundNearest,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Clz => "clz",
            UnaryOp::Ctz => "ctz",
            UnaryOp::Popcnt => "popcnt",
            UnaryOp::FpAbs => "fpabs",
            UnaryOp::FpNeg => "fpneg",
            UnaryOp::FpSqrt => "fpsqrt",
            UnaryOp::FpRoundCeil => "fpround_ceil",
            UnaryOp::FpRoundFloor => "fpround_floor",
            UnaryOp::FpRoundTrunc => "fpround_trunc",
            UnaryOp::FpRoundNearest => "fpround_nearest",
        }
    }
}

/// Binary operators. Shifts take the count in the second operand; rotates
/// are full-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    FpAdd,
    FpSub,
    FpMul,
    FpDiv,
    FpMin,
    FpMax,
    FpCopysign,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::DivS => "sdiv",
            BinaryOp::DivU => "udiv",
            BinaryOp::RemS => "srem",
            BinaryOp::RemU => "urem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::ShrS => "sshr",
            BinaryOp::ShrU => "ushr",
            BinaryOp::Rotl => "rotl",
            BinaryOp::Rotr => "rotr",
            BinaryOp::FpAdd => "fpadd",
            BinaryOp::FpSub => "fpsub",
            BinaryOp::FpMul => "fpmul",
            BinaryOp::FpDiv => "fpdiv",
            BinaryOp::FpMin => "fpmin",
            BinaryOp::FpMax => "fpmax",
            BinaryOp::FpCopysign => "fpcopysign",
        }
    }
}

/// Comparison predicates: IEEE ordered/unordered float forms followed by the
/// signed/unsigned integer forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPredicate {
    FFalse,
    FOeq,
    FOgt,
    FOge,
    FOlt,
    FOle,
    FOne,
    FOrd,
    FUno,
    FUeq,
    FUgt,
    FUge,
    FUlt,
    FUle,
    FUne,
    FTrue,
    IEq,
    INe,
    IUgt,
    IUge,
    IUlt,
    IUle,
    ISgt,
    ISge,
    ISlt,
    ISle,
}

impl CmpPredicate {
    pub fn name(self) -> &'static str {
        match self {
            CmpPredicate::FFalse => "ffalse",
            CmpPredicate::FOeq => "foeq",
            CmpPredicate::FOgt => "fogt",
            CmpPredicate::FOge => "foge",
            CmpPredicate::FOlt => "folt",
            CmpPredicate::FOle => "fole",
            CmpPredicate::FOne => "fone",
            CmpPredicate::FOrd => "ford",
            CmpPredicate::FUno => "funo",
            CmpPredicate::FUeq => "fueq",
            CmpPredicate::FUgt => "fugt",
            CmpPredicate::FUge => "fuge",
            CmpPredicate::FUlt => "fult",
            CmpPredicate::FUle => "fule",
            CmpPredicate::FUne => "fune",
            CmpPredicate::FTrue => "ftrue",
            CmpPredicate::IEq => "ieq",
            CmpPredicate::INe => "ine",
            CmpPredicate::IUgt => "iugt",
            CmpPredicate::IUge => "iuge",
            CmpPredicate::IUlt => "iult",
            CmpPredicate::IUle => "iule",
            CmpPredicate::ISgt => "isgt",
            CmpPredicate::ISge => "isge",
            CmpPredicate::ISlt => "islt",
            CmpPredicate::ISle => "isle",
        }
    }

    pub fn is_float(self) -> bool {
        (self as u8) <= (CmpPredicate::FTrue as u8)
    }
}

/// Conversion operators, including the wasm-specialized trapping
/// float-to-int forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    IntToPtr,
    PtrToInt,
    Trunc,
    Sext,
    Uext,
    FpTrunc,
    FpExt,
    SiToFp,
    UiToFp,
    Bitcast,
    WasmFpToSi,
    WasmFpToUi,
}

impl ConvOp {
    pub fn name(self) -> &'static str {
        match self {
            ConvOp::IntToPtr => "inttoptr",
            ConvOp::PtrToInt => "ptrtoint",
            ConvOp::Trunc => "trunc",
            ConvOp::Sext => "sext",
            ConvOp::Uext => "uext",
            ConvOp::FpTrunc => "fptrunc",
            ConvOp::FpExt => "fpext",
            ConvOp::SiToFp => "sitofp",
            ConvOp::UiToFp => "uitofp",
            ConvOp::Bitcast => "bitcast",
            ConvOp::WasmFpToSi => "wasm_fptosi",
            ConvOp::WasmFpToUi => "wasm_fptoui",
        }
    }
}

/// Checked-arithmetic operators branching to the integer-overflow set block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverflowOp {
    SaddOverflow,
    UaddOverflow,
    SsubOverflow,
    UsubOverflow,
    SmulOverflow,
    UmulOverflow,
}

impl OverflowOp {
    pub fn name(self) -> &'static str {
        match self {
            OverflowOp::SaddOverflow => "wasm_sadd_overflow",
            OverflowOp::UaddOverflow => "wasm_uadd_overflow",
            OverflowOp::SsubOverflow => "wasm_ssub_overflow",
            OverflowOp::UsubOverflow => "wasm_usub_overflow",
            OverflowOp::SmulOverflow => "wasm_smul_overflow",
            OverflowOp::UmulOverflow => "wasm_umul_overflow",
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            OverflowOp::SaddOverflow | OverflowOp::SsubOverflow | OverflowOp::SmulOverflow
        )
    }
}

/// 128-bit checked-arithmetic operators over lo/hi register pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverflowI128Op {
    Sadd128Overflow,
    Uadd128Overflow,
    Ssub128Overflow,
    Usub128Overflow,
}

impl OverflowI128Op {
    pub fn name(self) -> &'static str {
        match self {
            OverflowI128Op::Sadd128Overflow => "wasm_sadd128_overflow",
            OverflowI128Op::Uadd128Overflow => "wasm_uadd128_overflow",
            OverflowI128Op::Ssub128Overflow => "wasm_ssub128_overflow",
            OverflowI128Op::Usub128Overflow => "wasm_usub128_overflow",
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            OverflowI128Op::Sadd128Overflow | OverflowI128Op::Ssub128Overflow
        )
    }
}

/// Instruction payload.
#[derive(Debug, Clone)]
pub enum InstKind {
    Unary {
        op: UnaryOp,
        opnd: InstId,
    },
    Binary {
        op: BinaryOp,
        lhs: InstId,
        rhs: InstId,
    },
    Cmp {
        pred: CmpPredicate,
        lhs: InstId,
        rhs: InstId,
    },
    Select {
        cond: InstId,
        tval: InstId,
        fval: InstId,
    },
    Const(ConstId),
    /// Read a variable.
    Dread(VarIdx),
    /// Assign an expression to a variable.
    Dassign {
        value: InstId,
        var: VarIdx,
    },
    /// Load `src_ty` from `base + index*scale + offset`, optionally
    /// sign-extending to the instruction's result type.
    Load {
        src_ty: TypeId,
        base: Option<InstId>,
        index: Option<InstId>,
        scale: u8,
        offset: i32,
        sext: bool,
    },
    /// Store `value` to `base + index*scale + offset`.
    Store {
        value: InstId,
        base: InstId,
        index: Option<InstId>,
        scale: u8,
        offset: i32,
    },
    /// Direct call by function index within the module.
    Call {
        callee: u32,
        args: Vec<InstId>,
    },
    /// Indirect call through an address expression.
    ICall {
        callee: InstId,
        args: Vec<InstId>,
    },
    Conv {
        op: ConvOp,
        opnd: InstId,
    },
    Br {
        target: BlockId,
    },
    BrIf {
        cond: InstId,
        true_block: BlockId,
        false_block: Option<BlockId>,
    },
    Switch {
        cond: InstId,
        default: BlockId,
        /// Case value (a `Const` instruction) and its target.
        cases: Vec<(InstId, BlockId)>,
    },
    Return {
        value: Option<InstId>,
    },
    Unreachable,
    /// Bounds check: `zext(base) + offset` against `zext(boundary)`,
    /// branching to the out-of-bounds set block on failure. `offset` already
    /// includes the access size.
    WasmCheckMemoryAccess {
        base: Option<InstId>,
        boundary: InstId,
        offset: u64,
    },
    /// Compare SP against the instance stack boundary, branching to the
    /// call-stack-exhausted set block on failure.
    WasmCheckStackBoundary {
        boundary: InstId,
    },
    /// Probe `[sp - guard]` so a hardware fault fires on stack overflow.
    WasmVisitStackGuard,
    Overflow {
        op: OverflowOp,
        lhs: InstId,
        rhs: InstId,
    },
    OverflowI128 {
        op: OverflowI128Op,
        lhs_lo: InstId,
        lhs_hi: InstId,
        rhs_lo: InstId,
        rhs_hi: InstId,
    },
}

/// An instruction: opcode payload, result type, statement flag.
#[derive(Debug, Clone)]
pub struct MirInst {
    pub kind: InstKind,
    pub ty: TypeId,
    pub is_stmt: bool,
}

impl MirInst {
    pub fn new(kind: InstKind, ty: TypeId, is_stmt: bool) -> Self {
        MirInst { kind, ty, is_stmt }
    }

    /// Whether this instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Br { .. }
                | InstKind::BrIf { .. }
                | InstKind::Switch { .. }
                | InstKind::Return { .. }
                | InstKind::Unreachable
        )
    }
}
