//! Pretty-printing for MIR
//!
//! Emits the textual MIR form consumed by `text::parser`. Expression trees
//! print inline inside their statements. Instructions with no textual
//! grammar (the wasm pseudo ops) print in the same `op(...)` shape for
//! diagnostics only.

use std::fmt::{self, Write};

use crate::arena::{InstId, TypeId};
use crate::context::CompileContext;
use crate::constant::MirConst;
use crate::function::MirFunction;
use crate::instr::InstKind;
use crate::module::MirModule;
use crate::types::MirType;

const INDENT: &str = "  ";

/// Render a type in its textual spelling.
pub fn type_name(ctx: &CompileContext, ty: TypeId) -> String {
    match ctx.types.get(ty) {
        MirType::I8 => "i8".to_string(),
        MirType::I16 => "i16".to_string(),
        MirType::I32 => "i32".to_string(),
        MirType::I64 => "i64".to_string(),
        MirType::F32 => "f32".to_string(),
        MirType::F64 => "f64".to_string(),
        MirType::Void => "void".to_string(),
        MirType::Ptr { elem, addr_space } => {
            if *addr_space == 0 {
                format!("{}*", type_name(ctx, *elem))
            } else {
                format!("{}*({})", type_name(ctx, *elem), addr_space)
            }
        }
        MirType::Func { ret, params } => {
            let mut s = String::from("(");
            for (i, p) in params.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str(&type_name(ctx, *p));
            }
            s.push(')');
            if *ret != crate::types::TypeInterner::VOID {
                s.push_str(" -> ");
                s.push_str(&type_name(ctx, *ret));
            }
            s
        }
    }
}

/// Display adaptor for a function.
pub struct DisplayFunction<'a> {
    pub func: &'a MirFunction,
    pub ctx: &'a CompileContext,
}

/// Display adaptor for a whole module.
pub struct DisplayModule<'a> {
    pub module: &'a MirModule,
    pub ctx: &'a CompileContext,
}

impl MirFunction {
    pub fn display<'a>(&'a self, ctx: &'a CompileContext) -> DisplayFunction<'a> {
        DisplayFunction { func: self, ctx }
    }
}

impl MirModule {
    pub fn display<'a>(&'a self, ctx: &'a CompileContext) -> DisplayModule<'a> {
        DisplayModule { module: self, ctx }
    }
}

impl fmt::Display for DisplayModule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for func in self.module.functions() {
            write!(f, "{}", func.display(self.ctx))?;
        }
        Ok(())
    }
}

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        let ctx = self.ctx;
        writeln!(
            f,
            "func %{} {} {{",
            func.func_idx,
            type_name(ctx, func.ty)
        )?;
        for var in func.variables() {
            writeln!(f, "{}var ${} {}", INDENT, var.idx, type_name(ctx, var.ty))?;
        }
        for &block_id in func.layout() {
            writeln!(f, "@{}:", block_id.0)?;
            for &stmt in &func.block(block_id).stmts {
                let mut line = String::new();
                fmt_stmt(&mut line, func, ctx, stmt)?;
                writeln!(f, "{}{}", INDENT, line)?;
            }
        }
        writeln!(f, "}}")
    }
}

fn fmt_stmt(
    out: &mut String,
    func: &MirFunction,
    ctx: &CompileContext,
    id: InstId,
) -> fmt::Result {
    let inst = func.inst(id);
    match &inst.kind {
        InstKind::Dassign { value, var } => {
            write!(out, "${} = ", var)?;
            fmt_expr(out, func, ctx, *value)
        }
        InstKind::Br { target } => write!(out, "br @{}", target.0),
        InstKind::BrIf {
            cond,
            true_block,
            false_block,
        } => {
            write!(out, "br_if ")?;
            fmt_expr(out, func, ctx, *cond)?;
            write!(out, ", @{}", true_block.0)?;
            if let Some(fb) = false_block {
                write!(out, ", @{}", fb.0)?;
            }
            Ok(())
        }
        InstKind::Switch {
            cond,
            default,
            cases,
        } => {
            write!(out, "switch ")?;
            fmt_expr(out, func, ctx, *cond)?;
            write!(out, ", @{} [", default.0)?;
            for (i, (value, block)) in cases.iter().enumerate() {
                if i > 0 {
                    write!(out, ",")?;
                }
                write!(out, " ")?;
                fmt_case_value(out, func, ctx, *value)?;
                write!(out, " -> @{}", block.0)?;
            }
            write!(out, " ]")
        }
        InstKind::Return { value } => {
            write!(out, "return")?;
            if let Some(v) = value {
                write!(out, " ")?;
                fmt_expr(out, func, ctx, *v)?;
            }
            Ok(())
        }
        InstKind::Unreachable => write!(out, "unreachable"),
        InstKind::Store { value, base, .. } => {
            write!(out, "store (")?;
            fmt_expr(out, func, ctx, *base)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *value)?;
            write!(out, ")")
        }
        // statement-form calls
        InstKind::Call { .. } | InstKind::ICall { .. } => fmt_expr(out, func, ctx, id),
        // wasm pseudo statements, dump-only
        InstKind::WasmCheckMemoryAccess { base, boundary, offset } => {
            write!(out, "wasm_check_memory_access (")?;
            if let Some(b) = base {
                fmt_expr(out, func, ctx, *b)?;
                write!(out, ", ")?;
            }
            fmt_expr(out, func, ctx, *boundary)?;
            write!(out, ", {})", offset)
        }
        InstKind::WasmCheckStackBoundary { boundary } => {
            write!(out, "wasm_check_stack_boundary (")?;
            fmt_expr(out, func, ctx, *boundary)?;
            write!(out, ")")
        }
        InstKind::WasmVisitStackGuard => write!(out, "wasm_visit_stack_guard"),
        _ => fmt_expr(out, func, ctx, id),
    }
}

fn fmt_case_value(
    out: &mut String,
    func: &MirFunction,
    ctx: &CompileContext,
    id: InstId,
) -> fmt::Result {
    match &func.inst(id).kind {
        InstKind::Const(c) => fmt_const(out, ctx, *c, false),
        _ => fmt_expr(out, func, ctx, id),
    }
}

fn fmt_const(
    out: &mut String,
    ctx: &CompileContext,
    id: crate::arena::ConstId,
    with_type: bool,
) -> fmt::Result {
    let value = ctx.consts.get(id);
    if with_type {
        write!(out, "const.{} ", type_name(ctx, value.ty()))?;
    }
    match value {
        MirConst::Int { .. } => write!(out, "{}", value.as_i64(&ctx.types)),
        MirConst::Float { bits, ty } => {
            if *ty == crate::types::TypeInterner::F32 {
                write!(out, "{}", f32::from_bits(*bits as u32))
            } else {
                write!(out, "{}", f64::from_bits(*bits))
            }
        }
    }
}

fn fmt_expr(
    out: &mut String,
    func: &MirFunction,
    ctx: &CompileContext,
    id: InstId,
) -> fmt::Result {
    let inst = func.inst(id);
    match &inst.kind {
        InstKind::Dread(var) => write!(out, "${}", var),
        InstKind::Const(c) => fmt_const(out, ctx, *c, true),
        InstKind::Unary { op, opnd } => {
            write!(out, "{}(", op.name())?;
            fmt_expr(out, func, ctx, *opnd)?;
            write!(out, ")")
        }
        InstKind::Binary { op, lhs, rhs } => {
            write!(out, "{}(", op.name())?;
            fmt_expr(out, func, ctx, *lhs)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *rhs)?;
            write!(out, ")")
        }
        InstKind::Cmp { pred, lhs, rhs } => {
            write!(out, "cmp {} (", pred.name())?;
            fmt_expr(out, func, ctx, *lhs)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *rhs)?;
            write!(out, ")")
        }
        InstKind::Select { cond, tval, fval } => {
            write!(out, "select (")?;
            fmt_expr(out, func, ctx, *cond)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *tval)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *fval)?;
            write!(out, ")")
        }
        InstKind::Conv { op, opnd } => {
            write!(out, "{}(", op.name())?;
            fmt_expr(out, func, ctx, *opnd)?;
            write!(out, ")")
        }
        InstKind::Load { base, index, offset, .. } => {
            write!(out, "load (")?;
            let mut first = true;
            if let Some(b) = base {
                fmt_expr(out, func, ctx, *b)?;
                first = false;
            }
            if let Some(i) = index {
                if !first {
                    write!(out, ", ")?;
                }
                fmt_expr(out, func, ctx, *i)?;
                first = false;
            }
            if *offset != 0 || first {
                if !first {
                    write!(out, ", ")?;
                }
                write!(out, "{}", offset)?;
            }
            write!(out, ")")
        }
        InstKind::Call { callee, args } => {
            write!(out, "call %{} (", callee)?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                fmt_expr(out, func, ctx, *arg)?;
            }
            write!(out, ")")
        }
        InstKind::ICall { callee, args } => {
            write!(out, "icall {} (", type_name(ctx, inst.ty))?;
            fmt_expr(out, func, ctx, *callee)?;
            for arg in args {
                write!(out, ", ")?;
                fmt_expr(out, func, ctx, *arg)?;
            }
            write!(out, ")")
        }
        InstKind::Overflow { op, lhs, rhs } => {
            write!(out, "{}(", op.name())?;
            fmt_expr(out, func, ctx, *lhs)?;
            write!(out, ", ")?;
            fmt_expr(out, func, ctx, *rhs)?;
            write!(out, ")")
        }
        InstKind::OverflowI128 {
            op,
            lhs_lo,
            lhs_hi,
            rhs_lo,
            rhs_hi,
        } => {
            write!(out, "{}(", op.name())?;
            for (i, opnd) in [lhs_lo, lhs_hi, rhs_lo, rhs_hi].iter().enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                fmt_expr(out, func, ctx, **opnd)?;
            }
            write!(out, ")")
        }
        other => panic!("statement printed as expression: {:?}", other),
    }
}
