//! MIR text parser
//!
//! Recursive descent over the lexer's token stream. Function and variable
//! indices must be declared densely in order; `@N` block references
//! materialize blocks on first sight; calls to functions declared later are
//! recorded and get their result type after the full parse.

use thiserror::Error;

use crate::arena::{BlockId, InstId, TypeId};
use crate::context::CompileContext;
use crate::function::MirFunction;
use crate::instr::{CmpPredicate, InstKind};
use crate::module::MirModule;
use crate::text::lexer::{Lexer, OpcodeTok, Token, TokenKind};
use crate::types::TypeInterner;
use crate::Phase;

/// Errors from the textual MIR frontend; all carry `Phase::Parsing`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no matched syntax near '{near}'")]
    SyntaxMismatch { near: String },
    #[error("unsupported token '{0}'")]
    UnsupportedToken(String),
    #[error("unexpected type")]
    UnexpectedType,
    #[error("unexpected function index {0}")]
    UnexpectedFuncIdx(u32),
    #[error("unexpected variable index {0}")]
    UnexpectedVarIdx(u32),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
}

impl ParseError {
    pub fn phase(&self) -> Phase {
        Phase::Parsing
    }
}

type Result<T> = std::result::Result<T, ParseError>;

/// Parse a textual MIR module.
pub fn parse_module(ctx: &mut CompileContext, source: &str) -> Result<MirModule> {
    Parser::new(ctx, source)?.parse()
}

struct PendingCall {
    func: usize,
    inst: InstId,
    callee: u32,
}

struct Parser<'ctx, 'src> {
    ctx: &'ctx mut CompileContext,
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    funcs: Vec<MirFunction>,
    func_types: Vec<TypeId>,
    current_block: BlockId,
    pending_calls: Vec<PendingCall>,
}

impl<'ctx, 'src> Parser<'ctx, 'src> {
    fn new(ctx: &'ctx mut CompileContext, source: &'src str) -> Result<Self> {
        let mut parser = Parser {
            ctx,
            lexer: Lexer::new(source),
            previous: Token::eof(),
            current: Token::eof(),
            funcs: Vec::new(),
            func_types: Vec::new(),
            current_block: BlockId(0),
            pending_calls: Vec::new(),
        };
        parser.advance()?;
        Ok(parser)
    }

    fn parse(mut self) -> Result<MirModule> {
        while !self.matches(TokenKind::Eof)? {
            self.consume(TokenKind::KwFunc)?;
            self.consume_func_decl()?;
        }

        // Supplement return types of calls whose callee appeared later.
        for pending in std::mem::take(&mut self.pending_calls) {
            let callee = pending.callee as usize;
            if callee >= self.func_types.len() {
                return Err(ParseError::UnexpectedFuncIdx(pending.callee));
            }
            let ret = self.ctx.types.func_ret(self.func_types[callee]);
            self.funcs[pending.func].inst_mut(pending.inst).ty = ret;
        }

        let mut module = MirModule::new();
        for ty in self.func_types {
            module.add_func_type(ty);
        }
        for func in self.funcs {
            module.add_function(func);
        }
        Ok(module)
    }

    // ==================== Token plumbing ====================

    fn advance(&mut self) -> Result<()> {
        self.previous = self.current;
        self.current = self
            .lexer
            .next_token()
            .map_err(ParseError::UnsupportedToken)?;
        Ok(())
    }

    fn matches(&mut self, kind: TokenKind) -> Result<bool> {
        if self.current.kind != kind {
            return Ok(false);
        }
        self.advance()?;
        Ok(true)
    }

    fn consume(&mut self, kind: TokenKind) -> Result<()> {
        if self.current.kind != kind {
            return Err(self.syntax_error());
        }
        self.advance()
    }

    fn syntax_error(&self) -> ParseError {
        ParseError::SyntaxMismatch {
            near: self.current.text.to_string(),
        }
    }

    fn match_opcode(&mut self) -> Result<Option<OpcodeTok>> {
        if let TokenKind::Opcode(op) = self.current.kind {
            self.advance()?;
            return Ok(Some(op));
        }
        Ok(None)
    }

    // ==================== Shared pieces ====================

    fn consume_index(&mut self) -> Result<u32> {
        self.consume(TokenKind::Number)?;
        self.previous
            .text
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidNumber(self.previous.text.to_string()))
    }

    fn consume_block_index(&mut self) -> Result<u32> {
        self.consume(TokenKind::At)?;
        self.consume_index()
    }

    /// `@N`: create blocks up to `N` on first reference.
    fn consume_block_ref(&mut self) -> Result<BlockId> {
        let idx = self.consume_block_index()?;
        let func = self.func_mut();
        while idx >= func.num_blocks() {
            let block = func.create_block();
            func.append_block(block);
        }
        Ok(BlockId(idx))
    }

    fn consume_func_index(&mut self) -> Result<u32> {
        self.consume(TokenKind::Percent)?;
        self.consume_index()
    }

    /// A primitive type, `void`, or the `void*` pointer spelling.
    fn consume_prim_type(&mut self) -> Result<TypeId> {
        let ty = match self.current.kind {
            TokenKind::Type(ty) => ty,
            _ => return Err(self.syntax_error()),
        };
        self.advance()?;
        if ty == TypeInterner::VOID && self.matches(TokenKind::Star)? {
            return Ok(self.ctx.types.void_ptr());
        }
        Ok(ty)
    }

    fn consume_cmp_predicate(&mut self) -> Result<CmpPredicate> {
        let pred = match self.current.kind {
            TokenKind::CondCode(pred) => pred,
            _ => return Err(self.syntax_error()),
        };
        self.advance()?;
        Ok(pred)
    }

    fn consume_constant(&mut self, ty: TypeId) -> Result<crate::arena::ConstId> {
        self.consume(TokenKind::Number)?;
        let text = self.previous.text;
        let kind = self.ctx.types.get(ty).clone();
        if kind.is_integer() {
            let value = text
                .parse::<i128>()
                .map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
            Ok(self.ctx.consts.int(&self.ctx.types, ty, value as u64))
        } else if ty == TypeInterner::F32 {
            let value = text
                .parse::<f32>()
                .map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
            Ok(self.ctx.consts.f32(value))
        } else if ty == TypeInterner::F64 {
            let value = text
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
            Ok(self.ctx.consts.f64(value))
        } else {
            Err(ParseError::UnexpectedType)
        }
    }

    // ==================== Declarations ====================

    fn consume_func_decl(&mut self) -> Result<()> {
        let idx = self.consume_func_index()?;
        if idx as usize != self.funcs.len() {
            return Err(ParseError::UnexpectedFuncIdx(idx));
        }

        self.funcs.push(MirFunction::new(idx, TypeInterner::VOID));
        self.consume_func_type()?;
        self.consume_func_body()
    }

    fn consume_func_type(&mut self) -> Result<()> {
        self.consume(TokenKind::LPar)?;
        let mut params = Vec::new();
        if !self.matches(TokenKind::RPar)? {
            params.push(self.consume_prim_type()?);
            while !self.matches(TokenKind::RPar)? {
                self.consume(TokenKind::Comma)?;
                params.push(self.consume_prim_type()?);
            }
        }
        let ret = if self.matches(TokenKind::Arrow)? {
            self.consume_prim_type()?
        } else {
            TypeInterner::VOID
        };
        let ty = self.ctx.types.function(ret, params);
        self.func_types.push(ty);
        self.func_mut().ty = ty;
        Ok(())
    }

    fn consume_func_body(&mut self) -> Result<()> {
        self.consume(TokenKind::LBrace)?;
        while self.matches(TokenKind::KwVar)? {
            self.consume_variable()?;
        }
        while !self.matches(TokenKind::RBrace)? {
            self.consume_block()?;
        }
        Ok(())
    }

    fn consume_variable(&mut self) -> Result<()> {
        self.consume(TokenKind::Dollar)?;
        let idx = self.consume_index()?;
        if idx != self.func_mut().num_variables() {
            return Err(ParseError::UnexpectedVarIdx(idx));
        }
        let ty = self.consume_prim_type()?;
        self.func_mut().create_variable(ty);
        Ok(())
    }

    fn consume_block(&mut self) -> Result<()> {
        self.current_block = self.consume_block_ref()?;
        self.consume(TokenKind::Colon)?;
        self.consume_statements()
    }

    // ==================== Statements ====================

    fn consume_statements(&mut self) -> Result<()> {
        // at least one statement
        self.consume_statement()?;
        loop {
            if self.matches(TokenKind::Dollar)? {
                self.consume_assign_statement()?;
            } else if let Some(op) = self.match_opcode()? {
                self.consume_opcode_statement(op)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn consume_statement(&mut self) -> Result<InstId> {
        if self.matches(TokenKind::Dollar)? {
            self.consume_assign_statement()
        } else if let Some(op) = self.match_opcode()? {
            self.consume_opcode_statement(op)
        } else {
            Err(self.syntax_error())
        }
    }

    fn consume_opcode_statement(&mut self, op: OpcodeTok) -> Result<InstId> {
        match op {
            OpcodeTok::Br => self.consume_br_statement(),
            OpcodeTok::BrIf => self.consume_br_if_statement(),
            OpcodeTok::Switch => self.consume_switch_statement(),
            OpcodeTok::Call => self.consume_call(true),
            OpcodeTok::ICall => self.consume_icall(true),
            OpcodeTok::Return => self.consume_return_statement(),
            OpcodeTok::Store => self.consume_store_statement(),
            OpcodeTok::Unreachable => {
                Ok(self.emit(true, TypeInterner::VOID, InstKind::Unreachable))
            }
            _ => Err(self.syntax_error()),
        }
    }

    fn consume_assign_statement(&mut self) -> Result<InstId> {
        let var = self.consume_index()?;
        self.consume(TokenKind::Equal)?;
        let value = self.consume_expression()?;
        Ok(self.emit(true, TypeInterner::VOID, InstKind::Dassign { value, var }))
    }

    fn consume_br_statement(&mut self) -> Result<InstId> {
        let target = self.consume_block_ref()?;
        let block = self.current_block;
        self.func_mut().add_successor(block, target);
        Ok(self.emit(true, TypeInterner::VOID, InstKind::Br { target }))
    }

    fn consume_br_if_statement(&mut self) -> Result<InstId> {
        let cond = self.consume_expression()?;
        self.consume(TokenKind::Comma)?;
        let true_block = self.consume_block_ref()?;
        let block = self.current_block;
        self.func_mut().add_successor(block, true_block);

        let mut false_block = None;
        if self.matches(TokenKind::Comma)? {
            let fb = self.consume_block_ref()?;
            self.func_mut().add_successor(block, fb);
            false_block = Some(fb);
        }

        Ok(self.emit(
            true,
            TypeInterner::VOID,
            InstKind::BrIf {
                cond,
                true_block,
                false_block,
            },
        ))
    }

    fn consume_switch_statement(&mut self) -> Result<InstId> {
        let cond = self.consume_expression()?;
        let cond_ty = self.func_mut().inst(cond).ty;
        self.consume(TokenKind::Comma)?;
        let default = self.consume_block_ref()?;

        let mut cases = Vec::new();
        self.consume(TokenKind::LBracket)?;
        if !self.matches(TokenKind::RBracket)? {
            loop {
                let constant = self.consume_constant(cond_ty)?;
                let value = self.emit(false, cond_ty, InstKind::Const(constant));
                self.consume(TokenKind::Arrow)?;
                let target = self.consume_block_ref()?;
                cases.push((value, target));
                if self.matches(TokenKind::RBracket)? {
                    break;
                }
                self.consume(TokenKind::Comma)?;
            }
        }

        // Reflect CFG edges without duplicates.
        let block = self.current_block;
        self.func_mut().add_unique_successor(block, default);
        let targets: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
        for target in targets {
            self.func_mut().add_unique_successor(block, target);
        }

        Ok(self.emit(
            true,
            TypeInterner::VOID,
            InstKind::Switch {
                cond,
                default,
                cases,
            },
        ))
    }

    fn consume_return_statement(&mut self) -> Result<InstId> {
        let mut value = None;
        let mut ty = TypeInterner::VOID;
        if let Some(expr) = self.match_expression()? {
            ty = self.func_mut().inst(expr).ty;
            value = Some(expr);
        }
        Ok(self.emit(true, ty, InstKind::Return { value }))
    }

    // syntax: store (<ptr>, <value>)
    fn consume_store_statement(&mut self) -> Result<InstId> {
        self.consume(TokenKind::LPar)?;
        let base = self.consume_expression()?;
        self.consume(TokenKind::Comma)?;
        let value = self.consume_expression()?;
        self.consume(TokenKind::RPar)?;
        Ok(self.emit(
            true,
            TypeInterner::VOID,
            InstKind::Store {
                value,
                base,
                index: None,
                scale: 1,
                offset: 0,
            },
        ))
    }

    // ==================== Expressions ====================

    fn consume_expression(&mut self) -> Result<InstId> {
        match self.match_expression()? {
            Some(inst) => Ok(inst),
            None => Err(self.syntax_error()),
        }
    }

    fn match_expression(&mut self) -> Result<Option<InstId>> {
        if self.matches(TokenKind::Dollar)? {
            return Ok(Some(self.consume_var_expression()?));
        }
        if let Some(op) = self.match_opcode()? {
            return Ok(Some(self.consume_opcode_expression(op)?));
        }
        Ok(None)
    }

    fn consume_var_expression(&mut self) -> Result<InstId> {
        let idx = self.consume_index()?;
        if idx >= self.func_mut().num_variables() {
            return Err(ParseError::UnexpectedVarIdx(idx));
        }
        let ty = self.func_mut().variable_type(idx);
        Ok(self.emit(false, ty, InstKind::Dread(idx)))
    }

    fn consume_opcode_expression(&mut self, op: OpcodeTok) -> Result<InstId> {
        match op {
            OpcodeTok::Binary(op) => {
                self.consume(TokenKind::LPar)?;
                let lhs = self.consume_expression()?;
                self.consume(TokenKind::Comma)?;
                let rhs = self.consume_expression()?;
                self.consume(TokenKind::RPar)?;
                let ty = self.func_mut().inst(lhs).ty;
                Ok(self.emit(false, ty, InstKind::Binary { op, lhs, rhs }))
            }
            OpcodeTok::Unary(op) => {
                self.consume(TokenKind::LPar)?;
                let opnd = self.consume_expression()?;
                self.consume(TokenKind::RPar)?;
                let ty = self.func_mut().inst(opnd).ty;
                Ok(self.emit(false, ty, InstKind::Unary { op, opnd }))
            }
            OpcodeTok::Const => {
                self.consume(TokenKind::Dot)?;
                let ty = self.consume_prim_type()?;
                let constant = self.consume_constant(ty)?;
                Ok(self.emit(false, ty, InstKind::Const(constant)))
            }
            OpcodeTok::Cmp => {
                let pred = self.consume_cmp_predicate()?;
                self.consume(TokenKind::LPar)?;
                let lhs = self.consume_expression()?;
                self.consume(TokenKind::Comma)?;
                let rhs = self.consume_expression()?;
                self.consume(TokenKind::RPar)?;
                Ok(self.emit(false, TypeInterner::I32, InstKind::Cmp { pred, lhs, rhs }))
            }
            OpcodeTok::Select => {
                self.consume(TokenKind::LPar)?;
                let cond = self.consume_expression()?;
                self.consume(TokenKind::Comma)?;
                let tval = self.consume_expression()?;
                self.consume(TokenKind::Comma)?;
                let fval = self.consume_expression()?;
                self.consume(TokenKind::RPar)?;
                let ty = self.func_mut().inst(tval).ty;
                Ok(self.emit(false, ty, InstKind::Select { cond, tval, fval }))
            }
            OpcodeTok::Call => self.consume_call(false),
            OpcodeTok::ICall => self.consume_icall(false),
            OpcodeTok::Load => {
                self.consume(TokenKind::LPar)?;
                let addr = self.consume_expression()?;
                self.consume(TokenKind::RPar)?;
                let ty = self.func_mut().inst(addr).ty;
                Ok(self.emit(
                    false,
                    ty,
                    InstKind::Load {
                        src_ty: ty,
                        base: Some(addr),
                        index: None,
                        scale: 1,
                        offset: 0,
                        sext: false,
                    },
                ))
            }
            _ => Err(self.syntax_error()),
        }
    }

    // syntax: call %<func-index> (<arg0>, ..., <argn>)
    fn consume_call(&mut self, is_stmt: bool) -> Result<InstId> {
        let callee = self.consume_func_index()?;
        let args = self.consume_args()?;

        let inst = self.emit(is_stmt, TypeInterner::VOID, InstKind::Call { callee, args });
        if (callee as usize) < self.func_types.len() {
            let ret = self.ctx.types.func_ret(self.func_types[callee as usize]);
            self.func_mut().inst_mut(inst).ty = ret;
        } else {
            // callee appears after the current function; fix up after parse
            self.pending_calls.push(PendingCall {
                func: self.funcs.len() - 1,
                inst,
                callee,
            });
        }
        Ok(inst)
    }

    // syntax: icall <return-type> (<func-addr>, <arg0>, ..., <argn>)
    fn consume_icall(&mut self, is_stmt: bool) -> Result<InstId> {
        let ty = self.consume_prim_type()?;
        self.consume(TokenKind::LPar)?;
        let callee = self.consume_expression()?;
        let mut args = Vec::new();
        while !self.matches(TokenKind::RPar)? {
            self.consume(TokenKind::Comma)?;
            args.push(self.consume_expression()?);
        }
        Ok(self.emit(is_stmt, ty, InstKind::ICall { callee, args }))
    }

    fn consume_args(&mut self) -> Result<Vec<InstId>> {
        self.consume(TokenKind::LPar)?;
        let mut args = Vec::new();
        if !self.matches(TokenKind::RPar)? {
            args.push(self.consume_expression()?);
            while !self.matches(TokenKind::RPar)? {
                self.consume(TokenKind::Comma)?;
                args.push(self.consume_expression()?);
            }
        }
        Ok(args)
    }

    // ==================== Construction helpers ====================

    fn func_mut(&mut self) -> &mut MirFunction {
        self.funcs.last_mut().expect("no function under parse")
    }

    fn emit(&mut self, is_stmt: bool, ty: TypeId, kind: InstKind) -> InstId {
        let block = self.current_block;
        self.func_mut().create_inst(block, is_stmt, ty, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::BinaryOp;

    fn parse(source: &str) -> (CompileContext, MirModule) {
        let mut ctx = CompileContext::new();
        let module = parse_module(&mut ctx, source).expect("parse failed");
        (ctx, module)
    }

    #[test]
    fn test_simple_function() {
        let (ctx, module) = parse(
            "func %0 (i32, i32) -> i32 {\n\
             @0:\n\
             return const.i32 42\n\
             }\n",
        );
        assert_eq!(module.num_functions(), 1);
        let func = module.function(0);
        assert_eq!(func.num_blocks(), 1);
        let params = ctx.types.func_params(func.ty);
        assert_eq!(params, &[TypeInterner::I32, TypeInterner::I32]);
        assert_eq!(ctx.types.func_ret(func.ty), TypeInterner::I32);
    }

    #[test]
    fn test_variables_and_assignment() {
        let (_, module) = parse(
            "func %0 () -> i64 {\n\
             var $0 i64\n\
             var $1 void*\n\
             @0:\n\
             $0 = add(const.i64 1, const.i64 2)\n\
             return $0\n\
             }\n",
        );
        let func = module.function(0);
        assert_eq!(func.num_variables(), 2);
        let stmts = &func.block(BlockId(0)).stmts;
        assert_eq!(stmts.len(), 2);
        match &func.inst(stmts[0]).kind {
            InstKind::Dassign { value, var } => {
                assert_eq!(*var, 0);
                match &func.inst(*value).kind {
                    InstKind::Binary { op, .. } => assert_eq!(*op, BinaryOp::Add),
                    other => panic!("expected binary, got {:?}", other),
                }
            }
            other => panic!("expected dassign, got {:?}", other),
        }
    }

    #[test]
    fn test_var_index_must_be_dense() {
        let mut ctx = CompileContext::new();
        let err = parse_module(
            &mut ctx,
            "func %0 () { var $1 i32 @0: return }",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedVarIdx(1)));
    }

    #[test]
    fn test_func_index_must_be_dense() {
        let mut ctx = CompileContext::new();
        let err = parse_module(&mut ctx, "func %3 () { @0: return }").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedFuncIdx(3)));
    }

    #[test]
    fn test_control_flow_edges() {
        let (_, module) = parse(
            "func %0 (i32) -> i32 {\n\
             var $0 i32\n\
             @0:\n\
             br_if $0, @1, @2\n\
             @1:\n\
             return const.i32 1\n\
             @2:\n\
             return const.i32 2\n\
             }\n",
        );
        let func = module.function(0);
        assert_eq!(func.num_blocks(), 3);
        assert_eq!(
            func.block(BlockId(0)).successors,
            vec![BlockId(1), BlockId(2)]
        );
        assert_eq!(func.block(BlockId(1)).predecessors, vec![BlockId(0)]);
    }

    #[test]
    fn test_switch_dedups_successors() {
        let (_, module) = parse(
            "func %0 (i32) {\n\
             var $0 i32\n\
             @0:\n\
             switch $0, @1 [ 0 -> @1, 1 -> @2 ]\n\
             @1:\n\
             return\n\
             @2:\n\
             return\n\
             }\n",
        );
        let func = module.function(0);
        // default @1 and case @1 collapse to one edge
        assert_eq!(
            func.block(BlockId(0)).successors,
            vec![BlockId(1), BlockId(2)]
        );
    }

    #[test]
    fn test_forward_call_gets_return_type() {
        let (ctx, module) = parse(
            "func %0 () -> i64 {\n\
             @0:\n\
             return call %1 ()\n\
             }\n\
             func %1 () -> i64 {\n\
             @0:\n\
             return const.i64 9\n\
             }\n",
        );
        let func = module.function(0);
        let ret_stmt = func.block(BlockId(0)).stmts[0];
        let call = match &func.inst(ret_stmt).kind {
            InstKind::Return { value: Some(v) } => *v,
            other => panic!("expected return, got {:?}", other),
        };
        assert_eq!(func.inst(call).ty, TypeInterner::I64);
        let _ = ctx;
    }

    #[test]
    fn test_forward_call_to_missing_function_fails() {
        let mut ctx = CompileContext::new();
        let err = parse_module(
            &mut ctx,
            "func %0 () { @0: call %9 () return }",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedFuncIdx(9)));
    }

    #[test]
    fn test_icall_store_and_comments() {
        let (_, module) = parse(
            "func %0 (i64) {\n\
             var $0 i64\n\
             var $1 void*\n\
             @0:\n\
             ; write through the pointer, then call it\n\
             store ($1, const.i32 7)\n\
             icall void ($0, const.i32 1)\n\
             return\n\
             }\n",
        );
        let func = module.function(0);
        assert_eq!(func.block(BlockId(0)).stmts.len(), 3);
    }

    #[test]
    fn test_negative_and_float_constants() {
        let (ctx, module) = parse(
            "func %0 () -> f64 {\n\
             @0:\n\
             $0 = cmp islt (const.i32 -5, const.i32 3)\n\
             return const.f64 2.5\n\
             }",
        );
        // cmp writes to an undeclared var in this fragment; the parser does
        // not validate dassign targets, only dread ones.
        let func = module.function(0);
        assert_eq!(func.block(BlockId(0)).stmts.len(), 2);
        let _ = ctx;
    }

    #[test]
    fn test_printer_parser_agreement() {
        let source = "func %0 (i32, i32) -> i32 {\n\
             var $0 i32\n\
             @0:\n\
             $0 = add(const.i32 3, const.i32 4)\n\
             br_if cmp ieq ($0, const.i32 7), @1, @2\n\
             @1:\n\
             return $0\n\
             @2:\n\
             return const.i32 0\n\
             }\n";
        let (ctx, module) = parse(source);
        let printed = format!("{}", module.display(&ctx));
        let mut ctx2 = CompileContext::new();
        let reparsed = parse_module(&mut ctx2, &printed).expect("reparse failed");
        assert_eq!(reparsed.num_functions(), module.num_functions());
        let f1 = module.function(0);
        let f2 = reparsed.function(0);
        assert_eq!(f1.num_blocks(), f2.num_blocks());
        assert_eq!(f1.num_variables(), f2.num_variables());
        assert_eq!(
            f1.block(BlockId(0)).stmts.len(),
            f2.block(BlockId(0)).stmts.len()
        );
    }
}
