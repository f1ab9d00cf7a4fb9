//! MIR text lexer
//!
//! Tokenizes with logos; identifiers are resolved against a keyword table
//! covering opcode names, primitive types, condition codes, and the `func` /
//! `var` keywords. `;` starts a line comment.

use logos::Logos;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::arena::TypeId;
use crate::instr::{BinaryOp, CmpPredicate, UnaryOp};
use crate::types::TypeInterner;

/// Opcode keywords understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeTok {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Const,
    Cmp,
    Select,
    Call,
    ICall,
    Load,
    Br,
    BrIf,
    Switch,
    Return,
    Store,
    Unreachable,
}

/// Resolved token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Opcode(OpcodeTok),
    /// A primitive type name; `void*` arrives as `Type(VOID)` followed by `Star`.
    Type(TypeId),
    CondCode(CmpPredicate),
    KwFunc,
    KwVar,
    Ident,
    Number,
    LPar,
    RPar,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Percent,
    Dollar,
    At,
    Arrow,
    Equal,
    Colon,
    Comma,
    Dot,
    Star,
    Eof,
}

/// A token with its source slice (numbers keep their text for parsing).
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
}

impl<'src> Token<'src> {
    pub fn eof() -> Self {
        Token {
            kind: TokenKind::Eof,
            text: "",
        }
    }
}

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r";[^\n]*")]
enum RawToken {
    #[regex(r"[a-zA-Z][a-zA-Z0-9_]*")]
    Ident,
    #[regex(r"-?[0-9]+(\.[0-9]+)?")]
    Number,
    #[token("(")]
    LPar,
    #[token(")")]
    RPar,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("%")]
    Percent,
    #[token("$")]
    Dollar,
    #[token("@")]
    At,
    #[token("->")]
    Arrow,
    #[token("=")]
    Equal,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("*")]
    Star,
}

static KEYWORDS: Lazy<FxHashMap<&'static str, TokenKind>> = Lazy::new(|| {
    use BinaryOp::*;
    use UnaryOp::*;

    let mut map = FxHashMap::default();
    for op in [
        Clz, Ctz, Popcnt, FpAbs, FpNeg, FpSqrt, FpRoundCeil, FpRoundFloor, FpRoundTrunc,
        FpRoundNearest,
    ] {
        map.insert(op.name(), TokenKind::Opcode(OpcodeTok::Unary(op)));
    }
    for op in [
        Add, Sub, Mul, DivS, DivU, RemS, RemU, And, Or, Xor, Shl, ShrS, ShrU, Rotl, Rotr, FpAdd,
        FpSub, FpMul, FpDiv, FpMin, FpMax, FpCopysign,
    ] {
        map.insert(op.name(), TokenKind::Opcode(OpcodeTok::Binary(op)));
    }
    for pred in [
        CmpPredicate::FFalse,
        CmpPredicate::FOeq,
        CmpPredicate::FOgt,
        CmpPredicate::FOge,
        CmpPredicate::FOlt,
        CmpPredicate::FOle,
        CmpPredicate::FOne,
        CmpPredicate::FOrd,
        CmpPredicate::FUno,
        CmpPredicate::FUeq,
        CmpPredicate::FUgt,
        CmpPredicate::FUge,
        CmpPredicate::FUlt,
        CmpPredicate::FUle,
        CmpPredicate::FUne,
        CmpPredicate::FTrue,
        CmpPredicate::IEq,
        CmpPredicate::INe,
        CmpPredicate::IUgt,
        CmpPredicate::IUge,
        CmpPredicate::IUlt,
        CmpPredicate::IUle,
        CmpPredicate::ISgt,
        CmpPredicate::ISge,
        CmpPredicate::ISlt,
        CmpPredicate::ISle,
    ] {
        map.insert(pred.name(), TokenKind::CondCode(pred));
    }
    map.insert("const", TokenKind::Opcode(OpcodeTok::Const));
    map.insert("cmp", TokenKind::Opcode(OpcodeTok::Cmp));
    map.insert("select", TokenKind::Opcode(OpcodeTok::Select));
    map.insert("call", TokenKind::Opcode(OpcodeTok::Call));
    map.insert("icall", TokenKind::Opcode(OpcodeTok::ICall));
    map.insert("load", TokenKind::Opcode(OpcodeTok::Load));
    map.insert("br", TokenKind::Opcode(OpcodeTok::Br));
    map.insert("br_if", TokenKind::Opcode(OpcodeTok::BrIf));
    map.insert("switch", TokenKind::Opcode(OpcodeTok::Switch));
    map.insert("return", TokenKind::Opcode(OpcodeTok::Return));
    map.insert("store", TokenKind::Opcode(OpcodeTok::Store));
    map.insert("unreachable", TokenKind::Opcode(OpcodeTok::Unreachable));
    map.insert("i8", TokenKind::Type(TypeInterner::I8));
    map.insert("i16", TokenKind::Type(TypeInterner::I16));
    map.insert("i32", TokenKind::Type(TypeInterner::I32));
    map.insert("i64", TokenKind::Type(TypeInterner::I64));
    map.insert("f32", TokenKind::Type(TypeInterner::F32));
    map.insert("f64", TokenKind::Type(TypeInterner::F64));
    map.insert("void", TokenKind::Type(TypeInterner::VOID));
    map.insert("func", TokenKind::KwFunc);
    map.insert("var", TokenKind::KwVar);
    map
});

/// Streaming lexer over a source string.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, RawToken>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            inner: RawToken::lexer(source),
        }
    }

    /// Next token, or an error carrying the offending slice.
    pub fn next_token(&mut self) -> Result<Token<'src>, String> {
        let raw = match self.inner.next() {
            None => return Ok(Token::eof()),
            Some(Err(())) => {
                let slice = self.inner.slice();
                let text = if slice.is_empty() {
                    self.inner.remainder()
                } else {
                    slice
                };
                return Err(text.chars().take(8).collect());
            }
            Some(Ok(raw)) => raw,
        };
        let text = self.inner.slice();
        let kind = match raw {
            RawToken::Ident => *KEYWORDS.get(text).unwrap_or(&TokenKind::Ident),
            RawToken::Number => TokenKind::Number,
            RawToken::LPar => TokenKind::LPar,
            RawToken::RPar => TokenKind::RPar,
            RawToken::LBrace => TokenKind::LBrace,
            RawToken::RBrace => TokenKind::RBrace,
            RawToken::LBracket => TokenKind::LBracket,
            RawToken::RBracket => TokenKind::RBracket,
            RawToken::Percent => TokenKind::Percent,
            RawToken::Dollar => TokenKind::Dollar,
            RawToken::At => TokenKind::At,
            RawToken::Arrow => TokenKind::Arrow,
            RawToken::Equal => TokenKind::Equal,
            RawToken::Colon => TokenKind::Colon,
            RawToken::Comma => TokenKind::Comma,
            RawToken::Dot => TokenKind::Dot,
            RawToken::Star => TokenKind::Star,
        };
        Ok(Token { kind, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().unwrap();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn test_punctuation_and_keywords() {
        assert_eq!(
            kinds("func %0 () -> i32 {"),
            vec![
                TokenKind::KwFunc,
                TokenKind::Percent,
                TokenKind::Number,
                TokenKind::LPar,
                TokenKind::RPar,
                TokenKind::Arrow,
                TokenKind::Type(TypeInterner::I32),
                TokenKind::LBrace,
            ]
        );
    }

    #[test]
    fn test_opcode_keywords() {
        assert_eq!(
            kinds("add clz sshr br_if"),
            vec![
                TokenKind::Opcode(OpcodeTok::Binary(BinaryOp::Add)),
                TokenKind::Opcode(OpcodeTok::Unary(UnaryOp::Clz)),
                TokenKind::Opcode(OpcodeTok::Binary(BinaryOp::ShrS)),
                TokenKind::Opcode(OpcodeTok::BrIf),
            ]
        );
    }

    #[test]
    fn test_cond_codes() {
        assert_eq!(
            kinds("ieq fune isle"),
            vec![
                TokenKind::CondCode(CmpPredicate::IEq),
                TokenKind::CondCode(CmpPredicate::FUne),
                TokenKind::CondCode(CmpPredicate::ISle),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let mut lexer = Lexer::new("42 -7 3.5");
        assert_eq!(lexer.next_token().unwrap().text, "42");
        assert_eq!(lexer.next_token().unwrap().text, "-7");
        assert_eq!(lexer.next_token().unwrap().text, "3.5");
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("br ; jump to the loop header\n@"),
            vec![TokenKind::Opcode(OpcodeTok::Br), TokenKind::At]
        );
    }

    #[test]
    fn test_unknown_identifier_is_ident() {
        assert_eq!(kinds("bogus"), vec![TokenKind::Ident]);
    }

    #[test]
    fn test_unsupported_character_errors() {
        let mut lexer = Lexer::new("#");
        assert!(lexer.next_token().is_err());
    }
}
