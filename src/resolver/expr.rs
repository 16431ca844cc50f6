//! Evaluation of `#if`/`#elif` integer constant expressions.
//!
//! Library headers guard code with expressions like
//! `#if defined(ESP32) && (EMAIL_NETWORK_TYPE == NETWORK_ESP32)`; a textual
//! guard scan cannot decide those, so conditions are parsed into a small
//! expression tree and evaluated against the current macro table. This is
//! deliberately not a conformant preprocessor: no function-like macro
//! expansion, no string operations, just the arithmetic `#if` needs.

use crate::resolver::MacroTable;
use std::collections::BTreeSet;

/// Substitution depth bound; identifiers still unresolved at this depth
/// evaluate to an error rather than looping.
const MAX_SUBSTITUTION_DEPTH: usize = 16;

/// A failed evaluation. The analyzer demotes this to a warning and treats
/// the branch as false.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at offset {position}")]
pub struct ExprError {
    pub reason: String,
    pub position: usize,
}

impl ExprError {
    fn new(reason: impl Into<String>, position: usize) -> Self {
        Self { reason: reason.into(), position }
    }
}

/// Evaluates `expression` against `macros`. Non-zero is truthy.
///
/// Every macro name the expression reads (including names reached through
/// substitution) is added to `referenced`; the caller uses that set as its
/// memoization key.
pub fn evaluate(
    expression: &str,
    macros: &MacroTable,
    referenced: &mut BTreeSet<String>,
) -> Result<i64, ExprError> {
    let expr = parse(expression)?;
    let mut ctx = EvalContext { macros, referenced };
    ctx.eval(&expr, 0)
}

// ---------------------------------------------------------------- tokens --

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Int(i64),
    Ident(String),
    Punct(&'static str),
}

const PUNCTUATORS: &[&str] = &[
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "!", "~", "+", "-", "*", "/", "%", "<", ">",
    "&", "^", "|", "?", ":", "(", ")",
];

fn tokenize(input: &str) -> Result<Vec<(Tok, usize)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
                i += 1;
            }
            tokens.push((Tok::Int(parse_int(&input[start..i], start)?), start));
            continue;
        }
        if b == b'_' || b.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push((Tok::Ident(input[start..i].to_string()), start));
            continue;
        }
        let rest = &input[i..];
        match PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            Some(&p) => {
                tokens.push((Tok::Punct(p), i));
                i += p.len();
            }
            None => {
                return Err(ExprError::new(format!("unexpected character `{}`", b as char), i));
            }
        }
    }
    Ok(tokens)
}

/// Parses a C integer literal: decimal, `0x` hex or leading-zero octal,
/// with any `u`/`l` suffix run stripped.
fn parse_int(text: &str, position: usize) -> Result<i64, ExprError> {
    let digits = text.trim_end_matches(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'));
    if digits.is_empty() {
        return Err(ExprError::new(format!("malformed integer literal `{text}`"), position));
    }
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        u64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<u64>()
    };
    parsed
        .map(|v| v as i64)
        .map_err(|_| ExprError::new(format!("malformed integer literal `{text}`"), position))
}

// ------------------------------------------------------------------- ast --

#[derive(Clone, Debug)]
struct Expr {
    kind: ExprKind,
    pos: usize,
}

#[derive(Clone, Debug)]
enum ExprKind {
    Int(i64),
    Ident(String),
    Defined(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::new("empty expression", 0));
    }
    let mut parser = Parser { tokens, pos: 0, end: input.len() };
    let expr = parser.ternary()?;
    if let Some((tok, at)) = parser.peek() {
        return Err(ExprError::new(format!("trailing `{}`", tok_text(tok)), at));
    }
    Ok(expr)
}

fn tok_text(tok: &Tok) -> String {
    match tok {
        Tok::Int(v) => v.to_string(),
        Tok::Ident(name) => name.clone(),
        Tok::Punct(p) => p.to_string(),
    }
}

fn precedence(op: &str) -> Option<u8> {
    Some(match op {
        "*" | "/" | "%" => 10,
        "+" | "-" => 9,
        "<<" | ">>" => 8,
        "<" | "<=" | ">" | ">=" => 7,
        "==" | "!=" => 6,
        "&" => 5,
        "^" => 4,
        "|" => 3,
        "&&" => 2,
        "||" => 1,
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<(&Tok, usize)> {
        self.tokens.get(self.pos).map(|(t, at)| (t, *at))
    }

    fn bump(&mut self) -> Option<(Tok, usize)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_punct(&mut self, punct: &str) -> Result<usize, ExprError> {
        match self.bump() {
            Some((Tok::Punct(p), at)) if p == punct => Ok(at),
            Some((tok, at)) => Err(ExprError::new(
                format!("expected `{punct}`, found `{}`", tok_text(&tok)),
                at,
            )),
            None => Err(ExprError::new(format!("expected `{punct}`"), self.end)),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(1)?;
        match self.peek() {
            Some((Tok::Punct("?"), at)) => {
                self.pos += 1;
                let then = self.ternary()?;
                self.expect_punct(":")?;
                let otherwise = self.ternary()?;
                Ok(Expr {
                    kind: ExprKind::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
                    pos: at,
                })
            }
            _ => Ok(cond),
        }
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let (op, at) = match self.peek() {
                Some((Tok::Punct(p), at)) => (*p, at),
                _ => break,
            };
            let Some(prec) = precedence(op) else { break };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr { kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos: at };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if let Some((Tok::Punct(p), at)) = self.peek() {
            let op = *p;
            if matches!(op, "!" | "~" | "-" | "+") {
                self.pos += 1;
                let operand = self.unary()?;
                return Ok(Expr { kind: ExprKind::Unary(op, Box::new(operand)), pos: at });
            }
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some((Tok::Int(value), at)) => Ok(Expr { kind: ExprKind::Int(value), pos: at }),
            Some((Tok::Ident(name), at)) if name == "defined" => {
                let name = match self.bump() {
                    Some((Tok::Punct("("), _)) => {
                        let name = match self.bump() {
                            Some((Tok::Ident(name), _)) => name,
                            Some((tok, at)) => {
                                return Err(ExprError::new(
                                    format!("expected macro name, found `{}`", tok_text(&tok)),
                                    at,
                                ))
                            }
                            None => return Err(ExprError::new("expected macro name", self.end)),
                        };
                        self.expect_punct(")")?;
                        name
                    }
                    Some((Tok::Ident(name), _)) => name,
                    Some((tok, at)) => {
                        return Err(ExprError::new(
                            format!("expected macro name after `defined`, found `{}`", tok_text(&tok)),
                            at,
                        ))
                    }
                    None => return Err(ExprError::new("expected macro name after `defined`", self.end)),
                };
                Ok(Expr { kind: ExprKind::Defined(name), pos: at })
            }
            Some((Tok::Ident(name), at)) => Ok(Expr { kind: ExprKind::Ident(name), pos: at }),
            Some((Tok::Punct("("), _)) => {
                let inner = self.ternary()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some((tok, at)) => {
                Err(ExprError::new(format!("unexpected `{}`", tok_text(&tok)), at))
            }
            None => Err(ExprError::new("unexpected end of expression", self.end)),
        }
    }
}

// ------------------------------------------------------------------ eval --

struct EvalContext<'a> {
    macros: &'a MacroTable,
    referenced: &'a mut BTreeSet<String>,
}

impl EvalContext<'_> {
    fn eval(&mut self, expr: &Expr, depth: usize) -> Result<i64, ExprError> {
        match &expr.kind {
            ExprKind::Int(value) => Ok(*value),
            ExprKind::Defined(name) => {
                self.referenced.insert(name.clone());
                Ok(self.macros.is_defined(name) as i64)
            }
            ExprKind::Ident(name) => self.ident(name, expr.pos, depth),
            ExprKind::Unary(op, operand) => {
                let value = self.eval(operand, depth)?;
                Ok(match *op {
                    "!" => (value == 0) as i64,
                    "~" => !value,
                    "-" => value.wrapping_neg(),
                    _ => value,
                })
            }
            ExprKind::Binary(op, lhs, rhs) => self.binary(op, lhs, rhs, expr.pos, depth),
            ExprKind::Ternary(cond, then, otherwise) => {
                if self.eval(cond, depth)? != 0 {
                    self.eval(then, depth)
                } else {
                    self.eval(otherwise, depth)
                }
            }
        }
    }

    /// Macro-substitutes an identifier, iterating through value text up to
    /// the depth bound. Unknown identifiers evaluate to 0, matching `#if`
    /// semantics for undefined macros.
    fn ident(&mut self, name: &str, pos: usize, depth: usize) -> Result<i64, ExprError> {
        self.referenced.insert(name.to_string());
        let Some(def) = self.macros.get(name) else { return Ok(0) };
        let Some(value) = &def.value else {
            return Err(ExprError::new(format!("macro `{name}` has no value"), pos));
        };
        if depth >= MAX_SUBSTITUTION_DEPTH {
            return Err(ExprError::new(
                format!("macro substitution for `{name}` exceeds depth {MAX_SUBSTITUTION_DEPTH}"),
                pos,
            ));
        }
        let sub = parse(value).map_err(|err| {
            ExprError::new(format!("in expansion of `{name}`: {}", err.reason), pos)
        })?;
        self.eval(&sub, depth + 1)
            .map_err(|err| ExprError::new(format!("in expansion of `{name}`: {}", err.reason), pos))
    }

    fn binary(
        &mut self,
        op: &str,
        lhs: &Expr,
        rhs: &Expr,
        pos: usize,
        depth: usize,
    ) -> Result<i64, ExprError> {
        // && and || short-circuit, so guards like `defined(X) && X > 2`
        // never evaluate the unreached operand
        match op {
            "&&" => {
                if self.eval(lhs, depth)? == 0 {
                    return Ok(0);
                }
                return Ok((self.eval(rhs, depth)? != 0) as i64);
            }
            "||" => {
                if self.eval(lhs, depth)? != 0 {
                    return Ok(1);
                }
                return Ok((self.eval(rhs, depth)? != 0) as i64);
            }
            _ => {}
        }

        let l = self.eval(lhs, depth)?;
        let r = self.eval(rhs, depth)?;
        Ok(match op {
            "*" => l.wrapping_mul(r),
            "/" => {
                if r == 0 {
                    return Err(ExprError::new("division by zero", pos));
                }
                l.wrapping_div(r)
            }
            "%" => {
                if r == 0 {
                    return Err(ExprError::new("division by zero", pos));
                }
                l.wrapping_rem(r)
            }
            "+" => l.wrapping_add(r),
            "-" => l.wrapping_sub(r),
            "<<" | ">>" => {
                if !(0..64).contains(&r) {
                    return Err(ExprError::new("shift amount out of range", pos));
                }
                if op == "<<" {
                    l.wrapping_shl(r as u32)
                } else {
                    l.wrapping_shr(r as u32)
                }
            }
            "<" => (l < r) as i64,
            "<=" => (l <= r) as i64,
            ">" => (l > r) as i64,
            ">=" => (l >= r) as i64,
            "==" => (l == r) as i64,
            "!=" => (l != r) as i64,
            "&" => l & r,
            "^" => l ^ r,
            "|" => l | r,
            _ => return Err(ExprError::new(format!("unsupported operator `{op}`"), pos)),
        })
    }
}
