//! Arithmetic expression evaluation for assign right-hand sides
//!
//! After `${name}` substitution, a string that parses as a pure arithmetic
//! expression over numbers is evaluated and stored as a number. Supported
//! operators: `+ - * / % **` and unary `+ -`, with standard precedence.
//! `**` is right-associative and binds tighter than unary minus, so
//! `-2 ** 2` is `-4`. `/` is always floating-point division; `%` follows the
//! sign of the dividend.
//!
//! Parsing and evaluation are separate phases: parse failure means "this is
//! not arithmetic, treat it as a string", while evaluation failure (division
//! by zero, non-finite result) fails the instruction.

use crate::error::{Result, VmError};
use serde_json::Value;

/// Numeric domain that stays integral until an operation forces a float
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    /// Convert to a JSON number. Non-finite results are evaluation errors.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| VmError::Eval("non-finite arithmetic result".into())),
        }
    }
}

/// Parsed arithmetic expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(Num),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok {
    Num(Num),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    DoubleStar,
    LParen,
    RParen,
}

/// Tokenize the input. `None` means the input is not arithmetic.
fn tokenize(input: &str) -> Option<Vec<Tok>> {
    let bytes = input.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            b'-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            b'*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    toks.push(Tok::DoubleStar);
                    i += 2;
                } else {
                    toks.push(Tok::Star);
                    i += 1;
                }
            }
            b'/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            b'%' => {
                toks.push(Tok::Percent);
                i += 1;
            }
            b'(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            b')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            b'0'..=b'9' => {
                let start = i;
                let mut is_float = false;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'.' {
                    if !bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    is_float = true;
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if !bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    is_float = true;
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &input[start..i];
                let num = if is_float {
                    Num::Float(text.parse::<f64>().ok()?)
                } else {
                    match text.parse::<i64>() {
                        Ok(v) => Num::Int(v),
                        // Out of i64 range, keep the magnitude as a float.
                        Err(_) => Num::Float(text.parse::<f64>().ok()?),
                    }
                };
                toks.push(Tok::Num(num));
            }
            _ => return None,
        }
    }

    if toks.is_empty() {
        return None;
    }
    Some(toks)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Tok> {
        self.toks.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // Binding powers: additive 10, multiplicative 20, unary 35, power 41
    // (right-associative via a lower right binding power).
    fn parse_expr(&mut self, min_bp: u8) -> Option<Expr> {
        let mut lhs = self.parse_prefix()?;

        while let Some(tok) = self.peek() {
            let (op, lbp, rbp) = match tok {
                Tok::Plus => (BinOp::Add, 10, 11),
                Tok::Minus => (BinOp::Sub, 10, 11),
                Tok::Star => (BinOp::Mul, 20, 21),
                Tok::Slash => (BinOp::Div, 20, 21),
                Tok::Percent => (BinOp::Rem, 20, 21),
                Tok::DoubleStar => (BinOp::Pow, 41, 40),
                Tok::RParen => break,
                _ => return None,
            };
            if lbp < min_bp {
                break;
            }
            self.next();
            let rhs = self.parse_expr(rbp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Some(lhs)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        match self.next()? {
            Tok::Num(n) => Some(Expr::Num(n)),
            Tok::Minus => Some(Expr::Neg(Box::new(self.parse_expr(35)?))),
            Tok::Plus => self.parse_expr(35),
            Tok::LParen => {
                let inner = self.parse_expr(0)?;
                match self.next()? {
                    Tok::RParen => Some(inner),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Parse a complete arithmetic expression. `None` means not arithmetic.
pub fn parse(input: &str) -> Option<Expr> {
    let toks = tokenize(input)?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.toks.len() {
        return None;
    }
    Some(expr)
}

impl Expr {
    pub fn eval(&self) -> Result<Num> {
        match self {
            Expr::Num(n) => Ok(*n),
            Expr::Neg(inner) => match inner.eval()? {
                Num::Int(i) => i
                    .checked_neg()
                    .map(Num::Int)
                    .ok_or_else(|| VmError::Eval("integer overflow".into())),
                Num::Float(f) => Ok(Num::Float(-f)),
            },
            Expr::Binary(op, lhs, rhs) => apply(*op, lhs.eval()?, rhs.eval()?),
        }
    }
}

fn apply(op: BinOp, lhs: Num, rhs: Num) -> Result<Num> {
    match op {
        BinOp::Add => int_or_float(lhs, rhs, i64::checked_add, |a, b| a + b),
        BinOp::Sub => int_or_float(lhs, rhs, i64::checked_sub, |a, b| a - b),
        BinOp::Mul => int_or_float(lhs, rhs, i64::checked_mul, |a, b| a * b),
        BinOp::Div => {
            if rhs.as_f64() == 0.0 {
                return Err(VmError::Eval("division by zero".into()));
            }
            Ok(Num::Float(lhs.as_f64() / rhs.as_f64()))
        }
        BinOp::Rem => match (lhs, rhs) {
            (_, Num::Int(0)) => Err(VmError::Eval("modulo by zero".into())),
            (Num::Int(a), Num::Int(b)) => Ok(Num::Int(a % b)),
            (a, b) => {
                if b.as_f64() == 0.0 {
                    return Err(VmError::Eval("modulo by zero".into()));
                }
                // f64 remainder keeps the sign of the dividend.
                Ok(Num::Float(a.as_f64() % b.as_f64()))
            }
        },
        BinOp::Pow => match (lhs, rhs) {
            (Num::Int(base), Num::Int(exp)) if (0..=u32::MAX as i64).contains(&exp) => {
                match base.checked_pow(exp as u32) {
                    Some(v) => Ok(Num::Int(v)),
                    None => Ok(Num::Float((base as f64).powf(exp as f64))),
                }
            }
            (a, b) => Ok(Num::Float(a.as_f64().powf(b.as_f64()))),
        },
    }
}

fn int_or_float(
    lhs: Num,
    rhs: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Num> {
    match (lhs, rhs) {
        (Num::Int(a), Num::Int(b)) => Ok(int_op(a, b)
            .map(Num::Int)
            .unwrap_or_else(|| Num::Float(float_op(a as f64, b as f64)))),
        (a, b) => Ok(Num::Float(float_op(a.as_f64(), b.as_f64()))),
    }
}

/// Parse and evaluate in one step, for callers that already know the input
/// should be arithmetic.
pub fn eval(input: &str) -> Option<Result<Value>> {
    parse(input).map(|expr| expr.eval().and_then(Num::into_value))
}
