//! Symbol/Offset Calculator
//!
//! The target entry point is not exported by name; it sits at a fixed
//! distance from the base address of whichever configured library is
//! actually mapped. The distance is configured as an arithmetic expression
//! (reverse-engineering notes tend to record it as e.g. `0x1a2b00 + 0x40`),
//! evaluated exactly once at configuration time.

use std::collections::HashMap;
use std::ops::Range;

use super::{BridgeError, BridgeResult};

/// Addresses below the first page are never valid entry points.
pub const MIN_TARGET_ADDRESS: usize = 0x1000;

/// A parsed offset expression.
///
/// Grammar: decimal and `0x` hex literals, named constants, unary `-`,
/// binary `+ - * / % << >> & | ^` with C precedence, and parentheses.
#[derive(Debug, Clone)]
pub struct OffsetExpr {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Literal(i128),
    Constant(String),
    Neg(Box<Node>),
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

impl OffsetExpr {
    /// Parse an expression. Fails on empty input, unknown tokens, or
    /// unbalanced parentheses.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let tokens = lex(text)?;
        if tokens.is_empty() {
            return Err(BridgeError::OffsetParse("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(BridgeError::OffsetParse(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self { root })
    }

    /// Evaluate against a set of named constants. The result is a signed
    /// offset; it must fit in `i64`.
    pub fn eval(&self, constants: &HashMap<String, i64>) -> BridgeResult<i64> {
        let value = eval_node(&self.root, constants)?;
        i64::try_from(value)
            .map_err(|_| BridgeError::OffsetParse(format!("offset {} out of i64 range", value)))
    }
}

/// Compute the absolute target address from a library base and a signed
/// offset.
///
/// When the module's mapped region is known the result must fall inside it;
/// without that metadata the only check possible is the minimum-address
/// guard, and a bad offset manifests at invocation time instead.
pub fn compute_target(
    base: usize,
    offset: i64,
    region: Option<&Range<usize>>,
) -> BridgeResult<usize> {
    let address = base.checked_add_signed(offset as isize).ok_or_else(|| {
        BridgeError::OffsetOutOfRange {
            address: 0,
            reason: format!("base {:#x} + offset {:#x} overflows", base, offset),
        }
    })?;

    if address < MIN_TARGET_ADDRESS {
        return Err(BridgeError::OffsetOutOfRange {
            address,
            reason: format!("below minimum plausible address {:#x}", MIN_TARGET_ADDRESS),
        });
    }

    if let Some(region) = region {
        if !region.contains(&address) {
            return Err(BridgeError::OffsetOutOfRange {
                address,
                reason: format!(
                    "outside mapped region {:#x}..{:#x}",
                    region.start, region.end
                ),
            });
        }
    }

    Ok(address)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(i128),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    Amp,
    Pipe,
    Caret,
    LParen,
    RParen,
}

fn lex(text: &str) -> BridgeResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' | '>' => {
                if i + 1 >= bytes.len() || bytes[i + 1] != bytes[i] {
                    return Err(BridgeError::OffsetParse(format!(
                        "unexpected character '{}'",
                        c
                    )));
                }
                tokens.push(if c == '<' { Token::Shl } else { Token::Shr });
                i += 2;
            }
            '0'..='9' => {
                let start = i;
                let radix = if text[i..].starts_with("0x") || text[i..].starts_with("0X") {
                    i += 2;
                    16
                } else {
                    10
                };
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                    i += 1;
                }
                let digits = if radix == 16 { &text[start + 2..i] } else { &text[start..i] };
                let value = i128::from_str_radix(digits, radix).map_err(|_| {
                    BridgeError::OffsetParse(format!("bad numeric literal '{}'", &text[start..i]))
                })?;
                tokens.push(Token::Num(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(text[start..i].to_string()));
            }
            _ => {
                return Err(BridgeError::OffsetParse(format!(
                    "unexpected character '{}'",
                    c
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

// Precedence (loosest to tightest): | ^ & shifts additive multiplicative unary.
impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> BridgeResult<Node> {
        self.bit_or()
    }

    fn bit_or(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.bit_xor()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.bump();
            lhs = binary(BinOp::Or, lhs, self.bit_xor()?);
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.bit_and()?;
        while matches!(self.peek(), Some(Token::Caret)) {
            self.bump();
            lhs = binary(BinOp::Xor, lhs, self.bit_and()?);
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.shift()?;
        while matches!(self.peek(), Some(Token::Amp)) {
            self.bump();
            lhs = binary(BinOp::And, lhs, self.shift()?);
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Shl) => BinOp::Shl,
                Some(Token::Shr) => BinOp::Shr,
                _ => break,
            };
            self.bump();
            lhs = binary(op, lhs, self.additive()?);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            lhs = binary(op, lhs, self.multiplicative()?);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> BridgeResult<Node> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            lhs = binary(op, lhs, self.unary()?);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> BridgeResult<Node> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.bump();
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> BridgeResult<Node> {
        match self.bump() {
            Some(Token::Num(v)) => Ok(Node::Literal(v)),
            Some(Token::Ident(name)) => Ok(Node::Constant(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(BridgeError::OffsetParse("unbalanced parenthesis".into())),
                }
            }
            other => Err(BridgeError::OffsetParse(format!(
                "expected literal, constant, or '(', got {:?}",
                other
            ))),
        }
    }
}

fn binary(op: BinOp, lhs: Node, rhs: Node) -> Node {
    Node::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn eval_node(node: &Node, constants: &HashMap<String, i64>) -> BridgeResult<i128> {
    match node {
        Node::Literal(v) => Ok(*v),
        Node::Constant(name) => constants
            .get(name)
            .map(|&v| v as i128)
            .ok_or_else(|| BridgeError::OffsetParse(format!("unknown constant '{}'", name))),
        Node::Neg(inner) => Ok(-eval_node(inner, constants)?),
        Node::Binary { op, lhs, rhs } => {
            let l = eval_node(lhs, constants)?;
            let r = eval_node(rhs, constants)?;
            let out = match op {
                BinOp::Add => l.checked_add(r),
                BinOp::Sub => l.checked_sub(r),
                BinOp::Mul => l.checked_mul(r),
                BinOp::Div => {
                    if r == 0 {
                        return Err(BridgeError::OffsetParse("division by zero".into()));
                    }
                    l.checked_div(r)
                }
                BinOp::Rem => {
                    if r == 0 {
                        return Err(BridgeError::OffsetParse("division by zero".into()));
                    }
                    l.checked_rem(r)
                }
                BinOp::Shl => {
                    let shift = u32::try_from(r).map_err(|_| {
                        BridgeError::OffsetParse(format!("bad shift amount {}", r))
                    })?;
                    l.checked_shl(shift)
                }
                BinOp::Shr => {
                    let shift = u32::try_from(r).map_err(|_| {
                        BridgeError::OffsetParse(format!("bad shift amount {}", r))
                    })?;
                    l.checked_shr(shift)
                }
                BinOp::And => Some(l & r),
                BinOp::Or => Some(l | r),
                BinOp::Xor => Some(l ^ r),
            };
            out.ok_or_else(|| BridgeError::OffsetParse("arithmetic overflow".into()))
        }
    }
}
