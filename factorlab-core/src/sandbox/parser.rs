//! Pratt parser for the factor expression language.
//!
//! Grammar (lowest to highest precedence):
//! comparison < addition < multiplication < unary minus < power (right-assoc)
//! < atoms (number, column, call, parenthesized expression).

use super::lexer::Token;
use super::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Parsed expression tree. There is deliberately no attribute access,
/// indexing, assignment, loop, or statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Column(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

/// Parse a token stream into an expression tree.
pub fn parse(tokens: &[Token]) -> Result<Expr, SandboxError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    if let Some(tok) = parser.peek() {
        return Err(SandboxError::ParseError(format!(
            "unexpected trailing token {tok:?}"
        )));
    }
    Ok(expr)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SandboxError> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(SandboxError::ParseError(format!(
                "expected {expected:?}, found {tok:?}"
            ))),
            None => Err(SandboxError::ParseError(format!(
                "expected {expected:?}, found end of formula"
            ))),
        }
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, SandboxError> {
        let mut lhs = self.prefix()?;

        while let Some(tok) = self.peek() {
            let (op, left_bp, right_bp) = match binary_op(tok) {
                Some(entry) => entry,
                None => break,
            };
            if left_bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.expression(right_bp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, SandboxError> {
        match self.advance().cloned() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Minus) => {
                // Binds tighter than multiplication, looser than power.
                let operand = self.expression(7)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            Some(Token::LParen) => {
                let expr = self.expression(0)?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression(0)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.advance();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call { func: name, args })
                } else {
                    Ok(Expr::Column(name))
                }
            }
            Some(tok) => Err(SandboxError::ParseError(format!(
                "unexpected token {tok:?}"
            ))),
            None => Err(SandboxError::ParseError("unexpected end of formula".into())),
        }
    }
}

/// Operator table: (op, left binding power, right binding power).
/// Power is right-associative (right bp below its left bp).
fn binary_op(tok: &Token) -> Option<(BinaryOp, u8, u8)> {
    Some(match tok {
        Token::Lt => (BinaryOp::Lt, 1, 2),
        Token::Le => (BinaryOp::Le, 1, 2),
        Token::Gt => (BinaryOp::Gt, 1, 2),
        Token::Ge => (BinaryOp::Ge, 1, 2),
        Token::EqEq => (BinaryOp::Eq, 1, 2),
        Token::Ne => (BinaryOp::Ne, 1, 2),
        Token::Plus => (BinaryOp::Add, 3, 4),
        Token::Minus => (BinaryOp::Sub, 3, 4),
        Token::Star => (BinaryOp::Mul, 5, 6),
        Token::Slash => (BinaryOp::Div, 5, 6),
        Token::Percent => (BinaryOp::Rem, 5, 6),
        Token::Caret => (BinaryOp::Pow, 9, 8),
        _ => return None,
    })
}
