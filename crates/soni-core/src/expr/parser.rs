//! Parser descendente-recursivo a AST.
//!
//! Una función por nivel de precedencia; los postfijos (miembro, índice,
//! llamada, filtro) se consumen en bucle tras el primario. Las llamadas sólo
//! aplican a identificadores pelados (builtins).

use serde_json::Value;

use super::eval::EvalError;
use super::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr> },
    Filter { expr: Box<Expr>, name: String },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

pub fn parse_expression(input: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Syntax(format!("trailing tokens after expression in '{input}'")));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvalError> {
        match self.bump() {
            Some(t) if &t == token => Ok(()),
            other => Err(EvalError::Syntax(format!("expected {token:?}, got {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary { op: BinOp::Or,
                                 lhs: Box::new(lhs),
                                 rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary { op: BinOp::And,
                                 lhs: Box::new(lhs),
                                 rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary { op,
                                 lhs: Box::new(lhs),
                                 rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary { op,
                                 lhs: Box::new(lhs),
                                 rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op,
                                 lhs: Box::new(lhs),
                                 rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Not,
                                 expr: Box::new(expr) })
            }
            Some(Token::Minus) => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Neg,
                                 expr: Box::new(expr) })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        other => return Err(EvalError::Syntax(format!("expected member name, got {other:?}"))),
                    }
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let index = self.parse_or()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Pipe) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Filter { expr: Box::new(expr),
                                                  name }
                        }
                        other => return Err(EvalError::Syntax(format!("expected filter name, got {other:?}"))),
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(EvalError::Syntax(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_postfix() {
        let expr = parse_expression("order.items[0].price").expect("parse");
        match expr {
            Expr::Member(inner, name) => {
                assert_eq!(name, "price");
                assert!(matches!(*inner, Expr::Index(_, _)));
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse_expression("a or b and c").expect("parse");
        match expr {
            Expr::Binary { op: BinOp::Or, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::And, .. }));
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn call_with_args() {
        let expr = parse_expression("max(1, 2)").expect("parse");
        assert_eq!(expr,
                   Expr::Call { name: "max".into(),
                                args: vec![Expr::Literal(json!(1)), Expr::Literal(json!(2))] });
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse_expression("1 2").is_err());
    }
}
