//! Whitelisted expression interpreter used by transform nodes and loop
//! break conditions.
//!
//! The grammar covers literals, variables, field access, indexing,
//! arithmetic, comparison and boolean logic. There are no function calls,
//! assignments or any other way to reach host code.

use crate::{ExprError, Value};
use std::collections::BTreeMap;
use std::fmt;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    const OPS: [&str; 15] = [
        "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "=",
    ];

    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse::<f64>().map_err(|_| ExprError::Syntax {
                position: start,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push((start, Token::Number(n)));
        } else if c == '"' || c == '\'' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        return Err(ExprError::Syntax {
                            position: start,
                            message: "unterminated string".to_string(),
                        })
                    }
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        if let Some(&escaped) = chars.get(i + 1) {
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        i += 2;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push((start, Token::Str(text)));
        } else if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
        } else {
            let single = match c {
                '(' => Some(Token::LParen),
                ')' => Some(Token::RParen),
                '[' => Some(Token::LBracket),
                ']' => Some(Token::RBracket),
                '.' => Some(Token::Dot),
                _ => None,
            };
            if let Some(token) = single {
                tokens.push((start, token));
                i += 1;
                continue;
            }
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPS
                .iter()
                .find(|op| rest.starts_with(*op))
                .ok_or_else(|| ExprError::Syntax {
                    position: start,
                    message: format!("unexpected character '{}'", c),
                })?;
            if *op == "=" {
                return Err(ExprError::Syntax {
                    position: start,
                    message: "assignment is not allowed, use '=='".to_string(),
                });
            }
            tokens.push((start, Token::Op(op)));
            i += op.len();
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn from_token(op: &str) -> Option<(Self, u8)> {
        let entry = match op {
            "||" => (BinaryOp::Or, 1),
            "&&" => (BinaryOp::And, 2),
            "==" => (BinaryOp::Eq, 3),
            "!=" => (BinaryOp::Ne, 3),
            "<" => (BinaryOp::Lt, 4),
            "<=" => (BinaryOp::Le, 4),
            ">" => (BinaryOp::Gt, 4),
            ">=" => (BinaryOp::Ge, 4),
            "+" => (BinaryOp::Add, 5),
            "-" => (BinaryOp::Sub, 5),
            "*" => (BinaryOp::Mul, 6),
            "/" => (BinaryOp::Div, 6),
            "%" => (BinaryOp::Rem, 6),
            _ => return None,
        };
        Some(entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        self.enter()?;
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let Some((op, prec)) = BinaryOp::from_token(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op("-")) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Op("!")) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Not(Box::new(inner)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.peek().cloned() {
                        Some(Token::Ident(name)) => {
                            self.pos += 1;
                            expr = Expr::Field(Box::new(expr), name);
                        }
                        _ => return Err(self.error("expected field name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.binary(1)?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Var(name),
            }),
            Token::LParen => {
                let inner = self.binary(1)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            _ => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
        }
    }
}

/// Variables visible to an expression.
pub type Bindings = BTreeMap<&'static str, Value>;

/// A parsed expression, safe to evaluate any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.chars().count(),
        };
        let ast = parser.binary(1)?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, bindings: &Bindings) -> Result<Value, ExprError> {
        eval(&self.ast, bindings)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => bindings
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
        Expr::Field(target, field) => match eval(target, bindings)? {
            Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(ExprError::Type(format!(
                "cannot read field '{}' of {}",
                field,
                other.type_name()
            ))),
        },
        Expr::Index(target, index) => {
            let target = eval(target, bindings)?;
            let index = eval(index, bindings)?;
            match (&target, &index) {
                (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
                    Ok(items.get(*n as usize).cloned().unwrap_or(Value::Null))
                }
                (Value::Object(map), Value::String(key)) => {
                    Ok(map.get(key).cloned().unwrap_or(Value::Null))
                }
                (Value::Null, _) => Ok(Value::Null),
                _ => Err(ExprError::Type(format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    index.type_name()
                ))),
            }
        }
        Expr::Neg(inner) => match eval(inner, bindings)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(ExprError::Type(format!("cannot negate {}", other.type_name()))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, bindings)?.is_truthy())),
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !eval(lhs, bindings)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, bindings)?.is_truthy()))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if eval(lhs, bindings)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, bindings)?.is_truthy()))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            binary(*op, lhs, rhs)
        }
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;
    match op {
        Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        Ne => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        Lt | Le | Gt | Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                _ => {
                    return Err(ExprError::Type(format!(
                        "cannot compare {} with {}",
                        lhs.type_name(),
                        rhs.type_name()
                    )))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        Add => match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", lhs.to_text(), rhs.to_text())))
            }
            _ => Err(arith_error("add", &lhs, &rhs)),
        },
        Sub | Mul | Div | Rem => {
            let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
                return Err(arith_error("apply arithmetic to", &lhs, &rhs));
            };
            match op {
                Sub => Ok(Value::Number(a - b)),
                Mul => Ok(Value::Number(a * b)),
                Div | Rem if *b == 0.0 => Err(ExprError::DivisionByZero),
                Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
        And | Or => unreachable!("short-circuit operators are evaluated in eval"),
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn arith_error(verb: &str, lhs: &Value, rhs: &Value) -> ExprError {
    ExprError::Type(format!(
        "cannot {} {} and {}",
        verb,
        lhs.type_name(),
        rhs.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with_x(source: &str, x: Value) -> Result<Value, ExprError> {
        let mut bindings = Bindings::new();
        bindings.insert("x", x);
        Expression::parse(source)?.evaluate(&bindings)
    }

    #[test]
    fn test_comparison_and_arithmetic() {
        assert_eq!(eval_with_x("x > 2", Value::from(3)).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_x("x * 2 + 1", Value::from(4)).unwrap(), Value::Number(9.0));
        assert_eq!(eval_with_x("(x + 1) * 2", Value::from(4)).unwrap(), Value::Number(10.0));
        assert_eq!(eval_with_x("-x % 3", Value::from(7)).unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn test_field_access_and_indexing() {
        let mut profile = BTreeMap::new();
        profile.insert("name".to_string(), Value::from("Acme"));
        profile.insert("tags".to_string(), Value::from(vec!["a", "b"]));
        let x = Value::Object(profile);

        assert_eq!(eval_with_x("x.name", x.clone()).unwrap(), Value::from("Acme"));
        assert_eq!(eval_with_x("x.tags[1]", x.clone()).unwrap(), Value::from("b"));
        assert_eq!(eval_with_x("x[\"name\"] == 'Acme'", x.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_x("x.missing", x).unwrap(), Value::Null);
    }

    #[test]
    fn test_logic_short_circuits() {
        // The right-hand side would fail with an unknown variable if evaluated.
        assert_eq!(eval_with_x("x || nope", Value::Bool(true)).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_x("x && nope", Value::Bool(false)).unwrap(), Value::Bool(false));
        assert_eq!(eval_with_x("!x", Value::Null).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            eval_with_x("'brand: ' + x", Value::from("Acme")).unwrap(),
            Value::from("brand: Acme")
        );
        assert_eq!(eval_with_x("x + 1", Value::from("v")).unwrap(), Value::from("v1"));
    }

    #[test]
    fn test_rejects_anything_outside_the_grammar() {
        assert!(matches!(Expression::parse("x = 1"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("len(x)"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("x >"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("x; y"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("'open"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(eval_with_x("x / 0", Value::from(1)), Err(ExprError::DivisionByZero));
        assert_eq!(
            eval_with_x("y + 1", Value::Null),
            Err(ExprError::UnknownVariable("y".to_string()))
        );
        assert!(matches!(eval_with_x("x > 1", Value::from("a")), Err(ExprError::Type(_))));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let deep = format!("{}x{}", "(".repeat(200), ")".repeat(200));
        assert!(Expression::parse(&deep).is_err());
    }
}
