//! Message selectors.
//!
//! A SQL-92 style predicate over message user properties, e.g.
//! `ek_ChannelName = 'MWeb' AND attempt < 3`. Supports `=`, `<>`, `<`,
//! `<=`, `>`, `>=`, `AND`, `OR`, `NOT`, parentheses and `IS [NOT] NULL`
//! over string, integer and boolean literals. Evaluation is three-valued: a
//! comparison against a missing property is unknown, and only a selector
//! that evaluates to true selects the message.

use std::cmp::Ordering;

use broker_client_core::{PropertyValue, Properties};
use thiserror::Error;

/// Selector parse error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of selector")]
    UnexpectedEnd,
    #[error("selector nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Deepest nesting of parentheses and `NOT` a selector may use.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Op(CmpOp),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Ident(String),
    Literal(PropertyValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    IsNull { ident: String, negated: bool },
    Value(Operand),
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    /// Parse a selector expression.
    ///
    /// # Errors
    /// Returns error if the expression is not well formed.
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(extra) = parser.tokens.get(parser.pos) {
            return Err(SelectorError::UnexpectedToken(format!("{extra:?}")));
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the selector evaluates to true for these properties.
    #[must_use]
    pub fn matches(&self, properties: &Properties) -> bool {
        eval(&self.expr, properties) == Some(true)
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, SelectorError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(SelectorError::UnterminatedString),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(char::is_ascii_digit) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| SelectorError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(SelectorError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, SelectorError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Expr, SelectorError>,
    ) -> Result<Expr, SelectorError> {
        if self.depth >= MAX_NESTING {
            return Err(SelectorError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SelectorError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectorError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.nested(Self::parse_or)?;
            return match self.next()? {
                Token::RParen => Ok(expr),
                other => Err(SelectorError::UnexpectedToken(format!("{other:?}"))),
            };
        }

        let left = self.parse_operand()?;
        match self.peek() {
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.peek() == Some(&Token::Not);
                if negated {
                    self.pos += 1;
                }
                match (self.next()?, left) {
                    (Token::Null, Operand::Ident(ident)) => Ok(Expr::IsNull { ident, negated }),
                    (other, _) => Err(SelectorError::UnexpectedToken(format!("{other:?}"))),
                }
            }
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare(left, op, right))
            }
            _ => Ok(Expr::Value(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, SelectorError> {
        match self.next()? {
            Token::Ident(name) => Ok(Operand::Ident(name)),
            Token::Str(s) => Ok(Operand::Literal(PropertyValue::String(s))),
            Token::Int(i) => Ok(Operand::Literal(PropertyValue::Int(i))),
            Token::True => Ok(Operand::Literal(PropertyValue::Bool(true))),
            Token::False => Ok(Operand::Literal(PropertyValue::Bool(false))),
            other => Err(SelectorError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

fn resolve<'a>(operand: &'a Operand, properties: &'a Properties) -> Option<&'a PropertyValue> {
    match operand {
        Operand::Ident(name) => properties.get(name),
        Operand::Literal(value) => Some(value),
    }
}

fn compare(left: &PropertyValue, op: CmpOp, right: &PropertyValue) -> Option<bool> {
    let ordering = match (left, right) {
        (PropertyValue::String(a), PropertyValue::String(b)) => a.cmp(b),
        (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
        (PropertyValue::Bool(a), PropertyValue::Bool(b)) => {
            return match op {
                CmpOp::Eq => Some(a == b),
                CmpOp::Ne => Some(a != b),
                _ => None,
            };
        }
        _ => return None,
    };
    Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn eval(expr: &Expr, properties: &Properties) -> Option<bool> {
    match expr {
        Expr::Or(a, b) => match (eval(a, properties), eval(b, properties)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::And(a, b) => match (eval(a, properties), eval(b, properties)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Not(inner) => eval(inner, properties).map(|b| !b),
        Expr::Compare(left, op, right) => {
            let left = resolve(left, properties)?;
            let right = resolve(right, properties)?;
            compare(left, *op, right)
        }
        Expr::IsNull { ident, negated } => Some(properties.contains_key(ident) == *negated),
        Expr::Value(operand) => match resolve(operand, properties)? {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_channel_selector() {
        let selector = Selector::parse(" ek_ChannelName = 'MWeb'").unwrap();
        assert_eq!(selector.source(), "ek_ChannelName = 'MWeb'");
        assert!(selector.matches(&props(&[("ek_ChannelName", "MWeb".into())])));
        assert!(!selector.matches(&props(&[("ek_ChannelName", "Branch".into())])));
        assert!(!selector.matches(&Properties::new()));
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        let selector = Selector::parse("a = 1 OR b = 2 AND NOT (c <> 'x')").unwrap();
        assert!(selector.matches(&props(&[("a", 1_i64.into())])));
        assert!(selector.matches(&props(&[("b", 2_i64.into()), ("c", "x".into())])));
        assert!(!selector.matches(&props(&[("b", 2_i64.into()), ("c", "y".into())])));
    }

    #[test]
    fn test_unknown_is_not_selected_even_when_negated() {
        let selector = Selector::parse("NOT missing = 'x'").unwrap();
        assert!(!selector.matches(&Properties::new()));
    }

    #[test]
    fn test_is_null() {
        let selector = Selector::parse("region IS NULL OR region IS NOT NULL AND urgent").unwrap();
        assert!(selector.matches(&Properties::new()));
        assert!(selector.matches(&props(&[("region", "eu".into()), ("urgent", true.into())])));
        assert!(!selector.matches(&props(&[("region", "eu".into()), ("urgent", false.into())])));
    }

    #[test]
    fn test_numeric_ordering_and_escaped_quote() {
        let selector = Selector::parse("attempt >= -1 AND attempt < 3 AND name = 'O''Hara'").unwrap();
        assert!(selector.matches(&props(&[("attempt", 0_i64.into()), ("name", "O'Hara".into())])));
        assert!(!selector.matches(&props(&[("attempt", 3_i64.into()), ("name", "O'Hara".into())])));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Selector::parse(""), Err(SelectorError::UnexpectedEnd));
        assert_eq!(Selector::parse("a = 'open"), Err(SelectorError::UnterminatedString));
        assert!(matches!(Selector::parse("a = = 1"), Err(SelectorError::UnexpectedToken(_))));
        assert!(matches!(Selector::parse("a # 1"), Err(SelectorError::UnexpectedChar('#', 2))));
        assert!(matches!(Selector::parse("(a = 1"), Err(SelectorError::UnexpectedEnd)));
    }

    #[test]
    fn test_nesting_is_capped() {
        let deep = format!("{}a = 1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert_eq!(Selector::parse(&deep), Err(SelectorError::TooDeep(MAX_NESTING)));
        let negations = format!("{}a", "NOT ".repeat(10_000));
        assert_eq!(Selector::parse(&negations), Err(SelectorError::TooDeep(MAX_NESTING)));

        let limit = format!("{}a = 1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(Selector::parse(&limit).unwrap().matches(&props(&[("a", 1_i64.into())])));
    }
}
