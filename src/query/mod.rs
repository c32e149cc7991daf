//! Restrictions: predicates selecting a subset of an entity's records
//!
//! Supports key dictionaries and a boolean SQL subset:
//! - `AND`, `OR`, `NOT`, parentheses
//! - comparisons (`=`, `!=`, `<>`, `<`, `<=`, `>`, `>=`)
//! - `IS [NOT] NULL`, `[NOT] IN (...)`, `[NOT] LIKE` with `%` and `_`
//! - literals: numbers, quoted strings, `TRUE`/`FALSE`, `NULL`
//!
//! Conditions use three-valued logic; a row matches only when the
//! condition is true, so comparisons involving NULL never match.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

use std::cmp::Ordering;

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use crate::schema::{AttributeType, Entity, Row, Value};
use crate::{Error, Result};

/// A predicate over an entity's records.
///
/// # Example
///
/// ```
/// use element_session::query::Restriction;
/// use element_session::schema::Row;
///
/// let by_key = Restriction::key(Row::new().with("subject", "M01"));
/// let typed = Restriction::condition("session_type = 'ephys'");
/// let both = by_key.and(typed.not());
/// assert!(matches!(both, Restriction::And(ref parts) if parts.len() == 2));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Restriction {
    /// Every record
    #[default]
    All,
    /// Equality on the tuple's attributes that belong to the heading
    Key(Row),
    /// SQL boolean expression
    Condition(String),
    /// Conjunction
    And(Vec<Restriction>),
    /// Negation
    Not(Box<Restriction>),
}

impl Restriction {
    /// Restrict by key dictionary.
    #[must_use]
    pub const fn key(row: Row) -> Self {
        Self::Key(row)
    }

    /// Restrict by SQL condition.
    #[must_use]
    pub fn condition(sql: impl Into<String>) -> Self {
        Self::Condition(sql.into())
    }

    /// Conjunction with another restriction.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, r) | (r, Self::All) => r,
            (Self::And(mut parts), Self::And(more)) => {
                parts.extend(more);
                Self::And(parts)
            }
            (Self::And(mut parts), r) => {
                parts.push(r);
                Self::And(parts)
            }
            (l, r) => Self::And(vec![l, r]),
        }
    }

    /// Negation.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            r => Self::Not(Box::new(r)),
        }
    }

    /// Resolve attribute names and literals against `entity`.
    ///
    /// # Errors
    ///
    /// `ParseError` for malformed conditions, unsupported SQL, or
    /// attributes outside the heading.
    pub fn compile(&self, entity: &Entity) -> Result<Predicate> {
        let node = match self {
            Self::All => Node::Const(Some(true)),
            Self::Key(row) => compile_key(entity, row),
            Self::Condition(sql) => Compiler { entity }.node(&parse_condition(sql)?)?,
            Self::And(parts) => Node::And(
                parts
                    .iter()
                    .map(|p| p.compile(entity).map(|p| p.0))
                    .collect::<Result<_>>()?,
            ),
            Self::Not(inner) => Node::Not(Box::new(inner.compile(entity)?.0)),
        };
        Ok(Predicate(node))
    }
}

impl From<Row> for Restriction {
    fn from(row: Row) -> Self {
        Self::Key(row)
    }
}

impl From<&str> for Restriction {
    fn from(sql: &str) -> Self {
        Self::Condition(sql.to_string())
    }
}

/// A restriction resolved against an entity heading.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate(Node);

impl Predicate {
    /// Whether the row satisfies the restriction.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.0.eval(row) == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attr(String),
    Literal(Value),
}

impl Operand {
    fn value<'a>(&'a self, row: &'a Row) -> &'a Value {
        match self {
            Self::Attr(name) => row.get(name).unwrap_or(&Value::Null),
            Self::Literal(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn test(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::NotEq => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::LtEq => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::GtEq => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(Option<bool>),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Cmp(Operand, CmpOp, Operand),
    IsNull(Operand, bool),
    In(Operand, Vec<Operand>, bool),
    Like(Operand, String, bool),
    /// Key-dictionary equality; NULL matches NULL
    KeyEq(String, Value),
    Truthy(Operand),
}

impl Node {
    fn eval(&self, row: &Row) -> Option<bool> {
        match self {
            Self::Const(v) => *v,
            Self::And(nodes) => nodes.iter().try_fold(Some(true), |acc, n| match n.eval(row) {
                Some(false) => Err(()),
                None => Ok(None),
                Some(true) => Ok(acc),
            })
            .unwrap_or(Some(false)),
            Self::Or(nodes) => nodes.iter().try_fold(Some(false), |acc, n| match n.eval(row) {
                Some(true) => Err(()),
                None => Ok(None),
                Some(false) => Ok(acc),
            })
            .unwrap_or(Some(true)),
            Self::Not(node) => node.eval(row).map(|b| !b),
            Self::Cmp(l, op, r) => l.value(row).sql_cmp(r.value(row)).map(|o| op.test(o)),
            Self::IsNull(operand, negated) => Some(operand.value(row).is_null() != *negated),
            Self::In(operand, list, negated) => {
                let value = operand.value(row);
                if value.is_null() {
                    return None;
                }
                let mut unknown = false;
                for item in list {
                    match value.sql_cmp(item.value(row)) {
                        Some(Ordering::Equal) => return Some(!negated),
                        None => unknown = true,
                        Some(_) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(*negated)
                }
            }
            Self::Like(operand, pattern, negated) => match operand.value(row) {
                Value::Text(s) => Some(like(s, pattern) != *negated),
                _ => None,
            },
            Self::KeyEq(name, expected) => {
                let actual = row.get(name).unwrap_or(&Value::Null);
                Some(actual == expected)
            }
            Self::Truthy(operand) => match operand.value(row) {
                Value::Bool(b) => Some(*b),
                Value::Int(i) => Some(*i != 0),
                _ => None,
            },
        }
    }
}

fn parse_condition(sql: &str) -> Result<Expr> {
    let parse_error = |e: ParserError| Error::ParseError(format!("restriction `{sql}`: {e}"));
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_error)?;
    let expr = parser.parse_expr().map_err(parse_error)?;
    let trailing = parser.peek_token();
    if trailing.token != Token::EOF {
        return Err(Error::ParseError(format!(
            "restriction `{sql}`: unexpected `{}`",
            trailing.token
        )));
    }
    Ok(expr)
}

fn compile_key(entity: &Entity, row: &Row) -> Node {
    let mut nodes = Vec::new();
    for (name, value) in row.iter() {
        let Some(attr) = entity.attribute(name) else {
            continue;
        };
        match attr.attr_type().normalize(value.clone()) {
            Ok(value) => nodes.push(Node::KeyEq(name.to_string(), value)),
            // A value the attribute can never hold matches nothing.
            Err(_) => return Node::Const(Some(false)),
        }
    }
    Node::And(nodes)
}

struct Compiler<'a> {
    entity: &'a Entity,
}

impl Compiler<'_> {
    fn node(&self, expr: &Expr) -> Result<Node> {
        match expr {
            Expr::Nested(inner) => self.node(inner),
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And => Ok(Node::And(vec![self.node(left)?, self.node(right)?])),
                BinaryOperator::Or => Ok(Node::Or(vec![self.node(left)?, self.node(right)?])),
                _ => {
                    let op = cmp_op(op)?;
                    let (l, r) = self.operand_pair(left, right)?;
                    Ok(Node::Cmp(l, op, r))
                }
            },
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Ok(Node::Not(Box::new(self.node(expr)?))),
            Expr::IsNull(inner) => Ok(Node::IsNull(self.operand(inner, None)?, false)),
            Expr::IsNotNull(inner) => Ok(Node::IsNull(self.operand(inner, None)?, true)),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let target = self.operand(expr, None)?;
                let ty = self.type_of(&target);
                let list = list
                    .iter()
                    .map(|e| self.operand(e, ty))
                    .collect::<Result<_>>()?;
                Ok(Node::In(target, list, *negated))
            }
            Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let target = self.operand(expr, None)?;
                match self.operand(pattern, None)? {
                    Operand::Literal(Value::Text(p)) => Ok(Node::Like(target, p, *negated)),
                    _ => Err(Error::ParseError(format!(
                        "LIKE pattern must be a quoted string: {pattern}"
                    ))),
                }
            }
            Expr::Value(SqlValue::Boolean(b)) => Ok(Node::Const(Some(*b))),
            Expr::Value(SqlValue::Null) => Ok(Node::Const(None)),
            Expr::Identifier(_) => Ok(Node::Truthy(self.operand(expr, None)?)),
            other => Err(Error::ParseError(format!(
                "unsupported restriction expression: {other}"
            ))),
        }
    }

    fn type_of(&self, operand: &Operand) -> Option<&AttributeType> {
        match operand {
            Operand::Attr(name) => self.entity.attribute(name).map(|a| a.attr_type()),
            Operand::Literal(_) => None,
        }
    }

    /// Compile both sides of a comparison, coercing a literal to the type
    /// of the attribute on the other side where possible.
    fn operand_pair(&self, left: &Expr, right: &Expr) -> Result<(Operand, Operand)> {
        let l = self.operand(left, None)?;
        let r = self.operand(right, self.type_of(&l))?;
        if matches!(l, Operand::Literal(_)) {
            let l = self.operand(left, self.type_of(&r))?;
            return Ok((l, r));
        }
        Ok((l, r))
    }

    fn operand(&self, expr: &Expr, hint: Option<&AttributeType>) -> Result<Operand> {
        let literal = match expr {
            Expr::Nested(inner) => return self.operand(inner, hint),
            Expr::Identifier(ident) => {
                let name = ident.value.as_str();
                if self.entity.attribute(name).is_none() {
                    return Err(Error::ParseError(format!(
                        "unknown attribute `{name}` in restriction of `{}`",
                        self.entity.qualified_name()
                    )));
                }
                return Ok(Operand::Attr(name.to_string()));
            }
            Expr::Value(value) => literal(value)?,
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match self.operand(expr, None)? {
                Operand::Literal(Value::Int(i)) => Value::Int(-i),
                Operand::Literal(Value::Float(f)) => Value::Float(-f),
                _ => {
                    return Err(Error::ParseError(format!(
                        "cannot negate non-numeric operand: {expr}"
                    )))
                }
            },
            other => {
                return Err(Error::ParseError(format!(
                    "unsupported operand in restriction: {other}"
                )))
            }
        };
        let coerced = match hint {
            Some(ty) if !literal.is_null() => ty.normalize(literal.clone()).unwrap_or(literal),
            _ => literal,
        };
        Ok(Operand::Literal(coerced))
    }
}

fn cmp_op(op: &BinaryOperator) -> Result<CmpOp> {
    Ok(match op {
        BinaryOperator::Eq => CmpOp::Eq,
        BinaryOperator::NotEq => CmpOp::NotEq,
        BinaryOperator::Lt => CmpOp::Lt,
        BinaryOperator::LtEq => CmpOp::LtEq,
        BinaryOperator::Gt => CmpOp::Gt,
        BinaryOperator::GtEq => CmpOp::GtEq,
        other => {
            return Err(Error::ParseError(format!(
                "unsupported operator in restriction: {other}"
            )))
        }
    })
}

fn literal(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Number(n, _) => n
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| n.parse::<f64>().map(Value::Float))
            .map_err(|_| Error::ParseError(format!("invalid number `{n}`"))),
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(Error::ParseError(format!("unsupported literal: {other}"))),
    }
}

/// SQL `LIKE`: `%` matches any run, `_` any single character.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
