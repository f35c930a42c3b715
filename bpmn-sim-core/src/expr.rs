//! Condition Expression Evaluator
//!
//! Sequence-flow conditions are `${...}` placeholders wrapping a small
//! boolean expression over named context variables. The grammar is parsed
//! with nom and evaluated directly rather than handed to a general-purpose
//! evaluator, so condition text can never execute arbitrary code.
//!
//! Supported: `||`, `&&`, `!`, comparisons (`==`/`===`, `!=`/`!==`, `<`,
//! `<=`, `>`, `>=`), parentheses, `true`/`false`, numbers, quoted strings,
//! and identifiers resolved against the caller-supplied [`Context`].
//!
//! Unresolved variables evaluate to [`Value::Undefined`] unless the caller
//! configures a fallback. Undefined is falsy, unequal to every defined
//! value, and never satisfies an ordered comparison.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{alpha1, alphanumeric1, char, multispace0},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Values and context ───────────────────────────────────────

/// A condition-expression value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
    /// Result of looking up a variable absent from the context.
    Undefined,
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Undefined => false,
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Undefined, Value::Undefined) => true,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// Caller-supplied variable bindings, replaceable at any time.
pub type Context = BTreeMap<String, Value>;

/// Error raised for malformed condition text. The engine treats it as a
/// false condition after logging a warning; never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("malformed condition expression {0:?}")]
    Parse(String),
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Lit(Value),
    Var(String),
    Not(Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// ─── Public API ───────────────────────────────────────────────

/// Evaluate a flow's condition body against the context.
///
/// `body` is the raw condition text; a `${...}` wrapper is stripped when
/// present. An absent or blank condition means the flow is always viable,
/// so this returns `Ok(true)` for empty input.
/// `fallback` substitutes for every unresolved variable when set.
pub fn evaluate_condition(
    body: &str,
    ctx: &Context,
    fallback: Option<&Value>,
) -> Result<bool, ExprError> {
    let inner = strip_placeholder(body);
    if inner.is_empty() {
        return Ok(true);
    }
    let expr = parse(inner)?;
    Ok(eval(&expr, ctx, fallback).is_truthy())
}

fn strip_placeholder(body: &str) -> &str {
    let trimmed = body.trim();
    match trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

fn parse(input: &str) -> Result<Expr, ExprError> {
    match all_consuming(delimited(multispace0, or_expr, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(_) => Err(ExprError::Parse(input.to_string())),
    }
}

// ─── Evaluation ───────────────────────────────────────────────

fn eval(expr: &Expr, ctx: &Context, fallback: Option<&Value>) -> Value {
    match expr {
        Expr::Lit(v) => v.clone(),
        Expr::Var(name) => ctx
            .get(name)
            .cloned()
            .or_else(|| fallback.cloned())
            .unwrap_or(Value::Undefined),
        Expr::Not(inner) => Value::Bool(!eval(inner, ctx, fallback).is_truthy()),
        Expr::And(lhs, rhs) => {
            let l = eval(lhs, ctx, fallback);
            if !l.is_truthy() {
                return Value::Bool(false);
            }
            Value::Bool(eval(rhs, ctx, fallback).is_truthy())
        }
        Expr::Or(lhs, rhs) => {
            let l = eval(lhs, ctx, fallback);
            if l.is_truthy() {
                return Value::Bool(true);
            }
            Value::Bool(eval(rhs, ctx, fallback).is_truthy())
        }
        Expr::Cmp(op, lhs, rhs) => {
            let l = eval(lhs, ctx, fallback);
            let r = eval(rhs, ctx, fallback);
            Value::Bool(compare(op, &l, &r))
        }
    }
}

fn compare(op: &CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => l.loose_eq(r),
        CmpOp::Ne => !l.loose_eq(r),
        // Ordered comparison only between two numbers or two strings;
        // anything touching Undefined (or mixed types) is false.
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match (l, r) {
            (Value::Num(a), Value::Num(b)) => ordered(op, a.partial_cmp(b)),
            (Value::Str(a), Value::Str(b)) => ordered(op, Some(a.cmp(b))),
            _ => false,
        },
    }
}

fn ordered(op: &CmpOp, cmp: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, cmp) {
        (CmpOp::Lt, Some(Less)) => true,
        (CmpOp::Le, Some(Less | Equal)) => true,
        (CmpOp::Gt, Some(Greater)) => true,
        (CmpOp::Ge, Some(Greater | Equal)) => true,
        _ => false,
    }
}

// ─── Parsers ──────────────────────────────────────────────────

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(multispace0, inner)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), and_expr))(input)?;
    Ok((input, fold_binary(first, rest, |l, r| Expr::Or(l, r))))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), not_expr))(input)?;
    Ok((input, fold_binary(first, rest, |l, r| Expr::And(l, r))))
}

fn fold_binary(
    first: Expr,
    rest: Vec<Expr>,
    combine: impl Fn(Box<Expr>, Box<Expr>) -> Expr,
) -> Expr {
    rest.into_iter()
        .fold(first, |acc, e| combine(Box::new(acc), Box::new(e)))
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            // "!" must not swallow the head of "!=" / "!==".
            preceded(tuple((ws(char('!')), nom::combinator::not(char('=')))), not_expr),
            |e| Expr::Not(Box::new(e)),
        ),
        cmp_expr,
    ))(input)
}

fn cmp_expr(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = primary(input)?;
    let (input, tail) = opt(pair(ws(cmp_op), primary))(input)?;
    Ok((input, match tail {
        Some((op, rhs)) => Expr::Cmp(op, Box::new(lhs), Box::new(rhs)),
        None => lhs,
    }))
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("===")),
        value(CmpOp::Ne, tag("!==")),
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), or_expr, ws(char(')'))),
        string_literal,
        ident_or_keyword,
        map(double, |n| Expr::Lit(Value::Num(n))),
    )))(input)
}

fn ident_or_keyword(input: &str) -> IResult<&str, Expr> {
    map(identifier, |name: &str| match name {
        "true" => Expr::Lit(Value::Bool(true)),
        "false" => Expr::Lit(Value::Bool(false)),
        _ => Expr::Var(name.to_string()),
    })(input)
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    let single = delimited(char('\''), opt(is_not("'")), char('\''));
    let double_q = delimited(char('"'), opt(is_not("\"")), char('"'));
    map(alt((single, double_q)), |s: Option<&str>| {
        Expr::Lit(Value::Str(s.unwrap_or("").to_string()))
    })(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}
