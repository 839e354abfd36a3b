//! Typed selection and derivation expressions over dataset columns.
//!
//! An [`Expr`] is a tree of literals, column references, arithmetic,
//! comparisons, logical connectives and function calls. Expressions can be
//! built programmatically (`Expr::col("fPt").ge(1.0)`) or parsed from the
//! string forms used in analysis configs; both spellings of the logical
//! operators are accepted (`&&`/`and`/`&`, `||`/`or`/`|`, `!`/`not`/`~`).
//!
//! Column references are resolved against a schema before evaluation
//! ([`CompiledExpr`]), so a typo in a cut is reported instead of silently
//! selecting nothing.

use std::fmt;
use std::str::FromStr;

use hs_core::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── AST ────────────────────────────────────────────────────────

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal. Booleans are 1 and 0.
    Literal(f64),
    /// Reference to a named column.
    Column(String),
    /// Arithmetic negation.
    Neg(Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Arithmetic operation.
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// Comparison, evaluates to 1 or 0.
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Conjunction / disjunction, evaluates to 1 or 0.
    Logic(LogicOp, Box<Expr>, Box<Expr>),
    /// Built-in function call.
    Call(Func, Vec<Expr>),
}

/// Arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `**`
    Pow,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Logical connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    /// Both operands true.
    And,
    /// Either operand true.
    Or,
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    /// `abs(x)`
    Abs,
    /// `sqrt(x)`
    Sqrt,
    /// Natural logarithm.
    Log,
    /// `exp(x)`
    Exp,
    /// `pow(x, y)`
    Pow,
    /// `min(x, y)`
    Min,
    /// `max(x, y)`
    Max,
    /// `sin(x)`
    Sin,
    /// `cos(x)`
    Cos,
    /// `tan(x)`
    Tan,
    /// `sinh(x)`
    Sinh,
    /// `cosh(x)`
    Cosh,
    /// `tanh(x)`
    Tanh,
    /// `arcsin(x)`
    Asin,
    /// `arccos(x)`
    Acos,
    /// `arctan(x)`
    Atan,
    /// `arctan2(y, x)`
    Atan2,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "sinh" => Func::Sinh,
            "cosh" => Func::Cosh,
            "tanh" => Func::Tanh,
            "arcsin" | "asin" => Func::Asin,
            "arccos" | "acos" => Func::Acos,
            "arctan" | "atan" => Func::Atan,
            "arctan2" | "atan2" => Func::Atan2,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Sqrt => "sqrt",
            Func::Log => "log",
            Func::Exp => "exp",
            Func::Pow => "pow",
            Func::Min => "min",
            Func::Max => "max",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Sinh => "sinh",
            Func::Cosh => "cosh",
            Func::Tanh => "tanh",
            Func::Asin => "arcsin",
            Func::Acos => "arccos",
            Func::Atan => "arctan",
            Func::Atan2 => "arctan2",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Pow | Func::Min | Func::Max | Func::Atan2 => 2,
            _ => 1,
        }
    }
}

// ── Builders ───────────────────────────────────────────────────

impl Expr {
    /// Column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Numeric literal.
    pub fn lit(value: f64) -> Self {
        Expr::Literal(value)
    }

    /// Always-true expression.
    pub fn truth() -> Self {
        Expr::Literal(1.0)
    }

    fn cmp(self, op: CmpOp, rhs: impl Into<Expr>) -> Self {
        Expr::Compare(op, Box::new(self), Box::new(rhs.into()))
    }

    /// `self > rhs`
    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Gt, rhs)
    }

    /// `self >= rhs`
    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Ge, rhs)
    }

    /// `self < rhs`
    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Lt, rhs)
    }

    /// `self <= rhs`
    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Le, rhs)
    }

    /// `self == rhs`
    pub fn equals(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Eq, rhs)
    }

    /// `self != rhs`
    pub fn not_equals(self, rhs: impl Into<Expr>) -> Self {
        self.cmp(CmpOp::Ne, rhs)
    }

    /// `self && rhs`
    pub fn and(self, rhs: Expr) -> Self {
        Expr::Logic(LogicOp::And, Box::new(self), Box::new(rhs))
    }

    /// `self || rhs`
    pub fn or(self, rhs: Expr) -> Self {
        Expr::Logic(LogicOp::Or, Box::new(self), Box::new(rhs))
    }

    /// Half-open range `lo <= self < hi`.
    pub fn in_range(self, lo: f64, hi: f64) -> Self {
        self.clone().ge(lo).and(self.lt(hi))
    }

    /// Function call.
    pub fn call(func: Func, args: Vec<Expr>) -> Self {
        Expr::Call(func, args)
    }

    /// Conjunction of all expressions; `truth()` when empty.
    pub fn all<I: IntoIterator<Item = Expr>>(exprs: I) -> Self {
        let mut it = exprs.into_iter();
        match it.next() {
            None => Expr::truth(),
            Some(first) => it.fold(first, Expr::and),
        }
    }

    /// Parse an expression string.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::InvalidExpression("empty expression".into()));
        }
        let mut parser = Parser::new(&tokens);
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(Error::InvalidExpression(format!(
                "unexpected token after expression in '{input}': {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(ast)
    }

    /// Column names referenced by this expression, ordered by first occurrence.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(name) => {
                if !out.iter().any(|c| c == name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(a) | Expr::Not(a) => a.collect_columns(out),
            Expr::Arith(_, a, b) | Expr::Compare(_, a, b) | Expr::Logic(_, a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }

    /// Resolve column references against `schema` (column names in storage order).
    ///
    /// On failure returns the first missing column name.
    pub fn bind(&self, schema: &[String]) -> std::result::Result<CompiledExpr, String> {
        let required = self.columns();
        let mut slots = Vec::with_capacity(required.len());
        for name in &required {
            match schema.iter().position(|s| s == name) {
                Some(i) => slots.push(i),
                None => return Err(name.clone()),
            }
        }
        let node = lower(self, &required);
        Ok(CompiledExpr { node, slots, required_columns: required })
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Column(name.to_string())
    }
}

macro_rules! arith_impl {
    ($tr:ident, $method:ident, $op:expr) => {
        impl std::ops::$tr for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::Arith($op, Box::new(self), Box::new(rhs))
            }
        }
        impl std::ops::$tr<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::Arith($op, Box::new(self), Box::new(Expr::Literal(rhs)))
            }
        }
    };
}

arith_impl!(Add, add, ArithOp::Add);
arith_impl!(Sub, sub, ArithOp::Sub);
arith_impl!(Mul, mul, ArithOp::Mul);
arith_impl!(Div, div, ArithOp::Div);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl FromStr for Expr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Expr::parse(s)
    }
}

// ── Rendering ──────────────────────────────────────────────────

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column(name) => f.write_str(name),
            Expr::Neg(a) => write!(f, "-{}", Paren(a)),
            Expr::Not(a) => write!(f, "!{}", Paren(a)),
            Expr::Arith(op, a, b) => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Pow => "**",
                };
                write!(f, "{} {sym} {}", Paren(a), Paren(b))
            }
            Expr::Compare(op, a, b) => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "{} {sym} {}", Paren(a), Paren(b))
            }
            Expr::Logic(op, a, b) => {
                let sym = match op {
                    LogicOp::And => "&&",
                    LogicOp::Or => "||",
                };
                write!(f, "{} {sym} {}", Paren(a), Paren(b))
            }
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Parenthesises compound sub-expressions when rendering.
struct Paren<'a>(&'a Expr);

impl fmt::Display for Paren<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::Literal(v) if *v < 0.0 => write!(f, "({v})"),
            Expr::Literal(_) | Expr::Column(_) | Expr::Call(..) => write!(f, "{}", self.0),
            other => write!(f, "({other})"),
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Expr::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ── Compiled expression ────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Number(f64),
    Var(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Arith(ArithOp, Box<Node>, Box<Node>),
    Compare(CmpOp, Box<Node>, Box<Node>),
    Logic(LogicOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

fn lower(e: &Expr, required: &[String]) -> Node {
    let b = |x: &Expr| Box::new(lower(x, required));
    match e {
        Expr::Literal(v) => Node::Number(*v),
        // `required` is built from the same tree, so the lookup always succeeds.
        Expr::Column(name) => {
            Node::Var(required.iter().position(|r| r == name).unwrap_or_default())
        }
        Expr::Neg(a) => Node::Neg(b(a)),
        Expr::Not(a) => Node::Not(b(a)),
        Expr::Arith(op, x, y) => Node::Arith(*op, b(x), b(y)),
        Expr::Compare(op, x, y) => Node::Compare(*op, b(x), b(y)),
        Expr::Logic(op, x, y) => Node::Logic(*op, b(x), b(y)),
        Expr::Call(f, args) => Node::Call(*f, args.iter().map(|a| lower(a, required)).collect()),
    }
}

/// An expression with column references resolved to storage slots.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    node: Node,
    /// Schema index of each referenced column.
    slots: Vec<usize>,
    /// Column names referenced by this expression (ordered by first occurrence).
    pub required_columns: Vec<String>,
}

impl CompiledExpr {
    /// Schema indices of the referenced columns, same order as `required_columns`.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Evaluate the expression for a single row.
    ///
    /// `values` must have the same length and order as `required_columns`.
    pub fn eval_row(&self, values: &[f64]) -> f64 {
        eval_node(&self.node, &|i| values[i])
    }

    /// Evaluate the expression for all rows.
    ///
    /// `columns` is the full column storage the expression was bound against.
    pub fn eval_bulk(&self, columns: &[Vec<f64>], n_rows: usize) -> Vec<f64> {
        let bound: Vec<&[f64]> = self.slots.iter().map(|&s| columns[s].as_slice()).collect();
        (0..n_rows).map(|row| eval_node(&self.node, &|i| bound[i][row])).collect()
    }
}

/// Truthiness used by filters and logical operators: nonzero and not NaN.
#[inline]
pub fn is_true(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

#[inline]
fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn eval_node(n: &Node, var: &dyn Fn(usize) -> f64) -> f64 {
    match n {
        Node::Number(v) => *v,
        Node::Var(i) => var(*i),
        Node::Neg(a) => -eval_node(a, var),
        Node::Not(a) => flag(!is_true(eval_node(a, var))),
        Node::Arith(op, a, b) => {
            let lhs = eval_node(a, var);
            let rhs = eval_node(b, var);
            match op {
                ArithOp::Add => lhs + rhs,
                ArithOp::Sub => lhs - rhs,
                ArithOp::Mul => lhs * rhs,
                ArithOp::Div => lhs / rhs,
                ArithOp::Pow => lhs.powf(rhs),
            }
        }
        Node::Compare(op, a, b) => {
            let lhs = eval_node(a, var);
            let rhs = eval_node(b, var);
            flag(match op {
                CmpOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
                CmpOp::Ne => (lhs - rhs).abs() >= f64::EPSILON,
                CmpOp::Lt => lhs < rhs,
                CmpOp::Le => lhs <= rhs,
                CmpOp::Gt => lhs > rhs,
                CmpOp::Ge => lhs >= rhs,
            })
        }
        Node::Logic(op, a, b) => {
            let lhs = is_true(eval_node(a, var));
            flag(match op {
                LogicOp::And => lhs && is_true(eval_node(b, var)),
                LogicOp::Or => lhs || is_true(eval_node(b, var)),
            })
        }
        Node::Call(f, args) => {
            let a0 = || eval_node(&args[0], var);
            let a1 = || eval_node(&args[1], var);
            match f {
                Func::Abs => a0().abs(),
                Func::Sqrt => a0().sqrt(),
                Func::Log => a0().ln(),
                Func::Exp => a0().exp(),
                Func::Pow => a0().powf(a1()),
                Func::Min => a0().min(a1()),
                Func::Max => a0().max(a1()),
                Func::Sin => a0().sin(),
                Func::Cos => a0().cos(),
                Func::Tan => a0().tan(),
                Func::Sinh => a0().sinh(),
                Func::Cosh => a0().cosh(),
                Func::Tanh => a0().tanh(),
                Func::Asin => a0().asin(),
                Func::Acos => a0().acos(),
                Func::Atan => a0().atan(),
                Func::Atan2 => a0().atan2(a1()),
            }
        }
    }
}

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if i + 1 < chars.len() {
            let two: String = chars[i..i + 2].iter().collect();
            let tok = match two.as_str() {
                "&&" => Some(Token::And),
                "||" => Some(Token::Or),
                "==" => Some(Token::Eq),
                "!=" => Some(Token::Ne),
                "<=" => Some(Token::Le),
                ">=" => Some(Token::Ge),
                "**" => Some(Token::StarStar),
                _ => None,
            };
            if let Some(t) = tok {
                tokens.push(t);
                i += 2;
                continue;
            }
        }

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '!' | '~' => Some(Token::Not),
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            _ => None,
        };
        if let Some(t) = single {
            tokens.push(t);
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && i > start
                        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
            {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            let n: f64 = s
                .parse()
                .map_err(|_| Error::InvalidExpression(format!("invalid number: '{s}'")))?;
            tokens.push(Token::Num(n));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "True" | "true" => Token::Num(1.0),
                "False" | "false" => Token::Num(0.0),
                _ => Token::Ident(word),
            });
        } else {
            return Err(Error::InvalidExpression(format!(
                "unexpected character '{c}' in '{input}'"
            )));
        }
    }

    Ok(tokens)
}

// ── Parser (recursive descent) ─────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(Error::InvalidExpression(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = lhs.or(rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = lhs.and(rhs);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let e = self.parse_not()?;
            return Ok(Expr::Not(Box::new(e)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_add()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let e = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(e)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            Some(Token::Not) => {
                self.advance();
                let e = self.parse_unary()?;
                Ok(Expr::Not(Box::new(e)))
            }
            _ => self.parse_power(),
        }
    }

    /// `atom ** unary`, right-associative and binding tighter than unary minus.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(Token::StarStar)) {
            self.advance();
            let exp = self.parse_unary()?;
            return Ok(Expr::Arith(ArithOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let func = Func::from_name(&name).ok_or_else(|| {
                        Error::InvalidExpression(format!("unknown function: '{name}'"))
                    })?;
                    let mut args = vec![self.parse_or()?];
                    while matches!(self.peek(), Some(Token::Comma)) {
                        self.advance();
                        args.push(self.parse_or()?);
                    }
                    self.expect(&Token::RParen)?;
                    if args.len() != func.arity() {
                        return Err(Error::InvalidExpression(format!(
                            "{}() takes {} argument(s), got {}",
                            func.name(),
                            func.arity(),
                            args.len()
                        )));
                    }
                    Ok(Expr::Call(func, args))
                } else {
                    Ok(Expr::Column(name))
                }
            }
            other => Err(Error::InvalidExpression(format!(
                "expected number, identifier, or '(', got {other:?}"
            ))),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, names: &[&str], row: &[f64]) -> f64 {
        let schema: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let e = Expr::parse(src).unwrap();
        let c = e.bind(&schema).unwrap();
        let values: Vec<f64> = c.slots().iter().map(|&s| row[s]).collect();
        c.eval_row(&values)
    }

    #[test]
    fn simple_arithmetic() {
        assert!((eval("2 + 3 * 4", &[], &[]) - 14.0).abs() < 1e-10);
        assert!((eval("(1 + 2) * (3 + 4)", &[], &[]) - 21.0).abs() < 1e-10);
        assert!((eval("1.5e2 + 3.0E-1", &[], &[]) - 150.3).abs() < 1e-10);
    }

    #[test]
    fn pandas_style_selection() {
        let names = ["fCosPA", "fNSigmaHe", "fIsMatter"];
        let src = "fCosPA > 0.998 and fNSigmaHe > -3 & fIsMatter == True";
        assert_eq!(eval(src, &names, &[0.999, -1.0, 1.0]), 1.0);
        assert_eq!(eval(src, &names, &[0.999, -1.0, 0.0]), 0.0);
        assert_eq!(eval(src, &names, &[0.990, -1.0, 1.0]), 0.0);
    }

    #[test]
    fn power_binds_tighter_than_minus() {
        assert!((eval("-x**2", &["x"], &[3.0]) + 9.0).abs() < 1e-10);
        assert!((eval("2**3**2", &[], &[]) - 512.0).abs() < 1e-10);
    }

    #[test]
    fn trig_and_hyperbolic() {
        let v = eval("pt * sinh(eta) + cos(phi)", &["pt", "eta", "phi"], &[2.0, 0.5, 0.0]);
        assert!((v - (2.0 * 0.5f64.sinh() + 1.0)).abs() < 1e-12);
        assert!((eval("arctan2(1, 1)", &[], &[]) - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn logical_not() {
        assert_eq!(eval("!(x > 3)", &["x"], &[2.0]), 1.0);
        assert_eq!(eval("not x > 3", &["x"], &[5.0]), 0.0);
    }

    #[test]
    fn builder_matches_parser() {
        let built = Expr::col("fPt").ge(1.0).and(Expr::col("fPt").lt(2.0));
        let parsed = Expr::parse(&built.to_string()).unwrap();
        assert_eq!(built, parsed);
        assert_eq!(built.columns(), vec!["fPt".to_string()]);
    }

    #[test]
    fn display_roundtrip_with_negative_literal() {
        let e = Expr::col("fNSigmaHe").gt(-3.0);
        let text = e.to_string();
        assert_eq!(text, "fNSigmaHe > (-3)");
        let schema = vec!["fNSigmaHe".to_string()];
        let c = Expr::parse(&text).unwrap().bind(&schema).unwrap();
        assert_eq!(c.eval_row(&[-2.0]), 1.0);
    }

    #[test]
    fn bind_reports_missing_column() {
        let e = Expr::parse("fPt > 1 && fMissing < 2").unwrap();
        let err = e.bind(&["fPt".to_string()]).unwrap_err();
        assert_eq!(err, "fMissing");
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Expr::parse("fPt >"), Err(Error::InvalidExpression(_))));
        assert!(matches!(Expr::parse("foo(1)"), Err(Error::InvalidExpression(_))));
        assert!(matches!(Expr::parse("pow(1)"), Err(Error::InvalidExpression(_))));
        assert!(matches!(Expr::parse("a $ b"), Err(Error::InvalidExpression(_))));
        assert!(matches!(Expr::parse("   "), Err(Error::InvalidExpression(_))));
    }

    #[test]
    fn all_of_empty_is_true() {
        assert_eq!(Expr::all(Vec::new()), Expr::truth());
        let e = Expr::all(vec![Expr::col("a").gt(1.0), Expr::col("b").lt(2.0)]);
        assert_eq!(e.columns(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn serde_as_string() {
        let e = Expr::col("fCt").in_range(2.0, 4.0);
        let json = serde_json::to_string(&e).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
