//! Restricted expression evaluator for conditions, assignments and templating.
//!
//! Evaluation runs in three stages:
//! 1. `${name}` placeholders are replaced with the string form of the variable
//!    (unknown names are left untouched).
//! 2. The substituted text is matched, case-insensitively, against fixed
//!    true/false word sets.
//! 3. Otherwise the text is parsed as a small boolean/arithmetic/comparison
//!    language and evaluated against a read-only view of the variables.
//!
//! The grammar has literals, bare variable names, `and`/`or`/`not`,
//! comparisons and arithmetic. There is no member access, indexing, call
//! syntax or import of any kind. Any tokenize, parse or evaluation failure
//! yields the substituted text unchanged; evaluation never errors.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

const TRUE_WORDS: &[&str] = &["true", "yes", "1"];
const FALSE_WORDS: &[&str] = &["false", "no", "0"];
const MAX_DEPTH: usize = 64;
/// Bounds the syntax tree size, and with it the recursion depth of
/// evaluation, for long operator chains
const MAX_TOKENS: usize = 512;

/// Outcome of an evaluation, distinguishing a computed value from text that
/// could not be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Value(Value),
    Unevaluated(String),
}

impl Evaluation {
    pub fn into_value(self) -> Value {
        match self {
            Evaluation::Value(v) => v,
            Evaluation::Unevaluated(text) => Value::String(text),
        }
    }
}

/// Stateless evaluator; cheap to construct and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `expression`, falling back to the substituted text.
    pub fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> Value {
        self.evaluate_detailed(expression, variables).into_value()
    }

    pub fn evaluate_detailed(&self, expression: &str, variables: &HashMap<String, Value>) -> Evaluation {
        let substituted = self.substitute(expression, variables);
        let trimmed = substituted.trim();
        let lowered = trimmed.to_lowercase();

        if TRUE_WORDS.contains(&lowered.as_str()) {
            return Evaluation::Value(Value::Bool(true));
        }
        if FALSE_WORDS.contains(&lowered.as_str()) {
            return Evaluation::Value(Value::Bool(false));
        }

        let parsed = tokenize(trimmed).and_then(|tokens| Parser::new(tokens).parse());
        match parsed.and_then(|expr| eval(&expr, variables)) {
            Ok(value) => Evaluation::Value(value),
            Err(reason) => {
                tracing::trace!("expression {:?} left unevaluated: {}", trimmed, reason);
                Evaluation::Unevaluated(substituted)
            }
        }
    }

    /// Evaluate a condition. Unevaluable text is `None`; callers decide how
    /// to treat it.
    pub fn evaluate_condition(&self, expression: &str, variables: &HashMap<String, Value>) -> Option<bool> {
        match self.evaluate_detailed(expression, variables) {
            Evaluation::Value(v) => Some(is_truthy(&v)),
            Evaluation::Unevaluated(_) => None,
        }
    }

    /// Replace every `${name}` whose name resolves in `variables`.
    /// Dotted names walk into nested objects.
    pub fn substitute(&self, text: &str, variables: &HashMap<String, Value>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = after[..end].trim();
            match lookup(variables, name) {
                Some(value) => out.push_str(&value_to_string(value)),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }
}

/// Resolve `name` directly, then as a dotted path into nested objects
pub fn lookup<'a>(variables: &'a HashMap<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(v) = variables.get(name) {
        return Some(v);
    }
    let mut parts = name.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// String form used for substitution and string comparisons
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    And,
    Or,
    Not,
    True,
    False,
    Null,
    Op(BinOp),
    Cmp(CmpOp),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
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
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Rem));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, next_is_eq) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    ('<', true) => CmpOp::Le,
                    ('>', true) => CmpOp::Ge,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    _ => return Err(format!("unexpected '{}' at {}", c, i)),
                };
                tokens.push(Token::Cmp(op));
                i += if next_is_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or("dangling escape")?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                if is_float {
                    tokens.push(Token::Float(literal.parse().map_err(|_| "bad number")?));
                } else {
                    match literal.parse::<i64>() {
                        Ok(n) => tokens.push(Token::Int(n)),
                        Err(_) => tokens.push(Token::Float(literal.parse().map_err(|_| "bad number")?)),
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
        if tokens.len() > MAX_TOKENS {
            return Err(format!("expression longer than {} tokens", MAX_TOKENS));
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c` means `a < b and b <= c`
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".into());
        }
        let expr = self.or_expr()?;
        if self.pos != self.tokens.len() {
            return Err(format!("unexpected token {:?}", self.tokens[self.pos]));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".into());
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.not_expr()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let first = self.additive()?;
        let mut chain = Vec::new();
        while let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            chain.push((op, self.additive()?));
        }
        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Op(BinOp::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| "non-finite number".to_string()),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(format!("call syntax is not supported ({})", name));
                }
                Ok(Expr::Var(name))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or_expr()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".into()),
                }
            }
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, vars: &HashMap<String, Value>) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown variable '{}'", name)),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, vars)?))),
        Expr::Neg(inner) => match eval(inner, vars)? {
            Value::Number(n) => match n.as_i64() {
                Some(i) => i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| "integer overflow".to_string()),
                None => float_value(-n.as_f64().unwrap_or(0.0)),
            },
            other => Err(format!("cannot negate {}", other)),
        },
        Expr::And(left, right) => {
            let l = eval(left, vars)?;
            if is_truthy(&l) {
                eval(right, vars)
            } else {
                Ok(l)
            }
        }
        Expr::Or(left, right) => {
            let l = eval(left, vars)?;
            if is_truthy(&l) {
                Ok(l)
            } else {
                eval(right, vars)
            }
        }
        Expr::Binary(op, left, right) => arithmetic(*op, &eval(left, vars)?, &eval(right, vars)?),
        Expr::Compare(first, chain) => {
            let mut left = eval(first, vars)?;
            for (op, operand) in chain {
                let right = eval(operand, vars)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
    }
}

fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| "non-finite result".to_string())
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, String> {
    if let (BinOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Ok(Value::String(format!("{}{}", a, b)));
    }
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(format!("unsupported operands {} and {}", left, right));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Rem if y == 0 => return Err("modulo by zero".into()),
            BinOp::Rem => x.checked_rem(y).map(|r| if r != 0 && (r < 0) != (y < 0) { r + y } else { r }),
            BinOp::Div => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let x = a.as_f64().ok_or("bad number")?;
    let y = b.as_f64().ok_or("bad number")?;
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div if y == 0.0 => return Err("division by zero".into()),
        BinOp::Div => x / y,
        BinOp::Rem if y == 0.0 => return Err("modulo by zero".into()),
        BinOp::Rem => {
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r + y
            } else {
                r
            }
        }
    };
    float_value(result)
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => Ok(ordering.map(|o| o == Ordering::Equal).unwrap_or(left == right)),
        CmpOp::Ne => Ok(ordering.map(|o| o != Ordering::Equal).unwrap_or(left != right)),
        _ => {
            let ordering =
                ordering.ok_or_else(|| format!("cannot order {} and {}", left, right))?;
            Ok(match op {
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Ge => ordering != Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}
