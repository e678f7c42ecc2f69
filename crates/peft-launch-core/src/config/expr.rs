//! Interpolation expressions and the closed operator table.
//!
//! A string scalar is parsed into a [`Template`]: literal text interleaved
//! with `${...}` interpolations. An interpolation is either a reference to
//! another key (`${model.micro_batch_size}`) or an operator call
//! (`${floor_div:${model.global_batch_size},8}`).

use serde_json::{Number, Value};

use super::error::{ConfigError, ConfigResult};

/// Operators available to config interpolations.
///
/// The set is closed: adding one means adding a variant and a row to
/// [`OPERATORS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `add(x, y) = x + y`
    Add,
    /// `floor_div(x, y) = x // y`, rounding toward negative infinity.
    FloorDiv,
    /// `if(cond, then, else)`
    If,
}

/// Static dispatch table from operator name to variant.
pub const OPERATORS: [(&str, Operator); 3] = [
    ("add", Operator::Add),
    ("floor_div", Operator::FloorDiv),
    ("if", Operator::If),
];

impl Operator {
    /// Look up an operator by its registered name.
    pub fn from_name(name: &str) -> Option<Self> {
        OPERATORS
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, op)| *op)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::FloorDiv => "floor_div",
            Operator::If => "if",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Operator::Add | Operator::FloorDiv => 2,
            Operator::If => 3,
        }
    }

    /// Apply the operator to already-resolved arguments.
    pub fn apply(self, args: &[Value], path: &str) -> ConfigResult<Value> {
        if args.len() != self.arity() {
            return Err(ConfigError::Arity {
                op: self.name(),
                expected: self.arity(),
                actual: args.len(),
                path: path.to_string(),
            });
        }
        match self {
            Operator::Add => add(&args[0], &args[1], path),
            Operator::FloorDiv => floor_div(&args[0], &args[1], path),
            Operator::If => Ok(if truthy(&args[0]) {
                args[1].clone()
            } else {
                args[2].clone()
            }),
        }
    }
}

fn mismatch(op: Operator, x: &Value, y: &Value, path: &str) -> ConfigError {
    ConfigError::TypeMismatch {
        op: op.name(),
        detail: format!("{} and {}", type_name(x), type_name(y)),
        path: path.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn float_value(x: f64, op: Operator, path: &str) -> ConfigResult<Value> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| ConfigError::TypeMismatch {
            op: op.name(),
            detail: format!("non-finite result {x}"),
            path: path.to_string(),
        })
}

fn add(x: &Value, y: &Value, path: &str) -> ConfigResult<Value> {
    match (x, y) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a
                .checked_add(b)
                .map(Value::from)
                .ok_or_else(|| ConfigError::TypeMismatch {
                    op: Operator::Add.name(),
                    detail: format!("{a} and {b} (integer overflow)"),
                    path: path.to_string(),
                }),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => float_value(a + b, Operator::Add, path),
                _ => Err(mismatch(Operator::Add, x, y, path)),
            },
        },
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(mismatch(Operator::Add, x, y, path)),
    }
}

/// Integer division rounding toward negative infinity.
pub fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn floor_div(x: &Value, y: &Value, path: &str) -> ConfigResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (x, y) else {
        return Err(mismatch(Operator::FloorDiv, x, y, path));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if b == 0 {
            return Err(ConfigError::DivisionByZero {
                path: path.to_string(),
            });
        }
        return floor_div_i64(a, b)
            .map(Value::from)
            .ok_or_else(|| ConfigError::TypeMismatch {
                op: Operator::FloorDiv.name(),
                detail: format!("{a} and {b} (integer overflow)"),
                path: path.to_string(),
            });
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(_), Some(b)) if b == 0.0 => Err(ConfigError::DivisionByZero {
            path: path.to_string(),
        }),
        (Some(a), Some(b)) => float_value((a / b).floor(), Operator::FloorDiv, path),
        _ => Err(mismatch(Operator::FloorDiv, x, y, path)),
    }
}

/// Truthiness used by the `if` operator.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A parsed string scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Interp(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Absolute dotted reference to another key.
    Ref(String),
    Call { op: Operator, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Template(Template),
    /// Quoted argument holding interpolations; always resolves to a string.
    Quoted(Template),
}

impl Template {
    /// Whether a raw string contains anything to interpolate.
    pub fn is_candidate(raw: &str) -> bool {
        raw.contains("${")
    }

    /// The single interpolation of a string like `"${a.b}"`, if that is all it holds.
    pub fn as_single(&self) -> Option<&Expr> {
        match self.segments.as_slice() {
            [Segment::Interp(expr)] => Some(expr),
            _ => None,
        }
    }

    /// Parse a string scalar found at `path`.
    pub fn parse(raw: &str, path: &str) -> ConfigResult<Self> {
        let mut parser = Parser {
            chars: raw.chars().collect(),
            pos: 0,
            raw,
            path,
        };
        parser.template(&[])
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    raw: &'a str,
    path: &'a str,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> ConfigError {
        ConfigError::Parse {
            expr: self.raw.to_string(),
            reason: format!("{reason} (at {})", self.path),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn starts_interp(&self) -> bool {
        self.peek() == Some('$') && self.chars.get(self.pos + 1) == Some(&'{')
    }

    /// Parse text and interpolations until one of `stops` at depth zero.
    fn template(&mut self, stops: &[char]) -> ConfigResult<Template> {
        let mut segments = Vec::new();
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if self.starts_interp() {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                self.pos += 2;
                segments.push(Segment::Interp(self.interp()?));
                continue;
            }
            if stops.contains(&c) {
                break;
            }
            text.push(c);
            self.pos += 1;
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Template { segments })
    }

    /// Parse the body of `${...}`; the opening `${` is already consumed.
    fn interp(&mut self) -> ConfigResult<Expr> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ':' || c == '}' {
                break;
            }
            if self.starts_interp() {
                return Err(self.error("nested interpolation in key position"));
            }
            self.pos += 1;
        }
        let head: String = self.chars[start..self.pos].iter().collect();
        let head = head.trim().to_string();
        match self.peek() {
            None => Err(self.error("unterminated `${`")),
            Some('}') => {
                self.pos += 1;
                if head.is_empty() {
                    return Err(self.error("empty interpolation"));
                }
                Ok(Expr::Ref(head))
            }
            Some(_) => {
                self.pos += 1;
                let op = Operator::from_name(&head).ok_or_else(|| ConfigError::UnknownOperator {
                    name: head.clone(),
                    path: self.path.to_string(),
                })?;
                let args = self.args()?;
                Ok(Expr::Call { op, args })
            }
        }
    }

    /// Parse a comma separated argument list up to and including the closing `}`.
    fn args(&mut self) -> ConfigResult<Vec<Arg>> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            self.skip_ws();
            let arg = match self.peek() {
                Some(q @ ('\'' | '"')) => {
                    let text = self.quoted(q)?;
                    if Template::is_candidate(&text) {
                        Arg::Quoted(Template::parse(&text, self.path)?)
                    } else {
                        Arg::Literal(Value::String(text))
                    }
                }
                _ => {
                    let template = self.template(&[',', '}'])?;
                    arg_from_template(template)
                }
            };
            args.push(arg);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.error("unterminated argument list")),
            }
        }
    }

    fn quoted(&mut self, quote: char) -> ConfigResult<String> {
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '\\' => {
                    if let Some(next) = self.peek() {
                        out.push(next);
                        self.pos += 1;
                    }
                }
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
        Err(self.error("unterminated quoted string"))
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }
}

fn arg_from_template(mut template: Template) -> Arg {
    if let Some(Segment::Text(last)) = template.segments.last_mut() {
        let trimmed = last.trim_end().to_string();
        *last = trimmed;
    }
    template
        .segments
        .retain(|s| !matches!(s, Segment::Text(t) if t.is_empty()));
    match template.segments.as_slice() {
        [] => Arg::Literal(Value::String(String::new())),
        [Segment::Text(text)] => Arg::Literal(parse_scalar(text)),
        _ => Arg::Template(template),
    }
}

/// Parse a bare scalar the way YAML would (`8` -> int, `true` -> bool, ...).
pub fn parse_scalar(text: &str) -> Value {
    match serde_yaml::from_str::<Value>(text) {
        Ok(v @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
        _ => Value::String(text.to_string()),
    }
}
