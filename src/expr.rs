use crate::pipelines::ParamValue;
use crate::poller::Commit;
use serde_json::{Number, Value};
use std::collections::HashMap;
use thiserror::Error;

/// A custom error describing the error cases for expression evaluation.
///
/// The three phases (parse, check, evaluate) fail with distinct variants so
/// diagnostics can tell them apart, even though callers report them all as a
/// single "expression evaluation failed" failure.
#[derive(Clone, Debug, Error)]
pub enum ExprError {
    /// The expression is not syntactically valid.
    #[error("failed to parse expression: {0}")]
    Parse(String),
    /// The expression references an undeclared name or an unknown method.
    #[error("failed to check expression: {0}")]
    Check(String),
    /// The expression didn't fit the shape of the evaluated payload.
    #[error("failed to evaluate expression: {0}")]
    Eval(String),
    /// The expression evaluated fine, but to a type that cannot become a
    /// pipeline parameter.
    #[error("{0}")]
    BadResultType(String),
}

/// The evaluation context for pipeline parameter expressions.
///
/// The commit payload is bound to the `context` identifier and the target's
/// repository URL to `repoURL`. Evaluation is read-only and repeatable.
pub struct Context {
    data: HashMap<String, Value>,
}

impl Context {
    /// Creates a new evaluation context from the repository URL and the
    /// polled commit payload.
    pub fn new(repo_url: &str, commit: &Commit) -> Self {
        let mut data = HashMap::new();
        data.insert("context".to_string(), Value::Object(commit.clone()));
        data.insert("repoURL".to_string(), Value::String(repo_url.to_string()));
        Self { data }
    }

    /// Evaluates the expression against this context, running the parse,
    /// check and evaluate phases in order.
    pub fn evaluate(&self, expression: &str) -> Result<Value, ExprError> {
        let ast = parse(expression)?;
        let mut scope: Vec<String> = self.data.keys().cloned().collect();
        check(&ast, &mut scope)?;
        eval(&ast, &self.data)
    }

    /// Evaluates the expression and converts the result to a pipeline
    /// parameter value.
    pub fn evaluate_to_param(&self, expression: &str) -> Result<ParamValue, ExprError> {
        value_to_param(&self.evaluate(expression)?)
    }
}

/// Converts an evaluated value to a pipeline parameter. Strings and numbers
/// become single values, lists of strings become multi-values; every other
/// type is rejected rather than coerced.
///
/// Numbers keep their shortest round-trip form: large magnitudes stay in
/// plain decimal notation (`100000000`, never `1e+08`) and a payload literal
/// `3.0` renders as `"3.0"` rather than being collapsed to `"3"`.
pub fn value_to_param(value: &Value) -> Result<ParamValue, ExprError> {
    match value {
        Value::String(s) => Ok(ParamValue::Single(s.clone())),
        Value::Number(n) => Ok(ParamValue::Single(n.to_string())),
        Value::Array(items) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => strings.push(s.clone()),
                    other => {
                        return Err(ExprError::BadResultType(format!(
                            "failed to convert {other} to a string"
                        )))
                    }
                }
            }
            Ok(ParamValue::Multi(strings))
        }
        _ => Err(ExprError::BadResultType(
            "expression must evaluate to a string, number, or list".to_string(),
        )),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => literal.push(c),
                        None => {
                            return Err(ExprError::Parse(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::Parse(format!("invalid number literal {literal}")))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => return Err(ExprError::Parse(format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Ident(String),
    Str(String),
    Num(f64),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Box<Expr>,
        method: String,
        var: String,
        body: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token == want => Ok(()),
            other => Err(ExprError::Parse(format!(
                "expected {want:?}, found {other:?}"
            ))),
        }
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(ExprError::Parse(format!(
                "expected an identifier, found {other:?}"
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = self.ident()?;
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let var = self.ident()?;
                        self.expect(Token::Comma)?;
                        let body = self.expression()?;
                        self.expect(Token::RParen)?;
                        expr = Expr::Call {
                            target: Box::new(expr),
                            method: name,
                            var,
                            body: Box::new(body),
                        };
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::Str(literal)) => Ok(Expr::Str(literal)),
            Some(Token::Num(number)) => Ok(Expr::Num(number)),
            other => Err(ExprError::Parse(format!(
                "expected an expression, found {other:?}"
            ))),
        }
    }
}

/// Phase one: parses the expression into a syntax tree.
fn parse(input: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExprError::Parse(format!(
            "unexpected trailing {token:?}"
        ))),
    }
}

/// Phase two: verifies every identifier is declared and every method is
/// supported, before anything is executed.
fn check(expr: &Expr, scope: &mut Vec<String>) -> Result<(), ExprError> {
    match expr {
        Expr::Ident(name) => {
            if scope.iter().any(|declared| declared == name) {
                Ok(())
            } else {
                Err(ExprError::Check(format!(
                    "undeclared reference to '{name}'"
                )))
            }
        }
        Expr::Str(_) | Expr::Num(_) => Ok(()),
        Expr::Member(target, _) => check(target, scope),
        Expr::Index(target, index) => {
            check(target, scope)?;
            check(index, scope)
        }
        Expr::Call {
            target,
            method,
            var,
            body,
        } => {
            if method != "map" {
                return Err(ExprError::Check(format!(
                    "unknown method '{method}', only map is supported"
                )));
            }
            check(target, scope)?;
            scope.push(var.clone());
            let result = check(body, scope);
            scope.pop();
            result
        }
    }
}

/// Phase three: evaluates the checked tree against the bound data.
fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Eval(format!("no such key: {name}"))),
        Expr::Str(literal) => Ok(Value::String(literal.clone())),
        Expr::Num(number) => Ok(number_value(*number)),
        Expr::Member(target, name) => match eval(target, env)? {
            Value::Object(map) => map
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::Eval(format!("no such key: {name}"))),
            other => Err(ExprError::Eval(format!(
                "cannot access field '{name}' on {other}"
            ))),
        },
        Expr::Index(target, index) => {
            let target = eval(target, env)?;
            let index = eval(index, env)?;
            match (target, index) {
                (Value::Object(map), Value::String(key)) => map
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("no such key: {key}"))),
                (Value::Array(items), Value::Number(n)) => {
                    let i = n
                        .as_u64()
                        .ok_or_else(|| ExprError::Eval(format!("invalid list index {n}")))?;
                    items
                        .get(i as usize)
                        .cloned()
                        .ok_or_else(|| ExprError::Eval(format!("index {i} out of range")))
                }
                (target, index) => Err(ExprError::Eval(format!(
                    "cannot index {target} with {index}"
                ))),
            }
        }
        Expr::Call {
            target, var, body, ..
        } => match eval(target, env)? {
            Value::Array(items) => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    let mut inner = env.clone();
                    inner.insert(var.clone(), item);
                    results.push(eval(body, &inner)?);
                }
                Ok(Value::Array(results))
            }
            other => Err(ExprError::Eval(format!("cannot map over {other}"))),
        },
    }
}

// Integral results keep their integer formatting when converted to params.
fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::Number(Number::from(number as i64))
    } else {
        Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
