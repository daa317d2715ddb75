//! Small expression language for answer comparison.
//!
//! Covers what final answers actually look like: numbers, single-letter
//! variables (optionally subscripted), `+ - * / ^`, implicit multiplication,
//! `\frac`, `\sqrt[n]`, `\pi`, `\infty`, and the elementary functions.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::{E, PI};

/// Function names recognized with or without a leading backslash.
const FUNCTION_NAMES: [&str; 9] = ["sin", "cos", "tan", "sec", "csc", "cot", "ln", "log", "exp"];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(String),
    Var(String),
    Cmd(String),
    Op(char),
    Open(char),
    Close(char),
}

impl Token {
    /// Whether this token can start an implicitly multiplied factor.
    fn starts_factor(&self) -> bool {
        matches!(
            self,
            Token::Num(_) | Token::Var(_) | Token::Open(_) | Token::Cmd(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Ln,
    Log,
    Exp,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "sec" => Self::Sec,
            "csc" => Self::Csc,
            "cot" => Self::Cot,
            "ln" => Self::Ln,
            "log" => Self::Log,
            "exp" => Self::Exp,
            _ => return None,
        })
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Sec => 1.0 / x.cos(),
            Self::Csc => 1.0 / x.sin(),
            Self::Cot => 1.0 / x.tan(),
            Self::Ln => x.ln(),
            Self::Log => x.log10(),
            Self::Exp => x.exp(),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    /// `index`-th root; square root when `None`
    Root(Option<Box<Expr>>, Box<Expr>),
    Call(Func, Box<Expr>),
}

impl Expr {
    /// Parse an already normalized answer. `None` when it is not an expression.
    pub fn parse(input: &str) -> Option<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() || tokens.len() > MAX_TOKENS {
            return None;
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        (parser.pos == parser.tokens.len()).then_some(expr)
    }

    /// Free variable names.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(e) | Expr::Call(_, e) => e.collect_variables(out),
            Expr::Root(index, e) => {
                if let Some(index) = index {
                    index.collect_variables(out);
                }
                e.collect_variables(out);
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
        }
    }

    /// Evaluate with the given bindings. `None` on an unbound variable or a
    /// division by zero; other domain errors come back as NaN.
    pub fn eval(&self, vars: &BTreeMap<String, f64>) -> Option<f64> {
        Some(match self {
            Expr::Num(v) => *v,
            Expr::Var(name) => *vars.get(name)?,
            Expr::Neg(e) => -e.eval(vars)?,
            Expr::Add(a, b) => a.eval(vars)? + b.eval(vars)?,
            Expr::Sub(a, b) => a.eval(vars)? - b.eval(vars)?,
            Expr::Mul(a, b) => a.eval(vars)? * b.eval(vars)?,
            Expr::Div(a, b) => {
                let denominator = b.eval(vars)?;
                if denominator == 0.0 {
                    return None;
                }
                a.eval(vars)? / denominator
            }
            Expr::Pow(a, b) => a.eval(vars)?.powf(b.eval(vars)?),
            Expr::Root(index, e) => {
                let n = match index {
                    Some(index) => index.eval(vars)?,
                    None => 2.0,
                };
                let x = e.eval(vars)?;
                let odd = n.fract() == 0.0 && (n as i64) % 2 != 0;
                if x < 0.0 && odd {
                    -(-x).powf(1.0 / n)
                } else {
                    x.powf(1.0 / n)
                }
            }
            Expr::Call(f, e) => f.apply(e.eval(vars)?),
        })
    }
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                if raw == "." || raw.matches('.').count() > 1 {
                    return None;
                }
                tokens.push(Token::Num(raw));
            }
            '\\' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                if i == start {
                    let symbol = *chars.get(i)?;
                    i += 1;
                    match symbol {
                        '{' => tokens.push(Token::Open('{')),
                        '}' => tokens.push(Token::Close('}')),
                        ',' | ';' | ':' | '!' | ' ' => {}
                        _ => return None,
                    }
                    continue;
                }
                let name: String = chars[start..i].iter().collect();
                match name.as_str() {
                    "left" | "right" | "displaystyle" | "quad" | "qquad" => {}
                    "cdot" | "times" | "ast" => tokens.push(Token::Op('*')),
                    "div" => tokens.push(Token::Op('/')),
                    "dfrac" | "tfrac" => tokens.push(Token::Cmd("frac".to_string())),
                    _ => tokens.push(Token::Cmd(name)),
                }
            }
            'a'..='z' | 'A'..='Z' => {
                if let Some(name) = FUNCTION_NAMES.iter().find(|name| {
                    let end = i + name.len();
                    end <= chars.len() && chars[i..end].iter().copied().eq(name.chars())
                }) {
                    tokens.push(Token::Cmd(name.to_string()));
                    i += name.len();
                    continue;
                }

                let mut name = c.to_string();
                i += 1;
                if chars.get(i) == Some(&'_') {
                    i += 1;
                    name.push('_');
                    if chars.get(i) == Some(&'{') {
                        i += 1;
                        while i < chars.len() && chars[i] != '}' {
                            name.push(chars[i]);
                            i += 1;
                        }
                        chars.get(i)?;
                        i += 1;
                    } else {
                        name.push(*chars.get(i)?);
                        i += 1;
                    }
                }
                tokens.push(Token::Var(name));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op('^'));
                i += 2;
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' | '[' | '{' => {
                tokens.push(Token::Open(c));
                i += 1;
            }
            ')' | ']' | '}' => {
                tokens.push(Token::Close(c));
                i += 1;
            }
            'π' => {
                tokens.push(Token::Cmd("pi".to_string()));
                i += 1;
            }
            '√' => {
                tokens.push(Token::Cmd("sqrt".to_string()));
                i += 1;
            }
            '×' | '·' => {
                tokens.push(Token::Op('*'));
                i += 1;
            }
            '÷' => {
                tokens.push(Token::Op('/'));
                i += 1;
            }
            '−' => {
                tokens.push(Token::Op('-'));
                i += 1;
            }
            _ => return None,
        }
    }

    Some(tokens)
}

fn closes(open: char, close: char) -> bool {
    matches!((open, close), ('(', ')') | ('[', ']') | ('{', '}'))
}

/// Longest token sequence the parser accepts.
const MAX_TOKENS: usize = 512;

/// Deepest nesting of `unary`/`primary` frames before the parse is abandoned.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Run one recursive step, failing the parse once nesting gets too deep.
    fn nested(&mut self, step: fn(&mut Self) -> Option<Expr>) -> Option<Expr> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let out = step(self);
        self.depth -= 1;
        out
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn expr(&mut self) -> Option<Expr> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Op('+')) => {
                    self.pos += 1;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Token::Op('-')) => {
                    self.pos += 1;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Some(lhs),
            }
        }
    }

    fn term(&mut self) -> Option<Expr> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Op('*')) => {
                    self.pos += 1;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(Token::Op('/')) => {
                    self.pos += 1;
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(token) if token.starts_factor() => {
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.power()?));
                }
                _ => return Some(lhs),
            }
        }
    }

    fn unary(&mut self) -> Option<Expr> {
        self.nested(Self::signed)
    }

    fn signed(&mut self) -> Option<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Some(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Option<Expr> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Op('^')) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Some(Expr::Pow(Box::new(base), Box::new(exponent)));
        }
        Some(base)
    }

    fn primary(&mut self) -> Option<Expr> {
        self.nested(Self::atom)
    }

    fn atom(&mut self) -> Option<Expr> {
        match self.next()? {
            Token::Num(raw) => raw.parse().ok().map(Expr::Num),
            Token::Var(name) if name == "e" => Some(Expr::Num(E)),
            Token::Var(name) => Some(Expr::Var(name)),
            Token::Open(open) => {
                let inner = self.expr()?;
                match self.next()? {
                    Token::Close(close) if closes(open, close) => Some(inner),
                    _ => None,
                }
            }
            Token::Cmd(name) => self.command(&name),
            Token::Op(_) | Token::Close(_) => None,
        }
    }

    fn command(&mut self, name: &str) -> Option<Expr> {
        match name {
            "pi" => Some(Expr::Num(PI)),
            "infty" | "infinity" => Some(Expr::Num(f64::INFINITY)),
            "frac" => {
                let numerator = self.argument()?;
                let denominator = self.argument()?;
                Some(Expr::Div(Box::new(numerator), Box::new(denominator)))
            }
            "sqrt" => {
                let index = if self.peek() == Some(Token::Open('[')) {
                    self.pos += 1;
                    let index = self.expr()?;
                    if self.next()? != Token::Close(']') {
                        return None;
                    }
                    Some(Box::new(index))
                } else {
                    None
                };
                let radicand = self.argument()?;
                Some(Expr::Root(index, Box::new(radicand)))
            }
            _ => {
                let func = Func::from_name(name)?;
                let arg = self.power()?;
                Some(Expr::Call(func, Box::new(arg)))
            }
        }
    }

    /// A command argument: `{expr}` or a single token (`\frac12` takes one digit each).
    fn argument(&mut self) -> Option<Expr> {
        match self.peek()? {
            Token::Open('{') => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.next()? {
                    Token::Close('}') => Some(inner),
                    _ => None,
                }
            }
            Token::Num(raw) if raw.len() > 1 && !raw.contains('.') => {
                let (first, rest) = raw.split_at(1);
                self.tokens[self.pos] = Token::Num(rest.to_string());
                first.parse().ok().map(Expr::Num)
            }
            _ => self.primary(),
        }
    }
}
