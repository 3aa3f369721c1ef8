//! Prompt template engine
//!
//! A minimal Jinja-style interpreter: `{{ expr }}` output, `{% for %}` /
//! `{% if %}` blocks, attribute and index access, and `{# comments #}`.
//! Function calls and filters are rejected. Alongside rendering, the module
//! extracts a JSON schema of every variable path a template touches, which
//! becomes the version's `input_variables_schema`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::domain::hashing::hash_string;
use crate::error::ApiError;

/// Compiled templates kept per process, keyed by content hash
const TEMPLATE_CACHE_CAPACITY: u64 = 10;

static TEMPLATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{|\{%|\{#").unwrap());

/// Error raised for templates that fail to parse or render
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message} (line {line_number:?})")]
pub struct InvalidTemplate {
    pub message: String,
    pub line_number: Option<usize>,
    /// The offending source line
    pub source_line: Option<String>,
    pub unexpected_char: Option<String>,
}

impl InvalidTemplate {
    fn new(message: impl Into<String>, line_number: Option<usize>) -> Self {
        Self {
            message: message.into(),
            line_number,
            source_line: None,
            unexpected_char: None,
        }
    }

    fn with_context(mut self, template: &str) -> Self {
        if let Some(line) = self.line_number {
            self.source_line = template.lines().nth(line.saturating_sub(1)).map(str::to_string);
        }
        self
    }
}

impl From<InvalidTemplate> for ApiError {
    fn from(e: InvalidTemplate) -> Self {
        ApiError::bad_request(e.message.clone()).with_details(json!({
            "line_number": e.line_number,
            "source": e.source_line,
            "unexpected_char": e.unexpected_char,
        }))
    }
}

// ---------------------------------------------------------------------------
// AST

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Name(String),
    Getattr(Box<Expr>, String),
    /// Index access; the index expression itself is never walked for schema
    /// purposes, it only marks an array hop
    Getitem(Box<Expr>, Box<Expr>),
    Str(String),
    Num(f64),
    Bool(bool),
    None,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
enum ForTarget {
    Name(String),
    Tuple(Vec<ForTarget>),
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Text(String),
    Output(Expr),
    If {
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    For {
        target: ForTarget,
        iter: Expr,
        body: Vec<Node>,
    },
}

// ---------------------------------------------------------------------------
// Template-level scanner

#[derive(Debug)]
enum Segment {
    Text(String),
    /// `{{ ... }}`
    Output(String, usize),
    /// `{% ... %}`
    Tag(String, usize),
}

fn line_at(template: &str, pos: usize) -> usize {
    template[..pos].matches('\n').count() + 1
}

fn scan(template: &str) -> Result<Vec<Segment>, InvalidTemplate> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0usize;

    while let Some(m) = TEMPLATE_REGEX.find(rest) {
        if m.start() > 0 {
            segments.push(Segment::Text(rest[..m.start()].to_string()));
        }
        let open = m.as_str();
        let close = match open {
            "{{" => "}}",
            "{%" => "%}",
            _ => "#}",
        };
        let line = line_at(template, offset + m.start());
        let after = &rest[m.start() + 2..];
        let Some(end) = after.find(close) else {
            return Err(InvalidTemplate::new(
                format!("unexpected end of template, expected '{close}'"),
                Some(line),
            ));
        };
        let inner = after[..end].trim().to_string();
        match open {
            "{{" => segments.push(Segment::Output(inner, line)),
            "{%" => segments.push(Segment::Tag(inner, line)),
            _ => {} // comment, dropped
        }
        let consumed = m.start() + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Expression lexer and parser

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
    Op(&'static str),
}

fn lex_expr(src: &str, line: usize) -> Result<Vec<Tok>, InvalidTemplate> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(InvalidTemplate::new("unterminated string literal", Some(line)));
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let num = raw.parse::<f64>().map_err(|_| {
                    InvalidTemplate::new(format!("invalid number literal '{raw}'"), Some(line))
                })?;
                toks.push(Tok::Num(num));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Op("=="));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Op("!="));
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Op("<="));
                    i += 2;
                } else {
                    toks.push(Tok::Op("<"));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Op(">="));
                    i += 2;
                } else {
                    toks.push(Tok::Op(">"));
                    i += 1;
                }
            }
            '.' | '[' | ']' | '(' | ')' | ',' => {
                toks.push(Tok::Punct(c));
                i += 1;
            }
            other => {
                return Err(InvalidTemplate {
                    message: format!("unexpected '{other}'"),
                    line_number: Some(line),
                    source_line: None,
                    unexpected_char: Some(other.to_string()),
                });
            }
        }
    }
    Ok(toks)
}

struct ExprParser {
    toks: Vec<Tok>,
    pos: usize,
    line: usize,
}

impl ExprParser {
    fn new(src: &str, line: usize) -> Result<Self, InvalidTemplate> {
        Ok(Self {
            toks: lex_expr(src, line)?,
            pos: 0,
            line,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, message: impl Into<String>) -> InvalidTemplate {
        InvalidTemplate::new(message, Some(self.line))
    }

    fn parse_full(mut self) -> Result<Expr, InvalidTemplate> {
        let expr = self.parse_or()?;
        if self.peek().is_some() {
            return Err(self.err("unexpected trailing tokens in expression"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, InvalidTemplate> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Ident(w)) if w == "or") {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, InvalidTemplate> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::Ident(w)) if w == "and") {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, InvalidTemplate> {
        if matches!(self.peek(), Some(Tok::Ident(w)) if w == "not") {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, InvalidTemplate> {
        let left = self.parse_postfix()?;
        let op = match self.peek() {
            Some(Tok::Op("==")) => Some(CmpOp::Eq),
            Some(Tok::Op("!=")) => Some(CmpOp::Ne),
            Some(Tok::Op("<")) => Some(CmpOp::Lt),
            Some(Tok::Op("<=")) => Some(CmpOp::Le),
            Some(Tok::Op(">")) => Some(CmpOp::Gt),
            Some(Tok::Op(">=")) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let right = self.parse_postfix()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> Result<Expr, InvalidTemplate> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Tok::Punct('.')) => {
                    self.next();
                    let Some(Tok::Ident(attr)) = self.next() else {
                        return Err(self.err("expected attribute name after '.'"));
                    };
                    expr = Expr::Getattr(Box::new(expr), attr);
                }
                Some(Tok::Punct('[')) => {
                    self.next();
                    let index = self.parse_or()?;
                    let Some(Tok::Punct(']')) = self.next() else {
                        return Err(self.err("expected ']' after index"));
                    };
                    expr = Expr::Getitem(Box::new(expr), Box::new(index));
                }
                Some(Tok::Punct('(')) => {
                    return Err(self.err("Template functions are not supported"));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, InvalidTemplate> {
        match self.next() {
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Expr::Bool(true)),
                "false" | "False" => Ok(Expr::Bool(false)),
                "none" | "None" | "null" => Ok(Expr::None),
                _ => Ok(Expr::Name(word)),
            },
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Punct('(')) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Tok::Punct(')')) => Ok(inner),
                    _ => Err(self.err("expected ')'")),
                }
            }
            Some(other) => Err(self.err(format!("unexpected token {other:?} in expression"))),
            None => Err(self.err("empty expression")),
        }
    }
}

fn parse_expr(src: &str, line: usize) -> Result<Expr, InvalidTemplate> {
    ExprParser::new(src, line)?.parse_full()
}

fn parse_for_target(src: &str, line: usize) -> Result<ForTarget, InvalidTemplate> {
    let names: Vec<&str> = src.split(',').map(str::trim).collect();
    let mut targets = Vec::new();
    for name in names {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || name.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(InvalidTemplate::new(
                format!("invalid loop target '{name}'"),
                Some(line),
            ));
        }
        targets.push(ForTarget::Name(name.to_string()));
    }
    if targets.len() == 1 {
        Ok(targets.remove(0))
    } else {
        Ok(ForTarget::Tuple(targets))
    }
}

// ---------------------------------------------------------------------------
// Block parser

struct BlockParser {
    segments: std::vec::IntoIter<Segment>,
    peeked: Option<Segment>,
}

impl BlockParser {
    fn peek_is_terminator(&mut self, terminators: &[&str]) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.segments.next();
        }
        match &self.peeked {
            Some(Segment::Tag(tag, _)) => {
                let keyword = tag.split_whitespace().next().unwrap_or("");
                terminators.contains(&keyword)
            }
            _ => false,
        }
    }

    fn next_segment(&mut self) -> Option<Segment> {
        self.peeked.take().or_else(|| self.segments.next())
    }

    fn parse_block(&mut self, terminators: &[&str]) -> Result<(Vec<Node>, Option<String>), InvalidTemplate> {
        let mut nodes = Vec::new();
        loop {
            if self.peek_is_terminator(terminators) {
                let Some(Segment::Tag(tag, _)) = self.next_segment() else {
                    unreachable!()
                };
                return Ok((nodes, Some(tag)));
            }
            match self.next_segment() {
                None => {
                    if terminators.is_empty() {
                        return Ok((nodes, None));
                    }
                    return Err(InvalidTemplate::new(
                        format!("unexpected end of template, expected one of {terminators:?}"),
                        None,
                    ));
                }
                Some(Segment::Text(text)) => nodes.push(Node::Text(text)),
                Some(Segment::Output(src, line)) => {
                    nodes.push(Node::Output(parse_expr(&src, line)?));
                }
                Some(Segment::Tag(tag, line)) => {
                    let keyword = tag.split_whitespace().next().unwrap_or("");
                    match keyword {
                        "for" => nodes.push(self.parse_for(&tag, line)?),
                        "if" => nodes.push(self.parse_if(&tag, line)?),
                        other => {
                            return Err(InvalidTemplate::new(
                                format!("unknown tag '{other}'"),
                                Some(line),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn parse_for(&mut self, tag: &str, line: usize) -> Result<Node, InvalidTemplate> {
        let rest = tag.strip_prefix("for").unwrap_or("").trim();
        let Some(in_pos) = rest.find(" in ") else {
            return Err(InvalidTemplate::new("expected 'in' in for tag", Some(line)));
        };
        let target = parse_for_target(&rest[..in_pos], line)?;
        let iter = parse_expr(rest[in_pos + 4..].trim(), line)?;
        let (body, _) = self.parse_block(&["endfor"])?;
        Ok(Node::For { target, iter, body })
    }

    fn parse_if(&mut self, tag: &str, line: usize) -> Result<Node, InvalidTemplate> {
        let cond = parse_expr(tag.strip_prefix("if").unwrap_or("").trim(), line)?;
        let (then, terminator) = self.parse_block(&["elif", "else", "endif"])?;
        let otherwise = match terminator.as_deref() {
            Some(t) if t.starts_with("elif") => {
                vec![self.parse_if(&format!("if {}", t.strip_prefix("elif").unwrap_or("").trim()), line)?]
            }
            Some("else") => {
                let (nodes, _) = self.parse_block(&["endif"])?;
                nodes
            }
            _ => Vec::new(),
        };
        Ok(Node::If {
            cond,
            then,
            otherwise,
        })
    }
}

fn parse_template(template: &str) -> Result<Vec<Node>, InvalidTemplate> {
    let segments = scan(template)?;
    let mut parser = BlockParser {
        segments: segments.into_iter(),
        peeked: None,
    };
    let (nodes, _) = parser.parse_block(&[])?;
    Ok(nodes)
}

// ---------------------------------------------------------------------------
// Rendering

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

struct RenderCtx<'a> {
    root: &'a Value,
    scopes: Vec<BTreeMap<String, Value>>,
}

impl<'a> RenderCtx<'a> {
    fn lookup(&self, name: &str) -> Value {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return v.clone();
            }
        }
        self.root.get(name).cloned().unwrap_or(Value::Null)
    }

    fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Name(name) => self.lookup(name),
            Expr::Getattr(base, attr) => self.eval(base).get(attr).cloned().unwrap_or(Value::Null),
            Expr::Getitem(base, index) => {
                let base = self.eval(base);
                match self.eval(index) {
                    Value::Number(n) => n
                        .as_u64()
                        .or_else(|| n.as_f64().map(|f| f as u64))
                        .and_then(|i| base.get(i as usize).cloned())
                        .unwrap_or(Value::Null),
                    Value::String(key) => base.get(&key).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            Expr::Str(s) => Value::String(s.clone()),
            Expr::Num(n) => json!(n),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::None => Value::Null,
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner))),
            Expr::And(l, r) => {
                let left = self.eval(l);
                if truthy(&left) {
                    self.eval(r)
                } else {
                    left
                }
            }
            Expr::Or(l, r) => {
                let left = self.eval(l);
                if truthy(&left) {
                    left
                } else {
                    self.eval(r)
                }
            }
            Expr::Compare(l, op, r) => {
                let left = self.eval(l);
                let right = self.eval(r);
                let result = match op {
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                    _ => {
                        let ord = match (left.as_f64(), right.as_f64()) {
                            (Some(a), Some(b)) => a.partial_cmp(&b),
                            _ => left.as_str().zip(right.as_str()).map(|(a, b)| a.cmp(b)),
                        };
                        match (op, ord) {
                            (CmpOp::Lt, Some(o)) => o.is_lt(),
                            (CmpOp::Le, Some(o)) => o.is_le(),
                            (CmpOp::Gt, Some(o)) => o.is_gt(),
                            (CmpOp::Ge, Some(o)) => o.is_ge(),
                            _ => false,
                        }
                    }
                };
                Value::Bool(result)
            }
        }
    }

    fn bind_target(&mut self, target: &ForTarget, item: Value, scope: &mut BTreeMap<String, Value>) {
        match target {
            ForTarget::Name(name) => {
                scope.insert(name.clone(), item);
            }
            ForTarget::Tuple(targets) => {
                let items = match item {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                for (i, t) in targets.iter().enumerate() {
                    self.bind_target(t, items.get(i).cloned().unwrap_or(Value::Null), scope);
                }
            }
        }
    }

    fn render(&mut self, nodes: &[Node], out: &mut String) {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Output(expr) => out.push_str(&stringify(&self.eval(expr))),
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    if truthy(&self.eval(cond)) {
                        self.render(then, out);
                    } else {
                        self.render(otherwise, out);
                    }
                }
                Node::For { target, iter, body } => {
                    let items = match self.eval(iter) {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(k, _)| json!(k)).collect(),
                        _ => Vec::new(),
                    };
                    for item in items {
                        let mut scope = BTreeMap::new();
                        self.bind_target(target, item, &mut scope);
                        self.scopes.push(scope);
                        self.render(body, out);
                        self.scopes.pop();
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Variable schema extraction

#[derive(Clone, Debug, Default)]
struct PathGraph(BTreeMap<String, PathGraph>);

impl PathGraph {
    fn ensure(&mut self, path: &[String]) {
        let mut cur = self;
        for segment in path {
            cur = cur.0.entry(segment.clone()).or_default();
        }
    }
}

struct SchemaBuilder {
    graph: PathGraph,
    aliases: Vec<BTreeMap<String, Vec<String>>>,
}

impl SchemaBuilder {
    fn new() -> Self {
        Self {
            graph: PathGraph::default(),
            aliases: Vec::new(),
        }
    }

    fn lookup_alias(&self, name: &str) -> Option<Vec<String>> {
        for scope in self.aliases.iter().rev() {
            if let Some(path) = scope.get(name) {
                return Some(path.clone());
            }
        }
        None
    }

    /// Path for Name/Getattr/Getitem chains, with loop aliases expanded
    fn expr_to_path(&self, expr: &Expr) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut cur = expr;
        loop {
            match cur {
                Expr::Getattr(base, attr) => {
                    path.insert(0, attr.clone());
                    cur = base;
                }
                Expr::Getitem(base, _) => {
                    path.insert(0, "*".to_string());
                    cur = base;
                }
                Expr::Name(name) => {
                    if let Some(alias) = self.lookup_alias(name) {
                        let mut full = alias;
                        full.extend(path);
                        return Some(full);
                    }
                    path.insert(0, name.clone());
                    return Some(path);
                }
                _ => return None,
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Name(_) | Expr::Getattr(..) | Expr::Getitem(..) => {
                if let Some(path) = self.expr_to_path(expr) {
                    self.graph.ensure(&path);
                }
            }
            Expr::Not(inner) => self.visit_expr(inner),
            Expr::And(l, r) | Expr::Or(l, r) => {
                self.visit_expr(l);
                self.visit_expr(r);
            }
            Expr::Compare(l, _, r) => {
                self.visit_expr(l);
                self.visit_expr(r);
            }
            _ => {}
        }
    }

    fn visit(&mut self, nodes: &[Node]) {
        for node in nodes {
            match node {
                Node::Text(_) => {}
                Node::Output(expr) => self.visit_expr(expr),
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    self.visit_expr(cond);
                    self.visit(then);
                    self.visit(otherwise);
                }
                Node::For { target, iter, body } => {
                    let Some(mut iter_path) = self.expr_to_path(iter) else {
                        self.visit_expr(iter);
                        self.visit(body);
                        continue;
                    };
                    if iter_path.last().map(String::as_str) != Some("*") {
                        iter_path.push("*".to_string());
                    }
                    self.graph.ensure(&iter_path);

                    let mut alias_map = BTreeMap::new();
                    add_alias(target, &iter_path, &mut alias_map);
                    self.aliases.push(alias_map);
                    self.visit(body);
                    self.aliases.pop();
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.graph.0.is_empty()
    }

    fn root_names(&self) -> HashSet<String> {
        self.graph.0.keys().cloned().collect()
    }

    fn build_schema(&self, start_schema: Option<&Value>, use_types_from: Option<&Value>) -> Value {
        let mut schema = match start_schema {
            Some(s) => s.clone(),
            None => {
                let mut carried = Map::new();
                if let Some(Value::Object(existing)) = use_types_from {
                    for key in ["format", "description", "examples"] {
                        if let Some(v) = existing.get(key) {
                            carried.insert(key.to_string(), v.clone());
                        }
                    }
                }
                Value::Object(carried)
            }
        };
        handle_components(&mut schema, use_types_from, &self.graph);
        schema
    }
}

fn add_alias(target: &ForTarget, base_path: &[String], aliases: &mut BTreeMap<String, Vec<String>>) {
    match target {
        ForTarget::Name(name) => {
            aliases.insert(name.clone(), base_path.to_vec());
        }
        ForTarget::Tuple(targets) => {
            let mut with_star = base_path.to_vec();
            with_star.push("*".to_string());
            for t in targets {
                add_alias(t, &with_star, aliases);
            }
        }
    }
}

fn existing_child<'a>(existing: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    existing?.get("properties")?.get(key)
}

fn existing_items(existing: Option<&Value>) -> Option<&Value> {
    existing?.get("items")
}

fn handle_components(schema: &mut Value, existing: Option<&Value>, components: &PathGraph) {
    if !schema.is_object() {
        *schema = Value::Object(Map::new());
    }

    if components.0.is_empty() {
        // Leaf: retain whatever explicit typing the existing schema carries
        if let Some(Value::Object(existing)) = existing {
            let target = schema.as_object_mut().unwrap();
            for (k, v) in existing {
                target.insert(k.clone(), v.clone());
            }
        }
        return;
    }

    if components.0.len() == 1 {
        if let Some(sub) = components.0.get("*") {
            let child_existing = existing_items(existing).cloned();
            let target = schema.as_object_mut().unwrap();
            target.insert("type".to_string(), json!("array"));
            target.insert("items".to_string(), Value::Object(Map::new()));
            let items = target.get_mut("items").unwrap();
            handle_components(items, child_existing.as_ref(), sub);
            return;
        }
    }

    {
        let target = schema.as_object_mut().unwrap();
        target
            .entry("type".to_string())
            .or_insert_with(|| json!("object"));
        target
            .entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    for (key, sub) in &components.0 {
        let child_existing = existing_child(existing, key).cloned();
        let properties = schema
            .get_mut("properties")
            .and_then(Value::as_object_mut)
            .unwrap();
        properties
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let child = properties.get_mut(key).unwrap();
        handle_components(child, child_existing.as_ref(), sub);
    }
}

/// Extract the JSON schema of every variable path the template touches.
/// Returns the schema and whether the string was templated at all.
pub fn extract_variable_schema(
    template: &str,
    start_schema: Option<&Value>,
    use_types_from: Option<&Value>,
) -> Result<(Option<Value>, bool), InvalidTemplate> {
    let nodes = parse_template(template).map_err(|e| e.with_context(template))?;
    let mut builder = SchemaBuilder::new();
    builder.visit(&nodes);
    if builder.is_empty() {
        return Ok((start_schema.cloned(), false));
    }
    Ok((
        Some(builder.build_schema(start_schema, use_types_from)),
        true,
    ))
}

// ---------------------------------------------------------------------------
// Template manager

/// A parsed template plus the root variable names it references
#[derive(Debug)]
pub struct CompiledTemplate {
    nodes: Vec<Node>,
    pub variables: HashSet<String>,
}

impl CompiledTemplate {
    pub fn render(&self, variables: &Value) -> String {
        let mut ctx = RenderCtx {
            root: variables,
            scopes: Vec::new(),
        };
        let mut out = String::new();
        ctx.render(&self.nodes, &mut out);
        out
    }
}

/// Thread-safe compile cache, LRU-evicted, keyed by content hash
pub struct TemplateManager {
    cache: moka::sync::Cache<String, Arc<CompiledTemplate>>,
}

impl Default for TemplateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateManager {
    pub fn new() -> Self {
        Self {
            cache: moka::sync::Cache::new(TEMPLATE_CACHE_CAPACITY),
        }
    }

    /// Cheap prefilter: does the string contain template syntax at all
    pub fn is_template(s: &str) -> bool {
        TEMPLATE_REGEX.is_match(s)
    }

    /// Compile and cache a template
    pub fn add_template(&self, template: &str) -> Result<Arc<CompiledTemplate>, InvalidTemplate> {
        let key = hash_string(template);
        if let Some(compiled) = self.cache.get(&key) {
            return Ok(compiled);
        }
        let nodes = parse_template(template).map_err(|e| e.with_context(template))?;
        let mut builder = SchemaBuilder::new();
        builder.visit(&nodes);
        let compiled = Arc::new(CompiledTemplate {
            nodes,
            variables: builder.root_names(),
        });
        self.cache.insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Render a template against variables, returning the rendered string and
    /// the root variable names the template uses
    pub fn render_template(
        &self,
        template: &str,
        variables: &Value,
    ) -> Result<(String, HashSet<String>), InvalidTemplate> {
        let compiled = self.add_template(template)?;
        Ok((compiled.render(variables), compiled.variables.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(template: &str, variables: Value) -> String {
        TemplateManager::new()
            .render_template(template, &variables)
            .unwrap()
            .0
    }

    #[test]
    fn test_is_template_prefilter() {
        assert!(TemplateManager::is_template("Hello {{name}}"));
        assert!(TemplateManager::is_template("{% for x in items %}{% endfor %}"));
        assert!(TemplateManager::is_template("{# note #}"));
        assert!(!TemplateManager::is_template("Hello world"));
    }

    #[test]
    fn test_render_simple_variable() {
        assert_eq!(
            render("Hello {{name}}!", json!({"name": "Toulouse"})),
            "Hello Toulouse!"
        );
    }

    #[test]
    fn test_render_attribute_and_index_access() {
        let variables = json!({"order": {"items": [{"price": 12}, {"price": 30}]}});
        assert_eq!(
            render("First: {{order.items[0].price}}", variables),
            "First: 12"
        );
    }

    #[test]
    fn test_render_for_loop() {
        let variables = json!({"cities": ["Paris", "Lyon"]});
        assert_eq!(
            render("{% for c in cities %}{{c}};{% endfor %}", variables),
            "Paris;Lyon;"
        );
    }

    #[test]
    fn test_render_if_else() {
        let template = "{% if premium %}Welcome back{% else %}Hello{% endif %}";
        assert_eq!(render(template, json!({"premium": true})), "Welcome back");
        assert_eq!(render(template, json!({"premium": false})), "Hello");
        assert_eq!(render(template, json!({})), "Hello");
    }

    #[test]
    fn test_render_elif() {
        let template = "{% if n == 1 %}one{% elif n == 2 %}two{% else %}many{% endif %}";
        assert_eq!(render(template, json!({"n": 2})), "two");
        assert_eq!(render(template, json!({"n": 5})), "many");
    }

    #[test]
    fn test_render_undefined_is_empty() {
        assert_eq!(render("[{{missing}}]", json!({})), "[]");
        assert_eq!(render("[{{a.b.c}}]", json!({"a": 1})), "[]");
    }

    #[test]
    fn test_render_comments_dropped() {
        assert_eq!(render("a{# hidden #}b", json!({})), "ab");
    }

    #[test]
    fn test_render_idempotent() {
        let manager = TemplateManager::new();
        let variables = json!({"name": "Toulouse"});
        let (first, vars1) = manager.render_template("Hi {{name}}", &variables).unwrap();
        let (second, vars2) = manager.render_template("Hi {{name}}", &variables).unwrap();
        assert_eq!(first, second);
        assert_eq!(vars1, vars2);
    }

    #[test]
    fn test_used_variables_exclude_loop_aliases() {
        let manager = TemplateManager::new();
        let compiled = manager
            .add_template("{% for item in order.items %}{{item.price}}{% endfor %}")
            .unwrap();
        assert_eq!(compiled.variables, HashSet::from(["order".to_string()]));
    }

    #[test]
    fn test_function_calls_rejected() {
        let err = TemplateManager::new()
            .add_template("{{ items.count() }}")
            .unwrap_err();
        assert!(err.message.contains("functions are not supported"));
    }

    #[test]
    fn test_unclosed_tag_reports_line() {
        let err = TemplateManager::new()
            .add_template("line one\n{{ broken")
            .unwrap_err();
        assert_eq!(err.line_number, Some(2));
    }

    #[test]
    fn test_unexpected_char_captured() {
        let err = TemplateManager::new().add_template("{{ a ; b }}").unwrap_err();
        assert_eq!(err.unexpected_char.as_deref(), Some(";"));
    }

    #[test]
    fn test_extract_schema_simple_name() {
        let (schema, templated) = extract_variable_schema("What has {{name}}?", None, None).unwrap();
        assert!(templated);
        assert_eq!(
            schema.unwrap(),
            json!({"type": "object", "properties": {"name": {}}})
        );
    }

    #[test]
    fn test_extract_schema_not_templated() {
        let (schema, templated) = extract_variable_schema("plain text", None, None).unwrap();
        assert!(!templated);
        assert!(schema.is_none());
    }

    #[test]
    fn test_extract_schema_nested_paths_and_arrays() {
        let template = "{% for item in order.items %}{{item.price}}{% endfor %}";
        let (schema, _) = extract_variable_schema(template, None, None).unwrap();
        assert_eq!(
            schema.unwrap(),
            json!({
                "type": "object",
                "properties": {
                    "order": {
                        "type": "object",
                        "properties": {
                            "items": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {"price": {}}
                                }
                            }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_extract_schema_tuple_unpacking() {
        let template = "{% for k, v in pairs %}{{k}}={{v}}{% endfor %}";
        let (schema, _) = extract_variable_schema(template, None, None).unwrap();
        let schema = schema.unwrap();
        // pairs is an array of arrays
        assert_eq!(schema["properties"]["pairs"]["type"], "array");
        assert_eq!(schema["properties"]["pairs"]["items"]["type"], "array");
    }

    #[test]
    fn test_extract_schema_getitem_marks_array() {
        let (schema, _) = extract_variable_schema("{{rows[0]}}", None, None).unwrap();
        assert_eq!(
            schema.unwrap(),
            json!({
                "type": "object",
                "properties": {"rows": {"type": "array", "items": {}}}
            })
        );
    }

    #[test]
    fn test_extract_schema_merges_types_from_existing() {
        let existing = json!({
            "type": "object",
            "properties": {
                "age": {"type": "integer", "description": "age in years"},
                "name": {"type": "string"}
            }
        });
        let (schema, _) =
            extract_variable_schema("{{name}} is {{age}}", None, Some(&existing)).unwrap();
        let schema = schema.unwrap();
        assert_eq!(schema["properties"]["age"]["type"], "integer");
        assert_eq!(schema["properties"]["age"]["description"], "age in years");
        assert_eq!(schema["properties"]["name"]["type"], "string");
    }

    #[test]
    fn test_extract_schema_idempotent() {
        let template = "{% for item in items %}{{item.name}}{% endfor %}";
        let (first, _) = extract_variable_schema(template, None, None).unwrap();
        let (second, _) = extract_variable_schema(template, None, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_template_cache_reuses_compiled_templates() {
        let manager = TemplateManager::new();
        let a = manager.add_template("Hi {{name}}").unwrap();
        let b = manager.add_template("Hi {{name}}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
