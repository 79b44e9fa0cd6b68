//! Expression evaluator
//!
//! A closed expression grammar used for operator arguments, `@DEF` values
//! and lambda bodies:
//!
//! ```text
//! expr       := or
//! or         := and ("or" and)*
//! and        := not ("and" not)*
//! not        := "not" not | comparison
//! comparison := additive (("=" | "==" | "!=" | "<>" | "<" | "<=" | ">" | ">=") additive)?
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/") unary)*
//! unary      := "-" unary | postfix
//! postfix    := primary ("[" expr "]")*
//! primary    := literal | list | mapping | @var | @OP(...) | ident | ident "(" args ")" | "(" expr ")"
//! ```
//!
//! Bare identifiers that are not lambda parameters are SQL column
//! references. They evaluate to SQL fragments, and any operation with a
//! fragment operand folds into a new fragment instead of a value.

use crate::environment::Environment;
use crate::error::{MacroError, MacroResult};
use crate::functions;
use crate::scanner::{is_ident_byte, is_ident_start, matching_paren, ArgText, Operator, Origin};
use crate::value::{MacroValue, Scalar, SqlFragment};
use std::sync::Arc;

/// Callbacks from the evaluator into the expansion driver
pub trait MacroHost {
    /// Evaluate a nested operator call in value mode
    fn call_operator(&mut self, op: Operator, args: &ArgText, offset: usize) -> MacroResult<MacroValue>;

    /// Fully expand template text that contains macro tokens
    fn expand_fragment(&mut self, text: &str, origin: Origin) -> MacroResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// SQL spelling used when folding into a fragment
    fn sql(&self) -> &'static str {
        match self {
            Self::Or => "OR",
            Self::And => "AND",
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(MacroValue),
    List(Vec<Expr>),
    Mapping(Vec<(String, Expr)>),
    Var { name: String, offset: usize },
    Ident { name: String, offset: usize },
    QuotedIdent { text: String },
    Call { name: String, args: Vec<Expr>, offset: usize },
    MacroCall { op: Operator, args: ArgText, offset: usize },
    Index { target: Box<Expr>, index: Box<Expr>, offset: usize },
    Unary { op: UnaryOp, operand: Box<Expr>, offset: usize },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, offset: usize },
    Group(Box<Expr>),
}

impl Expr {
    /// True when every function call in the expression is allow-listed
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Literal(_)
            | Self::Var { .. }
            | Self::Ident { .. }
            | Self::QuotedIdent { .. }
            | Self::MacroCall { .. } => true,
            Self::List(items) => items.iter().all(Expr::is_closed),
            Self::Mapping(entries) => entries.iter().all(|(_, e)| e.is_closed()),
            Self::Call { name, args, .. } => {
                functions::is_allowed(name) && args.iter().all(Expr::is_closed)
            }
            Self::Index { target, index, .. } => target.is_closed() && index.is_closed(),
            Self::Unary { operand, .. } => operand.is_closed(),
            Self::Binary { left, right, .. } => left.is_closed() && right.is_closed(),
            Self::Group(inner) => inner.is_closed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    QuotedIdent(String),
    Var(String),
    MacroCall(Operator, ArgText),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Op(&'static str),
    And,
    Or,
    Not,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn tokenize(text: &str, origin: Origin) -> MacroResult<Vec<Token>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let offset = origin.locate(i);

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let (tok, end) = match b {
            b'\'' => {
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match text[j..].find('\'') {
                        Some(p) => {
                            value.push_str(&text[j..j + p]);
                            j += p + 1;
                            if bytes.get(j) == Some(&b'\'') {
                                value.push('\'');
                                j += 1;
                            } else {
                                break;
                            }
                        }
                        None => {
                            return Err(MacroError::evaluation("Unterminated string literal", offset))
                        }
                    }
                }
                (Tok::Str(value), j)
            }
            b'"' | b'`' => {
                let close = text[i + 1..].find(b as char).ok_or_else(|| {
                    MacroError::evaluation("Unterminated quoted identifier", offset)
                })?;
                let end = i + 1 + close + 1;
                (Tok::QuotedIdent(text[i..end].to_string()), end)
            }
            b'@' => {
                let start = i + 1;
                if !bytes.get(start).copied().is_some_and(is_ident_start) {
                    return Err(MacroError::evaluation("Expected a name after '@'", offset));
                }
                let mut end = start;
                while end < bytes.len() && is_ident_byte(bytes[end]) {
                    end += 1;
                }
                let name = &text[start..end];
                match (Operator::from_name(name), bytes.get(end)) {
                    (Some(op), Some(b'(')) => {
                        let close = matching_paren(text, end).ok_or_else(|| {
                            MacroError::syntax(
                                format!("Unterminated @{}(...) call: missing ')'", name),
                                offset,
                            )
                        })?;
                        let args = ArgText {
                            text: text[end + 1..close].to_string(),
                            origin: origin.sub(end + 1),
                        };
                        (Tok::MacroCall(op, args), close + 1)
                    }
                    (None, Some(b'(')) if name.bytes().all(|c| !c.is_ascii_lowercase()) => {
                        return Err(MacroError::syntax(
                            format!("Unknown macro operator @{}", name),
                            offset,
                        ))
                    }
                    _ => (Tok::Var(name.to_string()), end),
                }
            }
            b if b.is_ascii_digit() => {
                let mut end = i;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let is_float = bytes.get(end) == Some(&b'.')
                    && bytes.get(end + 1).is_some_and(|c| c.is_ascii_digit());
                if is_float {
                    end += 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    let value = text[i..end].parse::<f64>().map_err(|_| {
                        MacroError::evaluation(format!("Invalid number '{}'", &text[i..end]), offset)
                    })?;
                    (Tok::Float(value), end)
                } else {
                    let value = text[i..end].parse::<i64>().map_err(|_| {
                        MacroError::evaluation(format!("Integer '{}' is out of range", &text[i..end]), offset)
                    })?;
                    (Tok::Int(value), end)
                }
            }
            b if is_ident_start(b) => {
                let mut end = i;
                loop {
                    while end < bytes.len() && is_ident_byte(bytes[end]) {
                        end += 1;
                    }
                    if bytes.get(end) == Some(&b'.') && bytes.get(end + 1).copied().is_some_and(is_ident_start) {
                        end += 1;
                        continue;
                    }
                    break;
                }
                let word = &text[i..end];
                let tok = match word.to_ascii_lowercase().as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(word.to_string()),
                };
                (tok, end)
            }
            _ => {
                let two = text.get(i..i + 2).unwrap_or("");
                match two {
                    "==" | "!=" | "<>" | "<=" | ">=" => (Tok::Op(static_op(two)), i + 2),
                    _ => {
                        let tok = match b {
                            b'(' => Tok::LParen,
                            b')' => Tok::RParen,
                            b'[' => Tok::LBracket,
                            b']' => Tok::RBracket,
                            b'{' => Tok::LBrace,
                            b'}' => Tok::RBrace,
                            b',' => Tok::Comma,
                            b':' => Tok::Colon,
                            b'=' => Tok::Op("="),
                            b'<' => Tok::Op("<"),
                            b'>' => Tok::Op(">"),
                            b'+' => Tok::Op("+"),
                            b'-' => Tok::Op("-"),
                            b'*' => Tok::Op("*"),
                            b'/' => Tok::Op("/"),
                            _ => {
                                let ch = text[i..].chars().next().unwrap_or('?');
                                return Err(MacroError::evaluation(
                                    format!("Unexpected character '{}' in macro expression", ch),
                                    offset,
                                ));
                            }
                        };
                        (tok, i + 1)
                    }
                }
            }
        };

        tokens.push(Token { tok, offset });
        i = end;
    }

    Ok(tokens)
}

fn static_op(op: &str) -> &'static str {
    match op {
        "==" => "==",
        "!=" => "!=",
        "<>" => "<>",
        "<=" => "<=",
        _ => ">=",
    }
}

/// Parse expression text
pub fn parse_expression(text: &str, origin: Origin) -> MacroResult<Expr> {
    let tokens = tokenize(text, origin)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end_offset: origin.locate(text.len()),
    };
    if parser.tokens.is_empty() {
        return Err(MacroError::evaluation("Empty expression", parser.end_offset));
    }
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(MacroError::evaluation(
            format!("Unexpected {} in macro expression", describe(&token.tok)),
            token.offset,
        ));
    }
    Ok(expr)
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Int(i) => i.to_string(),
        Tok::Float(f) => f.to_string(),
        Tok::Str(s) => format!("'{}'", s),
        Tok::Ident(s) | Tok::QuotedIdent(s) => format!("'{}'", s),
        Tok::Var(s) => format!("'@{}'", s),
        Tok::MacroCall(op, _) => format!("'@{}'", op.name()),
        Tok::LParen => "'('".to_string(),
        Tok::RParen => "')'".to_string(),
        Tok::LBracket => "'['".to_string(),
        Tok::RBracket => "']'".to_string(),
        Tok::LBrace => "'{'".to_string(),
        Tok::RBrace => "'}'".to_string(),
        Tok::Comma => "','".to_string(),
        Tok::Colon => "':'".to_string(),
        Tok::Op(op) => format!("'{}'", op),
        Tok::And => "'and'".to_string(),
        Tok::Or => "'or'".to_string(),
        Tok::Not => "'not'".to_string(),
        Tok::True => "'true'".to_string(),
        Tok::False => "'false'".to_string(),
        Tok::Null => "'null'".to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end_offset: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> MacroResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| MacroError::evaluation("Unexpected end of macro expression", self.end_offset))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek().is_some_and(|t| t.tok == *tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> MacroResult<()> {
        let token = self.next()?;
        if token.tok == tok {
            Ok(())
        } else {
            Err(MacroError::evaluation(
                format!("Expected {}, found {}", describe(&tok), describe(&token.tok)),
                token.offset,
            ))
        }
    }

    fn parse_or(&mut self) -> MacroResult<Expr> {
        let mut left = self.parse_and()?;
        while let Some(offset) = self.peek().filter(|t| t.tok == Tok::Or).map(|t| t.offset) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right, offset);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> MacroResult<Expr> {
        let mut left = self.parse_not()?;
        while let Some(offset) = self.peek().filter(|t| t.tok == Tok::And).map(|t| t.offset) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = binary(BinaryOp::And, left, right, offset);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> MacroResult<Expr> {
        if let Some(offset) = self.peek().filter(|t| t.tok == Tok::Not).map(|t| t.offset) {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand), offset });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> MacroResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek().map(|t| (&t.tok, t.offset)) {
            Some((Tok::Op("=" | "=="), offset)) => Some((BinaryOp::Eq, offset)),
            Some((Tok::Op("!=" | "<>"), offset)) => Some((BinaryOp::NotEq, offset)),
            Some((Tok::Op("<"), offset)) => Some((BinaryOp::Lt, offset)),
            Some((Tok::Op("<="), offset)) => Some((BinaryOp::LtEq, offset)),
            Some((Tok::Op(">"), offset)) => Some((BinaryOp::Gt, offset)),
            Some((Tok::Op(">="), offset)) => Some((BinaryOp::GtEq, offset)),
            _ => None,
        };
        match op {
            Some((op, offset)) => {
                self.pos += 1;
                let right = self.parse_additive()?;
                Ok(binary(op, left, right, offset))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> MacroResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek().map(|t| (&t.tok, t.offset)) {
                Some((Tok::Op("+"), offset)) => (BinaryOp::Add, offset),
                Some((Tok::Op("-"), offset)) => (BinaryOp::Sub, offset),
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = binary(op.0, left, right, op.1);
        }
    }

    fn parse_term(&mut self) -> MacroResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| (&t.tok, t.offset)) {
                Some((Tok::Op("*"), offset)) => (BinaryOp::Mul, offset),
                Some((Tok::Op("/"), offset)) => (BinaryOp::Div, offset),
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = binary(op.0, left, right, op.1);
        }
    }

    fn parse_unary(&mut self) -> MacroResult<Expr> {
        if let Some(offset) = self.peek().filter(|t| t.tok == Tok::Op("-")).map(|t| t.offset) {
            self.pos += 1;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand), offset });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> MacroResult<Expr> {
        let mut expr = self.parse_primary()?;
        while let Some(offset) = self.peek().filter(|t| t.tok == Tok::LBracket).map(|t| t.offset) {
            self.pos += 1;
            let index = self.parse_or()?;
            self.expect(Tok::RBracket)?;
            expr = Expr::Index { target: Box::new(expr), index: Box::new(index), offset };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> MacroResult<Expr> {
        let token = self.next()?;
        let offset = token.offset;
        let expr = match token.tok {
            Tok::Int(i) => Expr::Literal(MacroValue::int(i)),
            Tok::Float(f) => Expr::Literal(MacroValue::float(f)),
            Tok::Str(s) => Expr::Literal(MacroValue::string(s)),
            Tok::True => Expr::Literal(MacroValue::bool(true)),
            Tok::False => Expr::Literal(MacroValue::bool(false)),
            Tok::Null => Expr::Literal(MacroValue::null()),
            Tok::Var(name) => Expr::Var { name, offset },
            Tok::MacroCall(op, args) => Expr::MacroCall { op, args, offset },
            Tok::QuotedIdent(text) => Expr::QuotedIdent { text },
            Tok::Ident(name) => {
                if self.eat(&Tok::LParen) {
                    let args = self.parse_sequence(Tok::RParen)?;
                    Expr::Call { name, args, offset }
                } else {
                    Expr::Ident { name, offset }
                }
            }
            Tok::LParen => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Expr::Group(Box::new(inner))
            }
            Tok::LBracket => Expr::List(self.parse_sequence(Tok::RBracket)?),
            Tok::LBrace => Expr::Mapping(self.parse_mapping()?),
            other => {
                return Err(MacroError::evaluation(
                    format!("Unexpected {} in macro expression", describe(&other)),
                    offset,
                ))
            }
        };
        Ok(expr)
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn parse_sequence(&mut self, close: Tok) -> MacroResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.eat(&close) {
                return Ok(items);
            }
            items.push(self.parse_or()?);
            if !self.eat(&Tok::Comma) {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn parse_mapping(&mut self) -> MacroResult<Vec<(String, Expr)>> {
        let mut entries = Vec::new();
        loop {
            if self.eat(&Tok::RBrace) {
                return Ok(entries);
            }
            let token = self.next()?;
            let key = match token.tok {
                Tok::Str(s) | Tok::Ident(s) => s,
                other => {
                    return Err(MacroError::evaluation(
                        format!("Mapping keys must be names or strings, found {}", describe(&other)),
                        token.offset,
                    ))
                }
            };
            self.expect(Tok::Colon)?;
            entries.push((key, self.parse_or()?));
            if !self.eat(&Tok::Comma) {
                self.expect(Tok::RBrace)?;
                return Ok(entries);
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, offset: usize) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right), offset }
}

/// Evaluates parsed expressions against an environment
pub struct Evaluator<'h> {
    env: Arc<Environment>,
    host: &'h mut dyn MacroHost,
    defining: Option<String>,
}

impl<'h> Evaluator<'h> {
    pub fn new(env: Arc<Environment>, host: &'h mut dyn MacroHost) -> Self {
        Self { env, host, defining: None }
    }

    /// Mark `name` as being defined; referencing it is a cycle
    pub fn defining(mut self, name: Option<&str>) -> Self {
        self.defining = name.map(crate::environment::normalize);
        self
    }

    /// Parse and evaluate `text`
    pub fn eval_text(&mut self, text: &str, origin: Origin) -> MacroResult<MacroValue> {
        let expr = parse_expression(text, origin)?;
        self.evaluate(&expr)
    }

    pub fn evaluate(&mut self, expr: &Expr) -> MacroResult<MacroValue> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => Ok(MacroValue::List(
                items.iter().map(|e| self.evaluate(e)).collect::<MacroResult<_>>()?,
            )),
            Expr::Mapping(entries) => {
                let mut values = Vec::with_capacity(entries.len());
                for (key, e) in entries {
                    values.push((key.clone(), self.evaluate(e)?));
                }
                Ok(MacroValue::Mapping(values))
            }
            Expr::Var { name, offset } => self.variable(name, *offset),
            Expr::Ident { name, offset } => self.identifier(name, *offset),
            Expr::QuotedIdent { text } => Ok(MacroValue::verbatim(text.clone())),
            Expr::Call { name, args, offset } => {
                if !functions::is_allowed(name) {
                    return Err(MacroError::evaluation(
                        format!("Function '{}' is not allowed in macro expressions", name),
                        *offset,
                    ));
                }
                let values = args.iter().map(|a| self.evaluate(a)).collect::<MacroResult<Vec<_>>>()?;
                functions::call(name, values, *offset)
            }
            Expr::MacroCall { op, args, offset } => self.host.call_operator(*op, args, *offset),
            Expr::Index { target, index, offset } => {
                let target = self.evaluate(target)?;
                let index = self.evaluate(index)?;
                index_value(target, index, *offset)
            }
            Expr::Unary { op, operand, offset } => {
                let value = self.evaluate(operand)?;
                unary(*op, value, *offset)
            }
            Expr::Binary { op: BinaryOp::And, left, right, offset } => self.logical(true, left, right, *offset),
            Expr::Binary { op: BinaryOp::Or, left, right, offset } => self.logical(false, left, right, *offset),
            Expr::Binary { op, left, right, offset } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                binary_value(*op, left, right, *offset)
            }
            Expr::Group(inner) => match self.evaluate(inner)? {
                MacroValue::Sql(fragment) => Ok(MacroValue::Sql(SqlFragment {
                    text: format!("({})", fragment.text),
                    verbatim: fragment.verbatim,
                })),
                other => Ok(other),
            },
        }
    }

    fn variable(&mut self, name: &str, offset: usize) -> MacroResult<MacroValue> {
        if self.defining.as_deref() == Some(crate::environment::normalize(name).as_str()) {
            return Err(MacroError::cycle(
                format!("@{} refers to itself in its own definition", name),
                offset,
            ));
        }

        let value = self.env.lookup(name, offset)?.clone();
        match value {
            MacroValue::Sql(SqlFragment { text, verbatim: false })
                if crate::scanner::contains_macro(&text) =>
            {
                let expanded = self.host.expand_fragment(&text, Origin::Expanded { at: offset })?;
                Ok(MacroValue::verbatim(expanded))
            }
            other => Ok(other),
        }
    }

    fn identifier(&mut self, name: &str, offset: usize) -> MacroResult<MacroValue> {
        let mut parts = name.split('.');
        let head = parts.next().unwrap_or(name);

        let Some(mut value) = self.env.lookup_param(head).cloned() else {
            return Ok(MacroValue::sql(name));
        };

        for key in parts {
            value = match value.get(key) {
                Some(v) => v.clone(),
                None => {
                    return Err(MacroError::evaluation(
                        format!("'{}' has no field '{}'", head, key),
                        offset,
                    ))
                }
            };
        }
        Ok(value)
    }

    fn logical(&mut self, is_and: bool, left: &Expr, right: &Expr, offset: usize) -> MacroResult<MacroValue> {
        let keyword = if is_and { "AND" } else { "OR" };
        let left = self.evaluate(left)?;

        if let MacroValue::Sql(l) = left {
            let right = self.evaluate(right)?;
            return match right {
                MacroValue::Sql(r) => Ok(MacroValue::sql(format!("{} {} {}", l.text, keyword, r.text))),
                // x AND TRUE = x, x OR FALSE = x
                other if other.truthy(offset)? == is_and => Ok(MacroValue::Sql(l)),
                _ => Ok(MacroValue::bool(!is_and)),
            };
        }

        let left_truth = left.truthy(offset)?;
        if left_truth != is_and {
            return Ok(MacroValue::bool(left_truth));
        }
        match self.evaluate(right)? {
            sql @ MacroValue::Sql(_) => Ok(sql),
            other => Ok(MacroValue::bool(other.truthy(offset)?)),
        }
    }
}

fn unary(op: UnaryOp, value: MacroValue, offset: usize) -> MacroResult<MacroValue> {
    match (op, value) {
        (UnaryOp::Not, MacroValue::Sql(fragment)) => Ok(MacroValue::sql(format!("NOT {}", fragment.text))),
        (UnaryOp::Not, other) => Ok(MacroValue::bool(!other.truthy(offset)?)),
        (UnaryOp::Neg, MacroValue::Sql(fragment)) => Ok(MacroValue::sql(format!("-{}", fragment.text))),
        (UnaryOp::Neg, MacroValue::Scalar(Scalar::Int(i))) => i
            .checked_neg()
            .map(MacroValue::int)
            .ok_or_else(|| MacroError::evaluation("Integer overflow", offset)),
        (UnaryOp::Neg, MacroValue::Scalar(Scalar::Float(f))) => Ok(MacroValue::float(-f)),
        (UnaryOp::Neg, other) => Err(MacroError::type_error(
            format!("cannot negate a {} value", other.type_name()),
            offset,
        )),
    }
}

fn binary_value(op: BinaryOp, left: MacroValue, right: MacroValue, offset: usize) -> MacroResult<MacroValue> {
    if matches!(left, MacroValue::Sql(_)) || matches!(right, MacroValue::Sql(_)) {
        let text = format!("{} {} {}", left.to_sql(offset)?, op.sql(), right.to_sql(offset)?);
        return Ok(MacroValue::sql(text));
    }

    match op {
        BinaryOp::Eq => Ok(MacroValue::bool(values_equal(&left, &right))),
        BinaryOp::NotEq => Ok(MacroValue::bool(!values_equal(&left, &right))),
        BinaryOp::Lt => Ok(MacroValue::bool(functions::compare(&left, &right, "'<'", offset)?.is_lt())),
        BinaryOp::LtEq => Ok(MacroValue::bool(functions::compare(&left, &right, "'<='", offset)?.is_le())),
        BinaryOp::Gt => Ok(MacroValue::bool(functions::compare(&left, &right, "'>'", offset)?.is_gt())),
        BinaryOp::GtEq => Ok(MacroValue::bool(functions::compare(&left, &right, "'>='", offset)?.is_ge())),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, left, right, offset),
        BinaryOp::And | BinaryOp::Or => Err(MacroError::evaluation("unexpected logical operator", offset)),
    }
}

fn values_equal(a: &MacroValue, b: &MacroValue) -> bool {
    match (a, b) {
        (MacroValue::Scalar(Scalar::Int(x)), MacroValue::Scalar(Scalar::Float(y)))
        | (MacroValue::Scalar(Scalar::Float(y)), MacroValue::Scalar(Scalar::Int(x))) => (*x as f64) == *y,
        _ => a == b,
    }
}

fn arithmetic(op: BinaryOp, left: MacroValue, right: MacroValue, offset: usize) -> MacroResult<MacroValue> {
    use MacroValue::Scalar as S;
    let overflow = || MacroError::evaluation("Integer overflow", offset);

    match (op, left, right) {
        (BinaryOp::Div, _, S(Scalar::Int(0))) => Err(MacroError::evaluation("Division by zero", offset)),
        (BinaryOp::Div, _, S(Scalar::Float(f))) if f == 0.0 => {
            Err(MacroError::evaluation("Division by zero", offset))
        }
        (op, S(Scalar::Int(a)), S(Scalar::Int(b))) => match op {
            BinaryOp::Add => a.checked_add(b).map(MacroValue::int).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(b).map(MacroValue::int).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(MacroValue::int).ok_or_else(overflow),
            _ => Ok(MacroValue::float(a as f64 / b as f64)),
        },
        (op, S(a @ (Scalar::Int(_) | Scalar::Float(_))), S(b @ (Scalar::Int(_) | Scalar::Float(_)))) => {
            let (a, b) = (as_f64(&a), as_f64(&b));
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                _ => a / b,
            };
            Ok(MacroValue::float(result))
        }
        (BinaryOp::Add, S(Scalar::Str(a)), S(Scalar::Str(b))) => Ok(MacroValue::string(a + &b)),
        (BinaryOp::Add, MacroValue::List(mut a), MacroValue::List(b)) => {
            a.extend(b);
            Ok(MacroValue::List(a))
        }
        (op, left, right) => Err(MacroError::type_error(
            format!(
                "unsupported operand types for '{}': {} and {}",
                op.sql(),
                left.type_name(),
                right.type_name()
            ),
            offset,
        )),
    }
}

fn as_f64(scalar: &Scalar) -> f64 {
    match scalar {
        Scalar::Int(i) => *i as f64,
        Scalar::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn index_value(target: MacroValue, index: MacroValue, offset: usize) -> MacroResult<MacroValue> {
    match (target, index) {
        (MacroValue::Sql(fragment), index) => {
            Ok(MacroValue::sql(format!("{}[{}]", fragment.text, index.to_sql(offset)?)))
        }
        (MacroValue::List(items), MacroValue::Scalar(Scalar::Int(i))) => {
            let len = items.len() as i64;
            let position = if i < 0 { len + i } else { i };
            if position < 0 || position >= len {
                return Err(MacroError::evaluation(
                    format!("List index {} out of range for a list of length {}", i, len),
                    offset,
                ));
            }
            Ok(items.into_iter().nth(position as usize).unwrap_or_else(MacroValue::null))
        }
        (mapping @ MacroValue::Mapping(_), MacroValue::Scalar(Scalar::Str(key))) => {
            mapping.get(&key).cloned().ok_or_else(|| {
                MacroError::evaluation(format!("Mapping has no key '{}'", key), offset)
            })
        }
        (target, index) => Err(MacroError::type_error(
            format!("cannot index a {} with a {}", target.type_name(), index.type_name()),
            offset,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ScopeKind;
    use crate::ErrorKind;

    /// Host for tests that has no operators
    struct NoOperators;

    impl MacroHost for NoOperators {
        fn call_operator(&mut self, op: Operator, _args: &ArgText, offset: usize) -> MacroResult<MacroValue> {
            Err(MacroError::syntax(format!("@{} not available", op.name()), offset))
        }

        fn expand_fragment(&mut self, text: &str, _origin: Origin) -> MacroResult<String> {
            Ok(text.replace("@x", "expanded"))
        }
    }

    const ROOT: Origin = Origin::Template { base: 0 };

    fn env() -> Arc<Environment> {
        let mut env = Environment::root();
        env.define("size", MacroValue::int(1), 0).unwrap();
        env.define("name", MacroValue::string("pea"), 0).unwrap();
        env.define("snippet", MacroValue::sql("a = @x"), 0).unwrap();
        env.define(
            "sizes",
            MacroValue::List(vec![MacroValue::int(1), MacroValue::int(2), MacroValue::int(3)]),
            0,
        )
        .unwrap();
        Arc::new(env)
    }

    fn eval(text: &str) -> MacroResult<MacroValue> {
        let mut host = NoOperators;
        Evaluator::new(env(), &mut host).eval_text(text, ROOT)
    }

    #[test]
    fn literals_and_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), MacroValue::int(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), MacroValue::int(9));
        assert_eq!(eval("7 / 2").unwrap(), MacroValue::float(3.5));
        assert_eq!(eval("1.5 + 1").unwrap(), MacroValue::float(2.5));
        assert_eq!(eval("'a' + 'b'").unwrap(), MacroValue::string("ab"));
        assert_eq!(eval("-@size").unwrap(), MacroValue::int(-1));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("@size > 0 and @name == 'pea'").unwrap(), MacroValue::bool(true));
        assert_eq!(eval("not TRUE or False").unwrap(), MacroValue::bool(false));
        assert_eq!(eval("1 = 1.0").unwrap(), MacroValue::bool(true));
        assert_eq!(eval("'1' != 1").unwrap(), MacroValue::bool(true));
    }

    #[test]
    fn and_short_circuits() {
        // the right side would divide by zero
        assert_eq!(eval("False and 1 / 0 > 1").unwrap(), MacroValue::bool(false));
        assert_eq!(eval("True or 1 / 0 > 1").unwrap(), MacroValue::bool(true));
    }

    #[test]
    fn column_references_fold_into_sql() {
        assert_eq!(eval("item_id > @size").unwrap(), MacroValue::sql("item_id > 1"));
        assert_eq!(eval("city.country == 'x'").unwrap(), MacroValue::sql("city.country = 'x'"));
        assert_eq!(eval("(a + 1) * 2").unwrap(), MacroValue::sql("(a + 1) * 2"));
        assert_eq!(eval("a > 1 and True").unwrap(), MacroValue::sql("a > 1"));
        assert_eq!(eval("not a").unwrap(), MacroValue::sql("NOT a"));
    }

    #[test]
    fn indexing() {
        assert_eq!(eval("@sizes[0]").unwrap(), MacroValue::int(1));
        assert_eq!(eval("@sizes[-1]").unwrap(), MacroValue::int(3));
        assert_eq!(eval("{'a': 1, b: 2}['b']").unwrap(), MacroValue::int(2));
        assert_eq!(eval("@sizes[5]").unwrap_err().kind(), ErrorKind::Evaluation);
    }

    #[test]
    fn allow_listed_calls_only() {
        assert_eq!(eval("upper(@name)").unwrap(), MacroValue::string("PEA"));
        assert_eq!(eval("len(@sizes)").unwrap(), MacroValue::int(3));

        let err = eval("system('rm')").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert_eq!(err.offset(), 0);
    }

    #[test]
    fn errors_carry_offsets() {
        let err = eval("1 + @missing").unwrap_err();
        assert_eq!(err, MacroError::undefined("missing", 4));

        let err = eval("1 / 0").unwrap_err();
        assert_eq!(err, MacroError::evaluation("Division by zero", 2));

        let err = eval("'a' < 1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn grammar_violations_are_evaluation_errors() {
        assert_eq!(eval("1 +").unwrap_err().kind(), ErrorKind::Evaluation);
        assert_eq!(eval("a || b").unwrap_err().kind(), ErrorKind::Evaluation);
        assert_eq!(eval("1 2").unwrap_err().kind(), ErrorKind::Evaluation);
        assert_eq!(eval("9223372036854775807 + 1").unwrap_err().kind(), ErrorKind::Evaluation);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut host = NoOperators;
        let err = Evaluator::new(env(), &mut host)
            .defining(Some("SIZE"))
            .eval_text("@size + 1", ROOT)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }

    #[test]
    fn snippets_are_expanded_through_host() {
        assert_eq!(eval("@snippet").unwrap(), MacroValue::verbatim("a = expanded"));
    }

    #[test]
    fn lambda_params_shadow_columns() {
        let mut child = Environment::child(&env(), ScopeKind::Lambda);
        child
            .define(
                "x",
                MacroValue::Mapping(vec![("name".to_string(), MacroValue::string("bean"))]),
                0,
            )
            .unwrap();
        let mut host = NoOperators;
        let mut evaluator = Evaluator::new(Arc::new(child), &mut host);

        assert_eq!(evaluator.eval_text("x.name", ROOT).unwrap(), MacroValue::string("bean"));
        assert_eq!(evaluator.eval_text("size", ROOT).unwrap(), MacroValue::sql("size"));
    }

    #[test]
    fn closed_expressions() {
        assert!(parse_expression("upper(x) + 1", ROOT).unwrap().is_closed());
        assert!(!parse_expression("SUM(x)", ROOT).unwrap().is_closed());
    }
}
