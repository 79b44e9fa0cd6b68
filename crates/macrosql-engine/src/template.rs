//! Template structure
//!
//! A model template is an opaque metadata header terminated by `;`, then
//! zero or more `@DEF(name, value);` statements, then the SQL body. A query
//! template has no header.

use crate::error::{MacroError, MacroResult};
use crate::scanner::{
    is_ident_byte, is_ident_start, matching_paren, scan, skip_special, split_arguments,
    split_top_level, ArgText, Argument, Operator, Origin, Segment, TokenKind,
};
use serde::{Deserialize, Serialize};

/// How a template is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateLayout {
    /// Metadata header, `@DEF` statements, body
    Model,

    /// `@DEF` statements, body
    Query,
}

impl std::str::FromStr for TemplateLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "model" => Ok(Self::Model),
            "query" => Ok(Self::Query),
            other => Err(format!("unknown template layout '{}': expected model or query", other)),
        }
    }
}

impl TemplateLayout {
    /// `Model` when the text opens with a `MODEL (...)` header
    pub fn detect(text: &str) -> Self {
        let rest = &text[skip_trivia(text, 0)..];
        let word_len = rest.bytes().take_while(|b| is_ident_byte(*b)).count();
        if rest[..word_len].eq_ignore_ascii_case("MODEL") && rest[word_len..].trim_start().starts_with('(') {
            Self::Model
        } else {
            Self::Query
        }
    }
}

/// The metadata header of a model template, kept untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Leading word of the header, e.g. `MODEL`
    pub keyword: String,

    /// `key value` pairs from the parenthesized property list, in order
    pub properties: Vec<(String, String)>,

    /// Header text without the terminating `;`
    pub raw: String,
}

impl ModelMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// A `@DEF(name, value);` statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefStatement {
    pub name: String,
    pub value: Argument,
    /// Offset of the `@`
    pub offset: usize,
}

/// A template split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTemplate {
    pub metadata: Option<ModelMetadata>,
    pub definitions: Vec<DefStatement>,
    pub body: String,
    /// Offset of the body in the template text
    pub body_offset: usize,
}

impl ParsedTemplate {
    pub fn body_origin(&self) -> Origin {
        Origin::Template { base: self.body_offset }
    }
}

/// Split template text into header, definitions and body
pub fn parse_template(text: &str, layout: TemplateLayout) -> MacroResult<ParsedTemplate> {
    let mut pos = 0;
    let mut consumed = false;

    let metadata = match layout {
        TemplateLayout::Model => {
            let (metadata, end) = parse_metadata(text)?;
            pos = end;
            consumed = true;
            Some(metadata)
        }
        TemplateLayout::Query => None,
    };

    let mut definitions = Vec::new();
    loop {
        let start = skip_trivia(text, pos);
        if !text[start..].starts_with("@DEF(") {
            break;
        }
        let (definition, end) = parse_def(text, start)?;
        definitions.push(definition);
        pos = end;
        consumed = true;
    }

    let body_offset = if consumed {
        let rest = &text[pos..];
        pos + (rest.len() - rest.trim_start().len())
    } else {
        0
    };

    Ok(ParsedTemplate {
        metadata,
        definitions,
        body: text[body_offset..].to_string(),
        body_offset,
    })
}

fn parse_metadata(text: &str) -> MacroResult<(ModelMetadata, usize)> {
    let terminator = find_top_level_semicolon(text, 0).ok_or_else(|| {
        MacroError::syntax("Model metadata must be terminated by ';'", text.len())
    })?;
    let header = &text[..terminator];

    for segment in scan(header, Origin::Template { base: 0 })? {
        if let Segment::Macro(token) = segment {
            let message = match token.kind {
                TokenKind::Operator(Operator::Def) => "@DEF must follow the model metadata".to_string(),
                _ => format!("Macro @{} is not allowed in model metadata", token.name),
            };
            return Err(MacroError::syntax(message, token.offset));
        }
    }

    let raw = header.trim().to_string();
    let keyword: String = raw.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();

    let mut properties = Vec::new();
    if let Some(open) = header.find('(') {
        let close = matching_paren(header, open).ok_or_else(|| {
            MacroError::syntax("Unbalanced parentheses in model metadata", open)
        })?;
        for (_, property) in split_top_level(&header[open + 1..close]) {
            let property = property.trim();
            if property.is_empty() {
                continue;
            }
            let (key, value) = property
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((property, ""));
            properties.push((key.to_string(), value.to_string()));
        }
    }

    Ok((ModelMetadata { keyword, properties, raw }, terminator + 1))
}

fn parse_def(text: &str, start: usize) -> MacroResult<(DefStatement, usize)> {
    let open = start + "@DEF".len();
    let close = matching_paren(text, open).ok_or_else(|| {
        MacroError::syntax("Unterminated @DEF(...) call: missing ')'", start)
    })?;

    let args = ArgText {
        text: text[open + 1..close].to_string(),
        origin: Origin::Template { base: open + 1 },
    };
    let mut arguments = split_arguments(&args)?;
    if arguments.len() != 2 {
        return Err(MacroError::syntax(
            format!("@DEF takes a name and a value, got {} argument(s)", arguments.len()),
            start,
        ));
    }
    let value = arguments.remove(1);
    let name = match &arguments[0] {
        Argument::Expr { text, .. } if is_identifier(text) => text.clone(),
        other => {
            return Err(MacroError::syntax(
                "The first argument of @DEF must be a variable name",
                other.offset(),
            ))
        }
    };

    let after = skip_trivia(text, close + 1);
    if text.as_bytes().get(after) != Some(&b';') {
        return Err(MacroError::syntax(
            format!("@DEF({}, ...) must be terminated by ';'", name),
            start,
        ));
    }

    Ok((DefStatement { name, value, offset: start }, after + 1))
}

fn is_identifier(text: &str) -> bool {
    let bytes = text.as_bytes();
    !bytes.is_empty() && is_ident_start(bytes[0]) && bytes.iter().all(|&b| is_ident_byte(b))
}

/// Skip whitespace and SQL comments
fn skip_trivia(text: &str, mut pos: usize) -> usize {
    let bytes = text.as_bytes();
    while pos < bytes.len() {
        if bytes[pos].is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let is_comment = matches!(&bytes[pos..], [b'-', b'-', ..] | [b'/', b'*', ..]);
        match skip_special(bytes, pos) {
            Some(end) if is_comment => pos = end,
            _ => break,
        }
    }
    pos
}

fn find_top_level_semicolon(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}
