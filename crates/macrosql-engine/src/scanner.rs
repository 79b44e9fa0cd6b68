//! Template scanner
//!
//! Splits template text into literal spans and macro tokens. A macro token
//! is `@` followed by an identifier; an uppercase identifier directly
//! followed by `(` is an operator call whose arguments run to the matching
//! parenthesis. String literals, quoted identifiers and SQL comments are
//! passed through without macro recognition.

use crate::clause::ClauseKind;
use crate::error::{MacroError, MacroResult};
use regex::Regex;
use std::sync::OnceLock;

/// Maps offsets inside a piece of text back to the original template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Text taken from the template itself, starting at byte `base`
    Template { base: usize },

    /// Text produced by expansion; every position maps to the producing token
    Expanded { at: usize },
}

impl Origin {
    /// Absolute offset of a local offset
    pub fn locate(&self, local: usize) -> usize {
        match self {
            Self::Template { base } => base + local,
            Self::Expanded { at } => *at,
        }
    }

    /// Origin of a sub-span starting at `local`
    pub fn sub(&self, local: usize) -> Origin {
        match self {
            Self::Template { base } => Self::Template { base: base + local },
            Self::Expanded { at } => Self::Expanded { at: *at },
        }
    }
}

/// Leads offsets in rewritten text back to the text it was rewritten from
///
/// Each replacement records where it sits in both texts. Offsets inside a
/// replacement map to the start of the text it replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OffsetMap {
    /// `(rewritten start, rewritten len, original start, original len)`, in order
    replacements: Vec<(usize, usize, usize, usize)>,
}

impl OffsetMap {
    pub(crate) fn replaced(&mut self, rewritten: usize, rewritten_len: usize, original: usize, original_len: usize) {
        self.replacements.push((rewritten, rewritten_len, original, original_len));
    }

    /// Local offset in the original text
    pub(crate) fn original(&self, local: usize) -> usize {
        match self.replacements.iter().rev().find(|(start, ..)| *start <= local) {
            None => local,
            Some(&(start, len, original, _)) if local < start + len => original,
            Some(&(start, len, original, original_len)) => original + original_len + (local - start - len),
        }
    }

    /// Absolute offset in the template of an absolute offset in text rendered from `origin`
    pub(crate) fn locate(&self, origin: Origin, absolute: usize) -> usize {
        match origin {
            Origin::Template { base } if absolute >= base => base + self.original(absolute - base),
            _ => absolute,
        }
    }

    pub(crate) fn remap_segments(&self, origin: Origin, segments: Vec<Segment>) -> Vec<Segment> {
        segments
            .into_iter()
            .map(|segment| match segment {
                Segment::Literal { text, offset } => Segment::Literal { text, offset: self.locate(origin, offset) },
                Segment::Macro(mut token) => {
                    token.offset = self.locate(origin, token.offset);
                    if let Some(args) = token.args.as_mut() {
                        if let Origin::Template { base } = args.origin {
                            args.origin = Origin::Template { base: self.locate(origin, base) };
                        }
                    }
                    Segment::Macro(token)
                }
            })
            .collect()
    }
}

/// Macro operators recognized after `@`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Def,
    Sql,
    Each,
    Filter,
    Reduce,
    If,
    And,
    Or,
    Clause(ClauseKind),
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "DEF" => Self::Def,
            "SQL" => Self::Sql,
            "EACH" => Self::Each,
            "FILTER" => Self::Filter,
            "REDUCE" => Self::Reduce,
            "IF" => Self::If,
            "AND" => Self::And,
            "OR" => Self::Or,
            other => Self::Clause(ClauseKind::from_operator(other)?),
        };
        Some(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Def => "DEF",
            Self::Sql => "SQL",
            Self::Each => "EACH",
            Self::Filter => "FILTER",
            Self::Reduce => "REDUCE",
            Self::If => "IF",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Clause(kind) => kind.operator_name(),
        }
    }
}

/// Raw argument text of an operator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgText {
    pub text: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Variable,
    Operator(Operator),
}

/// A macro token found in template text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroToken {
    /// Variable name or operator name, as written
    pub name: String,
    pub kind: TokenKind,
    /// Argument list of an operator call
    pub args: Option<ArgText>,
    /// Absolute offset of the `@`
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal { text: String, offset: usize },
    Macro(MacroToken),
}

/// A single operator argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Expr { text: String, origin: Origin },
    Lambda { params: Vec<String>, body: String, origin: Origin },
}

impl Argument {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Expr { origin, .. } | Self::Lambda { origin, .. } => *origin,
        }
    }

    /// Absolute offset of the argument start
    pub fn offset(&self) -> usize {
        self.origin().locate(0)
    }
}

/// Scan template text into segments
pub fn scan(text: &str, origin: Origin) -> MacroResult<Vec<Segment>> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }

        if bytes[i] != b'@' {
            i += 1;
            continue;
        }

        // `@@name` is a literal (e.g. T-SQL system variables)
        if bytes.get(i + 1) == Some(&b'@') {
            i += 2;
            while i < bytes.len() && is_ident_byte(bytes[i]) {
                i += 1;
            }
            continue;
        }

        if !bytes.get(i + 1).copied().is_some_and(is_ident_start) {
            i += 1;
            continue;
        }

        let name_start = i + 1;
        let mut name_end = name_start;
        while name_end < bytes.len() && is_ident_byte(bytes[name_end]) {
            name_end += 1;
        }
        let name = &text[name_start..name_end];

        let (token, end) = if is_operator_name(name) && bytes.get(name_end) == Some(&b'(') {
            let op = Operator::from_name(name).ok_or_else(|| {
                MacroError::syntax(format!("Unknown macro operator @{}", name), origin.locate(i))
            })?;
            let close = matching_paren(text, name_end).ok_or_else(|| {
                MacroError::syntax(
                    format!("Unterminated @{}(...) call: missing ')'", name),
                    origin.locate(i),
                )
            })?;
            let token = MacroToken {
                name: name.to_string(),
                kind: TokenKind::Operator(op),
                args: Some(ArgText {
                    text: text[name_end + 1..close].to_string(),
                    origin: origin.sub(name_end + 1),
                }),
                offset: origin.locate(i),
            };
            (token, close + 1)
        } else {
            let token = MacroToken {
                name: name.to_string(),
                kind: TokenKind::Variable,
                args: None,
                offset: origin.locate(i),
            };
            (token, name_end)
        };

        if literal_start < i {
            segments.push(Segment::Literal {
                text: text[literal_start..i].to_string(),
                offset: origin.locate(literal_start),
            });
        }
        segments.push(Segment::Macro(token));
        i = end;
        literal_start = end;
    }

    if literal_start < text.len() {
        segments.push(Segment::Literal {
            text: text[literal_start..].to_string(),
            offset: origin.locate(literal_start),
        });
    }

    Ok(segments)
}

/// Whether `text` contains any macro token
pub fn contains_macro(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }
        if bytes[i] == b'@' {
            match bytes.get(i + 1) {
                Some(b'@') => {
                    i += 2;
                    while i < bytes.len() && is_ident_byte(bytes[i]) {
                        i += 1;
                    }
                    continue;
                }
                Some(&next) if is_ident_start(next) => return true,
                _ => {}
            }
        }
        i += 1;
    }
    false
}

fn lambda_head() -> &'static Regex {
    static LAMBDA_HEAD: OnceLock<Regex> = OnceLock::new();
    LAMBDA_HEAD.get_or_init(|| {
        Regex::new(
            r"^\s*(?:([A-Za-z_][A-Za-z0-9_]*)|\(\s*([A-Za-z_][A-Za-z0-9_]*(?:\s*,\s*[A-Za-z_][A-Za-z0-9_]*)*)\s*\))\s*->",
        )
        .expect("lambda head pattern is valid")
    })
}

/// Split an operator's argument text at top-level commas
///
/// Each argument is classified as an expression or a lambda
/// (`x -> body` / `(acc, x) -> body`).
pub fn split_arguments(args: &ArgText) -> MacroResult<Vec<Argument>> {
    if args.text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut arguments = Vec::new();
    for (start, piece) in split_top_level(&args.text) {
        let leading = piece.len() - piece.trim_start().len();
        let trimmed = piece.trim();
        let origin = args.origin.sub(start + leading);

        if trimmed.is_empty() {
            return Err(MacroError::syntax("Empty macro argument", origin.locate(0)));
        }

        if let Some(caps) = lambda_head().captures(trimmed) {
            let params = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(|p| p.trim().to_ascii_lowercase())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let head_len = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let rest = &trimmed[head_len..];
            let body_start = head_len + (rest.len() - rest.trim_start().len());
            let body = trimmed[body_start..].to_string();

            if body.is_empty() {
                return Err(MacroError::syntax("Lambda has an empty body", origin.locate(0)));
            }

            arguments.push(Argument::Lambda {
                params,
                body,
                origin: origin.sub(body_start),
            });
        } else {
            arguments.push(Argument::Expr {
                text: trimmed.to_string(),
                origin,
            });
        }
    }

    Ok(arguments)
}

/// Split text at commas outside brackets, quotes and comments
///
/// Returns each piece with its byte offset.
pub(crate) fn split_top_level(text: &str) -> Vec<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                pieces.push((start, &text[start..i]));
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    pieces.push((start, &text[start..]));
    pieces
}

/// Index of the `)` matching the `(` at `open`
pub(crate) fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;

    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// If a string literal, quoted identifier or comment starts at `i`,
/// return the index just past it
pub(crate) fn skip_special(bytes: &[u8], i: usize) -> Option<usize> {
    match bytes[i] {
        quote @ (b'\'' | b'"' | b'`') => {
            let mut j = i + 1;
            while j < bytes.len() {
                if bytes[j] == quote {
                    // doubled quote is an escaped quote
                    if bytes.get(j + 1) == Some(&quote) {
                        j += 2;
                        continue;
                    }
                    return Some(j + 1);
                }
                j += 1;
            }
            Some(bytes.len())
        }
        b'-' if bytes.get(i + 1) == Some(&b'-') => {
            let end = bytes[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| i + p)
                .unwrap_or(bytes.len());
            Some(end)
        }
        b'/' if bytes.get(i + 1) == Some(&b'*') => {
            let end = bytes[i + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map(|p| i + 2 + p + 2)
                .unwrap_or(bytes.len());
            Some(end)
        }
        _ => None,
    }
}

/// Structural events in SQL text, used for clause boundaries and context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlEvent<'t> {
    Word { start: usize, text: &'t str },
    Open(usize),
    Close(usize),
    Semicolon(usize),
}

pub(crate) fn sql_events(text: &str) -> Vec<SqlEvent<'_>> {
    let bytes = text.as_bytes();
    let mut events = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = skip_special(bytes, i) {
            i = end;
            continue;
        }
        let b = bytes[i];
        if is_ident_start(b) {
            let start = i;
            while i < bytes.len() && is_ident_byte(bytes[i]) {
                i += 1;
            }
            // qualified names (`t.order`) are never keywords
            if bytes.get(i) == Some(&b'.') {
                while i < bytes.len() && (is_ident_byte(bytes[i]) || bytes[i] == b'.') {
                    i += 1;
                }
                continue;
            }
            events.push(SqlEvent::Word { start, text: &text[start..i] });
            continue;
        }
        if b.is_ascii_digit() || b == b'@' {
            // numbers and macro names are not keywords
            i += 1;
            while i < bytes.len() && is_ident_byte(bytes[i]) {
                i += 1;
            }
            continue;
        }
        match b {
            b'(' => events.push(SqlEvent::Open(i)),
            b')' => events.push(SqlEvent::Close(i)),
            b';' => events.push(SqlEvent::Semicolon(i)),
            _ => {}
        }
        i += 1;
    }

    events
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

pub(crate) fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Uppercase identifiers with at least one letter name operators
fn is_operator_name(name: &str) -> bool {
    name.bytes().any(|b| b.is_ascii_uppercase())
        && name.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: Origin = Origin::Template { base: 0 };

    fn macro_names(segments: &[Segment]) -> Vec<&str> {
        segments
            .iter()
            .filter_map(|s| match s {
                Segment::Macro(t) => Some(t.name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_is_one_literal() {
        let segments = scan("SELECT a FROM t", ROOT).unwrap();
        assert_eq!(
            segments,
            vec![Segment::Literal { text: "SELECT a FROM t".to_string(), offset: 0 }]
        );
    }

    #[test]
    fn variables_and_operators() {
        let segments = scan("SELECT @col FROM t @WHERE(@x > (1 + 2)) a = 1", ROOT).unwrap();
        assert_eq!(macro_names(&segments), vec!["col", "WHERE"]);

        let Segment::Macro(where_token) = &segments[3] else {
            panic!("expected macro token");
        };
        assert_eq!(where_token.kind, TokenKind::Operator(Operator::Clause(ClauseKind::Where)));
        assert_eq!(where_token.offset, 19);
        let args = where_token.args.as_ref().unwrap();
        assert_eq!(args.text, "@x > (1 + 2)");
        assert_eq!(args.origin, Origin::Template { base: 26 });
    }

    #[test]
    fn lowercase_name_before_paren_is_a_variable() {
        let segments = scan("@fn(1)", ROOT).unwrap();
        assert_eq!(macro_names(&segments), vec!["fn"]);
        assert!(matches!(&segments[1], Segment::Literal { text, .. } if text == "(1)"));
    }

    #[test]
    fn strings_and_comments_are_not_scanned() {
        let text = "SELECT '@not_a_var', \"@col\" -- @comment\n/* @block */ @real";
        let segments = scan(text, ROOT).unwrap();
        assert_eq!(macro_names(&segments), vec!["real"]);
    }

    #[test]
    fn double_at_is_literal() {
        let segments = scan("SELECT @@ROWCOUNT", ROOT).unwrap();
        assert_eq!(macro_names(&segments), Vec::<&str>::new());
    }

    #[test]
    fn parens_inside_strings_do_not_close_call() {
        let segments = scan("@SQL(')' || x)", ROOT).unwrap();
        let Segment::Macro(token) = &segments[0] else {
            panic!("expected macro token");
        };
        assert_eq!(token.args.as_ref().unwrap().text, "')' || x");
    }

    #[test]
    fn unterminated_call_is_syntax_error() {
        let err = scan("SELECT 1 @WHERE(a > (1)", ROOT).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Syntax);
        assert_eq!(err.offset(), 9);
    }

    #[test]
    fn unknown_operator_is_syntax_error() {
        let err = scan("@FROBNICATE(1)", ROOT).unwrap_err();
        assert_eq!(err, MacroError::syntax("Unknown macro operator @FROBNICATE", 0));
    }

    #[test]
    fn expanded_origin_maps_everything_to_token() {
        let segments = scan("x @y", Origin::Expanded { at: 40 }).unwrap();
        let Segment::Macro(token) = &segments[1] else {
            panic!("expected macro token");
        };
        assert_eq!(token.offset, 40);
    }

    #[test]
    fn split_arguments_recognizes_lambdas() {
        let args = ArgText {
            text: "['a', 'b'], (acc, x) -> acc + x, v -> v".to_string(),
            origin: Origin::Template { base: 100 },
        };
        let arguments = split_arguments(&args).unwrap();

        assert_eq!(arguments.len(), 3);
        assert_eq!(
            arguments[0],
            Argument::Expr { text: "['a', 'b']".to_string(), origin: Origin::Template { base: 100 } }
        );
        assert_eq!(
            arguments[1],
            Argument::Lambda {
                params: vec!["acc".to_string(), "x".to_string()],
                body: "acc + x".to_string(),
                origin: Origin::Template { base: 124 },
            }
        );
        assert!(matches!(&arguments[2], Argument::Lambda { params, body, .. }
            if params == &["v".to_string()] && body == "v"));
    }

    #[test]
    fn comparison_is_not_a_lambda() {
        let args = ArgText { text: "x >= 1".to_string(), origin: ROOT };
        let arguments = split_arguments(&args).unwrap();
        assert!(matches!(&arguments[0], Argument::Expr { .. }));
    }

    #[test]
    fn empty_argument_is_syntax_error() {
        let args = ArgText { text: "1,,2".to_string(), origin: ROOT };
        assert!(split_arguments(&args).is_err());
    }

    #[test]
    fn contains_macro_ignores_quoted_text() {
        assert!(contains_macro("a > @b"));
        assert!(!contains_macro("a > '@b'"));
        assert!(!contains_macro("user@@x"));
        assert!(!contains_macro("no macros"));
    }

    #[test]
    fn offset_map_leads_back_to_original_text() {
        // "f(c) + @x" with `c` replaced by `"xyz"`
        let mut map = OffsetMap::default();
        map.replaced(2, 5, 2, 1);

        assert_eq!(map.original(0), 0);
        assert_eq!(map.original(3), 2);
        assert_eq!(map.original(7), 3);
        assert_eq!(map.original(11), 7);

        let origin = Origin::Template { base: 20 };
        assert_eq!(map.locate(origin, 31), 27);
        assert_eq!(map.locate(Origin::Expanded { at: 5 }, 31), 31);
    }

    #[test]
    fn sql_events_track_words_and_parens() {
        let events = sql_events("SELECT (a) FROM t; 'WHERE'");
        assert_eq!(
            events,
            vec![
                SqlEvent::Word { start: 0, text: "SELECT" },
                SqlEvent::Open(7),
                SqlEvent::Word { start: 8, text: "a" },
                SqlEvent::Close(9),
                SqlEvent::Word { start: 11, text: "FROM" },
                SqlEvent::Word { start: 16, text: "t" },
                SqlEvent::Semicolon(17),
            ]
        );
    }
}
