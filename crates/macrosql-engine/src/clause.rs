//! Clause-aware renderer
//!
//! Resolves the six clause operators over a scanned segment list. A true
//! condition replaces the operator and any leading modifier words with the
//! clause keyword; a false condition removes the head together with the
//! clause body up to the next clause boundary.

use crate::error::{MacroError, MacroResult};
use crate::scanner::{
    sql_events, split_arguments, ArgText, Argument, MacroToken, Operator, Origin, Segment, SqlEvent, TokenKind,
};
use crate::value::MacroValue;
use std::collections::HashMap;

/// The six SQL clauses with a macro operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClauseKind {
    With,
    Join,
    Where,
    GroupBy,
    Having,
    OrderBy,
}

impl ClauseKind {
    pub const ALL: [ClauseKind; 6] = [
        Self::With,
        Self::Join,
        Self::Where,
        Self::GroupBy,
        Self::Having,
        Self::OrderBy,
    ];

    pub fn from_operator(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.operator_name() == name)
    }

    /// Operator name as written after `@`
    pub fn operator_name(&self) -> &'static str {
        match self {
            Self::With => "WITH",
            Self::Join => "JOIN",
            Self::Where => "WHERE",
            Self::GroupBy => "GROUP_BY",
            Self::Having => "HAVING",
            Self::OrderBy => "ORDER_BY",
        }
    }

    /// SQL keyword(s) emitted for a true condition
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::With => "WITH",
            Self::Join => "JOIN",
            Self::Where => "WHERE",
            Self::GroupBy => "GROUP BY",
            Self::Having => "HAVING",
            Self::OrderBy => "ORDER BY",
        }
    }
}

/// Keyword and recognized leading modifiers of one clause operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseDescriptor {
    pub kind: ClauseKind,
    pub keyword: &'static str,
    /// Uppercase modifier words that may precede the operator
    pub modifiers: Vec<String>,
}

const JOIN_MODIFIERS: [&str; 9] = [
    "LEFT", "RIGHT", "FULL", "INNER", "OUTER", "CROSS", "NATURAL", "SEMI", "ANTI",
];

const BOUNDARY_KEYWORDS: [&str; 15] = [
    "SELECT", "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "QUALIFY",
    "WINDOW", "UNION", "INTERSECT", "EXCEPT", "JOIN",
];

/// Descriptors for every clause operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseTable {
    descriptors: HashMap<ClauseKind, ClauseDescriptor>,
}

impl Default for ClauseTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl ClauseTable {
    /// Built-in modifier sets: join types before `@JOIN`, nothing elsewhere
    pub fn standard() -> Self {
        let descriptors = ClauseKind::ALL
            .into_iter()
            .map(|kind| {
                let modifiers = match kind {
                    ClauseKind::Join => JOIN_MODIFIERS.iter().map(|m| m.to_string()).collect(),
                    _ => Vec::new(),
                };
                (kind, ClauseDescriptor { kind, keyword: kind.keyword(), modifiers })
            })
            .collect();
        Self { descriptors }
    }

    /// Replace the modifier set of one clause
    pub fn with_modifiers<I, S>(mut self, kind: ClauseKind, modifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let modifiers = modifiers
            .into_iter()
            .map(|m| m.as_ref().trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        self.descriptors.insert(
            kind,
            ClauseDescriptor { kind, keyword: kind.keyword(), modifiers },
        );
        self
    }

    pub fn get(&self, kind: ClauseKind) -> &ClauseDescriptor {
        // every kind is inserted by `standard`
        &self.descriptors[&kind]
    }

    /// Whether `word` ends a clause body
    pub fn is_boundary(&self, word: &str) -> bool {
        let upper = word.to_ascii_uppercase();
        BOUNDARY_KEYWORDS.contains(&upper.as_str())
            || self.descriptors.values().any(|d| d.modifiers.contains(&upper))
    }
}

/// Resolve every clause operator in `segments`
///
/// `condition` evaluates a clause operator's single argument.
pub fn resolve_clauses<F>(
    segments: Vec<Segment>,
    table: &ClauseTable,
    mut condition: F,
) -> MacroResult<Vec<Segment>>
where
    F: FnMut(&str, Origin) -> MacroResult<MacroValue>,
{
    let mut output: Vec<Segment> = Vec::with_capacity(segments.len());
    let mut iter = segments.into_iter().peekable();

    while let Some(segment) = iter.next() {
        let clause = match &segment {
            Segment::Macro(MacroToken {
                kind: TokenKind::Operator(Operator::Clause(kind)),
                args: Some(args),
                offset,
                ..
            }) => Some((*kind, args.clone(), *offset)),
            _ => None,
        };
        let Some((kind, args, offset)) = clause else {
            output.push(segment);
            continue;
        };

        let descriptor = table.get(kind);
        let value = clause_condition(kind, &args, offset, &mut condition)?;
        let modifiers = strip_modifiers(&mut output, &descriptor.modifiers);

        if value {
            let mut head = modifiers;
            head.push(descriptor.keyword.to_string());
            output.push(Segment::Literal { text: head.join(" "), offset });
            continue;
        }

        // drop the clause body
        let mut body = BodyScan::default();
        let mut terminated = true;
        let mut rest = None;
        while let Some(next) = iter.peek() {
            match next {
                Segment::Macro(token) => {
                    if body.depth == 0 && matches!(token.kind, TokenKind::Operator(Operator::Clause(_))) {
                        terminated = false;
                        break;
                    }
                    body.interrupt();
                }
                Segment::Literal { text, offset } => {
                    if let Some((position, is_terminator)) = body.find_boundary(text, table) {
                        terminated = is_terminator;
                        rest = Some(Segment::Literal {
                            text: text[position..].to_string(),
                            offset: offset + position,
                        });
                        iter.next();
                        break;
                    }
                }
            }
            iter.next();
        }

        if terminated {
            trim_trailing_whitespace(&mut output);
        }
        output.extend(rest);
    }

    Ok(merge_literals(output))
}

fn clause_condition<F>(kind: ClauseKind, args: &ArgText, offset: usize, condition: &mut F) -> MacroResult<bool>
where
    F: FnMut(&str, Origin) -> MacroResult<MacroValue>,
{
    let arguments = split_arguments(args)?;
    let [Argument::Expr { text, origin }] = arguments.as_slice() else {
        return Err(MacroError::syntax(
            format!("@{} takes exactly one condition argument", kind.operator_name()),
            offset,
        ));
    };

    match condition(text, *origin)? {
        MacroValue::Scalar(crate::value::Scalar::Bool(b)) => Ok(b),
        other => Err(MacroError::type_error(
            format!(
                "@{} requires a boolean condition, got {}",
                kind.operator_name(),
                other.type_name()
            ),
            origin.locate(0),
        )),
    }
}

/// Remove the trailing run of modifier words from the last emitted literal
fn strip_modifiers(output: &mut [Segment], modifiers: &[String]) -> Vec<String> {
    if modifiers.is_empty() {
        return Vec::new();
    }
    let Some(Segment::Literal { text, .. }) = output.last_mut() else {
        return Vec::new();
    };

    let mut found = Vec::new();
    let mut cut = text.len();
    loop {
        let before = text[..cut].trim_end();
        let word_start = before
            .char_indices()
            .rev()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let word = &before[word_start..];
        let separated = word_start == 0 || before[..word_start].ends_with(char::is_whitespace);
        if word.is_empty() || !separated {
            break;
        }
        let upper = word.to_ascii_uppercase();
        if !modifiers.contains(&upper) {
            break;
        }
        found.push(upper);
        cut = word_start;
    }

    text.truncate(cut);
    found.reverse();
    found
}

/// Scan state carried across the literal pieces of a dropped clause body
#[derive(Debug, Default)]
struct BodyScan {
    depth: usize,
    /// Uppercase previous word at depth 0
    previous: Option<String>,
}

impl BodyScan {
    /// Position of the first clause boundary in `text`
    ///
    /// Returns the boundary offset and whether it terminates the statement
    /// (`;` or an unmatched `)`).
    fn find_boundary(&mut self, text: &str, table: &ClauseTable) -> Option<(usize, bool)> {
        for event in sql_events(text) {
            match event {
                SqlEvent::Open(_) => self.depth += 1,
                SqlEvent::Close(pos) => {
                    if self.depth == 0 {
                        return Some((pos, true));
                    }
                    self.depth -= 1;
                }
                SqlEvent::Semicolon(pos) if self.depth == 0 => return Some((pos, true)),
                SqlEvent::Word { start, text: word } if self.depth == 0 => {
                    let upper = word.to_ascii_uppercase();
                    // `LEFT(name, 1)` is a call and `a IS DISTINCT FROM b` a comparison
                    let is_call = text[start + word.len()..].starts_with('(');
                    let is_comparison = upper == "FROM" && self.previous.as_deref() == Some("DISTINCT");
                    if !is_call && !is_comparison && table.is_boundary(&upper) {
                        return Some((start, false));
                    }
                    self.previous = Some(upper);
                }
                _ => {}
            }
        }
        None
    }

    fn interrupt(&mut self) {
        self.previous = None;
    }
}

fn trim_trailing_whitespace(output: &mut Vec<Segment>) {
    if let Some(Segment::Literal { text, .. }) = output.last_mut() {
        let len = text.trim_end().len();
        text.truncate(len);
        if text.is_empty() {
            output.pop();
        }
    }
}

/// Join adjacent literals so later passes see contiguous text
fn merge_literals(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match (merged.last_mut(), segment) {
            (Some(Segment::Literal { text, .. }), Segment::Literal { text: next, .. }) => {
                text.push_str(&next);
            }
            (_, segment) => merged.push(segment),
        }
    }
    merged
}

/// Where in a statement text is being rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderContext {
    /// Items of a `SELECT` list
    ColumnList,
    /// A boolean condition (`WHERE`, `HAVING`, `ON`, `QUALIFY`)
    Predicate,
    Other,
}

const CONTEXT_KEYWORDS: [&str; 20] = [
    "SELECT", "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "QUALIFY",
    "WINDOW", "UNION", "INTERSECT", "EXCEPT", "JOIN", "ON", "USING", "WITH", "VALUES", "SET",
];

/// Rendering context at the end of `emitted`
///
/// Text at the top level with no clause keyword yet takes `inherited`.
pub fn detect_context(emitted: &str, inherited: RenderContext) -> RenderContext {
    let mut stack: Vec<Option<String>> = vec![None];

    for event in sql_events(emitted) {
        match event {
            SqlEvent::Open(_) => stack.push(None),
            SqlEvent::Close(_) => {
                if stack.len() > 1 {
                    stack.pop();
                }
            }
            SqlEvent::Semicolon(_) => {
                stack.clear();
                stack.push(None);
            }
            SqlEvent::Word { text, .. } => {
                let upper = text.to_ascii_uppercase();
                if CONTEXT_KEYWORDS.contains(&upper.as_str()) {
                    if let Some(top) = stack.last_mut() {
                        *top = Some(upper);
                    }
                }
            }
        }
    }

    match stack.last().and_then(|k| k.as_deref()) {
        Some("SELECT") => RenderContext::ColumnList,
        Some("WHERE" | "HAVING" | "ON" | "QUALIFY") => RenderContext::Predicate,
        Some(_) => RenderContext::Other,
        None if stack.len() == 1 => inherited,
        None => RenderContext::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::scan;
    use pretty_assertions::assert_eq;

    fn resolve(text: &str) -> MacroResult<String> {
        resolve_with(text, &ClauseTable::standard())
    }

    fn resolve_with(text: &str, table: &ClauseTable) -> MacroResult<String> {
        let segments = scan(text, Origin::Template { base: 0 })?;
        let resolved = resolve_clauses(segments, table, |arg, _| match arg {
            "True" => Ok(MacroValue::bool(true)),
            "False" => Ok(MacroValue::bool(false)),
            other => Ok(MacroValue::string(other)),
        })?;
        Ok(resolved
            .into_iter()
            .map(|s| match s {
                Segment::Literal { text, .. } => text,
                Segment::Macro(token) => format!("@{}", token.name),
            })
            .collect())
    }

    #[test]
    fn true_where_emits_keyword() {
        assert_eq!(resolve("SELECT * FROM t @WHERE(True) a > 1").unwrap(), "SELECT * FROM t WHERE a > 1");
    }

    #[test]
    fn false_where_removes_body() {
        assert_eq!(resolve("SELECT * FROM t @WHERE(False) a > 1").unwrap(), "SELECT * FROM t");
        assert_eq!(
            resolve("SELECT * FROM t @WHERE(False) a > 1 GROUP BY a").unwrap(),
            "SELECT * FROM t GROUP BY a"
        );
        assert_eq!(resolve("SELECT * FROM t @WHERE(False) a > 1;").unwrap(), "SELECT * FROM t;");
    }

    #[test]
    fn false_clause_stops_at_enclosing_paren() {
        assert_eq!(
            resolve("SELECT * FROM (SELECT * FROM t @WHERE(False) a IN (1, 2)) AS s").unwrap(),
            "SELECT * FROM (SELECT * FROM t) AS s"
        );
    }

    #[test]
    fn false_clause_stops_at_next_clause_operator() {
        assert_eq!(
            resolve("SELECT a FROM t @WHERE(False) a > @x @GROUP_BY(True) a").unwrap(),
            "SELECT a FROM t GROUP BY a"
        );
    }

    #[test]
    fn join_modifiers_are_kept_when_true() {
        assert_eq!(
            resolve("FROM city left outer @JOIN(True) country ON city.country = country.name").unwrap(),
            "FROM city LEFT OUTER JOIN country ON city.country = country.name"
        );
    }

    #[test]
    fn join_modifiers_are_removed_when_false() {
        assert_eq!(
            resolve("LEFT OUTER @JOIN(False) country ON city.country = country.name").unwrap(),
            ""
        );
        assert_eq!(
            resolve("FROM a INNER @JOIN(False) b ON a.id = b.id LEFT JOIN c ON a.id = c.id").unwrap(),
            "FROM a LEFT JOIN c ON a.id = c.id"
        );
    }

    #[test]
    fn function_calls_named_like_keywords_are_not_boundaries() {
        assert_eq!(resolve("SELECT * FROM t @WHERE(False) LEFT(name, 1) = 'a'").unwrap(), "SELECT * FROM t");
        assert_eq!(
            resolve("SELECT * FROM t @WHERE(False) right(code, 2) = 'xy' LEFT JOIN u ON t.id = u.id").unwrap(),
            "SELECT * FROM t LEFT JOIN u ON t.id = u.id"
        );
    }

    #[test]
    fn distinct_from_comparison_is_not_a_boundary() {
        assert_eq!(resolve("SELECT * FROM t @WHERE(False) a IS DISTINCT FROM b").unwrap(), "SELECT * FROM t");
        assert_eq!(
            resolve("SELECT * FROM t @WHERE(False) a IS NOT DISTINCT FROM b ORDER BY a").unwrap(),
            "SELECT * FROM t ORDER BY a"
        );
    }

    #[test]
    fn qualified_names_are_not_boundaries() {
        assert_eq!(
            resolve("FROM t @WHERE(False) t.order > 1 ORDER BY 1").unwrap(),
            "FROM t ORDER BY 1"
        );
    }

    #[test]
    fn every_clause_operator() {
        let cases = [
            ("@WITH(True) x AS (SELECT 1) SELECT * FROM x", "WITH x AS (SELECT 1) SELECT * FROM x"),
            ("@WITH(False) x AS (SELECT 1) SELECT 1", "SELECT 1"),
            ("SELECT a FROM t @GROUP_BY(True) a", "SELECT a FROM t GROUP BY a"),
            ("SELECT a FROM t @GROUP_BY(False) a HAVING 1 = 1", "SELECT a FROM t HAVING 1 = 1"),
            ("SELECT a FROM t GROUP BY a @HAVING(True) COUNT(*) > 1", "SELECT a FROM t GROUP BY a HAVING COUNT(*) > 1"),
            ("SELECT a FROM t GROUP BY a @HAVING(False) COUNT(*) > 1 LIMIT 3", "SELECT a FROM t GROUP BY a LIMIT 3"),
            ("SELECT a FROM t @ORDER_BY(True) a DESC", "SELECT a FROM t ORDER BY a DESC"),
            ("SELECT a FROM t @ORDER_BY(False) a DESC LIMIT 1", "SELECT a FROM t LIMIT 1"),
        ];
        for (input, expected) in cases {
            assert_eq!(resolve(input).unwrap(), expected, "input: {}", input);
        }
    }

    #[test]
    fn configured_modifiers() {
        let table = ClauseTable::standard().with_modifiers(ClauseKind::OrderBy, ["siblings"]);
        assert_eq!(
            resolve_with("SELECT a FROM t SIBLINGS @ORDER_BY(True) a", &table).unwrap(),
            "SELECT a FROM t SIBLINGS ORDER BY a"
        );
        assert_eq!(resolve_with("SELECT a FROM t SIBLINGS @ORDER_BY(False) a", &table).unwrap(), "SELECT a FROM t");
    }

    #[test]
    fn modifier_must_be_a_whole_word() {
        // "LEFT" inside an identifier is not a modifier
        assert_eq!(
            resolve("FROM t_LEFT @JOIN(True) u ON 1 = 1").unwrap(),
            "FROM t_LEFT JOIN u ON 1 = 1"
        );
    }

    #[test]
    fn non_boolean_condition_is_type_error() {
        let err = resolve("SELECT 1 @WHERE(1) a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
        assert_eq!(err.offset(), 16);
    }

    #[test]
    fn clause_needs_one_argument() {
        let err = resolve("SELECT 1 @WHERE(True, False) a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Syntax);
    }

    #[test]
    fn contexts() {
        assert_eq!(detect_context("SELECT a, ", RenderContext::Other), RenderContext::ColumnList);
        assert_eq!(detect_context("SELECT a FROM t WHERE ", RenderContext::Other), RenderContext::Predicate);
        assert_eq!(detect_context("SELECT SUM(", RenderContext::Other), RenderContext::Other);
        assert_eq!(detect_context("SELECT (SELECT 1), ", RenderContext::Other), RenderContext::ColumnList);
        assert_eq!(detect_context("FROM a JOIN b ON ", RenderContext::Other), RenderContext::Predicate);
        assert_eq!(detect_context("", RenderContext::ColumnList), RenderContext::ColumnList);
    }
}
