//! Diagnostics shared by the engine, the CLI and report.json
//!
//! Code strings end up in reports that CI jobs match on. Existing codes keep
//! their spelling; new failure modes get new codes.

use serde::{Deserialize, Serialize};

/// Stable diagnostic codes (v1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Template structure (1xxx)
    /// Malformed macro token, unmatched parenthesis or misplaced @DEF
    MacroSyntaxError,

    // Variables (2xxx)
    /// Reference to a macro variable that is not defined at that point
    MacroUndefinedVariable,

    /// Macro variable defined twice in the same scope
    MacroRedefinition,

    // Evaluation (3xxx)
    /// Operator argument evaluated to the wrong type
    MacroTypeError,

    /// Expression outside the supported grammar, or disallowed function
    MacroEvaluationError,

    /// Expansion exceeded the maximum nesting depth
    MacroCycleError,

    // Driver (4xxx)
    /// Template file could not be read
    TemplateReadError,

    /// Render exceeded the caller-imposed wall-clock limit
    RenderTimeout,

    // Other (9xxx)
    Info,
    Warning,
}

impl DiagnosticCode {
    /// The string written to reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacroSyntaxError => "MACRO_SYNTAX_ERROR",
            Self::MacroUndefinedVariable => "MACRO_UNDEFINED_VARIABLE",
            Self::MacroRedefinition => "MACRO_REDEFINITION",
            Self::MacroTypeError => "MACRO_TYPE_ERROR",
            Self::MacroEvaluationError => "MACRO_EVALUATION_ERROR",
            Self::MacroCycleError => "MACRO_CYCLE_ERROR",
            Self::TemplateReadError => "TEMPLATE_READ_ERROR",
            Self::RenderTimeout => "RENDER_TIMEOUT",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `Error` compares greatest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    /// Fails `macrosql check`
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Source location in a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path, or `<inline>` for templates rendered from memory
    pub file: String,

    /// 1-indexed
    pub line: Option<usize>,

    /// 1-indexed, counted in characters
    pub column: Option<usize>,

    /// Byte offset from the start of the template
    pub offset: Option<usize>,
}

impl Location {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
            offset: None,
        }
    }

    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            line: Some(line),
            ..Self::new(file)
        }
    }

    /// Resolve a byte offset inside `source` to a line/column location
    pub fn from_offset(file: impl Into<String>, source: &str, offset: usize) -> Self {
        let mut offset = offset.min(source.len());
        while !source.is_char_boundary(offset) {
            offset -= 1;
        }
        let consumed = &source[..offset];
        let line = consumed.matches('\n').count() + 1;
        let line_start = consumed.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let column = consumed[line_start..].chars().count() + 1;

        Self {
            file: file.into(),
            line: Some(line),
            column: Some(column),
            offset: Some(offset),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

/// One problem found while rendering a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,

    /// The offending template text, when it can be recovered
    pub snippet: Option<String>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            location: None,
            snippet: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach the offending source text
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        assert_eq!(DiagnosticCode::MacroSyntaxError.as_str(), "MACRO_SYNTAX_ERROR");
        assert_eq!(DiagnosticCode::MacroCycleError.as_str(), "MACRO_CYCLE_ERROR");
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::new(
            DiagnosticCode::MacroUndefinedVariable,
            Severity::Error,
            "Undefined macro variable: size"
        )
        .with_location(Location::with_line("models/items.sql", 12));

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("MACRO_UNDEFINED_VARIABLE"));
        assert!(json.contains("error"));
    }

    #[test]
    fn location_from_offset() {
        let source = "SELECT 1\nFROM t\nWHERE @x";
        let loc = Location::from_offset("inline.sql", source, source.find('@').unwrap());

        assert_eq!(loc.line, Some(3));
        assert_eq!(loc.column, Some(7));
        assert_eq!(loc.to_string(), "inline.sql:3:7");
    }

    #[test]
    fn location_offset_past_end_is_clamped() {
        let loc = Location::from_offset("inline.sql", "abc", 99);
        assert_eq!(loc.offset, Some(3));
        assert_eq!(loc.column, Some(4));
    }
}
