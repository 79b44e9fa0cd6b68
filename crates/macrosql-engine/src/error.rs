//! Macro expansion errors
//!
//! Every error carries the byte offset of the offending token in the
//! original template. Errors raised while expanding generated text report
//! the offset of the macro token that produced that text.

use macrosql_core::{Diagnostic, DiagnosticCode, Location, Severity};
use std::path::{Path, PathBuf};

/// Result alias used throughout the engine
pub type MacroResult<T> = Result<T, MacroError>;

/// Error taxonomy member, independent of message and position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    UndefinedVariable,
    Redefinition,
    Type,
    Evaluation,
    Cycle,
}

/// Error raised while rendering a template
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MacroError {
    #[error("Syntax error: {message}")]
    Syntax { message: String, offset: usize },

    #[error("Undefined macro variable: {name}")]
    UndefinedVariable { name: String, offset: usize },

    #[error("Macro variable '{name}' is already defined in this scope")]
    Redefinition { name: String, offset: usize },

    #[error("Type error: {message}")]
    Type { message: String, offset: usize },

    #[error("Evaluation error: {message}")]
    Evaluation { message: String, offset: usize },

    #[error("Expansion cycle: {message}")]
    Cycle { message: String, offset: usize },
}

impl MacroError {
    pub fn syntax(message: impl Into<String>, offset: usize) -> Self {
        Self::Syntax { message: message.into(), offset }
    }

    pub fn undefined(name: impl Into<String>, offset: usize) -> Self {
        Self::UndefinedVariable { name: name.into(), offset }
    }

    pub fn redefinition(name: impl Into<String>, offset: usize) -> Self {
        Self::Redefinition { name: name.into(), offset }
    }

    pub fn type_error(message: impl Into<String>, offset: usize) -> Self {
        Self::Type { message: message.into(), offset }
    }

    pub fn evaluation(message: impl Into<String>, offset: usize) -> Self {
        Self::Evaluation { message: message.into(), offset }
    }

    pub fn cycle(message: impl Into<String>, offset: usize) -> Self {
        Self::Cycle { message: message.into(), offset }
    }

    /// Byte offset of the offending token in the original template
    pub fn offset(&self) -> usize {
        match self {
            Self::Syntax { offset, .. }
            | Self::UndefinedVariable { offset, .. }
            | Self::Redefinition { offset, .. }
            | Self::Type { offset, .. }
            | Self::Evaluation { offset, .. }
            | Self::Cycle { offset, .. } => *offset,
        }
    }

    /// The same error at the offset `locate` maps the current one to
    pub(crate) fn relocated(mut self, locate: impl FnOnce(usize) -> usize) -> Self {
        let (Self::Syntax { offset, .. }
        | Self::UndefinedVariable { offset, .. }
        | Self::Redefinition { offset, .. }
        | Self::Type { offset, .. }
        | Self::Evaluation { offset, .. }
        | Self::Cycle { offset, .. }) = &mut self;
        *offset = locate(*offset);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::UndefinedVariable { .. } => ErrorKind::UndefinedVariable,
            Self::Redefinition { .. } => ErrorKind::Redefinition,
            Self::Type { .. } => ErrorKind::Type,
            Self::Evaluation { .. } => ErrorKind::Evaluation,
            Self::Cycle { .. } => ErrorKind::Cycle,
        }
    }

    /// Stable diagnostic code for this error
    pub fn code(&self) -> DiagnosticCode {
        match self.kind() {
            ErrorKind::Syntax => DiagnosticCode::MacroSyntaxError,
            ErrorKind::UndefinedVariable => DiagnosticCode::MacroUndefinedVariable,
            ErrorKind::Redefinition => DiagnosticCode::MacroRedefinition,
            ErrorKind::Type => DiagnosticCode::MacroTypeError,
            ErrorKind::Evaluation => DiagnosticCode::MacroEvaluationError,
            ErrorKind::Cycle => DiagnosticCode::MacroCycleError,
        }
    }

    /// Convert to a diagnostic, resolving the offset against the template source
    pub fn to_diagnostic(&self, source: &str, file_path: Option<&Path>) -> Diagnostic {
        let file = file_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string());
        let location = Location::from_offset(file, source, self.offset());

        let mut diag = Diagnostic::new(self.code(), Severity::Error, self.to_string())
            .with_location(location);

        if let Some(line) = line_at(source, self.offset()) {
            diag = diag.with_snippet(line);
        }

        diag
    }
}

/// The source line containing `offset`, trimmed
fn line_at(source: &str, offset: usize) -> Option<String> {
    if source.is_empty() {
        return None;
    }
    let mut offset = offset.min(source.len());
    while !source.is_char_boundary(offset) {
        offset -= 1;
    }
    let start = source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = source[offset..].find('\n').map(|i| offset + i).unwrap_or(source.len());
    let line = source[start..end].trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Error rendering a template file
#[derive(Debug, thiserror::Error)]
pub enum RenderFileError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Macro {
        path: PathBuf,
        template: String,
        #[source]
        source: MacroError,
    },
}

impl RenderFileError {
    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Io { path, source } => Diagnostic::new(
                DiagnosticCode::TemplateReadError,
                Severity::Error,
                format!("Failed to read template: {}", source),
            )
            .with_location(Location::new(path.display().to_string())),
            Self::Macro { path, template, source } => {
                source.to_diagnostic(template, Some(path))
            }
        }
    }
}
