//! Report schema (stable v1)
//!
//! Written by `macrosql check`. Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use crate::diagnostic::{Diagnostic, Severity};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    pub major: u32,
    pub minor: u32,
}

impl ReportVersion {
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Counts over a check run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Total number of diagnostics
    pub total: usize,
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,

    /// Templates that rendered without an error
    pub templates_rendered: usize,
}

/// One successfully rendered template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplate {
    /// Path relative to the checked directory
    pub path: String,

    /// SHA-256 of the rendered SQL; unchanged fingerprints mean unchanged output
    pub fingerprint: String,

    /// Scanning passes the render took
    pub passes: usize,
}

/// Check report (report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub version: ReportVersion,

    /// RFC 3339 creation time
    pub timestamp: String,

    pub summary: ReportSummary,

    pub diagnostics: Vec<Diagnostic>,

    /// Templates that rendered, in check order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<RenderedTemplate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Report {
    pub fn new() -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: ReportSummary::default(),
            diagnostics: Vec::new(),
            templates: Vec::new(),
            metadata: None,
        }
    }

    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let mut report = Self::new();
        for diagnostic in diagnostics {
            report.add_diagnostic(diagnostic);
        }
        report
    }

    /// Add a diagnostic and count it under its severity
    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        let counter = match diagnostic.severity {
            Severity::Error => &mut self.summary.errors,
            Severity::Warn => &mut self.summary.warnings,
            Severity::Info => &mut self.summary.info,
        };
        *counter += 1;
        self.summary.total += 1;
        self.diagnostics.push(diagnostic);
    }

    /// Record a template that rendered without errors
    pub fn record_rendered(&mut self, path: impl Into<String>, fingerprint: impl Into<String>, passes: usize) {
        self.summary.templates_rendered += 1;
        self.templates.push(RenderedTemplate {
            path: path.into(),
            fingerprint: fingerprint.into(),
            passes,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.summary.errors > 0
    }

    /// Diagnostics located in `path`
    pub fn diagnostics_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.diagnostics
            .iter()
            .filter(move |d| d.location.as_ref().is_some_and(|loc| loc.file == path))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}
