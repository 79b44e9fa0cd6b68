//! macrosql Core
//!
//! Core domain model with stable, versioned types.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod report;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use report::{RenderedTemplate, Report, ReportSummary, ReportVersion};
pub use config::{Config, ConfigError, DialectConfig, ClauseOverride, SeverityThreshold, SkipRules};
