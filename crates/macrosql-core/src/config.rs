//! `macrosql.toml`
//!
//! Every table is optional. A missing file means defaults everywhere.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use crate::diagnostic::{DiagnosticCode, Severity};

/// Default bound on nested expansion and rescanning passes
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Target dialect of the rendered SQL. Only identifier quoting differs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectConfig {
    #[default]
    Ansi,
    Postgres,
    Snowflake,
    Trino,
    /// Backtick-quoted identifiers
    BigQuery,
}

impl DialectConfig {
    /// Quote `name` as an identifier, escaping embedded quote characters
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Self::BigQuery => format!("`{}`", name.replace('`', "\\`")),
            Self::Ansi | Self::Postgres | Self::Snowflake | Self::Trino => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
        }
    }
}

impl std::str::FromStr for DialectConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ansi" => Ok(Self::Ansi),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "snowflake" => Ok(Self::Snowflake),
            "trino" => Ok(Self::Trino),
            "bigquery" => Ok(Self::BigQuery),
            other => Err(ConfigError::ParseError(format!("unknown dialect '{}'", other))),
        }
    }
}

/// `[severity.overrides]`: diagnostic code string to severity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityThreshold {
    pub overrides: HashMap<String, Severity>,
}

impl SeverityThreshold {
    /// The configured severity for `code`, falling back to `default`
    pub fn get_severity(&self, code: DiagnosticCode, default: Severity) -> Severity {
        match self.overrides.get(code.as_str()) {
            Some(severity) => *severity,
            None => default,
        }
    }

    pub fn set_override(&mut self, code: DiagnosticCode, severity: Severity) {
        self.overrides.insert(code.as_str().to_owned(), severity);
    }
}

/// Override of the leading modifier words recognized before a clause operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClauseOverride {
    /// Modifier keywords, e.g. `["LEFT", "OUTER"]` for `@JOIN`
    #[serde(default)]
    pub modifiers: Vec<String>,
}

/// `[skip]`: templates a `check` run leaves alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkipRules {
    /// Exact relative paths or `*` patterns
    #[serde(default)]
    pub templates: Vec<String>,
}

impl SkipRules {
    pub fn is_skipped(&self, path: &str) -> bool {
        self.templates.iter().any(|pattern| glob_match(pattern, path))
    }
}

/// Project configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dialect: DialectConfig,

    /// Bound on expansion nesting and rescanning passes
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Clause modifier overrides keyed by operator name (`JOIN`, `WHERE`, ...)
    #[serde(default)]
    pub clauses: BTreeMap<String, ClauseOverride>,

    /// Constants defined in the root scope of every render
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,

    /// Named SQL fragments, expanded as template text when referenced
    #[serde(default)]
    pub snippets: BTreeMap<String, String>,

    #[serde(default)]
    pub severity: SeverityThreshold,

    #[serde(default)]
    pub skip: SkipRules,

    /// Directory holding the config file; relative `check` paths resolve against it
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dialect: DialectConfig::Ansi,
            max_depth: DEFAULT_MAX_DEPTH,
            clauses: BTreeMap::new(),
            variables: BTreeMap::new(),
            snippets: BTreeMap::new(),
            severity: SeverityThreshold::default(),
            skip: SkipRules::default(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::from_toml(&contents)?;
        config.project_root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(config.project_root);

        Ok(config)
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.max_depth == 0 {
            return Err(ConfigError::ParseError("max_depth must be at least 1".to_string()));
        }

        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

/// `*` matches any run of characters; `**` behaves the same
fn glob_match(pattern: &str, text: &str) -> bool {
    let Some((prefix, rest)) = pattern.split_once('*') else {
        return pattern == text;
    };
    let Some(tail) = text.strip_prefix(prefix) else {
        return false;
    };
    let rest = rest.trim_start_matches('*');
    if rest.is_empty() {
        return true;
    }
    tail.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(tail.len()))
        .any(|i| glob_match(rest, &tail[i..]))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
