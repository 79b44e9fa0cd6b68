//! Engine options
//!
//! Everything a render needs besides the template and the interval:
//! dialect, depth bound, clause modifier sets and externally supplied
//! variables and snippets.

use crate::clause::{ClauseKind, ClauseTable};
use crate::value::MacroValue;
use macrosql_core::config::DEFAULT_MAX_DEPTH;
use macrosql_core::{Config, ConfigError, DialectConfig};

/// Options shared by every render of an [`Engine`](crate::Engine)
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Controls identifier quoting
    pub dialect: DialectConfig,

    /// Bound on nested expansion and rescanning
    pub max_depth: usize,

    pub clauses: ClauseTable,

    /// Constants defined in the root scope, in order
    pub variables: Vec<(String, MacroValue)>,

    /// Template fragments defined in the root scope; expanded where referenced
    pub snippets: Vec<(String, String)>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dialect: DialectConfig::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            clauses: ClauseTable::standard(),
            variables: Vec::new(),
            snippets: Vec::new(),
        }
    }
}

impl EngineOptions {
    /// Build options from a loaded `macrosql.toml`
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut builder = EngineOptionsBuilder::new()
            .dialect(config.dialect)
            .max_depth(config.max_depth);

        for (operator, clause) in &config.clauses {
            let kind = ClauseKind::from_operator(&operator.to_ascii_uppercase()).ok_or_else(|| {
                ConfigError::ParseError(format!("unknown clause operator '{}' in [clauses]", operator))
            })?;
            builder = builder.clause_modifiers(kind, &clause.modifiers);
        }

        for (name, value) in &config.variables {
            builder = builder.var(name, MacroValue::from_json(value));
        }

        for (name, text) in &config.snippets {
            builder = builder.snippet(name, text);
        }

        Ok(builder.build())
    }
}

/// Builder for EngineOptions
pub struct EngineOptionsBuilder {
    options: EngineOptions,
}

impl EngineOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
        }
    }

    pub fn dialect(mut self, dialect: DialectConfig) -> Self {
        self.options.dialect = dialect;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.options.max_depth = max_depth;
        self
    }

    /// Replace the modifier words recognized before a clause operator
    pub fn clause_modifiers<I, S>(mut self, kind: ClauseKind, modifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.options.clauses = self.options.clauses.with_modifiers(kind, modifiers);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<MacroValue>) -> Self {
        self.options.variables.push((name.into(), value.into()));
        self
    }

    pub fn snippet(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.options.snippets.push((name.into(), text.into()));
        self
    }

    pub fn build(self) -> EngineOptions {
        self.options
    }
}

impl Default for EngineOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_options() {
        let options = EngineOptionsBuilder::new()
            .dialect(DialectConfig::BigQuery)
            .max_depth(8)
            .var("size", 1i64)
            .snippet("active", "status = 'active'")
            .build();

        assert_eq!(options.dialect, DialectConfig::BigQuery);
        assert_eq!(options.max_depth, 8);
        assert_eq!(options.variables, vec![("size".to_string(), MacroValue::int(1))]);
        assert_eq!(options.snippets.len(), 1);
    }

    #[test]
    fn from_config_converts_sections() {
        let config = Config::from_toml(
            r#"
dialect = "postgres"
max_depth = 10

[clauses.ORDER_BY]
modifiers = ["siblings"]

[variables]
sizes = [1, 2]
region = "eu"

[snippets]
active = "status = 'active'"
"#,
        )
        .unwrap();

        let options = EngineOptions::from_config(&config).unwrap();
        assert_eq!(options.dialect, DialectConfig::Postgres);
        assert_eq!(options.max_depth, 10);
        assert_eq!(options.clauses.get(ClauseKind::OrderBy).modifiers, vec!["SIBLINGS".to_string()]);
        assert_eq!(
            options.variables,
            vec![
                ("region".to_string(), MacroValue::string("eu")),
                (
                    "sizes".to_string(),
                    MacroValue::List(vec![MacroValue::int(1), MacroValue::int(2)])
                ),
            ]
        );
        assert_eq!(options.snippets, vec![("active".to_string(), "status = 'active'".to_string())]);
    }

    #[test]
    fn unknown_clause_operator_is_rejected() {
        let config = Config::from_toml("[clauses.LIMIT]\nmodifiers = []\n").unwrap();
        assert!(EngineOptions::from_config(&config).is_err());
    }
}
