//! Expansion driver
//!
//! Renders a template in passes. Each pass scans pending text, resolves
//! clause operators and substitutes every remaining macro token. Text
//! produced by a substitution that may itself contain macro tokens stays
//! pending and is rescanned on the next pass, until no pending text is left
//! or the depth bound is exceeded.

use crate::clause::{detect_context, resolve_clauses, RenderContext};
use crate::context::EngineOptions;
use crate::environment::Environment;
use crate::error::{MacroError, MacroResult, RenderFileError};
use crate::expression::{Evaluator, Expr, MacroHost};
use crate::interval::IntervalContext;
use crate::scanner::{contains_macro, scan, ArgText, Argument, OffsetMap, Operator, Origin, Segment, TokenKind};
use crate::template::{parse_template, ModelMetadata, TemplateLayout};
use crate::value::{Lambda, MacroValue, SqlFragment};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionState {
    Initializing,
    Scanning,
    Substituting,
    Rescanning,
    Done,
    Failed,
}

/// Result of a successful render
#[derive(Debug, Clone, Serialize)]
pub struct RenderResult {
    /// Fully expanded SQL
    pub sql: String,

    /// Model metadata header, for model templates
    pub metadata: Option<ModelMetadata>,

    /// Names defined by `@DEF`, in definition order
    pub definitions: Vec<String>,

    /// Number of scanning passes performed
    pub passes: usize,

    pub state: ExpansionState,

    /// SHA-256 of `sql`, hex encoded
    pub fingerprint: String,
}

/// Pending text a single render may hold at once
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// A piece of rendered output
#[derive(Debug, Clone)]
pub(crate) enum Piece {
    Final(String),
    Pending {
        text: String,
        origin: Origin,
        context: RenderContext,
        /// Variables whose substitution produced this text, outermost first
        chain: Vec<String>,
    },
}

impl Piece {
    /// Text that needs another pass only if it contains macro tokens
    pub(crate) fn from_text(text: String, origin: Origin, context: RenderContext) -> Self {
        if contains_macro(&text) {
            Self::Pending { text, origin, context, chain: Vec::new() }
        } else {
            Self::Final(text)
        }
    }

    /// Mark pending text as produced while expanding `chain`
    fn descend(mut self, chain: &[String]) -> Self {
        if let Self::Pending { chain: own, .. } = &mut self {
            own.splice(0..0, chain.iter().cloned());
        }
        self
    }

    fn text(&self) -> &str {
        match self {
            Self::Final(text) | Self::Pending { text, .. } => text,
        }
    }
}

/// One expansion in progress: an environment at a nesting depth
pub struct Expansion<'a> {
    pub(crate) options: &'a EngineOptions,
    pub(crate) env: Arc<Environment>,
    pub(crate) depth: usize,
    pub(crate) passes: usize,
    state: ExpansionState,
    pub(crate) defining: Option<String>,
}

impl<'a> Expansion<'a> {
    pub fn new(options: &'a EngineOptions, env: Arc<Environment>) -> Self {
        Self {
            options,
            env,
            depth: 0,
            passes: 0,
            state: ExpansionState::Initializing,
            defining: None,
        }
    }

    pub fn state(&self) -> ExpansionState {
        self.state
    }

    fn transition(&mut self, state: ExpansionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, depth = self.depth, "expansion state");
            self.state = state;
        }
    }

    /// A nested expansion one level deeper, in `env`
    pub(crate) fn nested(&self, env: Arc<Environment>, offset: usize) -> MacroResult<Expansion<'a>> {
        if self.depth + 1 > self.options.max_depth {
            return Err(MacroError::cycle(
                format!("macro nesting exceeds the maximum depth of {}", self.options.max_depth),
                offset,
            ));
        }
        Ok(Expansion {
            options: self.options,
            env,
            depth: self.depth + 1,
            passes: 0,
            state: ExpansionState::Initializing,
            defining: self.defining.clone(),
        })
    }

    /// Evaluate expression text in this expansion's environment
    pub(crate) fn evaluate(&mut self, text: &str, origin: Origin) -> MacroResult<MacroValue> {
        let env = Arc::clone(&self.env);
        let defining = self.defining.clone();
        Evaluator::new(env, self)
            .defining(defining.as_deref())
            .eval_text(text, origin)
    }

    pub(crate) fn evaluate_expr(&mut self, expr: &Expr) -> MacroResult<MacroValue> {
        let env = Arc::clone(&self.env);
        let defining = self.defining.clone();
        Evaluator::new(env, self).defining(defining.as_deref()).evaluate(expr)
    }

    /// Value of an operator argument; lambdas capture the current environment
    pub(crate) fn argument_value(&mut self, argument: &Argument) -> MacroResult<MacroValue> {
        match argument {
            Argument::Expr { text, origin } => self.evaluate(text, *origin),
            Argument::Lambda { params, body, origin } => Ok(MacroValue::Lambda(Arc::new(Lambda {
                params: params.clone(),
                body: body.clone(),
                origin: *origin,
                scope: Arc::clone(&self.env),
            }))),
        }
    }

    /// Render template text to a fixed point
    pub fn render_unit(&mut self, text: &str, origin: Origin, context: RenderContext) -> MacroResult<String> {
        self.render_pieces(Piece::from_text(text.to_string(), origin, context), None)
    }

    /// Render text rewritten from template text; `map` leads offsets back to the template
    pub(crate) fn render_rewritten(
        &mut self,
        text: &str,
        origin: Origin,
        map: &OffsetMap,
        context: RenderContext,
    ) -> MacroResult<String> {
        self.render_pieces(Piece::from_text(text.to_string(), origin, context), Some(map))
    }

    fn render_pieces(&mut self, first: Piece, mut map: Option<&OffsetMap>) -> MacroResult<String> {
        let mut pieces = vec![first];
        let mut pass = 0;

        loop {
            let Some(pending_at) = pieces.iter().find_map(|p| match p {
                Piece::Pending { origin, .. } => Some(origin.locate(0)),
                Piece::Final(_) => None,
            }) else {
                break;
            };

            if self.depth + pass > self.options.max_depth {
                self.transition(ExpansionState::Failed);
                return Err(MacroError::cycle(
                    format!(
                        "expansion did not reach a fixed point within {} passes",
                        self.options.max_depth
                    ),
                    pending_at,
                ));
            }
            if pass > 0 {
                self.transition(ExpansionState::Rescanning);
            }
            pass += 1;
            self.passes += 1;

            let mut next = Vec::with_capacity(pieces.len());
            let mut pending_bytes = 0usize;
            for piece in pieces {
                match piece {
                    Piece::Final(text) => next.push(Piece::Final(text)),
                    Piece::Pending { text, origin, context, chain } => {
                        for produced in self.expand_once(&text, origin, context, &chain, map)? {
                            if let Piece::Pending { text, origin, .. } = &produced {
                                pending_bytes += text.len();
                                if pending_bytes > MAX_PENDING_BYTES {
                                    self.transition(ExpansionState::Failed);
                                    return Err(MacroError::cycle(
                                        format!("expansion grew past {} bytes of pending text", MAX_PENDING_BYTES),
                                        origin.locate(0),
                                    ));
                                }
                            }
                            next.push(produced);
                        }
                    }
                }
            }
            map = None;
            pieces = next;
        }

        Ok(pieces.iter().map(Piece::text).collect())
    }

    /// One scanning pass over `text`
    fn expand_once(
        &mut self,
        text: &str,
        origin: Origin,
        context: RenderContext,
        chain: &[String],
        map: Option<&OffsetMap>,
    ) -> MacroResult<Vec<Piece>> {
        if self.state != ExpansionState::Rescanning {
            self.transition(ExpansionState::Scanning);
        }
        let options = self.options;
        let segments = match map {
            Some(map) => {
                let segments = scan(text, origin).map_err(|e| e.relocated(|at| map.locate(origin, at)))?;
                map.remap_segments(origin, segments)
            }
            None => scan(text, origin)?,
        };
        let segments = resolve_clauses(segments, &options.clauses, |arg, origin| self.evaluate(arg, origin))?;

        self.transition(ExpansionState::Substituting);
        let mut pieces = Vec::with_capacity(segments.len());
        let mut emitted = String::new();

        for segment in segments {
            let piece = match segment {
                Segment::Literal { text, .. } => Piece::Final(text),
                Segment::Macro(token) => {
                    trace!(name = %token.name, offset = token.offset, "substituting macro");
                    let local_context = detect_context(&emitted, context);
                    match (&token.kind, &token.args) {
                        (TokenKind::Variable, _) => {
                            self.substitute_variable(&token.name, token.offset, local_context, chain)?
                        }
                        (TokenKind::Operator(op), Some(args)) => {
                            self.operator_text(*op, args, token.offset, local_context)?.descend(chain)
                        }
                        (TokenKind::Operator(op), None) => {
                            return Err(MacroError::syntax(
                                format!("@{} requires an argument list", op.name()),
                                token.offset,
                            ))
                        }
                    }
                }
            };
            emitted.push_str(piece.text());
            pieces.push(piece);
        }

        Ok(pieces)
    }

    fn substitute_variable(
        &mut self,
        name: &str,
        offset: usize,
        context: RenderContext,
        chain: &[String],
    ) -> MacroResult<Piece> {
        let key = name.to_ascii_lowercase();
        if chain.contains(&key) {
            return Err(MacroError::cycle(
                format!("@{} expands to a reference to itself", name),
                offset,
            ));
        }
        let value = self.env.lookup(name, offset)?;
        match value {
            MacroValue::Sql(SqlFragment { text, verbatim: false }) => {
                let mut within = chain.to_vec();
                within.push(key);
                Ok(Piece::from_text(text.clone(), Origin::Expanded { at: offset }, context).descend(&within))
            }
            other => Ok(Piece::Final(other.to_sql(offset)?)),
        }
    }

    /// Run `@DEF` statements against the root environment
    fn define_all(&mut self, definitions: &[crate::template::DefStatement]) -> MacroResult<()> {
        for definition in definitions {
            self.defining = Some(definition.name.clone());
            let value = self.argument_value(&definition.value)?;
            self.defining = None;

            debug!(name = %definition.name, kind = value.type_name(), "defined macro variable");
            Arc::make_mut(&mut self.env).define(&definition.name, value, definition.offset)?;
        }
        Ok(())
    }
}

impl MacroHost for Expansion<'_> {
    fn call_operator(&mut self, op: Operator, args: &ArgText, offset: usize) -> MacroResult<MacroValue> {
        self.operator_value(op, args, offset)
    }

    fn expand_fragment(&mut self, text: &str, origin: Origin) -> MacroResult<String> {
        let env = Arc::clone(&self.env);
        let mut nested = self.nested(env, origin.locate(0))?;
        let rendered = nested.render_unit(text, origin, RenderContext::Other)?;
        self.passes += nested.passes;
        Ok(rendered)
    }
}

/// The macro expansion engine
#[derive(Debug, Clone, Default)]
pub struct Engine {
    options: EngineOptions,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Render a query template: `@DEF` statements followed by SQL
    pub fn render(&self, text: &str, interval: &IntervalContext) -> MacroResult<RenderResult> {
        self.render_template(text, TemplateLayout::Query, interval)
    }

    /// Render a model template: metadata header, `@DEF` statements, SQL
    pub fn render_model(&self, text: &str, interval: &IntervalContext) -> MacroResult<RenderResult> {
        self.render_template(text, TemplateLayout::Model, interval)
    }

    pub fn render_template(
        &self,
        text: &str,
        layout: TemplateLayout,
        interval: &IntervalContext,
    ) -> MacroResult<RenderResult> {
        debug!(?layout, bytes = text.len(), "render start");
        let result = self.render_inner(text, layout, interval);
        match &result {
            Ok(rendered) => debug!(passes = rendered.passes, bytes = rendered.sql.len(), "render done"),
            Err(err) => debug!(error = %err, offset = err.offset(), "render failed"),
        }
        result
    }

    fn render_inner(
        &self,
        text: &str,
        layout: TemplateLayout,
        interval: &IntervalContext,
    ) -> MacroResult<RenderResult> {
        let template = parse_template(text, layout)?;

        let mut env = Environment::with_interval(interval);
        for (name, value) in &self.options.variables {
            env.define(name, value.clone(), 0)?;
        }
        for (name, snippet) in &self.options.snippets {
            env.define(name, MacroValue::sql(snippet.clone()), 0)?;
        }

        let mut expansion = Expansion::new(&self.options, Arc::new(env));
        let sql = expansion
            .define_all(&template.definitions)
            .and_then(|_| expansion.render_unit(&template.body, template.body_origin(), RenderContext::Other));

        let sql = match sql {
            Ok(sql) => sql,
            Err(err) => {
                expansion.transition(ExpansionState::Failed);
                return Err(err);
            }
        };
        expansion.transition(ExpansionState::Done);

        Ok(RenderResult {
            fingerprint: fingerprint(&sql),
            sql,
            metadata: template.metadata,
            definitions: template.definitions.into_iter().map(|d| d.name).collect(),
            passes: expansion.passes,
            state: expansion.state(),
        })
    }

    /// Read and render a template file
    pub fn render_file(
        &self,
        path: &Path,
        layout: TemplateLayout,
        interval: &IntervalContext,
    ) -> Result<RenderResult, RenderFileError> {
        let template = std::fs::read_to_string(path).map_err(|source| RenderFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        self.render_template(&template, layout, interval)
            .map_err(|source| RenderFileError::Macro {
                path: path.to_path_buf(),
                template,
                source,
            })
    }
}

fn fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineOptionsBuilder;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    fn interval() -> IntervalContext {
        IntervalContext::parse("2023-01-01", Some("2023-01-02"), None).unwrap()
    }

    fn render(text: &str) -> MacroResult<String> {
        Engine::default().render(text, &interval()).map(|r| r.sql)
    }

    #[test]
    fn plain_sql_is_unchanged() {
        let sql = "SELECT a, 'x@y' FROM t -- @nothing\nWHERE b = 1;";
        assert_eq!(render(sql).unwrap(), sql);
    }

    #[test]
    fn interval_variables() {
        assert_eq!(
            render("SELECT * FROM t WHERE ds BETWEEN @start_ds AND @end_ds").unwrap(),
            "SELECT * FROM t WHERE ds BETWEEN '2023-01-01' AND '2023-01-02'"
        );
        assert_eq!(render("SELECT @start_epoch").unwrap(), "SELECT 1672531200");
        assert_eq!(render("SELECT @start_date").unwrap(), "SELECT DATE '2023-01-01'");
    }

    #[test]
    fn definitions_feed_later_definitions() {
        let sql = "@DEF(size, 1);\n@DEF(double, @size * 2);\nSELECT @double";
        assert_eq!(render(sql).unwrap(), "SELECT 2");
    }

    #[test]
    fn snippets_are_rescanned() {
        let engine = Engine::new(
            EngineOptionsBuilder::new()
                .var("region", "eu")
                .snippet("in_region", "region = @region")
                .build(),
        );
        let result = engine.render("SELECT * FROM t WHERE @in_region", &interval()).unwrap();

        assert_eq!(result.sql, "SELECT * FROM t WHERE region = 'eu'");
        assert_eq!(result.passes, 2);
        assert_eq!(result.state, ExpansionState::Done);
    }

    #[test]
    fn mutually_recursive_snippets_are_a_cycle() {
        let engine = Engine::new(
            EngineOptionsBuilder::new()
                .max_depth(5)
                .snippet("a", "@b")
                .snippet("b", "@a")
                .build(),
        );
        let err = engine.render("SELECT @a", &interval()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(err.offset(), 7);
    }

    #[test]
    fn doubling_snippet_fails_fast_at_default_depth() {
        let engine = Engine::new(EngineOptionsBuilder::new().snippet("a", "@a @a").build());
        let started = std::time::Instant::now();
        let err = engine.render("SELECT @a", &interval()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(err.offset(), 7);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn repeated_snippet_outside_its_own_expansion_is_fine() {
        let engine = Engine::new(
            EngineOptionsBuilder::new()
                .snippet("pair", "@one, @one")
                .snippet("one", "1")
                .build(),
        );
        assert_eq!(engine.render("SELECT @pair, @pair", &interval()).unwrap().sql, "SELECT 1, 1, 1, 1");
    }

    #[test]
    fn external_variable_colliding_with_interval_name() {
        let engine = Engine::new(EngineOptionsBuilder::new().var("start_ds", "x").build());
        let err = engine.render("SELECT 1", &interval()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Redefinition);
    }

    #[test]
    fn def_in_body_is_syntax_error() {
        let err = render("SELECT 1; @DEF(a, 1);").unwrap_err();
        assert_eq!(err, MacroError::syntax("@DEF is only allowed before the query body", 10));
    }

    #[test]
    fn result_reports_definitions_and_fingerprint() {
        let result = Engine::default()
            .render("@DEF(a, 1);\n@DEF(b, 2);\nSELECT @a + @b", &interval())
            .unwrap();

        assert_eq!(result.sql, "SELECT 1 + 2");
        assert_eq!(result.definitions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(result.fingerprint, fingerprint("SELECT 1 + 2"));
        assert_eq!(result.fingerprint.len(), 64);
    }

    #[test]
    fn render_file_wraps_io_errors() {
        let err = Engine::default()
            .render_file(Path::new("/nonexistent/model.sql"), TemplateLayout::Model, &interval())
            .unwrap_err();
        assert!(matches!(err, RenderFileError::Io { .. }));
    }
}
