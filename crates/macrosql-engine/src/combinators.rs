//! Functional combinators and the remaining macro operators
//!
//! Every operator has a text mode (written directly in SQL) and a value
//! mode (nested inside an expression). Lambda bodies that parse as closed
//! expressions are evaluated; any other body is template text rendered in
//! the lambda's scope.

use crate::clause::RenderContext;
use crate::driver::{Expansion, Piece};
use crate::environment::{Environment, ScopeKind};
use crate::error::{MacroError, MacroResult};
use crate::expression::{parse_expression, Expr};
use crate::scanner::{sql_events, split_arguments, ArgText, Argument, OffsetMap, Operator, SqlEvent};
use crate::value::{Lambda, MacroValue, Scalar};
use macrosql_core::DialectConfig;
use std::sync::Arc;

/// How an operator's result is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text(RenderContext),
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    And,
    Or,
}

impl Connective {
    fn parse(value: &MacroValue, offset: usize) -> MacroResult<Self> {
        match value.as_str().map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("AND") => Ok(Self::And),
            Some("OR") => Ok(Self::Or),
            _ => Err(MacroError::type_error(
                format!("connective must be 'AND' or 'OR', got {}", value.type_name()),
                offset,
            )),
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }

    /// Rendering of an empty predicate list
    fn identity(&self) -> &'static str {
        match self {
            Self::And => "TRUE",
            Self::Or => "FALSE",
        }
    }
}

impl<'a> Expansion<'a> {
    /// Expand an operator written in SQL text
    pub(crate) fn operator_text(
        &mut self,
        op: Operator,
        args: &ArgText,
        offset: usize,
        context: RenderContext,
    ) -> MacroResult<Piece> {
        let mode = Mode::Text(context);
        match op {
            Operator::If => match self.if_branch(args, offset)? {
                None => Ok(Piece::Final(String::new())),
                Some(Argument::Expr { text, origin }) => Ok(Piece::from_text(text, origin, context)),
                Some(lambda) => Err(MacroError::syntax("@IF branches cannot be lambdas", lambda.offset())),
            },
            Operator::Sql => Ok(Piece::Final(sql_literal(args))),
            Operator::Def => Err(MacroError::syntax("@DEF is only allowed before the query body", offset)),
            Operator::Clause(kind) => Err(MacroError::syntax(
                format!("@{} must be followed by its clause body", kind.operator_name()),
                offset,
            )),
            Operator::Each => {
                let rendered = self.each(args, offset, mode)?;
                Ok(Piece::Final(rendered.to_sql(offset)?))
            }
            Operator::Filter => {
                let rendered = self.filter(args, offset, mode)?;
                Ok(Piece::Final(rendered.to_sql(offset)?))
            }
            Operator::Reduce => {
                let result = self.reduce(args, offset, context)?;
                Ok(Piece::Final(result.to_sql(offset)?))
            }
            Operator::And => self.junction(Connective::And, args).map(Piece::Final),
            Operator::Or => self.junction(Connective::Or, args).map(Piece::Final),
        }
    }

    /// Evaluate an operator nested in an expression
    pub(crate) fn operator_value(&mut self, op: Operator, args: &ArgText, offset: usize) -> MacroResult<MacroValue> {
        match op {
            Operator::If => match self.if_branch(args, offset)? {
                Some(branch) => self.argument_value(&branch),
                None => Ok(MacroValue::null()),
            },
            Operator::Sql => Ok(MacroValue::verbatim(sql_literal(args))),
            Operator::Def => Err(MacroError::syntax("@DEF is only allowed before the query body", offset)),
            Operator::Clause(kind) => Err(MacroError::syntax(
                format!("@{} cannot be used inside an expression", kind.operator_name()),
                offset,
            )),
            Operator::Each => self.each(args, offset, Mode::Value),
            Operator::Filter => self.filter(args, offset, Mode::Value),
            Operator::Reduce => self.reduce(args, offset, RenderContext::Other),
            Operator::And => self.junction(Connective::And, args).map(MacroValue::verbatim),
            Operator::Or => self.junction(Connective::Or, args).map(MacroValue::verbatim),
        }
    }

    /// `@EACH(collection, binder[, joiner])`
    fn each(&mut self, args: &ArgText, offset: usize, mode: Mode) -> MacroResult<MacroValue> {
        let arguments = arity(Operator::Each, args, offset, 2, 3)?;
        let items = self.collection(&arguments[0])?;
        let binder = self.lambda_argument(&arguments[1])?;
        let joiner = match arguments.get(2) {
            Some(argument) => {
                let value = self.argument_value(argument)?;
                match value {
                    MacroValue::Scalar(Scalar::Str(joiner)) => Some(joiner),
                    other => {
                        return Err(MacroError::type_error(
                            format!("@EACH joiner must be a string, got {}", other.type_name()),
                            argument.offset(),
                        ))
                    }
                }
            }
            None => None,
        };

        let context = match mode {
            Mode::Text(context) => context,
            Mode::Value => RenderContext::Other,
        };
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            results.push(self.apply(&binder, vec![item.clone()], offset, context)?);
        }

        let Mode::Text(context) = mode else {
            return Ok(MacroValue::List(results));
        };

        let dialect = self.options.dialect;
        let mut parts = Vec::with_capacity(results.len());
        for (item, result) in items.iter().zip(&results) {
            let mut text = result.to_identifier(dialect, offset)?;
            if context == RenderContext::ColumnList && joiner.is_none() && !has_alias(&text) {
                if let Some(alias) = alias_for(item) {
                    text = format!("{} AS {}", text, dialect.quote_identifier(&alias));
                }
            }
            parts.push(text);
        }

        let separator = match (&joiner, context) {
            (Some(joiner), _) => joiner.as_str(),
            (None, RenderContext::ColumnList) => ", ",
            (None, _) => " ",
        };
        Ok(MacroValue::verbatim(parts.join(separator)))
    }

    /// `@FILTER(collection, predicate[, connective])`
    fn filter(&mut self, args: &ArgText, offset: usize, mode: Mode) -> MacroResult<MacroValue> {
        let arguments = arity(Operator::Filter, args, offset, 2, 3)?;
        let items = self.collection(&arguments[0])?;
        let predicate = self.lambda_argument(&arguments[1])?;
        let connective = match arguments.get(2) {
            Some(argument) => Connective::parse(&self.argument_value(argument)?, argument.offset())?,
            None => Connective::And,
        };

        let mut survivors = Vec::new();
        for item in items {
            let keep = self.apply(&predicate, vec![item.clone()], offset, RenderContext::Predicate)?;
            if keep.truthy(predicate.origin.locate(0))? {
                survivors.push(item);
            }
        }

        match mode {
            Mode::Value => Ok(MacroValue::List(survivors)),
            Mode::Text(_) => {
                let parts = survivors
                    .iter()
                    .map(|item| predicate_text(item, offset))
                    .collect::<MacroResult<Vec<_>>>()?;
                Ok(MacroValue::verbatim(predicate_list(parts, connective)))
            }
        }
    }

    /// `@REDUCE(collection, [seed,] binder)`
    fn reduce(&mut self, args: &ArgText, offset: usize, context: RenderContext) -> MacroResult<MacroValue> {
        let arguments = arity(Operator::Reduce, args, offset, 2, 3)?;
        let items = self.collection(&arguments[0])?;
        let binder = self.lambda_argument(&arguments[arguments.len() - 1])?;

        let mut items = items.into_iter();
        let mut accumulator = match arguments.len() {
            3 => self.argument_value(&arguments[1])?,
            _ => items.next().ok_or_else(|| {
                MacroError::evaluation("@REDUCE of an empty collection needs a seed value", offset)
            })?,
        };

        for item in items {
            accumulator = self.apply(&binder, vec![accumulator, item], offset, context)?;
        }
        Ok(accumulator)
    }

    /// `@IF(condition, then[, else])`: the argument of the chosen branch
    ///
    /// In text mode the branch is SQL text for the next pass; in value mode
    /// it is evaluated.
    fn if_branch(&mut self, args: &ArgText, offset: usize) -> MacroResult<Option<Argument>> {
        let mut arguments = arity(Operator::If, args, offset, 2, 3)?;
        let condition = self.argument_value(&arguments[0])?;
        let index = if condition.truthy(arguments[0].offset())? { 1 } else { 2 };
        Ok((index < arguments.len()).then(|| arguments.swap_remove(index)))
    }

    /// `@AND(...)` / `@OR(...)`: join non-empty predicates
    fn junction(&mut self, connective: Connective, args: &ArgText) -> MacroResult<String> {
        let mut parts = Vec::new();
        for argument in split_arguments(args)? {
            let value = self.argument_value(&argument)?;
            let values = match value {
                MacroValue::List(items) => items,
                other => vec![other],
            };
            for value in values {
                if value.is_null() {
                    continue;
                }
                parts.push(predicate_text(&value, argument.offset())?);
            }
        }
        Ok(predicate_list(parts, connective))
    }

    /// Evaluate an argument that must be a list
    fn collection(&mut self, argument: &Argument) -> MacroResult<Vec<MacroValue>> {
        match self.argument_value(argument)? {
            MacroValue::List(items) => Ok(items),
            other => Err(MacroError::type_error(
                format!("expected a list, got {}", other.type_name()),
                argument.offset(),
            )),
        }
    }

    fn lambda_argument(&mut self, argument: &Argument) -> MacroResult<Arc<Lambda>> {
        match self.argument_value(argument)? {
            MacroValue::Lambda(lambda) => Ok(lambda),
            other => Err(MacroError::type_error(
                format!("expected a lambda such as `x -> x`, got {}", other.type_name()),
                argument.offset(),
            )),
        }
    }

    /// Apply a lambda to argument values in a fresh child scope
    pub(crate) fn apply(
        &mut self,
        lambda: &Lambda,
        values: Vec<MacroValue>,
        offset: usize,
        context: RenderContext,
    ) -> MacroResult<MacroValue> {
        if lambda.params.len() != values.len() {
            return Err(MacroError::type_error(
                format!(
                    "lambda takes {} parameter(s) but was given {}",
                    lambda.params.len(),
                    values.len()
                ),
                lambda.origin.locate(0),
            ));
        }

        let mut scope = Environment::child(&lambda.scope, ScopeKind::Lambda);
        for (param, value) in lambda.params.iter().zip(&values) {
            scope.define(param, value.clone(), lambda.origin.locate(0))?;
        }

        let mut nested = self.nested(Arc::new(scope), offset)?;
        let result = match parse_expression(&lambda.body, lambda.origin) {
            Ok(expr) if expr.is_closed() => nested.evaluate_expr(&expr),
            _ => {
                let (text, map) =
                    substitute_params(&lambda.body, &lambda.params, &values, self.options.dialect, offset)?;
                nested
                    .render_rewritten(&text, lambda.origin, &map, context)
                    .map(MacroValue::verbatim)
            }
        };
        self.passes += nested.passes;
        result
    }
}

fn arity(op: Operator, args: &ArgText, offset: usize, min: usize, max: usize) -> MacroResult<Vec<Argument>> {
    let arguments = split_arguments(args)?;
    if arguments.len() < min || arguments.len() > max {
        return Err(MacroError::syntax(
            format!(
                "@{} takes {} to {} arguments, got {}",
                op.name(),
                min,
                max,
                arguments.len()
            ),
            offset,
        ));
    }
    Ok(arguments)
}

/// Argument text of `@SQL`, unquoted when it is a single string literal
fn sql_literal(args: &ArgText) -> String {
    let text = args.text.trim();
    match parse_expression(text, args.origin) {
        Ok(Expr::Literal(MacroValue::Scalar(Scalar::Str(s)))) => s,
        _ => text.to_string(),
    }
}

/// Text of a value used as a predicate: strings are raw SQL
fn predicate_text(value: &MacroValue, offset: usize) -> MacroResult<String> {
    match value {
        MacroValue::Scalar(Scalar::Str(s)) => Ok(s.clone()),
        other => other.to_sql(offset),
    }
}

/// Join predicates, parenthesizing compound ones when there is more than one
fn predicate_list(parts: Vec<String>, connective: Connective) -> String {
    let parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    match parts.len() {
        0 => connective.identity().to_string(),
        1 => parts.into_iter().collect(),
        _ => parts
            .into_iter()
            .map(|p| if p.contains(char::is_whitespace) { format!("({})", p) } else { p })
            .collect::<Vec<_>>()
            .join(&format!(" {} ", connective.keyword())),
    }
}

fn has_alias(text: &str) -> bool {
    let mut depth = 0usize;
    for event in sql_events(text) {
        match event {
            SqlEvent::Open(_) => depth += 1,
            SqlEvent::Close(_) => depth = depth.saturating_sub(1),
            SqlEvent::Word { text, .. } if depth == 0 && text.eq_ignore_ascii_case("AS") => return true,
            _ => {}
        }
    }
    false
}

/// Automatic column alias for an `@EACH` item
fn alias_for(item: &MacroValue) -> Option<String> {
    match item {
        MacroValue::Scalar(Scalar::Null) | MacroValue::List(_) | MacroValue::Mapping(_) | MacroValue::Lambda(_) => None,
        MacroValue::Sql(fragment) => Some(fragment.text.clone()),
        other => other.display_text(0).ok(),
    }
}

/// Replace bare parameter names in a fragment body with the bound values
fn substitute_params(
    body: &str,
    params: &[String],
    values: &[MacroValue],
    dialect: DialectConfig,
    offset: usize,
) -> MacroResult<(String, OffsetMap)> {
    let mut out = String::with_capacity(body.len());
    let mut map = OffsetMap::default();
    let mut last = 0;
    for event in sql_events(body) {
        let SqlEvent::Word { start, text } = event else {
            continue;
        };
        let Some(index) = params.iter().position(|p| p.eq_ignore_ascii_case(text)) else {
            continue;
        };
        out.push_str(&body[last..start]);
        let identifier = values[index].to_identifier(dialect, offset)?;
        map.replaced(out.len(), identifier.len(), start, text.len());
        out.push_str(&identifier);
        last = start + text.len();
    }
    out.push_str(&body[last..]);
    Ok((out, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineOptions;
    use crate::scanner::Origin;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    fn args(text: &str) -> ArgText {
        ArgText { text: text.to_string(), origin: Origin::Template { base: 0 } }
    }

    fn expansion(options: &EngineOptions) -> Expansion<'_> {
        Expansion::new(options, Arc::new(Environment::root()))
    }

    #[test]
    fn predicate_list_parenthesizes_compound_parts() {
        let parts = vec!["a > 1".to_string(), "flag".to_string(), "  ".to_string()];
        assert_eq!(predicate_list(parts, Connective::Or), "(a > 1) OR flag");
        assert_eq!(predicate_list(vec!["a > 1".to_string()], Connective::And), "a > 1");
        assert_eq!(predicate_list(Vec::new(), Connective::And), "TRUE");
    }

    #[test]
    fn alias_detection_ignores_nested_as() {
        assert!(has_alias("SUM(x) AS total"));
        assert!(!has_alias("CAST(x AS INT)"));
        assert!(!has_alias("'AS'"));
    }

    #[test]
    fn params_are_substituted_as_identifiers() {
        let (text, map) = substitute_params(
            "MAX(col) AS col_max",
            &["col".to_string()],
            &[MacroValue::string("price")],
            DialectConfig::BigQuery,
            0,
        )
        .unwrap();
        assert_eq!(text, "MAX(`price`) AS col_max");
        assert_eq!(map.original(text.find(')').unwrap()), 7);
    }

    #[test]
    fn sql_literal_unquotes_single_string() {
        assert_eq!(sql_literal(&args("'a = @b'")), "a = @b");
        assert_eq!(sql_literal(&args(" a = 1 ")), "a = 1");
    }

    #[test]
    fn lambda_arity_is_checked() {
        let options = EngineOptions::default();
        let mut expansion = expansion(&options);
        let err = expansion
            .operator_value(Operator::Each, &args("[1, 2], (a, b) -> a + b"), 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn value_mode_returns_lists() {
        let options = EngineOptions::default();
        let mut expansion = expansion(&options);

        let doubled = expansion
            .operator_value(Operator::Each, &args("[1, 2, 3], x -> x * 2"), 0)
            .unwrap();
        assert_eq!(
            doubled,
            MacroValue::List(vec![MacroValue::int(2), MacroValue::int(4), MacroValue::int(6)])
        );

        let kept = expansion
            .operator_value(Operator::Filter, &args("[1, 2, 3], x -> x >= 2"), 0)
            .unwrap();
        assert_eq!(kept, MacroValue::List(vec![MacroValue::int(2), MacroValue::int(3)]));
    }

    #[test]
    fn if_without_else_is_null_or_empty() {
        let options = EngineOptions::default();
        let mut expansion = expansion(&options);

        assert_eq!(
            expansion.operator_value(Operator::If, &args("False, 1"), 0).unwrap(),
            MacroValue::null()
        );
        let piece = expansion
            .operator_text(Operator::If, &args("False, LIMIT 1"), 0, RenderContext::Other)
            .unwrap();
        assert!(matches!(piece, Piece::Final(text) if text.is_empty()));
    }

    #[test]
    fn lambda_nesting_is_bounded() {
        let options = EngineOptions { max_depth: 1, ..EngineOptions::default() };
        let mut expansion = expansion(&options);
        let err = expansion
            .operator_value(Operator::Each, &args("[[1]], x -> @EACH(x, y -> y)"), 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }
}
