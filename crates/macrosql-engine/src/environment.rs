//! Variable environment
//!
//! A chain of scopes. Each scope is an insertion-ordered list of bindings;
//! child scopes snapshot their parent behind an `Arc`, so a child can shadow
//! a name but never mutate anything above it.

use crate::error::{MacroError, MacroResult};
use crate::interval::IntervalContext;
use crate::value::MacroValue;
use std::sync::Arc;

/// What created a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Interval variables, external bindings and `@DEF` statements
    Root,

    /// Parameters bound by a combinator applying a lambda
    Lambda,
}

#[derive(Debug, Clone)]
pub struct Environment {
    bindings: Vec<(String, MacroValue)>,
    parent: Option<Arc<Environment>>,
    kind: ScopeKind,
}

impl Environment {
    /// Create an empty root scope
    pub fn root() -> Self {
        Self {
            bindings: Vec::new(),
            parent: None,
            kind: ScopeKind::Root,
        }
    }

    /// Create a root scope holding the 15 interval variables
    pub fn with_interval(context: &IntervalContext) -> Self {
        Self {
            bindings: context.variables(),
            parent: None,
            kind: ScopeKind::Root,
        }
    }

    /// Create a child scope of `parent`
    pub fn child(parent: &Arc<Environment>, kind: ScopeKind) -> Self {
        Self {
            bindings: Vec::new(),
            parent: Some(Arc::clone(parent)),
            kind,
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Bind `name` in this scope
    ///
    /// Fails with a redefinition error if the name is already bound in this
    /// scope. Names bound in parent scopes are shadowed.
    pub fn define(&mut self, name: &str, value: MacroValue, offset: usize) -> MacroResult<()> {
        let name = normalize(name);
        if self.bindings.iter().any(|(existing, _)| *existing == name) {
            return Err(MacroError::redefinition(name, offset));
        }
        self.bindings.push((name, value));
        Ok(())
    }

    /// Look up `name`, walking from this scope to the root
    pub fn lookup(&self, name: &str, offset: usize) -> MacroResult<&MacroValue> {
        let name = normalize(name);
        self.find(&name, false)
            .ok_or_else(|| MacroError::undefined(name, offset))
    }

    /// Look up `name` among lambda parameters only
    pub fn lookup_param(&self, name: &str) -> Option<&MacroValue> {
        self.find(&normalize(name), true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(&normalize(name), false).is_some()
    }

    fn find(&self, name: &str, params_only: bool) -> Option<&MacroValue> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if !params_only || current.kind == ScopeKind::Lambda {
                if let Some((_, value)) = current.bindings.iter().find(|(n, _)| n == name) {
                    return Some(value);
                }
            }
            scope = current.parent.as_deref();
        }
        None
    }

    /// Names bound in this scope, in definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(name, _)| name.as_str())
    }

    /// Populate the predefined `{start,end,latest}_{date,ds,ts,epoch,millis}` names
    pub fn derive_interval_variables(&mut self, context: &IntervalContext) -> MacroResult<()> {
        for (name, value) in context.variables() {
            self.define(&name, value, 0)?;
        }
        Ok(())
    }
}

/// Macro variable names are case-insensitive
pub(crate) fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup() {
        let mut env = Environment::root();
        env.define("size", MacroValue::int(1), 0).unwrap();

        assert_eq!(env.lookup("size", 0).unwrap(), &MacroValue::int(1));
        assert_eq!(env.lookup("SIZE", 0).unwrap(), &MacroValue::int(1));
    }

    #[test]
    fn redefinition_in_same_scope_fails() {
        let mut env = Environment::root();
        env.define("size", MacroValue::int(1), 0).unwrap();
        let err = env.define("Size", MacroValue::int(2), 12).unwrap_err();

        assert_eq!(err, MacroError::redefinition("size", 12));
    }

    #[test]
    fn child_shadows_without_mutating_parent() {
        let mut root = Environment::root();
        root.define("x", MacroValue::int(1), 0).unwrap();
        let root = Arc::new(root);

        let mut child = Environment::child(&root, ScopeKind::Lambda);
        child.define("x", MacroValue::int(2), 0).unwrap();

        assert_eq!(child.lookup("x", 0).unwrap(), &MacroValue::int(2));
        assert_eq!(root.lookup("x", 0).unwrap(), &MacroValue::int(1));
    }

    #[test]
    fn undefined_lookup_fails() {
        let env = Environment::root();
        let err = env.lookup("missing", 5).unwrap_err();
        assert_eq!(err, MacroError::undefined("missing", 5));
    }

    #[test]
    fn params_only_lookup_skips_root() {
        let mut root = Environment::root();
        root.define("x", MacroValue::int(1), 0).unwrap();
        let root = Arc::new(root);

        let mut child = Environment::child(&root, ScopeKind::Lambda);
        child.define("y", MacroValue::int(2), 0).unwrap();

        assert!(child.lookup_param("x").is_none());
        assert_eq!(child.lookup_param("y"), Some(&MacroValue::int(2)));
    }

    #[test]
    fn interval_variables_are_in_root() {
        let context = IntervalContext::parse("2023-01-01", None, None).unwrap();
        let env = Environment::with_interval(&context);

        assert_eq!(env.names().count(), 15);
        assert_eq!(env.lookup("start_ds", 0).unwrap(), &MacroValue::string("2023-01-01"));
    }

    #[test]
    fn deriving_interval_twice_is_a_redefinition() {
        let context = IntervalContext::parse("2023-01-01", None, None).unwrap();
        let mut env = Environment::with_interval(&context);

        let err = env.derive_interval_variables(&context).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Redefinition);
    }
}
