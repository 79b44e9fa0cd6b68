//! Macro expansion for SQL templates
//!
//! This crate handles:
//! - Scanning templates for `@variable` and `@OPERATOR(...)` tokens
//! - `@DEF` definitions and the 15 interval variables
//! - Clause operators (`@WITH`, `@JOIN`, `@WHERE`, `@GROUP_BY`, `@HAVING`, `@ORDER_BY`)
//! - Combinators (`@EACH`, `@FILTER`, `@REDUCE`) and `@SQL`, `@IF`, `@AND`, `@OR`
//! - Rescanning expanded text to a fixed point under a depth bound
//! - Errors with template offsets, convertible to diagnostics

pub mod scanner;
pub mod value;
pub mod environment;
pub mod interval;
pub mod expression;
pub mod functions;
pub mod clause;
pub mod combinators;
pub mod template;
pub mod context;
pub mod driver;
pub mod error;

pub use clause::{ClauseDescriptor, ClauseKind, ClauseTable, RenderContext};
pub use context::{EngineOptions, EngineOptionsBuilder};
pub use driver::{Engine, Expansion, ExpansionState, RenderResult};
pub use environment::{Environment, ScopeKind};
pub use error::{ErrorKind, MacroError, MacroResult, RenderFileError};
pub use interval::{IntervalContext, IntervalError};
pub use scanner::{scan, split_arguments, Argument, Operator, Origin, Segment};
pub use template::{parse_template, ModelMetadata, ParsedTemplate, TemplateLayout};
pub use value::{Lambda, MacroValue, Scalar, SqlFragment};
