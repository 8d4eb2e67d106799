//! Safe expression subset and `{{ }}` template interpolation
//!
//! Process configs reference runtime data with template expressions:
//! conditions (`{{parsedData.totalAmount}} > 100`), interpolated prompts
//! (`Say {{x}}`), and item mappings. This module provides the whole pipeline:
//!
//! - [`parser`] - lexer and recursive-descent parser for the expression
//!   grammar (comparisons, boolean and arithmetic operators, path access,
//!   array literals, whitelisted function calls)
//! - [`eval`] - depth-limited evaluation over `serde_json::Value` with a
//!   [`VarScope`] for identifier resolution
//! - [`interpolate`] / [`evaluate`] / [`evaluate_condition`] - the public
//!   entry points used by the state container
//!
//! The language is a closed subset: no assignment, no host introspection, no
//! I/O. Anything outside the grammar or the function whitelist fails to parse
//! or evaluate.

pub mod eval;
pub mod parser;

pub use eval::{truthy, VarScope};
pub use parser::{BinaryOp, Expr};

use eval::stringify;
use serde_json::Value;
use thiserror::Error;

/// Errors from parsing or evaluating an expression
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("lex error: {0}")]
    Lex(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Ordering comparison or arithmetic hit a null/non-numeric operand.
    /// Callers map this to a classified missing-upstream-data failure.
    #[error("{0}")]
    NullOperand(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() expects {expected} argument(s), found {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression nesting exceeds {0} levels")]
    DepthExceeded(usize),
}

impl ExpressionError {
    /// Whether this failure stems from missing/null upstream data
    pub fn is_null_operand(&self) -> bool {
        matches!(self, ExpressionError::NullOperand(_))
    }
}

/// Rewrite `{{ expr }}` islands so the whole string parses as one expression
///
/// `{{parsedData.total}} > 100` becomes `(parsedData.total) > 100`. A string
/// without braces is treated as a bare expression already.
fn unwrap_templates(source: &str) -> String {
    if !source.contains("{{") {
        return source.to_string();
    }
    let mut result = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                result.push('(');
                result.push_str(after[..close].trim());
                result.push(')');
                rest = &after[close + 2..];
            }
            None => {
                // Unbalanced braces: keep the raw text, the parser will complain
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Evaluate an expression (bare or `{{ }}`-templated) to a value
pub fn evaluate(source: &str, scope: &dyn VarScope) -> Result<Value, ExpressionError> {
    let rewritten = unwrap_templates(source);
    let expr = parser::parse(&rewritten)?;
    eval::eval(&expr, scope)
}

/// Evaluate an expression and coerce the result to a boolean
pub fn evaluate_condition(source: &str, scope: &dyn VarScope) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(source, scope)?))
}

/// Replace every `{{ expr }}` occurrence in a string with its rendered value
///
/// Text outside the islands is preserved verbatim. A string that is exactly
/// one island returns the *value's* string rendering (objects/arrays as
/// JSON), which keeps `"Say {{x}}"` and `"{{payload}}"` both useful.
pub fn interpolate(source: &str, scope: &dyn VarScope) -> Result<String, ExpressionError> {
    if !source.contains("{{") {
        return Ok(source.to_string());
    }
    let mut result = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let inner = after[..close].trim();
                let expr = parser::parse(inner)?;
                let value = eval::eval(&expr, scope)?;
                result.push_str(&stringify(&value));
                rest = &after[close + 2..];
            }
            None => {
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    Ok(result)
}

/// Evaluate a string that is exactly one `{{ expr }}` island to its value,
/// preserving the value's type; everything else interpolates to a string
pub fn evaluate_or_interpolate(
    source: &str,
    scope: &dyn VarScope,
) -> Result<Value, ExpressionError> {
    let trimmed = source.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") && !inner.contains("}}") {
            let expr = parser::parse(inner.trim())?;
            return eval::eval(&expr, scope);
        }
    }
    interpolate(source, scope).map(Value::String)
}
