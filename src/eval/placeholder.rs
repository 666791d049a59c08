//! `{{name}}` placeholder resolution against the current scope.

use std::cell::Cell;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::evaluator::{EvalError, EvalResult};
use super::value::Value;

/// Placeholder name that reads the last call result.
pub const LAST_RESULT_PLACEHOLDER: &str = "LAST";

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Unresolvable placeholders are left verbatim.
    Lenient,
    /// Unresolvable placeholders are errors.
    Strict,
}

pub fn has_placeholders(text: &str) -> bool {
    PLACEHOLDER_RE.is_match(text)
}

/// Resolves placeholders transitively: a substituted value that itself
/// contains placeholders is resolved again, up to the configured depth.
///
/// Substitutions draw on a shared byte budget. Once it runs out the
/// remaining placeholders stay verbatim, so the output is at most
/// `text.len() + max_placeholder_length` bytes.
pub async fn resolve_placeholders(
    text: &str,
    context: &ExecutionContext,
    mode: ResolveMode,
) -> EvalResult<String> {
    if !has_placeholders(text) {
        return Ok(text.to_string());
    }
    let last = context.last_result().await;
    let config = context.config();
    let lookup_fn = |name: &str| lookup(name, context, &last);
    let limits = Limits::new(config.max_placeholder_depth, config.max_placeholder_length);
    resolve_at_depth(text, &lookup_fn, mode, 0, &limits)
}

struct Limits {
    max_depth: usize,
    remaining: Cell<usize>,
    exhausted: Cell<bool>,
}

impl Limits {
    fn new(max_depth: usize, max_length: usize) -> Self {
        Self {
            max_depth,
            remaining: Cell::new(max_length),
            exhausted: Cell::new(false),
        }
    }

    /// Charges `len` bytes against the budget. False once it is spent.
    fn charge(&self, len: usize) -> bool {
        match self.remaining.get().checked_sub(len) {
            Some(rest) if !self.exhausted.get() => {
                self.remaining.set(rest);
                true
            }
            _ => {
                if !self.exhausted.replace(true) {
                    warn!(len, "placeholder output length limit reached, stopping");
                }
                false
            }
        }
    }
}

fn lookup(name: &str, context: &ExecutionContext, last: &Value) -> Option<Value> {
    match context.lookup(name) {
        Some(value) => Some(value),
        None if name == LAST_RESULT_PLACEHOLDER => Some(last.clone()),
        None => None,
    }
}

fn resolve_at_depth(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<Value>,
    mode: ResolveMode,
    depth: usize,
    limits: &Limits,
) -> EvalResult<String> {
    if depth >= limits.max_depth {
        warn!(depth, "placeholder resolution depth limit reached, stopping");
        return Ok(text.to_string());
    }

    let mut missing: Option<String> = None;
    let mut nested_error: Option<EvalError> = None;
    let resolved = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => {
                let substituted = value.to_string();
                if !limits.charge(substituted.len()) {
                    return caps[0].to_string();
                }
                if has_placeholders(&substituted) {
                    match resolve_at_depth(&substituted, lookup, mode, depth + 1, limits) {
                        Ok(s) => s,
                        Err(e) => {
                            nested_error.get_or_insert(e);
                            substituted
                        }
                    }
                } else {
                    substituted
                }
            }
            None => {
                debug!(placeholder = name, "unresolved placeholder");
                missing.get_or_insert_with(|| name.to_string());
                caps[0].to_string()
            }
        }
    });

    if mode == ResolveMode::Strict {
        if let Some(error) = nested_error {
            return Err(error);
        }
        if let Some(name) = missing {
            return Err(EvalError::PlaceholderUnresolved(name));
        }
    }
    Ok(resolved.into_owned())
}
