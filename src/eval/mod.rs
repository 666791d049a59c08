//! Script Evaluation System
//!
//! A tree-walking interpreter for the script AST in [`crate::ast`]. The
//! evaluator is single-threaded per script run; concurrency only enters
//! through tool calls and the LLM client.
//!
//! # Core Components
//!
//! ## Evaluator
//! Entry point that runs top-level statements and named procedures
//! ([`evaluator::Evaluator`]).
//!
//! ## Statement Evaluator
//! Executes statements and drives control flow: `Returning` is reported as
//! [`statement::ControlFlow::Return`], `Erroring` is the `Err` side of
//! [`evaluator::EvalResult`], and `on_error` handlers are installed per block.
//!
//! ## Expression Evaluator
//! Evaluates literals, variables, element access, operators and calls. Call
//! targets are classified as tools (`tool.` prefix), the reserved `LLM`
//! target, the built-ins `len`/`sum`/`avg`, or user procedures.
//!
//! ## Execution Context
//! Per-invocation variable scope, error-handler state and the last call
//! result, plus the collaborators shared by the whole run.
//!
//! ## Value
//! The dynamically typed value and every coercion rule.
//!
//! ## Placeholder
//! `{{name}}` substitution inside string literals.

pub mod context;
pub mod evaluator;
pub mod expression;
pub mod placeholder;
pub mod statement;
pub mod value;
