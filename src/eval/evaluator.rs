use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{
    context::{ExecutionContext, SharedContext},
    statement::{ControlFlow, StatementEvaluator, StatementResult},
    value::Value,
};
use crate::ast::{Position, Procedure, Statement};
use crate::error::ErrorKind;
use crate::llm::LLMError;
use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),
    #[error("Unresolved placeholder: {{{{{0}}}}}")]
    PlaceholderUnresolved(String),
    #[error("Index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("Cannot access element of nil collection")]
    NilCollection,
    #[error("Element accessor evaluated to nil")]
    NilAccessor,
    #[error("List index must be an integer, got {0}")]
    InvalidIndex(String),
    #[error("Cannot index into {0}")]
    NotIndexable(String),
    #[error("Operator {operation} requires {expected} operands, got {found}")]
    TypeMismatch {
        operation: String,
        expected: String,
        found: String,
    },
    #[error("Integer overflow in {0}")]
    IntegerOverflow(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Argument count mismatch calling {target}: expected {expected}, got {actual}")]
    ArgMismatch {
        target: String,
        expected: String,
        actual: usize,
    },
    #[error("Must condition failed: {0}")]
    MustConditionFailed(String),
    #[error("Cannot assign to read-only variable '{0}' inside an error handler")]
    ReadOnlyViolation(String),
    #[error("clear_error used outside of an on_error handler")]
    ClearViolation,
    #[error("{message}")]
    Failed { code: i64, message: String },
    #[error("Loop exceeded the iteration limit of {0}")]
    LoopLimitExceeded(usize),
    #[error("Call depth exceeded the limit of {0}")]
    CallDepthExceeded(usize),
    #[error("{0}")]
    Tool(#[from] ToolError),
    #[error("LLM call failed: {0}")]
    LLM(#[from] LLMError),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("in call to {target}: {source}")]
    Call {
        target: String,
        source: Box<EvalError>,
    },
    #[error("at {position}: {source}")]
    At {
        position: Position,
        source: Box<EvalError>,
    },
}

pub type EvalResult<T> = Result<T, EvalError>;

pub const FAIL_DEFAULT_MESSAGE: &str = "fail statement executed";

impl EvalError {
    /// The innermost error, without call-site or position context.
    pub fn root(&self) -> &EvalError {
        match self {
            EvalError::Call { source, .. } | EvalError::At { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            EvalError::VariableNotFound(_)
            | EvalError::KeyNotFound(_)
            | EvalError::ProcedureNotFound(_)
            | EvalError::PlaceholderUnresolved(_) => ErrorKind::NotFound,
            EvalError::IndexOutOfBounds { .. } | EvalError::IntegerOverflow(_) => {
                ErrorKind::Bounds
            }
            EvalError::NilCollection
            | EvalError::InvalidIndex(_)
            | EvalError::NotIndexable(_)
            | EvalError::TypeMismatch { .. } => ErrorKind::Type,
            EvalError::NilAccessor => ErrorKind::InvalidArgument,
            EvalError::DivisionByZero => ErrorKind::DivisionByZero,
            EvalError::ArgMismatch { .. } => ErrorKind::ArgMismatch,
            EvalError::MustConditionFailed(_) => ErrorKind::MustConditionFailed,
            EvalError::ReadOnlyViolation(_) => ErrorKind::ReadOnlyViolation,
            EvalError::ClearViolation => ErrorKind::ClearViolation,
            EvalError::Failed { .. } => ErrorKind::UserFailure,
            EvalError::LoopLimitExceeded(_) | EvalError::CallDepthExceeded(_) => {
                ErrorKind::ResourceExhausted
            }
            EvalError::Tool(e) => e.kind(),
            EvalError::LLM(e) => e.kind(),
            EvalError::NotImplemented(_) => ErrorKind::NotImplemented,
            EvalError::Internal(_) => ErrorKind::Internal,
            EvalError::Call { .. } | EvalError::At { .. } => ErrorKind::Internal,
        }
    }

    /// Numeric code seen by scripts; `fail` carries its own.
    pub fn code(&self) -> i64 {
        match self.root() {
            EvalError::Failed { code, .. } => *code,
            _ => self.kind().code(),
        }
    }

    /// Human-readable message seen by scripts.
    pub fn message(&self) -> String {
        match self.root() {
            EvalError::Failed { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Attaches statement position unless a more precise one is present.
    pub fn at(self, position: Position) -> Self {
        match self {
            already @ EvalError::At { .. } => already,
            other => EvalError::At {
                position,
                source: Box::new(other),
            },
        }
    }

    pub fn in_call(self, target: &str) -> Self {
        EvalError::Call {
            target: target.to_string(),
            source: Box::new(self),
        }
    }

    pub fn is_variable_not_found(&self) -> bool {
        matches!(self, EvalError::VariableNotFound(_))
    }

    /// Script-visible representation bound by `catch`.
    pub fn to_value(&self) -> Value {
        let mut map = std::collections::HashMap::new();
        map.insert("code".to_string(), Value::Integer(self.code()));
        map.insert("message".to_string(), Value::String(self.message()));
        map.insert("kind".to_string(), Value::String(self.kind().to_string()));
        Value::Map(map)
    }
}

/// Runs a procedure body in a fresh scope forked from `caller`.
pub(crate) async fn invoke_procedure(
    procedure: &Procedure,
    args: Vec<Value>,
    caller: &ExecutionContext,
) -> EvalResult<Value> {
    let max_depth = caller.config().max_call_depth;
    if caller.call_depth() + 1 > max_depth {
        return Err(EvalError::CallDepthExceeded(max_depth));
    }

    let required = procedure.required_params.len();
    let total = required + procedure.optional_params.len();
    if args.len() < required || args.len() > total {
        let expected = if required == total {
            required.to_string()
        } else {
            format!("{}..={}", required, total)
        };
        return Err(EvalError::ArgMismatch {
            target: procedure.name.clone(),
            expected,
            actual: args.len(),
        });
    }

    let context = Arc::new(caller.fork_for_call());
    let mut args = args.into_iter();
    for name in procedure
        .required_params
        .iter()
        .chain(procedure.optional_params.iter())
    {
        context.set_variable(name, args.next().unwrap_or_default())?;
    }

    debug!(procedure = %procedure.name, depth = context.call_depth(), "invoking procedure");
    let result = StatementEvaluator::default()
        .eval_block(&procedure.body, context)
        .await?;
    Ok(match result {
        StatementResult::Control(ControlFlow::Return(value)) => value,
        _ => Value::Null,
    })
}

/// Top level entry point for script execution.
pub struct Evaluator {
    statement_evaluator: StatementEvaluator,
    shared: SharedContext,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(SharedContext::default())
    }
}

impl Evaluator {
    pub fn new(shared: SharedContext) -> Self {
        Self {
            statement_evaluator: StatementEvaluator::default(),
            shared,
        }
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    /// A fresh top-level scope.
    pub fn new_context(&self) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(self.shared.clone()))
    }

    pub async fn eval_block(
        &self,
        statements: &[Statement],
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        self.statement_evaluator
            .eval_block(statements, context)
            .await
    }

    /// Runs top-level statements and returns the returned value, or nil.
    pub async fn run_script(&self, statements: &[Statement]) -> EvalResult<Value> {
        let result = self.eval_block(statements, self.new_context()).await?;
        Ok(match result {
            StatementResult::Control(ControlFlow::Return(value)) => value,
            _ => Value::Null,
        })
    }

    /// Calls a procedure from the shared procedure table by name.
    #[tracing::instrument(skip(self, args), level = "debug")]
    pub async fn run_procedure(&self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let procedure = self
            .shared
            .procedures
            .get(name)
            .ok_or_else(|| EvalError::ProcedureNotFound(name.to_string()))?;
        let context = self.new_context();
        Box::pin(invoke_procedure(procedure, args, &context))
            .await
            .map_err(|e| e.in_call(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOperator, Expression, StatementKind};
    use crate::config::InterpreterConfig;

    fn countdown() -> Procedure {
        let n = || Expression::var("n");
        Procedure::new(
            "recurse",
            vec!["n".to_string()],
            vec![
                Statement::new(StatementKind::If {
                    condition: Expression::binary(BinaryOperator::Equal, n(), Expression::int(0)),
                    then_block: vec![Statement::ret(vec![Expression::int(0)])],
                    else_block: None,
                }),
                Statement::ret(vec![Expression::call(
                    "recurse",
                    vec![Expression::binary(
                        BinaryOperator::Subtract,
                        n(),
                        Expression::int(1),
                    )],
                )]),
            ],
        )
    }

    #[tokio::test]
    async fn test_recursion_stops_at_call_depth() {
        let procedure = countdown();
        let shared = SharedContext {
            procedures: Arc::new([(procedure.name.clone(), procedure)].into_iter().collect()),
            ..SharedContext::default()
        };
        let max_depth = InterpreterConfig::default().max_call_depth as i64;
        let evaluator = Evaluator::new(shared);

        // recurse(n) occupies n + 1 frames
        let value = evaluator
            .run_procedure("recurse", vec![Value::Integer(max_depth - 1)])
            .await
            .unwrap();
        assert_eq!(value, Value::Integer(0));

        let err = evaluator
            .run_procedure("recurse", vec![Value::Integer(max_depth)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(matches!(err.root(), EvalError::CallDepthExceeded(_)));
    }

    #[test]
    fn test_kind_and_code_see_through_context() {
        let error = EvalError::Failed {
            code: 42,
            message: "custom".to_string(),
        }
        .in_call("proc")
        .at(Position::new(3, 1));
        assert_eq!(error.kind(), ErrorKind::UserFailure);
        assert_eq!(error.code(), 42);
        assert_eq!(error.message(), "custom");
        assert!(error.to_string().starts_with("at 3:1: in call to proc"));
    }

    #[test]
    fn test_position_is_not_rewrapped() {
        let error = EvalError::DivisionByZero
            .at(Position::new(2, 5))
            .at(Position::new(1, 1));
        assert!(matches!(
            error,
            EvalError::At { position, .. } if position == Position::new(2, 5)
        ));
        assert_eq!(error.code(), ErrorKind::DivisionByZero.code());
    }
}
