use std::sync::Arc;

use async_recursion::async_recursion;
use tracing::{debug, warn};

use super::{
    context::ExecutionContext,
    evaluator::{EvalError, EvalResult, FAIL_DEFAULT_MESSAGE},
    expression::ExpressionEvaluator,
    value::Value,
};
use crate::ast::{CatchClause, Expression, Statement, StatementKind};
use crate::error::ErrorKind;

/// 文の評価結果を表す型
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    /// Normal completion with the statement's value.
    Value(Value),

    /// 制御フロー
    Control(ControlFlow),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    Return(Value),
    /// Raised by `clear_error`; consumed by the handler that is running.
    ClearError,
}

enum HandlerOutcome {
    Cleared,
    Returned(Value),
    Unhandled,
}

/// 基本的なStatement評価の実装
pub struct StatementEvaluator {
    pub expression_evaluator: Arc<ExpressionEvaluator>,
}

impl Default for StatementEvaluator {
    fn default() -> Self {
        Self {
            expression_evaluator: Arc::new(ExpressionEvaluator::new()),
        }
    }
}

impl StatementEvaluator {
    pub fn new(expression_evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self {
            expression_evaluator,
        }
    }

    #[async_recursion]
    pub async fn eval_statement(
        &self,
        statement: &Statement,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        self.eval_statement_kind(&statement.kind, context)
            .await
            .map_err(|e| e.at(statement.position))
    }

    async fn eval_statement_kind(
        &self,
        kind: &StatementKind,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        match kind {
            StatementKind::Set { target, value } => {
                let value = self.eval_expression(value, context.clone()).await?;
                context.set_variable(target, value)?;
                Ok(StatementResult::Value(Value::Null))
            }
            StatementKind::Call(expr) => {
                let value = self.eval_expression(expr, context.clone()).await?;
                if !matches!(expr, Expression::Call { .. }) {
                    context.set_last_result(value.clone()).await;
                }
                Ok(StatementResult::Value(value))
            }
            StatementKind::Return(exprs) => Ok(StatementResult::Control(ControlFlow::Return(
                self.eval_return(exprs, context).await?,
            ))),
            StatementKind::Emit(expr) => {
                let value = self.eval_expression(expr, context.clone()).await?;
                context.emit(&value);
                context.set_last_result(value.clone()).await;
                Ok(StatementResult::Value(value))
            }
            StatementKind::Must(expr) => self.eval_must(expr, context).await,
            StatementKind::MustBe { check, argument } => {
                self.eval_must_be(check, argument, context).await
            }
            StatementKind::Fail(payload) => Err(self.eval_fail(payload, context).await?),
            StatementKind::If {
                condition,
                then_block,
                else_block,
            } => {
                self.eval_if(condition, then_block, else_block, context)
                    .await
            }
            StatementKind::While { condition, body } => {
                self.eval_while(condition, body, context).await
            }
            StatementKind::ForEach {
                variable,
                collection,
                body,
            } => {
                self.eval_for_each(variable, collection, body, context)
                    .await
            }
            // installed by the enclosing block
            StatementKind::OnError(_) => Ok(StatementResult::Value(Value::Null)),
            StatementKind::ClearError => {
                if context.in_handler() {
                    Ok(StatementResult::Control(ControlFlow::ClearError))
                } else {
                    Err(EvalError::ClearViolation)
                }
            }
            StatementKind::Try {
                try_block,
                catch,
                finally_block,
            } => {
                self.eval_try(try_block, catch.as_ref(), finally_block.as_deref(), context)
                    .await
            }
        }
    }

    pub async fn eval_expression(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        self.expression_evaluator
            .eval_expression(expr, context)
            .await
    }

    async fn eval_return(
        &self,
        exprs: &[Expression],
        context: Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        match exprs {
            [] => Ok(Value::Null),
            [single] => self.eval_expression(single, context).await,
            many => {
                let mut values = Vec::with_capacity(many.len());
                for expr in many {
                    values.push(self.eval_expression(expr, context.clone()).await?);
                }
                Ok(Value::Tuple(values))
            }
        }
    }

    async fn eval_must(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let value = self.eval_expression(expr, context).await?;
        if !value.is_truthy() {
            return Err(EvalError::MustConditionFailed(expr.to_string()));
        }
        Ok(StatementResult::Value(value))
    }

    /// Built-in checks first, then anything callable by that name.
    async fn eval_must_be(
        &self,
        check: &str,
        argument: &Expression,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let value = self.eval_expression(argument, context.clone()).await?;
        let passed = match Value::check(check, &value) {
            Some(passed) => passed,
            None => self
                .expression_evaluator
                .call_target(check, vec![value.clone()], context)
                .await?
                .is_truthy(),
        };
        if !passed {
            return Err(EvalError::MustConditionFailed(format!(
                "{}({})",
                check, argument
            )));
        }
        Ok(StatementResult::Value(value))
    }

    /// Builds the error raised by `fail`. Numbers become the code, anything
    /// else becomes the message.
    async fn eval_fail(
        &self,
        payload: &Option<Expression>,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<EvalError> {
        let default_code = ErrorKind::UserFailure.code();
        let Some(expr) = payload else {
            return Ok(EvalError::Failed {
                code: default_code,
                message: FAIL_DEFAULT_MESSAGE.to_string(),
            });
        };
        let value = self.eval_expression(expr, context).await?;
        let with_code = |code: i64| EvalError::Failed {
            code,
            message: format!("{} (code {})", FAIL_DEFAULT_MESSAGE, code),
        };
        Ok(match value {
            Value::Integer(code) => with_code(code),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => with_code(f as i64),
            Value::Null => EvalError::Failed {
                code: default_code,
                message: FAIL_DEFAULT_MESSAGE.to_string(),
            },
            other => EvalError::Failed {
                code: default_code,
                message: other.to_string(),
            },
        })
    }

    async fn eval_if(
        &self,
        condition: &Expression,
        then_block: &[Statement],
        else_block: &Option<Vec<Statement>>,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let condition_value = self
            .expression_evaluator
            .eval_condition(condition, context.clone())
            .await?;

        if condition_value {
            self.eval_block(then_block, context).await
        } else if let Some(else_block) = else_block {
            self.eval_block(else_block, context).await
        } else {
            Ok(StatementResult::Value(Value::Null))
        }
    }

    async fn eval_while(
        &self,
        condition: &Expression,
        body: &[Statement],
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let max_iterations = context.config().max_loop_iterations;
        let mut iterations = 0usize;
        while self
            .expression_evaluator
            .eval_condition(condition, context.clone())
            .await?
        {
            iterations += 1;
            if iterations > max_iterations {
                warn!(max_iterations, "while loop hit the iteration limit");
                return Err(EvalError::LoopLimitExceeded(max_iterations));
            }
            match self.eval_block(body, context.clone()).await? {
                StatementResult::Value(_) => {}
                control => return Ok(control),
            }
        }
        Ok(StatementResult::Value(Value::Null))
    }

    async fn eval_for_each(
        &self,
        variable: &str,
        collection: &Expression,
        body: &[Statement],
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let collection = self.eval_expression(collection, context.clone()).await?;
        let items = iteration_items(collection)?;
        let max_iterations = context.config().max_loop_iterations;
        if items.len() > max_iterations {
            warn!(
                max_iterations,
                len = items.len(),
                "for-each collection exceeds the iteration limit"
            );
            return Err(EvalError::LoopLimitExceeded(max_iterations));
        }

        let previous = context.lookup(variable);
        let outcome = self.run_iterations(variable, items, body, &context).await;
        context.restore_variable(variable, previous);
        outcome
    }

    async fn run_iterations(
        &self,
        variable: &str,
        items: Vec<Value>,
        body: &[Statement],
        context: &Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        for item in items {
            context.set_variable(variable, item)?;
            match self.eval_block(body, context.clone()).await? {
                StatementResult::Value(_) => {}
                control => return Ok(control),
            }
        }
        Ok(StatementResult::Value(Value::Null))
    }

    async fn eval_try(
        &self,
        try_block: &[Statement],
        catch: Option<&CatchClause>,
        finally_block: Option<&[Statement]>,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let outcome = match (self.eval_block(try_block, context.clone()).await, catch) {
            (Err(error), Some(catch)) => self.eval_catch(catch, error, context.clone()).await,
            (outcome, _) => outcome,
        };

        if let Some(finally_block) = finally_block {
            match self.eval_block(finally_block, context).await {
                Ok(StatementResult::Value(_)) => {}
                overriding => {
                    debug!("finally block overrides the try/catch outcome");
                    return overriding;
                }
            }
        }
        outcome
    }

    async fn eval_catch(
        &self,
        catch: &CatchClause,
        error: EvalError,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        debug!(error = %error, "caught error");
        let Some(binding) = &catch.binding else {
            return self.eval_block(&catch.statements, context).await;
        };
        let previous = context.lookup(binding);
        let outcome = match context.set_variable(binding, error.to_value()) {
            Ok(()) => self.eval_block(&catch.statements, context.clone()).await,
            Err(e) => Err(e),
        };
        context.restore_variable(binding, previous);
        outcome
    }

    /// Runs statements in order. An `on_error` statement installs its block
    /// as the handler for the rest of this block.
    #[async_recursion]
    pub async fn eval_block(
        &self,
        statements: &[Statement],
        context: Arc<ExecutionContext>,
    ) -> EvalResult<StatementResult> {
        let mut handler: Option<&[Statement]> = None;
        let mut last = Value::Null;
        for stmt in statements.iter() {
            if let StatementKind::OnError(block) = &stmt.kind {
                handler = Some(block.as_slice());
                continue;
            }
            let error = match self.eval_statement(stmt, context.clone()).await {
                Ok(StatementResult::Value(value)) => {
                    last = value;
                    continue;
                }
                Ok(control) => return Ok(control),
                Err(error) => error,
            };
            let Some(active) = handler else {
                return Err(error);
            };
            match self.run_handler(active, &error, context.clone()).await? {
                HandlerOutcome::Cleared => {
                    debug!(position = %stmt.position, "error cleared, resuming");
                    last = Value::Null;
                }
                HandlerOutcome::Returned(value) => {
                    return Ok(StatementResult::Control(ControlFlow::Return(value)))
                }
                HandlerOutcome::Unhandled => return Err(error),
            }
        }
        Ok(StatementResult::Value(last))
    }

    async fn run_handler(
        &self,
        handler: &[Statement],
        error: &EvalError,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<HandlerOutcome> {
        let previous = context.enter_handler(error.code(), &error.message());
        let result = self.eval_block(handler, context.clone()).await;
        context.exit_handler(previous);
        Ok(match result? {
            StatementResult::Control(ControlFlow::ClearError) => HandlerOutcome::Cleared,
            StatementResult::Control(ControlFlow::Return(value)) => HandlerOutcome::Returned(value),
            StatementResult::Value(_) => HandlerOutcome::Unhandled,
        })
    }
}

/// Values visited by `for each`. Maps yield their keys in sorted order;
/// strings containing a comma are split on commas, others by character.
fn iteration_items(collection: Value) -> EvalResult<Vec<Value>> {
    match collection {
        Value::List(items) | Value::Tuple(items) => Ok(items),
        Value::Map(map) => {
            let mut keys: Vec<String> = map.into_keys().collect();
            keys.sort();
            Ok(keys.into_iter().map(Value::String).collect())
        }
        Value::String(s) if s.contains(',') => Ok(s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Null => Ok(vec![]),
        other => Err(EvalError::TypeMismatch {
            operation: "for each".to_string(),
            expected: "list, map, or string".to_string(),
            found: other.type_name().to_string(),
        }),
    }
}
