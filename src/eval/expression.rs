use std::collections::HashMap;
use std::sync::Arc;

use async_recursion::async_recursion;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::evaluator::{invoke_procedure, EvalError, EvalResult};
use super::placeholder::{resolve_placeholders, ResolveMode};
use super::value::Value;
use crate::ast::{BinaryOperator, Expression, Literal, UnaryOperator};
use crate::llm::{ConversationTurn, LLMError, LLMRequestOptions};
use crate::tools::TOOL_PREFIX;

/// Reserved call target for a direct LLM prompt.
pub const LLM_CALL_TARGET: &str = "LLM";

/// How missing variables are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalMode {
    Normal,
    /// Missing variables read as nil.
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Tool,
    Llm,
    Builtin,
    Procedure,
}

fn classify_target(target: &str) -> CallKind {
    if target.starts_with(TOOL_PREFIX) {
        CallKind::Tool
    } else if target.eq_ignore_ascii_case(LLM_CALL_TARGET) {
        CallKind::Llm
    } else if matches!(target, "len" | "sum" | "avg") {
        CallKind::Builtin
    } else {
        CallKind::Procedure
    }
}

enum NumericPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

#[derive(Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub async fn eval_expression(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        self.eval_with_mode(expr, context, EvalMode::Normal).await
    }

    /// Evaluates a condition and applies truthiness. Missing variables are
    /// treated as nil instead of failing the whole condition, and operand
    /// errors make the condition false. Failures raised by calls still
    /// propagate.
    pub async fn eval_condition(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<bool> {
        match self.eval_with_mode(expr, context, EvalMode::Condition).await {
            Ok(value) => Ok(value.is_truthy()),
            Err(e) if is_operand_error(&e) => {
                warn!(condition = %expr, error = %e, "condition could not be evaluated, treating as false");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[async_recursion]
    async fn eval_with_mode(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
        mode: EvalMode,
    ) -> EvalResult<Value> {
        match expr {
            Expression::Literal(lit) => self.eval_literal(lit, &context).await,
            Expression::Variable(name) => match context.get_variable(name) {
                Err(e) if mode == EvalMode::Condition && e.is_variable_not_found() => {
                    debug!(variable = %name, "missing variable in condition read as nil");
                    Ok(Value::Null)
                }
                other => other,
            },
            Expression::LastResult => Ok(context.last_result().await),
            Expression::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(self.eval_with_mode(item, context.clone(), mode).await?);
                }
                Ok(Value::List(list))
            }
            Expression::Map(entries) => {
                let mut map = HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.eval_with_mode(value, context.clone(), mode).await?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expression::ElementAccess {
                collection,
                accessor,
            } => {
                let collection = self
                    .eval_with_mode(collection, context.clone(), mode)
                    .await?;
                let accessor = self.eval_with_mode(accessor, context, mode).await?;
                Self::access_element(collection, accessor)
            }
            Expression::Eval(inner) => {
                let value = self.eval_with_mode(inner, context.clone(), mode).await?;
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let resolved = resolve_placeholders(&text, &context, ResolveMode::Strict).await?;
                Ok(Value::String(resolved))
            }
            Expression::Call { target, arguments } => {
                let mut evaluated_args = Vec::with_capacity(arguments.len());
                for arg in arguments {
                    evaluated_args.push(self.eval_with_mode(arg, context.clone(), mode).await?);
                }
                self.call_target(target, evaluated_args, context).await
            }
            Expression::BinaryOp { op, left, right } => {
                self.eval_binary_op(op, left, right, context, mode).await
            }
            Expression::UnaryOp { op, operand } => {
                let value = self.eval_with_mode(operand, context, mode).await?;
                Self::eval_unary_op(op, value)
            }
        }
    }

    async fn eval_literal(&self, lit: &Literal, context: &ExecutionContext) -> EvalResult<Value> {
        Ok(match lit {
            Literal::Integer(i) => Value::Integer(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String { value, raw: false } => Value::String(value.clone()),
            Literal::String { value, raw: true } => Value::String(
                resolve_placeholders(value, context, ResolveMode::Lenient).await?,
            ),
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Null => Value::Null,
        })
    }

    // 要素アクセスの評価
    fn access_element(collection: Value, accessor: Value) -> EvalResult<Value> {
        if collection.is_null() {
            return Err(EvalError::NilCollection);
        }
        if accessor.is_null() {
            return Err(EvalError::NilAccessor);
        }
        match collection {
            Value::List(items) | Value::Tuple(items) => {
                let index = accessor
                    .as_integer()
                    .ok_or_else(|| EvalError::InvalidIndex(accessor.type_name().to_string()))?;
                if index < 0 || index as usize >= items.len() {
                    return Err(EvalError::IndexOutOfBounds {
                        index,
                        len: items.len(),
                    });
                }
                Ok(items.into_iter().nth(index as usize).unwrap_or_default())
            }
            Value::Map(mut map) => {
                let key = match accessor {
                    Value::String(s) => s,
                    other => {
                        let key = other.to_string();
                        debug!(
                            key = %key,
                            from = other.type_name(),
                            "map accessor stringified"
                        );
                        key
                    }
                };
                map.remove(&key).ok_or(EvalError::KeyNotFound(key))
            }
            other => Err(EvalError::NotIndexable(other.type_name().to_string())),
        }
    }

    /// Dispatches a call with already evaluated arguments. The result becomes
    /// the context's last call result.
    pub async fn call_target(
        &self,
        target: &str,
        args: Vec<Value>,
        context: Arc<ExecutionContext>,
    ) -> EvalResult<Value> {
        let result = match classify_target(target) {
            CallKind::Tool => context
                .shared
                .tools
                .call(target, args)
                .await
                .map_err(EvalError::from),
            CallKind::Llm => self.eval_llm_call(args, &context).await,
            CallKind::Builtin => match target {
                "len" => self.eval_len_function(&args),
                "sum" => self.eval_sum_function(&args),
                _ => self.eval_avg_function(&args),
            },
            CallKind::Procedure => match context.shared.procedures.get(target) {
                Some(procedure) => Box::pin(invoke_procedure(procedure, args, &context)).await,
                None => Err(EvalError::ProcedureNotFound(target.to_string())),
            },
        }
        .map_err(|e| e.in_call(target))?;
        context.set_last_result(result.clone()).await;
        Ok(result)
    }

    async fn eval_llm_call(&self, args: Vec<Value>, context: &ExecutionContext) -> EvalResult<Value> {
        if args.len() != 1 {
            return Err(EvalError::ArgMismatch {
                target: LLM_CALL_TARGET.to_string(),
                expected: "1".to_string(),
                actual: args.len(),
            });
        }
        let client = context
            .shared
            .llm
            .clone()
            .ok_or(EvalError::LLM(LLMError::NotConfigured))?;
        let prompt = args[0].to_string();
        let response = client
            .ask(&[ConversationTurn::user(prompt)], &LLMRequestOptions::default())
            .await?;
        Ok(Value::String(response.content))
    }

    // 二項演算の評価
    async fn eval_binary_op(
        &self,
        op: &BinaryOperator,
        left: &Expression,
        right: &Expression,
        context: Arc<ExecutionContext>,
        mode: EvalMode,
    ) -> EvalResult<Value> {
        match op {
            BinaryOperator::And | BinaryOperator::Or => {
                let left_val = self.eval_with_mode(left, context.clone(), mode).await?;
                let left_truthy = left_val.is_truthy();
                if *op == BinaryOperator::And && !left_truthy {
                    return Ok(Value::Boolean(false));
                }
                if *op == BinaryOperator::Or && left_truthy {
                    return Ok(Value::Boolean(true));
                }
                let right_val = self.eval_with_mode(right, context, mode).await?;
                Ok(Value::Boolean(right_val.is_truthy()))
            }
            BinaryOperator::Equal | BinaryOperator::NotEqual => {
                let left_val = self.eval_comparison_operand(left, context.clone(), mode).await?;
                let right_val = self.eval_comparison_operand(right, context, mode).await?;
                let equal = left_val.loosely_equals(&right_val);
                Ok(Value::Boolean(if *op == BinaryOperator::Equal {
                    equal
                } else {
                    !equal
                }))
            }
            _ => {
                let left_val = self.eval_with_mode(left, context.clone(), mode).await?;
                let right_val = self.eval_with_mode(right, context, mode).await?;
                match op {
                    BinaryOperator::Add => self.eval_add(op, &left_val, &right_val),
                    BinaryOperator::Subtract => self.eval_subtract(op, &left_val, &right_val),
                    BinaryOperator::Multiply => self.eval_multiply(op, &left_val, &right_val),
                    BinaryOperator::Divide => self.eval_divide(op, &left_val, &right_val),
                    BinaryOperator::Modulo => self.eval_modulo(op, &left_val, &right_val),
                    BinaryOperator::LessThan => {
                        self.compare_values(op, &left_val, &right_val, |o| o.is_lt())
                    }
                    BinaryOperator::GreaterThan => {
                        self.compare_values(op, &left_val, &right_val, |o| o.is_gt())
                    }
                    BinaryOperator::LessThanEqual => {
                        self.compare_values(op, &left_val, &right_val, |o| o.is_le())
                    }
                    BinaryOperator::GreaterThanEqual => {
                        self.compare_values(op, &left_val, &right_val, |o| o.is_ge())
                    }
                    _ => Err(EvalError::Internal(format!("unhandled operator {}", op))),
                }
            }
        }
    }

    /// `==`/`!=` operands degrade a missing variable to nil.
    async fn eval_comparison_operand(
        &self,
        expr: &Expression,
        context: Arc<ExecutionContext>,
        mode: EvalMode,
    ) -> EvalResult<Value> {
        match self.eval_with_mode(expr, context, mode).await {
            Err(e) if e.is_variable_not_found() => Ok(Value::Null),
            other => other,
        }
    }

    fn eval_unary_op(op: &UnaryOperator, value: Value) -> EvalResult<Value> {
        match op {
            UnaryOperator::Not => Ok(Value::Boolean(!value.is_truthy())),
            UnaryOperator::Negate => match value {
                Value::Integer(i) => i
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| EvalError::IntegerOverflow("-".to_string())),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::TypeMismatch {
                    operation: "-".to_string(),
                    expected: "numeric".to_string(),
                    found: other.type_name().to_string(),
                }),
            },
        }
    }

    // 以下、組み込み関数の実装

    fn eval_len_function(&self, args: &[Value]) -> EvalResult<Value> {
        if args.len() != 1 {
            return Err(EvalError::ArgMismatch {
                target: "len".to_string(),
                expected: "1".to_string(),
                actual: args.len(),
            });
        }

        match &args[0] {
            Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
            Value::List(l) | Value::Tuple(l) => Ok(Value::Integer(l.len() as i64)),
            Value::Map(m) => Ok(Value::Integer(m.len() as i64)),
            Value::Null => Ok(Value::Integer(0)),
            other => Err(EvalError::TypeMismatch {
                operation: "len".to_string(),
                expected: "string, list, or map".to_string(),
                found: other.type_name().to_string(),
            }),
        }
    }

    fn eval_sum_function(&self, args: &[Value]) -> EvalResult<Value> {
        if args.len() != 1 {
            return Err(EvalError::ArgMismatch {
                target: "sum".to_string(),
                expected: "1".to_string(),
                actual: args.len(),
            });
        }

        match &args[0] {
            Value::List(list) => {
                let mut sum_int = 0i64;
                let mut sum_float = 0.0;
                let mut using_float = false;

                for value in list {
                    match value {
                        Value::Integer(i) => {
                            if using_float {
                                sum_float += *i as f64;
                            } else {
                                sum_int = sum_int
                                    .checked_add(*i)
                                    .ok_or_else(|| EvalError::IntegerOverflow("sum".to_string()))?;
                            }
                        }
                        Value::Float(f) => {
                            if !using_float {
                                sum_float = sum_int as f64;
                                using_float = true;
                            }
                            sum_float += f;
                        }
                        other => {
                            return Err(EvalError::TypeMismatch {
                                operation: "sum".to_string(),
                                expected: "list of numbers".to_string(),
                                found: other.type_name().to_string(),
                            });
                        }
                    }
                }

                if using_float {
                    Ok(Value::Float(sum_float))
                } else {
                    Ok(Value::Integer(sum_int))
                }
            }
            other => Err(EvalError::TypeMismatch {
                operation: "sum".to_string(),
                expected: "list of numbers".to_string(),
                found: other.type_name().to_string(),
            }),
        }
    }

    fn eval_avg_function(&self, args: &[Value]) -> EvalResult<Value> {
        let sum = self
            .eval_sum_function(args)
            .map_err(|e| match e {
                EvalError::ArgMismatch {
                    expected, actual, ..
                } => EvalError::ArgMismatch {
                    target: "avg".to_string(),
                    expected,
                    actual,
                },
                other => other,
            })?;
        let len = match &args[0] {
            Value::List(list) => list.len(),
            _ => 0,
        };
        if len == 0 {
            return Err(EvalError::DivisionByZero);
        }
        match sum {
            Value::Integer(i) => Ok(Value::Float(i as f64 / len as f64)),
            Value::Float(f) => Ok(Value::Float(f / len as f64)),
            other => Err(EvalError::Internal(format!(
                "sum produced non-numeric {}",
                other.type_name()
            ))),
        }
    }

    // 二項演算子の実装

    fn numeric_pair(op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<NumericPair> {
        match (left, right) {
            (Value::Integer(l), Value::Integer(r)) => Ok(NumericPair::Ints(*l, *r)),
            (Value::Float(l), Value::Float(r)) => Ok(NumericPair::Floats(*l, *r)),
            (Value::Integer(l), Value::Float(r)) => Ok(NumericPair::Floats(*l as f64, *r)),
            (Value::Float(l), Value::Integer(r)) => Ok(NumericPair::Floats(*l, *r as f64)),
            _ => {
                let offending = if left.is_numeric() { right } else { left };
                Err(EvalError::TypeMismatch {
                    operation: op.to_string(),
                    expected: "numeric".to_string(),
                    found: offending.type_name().to_string(),
                })
            }
        }
    }

    fn eval_add(&self, op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        if let (Value::String(l), Value::String(r)) = (left, right) {
            return Ok(Value::String(l.clone() + r));
        }
        match Self::numeric_pair(op, left, right)? {
            NumericPair::Ints(l, r) => l
                .checked_add(r)
                .map(Value::Integer)
                .ok_or_else(|| EvalError::IntegerOverflow(op.to_string())),
            NumericPair::Floats(l, r) => Ok(Value::Float(l + r)),
        }
    }

    fn eval_subtract(&self, op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        match Self::numeric_pair(op, left, right)? {
            NumericPair::Ints(l, r) => l
                .checked_sub(r)
                .map(Value::Integer)
                .ok_or_else(|| EvalError::IntegerOverflow(op.to_string())),
            NumericPair::Floats(l, r) => Ok(Value::Float(l - r)),
        }
    }

    fn eval_multiply(&self, op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        match Self::numeric_pair(op, left, right)? {
            NumericPair::Ints(l, r) => l
                .checked_mul(r)
                .map(Value::Integer)
                .ok_or_else(|| EvalError::IntegerOverflow(op.to_string())),
            NumericPair::Floats(l, r) => Ok(Value::Float(l * r)),
        }
    }

    /// Integer division stays integral only when exact.
    fn eval_divide(&self, op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        match Self::numeric_pair(op, left, right)? {
            NumericPair::Ints(_, 0) => Err(EvalError::DivisionByZero),
            NumericPair::Ints(l, r) => match l.checked_rem(r) {
                Some(0) => l
                    .checked_div(r)
                    .map(Value::Integer)
                    .ok_or_else(|| EvalError::IntegerOverflow(op.to_string())),
                _ => Ok(Value::Float(l as f64 / r as f64)),
            },
            NumericPair::Floats(_, r) if r == 0.0 => Err(EvalError::DivisionByZero),
            NumericPair::Floats(l, r) => Ok(Value::Float(l / r)),
        }
    }

    fn eval_modulo(&self, op: &BinaryOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::Integer(_), Value::Integer(0)) => Err(EvalError::DivisionByZero),
            (Value::Integer(l), Value::Integer(r)) => l
                .checked_rem(*r)
                .map(Value::Integer)
                .ok_or_else(|| EvalError::IntegerOverflow(op.to_string())),
            _ => {
                let offending = if matches!(left, Value::Integer(_)) {
                    right
                } else {
                    left
                };
                Err(EvalError::TypeMismatch {
                    operation: op.to_string(),
                    expected: "int".to_string(),
                    found: offending.type_name().to_string(),
                })
            }
        }
    }

    // ヘルパーメソッド

    fn compare_values<F>(
        &self,
        op: &BinaryOperator,
        left: &Value,
        right: &Value,
        compare: F,
    ) -> EvalResult<Value>
    where
        F: Fn(std::cmp::Ordering) -> bool,
    {
        let ordering = match Self::numeric_pair(op, left, right)? {
            NumericPair::Ints(l, r) => Some(l.cmp(&r)),
            NumericPair::Floats(l, r) => l.partial_cmp(&r),
        };
        // NaN compares false both ways
        Ok(Value::Boolean(ordering.map(compare).unwrap_or(false)))
    }
}

/// Errors raised by the operands themselves. Anything from inside a call
/// arrives wrapped in `EvalError::Call` and does not match.
fn is_operand_error(error: &EvalError) -> bool {
    matches!(
        error,
        EvalError::TypeMismatch { .. }
            | EvalError::KeyNotFound(_)
            | EvalError::IndexOutOfBounds { .. }
            | EvalError::NilCollection
            | EvalError::NilAccessor
            | EvalError::InvalidIndex(_)
            | EvalError::NotIndexable(_)
            | EvalError::IntegerOverflow(_)
            | EvalError::DivisionByZero
    )
}
