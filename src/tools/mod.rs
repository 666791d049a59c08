//! Tool registry consulted by the evaluator for `tool.<namespace>.<name>`
//! call targets.
//!
//! The registry is an ordinary value built once at startup and handed to
//! the evaluator through [`crate::eval::context::SharedContext`]; nothing is
//! registered through global state.

pub mod ai_worker;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::eval::value::Value;
use crate::worker::error::WorkerError;

pub const TOOL_PREFIX: &str = "tool.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Any,
    String,
    Int,
    Float,
    Number,
    Bool,
    List,
    Map,
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::Any => "any",
            ArgType::String => "string",
            ArgType::Int => "int",
            ArgType::Float => "float",
            ArgType::Number => "number",
            ArgType::Bool => "bool",
            ArgType::List => "list",
            ArgType::Map => "map",
        };
        write!(f, "{}", name)
    }
}

impl ArgType {
    /// Coerce `value` to this type, or `None` when it cannot be.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (ArgType::Any, v) => Some(v),
            (ArgType::String, v @ Value::String(_)) => Some(v),
            (ArgType::Int, v) => v.as_integer().map(Value::Integer),
            (ArgType::Float, Value::Integer(i)) => Some(Value::Float(i as f64)),
            (ArgType::Float, v @ Value::Float(_)) => Some(v),
            (ArgType::Number, v @ (Value::Integer(_) | Value::Float(_))) => Some(v),
            (ArgType::Bool, v @ Value::Boolean(_)) => Some(v),
            (ArgType::List, v @ Value::List(_)) => Some(v),
            (ArgType::Map, v @ Value::Map(_)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub arg_type: ArgType,
    pub required: bool,
}

impl ArgSpec {
    pub fn required(name: &str, arg_type: ArgType) -> Self {
        Self {
            name: name.to_string(),
            arg_type,
            required: true,
        }
    }

    pub fn optional(name: &str, arg_type: ArgType) -> Self {
        Self {
            name: name.to_string(),
            arg_type,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
}

impl ToolSpec {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Argument count mismatch for {tool}: expected {expected}, got {actual}")]
    ArgMismatch {
        tool: String,
        expected: String,
        actual: usize,
    },
    #[error("Invalid argument '{arg}' for {tool}: expected {expected}, got {actual}")]
    InvalidArgument {
        tool: String,
        arg: String,
        expected: ArgType,
        actual: String,
    },
    #[error("Tool execution failed: {0}")]
    Execution(String),
    #[error("{0}")]
    Worker(#[from] WorkerError),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::NotFound(_) => ErrorKind::NotFound,
            ToolError::AlreadyRegistered(_) => ErrorKind::InvalidArgument,
            ToolError::ArgMismatch { .. } => ErrorKind::ArgMismatch,
            ToolError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ToolError::Execution(_) => ErrorKind::Internal,
            ToolError::Worker(e) => e.kind(),
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Called with arguments already validated and coerced against `spec`.
    async fn call(&self, args: Vec<Value>) -> ToolResult<Value>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        let name = tool.spec().qualified_name();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        debug!("registering tool {}", name);
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by_key(|s| s.qualified_name());
        specs
    }

    pub fn validate_args(spec: &ToolSpec, args: Vec<Value>) -> ToolResult<Vec<Value>> {
        let required = spec.args.iter().filter(|a| a.required).count();
        if args.len() < required || args.len() > spec.args.len() {
            let expected = if required == spec.args.len() {
                required.to_string()
            } else {
                format!("{}..={}", required, spec.args.len())
            };
            return Err(ToolError::ArgMismatch {
                tool: spec.qualified_name(),
                expected,
                actual: args.len(),
            });
        }
        args.into_iter()
            .zip(spec.args.iter())
            .map(|(value, arg)| {
                let actual = value.type_name().to_string();
                arg.arg_type
                    .coerce(value)
                    .ok_or_else(|| ToolError::InvalidArgument {
                        tool: spec.qualified_name(),
                        arg: arg.name.clone(),
                        expected: arg.arg_type,
                        actual,
                    })
            })
            .collect()
    }

    /// Validates and invokes a tool. Accepts names with or without the
    /// `tool.` prefix.
    pub async fn call(&self, qualified_name: &str, args: Vec<Value>) -> ToolResult<Value> {
        let name = strip_prefix(qualified_name);
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let spec = tool.spec();
        let args = Self::validate_args(&spec, args)?;
        tool.call(args).await
    }
}

fn strip_prefix(name: &str) -> &str {
    name.strip_prefix(TOOL_PREFIX).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Concat;

    #[async_trait]
    impl Tool for Concat {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                namespace: "str".to_string(),
                name: "Concat".to_string(),
                description: "joins two strings".to_string(),
                args: vec![
                    ArgSpec::required("left", ArgType::String),
                    ArgSpec::optional("right", ArgType::String),
                ],
            }
        }

        async fn call(&self, args: Vec<Value>) -> ToolResult<Value> {
            let mut out = String::new();
            for arg in args {
                out.push_str(arg.as_str().unwrap_or_default());
            }
            Ok(Value::String(out))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Concat)).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_call_with_and_without_prefix() {
        let registry = registry();
        let args = vec![Value::from("a"), Value::from("b")];
        assert_eq!(
            registry.call("tool.str.Concat", args.clone()).await.unwrap(),
            Value::from("ab")
        );
        assert_eq!(
            registry.call("str.Concat", vec![Value::from("a")]).await.unwrap(),
            Value::from("a")
        );
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let registry = registry();
        let err = registry.call("tool.str.Concat", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgMismatch);

        let err = registry
            .call("tool.str.Concat", vec![Value::Integer(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = registry.call("tool.str.Missing", vec![]).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "str.Missing"));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        assert!(matches!(
            registry.register(Arc::new(Concat)),
            Err(ToolError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_arg_coercion() {
        assert_eq!(
            ArgType::Float.coerce(Value::Integer(2)),
            Some(Value::Float(2.0))
        );
        assert_eq!(
            ArgType::Int.coerce(Value::from("12")),
            Some(Value::Integer(12))
        );
        assert_eq!(ArgType::Bool.coerce(Value::Integer(1)), None);
    }
}
