use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::evaluator::{EvalError, EvalResult};
use super::value::Value;
use crate::ast::ProcedureTable;
use crate::config::InterpreterConfig;
use crate::llm::LLMClient;
use crate::tools::ToolRegistry;

/// Pseudo-variable holding the error code inside an `on_error` handler.
pub const ERR_CODE: &str = "err_code";
/// Pseudo-variable holding the error message inside an `on_error` handler.
pub const ERR_MSG: &str = "err_msg";

/// Observable destination for `emit`.
pub trait OutputSink: Send + Sync {
    fn emit(&self, value: &Value);
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&self, value: &Value) {
        println!("{}", value);
    }
}

/// Collects emitted values in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    values: Mutex<Vec<Value>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<Value> {
        match self.values.lock() {
            Ok(values) => values.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.values().iter().map(|v| v.to_string()).collect()
    }
}

impl OutputSink for BufferSink {
    fn emit(&self, value: &Value) {
        match self.values.lock() {
            Ok(mut values) => values.push(value.clone()),
            Err(poisoned) => poisoned.into_inner().push(value.clone()),
        }
    }
}

/// Collaborators shared by every invocation of one interpreter.
#[derive(Clone)]
pub struct SharedContext {
    pub tools: Arc<ToolRegistry>,
    pub procedures: Arc<ProcedureTable>,
    pub sink: Arc<dyn OutputSink>,
    pub llm: Option<Arc<dyn LLMClient>>,
    pub config: InterpreterConfig,
}

impl Default for SharedContext {
    fn default() -> Self {
        Self {
            tools: Arc::new(ToolRegistry::new()),
            procedures: Arc::new(ProcedureTable::new()),
            sink: Arc::new(StdoutSink),
            llm: None,
            config: InterpreterConfig::default(),
        }
    }
}

/// 実行コンテキスト
///
/// One context exists per procedure invocation. Blocks nested inside the
/// procedure (if/while/for bodies, handlers) share its scope; loop variables
/// are restored by the statement evaluator after the loop.
pub struct ExecutionContext {
    pub shared: SharedContext,
    scope: DashMap<String, Value>,
    handler_depth: AtomicUsize,
    last_result: RwLock<Value>,
    call_depth: usize,
}

impl ExecutionContext {
    pub fn new(shared: SharedContext) -> Self {
        Self {
            shared,
            scope: DashMap::new(),
            handler_depth: AtomicUsize::new(0),
            last_result: RwLock::new(Value::Null),
            call_depth: 0,
        }
    }

    /// Fresh scope for a procedure call, sharing the collaborators.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn fork_for_call(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            scope: DashMap::new(),
            handler_depth: AtomicUsize::new(0),
            last_result: RwLock::new(Value::Null),
            call_depth: self.call_depth + 1,
        }
    }

    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.shared.config
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.scope.get(name).map(|entry| entry.value().clone())
    }

    pub fn get_variable(&self, name: &str) -> EvalResult<Value> {
        self.lookup(name)
            .ok_or_else(|| EvalError::VariableNotFound(name.to_string()))
    }

    /// Assigns in the current scope. The handler pseudo-variables are
    /// read-only while a handler runs.
    pub fn set_variable(&self, name: &str, value: Value) -> EvalResult<()> {
        if self.in_handler() && is_reserved(name) {
            return Err(EvalError::ReadOnlyViolation(name.to_string()));
        }
        self.scope.insert(name.to_string(), value);
        Ok(())
    }

    /// Puts back a binding captured before a loop or catch block.
    pub fn restore_variable(&self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.scope.insert(name.to_string(), value);
            }
            None => {
                self.scope.remove(name);
            }
        }
    }

    pub fn in_handler(&self) -> bool {
        self.handler_depth.load(Ordering::SeqCst) > 0
    }

    /// Binds `err_code`/`err_msg` and marks the context as inside a handler.
    /// Returns the previous bindings for [`ExecutionContext::exit_handler`].
    pub fn enter_handler(&self, code: i64, message: &str) -> (Option<Value>, Option<Value>) {
        let previous = (self.lookup(ERR_CODE), self.lookup(ERR_MSG));
        self.scope
            .insert(ERR_CODE.to_string(), Value::Integer(code));
        self.scope
            .insert(ERR_MSG.to_string(), Value::String(message.to_string()));
        self.handler_depth.fetch_add(1, Ordering::SeqCst);
        debug!(code, message, "entered error handler");
        previous
    }

    pub fn exit_handler(&self, previous: (Option<Value>, Option<Value>)) {
        self.handler_depth.fetch_sub(1, Ordering::SeqCst);
        self.restore_variable(ERR_CODE, previous.0);
        self.restore_variable(ERR_MSG, previous.1);
    }

    pub async fn last_result(&self) -> Value {
        self.last_result.read().await.clone()
    }

    pub async fn set_last_result(&self, value: Value) {
        *self.last_result.write().await = value;
    }

    pub fn emit(&self, value: &Value) {
        self.shared.sink.emit(value);
    }
}

fn is_reserved(name: &str) -> bool {
    name == ERR_CODE || name == ERR_MSG
}
