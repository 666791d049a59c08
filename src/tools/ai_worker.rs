//! `aiworker.*` tools: the worker manager as seen from scripts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use strum::IntoEnumIterator;

use super::{ArgSpec, ArgType, Tool, ToolRegistry, ToolResult, ToolSpec};
use crate::eval::value::Value;
use crate::worker::manager::AIWorkerManager;

pub const NAMESPACE: &str = "aiworker";

const DEFAULT_RETIREMENT_STATUS: &str = "retired_by_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum WorkerOperation {
    ExecuteStatelessTask,
    SpawnInstance,
    ExecuteOnInstance,
    RetireInstance,
    ListDefinitions,
}

impl WorkerOperation {
    fn description(&self) -> &'static str {
        match self {
            WorkerOperation::ExecuteStatelessTask => {
                "Runs a one-shot prompt on a stateless-capable definition"
            }
            WorkerOperation::SpawnInstance => {
                "Spawns a conversational instance and returns its id"
            }
            WorkerOperation::ExecuteOnInstance => "Sends a prompt to an idle instance",
            WorkerOperation::RetireInstance => "Retires an instance and logs its performance",
            WorkerOperation::ListDefinitions => "Lists the known worker definitions",
        }
    }

    fn args(&self) -> Vec<ArgSpec> {
        match self {
            WorkerOperation::ExecuteStatelessTask => vec![
                ArgSpec::required("definition_id", ArgType::String),
                ArgSpec::required("prompt", ArgType::String),
            ],
            WorkerOperation::SpawnInstance => vec![
                ArgSpec::required("definition_id", ArgType::String),
                ArgSpec::optional("config_overrides", ArgType::Map),
            ],
            WorkerOperation::ExecuteOnInstance => vec![
                ArgSpec::required("instance_id", ArgType::String),
                ArgSpec::required("prompt", ArgType::String),
            ],
            WorkerOperation::RetireInstance => vec![
                ArgSpec::required("instance_id", ArgType::String),
                ArgSpec::required("reason", ArgType::String),
                ArgSpec::optional("final_status", ArgType::String),
            ],
            WorkerOperation::ListDefinitions => vec![],
        }
    }
}

pub struct AIWorkerTool {
    manager: Arc<AIWorkerManager>,
    operation: WorkerOperation,
}

impl AIWorkerTool {
    pub fn new(manager: Arc<AIWorkerManager>, operation: WorkerOperation) -> Self {
        Self { manager, operation }
    }
}

/// Arguments arrive validated, so positions and types are known.
fn string_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or_default()
}

#[async_trait]
impl Tool for AIWorkerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            namespace: NAMESPACE.to_string(),
            name: self.operation.to_string(),
            description: self.operation.description().to_string(),
            args: self.operation.args(),
        }
    }

    async fn call(&self, args: Vec<Value>) -> ToolResult<Value> {
        match self.operation {
            WorkerOperation::ExecuteStatelessTask => {
                let output = self
                    .manager
                    .execute_stateless_task(string_arg(&args, 0), string_arg(&args, 1))
                    .await?;
                Ok(Value::String(output.content))
            }
            WorkerOperation::SpawnInstance => {
                let overrides: HashMap<String, serde_json::Value> = match args.get(1) {
                    Some(Value::Map(map)) => map
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                    _ => HashMap::new(),
                };
                let instance = self
                    .manager
                    .spawn_worker_instance(string_arg(&args, 0), overrides, Vec::new())
                    .await?;
                Ok(Value::String(instance.id))
            }
            WorkerOperation::ExecuteOnInstance => {
                let output = self
                    .manager
                    .execute_task_on_instance(string_arg(&args, 0), string_arg(&args, 1))
                    .await?;
                Ok(Value::String(output.content))
            }
            WorkerOperation::RetireInstance => {
                let status = match args.get(2).and_then(Value::as_str) {
                    Some(status) => status,
                    None => DEFAULT_RETIREMENT_STATUS,
                };
                let info = self
                    .manager
                    .retire_worker_instance(
                        string_arg(&args, 0),
                        string_arg(&args, 1),
                        status,
                        None,
                        Vec::new(),
                    )
                    .await?;
                let mut result = HashMap::new();
                result.insert("instance_id".to_string(), Value::String(info.instance_id));
                result.insert(
                    "final_status".to_string(),
                    Value::String(info.final_status.to_string()),
                );
                Ok(Value::Map(result))
            }
            WorkerOperation::ListDefinitions => {
                let definitions = self
                    .manager
                    .list_worker_definitions()
                    .await
                    .into_iter()
                    .map(|d| {
                        let mut entry = HashMap::new();
                        entry.insert("id".to_string(), Value::String(d.id));
                        entry.insert("name".to_string(), Value::String(d.name));
                        entry.insert("model_name".to_string(), Value::String(d.model_name));
                        entry.insert("status".to_string(), Value::String(d.status.to_string()));
                        Value::Map(entry)
                    })
                    .collect();
                Ok(Value::List(definitions))
            }
        }
    }
}

/// Registers every `aiworker.*` tool against one manager.
pub fn register_ai_worker_tools(
    registry: &mut ToolRegistry,
    manager: Arc<AIWorkerManager>,
) -> ToolResult<()> {
    for operation in WorkerOperation::iter() {
        registry.register(Arc::new(AIWorkerTool::new(manager.clone(), operation)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerManagerConfig;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> ToolRegistry {
        let definitions = serde_json::json!([{
            "id": "writer",
            "name": "writer",
            "provider": "mock",
            "model_name": "mock-model",
            "interaction_models": ["both"],
            "rate_limits": { "max_concurrent_active_instances": 1 }
        }])
        .to_string();
        let manager = AIWorkerManager::new(
            dir.path(),
            None,
            &definitions,
            "",
            WorkerManagerConfig::default(),
        )
        .unwrap();
        let mut registry = ToolRegistry::new();
        register_ai_worker_tools(&mut registry, Arc::new(manager)).unwrap();
        registry
    }

    #[test]
    fn test_registers_all_operations() {
        let dir = TempDir::new().unwrap();
        let registry = setup(&dir);
        let names: Vec<String> = registry.specs().iter().map(|s| s.qualified_name()).collect();
        assert_eq!(
            names,
            vec![
                "aiworker.ExecuteOnInstance",
                "aiworker.ExecuteStatelessTask",
                "aiworker.ListDefinitions",
                "aiworker.RetireInstance",
                "aiworker.SpawnInstance",
            ]
        );
    }

    #[tokio::test]
    async fn test_instance_lifecycle_through_tools() {
        let dir = TempDir::new().unwrap();
        let registry = setup(&dir);
        let id = registry
            .call("tool.aiworker.SpawnInstance", vec![Value::from("writer")])
            .await
            .unwrap();

        let err = registry
            .call("tool.aiworker.SpawnInstance", vec![Value::from("writer")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let reply = registry
            .call(
                "tool.aiworker.ExecuteOnInstance",
                vec![id.clone(), Value::from("draft a title")],
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Value::from("Mock response from mock-model to: draft a title")
        );

        let retired = registry
            .call(
                "tool.aiworker.RetireInstance",
                vec![id, Value::from("finished")],
            )
            .await
            .unwrap();
        match retired {
            Value::Map(map) => {
                assert_eq!(map["final_status"], Value::from("retired_by_user"));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stateless_and_listing() {
        let dir = TempDir::new().unwrap();
        let registry = setup(&dir);
        let reply = registry
            .call(
                "aiworker.ExecuteStatelessTask",
                vec![Value::from("writer"), Value::from("hello")],
            )
            .await
            .unwrap();
        assert!(reply.as_str().unwrap().ends_with("hello"));

        let listed = registry
            .call("aiworker.ListDefinitions", vec![])
            .await
            .unwrap();
        match listed {
            Value::List(items) => assert_eq!(items.len(), 1),
            other => panic!("expected list, got {:?}", other),
        }

        let err = registry
            .call(
                "aiworker.ExecuteStatelessTask",
                vec![Value::from("nobody"), Value::from("hello")],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
