use std::collections::HashMap;

use pretty_assertions::assert_eq;
use scriptworks::{
    config::WorkerManagerConfig,
    error::ErrorKind,
    worker::{AIWorkerManager, InstanceStatus, RetiredInstanceInfo, WorkerDefinition},
};
use tempfile::TempDir;

use crate::WORKER_DEFINITIONS;

fn manager_in(dir: &TempDir, definitions: &str, performance: &str) -> AIWorkerManager {
    AIWorkerManager::new(
        dir.path(),
        None,
        definitions,
        performance,
        WorkerManagerConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_definitions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let first = manager_in(&dir, WORKER_DEFINITIONS, "");
    first
        .execute_stateless_task("summarizer", "condense the report")
        .await
        .unwrap();
    let instance = first
        .spawn_worker_instance("writer", HashMap::new(), vec![])
        .await
        .unwrap();
    first.save_worker_definitions().await.unwrap();

    // a fresh manager sees the persisted summaries, including the live count
    let second = manager_in(&dir, "", "");
    assert_eq!(
        second
            .load_worker_definitions_from_file("ai_worker_definitions.json")
            .await
            .unwrap(),
        2
    );
    let summarizer = second.get_worker_definition("summarizer").await.unwrap();
    assert_eq!(summarizer.aggregate_performance_summary.total_tasks_attempted, 1);
    assert_eq!(summarizer.aggregate_performance_summary.total_tasks_succeeded, 1);

    let writer = second.get_worker_definition("writer").await.unwrap();
    assert_eq!(writer.aggregate_performance_summary.active_instances_count, 1);
    let err = second
        .spawn_worker_instance("writer", HashMap::new(), vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);

    first
        .retire_worker_instance(&instance.id, "shutdown", "retired_completed", None, vec![])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_performance_log_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, WORKER_DEFINITIONS, "");
    let mut retired = Vec::new();
    for reason in ["first", "second"] {
        let instance = manager
            .spawn_worker_instance("writer", HashMap::new(), vec![])
            .await
            .unwrap();
        manager
            .execute_task_on_instance(&instance.id, "outline")
            .await
            .unwrap();
        retired.push(
            manager
                .retire_worker_instance(&instance.id, reason, "retired_completed", None, vec![])
                .await
                .unwrap(),
        );
    }

    let content = tokio::fs::read_to_string(manager.performance_path())
        .await
        .unwrap();
    let on_disk: Vec<RetiredInstanceInfo> = serde_json::from_str(&content).unwrap();
    assert_eq!(on_disk, retired);
    assert_eq!(on_disk[0].performance_records.len(), 1);
    assert_eq!(on_disk[0].final_status, InstanceStatus::RetiredCompleted);

    let reloaded = manager_in(&dir, WORKER_DEFINITIONS, "");
    assert_eq!(
        reloaded
            .load_performance_data_from_file(manager.performance_path())
            .await
            .unwrap(),
        2
    );
    assert_eq!(reloaded.retired_instances().await, retired);
}

#[tokio::test]
async fn test_initial_performance_content_is_deduplicated() {
    let dir = TempDir::new().unwrap();
    let entry = serde_json::json!({
        "instance_id": "abc",
        "definition_id": "writer",
        "retirement_reason": "old",
        "final_status": "retired_by_user",
        "created_at": "2025-01-01T00:00:00Z",
        "retired_at": "2025-01-01T01:00:00Z",
        "total_token_usage": { "input_tokens": 1, "output_tokens": 2 },
        "performance_records": []
    });
    let mut newer = entry.clone();
    newer["retirement_reason"] = serde_json::json!("new");
    let performance = serde_json::json!([entry, newer]).to_string();

    let manager = manager_in(&dir, WORKER_DEFINITIONS, &performance);
    let retired = manager.retired_instances().await;
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].retirement_reason, "new");
}

#[tokio::test]
async fn test_load_rejects_malformed_file_and_keeps_table() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, WORKER_DEFINITIONS, "");
    tokio::fs::write(dir.path().join("broken.json"), "[{ not json")
        .await
        .unwrap();
    assert!(manager
        .load_worker_definitions_from_file("broken.json")
        .await
        .is_err());
    let err = manager
        .load_worker_definitions_from_file("missing.json")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    let definitions: Vec<WorkerDefinition> = manager.list_worker_definitions().await;
    assert_eq!(definitions.len(), 2);
}
