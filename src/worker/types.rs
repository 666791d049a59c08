//! Data model of the worker manager: definitions (blueprints), live
//! instances and the performance facts recorded about them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::llm::ConversationTurn;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuthMethod {
    EnvVar,
    Inline,
    ConfigPath,
    Vault,
    #[default]
    None,
}

/// Where a definition's API key comes from. `value` is the variable name,
/// the key itself, or a path, depending on `method`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct APIKeySource {
    #[serde(default)]
    pub method: AuthMethod,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InteractionModel {
    Conversational,
    Stateless,
    Both,
}

/// Four independent caps; zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub max_requests_per_minute: u64,
    #[serde(default)]
    pub max_tokens_per_minute: u64,
    #[serde(default)]
    pub max_tokens_per_day: u64,
    #[serde(default)]
    pub max_concurrent_active_instances: u64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DefinitionStatus {
    #[default]
    Active,
    Disabled,
    Archived,
}

/// Prices per thousand tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    #[serde(default)]
    pub input_tokens_per_1k: f64,
    #[serde(default)]
    pub output_tokens_per_1k: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatePerformanceSummary {
    #[serde(default)]
    pub total_tasks_attempted: u64,
    #[serde(default)]
    pub total_tasks_succeeded: u64,
    #[serde(default)]
    pub total_tasks_failed: u64,
    #[serde(default)]
    pub average_success_rate: f64,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_instances_spawned: u64,
    /// Persisted snapshot only. Live values come from the rate tracker.
    #[serde(default)]
    pub active_instances_count: u64,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Generated at load time when empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: String,
    pub model_name: String,
    #[serde(default)]
    pub auth: APIKeySource,
    #[serde(default)]
    pub interaction_models: Vec<InteractionModel>,
    #[serde(default)]
    pub rate_limits: RateLimitPolicy,
    #[serde(default, deserialize_with = "status_or_default")]
    pub status: DefinitionStatus,
    #[serde(default)]
    pub base_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub default_file_contexts: Vec<FileContext>,
    #[serde(default)]
    pub cost_metrics: CostMetrics,
    #[serde(default)]
    pub aggregate_performance_summary: AggregatePerformanceSummary,
}

impl WorkerDefinition {
    pub fn supports(&self, model: InteractionModel) -> bool {
        self.interaction_models
            .iter()
            .any(|m| *m == model || *m == InteractionModel::Both)
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// An empty status string reads as `active`.
fn status_or_default<'de, D>(deserializer: D) -> Result<DefinitionStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(DefinitionStatus::Active),
        Some(s) => match s.to_ascii_lowercase().as_str() {
            "active" => Ok(DefinitionStatus::Active),
            "disabled" => Ok(DefinitionStatus::Disabled),
            "archived" => Ok(DefinitionStatus::Archived),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["active", "disabled", "archived"],
            )),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
    Idle,
    Busy,
    Error,
    RetiredCompleted,
    RetiredError,
    RetiredExhausted,
    RetiredByUser,
}

impl InstanceStatus {
    /// Parses a caller-supplied retirement status. Anything that is not one
    /// of the retired statuses yields `None`.
    pub fn parse_retirement(status: &str) -> Option<InstanceStatus> {
        match status.trim().to_ascii_lowercase().as_str() {
            "retired_completed" | "completed" => Some(InstanceStatus::RetiredCompleted),
            "retired_error" => Some(InstanceStatus::RetiredError),
            "retired_exhausted" | "exhausted" => Some(InstanceStatus::RetiredExhausted),
            "retired_by_user" | "by_user" => Some(InstanceStatus::RetiredByUser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageMetrics {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsageMetrics {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn add(&mut self, other: &TokenUsageMetrics) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub definition_id: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub session_token_usage: TokenUsageMetrics,
    #[serde(default)]
    pub effective_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub active_file_contexts: Vec<FileContext>,
    /// Records of tasks run on this instance, carried into retirement.
    #[serde(default)]
    pub performance_records: Vec<PerformanceRecord>,
}

/// One completed task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub task_id: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub definition_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub cost_incurred: f64,
    #[serde(default)]
    pub token_metrics: TokenUsageMetrics,
    #[serde(default)]
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// Terminal snapshot of a retired instance, as stored in the performance file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetiredInstanceInfo {
    pub instance_id: String,
    pub definition_id: String,
    pub retirement_reason: String,
    pub final_status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub retired_at: DateTime<Utc>,
    #[serde(default)]
    pub total_token_usage: TokenUsageMetrics,
    #[serde(default)]
    pub performance_records: Vec<PerformanceRecord>,
}
