use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::resolve_api_key;
use super::error::{WorkerError, WorkerResult};
use super::performance::{apply_record, calculate_cost};
use super::persistence::{
    parse_json_array, read_file, read_json_array_or_empty, write_json_pretty,
};
use super::rate_limit::WorkerRateTracker;
use super::types::{
    CostMetrics, FileContext, InstanceStatus, InteractionModel, PerformanceRecord,
    RetiredInstanceInfo, TokenUsageMetrics, WorkerDefinition, WorkerInstance,
};
use crate::config::WorkerManagerConfig;
use crate::llm::{
    estimate_tokens, mock_response, ConversationTurn, LLMClient, LLMError, LLMRequestOptions,
    LLMResponse, Role,
};

/// Effective-config key whose string value is sent as a system turn.
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";

/// Result of one stateless or instance task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub content: String,
    pub record: PerformanceRecord,
}

/// Everything guarded by the manager lock. Definitions, instances and rate
/// trackers form one consistency domain.
#[derive(Default)]
struct ManagerState {
    definitions: HashMap<String, WorkerDefinition>,
    active_instances: HashMap<String, WorkerInstance>,
    rate_trackers: HashMap<String, WorkerRateTracker>,
    retired_instances: Vec<RetiredInstanceInfo>,
    task_log: VecDeque<PerformanceRecord>,
}

impl ManagerState {
    /// Copy of a definition with the live active-instance count.
    fn definition_snapshot(&self, definition: &WorkerDefinition) -> WorkerDefinition {
        let mut snapshot = definition.clone();
        snapshot.aggregate_performance_summary.active_instances_count = self
            .rate_trackers
            .get(&definition.id)
            .map(|t| t.current_active_instances)
            .unwrap_or_else(|| self.live_instance_count(&definition.id));
        snapshot
    }

    fn sorted_definition_snapshots(&self) -> Vec<WorkerDefinition> {
        let mut snapshots: Vec<WorkerDefinition> = self
            .definitions
            .values()
            .map(|d| self.definition_snapshot(d))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    fn live_instance_count(&self, definition_id: &str) -> u64 {
        count_instances(&self.active_instances, definition_id)
    }
}

fn count_instances(instances: &HashMap<String, WorkerInstance>, definition_id: &str) -> u64 {
    instances
        .values()
        .filter(|i| i.definition_id == definition_id)
        .count() as u64
}

/// Lazily creates the tracker for a definition, seeded from the live table.
fn tracker_for<'a>(
    trackers: &'a mut HashMap<String, WorkerRateTracker>,
    instances: &HashMap<String, WorkerInstance>,
    definition_id: &str,
) -> &'a mut WorkerRateTracker {
    trackers
        .entry(definition_id.to_string())
        .or_insert_with(|| {
            debug!(definition_id, "creating rate tracker");
            WorkerRateTracker::new(
                definition_id,
                count_instances(instances, definition_id),
                Utc::now(),
            )
        })
}

fn ensure_active(definition: &WorkerDefinition) -> WorkerResult<()> {
    if !definition.is_active() {
        return Err(WorkerError::PreconditionFailed(format!(
            "worker definition {} is {}",
            definition.id, definition.status
        )));
    }
    Ok(())
}

fn ensure_supports(definition: &WorkerDefinition, model: InteractionModel) -> WorkerResult<()> {
    if !definition.supports(model) {
        return Err(WorkerError::PreconditionFailed(format!(
            "worker definition {} does not support {} interaction",
            definition.id, model
        )));
    }
    Ok(())
}

fn with_system_prompt(
    config: &HashMap<String, serde_json::Value>,
    turns: Vec<ConversationTurn>,
) -> Vec<ConversationTurn> {
    match config.get(SYSTEM_PROMPT_KEY).and_then(|v| v.as_str()) {
        Some(prompt) => {
            let mut with_system = Vec::with_capacity(turns.len() + 1);
            with_system.push(ConversationTurn::new(Role::System, prompt));
            with_system.extend(turns);
            with_system
        }
        None => turns,
    }
}

fn usage_of(turns: &[ConversationTurn], response: &LLMResponse) -> TokenUsageMetrics {
    match response.metadata.token_usage {
        Some((input, output)) => TokenUsageMetrics::new(input, output),
        None => {
            let input: String = turns.iter().map(|t| t.content.as_str()).collect();
            TokenUsageMetrics::new(estimate_tokens(&input), estimate_tokens(&response.content))
        }
    }
}

/// Inserts or replaces by instance ID. Returns true when an entry was replaced.
fn upsert_retired(log: &mut Vec<RetiredInstanceInfo>, info: RetiredInstanceInfo) -> bool {
    match log.iter_mut().find(|e| e.instance_id == info.instance_id) {
        Some(existing) => {
            *existing = info;
            true
        }
        None => {
            log.push(info);
            false
        }
    }
}

fn dedupe_retired(entries: Vec<RetiredInstanceInfo>) -> Vec<RetiredInstanceInfo> {
    let mut log = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = entry.instance_id.clone();
        if upsert_retired(&mut log, entry) {
            warn!(instance_id = %id, "duplicate retired instance entry, keeping the last one");
        }
    }
    log
}

struct PreparedCall {
    options: LLMRequestOptions,
    cost_metrics: CostMetrics,
}

/// Governs worker definitions, live instances, rate limits and performance
/// accounting.
///
/// A single reader/writer lock guards all tables. The lock is never held
/// across an LLM call: task execution admits work under the lock, releases
/// it for the call, then re-acquires it to record the outcome.
pub struct AIWorkerManager {
    sandbox_dir: PathBuf,
    llm: Option<Arc<dyn LLMClient>>,
    config: WorkerManagerConfig,
    state: RwLock<ManagerState>,
}

impl AIWorkerManager {
    /// Builds a manager from in-memory content. Blank content starts empty;
    /// nothing is read from disk here.
    pub fn new(
        sandbox_dir: impl AsRef<Path>,
        llm: Option<Arc<dyn LLMClient>>,
        initial_definitions_json: &str,
        initial_performance_json: &str,
        config: WorkerManagerConfig,
    ) -> WorkerResult<Self> {
        let sandbox_dir = sandbox_dir.as_ref();
        if sandbox_dir.as_os_str().is_empty() {
            return Err(WorkerError::Configuration(
                "sandbox directory is required".to_string(),
            ));
        }
        if llm.is_none() && !config.allow_mock_llm {
            return Err(WorkerError::Configuration(
                "an LLM client is required when mock responses are disabled".to_string(),
            ));
        }

        let definitions: Vec<WorkerDefinition> = parse_json_array(initial_definitions_json)?;
        let retired: Vec<RetiredInstanceInfo> = parse_json_array(initial_performance_json)?;

        let mut state = ManagerState {
            retired_instances: dedupe_retired(retired),
            ..Default::default()
        };
        let count = Self::install_definitions(&mut state, definitions);
        info!(
            sandbox = %sandbox_dir.display(),
            definitions = count,
            mock_llm = llm.is_none(),
            "worker manager created"
        );

        Ok(Self {
            sandbox_dir: sandbox_dir.to_path_buf(),
            llm,
            config,
            state: RwLock::new(state),
        })
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.sandbox_dir.join(&self.config.definitions_file)
    }

    pub fn performance_path(&self) -> PathBuf {
        self.sandbox_dir.join(&self.config.performance_file)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sandbox_dir.join(path)
        }
    }

    /// Replaces the definition table and rebuilds every rate tracker from
    /// the definitions' persisted summaries.
    fn install_definitions(state: &mut ManagerState, definitions: Vec<WorkerDefinition>) -> usize {
        let mut table: HashMap<String, WorkerDefinition> = HashMap::with_capacity(definitions.len());
        let mut names: HashMap<String, String> = HashMap::new();
        for mut definition in definitions {
            if definition.id.trim().is_empty() {
                definition.id = Uuid::new_v4().to_string();
                debug!(name = %definition.name, id = %definition.id, "generated definition id");
            }
            if let Some(previous) = names.insert(definition.name.clone(), definition.id.clone()) {
                if previous != definition.id {
                    warn!(name = %definition.name, "duplicate worker definition name");
                }
            }
            if table.contains_key(&definition.id) {
                warn!(id = %definition.id, "duplicate worker definition id, last one wins");
            }
            table.insert(definition.id.clone(), definition);
        }

        let now = Utc::now();
        state.rate_trackers = table
            .values()
            .map(|d| {
                (
                    d.id.clone(),
                    WorkerRateTracker::new(
                        d.id.clone(),
                        d.aggregate_performance_summary.active_instances_count,
                        now,
                    ),
                )
            })
            .collect();
        state.definitions = table;
        state.definitions.len()
    }

    #[tracing::instrument(skip(self, content), level = "debug")]
    pub async fn load_worker_definitions_from_content(&self, content: &str) -> WorkerResult<usize> {
        let definitions: Vec<WorkerDefinition> = parse_json_array(content)?;
        let mut state = self.state.write().await;
        let count = Self::install_definitions(&mut state, definitions);
        info!(definitions = count, "worker definitions loaded");
        Ok(count)
    }

    /// Loads definitions from `path`; relative paths are under the sandbox.
    pub async fn load_worker_definitions_from_file(&self, path: impl AsRef<Path>) -> WorkerResult<usize> {
        let path = self.resolve_path(path.as_ref());
        let content = read_file(&path).await?;
        self.load_worker_definitions_from_content(&content).await
    }

    /// Replaces the in-memory retired-instance log with the file's content.
    pub async fn load_performance_data_from_file(&self, path: impl AsRef<Path>) -> WorkerResult<usize> {
        let path = self.resolve_path(path.as_ref());
        let content = read_file(&path).await?;
        let entries: Vec<RetiredInstanceInfo> = parse_json_array(&content)?;
        let mut state = self.state.write().await;
        state.retired_instances = dedupe_retired(entries);
        Ok(state.retired_instances.len())
    }

    /// Writes the definitions file with current summaries.
    pub async fn save_worker_definitions(&self) -> WorkerResult<()> {
        let snapshot = self.state.read().await.sorted_definition_snapshots();
        write_json_pretty(&self.definitions_path(), &snapshot).await
    }

    async fn persist_definitions_logged(&self) {
        if let Err(e) = self.save_worker_definitions().await {
            warn!(error = %e, "failed to persist worker definitions");
        }
    }

    pub async fn add_worker_definition(&self, mut definition: WorkerDefinition) -> WorkerResult<String> {
        if definition.name.trim().is_empty() {
            return Err(WorkerError::InvalidArgument(
                "worker definition name is required".to_string(),
            ));
        }
        if definition.id.trim().is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        let id = definition.id.clone();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            if state.definitions.contains_key(&id) {
                return Err(WorkerError::InvalidArgument(format!(
                    "worker definition {} already exists",
                    id
                )));
            }
            if state.definitions.values().any(|d| d.name == definition.name) {
                warn!(name = %definition.name, "duplicate worker definition name");
            }
            definition.aggregate_performance_summary.active_instances_count = 0;
            tracker_for(&mut state.rate_trackers, &state.active_instances, &id);
            state.definitions.insert(id.clone(), definition);
        }
        info!(id = %id, "worker definition added");
        self.save_worker_definitions().await?;
        Ok(id)
    }

    /// Replaces a definition's configuration. The runtime-owned performance
    /// summary is kept.
    pub async fn update_worker_definition(&self, definition: WorkerDefinition) -> WorkerResult<()> {
        {
            let mut state = self.state.write().await;
            let existing = state
                .definitions
                .get_mut(&definition.id)
                .ok_or_else(|| WorkerError::DefinitionNotFound(definition.id.clone()))?;
            let summary = existing.aggregate_performance_summary.clone();
            *existing = definition;
            existing.aggregate_performance_summary = summary;
        }
        self.save_worker_definitions().await
    }

    pub async fn remove_worker_definition(&self, definition_id: &str) -> WorkerResult<WorkerDefinition> {
        let removed = {
            let mut state = self.state.write().await;
            if !state.definitions.contains_key(definition_id) {
                return Err(WorkerError::DefinitionNotFound(definition_id.to_string()));
            }
            let active = state.live_instance_count(definition_id);
            if active > 0 {
                return Err(WorkerError::PreconditionFailed(format!(
                    "worker definition {} has {} active instances",
                    definition_id, active
                )));
            }
            state.rate_trackers.remove(definition_id);
            state
                .definitions
                .remove(definition_id)
                .ok_or_else(|| WorkerError::DefinitionNotFound(definition_id.to_string()))?
        };
        info!(id = %definition_id, "worker definition removed");
        self.save_worker_definitions().await?;
        Ok(removed)
    }

    pub async fn get_worker_definition(&self, definition_id: &str) -> WorkerResult<WorkerDefinition> {
        let state = self.state.read().await;
        state
            .definitions
            .get(definition_id)
            .map(|d| state.definition_snapshot(d))
            .ok_or_else(|| WorkerError::DefinitionNotFound(definition_id.to_string()))
    }

    pub async fn list_worker_definitions(&self) -> Vec<WorkerDefinition> {
        self.state.read().await.sorted_definition_snapshots()
    }

    pub async fn get_worker_instance(&self, instance_id: &str) -> WorkerResult<WorkerInstance> {
        self.state
            .read()
            .await
            .active_instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| WorkerError::InstanceNotFound(instance_id.to_string()))
    }

    /// Active instances, optionally only those of one definition.
    pub async fn list_active_worker_instances(&self, definition_id: Option<&str>) -> Vec<WorkerInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<WorkerInstance> = state
            .active_instances
            .values()
            .filter(|i| definition_id.map_or(true, |id| i.definition_id == id))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    pub async fn rate_tracker(&self, definition_id: &str) -> Option<WorkerRateTracker> {
        self.state.read().await.rate_trackers.get(definition_id).cloned()
    }

    pub async fn retired_instances(&self) -> Vec<RetiredInstanceInfo> {
        self.state.read().await.retired_instances.clone()
    }

    /// Recent task records for a definition, oldest first.
    pub async fn task_records_for_definition(&self, definition_id: &str) -> Vec<PerformanceRecord> {
        self.state
            .read()
            .await
            .task_log
            .iter()
            .filter(|r| r.definition_id == definition_id)
            .cloned()
            .collect()
    }

    #[tracing::instrument(skip(self, overrides, file_contexts), level = "debug")]
    pub async fn spawn_worker_instance(
        &self,
        definition_id: &str,
        overrides: HashMap<String, serde_json::Value>,
        file_contexts: Vec<FileContext>,
    ) -> WorkerResult<WorkerInstance> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let definition = state
            .definitions
            .get_mut(definition_id)
            .ok_or_else(|| WorkerError::DefinitionNotFound(definition_id.to_string()))?;
        ensure_active(definition)?;
        ensure_supports(definition, InteractionModel::Conversational)?;

        let tracker = tracker_for(&mut state.rate_trackers, &state.active_instances, definition_id);
        tracker.check_spawn(&definition.rate_limits)?;

        let mut effective_config = definition.base_config.clone();
        effective_config.extend(overrides);
        let active_file_contexts = if file_contexts.is_empty() {
            definition.default_file_contexts.clone()
        } else {
            file_contexts
        };

        let now = Utc::now();
        let instance = WorkerInstance {
            id: Uuid::new_v4().to_string(),
            definition_id: definition_id.to_string(),
            status: InstanceStatus::Idle,
            conversation_history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            session_token_usage: TokenUsageMetrics::default(),
            effective_config,
            active_file_contexts,
            performance_records: Vec::new(),
        };

        tracker.instance_spawned();
        definition.aggregate_performance_summary.total_instances_spawned += 1;
        definition.aggregate_performance_summary.last_activity_at = Some(now);
        info!(
            instance_id = %instance.id,
            definition_id,
            active = tracker.current_active_instances,
            "worker instance spawned"
        );
        state
            .active_instances
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    /// Retires an active instance. The snapshot is appended to the
    /// performance log before the instance leaves the active table; if the
    /// append fails the instance is still removed and the error returned.
    #[tracing::instrument(skip(self, final_usage, performance_records), level = "debug")]
    pub async fn retire_worker_instance(
        &self,
        instance_id: &str,
        reason: &str,
        final_status: &str,
        final_usage: Option<TokenUsageMetrics>,
        performance_records: Vec<PerformanceRecord>,
    ) -> WorkerResult<RetiredInstanceInfo> {
        let (info, appended) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let instance = state
                .active_instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| WorkerError::InstanceNotFound(instance_id.to_string()))?;

            let final_status = match InstanceStatus::parse_retirement(final_status) {
                Some(status) => status,
                None => {
                    warn!(
                        instance_id,
                        status = final_status,
                        "unrecognized retirement status, using retired_exhausted"
                    );
                    InstanceStatus::RetiredExhausted
                }
            };

            let mut records = instance.performance_records.clone();
            records.extend(performance_records.iter().cloned());
            let info = RetiredInstanceInfo {
                instance_id: instance.id.clone(),
                definition_id: instance.definition_id.clone(),
                retirement_reason: reason.to_string(),
                final_status,
                created_at: instance.created_at,
                retired_at: Utc::now(),
                total_token_usage: final_usage.unwrap_or(instance.session_token_usage),
                performance_records: records,
            };

            let appended = self.append_retired(state, info.clone()).await;

            state.active_instances.remove(instance_id);
            let tracker = tracker_for(
                &mut state.rate_trackers,
                &state.active_instances,
                &instance.definition_id,
            );
            tracker.instance_retired();
            for record in &performance_records {
                self.record_task(state, record);
            }
            info!(
                instance_id,
                definition_id = %instance.definition_id,
                status = %final_status,
                "worker instance retired"
            );
            (info, appended)
        };

        if let Err(e) = &appended {
            error!(instance_id, error = %e, "failed to append retired instance to the performance log");
        }
        self.persist_definitions_logged().await;
        appended.map(|_| info)
    }

    /// Adds a retirement snapshot to the in-memory log and rewrites the
    /// performance file, one entry per instance ID.
    async fn append_retired(&self, state: &mut ManagerState, info: RetiredInstanceInfo) -> WorkerResult<()> {
        let id = info.instance_id.clone();
        if upsert_retired(&mut state.retired_instances, info) {
            warn!(instance_id = %id, "instance already in the performance log, replacing it");
        }

        let path = self.performance_path();
        let mut merged: Vec<RetiredInstanceInfo> = read_json_array_or_empty(&path).await?;
        {
            let known: HashSet<&str> = state
                .retired_instances
                .iter()
                .map(|e| e.instance_id.as_str())
                .collect();
            merged.retain(|e| !known.contains(e.instance_id.as_str()));
        }
        merged.extend(state.retired_instances.iter().cloned());
        write_json_pretty(&path, &merged).await?;
        state.retired_instances = merged;
        Ok(())
    }

    fn prepare_call(
        &self,
        definition: &WorkerDefinition,
        config: HashMap<String, serde_json::Value>,
    ) -> WorkerResult<PreparedCall> {
        // the mock needs no credentials
        let api_key = match self.llm {
            Some(_) => resolve_api_key(&definition.auth)?,
            None => None,
        };
        Ok(PreparedCall {
            options: LLMRequestOptions {
                provider: definition.provider.clone(),
                model: definition.model_name.clone(),
                api_key,
                config,
            },
            cost_metrics: definition.cost_metrics.clone(),
        })
    }

    async fn call_llm(
        &self,
        turns: &[ConversationTurn],
        options: &LLMRequestOptions,
    ) -> Result<LLMResponse, LLMError> {
        let Some(client) = &self.llm else {
            return Ok(mock_response(&options.model, turns));
        };
        let timeout = self.config.llm_request_timeout;
        match tokio::time::timeout(timeout, client.ask(turns, options)).await {
            Ok(result) => result,
            Err(_) => Err(LLMError::Timeout(timeout.as_millis() as u64)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_record(
        &self,
        definition_id: &str,
        instance_id: Option<&str>,
        prepared: &PreparedCall,
        turns: &[ConversationTurn],
        outcome: &Result<LLMResponse, LLMError>,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
    ) -> PerformanceRecord {
        let record = PerformanceRecord::new(definition_id, instance_id, started, ended);
        match outcome {
            Ok(response) => {
                let usage = usage_of(turns, response);
                let cost = calculate_cost(&prepared.cost_metrics, &usage);
                record.succeeded(
                    &response.content,
                    usage,
                    cost,
                    self.config.output_summary_max_chars,
                )
            }
            Err(e) => record.failed(e.to_string()),
        }
    }

    /// Rolls a finished task into the tracker, the definition summary and
    /// the bounded task log.
    fn record_task(&self, state: &mut ManagerState, record: &PerformanceRecord) {
        tracker_for(
            &mut state.rate_trackers,
            &state.active_instances,
            &record.definition_id,
        )
        .record_tokens(record.token_metrics.total(), record.end_time);
        match state.definitions.get_mut(&record.definition_id) {
            Some(definition) => apply_record(&mut definition.aggregate_performance_summary, record),
            None => warn!(
                definition_id = %record.definition_id,
                "definition removed before its task was recorded"
            ),
        }
        state.task_log.push_back(record.clone());
        while state.task_log.len() > self.config.max_task_log_records {
            state.task_log.pop_front();
        }
    }

    /// One-shot task without an instance. Only the request cap is checked
    /// up front; tokens are recorded after the call.
    #[tracing::instrument(skip(self, prompt), level = "debug")]
    pub async fn execute_stateless_task(&self, definition_id: &str, prompt: &str) -> WorkerResult<TaskOutput> {
        let started = Utc::now();
        let prepared = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let definition = state
                .definitions
                .get(definition_id)
                .ok_or_else(|| WorkerError::DefinitionNotFound(definition_id.to_string()))?;
            ensure_active(definition)?;
            ensure_supports(definition, InteractionModel::Stateless)?;
            let prepared = self.prepare_call(definition, definition.base_config.clone())?;
            tracker_for(&mut state.rate_trackers, &state.active_instances, definition_id)
                .check_and_record_usage(&definition.rate_limits, 0, Utc::now())?;
            prepared
        };

        let turns = with_system_prompt(
            &prepared.options.config,
            vec![ConversationTurn::user(prompt)],
        );
        let outcome = self.call_llm(&turns, &prepared.options).await;
        let ended = Utc::now();
        let record = self.complete_record(
            definition_id,
            None,
            &prepared,
            &turns,
            &outcome,
            started,
            ended,
        );

        {
            let mut state = self.state.write().await;
            self.record_task(&mut state, &record);
        }
        self.persist_definitions_logged().await;

        let response = outcome?;
        debug!(task_id = %record.task_id, duration_ms = record.duration_ms, "stateless task finished");
        Ok(TaskOutput {
            content: response.content,
            record,
        })
    }

    /// Runs one conversational turn on an idle instance.
    #[tracing::instrument(skip(self, prompt), level = "debug")]
    pub async fn execute_task_on_instance(&self, instance_id: &str, prompt: &str) -> WorkerResult<TaskOutput> {
        let started = Utc::now();
        let (definition_id, prepared, turns) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let instance = state
                .active_instances
                .get(instance_id)
                .ok_or_else(|| WorkerError::InstanceNotFound(instance_id.to_string()))?;
            if instance.status != InstanceStatus::Idle {
                return Err(WorkerError::PreconditionFailed(format!(
                    "worker instance {} is {}",
                    instance_id, instance.status
                )));
            }
            let definition = state
                .definitions
                .get(&instance.definition_id)
                .ok_or_else(|| WorkerError::DefinitionNotFound(instance.definition_id.clone()))?;
            ensure_active(definition)?;
            let prepared = self.prepare_call(definition, instance.effective_config.clone())?;
            let definition_id = definition.id.clone();
            tracker_for(&mut state.rate_trackers, &state.active_instances, &definition_id)
                .check_and_record_usage(&definition.rate_limits, 0, Utc::now())?;

            let instance = state
                .active_instances
                .get_mut(instance_id)
                .ok_or_else(|| WorkerError::InstanceNotFound(instance_id.to_string()))?;
            instance.status = InstanceStatus::Busy;
            instance
                .conversation_history
                .push(ConversationTurn::user(prompt));
            let turns = with_system_prompt(
                &prepared.options.config,
                instance.conversation_history.clone(),
            );
            (definition_id, prepared, turns)
        };

        let outcome = self.call_llm(&turns, &prepared.options).await;
        let ended = Utc::now();
        let record = self.complete_record(
            &definition_id,
            Some(instance_id),
            &prepared,
            &turns,
            &outcome,
            started,
            ended,
        );

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            match state.active_instances.get_mut(instance_id) {
                Some(instance) => {
                    match &outcome {
                        Ok(response) => {
                            instance
                                .conversation_history
                                .push(ConversationTurn::assistant(response.content.clone()));
                            instance.status = InstanceStatus::Idle;
                        }
                        Err(_) => instance.status = InstanceStatus::Error,
                    }
                    instance.session_token_usage.add(&record.token_metrics);
                    instance.last_activity_at = ended;
                    instance.performance_records.push(record.clone());
                }
                None => warn!(instance_id, "instance retired while its task was running"),
            }
            self.record_task(state, &record);
        }
        self.persist_definitions_logged().await;

        let response = outcome?;
        Ok(TaskOutput {
            content: response.content,
            record,
        })
    }
}
