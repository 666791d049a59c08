use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SystemConfig {
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    #[serde(default)]
    pub worker_manager: WorkerManagerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpreterConfig {
    /// Hard ceiling on `while` and `for each` iterations.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    #[serde(default = "default_max_placeholder_depth")]
    pub max_placeholder_depth: usize,

    /// Total bytes placeholder substitution may add to one string.
    #[serde(default = "default_max_placeholder_length")]
    pub max_placeholder_length: usize,

    /// Nested procedure calls allowed before `CallDepthExceeded`.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_placeholder_depth: default_max_placeholder_depth(),
            max_placeholder_length: default_max_placeholder_length(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerManagerConfig {
    /// File name of the definitions file, relative to the sandbox directory.
    #[serde(default = "default_definitions_file")]
    pub definitions_file: String,

    /// File name of the retired-instance performance log.
    #[serde(default = "default_performance_file")]
    pub performance_file: String,

    #[serde(default = "default_llm_request_timeout", with = "duration_ms")]
    pub llm_request_timeout: Duration,

    /// Cap on in-memory task records kept for inspection.
    #[serde(default = "default_max_task_log_records")]
    pub max_task_log_records: usize,

    #[serde(default = "default_output_summary_max_chars")]
    pub output_summary_max_chars: usize,

    /// Synthesize deterministic responses when no LLM client is injected.
    #[serde(default = "default_true")]
    pub allow_mock_llm: bool,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            definitions_file: default_definitions_file(),
            performance_file: default_performance_file(),
            llm_request_timeout: default_llm_request_timeout(),
            max_task_log_records: default_max_task_log_records(),
            output_summary_max_chars: default_output_summary_max_chars(),
            allow_mock_llm: default_true(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Configuration(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Configuration(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

// デフォルト値の定義
fn default_max_loop_iterations() -> usize {
    10_000
}

fn default_max_placeholder_depth() -> usize {
    10
}

fn default_max_placeholder_length() -> usize {
    64 * 1024
}

fn default_max_call_depth() -> usize {
    32
}

fn default_definitions_file() -> String {
    "ai_worker_definitions.json".to_string()
}

fn default_performance_file() -> String {
    "ai_worker_performance_data.json".to_string()
}

fn default_llm_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_task_log_records() -> usize {
    1000
}

fn default_output_summary_max_chars() -> usize {
    256
}

fn default_true() -> bool {
    true
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: SystemConfig = from_str("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.interpreter.max_loop_iterations, 10_000);
        assert_eq!(config.interpreter.max_placeholder_depth, 10);
        assert_eq!(config.worker_manager.output_summary_max_chars, 256);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "interpreter": { "max_loop_iterations": 5 },
            "worker_manager": { "llm_request_timeout": 1500, "allow_mock_llm": false }
        }"#;
        let config: SystemConfig = from_str(json).unwrap();
        assert_eq!(config.interpreter.max_loop_iterations, 5);
        assert_eq!(config.interpreter.max_call_depth, 32);
        assert_eq!(
            config.worker_manager.llm_request_timeout,
            Duration::from_millis(1500)
        );
        assert!(!config.worker_manager.allow_mock_llm);
        assert_eq!(
            config.worker_manager.definitions_file,
            "ai_worker_definitions.json"
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"interpreter": {"max_call_depth": 3}}"#).unwrap();
        let config: SystemConfig = from_file(&path).unwrap();
        assert_eq!(config.interpreter.max_call_depth, 3);

        let missing: InternalResult<SystemConfig> = from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Configuration(_))));
    }
}
