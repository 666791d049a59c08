mod interpreter_tests;
mod worker_tests;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ実行したい処理
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub const WORKER_DEFINITIONS: &str = r#"[
  {
    "id": "writer",
    "name": "writer",
    "provider": "mock",
    "model_name": "mock-model",
    "interaction_models": ["both"],
    "rate_limits": { "max_concurrent_active_instances": 1 },
    "cost_metrics": { "input_tokens_per_1k": 0.5, "output_tokens_per_1k": 1.5 }
  },
  {
    "id": "summarizer",
    "name": "summarizer",
    "provider": "mock",
    "model_name": "mock-small",
    "interaction_models": ["stateless"],
    "rate_limits": { "max_requests_per_minute": 2 }
  }
]"#;
