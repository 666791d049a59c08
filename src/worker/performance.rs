//! Performance accounting: building task records and rolling them into a
//! definition's aggregate summary.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{AggregatePerformanceSummary, CostMetrics, PerformanceRecord, TokenUsageMetrics};

const ELLIPSIS: &str = "...";

/// Truncates to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - ELLIPSIS.len()).collect();
    out.push_str(ELLIPSIS);
    out
}

pub fn calculate_cost(metrics: &CostMetrics, usage: &TokenUsageMetrics) -> f64 {
    (usage.input_tokens as f64 / 1000.0) * metrics.input_tokens_per_1k
        + (usage.output_tokens as f64 / 1000.0) * metrics.output_tokens_per_1k
}

impl PerformanceRecord {
    /// A record for a task that ran from `start_time` to `end_time`. It starts
    /// out unsuccessful with no usage.
    pub fn new(
        definition_id: &str,
        instance_id: Option<&str>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;
        Self {
            task_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.map(str::to_string),
            definition_id: definition_id.to_string(),
            start_time,
            end_time,
            duration_ms,
            success: false,
            cost_incurred: 0.0,
            token_metrics: TokenUsageMetrics::default(),
            output_summary: String::new(),
            error_text: None,
        }
    }

    pub fn succeeded(
        mut self,
        output: &str,
        usage: TokenUsageMetrics,
        cost: f64,
        max_summary_chars: usize,
    ) -> Self {
        self.success = true;
        self.token_metrics = usage;
        self.cost_incurred = cost;
        self.output_summary = truncate_summary(output, max_summary_chars);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_text = Some(error.into());
        self
    }
}

/// Incremental aggregation of one record.
pub fn apply_record(summary: &mut AggregatePerformanceSummary, record: &PerformanceRecord) {
    summary.total_tasks_attempted += 1;
    if record.success {
        summary.total_tasks_succeeded += 1;
    } else {
        summary.total_tasks_failed += 1;
    }
    summary.average_success_rate =
        summary.total_tasks_succeeded as f64 / summary.total_tasks_attempted as f64;
    summary.total_input_tokens = summary
        .total_input_tokens
        .saturating_add(record.token_metrics.input_tokens);
    summary.total_output_tokens = summary
        .total_output_tokens
        .saturating_add(record.token_metrics.output_tokens);
    summary.total_cost += record.cost_incurred;
    summary.last_activity_at = match summary.last_activity_at {
        Some(last) if last > record.end_time => Some(last),
        _ => Some(record.end_time),
    };
}
