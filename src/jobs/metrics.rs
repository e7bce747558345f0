use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::generate::models::GenerationResult;

/// Process-wide job and generation counters.
#[derive(Debug, Default)]
pub struct Metrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    generations: AtomicU64,
    generation_ms: AtomicU64,
    correction_cycles: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_timed_out: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub correction_cycles: u64,
    pub average_generation_ms: Option<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Timeouts also count as failures.
    pub fn job_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, result: &GenerationResult) {
        let meta = &result.pipeline_metadata;
        if result.success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.prompt_tokens
            .fetch_add(meta.token_usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(meta.token_usage.completion_tokens, Ordering::Relaxed);
        self.generations.fetch_add(1, Ordering::Relaxed);
        self.generation_ms
            .fetch_add(result.total_time_ms, Ordering::Relaxed);
        if let Some(correction) = &meta.correction {
            self.correction_cycles
                .fetch_add(correction.cycles.len() as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        let generations = self.generations.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_submitted: self.submitted.load(Ordering::Relaxed),
            jobs_completed: self.completed.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_cancelled: self.cancelled.load(Ordering::Relaxed),
            jobs_timed_out: self.timed_out.load(Ordering::Relaxed),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            correction_cycles: self.correction_cycles.load(Ordering::Relaxed),
            average_generation_ms: (generations > 0)
                .then(|| self.generation_ms.load(Ordering::Relaxed) / generations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::models::{
        GenerationRequest, PipelineError, PipelineMetadata, PipelineStage, Scenario, TokenUsage,
    };
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn result(ms: u64, failed: bool) -> GenerationResult {
        let meta = PipelineMetadata {
            token_usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 40,
            },
            ..PipelineMetadata::default()
        };
        let errors = if failed {
            vec![PipelineError {
                stage: PipelineStage::CodeGeneration,
                kind: "generation".into(),
                message: "x".into(),
            }]
        } else {
            vec![]
        };
        GenerationResult::new(
            Uuid::new_v4(),
            GenerationRequest::new("q", Scenario::NewResource),
            BTreeMap::new(),
            meta,
            errors,
            ms,
        )
    }

    #[test]
    fn test_snapshot_aggregates() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().average_generation_ms, None);

        m.job_submitted();
        m.job_submitted();
        m.job_submitted();
        m.record_result(&result(100, false));
        m.record_result(&result(300, true));
        m.job_timed_out();

        let s = m.snapshot();
        assert_eq!(s.jobs_submitted, 3);
        assert_eq!(s.jobs_completed, 1);
        assert_eq!(s.jobs_failed, 2);
        assert_eq!(s.jobs_timed_out, 1);
        assert_eq!(s.total_tokens, 280);
        assert_eq!(s.average_generation_ms, Some(200));
    }
}
