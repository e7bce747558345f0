use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::JobError;
use crate::generate::models::{GenerationRequest, GenerationResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, to: &JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One submitted generation. Mutated only through [`GenerationJob::transition`]
/// and the clarification setters; frozen once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub request: Arc<GenerationRequest>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Arc<GenerationResult>>,
    pub error_message: Option<String>,
    pub clarification_questions: Option<Vec<String>>,
}

impl GenerationJob {
    pub fn new(request: Arc<GenerationRequest>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Pending,
            request,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            clarification_questions: None,
        }
    }

    /// Move to `to`, stamping timestamps. Terminal jobs never change.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(&to) {
            return Err(JobError::InvalidTransition { from: self.status, to });
        }
        let now = Utc::now();
        match to {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.completed_at = Some(now);
                self.clarification_questions = None;
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn complete(&mut self, result: GenerationResult) -> Result<(), JobError> {
        let (status, error) = if result.success {
            (JobStatus::Completed, None)
        } else {
            let summary = result
                .error_summary()
                .unwrap_or_else(|| "Generation failed".to_string());
            (JobStatus::Failed, Some(summary))
        };
        self.transition(status)?;
        self.error_message = error;
        self.result = Some(Arc::new(result));
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn age_since_completion(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.completed_at.map(|done| now - done)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            status: self.status,
            scenario: self.request.scenario.as_str().to_string(),
            query: self.request.query.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: match (self.started_at, self.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
                _ => None,
            },
            success: self.result.as_ref().map(|r| r.success),
            error_message: self.error_message.clone(),
            clarification_questions: self.clarification_questions.clone(),
        }
    }
}

/// Lightweight, result-free view of a job for polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub scenario: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub clarification_questions: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::models::{PipelineError, PipelineMetadata, PipelineStage, Scenario};
    use std::collections::BTreeMap;

    fn job() -> GenerationJob {
        GenerationJob::new(Arc::new(GenerationRequest::new("a vpc", Scenario::NewResource)))
    }

    fn result(errors: Vec<PipelineError>) -> GenerationResult {
        GenerationResult::new(
            Uuid::new_v4(),
            GenerationRequest::new("a vpc", Scenario::NewResource),
            BTreeMap::new(),
            PipelineMetadata::default(),
            errors,
            10,
        )
    }

    #[test]
    fn test_status_round_trip() {
        for s in ["pending", "running", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use JobStatus::*;
        let all = [Pending, Running, Completed, Failed, Cancelled];
        for from in all {
            for to in all {
                if from.is_terminal() {
                    assert!(!from.can_transition_to(&to), "{} -> {}", from, to);
                }
                if to == Pending {
                    assert!(!from.can_transition_to(&to));
                }
            }
        }
        assert!(Pending.can_transition_to(&Cancelled));
        assert!(!Running.can_transition_to(&Running));
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut j = job();
        j.clarification_questions = Some(vec!["q".into()]);
        j.transition(JobStatus::Running).unwrap();
        assert!(j.started_at.is_some());
        j.transition(JobStatus::Cancelled).unwrap();
        assert!(j.completed_at.is_some());
        assert!(j.clarification_questions.is_none());

        let err = j.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobStatus::Cancelled, .. }));
        assert_eq!(j.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_complete_maps_success_to_status() {
        let mut ok = job();
        ok.transition(JobStatus::Running).unwrap();
        ok.complete(result(vec![])).unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert!(ok.error_message.is_none());

        let mut bad = job();
        bad.transition(JobStatus::Running).unwrap();
        bad.complete(result(vec![PipelineError {
            stage: PipelineStage::CodeGeneration,
            kind: "generation".into(),
            message: "Code generation failed: boom".into(),
        }]))
        .unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error_message.as_deref(), Some("Code generation failed: boom"));
        assert!(bad.result.is_some());
        assert_eq!(bad.snapshot().success, Some(false));
    }

    #[test]
    fn test_completed_job_cannot_be_cancelled() {
        let mut j = job();
        j.transition(JobStatus::Running).unwrap();
        j.complete(result(vec![])).unwrap();
        let before = j.snapshot();
        assert!(j.transition(JobStatus::Cancelled).is_err());
        assert_eq!(j.snapshot(), before);
    }

    #[test]
    fn test_job_serializes_with_request() {
        let j = job();
        let json = serde_json::to_value(&j).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["request"]["query"], "a vpc");
        let back: GenerationJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id, j.job_id);
    }
}
