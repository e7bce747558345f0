//! Clarification round-trips.
//!
//! When a request allows it, the model may answer with
//! `{"clarification_needed": true, "questions": [...]}` instead of files.
//! The questions go to a [`ClarificationHandler`]; whatever it returns (or
//! `None` on timeout) is fed into one more generation call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::util::extract_json_object;

const MARKER: &str = "\"clarification_needed\"";

#[derive(Debug, Deserialize)]
struct ClarificationReply {
    clarification_needed: bool,
    #[serde(default)]
    questions: Vec<String>,
}

/// Questions from a clarification reply, or `None` if `text` is anything else.
pub fn detect_clarification(text: &str) -> Option<Vec<String>> {
    let marker = text.find(MARKER)?;
    // Outermost enclosing object first; nested objects may precede the key.
    let reply = text[..marker].match_indices('{').find_map(|(start, _)| {
        let json = extract_json_object(&text[start..])?;
        if start + json.len() <= marker {
            return None;
        }
        serde_json::from_str::<ClarificationReply>(json).ok()
    })?;
    if !reply.clarification_needed {
        return None;
    }
    let questions: Vec<String> = reply
        .questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    (!questions.is_empty()).then_some(questions)
}

#[async_trait]
pub trait ClarificationHandler: Send + Sync {
    /// Deliver `questions` to the caller and wait for an answer. The pipeline
    /// bounds the wait with its own timeout.
    async fn request(&self, generation_id: Uuid, questions: &[String]) -> Option<String>;

    /// Called once the round is over, answered or not.
    async fn finished(&self, _generation_id: Uuid) {}
}

/// Never answers; the model is told to make reasonable assumptions.
pub struct NoClarification;

#[async_trait]
impl ClarificationHandler for NoClarification {
    async fn request(&self, _generation_id: Uuid, _questions: &[String]) -> Option<String> {
        None
    }
}

/// Answer channels for runs currently waiting on a clarification.
#[derive(Default)]
pub struct PendingClarifications {
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<String>>>,
}

impl PendingClarifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as waiting. A second registration replaces the first.
    pub async fn register(&self, id: Uuid) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);
        rx
    }

    /// Deliver an answer. Returns false if nothing is waiting on `id`.
    pub async fn answer(&self, id: Uuid, answer: String) -> bool {
        match self.waiting.lock().await.remove(&id) {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    pub async fn forget(&self, id: Uuid) {
        self.waiting.lock().await.remove(&id);
    }

    pub async fn is_waiting(&self, id: Uuid) -> bool {
        self.waiting.lock().await.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_bare_and_wrapped_replies() {
        let bare = r#"{"clarification_needed": true, "questions": ["Which cloud?", " "]}"#;
        assert_eq!(detect_clarification(bare), Some(vec!["Which cloud?".to_string()]));

        let wrapped = "I need more detail.\n```json\n{\"clarification_needed\": true, \"questions\": [\"Region?\"]}\n```";
        assert_eq!(detect_clarification(wrapped), Some(vec!["Region?".to_string()]));
    }

    #[test]
    fn test_nested_object_before_marker() {
        let nested = r#"{"context": {"region": "eu-west-1"}, "clarification_needed": true, "questions": ["Which VPC?"]}"#;
        assert_eq!(detect_clarification(nested), Some(vec!["Which VPC?".to_string()]));

        let prose = "Given {var.name} I still need:\n{\"assumed\": {\"tags\": {}}, \"clarification_needed\": true, \"questions\": [\"Bucket name?\"]}";
        assert_eq!(detect_clarification(prose), Some(vec!["Bucket name?".to_string()]));
    }

    #[test]
    fn test_ignores_code_and_negative_replies() {
        assert!(detect_clarification("## main.tf\nresource \"a\" \"b\" {}\n").is_none());
        assert!(detect_clarification(r#"{"clarification_needed": false, "questions": ["x"]}"#).is_none());
        assert!(detect_clarification(r#"{"clarification_needed": true, "questions": []}"#).is_none());
        assert!(detect_clarification(r#"{"clarification_needed": tru"#).is_none());
    }

    #[tokio::test]
    async fn test_pending_answer_round_trip() {
        let pending = PendingClarifications::new();
        let id = Uuid::new_v4();
        let rx = pending.register(id).await;
        assert!(pending.is_waiting(id).await);
        assert!(pending.answer(id, "AWS".into()).await);
        assert_eq!(rx.await.unwrap(), "AWS");
        assert!(!pending.is_waiting(id).await);
        assert!(!pending.answer(id, "again".into()).await);
    }

    #[tokio::test]
    async fn test_answer_after_receiver_dropped() {
        let pending = PendingClarifications::new();
        let id = Uuid::new_v4();
        drop(pending.register(id).await);
        assert!(!pending.answer(id, "late".into()).await);
    }

    #[tokio::test]
    async fn test_no_clarification_returns_none() {
        assert!(NoClarification.request(Uuid::nil(), &["q".into()]).await.is_none());
    }
}
