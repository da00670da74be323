//! Human-in-the-loop questions.
//!
//! A question is a pending entry keyed by a generated id. The consumer sees
//! an [`AgentEvent::AskUser`] and replies through [`QuestionBroker::answer`].

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::agent::events::{AgentEvent, EventSink};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AskError {
    #[error("question was cancelled")]
    Cancelled,
}

/// Routes `ask_user` questions to an event sink and answers back to the caller.
pub struct QuestionBroker {
    sink: EventSink,
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

/// Removes the pending entry when the asking future ends or is dropped.
struct PendingGuard<'a> {
    broker: &'a QuestionBroker,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.lock().remove(&self.id);
    }
}

impl QuestionBroker {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<String>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emits the question and waits for its answer.
    pub async fn ask(&self, question: &str, options: Vec<String>) -> Result<String, AskError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            broker: self,
            id: id.clone(),
        };

        tracing::info!(question_id = %id, "waiting for user answer");
        (self.sink)(AgentEvent::AskUser {
            id,
            question: question.to_string(),
            options,
        });

        rx.await.map_err(|_| AskError::Cancelled)
    }

    /// Resolves question `id`. Returns false when it is unknown or already answered.
    pub fn answer(&self, id: &str, text: impl Into<String>) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Fails question `id` without an answer. Returns false when it is not pending.
    pub fn reject(&self, id: &str) -> bool {
        let rejected = self.lock().remove(id).is_some();
        if rejected {
            tracing::info!(question_id = %id, "question rejected");
        }
        rejected
    }

    /// Fails every pending question. Returns how many were pending.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "rejecting pending questions");
        }
        drained.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
