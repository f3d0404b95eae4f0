use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Default)]
pub struct CommandWaiters {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandOutcome>>>,
}

impl CommandWaiters {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<CommandOutcome>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, command_id: &str) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(command_id.to_owned(), tx);
        rx
    }

    pub fn complete(&self, outcome: CommandOutcome) -> bool {
        let Some(sender) = self.lock().remove(&outcome.command_id) else {
            return false;
        };
        sender.send(outcome).is_ok()
    }

    pub fn discard(&self, command_id: &str) {
        self.lock().remove(command_id);
    }

    pub async fn wait(&self, command_id: &str, timeout: Duration) -> Option<CommandOutcome> {
        let receiver = self.register(command_id);
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => Some(outcome),
            _ => {
                self.discard(command_id);
                None
            }
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}
