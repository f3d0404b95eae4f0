use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{error::ControlError, models::NodeStatus};

pub type DisconnectListener = Arc<dyn Fn(&NodeSession) -> Result<(), ControlError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SessionHandle {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { sender, cancel }
    }

    pub fn send(&self, text: String) -> bool {
        self.sender.send(text).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub session_id: String,
    pub hostname: String,
    pub remote_ip: Option<String>,
    pub capabilities: Vec<String>,
    pub runner_version: Option<String>,
    pub status: NodeStatus,
    pub device_count: u32,
    pub active_tasks: u32,
    pub resources: Value,
    pub connected_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub handle: SessionHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub session_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    pub status: NodeStatus,
    pub device_count: u32,
    pub active_tasks: u32,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
    pub connected_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl NodeSession {
    #[must_use]
    pub fn view(&self) -> NodeView {
        NodeView {
            node_id: self.node_id.clone(),
            session_id: self.session_id.clone(),
            hostname: self.hostname.clone(),
            remote_ip: self.remote_ip.clone(),
            status: self.status,
            device_count: self.device_count,
            active_tasks: self.active_tasks,
            capabilities: self.capabilities.clone(),
            runner_version: self.runner_version.clone(),
            connected_at_ms: self.connected_at_ms,
            last_heartbeat_ms: self.last_heartbeat_ms,
        }
    }
}

#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<String, NodeSession>>,
    listeners: Mutex<Vec<DisconnectListener>>,
}

impl SessionPool {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodeSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn listeners_lock(&self) -> MutexGuard<'_, Vec<DisconnectListener>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn on_disconnect(&self, listener: DisconnectListener) {
        self.listeners_lock().push(listener);
    }

    pub fn add(&self, session: NodeSession) -> Option<NodeSession> {
        let replaced = {
            let mut sessions = self.lock();
            sessions.insert(session.node_id.clone(), session)
        };
        if let Some(previous) = &replaced {
            previous.handle.close();
        }
        replaced
    }

    pub fn remove(&self, node_id: &str, session_id: &str) -> Option<NodeSession> {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(node_id) {
                Some(existing) if existing.session_id == session_id => sessions.remove(node_id),
                _ => None,
            }
        };
        if let Some(session) = &removed {
            self.notify_disconnect(session);
        }
        removed
    }

    fn notify_disconnect(&self, session: &NodeSession) {
        let listeners = self.listeners_lock().clone();
        for listener in listeners {
            if let Err(error) = listener(session) {
                warn!(
                    "disconnect listener failed node={}: {error}",
                    session.node_id
                );
            }
        }
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.lock().get(node_id).cloned()
    }

    pub fn update_heartbeat(
        &self,
        node_id: &str,
        session_id: &str,
        status: NodeStatus,
        device_count: u32,
        active_tasks: u32,
        resources: &Value,
        now_ms: u64,
    ) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(node_id) else {
            return false;
        };
        if session.session_id != session_id {
            return false;
        }
        session.status = status;
        session.device_count = device_count;
        session.active_tasks = active_tasks;
        if !resources.is_null() {
            session.resources = resources.clone();
        }
        session.last_heartbeat_ms = now_ms;
        true
    }

    pub fn send_to(&self, node_id: &str, text: String) -> bool {
        let handle = self.lock().get(node_id).map(|session| session.handle.clone());
        match handle {
            Some(handle) => handle.send(text),
            None => false,
        }
    }

    pub fn broadcast(&self, text: &str) -> usize {
        let handles: Vec<SessionHandle> = self
            .lock()
            .values()
            .map(|session| session.handle.clone())
            .collect();
        let mut delivered = 0;
        for handle in handles {
            if handle.send(text.to_owned()) {
                delivered += 1;
            }
        }
        delivered
    }

    #[must_use]
    pub fn eligible_for_work(&self, max_tasks: u32) -> Vec<NodeSession> {
        let mut eligible: Vec<NodeSession> = self
            .lock()
            .values()
            .filter(|session| {
                session.status == NodeStatus::Ready && session.active_tasks < max_tasks
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        eligible
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeSession> {
        let mut sessions: Vec<NodeSession> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
