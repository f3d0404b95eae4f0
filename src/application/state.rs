use std::{sync::Arc, time::Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    application::config::RuntimeConfig,
    domain::{clock::now_unix_ms, error::ControlError, models::NodeStatus},
    protocol::{
        CommandPayload, HeartbeatPayload, PROTOCOL_VERSION, ResultPayload, map_result_status,
    },
    recovery::{HttpExecutor, RecoveryEngine, RecoveryExecutor, RuleSet},
    scheduler::FleetScheduler,
    sessions::{CommandOutcome, CommandWaiters, NodeSession, NodeView, SessionPool},
    store::{CommandCompletion, ControlStore, HeartbeatReport, HttpStore, NodeRegistration},
};

#[derive(Debug, Clone)]
pub enum NodeCredential {
    Secret(String),
    NewNode,
}

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<InnerState>,
}

struct InnerState {
    config: RuntimeConfig,
    started_at: Instant,
    pool: SessionPool,
    scheduler: Arc<FleetScheduler>,
    waiters: CommandWaiters,
    recovery: RecoveryEngine,
    store: Option<Arc<dyn ControlStore>>,
}

impl SharedState {
    pub fn new(config: RuntimeConfig) -> Result<Self, ControlError> {
        let store: Option<Arc<dyn ControlStore>> = match &config.store_url {
            Some(url) => Some(Arc::new(HttpStore::new(url, config.store_timeout)?)),
            None => None,
        };
        let executor: Option<Arc<dyn RecoveryExecutor>> = match &config.executor_url {
            Some(url) => Some(Arc::new(HttpExecutor::new(url, config.store_timeout)?)),
            None => None,
        };
        Ok(Self::with_collaborators(config, store, executor))
    }

    #[must_use]
    pub fn with_collaborators(
        config: RuntimeConfig,
        store: Option<Arc<dyn ControlStore>>,
        executor: Option<Arc<dyn RecoveryExecutor>>,
    ) -> Self {
        if store.is_none() {
            warn!(
                "no control store configured, running degraded: no command queue, fallback auth only"
            );
        }
        let (rules, disabled) = RuleSet::with_disabled(&config.disabled_rules);
        if !disabled.is_empty() {
            info!("recovery rules disabled by config: {}", disabled.join(", "));
        }
        let scheduler = Arc::new(FleetScheduler::new(config.scheduler.clone(), &config.geometry));
        let recovery = RecoveryEngine::new(rules, store.clone(), executor);

        let pool = SessionPool::default();
        let fleet = Arc::clone(&scheduler);
        pool.on_disconnect(Arc::new(move |session: &NodeSession| {
            let offline = fleet.mark_node_offline(&session.node_id);
            info!(
                "node {} disconnected, {offline} devices marked offline",
                session.node_id
            );
            Ok(())
        }));

        Self {
            inner: Arc::new(InnerState {
                started_at: Instant::now(),
                pool,
                scheduler,
                waiters: CommandWaiters::default(),
                recovery,
                store,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn scheduler(&self) -> &FleetScheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn waiters(&self) -> &CommandWaiters {
        &self.inner.waiters
    }

    #[must_use]
    pub fn has_store(&self) -> bool {
        self.inner.store.is_some()
    }

    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.inner.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn node_credential(&self, node_id: &str) -> NodeCredential {
        if let Some(store) = &self.inner.store {
            match store.fetch_node_secret(node_id).await {
                Ok(Some(secret)) => return NodeCredential::Secret(secret),
                Ok(None) => return NodeCredential::NewNode,
                Err(error) => warn!("node secret lookup failed node={node_id}: {error}"),
            }
        }
        match &self.inner.config.fallback_secret {
            Some(secret) => NodeCredential::Secret(secret.clone()),
            None => NodeCredential::NewNode,
        }
    }

    pub async fn register_session(&self, session: NodeSession) {
        let registration = NodeRegistration {
            node_id: session.node_id.clone(),
            session_id: session.session_id.clone(),
            hostname: session.hostname.clone(),
            remote_ip: session.remote_ip.clone(),
            capabilities: session.capabilities.clone(),
            device_count: session.device_count,
            runner_version: session.runner_version.clone(),
            connected_at_ms: session.connected_at_ms,
        };

        if let Some(replaced) = self.inner.pool.add(session) {
            info!(
                "node {} reconnected, closed previous session {}",
                replaced.node_id, replaced.session_id
            );
        }

        if let Some(store) = &self.inner.store {
            if let Err(error) = store.register_node(&registration).await {
                warn!(
                    "node registration write failed node={}: {error}",
                    registration.node_id
                );
            }
        }
    }

    pub async fn session_closed(&self, node_id: &str, session_id: &str) {
        let Some(removed) = self.inner.pool.remove(node_id, session_id) else {
            return;
        };
        debug!("session {} for node {node_id} closed", removed.session_id);

        if let Some(store) = &self.inner.store {
            if let Err(error) = store.disconnect_node(node_id, session_id).await {
                warn!("node disconnect write failed node={node_id}: {error}");
            }
        }
    }

    pub async fn heartbeat(
        &self,
        node_id: &str,
        session_id: &str,
        payload: &HeartbeatPayload,
    ) -> Vec<CommandPayload> {
        let now = now_unix_ms();
        let device_count = u32::try_from(payload.device_snapshot.len()).unwrap_or(u32::MAX);
        let refreshed = self.inner.pool.update_heartbeat(
            node_id,
            session_id,
            payload.status,
            device_count,
            payload.active_tasks,
            &payload.resources,
            now,
        );
        if !refreshed {
            debug!("heartbeat from superseded session {session_id} node={node_id} ignored");
            return Vec::new();
        }
        self.inner
            .scheduler
            .observe_heartbeats(node_id, &payload.device_snapshot, now);

        let Some(store) = &self.inner.store else {
            return Vec::new();
        };
        let report = HeartbeatReport {
            node_id: node_id.to_owned(),
            session_id: session_id.to_owned(),
            status: payload.status,
            device_count,
            active_tasks: payload.active_tasks,
            resources: payload.resources.clone(),
            ts: now,
        };
        let commands = match store.process_heartbeat(&report).await {
            Ok(commands) => commands,
            Err(error) => {
                warn!("heartbeat forward failed node={node_id}: {error}");
                return Vec::new();
            }
        };
        // Pending work stays queued until the node reports itself READY.
        if payload.status != NodeStatus::Ready {
            if !commands.is_empty() {
                debug!(
                    "node {node_id} not ready, leaving {} commands queued",
                    commands.len()
                );
            }
            return Vec::new();
        }
        for command in &commands {
            if let Err(error) = store.mark_command_started(&command.command_id, node_id).await {
                warn!(
                    "command dispatch record failed {}: {error}",
                    command.command_id
                );
            }
        }
        commands
    }

    pub async fn command_completed(&self, node_id: &str, payload: &ResultPayload) {
        self.inner
            .scheduler
            .apply_result_stats(&payload.device_results);

        self.inner.waiters.complete(CommandOutcome {
            command_id: payload.command_id.clone(),
            status: payload.status.clone(),
            summary: payload.summary.clone(),
            error_message: payload.error_message.clone(),
        });

        if let Some(store) = &self.inner.store {
            let completion = CommandCompletion {
                command_id: payload.command_id.clone(),
                node_id: node_id.to_owned(),
                status: map_result_status(&payload.status).to_owned(),
                summary: payload.summary.clone(),
                error_message: payload.error_message.clone(),
                device_results: payload.device_results.clone(),
                ts: now_unix_ms(),
            };
            if let Err(error) = store.complete_command(&completion).await {
                warn!(
                    "command completion write failed {}: {error}",
                    payload.command_id
                );
            }
        }
    }

    pub async fn enqueue_command(&self, command: &CommandPayload) -> Result<(), ControlError> {
        let Some(store) = &self.inner.store else {
            return Err(ControlError::Unavailable(
                "command queue requires the control store".to_owned(),
            ));
        };
        store.enqueue_command(command).await
    }

    pub async fn recovery_tick(&self) {
        if !self.inner.config.recovery_enabled {
            return;
        }
        let sessions = self.inner.pool.snapshot();
        self.inner.recovery.tick(&sessions).await;
    }

    pub fn sweep_devices(&self) {
        let now = now_unix_ms();
        let offline = self.inner.scheduler.sweep_offline(now);
        let (rested, woken) = self.inner.scheduler.sweep_rotation(now);
        if offline > 0 || rested > 0 || woken > 0 {
            debug!("device sweep: {offline} offline, {rested} resting, {woken} woken");
        }
    }

    pub async fn sweep_sessions(&self) {
        let now = now_unix_ms();
        let timeout_ms =
            u64::try_from(self.inner.config.heartbeat_timeout.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<(String, String)> = self
            .inner
            .pool
            .snapshot()
            .into_iter()
            .filter(|session| now.saturating_sub(session.last_heartbeat_ms) > timeout_ms)
            .map(|session| (session.node_id, session.session_id))
            .collect();

        for (node_id, session_id) in stale {
            warn!("node {node_id} heartbeat timed out, closing session {session_id}");
            if let Some(session) = self.inner.pool.get(&node_id) {
                if session.session_id == session_id {
                    session.handle.close();
                }
            }
            self.session_closed(&node_id, &session_id).await;
        }
    }

    #[must_use]
    pub fn node_views(&self) -> Vec<NodeView> {
        self.inner
            .pool
            .snapshot()
            .iter()
            .map(NodeSession::view)
            .collect()
    }

    #[must_use]
    pub fn health_payload(&self) -> Value {
        json!({
            "ok": true,
            "ts": now_unix_ms(),
            "version": self.inner.config.runtime_version,
            "protocol_version": PROTOCOL_VERSION,
            "uptime_ms": self.uptime_ms(),
            "nodes_connected": self.inner.pool.len(),
            "devices_total": self.inner.scheduler.total_devices(),
            "store_connected": self.has_store(),
        })
    }

    #[must_use]
    pub fn info_payload(&self) -> Value {
        let config = &self.inner.config;
        json!({
            "version": config.runtime_version,
            "protocol_version": PROTOCOL_VERSION,
            "heartbeat_interval_secs": config.heartbeat_interval.as_secs(),
            "heartbeat_timeout_secs": config.heartbeat_timeout.as_secs(),
            "max_tasks_per_node": config.max_tasks_per_node,
            "fleet": {
                "nodes": config.geometry.nodes,
                "boards_per_node": config.geometry.boards_per_node,
                "slots_per_board": config.geometry.slots_per_board,
                "devices": self.inner.scheduler.total_devices(),
            },
            "recovery": {
                "enabled": config.recovery_enabled,
                "rules": self.inner.recovery.rules().all(),
            },
            "store_connected": self.has_store(),
        })
    }
}
