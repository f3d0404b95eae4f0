use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{CommandCompletion, ControlStore, HeartbeatReport, NodeRegistration};
use crate::domain::error::ControlError;
use crate::domain::models::{RecoveryEvent, RecoveryRule};
use crate::protocol::CommandPayload;

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                ControlError::Store(format!("failed to construct store client: {error}"))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ControlError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|error| {
                ControlError::Store(format!("store request {path} failed: {error}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Store(format!(
                "store request {path} failed with {status}: {body}"
            )));
        }

        response.json::<R>().await.map_err(|error| {
            ControlError::Store(format!("store response for {path} was invalid: {error}"))
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct SecretResponse {
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    commands: Vec<CommandPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct AllowedResponse {
    allowed: bool,
}

#[async_trait]
impl ControlStore for HttpStore {
    async fn fetch_node_secret(&self, node_id: &str) -> Result<Option<String>, ControlError> {
        let response: SecretResponse = self
            .post_json("/nodes/secret", &json!({ "node_id": node_id }))
            .await?;
        Ok(response.secret)
    }

    async fn register_node(&self, registration: &NodeRegistration) -> Result<(), ControlError> {
        let _: Value = self.post_json("/nodes/register", registration).await?;
        Ok(())
    }

    async fn disconnect_node(&self, node_id: &str, session_id: &str) -> Result<(), ControlError> {
        let _: Value = self
            .post_json(
                "/nodes/disconnect",
                &json!({ "node_id": node_id, "session_id": session_id }),
            )
            .await?;
        Ok(())
    }

    async fn process_heartbeat(
        &self,
        report: &HeartbeatReport,
    ) -> Result<Vec<CommandPayload>, ControlError> {
        let response: HeartbeatResponse = self.post_json("/heartbeats", report).await?;
        Ok(response.commands)
    }

    async fn mark_command_started(
        &self,
        command_id: &str,
        node_id: &str,
    ) -> Result<(), ControlError> {
        let _: Value = self
            .post_json(
                "/commands/started",
                &json!({ "command_id": command_id, "node_id": node_id }),
            )
            .await?;
        Ok(())
    }

    async fn complete_command(&self, completion: &CommandCompletion) -> Result<(), ControlError> {
        let _: Value = self.post_json("/commands/complete", completion).await?;
        Ok(())
    }

    async fn enqueue_command(&self, command: &CommandPayload) -> Result<(), ControlError> {
        let _: Value = self.post_json("/commands/enqueue", command).await?;
        Ok(())
    }

    async fn recovery_allowed(
        &self,
        rule: &RecoveryRule,
        node_id: &str,
    ) -> Result<bool, ControlError> {
        let response: AllowedResponse = self
            .post_json(
                "/recovery/allowed",
                &json!({ "node_id": node_id, "rule": rule }),
            )
            .await?;
        Ok(response.allowed)
    }

    async fn record_recovery(&self, event: &RecoveryEvent) -> Result<(), ControlError> {
        let _: Value = self.post_json("/recovery/events", event).await?;
        Ok(())
    }
}
