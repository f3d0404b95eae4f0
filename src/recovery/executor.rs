use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::error::ControlError;
use crate::domain::models::RecoveryLevel;

#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn execute(
        &self,
        event_id: &str,
        node_id: &str,
        level: RecoveryLevel,
    ) -> Result<(), ControlError>;
}

pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                ControlError::Unavailable(format!(
                    "failed to construct recovery executor client: {error}"
                ))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl RecoveryExecutor for HttpExecutor {
    async fn execute(
        &self,
        event_id: &str,
        node_id: &str,
        level: RecoveryLevel,
    ) -> Result<(), ControlError> {
        let url = format!("{}/recover", self.base_url);
        let body = json!({
            "event_id": event_id,
            "node_id": node_id,
            "level": level,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                ControlError::Unavailable(format!("recovery executor request failed: {error}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Unavailable(format!(
                "recovery executor rejected {} for {node_id} with {status}: {body}",
                level.as_str()
            )));
        }
        Ok(())
    }
}
