use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{AgentId, CommandId, PrivacyCommand};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::factory::{CommandFeedClient, CommandFeedClientProvider};

/// Queries a remote command feed server on behalf of one agent.
#[derive(Debug, Clone)]
pub struct HttpCommandFeedClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: AgentId,
}

impl HttpCommandFeedClient {
    pub fn new(client: reqwest::Client, base_url: &str, agent_id: AgentId) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id,
        }
    }

    /// Ids are percent-encoded as single path segments.
    fn command_url(&self, command_id: &CommandId) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("command feed url {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(["agents", self.agent_id.get(), "commands", command_id.get()]);
        Ok(url)
    }
}

#[async_trait]
impl CommandFeedClient for HttpCommandFeedClient {
    async fn query_command(
        &self,
        command_id: &CommandId,
        lease_receipt: &str,
    ) -> Result<Option<PrivacyCommand>> {
        let url = self.command_url(command_id)?;
        let resp = self
            .client
            .get(url)
            .query(&[("lease_receipt", lease_receipt)])
            .send()
            .await
            .map_err(|e| anyhow!("unable to query command {}: {}", command_id, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(command_id = %command_id, "command not found in feed");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow!(
                "unable to query command {}: status: {}, error: {}",
                command_id,
                resp.status(),
                resp.text().await?
            ));
        }
        let command = resp
            .json::<PrivacyCommand>()
            .await
            .map_err(|e| anyhow!("unable to decode command {}: {}", command_id, e))?;
        Ok(Some(command))
    }
}

/// Hands out HTTP clients that share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpCommandFeedClientProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommandFeedClientProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl CommandFeedClientProvider for HttpCommandFeedClientProvider {
    async fn create_client(&self, agent_id: &AgentId) -> Result<Arc<dyn CommandFeedClient>> {
        Ok(Arc::new(HttpCommandFeedClient::new(
            self.client.clone(),
            &self.base_url,
            agent_id.clone(),
        )))
    }
}
