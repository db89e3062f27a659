use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blob_store::BlobStorage;
use command_feed::{CommandFeed, CompletionAggregator};
use data_model::{AgentId, CommandId, CommandState, CommandType, PrivacyCommand};
use export_writer::{
    archive::ArchiveSummary,
    storage::BlobExportPipeline,
    CommandFeedClient,
    CommandFeedClientProvider,
    CommandStateTable,
    ExportArchiveBuilder,
    StagedSource,
};
use state_store::CommandFeedState;
use tracing::info;

/// Command states straight from the local state store.
pub struct FeedStateTable {
    state: Arc<CommandFeedState>,
}

impl FeedStateTable {
    pub fn new(state: Arc<CommandFeedState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandStateTable for FeedStateTable {
    async fn get_command_state(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
    ) -> Result<Option<CommandState>> {
        self.state.reader().get_command_state(agent_id, command_id)
    }
}

/// Queries the command feed running in this process.
pub struct LocalCommandFeedClient {
    feed: Arc<CommandFeed>,
    agent_id: AgentId,
}

#[async_trait]
impl CommandFeedClient for LocalCommandFeedClient {
    async fn query_command(
        &self,
        command_id: &CommandId,
        lease_receipt: &str,
    ) -> Result<Option<PrivacyCommand>> {
        Ok(self
            .feed
            .query_command(&self.agent_id, command_id, lease_receipt)
            .await?)
    }
}

pub struct LocalCommandFeedClientProvider {
    feed: Arc<CommandFeed>,
}

impl LocalCommandFeedClientProvider {
    pub fn new(feed: Arc<CommandFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl CommandFeedClientProvider for LocalCommandFeedClientProvider {
    async fn create_client(&self, agent_id: &AgentId) -> Result<Arc<dyn CommandFeedClient>> {
        Ok(Arc::new(LocalCommandFeedClient {
            feed: self.feed.clone(),
            agent_id: agent_id.clone(),
        }))
    }
}

/// Builds the final archive of a globally complete export from what the
/// agents staged at the command's destination.
pub struct ExportFinalizer {
    aggregator: Arc<CompletionAggregator>,
    builder: ExportArchiveBuilder,
    archive_storage: Arc<BlobStorage>,
}

impl ExportFinalizer {
    pub fn new(
        aggregator: Arc<CompletionAggregator>,
        builder: ExportArchiveBuilder,
        archive_storage: Arc<BlobStorage>,
    ) -> Self {
        Self {
            aggregator,
            builder,
            archive_storage,
        }
    }

    pub fn archive_key(command_id: &CommandId) -> String {
        format!("archives/{}.zip", command_id)
    }

    /// Returns `None` while agents are still exporting.
    #[tracing::instrument(skip(self), fields(command_id = command_id.get()))]
    pub async fn finalize(&self, command_id: &CommandId) -> Result<Option<ArchiveSummary>> {
        let status = self.aggregator.command_status(command_id)?;
        if status.command_type != CommandType::Export {
            return Err(anyhow!("command {} is not an export", command_id));
        }
        if !status.is_globally_complete {
            info!("export not complete yet");
            return Ok(None);
        }
        let destination = status
            .final_export_destination_uri
            .as_deref()
            .ok_or_else(|| anyhow!("export {} has no destination", command_id))?;
        let storage = BlobStorage::from_url(destination)?;

        // An agent stages once per command, whatever its asset groups.
        let mut agents = BTreeMap::new();
        for group in status
            .asset_group_statuses
            .iter()
            .filter(|s| s.completed_time.is_some())
        {
            agents
                .entry(group.agent_id.clone())
                .or_insert_with(|| group.asset_group_id.clone());
        }
        let sources: Vec<StagedSource> = agents
            .into_iter()
            .map(|(agent_id, asset_group_id)| StagedSource {
                prefix: BlobExportPipeline::staging_prefix(command_id, &agent_id),
                agent_id,
                asset_group_id,
                storage: storage.clone(),
            })
            .collect();

        let (summary, _) = self
            .builder
            .build(
                command_id,
                &sources,
                &self.archive_storage,
                &Self::archive_key(command_id),
            )
            .await?;
        Ok(Some(summary))
    }
}
