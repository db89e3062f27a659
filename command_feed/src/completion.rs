use std::{sync::Arc, time::Duration};

use data_model::{
    AgentId,
    AssetGroupId,
    AssetGroupStatus,
    CommandId,
    CommandStatusResponse,
    CommandType,
};
use feed_utils::{poll_until, PollBackoff};
use state_store::{scanner::StateReader, CommandFeedState};
use tracing::debug;

use crate::errors::{CommandFeedError, Result};

pub const ASSET_GROUP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);
pub const GLOBAL_COMPLETION_TIMEOUT: Duration = Duration::from_secs(600);

/// Read side of completion: per asset group and global status of commands.
pub struct CompletionAggregator {
    state: Arc<CommandFeedState>,
}

impl CompletionAggregator {
    pub fn new(state: Arc<CommandFeedState>) -> Self {
        Self { state }
    }

    pub fn command_status(&self, command_id: &CommandId) -> Result<CommandStatusResponse> {
        let reader = self.state.reader();
        status_for(&reader, command_id, true)?
            .ok_or_else(|| CommandFeedError::CommandNotFound(command_id.clone()))
    }

    /// Statuses of every command a requester issued. Asset group statuses
    /// are left out.
    pub fn status_by_requester(
        &self,
        requester: &str,
        command_type: Option<CommandType>,
    ) -> Result<Vec<CommandStatusResponse>> {
        let reader = self.state.reader();
        let ids = reader.command_ids_for_requester(requester, command_type)?;
        statuses_for(&reader, ids)
    }

    /// Like `status_by_requester`, keyed by `Subject::key`.
    pub fn status_by_subject(
        &self,
        subject_key: &str,
        command_type: Option<CommandType>,
    ) -> Result<Vec<CommandStatusResponse>> {
        let reader = self.state.reader();
        let ids = reader.command_ids_for_subject(subject_key, command_type)?;
        statuses_for(&reader, ids)
    }

    pub fn asset_group_status(
        &self,
        command_id: &CommandId,
        agent_id: &AgentId,
        asset_group_id: &AssetGroupId,
    ) -> Result<Option<AssetGroupStatus>> {
        let status = self
            .state
            .reader()
            .asset_group_statuses(command_id)?
            .into_iter()
            .find(|s| &s.agent_id == agent_id && &s.asset_group_id == asset_group_id);
        Ok(status)
    }

    pub fn is_asset_group_complete(
        &self,
        command_id: &CommandId,
        agent_id: &AgentId,
        asset_group_id: &AssetGroupId,
    ) -> Result<bool> {
        Ok(self
            .asset_group_status(command_id, agent_id, asset_group_id)?
            .is_some_and(|s| s.is_complete()))
    }

    pub fn is_globally_complete(&self, command_id: &CommandId) -> Result<bool> {
        Ok(self.command_status(command_id)?.is_globally_complete)
    }

    /// Polls until the asset group completes. Defaults to a 60s deadline.
    pub async fn wait_for_asset_group_completion(
        &self,
        command_id: &CommandId,
        agent_id: &AgentId,
        asset_group_id: &AssetGroupId,
        timeout: Option<Duration>,
    ) -> Result<AssetGroupStatus> {
        let backoff =
            PollBackoff::with_timeout(timeout.unwrap_or(ASSET_GROUP_COMPLETION_TIMEOUT));
        let status = poll_until(backoff, || {
            let result = self
                .asset_group_status(command_id, agent_id, asset_group_id)
                .map(|s| s.filter(|s| s.is_complete()))
                .map_err(anyhow::Error::from);
            async move { result }
        })
        .await?;
        debug!(
            command_id = command_id.get(),
            asset_group_id = asset_group_id.get(),
            "asset group completed"
        );
        Ok(status)
    }

    /// Polls until every ingested asset group of the command completes.
    /// Defaults to a 600s deadline.
    pub async fn wait_for_global_completion(
        &self,
        command_id: &CommandId,
        timeout: Option<Duration>,
    ) -> Result<CommandStatusResponse> {
        let backoff = PollBackoff::with_timeout(timeout.unwrap_or(GLOBAL_COMPLETION_TIMEOUT));
        let status = poll_until(backoff, || {
            let result = self
                .command_status(command_id)
                .map(|s| Some(s).filter(|s| s.is_globally_complete))
                .map_err(anyhow::Error::from);
            async move { result }
        })
        .await?;
        Ok(status)
    }
}

fn status_for(
    reader: &StateReader,
    command_id: &CommandId,
    include_asset_group_statuses: bool,
) -> Result<Option<CommandStatusResponse>> {
    let Some(command) = reader.get_command(command_id)? else {
        return Ok(None);
    };
    let history = reader.get_command_history(command_id)?;
    let statuses = reader.asset_group_statuses(command_id)?;
    Ok(Some(CommandStatusResponse::from_command(
        &command,
        history.as_ref(),
        statuses,
        include_asset_group_statuses,
    )))
}

fn statuses_for(
    reader: &StateReader,
    command_ids: Vec<CommandId>,
) -> Result<Vec<CommandStatusResponse>> {
    let mut responses = Vec::with_capacity(command_ids.len());
    for command_id in command_ids {
        if let Some(status) = status_for(reader, &command_id, false)? {
            responses.push(status);
        }
    }
    responses.sort_by_key(|s| s.created_time);
    Ok(responses)
}
