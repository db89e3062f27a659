use std::sync::Arc;

use anyhow::Result;
use data_model::{Agent, PrivacyCommand};
use tempfile::TempDir;

use crate::{
    requests::{
        CommandTarget,
        PublishCommandRequest,
        RegisterAgentRequest,
        RequestPayload,
        StateMachineUpdateRequest,
    },
    CommandFeedState,
};

pub struct TestStateStore {
    pub state: Arc<CommandFeedState>,
    // dropping the dir removes the database
    _temp_dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = CommandFeedState::new(temp_dir.path().join("state")).await?;
        Ok(TestStateStore {
            state,
            _temp_dir: temp_dir,
        })
    }

    pub async fn register_agent(&self, agent: Agent) -> Result<()> {
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterAgent(RegisterAgentRequest { agent }),
            })
            .await
    }

    /// Publishes `command` to `(agent_id, asset_group_id)` targets.
    pub async fn publish(&self, command: &PrivacyCommand, targets: &[(&str, &str)]) -> Result<()> {
        let targets = targets
            .iter()
            .map(|(agent_id, asset_group_id)| CommandTarget {
                agent_id: (*agent_id).into(),
                asset_group_id: (*asset_group_id).into(),
            })
            .collect();
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::PublishCommand(PublishCommandRequest {
                    command: command.clone(),
                    targets,
                }),
            })
            .await
    }
}
