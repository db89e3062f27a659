use std::collections::{BTreeMap, BTreeSet};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use command_feed::{CheckpointParams, CheckpointResponse, CommandFeedError};
use data_model::{
    Agent,
    AssetGroupId,
    CheckpointStatus,
    CommandId,
    CommandType,
    PrivacyCommand,
    VariantId,
};
use feed_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use state_store::requests::CommandTarget;
use tracing::error;

pub const CHECKPOINT_DELAY_HEADER: &str = "X-NonTransactional-Checkpoint-Delay";

#[derive(Debug)]
pub struct CommandFeedApiError {
    status_code: StatusCode,
    message: String,
}

impl CommandFeedApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", e))
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for CommandFeedApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<CommandFeedError> for CommandFeedApiError {
    fn from(e: CommandFeedError) -> Self {
        let status_code = match &e {
            CommandFeedError::NotFound { .. } => StatusCode::NO_CONTENT,
            CommandFeedError::CommandNotFound(_) => StatusCode::NOT_FOUND,
            CommandFeedError::AgentStateTooLong { .. } |
            CommandFeedError::InvalidLeaseExtension(_) |
            CommandFeedError::MalformedLeaseReceipt(_) |
            CommandFeedError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CommandFeedError::LeaseReceiptAgentIdMismatch { .. } |
            CommandFeedError::LeaseReceiptCommandIdMismatch { .. } => StatusCode::FORBIDDEN,
            CommandFeedError::CommandAlreadyExpired(_) => StatusCode::GONE,
            CommandFeedError::CommandAlreadyCompleted(_) |
            CommandFeedError::LeaseReceiptConflict(_) => StatusCode::CONFLICT,
            CommandFeedError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

impl From<anyhow::Error> for CommandFeedApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal_error(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterAgent {
    #[serde(default)]
    pub synthetic_capable: bool,
    #[serde(default)]
    pub honored_variants: BTreeMap<AssetGroupId, BTreeSet<VariantId>>,
}

impl RegisterAgent {
    pub fn into_agent(self, agent_id: &str) -> Agent {
        Agent {
            id: agent_id.into(),
            synthetic_capable: self.synthetic_capable,
            honored_variants: self.honored_variants,
            created_at: get_epoch_time_in_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishTarget {
    pub agent_id: String,
    pub asset_group_id: String,
}

/// A command for asset groups of the path agent, plus targets on other
/// agents.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishCommand {
    pub command: PrivacyCommand,
    pub asset_group_ids: Vec<String>,
    #[serde(default)]
    pub additional_targets: Vec<PublishTarget>,
}

impl PublishCommand {
    pub fn targets(&self, agent_id: &str) -> Vec<CommandTarget> {
        self.asset_group_ids
            .iter()
            .map(|asset_group_id| CommandTarget {
                agent_id: agent_id.into(),
                asset_group_id: asset_group_id.as_str().into(),
            })
            .chain(self.additional_targets.iter().map(|t| CommandTarget {
                agent_id: t.agent_id.as_str().into(),
                asset_group_id: t.asset_group_id.as_str().into(),
            }))
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub command_id: Option<CommandId>,
    pub superseded_command_id: Option<CommandId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetCommandsRequest {
    pub max_commands: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub command_id: CommandId,
    pub lease_receipt: String,
    pub status: CheckpointStatus,
    pub affected_row_count: Option<u64>,
    pub lease_extension_secs: Option<i64>,
    pub agent_state: Option<String>,
}

impl From<CheckpointRequest> for CheckpointParams {
    fn from(request: CheckpointRequest) -> Self {
        CheckpointParams {
            command_id: request.command_id,
            lease_receipt: request.lease_receipt,
            status: request.status,
            affected_row_count: request.affected_row_count,
            lease_extension_secs: request.lease_extension_secs,
            agent_state: request.agent_state,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointResult {
    pub lease_receipt: Option<String>,
    pub next_visible_time: Option<u64>,
}

impl From<&CheckpointResponse> for CheckpointResult {
    fn from(response: &CheckpointResponse) -> Self {
        Self {
            lease_receipt: response.lease_receipt.clone(),
            next_visible_time: response.next_visible_time,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryCommandParams {
    pub lease_receipt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusQueryParams {
    pub command_type: Option<CommandType>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubjectQueryParams {
    pub subject: String,
    pub command_type: Option<CommandType>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ExportArchive {
    pub command_id: CommandId,
    pub key: String,
    pub entries: Vec<String>,
    pub size_bytes: u64,
}
