use data_model::{AgentId, CommandId};
use state_store::StateStoreError;

#[derive(Debug, thiserror::Error)]
pub enum CommandFeedError {
    #[error("no command available for agent {agent_id}")]
    NotFound { agent_id: AgentId },

    #[error("command {0} not found")]
    CommandNotFound(CommandId),

    #[error("agent state is {length} characters long, limit is {limit}")]
    AgentStateTooLong { length: usize, limit: usize },

    #[error("invalid lease extension: {0}")]
    InvalidLeaseExtension(String),

    #[error("malformed lease receipt: {0}")]
    MalformedLeaseReceipt(String),

    #[error("lease receipt belongs to agent {receipt_agent_id}, not {agent_id}")]
    LeaseReceiptAgentIdMismatch {
        agent_id: AgentId,
        receipt_agent_id: AgentId,
    },

    #[error("lease receipt is for command {receipt_command_id}, not {command_id}")]
    LeaseReceiptCommandIdMismatch {
        command_id: CommandId,
        receipt_command_id: CommandId,
    },

    #[error("command {0} has expired")]
    CommandAlreadyExpired(CommandId),

    #[error("command {0} is already completed")]
    CommandAlreadyCompleted(CommandId),

    #[error("lease receipt for command {0} is no longer current")]
    LeaseReceiptConflict(CommandId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandFeedError {
    /// Maps the conflicts raised inside a checkpoint transaction onto the
    /// protocol errors an agent sees.
    pub(crate) fn from_checkpoint_write(command_id: &CommandId, err: anyhow::Error) -> Self {
        let mapped = match StateStoreError::from_anyhow(&err) {
            Some(StateStoreError::LeaseConflict(_)) => {
                Some(CommandFeedError::LeaseReceiptConflict(command_id.clone()))
            }
            Some(StateStoreError::QueueEntryNotFound(_)) => {
                Some(CommandFeedError::CommandAlreadyCompleted(command_id.clone()))
            }
            Some(StateStoreError::CommandNotFound(_)) => {
                Some(CommandFeedError::CommandNotFound(command_id.clone()))
            }
            None => None,
        };
        match mapped {
            Some(mapped) => mapped,
            None => CommandFeedError::Internal(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandFeedError>;
