use data_model::{
    Agent,
    AgentId,
    AssetGroupId,
    CheckpointStatus,
    CommandId,
    DeferredDelete,
    PrivacyCommand,
    QueueEntry,
};

pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    RegisterAgent(RegisterAgentRequest),
    PublishCommand(PublishCommandRequest),
    LeaseCommands(LeaseCommandsRequest),
    Checkpoint(CheckpointRequest),
    RemoveDeferredDeletes(Vec<DeferredDelete>),
    ForceComplete(ForceCompleteRequest),
    Noop,
}

#[derive(Debug, Clone)]
pub struct RegisterAgentRequest {
    pub agent: Agent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
}

#[derive(Debug, Clone)]
pub struct PublishCommandRequest {
    pub command: PrivacyCommand,
    pub targets: Vec<CommandTarget>,
}

/// A lease on a queue entry. `entry` is the entry as it should be stored
/// after the lease, `expected_etag` is the etag read before leasing. The
/// write fails with a conflict when the stored etag moved in between.
#[derive(Debug, Clone)]
pub struct LeaseUpdate {
    pub expected_etag: String,
    pub entry: QueueEntry,
    pub lease_receipt: String,
}

#[derive(Debug, Clone)]
pub struct LeaseCommandsRequest {
    pub agent_id: AgentId,
    pub leases: Vec<LeaseUpdate>,
    /// Command whose delivery to this agent is replaced by the leased one.
    pub superseded_command_id: Option<CommandId>,
    /// Entries filtered at delivery time. They are removed and their asset
    /// groups completed with no affected rows.
    pub filtered_entries: Vec<QueueEntry>,
}

#[derive(Debug, Clone)]
pub enum CheckpointAction {
    /// Pending: keep the entry with a new etag and visibility.
    Renew {
        entry: QueueEntry,
        lease_receipt: String,
    },
    DeleteInline,
    /// Complete with a long remaining lease: park the entry until the
    /// sweeper removes it.
    DeferDelete(DeferredDelete),
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub agent_id: AgentId,
    pub command_id: CommandId,
    pub asset_group_id: AssetGroupId,
    pub expected_etag: String,
    pub status: CheckpointStatus,
    pub affected_rows: Option<u64>,
    pub action: CheckpointAction,
}

#[derive(Debug, Clone)]
pub struct ForceCompleteRequest {
    pub command_id: CommandId,
}
