pub mod test_objects;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use derive_builder::Builder;
use feed_utils::{get_epoch_time_in_ms, MS_PER_DAY};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn get(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(CommandId);
string_id!(RequestId);
string_id!(AgentId);
string_id!(AssetGroupId);
string_id!(VariantId);

/// Identity the command acts on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subject {
    Msa {
        puid: u64,
    },
    Aad {
        object_id: String,
        tenant_id: String,
    },
    Aad2 {
        object_id: String,
        tenant_id: String,
        home_tenant_id: Option<String>,
    },
    Device {
        global_device_id: u64,
    },
}

impl Subject {
    /// Stable lookup key. AAD and AAD2 subjects share the object id space so
    /// a subject query matches either.
    pub fn key(&self) -> String {
        match self {
            Subject::Msa { puid } => format!("msa:{}", puid),
            Subject::Aad { object_id, .. } | Subject::Aad2 { object_id, .. } => {
                format!("aad:{}", object_id.to_lowercase())
            }
            Subject::Device { global_device_id } => format!("device:{}", global_device_id),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumString,
    strum::Display,
)]
pub enum CommandType {
    Delete,
    Export,
    AccountClose,
    AgeOut,
}

impl CommandType {
    /// How long a command of this type may stay in the feed.
    pub fn ttl_ms(&self) -> u64 {
        match self {
            CommandType::AccountClose => ACCOUNT_CLOSE_TTL_MS,
            _ => COMMAND_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRangePredicate {
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    Delete {
        time_range: TimeRangePredicate,
        data_type: Option<String>,
        data_type_predicate: Option<serde_json::Value>,
    },
    Export {
        data_types: Vec<String>,
        storage_uri: String,
    },
    AccountClose,
    AgeOut {
        is_suspended: bool,
        last_active_time: Option<u64>,
    },
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandPayload::Delete { .. } => CommandType::Delete,
            CommandPayload::Export { .. } => CommandType::Export,
            CommandPayload::AccountClose => CommandType::AccountClose,
            CommandPayload::AgeOut { .. } => CommandType::AgeOut,
        }
    }
}

pub const COMMAND_TTL_MS: u64 = 30 * MS_PER_DAY;
pub const ACCOUNT_CLOSE_TTL_MS: u64 = 90 * MS_PER_DAY;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct PrivacyCommand {
    pub id: CommandId,
    pub request_id: RequestId,
    pub subject: Subject,
    pub context: String,
    pub requester: String,
    pub correlation_vector: String,
    pub verifier: String,
    pub cloud_instance: String,
    pub is_synthetic: bool,
    /// Ordered; first match wins when a variant suppresses delivery.
    pub applicable_variants: Vec<VariantId>,
    pub payload: CommandPayload,
    pub created_at: u64,
}

impl PrivacyCommandBuilder {
    pub fn build(&mut self) -> Result<PrivacyCommand> {
        let subject = self.subject.clone().ok_or(anyhow!("subject is required"))?;
        let payload = self.payload.clone().ok_or(anyhow!("payload is required"))?;
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| CommandId::new(uuid::Uuid::new_v4().to_string()));
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| RequestId::new(uuid::Uuid::new_v4().to_string()));
        Ok(PrivacyCommand {
            id,
            request_id,
            subject,
            context: self.context.clone().unwrap_or_default(),
            requester: self.requester.clone().unwrap_or_default(),
            correlation_vector: self
                .correlation_vector
                .clone()
                .unwrap_or_else(|| nanoid::nanoid!()),
            verifier: self.verifier.clone().unwrap_or_default(),
            cloud_instance: self
                .cloud_instance
                .clone()
                .unwrap_or_else(|| "Public".to_string()),
            is_synthetic: self.is_synthetic.unwrap_or(false),
            applicable_variants: self.applicable_variants.clone().unwrap_or_default(),
            payload,
            created_at: self.created_at.unwrap_or_else(get_epoch_time_in_ms),
        })
    }
}

impl PrivacyCommand {
    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn export_destination(&self) -> Option<&str> {
        match &self.payload {
            CommandPayload::Export { storage_uri, .. } => Some(storage_uri),
            _ => None,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.command_type().ttl_ms()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.ttl_ms()
    }
}

/// A downstream consumer of commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Agent {
    pub id: AgentId,
    pub synthetic_capable: bool,
    /// Variants this agent applies itself, per asset group. A command carrying
    /// one of these is never delivered for that asset group.
    pub honored_variants: BTreeMap<AssetGroupId, BTreeSet<VariantId>>,
    pub created_at: u64,
}

impl Agent {
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn suppressing_variant<'a>(
        &self,
        asset_group_id: &AssetGroupId,
        variants: &'a [VariantId],
    ) -> Option<&'a VariantId> {
        let honored = self.honored_variants.get(asset_group_id)?;
        variants.iter().find(|v| honored.contains(*v))
    }
}

/// Opaque lease token handed to agents. Serialized as url-safe base64 of a
/// versioned json body so the server can validate a checkpoint without a
/// lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseReceipt {
    pub version: u32,
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub etag: String,
    pub expires_at: u64,
    pub command_type: CommandType,
    pub command_created_at: u64,
}

impl LeaseReceipt {
    pub const VERSION: u32 = 1;

    pub fn encode(&self) -> Result<String> {
        let body = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(body))
    }

    pub fn parse(receipt: &str) -> Result<Self> {
        let body = URL_SAFE_NO_PAD
            .decode(receipt.trim())
            .map_err(|e| anyhow!("lease receipt is not valid base64: {}", e))?;
        let lease: LeaseReceipt = serde_json::from_slice(&body)
            .map_err(|e| anyhow!("lease receipt body is malformed: {}", e))?;
        if lease.version != Self::VERSION {
            return Err(anyhow!("unsupported lease receipt version {}", lease.version));
        }
        Ok(lease)
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

/// The unit an agent leases: one command for one of its asset groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub agent_id: AgentId,
    pub command_id: CommandId,
    pub asset_group_id: AssetGroupId,
    pub command_type: CommandType,
    pub command_created_at: u64,
    /// Changes every time the entry is leased; receipts carry it.
    pub etag: String,
    pub next_visible_time: u64,
    pub agent_state: Option<String>,
    pub delivery_count: u32,
}

impl QueueEntry {
    pub const PARKED: u64 = u64::MAX;

    pub fn new(
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        command: &PrivacyCommand,
        now: u64,
    ) -> Self {
        Self {
            agent_id,
            command_id: command.id.clone(),
            asset_group_id,
            command_type: command.command_type(),
            command_created_at: command.created_at,
            etag: nanoid::nanoid!(),
            next_visible_time: now,
            agent_state: None,
            delivery_count: 0,
        }
    }

    pub fn key(&self) -> String {
        QueueEntry::key_from(&self.agent_id, &self.command_id, &self.asset_group_id)
    }

    pub fn key_from(
        agent_id: &AgentId,
        command_id: &CommandId,
        asset_group_id: &AssetGroupId,
    ) -> String {
        format!("{}|{}|{}", agent_id, command_id, asset_group_id)
    }

    pub fn key_prefix_for_agent(agent_id: &AgentId) -> String {
        format!("{}|", agent_id)
    }

    pub fn key_prefix_for_command(agent_id: &AgentId, command_id: &CommandId) -> String {
        format!("{}|{}|", agent_id, command_id)
    }

    pub fn is_visible(&self, now: u64) -> bool {
        self.next_visible_time <= now
    }

    /// Completed entries waiting for the deferred delete sweeper never become
    /// visible again.
    pub fn is_parked(&self) -> bool {
        self.next_visible_time == QueueEntry::PARKED
    }

    pub fn lease_receipt(&self) -> LeaseReceipt {
        LeaseReceipt {
            version: LeaseReceipt::VERSION,
            command_id: self.command_id.clone(),
            agent_id: self.agent_id.clone(),
            asset_group_id: self.asset_group_id.clone(),
            etag: self.etag.clone(),
            expires_at: self.next_visible_time,
            command_type: self.command_type,
            command_created_at: self.command_created_at,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
pub enum CheckpointStatus {
    Pending,
    Complete,
    Failed,
    VerificationFailed,
    UnexpectedCommand,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointStatus::Pending)
    }
}

/// Per agent and command bookkeeping. Never deleted, only marked terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandState {
    pub agent_id: AgentId,
    pub command_id: CommandId,
    pub lease_receipt: Option<String>,
    pub not_applicable: bool,
    pub is_complete: bool,
    pub ignore_command: bool,
    pub last_checkpoint: Option<CheckpointStatus>,
    pub updated_at: u64,
}

impl CommandState {
    pub fn new(agent_id: AgentId, command_id: CommandId) -> Self {
        Self {
            agent_id,
            command_id,
            updated_at: get_epoch_time_in_ms(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        CommandState::key_from(&self.agent_id, &self.command_id)
    }

    pub fn key_from(agent_id: &AgentId, command_id: &CommandId) -> String {
        format!("{}|{}", agent_id, command_id)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
pub enum IngestionAction {
    SendingToAgent,
    DroppedDueToFiltering,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetGroupStatus {
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub ingestion_time: Option<u64>,
    pub ingestion_action_taken: IngestionAction,
    pub completed_time: Option<u64>,
    pub affected_rows: Option<u64>,
    pub soft_delete_time: Option<u64>,
    pub force_completed: bool,
    pub last_checkpoint: Option<CheckpointStatus>,
}

impl AssetGroupStatus {
    pub fn ingested(
        command_id: CommandId,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        now: u64,
    ) -> Self {
        Self {
            command_id,
            agent_id,
            asset_group_id,
            ingestion_time: Some(now),
            ingestion_action_taken: IngestionAction::SendingToAgent,
            completed_time: None,
            affected_rows: None,
            soft_delete_time: None,
            force_completed: false,
            last_checkpoint: None,
        }
    }

    pub fn dropped(command_id: CommandId, agent_id: AgentId, asset_group_id: AssetGroupId) -> Self {
        Self {
            ingestion_time: None,
            ingestion_action_taken: IngestionAction::DroppedDueToFiltering,
            ..Self::ingested(command_id, agent_id, asset_group_id, 0)
        }
    }

    pub fn key(&self) -> String {
        AssetGroupStatus::key_from(&self.command_id, &self.agent_id, &self.asset_group_id)
    }

    pub fn key_from(
        command_id: &CommandId,
        agent_id: &AgentId,
        asset_group_id: &AssetGroupId,
    ) -> String {
        format!("{}|{}|{}", command_id, agent_id, asset_group_id)
    }

    pub fn key_prefix_for_command(command_id: &CommandId) -> String {
        format!("{}|", command_id)
    }

    pub fn key_prefix_for_agent(command_id: &CommandId, agent_id: &AgentId) -> String {
        format!("{}|{}|", command_id, agent_id)
    }

    pub fn is_ingested(&self) -> bool {
        self.ingestion_time.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_time.is_some()
    }

    /// Folds a lifecycle event into the row. Timestamps keep the earliest
    /// value seen so replays and out of order delivery converge. Returns
    /// whether anything changed.
    pub fn apply(&mut self, event: &CommandLifecycleEvent) -> bool {
        let mut changed = false;
        match &event.kind {
            LifecycleEventKind::Started => {
                changed |= keep_earliest(&mut self.ingestion_time, event.timestamp);
            }
            LifecycleEventKind::Completed {
                affected_rows,
                force_completed,
            } => {
                if keep_earliest(&mut self.completed_time, event.timestamp) {
                    self.affected_rows = *affected_rows;
                    self.force_completed = *force_completed;
                    changed = true;
                }
                changed |= keep_earliest(&mut self.ingestion_time, event.timestamp);
                changed |= self.record_checkpoint(CheckpointStatus::Complete);
            }
            LifecycleEventKind::SoftDeleted => {
                changed |= keep_earliest(&mut self.soft_delete_time, event.timestamp);
                changed |= keep_earliest(&mut self.ingestion_time, event.timestamp);
            }
            LifecycleEventKind::Pending => {
                changed |= self.record_checkpoint(CheckpointStatus::Pending);
            }
            LifecycleEventKind::Failed => {
                changed |= self.record_checkpoint(CheckpointStatus::Failed);
            }
            LifecycleEventKind::VerificationFailed => {
                changed |= self.record_checkpoint(CheckpointStatus::VerificationFailed);
            }
            LifecycleEventKind::Unexpected => {
                changed |= self.record_checkpoint(CheckpointStatus::UnexpectedCommand);
            }
            LifecycleEventKind::Dropped => {}
        }
        changed
    }

    fn record_checkpoint(&mut self, status: CheckpointStatus) -> bool {
        // a completed row keeps reporting Complete
        if self.is_complete() && status != CheckpointStatus::Complete {
            return false;
        }
        let changed = self.last_checkpoint != Some(status);
        self.last_checkpoint = Some(status);
        changed
    }
}

fn keep_earliest(slot: &mut Option<u64>, timestamp: u64) -> bool {
    match slot {
        Some(existing) if *existing <= timestamp => false,
        _ => {
            *slot = Some(timestamp);
            true
        }
    }
}

/// Every asset group that ingested the command has also completed it. Groups
/// that never ingested it do not count.
pub fn is_globally_complete<'a>(statuses: impl IntoIterator<Item = &'a AssetGroupStatus>) -> bool {
    statuses
        .into_iter()
        .all(|s| s.ingestion_time.is_none() || s.completed_time.is_some())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, strum::Display)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Started,
    Completed {
        affected_rows: Option<u64>,
        force_completed: bool,
    },
    SoftDeleted,
    Dropped,
    Pending,
    Failed,
    VerificationFailed,
    Unexpected,
}

impl LifecycleEventKind {
    pub fn from_checkpoint(status: CheckpointStatus, affected_rows: Option<u64>) -> Self {
        match status {
            CheckpointStatus::Pending => LifecycleEventKind::Pending,
            CheckpointStatus::Complete => LifecycleEventKind::Completed {
                affected_rows,
                force_completed: false,
            },
            CheckpointStatus::Failed => LifecycleEventKind::Failed,
            CheckpointStatus::VerificationFailed => LifecycleEventKind::VerificationFailed,
            CheckpointStatus::UnexpectedCommand => LifecycleEventKind::Unexpected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandLifecycleEvent {
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub timestamp: u64,
    pub kind: LifecycleEventKind,
}

impl CommandLifecycleEvent {
    pub fn new(
        command_id: CommandId,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        kind: LifecycleEventKind,
    ) -> Self {
        Self {
            command_id,
            agent_id,
            asset_group_id,
            timestamp: get_epoch_time_in_ms(),
            kind,
        }
    }
}

/// Cached per command counters, refreshed whenever an event lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandHistoryRecord {
    pub command_id: CommandId,
    pub total_command_count: u64,
    pub ingested_command_count: u64,
    pub completed_command_count: u64,
    pub completed_time: Option<u64>,
    pub created_at: u64,
}

impl CommandHistoryRecord {
    pub fn new(command_id: CommandId, created_at: u64) -> Self {
        Self {
            command_id,
            created_at,
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        self.command_id.to_string()
    }

    /// Recomputes the counters from the asset group rows and stamps the
    /// completion time the first time the command becomes globally complete.
    pub fn recount(&mut self, statuses: &[AssetGroupStatus], now: u64) {
        self.total_command_count = statuses.len() as u64;
        self.ingested_command_count = statuses.iter().filter(|s| s.is_ingested()).count() as u64;
        self.completed_command_count = statuses
            .iter()
            .filter(|s| s.is_ingested() && s.is_complete())
            .count() as u64;
        if self.completed_time.is_none() && is_globally_complete(statuses) {
            self.completed_time = Some(now);
        }
    }
}

/// Pointer used by the sweeper to remove queue entries whose delete was
/// deferred at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredDelete {
    pub queue_key: String,
    pub etag: String,
    pub due_at: u64,
}

impl DeferredDelete {
    pub fn key(&self) -> String {
        DeferredDelete::key_from(self.due_at, &self.queue_key)
    }

    // zero padded so lexicographic order is due time order
    pub fn key_from(due_at: u64, queue_key: &str) -> String {
        format!("{:020}|{}", due_at, queue_key)
    }

    pub fn key_upper_bound(now: u64) -> String {
        format!("{:020}|", now.saturating_add(1))
    }
}

/// What an agent gets back from a receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveredCommand {
    pub command: PrivacyCommand,
    pub asset_group_id: AssetGroupId,
    pub lease_receipt: String,
    pub lease_expires_at: u64,
    pub agent_state: Option<String>,
    pub applicable_variants: Vec<VariantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandStatusResponse {
    pub command_id: CommandId,
    pub command_type: CommandType,
    pub context: String,
    pub requester: String,
    pub subject: Subject,
    pub is_synthetic_command: bool,
    pub created_time: u64,
    pub completed_time: Option<u64>,
    pub asset_group_statuses: Vec<AssetGroupStatus>,
    pub is_globally_complete: bool,
    pub final_export_destination_uri: Option<String>,
}

impl CommandStatusResponse {
    pub fn from_command(
        command: &PrivacyCommand,
        history: Option<&CommandHistoryRecord>,
        statuses: Vec<AssetGroupStatus>,
        include_asset_group_statuses: bool,
    ) -> Self {
        let is_globally_complete = is_globally_complete(&statuses);
        Self {
            command_id: command.id.clone(),
            command_type: command.command_type(),
            context: command.context.clone(),
            requester: command.requester.clone(),
            subject: command.subject.clone(),
            is_synthetic_command: command.is_synthetic,
            created_time: command.created_at,
            completed_time: history.and_then(|h| h.completed_time),
            asset_group_statuses: if include_asset_group_statuses {
                statuses
            } else {
                Vec::new()
            },
            is_globally_complete,
            final_export_destination_uri: command.export_destination().map(|s| s.to_string()),
        }
    }
}
