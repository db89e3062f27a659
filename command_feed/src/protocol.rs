use std::{sync::Arc, time::Duration};

use data_model::{
    Agent,
    AgentId,
    CheckpointStatus,
    CommandId,
    CommandType,
    DeferredDelete,
    DeliveredCommand,
    LeaseReceipt,
    PrivacyCommand,
    QueueEntry,
};
use feed_utils::{duration_to_ms, get_epoch_time_in_ms, MS_PER_DAY, MS_PER_SEC};
use rand::Rng;
use state_store::{
    requests::{
        CheckpointAction,
        CheckpointRequest,
        CommandTarget,
        LeaseCommandsRequest,
        LeaseUpdate,
        PublishCommandRequest,
        RegisterAgentRequest,
        RequestPayload,
        StateMachineUpdateRequest,
    },
    CommandFeedState,
    StateStoreError,
};
use tracing::{debug, info, warn};

use crate::{
    config::LeaseConfig,
    errors::{CommandFeedError, Result},
};

pub const MAX_AGENT_STATE_LEN: usize = 1024;
const MAX_AGE_OUT_EXTENSION_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CheckpointParams {
    pub command_id: CommandId,
    pub lease_receipt: String,
    pub status: CheckpointStatus,
    pub affected_row_count: Option<u64>,
    pub lease_extension_secs: Option<i64>,
    pub agent_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResponse {
    /// Set when the lease is still held, i.e. after a Pending checkpoint.
    pub lease_receipt: Option<String>,
    pub next_visible_time: Option<u64>,
    /// Set when the queue entry is removed later instead of inline.
    pub deferred_delete_delay: Option<Duration>,
}

struct Candidates {
    deliverable: Vec<(QueueEntry, PrivacyCommand)>,
    filtered: Vec<QueueEntry>,
}

/// Agent facing side of the feed: receive under a lease, then checkpoint.
pub struct CommandFeed {
    state: Arc<CommandFeedState>,
    config: LeaseConfig,
}

impl CommandFeed {
    pub fn new(state: Arc<CommandFeedState>, config: LeaseConfig) -> Self {
        Self { state, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub async fn register_agent(&self, agent: Agent) -> Result<()> {
        if agent.id.is_empty() {
            return Err(CommandFeedError::InvalidArgument(
                "agent id must not be empty".to_string(),
            ));
        }
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterAgent(RegisterAgentRequest { agent }),
            })
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, command, targets), fields(command_id = command.id.get()))]
    pub async fn publish(&self, command: PrivacyCommand, targets: Vec<CommandTarget>) -> Result<()> {
        if command.id.is_empty() {
            return Err(CommandFeedError::InvalidArgument(
                "command id must not be empty".to_string(),
            ));
        }
        if targets
            .iter()
            .any(|t| t.agent_id.is_empty() || t.asset_group_id.is_empty())
        {
            return Err(CommandFeedError::InvalidArgument(
                "publish targets need an agent id and an asset group id".to_string(),
            ));
        }
        info!(
            command_type = %command.command_type(),
            targets = targets.len(),
            "publishing command"
        );
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::PublishCommand(PublishCommandRequest { command, targets }),
            })
            .await?;
        Ok(())
    }

    /// Leases the next visible command for the agent, or the given command
    /// when `command_id` is set.
    #[tracing::instrument(skip(self), fields(agent_id = agent_id.get()))]
    pub async fn receive(
        &self,
        agent_id: &AgentId,
        command_id: Option<&CommandId>,
    ) -> Result<DeliveredCommand> {
        self.receive_one(agent_id, command_id, None).await
    }

    /// Leases `command_id` in place of `superseded_command_id`. The
    /// superseded command is discarded for this agent and never delivered.
    #[tracing::instrument(skip(self), fields(agent_id = agent_id.get()))]
    pub async fn receive_with_filtering(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
        superseded_command_id: &CommandId,
    ) -> Result<DeliveredCommand> {
        if command_id == superseded_command_id {
            return Err(CommandFeedError::InvalidArgument(format!(
                "command {} cannot supersede itself",
                command_id
            )));
        }
        self.receive_one(agent_id, Some(command_id), Some(superseded_command_id))
            .await
    }

    /// Leases up to `max_commands` visible commands in one transaction.
    #[tracing::instrument(skip(self), fields(agent_id = agent_id.get()))]
    pub async fn get_commands(
        &self,
        agent_id: &AgentId,
        max_commands: usize,
    ) -> Result<Vec<DeliveredCommand>> {
        let max_commands = max_commands.min(self.config.max_batch_size);
        if max_commands == 0 {
            return Ok(Vec::new());
        }
        let now = get_epoch_time_in_ms();
        let candidates = self.candidates(agent_id, None, now)?;
        let mut leases = Vec::new();
        let mut delivered = Vec::new();
        for (entry, command) in candidates.deliverable.into_iter().take(max_commands) {
            let (lease, command) = self.lease(entry, command, now)?;
            leases.push(lease);
            delivered.push(command);
        }
        if leases.is_empty() && candidates.filtered.is_empty() {
            return Ok(Vec::new());
        }
        let request = LeaseCommandsRequest {
            agent_id: agent_id.clone(),
            leases,
            superseded_command_id: None,
            filtered_entries: candidates.filtered,
        };
        match self.write_leases(request).await {
            Ok(()) => {
                debug!(count = delivered.len(), "leased command batch");
                Ok(delivered)
            }
            Err(CommandFeedError::NotFound { .. }) => {
                warn!("command batch lost a lease race, returning nothing");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn receive_one(
        &self,
        agent_id: &AgentId,
        command_id: Option<&CommandId>,
        superseded_command_id: Option<&CommandId>,
    ) -> Result<DeliveredCommand> {
        let now = get_epoch_time_in_ms();
        let candidates = self.candidates(agent_id, command_id, now)?;
        let next = candidates.deliverable.into_iter().next();
        let (leases, delivered) = match next {
            Some((entry, command)) => {
                let (lease, delivered) = self.lease(entry, command, now)?;
                (vec![lease], Some(delivered))
            }
            None => (Vec::new(), None),
        };
        if leases.is_empty() && candidates.filtered.is_empty() {
            return Err(CommandFeedError::NotFound {
                agent_id: agent_id.clone(),
            });
        }
        let request = LeaseCommandsRequest {
            agent_id: agent_id.clone(),
            leases,
            // only discard the superseded command once its replacement is out
            superseded_command_id: delivered
                .as_ref()
                .and(superseded_command_id.cloned()),
            filtered_entries: candidates.filtered,
        };
        self.write_leases(request).await?;
        delivered.ok_or_else(|| CommandFeedError::NotFound {
            agent_id: agent_id.clone(),
        })
    }

    /// Visible entries split into those that can be delivered and those the
    /// agent's honored variants filter out.
    fn candidates(
        &self,
        agent_id: &AgentId,
        command_id: Option<&CommandId>,
        now: u64,
    ) -> Result<Candidates> {
        let reader = self.state.reader();
        let agent = reader.get_agent(agent_id)?.unwrap_or_else(|| Agent {
            id: agent_id.clone(),
            ..Default::default()
        });
        let mut candidates = Candidates {
            deliverable: Vec::new(),
            filtered: Vec::new(),
        };
        for entry in reader.queue_entries_for_agent(agent_id, command_id, None)? {
            if !entry.is_visible(now) {
                continue;
            }
            let Some(command) = reader.get_command(&entry.command_id)? else {
                warn!(
                    command_id = entry.command_id.get(),
                    "queue entry without a command, skipping"
                );
                continue;
            };
            if command.is_expired(now) {
                debug!(command_id = command.id.get(), "skipping expired command");
                continue;
            }
            if let Some(variant) =
                agent.suppressing_variant(&entry.asset_group_id, &command.applicable_variants)
            {
                info!(
                    command_id = command.id.get(),
                    asset_group_id = entry.asset_group_id.get(),
                    variant_id = variant.get(),
                    "command filtered by variant at delivery"
                );
                candidates.filtered.push(entry);
                continue;
            }
            candidates.deliverable.push((entry, command));
        }
        Ok(candidates)
    }

    fn lease(
        &self,
        entry: QueueEntry,
        command: PrivacyCommand,
        now: u64,
    ) -> Result<(LeaseUpdate, DeliveredCommand)> {
        let leased = QueueEntry {
            etag: nanoid::nanoid!(),
            next_visible_time: now + duration_to_ms(self.config.default_lease_duration()),
            delivery_count: entry.delivery_count + 1,
            ..entry.clone()
        };
        let lease_receipt = leased.lease_receipt().encode()?;
        let delivered = DeliveredCommand {
            asset_group_id: leased.asset_group_id.clone(),
            lease_receipt: lease_receipt.clone(),
            lease_expires_at: leased.next_visible_time,
            agent_state: leased.agent_state.clone(),
            applicable_variants: command.applicable_variants.clone(),
            command,
        };
        Ok((
            LeaseUpdate {
                expected_etag: entry.etag,
                entry: leased,
                lease_receipt,
            },
            delivered,
        ))
    }

    async fn write_leases(&self, request: LeaseCommandsRequest) -> Result<()> {
        let agent_id = request.agent_id.clone();
        match self
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::LeaseCommands(request),
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(
                    StateStoreError::LeaseConflict(key) | StateStoreError::QueueEntryNotFound(key),
                ) = StateStoreError::from_anyhow(&err)
                {
                    debug!(key = key.as_str(), "queue entry taken by a concurrent lease");
                    return Err(CommandFeedError::NotFound { agent_id });
                }
                Err(err.into())
            }
        }
    }

    #[tracing::instrument(
        skip(self, params),
        fields(
            agent_id = agent_id.get(),
            command_id = params.command_id.get(),
            status = %params.status,
        )
    )]
    pub async fn checkpoint(
        &self,
        agent_id: &AgentId,
        params: CheckpointParams,
    ) -> Result<CheckpointResponse> {
        let now = get_epoch_time_in_ms();
        let receipt = self.validate_checkpoint(agent_id, &params, now)?;

        let reader = self.state.reader();
        let already_completed =
            || CommandFeedError::CommandAlreadyCompleted(params.command_id.clone());
        if reader
            .get_command_state(agent_id, &receipt.command_id)?
            .is_some_and(|s| s.is_complete)
        {
            return Err(already_completed());
        }
        let queue_key =
            QueueEntry::key_from(agent_id, &receipt.command_id, &receipt.asset_group_id);
        let entry = reader
            .get_queue_entry(&queue_key)?
            .ok_or_else(already_completed)?;
        if entry.is_parked() {
            return Err(already_completed());
        }
        if entry.etag != receipt.etag {
            return Err(CommandFeedError::LeaseReceiptConflict(
                params.command_id.clone(),
            ));
        }

        let mut response = CheckpointResponse {
            lease_receipt: None,
            next_visible_time: None,
            deferred_delete_delay: None,
        };
        let action = match params.status {
            CheckpointStatus::Pending => {
                let extension_ms = params
                    .lease_extension_secs
                    .map(|secs| secs.unsigned_abs() * MS_PER_SEC)
                    .unwrap_or_else(|| duration_to_ms(self.config.default_lease_duration()))
                    .min(MS_PER_DAY);
                let renewed = QueueEntry {
                    etag: nanoid::nanoid!(),
                    next_visible_time: entry.next_visible_time.max(now) + extension_ms,
                    agent_state: params.agent_state.clone().or(entry.agent_state.clone()),
                    ..entry.clone()
                };
                let lease_receipt = renewed.lease_receipt().encode()?;
                response.lease_receipt = Some(lease_receipt.clone());
                response.next_visible_time = Some(renewed.next_visible_time);
                CheckpointAction::Renew {
                    entry: renewed,
                    lease_receipt,
                }
            }
            CheckpointStatus::Complete => {
                let remaining = Duration::from_millis(entry.next_visible_time.saturating_sub(now));
                if remaining > self.config.deferred_delete_min_remaining() {
                    let delay = self.deferred_delete_delay(remaining);
                    response.deferred_delete_delay = Some(delay);
                    CheckpointAction::DeferDelete(DeferredDelete {
                        queue_key: queue_key.clone(),
                        etag: nanoid::nanoid!(),
                        due_at: now + duration_to_ms(delay),
                    })
                } else {
                    CheckpointAction::DeleteInline
                }
            }
            CheckpointStatus::Failed |
            CheckpointStatus::VerificationFailed |
            CheckpointStatus::UnexpectedCommand => {
                warn!("command checkpointed without completing");
                CheckpointAction::DeleteInline
            }
        };

        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::Checkpoint(CheckpointRequest {
                    agent_id: agent_id.clone(),
                    command_id: receipt.command_id.clone(),
                    asset_group_id: receipt.asset_group_id.clone(),
                    expected_etag: receipt.etag.clone(),
                    status: params.status,
                    affected_rows: params.affected_row_count,
                    action,
                }),
            })
            .await
            .map_err(|e| CommandFeedError::from_checkpoint_write(&params.command_id, e))?;

        if let Some(delay) = response.deferred_delete_delay {
            info!(delay_secs = delay.as_secs(), "checkpoint complete, delete deferred");
        }
        Ok(response)
    }

    /// Checks that need no storage access, in the order agents see them.
    fn validate_checkpoint(
        &self,
        agent_id: &AgentId,
        params: &CheckpointParams,
        now: u64,
    ) -> Result<LeaseReceipt> {
        if let Some(agent_state) = &params.agent_state {
            let length = agent_state.chars().count();
            if length > MAX_AGENT_STATE_LEN {
                return Err(CommandFeedError::AgentStateTooLong {
                    length,
                    limit: MAX_AGENT_STATE_LEN,
                });
            }
        }
        if let Some(extension) = params.lease_extension_secs {
            if extension < 0 {
                return Err(CommandFeedError::InvalidLeaseExtension(format!(
                    "extension must not be negative, got {}s",
                    extension
                )));
            }
        }
        let receipt = LeaseReceipt::parse(&params.lease_receipt)
            .map_err(|e| CommandFeedError::MalformedLeaseReceipt(e.to_string()))?;
        if let Some(extension) = params.lease_extension_secs {
            if receipt.command_type == CommandType::AgeOut &&
                extension >= MAX_AGE_OUT_EXTENSION_SECS
            {
                return Err(CommandFeedError::InvalidLeaseExtension(format!(
                    "age out commands cannot be extended by {}s",
                    extension
                )));
            }
            if extension.unsigned_abs() > self.config.max_lease_extension_secs {
                return Err(CommandFeedError::InvalidLeaseExtension(format!(
                    "extension {}s exceeds the maximum of {}s",
                    extension, self.config.max_lease_extension_secs
                )));
            }
        }
        if receipt.agent_id != *agent_id {
            return Err(CommandFeedError::LeaseReceiptAgentIdMismatch {
                agent_id: agent_id.clone(),
                receipt_agent_id: receipt.agent_id,
            });
        }
        if receipt.command_id != params.command_id {
            return Err(CommandFeedError::LeaseReceiptCommandIdMismatch {
                command_id: params.command_id.clone(),
                receipt_command_id: receipt.command_id,
            });
        }
        if now.saturating_sub(receipt.command_created_at) > receipt.command_type.ttl_ms() {
            return Err(CommandFeedError::CommandAlreadyExpired(
                receipt.command_id,
            ));
        }
        Ok(receipt)
    }

    /// min(remaining * 0.75, max) scaled by a uniform factor in (0, 1],
    /// never below the configured minimum.
    fn deferred_delete_delay(&self, remaining: Duration) -> Duration {
        let max_delay = Duration::from_secs(self.config.deferred_delete_max_delay_secs);
        let min_delay = Duration::from_secs(self.config.deferred_delete_min_delay_secs);
        let window = remaining.mul_f64(0.75).min(max_delay);
        let factor: f64 = rand::rng().random_range(f64::EPSILON..=1.0);
        window.mul_f64(factor).max(min_delay)
    }

    /// Looks a command up for an agent holding a lease on it. Returns `None`
    /// once the agent no longer has it queued. Never touches the lease.
    pub async fn query_command(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
        lease_receipt: &str,
    ) -> Result<Option<PrivacyCommand>> {
        let receipt = LeaseReceipt::parse(lease_receipt)
            .map_err(|e| CommandFeedError::MalformedLeaseReceipt(e.to_string()))?;
        if receipt.agent_id != *agent_id {
            return Err(CommandFeedError::LeaseReceiptAgentIdMismatch {
                agent_id: agent_id.clone(),
                receipt_agent_id: receipt.agent_id,
            });
        }
        if receipt.command_id != *command_id {
            return Err(CommandFeedError::LeaseReceiptCommandIdMismatch {
                command_id: command_id.clone(),
                receipt_command_id: receipt.command_id,
            });
        }
        let reader = self.state.reader();
        let queue_key = QueueEntry::key_from(agent_id, command_id, &receipt.asset_group_id);
        match reader.get_queue_entry(&queue_key)? {
            Some(entry) if !entry.is_parked() => Ok(reader.get_command(command_id)?),
            _ => Ok(None),
        }
    }

    /// Completes every outstanding asset group of the command. Only compiled
    /// into test builds.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn force_complete(&self, command_id: &CommandId) -> Result<()> {
        warn!(command_id = command_id.get(), "force completing command");
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::ForceComplete(
                    state_store::requests::ForceCompleteRequest {
                        command_id: command_id.clone(),
                    },
                ),
            })
            .await
            .map_err(|e| CommandFeedError::from_checkpoint_write(command_id, e))
    }
}
