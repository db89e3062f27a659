use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use data_model::{
    Agent,
    AgentId,
    AssetGroupStatus,
    CommandHistoryRecord,
    CommandId,
    CommandLifecycleEvent,
    CommandState,
    CommandType,
    DeferredDelete,
    LifecycleEventKind,
    QueueEntry,
};
use feed_utils::{get_epoch_time_in_ms, OptionInspectNone};
use rocksdb::{
    AsColumnFamilyRef,
    BoundColumnFamily,
    Direction,
    IteratorMode,
    ReadOptions,
    Transaction,
    TransactionDB,
};
use serde::de::DeserializeOwned;
use strum::AsRefStr;
use tracing::{debug, info};

use super::serializer::{JsonEncode, JsonEncoder};
use crate::{
    requests::{
        CheckpointAction,
        CheckpointRequest,
        ForceCompleteRequest,
        LeaseCommandsRequest,
        PublishCommandRequest,
        RegisterAgentRequest,
    },
    StateStoreError,
};

#[derive(AsRefStr, strum::Display, strum::EnumIter, Debug, Clone, Copy)]
pub enum CommandFeedColumns {
    Agents,             //  AgentId -> Agent
    Commands,           //  CommandId -> PrivacyCommand
    QueueEntries,       //  Agent_Command_AssetGroup -> QueueEntry
    CommandStates,      //  Agent_Command -> CommandState
    AssetGroupStatuses, //  Command_Agent_AssetGroup -> AssetGroupStatus
    CommandHistory,     //  CommandId -> CommandHistoryRecord
    DeferredDeletes,    //  DueAt_QueueKey -> DeferredDelete
    RequesterIndex,     //  Requester_CommandType_CommandId -> Empty
    SubjectIndex,       //  SubjectKey_CommandType_CommandId -> Empty
}

impl CommandFeedColumns {
    pub fn cf_db<'a>(&self, db: &'a TransactionDB) -> Result<Arc<BoundColumnFamily<'a>>> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", self.as_ref());
            })
            .ok_or_else(|| anyhow!("column family {} not found", self.as_ref()))
    }
}

pub fn index_key(owner: &str, command_type: CommandType, command_id: &CommandId) -> String {
    format!("{}|{}|{}", owner, command_type, command_id)
}

pub fn index_prefix(owner: &str, command_type: Option<CommandType>) -> String {
    match command_type {
        Some(command_type) => format!("{}|{}|", owner, command_type),
        None => format!("{}|", owner),
    }
}

pub fn make_prefix_iterator<'a>(
    txn: &'a Transaction<TransactionDB>,
    cf_handle: &impl AsColumnFamilyRef,
    prefix: &'a [u8],
) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + 'a {
    let mut read_options = ReadOptions::default();
    read_options.set_readahead_size(4_194_304);
    let iter = txn.iterator_cf_opt(
        cf_handle,
        read_options,
        IteratorMode::From(prefix, Direction::Forward),
    );
    iter.map(|item| item.map_err(|e| anyhow!(e.to_string())))
        .take_while(move |item| match item {
            Ok((key, _)) => key.starts_with(prefix),
            Err(_) => true,
        })
}

fn txn_rows_with_prefix<V: DeserializeOwned>(
    txn: &Transaction<TransactionDB>,
    cf_handle: &impl AsColumnFamilyRef,
    prefix: &str,
) -> Result<Vec<V>> {
    let mut rows = Vec::new();
    for kv in make_prefix_iterator(txn, cf_handle, prefix.as_bytes()) {
        let (_, value) = kv?;
        rows.push(JsonEncoder::decode::<V>(&value)?);
    }
    Ok(rows)
}

fn get_for_update<V: DeserializeOwned>(
    txn: &Transaction<TransactionDB>,
    cf_handle: &impl AsColumnFamilyRef,
    key: &str,
) -> Result<Option<V>> {
    match txn.get_for_update_cf(cf_handle, key, true)? {
        Some(bytes) => Ok(Some(JsonEncoder::decode::<V>(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn register_agent(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &RegisterAgentRequest,
) -> Result<()> {
    let mut agent = req.agent.clone();
    if agent.created_at == 0 {
        agent.created_at = get_epoch_time_in_ms();
    }
    txn.put_cf(
        &CommandFeedColumns::Agents.cf_db(&db)?,
        agent.key(),
        JsonEncoder::encode(&agent)?,
    )?;
    Ok(())
}

pub(crate) fn publish_command(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &PublishCommandRequest,
) -> Result<()> {
    let command = &req.command;
    let commands_cf = CommandFeedColumns::Commands.cf_db(&db)?;
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let states_cf = CommandFeedColumns::CommandStates.cf_db(&db)?;
    let statuses_cf = CommandFeedColumns::AssetGroupStatuses.cf_db(&db)?;
    let agents_cf = CommandFeedColumns::Agents.cf_db(&db)?;
    let now = get_epoch_time_in_ms();

    if txn
        .get_for_update_cf(&commands_cf, command.key(), true)?
        .is_none()
    {
        txn.put_cf(&commands_cf, command.key(), JsonEncoder::encode(command)?)?;
        txn.put_cf(
            &CommandFeedColumns::RequesterIndex.cf_db(&db)?,
            index_key(&command.requester, command.command_type(), &command.id),
            b"",
        )?;
        txn.put_cf(
            &CommandFeedColumns::SubjectIndex.cf_db(&db)?,
            index_key(&command.subject.key(), command.command_type(), &command.id),
            b"",
        )?;
        let history = CommandHistoryRecord::new(command.id.clone(), command.created_at);
        txn.put_cf(
            &CommandFeedColumns::CommandHistory.cf_db(&db)?,
            history.key(),
            JsonEncoder::encode(&history)?,
        )?;
    }

    let mut events = Vec::with_capacity(req.targets.len());
    for target in &req.targets {
        let status_key =
            AssetGroupStatus::key_from(&command.id, &target.agent_id, &target.asset_group_id);
        if txn
            .get_for_update_cf(&statuses_cf, &status_key, true)?
            .is_some()
        {
            debug!(
                command_id = command.id.get(),
                agent_id = target.agent_id.get(),
                asset_group_id = target.asset_group_id.get(),
                "command already published to target"
            );
            continue;
        }
        let agent = get_for_update::<Agent>(txn, &agents_cf, target.agent_id.get())?
            .unwrap_or_else(|| Agent {
                id: target.agent_id.clone(),
                ..Default::default()
            });
        let state_key = CommandState::key_from(&target.agent_id, &command.id);
        let mut state = get_for_update::<CommandState>(txn, &states_cf, &state_key)?
            .unwrap_or_else(|| CommandState::new(target.agent_id.clone(), command.id.clone()));
        let agent_has_entries = make_prefix_iterator(
            txn,
            &queue_cf,
            QueueEntry::key_prefix_for_command(&target.agent_id, &command.id).as_bytes(),
        )
        .next()
        .is_some();

        let (status, kind) = if command.is_synthetic && !agent.synthetic_capable {
            state.ignore_command = true;
            (
                AssetGroupStatus::dropped(
                    command.id.clone(),
                    target.agent_id.clone(),
                    target.asset_group_id.clone(),
                ),
                LifecycleEventKind::Dropped,
            )
        } else if let Some(variant) =
            agent.suppressing_variant(&target.asset_group_id, &command.applicable_variants)
        {
            info!(
                command_id = command.id.get(),
                agent_id = target.agent_id.get(),
                asset_group_id = target.asset_group_id.get(),
                variant_id = variant.get(),
                "command filtered by variant"
            );
            if !agent_has_entries {
                state.not_applicable = true;
            }
            (
                AssetGroupStatus::dropped(
                    command.id.clone(),
                    target.agent_id.clone(),
                    target.asset_group_id.clone(),
                ),
                LifecycleEventKind::Dropped,
            )
        } else {
            let entry = QueueEntry::new(
                target.agent_id.clone(),
                target.asset_group_id.clone(),
                command,
                now,
            );
            txn.put_cf(&queue_cf, entry.key(), JsonEncoder::encode(&entry)?)?;
            state.not_applicable = false;
            state.ignore_command = false;
            (
                AssetGroupStatus::ingested(
                    command.id.clone(),
                    target.agent_id.clone(),
                    target.asset_group_id.clone(),
                    now,
                ),
                LifecycleEventKind::Started,
            )
        };
        state.updated_at = now;
        txn.put_cf(&statuses_cf, &status_key, JsonEncoder::encode(&status)?)?;
        txn.put_cf(&states_cf, &state_key, JsonEncoder::encode(&state)?)?;
        events.push(CommandLifecycleEvent::new(
            command.id.clone(),
            target.agent_id.clone(),
            target.asset_group_id.clone(),
            kind,
        ));
    }
    apply_lifecycle_events(db, txn, &events)
}

pub(crate) fn lease_commands(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &LeaseCommandsRequest,
) -> Result<()> {
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let states_cf = CommandFeedColumns::CommandStates.cf_db(&db)?;
    let now = get_epoch_time_in_ms();
    for lease in &req.leases {
        let key = lease.entry.key();
        let stored = get_for_update::<QueueEntry>(txn, &queue_cf, &key)?
            .ok_or_else(|| StateStoreError::QueueEntryNotFound(key.clone()))?;
        if stored.etag != lease.expected_etag {
            return Err(StateStoreError::LeaseConflict(key).into());
        }
        txn.put_cf(&queue_cf, &key, JsonEncoder::encode(&lease.entry)?)?;

        let state_key = CommandState::key_from(&lease.entry.agent_id, &lease.entry.command_id);
        let mut state = get_for_update::<CommandState>(txn, &states_cf, &state_key)?
            .unwrap_or_else(|| {
                CommandState::new(lease.entry.agent_id.clone(), lease.entry.command_id.clone())
            });
        state.lease_receipt = Some(lease.lease_receipt.clone());
        state.updated_at = now;
        txn.put_cf(&states_cf, &state_key, JsonEncoder::encode(&state)?)?;
    }

    if let Some(superseded) = &req.superseded_command_id {
        let prefix = QueueEntry::key_prefix_for_command(&req.agent_id, superseded);
        let entries: Vec<QueueEntry> = txn_rows_with_prefix(txn, &queue_cf, &prefix)?;
        discard_entries(db.clone(), txn, &req.agent_id, superseded, &entries)?;
    }
    let mut filtered: BTreeMap<CommandId, Vec<QueueEntry>> = BTreeMap::new();
    for entry in &req.filtered_entries {
        filtered
            .entry(entry.command_id.clone())
            .or_default()
            .push(entry.clone());
    }
    for (command_id, entries) in filtered {
        discard_entries(db.clone(), txn, &req.agent_id, &command_id, &entries)?;
    }
    Ok(())
}

/// Drops the given queue entries of `command_id` for the agent and completes
/// the matching asset groups with no affected rows. The command becomes not
/// applicable to the agent once no entry of it is left.
fn discard_entries(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    agent_id: &AgentId,
    command_id: &CommandId,
    entries: &[QueueEntry],
) -> Result<()> {
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let states_cf = CommandFeedColumns::CommandStates.cf_db(&db)?;
    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        txn.delete_cf(&queue_cf, entry.key())?;
        events.push(CommandLifecycleEvent::new(
            entry.command_id.clone(),
            entry.agent_id.clone(),
            entry.asset_group_id.clone(),
            LifecycleEventKind::Completed {
                affected_rows: Some(0),
                force_completed: false,
            },
        ));
    }
    info!(
        command_id = command_id.get(),
        agent_id = agent_id.get(),
        entries = events.len(),
        "discarded command delivery for agent"
    );

    let remaining = make_prefix_iterator(
        txn,
        &queue_cf,
        QueueEntry::key_prefix_for_command(agent_id, command_id).as_bytes(),
    )
    .next()
    .is_some();
    let state_key = CommandState::key_from(agent_id, command_id);
    let mut state = get_for_update::<CommandState>(txn, &states_cf, &state_key)?
        .unwrap_or_else(|| CommandState::new(agent_id.clone(), command_id.clone()));
    if !remaining {
        state.not_applicable = true;
        state.lease_receipt = None;
    }
    state.updated_at = get_epoch_time_in_ms();
    txn.put_cf(&states_cf, &state_key, JsonEncoder::encode(&state)?)?;

    apply_lifecycle_events(db, txn, &events)
}

pub(crate) fn checkpoint(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CheckpointRequest,
) -> Result<()> {
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let states_cf = CommandFeedColumns::CommandStates.cf_db(&db)?;
    let key = QueueEntry::key_from(&req.agent_id, &req.command_id, &req.asset_group_id);
    let stored = get_for_update::<QueueEntry>(txn, &queue_cf, &key)?
        .ok_or_else(|| StateStoreError::QueueEntryNotFound(key.clone()))?;
    if stored.etag != req.expected_etag {
        return Err(StateStoreError::LeaseConflict(key).into());
    }

    let state_key = CommandState::key_from(&req.agent_id, &req.command_id);
    let mut state = get_for_update::<CommandState>(txn, &states_cf, &state_key)?
        .unwrap_or_else(|| CommandState::new(req.agent_id.clone(), req.command_id.clone()));

    match &req.action {
        CheckpointAction::Renew {
            entry,
            lease_receipt,
        } => {
            txn.put_cf(&queue_cf, &key, JsonEncoder::encode(entry)?)?;
            state.lease_receipt = Some(lease_receipt.clone());
        }
        CheckpointAction::DeleteInline => {
            txn.delete_cf(&queue_cf, &key)?;
            state.lease_receipt = None;
        }
        CheckpointAction::DeferDelete(deferred) => {
            let parked = QueueEntry {
                etag: deferred.etag.clone(),
                next_visible_time: QueueEntry::PARKED,
                ..stored
            };
            txn.put_cf(&queue_cf, &key, JsonEncoder::encode(&parked)?)?;
            txn.put_cf(
                &CommandFeedColumns::DeferredDeletes.cf_db(&db)?,
                deferred.key(),
                JsonEncoder::encode(deferred)?,
            )?;
            state.lease_receipt = None;
        }
    }
    state.last_checkpoint = Some(req.status);
    state.updated_at = get_epoch_time_in_ms();
    txn.put_cf(&states_cf, &state_key, JsonEncoder::encode(&state)?)?;

    let event = CommandLifecycleEvent::new(
        req.command_id.clone(),
        req.agent_id.clone(),
        req.asset_group_id.clone(),
        LifecycleEventKind::from_checkpoint(req.status, req.affected_rows),
    );
    apply_lifecycle_events(db.clone(), txn, &[event])?;
    refresh_state_completion(db, txn, &req.agent_id, &req.command_id)
}

pub(crate) fn remove_deferred_deletes(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    deferred: &[DeferredDelete],
) -> Result<()> {
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let deferred_cf = CommandFeedColumns::DeferredDeletes.cf_db(&db)?;
    for item in deferred {
        txn.delete_cf(&deferred_cf, item.key())?;
        if let Some(entry) = get_for_update::<QueueEntry>(txn, &queue_cf, &item.queue_key)? {
            // the entry may have been replaced by a new publish since
            if entry.etag == item.etag {
                txn.delete_cf(&queue_cf, &item.queue_key)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn force_complete(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &ForceCompleteRequest,
) -> Result<()> {
    if txn
        .get_for_update_cf(
            &CommandFeedColumns::Commands.cf_db(&db)?,
            req.command_id.get(),
            true,
        )?
        .is_none()
    {
        return Err(StateStoreError::CommandNotFound(req.command_id.to_string()).into());
    }
    let queue_cf = CommandFeedColumns::QueueEntries.cf_db(&db)?;
    let statuses: Vec<AssetGroupStatus> = txn_rows_with_prefix(
        txn,
        &CommandFeedColumns::AssetGroupStatuses.cf_db(&db)?,
        &AssetGroupStatus::key_prefix_for_command(&req.command_id),
    )?;
    let mut events = Vec::new();
    let mut agents = BTreeSet::new();
    for status in statuses
        .iter()
        .filter(|s| s.is_ingested() && !s.is_complete())
    {
        txn.delete_cf(
            &queue_cf,
            QueueEntry::key_from(&status.agent_id, &status.command_id, &status.asset_group_id),
        )?;
        events.push(CommandLifecycleEvent::new(
            status.command_id.clone(),
            status.agent_id.clone(),
            status.asset_group_id.clone(),
            LifecycleEventKind::Completed {
                affected_rows: None,
                force_completed: true,
            },
        ));
        agents.insert(status.agent_id.clone());
    }
    info!(
        command_id = req.command_id.get(),
        asset_groups = events.len(),
        "force completing command"
    );
    apply_lifecycle_events(db.clone(), txn, &events)?;
    for agent_id in agents {
        refresh_state_completion(db.clone(), txn, &agent_id, &req.command_id)?;
    }
    Ok(())
}

/// Folds events into the asset group rows and refreshes the history record
/// of every command touched.
pub(crate) fn apply_lifecycle_events(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    events: &[CommandLifecycleEvent],
) -> Result<()> {
    let statuses_cf = CommandFeedColumns::AssetGroupStatuses.cf_db(&db)?;
    let mut touched = BTreeSet::new();
    for event in events {
        let key =
            AssetGroupStatus::key_from(&event.command_id, &event.agent_id, &event.asset_group_id);
        let Some(mut status) = get_for_update::<AssetGroupStatus>(txn, &statuses_cf, &key)? else {
            debug!(
                key = key.as_str(),
                kind = %event.kind,
                "lifecycle event for unknown asset group, skipping"
            );
            continue;
        };
        if status.apply(event) {
            txn.put_cf(&statuses_cf, &key, JsonEncoder::encode(&status)?)?;
        }
        touched.insert(event.command_id.clone());
    }

    let history_cf = CommandFeedColumns::CommandHistory.cf_db(&db)?;
    let now = get_epoch_time_in_ms();
    for command_id in touched {
        let statuses: Vec<AssetGroupStatus> = txn_rows_with_prefix(
            txn,
            &statuses_cf,
            &AssetGroupStatus::key_prefix_for_command(&command_id),
        )?;
        let mut history = get_for_update::<CommandHistoryRecord>(txn, &history_cf, command_id.get())?
            .unwrap_or_else(|| CommandHistoryRecord::new(command_id.clone(), now));
        let was_complete = history.completed_time.is_some();
        history.recount(&statuses, now);
        if !was_complete && history.completed_time.is_some() {
            info!(command_id = command_id.get(), "command globally complete");
        }
        txn.put_cf(&history_cf, history.key(), JsonEncoder::encode(&history)?)?;
    }
    Ok(())
}

/// A command is complete for an agent once every asset group it ingested
/// for that agent has completed.
fn refresh_state_completion(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    agent_id: &AgentId,
    command_id: &CommandId,
) -> Result<()> {
    let statuses: Vec<AssetGroupStatus> = txn_rows_with_prefix(
        txn,
        &CommandFeedColumns::AssetGroupStatuses.cf_db(&db)?,
        &AssetGroupStatus::key_prefix_for_agent(command_id, agent_id),
    )?;
    let ingested: Vec<&AssetGroupStatus> = statuses.iter().filter(|s| s.is_ingested()).collect();
    let is_complete = !ingested.is_empty() && ingested.iter().all(|s| s.is_complete());

    let states_cf = CommandFeedColumns::CommandStates.cf_db(&db)?;
    let state_key = CommandState::key_from(agent_id, command_id);
    let mut state = get_for_update::<CommandState>(txn, &states_cf, &state_key)?
        .unwrap_or_else(|| CommandState::new(agent_id.clone(), command_id.clone()));
    if state.is_complete != is_complete {
        state.is_complete = is_complete;
        state.updated_at = get_epoch_time_in_ms();
        txn.put_cf(&states_cf, &state_key, JsonEncoder::encode(&state)?)?;
    }
    Ok(())
}
