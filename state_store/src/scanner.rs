use std::sync::Arc;

use anyhow::Result;
use data_model::{
    Agent,
    AgentId,
    AssetGroupStatus,
    CommandHistoryRecord,
    CommandId,
    CommandState,
    CommandType,
    DeferredDelete,
    PrivacyCommand,
    QueueEntry,
};
use rocksdb::{Direction, IteratorMode, ReadOptions, TransactionDB};
use serde::de::DeserializeOwned;

use super::state_machine::{index_prefix, CommandFeedColumns};
use crate::serializer::{JsonEncode, JsonEncoder};

/// Read side of the state store. Prefix scans run on a RocksDB iterator,
/// which pins an implicit snapshot, so each scan is internally consistent.
pub struct StateReader {
    db: Arc<TransactionDB>,
}

impl StateReader {
    pub fn new(db: Arc<TransactionDB>) -> Self {
        Self { db }
    }

    pub fn get_from_cf<V>(
        &self,
        column: CommandFeedColumns,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = column.cf_db(&self.db)?;
        match self.db.get_cf(&cf_handle, key)? {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_raw_rows_from_cf_with_prefix(
        &self,
        key_prefix: &[u8],
        column: CommandFeedColumns,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf_handle = column.cf_db(&self.db)?;
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let iter = self.db.iterator_cf_opt(
            &cf_handle,
            read_options,
            IteratorMode::From(key_prefix, Direction::Forward),
        );

        let limit = limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for kv in iter {
            let (key, value) = kv?;
            if !key.starts_with(key_prefix) || items.len() >= limit {
                break;
            }
            items.push((key.to_vec(), value.to_vec()));
        }
        Ok(items)
    }

    pub fn get_rows_from_cf_with_prefix<V>(
        &self,
        key_prefix: &[u8],
        column: CommandFeedColumns,
        limit: Option<usize>,
    ) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        self.get_raw_rows_from_cf_with_prefix(key_prefix, column, limit)?
            .into_iter()
            .map(|(_, value)| JsonEncoder::decode::<V>(&value))
            .collect()
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>> {
        self.get_from_cf(CommandFeedColumns::Agents, agent_id.get())
    }

    pub fn get_command(&self, command_id: &CommandId) -> Result<Option<PrivacyCommand>> {
        self.get_from_cf(CommandFeedColumns::Commands, command_id.get())
    }

    pub fn get_command_history(
        &self,
        command_id: &CommandId,
    ) -> Result<Option<CommandHistoryRecord>> {
        self.get_from_cf(CommandFeedColumns::CommandHistory, command_id.get())
    }

    pub fn get_command_state(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
    ) -> Result<Option<CommandState>> {
        self.get_from_cf(
            CommandFeedColumns::CommandStates,
            CommandState::key_from(agent_id, command_id),
        )
    }

    pub fn get_queue_entry(&self, key: &str) -> Result<Option<QueueEntry>> {
        self.get_from_cf(CommandFeedColumns::QueueEntries, key)
    }

    /// Queue entries of an agent in key order, optionally restricted to one
    /// command.
    pub fn queue_entries_for_agent(
        &self,
        agent_id: &AgentId,
        command_id: Option<&CommandId>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueEntry>> {
        let prefix = match command_id {
            Some(command_id) => QueueEntry::key_prefix_for_command(agent_id, command_id),
            None => QueueEntry::key_prefix_for_agent(agent_id),
        };
        self.get_rows_from_cf_with_prefix(
            prefix.as_bytes(),
            CommandFeedColumns::QueueEntries,
            limit,
        )
    }

    pub fn asset_group_statuses(&self, command_id: &CommandId) -> Result<Vec<AssetGroupStatus>> {
        self.get_rows_from_cf_with_prefix(
            AssetGroupStatus::key_prefix_for_command(command_id).as_bytes(),
            CommandFeedColumns::AssetGroupStatuses,
            None,
        )
    }

    pub fn command_ids_for_requester(
        &self,
        requester: &str,
        command_type: Option<CommandType>,
    ) -> Result<Vec<CommandId>> {
        self.command_ids_from_index(CommandFeedColumns::RequesterIndex, requester, command_type)
    }

    pub fn command_ids_for_subject(
        &self,
        subject_key: &str,
        command_type: Option<CommandType>,
    ) -> Result<Vec<CommandId>> {
        self.command_ids_from_index(CommandFeedColumns::SubjectIndex, subject_key, command_type)
    }

    fn command_ids_from_index(
        &self,
        column: CommandFeedColumns,
        owner: &str,
        command_type: Option<CommandType>,
    ) -> Result<Vec<CommandId>> {
        let prefix = index_prefix(owner, command_type);
        let rows = self.get_raw_rows_from_cf_with_prefix(prefix.as_bytes(), column, None)?;
        let mut ids = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let key = String::from_utf8(key)?;
            if let Some((_, command_id)) = key.rsplit_once('|') {
                ids.push(CommandId::from(command_id));
            }
        }
        Ok(ids)
    }

    /// Deferred deletes due at or before `now`, oldest first.
    pub fn due_deferred_deletes(&self, now: u64, limit: usize) -> Result<Vec<DeferredDelete>> {
        let cf_handle = CommandFeedColumns::DeferredDeletes.cf_db(&self.db)?;
        let upper_bound = DeferredDelete::key_upper_bound(now);
        let iter = self.db.iterator_cf(&cf_handle, IteratorMode::Start);
        let mut items = Vec::new();
        for kv in iter {
            let (key, value) = kv?;
            if key.as_ref() >= upper_bound.as_bytes() || items.len() >= limit {
                break;
            }
            items.push(JsonEncoder::decode::<DeferredDelete>(&value)?);
        }
        Ok(items)
    }
}
