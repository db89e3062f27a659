use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use requests::{RequestPayload, StateMachineUpdateRequest};
use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use state_machine::CommandFeedColumns;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tracing::{debug, info};

pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

/// Failures callers branch on. Everything else surfaces as a plain
/// `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("queue entry {0} not found")]
    QueueEntryNotFound(String),
    #[error("queue entry {0} was changed by another lease")]
    LeaseConflict(String),
    #[error("command {0} not found")]
    CommandNotFound(String),
}

impl StateStoreError {
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&StateStoreError> {
        err.downcast_ref::<StateStoreError>()
    }
}

pub struct CommandFeedState {
    pub db: Arc<TransactionDB>,
    pub deferred_delete_tx: watch::Sender<()>,
    pub deferred_delete_rx: watch::Receiver<()>,
    pub status_change_tx: watch::Sender<()>,
    pub status_change_rx: watch::Receiver<()>,
}

impl CommandFeedState {
    pub async fn new(path: PathBuf) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let sm_column_families = CommandFeedColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                path.clone(),
                sm_column_families,
            )
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        let (deferred_delete_tx, deferred_delete_rx) = watch::channel(());
        let (status_change_tx, status_change_rx) = watch::channel(());
        info!(path = %path.display(), "initialized command feed state store");
        Ok(Arc::new(Self {
            db,
            deferred_delete_tx,
            deferred_delete_rx,
            status_change_tx,
            status_change_rx,
        }))
    }

    pub fn get_deferred_delete_watcher(&self) -> watch::Receiver<()> {
        self.deferred_delete_rx.clone()
    }

    /// Fires whenever an asset group status may have changed.
    pub fn get_status_change_watcher(&self) -> watch::Receiver<()> {
        self.status_change_rx.clone()
    }

    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: StateMachineUpdateRequest) -> Result<()> {
        debug!("writing state machine update request");
        let txn = self.db.transaction();
        let mut statuses_changed = true;
        let mut deferred_scheduled = false;
        match &request.payload {
            RequestPayload::RegisterAgent(req) => {
                state_machine::register_agent(self.db.clone(), &txn, req)?;
                statuses_changed = false;
            }
            RequestPayload::PublishCommand(req) => {
                state_machine::publish_command(self.db.clone(), &txn, req)?;
            }
            RequestPayload::LeaseCommands(req) => {
                state_machine::lease_commands(self.db.clone(), &txn, req)?;
                statuses_changed =
                    req.superseded_command_id.is_some() || !req.filtered_entries.is_empty();
            }
            RequestPayload::Checkpoint(req) => {
                state_machine::checkpoint(self.db.clone(), &txn, req)?;
                deferred_scheduled =
                    matches!(req.action, requests::CheckpointAction::DeferDelete(_));
            }
            RequestPayload::RemoveDeferredDeletes(deferred) => {
                state_machine::remove_deferred_deletes(self.db.clone(), &txn, deferred)?;
                statuses_changed = false;
            }
            RequestPayload::ForceComplete(req) => {
                state_machine::force_complete(self.db.clone(), &txn, req)?;
            }
            RequestPayload::Noop => {
                statuses_changed = false;
            }
        }
        txn.commit()?;

        if deferred_scheduled {
            let _ = self.deferred_delete_tx.send(());
        }
        if statuses_changed {
            let _ = self.status_change_tx.send(());
        }
        Ok(())
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{
            mock_agent,
            mock_agent_honoring,
            mock_export_command,
            mock_synthetic_command,
            TEST_AGENT_ID,
            TEST_AGENT_ID_2,
            TEST_ASSET_GROUP_ID,
            TEST_ASSET_GROUP_ID_2,
        },
        AgentId,
        CheckpointStatus,
        IngestionAction,
        QueueEntry,
    };

    use super::*;
    use crate::{
        requests::{CheckpointAction, CheckpointRequest, ForceCompleteRequest, LeaseUpdate},
        test_state_store::TestStateStore,
    };

    #[tokio::test]
    async fn test_publish_creates_queue_entries_and_statuses() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        let command = mock_export_command();
        test_store
            .publish(
                &command,
                &[
                    (TEST_AGENT_ID, TEST_ASSET_GROUP_ID),
                    (TEST_AGENT_ID, TEST_ASSET_GROUP_ID_2),
                    (TEST_AGENT_ID_2, TEST_ASSET_GROUP_ID),
                ],
            )
            .await?;

        let reader = test_store.state.reader();
        let entries = reader.queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?;
        assert_eq!(entries.len(), 2);
        let statuses = reader.asset_group_statuses(&command.id)?;
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.ingestion_time.is_some()));
        let history = reader.get_command_history(&command.id)?.unwrap();
        assert_eq!(history.total_command_count, 3);
        assert_eq!(history.ingested_command_count, 3);
        assert_eq!(history.completed_time, None);

        let by_requester = reader.command_ids_for_requester(&command.requester, None)?;
        assert_eq!(by_requester, vec![command.id.clone()]);

        // publishing again does not duplicate anything
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        assert_eq!(reader.asset_group_statuses(&command.id)?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_synthetic_command_is_dropped() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        let command = mock_synthetic_command();
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        let reader = test_store.state.reader();
        assert!(reader
            .queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?
            .is_empty());
        let statuses = reader.asset_group_statuses(&command.id)?;
        assert_eq!(
            statuses[0].ingestion_action_taken,
            IngestionAction::DroppedDueToFiltering
        );
        assert_eq!(statuses[0].ingestion_time, None);
        let state = reader
            .get_command_state(&TEST_AGENT_ID.into(), &command.id)?
            .unwrap();
        assert!(state.ignore_command);
        Ok(())
    }

    #[tokio::test]
    async fn test_variant_suppresses_delivery() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        test_store
            .register_agent(mock_agent_honoring(TEST_AGENT_ID, TEST_ASSET_GROUP_ID, "v1"))
            .await?;
        let mut command = mock_export_command();
        command.applicable_variants = vec!["v1".into()];
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        let reader = test_store.state.reader();
        assert!(reader
            .queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?
            .is_empty());
        let state = reader
            .get_command_state(&TEST_AGENT_ID.into(), &command.id)?
            .unwrap();
        assert!(state.not_applicable);
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_conflict_on_stale_etag() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        test_store.register_agent(mock_agent(TEST_AGENT_ID)).await?;
        let command = mock_export_command();
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        let reader = test_store.state.reader();
        let entry = reader.queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?[0].clone();

        let leased = QueueEntry {
            etag: "etag-2".to_string(),
            next_visible_time: entry.next_visible_time + 1_000,
            ..entry.clone()
        };
        let lease = |expected: &str| RequestPayload::LeaseCommands(requests::LeaseCommandsRequest {
            agent_id: AgentId::from(TEST_AGENT_ID),
            leases: vec![LeaseUpdate {
                expected_etag: expected.to_string(),
                entry: leased.clone(),
                lease_receipt: leased.lease_receipt().encode().unwrap(),
            }],
            superseded_command_id: None,
            filtered_entries: vec![],
        });
        test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: lease(&entry.etag),
            })
            .await?;
        let err = test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: lease(&entry.etag),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            StateStoreError::from_anyhow(&err),
            Some(StateStoreError::LeaseConflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoint_complete_marks_state_and_status() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        let command = mock_export_command();
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        let reader = test_store.state.reader();
        let entry = reader.queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?[0].clone();
        test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::Checkpoint(CheckpointRequest {
                    agent_id: TEST_AGENT_ID.into(),
                    command_id: command.id.clone(),
                    asset_group_id: TEST_ASSET_GROUP_ID.into(),
                    expected_etag: entry.etag.clone(),
                    status: CheckpointStatus::Complete,
                    affected_rows: Some(12),
                    action: CheckpointAction::DeleteInline,
                }),
            })
            .await?;

        assert!(reader.get_queue_entry(&entry.key())?.is_none());
        let state = reader
            .get_command_state(&TEST_AGENT_ID.into(), &command.id)?
            .unwrap();
        assert!(state.is_complete);
        assert_eq!(state.last_checkpoint, Some(CheckpointStatus::Complete));
        let status = &reader.asset_group_statuses(&command.id)?[0];
        assert!(status.completed_time.is_some());
        assert_eq!(status.affected_rows, Some(12));
        assert!(reader
            .get_command_history(&command.id)?
            .unwrap()
            .completed_time
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_delete_parks_entry_until_removed() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        let command = mock_export_command();
        test_store
            .publish(&command, &[(TEST_AGENT_ID, TEST_ASSET_GROUP_ID)])
            .await?;
        let reader = test_store.state.reader();
        let entry = reader.queue_entries_for_agent(&TEST_AGENT_ID.into(), None, None)?[0].clone();
        let deferred = data_model::DeferredDelete {
            queue_key: entry.key(),
            etag: "parked".to_string(),
            due_at: 42,
        };
        let mut watcher = test_store.state.get_deferred_delete_watcher();
        watcher.borrow_and_update();
        test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::Checkpoint(CheckpointRequest {
                    agent_id: TEST_AGENT_ID.into(),
                    command_id: command.id.clone(),
                    asset_group_id: TEST_ASSET_GROUP_ID.into(),
                    expected_etag: entry.etag.clone(),
                    status: CheckpointStatus::Complete,
                    affected_rows: None,
                    action: CheckpointAction::DeferDelete(deferred.clone()),
                }),
            })
            .await?;
        assert!(watcher.has_changed()?);

        let parked = reader.get_queue_entry(&entry.key())?.unwrap();
        assert_eq!(parked.next_visible_time, u64::MAX);
        assert_eq!(reader.due_deferred_deletes(41, 10)?.len(), 0);
        let due = reader.due_deferred_deletes(42, 10)?;
        assert_eq!(due, vec![deferred]);

        test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RemoveDeferredDeletes(due),
            })
            .await?;
        assert!(reader.get_queue_entry(&entry.key())?.is_none());
        assert!(reader.due_deferred_deletes(u64::MAX - 1, 10)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_force_complete_completes_ingested_groups() -> Result<()> {
        let test_store = TestStateStore::new().await?;
        let command = mock_export_command();
        test_store
            .publish(
                &command,
                &[
                    (TEST_AGENT_ID, TEST_ASSET_GROUP_ID),
                    (TEST_AGENT_ID_2, TEST_ASSET_GROUP_ID_2),
                ],
            )
            .await?;
        test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::ForceComplete(ForceCompleteRequest {
                    command_id: command.id.clone(),
                }),
            })
            .await?;
        let reader = test_store.state.reader();
        let statuses = reader.asset_group_statuses(&command.id)?;
        assert!(statuses.iter().all(|s| s.force_completed && s.is_complete()));
        assert!(data_model::is_globally_complete(&statuses));
        assert!(reader
            .queue_entries_for_agent(&AgentId::from(TEST_AGENT_ID_2), None, None)?
            .is_empty());

        let err = test_store
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::ForceComplete(ForceCompleteRequest {
                    command_id: "missing".into(),
                }),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            StateStoreError::from_anyhow(&err),
            Some(StateStoreError::CommandNotFound(_))
        ));
        Ok(())
    }
}
