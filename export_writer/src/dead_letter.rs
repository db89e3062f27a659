use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{AgentId, CommandId};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    error::sanitize,
    file_data::FileDataManager,
    status::{AbandonReason, WriterKind},
    writer::{DataWriter, FlushFailure, WriterSink},
};

pub const DEAD_LETTER_DIR: &str = "deadletter";
pub const DEAD_LETTER_ERROR_CODE: &str = "DeadLetterWriteError";

/// Best-effort store for rows whose command state could not be found.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, path: &str, data: &[u8]) -> Result<()>;
}

/// Appends dead letters to files under a local directory.
#[derive(Debug, Clone)]
pub struct DiskDeadLetterStore {
    root: PathBuf,
}

impl DiskDeadLetterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl DeadLetterStore for DiskDeadLetterStore {
    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// `deadletter/<agent_id>/<command_id>/<file_name>`
pub fn dead_letter_path(agent_id: &AgentId, command_id: &CommandId, file_name: &str) -> String {
    [
        DEAD_LETTER_DIR,
        &path_segment(agent_id.get()),
        &path_segment(command_id.get()),
        &path_segment(file_name),
    ]
    .join("/")
}

fn path_segment(value: &str) -> String {
    value.replace(['/', '\\'], "_").replace("..", "_")
}

pub struct DeadLetterSink {
    store: Option<Arc<dyn DeadLetterStore>>,
    path: String,
}

impl DeadLetterSink {
    pub fn new(store: Option<Arc<dyn DeadLetterStore>>, path: String) -> Self {
        Self { store, path }
    }
}

#[async_trait]
impl WriterSink for DeadLetterSink {
    fn kind(&self) -> WriterKind {
        WriterKind::DeadLetter
    }

    fn initial_abandon(&self) -> Option<AbandonReason> {
        self.store
            .is_none()
            .then_some(AbandonReason::NoDeadLetter)
    }

    async fn flush_file(&mut self, file: &FileDataManager) -> Result<u64, FlushFailure> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let lines: String = file
            .pending_rows()
            .iter()
            .map(|row| format!("{}\t{}\n", file.product_id(), row))
            .collect();
        match store.append(&self.path, lines.as_bytes()).await {
            Ok(()) => Ok(lines.len() as u64),
            Err(err) => {
                warn!(path = %self.path, "dead letter append failed: {:?}", err);
                Err(FlushFailure {
                    code: DEAD_LETTER_ERROR_CODE.to_string(),
                    details: sanitize(&format!("{:#}", err)),
                    abandon: Some(AbandonReason::WriteError),
                    error: None,
                })
            }
        }
    }

    async fn close(&mut self, _complete: bool) -> Result<(), FlushFailure> {
        Ok(())
    }
}

impl DataWriter {
    /// Salvages rows of a command whose state is unknown. Without a store the
    /// writer only counts.
    pub fn dead_letter(
        agent_id: AgentId,
        command_id: CommandId,
        file_name: &str,
        cancel: CancellationToken,
        store: Option<Arc<dyn DeadLetterStore>>,
    ) -> Self {
        let path = dead_letter_path(&agent_id, &command_id, file_name);
        DataWriter::new(
            agent_id,
            command_id,
            file_name,
            cancel,
            Box::new(DeadLetterSink::new(store, path)),
        )
    }
}
