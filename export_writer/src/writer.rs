use std::collections::BTreeMap;

use async_trait::async_trait;
use data_model::{AgentId, CommandId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{StorageFault, WriteError},
    file_data::{FileDataManager, FileDetails},
    status::{AbandonReason, WriterKind, WriterStatus},
};

/// Returned by a sink whose flush failed.
#[derive(Debug)]
pub struct FlushFailure {
    /// Code and details are recorded on the writer.
    pub code: String,
    pub details: String,
    pub abandon: Option<AbandonReason>,
    /// `None` when the failure is only logged.
    pub error: Option<WriteError>,
}

impl FlushFailure {
    pub fn from_fault(
        fault: &StorageFault,
        abandon: Option<AbandonReason>,
        error: Option<WriteError>,
    ) -> Self {
        Self {
            code: fault.code.clone(),
            details: fault.details(),
            abandon,
            error,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: String::new(),
            details: String::new(),
            abandon: None,
            error: Some(WriteError::Cancelled),
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(WriteError::Cancelled))
    }
}

/// Where a writer's rows end up.
#[async_trait]
pub trait WriterSink: Send {
    fn kind(&self) -> WriterKind;

    /// Reason the sink is unusable from the start, if any.
    fn initial_abandon(&self) -> Option<AbandonReason> {
        None
    }

    /// Writes the pending rows of one file and returns the bytes written.
    async fn flush_file(&mut self, file: &FileDataManager) -> Result<u64, FlushFailure>;

    /// Releases the destination. `complete` is false when the writer hit an
    /// error and partial output should be dropped.
    async fn close(&mut self, complete: bool) -> Result<(), FlushFailure>;
}

/// Buffers export rows per product id and hands them to a sink on threshold
/// breach, explicit flush, or close.
pub struct DataWriter {
    agent_id: AgentId,
    command_id: CommandId,
    file_name: String,
    files: BTreeMap<String, FileDataManager>,
    size: u64,
    row_count: u64,
    pending_size: u64,
    status: WriterStatus,
    last_error_code: Option<String>,
    last_error_details: Option<String>,
    disposed: bool,
    cancel: CancellationToken,
    sink: Box<dyn WriterSink>,
}

impl std::fmt::Debug for DataWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWriter")
            .field("command_id", &self.command_id)
            .field("agent_id", &self.agent_id)
            .field("status", &self.status)
            .field("size", &self.size)
            .field("row_count", &self.row_count)
            .field("pending_size", &self.pending_size)
            .finish()
    }
}

impl DataWriter {
    pub fn new(
        agent_id: AgentId,
        command_id: CommandId,
        file_name: &str,
        cancel: CancellationToken,
        sink: Box<dyn WriterSink>,
    ) -> Self {
        let status = match sink.initial_abandon() {
            Some(reason) => WriterStatus::abandoned(sink.kind(), reason),
            None => WriterStatus::new(sink.kind()),
        };
        Self {
            agent_id,
            command_id,
            file_name: file_name.to_string(),
            files: BTreeMap::new(),
            size: 0,
            row_count: 0,
            pending_size: 0,
            status,
            last_error_code: None,
            last_error_details: None,
            disposed: false,
            cancel,
            sink,
        }
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn pending_size(&self) -> u64 {
        self.pending_size
    }

    pub fn status(&self) -> WriterStatus {
        self.status
    }

    pub fn last_error_code(&self) -> Option<&str> {
        self.last_error_code.as_deref()
    }

    pub fn last_error_details(&self) -> Option<&str> {
        self.last_error_details.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// One entry per product id written so far.
    pub fn file_details(&self) -> Vec<FileDetails> {
        self.files.values().map(|f| f.details().clone()).collect()
    }

    /// Rows are counted but no longer buffered once the writer is abandoned
    /// or has recorded an error.
    pub fn is_in_error_state(&self) -> bool {
        self.status.is_abandoned() || self.last_error_code.is_some()
    }

    /// Buffers one row and returns the change in pending bytes, which is
    /// negative when the write triggered a flush.
    #[tracing::instrument(skip(self, json), fields(command_id = %self.command_id, len = json.len()))]
    pub async fn write(
        &mut self,
        product_id: &str,
        json: &str,
        pending_bytes_threshold: u64,
    ) -> Result<i64, WriteError> {
        self.ensure_live()?;
        if json.is_empty() {
            return Ok(0);
        }
        let only_stats = self.is_in_error_state();
        let file_name = self.file_name.clone();
        self.files
            .entry(product_id.to_string())
            .or_insert_with(|| FileDataManager::new(product_id, &file_name))
            .add_row(json, only_stats);
        // counted with the file, whatever the flush below does
        self.size += json.len() as u64;
        self.row_count += 1;

        if only_stats {
            return Ok(0);
        }
        let previous = self.pending_size;
        self.pending_size += json.len() as u64;
        if self.pending_size > pending_bytes_threshold {
            self.flush_pending().await?;
        }
        Ok(self.pending_size as i64 - previous as i64)
    }

    /// Flushes every product's pending rows. Returns the bytes written.
    pub async fn flush(&mut self) -> Result<u64, WriteError> {
        self.ensure_live()?;
        self.flush_pending().await
    }

    /// Flushes, then releases the destination. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), WriteError> {
        if self.disposed {
            return Ok(());
        }
        let flushed = self.flush_pending().await;
        let complete = flushed.is_ok() && !self.is_in_error_state();
        let closed = self.sink.close(complete).await;
        self.disposed = true;
        flushed?;
        if let Err(failure) = closed {
            if let Some(err) = self.record_failure(failure) {
                return Err(err);
            }
        }
        debug!(
            command_id = %self.command_id,
            status = %self.status,
            size = self.size,
            rows = self.row_count,
            "writer closed"
        );
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), WriteError> {
        if self.disposed {
            return Err(WriteError::Disposed);
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<u64, WriteError> {
        let mut written = 0;
        let product_ids: Vec<String> = self
            .files
            .iter()
            .filter(|(_, f)| f.has_pending())
            .map(|(id, _)| id.clone())
            .collect();
        for product_id in product_ids {
            if self.cancel.is_cancelled() {
                return Err(WriteError::Cancelled);
            }
            let Some(file) = self.files.get(&product_id) else {
                continue;
            };
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(WriteError::Cancelled),
                result = self.sink.flush_file(file) => result,
            };
            match result {
                Ok(bytes) => {
                    written += bytes;
                    if let Some(file) = self.files.get_mut(&product_id) {
                        self.pending_size = self.pending_size.saturating_sub(file.pending_bytes());
                        file.clear_pending();
                    }
                }
                Err(failure) if failure.is_cancelled() => return Err(WriteError::Cancelled),
                Err(failure) => {
                    self.discard_pending();
                    match self.record_failure(failure) {
                        Some(err) => return Err(err),
                        None => break,
                    }
                }
            }
        }
        Ok(written)
    }

    fn discard_pending(&mut self) {
        for file in self.files.values_mut() {
            file.clear_pending();
        }
        self.pending_size = 0;
    }

    fn record_failure(&mut self, failure: FlushFailure) -> Option<WriteError> {
        warn!(
            command_id = %self.command_id,
            agent_id = %self.agent_id,
            code = %failure.code,
            details = %failure.details,
            "export write failed"
        );
        if let Some(reason) = failure.abandon {
            self.status.abandon(reason);
        }
        self.last_error_code = Some(failure.code);
        self.last_error_details = Some(failure.details);
        failure.error
    }
}
