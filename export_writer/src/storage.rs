use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use blob_store::{BlobAppender, BlobStorage};
use data_model::{AgentId, CommandId};
use tracing::{info, warn};

use crate::{
    config::TransientFailureMode,
    error::{PipelineError, StorageFault, WriteError},
    file_data::FileDataManager,
    serializer::{JsonRecordSerializer, RecordSerializer},
    status::{AbandonReason, WriterKind},
    writer::{FlushFailure, WriterSink},
};

/// Codes after which the destination will not recover.
const TERMINAL_CODES: &[&str] = &[
    "ContainerBeingDeleted",
    "ContainerDisabled",
    "ContainerNotFound",
    "AccountIsDisabled",
    "AuthenticationFailed",
    "InsufficientAccountPermissions",
    "InvalidAuthenticationInfo",
    "AuthorizationFailure",
    "403",
    "401",
];

/// Terminal only under `TransientFailureMode::AssumeNonTransient`.
const POSSIBLY_TERMINAL_CODES: &[&str] = &["NameResolutionFailure", "ProxyNameResolutionFailure"];

pub const TIMEOUT_ERROR_CODE: &str = "StorageError";
pub const TIMEOUT_ERROR_DETAILS: &str =
    "Timeout: Error queueing messages to writer (likely storage issue)";

pub fn is_terminal_code(code: &str, mode: TransientFailureMode) -> bool {
    let matches = |codes: &[&str]| codes.iter().any(|c| c.eq_ignore_ascii_case(code));
    matches(TERMINAL_CODES) ||
        (mode == TransientFailureMode::AssumeNonTransient && matches(POSSIBLY_TERMINAL_CODES))
}

/// Appends export data to per-file blobs of one command.
#[async_trait]
pub trait ExportPipeline: Send {
    /// Appends `data` to the product's file. Returns the bytes appended.
    async fn export(
        &mut self,
        product_id: &str,
        file_name: &str,
        data: &str,
    ) -> Result<u64, PipelineError>;

    /// Completes every open file.
    async fn finish(&mut self) -> Result<(), PipelineError>;

    /// Drops every open file without completing it.
    async fn abort(&mut self);
}

/// Builds the pipeline for an export command's destination.
pub trait ExportPipelineFactory: Send + Sync {
    fn create(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
        destination_uri: &str,
    ) -> anyhow::Result<Box<dyn ExportPipeline>>;
}

/// Sink of a storage backed writer.
pub struct StorageSink {
    pipeline: Box<dyn ExportPipeline>,
    mode: TransientFailureMode,
    append_timeout: Duration,
}

impl StorageSink {
    pub fn new(
        pipeline: Box<dyn ExportPipeline>,
        mode: TransientFailureMode,
        append_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            mode,
            append_timeout,
        }
    }

    fn handle_error(&self, err: PipelineError) -> FlushFailure {
        match err {
            PipelineError::Storage(fault) |
            PipelineError::Timeout {
                inner: Some(fault), ..
            } => self.handle_fault(&fault),
            PipelineError::Timeout { inner: None, .. } => FlushFailure {
                code: TIMEOUT_ERROR_CODE.to_string(),
                details: TIMEOUT_ERROR_DETAILS.to_string(),
                abandon: Some(AbandonReason::NoStorage),
                error: Some(WriteError::Terminal {
                    reason: AbandonReason::NoStorage,
                    details: TIMEOUT_ERROR_DETAILS.to_string(),
                }),
            },
            PipelineError::Cancelled => FlushFailure::cancelled(),
        }
    }

    fn handle_fault(&self, fault: &StorageFault) -> FlushFailure {
        if is_terminal_code(&fault.code, self.mode) {
            FlushFailure::from_fault(
                fault,
                Some(AbandonReason::NoStorage),
                Some(WriteError::Terminal {
                    reason: AbandonReason::NoStorage,
                    details: fault.details(),
                }),
            )
        } else {
            FlushFailure::from_fault(fault, None, Some(WriteError::Transient(fault.details())))
        }
    }
}

#[async_trait]
impl WriterSink for StorageSink {
    fn kind(&self) -> WriterKind {
        WriterKind::Storage
    }

    async fn flush_file(&mut self, file: &FileDataManager) -> Result<u64, FlushFailure> {
        let joined = file.pending_rows().join(",");
        let export = self
            .pipeline
            .export(file.product_id(), file.file_name(), &joined);
        match tokio::time::timeout(self.append_timeout, export).await {
            Ok(Ok(_)) => Ok(joined.len() as u64),
            Ok(Err(err)) => Err(self.handle_error(err)),
            Err(_) => Err(self.handle_error(PipelineError::Timeout {
                file_name: file.file_name().to_string(),
                inner: None,
            })),
        }
    }

    async fn close(&mut self, complete: bool) -> Result<(), FlushFailure> {
        if !complete {
            self.pipeline.abort().await;
            return Ok(());
        }
        match tokio::time::timeout(self.append_timeout, self.pipeline.finish()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.handle_error(err)),
            Err(_) => Err(self.handle_error(PipelineError::Timeout {
                file_name: String::new(),
                inner: None,
            })),
        }
    }
}

/// One multipart upload per file under
/// `<command_id>/<agent_id>/<product_id>/<file_name>`. Files are framed by the
/// record serializer, so a finished file is a complete document.
pub struct BlobExportPipeline {
    storage: BlobStorage,
    agent_id: AgentId,
    command_id: CommandId,
    framing: Arc<dyn RecordSerializer>,
    files: HashMap<String, BlobAppender>,
}

impl BlobExportPipeline {
    pub fn new(storage: BlobStorage, agent_id: AgentId, command_id: CommandId) -> Self {
        Self {
            storage,
            agent_id,
            command_id,
            framing: Arc::new(JsonRecordSerializer),
            files: HashMap::new(),
        }
    }

    /// Directory holding everything one agent staged for a command.
    pub fn staging_prefix(command_id: &CommandId, agent_id: &AgentId) -> String {
        format!("{}/{}", command_id, agent_id)
    }

    pub fn file_key(
        command_id: &CommandId,
        agent_id: &AgentId,
        product_id: &str,
        file_name: &str,
    ) -> String {
        format!(
            "{}/{}/{}",
            Self::staging_prefix(command_id, agent_id),
            product_id,
            file_name
        )
    }
}

#[async_trait]
impl ExportPipeline for BlobExportPipeline {
    async fn export(
        &mut self,
        product_id: &str,
        file_name: &str,
        data: &str,
    ) -> Result<u64, PipelineError> {
        let key = Self::file_key(&self.command_id, &self.agent_id, product_id, file_name);
        let mut chunk = Vec::with_capacity(data.len() + 1);
        let io_fault =
            |e: std::io::Error| StorageFault::new("Serializer", "IoError", e.to_string());
        if !self.files.contains_key(&key) {
            let appender = self
                .storage
                .start_append(&key)
                .await
                .map_err(|e| StorageFault::from_anyhow(&e))?;
            self.files.insert(key.clone(), appender);
            self.framing.write_file_prefix(&mut chunk).map_err(io_fault)?;
        } else {
            self.framing
                .write_entry_delimiter(&mut chunk)
                .map_err(io_fault)?;
        }
        chunk.extend_from_slice(data.as_bytes());
        let Some(appender) = self.files.get_mut(&key) else {
            return Err(StorageFault::new("BlobExportPipeline", "FileNotOpen", key).into());
        };
        appender
            .append(&chunk)
            .await
            .map_err(|e| StorageFault::from_anyhow(&e))?;
        Ok(chunk.len() as u64)
    }

    async fn finish(&mut self) -> Result<(), PipelineError> {
        let mut first_error = None;
        for (key, mut appender) in self.files.drain() {
            let mut postfix = Vec::new();
            if let Err(e) = self.framing.write_file_postfix(&mut postfix) {
                first_error.get_or_insert(StorageFault::new(
                    "Serializer",
                    "IoError",
                    e.to_string(),
                ));
                continue;
            }
            let result = match appender.append(&postfix).await {
                Ok(()) => appender.finish().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(put) => info!(
                    command_id = %self.command_id,
                    key = %key,
                    size_bytes = put.size_bytes,
                    "export file completed"
                ),
                Err(e) => {
                    warn!(
                        command_id = %self.command_id,
                        key = %key,
                        "failed to complete export file: {:?}", e
                    );
                    first_error.get_or_insert(StorageFault::from_anyhow(&e));
                }
            }
        }
        match first_error {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    async fn abort(&mut self) {
        for (key, appender) in self.files.drain() {
            if let Err(e) = appender.abort().await {
                warn!(
                    command_id = %self.command_id,
                    key = %key,
                    "failed to abort export file: {:?}", e
                );
            }
        }
    }
}

/// Opens a `BlobExportPipeline` on the command's export destination.
#[derive(Debug, Default, Clone)]
pub struct BlobExportPipelineFactory;

impl ExportPipelineFactory for BlobExportPipelineFactory {
    fn create(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
        destination_uri: &str,
    ) -> anyhow::Result<Box<dyn ExportPipeline>> {
        let storage = BlobStorage::from_url(destination_uri)?;
        Ok(Box::new(BlobExportPipeline::new(
            storage,
            agent_id.clone(),
            command_id.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::writer::DataWriter;

    #[derive(Clone, Default)]
    struct MockPipeline {
        exports: Arc<Mutex<Vec<(String, String, String)>>>,
        fail_with: Option<PipelineError>,
        hang: bool,
        finished: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
    }

    impl MockPipeline {
        fn failing(err: PipelineError) -> Self {
            Self {
                fail_with: Some(err),
                ..Default::default()
            }
        }

        fn exports(&self) -> Vec<(String, String, String)> {
            self.exports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExportPipeline for MockPipeline {
        async fn export(
            &mut self,
            product_id: &str,
            file_name: &str,
            data: &str,
        ) -> Result<u64, PipelineError> {
            self.exports.lock().unwrap().push((
                product_id.to_string(),
                file_name.to_string(),
                data.to_string(),
            ));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(data.len() as u64),
            }
        }

        async fn finish(&mut self) -> Result<(), PipelineError> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&mut self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn writer_with(pipeline: &MockPipeline, mode: TransientFailureMode) -> DataWriter {
        DataWriter::new(
            "agent-1".into(),
            "cmd-1".into(),
            "Browsing.json",
            CancellationToken::new(),
            Box::new(StorageSink::new(
                Box::new(pipeline.clone()),
                mode,
                Duration::from_secs(5),
            )),
        )
    }

    fn writer(pipeline: &MockPipeline) -> DataWriter {
        writer_with(pipeline, TransientFailureMode::AssumeTransient)
    }

    fn fault(code: &str) -> PipelineError {
        PipelineError::Storage(StorageFault::new("Blob", code, "request failed #42"))
    }

    #[tokio::test]
    async fn test_zero_threshold_flushes_every_write() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        let json = "{\"id\":1}";
        assert_eq!(writer.write("12", json, 0).await?, 0);
        assert_eq!(writer.size(), json.len() as u64);
        assert_eq!(writer.row_count(), 1);
        assert_eq!(writer.pending_size(), 0);
        assert_eq!(
            pipeline.exports(),
            vec![("12".to_string(), "Browsing.json".to_string(), json.to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_below_threshold_stays_pending() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        let json = "{\"id\":1}";
        let delta = writer.write("12", json, json.len() as u64 + 1).await?;
        assert_eq!(delta, json.len() as i64);
        assert_eq!(writer.pending_size(), json.len() as u64);
        assert!(pipeline.exports().is_empty());

        assert_eq!(writer.flush().await?, json.len() as u64);
        assert_eq!(writer.pending_size(), 0);
        assert_eq!(pipeline.exports().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_are_joined_on_flush() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        assert_eq!(writer.write("12", "json1", 6).await?, 5);
        assert_eq!(writer.write("12", "json2", 6).await?, -5);
        assert_eq!(writer.pending_size(), 0);
        assert_eq!(writer.size(), 10);
        assert_eq!(pipeline.exports()[0].2, "json1,json2");
        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_breach_on_third_row() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        let row = "0123456789";
        assert_eq!(writer.write("12", row, 25).await?, 10);
        assert_eq!(writer.write("12", row, 25).await?, 10);
        assert_eq!(writer.write("12", row, 25).await?, -20);
        assert_eq!(writer.pending_size(), 0);
        assert_eq!(writer.size(), 30);
        assert_eq!(writer.row_count(), 3);
        assert_eq!(pipeline.exports().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_details_per_product() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        writer.write("12", "aaa", 100).await?;
        writer.write("12", "bb", 100).await?;
        writer.write("7", "c", 100).await?;
        let details = writer.file_details();
        assert_eq!(details.len(), 2);
        let twelve = details.iter().find(|d| d.product_id == "12").unwrap();
        assert_eq!(twelve.row_count, 2);
        assert_eq!(twelve.size, 5);
        assert_eq!(twelve.file_name, "Browsing.json");

        // one export per product
        assert_eq!(writer.flush().await?, 7);
        assert_eq!(pipeline.exports().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_container_not_found_abandons_writer() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("ContainerNotFound"));
        let mut writer = writer(&pipeline);
        let err = writer.write("12", "{}", 0).await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::Terminal {
                reason: AbandonReason::NoStorage,
                ..
            }
        ));
        assert!(writer.status().has_reason(AbandonReason::NoStorage));
        assert_eq!(writer.last_error_code(), Some("ContainerNotFound"));
        assert_eq!(
            writer.last_error_details(),
            Some("Blob.ContainerNotFound: request failed -42")
        );
        assert_eq!(writer.pending_size(), 0);

        assert_eq!(writer.write("12", "{}", 0).await?, 0);
        assert_eq!(pipeline.exports().len(), 1);
        assert_eq!(writer.row_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_codes_ignore_case() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("authorizationfailure"));
        let mut writer = writer(&pipeline);
        assert!(matches!(
            writer.write("12", "{}", 0).await,
            Err(WriteError::Terminal { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_other_faults_are_transient() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("ServerBusy"));
        let mut writer = writer(&pipeline);
        let err = writer.write("12", "{}", 0).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!writer.status().is_abandoned());
        assert!(writer.is_in_error_state());
        assert_eq!(writer.last_error_code(), Some("ServerBusy"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_flush_still_counts_the_row() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("ServerBusy"));
        let mut writer = writer(&pipeline);
        let err = writer.write("12", "0123456789", 5).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(writer.row_count(), 1);
        assert_eq!(writer.size(), 10);
        assert_eq!(writer.pending_size(), 0);
        let details = writer.file_details();
        assert_eq!(details[0].row_count, writer.row_count());
        assert_eq!(details[0].size, writer.size());
        Ok(())
    }

    #[tokio::test]
    async fn test_name_resolution_depends_on_mode() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("NameResolutionFailure"));
        let mut transient = writer_with(&pipeline, TransientFailureMode::AssumeTransient);
        assert!(transient.write("12", "{}", 0).await.unwrap_err().is_transient());

        let mut terminal = writer_with(&pipeline, TransientFailureMode::AssumeNonTransient);
        assert!(matches!(
            terminal.write("12", "{}", 0).await,
            Err(WriteError::Terminal { .. })
        ));
        assert!(terminal.status().has_reason(AbandonReason::NoStorage));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_inner_error_is_terminal() -> anyhow::Result<()> {
        let pipeline = MockPipeline {
            hang: true,
            ..Default::default()
        };
        let mut writer = writer(&pipeline);
        let err = writer.write("12", "{}", 0).await.unwrap_err();
        assert!(matches!(err, WriteError::Terminal { .. }));
        assert_eq!(writer.last_error_code(), Some(TIMEOUT_ERROR_CODE));
        assert!(writer
            .last_error_details()
            .is_some_and(|d| d.starts_with("Timeout:")));
        assert!(writer.status().has_reason(AbandonReason::NoStorage));
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_uses_inner_error() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(PipelineError::Timeout {
            file_name: "Browsing.json".to_string(),
            inner: Some(StorageFault::new("Blob", "ServerBusy", "slow down")),
        });
        let mut writer = writer(&pipeline);
        assert!(writer.write("12", "{}", 0).await.unwrap_err().is_transient());
        assert_eq!(writer.last_error_code(), Some("ServerBusy"));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_flushes_then_disposes() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let mut writer = writer(&pipeline);
        writer.write("12", "{\"a\":1}", 1024).await?;
        writer.close().await?;
        assert_eq!(pipeline.exports().len(), 1);
        assert!(pipeline.finished.load(Ordering::SeqCst));
        assert!(writer.is_disposed());
        assert!(matches!(
            writer.write("12", "{}", 1024).await,
            Err(WriteError::Disposed)
        ));
        writer.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_after_failure_aborts_uploads() -> anyhow::Result<()> {
        let pipeline = MockPipeline::failing(fault("ServerBusy"));
        let mut writer = writer(&pipeline);
        let _ = writer.write("12", "{}", 0).await;
        writer.close().await?;
        assert!(pipeline.aborted.load(Ordering::SeqCst));
        assert!(!pipeline.finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_propagates() -> anyhow::Result<()> {
        let pipeline = MockPipeline::default();
        let cancel = CancellationToken::new();
        let mut writer = DataWriter::new(
            "agent-1".into(),
            "cmd-1".into(),
            "Browsing.json",
            cancel.clone(),
            Box::new(StorageSink::new(
                Box::new(pipeline.clone()),
                TransientFailureMode::AssumeTransient,
                Duration::from_secs(5),
            )),
        );
        writer.write("12", "{\"a\":1}", 1024).await?;
        cancel.cancel();
        assert!(matches!(writer.flush().await, Err(WriteError::Cancelled)));
        assert!(pipeline.exports().is_empty());
        assert_eq!(writer.row_count(), 1);
        assert!(writer.last_error_code().is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_append_keeps_counters() -> anyhow::Result<()> {
        let pipeline = MockPipeline {
            hang: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let mut writer = DataWriter::new(
            "agent-1".into(),
            "cmd-1".into(),
            "Browsing.json",
            cancel.clone(),
            Box::new(StorageSink::new(
                Box::new(pipeline.clone()),
                TransientFailureMode::AssumeTransient,
                Duration::from_secs(5),
            )),
        );
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = writer.write("12", "0123456789", 5).await;
        assert!(matches!(result, Err(WriteError::Cancelled)));
        assert_eq!(pipeline.exports().len(), 1);
        assert_eq!(writer.row_count(), 1);
        assert_eq!(writer.size(), 10);
        // the row was never written, so it is still pending
        assert_eq!(writer.pending_size(), 10);
        let details = writer.file_details();
        assert_eq!(details[0].row_count, 1);
        assert_eq!(details[0].size, 10);
        assert!(writer.last_error_code().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_blob_writer_runs_on_a_spawned_task() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(blob_store::BlobStorageConfig::new(
            temp_dir.path().to_str().unwrap(),
        ))?;
        let pipeline = BlobExportPipelineFactory.create(
            &"agent-1".into(),
            &"cmd-1".into(),
            &format!("file://{}", temp_dir.path().to_str().unwrap()),
        )?;
        let mut writer = DataWriter::new(
            "agent-1".into(),
            "cmd-1".into(),
            "Browsing.json",
            CancellationToken::new(),
            Box::new(StorageSink::new(
                pipeline,
                TransientFailureMode::AssumeTransient,
                Duration::from_secs(5),
            )),
        );
        let rows = tokio::spawn(async move {
            writer.write("12", "{\"a\":1}", 0).await?;
            writer.close().await?;
            Ok::<_, WriteError>(writer.row_count())
        })
        .await??;
        assert_eq!(rows, 1);

        let bytes = storage
            .read_bytes(&BlobExportPipeline::file_key(
                &"cmd-1".into(),
                &"agent-1".into(),
                "12",
                "Browsing.json",
            ))
            .await?;
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_blob_pipeline_writes_json_array() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(blob_store::BlobStorageConfig::new(
            temp_dir.path().to_str().unwrap(),
        ))?;
        let pipeline = BlobExportPipeline::new(storage.clone(), "agent-1".into(), "cmd-1".into());
        let mut writer = DataWriter::new(
            "agent-1".into(),
            "cmd-1".into(),
            "Browsing.json",
            CancellationToken::new(),
            Box::new(StorageSink::new(
                Box::new(pipeline),
                TransientFailureMode::AssumeTransient,
                Duration::from_secs(5),
            )),
        );
        writer.write("12", "{\"a\":1}", 1024).await?;
        writer.write("12", "{\"a\":2}", 1024).await?;
        writer.flush().await?;
        writer.write("12", "{\"a\":3}", 1024).await?;
        writer.close().await?;

        let bytes = storage
            .read_bytes(&BlobExportPipeline::file_key(
                &"cmd-1".into(),
                &"agent-1".into(),
                "12",
                "Browsing.json",
            ))
            .await?;
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["a"], 3);
        Ok(())
    }
}
