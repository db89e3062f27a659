use async_trait::async_trait;
use data_model::{AgentId, CommandId};
use tokio_util::sync::CancellationToken;

use crate::{
    file_data::FileDataManager,
    status::{AbandonReason, WriterKind},
    writer::{DataWriter, FlushFailure, WriterSink},
};

/// Counts rows and drops them.
pub struct NoOpSink {
    reason: AbandonReason,
}

impl NoOpSink {
    pub fn new(reason: AbandonReason) -> Self {
        Self { reason }
    }
}

#[async_trait]
impl WriterSink for NoOpSink {
    fn kind(&self) -> WriterKind {
        WriterKind::NoOp
    }

    fn initial_abandon(&self) -> Option<AbandonReason> {
        Some(self.reason)
    }

    async fn flush_file(&mut self, _file: &FileDataManager) -> Result<u64, FlushFailure> {
        Ok(0)
    }

    async fn close(&mut self, _complete: bool) -> Result<(), FlushFailure> {
        Ok(())
    }
}

impl DataWriter {
    pub fn no_op(
        agent_id: AgentId,
        command_id: CommandId,
        file_name: &str,
        cancel: CancellationToken,
        reason: AbandonReason,
    ) -> Self {
        DataWriter::new(
            agent_id,
            command_id,
            file_name,
            cancel,
            Box::new(NoOpSink::new(reason)),
        )
    }

    /// Like `no_op`, for a reason given as a status code. Only the general
    /// no-op reasons are accepted, anything else is `General`.
    pub fn no_op_with_code(
        agent_id: AgentId,
        command_id: CommandId,
        file_name: &str,
        cancel: CancellationToken,
        reason_code: &str,
    ) -> Self {
        Self::no_op(
            agent_id,
            command_id,
            file_name,
            cancel,
            AbandonReason::from_code(reason_code),
        )
    }
}
