use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;

/// How storage codes that may or may not be permanent (DNS failures) are
/// treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientFailureMode {
    #[default]
    AssumeTransient,
    AssumeNonTransient,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportWriterConfig {
    pub transient_failure_mode: TransientFailureMode,
    /// Pending bytes a writer buffers before it flushes on its own.
    pub pending_bytes_threshold: u64,
    pub append_timeout_secs: u64,
    /// Entry format of the final export archive.
    pub archive_format: ArchiveFormat,
}

impl Default for ExportWriterConfig {
    fn default() -> Self {
        Self {
            transient_failure_mode: TransientFailureMode::AssumeTransient,
            pending_bytes_threshold: 1024 * 1024,
            append_timeout_secs: 60,
            archive_format: ArchiveFormat::Json,
        }
    }
}

impl ExportWriterConfig {
    pub fn append_timeout(&self) -> Duration {
        Duration::from_secs(self.append_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.append_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "append_timeout_secs must be greater than zero"
            ));
        }
        Ok(())
    }
}
