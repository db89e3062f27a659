use serde::{Deserialize, Serialize};

/// Per-product file bookkeeping reported back with the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileDetails {
    pub product_id: String,
    pub file_name: String,
    pub size: u64,
    pub row_count: u64,
}

/// Rows written for one product id, and the ones not yet flushed.
#[derive(Debug)]
pub struct FileDataManager {
    details: FileDetails,
    pending: Vec<String>,
    pending_bytes: u64,
}

impl FileDataManager {
    pub fn new(product_id: &str, file_name: &str) -> Self {
        Self {
            details: FileDetails {
                product_id: product_id.to_string(),
                file_name: file_name.to_string(),
                size: 0,
                row_count: 0,
            },
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    pub fn product_id(&self) -> &str {
        &self.details.product_id
    }

    pub fn file_name(&self) -> &str {
        &self.details.file_name
    }

    pub fn details(&self) -> &FileDetails {
        &self.details
    }

    /// Counts the row. Unless `only_stats`, the row is also kept for the
    /// next flush.
    pub fn add_row(&mut self, json: &str, only_stats: bool) {
        self.details.row_count += 1;
        self.details.size += json.len() as u64;
        if !only_stats {
            self.pending_bytes += json.len() as u64;
            self.pending.push(json.to_string());
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_rows(&self) -> &[String] {
        &self.pending
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}
