use std::{
    collections::BTreeMap,
    io::{Cursor, Write},
};

use anyhow::{anyhow, Result};
use blob_store::{BlobStorage, PutResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_model::{AgentId, AssetGroupId, CommandId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::serializer::{CsvRecordSerializer, RecordSerializer};

pub const AGENT_MAP_FILE_NAME: &str = "agentMap.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    Json,
    Csv,
}

/// Staged export files one agent wrote for one asset group.
#[derive(Debug, Clone)]
pub struct StagedSource {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub storage: BlobStorage,
    /// Directory of the staged files, relative to the store root.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentMapEntry {
    pub path: String,
    pub agent_id: String,
    pub asset_group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentMap {
    pub paths: Vec<AgentMapEntry>,
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    /// `<product_id>/<file_name>` under the source prefix.
    pub relative_path: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveSummary {
    pub source_count: usize,
    pub source_file_count: usize,
    pub total_source_bytes: u64,
    pub entries: Vec<String>,
    pub size_bytes: u64,
}

/// Assembles the user facing zip from staged export files.
#[derive(Debug, Clone, Default)]
pub struct ExportArchiveBuilder {
    format: ArchiveFormat,
}

impl ExportArchiveBuilder {
    pub fn new(format: ArchiveFormat) -> Self {
        Self { format }
    }

    /// Reads every staged file and stores the archive at `key` in
    /// `destination`.
    #[tracing::instrument(skip_all, fields(command_id = %command_id, key = %key))]
    pub async fn build(
        &self,
        command_id: &CommandId,
        sources: &[StagedSource],
        destination: &BlobStorage,
        key: &str,
    ) -> Result<(ArchiveSummary, PutResult)> {
        let mut files = Vec::new();
        for source in sources {
            let mut keys = source.storage.list(&source.prefix).await?;
            keys.sort();
            for staged_key in keys {
                let content = source.storage.read_bytes(&staged_key).await?;
                let relative_path = staged_key
                    .strip_prefix(source.prefix.trim_end_matches('/'))
                    .unwrap_or(&staged_key)
                    .trim_matches('/')
                    .to_string();
                files.push(StagedFile {
                    agent_id: source.agent_id.clone(),
                    asset_group_id: source.asset_group_id.clone(),
                    relative_path,
                    content,
                });
            }
        }

        let builder = self.clone();
        let source_count = sources.len();
        let (archive, mut summary) =
            tokio::task::spawn_blocking(move || builder.build_zip(files)).await??;
        summary.source_count = source_count;
        let put = destination.put_bytes(key, Bytes::from(archive)).await?;
        info!(
            key = %key,
            files = summary.source_file_count,
            size_bytes = put.size_bytes,
            "export archive written"
        );
        Ok((summary, put))
    }

    /// Zips `files` and appends the agent map.
    pub fn build_zip(&self, files: Vec<StagedFile>) -> Result<(Vec<u8>, ArchiveSummary)> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut paths = PathAssigner::default();
        let mut summary = ArchiveSummary::default();

        for file in files {
            summary.source_file_count += 1;
            summary.total_source_bytes += file.content.len() as u64;
            let path = paths.assign(&file.relative_path, &file.agent_id, &file.asset_group_id);
            let (path, content) = self.render(path, &file.content);
            zip.start_file(path.as_str(), options)?;
            zip.write_all(&content)?;
            summary.entries.push(path);
        }

        let agent_map = AgentMap {
            paths: paths.into_entries(),
        };
        zip.start_file(AGENT_MAP_FILE_NAME, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&agent_map)?)?;
        summary.entries.push(AGENT_MAP_FILE_NAME.to_string());

        let archive = zip.finish()?.into_inner();
        summary.size_bytes = archive.len() as u64;
        Ok((archive, summary))
    }

    /// Converts JSON entries to CSV when configured. Content that does not
    /// convert is kept as JSON.
    fn render(&self, path: String, content: &[u8]) -> (String, Vec<u8>) {
        let Some(stem) = path.strip_suffix(".json") else {
            return (path, content.to_vec());
        };
        if self.format != ArchiveFormat::Csv {
            return (path, content.to_vec());
        }
        match json_to_csv(content) {
            Ok(csv) => (format!("{}.csv", stem), csv),
            Err(err) => {
                warn!(path = %path, "keeping export entry as json: {:?}", err);
                (path, content.to_vec())
            }
        }
    }
}

/// Converts a staged JSON array of `{time, correlationId, properties}` records.
pub fn json_to_csv(content: &[u8]) -> Result<Vec<u8>> {
    let records: Vec<Value> = serde_json::from_slice(content)?;
    let mut parsed = Vec::with_capacity(records.len());
    for record in &records {
        let time = record
            .get("time")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record without time"))?;
        let time = DateTime::parse_from_rfc3339(time)?.with_timezone(&Utc);
        let correlation_id = record
            .get("correlationId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let properties = record.get("properties").unwrap_or(&Value::Null);
        parsed.push((time, correlation_id, properties));
    }

    let serializer = CsvRecordSerializer::for_records(parsed.iter().map(|(_, _, p)| *p));
    let mut out = Vec::new();
    serializer.write_file_prefix(&mut out)?;
    for (i, (time, correlation_id, properties)) in parsed.iter().enumerate() {
        if i > 0 {
            serializer.write_entry_delimiter(&mut out)?;
        }
        serializer.serialize(*time, correlation_id, properties, &mut out)?;
    }
    serializer.write_file_postfix(&mut out)?;
    Ok(out)
}

/// Gives each (agent, asset group) its own top level directory. A directory
/// already taken by another source gets a numeric suffix.
#[derive(Default)]
struct PathAssigner {
    owners: BTreeMap<String, (AgentId, AssetGroupId)>,
    assigned: BTreeMap<(AgentId, AssetGroupId, String), String>,
}

impl PathAssigner {
    fn assign(
        &mut self,
        relative_path: &str,
        agent_id: &AgentId,
        asset_group_id: &AssetGroupId,
    ) -> String {
        let (dir, rest) = relative_path.split_once('/').unwrap_or(("", relative_path));
        let dir = if dir.is_empty() { "Miscellaneous" } else { dir };
        let source_key = (agent_id.clone(), asset_group_id.clone(), dir.to_string());
        if let Some(existing) = self.assigned.get(&source_key) {
            return format!("{}/{}", existing, rest);
        }

        let owner = (agent_id.clone(), asset_group_id.clone());
        let mut candidate = dir.to_string();
        let mut n = 0;
        while self.owners.get(&candidate).is_some_and(|o| o != &owner) {
            n += 1;
            candidate = format!("{}_{}", dir, n);
        }
        self.owners.insert(candidate.clone(), owner);
        self.assigned.insert(source_key, candidate.clone());
        format!("{}/{}", candidate, rest)
    }

    fn into_entries(self) -> Vec<AgentMapEntry> {
        self.owners
            .into_iter()
            .map(|(path, (agent_id, asset_group_id))| AgentMapEntry {
                path,
                agent_id: agent_id.to_string(),
                asset_group_id: asset_group_id.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::serializer::JsonRecordSerializer;

    fn staged_json(rows: &[Value]) -> Bytes {
        let time = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 0).unwrap();
        let rows: Vec<String> = rows
            .iter()
            .map(|v| JsonRecordSerializer.to_row(time, "cv-1", v))
            .collect();
        Bytes::from(format!("[{}]", rows.join(",")))
    }

    fn read_entry(archive: &[u8], name: &str) -> String {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        text
    }

    async fn stage(
        storage: &BlobStorage,
        prefix: &str,
        agent_id: &str,
        asset_group_id: &str,
        files: &[(&str, Bytes)],
    ) -> Result<StagedSource> {
        for (name, content) in files {
            storage
                .put_bytes(&format!("{}/{}", prefix, name), content.clone())
                .await?;
        }
        Ok(StagedSource {
            agent_id: agent_id.into(),
            asset_group_id: asset_group_id.into(),
            storage: storage.clone(),
            prefix: prefix.to_string(),
        })
    }

    #[tokio::test]
    async fn test_archive_with_csv_entries_and_agent_map() -> Result<()> {
        let staging = BlobStorage::from_url("memory:///")?;
        let first = stage(
            &staging,
            "agent-1/cmd-1",
            "agent-1",
            "ag-1",
            &[(
                "12/BrowsingHistory.json",
                staged_json(&[json!({"url": "https://a", "visits": 2})]),
            )],
        )
        .await?;
        let second = stage(
            &staging,
            "agent-2/cmd-1",
            "agent-2",
            "ag-2",
            &[
                ("12/BrowsingHistory.json", staged_json(&[json!({"url": "b"})])),
                ("12/notes.txt", Bytes::from_static(b"free text")),
            ],
        )
        .await?;

        let destination = BlobStorage::from_url("memory:///")?;
        let builder = ExportArchiveBuilder::new(ArchiveFormat::Csv);
        let (summary, put) = builder
            .build(
                &"cmd-1".into(),
                &[first, second],
                &destination,
                "final/cmd-1.zip",
            )
            .await?;
        assert_eq!(summary.source_count, 2);
        assert_eq!(summary.source_file_count, 3);
        assert_eq!(
            summary.entries,
            vec![
                "12/BrowsingHistory.csv".to_string(),
                "12_1/BrowsingHistory.csv".to_string(),
                "12_1/notes.txt".to_string(),
                AGENT_MAP_FILE_NAME.to_string(),
            ]
        );

        let archive = destination.read_bytes("final/cmd-1.zip").await?;
        assert_eq!(archive.len() as u64, put.size_bytes);
        let csv = read_entry(&archive, "12/BrowsingHistory.csv");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "time,correlationId,\"url\",\"visits\"");
        assert_eq!(
            lines[1],
            "\"2024-06-15T13:45:00.000Z\",cv-1,\"https://a\",2"
        );
        assert_eq!(read_entry(&archive, "12_1/notes.txt"), "free text");

        let agent_map: AgentMap =
            serde_json::from_str(&read_entry(&archive, AGENT_MAP_FILE_NAME))?;
        assert_eq!(
            agent_map.paths,
            vec![
                AgentMapEntry {
                    path: "12".to_string(),
                    agent_id: "agent-1".to_string(),
                    asset_group_id: "ag-1".to_string(),
                },
                AgentMapEntry {
                    path: "12_1".to_string(),
                    agent_id: "agent-2".to_string(),
                    asset_group_id: "ag-2".to_string(),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_unconvertible_json_is_kept() -> Result<()> {
        let builder = ExportArchiveBuilder::new(ArchiveFormat::Csv);
        let (archive, summary) = builder.build_zip(vec![StagedFile {
            agent_id: "agent-1".into(),
            asset_group_id: "ag-1".into(),
            relative_path: "12/Raw.json".to_string(),
            content: Bytes::from_static(b"{\"not\": \"an array\"}"),
        }])?;
        assert_eq!(summary.entries[0], "12/Raw.json");
        assert_eq!(read_entry(&archive, "12/Raw.json"), "{\"not\": \"an array\"}");
        Ok(())
    }

    #[test]
    fn test_json_format_keeps_entries() -> Result<()> {
        let builder = ExportArchiveBuilder::new(ArchiveFormat::Json);
        let content = staged_json(&[json!({"q": "rust"})]);
        let (archive, summary) = builder.build_zip(vec![StagedFile {
            agent_id: "agent-1".into(),
            asset_group_id: "ag-1".into(),
            relative_path: "SearchHistory.json".to_string(),
            content: content.clone(),
        }])?;
        assert_eq!(summary.entries[0], "Miscellaneous/SearchHistory.json");
        let entry = read_entry(&archive, "Miscellaneous/SearchHistory.json");
        assert_eq!(entry.as_bytes(), &content[..]);
        Ok(())
    }
}
