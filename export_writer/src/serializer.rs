use std::io::{self, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Frames export records in a file. Implementations append to `out`.
pub trait RecordSerializer: Send + Sync {
    fn write_file_prefix(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Written between two records.
    fn write_entry_delimiter(&self, out: &mut dyn Write) -> io::Result<()>;

    fn write_file_postfix(&self, out: &mut dyn Write) -> io::Result<()>;

    fn serialize(
        &self,
        time: DateTime<Utc>,
        correlation_id: &str,
        value: &Value,
        out: &mut dyn Write,
    ) -> io::Result<()>;

    /// Extension of the files this serializer produces.
    fn extension(&self) -> &'static str;
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A JSON array of `{"time", "correlationId", "properties"}` objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordSerializer;

impl JsonRecordSerializer {
    /// The record as one row string, ready for a writer.
    pub fn to_row(&self, time: DateTime<Utc>, correlation_id: &str, value: &Value) -> String {
        record(time, correlation_id, value).to_string()
    }
}

fn record(time: DateTime<Utc>, correlation_id: &str, value: &Value) -> Value {
    json!({
        "time": format_time(time),
        "correlationId": correlation_id,
        "properties": value,
    })
}

impl RecordSerializer for JsonRecordSerializer {
    fn write_file_prefix(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b"[")
    }

    fn write_entry_delimiter(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b",")
    }

    fn write_file_postfix(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b"]")
    }

    fn serialize(
        &self,
        time: DateTime<Utc>,
        correlation_id: &str,
        value: &Value,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        serde_json::to_writer(out, &record(time, correlation_id, value)).map_err(io::Error::from)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

/// One CSV row per record. Columns are the `/`-joined paths of the record's
/// nested properties, fixed up front because the header comes first.
#[derive(Debug, Clone, Default)]
pub struct CsvRecordSerializer {
    columns: Vec<String>,
}

impl CsvRecordSerializer {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Columns of `records` in first-seen order.
    pub fn for_records<'a>(records: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for value in records {
            for (path, _) in flatten(value) {
                if !columns.contains(&path) {
                    columns.push(path);
                }
            }
        }
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl RecordSerializer for CsvRecordSerializer {
    fn write_file_prefix(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut header = vec!["time".to_string(), "correlationId".to_string()];
        header.extend(self.columns.iter().map(|c| quote(c)));
        writeln!(out, "{}", header.join(","))
    }

    fn write_entry_delimiter(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn write_file_postfix(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn serialize(
        &self,
        time: DateTime<Utc>,
        correlation_id: &str,
        value: &Value,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let flat = flatten(value);
        let mut row = vec![quote(&format_time(time)), escape(correlation_id)];
        for column in &self.columns {
            let cell = flat
                .iter()
                .find(|(path, _)| path == column)
                .map(|(_, v)| cell(v))
                .unwrap_or_default();
            row.push(cell);
        }
        writeln!(out, "{}", row.join(","))
    }

    fn extension(&self) -> &'static str {
        "csv"
    }
}

/// Leaf values of `value` keyed by `/`-joined path. Array elements use their
/// index as the segment.
pub fn flatten(value: &Value) -> Vec<(String, Value)> {
    let mut leaves = Vec::new();
    flatten_into(value, String::new(), &mut leaves);
    leaves
}

fn flatten_into(value: &Value, path: String, leaves: &mut Vec<(String, Value)>) {
    let child = |segment: &str| {
        if path.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", path, segment)
        }
    };
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                flatten_into(v, child(key), leaves);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(v, child(&i.to_string()), leaves);
            }
        }
        leaf if path.is_empty() => leaves.push(("value".to_string(), leaf.clone())),
        leaf => leaves.push((path, leaf.clone())),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Quotes only when the text would break the row.
fn escape(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r', '/']) {
        quote(text)
    } else {
        text.to_string()
    }
}
