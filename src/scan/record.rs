//! Scan records and the recorder pipeline.
//!
//! A scan writes every record to an in-memory store and to each attached
//! [`Recorder`]. Recorders see a header when the scan starts, every record in
//! point order, and a footer when it ends.

use crate::error::{MacroError, MacroResult};
use crate::session::Session;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

/// One acquired point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub point_nb: usize,
    /// Seconds since the scan started
    pub dt: f64,
    pub positions: BTreeMap<String, f64>,
    pub values: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub refs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Value>,
    /// Back-filled from theory because the hardware never reported it
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl Record {
    /// Empty record for point `point_nb` taken `dt` seconds into the scan
    pub fn new(point_nb: usize, dt: f64) -> Self {
        Self {
            point_nb,
            dt,
            positions: BTreeMap::new(),
            values: BTreeMap::new(),
            refs: BTreeMap::new(),
            extras: BTreeMap::new(),
            synthetic: false,
        }
    }
}

/// Written once when a scan starts.
#[derive(Debug, Clone, Serialize)]
pub struct ScanHeader {
    pub serial: i64,
    pub title: String,
    pub motors: Vec<String>,
    pub channels: Vec<String>,
    pub started: DateTime<Local>,
    pub estimated_time: f64,
}

/// Written once when a scan ends.
#[derive(Debug, Clone, Serialize)]
pub struct ScanFooter {
    pub serial: i64,
    pub ended: DateTime<Local>,
    pub status: String,
    pub points: usize,
}

/// Sink for scan records.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Called once before the first record.
    async fn start(&mut self, header: &ScanHeader) -> Result<()>;

    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Called once after the last record, whatever the scan outcome.
    async fn end(&mut self, footer: &ScanFooter) -> Result<()>;
}

/// Broadcasts every record through the session.
pub struct SessionRecorder {
    session: Arc<dyn Session>,
}

impl SessionRecorder {
    /// Recorder forwarding to `session`
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Recorder for SessionRecorder {
    fn name(&self) -> &str {
        "session"
    }

    async fn start(&mut self, _header: &ScanHeader) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        self.session.send_record(record);
        Ok(())
    }

    async fn end(&mut self, _footer: &ScanFooter) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonLine<'a> {
    Header(&'a ScanHeader),
    Record(&'a Record),
    Footer(&'a ScanFooter),
}

/// Appends header, records and footer to a file as JSON lines.
pub struct JsonLinesRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesRecorder {
    /// Recorder appending to `path`; the file is opened when the scan starts.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    async fn write_line(&mut self, line: &JsonLine<'_>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .with_context(|| format!("Scan file {:?} is not open", self.path))?;
        let mut bytes = serde_json::to_vec(line).context("Failed to serialize scan line")?;
        bytes.push(b'\n');
        writer
            .write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write scan file {:?}", self.path))
    }
}

#[async_trait]
impl Recorder for JsonLinesRecorder {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn start(&mut self, header: &ScanHeader) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create scan directory at {:?}", dir))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open scan file at {:?}", self.path))?;
        self.writer = Some(BufWriter::new(file));
        info!(path = %self.path.display(), serial = header.serial, "JSON lines recorder started");
        self.write_line(&JsonLine::Header(header)).await
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        self.write_line(&JsonLine::Record(record)).await
    }

    async fn end(&mut self, footer: &ScanFooter) -> Result<()> {
        self.write_line(&JsonLine::Footer(footer)).await?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.context("Failed to flush scan file")?;
        }
        Ok(())
    }
}

/// In-memory record store plus attached recorders.
#[derive(Default)]
pub struct ScanData {
    records: Vec<Record>,
    recorders: Vec<Box<dyn Recorder>>,
}

impl ScanData {
    /// Empty store with no recorders
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a recorder; it sees every later record.
    pub fn add_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorders.push(recorder);
    }

    /// Names of the attached recorders
    pub fn recorder_names(&self) -> Vec<String> {
        self.recorders.iter().map(|r| r.name().to_string()).collect()
    }

    /// Start every recorder. A failing recorder fails the scan setup.
    pub async fn start(&mut self, header: &ScanHeader) -> MacroResult<()> {
        for recorder in &mut self.recorders {
            recorder.start(header).await.map_err(|e| {
                MacroError::ScanSetup(format!("recorder '{}' failed to start: {:#}", recorder.name(), e))
            })?;
        }
        Ok(())
    }

    /// Store a record and hand it to every recorder.
    pub async fn add_record(&mut self, record: Record) -> MacroResult<()> {
        for recorder in &mut self.recorders {
            recorder.write(&record).await.map_err(|e| {
                MacroError::Scan(format!("recorder '{}' failed: {:#}", recorder.name(), e))
            })?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Close every recorder; failures are logged.
    pub async fn end(&mut self, footer: &ScanFooter) {
        for recorder in &mut self.recorders {
            if let Err(e) = recorder.end(footer).await {
                warn!(recorder = recorder.name(), error = %format!("{:#}", e), "recorder failed to close");
            }
        }
    }

    /// Records stored so far, in point order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True before the first record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> ScanHeader {
        ScanHeader {
            serial: 7,
            title: "ascan mot01 0 1 1 0.1".into(),
            motors: vec!["mot01".into()],
            channels: vec!["ct01".into()],
            started: Local::now(),
            estimated_time: 0.2,
        }
    }

    #[tokio::test]
    async fn test_jsonl_recorder_writes_header_records_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scans").join("scan.jsonl");
        let mut data = ScanData::new();
        data.add_recorder(Box::new(JsonLinesRecorder::new(&path)));

        data.start(&header()).await.unwrap();
        for i in 0..2 {
            let mut record = Record::new(i, i as f64 * 0.1);
            record.positions.insert("mot01".into(), i as f64);
            record.values.insert("ct01".into(), 1.0);
            data.add_record(record).await.unwrap();
        }
        data.end(&ScanFooter {
            serial: 7,
            ended: Local::now(),
            status: "Finished".into(),
            points: 2,
        })
        .await;

        let text = fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "header");
        assert_eq!(lines[1]["type"], "record");
        assert_eq!(lines[2]["point_nb"], 1);
        assert_eq!(lines[3]["status"], "Finished");
        assert!(lines[1].get("synthetic").is_none());
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_synthetic_flag_is_serialized_when_set() {
        let mut record = Record::new(3, 0.5);
        record.values.insert("ct01".into(), f64::NAN);
        record.synthetic = true;
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["synthetic"], true);
        assert!(json["values"]["ct01"].is_null());
    }
}
