use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{IoContext, PipelineError, Result};
use crate::fsutil::write_json_atomic;
use crate::session::ProcessingStage;

/// Kind of work recorded in an album's processing history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Convert,
    Archive,
    Finalize,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Started,
    Success,
    Failed,
    Skipped,
}

/// One processing-history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub operation: Operation,
    pub status: HistoryStatus,
    pub message: Option<String>,
    pub duration_secs: Option<f64>,
    pub recorded_at: DateTime<Utc>,
    pub working_source_path: Option<PathBuf>,
    pub working_processed_path: Option<PathBuf>,
}

impl HistoryEntry {
    pub fn new(operation: Operation, status: HistoryStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            status,
            message: None,
            duration_secs: None,
            recorded_at: Utc::now(),
            working_source_path: None,
            working_processed_path: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Catalog entry for one album identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub album_id: Uuid,
    pub album_name: String,
    pub source_path: PathBuf,
    pub audio_checksum: String,
    pub archive_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub conversion_mode: Option<String>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u16>,
    pub processing_stage: Option<ProcessingStage>,
    pub working_source_path: Option<PathBuf>,
    pub working_processed_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl CatalogRecord {
    pub fn new(album_id: Uuid, album_name: &str, source_path: &Path, audio_checksum: &str) -> Self {
        let now = Utc::now();
        Self {
            album_id,
            album_name: album_name.to_string(),
            source_path: source_path.to_path_buf(),
            audio_checksum: audio_checksum.to_string(),
            archive_path: None,
            output_path: None,
            conversion_mode: None,
            sample_rate: None,
            bit_depth: None,
            processing_stage: None,
            working_source_path: None,
            working_processed_path: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }
}

/// Enumerated set of fields that may change on a catalog record.
///
/// `None` leaves a field alone; for the clearable fields `Some(None)` resets it.
#[derive(Debug, Clone, Default)]
pub struct CatalogPatch {
    pub source_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub conversion_mode: Option<String>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u16>,
    pub processing_stage: Option<Option<ProcessingStage>>,
    pub working_source_path: Option<Option<PathBuf>>,
    pub working_processed_path: Option<Option<PathBuf>>,
}

impl CatalogPatch {
    /// Patch that records a stage together with the current working directories
    pub fn stage(stage: ProcessingStage, source: Option<PathBuf>, processed: Option<PathBuf>) -> Self {
        Self {
            processing_stage: Some(Some(stage)),
            working_source_path: Some(source),
            working_processed_path: Some(processed),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_path.is_none()
            && self.archive_path.is_none()
            && self.output_path.is_none()
            && self.conversion_mode.is_none()
            && self.sample_rate.is_none()
            && self.bit_depth.is_none()
            && self.processing_stage.is_none()
            && self.working_source_path.is_none()
            && self.working_processed_path.is_none()
    }

    pub fn apply(self, record: &mut CatalogRecord) {
        if let Some(v) = self.source_path {
            record.source_path = v;
        }
        if let Some(v) = self.archive_path {
            record.archive_path = Some(v);
        }
        if let Some(v) = self.output_path {
            record.output_path = Some(v);
        }
        if let Some(v) = self.conversion_mode {
            record.conversion_mode = Some(v);
        }
        if let Some(v) = self.sample_rate {
            record.sample_rate = Some(v);
        }
        if let Some(v) = self.bit_depth {
            record.bit_depth = Some(v);
        }
        if let Some(v) = self.processing_stage {
            record.processing_stage = v;
        }
        if let Some(v) = self.working_source_path {
            record.working_source_path = v;
        }
        if let Some(v) = self.working_processed_path {
            record.working_processed_path = v;
        }
        record.updated_at = Utc::now();
    }
}

/// Album catalog keyed by content identity
pub trait Catalog: Send {
    fn get_album(&self, album_id: &Uuid) -> Result<Option<CatalogRecord>>;

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<CatalogRecord>>;

    /// Insert a new record; fails if the id is already present
    fn create_album(&mut self, record: CatalogRecord) -> Result<()>;

    /// Returns false when no record exists for `album_id`
    fn update_album(&mut self, album_id: &Uuid, patch: CatalogPatch) -> Result<bool>;

    fn add_history(&mut self, album_id: &Uuid, entry: HistoryEntry) -> Result<()>;

    /// History for an album, newest first, optionally filtered by operation
    fn history(&self, album_id: &Uuid, operation: Option<Operation>) -> Result<Vec<HistoryEntry>>;

    fn has_successful_operation(&self, album_id: &Uuid, operation: Operation) -> Result<bool> {
        Ok(self
            .history(album_id, Some(operation))?
            .iter()
            .any(|h| h.status == HistoryStatus::Success))
    }

    fn all_albums(&self) -> Result<Vec<CatalogRecord>>;
}

/// Catalog stored as one JSON document per album in a directory
pub struct JsonCatalog {
    dir: PathBuf,
}

impl JsonCatalog {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).at(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, album_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", album_id))
    }

    fn load(&self, path: &Path) -> Result<CatalogRecord> {
        let content = fs::read_to_string(path).at(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, record: &CatalogRecord) -> Result<()> {
        write_json_atomic(&self.record_path(&record.album_id), record)
    }

    fn require(&self, album_id: &Uuid) -> Result<CatalogRecord> {
        self.get_album(album_id)?
            .ok_or_else(|| PipelineError::Catalog(format!("album {} not in catalog", album_id)))
    }
}

impl Catalog for JsonCatalog {
    fn get_album(&self, album_id: &Uuid) -> Result<Option<CatalogRecord>> {
        let path = self.record_path(album_id);
        if !path.exists() {
            return Ok(None);
        }
        self.load(&path).map(Some)
    }

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<CatalogRecord>> {
        Ok(self
            .all_albums()?
            .into_iter()
            .find(|r| r.audio_checksum == checksum))
    }

    fn create_album(&mut self, record: CatalogRecord) -> Result<()> {
        if self.record_path(&record.album_id).exists() {
            return Err(PipelineError::Catalog(format!(
                "album {} already in catalog",
                record.album_id
            )));
        }
        debug!("Catalog: created {} ({})", record.album_name, record.album_id);
        self.save(&record)
    }

    fn update_album(&mut self, album_id: &Uuid, patch: CatalogPatch) -> Result<bool> {
        let mut record = match self.get_album(album_id)? {
            Some(r) => r,
            None => return Ok(false),
        };
        if patch.is_empty() {
            return Ok(true);
        }
        patch.apply(&mut record);
        self.save(&record)?;
        Ok(true)
    }

    fn add_history(&mut self, album_id: &Uuid, entry: HistoryEntry) -> Result<()> {
        let mut record = self.require(album_id)?;
        record.history.push(entry);
        self.save(&record)
    }

    fn history(&self, album_id: &Uuid, operation: Option<Operation>) -> Result<Vec<HistoryEntry>> {
        let record = match self.get_album(album_id)? {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        let mut entries: Vec<HistoryEntry> = record
            .history
            .into_iter()
            .filter(|h| operation.map_or(true, |op| h.operation == op))
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(entries)
    }

    fn all_albums(&self) -> Result<Vec<CatalogRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).at(&self.dir)? {
            let path = entry.at(&self.dir)?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.load(&path) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping unreadable catalog entry {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
