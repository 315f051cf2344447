use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Local, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::album::Album;
use crate::config::{ConversionMode, PipelineConfig};
use crate::error::{IoContext, PipelineError, Result};
use crate::fsutil::write_json_atomic;

/// Session file name inside the state directory
pub const STATE_FILE: &str = "conversion_state.json";

/// Sentinel whose presence asks the pipeline to stop between albums
pub const PAUSE_SIGNAL_FILE: &str = "PAUSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlbumStatus {
    Pending,
    Archiving,
    Converting,
    Completed,
    Failed,
    Skipped,
}

impl AlbumStatus {
    /// Terminal states stamp a completion time
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlbumStatus::Completed | AlbumStatus::Failed | AlbumStatus::Skipped)
    }

    /// Failed albums stay resumable; completed and skipped ones are done
    pub fn is_resumable(&self) -> bool {
        !matches!(self, AlbumStatus::Completed | AlbumStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlbumStatus::Pending => "pending",
            AlbumStatus::Archiving => "archiving",
            AlbumStatus::Converting => "converting",
            AlbumStatus::Completed => "completed",
            AlbumStatus::Failed => "failed",
            AlbumStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Converting,
    Completed,
    Failed,
}

/// Step of the per-album pipeline, persisted for resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Preparing,
    Converting,
    Archiving,
    Finalizing,
    Completed,
    FailedPrepare,
    FailedConvert,
    FailedArchive,
    FailedFinalize,
}

impl ProcessingStage {
    /// The failure marker recorded when this stage fails
    pub fn failed(self) -> Self {
        match self {
            ProcessingStage::Preparing | ProcessingStage::FailedPrepare => ProcessingStage::FailedPrepare,
            ProcessingStage::Converting | ProcessingStage::FailedConvert => ProcessingStage::FailedConvert,
            ProcessingStage::Archiving | ProcessingStage::FailedArchive => ProcessingStage::FailedArchive,
            ProcessingStage::Finalizing
            | ProcessingStage::Completed
            | ProcessingStage::FailedFinalize => ProcessingStage::FailedFinalize,
        }
    }

    /// The stage a failure marker re-enters on resume
    pub fn resume_point(self) -> Self {
        match self {
            ProcessingStage::FailedPrepare => ProcessingStage::Preparing,
            ProcessingStage::FailedConvert => ProcessingStage::Converting,
            ProcessingStage::FailedArchive => ProcessingStage::Archiving,
            ProcessingStage::FailedFinalize => ProcessingStage::Finalizing,
            other => other,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ProcessingStage::FailedPrepare
                | ProcessingStage::FailedConvert
                | ProcessingStage::FailedArchive
                | ProcessingStage::FailedFinalize
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Preparing => "preparing",
            ProcessingStage::Converting => "converting",
            ProcessingStage::Archiving => "archiving",
            ProcessingStage::Finalizing => "finalizing",
            ProcessingStage::Completed => "completed",
            ProcessingStage::FailedPrepare => "failed_prepare",
            ProcessingStage::FailedConvert => "failed_convert",
            ProcessingStage::FailedArchive => "failed_archive",
            ProcessingStage::FailedFinalize => "failed_finalize",
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversion state of one music file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConversionState {
    /// Key within the album; identical in the original and in its working copy
    pub relative_path: PathBuf,
    pub source_path: PathBuf,
    /// Output location relative to the processed tree
    pub output_path: PathBuf,
    pub status: FileStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Conversion state of one album
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumConversionState {
    /// Original location; stays the key even when resuming from a working copy
    pub album_path: PathBuf,
    pub album_name: String,
    pub status: AlbumStatus,
    #[serde(default)]
    pub album_id: Option<Uuid>,
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub working_source_path: Option<PathBuf>,
    #[serde(default)]
    pub working_processed_path: Option<PathBuf>,
    #[serde(default)]
    pub processing_stage: Option<ProcessingStage>,
    pub files: Vec<FileConversionState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AlbumConversionState {
    /// Whether either staging directory is still on disk
    pub fn has_working_dirs(&self) -> bool {
        self.working_source_path.as_deref().map_or(false, Path::exists)
            || self.working_processed_path.as_deref().map_or(false, Path::exists)
    }

    pub fn file(&self, relative: &Path) -> Option<&FileConversionState> {
        self.files.iter().find(|f| f.relative_path == relative)
    }

    pub fn files_completed(&self) -> usize {
        self.files.iter().filter(|f| f.status == FileStatus::Completed).count()
    }

    pub fn total_attempts(&self) -> u32 {
        self.files.iter().map(|f| f.attempts).sum()
    }
}

/// A resumable batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSession {
    pub session_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub working_dir: PathBuf,
    pub conversion_mode: ConversionMode,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub albums: Vec<AlbumConversionState>,
}

impl ConversionSession {
    /// Read a session file without taking ownership of the store
    pub fn read(path: &Path) -> Result<Option<ConversionSession>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).at(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn statistics(&self) -> SessionStatistics {
        let count = |s: AlbumStatus| self.albums.iter().filter(|a| a.status == s).count();
        let files = || self.albums.iter().flat_map(|a| a.files.iter());
        let count_files = |s: FileStatus| files().filter(|f| f.status == s).count();

        let albums_total = self.albums.len();
        let albums_completed = count(AlbumStatus::Completed);
        let albums_failed = count(AlbumStatus::Failed);
        let albums_skipped = count(AlbumStatus::Skipped);
        let files_total = files().count();
        let files_completed = count_files(FileStatus::Completed);
        let files_failed = count_files(FileStatus::Failed);

        SessionStatistics {
            albums_total,
            albums_completed,
            albums_failed,
            albums_skipped,
            albums_pending: albums_total - albums_completed - albums_failed - albums_skipped,
            files_total,
            files_completed,
            files_failed,
            files_pending: files_total - files_completed - files_failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub albums_total: usize,
    pub albums_completed: usize,
    pub albums_failed: usize,
    pub albums_skipped: usize,
    pub albums_pending: usize,
    pub files_total: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_pending: usize,
}

/// Fields that may change on an album entry.
///
/// `None` leaves a field alone; for the clearable fields `Some(None)` resets it.
#[derive(Debug, Clone, Default)]
pub struct AlbumPatch {
    pub status: Option<AlbumStatus>,
    pub album_id: Option<Uuid>,
    pub archive_path: Option<Option<PathBuf>>,
    pub output_path: Option<Option<PathBuf>>,
    pub working_source_path: Option<Option<PathBuf>>,
    pub working_processed_path: Option<Option<PathBuf>>,
    pub processing_stage: Option<Option<ProcessingStage>>,
    pub error_message: Option<Option<String>>,
}

impl AlbumPatch {
    pub fn status(status: AlbumStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn stage(status: AlbumStatus, stage: ProcessingStage) -> Self {
        Self {
            status: Some(status),
            processing_stage: Some(Some(stage)),
            ..Default::default()
        }
    }

    /// Failed status with the stage marker and message
    pub fn failed(stage: ProcessingStage, message: impl Into<String>) -> Self {
        Self {
            status: Some(AlbumStatus::Failed),
            processing_stage: Some(Some(stage.failed())),
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }
}

/// Owns the persisted session; every mutation rewrites the file atomically
pub struct SessionStateStore {
    state_dir: PathBuf,
    state_file: PathBuf,
    pause_signal_file: PathBuf,
    session: Option<ConversionSession>,
}

impl SessionStateStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).at(state_dir)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            state_file: state_dir.join(STATE_FILE),
            pause_signal_file: state_dir.join(PAUSE_SIGNAL_FILE),
            session: None,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn session(&self) -> Option<&ConversionSession> {
        self.session.as_ref()
    }

    fn session_mut(&mut self) -> Result<&mut ConversionSession> {
        self.session.as_mut().ok_or(PipelineError::NoSession)
    }

    /// Start a new session for `input_dir`, replacing any previous one
    pub fn create_session(&mut self, config: &PipelineConfig, input_dir: &Path) -> Result<&ConversionSession> {
        let session = ConversionSession {
            session_id: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            input_dir: input_dir.to_path_buf(),
            output_dir: config.output_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            working_dir: config.working_dir.clone(),
            conversion_mode: config.conversion_mode,
            sample_rate: config.sample_rate,
            bit_depth: config.bit_depth,
            started_at: Utc::now(),
            completed_at: None,
            paused: false,
            albums: Vec::new(),
        };
        info!("Created session {}", session.session_id);
        self.session = Some(session);
        self.save_state()?;
        self.session.as_ref().ok_or(PipelineError::NoSession)
    }

    /// Load the persisted session, if any
    pub fn load_session(&mut self) -> Result<Option<&ConversionSession>> {
        self.session = ConversionSession::read(&self.state_file)?;
        if let Some(s) = &self.session {
            info!("Loaded session {} ({} albums)", s.session_id, s.albums.len());
        }
        Ok(self.session.as_ref())
    }

    pub fn save_state(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(PipelineError::NoSession)?;
        write_json_atomic(&self.state_file, session)
    }

    /// Register an album; a path already in the session is left untouched
    pub fn add_album(&mut self, album: &Album, mode: ConversionMode) -> Result<()> {
        let session = self.session_mut()?;
        if session.albums.iter().any(|a| a.album_path == album.root_path) {
            return Ok(());
        }

        let files = album
            .music_files
            .iter()
            .map(|f| FileConversionState {
                relative_path: f.relative_path.clone(),
                source_path: f.path.clone(),
                output_path: f.relative_path.with_extension(mode.output_extension_for(&f.extension)),
                status: FileStatus::Pending,
                attempts: 0,
                error_message: None,
                completed_at: None,
            })
            .collect();

        session.albums.push(AlbumConversionState {
            album_path: album.root_path.clone(),
            album_name: album.name.clone(),
            status: AlbumStatus::Pending,
            album_id: None,
            archive_path: None,
            output_path: None,
            working_source_path: None,
            working_processed_path: None,
            processing_stage: None,
            files,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        });
        self.save_state()
    }

    pub fn album(&self, album_path: &Path) -> Option<&AlbumConversionState> {
        self.session
            .as_ref()
            .and_then(|s| s.albums.iter().find(|a| a.album_path == album_path))
    }

    fn album_mut(&mut self, album_path: &Path) -> Result<&mut AlbumConversionState> {
        self.session_mut()?
            .albums
            .iter_mut()
            .find(|a| a.album_path == album_path)
            .ok_or_else(|| PipelineError::NotFound(album_path.to_path_buf()))
    }

    /// Apply `patch` to the album registered under its original path
    pub fn update_album(&mut self, album_path: &Path, patch: AlbumPatch) -> Result<()> {
        let album = self.album_mut(album_path)?;

        if let Some(status) = patch.status {
            album.status = status;
            if status.is_terminal() {
                album.completed_at = Some(Utc::now());
            } else {
                album.completed_at = None;
            }
        }
        if let Some(id) = patch.album_id {
            album.album_id = Some(id);
        }
        if let Some(v) = patch.archive_path {
            album.archive_path = v;
        }
        if let Some(v) = patch.output_path {
            album.output_path = v;
        }
        if let Some(v) = patch.working_source_path {
            album.working_source_path = v;
        }
        if let Some(v) = patch.working_processed_path {
            album.working_processed_path = v;
        }
        if let Some(v) = patch.processing_stage {
            album.processing_stage = v;
        }
        if let Some(v) = patch.error_message {
            album.error_message = v;
        }
        self.save_state()
    }

    /// Move one file through its state machine; entering `Converting` counts an attempt
    pub fn update_file_status(
        &mut self,
        album_path: &Path,
        relative: &Path,
        status: FileStatus,
        error: Option<String>,
    ) -> Result<()> {
        let album = self.album_mut(album_path)?;
        let file = album
            .files
            .iter_mut()
            .find(|f| f.relative_path == relative)
            .ok_or_else(|| PipelineError::NotFound(album_path.join(relative)))?;

        file.status = status;
        match status {
            FileStatus::Converting => file.attempts += 1,
            FileStatus::Completed | FileStatus::Failed => file.completed_at = Some(Utc::now()),
            FileStatus::Pending => file.completed_at = None,
        }
        if status == FileStatus::Completed {
            file.error_message = None;
        }
        if error.is_some() {
            file.error_message = error;
        }
        self.save_state()
    }

    /// Put every file of an album back to pending (its staged output is gone)
    pub fn reset_files(&mut self, album_path: &Path) -> Result<()> {
        let album = self.album_mut(album_path)?;
        for file in &mut album.files {
            file.status = FileStatus::Pending;
            file.completed_at = None;
        }
        self.save_state()
    }

    /// Albums still waiting or previously failed
    pub fn get_pending_albums(&self) -> Vec<AlbumConversionState> {
        self.session
            .as_ref()
            .map(|s| {
                s.albums
                    .iter()
                    .filter(|a| matches!(a.status, AlbumStatus::Pending | AlbumStatus::Failed))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Albums that are not done yet, those with surviving working directories first
    pub fn get_resumable_albums(&self) -> Vec<AlbumConversionState> {
        let mut albums: Vec<AlbumConversionState> = self
            .session
            .as_ref()
            .map(|s| s.albums.iter().filter(|a| a.status.is_resumable()).cloned().collect())
            .unwrap_or_default();
        // stable: session order is kept within each group
        albums.sort_by_key(|a| !a.has_working_dirs());
        albums
    }

    pub fn check_pause_signal(&self) -> bool {
        self.pause_signal_file.exists()
    }

    pub fn create_pause_signal(&mut self) -> Result<()> {
        fs::write(&self.pause_signal_file, b"").at(&self.pause_signal_file)?;
        if let Some(s) = self.session.as_mut() {
            s.paused = true;
            self.save_state()?;
        }
        Ok(())
    }

    pub fn clear_pause_signal(&mut self) -> Result<()> {
        if self.pause_signal_file.exists() {
            fs::remove_file(&self.pause_signal_file).at(&self.pause_signal_file)?;
        }
        if let Some(s) = self.session.as_mut() {
            s.paused = false;
            self.save_state()?;
        }
        Ok(())
    }

    /// Record that the pipeline has stopped because of the pause sentinel
    pub fn mark_paused(&mut self) -> Result<()> {
        self.session_mut()?.paused = true;
        self.save_state()
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        let session = self.session_mut()?;
        session.completed_at = Some(Utc::now());
        session.paused = false;
        self.save_state()
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.session.as_ref().map(|s| s.statistics()).unwrap_or_default()
    }

    /// Forget the session and remove its file
    pub fn clear_state(&mut self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).at(&self.state_file)?;
        }
        if self.session.take().is_some() {
            warn!("Session state cleared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::MusicFile;
    use tempfile::TempDir;

    fn album(path: &str, tracks: &[&str]) -> Album {
        let root = PathBuf::from(path);
        Album {
            name: root.file_name().unwrap().to_string_lossy().to_string(),
            music_files: tracks
                .iter()
                .map(|t| MusicFile {
                    path: root.join(t),
                    relative_path: PathBuf::from(t),
                    extension: "dsf".to_string(),
                    size: 1,
                })
                .collect(),
            root_path: root,
            non_music_files: vec![],
            subdirectories: vec![],
        }
    }

    fn store(tmp: &TempDir) -> SessionStateStore {
        let mut store = SessionStateStore::new(&tmp.path().join(".state")).unwrap();
        store
            .create_session(&PipelineConfig::default_config(), Path::new("/in"))
            .unwrap();
        store
    }

    #[test]
    fn test_mutations_without_session_fail() {
        let tmp = TempDir::new().unwrap();
        let mut store = SessionStateStore::new(tmp.path()).unwrap();
        assert!(matches!(
            store.add_album(&album("/in/A", &["01.dsf"]), ConversionMode::IsoDsfToFlac),
            Err(PipelineError::NoSession)
        ));
        assert!(store.get_resumable_albums().is_empty());
    }

    #[test]
    fn test_add_album_is_idempotent_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let a = album("/in/A", &["CD1/01.dsf", "CD1/02.dsf"]);
        store.add_album(&a, ConversionMode::IsoDsfToFlac).unwrap();
        store.add_album(&a, ConversionMode::IsoDsfToFlac).unwrap();

        let session = ConversionSession::read(store.state_file()).unwrap().unwrap();
        assert_eq!(session.albums.len(), 1);
        assert_eq!(session.albums[0].files[1].output_path, PathBuf::from("CD1/02.flac"));
        assert_eq!(session.albums[0].status, AlbumStatus::Pending);
    }

    #[test]
    fn test_file_attempts_and_terminal_stamps() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let a = album("/in/A", &["01.dsf"]);
        store.add_album(&a, ConversionMode::IsoDsfToFlac).unwrap();
        let rel = Path::new("01.dsf");

        store.update_file_status(&a.root_path, rel, FileStatus::Converting, None).unwrap();
        store
            .update_file_status(&a.root_path, rel, FileStatus::Failed, Some("boom".into()))
            .unwrap();
        store.update_file_status(&a.root_path, rel, FileStatus::Converting, None).unwrap();
        store.update_file_status(&a.root_path, rel, FileStatus::Completed, None).unwrap();

        let file = store.album(&a.root_path).unwrap().file(rel).unwrap().clone();
        assert_eq!(file.attempts, 2);
        assert_eq!(file.status, FileStatus::Completed);
        assert!(file.completed_at.is_some());
        assert!(file.error_message.is_none());

        assert!(matches!(
            store.update_file_status(&a.root_path, Path::new("nope.dsf"), FileStatus::Completed, None),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_album_patch_and_completion_time() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let a = album("/in/A", &["01.dsf"]);
        store.add_album(&a, ConversionMode::IsoDsfToFlac).unwrap();

        store
            .update_album(
                &a.root_path,
                AlbumPatch {
                    working_source_path: Some(Some(PathBuf::from("/w/A_source"))),
                    ..AlbumPatch::stage(AlbumStatus::Converting, ProcessingStage::Converting)
                },
            )
            .unwrap();
        let state = store.album(&a.root_path).unwrap();
        assert_eq!(state.processing_stage, Some(ProcessingStage::Converting));
        assert!(state.completed_at.is_none());

        store
            .update_album(&a.root_path, AlbumPatch::failed(ProcessingStage::Converting, "ffmpeg died"))
            .unwrap();
        let state = store.album(&a.root_path).unwrap();
        assert_eq!(state.status, AlbumStatus::Failed);
        assert_eq!(state.processing_stage, Some(ProcessingStage::FailedConvert));
        assert_eq!(state.error_message.as_deref(), Some("ffmpeg died"));
        assert!(state.completed_at.is_some());
        assert_eq!(state.working_source_path, Some(PathBuf::from("/w/A_source")));
    }

    #[test]
    fn test_resumable_prefers_existing_working_dirs() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let live = tmp.path().join("B_source");
        fs::create_dir(&live).unwrap();

        for name in ["/in/A", "/in/B", "/in/C", "/in/D"] {
            store.add_album(&album(name, &["01.dsf"]), ConversionMode::IsoDsfToFlac).unwrap();
        }
        store
            .update_album(
                Path::new("/in/B"),
                AlbumPatch {
                    working_source_path: Some(Some(live.clone())),
                    ..AlbumPatch::failed(ProcessingStage::Archiving, "disk gone")
                },
            )
            .unwrap();
        store
            .update_album(Path::new("/in/C"), AlbumPatch::status(AlbumStatus::Completed))
            .unwrap();
        store
            .update_album(Path::new("/in/D"), AlbumPatch::status(AlbumStatus::Skipped))
            .unwrap();

        let order: Vec<PathBuf> = store.get_resumable_albums().into_iter().map(|a| a.album_path).collect();
        assert_eq!(order, vec![PathBuf::from("/in/B"), PathBuf::from("/in/A")]);

        let pending: Vec<PathBuf> = store.get_pending_albums().into_iter().map(|a| a.album_path).collect();
        assert_eq!(pending, vec![PathBuf::from("/in/A"), PathBuf::from("/in/B")]);
    }

    #[test]
    fn test_pause_signal_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        assert!(!store.check_pause_signal());
        store.create_pause_signal().unwrap();
        assert!(store.check_pause_signal());
        assert!(store.session().unwrap().paused);
        store.clear_pause_signal().unwrap();
        assert!(!store.check_pause_signal());
        assert!(!ConversionSession::read(store.state_file()).unwrap().unwrap().paused);
    }

    #[test]
    fn test_statistics_and_clear() {
        let tmp = TempDir::new().unwrap();
        let mut store = store(&tmp);
        let a = album("/in/A", &["01.dsf", "02.dsf"]);
        let b = album("/in/B", &["01.dsf"]);
        store.add_album(&a, ConversionMode::IsoDsfToFlac).unwrap();
        store.add_album(&b, ConversionMode::IsoDsfToFlac).unwrap();
        store
            .update_file_status(&a.root_path, Path::new("01.dsf"), FileStatus::Completed, None)
            .unwrap();
        store
            .update_file_status(&b.root_path, Path::new("01.dsf"), FileStatus::Failed, Some("x".into()))
            .unwrap();
        store.update_album(&b.root_path, AlbumPatch::status(AlbumStatus::Failed)).unwrap();

        let stats = store.statistics();
        assert_eq!(stats.albums_total, 2);
        assert_eq!(stats.albums_failed, 1);
        assert_eq!(stats.albums_pending, 1);
        assert_eq!(stats.files_total, 3);
        assert_eq!(stats.files_completed, 1);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.files_pending, 1);

        store.mark_completed().unwrap();
        assert!(store.session().unwrap().completed_at.is_some());

        store.clear_state().unwrap();
        assert!(store.session().is_none());
        assert!(!store.state_file().exists());
    }

    #[test]
    fn test_reload_from_disk() {
        let tmp = TempDir::new().unwrap();
        let mut first = store(&tmp);
        first.add_album(&album("/in/A", &["01.dsf"]), ConversionMode::IsoToDsf).unwrap();

        let mut second = SessionStateStore::new(&tmp.path().join(".state")).unwrap();
        let session = second.load_session().unwrap().unwrap();
        assert_eq!(session.albums.len(), 1);
        assert_eq!(session.conversion_mode, ConversionMode::IsoDsfToFlac);
    }

    #[test]
    fn test_stage_markers() {
        assert_eq!(ProcessingStage::Archiving.failed(), ProcessingStage::FailedArchive);
        assert_eq!(ProcessingStage::FailedArchive.resume_point(), ProcessingStage::Archiving);
        assert_eq!(
            serde_json::to_string(&ProcessingStage::FailedPrepare).unwrap(),
            "\"failed_prepare\""
        );
        assert!(AlbumStatus::Failed.is_resumable());
        assert!(!AlbumStatus::Skipped.is_resumable());
    }
}
