use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use log::{debug, error, info, warn};
use uuid::Uuid;
use crate::album::Album;
use crate::catalog::{Catalog, CatalogPatch, CatalogRecord, HistoryEntry, HistoryStatus, JsonCatalog, Operation};
use crate::config::PipelineConfig;
use crate::converter::{Converter, FfmpegConverter};
use crate::dedup::DeduplicationManager;
use crate::error::{IoContext, PipelineError, Result};
use crate::identity::{create_sidecar, read_sidecar, write_sidecar, ContentHasher, SidecarRecord};
use crate::observer::{LogObserver, PipelineObserver};
use crate::scan::{album_name, statistics, AlbumScanner};
use crate::session::{
    AlbumConversionState, AlbumPatch, AlbumStatus, FileStatus, ProcessingStage, SessionStateStore,
};
use crate::workdir::{unique_destination, CleanupReport, DiskSpace, SystemDiskSpace, WorkingDirectoryManager};

/// History message recorded when source removal is refused
pub const SAFETY_CHECK_FAILED: &str = "Safety check failed - appears to be working directory";

/// How a batch run treats previous state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Continue the persisted session instead of scanning afresh
    pub resume: bool,
    /// Process albums even when the catalog says they are done
    pub force: bool,
    /// Treat the input root as one album
    pub single_album: bool,
}

/// What happened to one album during a run
#[derive(Debug, Clone, PartialEq)]
pub struct AlbumOutcome {
    /// Original location of the album
    pub album_path: PathBuf,
    pub name: String,
    pub status: AlbumStatus,
    pub stage: Option<ProcessingStage>,
    pub message: Option<String>,
    pub files_converted: usize,
    /// Files whose output was already present
    pub files_skipped: usize,
    pub duration_secs: f64,
}

/// Result of a batch run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub session_id: Option<String>,
    pub albums: Vec<AlbumOutcome>,
    /// The run stopped early because of the pause sentinel
    pub paused: bool,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn count(&self, status: AlbumStatus) -> usize {
        self.albums.iter().filter(|a| a.status == status).count()
    }

    /// No album failed
    pub fn is_success(&self) -> bool {
        self.count(AlbumStatus::Failed) == 0
    }
}

/// Dry-run verdict for one album
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub album_path: PathBuf,
    pub name: String,
    pub file_count: usize,
    pub total_bytes: u64,
    /// Free space the working root needs to stage this album
    pub required_bytes: u64,
    pub will_skip: bool,
    pub reason: String,
}

/// An album queued for processing
struct AlbumJob {
    /// Scanned tree; rooted at the working source when resuming from it
    album: Album,
    /// Original location, the session key
    original: PathBuf,
    /// Persisted state to re-enter from, if any
    resume: Option<AlbumConversionState>,
}

/// Mutable bookkeeping for the album being processed
struct AlbumRun {
    original: PathBuf,
    name: String,
    album: Album,
    album_id: Uuid,
    working_source: Option<PathBuf>,
    working_processed: Option<PathBuf>,
    stage: ProcessingStage,
    archive_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    files_converted: usize,
    files_skipped: usize,
}

/// Drives albums through PREPARING → CONVERTING → ARCHIVING → FINALIZING → COMPLETED.
///
/// Every stage transition is persisted to the session and the catalog before
/// the stage does any work, so an interrupted run can be re-entered at the
/// stage it stopped in. Albums are processed strictly one after another; the
/// working root is assumed to be used by a single orchestrator process.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    scanner: AlbumScanner,
    dedup: DeduplicationManager,
    workdirs: WorkingDirectoryManager,
    state: SessionStateStore,
    catalog: Box<dyn Catalog>,
    converter: Box<dyn Converter>,
    observer: Box<dyn PipelineObserver>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        catalog: Box<dyn Catalog>,
        converter: Box<dyn Converter>,
        disk: Box<dyn DiskSpace>,
        observer: Box<dyn PipelineObserver>,
    ) -> Result<Self> {
        config.validate().map_err(PipelineError::InvalidConfig)?;
        let hasher = ContentHasher::new(config.partial_hash_bytes());
        Ok(Self {
            scanner: AlbumScanner::new(config.music_extensions.clone(), config.copy_extensions.clone()),
            dedup: DeduplicationManager::new(hasher, config.verify_checksums),
            workdirs: WorkingDirectoryManager::new(&config, disk)?,
            state: SessionStateStore::new(&config.state_dir)?,
            catalog,
            converter,
            observer,
            config,
        })
    }

    /// Orchestrator wired to the JSON catalog, ffmpeg, the real disks and the log
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate().map_err(PipelineError::InvalidConfig)?;
        let catalog = JsonCatalog::open(&config.catalog_dir)?;
        let converter = FfmpegConverter::from_config(&config);
        Self::new(
            config,
            Box::new(catalog),
            Box::new(converter),
            Box::new(SystemDiskSpace),
            Box::new(LogObserver),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionStateStore {
        &self.state
    }

    pub fn catalog(&self) -> &dyn Catalog {
        &*self.catalog
    }

    /// Run a batch over `input`, or continue the persisted session with `resume`
    pub async fn run(&mut self, input: &Path, options: RunOptions) -> Result<RunSummary> {
        let started = Instant::now();

        let jobs = if options.resume {
            if self.state.load_session()?.is_some() {
                info!("🔄 Resuming previous session");
                self.jobs_from_session()?
            } else {
                warn!("No previous session found, starting a new one");
                self.scan_and_initialize(input, options.single_album)?
            }
        } else {
            self.scan_and_initialize(input, options.single_album)?
        };

        let mut summary = RunSummary {
            session_id: self.state.session().map(|s| s.session_id.clone()),
            ..Default::default()
        };
        if jobs.is_empty() {
            warn!("No albums found to process");
        }

        self.process_albums(jobs, options.force, &mut summary).await;

        if summary.paused {
            self.state.mark_paused()?;
        } else {
            self.state.mark_completed()?;
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        info!(
            "🏁 Run finished in {:.0}s: {} completed, {} skipped, {} failed",
            summary.duration_secs,
            summary.count(AlbumStatus::Completed),
            summary.count(AlbumStatus::Skipped),
            summary.count(AlbumStatus::Failed)
        );
        Ok(summary)
    }

    /// Scan `input` and report, per album, whether it would be processed and
    /// how much staging space it needs. Nothing is written.
    pub fn plan(&self, input: &Path, single_album: bool, force: bool) -> Result<Vec<PlanEntry>> {
        let albums = self.scanner.scan(input, single_album)?;
        Ok(albums
            .into_iter()
            .map(|album| {
                let files = album.audio_paths();
                let (will_skip, reason) =
                    match self.dedup.should_skip(&*self.catalog, &album.root_path, &files, force) {
                        Ok(verdict) => verdict,
                        Err(e) => (false, e.to_string()),
                    };
                PlanEntry {
                    required_bytes: self.workdirs.required_space(&album.root_path),
                    total_bytes: album.total_size(),
                    file_count: album.file_count(),
                    name: album.name,
                    album_path: album.root_path,
                    will_skip,
                    reason,
                }
            })
            .collect())
    }

    fn scan_and_initialize(&mut self, input: &Path, single_album: bool) -> Result<Vec<AlbumJob>> {
        let albums = self.scanner.scan(input, single_album)?;
        let stats = statistics(&albums);
        info!(
            "📀 Found {} album(s), {} music file(s), {} bytes",
            stats.album_count, stats.total_files, stats.total_size_bytes
        );
        for (ext, count) in &stats.extensions {
            debug!("  .{}: {}", ext, count);
        }

        self.state.create_session(&self.config, input)?;
        for album in &albums {
            self.state.add_album(album, self.config.conversion_mode)?;
        }

        Ok(albums
            .into_iter()
            .map(|album| AlbumJob {
                original: album.root_path.clone(),
                album,
                resume: None,
            })
            .collect())
    }

    /// Rebuild the work list from the loaded session
    fn jobs_from_session(&mut self) -> Result<Vec<AlbumJob>> {
        let candidates = if self.config.resume_from_working {
            self.state.get_resumable_albums()
        } else {
            self.state.get_pending_albums()
        };

        let mut jobs = Vec::new();
        for state in candidates {
            let from_working = self.config.resume_from_working && state.has_working_dirs();
            // a copy interrupted during Preparing is incomplete
            let staged = state
                .processing_stage
                .map_or(false, |s| s.resume_point() != ProcessingStage::Preparing);
            let working_source = state.working_source_path.clone().filter(|p| p.exists());

            let scan_root = match working_source {
                Some(source) if from_working && staged => source,
                _ if state.album_path.exists() => state.album_path.clone(),
                _ => {
                    warn!("Skipping {}: source no longer exists", state.album_name);
                    continue;
                }
            };

            let mut album = match self.scanner.scan_album(&scan_root) {
                Ok(album) => album,
                Err(e) => {
                    warn!("Skipping {}: {}", state.album_name, e);
                    continue;
                }
            };
            album.name = state.album_name.clone();

            if from_working {
                info!(
                    "  Resuming {} (stage: {})",
                    state.album_name,
                    state.processing_stage.map(|s| s.as_str()).unwrap_or("none")
                );
            } else {
                info!("  Reprocessing {} from its original location", state.album_name);
            }

            jobs.push(AlbumJob {
                album,
                original: state.album_path.clone(),
                resume: if from_working { Some(state) } else { None },
            });
        }
        Ok(jobs)
    }

    async fn process_albums(&mut self, jobs: Vec<AlbumJob>, force: bool, summary: &mut RunSummary) {
        let total = jobs.len();
        for (idx, job) in jobs.into_iter().enumerate() {
            // only ever checked between albums
            if self.config.check_pause && self.state.check_pause_signal() {
                info!(
                    "⏸️  Pause signal detected; remove {} and resume to continue",
                    self.config.pause_signal_path().display()
                );
                summary.paused = true;
                break;
            }

            if self.config.skip_processed && job.resume.is_none() {
                if let Some(outcome) = self.skip_if_processed(&job, force) {
                    self.observer.album_finished(&outcome);
                    summary.albums.push(outcome);
                    continue;
                }
            }

            self.observer.album_started(idx + 1, total, &job.original);
            let outcome = self.process_album(job).await;
            self.observer.album_finished(&outcome);
            summary.albums.push(outcome);
        }
    }

    fn skip_if_processed(&mut self, job: &AlbumJob, force: bool) -> Option<AlbumOutcome> {
        let files = job.album.audio_paths();
        match self.dedup.should_skip(&*self.catalog, &job.album.root_path, &files, force) {
            Ok((true, reason)) => {
                if let Err(e) = self
                    .state
                    .update_album(&job.original, AlbumPatch::status(AlbumStatus::Skipped))
                {
                    warn!("Could not record skip of {}: {}", job.album.name, e);
                }
                Some(AlbumOutcome {
                    album_path: job.original.clone(),
                    name: job.album.name.clone(),
                    status: AlbumStatus::Skipped,
                    stage: None,
                    message: Some(reason),
                    files_converted: 0,
                    files_skipped: 0,
                    duration_secs: 0.0,
                })
            }
            Ok((false, _)) => None,
            // the album itself will surface the problem
            Err(e) => {
                debug!("Status check failed for {}: {}", job.album.name, e);
                None
            }
        }
    }

    /// Process one album; failures are contained here and never abort the batch
    async fn process_album(&mut self, job: AlbumJob) -> AlbumOutcome {
        let started = Instant::now();

        let mut run = match self.begin_album(&job) {
            Ok(run) => run,
            Err(e) => {
                let message = e.to_string();
                if let Err(persist) = self
                    .state
                    .update_album(&job.original, AlbumPatch::failed(ProcessingStage::Preparing, message.clone()))
                {
                    error!("Could not persist failure of {}: {}", job.album.name, persist);
                }
                return AlbumOutcome {
                    album_path: job.original,
                    name: job.album.name,
                    status: AlbumStatus::Failed,
                    stage: Some(ProcessingStage::FailedPrepare),
                    message: Some(message),
                    files_converted: 0,
                    files_skipped: 0,
                    duration_secs: started.elapsed().as_secs_f64(),
                };
            }
        };

        match self.drive(&mut run).await {
            Ok(()) => AlbumOutcome {
                album_path: run.original,
                name: run.name,
                status: AlbumStatus::Completed,
                stage: Some(ProcessingStage::Completed),
                message: None,
                files_converted: run.files_converted,
                files_skipped: run.files_skipped,
                duration_secs: started.elapsed().as_secs_f64(),
            },
            Err(e) => self.fail_album(&mut run, e, started),
        }
    }

    /// Establish identity and catalog record, and decide where to start
    fn begin_album(&mut self, job: &AlbumJob) -> Result<AlbumRun> {
        let files = job.album.audio_paths();
        let identity = self.dedup.get_or_create_identity(&job.album.root_path, &files)?;
        let album_id = identity.album_id;

        match self.catalog.get_album(&album_id)? {
            None => {
                let mut record =
                    CatalogRecord::new(album_id, &job.album.name, &job.original, &identity.audio_checksum);
                record.conversion_mode = Some(self.config.conversion_mode.as_str().to_string());
                record.sample_rate = Some(self.config.sample_rate);
                record.bit_depth = Some(self.config.bit_depth);
                self.catalog.create_album(record)?;
            }
            Some(record) if record.source_path != job.original && !record.source_path.exists() => {
                self.dedup
                    .reconcile_moved_album(&mut *self.catalog, &album_id, &record.source_path, &job.original)?;
            }
            Some(_) => {}
        }

        self.state.update_album(
            &job.original,
            AlbumPatch {
                album_id: Some(album_id),
                ..Default::default()
            },
        )?;

        let mut run = AlbumRun {
            original: job.original.clone(),
            name: job.album.name.clone(),
            album: job.album.clone(),
            album_id,
            working_source: None,
            working_processed: None,
            stage: ProcessingStage::Preparing,
            archive_path: None,
            output_path: None,
            files_converted: 0,
            files_skipped: 0,
        };
        if let Some(state) = &job.resume {
            self.restore_stage(&mut run, state)?;
        }
        Ok(run)
    }

    /// Re-enter at the persisted stage when its working directories allow it,
    /// otherwise discard them and start over from the original.
    fn restore_stage(&self, run: &mut AlbumRun, state: &AlbumConversionState) -> Result<()> {
        run.archive_path = state.archive_path.clone();
        run.output_path = state.output_path.clone();

        let source = state.working_source_path.clone().filter(|p| p.exists());
        let processed = state.working_processed_path.clone().filter(|p| p.exists());
        let output = self.config.output_dir.join(album_name(&run.original));

        let stage = match state.processing_stage.map(ProcessingStage::resume_point) {
            Some(ProcessingStage::Completed) => ProcessingStage::Finalizing,
            Some(stage) => stage,
            None => ProcessingStage::Preparing,
        };
        let resumable = match stage {
            ProcessingStage::Converting | ProcessingStage::Archiving => source.is_some() && processed.is_some(),
            ProcessingStage::Finalizing => {
                processed.is_some() || self.owns_output(run, &output, state.output_path.as_deref())
            }
            _ => false,
        };

        if resumable {
            debug!("{}: re-entering at {}", run.name, stage);
            run.working_source = source;
            run.working_processed = processed;
            run.stage = stage;
            return Ok(());
        }

        if !run.original.exists() {
            return Err(PipelineError::NotFound(run.original.clone()));
        }
        run.album = self.scanner.scan_album(&run.original)?;
        run.album.name = run.name.clone();
        run.stage = ProcessingStage::Preparing;

        let report = self.workdirs.cleanup_working_dirs(source.as_deref(), processed.as_deref());
        self.report_cleanup(&report);
        info!("{}: working directories unusable, restarting from {}", run.name, ProcessingStage::Preparing);
        Ok(())
    }

    async fn drive(&mut self, run: &mut AlbumRun) -> Result<()> {
        if run.stage == ProcessingStage::Preparing {
            self.prepare(run)?;
        }
        if run.stage == ProcessingStage::Converting {
            self.convert(run).await?;
        }
        if run.stage == ProcessingStage::Archiving {
            self.archive(run)?;
        }
        if run.stage == ProcessingStage::Finalizing {
            self.finalize(run)?;
        }
        self.complete(run)
    }

    /// Persist the stage with the current working directories before it runs
    fn enter_stage(&mut self, run: &mut AlbumRun, stage: ProcessingStage, status: AlbumStatus) -> Result<()> {
        run.stage = stage;
        self.observer.stage_started(&run.name, stage);
        self.state.update_album(
            &run.original,
            AlbumPatch {
                working_source_path: Some(run.working_source.clone()),
                working_processed_path: Some(run.working_processed.clone()),
                error_message: Some(None),
                ..AlbumPatch::stage(status, stage)
            },
        )?;
        self.catalog.update_album(
            &run.album_id,
            CatalogPatch::stage(stage, run.working_source.clone(), run.working_processed.clone()),
        )?;
        Ok(())
    }

    fn prepare(&mut self, run: &mut AlbumRun) -> Result<()> {
        self.enter_stage(run, ProcessingStage::Preparing, AlbumStatus::Pending)?;
        self.state.reset_files(&run.original)?;

        let root = run.album.root_path.clone();
        let space = self.workdirs.check_disk_space(&root)?;
        debug!("Space check passed: {} required, {} available", space.required, space.available);

        self.discard_stale_pairs(run)?;
        let pair = self.workdirs.create_working_dirs(&run.name)?;
        run.working_source = Some(pair.source.clone());
        run.working_processed = Some(pair.processed.clone());

        // recorded before the copy starts so an interrupted run can find the pair
        let staged = self
            .record_working_dirs(run)
            .and_then(|_| self.workdirs.copy_to_source(&root, &pair.source))
            .and_then(|bytes| {
                self.workdirs.create_processed_structure(&root, &pair.processed)?;
                Ok(bytes)
            });

        match staged {
            Ok(bytes) => info!("  Staged {} bytes in {}", bytes, pair.source.display()),
            Err(e) => {
                let report = self.workdirs.cleanup_working_dirs(Some(&pair.source), Some(&pair.processed));
                self.report_cleanup(&report);
                if report.is_clean() {
                    run.working_source = None;
                    run.working_processed = None;
                }
                return Err(e);
            }
        }

        run.stage = ProcessingStage::Converting;
        Ok(())
    }

    fn record_working_dirs(&mut self, run: &AlbumRun) -> Result<()> {
        self.state.update_album(
            &run.original,
            AlbumPatch {
                working_source_path: Some(run.working_source.clone()),
                working_processed_path: Some(run.working_processed.clone()),
                ..Default::default()
            },
        )?;
        self.catalog.update_album(
            &run.album_id,
            CatalogPatch::stage(run.stage, run.working_source.clone(), run.working_processed.clone()),
        )?;
        Ok(())
    }

    /// Remove staging pairs left for this album by a run that never recorded
    /// them; pairs another album of the session still owns are kept.
    fn discard_stale_pairs(&self, run: &AlbumRun) -> Result<()> {
        let owned: Vec<PathBuf> = self
            .state
            .session()
            .map(|s| {
                s.albums
                    .iter()
                    .filter(|a| a.album_path != run.original)
                    .filter_map(|a| a.working_source_path.clone())
                    .collect()
            })
            .unwrap_or_default();

        for pair in self.workdirs.pairs_for_album(&run.name)? {
            if owned.contains(&pair.source) {
                continue;
            }
            warn!("Removing abandoned working directories {}", pair.source.display());
            let report = self.workdirs.cleanup_working_dirs(Some(&pair.source), Some(&pair.processed));
            self.report_cleanup(&report);
        }
        Ok(())
    }

    async fn convert(&mut self, run: &mut AlbumRun) -> Result<()> {
        self.enter_stage(run, ProcessingStage::Converting, AlbumStatus::Converting)?;
        let source = existing_dir(run.working_source.as_deref(), self.workdirs.root())?;
        let processed = existing_dir(run.working_processed.as_deref(), self.workdirs.root())?;

        self.catalog.add_history(
            &run.album_id,
            HistoryEntry {
                working_source_path: Some(source.clone()),
                working_processed_path: Some(processed.clone()),
                ..HistoryEntry::new(Operation::Convert, HistoryStatus::Started)
            },
        )?;

        let started = Instant::now();
        let max_attempts = self.config.max_retries.max(1);
        let mode = self.config.conversion_mode;

        for file in run.album.music_files.clone() {
            let relative = file.relative_path;
            let input = source.join(&relative);
            let output = processed.join(relative.with_extension(mode.output_extension_for(&file.extension)));

            let done = self
                .state
                .album(&run.original)
                .and_then(|a| a.file(&relative))
                .map_or(false, |f| f.status == FileStatus::Completed);
            if done && output.exists() {
                debug!("{} already converted", relative.display());
                run.files_skipped += 1;
                continue;
            }
            // leftover of an interrupted attempt
            if output.exists() {
                fs::remove_file(&output).at(&output)?;
            }

            let mut last_error = String::new();
            let mut converted = false;
            for attempt in 1..=max_attempts {
                self.state
                    .update_file_status(&run.original, &relative, FileStatus::Converting, None)?;
                let outcome = self.converter.convert(&input, &output, true).await;

                if outcome.success {
                    if outcome.skipped {
                        run.files_skipped += 1;
                    } else {
                        run.files_converted += 1;
                    }
                    self.state
                        .update_file_status(&run.original, &relative, FileStatus::Completed, None)?;
                    self.observer.file_converted(&relative, &outcome);
                    converted = true;
                    break;
                }

                last_error = outcome.message.unwrap_or_else(|| "conversion failed".to_string());
                self.observer.file_failed(&relative, attempt, max_attempts, &last_error);
            }

            if !converted {
                self.state.update_file_status(
                    &run.original,
                    &relative,
                    FileStatus::Failed,
                    Some(last_error.clone()),
                )?;
                return Err(PipelineError::ConversionExhausted {
                    path: relative,
                    attempts: max_attempts,
                    message: last_error,
                });
            }
        }

        self.catalog.add_history(
            &run.album_id,
            HistoryEntry::new(Operation::Convert, HistoryStatus::Success)
                .with_message(format!(
                    "{} converted, {} already present",
                    run.files_converted, run.files_skipped
                ))
                .with_duration(started.elapsed().as_secs_f64()),
        )?;
        run.stage = ProcessingStage::Archiving;
        Ok(())
    }

    fn archive(&mut self, run: &mut AlbumRun) -> Result<()> {
        self.enter_stage(run, ProcessingStage::Archiving, AlbumStatus::Archiving)?;
        let source = existing_dir(run.working_source.as_deref(), self.workdirs.root())?;
        let started = Instant::now();

        let archive_root = self.config.archive_dir.clone();
        fs::create_dir_all(&archive_root).at(&archive_root)?;
        let name = album_name(&run.original);
        let report = self.workdirs.remove_partial_archives(&archive_root, &name);
        self.report_cleanup(&report);

        let archive_path = match self.recorded_archive(run) {
            Some(existing) => {
                info!("  Already archived to {}", existing.display());
                existing
            }
            None => {
                let archive_path = unique_destination(&archive_root, &name);
                let album_id = run.album_id;
                // the sidecar goes in before the rename so a finished archive always carries it
                self.workdirs.copy_to_archive_with(&source, &archive_path, |staged| {
                    if let Err(e) = self.write_archive_sidecar(album_id, staged) {
                        self.observer.warning(&format!(
                            "Could not write metadata for archive {}: {}",
                            archive_path.display(),
                            e
                        ));
                    }
                    Ok(())
                })?;
                archive_path
            }
        };

        run.archive_path = Some(archive_path.clone());
        self.state.update_album(
            &run.original,
            AlbumPatch {
                archive_path: Some(Some(archive_path.clone())),
                ..Default::default()
            },
        )?;
        self.catalog.update_album(
            &run.album_id,
            CatalogPatch {
                archive_path: Some(archive_path.clone()),
                ..Default::default()
            },
        )?;
        self.catalog.add_history(
            &run.album_id,
            HistoryEntry::new(Operation::Archive, HistoryStatus::Success)
                .with_duration(started.elapsed().as_secs_f64()),
        )?;

        run.stage = ProcessingStage::Finalizing;
        Ok(())
    }

    fn write_archive_sidecar(&self, album_id: Uuid, archive: &Path) -> Result<()> {
        let files = self.scanner.scan_album(archive)?.audio_paths();
        if files.is_empty() {
            return Ok(());
        }
        create_sidecar(archive, &files, self.dedup.hasher(), Some(album_id), None).map(|_| ())
    }

    /// An archive this album already completed in an earlier, interrupted run
    fn recorded_archive(&self, run: &AlbumRun) -> Option<PathBuf> {
        let recorded = run.archive_path.clone().filter(|p| p.is_dir())?;
        match read_sidecar(&recorded) {
            Ok(Some(record)) if record.album_id == run.album_id => Some(recorded),
            _ => None,
        }
    }

    /// True when `output` was published for this album rather than for
    /// another one with the same directory name
    fn owns_output(&self, run: &AlbumRun, output: &Path, recorded: Option<&Path>) -> bool {
        if !output.exists() {
            return false;
        }
        if recorded == Some(output) {
            return true;
        }
        matches!(read_sidecar(output), Ok(Some(record)) if record.album_id == run.album_id)
    }

    fn finalize(&mut self, run: &mut AlbumRun) -> Result<()> {
        self.enter_stage(run, ProcessingStage::Finalizing, AlbumStatus::Converting)?;
        let started = Instant::now();

        // named after the original, never after a staging directory
        let output_path = self.config.output_dir.join(album_name(&run.original));

        match run.working_processed.clone().filter(|p| p.exists()) {
            Some(processed) => {
                fs::create_dir_all(&self.config.output_dir).at(&self.config.output_dir)?;
                self.workdirs.move_to_output(&processed, &output_path)?;
            }
            None if self.owns_output(run, &output_path, run.output_path.as_deref()) => {
                info!("  Already published to {}", output_path.display());
            }
            None if output_path.exists() => return Err(PipelineError::DestinationExists(output_path)),
            None => {
                return Err(PipelineError::NotFound(
                    run.working_processed
                        .clone()
                        .unwrap_or_else(|| self.workdirs.root().to_path_buf()),
                ))
            }
        }

        run.working_processed = None;
        run.output_path = Some(output_path.clone());
        self.state.update_album(
            &run.original,
            AlbumPatch {
                output_path: Some(Some(output_path.clone())),
                working_processed_path: Some(None),
                ..Default::default()
            },
        )?;
        self.catalog.update_album(
            &run.album_id,
            CatalogPatch {
                output_path: Some(output_path.clone()),
                working_processed_path: Some(None),
                ..Default::default()
            },
        )?;

        if let Err(e) = self.write_output_sidecar(run.album_id, &output_path) {
            self.observer
                .warning(&format!("Could not write metadata for output {}: {}", output_path.display(), e));
        }

        self.catalog.add_history(
            &run.album_id,
            HistoryEntry::new(Operation::Finalize, HistoryStatus::Success)
                .with_duration(started.elapsed().as_secs_f64()),
        )?;

        if self.config.remove_source_after_conversion {
            self.remove_source(run)?;
        }

        run.stage = ProcessingStage::Completed;
        Ok(())
    }

    /// Sidecar carrying the original id and the identity of the converted audio
    fn write_output_sidecar(&self, album_id: Uuid, output: &Path) -> Result<()> {
        let files = self.scanner.scan_album(output)?.audio_paths();
        if files.is_empty() {
            return Ok(());
        }
        let (processed_id, checksum) = self.dedup.hasher().identity(&files)?;
        let mut record = SidecarRecord::new(album_id, checksum);
        record.processed_album_id = Some(processed_id);
        write_sidecar(output, &record)
    }

    /// Delete the original album unless it looks like a staging directory
    fn remove_source(&mut self, run: &AlbumRun) -> Result<()> {
        let original = &run.original;
        let entry = if original.exists() && !self.workdirs.is_working_directory(original) {
            match fs::remove_dir_all(original) {
                Ok(()) => {
                    info!("🗑️  Removed source {}", original.display());
                    HistoryEntry::new(Operation::Cleanup, HistoryStatus::Success)
                }
                Err(e) => {
                    self.observer
                        .warning(&format!("Failed to remove source {}: {}", original.display(), e));
                    HistoryEntry::new(Operation::Cleanup, HistoryStatus::Failed).with_message(e.to_string())
                }
            }
        } else {
            self.observer.warning(&format!(
                "Skipped source removal, safety check failed for {}",
                original.display()
            ));
            HistoryEntry::new(Operation::Cleanup, HistoryStatus::Skipped).with_message(SAFETY_CHECK_FAILED)
        };
        self.catalog.add_history(&run.album_id, entry)
    }

    fn complete(&mut self, run: &mut AlbumRun) -> Result<()> {
        run.stage = ProcessingStage::Completed;

        if self.config.cleanup_working_on_success {
            let report = self
                .workdirs
                .cleanup_working_dirs(run.working_source.as_deref(), run.working_processed.as_deref());
            self.report_cleanup(&report);
            if report.is_clean() {
                run.working_source = None;
                run.working_processed = None;
            }
        }

        self.state.update_album(
            &run.original,
            AlbumPatch {
                archive_path: Some(run.archive_path.clone()),
                output_path: Some(run.output_path.clone()),
                working_source_path: Some(run.working_source.clone()),
                working_processed_path: Some(None),
                error_message: Some(None),
                ..AlbumPatch::stage(AlbumStatus::Completed, ProcessingStage::Completed)
            },
        )?;
        self.catalog
            .update_album(&run.album_id, CatalogPatch::stage(ProcessingStage::Completed, None, None))?;
        Ok(())
    }

    /// Record a stage failure in session and catalog; the album stays resumable
    fn fail_album(&mut self, run: &mut AlbumRun, error: PipelineError, started: Instant) -> AlbumOutcome {
        let failed_stage = run.stage.failed();
        let message = error.to_string();
        let operation = match run.stage {
            ProcessingStage::Preparing | ProcessingStage::Converting => Operation::Convert,
            ProcessingStage::Archiving => Operation::Archive,
            _ => Operation::Finalize,
        };

        // a failed prepare has already removed what it created
        if self.config.cleanup_working_on_failure && run.stage != ProcessingStage::Preparing {
            let include_processed = matches!(run.stage, ProcessingStage::Converting | ProcessingStage::Archiving);
            let processed = if include_processed {
                run.working_processed.clone()
            } else {
                None
            };
            let report = self
                .workdirs
                .cleanup_working_dirs(run.working_source.as_deref(), processed.as_deref());
            self.report_cleanup(&report);
            if report.is_clean() {
                run.working_source = None;
                if include_processed {
                    run.working_processed = None;
                }
            }
        }

        let patch = AlbumPatch {
            working_source_path: Some(run.working_source.clone()),
            working_processed_path: Some(run.working_processed.clone()),
            ..AlbumPatch::failed(run.stage, message.clone())
        };
        if let Err(e) = self.state.update_album(&run.original, patch) {
            error!("Could not persist failure of {}: {}", run.name, e);
        }
        let catalog_result = self
            .catalog
            .update_album(
                &run.album_id,
                CatalogPatch::stage(failed_stage, run.working_source.clone(), run.working_processed.clone()),
            )
            .and_then(|_| {
                self.catalog.add_history(
                    &run.album_id,
                    HistoryEntry::new(operation, HistoryStatus::Failed)
                        .with_message(message.clone())
                        .with_duration(started.elapsed().as_secs_f64()),
                )
            });
        if let Err(e) = catalog_result {
            error!("Could not record failure of {} in the catalog: {}", run.name, e);
        }

        AlbumOutcome {
            album_path: run.original.clone(),
            name: run.name.clone(),
            status: AlbumStatus::Failed,
            stage: Some(failed_stage),
            message: Some(message),
            files_converted: run.files_converted,
            files_skipped: run.files_skipped,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    fn report_cleanup(&self, report: &CleanupReport) {
        for e in &report.errors {
            self.observer.warning(&format!("Cleanup: {}", e));
        }
    }
}

/// The recorded staging directory, which must still be on disk
fn existing_dir(dir: Option<&Path>, root: &Path) -> Result<PathBuf> {
    match dir {
        Some(d) if d.is_dir() => Ok(d.to_path_buf()),
        Some(d) => Err(PipelineError::NotFound(d.to_path_buf())),
        None => Err(PipelineError::NotFound(root.to_path_buf())),
    }
}
