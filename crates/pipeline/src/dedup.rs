use std::path::{Path, PathBuf};
use log::{debug, info};
use uuid::Uuid;
use crate::catalog::{Catalog, CatalogPatch, CatalogRecord, Operation};
use crate::error::Result;
use crate::identity::{create_sidecar, read_sidecar, sidecar_path, ContentHasher, SidecarRecord};

pub const REASON_NO_SIDECAR: &str = "No metadata file found";
pub const REASON_INVALID_SIDECAR: &str = "Invalid metadata file";
pub const REASON_CHECKSUM_MISMATCH: &str = "Audio files changed (checksum mismatch)";
pub const REASON_NOT_IN_CATALOG: &str = "Album not found in database";
pub const REASON_INCOMPLETE: &str = "Processing incomplete (missing archive or playback path)";
pub const REASON_NO_CONVERSION: &str = "No successful conversion in history";
pub const REASON_PROCESSED: &str = "Album already processed";

/// Verdict on whether an album still needs work
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingStatus {
    pub is_processed: bool,
    pub album_id: Option<Uuid>,
    pub checksum_matches: bool,
    pub in_catalog: bool,
    pub record: Option<CatalogRecord>,
    pub reason: &'static str,
}

impl ProcessingStatus {
    fn unprocessed(reason: &'static str) -> Self {
        Self {
            is_processed: false,
            album_id: None,
            checksum_matches: false,
            in_catalog: false,
            record: None,
            reason,
        }
    }
}

/// Which recorded locations of an album still exist on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationStatus {
    pub source_exists: bool,
    pub archive_exists: bool,
    pub output_exists: bool,
}

/// Decides from sidecar and catalog state whether an album must be (re)processed
#[derive(Debug, Clone)]
pub struct DeduplicationManager {
    hasher: ContentHasher,
    verify_checksums: bool,
}

impl DeduplicationManager {
    pub fn new(hasher: ContentHasher, verify_checksums: bool) -> Self {
        Self {
            hasher,
            verify_checksums,
        }
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Evaluate the processing status of the album at `album_dir`.
    ///
    /// Checks run in a fixed order and the first one that fails decides:
    /// sidecar present, checksum still matching (when verification is on),
    /// catalog record present, archive and output paths both recorded, and a
    /// successful convert in the history. Only an album passing all of them
    /// counts as processed.
    pub fn check_status(
        &self,
        catalog: &dyn Catalog,
        album_dir: &Path,
        files: &[PathBuf],
    ) -> Result<ProcessingStatus> {
        if !sidecar_path(album_dir).exists() {
            return Ok(ProcessingStatus::unprocessed(REASON_NO_SIDECAR));
        }
        let sidecar = match read_sidecar(album_dir)? {
            Some(s) => s,
            None => return Ok(ProcessingStatus::unprocessed(REASON_INVALID_SIDECAR)),
        };
        let album_id = sidecar.album_id;

        let checksum_matches = if self.verify_checksums {
            let current = self.hasher.checksum(files)?;
            if current != sidecar.audio_checksum {
                return Ok(ProcessingStatus {
                    album_id: Some(album_id),
                    ..ProcessingStatus::unprocessed(REASON_CHECKSUM_MISMATCH)
                });
            }
            true
        } else {
            true
        };

        let record = match catalog.get_album(&album_id)? {
            Some(r) => r,
            None => {
                return Ok(ProcessingStatus {
                    album_id: Some(album_id),
                    checksum_matches,
                    ..ProcessingStatus::unprocessed(REASON_NOT_IN_CATALOG)
                })
            }
        };

        let base = ProcessingStatus {
            is_processed: false,
            album_id: Some(album_id),
            checksum_matches,
            in_catalog: true,
            record: Some(record.clone()),
            reason: REASON_INCOMPLETE,
        };

        if record.archive_path.is_none() || record.output_path.is_none() {
            return Ok(base);
        }

        if !catalog.has_successful_operation(&album_id, Operation::Convert)? {
            return Ok(ProcessingStatus {
                reason: REASON_NO_CONVERSION,
                ..base
            });
        }

        Ok(ProcessingStatus {
            is_processed: true,
            reason: REASON_PROCESSED,
            ..base
        })
    }

    /// Returns (skip, reason). A forced run never skips.
    pub fn should_skip(
        &self,
        catalog: &dyn Catalog,
        album_dir: &Path,
        files: &[PathBuf],
        force: bool,
    ) -> Result<(bool, String)> {
        if force {
            return Ok((false, "Force reprocess enabled".to_string()));
        }
        let status = self.check_status(catalog, album_dir, files)?;
        if status.is_processed {
            Ok((true, format!("Already processed: {}", status.reason)))
        } else {
            debug!("{} needs processing: {}", album_dir.display(), status.reason);
            Ok((false, status.reason.to_string()))
        }
    }

    /// Return the album's sidecar identity, computing and persisting one if missing.
    ///
    /// Mixed-format albums are rejected before anything is written.
    pub fn get_or_create_identity(&self, album_dir: &Path, files: &[PathBuf]) -> Result<SidecarRecord> {
        if let Some(existing) = read_sidecar(album_dir)? {
            return Ok(existing);
        }
        self.hasher.validate(files)?;
        let record = create_sidecar(album_dir, files, &self.hasher, None, None)?;
        info!("🆔 New album identity {} for {}", record.album_id, album_dir.display());
        Ok(record)
    }

    /// Catalog record whose content checksum equals that of `files`
    pub fn find_duplicate_by_checksum(
        &self,
        catalog: &dyn Catalog,
        files: &[PathBuf],
    ) -> Result<Option<CatalogRecord>> {
        let checksum = self.hasher.checksum(files)?;
        catalog.find_by_checksum(&checksum)
    }

    /// Point whichever recorded location equals `old_path` at `new_path`.
    ///
    /// Returns false when the album is unknown. A path that matches nothing is a no-op.
    pub fn reconcile_moved_album(
        &self,
        catalog: &mut dyn Catalog,
        album_id: &Uuid,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<bool> {
        let record = match catalog.get_album(album_id)? {
            Some(r) => r,
            None => return Ok(false),
        };

        let mut patch = CatalogPatch::default();
        if record.source_path == old_path {
            patch.source_path = Some(new_path.to_path_buf());
        } else if record.archive_path.as_deref() == Some(old_path) {
            patch.archive_path = Some(new_path.to_path_buf());
        } else if record.output_path.as_deref() == Some(old_path) {
            patch.output_path = Some(new_path.to_path_buf());
        } else {
            return Ok(true);
        }

        info!("Album {} moved: {} -> {}", album_id, old_path.display(), new_path.display());
        catalog.update_album(album_id, patch)
    }

    /// Existence on disk of each location the catalog records for an album
    pub fn verify_album_locations(&self, catalog: &dyn Catalog, album_id: &Uuid) -> Result<LocationStatus> {
        let record = match catalog.get_album(album_id)? {
            Some(r) => r,
            None => return Ok(LocationStatus::default()),
        };
        Ok(LocationStatus {
            source_exists: record.source_path.exists(),
            archive_exists: record.archive_path.map_or(false, |p| p.exists()),
            output_exists: record.output_path.map_or(false, |p| p.exists()),
        })
    }
}
