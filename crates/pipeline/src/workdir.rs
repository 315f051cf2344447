use std::fs;
use std::path::{Path, PathBuf};
use chrono::Local;
use log::{debug, info, warn};
use sysinfo::Disks;
use walkdir::WalkDir;
use crate::album::has_extension;
use crate::config::PipelineConfig;
use crate::error::{IoContext, PipelineError, Result};
use crate::fsutil::{collect_files, copy_file_preserving, copy_tree, copy_tree_into, move_dir, tree_size};
use crate::identity::{hash_file, is_sidecar_artifact};

pub const SOURCE_SUFFIX: &str = "_source";
pub const PROCESSED_SUFFIX: &str = "_processed";

/// Longest sanitized album name used in working directory names
pub const MAX_NAME_LEN: usize = 200;

const ORDINARY_MULTIPLIER: u64 = 3;
const CONTAINER_MULTIPLIER: u64 = 5;

const PARTIAL_SUFFIX: &str = ".partial";

/// Free-space probe for the filesystem holding a path
pub trait DiskSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Reads free space from the mounted disks via sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let resolved = existing_ancestor(path)
            .canonicalize()
            .at(path)?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| resolved.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
            .ok_or_else(|| PipelineError::NotFound(resolved.clone()))
    }
}

fn existing_ancestor(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return Path::new("."),
        }
    }
    current
}

/// Staging directories owned by one album while it is processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirPair {
    pub source: PathBuf,
    pub processed: PathBuf,
}

/// Outcome of a best-effort cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a passing space check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCheck {
    pub required: u64,
    pub available: u64,
}

/// Replace path-hostile characters with `_` and cap the length
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .take(MAX_NAME_LEN)
        .collect()
}

/// `parent/name`, or `parent/name_<timestamp>` when that is already taken
pub fn unique_destination(parent: &Path, name: &str) -> PathBuf {
    let candidate = parent.join(name);
    if !candidate.exists() {
        return candidate;
    }
    parent.join(format!("{}_{}", name, Local::now().format("%Y%m%d_%H%M%S")))
}

/// Allocates, fills, promotes and removes per-album staging directories
pub struct WorkingDirectoryManager {
    root: PathBuf,
    verify_copies: bool,
    hash_max_bytes: u64,
    safety_margin: u64,
    music_extensions: Vec<String>,
    disk: Box<dyn DiskSpace>,
}

impl WorkingDirectoryManager {
    /// Create the manager and its working root
    pub fn new(config: &PipelineConfig, disk: Box<dyn DiskSpace>) -> Result<Self> {
        fs::create_dir_all(&config.working_dir).at(&config.working_dir)?;
        Ok(Self {
            root: config.working_dir.clone(),
            verify_copies: config.verify_copies,
            hash_max_bytes: config.copy_verify_hash_max_bytes,
            safety_margin: config.safety_margin_bytes(),
            music_extensions: config.music_extensions.clone(),
            disk,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes needed to stage an album, before the safety margin.
    ///
    /// Ordinary albums need three times their size (working copy, conversion
    /// output, archive copy); albums holding a disc image need five, since the
    /// image is extracted before it is transcoded.
    pub fn estimate_required_space(&self, album_root: &Path) -> u64 {
        if !album_root.exists() {
            return 0;
        }
        let has_container = WalkDir::new(album_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file() && has_extension(e.path(), &["iso".to_string()]));
        let multiplier = if has_container {
            CONTAINER_MULTIPLIER
        } else {
            ORDINARY_MULTIPLIER
        };
        tree_size(album_root) * multiplier
    }

    /// Estimate plus the configured safety margin
    pub fn required_space(&self, album_root: &Path) -> u64 {
        self.estimate_required_space(album_root) + self.safety_margin
    }

    /// Fail with `InsufficientSpace` unless the working root can hold the album
    pub fn check_disk_space(&self, album_root: &Path) -> Result<SpaceCheck> {
        let required = self.required_space(album_root);
        let available = self.disk.available_bytes(&self.root)?;
        if available < required {
            return Err(PipelineError::InsufficientSpace { required, available });
        }
        Ok(SpaceCheck { required, available })
    }

    /// Allocate a fresh `<name>_<timestamp>_source` / `_processed` pair
    pub fn create_working_dirs(&self, album_name: &str) -> Result<WorkingDirPair> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", sanitize_name(album_name), stamp);
        let pair = WorkingDirPair {
            source: self.root.join(format!("{}{}", base, SOURCE_SUFFIX)),
            processed: self.root.join(format!("{}{}", base, PROCESSED_SUFFIX)),
        };

        if pair.source.exists() || pair.processed.exists() {
            return Err(PipelineError::WorkingDirsExist(pair.source));
        }
        create_exclusive(&pair.source)?;
        if let Err(e) = create_exclusive(&pair.processed) {
            let _ = fs::remove_dir(&pair.source);
            return Err(e);
        }

        debug!("Created working dirs {}", pair.source.display());
        Ok(pair)
    }

    /// Copy an album's contents into an existing source staging dir.
    ///
    /// With verification on, a mismatch empties the staging dir again and
    /// fails naming the offending file.
    pub fn copy_to_source(&self, album_root: &Path, source_dir: &Path) -> Result<u64> {
        if !album_root.exists() {
            return Err(PipelineError::NotFound(album_root.to_path_buf()));
        }
        if !source_dir.is_dir() {
            return Err(PipelineError::NotFound(source_dir.to_path_buf()));
        }

        let result = copy_tree_into(album_root, source_dir).and_then(|bytes| {
            if self.verify_copies {
                self.verify_copy(album_root, source_dir)?;
            }
            Ok(bytes)
        });

        if result.is_err() {
            warn!("Rolling back staged copy in {}", source_dir.display());
            let _ = fs::remove_dir_all(source_dir);
            let _ = fs::create_dir(source_dir);
        }
        result
    }

    /// Compare two trees: same file count, same relative paths, same sizes,
    /// and identical content for files under the hash threshold.
    pub fn verify_copy(&self, source: &Path, dest: &Path) -> Result<()> {
        let source_files = collect_files(source)?;
        let dest_files = collect_files(dest)?;

        if source_files.len() != dest_files.len() {
            return Err(PipelineError::FileCountMismatch {
                source_count: source_files.len(),
                dest_count: dest_files.len(),
            });
        }

        for (relative, src_path) in &source_files {
            let dst_path = match dest_files.get(relative) {
                Some(p) => p,
                None => {
                    return Err(PipelineError::VerificationFailed {
                        relative: relative.clone(),
                        reason: "missing in destination".to_string(),
                    })
                }
            };

            let src_size = fs::metadata(src_path).at(src_path)?.len();
            let dst_size = fs::metadata(dst_path).at(dst_path)?.len();
            if src_size != dst_size {
                return Err(PipelineError::VerificationFailed {
                    relative: relative.clone(),
                    reason: format!("size mismatch: source={}, dest={}", src_size, dst_size),
                });
            }

            if src_size < self.hash_max_bytes && hash_file(src_path)? != hash_file(dst_path)? {
                return Err(PipelineError::VerificationFailed {
                    relative: relative.clone(),
                    reason: "content mismatch".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Mirror the album's directory tree and non-music files into `processed_dir`
    pub fn create_processed_structure(&self, album_root: &Path, processed_dir: &Path) -> Result<()> {
        if !album_root.exists() {
            return Err(PipelineError::NotFound(album_root.to_path_buf()));
        }
        if !processed_dir.is_dir() {
            return Err(PipelineError::NotFound(processed_dir.to_path_buf()));
        }

        for entry in WalkDir::new(album_root).follow_links(false) {
            let entry = entry.map_err(|e| PipelineError::Io {
                path: album_root.to_path_buf(),
                source: e.into(),
            })?;
            let rel = match entry.path().strip_prefix(album_root) {
                Ok(r) if !r.as_os_str().is_empty() => r,
                _ => continue,
            };
            let target = processed_dir.join(rel);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).at(&target)?;
            } else if entry.file_type().is_file()
                && !has_extension(entry.path(), &self.music_extensions)
                && !is_sidecar_artifact(entry.path())
            {
                copy_file_preserving(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    /// Copy a staged source tree to its permanent archive location
    pub fn copy_to_archive(&self, source_dir: &Path, archive_path: &Path) -> Result<()> {
        self.copy_to_archive_with(source_dir, archive_path, |_| Ok(()))
    }

    /// Copy into the hidden `.<name>.partial` sibling, verify, run `before_commit`
    /// on the staged tree, then rename it into place.
    ///
    /// `archive_path` therefore only ever names a complete archive. A stale
    /// partial from an interrupted copy is replaced.
    pub fn copy_to_archive_with<F>(&self, source_dir: &Path, archive_path: &Path, before_commit: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if !source_dir.exists() {
            return Err(PipelineError::NotFound(source_dir.to_path_buf()));
        }
        if archive_path.exists() {
            return Err(PipelineError::DestinationExists(archive_path.to_path_buf()));
        }

        let partial = partial_archive_path(archive_path);
        if partial.exists() {
            warn!("Replacing stale partial archive {}", partial.display());
            fs::remove_dir_all(&partial).at(&partial)?;
        }

        let result = copy_tree(source_dir, &partial)
            .and_then(|_| {
                if self.verify_copies {
                    self.verify_copy(source_dir, &partial)?;
                }
                before_commit(&partial)
            })
            .and_then(|_| fs::rename(&partial, archive_path).at(archive_path));
        if result.is_err() && partial.exists() {
            warn!("Removing partial archive {}", partial.display());
            let _ = fs::remove_dir_all(&partial);
        }
        result?;

        info!("📦 Archived to {}", archive_path.display());
        Ok(())
    }

    /// Remove `.<name>.partial` and `.<name>_<timestamp>.partial` leftovers
    /// from `archive_root`; failures are reported, never raised
    pub fn remove_partial_archives(&self, archive_root: &Path, name: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let entries = match fs::read_dir(archive_root) {
            Ok(entries) => entries,
            Err(_) => return report,
        };
        let prefix = format!(".{}", name);
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let rest = match file_name
                .strip_prefix(&prefix)
                .and_then(|r| r.strip_suffix(PARTIAL_SUFFIX))
            {
                Some(r) => r,
                None => continue,
            };
            if !(rest.is_empty() || is_stamp(rest)) || !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    warn!("Removed interrupted archive copy {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.errors.push(format!("failed to remove {}: {}", path.display(), e));
                }
            }
        }
        report
    }

    /// Promote the processed tree to its output location by renaming it
    pub fn move_to_output(&self, processed_dir: &Path, output_path: &Path) -> Result<()> {
        if !processed_dir.exists() {
            return Err(PipelineError::NotFound(processed_dir.to_path_buf()));
        }
        if output_path.exists() {
            return Err(PipelineError::DestinationExists(output_path.to_path_buf()));
        }
        move_dir(processed_dir, output_path)?;
        info!("📤 Published to {}", output_path.display());
        Ok(())
    }

    /// Remove staging directories; failures are reported, never raised
    pub fn cleanup_working_dirs(&self, source: Option<&Path>, processed: Option<&Path>) -> CleanupReport {
        let mut report = CleanupReport::default();
        for dir in [source, processed].into_iter().flatten() {
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => report.removed.push(dir.to_path_buf()),
                Err(e) => {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                    report.errors.push(format!("failed to remove {}: {}", dir.display(), e));
                }
            }
        }
        report
    }

    /// Every `_source` dir under the working root that has a `_processed` sibling
    pub fn list_working_directories(&self) -> Result<Vec<WorkingDirPair>> {
        let mut pairs = Vec::new();
        if !self.root.exists() {
            return Ok(pairs);
        }
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let path = entry.at(&self.root)?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if !path.is_dir() {
                continue;
            }
            if let Some(base) = name.strip_suffix(SOURCE_SUFFIX) {
                let processed = self.root.join(format!("{}{}", base, PROCESSED_SUFFIX));
                if processed.is_dir() {
                    pairs.push(WorkingDirPair {
                        source: path,
                        processed,
                    });
                }
            }
        }
        pairs.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(pairs)
    }

    /// Staging pairs allocated for `album_name` by [`Self::create_working_dirs`]
    pub fn pairs_for_album(&self, album_name: &str) -> Result<Vec<WorkingDirPair>> {
        let prefix = sanitize_name(album_name);
        let pairs = self.list_working_directories()?;
        Ok(pairs
            .into_iter()
            .filter(|pair| {
                pair.source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(SOURCE_SUFFIX))
                    .and_then(|base| base.strip_prefix(prefix.as_str()))
                    .map_or(false, is_stamp)
            })
            .collect())
    }

    /// Files with `extension` already present in a processed dir, sorted
    pub fn get_converted_tracks(&self, processed_dir: &Path, extension: &str) -> Vec<PathBuf> {
        if !processed_dir.exists() {
            return Vec::new();
        }
        let exts = [extension.to_string()];
        let mut tracks: Vec<PathBuf> = WalkDir::new(processed_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && has_extension(e.path(), &exts))
            .map(|e| e.path().to_path_buf())
            .collect();
        tracks.sort();
        tracks
    }

    /// True for staging directories, which must never be deleted as album sources
    pub fn is_working_directory(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        name.ends_with(SOURCE_SUFFIX)
            || name.ends_with(PROCESSED_SUFFIX)
            || (path != self.root && path.starts_with(&self.root))
    }
}

/// Staging location for an archive that is still being copied
pub fn partial_archive_path(archive_path: &Path) -> PathBuf {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    archive_path.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

/// `_YYYYmmdd_HHMMSS`, as appended by `create_working_dirs` and `unique_destination`
fn is_stamp(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    bytes.len() == 16
        && bytes[0] == b'_'
        && bytes[9] == b'_'
        && bytes[1..9].iter().all(u8::is_ascii_digit)
        && bytes[10..].iter().all(u8::is_ascii_digit)
}

fn create_exclusive(dir: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(PipelineError::WorkingDirsExist(dir.to_path_buf()))
        }
        Err(e) => Err(PipelineError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Disk probe reporting a fixed amount of free space
    pub(crate) struct FixedDiskSpace(pub u64);

    impl DiskSpace for FixedDiskSpace {
        fn available_bytes(&self, _path: &Path) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn manager(tmp: &TempDir, free: u64) -> WorkingDirectoryManager {
        let cfg = PipelineConfig {
            working_dir: tmp.path().join("working"),
            safety_margin_gb: 0.0,
            ..Default::default()
        };
        WorkingDirectoryManager::new(&cfg, Box::new(FixedDiskSpace(free))).unwrap()
    }

    fn album(tmp: &TempDir, files: &[(&str, &[u8])]) -> PathBuf {
        let root = tmp.path().join("in/Album");
        for (name, data) in files {
            let p = root.join(name);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, data).unwrap();
        }
        root
    }

    #[test]
    fn test_estimate_multipliers() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, 0);
        let plain = album(&tmp, &[("01.dsf", &[0u8; 100]), ("cover.jpg", &[0u8; 10])]);
        assert_eq!(m.estimate_required_space(&plain), 330);

        fs::write(plain.join("disc.ISO"), [0u8; 90]).unwrap();
        assert_eq!(m.estimate_required_space(&plain), 200 * 5);
        assert_eq!(m.estimate_required_space(&tmp.path().join("missing")), 0);
    }

    #[test]
    fn test_margin_is_added() {
        let tmp = TempDir::new().unwrap();
        let cfg = PipelineConfig {
            working_dir: tmp.path().join("working"),
            safety_margin_gb: 1.0,
            ..Default::default()
        };
        let m = WorkingDirectoryManager::new(&cfg, Box::new(FixedDiskSpace(0))).unwrap();
        let root = album(&tmp, &[("01.dsf", &[0u8; 10])]);
        assert_eq!(m.required_space(&root), 30 + 1024 * 1024 * 1024);
    }

    #[test]
    fn test_insufficient_space_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, 10);
        let root = album(&tmp, &[("01.dsf", &[0u8; 100])]);

        match m.check_disk_space(&root) {
            Err(PipelineError::InsufficientSpace { required, available }) => {
                assert_eq!(required, 300);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(fs::read_dir(m.root()).unwrap().count(), 0);

        let ok = manager(&tmp, 300).check_disk_space(&root).unwrap();
        assert_eq!(ok.required, 300);
    }

    #[test]
    fn test_create_working_dirs_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let pair = m.create_working_dirs("Artist: Best/Of?").unwrap();
        let name = pair.source.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("Artist_ Best_Of__"));
        assert!(name.ends_with("_source"));
        assert!(pair.processed.is_dir());

        // same second, same name: refuses to reuse the pair
        match m.create_working_dirs("Artist: Best/Of?") {
            Err(PipelineError::WorkingDirsExist(_)) => {}
            Ok(second) => assert_ne!(second, pair, "a new pair needs a new timestamp"),
            Err(other) => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_copy_to_source_and_structure() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let root = album(
            &tmp,
            &[("CD1/01.dsf", b"one"), ("CD2/01.dsf", b"two"), ("booklet.pdf", b"pdf"), (".album_metadata", b"{}")],
        );
        let pair = m.create_working_dirs("Album").unwrap();

        assert_eq!(m.copy_to_source(&root, &pair.source).unwrap(), 11);
        assert_eq!(fs::read(pair.source.join("CD2/01.dsf")).unwrap(), b"two");

        m.create_processed_structure(&root, &pair.processed).unwrap();
        assert!(pair.processed.join("CD1").is_dir());
        assert!(pair.processed.join("booklet.pdf").is_file());
        assert!(!pair.processed.join("CD1/01.dsf").exists());
        assert!(!pair.processed.join(".album_metadata").exists());
    }

    #[test]
    fn test_verify_names_corrupted_file() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let root = album(&tmp, &[("CD1/01.dsf", b"abcdef"), ("CD1/02.dsf", b"ghijkl")]);
        let copy = tmp.path().join("copy");
        copy_tree(&root, &copy).unwrap();
        m.verify_copy(&root, &copy).unwrap();

        fs::write(copy.join("CD1/02.dsf"), b"ghijkX").unwrap();
        match m.verify_copy(&root, &copy) {
            Err(PipelineError::VerificationFailed { relative, reason }) => {
                assert_eq!(relative, PathBuf::from("CD1/02.dsf"));
                assert_eq!(reason, "content mismatch");
            }
            other => panic!("unexpected: {:?}", other),
        }

        fs::write(copy.join("extra.txt"), b"x").unwrap();
        assert!(matches!(
            m.verify_copy(&root, &copy),
            Err(PipelineError::FileCountMismatch { source_count: 2, dest_count: 3 })
        ));
    }

    #[test]
    fn test_archive_and_output_refuse_overwrite() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let root = album(&tmp, &[("01.dsf", b"x")]);
        let pair = m.create_working_dirs("Album").unwrap();
        m.copy_to_source(&root, &pair.source).unwrap();

        let archive = tmp.path().join("archive/Album");
        m.copy_to_archive(&pair.source, &archive).unwrap();
        assert!(pair.source.join("01.dsf").exists(), "archive copy keeps the source");
        assert!(matches!(
            m.copy_to_archive(&pair.source, &archive),
            Err(PipelineError::DestinationExists(_))
        ));

        let output = tmp.path().join("output/Album");
        fs::create_dir_all(&output).unwrap();
        assert!(matches!(
            m.move_to_output(&pair.processed, &output),
            Err(PipelineError::DestinationExists(_))
        ));
        fs::remove_dir(&output).unwrap();
        m.move_to_output(&pair.processed, &output).unwrap();
        assert!(!pair.processed.exists());
        assert!(output.is_dir());
    }

    #[test]
    fn test_archive_is_staged_then_renamed() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let root = album(&tmp, &[("01.dsf", b"one"), ("CD2/02.dsf", b"two")]);
        let pair = m.create_working_dirs("Album").unwrap();
        m.copy_to_source(&root, &pair.source).unwrap();

        // an interrupted earlier copy
        let archive_root = tmp.path().join("archive");
        let stale = archive_root.join(".Album.partial");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("01.dsf"), b"o").unwrap();

        let archive = archive_root.join("Album");
        let mut staged_at = None;
        m.copy_to_archive_with(&pair.source, &archive, |staged| {
            assert!(!archive.exists(), "final name appears only after the rename");
            fs::write(staged.join("marker"), b"m").unwrap();
            staged_at = Some(staged.to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(staged_at, Some(stale.clone()));
        assert!(!stale.exists());
        assert_eq!(fs::read(archive.join("01.dsf")).unwrap(), b"one");
        assert!(archive.join("marker").is_file());
        assert_eq!(fs::read_dir(&archive_root).unwrap().count(), 1);

        // a failing commit hook leaves neither the archive nor a partial
        let second = archive_root.join("Album_2");
        let result = m.copy_to_archive_with(&pair.source, &second, |_| {
            Err(PipelineError::NotFound(PathBuf::from("hook")))
        });
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
        assert!(!second.exists());
        assert!(!partial_archive_path(&second).exists());
    }

    #[test]
    fn test_remove_partial_archives_matches_album_only() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let root = tmp.path().join("archive");
        for name in [
            ".Album.partial",
            ".Album_20240101_000000.partial",
            ".Album Live.partial",
            "Album",
        ] {
            fs::create_dir_all(root.join(name)).unwrap();
        }

        let report = m.remove_partial_archives(&root, "Album");
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 2);
        assert!(root.join(".Album Live.partial").is_dir());
        assert!(root.join("Album").is_dir());
        assert!(m.remove_partial_archives(&tmp.path().join("missing"), "Album").removed.is_empty());
    }

    #[test]
    fn test_pairs_for_album_matches_stamped_names() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        for base in ["Kind of Blue_20240101_000000", "Kind of Blue Live_20240101_000000", "Kind of Blue_x"] {
            fs::create_dir_all(m.root().join(format!("{}_source", base))).unwrap();
            fs::create_dir_all(m.root().join(format!("{}_processed", base))).unwrap();
        }

        let pairs = m.pairs_for_album("Kind of Blue").unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].source, m.root().join("Kind of Blue_20240101_000000_source"));
        assert_eq!(m.pairs_for_album("Kind of Blue Live").unwrap().len(), 1);
    }

    #[test]
    fn test_listing_and_cleanup() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, u64::MAX);
        let pair = m.create_working_dirs("A").unwrap();
        fs::create_dir(m.root().join("orphan_source")).unwrap();
        fs::write(pair.processed.join("01.flac"), b"f").unwrap();
        fs::create_dir(pair.processed.join("CD2")).unwrap();
        fs::write(pair.processed.join("CD2/01.FLAC"), b"f").unwrap();
        fs::write(pair.processed.join("cover.jpg"), b"j").unwrap();

        assert_eq!(m.list_working_directories().unwrap(), vec![pair.clone()]);
        assert_eq!(m.get_converted_tracks(&pair.processed, "flac").len(), 2);
        assert!(m.is_working_directory(&pair.source));
        assert!(m.is_working_directory(&pair.processed.join("CD2")));
        assert!(!m.is_working_directory(&tmp.path().join("in/Album")));

        let report = m.cleanup_working_dirs(Some(&pair.source), Some(&pair.processed));
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 2);
        let again = m.cleanup_working_dirs(Some(&pair.source), None);
        assert!(again.removed.is_empty() && again.is_clean());
    }

    #[test]
    fn test_unique_destination() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(unique_destination(tmp.path(), "A"), tmp.path().join("A"));
        fs::create_dir(tmp.path().join("A")).unwrap();
        let next = unique_destination(tmp.path(), "A");
        assert_ne!(next, tmp.path().join("A"));
        assert!(next.file_name().unwrap().to_str().unwrap().starts_with("A_"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_sanitize_never_leaves_separators(name in "\\PC{0,300}") {
            let clean = sanitize_name(&name);
            prop_assert!(clean.chars().count() <= MAX_NAME_LEN);
            prop_assert!(!clean.contains('/'));
            prop_assert!(!clean.contains('\\'));
            prop_assert!(!clean.contains(':'));
        }

        #[test]
        fn test_estimate_scales_with_size(size in 0usize..4096, iso in any::<bool>()) {
            let tmp = TempDir::new().unwrap();
            let m = manager(&tmp, 0);
            let name = if iso { "disc.iso" } else { "01.dsf" };
            let root = album(&tmp, &[(name, &vec![0u8; size])]);
            let expected = size as u64 * if iso { 5 } else { 3 };
            prop_assert_eq!(m.estimate_required_space(&root), expected);
        }
    }
}
