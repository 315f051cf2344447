use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use crate::album::extension_of;
use crate::error::{IoContext, PipelineError, Result};
use crate::fsutil::write_json_atomic;

/// Name of the identity sidecar kept in every album directory
pub const SIDECAR_FILENAME: &str = ".album_metadata";

/// Namespace for content-derived album ids
pub const ALBUM_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b810_9dad_11d1_80b4_00c04fd430c8);

/// Monolithic disc images, hashed partially
pub const CONTAINER_EXTENSIONS: &[&str] = &["iso"];

/// Per-track audio files, hashed in full
pub const STREAM_EXTENSIONS: &[&str] = &["flac", "dsf", "dff"];

const READ_CHUNK: usize = 8 * 1024 * 1024; // 8MB

/// True for the sidecar and for temp files left by an interrupted sidecar write
pub fn is_sidecar_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(SIDECAR_FILENAME))
        .unwrap_or(false)
}

fn is_container(path: &Path) -> bool {
    extension_of(path)
        .map(|e| CONTAINER_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

fn is_stream(path: &Path) -> bool {
    extension_of(path)
        .map(|e| STREAM_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// SHA-256 of a whole file, streamed in bounded chunks
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buffer).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of the first `limit` bytes of a file followed by its decimal size
pub fn hash_file_partial(path: &Path, limit: u64) -> Result<String> {
    let size = std::fs::metadata(path).at(path)?.len();
    let to_read = limit.min(size);

    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut read_total = 0u64;
    while read_total < to_read {
        let want = ((to_read - read_total) as usize).min(READ_CHUNK);
        let n = file.read(&mut buffer[..want]).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        read_total += n as u64;
    }
    hasher.update(size.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Computes content checksums and content-derived ids for album audio
#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    partial_bytes: u64,
}

impl ContentHasher {
    /// `partial_bytes` is how much of each container image gets hashed
    pub fn new(partial_bytes: u64) -> Self {
        Self { partial_bytes }
    }

    /// Reject albums that mix container images with per-track audio
    pub fn validate(&self, files: &[PathBuf]) -> Result<()> {
        let containers: Vec<_> = files.iter().filter(|f| is_container(f)).collect();
        let streams: Vec<_> = files.iter().filter(|f| is_stream(f)).collect();
        if !containers.is_empty() && !streams.is_empty() {
            return Err(PipelineError::MixedFormats {
                containers: describe(&containers),
                streams: describe(&streams),
            });
        }
        Ok(())
    }

    /// Order-independent checksum of the audio content.
    ///
    /// Files are sorted by path and hashed one by one: container images by
    /// their leading bytes plus size, everything else in full. A lone image
    /// uses its own digest; otherwise the per-file hex digests are
    /// concatenated and hashed again.
    pub fn checksum(&self, files: &[PathBuf]) -> Result<String> {
        self.validate(files)?;

        let mut sorted: Vec<&PathBuf> = files.iter().collect();
        sorted.sort();

        if sorted.len() == 1 && is_container(sorted[0]) {
            return hash_file_partial(sorted[0], self.partial_bytes);
        }

        let mut combined = Sha256::new();
        for file in sorted {
            let digest = if is_container(file) {
                hash_file_partial(file, self.partial_bytes)?
            } else {
                hash_file(file)?
            };
            combined.update(digest.as_bytes());
        }
        Ok(format!("{:x}", combined.finalize()))
    }

    /// Deterministic id for a checksum
    pub fn album_id(checksum: &str) -> Uuid {
        Uuid::new_v5(&ALBUM_ID_NAMESPACE, checksum.as_bytes())
    }

    /// Content id and checksum of an album's audio
    pub fn identity(&self, files: &[PathBuf]) -> Result<(Uuid, String)> {
        let checksum = self.checksum(files)?;
        Ok((Self::album_id(&checksum), checksum))
    }
}

fn describe(paths: &[&PathBuf]) -> String {
    let mut exts: Vec<String> = paths.iter().filter_map(|p| extension_of(p)).collect();
    exts.sort();
    exts.dedup();
    exts.join(", ")
}

/// Identity record persisted beside an album
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub album_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_processed: DateTime<Utc>,
    pub audio_checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_album_id: Option<Uuid>,
    /// Keys written by other tools, kept across updates
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SidecarRecord {
    pub fn new(album_id: Uuid, audio_checksum: String) -> Self {
        let now = Utc::now();
        Self {
            album_id,
            created_at: now,
            last_processed: now,
            audio_checksum,
            processed_album_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Fields a caller may change on an existing sidecar
#[derive(Debug, Clone, Default)]
pub struct SidecarPatch {
    pub processed_album_id: Option<Uuid>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn sidecar_path(album_dir: &Path) -> PathBuf {
    album_dir.join(SIDECAR_FILENAME)
}

/// Read an album's sidecar.
///
/// Returns `Ok(None)` when the file is missing, unparsable, or lacks any of
/// `album_id`, `created_at`, `last_processed`, `audio_checksum`.
pub fn read_sidecar(album_dir: &Path) -> Result<Option<SidecarRecord>> {
    let path = sidecar_path(album_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).at(&path)?;
    match serde_json::from_str::<SidecarRecord>(&content) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!("⚠️  Ignoring invalid sidecar {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Atomically write a sidecar; a crash mid-write leaves the previous one intact
pub fn write_sidecar(album_dir: &Path, record: &SidecarRecord) -> Result<()> {
    write_json_atomic(&sidecar_path(album_dir), record)
}

/// Compute the identity of `files` and write a fresh sidecar into `album_dir`.
///
/// `album_id` overrides the content-derived id (a converted album keeps the id
/// of the album it came from).
pub fn create_sidecar(
    album_dir: &Path,
    files: &[PathBuf],
    hasher: &ContentHasher,
    album_id: Option<Uuid>,
    processed_album_id: Option<Uuid>,
) -> Result<SidecarRecord> {
    let (content_id, checksum) = hasher.identity(files)?;
    let mut record = SidecarRecord::new(album_id.unwrap_or(content_id), checksum);
    record.processed_album_id = processed_album_id;
    write_sidecar(album_dir, &record)?;
    debug!("Wrote sidecar for {} ({})", album_dir.display(), record.album_id);
    Ok(record)
}

/// Merge `patch` into an existing sidecar, keeping its id, checksum and creation time
pub fn update_sidecar(album_dir: &Path, patch: SidecarPatch) -> Result<SidecarRecord> {
    let mut record = read_sidecar(album_dir)?
        .ok_or_else(|| PipelineError::NotFound(sidecar_path(album_dir)))?;

    if let Some(id) = patch.processed_album_id {
        record.processed_album_id = Some(id);
    }
    for (key, value) in patch.extra {
        record.extra.insert(key, value);
    }
    // strictly advance even when the clock has not
    let now = Utc::now();
    let floor = record.last_processed + Duration::microseconds(1);
    record.last_processed = if now > floor { now } else { floor };

    write_sidecar(album_dir, &record)?;
    Ok(record)
}

/// Recompute the checksum of `files` and compare it to the stored one.
///
/// An album without a readable sidecar never verifies.
pub fn verify_sidecar(album_dir: &Path, files: &[PathBuf], hasher: &ContentHasher) -> Result<bool> {
    match read_sidecar(album_dir)? {
        Some(record) => Ok(hasher.checksum(files)? == record.audio_checksum),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn hasher() -> ContentHasher {
        ContentHasher::new(20 * 1024 * 1024)
    }

    fn write_files(dir: &Path, files: &[(&str, &[u8])]) -> Vec<PathBuf> {
        files
            .iter()
            .map(|(name, data)| {
                let p = dir.join(name);
                fs::create_dir_all(p.parent().unwrap()).unwrap();
                fs::write(&p, data).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_hash_file_matches_digest() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("a.dsf", b"test content")]);
        assert_eq!(
            hash_file(&files[0]).unwrap(),
            format!("{:x}", Sha256::digest(b"test content"))
        );
    }

    #[test]
    fn test_partial_hash_covers_prefix_and_size() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("a.iso", b"0123456789"), ("b.iso", b"0123ZZZZZZ")]);

        let mut expected = Sha256::new();
        expected.update(b"0123");
        expected.update(b"10");
        assert_eq!(
            hash_file_partial(&files[0], 4).unwrap(),
            format!("{:x}", expected.finalize())
        );
        // bytes past the prefix are not hashed
        assert_eq!(
            hash_file_partial(&files[0], 4).unwrap(),
            hash_file_partial(&files[1], 4).unwrap()
        );
    }

    #[test]
    fn test_identity_is_location_independent() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let content: &[(&str, &[u8])] = &[("01.dsf", b"one"), ("CD2/01.dsf", b"two")];
        let fa = write_files(a.path(), content);
        let fb = write_files(b.path(), content);

        assert_eq!(hasher().identity(&fa).unwrap(), hasher().identity(&fb).unwrap());
    }

    #[test]
    fn test_single_iso_uses_own_digest() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("disc.iso", b"image bytes")]);
        let h = hasher();
        assert_eq!(
            h.checksum(&files).unwrap(),
            hash_file_partial(&files[0], 20 * 1024 * 1024).unwrap()
        );
    }

    #[test]
    fn test_mixed_formats_rejected_everywhere() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("disc.iso", b"x"), ("01.dsf", b"y")]);
        let h = hasher();
        assert!(matches!(h.validate(&files), Err(PipelineError::MixedFormats { .. })));
        assert!(matches!(h.checksum(&files), Err(PipelineError::MixedFormats { .. })));
        let err = h.identity(&files).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("dsf"));
    }

    #[test]
    fn test_file_count_changes_checksum() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("01.dsf", b"a"), ("02.dsf", b"b")]);
        let h = hasher();
        assert_ne!(h.checksum(&files).unwrap(), h.checksum(&files[..1]).unwrap());
    }

    #[test]
    fn test_sidecar_missing_key_is_absent() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            sidecar_path(tmp.path()),
            r#"{"album_id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8", "created_at": "2024-01-01T00:00:00Z", "audio_checksum": "ab"}"#,
        )
        .unwrap();
        assert!(read_sidecar(tmp.path()).unwrap().is_none());

        fs::write(sidecar_path(tmp.path()), "not json").unwrap();
        assert!(read_sidecar(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn test_sidecar_preserves_extra_keys() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            sidecar_path(tmp.path()),
            r#"{"album_id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8", "created_at": "2024-01-01T00:00:00Z",
                "last_processed": "2024-01-01T00:00:00Z", "audio_checksum": "ab", "musicbrainz_id": "mb-1"}"#,
        )
        .unwrap();

        let record = update_sidecar(tmp.path(), SidecarPatch::default()).unwrap();
        assert_eq!(record.extra["musicbrainz_id"], "mb-1");
        let reread = read_sidecar(tmp.path()).unwrap().unwrap();
        assert_eq!(reread.extra["musicbrainz_id"], "mb-1");
    }

    #[test]
    fn test_update_is_idempotent_and_advances() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("01.dsf", b"audio")]);
        let h = hasher();
        let created = create_sidecar(tmp.path(), &files, &h, None, None).unwrap();

        let processed = Uuid::new_v4();
        let mut previous = created.clone();
        for _ in 0..3 {
            let updated = update_sidecar(
                tmp.path(),
                SidecarPatch {
                    processed_album_id: Some(processed),
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(updated.album_id, created.album_id);
            assert_eq!(updated.audio_checksum, created.audio_checksum);
            assert_eq!(updated.created_at, created.created_at);
            assert_eq!(updated.processed_album_id, Some(processed));
            assert!(updated.last_processed > previous.last_processed);
            previous = updated;
        }
        assert!(verify_sidecar(tmp.path(), &files, &h).unwrap());
    }

    #[test]
    fn test_update_without_sidecar_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            update_sidecar(tmp.path(), SidecarPatch::default()),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_verify_detects_drift() {
        let tmp = TempDir::new().unwrap();
        let files = write_files(tmp.path(), &[("01.dsf", b"audio")]);
        let h = hasher();
        create_sidecar(tmp.path(), &files, &h, None, None).unwrap();
        fs::write(&files[0], b"AUDIO").unwrap();
        assert!(!verify_sidecar(tmp.path(), &files, &h).unwrap());
    }

    #[test]
    fn test_sidecar_artifacts() {
        assert!(is_sidecar_artifact(Path::new("/a/.album_metadata")));
        assert!(is_sidecar_artifact(Path::new("/a/.album_metadata.x1y2.tmp")));
        assert!(!is_sidecar_artifact(Path::new("/a/01.dsf")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Shuffling the input list never changes the result
        #[test]
        fn test_checksum_order_independent(
            contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..6),
            seed in any::<u64>(),
        ) {
            let tmp = TempDir::new().unwrap();
            let files: Vec<PathBuf> = contents
                .iter()
                .enumerate()
                .map(|(i, data)| {
                    let p = tmp.path().join(format!("{:02}.dsf", i));
                    fs::write(&p, data).unwrap();
                    p
                })
                .collect();

            let mut shuffled = files.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((seed >> (i % 64)) as usize + i * 7) % len;
                shuffled.swap(i, j);
            }

            let h = hasher();
            prop_assert_eq!(h.identity(&files).unwrap(), h.identity(&shuffled).unwrap());
        }

        /// Flipping any single byte changes the checksum
        #[test]
        fn test_checksum_single_byte_sensitive(
            data in prop::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
        ) {
            let tmp = TempDir::new().unwrap();
            let file = tmp.path().join("01.dsf");
            fs::write(&file, &data).unwrap();
            let h = hasher();
            let before = h.checksum(&[file.clone()]).unwrap();

            let mut mutated = data.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= 0x01;
            fs::write(&file, &mutated).unwrap();

            prop_assert_ne!(before, h.checksum(&[file]).unwrap());
        }
    }
}
