use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use serde::Serialize;
use walkdir::WalkDir;
use crate::error::{IoContext, PipelineError, Result};

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The document is written to a temp file in the same directory, synced, and
/// renamed over the target, so readers see either the old or the new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).at(&parent)?;

    let prefix = format!(
        "{}.",
        path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    );
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(&parent)
        .at(&parent)?;

    serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
    tmp.as_file_mut().write_all(b"\n").at(tmp.path())?;
    tmp.as_file().sync_all().at(tmp.path())?;

    tmp.persist(path).map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// All regular files below `root`, keyed by path relative to `root`
pub fn collect_files(root: &Path) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| PipelineError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.insert(rel.to_path_buf(), entry.path().to_path_buf());
        }
    }
    Ok(files)
}

/// Total size in bytes of the regular files below `root`
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Copy a single file, keeping permissions and modification time
pub fn copy_file_preserving(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let bytes = fs::copy(src, dst).at(src)?;

    let mtime = fs::metadata(src).and_then(|m| m.modified()).at(src)?;
    let file = fs::OpenOptions::new().write(true).open(dst).at(dst)?;
    file.set_modified(mtime).at(dst)?;
    Ok(bytes)
}

/// Recursively copy `src` into `dst` (which must not exist yet). Returns bytes copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    if dst.exists() {
        return Err(PipelineError::DestinationExists(dst.to_path_buf()));
    }
    copy_tree_into(src, dst)
}

/// Recursively copy `src` into `dst`, creating `dst` if needed
pub fn copy_tree_into(src: &Path, dst: &Path) -> Result<u64> {
    let mut total = 0;
    fs::create_dir_all(dst).at(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| PipelineError::Io {
            path: src.to_path_buf(),
            source: e.into(),
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(r) if !r.as_os_str().is_empty() => r,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else if entry.file_type().is_file() {
            total += copy_file_preserving(entry.path(), &target)?;
        }
    }
    Ok(total)
}

/// Rename a directory, falling back to copy + remove across filesystems
pub fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) if rename_err.kind() == ErrorKind::CrossesDevices => {
            if let Err(e) = copy_tree(from, to) {
                // never leave a partial destination behind
                let _ = fs::remove_dir_all(to);
                return Err(e);
            }
            fs::remove_dir_all(from).at(from)
        }
        Err(rename_err) => Err(PipelineError::Io {
            path: from.to_path_buf(),
            source: rename_err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["a"], 2);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_tree_preserves_layout_and_mtime() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("CD1")).unwrap();
        fs::write(src.join("CD1/01.dsf"), b"audio").unwrap();
        fs::write(src.join("cover.jpg"), b"img").unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();

        let dst = tmp.path().join("dst");
        let bytes = copy_tree(&src, &dst).unwrap();
        assert_eq!(bytes, 8);
        assert!(dst.join("empty").is_dir());
        assert_eq!(
            fs::metadata(src.join("CD1/01.dsf")).unwrap().modified().unwrap(),
            fs::metadata(dst.join("CD1/01.dsf")).unwrap().modified().unwrap()
        );

        let files = collect_files(&dst).unwrap();
        assert_eq!(
            files.keys().cloned().collect::<Vec<_>>(),
            vec![PathBuf::from("CD1/01.dsf"), PathBuf::from("cover.jpg")]
        );

        assert!(matches!(copy_tree(&src, &dst), Err(PipelineError::DestinationExists(_))));
    }

    #[test]
    fn test_move_dir() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("a");
        fs::create_dir_all(&from).unwrap();
        fs::write(from.join("x"), b"1").unwrap();
        let to = tmp.path().join("nested/b");
        move_dir(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(to.join("x")).unwrap(), b"1");
    }
}
