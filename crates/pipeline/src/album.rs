use std::path::{Path, PathBuf};

/// A music payload file inside an album
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MusicFile {
    pub path: PathBuf,
    /// Path relative to the album root
    pub relative_path: PathBuf,
    /// Lowercase extension without the dot
    pub extension: String,
    pub size: u64,
}

/// An incidental file (artwork, cue sheet, booklet) carried along with an album
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonMusicFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub extension: String,
}

/// One release on disk: a directory tree of audio files plus incidental files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub root_path: PathBuf,
    pub name: String,
    /// Sorted by path
    pub music_files: Vec<MusicFile>,
    pub non_music_files: Vec<NonMusicFile>,
    /// First-level subdirectories (e.g. "CD1", "CD2")
    pub subdirectories: Vec<String>,
}

impl Album {
    /// Total size of music files in bytes
    pub fn total_size(&self) -> u64 {
        self.music_files.iter().map(|f| f.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.music_files.len()
    }

    pub fn audio_paths(&self) -> Vec<PathBuf> {
        self.music_files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Lowercase extension of a path, without the dot
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Whether `path` carries one of `extensions` (compared case-insensitively, dots optional)
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    match extension_of(path) {
        Some(ext) => extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_extension_is_case_insensitive() {
        let exts = vec!["dsf".to_string(), ".ISO".to_string()];
        assert!(has_extension(Path::new("/a/01 Track.DSF"), &exts));
        assert!(has_extension(Path::new("/a/disc.iso"), &exts));
        assert!(!has_extension(Path::new("/a/cover.jpg"), &exts));
        assert!(!has_extension(Path::new("/a/README"), &exts));
    }
}
