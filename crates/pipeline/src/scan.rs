use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use log::{debug, info, warn};
use crate::album::{extension_of, has_extension, Album, MusicFile, NonMusicFile};
use crate::error::{IoContext, PipelineError, Result};
use crate::identity::is_sidecar_artifact;

/// Walks an input tree and groups music files into albums
#[derive(Debug, Clone)]
pub struct AlbumScanner {
    music_extensions: Vec<String>,
    copy_extensions: Vec<String>,
}

/// Aggregate counts over a scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStatistics {
    pub album_count: usize,
    pub total_files: usize,
    pub total_size_bytes: u64,
    /// (extension, count), sorted by extension
    pub extensions: Vec<(String, usize)>,
}

impl AlbumScanner {
    pub fn new(music_extensions: Vec<String>, copy_extensions: Vec<String>) -> Self {
        Self {
            music_extensions,
            copy_extensions,
        }
    }

    /// Scan `root` for albums.
    ///
    /// A directory that directly contains music files is an album and owns its
    /// whole subtree. With `single_album`, or when no directory below the root
    /// qualifies but the root's subtree holds music, the root is one album.
    pub fn scan(&self, root: &Path, single_album: bool) -> Result<Vec<Album>> {
        if !root.exists() {
            return Err(PipelineError::NotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(PipelineError::Io {
                path: root.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        info!("Scanning directory: {}", root.display());

        if single_album || self.directly_contains_music(root)? {
            let album = self.scan_album(root)?;
            return Ok(if album.file_count() > 0 { vec![album] } else { Vec::new() });
        }

        let mut albums = Vec::new();
        let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() || entry.path() == root {
                continue;
            }

            if self.directly_contains_music(entry.path())? {
                let album = self.scan_album(entry.path())?;
                if album.file_count() > 0 {
                    debug!("Found album: {} ({} music files)", album.name, album.file_count());
                    albums.push(album);
                }
                // Subdirectories (CD1, CD2, ...) belong to this album
                walker.skip_current_dir();
            }
        }

        info!("Scan complete: found {} albums under {}", albums.len(), root.display());
        Ok(albums)
    }

    /// Build the Album value for one directory tree
    pub fn scan_album(&self, album_path: &Path) -> Result<Album> {
        let mut music_files = Vec::new();
        let mut non_music_files = Vec::new();
        let mut subdirs = BTreeSet::new();

        for entry in WalkDir::new(album_path).follow_links(false) {
            let entry = entry.map_err(|e| walk_error(album_path, e))?;
            let path = entry.path();
            let relative = match path.strip_prefix(album_path) {
                Ok(r) if !r.as_os_str().is_empty() => r.to_path_buf(),
                _ => continue,
            };

            if entry.file_type().is_dir() {
                if let Some(first) = relative.components().next() {
                    subdirs.insert(first.as_os_str().to_string_lossy().to_string());
                }
                continue;
            }
            if !entry.file_type().is_file() || is_sidecar_artifact(path) {
                continue;
            }

            let extension = extension_of(path).unwrap_or_default();
            if has_extension(path, &self.music_extensions) {
                let size = entry.metadata().map_err(|e| walk_error(path, e))?.len();
                music_files.push(MusicFile {
                    path: path.to_path_buf(),
                    relative_path: relative,
                    extension,
                    size,
                });
            } else if extension.is_empty() || has_extension(path, &self.copy_extensions) {
                non_music_files.push(NonMusicFile {
                    path: path.to_path_buf(),
                    relative_path: relative,
                    extension,
                });
            }
        }

        music_files.sort_by(|a, b| a.path.cmp(&b.path));
        non_music_files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Album {
            root_path: album_path.to_path_buf(),
            name: album_name(album_path),
            music_files,
            non_music_files,
            subdirectories: subdirs.into_iter().collect(),
        })
    }

    fn directly_contains_music(&self, dir: &Path) -> Result<bool> {
        for entry in std::fs::read_dir(dir).at(dir)? {
            let entry = entry.at(dir)?;
            let path = entry.path();
            if path.is_file() && has_extension(&path, &self.music_extensions) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Directory name of an album, falling back to the full path for roots like "/"
pub fn album_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Summarise a scan for logging
pub fn statistics(albums: &[Album]) -> ScanStatistics {
    let mut extensions = std::collections::BTreeMap::<String, usize>::new();
    for album in albums {
        for file in &album.music_files {
            *extensions.entry(file.extension.clone()).or_default() += 1;
        }
    }
    ScanStatistics {
        album_count: albums.len(),
        total_files: albums.iter().map(|a| a.file_count()).sum(),
        total_size_bytes: albums.iter().map(|a| a.total_size()).sum(),
        extensions: extensions.into_iter().collect(),
    }
}

fn walk_error(path: &Path, e: impl Into<std::io::Error>) -> PipelineError {
    PipelineError::Io {
        path: PathBuf::from(path),
        source: e.into(),
    }
}
