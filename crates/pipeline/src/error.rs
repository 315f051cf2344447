use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the conversion pipeline core
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Album mixes container images with streaming audio, so its identity is ambiguous
    #[error(
        "mixed album formats not supported: album contains both container images ({containers}) \
         and streaming audio ({streams}); albums must be image-only or stream-only"
    )]
    MixedFormats { containers: String, streams: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "insufficient disk space: required {required} bytes, available {available} bytes"
    )]
    InsufficientSpace { required: u64, available: u64 },

    #[error("file count mismatch: source={source_count}, dest={dest_count}")]
    FileCountMismatch { source_count: usize, dest_count: usize },

    #[error("verification failed for {}: {reason}", relative.display())]
    VerificationFailed { relative: PathBuf, reason: String },

    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("working directories already exist: {}", .0.display())]
    WorkingDirsExist(PathBuf),

    #[error("conversion failed for {} after {attempts} attempt(s): {message}", path.display())]
    ConversionExhausted {
        path: PathBuf,
        attempts: u32,
        message: String,
    },

    #[error("no active session")]
    NoSession,

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Attach the offending path to a raw I/O error
pub trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl PipelineError {
    /// Validation errors fail fast and never leave side effects behind
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::MixedFormats { .. } | PipelineError::InvalidConfig(_)
        )
    }
}
