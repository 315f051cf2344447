use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::quality::HigherQualityBehavior;

/// Sample rates accepted for PCM output
pub const VALID_SAMPLE_RATES: &[u32] = &[88_200, 96_000, 176_400, 192_000];

/// Bit depths accepted for PCM output
pub const VALID_BIT_DEPTHS: &[u16] = &[16, 24, 32];

/// What the converter produces from the DSD sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// ISO/DSF/DFF (and FLAC) sources become FLAC
    IsoDsfToFlac,
    /// ISO sources are unpacked to DSF
    IsoToDsf,
}

impl ConversionMode {
    /// Extension (without dot) of the files this mode writes
    pub fn output_extension(&self) -> &'static str {
        match self {
            ConversionMode::IsoDsfToFlac => "flac",
            ConversionMode::IsoToDsf => "dsf",
        }
    }

    /// Extension of the file produced from an input with `input_ext`.
    ///
    /// Inputs the mode does not transcode keep their own extension.
    pub fn output_extension_for(&self, input_ext: &str) -> String {
        match self {
            ConversionMode::IsoDsfToFlac => "flac".to_string(),
            ConversionMode::IsoToDsf if input_ext.eq_ignore_ascii_case("iso") => "dsf".to_string(),
            ConversionMode::IsoToDsf => input_ext.to_lowercase(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionMode::IsoDsfToFlac => "iso_dsf_to_flac",
            ConversionMode::IsoToDsf => "iso_to_dsf",
        }
    }
}

impl std::str::FromStr for ConversionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "iso_dsf_to_flac" => Ok(ConversionMode::IsoDsfToFlac),
            "iso_to_dsf" => Ok(ConversionMode::IsoToDsf),
            other => Err(format!(
                "unknown conversion mode '{}' (expected iso_dsf_to_flac or iso_to_dsf)",
                other
            )),
        }
    }
}

/// Configuration for the DSD conversion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default input root when none is given on the command line
    pub input_dir: Option<PathBuf>,
    /// Root under which converted albums are published
    pub output_dir: PathBuf,
    /// Root under which untouched copies of the originals are kept
    pub archive_dir: PathBuf,
    /// Root for the per-album `_source`/`_processed` staging directories
    pub working_dir: PathBuf,
    /// Directory holding the session file and the PAUSE sentinel
    pub state_dir: PathBuf,
    /// Directory holding one catalog record per album identity
    pub catalog_dir: PathBuf,
    pub conversion_mode: ConversionMode,
    /// Target sample rate in Hz
    pub sample_rate: u32,
    /// Target PCM bit depth
    pub bit_depth: u16,
    /// FLAC compression level (0-12)
    pub flac_compression_level: u8,
    /// Re-encode FLAC sources that exceed the target format
    pub flac_standardization: bool,
    pub higher_quality_behavior: HigherQualityBehavior,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Threads handed to ffmpeg (0 = let ffmpeg decide)
    pub ffmpeg_threads: u32,
    /// Hard limit for a single converter invocation
    pub convert_timeout_secs: u64,
    /// Attempts per file before the album is failed
    pub max_retries: u32,
    /// Recompute content checksums when checking whether an album was processed
    pub verify_checksums: bool,
    /// Verify staged and archived copies against their source
    pub verify_copies: bool,
    /// Files below this size are content-hashed during copy verification
    pub copy_verify_hash_max_bytes: u64,
    /// Leading MiB hashed for container images
    pub partial_hash_mib: u64,
    /// Skip albums the catalog shows as fully processed
    pub skip_processed: bool,
    /// Re-enter resumed albums from their surviving working directories
    pub resume_from_working: bool,
    /// Honour the PAUSE sentinel between albums
    pub check_pause: bool,
    pub cleanup_working_on_success: bool,
    pub cleanup_working_on_failure: bool,
    /// Delete the original album once it has been archived and published
    pub remove_source_after_conversion: bool,
    /// Extra free space (GiB) required on top of the staging estimate
    pub safety_margin_gb: f64,
    /// Extensions (without dot) treated as music payload
    pub music_extensions: Vec<String>,
    /// Extensions (without dot) of incidental files carried along with an album
    pub copy_extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            input_dir: None,
            output_dir: PathBuf::from("./output"),
            archive_dir: PathBuf::from("./archive"),
            working_dir: PathBuf::from("./working"),
            state_dir: PathBuf::from("./.state"),
            catalog_dir: PathBuf::from("./catalog"),
            conversion_mode: ConversionMode::IsoDsfToFlac,
            sample_rate: 88_200,
            bit_depth: 24,
            flac_compression_level: 8,
            flac_standardization: false,
            higher_quality_behavior: HigherQualityBehavior::Skip,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            ffmpeg_threads: 0,
            convert_timeout_secs: 3600,
            max_retries: 3,
            verify_checksums: true,
            verify_copies: true,
            copy_verify_hash_max_bytes: 100 * 1024 * 1024, // 100MB
            partial_hash_mib: 20,
            skip_processed: true,
            resume_from_working: true,
            check_pause: true,
            cleanup_working_on_success: true,
            cleanup_working_on_failure: false,
            remove_source_after_conversion: false,
            safety_margin_gb: 5.0,
            music_extensions: ["iso", "dsf", "dff", "flac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            copy_extensions: ["jpg", "jpeg", "png", "pdf", "txt", "log", "cue", "m3u", "nfo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // JSON unless the file says otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Check the configuration and report every problem found
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !VALID_SAMPLE_RATES.contains(&self.sample_rate) {
            errors.push(format!(
                "Invalid sample rate: {}. Must be one of {:?}",
                self.sample_rate, VALID_SAMPLE_RATES
            ));
        }
        if !VALID_BIT_DEPTHS.contains(&self.bit_depth) {
            errors.push(format!(
                "Invalid bit depth: {}. Must be one of {:?}",
                self.bit_depth, VALID_BIT_DEPTHS
            ));
        }
        if self.flac_compression_level > 12 {
            errors.push(format!(
                "Invalid FLAC compression level: {}. Must be 0-12",
                self.flac_compression_level
            ));
        }
        if self.max_retries == 0 {
            errors.push("max_retries must be at least 1".to_string());
        }
        if self.safety_margin_gb < 0.0 {
            errors.push("safety_margin_gb cannot be negative".to_string());
        }
        if self.music_extensions.is_empty() {
            errors.push("music_extensions cannot be empty".to_string());
        }

        let roots = [
            ("output_dir", &self.output_dir),
            ("archive_dir", &self.archive_dir),
            ("working_dir", &self.working_dir),
        ];
        for (i, (name_a, a)) in roots.iter().enumerate() {
            for (name_b, b) in roots.iter().skip(i + 1) {
                if a == b {
                    errors.push(format!("{} and {} must be different directories", name_a, name_b));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Safety margin in bytes
    pub fn safety_margin_bytes(&self) -> u64 {
        (self.safety_margin_gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64
    }

    /// Leading bytes hashed for container images
    pub fn partial_hash_bytes(&self) -> u64 {
        self.partial_hash_mib * 1024 * 1024
    }

    pub fn pause_signal_path(&self) -> PathBuf {
        self.state_dir.join(crate::session::PAUSE_SIGNAL_FILE)
    }

    pub fn session_file_path(&self) -> PathBuf {
        self.state_dir.join(crate::session::STATE_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PipelineConfig::default_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.conversion_mode.output_extension(), "flac");
        assert_eq!(cfg.safety_margin_bytes(), 5 * 1024 * 1024 * 1024);
        assert_eq!(cfg.partial_hash_bytes(), 20 * 1024 * 1024);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let cfg = PipelineConfig {
            sample_rate: 44_100,
            bit_depth: 20,
            max_retries: 0,
            archive_dir: PathBuf::from("/same"),
            working_dir: PathBuf::from("/same"),
            ..Default::default()
        };

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "errors: {:?}", errors);
        assert!(errors.iter().any(|e| e.contains("sample rate")));
        assert!(errors.iter().any(|e| e.contains("bit depth")));
        assert!(errors.iter().any(|e| e.contains("max_retries")));
        assert!(errors.iter().any(|e| e.contains("archive_dir and working_dir")));
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = PipelineConfig::load_config(Some(Path::new("/nonexistent/dsd.json"))).unwrap();
        assert_eq!(cfg.sample_rate, 88_200);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dsd.toml");
        std::fs::write(
            &path,
            "conversion_mode = \"iso_to_dsf\"\nsample_rate = 176400\nmax_retries = 5\n",
        )
        .unwrap();

        let cfg = PipelineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.conversion_mode, ConversionMode::IsoToDsf);
        assert_eq!(cfg.sample_rate, 176_400);
        assert_eq!(cfg.max_retries, 5);
        // untouched keys keep their defaults
        assert_eq!(cfg.bit_depth, 24);
        assert!(cfg.verify_copies);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dsd.json");
        std::fs::write(&path, r#"{"output_dir": "/music/flac", "higher_quality_behavior": "downsample"}"#)
            .unwrap();

        let cfg = PipelineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/music/flac"));
        assert_eq!(cfg.higher_quality_behavior, HigherQualityBehavior::Downsample);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("iso_to_dsf".parse::<ConversionMode>().unwrap(), ConversionMode::IsoToDsf);
        assert!("mp3".parse::<ConversionMode>().is_err());
    }

    #[test]
    fn test_output_extension_per_input() {
        assert_eq!(ConversionMode::IsoDsfToFlac.output_extension_for("dff"), "flac");
        assert_eq!(ConversionMode::IsoToDsf.output_extension_for("ISO"), "dsf");
        assert_eq!(ConversionMode::IsoToDsf.output_extension_for("flac"), "flac");
    }
}
