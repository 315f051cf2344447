use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use crate::album::extension_of;
use crate::config::{ConversionMode, PipelineConfig};
use crate::ffprobe::probe_audio_format;
use crate::quality::{flac_action, FlacAction, HigherQualityBehavior, PcmFormat};

/// Number of trailing stderr lines kept in a failure message
const STDERR_TAIL_LINES: usize = 10;

/// Resampling chain used for every PCM target
const DSD_FILTER_CHAIN: &str =
    "aresample=resampler=soxr:precision=28:dither_method=triangular,lowpass=40000";

/// Details of a finished conversion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionMetrics {
    pub input_bytes: u64,
    pub output_bytes: u64,
    /// Format of a PCM source, when it was probed
    pub source_format: Option<PcmFormat>,
    /// The file was copied rather than transcoded
    pub copied_unchanged: bool,
}

/// Result of converting a single file
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    pub success: bool,
    /// Output already existed and `skip_existing` was set
    pub skipped: bool,
    pub message: Option<String>,
    pub duration_secs: f64,
    pub metrics: Option<ConversionMetrics>,
}

impl ConversionOutcome {
    pub fn converted(started: Instant, metrics: ConversionMetrics) -> Self {
        Self {
            success: true,
            skipped: false,
            message: None,
            duration_secs: started.elapsed().as_secs_f64(),
            metrics: Some(metrics),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            message: Some(message.into()),
            duration_secs: 0.0,
            metrics: None,
        }
    }

    pub fn failed(started: Instant, message: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            message: Some(message.into()),
            duration_secs: started.elapsed().as_secs_f64(),
            metrics: None,
        }
    }
}

/// Turns one staged music file into its output file.
///
/// Implementations never panic on bad input; every problem comes back as a
/// failed [`ConversionOutcome`] so the caller can count the attempt.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, input: &Path, output: &Path, skip_existing: bool) -> ConversionOutcome;
}

/// What to do with a given input file
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionJob {
    Transcode(Vec<OsString>),
    Copy,
}

/// Converter backed by the ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    mode: ConversionMode,
    target: PcmFormat,
    compression_level: u8,
    threads: u32,
    timeout: Duration,
    flac_standardization: bool,
    higher_quality_behavior: HigherQualityBehavior,
}

impl FfmpegConverter {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            mode: cfg.conversion_mode,
            target: PcmFormat::new(cfg.sample_rate, cfg.bit_depth),
            compression_level: cfg.flac_compression_level,
            threads: cfg.ffmpeg_threads,
            timeout: Duration::from_secs(cfg.convert_timeout_secs),
            flac_standardization: cfg.flac_standardization,
            higher_quality_behavior: cfg.higher_quality_behavior,
        }
    }

    /// PCM FLAC encode of `input`; `select_first_audio` is needed for disc images
    pub fn flac_args(&self, input: &Path, output: &Path, select_first_audio: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        args.push("-i".into());
        args.push(input.into());
        if select_first_audio {
            args.push("-map".into());
            args.push("0:a:0".into());
        }
        if self.threads > 0 {
            args.push("-threads".into());
            args.push(self.threads.to_string().into());
        }
        args.push("-af".into());
        args.push(DSD_FILTER_CHAIN.into());
        args.push("-sample_fmt".into());
        args.push(format!("s{}", self.sample_fmt_bits()).into());
        args.push("-ar".into());
        args.push(self.target.sample_rate.to_string().into());
        args.push("-compression_level".into());
        args.push(self.compression_level.to_string().into());
        args.push("-map_metadata".into());
        args.push("0".into());
        args.push("-y".into());
        args.push(output.into());
        args
    }

    /// Unpack the first audio program of a disc image to DSF
    pub fn dsf_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        args.push("-i".into());
        args.push(input.into());
        args.push("-map".into());
        args.push("0:a:0".into());
        if self.threads > 0 {
            args.push("-threads".into());
            args.push(self.threads.to_string().into());
        }
        args.push("-c:a".into());
        args.push("dsd_lsbf_planar".into());
        args.push("-y".into());
        args.push(output.into());
        args
    }

    // ffmpeg's FLAC encoder only takes s16 and s32 sample formats
    fn sample_fmt_bits(&self) -> u16 {
        if self.target.bit_depth <= 16 {
            16
        } else {
            32
        }
    }

    /// Decide how `input` is handled without touching any PCM source
    pub fn plan_job(&self, input: &Path, output: &Path) -> Result<ConversionJob, String> {
        let ext = extension_of(input).unwrap_or_default();
        match (self.mode, ext.as_str()) {
            (ConversionMode::IsoDsfToFlac, "iso") => Ok(ConversionJob::Transcode(self.flac_args(input, output, true))),
            (ConversionMode::IsoDsfToFlac, "dsf" | "dff") => {
                Ok(ConversionJob::Transcode(self.flac_args(input, output, false)))
            }
            (ConversionMode::IsoDsfToFlac, "flac") => Ok(ConversionJob::Copy),
            (ConversionMode::IsoToDsf, "iso") => Ok(ConversionJob::Transcode(self.dsf_args(input, output))),
            (ConversionMode::IsoToDsf, "dsf" | "dff" | "flac") => Ok(ConversionJob::Copy),
            (mode, other) => Err(format!("Unsupported input format for {}: {}", mode.as_str(), other)),
        }
    }

    /// Resolve what happens to a FLAC source given its probed format
    async fn plan_flac(&self, input: &Path, output: &Path) -> Result<(ConversionJob, Option<PcmFormat>), String> {
        if !self.flac_standardization {
            return Ok((ConversionJob::Copy, None));
        }
        let source = probe_audio_format(&self.ffprobe_bin, input)
            .await
            .map_err(|e| format!("ffprobe error: {:#}", e))?;
        let action = flac_action(&source, &self.target, true, self.higher_quality_behavior);
        debug!("{}: {:?} -> {:?}", input.display(), source, action);
        let job = match action {
            FlacAction::CopyUnchanged => ConversionJob::Copy,
            FlacAction::Downsample => ConversionJob::Transcode(self.flac_args(input, output, false)),
        };
        Ok((job, Some(source)))
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<(), String> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner").arg("-nostdin").args(&args).kill_on_drop(true);

        debug!("ffmpeg args: {:?}", args);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| format!("Failed to execute ffmpeg: {}", e))?,
            // dropping the future kills the child
            Err(_) => {
                return Err(format!(
                    "Conversion timeout (exceeded {} seconds)",
                    self.timeout.as_secs()
                ))
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("ffmpeg error: {}", stderr_tail(&stderr, STDERR_TAIL_LINES)))
        }
    }
}

/// Last `n` non-empty lines of a process' stderr
pub fn stderr_tail(stderr: &str, n: usize) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn remove_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            warn!("Could not remove partial output {}: {}", output.display(), e);
        }
    }
}

#[async_trait]
impl Converter for FfmpegConverter {
    async fn convert(&self, input: &Path, output: &Path, skip_existing: bool) -> ConversionOutcome {
        let started = Instant::now();

        let input_bytes = match std::fs::metadata(input) {
            Ok(m) => m.len(),
            Err(_) => return ConversionOutcome::failed(started, format!("Input file not found: {}", input.display())),
        };

        if output.exists() {
            if skip_existing {
                debug!("Output exists, skipping: {}", output.display());
                return ConversionOutcome::skipped(format!("Output already exists: {}", output.display()));
            }
            remove_partial(output);
        }

        if let Some(parent) = output.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ConversionOutcome::failed(
                    started,
                    format!("Failed to create output directory {}: {}", parent.display(), e),
                );
            }
        }

        let planned = match self.plan_job(input, output) {
            Ok(ConversionJob::Copy)
                if self.mode == ConversionMode::IsoDsfToFlac && extension_of(input).as_deref() == Some("flac") =>
            {
                self.plan_flac(input, output).await
            }
            Ok(job) => Ok((job, None)),
            Err(e) => Err(e),
        };
        let (job, source_format) = match planned {
            Ok(p) => p,
            Err(message) => return ConversionOutcome::failed(started, message),
        };

        let copied_unchanged = job == ConversionJob::Copy;
        let result = match job {
            ConversionJob::Copy => std::fs::copy(input, output)
                .map(|_| ())
                .map_err(|e| format!("Copy failed: {}", e)),
            ConversionJob::Transcode(args) => self.run_ffmpeg(args).await,
        };

        if let Err(message) = result {
            remove_partial(output);
            return ConversionOutcome::failed(started, message);
        }

        let output_bytes = match std::fs::metadata(output) {
            Ok(m) => m.len(),
            Err(_) => return ConversionOutcome::failed(started, "Conversion completed but output file not found"),
        };

        let outcome = ConversionOutcome::converted(
            started,
            ConversionMetrics {
                input_bytes,
                output_bytes,
                source_format,
                copied_unchanged,
            },
        );
        info!(
            "🎵 {} -> {} ({:.1}s{})",
            input.file_name().unwrap_or_default().to_string_lossy(),
            output.file_name().unwrap_or_default().to_string_lossy(),
            outcome.duration_secs,
            if copied_unchanged { ", copied" } else { "" }
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args_str(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    fn converter(mode: ConversionMode) -> FfmpegConverter {
        FfmpegConverter::from_config(&PipelineConfig {
            conversion_mode: mode,
            ffmpeg_threads: 4,
            ..PipelineConfig::default_config()
        })
    }

    #[test]
    fn test_dsf_to_flac_args() {
        let c = converter(ConversionMode::IsoDsfToFlac);
        let job = c.plan_job(Path::new("/w/01.dsf"), Path::new("/p/01.flac")).unwrap();
        let ConversionJob::Transcode(args) = job else {
            panic!("expected transcode");
        };
        let args = args_str(&args);
        assert_eq!(
            args,
            vec![
                "-i", "/w/01.dsf", "-threads", "4", "-af", DSD_FILTER_CHAIN, "-sample_fmt", "s32", "-ar", "88200",
                "-compression_level", "8", "-map_metadata", "0", "-y", "/p/01.flac",
            ]
        );
    }

    #[test]
    fn test_iso_selects_first_audio_program() {
        let c = converter(ConversionMode::IsoDsfToFlac);
        let ConversionJob::Transcode(args) = c.plan_job(Path::new("/w/disc.ISO"), Path::new("/p/disc.flac")).unwrap()
        else {
            panic!("expected transcode");
        };
        let args = args_str(&args);
        assert_eq!(&args[2..4], &["-map", "0:a:0"]);

        let c = converter(ConversionMode::IsoToDsf);
        let ConversionJob::Transcode(args) = c.plan_job(Path::new("/w/disc.iso"), Path::new("/p/disc.dsf")).unwrap()
        else {
            panic!("expected transcode");
        };
        let args = args_str(&args);
        assert!(args.windows(2).any(|w| w == ["-c:a", "dsd_lsbf_planar"]));
        assert!(!args.iter().any(|a| a == "-af"));
    }

    #[test]
    fn test_unsupported_and_passthrough_inputs() {
        let c = converter(ConversionMode::IsoToDsf);
        assert_eq!(c.plan_job(Path::new("/w/01.dsf"), Path::new("/p/01.dsf")), Ok(ConversionJob::Copy));
        assert_eq!(
            c.plan_job(Path::new("/w/01.wav"), Path::new("/p/01.wav")),
            Err("Unsupported input format for iso_to_dsf: wav".to_string())
        );
    }

    #[test]
    fn test_sixteen_bit_target() {
        let c = FfmpegConverter::from_config(&PipelineConfig {
            bit_depth: 16,
            ..PipelineConfig::default_config()
        });
        let args = args_str(&c.flac_args(Path::new("a.dsf"), Path::new("a.flac"), false));
        assert!(args.windows(2).any(|w| w == ["-sample_fmt", "s16"]));
        assert!(!args.iter().any(|a| a == "-threads"));
    }

    #[test]
    fn test_stderr_tail() {
        let stderr = (1..=15).map(|i| format!("line {}\n\n", i)).collect::<String>();
        let tail = stderr_tail(&stderr, 10);
        assert!(tail.starts_with("line 6"));
        assert!(tail.ends_with("line 15"));
        assert_eq!(tail.lines().count(), 10);
        assert_eq!(stderr_tail("", 10), "");
    }

    #[tokio::test]
    async fn test_skip_existing_and_missing_input() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("01.dsf");
        let output = tmp.path().join("out/01.flac");
        let c = converter(ConversionMode::IsoDsfToFlac);

        let missing = c.convert(&input, &output, true).await;
        assert!(!missing.success);
        assert!(missing.message.unwrap().contains("not found"));

        std::fs::write(&input, b"dsd").unwrap();
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, b"flac").unwrap();
        let skipped = c.convert(&input, &output, true).await;
        assert!(skipped.success && skipped.skipped);
        assert_eq!(std::fs::read(&output).unwrap(), b"flac");
    }

    #[tokio::test]
    async fn test_flac_passthrough_copies_without_probing() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("01.flac");
        let output = tmp.path().join("p/CD1/01.flac");
        std::fs::write(&input, b"fLaC-data").unwrap();

        let c = converter(ConversionMode::IsoDsfToFlac);
        let outcome = c.convert(&input, &output, false).await;
        assert!(outcome.success, "{:?}", outcome.message);
        let metrics = outcome.metrics.unwrap();
        assert!(metrics.copied_unchanged);
        assert_eq!(metrics.output_bytes, 9);
        assert_eq!(std::fs::read(&output).unwrap(), b"fLaC-data");
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_binary_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("01.dsf");
        std::fs::write(&input, b"dsd").unwrap();
        let c = FfmpegConverter::from_config(&PipelineConfig {
            ffmpeg_bin: tmp.path().join("no-such-ffmpeg"),
            ..PipelineConfig::default_config()
        });

        let outcome = c.convert(&input, &tmp.path().join("01.flac"), false).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().starts_with("Failed to execute ffmpeg"));
        assert!(!tmp.path().join("01.flac").exists());
    }
}
