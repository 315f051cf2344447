use std::path::Path;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::quality::PcmFormat;

/// Subset of ffprobe's JSON output needed to classify audio
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub streams: Vec<FFProbeStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    /// ffprobe reports this as a string, e.g. "96000"
    pub sample_rate: Option<String>,
    pub bits_per_raw_sample: Option<String>,
    pub bits_per_sample: Option<u32>,
    pub sample_fmt: Option<String>,
    pub channels: Option<u32>,
}

impl FFProbeStream {
    /// Effective PCM bit depth of the stream
    pub fn bit_depth(&self) -> Option<u16> {
        let raw = self
            .bits_per_raw_sample
            .as_deref()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|b| *b > 0);
        if raw.is_some() {
            return raw;
        }
        if let Some(b) = self.bits_per_sample.filter(|b| *b > 0) {
            return Some(b as u16);
        }
        // s16, s32p, ...
        self.sample_fmt.as_deref().and_then(|fmt| {
            fmt.trim_start_matches(|c: char| c == 's' || c == 'u')
                .trim_end_matches('p')
                .parse::<u16>()
                .ok()
        })
    }
}

impl FFProbeData {
    /// Sample rate and bit depth of the first audio stream
    pub fn audio_format(&self) -> Option<PcmFormat> {
        let stream = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))?;
        let rate = stream.sample_rate.as_deref()?.parse::<u32>().ok()?;
        Some(PcmFormat::new(rate, stream.bit_depth()?))
    }
}

/// Parse ffprobe JSON output
pub fn parse_probe_output(json: &str) -> Result<FFProbeData> {
    serde_json::from_str(json).context("Failed to parse ffprobe JSON output")
}

/// Run ffprobe on a file and return its audio format
pub async fn probe_audio_format(ffprobe_bin: &Path, file_path: &Path) -> Result<PcmFormat> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg(file_path)
        .kill_on_drop(true);

    debug!("ffprobe: probing {}", file_path.display());

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)?
        .audio_format()
        .with_context(|| format!("No audio stream with a known format in {}", file_path.display()))
}
