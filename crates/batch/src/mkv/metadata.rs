use std::path::Path;
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

/// Subset of `mkvmerge -J` output used by the operations
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MkvInfo {
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Track {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub codec: String,
    #[serde(default)]
    pub properties: TrackProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackProperties {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub forced_track: bool,
}

/// Embedded file such as a font
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub id: u32,
    pub file_name: String,
    #[serde(default)]
    pub content_type: String,
}

impl Track {
    pub fn is_subtitle(&self) -> bool {
        self.kind == "subtitles"
    }

    pub fn is_audio(&self) -> bool {
        self.kind == "audio"
    }

    /// Requested language, or undetermined (`und`)
    pub fn matches_language(&self, lang: &str) -> bool {
        self.properties.language == lang || self.properties.language == "und"
    }

    /// Forced flag set, or a "signs" track by name
    pub fn is_forced(&self) -> bool {
        self.properties.forced_track || self.properties.track_name.to_lowercase().contains("sign")
    }

    pub fn is_ass(&self) -> bool {
        let codec = self.codec.to_lowercase();
        codec.contains("ass") || codec.contains("substationalpha")
    }
}

impl MkvInfo {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to parse MKV metadata")
    }

    pub fn subtitle_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_subtitle()).count()
    }
}

/// Run `mkvmerge -J` on a file and decode the result
pub async fn probe(mkvmerge_bin: &Path, file_path: &Path) -> Result<MkvInfo> {
    if !file_path.exists() {
        bail!("File not found: {}", file_path.display());
    }

    debug!("Probing {} with {}", file_path.display(), mkvmerge_bin.display());
    let output = Command::new(mkvmerge_bin)
        .arg("-J")
        .arg(file_path)
        .output()
        .await
        .with_context(|| format!("Failed to execute mkvmerge at: {}", mkvmerge_bin.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "Corrupted or unreadable MKV file {} (exit code {}): {}",
            file_path.display(),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ));
    }

    MkvInfo::from_json(&output.stdout)
        .with_context(|| format!("Unexpected mkvmerge output for {}", file_path.display()))
}
