use std::ffi::OsString;
use std::path::{Path, PathBuf};
use anyhow::Context;
use log::info;
use crate::error::OperationError;
use crate::job::Job;
use super::episode::episode_number;
use super::metadata::{MkvInfo, Track};
use super::MkvToolkit;

/// One subtitle track and the file it is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractTarget {
    pub track_id: u32,
    pub output: PathBuf,
}

/// Directory receiving extracted subtitles of one language
pub fn subs_dir(file_path: &Path, lang: &str) -> PathBuf {
    file_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join("subs")
        .join(lang)
}

fn subtitle_extension(track: &Track) -> &'static str {
    if track.is_ass() {
        ".ass"
    } else {
        ".srt"
    }
}

/// `_forced` for forced or signs tracks, `_<index>` for any track after the first
fn track_suffix(index: usize, track: &Track) -> String {
    if track.is_forced() {
        "_forced".to_string()
    } else if index > 0 {
        format!("_{}", index)
    } else {
        String::new()
    }
}

/// Every subtitle track matching a requested language, with its output path
pub fn plan_extract(file_path: &Path, info: &MkvInfo, languages: &[String]) -> Vec<ExtractTarget> {
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let episode = episode_number(&name);

    let mut targets = Vec::new();
    for lang in languages {
        let dir = subs_dir(file_path, lang);
        for (index, track) in info.tracks.iter().enumerate() {
            if !track.is_subtitle() || !track.matches_language(lang) {
                continue;
            }
            let file_name = format!(
                "{}_{}{}{}",
                episode,
                lang,
                track_suffix(index, track),
                subtitle_extension(track)
            );
            targets.push(ExtractTarget {
                track_id: track.id,
                output: dir.join(file_name),
            });
        }
    }
    targets
}

/// `mkvextract <file> tracks <id>:<out> ...`
pub fn extract_args(file_path: &Path, targets: &[ExtractTarget]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![file_path.into(), "tracks".into()];
    for target in targets {
        let mut selector = OsString::from(format!("{}:", target.track_id));
        selector.push(&target.output);
        args.push(selector);
    }
    args
}

pub(super) async fn run(toolkit: &MkvToolkit, job: &Job) -> Result<(), OperationError> {
    let info = toolkit.probe(&job.path).await?;
    let targets = plan_extract(&job.path, &info, &job.options.languages);
    if targets.is_empty() {
        return Err(OperationError::no_work("no subtitles"));
    }

    if !job.options.dry_run {
        for lang in &job.options.languages {
            let dir = subs_dir(&job.path, lang);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create subtitle directory: {}", dir.display()))?;
        }
    }

    toolkit
        .execute(job.options.dry_run, &toolkit.mkvextract_bin, &extract_args(&job.path, &targets))
        .await
        .context("Subtitle extraction failed")?;

    info!(
        "Extracted {} subtitle track(s) from {}",
        targets.len(),
        job.file_name()
    );
    Ok(())
}
