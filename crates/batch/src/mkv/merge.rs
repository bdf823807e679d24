use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info};
use crate::config::RunConfig;
use crate::error::OperationError;
use crate::job::Job;
use super::episode::episode_number;
use super::extract::subs_dir;
use super::metadata::MkvInfo;
use super::MkvToolkit;

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf"];

/// Inputs of one `mkvmerge` remux
#[derive(Debug, Clone)]
pub struct MergeInputs<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub subtitle: &'a Path,
    pub fonts: &'a [PathBuf],
    pub language: &'a str,
    pub keep_audio: Option<&'a str>,
}

/// Directory searched for external subtitles of a file
pub fn subtitle_source(cfg: &RunConfig, file_path: &Path) -> PathBuf {
    cfg.subs_dir
        .clone()
        .unwrap_or_else(|| subs_dir(file_path, cfg.primary_language()))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Cannot read subtitle directory: {}", dir.display()))
        }
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    Ok(paths)
}

/// First file named `<episode>...<lang>...` in `dir`, XML chapter files excluded
pub fn find_external_subtitle(dir: &Path, episode: &str, lang: &str) -> Result<Option<PathBuf>> {
    Ok(sorted_entries(dir)?.into_iter().find(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.starts_with(episode) && name.contains(lang) && !name.ends_with(".xml")
    }))
}

/// Font files to attach to the merged output
pub fn find_fonts(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|s| s.to_str())
                .map(|ext| FONT_EXTENSIONS.iter().any(|f| ext.eq_ignore_ascii_case(f)))
                .unwrap_or(false)
        })
        .collect())
}

/// Output root: `out_dir`, or a `<dir>_<lang>` sibling of the batch root
pub fn output_root(cfg: &RunConfig) -> PathBuf {
    if let Some(out) = &cfg.out_dir {
        return out.clone();
    }
    let dir_name = cfg
        .dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let parent = cfg.dir.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{}_{}", dir_name, cfg.primary_language()))
}

/// Merged file location, mirroring the path relative to the batch root
pub fn output_path(cfg: &RunConfig, file_path: &Path) -> PathBuf {
    let relative = file_path
        .strip_prefix(&cfg.dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file_path.file_name().map(PathBuf::from).unwrap_or_default());
    output_root(cfg).join(relative)
}

pub fn merge_args(info: &MkvInfo, inputs: &MergeInputs<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-o".into(), inputs.output.into()];

    if let Some(keep) = inputs.keep_audio {
        let ids: Vec<String> = info
            .tracks
            .iter()
            .filter(|t| t.is_audio() && t.properties.language == keep)
            .map(|t| t.id.to_string())
            .collect();
        if !ids.is_empty() {
            args.push("--audio-tracks".into());
            args.push(ids.join(",").into());
        }
    }

    args.push("--no-subtitles".into());
    args.push(inputs.source.into());

    for font in inputs.fonts {
        args.push("--attach-file".into());
        args.push(font.into());
    }

    let subtitle_name = inputs.subtitle.to_string_lossy().to_lowercase();
    let forced = if subtitle_name.contains("forced") || subtitle_name.contains("sign") {
        "0:yes"
    } else {
        "0:no"
    };

    for arg in [
        "--language".to_string(),
        format!("0:{}", inputs.language),
        "--track-name".to_string(),
        format!("0:{}", inputs.language.to_uppercase()),
        "--default-track".to_string(),
        "0:yes".to_string(),
        "--forced-display-flag".to_string(),
        forced.to_string(),
    ] {
        args.push(arg.into());
    }
    args.push(inputs.subtitle.into());
    args
}

pub(super) async fn run(toolkit: &MkvToolkit, job: &Job) -> Result<(), OperationError> {
    let cfg = &job.options;
    let episode = episode_number(&job.file_name());
    let source_dir = subtitle_source(cfg, &job.path);

    let Some(subtitle) = find_external_subtitle(&source_dir, &episode, cfg.primary_language())? else {
        return Err(OperationError::no_work("no external subtitle"));
    };
    debug!("Using subtitle {} for {}", subtitle.display(), job.file_name());

    let info = toolkit
        .probe(&job.path)
        .await
        .context("Failed to read MKV metadata")?;
    let fonts = find_fonts(&source_dir)?;
    let output = output_path(cfg, &job.path);

    if !cfg.dry_run {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
        }
    }

    let args = merge_args(
        &info,
        &MergeInputs {
            source: &job.path,
            output: &output,
            subtitle: &subtitle,
            fonts: &fonts,
            language: cfg.primary_language(),
            keep_audio: cfg.keep_audio.as_deref(),
        },
    );
    toolkit
        .execute(cfg.dry_run, &toolkit.mkvmerge_bin, &args)
        .await
        .context("Subtitle merge failed")?;

    info!("Merged {} into {}", subtitle.display(), output.display());
    Ok(())
}
