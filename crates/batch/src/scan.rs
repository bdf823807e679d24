use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::error::{BatchError, BatchResult};

/// Container extension handled by the batch tools
pub const CONTAINER_EXTENSION: &str = "mkv";

/// True for paths ending in `.mkv`, compared case-insensitively
pub fn is_container(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(CONTAINER_EXTENSION))
        .unwrap_or(false)
}

/// Collect container files under `dir`, sorted by path.
///
/// Without `recursive` only the immediate directory is listed. Entries below
/// the root that cannot be read are logged and skipped; an unreadable root is
/// an error.
pub fn scan_files(dir: &Path, recursive: bool) -> BatchResult<Vec<PathBuf>> {
    let mut walker = WalkDir::new(dir).follow_links(false).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    info!("🔍 Scanning directory: {}", dir.display());

    let mut files = Vec::new();
    let mut entry_count = 0;
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(source) if source.depth() == 0 => {
                return Err(BatchError::DirectoryUnreadable {
                    path: dir.to_path_buf(),
                    source,
                });
            }
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };
        entry_count += 1;

        if !entry.file_type().is_file() || !is_container(entry.path()) {
            continue;
        }
        debug!("Found container: {}", entry.path().display());
        files.push(entry.into_path());
    }

    files.sort();
    info!(
        "Scan complete: {} entries checked, {} container file(s) found",
        entry_count,
        files.len()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    fn library() -> TempDir {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.mkv"));
        touch(&dir.path().join("A.MKV"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("season2/c.mkv"));
        touch(&dir.path().join("season2/deeper/d.Mkv"));
        fs::create_dir_all(dir.path().join("folder.mkv")).unwrap();
        dir
    }

    fn names(files: &[PathBuf], root: &Path) -> Vec<String> {
        files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_is_container() {
        assert!(is_container(Path::new("show/ep01.mkv")));
        assert!(is_container(Path::new("EP01.MKV")));
        assert!(!is_container(Path::new("ep01.mkv.part")));
        assert!(!is_container(Path::new("ep01.mp4")));
        assert!(!is_container(Path::new("mkv")));
    }

    #[test]
    fn test_flat_scan_ignores_subdirectories() {
        let dir = library();
        let files = scan_files(dir.path(), false).unwrap();
        assert_eq!(names(&files, dir.path()), vec!["A.MKV", "b.mkv"]);
    }

    #[test]
    fn test_recursive_scan_walks_subtree() {
        let dir = library();
        let files = scan_files(dir.path(), true).unwrap();
        assert_eq!(
            names(&files, dir.path()),
            vec!["A.MKV", "b.mkv", "season2/c.mkv", "season2/deeper/d.Mkv"]
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = scan_files(&dir.path().join("missing"), true).unwrap_err();
        assert!(matches!(err, BatchError::DirectoryUnreadable { .. }));
    }
}
