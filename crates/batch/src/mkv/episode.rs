use std::sync::LazyLock;
use regex::Regex;

/// Placeholder used when a filename carries no two-digit episode number
pub const UNKNOWN_EPISODE: &str = "XX";

static EPISODE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:s\d{1,2}|e|ep|\s|\.|_|^)(\d{2})(?:\s|\.|_|v|$)")
        .expect("Invalid episode regex")
});

/// Two-digit episode number from names like `S01E02`, `ep 05` or `03_title`
pub fn episode_number(file_name: &str) -> String {
    EPISODE_REGEX
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_EPISODE.to_string())
}
