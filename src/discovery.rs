//! Candidate file discovery.
//!
//! Produces the ordered list of files a run converts, either by walking a
//! local directory tree or by running one `find` on the remote host.
//!
//! ## Rules
//!
//! - Extensions match case-insensitively with or without the leading dot:
//!   `".JPG"`, `"jpg"` and `".jpg"` are the same extension.
//! - A missing or non-directory local root is [`DiscoveryError::InvalidInput`].
//! - An I/O error while walking aborts with [`DiscoveryError::Walk`].
//! - Zero matches is [`DiscoveryError::NoFilesFound`], never an empty success.
//! - [`filter_converted`] drops a candidate only when *every* enabled format
//!   already has its sibling output, so reruns skip completed work but finish
//!   partially converted files.
//!
//! ## Output Paths
//!
//! Outputs live next to their source with the extension replaced:
//!
//! ```text
//! images/2024/beach.jpg  →  images/2024/beach.webp
//!                           images/2024/beach.avif
//! ```

use crate::codec::OutputFormat;
use crate::remote::{Connector, RemoteTransport, TransportError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Input directory is missing or not a directory: {0}")]
    InvalidInput(PathBuf),
    #[error("Failed to scan {root}: {source}")]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },
    #[error("Remote listing of {root} failed: {source}")]
    RemoteListing {
        root: String,
        source: TransportError,
    },
    #[error("No matching image files found in {0}")]
    NoFilesFound(String),
}

/// Where a candidate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    LocalDisk,
    RemoteListing,
}

/// A file eligible for conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    /// Normalized extension, e.g. `".jpg"`.
    pub extension: String,
    pub source: DiscoverySource,
}

impl CandidateFile {
    /// Build a candidate from a path. Returns `None` when the path has no
    /// extension.
    pub fn new(path: impl Into<PathBuf>, source: DiscoverySource) -> Option<Self> {
        let path = path.into();
        let extension = path.extension()?.to_str().map(normalize_extension)?;
        Some(Self {
            path,
            extension,
            source,
        })
    }

    pub fn output_path(&self, format: OutputFormat) -> PathBuf {
        output_path(&self.path, format)
    }
}

/// Lowercase and ensure a single leading dot: `"JPG"` → `".jpg"`.
pub fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim().trim_start_matches('.');
    format!(".{}", trimmed.to_lowercase())
}

/// Accepted source extensions, stored normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSet(BTreeSet<String>);

impl ExtensionSet {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| e.len() > 1)
                .collect(),
        )
    }

    /// Case- and dot-insensitive membership.
    pub fn is_supported_extension(&self, ext: &str) -> bool {
        self.0.contains(&normalize_extension(ext))
    }

    pub fn matches_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.is_supported_extension(e))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sibling output path: same directory, same stem, new extension.
pub fn output_path(source: &Path, format: OutputFormat) -> PathBuf {
    source.with_extension(format.extension())
}

/// Recursively find files under `root` with an accepted extension.
///
/// Entries are visited in file-name order so runs are reproducible.
pub fn discover_local(
    root: &Path,
    extensions: &ExtensionSet,
) -> Result<Vec<CandidateFile>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::InvalidInput(root.to_path_buf()));
    }

    let mut candidates = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| DiscoveryError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() || !extensions.matches_path(entry.path()) {
            continue;
        }
        let path = std::path::absolute(entry.path()).unwrap_or_else(|_| entry.into_path());
        if let Some(candidate) = CandidateFile::new(path, DiscoverySource::LocalDisk) {
            candidates.push(candidate);
        }
    }

    if candidates.is_empty() {
        return Err(DiscoveryError::NoFilesFound(root.display().to_string()));
    }
    info!(root = %root.display(), count = candidates.len(), "discovered local files");
    Ok(candidates)
}

/// Quote a string for a POSIX shell.
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// The single remote command that lists candidates, sorted.
pub fn remote_find_command(remote_root: &str, extensions: &ExtensionSet) -> String {
    let patterns: Vec<String> = extensions
        .iter()
        .map(|ext| format!("-iname {}", shell_quote(&format!("*{ext}"))))
        .collect();
    format!(
        "find {} -type f \\( {} \\) | sort",
        shell_quote(remote_root),
        patterns.join(" -o ")
    )
}

/// One candidate per non-empty output line.
pub fn parse_remote_listing(output: &str) -> Vec<CandidateFile> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| CandidateFile::new(line, DiscoverySource::RemoteListing))
        .collect()
}

/// List candidates under `remote_root` on the remote host.
pub fn discover_remote<C: Connector>(
    transport: &mut RemoteTransport<C>,
    remote_root: &str,
    extensions: &ExtensionSet,
) -> Result<Vec<CandidateFile>, DiscoveryError> {
    let command = remote_find_command(remote_root, extensions);
    debug!(%command, "listing remote files");
    let output = transport
        .execute(&command)
        .map_err(|source| DiscoveryError::RemoteListing {
            root: remote_root.to_string(),
            source,
        })?;
    let candidates = parse_remote_listing(&output);
    if candidates.is_empty() {
        return Err(DiscoveryError::NoFilesFound(remote_root.to_string()));
    }
    info!(root = remote_root, count = candidates.len(), "discovered remote files");
    Ok(candidates)
}

/// Drop candidates whose every enabled output already exists on disk.
///
/// With no enabled formats nothing is considered converted.
pub fn filter_converted(
    candidates: Vec<CandidateFile>,
    enabled: &[OutputFormat],
) -> Vec<CandidateFile> {
    if enabled.is_empty() {
        return candidates;
    }
    let before = candidates.len();
    let remaining: Vec<CandidateFile> = candidates
        .into_iter()
        .filter(|c| !enabled.iter().all(|f| c.output_path(*f).exists()))
        .collect();
    let skipped = before - remaining.len();
    if skipped > 0 {
        info!(skipped, remaining = remaining.len(), "skipping already converted files");
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn default_extensions() -> ExtensionSet {
        ExtensionSet::new([".jpg", ".jpeg", ".png", ".heic", ".heif"])
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    fn names(candidates: &[CandidateFile]) -> Vec<String> {
        candidates
            .iter()
            .map(|c| c.path.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    // =========================================================================
    // Extensions
    // =========================================================================

    #[test]
    fn normalize_extension_forms() {
        assert_eq!(normalize_extension(".JPG"), ".jpg");
        assert_eq!(normalize_extension("jpg"), ".jpg");
        assert_eq!(normalize_extension(".jpg"), ".jpg");
        assert_eq!(normalize_extension(" Png "), ".png");
    }

    #[test]
    fn supported_extension_equivalence() {
        let set = default_extensions();
        for ext in [".JPG", "jpg", ".jpg", "JpEg", "HEIC"] {
            assert!(set.is_supported_extension(ext), "{ext}");
        }
        assert!(!set.is_supported_extension(".gif"));
        assert!(!set.is_supported_extension(""));
    }

    proptest! {
        #[test]
        fn supported_extension_ignores_case_and_dot(
            ext in prop::sample::select(vec!["jpg", "jpeg", "png", "heic", "heif"]),
            upper_mask in prop::collection::vec(any::<bool>(), 4),
            dot in any::<bool>(),
        ) {
            let mixed: String = ext
                .chars()
                .zip(upper_mask.iter().cycle())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            let candidate = if dot { format!(".{mixed}") } else { mixed };
            prop_assert!(default_extensions().is_supported_extension(&candidate));
        }
    }

    #[test]
    fn candidate_records_normalized_extension() {
        let c = CandidateFile::new("/img/Photo.JPG", DiscoverySource::LocalDisk).unwrap();
        assert_eq!(c.extension, ".jpg");
        assert!(CandidateFile::new("/img/README", DiscoverySource::LocalDisk).is_none());
    }

    #[test]
    fn output_path_is_sibling() {
        assert_eq!(
            output_path(Path::new("/a/b/beach.jpg"), OutputFormat::WebP),
            PathBuf::from("/a/b/beach.webp")
        );
        assert_eq!(
            output_path(Path::new("/a/b/my.photo.png"), OutputFormat::Avif),
            PathBuf::from("/a/b/my.photo.avif")
        );
    }

    // =========================================================================
    // Local discovery
    // =========================================================================

    #[test]
    fn discover_local_walks_recursively_in_order() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("b.png"));
        touch(&tmp.path().join("a.JPG"));
        touch(&tmp.path().join("nested/deeper/c.heic"));
        touch(&tmp.path().join("notes.txt"));
        touch(&tmp.path().join("done.webp"));

        let found = discover_local(tmp.path(), &default_extensions()).unwrap();
        assert_eq!(names(&found), vec!["a.JPG", "b.png", "c.heic"]);
        assert!(found.iter().all(|c| c.path.is_absolute()));
        assert!(found.iter().all(|c| c.source == DiscoverySource::LocalDisk));
    }

    #[test]
    fn discover_local_missing_root_is_invalid_input() {
        let tmp = TempDir::new().unwrap();
        let result = discover_local(&tmp.path().join("nope"), &default_extensions());
        assert!(matches!(result, Err(DiscoveryError::InvalidInput(_))));
    }

    #[test]
    fn discover_local_file_root_is_invalid_input() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.jpg");
        touch(&file);
        let result = discover_local(&file, &default_extensions());
        assert!(matches!(result, Err(DiscoveryError::InvalidInput(_))));
    }

    #[test]
    fn discover_local_no_matches_is_error() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("readme.md"));
        let result = discover_local(tmp.path(), &default_extensions());
        assert!(matches!(result, Err(DiscoveryError::NoFilesFound(_))));
    }

    // =========================================================================
    // Remote listing
    // =========================================================================

    #[test]
    fn remote_find_command_shape() {
        let cmd = remote_find_command("/var/www/images", &ExtensionSet::new(["jpg", ".PNG"]));
        assert_eq!(
            cmd,
            r"find '/var/www/images' -type f \( -iname '*.jpg' -o -iname '*.png' \) | sort"
        );
    }

    #[test]
    fn remote_find_command_quotes_paths() {
        let cmd = remote_find_command("/srv/it's here", &ExtensionSet::new(["jpg"]));
        assert!(cmd.starts_with(r"find '/srv/it'\''s here' "), "{cmd}");
    }

    #[test]
    fn parse_remote_listing_drops_empty_lines() {
        let output = "/r/a.jpg\n\n/r/sub/b.png\n   \n/r/c.heif\n";
        let found = parse_remote_listing(output);
        assert_eq!(names(&found), vec!["a.jpg", "b.png", "c.heif"]);
        assert!(found.iter().all(|c| c.source == DiscoverySource::RemoteListing));
    }

    // =========================================================================
    // Already-converted filter
    // =========================================================================

    #[test]
    fn filter_drops_only_fully_converted() {
        let tmp = TempDir::new().unwrap();
        let both = tmp.path().join("both.jpg");
        let partial = tmp.path().join("partial.jpg");
        let none = tmp.path().join("none.png");
        for p in [&both, &partial, &none] {
            touch(p);
        }
        touch(&tmp.path().join("both.webp"));
        touch(&tmp.path().join("both.avif"));
        touch(&tmp.path().join("partial.webp"));

        let candidates = discover_local(tmp.path(), &default_extensions()).unwrap();
        let remaining = filter_converted(candidates, &OutputFormat::ALL);
        assert_eq!(names(&remaining), vec!["none.png", "partial.jpg"]);
    }

    #[test]
    fn filter_considers_only_enabled_formats() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("a.jpg"));
        touch(&tmp.path().join("a.webp"));

        let candidates = discover_local(tmp.path(), &default_extensions()).unwrap();
        let remaining = filter_converted(candidates.clone(), &[OutputFormat::WebP]);
        assert!(remaining.is_empty());

        let remaining = filter_converted(candidates, &[]);
        assert_eq!(remaining.len(), 1);
    }
}
