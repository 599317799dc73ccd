//! Change detection over a document directory.
//!
//! The detector compares a directory's current file state against the
//! stored document set and reports three disjoint sets: new files, modified
//! files, and removed files. It is strictly read-only — callers decide what
//! to do with the sets.
//!
//! Modification detection is two-stage: modification time acts only as a
//! cheap pre-filter, and the blake3 content hash is authoritative. A copy
//! operation that rewrites timestamps without touching content therefore
//! never triggers a re-parse, and a document already `vectorized` with an
//! unchanged hash is never re-emitted.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::store::{ContentHash, DocumentRecord, JobStore};

/// File extensions the ingestion pipeline accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "ppt", "pptx", "md", "markdown", "txt", "csv", "xlsx", "xls",
];

/// Extensions that must go through the external parser.
pub const PARSER_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "ppt", "pptx"];

/// Extensions ingested directly from raw content, no external parsing.
pub const DIRECT_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "csv"];

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

pub fn needs_external_parsing(ext: &str) -> bool {
    PARSER_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// A file found on disk, hashed and ready to register.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub modified_at: i64,
    pub content_hash: ContentHash,
}

/// Result of one scan: three disjoint sets.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// On disk, no stored document at that path.
    pub new: Vec<ScannedFile>,
    /// Stored path whose content hash differs.
    pub modified: Vec<ScannedFile>,
    /// Stored documents whose path is absent from disk.
    pub removed: Vec<DocumentRecord>,
    /// Files skipped by the mtime pre-filter or matching hash.
    pub unchanged: usize,
}

/// Read-only scanner for one knowledge base rooted at a directory.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    root: PathBuf,
    kb_code: String,
}

impl ChangeDetector {
    pub fn new(root: PathBuf, kb_code: impl Into<String>) -> Self {
        Self {
            root,
            kb_code: kb_code.into(),
        }
    }

    /// Scan the root and diff against the stored document set.
    pub async fn scan(&self, store: &JobStore) -> Result<ScanOutcome> {
        let mut remaining: HashMap<String, DocumentRecord> = store
            .list_documents(Some(&self.kb_code))
            .await?
            .into_iter()
            .map(|d| (d.path.clone(), d))
            .collect();

        let mut outcome = ScanOutcome::default();

        for path in self.walk()? {
            let relative = self.relative_path(&path)?;
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    continue;
                }
            };
            let size = metadata.len();
            let modified_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            match remaining.remove(&relative) {
                None => {
                    let file = self.hash_file(&path, relative, size, modified_at).await?;
                    outcome.new.push(file);
                }
                Some(stored) => {
                    // Pre-filter: same size and no newer mtime means we
                    // trust the stored hash without re-reading the file.
                    if size as i64 == stored.size && modified_at <= stored.modified_at {
                        outcome.unchanged += 1;
                        continue;
                    }
                    let file = self.hash_file(&path, relative, size, modified_at).await?;
                    if file.content_hash == stored.content_hash {
                        // Timestamp churn without content change.
                        outcome.unchanged += 1;
                        continue;
                    }
                    outcome.modified.push(file);
                }
            }
        }

        outcome.removed = remaining.into_values().collect();

        debug!(
            kb = %self.kb_code,
            new = outcome.new.len(),
            modified = outcome.modified.len(),
            removed = outcome.removed.len(),
            unchanged = outcome.unchanged,
            "scan complete"
        );
        Ok(outcome)
    }

    /// Hash one file on disk into a [`ScannedFile`].
    pub async fn hash_file(
        &self,
        path: &Path,
        relative_path: String,
        size: u64,
        modified_at: i64,
    ) -> Result<ScannedFile> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let content_hash = *blake3::hash(&content).as_bytes();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.clone());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        Ok(ScannedFile {
            absolute_path: path.to_path_buf(),
            relative_path,
            name,
            extension,
            size,
            modified_at,
            content_hash,
        })
    }

    fn walk(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in WalkBuilder::new(&self.root).build() {
            let entry = entry?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let path = entry.into_path();
            let supported = path
                .extension()
                .map(|e| is_supported_extension(&e.to_string_lossy()))
                .unwrap_or(false);
            if supported {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn relative_path(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        Ok(relative.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewDocument;
    use tempfile::tempdir;

    async fn register(store: &JobStore, file: &ScannedFile) {
        store
            .upsert_document(&NewDocument {
                path: file.relative_path.clone(),
                kb_code: "kb1".to_string(),
                name: file.name.clone(),
                extension: file.extension.clone(),
                size: file.size as i64,
                content_hash: file.content_hash,
                modified_at: file.modified_at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_directory_reports_all_files_as_new() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("a.md"), "alpha").await?;
        tokio::fs::write(dir.path().join("b.txt"), "beta").await?;
        tokio::fs::write(dir.path().join("ignored.bin"), "nope").await?;

        let store = JobStore::open_memory().await?;
        let detector = ChangeDetector::new(dir.path().to_path_buf(), "kb1");
        let outcome = detector.scan(&store).await?;

        assert_eq!(outcome.new.len(), 2);
        assert!(outcome.modified.is_empty());
        assert!(outcome.removed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unchanged_directory_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("a.md"), "alpha").await?;

        let store = JobStore::open_memory().await?;
        let detector = ChangeDetector::new(dir.path().to_path_buf(), "kb1");

        let first = detector.scan(&store).await?;
        for file in &first.new {
            register(&store, file).await;
        }

        let second = detector.scan(&store).await?;
        assert!(second.new.is_empty());
        assert!(second.modified.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(second.unchanged, 1);
        Ok(())
    }

    #[tokio::test]
    async fn touched_but_identical_content_is_not_modified() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.md");
        tokio::fs::write(&path, "alpha").await?;

        let store = JobStore::open_memory().await?;
        let detector = ChangeDetector::new(dir.path().to_path_buf(), "kb1");
        let first = detector.scan(&store).await?;
        // Register with an mtime in the past so the pre-filter fires.
        let mut file = first.new[0].clone();
        file.modified_at = 0;
        register(&store, &file).await;

        // mtime is newer than the stored value, so the detector hashes the
        // file, finds the content identical, and stays quiet.
        let second = detector.scan(&store).await?;
        assert!(second.modified.is_empty());
        assert_eq!(second.unchanged, 1);
        Ok(())
    }

    #[tokio::test]
    async fn content_change_is_reported_as_modified() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.md");
        tokio::fs::write(&path, "alpha").await?;

        let store = JobStore::open_memory().await?;
        let detector = ChangeDetector::new(dir.path().to_path_buf(), "kb1");
        let first = detector.scan(&store).await?;
        let mut file = first.new[0].clone();
        file.modified_at = 0;
        register(&store, &file).await;

        tokio::fs::write(&path, "alpha, revised").await?;
        let second = detector.scan(&store).await?;
        assert_eq!(second.modified.len(), 1);
        assert!(second.new.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_files_are_reported_as_removed() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.md");
        tokio::fs::write(&path, "alpha").await?;

        let store = JobStore::open_memory().await?;
        let detector = ChangeDetector::new(dir.path().to_path_buf(), "kb1");
        let first = detector.scan(&store).await?;
        register(&store, &first.new[0]).await;

        tokio::fs::remove_file(&path).await?;
        let second = detector.scan(&store).await?;
        assert_eq!(second.removed.len(), 1);
        assert_eq!(second.removed[0].path, "a.md");
        Ok(())
    }

    #[test]
    fn extension_classification() {
        assert!(is_supported_extension("pdf"));
        assert!(is_supported_extension("MD"));
        assert!(!is_supported_extension("exe"));
        assert!(needs_external_parsing("docx"));
        assert!(!needs_external_parsing("md"));
    }
}
