//! Blob store for full subprocess logs.
//!
//! Operations keep only an opaque `log_ref` handle; the bytes live as flat
//! files in one directory. UIs fetch the full blob through the service and
//! can use [`truncate_for_display`] to fit their display slot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

/// Display slot budget: 32 KiB total, first/last 16 KiB for longer logs.
pub const DISPLAY_BUDGET: usize = 32 * 1024;

const TRUNCATION_MARKER: &[u8] = b"\n[... log truncated ...]\n";

#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    /// Open (and create if needed) the blob directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Store a blob and return its handle.
    pub async fn put(&self, contents: &[u8]) -> Result<String> {
        let log_ref = format!("{}.log", Uuid::new_v4().simple());
        let path = self.dir.join(&log_ref);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write log blob {}", path.display()))?;
        Ok(log_ref)
    }

    /// Fetch a blob by handle.
    pub async fn read(&self, log_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(log_ref)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read log blob {}", path.display()))
    }

    /// Resolve a handle to a path, rejecting anything that could escape
    /// the blob directory.
    fn path_for(&self, log_ref: &str) -> Result<PathBuf> {
        let valid = !log_ref.is_empty()
            && log_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            && !log_ref.starts_with('.');
        if !valid {
            bail!("invalid log ref {log_ref:?}");
        }
        Ok(self.dir.join(log_ref))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reduce a log to the display budget: the whole blob when it fits,
/// otherwise the first and last halves joined by a truncation marker.
pub fn truncate_for_display(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() <= DISPLAY_BUDGET {
        return bytes.to_vec();
    }
    let half = DISPLAY_BUDGET / 2;
    let mut out = Vec::with_capacity(DISPLAY_BUDGET + TRUNCATION_MARKER.len());
    out.extend_from_slice(&bytes[..half]);
    out.extend_from_slice(TRUNCATION_MARKER);
    out.extend_from_slice(&bytes[bytes.len() - half..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_read_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::new(dir.path().join("logs")).unwrap();

        let log_ref = store.put(b"repacking 12 packs\n").await.unwrap();
        let bytes = store.read(&log_ref).await.unwrap();
        assert_eq!(bytes, b"repacking 12 packs\n");
    }

    #[tokio::test]
    async fn refs_are_unique() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        let a = store.put(b"a").await.unwrap();
        let b = store.put(b"b").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn traversal_refs_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        for bad in ["../etc/passwd", "a/b.log", "", ".hidden"] {
            assert!(store.read(bad).await.is_err(), "expected rejection: {bad:?}");
        }
    }

    #[test]
    fn short_log_kept_whole() {
        let log = vec![b'x'; 100];
        assert_eq!(truncate_for_display(&log), log);
    }

    #[test]
    fn log_at_budget_kept_whole() {
        let log = vec![b'x'; DISPLAY_BUDGET];
        assert_eq!(truncate_for_display(&log).len(), DISPLAY_BUDGET);
    }

    #[test]
    fn long_log_keeps_first_and_last_half() {
        let mut log = vec![b'a'; DISPLAY_BUDGET];
        log.extend(vec![b'z'; DISPLAY_BUDGET]);

        let shown = truncate_for_display(&log);
        assert!(shown.starts_with(&vec![b'a'; DISPLAY_BUDGET / 2][..]));
        assert!(shown.ends_with(&vec![b'z'; DISPLAY_BUDGET / 2][..]));
        let marker = String::from_utf8_lossy(&shown);
        assert!(marker.contains("log truncated"));
    }
}
