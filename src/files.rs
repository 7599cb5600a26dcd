//! Three-layer file fetcher: cache directory → local filesystem → worker
//! sessions over the distributed channel
//!
//! Cache entries are named by a stable hash of the request path with the
//! original extension preserved for MIME inference. Cache writes are
//! best-effort; a failed write never fails the fetch.

use crate::channels::distributed::DistributedToolChannel;
use crate::error::{Result, VcpError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a fetched file body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSource {
    Local,
    Distributed,
    /// Reserved for bodies pulled from remote URLs by the embedding layer
    #[allow(dead_code)]
    Fetched,
}

/// A resolved file.
#[derive(Debug)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub size: usize,
    pub from_cache: bool,
    pub source: FileSource,
}

/// Cumulative fetcher statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cached_files: usize,
    pub total_bytes: u64,
}

pub struct FileFetcher {
    cache_dir: PathBuf,
    channel: Arc<DistributedToolChannel>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileFetcher {
    pub fn new(cache_dir: PathBuf, channel: Arc<DistributedToolChannel>) -> Self {
        Self {
            cache_dir,
            channel,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve `path` through the three layers; the first hit wins.
    pub async fn fetch(&self, path: &str) -> Result<FetchedFile> {
        let normalized = normalize_path(path);
        let cache_path = self.cache_path_for(&normalized);

        // Layer 1: cache directory
        if let Ok(bytes) = tokio::fs::read(&cache_path).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(path, cache = %cache_path.display(), "file cache hit");
            return Ok(FetchedFile {
                size: bytes.len(),
                mime: mime_for(&normalized),
                bytes,
                from_cache: true,
                source: FileSource::Local,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Layer 2: local filesystem
        if let Ok(bytes) = tokio::fs::read(&normalized).await {
            self.persist(&cache_path, &bytes).await;
            return Ok(FetchedFile {
                size: bytes.len(),
                mime: mime_for(&normalized),
                bytes,
                from_cache: false,
                source: FileSource::Local,
            });
        }

        // Layer 3: connected workers
        if self.channel.session_count().await > 0 {
            match self.channel.fetch_file(path).await {
                Ok(payload) => {
                    self.persist(&cache_path, &payload.bytes).await;
                    return Ok(FetchedFile {
                        size: payload.bytes.len(),
                        mime: payload.mime.unwrap_or_else(|| mime_for(&normalized)),
                        bytes: payload.bytes,
                        from_cache: false,
                        source: FileSource::Distributed,
                    });
                }
                Err(e) => {
                    tracing::debug!(path, error = %e, "distributed file fetch failed");
                }
            }
        }

        Err(VcpError::tool_execution_failed(format!(
            "file not found in cache, filesystem or any worker: {path}"
        )))
    }

    /// Best-effort cache write.
    async fn persist(&self, cache_path: &Path, bytes: &[u8]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            tracing::warn!(dir = %self.cache_dir.display(), error = %e, "cannot create file cache dir");
            return;
        }
        if let Err(e) = tokio::fs::write(cache_path, bytes).await {
            tracing::warn!(cache = %cache_path.display(), error = %e, "file cache write failed");
        }
    }

    fn cache_path_for(&self, normalized: &str) -> PathBuf {
        let digest = Sha256::digest(normalized.as_bytes());
        let key = hex_string(&digest);
        let ext = Path::new(normalized)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        self.cache_dir.join(format!("{key}{ext}"))
    }

    pub async fn clear_cache(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VcpError::tool_execution_failed(format!(
                    "cannot clear file cache: {e}"
                )))
            }
        }
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| VcpError::tool_execution_failed(format!("cannot recreate cache dir: {e}")))?;
        tracing::info!(dir = %self.cache_dir.display(), "file cache cleared");
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        let mut cached_files = 0;
        let mut total_bytes = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.cache_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() {
                        cached_files += 1;
                        total_bytes += meta.len();
                    }
                }
            }
        }

        CacheStats {
            hits,
            misses,
            hit_rate,
            cached_files,
            total_bytes,
        }
    }
}

/// Strip a `file://` scheme down to a bare path.
fn normalize_path(path: &str) -> String {
    path.strip_prefix("file://").unwrap_or(path).to_string()
}

fn mime_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Frame;
    use base64::Engine as _;
    use serde_json::json;

    fn fetcher_with_dir(dir: &Path) -> FileFetcher {
        FileFetcher::new(
            dir.to_path_buf(),
            Arc::new(DistributedToolChannel::new()),
        )
    }

    #[tokio::test]
    async fn test_filesystem_then_cache() {
        let cache = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let file = data.path().join("note.txt");
        tokio::fs::write(&file, b"hello").await.unwrap();

        let fetcher = fetcher_with_dir(cache.path());
        let path = file.to_str().unwrap();

        let first = fetcher.fetch(path).await.unwrap();
        assert_eq!(first.bytes, b"hello");
        assert!(!first.from_cache);
        assert_eq!(first.source, FileSource::Local);
        assert_eq!(first.mime, "text/plain");

        // Source file gone; the cache still answers
        tokio::fs::remove_file(&file).await.unwrap();
        let second = fetcher.fetch(path).await.unwrap();
        assert_eq!(second.bytes, b"hello");
        assert!(second.from_cache);
        assert_eq!(second.source, FileSource::Local);

        let stats = fetcher.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.cached_files, 1);
        assert_eq!(stats.total_bytes, 5);
    }

    #[tokio::test]
    async fn test_file_scheme_normalized() {
        let cache = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let file = data.path().join("img.png");
        tokio::fs::write(&file, b"\x89PNG").await.unwrap();

        let fetcher = fetcher_with_dir(cache.path());
        let fetched = fetcher
            .fetch(&format!("file://{}", file.display()))
            .await
            .unwrap();
        assert_eq!(fetched.mime, "image/png");
        assert_eq!(fetched.size, 4);
    }

    #[tokio::test]
    async fn test_cache_preserves_extension() {
        let cache = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let file = data.path().join("song.mp3");
        tokio::fs::write(&file, b"ID3").await.unwrap();

        let fetcher = fetcher_with_dir(cache.path());
        fetcher.fetch(file.to_str().unwrap()).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(cache.path()).await.unwrap();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".mp3"));
        // Content-independent key: hex hash, not the original name
        assert!(!names[0].contains("song"));
    }

    #[tokio::test]
    async fn test_all_layers_miss() {
        let cache = tempfile::tempdir().unwrap();
        let fetcher = fetcher_with_dir(cache.path());
        let err = fetcher.fetch("/no/such/file.bin").await.unwrap_err();
        assert!(err.message.contains("/no/such/file.bin"));
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let cache = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let file = data.path().join("a.txt");
        tokio::fs::write(&file, b"x").await.unwrap();

        let fetcher = fetcher_with_dir(cache.path());
        fetcher.fetch(file.to_str().unwrap()).await.unwrap();
        assert_eq!(fetcher.stats().await.cached_files, 1);

        fetcher.clear_cache().await.unwrap();
        assert_eq!(fetcher.stats().await.cached_files, 0);
    }

    #[tokio::test]
    async fn test_distributed_layer_and_recache() {
        let cache = tempfile::tempdir().unwrap();
        let channel = Arc::new(DistributedToolChannel::new());
        let (tx, mut rx) = tokio::sync::mpsc::channel(DistributedToolChannel::outbound_capacity());
        let session_id = channel.open_session(tx).await;
        let _ack = rx.recv().await.unwrap();

        // Stub worker: answer every fetch_file with fixed bytes
        let worker_channel = channel.clone();
        let worker_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if frame.kind == "fetch_file" {
                    let reply = Frame::new(
                        "file_result",
                        json!({
                            "requestId": frame.data["requestId"],
                            "status": "success",
                            "content": base64::engine::general_purpose::STANDARD.encode(b"worker data"),
                            "mime": "text/markdown",
                        }),
                    );
                    worker_channel
                        .handle_frame(&worker_session, &reply.to_text())
                        .await;
                }
            }
        });

        let fetcher = FileFetcher::new(cache.path().to_path_buf(), channel);
        let first = fetcher.fetch("/remote/notes.md").await.unwrap();
        assert_eq!(first.bytes, b"worker data");
        assert_eq!(first.source, FileSource::Distributed);
        assert_eq!(first.mime, "text/markdown");

        // Second fetch is served from the cache, not the worker
        let second = fetcher.fetch("/remote/notes.md").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.source, FileSource::Local);
    }
}
