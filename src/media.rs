//! Content-addressed media cache.
//!
//! Attachments stream into `<cache_dir>/tmp/<uuid>.part` under a per-kind
//! byte ceiling, get MIME-sniffed from their leading bytes, and land at
//! `<cache_dir>/<fingerprint>.<ext>` via atomic rename. The fingerprint is
//! the SHA-256 of the full bytes; the unique `media` row plus the rename
//! make concurrent acquisition of identical bytes a no-op for the loser.
//!
//! Partial files left by a crash are removed by [`MediaCache::scan_orphans`]
//! at startup.

use crate::config::MediaConfig;
use crate::envelope::{MediaKind, MediaSource};
use crate::error::{BridgeError, MediaRejectReason};
use crate::storage::{MediaArtifact, MessageStore};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bytes inspected for MIME sniffing.
const SNIFF_LEN: usize = 512;

pub struct MediaCache {
    dir: PathBuf,
    tmp_dir: PathBuf,
    config: MediaConfig,
    store: Arc<Mutex<MessageStore>>,
    http: reqwest::Client,
}

impl MediaCache {
    /// Create the cache, making the cache and temp directories if needed.
    pub fn new(
        config: MediaConfig,
        store: Arc<Mutex<MessageStore>>,
    ) -> Result<Self, BridgeError> {
        let dir = config.cache_dir.clone();
        let tmp_dir = dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(MediaCache {
            dir,
            tmp_dir,
            config,
            store,
            http: reqwest::Client::new(),
        })
    }

    /// Remove leftover `tmp/*.part` files from a previous unclean exit.
    /// Returns the number removed.
    pub fn scan_orphans(&self) -> Result<u64, BridgeError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.tmp_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "part") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned orphaned partial media files");
        }
        Ok(removed)
    }

    /// Ingest an attachment from its source location.
    pub async fn acquire(
        &self,
        source: &MediaSource,
        kind: MediaKind,
    ) -> Result<MediaArtifact, BridgeError> {
        match source {
            MediaSource::Url(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| BridgeError::MediaIo(format!("downloading {url}: {e}")))?
                    .error_for_status()
                    .map_err(|e| BridgeError::MediaIo(format!("downloading {url}: {e}")))?;
                let stream = resp
                    .bytes_stream()
                    .map(|r| r.map_err(|e| BridgeError::MediaIo(e.to_string())));
                self.acquire_stream(stream, kind).await
            }
            MediaSource::Local(path) => {
                let stream = file_chunks(path.clone());
                self.acquire_stream(stream, kind).await
            }
        }
    }

    /// Ingest an attachment from a byte stream.
    ///
    /// Enforces the size ceiling while streaming, sniffs the MIME type from
    /// the first bytes, fingerprints the whole payload, and either returns
    /// the already-cached artifact or renames the temp file into place.
    pub async fn acquire_stream<S>(
        &self,
        mut stream: S,
        kind: MediaKind,
    ) -> Result<MediaArtifact, BridgeError>
    where
        S: Stream<Item = Result<Bytes, BridgeError>> + Unpin,
    {
        let limit = self.config.limits.for_kind(kind);
        let tmp_path = self.tmp_dir.join(format!("{}.part", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;

        let mut hasher = Sha256::new();
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut total: u64 = 0;

        let write_result: Result<(), BridgeError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                total += chunk.len() as u64;
                if total > limit {
                    return Err(BridgeError::MediaRejected(MediaRejectReason::TooLarge));
                }
                if head.len() < SNIFF_LEN {
                    let take = (SNIFF_LEN - head.len()).min(chunk.len());
                    head.extend_from_slice(&chunk[..take]);
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            if matches!(e, BridgeError::MediaRejected(MediaRejectReason::TooLarge)) {
                warn!(kind = kind.as_str(), limit, "media over size cap, rejected");
            }
            return Err(e);
        }
        drop(file);

        let sniffed = infer::get(&head);
        let mime = sniffed
            .map(|t| t.mime_type().to_owned())
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        if !self
            .config
            .allowed
            .for_kind(kind)
            .iter()
            .any(|allowed| allowed == &mime)
        {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(kind = kind.as_str(), mime = %mime, "media type not allowed, rejected");
            return Err(BridgeError::MediaRejected(MediaRejectReason::DisallowedType));
        }

        let fingerprint = hex::encode(hasher.finalize());

        let mut store = self.store.lock().await;
        if let Some(existing) = store.media_get(&fingerprint)? {
            // Already cached; this download was redundant.
            let _ = tokio::fs::remove_file(&tmp_path).await;
            debug!(fingerprint = %fingerprint, "media already cached");
            return Ok(existing);
        }

        let ext = sniffed.map_or("bin", |t| t.extension());
        let final_path = self.dir.join(format!("{fingerprint}.{ext}"));
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let artifact = MediaArtifact {
            fingerprint: fingerprint.clone(),
            mime,
            size_bytes: total,
            kind,
            local_path: final_path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
        };
        store.media_insert(&artifact)?;
        debug!(fingerprint = %fingerprint, size = total, "media cached");
        Ok(artifact)
    }

    /// Open a cached artifact for reading.
    pub async fn open(&self, fingerprint: &str) -> Result<tokio::fs::File, BridgeError> {
        let artifact = {
            let store = self.store.lock().await;
            store
                .media_get(fingerprint)?
                .ok_or_else(|| BridgeError::NotFound(format!("media '{fingerprint}'")))?
        };
        Ok(tokio::fs::File::open(&artifact.local_path).await?)
    }

    /// Unlink files and rows for the given fingerprints. Called by the
    /// retention sweep with the orphan list. Returns the number collected.
    pub async fn collect(&self, fingerprints: &[String]) -> Result<u64, BridgeError> {
        let mut collected = 0;
        let mut store = self.store.lock().await;
        for fp in fingerprints {
            if let Some(artifact) = store.media_get(fp)? {
                match tokio::fs::remove_file(&artifact.local_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                store.media_delete(fp)?;
                collected += 1;
            }
        }
        Ok(collected)
    }
}

/// Stream a local file in chunks (the Signal daemon hands us attachment
/// paths on its own disk).
fn file_chunks(path: PathBuf) -> impl Stream<Item = Result<Bytes, BridgeError>> + Unpin {
    Box::pin(futures_util::stream::unfold(
        FileChunkState::Unopened(path),
        |state| async move {
            match state {
                FileChunkState::Unopened(path) => match tokio::fs::File::open(&path).await {
                    Ok(file) => read_chunk(file).await,
                    Err(e) => Some((Err(e.into()), FileChunkState::Done)),
                },
                FileChunkState::Open(file) => read_chunk(file).await,
                FileChunkState::Done => None,
            }
        },
    ))
}

enum FileChunkState {
    Unopened(PathBuf),
    Open(tokio::fs::File),
    Done,
}

async fn read_chunk(
    mut file: tokio::fs::File,
) -> Option<(Result<Bytes, BridgeError>, FileChunkState)> {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 64 * 1024];
    match file.read(&mut buf).await {
        Ok(0) => None,
        Ok(n) => {
            buf.truncate(n);
            Some((Ok(Bytes::from(buf)), FileChunkState::Open(file)))
        }
        Err(e) => Some((Err(e.into()), FileChunkState::Done)),
    }
}
