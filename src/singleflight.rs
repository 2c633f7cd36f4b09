//! Per-digest coalescing of blob downloads.
//!
//! Concurrent requests for the same digest share one upstream fetch. The
//! leader downloads into a local temp file while hashing, verifies the
//! digest, then publishes the file; followers stream the shared artifact.
//! The durable cache fill happens afterwards on a detached task so client
//! disconnects never abort it.

use crate::cache::Cache;
use crate::config::{DEFERRED_UPLOAD_TIMEOUT, UPLOAD_MAX_ATTEMPTS};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

/// What a would-be leader got back from upstream.
pub enum Fetched<S> {
    Stream(S),
    /// Upstream refused with a non-200; forwarded to the client untouched.
    Refused(reqwest::Response),
}

/// How the coordinator wants the blob delivered.
pub enum BlobServed<S> {
    /// Complete, digest-verified temp artifact.
    Temp { file: File, size: u64 },
    /// Degraded direct passthrough (another process owns the temp file).
    Direct(S),
    /// Upstream non-200, forwarded as-is.
    Refused(reqwest::Response),
}

pub struct BlobCoordinator {
    temp_dir: PathBuf,
    in_flight: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl BlobCoordinator {
    /// Create the coordinator, validating the temp directory up front:
    /// it must exist with mode 0700 and accept 0600 writes.
    pub fn new(temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let probe = temp_dir.join(".testwrite");
        write_probe(&probe)?;
        std::fs::remove_file(&probe)?;

        Ok(Self {
            temp_dir,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Serve a blob, coalescing concurrent requests for the same digest
    /// into one upstream fetch. `fetch` runs at most once per call and only
    /// when this request ends up leading the download.
    pub async fn serve<F, Fut, S, E>(
        &self,
        digest: &str,
        cache: Arc<Cache>,
        cache_key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<BlobServed<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<S>>>,
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Into<ProxyError>,
    {
        let temp_path = self.temp_path(digest);
        let mut fetch = Some(fetch);

        loop {
            // Local temp hit: a finished, digest-verified artifact
            if let Some((file, size)) = open_temp(&temp_path).await? {
                tracing::debug!(digest = %digest, "Serving blob from temp artifact");
                return Ok(BlobServed::Temp { file, size });
            }

            // A leader is already downloading: wait, then retry the temp file
            let waiter = {
                let map = self.in_flight.lock().unwrap();
                map.get(digest).map(|tx| tx.subscribe())
            };
            if let Some(mut rx) = waiter {
                tracing::debug!(digest = %digest, "Waiting for in-flight blob download");
                let _ = rx.recv().await;
                continue;
            }

            // Try to take leadership
            let tx = {
                let mut map = self.in_flight.lock().unwrap();
                match map.entry(digest.to_string()) {
                    std::collections::hash_map::Entry::Occupied(_) => None,
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let (tx, _) = broadcast::channel(1);
                        entry.insert(tx.clone());
                        Some(tx)
                    }
                }
            };
            let Some(tx) = tx else {
                // Lost the leadership race; go back to waiting
                continue;
            };

            let fetch = fetch.take().expect("leadership taken once");
            let outcome = self.lead(digest, &temp_path, fetch).await;

            self.in_flight.lock().unwrap().remove(digest);
            let _ = tx.send(());

            return match outcome {
                Ok(Lead::Done { file, size }) => {
                    self.spawn_deferred_upload(
                        temp_path,
                        digest.to_string(),
                        cache,
                        cache_key.to_string(),
                        ttl,
                    );
                    Ok(BlobServed::Temp { file, size })
                }
                Ok(Lead::Direct(stream)) => Ok(BlobServed::Direct(stream)),
                Ok(Lead::Refused(response)) => Ok(BlobServed::Refused(response)),
                Err(e) => Err(e),
            };
        }
    }

    /// Download into `<temp>.partial` while hashing, verify, then rename to
    /// the final temp name so followers only ever see complete artifacts.
    async fn lead<F, Fut, S, E>(
        &self,
        digest: &str,
        temp_path: &Path,
        fetch: F,
    ) -> Result<Lead<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<S>>>,
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Into<ProxyError>,
    {
        let partial_path = temp_path.with_extension("partial");

        let mut open = OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        open.mode(0o600);

        let mut file = match open.open(&partial_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another process on this host is leading; degrade to a
                // direct fetch without caching
                tracing::debug!(digest = %digest, "Temp file owned by another process, fetching directly");
                return match fetch().await? {
                    Fetched::Stream(stream) => Ok(Lead::Direct(stream)),
                    Fetched::Refused(response) => Ok(Lead::Refused(response)),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let mut stream = match fetch().await {
            Ok(Fetched::Stream(stream)) => stream,
            Ok(Fetched::Refused(response)) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Ok(Lead::Refused(response));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(e);
            }
        };

        let mut hasher = Sha256::new();
        let mut size = 0u64;

        loop {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let _ = tokio::fs::remove_file(&partial_path).await;
                    return Err(e.into());
                }
                None => break,
            };
            hasher.update(&chunk);
            size += chunk.len() as u64;
            if let Err(e) = file.write_all(&chunk).await {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(e.into());
            }
        }

        if let Err(e) = file.sync_all().await {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(e.into());
        }
        drop(file);

        let actual = format!("sha256:{:x}", hasher.finalize());
        if actual != digest {
            let _ = tokio::fs::remove_file(&partial_path).await;
            tracing::error!(
                expected = %digest,
                actual = %actual,
                "Blob digest mismatch"
            );
            return Err(ProxyError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }

        tokio::fs::rename(&partial_path, temp_path).await?;

        let file = File::open(temp_path).await?;
        tracing::info!(digest = %digest, size = size, "Blob downloaded and verified");
        Ok(Lead::Done { file, size })
    }

    /// Upload the verified temp file to the durable cache on its own task
    /// with a fresh deadline, retrying with backoff. The temp file goes
    /// away when the task finishes, whatever the outcome.
    fn spawn_deferred_upload(
        &self,
        temp_path: PathBuf,
        digest: String,
        cache: Arc<Cache>,
        cache_key: String,
        ttl: Duration,
    ) {
        tokio::spawn(async move {
            let upload = async {
                for attempt in 1..=UPLOAD_MAX_ATTEMPTS {
                    // Reopening rewinds the file for each attempt
                    let mut file = match File::open(&temp_path).await {
                        Ok(file) => file,
                        Err(e) => {
                            tracing::warn!(digest = %digest, error = %e, "Temp file vanished before upload");
                            return;
                        }
                    };

                    match cache
                        .put_stream(
                            &cache_key,
                            &mut file,
                            &digest,
                            "application/octet-stream",
                            ttl,
                        )
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(digest = %digest, key = %cache_key, "Blob stored in persistent cache");
                            return;
                        }
                        Err(e) => {
                            let fatal = matches!(
                                &e,
                                ProxyError::Store(store_err) if !store_err.is_retryable()
                            );
                            tracing::warn!(
                                digest = %digest,
                                attempt = attempt,
                                fatal = fatal,
                                error = %e,
                                "Deferred blob upload failed"
                            );
                            if fatal {
                                return;
                            }
                        }
                    }

                    tokio::time::sleep(Duration::from_secs(attempt as u64 * 2)).await;
                }
            };

            if tokio::time::timeout(DEFERRED_UPLOAD_TIMEOUT, upload)
                .await
                .is_err()
            {
                tracing::warn!(digest = %digest, "Deferred blob upload timed out");
            }

            let _ = tokio::fs::remove_file(&temp_path).await;
        });
    }

    fn temp_path(&self, digest: &str) -> PathBuf {
        self.temp_dir.join(sanitize_digest(digest))
    }
}

enum Lead<S> {
    Done { file: File, size: u64 },
    Direct(S),
    Refused(reqwest::Response),
}

/// Temp-file names keep only `[A-Za-z0-9_-]`, capped at 255 bytes.
pub fn sanitize_digest(digest: &str) -> String {
    let mut safe: String = digest
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe.truncate(255);
    safe
}

/// Open a finished temp artifact, accepting only regular 0600 files.
async fn open_temp(path: &Path) -> Result<Option<(File, u64)>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o777 != 0o600 {
            return Ok(None);
        }
    }

    match File::open(path).await {
        Ok(file) => Ok(Some((file, metadata.len()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_probe(path: &Path) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(b"test")
}
