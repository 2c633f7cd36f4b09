//! Single-flight coordinator tests: coalescing, verification, cleanup.

use bytes::Bytes;
use futures::stream;
use registry_proxy::cache::{Cache, MemoryIndex};
use registry_proxy::error::ProxyError;
use registry_proxy::singleflight::{sanitize_digest, BlobCoordinator, BlobServed, Fetched};
use registry_proxy::storage::{MemoryObjectStore, ObjectStore};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const TTL: Duration = Duration::from_secs(3600);

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

fn setup(temp: &TempDir) -> (Arc<MemoryObjectStore>, Arc<Cache>, Arc<BlobCoordinator>) {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());
    let cache = Arc::new(Cache::new(store.clone(), index.clone()));
    let blobs = Arc::new(BlobCoordinator::new(temp.path().join("singleflight")).unwrap());
    (store, cache, blobs)
}

fn byte_stream(
    data: Vec<u8>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
    stream::iter(vec![Ok(Bytes::from(data))])
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    out
}

/// Poll until the deferred upload lands (or time out).
async fn wait_for_object(store: &MemoryObjectStore, key: &str) {
    for _ in 0..100 {
        if store.contains(key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("object {key} never appeared in the store");
}

#[tokio::test]
async fn test_single_download_serves_and_caches() {
    let temp = TempDir::new().unwrap();
    let (store, cache, blobs) = setup(&temp);

    let data = b"layer bytes".to_vec();
    let digest = digest_of(&data);
    let key = format!("blobs/library/alpine/{digest}");
    let downloads = Arc::new(AtomicUsize::new(0));

    let counter = downloads.clone();
    let payload = data.clone();
    let served = blobs
        .serve(&digest, cache.clone(), &key, TTL, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Fetched::Stream(byte_stream(payload)))
        })
        .await
        .unwrap();

    match served {
        BlobServed::Temp { file, size } => {
            assert_eq!(size, data.len() as u64);
            assert_eq!(read_all(file).await, data);
        }
        _ => panic!("expected temp delivery"),
    }
    assert_eq!(downloads.load(Ordering::SeqCst), 1);

    // Deferred upload populates the durable cache and removes the temp file
    wait_for_object(&store, &key).await;
    let object = store.get(&key).await.unwrap();
    assert_eq!(&object.bytes[..], &data[..]);
    assert_eq!(object.digest.as_deref(), Some(digest.as_str()));

    for _ in 0..100 {
        if std::fs::read_dir(temp.path().join("singleflight"))
            .unwrap()
            .next()
            .is_none()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("temp file was not removed after upload");
}

#[tokio::test]
async fn test_concurrent_requests_share_one_download() {
    let temp = TempDir::new().unwrap();
    let (_store, cache, blobs) = setup(&temp);

    let data = vec![0xAB; 256 * 1024];
    let digest = digest_of(&data);
    let key = format!("blobs/library/nginx/{digest}");
    let downloads = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let blobs = blobs.clone();
        let cache = cache.clone();
        let key = key.clone();
        let digest = digest.clone();
        let counter = downloads.clone();
        let payload = data.clone();

        handles.push(tokio::spawn(async move {
            let served = blobs
                .serve(&digest, cache, &key, TTL, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Slow the download so the burst overlaps
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Fetched::Stream(byte_stream(payload)))
                })
                .await
                .unwrap();
            match served {
                BlobServed::Temp { file, .. } => read_all(file).await,
                _ => panic!("expected temp delivery"),
            }
        }));
    }

    let bodies = futures::future::join_all(handles).await;
    for body in bodies {
        let body = body.unwrap();
        assert_eq!(digest_of(&body), digest);
    }

    assert_eq!(
        downloads.load(Ordering::SeqCst),
        1,
        "burst must coalesce into one upstream download"
    );
}

#[tokio::test]
async fn test_digest_mismatch_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let (store, cache, blobs) = setup(&temp);

    let requested = digest_of(b"what was asked for");
    let key = format!("blobs/library/alpine/{requested}");

    let result = blobs
        .serve(&requested, cache.clone(), &key, TTL, move || async move {
            Ok(Fetched::Stream(byte_stream(b"something else".to_vec())))
        })
        .await;

    match result {
        Err(ProxyError::DigestMismatch { expected, .. }) => assert_eq!(expected, requested),
        Err(e) => panic!("expected digest mismatch, got {e}"),
        Ok(_) => panic!("expected digest mismatch, got success"),
    }

    assert!(store.is_empty(), "nothing may reach the object store");
    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("singleflight"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "temp files must be cleaned up");
}

#[tokio::test]
async fn test_failed_leader_lets_the_next_request_through() {
    let temp = TempDir::new().unwrap();
    let (_store, cache, blobs) = setup(&temp);

    let data = b"eventually fine".to_vec();
    let digest = digest_of(&data);
    let key = format!("blobs/library/alpine/{digest}");

    let result = blobs
        .serve(&digest, cache.clone(), &key, TTL, move || async move {
            Ok(Fetched::Stream(stream::iter(vec![Err::<Bytes, _>(
                std::io::Error::other("upstream hung up"),
            )])))
        })
        .await;
    assert!(result.is_err());

    // The failed attempt must not wedge the digest
    let payload = data.clone();
    let served = blobs
        .serve(&digest, cache, &key, TTL, move || async move {
            Ok(Fetched::Stream(byte_stream(payload)))
        })
        .await
        .unwrap();

    match served {
        BlobServed::Temp { file, .. } => assert_eq!(read_all(file).await, data),
        _ => panic!("expected temp delivery"),
    }
}

#[tokio::test]
async fn test_fetch_error_propagates() {
    let temp = TempDir::new().unwrap();
    let (_store, cache, blobs) = setup(&temp);

    let digest = digest_of(b"never arrives");
    let key = format!("blobs/library/alpine/{digest}");

    let result = blobs
        .serve(&digest, cache, &key, TTL, move || async move {
            Err::<Fetched<futures::stream::Iter<std::vec::IntoIter<Result<Bytes, std::io::Error>>>>, _>(
                ProxyError::UpstreamAuth("token endpoint returned 503".to_string()),
            )
        })
        .await;

    assert!(matches!(result, Err(ProxyError::UpstreamAuth(_))));
}

#[test]
fn test_sanitize_digest() {
    assert_eq!(
        sanitize_digest("sha256:abc123"),
        "sha256_abc123".to_string()
    );
    assert_eq!(sanitize_digest("a/b\\c d"), "a_b_c_d".to_string());

    let long = "x".repeat(300);
    assert_eq!(sanitize_digest(&long).len(), 255);
}
