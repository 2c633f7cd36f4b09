use registry_proxy::cache::{Cache, MetadataIndex, PostgresIndex};
use registry_proxy::middleware::RateLimiter;
use registry_proxy::purge::Purger;
use registry_proxy::storage::{ObjectStore, S3ObjectStore};
use registry_proxy::{start_server, AppState, BlobCoordinator, Config, UpstreamClient};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let index: Arc<dyn MetadataIndex> = Arc::new(PostgresIndex::connect(&config.postgres).await?);

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
        &config.s3_bucket,
    ));

    let cache = Arc::new(Cache::new(store.clone(), index.clone()));
    let upstream = Arc::new(UpstreamClient::new(Some((
        config.dockerhub_user.clone(),
        config.dockerhub_password.clone(),
    )))?);
    let blobs = Arc::new(BlobCoordinator::new(&config.temp_dir)?);

    let state = AppState {
        cache,
        index: index.clone(),
        upstream,
        blobs,
        cache_ttl: config.cache_ttl,
        tag_cache_ttl: config.tag_cache_ttl,
    };

    let limiter = RateLimiter::new(config.rate_limit, config.rate_limit_window);
    let _cleanup = limiter.spawn_cleanup();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let purger = Purger::new(store, index).spawn(shutdown_rx);

    let (addr, server) = start_server("0.0.0.0:8080", state, limiter).await?;
    tracing::info!(addr = %addr, "Registry proxy started");

    server.await?;

    let _ = shutdown_tx.send(true);
    purger.await?;

    Ok(())
}
