//! PostgreSQL-backed metadata index.

use super::metadata::{AccessLogRow, CacheEntryRow, MetadataIndex, TagEntryRow};
use crate::config::PostgresConfig;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::time::Duration;
use time::OffsetDateTime;

/// Embedded schema, applied idempotently at startup.
const SCHEMA: &str = include_str!("schema.sql");

const CONNECT_MAX_ATTEMPTS: u32 = 5;
const CONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);

pub struct PostgresIndex {
    pool: PgPool,
}

impl PostgresIndex {
    /// Connect with retries (exponential backoff from 2 s) and migrate.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database)
            .ssl_mode(parse_ssl_mode(&cfg.ssl_mode));

        let mut backoff = CONNECT_INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=CONNECT_MAX_ATTEMPTS {
            match PgPoolOptions::new()
                .max_connections(10)
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    tracing::info!(
                        host = %cfg.host,
                        database = %cfg.database,
                        "Database connection established"
                    );
                    let index = Self { pool };
                    index.migrate().await?;
                    return Ok(index);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt,
                        error = %e,
                        "Database connection failed"
                    );
                    last_err = Some(e);
                    if attempt < CONNECT_MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_err.expect("at least one connection attempt").into())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        // Postgres rejects multiple statements per prepared statement, so
        // the schema is split and executed statement by statement.
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn parse_ssl_mode(mode: &str) -> PgSslMode {
    match mode {
        "require" => PgSslMode::Require,
        "prefer" => PgSslMode::Prefer,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        "allow" => PgSslMode::Allow,
        _ => PgSslMode::Disable,
    }
}

#[async_trait]
impl MetadataIndex for PostgresIndex {
    async fn find_cache_entry(&self, key: &str) -> Result<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_cache_entry(&self, entry: &CacheEntryRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, digest, media_type, stored_at, expires_at, last_access, size_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO UPDATE SET
                digest = EXCLUDED.digest,
                media_type = EXCLUDED.media_type,
                expires_at = EXCLUDED.expires_at,
                last_access = EXCLUDED.last_access,
                size_bytes = EXCLUDED.size_bytes
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.digest)
        .bind(&entry.media_type)
        .bind(entry.stored_at)
        .bind(entry.expires_at)
        .bind(entry.last_access)
        .bind(entry.size_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_access(&self, key: &str, now: OffsetDateTime) -> Result<()> {
        sqlx::query("UPDATE cache_entries SET last_access = $1 WHERE key = $2")
            .bind(now)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_cache_entries_by_digest(&self, digest: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE digest = $1")
            .bind(digest)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_tag_entry(&self, repository: &str) -> Result<Option<TagEntryRow>> {
        let row =
            sqlx::query_as::<_, TagEntryRow>("SELECT * FROM tag_entries WHERE repository = $1")
                .bind(repository)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn upsert_tag_entry(&self, entry: &TagEntryRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tag_entries (repository, tags, etag, last_modified, stored_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (repository) DO UPDATE SET
                tags = EXCLUDED.tags,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                stored_at = EXCLUDED.stored_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.repository)
        .bind(&entry.tags)
        .bind(&entry.etag)
        .bind(entry.last_modified)
        .bind(entry.stored_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_tag_entry(
        &self,
        repository: &str,
        stored_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query("UPDATE tag_entries SET stored_at = $1, expires_at = $2 WHERE repository = $3")
            .bind(stored_at)
            .bind(expires_at)
            .bind(repository)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_tag_entry(&self, repository: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tag_entries WHERE repository = $1")
            .bind(repository)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn expired_cache_entries(
        &self,
        now: OffsetDateTime,
        idle_cutoff: OffsetDateTime,
    ) -> Result<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE expires_at < $1 OR last_access < $2",
        )
        .bind(now)
        .bind(idle_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn expired_tag_entries(&self, now: OffsetDateTime) -> Result<Vec<TagEntryRow>> {
        let rows =
            sqlx::query_as::<_, TagEntryRow>("SELECT * FROM tag_entries WHERE expires_at < $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn insert_access_log(&self, entry: &AccessLogRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_logs (timestamp, method, path, status, duration_ms, client_ip, user_agent, bytes_sent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.timestamp)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(entry.status)
        .bind(entry.duration_ms)
        .bind(&entry.client_ip)
        .bind(&entry.user_agent)
        .bind(entry.bytes_sent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
