use std::env;
use std::time::Duration;

/// Upstream registry base URL (Docker Hub).
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Accept header sent upstream when the client did not provide one.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// User-Agent sent on every upstream request.
pub const USER_AGENT: &str = "RegistryProxy/1.0";

/// A token within this margin of its expiry is treated as unusable.
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 60;

/// Total-request timeout for the upstream HTTP client.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Interval between purger cycles.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Entries not read for this long are purged regardless of TTL.
pub const IDLE_EVICTION_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Deadline for a deferred blob upload, detached from the request.
pub const DEFERRED_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Attempts for the deferred blob upload before giving up.
pub const UPLOAD_MAX_ATTEMPTS: u32 = 5;

/// Deadline for access-log inserts so they never back-pressure requests.
pub const ACCESS_LOG_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Config {
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub dockerhub_user: String,
    pub dockerhub_password: String,
    pub cache_ttl: Duration,
    pub tag_cache_ttl: Duration,
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    pub postgres: PostgresConfig,
    pub temp_dir: String,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub ssl_mode: String,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn load() -> crate::error::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> crate::error::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_ttl = get_duration(&lookup, "CACHE_TTL", Duration::from_secs(12 * 60 * 60));
        // TAG_CACHE_TTL defaults to CACHE_TTL when unset
        let tag_cache_ttl = get_duration(&lookup, "TAG_CACHE_TTL", cache_ttl);

        Ok(Config {
            s3_bucket: get(&lookup, "S3_BUCKET", "registry-cache"),
            s3_region: get(&lookup, "AWS_REGION", "us-east-1"),
            s3_endpoint: must_get(&lookup, "S3_ENDPOINT")?,
            s3_access_key: must_get(&lookup, "AWS_ACCESS_KEY_ID")?,
            s3_secret_key: must_get(&lookup, "AWS_SECRET_ACCESS_KEY")?,
            dockerhub_user: must_get(&lookup, "DOCKERHUB_USER")?,
            dockerhub_password: must_get(&lookup, "DOCKERHUB_PASSWORD")?,
            cache_ttl,
            tag_cache_ttl,
            rate_limit: get_int(&lookup, "RATE_LIMIT", 100),
            rate_limit_window: get_duration(&lookup, "RATE_LIMIT_WINDOW", Duration::from_secs(60)),
            postgres: PostgresConfig {
                user: get(&lookup, "POSTGRES_USER", "registry"),
                password: get(&lookup, "POSTGRES_PASSWORD", "password"),
                host: get(&lookup, "POSTGRES_HOST", "localhost"),
                port: get_int(&lookup, "POSTGRES_PORT", 5432u16),
                database: get(&lookup, "POSTGRES_DATABASE", "registry_proxy"),
                ssl_mode: get(&lookup, "POSTGRES_SSL_MODE", "disable"),
            },
            temp_dir: get(&lookup, "TEMP_DIR", "/tmp/registry-proxy"),
            debug: get(&lookup, "DEBUG", "false") == "true",
        })
    }
}

fn must_get<F>(lookup: &F, key: &str) -> crate::error::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(crate::error::ProxyError::Config(format!(
            "missing required environment variable {key}"
        ))),
    }
}

fn get<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_int<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Some(value) if !value.is_empty() => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(variable = key, value = %value, "Invalid integer value, using default");
                default
            }
        },
        _ => default,
    }
}

fn get_duration<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.is_empty() => match parse_duration(&value) {
            Some(parsed) => parsed,
            None => {
                tracing::warn!(variable = key, value = %value, "Invalid duration format, using default");
                default
            }
        },
        _ => default,
    }
}

/// Parse durations like `12h`, `30m`, `90s`, `250ms`, or compounds (`1h30m`).
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();

    let mut flush = |number: &mut String, unit: &mut String, total: &mut Duration| -> bool {
        if number.is_empty() {
            return false;
        }
        let value: u64 = match number.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let segment = match unit.as_str() {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return false,
        };
        *total += segment;
        number.clear();
        unit.clear();
        true
    };

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() && !flush(&mut number, &mut unit, &mut total) {
                return None;
            }
            number.push(ch);
        } else if ch.is_ascii_alphabetic() {
            unit.push(ch);
        } else {
            return None;
        }
    }
    if !flush(&mut number, &mut unit, &mut total) {
        return None;
    }

    Some(total)
}
