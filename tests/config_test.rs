//! Configuration loading tests.

use registry_proxy::config::{parse_duration, Config};
use std::collections::HashMap;
use std::time::Duration;

fn required_vars() -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("S3_ENDPOINT".to_string(), "http://minio:9000".to_string());
    vars.insert("AWS_ACCESS_KEY_ID".to_string(), "access".to_string());
    vars.insert("AWS_SECRET_ACCESS_KEY".to_string(), "secret".to_string());
    vars.insert("DOCKERHUB_USER".to_string(), "user".to_string());
    vars.insert("DOCKERHUB_PASSWORD".to_string(), "password".to_string());
    vars
}

fn load(vars: &HashMap<String, String>) -> registry_proxy::Result<Config> {
    Config::from_lookup(|key| vars.get(key).cloned())
}

#[test]
fn test_defaults_with_required_vars() {
    let config = load(&required_vars()).unwrap();

    assert_eq!(config.s3_bucket, "registry-cache");
    assert_eq!(config.s3_region, "us-east-1");
    assert_eq!(config.s3_endpoint, "http://minio:9000");
    assert_eq!(config.cache_ttl, Duration::from_secs(12 * 60 * 60));
    assert_eq!(config.tag_cache_ttl, config.cache_ttl);
    assert_eq!(config.rate_limit, 100);
    assert_eq!(config.rate_limit_window, Duration::from_secs(60));
    assert_eq!(config.postgres.user, "registry");
    assert_eq!(config.postgres.port, 5432);
    assert_eq!(config.postgres.database, "registry_proxy");
    assert_eq!(config.postgres.ssl_mode, "disable");
    assert_eq!(config.temp_dir, "/tmp/registry-proxy");
    assert!(!config.debug);
}

#[test]
fn test_missing_required_var_fails() {
    let mut vars = required_vars();
    vars.remove("S3_ENDPOINT");
    assert!(load(&vars).is_err());

    let mut vars = required_vars();
    vars.remove("DOCKERHUB_PASSWORD");
    assert!(load(&vars).is_err());
}

#[test]
fn test_tag_ttl_follows_cache_ttl() {
    let mut vars = required_vars();
    vars.insert("CACHE_TTL".to_string(), "6h".to_string());
    let config = load(&vars).unwrap();
    assert_eq!(config.cache_ttl, Duration::from_secs(6 * 60 * 60));
    assert_eq!(config.tag_cache_ttl, Duration::from_secs(6 * 60 * 60));

    vars.insert("TAG_CACHE_TTL".to_string(), "30m".to_string());
    let config = load(&vars).unwrap();
    assert_eq!(config.tag_cache_ttl, Duration::from_secs(30 * 60));
}

#[test]
fn test_invalid_duration_uses_default() {
    let mut vars = required_vars();
    vars.insert("CACHE_TTL".to_string(), "tomorrow".to_string());
    let config = load(&vars).unwrap();
    assert_eq!(config.cache_ttl, Duration::from_secs(12 * 60 * 60));
}

#[test]
fn test_invalid_int_uses_default() {
    let mut vars = required_vars();
    vars.insert("RATE_LIMIT".to_string(), "lots".to_string());
    let config = load(&vars).unwrap();
    assert_eq!(config.rate_limit, 100);
}

#[test]
fn test_debug_flag() {
    let mut vars = required_vars();
    vars.insert("DEBUG".to_string(), "true".to_string());
    assert!(load(&vars).unwrap().debug);

    vars.insert("DEBUG".to_string(), "1".to_string());
    assert!(!load(&vars).unwrap().debug);
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("12h"), Some(Duration::from_secs(12 * 3600)));
    assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
    assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
    assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
    assert_eq!(
        parse_duration("1h30m"),
        Some(Duration::from_secs(3600 + 1800))
    );

    assert_eq!(parse_duration(""), None);
    assert_eq!(parse_duration("12"), None);
    assert_eq!(parse_duration("h"), None);
    assert_eq!(parse_duration("12x"), None);
    assert_eq!(parse_duration("-5m"), None);
}
