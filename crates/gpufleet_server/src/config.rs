//! Environment-driven configuration, validated at startup.
//!
//! `Config::from_env` reads the process environment (after `dotenvy` has
//! loaded any `.env` file); any invalid value is a hard startup failure so
//! the process exits instead of running half-configured.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use gpufleet_core::error::FleetError;
use gpufleet_core::ports::Result;
use gpufleet_core::types::{ProbeConfig, RegionConfig};

use crate::migration::MigrationConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub port: u16,
    pub log_level: String,
    pub default_region: String,
    pub regions: Vec<RegionConfig>,
    pub instance_poll_interval: Duration,
    pub max_retry_attempts: u32,
    pub request_timeout: Duration,
    pub webhook_timeout: Duration,
    pub webhook_secret: Option<String>,
    pub cache_ttl: Duration,
    pub merged_cache_ttl: Duration,
    pub max_concurrent_jobs: usize,
    pub probe: ProbeConfig,
    pub monitor_max_wait: Duration,
    pub migration: MigrationConfig,
    pub redis_url: String,
    pub redis_token: Option<String>,
    pub redis_namespace: String,
}

/// Per-type worker concurrency; config-driven with spec defaults.
#[derive(Debug, Clone)]
pub struct WorkerConcurrency {
    pub create_instance: usize,
    pub monitor: usize,
    pub health_check: usize,
    pub send_webhook: usize,
    pub migrate_instance: usize,
    pub migrate_batch: usize,
}

impl Default for WorkerConcurrency {
    fn default() -> Self {
        Self {
            create_instance: 10,
            monitor: 50,
            health_check: 20,
            send_webhook: 20,
            migrate_instance: 5,
            migrate_batch: 1,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup. Tests pass closures instead of
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let upstream_api_key = required(&lookup, "UPSTREAM_API_KEY")?;
        if upstream_api_key.len() < 10 {
            return Err(invalid("UPSTREAM_API_KEY", "must be at least 10 characters"));
        }

        let upstream_base_url = lookup("UPSTREAM_BASE_URL")
            .unwrap_or_else(|| "https://api.novita.ai".into());
        let parsed = url::Url::parse(&upstream_base_url)
            .map_err(|e| invalid("UPSTREAM_BASE_URL", &e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("UPSTREAM_BASE_URL", "must be an http(s) URL"));
        }

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".into());
        if !matches!(log_level.as_str(), "error" | "warn" | "info" | "debug") {
            return Err(invalid("LOG_LEVEL", "must be error, warn, info, or debug"));
        }

        let default_region = lookup("DEFAULT_REGION").unwrap_or_else(|| "region-01".into());
        let regions = parse_regions(&lookup, &default_region)?;

        let migration = MigrationConfig {
            enabled: parse_bool(&lookup, "MIGRATION_ENABLED", true)?,
            interval: Duration::from_secs(
                parse_range(&lookup, "MIGRATION_INTERVAL_MINUTES", 15, 1, 60)? * 60,
            ),
            job_timeout: Duration::from_millis(parse_range(
                &lookup,
                "MIGRATION_JOB_TIMEOUT_MS",
                600_000,
                60_000,
                1_800_000,
            )?),
            max_concurrent: parse_range(&lookup, "MIGRATION_MAX_CONCURRENT", 5, 1, 20)?,
            dry_run: parse_bool(&lookup, "MIGRATION_DRY_RUN", false)?,
            retry_failed: parse_bool(&lookup, "MIGRATION_RETRY_FAILED", true)?,
        };

        let probe = ProbeConfig {
            timeout_ms: parse_range(&lookup, "HEALTH_CHECK_TIMEOUT_MS", 10_000, 1_000, 60_000)?,
            retry_attempts: parse_range::<u64>(&lookup, "HEALTH_CHECK_RETRY_ATTEMPTS", 5, 1, 20)?
                as u32,
            retry_delay_ms: parse_range(&lookup, "HEALTH_CHECK_RETRY_DELAY_MS", 2_000, 100, 60_000)?,
            max_wait_ms: parse_range(
                &lookup,
                "HEALTH_CHECK_MAX_WAIT_MS",
                300_000,
                10_000,
                1_800_000,
            )?,
            error_indicator: lookup("HEALTH_CHECK_ERROR_INDICATOR"),
        };

        Ok(Self {
            upstream_api_key,
            upstream_base_url,
            port: parse_range::<u64>(&lookup, "PORT", 3000, 1, 65_535)? as u16,
            log_level,
            default_region,
            regions,
            instance_poll_interval: Duration::from_secs(parse_range(
                &lookup,
                "INSTANCE_POLL_INTERVAL",
                30,
                10,
                300,
            )?),
            max_retry_attempts: parse_range::<u64>(&lookup, "MAX_RETRY_ATTEMPTS", 3, 1, 10)? as u32,
            request_timeout: Duration::from_millis(parse_range(
                &lookup,
                "REQUEST_TIMEOUT",
                30_000,
                5_000,
                120_000,
            )?),
            webhook_timeout: Duration::from_millis(parse_range(
                &lookup,
                "WEBHOOK_TIMEOUT",
                10_000,
                1_000,
                30_000,
            )?),
            webhook_secret: lookup("WEBHOOK_SECRET"),
            cache_ttl: Duration::from_secs(parse_range(&lookup, "CACHE_TIMEOUT", 300, 60, 3_600)?),
            merged_cache_ttl: Duration::from_secs(parse_range(
                &lookup,
                "MERGED_CACHE_TIMEOUT",
                60,
                10,
                600,
            )?),
            max_concurrent_jobs: parse_range::<u64>(&lookup, "MAX_CONCURRENT_JOBS", 10, 1, 100)?
                as usize,
            monitor_max_wait: Duration::from_millis(parse_range(
                &lookup,
                "MONITOR_MAX_WAIT_MS",
                600_000,
                30_000,
                3_600_000,
            )?),
            probe,
            migration,
            redis_url: required(&lookup, "REDIS_URL")?,
            redis_token: lookup("REDIS_TOKEN"),
            redis_namespace: lookup("REDIS_NAMESPACE").unwrap_or_else(|| "gpufleet".into()),
        })
    }

    /// Connection URL with the auth token folded in when it is provided
    /// separately (managed-Redis style).
    pub fn redis_connection_url(&self) -> Result<String> {
        let Some(token) = &self.redis_token else {
            return Ok(self.redis_url.clone());
        };
        let mut parsed = url::Url::parse(&self.redis_url)
            .map_err(|e| invalid("REDIS_URL", &e.to_string()))?;
        if parsed.password().is_none() {
            parsed
                .set_password(Some(token))
                .map_err(|_| invalid("REDIS_URL", "cannot carry REDIS_TOKEN"))?;
        }
        Ok(parsed.to_string())
    }
}

fn invalid(key: &str, reason: &str) -> FleetError {
    FleetError::Configuration(format!("{key}: {reason}"))
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid(key, "is required"))
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(key, "must be a boolean")),
        },
    }
}

fn parse_range<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: T = raw
        .parse()
        .map_err(|_| invalid(key, "must be a number"))?;
    if value < min || value > max {
        return Err(invalid(key, &format!("must be in {min}..={max}")));
    }
    Ok(value)
}

/// `REGIONS` is a comma list of `id=name=priority` triples; when unset, the
/// default region is the only candidate.
fn parse_regions(
    lookup: &impl Fn(&str) -> Option<String>,
    default_region: &str,
) -> Result<Vec<RegionConfig>> {
    let Some(raw) = lookup("REGIONS") else {
        return Ok(vec![RegionConfig {
            id: default_region.to_string(),
            name: default_region.to_string(),
            priority: 1,
        }]);
    };
    let mut regions = Vec::new();
    for (index, entry) in raw.split(',').enumerate() {
        let parts: Vec<&str> = entry.trim().split('=').collect();
        match parts.as_slice() {
            [id, name, priority] => {
                let priority: i32 = priority
                    .parse()
                    .map_err(|_| invalid("REGIONS", "priority must be an integer"))?;
                regions.push(RegionConfig {
                    id: id.to_string(),
                    name: name.to_string(),
                    priority,
                });
            }
            [id] if !id.is_empty() => regions.push(RegionConfig {
                id: id.to_string(),
                name: id.to_string(),
                priority: index as i32 + 1,
            }),
            _ => return Err(invalid("REGIONS", "entries must be id=name=priority")),
        }
    }
    if regions.is_empty() {
        return Err(invalid("REGIONS", "must name at least one region"));
    }
    Ok(regions)
}
