// Environment-driven settings shared by the API and worker binaries

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub bind_addr: String,
    /// Size of the execution worker pool. Zero disables workers in the API.
    pub worker_count: usize,
    /// Hard limit on one execution. Zero disables it.
    pub max_active: Duration,
    pub claim_timeout: Duration,
    pub work_dir: PathBuf,
    pub languages_config: PathBuf,
    pub outbound_buffer: usize,
    pub instance_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            worker_count: 1,
            max_active: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(5),
            work_dir: PathBuf::from("./codes"),
            languages_config: PathBuf::from("config/languages.json"),
            outbound_buffer: 256,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_active_secs = parse_or(&lookup, "MAX_ACTIVE_SECS", defaults.max_active.as_secs())?;
        let claim_timeout_secs =
            parse_or(&lookup, "CLAIM_TIMEOUT_SECS", defaults.claim_timeout.as_secs())?;

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            worker_count: parse_or(&lookup, "WORKER_COUNT", defaults.worker_count)?,
            max_active: Duration::from_secs(max_active_secs),
            claim_timeout: Duration::from_secs(claim_timeout_secs.max(1)),
            work_dir: lookup("WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            languages_config: lookup("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_config),
            outbound_buffer: parse_or(&lookup, "OUTBOUND_BUFFER", defaults.outbound_buffer)?
                .max(1),
            instance_id: lookup("INSTANCE_ID").unwrap_or(defaults.instance_id),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
