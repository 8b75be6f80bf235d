//! Process-environment configuration (§4's "Configuration" ambient concern).
//!
//! No layered YAML, no secrets-consumption bookkeeping — this engine's
//! entire surface is three connection strings plus a handful of tuning
//! knobs, each of which already has a spec-mandated default. Reading those
//! three required variables once at boot and failing fast if any are
//! missing is the whole job.

use anyhow::{Context, Result};

/// §4.A `ALYA_DATABASE_URL`, reusing `alya_db::ENV_DB_URL`'s naming
/// convention so operators only learn one prefix.
pub const ENV_DATABASE_URL: &str = alya_db::ENV_DB_URL;
pub const ENV_REDIS_URL: &str = alya_cache::ENV_REDIS_URL;
pub const ENV_OBJECT_STORE_BUCKET: &str = alya_objectstore::ENV_BUCKET;

/// Worker/engine tuning knobs. Every field has a spec-literal default
/// (§3/§4/§7); the `_secs` env vars below exist purely for operators who
/// need to deviate in a particular deployment, not because the defaults are
/// in doubt.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub heartbeat_ttl_secs: u64,
    pub heartbeat_refresh_secs: u64,
    pub summary_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: alya_cache::HEARTBEAT_TTL_SECS,
            heartbeat_refresh_secs: alya_cache::HEARTBEAT_REFRESH_SECS,
            summary_ttl_secs: alya_cache::SUMMARY_TTL_SECS,
            sweep_interval_secs: 60,
        }
    }
}

impl Tuning {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_ttl_secs: env_u64("ALYA_HEARTBEAT_TTL_SECS", defaults.heartbeat_ttl_secs),
            heartbeat_refresh_secs: env_u64(
                "ALYA_HEARTBEAT_REFRESH_SECS",
                defaults.heartbeat_refresh_secs,
            ),
            summary_ttl_secs: env_u64("ALYA_SUMMARY_TTL_SECS", defaults.summary_ttl_secs),
            sweep_interval_secs: env_u64("ALYA_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Everything `alya-worker`/`alya-cli` need to boot, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub redis_url: String,
    pub object_store_bucket: String,
    pub tuning: Tuning,
}

impl EngineConfig {
    /// Loads `.env.local` first (dev convenience, silent if absent — see
    /// `alya-worker`'s boot sequence), then reads the three required
    /// connection strings and any tuning overrides from the environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");

        Ok(Self {
            database_url: std::env::var(ENV_DATABASE_URL)
                .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?,
            redis_url: std::env::var(ENV_REDIS_URL)
                .with_context(|| format!("missing env var {ENV_REDIS_URL}"))?,
            object_store_bucket: std::env::var(ENV_OBJECT_STORE_BUCKET)
                .unwrap_or_else(|_| alya_objectstore::DEFAULT_BUCKET.to_string()),
            tuning: Tuning::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_the_spec_literals() {
        let t = Tuning::default();
        assert_eq!(t.heartbeat_ttl_secs, 60);
        assert_eq!(t.heartbeat_refresh_secs, 30);
        assert_eq!(t.summary_ttl_secs, 100);
    }
}
