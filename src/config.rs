// ABOUTME: Configuration loaded from a TOML file with environment overrides
// ABOUTME: Holds endpoint locations, batch sizes, retry budgets and reindex thresholds

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backfill::BackfillKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub backfill: BackfillConfig,
    pub reindex: ReindexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Project URL, e.g. `https://abcd.supabase.co`
    pub supabase_url: String,
    pub anon_key: String,
    /// Seed refresh token when no session file exists yet
    pub refresh_token: Option<String>,
    /// Where the rotated session is persisted between runs
    pub session_file: Option<PathBuf>,
    /// Timeout for table reads and job control requests
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            anon_key: String::new(),
            refresh_token: None,
            session_file: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Consecutive non-network failures before a loop gives up
    pub max_retries: u32,
    /// Consecutive auth refreshes before the session is treated as gone
    pub max_auth_refreshes: u32,
    /// Successful batches between proactive token refreshes
    pub token_refresh_interval: u32,
    pub politeness_delay_ms: u64,
    /// Per-call retries inside the batch invoker
    pub connection_retries: u32,
    pub embeddings: KindConfig,
    pub entities: KindConfig,
    pub deal_heat: KindConfig,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_auth_refreshes: 5,
            token_refresh_interval: 10,
            politeness_delay_ms: 500,
            connection_retries: 2,
            embeddings: KindConfig::new("chunk-transcripts", 10, 60),
            entities: KindConfig::new("chunk-transcripts", 10, 60),
            deal_heat: KindConfig::new("calculate-deal-heat", 3, 120),
        }
    }
}

impl BackfillConfig {
    pub fn kind(&self, kind: BackfillKind) -> &KindConfig {
        match kind {
            BackfillKind::Embeddings => &self.embeddings,
            BackfillKind::Entities => &self.entities,
            BackfillKind::DealHeat => &self.deal_heat,
        }
    }

    /// TOML table holding the settings for `kind`.
    pub fn section(kind: BackfillKind) -> &'static str {
        match kind {
            BackfillKind::Embeddings => "backfill.embeddings",
            BackfillKind::Entities => "backfill.entities",
            BackfillKind::DealHeat => "backfill.deal_heat",
        }
    }

    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms)
    }
}

/// Per job type settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindConfig {
    /// Edge function that processes one batch
    pub function: String,
    pub batch_size: u32,
    pub timeout_secs: u64,
}

impl KindConfig {
    pub fn new(function: &str, batch_size: u32, timeout_secs: u64) -> Self {
        Self {
            function: function.to_string(),
            batch_size,
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReindexConfig {
    pub job_type: String,
    /// Edge function that enqueues the reindex job
    pub function: String,
    pub poll_interval_secs: u64,
    pub stall_threshold_secs: u64,
    pub auto_cancel_secs: u64,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            job_type: "full_reindex".to_string(),
            function: "chunk-transcripts".to_string(),
            poll_interval_secs: 3,
            stall_threshold_secs: 60,
            auto_cancel_secs: 120,
        }
    }
}

impl ReindexConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn auto_cancel_after(&self) -> Duration {
        Duration::from_secs(self.auto_cancel_secs)
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist, then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override values from the environment.
    ///
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    /// - `SUPABASE_REFRESH_TOKEN`
    /// - `BACKFILL_MAX_RETRIES`
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.remote.supabase_url = url;
        }
        if let Ok(key) = std::env::var("SUPABASE_ANON_KEY") {
            self.remote.anon_key = key;
        }
        if let Ok(token) = std::env::var("SUPABASE_REFRESH_TOKEN") {
            self.remote.refresh_token = Some(token);
        }
        if let Some(retries) = std::env::var("BACKFILL_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.backfill.max_retries = retries;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.remote.supabase_url.trim();
        if url.is_empty() {
            bail!("remote.supabase_url is not set. Set it in the config file or via SUPABASE_URL");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("remote.supabase_url must start with http:// or https://, got '{}'", url);
        }
        if self.backfill.max_retries == 0 {
            bail!("backfill.max_retries must be at least 1");
        }
        if self.backfill.token_refresh_interval == 0 {
            bail!("backfill.token_refresh_interval must be at least 1");
        }
        for kind in BackfillKind::ALL {
            let settings = self.backfill.kind(kind);
            if settings.batch_size == 0 {
                bail!("{}.batch_size must be at least 1", BackfillConfig::section(kind));
            }
            if settings.function.trim().is_empty() {
                bail!("{}.function must not be empty", BackfillConfig::section(kind));
            }
        }
        if self.reindex.auto_cancel_secs <= self.reindex.stall_threshold_secs {
            bail!(
                "reindex.auto_cancel_secs ({}) must exceed reindex.stall_threshold_secs ({})",
                self.reindex.auto_cancel_secs,
                self.reindex.stall_threshold_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.remote.supabase_url = "https://example.supabase.co".to_string();
        config
    }

    #[test]
    fn test_defaults_match_batch_policy() {
        let config = Config::default();
        assert_eq!(config.backfill.embeddings.batch_size, 10);
        assert_eq!(config.backfill.entities.batch_size, 10);
        assert_eq!(config.backfill.deal_heat.batch_size, 3);
        assert_eq!(config.backfill.embeddings.timeout(), Duration::from_secs(60));
        assert_eq!(config.backfill.deal_heat.timeout(), Duration::from_secs(120));
        assert_eq!(config.backfill.token_refresh_interval, 10);
        assert_eq!(config.reindex.poll_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[remote]
supabase_url = "https://example.supabase.co"

[backfill]
max_retries = 5

[backfill.deal_heat]
function = "deal-heat-v2"
batch_size = 2
timeout_secs = 90
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backfill.max_retries, 5);
        assert_eq!(config.backfill.politeness_delay_ms, 500);
        assert_eq!(config.backfill.deal_heat.function, "deal-heat-v2");
        assert_eq!(config.backfill.embeddings.function, "chunk-transcripts");
        assert_eq!(config.reindex.stall_threshold_secs, 60);
    }

    #[test]
    fn test_validate_rejects_missing_url() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("supabase_url"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = valid();
        config.reindex.auto_cancel_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = valid();
        config.backfill.entities.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "backfill.entities.batch_size must be at least 1");

        let mut config = valid();
        config.backfill.deal_heat.function = " ".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "backfill.deal_heat.function must not be empty");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }
}
