//! Environment-driven runtime configuration and the taxonomy file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use hrs_storage::{BackoffPolicy, ProbeConfig, RateLimitConfig};
use tracing::{debug, warn};

use crate::quota::Taxonomy;
use crate::waterfall::WaterfallPolicy;

pub const TAXONOMY_FILE: &str = "taxonomy.yaml";

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub site: String,
    pub probe_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub attempt_timeout: Duration,
    pub max_pages_per_task: u32,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffPolicy,
    pub waterfall: WaterfallPolicy,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed setting; using default");
            default
        }
    }
}

fn flag_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl SamplerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SamplerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("HRS_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let under_root = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join(default))
        };
        let data_dir = under_root("HRS_DATA_DIR", "data");
        let reports_dir = under_root("HRS_REPORTS_DIR", "reports");
        let fixtures_dir = under_root("HRS_FIXTURES_DIR", "fixtures");

        let rate_defaults = RateLimitConfig::default();
        let backoff_defaults = BackoffPolicy::default();
        let waterfall_defaults = WaterfallPolicy::default();

        Self {
            data_dir,
            reports_dir,
            fixtures_dir,
            site: lookup("HRS_SITE").unwrap_or_else(|| "fliggy".to_string()),
            probe_url: lookup("HRS_PROBE_URL").unwrap_or_else(|| "https://hotel.fliggy.com/".to_string()),
            user_agent: lookup("HRS_USER_AGENT").unwrap_or_else(|| "hrs-sampler/0.1".to_string()),
            http_timeout_secs: parse_or(&lookup, "HRS_HTTP_TIMEOUT_SECS", 20),
            workers: parse_or(&lookup, "HRS_WORKERS", 3usize).max(1),
            attempt_timeout: Duration::from_secs(parse_or(&lookup, "HRS_ATTEMPT_TIMEOUT_SECS", 30)),
            max_pages_per_task: parse_or(&lookup, "HRS_MAX_PAGES_PER_TASK", 30u32).max(1),
            rate_limit: RateLimitConfig {
                requests_per_window: parse_or(&lookup, "HRS_REQUESTS_PER_WINDOW", rate_defaults.requests_per_window),
                window: Duration::from_secs(parse_or(&lookup, "HRS_WINDOW_SECS", rate_defaults.window.as_secs())),
                max_cooldown_multiplier: parse_or(
                    &lookup,
                    "HRS_MAX_COOLDOWN_MULTIPLIER",
                    rate_defaults.max_cooldown_multiplier,
                ),
                pause_on_challenge: flag_or(&lookup, "HRS_PAUSE_ON_CHALLENGE", rate_defaults.pause_on_challenge),
                ..rate_defaults
            },
            backoff: BackoffPolicy {
                max_retries: parse_or(&lookup, "HRS_MAX_RETRIES", backoff_defaults.max_retries),
                base_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "HRS_RETRY_BASE_MS",
                    backoff_defaults.base_delay.as_millis() as u64,
                )),
                multiplier: parse_or(&lookup, "HRS_RETRY_MULTIPLIER", backoff_defaults.multiplier),
                max_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "HRS_RETRY_MAX_MS",
                    backoff_defaults.max_delay.as_millis() as u64,
                )),
            },
            waterfall: WaterfallPolicy {
                max_per_hotel: parse_or(&lookup, "HRS_MAX_REVIEWS_PER_HOTEL", waterfall_defaults.max_per_hotel),
                negative_cap: parse_or(&lookup, "HRS_NEGATIVE_CAP", waterfall_defaults.negative_cap),
                evidence_cap: parse_or(&lookup, "HRS_EVIDENCE_CAP", waterfall_defaults.evidence_cap),
                min_reviews: parse_or(&lookup, "HRS_MIN_REVIEWS", waterfall_defaults.min_reviews),
            },
            workspace_root,
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn taxonomy_path(&self) -> PathBuf {
        self.workspace_root.join(TAXONOMY_FILE)
    }

    /// Reads `taxonomy.yaml` from the workspace, falling back to the built-in taxonomy.
    pub async fn load_taxonomy(&self) -> Result<Taxonomy> {
        load_taxonomy_file(&self.taxonomy_path()).await
    }
}

pub async fn load_taxonomy_file(path: &Path) -> Result<Taxonomy> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no taxonomy file; using built-in taxonomy");
            Ok(Taxonomy::builtin())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_policy_constants() {
        let config = SamplerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.site, "fliggy");
        assert_eq!(config.waterfall, WaterfallPolicy::default());
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.max_pages_per_task, 30);
        assert!(config.rate_limit.pause_on_challenge);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = SamplerConfig::from_lookup(lookup(&[
            ("HRS_WORKSPACE", "/srv/hrs"),
            ("HRS_WORKERS", "0"),
            ("HRS_MIN_REVIEWS", "200"),
            ("HRS_MAX_RETRIES", "not-a-number"),
            ("HRS_PAUSE_ON_CHALLENGE", "false"),
            ("HRS_RETRY_BASE_MS", "250"),
        ]));
        assert_eq!(config.reports_dir, PathBuf::from("/srv/hrs/reports"));
        assert_eq!(config.workers, 1);
        assert_eq!(config.waterfall.min_reviews, 200);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.backoff.base_delay, Duration::from_millis(250));
        assert!(!config.rate_limit.pause_on_challenge);
    }

    #[test]
    fn malformed_numbers_keep_the_default() {
        let vars = lookup(&[("HRS_MAX_REVIEWS_PER_HOTEL", "abc"), ("HRS_EVIDENCE_CAP", " 120 ")]);
        assert_eq!(parse_or(&vars, "HRS_MAX_REVIEWS_PER_HOTEL", 300u32), 300);
        assert_eq!(parse_or(&vars, "HRS_EVIDENCE_CAP", 150u32), 120);
        assert_eq!(parse_or(&vars, "HRS_UNSET", 7u32), 7);

        let config = SamplerConfig::from_lookup(vars);
        assert_eq!(config.waterfall.max_per_hotel, 300);
        assert_eq!(config.waterfall.evidence_cap, 120);
    }

    #[tokio::test]
    async fn missing_taxonomy_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let taxonomy = load_taxonomy_file(&dir.path().join(TAXONOMY_FILE)).await.unwrap();
        assert_eq!(taxonomy, Taxonomy::builtin());
    }

    #[tokio::test]
    async fn workspace_taxonomy_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(TAXONOMY_FILE);
        let taxonomy = load_taxonomy_file(&path).await.unwrap();
        assert_eq!(taxonomy, Taxonomy::builtin());
    }

    #[tokio::test]
    async fn malformed_taxonomy_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TAXONOMY_FILE);
        tokio::fs::write(&path, "regions: [").await.unwrap();
        assert!(load_taxonomy_file(&path).await.is_err());
    }
}
