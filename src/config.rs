//! Defines the configuration settings for the storefront-sleuth application.

use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration flags shared by every subcommand.
#[derive(Args, Debug, Default, Clone)]
pub(crate) struct ConfigArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CONFIG")]
    pub config_file: Option<String>,

    /// Maximum number of storefronts harvested concurrently
    #[arg(short, long, global = true, env = "STOREFRONT_SLEUTH_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// HTTP request timeout in seconds
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Delay between page requests of one storefront (seconds)
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_REQUEST_DELAY")]
    pub request_delay: Option<f32>,

    /// Maximum number of pages visited per storefront
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_MAX_PAGES")]
    pub max_pages: Option<usize>,

    /// Maximum number of sitemap-derived pages per storefront
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_SITEMAP_LIMIT")]
    pub sitemap_limit: Option<usize>,

    /// Retries for transiently failing page fetches
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// User agent string for HTTP requests
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Enable the relevance classifier
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CLASSIFIER_ENABLED")]
    pub classifier_enabled: Option<bool>,

    /// Relevance classifier endpoint URL
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CLASSIFIER_ENDPOINT")]
    pub classifier_endpoint: Option<String>,

    /// Bearer token for the relevance classifier
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CLASSIFIER_API_KEY", hide_env_values = true)]
    pub classifier_api_key: Option<String>,

    /// Minimum classifier confidence (0.0-1.0) for an address to count as relevant
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CLASSIFIER_MIN_CONFIDENCE")]
    pub classifier_min_confidence: Option<f32>,

    /// Upper bound on one classifier call in seconds (unbounded when unset)
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_CLASSIFIER_TIMEOUT")]
    pub classifier_timeout: Option<u64>,

    /// Path to the JSON storefront store
    #[arg(long, global = true, env = "STOREFRONT_SLEUTH_STORE")]
    pub store_path: Option<PathBuf>,
}

/// TOML Configuration file structure
#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    network: Option<NetworkConfig>,
    harvest: Option<HarvestConfig>,
    scheduler: Option<SchedulerConfig>,
    classifier: Option<ClassifierFileConfig>,
    storage: Option<StorageConfig>,
    api: Option<ApiConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct NetworkConfig {
    request_timeout: Option<u64>,
    request_delay: Option<f32>,
    max_retries: Option<u32>,
    retry_backoff: Option<f32>,
    user_agent: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct HarvestConfig {
    max_pages: Option<usize>,
    sitemap_limit: Option<usize>,
    blocked_extensions: Option<Vec<String>>,
    placeholder_patterns: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
struct SchedulerConfig {
    max_concurrency: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
struct ClassifierFileConfig {
    enabled: Option<bool>,
    endpoint: Option<String>,
    api_key: Option<String>,
    min_confidence: Option<f32>,
    timeout: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
struct StorageConfig {
    path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct ApiConfig {
    resolution_ttl: Option<u64>,
}

/// Addresses matching any of these are discarded after a harvest.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EmailDenylist {
    /// File extensions (lowercase, with the dot) that betray an asset name, e.g. `logo@2x.png`.
    pub blocked_extensions: Vec<String>,
    /// Lowercase placeholder patterns: `name@` matches a local part, a domain matches
    /// that domain and its subdomains.
    pub placeholder_patterns: Vec<String>,
}

impl Default for EmailDenylist {
    fn default() -> Self {
        Self {
            blocked_extensions: [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".css", ".js"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            placeholder_patterns: [
                "example.com",
                "example.org",
                "example.net",
                "test@",
                "noreply@",
                "no-reply@",
                "donotreply@",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Settings for the optional relevance classifier.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClassifierConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Addresses scored below this are not relevant.
    pub min_confidence: f32,
    /// `None` trusts the classifier's own timeout.
    pub timeout: Option<Duration>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            min_confidence: 0.7,
            timeout: None,
        }
    }
}

/// Application configuration settings.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Maximum number of storefront harvests running at once.
    pub max_concurrency: usize,
    /// Timeout for individual HTTP requests.
    pub request_timeout: Duration,
    /// Fixed politeness delay between two page requests of one storefront.
    pub request_delay: Duration,
    /// Cap on candidate pages per storefront.
    pub max_pages: usize,
    /// Cap on pages taken from a storefront's sitemap.
    pub sitemap_limit: usize,
    /// Extra attempts for a page fetch that failed transiently.
    pub max_retries: u32,
    /// Base of the exponential backoff between retries.
    pub retry_backoff: Duration,
    /// User agent string to use for HTTP requests.
    pub user_agent: String,
    pub denylist: EmailDenylist,
    pub classifier: ClassifierConfig,
    /// Location of the JSON storefront store.
    pub store_path: PathBuf,
    /// How long an unclaimed URL resolution is kept.
    pub resolution_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_concurrency: 10,
            request_timeout: Duration::from_secs(15),
            request_delay: Duration::from_secs(2),
            max_pages: 50,
            sitemap_limit: 20,
            max_retries: 0,
            retry_backoff: Duration::from_secs(1),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            denylist: EmailDenylist::default(),
            classifier: ClassifierConfig::default(),
            store_path: PathBuf::from("storefronts.json"),
            resolution_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Load configuration from a TOML file
fn load_config_file(file_path: &str) -> anyhow::Result<ConfigFile> {
    let path = Path::new(file_path);
    if !path.exists() {
        tracing::warn!("Configuration file {} not found, using defaults", file_path);
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", file_path))?;

    let config = parse_config_file(&content)
        .with_context(|| format!("Failed to parse TOML configuration from {}", file_path))?;

    tracing::info!("Loaded configuration from {}", file_path);
    Ok(config)
}

/// Converts fractional seconds, clamping negatives to zero. Values a `Duration`
/// cannot hold leave `current` in place.
fn seconds_or_keep(setting: &str, secs: f32, current: Duration) -> Duration {
    match Duration::try_from_secs_f32(secs.max(0.0)) {
        Ok(duration) => duration,
        Err(e) => {
            tracing::warn!("Ignoring {} = {}: {}. Keeping {:?}", setting, secs, e, current);
            current
        }
    }
}

fn parse_config_file(content: &str) -> Result<ConfigFile, toml::de::Error> {
    toml::from_str(content)
}

fn apply_file_config(config: &mut Config, file_config: &ConfigFile) {
    if let Some(network) = &file_config.network {
        if let Some(timeout) = network.request_timeout {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Some(delay) = network.request_delay {
            config.request_delay = seconds_or_keep("request_delay", delay, config.request_delay);
        }
        if let Some(retries) = network.max_retries {
            config.max_retries = retries;
        }
        if let Some(backoff) = network.retry_backoff {
            config.retry_backoff = seconds_or_keep("retry_backoff", backoff, config.retry_backoff);
        }
        if let Some(user_agent) = &network.user_agent {
            config.user_agent = user_agent.clone();
        }
    }

    if let Some(harvest) = &file_config.harvest {
        if let Some(max_pages) = harvest.max_pages {
            config.max_pages = max_pages;
        }
        if let Some(limit) = harvest.sitemap_limit {
            config.sitemap_limit = limit;
        }
        if let Some(extensions) = &harvest.blocked_extensions {
            config.denylist.blocked_extensions =
                extensions.iter().map(|s| s.to_lowercase()).collect();
        }
        if let Some(patterns) = &harvest.placeholder_patterns {
            config.denylist.placeholder_patterns =
                patterns.iter().map(|s| s.to_lowercase()).collect();
        }
    }

    if let Some(scheduler) = &file_config.scheduler {
        if let Some(concurrency) = scheduler.max_concurrency {
            config.max_concurrency = concurrency;
        }
    }

    if let Some(classifier) = &file_config.classifier {
        if let Some(enabled) = classifier.enabled {
            config.classifier.enabled = enabled;
        }
        if let Some(endpoint) = &classifier.endpoint {
            config.classifier.endpoint = Some(endpoint.clone());
        }
        if let Some(key) = &classifier.api_key {
            config.classifier.api_key = Some(key.clone());
        }
        if let Some(min) = classifier.min_confidence {
            config.classifier.min_confidence = min;
        }
        if let Some(timeout) = classifier.timeout {
            config.classifier.timeout = Some(Duration::from_secs(timeout));
        }
    }

    if let Some(storage) = &file_config.storage {
        if let Some(path) = &storage.path {
            config.store_path = path.clone();
        }
    }

    if let Some(api) = &file_config.api {
        if let Some(ttl) = api.resolution_ttl {
            config.resolution_ttl = Duration::from_secs(ttl);
        }
    }
}

/// Apply command line arguments to the Config instance
fn apply_cli_args(config: &mut Config, args: &ConfigArgs) {
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }

    if let Some(timeout) = args.request_timeout {
        config.request_timeout = Duration::from_secs(timeout);
    }

    if let Some(delay) = args.request_delay {
        config.request_delay = seconds_or_keep("request_delay", delay, config.request_delay);
    }

    if let Some(max_pages) = args.max_pages {
        config.max_pages = max_pages;
    }

    if let Some(limit) = args.sitemap_limit {
        config.sitemap_limit = limit;
    }

    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }

    if let Some(ref agent) = args.user_agent {
        config.user_agent = agent.clone();
    }

    if let Some(enabled) = args.classifier_enabled {
        config.classifier.enabled = enabled;
    }

    if let Some(ref endpoint) = args.classifier_endpoint {
        config.classifier.endpoint = Some(endpoint.clone());
    }

    if let Some(ref key) = args.classifier_api_key {
        config.classifier.api_key = Some(key.clone());
    }

    if let Some(min) = args.classifier_min_confidence {
        config.classifier.min_confidence = min;
    }

    if let Some(timeout) = args.classifier_timeout {
        config.classifier.timeout = Some(Duration::from_secs(timeout));
    }

    if let Some(ref path) = args.store_path {
        config.store_path = path.clone();
    }
}

fn validate_config(config: &mut Config) {
    if config.max_concurrency == 0 {
        config.max_concurrency = 1;
        tracing::warn!("Concurrency was set to 0. Setting to 1.");
    }

    if config.max_pages == 0 {
        config.max_pages = 1;
        tracing::warn!("Max pages was set to 0. Setting to 1.");
    }

    if !(0.0..=1.0).contains(&config.classifier.min_confidence) {
        let clamped = config.classifier.min_confidence.clamp(0.0, 1.0);
        tracing::warn!(
            "Classifier min confidence {} outside [0, 1]. Setting to {}",
            config.classifier.min_confidence,
            clamped
        );
        config.classifier.min_confidence = clamped;
    }

    let has_endpoint = config
        .classifier
        .endpoint
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty());
    if config.classifier.enabled && !has_endpoint {
        config.classifier.enabled = false;
        tracing::warn!("Classifier enabled without an endpoint. Disabling it.");
    }
}

/// Builds the effective configuration: defaults, then the TOML file, then flags.
pub(crate) fn build_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let mut config = Config::default();

    if let Some(ref file_path) = args.config_file {
        let file_config = load_config_file(file_path)?;
        apply_file_config(&mut config, &file_config);
    } else {
        for path in ["./storefront-sleuth.toml", "./config.toml"].iter() {
            if Path::new(path).exists() {
                match load_config_file(path) {
                    Ok(file_config) => {
                        apply_file_config(&mut config, &file_config);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load configuration from {}: {}", path, e);
                    }
                }
            }
        }
    }

    apply_cli_args(&mut config, args);

    validate_config(&mut config);

    tracing::debug!("Final configuration: {:?}", config);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.max_pages, 50);
        assert_eq!(config.sitemap_limit, 20);
        assert_eq!(config.max_retries, 0);
        assert!(!config.classifier.enabled);
        assert!(config.classifier.timeout.is_none());
    }

    #[test]
    fn test_file_config_overrides_defaults() {
        let file = parse_config_file(
            r#"
            [network]
            request_timeout = 5
            request_delay = 0.25

            [harvest]
            max_pages = 12
            placeholder_patterns = ["Sample.COM"]

            [scheduler]
            max_concurrency = 3

            [classifier]
            enabled = true
            endpoint = "http://localhost:9000/classify"
            timeout = 30
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        apply_file_config(&mut config, &file);

        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.request_delay, Duration::from_millis(250));
        assert_eq!(config.max_pages, 12);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.denylist.placeholder_patterns, vec!["sample.com"]);
        assert!(config.classifier.enabled);
        assert_eq!(config.classifier.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_cli_args_win_over_file() {
        let file = parse_config_file("[scheduler]\nmax_concurrency = 3\n").unwrap();
        let args = ConfigArgs {
            concurrency: Some(7),
            ..ConfigArgs::default()
        };

        let mut config = Config::default();
        apply_file_config(&mut config, &file);
        apply_cli_args(&mut config, &args);

        assert_eq!(config.max_concurrency, 7);
    }

    #[test]
    fn test_unrepresentable_delays_keep_previous_value() {
        let file = parse_config_file(
            "[network]\nrequest_delay = inf\nretry_backoff = -3.0\n",
        )
        .unwrap();
        let mut config = Config::default();
        apply_file_config(&mut config, &file);

        assert_eq!(config.request_delay, Config::default().request_delay);
        assert_eq!(config.retry_backoff, Duration::ZERO);

        let args = ConfigArgs {
            request_delay: Some(f32::MAX),
            ..ConfigArgs::default()
        };
        config.request_delay = Duration::from_millis(500);
        apply_cli_args(&mut config, &args);
        assert_eq!(config.request_delay, Duration::from_millis(500));

        let args = ConfigArgs {
            request_delay: Some(f32::NAN),
            ..ConfigArgs::default()
        };
        apply_cli_args(&mut config, &args);
        assert_eq!(config.request_delay, Duration::ZERO);
    }

    #[test]
    fn test_validation_clamps_bad_values() {
        let mut config = Config {
            max_concurrency: 0,
            max_pages: 0,
            ..Config::default()
        };
        config.classifier.enabled = true;
        config.classifier.min_confidence = 1.5;

        validate_config(&mut config);

        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_pages, 1);
        assert_eq!(config.classifier.min_confidence, 1.0);
        assert!(!config.classifier.enabled, "no endpoint configured");
    }
}
