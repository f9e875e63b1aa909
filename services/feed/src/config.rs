//! Feed configuration, read from TOML.
//!
//! ```toml
//! base-url = "https://feed.example.com"
//! bucket = "packages"
//! deletion = "hard-delete"
//!
//! [storage.local]
//! path = "/var/lib/feed"
//!
//! [mirror]
//! enabled = true
//! service-index = "https://api.nuget.org/v3/index.json"
//! policy = "all-versions"
//! ```

use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;
use url::Url;

use crate::catalog_pages;
use crate::mirror::{Backoff, MirrorPolicy, RetryPolicy};
use crate::registration;
use crate::search;

/// What `DELETE /api/v2/package/{id}/{version}` does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionBehavior {
    /// Hide the version; content stays downloadable.
    #[default]
    Unlist,
    /// Remove the version and its content.
    HardDelete,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file is not valid TOML or does not match the schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Mirroring is enabled without an upstream.
    #[error("mirror is enabled but no service-index is configured")]
    MissingServiceIndex,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_owned()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory {
        bucket: default_bucket(),
    }
}

fn default_bucket() -> String {
    "packages".to_owned()
}

fn default_registration_page_size() -> usize {
    registration::DEFAULT_PAGE_SIZE
}

fn default_catalog_page_size() -> usize {
    catalog_pages::DEFAULT_PAGE_SIZE
}

fn default_max_search_take() -> usize {
    search::DEFAULT_MAX_TAKE
}

/// Top-level feed configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeedConfig {
    /// Public URL every document links against.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Where package artifacts are kept.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// The storage bucket for package artifacts.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Versions per registration page.
    #[serde(default = "default_registration_page_size")]
    pub registration_page_size: usize,

    /// Commits per catalog page.
    #[serde(default = "default_catalog_page_size")]
    pub catalog_page_size: usize,

    /// Largest page of search or autocomplete results.
    #[serde(default = "default_max_search_take")]
    pub max_search_take: usize,

    /// What a delete request does.
    #[serde(default)]
    pub deletion: DeletionBehavior,

    /// Upstream mirroring.
    #[serde(default)]
    pub mirror: MirrorConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            storage: default_storage(),
            bucket: default_bucket(),
            registration_page_size: default_registration_page_size(),
            catalog_page_size: default_catalog_page_size(),
            max_search_take: default_max_search_take(),
            deletion: DeletionBehavior::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Parse a TOML document.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        let config: FeedConfig = toml::from_str(document)?;
        if config.mirror.enabled && config.mirror.service_index.is_none() {
            return Err(ConfigError::MissingServiceIndex);
        }
        Ok(config)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> usize {
    3
}

/// Upstream mirror settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    /// Whether misses are fetched from upstream.
    #[serde(default)]
    pub enabled: bool,

    /// The upstream service index.
    #[serde(default)]
    pub service_index: Option<Url>,

    /// Which versions to fetch on first contact.
    #[serde(default)]
    pub policy: MirrorPolicy,

    /// Limit on each upstream call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upstream attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: usize,

    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_index: None,
            policy: MirrorPolicy::default(),
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// The retry policy for upstream calls.
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: self.backoff.backoff(),
        }
    }
}

/// Backoff between upstream attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffConfig {
    /// First delay, in milliseconds.
    pub delay_ms: u64,
    /// Growth factor.
    pub exponent: u32,
    /// Longest delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            delay_ms: backoff.delay.as_millis() as u64,
            exponent: backoff.exponent,
            max_delay_ms: backoff.max_delay.as_millis() as u64,
        }
    }
}

impl BackoffConfig {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.delay_ms),
            self.exponent,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = FeedConfig::from_toml("").unwrap();
        assert_eq!(config.bucket, "packages");
        assert_eq!(config.registration_page_size, 64);
        assert_eq!(config.catalog_page_size, 550);
        assert_eq!(config.max_search_take, 1000);
        assert_eq!(config.deletion, DeletionBehavior::Unlist);
        assert!(matches!(config.storage, StorageConfig::Memory { .. }));
        assert!(!config.mirror.enabled);
    }

    #[test]
    fn full_document() {
        let config = FeedConfig::from_toml(
            r#"
            base-url = "https://feed.example.com"
            registration-page-size = 10
            deletion = "hard-delete"

            [storage.local]
            path = "/var/lib/feed"

            [mirror]
            enabled = true
            service-index = "https://api.nuget.org/v3/index.json"
            policy = "all-versions"
            timeout-secs = 5
            attempts = 4

            [mirror.backoff]
            delay-ms = 50
            exponent = 3
            max-delay-ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://feed.example.com");
        assert_eq!(config.registration_page_size, 10);
        assert_eq!(config.deletion, DeletionBehavior::HardDelete);
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
        assert_eq!(config.mirror.policy, MirrorPolicy::AllVersions);

        let retry = config.mirror.retry();
        assert_eq!(retry.attempts, 4);
        assert_eq!(retry.timeout, Duration::from_secs(5));
        assert_eq!(retry.backoff.delay, Duration::from_millis(50));
        assert_eq!(retry.backoff.exponent, 3);
    }

    #[test]
    fn mirror_needs_an_upstream() {
        let err = FeedConfig::from_toml("[mirror]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingServiceIndex));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = FeedConfig::from_toml("[mirror]\npolicy = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
