//! Remote and fetch configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When artifact bytes are downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    /// Fetch every artifact during sync (default).
    #[default]
    Immediate,
    /// Record where artifacts live; fetch and keep them on first access.
    OnDemand,
    /// Record where artifacts live; stream them on access without keeping them.
    Streamed,
}

impl DownloadPolicy {
    /// Anything but [`DownloadPolicy::Immediate`] defers downloads.
    pub fn is_deferred(self) -> bool {
        self != Self::Immediate
    }
}

/// A remote chart repository to sync from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Display name.
    pub name: String,
    /// Base URL of the repository, or the URL of its `index.yaml`.
    pub url: String,
    /// Download policy for artifacts declared by a sync.
    #[serde(default)]
    pub policy: DownloadPolicy,
}

impl Remote {
    /// Create a remote with the default (immediate) policy.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            policy: DownloadPolicy::default(),
        }
    }

    /// Set the download policy.
    pub fn with_policy(mut self, policy: DownloadPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// HTTP fetch tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Whole-request timeout. A timed out request surfaces as a fetch error.
    pub timeout: Duration,
    /// Upper bound on concurrent artifact downloads.
    pub download_concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: crate::USER_AGENT.to_string(),
            timeout: Duration::from_secs(300),
            download_concurrency: 16,
        }
    }
}

impl FetchConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// - `CHART_USER_AGENT`
    /// - `CHART_FETCH_TIMEOUT_SECS`
    /// - `CHART_DOWNLOAD_CONCURRENCY`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let user_agent = lookup("CHART_USER_AGENT")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.user_agent);
        let timeout = lookup("CHART_FETCH_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map_or(defaults.timeout, Duration::from_secs);
        let download_concurrency = lookup("CHART_DOWNLOAD_CONCURRENCY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.download_concurrency);

        Self {
            user_agent,
            timeout,
            download_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn policy_deferral() {
        assert!(!DownloadPolicy::Immediate.is_deferred());
        assert!(DownloadPolicy::OnDemand.is_deferred());
        assert!(DownloadPolicy::Streamed.is_deferred());
    }

    #[test]
    fn remote_policy_deserializes_with_default() {
        let remote: Remote =
            serde_yaml_ng::from_str("name: stable\nurl: https://charts.example.com\n").unwrap();
        assert_eq!(remote.policy, DownloadPolicy::Immediate);

        let remote: Remote = serde_yaml_ng::from_str(
            "name: stable\nurl: https://charts.example.com\npolicy: on_demand\n",
        )
        .unwrap();
        assert_eq!(remote.policy, DownloadPolicy::OnDemand);
    }

    #[test]
    fn env_overrides_and_fallbacks() {
        let vars: HashMap<&str, &str> = [
            ("CHART_FETCH_TIMEOUT_SECS", "30"),
            ("CHART_DOWNLOAD_CONCURRENCY", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = FetchConfig::from_lookup(|k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.download_concurrency, 16);
        assert_eq!(config.user_agent, crate::USER_AGENT);
    }
}
