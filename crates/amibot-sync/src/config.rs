use std::path::PathBuf;
use std::time::Duration;

use amibot_adapters::DEFAULT_RELEASES_URL;
use amibot_storage::HttpClientConfig;

use crate::github::GitIdentity;

/// Runtime settings, read once from the environment and passed around explicitly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub releases_url: String,
    pub database_path: PathBuf,
    pub targets_file: PathBuf,
    pub slack_webhook_url: Option<String>,
    pub github_token: Option<String>,
    pub git_identity: Option<GitIdentity>,
    pub github_api_url: String,
    pub base_branch: String,
    pub vars_file: String,
    pub send_notifications: bool,
    pub open_pull_requests: bool,
    pub persist_unmatched: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub poll_cron: String,
    pub reports_dir: Option<PathBuf>,
    /// Read the releases table from this file instead of `releases_url`.
    pub fixture_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str, default: bool| {
            var(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on"))
                .unwrap_or(default)
        };

        let git_identity = match (var("AMIBOT_GITHUB_USERNAME"), var("AMIBOT_GITHUB_EMAIL")) {
            (Some(name), Some(email)) => Some(GitIdentity { name, email }),
            _ => None,
        };

        Self {
            releases_url: var("AMIBOT_RELEASES_URL")
                .unwrap_or_else(|| DEFAULT_RELEASES_URL.to_string()),
            database_path: var("AMIBOT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data.sqlite")),
            targets_file: var("AMIBOT_TARGETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("targets.yaml")),
            slack_webhook_url: var("AMIBOT_SLACK_WEBHOOK_URL"),
            github_token: var("AMIBOT_GITHUB_TOKEN"),
            git_identity,
            github_api_url: var("AMIBOT_GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            base_branch: var("AMIBOT_BASE_BRANCH").unwrap_or_else(|| "master".to_string()),
            vars_file: var("AMIBOT_VARS_FILE").unwrap_or_else(|| "packer-vars.json".to_string()),
            send_notifications: flag("AMIBOT_SEND_NOTIFICATIONS", true),
            open_pull_requests: flag("AMIBOT_OPEN_PULL_REQUESTS", true),
            persist_unmatched: flag("AMIBOT_PERSIST_UNMATCHED", false),
            user_agent: var("AMIBOT_USER_AGENT").unwrap_or_else(|| "amibot/0.1".to_string()),
            http_timeout_secs: var("AMIBOT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            poll_cron: var("AMIBOT_POLL_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            reports_dir: var("AMIBOT_REPORTS_DIR").map(PathBuf::from),
            fixture_path: None,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn notifications_enabled(&self) -> bool {
        self.send_notifications && self.slack_webhook_url.is_some()
    }

    pub fn pull_requests_enabled(&self) -> bool {
        self.open_pull_requests && self.github_token.is_some()
    }
}
