//! Opens a pull request that bumps the image id in a downstream repository's vars file.

use std::fmt;
use std::sync::Arc;

use amibot_core::{commit_message, release_message, ImageRecord};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::github::{FileUpdate, GitHost, GitHostError, PullRequestRef, PullRequestSpec};

pub const VARS_KEY: &str = "ubuntu_ami_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    ResolveHead,
    CreateBranch,
    ReadVars,
    WriteVars,
    OpenPullRequest,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublishStep::ResolveHead => "resolving base branch head",
            PublishStep::CreateBranch => "creating branch",
            PublishStep::ReadVars => "reading vars file",
            PublishStep::WriteVars => "writing vars file",
            PublishStep::OpenPullRequest => "opening pull request",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{step} in {repo}: {source}")]
    Host {
        repo: String,
        step: PublishStep,
        #[source]
        source: GitHostError,
    },
    #[error("{path} in {repo} is not a JSON object: {source}")]
    InvalidVars {
        repo: String,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PublishError {
    pub fn step(&self) -> Option<PublishStep> {
        match self {
            PublishError::Host { step, .. } => Some(*step),
            PublishError::InvalidVars { .. } => None,
        }
    }
}

/// Sets `key` to `value` in a JSON object document, keeping every other key where it was.
///
/// Output uses two-space indentation; a trailing newline is kept iff the input had one.
pub fn update_vars_document(
    text: &str,
    key: &str,
    value: &str,
) -> Result<String, serde_json::Error> {
    let mut vars: IndexMap<String, JsonValue> = serde_json::from_str(text)?;
    vars.insert(key.to_string(), JsonValue::String(value.to_string()));
    let mut out = serde_json::to_string_pretty(&vars)?;
    if text.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub base_branch: String,
    pub vars_file: String,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            base_branch: "master".to_string(),
            vars_file: "packer-vars.json".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ConfigUpdatePublisher {
    host: Arc<dyn GitHost>,
    settings: PublishSettings,
}

impl ConfigUpdatePublisher {
    pub fn new(host: Arc<dyn GitHost>, settings: PublishSettings) -> Self {
        Self { host, settings }
    }

    /// Branch named after the image id, vars file updated on it, pull request back to base.
    /// The first failing step aborts this repository; nothing is retried.
    pub async fn publish(
        &self,
        repo: &str,
        record: &ImageRecord,
    ) -> Result<PullRequestRef, PublishError> {
        let span = info_span!("publish", repo, ami_id = %record.ami_id);
        self.publish_steps(repo, record).instrument(span).await
    }

    async fn publish_steps(
        &self,
        repo: &str,
        record: &ImageRecord,
    ) -> Result<PullRequestRef, PublishError> {
        let host_err = move |step: PublishStep| {
            move |source: GitHostError| PublishError::Host {
                repo: repo.to_string(),
                step,
                source,
            }
        };
        let base = self.settings.base_branch.as_str();
        let branch = record.ami_id.as_str();
        let path = self.settings.vars_file.as_str();
        let message = commit_message(&record.ami_id);

        let head = self
            .host
            .branch_head(repo, base)
            .await
            .map_err(host_err(PublishStep::ResolveHead))?;
        self.host
            .create_branch(repo, branch, &head)
            .await
            .map_err(host_err(PublishStep::CreateBranch))?;

        let file = self
            .host
            .read_file(repo, path, branch)
            .await
            .map_err(host_err(PublishStep::ReadVars))?;
        let content = update_vars_document(&file.content, VARS_KEY, &record.ami_id).map_err(
            |source| PublishError::InvalidVars {
                repo: repo.to_string(),
                path: path.to_string(),
                source,
            },
        )?;

        self.host
            .write_file(
                repo,
                &FileUpdate {
                    path: path.to_string(),
                    branch: branch.to_string(),
                    content,
                    message: message.clone(),
                    blob_sha: file.blob_sha,
                },
            )
            .await
            .map_err(host_err(PublishStep::WriteVars))?;

        let pr = self
            .host
            .open_pull_request(
                repo,
                &PullRequestSpec {
                    title: message,
                    body: release_message(record),
                    head: branch.to_string(),
                    base: base.to_string(),
                },
            )
            .await
            .map_err(host_err(PublishStep::OpenPullRequest))?;
        info!(number = pr.number, url = pr.url.as_deref().unwrap_or(""), "opened pull request");
        Ok(pr)
    }
}
