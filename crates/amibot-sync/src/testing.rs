//! In-process fakes for the chat and git-hosting collaborators.

use std::sync::Mutex;

use amibot_core::ImageRecord;
use amibot_storage::SeenStore;
use async_trait::async_trait;

use crate::github::{FileUpdate, GitHost, GitHostError, PullRequestRef, PullRequestSpec, RemoteFile};
use crate::notify::{ChatNotifier, NotifyError};

pub fn sample_record(ami_id: &str) -> ImageRecord {
    ImageRecord {
        zone: "eu-west-1".into(),
        version: "16.04 LTS".into(),
        instance_type: "hvm:ebs-ssd".into(),
        cpu_arch: "amd64".into(),
        date: "2020-01-01".into(),
        ami_id: ami_id.into(),
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatNotifier for RecordingNotifier {
    async fn post_message(&self, text: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(NotifyError::Status {
                status: 500,
                body: "webhook down".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    BranchHead { repo: String, branch: String },
    CreateBranch { repo: String, branch: String, sha: String },
    ReadFile { repo: String, path: String, git_ref: String },
    WriteFile { repo: String, update: FileUpdate },
    OpenPullRequest { repo: String, pr: PullRequestSpec },
}

impl HostCall {
    pub fn repo(&self) -> &str {
        match self {
            HostCall::BranchHead { repo, .. }
            | HostCall::CreateBranch { repo, .. }
            | HostCall::ReadFile { repo, .. }
            | HostCall::WriteFile { repo, .. }
            | HostCall::OpenPullRequest { repo, .. } => repo,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeGitHost {
    vars: String,
    fail_create_for: Option<String>,
    calls: Mutex<Vec<HostCall>>,
    store: Option<SeenStore>,
    seen_at_open: Mutex<Vec<bool>>,
}

impl FakeGitHost {
    pub fn with_vars(vars: &str) -> Self {
        Self {
            vars: vars.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_create_branch_for(mut self, repo: &str) -> Self {
        self.fail_create_for = Some(repo.to_string());
        self
    }

    /// Records whether the head branch's image id was already persisted
    /// each time a pull request is opened.
    pub fn observing(mut self, store: SeenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn seen_at_open(&self) -> Vec<bool> {
        self.seen_at_open.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pull_requests(&self) -> Vec<(String, PullRequestSpec)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::OpenPullRequest { repo, pr } => Some((repo, pr)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GitHost for FakeGitHost {
    async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHostError> {
        self.record(HostCall::BranchHead {
            repo: repo.into(),
            branch: branch.into(),
        });
        Ok("base-sha".into())
    }

    async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), GitHostError> {
        self.record(HostCall::CreateBranch {
            repo: repo.into(),
            branch: branch.into(),
            sha: sha.into(),
        });
        if self.fail_create_for.as_deref() == Some(repo) {
            return Err(GitHostError::Status {
                method: "POST",
                url: format!("https://api.github.test/repos/{repo}/git/refs"),
                status: 422,
                body: r#"{"message":"Reference already exists"}"#.into(),
            });
        }
        Ok(())
    }

    async fn read_file(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<RemoteFile, GitHostError> {
        self.record(HostCall::ReadFile {
            repo: repo.into(),
            path: path.into(),
            git_ref: git_ref.into(),
        });
        Ok(RemoteFile {
            content: self.vars.clone(),
            blob_sha: Some("blob-sha".into()),
        })
    }

    async fn write_file(&self, repo: &str, update: &FileUpdate) -> Result<(), GitHostError> {
        self.record(HostCall::WriteFile {
            repo: repo.into(),
            update: update.clone(),
        });
        Ok(())
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        pr: &PullRequestSpec,
    ) -> Result<PullRequestRef, GitHostError> {
        if let Some(store) = &self.store {
            let seen = store.contains(&pr.head).await.unwrap();
            self.seen_at_open.lock().unwrap().push(seen);
        }
        self.record(HostCall::OpenPullRequest {
            repo: repo.into(),
            pr: pr.clone(),
        });
        let number = self.pull_requests().len() as u64;
        Ok(PullRequestRef {
            number,
            url: Some(format!("https://github.test/{repo}/pull/{number}")),
        })
    }
}
