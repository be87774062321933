//! Git-hosting collaborator: the branch/file/pull-request calls the publisher needs,
//! and a GitHub REST implementation of them.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    /// Blob id of the current content; required by hosts that guard updates with it.
    pub blob_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: String,
    pub branch: String,
    pub content: String,
    pub message: String,
    pub blob_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait GitHost: Send + Sync {
    async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHostError>;

    async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), GitHostError>;

    async fn read_file(&self, repo: &str, path: &str, git_ref: &str)
        -> Result<RemoteFile, GitHostError>;

    async fn write_file(&self, repo: &str, update: &FileUpdate) -> Result<(), GitHostError>;

    async fn open_pull_request(
        &self,
        repo: &str,
        pr: &PullRequestSpec,
    ) -> Result<PullRequestRef, GitHostError>;
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: String,
    #[serde(default)]
    encoding: Option<String>,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    #[serde(default)]
    html_url: Option<String>,
}

/// GitHub REST v3 client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    committer: Option<GitIdentity>,
}

impl GithubClient {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
        committer: Option<GitIdentity>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            committer,
        }
    }

    fn repo_url(&self, repo: &str, tail: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, repo, tail.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
    }

    async fn send_checked(
        &self,
        method: &'static str,
        url: &str,
        req: RequestBuilder,
    ) -> Result<Response, GitHostError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            debug!(method, url, status = status.as_u16(), "github api request ok");
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        error!(method, url, status = status.as_u16(), body = %body, "github api request failed");
        Err(GitHostError::Status {
            method,
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, GitHostError> {
        resp.json::<T>()
            .await
            .map_err(|e| GitHostError::Decode(e.to_string()))
    }
}

/// Decodes the `content` field of a contents-API response.
pub fn decode_content(content: &str, encoding: Option<&str>) -> Result<String, GitHostError> {
    match encoding {
        Some("base64") => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD
                .decode(compact)
                .map_err(|e| GitHostError::Decode(format!("invalid base64 content: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| GitHostError::Decode(format!("file is not utf-8: {e}")))
        }
        None | Some("utf-8") | Some("") => Ok(content.to_string()),
        Some(other) => Err(GitHostError::Decode(format!(
            "unsupported content encoding {other}"
        ))),
    }
}

/// Request body for `PUT /repos/{repo}/contents/{path}`.
pub fn contents_payload(update: &FileUpdate, committer: Option<&GitIdentity>) -> JsonValue {
    let mut payload = json!({
        "message": update.message,
        "content": STANDARD.encode(update.content.as_bytes()),
        "branch": update.branch,
    });
    if let Some(sha) = &update.blob_sha {
        payload["sha"] = json!(sha);
    }
    if let Some(identity) = committer {
        payload["committer"] = json!({ "name": identity.name, "email": identity.email });
    }
    payload
}

#[async_trait]
impl GitHost for GithubClient {
    async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHostError> {
        let url = self.repo_url(repo, &format!("git/refs/heads/{branch}"));
        let resp = self
            .send_checked("GET", &url, self.request(Method::GET, &url))
            .await?;
        let body: RefResponse = Self::decode(resp).await?;
        Ok(body.object.sha)
    }

    async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), GitHostError> {
        let url = self.repo_url(repo, "git/refs");
        let req = self
            .request(Method::POST, &url)
            .json(&json!({ "ref": format!("refs/heads/{branch}"), "sha": sha }));
        self.send_checked("POST", &url, req).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<RemoteFile, GitHostError> {
        let url = self.repo_url(repo, &format!("contents/{path}"));
        let req = self.request(Method::GET, &url).query(&[("ref", git_ref)]);
        let resp = self.send_checked("GET", &url, req).await?;
        let body: ContentResponse = Self::decode(resp).await?;
        Ok(RemoteFile {
            content: decode_content(&body.content, body.encoding.as_deref())?,
            blob_sha: Some(body.sha),
        })
    }

    async fn write_file(&self, repo: &str, update: &FileUpdate) -> Result<(), GitHostError> {
        let url = self.repo_url(repo, &format!("contents/{}", update.path));
        let req = self
            .request(Method::PUT, &url)
            .json(&contents_payload(update, self.committer.as_ref()));
        self.send_checked("PUT", &url, req).await?;
        Ok(())
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        pr: &PullRequestSpec,
    ) -> Result<PullRequestRef, GitHostError> {
        let url = self.repo_url(repo, "pulls");
        let req = self.request(Method::POST, &url).json(&json!({
            "title": pr.title,
            "body": pr.body,
            "head": pr.head,
            "base": pr.base,
            "maintainer_can_modify": true,
        }));
        let resp = self.send_checked("POST", &url, req).await?;
        let body: PullResponse = Self::decode(resp).await?;
        Ok(PullRequestRef {
            number: body.number,
            url: body.html_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(blob_sha: Option<&str>) -> FileUpdate {
        FileUpdate {
            path: "packer-vars.json".into(),
            branch: "ami-0123".into(),
            content: "{\n  \"ubuntu_ami_id\": \"ami-0123\"\n}".into(),
            message: "Update ubuntu_ami_id to ami-0123".into(),
            blob_sha: blob_sha.map(str::to_string),
        }
    }

    #[test]
    fn decodes_wrapped_base64_content() {
        let encoded = "eyJ1YnVudHVfYW1pX2lk\nIjogImFtaS0xIn0=\n";
        assert_eq!(
            decode_content(encoded, Some("base64")).unwrap(),
            r#"{"ubuntu_ami_id": "ami-1"}"#
        );
    }

    #[test]
    fn rejects_unknown_encoding() {
        assert!(matches!(
            decode_content("x", Some("none")),
            Err(GitHostError::Decode(_))
        ));
    }

    #[test]
    fn contents_payload_carries_sha_and_committer() {
        let identity = GitIdentity {
            name: "bot".into(),
            email: "bot@example.org".into(),
        };
        let payload = contents_payload(&update(Some("blob-1")), Some(&identity));
        assert_eq!(payload["branch"], "ami-0123");
        assert_eq!(payload["sha"], "blob-1");
        assert_eq!(payload["committer"]["email"], "bot@example.org");
        assert_eq!(payload["message"], "Update ubuntu_ami_id to ami-0123");

        let content = payload["content"].as_str().unwrap();
        assert_eq!(
            decode_content(content, Some("base64")).unwrap(),
            update(None).content
        );
    }

    #[test]
    fn contents_payload_without_optional_fields() {
        let payload = contents_payload(&update(None), None);
        assert!(payload.get("sha").is_none());
        assert!(payload.get("committer").is_none());
    }

    #[test]
    fn repo_urls_are_joined_without_double_slashes() {
        let client = GithubClient::new(
            reqwest::Client::new(),
            "https://api.github.com/",
            "t0ken",
            None,
        );
        assert_eq!(
            client.repo_url("DemocracyClub/polling_deploy", "git/refs/heads/master"),
            "https://api.github.com/repos/DemocracyClub/polling_deploy/git/refs/heads/master"
        );
        assert_eq!(
            client.repo_url("org/x", "/pulls"),
            "https://api.github.com/repos/org/x/pulls"
        );
    }
}
