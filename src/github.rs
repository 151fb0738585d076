//! Issue tracker client.
//!
//! The lifecycle engine talks to the [`IssueTracker`] trait; the production
//! implementation drives the github REST API with the acting user's access
//! token. Tests substitute [`MockTracker`].

use std::time::Duration;

use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{Error, Result},
    models::RepoRef,
};

/// Issue handle returned by the tracker on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub number: u64,
    pub url: String,
    pub node_id: String,
}

#[axum::async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<CreatedIssue>;

    async fn assign_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        username: &str,
    ) -> Result<()>;

    async fn add_comment(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        text: &str,
    ) -> Result<()>;

    async fn close_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        final_comment: Option<&str>,
    ) -> Result<()>;

    async fn add_labels(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        labels: &[String],
    ) -> Result<()>;

    async fn check_write_access(&self, token: &str, repo: &RepoRef) -> Result<bool>;
}

/// A pull request URL broken into the pieces the engine checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPrUrl {
    pub repo: RepoRef,
    pub number: u64,
}

/// Parse a github pull request URL into owner/repo/number.
pub fn parse_pr_url(url: &str) -> Result<ParsedPrUrl> {
    // could cache using lazy static
    let re = regex::Regex::new(r"^https://github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+)/pull/(?P<number>\d+)/?$")
        .expect("pr url regex is valid");
    let caps = re.captures(url).ok_or_else(|| Error::Validation {
        field: "pr_url",
        reason: format!("not a github pull request URL: {url}"),
    })?;
    Ok(ParsedPrUrl {
        repo: RepoRef {
            owner: caps["owner"].to_string(),
            name: caps["repo"].to_string(),
        },
        number: caps["number"].parse().map_err(|_| Error::Validation {
            field: "pr_url",
            reason: "pull request number out of range".into(),
        })?,
    })
}

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "LumenBounties";

pub struct GithubClient {
    reqwest: reqwest::Client,
    api_base: String,
}

impl GithubClient {
    pub fn new() -> GithubClient {
        GithubClient::with_base(GITHUB_API)
    }

    pub fn with_base(api_base: impl Into<String>) -> GithubClient {
        let reqwest = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        GithubClient {
            reqwest,
            api_base: api_base.into(),
        }
    }

    fn request(&self, method: Method, path: &str, auth: &str) -> reqwest::RequestBuilder {
        self.reqwest
            .request(method, format!("{}{}", self.api_base, path))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(auth)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let res = builder
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        let status = res.status();
        let body = res
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("unknown error");
            return Err(Error::Tracker(format!("{status}: {message}")));
        }
        Ok(body)
    }
}

impl Default for GithubClient {
    fn default() -> Self {
        GithubClient::new()
    }
}

#[axum::async_trait]
impl IssueTracker for GithubClient {
    async fn create_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<CreatedIssue> {
        let path = format!("/repos/{}/{}/issues", repo.owner, repo.name);
        let payload = json!({
            "title": title,
            "body": body,
            "labels": labels,
        });
        let body = self
            .send(self.request(Method::POST, &path, token).json(&payload))
            .await
            .map_err(|e| Error::UpstreamIssueCreationFailed(e.to_string()))?;

        debug!("created issue {body}");

        let number = body["number"]
            .as_u64()
            .ok_or_else(|| Error::UpstreamIssueCreationFailed("no issue number".into()))?;
        let url = body["html_url"]
            .as_str()
            .ok_or_else(|| Error::UpstreamIssueCreationFailed("no issue url".into()))?
            .to_string();
        let node_id = body["node_id"].as_str().unwrap_or_default().to_string();
        Ok(CreatedIssue {
            number,
            url,
            node_id,
        })
    }

    async fn assign_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        username: &str,
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/issues/{}/assignees",
            repo.owner, repo.name, issue_number
        );
        self.send(
            self.request(Method::POST, &path, token)
                .json(&json!({ "assignees": [username] })),
        )
        .await?;
        Ok(())
    }

    async fn add_comment(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        text: &str,
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/issues/{}/comments",
            repo.owner, repo.name, issue_number
        );
        self.send(
            self.request(Method::POST, &path, token)
                .json(&json!({ "body": text })),
        )
        .await?;
        Ok(())
    }

    async fn close_issue(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        final_comment: Option<&str>,
    ) -> Result<()> {
        if let Some(comment) = final_comment {
            self.add_comment(token, repo, issue_number, comment).await?;
        }
        let path = format!(
            "/repos/{}/{}/issues/{}",
            repo.owner, repo.name, issue_number
        );
        self.send(
            self.request(Method::PATCH, &path, token)
                .json(&json!({ "state": "closed" })),
        )
        .await?;
        Ok(())
    }

    async fn add_labels(
        &self,
        token: &str,
        repo: &RepoRef,
        issue_number: u64,
        labels: &[String],
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/issues/{}/labels",
            repo.owner, repo.name, issue_number
        );
        self.send(
            self.request(Method::POST, &path, token)
                .json(&json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    async fn check_write_access(&self, token: &str, repo: &RepoRef) -> Result<bool> {
        let path = format!("/repos/{}/{}", repo.owner, repo.name);
        let body = self.send(self.request(Method::GET, &path, token)).await?;
        Ok(body["permissions"]["push"].as_bool().unwrap_or(false))
    }
}

#[cfg(test)]
pub use mock::MockTracker;

#[cfg(test)]
mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Scripted tracker for engine tests.
    pub struct MockTracker {
        pub fail_create: bool,
        pub deny_write: bool,
        pub fail_write_check: bool,
        next_number: Mutex<u64>,
        pub comments: Mutex<Vec<(u64, String)>>,
        pub closed: Mutex<Vec<u64>>,
        pub assigned: Mutex<Vec<(u64, String)>>,
    }

    impl MockTracker {
        pub fn new() -> MockTracker {
            MockTracker {
                fail_create: false,
                deny_write: false,
                fail_write_check: false,
                next_number: Mutex::new(1),
                comments: Mutex::new(vec![]),
                closed: Mutex::new(vec![]),
                assigned: Mutex::new(vec![]),
            }
        }

        pub fn failing_create() -> MockTracker {
            MockTracker {
                fail_create: true,
                ..MockTracker::new()
            }
        }

        pub fn failing_write_check() -> MockTracker {
            MockTracker {
                fail_write_check: true,
                ..MockTracker::new()
            }
        }
    }

    #[axum::async_trait]
    impl IssueTracker for MockTracker {
        async fn create_issue(
            &self,
            _token: &str,
            repo: &RepoRef,
            _title: &str,
            _body: &str,
            _labels: &[String],
        ) -> Result<CreatedIssue> {
            if self.fail_create {
                return Err(Error::UpstreamIssueCreationFailed("scripted failure".into()));
            }
            let mut n = self.next_number.lock().unwrap();
            let number = *n;
            *n += 1;
            Ok(CreatedIssue {
                number,
                url: format!("https://github.com/{}/{}/issues/{number}", repo.owner, repo.name),
                node_id: format!("NODE_{number}"),
            })
        }

        async fn assign_issue(
            &self,
            _token: &str,
            _repo: &RepoRef,
            issue_number: u64,
            username: &str,
        ) -> Result<()> {
            self.assigned
                .lock()
                .unwrap()
                .push((issue_number, username.to_string()));
            Ok(())
        }

        async fn add_comment(
            &self,
            _token: &str,
            _repo: &RepoRef,
            issue_number: u64,
            text: &str,
        ) -> Result<()> {
            self.comments
                .lock()
                .unwrap()
                .push((issue_number, text.to_string()));
            Ok(())
        }

        async fn close_issue(
            &self,
            _token: &str,
            _repo: &RepoRef,
            issue_number: u64,
            final_comment: Option<&str>,
        ) -> Result<()> {
            if let Some(comment) = final_comment {
                self.comments
                    .lock()
                    .unwrap()
                    .push((issue_number, comment.to_string()));
            }
            self.closed.lock().unwrap().push(issue_number);
            Ok(())
        }

        async fn add_labels(
            &self,
            _token: &str,
            _repo: &RepoRef,
            _issue_number: u64,
            _labels: &[String],
        ) -> Result<()> {
            Ok(())
        }

        async fn check_write_access(&self, _token: &str, _repo: &RepoRef) -> Result<bool> {
            if self.fail_write_check {
                return Err(Error::Tracker("scripted network failure".into()));
            }
            Ok(!self.deny_write)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_pr_url() {
        let parsed = parse_pr_url("https://github.com/acme/widgets/pull/42").unwrap();
        assert_eq!(parsed.repo.owner, "acme");
        assert_eq!(parsed.repo.name, "widgets");
        assert_eq!(parsed.number, 42);
    }

    #[test]
    fn rejects_issue_and_foreign_urls() {
        assert!(parse_pr_url("https://github.com/acme/widgets/issues/42").is_err());
        assert!(parse_pr_url("https://gitlab.com/acme/widgets/pull/42").is_err());
        assert!(parse_pr_url("not a url").is_err());
    }
}
