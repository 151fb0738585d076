//! GitHub webhook intake.
//!
//! A pull request opened with a closing keyword ("fixes #12") against a
//! bounty's issue is treated as a work submission from the PR author. The
//! hook is fire-and-forget for GitHub: anything we cannot act on is logged
//! and acknowledged with 200 so GitHub does not retry forever.

use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use log::{debug, info, warn};
use regex::Regex;

use crate::{models::RepoRef, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/hook", post(github_webhook))
}

async fn github_webhook(State(state): State<AppState>, Json(payload): Json<serde_json::Value>) {
    let Some(action) = payload["action"].as_str() else {
        warn!("webhook without an action field, ignoring");
        return;
    };
    info!("github hook called: {action}");

    match action {
        "opened" | "edited" if payload.get("pull_request").is_some() => {
            pull_request_webhook(&state, &payload).await;
        },
        _ => {
            debug!("unhandled webhook action {action}");
        },
    }
}

/// A PR referencing a bounty issue counts as that assignee submitting work.
async fn pull_request_webhook(state: &AppState, payload: &serde_json::Value) {
    let pr = &payload["pull_request"];
    let Some(pr_url) = pr["html_url"].as_str() else {
        warn!("pull request webhook without html_url, ignoring");
        return;
    };
    let Some(full_name) = payload["repository"]["full_name"].as_str() else {
        warn!("pull request webhook without repository.full_name, ignoring");
        return;
    };
    let Some(repo) = parse_full_name(full_name) else {
        warn!("unparseable repository name {full_name}, ignoring");
        return;
    };
    let Some(author) = pr["user"]["login"].as_str() else {
        warn!("pull request webhook without an author, ignoring");
        return;
    };

    let body = pr["body"].as_str().unwrap_or_default();
    let Some(issue_number) = closing_reference(body) else {
        debug!("PR {pr_url} has no closing reference, ignoring");
        return;
    };

    let bounty = match state
        .engine
        .store()
        .find_bounty_by_issue(&repo, issue_number)
        .await
    {
        Ok(Some(bounty)) => bounty,
        Ok(None) => {
            debug!("no bounty on {repo}#{issue_number}, ignoring PR {pr_url}");
            return;
        },
        Err(e) => {
            warn!("bounty lookup failed for {repo}#{issue_number}: {e}");
            return;
        },
    };

    let user = match state.engine.store().get_user_by_github(author).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            debug!("PR author {author} has no account, ignoring PR {pr_url}");
            return;
        },
        Err(e) => {
            warn!("user lookup failed for {author}: {e}");
            return;
        },
    };

    // submit_work applies the same assignee and state guards as the API
    match state.engine.submit_work(&user, &bounty.id, pr_url).await {
        Ok(updated) => {
            info!(
                "webhook moved bounty {} to {} from PR {pr_url}",
                updated.id, updated.status
            );
        },
        Err(e) => {
            debug!("webhook submission for bounty {} not applied: {e}", bounty.id);
        },
    }
}

fn parse_full_name(full_name: &str) -> Option<RepoRef> {
    let (owner, name) = full_name.split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some(RepoRef {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

/// First "closes/fixes/resolves #N" reference in a PR body.
fn closing_reference(body: &str) -> Option<u64> {
    let re = Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s+#(\d+)")
        .ok()?;
    let caps = re.captures(body)?;
    caps[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_reference_keywords() {
        assert_eq!(closing_reference("Fixes #12"), Some(12));
        assert_eq!(closing_reference("this closes #7 for good"), Some(7));
        assert_eq!(closing_reference("Resolved #300\n\ndetails"), Some(300));
        assert_eq!(closing_reference("fix #1 and closes #2"), Some(1));
    }

    #[test]
    fn closing_reference_requires_keyword() {
        assert_eq!(closing_reference("see #12"), None);
        assert_eq!(closing_reference("prefixes #12"), None);
        assert_eq!(closing_reference(""), None);
    }

    #[test]
    fn full_name_parsing() {
        let repo = parse_full_name("octo/widgets").unwrap();
        assert_eq!(repo.owner, "octo");
        assert_eq!(repo.name, "widgets");
        assert!(parse_full_name("justname").is_none());
        assert!(parse_full_name("a/b/c").is_none());
    }
}
