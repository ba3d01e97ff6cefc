use super::{execute, Commit, CommitPoller, PollError};
use crate::target::PollState;
use log::debug;
use serde_json::Value;

const PUBLIC_ENDPOINT: &str = "https://api.github.com";

/// The preview media type that makes the commits endpoint return full commit
/// documents with ETag support.
const CHITAURI_PREVIEW: &str = "application/vnd.github.chitauri-preview+sha";

/// A poller for the GitHub commits API, public or Enterprise.
///
/// Requests are conditional: when the prior poll state carries an ETag it is
/// sent as `If-None-Match`, and a 304 answer short-circuits without decoding
/// anything. After a changed commit is fetched, the repository's tags are
/// looked up and a matching tag name is recorded on the commit payload.
pub struct GitHubPoller {
    agent: ureq::Agent,
    endpoint: String,
    auth_token: Option<String>,
}

impl GitHubPoller {
    /// Creates a new GitHub poller against the given API endpoint, falling
    /// back to the public `https://api.github.com` when empty.
    pub fn new(agent: ureq::Agent, endpoint: &str, auth_token: Option<String>) -> Self {
        let endpoint = if endpoint.is_empty() {
            PUBLIC_ENDPOINT.to_string()
        } else {
            endpoint.to_string()
        };
        Self {
            agent,
            endpoint,
            auth_token,
        }
    }

    fn request(&self, url: &str) -> ureq::Request {
        let mut request = self.agent.get(url).set("Accept", CHITAURI_PREVIEW);
        if let Some(token) = &self.auth_token {
            request = request.set("Authorization", &format!("token {token}"));
        }
        request
    }

    /// Looks up the repository's tags and returns the name of the tag
    /// pointing at the given SHA, if there is one. A failed lookup fails the
    /// whole poll, it is not silently skipped.
    fn resolve_tag(&self, repo: &str, sha: &str) -> Result<Option<String>, PollError> {
        let url = format!("{}/repos/{}/tags", self.endpoint, repo);
        let response = execute(self.request(&url))?;
        let tags: Value = response
            .into_json()
            .map_err(|err| PollError::Decode(err.to_string()))?;
        let tags = tags
            .as_array()
            .ok_or_else(|| PollError::Decode("expected a list of tags".to_string()))?;

        for tag in tags {
            if tag["commit"]["sha"].as_str() == Some(sha) {
                return Ok(tag["name"].as_str().map(String::from));
            }
        }
        Ok(None)
    }
}

impl CommitPoller for GitHubPoller {
    fn poll(&self, repo: &str, prior: &PollState) -> Result<(PollState, Option<Commit>), PollError> {
        let url = format!("{}/repos/{}/commits/{}", self.endpoint, repo, prior.ref_);
        debug!("Polling GitHub commit on {url}.");

        let mut request = self.request(&url);
        if !prior.etag.is_empty() {
            request = request.set("If-None-Match", &prior.etag);
        }

        let response = execute(request)?;
        if response.status() == 304 {
            return Ok((prior.clone(), None));
        }

        let etag = response.header("ETag").unwrap_or_default().to_string();
        let body: Value = response
            .into_json()
            .map_err(|err| PollError::Decode(err.to_string()))?;
        let mut commit = body
            .as_object()
            .cloned()
            .ok_or_else(|| PollError::Decode("expected a commit object".to_string()))?;
        let sha = commit
            .get("sha")
            .and_then(Value::as_str)
            .ok_or(PollError::MissingField("sha"))?
            .to_string();

        if let Some(tag) = self.resolve_tag(repo, &sha)? {
            commit.insert("tag".to_string(), Value::String(tag));
        }

        let state = PollState {
            ref_: prior.ref_.clone(),
            sha,
            etag,
        };
        Ok((state, Some(commit)))
    }
}
