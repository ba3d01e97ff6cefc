use crate::target::{PollState, Provider};
use mockall::automock;
use serde_json::Value;
use thiserror::Error;

/// A poller for the GitHub commits API.
pub mod github;
/// A poller for the GitLab commits API.
pub mod gitlab;

pub use github::GitHubPoller;
pub use gitlab::GitLabPoller;

/// A polled commit, specific to each provider. The payload is an opaque
/// key/value document, produced fresh on every successful poll and discarded
/// once parameters are resolved.
pub type Commit = serde_json::Map<String, Value>;

/// A custom error describing the error cases for commit polling.
#[derive(Clone, Debug, Error)]
pub enum PollError {
    /// The target URL could not be split into a host and repo coordinate.
    #[error("failed to parse repo from URL {0}")]
    UrlParse(String),
    /// The request never produced a response. This can be a connection
    /// failure, a DNS error or a timeout.
    #[error("failed to get current commit: {0}")]
    Transport(String),
    /// The upstream server rejected the request. A 404 can mean either an
    /// unknown repository or a bad auth token, the two are indistinguishable.
    #[error("server error: {0}")]
    Server(u16),
    /// The response body was not the JSON document we expected.
    #[error("failed to decode response body: {0}")]
    Decode(String),
    /// The response decoded fine, but a required field was missing.
    #[error("missing '{0}' in the commit payload")]
    MissingField(&'static str),
    /// The upstream returned an empty commit list for the polled ref.
    #[error("no commits found for the polled ref")]
    EmptyResponse,
}

/// A commit poller checks with an upstream git hosting service to determine
/// the current SHA and ETag of a ref.
///
/// Pollers may include:
///   - the GitHub commits API ([github::GitHubPoller])
///   - the GitLab commits API ([gitlab::GitLabPoller])
#[automock]
pub trait CommitPoller {
    /// Fetch the current head commit of the prior state's ref. Returns the
    /// new poll state and the decoded commit payload, or the prior state and
    /// no payload if the upstream reports nothing changed (HTTP 304).
    fn poll(&self, repo: &str, prior: &PollState) -> Result<(PollState, Option<Commit>), PollError>;
}

/// Creates the commit poller for the target's declared provider.
pub fn make_poller(
    provider: Provider,
    agent: ureq::Agent,
    endpoint: &str,
    auth_token: Option<String>,
) -> Box<dyn CommitPoller> {
    match provider {
        Provider::Github => Box::new(GitHubPoller::new(agent, endpoint, auth_token)),
        Provider::Gitlab => Box::new(GitLabPoller::new(agent, endpoint, auth_token)),
    }
}

/// Derives the `owner/name` coordinate and the API endpoint from a repository
/// URL. For GitHub hosts (any host ending in `github.com`, which covers
/// Enterprise installs) the polling host is rewritten to `api.` + host; every
/// other host is passed through unchanged.
pub fn repo_from_url(url: &str) -> Result<(String, String), PollError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| PollError::UrlParse(url.to_string()))?;
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    if scheme.is_empty() || host.is_empty() {
        return Err(PollError::UrlParse(url.to_string()));
    }

    let coordinate = path
        .strip_suffix(".git")
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string();
    let host = if host.ends_with("github.com") {
        format!("api.{host}")
    } else {
        host.to_string()
    };
    Ok((coordinate, format!("{scheme}://{host}")))
}

/// Executes a request, mapping transport failures and HTTP error statuses to
/// [PollError]. Anything below 400 (including 304) is passed through.
fn execute(request: ureq::Request) -> Result<ureq::Response, PollError> {
    match request.call() {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(code, _)) => Err(PollError::Server(code)),
        Err(ureq::Error::Transport(err)) => Err(PollError::Transport(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_derive_the_github_api_endpoint() {
        let (coordinate, endpoint) = repo_from_url("https://github.com/org/repo.git").unwrap();
        assert_eq!("org/repo", coordinate);
        assert_eq!("https://api.github.com", endpoint);
    }

    #[test]
    fn it_should_rewrite_enterprise_github_hosts() {
        let (coordinate, endpoint) =
            repo_from_url("https://example.github.com/org/repo.git").unwrap();
        assert_eq!("org/repo", coordinate);
        assert_eq!("https://api.example.github.com", endpoint);
    }

    #[test]
    fn it_should_pass_gitlab_hosts_through_unchanged() {
        let (coordinate, endpoint) = repo_from_url("https://gitlab.com/org/repo.git").unwrap();
        assert_eq!("org/repo", coordinate);
        assert_eq!("https://gitlab.com", endpoint);
    }

    #[test]
    fn it_should_pass_other_hosts_through_unchanged() {
        let (coordinate, endpoint) = repo_from_url("https://git.example.com/org/repo").unwrap();
        assert_eq!("org/repo", coordinate);
        assert_eq!("https://git.example.com", endpoint);
    }

    #[test]
    fn it_should_fail_on_a_malformed_url() {
        let error = repo_from_url("github.com/org/repo").err().unwrap();
        assert!(
            matches!(error, PollError::UrlParse(_)),
            "{error:?} should be UrlParse"
        );
    }
}
