use super::{execute, Commit, CommitPoller, PollError};
use crate::target::PollState;
use log::debug;
use serde_json::Value;

const PUBLIC_ENDPOINT: &str = "https://gitlab.com";

/// A poller for the GitLab commits API, public or self-hosted.
///
/// GitLab returns a list of commits for the polled ref; the head commit is
/// the first element. An empty list is reported as an explicit
/// [PollError::EmptyResponse] instead of being indexed blindly.
pub struct GitLabPoller {
    agent: ureq::Agent,
    endpoint: String,
    auth_token: Option<String>,
}

impl GitLabPoller {
    /// Creates a new GitLab poller against the given API endpoint, falling
    /// back to the public `https://gitlab.com` when empty.
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
}

impl CommitPoller for GitLabPoller {
    fn poll(&self, repo: &str, prior: &PollState) -> Result<(PollState, Option<Commit>), PollError> {
        // The project is identified by its URL-encoded owner%2Fname path.
        let url = format!(
            "{}/api/v4/projects/{}/repository/commits",
            self.endpoint,
            repo.replace('/', "%2F")
        );
        debug!("Polling GitLab commits on {url}.");

        let mut request = self.agent.get(&url).query("ref", &prior.ref_);
        if !prior.etag.is_empty() {
            request = request.set("If-None-Match", &prior.etag);
        }
        if let Some(token) = &self.auth_token {
            request = request.set("Private-Token", token);
        }

        let response = execute(request)?;
        if response.status() == 304 {
            return Ok((prior.clone(), None));
        }

        let etag = response.header("ETag").unwrap_or_default().to_string();
        let body: Value = response
            .into_json()
            .map_err(|err| PollError::Decode(err.to_string()))?;
        let commits = body
            .as_array()
            .ok_or_else(|| PollError::Decode("expected a list of commits".to_string()))?;
        let commit = commits
            .first()
            .ok_or(PollError::EmptyResponse)?
            .as_object()
            .cloned()
            .ok_or_else(|| PollError::Decode("expected a commit object".to_string()))?;
        let sha = commit
            .get("id")
            .and_then(Value::as_str)
            .ok_or(PollError::MissingField("id"))?
            .to_string();

        let state = PollState {
            ref_: prior.ref_.clone(),
            sha,
            etag,
        };
        Ok((state, Some(commit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tiny_http::{Header, Response, Server};

    const TEST_TOKEN: &str = "test12345";
    const TEST_ETAG: &str = r#"W/"878f43039ad0553d0d3122d8bc171b01""#;
    const TEST_SHA: &str = "ed899a2f4b50b4370feeea94676502b42383c746";

    fn commits_body() -> String {
        format!(r#"[{{"id": "{TEST_SHA}", "title": "Replace sanitize with escape once"}}]"#)
    }

    fn get_header(request: &tiny_http::Request, field: &'static str) -> Option<String> {
        request
            .headers()
            .iter()
            .find(|h| h.field.equiv(field))
            .map(|h| h.value.as_str().to_string())
    }

    /// Starts a local API server that mimics the GitLab commits endpoint.
    fn make_gitlab_api_server(
        auth_token: &'static str,
        want_url: &'static str,
        etag: &'static str,
        response: String,
    ) -> String {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();

        thread::spawn(move || {
            for request in server.incoming_requests() {
                if !auth_token.is_empty()
                    && get_header(&request, "Private-Token").as_deref() != Some(auth_token)
                {
                    let _ = request.respond(Response::from_string("").with_status_code(404));
                    continue;
                }
                if request.url() != want_url {
                    let _ = request.respond(Response::from_string("").with_status_code(404));
                    continue;
                }
                if get_header(&request, "If-None-Match").as_deref() == Some(etag) {
                    let _ = request.respond(Response::from_string("").with_status_code(304));
                    continue;
                }
                let _ = request.respond(Response::from_string(response.clone()).with_header(
                    Header::from_bytes(&b"ETag"[..], etag.as_bytes()).unwrap(),
                ));
            }
        });

        format!("http://127.0.0.1:{port}")
    }

    fn prior_state(etag: &str) -> PollState {
        PollState {
            ref_: "main".to_string(),
            sha: String::new(),
            etag: etag.to_string(),
        }
    }

    #[test]
    fn it_should_default_to_the_public_endpoint() {
        let poller = GitLabPoller::new(ureq::agent(), "", None);
        assert_eq!("https://gitlab.com", poller.endpoint);

        let poller = GitLabPoller::new(ureq::agent(), "https://gl.example.com", None);
        assert_eq!("https://gl.example.com", poller.endpoint);
    }

    #[test]
    fn it_should_poll_a_new_commit_with_an_encoded_project_path() {
        let endpoint = make_gitlab_api_server(
            TEST_TOKEN,
            "/api/v4/projects/testing%2Frepo/repository/commits?ref=main",
            TEST_ETAG,
            commits_body(),
        );
        let poller = GitLabPoller::new(ureq::agent(), &endpoint, Some(TEST_TOKEN.to_string()));

        let (state, commit) = poller.poll("testing/repo", &prior_state("")).unwrap();

        assert_eq!(TEST_SHA, state.sha);
        assert_eq!(TEST_ETAG, state.etag);
        assert_eq!(
            "Replace sanitize with escape once",
            commit.unwrap()["title"].as_str().unwrap()
        );
    }

    #[test]
    fn it_should_return_the_prior_state_on_a_304() {
        let endpoint = make_gitlab_api_server(
            TEST_TOKEN,
            "/api/v4/projects/testing%2Frepo/repository/commits?ref=main",
            TEST_ETAG,
            commits_body(),
        );
        let poller = GitLabPoller::new(ureq::agent(), &endpoint, Some(TEST_TOKEN.to_string()));

        let prior = prior_state(TEST_ETAG);
        let (state, commit) = poller.poll("testing/repo", &prior).unwrap();

        assert_eq!(prior, state);
        assert!(commit.is_none());
    }

    #[test]
    fn it_should_fail_with_a_404_for_a_bad_token() {
        let endpoint = make_gitlab_api_server(
            TEST_TOKEN,
            "/api/v4/projects/testing%2Frepo/repository/commits?ref=main",
            TEST_ETAG,
            commits_body(),
        );
        let poller = GitLabPoller::new(ureq::agent(), &endpoint, Some("anotherToken".to_string()));

        let error = poller.poll("testing/repo", &prior_state("")).err().unwrap();
        assert_eq!("server error: 404", error.to_string());
    }

    #[test]
    fn it_should_fail_on_an_empty_commit_list() {
        let endpoint = make_gitlab_api_server(
            TEST_TOKEN,
            "/api/v4/projects/testing%2Frepo/repository/commits?ref=main",
            TEST_ETAG,
            "[]".to_string(),
        );
        let poller = GitLabPoller::new(ureq::agent(), &endpoint, Some(TEST_TOKEN.to_string()));

        let error = poller.poll("testing/repo", &prior_state("")).err().unwrap();
        assert!(
            matches!(error, PollError::EmptyResponse),
            "{error:?} should be EmptyResponse"
        );
    }

    #[test]
    fn it_should_fail_to_decode_a_non_object_commit() {
        let endpoint = make_gitlab_api_server(
            TEST_TOKEN,
            "/api/v4/projects/testing%2Frepo/repository/commits?ref=main",
            TEST_ETAG,
            r#"["not a commit"]"#.to_string(),
        );
        let poller = GitLabPoller::new(ureq::agent(), &endpoint, Some(TEST_TOKEN.to_string()));

        let error = poller.poll("testing/repo", &prior_state("")).err().unwrap();
        assert!(
            matches!(error, PollError::Decode(_)),
            "{error:?} should be Decode"
        );
    }
}
