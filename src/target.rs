use duration_string::DurationString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The delay between polls when the target doesn't declare one.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(30);

const DEFAULT_SECRET_KEY: &str = "token";

/// The git hosting provider to poll. Every provider has its own
/// [`CommitPoller`](crate::poller::CommitPoller) variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

/// A reference to a secret holding the auth token for the upstream API.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRef {
    /// The name of the secret in the external secret store.
    pub secret_name: String,
    /// The key inside the secret that holds the token, "token" if omitted.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
}

fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY.to_string()
}

/// A named pipeline parameter and the expression that produces its value.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub expression: String,
}

/// The expression-based trigger strategy: evaluate each parameter expression
/// against the commit payload and run the named pipeline with the results.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

/// The scope a binding is fetched from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingScope {
    Namespaced,
    Cluster,
}

/// A reference to a named binding in the external resource store.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BindingRef {
    pub name: String,
    #[serde(default = "default_binding_scope")]
    pub scope: BindingScope,
}

fn default_binding_scope() -> BindingScope {
    BindingScope::Namespaced
}

/// A reference to a named template in the external resource store.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TemplateRef {
    pub name: String,
}

/// The binding/template trigger strategy: render whole resource documents
/// from the commit payload.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TriggerResolutionSpec {
    #[serde(default)]
    pub namespace: Option<String>,
    pub bindings: Vec<BindingRef>,
    pub template: TemplateRef,
}

/// The target's declared strategy for turning a new commit into pipeline
/// invocation inputs. Exactly one of the two variants is declared.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSpec {
    /// Evaluate expressions into named parameters and run a pipeline.
    Pipeline(PipelineSpec),
    /// Resolve bindings and a template into rendered resource documents.
    Trigger(TriggerResolutionSpec),
}

/// A repository to poll, and what to do when it changes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// The clone URL of the repository, e.g. `https://github.com/org/repo.git`.
    pub url: String,
    /// The ref to poll for new commits.
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Which hosting provider's API to talk to.
    #[serde(rename = "type")]
    pub provider: Provider,
    /// An optional secret reference for authenticating the requests.
    #[serde(default)]
    pub auth: Option<AuthRef>,
    /// The delay between polls, e.g. "30s" or "5m". Defaults to 30 seconds.
    #[serde(default)]
    pub frequency: Option<DurationString>,
    /// The trigger strategy for changed commits.
    #[serde(flatten)]
    pub trigger: TriggerSpec,
}

/// The last polled state of the repository.
///
/// Field-wise equality against the previous cycle's state is the sole gate
/// for whether a downstream pipeline is triggered. An empty `etag` means no
/// conditional request was possible, not "unknown".
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollState {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
    pub etag: String,
}

impl PollState {
    /// Whether a freshly polled state differs from this one. Repeated polls
    /// reporting the same triple never retrigger.
    pub fn changed(&self, new: &PollState) -> bool {
        self != new
    }
}

/// The observed state of a target, owned and persisted by the external store.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// The last poll failure, cleared on the next successful poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub poll_state: PollState,
}

/// A declared repository target together with its persisted status.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RepositoryTarget {
    pub name: String,
    pub namespace: String,
    pub spec: RepositorySpec,
    #[serde(default)]
    pub status: RepositoryStatus,
}

impl RepositoryTarget {
    /// The configured delay between polls, falling back to
    /// [`DEFAULT_FREQUENCY`] when the target doesn't declare one.
    pub fn frequency(&self) -> Duration {
        self.spec
            .frequency
            .map(Into::into)
            .unwrap_or(DEFAULT_FREQUENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target_json() -> serde_json::Value {
        json!({
            "name": "test-repository",
            "namespace": "test-ns",
            "spec": {
                "url": "https://github.com/example/example.git",
                "ref": "main",
                "type": "github",
                "pipeline": {
                    "name": "test-pipeline",
                    "params": [
                        {"name": "sha", "expression": "context.sha"}
                    ]
                }
            }
        })
    }

    #[test]
    fn it_should_deserialize_a_pipeline_target() {
        let target: RepositoryTarget = serde_json::from_value(target_json()).unwrap();

        assert_eq!("test-repository", target.name);
        assert_eq!(Provider::Github, target.spec.provider);
        assert_eq!(None, target.spec.auth);
        match &target.spec.trigger {
            TriggerSpec::Pipeline(pipeline) => {
                assert_eq!("test-pipeline", pipeline.name);
                assert_eq!(1, pipeline.params.len());
            }
            other => panic!("{other:?} should be a pipeline trigger"),
        }
    }

    #[test]
    fn it_should_deserialize_a_trigger_target() {
        let mut value = target_json();
        let spec = value.get_mut("spec").unwrap().as_object_mut().unwrap();
        spec.remove("pipeline");
        spec.insert(
            "trigger".to_string(),
            json!({
                "bindings": [
                    {"name": "test-binding"},
                    {"name": "shared-binding", "scope": "cluster"}
                ],
                "template": {"name": "test-template"}
            }),
        );

        let target: RepositoryTarget = serde_json::from_value(value).unwrap();
        match &target.spec.trigger {
            TriggerSpec::Trigger(trigger) => {
                assert_eq!(BindingScope::Namespaced, trigger.bindings[0].scope);
                assert_eq!(BindingScope::Cluster, trigger.bindings[1].scope);
                assert_eq!("test-template", trigger.template.name);
            }
            other => panic!("{other:?} should be a resolution trigger"),
        }
    }

    #[test]
    fn it_should_default_the_frequency_to_30_seconds() {
        let target: RepositoryTarget = serde_json::from_value(target_json()).unwrap();
        assert_eq!(Duration::from_secs(30), target.frequency());
    }

    #[test]
    fn it_should_parse_a_declared_frequency() {
        let mut value = target_json();
        value["spec"]["frequency"] = json!("5m");

        let target: RepositoryTarget = serde_json::from_value(value).unwrap();
        assert_eq!(Duration::from_secs(300), target.frequency());
    }

    #[test]
    fn it_should_default_the_secret_key_to_token() {
        let mut value = target_json();
        value["spec"]["auth"] = json!({"secretName": "github-auth"});

        let target: RepositoryTarget = serde_json::from_value(value).unwrap();
        let auth = target.spec.auth.unwrap();
        assert_eq!("github-auth", auth.secret_name);
        assert_eq!("token", auth.secret_key);
    }

    #[test]
    fn it_should_report_unchanged_for_equal_poll_states() {
        let state = PollState {
            ref_: "main".to_string(),
            sha: "24317a55bc59e100177e241e4c1591f76a7ba0a4".to_string(),
            etag: r#"W/"878f43039ad0553d0d3122d8bc171b01""#.to_string(),
        };

        assert!(!state.changed(&state.clone()));
    }

    #[test]
    fn it_should_report_changed_if_any_field_differs() {
        let old = PollState {
            ref_: "main".to_string(),
            sha: String::new(),
            etag: String::new(),
        };
        let new = PollState {
            ref_: "main".to_string(),
            sha: "24317a55bc59e100177e241e4c1591f76a7ba0a4".to_string(),
            etag: r#"W/"878f43039ad0553d0d3122d8bc171b01""#.to_string(),
        };

        assert!(old.changed(&new));
        assert!(old.changed(&PollState {
            ref_: "other".to_string(),
            ..old.clone()
        }));
    }
}
