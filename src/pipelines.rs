use mockall::automock;
use serde_json::Value;
use thiserror::Error;

/// A resolved pipeline parameter value, either a single string or an ordered
/// sequence of strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

/// A named, resolved parameter for a pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

impl Param {
    pub fn new(name: &str, value: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// The name of a submitted pipeline run.
pub type RunHandle = String;

/// A custom error describing the error cases for run submission.
#[derive(Clone, Debug, Error)]
pub enum PipelineError {
    /// The run submission was rejected or never reached the platform.
    #[error("failed to create a pipeline run for pipeline {0}: {1}")]
    RunFailed(String, String),
    /// The rendered resource documents could not be created.
    #[error("failed to create the rendered resources: {0}")]
    ResourcesFailed(String),
}

/// A pipeline invoker submits runs to the external pipeline-execution
/// platform. Each changed poll cycle submits exactly once, through one of the
/// two methods matching the target's trigger strategy.
#[automock]
pub trait PipelineInvoker {
    /// Runs the named pipeline with the resolved parameters.
    fn run(
        &self,
        pipeline: &str,
        namespace: &str,
        params: &[Param],
    ) -> Result<RunHandle, PipelineError>;

    /// Creates the rendered resource documents produced by the trigger
    /// resolver.
    fn create_resources(&self, namespace: &str, resources: &[Value])
        -> Result<(), PipelineError>;
}
