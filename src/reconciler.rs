use crate::expr::{Context, ExprError};
use crate::pipelines::{Param, PipelineError, PipelineInvoker};
use crate::poller::{make_poller, repo_from_url, Commit, CommitPoller, PollError};
use crate::resolver::{self, ResolveError, ResourceStore};
use crate::secrets::{SecretError, SecretGetter};
use crate::target::{Provider, RepositoryTarget, TriggerSpec};
use log::{debug, error, info};
use mockall::automock;
use std::time::Duration;
use thiserror::Error;

/// Outbound HTTP calls made by the default pollers are bounded by this
/// timeout. The reference implementation polled without one; a hung upstream
/// would block the cycle's worker indefinitely.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A custom error describing the error cases for a reconciliation cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The target URL is malformed. Fatal for the cycle, nothing is mutated.
    #[error("failed to parse repo from URL {0}")]
    UrlParse(String),
    /// The configured credential could not be resolved. Fatal for the cycle,
    /// no poll is attempted.
    #[error("getting the auth token failed: {0}")]
    Credential(#[from] SecretError),
    /// The poll failed; the message is also recorded on the target's status.
    #[error("{0}")]
    Poll(#[from] PollError),
    /// A parameter expression failed in any of its phases.
    #[error("expression evaluation failed: {0}")]
    Expression(#[from] ExprError),
    /// A binding or template reference could not be resolved.
    #[error("{0}")]
    Resolution(#[from] ResolveError),
    /// The downstream run submission failed.
    #[error("{0}")]
    Invocation(#[from] PipelineError),
    /// The external store rejected the status update.
    #[error("{0}")]
    Status(#[from] StatusError),
}

/// A custom error describing the error cases for status persistence.
#[derive(Clone, Debug, Error)]
pub enum StatusError {
    #[error("failed to update the target status: {0}")]
    UpdateFailed(String),
}

/// A status writer persists a target's status back to the external store,
/// which owns the record and serializes writers per target.
#[automock]
pub trait StatusWriter {
    fn update_status(&self, target: &RepositoryTarget) -> Result<(), StatusError>;
}

/// Whether the new poll state is persisted before or after the trigger is
/// dispatched.
///
/// [`BeforeTrigger`](PersistencePolicy::BeforeTrigger) matches the reference
/// behavior: if the trigger then fails, the state stays durable and the next
/// cycle sees "unchanged", so retriggering becomes the caller's externally
/// visible responsibility. [`AfterTrigger`](PersistencePolicy::AfterTrigger)
/// persists only after a successful dispatch, so a failed trigger is retried
/// on the next cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PersistencePolicy {
    #[default]
    BeforeTrigger,
    AfterTrigger,
}

/// Creates commit pollers per cycle, from the target's provider tag, the
/// derived API endpoint and the resolved auth token.
pub type PollerFactory = Box<dyn Fn(Provider, &str, Option<String>) -> Box<dyn CommitPoller>>;

/// The reconciler sequences one poll-diff-trigger cycle per target.
///
/// It holds no state between cycles; all shared mutable state lives in the
/// external store behind the [StatusWriter]. Many targets may be reconciled
/// in parallel, at most one cycle per target at a time.
pub struct Reconciler {
    poller_factory: PollerFactory,
    secrets: Box<dyn SecretGetter>,
    resources: Box<dyn ResourceStore>,
    pipelines: Box<dyn PipelineInvoker>,
    status: Box<dyn StatusWriter>,
    policy: PersistencePolicy,
}

impl Reconciler {
    /// Creates a new reconciler with the default HTTP pollers and the
    /// reference persistence ordering.
    pub fn new(
        secrets: Box<dyn SecretGetter>,
        resources: Box<dyn ResourceStore>,
        pipelines: Box<dyn PipelineInvoker>,
        status: Box<dyn StatusWriter>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(CALL_TIMEOUT).build();
        let poller_factory: PollerFactory = Box::new(move |provider, endpoint, token| {
            make_poller(provider, agent.clone(), endpoint, token)
        });
        Self {
            poller_factory,
            secrets,
            resources,
            pipelines,
            status,
            policy: PersistencePolicy::default(),
        }
    }

    /// Replaces how pollers are created, e.g. to stub out the network.
    pub fn with_poller_factory(mut self, poller_factory: PollerFactory) -> Self {
        self.poller_factory = poller_factory;
        self
    }

    /// Sets when the new poll state is persisted relative to the trigger.
    pub fn with_persistence_policy(mut self, policy: PersistencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs one reconciliation cycle for the target: poll, compare, and on a
    /// change persist the new state and dispatch the configured trigger.
    /// Returns the delay after which the caller should requeue the target;
    /// every cycle ends with a requeue, there is no terminal state.
    ///
    /// Poll failures are recorded on the target's status and propagated; the
    /// caller's retry policy applies, this crate never retries itself.
    pub fn reconcile(&self, target: &mut RepositoryTarget) -> Result<Duration, ReconcileError> {
        info!("Reconciling repository {}/{}.", target.namespace, target.name);

        let (coordinate, endpoint) = repo_from_url(&target.spec.url)
            .map_err(|_| ReconcileError::UrlParse(target.spec.url.clone()))?;
        let token = self.auth_token(target)?;

        target.status.poll_state.ref_ = target.spec.ref_.clone();
        let poller = (self.poller_factory)(target.spec.provider, &endpoint, token);
        let (new_state, commit) = match poller.poll(&coordinate, &target.status.poll_state) {
            Ok(polled) => polled,
            Err(err) => {
                error!(
                    "Repository poll failed for {}/{}: {err}.",
                    target.namespace, target.name
                );
                target.status.last_error = Some(err.to_string());
                if let Err(update_err) = self.status.update_status(target) {
                    error!("Unable to update the repository status: {update_err}.");
                }
                return Err(err.into());
            }
        };

        if !target.status.poll_state.changed(&new_state) {
            debug!(
                "Poll state unchanged for {}/{}, requeueing next check.",
                target.namespace, target.name
            );
            if target.status.last_error.take().is_some() {
                self.status.update_status(target)?;
            }
            return Ok(target.frequency());
        }

        info!(
            "Poll state changed for {}/{}: {} is now at {}.",
            target.namespace, target.name, new_state.ref_, new_state.sha
        );
        target.status.poll_state = new_state;
        target.status.last_error = None;

        // A changed state always carries a payload; a 304 reports unchanged.
        let commit = commit.ok_or_else(|| {
            PollError::Decode("changed poll state without a commit payload".to_string())
        })?;

        match self.policy {
            PersistencePolicy::BeforeTrigger => {
                self.status.update_status(target)?;
                self.dispatch(target, &commit)?;
            }
            PersistencePolicy::AfterTrigger => {
                self.dispatch(target, &commit)?;
                self.status.update_status(target)?;
            }
        }

        debug!(
            "Requeueing next check for {}/{}.",
            target.namespace, target.name
        );
        Ok(target.frequency())
    }

    fn auth_token(&self, target: &RepositoryTarget) -> Result<Option<String>, ReconcileError> {
        let Some(auth) = &target.spec.auth else {
            return Ok(None);
        };
        let token = self
            .secrets
            .token(&target.namespace, &auth.secret_name, &auth.secret_key)
            .map_err(|err| {
                error!(
                    "Getting the auth token failed for {}/{}: {err}.",
                    target.namespace, target.name
                );
                err
            })?;
        Ok(Some(token))
    }

    fn dispatch(&self, target: &RepositoryTarget, commit: &Commit) -> Result<(), ReconcileError> {
        match &target.spec.trigger {
            TriggerSpec::Pipeline(pipeline) => {
                let context = Context::new(&target.spec.url, commit);
                let mut params = Vec::with_capacity(pipeline.params.len());
                for spec in &pipeline.params {
                    let value = context.evaluate_to_param(&spec.expression)?;
                    params.push(Param::new(&spec.name, value));
                }

                let namespace = pipeline.namespace.as_deref().unwrap_or(&target.namespace);
                let run = self.pipelines.run(&pipeline.name, namespace, &params)?;
                info!(
                    "Pipeline run {run} created for {}/{}.",
                    target.namespace, target.name
                );
            }
            TriggerSpec::Trigger(trigger) => {
                let namespace = trigger.namespace.as_deref().unwrap_or(&target.namespace);
                let resources = resolver::resolve(
                    self.resources.as_ref(),
                    namespace,
                    &trigger.bindings,
                    &trigger.template,
                    commit,
                )?;
                self.pipelines.create_resources(namespace, &resources)?;
                info!(
                    "Created {} rendered resources for {}/{}.",
                    resources.len(),
                    target.namespace,
                    target.name
                );
            }
        }
        Ok(())
    }
}
