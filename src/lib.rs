//! Poll upstream git hosting APIs for new commits and trigger pipeline runs.
//!
//! ## How it works
//!
//! `repoll` is built up from **pollers**, **resolvers** and the
//! **reconciler**. A poller asks a git hosting API (GitHub or GitLab) for the
//! current head commit of a ref, using conditional requests so unchanged refs
//! stay cheap. The reconciler compares the polled state with the last
//! recorded one and, if anything changed, turns the new commit into pipeline
//! inputs (either by evaluating small expressions over the commit payload or
//! by rendering binding/template resources) and submits a run downstream.
//!
//! ```ignore
//! +--------+       +------------+       +---------+
//! | poller | ----> | reconciler | ----> | invoker |
//! +--------+       +------------+       +---------+
//! ```
//!
//! The surrounding platform drives one reconciliation cycle per target and
//! owns all persistence; this crate holds no state between cycles.

/// The parameter evaluator, turning expressions over a commit payload into
/// typed pipeline parameter values.
pub mod expr;
/// The commit pollers that talk to upstream git hosting APIs
/// (e.g. [GitHub](poller::github::GitHubPoller) or [GitLab](poller::gitlab::GitLabPoller)).
pub mod poller;
/// The declarative trigger resolver, rendering resource documents from
/// bindings and templates.
pub mod resolver;
/// The target declaration and poll-state data model.
pub mod target;

/// The pipeline invoker boundary, where resolved runs are submitted.
pub mod pipelines;
/// The credential resolver boundary, where auth tokens are looked up.
pub mod secrets;

/// The reconciler, which sequences one poll-diff-trigger cycle per target.
pub mod reconciler;
