use mockall::automock;
use thiserror::Error;

/// A custom error describing the error cases for credential lookup.
#[derive(Clone, Debug, Error)]
pub enum SecretError {
    /// The referenced secret doesn't exist in the store.
    #[error("error getting secret {namespace}/{name}: {reason}")]
    NotFound {
        namespace: String,
        name: String,
        reason: String,
    },
    /// The secret exists but doesn't hold the requested key.
    #[error("secret invalid, no '{key}' key in {namespace}/{name}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
}

/// A secret getter looks up auth tokens in an external secret store.
///
/// The store itself lives outside this crate; implementations adapt whatever
/// platform the reconciler is embedded in.
#[automock]
pub trait SecretGetter {
    /// Returns the token stored under the given key of a namespaced secret.
    fn token(&self, namespace: &str, name: &str, key: &str) -> Result<String, SecretError>;
}
