use crate::poller::Commit;
use crate::target::{BindingRef, BindingScope, TemplateRef};
use mockall::automock;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// A custom error describing the error cases for trigger resolution.
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    /// The referenced binding doesn't exist in the resource store.
    #[error("failed to resolve trigger: binding '{0}' not found")]
    MissingBinding(String),
    /// The referenced template doesn't exist in the resource store.
    #[error("failed to resolve trigger: template '{0}' not found")]
    MissingTemplate(String),
    /// A placeholder referenced a path or parameter that doesn't exist.
    #[error("failed to resolve trigger: {0}")]
    Substitution(String),
}

/// A binding parameter: a name and a value that may embed `$(body.<path>)`
/// placeholders into the commit payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingParam {
    pub name: String,
    pub value: String,
}

/// A named mapping from commit-payload paths to parameter names, fetched from
/// the external resource store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub params: Vec<BindingParam>,
}

/// A named set of resource document skeletons containing `$(params.<name>)`
/// placeholders, fetched from the external resource store.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    pub name: String,
    pub resource_templates: Vec<Value>,
}

/// A resource store serves bindings and templates by name. The store itself
/// lives outside this crate.
#[automock]
pub trait ResourceStore {
    /// Fetches a binding, from the namespace or the cluster scope per its
    /// declared scope.
    fn binding(
        &self,
        namespace: &str,
        name: &str,
        scope: BindingScope,
    ) -> Result<Binding, ResolveError>;

    /// Fetches a namespaced template.
    fn template(&self, namespace: &str, name: &str) -> Result<Template, ResolveError>;
}

/// Resolves a trigger into fully rendered resource documents.
///
/// Every referenced binding is fetched and its parameters are evaluated
/// against the commit payload; the merged parameter set (declaration order,
/// later bindings override earlier ones on name collision) is substituted
/// into each of the template's resource documents. Any missing reference or
/// failed substitution aborts the whole resolve.
pub fn resolve(
    store: &dyn ResourceStore,
    namespace: &str,
    binding_refs: &[BindingRef],
    template_ref: &TemplateRef,
    commit: &Commit,
) -> Result<Vec<Value>, ResolveError> {
    let payload = Value::Object(commit.clone());

    let mut params: HashMap<String, String> = HashMap::new();
    for binding_ref in binding_refs {
        let binding = store.binding(namespace, &binding_ref.name, binding_ref.scope)?;
        for param in binding.params {
            let value = expand_body_refs(&param.value, &payload)?;
            params.insert(param.name, value);
        }
    }

    let template = store.template(namespace, &template_ref.name)?;
    template
        .resource_templates
        .iter()
        .map(|resource| substitute_params(resource, &params))
        .collect()
}

/// Replaces every `$(body.<path>)` placeholder in a binding value with the
/// matching field of the commit payload. `$(body)` stands for the whole
/// payload.
fn expand_body_refs(value: &str, payload: &Value) -> Result<String, ResolveError> {
    expand_placeholders(value, |reference| {
        let path = match reference.strip_prefix("body") {
            Some("") => "",
            Some(path) if path.starts_with('.') => &path[1..],
            _ => return Ok(None),
        };
        let found = lookup_path(payload, path).ok_or_else(|| {
            ResolveError::Substitution(format!("no value for $({reference}) in the payload"))
        })?;
        Ok(Some(stringify(found)))
    })
}

/// Replaces every `$(params.<name>)` placeholder in the document's strings
/// with the matching resolved parameter.
fn substitute_params(
    resource: &Value,
    params: &HashMap<String, String>,
) -> Result<Value, ResolveError> {
    match resource {
        Value::String(s) => {
            let replaced = expand_placeholders(s, |reference| match reference.strip_prefix("params.") {
                Some(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        ResolveError::Substitution(format!(
                            "no parameter for $(params.{name}) in the bindings"
                        ))
                    })?;
                    Ok(Some(value.clone()))
                }
                None => Ok(None),
            })?;
            Ok(Value::String(replaced))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_params(item, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), substitute_params(value, params)?)))
            .collect::<Result<serde_json::Map<_, _>, ResolveError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Scans a string for `$(...)` placeholders and replaces the ones the lookup
/// recognizes; unknown placeholders are left untouched.
fn expand_placeholders(
    input: &str,
    lookup: impl Fn(&str) -> Result<Option<String>, ResolveError>,
) -> Result<String, ResolveError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("$(") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                let reference = &after[..end];
                match lookup(reference)? {
                    Some(value) => output.push_str(&value),
                    None => {
                        output.push_str("$(");
                        output.push_str(reference);
                        output.push(')');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    Ok(output)
}

fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(payload);
    }
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

// Strings substitute without quotes, everything else as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
