//! Metadata generation for Kubernetes resources.
//!
//! Generators are pure projections: they turn a resource object (plus
//! cross-referenced namespace and owner objects looked up through cache
//! stores) into a flat document with a `kubernetes` subtree and optional
//! ECS cluster fields. Downstream pipelines attach these documents to
//! every event collected from the workload.

mod namespace;
mod node;
mod pod;
mod resource;

pub use namespace::NamespaceMetaGen;
pub use node::NodeMetaGen;
pub use pod::{with_container, PodMetaGen};
pub use resource::{KindMetaGen, ResourceMetaGen};

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::mapping::{self, Mapping};

/// Post-construction mutator applied to a generated document.
pub type FieldOption = Box<dyn Fn(&mut Mapping) + Send + Sync>;

/// Field option that deep-merges extra fields into the document.
pub fn with_fields(extra: Mapping) -> FieldOption {
    Box::new(move |doc| mapping::deep_merge(doc, &extra))
}

/// Label and annotation filtering knobs.
///
/// An empty `include_labels` includes every label; annotations are
/// opt-in only. The regex flags switch key matching from exact to
/// pattern-based.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub include_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub include_annotations: Vec<String>,
    pub labels_dedot: bool,
    pub annotations_dedot: bool,
    pub use_regex_include: bool,
    pub use_regex_exclude: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
            include_annotations: Vec::new(),
            labels_dedot: true,
            annotations_dedot: true,
            use_regex_include: false,
            use_regex_exclude: false,
        }
    }
}

/// Cluster identity published under the ECS `orchestrator.cluster`
/// fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterInfo {
    pub name: Option<String>,
    pub url: Option<String>,
}

/// One metadata generator per resource kind.
pub trait MetaGen {
    type Object;

    /// Full document: `kubernetes` subtree plus ECS cluster fields.
    fn generate(&self, obj: &Self::Object, opts: &[FieldOption]) -> Option<Mapping>;

    /// ECS cluster fields only.
    fn generate_ecs(&self, obj: &Self::Object) -> Mapping;

    /// The kubernetes subtree, without the `kubernetes` prefix.
    fn generate_k8s(&self, obj: &Self::Object, opts: &[FieldOption]) -> Option<Mapping>;

    /// Generate from a cache-store lookup by resource key.
    fn generate_from_name(&self, key: &str, opts: &[FieldOption]) -> Option<Mapping>;
}

/// Project every entry of a string map into a document, dedotting keys
/// when asked.
pub(crate) fn generate_map(input: &BTreeMap<String, String>, dedot: bool) -> Mapping {
    let mut output = Mapping::new();
    for (key, value) in input {
        let key = if dedot { mapping::dedot(key) } else { key.clone() };
        output.insert(key, Value::String(value.clone()));
    }
    output
}

/// Project the subset of a string map whose keys match `keys`: exact
/// matches, or regex matches when `use_regex` is set. Patterns that fail
/// to compile are skipped.
pub(crate) fn generate_map_subset(
    input: &BTreeMap<String, String>,
    keys: &[String],
    dedot: bool,
    use_regex: bool,
) -> Mapping {
    let mut output = Mapping::new();
    for key in keys {
        if use_regex {
            let pattern = match regex::Regex::new(key) {
                Ok(pattern) => pattern,
                Err(err) => {
                    tracing::debug!(pattern = %key, error = %err, "skipping unparseable match pattern");
                    continue;
                }
            };
            for (label, value) in input {
                if pattern.is_match(label) {
                    let label = if dedot { mapping::dedot(label) } else { label.clone() };
                    output.insert(label, Value::String(value.clone()));
                }
            }
        } else if let Some(value) = input.get(key) {
            let key = if dedot { mapping::dedot(key) } else { key.clone() };
            output.insert(key, Value::String(value.clone()));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> BTreeMap<String, String> {
        [
            ("nottomatch", "no"),
            ("foo", "bar"),
            ("foo1", "bar1"),
            ("foo2", "bar2"),
            ("foo-example", "bar-example"),
            ("test", "test1"),
            ("footest", "footest1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_generate_map_subset_exact() {
        let output = generate_map_subset(&labels(), &["foo".to_string()], false, false);
        assert_eq!(output.len(), 1);
        assert_eq!(output.get("foo"), Some(&serde_json::json!("bar")));
    }

    #[test]
    fn test_generate_map_subset_regex() {
        let output = generate_map_subset(&labels(), &["^foo".to_string()], false, true);
        assert_eq!(output.len(), 5);
        assert!(output.contains_key("foo-example"));
        assert!(output.contains_key("footest"));
        assert!(!output.contains_key("test"));

        let anchored = generate_map_subset(&labels(), &["test$".to_string()], false, true);
        assert_eq!(anchored.len(), 2);
        assert!(anchored.contains_key("test"));
        assert!(anchored.contains_key("footest"));
    }

    #[test]
    fn test_generate_map_subset_bad_pattern_is_skipped() {
        let output = generate_map_subset(&labels(), &["(".to_string()], false, true);
        assert!(output.is_empty());
    }

    #[test]
    fn test_generate_map_dedot() {
        let input: BTreeMap<String, String> =
            [("app.kubernetes.io/name".to_string(), "no".to_string())]
                .into_iter()
                .collect();
        let output = generate_map(&input, true);
        assert!(output.contains_key("app_kubernetes_io/name"));
    }
}
