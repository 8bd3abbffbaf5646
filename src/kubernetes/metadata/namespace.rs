//! Namespace metadata generation.
//!
//! Namespace output is flattened into `namespace`, `namespace_uid`,
//! `namespace_labels`, and `namespace_annotations` so that it can be
//! deep-merged straight into the document of any namespaced resource.

use k8s_openapi::api::core::v1::Namespace;
use kube::Resource;
use serde_json::Value;

use super::{Config, FieldOption, MetaGen, ResourceMetaGen};
use crate::kubernetes::Store;
use crate::mapping::{self, Mapping};

pub struct NamespaceMetaGen {
    resource: ResourceMetaGen,
    store: Option<Store<Namespace>>,
}

impl NamespaceMetaGen {
    pub fn new(config: Config, store: Option<Store<Namespace>>) -> Self {
        Self {
            resource: ResourceMetaGen::new(config),
            store,
        }
    }

    pub fn with_cluster(mut self, cluster: super::ClusterInfo) -> Self {
        self.resource = self.resource.with_cluster(cluster);
        self
    }
}

impl MetaGen for NamespaceMetaGen {
    type Object = Namespace;

    fn generate(&self, obj: &Namespace, opts: &[FieldOption]) -> Option<Mapping> {
        let k8s = self.generate_k8s(obj, opts)?;
        let mut doc = Mapping::new();
        doc.insert("kubernetes".to_string(), Value::Object(k8s));
        mapping::deep_merge(&mut doc, &self.resource.generate_ecs());
        Some(doc)
    }

    fn generate_ecs(&self, _obj: &Namespace) -> Mapping {
        self.resource.generate_ecs()
    }

    fn generate_k8s(&self, obj: &Namespace, opts: &[FieldOption]) -> Option<Mapping> {
        let meta = self.resource.generate_k8s("Namespace", obj.meta(), opts)?;
        Some(flatten(meta))
    }

    fn generate_from_name(&self, name: &str, opts: &[FieldOption]) -> Option<Mapping> {
        let namespace = self.store.as_ref()?.get(name)?;
        self.generate_k8s(&namespace, opts)
    }
}

/// Rewrite the standard resource subtree into the flattened namespace
/// form expected by consumers merging it into other documents.
fn flatten(mut meta: Mapping) -> Mapping {
    let mut flat = Mapping::new();
    if let Some(Value::Object(identity)) = meta.remove("namespace") {
        if let Some(name) = identity.get("name") {
            flat.insert("namespace".to_string(), name.clone());
        }
        if let Some(uid) = identity.get("uid") {
            flat.insert("namespace_uid".to_string(), uid.clone());
        }
    }
    if let Some(labels) = meta.remove("labels") {
        flat.insert("namespace_labels".to_string(), labels);
    }
    if let Some(annotations) = meta.remove("annotations") {
        flat.insert("namespace_annotations".to_string(), annotations);
    }
    // Anything a field option added rides along unchanged.
    for (key, value) in meta {
        flat.insert(key, value);
    }
    flat
}
