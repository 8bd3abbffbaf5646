//! Generic resource metadata generation.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde_json::{json, Value};

use super::{
    generate_map, generate_map_subset, ClusterInfo, Config, FieldOption, MetaGen, NamespaceMetaGen,
};
use crate::kubernetes::{Store, Watchable};
use crate::mapping::{self, Mapping};

/// Owner kinds whose controlling reference is published as
/// `<kind>.name`.
const CONTROLLER_KINDS: &[&str] = &[
    "Deployment",
    "ReplicaSet",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
];

/// Builds the resource subtree shared by every kind: identity, filtered
/// labels and annotations, namespace enrichment, and controlling-owner
/// injection.
pub struct ResourceMetaGen {
    config: Config,
    cluster: ClusterInfo,
    namespace: Option<Arc<NamespaceMetaGen>>,
}

impl ResourceMetaGen {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cluster: ClusterInfo::default(),
            namespace: None,
        }
    }

    /// Attach cluster identity for ECS fields.
    pub fn with_cluster(mut self, cluster: ClusterInfo) -> Self {
        self.cluster = cluster;
        self
    }

    /// Enrich namespaced resources with the namespace generator's output.
    pub fn namespace_aware(mut self, namespace: Arc<NamespaceMetaGen>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Full document for `kind`: the kubernetes subtree plus ECS fields.
    pub fn generate(&self, kind: &str, meta: &ObjectMeta, opts: &[FieldOption]) -> Option<Mapping> {
        let k8s = self.generate_k8s(kind, meta, opts)?;
        let mut doc = Mapping::new();
        doc.insert("kubernetes".to_string(), Value::Object(k8s));
        mapping::deep_merge(&mut doc, &self.generate_ecs());
        Some(doc)
    }

    pub fn generate_ecs(&self) -> Mapping {
        let mut ecs = Mapping::new();
        if let Some(url) = &self.cluster.url {
            mapping::put(&mut ecs, "orchestrator.cluster.url", json!(url));
        }
        if let Some(name) = &self.cluster.name {
            mapping::put(&mut ecs, "orchestrator.cluster.name", json!(name));
        }
        ecs
    }

    /// The kubernetes subtree for `kind`, without the `kubernetes`
    /// prefix. Returns `None` when the object carries no name.
    pub fn generate_k8s(
        &self,
        kind: &str,
        meta: &ObjectMeta,
        opts: &[FieldOption],
    ) -> Option<Mapping> {
        let name = meta.name.clone()?;
        let uid = meta.uid.clone().unwrap_or_default();

        let empty = Default::default();
        let raw_labels = meta.labels.as_ref().unwrap_or(&empty);
        let mut labels = if self.config.include_labels.is_empty() {
            generate_map(raw_labels, self.config.labels_dedot)
        } else {
            generate_map_subset(
                raw_labels,
                &self.config.include_labels,
                self.config.labels_dedot,
                self.config.use_regex_include,
            )
        };
        if !self.config.exclude_labels.is_empty() {
            let excluded = generate_map_subset(
                raw_labels,
                &self.config.exclude_labels,
                self.config.labels_dedot,
                self.config.use_regex_exclude,
            );
            for key in excluded.keys() {
                labels.remove(key);
            }
        }

        let annotations = generate_map_subset(
            meta.annotations.as_ref().unwrap_or(&empty),
            &self.config.include_annotations,
            self.config.annotations_dedot,
            self.config.use_regex_include,
        );

        let mut doc = Mapping::new();
        mapping::put(&mut doc, &format!("{}.name", kind.to_lowercase()), json!(name));
        mapping::put(&mut doc, &format!("{}.uid", kind.to_lowercase()), json!(uid));

        if let Some(namespace) = meta.namespace.as_ref().filter(|ns| !ns.is_empty()) {
            doc.insert("namespace".to_string(), json!(namespace));
            if let Some(ns_gen) = &self.namespace {
                if let Some(ns_meta) = ns_gen.generate_from_name(namespace, &[]) {
                    mapping::deep_merge(&mut doc, &ns_meta);
                }
            }
        }

        for owner in meta.owner_references.as_deref().unwrap_or_default() {
            if owner.controller == Some(true) && CONTROLLER_KINDS.contains(&owner.kind.as_str()) {
                mapping::put(
                    &mut doc,
                    &format!("{}.name", owner.kind.to_lowercase()),
                    json!(owner.name),
                );
            }
        }

        if !labels.is_empty() {
            doc.insert("labels".to_string(), Value::Object(labels));
        }
        if !annotations.is_empty() {
            doc.insert("annotations".to_string(), Value::Object(annotations));
        }

        for opt in opts {
            opt(&mut doc);
        }
        Some(doc)
    }
}

/// Standard-subtree generator for a concrete kind, with cache-store
/// lookups for `generate_from_name`.
pub struct KindMetaGen<K> {
    kind: String,
    resource: ResourceMetaGen,
    store: Option<Store<K>>,
}

impl<K: Watchable> KindMetaGen<K> {
    pub fn new(config: Config, store: Option<Store<K>>) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            resource: ResourceMetaGen::new(config),
            store,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterInfo) -> Self {
        self.resource = self.resource.with_cluster(cluster);
        self
    }

    pub fn namespace_aware(mut self, namespace: Arc<NamespaceMetaGen>) -> Self {
        self.resource = self.resource.namespace_aware(namespace);
        self
    }
}

impl<K: Watchable> MetaGen for KindMetaGen<K> {
    type Object = K;

    fn generate(&self, obj: &K, opts: &[FieldOption]) -> Option<Mapping> {
        self.resource.generate(&self.kind, obj.meta(), opts)
    }

    fn generate_ecs(&self, _obj: &K) -> Mapping {
        self.resource.generate_ecs()
    }

    fn generate_k8s(&self, obj: &K, opts: &[FieldOption]) -> Option<Mapping> {
        self.resource.generate_k8s(&self.kind, obj.meta(), opts)
    }

    fn generate_from_name(&self, key: &str, opts: &[FieldOption]) -> Option<Mapping> {
        let obj = self.store.as_ref()?.get(key)?;
        self.generate_k8s(&obj, opts)
    }
}
