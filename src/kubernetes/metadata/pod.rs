//! Pod metadata generation.
//!
//! Pods get the richest documents: besides the standard resource subtree
//! they resolve their controlling owner transitively (ReplicaSet to
//! Deployment, Job to CronJob) through cache stores, merge node metadata,
//! and accept container identity injection via [`with_container`].

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde_json::{json, Value};

use super::{ClusterInfo, Config, FieldOption, MetaGen, NamespaceMetaGen, NodeMetaGen, ResourceMetaGen};
use crate::kubernetes::Store;
use crate::mapping::{self, Mapping};

pub struct PodMetaGen {
    resource: ResourceMetaGen,
    store: Option<Store<Pod>>,
    replicasets: Option<Store<ReplicaSet>>,
    jobs: Option<Store<Job>>,
    node: Option<Arc<NodeMetaGen>>,
}

impl PodMetaGen {
    pub fn new(config: Config) -> Self {
        Self {
            resource: ResourceMetaGen::new(config),
            store: None,
            replicasets: None,
            jobs: None,
            node: None,
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

    /// Pod cache store backing `generate_from_name`.
    pub fn with_store(mut self, store: Store<Pod>) -> Self {
        self.store = Some(store);
        self
    }

    /// ReplicaSet store used to resolve the owning Deployment.
    pub fn with_replicasets(mut self, replicasets: Store<ReplicaSet>) -> Self {
        self.replicasets = Some(replicasets);
        self
    }

    /// Job store used to resolve the owning CronJob.
    pub fn with_jobs(mut self, jobs: Store<Job>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Node generator merged into pod documents via `spec.nodeName`.
    pub fn with_node(mut self, node: Arc<NodeMetaGen>) -> Self {
        self.node = Some(node);
        self
    }

    /// Follow the pod's controlling owner one level further: a ReplicaSet
    /// owner names its Deployment, a Job owner names its CronJob.
    fn resolve_transitive_owners(&self, pod: &Pod, meta: &mut Mapping) {
        let namespace = pod.meta().namespace.clone().unwrap_or_default();
        for owner in pod.meta().owner_references.as_deref().unwrap_or_default() {
            if owner.controller != Some(true) {
                continue;
            }
            match owner.kind.as_str() {
                "ReplicaSet" => {
                    if let Some(replicasets) = &self.replicasets {
                        let key = format!("{namespace}/{}", owner.name);
                        if let Some(rs) = replicasets.get(&key) {
                            if let Some(deployment) = controlling_owner(rs.meta(), "Deployment") {
                                mapping::put(meta, "deployment.name", json!(deployment));
                            }
                        }
                    }
                }
                "Job" => {
                    if let Some(jobs) = &self.jobs {
                        let key = format!("{namespace}/{}", owner.name);
                        if let Some(job) = jobs.get(&key) {
                            if let Some(cronjob) = controlling_owner(job.meta(), "CronJob") {
                                mapping::put(meta, "cronjob.name", json!(cronjob));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl MetaGen for PodMetaGen {
    type Object = Pod;

    fn generate(&self, obj: &Pod, opts: &[FieldOption]) -> Option<Mapping> {
        let k8s = self.generate_k8s(obj, opts)?;
        let mut doc = Mapping::new();
        doc.insert("kubernetes".to_string(), Value::Object(k8s));
        mapping::deep_merge(&mut doc, &self.resource.generate_ecs());
        Some(doc)
    }

    fn generate_ecs(&self, _obj: &Pod) -> Mapping {
        self.resource.generate_ecs()
    }

    fn generate_k8s(&self, obj: &Pod, opts: &[FieldOption]) -> Option<Mapping> {
        let mut meta = self.resource.generate_k8s("Pod", obj.meta(), opts)?;
        self.resolve_transitive_owners(obj, &mut meta);

        if let Some(node_gen) = &self.node {
            let node_name = obj.spec.as_ref().and_then(|spec| spec.node_name.as_deref());
            if let Some(node_name) = node_name {
                if let Some(node_meta) = node_gen.generate_from_name(node_name, &[]) {
                    mapping::deep_merge(&mut meta, &node_meta);
                }
            }
        }
        Some(meta)
    }

    fn generate_from_name(&self, key: &str, opts: &[FieldOption]) -> Option<Mapping> {
        let pod = self.store.as_ref()?.get(key)?;
        self.generate_k8s(&pod, opts)
    }
}

fn controlling_owner(meta: &ObjectMeta, kind: &str) -> Option<String> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| owner.controller == Some(true) && owner.kind == kind)
        .map(|owner| owner.name.clone())
}

/// Field option injecting container identity (name, image, id, runtime)
/// into a pod document.
pub fn with_container(name: &str, image: &str, id: &str, runtime: &str) -> FieldOption {
    let mut container = Mapping::new();
    container.insert("name".to_string(), json!(name));
    container.insert("image".to_string(), json!(image));
    container.insert("id".to_string(), json!(id));
    container.insert("runtime".to_string(), json!(runtime));
    Box::new(move |doc| {
        doc.insert("container".to_string(), Value::Object(container.clone()));
    })
}
