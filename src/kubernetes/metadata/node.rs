//! Node metadata generation.

use k8s_openapi::api::core::v1::Node;
use kube::Resource;
use serde_json::{json, Value};

use super::{Config, FieldOption, MetaGen, ResourceMetaGen};
use crate::kubernetes::Store;
use crate::mapping::{self, Mapping};

pub struct NodeMetaGen {
    resource: ResourceMetaGen,
    store: Option<Store<Node>>,
}

impl NodeMetaGen {
    pub fn new(config: Config, store: Option<Store<Node>>) -> Self {
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

impl MetaGen for NodeMetaGen {
    type Object = Node;

    fn generate(&self, obj: &Node, opts: &[FieldOption]) -> Option<Mapping> {
        let k8s = self.generate_k8s(obj, opts)?;
        let mut doc = Mapping::new();
        doc.insert("kubernetes".to_string(), Value::Object(k8s));
        mapping::deep_merge(&mut doc, &self.resource.generate_ecs());
        Some(doc)
    }

    fn generate_ecs(&self, _obj: &Node) -> Mapping {
        self.resource.generate_ecs()
    }

    fn generate_k8s(&self, obj: &Node, opts: &[FieldOption]) -> Option<Mapping> {
        let mut meta = self.resource.generate_k8s("Node", obj.meta(), opts)?;
        if let Some(hostname) = host_name(obj) {
            mapping::put(&mut meta, "node.hostname", json!(hostname));
        }
        Some(meta)
    }

    fn generate_from_name(&self, name: &str, opts: &[FieldOption]) -> Option<Mapping> {
        let node = self.store.as_ref()?.get(name)?;
        self.generate_k8s(&node, opts)
    }
}

/// The Hostname-type address from the node status, if any.
fn host_name(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == "Hostname")
        .map(|address| address.address.clone())
}
