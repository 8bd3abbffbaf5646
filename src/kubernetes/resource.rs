//! Per-kind list/watch wiring.
//!
//! Each supported resource kind knows how to build its own filtered watch
//! stream: Pods are filtered to a node via `spec.nodeName`, the Node and
//! Namespace singletons are filtered by `metadata.name`, and namespaced
//! kinds honor a namespace scope. The metadata-only variant of every kind
//! watches `PartialObjectMeta` through a metadata client stream.

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use kube::core::PartialObjectMeta;
use kube::runtime::metadata_watcher;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};

/// The key a resource is cached under: `namespace/name`, or `name` alone
/// for cluster-scoped resources.
pub fn resource_key<K: kube::Resource>(obj: &K) -> String {
    let name = obj.name_any();
    match obj.namespace() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name,
    }
}

/// A resource kind the watcher can drive.
///
/// The set of implementations is the supported-kind registry: each one
/// supplies kind-appropriate list/watch filters. `CACHES_PREVIOUS` marks
/// the kinds (Node, Namespace) that retain the pre-update object for
/// [`Watcher::cached_object`](super::Watcher::cached_object).
pub trait Watchable:
    kube::Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const CACHES_PREVIOUS: bool = false;

    /// Build the filtered watch stream for this kind.
    fn watch_stream(
        client: Client,
        node: Option<&str>,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>>;
}

fn name_filter(name: Option<&str>) -> watcher::Config {
    let config = watcher::Config::default().any_semantic();
    match name {
        Some(name) => config.fields(&format!("metadata.name={name}")),
        None => config,
    }
}

impl Watchable for Pod {
    fn watch_stream(
        client: Client,
        node: Option<&str>,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        let mut config = watcher::Config::default().any_semantic();
        if let Some(node) = node {
            config = config.fields(&format!("spec.nodeName={node}"));
        }
        let api: Api<Pod> = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        watcher::watcher(api, config).boxed()
    }
}

impl Watchable for PartialObjectMeta<Pod> {
    fn watch_stream(
        client: Client,
        node: Option<&str>,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        let mut config = watcher::Config::default().any_semantic();
        if let Some(node) = node {
            config = config.fields(&format!("spec.nodeName={node}"));
        }
        let api: Api<Pod> = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        metadata_watcher(api, config).boxed()
    }
}

impl Watchable for Node {
    const CACHES_PREVIOUS: bool = true;

    fn watch_stream(
        client: Client,
        node: Option<&str>,
        _namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        watcher::watcher(Api::<Node>::all(client), name_filter(node)).boxed()
    }
}

impl Watchable for PartialObjectMeta<Node> {
    const CACHES_PREVIOUS: bool = true;

    fn watch_stream(
        client: Client,
        node: Option<&str>,
        _namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        metadata_watcher(Api::<Node>::all(client), name_filter(node)).boxed()
    }
}

impl Watchable for Namespace {
    const CACHES_PREVIOUS: bool = true;

    fn watch_stream(
        client: Client,
        _node: Option<&str>,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        watcher::watcher(Api::<Namespace>::all(client), name_filter(namespace)).boxed()
    }
}

impl Watchable for PartialObjectMeta<Namespace> {
    const CACHES_PREVIOUS: bool = true;

    fn watch_stream(
        client: Client,
        _node: Option<&str>,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
        metadata_watcher(Api::<Namespace>::all(client), name_filter(namespace)).boxed()
    }
}

/// Wires a plain namespaced kind: namespace-scoped when a namespace is
/// set, cluster-wide otherwise, with a metadata-only variant alongside.
macro_rules! impl_watchable_namespaced {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl Watchable for $kind {
                fn watch_stream(
                    client: Client,
                    _node: Option<&str>,
                    namespace: Option<&str>,
                ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
                    let api: Api<$kind> = match namespace {
                        Some(namespace) => Api::namespaced(client, namespace),
                        None => Api::all(client),
                    };
                    watcher::watcher(api, watcher::Config::default().any_semantic()).boxed()
                }
            }

            impl Watchable for PartialObjectMeta<$kind> {
                fn watch_stream(
                    client: Client,
                    _node: Option<&str>,
                    namespace: Option<&str>,
                ) -> BoxStream<'static, Result<Event<Self>, watcher::Error>> {
                    let api: Api<$kind> = match namespace {
                        Some(namespace) => Api::namespaced(client, namespace),
                        None => Api::all(client),
                    };
                    metadata_watcher(api, watcher::Config::default().any_semantic()).boxed()
                }
            }
        )+
    };
}

impl_watchable_namespaced!(
    Deployment,
    ReplicaSet,
    StatefulSet,
    DaemonSet,
    Service,
    Job,
    CronJob,
);
