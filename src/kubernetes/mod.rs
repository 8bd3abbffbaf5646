//! Kubernetes resource watching, metadata generation, and secret lookups.
//!
//! The watcher drives a `kube` watch stream per resource kind, maintains a
//! read-only cache store keyed by `namespace/name`, and dispatches add,
//! update, and delete events to a registered handler through a work queue.
//! The metadata module projects cached objects into flat documents for
//! downstream pipelines; the keystore module resolves
//! `kubernetes.<namespace>.<secret>.<field>` references against the API
//! server.

pub mod keystore;
pub mod metadata;
pub mod resource;
pub mod watcher;

pub use keystore::{KeystoreRegistry, NamespaceKeystore, SecureValue};
pub use resource::{resource_key, Watchable};
pub use watcher::{
    EventHandlerFns, NoOpEventHandler, ResourceEventHandler, Store, WatchOptions, Watcher,
    WatcherError,
};
