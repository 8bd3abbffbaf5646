//! Workload autodiscovery for observability agents.
//!
//! This crate continuously learns which containers and orchestrator
//! resources exist on a host or in a cluster, maintains an in-memory view
//! of their identity and metadata, and notifies subscribers (log and
//! metric collectors) when workloads appear, change, or disappear.
//!
//! ## Architecture
//!
//! 1. **Container watcher** (`docker` module) - tracks containers through
//!    the runtime's list/stream API, keeps a live map, and defers deletion
//!    so that enrichment lookups racing a container's death still succeed.
//!
//! 2. **Resource watcher** (`kubernetes` module) - a work-queue-driven
//!    watcher over Kubernetes resources built on `kube`'s watch streams,
//!    with per-key event dispatch, resync handling, and a read-only cache
//!    store.
//!
//! 3. **Metadata generation** (`kubernetes::metadata` module) - pure
//!    projection of resource objects (plus cross-referenced namespace and
//!    owner objects) into flat metadata documents for downstream
//!    pipelines.
//!
//! 4. **Hint parsing** (`hints` module) - mines container and pod
//!    annotations for collector directives and validates them against a
//!    supported vocabulary.
//!
//! The crate emits `tracing` events but never installs a subscriber;
//! consumers own the logging pipeline.

pub mod docker;
pub mod hints;
pub mod kubernetes;
pub mod mapping;
