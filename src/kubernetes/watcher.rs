//! Work-queue-driven watcher over Kubernetes resources.
//!
//! The watch task applies stream events to a cache store and enqueues
//! keyed work items; a single supervised worker drains the queue and
//! dispatches the fresh cache object to the registered event handler.
//! Resyncs re-deliver cached objects: with the default `is_updated`
//! (resource-version comparison) they are either dropped or, when
//! `honor_resyncs` is set, requeued as idempotent adds so that consumers
//! dedupe them instead of churning through pseudo-updates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::Event;
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::resource::{resource_key, Watchable};

/// Delay before restarting the dispatch worker after a crash.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Default bound for the initial cache sync, also used as the resync
/// period.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors surfaced by [`Watcher::start`].
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("watcher already started")]
    AlreadyStarted,
    #[error("timed out waiting for initial cache sync")]
    SyncTimeout,
    #[error("watch stream terminated before initial cache sync")]
    SyncFailed,
}

/// Decides whether a delivered object amounts to a real update.
pub type IsUpdated<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Reshapes an object before it enters the cache.
pub type Transform<K> = Arc<dyn Fn(K) -> K + Send + Sync>;

/// Watch behavior knobs.
#[derive(Clone)]
pub struct WatchOptions<K> {
    /// Bound for the initial cache sync; also the resync period.
    pub sync_timeout: Duration,
    /// Restrict watched Pods to this node (`spec.nodeName` filter); for
    /// the Node kind, watch only the node with this name.
    pub node: Option<String>,
    /// Restrict watched resources to this namespace; for the Namespace
    /// kind, watch only the namespace with this name.
    pub namespace: Option<String>,
    /// Requeue resyncs as idempotent adds instead of dropping them.
    pub honor_resyncs: bool,
    /// Override for update detection; defaults to resource-version
    /// inequality.
    pub is_updated: Option<IsUpdated<K>>,
    /// Optional reshape hook applied before an object enters the cache.
    pub transform: Option<Transform<K>>,
}

impl<K> Default for WatchOptions<K> {
    fn default() -> Self {
        Self {
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            node: None,
            namespace: None,
            honor_resyncs: false,
            is_updated: None,
            transform: None,
        }
    }
}

/// Handles dispatched resource events. Callbacks run on the worker task
/// and must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _obj: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Handler installed until the consumer registers its own.
pub struct NoOpEventHandler;

impl<K> ResourceEventHandler<K> for NoOpEventHandler {}

/// Closure-based handler adapter.
pub struct EventHandlerFns<K> {
    pub on_add: Option<Box<dyn Fn(&K) + Send + Sync>>,
    pub on_update: Option<Box<dyn Fn(&K) + Send + Sync>>,
    pub on_delete: Option<Box<dyn Fn(&K) + Send + Sync>>,
}

impl<K> Default for EventHandlerFns<K> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_delete: None,
        }
    }
}

impl<K> ResourceEventHandler<K> for EventHandlerFns<K>
where
    K: Send + Sync,
{
    fn on_add(&self, obj: &K) {
        if let Some(f) = &self.on_add {
            f(obj);
        }
    }

    fn on_update(&self, obj: &K) {
        if let Some(f) = &self.on_update {
            f(obj);
        }
    }

    fn on_delete(&self, obj: &K) {
        if let Some(f) = &self.on_delete {
            f(obj);
        }
    }
}

/// Read-only keyed view over the watcher's cache. Lookups clone the
/// cached object, so holders never block the watch task.
pub struct Store<K> {
    inner: Arc<RwLock<HashMap<String, K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Clone> Store<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &str) -> Option<K> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn insert(&self, key: String, obj: K) -> Option<K> {
        self.inner.write().unwrap().insert(key, obj)
    }

    pub fn remove(&self, key: &str) -> Option<K> {
        self.inner.write().unwrap().remove(key)
    }

    fn keys(&self) -> HashSet<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(String, K)> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<K: Clone> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ItemState {
    Add,
    Update,
    Delete,
}

struct WorkItem<K> {
    key: String,
    /// Snapshot taken at event time, used when the object has already
    /// vanished from the store (delete tombstones).
    object: Option<K>,
    state: ItemState,
}

struct Shared<K: Watchable> {
    store: Store<K>,
    handler: RwLock<Arc<dyn ResourceEventHandler<K>>>,
    cached_object: RwLock<Option<K>>,
    queue: mpsc::UnboundedSender<WorkItem<K>>,
    honor_resyncs: bool,
    is_updated: IsUpdated<K>,
    transform: Option<Transform<K>>,
    synced: watch::Sender<bool>,
}

impl<K: Watchable> Shared<K> {
    fn enqueue(&self, key: String, object: Option<K>, state: ItemState) {
        let _ = self.queue.send(WorkItem { key, object, state });
    }
}

fn default_is_updated<K: Watchable>() -> IsUpdated<K> {
    Arc::new(|old: &K, new: &K| old.resource_version() != new.resource_version())
}

/// Apply one watch-stream event to the cache and work queue.
///
/// `pending_reinit` carries the keys seen before a re-list began; keys
/// still unaccounted for at `InitDone` vanished while the watch was down
/// and are delivered as deletes.
fn apply_watch_event<K: Watchable>(
    shared: &Shared<K>,
    pending_reinit: &mut Option<HashSet<String>>,
    event: Event<K>,
) {
    match event {
        Event::Init => {
            *pending_reinit = Some(shared.store.keys());
        }
        Event::InitApply(obj) | Event::Apply(obj) => {
            let obj = match &shared.transform {
                Some(transform) => transform(obj),
                None => obj,
            };
            let key = resource_key(&obj);
            if let Some(pending) = pending_reinit {
                pending.remove(&key);
            }
            match shared.store.insert(key.clone(), obj.clone()) {
                None => shared.enqueue(key, Some(obj), ItemState::Add),
                Some(old) => handle_update(shared, key, old, obj),
            }
        }
        Event::Delete(obj) => {
            let key = resource_key(&obj);
            shared.store.remove(&key);
            shared.enqueue(key, Some(obj), ItemState::Delete);
        }
        Event::InitDone => {
            if let Some(stale) = pending_reinit.take() {
                for key in stale {
                    if let Some(obj) = shared.store.remove(&key) {
                        tracing::debug!(key = %key, "object vanished during relist, delivering delete");
                        shared.enqueue(key, Some(obj), ItemState::Delete);
                    }
                }
            }
            let _ = shared.synced.send(true);
        }
    }
}

fn handle_update<K: Watchable>(shared: &Shared<K>, key: String, old: K, new: K) {
    if K::CACHES_PREVIOUS {
        *shared.cached_object.write().unwrap() = Some(old.clone());
    }
    if (shared.is_updated)(&old, &new) {
        shared.enqueue(key, Some(new), ItemState::Update);
    } else if shared.honor_resyncs {
        // A resync is a re-list, not a state change. Requeueing it as an
        // add keeps already-running consumers deduped instead of cycling
        // them through stop/start on every period.
        shared.enqueue(key, Some(new), ItemState::Add);
    }
}

/// Pop-and-dispatch body of the single logical worker.
fn process_item<K: Watchable>(shared: &Shared<K>, item: WorkItem<K>) {
    let handler = shared.handler.read().unwrap().clone();
    match shared.store.get(&item.key) {
        None => {
            if item.state == ItemState::Delete {
                if let Some(obj) = &item.object {
                    tracing::debug!(key = %item.key, "object not in store, delivering delete from snapshot");
                    handler.on_delete(obj);
                }
            }
        }
        Some(fresh) => match item.state {
            ItemState::Add => handler.on_add(&fresh),
            ItemState::Update => handler.on_update(&fresh),
            ItemState::Delete => handler.on_delete(&fresh),
        },
    }
}

async fn run_worker<K: Watchable>(
    shared: Arc<Shared<K>>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem<K>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = shutdown.changed() => return,
                item = rx.recv() => item,
            }
        };
        match item {
            Some(item) => process_item(&shared, item),
            None => return,
        }
    }
}

/// Watches one Kubernetes resource kind and dispatches keyed events.
pub struct Watcher<K: Watchable> {
    client: Client,
    shared: Arc<Shared<K>>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem<K>>>>,
    sync_timeout: Duration,
    node: Option<String>,
    namespace: Option<String>,
    shutdown: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: Watchable> Watcher<K> {
    pub fn new(client: Client, opts: WatchOptions<K>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            store: Store::new(),
            handler: RwLock::new(Arc::new(NoOpEventHandler) as Arc<dyn ResourceEventHandler<K>>),
            cached_object: RwLock::new(None),
            queue: queue_tx,
            honor_resyncs: opts.honor_resyncs,
            is_updated: opts.is_updated.unwrap_or_else(default_is_updated),
            transform: opts.transform,
            synced: synced_tx,
        });

        Self {
            client,
            shared,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            sync_timeout: opts.sync_timeout,
            node: opts.node,
            namespace: opts.namespace,
            shutdown,
            synced_rx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Launch the watch task and worker; blocks until the initial list
    /// has been applied to the cache or `sync_timeout` elapses.
    pub async fn start(&self) -> Result<(), WatcherError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatcherError::AlreadyStarted);
        }

        let mut stream =
            K::watch_stream(self.client.clone(), self.node.as_deref(), self.namespace.as_deref());

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let watch_task = tokio::spawn(async move {
            let mut pending_reinit: Option<HashSet<String>> = None;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => apply_watch_event(&shared, &mut pending_reinit, event),
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "watch stream error, backing off");
                        }
                        None => {
                            tracing::debug!("watch stream ended");
                            return;
                        }
                    },
                }
            }
        });

        let mut synced = self.synced_rx.clone();
        match tokio::time::timeout(self.sync_timeout, synced.wait_for(|synced| *synced)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                watch_task.abort();
                return Err(WatcherError::SyncFailed);
            }
            Err(_) => {
                watch_task.abort();
                return Err(WatcherError::SyncTimeout);
            }
        }
        tracing::debug!("cache sync done");

        let worker = tokio::spawn(supervise_worker(
            Arc::clone(&self.shared),
            Arc::clone(&self.queue_rx),
            self.shutdown.subscribe(),
        ));
        let resync = tokio::spawn(run_resync(
            Arc::clone(&self.shared),
            self.sync_timeout,
            self.shutdown.subscribe(),
        ));

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(watch_task);
        tasks.push(worker);
        tasks.push(resync);
        Ok(())
    }

    /// Shut down the work queue and all tasks.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }

    /// Set the active event handler, replacing the no-op default.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        *self.shared.handler.write().unwrap() = handler;
    }

    pub fn event_handler(&self) -> Arc<dyn ResourceEventHandler<K>> {
        self.shared.handler.read().unwrap().clone()
    }

    /// Read-only cache store, keyed by `namespace/name`.
    pub fn store(&self) -> Store<K> {
        self.shared.store.clone()
    }

    /// The underlying client handle.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The previous version of the object from the last update event.
    /// Only the Node and Namespace kinds retain it; other kinds return
    /// `None`. Overwritten on every update.
    pub fn cached_object(&self) -> Option<K> {
        self.shared.cached_object.read().unwrap().clone()
    }
}

async fn supervise_worker<K: Watchable>(
    shared: Arc<Shared<K>>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem<K>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let handle = tokio::spawn(run_worker(
            Arc::clone(&shared),
            Arc::clone(&queue),
            shutdown.clone(),
        ));
        match handle.await {
            Ok(()) => return,
            Err(err) => {
                if !err.is_panic() {
                    return;
                }
                tracing::error!("resource watcher worker crashed, restarting");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
                }
            }
        }
    }
}

/// Re-deliver every cached object once per period so that consumers see
/// state the watch may have missed.
async fn run_resync<K: Watchable>(
    shared: Arc<Shared<K>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                for (key, obj) in shared.store.entries() {
                    handle_update(&shared, key, obj.clone(), obj);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Namespace, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        adds: AtomicUsize,
        updates: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                adds: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            })
        }
    }

    impl<K: Send + Sync> ResourceEventHandler<K> for CountingHandler {
        fn on_add(&self, _obj: &K) {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update(&self, _obj: &K) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delete(&self, _obj: &K) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_shared<K: Watchable>(
        opts: WatchOptions<K>,
        handler: Arc<dyn ResourceEventHandler<K>>,
    ) -> (Arc<Shared<K>>, mpsc::UnboundedReceiver<WorkItem<K>>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (synced_tx, _synced_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            store: Store::new(),
            handler: RwLock::new(handler),
            cached_object: RwLock::new(None),
            queue: queue_tx,
            honor_resyncs: opts.honor_resyncs,
            is_updated: opts.is_updated.unwrap_or_else(default_is_updated),
            transform: opts.transform,
            synced: synced_tx,
        });
        (shared, queue_rx)
    }

    fn drain<K: Watchable>(shared: &Shared<K>, rx: &mut mpsc::UnboundedReceiver<WorkItem<K>>) {
        while let Ok(item) = rx.try_recv() {
            process_item(shared, item);
        }
    }

    fn pod(name: &str, namespace: &str, resource_version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                uid: Some("poduid".into()),
                resource_version: Some(resource_version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_handlers_dispatch_add_update_delete() {
        let handler = CountingHandler::new();
        let (shared, mut rx) = test_shared::<Pod>(WatchOptions::default(), handler.clone());
        let mut pending = None;

        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "2")));
        apply_watch_event(&shared, &mut pending, Event::Delete(pod("test", "test", "2")));
        drain(&shared, &mut rx);

        assert_eq!(handler.adds.load(Ordering::SeqCst), 1);
        assert_eq!(handler.updates.load(Ordering::SeqCst), 1);
        assert_eq!(handler.deletes.load(Ordering::SeqCst), 1);
        assert!(shared.store.get("test/test").is_none());
    }

    #[test]
    fn test_unchanged_resource_version_is_not_an_update() {
        let handler = CountingHandler::new();
        let (shared, mut rx) = test_shared::<Pod>(WatchOptions::default(), handler.clone());
        let mut pending = None;

        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        drain(&shared, &mut rx);

        assert_eq!(handler.adds.load(Ordering::SeqCst), 1);
        assert_eq!(handler.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_custom_is_updated_overrides_default() {
        let handler = CountingHandler::new();
        let opts = WatchOptions {
            is_updated: Some(Arc::new(|_: &Pod, _: &Pod| true)),
            ..Default::default()
        };
        let (shared, mut rx) = test_shared::<Pod>(opts, handler.clone());
        let mut pending = None;

        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        drain(&shared, &mut rx);

        assert_eq!(handler.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_honored_resync_requeues_as_add() {
        let handler = CountingHandler::new();
        let opts = WatchOptions {
            honor_resyncs: true,
            ..Default::default()
        };
        let (shared, mut rx) = test_shared::<Pod>(opts, handler.clone());
        let mut pending = None;

        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        apply_watch_event(&shared, &mut pending, Event::Apply(pod("test", "test", "1")));
        drain(&shared, &mut rx);

        assert_eq!(handler.adds.load(Ordering::SeqCst), 2);
        assert_eq!(handler.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delete_tombstone_uses_snapshot() {
        let handler = CountingHandler::new();
        let (shared, mut rx) = test_shared::<Pod>(WatchOptions::default(), handler.clone());
        let mut pending = None;

        // Never added to the store: the snapshot carried on the work item
        // is the only copy left to deliver.
        apply_watch_event(&shared, &mut pending, Event::Delete(pod("gone", "test", "1")));
        drain(&shared, &mut rx);

        assert_eq!(handler.deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relist_delivers_deletes_for_vanished_objects() {
        let handler = CountingHandler::new();
        let (shared, mut rx) = test_shared::<Pod>(WatchOptions::default(), handler.clone());
        let mut pending = None;

        apply_watch_event(&shared, &mut pending, Event::Apply(pod("a", "test", "1")));
        apply_watch_event(&shared, &mut pending, Event::Apply(pod("b", "test", "1")));

        apply_watch_event(&shared, &mut pending, Event::Init);
        apply_watch_event(&shared, &mut pending, Event::InitApply(pod("a", "test", "2")));
        apply_watch_event(&shared, &mut pending, Event::InitDone);
        drain(&shared, &mut rx);

        assert_eq!(handler.deletes.load(Ordering::SeqCst), 1);
        assert!(shared.store.get("test/a").is_some());
        assert!(shared.store.get("test/b").is_none());
    }

    #[test]
    fn test_cached_object_holds_previous_namespace() {
        let handler = CountingHandler::new();
        let (shared, mut rx) = test_shared::<Namespace>(WatchOptions::default(), handler);
        let mut pending = None;

        let old = Namespace {
            metadata: ObjectMeta {
                name: Some("test".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".into());

        apply_watch_event(&shared, &mut pending, Event::Apply(old.clone()));
        assert!(shared.cached_object.read().unwrap().is_none());

        apply_watch_event(&shared, &mut pending, Event::Apply(new));
        drain(&shared, &mut rx);

        let cached = shared.cached_object.read().unwrap().clone().unwrap();
        assert_eq!(cached.resource_version(), Some("1".into()));
    }

    #[test]
    fn test_transform_reshapes_before_caching() {
        let handler = CountingHandler::new();
        let opts = WatchOptions {
            transform: Some(Arc::new(|mut pod: Pod| {
                pod.metadata.managed_fields = None;
                pod
            })),
            ..Default::default()
        };
        let (shared, mut rx) = test_shared::<Pod>(opts, handler);
        let mut pending = None;

        let mut noisy = pod("test", "test", "1");
        noisy.metadata.managed_fields = Some(Vec::new());
        apply_watch_event(&shared, &mut pending, Event::Apply(noisy));
        drain(&shared, &mut rx);

        let cached = shared.store.get("test/test").unwrap();
        assert!(cached.metadata.managed_fields.is_none());
    }
}
