//! Container watcher with deferred deletion.
//!
//! The watcher seeds its live map from an initial list, then follows the
//! runtime's event stream. A dying container is not dropped immediately:
//! it moves to a deleted map and stays reachable through
//! [`Watcher::container`] for a grace period, and every lookup during
//! that window extends the grace period, so enrichment lookups racing
//! the container's death still succeed. Stream failures trigger a
//! reconnect with bounded backoff and a reconciling list that synthesizes
//! the missed start, update, and stop events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    Clock, Container, ContainerEvent, ContainerRuntime, ContainerSummary, EventListener,
    RuntimeError, SystemClock,
};

/// Short-ID length used for the secondary index.
const SHORT_ID_LEN: usize = 12;

/// Per-listener channel capacity; a listener that falls this far behind
/// is disconnected rather than allowed to apply backpressure.
const LISTENER_BUFFER: usize = 64;

const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Default grace period for deleted containers.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by [`Watcher::start`].
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("watcher already started")]
    AlreadyStarted,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Clone, Copy)]
enum EventKind {
    Start,
    Update,
    Stop,
}

struct DeletedContainer {
    container: Container,
    deleted_at: Instant,
}

#[derive(Default)]
struct State {
    live: HashMap<String, Container>,
    deleted: HashMap<String, DeletedContainer>,
    /// Short-ID index, maintained only in short-ID mode. Covers both
    /// live and deleted entries; cleared on final eviction.
    short_ids: HashMap<String, String>,
}

#[derive(Default)]
struct ListenerSet {
    start: Vec<mpsc::Sender<Container>>,
    stop: Vec<mpsc::Sender<Container>>,
    update: Vec<mpsc::Sender<Container>>,
}

/// Tracks containers through the runtime's list and event-stream APIs.
pub struct Watcher {
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
    cleanup_timeout: Duration,
    shorten_ids: bool,
    state: RwLock<State>,
    listeners: Mutex<ListenerSet>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cleanup_timeout: Duration,
        shorten_ids: bool,
    ) -> Self {
        Self::with_clock(runtime, cleanup_timeout, shorten_ids, Arc::new(SystemClock))
    }

    pub fn with_clock(
        runtime: Arc<dyn ContainerRuntime>,
        cleanup_timeout: Duration,
        shorten_ids: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            clock,
            cleanup_timeout,
            shorten_ids,
            state: RwLock::new(State::default()),
            listeners: Mutex::new(ListenerSet::default()),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Seed the live map from an initial list, then follow the event
    /// stream and run the periodic cleanup tick.
    pub async fn start(self: &Arc<Self>) -> Result<(), WatcherError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatcherError::AlreadyStarted);
        }

        let summaries = self.runtime.list().await?;
        tracing::debug!(containers = summaries.len(), "initial container list");
        for summary in summaries {
            self.apply_container(container_from_summary(summary));
        }

        let events = tokio::spawn(Arc::clone(self).run_events(self.shutdown.subscribe()));
        let cleanup = tokio::spawn(Arc::clone(self).run_cleanup_loop(self.shutdown.subscribe()));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(events);
        tasks.push(cleanup);
        Ok(())
    }

    /// Terminate the watcher and close every listener channel.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        let mut listeners = self.listeners.lock().unwrap();
        listeners.start.clear();
        listeners.stop.clear();
        listeners.update.clear();
    }

    /// Snapshot of the live containers.
    pub fn containers(&self) -> HashMap<String, Container> {
        self.state.read().unwrap().live.clone()
    }

    /// Look up a container by full ID or, in short-ID mode, by any
    /// prefix of at least twelve characters. A hit on a deleted entry
    /// refreshes its grace period.
    pub fn container(&self, id: &str) -> Option<Container> {
        let mut state = self.state.write().unwrap();

        let full_id = if state.live.contains_key(id) || state.deleted.contains_key(id) {
            id.to_string()
        } else if self.shorten_ids && id.len() >= SHORT_ID_LEN {
            state.short_ids.get(&id[..SHORT_ID_LEN])?.clone()
        } else {
            return None;
        };

        if let Some(container) = state.live.get(&full_id) {
            return Some(container.clone());
        }
        if let Some(deleted) = state.deleted.get_mut(&full_id) {
            deleted.deleted_at = self.clock.now();
            return Some(deleted.container.clone());
        }
        None
    }

    /// Listener for container start events.
    pub fn listen_start(&self) -> EventListener {
        self.subscribe(|listeners| &mut listeners.start)
    }

    /// Listener for container stop events.
    pub fn listen_stop(&self) -> EventListener {
        self.subscribe(|listeners| &mut listeners.stop)
    }

    /// Listener for container update events.
    pub fn listen_update(&self) -> EventListener {
        self.subscribe(|listeners| &mut listeners.update)
    }

    fn subscribe(
        &self,
        select: impl Fn(&mut ListenerSet) -> &mut Vec<mpsc::Sender<Container>>,
    ) -> EventListener {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        select(&mut self.listeners.lock().unwrap()).push(tx);
        EventListener::new(rx)
    }

    async fn run_events(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_RECONNECT_BACKOFF;
        loop {
            let mut stream = self.runtime.events();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            backoff = INITIAL_RECONNECT_BACKOFF;
                            self.handle_event(event).await;
                        }
                        Some(Err(err)) if err.is_fatal() => {
                            tracing::error!(error = %err, "fatal container runtime failure, stopping watcher");
                            return;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "container event stream failed, reconnecting");
                            break;
                        }
                        None => {
                            tracing::debug!("container event stream ended, reconnecting");
                            break;
                        }
                    },
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = self.clock.sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);

            if let Err(err) = self.reconcile().await {
                if err.is_fatal() {
                    tracing::error!(error = %err, "fatal container runtime failure, stopping watcher");
                    return;
                }
                tracing::warn!(error = %err, "container list reconciliation failed");
            }
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.cleanup_timeout) => self.run_cleanup(),
            }
        }
    }

    /// Evict deleted containers whose grace period elapsed without a
    /// refreshing lookup.
    fn run_cleanup(&self) {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap();
        let expired: Vec<String> = state
            .deleted
            .iter()
            .filter(|(_, deleted)| now.duration_since(deleted.deleted_at) >= self.cleanup_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            state.deleted.remove(&id);
            if self.shorten_ids {
                state.short_ids.remove(short_id(&id));
            }
            tracing::debug!(container_id = %id, "container evicted after grace period");
        }
    }

    async fn handle_event(&self, event: ContainerEvent) {
        tracing::debug!(container_id = %event.id, action = %event.action, "container event");
        match event.action.as_str() {
            "start" | "update" => {
                let container = self.container_from_event(event).await;
                self.apply_container(container);
            }
            "die" | "destroy" => self.apply_terminal(&event.id),
            _ => {}
        }
    }

    /// Insert or replace a container, resurrecting it from the deleted
    /// map if needed, and publish the matching event. A replacement with
    /// identical content publishes nothing.
    fn apply_container(&self, container: Container) {
        let (resurrected, previous) = {
            let mut state = self.state.write().unwrap();
            let resurrected = state.deleted.remove(&container.id).is_some();
            let previous = state.live.insert(container.id.clone(), container.clone());
            if self.shorten_ids {
                state
                    .short_ids
                    .insert(short_id(&container.id).to_string(), container.id.clone());
            }
            (resurrected, previous)
        };

        match previous {
            Some(ref old) if old == &container && !resurrected => {}
            Some(_) => self.publish(EventKind::Update, container),
            None if resurrected => self.publish(EventKind::Update, container),
            None => self.publish(EventKind::Start, container),
        }
    }

    /// Move a container from live to deleted and publish a stop event.
    fn apply_terminal(&self, id: &str) {
        let removed = {
            let mut state = self.state.write().unwrap();
            match state.live.remove(id) {
                Some(container) => {
                    state.deleted.insert(
                        id.to_string(),
                        DeletedContainer {
                            container: container.clone(),
                            deleted_at: self.clock.now(),
                        },
                    );
                    Some(container)
                }
                None => None,
            }
        };
        if let Some(container) = removed {
            self.publish(EventKind::Stop, container);
        }
    }

    /// Diff a fresh list against the live map, synthesizing the start,
    /// update, and stop events the stream outage swallowed.
    async fn reconcile(&self) -> Result<(), RuntimeError> {
        let summaries = self.runtime.list().await?;
        tracing::debug!(containers = summaries.len(), "reconciling after reconnect");

        let mut seen = std::collections::HashSet::new();
        for summary in summaries {
            seen.insert(summary.id.clone());
            self.apply_container(container_from_summary(summary));
        }

        let stale: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .live
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.apply_terminal(&id);
        }
        Ok(())
    }

    /// Build a container from event attributes, falling back to an
    /// inspect call when the event does not carry name or image.
    async fn container_from_event(&self, event: ContainerEvent) -> Container {
        let mut name = event.attributes.get("name").cloned().unwrap_or_default();
        let mut image = event.attributes.get("image").cloned().unwrap_or_default();
        let labels: HashMap<String, String> = event
            .attributes
            .iter()
            .filter(|(key, _)| key.as_str() != "name" && key.as_str() != "image")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if name.is_empty() || image.is_empty() {
            match self.runtime.inspect(&event.id).await {
                Ok(details) => {
                    if name.is_empty() {
                        name = details.name;
                    }
                    if image.is_empty() {
                        image = details.image;
                    }
                }
                Err(err) => {
                    tracing::debug!(container_id = %event.id, error = %err, "container inspect failed");
                }
            }
        }

        Container {
            id: event.id,
            name,
            image,
            labels,
        }
    }

    fn publish(&self, kind: EventKind, container: Container) {
        let mut listeners = self.listeners.lock().unwrap();
        let senders = match kind {
            EventKind::Start => &mut listeners.start,
            EventKind::Stop => &mut listeners.stop,
            EventKind::Update => &mut listeners.update,
        };
        senders.retain(|tx| match tx.try_send(container.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(container_id = %container.id, "disconnecting slow container event listener");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn container_from_summary(summary: ContainerSummary) -> Container {
    let name = summary
        .names
        .first()
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();
    Container {
        id: summary.id,
        name,
        image: summary.image,
        labels: summary.labels,
    }
}

fn short_id(id: &str) -> &str {
    if id.len() > SHORT_ID_LEN {
        &id[..SHORT_ID_LEN]
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContainerDetails;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::collections::VecDeque;

    struct MockRuntime {
        lists: Mutex<VecDeque<Vec<ContainerSummary>>>,
        events: Mutex<Option<Vec<Result<ContainerEvent, RuntimeError>>>>,
    }

    impl MockRuntime {
        fn new(
            lists: Vec<Vec<ContainerSummary>>,
            events: Vec<Result<ContainerEvent, RuntimeError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                lists: Mutex::new(lists.into()),
                events: Mutex::new(Some(events)),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
            self.lists
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RuntimeError::Transient(anyhow!("no more lists")))
        }

        fn events(&self) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>> {
            match self.events.lock().unwrap().take() {
                Some(events) => stream::iter(events).chain(stream::pending()).boxed(),
                None => stream::pending().boxed(),
            }
        }

        async fn inspect(&self, _id: &str) -> Result<ContainerDetails, RuntimeError> {
            Err(RuntimeError::Transient(anyhow!("unimplemented")))
        }
    }

    struct TestClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    fn summary(id: &str, names: &[&str], image: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
            image: image.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn start_event(id: &str, name: &str, image: &str, labels: &[(&str, &str)]) -> ContainerEvent {
        let mut attributes: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        attributes.insert("name".to_string(), name.to_string());
        attributes.insert("image".to_string(), image.to_string());
        ContainerEvent {
            action: "start".to_string(),
            id: id.to_string(),
            attributes,
        }
    }

    fn die_event(id: &str) -> ContainerEvent {
        ContainerEvent {
            action: "die".to_string(),
            id: id.to_string(),
            attributes: HashMap::new(),
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn test_watcher(
        lists: Vec<Vec<ContainerSummary>>,
        events: Vec<Result<ContainerEvent, RuntimeError>>,
        shorten_ids: bool,
    ) -> (Arc<Watcher>, Arc<TestClock>) {
        let clock = TestClock::new();
        let watcher = Arc::new(Watcher::with_clock(
            MockRuntime::new(lists, events),
            Duration::from_millis(200),
            shorten_ids,
            clock.clone(),
        ));
        (watcher, clock)
    }

    #[tokio::test]
    async fn test_initial_list() {
        let (watcher, _clock) = test_watcher(
            vec![vec![
                summary(
                    "0332dbd79e20",
                    &["/containername", "othername"],
                    "busybox",
                    &[("foo", "bar")],
                ),
                summary("6ac6ee8df5d4", &["/other"], "nginx", &[]),
            ]],
            vec![],
            false,
        );
        watcher.start().await.unwrap();

        let containers = watcher.containers();
        assert_eq!(containers.len(), 2);
        assert_eq!(
            containers.get("0332dbd79e20"),
            Some(&Container {
                id: "0332dbd79e20".to_string(),
                name: "containername".to_string(),
                image: "busybox".to_string(),
                labels: HashMap::from([("foo".to_string(), "bar".to_string())]),
            })
        );
        assert_eq!(
            containers.get("6ac6ee8df5d4"),
            Some(&Container {
                id: "6ac6ee8df5d4".to_string(),
                name: "other".to_string(),
                image: "nginx".to_string(),
                labels: HashMap::new(),
            })
        );
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_event_adds_container() {
        let (watcher, _clock) = test_watcher(
            vec![vec![summary(
                "0332dbd79e20",
                &["/containername"],
                "busybox",
                &[("foo", "bar")],
            )]],
            vec![Ok(start_event(
                "6ac6ee8df5d4",
                "other",
                "nginx",
                &[("label", "value")],
            ))],
            false,
        );
        let mut started = watcher.listen_start();
        watcher.start().await.unwrap();

        let container = started.recv().await.unwrap();
        assert_eq!(container.id, "0332dbd79e20");
        let container = started.recv().await.unwrap();
        assert_eq!(container.id, "6ac6ee8df5d4");
        assert_eq!(container.name, "other");
        assert_eq!(
            container.labels,
            HashMap::from([("label".to_string(), "value".to_string())])
        );
        assert_eq!(watcher.containers().len(), 2);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_update_event_replaces_container() {
        let (watcher, _clock) = test_watcher(
            vec![vec![summary(
                "0332dbd79e20",
                &["/containername"],
                "busybox",
                &[("label", "foo")],
            )]],
            vec![Ok(ContainerEvent {
                action: "update".to_string(),
                id: "0332dbd79e20".to_string(),
                attributes: HashMap::from([
                    ("name".to_string(), "containername".to_string()),
                    ("image".to_string(), "busybox".to_string()),
                    ("label".to_string(), "bar".to_string()),
                ]),
            })],
            false,
        );
        let mut updated = watcher.listen_update();
        watcher.start().await.unwrap();

        let container = updated.recv().await.unwrap();
        assert_eq!(container.labels.get("label"), Some(&"bar".to_string()));
        assert_eq!(
            watcher.container("0332dbd79e20").unwrap().labels.get("label"),
            Some(&"bar".to_string())
        );
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_die_keeps_container_reachable_through_grace_period() {
        let (watcher, clock) = test_watcher(
            vec![vec![summary(
                "0332dbd79e20",
                &["/containername"],
                "busybox",
                &[("label", "foo")],
            )]],
            vec![Ok(die_event("0332dbd79e20"))],
            false,
        );
        let mut stopped = watcher.listen_stop();
        watcher.start().await.unwrap();

        // The stop event marks the die as fully processed.
        let container = stopped.recv().await.unwrap();
        assert_eq!(container.id, "0332dbd79e20");

        // Refreshing lookups every half period keep it reachable
        // indefinitely.
        for _ in 0..18 {
            assert!(watcher.container("0332dbd79e20").is_some());
            clock.advance(watcher.cleanup_timeout / 2);
            watcher.run_cleanup();
        }
        assert!(watcher.container("0332dbd79e20").is_some());

        // A full period without lookups evicts it.
        clock.advance(watcher.cleanup_timeout + Duration::from_secs(1));
        watcher.run_cleanup();
        assert!(watcher.container("0332dbd79e20").is_none());
        assert!(watcher.containers().is_empty());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_after_die_cancels_deletion() {
        let (watcher, clock) = test_watcher(
            vec![vec![summary(
                "0332dbd79e20",
                &["/containername"],
                "busybox",
                &[],
            )]],
            vec![
                Ok(die_event("0332dbd79e20")),
                Ok(start_event("0332dbd79e20", "containername", "busybox", &[])),
            ],
            false,
        );
        let mut updated = watcher.listen_update();
        watcher.start().await.unwrap();

        // Resurrection out of the deleted map surfaces as an update.
        let container = updated.recv().await.unwrap();
        assert_eq!(container.id, "0332dbd79e20");

        clock.advance(watcher.cleanup_timeout + Duration::from_secs(1));
        watcher.run_cleanup();
        assert_eq!(watcher.containers().len(), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_short_id_lookup() {
        let (watcher, _clock) = test_watcher(
            vec![vec![summary(
                "1234567890123",
                &["/containername"],
                "busybox",
                &[("foo", "bar")],
            )]],
            vec![],
            true,
        );
        watcher.start().await.unwrap();

        let container = watcher.container("123456789012").unwrap();
        assert_eq!(container.id, "1234567890123");
        assert_eq!(container.name, "containername");
        // Prefixes shorter than twelve characters never match.
        assert!(watcher.container("12345678901").is_none());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_short_id_survives_grace_period() {
        let (watcher, clock) = test_watcher(
            vec![vec![summary(
                "0332dbd79e20aaa",
                &["/containername"],
                "busybox",
                &[],
            )]],
            vec![Ok(die_event("0332dbd79e20aaa"))],
            true,
        );
        let mut stopped = watcher.listen_stop();
        watcher.start().await.unwrap();
        stopped.recv().await.unwrap();

        // Reachable by short ID while deleted, gone after eviction.
        assert!(watcher.container("0332dbd79e20").is_some());
        clock.advance(watcher.cleanup_timeout + Duration::from_secs(1));
        watcher.run_cleanup();
        assert!(watcher.container("0332dbd79e20").is_none());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_missed_events() {
        let (watcher, _clock) = test_watcher(
            vec![
                vec![
                    summary("0332dbd79e20", &["/old"], "busybox", &[]),
                    summary("6ac6ee8df5d4", &["/kept"], "nginx", &[]),
                ],
                vec![
                    summary("6ac6ee8df5d4", &["/kept"], "nginx", &[]),
                    summary("aabbccddeeff", &["/new"], "redis", &[]),
                ],
            ],
            vec![Err(RuntimeError::Transient(anyhow!("stream broke")))],
            false,
        );
        let mut stopped = watcher.listen_stop();
        let mut started = watcher.listen_start();
        watcher.start().await.unwrap();

        // Initial list.
        assert_eq!(started.recv().await.unwrap().id, "0332dbd79e20");
        assert_eq!(started.recv().await.unwrap().id, "6ac6ee8df5d4");

        // After the stream error the reconciling list synthesizes a
        // start for the new container and a stop for the vanished one.
        let container = started.recv().await.unwrap();
        assert_eq!(container.id, "aabbccddeeff");
        let container = stopped.recv().await.unwrap();
        assert_eq!(container.id, "0332dbd79e20");

        eventually("reconciled container map", || {
            let live = watcher.containers();
            live.len() == 2 && live.contains_key("aabbccddeeff")
        })
        .await;
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_fatal_stream_error_stops_processing() {
        let (watcher, _clock) = test_watcher(
            vec![vec![summary("0332dbd79e20", &["/c"], "busybox", &[])]],
            vec![
                Err(RuntimeError::Fatal(anyhow!("unauthorized"))),
                Ok(die_event("0332dbd79e20")),
            ],
            false,
        );
        watcher.start().await.unwrap();

        // Give the event loop a chance to run: the die event behind the
        // fatal error must never be processed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.containers().len(), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (watcher, _clock) = test_watcher(vec![vec![]], vec![], false);
        watcher.start().await.unwrap();
        assert!(matches!(
            watcher.start().await,
            Err(WatcherError::AlreadyStarted)
        ));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_listeners() {
        let (watcher, _clock) = test_watcher(vec![vec![]], vec![], false);
        let mut listener = watcher.listen_start();
        watcher.start().await.unwrap();
        watcher.stop().await;
        assert!(listener.recv().await.is_none());
    }
}
