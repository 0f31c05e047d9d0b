//! Adapts kubert watches into acknowledged, per-key event streams.

use crate::{
    core::{Event, EventKind, EventSource, EventStream, ResourceKey, Snapshot},
    k8s::{watcher, Resource, ResourceExt},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use futures::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, trace};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The last observed state of a watched resource type.
pub struct Cache<K> {
    objects: RwLock<HashMap<ResourceKey, Arc<K>>>,

    /// Keys listed since the watch last restarted, if a restart is underway.
    relisted: Mutex<Option<HashSet<ResourceKey>>>,

    synced: watch::Sender<bool>,
}

/// An [`EventSource`] over a watch.
///
/// A key has at most one event outstanding. Changes observed while an event
/// is outstanding are delivered, from the cache, once it is acknowledged.
/// Failed events are redelivered with a per-key exponential backoff.
pub struct WatchSource<K> {
    cache: Arc<Cache<K>>,
    events: Option<mpsc::UnboundedReceiver<Event<K>>>,
}

/// Tracks delivery state per key.
#[derive(Debug, Default)]
struct Queue {
    keys: HashMap<ResourceKey, KeyState>,
}

#[derive(Debug, Default)]
struct KeyState {
    in_flight: bool,
    dirty: bool,
    retrying: bool,
    backoff: Option<Duration>,
}

#[derive(Debug, PartialEq, Eq)]
enum Next {
    Idle,
    Deliver,
    RetryAfter(Duration),
}

/// Spawns a task that keeps a cache of the watched resources.
pub fn cache<K, S>(events: S) -> Arc<Cache<K>>
where
    K: Resource + Send + Sync + 'static,
    S: Stream<Item = watcher::Event<K>> + Send + 'static,
{
    let cache = Arc::new(Cache::default());
    let task = cache.clone();
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(ev) = events.next().await {
            task.apply(ev);
        }
        debug!("Watch ended");
    });
    cache
}

// === impl Cache ===

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::default()),
            relisted: Mutex::new(None),
            synced: watch::channel(false).0,
        }
    }
}

impl<K: Resource> Cache<K> {
    /// Applies a watch event, returning the keys whose state changed.
    fn apply(&self, event: watcher::Event<K>) -> Vec<ResourceKey> {
        match event {
            watcher::Event::Init => {
                *self.relisted.lock() = Some(HashSet::default());
                vec![]
            }

            watcher::Event::InitApply(obj) => {
                let key = ResourceKey::of(&obj);
                if let Some(relisted) = self.relisted.lock().as_mut() {
                    relisted.insert(key.clone());
                }
                self.insert(key, obj)
            }

            watcher::Event::InitDone => {
                let relisted = self.relisted.lock().take().unwrap_or_default();
                let mut objects = self.objects.write();
                let mut removed = objects
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect::<Vec<_>>();
                removed.sort();
                for key in &removed {
                    objects.remove(key);
                }
                drop(objects);
                self.synced.send_replace(true);
                removed
            }

            watcher::Event::Apply(obj) => {
                let key = ResourceKey::of(&obj);
                self.insert(key, obj)
            }

            watcher::Event::Delete(obj) => {
                let key = ResourceKey::of(&obj);
                match self.objects.write().remove(&key) {
                    Some(_) => vec![key],
                    None => vec![],
                }
            }
        }
    }

    fn insert(&self, key: ResourceKey, obj: K) -> Vec<ResourceKey> {
        let mut objects = self.objects.write();
        let unchanged = objects.get(&key).is_some_and(|prior| {
            let version = prior.resource_version();
            version.is_some() && version == obj.resource_version()
        });
        objects.insert(key.clone(), Arc::new(obj));
        if unchanged {
            return vec![];
        }
        vec![key]
    }
}

impl<K> Cache<K> {
    /// Waits for the initial list to complete.
    pub async fn synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender is owned by the cache, so the channel can't close.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl<K: Send + Sync> Snapshot<K> for Cache<K> {
    fn get(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }
}

// === impl WatchSource ===

impl<K> WatchSource<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn spawn<S>(events: S) -> Self
    where
        S: Stream<Item = watcher::Event<K>> + Send + 'static,
    {
        let cache = Arc::new(Cache::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(events, cache.clone(), tx));
        Self {
            cache,
            events: Some(rx),
        }
    }

    pub fn cache(&self) -> &Arc<Cache<K>> {
        &self.cache
    }
}

#[async_trait::async_trait]
impl<K> EventSource<K> for WatchSource<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn events(&mut self) -> EventStream<K> {
        match self.events.take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(stream::empty()),
        }
    }

    async fn snapshot(&self) -> Result<Arc<dyn Snapshot<K>>> {
        self.cache.synced().await;
        Ok(self.cache.clone())
    }
}

async fn run<K, S>(events: S, cache: Arc<Cache<K>>, tx: mpsc::UnboundedSender<Event<K>>)
where
    K: Resource + Send + Sync + 'static,
    S: Stream<Item = watcher::Event<K>> + Send + 'static,
{
    let (acks_tx, mut acks_rx) = mpsc::unbounded_channel();
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
    let mut queue = Queue::default();
    tokio::pin!(events);

    let deliver = |key: ResourceKey| {
        let object = cache.get(&key);
        let kind = if object.is_some() {
            EventKind::Upsert
        } else {
            EventKind::Delete
        };
        let acks = acks_tx.clone();
        let ack_key = key.clone();
        let ev = Event::new(kind, key, object, move |res: Result<()>| {
            let _ = acks.send((ack_key, res.is_ok()));
        });
        // If the receiver is gone, the dropped event acks itself.
        let _ = tx.send(ev);
    };

    loop {
        if tx.is_closed() {
            break;
        }

        tokio::select! {
            biased;

            Some((key, ok)) = acks_rx.recv() => match queue.acked(&key, ok) {
                Next::Idle => {}
                Next::Deliver => deliver(key),
                Next::RetryAfter(backoff) => {
                    trace!(%key, ?backoff, "Retrying");
                    let retry_tx = retry_tx.clone();
                    tokio::spawn(async move {
                        time::sleep(backoff).await;
                        let _ = retry_tx.send(key);
                    });
                }
            },

            Some(key) = retry_rx.recv() => {
                if queue.retry(&key) {
                    deliver(key);
                }
            }

            ev = events.next() => {
                let Some(ev) = ev else { break };
                let init_done = matches!(ev, watcher::Event::InitDone);
                for key in cache.apply(ev) {
                    if queue.changed(&key) {
                        deliver(key);
                    }
                }
                if init_done {
                    debug!("Initial list complete");
                    let _ = tx.send(Event::new(
                        EventKind::Sync,
                        ResourceKey::cluster(""),
                        None,
                        |_| {},
                    ));
                }
            }
        }
    }
    debug!("Watch ended");
}

// === impl Queue ===

impl Queue {
    /// Records a change to `key`, returning true if it should be delivered
    /// now.
    fn changed(&mut self, key: &ResourceKey) -> bool {
        let state = self.keys.entry(key.clone()).or_default();
        if state.in_flight || state.retrying {
            state.dirty = true;
            return false;
        }
        state.in_flight = true;
        true
    }

    fn acked(&mut self, key: &ResourceKey, ok: bool) -> Next {
        let Some(state) = self.keys.get_mut(key) else {
            return Next::Idle;
        };
        state.in_flight = false;

        if !ok {
            let backoff = state
                .backoff
                .map_or(INITIAL_BACKOFF, |b| (b * 2).min(MAX_BACKOFF));
            state.backoff = Some(backoff);
            state.retrying = true;
            // The retry delivers the latest state.
            state.dirty = false;
            return Next::RetryAfter(backoff);
        }

        state.backoff = None;
        if state.dirty {
            state.dirty = false;
            state.in_flight = true;
            return Next::Deliver;
        }
        self.keys.remove(key);
        Next::Idle
    }

    /// Records that a key's backoff elapsed, returning true if it should be
    /// delivered now.
    fn retry(&mut self, key: &ResourceKey) -> bool {
        let Some(state) = self.keys.get_mut(key) else {
            return false;
        };
        state.retrying = false;
        state.dirty = false;
        state.in_flight = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ObjectMeta, Pod};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn pod(name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("test".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("test", name)
    }

    #[test]
    fn queue_coalesces_changes() {
        let mut queue = Queue::default();
        assert!(queue.changed(&key("a")));
        assert!(!queue.changed(&key("a")));
        assert!(!queue.changed(&key("a")));
        assert!(queue.changed(&key("b")), "keys are independent");

        assert_eq!(queue.acked(&key("a"), true), Next::Deliver);
        assert_eq!(queue.acked(&key("a"), true), Next::Idle);
        assert!(!queue.keys.contains_key(&key("a")));
    }

    #[test]
    fn queue_backs_off_failures() {
        let mut queue = Queue::default();
        assert!(queue.changed(&key("a")));

        let mut expected = INITIAL_BACKOFF;
        for _ in 0..10 {
            assert_eq!(queue.acked(&key("a"), false), Next::RetryAfter(expected));
            // Changes wait for the retry.
            assert!(!queue.changed(&key("a")));
            assert!(queue.retry(&key("a")));
            expected = (expected * 2).min(MAX_BACKOFF);
        }
        assert_eq!(
            queue.acked(&key("a"), false),
            Next::RetryAfter(MAX_BACKOFF)
        );
        assert!(queue.retry(&key("a")));
        assert_eq!(queue.acked(&key("a"), true), Next::Idle);

        // Success resets the backoff.
        assert!(queue.changed(&key("a")));
        assert_eq!(
            queue.acked(&key("a"), false),
            Next::RetryAfter(INITIAL_BACKOFF)
        );
    }

    #[test]
    fn cache_relist_removes_missing() {
        let cache = Cache::<Pod>::default();
        assert_eq!(cache.apply(watcher::Event::Apply(pod("a", "1"))), vec![key("a")]);
        assert_eq!(cache.apply(watcher::Event::Apply(pod("b", "1"))), vec![key("b")]);
        assert_eq!(
            cache.apply(watcher::Event::Apply(pod("a", "1"))),
            vec![],
            "an unchanged version is not a change"
        );

        assert_eq!(cache.apply(watcher::Event::Init), vec![]);
        assert_eq!(
            cache.apply(watcher::Event::InitApply(pod("a", "2"))),
            vec![key("a")]
        );
        assert_eq!(cache.apply(watcher::Event::InitDone), vec![key("b")]);

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("b")).is_none());
        assert_eq!(
            cache.get(&key("a")).unwrap().metadata.resource_version.as_deref(),
            Some("2")
        );

        assert_eq!(cache.apply(watcher::Event::Delete(pod("a", "3"))), vec![key("a")]);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn redelivers_latest_state() {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let mut source = WatchSource::<Pod>::spawn(UnboundedReceiverStream::new(watch_rx));
        let mut events = source.events();

        watch_tx.send(watcher::Event::Init).unwrap();
        watch_tx.send(watcher::Event::InitApply(pod("a", "1"))).unwrap();
        watch_tx.send(watcher::Event::InitDone).unwrap();

        let ev = events.next().await.unwrap();
        assert_eq!((ev.kind, &ev.key), (EventKind::Upsert, &key("a")));
        let sync = events.next().await.unwrap();
        assert_eq!(sync.kind, EventKind::Sync);
        sync.done(Ok(()));
        let snapshot = source.snapshot().await.unwrap();
        assert!(snapshot.get(&key("a")).is_some());

        // A change to an outstanding key waits for the acknowledgement.
        watch_tx.send(watcher::Event::Apply(pod("a", "2"))).unwrap();
        tokio_test::assert_pending!(tokio_test::task::spawn(events.next()).poll());
        ev.done(Ok(()));

        let ev = events.next().await.unwrap();
        assert_eq!(
            ev.object.as_ref().unwrap().metadata.resource_version.as_deref(),
            Some("2")
        );

        // A failure is retried after a backoff, with the latest state.
        let failed_at = time::Instant::now();
        ev.done(Err(anyhow::anyhow!("boom")));
        watch_tx.send(watcher::Event::Delete(pod("a", "3"))).unwrap();

        let ev = events.next().await.unwrap();
        assert!(failed_at.elapsed() >= INITIAL_BACKOFF);
        assert_eq!((ev.kind, &ev.key), (EventKind::Delete, &key("a")));
        assert!(ev.object.is_none());
        ev.done(Ok(()));

        // Subsequent calls get an empty stream.
        assert!(source.events().next().await.is_none());
    }
}
