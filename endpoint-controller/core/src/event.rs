use crate::endpoint::ResourceKey;
use anyhow::{anyhow, Result};
use futures::prelude::*;
use std::{fmt, pin::Pin, sync::Arc};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The source has delivered its initial state.
    Sync,
    Upsert,
    Delete,
}

type Ack = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A change notification for a single resource.
///
/// Every event must be acknowledged with [`Event::done`]. The source does not
/// deliver another event for the same key until the previous one has been
/// acknowledged, and redelivers the key's latest state when the
/// acknowledgement carries an error. An event dropped without being
/// acknowledged is treated as failed.
pub struct Event<T> {
    pub kind: EventKind,
    pub key: ResourceKey,
    pub object: Option<Arc<T>>,
    ack: Option<Ack>,
}

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Event<T>> + Send + 'static>>;

/// Read access to an event source's current state.
pub trait Snapshot<T>: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Option<Arc<T>>;
}

#[async_trait::async_trait]
pub trait EventSource<T>: Send + Sync {
    /// Takes the source's event stream. Subsequent calls return an empty
    /// stream.
    fn events(&mut self) -> EventStream<T>;

    /// Waits for the source's initial state and returns a view of its cache.
    async fn snapshot(&self) -> Result<Arc<dyn Snapshot<T>>>;
}

// === impl Event ===

impl<T> Event<T> {
    pub fn new(
        kind: EventKind,
        key: ResourceKey,
        object: Option<Arc<T>>,
        ack: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Self {
        Self {
            kind,
            key,
            object,
            ack: Some(Box::new(ack)),
        }
    }

    pub fn done(mut self, result: Result<()>) {
        if let Some(ack) = self.ack.take() {
            ack(result);
        }
    }
}

impl<T> Drop for Event<T> {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack(Err(anyhow!("event for {} dropped before completion", self.key)));
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("object", &self.object.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorded() -> (Arc<Mutex<Vec<bool>>>, impl FnOnce(Result<()>) + Send + 'static) {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let tx = acks.clone();
        (acks, move |res: Result<()>| tx.lock().unwrap().push(res.is_ok()))
    }

    #[test]
    fn done_acks_once() {
        let (acks, ack) = recorded();
        let ev = Event::<()>::new(EventKind::Upsert, ResourceKey::new("ns", "a"), None, ack);
        ev.done(Ok(()));
        assert_eq!(*acks.lock().unwrap(), vec![true]);
    }

    #[test]
    fn drop_acks_failure() {
        let (acks, ack) = recorded();
        drop(Event::<()>::new(
            EventKind::Delete,
            ResourceKey::new("ns", "a"),
            None,
            ack,
        ));
        assert_eq!(*acks.lock().unwrap(), vec![false]);
    }
}
