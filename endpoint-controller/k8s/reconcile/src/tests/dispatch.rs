use super::*;
use crate::Dispatch;
use endpoint_controller_core::{Event, EventKind, EventStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Acks = mpsc::UnboundedReceiver<(ResourceKey, Result<(), String>)>;

/// Feeds events to a dispatcher and records their acknowledgements.
struct Events<T> {
    tx: mpsc::UnboundedSender<Event<T>>,
    acks: mpsc::UnboundedSender<(ResourceKey, Result<(), String>)>,
}

impl<T: Send + Sync + 'static> Events<T> {
    fn new() -> (Self, EventStream<T>, Acks) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (acks, acks_rx) = mpsc::unbounded_channel();
        (
            Self { tx, acks },
            Box::pin(UnboundedReceiverStream::new(rx)),
            acks_rx,
        )
    }

    fn send(&self, kind: EventKind, key: ResourceKey, object: Option<Arc<T>>) {
        let acks = self.acks.clone();
        let ack_key = key.clone();
        let ev = Event::new(kind, key, object, move |res: Result<()>| {
            let _ = acks.send((ack_key, res.map_err(|e| e.to_string())));
        });
        self.tx.send(ev).expect("dispatcher must be reading");
    }
}

async fn ack(acks: &mut Acks) -> (ResourceKey, Result<(), String>) {
    acks.recv().await.expect("event must be acknowledged")
}

fn host_networked(pod: &Pod) -> Arc<Pod> {
    let mut pod = pod.clone();
    pod.spec.get_or_insert_with(Default::default).host_network = Some(true);
    Arc::new(pod)
}

#[tokio::test]
async fn pod_events_are_reconciled() {
    let fx = Fixture::new();
    let (pods, pod_events, mut acks) = Events::<Pod>::new();
    let (_, ns_events, _) = Events::<Namespace>::new();
    let (_signal, watch) = drain::channel();

    let pod = mk_pod("test", "x", [("app", "web")], "1.2.3.4", "10.0.0.1");
    pods.send(EventKind::Upsert, key("test", "x"), Some(pod));
    pods.send(EventKind::Sync, ResourceKey::cluster(""), None);
    drop(pods);

    Dispatch::new(fx.reconciler.clone())
        .run(pod_events, ns_events, watch)
        .await;

    let mut seen = vec![ack(&mut acks).await, ack(&mut acks).await];
    seen.sort_by(|(a, _), (b, _)| a.cmp(b));
    assert_eq!(
        seen,
        vec![(ResourceKey::cluster(""), Ok(())), (key("test", "x"), Ok(()))]
    );
    assert_eq!(fx.endpoints.calls().create, 1);
    assert!(fx.reconciler.store().get_pod(&key("test", "x")).is_some());
}

#[tokio::test]
async fn host_networked_pods_are_skipped() {
    let fx = Fixture::new();
    let (pods, pod_events, mut acks) = Events::<Pod>::new();
    let (_, ns_events, _) = Events::<Namespace>::new();
    let (_signal, watch) = drain::channel();

    let pod = mk_pod("test", "x", [("app", "web")], "1.2.3.4", "10.0.0.1");
    pods.send(EventKind::Upsert, key("test", "x"), Some(host_networked(&pod)));
    drop(pods);

    Dispatch::new(fx.reconciler.clone())
        .run(pod_events, ns_events, watch)
        .await;

    assert_eq!(ack(&mut acks).await, (key("test", "x"), Ok(())));
    assert_eq!(fx.endpoints.calls(), Calls::default());
    assert_eq!(fx.allocator.allocations(), 0);
}

#[tokio::test]
async fn failures_are_acknowledged() {
    let fx = Fixture::new();
    fx.endpoints.set_fail_create(true);
    let (pods, pod_events, mut acks) = Events::<Pod>::new();
    let (_, ns_events, _) = Events::<Namespace>::new();
    let (_signal, watch) = drain::channel();

    let pod = mk_pod("test", "x", [("app", "web")], "1.2.3.4", "10.0.0.1");
    pods.send(EventKind::Upsert, key("test", "x"), Some(pod));
    drop(pods);

    Dispatch::new(fx.reconciler.clone())
        .with_max_workers(1)
        .run(pod_events, ns_events, watch)
        .await;

    let (key, res) = ack(&mut acks).await;
    assert_eq!(key, super::key("test", "x"));
    assert!(res.is_err(), "create failure must be reported");
    assert!(fx.reconciler.store().get_pod(&key).is_none());
}

#[tokio::test]
async fn pod_deletes_are_reconciled() {
    let fx = Fixture::new();
    let id = fx
        .track(mk_pod("test", "x", [("app", "web")], "1.2.3.4", "10.0.0.1"))
        .await;
    let (pods, pod_events, mut acks) = Events::<Pod>::new();
    let (_, ns_events, _) = Events::<Namespace>::new();
    let (_signal, watch) = drain::channel();

    pods.send(EventKind::Delete, key("test", "x"), None);
    drop(pods);

    Dispatch::new(fx.reconciler.clone())
        .run(pod_events, ns_events, watch)
        .await;

    assert_eq!(ack(&mut acks).await, (key("test", "x"), Ok(())));
    assert_eq!(fx.allocator.releases(), vec![id]);
    assert!(fx.endpoints.remote(&key("test", "x")).is_none());
}

#[tokio::test]
async fn namespace_events_are_reconciled() {
    let fx = Fixture::new();
    let (_pods, pod_events, _) = Events::<Pod>::new();
    let (namespaces, ns_events, mut acks) = Events::<Namespace>::new();
    let (_signal, watch) = drain::channel();

    let ns = mk_namespace("new", None, "1");
    namespaces.send(EventKind::Upsert, ResourceKey::cluster("new"), Some(Arc::new(ns)));
    namespaces.send(EventKind::Sync, ResourceKey::cluster(""), None);
    namespaces.send(EventKind::Delete, ResourceKey::cluster("test"), None);
    fx.reconciler
        .store()
        .add_namespace(crate::NamespaceRecord::from(&mk_namespace("test", None, "1")));

    let dispatch = tokio::spawn(
        Dispatch::new(fx.reconciler.clone()).run(pod_events, ns_events, watch),
    );

    // Namespace events are handled in order.
    assert_eq!(ack(&mut acks).await, (ResourceKey::cluster("new"), Ok(())));
    assert_eq!(ack(&mut acks).await, (ResourceKey::cluster(""), Ok(())));
    assert_eq!(ack(&mut acks).await, (ResourceKey::cluster("test"), Ok(())));
    assert!(fx.reconciler.store().get_namespace("new").is_some());
    assert!(fx.reconciler.store().get_namespace("test").is_none());

    // The pod stream is still open, so the dispatcher runs until shutdown.
    drop(namespaces);
    assert!(!dispatch.is_finished());
    dispatch.abort();
}

#[tokio::test]
async fn shutdown_stops_reading() {
    let fx = Fixture::new();
    let (pods, pod_events, mut acks) = Events::<Pod>::new();
    let (_, ns_events, _) = Events::<Namespace>::new();
    let (signal, watch) = drain::channel();

    let dispatch = tokio::spawn(
        Dispatch::new(fx.reconciler.clone()).run(pod_events, ns_events, watch),
    );

    let pod = mk_pod("test", "x", [("app", "web")], "1.2.3.4", "10.0.0.1");
    pods.send(EventKind::Upsert, key("test", "x"), Some(pod));
    assert_eq!(ack(&mut acks).await, (key("test", "x"), Ok(())));

    // Draining completes once the dispatcher has released its watch.
    signal.drain().await;
    dispatch.await.expect("dispatcher must not panic");
    assert_eq!(fx.endpoints.calls().create, 1);
}
