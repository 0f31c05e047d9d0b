use endpoint_controller_core::EventKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    events: Family<EventLabels, Counter>,
    allocations: Family<OutcomeLabels, Counter>,
    releases: Family<OutcomeLabels, Counter>,
    tracked_pods: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    resource: String,
    kind: String,
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let events = Family::default();
        prom.register(
            "events",
            "Count of pod and namespace events handled",
            events.clone(),
        );

        let allocations = Family::default();
        prom.register(
            "identity_allocations",
            "Count of identity references taken",
            allocations.clone(),
        );

        let releases = Family::default();
        prom.register(
            "identity_releases",
            "Count of identity references returned",
            releases.clone(),
        );

        let tracked_pods = Gauge::default();
        prom.register(
            "tracked_pods",
            "Number of pods with a reconciled endpoint",
            tracked_pods.clone(),
        );

        Self {
            events,
            allocations,
            releases,
            tracked_pods,
        }
    }

    pub(crate) fn event_handled(&self, resource: &str, kind: EventKind, outcome: &str) {
        let kind = match kind {
            EventKind::Sync => "sync",
            EventKind::Upsert => "upsert",
            EventKind::Delete => "delete",
        };
        self.events
            .get_or_create(&EventLabels {
                resource: resource.to_string(),
                kind: kind.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub(crate) fn allocated(&self, outcome: &str) {
        self.allocations
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub(crate) fn released(&self, outcome: &str) {
        self.releases
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub(crate) fn set_tracked_pods(&self, n: usize) {
        self.tracked_pods.set(n as i64);
    }
}
