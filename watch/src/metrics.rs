//! Table-size and fan-out gauges, following the shape of
//! `policy-controller/k8s/index/src/metrics.rs`'s `IndexMetrics`, adapted to
//! this crate's watcher tables instead of a generic `kubert` index.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WatcherLabels {
    watcher: &'static str,
}

/// Gauges shared by the endpoints, profile, and DNS watchers.
#[derive(Clone, Debug)]
pub struct WatchMetrics {
    entries: Family<WatcherLabels, Gauge>,
    listeners: Family<WatcherLabels, Gauge>,
}

impl WatchMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let entries = Family::default();
        registry.register(
            "watch_entries",
            "Number of entries currently tracked by a watcher table",
            entries.clone(),
        );

        let listeners = Family::default();
        registry.register(
            "watch_listeners",
            "Number of listeners currently subscribed across a watcher's entries",
            listeners.clone(),
        );

        Self { entries, listeners }
    }

    pub fn set_entries(&self, watcher: &'static str, count: usize) {
        self.entries
            .get_or_create(&WatcherLabels { watcher })
            .set(count as i64);
    }

    pub fn set_listeners(&self, watcher: &'static str, count: usize) {
        self.listeners
            .get_or_create(&WatcherLabels { watcher })
            .set(count as i64);
    }
}
