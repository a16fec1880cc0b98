//! Indexes `(service, port) → ServicePort` and fans out address diffs to
//! subscribed listeners (spec.md §4.2).
//!
//! Locking discipline follows spec.md §5: a single table-shape lock
//! (`Inner::table`) guards which `(ServiceId, port)` entries exist; each
//! entry's own lock (`Arc<RwLock<ServicePortState>>`) guards its mutable
//! fields and listener list. The table lock is always released before a
//! per-entry lock is taken — never the reverse.

use crate::pod_index::PodIndex;
use crate::metrics::WatchMetrics;
use ahash::AHashMap as HashMap;
use k8s_openapi::{
    api::core::v1::{Endpoints, Service},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use linkerd_destination_core::{
    diff, AddressDiff, AddressSet, EndpointEntry, EndpointListener, ListenerId, PodMeta,
    ServiceId, SubscribeError, TargetPort, TcpAddress,
};
use linkerd_destination_k8s_api::KUBE_SYSTEM_NAMESPACE;
use parking_lot::RwLock;
use std::{net::Ipv4Addr, sync::Arc};
use tracing::{instrument, warn};

/// Whether a `Service` backs its own endpoints or delegates to DNS.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ServiceKind {
    /// No `Service` object has been observed yet.
    Unknown,
    Normal,
    ExternalName(String),
}

#[derive(Clone, Debug)]
struct ServicePortSpec {
    target_port_name: Option<String>,
    target_port_number: u16,
}

struct ServiceRecord {
    kind: ServiceKind,
    port_specs: HashMap<u16, ServicePortSpec>,
    endpoints: Option<Endpoints>,
    by_port: HashMap<u16, Arc<RwLock<ServicePortState>>>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            kind: ServiceKind::Unknown,
            port_specs: HashMap::default(),
            endpoints: None,
            by_port: HashMap::default(),
        }
    }
}

struct ServicePortState {
    target_port: TargetPort,
    addresses: AddressSet,
    listeners: Vec<Arc<dyn EndpointListener>>,
}

/// A handle returned from [`EndpointsWatcher::subscribe`]. Dropping it does
/// not unsubscribe; callers must call [`unsubscribe`](Self::unsubscribe)
/// explicitly from the stream-close handler, per spec.md §9's "a listener
/// must never re-enter the watcher that is calling it".
pub struct EndpointsSubscription {
    service_id: ServiceId,
    port: u16,
    listener_id: ListenerId,
}

struct Inner {
    table: RwLock<HashMap<ServiceId, ServiceRecord>>,
    metrics: WatchMetrics,
}

#[derive(Clone)]
pub struct EndpointsWatcher(Arc<Inner>);

/// The label under which this watcher's table-size and listener-count
/// gauges are registered (spec.md §6's supplemented watcher-table metrics).
const METRIC_LABEL: &str = "endpoints";

impl EndpointsWatcher {
    pub fn new(metrics: WatchMetrics) -> Self {
        Self(Arc::new(Inner {
            table: RwLock::default(),
            metrics,
        }))
    }

    /// Refreshes this watcher's size gauges. Called after every mutation
    /// that can change the table shape or a listener list, mirroring
    /// `policy-controller/k8s/index/src/metrics.rs`'s `IndexMetrics`
    /// updating its gauges alongside each apply/delete.
    fn refresh_metrics(&self) {
        self.0.metrics.set_entries(METRIC_LABEL, self.entry_count());
        self.0.metrics.set_listeners(METRIC_LABEL, self.listener_count());
    }

    pub fn entry_count(&self) -> usize {
        self.0
            .table
            .read()
            .values()
            .map(|r| r.by_port.len())
            .sum()
    }

    /// Total listeners subscribed across every `(service, port)` entry, for
    /// the `watch_listeners` gauge (spec.md §6's supplemented watcher-table
    /// metrics).
    pub fn listener_count(&self) -> usize {
        self.0
            .table
            .read()
            .values()
            .flat_map(|r| r.by_port.values())
            .map(|state| state.read().listeners.len())
            .sum()
    }

    /// Returns `true` if `service_id` is known and not an `ExternalName`
    /// service (spec.md §4.2 step 2), used by the Kubernetes resolver to
    /// decide whether to delegate to the DNS watcher instead (spec.md §4.4).
    pub fn external_name(&self, service_id: &ServiceId) -> Option<String> {
        match self.0.table.read().get(service_id).map(|r| &r.kind) {
            Some(ServiceKind::ExternalName(name)) => Some(name.clone()),
            _ => None,
        }
    }

    #[instrument(skip(self, listener), fields(%service_id, port))]
    pub fn subscribe(
        &self,
        service_id: ServiceId,
        port: u16,
        pods: &dyn PodIndex,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<EndpointsSubscription, SubscribeError> {
        let listener_id = listener.id();
        let (state_arc, exists) = {
            let mut table = self.0.table.write();
            let record = table.entry(service_id.clone()).or_default();
            let exists = matches!(record.kind, ServiceKind::Normal);
            let endpoints = record.endpoints.clone();
            let namespace = service_id.namespace.clone();
            let state_arc = record.by_port.entry(port).or_insert_with(|| {
                let target_port = target_port_for(&record.port_specs, port);
                let addresses = if exists {
                    derive_addresses(&namespace, &target_port, endpoints.as_ref(), pods)
                } else {
                    AddressSet::new()
                };
                Arc::new(RwLock::new(ServicePortState {
                    target_port,
                    addresses,
                    listeners: Vec::new(),
                }))
            });
            (state_arc.clone(), exists)
        };

        {
            let mut state = state_arc.write();
            state.listeners.push(listener.clone());
            if !exists {
                listener.no_endpoints(false);
            } else if state.addresses.is_empty() {
                listener.no_endpoints(true);
            } else {
                let added = state
                    .addresses
                    .iter()
                    .map(|(addr, meta)| EndpointEntry {
                        addr: *addr,
                        meta: meta.cloned(),
                    })
                    .collect();
                listener.update(AddressDiff {
                    added,
                    removed: Vec::new(),
                });
            }
        }

        self.refresh_metrics();
        Ok(EndpointsSubscription {
            service_id,
            port,
            listener_id,
        })
    }

    /// Idempotent: unsubscribing twice (or a subscription whose entry has
    /// already been torn down) is a no-op (spec.md §7's `AlreadyUnsubscribed`).
    #[instrument(skip(self, sub), fields(service_id = %sub.service_id, port = sub.port))]
    pub fn unsubscribe(&self, sub: EndpointsSubscription) {
        let mut table = self.0.table.write();
        let Some(record) = table.get_mut(&sub.service_id) else {
            return;
        };
        let Some(state_arc) = record.by_port.get(&sub.port).cloned() else {
            return;
        };
        let now_empty = {
            let mut state = state_arc.write();
            state.listeners.retain(|l| l.id() != sub.listener_id);
            state.listeners.is_empty()
        };
        if now_empty {
            record.by_port.remove(&sub.port);
            if record.by_port.is_empty() && record.kind == ServiceKind::Unknown {
                table.remove(&sub.service_id);
            }
        }
        drop(table);
        self.refresh_metrics();
    }

    #[instrument(skip(self, pods))]
    pub(crate) fn apply_service(&self, service: Service, pods: &dyn PodIndex) {
        let namespace = service.namespace().unwrap_or_default();
        if namespace == KUBE_SYSTEM_NAMESPACE {
            return;
        }
        let service_id = ServiceId::new(namespace.clone(), service.name_any());
        let kind = classify_service(&service);
        let port_specs = port_specs(&service);

        let mut table = self.0.table.write();
        let record = table.entry(service_id).or_default();
        record.kind = kind;
        record.port_specs = port_specs;
        let exists = matches!(record.kind, ServiceKind::Normal);
        let endpoints = record.endpoints.clone();

        for (&port, state_arc) in record.by_port.iter() {
            let new_target = target_port_for(&record.port_specs, port);
            let mut state = state_arc.write();
            if state.target_port == new_target && exists {
                continue;
            }
            state.target_port = new_target;
            if !exists {
                signal_no_endpoints(&mut state, false);
            } else {
                let new_addresses =
                    derive_addresses(&namespace, &state.target_port, endpoints.as_ref(), pods);
                signal_addresses(&mut state, new_addresses);
            }
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn delete_service(&self, namespace: String, name: String) {
        if namespace == KUBE_SYSTEM_NAMESPACE {
            return;
        }
        let service_id = ServiceId::new(namespace, name);
        let mut table = self.0.table.write();
        let Some(record) = table.get_mut(&service_id) else {
            return;
        };
        record.kind = ServiceKind::Unknown;
        record.endpoints = None;
        for state_arc in record.by_port.values() {
            let mut state = state_arc.write();
            signal_no_endpoints(&mut state, false);
        }
    }

    #[instrument(skip(self, endpoints, pods))]
    pub(crate) fn apply_endpoints(&self, endpoints: Endpoints, pods: &dyn PodIndex) {
        let namespace = endpoints.namespace().unwrap_or_default();
        if namespace == KUBE_SYSTEM_NAMESPACE {
            return;
        }
        let service_id = ServiceId::new(namespace.clone(), endpoints.name_any());

        let mut table = self.0.table.write();
        let record = table.entry(service_id).or_default();
        record.endpoints = Some(endpoints.clone());
        for state_arc in record.by_port.values() {
            let mut state = state_arc.write();
            let new_addresses =
                derive_addresses(&namespace, &state.target_port, Some(&endpoints), pods);
            signal_addresses(&mut state, new_addresses);
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn delete_endpoints(&self, namespace: String, name: String) {
        if namespace == KUBE_SYSTEM_NAMESPACE {
            return;
        }
        let service_id = ServiceId::new(namespace, name);
        let mut table = self.0.table.write();
        let Some(record) = table.get_mut(&service_id) else {
            return;
        };
        record.endpoints = None;
        for state_arc in record.by_port.values() {
            let mut state = state_arc.write();
            signal_no_endpoints(&mut state, false);
        }
    }
}

fn signal_no_endpoints(state: &mut ServicePortState, exists: bool) {
    state.addresses = AddressSet::new();
    for listener in &state.listeners {
        listener.no_endpoints(exists);
    }
}

fn signal_addresses(state: &mut ServicePortState, new: AddressSet) {
    if new.is_empty() {
        signal_no_endpoints(state, true);
        return;
    }
    let delta = diff(&state.addresses, &new);
    state.addresses = new;
    if !delta.is_empty() {
        for listener in &state.listeners {
            listener.update(delta.clone());
        }
    }
}

fn target_port_for(port_specs: &HashMap<u16, ServicePortSpec>, port: u16) -> TargetPort {
    match port_specs.get(&port) {
        Some(spec) => {
            TargetPort::from_spec(port, spec.target_port_name.as_deref(), spec.target_port_number)
        }
        None => TargetPort::Number(port),
    }
}

fn classify_service(service: &Service) -> ServiceKind {
    match service.spec.as_ref().and_then(|s| s.type_.as_deref()) {
        Some("ExternalName") => ServiceKind::ExternalName(
            service
                .spec
                .as_ref()
                .and_then(|s| s.external_name.clone())
                .unwrap_or_default(),
        ),
        _ => ServiceKind::Normal,
    }
}

fn port_specs(service: &Service) -> HashMap<u16, ServicePortSpec> {
    let mut specs = HashMap::default();
    let Some(spec) = service.spec.as_ref() else {
        return specs;
    };
    for port in spec.ports.iter().flatten() {
        let (target_port_name, target_port_number) = match port.target_port.as_ref() {
            Some(IntOrString::String(name)) => (Some(name.clone()), 0),
            Some(IntOrString::Int(n)) => (None, *n as u16),
            None => (None, 0),
        };
        specs.insert(
            port.port as u16,
            ServicePortSpec {
                target_port_name,
                target_port_number,
            },
        );
    }
    specs
}

/// Derives an [`AddressSet`] from an `Endpoints` object for a resolved
/// `TargetPort` (spec.md §4.2's "Address-set derivation").
fn derive_addresses(
    namespace: &str,
    target_port: &TargetPort,
    endpoints: Option<&Endpoints>,
    pods: &dyn PodIndex,
) -> AddressSet {
    let Some(endpoints) = endpoints else {
        return AddressSet::new();
    };
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();

    let numeric_port = match target_port {
        TargetPort::Number(n) => Some(*n),
        TargetPort::Name(name) => subsets.iter().find_map(|subset| {
            subset
                .ports
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .map(|p| p.port as u16)
        }),
    };
    let Some(numeric_port) = numeric_port else {
        warn!(?target_port, "no subset port matches named target port");
        return AddressSet::new();
    };

    let mut set = AddressSet::new();
    for subset in subsets {
        for address in subset.addresses.as_deref().unwrap_or_default() {
            let Some(target_ref) = address.target_ref.as_ref() else {
                continue;
            };
            let Ok(ip) = address.ip.parse::<Ipv4Addr>() else {
                warn!(ip = %address.ip, "skipping non-IPv4 endpoint address");
                continue;
            };
            let pod_namespace = target_ref.namespace.as_deref().unwrap_or(namespace);
            let meta: Option<PodMeta> = pods.lookup(pod_namespace, ip);
            set.insert(TcpAddress::new(ip, numeric_port), meta);
        }
    }
    set
}

/// Bundles the watcher with the pod index it needs for address-set
/// derivation, so both can be driven by the same `kubert` resource watch
/// tasks (one index type per watched kind, per `kubert::index::namespaced`'s
/// contract).
#[derive(Clone)]
pub struct EndpointsIndex {
    pub watcher: EndpointsWatcher,
    pub pods: crate::pod_index::SharedPodIndex,
}

impl kubert::index::IndexNamespacedResource<Service> for EndpointsIndex {
    fn apply(&mut self, service: Service) {
        self.watcher.apply_service(service, &self.pods);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.watcher.delete_service(namespace, name);
    }

    fn reset(&mut self, services: Vec<Service>, removed: kubert::index::NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.watcher.delete_service(namespace.clone(), name);
            }
        }
        for service in services {
            self.watcher.apply_service(service, &self.pods);
        }
    }
}

impl kubert::index::IndexNamespacedResource<Endpoints> for EndpointsIndex {
    fn apply(&mut self, endpoints: Endpoints) {
        self.watcher.apply_endpoints(endpoints, &self.pods);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.watcher.delete_endpoints(namespace, name);
    }

    fn reset(&mut self, all: Vec<Endpoints>, removed: kubert::index::NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.watcher.delete_endpoints(namespace.clone(), name);
            }
        }
        for endpoints in all {
            self.watcher.apply_endpoints(endpoints, &self.pods);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::ListenerId;
    use parking_lot::Mutex;
    use prometheus_client::registry::Registry;
    use std::sync::Arc;

    fn test_metrics() -> WatchMetrics {
        WatchMetrics::register(&mut Registry::default())
    }

    struct RecordingListener {
        id: ListenerId,
        updates: Mutex<Vec<AddressDiff>>,
        no_endpoints: Mutex<Vec<bool>>,
    }

    impl Default for RecordingListener {
        fn default() -> Self {
            Self {
                id: ListenerId::next(),
                updates: Mutex::new(Vec::new()),
                no_endpoints: Mutex::new(Vec::new()),
            }
        }
    }

    impl std::fmt::Debug for RecordingListener {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RecordingListener").finish()
        }
    }

    impl EndpointListener for RecordingListener {
        fn id(&self) -> ListenerId {
            self.id
        }

        fn update(&self, diff: AddressDiff) {
            self.updates.lock().push(diff);
        }

        fn no_endpoints(&self, exists: bool) {
            self.no_endpoints.lock().push(exists);
        }
    }

    struct EmptyPods;
    impl PodIndex for EmptyPods {
        fn lookup(&self, _namespace: &str, _ip: Ipv4Addr) -> Option<PodMeta> {
            None
        }
    }

    #[test]
    fn subscribe_to_unknown_service_yields_no_endpoints_false() {
        let watcher = EndpointsWatcher::new(test_metrics());
        let listener = Arc::new(RecordingListener::default());
        let sub = watcher
            .subscribe(
                ServiceId::new("ns", "name4"),
                5959,
                &EmptyPods,
                listener.clone(),
            )
            .unwrap();
        assert_eq!(*listener.no_endpoints.lock(), vec![false]);
        watcher.unsubscribe(sub);
        assert_eq!(watcher.entry_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let watcher = EndpointsWatcher::new(test_metrics());
        let listener = Arc::new(RecordingListener::default());
        let sub = watcher
            .subscribe(
                ServiceId::new("ns", "name1"),
                8989,
                &EmptyPods,
                listener.clone(),
            )
            .unwrap();
        let sub2 = EndpointsSubscription {
            service_id: sub.service_id.clone(),
            port: sub.port,
            listener_id: sub.listener_id,
        };
        watcher.unsubscribe(sub);
        // A second unsubscribe of an already-removed entry must not panic.
        watcher.unsubscribe(sub2);
    }

    #[test]
    fn service_with_empty_endpoints_yields_no_endpoints_true() {
        let watcher = EndpointsWatcher::new(test_metrics());
        let mut service: Service = Default::default();
        service.metadata.namespace = Some("ns".to_string());
        service.metadata.name = Some("name2".to_string());
        service.spec = Some(k8s_openapi::api::core::v1::ServiceSpec {
            ports: Some(vec![k8s_openapi::api::core::v1::ServicePort {
                port: 7979,
                ..Default::default()
            }]),
            ..Default::default()
        });
        watcher.apply_service(service, &EmptyPods);

        let listener = Arc::new(RecordingListener::default());
        watcher
            .subscribe(ServiceId::new("ns", "name2"), 7979, &EmptyPods, listener.clone())
            .unwrap();
        assert_eq!(*listener.no_endpoints.lock(), vec![true]);
    }
}
