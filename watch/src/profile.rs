//! Tracks `service → profileId` bindings (via the `linkerd.io/service-profile`
//! annotation) and `profileId → profile-body`, fanning out profile changes to
//! subscribed listeners (spec.md §4.5).
//!
//! Two permanent caches back the lazily-created subscriber bookkeeping:
//! `services` remembers the latest binding observed for a `ServiceId` (so a
//! late subscriber gets the right answer without waiting for the next
//! informer resync), `profile_cache` remembers the latest profile body for a
//! `ProfileId` the same way. The `profiles` table holds only listeners and is
//! torn down as soon as it's empty, per spec.md §3's ProfileEntry lifecycle.
//!
//! Locking order is `services → profiles`, matching spec.md §5's "Locking
//! discipline": an event handler for one kind never acquires the other's
//! write lock while holding its own.

use crate::metrics::WatchMetrics;
use ahash::AHashMap as HashMap;
use kube::ResourceExt;
use linkerd_destination_core::profile::Profile;
use linkerd_destination_core::{ListenerId, ProfileId, ProfileListener, ServiceId};
use linkerd_destination_k8s_api::service_profile::RouteSpec;
use linkerd_destination_k8s_api::{Service, ServiceProfile, SERVICE_PROFILE_ANNOTATION};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::instrument;

struct ServiceRecord {
    profile_id: Option<ProfileId>,
    /// Set once a `Service` event for this id has actually been observed;
    /// distinguishes a confirmed "no binding" from a subscribe-only
    /// placeholder, which is torn down once its listeners leave (mirrors
    /// `EndpointsWatcher`'s `ServiceKind::Unknown` bookkeeping).
    known: bool,
    listeners: Vec<Arc<dyn ProfileListener>>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            profile_id: None,
            known: false,
            listeners: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    services: RwLock<HashMap<ServiceId, ServiceRecord>>,
    profile_cache: RwLock<HashMap<ProfileId, Profile>>,
    profiles: RwLock<HashMap<ProfileId, Vec<Arc<dyn ProfileListener>>>>,
}

#[derive(Clone)]
pub struct ProfileWatcher(Arc<Inner>, WatchMetrics);

/// A handle returned from [`ProfileWatcher::subscribe`].
pub struct ProfileSubscription {
    service_id: ServiceId,
    listener_id: ListenerId,
}

/// The label under which this watcher's binding-table and profile-table
/// gauges are registered (spec.md §6's supplemented watcher-table metrics).
const SERVICE_METRIC_LABEL: &str = "profile_binding";
const PROFILE_METRIC_LABEL: &str = "profile_body";

impl ProfileWatcher {
    pub fn new(metrics: WatchMetrics) -> Self {
        Self(Arc::default(), metrics)
    }

    /// Refreshes this watcher's size gauges, mirroring
    /// `EndpointsWatcher::refresh_metrics`.
    fn refresh_metrics(&self) {
        self.1.set_entries(SERVICE_METRIC_LABEL, self.service_count());
        self.1.set_listeners(SERVICE_METRIC_LABEL, self.listener_count());
        self.1.set_entries(PROFILE_METRIC_LABEL, self.profile_count());
    }

    pub fn service_count(&self) -> usize {
        self.0.services.read().len()
    }

    pub fn profile_count(&self) -> usize {
        self.0.profiles.read().len()
    }

    /// Total listeners subscribed across every service binding, for the
    /// `watch_listeners` gauge (spec.md §6's supplemented watcher-table
    /// metrics).
    pub fn listener_count(&self) -> usize {
        self.0.services.read().values().map(|r| r.listeners.len()).sum()
    }

    #[instrument(skip(self, listener), fields(%service_id))]
    pub fn subscribe(
        &self,
        service_id: ServiceId,
        listener: Arc<dyn ProfileListener>,
    ) -> ProfileSubscription {
        let listener_id = listener.id();
        let profile_id = {
            let mut services = self.0.services.write();
            let record = services.entry(service_id.clone()).or_default();
            record.listeners.push(listener.clone());
            record.profile_id.clone()
        };

        self.bind(profile_id, listener);
        self.refresh_metrics();

        ProfileSubscription {
            service_id,
            listener_id,
        }
    }

    /// Idempotent, per spec.md §7's `AlreadyUnsubscribed`.
    #[instrument(skip(self, sub), fields(service_id = %sub.service_id))]
    pub fn unsubscribe(&self, sub: ProfileSubscription) {
        let profile_id = {
            let mut services = self.0.services.write();
            let Some(record) = services.get_mut(&sub.service_id) else {
                return;
            };
            record.listeners.retain(|l| l.id() != sub.listener_id);
            let profile_id = record.profile_id.clone();
            if record.listeners.is_empty() && !record.known {
                services.remove(&sub.service_id);
            }
            profile_id
        };

        self.unbind(profile_id, sub.listener_id);
        self.refresh_metrics();
    }

    /// Subscribes `listener` to `profile_id`'s ProfileEntry (creating it if
    /// necessary, seeded from the permanent body cache) and immediately
    /// delivers the current body. `profile_id = None` means "no binding":
    /// the listener observes the empty profile and is not tracked in
    /// `profiles` at all.
    fn bind(&self, profile_id: Option<ProfileId>, listener: Arc<dyn ProfileListener>) {
        match profile_id {
            Some(pid) => {
                let body = {
                    let mut profiles = self.0.profiles.write();
                    profiles.entry(pid.clone()).or_default().push(listener.clone());
                    self.0.profile_cache.read().get(&pid).cloned().unwrap_or_default()
                };
                listener.update(body);
            }
            None => listener.update(Profile::empty()),
        }
    }

    fn unbind(&self, profile_id: Option<ProfileId>, listener_id: ListenerId) {
        let Some(pid) = profile_id else {
            return;
        };
        let mut profiles = self.0.profiles.write();
        if let Some(listeners) = profiles.get_mut(&pid) {
            listeners.retain(|l| l.id() != listener_id);
            if listeners.is_empty() {
                profiles.remove(&pid);
            }
        }
    }

    #[instrument(skip(self, service))]
    pub(crate) fn apply_service(&self, service: Service) {
        let namespace = service.namespace().unwrap_or_default();
        let service_id = ServiceId::new(namespace.clone(), service.name_any());
        let new_profile_id = derive_profile_id(&service, &namespace);

        let (old_profile_id, listeners) = {
            let mut services = self.0.services.write();
            let record = services.entry(service_id).or_default();
            record.known = true;
            if record.profile_id == new_profile_id {
                return;
            }
            let old = std::mem::replace(&mut record.profile_id, new_profile_id.clone());
            (old, record.listeners.clone())
        };

        for listener in listeners {
            self.unbind(old_profile_id.clone(), listener.id());
            self.bind(new_profile_id.clone(), listener);
        }
        self.refresh_metrics();
    }

    #[instrument(skip(self))]
    pub(crate) fn delete_service(&self, namespace: String, name: String) {
        let service_id = ServiceId::new(namespace, name);
        let (old_profile_id, listeners) = {
            let mut services = self.0.services.write();
            let Some(record) = services.get_mut(&service_id) else {
                return;
            };
            record.known = false;
            let old = std::mem::replace(&mut record.profile_id, None);
            (old, record.listeners.clone())
        };

        for listener in &listeners {
            self.unbind(old_profile_id.clone(), listener.id());
            listener.update(Profile::empty());
        }
        self.refresh_metrics();
    }

    #[instrument(skip(self, profile))]
    pub(crate) fn apply_profile(&self, profile: ServiceProfile) {
        let namespace = profile.namespace().unwrap_or_default();
        let profile_id = ProfileId::new(namespace, profile.name_any());
        let body = translate_profile(&profile);

        self.0
            .profile_cache
            .write()
            .insert(profile_id.clone(), body.clone());

        let listeners = self
            .0
            .profiles
            .read()
            .get(&profile_id)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener.update(body.clone());
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn delete_profile(&self, namespace: String, name: String) {
        let profile_id = ProfileId::new(namespace, name);
        self.0.profile_cache.write().remove(&profile_id);

        let listeners = self
            .0
            .profiles
            .read()
            .get(&profile_id)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener.update(Profile::empty());
        }
    }

}

/// Derives the `ProfileId` bound to `service` via the
/// `linkerd.io/service-profile` annotation, scoped to the service's own
/// namespace (spec.md §4.5).
fn derive_profile_id(service: &Service, namespace: &str) -> Option<ProfileId> {
    let name = service.annotations().get(SERVICE_PROFILE_ANNOTATION)?;
    if name.is_empty() {
        return None;
    }
    Some(ProfileId::new(namespace.to_string(), name.clone()))
}

/// Maps the raw `ServiceProfile` CRD body into the watcher's internal,
/// possibly-invalid `Profile` shape. Validation against spec.md §4.7's
/// "exactly one field per node" / status-range rules happens in the gRPC
/// stream adapter, not here.
fn translate_profile(profile: &ServiceProfile) -> Profile {
    let routes = profile
        .spec
        .routes
        .iter()
        .map(translate_route)
        .collect();
    Profile { routes }
}

fn translate_route(route: &RouteSpec) -> linkerd_destination_core::profile::Route {
    linkerd_destination_core::profile::Route {
        name: route.name.clone(),
        condition: translate_request_match(&route.condition),
        response_classes: route
            .response_classes
            .iter()
            .map(|rc| linkerd_destination_core::profile::ResponseClass {
                condition: translate_response_match(&rc.condition),
                is_success: !rc.is_failure,
            })
            .collect(),
    }
}

fn translate_request_match(
    m: &linkerd_destination_k8s_api::service_profile::RequestMatch,
) -> linkerd_destination_core::profile::RequestMatchNode {
    linkerd_destination_core::profile::RequestMatchNode {
        all: m
            .all
            .as_ref()
            .map(|nodes| nodes.iter().map(translate_request_match).collect()),
        any: m
            .any
            .as_ref()
            .map(|nodes| nodes.iter().map(translate_request_match).collect()),
        not: m
            .not
            .as_ref()
            .map(|node| Box::new(translate_request_match(node))),
        method: m.method.clone(),
        path_regex: m.path_regex.clone(),
    }
}

fn translate_response_match(
    m: &linkerd_destination_k8s_api::service_profile::ResponseMatch,
) -> linkerd_destination_core::profile::ResponseMatchNode {
    linkerd_destination_core::profile::ResponseMatchNode {
        all: m
            .all
            .as_ref()
            .map(|nodes| nodes.iter().map(translate_response_match).collect()),
        any: m
            .any
            .as_ref()
            .map(|nodes| nodes.iter().map(translate_response_match).collect()),
        not: m
            .not
            .as_ref()
            .map(|node| Box::new(translate_response_match(node))),
        status_min: m.status.as_ref().and_then(|s| s.min),
        status_max: m.status.as_ref().and_then(|s| s.max),
    }
}

/// Bundles the watcher for both resource kinds it consumes, so a single
/// `kubert` index task per kind can drive it (analogous to
/// `crate::endpoints::EndpointsIndex`).
#[derive(Clone)]
pub struct ProfileIndex {
    pub watcher: ProfileWatcher,
}

impl kubert::index::IndexNamespacedResource<Service> for ProfileIndex {
    fn apply(&mut self, service: Service) {
        self.watcher.apply_service(service);
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
            self.watcher.apply_service(service);
        }
    }
}

impl kubert::index::IndexNamespacedResource<ServiceProfile> for ProfileIndex {
    fn apply(&mut self, profile: ServiceProfile) {
        self.watcher.apply_profile(profile);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.watcher.delete_profile(namespace, name);
    }

    fn reset(&mut self, profiles: Vec<ServiceProfile>, removed: kubert::index::NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.watcher.delete_profile(namespace.clone(), name);
            }
        }
        for profile in profiles {
            self.watcher.apply_profile(profile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::ListenerId;
    use parking_lot::Mutex;
    use prometheus_client::registry::Registry;

    fn test_metrics() -> WatchMetrics {
        WatchMetrics::register(&mut Registry::default())
    }

    #[derive(Default)]
    struct RecordingListener {
        id_once: std::sync::OnceLock<ListenerId>,
        updates: Mutex<Vec<Profile>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            let this = Self::default();
            let _ = this.id_once.set(ListenerId::next());
            Arc::new(this)
        }
    }

    impl std::fmt::Debug for RecordingListener {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RecordingListener").finish()
        }
    }

    impl ProfileListener for RecordingListener {
        fn id(&self) -> ListenerId {
            *self.id_once.get().unwrap()
        }

        fn update(&self, profile: Profile) {
            self.updates.lock().push(profile);
        }
    }

    fn service_with_profile(ns: &str, name: &str, profile: Option<&str>) -> Service {
        let mut svc = Service::default();
        svc.metadata.namespace = Some(ns.to_string());
        svc.metadata.name = Some(name.to_string());
        if let Some(profile) = profile {
            svc.metadata.annotations = Some(
                [(SERVICE_PROFILE_ANNOTATION.to_string(), profile.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        svc
    }

    fn profile_with_route(ns: &str, name: &str, path: &str) -> ServiceProfile {
        use linkerd_destination_k8s_api::{
            RequestMatch, ResponseClassSpec, ResponseMatch, RouteSpec, ServiceProfileSpec,
            StatusRange,
        };
        let mut sp = ServiceProfile::new(name, ServiceProfileSpec {
            routes: vec![RouteSpec {
                name: "x-y-z".to_string(),
                condition: RequestMatch {
                    path_regex: Some(path.to_string()),
                    ..Default::default()
                },
                response_classes: vec![ResponseClassSpec {
                    condition: ResponseMatch {
                        status: Some(StatusRange {
                            min: Some(500),
                            max: Some(500),
                        }),
                        ..Default::default()
                    },
                    is_failure: true,
                }],
            }],
        });
        sp.metadata.namespace = Some(ns.to_string());
        sp
    }

    #[test]
    fn rebind_observes_new_body_after_old() {
        let watcher = ProfileWatcher::new(test_metrics());
        watcher.apply_service(service_with_profile("ns", "name1", Some("foobar")));
        watcher.apply_profile(profile_with_route("ns", "foobar", "/x/y/z"));

        let listener = RecordingListener::new();
        let sub = watcher.subscribe(ServiceId::new("ns", "name1"), listener.clone());
        assert_eq!(listener.updates.lock().len(), 1);
        assert_eq!(listener.updates.lock()[0].routes.len(), 1);

        // Re-annotate to an unknown profile: expect an empty profile.
        watcher.apply_service(service_with_profile("ns", "name1", Some("blah")));
        let updates = listener.updates.lock();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].routes.is_empty());
        drop(updates);

        watcher.unsubscribe(sub);
    }

    #[test]
    fn unknown_service_yields_empty_profile() {
        let watcher = ProfileWatcher::new(test_metrics());
        let listener = RecordingListener::new();
        watcher.subscribe(ServiceId::new("ns", "nope"), listener.clone());
        assert_eq!(listener.updates.lock().len(), 1);
        assert!(listener.updates.lock()[0].routes.is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let watcher = ProfileWatcher::new(test_metrics());
        let listener = RecordingListener::new();
        let sub = watcher.subscribe(ServiceId::new("ns", "name1"), listener.clone());
        let sub2 = ProfileSubscription {
            service_id: ServiceId::new("ns", "name1"),
            listener_id: listener.id(),
        };
        watcher.unsubscribe(sub);
        watcher.unsubscribe(sub2);
    }
}
