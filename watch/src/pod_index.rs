//! Pod indexing for endpoint-metadata labels (spec.md's "out of scope,
//! treated as external collaborator": "specified only as a lookup function
//! `ip → pod metadata | none`"). Implemented here as a `kubert`-driven
//! namespaced index so the rest of the watch machinery only ever sees the
//! `PodIndex` trait.

use ahash::AHashMap as HashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use linkerd_destination_core::PodMeta;
use parking_lot::RwLock;
use std::{net::Ipv4Addr, sync::Arc};

/// A lookup from `(namespace, pod IP)` to pod metadata.
pub trait PodIndex: Send + Sync {
    fn lookup(&self, namespace: &str, ip: Ipv4Addr) -> Option<PodMeta>;
}

#[derive(Clone, Default)]
pub struct SharedPodIndex(Arc<RwLock<HashMap<String, HashMap<Ipv4Addr, PodMeta>>>>);

impl PodIndex for SharedPodIndex {
    fn lookup(&self, namespace: &str, ip: Ipv4Addr) -> Option<PodMeta> {
        self.0.read().get(namespace)?.get(&ip).cloned()
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for SharedPodIndex {
    fn apply(&mut self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false);

        let ips: Vec<Ipv4Addr> = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ips.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|ip| ip.ip.as_deref())
            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .collect();
        if ips.is_empty() {
            return;
        }

        let owner_labels = owner_labels(&pod);
        let controller_namespace = pod
            .annotations()
            .get("linkerd.io/control-plane-ns")
            .cloned();

        let meta = PodMeta {
            name,
            namespace: namespace.clone(),
            owner_labels,
            controller_namespace,
            running,
        };

        let mut by_ns = self.0.write();
        let entry = by_ns.entry(namespace).or_default();
        for ip in ips {
            entry.insert(ip, meta.clone());
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let mut by_ns = self.0.write();
        if let Some(pods) = by_ns.get_mut(&namespace) {
            pods.retain(|_, meta| meta.name != name);
            if pods.is_empty() {
                by_ns.remove(&namespace);
            }
        }
    }

    fn reset(&mut self, pods: Vec<Pod>, removed: kubert::index::NamespacedRemoved) {
        let mut by_ns = self.0.write();
        by_ns.clear();
        drop(by_ns);
        for pod in pods {
            self.apply(pod);
        }
        let _ = removed;
    }
}

/// Owner labels keyed by owner kind, lowercased to match the wire's metric
/// label names (spec.md §6.3).
fn owner_labels(pod: &Pod) -> HashMap<String, String> {
    let mut labels = HashMap::default();
    for owner in pod.owner_references() {
        let kind = owner.kind.to_ascii_lowercase();
        match kind.as_str() {
            "replicaset" | "daemonset" | "statefulset" | "job" | "replicationcontroller" => {
                labels.insert(kind, owner.name.clone());
                if owner.kind == "ReplicaSet" {
                    if let Some(deployment) = deployment_name_from_replica_set(&owner.name) {
                        labels.insert("deployment".to_string(), deployment);
                    }
                }
            }
            _ => {}
        }
    }
    labels
}

/// A `ReplicaSet` created by a `Deployment` is named `<deployment>-<hash>`;
/// this recovers the deployment name the same way the proxy's metric labels
/// do, without an extra API call.
fn deployment_name_from_replica_set(replica_set_name: &str) -> Option<String> {
    let (prefix, _hash) = replica_set_name.rsplit_once('-')?;
    Some(prefix.to_string())
}
