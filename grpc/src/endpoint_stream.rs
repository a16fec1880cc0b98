//! Wire translation for the endpoint stream (spec.md §4.6): an
//! `EndpointListener` that turns `AddressDiff`/no-endpoints signals into
//! `linkerd2_proxy_api::destination::Update` messages and pushes them onto
//! an mpsc channel feeding the proxy's stream.
//!
//! Mirrors the teacher's `inbound.rs`/`outbound.rs` split of "pure
//! translation function, thin listener glue around a channel" but targets
//! the Destination API's `Update` oneof instead of `Server`.

use linkerd2_proxy_api::destination::{
    self as proto, update, AddrSet, NoEndpoints, TlsIdentity, WeightedAddr, WeightedAddrSet,
};
use linkerd_destination_core::{AddressDiff, EndpointListener, ListenerId, PodMeta, TcpAddress};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

pub type UpdateResult = Result<proto::Update, tonic::Status>;

/// Per-stream configuration carried alongside the channel (spec.md §4.6's
/// "pod-index lookup function, optional service-scoped metric labels, a
/// flag indicating whether mTLS identity hints are to be attached" — the
/// pod lookup itself has already happened by the time an `AddressSet`
/// reaches this listener, since `EndpointEntry::meta` is populated at
/// derivation time).
#[derive(Clone, Debug, Default)]
pub struct StreamContext {
    pub namespace: Option<String>,
    pub service: Option<String>,
    pub identity_enabled: bool,
}

impl StreamContext {
    fn set_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let (Some(ns), Some(svc)) = (&self.namespace, &self.service) {
            labels.insert("namespace".to_string(), ns.clone());
            labels.insert("service".to_string(), svc.clone());
        }
        labels
    }
}

#[derive(Debug)]
pub struct EndpointTranslator {
    id: ListenerId,
    ctx: StreamContext,
    tx: mpsc::Sender<UpdateResult>,
}

impl EndpointTranslator {
    pub fn new(ctx: StreamContext, tx: mpsc::Sender<UpdateResult>) -> Self {
        Self {
            id: ListenerId::next(),
            ctx,
            tx,
        }
    }

    fn send(&self, update: proto::Update) {
        if let Err(error) = self.tx.try_send(Ok(update)) {
            warn!(listener = %self.id, %error, "failed to send destination update");
        }
    }
}

impl EndpointListener for EndpointTranslator {
    fn id(&self) -> ListenerId {
        self.id
    }

    #[instrument(skip(self, diff), fields(listener = %self.id))]
    fn update(&self, diff: AddressDiff) {
        if !diff.added.is_empty() {
            let addrs = diff
                .added
                .iter()
                .map(|entry| to_weighted_addr(entry, &self.ctx))
                .collect();
            self.send(proto::Update {
                update: Some(update::Update::Add(WeightedAddrSet {
                    addrs,
                    metric_labels: self.ctx.set_labels(),
                })),
            });
        }

        if !diff.removed.is_empty() {
            let addrs = diff.removed.iter().map(|addr| to_tcp_address(*addr)).collect();
            self.send(proto::Update {
                update: Some(update::Update::Remove(AddrSet { addrs })),
            });
        }
    }

    #[instrument(skip(self), fields(listener = %self.id))]
    fn no_endpoints(&self, exists: bool) {
        self.send(proto::Update {
            update: Some(update::Update::NoEndpoints(NoEndpoints { exists })),
        });
    }
}

fn to_tcp_address(addr: TcpAddress) -> proto::TcpAddress {
    proto::TcpAddress {
        ip: Some(proto::IpAddress {
            ip: Some(proto::ip_address::Ip::Ipv4(u32::from(addr.ip))),
        }),
        port: u32::from(addr.port),
    }
}

fn to_weighted_addr(
    entry: &linkerd_destination_core::EndpointEntry,
    ctx: &StreamContext,
) -> WeightedAddr {
    let metric_labels = entry
        .meta
        .as_ref()
        .filter(|meta| meta.running)
        .map(pod_metric_labels)
        .unwrap_or_default();

    let tls_identity = entry
        .meta
        .as_ref()
        .filter(|_| ctx.identity_enabled)
        .and_then(identity_hint);

    WeightedAddr {
        addr: Some(to_tcp_address(entry.addr)),
        weight: 1,
        metric_labels,
        tls_identity,
        protocol_hint: None,
    }
}

fn pod_metric_labels(meta: &PodMeta) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("pod".to_string(), meta.name.clone());
    for (kind, name) in &meta.owner_labels {
        labels.insert(kind.clone(), name.clone());
    }
    labels
}

/// Composes a pod-identity hint from pod name, pod namespace, and the
/// issuing controller's namespace (spec.md §4.6), when the pod has one.
fn identity_hint(meta: &PodMeta) -> Option<TlsIdentity> {
    let controller_namespace = meta.controller_namespace.as_ref()?;
    Some(TlsIdentity {
        strategy: Some(proto::tls_identity::Strategy::DnsLikeIdentity(
            proto::tls_identity::DnsLikeIdentity {
                name: format!(
                    "{}.{}.identity.{}",
                    meta.name, meta.namespace, controller_namespace
                ),
            },
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::EndpointEntry;
    use std::net::Ipv4Addr;

    fn channel() -> (mpsc::Sender<UpdateResult>, mpsc::Receiver<UpdateResult>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn add_and_remove_become_separate_messages() {
        let (tx, mut rx) = channel();
        let translator = EndpointTranslator::new(StreamContext::default(), tx);
        translator.update(AddressDiff {
            added: vec![EndpointEntry {
                addr: TcpAddress::new(Ipv4Addr::new(10, 0, 0, 1), 80),
                meta: None,
            }],
            removed: vec![TcpAddress::new(Ipv4Addr::new(10, 0, 0, 2), 80)],
        });

        let first = rx.recv().await.unwrap().unwrap();
        assert!(matches!(first.update, Some(update::Update::Add(_))));
        let second = rx.recv().await.unwrap().unwrap();
        assert!(matches!(second.update, Some(update::Update::Remove(_))));
    }

    #[tokio::test]
    async fn empty_diff_sends_nothing() {
        let (tx, mut rx) = channel();
        let translator = EndpointTranslator::new(StreamContext::default(), tx);
        translator.update(AddressDiff {
            added: vec![],
            removed: vec![],
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_endpoints_forwards_exists_flag() {
        let (tx, mut rx) = channel();
        let translator = EndpointTranslator::new(StreamContext::default(), tx);
        translator.no_endpoints(true);
        let msg = rx.recv().await.unwrap().unwrap();
        assert!(matches!(
            msg.update,
            Some(update::Update::NoEndpoints(NoEndpoints { exists: true }))
        ));
    }
}
