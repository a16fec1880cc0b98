//! Resolver chain: picks which address source answers a `Get` query once
//! the host has been classified (spec.md §4.4).
//!
//! Resolvers are tried in order; the first one that claims the query handles
//! it exclusively for the lifetime of the subscription. The default chain
//! is `[IpEchoResolver, KubernetesResolver]`, mirroring the teacher's
//! `inbound`/`outbound` split of "one handler wins, the rest are never
//! consulted" (`policy-controller/grpc/src/inbound.rs`'s `check_target`
//! gate, generalized here to a list instead of a single guard clause).
//!
//! Resolvers receive the classification already produced by
//! [`linkerd_destination_core::classify`] rather than the raw host, so the
//! zone configuration only has to be applied once, at the query's entry
//! point (the gRPC server).

use async_trait::async_trait;
use linkerd_destination_core::dns::Destination;
use linkerd_destination_core::{AddressDiff, EndpointEntry, EndpointListener, ServiceId, SubscribeError, TcpAddress};
use std::sync::Arc;

use crate::{dns::DnsWatcher, endpoints::EndpointsWatcher, pod_index::PodIndex};

/// A subscription handle returned by a resolver, torn down by calling
/// `unsubscribe` with the same listener identity.
pub enum ResolveSubscription {
    Ip,
    Endpoints(crate::endpoints::EndpointsSubscription),
    Dns(crate::dns::DnsSubscription),
}

/// One candidate address source in the chain.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Attempts to resolve `destination`/`port`, subscribing `listener` for
    /// ongoing updates on success. Returns `Ok(None)` to defer to the next
    /// resolver in the chain; `Err` to fail the query outright (claims it,
    /// but it cannot be resolved).
    async fn try_resolve(
        &self,
        destination: &Destination,
        port: u16,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<Option<ResolveSubscription>, SubscribeError>;

    fn unsubscribe(&self, sub: ResolveSubscription);
}

/// Resolves IPv4-literal hosts to themselves, with no ongoing watch: the
/// single address is delivered once and the "endpoints" never change
/// (spec.md §4.4, "IP echo").
pub struct IpEchoResolver;

#[async_trait]
impl Resolver for IpEchoResolver {
    async fn try_resolve(
        &self,
        destination: &Destination,
        port: u16,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<Option<ResolveSubscription>, SubscribeError> {
        let Destination::Ip(ip) = destination else {
            return Ok(None);
        };
        let addr = TcpAddress::new(*ip, port);
        listener.update(AddressDiff {
            added: vec![EndpointEntry { addr, meta: None }],
            removed: Vec::new(),
        });
        Ok(Some(ResolveSubscription::Ip))
    }

    fn unsubscribe(&self, _sub: ResolveSubscription) {}
}

/// Resolves `<name>.<namespace>.svc...` hosts against the cluster's
/// `Service`/`Endpoints` watcher, delegating to the DNS watcher when the
/// service turns out to be of type `ExternalName` (spec.md §4.4).
pub struct KubernetesResolver {
    pub endpoints: EndpointsWatcher,
    pub dns: DnsWatcher,
    pub pods: Arc<dyn PodIndex>,
    /// The port attributed to addresses resolved through the DNS watcher
    /// (`dns.default-port`, spec.md §6.4), used instead of the query's own
    /// port whenever a service's `ExternalName` delegates to DNS (spec.md
    /// §8's "ExternalName delegation" scenario: the proxy's requested port
    /// is for the local service, not for `foo`).
    pub dns_default_port: u16,
}

#[async_trait]
impl Resolver for KubernetesResolver {
    async fn try_resolve(
        &self,
        destination: &Destination,
        port: u16,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<Option<ResolveSubscription>, SubscribeError> {
        let Destination::LocalService { name, namespace } = destination else {
            return Ok(None);
        };
        let service_id = ServiceId::new(namespace.clone(), name.clone());

        if let Some(external_name) = self.endpoints.external_name(&service_id) {
            let sub = self.dns.subscribe(&external_name, self.dns_default_port, listener);
            return Ok(Some(ResolveSubscription::Dns(sub)));
        }

        let sub = self
            .endpoints
            .subscribe(service_id, port, self.pods.as_ref(), listener)?;
        Ok(Some(ResolveSubscription::Endpoints(sub)))
    }

    fn unsubscribe(&self, sub: ResolveSubscription) {
        match sub {
            ResolveSubscription::Ip => {}
            ResolveSubscription::Endpoints(sub) => self.endpoints.unsubscribe(sub),
            ResolveSubscription::Dns(sub) => self.dns.unsubscribe(sub),
        }
    }
}

/// Resolves an opaque external DNS name directly against the DNS watcher,
/// for hosts that never corresponded to a local service at all (spec.md
/// §4.3/§4.4). Tried after `KubernetesResolver` so a service's own
/// `ExternalName` delegation (which already knows the target name) takes
/// precedence over resolving the query's own host as DNS.
pub struct ExternalDnsResolver {
    pub dns: DnsWatcher,
    /// The port attributed to addresses resolved through the DNS watcher
    /// (`dns.default-port`, spec.md §6.4). A `DnsInformer` is shared by host
    /// alone (spec.md §4.3), so every subscriber of a given host observes
    /// addresses at this one configured port regardless of its own query's
    /// port.
    pub dns_default_port: u16,
}

#[async_trait]
impl Resolver for ExternalDnsResolver {
    async fn try_resolve(
        &self,
        destination: &Destination,
        _port: u16,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<Option<ResolveSubscription>, SubscribeError> {
        let Destination::External(name) = destination else {
            return Ok(None);
        };
        let sub = self.dns.subscribe(name.as_str(), self.dns_default_port, listener);
        Ok(Some(ResolveSubscription::Dns(sub)))
    }

    fn unsubscribe(&self, sub: ResolveSubscription) {
        if let ResolveSubscription::Dns(sub) = sub {
            self.dns.unsubscribe(sub);
        }
    }
}

/// Tries each resolver in order, returning the first that claims the query.
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    pub async fn resolve(
        &self,
        destination: &Destination,
        port: u16,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<ResolveSubscription, SubscribeError> {
        for resolver in &self.resolvers {
            if let Some(sub) = resolver
                .try_resolve(destination, port, listener.clone())
                .await?
            {
                return Ok(sub);
            }
        }
        Err(SubscribeError::Unresolvable(format!("{destination:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::ListenerId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        id_once: std::sync::OnceLock<ListenerId>,
        updates: Mutex<Vec<AddressDiff>>,
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

    impl EndpointListener for RecordingListener {
        fn id(&self) -> ListenerId {
            *self.id_once.get().unwrap()
        }

        fn update(&self, diff: AddressDiff) {
            self.updates.lock().push(diff);
        }

        fn no_endpoints(&self, _exists: bool) {}
    }

    #[tokio::test]
    async fn ip_echo_resolves_without_consulting_later_resolvers() {
        let chain = ResolverChain::new(vec![Arc::new(IpEchoResolver)]);
        let listener = RecordingListener::new();
        let destination = Destination::Ip("192.0.2.7".parse().unwrap());
        let sub = chain
            .resolve(&destination, 80, listener.clone())
            .await
            .unwrap();
        assert!(matches!(sub, ResolveSubscription::Ip));
        assert_eq!(listener.updates.lock().len(), 1);
        assert_eq!(listener.updates.lock()[0].added[0].addr.port, 80);
    }

    #[tokio::test]
    async fn unresolvable_destination_yields_error() {
        let chain = ResolverChain::new(vec![Arc::new(IpEchoResolver)]);
        let listener = RecordingListener::new();
        let destination = Destination::External(
            linkerd_destination_core::classify("foo.example.com", &[])
                .map(|d| match d {
                    Destination::External(name) => name,
                    _ => unreachable!(),
                })
                .unwrap(),
        );
        let result = chain.resolve(&destination, 80, listener).await;
        assert!(result.is_err());
    }
}
