#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod cli;
mod index_list;

pub use self::cli::Args;
pub use linkerd_destination_core as core;
pub use linkerd_destination_grpc as grpc;
pub use linkerd_destination_k8s_api as api;
pub use linkerd_destination_watch as watch;

use anyhow::Result;
use futures::prelude::*;
use grpc::metrics::GrpcServerMetricsFamily;
use kube::runtime::watcher;
use linkerd_destination_watch::{
    DnsWatcher, EndpointsIndex, EndpointsWatcher, ExternalDnsResolver, IpEchoResolver,
    KubernetesResolver, ProfileIndex, ProfileWatcher, ResolverChain, SharedPodIndex, WatchMetrics,
};
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

/// Wires the cluster-cache watches, the endpoint/profile watch machinery,
/// the resolver chain, and the gRPC server together, then blocks until the
/// process is asked to shut down (spec.md §2's data flow, end to end).
pub(crate) async fn run(args: Args) -> Result<()> {
    let cluster_info = args.cluster_info();
    let grpc_addr = args.grpc_addr;
    let ready_addr = args.ready_addr;
    let identity_enabled = args.identity_enabled;

    let mut prom = Registry::default();
    let watch_metrics = WatchMetrics::register(prom.sub_registry_with_prefix("watch"));
    let grpc_metrics = Arc::new(GrpcServerMetricsFamily::register(
        prom.sub_registry_with_prefix("grpc_server"),
    ));

    let mut runtime = args.runtime(prom).await?;

    let pods = SharedPodIndex::default();
    let endpoints_watcher = EndpointsWatcher::new(watch_metrics.clone());
    let profile_watcher = ProfileWatcher::new(watch_metrics.clone());
    let dns_watcher = DnsWatcher::new(cluster_info.dns_poll_interval, watch_metrics)?;

    let pods_shared = Arc::new(RwLock::new(pods.clone()));
    let pod_events =
        runtime.watch_all::<k8s_openapi::api::core::v1::Pod>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(pods_shared, pod_events).instrument(info_span!("pods")));

    let endpoints_index = Arc::new(RwLock::new(EndpointsIndex {
        watcher: endpoints_watcher.clone(),
        pods: pods.clone(),
    }));
    let profile_index = Arc::new(RwLock::new(ProfileIndex {
        watcher: profile_watcher.clone(),
    }));

    let services = runtime.watch_all::<linkerd_destination_k8s_api::Service>(
        watcher::Config::default(),
    );
    let services_fanout = index_list::IndexList::new(endpoints_index.clone())
        .push(profile_index.clone())
        .shared();
    tokio::spawn(
        kubert::index::namespaced(services_fanout, services).instrument(info_span!("services")),
    );

    let endpoints = runtime.watch_all::<linkerd_destination_k8s_api::Endpoints>(
        watcher::Config::default(),
    );
    tokio::spawn(
        kubert::index::namespaced(endpoints_index, endpoints).instrument(info_span!("endpoints")),
    );

    let profiles = runtime.watch_all::<linkerd_destination_k8s_api::ServiceProfile>(
        watcher::Config::default(),
    );
    tokio::spawn(
        kubert::index::namespaced(profile_index, profiles)
            .instrument(info_span!("serviceprofiles")),
    );

    let resolver = Arc::new(ResolverChain::new(vec![
        Arc::new(IpEchoResolver),
        Arc::new(KubernetesResolver {
            endpoints: endpoints_watcher.clone(),
            dns: dns_watcher.clone(),
            pods: Arc::new(pods),
            dns_default_port: cluster_info.dns_default_port,
        }),
        Arc::new(ExternalDnsResolver {
            dns: dns_watcher,
            dns_default_port: cluster_info.dns_default_port,
        }),
    ]));

    let drain = runtime.shutdown_handle();
    tokio::spawn(
        serve_grpc(
            grpc_addr,
            cluster_info.dns_zone.clone(),
            resolver,
            profile_watcher.clone(),
            identity_enabled,
            drain.clone(),
            grpc_metrics,
        )
        .instrument(info_span!("grpc")),
    );

    let (ready_tx, ready_rx) = watch::channel(true);
    tokio::spawn(admin::serve(ready_addr, ready_rx).instrument(info_span!("admin")));
    // The readiness gate only ever flips false on explicit shutdown; cache
    // sync failures are retried by the underlying watch stream instead of
    // being surfaced as "not ready" (spec.md §7's CacheLookup policy).
    let _ready_tx = ready_tx;

    if runtime.run().await.is_err() {
        anyhow::bail!("aborted");
    }

    Ok(())
}

async fn serve_grpc(
    addr: std::net::SocketAddr,
    dns_zone: Vec<String>,
    resolver: Arc<ResolverChain>,
    profiles: ProfileWatcher,
    identity_enabled: bool,
    drain: drain::Watch,
    metrics: Arc<GrpcServerMetricsFamily>,
) -> Result<()> {
    let svc = grpc::server::DestinationServerImpl::new(
        dns_zone,
        resolver,
        profiles,
        identity_enabled,
        drain.clone(),
        metrics,
    )
    .svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = tonic::transport::Server::builder()
            .add_service(svc)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
