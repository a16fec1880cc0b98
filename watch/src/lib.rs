#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster_info;
pub mod dns;
pub mod endpoints;
pub mod metrics;
pub mod pod_index;
pub mod profile;
pub mod resolve;

pub use self::{
    cluster_info::ClusterInfo,
    dns::{DnsSubscription, DnsWatcher},
    endpoints::{EndpointsIndex, EndpointsSubscription, EndpointsWatcher},
    metrics::WatchMetrics,
    pod_index::{PodIndex, SharedPodIndex},
    profile::{ProfileIndex, ProfileSubscription, ProfileWatcher},
    resolve::{ExternalDnsResolver, IpEchoResolver, KubernetesResolver, ResolveSubscription, Resolver, ResolverChain},
};
