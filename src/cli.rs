use anyhow::Result;
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, time::Duration};

/// Configuration recognized by the destination controller (spec.md §6.4).
#[derive(Debug, Parser)]
#[clap(name = "destination", about = "Linkerd 2 destination controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8086")]
    pub grpc_addr: SocketAddr,

    /// Address the watcher-readiness `/ready` endpoint binds to (spec.md §6
    /// expansion's "Admin/health server").
    #[clap(long, default_value = "0.0.0.0:8090")]
    pub ready_addr: SocketAddr,

    /// The labels forming the local cluster's DNS zone (`cluster.dns-zone`).
    /// `cluster.local` is always accepted as an alias regardless of this
    /// value (spec.md §4.1).
    #[clap(long, default_value = "cluster.local")]
    cluster_dns_zone: String,

    /// The port attributed to addresses resolved through the DNS watcher
    /// (`dns.default-port`).
    #[clap(long, default_value = "80")]
    dns_default_port: u16,

    /// How often a DNS informer re-polls its host, in seconds
    /// (`dns.poll-interval`).
    #[clap(long, default_value = "10")]
    dns_poll_interval_secs: u64,

    /// Attach mTLS pod-identity hints to endpoint addresses (spec.md §4.6,
    /// §6.3).
    #[clap(long)]
    pub identity_enabled: bool,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    /// Returns a [`kubert::Runtime`] configured by the CLI arguments, serving
    /// `prom` from the admin server's `/metrics` endpoint (spec.md §6
    /// expansion's "Admin/health server").
    pub async fn runtime(&self, prom: Registry) -> Result<kubert::Runtime<()>> {
        let admin = self.admin.clone().into_builder();

        kubert::Runtime::builder()
            .with_log(self.log_level.clone(), self.log_format.clone())
            .with_admin(admin.with_prometheus(prom))
            .with_client(self.client.clone())
            .build()
            .await
            .map_err(Into::into)
    }

    /// Returns the watch machinery's `ClusterInfo` as configured by the CLI
    /// arguments (spec.md §6.4).
    pub fn cluster_info(&self) -> linkerd_destination_watch::ClusterInfo {
        linkerd_destination_watch::ClusterInfo {
            dns_zone: self
                .cluster_dns_zone
                .split('.')
                .map(str::to_string)
                .collect(),
            dns_default_port: self.dns_default_port,
            dns_poll_interval: Duration::from_secs(self.dns_poll_interval_secs),
        }
    }

    pub async fn run(self) -> Result<()> {
        crate::run(self).await
    }
}
