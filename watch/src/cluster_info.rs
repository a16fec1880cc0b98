use std::time::Duration;

/// Cluster-wide configuration needed by the watchers (spec.md §6.4's
/// recognised configuration keys).
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The labels forming the local cluster's DNS zone, e.g. `["cluster",
    /// "local"]` for `cluster.dns-zone=cluster.local`. `classify` also
    /// accepts the literal `cluster.local` suffix regardless of this value.
    pub dns_zone: Vec<String>,

    /// The port attributed to addresses resolved through the DNS watcher
    /// (`dns.default-port`, default 80).
    pub dns_default_port: u16,

    /// How often a `DnsInformer` re-polls its host (`dns.poll-interval`,
    /// default 10s).
    pub dns_poll_interval: Duration,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            dns_zone: vec!["cluster".to_string(), "local".to_string()],
            dns_default_port: 80,
            dns_poll_interval: Duration::from_secs(10),
        }
    }
}
