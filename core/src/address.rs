use ahash::AHashMap as HashMap;
use std::net::Ipv4Addr;

/// An IPv4 address plus port. Equality is structural.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl TcpAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Metadata about the pod backing an endpoint, used to emit metric labels
/// and, when mTLS is enabled, a pod-identity hint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodMeta {
    pub name: String,
    pub namespace: String,
    /// Owner labels such as `deployment`, `replicaset`,
    /// `replication-controller`, `daemonset`, `statefulset`, `job`, keyed by
    /// the owner kind.
    pub owner_labels: HashMap<String, String>,
    /// The namespace of the controller that issues this pod's identity, used
    /// to build the mTLS identity hint. `None` when the pod isn't mesh-injected.
    pub controller_namespace: Option<String>,
    /// Whether the pod is currently in the `Running` phase. Pods outside this
    /// phase still appear as addresses but are excluded from metric-label
    /// enrichment.
    pub running: bool,
}

/// A set of endpoint addresses, each optionally carrying pod metadata.
///
/// Keys are unique; iteration order is irrelevant. Two `AddressSet`s are
/// compared by key set (see [`crate::diff`]).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet(HashMap<TcpAddress, Option<PodMeta>>);

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: TcpAddress, meta: Option<PodMeta>) {
        self.0.insert(addr, meta);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, addr: &TcpAddress) -> Option<&PodMeta> {
        self.0.get(addr).and_then(|m| m.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TcpAddress, Option<&PodMeta>)> {
        self.0.iter().map(|(a, m)| (a, m.as_ref()))
    }
}

impl FromIterator<(TcpAddress, Option<PodMeta>)> for AddressSet {
    fn from_iter<T: IntoIterator<Item = (TcpAddress, Option<PodMeta>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single resolved endpoint: its address and, if known, its pod metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointEntry {
    pub addr: TcpAddress,
    pub meta: Option<PodMeta>,
}
