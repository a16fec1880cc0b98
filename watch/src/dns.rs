//! Periodic external-DNS polling for hosts identified as opaque or as an
//! `ExternalName` service's target (spec.md §4.3).

use crate::metrics::WatchMetrics;
use linkerd_destination_core::{diff, AddressDiff, AddressSet, EndpointListener, ListenerId, TcpAddress};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{instrument, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

struct DnsInformer {
    addresses: AddressSet,
    listeners: Vec<Arc<dyn EndpointListener>>,
    stop: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DnsWatcher {
    resolver: TokioAsyncResolver,
    poll_interval: Duration,
    informers: Arc<Mutex<HashMap<String, Arc<Mutex<DnsInformer>>>>>,
    metrics: WatchMetrics,
}

/// The label under which this watcher's table-size and listener-count
/// gauges are registered (spec.md §6's supplemented watcher-table metrics).
const METRIC_LABEL: &str = "dns";

/// A handle returned from [`DnsWatcher::subscribe`], used to unsubscribe
/// from the stream-close handler.
pub struct DnsSubscription {
    host: String,
    port: u16,
    listener_id: ListenerId,
}

impl DnsWatcher {
    pub fn new(poll_interval: Duration, metrics: WatchMetrics) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self {
            resolver,
            poll_interval,
            informers: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        })
    }

    /// Refreshes this watcher's size gauges, mirroring
    /// `EndpointsWatcher::refresh_metrics`.
    fn refresh_metrics(&self) {
        self.metrics.set_entries(METRIC_LABEL, self.entry_count());
        self.metrics.set_listeners(METRIC_LABEL, self.listener_count());
    }

    pub fn entry_count(&self) -> usize {
        self.informers.lock().len()
    }

    /// Total listeners subscribed across every polled host, for the
    /// `watch_listeners` gauge (spec.md §6's supplemented watcher-table
    /// metrics).
    pub fn listener_count(&self) -> usize {
        self.informers
            .lock()
            .values()
            .map(|informer| informer.lock().listeners.len())
            .sum()
    }

    #[instrument(skip(self, listener), fields(%host, port))]
    pub fn subscribe(&self, host: &str, port: u16, listener: Arc<dyn EndpointListener>) -> DnsSubscription {
        let listener_id = listener.id();
        let informer = {
            let mut table = self.informers.lock();
            table
                .entry(host.to_string())
                .or_insert_with(|| {
                    let (stop_tx, stop_rx) = watch::channel(false);
                    let informer = Arc::new(Mutex::new(DnsInformer {
                        addresses: AddressSet::new(),
                        listeners: Vec::new(),
                        stop: stop_tx,
                    }));
                    tokio::spawn(poll_loop(
                        self.resolver.clone(),
                        host.to_string(),
                        port,
                        self.poll_interval,
                        informer.clone(),
                        stop_rx,
                    ));
                    informer
                })
                .clone()
        };

        let mut informer = informer.lock();
        informer.listeners.push(listener.clone());
        let added = informer
            .addresses
            .iter()
            .map(|(addr, meta)| linkerd_destination_core::EndpointEntry {
                addr: *addr,
                meta: meta.cloned(),
            })
            .collect();
        listener.update(AddressDiff {
            added,
            removed: Vec::new(),
        });
        drop(informer);
        self.refresh_metrics();

        DnsSubscription {
            host: host.to_string(),
            port,
            listener_id,
        }
    }

    #[instrument(skip(self, sub), fields(host = %sub.host))]
    pub fn unsubscribe(&self, sub: DnsSubscription) {
        let mut table = self.informers.lock();
        let Some(informer) = table.get(&sub.host).cloned() else {
            return;
        };
        let now_empty = {
            let mut informer = informer.lock();
            informer.listeners.retain(|l| l.id() != sub.listener_id);
            informer.listeners.is_empty()
        };
        if now_empty {
            let _ = informer.lock().stop.send(true);
            table.remove(&sub.host);
        }
        drop(table);
        self.refresh_metrics();
    }
}

async fn poll_loop(
    resolver: TokioAsyncResolver,
    host: String,
    port: u16,
    poll_interval: Duration,
    informer: Arc<Mutex<DnsInformer>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match resolver.lookup_ip(host.as_str()).await {
                    Ok(lookup) => {
                        let mut new_addresses = AddressSet::new();
                        for ip in lookup.iter() {
                            if let std::net::IpAddr::V4(ip) = ip {
                                new_addresses.insert(TcpAddress::new(ip, port), None);
                            }
                        }
                        let mut informer = informer.lock();
                        let delta = diff(&informer.addresses, &new_addresses);
                        informer.addresses = new_addresses;
                        if !delta.is_empty() {
                            for listener in &informer.listeners {
                                listener.update(delta.clone());
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%host, %error, "DNS lookup failed; leaving address set unchanged");
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}
