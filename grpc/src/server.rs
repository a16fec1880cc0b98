//! The Destination gRPC service (spec.md §4.8): parses queries, classifies
//! their host, and wires a proxy stream to either the resolver chain
//! (`Get`) or the profile watcher (`GetProfile`).
//!
//! Follows the shape of the teacher's `inbound.rs`: a thin `#[async_trait]`
//! impl over the generated server trait, a `response_stream` helper built on
//! `async_stream::try_stream!` racing the per-call receiver against
//! `drain::Watch`, and `tonic::Status` as the sole error currency crossing
//! the RPC boundary.

use futures::Stream;
use linkerd2_proxy_api::destination::{
    destination_server::{Destination, DestinationServer},
    DestinationProfile, GetDestination, Update,
};
use linkerd_destination_core::{classify, dns::Destination as Classified, QueryError, SubscribeError};
use linkerd_destination_watch::{ProfileWatcher, ResolverChain};
use std::{pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::endpoint_stream::{EndpointTranslator, StreamContext};
use crate::metrics::{GrpcServerMetricsFamily, ResponseObserver};
use crate::profile_stream::ProfileTranslator;

const GRPC_SERVICE: &str = "io.linkerd.proxy.destination.Destination";

const DEFAULT_PORT: u16 = 80;
/// The only scheme this server accepts in a `GetDestination` request
/// (spec.md §4.8's "rejects schemes other than the supported mesh scheme").
const SUPPORTED_SCHEME: &str = "k8s";
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct DestinationServerImpl {
    dns_zone: Arc<[String]>,
    resolver: Arc<ResolverChain>,
    profiles: ProfileWatcher,
    identity_enabled: bool,
    drain: drain::Watch,
    metrics: Arc<GrpcServerMetricsFamily>,
}

impl DestinationServerImpl {
    pub fn new(
        dns_zone: Vec<String>,
        resolver: Arc<ResolverChain>,
        profiles: ProfileWatcher,
        identity_enabled: bool,
        drain: drain::Watch,
        metrics: Arc<GrpcServerMetricsFamily>,
    ) -> Self {
        Self {
            dns_zone: dns_zone.into(),
            resolver,
            profiles,
            identity_enabled,
            drain,
            metrics,
        }
    }

    pub fn svc(self) -> DestinationServer<Self> {
        DestinationServer::new(self)
    }

    /// Splits `host[:port]`, defaulting the port to 80 and classifying the
    /// host, per spec.md §4.8.
    fn parse_destination(&self, path: &str) -> Result<(Classified, u16), tonic::Status> {
        let (host, port) = match path.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| to_status(QueryError::InvalidPort(port.to_string())))?;
                (host, port)
            }
            None => (path, DEFAULT_PORT),
        };

        let destination =
            classify(host, &self.dns_zone).map_err(to_status)?;
        Ok((destination, port))
    }
}

type BoxUpdateStream = Pin<Box<dyn Stream<Item = Result<Update, tonic::Status>> + Send + Sync>>;
type BoxProfileStream =
    Pin<Box<dyn Stream<Item = Result<DestinationProfile, tonic::Status>> + Send + Sync>>;

#[async_trait::async_trait]
impl Destination for DestinationServerImpl {
    type GetStream = BoxUpdateStream;

    #[instrument(skip(self, req))]
    async fn get(
        &self,
        req: tonic::Request<GetDestination>,
    ) -> Result<tonic::Response<Self::GetStream>, tonic::Status> {
        let GetDestination { scheme, path, .. } = req.into_inner();
        check_scheme(&scheme)?;
        let (destination, port) = self.parse_destination(&path)?;

        let observer = self.metrics.server_stream_rpc(GRPC_SERVICE, "Get").start();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let ctx = StreamContext {
            identity_enabled: self.identity_enabled,
            ..set_service_labels(&destination)
        };
        let listener = Arc::new(EndpointTranslator::new(ctx, tx));

        let sub = match self.resolver.resolve(&destination, port, listener).await {
            Ok(sub) => sub,
            Err(error) => {
                let status = to_status(error);
                observer.end(status.code());
                return Err(status);
            }
        };

        let resolver = self.resolver.clone();
        let drain = self.drain.clone();
        Ok(tonic::Response::new(response_stream(
            drain,
            rx,
            observer,
            move || resolver.unsubscribe(sub),
        )))
    }

    type GetProfileStream = BoxProfileStream;

    #[instrument(skip(self, req))]
    async fn get_profile(
        &self,
        req: tonic::Request<GetDestination>,
    ) -> Result<tonic::Response<Self::GetProfileStream>, tonic::Status> {
        let GetDestination { scheme, path, .. } = req.into_inner();
        check_scheme(&scheme)?;
        let (destination, _port) = self.parse_destination(&path)?;

        let observer = self
            .metrics
            .server_stream_rpc(GRPC_SERVICE, "GetProfile")
            .start();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let listener = Arc::new(ProfileTranslator::new(tx));

        let sub = match &destination {
            Classified::LocalService { name, namespace } => Some(self.profiles.subscribe(
                linkerd_destination_core::ServiceId::new(namespace.clone(), name.clone()),
                listener,
            )),
            // Non-local destinations have no profile; the watcher's
            // subscribe path would never fire, so emit the initial empty
            // profile directly and hold the stream open (spec.md §4.8).
            _ => {
                listener.update(linkerd_destination_core::profile::Profile::empty());
                None
            }
        };

        let profiles = self.profiles.clone();
        let drain = self.drain.clone();
        Ok(tonic::Response::new(response_stream(
            drain,
            rx,
            observer,
            move || {
                if let Some(sub) = sub {
                    profiles.unsubscribe(sub);
                }
            },
        )))
    }
}

fn check_scheme(scheme: &str) -> Result<(), tonic::Status> {
    if scheme != SUPPORTED_SCHEME {
        return Err(to_status(QueryError::UnsupportedScheme(scheme.to_string())));
    }
    Ok(())
}

fn set_service_labels(destination: &Classified) -> StreamContext {
    match destination {
        Classified::LocalService { name, namespace } => StreamContext {
            namespace: Some(namespace.clone()),
            service: Some(name.clone()),
            identity_enabled: false,
        },
        _ => StreamContext::default(),
    }
}

fn to_status(error: impl std::fmt::Display) -> tonic::Status {
    tonic::Status::invalid_argument(error.to_string())
}

impl From<QueryError> for tonic::Status {
    fn from(error: QueryError) -> Self {
        to_status(error)
    }
}

impl From<SubscribeError> for tonic::Status {
    fn from(error: SubscribeError) -> Self {
        tonic::Status::internal(error.to_string())
    }
}

/// Drives a proxy-facing stream from `rx`, racing it against
/// `drain.signaled()` so a server shutdown closes every active listener's
/// stream promptly (spec.md §4.8's `ClientClose | ServerClose` transition),
/// and runs `on_close` exactly once when the stream ends for any reason to
/// unsubscribe from the watcher it came from.
/// Runs `on_close` exactly once when dropped, whether the stream ended
/// normally or the client cancelled the RPC (dropping the stream without
/// ever observing `None`). Living inside the generator's captured state, it
/// unsubscribes from the watcher in every case a real listener needs to be
/// torn down, not just the ones the loop below returns from explicitly.
struct UnsubscribeOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for UnsubscribeOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

fn response_stream<T>(
    drain: drain::Watch,
    mut rx: mpsc::Receiver<Result<T, tonic::Status>>,
    observer: ResponseObserver,
    on_close: impl FnOnce() + Send + 'static,
) -> Pin<Box<dyn Stream<Item = Result<T, tonic::Status>> + Send + Sync>>
where
    T: Send + Sync + 'static,
{
    Box::pin(
        async_stream::try_stream! {
            let _guard = UnsubscribeOnDrop(Some(on_close));
            let observer = observer;
            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(Ok(update)) => {
                            observer.msg_sent();
                            yield update;
                        }
                        Some(Err(status)) => {
                            warn!(%status, "destination stream error");
                            observer.end(status.code());
                            return;
                        }
                        None => {
                            observer.end(tonic::Code::Ok);
                            return;
                        }
                    },
                    _ = &mut shutdown => {
                        observer.end(tonic::Code::Ok);
                        return;
                    }
                }
            }
        },
    )
}
