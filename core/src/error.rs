use thiserror::Error;

/// A malformed destination query, or a query that classifies in a way the
/// server can't honor. Surfaced to the proxy immediately; the stream is
/// never opened (spec.md §7).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("malformed destination path: {0}")]
    MalformedPath(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// An error encountered while establishing or maintaining a subscription.
/// `Unresolvable` and `Cache` are surfaced to the caller on the subscribe
/// path; on the event-handling path, cache errors are logged and swallowed
/// instead (the next event retries), per spec.md §7.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("no resolver can handle this destination: {0}")]
    Unresolvable(String),
    #[error("upstream cache error: {0}")]
    Cache(String),
}
