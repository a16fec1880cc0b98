//! Pure classification of a destination query's `host` component.
//!
//! `classify` is the sole source of truth for "is this a local Kubernetes
//! service?" decisions made elsewhere in the crate (the resolver chain, the
//! profile watcher's service lookup). It depends only on its arguments, never
//! on prior calls, so it can be called repeatedly and concurrently without
//! synchronization.

use crate::error::QueryError;
use std::net::Ipv4Addr;

/// The literal suffix accepted as an alias for the configured cluster zone,
/// per spec.md §4.1.
const CLUSTER_LOCAL_ALIAS: &str = "cluster.local";

/// A validated, opaque (non-local) DNS name: lowercased labels, no trailing
/// dot, already checked against the RFC 1123 label grammar.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DnsName(String);

impl DnsName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DnsName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The result of classifying a destination query's host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// `host` parsed as an IPv4 literal.
    Ip(Ipv4Addr),
    /// `host` named a local Kubernetes service: `<name>.<namespace>.svc...`.
    LocalService { name: String, namespace: String },
    /// `host` is an opaque external DNS name.
    External(DnsName),
}

/// Classifies a destination query's host, given the cluster's configured DNS
/// zone labels (e.g. `["cluster", "local"]`).
///
/// This is a pure function: the same `(host, zone)` pair always classifies
/// the same way.
pub fn classify(host: &str, zone: &[String]) -> Result<Destination, QueryError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(Destination::Ip(ip));
    }

    let trimmed = host.strip_suffix('.').unwrap_or(host);
    if trimmed.is_empty() {
        return Err(QueryError::MalformedPath(format!(
            "empty DNS name: {host:?}"
        )));
    }

    let labels: Vec<&str> = trimmed.split('.').collect();
    for label in &labels {
        validate_label(label).map_err(|reason| {
            QueryError::MalformedPath(format!("invalid label {label:?} in {host:?}: {reason}"))
        })?;
    }

    match strip_zone_suffix(&labels, zone) {
        Some(prefix) => match prefix {
            [service, namespace] => Ok(Destination::LocalService {
                name: (*service).to_string(),
                namespace: (*namespace).to_string(),
            }),
            _ => Err(QueryError::MalformedPath(format!(
                "{host:?} is not a service (expected exactly [service, namespace] before the \
                 cluster zone, federated services are not supported)"
            ))),
        },
        None => Ok(Destination::External(DnsName(
            labels.join(".").to_ascii_lowercase(),
        ))),
    }
}

/// Strips a trailing `svc.<zone>` (or `svc.cluster.local`) suffix from
/// `labels`, returning the remaining prefix labels. Returns `None` if the
/// labels don't end in a recognized zone suffix at all.
fn strip_zone_suffix<'a>(labels: &[&'a str], zone: &[String]) -> Option<&'a [&'a str]> {
    let zone_lower: Vec<String> = zone.iter().map(|l| l.to_ascii_lowercase()).collect();
    let cluster_local: Vec<&str> = CLUSTER_LOCAL_ALIAS.split('.').collect();

    for candidate_zone in [zone_lower.iter().map(String::as_str).collect::<Vec<_>>()]
        .into_iter()
        .chain(std::iter::once(cluster_local))
    {
        if candidate_zone.is_empty() {
            continue;
        }
        let needed = candidate_zone.len() + 1; // + "svc"
        if labels.len() <= needed {
            continue;
        }
        let tail_start = labels.len() - needed;
        let (prefix, rest) = labels.split_at(tail_start);
        if !rest[0].eq_ignore_ascii_case("svc") {
            continue;
        }
        let zone_part = &rest[1..];
        let matches = zone_part
            .iter()
            .zip(candidate_zone.iter())
            .all(|(got, want)| got.eq_ignore_ascii_case(want));
        if matches {
            return Some(prefix);
        }
    }

    None
}

/// Validates a single DNS label against the RFC 1123 label grammar, plus the
/// spec's further restriction that a label must contain at least one letter.
fn validate_label(label: &str) -> Result<(), &'static str> {
    if label.is_empty() {
        return Err("label is empty");
    }
    if label.len() > 63 {
        return Err("label exceeds 63 characters");
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err("label starts or ends with '-'");
    }
    let mut has_letter = false;
    for c in label.chars() {
        if c.is_ascii_alphabetic() {
            has_letter = true;
        } else if !(c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err("label contains an invalid character");
        }
    }
    if !has_letter {
        return Err("label is all-numeric");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Vec<String> {
        vec!["cluster".to_string(), "local".to_string()]
    }

    #[test]
    fn classifies_ip_literal() {
        assert_eq!(
            classify("192.0.2.7", &zone()).unwrap(),
            Destination::Ip("192.0.2.7".parse().unwrap())
        );
    }

    #[test]
    fn classifies_local_service() {
        assert_eq!(
            classify("name1.ns.svc.cluster.local", &zone()).unwrap(),
            Destination::LocalService {
                name: "name1".to_string(),
                namespace: "ns".to_string(),
            }
        );
    }

    #[test]
    fn accepts_cluster_local_alias_regardless_of_configured_zone() {
        let custom_zone = vec!["example".to_string(), "org".to_string()];
        assert_eq!(
            classify("name1.ns.svc.cluster.local", &custom_zone).unwrap(),
            Destination::LocalService {
                name: "name1".to_string(),
                namespace: "ns".to_string(),
            }
        );
    }

    #[test]
    fn classifies_opaque_external_name() {
        assert_eq!(
            classify("foo.example.com", &zone()).unwrap(),
            Destination::External(DnsName("foo.example.com".to_string()))
        );
    }

    #[test]
    fn rejects_federated_service_names() {
        assert!(classify("name1.ns.cluster.svc.cluster.local", &zone()).is_err());
    }

    #[test]
    fn rejects_all_numeric_labels() {
        assert!(classify("123.example.com", &zone()).is_err());
    }

    #[test]
    fn rejects_empty_labels() {
        assert!(classify("foo..com", &zone()).is_err());
    }

    #[test]
    fn rejects_overlong_labels() {
        let label = "a".repeat(64);
        let host = format!("{label}.com");
        assert!(classify(&host, &zone()).is_err());
    }

    #[test]
    fn classification_is_pure() {
        let a = classify("name1.ns.svc.cluster.local", &zone()).unwrap();
        let b = classify("name1.ns.svc.cluster.local", &zone()).unwrap();
        assert_eq!(a, b);
    }
}
