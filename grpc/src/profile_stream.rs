//! Wire translation and validation for the profile stream (spec.md §4.7): a
//! `ProfileListener` that turns a `Profile` into a
//! `linkerd2_proxy_api::destination::DestinationProfile`, validating each
//! condition-tree node before translating it. A single bad node drops the
//! whole update rather than propagating a partial, possibly-misleading
//! profile.

use linkerd2_proxy_api::destination::{self as proto, request_match, response_match};
use linkerd2_proxy_api::http_types::{self, http_method};
use linkerd_destination_core::profile::{Profile, RequestMatchNode, ResponseMatchNode, Route};
use linkerd_destination_core::{ListenerId, ProfileListener};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

pub type ProfileUpdateResult = Result<proto::DestinationProfile, tonic::Status>;

#[derive(Debug)]
pub struct ProfileTranslator {
    id: ListenerId,
    tx: mpsc::Sender<ProfileUpdateResult>,
}

impl ProfileTranslator {
    pub fn new(tx: mpsc::Sender<ProfileUpdateResult>) -> Self {
        Self {
            id: ListenerId::next(),
            tx,
        }
    }
}

impl ProfileListener for ProfileTranslator {
    fn id(&self) -> ListenerId {
        self.id
    }

    #[instrument(skip(self, profile), fields(listener = %self.id))]
    fn update(&self, profile: Profile) {
        match translate_profile(&profile) {
            Ok(dp) => {
                if let Err(error) = self.tx.try_send(Ok(dp)) {
                    warn!(listener = %self.id, %error, "failed to send profile update");
                }
            }
            Err(reason) => {
                warn!(listener = %self.id, %reason, "dropping invalid profile update");
            }
        }
    }
}

fn translate_profile(profile: &Profile) -> Result<proto::DestinationProfile, String> {
    let routes = profile
        .routes
        .iter()
        .map(translate_route)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(proto::DestinationProfile {
        routes,
        ..Default::default()
    })
}

fn translate_route(route: &Route) -> Result<proto::Route, String> {
    let condition = Some(validate_and_convert_request(&route.condition)?);
    let response_classes = route
        .response_classes
        .iter()
        .map(|rc| {
            Ok(proto::ResponseClass {
                condition: Some(validate_and_convert_response(&rc.condition)?),
                is_failure: !rc.is_success,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(proto::Route {
        condition,
        response_classes,
        ..Default::default()
    })
}

/// Counts populated fields and converts the single populated one, failing on
/// zero or more than one (spec.md §4.7's "Exactly one variant per node").
fn validate_and_convert_request(node: &RequestMatchNode) -> Result<proto::RequestMatch, String> {
    let populated = [
        node.all.is_some(),
        node.any.is_some(),
        node.not.is_some(),
        node.method.is_some(),
        node.path_regex.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if populated == 0 {
        return Err("request match node must have a field".to_string());
    }
    if populated > 1 {
        return Err("request match node has too many fields".to_string());
    }

    let m = if let Some(children) = &node.all {
        request_match::Match::All(request_match::Seq {
            matches: children
                .iter()
                .map(validate_and_convert_request)
                .collect::<Result<Vec<_>, _>>()?,
        })
    } else if let Some(children) = &node.any {
        request_match::Match::Any(request_match::Seq {
            matches: children
                .iter()
                .map(validate_and_convert_request)
                .collect::<Result<Vec<_>, _>>()?,
        })
    } else if let Some(child) = &node.not {
        request_match::Match::Not(Box::new(validate_and_convert_request(child)?))
    } else if let Some(method) = &node.method {
        request_match::Match::Method(to_http_method(method))
    } else if let Some(regex) = &node.path_regex {
        request_match::Match::Path(proto::PathMatch {
            regex: regex.clone(),
        })
    } else {
        unreachable!("populated == 1 guarantees one branch matches")
    };

    Ok(proto::RequestMatch { r#match: Some(m) })
}

fn validate_and_convert_response(node: &ResponseMatchNode) -> Result<proto::ResponseMatch, String> {
    let has_status = node.status_min.is_some() || node.status_max.is_some();
    let populated = [node.all.is_some(), node.any.is_some(), node.not.is_some(), has_status]
        .iter()
        .filter(|set| **set)
        .count();
    if populated == 0 {
        return Err("response match node must have a field".to_string());
    }
    if populated > 1 {
        return Err("response match node has too many fields".to_string());
    }

    let m = if let Some(children) = &node.all {
        response_match::Match::All(response_match::Seq {
            matches: children
                .iter()
                .map(validate_and_convert_response)
                .collect::<Result<Vec<_>, _>>()?,
        })
    } else if let Some(children) = &node.any {
        response_match::Match::Any(response_match::Seq {
            matches: children
                .iter()
                .map(validate_and_convert_response)
                .collect::<Result<Vec<_>, _>>()?,
        })
    } else if let Some(child) = &node.not {
        response_match::Match::Not(Box::new(validate_and_convert_response(child)?))
    } else {
        let (min, max) = (node.status_min, node.status_max);
        let (min, max) = match (min, max) {
            (Some(min), Some(max)) if max >= min => (min, max),
            _ => return Err("status range must have both min and max, with max >= min".to_string()),
        };
        response_match::Match::Status(proto::HttpStatusRange {
            min: u32::from(min),
            max: u32::from(max),
        })
    };

    Ok(proto::ResponseMatch { r#match: Some(m) })
}

/// Maps a route condition's method name onto the wire's `Registered`
/// enumeration when recognized, `Unregistered` otherwise (mirrors the
/// conduit-era proxy's `http_method::Type` conversion, generalized to the
/// same oneof shape used by the modern API).
fn to_http_method(name: &str) -> http_types::HttpMethod {
    let registered = match name.to_ascii_uppercase().as_str() {
        "GET" => Some(http_method::Registered::Get),
        "POST" => Some(http_method::Registered::Post),
        "PUT" => Some(http_method::Registered::Put),
        "DELETE" => Some(http_method::Registered::Delete),
        "PATCH" => Some(http_method::Registered::Patch),
        "OPTIONS" => Some(http_method::Registered::Options),
        "CONNECT" => Some(http_method::Registered::Connect),
        "HEAD" => Some(http_method::Registered::Head),
        "TRACE" => Some(http_method::Registered::Trace),
        _ => None,
    };
    http_types::HttpMethod {
        r#type: Some(match registered {
            Some(r) => http_method::Type::Registered(r as i32),
            None => http_method::Type::Unregistered(name.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::profile::{ResponseClass, RequestMatchNode as ReqNode, ResponseMatchNode as RespNode};

    #[tokio::test]
    async fn valid_route_translates() {
        let profile = Profile {
            routes: vec![Route {
                name: "x-y-z".to_string(),
                condition: ReqNode {
                    path_regex: Some("/x/y/z".to_string()),
                    ..Default::default()
                },
                response_classes: vec![ResponseClass {
                    condition: RespNode {
                        status_min: Some(500),
                        status_max: Some(500),
                        ..Default::default()
                    },
                    is_success: false,
                }],
            }],
        };

        let (tx, mut rx) = mpsc::channel(1);
        let translator = ProfileTranslator::new(tx);
        translator.update(profile);

        let dp = rx.recv().await.unwrap().unwrap();
        assert_eq!(dp.routes.len(), 1);
        let route = &dp.routes[0];
        assert!(matches!(
            route.condition.as_ref().unwrap().r#match,
            Some(request_match::Match::Path(_))
        ));
        assert_eq!(route.response_classes.len(), 1);
        assert!(route.response_classes[0].is_failure);
    }

    #[tokio::test]
    async fn node_with_two_fields_drops_whole_update() {
        let profile = Profile {
            routes: vec![Route {
                name: "bad".to_string(),
                condition: ReqNode {
                    path_regex: Some("/x".to_string()),
                    method: Some("GET".to_string()),
                    ..Default::default()
                },
                response_classes: vec![],
            }],
        };

        let (tx, mut rx) = mpsc::channel(1);
        let translator = ProfileTranslator::new(tx);
        translator.update(profile);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inverted_status_range_drops_whole_update() {
        let profile = Profile {
            routes: vec![Route {
                name: "bad-status".to_string(),
                condition: ReqNode {
                    path_regex: Some("/x".to_string()),
                    ..Default::default()
                },
                response_classes: vec![ResponseClass {
                    condition: RespNode {
                        status_min: Some(500),
                        status_max: Some(400),
                        ..Default::default()
                    },
                    is_success: false,
                }],
            }],
        };

        let (tx, mut rx) = mpsc::channel(1);
        let translator = ProfileTranslator::new(tx);
        translator.update(profile);

        assert!(rx.try_recv().is_err());
    }
}
