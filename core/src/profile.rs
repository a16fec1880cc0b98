//! The raw shape of a profile's request-match / response-class rules, as
//! read off the `ServiceProfile` resource. Nodes here may be invalid (zero
//! or multiple populated fields, inverted status ranges); validation and
//! translation into the wire's tagged-variant form happens in the gRPC
//! stream adapter (spec.md §4.7), one node at a time, so that a single bad
//! node drops the whole update rather than corrupting a route.

/// A node in a request-match condition tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestMatchNode {
    pub all: Option<Vec<RequestMatchNode>>,
    pub any: Option<Vec<RequestMatchNode>>,
    pub not: Option<Box<RequestMatchNode>>,
    pub method: Option<String>,
    pub path_regex: Option<String>,
}

/// A node in a response-match condition tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseMatchNode {
    pub all: Option<Vec<ResponseMatchNode>>,
    pub any: Option<Vec<ResponseMatchNode>>,
    pub not: Option<Box<ResponseMatchNode>>,
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
}

/// One response class: a condition over the response plus whether matching
/// responses count as a failure (`IsFailure = !IsSuccess`, spec.md §4.7).
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseClass {
    pub condition: ResponseMatchNode,
    pub is_success: bool,
}

/// One route: a request-match condition and the response classes that
/// categorize its responses.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub name: String,
    pub condition: RequestMatchNode,
    pub response_classes: Vec<ResponseClass>,
}

/// The full body of a profile. An absent profile (no `ServiceProfile` bound,
/// or the bound one was deleted) is represented as `Profile::default()`, per
/// spec.md §3's "Absent profile is represented by an empty profile".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    pub routes: Vec<Route>,
}

impl Profile {
    pub fn empty() -> Self {
        Self::default()
    }
}
