#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod service_profile;

pub use self::service_profile::{
    RequestMatch, ResponseClassSpec, ResponseMatch, RouteSpec, ServiceProfile, ServiceProfileSpec,
    StatusRange,
};
pub use k8s_openapi::{
    api::core::v1::{Endpoints, EndpointsSubset, Namespace, Pod, Service, ServiceSpec, ServiceStatus},
    apimachinery::pkg::apis::meta::v1::Condition,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher::Event as WatchEvent,
    Client, CustomResource, Error,
};

/// The annotation that binds a `Service` to a `ServiceProfile` by name in
/// the service's own namespace (spec.md §4.5).
pub const SERVICE_PROFILE_ANNOTATION: &str = "linkerd.io/service-profile";

/// Namespace whose events are ignored by watchers (spec.md §4.2).
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
