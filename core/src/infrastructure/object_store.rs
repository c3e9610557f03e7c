// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory mirror of the observed cluster state.
//!
//! The store has exactly one writer (the informer dispatch task) and hands
//! the builder an immutable [`Snapshot`]. Objects are held behind `Arc` so
//! a snapshot is a map clone, never a deep copy.
//!
//! `insert`/`remove` report whether the change was *material*: whether it
//! could plausibly alter the DAG. Immaterial changes (status-only writes,
//! endpoints of unreferenced services, unreferenced secrets, foreign
//! ingress classes) are absorbed here so the rebuild loop never sees them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use serde::Serialize;
use tracing::trace;

use crate::domain::gateway::{
    BackendTLSPolicy, Gateway, GatewayClass, GRPCRoute, HTTPRoute, ReferenceGrant, TCPRoute,
    TLSRoute,
};
use crate::domain::httpproxy::{ExtensionService, HTTPProxy, TLSCertificateDelegation};
use crate::domain::kubernetes::{FullName, ObjectKind};

/// Annotation keys that may carry the ingress class.
const INGRESS_CLASS_ANNOTATIONS: &[&str] =
    &["isthmus.dev/ingress.class", "kubernetes.io/ingress.class"];

/// One observed object, as delivered by an informer.
#[derive(Debug, Clone)]
pub enum Object {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    EndpointSlice(Arc<EndpointSlice>),
    Secret(Arc<Secret>),
    Namespace(Arc<Namespace>),
    Ingress(Arc<Ingress>),
    HttpProxy(Arc<HTTPProxy>),
    TlsCertificateDelegation(Arc<TLSCertificateDelegation>),
    ExtensionService(Arc<ExtensionService>),
    GatewayClass(Arc<GatewayClass>),
    Gateway(Arc<Gateway>),
    HttpRoute(Arc<HTTPRoute>),
    TlsRoute(Arc<TLSRoute>),
    TcpRoute(Arc<TCPRoute>),
    GrpcRoute(Arc<GRPCRoute>),
    ReferenceGrant(Arc<ReferenceGrant>),
    BackendTlsPolicy(Arc<BackendTLSPolicy>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Service(_) => ObjectKind::Service,
            Object::Endpoints(_) => ObjectKind::Endpoints,
            Object::EndpointSlice(_) => ObjectKind::EndpointSlice,
            Object::Secret(_) => ObjectKind::Secret,
            Object::Namespace(_) => ObjectKind::Namespace,
            Object::Ingress(_) => ObjectKind::Ingress,
            Object::HttpProxy(_) => ObjectKind::HttpProxy,
            Object::TlsCertificateDelegation(_) => ObjectKind::TlsCertificateDelegation,
            Object::ExtensionService(_) => ObjectKind::ExtensionService,
            Object::GatewayClass(_) => ObjectKind::GatewayClass,
            Object::Gateway(_) => ObjectKind::Gateway,
            Object::HttpRoute(_) => ObjectKind::HttpRoute,
            Object::TlsRoute(_) => ObjectKind::TlsRoute,
            Object::TcpRoute(_) => ObjectKind::TcpRoute,
            Object::GrpcRoute(_) => ObjectKind::GrpcRoute,
            Object::ReferenceGrant(_) => ObjectKind::ReferenceGrant,
            Object::BackendTlsPolicy(_) => ObjectKind::BackendTlsPolicy,
        }
    }

    pub fn full_name(&self) -> FullName {
        fn meta_name<T: kube::Resource>(r: &T) -> FullName {
            FullName {
                namespace: r.meta().namespace.clone().unwrap_or_else(|| "default".into()),
                name: r.meta().name.clone().unwrap_or_default(),
            }
        }
        match self {
            Object::Service(o) => meta_name(o.as_ref()),
            Object::Endpoints(o) => meta_name(o.as_ref()),
            Object::EndpointSlice(o) => meta_name(o.as_ref()),
            Object::Secret(o) => meta_name(o.as_ref()),
            Object::Namespace(o) => meta_name(o.as_ref()),
            Object::Ingress(o) => meta_name(o.as_ref()),
            Object::HttpProxy(o) => meta_name(o.as_ref()),
            Object::TlsCertificateDelegation(o) => meta_name(o.as_ref()),
            Object::ExtensionService(o) => meta_name(o.as_ref()),
            Object::GatewayClass(o) => meta_name(o.as_ref()),
            Object::Gateway(o) => meta_name(o.as_ref()),
            Object::HttpRoute(o) => meta_name(o.as_ref()),
            Object::TlsRoute(o) => meta_name(o.as_ref()),
            Object::TcpRoute(o) => meta_name(o.as_ref()),
            Object::GrpcRoute(o) => meta_name(o.as_ref()),
            Object::ReferenceGrant(o) => meta_name(o.as_ref()),
            Object::BackendTlsPolicy(o) => meta_name(o.as_ref()),
        }
    }

    /// JSON projection with volatile fields stripped: two objects with equal
    /// material views cannot differ in any way the builder observes.
    fn material_view(&self) -> serde_json::Value {
        fn view<T: Serialize>(o: &T) -> serde_json::Value {
            let mut value = serde_json::to_value(o).unwrap_or(serde_json::Value::Null);
            if let Some(map) = value.as_object_mut() {
                map.remove("status");
                if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.remove("resourceVersion");
                    meta.remove("managedFields");
                    meta.remove("generation");
                }
            }
            value
        }
        match self {
            Object::Service(o) => view(o.as_ref()),
            Object::Endpoints(o) => view(o.as_ref()),
            Object::EndpointSlice(o) => view(o.as_ref()),
            Object::Secret(o) => view(o.as_ref()),
            Object::Namespace(o) => view(o.as_ref()),
            Object::Ingress(o) => view(o.as_ref()),
            Object::HttpProxy(o) => view(o.as_ref()),
            Object::TlsCertificateDelegation(o) => view(o.as_ref()),
            Object::ExtensionService(o) => view(o.as_ref()),
            Object::GatewayClass(o) => view(o.as_ref()),
            Object::Gateway(o) => view(o.as_ref()),
            Object::HttpRoute(o) => view(o.as_ref()),
            Object::TlsRoute(o) => view(o.as_ref()),
            Object::TcpRoute(o) => view(o.as_ref()),
            Object::GrpcRoute(o) => view(o.as_ref()),
            Object::ReferenceGrant(o) => view(o.as_ref()),
            Object::BackendTlsPolicy(o) => view(o.as_ref()),
        }
    }

    /// The ingress class this object carries, if the kind supports one.
    fn ingress_class(&self) -> Option<String> {
        let annotations = |meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta| {
            meta.annotations.as_ref().and_then(|a| {
                INGRESS_CLASS_ANNOTATIONS.iter().find_map(|k| a.get(*k).cloned())
            })
        };
        match self {
            Object::Ingress(o) => annotations(&o.metadata)
                .or_else(|| o.spec.as_ref().and_then(|s| s.ingress_class_name.clone())),
            Object::HttpProxy(o) => {
                annotations(&o.metadata).or_else(|| o.spec.ingress_class_name.clone())
            }
            _ => None,
        }
    }

    /// Whether this kind can reference services or secrets, i.e. whether a
    /// change to it must refresh the reverse indexes.
    fn is_routing_resource(&self) -> bool {
        matches!(
            self.kind(),
            ObjectKind::Ingress
                | ObjectKind::HttpProxy
                | ObjectKind::ExtensionService
                | ObjectKind::Gateway
                | ObjectKind::HttpRoute
                | ObjectKind::TlsRoute
                | ObjectKind::TcpRoute
                | ObjectKind::GrpcRoute
        )
    }
}

/// Immutable view of the store handed to the DAG builder.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub services: BTreeMap<FullName, Arc<Service>>,
    pub endpoints: BTreeMap<FullName, Arc<Endpoints>>,
    pub endpoint_slices: BTreeMap<FullName, Arc<EndpointSlice>>,
    pub secrets: BTreeMap<FullName, Arc<Secret>>,
    pub namespaces: BTreeMap<FullName, Arc<Namespace>>,
    pub ingresses: BTreeMap<FullName, Arc<Ingress>>,
    pub httpproxies: BTreeMap<FullName, Arc<HTTPProxy>>,
    pub delegations: BTreeMap<FullName, Arc<TLSCertificateDelegation>>,
    pub extension_services: BTreeMap<FullName, Arc<ExtensionService>>,
    pub gateway_classes: BTreeMap<FullName, Arc<GatewayClass>>,
    pub gateways: BTreeMap<FullName, Arc<Gateway>>,
    pub http_routes: BTreeMap<FullName, Arc<HTTPRoute>>,
    pub tls_routes: BTreeMap<FullName, Arc<TLSRoute>>,
    pub tcp_routes: BTreeMap<FullName, Arc<TCPRoute>>,
    pub grpc_routes: BTreeMap<FullName, Arc<GRPCRoute>>,
    pub reference_grants: BTreeMap<FullName, Arc<ReferenceGrant>>,
    pub backend_tls_policies: BTreeMap<FullName, Arc<BackendTLSPolicy>>,
}

/// The store itself. Writable from the informer dispatch task only.
#[derive(Debug, Default)]
pub struct ObjectStore {
    snapshot: Snapshot,
    /// Material views of stored objects, for status-only change detection.
    material_views: HashMap<(ObjectKind, FullName), serde_json::Value>,
    /// Whether the stored object was admitted by ingress class when last
    /// seen. A transition out of our class must still rebuild, or the
    /// resource would stay programmed forever.
    admitted: HashMap<(ObjectKind, FullName), bool>,
    /// Services referenced by at least one routing resource.
    referenced_services: HashSet<FullName>,
    /// Secrets referenced by a routing resource or the controller's own
    /// configuration.
    referenced_secrets: HashSet<FullName>,
    /// Secrets the operator configuration pins (always material).
    config_secrets: Vec<FullName>,
    /// Ingress classes admitted by this instance.
    ingress_classes: Vec<String>,
}

impl ObjectStore {
    pub fn new(ingress_classes: Vec<String>, config_secrets: Vec<FullName>) -> Self {
        let mut store = Self {
            ingress_classes,
            config_secrets,
            ..Self::default()
        };
        store.refresh_reverse_index();
        store
    }

    /// Upsert an object. Returns `true` when the change is material.
    pub fn insert(&mut self, object: Object) -> bool {
        let kind = object.kind();
        let name = object.full_name();
        let key = (kind, name.clone());
        let view = object.material_view();

        let unchanged = self
            .material_views
            .get(&key)
            .is_some_and(|previous| *previous == view);
        let was_admitted = self.admitted.get(&key).copied().unwrap_or(false);

        self.apply(object.clone());
        self.material_views.insert(key.clone(), view);
        self.admitted.insert(key, self.class_admitted(&object));

        if object.is_routing_resource() {
            self.refresh_reverse_index();
        }

        if unchanged {
            trace!(kind = %kind, resource = %name, "status-only update suppressed");
            return false;
        }
        self.is_material(&object, &name, was_admitted)
    }

    /// Remove an object. Returns `true` when the removal is material.
    pub fn remove(&mut self, object: &Object) -> bool {
        let kind = object.kind();
        let name = object.full_name();
        let key = (kind, name.clone());
        let existed = self.material_views.remove(&key).is_some();
        let was_admitted = self.admitted.remove(&key).unwrap_or(false);
        self.discard(kind, &name);
        if object.is_routing_resource() {
            self.refresh_reverse_index();
        }
        existed && self.is_material(object, &name, was_admitted)
    }

    /// Immutable view for the builder; O(size of the key maps).
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    /// Whether the named service is referenced by any routing resource.
    pub fn service_referenced(&self, name: &FullName) -> bool {
        self.referenced_services.contains(name)
    }

    fn is_material(&self, object: &Object, name: &FullName, was_admitted: bool) -> bool {
        match object {
            Object::Endpoints(_) | Object::EndpointSlice(_) => {
                // Endpoint data only matters for services some route sends
                // traffic to.
                self.referenced_services.contains(&endpoint_owner(object, name))
            }
            Object::Secret(_) => {
                self.referenced_secrets.contains(name)
                    || self.config_secrets.contains(name)
            }
            Object::Ingress(_) | Object::HttpProxy(_) => {
                self.class_admitted(object) || was_admitted
            }
            _ => true,
        }
    }

    /// Whether a class-bearing object is admitted by this instance. Kinds
    /// without an ingress class are always admitted.
    fn class_admitted(&self, object: &Object) -> bool {
        match object.ingress_class() {
            None => true,
            Some(class) => self.admits_class(&class),
        }
    }

    fn admits_class(&self, class: &str) -> bool {
        if self.ingress_classes.is_empty() {
            class == "isthmus"
        } else {
            self.ingress_classes.iter().any(|c| c == class)
        }
    }

    fn apply(&mut self, object: Object) {
        let name = object.full_name();
        match object {
            Object::Service(o) => {
                self.snapshot.services.insert(name, o);
            }
            Object::Endpoints(o) => {
                self.snapshot.endpoints.insert(name, o);
            }
            Object::EndpointSlice(o) => {
                self.snapshot.endpoint_slices.insert(name, o);
            }
            Object::Secret(o) => {
                self.snapshot.secrets.insert(name, o);
            }
            Object::Namespace(o) => {
                self.snapshot.namespaces.insert(name, o);
            }
            Object::Ingress(o) => {
                self.snapshot.ingresses.insert(name, o);
            }
            Object::HttpProxy(o) => {
                self.snapshot.httpproxies.insert(name, o);
            }
            Object::TlsCertificateDelegation(o) => {
                self.snapshot.delegations.insert(name, o);
            }
            Object::ExtensionService(o) => {
                self.snapshot.extension_services.insert(name, o);
            }
            Object::GatewayClass(o) => {
                self.snapshot.gateway_classes.insert(name, o);
            }
            Object::Gateway(o) => {
                self.snapshot.gateways.insert(name, o);
            }
            Object::HttpRoute(o) => {
                self.snapshot.http_routes.insert(name, o);
            }
            Object::TlsRoute(o) => {
                self.snapshot.tls_routes.insert(name, o);
            }
            Object::TcpRoute(o) => {
                self.snapshot.tcp_routes.insert(name, o);
            }
            Object::GrpcRoute(o) => {
                self.snapshot.grpc_routes.insert(name, o);
            }
            Object::ReferenceGrant(o) => {
                self.snapshot.reference_grants.insert(name, o);
            }
            Object::BackendTlsPolicy(o) => {
                self.snapshot.backend_tls_policies.insert(name, o);
            }
        }
    }

    fn discard(&mut self, kind: ObjectKind, name: &FullName) {
        match kind {
            ObjectKind::Service => {
                self.snapshot.services.remove(name);
            }
            ObjectKind::Endpoints => {
                self.snapshot.endpoints.remove(name);
            }
            ObjectKind::EndpointSlice => {
                self.snapshot.endpoint_slices.remove(name);
            }
            ObjectKind::Secret => {
                self.snapshot.secrets.remove(name);
            }
            ObjectKind::Namespace => {
                self.snapshot.namespaces.remove(name);
            }
            ObjectKind::Ingress => {
                self.snapshot.ingresses.remove(name);
            }
            ObjectKind::HttpProxy => {
                self.snapshot.httpproxies.remove(name);
            }
            ObjectKind::TlsCertificateDelegation => {
                self.snapshot.delegations.remove(name);
            }
            ObjectKind::ExtensionService => {
                self.snapshot.extension_services.remove(name);
            }
            ObjectKind::GatewayClass => {
                self.snapshot.gateway_classes.remove(name);
            }
            ObjectKind::Gateway => {
                self.snapshot.gateways.remove(name);
            }
            ObjectKind::HttpRoute => {
                self.snapshot.http_routes.remove(name);
            }
            ObjectKind::TlsRoute => {
                self.snapshot.tls_routes.remove(name);
            }
            ObjectKind::TcpRoute => {
                self.snapshot.tcp_routes.remove(name);
            }
            ObjectKind::GrpcRoute => {
                self.snapshot.grpc_routes.remove(name);
            }
            ObjectKind::ReferenceGrant => {
                self.snapshot.reference_grants.remove(name);
            }
            ObjectKind::BackendTlsPolicy => {
                self.snapshot.backend_tls_policies.remove(name);
            }
        }
    }

    /// Recompute the service and secret reverse indexes from the routing
    /// resources currently stored.
    fn refresh_reverse_index(&mut self) {
        let mut services = HashSet::new();
        let mut secrets = HashSet::new();

        for (name, ingress) in &self.snapshot.ingresses {
            let Some(spec) = ingress.spec.as_ref() else { continue };
            if let Some(default_backend) = spec
                .default_backend
                .as_ref()
                .and_then(|b| b.service.as_ref())
            {
                services.insert(FullName::new(&name.namespace, &default_backend.name));
            }
            for rule in spec.rules.iter().flatten() {
                for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
                    if let Some(svc) = path.backend.service.as_ref() {
                        services.insert(FullName::new(&name.namespace, &svc.name));
                    }
                }
            }
            for tls in spec.tls.iter().flatten() {
                if let Some(secret) = tls.secret_name.as_ref() {
                    secrets.insert(FullName::new(&name.namespace, secret));
                }
            }
        }

        for (name, proxy) in &self.snapshot.httpproxies {
            for route in &proxy.spec.routes {
                for service in &route.services {
                    services.insert(FullName::new(&name.namespace, &service.name));
                    if let Some(validation) = &service.validation {
                        secrets.insert(qualified_secret(&name.namespace, &validation.ca_secret));
                    }
                }
            }
            if let Some(tcp) = &proxy.spec.tcpproxy {
                for service in &tcp.services {
                    services.insert(FullName::new(&name.namespace, &service.name));
                }
            }
            if let Some(tls) = proxy.spec.virtualhost.as_ref().and_then(|v| v.tls.as_ref()) {
                if let Some(secret) = &tls.secret_name {
                    secrets.insert(qualified_secret(&name.namespace, secret));
                }
                if let Some(validation) = &tls.client_validation {
                    secrets.insert(qualified_secret(&name.namespace, &validation.ca_secret));
                }
            }
        }

        for (name, extension) in &self.snapshot.extension_services {
            for target in &extension.spec.services {
                services.insert(FullName::new(&name.namespace, &target.name));
            }
            if let Some(validation) = &extension.spec.validation {
                secrets.insert(qualified_secret(&name.namespace, &validation.ca_secret));
            }
        }

        for (name, gateway) in &self.snapshot.gateways {
            for listener in &gateway.spec.listeners {
                for cert in listener.tls.iter().flat_map(|t| t.certificate_refs.iter()) {
                    let namespace = cert.namespace.as_deref().unwrap_or(&name.namespace);
                    secrets.insert(FullName::new(namespace, &cert.name));
                }
            }
        }

        let mut backend_refs = Vec::new();
        for (name, route) in &self.snapshot.http_routes {
            for rule in &route.spec.rules {
                backend_refs.extend(rule.backend_refs.iter().map(|b| (name.clone(), b)));
            }
        }
        for (name, route) in &self.snapshot.tls_routes {
            for rule in &route.spec.rules {
                backend_refs.extend(rule.backend_refs.iter().map(|b| (name.clone(), b)));
            }
        }
        for (name, route) in &self.snapshot.tcp_routes {
            for rule in &route.spec.rules {
                backend_refs.extend(rule.backend_refs.iter().map(|b| (name.clone(), b)));
            }
        }
        for (name, route) in &self.snapshot.grpc_routes {
            for rule in &route.spec.rules {
                backend_refs.extend(rule.backend_refs.iter().map(|b| (name.clone(), b)));
            }
        }
        for (owner, backend) in backend_refs {
            let namespace = backend.namespace.as_deref().unwrap_or(&owner.namespace);
            services.insert(FullName::new(namespace, &backend.name));
        }

        self.referenced_services = services;
        self.referenced_secrets = secrets;
        for pinned in &self.config_secrets {
            self.referenced_secrets.insert(pinned.clone());
        }
    }
}

/// Secret references in HTTPProxy may be `name` or `namespace/name`.
fn qualified_secret(default_namespace: &str, reference: &str) -> FullName {
    match reference.split_once('/') {
        Some((namespace, name)) => FullName::new(namespace, name),
        None => FullName::new(default_namespace, reference),
    }
}

/// The service owning an endpoint object. Endpoints share the service name;
/// EndpointSlices carry it in the well-known label.
fn endpoint_owner(object: &Object, name: &FullName) -> FullName {
    match object {
        Object::EndpointSlice(slice) => {
            let service = slice
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("kubernetes.io/service-name"))
                .cloned()
                .unwrap_or_else(|| name.name.clone());
            FullName::new(&name.namespace, service)
        }
        _ => name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::httpproxy::{HTTPProxy, HTTPProxySpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn proxy_with_class(class: Option<&str>) -> Object {
        Object::HttpProxy(Arc::new(HTTPProxy {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("proxy".into()),
                ..Default::default()
            },
            spec: HTTPProxySpec {
                ingress_class_name: class.map(str::to_string),
                ..Default::default()
            },
            status: None,
        }))
    }

    #[test]
    fn class_transition_out_of_scope_is_still_material() {
        let mut store = ObjectStore::new(vec!["isthmus".to_string()], Vec::new());
        assert!(store.insert(proxy_with_class(Some("isthmus"))));
        // Handing the resource to another controller must trigger one last
        // rebuild so it gets unprogrammed.
        assert!(store.insert(proxy_with_class(Some("nginx"))));
        // Further churn under the foreign class stays immaterial.
        assert!(!store.insert(proxy_with_class(Some("traefik"))));
    }

    #[test]
    fn unreferenced_secret_is_immaterial() {
        let mut store = ObjectStore::new(Vec::new(), Vec::new());
        let secret = Object::Secret(Arc::new(k8s_openapi::api::core::v1::Secret {
            metadata: ObjectMeta {
                namespace: Some("certs".into()),
                name: Some("unused".into()),
                ..Default::default()
            },
            ..Default::default()
        }));
        assert!(!store.insert(secret));
    }

    #[test]
    fn status_only_update_is_immaterial() {
        let mut store = ObjectStore::new(Vec::new(), Vec::new());
        assert!(store.insert(proxy_with_class(None)));
        let with_status = match proxy_with_class(None) {
            Object::HttpProxy(proxy) => {
                let mut proxy = HTTPProxy::clone(&proxy);
                proxy.status = Some(crate::domain::httpproxy::HTTPProxyStatus {
                    current_status: Some("valid".into()),
                    ..Default::default()
                });
                Object::HttpProxy(Arc::new(proxy))
            }
            other => other,
        };
        assert!(!store.insert(with_status));
    }
}
