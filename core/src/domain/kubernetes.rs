// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Identity primitives for observed cluster objects.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// A namespace/name pair identifying a namespaced object of a known kind.
///
/// Rendered as `namespace/name` everywhere a resource is mentioned in logs,
/// conditions, or cache entry names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullName {
    pub namespace: String,
    pub name: String,
}

impl FullName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of a metadata block, defaulting the namespace to `default`
    /// the way the API server does for namespaced kinds.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for FullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The closed set of object kinds the controller watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Service,
    Endpoints,
    EndpointSlice,
    Secret,
    Namespace,
    Ingress,
    HttpProxy,
    TlsCertificateDelegation,
    ExtensionService,
    GatewayClass,
    Gateway,
    HttpRoute,
    TlsRoute,
    TcpRoute,
    GrpcRoute,
    ReferenceGrant,
    BackendTlsPolicy,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Service => "Service",
            ObjectKind::Endpoints => "Endpoints",
            ObjectKind::EndpointSlice => "EndpointSlice",
            ObjectKind::Secret => "Secret",
            ObjectKind::Namespace => "Namespace",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::HttpProxy => "HTTPProxy",
            ObjectKind::TlsCertificateDelegation => "TLSCertificateDelegation",
            ObjectKind::ExtensionService => "ExtensionService",
            ObjectKind::GatewayClass => "GatewayClass",
            ObjectKind::Gateway => "Gateway",
            ObjectKind::HttpRoute => "HTTPRoute",
            ObjectKind::TlsRoute => "TLSRoute",
            ObjectKind::TcpRoute => "TCPRoute",
            ObjectKind::GrpcRoute => "GRPCRoute",
            ObjectKind::ReferenceGrant => "ReferenceGrant",
            ObjectKind::BackendTlsPolicy => "BackendTLSPolicy",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
