// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The routing DAG.
//!
//! Nodes are plain data, rebuilt from scratch on every reconciliation cycle
//! and never mutated in place. The graph is independent of the Envoy wire
//! schema; translation into discovery resources happens in
//! `infrastructure::translator`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::kubernetes::FullName;
use super::policy::{
    CircuitBreakerPolicy, DnsLookupFamily, HeaderManipulation, HealthCheckPolicy, LbStrategy,
    RetryPolicy, TimeoutPolicy, UpstreamProtocol,
};
use super::secret::ValidSecret;

/// Well-known listener names. The insecure listener serves cleartext HTTP
/// virtual hosts; the secure listener serves SNI-keyed filter chains.
pub const HTTP_LISTENER_NAME: &str = "ingress_http";
pub const HTTPS_LISTENER_NAME: &str = "ingress_https";

pub const HTTP_ROUTE_CONFIG: &str = "ingress_http";

/// Route-configuration name for one secure virtual host.
pub fn https_route_config(fqdn: &str) -> String {
    format!("https/{fqdn}")
}

/// The complete graph produced by one rebuild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    pub listeners: Vec<Listener>,
    /// Clusters keyed by their deterministic name.
    pub clusters: BTreeMap<String, Cluster>,
    /// Validated secrets keyed by cache entry name (`namespace/name`).
    pub secrets: BTreeMap<String, ValidSecret>,
}

impl Dag {
    /// Insert a cluster, keeping the first occurrence: two routes that hash
    /// to the same cluster name are by construction identical in every
    /// distinguishing parameter.
    pub fn add_cluster(&mut self, cluster: Cluster) -> String {
        let name = cluster.name.clone();
        self.clusters.entry(name.clone()).or_insert(cluster);
        name
    }

    pub fn add_secret(&mut self, secret: ValidSecret) -> String {
        let name = secret.cache_name();
        self.secrets.entry(name.clone()).or_insert(secret);
        name
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }
}

/// A bound (address, port) with the virtual hosts attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Cleartext virtual hosts, present only on the insecure listener.
    pub virtual_hosts: Vec<VirtualHost>,
    /// TLS virtual hosts keyed by SNI, present only on the secure listener.
    pub secure_virtual_hosts: Vec<SecureVirtualHost>,
    /// Raw TCP forwarding with no SNI, for dedicated TCP listeners.
    pub tcp_proxy: Option<TcpProxy>,
}

impl Listener {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            virtual_hosts: Vec::new(),
            secure_virtual_hosts: Vec::new(),
            tcp_proxy: None,
        }
    }
}

/// A cleartext virtual host: an FQDN and its ordered routes.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHost {
    pub fqdn: String,
    pub routes: Vec<Route>,
}

impl VirtualHost {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self { fqdn: fqdn.into(), routes: Vec::new() }
    }
}

/// TLS protocol versions accepted on listeners and upstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TlsVersion {
    V1_2,
    #[default]
    V1_3,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1.2" => Some(TlsVersion::V1_2),
            "1.3" => Some(TlsVersion::V1_3),
            _ => None,
        }
    }
}

/// Client-certificate requirements on a secure virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientValidation {
    /// Cache name of the CA bundle secret.
    pub ca_secret: String,
    pub optional: bool,
}

/// A TLS virtual host. Either terminates TLS (owning a keypair secret) or
/// passes the raw stream through to a TCP proxy keyed on SNI.
#[derive(Debug, Clone, PartialEq)]
pub struct SecureVirtualHost {
    pub virtual_host: VirtualHost,
    /// Cache name of the server keypair; `None` for passthrough.
    pub secret: Option<String>,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub cipher_suites: Vec<String>,
    pub client_validation: Option<ClientValidation>,
    /// TCP proxying for TLS-passthrough or `tcpproxy` stanzas.
    pub tcp_proxy: Option<TcpProxy>,
}

impl SecureVirtualHost {
    pub fn fqdn(&self) -> &str {
        &self.virtual_host.fqdn
    }

    pub fn is_passthrough(&self) -> bool {
        self.secret.is_none() && self.tcp_proxy.is_some()
    }
}

/// Raw-stream forwarding to a weighted set of clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpProxy {
    pub clusters: Vec<WeightedCluster>,
}

/// Path match kinds, ordered here only for derives; route ordering within a
/// host is decided by [`Route::compare`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(String),
}

impl PathMatch {
    pub fn program(&self) -> &str {
        match self {
            PathMatch::Prefix(p) | PathMatch::Exact(p) | PathMatch::Regex(p) => p,
        }
    }
}

impl Default for PathMatch {
    fn default() -> Self {
        PathMatch::Prefix("/".to_string())
    }
}

/// Header match operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderMatchKind {
    Present,
    NotPresent,
    Exact(String),
    NotExact(String),
    Contains(String),
    NotContains(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryParamMatchKind {
    Exact(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryParamMatch {
    pub name: String,
    pub kind: QueryParamMatchKind,
}

/// What a matched request does.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Forward to weighted clusters, optionally mirroring to another.
    Forward {
        clusters: Vec<WeightedCluster>,
        mirror: Option<String>,
    },
    Redirect(Redirect),
    DirectResponse {
        status: u32,
        body: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Redirect {
    pub hostname: Option<String>,
    pub scheme: Option<String>,
    pub port: Option<u16>,
    pub status_code: u32,
    pub path: Option<String>,
}

/// Reference to a cluster plus its traffic weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

/// Where a route came from, for ordering ties and status attribution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteOrigin {
    pub namespace: String,
    pub name: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A single route attached to a virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub method: Option<String>,
    pub action: RouteAction,
    pub timeouts: TimeoutPolicy,
    pub retry: Option<RetryPolicy>,
    pub request_headers: HeaderManipulation,
    pub response_headers: HeaderManipulation,
    pub prefix_rewrite: Option<String>,
    pub websocket: bool,
    pub origin: RouteOrigin,
}

impl Route {
    pub fn forward(path: PathMatch, clusters: Vec<WeightedCluster>) -> Self {
        Self {
            path,
            headers: Vec::new(),
            query_params: Vec::new(),
            method: None,
            action: RouteAction::Forward { clusters, mirror: None },
            timeouts: TimeoutPolicy::default(),
            retry: None,
            request_headers: HeaderManipulation::default(),
            response_headers: HeaderManipulation::default(),
            prefix_rewrite: None,
            websocket: false,
            origin: RouteOrigin::default(),
        }
    }

    /// Canonical encoding of the match conditions, used both for ordering
    /// and for duplicate detection.
    pub fn match_key(&self) -> String {
        let mut key = String::new();
        match &self.path {
            PathMatch::Prefix(p) => key.push_str(&format!("prefix:{p};")),
            PathMatch::Exact(p) => key.push_str(&format!("exact:{p};")),
            PathMatch::Regex(p) => key.push_str(&format!("regex:{p};")),
        }
        if let Some(method) = &self.method {
            key.push_str(&format!("method:{method};"));
        }
        let mut headers: Vec<String> =
            self.headers.iter().map(|h| format!("header:{}={:?};", h.name, h.kind)).collect();
        headers.sort();
        for h in headers {
            key.push_str(&h);
        }
        let mut params: Vec<String> = self
            .query_params
            .iter()
            .map(|q| format!("query:{}={:?};", q.name, q.kind))
            .collect();
        params.sort();
        for q in params {
            key.push_str(&q);
        }
        key
    }

    /// Ordering of routes within a virtual host. Longer match programs sort
    /// first, then lexicographic program, then method matches outrank
    /// header/query matches, then the richer condition set, then the full
    /// canonical condition encoding. Only for byte-identical conditions do
    /// the origin timestamp and (namespace, name) break the tie.
    pub fn compare(a: &Route, b: &Route) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        let by_len = b.path.program().len().cmp(&a.path.program().len());
        if by_len != Ordering::Equal {
            return by_len;
        }
        let by_program = a.path.program().cmp(b.path.program());
        if by_program != Ordering::Equal {
            return by_program;
        }
        let by_method = b.method.is_some().cmp(&a.method.is_some());
        if by_method != Ordering::Equal {
            return by_method;
        }
        let a_conds = a.headers.len() + a.query_params.len();
        let b_conds = b.headers.len() + b.query_params.len();
        let by_conds = b_conds.cmp(&a_conds);
        if by_conds != Ordering::Equal {
            return by_conds;
        }
        let by_key = a.match_key().cmp(&b.match_key());
        if by_key != Ordering::Equal {
            return by_key;
        }
        let by_time = match (&a.origin.creation_timestamp, &b.origin.creation_timestamp) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_time != Ordering::Equal {
            return by_time;
        }
        (&a.origin.namespace, &a.origin.name).cmp(&(&b.origin.namespace, &b.origin.name))
    }
}

/// Upstream TLS validation for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamValidation {
    /// Cache name of the CA bundle secret.
    pub ca_secret: String,
    /// Expected server identity.
    pub subject_name: String,
}

/// A backend pool: one Kubernetes Service port plus every parameter that
/// distinguishes how traffic reaches it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Deterministic name, see [`cluster_name`].
    pub name: String,
    pub service: FullName,
    pub port_name: Option<String>,
    pub port_number: u16,
    /// Load-assignment name shared with the endpoint translator.
    pub eds_name: String,
    pub lb_strategy: LbStrategy,
    pub health_check: Option<HealthCheckPolicy>,
    pub circuit_breakers: CircuitBreakerPolicy,
    pub protocol: Option<UpstreamProtocol>,
    pub upstream_validation: Option<UpstreamValidation>,
    pub sni: Option<String>,
    /// Set for external-name Services; the cluster resolves via DNS.
    pub external_name: Option<String>,
    pub external_port: u16,
    pub max_requests_per_connection: Option<u32>,
    pub dns_lookup_family: DnsLookupFamily,
    pub connect_timeout: Option<Duration>,
}

/// Load-assignment name for a service port: `namespace/service/port`. Shared
/// verbatim between the DAG builder (EDS references) and the endpoint
/// translator (assignment names) so the two halves meet in the data plane.
pub fn load_assignment_name(service: &FullName, port: &ServicePortId) -> String {
    format!("{}/{}/{}", service.namespace, service.name, port)
}

/// Port identity within a service: the name when one is assigned, otherwise
/// the number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServicePortId {
    Named(String),
    Numbered(u16),
}

impl std::fmt::Display for ServicePortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServicePortId::Named(name) => f.write_str(name),
            ServicePortId::Numbered(number) => write!(f, "{number}"),
        }
    }
}

/// Deterministic cluster name: `namespace/service/port/<hash>` where the
/// hash covers every parameter that must split a cluster (load-balancing
/// strategy, health checking, SNI, upstream protocol and validation) and
/// nothing that must not (backend weights).
pub fn cluster_name(
    service: &FullName,
    port: &ServicePortId,
    lb: LbStrategy,
    health: Option<&HealthCheckPolicy>,
    sni: Option<&str>,
    protocol: Option<UpstreamProtocol>,
    validation: Option<&UpstreamValidation>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lb.as_str().as_bytes());
    hasher.update([0u8]);
    if let Some(h) = health {
        hasher.update(h.path.as_bytes());
        hasher.update([0u8]);
        if let Some(host) = &h.host {
            hasher.update(host.as_bytes());
        }
        hasher.update(h.interval.as_millis().to_le_bytes());
        hasher.update(h.timeout.as_millis().to_le_bytes());
        hasher.update(h.unhealthy_threshold.to_le_bytes());
        hasher.update(h.healthy_threshold.to_le_bytes());
    }
    hasher.update([0u8]);
    if let Some(sni) = sni {
        hasher.update(sni.as_bytes());
    }
    hasher.update([0u8]);
    if let Some(protocol) = protocol {
        hasher.update(protocol.as_str().as_bytes());
    }
    hasher.update([0u8]);
    if let Some(v) = validation {
        hasher.update(v.ca_secret.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.subject_name.as_bytes());
    }
    let digest = hasher.finalize();
    format!(
        "{}/{}/{}/{}",
        service.namespace,
        service.name,
        port,
        &hex::encode(digest)[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> FullName {
        FullName::new("default", "kuard")
    }

    #[test]
    fn cluster_name_is_stable_across_calls() {
        let a = cluster_name(
            &svc(),
            &ServicePortId::Named("http".into()),
            LbStrategy::RoundRobin,
            None,
            None,
            None,
            None,
        );
        let b = cluster_name(
            &svc(),
            &ServicePortId::Named("http".into()),
            LbStrategy::RoundRobin,
            None,
            None,
            None,
            None,
        );
        assert_eq!(a, b);
        assert!(a.starts_with("default/kuard/http/"));
    }

    #[test]
    fn lb_strategy_splits_clusters() {
        let port = ServicePortId::Numbered(80);
        let rr = cluster_name(&svc(), &port, LbStrategy::RoundRobin, None, None, None, None);
        let random = cluster_name(&svc(), &port, LbStrategy::Random, None, None, None, None);
        assert_ne!(rr, random);
    }

    #[test]
    fn route_ordering_prefers_longer_programs() {
        let a = Route::forward(PathMatch::Prefix("/api/v1".into()), Vec::new());
        let b = Route::forward(PathMatch::Prefix("/".into()), Vec::new());
        assert_eq!(Route::compare(&a, &b), std::cmp::Ordering::Less);
    }

    #[test]
    fn route_ordering_ranks_method_matches_higher() {
        let mut a = Route::forward(PathMatch::Prefix("/api".into()), Vec::new());
        a.method = Some("GET".into());
        let mut b = Route::forward(PathMatch::Prefix("/api".into()), Vec::new());
        b.headers.push(HeaderMatch {
            name: "x-debug".into(),
            kind: HeaderMatchKind::Present,
        });
        assert_eq!(Route::compare(&a, &b), std::cmp::Ordering::Less);
    }

    #[test]
    fn route_ordering_is_insertion_independent() {
        let routes = vec![
            Route::forward(PathMatch::Prefix("/".into()), Vec::new()),
            Route::forward(PathMatch::Exact("/healthz".into()), Vec::new()),
            Route::forward(PathMatch::Prefix("/api".into()), Vec::new()),
        ];
        let mut forward = routes.clone();
        forward.sort_by(Route::compare);
        let mut reversed: Vec<Route> = routes.into_iter().rev().collect();
        reversed.sort_by(Route::compare);
        assert_eq!(forward, reversed);
    }
}
