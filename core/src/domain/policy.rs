// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Typed policy records and the annotation parsing that produces them.
//!
//! Annotations are parsed exactly once, when an object enters the builder;
//! a value that fails to parse downgrades to "unset" and is reported as a
//! parse note so the owning resource can carry a condition. The source
//! object is never mutated to record the outcome.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Annotation prefix recognized on Services and Ingresses.
pub const ANNOTATION_PREFIX: &str = "isthmus.dev/";

/// Load-balancing strategies accepted by the `lb-strategy` annotation and
/// the HTTPProxy `loadBalancerPolicy` stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    RequestHash,
    Cookie,
}

impl LbStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RoundRobin" => Some(LbStrategy::RoundRobin),
            "WeightedLeastRequest" => Some(LbStrategy::WeightedLeastRequest),
            "Random" => Some(LbStrategy::Random),
            "RequestHash" => Some(LbStrategy::RequestHash),
            "Cookie" => Some(LbStrategy::Cookie),
            _ => None,
        }
    }

    /// Canonical token used in cluster-name hashing.
    pub fn as_str(&self) -> &'static str {
        match self {
            LbStrategy::RoundRobin => "RoundRobin",
            LbStrategy::WeightedLeastRequest => "WeightedLeastRequest",
            LbStrategy::Random => "Random",
            LbStrategy::RequestHash => "RequestHash",
            LbStrategy::Cookie => "Cookie",
        }
    }
}

/// Protocol hint for an upstream connection, from the port name or the
/// `upstream-protocol.*` annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    H2,
    H2c,
    Tls,
}

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::H2 => "h2",
            UpstreamProtocol::H2c => "h2c",
            UpstreamProtocol::Tls => "tls",
        }
    }
}

/// DNS lookup family for clusters resolved by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsLookupFamily {
    #[default]
    Auto,
    V4,
    V6,
    All,
}

/// Circuit-breaker thresholds attached to a Service via annotations or
/// inherited from the operator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
    pub per_host_max_connections: Option<u32>,
}

impl CircuitBreakerPolicy {
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }

    /// Merge defaults from the operator configuration into any threshold the
    /// annotations left unset.
    pub fn with_defaults(mut self, defaults: &CircuitBreakerPolicy) -> Self {
        self.max_connections = self.max_connections.or(defaults.max_connections);
        self.max_pending_requests = self.max_pending_requests.or(defaults.max_pending_requests);
        self.max_requests = self.max_requests.or(defaults.max_requests);
        self.max_retries = self.max_retries.or(defaults.max_retries);
        self.per_host_max_connections =
            self.per_host_max_connections.or(defaults.per_host_max_connections);
        self
    }
}

/// Active health-check policy for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_threshold() -> u32 {
    3
}

/// A timeout that distinguishes "not configured" from "explicitly disabled".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    #[default]
    Default,
    Disabled,
    Duration(Duration),
}

impl Timeout {
    /// Parses the HTTPProxy / annotation syntax: humantime durations, with
    /// `infinity` (and its alias `infinite`) disabling the timeout.
    pub fn parse(value: &str) -> Result<Self, PolicyParseError> {
        match value.trim() {
            "" => Ok(Timeout::Default),
            "infinity" | "infinite" => Ok(Timeout::Disabled),
            other => humantime::parse_duration(other)
                .map(Timeout::Duration)
                .map_err(|_| PolicyParseError::new("timeout", other)),
        }
    }
}

/// Per-route timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

/// Per-route retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: Option<Duration>,
    /// Envoy `retry_on` conditions, e.g. `5xx`, `gateway-error`.
    pub retry_on: Vec<String>,
}

/// Header set/remove instructions applied to requests or responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderManipulation {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl HeaderManipulation {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// A note recorded when an annotation failed to parse. The value downgrades
/// to unset; the note surfaces as a condition message on the owner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct PolicyParseError {
    pub key: String,
    pub value: String,
}

impl PolicyParseError {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

fn annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    suffix: &str,
) -> Option<&'a String> {
    annotations.get(&format!("{ANNOTATION_PREFIX}{suffix}"))
}

fn parse_u32(
    annotations: &BTreeMap<String, String>,
    suffix: &str,
    notes: &mut Vec<PolicyParseError>,
) -> Option<u32> {
    let raw = annotation(annotations, suffix)?;
    match raw.parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            notes.push(PolicyParseError::new(format!("{ANNOTATION_PREFIX}{suffix}"), raw));
            None
        }
    }
}

/// Circuit-breaker thresholds from Service annotations. Each threshold is
/// parsed independently; an unparseable value is dropped and reported.
pub fn circuit_breakers_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> (CircuitBreakerPolicy, Vec<PolicyParseError>) {
    let mut notes = Vec::new();
    let policy = CircuitBreakerPolicy {
        max_connections: parse_u32(annotations, "max-connections", &mut notes),
        max_pending_requests: parse_u32(annotations, "max-pending-requests", &mut notes),
        max_requests: parse_u32(annotations, "max-requests", &mut notes),
        max_retries: parse_u32(annotations, "max-retries", &mut notes),
        per_host_max_connections: parse_u32(annotations, "per-host-max-connections", &mut notes),
    };
    (policy, notes)
}

/// Load-balancing strategy from Service annotations.
pub fn lb_strategy_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> (LbStrategy, Vec<PolicyParseError>) {
    match annotation(annotations, "lb-strategy") {
        None => (LbStrategy::default(), Vec::new()),
        Some(raw) => match LbStrategy::parse(raw) {
            Some(strategy) => (strategy, Vec::new()),
            None => (
                LbStrategy::default(),
                vec![PolicyParseError::new(format!("{ANNOTATION_PREFIX}lb-strategy"), raw)],
            ),
        },
    }
}

/// Upstream protocol hints, keyed by port name or number: the annotation
/// `isthmus.dev/upstream-protocol.h2c: "grpc,8080"` marks the ports named
/// `grpc` or numbered `8080` as cleartext HTTP/2.
pub fn upstream_protocols_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, UpstreamProtocol> {
    let mut out = BTreeMap::new();
    for protocol in [UpstreamProtocol::H2, UpstreamProtocol::H2c, UpstreamProtocol::Tls] {
        if let Some(ports) = annotation(annotations, &format!("upstream-protocol.{}", protocol.as_str()))
        {
            for port in ports.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                out.insert(port.to_string(), protocol);
            }
        }
    }
    out
}

/// Health-check port override from Service annotations.
pub fn health_check_port_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> (Option<u16>, Vec<PolicyParseError>) {
    let mut notes = Vec::new();
    let port = match annotation(annotations, "health-check-port") {
        None => None,
        Some(raw) => match raw.parse::<u16>() {
            Ok(v) => Some(v),
            Err(_) => {
                notes.push(PolicyParseError::new(
                    format!("{ANNOTATION_PREFIX}health-check-port"),
                    raw,
                ));
                None
            }
        },
    };
    (port, notes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{ANNOTATION_PREFIX}{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn circuit_breakers_parse_all_thresholds() {
        let ann = annotations(&[
            ("max-connections", "9000"),
            ("max-pending-requests", "4096"),
            ("max-requests", "404"),
            ("max-retries", "7"),
        ]);
        let (policy, notes) = circuit_breakers_from_annotations(&ann);
        assert!(notes.is_empty());
        assert_eq!(policy.max_connections, Some(9000));
        assert_eq!(policy.max_pending_requests, Some(4096));
        assert_eq!(policy.max_requests, Some(404));
        assert_eq!(policy.max_retries, Some(7));
    }

    #[test]
    fn unparseable_thresholds_downgrade_to_unset() {
        let ann = annotations(&[
            ("max-pending-requests", "9999"),
            ("max-requests", "1e6"),
            ("max-retries", "-1"),
        ]);
        let (policy, notes) = circuit_breakers_from_annotations(&ann);
        assert_eq!(policy.max_pending_requests, Some(9999));
        assert_eq!(policy.max_requests, None);
        assert_eq!(policy.max_retries, None);
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn timeout_parses_infinity_and_durations() {
        assert_eq!(Timeout::parse("infinity").unwrap(), Timeout::Disabled);
        assert_eq!(
            Timeout::parse("90s").unwrap(),
            Timeout::Duration(Duration::from_secs(90))
        );
        assert!(Timeout::parse("ninety seconds").is_err());
    }

    #[test]
    fn upstream_protocol_annotation_covers_named_and_numbered_ports() {
        let ann = annotations(&[("upstream-protocol.h2c", "grpc, 8080")]);
        let protocols = upstream_protocols_from_annotations(&ann);
        assert_eq!(protocols.get("grpc"), Some(&UpstreamProtocol::H2c));
        assert_eq!(protocols.get("8080"), Some(&UpstreamProtocol::H2c));
    }
}
