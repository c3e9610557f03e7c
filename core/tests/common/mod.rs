// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the pipeline integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;

use isthmus_core::domain::conditions::{Reason, StatusReport};
use isthmus_core::domain::httpproxy::{
    HTTPProxy, HTTPProxySpec, MatchCondition, RouteSpec, ServiceReference,
};
use isthmus_core::domain::kubernetes::{FullName, ObjectKind};

pub const TLS_CERT: &[u8] = include_bytes!("../testdata/tls.crt");
pub const TLS_KEY: &[u8] = include_bytes!("../testdata/tls.key");
pub const CA_CERT: &[u8] = include_bytes!("../testdata/ca.crt");

pub fn meta(namespace: &str, name: &str, created_secs: i64) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
        ..Default::default()
    }
}

/// A ClusterIP service; ports are (name, port, targetPort).
pub fn service(namespace: &str, name: &str, ports: &[(Option<&str>, i32, i32)]) -> Arc<Service> {
    Arc::new(Service {
        metadata: meta(namespace, name, 100),
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, target)| ServicePort {
                        name: port_name.map(str::to_string),
                        port: *port,
                        target_port: Some(
                            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(*target),
                        ),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn service_with_annotations(
    namespace: &str,
    name: &str,
    ports: &[(Option<&str>, i32, i32)],
    annotations: &[(&str, &str)],
) -> Arc<Service> {
    let mut base = Service::clone(&service(namespace, name, ports));
    base.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    Arc::new(base)
}

pub fn external_name_service(namespace: &str, name: &str, host: &str, port: i32) -> Arc<Service> {
    Arc::new(Service {
        metadata: meta(namespace, name, 100),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(host.to_string()),
            ports: Some(vec![ServicePort { port, ..Default::default() }]),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn tls_secret(namespace: &str, name: &str) -> Arc<Secret> {
    let data: BTreeMap<String, ByteString> = [
        ("tls.crt".to_string(), ByteString(TLS_CERT.to_vec())),
        ("tls.key".to_string(), ByteString(TLS_KEY.to_vec())),
    ]
    .into();
    Arc::new(Secret {
        metadata: meta(namespace, name, 100),
        data: Some(data),
        ..Default::default()
    })
}

pub fn ca_secret(namespace: &str, name: &str) -> Arc<Secret> {
    let data: BTreeMap<String, ByteString> =
        [("ca.crt".to_string(), ByteString(CA_CERT.to_vec()))].into();
    Arc::new(Secret {
        metadata: meta(namespace, name, 100),
        data: Some(data),
        ..Default::default()
    })
}

pub fn proxy(
    namespace: &str,
    name: &str,
    created_secs: i64,
    spec: HTTPProxySpec,
) -> Arc<HTTPProxy> {
    Arc::new(HTTPProxy {
        metadata: meta(namespace, name, created_secs),
        spec,
        status: None,
    })
}

pub fn route_to(service_name: &str, port: u16) -> RouteSpec {
    RouteSpec {
        services: vec![ServiceReference {
            name: service_name.to_string(),
            port,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn prefix_condition(prefix: &str) -> MatchCondition {
    MatchCondition { prefix: Some(prefix.to_string()), ..Default::default() }
}

/// The (reason, status) pairs of the `Valid` conditions recorded for a
/// resource, or `None` if the resource has no entry at all.
pub fn valid_conditions(
    report: &StatusReport,
    kind: ObjectKind,
    namespace: &str,
    name: &str,
) -> Option<Vec<(Reason, bool)>> {
    report
        .get(kind, &FullName::new(namespace, name))
        .map(|update| {
            update
                .conditions
                .iter()
                .map(|c| (c.reason, c.status))
                .collect()
        })
}

pub fn has_reason(
    report: &StatusReport,
    kind: ObjectKind,
    namespace: &str,
    name: &str,
    reason: Reason,
) -> bool {
    valid_conditions(report, kind, namespace, name)
        .map(|conditions| conditions.iter().any(|(r, status)| *r == reason && !status))
        .unwrap_or(false)
}
