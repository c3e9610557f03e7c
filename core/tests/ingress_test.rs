// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Ingress surface scenarios: class admission, host merging, TLS stanzas.

mod common;

use std::sync::Arc;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};

use isthmus_core::application::builder::DagBuilder;
use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::domain::kubernetes::FullName;
use isthmus_core::infrastructure::object_store::Snapshot;

use common::*;

fn ingress(
    namespace: &str,
    name: &str,
    class: Option<&str>,
    host: &str,
    path: &str,
    backend: (&str, i32),
    tls_secret_name: Option<&str>,
) -> Arc<Ingress> {
    Arc::new(Ingress {
        metadata: meta(namespace, name, 10),
        spec: Some(IngressSpec {
            ingress_class_name: class.map(str::to_string),
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: backend.0.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(backend.1),
                                    name: None,
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: tls_secret_name.map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![host.to_string()]),
                    secret_name: Some(secret.to_string()),
                }]
            }),
            ..Default::default()
        }),
        status: None,
    })
}

fn build(snapshot: &Snapshot) -> isthmus_core::application::builder::BuildResult {
    DagBuilder::new(Arc::new(IsthmusConfig::default())).build(snapshot)
}

#[test]
fn foreign_ingress_class_is_ignored() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "web"), service("default", "web", &[(None, 80, 8080)]));
    snapshot.ingresses.insert(
        FullName::new("default", "other"),
        ingress("default", "other", Some("nginx"), "app.example.com", "/", ("web", 80), None),
    );

    let result = build(&snapshot);
    assert!(result.dag.listener("ingress_http").unwrap().virtual_hosts.is_empty());
}

#[test]
fn two_ingresses_merge_into_one_virtual_host() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "web"), service("default", "web", &[(None, 80, 8080)]));
    snapshot
        .services
        .insert(FullName::new("default", "api"), service("default", "api", &[(None, 80, 8080)]));
    snapshot.ingresses.insert(
        FullName::new("default", "web"),
        ingress("default", "web", None, "app.example.com", "/", ("web", 80), None),
    );
    snapshot.ingresses.insert(
        FullName::new("default", "api"),
        ingress("default", "api", None, "app.example.com", "/api", ("api", 80), None),
    );

    let result = build(&snapshot);
    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts.len(), 1);
    assert_eq!(listener.virtual_hosts[0].routes.len(), 2);
    // More specific prefix sorts first.
    assert_eq!(listener.virtual_hosts[0].routes[0].path.program(), "/api");
}

#[test]
fn tls_stanza_adds_a_secure_virtual_host() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "web"), service("default", "web", &[(None, 80, 8080)]));
    snapshot
        .secrets
        .insert(FullName::new("default", "cert"), tls_secret("default", "cert"));
    snapshot.ingresses.insert(
        FullName::new("default", "web"),
        ingress("default", "web", None, "tls.example.com", "/", ("web", 80), Some("cert")),
    );

    let result = build(&snapshot);
    let https = result.dag.listener("ingress_https").unwrap();
    assert_eq!(https.secure_virtual_hosts.len(), 1);
    assert_eq!(https.secure_virtual_hosts[0].fqdn(), "tls.example.com");
    assert_eq!(https.secure_virtual_hosts[0].secret.as_deref(), Some("default/cert"));
}
