// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! DAG builder scenarios: admission, delegation, duplicate includes,
//! external-name gating, determinism.

mod common;

use std::sync::Arc;

use isthmus_core::application::builder::DagBuilder;
use isthmus_core::domain::conditions::Reason;
use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::domain::httpproxy::{
    HTTPProxySpec, Include, TLSCertificateDelegation, TLSCertificateDelegationSpec,
    CertificateDelegation, TlsSpec, VirtualHostSpec,
};
use isthmus_core::domain::kubernetes::{FullName, ObjectKind};
use isthmus_core::infrastructure::object_store::Snapshot;

use common::*;

fn builder() -> DagBuilder {
    DagBuilder::new(Arc::new(IsthmusConfig::default()))
}

fn builder_with(config: IsthmusConfig) -> DagBuilder {
    DagBuilder::new(Arc::new(config))
}

fn root_spec(fqdn: &str, routes: Vec<isthmus_core::domain::httpproxy::RouteSpec>) -> HTTPProxySpec {
    HTTPProxySpec {
        virtualhost: Some(VirtualHostSpec { fqdn: fqdn.to_string(), ..Default::default() }),
        routes,
        ..Default::default()
    }
}

#[test]
fn builder_is_deterministic() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "kuard"), service("default", "kuard", &[(Some("http"), 80, 8080)]));
    snapshot.httpproxies.insert(
        FullName::new("default", "kuard"),
        proxy("default", "kuard", 10, root_spec("kuard.example.com", vec![route_to("kuard", 80)])),
    );

    let first = builder().build(&snapshot);
    let second = builder().build(&snapshot);
    assert_eq!(first.dag, second.dag);

    let strip = |report: &isthmus_core::domain::conditions::StatusReport| {
        report
            .updates()
            .map(|u| (u.kind, u.target.clone(), u.conditions.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&first.report), strip(&second.report));
}

#[test]
fn duplicate_fqdn_is_case_insensitive_and_oldest_wins() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "kuard"), service("default", "kuard", &[(None, 80, 8080)]));
    snapshot.httpproxies.insert(
        FullName::new("default", "older"),
        proxy("default", "older", 10, root_spec("App.Example.COM", vec![route_to("kuard", 80)])),
    );
    snapshot.httpproxies.insert(
        FullName::new("default", "newer"),
        proxy("default", "newer", 20, root_spec("app.example.com", vec![route_to("kuard", 80)])),
    );

    let result = builder().build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "newer", Reason::DuplicateFqdn));
    assert!(!has_reason(&result.report, ObjectKind::HttpProxy, "default", "older", Reason::DuplicateFqdn));

    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts.len(), 1);
}

#[test]
fn duplicate_include_conditions_reject_second_but_keep_first() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "api"), service("default", "api", &[(None, 80, 8080)]));

    let root = HTTPProxySpec {
        virtualhost: Some(VirtualHostSpec {
            fqdn: "app.example.com".to_string(),
            ..Default::default()
        }),
        includes: vec![
            Include {
                name: "first".to_string(),
                namespace: None,
                conditions: vec![prefix_condition("/api")],
            },
            Include {
                name: "second".to_string(),
                namespace: None,
                conditions: vec![prefix_condition("/api")],
            },
        ],
        ..Default::default()
    };
    snapshot
        .httpproxies
        .insert(FullName::new("default", "root"), proxy("default", "root", 10, root));
    snapshot.httpproxies.insert(
        FullName::new("default", "first"),
        proxy("default", "first", 11, HTTPProxySpec {
            routes: vec![route_to("api", 80)],
            ..Default::default()
        }),
    );
    snapshot.httpproxies.insert(
        FullName::new("default", "second"),
        proxy("default", "second", 12, HTTPProxySpec {
            routes: vec![route_to("api", 80)],
            ..Default::default()
        }),
    );

    let result = builder().build(&snapshot);

    // The root carries the duplicate-conditions condition; the first
    // include's routes survive.
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "root", Reason::DuplicateMatchConditions));
    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts.len(), 1);
    assert_eq!(listener.virtual_hosts[0].routes.len(), 1);

    // The child referenced solely by the duplicate include is orphaned.
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "second", Reason::Orphaned));
    assert!(!has_reason(&result.report, ObjectKind::HttpProxy, "default", "first", Reason::Orphaned));
}

#[test]
fn empty_include_conditions_are_exempt_from_duplicate_detection() {
    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "api"), service("default", "api", &[(None, 80, 8080)]));

    let root = HTTPProxySpec {
        virtualhost: Some(VirtualHostSpec {
            fqdn: "app.example.com".to_string(),
            ..Default::default()
        }),
        includes: vec![
            Include { name: "first".to_string(), namespace: None, conditions: vec![] },
            Include { name: "second".to_string(), namespace: None, conditions: vec![] },
        ],
        ..Default::default()
    };
    snapshot
        .httpproxies
        .insert(FullName::new("default", "root"), proxy("default", "root", 10, root));
    for name in ["first", "second"] {
        snapshot.httpproxies.insert(
            FullName::new("default", name),
            proxy("default", name, 11, HTTPProxySpec {
                routes: vec![route_to("api", 80)],
                ..Default::default()
            }),
        );
    }

    let result = builder().build(&snapshot);
    assert!(!has_reason(&result.report, ObjectKind::HttpProxy, "default", "root", Reason::DuplicateMatchConditions));
    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts[0].routes.len(), 2);
}

#[test]
fn inclusion_cycles_are_detected() {
    let mut snapshot = Snapshot::default();
    snapshot.httpproxies.insert(
        FullName::new("default", "root"),
        proxy("default", "root", 10, HTTPProxySpec {
            virtualhost: Some(VirtualHostSpec {
                fqdn: "app.example.com".to_string(),
                ..Default::default()
            }),
            includes: vec![Include {
                name: "child".to_string(),
                namespace: None,
                conditions: vec![prefix_condition("/a")],
            }],
            ..Default::default()
        }),
    );
    snapshot.httpproxies.insert(
        FullName::new("default", "child"),
        proxy("default", "child", 11, HTTPProxySpec {
            includes: vec![Include {
                name: "root".to_string(),
                namespace: None,
                conditions: vec![prefix_condition("/b")],
            }],
            ..Default::default()
        }),
    );

    let result = builder().build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "child", Reason::RootIncludesRoot));
}

#[test]
fn tls_delegation_gates_cross_namespace_secrets() {
    let mut base = Snapshot::default();
    base.services
        .insert(FullName::new("app", "web"), service("app", "web", &[(None, 80, 8080)]));
    base.secrets
        .insert(FullName::new("certs", "wildcard"), tls_secret("certs", "wildcard"));
    base.httpproxies.insert(
        FullName::new("app", "site"),
        proxy("app", "site", 10, HTTPProxySpec {
            virtualhost: Some(VirtualHostSpec {
                fqdn: "tls.example.com".to_string(),
                tls: Some(TlsSpec {
                    secret_name: Some("certs/wildcard".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            routes: vec![route_to("web", 80)],
            ..Default::default()
        }),
    );

    // Without a delegation: no secure virtual host, RefNotPermitted.
    let result = builder().build(&base);
    let https = result.dag.listener("ingress_https").unwrap();
    assert!(https.secure_virtual_hosts.is_empty());
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "app", "site", Reason::RefNotPermitted));

    // With a delegation naming the consuming namespace the secure
    // listener materializes.
    let mut delegated = base.clone();
    delegated.delegations.insert(
        FullName::new("certs", "grant"),
        Arc::new(TLSCertificateDelegation {
            metadata: meta("certs", "grant", 10),
            spec: TLSCertificateDelegationSpec {
                delegations: vec![CertificateDelegation {
                    secret_name: "wildcard".to_string(),
                    target_namespaces: vec!["app".to_string()],
                }],
            },
        }),
    );
    let result = builder().build(&delegated);
    let https = result.dag.listener("ingress_https").unwrap();
    assert_eq!(https.secure_virtual_hosts.len(), 1);
    assert_eq!(https.secure_virtual_hosts[0].fqdn(), "tls.example.com");
    assert_eq!(
        https.secure_virtual_hosts[0].secret.as_deref(),
        Some("certs/wildcard")
    );
    assert!(result.dag.secrets.contains_key("certs/wildcard"));

    // Delegating a different secret revokes access again.
    let mut revoked = delegated.clone();
    revoked.delegations.insert(
        FullName::new("certs", "grant"),
        Arc::new(TLSCertificateDelegation {
            metadata: meta("certs", "grant", 10),
            spec: TLSCertificateDelegationSpec {
                delegations: vec![CertificateDelegation {
                    secret_name: "other".to_string(),
                    target_namespaces: vec!["app".to_string()],
                }],
            },
        }),
    );
    let result = builder().build(&revoked);
    assert!(result.dag.listener("ingress_https").unwrap().secure_virtual_hosts.is_empty());
}

#[test]
fn external_name_services_are_gated() {
    let mut snapshot = Snapshot::default();
    snapshot.services.insert(
        FullName::new("default", "upstream"),
        external_name_service("default", "upstream", "app.example.net", 443),
    );
    snapshot.httpproxies.insert(
        FullName::new("default", "proxy"),
        proxy("default", "proxy", 10, root_spec("ext.example.com", vec![route_to("upstream", 443)])),
    );

    // Gate off: no clusters, invalid route.
    let result = builder().build(&snapshot);
    assert!(result.dag.clusters.is_empty());
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "proxy", Reason::BackendNotFound));

    // Gate on but loopback target: still refused.
    let mut config = IsthmusConfig::default();
    config.enable_external_name_service = true;
    let mut loopback = snapshot.clone();
    loopback.services.insert(
        FullName::new("default", "upstream"),
        external_name_service("default", "upstream", "localhost", 443),
    );
    let result = builder_with(config.clone()).build(&loopback);
    assert!(result.dag.clusters.is_empty());
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "proxy", Reason::BackendNotFound));

    // Gate on with a legitimate host: a DNS cluster appears.
    let result = builder_with(config).build(&snapshot);
    assert_eq!(result.dag.clusters.len(), 1);
    let cluster = result.dag.clusters.values().next().unwrap();
    assert_eq!(cluster.external_name.as_deref(), Some("app.example.net"));
}

#[test]
fn orphaned_proxies_are_reported() {
    let mut snapshot = Snapshot::default();
    snapshot.httpproxies.insert(
        FullName::new("default", "dangling"),
        proxy("default", "dangling", 10, HTTPProxySpec {
            routes: vec![route_to("missing", 80)],
            ..Default::default()
        }),
    );
    let result = builder().build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "dangling", Reason::Orphaned));
}

#[test]
fn root_namespace_restriction_applies() {
    let mut config = IsthmusConfig::default();
    config.root_namespaces = vec!["roots-only".to_string()];

    let mut snapshot = Snapshot::default();
    snapshot
        .services
        .insert(FullName::new("default", "kuard"), service("default", "kuard", &[(None, 80, 8080)]));
    snapshot.httpproxies.insert(
        FullName::new("default", "proxy"),
        proxy("default", "proxy", 10, root_spec("app.example.com", vec![route_to("kuard", 80)])),
    );

    let result = builder_with(config).build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpProxy, "default", "proxy", Reason::RootNamespaceMismatch));
    assert!(result.dag.listener("ingress_http").unwrap().virtual_hosts.is_empty());
}
