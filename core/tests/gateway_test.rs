// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Gateway API scenarios: attachment, hostname intersection, reference
//! grants, and match-conflict precedence.

mod common;

use std::sync::Arc;

use isthmus_core::application::builder::DagBuilder;
use isthmus_core::domain::conditions::Reason;
use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::domain::dag::RouteAction;
use isthmus_core::domain::gateway::{
    AllowedRoutes, BackendRef, Gateway, GatewayClass, GatewayClassSpec, GatewayListener,
    GatewaySpec, HTTPPathMatch, HTTPRoute, HTTPRouteMatch, HTTPRouteRule, HTTPRouteSpec,
    ParentReference, ReferenceGrant, ReferenceGrantFrom, ReferenceGrantSpec, ReferenceGrantTo,
    RouteNamespaces, GATEWAY_CONTROLLER_NAME,
};
use isthmus_core::domain::kubernetes::{FullName, ObjectKind};
use isthmus_core::infrastructure::object_store::Snapshot;

use common::*;

fn gateway_snapshot() -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.gateway_classes.insert(
        FullName::new("default", "isthmus"),
        Arc::new(GatewayClass {
            metadata: meta("default", "isthmus", 1),
            spec: GatewayClassSpec {
                controller_name: GATEWAY_CONTROLLER_NAME.to_string(),
            },
        }),
    );
    snapshot.gateways.insert(
        FullName::new("infra", "edge"),
        Arc::new(Gateway {
            metadata: meta("infra", "edge", 2),
            spec: GatewaySpec {
                gateway_class_name: "isthmus".to_string(),
                listeners: vec![GatewayListener {
                    name: "http".to_string(),
                    port: 80,
                    protocol: "HTTP".to_string(),
                    hostname: Some("*.example.com".to_string()),
                    tls: None,
                    allowed_routes: Some(AllowedRoutes {
                        namespaces: Some(RouteNamespaces { from: Some("All".to_string()) }),
                    }),
                }],
            },
        }),
    );
    snapshot
        .services
        .insert(FullName::new("app", "web"), service("app", "web", &[(None, 80, 8080)]));
    snapshot
}

fn http_route(
    namespace: &str,
    name: &str,
    created: i64,
    hostnames: &[&str],
    path: &str,
    backend: BackendRef,
) -> Arc<HTTPRoute> {
    Arc::new(HTTPRoute {
        metadata: meta(namespace, name, created),
        spec: HTTPRouteSpec {
            parent_refs: vec![ParentReference {
                name: "edge".to_string(),
                namespace: Some("infra".to_string()),
                ..Default::default()
            }],
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            rules: vec![HTTPRouteRule {
                matches: vec![HTTPRouteMatch {
                    path: Some(HTTPPathMatch {
                        match_type: Some("PathPrefix".to_string()),
                        value: Some(path.to_string()),
                    }),
                    ..Default::default()
                }],
                backend_refs: vec![backend],
            }],
        },
    })
}

fn web_backend() -> BackendRef {
    BackendRef { name: "web".to_string(), port: Some(80), ..Default::default() }
}

fn build(snapshot: &Snapshot) -> isthmus_core::application::builder::BuildResult {
    DagBuilder::new(Arc::new(IsthmusConfig::default())).build(snapshot)
}

#[test]
fn http_route_attaches_under_intersected_hostname() {
    let mut snapshot = gateway_snapshot();
    snapshot.http_routes.insert(
        FullName::new("app", "site"),
        http_route("app", "site", 10, &["app.example.com"], "/", web_backend()),
    );

    let result = build(&snapshot);
    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts.len(), 1);
    assert_eq!(listener.virtual_hosts[0].fqdn, "app.example.com");
    assert!(matches!(
        listener.virtual_hosts[0].routes[0].action,
        RouteAction::Forward { .. }
    ));
}

#[test]
fn non_intersecting_hostnames_are_rejected() {
    let mut snapshot = gateway_snapshot();
    snapshot.http_routes.insert(
        FullName::new("app", "site"),
        http_route("app", "site", 10, &["app.other.net"], "/", web_backend()),
    );

    let result = build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpRoute, "app", "site", Reason::NoIntersectingHostnames));
    assert!(result.dag.listener("ingress_http").unwrap().virtual_hosts.is_empty());
}

#[test]
fn cross_namespace_backend_requires_reference_grant() {
    let mut snapshot = gateway_snapshot();
    snapshot
        .services
        .insert(FullName::new("backends", "db"), service("backends", "db", &[(None, 80, 8080)]));
    let backend = BackendRef {
        name: "db".to_string(),
        namespace: Some("backends".to_string()),
        port: Some(80),
        ..Default::default()
    };
    snapshot.http_routes.insert(
        FullName::new("app", "site"),
        http_route("app", "site", 10, &["app.example.com"], "/", backend),
    );

    // No grant: the reference is refused and the route serves a 500.
    let result = build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpRoute, "app", "site", Reason::RefNotPermitted));
    let listener = result.dag.listener("ingress_http").unwrap();
    assert!(matches!(
        listener.virtual_hosts[0].routes[0].action,
        RouteAction::DirectResponse { status: 500, .. }
    ));

    // A grant in the target namespace permits it.
    snapshot.reference_grants.insert(
        FullName::new("backends", "allow-app"),
        Arc::new(ReferenceGrant {
            metadata: meta("backends", "allow-app", 5),
            spec: ReferenceGrantSpec {
                from: vec![ReferenceGrantFrom {
                    group: "gateway.networking.k8s.io".to_string(),
                    kind: "HTTPRoute".to_string(),
                    namespace: "app".to_string(),
                }],
                to: vec![ReferenceGrantTo {
                    group: String::new(),
                    kind: "Service".to_string(),
                    name: None,
                }],
            },
        }),
    );
    let result = build(&snapshot);
    assert!(!has_reason(&result.report, ObjectKind::HttpRoute, "app", "site", Reason::RefNotPermitted));
    let listener = result.dag.listener("ingress_http").unwrap();
    assert!(matches!(
        listener.virtual_hosts[0].routes[0].action,
        RouteAction::Forward { .. }
    ));
}

#[test]
fn conflicting_matches_prefer_the_oldest_route() {
    let mut snapshot = gateway_snapshot();
    snapshot.http_routes.insert(
        FullName::new("app", "older"),
        http_route("app", "older", 10, &["app.example.com"], "/api", web_backend()),
    );
    snapshot.http_routes.insert(
        FullName::new("app", "newer"),
        http_route("app", "newer", 20, &["app.example.com"], "/api", web_backend()),
    );

    let result = build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpRoute, "app", "newer", Reason::RuleMatchConflict));
    assert!(!has_reason(&result.report, ObjectKind::HttpRoute, "app", "older", Reason::RuleMatchConflict));

    let listener = result.dag.listener("ingress_http").unwrap();
    assert_eq!(listener.virtual_hosts[0].routes.len(), 1);
    assert_eq!(listener.virtual_hosts[0].routes[0].origin.name, "older");
}

#[test]
fn partially_conflicting_routes_keep_their_distinct_rules() {
    let mut snapshot = gateway_snapshot();
    snapshot.http_routes.insert(
        FullName::new("app", "older"),
        http_route("app", "older", 10, &["app.example.com"], "/api", web_backend()),
    );
    let newer = Arc::new(HTTPRoute {
        metadata: meta("app", "newer", 20),
        spec: HTTPRouteSpec {
            parent_refs: vec![ParentReference {
                name: "edge".to_string(),
                namespace: Some("infra".to_string()),
                ..Default::default()
            }],
            hostnames: vec!["app.example.com".to_string()],
            rules: vec![
                HTTPRouteRule {
                    matches: vec![HTTPRouteMatch {
                        path: Some(HTTPPathMatch {
                            match_type: Some("PathPrefix".to_string()),
                            value: Some("/api".to_string()),
                        }),
                        ..Default::default()
                    }],
                    backend_refs: vec![web_backend()],
                },
                HTTPRouteRule {
                    matches: vec![HTTPRouteMatch {
                        path: Some(HTTPPathMatch {
                            match_type: Some("PathPrefix".to_string()),
                            value: Some("/metrics".to_string()),
                        }),
                        ..Default::default()
                    }],
                    backend_refs: vec![web_backend()],
                },
            ],
        },
    });
    snapshot.http_routes.insert(FullName::new("app", "newer"), newer);

    let result = build(&snapshot);
    assert!(has_reason(&result.report, ObjectKind::HttpRoute, "app", "newer", Reason::RuleMatchPartiallyConflict));

    let listener = result.dag.listener("ingress_http").unwrap();
    let origins: Vec<(&str, &str)> = listener.virtual_hosts[0]
        .routes
        .iter()
        .map(|r| (r.origin.name.as_str(), r.path.program()))
        .collect();
    assert!(origins.contains(&("older", "/api")));
    assert!(origins.contains(&("newer", "/metrics")));
    assert_eq!(listener.virtual_hosts[0].routes.len(), 2);
}
