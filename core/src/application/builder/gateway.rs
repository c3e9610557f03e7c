// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Gateway API processing: gateway admission, route attachment, hostname
//! intersection, cross-namespace reference grants, and match-conflict
//! resolution between routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::conditions::{ConditionType, Reason, ResourceCondition};
use crate::domain::dag::{
    HeaderMatch, HeaderMatchKind, Listener, PathMatch, QueryParamMatch, QueryParamMatchKind,
    Route, RouteAction, RouteOrigin, SecureVirtualHost, TcpProxy, TlsVersion, VirtualHost,
    WeightedCluster, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};
use crate::domain::gateway::{
    intersect_hostnames, BackendRef, Gateway, GatewayListener, GRPCRouteMatch, HTTPRouteMatch,
    ParentReference, GATEWAY_CONTROLLER_NAME,
};
use crate::domain::kubernetes::{FullName, ObjectKind};
use crate::domain::policy::{HeaderManipulation, TimeoutPolicy, UpstreamProtocol};

use super::{BuildContext, ServicePortRef};

pub(crate) fn process(ctx: &mut BuildContext) {
    // Admit classes we control.
    let mut our_classes = Vec::new();
    for (name, class) in &ctx.snapshot.gateway_classes {
        if class.spec.controller_name == GATEWAY_CONTROLLER_NAME {
            our_classes.push(name.name.clone());
            ctx.report.condition(
                ObjectKind::GatewayClass,
                name.clone(),
                ResourceCondition::positive(
                    ConditionType::Accepted,
                    Reason::Accepted,
                    "GatewayClass is controlled by this instance",
                ),
            );
        }
    }

    // Select gateways: an explicit gatewayRef pins exactly one; otherwise
    // every gateway of an admitted class participates.
    let gateways: Vec<(FullName, Arc<Gateway>)> = ctx
        .snapshot
        .gateways
        .iter()
        .filter(|(name, gateway)| match &ctx.config.gateway {
            Some(config) => {
                config.gateway_ref.namespace == name.namespace
                    && config.gateway_ref.name == name.name
            }
            None => our_classes.contains(&gateway.spec.gateway_class_name),
        })
        .map(|(name, gateway)| (name.clone(), gateway.clone()))
        .collect();

    for (gateway_name, gateway) in &gateways {
        ctx.report.condition(
            ObjectKind::Gateway,
            gateway_name.clone(),
            ResourceCondition::positive(
                ConditionType::Accepted,
                Reason::Accepted,
                "Gateway is managed by this instance",
            ),
        );
        for listener in &gateway.spec.listeners {
            process_listener(ctx, gateway_name, gateway, listener);
        }
        ctx.report.condition(
            ObjectKind::Gateway,
            gateway_name.clone(),
            ResourceCondition::positive(
                ConditionType::Programmed,
                Reason::Valid,
                "listeners are programmed into the data plane",
            ),
        );
    }
}

fn process_listener(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    gateway: &Arc<Gateway>,
    listener: &GatewayListener,
) {
    match listener.protocol.as_str() {
        "HTTP" => attach_http_routes(ctx, gateway_name, gateway, listener, None),
        "HTTPS" => {
            let secret = resolve_listener_certificate(ctx, gateway_name, listener);
            match secret {
                Some(secret) => {
                    attach_http_routes(ctx, gateway_name, gateway, listener, Some(secret))
                }
                // No usable certificate: nothing attaches; condition is
                // already recorded on the gateway.
                None => {}
            }
        }
        "TLS" => attach_tls_routes(ctx, gateway_name, gateway, listener),
        "TCP" => attach_tcp_routes(ctx, gateway_name, gateway, listener),
        other => {
            ctx.report.condition(
                ObjectKind::Gateway,
                gateway_name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::SpecError,
                    format!("listener {:?} has unsupported protocol {other:?}", listener.name),
                ),
            );
        }
    }
}

fn resolve_listener_certificate(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    listener: &GatewayListener,
) -> Option<String> {
    let Some(tls) = &listener.tls else {
        ctx.report.condition(
            ObjectKind::Gateway,
            gateway_name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::TlsParametersInvalid,
                format!("HTTPS listener {:?} has no TLS block", listener.name),
            ),
        );
        return None;
    };
    let Some(cert) = tls.certificate_refs.first() else {
        ctx.report.condition(
            ObjectKind::Gateway,
            gateway_name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::TlsParametersInvalid,
                format!("HTTPS listener {:?} has no certificateRefs", listener.name),
            ),
        );
        return None;
    };

    let cert_namespace = cert.namespace.as_deref().unwrap_or(&gateway_name.namespace);
    if cert_namespace != gateway_name.namespace
        && !reference_grant_permits(
            ctx,
            "gateway.networking.k8s.io",
            "Gateway",
            &gateway_name.namespace,
            "Secret",
            cert_namespace,
            &cert.name,
        )
    {
        ctx.report.condition(
            ObjectKind::Gateway,
            gateway_name.clone(),
            ResourceCondition::negative(
                ConditionType::ResolvedRefs,
                Reason::RefNotPermitted,
                format!(
                    "certificateRef {}/{} is not permitted by any ReferenceGrant",
                    cert_namespace, cert.name
                ),
            ),
        );
        return None;
    }

    let reference = format!("{}/{}", cert_namespace, cert.name);
    match ctx.resolve_keypair_unchecked(&reference) {
        Ok(secret) => Some(secret),
        Err(failure) => {
            ctx.report.condition(
                ObjectKind::Gateway,
                gateway_name.clone(),
                ResourceCondition::negative(
                    ConditionType::ResolvedRefs,
                    failure.reason,
                    failure.message,
                ),
            );
            None
        }
    }
}

/// A route candidate collected for conflict resolution (I8).
struct Candidate {
    route: Route,
    source: FullName,
    kind: ObjectKind,
    created: Option<DateTime<Utc>>,
}

fn attach_http_routes(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    gateway: &Arc<Gateway>,
    listener: &GatewayListener,
    secret: Option<String>,
) {
    let mut candidates: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();

    let http_routes: Vec<(FullName, Arc<crate::domain::gateway::HTTPRoute>)> = ctx
        .snapshot
        .http_routes
        .iter()
        .map(|(n, r)| (n.clone(), r.clone()))
        .collect();
    for (route_name, route) in http_routes {
        if !attaches(
            ctx,
            gateway_name,
            gateway,
            listener,
            &route_name,
            ObjectKind::HttpRoute,
            &route.spec.parent_refs,
        ) {
            continue;
        }
        let hostnames = match intersected_hostnames(
            ctx,
            ObjectKind::HttpRoute,
            &route_name,
            listener,
            &route.spec.hostnames,
        ) {
            Some(hostnames) => hostnames,
            None => continue,
        };

        let created = route.metadata.creation_timestamp.as_ref().map(|t| t.0);
        for rule in &route.spec.rules {
            let action = backend_action(ctx, ObjectKind::HttpRoute, &route_name, &rule.backend_refs, None);
            let matches: &[HTTPRouteMatch] = if rule.matches.is_empty() {
                &[HTTPRouteMatch::default()]
            } else {
                &rule.matches
            };
            for route_match in matches {
                let Some(compiled) = compile_http_match(ctx, &route_name, route_match) else {
                    continue;
                };
                for hostname in &hostnames {
                    candidates.entry(hostname.clone()).or_default().push(Candidate {
                        route: Route {
                            path: compiled.path.clone(),
                            headers: compiled.headers.clone(),
                            query_params: compiled.query_params.clone(),
                            method: compiled.method.clone(),
                            action: action.clone(),
                            timeouts: TimeoutPolicy::default(),
                            retry: None,
                            request_headers: HeaderManipulation::default(),
                            response_headers: HeaderManipulation::default(),
                            prefix_rewrite: None,
                            websocket: false,
                            origin: RouteOrigin {
                                namespace: route_name.namespace.clone(),
                                name: route_name.name.clone(),
                                creation_timestamp: created,
                            },
                        },
                        source: route_name.clone(),
                        kind: ObjectKind::HttpRoute,
                        created,
                    });
                }
            }
        }
        ctx.report.mark_valid_if_unset(ObjectKind::HttpRoute, route_name.clone());
    }

    let grpc_routes: Vec<(FullName, Arc<crate::domain::gateway::GRPCRoute>)> = ctx
        .snapshot
        .grpc_routes
        .iter()
        .map(|(n, r)| (n.clone(), r.clone()))
        .collect();
    for (route_name, route) in grpc_routes {
        if !attaches(
            ctx,
            gateway_name,
            gateway,
            listener,
            &route_name,
            ObjectKind::GrpcRoute,
            &route.spec.parent_refs,
        ) {
            continue;
        }
        let hostnames = match intersected_hostnames(
            ctx,
            ObjectKind::GrpcRoute,
            &route_name,
            listener,
            &route.spec.hostnames,
        ) {
            Some(hostnames) => hostnames,
            None => continue,
        };

        let created = route.metadata.creation_timestamp.as_ref().map(|t| t.0);
        for rule in &route.spec.rules {
            // gRPC backends speak cleartext HTTP/2 unless TLS is proven.
            let action = backend_action(
                ctx,
                ObjectKind::GrpcRoute,
                &route_name,
                &rule.backend_refs,
                Some(UpstreamProtocol::H2c),
            );
            let matches: &[GRPCRouteMatch] = if rule.matches.is_empty() {
                &[GRPCRouteMatch::default()]
            } else {
                &rule.matches
            };
            for route_match in matches {
                let compiled = compile_grpc_match(route_match);
                for hostname in &hostnames {
                    candidates.entry(hostname.clone()).or_default().push(Candidate {
                        route: Route {
                            path: compiled.0.clone(),
                            headers: compiled.1.clone(),
                            query_params: Vec::new(),
                            method: Some("POST".to_string()),
                            action: action.clone(),
                            timeouts: TimeoutPolicy::default(),
                            retry: None,
                            request_headers: HeaderManipulation::default(),
                            response_headers: HeaderManipulation::default(),
                            prefix_rewrite: None,
                            websocket: false,
                            origin: RouteOrigin {
                                namespace: route_name.namespace.clone(),
                                name: route_name.name.clone(),
                                creation_timestamp: created,
                            },
                        },
                        source: route_name.clone(),
                        kind: ObjectKind::GrpcRoute,
                        created,
                    });
                }
            }
        }
        ctx.report.mark_valid_if_unset(ObjectKind::GrpcRoute, route_name.clone());
    }

    attach_resolved(ctx, candidates, secret);
}

/// Resolve match conflicts per hostname and push the winners into the DAG.
fn attach_resolved(
    ctx: &mut BuildContext,
    candidates: BTreeMap<String, Vec<Candidate>>,
    secret: Option<String>,
) {
    for (hostname, group) in candidates {
        // Gateway hostnames share listeners with the other surfaces only
        // when nobody else claimed them (disjointness decision).
        if let Some(claim) = ctx.claimed_fqdns.get(&hostname.to_ascii_lowercase()) {
            if !matches!(claim.kind, ObjectKind::HttpRoute | ObjectKind::GrpcRoute) {
                for candidate in &group {
                    ctx.report.condition(
                        candidate.kind,
                        candidate.source.clone(),
                        ResourceCondition::negative(
                            ConditionType::Accepted,
                            Reason::Ambiguous,
                            format!(
                                "hostname {hostname:?} is already programmed by {} {}; refusing to mix surfaces on one listener",
                                claim.kind, claim.owner
                            ),
                        ),
                    );
                }
                continue;
            }
        } else if let Some(first) = group.first() {
            let _ = ctx.claim_fqdn(&hostname, first.kind, &first.source);
        }

        let (winners, conflicts) = resolve_conflicts(group);
        for (source, kind, full) in conflicts {
            let reason = if full {
                Reason::RuleMatchConflict
            } else {
                Reason::RuleMatchPartiallyConflict
            };
            ctx.report.condition(
                kind,
                source,
                ResourceCondition::negative(
                    ConditionType::Accepted,
                    reason,
                    "route match conditions conflict with an older route",
                ),
            );
        }

        let routes: Vec<Route> = winners;
        if routes.is_empty() {
            continue;
        }

        match &secret {
            Some(secret) => {
                if let Some(listener) = ctx
                    .dag
                    .listeners
                    .iter_mut()
                    .find(|l| l.name == HTTPS_LISTENER_NAME)
                {
                    let mut vhost = VirtualHost::new(&hostname);
                    vhost.routes = routes;
                    listener.secure_virtual_hosts.push(SecureVirtualHost {
                        virtual_host: vhost,
                        secret: Some(secret.clone()),
                        min_tls_version: TlsVersion::V1_2,
                        max_tls_version: TlsVersion::V1_3,
                        cipher_suites: Vec::new(),
                        client_validation: None,
                        tcp_proxy: None,
                    });
                }
            }
            None => {
                if let Some(listener) = ctx
                    .dag
                    .listeners
                    .iter_mut()
                    .find(|l| l.name == HTTP_LISTENER_NAME)
                {
                    match listener.virtual_hosts.iter_mut().find(|v| v.fqdn == hostname) {
                        Some(existing) => existing.routes.extend(routes),
                        None => {
                            let mut vhost = VirtualHost::new(&hostname);
                            vhost.routes = routes;
                            listener.virtual_hosts.push(vhost);
                        }
                    }
                }
            }
        }
    }
}

/// Oldest creation timestamp wins; ties break on (namespace, name). Returns
/// the surviving routes plus, per losing source, whether it lost every rule
/// (full conflict) or only some (partial).
fn resolve_conflicts(
    group: Vec<Candidate>,
) -> (Vec<Route>, Vec<(FullName, ObjectKind, bool)>) {
    let mut by_key: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in group {
        by_key
            .entry(candidate.route.match_key())
            .or_default()
            .push(candidate);
    }

    let mut winners = Vec::new();
    let mut lost: BTreeMap<(FullName, ObjectKind), (usize, usize)> = BTreeMap::new();

    for (_, mut contenders) in by_key {
        contenders.sort_by(|a, b| {
            let by_time = match (&a.created, &b.created) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            by_time.then_with(|| a.source.cmp(&b.source))
        });
        let mut contenders = contenders.into_iter();
        let winner = contenders.next().expect("group is non-empty");
        let winner_source = winner.source.clone();
        let entry = lost.entry((winner.source.clone(), winner.kind)).or_insert((0, 0));
        entry.1 += 1;
        winners.push(winner.route);
        for loser in contenders {
            // Several rules of one resource may legitimately share a key
            // with each other; only cross-resource duplicates conflict.
            if loser.source == winner_source {
                continue;
            }
            let entry = lost.entry((loser.source.clone(), loser.kind)).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += 1;
        }
    }

    let conflicts = lost
        .into_iter()
        .filter(|(_, (lost_count, _))| *lost_count > 0)
        .map(|((source, kind), (lost_count, total))| (source, kind, lost_count == total))
        .collect();

    (winners, conflicts)
}

fn attaches(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    gateway: &Arc<Gateway>,
    listener: &GatewayListener,
    route_name: &FullName,
    kind: ObjectKind,
    parent_refs: &[ParentReference],
) -> bool {
    let references_listener = parent_refs.iter().any(|parent| {
        parent.name == gateway_name.name
            && parent.namespace.as_deref().unwrap_or(&route_name.namespace)
                == gateway_name.namespace
            && parent
                .section_name
                .as_deref()
                .map(|section| section == listener.name)
                .unwrap_or(true)
            && parent.port.map(|port| port == listener.port).unwrap_or(true)
    });
    if !references_listener {
        return false;
    }

    let from = gateway
        .spec
        .listeners
        .iter()
        .find(|l| l.name == listener.name)
        .and_then(|l| l.allowed_routes.as_ref())
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|n| n.from.clone())
        .unwrap_or_else(|| "Same".to_string());
    let allowed = match from.as_str() {
        "All" => true,
        // Selector is unsupported and degrades to Same.
        _ => route_name.namespace == gateway_name.namespace,
    };
    if !allowed {
        ctx.report.condition(
            kind,
            route_name.clone(),
            ResourceCondition::negative(
                ConditionType::Accepted,
                Reason::RefNotPermitted,
                format!(
                    "listener {:?} does not allow routes from namespace {:?}",
                    listener.name, route_name.namespace
                ),
            ),
        );
        return false;
    }
    true
}

fn intersected_hostnames(
    ctx: &mut BuildContext,
    kind: ObjectKind,
    route_name: &FullName,
    listener: &GatewayListener,
    hostnames: &[String],
) -> Option<Vec<String>> {
    let listener_hostname = listener.hostname.as_deref();
    let out: Vec<String> = if hostnames.is_empty() {
        vec![listener_hostname.unwrap_or("*").to_string()]
    } else {
        hostnames
            .iter()
            .filter_map(|hostname| {
                intersect_hostnames(listener_hostname, hostname).map(str::to_string)
            })
            .collect()
    };
    if out.is_empty() {
        ctx.report.condition(
            kind,
            route_name.clone(),
            ResourceCondition::negative(
                ConditionType::Accepted,
                Reason::NoIntersectingHostnames,
                format!(
                    "no route hostname intersects listener hostname {:?}",
                    listener_hostname.unwrap_or("*")
                ),
            ),
        );
        return None;
    }
    Some(out)
}

/// Resolve backend references into a forward action; unresolvable backends
/// degrade to a synthesized 500 so the route visibly exists (Gateway API
/// semantics, unlike HTTPProxy pruning).
fn backend_action(
    ctx: &mut BuildContext,
    kind: ObjectKind,
    route_name: &FullName,
    backend_refs: &[BackendRef],
    protocol: Option<UpstreamProtocol>,
) -> RouteAction {
    let mut clusters = Vec::new();
    let mut resolved_all = true;

    for backend in backend_refs {
        match resolve_backend(ctx, kind, route_name, backend, protocol) {
            Ok(cluster) => clusters.push(WeightedCluster {
                name: cluster,
                weight: backend.weight.unwrap_or(1),
            }),
            Err((reason, message)) => {
                resolved_all = false;
                ctx.report.condition(
                    kind,
                    route_name.clone(),
                    ResourceCondition::negative(ConditionType::ResolvedRefs, reason, message),
                );
            }
        }
    }

    if resolved_all && !backend_refs.is_empty() {
        ctx.report.condition(
            kind,
            route_name.clone(),
            ResourceCondition::positive(
                ConditionType::ResolvedRefs,
                Reason::Valid,
                "all backend references resolved",
            ),
        );
    }

    if clusters.is_empty() {
        RouteAction::DirectResponse { status: 500, body: None }
    } else {
        RouteAction::Forward { clusters, mirror: None }
    }
}

fn resolve_backend(
    ctx: &mut BuildContext,
    kind: ObjectKind,
    route_name: &FullName,
    backend: &BackendRef,
    protocol: Option<UpstreamProtocol>,
) -> Result<String, (Reason, String)> {
    let group_ok = backend.group.as_deref().map(|g| g.is_empty()).unwrap_or(true);
    let kind_ok = backend
        .kind
        .as_deref()
        .map(|k| k == "Service")
        .unwrap_or(true);
    if !group_ok || !kind_ok {
        return Err((
            Reason::InvalidKind,
            format!(
                "backendRef {:?} has unsupported kind {}/{}",
                backend.name,
                backend.group.as_deref().unwrap_or(""),
                backend.kind.as_deref().unwrap_or("Service"),
            ),
        ));
    }

    let namespace = backend.namespace.as_deref().unwrap_or(&route_name.namespace);
    if namespace != route_name.namespace
        && !reference_grant_permits(
            ctx,
            "gateway.networking.k8s.io",
            kind.as_str(),
            &route_name.namespace,
            "Service",
            namespace,
            &backend.name,
        )
    {
        return Err((
            Reason::RefNotPermitted,
            format!(
                "backendRef {}/{} is not permitted by any ReferenceGrant",
                namespace, backend.name
            ),
        ));
    }

    let Some(port) = backend.port else {
        return Err((
            Reason::BackendNotFound,
            format!("backendRef {:?} names no port", backend.name),
        ));
    };

    let resolved = ctx
        .resolve_service(namespace, &backend.name, ServicePortRef::Number(port))
        .map_err(|failure| (failure.reason, failure.message))?;

    // BackendTLSPolicy targeting this service upgrades the connection.
    let (protocol, validation, sni) = match backend_tls_policy(ctx, &resolved.name) {
        Some((ca_secret, hostname)) => (
            Some(UpstreamProtocol::Tls),
            Some(crate::domain::dag::UpstreamValidation {
                ca_secret,
                subject_name: hostname.clone(),
            }),
            Some(hostname),
        ),
        None => (protocol, None, None),
    };

    let mut notes = Vec::new();
    let cluster = ctx.cluster_for(&resolved, protocol, None, None, validation, sni, &mut notes);
    ctx.note_policy_errors(kind, route_name, &notes);
    Ok(cluster)
}

/// The CA bundle and subject name demanded by a BackendTLSPolicy targeting
/// `service`, if one exists and its bundle is loadable.
fn backend_tls_policy(ctx: &mut BuildContext, service: &FullName) -> Option<(String, String)> {
    let policies: Vec<(FullName, Arc<crate::domain::gateway::BackendTLSPolicy>)> = ctx
        .snapshot
        .backend_tls_policies
        .iter()
        .map(|(n, p)| (n.clone(), p.clone()))
        .collect();
    for (policy_name, policy) in policies {
        if policy_name.namespace != service.namespace {
            continue;
        }
        let targets = policy
            .spec
            .target_refs
            .iter()
            .any(|target| target.kind == "Service" && target.name == service.name);
        if !targets {
            continue;
        }
        let validation = policy.spec.validation.as_ref()?;
        let ca = validation.ca_certificate_refs.first()?;
        let reference = format!("{}/{}", policy_name.namespace, ca.name);
        match ctx.resolve_ca_unchecked(&reference) {
            Ok(secret) => return Some((secret, validation.hostname.clone())),
            Err(failure) => {
                ctx.report.condition(
                    ObjectKind::BackendTlsPolicy,
                    policy_name.clone(),
                    ResourceCondition::negative(
                        ConditionType::ResolvedRefs,
                        failure.reason,
                        failure.message,
                    ),
                );
                return None;
            }
        }
    }
    None
}

fn attach_tls_routes(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    gateway: &Arc<Gateway>,
    listener: &GatewayListener,
) {
    let tls_routes: Vec<(FullName, Arc<crate::domain::gateway::TLSRoute>)> = ctx
        .snapshot
        .tls_routes
        .iter()
        .map(|(n, r)| (n.clone(), r.clone()))
        .collect();
    for (route_name, route) in tls_routes {
        if !attaches(
            ctx,
            gateway_name,
            gateway,
            listener,
            &route_name,
            ObjectKind::TlsRoute,
            &route.spec.parent_refs,
        ) {
            continue;
        }
        let hostnames = match intersected_hostnames(
            ctx,
            ObjectKind::TlsRoute,
            &route_name,
            listener,
            &route.spec.hostnames,
        ) {
            Some(hostnames) => hostnames,
            None => continue,
        };

        let mut clusters = Vec::new();
        for rule in &route.spec.rules {
            for backend in &rule.backend_refs {
                match resolve_backend(ctx, ObjectKind::TlsRoute, &route_name, backend, None) {
                    Ok(cluster) => clusters.push(WeightedCluster {
                        name: cluster,
                        weight: backend.weight.unwrap_or(1),
                    }),
                    Err((reason, message)) => {
                        ctx.report.condition(
                            ObjectKind::TlsRoute,
                            route_name.clone(),
                            ResourceCondition::negative(
                                ConditionType::ResolvedRefs,
                                reason,
                                message,
                            ),
                        );
                    }
                }
            }
        }
        if clusters.is_empty() {
            continue;
        }

        if let Some(dag_listener) = ctx
            .dag
            .listeners
            .iter_mut()
            .find(|l| l.name == HTTPS_LISTENER_NAME)
        {
            for hostname in &hostnames {
                if hostname == "*" {
                    continue;
                }
                dag_listener.secure_virtual_hosts.push(SecureVirtualHost {
                    virtual_host: VirtualHost::new(hostname),
                    secret: None,
                    min_tls_version: TlsVersion::V1_2,
                    max_tls_version: TlsVersion::V1_3,
                    cipher_suites: Vec::new(),
                    client_validation: None,
                    tcp_proxy: Some(TcpProxy { clusters: clusters.clone() }),
                });
            }
        }
        ctx.report.mark_valid_if_unset(ObjectKind::TlsRoute, route_name.clone());
    }
}

fn attach_tcp_routes(
    ctx: &mut BuildContext,
    gateway_name: &FullName,
    gateway: &Arc<Gateway>,
    listener: &GatewayListener,
) {
    let tcp_routes: Vec<(FullName, Arc<crate::domain::gateway::TCPRoute>)> = ctx
        .snapshot
        .tcp_routes
        .iter()
        .map(|(n, r)| (n.clone(), r.clone()))
        .collect();
    for (route_name, route) in tcp_routes {
        if !attaches(
            ctx,
            gateway_name,
            gateway,
            listener,
            &route_name,
            ObjectKind::TcpRoute,
            &route.spec.parent_refs,
        ) {
            continue;
        }

        let mut clusters = Vec::new();
        for rule in &route.spec.rules {
            for backend in &rule.backend_refs {
                match resolve_backend(ctx, ObjectKind::TcpRoute, &route_name, backend, None) {
                    Ok(cluster) => clusters.push(WeightedCluster {
                        name: cluster,
                        weight: backend.weight.unwrap_or(1),
                    }),
                    Err((reason, message)) => {
                        ctx.report.condition(
                            ObjectKind::TcpRoute,
                            route_name.clone(),
                            ResourceCondition::negative(
                                ConditionType::ResolvedRefs,
                                reason,
                                message,
                            ),
                        );
                    }
                }
            }
        }
        if clusters.is_empty() {
            continue;
        }

        let name = format!(
            "tcp_{}_{}_{}",
            gateway_name.namespace, gateway_name.name, listener.name
        );
        let mut dag_listener = Listener::new(name, ctx.config.listener.address.as_str(), listener.port);
        dag_listener.tcp_proxy = Some(TcpProxy { clusters });
        ctx.dag.listeners.push(dag_listener);
        ctx.report.mark_valid_if_unset(ObjectKind::TcpRoute, route_name.clone());
    }
}

fn reference_grant_permits(
    ctx: &BuildContext,
    from_group: &str,
    from_kind: &str,
    from_namespace: &str,
    to_kind: &str,
    to_namespace: &str,
    to_name: &str,
) -> bool {
    ctx.snapshot
        .reference_grants
        .iter()
        .filter(|(grant_name, _)| grant_name.namespace == to_namespace)
        .any(|(_, grant)| {
            let from_ok = grant.spec.from.iter().any(|from| {
                from.group == from_group && from.kind == from_kind && from.namespace == from_namespace
            });
            let to_ok = grant.spec.to.iter().any(|to| {
                to.kind == to_kind
                    && to.name.as_deref().map(|n| n == to_name).unwrap_or(true)
            });
            from_ok && to_ok
        })
}

struct CompiledHttpMatch {
    path: PathMatch,
    headers: Vec<HeaderMatch>,
    query_params: Vec<QueryParamMatch>,
    method: Option<String>,
}

fn compile_http_match(
    ctx: &mut BuildContext,
    route_name: &FullName,
    route_match: &HTTPRouteMatch,
) -> Option<CompiledHttpMatch> {
    let path = match &route_match.path {
        None => PathMatch::Prefix("/".to_string()),
        Some(path) => {
            let value = path.value.clone().unwrap_or_else(|| "/".to_string());
            match path.match_type.as_deref().unwrap_or("PathPrefix") {
                "Exact" => PathMatch::Exact(value),
                "RegularExpression" => {
                    if let Err(failure) = ctx.check_regex(&value) {
                        ctx.report.condition(
                            ObjectKind::HttpRoute,
                            route_name.clone(),
                            ResourceCondition::negative(
                                ConditionType::Accepted,
                                failure.reason,
                                failure.message,
                            ),
                        );
                        return None;
                    }
                    PathMatch::Regex(value)
                }
                _ => PathMatch::Prefix(value),
            }
        }
    };

    let headers = route_match
        .headers
        .iter()
        .map(|header| HeaderMatch {
            name: header.name.clone(),
            kind: match header.match_type.as_deref().unwrap_or("Exact") {
                "RegularExpression" => HeaderMatchKind::Regex(header.value.clone()),
                _ => HeaderMatchKind::Exact(header.value.clone()),
            },
        })
        .collect();

    let query_params = route_match
        .query_params
        .iter()
        .map(|param| QueryParamMatch {
            name: param.name.clone(),
            kind: match param.match_type.as_deref().unwrap_or("Exact") {
                "RegularExpression" => QueryParamMatchKind::Regex(param.value.clone()),
                _ => QueryParamMatchKind::Exact(param.value.clone()),
            },
        })
        .collect();

    Some(CompiledHttpMatch {
        path,
        headers,
        query_params,
        method: route_match.method.as_ref().map(|m| m.to_ascii_uppercase()),
    })
}

fn compile_grpc_match(route_match: &GRPCRouteMatch) -> (PathMatch, Vec<HeaderMatch>) {
    let path = match &route_match.method {
        Some(method) => match (&method.service, &method.method) {
            (Some(service), Some(rpc)) => PathMatch::Exact(format!("/{service}/{rpc}")),
            (Some(service), None) => PathMatch::Prefix(format!("/{service}/")),
            (None, Some(rpc)) => PathMatch::Regex(format!("/.+/{rpc}")),
            (None, None) => PathMatch::Prefix("/".to_string()),
        },
        None => PathMatch::Prefix("/".to_string()),
    };
    let headers = route_match
        .headers
        .iter()
        .map(|header| HeaderMatch {
            name: header.name.clone(),
            kind: match header.match_type.as_deref().unwrap_or("Exact") {
                "RegularExpression" => HeaderMatchKind::Regex(header.value.clone()),
                _ => HeaderMatchKind::Exact(header.value.clone()),
            },
        })
        .collect();
    (path, headers)
}
