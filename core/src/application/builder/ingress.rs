// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Ingress processing. Ingress is the flat surface: no delegation, no
//! inclusion, policies only via annotations. Hosts shared by several
//! Ingress objects merge; hosts already claimed by an HTTPProxy root lose
//! with `DuplicateFQDN`.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};

use crate::domain::conditions::{ConditionType, Reason, ResourceCondition};
use crate::domain::dag::{
    PathMatch, Route, RouteAction, RouteOrigin, SecureVirtualHost, TlsVersion, VirtualHost,
    WeightedCluster, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};
use crate::domain::kubernetes::{FullName, ObjectKind};
use crate::domain::policy::{
    HeaderManipulation, RetryPolicy, Timeout, TimeoutPolicy, ANNOTATION_PREFIX,
};

use super::{BuildContext, ServicePortRef};

const KIND: ObjectKind = ObjectKind::Ingress;

pub(crate) fn process(ctx: &mut BuildContext) {
    // Hosts assemble across Ingress objects before any listener work, so
    // two Ingresses contributing to one host produce one virtual host.
    let mut hosts: BTreeMap<String, VirtualHost> = BTreeMap::new();
    let mut secure_hosts: BTreeMap<String, SecureVirtualHost> = BTreeMap::new();

    let ingresses: Vec<(FullName, Arc<Ingress>)> = ctx
        .snapshot
        .ingresses
        .iter()
        .map(|(name, ingress)| (name.clone(), ingress.clone()))
        .collect();

    for (name, ingress) in &ingresses {
        process_ingress(ctx, name, ingress, &mut hosts, &mut secure_hosts);
    }

    if let Some(listener) = ctx
        .dag
        .listeners
        .iter_mut()
        .find(|l| l.name == HTTP_LISTENER_NAME)
    {
        listener.virtual_hosts.extend(hosts.into_values());
    }
    if let Some(listener) = ctx
        .dag
        .listeners
        .iter_mut()
        .find(|l| l.name == HTTPS_LISTENER_NAME)
    {
        listener.secure_virtual_hosts.extend(secure_hosts.into_values());
    }
}

fn process_ingress(
    ctx: &mut BuildContext,
    name: &FullName,
    ingress: &Arc<Ingress>,
    hosts: &mut BTreeMap<String, VirtualHost>,
    secure_hosts: &mut BTreeMap<String, SecureVirtualHost>,
) {
    let class = ingress_class(ingress);
    if !ctx.config.admits_ingress_class(class.as_deref()) {
        // Foreign classes are silently another controller's business.
        return;
    }
    let Some(spec) = ingress.spec.as_ref() else { return };

    // TLS stanzas map host → keypair for the secure listener.
    let mut tls_hosts: BTreeMap<String, String> = BTreeMap::new();
    for tls in spec.tls.iter().flatten() {
        let Some(secret) = tls.secret_name.as_ref() else { continue };
        match ctx.resolve_keypair(&name.namespace, secret) {
            Ok(cache_name) => {
                for host in tls.hosts.iter().flatten() {
                    tls_hosts.insert(host.to_ascii_lowercase(), cache_name.clone());
                }
            }
            Err(failure) => {
                ctx.report.condition(
                    KIND,
                    name.clone(),
                    ResourceCondition::negative(
                        ConditionType::Valid,
                        failure.reason,
                        failure.message,
                    ),
                );
            }
        }
    }

    let policies = annotation_policies(ctx, name, ingress);

    for rule in spec.rules.iter().flatten() {
        let host = rule
            .host
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "*".to_string());

        if let Some(claim) = ctx.claimed_fqdns.get(&host) {
            if claim.kind != KIND {
                ctx.report.condition(
                    KIND,
                    name.clone(),
                    ResourceCondition::negative(
                        ConditionType::Valid,
                        Reason::DuplicateFqdn,
                        format!("host {host:?} is already claimed by {} {}", claim.kind, claim.owner),
                    ),
                );
                continue;
            }
        } else if host != "*" {
            let _ = ctx.claim_fqdn(&host, KIND, name);
        }

        let mut routes = Vec::new();
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            if let Some(route) = build_route(ctx, name, ingress, path, &policies) {
                routes.push(route);
            }
        }
        if routes.is_empty() {
            continue;
        }

        match tls_hosts.get(&host) {
            Some(secret) if host != "*" => {
                let entry = secure_hosts.entry(host.clone()).or_insert_with(|| {
                    SecureVirtualHost {
                        virtual_host: VirtualHost::new(&host),
                        secret: Some(secret.clone()),
                        min_tls_version: TlsVersion::V1_2,
                        max_tls_version: TlsVersion::V1_3,
                        cipher_suites: Vec::new(),
                        client_validation: None,
                        tcp_proxy: None,
                    }
                });
                entry.virtual_host.routes.extend(routes.clone());
            }
            _ => {}
        }

        hosts
            .entry(host.clone())
            .or_insert_with(|| VirtualHost::new(&host))
            .routes
            .extend(routes);
    }

    ctx.report.mark_valid_if_unset(KIND, name.clone());
}

/// Annotation-driven per-route policies on the Ingress.
struct IngressPolicies {
    timeouts: TimeoutPolicy,
    retry: Option<RetryPolicy>,
    websocket_routes: Vec<String>,
}

fn annotation_policies(
    ctx: &mut BuildContext,
    name: &FullName,
    ingress: &Ingress,
) -> IngressPolicies {
    let annotations = ingress.metadata.annotations.clone().unwrap_or_default();
    let mut notes = Vec::new();

    let mut timeouts = TimeoutPolicy::default();
    if let Some(raw) = annotations.get(&format!("{ANNOTATION_PREFIX}response-timeout")) {
        match Timeout::parse(raw) {
            Ok(timeout) => timeouts.response = timeout,
            Err(error) => notes.push(error),
        }
    }

    let retry_count = annotations
        .get(&format!("{ANNOTATION_PREFIX}num-retries"))
        .and_then(|raw| raw.parse::<u32>().ok());
    let retry_on = annotations
        .get(&format!("{ANNOTATION_PREFIX}retry-on"))
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let retry = match (retry_count, retry_on.is_empty()) {
        (Some(count), _) if count > 0 => Some(RetryPolicy {
            count,
            per_try_timeout: None,
            retry_on: if retry_on.is_empty() { vec!["5xx".to_string()] } else { retry_on },
        }),
        (None, false) => Some(RetryPolicy { count: 1, per_try_timeout: None, retry_on }),
        _ => None,
    };

    let websocket_routes = annotations
        .get(&format!("{ANNOTATION_PREFIX}websocket-routes"))
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    ctx.note_policy_errors(KIND, name, &notes);
    IngressPolicies { timeouts, retry, websocket_routes }
}

fn build_route(
    ctx: &mut BuildContext,
    name: &FullName,
    ingress: &Arc<Ingress>,
    path: &HTTPIngressPath,
    policies: &IngressPolicies,
) -> Option<Route> {
    let Some(backend) = path.backend.service.as_ref() else {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::InvalidKind,
                "only Service backends are supported",
            ),
        );
        return None;
    };

    let port = match backend.port.as_ref() {
        Some(port) => match (&port.name, port.number) {
            (Some(port_name), _) => ServicePortRef::Name(port_name.clone()),
            (None, Some(number)) => ServicePortRef::Number(number as u16),
            (None, None) => {
                return None;
            }
        },
        None => {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::BackendNotFound,
                    format!("backend service {:?} names no port", backend.name),
                ),
            );
            return None;
        }
    };

    let resolved = match ctx.resolve_service(&name.namespace, &backend.name, port) {
        Ok(resolved) => resolved,
        Err(failure) => {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(ConditionType::Valid, failure.reason, failure.message),
            );
            return None;
        }
    };

    let mut notes = Vec::new();
    let cluster = ctx.cluster_for(&resolved, None, None, None, None, None, &mut notes);
    ctx.note_policy_errors(KIND, name, &notes);

    let raw_path = path.path.as_deref().unwrap_or("/");
    let path_match = match path.path_type.as_str() {
        "Exact" => PathMatch::Exact(raw_path.to_string()),
        // Prefix and ImplementationSpecific both behave as prefixes.
        _ => PathMatch::Prefix(raw_path.to_string()),
    };

    Some(Route {
        path: path_match,
        headers: Vec::new(),
        query_params: Vec::new(),
        method: None,
        action: RouteAction::Forward {
            clusters: vec![WeightedCluster { name: cluster, weight: 1 }],
            mirror: None,
        },
        timeouts: policies.timeouts,
        retry: policies.retry.clone(),
        request_headers: HeaderManipulation::default(),
        response_headers: HeaderManipulation::default(),
        prefix_rewrite: None,
        websocket: policies.websocket_routes.iter().any(|p| p == raw_path),
        origin: RouteOrigin {
            namespace: name.namespace.clone(),
            name: name.name.clone(),
            creation_timestamp: ingress.metadata.creation_timestamp.as_ref().map(|t| t.0),
        },
    })
}

fn ingress_class(ingress: &Ingress) -> Option<String> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| {
            annotations
                .get("isthmus.dev/ingress.class")
                .or_else(|| annotations.get("kubernetes.io/ingress.class"))
                .cloned()
        })
        .or_else(|| ingress.spec.as_ref().and_then(|s| s.ingress_class_name.clone()))
}
