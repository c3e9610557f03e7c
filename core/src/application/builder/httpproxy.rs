// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! HTTPProxy processing: root admission, the inclusion walk, and route
//! compilation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::conditions::{ConditionType, Reason, ResourceCondition};
use crate::domain::dag::{
    ClientValidation, HeaderMatch, HeaderMatchKind, PathMatch, QueryParamMatch,
    QueryParamMatchKind, Redirect, Route, RouteAction, RouteOrigin, SecureVirtualHost, TcpProxy,
    TlsVersion, VirtualHost, WeightedCluster, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};
use crate::domain::httpproxy::{
    HTTPProxy, HeadersPolicy, MatchCondition, RouteSpec, ServiceReference, TlsSpec,
};
use crate::domain::kubernetes::{FullName, ObjectKind};
use crate::domain::policy::{
    HeaderManipulation, HealthCheckPolicy, LbStrategy, RetryPolicy, Timeout, TimeoutPolicy,
    UpstreamProtocol,
};

use super::{
    BuildContext, IncludeConditionSet, ResolveFailure, ResolvedService, ServicePortRef,
};

const KIND: ObjectKind = ObjectKind::HttpProxy;

pub(crate) fn process(ctx: &mut BuildContext) {
    // Deterministic admission order: oldest first, ties by namespace/name,
    // so FQDN conflicts resolve the same way on every rebuild.
    let mut proxies: Vec<(FullName, Arc<HTTPProxy>)> = ctx
        .snapshot
        .httpproxies
        .iter()
        .map(|(name, proxy)| (name.clone(), proxy.clone()))
        .collect();
    proxies.sort_by_key(|(name, proxy)| (creation_timestamp(proxy), name.clone()));

    for (name, proxy) in &proxies {
        if proxy.spec.virtualhost.is_some() {
            process_root(ctx, name, proxy);
        }
    }

    // I2: a non-root proxy nothing includes is orphaned.
    for (name, proxy) in &proxies {
        if proxy.spec.virtualhost.is_none() && !ctx.included_by.contains_key(name) {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::Orphaned,
                    "this HTTPProxy is not part of a delegation chain from a root HTTPProxy",
                ),
            );
        }
    }

}

fn process_root(ctx: &mut BuildContext, name: &FullName, proxy: &Arc<HTTPProxy>) {
    let class = ingress_class(proxy);
    if !ctx.config.admits_ingress_class(class.as_deref()) {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::IngressClassMismatch,
                format!("ingress class {:?} does not match this controller", class),
            ),
        );
        return;
    }

    if !ctx.config.admits_root_namespace(&name.namespace) {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::RootNamespaceMismatch,
                format!("root HTTPProxy is not allowed in namespace {:?}", name.namespace),
            ),
        );
        return;
    }

    let vhost_spec = proxy.spec.virtualhost.as_ref().expect("root has virtualhost");
    let fqdn = vhost_spec.fqdn.trim();
    if fqdn.is_empty() || fqdn.contains('/') {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::SpecError,
                "spec.virtualhost.fqdn must be a fully qualified domain name",
            ),
        );
        return;
    }

    if let Err(claim) = ctx.claim_fqdn(fqdn, KIND, name) {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::DuplicateFqdn,
                format!("fqdn {fqdn:?} is already claimed by {} {}", claim.kind, claim.owner),
            ),
        );
        return;
    }

    // Auth and rate-limit policies must point at a known ExtensionService;
    // the filters themselves dial the cluster emitted for it.
    for extension_ref in [
        vhost_spec.authorization.as_ref().map(|a| &a.extension_ref),
        vhost_spec.rate_limit_policy.as_ref().map(|r| &r.extension_ref),
    ]
    .into_iter()
    .flatten()
    {
        let target = FullName::new(
            extension_ref.namespace.as_deref().unwrap_or(&name.namespace),
            &extension_ref.name,
        );
        if !ctx.snapshot.extension_services.contains_key(&target) {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::ResolvedRefs,
                    Reason::BackendNotFound,
                    format!("ExtensionService {target} not found"),
                ),
            );
        }
    }

    // Resolve TLS first: route placement depends on it.
    let tls = vhost_spec.tls.as_ref().map(|tls| resolve_tls(ctx, name, fqdn, tls));

    // Build the route set by walking this root's tree.
    let mut vhost = VirtualHost::new(fqdn);
    let mut stack = vec![name.clone()];
    walk(ctx, name, proxy, name, &mut stack, &[], &mut vhost);

    // TCP proxying requires a TLS virtual host.
    let tcp_proxy = proxy.spec.tcpproxy.as_ref().and_then(|spec| {
        if tls.is_none() {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::SpecError,
                    "spec.tcpproxy requires spec.virtualhost.tls",
                ),
            );
            return None;
        }
        build_tcp_proxy(ctx, name, &spec.services)
    });

    match tls {
        Some(resolved_tls) => {
            let secure = SecureVirtualHost {
                virtual_host: vhost.clone(),
                secret: resolved_tls.secret,
                min_tls_version: resolved_tls.min_version,
                max_tls_version: resolved_tls.max_version,
                cipher_suites: Vec::new(),
                client_validation: resolved_tls.client_validation,
                tcp_proxy,
            };
            if secure.secret.is_none() && secure.tcp_proxy.is_none() {
                // Keypair was unusable (or passthrough lacks a tcpproxy):
                // the host falls back to cleartext and the condition
                // already records why.
                attach_insecure(ctx, vhost);
            } else if let Some(listener) = ctx
                .dag
                .listeners
                .iter_mut()
                .find(|l| l.name == HTTPS_LISTENER_NAME)
            {
                listener.secure_virtual_hosts.push(secure);
            }
        }
        None => attach_insecure(ctx, vhost),
    }

    ctx.report.mark_valid_if_unset(KIND, name.clone());
}

fn attach_insecure(ctx: &mut BuildContext, vhost: VirtualHost) {
    if vhost.routes.is_empty() {
        return;
    }
    if let Some(listener) = ctx
        .dag
        .listeners
        .iter_mut()
        .find(|l| l.name == HTTP_LISTENER_NAME)
    {
        listener.virtual_hosts.push(vhost);
    }
}

struct ResolvedTls {
    secret: Option<String>,
    min_version: TlsVersion,
    max_version: TlsVersion,
    client_validation: Option<ClientValidation>,
}

fn resolve_tls(
    ctx: &mut BuildContext,
    name: &FullName,
    fqdn: &str,
    tls: &TlsSpec,
) -> ResolvedTls {
    let mut resolved = ResolvedTls {
        secret: None,
        min_version: TlsVersion::default(),
        max_version: TlsVersion::default(),
        client_validation: None,
    };

    let parse_version = |ctx: &mut BuildContext, value: &Option<String>, fallback: TlsVersion| {
        match value {
            None => fallback,
            Some(raw) => match TlsVersion::parse(raw) {
                Some(version) => version,
                None => {
                    ctx.report.condition(
                        KIND,
                        name.clone(),
                        ResourceCondition::negative(
                            ConditionType::Valid,
                            Reason::TlsParametersInvalid,
                            format!("unknown TLS protocol version {raw:?}"),
                        ),
                    );
                    fallback
                }
            },
        }
    };
    resolved.min_version = parse_version(
        ctx,
        &tls.minimum_protocol_version,
        global_version(ctx, true).unwrap_or(TlsVersion::V1_2),
    );
    resolved.max_version = parse_version(
        ctx,
        &tls.maximum_protocol_version,
        global_version(ctx, false).unwrap_or(TlsVersion::V1_3),
    );
    if resolved.min_version > resolved.max_version {
        ctx.report.condition(
            KIND,
            name.clone(),
            ResourceCondition::negative(
                ConditionType::Valid,
                Reason::TlsParametersInvalid,
                "minimum TLS protocol version exceeds maximum",
            ),
        );
        resolved.min_version = resolved.max_version;
    }

    if tls.passthrough {
        if tls.secret_name.is_some() {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::TlsParametersInvalid,
                    "passthrough and secretName are mutually exclusive",
                ),
            );
        }
        return resolved;
    }

    match &tls.secret_name {
        Some(reference) => match ctx.resolve_keypair(&name.namespace, reference) {
            Ok(secret) => resolved.secret = Some(secret),
            Err(failure) => {
                debug!(proxy = %name, fqdn, reason = ?failure.reason, "tls fallback to cleartext");
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
        },
        None => {
            ctx.report.condition(
                KIND,
                name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::TlsParametersInvalid,
                    "spec.virtualhost.tls requires secretName or passthrough",
                ),
            );
        }
    }

    if let Some(validation) = &tls.client_validation {
        match ctx.resolve_ca_bundle(&name.namespace, &validation.ca_secret) {
            Ok(ca_secret) => {
                resolved.client_validation = Some(ClientValidation {
                    ca_secret,
                    optional: validation.optional_client_certificate,
                });
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

    resolved
}

fn global_version(ctx: &BuildContext, minimum: bool) -> Option<TlsVersion> {
    let raw = if minimum {
        ctx.config.tls.minimum_protocol_version.as_ref()
    } else {
        ctx.config.tls.maximum_protocol_version.as_ref()
    };
    raw.and_then(|v| TlsVersion::parse(v))
}

/// Depth-first walk of one root's inclusion tree.
fn walk(
    ctx: &mut BuildContext,
    root: &FullName,
    proxy: &Arc<HTTPProxy>,
    proxy_name: &FullName,
    stack: &mut Vec<FullName>,
    inherited: &[MatchCondition],
    vhost: &mut VirtualHost,
) {
    for route in &proxy.spec.routes {
        build_route(ctx, proxy_name, proxy, route, inherited, vhost);
    }

    let mut seen = IncludeConditionSet::new();
    for include in &proxy.spec.includes {
        let target = FullName::new(
            include.namespace.as_deref().unwrap_or(&proxy_name.namespace),
            &include.name,
        );

        if !seen.first_occurrence(&include.conditions) {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::DuplicateMatchConditions,
                    format!("duplicate include conditions for {target}"),
                ),
            );
            continue;
        }

        if stack.contains(&target) {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::RootIncludesRoot,
                    format!("include of {target} creates an inclusion cycle"),
                ),
            );
            continue;
        }

        let Some(child) = ctx.snapshot.httpproxies.get(&target).cloned() else {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::BackendNotFound,
                    format!("included HTTPProxy {target} not found"),
                ),
            );
            continue;
        };

        if child.spec.virtualhost.is_some() {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(
                    ConditionType::Valid,
                    Reason::RootIncludesRoot,
                    format!("root HTTPProxy cannot include root HTTPProxy {target}"),
                ),
            );
            continue;
        }

        match ctx.included_by.get(&target) {
            Some(existing_root) if existing_root != root => {
                ctx.report.condition(
                    KIND,
                    proxy_name.clone(),
                    ResourceCondition::negative(
                        ConditionType::Valid,
                        Reason::Orphaned,
                        format!("HTTPProxy {target} is already included by root {existing_root}"),
                    ),
                );
                continue;
            }
            _ => {
                ctx.included_by.insert(target.clone(), root.clone());
            }
        }

        let mut merged: Vec<MatchCondition> = inherited.to_vec();
        merged.extend(include.conditions.iter().cloned());

        stack.push(target.clone());
        walk(ctx, root, &child, &target, stack, &merged, vhost);
        stack.pop();
        ctx.report.mark_valid_if_unset(KIND, target);
    }
}

fn build_route(
    ctx: &mut BuildContext,
    proxy_name: &FullName,
    proxy: &Arc<HTTPProxy>,
    spec: &RouteSpec,
    inherited: &[MatchCondition],
    vhost: &mut VirtualHost,
) {
    let mut conditions: Vec<MatchCondition> = inherited.to_vec();
    conditions.extend(spec.conditions.iter().cloned());

    let compiled = match compile_conditions(ctx, &conditions) {
        Ok(compiled) => compiled,
        Err(failure) => {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(ConditionType::Valid, failure.reason, failure.message),
            );
            return;
        }
    };

    let action = match route_action(ctx, proxy_name, spec) {
        Ok(Some(action)) => action,
        Ok(None) => return,
        Err(failure) => {
            ctx.report.condition(
                KIND,
                proxy_name.clone(),
                ResourceCondition::negative(ConditionType::Valid, failure.reason, failure.message),
            );
            return;
        }
    };

    let timeouts = timeout_policy(ctx, proxy_name, spec);
    let retry = spec.retry_policy.as_ref().map(|policy| RetryPolicy {
        count: policy.count.max(1),
        per_try_timeout: policy
            .per_try_timeout
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok()),
        retry_on: if policy.retry_on.is_empty() {
            vec!["5xx".to_string()]
        } else {
            policy.retry_on.clone()
        },
    });

    vhost.routes.push(Route {
        path: compiled.path,
        headers: compiled.headers,
        query_params: compiled.query_params,
        method: compiled.method,
        action,
        timeouts,
        retry,
        request_headers: header_manipulation(spec.request_headers_policy.as_ref()),
        response_headers: header_manipulation(spec.response_headers_policy.as_ref()),
        prefix_rewrite: spec
            .path_rewrite_policy
            .as_ref()
            .and_then(|p| p.replace_prefix.clone()),
        websocket: spec.enable_websockets,
        origin: RouteOrigin {
            namespace: proxy_name.namespace.clone(),
            name: proxy_name.name.clone(),
            creation_timestamp: creation_timestamp(proxy),
        },
    });
}

/// Route action precedence: redirect, then direct response, then forward.
fn route_action(
    ctx: &mut BuildContext,
    proxy_name: &FullName,
    spec: &RouteSpec,
) -> Result<Option<RouteAction>, ResolveFailure> {
    if let Some(redirect) = &spec.request_redirect_policy {
        return Ok(Some(RouteAction::Redirect(Redirect {
            hostname: redirect.hostname.clone(),
            scheme: redirect.scheme.clone(),
            port: redirect.port,
            status_code: redirect.status_code.unwrap_or(302),
            path: redirect.path.clone(),
        })));
    }
    if let Some(direct) = &spec.direct_response_policy {
        return Ok(Some(RouteAction::DirectResponse {
            status: direct.status_code,
            body: direct.body.clone(),
        }));
    }

    if spec.services.is_empty() {
        return Err(ResolveFailure {
            reason: Reason::SpecError,
            message: "route has no services, redirect, or direct response".to_string(),
        });
    }

    let lb_override = spec
        .load_balancer_policy
        .as_ref()
        .and_then(|p| LbStrategy::parse(&p.strategy));
    let health_check = spec.health_check_policy.as_ref().map(|policy| HealthCheckPolicy {
        path: policy.path.clone(),
        host: policy.host.clone(),
        interval: std::time::Duration::from_secs(policy.interval_seconds.unwrap_or(5)),
        timeout: std::time::Duration::from_secs(policy.timeout_seconds.unwrap_or(2)),
        unhealthy_threshold: policy.unhealthy_threshold_count.unwrap_or(3),
        healthy_threshold: policy.healthy_threshold_count.unwrap_or(3),
    });

    let mut clusters = Vec::new();
    let mut mirror = None;
    for service in &spec.services {
        match resolve_backend(ctx, proxy_name, service, lb_override, health_check.clone()) {
            Ok(cluster_name) => {
                if service.mirror {
                    mirror = Some(cluster_name);
                } else {
                    clusters.push(WeightedCluster {
                        name: cluster_name,
                        weight: service.weight.unwrap_or(1),
                    });
                }
            }
            // HTTPProxy semantics: an unresolvable backend prunes the
            // whole route.
            Err(failure) => return Err(failure),
        }
    }

    if clusters.is_empty() {
        return Err(ResolveFailure {
            reason: Reason::SpecError,
            message: "route has only mirror services".to_string(),
        });
    }

    Ok(Some(RouteAction::Forward { clusters, mirror }))
}

fn resolve_backend(
    ctx: &mut BuildContext,
    proxy_name: &FullName,
    service: &ServiceReference,
    lb_override: Option<LbStrategy>,
    health_check: Option<HealthCheckPolicy>,
) -> Result<String, ResolveFailure> {
    let resolved: ResolvedService = ctx.resolve_service(
        &proxy_name.namespace,
        &service.name,
        ServicePortRef::Number(service.port),
    )?;

    let protocol = match service.protocol.as_deref() {
        None => None,
        Some("h2") => Some(UpstreamProtocol::H2),
        Some("h2c") => Some(UpstreamProtocol::H2c),
        Some("tls") => Some(UpstreamProtocol::Tls),
        Some(other) => {
            return Err(ResolveFailure {
                reason: Reason::SpecError,
                message: format!("unknown upstream protocol {other:?}"),
            });
        }
    };

    let upstream_validation = match &service.validation {
        None => None,
        Some(validation) => {
            let ca_secret = ctx
                .resolve_ca_bundle(&proxy_name.namespace, &validation.ca_secret)
                .map_err(|failure| ResolveFailure {
                    reason: failure.reason,
                    message: failure.message,
                })?;
            Some(crate::domain::dag::UpstreamValidation {
                ca_secret,
                subject_name: validation.subject_name.clone(),
            })
        }
    };

    let mut notes = Vec::new();
    let sni = upstream_validation.as_ref().map(|v| v.subject_name.clone());
    let cluster = ctx.cluster_for(
        &resolved,
        protocol,
        lb_override,
        health_check,
        upstream_validation,
        sni,
        &mut notes,
    );
    ctx.note_policy_errors(KIND, proxy_name, &notes);
    Ok(cluster)
}

fn build_tcp_proxy(
    ctx: &mut BuildContext,
    proxy_name: &FullName,
    services: &[ServiceReference],
) -> Option<TcpProxy> {
    let mut clusters = Vec::new();
    for service in services {
        match resolve_backend(ctx, proxy_name, service, None, None) {
            Ok(name) => clusters.push(WeightedCluster {
                name,
                weight: service.weight.unwrap_or(1),
            }),
            Err(failure) => {
                ctx.report.condition(
                    KIND,
                    proxy_name.clone(),
                    ResourceCondition::negative(
                        ConditionType::Valid,
                        failure.reason,
                        failure.message,
                    ),
                );
                return None;
            }
        }
    }
    if clusters.is_empty() {
        None
    } else {
        Some(TcpProxy { clusters })
    }
}

fn timeout_policy(
    ctx: &mut BuildContext,
    proxy_name: &FullName,
    spec: &RouteSpec,
) -> TimeoutPolicy {
    let mut policy = TimeoutPolicy::default();
    let Some(timeouts) = &spec.timeout_policy else {
        return policy;
    };
    let mut notes = Vec::new();
    if let Some(raw) = &timeouts.response {
        match Timeout::parse(raw) {
            Ok(timeout) => policy.response = timeout,
            Err(error) => notes.push(error),
        }
    }
    if let Some(raw) = &timeouts.idle {
        match Timeout::parse(raw) {
            Ok(timeout) => policy.idle = timeout,
            Err(error) => notes.push(error),
        }
    }
    ctx.note_policy_errors(KIND, proxy_name, &notes);
    policy
}

fn header_manipulation(policy: Option<&HeadersPolicy>) -> HeaderManipulation {
    let Some(policy) = policy else {
        return HeaderManipulation::default();
    };
    HeaderManipulation {
        set: policy
            .set
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect(),
        remove: policy.remove.clone(),
    }
}

pub(crate) struct CompiledMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub method: Option<String>,
}

/// Fold a condition chain (includes first, route's own last) into a single
/// match. Prefixes concatenate left to right; at most one exact or regex
/// path may terminate the chain.
pub(crate) fn compile_conditions(
    ctx: &BuildContext,
    conditions: &[MatchCondition],
) -> Result<CompiledMatch, ResolveFailure> {
    let mut prefix = String::new();
    let mut terminal: Option<PathMatch> = None;
    let mut headers = Vec::new();
    let mut query_params = Vec::new();
    let mut method: Option<String> = None;

    for condition in conditions {
        let path_fields = [
            condition.prefix.is_some(),
            condition.exact.is_some(),
            condition.regex.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if path_fields > 1 {
            return Err(ResolveFailure {
                reason: Reason::SpecError,
                message: "a condition may set at most one of prefix, exact, regex".to_string(),
            });
        }
        if terminal.is_some() && path_fields > 0 {
            return Err(ResolveFailure {
                reason: Reason::SpecError,
                message: "no path condition may follow an exact or regex condition".to_string(),
            });
        }

        if let Some(p) = &condition.prefix {
            append_prefix(&mut prefix, p);
        }
        if let Some(exact) = &condition.exact {
            let mut full = prefix.clone();
            append_prefix(&mut full, exact);
            terminal = Some(PathMatch::Exact(full));
        }
        if let Some(pattern) = &condition.regex {
            ctx.check_regex(pattern)?;
            terminal = Some(PathMatch::Regex(format!("{prefix}{pattern}")));
        }

        if let Some(header) = &condition.header {
            headers.push(compile_header(ctx, header)?);
        }
        if let Some(param) = &condition.query_parameter {
            query_params.push(compile_query_param(ctx, param)?);
        }
        if let Some(m) = &condition.method {
            if method.is_some() {
                return Err(ResolveFailure {
                    reason: Reason::SpecError,
                    message: "only one method condition is allowed".to_string(),
                });
            }
            method = Some(m.to_ascii_uppercase());
        }
    }

    let path = terminal.unwrap_or_else(|| {
        PathMatch::Prefix(if prefix.is_empty() { "/".to_string() } else { prefix })
    });

    Ok(CompiledMatch { path, headers, query_params, method })
}

fn append_prefix(base: &mut String, segment: &str) {
    let segment = segment.trim();
    if segment.is_empty() || segment == "/" {
        return;
    }
    let trimmed_base = base.trim_end_matches('/').to_string();
    let trimmed_segment = segment.trim_start_matches('/');
    *base = format!("{trimmed_base}/{trimmed_segment}");
}

fn compile_header(
    ctx: &BuildContext,
    condition: &crate::domain::httpproxy::HeaderMatchCondition,
) -> Result<HeaderMatch, ResolveFailure> {
    let kind = if condition.present == Some(true) {
        HeaderMatchKind::Present
    } else if condition.notpresent == Some(true) {
        HeaderMatchKind::NotPresent
    } else if let Some(value) = &condition.exact {
        HeaderMatchKind::Exact(value.clone())
    } else if let Some(value) = &condition.notexact {
        HeaderMatchKind::NotExact(value.clone())
    } else if let Some(value) = &condition.contains {
        HeaderMatchKind::Contains(value.clone())
    } else if let Some(value) = &condition.notcontains {
        HeaderMatchKind::NotContains(value.clone())
    } else if let Some(pattern) = &condition.regex {
        ctx.check_regex(pattern)?;
        HeaderMatchKind::Regex(pattern.clone())
    } else {
        return Err(ResolveFailure {
            reason: Reason::SpecError,
            message: format!("header condition {:?} has no operator", condition.name),
        });
    };
    Ok(HeaderMatch { name: condition.name.clone(), kind })
}

fn compile_query_param(
    ctx: &BuildContext,
    condition: &crate::domain::httpproxy::QueryParameterMatchCondition,
) -> Result<QueryParamMatch, ResolveFailure> {
    let kind = if let Some(value) = &condition.exact {
        QueryParamMatchKind::Exact(value.clone())
    } else if let Some(pattern) = &condition.regex {
        ctx.check_regex(pattern)?;
        QueryParamMatchKind::Regex(pattern.clone())
    } else {
        return Err(ResolveFailure {
            reason: Reason::SpecError,
            message: format!("query parameter condition {:?} has no operator", condition.name),
        });
    };
    Ok(QueryParamMatch { name: condition.name.clone(), kind })
}

fn ingress_class(proxy: &HTTPProxy) -> Option<String> {
    proxy
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| {
            annotations
                .get("isthmus.dev/ingress.class")
                .or_else(|| annotations.get("kubernetes.io/ingress.class"))
                .cloned()
        })
        .or_else(|| proxy.spec.ingress_class_name.clone())
}

pub(crate) fn creation_timestamp(proxy: &HTTPProxy) -> Option<DateTime<Utc>> {
    proxy.metadata.creation_timestamp.as_ref().map(|t| t.0)
}
