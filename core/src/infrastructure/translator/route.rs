// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! RouteConfiguration (RDS) translation.
//!
//! The insecure listener consumes a single `ingress_http` configuration
//! carrying every cleartext virtual host. Each TLS-terminating virtual host
//! gets its own `https/<fqdn>` configuration, matching the per-SNI filter
//! chains on the secure listener.

use envoy_types::pb::envoy::config::core::v3 as envoy_core;
use envoy_types::pb::envoy::config::route::v3 as envoy_route;
use envoy_types::pb::envoy::r#type::matcher::v3 as envoy_matcher;
use envoy_types::pb::google::protobuf::Any;

use crate::domain::dag::{
    https_route_config, Dag, HeaderMatch, HeaderMatchKind, PathMatch, QueryParamMatch,
    QueryParamMatchKind, Redirect, Route, RouteAction, VirtualHost, HTTP_LISTENER_NAME,
    HTTP_ROUTE_CONFIG,
};
use crate::domain::policy::Timeout;

use super::{any_resource, bool_value, pb_duration, type_urls, u32_value};

/// All route configurations of a DAG as cache entries.
pub fn from_dag(dag: &Dag) -> Vec<(String, Any)> {
    let mut out = Vec::new();

    if let Some(listener) = dag.listener(HTTP_LISTENER_NAME) {
        let config = envoy_route::RouteConfiguration {
            name: HTTP_ROUTE_CONFIG.to_string(),
            virtual_hosts: listener.virtual_hosts.iter().map(virtual_host).collect(),
            ..Default::default()
        };
        out.push((config.name.clone(), any_resource(type_urls::ROUTE, &config)));
    }

    for listener in &dag.listeners {
        for secure in &listener.secure_virtual_hosts {
            if secure.is_passthrough() {
                continue;
            }
            let name = https_route_config(secure.fqdn());
            let config = envoy_route::RouteConfiguration {
                name: name.clone(),
                virtual_hosts: vec![virtual_host(&secure.virtual_host)],
                ..Default::default()
            };
            out.push((name, any_resource(type_urls::ROUTE, &config)));
        }
    }

    out
}

fn virtual_host(vhost: &VirtualHost) -> envoy_route::VirtualHost {
    envoy_route::VirtualHost {
        name: vhost.fqdn.clone(),
        domains: domains(&vhost.fqdn),
        routes: vhost.routes.iter().map(route).collect(),
        ..Default::default()
    }
}

/// The wildcard host matches every domain; a concrete FQDN also matches
/// with an explicit port suffix.
fn domains(fqdn: &str) -> Vec<String> {
    if fqdn == "*" {
        vec!["*".to_string()]
    } else {
        vec![fqdn.to_string(), format!("{fqdn}:*")]
    }
}

fn route(route: &Route) -> envoy_route::Route {
    envoy_route::Route {
        r#match: Some(route_match(route)),
        action: Some(action(route)),
        request_headers_to_add: header_values(&route.request_headers.set),
        request_headers_to_remove: route.request_headers.remove.clone(),
        response_headers_to_add: header_values(&route.response_headers.set),
        response_headers_to_remove: route.response_headers.remove.clone(),
        ..Default::default()
    }
}

fn route_match(route: &Route) -> envoy_route::RouteMatch {
    let path_specifier = Some(match &route.path {
        PathMatch::Prefix(prefix) => {
            envoy_route::route_match::PathSpecifier::Prefix(prefix.clone())
        }
        PathMatch::Exact(path) => envoy_route::route_match::PathSpecifier::Path(path.clone()),
        PathMatch::Regex(regex) => envoy_route::route_match::PathSpecifier::SafeRegex(
            envoy_matcher::RegexMatcher { regex: regex.clone(), ..Default::default() },
        ),
    });

    let mut headers: Vec<envoy_route::HeaderMatcher> =
        route.headers.iter().map(header_matcher).collect();
    if let Some(method) = &route.method {
        headers.push(envoy_route::HeaderMatcher {
            name: ":method".to_string(),
            header_match_specifier: Some(
                envoy_route::header_matcher::HeaderMatchSpecifier::StringMatch(exact_matcher(
                    method,
                )),
            ),
            ..Default::default()
        });
    }

    envoy_route::RouteMatch {
        path_specifier,
        headers,
        query_parameters: route.query_params.iter().map(query_matcher).collect(),
        ..Default::default()
    }
}

fn header_matcher(header: &HeaderMatch) -> envoy_route::HeaderMatcher {
    use envoy_route::header_matcher::HeaderMatchSpecifier;

    let (specifier, invert) = match &header.kind {
        HeaderMatchKind::Present => (HeaderMatchSpecifier::PresentMatch(true), false),
        HeaderMatchKind::NotPresent => (HeaderMatchSpecifier::PresentMatch(true), true),
        HeaderMatchKind::Exact(value) => {
            (HeaderMatchSpecifier::StringMatch(exact_matcher(value)), false)
        }
        HeaderMatchKind::NotExact(value) => {
            (HeaderMatchSpecifier::StringMatch(exact_matcher(value)), true)
        }
        HeaderMatchKind::Contains(value) => {
            (HeaderMatchSpecifier::StringMatch(contains_matcher(value)), false)
        }
        HeaderMatchKind::NotContains(value) => {
            (HeaderMatchSpecifier::StringMatch(contains_matcher(value)), true)
        }
        HeaderMatchKind::Regex(regex) => (
            HeaderMatchSpecifier::StringMatch(envoy_matcher::StringMatcher {
                match_pattern: Some(envoy_matcher::string_matcher::MatchPattern::SafeRegex(
                    envoy_matcher::RegexMatcher { regex: regex.clone(), ..Default::default() },
                )),
                ..Default::default()
            }),
            false,
        ),
    };

    envoy_route::HeaderMatcher {
        name: header.name.clone(),
        invert_match: invert,
        header_match_specifier: Some(specifier),
        ..Default::default()
    }
}

fn query_matcher(param: &QueryParamMatch) -> envoy_route::QueryParameterMatcher {
    use envoy_route::query_parameter_matcher::QueryParameterMatchSpecifier;

    let specifier = match &param.kind {
        QueryParamMatchKind::Exact(value) => {
            QueryParameterMatchSpecifier::StringMatch(exact_matcher(value))
        }
        QueryParamMatchKind::Regex(regex) => {
            QueryParameterMatchSpecifier::StringMatch(envoy_matcher::StringMatcher {
                match_pattern: Some(envoy_matcher::string_matcher::MatchPattern::SafeRegex(
                    envoy_matcher::RegexMatcher { regex: regex.clone(), ..Default::default() },
                )),
                ..Default::default()
            })
        }
    };

    envoy_route::QueryParameterMatcher {
        name: param.name.clone(),
        query_parameter_match_specifier: Some(specifier),
    }
}

fn exact_matcher(value: &str) -> envoy_matcher::StringMatcher {
    envoy_matcher::StringMatcher {
        match_pattern: Some(envoy_matcher::string_matcher::MatchPattern::Exact(
            value.to_string(),
        )),
        ..Default::default()
    }
}

fn contains_matcher(value: &str) -> envoy_matcher::StringMatcher {
    envoy_matcher::StringMatcher {
        match_pattern: Some(envoy_matcher::string_matcher::MatchPattern::Contains(
            value.to_string(),
        )),
        ..Default::default()
    }
}

fn action(route: &Route) -> envoy_route::route::Action {
    match &route.action {
        RouteAction::Forward { clusters, mirror } => {
            let mut forward = envoy_route::RouteAction {
                cluster_specifier: Some(cluster_specifier(clusters)),
                ..Default::default()
            };
            if let Timeout::Duration(timeout) = route.timeouts.response {
                forward.timeout = Some(pb_duration(timeout));
            } else if route.timeouts.response == Timeout::Disabled {
                forward.timeout = Some(pb_duration(std::time::Duration::ZERO));
            }
            if let Timeout::Duration(idle) = route.timeouts.idle {
                forward.idle_timeout = Some(pb_duration(idle));
            }
            if let Some(retry) = &route.retry {
                forward.retry_policy = Some(envoy_route::RetryPolicy {
                    retry_on: retry.retry_on.join(","),
                    num_retries: Some(u32_value(retry.count)),
                    per_try_timeout: retry.per_try_timeout.map(pb_duration),
                    ..Default::default()
                });
            }
            if let Some(prefix) = &route.prefix_rewrite {
                forward.prefix_rewrite = prefix.clone();
            }
            if let Some(mirror) = mirror {
                forward.request_mirror_policies =
                    vec![envoy_route::route_action::RequestMirrorPolicy {
                        cluster: mirror.clone(),
                        ..Default::default()
                    }];
            }
            if route.websocket {
                forward.upgrade_configs = vec![envoy_route::route_action::UpgradeConfig {
                    upgrade_type: "websocket".to_string(),
                    enabled: Some(bool_value(true)),
                    ..Default::default()
                }];
            }
            envoy_route::route::Action::Route(forward)
        }
        RouteAction::Redirect(redirect) => {
            envoy_route::route::Action::Redirect(redirect_action(redirect))
        }
        RouteAction::DirectResponse { status, body } => {
            envoy_route::route::Action::DirectResponse(envoy_route::DirectResponseAction {
                status: *status,
                body: body.as_ref().map(|body| envoy_core::DataSource {
                    specifier: Some(envoy_core::data_source::Specifier::InlineString(
                        body.clone(),
                    )),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    }
}

fn cluster_specifier(
    clusters: &[crate::domain::dag::WeightedCluster],
) -> envoy_route::route_action::ClusterSpecifier {
    if clusters.len() == 1 && clusters[0].weight <= 1 {
        return envoy_route::route_action::ClusterSpecifier::Cluster(clusters[0].name.clone());
    }
    envoy_route::route_action::ClusterSpecifier::WeightedClusters(envoy_route::WeightedCluster {
        clusters: clusters
            .iter()
            .map(|c| envoy_route::weighted_cluster::ClusterWeight {
                name: c.name.clone(),
                weight: Some(u32_value(c.weight.max(1))),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    })
}

fn redirect_action(redirect: &Redirect) -> envoy_route::RedirectAction {
    use envoy_route::redirect_action::RedirectResponseCode;

    let response_code = match redirect.status_code {
        302 => RedirectResponseCode::Found,
        303 => RedirectResponseCode::SeeOther,
        307 => RedirectResponseCode::TemporaryRedirect,
        308 => RedirectResponseCode::PermanentRedirect,
        _ => RedirectResponseCode::MovedPermanently,
    };

    envoy_route::RedirectAction {
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.map(u32::from).unwrap_or_default(),
        response_code: response_code as i32,
        scheme_rewrite_specifier: redirect.scheme.clone().map(
            envoy_route::redirect_action::SchemeRewriteSpecifier::SchemeRedirect,
        ),
        path_rewrite_specifier: redirect
            .path
            .clone()
            .map(envoy_route::redirect_action::PathRewriteSpecifier::PathRedirect),
        ..Default::default()
    }
}

fn header_values(
    set: &std::collections::BTreeMap<String, String>,
) -> Vec<envoy_core::HeaderValueOption> {
    set.iter()
        .map(|(name, value)| envoy_core::HeaderValueOption {
            header: Some(envoy_core::HeaderValue {
                key: name.clone(),
                value: value.clone(),
                ..Default::default()
            }),
            append_action: envoy_core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd
                as i32,
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dag::WeightedCluster;

    #[test]
    fn single_unweighted_backend_uses_plain_cluster() {
        let specifier =
            cluster_specifier(&[WeightedCluster { name: "default/app/http/0a1b2c3d".into(), weight: 1 }]);
        assert!(matches!(
            specifier,
            envoy_route::route_action::ClusterSpecifier::Cluster(_)
        ));
    }

    #[test]
    fn weighted_backends_use_weighted_clusters() {
        let specifier = cluster_specifier(&[
            WeightedCluster { name: "a".into(), weight: 80 },
            WeightedCluster { name: "b".into(), weight: 20 },
        ]);
        match specifier {
            envoy_route::route_action::ClusterSpecifier::WeightedClusters(weighted) => {
                assert_eq!(weighted.clusters.len(), 2);
                assert_eq!(weighted.clusters[0].weight.as_ref().unwrap().value, 80);
            }
            other => panic!("unexpected specifier: {other:?}"),
        }
    }

    #[test]
    fn method_match_becomes_pseudo_header() {
        let mut dag_route = Route::forward(PathMatch::Prefix("/".into()), vec![]);
        dag_route.method = Some("POST".into());
        let translated = route_match(&dag_route);
        assert_eq!(translated.headers.len(), 1);
        assert_eq!(translated.headers[0].name, ":method");
    }
}
