// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Cluster (CDS) translation.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::cluster::v3 as envoy_cluster;
use envoy_types::pb::envoy::config::core::v3 as envoy_core;
use envoy_types::pb::envoy::config::endpoint::v3 as envoy_endpoint;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as envoy_tls;
use envoy_types::pb::envoy::extensions::upstreams::http::v3 as envoy_upstream_http;
use envoy_types::pb::google::protobuf::Any;

use crate::domain::config::IsthmusConfig;
use crate::domain::dag::{Cluster, Dag};
use crate::domain::policy::{DnsLookupFamily, LbStrategy, UpstreamProtocol};

use super::{any_resource, ads_config_source, pb_duration, type_urls, u32_value};

/// All clusters of a DAG as named, serialized cache entries.
pub fn from_dag(dag: &Dag, config: &IsthmusConfig) -> Vec<(String, Any)> {
    dag.clusters
        .values()
        .map(|cluster| {
            let resource = translate(cluster, config);
            (cluster.name.clone(), any_resource(type_urls::CLUSTER, &resource))
        })
        .collect()
}

fn translate(cluster: &Cluster, config: &IsthmusConfig) -> envoy_cluster::Cluster {
    let mut out = envoy_cluster::Cluster {
        name: cluster.name.clone(),
        lb_policy: lb_policy(cluster.lb_strategy) as i32,
        connect_timeout: cluster
            .connect_timeout
            .or(config.timeouts.connect_timeout)
            .map(pb_duration),
        ..Default::default()
    };

    match &cluster.external_name {
        // External-name services resolve via DNS; everything else is EDS.
        Some(external_name) => {
            out.cluster_discovery_type = Some(envoy_cluster::cluster::ClusterDiscoveryType::Type(
                envoy_cluster::cluster::DiscoveryType::LogicalDns as i32,
            ));
            out.dns_lookup_family = dns_lookup_family(cluster.dns_lookup_family) as i32;
            out.load_assignment = Some(logical_dns_assignment(
                &cluster.name,
                external_name,
                cluster.external_port,
            ));
        }
        None => {
            out.cluster_discovery_type = Some(envoy_cluster::cluster::ClusterDiscoveryType::Type(
                envoy_cluster::cluster::DiscoveryType::Eds as i32,
            ));
            out.eds_cluster_config = Some(envoy_cluster::cluster::EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                service_name: cluster.eds_name.clone(),
            });
        }
    }

    if let Some(thresholds) = circuit_breakers(cluster) {
        out.circuit_breakers = Some(thresholds);
    }

    if let Some(health) = &cluster.health_check {
        out.health_checks = vec![envoy_core::HealthCheck {
            timeout: Some(pb_duration(health.timeout)),
            interval: Some(pb_duration(health.interval)),
            unhealthy_threshold: Some(u32_value(health.unhealthy_threshold)),
            healthy_threshold: Some(u32_value(health.healthy_threshold)),
            health_checker: Some(envoy_core::health_check::HealthChecker::HttpHealthCheck(
                envoy_core::health_check::HttpHealthCheck {
                    host: health.host.clone().unwrap_or_default(),
                    path: health.path.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }];
    }

    if let Some(options) = protocol_options(cluster) {
        out.typed_extension_protocol_options = HashMap::from([(
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
            options,
        )]);
    }

    if let Some(socket) = upstream_tls(cluster) {
        out.transport_socket = Some(socket);
    }

    out
}

fn lb_policy(strategy: LbStrategy) -> envoy_cluster::cluster::LbPolicy {
    match strategy {
        LbStrategy::RoundRobin => envoy_cluster::cluster::LbPolicy::RoundRobin,
        LbStrategy::WeightedLeastRequest => envoy_cluster::cluster::LbPolicy::LeastRequest,
        LbStrategy::Random => envoy_cluster::cluster::LbPolicy::Random,
        // Both hash strategies ride the ring hash; the hash source (header
        // vs. cookie) is a route-level concern.
        LbStrategy::RequestHash | LbStrategy::Cookie => envoy_cluster::cluster::LbPolicy::RingHash,
    }
}

fn dns_lookup_family(family: DnsLookupFamily) -> envoy_cluster::cluster::DnsLookupFamily {
    match family {
        DnsLookupFamily::Auto => envoy_cluster::cluster::DnsLookupFamily::Auto,
        DnsLookupFamily::V4 => envoy_cluster::cluster::DnsLookupFamily::V4Only,
        DnsLookupFamily::V6 => envoy_cluster::cluster::DnsLookupFamily::V6Only,
        DnsLookupFamily::All => envoy_cluster::cluster::DnsLookupFamily::All,
    }
}

fn circuit_breakers(cluster: &Cluster) -> Option<envoy_cluster::CircuitBreakers> {
    let policy = &cluster.circuit_breakers;
    if policy.is_unset() {
        return None;
    }
    let thresholds = envoy_cluster::circuit_breakers::Thresholds {
        max_connections: policy.max_connections.map(u32_value),
        max_pending_requests: policy.max_pending_requests.map(u32_value),
        max_requests: policy.max_requests.map(u32_value),
        max_retries: policy.max_retries.map(u32_value),
        ..Default::default()
    };
    let per_host = policy.per_host_max_connections.map(|max| {
        envoy_cluster::circuit_breakers::Thresholds {
            max_connections: Some(u32_value(max)),
            ..Default::default()
        }
    });
    Some(envoy_cluster::CircuitBreakers {
        thresholds: vec![thresholds],
        per_host_thresholds: per_host.into_iter().collect(),
    })
}

/// HTTP protocol options: explicit h2/h2c upstream selection and the
/// max-requests-per-connection cap.
fn protocol_options(cluster: &Cluster) -> Option<Any> {
    use envoy_upstream_http::http_protocol_options::explicit_http_config::ProtocolConfig;
    use envoy_upstream_http::http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions};

    let wants_http2 = matches!(
        cluster.protocol,
        Some(UpstreamProtocol::H2) | Some(UpstreamProtocol::H2c)
    );
    if !wants_http2 && cluster.max_requests_per_connection.is_none() {
        return None;
    }

    let mut options = envoy_upstream_http::HttpProtocolOptions::default();
    if let Some(max) = cluster.max_requests_per_connection {
        options.common_http_protocol_options = Some(envoy_core::HttpProtocolOptions {
            max_requests_per_connection: Some(u32_value(max)),
            ..Default::default()
        });
    }
    if wants_http2 {
        options.upstream_protocol_options =
            Some(UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    envoy_core::Http2ProtocolOptions::default(),
                )),
            }));
    }
    Some(any_resource(type_urls::HTTP_PROTOCOL_OPTIONS, &options))
}

/// Upstream TLS for `tls`/`h2` protocol hints and validated upstreams.
fn upstream_tls(cluster: &Cluster) -> Option<envoy_core::TransportSocket> {
    let wants_tls = matches!(
        cluster.protocol,
        Some(UpstreamProtocol::Tls) | Some(UpstreamProtocol::H2)
    );
    if !wants_tls {
        return None;
    }

    let mut common = envoy_tls::CommonTlsContext::default();
    if matches!(cluster.protocol, Some(UpstreamProtocol::H2)) {
        common.alpn_protocols = vec!["h2".to_string()];
    }
    if let Some(validation) = &cluster.upstream_validation {
        common.validation_context_type = Some(
            envoy_tls::common_tls_context::ValidationContextType::ValidationContextSdsSecretConfig(
                envoy_tls::SdsSecretConfig {
                    name: validation.ca_secret.clone(),
                    sds_config: Some(ads_config_source()),
                },
            ),
        );
    }

    let context = envoy_tls::UpstreamTlsContext {
        common_tls_context: Some(common),
        sni: cluster
            .sni
            .clone()
            .or_else(|| {
                cluster
                    .upstream_validation
                    .as_ref()
                    .map(|v| v.subject_name.clone())
            })
            .unwrap_or_default(),
        ..Default::default()
    };

    Some(envoy_core::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(envoy_core::transport_socket::ConfigType::TypedConfig(
            any_resource(type_urls::UPSTREAM_TLS_CONTEXT, &context),
        )),
    })
}

fn logical_dns_assignment(
    cluster_name: &str,
    hostname: &str,
    port: u16,
) -> envoy_endpoint::ClusterLoadAssignment {
    envoy_endpoint::ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![envoy_endpoint::LocalityLbEndpoints {
            lb_endpoints: vec![envoy_endpoint::LbEndpoint {
                host_identifier: Some(envoy_endpoint::lb_endpoint::HostIdentifier::Endpoint(
                    envoy_endpoint::Endpoint {
                        address: Some(super::socket_address(hostname, port)),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}
