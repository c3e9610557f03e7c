// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Listener (LDS) translation.
//!
//! The insecure listener carries one HTTP connection manager for all
//! cleartext virtual hosts. The secure listener carries one filter chain
//! per SNI: terminating chains run an HCM pointed at the per-host route
//! configuration, passthrough chains run a TCP proxy.

use envoy_types::pb::envoy::config::accesslog::v3 as envoy_accesslog;
use envoy_types::pb::envoy::config::core::v3 as envoy_core;
use envoy_types::pb::envoy::config::listener::v3 as envoy_listener;
use envoy_types::pb::envoy::extensions::access_loggers::file::v3 as envoy_file_log;
use envoy_types::pb::envoy::extensions::compression::brotli::compressor::v3 as envoy_brotli;
use envoy_types::pb::envoy::extensions::compression::gzip::compressor::v3 as envoy_gzip;
use envoy_types::pb::envoy::extensions::compression::zstd::compressor::v3 as envoy_zstd;
use envoy_types::pb::envoy::extensions::filters::http::compressor::v3 as envoy_compressor;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3 as envoy_tls_inspector;
use envoy_types::pb::envoy::extensions::filters::network::connection_limit::v3 as envoy_conn_limit;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3 as envoy_hcm;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3 as envoy_tcp;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::tcp_proxy as envoy_tcp_proxy;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as envoy_tls;
use envoy_types::pb::google::protobuf::{Any, UInt64Value};

use crate::domain::config::{AccessLogLevel, CompressionAlgorithm, IsthmusConfig};
use crate::domain::dag::{
    https_route_config, Dag, Listener, SecureVirtualHost, TcpProxy, TlsVersion,
    HTTP_ROUTE_CONFIG,
};

use super::{ads_config_source, any_resource, bool_value, pb_duration, socket_address, type_urls, u32_value};

/// All listeners of a DAG as cache entries. Listeners with no attached
/// virtual hosts are omitted entirely so an idle controller programs an
/// empty data plane.
pub fn from_dag(dag: &Dag, config: &IsthmusConfig) -> Vec<(String, Any)> {
    let mut out = Vec::new();
    for listener in &dag.listeners {
        if listener.virtual_hosts.is_empty()
            && listener.secure_virtual_hosts.is_empty()
            && listener.tcp_proxy.is_none()
        {
            continue;
        }
        let translated = translate(listener, config);
        out.push((translated.name.clone(), any_resource(type_urls::LISTENER, &translated)));
    }
    out
}

fn translate(listener: &Listener, config: &IsthmusConfig) -> envoy_listener::Listener {
    let mut filter_chains = Vec::new();
    let mut listener_filters = Vec::new();

    if !listener.virtual_hosts.is_empty() {
        filter_chains.push(envoy_listener::FilterChain {
            filters: prepend_connection_limit(
                &listener.name,
                config,
                vec![hcm_filter(&listener.name, HTTP_ROUTE_CONFIG, config)],
            ),
            ..Default::default()
        });
    }

    if let Some(tcp) = &listener.tcp_proxy {
        filter_chains.push(envoy_listener::FilterChain {
            filters: prepend_connection_limit(
                &listener.name,
                config,
                vec![tcp_proxy_filter(&listener.name, tcp)],
            ),
            ..Default::default()
        });
    }

    if !listener.secure_virtual_hosts.is_empty() {
        // SNI routing needs the inspector.
        listener_filters.push(envoy_listener::ListenerFilter {
            name: "envoy.filters.listener.tls_inspector".to_string(),
            config_type: Some(envoy_listener::listener_filter::ConfigType::TypedConfig(
                any_resource(
                    type_urls::TLS_INSPECTOR,
                    &envoy_tls_inspector::TlsInspector::default(),
                ),
            )),
            ..Default::default()
        });
        let mut secure: Vec<&SecureVirtualHost> = listener.secure_virtual_hosts.iter().collect();
        secure.sort_by(|a, b| a.fqdn().cmp(b.fqdn()));
        for vhost in secure {
            filter_chains.push(secure_filter_chain(listener, vhost, config));
        }
    }

    envoy_listener::Listener {
        name: listener.name.clone(),
        address: Some(socket_address(&listener.address, listener.port)),
        filter_chains,
        listener_filters,
        ..Default::default()
    }
}

fn secure_filter_chain(
    listener: &Listener,
    vhost: &SecureVirtualHost,
    config: &IsthmusConfig,
) -> envoy_listener::FilterChain {
    let filters = match (&vhost.tcp_proxy, &vhost.secret) {
        // Terminating TLS with HTTP routing.
        (None, Some(_)) => vec![hcm_filter(
            &format!("https/{}", vhost.fqdn()),
            &https_route_config(vhost.fqdn()),
            config,
        )],
        // TCP proxying, terminated or passthrough.
        (Some(tcp), _) => vec![tcp_proxy_filter(vhost.fqdn(), tcp)],
        (None, None) => Vec::new(),
    };

    envoy_listener::FilterChain {
        filter_chain_match: Some(envoy_listener::FilterChainMatch {
            server_names: vec![vhost.fqdn().to_string()],
            transport_protocol: "tls".to_string(),
            ..Default::default()
        }),
        filters: prepend_connection_limit(&listener.name, config, filters),
        transport_socket: vhost.secret.as_ref().map(|secret| downstream_tls(vhost, secret, config)),
        name: vhost.fqdn().to_string(),
        ..Default::default()
    }
}

fn downstream_tls(
    vhost: &SecureVirtualHost,
    secret: &str,
    config: &IsthmusConfig,
) -> envoy_core::TransportSocket {
    let mut common = envoy_tls::CommonTlsContext {
        tls_params: Some(tls_parameters(vhost, config)),
        tls_certificate_sds_secret_configs: vec![envoy_tls::SdsSecretConfig {
            name: secret.to_string(),
            sds_config: Some(ads_config_source()),
        }],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        ..Default::default()
    };
    if let Some(validation) = &vhost.client_validation {
        common.validation_context_type = Some(
            envoy_tls::common_tls_context::ValidationContextType::ValidationContextSdsSecretConfig(
                envoy_tls::SdsSecretConfig {
                    name: validation.ca_secret.clone(),
                    sds_config: Some(ads_config_source()),
                },
            ),
        );
    }

    let context = envoy_tls::DownstreamTlsContext {
        common_tls_context: Some(common),
        require_client_certificate: vhost
            .client_validation
            .as_ref()
            .map(|v| bool_value(!v.optional)),
        ..Default::default()
    };

    envoy_core::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(envoy_core::transport_socket::ConfigType::TypedConfig(
            any_resource(type_urls::DOWNSTREAM_TLS_CONTEXT, &context),
        )),
    }
}

fn tls_parameters(vhost: &SecureVirtualHost, config: &IsthmusConfig) -> envoy_tls::TlsParameters {
    use envoy_tls::tls_parameters::TlsProtocol;

    let version = |v: TlsVersion| match v {
        TlsVersion::V1_2 => TlsProtocol::TlSv12 as i32,
        TlsVersion::V1_3 => TlsProtocol::TlSv13 as i32,
    };

    let cipher_suites = if vhost.cipher_suites.is_empty() {
        config.tls.cipher_suites.clone()
    } else {
        vhost.cipher_suites.clone()
    };

    envoy_tls::TlsParameters {
        tls_minimum_protocol_version: version(vhost.min_tls_version),
        tls_maximum_protocol_version: version(vhost.max_tls_version),
        cipher_suites,
        ..Default::default()
    }
}

fn tcp_proxy_filter(fqdn: &str, tcp: &TcpProxy) -> envoy_listener::Filter {
    let cluster_specifier = if tcp.clusters.len() == 1 {
        envoy_tcp_proxy::ClusterSpecifier::Cluster(tcp.clusters[0].name.clone())
    } else {
        envoy_tcp_proxy::ClusterSpecifier::WeightedClusters(envoy_tcp_proxy::WeightedCluster {
            clusters: tcp
                .clusters
                .iter()
                .map(|c| envoy_tcp_proxy::weighted_cluster::ClusterWeight {
                    name: c.name.clone(),
                    weight: c.weight.max(1),
                    ..Default::default()
                })
                .collect(),
        })
    };

    let proxy = envoy_tcp::TcpProxy {
        stat_prefix: format!("tcp/{fqdn}"),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };

    envoy_listener::Filter {
        name: "envoy.filters.network.tcp_proxy".to_string(),
        config_type: Some(envoy_listener::filter::ConfigType::TypedConfig(any_resource(
            type_urls::TCP_PROXY,
            &proxy,
        ))),
    }
}

fn hcm_filter(stat_prefix: &str, route_config: &str, config: &IsthmusConfig) -> envoy_listener::Filter {
    let mut http_filters = Vec::new();
    if let Some(compressor) = compressor_filter(config) {
        http_filters.push(compressor);
    }
    http_filters.push(envoy_hcm::HttpFilter {
        name: "envoy.filters.http.router".to_string(),
        config_type: Some(envoy_hcm::http_filter::ConfigType::TypedConfig(any_resource(
            type_urls::ROUTER,
            &envoy_types::pb::envoy::extensions::filters::http::router::v3::Router::default(),
        ))),
        ..Default::default()
    });

    let mut hcm = envoy_hcm::HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        codec_type: envoy_hcm::http_connection_manager::CodecType::Auto as i32,
        route_specifier: Some(envoy_hcm::http_connection_manager::RouteSpecifier::Rds(
            envoy_hcm::Rds {
                config_source: Some(ads_config_source()),
                route_config_name: route_config.to_string(),
            },
        )),
        http_filters,
        access_log: access_logs(config),
        ..Default::default()
    };

    if let Some(timeout) = config.timeouts.request_timeout {
        hcm.request_timeout = Some(pb_duration(timeout));
    }
    if let Some(idle) = config.timeouts.stream_idle_timeout {
        hcm.stream_idle_timeout = Some(pb_duration(idle));
    }
    if let Some(idle) = config.timeouts.connection_idle_timeout {
        hcm.common_http_protocol_options = Some(envoy_core::HttpProtocolOptions {
            idle_timeout: Some(pb_duration(idle)),
            ..Default::default()
        });
    }
    if let Some(streams) = config.listener.http2_max_concurrent_streams {
        hcm.http2_protocol_options = Some(envoy_core::Http2ProtocolOptions {
            max_concurrent_streams: Some(u32_value(streams)),
            ..Default::default()
        });
    }

    envoy_listener::Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(envoy_listener::filter::ConfigType::TypedConfig(any_resource(
            type_urls::HTTP_CONNECTION_MANAGER,
            &hcm,
        ))),
    }
}

/// Downstream access logging to stdout, honoring the configured format and
/// level. `disabled` drops the logger entirely.
fn access_logs(config: &IsthmusConfig) -> Vec<envoy_accesslog::AccessLog> {
    if config.accesslog_level == AccessLogLevel::Disabled {
        return Vec::new();
    }

    let mut file_log = envoy_file_log::FileAccessLog {
        path: "/dev/stdout".to_string(),
        ..Default::default()
    };
    if !config.accesslog_json_fields.is_empty() {
        let fields = config
            .accesslog_json_fields
            .iter()
            .map(|field| {
                (
                    field.clone(),
                    envoy_types::pb::google::protobuf::Value {
                        kind: Some(envoy_types::pb::google::protobuf::value::Kind::StringValue(
                            format!("%{}%", field.to_ascii_uppercase()),
                        )),
                    },
                )
            })
            .collect();
        file_log.access_log_format = Some(
            envoy_file_log::file_access_log::AccessLogFormat::LogFormat(
                envoy_core::SubstitutionFormatString {
                    format: Some(envoy_core::substitution_format_string::Format::JsonFormat(
                        envoy_types::pb::google::protobuf::Struct { fields },
                    )),
                    ..Default::default()
                },
            ),
        );
    } else if let Some(format) = &config.accesslog_format {
        file_log.access_log_format = Some(
            envoy_file_log::file_access_log::AccessLogFormat::LogFormat(
                envoy_core::SubstitutionFormatString {
                    format: Some(
                        envoy_core::substitution_format_string::Format::TextFormatSource(
                            envoy_core::DataSource {
                                specifier: Some(envoy_core::data_source::Specifier::InlineString(
                                    format.clone(),
                                )),
                                ..Default::default()
                            },
                        ),
                    ),
                    ..Default::default()
                },
            ),
        );
    }

    vec![envoy_accesslog::AccessLog {
        name: "envoy.access_loggers.file".to_string(),
        config_type: Some(envoy_accesslog::access_log::ConfigType::TypedConfig(any_resource(
            type_urls::FILE_ACCESS_LOG,
            &file_log,
        ))),
        ..Default::default()
    }]
}

fn compressor_filter(config: &IsthmusConfig) -> Option<envoy_hcm::HttpFilter> {
    let library = match config.compression.algorithm {
        CompressionAlgorithm::Disabled => return None,
        CompressionAlgorithm::Gzip => envoy_core::TypedExtensionConfig {
            name: "gzip".to_string(),
            typed_config: Some(any_resource(
                type_urls::GZIP_COMPRESSOR,
                &envoy_gzip::Gzip::default(),
            )),
        },
        CompressionAlgorithm::Brotli => envoy_core::TypedExtensionConfig {
            name: "brotli".to_string(),
            typed_config: Some(any_resource(
                type_urls::BROTLI_COMPRESSOR,
                &envoy_brotli::Brotli::default(),
            )),
        },
        CompressionAlgorithm::Zstd => envoy_core::TypedExtensionConfig {
            name: "zstd".to_string(),
            typed_config: Some(any_resource(
                type_urls::ZSTD_COMPRESSOR,
                &envoy_zstd::Zstd::default(),
            )),
        },
    };

    let compressor = envoy_compressor::Compressor {
        compressor_library: Some(library),
        ..Default::default()
    };

    Some(envoy_hcm::HttpFilter {
        name: "envoy.filters.http.compressor".to_string(),
        config_type: Some(envoy_hcm::http_filter::ConfigType::TypedConfig(any_resource(
            type_urls::COMPRESSOR,
            &compressor,
        ))),
        ..Default::default()
    })
}

/// When configured, cap connections per listener with a connection-limit
/// filter ahead of the protocol filters.
fn prepend_connection_limit(
    listener_name: &str,
    config: &IsthmusConfig,
    filters: Vec<envoy_listener::Filter>,
) -> Vec<envoy_listener::Filter> {
    let Some(max) = config.listener.max_connections_per_listener else {
        return filters;
    };
    let limit = envoy_conn_limit::ConnectionLimit {
        stat_prefix: listener_name.to_string(),
        max_connections: Some(UInt64Value { value: u64::from(max) }),
        ..Default::default()
    };
    let mut out = vec![envoy_listener::Filter {
        name: "envoy.filters.network.connection_limit".to_string(),
        config_type: Some(envoy_listener::filter::ConfigType::TypedConfig(any_resource(
            type_urls::CONNECTION_LIMIT,
            &limit,
        ))),
    }];
    out.extend(filters);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dag::{VirtualHost, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME};
    use prost::Message;

    fn dag_with_vhosts() -> Dag {
        let mut insecure = Listener::new(HTTP_LISTENER_NAME, "0.0.0.0", 8080);
        insecure.virtual_hosts.push(VirtualHost::new("app.example.com"));
        let mut secure = Listener::new(HTTPS_LISTENER_NAME, "0.0.0.0", 8443);
        secure.secure_virtual_hosts.push(SecureVirtualHost {
            virtual_host: VirtualHost::new("tls.example.com"),
            secret: Some("certs/web".into()),
            min_tls_version: TlsVersion::V1_2,
            max_tls_version: TlsVersion::V1_3,
            cipher_suites: Vec::new(),
            client_validation: None,
            tcp_proxy: None,
        });
        Dag { listeners: vec![insecure, secure], ..Default::default() }
    }

    #[test]
    fn empty_listeners_are_not_emitted() {
        let dag = Dag {
            listeners: vec![Listener::new(HTTP_LISTENER_NAME, "0.0.0.0", 8080)],
            ..Default::default()
        };
        assert!(from_dag(&dag, &IsthmusConfig::default()).is_empty());
    }

    #[test]
    fn secure_listener_carries_sni_filter_chain() {
        let resources = from_dag(&dag_with_vhosts(), &IsthmusConfig::default());
        let (_, packed) = resources
            .iter()
            .find(|(name, _)| name == HTTPS_LISTENER_NAME)
            .expect("https listener");
        let listener = envoy_listener::Listener::decode(packed.value.as_slice()).unwrap();
        assert_eq!(listener.listener_filters.len(), 1);
        let chain = &listener.filter_chains[0];
        assert_eq!(
            chain.filter_chain_match.as_ref().unwrap().server_names,
            vec!["tls.example.com".to_string()]
        );
        assert!(chain.transport_socket.is_some());
    }

    #[test]
    fn insecure_listener_uses_shared_route_config() {
        let resources = from_dag(&dag_with_vhosts(), &IsthmusConfig::default());
        let (_, packed) = resources
            .iter()
            .find(|(name, _)| name == HTTP_LISTENER_NAME)
            .expect("http listener");
        let listener = envoy_listener::Listener::decode(packed.value.as_slice()).unwrap();
        let filter = &listener.filter_chains[0].filters[0];
        let Some(envoy_listener::filter::ConfigType::TypedConfig(any)) = &filter.config_type
        else {
            panic!("expected typed config");
        };
        let hcm = envoy_hcm::HttpConnectionManager::decode(any.value.as_slice()).unwrap();
        match hcm.route_specifier.unwrap() {
            envoy_hcm::http_connection_manager::RouteSpecifier::Rds(rds) => {
                assert_eq!(rds.route_config_name, HTTP_ROUTE_CONFIG);
            }
            other => panic!("unexpected route specifier: {other:?}"),
        }
    }
}
