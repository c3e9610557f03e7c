// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Translation from the routing DAG into Envoy v3 discovery resources.
//!
//! This layer is the schema collaborator: the DAG knows nothing about the
//! wire format, and nothing outside this module constructs an Envoy
//! protobuf. A future schema revision gets a sibling module, not a DAG
//! change.

pub mod cluster;
pub mod endpoint;
pub mod listener;
pub mod route;
pub mod secret;

use envoy_types::pb::envoy::config::core::v3 as envoy_core;
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration as PbDuration, UInt32Value};
use prost::Message;

/// Resource type URLs served by the discovery endpoint.
pub mod type_urls {
    pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub const CLUSTER_LOAD_ASSIGNMENT: &str =
        "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
    pub const SECRET: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

    pub const HTTP_CONNECTION_MANAGER: &str =
        "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
    pub const ROUTER: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
    pub const TCP_PROXY: &str =
        "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
    pub const TLS_INSPECTOR: &str =
        "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
    pub const DOWNSTREAM_TLS_CONTEXT: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
    pub const UPSTREAM_TLS_CONTEXT: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
    pub const HTTP_PROTOCOL_OPTIONS: &str =
        "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
    pub const FILE_ACCESS_LOG: &str =
        "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";
    pub const CONNECTION_LIMIT: &str =
        "type.googleapis.com/envoy.extensions.filters.network.connection_limit.v3.ConnectionLimit";
    pub const COMPRESSOR: &str =
        "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.Compressor";
    pub const GZIP_COMPRESSOR: &str =
        "type.googleapis.com/envoy.extensions.compression.gzip.compressor.v3.Gzip";
    pub const BROTLI_COMPRESSOR: &str =
        "type.googleapis.com/envoy.extensions.compression.brotli.compressor.v3.Brotli";
    pub const ZSTD_COMPRESSOR: &str =
        "type.googleapis.com/envoy.extensions.compression.zstd.compressor.v3.Zstd";
}

/// Pack a message into `Any` under the given type URL.
pub fn any_resource<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

pub fn u32_value(value: u32) -> UInt32Value {
    UInt32Value { value }
}

pub fn bool_value(value: bool) -> BoolValue {
    BoolValue { value }
}

pub fn pb_duration(duration: std::time::Duration) -> PbDuration {
    PbDuration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

/// A socket address with a fixed port.
pub fn socket_address(address: &str, port: u16) -> envoy_core::Address {
    envoy_core::Address {
        address: Some(envoy_core::address::Address::SocketAddress(
            envoy_core::SocketAddress {
                address: address.to_string(),
                port_specifier: Some(envoy_core::socket_address::PortSpecifier::PortValue(
                    u32::from(port),
                )),
                ..Default::default()
            },
        )),
    }
}

/// The ADS config source every dynamic reference points at.
pub fn ads_config_source() -> envoy_core::ConfigSource {
    envoy_core::ConfigSource {
        resource_api_version: envoy_core::ApiVersion::V3 as i32,
        config_source_specifier: Some(envoy_core::config_source::ConfigSourceSpecifier::Ads(
            envoy_core::AggregatedConfigSource::default(),
        )),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_resource_round_trips() {
        let source = envoy_core::DataSource {
            specifier: Some(envoy_core::data_source::Specifier::InlineString("x".into())),
            ..Default::default()
        };
        let packed = any_resource("type.googleapis.com/envoy.config.core.v3.DataSource", &source);
        let decoded = envoy_core::DataSource::decode(packed.value.as_slice()).unwrap();
        assert_eq!(decoded, source);
    }
}
