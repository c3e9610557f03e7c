// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Data-plane bootstrap emission.
//!
//! `isthmus bootstrap` writes the initial Envoy configuration: the static
//! cluster pointing back at this controller's xDS endpoint, ADS wiring for
//! every dynamic resource type, and the admin interface. Everything else
//! arrives over the stream.

use std::path::Path;

use serde_json::json;

/// Parameters of the emitted file.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    /// Address the data plane dials for xDS.
    pub xds_address: String,
    pub xds_port: u16,
    /// Admin interface bind.
    pub admin_address: String,
    pub admin_port: u16,
    /// Client certificate material for mutual TLS towards the controller.
    pub tls: Option<BootstrapTls>,
    /// Value for the data plane's requests-per-IO-cycle runtime guard.
    pub max_requests_per_io_cycle: Option<u32>,
    /// Use the incremental (delta) discovery variant.
    pub incremental: bool,
}

#[derive(Debug, Clone)]
pub struct BootstrapTls {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            xds_address: "127.0.0.1".to_string(),
            xds_port: 8001,
            admin_address: "127.0.0.1".to_string(),
            admin_port: 9001,
            tls: None,
            max_requests_per_io_cycle: None,
            incremental: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const XDS_CLUSTER: &str = "isthmus-xds";

/// Render the bootstrap document.
pub fn render(params: &BootstrapParams) -> serde_json::Value {
    let ads_source = json!({
        "api_type": if params.incremental { "DELTA_GRPC" } else { "GRPC" },
        "transport_api_version": "V3",
        "grpc_services": [{ "envoy_grpc": { "cluster_name": XDS_CLUSTER } }],
    });

    let mut xds_cluster = json!({
        "name": XDS_CLUSTER,
        "type": "STRICT_DNS",
        "connect_timeout": "5s",
        "typed_extension_protocol_options": {
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                "explicit_http_config": { "http2_protocol_options": {} }
            }
        },
        "load_assignment": {
            "cluster_name": XDS_CLUSTER,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": {
                        "address": {
                            "socket_address": {
                                "address": params.xds_address,
                                "port_value": params.xds_port,
                            }
                        }
                    }
                }]
            }]
        },
    });

    if let Some(tls) = &params.tls {
        xds_cluster["transport_socket"] = json!({
            "name": "envoy.transport_sockets.tls",
            "typed_config": {
                "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
                "common_tls_context": {
                    "tls_params": { "tls_minimum_protocol_version": "TLSv1_3" },
                    "tls_certificates": [{
                        "certificate_chain": { "filename": tls.cert_file },
                        "private_key": { "filename": tls.key_file },
                    }],
                    "validation_context": {
                        "trusted_ca": { "filename": tls.ca_file },
                    }
                }
            }
        });
    }

    let mut bootstrap = json!({
        "node": {
            "id": "isthmus-envoy",
            "cluster": "isthmus",
        },
        "static_resources": {
            "clusters": [xds_cluster],
        },
        "dynamic_resources": {
            "ads_config": ads_source,
            "lds_config": { "resource_api_version": "V3", "ads": {} },
            "cds_config": { "resource_api_version": "V3", "ads": {} },
        },
        "admin": {
            "address": {
                "socket_address": {
                    "address": params.admin_address,
                    "port_value": params.admin_port,
                }
            }
        },
    });

    if let Some(max_requests) = params.max_requests_per_io_cycle {
        bootstrap["layered_runtime"] = json!({
            "layers": [{
                "name": "static",
                "static_layer": {
                    "http.max_requests_per_io_cycle": max_requests,
                }
            }]
        });
    }

    bootstrap
}

/// Render and write to `path`.
pub fn emit(params: &BootstrapParams, path: &Path) -> Result<(), BootstrapError> {
    let document = serde_json::to_string_pretty(&render(params)).expect("bootstrap serializes");
    std::fs::write(path, document).map_err(|source| BootstrapError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_points_dynamic_resources_at_ads() {
        let rendered = render(&BootstrapParams::default());
        assert_eq!(rendered["dynamic_resources"]["lds_config"]["ads"], json!({}));
        assert_eq!(
            rendered["static_resources"]["clusters"][0]["load_assignment"]["endpoints"][0]
                ["lb_endpoints"][0]["endpoint"]["address"]["socket_address"]["port_value"],
            json!(8001)
        );
    }

    #[test]
    fn tls_material_adds_a_transport_socket() {
        let params = BootstrapParams {
            tls: Some(BootstrapTls {
                cert_file: "/certs/tls.crt".into(),
                key_file: "/certs/tls.key".into(),
                ca_file: "/certs/ca.crt".into(),
            }),
            ..Default::default()
        };
        let rendered = render(&params);
        assert_eq!(
            rendered["static_resources"]["clusters"][0]["transport_socket"]["name"],
            json!("envoy.transport_sockets.tls")
        );
    }

    #[test]
    fn emit_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap.json");
        emit(&BootstrapParams::default(), &path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["admin"].is_object());
    }
}
