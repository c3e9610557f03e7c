// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! ClusterLoadAssignment (EDS) translation.

use envoy_types::pb::envoy::config::endpoint::v3 as envoy_endpoint;
use envoy_types::pb::google::protobuf::Any;

use super::{any_resource, socket_address, type_urls};

/// One ready backend address for a service port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddress {
    pub ip: String,
    pub port: u16,
}

/// Serialize a load assignment. `addresses` must already be deduplicated
/// and sorted by (IP, port) so repeated translations of the same endpoint
/// set are byte-identical.
pub fn cluster_load_assignment(
    name: &str,
    addresses: &[EndpointAddress],
    health_check_port: Option<u16>,
) -> (String, Any) {
    let lb_endpoints = addresses
        .iter()
        .map(|address| envoy_endpoint::LbEndpoint {
            host_identifier: Some(envoy_endpoint::lb_endpoint::HostIdentifier::Endpoint(
                envoy_endpoint::Endpoint {
                    address: Some(socket_address(&address.ip, address.port)),
                    health_check_config: health_check_port.map(|port| {
                        envoy_endpoint::endpoint::HealthCheckConfig {
                            port_value: u32::from(port),
                            ..Default::default()
                        }
                    }),
                    ..Default::default()
                },
            )),
            ..Default::default()
        })
        .collect();

    let assignment = envoy_endpoint::ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: vec![envoy_endpoint::LocalityLbEndpoints {
            lb_endpoints,
            ..Default::default()
        }],
        ..Default::default()
    };

    (
        name.to_string(),
        any_resource(type_urls::CLUSTER_LOAD_ASSIGNMENT, &assignment),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn translation_is_deterministic_for_equal_inputs() {
        let addresses = vec![
            EndpointAddress { ip: "10.0.0.1".into(), port: 8080 },
            EndpointAddress { ip: "10.0.0.2".into(), port: 8080 },
        ];
        let (_, a) = cluster_load_assignment("default/kuard/http", &addresses, None);
        let (_, b) = cluster_load_assignment("default/kuard/http", &addresses, None);
        assert_eq!(a, b);
    }

    #[test]
    fn health_check_port_overrides_serving_port() {
        let addresses = vec![EndpointAddress { ip: "10.0.0.1".into(), port: 8080 }];
        let (_, packed) = cluster_load_assignment("default/kuard/http", &addresses, Some(9090));
        let assignment =
            envoy_endpoint::ClusterLoadAssignment::decode(packed.value.as_slice()).unwrap();
        let endpoint = match &assignment.endpoints[0].lb_endpoints[0].host_identifier {
            Some(envoy_endpoint::lb_endpoint::HostIdentifier::Endpoint(e)) => e,
            other => panic!("unexpected host identifier: {other:?}"),
        };
        assert_eq!(endpoint.health_check_config.as_ref().unwrap().port_value, 9090);
    }
}
