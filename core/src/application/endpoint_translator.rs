// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The endpoint translator.
//!
//! Endpoint churn is the highest-frequency event class in any real cluster,
//! so it bypasses the DAG entirely: events land here, are folded into
//! per-service address sets, and rewrite the LoadAssignment cache directly.
//! Assignment names use the same `namespace/service/port` scheme the
//! builder writes into EDS cluster references, so an assignment published
//! before its cluster (or after the cluster is gone) is simply inert on the
//! data plane.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use envoy_types::pb::google::protobuf::Any;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::kubernetes::FullName;
use crate::domain::policy::health_check_port_from_annotations;
use crate::infrastructure::cache::CacheSet;
use crate::infrastructure::informers::InformerEvent;
use crate::infrastructure::object_store::Object;
use crate::infrastructure::translator::endpoint::{cluster_load_assignment, EndpointAddress};

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Owns the LoadAssignment cache. Fed by the informer dispatcher with
/// Endpoints, EndpointSlice and Service events.
pub struct EndpointTranslator {
    caches: Arc<CacheSet>,
    endpoints: HashMap<FullName, Arc<Endpoints>>,
    slices: HashMap<FullName, Arc<EndpointSlice>>,
    health_ports: HashMap<FullName, u16>,
    external_name_services: BTreeSet<FullName>,
}

impl EndpointTranslator {
    pub fn new(caches: Arc<CacheSet>) -> Self {
        Self {
            caches,
            endpoints: HashMap::new(),
            slices: HashMap::new(),
            health_ports: HashMap::new(),
            external_name_services: BTreeSet::new(),
        }
    }

    /// Drive the translator until the channel closes or cancellation.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<InformerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.apply(&event) {
                let version = self.caches.load_assignment.update(self.assignments());
                debug!(version, "load assignments refreshed");
            }
        }
        info!("endpoint translator stopped");
    }

    /// Fold one event in. Returns whether the assignment set may have
    /// changed.
    pub fn apply(&mut self, event: &InformerEvent) -> bool {
        match event {
            InformerEvent::Upserted(Object::Endpoints(endpoints)) => {
                let name = object_name(endpoints.metadata.namespace.as_deref(), &endpoints.metadata.name);
                self.endpoints.insert(name, endpoints.clone());
                true
            }
            InformerEvent::Deleted(Object::Endpoints(endpoints)) => {
                let name = object_name(endpoints.metadata.namespace.as_deref(), &endpoints.metadata.name);
                self.endpoints.remove(&name).is_some()
            }
            InformerEvent::Upserted(Object::EndpointSlice(slice)) => {
                let name = object_name(slice.metadata.namespace.as_deref(), &slice.metadata.name);
                self.slices.insert(name, slice.clone());
                true
            }
            InformerEvent::Deleted(Object::EndpointSlice(slice)) => {
                let name = object_name(slice.metadata.namespace.as_deref(), &slice.metadata.name);
                self.slices.remove(&name).is_some()
            }
            InformerEvent::Upserted(Object::Service(service)) => self.apply_service(service),
            InformerEvent::Deleted(Object::Service(service)) => {
                let name = object_name(service.metadata.namespace.as_deref(), &service.metadata.name);
                let had_port = self.health_ports.remove(&name).is_some();
                let was_external = self.external_name_services.remove(&name);
                had_port || was_external
            }
            _ => false,
        }
    }

    fn apply_service(&mut self, service: &Arc<Service>) -> bool {
        let name = object_name(service.metadata.namespace.as_deref(), &service.metadata.name);
        let annotations = service.metadata.annotations.clone().unwrap_or_default();
        let (port, _notes) = health_check_port_from_annotations(&annotations);

        let mut changed = false;
        match port {
            Some(port) => changed |= self.health_ports.insert(name.clone(), port) != Some(port),
            None => changed |= self.health_ports.remove(&name).is_some(),
        }

        // External-name services have no endpoint objects; their DNS
        // target lives in the cluster itself, so no assignment is
        // published for them.
        let is_external = service
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            == Some("ExternalName");
        if is_external {
            changed |= self.external_name_services.insert(name);
        } else {
            changed |= self.external_name_services.remove(&name);
        }
        changed
    }

    /// The complete current assignment set, deterministically ordered.
    pub fn assignments(&self) -> Vec<(String, Any)> {
        // assignment name -> sorted unique addresses
        let mut sets: BTreeMap<(FullName, String), BTreeSet<EndpointAddress>> = BTreeMap::new();

        for (name, endpoints) in &self.endpoints {
            if self.external_name_services.contains(name) {
                continue;
            }
            for subset in endpoints.subsets.iter().flatten() {
                let addresses: Vec<&str> = subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|a| a.ip.as_str())
                    .collect();
                for port in subset.ports.iter().flatten() {
                    let port_id = port
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| port.port.to_string());
                    let entry = sets.entry((name.clone(), port_id)).or_default();
                    for ip in &addresses {
                        entry.insert(EndpointAddress {
                            ip: ip.to_string(),
                            port: port.port as u16,
                        });
                    }
                }
            }
        }

        for slice in self.slices.values() {
            let namespace = slice.metadata.namespace.clone().unwrap_or_default();
            let Some(service) = slice
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(SERVICE_NAME_LABEL))
            else {
                continue;
            };
            let service_name = FullName::new(&namespace, service);
            if self.external_name_services.contains(&service_name) {
                continue;
            }
            for port in slice.ports.iter().flatten() {
                let Some(port_number) = port.port else { continue };
                let port_id = port
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| port_number.to_string());
                let entry = sets
                    .entry((service_name.clone(), port_id))
                    .or_default();
                for endpoint in &slice.endpoints {
                    let ready = endpoint
                        .conditions
                        .as_ref()
                        .and_then(|c| c.ready)
                        .unwrap_or(true);
                    if !ready {
                        continue;
                    }
                    for address in &endpoint.addresses {
                        entry.insert(EndpointAddress {
                            ip: address.clone(),
                            port: port_number as u16,
                        });
                    }
                }
            }
        }

        sets.into_iter()
            .map(|((service, port_id), addresses)| {
                let assignment_name = format!("{}/{}/{}", service.namespace, service.name, port_id);
                let addresses: Vec<EndpointAddress> = addresses.into_iter().collect();
                let health_port = self.health_ports.get(&service).copied();
                cluster_load_assignment(&assignment_name, &addresses, health_port)
            })
            .collect()
    }
}

fn object_name(namespace: Option<&str>, name: &Option<String>) -> FullName {
    FullName::new(
        namespace.unwrap_or("default"),
        name.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress as CoreAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use prost::Message;

    fn endpoints(namespace: &str, name: &str, ports: &[(Option<&str>, i32)], ips: &[&str]) -> Arc<Endpoints> {
        Arc::new(Endpoints {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| CoreAddress { ip: ip.to_string(), ..Default::default() })
                        .collect(),
                ),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port)| EndpointPort {
                            name: name.map(str::to_string),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        })
    }

    fn translator() -> EndpointTranslator {
        EndpointTranslator::new(Arc::new(CacheSet::new()))
    }

    #[test]
    fn named_port_uses_port_name_in_assignment() {
        let mut translator = translator();
        translator.apply(&InformerEvent::Upserted(Object::Endpoints(endpoints(
            "default",
            "kuard",
            &[(Some("http"), 8080)],
            &["10.0.0.1"],
        ))));
        let assignments = translator.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].0, "default/kuard/http");
    }

    #[test]
    fn unnamed_port_uses_port_number() {
        let mut translator = translator();
        translator.apply(&InformerEvent::Upserted(Object::Endpoints(endpoints(
            "default",
            "kuard",
            &[(None, 8080)],
            &["10.0.0.1"],
        ))));
        let assignments = translator.assignments();
        assert_eq!(assignments[0].0, "default/kuard/8080");
    }

    #[test]
    fn addresses_are_deduplicated_and_sorted() {
        let mut translator = translator();
        translator.apply(&InformerEvent::Upserted(Object::Endpoints(endpoints(
            "default",
            "kuard",
            &[(Some("http"), 8080)],
            &["10.0.0.9", "10.0.0.1", "10.0.0.9"],
        ))));
        let assignments = translator.assignments();
        let decoded =
            envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment::decode(
                assignments[0].1.value.as_slice(),
            )
            .unwrap();
        let ips: Vec<String> = decoded.endpoints[0]
            .lb_endpoints
            .iter()
            .map(|e| match &e.host_identifier {
                Some(
                    envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier::Endpoint(
                        endpoint,
                    ),
                ) => match &endpoint.address.as_ref().unwrap().address {
                    Some(
                        envoy_types::pb::envoy::config::core::v3::address::Address::SocketAddress(
                            socket,
                        ),
                    ) => socket.address.clone(),
                    other => panic!("unexpected address {other:?}"),
                },
                other => panic!("unexpected identifier {other:?}"),
            })
            .collect();
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.9".to_string()]);
    }

    #[test]
    fn deleting_endpoints_removes_the_assignment() {
        let mut translator = translator();
        let object = endpoints("default", "kuard", &[(Some("http"), 8080)], &["10.0.0.1"]);
        translator.apply(&InformerEvent::Upserted(Object::Endpoints(object.clone())));
        assert_eq!(translator.assignments().len(), 1);
        translator.apply(&InformerEvent::Deleted(Object::Endpoints(object)));
        assert!(translator.assignments().is_empty());
    }
}
