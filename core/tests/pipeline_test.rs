// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end pipeline scenarios: object store → builder → translation →
//! caches, asserting cluster lifecycle and version stability.

mod common;

use std::sync::Arc;

use isthmus_core::application::builder::DagBuilder;
use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::domain::httpproxy::{HTTPProxy, HTTPProxySpec, VirtualHostSpec};
use isthmus_core::domain::kubernetes::FullName;
use isthmus_core::infrastructure::cache::CacheSet;
use isthmus_core::infrastructure::object_store::{Object, ObjectStore};
use isthmus_core::infrastructure::translator;

use common::*;

struct Pipeline {
    store: ObjectStore,
    builder: DagBuilder,
    config: Arc<IsthmusConfig>,
    caches: CacheSet,
}

impl Pipeline {
    fn new() -> Self {
        let config = Arc::new(IsthmusConfig::default());
        Self {
            store: ObjectStore::new(Vec::new(), Vec::new()),
            builder: DagBuilder::new(config.clone()),
            config,
            caches: CacheSet::new(),
        }
    }

    /// Insert and rebuild, the way the event handler would.
    fn apply(&mut self, object: Object) -> bool {
        let material = self.store.insert(object);
        self.rebuild();
        material
    }

    fn rebuild(&mut self) {
        let snapshot = self.store.snapshot();
        let result = self.builder.build(&snapshot);
        self.caches
            .listener
            .update(translator::listener::from_dag(&result.dag, &self.config));
        self.caches.route.update(translator::route::from_dag(&result.dag));
        self.caches
            .cluster
            .update(translator::cluster::from_dag(&result.dag, &self.config));
        self.caches.secret.update(translator::secret::from_dag(&result.dag));
    }

    fn cluster_names(&self) -> Vec<String> {
        self.caches
            .cluster
            .entries(&[])
            .into_iter()
            .map(|e| e.name)
            .collect()
    }
}

fn two_port_root() -> Arc<HTTPProxy> {
    let mut spec = HTTPProxySpec {
        virtualhost: Some(VirtualHostSpec {
            fqdn: "kuard.example.com".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut http = route_to("kuard", 80);
    http.conditions = vec![prefix_condition("/")];
    let mut https = route_to("kuard", 443);
    https.conditions = vec![prefix_condition("/secure")];
    spec.routes = vec![http, https];
    proxy("default", "kuard", 10, spec)
}

#[test]
fn cluster_rename_and_port_reshape() {
    let mut pipeline = Pipeline::new();
    pipeline.apply(Object::HttpProxy(two_port_root()));

    // Unnamed port 80: the cluster is keyed by port number.
    pipeline.apply(Object::Service(service("default", "kuard", &[(None, 80, 8080)])));
    let names = pipeline.cluster_names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("default/kuard/80/"), "got {names:?}");

    // Naming the port renames the cluster; no stale entry survives.
    pipeline.apply(Object::Service(service("default", "kuard", &[(Some("http"), 80, 8080)])));
    let names = pipeline.cluster_names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("default/kuard/http/"), "got {names:?}");

    // A second port adds a second cluster.
    pipeline.apply(Object::Service(service(
        "default",
        "kuard",
        &[(Some("http"), 80, 8080), (Some("https"), 443, 8443)],
    )));
    let names = pipeline.cluster_names();
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|n| n.starts_with("default/kuard/http/")));
    assert!(names.iter().any(|n| n.starts_with("default/kuard/https/")));

    // Removing the HTTP port prunes its route and cluster.
    pipeline.apply(Object::Service(service("default", "kuard", &[(Some("https"), 443, 8443)])));
    let names = pipeline.cluster_names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("default/kuard/https/"), "got {names:?}");
}

#[test]
fn circuit_breaker_annotations_flow_into_clusters() {
    use envoy_types::pb::envoy::config::cluster::v3::Cluster as EnvoyCluster;
    use prost::Message;

    let mut pipeline = Pipeline::new();
    let mut root = route_to("kuard", 80);
    root.conditions = vec![prefix_condition("/")];
    pipeline.apply(Object::HttpProxy(proxy("default", "kuard", 10, HTTPProxySpec {
        virtualhost: Some(VirtualHostSpec {
            fqdn: "kuard.example.com".to_string(),
            ..Default::default()
        }),
        routes: vec![root],
        ..Default::default()
    })));

    pipeline.apply(Object::Service(service_with_annotations(
        "default",
        "kuard",
        &[(None, 80, 8080)],
        &[
            ("isthmus.dev/max-connections", "9000"),
            ("isthmus.dev/max-pending-requests", "4096"),
            ("isthmus.dev/max-requests", "404"),
            ("isthmus.dev/max-retries", "7"),
        ],
    )));
    let entries = pipeline.caches.cluster.entries(&[]);
    let cluster = EnvoyCluster::decode(entries[0].body.value.as_slice()).unwrap();
    let thresholds = &cluster.circuit_breakers.unwrap().thresholds[0];
    assert_eq!(thresholds.max_connections.as_ref().unwrap().value, 9000);
    assert_eq!(thresholds.max_pending_requests.as_ref().unwrap().value, 4096);
    assert_eq!(thresholds.max_requests.as_ref().unwrap().value, 404);
    assert_eq!(thresholds.max_retries.as_ref().unwrap().value, 7);

    // Unparseable values downgrade to unset; the parseable one stays.
    pipeline.apply(Object::Service(service_with_annotations(
        "default",
        "kuard",
        &[(None, 80, 8080)],
        &[
            ("isthmus.dev/max-pending-requests", "9999"),
            ("isthmus.dev/max-requests", "1e6"),
            ("isthmus.dev/max-retries", "0x7"),
        ],
    )));
    let entries = pipeline.caches.cluster.entries(&[]);
    let cluster = EnvoyCluster::decode(entries[0].body.value.as_slice()).unwrap();
    let thresholds = &cluster.circuit_breakers.unwrap().thresholds[0];
    assert_eq!(thresholds.max_pending_requests.as_ref().unwrap().value, 9999);
    assert!(thresholds.max_connections.is_none());
    assert!(thresholds.max_requests.is_none());
    assert!(thresholds.max_retries.is_none());
}

#[test]
fn immaterial_events_do_not_advance_versions() {
    let mut pipeline = Pipeline::new();
    pipeline.apply(Object::HttpProxy(two_port_root()));
    pipeline.apply(Object::Service(service("default", "kuard", &[(None, 80, 8080)])));

    let route_version = pipeline.caches.route.version();
    let cluster_version = pipeline.caches.cluster.version();

    // A status-only update is absorbed by the store and, even when a
    // rebuild runs anyway, produces byte-identical caches.
    let mut updated = HTTPProxy::clone(&two_port_root());
    updated.status = Some(isthmus_core::domain::httpproxy::HTTPProxyStatus {
        current_status: Some("valid".to_string()),
        ..Default::default()
    });
    let material = pipeline.apply(Object::HttpProxy(Arc::new(updated)));
    assert!(!material);
    assert_eq!(pipeline.caches.route.version(), route_version);
    assert_eq!(pipeline.caches.cluster.version(), cluster_version);

    // A secret nothing references is also immaterial.
    let material = pipeline.apply(Object::Secret(tls_secret("default", "unreferenced")));
    assert!(!material);
    assert_eq!(pipeline.caches.secret.version(), 0);

    // A material change advances the affected cache by exactly one.
    let material = pipeline.apply(Object::Service(service(
        "default",
        "kuard",
        &[(Some("http"), 80, 8080)],
    )));
    assert!(material);
    assert_eq!(pipeline.caches.cluster.version(), cluster_version + 1);
}

#[tokio::test]
async fn event_handler_debounces_and_opens_the_ready_gate() {
    use isthmus_core::application::event_handler::EventHandler;
    use isthmus_core::application::status::StatusMessage;
    use isthmus_core::domain::kubernetes::ObjectKind;
    use isthmus_core::infrastructure::informers::InformerEvent;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;

    let mut config = IsthmusConfig::default();
    config.rebuild.holdoff = Duration::from_millis(10);
    config.rebuild.max_holdoff = Duration::from_millis(50);
    let config = Arc::new(config);

    let caches = Arc::new(CacheSet::new());
    let (event_tx, event_rx) = mpsc::channel(64);
    let (endpoint_tx, _endpoint_rx) = mpsc::channel(64);
    let (status_tx, mut status_rx) = mpsc::channel::<StatusMessage>(64);
    let (ready_tx, ready_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let handler = EventHandler::new(
        ObjectStore::new(Vec::new(), Vec::new()),
        config,
        caches.clone(),
        event_rx,
        endpoint_tx,
        status_tx,
        ready_tx,
        HashSet::from([ObjectKind::HttpProxy]),
        cancel.clone(),
    );
    let task = tokio::spawn(handler.run());

    // Drain status messages so the handler never blocks on that channel.
    tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

    event_tx
        .send(InformerEvent::Upserted(Object::Service(service(
            "default",
            "kuard",
            &[(Some("http"), 80, 8080)],
        ))))
        .await
        .unwrap();
    event_tx
        .send(InformerEvent::Upserted(Object::HttpProxy(two_port_root())))
        .await
        .unwrap();
    event_tx
        .send(InformerEvent::SyncComplete(ObjectKind::HttpProxy))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if caches.cluster.version() > 0 && *ready_rx.borrow() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rebuild and ready gate within the holdoff windows");

    // The burst of three events coalesced into few rebuilds: the cluster
    // cache saw exactly one material update.
    assert_eq!(caches.cluster.version(), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn load_assignment_names_match_eds_references() {
    use isthmus_core::application::endpoint_translator::EndpointTranslator;
    use isthmus_core::infrastructure::informers::InformerEvent;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster as EnvoyCluster;
    use prost::Message;

    let mut pipeline = Pipeline::new();
    pipeline.apply(Object::HttpProxy(two_port_root()));
    pipeline.apply(Object::Service(service("default", "kuard", &[(Some("http"), 80, 8080)])));

    let entries = pipeline.caches.cluster.entries(&[]);
    let cluster = EnvoyCluster::decode(entries[0].body.value.as_slice()).unwrap();
    let eds_name = cluster.eds_cluster_config.unwrap().service_name;
    assert_eq!(eds_name, "default/kuard/http");

    // The endpoint translator, fed independently, produces an assignment
    // under exactly that name.
    let caches = Arc::new(CacheSet::new());
    let mut translator = EndpointTranslator::new(caches.clone());
    let endpoints = {
        use k8s_openapi::api::core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
        };
        Arc::new(Endpoints {
            metadata: meta("default", "kuard", 100),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        })
    };
    translator.apply(&InformerEvent::Upserted(Object::Endpoints(endpoints)));
    let assignments = translator.assignments();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].0, eds_name);
}
