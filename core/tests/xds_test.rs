// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! xDS protocol tests against a live server: version/nonce handling on the
//! state-of-the-world stream and diffs on the delta stream.

use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DiscoveryRequest,
};
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::infrastructure::cache::CacheSet;
use isthmus_core::infrastructure::translator::type_urls;
use isthmus_core::presentation::grpc;

fn cluster_body(payload: &[u8]) -> Any {
    Any { type_url: type_urls::CLUSTER.to_string(), value: payload.to_vec() }
}

struct TestServer {
    caches: Arc<CacheSet>,
    cancel: CancellationToken,
    address: String,
    _ready: watch::Sender<bool>,
}

impl TestServer {
    async fn start(port: u16) -> Self {
        let mut config = IsthmusConfig::default();
        config.xds_address = "127.0.0.1".to_string();
        config.xds_port = port;

        let caches = Arc::new(CacheSet::new());
        let (ready_tx, ready_rx) = watch::channel(true);
        let cancel = CancellationToken::new();

        tokio::spawn({
            let caches = caches.clone();
            let cancel = cancel.clone();
            async move {
                grpc::serve(&config, caches, ready_rx, cancel)
                    .await
                    .expect("xds server runs");
            }
        });

        let address = format!("http://127.0.0.1:{port}");
        Self { caches, cancel, address, _ready: ready_tx }
    }

    async fn connect(&self) -> AggregatedDiscoveryServiceClient<Channel> {
        for _ in 0..50 {
            if let Ok(client) =
                AggregatedDiscoveryServiceClient::connect(self.address.clone()).await
            {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("xds server did not come up at {}", self.address);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sotw_stream_reports_cache_version_and_pushes_updates() {
    let server = TestServer::start(18921).await;
    server
        .caches
        .cluster
        .update(vec![("default/kuard/80/abc".into(), cluster_body(b"one"))]);

    let mut client = server.connect().await;
    let (tx, rx) = mpsc::channel::<DiscoveryRequest>(8);
    let mut responses = client
        .stream_aggregated_resources(ReceiverStream::new(rx))
        .await
        .expect("stream opens")
        .into_inner();

    // Initial subscription.
    tx.send(DiscoveryRequest {
        type_url: type_urls::CLUSTER.to_string(),
        ..Default::default()
    })
    .await
    .unwrap();

    let response = responses.message().await.unwrap().expect("first response");
    assert_eq!(response.type_url, type_urls::CLUSTER);
    assert_eq!(response.version_info, server.caches.cluster.version().to_string());
    assert_eq!(response.resources.len(), 1);
    assert!(!response.nonce.is_empty());

    // Ack, then change the cache: a push arrives with the new version.
    tx.send(DiscoveryRequest {
        type_url: type_urls::CLUSTER.to_string(),
        version_info: response.version_info.clone(),
        response_nonce: response.nonce.clone(),
        ..Default::default()
    })
    .await
    .unwrap();

    server
        .caches
        .cluster
        .update(vec![("default/kuard/80/abc".into(), cluster_body(b"two"))]);

    let pushed = responses.message().await.unwrap().expect("pushed response");
    assert_eq!(pushed.version_info, server.caches.cluster.version().to_string());
    assert_ne!(pushed.nonce, response.nonce);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sotw_stream_filters_by_resource_name() {
    let server = TestServer::start(18922).await;
    server.caches.cluster.update(vec![
        ("a".into(), cluster_body(b"1")),
        ("b".into(), cluster_body(b"2")),
        ("c".into(), cluster_body(b"3")),
    ]);

    let mut client = server.connect().await;
    let (tx, rx) = mpsc::channel::<DiscoveryRequest>(8);
    let mut responses = client
        .stream_aggregated_resources(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    tx.send(DiscoveryRequest {
        type_url: type_urls::CLUSTER.to_string(),
        resource_names: vec!["c".to_string(), "a".to_string()],
        ..Default::default()
    })
    .await
    .unwrap();

    let response = responses.message().await.unwrap().unwrap();
    assert_eq!(response.resources.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delta_stream_sends_only_changes_after_ack() {
    let server = TestServer::start(18923).await;
    server.caches.cluster.update(vec![
        ("a".into(), cluster_body(b"1")),
        ("b".into(), cluster_body(b"2")),
    ]);

    let mut client = server.connect().await;
    let (tx, rx) = mpsc::channel::<DeltaDiscoveryRequest>(8);
    let mut responses = client
        .delta_aggregated_resources(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    // Wildcard subscription: everything arrives once.
    tx.send(DeltaDiscoveryRequest {
        type_url: type_urls::CLUSTER.to_string(),
        ..Default::default()
    })
    .await
    .unwrap();

    let initial = responses.message().await.unwrap().expect("initial delta");
    assert_eq!(initial.resources.len(), 2);
    assert!(initial.removed_resources.is_empty());

    // Ack, then touch one resource and delete the other: the next delta
    // carries exactly that difference.
    tx.send(DeltaDiscoveryRequest {
        type_url: type_urls::CLUSTER.to_string(),
        response_nonce: initial.nonce.clone(),
        ..Default::default()
    })
    .await
    .unwrap();

    server
        .caches
        .cluster
        .update(vec![("a".into(), cluster_body(b"changed"))]);

    let delta = responses.message().await.unwrap().expect("incremental delta");
    assert_eq!(delta.resources.len(), 1);
    assert_eq!(delta.resources[0].name, "a");
    assert_eq!(delta.removed_resources, vec!["b".to_string()]);
}
