// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The discovery server: the aggregated discovery service plus the five
//! per-type services, all backed by the same cache set and the same
//! per-stream state machines. `Fetch` (unary) variants are not served;
//! every supported client speaks the streaming protocol.

use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use crate::domain::config::IsthmusConfig;
use crate::infrastructure::cache::CacheSet;
use crate::infrastructure::translator::type_urls;

use super::stream::{run_delta, run_sotw};

#[derive(Debug, thiserror::Error)]
pub enum XdsServerError {
    #[error("invalid xds bind address {address}: {source}")]
    BindAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to read xds TLS material from {path}: {source}")]
    TlsMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// Shared handler behind every discovery service.
#[derive(Clone)]
pub struct XdsService {
    caches: Arc<CacheSet>,
    ready: watch::Receiver<bool>,
}

impl XdsService {
    pub fn new(caches: Arc<CacheSet>, ready: watch::Receiver<bool>) -> Self {
        Self { caches, ready }
    }

    fn open_sotw(
        &self,
        requests: Streaming<DiscoveryRequest>,
        default_type_url: Option<&'static str>,
    ) -> ReceiverStream<Result<DiscoveryResponse, Status>> {
        metrics::counter!("isthmus_xds_streams_opened_total").increment(1);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_sotw(
            self.caches.clone(),
            self.ready.clone(),
            requests,
            tx,
            default_type_url,
        ));
        ReceiverStream::new(rx)
    }

    fn open_delta(
        &self,
        requests: Streaming<DeltaDiscoveryRequest>,
        default_type_url: Option<&'static str>,
    ) -> ReceiverStream<Result<DeltaDiscoveryResponse, Status>> {
        metrics::counter!("isthmus_xds_streams_opened_total").increment(1);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_delta(
            self.caches.clone(),
            self.ready.clone(),
            requests,
            tx,
            default_type_url,
        ));
        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsService {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.open_sotw(request.into_inner(), None)))
    }

    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_aggregated_resources(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.open_delta(request.into_inner(), None)))
    }
}

/// The five typed services differ only in method names and default type
/// URL; one macro keeps them in lockstep.
macro_rules! typed_discovery_service {
    ($service:ident, $type_url:expr, $stream_fn:ident, $stream_ty:ident, $delta_fn:ident, $delta_ty:ident, $fetch_fn:ident) => {
        #[tonic::async_trait]
        impl $service for XdsService {
            type $stream_ty = ReceiverStream<Result<DiscoveryResponse, Status>>;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                Ok(Response::new(self.open_sotw(request.into_inner(), Some($type_url))))
            }

            type $delta_ty = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

            async fn $delta_fn(
                &self,
                request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                Ok(Response::new(self.open_delta(request.into_inner(), Some($type_url))))
            }

            async fn $fetch_fn(
                &self,
                _request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                Err(Status::unimplemented("fetch is not served; use the stream variants"))
            }
        }
    };
}

typed_discovery_service!(
    ListenerDiscoveryService,
    type_urls::LISTENER,
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    fetch_listeners
);
typed_discovery_service!(
    RouteDiscoveryService,
    type_urls::ROUTE,
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    fetch_routes
);
typed_discovery_service!(
    ClusterDiscoveryService,
    type_urls::CLUSTER,
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    fetch_clusters
);
typed_discovery_service!(
    EndpointDiscoveryService,
    type_urls::CLUSTER_LOAD_ASSIGNMENT,
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    fetch_endpoints
);
typed_discovery_service!(
    SecretDiscoveryService,
    type_urls::SECRET,
    stream_secrets,
    StreamSecretsStream,
    delta_secrets,
    DeltaSecretsStream,
    fetch_secrets
);

/// Bind and serve until cancellation. Failure to bind is fatal and
/// surfaces as an error to the caller.
pub async fn serve(
    config: &IsthmusConfig,
    caches: Arc<CacheSet>,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<(), XdsServerError> {
    let address = format!("{}:{}", config.xds_address, config.xds_port);
    let socket_address: std::net::SocketAddr = address
        .parse()
        .map_err(|source| XdsServerError::BindAddress { address: address.clone(), source })?;

    let mut builder = Server::builder();
    if let Some(tls) = &config.xds_server_tls {
        let read = |path: &str| {
            std::fs::read(path).map_err(|source| XdsServerError::TlsMaterial {
                path: path.to_string(),
                source,
            })
        };
        let identity = Identity::from_pem(read(&tls.cert_file)?, read(&tls.key_file)?);
        let ca = Certificate::from_pem(read(&tls.ca_file)?);
        builder = builder.tls_config(
            ServerTlsConfig::new()
                .identity(identity)
                .client_ca_root(ca),
        )?;
        info!("xds transport secured with mutual TLS");
    }

    let service = XdsService::new(caches, ready);

    info!(%address, "serving xds");
    builder
        .add_service(AggregatedDiscoveryServiceServer::new(service.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(service.clone()))
        .add_service(RouteDiscoveryServiceServer::new(service.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(service.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(service.clone()))
        .add_service(SecretDiscoveryServiceServer::new(service))
        .serve_with_shutdown(socket_address, cancel.cancelled())
        .await?;

    info!("xds server stopped");
    Ok(())
}
