// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The `serve` command: wire informers, the rebuild pipeline, the status
//! recorder, and the xDS server together and run until shutdown.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::api::Api;
use kube::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use isthmus_core::application::endpoint_translator::EndpointTranslator;
use isthmus_core::application::event_handler::EventHandler;
use isthmus_core::application::status::StatusRecorder;
use isthmus_core::domain::config::IsthmusConfig;
use isthmus_core::domain::gateway::{
    BackendTLSPolicy, Gateway, GatewayClass, GRPCRoute, HTTPRoute, ReferenceGrant, TCPRoute,
    TLSRoute,
};
use isthmus_core::domain::httpproxy::{ExtensionService, HTTPProxy, TLSCertificateDelegation};
use isthmus_core::domain::kubernetes::ObjectKind;
use isthmus_core::infrastructure::cache::CacheSet;
use isthmus_core::infrastructure::informers::{self, InformerEvent};
use isthmus_core::infrastructure::object_store::{Object, ObjectStore};
use isthmus_core::infrastructure::status_writer::KubeStatusSink;
use isthmus_core::presentation::grpc;

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;

pub async fn run(config: IsthmusConfig, config_path: Option<PathBuf>) -> Result<()> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let caches = Arc::new(CacheSet::new());

    let client = Client::try_default()
        .await
        .context("connecting to the Kubernetes API server")?;

    let (event_tx, event_rx) = mpsc::channel::<InformerEvent>(1024);
    let (endpoint_tx, endpoint_rx) = mpsc::channel::<InformerEvent>(1024);
    let (status_tx, status_rx) = mpsc::channel(256);
    let (ready_tx, ready_rx) = watch::channel(false);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut expected_syncs: HashSet<ObjectKind> = HashSet::new();

    spawn_informers(
        &client,
        &config,
        &event_tx,
        &cancel,
        &mut tasks,
        &mut expected_syncs,
    );

    let store = ObjectStore::new(config.ingress_class_name.clone(), Vec::new());
    let handler = EventHandler::new(
        store,
        config.clone(),
        caches.clone(),
        event_rx,
        endpoint_tx,
        status_tx,
        ready_tx,
        expected_syncs,
        cancel.clone(),
    );
    tasks.push(tokio::spawn(handler.run()));

    let translator = EndpointTranslator::new(caches.clone());
    tasks.push(tokio::spawn(translator.run(endpoint_rx, cancel.clone())));

    let recorder = StatusRecorder::new(Arc::new(KubeStatusSink::new(client.clone())));
    tasks.push(tokio::spawn(recorder.run(status_rx, cancel.clone())));

    // A change to the configuration file ends the process cleanly; the
    // supervisor restarts it with the new configuration.
    let _config_watcher = config_path
        .as_deref()
        .map(|path| watch_config(path, cancel.clone()))
        .transpose()?;

    let server = tokio::spawn({
        let config = config.clone();
        let caches = caches.clone();
        let cancel = cancel.clone();
        async move { grpc::serve(&config, caches, ready_rx, cancel).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
        result = server => {
            // The xDS listener failing to bind or serve is fatal.
            cancel.cancel();
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    error!(%error, "xds server failed");
                    return Err(error.into());
                }
                Err(join_error) => return Err(join_error.into()),
            }
        }
    }

    for task in tasks {
        if let Err(error) = task.await {
            warn!(%error, "task did not shut down cleanly");
        }
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_informers(
    client: &Client,
    config: &Arc<IsthmusConfig>,
    tx: &mpsc::Sender<InformerEvent>,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
    expected_syncs: &mut HashSet<ObjectKind>,
) {
    macro_rules! namespaced_informer {
        ($kind:expr, $type:ty, $wrap:expr) => {
            if !config.feature_disabled($kind.as_str()) {
                expected_syncs.insert($kind);
                if config.watch_namespaces.is_empty() {
                    tasks.push(informers::spawn(
                        Api::<$type>::all(client.clone()),
                        $kind,
                        $wrap,
                        tx.clone(),
                        cancel.clone(),
                    ));
                } else {
                    for namespace in &config.watch_namespaces {
                        tasks.push(informers::spawn(
                            Api::<$type>::namespaced(client.clone(), namespace),
                            $kind,
                            $wrap,
                            tx.clone(),
                            cancel.clone(),
                        ));
                    }
                }
            }
        };
    }
    macro_rules! cluster_informer {
        ($kind:expr, $type:ty, $wrap:expr) => {
            if !config.feature_disabled($kind.as_str()) {
                expected_syncs.insert($kind);
                tasks.push(informers::spawn(
                    Api::<$type>::all(client.clone()),
                    $kind,
                    $wrap,
                    tx.clone(),
                    cancel.clone(),
                ));
            }
        };
    }

    namespaced_informer!(ObjectKind::Service, Service, Object::Service);
    namespaced_informer!(ObjectKind::Endpoints, Endpoints, Object::Endpoints);
    namespaced_informer!(ObjectKind::EndpointSlice, EndpointSlice, Object::EndpointSlice);
    namespaced_informer!(ObjectKind::Secret, Secret, Object::Secret);
    namespaced_informer!(ObjectKind::Ingress, Ingress, Object::Ingress);
    namespaced_informer!(ObjectKind::HttpProxy, HTTPProxy, Object::HttpProxy);
    namespaced_informer!(
        ObjectKind::TlsCertificateDelegation,
        TLSCertificateDelegation,
        Object::TlsCertificateDelegation
    );
    namespaced_informer!(
        ObjectKind::ExtensionService,
        ExtensionService,
        Object::ExtensionService
    );
    namespaced_informer!(ObjectKind::Gateway, Gateway, Object::Gateway);
    namespaced_informer!(ObjectKind::HttpRoute, HTTPRoute, Object::HttpRoute);
    namespaced_informer!(ObjectKind::TlsRoute, TLSRoute, Object::TlsRoute);
    namespaced_informer!(ObjectKind::TcpRoute, TCPRoute, Object::TcpRoute);
    namespaced_informer!(ObjectKind::GrpcRoute, GRPCRoute, Object::GrpcRoute);
    namespaced_informer!(
        ObjectKind::ReferenceGrant,
        ReferenceGrant,
        Object::ReferenceGrant
    );
    namespaced_informer!(
        ObjectKind::BackendTlsPolicy,
        BackendTLSPolicy,
        Object::BackendTlsPolicy
    );

    cluster_informer!(ObjectKind::Namespace, Namespace, Object::Namespace);
    cluster_informer!(ObjectKind::GatewayClass, GatewayClass, Object::GatewayClass);
}

/// Watch the configuration file; any change cancels the run.
fn watch_config(path: &Path, cancel: CancellationToken) -> Result<notify::RecommendedWatcher> {
    use notify::Watcher;

    let watched = path.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() => {
                info!(path = %watched.display(), "configuration changed, restarting");
                cancel.cancel();
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "configuration watch error"),
        }
    })
    .context("creating configuration watcher")?;

    watcher
        .watch(path, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", path.display()))?;
    Ok(watcher)
}
