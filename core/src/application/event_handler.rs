// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The event handler: the single writer of the object store and of the
//! Listener/Route/Cluster/Secret caches.
//!
//! Informer events are debounced through two timers: a holdoff that resets
//! on every material event and a maximum holdoff that guarantees a rebuild
//! happens even under sustained churn. Endpoint-shaped events never arm
//! the timers; they are forwarded to the endpoint translator untouched.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::conditions::StatusUpdate;
use crate::domain::config::IsthmusConfig;
use crate::domain::kubernetes::ObjectKind;
use crate::infrastructure::cache::CacheSet;
use crate::infrastructure::informers::InformerEvent;
use crate::infrastructure::object_store::{Object, ObjectStore};
use crate::infrastructure::translator;

use super::builder::DagBuilder;
use super::status::StatusMessage;

/// Kinds whose events are routed to the endpoint translator. Service
/// events go both ways: the store needs them for the DAG, the translator
/// for health-check ports.
fn is_endpoint_event(object: &Object) -> bool {
    matches!(
        object.kind(),
        ObjectKind::Endpoints | ObjectKind::EndpointSlice
    )
}

fn is_routing_kind(kind: ObjectKind) -> bool {
    matches!(
        kind,
        ObjectKind::Ingress
            | ObjectKind::HttpProxy
            | ObjectKind::HttpRoute
            | ObjectKind::TlsRoute
            | ObjectKind::TcpRoute
            | ObjectKind::GrpcRoute
    )
}

pub struct EventHandler {
    store: ObjectStore,
    builder: DagBuilder,
    caches: Arc<CacheSet>,
    config: Arc<IsthmusConfig>,
    rx: mpsc::Receiver<InformerEvent>,
    endpoint_tx: mpsc::Sender<InformerEvent>,
    status_tx: mpsc::Sender<StatusMessage>,
    ready_tx: watch::Sender<bool>,
    /// Kinds whose informers must report initial sync before the xDS
    /// server may serve.
    expected_syncs: HashSet<ObjectKind>,
    cancel: CancellationToken,
}

impl EventHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ObjectStore,
        config: Arc<IsthmusConfig>,
        caches: Arc<CacheSet>,
        rx: mpsc::Receiver<InformerEvent>,
        endpoint_tx: mpsc::Sender<InformerEvent>,
        status_tx: mpsc::Sender<StatusMessage>,
        ready_tx: watch::Sender<bool>,
        expected_syncs: HashSet<ObjectKind>,
        cancel: CancellationToken,
    ) -> Self {
        let builder = DagBuilder::new(config.clone());
        Self {
            store,
            builder,
            caches,
            config,
            rx,
            endpoint_tx,
            status_tx,
            ready_tx,
            expected_syncs,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut pending = false;
        let mut holdoff_deadline: Option<Instant> = None;
        let mut max_deadline: Option<Instant> = None;
        let mut synced: HashSet<ObjectKind> = HashSet::new();

        loop {
            let next_deadline = match (holdoff_deadline, max_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep, if pending => {
                    self.rebuild().await;
                    pending = false;
                    holdoff_deadline = None;
                    max_deadline = None;
                    // Serving gate: every informer synced and at least one
                    // DAG built (which just happened).
                    if synced.is_superset(&self.expected_syncs) {
                        let _ = self.ready_tx.send_replace(true);
                    }
                }
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    let material = self.handle_event(event, &mut synced).await;
                    if material {
                        let now = Instant::now();
                        holdoff_deadline = Some(now + self.config.rebuild.holdoff);
                        if max_deadline.is_none() {
                            max_deadline = Some(now + self.config.rebuild.max_holdoff);
                        }
                        pending = true;
                    }
                }
            }
        }
        info!("event handler stopped");
    }

    /// Returns whether a rebuild became pending.
    async fn handle_event(
        &mut self,
        event: InformerEvent,
        synced: &mut HashSet<ObjectKind>,
    ) -> bool {
        match event {
            InformerEvent::SyncComplete(kind) => {
                synced.insert(kind);
                debug!(kind = %kind, "informer synced");
                // Once the last informer catches up, force a rebuild even
                // if nothing was material, so the ready gate can open.
                synced.is_superset(&self.expected_syncs)
            }
            InformerEvent::Upserted(object) => {
                if is_endpoint_event(&object) {
                    let _ = self
                        .endpoint_tx
                        .send(InformerEvent::Upserted(object))
                        .await;
                    return false;
                }
                if matches!(object.kind(), ObjectKind::Service) {
                    let _ = self
                        .endpoint_tx
                        .send(InformerEvent::Upserted(object.clone()))
                        .await;
                }
                let kind = object.kind();
                let name = object.full_name();
                let material = self.store.insert(object);
                if material && is_routing_kind(kind) {
                    let _ = self
                        .status_tx
                        .send(StatusMessage::Default(StatusUpdate::not_reconciled(kind, name)))
                        .await;
                }
                material
            }
            InformerEvent::Deleted(object) => {
                if is_endpoint_event(&object) {
                    let _ = self.endpoint_tx.send(InformerEvent::Deleted(object)).await;
                    return false;
                }
                if matches!(object.kind(), ObjectKind::Service) {
                    let _ = self
                        .endpoint_tx
                        .send(InformerEvent::Deleted(object.clone()))
                        .await;
                }
                self.store.remove(&object)
            }
        }
    }

    async fn rebuild(&mut self) {
        let snapshot = self.store.snapshot();
        let started = std::time::Instant::now();

        // A panic in the builder must not take down the controller: the
        // previous DAG stays in service and the next event retries.
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.builder.build(&snapshot)));
        let result = match result {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "dag rebuild panicked, keeping previous configuration");
                metrics::counter!("isthmus_rebuild_panics_total").increment(1);
                return;
            }
        };

        let listener_version = self
            .caches
            .listener
            .update(translator::listener::from_dag(&result.dag, &self.config));
        let route_version = self.caches.route.update(translator::route::from_dag(&result.dag));
        let cluster_version = self
            .caches
            .cluster
            .update(translator::cluster::from_dag(&result.dag, &self.config));
        let secret_version = self.caches.secret.update(translator::secret::from_dag(&result.dag));

        if self
            .status_tx
            .send(StatusMessage::Report(result.report.into_updates()))
            .await
            .is_err()
        {
            warn!("status recorder is gone; conditions dropped");
        }

        metrics::counter!("isthmus_rebuilds_total").increment(1);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            listener_version,
            route_version,
            cluster_version,
            secret_version,
            "rebuild complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_kinds_are_classified() {
        use k8s_openapi::api::core::v1::Endpoints;
        let object = Object::Endpoints(Arc::new(Endpoints::default()));
        assert!(is_endpoint_event(&object));
        assert!(!is_routing_kind(object.kind()));
        assert!(is_routing_kind(ObjectKind::HttpProxy));
    }
}
