// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Thin adapter between `kube` watch streams and the event channel the
//! pipeline consumes. The watcher machinery (list/watch, resumption,
//! backoff) belongs to `kube::runtime`; this module only maps its events
//! and reports initial-sync completion per kind.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::object_store::Object;
use crate::domain::kubernetes::ObjectKind;

/// One event on the pipeline's input channel.
#[derive(Debug, Clone)]
pub enum InformerEvent {
    Upserted(Object),
    Deleted(Object),
    /// The informer for `kind` finished its initial list/watch. The xDS
    /// server must not serve before every informer has reported this once.
    SyncComplete(ObjectKind),
}

/// Spawn a watcher for one kind, forwarding events until cancelled.
pub fn spawn<K>(
    api: Api<K>,
    kind: ObjectKind,
    wrap: fn(Arc<K>) -> Object,
    tx: mpsc::Sender<InformerEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitApply(object)) | Ok(watcher::Event::Apply(object)) => {
                    if tx
                        .send(InformerEvent::Upserted(wrap(Arc::new(object))))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(watcher::Event::InitDone) => {
                    if tx.send(InformerEvent::SyncComplete(kind)).await.is_err() {
                        break;
                    }
                }
                Ok(watcher::Event::Delete(object)) => {
                    if tx
                        .send(InformerEvent::Deleted(wrap(Arc::new(object))))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) => {
                    // The watcher restarts itself; nothing to do but note it.
                    warn!(kind = %kind, %error, "watch stream error");
                }
            }
        }
        info!(kind = %kind, "informer stopped");
    })
}
