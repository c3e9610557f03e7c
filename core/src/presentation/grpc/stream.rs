// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Per-stream protocol state machines for the state-of-the-world and delta
//! discovery variants.
//!
//! Both machines observe the same rules: responses are strictly ordered
//! and nonce-stamped, a new response for a type is held until the previous
//! one is acked or nacked, and if the cache advances several times while a
//! response is in flight only the newest state is sent afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, Resource,
};
use futures::stream::SelectAll;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};

use crate::infrastructure::cache::CacheSet;

type VersionStream = SelectAll<futures::stream::Map<WatchStream<u64>, Box<dyn FnMut(u64) -> (&'static str, u64) + Send>>>;

/// A merged stream of (type_url, version) ticks across all caches.
fn version_stream(caches: &CacheSet) -> VersionStream {
    let streams = caches.all().into_iter().map(|cache| {
        let type_url = cache.type_url();
        let mapper: Box<dyn FnMut(u64) -> (&'static str, u64) + Send> =
            Box::new(move |version| (type_url, version));
        WatchStream::new(cache.subscribe()).map(mapper)
    });
    futures::stream::select_all(streams)
}

/// Wait until the pipeline has synced and built at least one DAG. Returns
/// `false` when the controller is shutting down instead.
async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    while !*ready.borrow() {
        if ready.changed().await.is_err() {
            return false;
        }
    }
    true
}

#[derive(Default)]
struct SotwTypeState {
    names: Vec<String>,
    sent_version: Option<u64>,
    pending_nonce: Option<String>,
    /// Cache advanced while a response was unacknowledged.
    dirty: bool,
}

/// Drive one state-of-the-world stream. `default_type_url` is set for the
/// single-type services whose clients may omit the type URL; the
/// aggregated stream has none.
pub(crate) async fn run_sotw(
    caches: Arc<CacheSet>,
    mut ready: watch::Receiver<bool>,
    mut requests: Streaming<DiscoveryRequest>,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    default_type_url: Option<&'static str>,
) {
    if !wait_ready(&mut ready).await {
        return;
    }

    let mut versions = version_stream(&caches);
    let mut states: HashMap<&'static str, SotwTypeState> = HashMap::new();

    loop {
        tokio::select! {
            request = requests.next() => {
                match request {
                    None => {
                        info!("discovery stream closed by client");
                        return;
                    }
                    Some(Err(status)) => {
                        warn!(%status, "discovery stream terminated with protocol error");
                        return;
                    }
                    Some(Ok(request)) => {
                        if !handle_sotw_request(&caches, &mut states, request, &tx, default_type_url).await {
                            return;
                        }
                    }
                }
            }
            Some((type_url, version)) = versions.next() => {
                let Some(state) = states.get_mut(type_url) else { continue };
                if state.pending_nonce.is_some() {
                    // Never stack responses: remember and send the newest
                    // state once the client answers.
                    state.dirty = true;
                    continue;
                }
                if state.sent_version.map(|sent| sent < version).unwrap_or(false)
                    && !send_sotw(&caches, state, type_url, &tx).await
                {
                    return;
                }
            }
        }
    }
}

/// Returns `false` when the stream should terminate (send error).
async fn handle_sotw_request(
    caches: &Arc<CacheSet>,
    states: &mut HashMap<&'static str, SotwTypeState>,
    request: DiscoveryRequest,
    tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    default_type_url: Option<&'static str>,
) -> bool {
    let Some(type_url) = resolve_type_url(caches, &request.type_url, default_type_url) else {
        warn!(type_url = %request.type_url, "request for unknown resource type");
        return true;
    };
    let state = states.entry(type_url).or_default();

    if request.response_nonce.is_empty() {
        // Initial subscription (or re-subscription) for this type.
        state.names = request.resource_names;
        return send_sotw(caches, state, type_url, tx).await;
    }

    if state.pending_nonce.as_deref() != Some(request.response_nonce.as_str()) {
        debug!(nonce = %request.response_nonce, "stale nonce ignored");
        return true;
    }
    state.pending_nonce = None;

    if let Some(error) = &request.error_detail {
        warn!(
            type_url,
            code = error.code,
            message = %error.message,
            "client rejected configuration"
        );
        // The client keeps its previous version. If the cache moved on
        // while the rejected response was in flight, offer the newer
        // state immediately; otherwise wait for the next version bump.
        if state.dirty {
            return send_sotw(caches, state, type_url, tx).await;
        }
        return true;
    }

    let names_changed = state.names != request.resource_names;
    state.names = request.resource_names;

    let cache_version = caches
        .by_type_url(type_url)
        .map(|cache| cache.version())
        .unwrap_or_default();
    let newer_available =
        state.dirty || state.sent_version.map(|sent| sent < cache_version).unwrap_or(true);
    if names_changed || newer_available {
        return send_sotw(caches, state, type_url, tx).await;
    }
    true
}

async fn send_sotw(
    caches: &Arc<CacheSet>,
    state: &mut SotwTypeState,
    type_url: &'static str,
    tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> bool {
    let Some(cache) = caches.by_type_url(type_url) else {
        return true;
    };
    let version = cache.version();
    let resources = cache
        .entries(&state.names)
        .into_iter()
        .map(|entry| entry.body)
        .collect();
    let nonce = uuid::Uuid::new_v4().to_string();

    let response = DiscoveryResponse {
        version_info: version.to_string(),
        resources,
        type_url: type_url.to_string(),
        nonce: nonce.clone(),
        ..Default::default()
    };

    state.sent_version = Some(version);
    state.pending_nonce = Some(nonce);
    state.dirty = false;

    tx.send(Ok(response)).await.is_ok()
}

#[derive(Default)]
struct DeltaTypeState {
    wildcard: bool,
    subscriptions: HashSet<String>,
    /// Resource versions the client has acknowledged.
    tracked: BTreeMap<String, u64>,
    /// Proposed tracked state, keyed by the nonce that must ack it.
    pending: Option<(String, BTreeMap<String, u64>)>,
    dirty: bool,
}

/// Drive one incremental (delta) stream.
pub(crate) async fn run_delta(
    caches: Arc<CacheSet>,
    mut ready: watch::Receiver<bool>,
    mut requests: Streaming<DeltaDiscoveryRequest>,
    tx: mpsc::Sender<Result<DeltaDiscoveryResponse, Status>>,
    default_type_url: Option<&'static str>,
) {
    if !wait_ready(&mut ready).await {
        return;
    }

    let mut versions = version_stream(&caches);
    let mut states: HashMap<&'static str, DeltaTypeState> = HashMap::new();

    loop {
        tokio::select! {
            request = requests.next() => {
                match request {
                    None => {
                        info!("delta discovery stream closed by client");
                        return;
                    }
                    Some(Err(status)) => {
                        warn!(%status, "delta discovery stream terminated with protocol error");
                        return;
                    }
                    Some(Ok(request)) => {
                        if !handle_delta_request(&caches, &mut states, request, &tx, default_type_url).await {
                            return;
                        }
                    }
                }
            }
            Some((type_url, _version)) = versions.next() => {
                let Some(state) = states.get_mut(type_url) else { continue };
                if state.pending.is_some() {
                    state.dirty = true;
                    continue;
                }
                if !send_delta(&caches, state, type_url, &tx).await {
                    return;
                }
            }
        }
    }
}

async fn handle_delta_request(
    caches: &Arc<CacheSet>,
    states: &mut HashMap<&'static str, DeltaTypeState>,
    request: DeltaDiscoveryRequest,
    tx: &mpsc::Sender<Result<DeltaDiscoveryResponse, Status>>,
    default_type_url: Option<&'static str>,
) -> bool {
    let Some(type_url) = resolve_type_url(caches, &request.type_url, default_type_url) else {
        warn!(type_url = %request.type_url, "delta request for unknown resource type");
        return true;
    };

    let first_request = !states.contains_key(type_url);
    let state = states.entry(type_url).or_default();

    if first_request {
        // Wildcard when the initial request subscribes to nothing
        // explicitly, per the protocol.
        state.wildcard = request.resource_names_subscribe.is_empty()
            || request.resource_names_subscribe.iter().any(|n| n == "*");
        for (name, version) in &request.initial_resource_versions {
            state
                .tracked
                .insert(name.clone(), version.parse::<u64>().unwrap_or(0));
        }
    }

    for name in &request.resource_names_subscribe {
        if name == "*" {
            state.wildcard = true;
        } else {
            state.subscriptions.insert(name.clone());
        }
    }
    for name in &request.resource_names_unsubscribe {
        if name == "*" {
            state.wildcard = false;
        } else {
            state.subscriptions.remove(name);
        }
    }

    if !request.response_nonce.is_empty() {
        let matches = state
            .pending
            .as_ref()
            .map(|(nonce, _)| nonce == &request.response_nonce)
            .unwrap_or(false);
        if matches {
            let (_, proposed) = state.pending.take().expect("pending checked above");
            if let Some(error) = &request.error_detail {
                warn!(
                    type_url,
                    code = error.code,
                    message = %error.message,
                    "client rejected delta configuration"
                );
            } else {
                state.tracked = proposed;
            }
            if state.dirty {
                return send_delta(caches, state, type_url, tx).await;
            }
        }
        return true;
    }

    send_delta(caches, state, type_url, tx).await
}

async fn send_delta(
    caches: &Arc<CacheSet>,
    state: &mut DeltaTypeState,
    type_url: &'static str,
    tx: &mpsc::Sender<Result<DeltaDiscoveryResponse, Status>>,
) -> bool {
    let Some(cache) = caches.by_type_url(type_url) else {
        return true;
    };

    let wanted: Vec<String> = if state.wildcard {
        Vec::new()
    } else {
        state.subscriptions.iter().cloned().collect()
    };
    let entries = cache.entries(&wanted);

    let mut proposed = BTreeMap::new();
    let mut resources = Vec::new();
    for entry in entries {
        proposed.insert(entry.name.clone(), entry.version);
        let known = state.tracked.get(&entry.name).copied();
        if known != Some(entry.version) {
            resources.push(Resource {
                name: entry.name.clone(),
                version: entry.version.to_string(),
                resource: Some(entry.body),
                ..Default::default()
            });
        }
    }
    let removed: Vec<String> = state
        .tracked
        .keys()
        .filter(|name| !proposed.contains_key(*name))
        .cloned()
        .collect();

    if resources.is_empty() && removed.is_empty() {
        state.dirty = false;
        return true;
    }

    let nonce = uuid::Uuid::new_v4().to_string();
    let response = DeltaDiscoveryResponse {
        system_version_info: cache.version().to_string(),
        resources,
        type_url: type_url.to_string(),
        removed_resources: removed,
        nonce: nonce.clone(),
        ..Default::default()
    };

    state.pending = Some((nonce, proposed));
    state.dirty = false;

    tx.send(Ok(response)).await.is_ok()
}

fn resolve_type_url(
    caches: &CacheSet,
    requested: &str,
    default_type_url: Option<&'static str>,
) -> Option<&'static str> {
    if requested.is_empty() {
        return default_type_url;
    }
    caches.by_type_url(requested).map(|cache| cache.type_url())
}
