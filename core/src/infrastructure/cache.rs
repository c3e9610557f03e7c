// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Versioned discovery resource caches.
//!
//! One cache per xDS resource kind. Writers (the event handler for
//! Listener/Route/Cluster/Secret, the endpoint translator for
//! LoadAssignment) replace the whole entry set; readers (xDS streams) see a
//! consistent snapshot at any time.
//!
//! Versions are monotone and only advance on a material change: an update
//! whose serialized resources are byte-identical to the cached set neither
//! bumps the cache version nor touches per-entry versions, which is what
//! suppresses spurious pushes to the fleet.

use std::collections::BTreeMap;

use envoy_types::pb::google::protobuf::Any;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use super::translator::type_urls;

/// A cached resource: serialized body plus the cache version at which the
/// body last changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResource {
    pub name: String,
    pub version: u64,
    pub body: Any,
}

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    entries: BTreeMap<String, CachedResource>,
}

/// A single versioned, concurrently readable resource cache.
#[derive(Debug)]
pub struct ResourceCache {
    type_url: &'static str,
    inner: RwLock<Inner>,
    notify: watch::Sender<u64>,
}

impl ResourceCache {
    pub fn new(type_url: &'static str) -> Self {
        let (notify, _) = watch::channel(0);
        Self { type_url, inner: RwLock::new(Inner::default()), notify }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    /// Replace the entry set. Entries whose bodies are unchanged keep their
    /// per-entry version; if nothing changed at all the cache version stays
    /// put and no notification fires. Returns the (possibly unchanged)
    /// cache version.
    pub fn update(&self, resources: Vec<(String, Any)>) -> u64 {
        let mut inner = self.inner.write();

        let incoming: BTreeMap<String, Any> = resources.into_iter().collect();
        let removed: Vec<String> = inner
            .entries
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        let changed: Vec<(String, Any)> = incoming
            .into_iter()
            .filter(|(name, body)| {
                inner.entries.get(name).map(|existing| &existing.body != body).unwrap_or(true)
            })
            .collect();

        if changed.is_empty() && removed.is_empty() {
            return inner.version;
        }

        inner.version += 1;
        let version = inner.version;
        for name in &removed {
            inner.entries.remove(name);
        }
        for (name, body) in changed {
            inner
                .entries
                .insert(name.clone(), CachedResource { name, version, body });
        }

        debug!(
            type_url = self.type_url,
            version,
            total = inner.entries.len(),
            removed = removed.len(),
            "cache updated"
        );
        drop(inner);

        let _ = self.notify.send_replace(version);
        version
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Entries filtered by name; an empty filter returns everything. The
    /// result is sorted by name.
    pub fn entries(&self, names: &[String]) -> Vec<CachedResource> {
        let inner = self.inner.read();
        if names.is_empty() {
            inner.entries.values().cloned().collect()
        } else {
            let mut wanted: Vec<&String> = names.iter().collect();
            wanted.sort();
            wanted.dedup();
            wanted
                .into_iter()
                .filter_map(|name| inner.entries.get(name).cloned())
                .collect()
        }
    }

    /// Per-entry (name, version) pairs, used by delta streams to diff
    /// against a client's acknowledged state.
    pub fn entry_versions(&self) -> BTreeMap<String, u64> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| (e.name.clone(), e.version))
            .collect()
    }

    /// Notified with the new version whenever [`version`](Self::version)
    /// advances. Receivers observing only the latest value is exactly the
    /// backpressure collapse the protocol wants.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

/// The five caches, one per discovery type.
#[derive(Debug)]
pub struct CacheSet {
    pub listener: ResourceCache,
    pub route: ResourceCache,
    pub cluster: ResourceCache,
    pub load_assignment: ResourceCache,
    pub secret: ResourceCache,
}

impl CacheSet {
    pub fn new() -> Self {
        Self {
            listener: ResourceCache::new(type_urls::LISTENER),
            route: ResourceCache::new(type_urls::ROUTE),
            cluster: ResourceCache::new(type_urls::CLUSTER),
            load_assignment: ResourceCache::new(type_urls::CLUSTER_LOAD_ASSIGNMENT),
            secret: ResourceCache::new(type_urls::SECRET),
        }
    }

    pub fn by_type_url(&self, type_url: &str) -> Option<&ResourceCache> {
        match type_url {
            type_urls::LISTENER => Some(&self.listener),
            type_urls::ROUTE => Some(&self.route),
            type_urls::CLUSTER => Some(&self.cluster),
            type_urls::CLUSTER_LOAD_ASSIGNMENT => Some(&self.load_assignment),
            type_urls::SECRET => Some(&self.secret),
            _ => None,
        }
    }

    pub fn all(&self) -> [&ResourceCache; 5] {
        [
            &self.cluster,
            &self.load_assignment,
            &self.listener,
            &self.route,
            &self.secret,
        ]
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(payload: &[u8]) -> Any {
        Any { type_url: type_urls::CLUSTER.to_string(), value: payload.to_vec() }
    }

    #[test]
    fn identical_update_does_not_advance_version() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        let v1 = cache.update(vec![("a".into(), body(b"one"))]);
        assert_eq!(v1, 1);
        let v2 = cache.update(vec![("a".into(), body(b"one"))]);
        assert_eq!(v2, 1);
        assert_eq!(cache.version(), 1);
    }

    #[test]
    fn material_update_advances_version_by_one() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        cache.update(vec![("a".into(), body(b"one"))]);
        let v = cache.update(vec![("a".into(), body(b"two"))]);
        assert_eq!(v, 2);
    }

    #[test]
    fn removal_is_material() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        cache.update(vec![("a".into(), body(b"one")), ("b".into(), body(b"two"))]);
        let v = cache.update(vec![("a".into(), body(b"one"))]);
        assert_eq!(v, 2);
        assert_eq!(cache.entries(&[]).len(), 1);
    }

    #[test]
    fn entries_filter_matches_set_semantics() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        cache.update(vec![
            ("a".into(), body(b"1")),
            ("b".into(), body(b"2")),
            ("c".into(), body(b"3")),
        ]);
        let all = cache.entries(&[]);
        let filter = vec!["c".to_string(), "a".to_string(), "missing".to_string()];
        let filtered = cache.entries(&filter);
        let expected: Vec<_> = all
            .iter()
            .filter(|e| filter.contains(&e.name))
            .cloned()
            .collect();
        assert_eq!(filtered, expected);
    }

    #[test]
    fn unchanged_entries_keep_their_version_across_updates() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        cache.update(vec![("a".into(), body(b"1")), ("b".into(), body(b"2"))]);
        cache.update(vec![("a".into(), body(b"1")), ("b".into(), body(b"changed"))]);
        let versions = cache.entry_versions();
        assert_eq!(versions["a"], 1);
        assert_eq!(versions["b"], 2);
    }

    #[test]
    fn subscribers_observe_only_the_latest_version() {
        let cache = ResourceCache::new(type_urls::CLUSTER);
        let rx = cache.subscribe();
        cache.update(vec![("a".into(), body(b"1"))]);
        cache.update(vec![("a".into(), body(b"2"))]);
        assert_eq!(*rx.borrow(), 2);
    }
}
