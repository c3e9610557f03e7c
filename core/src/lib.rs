// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! # isthmus-core
//!
//! The configuration pipeline of the Isthmus ingress controller. This crate
//! owns everything between the Kubernetes watch stream and the Envoy fleet:
//! the in-memory object store, the routing DAG and its admission rules, the
//! versioned xDS resource caches, the streaming discovery server, and the
//! coalescing event loop that drives a rebuild from one end to the other.
//!
//! ## Layer Structure
//!
//! ```text
//! presentation/   ← xDS gRPC server (tonic over envoy-types)
//!     ↓
//! application/    ← DAG builder, event handler, endpoint translator, status
//!     ↓
//! domain/         ← Custom resources, DAG model, policies, conditions, config
//!     ↓
//! infrastructure/ ← Object store, resource caches, wire translation, informers
//! ```
//!
//! ## Data Flow
//!
//! Watch events land in the [`infrastructure::object_store::ObjectStore`];
//! the [`application::event_handler::EventHandler`] debounces them, runs the
//! [`application::builder::DagBuilder`] over a snapshot, feeds the resulting
//! graph through [`infrastructure::translator`] into the
//! [`infrastructure::cache::CacheSet`], and the
//! [`presentation::grpc`] server streams whatever changed to every
//! connected Envoy. Endpoint churn bypasses the DAG entirely via the
//! [`application::endpoint_translator::EndpointTranslator`].
//!
//! ## Integration Tests
//!
//! See `core/tests/` for end-to-end pipeline scenarios (cluster lifecycle,
//! TLS delegation, duplicate includes, xDS version stability).

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
