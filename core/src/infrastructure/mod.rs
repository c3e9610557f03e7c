// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure: the object store, the versioned resource caches, the
//! DAG-to-wire translation, and the adapters that touch the API server.

pub mod bootstrap;
pub mod cache;
pub mod informers;
pub mod object_store;
pub mod status_writer;
pub mod translator;
