// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! xDS gRPC server wiring.

mod server;
mod stream;

pub use server::{serve, XdsServerError, XdsService};
