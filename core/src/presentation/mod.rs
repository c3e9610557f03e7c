// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Presentation layer: the streaming discovery (xDS) gRPC server.

pub mod grpc;
