// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Append-only trace persistence.

pub mod schema;
pub mod store;

pub use store::TraceStore;
