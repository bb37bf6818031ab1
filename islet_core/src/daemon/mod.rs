// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The daemon dispatcher and its client: frame parsing, request routing,
//! response correlation, bidirectional callbacks and chunked stream
//! multiplexing over any reliable in-order byte transport.

mod client;
mod connection;
mod pool;
mod remote;
mod server;

pub use client::{handle_id, Client, ClientRuntimeOptions, RuntimeHandle};
pub use connection::ConnectionConfig;
pub use pool::NamespacePool;
pub use server::{Daemon, DaemonConfig, EngineFactory};
