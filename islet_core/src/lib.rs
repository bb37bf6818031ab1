// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime core: isolate contexts with the curated web-API surface
//! installed, plus the daemon dispatcher and client for the wire protocol.

pub mod daemon;
mod guest_streams;
pub mod module_loader;
pub mod outbound;
pub mod runtime;
pub mod setup_core;
pub mod structured_clone;

pub use daemon::{Client, ClientRuntimeOptions, ConnectionConfig, Daemon, DaemonConfig};
pub use module_loader::normalize_entry_filename;
pub use outbound::{
    ConsoleEntry, ConsoleHandler, ConsoleLevel, CustomFunction, FetchHandler, FsHandler, FsStat,
    ModuleLoader, OutboundHandlers, PlaywrightHandler,
};
pub use runtime::{ContextOptions, IsolateContext, TestEnvConfig};
pub use setup_core::setup_core;
pub use structured_clone::structured_clone;
