// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration contracts for outbound integrations. The core defines the
//! shapes and the dispatch plumbing; concrete implementations live with
//! the embedder (or on the far side of a daemon connection).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use islet_bridge::{HostFunction, HostRequest, HostResponse, HostValue};
use islet_utils::error::JsError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl ConsoleLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    pub fn from_str(level: &str) -> Self {
        match level {
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Log,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub args: Vec<HostValue>,
}

#[async_trait]
pub trait ConsoleHandler: Send + Sync {
    async fn on_entry(&self, entry: ConsoleEntry);
}

#[async_trait]
pub trait FetchHandler: Send + Sync {
    async fn fetch(&self, request: HostRequest) -> Result<HostResponse, JsError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStat {
    pub is_file: bool,
    pub is_directory: bool,
    pub size: u64,
    pub modified_ms: i64,
}

#[async_trait]
pub trait FsHandler: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Bytes, JsError>;
    async fn write_file(&self, path: &str, data: Bytes) -> Result<(), JsError>;
    async fn stat(&self, path: &str) -> Result<FsStat, JsError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, JsError>;
}

#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Returns the module source for a normalized specifier.
    async fn load(&self, specifier: &str) -> Result<String, JsError>;
}

#[async_trait]
pub trait PlaywrightHandler: Send + Sync {
    async fn op(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue, JsError>;
}

/// A host function installed as a guest global at context creation.
#[derive(Clone)]
pub struct CustomFunction {
    pub name: String,
    pub is_async: bool,
    pub func: HostFunction,
}

/// The full set of outbound registrations a context carries.
#[derive(Clone, Default)]
pub struct OutboundHandlers {
    pub console: Option<Arc<dyn ConsoleHandler>>,
    pub fetch: Option<Arc<dyn FetchHandler>>,
    pub fs: Option<Arc<dyn FsHandler>>,
    pub module_loader: Option<Arc<dyn ModuleLoader>>,
    pub playwright: Option<Arc<dyn PlaywrightHandler>>,
    pub custom_functions: Vec<CustomFunction>,
}
