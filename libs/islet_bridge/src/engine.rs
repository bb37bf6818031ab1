// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use islet_utils::error::{JsError, JsErrorKind};

/// Opaque engine handle. The engine owns the referent; release goes through
/// [`Engine::release_handle`], usually via a [`Scope`](crate::Scope).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JsHandle(pub u64);

/// The value shapes an engine can marshal natively across its boundary.
/// Everything richer travels as a [`JsHandle`].
#[derive(Clone, Debug, PartialEq)]
pub enum EngineValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<EngineValue>),
    Object(Vec<(String, EngineValue)>),
    Handle(JsHandle),
}

impl EngineValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<JsHandle> {
        match self {
            Self::Handle(handle) => Some(*handle),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The guest threw; the payload is the tagged error record.
    #[error("{0}")]
    Script(JsError),
    #[error("handle {0} is not live")]
    DeadHandle(u64),
    #[error("memory limit exceeded")]
    MemoryLimit,
    #[error("execution timed out")]
    Timeout,
    #[error("engine terminated")]
    Terminated,
}

impl EngineError {
    pub fn into_js_error(self) -> JsError {
        match self {
            Self::Script(error) => error,
            Self::DeadHandle(handle) => {
                JsError::new(JsErrorKind::Error, format!("handle {handle} is not live"))
            },
            Self::MemoryLimit => JsError::error("memory limit exceeded"),
            Self::Timeout => JsError::error("execution timed out"),
            Self::Terminated => JsError::error("engine terminated"),
        }
    }
}

impl From<JsError> for EngineError {
    fn from(error: JsError) -> Self {
        Self::Script(error)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<EngineValue, JsError>> + Send>>;

/// A host callable the engine exposes to guest code. Args arrive already
/// reduced to [`EngineValue`]s; the returned future settles the guest call.
pub type NativeCallback = Arc<dyn Fn(Vec<EngineValue>) -> CallbackFuture + Send + Sync>;

/// The abstract JS engine capability the bridge is written against:
/// evaluate source, create callable host callbacks, marshal a handful of
/// native shapes, and release handles. One engine instance backs one guest
/// context, and all calls are serialized by the owner.
#[async_trait]
pub trait Engine: Send {
    async fn eval(&mut self, source: &str) -> EngineResult<EngineValue>;

    /// Calls a guest callable. A returned promise is awaited by the engine.
    async fn call(&mut self, target: JsHandle, args: Vec<EngineValue>) -> EngineResult<EngineValue>;

    fn global(&mut self) -> EngineResult<JsHandle>;

    fn get_property(&mut self, target: JsHandle, name: &str) -> EngineResult<EngineValue>;

    fn set_property(&mut self, target: JsHandle, name: &str, value: EngineValue)
        -> EngineResult<()>;

    fn list_properties(&mut self, target: JsHandle) -> EngineResult<Vec<String>>;

    /// Materializes a value in the guest and hands back its handle.
    fn alloc(&mut self, value: EngineValue) -> EngineResult<JsHandle>;

    /// Creates a callable guest value backed by a host callback.
    fn create_callback(&mut self, callback: NativeCallback) -> EngineResult<JsHandle>;

    fn set_global_callback(&mut self, name: &str, callback: NativeCallback) -> EngineResult<()>;

    fn set_global(&mut self, name: &str, value: EngineValue) -> EngineResult<()>;

    fn release_handle(&mut self, handle: JsHandle) -> EngineResult<()>;

    fn set_memory_limit(&mut self, limit_mb: u32) -> EngineResult<()>;
}
