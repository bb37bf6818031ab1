// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use islet_utils::error::JsError;
use tracing::trace;

use crate::{
    engine::{Engine, EngineError},
    value::HostValue,
    JsHandle,
};

/// An adoption region for engine handles. Adopted handles are released in
/// LIFO order when the scope exits, success or failure alike; release
/// failures on already-dead handles are swallowed.
#[derive(Default)]
pub struct Scope {
    handles: Mutex<Vec<JsHandle>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a handle for release at scope exit.
    pub fn manage(&self, handle: JsHandle) -> JsHandle {
        self.handles.lock().unwrap().push(handle);
        handle
    }

    /// Marshal-and-adopt: materializes the value in the guest and adopts
    /// the resulting handle.
    pub fn marshal(&self, engine: &mut dyn Engine, value: &HostValue) -> Result<JsHandle, JsError> {
        let engine_value = value.to_engine()?;
        let handle = engine
            .alloc(engine_value)
            .map_err(EngineError::into_js_error)?;
        Ok(self.manage(handle))
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_all(&self, engine: &mut dyn Engine) {
        let mut handles = self.handles.lock().unwrap();
        while let Some(handle) = handles.pop() {
            if let Err(error) = engine.release_handle(handle) {
                trace!("ignoring release failure for handle {}: {error}", handle.0);
            }
        }
    }
}

/// Runs `body` with a scope; handles adopted during the body are released
/// when it returns, in reverse adoption order.
pub fn with_scope<R>(
    engine: &mut dyn Engine,
    body: impl FnOnce(&Scope, &mut dyn Engine) -> Result<R, JsError>,
) -> Result<R, JsError> {
    let scope = Scope::new();
    let result = body(&scope, engine);
    scope.release_all(engine);
    result
}

/// Async twin of [`with_scope`]; release order is preserved across
/// suspension points because handles only leave the scope at exit.
pub async fn with_scope_async<R, F, Fut>(
    engine: &tokio::sync::Mutex<Box<dyn Engine>>,
    body: F,
) -> Result<R, JsError>
where
    F: FnOnce(Arc<Scope>) -> Fut,
    Fut: Future<Output = Result<R, JsError>>,
{
    let scope = Arc::new(Scope::new());
    let result = body(scope.clone()).await;
    scope.release_all(&mut **engine.lock().await);
    result
}

/// Per-context set of handles allocated while unmarshalling guest values.
/// Request-scoped work may leak into it; the runtime bulk-releases at
/// teardown.
#[derive(Clone, Default)]
pub struct HandleTracker {
    handles: Arc<Mutex<Vec<JsHandle>>>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: JsHandle) -> JsHandle {
        self.handles.lock().unwrap().push(handle);
        handle
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Releases every tracked handle, newest first, swallowing failures on
    /// dead handles.
    pub fn cleanup_unmarshaled_handles(&self, engine: &mut dyn Engine) {
        let mut handles = self.handles.lock().unwrap();
        while let Some(handle) = handles.pop() {
            if let Err(error) = engine.release_handle(handle) {
                trace!(
                    "ignoring release failure for unmarshaled handle {}: {error}",
                    handle.0
                );
            }
        }
    }
}

