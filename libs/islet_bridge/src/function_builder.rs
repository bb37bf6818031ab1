// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use islet_utils::error::JsError;

use crate::{
    engine::{Engine, EngineError, EngineValue, NativeCallback},
    value::{HostFuture, HostValue},
};

fn prefixed(error: JsError) -> JsError {
    JsError::error(error.encode_prefixed())
}

/// Registers a plain synchronous host function under `name` on the guest
/// global.
pub fn define_function(
    engine: &mut dyn Engine,
    name: &str,
    func: impl Fn(Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
) -> Result<(), JsError> {
    let callback: NativeCallback = Arc::new(move |args: Vec<EngineValue>| {
        let host_args: Vec<HostValue> = args.into_iter().map(HostValue::from_engine).collect();
        let result = func(host_args)
            .and_then(|value| value.to_engine())
            .map_err(prefixed);
        Box::pin(async move { result })
    });
    engine
        .set_global_callback(name, callback)
        .map_err(EngineError::into_js_error)
}

/// Registers an async host function. The guest call blocks until the host
/// future settles (apply-sync-promise semantics on the engine side).
pub fn define_async_function(
    engine: &mut dyn Engine,
    name: &str,
    func: impl Fn(Vec<HostValue>) -> HostFuture + Send + Sync + 'static,
) -> Result<(), JsError> {
    let func = Arc::new(func);
    let callback: NativeCallback = Arc::new(move |args: Vec<EngineValue>| {
        let func = func.clone();
        Box::pin(async move {
            let host_args: Vec<HostValue> =
                args.into_iter().map(HostValue::from_engine).collect();
            let result = func(host_args).await.map_err(prefixed)?;
            result.to_engine().map_err(prefixed)
        })
    });
    engine
        .set_global_callback(name, callback)
        .map_err(EngineError::into_js_error)
}

