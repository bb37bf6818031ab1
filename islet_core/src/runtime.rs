// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use islet_bridge::{
    ClassRegistry, Engine, EngineError, EngineResult, EngineValue, HandleTracker,
    InstanceRegistry, JsHandle,
};
use islet_utils::error::JsError;
use tracing::debug;

use crate::{outbound::OutboundHandlers, setup_core::setup_core};

#[derive(Clone, Copy, Debug, Default)]
pub struct TestEnvConfig {
    pub test_timeout_ms: Option<u64>,
}

pub struct ContextOptions {
    pub memory_limit_mb: Option<u32>,
    pub cwd: String,
    pub namespace_id: Option<String>,
    pub test_env: Option<TestEnvConfig>,
    pub outbound: OutboundHandlers,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            memory_limit_mb: None,
            cwd: "/".to_string(),
            namespace_id: None,
            test_env: None,
            outbound: OutboundHandlers::default(),
        }
    }
}

/// One guest execution scope. Owns the engine, the instance-state map, the
/// tracker for handles produced while unmarshalling, and the class table.
/// All engine access is serialized through one async mutex, which stands
/// in for the context's affinity thread.
pub struct IsolateContext {
    id: AtomicU64,
    engine: tokio::sync::Mutex<Box<dyn Engine>>,
    pub instances: InstanceRegistry,
    pub classes: ClassRegistry,
    unmarshaled: HandleTracker,
    pub outbound: OutboundHandlers,
    cwd: String,
    namespace_id: Option<String>,
    test_env: Option<TestEnvConfig>,
    disposed: AtomicBool,
}

impl IsolateContext {
    /// Builds a context over a fresh engine and installs the core web API
    /// surface into its global scope.
    pub async fn new(mut engine: Box<dyn Engine>, options: ContextOptions) -> Result<Arc<Self>, JsError> {
        if let Some(limit) = options.memory_limit_mb {
            engine
                .set_memory_limit(limit)
                .map_err(EngineError::into_js_error)?;
        }
        let context = Arc::new(Self {
            id: AtomicU64::new(0),
            engine: tokio::sync::Mutex::new(engine),
            instances: InstanceRegistry::new(),
            classes: ClassRegistry::new(),
            unmarshaled: HandleTracker::new(),
            outbound: options.outbound,
            cwd: options.cwd,
            namespace_id: options.namespace_id,
            test_env: options.test_env,
            disposed: AtomicBool::new(false),
        });
        setup_core(&context).await?;
        Ok(context)
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn namespace_id(&self) -> Option<&str> {
        self.namespace_id.as_deref()
    }

    pub fn test_env(&self) -> Option<TestEnvConfig> {
        self.test_env
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn check_live(&self) -> EngineResult<()> {
        if self.is_disposed() {
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    /// Evaluates guest source on the context's engine.
    pub async fn evaluate(&self, source: &str) -> EngineResult<EngineValue> {
        self.check_live()?;
        self.engine.lock().await.eval(source).await
    }

    /// Runs a closure with exclusive engine access.
    pub async fn with_engine<R>(
        &self,
        access: impl FnOnce(&mut dyn Engine) -> R,
    ) -> EngineResult<R> {
        self.check_live()?;
        let mut engine = self.engine.lock().await;
        Ok(access(&mut **engine))
    }

    /// Calls a guest callable, awaiting its settlement.
    pub async fn call_handle(
        &self,
        target: JsHandle,
        args: Vec<EngineValue>,
    ) -> EngineResult<EngineValue> {
        self.check_live()?;
        self.engine.lock().await.call(target, args).await
    }

    pub(crate) fn engine_mutex(&self) -> &tokio::sync::Mutex<Box<dyn Engine>> {
        &self.engine
    }

    pub fn track_unmarshaled(&self, handle: JsHandle) -> JsHandle {
        self.unmarshaled.track(handle)
    }

    pub fn unmarshaled_handles(&self) -> usize {
        self.unmarshaled.len()
    }

    /// Full teardown: releases unmarshalled handles and drops all instance
    /// state. The context rejects further operations.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing isolate {}", self.id());
        let mut engine = self.engine.lock().await;
        self.unmarshaled.cleanup_unmarshaled_handles(&mut **engine);
        self.instances.clear();
    }

    /// Lighter teardown used when the context is parked in a namespace
    /// pool: request-scoped handles are released, but globals and instance
    /// state survive for warm reuse.
    pub async fn park(&self) {
        let mut engine = self.engine.lock().await;
        self.unmarshaled.cleanup_unmarshaled_handles(&mut **engine);
    }
}

#[cfg(test)]
mod tests {
    use islet_test::MockEngine;

    use super::*;

    async fn test_context() -> (Arc<IsolateContext>, islet_test::EngineProbe) {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let context = IsolateContext::new(Box::new(engine), ContextOptions::default())
            .await
            .unwrap();
        (context, probe)
    }

    #[tokio::test]
    async fn creation_installs_the_core_surface() {
        let (_context, probe) = test_context().await;
        // The prelude plus one generated class per global.
        assert!(probe.eval_count() > 10);
        for name in [
            "__TextEncoder_construct",
            "__TextDecoder_construct",
            "__URL_construct",
            "__Blob_construct",
            "__File_construct",
            "__ReadableStream_construct",
            "__WritableStream_construct",
            "__TransformStream_construct",
            "__DOMException_construct",
            "__AbortController_construct",
            "structuredClone",
        ] {
            assert!(probe.has_global(name), "missing global {name}");
        }
    }

    #[tokio::test]
    async fn memory_limit_is_forwarded_to_the_engine() {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let options = ContextOptions {
            memory_limit_mb: Some(128),
            ..ContextOptions::default()
        };
        IsolateContext::new(Box::new(engine), options).await.unwrap();
        assert_eq!(probe.memory_limit_mb(), Some(128));
    }

    #[tokio::test]
    async fn dispose_clears_state_and_rejects_evaluation() {
        let (context, _probe) = test_context().await;
        context.instances.insert(1u8);
        context.dispose().await;

        assert!(context.is_disposed());
        assert!(context.instances.is_empty());
        assert!(matches!(
            context.evaluate("1").await,
            Err(EngineError::Terminated)
        ));
    }

    #[tokio::test]
    async fn park_releases_tracked_handles_but_keeps_instances() {
        let (context, probe) = test_context().await;
        context.instances.insert(1u8);
        let handle = probe.make_handle();
        context.track_unmarshaled(handle);

        context.park().await;
        assert_eq!(context.unmarshaled_handles(), 0);
        assert!(!probe.is_live(handle));
        assert!(!context.instances.is_empty());
        assert!(!context.is_disposed());
    }
}
