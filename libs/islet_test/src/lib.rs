// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test support: an in-memory [`Engine`] that records evaluated sources,
//! stores globals and handles, and lets tests invoke registered host
//! callbacks the way guest code would.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use fxhash::{FxHashMap, FxHashSet};
use islet_bridge::{
    Engine, EngineError, EngineResult, EngineValue, JsHandle, NativeCallback,
};
use islet_utils::error::JsError;

const GLOBAL_HANDLE: u64 = 1;

#[derive(Default)]
struct MockState {
    next_handle: u64,
    evals: Vec<String>,
    scripted_evals: VecDeque<EngineResult<EngineValue>>,
    objects: FxHashMap<u64, Vec<(String, EngineValue)>>,
    values: FxHashMap<u64, EngineValue>,
    callbacks: FxHashMap<u64, NativeCallback>,
    live: FxHashSet<u64>,
    released: Vec<u64>,
    memory_limit_mb: Option<u32>,
}

impl MockState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        let id = self.next_handle;
        self.live.insert(id);
        id
    }
}

/// Shared view into a [`MockEngine`], usable after the engine was boxed
/// into a runtime.
#[derive(Clone)]
pub struct EngineProbe {
    state: Arc<Mutex<MockState>>,
}

impl EngineProbe {
    pub fn evals(&self) -> Vec<String> {
        self.state.lock().unwrap().evals.clone()
    }

    pub fn eval_count(&self) -> usize {
        self.state.lock().unwrap().evals.len()
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn is_live(&self, handle: JsHandle) -> bool {
        self.state.lock().unwrap().live.contains(&handle.0)
    }

    pub fn memory_limit_mb(&self) -> Option<u32> {
        self.state.lock().unwrap().memory_limit_mb
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.global_value(name).is_some()
    }

    pub fn global_value(&self, name: &str) -> Option<EngineValue> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&GLOBAL_HANDLE)?
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    /// Queues the result of the next `eval`.
    pub fn script_eval(&self, result: EngineResult<EngineValue>) {
        self.state
            .lock()
            .unwrap()
            .scripted_evals
            .push_back(result);
    }

    /// Creates a fresh live handle, as if the guest allocated something.
    pub fn make_handle(&self) -> JsHandle {
        JsHandle(self.state.lock().unwrap().fresh_handle())
    }

    fn callback_for(&self, name: &str) -> Result<NativeCallback, JsError> {
        let state = self.state.lock().unwrap();
        let handle = state
            .objects
            .get(&GLOBAL_HANDLE)
            .and_then(|globals| globals.iter().find(|(key, _)| key == name))
            .and_then(|(_, value)| match value {
                EngineValue::Handle(handle) => Some(handle.0),
                _ => None,
            })
            .ok_or_else(|| JsError::reference_error([name, " is not defined"].concat()))?;
        state
            .callbacks
            .get(&handle)
            .cloned()
            .ok_or_else(|| JsError::type_error([name, " is not a function"].concat()))
    }

    /// Invokes a registered global host callback the way a guest trampoline
    /// would, returning its settled result.
    pub async fn invoke_global(
        &self,
        name: &str,
        args: Vec<EngineValue>,
    ) -> Result<EngineValue, JsError> {
        let callback = self.callback_for(name)?;
        callback(args).await
    }
}

/// In-memory engine. Sources are recorded, not executed; handle-based state
/// behaves like a tiny object store.
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.next_handle = GLOBAL_HANDLE;
        state.live.insert(GLOBAL_HANDLE);
        state.objects.insert(GLOBAL_HANDLE, Vec::new());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn probe(&self) -> EngineProbe {
        EngineProbe {
            state: self.state.clone(),
        }
    }

    pub fn make_handle(&mut self) -> JsHandle {
        JsHandle(self.state.lock().unwrap().fresh_handle())
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().unwrap().released.clone()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn set_object_property(
    state: &mut MockState,
    target: u64,
    name: &str,
    value: EngineValue,
) -> EngineResult<()> {
    let object = state
        .objects
        .get_mut(&target)
        .ok_or(EngineError::DeadHandle(target))?;
    match object.iter_mut().find(|(key, _)| key == name) {
        Some((_, existing)) => *existing = value,
        None => object.push((name.to_string(), value)),
    }
    Ok(())
}

#[async_trait]
impl Engine for MockEngine {
    async fn eval(&mut self, source: &str) -> EngineResult<EngineValue> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.evals.push(source.to_string());
            state.scripted_evals.pop_front()
        };
        scripted.unwrap_or(Ok(EngineValue::Undefined))
    }

    async fn call(&mut self, target: JsHandle, args: Vec<EngineValue>) -> EngineResult<EngineValue> {
        let callback = {
            let state = self.state.lock().unwrap();
            if !state.live.contains(&target.0) {
                return Err(EngineError::DeadHandle(target.0));
            }
            state.callbacks.get(&target.0).cloned()
        };
        match callback {
            Some(callback) => callback(args).await.map_err(EngineError::Script),
            None => Err(EngineError::Script(JsError::type_error(
                "target is not callable",
            ))),
        }
    }

    fn global(&mut self) -> EngineResult<JsHandle> {
        Ok(JsHandle(GLOBAL_HANDLE))
    }

    fn get_property(&mut self, target: JsHandle, name: &str) -> EngineResult<EngineValue> {
        let state = self.state.lock().unwrap();
        let object = state
            .objects
            .get(&target.0)
            .ok_or(EngineError::DeadHandle(target.0))?;
        Ok(object
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .unwrap_or(EngineValue::Undefined))
    }

    fn set_property(
        &mut self,
        target: JsHandle,
        name: &str,
        value: EngineValue,
    ) -> EngineResult<()> {
        set_object_property(&mut self.state.lock().unwrap(), target.0, name, value)
    }

    fn list_properties(&mut self, target: JsHandle) -> EngineResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let object = state
            .objects
            .get(&target.0)
            .ok_or(EngineError::DeadHandle(target.0))?;
        Ok(object.iter().map(|(key, _)| key.clone()).collect())
    }

    fn alloc(&mut self, value: EngineValue) -> EngineResult<JsHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        match value {
            EngineValue::Object(entries) => {
                state.objects.insert(handle, entries);
            },
            other => {
                state.values.insert(handle, other);
            },
        }
        Ok(JsHandle(handle))
    }

    fn create_callback(&mut self, callback: NativeCallback) -> EngineResult<JsHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.callbacks.insert(handle, callback);
        Ok(JsHandle(handle))
    }

    fn set_global_callback(&mut self, name: &str, callback: NativeCallback) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.callbacks.insert(handle, callback);
        set_object_property(&mut state, GLOBAL_HANDLE, name, EngineValue::Handle(JsHandle(handle)))
    }

    fn set_global(&mut self, name: &str, value: EngineValue) -> EngineResult<()> {
        set_object_property(&mut self.state.lock().unwrap(), GLOBAL_HANDLE, name, value)
    }

    fn release_handle(&mut self, handle: JsHandle) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.live.remove(&handle.0) {
            return Err(EngineError::DeadHandle(handle.0));
        }
        state.released.push(handle.0);
        state.values.remove(&handle.0);
        state.callbacks.remove(&handle.0);
        if handle.0 != GLOBAL_HANDLE {
            state.objects.remove(&handle.0);
        }
        Ok(())
    }

    fn set_memory_limit(&mut self, limit_mb: u32) -> EngineResult<()> {
        self.state.lock().unwrap().memory_limit_mb = Some(limit_mb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_evals_and_scripts_results() {
        let mut engine = MockEngine::new();
        let probe = engine.probe();

        probe.script_eval(Ok(EngineValue::Number(3.0)));
        assert_eq!(engine.eval("1 + 2").await.unwrap(), EngineValue::Number(3.0));
        assert_eq!(engine.eval("noop()").await.unwrap(), EngineValue::Undefined);
        assert_eq!(probe.evals(), vec!["1 + 2", "noop()"]);
    }

    #[tokio::test]
    async fn global_callbacks_are_invokable() {
        let mut engine = MockEngine::new();
        engine
            .set_global_callback(
                "double",
                Arc::new(|args| {
                    Box::pin(async move {
                        let n = args[0].as_number().unwrap_or_default();
                        Ok(EngineValue::Number(n * 2.0))
                    })
                }),
            )
            .unwrap();

        let probe = engine.probe();
        let result = probe
            .invoke_global("double", vec![EngineValue::Number(21.0)])
            .await
            .unwrap();
        assert_eq!(result, EngineValue::Number(42.0));

        let err = probe.invoke_global("missing", vec![]).await.unwrap_err();
        assert_eq!(err.name(), "ReferenceError");
    }

    #[tokio::test]
    async fn handles_live_and_release_once() {
        let mut engine = MockEngine::new();
        let handle = engine.alloc(EngineValue::Number(1.0)).unwrap();
        let probe = engine.probe();
        assert!(probe.is_live(handle));

        engine.release_handle(handle).unwrap();
        assert!(!probe.is_live(handle));
        assert!(matches!(
            engine.release_handle(handle),
            Err(EngineError::DeadHandle(_))
        ));
    }

    #[tokio::test]
    async fn object_properties_round_trip() {
        let mut engine = MockEngine::new();
        let object = engine
            .alloc(EngineValue::Object(vec![(
                "a".to_string(),
                EngineValue::Number(1.0),
            )]))
            .unwrap();
        engine
            .set_property(object, "b", EngineValue::String("two".to_string()))
            .unwrap();

        assert_eq!(
            engine.get_property(object, "a").unwrap(),
            EngineValue::Number(1.0)
        );
        assert_eq!(
            engine.get_property(object, "missing").unwrap(),
            EngineValue::Undefined
        );
        assert_eq!(engine.list_properties(object).unwrap(), vec!["a", "b"]);
    }
}
