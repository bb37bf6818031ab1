// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use fxhash::FxHashMap;
use islet_utils::{error::JsError, id::IdAllocator};

/// Per-context map of instance id → host state. Every guest object created
/// through the class builder holds only its id; the state lives here for
/// the life of the context.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    map: Mutex<FxHashMap<u64, Box<dyn Any + Send>>>,
    ids: IdAllocator,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores state under a fresh id, unique for the life of the context.
    pub fn insert<T: Any + Send>(&self, state: T) -> u64 {
        let id = self.inner.ids.next();
        self.inner.map.lock().unwrap().insert(id, Box::new(state));
        id
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.map.lock().unwrap().contains_key(&id)
    }

    /// Runs `access` against the state for `id`. Missing ids and state of
    /// the wrong type both surface the synthetic not-found error the guest
    /// shim expects.
    pub fn with<T: Any + Send, R>(
        &self,
        id: u64,
        access: impl FnOnce(&mut T) -> R,
    ) -> Result<R, JsError> {
        let mut map = self.inner.map.lock().unwrap();
        let state = map
            .get_mut(&id)
            .and_then(|state| state.downcast_mut::<T>())
            .ok_or_else(|| JsError::error(format!("Instance {id} not found")))?;
        Ok(access(state))
    }

    /// Clones the state out, for types with cheap clones.
    pub fn get<T: Any + Send + Clone>(&self, id: u64) -> Result<T, JsError> {
        self.with(id, |state: &mut T| state.clone())
    }

    pub fn remove(&self, id: u64) -> bool {
        self.inner.map.lock().unwrap().remove(&id).is_some()
    }

    /// Bulk release at context teardown.
    pub fn clear(&self) {
        self.inner.map.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
