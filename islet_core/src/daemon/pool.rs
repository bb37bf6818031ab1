// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::runtime::IsolateContext;

/// Cache of parked runtimes keyed by a client-supplied namespace id. A
/// disposed runtime with a namespace returns here; the next CREATE_RUNTIME
/// with the same key reuses it warm instead of cold-creating a context.
pub struct NamespacePool {
    parked: Mutex<FxHashMap<String, Vec<Arc<IsolateContext>>>>,
    max_per_namespace: usize,
}

impl NamespacePool {
    pub fn new(max_per_namespace: usize) -> Self {
        Self {
            parked: Mutex::new(FxHashMap::default()),
            max_per_namespace,
        }
    }

    pub fn take(&self, namespace_id: &str) -> Option<Arc<IsolateContext>> {
        self.parked
            .lock()
            .unwrap()
            .get_mut(namespace_id)
            .and_then(Vec::pop)
    }

    /// Parks a runtime. Returns `false` when the namespace is full; the
    /// caller should dispose the runtime instead.
    pub fn put(&self, namespace_id: &str, context: Arc<IsolateContext>) -> bool {
        let mut parked = self.parked.lock().unwrap();
        let entry = parked.entry(namespace_id.to_string()).or_default();
        if entry.len() >= self.max_per_namespace {
            return false;
        }
        entry.push(context);
        true
    }

    pub fn len(&self) -> usize {
        self.parked.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NamespacePool {
    fn default() -> Self {
        Self::new(4)
    }
}
