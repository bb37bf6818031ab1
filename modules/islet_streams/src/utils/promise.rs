// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

enum PromiseState<T> {
    Pending(Vec<oneshot::Sender<T>>),
    Settled(T),
}

/// A settle-once, multi-waiter promise. Stream lifecycle promises (`closed`)
/// need exactly this: late waiters observe the settled value, and a second
/// settle is a no-op rather than an error.
pub struct Promise<T: Clone> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T: Clone> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Pending(Vec::new()))),
        }
    }

    /// Settles the promise. Returns `false` when it was already settled, in
    /// which case the value is dropped.
    pub fn settle(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                PromiseState::Settled(_) => return false,
                PromiseState::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = PromiseState::Settled(value.clone());
                    waiters
                },
            }
        };
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), PromiseState::Settled(_))
    }

    pub fn peek(&self) -> Option<T> {
        match &*self.state.lock().unwrap() {
            PromiseState::Settled(value) => Some(value.clone()),
            PromiseState::Pending(_) => None,
        }
    }

    pub async fn wait(&self) -> T {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                PromiseState::Settled(value) => return value.clone(),
                PromiseState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                },
            }
        };
        match receiver.await {
            Ok(value) => value,
            // All senders live in the shared state we hold a reference to;
            // a closed channel means the settle raced our registration.
            Err(_) => self.peek().expect("promise settled"),
        }
    }
}

impl<T: Clone + Send> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settles_once_and_remembers() {
        let promise: Promise<u32> = Promise::new();
        assert!(!promise.is_settled());
        assert!(promise.settle(1));
        assert!(!promise.settle(2));
        assert_eq!(promise.peek(), Some(1));
        assert_eq!(promise.wait().await, 1);
    }

    #[tokio::test]
    async fn wakes_registered_waiters() {
        let promise: Promise<&'static str> = Promise::new();
        let waiter = promise.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        promise.settle("done");
        assert_eq!(task.await.unwrap(), "done");
    }
}
