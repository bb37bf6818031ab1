// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};
use std::time::Duration;

use islet_exceptions::DOMException;
use islet_utils::error::JsError;
use tokio::sync::watch;

type AbortListener = Box<dyn FnOnce(&JsError) + Send>;

struct SignalState {
    aborted: bool,
    reason: Option<JsError>,
    listeners: Vec<AbortListener>,
}

/// Host-side AbortSignal. The `abort` event fires at most once; listeners
/// registered after the signal aborted are never invoked.
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<Mutex<SignalState>>,
    notify: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(SignalState {
                aborted: false,
                reason: None,
                listeners: Vec::new(),
            })),
            notify: Arc::new(notify),
        }
    }

    /// Static `AbortSignal.abort(reason)`: an already-aborted signal.
    pub fn already_aborted(reason: Option<JsError>) -> Self {
        let signal = Self::new();
        signal.send_aborted(reason);
        signal
    }

    /// Static `AbortSignal.timeout(ms)`: aborts with a `TimeoutError` after
    /// the given delay. Requires a running tokio runtime.
    pub fn timeout(ms: u64) -> Self {
        let signal = Self::new();
        let timed = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            timed.send_aborted(Some(
                DOMException::timeout_error("The operation timed out").into(),
            ));
        });
        signal
    }

    /// Static `AbortSignal.any(signals)`: aborts when the first dependent
    /// signal aborts, adopting its reason.
    pub fn any(signals: &[AbortSignal]) -> Self {
        for signal in signals {
            if signal.aborted() {
                return Self::already_aborted(signal.reason());
            }
        }
        let combined = Self::new();
        for signal in signals {
            let combined = combined.clone();
            signal.add_abort_listener(move |reason| {
                combined.send_aborted(Some(reason.clone()));
            });
        }
        combined
    }

    pub fn aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub fn reason(&self) -> Option<JsError> {
        self.state.lock().unwrap().reason.clone()
    }

    pub fn throw_if_aborted(&self) -> Result<(), JsError> {
        let state = self.state.lock().unwrap();
        if state.aborted {
            return Err(state
                .reason
                .clone()
                .unwrap_or_else(|| DOMException::abort_error("This operation was aborted").into()));
        }
        Ok(())
    }

    pub fn add_abort_listener(&self, listener: impl FnOnce(&JsError) + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return;
        }
        state.listeners.push(Box::new(listener));
    }

    /// Resolves once the signal aborts, with the abort reason. Pending
    /// forever on a signal that never aborts.
    pub async fn wait_aborted(&self) -> JsError {
        let mut watcher = self.notify.subscribe();
        loop {
            if *watcher.borrow() {
                return self
                    .reason()
                    .unwrap_or_else(|| DOMException::abort_error("This operation was aborted").into());
            }
            if watcher.changed().await.is_err() {
                // Sender dropped without aborting; park forever like a
                // signal that never fires.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn send_aborted(&self, reason: Option<JsError>) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.aborted {
                //only once
                return;
            }
            state.aborted = true;
            state.reason = Some(reason.unwrap_or_else(|| {
                DOMException::abort_error("This operation was aborted").into()
            }));
            std::mem::take(&mut state.listeners)
        };
        let reason = self.reason().expect("reason set above");
        for listener in listeners {
            listener(&reason);
        }
        let _ = self.notify.send(true);
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn abort_fires_listeners_exactly_once() {
        let signal = AbortSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        signal.add_abort_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.send_aborted(Some(JsError::error("first")));
        signal.send_aborted(Some(JsError::error("second")));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(signal.reason().unwrap().message, "first");
    }

    #[test]
    fn listeners_after_abort_never_fire() {
        let signal = AbortSignal::already_aborted(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        signal.add_abort_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn throw_if_aborted_surfaces_the_reason() {
        let signal = AbortSignal::new();
        assert!(signal.throw_if_aborted().is_ok());

        signal.send_aborted(Some(JsError::type_error("stop")));
        let err = signal.throw_if_aborted().unwrap_err();
        assert_eq!(err.message, "stop");
    }

    #[test]
    fn default_reason_is_an_abort_error() {
        let signal = AbortSignal::already_aborted(None);
        let reason = signal.reason().unwrap();
        assert_eq!(reason.name(), "AbortError");
    }

    #[test]
    fn any_adopts_the_first_reason() {
        let first = AbortSignal::new();
        let second = AbortSignal::new();
        let combined = AbortSignal::any(&[first.clone(), second.clone()]);
        assert!(!combined.aborted());

        second.send_aborted(Some(JsError::error("second went first")));
        assert!(combined.aborted());
        assert_eq!(combined.reason().unwrap().message, "second went first");
    }

    #[tokio::test]
    async fn timeout_aborts_with_timeout_error() {
        let signal = AbortSignal::timeout(5);
        assert!(!signal.aborted());
        let reason = signal.wait_aborted().await;
        assert_eq!(reason.name(), "TimeoutError");
    }

    #[tokio::test]
    async fn wait_aborted_resolves_for_past_aborts() {
        let signal = AbortSignal::already_aborted(Some(JsError::error("done")));
        assert_eq!(signal.wait_aborted().await.message, "done");
    }
}
