// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_utils::error::JsError;

use super::AbortSignal;

pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self, reason: Option<JsError>) {
        self.signal.send_aborted(reason);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reaches_the_signal() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());

        controller.abort(Some(JsError::error("cancelled")));
        assert!(signal.aborted());
        assert_eq!(signal.reason().unwrap().message, "cancelled");

        // A second abort keeps the original reason.
        controller.abort(Some(JsError::error("again")));
        assert_eq!(signal.reason().unwrap().message, "cancelled");
    }
}
