// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
mod abort_controller;
mod abort_signal;

pub use abort_controller::AbortController;
pub use abort_signal::AbortSignal;
