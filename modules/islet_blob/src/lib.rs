// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
mod blob;
mod file;

pub use blob::{BlobPart, BlobState, EndingType};
pub use file::FileState;
