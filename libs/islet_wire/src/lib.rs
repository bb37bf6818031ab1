// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol shared by the daemon and its clients: length-prefixed
//! frames carrying MessagePack payloads with a registered extension table.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod refs;
pub mod value;

pub use error::{ErrorCode, ErrorRecord, WireError};
pub use frame::{build_frame, FrameParser, RawFrame, DEFAULT_MAX_FRAME_SIZE};
pub use message::{Message, MessageType, Request, RequestOp, RuntimeOptions};
pub use refs::Ref;
pub use value::WireValue;
