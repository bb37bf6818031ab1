// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use bytes::Bytes;

use crate::{
    codec::{decode_value, encode_value},
    error::{ErrorRecord, WireError},
    frame::{build_frame, RawFrame},
    value::WireValue,
};

/// The message-type code table. Codes are stable wire contract; gaps inside
/// a range are reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Runtime operations
    CreateRuntime = 0x01,
    DisposeRuntime = 0x02,
    Evaluate = 0x03,
    CallFunction = 0x04,
    // WebSocket bridging (reserved, handled outside the core)
    WsConnect = 0x10,
    WsMessage = 0x11,
    WsClose = 0x12,
    // Handle operations
    GetProperty = 0x13,
    SetProperty = 0x14,
    CallMethod = 0x15,
    CallHandle = 0x16,
    AwaitPromise = 0x17,
    IteratorNext = 0x18,
    IteratorReturn = 0x19,
    ReleaseHandle = 0x1A,
    ListProperties = 0x1B,
    // Test environment (reserved, handled outside the core)
    TestCreate = 0x21,
    TestRun = 0x22,
    TestEvent = 0x23,
    TestDispose = 0x24,
    // Responses
    ResponseOk = 0x80,
    ResponseError = 0x81,
    ResponseStreamStart = 0x82,
    ResponseStreamChunk = 0x83,
    ResponseStreamEnd = 0x84,
    // Callbacks
    CallbackInvoke = 0x90,
    CallbackResponse = 0x91,
    CallbackError = 0x92,
    PromiseSettle = 0x93,
    CallbackIteratorNext = 0x94,
    CallbackIteratorResult = 0x95,
    // Callback stream data
    CallbackStreamStart = 0xA0,
    CallbackStreamChunk = 0xA1,
    CallbackStreamEnd = 0xA2,
    CallbackStreamCancel = 0xA3,
    // Events
    Event = 0xC0,
    EventAck = 0xC1,
    // Heartbeat
    Ping = 0xF0,
    Pong = 0xF1,
}

impl MessageType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::CreateRuntime,
            0x02 => Self::DisposeRuntime,
            0x03 => Self::Evaluate,
            0x04 => Self::CallFunction,
            0x10 => Self::WsConnect,
            0x11 => Self::WsMessage,
            0x12 => Self::WsClose,
            0x13 => Self::GetProperty,
            0x14 => Self::SetProperty,
            0x15 => Self::CallMethod,
            0x16 => Self::CallHandle,
            0x17 => Self::AwaitPromise,
            0x18 => Self::IteratorNext,
            0x19 => Self::IteratorReturn,
            0x1A => Self::ReleaseHandle,
            0x1B => Self::ListProperties,
            0x21 => Self::TestCreate,
            0x22 => Self::TestRun,
            0x23 => Self::TestEvent,
            0x24 => Self::TestDispose,
            0x80 => Self::ResponseOk,
            0x81 => Self::ResponseError,
            0x82 => Self::ResponseStreamStart,
            0x83 => Self::ResponseStreamChunk,
            0x84 => Self::ResponseStreamEnd,
            0x90 => Self::CallbackInvoke,
            0x91 => Self::CallbackResponse,
            0x92 => Self::CallbackError,
            0x93 => Self::PromiseSettle,
            0x94 => Self::CallbackIteratorNext,
            0x95 => Self::CallbackIteratorResult,
            0xA0 => Self::CallbackStreamStart,
            0xA1 => Self::CallbackStreamChunk,
            0xA2 => Self::CallbackStreamEnd,
            0xA3 => Self::CallbackStreamCancel,
            0xC0 => Self::Event,
            0xC1 => Self::EventAck,
            0xF0 => Self::Ping,
            0xF1 => Self::Pong,
            _ => return None,
        })
    }
}

/// Per-test-run settings forwarded by `CREATE_RUNTIME` when the client asks
/// for a test environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestEnvOptions {
    pub test_timeout_ms: Option<u64>,
}

/// Callback ids the client registered for outbound integrations. Ids refer
/// to callables living on the client side of the connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallbackRegistrations {
    pub console: Option<u64>,
    pub fetch: Option<u64>,
    pub fs: Option<FsCallbacks>,
    pub module_loader: Option<u64>,
    pub playwright: Option<u64>,
    pub custom_functions: Vec<CustomFunctionRegistration>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FsCallbacks {
    pub read_file: Option<u64>,
    pub write_file: Option<u64>,
    pub stat: Option<u64>,
    pub read_dir: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CustomFunctionRegistration {
    pub name: String,
    pub callback_id: u64,
    pub is_async: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeOptions {
    pub memory_limit_mb: Option<u32>,
    pub cwd: Option<String>,
    pub namespace_id: Option<String>,
    pub test_env: Option<TestEnvOptions>,
    pub callbacks: CallbackRegistrations,
}

/// Operations a client can request. Each variant corresponds to one request
/// message-type code.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestOp {
    CreateRuntime(RuntimeOptions),
    DisposeRuntime {
        isolate_id: u64,
    },
    Evaluate {
        isolate_id: u64,
        source: String,
        filename: Option<String>,
    },
    CallFunction {
        isolate_id: u64,
        name: String,
        args: Vec<WireValue>,
    },
    GetProperty {
        isolate_id: u64,
        handle_id: u64,
        name: String,
    },
    SetProperty {
        isolate_id: u64,
        handle_id: u64,
        name: String,
        value: WireValue,
    },
    CallMethod {
        isolate_id: u64,
        handle_id: u64,
        name: String,
        args: Vec<WireValue>,
    },
    CallHandle {
        isolate_id: u64,
        handle_id: u64,
        args: Vec<WireValue>,
    },
    AwaitPromise {
        isolate_id: u64,
        promise_id: u64,
    },
    IteratorNext {
        isolate_id: u64,
        iterator_id: u64,
    },
    IteratorReturn {
        isolate_id: u64,
        iterator_id: u64,
    },
    ReleaseHandle {
        isolate_id: u64,
        handle_id: u64,
    },
    ListProperties {
        isolate_id: u64,
        handle_id: u64,
    },
}

impl RequestOp {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::CreateRuntime(_) => MessageType::CreateRuntime,
            Self::DisposeRuntime { .. } => MessageType::DisposeRuntime,
            Self::Evaluate { .. } => MessageType::Evaluate,
            Self::CallFunction { .. } => MessageType::CallFunction,
            Self::GetProperty { .. } => MessageType::GetProperty,
            Self::SetProperty { .. } => MessageType::SetProperty,
            Self::CallMethod { .. } => MessageType::CallMethod,
            Self::CallHandle { .. } => MessageType::CallHandle,
            Self::AwaitPromise { .. } => MessageType::AwaitPromise,
            Self::IteratorNext { .. } => MessageType::IteratorNext,
            Self::IteratorReturn { .. } => MessageType::IteratorReturn,
            Self::ReleaseHandle { .. } => MessageType::ReleaseHandle,
            Self::ListProperties { .. } => MessageType::ListProperties,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub request_id: u64,
    pub op: RequestOp,
}

/// A fully decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    ResponseOk {
        request_id: u64,
        value: WireValue,
    },
    ResponseError {
        request_id: u64,
        error: ErrorRecord,
    },
    ResponseStreamStart {
        request_id: u64,
        stream_id: u64,
    },
    ResponseStreamChunk {
        stream_id: u64,
        chunk: WireValue,
    },
    ResponseStreamEnd {
        stream_id: u64,
        error: Option<ErrorRecord>,
    },
    CallbackInvoke {
        request_id: u64,
        callback_id: u64,
        args: Vec<WireValue>,
    },
    CallbackResponse {
        request_id: u64,
        value: WireValue,
    },
    CallbackError {
        request_id: u64,
        error: ErrorRecord,
    },
    PromiseSettle {
        promise_id: u64,
        result: Result<WireValue, ErrorRecord>,
    },
    CallbackIteratorNext {
        request_id: u64,
        iterator_id: u64,
    },
    CallbackIteratorResult {
        request_id: u64,
        value: WireValue,
        done: bool,
    },
    CallbackStreamStart {
        request_id: u64,
        stream_id: u64,
    },
    CallbackStreamChunk {
        stream_id: u64,
        chunk: WireValue,
    },
    CallbackStreamEnd {
        stream_id: u64,
        error: Option<ErrorRecord>,
    },
    CallbackStreamCancel {
        stream_id: u64,
        reason: Option<ErrorRecord>,
    },
    Event {
        name: String,
        payload: WireValue,
    },
    Ping {
        seq: u64,
    },
    Pong {
        seq: u64,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(request) => request.op.message_type(),
            Self::ResponseOk { .. } => MessageType::ResponseOk,
            Self::ResponseError { .. } => MessageType::ResponseError,
            Self::ResponseStreamStart { .. } => MessageType::ResponseStreamStart,
            Self::ResponseStreamChunk { .. } => MessageType::ResponseStreamChunk,
            Self::ResponseStreamEnd { .. } => MessageType::ResponseStreamEnd,
            Self::CallbackInvoke { .. } => MessageType::CallbackInvoke,
            Self::CallbackResponse { .. } => MessageType::CallbackResponse,
            Self::CallbackError { .. } => MessageType::CallbackError,
            Self::PromiseSettle { .. } => MessageType::PromiseSettle,
            Self::CallbackIteratorNext { .. } => MessageType::CallbackIteratorNext,
            Self::CallbackIteratorResult { .. } => MessageType::CallbackIteratorResult,
            Self::CallbackStreamStart { .. } => MessageType::CallbackStreamStart,
            Self::CallbackStreamChunk { .. } => MessageType::CallbackStreamChunk,
            Self::CallbackStreamEnd { .. } => MessageType::CallbackStreamEnd,
            Self::CallbackStreamCancel { .. } => MessageType::CallbackStreamCancel,
            Self::Event { .. } => MessageType::Event,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
        }
    }

    /// Encodes the message body and wraps it into a wire frame.
    pub fn to_frame(&self) -> Result<Bytes, WireError> {
        let payload = encode_value(&self.to_value())?;
        Ok(build_frame(self.message_type() as u8, &payload))
    }

    pub fn from_frame(frame: &RawFrame) -> Result<Self, WireError> {
        let msg_type = MessageType::from_u8(frame.msg_type)
            .ok_or(WireError::UnknownMessageType(frame.msg_type))?;
        let value = decode_value(&frame.payload)?;
        Self::from_value(msg_type, &value)
    }

    fn to_value(&self) -> WireValue {
        match self {
            Self::Request(request) => request_to_value(request),
            Self::ResponseOk { request_id, value } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("value", value.clone()),
            ]),
            Self::ResponseError { request_id, error } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("error", error.to_value()),
            ]),
            Self::ResponseStreamStart {
                request_id,
                stream_id,
            } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("streamId", WireValue::Uint(*stream_id)),
            ]),
            Self::ResponseStreamChunk { stream_id, chunk } => map(vec![
                ("streamId", WireValue::Uint(*stream_id)),
                ("chunk", chunk.clone()),
            ]),
            Self::ResponseStreamEnd { stream_id, error } => {
                let mut entries = vec![("streamId", WireValue::Uint(*stream_id))];
                if let Some(error) = error {
                    entries.push(("error", error.to_value()));
                }
                map(entries)
            },
            Self::CallbackInvoke {
                request_id,
                callback_id,
                args,
            } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("callbackId", WireValue::Uint(*callback_id)),
                ("args", WireValue::Array(args.clone())),
            ]),
            Self::CallbackResponse { request_id, value } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("value", value.clone()),
            ]),
            Self::CallbackError { request_id, error } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("error", error.to_value()),
            ]),
            Self::PromiseSettle { promise_id, result } => {
                let mut entries = vec![("promiseId", WireValue::Uint(*promise_id))];
                match result {
                    Ok(value) => entries.push(("value", value.clone())),
                    Err(error) => entries.push(("error", error.to_value())),
                }
                map(entries)
            },
            Self::CallbackIteratorNext {
                request_id,
                iterator_id,
            } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("iteratorId", WireValue::Uint(*iterator_id)),
            ]),
            Self::CallbackIteratorResult {
                request_id,
                value,
                done,
            } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("value", value.clone()),
                ("done", WireValue::Bool(*done)),
            ]),
            Self::CallbackStreamStart {
                request_id,
                stream_id,
            } => map(vec![
                ("requestId", WireValue::Uint(*request_id)),
                ("streamId", WireValue::Uint(*stream_id)),
            ]),
            Self::CallbackStreamChunk { stream_id, chunk } => map(vec![
                ("streamId", WireValue::Uint(*stream_id)),
                ("chunk", chunk.clone()),
            ]),
            Self::CallbackStreamEnd { stream_id, error } => {
                let mut entries = vec![("streamId", WireValue::Uint(*stream_id))];
                if let Some(error) = error {
                    entries.push(("error", error.to_value()));
                }
                map(entries)
            },
            Self::CallbackStreamCancel { stream_id, reason } => {
                let mut entries = vec![("streamId", WireValue::Uint(*stream_id))];
                if let Some(reason) = reason {
                    entries.push(("reason", reason.to_value()));
                }
                map(entries)
            },
            Self::Event { name, payload } => map(vec![
                ("event", WireValue::Str(name.clone())),
                ("payload", payload.clone()),
            ]),
            Self::Ping { seq } => map(vec![("seq", WireValue::Uint(*seq))]),
            Self::Pong { seq } => map(vec![("seq", WireValue::Uint(*seq))]),
        }
    }

    fn from_value(msg_type: MessageType, value: &WireValue) -> Result<Self, WireError> {
        Ok(match msg_type {
            MessageType::CreateRuntime
            | MessageType::DisposeRuntime
            | MessageType::Evaluate
            | MessageType::CallFunction
            | MessageType::GetProperty
            | MessageType::SetProperty
            | MessageType::CallMethod
            | MessageType::CallHandle
            | MessageType::AwaitPromise
            | MessageType::IteratorNext
            | MessageType::IteratorReturn
            | MessageType::ReleaseHandle
            | MessageType::ListProperties => Self::Request(request_from_value(msg_type, value)?),
            MessageType::WsConnect
            | MessageType::WsMessage
            | MessageType::WsClose
            | MessageType::TestCreate
            | MessageType::TestRun
            | MessageType::TestEvent
            | MessageType::TestDispose
            | MessageType::EventAck => {
                return Err(WireError::UnknownMessageType(msg_type as u8));
            },
            MessageType::ResponseOk => Self::ResponseOk {
                request_id: req_u64(value, "requestId")?,
                value: req_field(value, "value")?.clone(),
            },
            MessageType::ResponseError => Self::ResponseError {
                request_id: req_u64(value, "requestId")?,
                error: ErrorRecord::from_value(req_field(value, "error")?)?,
            },
            MessageType::ResponseStreamStart => Self::ResponseStreamStart {
                request_id: req_u64(value, "requestId")?,
                stream_id: req_u64(value, "streamId")?,
            },
            MessageType::ResponseStreamChunk => Self::ResponseStreamChunk {
                stream_id: req_u64(value, "streamId")?,
                chunk: req_field(value, "chunk")?.clone(),
            },
            MessageType::ResponseStreamEnd => Self::ResponseStreamEnd {
                stream_id: req_u64(value, "streamId")?,
                error: opt_error(value)?,
            },
            MessageType::CallbackInvoke => Self::CallbackInvoke {
                request_id: req_u64(value, "requestId")?,
                callback_id: req_u64(value, "callbackId")?,
                args: req_field(value, "args")?
                    .as_array()
                    .ok_or(WireError::InvalidField("args"))?
                    .to_vec(),
            },
            MessageType::CallbackResponse => Self::CallbackResponse {
                request_id: req_u64(value, "requestId")?,
                value: req_field(value, "value")?.clone(),
            },
            MessageType::CallbackError => Self::CallbackError {
                request_id: req_u64(value, "requestId")?,
                error: ErrorRecord::from_value(req_field(value, "error")?)?,
            },
            MessageType::PromiseSettle => Self::PromiseSettle {
                promise_id: req_u64(value, "promiseId")?,
                result: match value.get("error") {
                    Some(error) => Err(ErrorRecord::from_value(error)?),
                    None => Ok(req_field(value, "value")?.clone()),
                },
            },
            MessageType::CallbackIteratorNext => Self::CallbackIteratorNext {
                request_id: req_u64(value, "requestId")?,
                iterator_id: req_u64(value, "iteratorId")?,
            },
            MessageType::CallbackIteratorResult => Self::CallbackIteratorResult {
                request_id: req_u64(value, "requestId")?,
                value: req_field(value, "value")?.clone(),
                done: req_field(value, "done")?
                    .as_bool()
                    .ok_or(WireError::InvalidField("done"))?,
            },
            MessageType::CallbackStreamStart => Self::CallbackStreamStart {
                request_id: req_u64(value, "requestId")?,
                stream_id: req_u64(value, "streamId")?,
            },
            MessageType::CallbackStreamChunk => Self::CallbackStreamChunk {
                stream_id: req_u64(value, "streamId")?,
                chunk: req_field(value, "chunk")?.clone(),
            },
            MessageType::CallbackStreamEnd => Self::CallbackStreamEnd {
                stream_id: req_u64(value, "streamId")?,
                error: opt_error(value)?,
            },
            MessageType::CallbackStreamCancel => Self::CallbackStreamCancel {
                stream_id: req_u64(value, "streamId")?,
                reason: match value.get("reason") {
                    Some(reason) => Some(ErrorRecord::from_value(reason)?),
                    None => None,
                },
            },
            MessageType::Event => Self::Event {
                name: req_str(value, "event")?,
                payload: req_field(value, "payload")?.clone(),
            },
            MessageType::Ping => Self::Ping {
                seq: req_u64(value, "seq")?,
            },
            MessageType::Pong => Self::Pong {
                seq: req_u64(value, "seq")?,
            },
        })
    }
}

fn request_to_value(request: &Request) -> WireValue {
    let mut entries = vec![("requestId", WireValue::Uint(request.request_id))];
    match &request.op {
        RequestOp::CreateRuntime(options) => {
            entries.push(("options", options_to_value(options)));
        },
        RequestOp::DisposeRuntime { isolate_id } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
        },
        RequestOp::Evaluate {
            isolate_id,
            source,
            filename,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("source", WireValue::Str(source.clone())));
            if let Some(filename) = filename {
                entries.push(("filename", WireValue::Str(filename.clone())));
            }
        },
        RequestOp::CallFunction {
            isolate_id,
            name,
            args,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("name", WireValue::Str(name.clone())));
            entries.push(("args", WireValue::Array(args.clone())));
        },
        RequestOp::GetProperty {
            isolate_id,
            handle_id,
            name,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("handleId", WireValue::Uint(*handle_id)));
            entries.push(("name", WireValue::Str(name.clone())));
        },
        RequestOp::SetProperty {
            isolate_id,
            handle_id,
            name,
            value,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("handleId", WireValue::Uint(*handle_id)));
            entries.push(("name", WireValue::Str(name.clone())));
            entries.push(("value", value.clone()));
        },
        RequestOp::CallMethod {
            isolate_id,
            handle_id,
            name,
            args,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("handleId", WireValue::Uint(*handle_id)));
            entries.push(("name", WireValue::Str(name.clone())));
            entries.push(("args", WireValue::Array(args.clone())));
        },
        RequestOp::CallHandle {
            isolate_id,
            handle_id,
            args,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("handleId", WireValue::Uint(*handle_id)));
            entries.push(("args", WireValue::Array(args.clone())));
        },
        RequestOp::AwaitPromise {
            isolate_id,
            promise_id,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("promiseId", WireValue::Uint(*promise_id)));
        },
        RequestOp::IteratorNext {
            isolate_id,
            iterator_id,
        }
        | RequestOp::IteratorReturn {
            isolate_id,
            iterator_id,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("iteratorId", WireValue::Uint(*iterator_id)));
        },
        RequestOp::ReleaseHandle {
            isolate_id,
            handle_id,
        }
        | RequestOp::ListProperties {
            isolate_id,
            handle_id,
        } => {
            entries.push(("isolateId", WireValue::Uint(*isolate_id)));
            entries.push(("handleId", WireValue::Uint(*handle_id)));
        },
    }
    map(entries)
}

fn request_from_value(msg_type: MessageType, value: &WireValue) -> Result<Request, WireError> {
    let request_id = req_u64(value, "requestId")?;
    let op = match msg_type {
        MessageType::CreateRuntime => {
            RequestOp::CreateRuntime(options_from_value(req_field(value, "options")?)?)
        },
        MessageType::DisposeRuntime => RequestOp::DisposeRuntime {
            isolate_id: req_u64(value, "isolateId")?,
        },
        MessageType::Evaluate => RequestOp::Evaluate {
            isolate_id: req_u64(value, "isolateId")?,
            source: req_str(value, "source")?,
            filename: value.get("filename").and_then(WireValue::as_str).map(str::to_string),
        },
        MessageType::CallFunction => RequestOp::CallFunction {
            isolate_id: req_u64(value, "isolateId")?,
            name: req_str(value, "name")?,
            args: req_array(value, "args")?,
        },
        MessageType::GetProperty => RequestOp::GetProperty {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
            name: req_str(value, "name")?,
        },
        MessageType::SetProperty => RequestOp::SetProperty {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
            name: req_str(value, "name")?,
            value: req_field(value, "value")?.clone(),
        },
        MessageType::CallMethod => RequestOp::CallMethod {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
            name: req_str(value, "name")?,
            args: req_array(value, "args")?,
        },
        MessageType::CallHandle => RequestOp::CallHandle {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
            args: req_array(value, "args")?,
        },
        MessageType::AwaitPromise => RequestOp::AwaitPromise {
            isolate_id: req_u64(value, "isolateId")?,
            promise_id: req_u64(value, "promiseId")?,
        },
        MessageType::IteratorNext => RequestOp::IteratorNext {
            isolate_id: req_u64(value, "isolateId")?,
            iterator_id: req_u64(value, "iteratorId")?,
        },
        MessageType::IteratorReturn => RequestOp::IteratorReturn {
            isolate_id: req_u64(value, "isolateId")?,
            iterator_id: req_u64(value, "iteratorId")?,
        },
        MessageType::ReleaseHandle => RequestOp::ReleaseHandle {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
        },
        MessageType::ListProperties => RequestOp::ListProperties {
            isolate_id: req_u64(value, "isolateId")?,
            handle_id: req_u64(value, "handleId")?,
        },
        _ => return Err(WireError::UnknownMessageType(msg_type as u8)),
    };
    Ok(Request { request_id, op })
}

fn options_to_value(options: &RuntimeOptions) -> WireValue {
    let mut entries = Vec::new();
    if let Some(limit) = options.memory_limit_mb {
        entries.push(("memoryLimitMB", WireValue::Uint(limit as u64)));
    }
    if let Some(cwd) = &options.cwd {
        entries.push(("cwd", WireValue::Str(cwd.clone())));
    }
    if let Some(namespace_id) = &options.namespace_id {
        entries.push(("namespaceId", WireValue::Str(namespace_id.clone())));
    }
    if let Some(test_env) = &options.test_env {
        let mut test_entries = Vec::new();
        if let Some(timeout) = test_env.test_timeout_ms {
            test_entries.push(("timeoutMs", WireValue::Uint(timeout)));
        }
        entries.push(("testEnv", map(test_entries)));
    }
    entries.push(("callbacks", callbacks_to_value(&options.callbacks)));
    map(entries)
}

fn callbacks_to_value(callbacks: &CallbackRegistrations) -> WireValue {
    let mut entries = Vec::new();
    if let Some(id) = callbacks.console {
        entries.push(("console", WireValue::Uint(id)));
    }
    if let Some(id) = callbacks.fetch {
        entries.push(("fetch", WireValue::Uint(id)));
    }
    if let Some(fs) = &callbacks.fs {
        let mut fs_entries = Vec::new();
        if let Some(id) = fs.read_file {
            fs_entries.push(("readFile", WireValue::Uint(id)));
        }
        if let Some(id) = fs.write_file {
            fs_entries.push(("writeFile", WireValue::Uint(id)));
        }
        if let Some(id) = fs.stat {
            fs_entries.push(("stat", WireValue::Uint(id)));
        }
        if let Some(id) = fs.read_dir {
            fs_entries.push(("readDir", WireValue::Uint(id)));
        }
        entries.push(("fs", map(fs_entries)));
    }
    if let Some(id) = callbacks.module_loader {
        entries.push(("moduleLoader", WireValue::Uint(id)));
    }
    if let Some(id) = callbacks.playwright {
        entries.push(("playwright", WireValue::Uint(id)));
    }
    if !callbacks.custom_functions.is_empty() {
        entries.push((
            "customFunctions",
            WireValue::Array(
                callbacks
                    .custom_functions
                    .iter()
                    .map(|custom| {
                        map(vec![
                            ("name", WireValue::Str(custom.name.clone())),
                            ("callbackId", WireValue::Uint(custom.callback_id)),
                            ("async", WireValue::Bool(custom.is_async)),
                        ])
                    })
                    .collect(),
            ),
        ));
    }
    map(entries)
}

fn options_from_value(value: &WireValue) -> Result<RuntimeOptions, WireError> {
    let memory_limit_mb = match value.get("memoryLimitMB") {
        Some(limit) => Some(
            limit
                .as_u64()
                .and_then(|limit| u32::try_from(limit).ok())
                .ok_or(WireError::InvalidField("memoryLimitMB"))?,
        ),
        None => None,
    };
    let cwd = value.get("cwd").and_then(WireValue::as_str).map(str::to_string);
    let namespace_id = value
        .get("namespaceId")
        .and_then(WireValue::as_str)
        .map(str::to_string);
    let test_env = value.get("testEnv").map(|test_env| TestEnvOptions {
        test_timeout_ms: test_env.get("timeoutMs").and_then(WireValue::as_u64),
    });
    let callbacks = match value.get("callbacks") {
        Some(callbacks) => callbacks_from_value(callbacks)?,
        None => CallbackRegistrations::default(),
    };
    Ok(RuntimeOptions {
        memory_limit_mb,
        cwd,
        namespace_id,
        test_env,
        callbacks,
    })
}

fn callbacks_from_value(value: &WireValue) -> Result<CallbackRegistrations, WireError> {
    let fs = value.get("fs").map(|fs| FsCallbacks {
        read_file: fs.get("readFile").and_then(WireValue::as_u64),
        write_file: fs.get("writeFile").and_then(WireValue::as_u64),
        stat: fs.get("stat").and_then(WireValue::as_u64),
        read_dir: fs.get("readDir").and_then(WireValue::as_u64),
    });
    let mut custom_functions = Vec::new();
    if let Some(customs) = value.get("customFunctions") {
        for custom in customs
            .as_array()
            .ok_or(WireError::InvalidField("customFunctions"))?
        {
            custom_functions.push(CustomFunctionRegistration {
                name: req_str(custom, "name")?,
                callback_id: req_u64(custom, "callbackId")?,
                is_async: custom.get("async").and_then(WireValue::as_bool).unwrap_or(false),
            });
        }
    }
    Ok(CallbackRegistrations {
        console: value.get("console").and_then(WireValue::as_u64),
        fetch: value.get("fetch").and_then(WireValue::as_u64),
        fs,
        module_loader: value.get("moduleLoader").and_then(WireValue::as_u64),
        playwright: value.get("playwright").and_then(WireValue::as_u64),
        custom_functions,
    })
}

fn map(entries: Vec<(&str, WireValue)>) -> WireValue {
    WireValue::Map(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    )
}

fn req_field<'a>(value: &'a WireValue, key: &'static str) -> Result<&'a WireValue, WireError> {
    value.get(key).ok_or(WireError::InvalidField(key))
}

fn req_u64(value: &WireValue, key: &'static str) -> Result<u64, WireError> {
    req_field(value, key)?
        .as_u64()
        .ok_or(WireError::InvalidField(key))
}

fn req_str(value: &WireValue, key: &'static str) -> Result<String, WireError> {
    Ok(req_field(value, key)?
        .as_str()
        .ok_or(WireError::InvalidField(key))?
        .to_string())
}

fn req_array(value: &WireValue, key: &'static str) -> Result<Vec<WireValue>, WireError> {
    Ok(req_field(value, key)?
        .as_array()
        .ok_or(WireError::InvalidField(key))?
        .to_vec())
}

fn opt_error(value: &WireValue) -> Result<Option<ErrorRecord>, WireError> {
    match value.get("error") {
        Some(error) => Ok(Some(ErrorRecord::from_value(error)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorCode, frame::FrameParser};

    fn round_trip(message: Message) {
        let frame = message.to_frame().unwrap();
        let mut parser = FrameParser::default();
        parser.feed(&frame);
        let raw = parser.next_frame().unwrap().unwrap();
        assert_eq!(Message::from_frame(&raw).unwrap(), message);
    }

    #[test]
    fn runtime_requests_round_trip() {
        round_trip(Message::Request(Request {
            request_id: 1,
            op: RequestOp::CreateRuntime(RuntimeOptions {
                memory_limit_mb: Some(128),
                cwd: Some("/app".to_string()),
                namespace_id: Some("warm".to_string()),
                test_env: Some(TestEnvOptions {
                    test_timeout_ms: Some(5000),
                }),
                callbacks: CallbackRegistrations {
                    console: Some(1),
                    fetch: Some(2),
                    fs: Some(FsCallbacks {
                        read_file: Some(3),
                        write_file: None,
                        stat: Some(4),
                        read_dir: None,
                    }),
                    module_loader: Some(5),
                    playwright: None,
                    custom_functions: vec![CustomFunctionRegistration {
                        name: "hostAdd".to_string(),
                        callback_id: 6,
                        is_async: true,
                    }],
                },
            }),
        }));
        round_trip(Message::Request(Request {
            request_id: 2,
            op: RequestOp::Evaluate {
                isolate_id: 7,
                source: "1 + 1".to_string(),
                filename: Some("/index.js".to_string()),
            },
        }));
        round_trip(Message::Request(Request {
            request_id: 3,
            op: RequestOp::DisposeRuntime { isolate_id: 7 },
        }));
    }

    #[test]
    fn handle_ops_round_trip() {
        round_trip(Message::Request(Request {
            request_id: 9,
            op: RequestOp::CallMethod {
                isolate_id: 1,
                handle_id: 44,
                name: "push".to_string(),
                args: vec![WireValue::Uint(1)],
            },
        }));
        round_trip(Message::Request(Request {
            request_id: 10,
            op: RequestOp::ReleaseHandle {
                isolate_id: 1,
                handle_id: 44,
            },
        }));
    }

    #[test]
    fn responses_round_trip() {
        round_trip(Message::ResponseOk {
            request_id: 4,
            value: WireValue::Str("ok".to_string()),
        });
        round_trip(Message::ResponseError {
            request_id: 5,
            error: ErrorRecord::new(ErrorCode::IsolateNotFound, "Error", "no such isolate"),
        });
        round_trip(Message::ResponseStreamStart {
            request_id: 6,
            stream_id: 1,
        });
        round_trip(Message::ResponseStreamChunk {
            stream_id: 1,
            chunk: WireValue::Uint(1),
        });
        round_trip(Message::ResponseStreamEnd {
            stream_id: 1,
            error: None,
        });
    }

    #[test]
    fn callback_messages_round_trip() {
        round_trip(Message::CallbackInvoke {
            request_id: 11,
            callback_id: 3,
            args: vec![WireValue::Str("log line".to_string())],
        });
        round_trip(Message::CallbackResponse {
            request_id: 11,
            value: WireValue::Null,
        });
        round_trip(Message::CallbackError {
            request_id: 11,
            error: ErrorRecord::new(ErrorCode::CallbackFailed, "TypeError", "bad callback"),
        });
        round_trip(Message::PromiseSettle {
            promise_id: 8,
            result: Ok(WireValue::Uint(42)),
        });
        round_trip(Message::PromiseSettle {
            promise_id: 8,
            result: Err(ErrorRecord::new(
                ErrorCode::ScriptException,
                "Error",
                "rejected",
            )),
        });
        round_trip(Message::CallbackStreamStart {
            request_id: 12,
            stream_id: 2,
        });
        round_trip(Message::CallbackStreamCancel {
            stream_id: 2,
            reason: None,
        });
    }

    #[test]
    fn heartbeat_round_trips() {
        round_trip(Message::Ping { seq: 1 });
        round_trip(Message::Pong { seq: 1 });
    }

    #[test]
    fn reserved_types_are_rejected() {
        let frame = RawFrame {
            msg_type: 0x10,
            payload: Bytes::from(encode_value(&map(vec![])).unwrap()),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(WireError::UnknownMessageType(0x10))
        ));
    }

    #[test]
    fn undefined_type_byte_is_rejected() {
        let frame = RawFrame {
            msg_type: 0x55,
            payload: Bytes::new(),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(WireError::UnknownMessageType(0x55))
        ));
    }
}
