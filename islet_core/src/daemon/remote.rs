// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire-backed implementations of the bridge's ref registrar/resolver and
//! of the outbound integration contracts. Everything here proxies across
//! one connection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use islet_bridge::{
    marshal, unmarshal, AsyncIteration, HostAsyncIterator, HostFunction, HostPromise,
    HostRequest, HostResponse, HostValue, MarshalOptions, RefRegistrar, RefResolver,
};
use islet_streams::{
    QueuingStrategy, ReadResult, ReadableStream, ReadableStreamDefaultController, Source,
};
use islet_utils::error::JsError;
use islet_wire::{ErrorCode, ErrorRecord, Message, Ref, WireValue};
use tokio::sync::mpsc;

use crate::{
    outbound::{
        ConsoleEntry, ConsoleHandler, FetchHandler, FsHandler, FsStat, ModuleLoader,
        PlaywrightHandler,
    },
    setup_core::object_get,
};

use super::connection::{ConnectionState, ResponsePayload, StreamEvent};

/// Registrar/resolver pair bound to one connection. Identity-bearing host
/// values registered here are driven over the wire; Refs from the peer
/// resolve to proxies that call back across it.
#[derive(Clone)]
pub(crate) struct WireRefs {
    conn: Arc<ConnectionState>,
}

impl WireRefs {
    pub(crate) fn new(conn: Arc<ConnectionState>) -> Self {
        Self { conn }
    }

    pub(crate) async fn marshal_value(&self, value: &HostValue) -> Result<WireValue, JsError> {
        marshal(value, self, &MarshalOptions::default()).await
    }

    pub(crate) fn unmarshal_value(&self, value: &WireValue) -> Result<HostValue, JsError> {
        unmarshal(value, self)
    }

    /// Converts a settled response payload into a host value.
    pub(crate) fn payload_to_host(&self, payload: ResponsePayload) -> Result<HostValue, ErrorRecord> {
        match payload {
            ResponsePayload::Value(value) => self
                .unmarshal_value(&value)
                .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error)),
            ResponsePayload::Stream(receiver) => Ok(HostValue::Stream(self.incoming_stream(receiver, None))),
            ResponsePayload::Error(record) => Err(record),
        }
    }

    fn incoming_stream(
        &self,
        receiver: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_stream_id: Option<u64>,
    ) -> ReadableStream<HostValue> {
        ReadableStream::new(
            IncomingStreamSource {
                refs: self.clone(),
                receiver,
                cancel_stream_id,
            },
            QueuingStrategy::default(),
        )
    }
}

impl RefRegistrar for WireRefs {
    fn register_function(&self, function: HostFunction) -> Ref {
        let refs = self.clone();
        let callback_id = self.conn.register_callback(Arc::new(move |args: Vec<WireValue>| {
            let refs = refs.clone();
            let function = function.clone();
            Box::pin(async move {
                let mut host_args = Vec::with_capacity(args.len());
                for value in &args {
                    host_args.push(refs.unmarshal_value(value).map_err(|error| {
                        ErrorRecord::from_js_error(ErrorCode::InvalidField, &error)
                    })?);
                }
                let result = function.call(host_args).await.map_err(|error| {
                    ErrorRecord::from_js_error(ErrorCode::CallbackFailed, &error)
                })?;
                refs.marshal_value(&result)
                    .await
                    .map_err(|error| ErrorRecord::from_js_error(ErrorCode::CallbackFailed, &error))
            })
        }));
        Ref::Callback { callback_id }
    }

    fn register_promise(&self, promise: HostPromise) -> Ref {
        let promise_id = self.conn.callback_ids.next();
        let refs = self.clone();
        tokio::spawn(async move {
            let result = match promise.wait().await {
                Ok(value) => match refs.marshal_value(&value).await {
                    Ok(value) => Ok(value),
                    Err(error) => {
                        Err(ErrorRecord::from_js_error(ErrorCode::CallbackFailed, &error))
                    },
                },
                Err(error) => Err(ErrorRecord::from_js_error(ErrorCode::ScriptException, &error)),
            };
            refs.conn.send(&Message::PromiseSettle { promise_id, result });
        });
        Ref::Promise { promise_id }
    }

    fn register_iterator(&self, iterator: HostAsyncIterator) -> Ref {
        let iterator_id = self.conn.callback_ids.next();
        self.conn
            .iterators
            .lock()
            .unwrap()
            .insert(iterator_id, iterator);
        Ref::AsyncIterator { iterator_id }
    }

    fn register_stream(&self, stream: ReadableStream<HostValue>) -> Ref {
        let stream_id = self.conn.stream_ids.next();
        let refs = self.clone();
        tokio::spawn(async move {
            pump_callback_stream(refs, stream_id, stream).await;
        });
        Ref::Stream { stream_id }
    }
}

impl RefResolver for WireRefs {
    fn resolve_callback(&self, callback_id: u64) -> HostFunction {
        let refs = self.clone();
        HostFunction::new(move |args| {
            let refs = refs.clone();
            Box::pin(async move {
                let mut wire_args = Vec::with_capacity(args.len());
                for value in &args {
                    wire_args.push(refs.marshal_value(value).await?);
                }
                let payload = refs
                    .conn
                    .invoke_callback(callback_id, wire_args)
                    .await
                    .map_err(|record| record.to_js_error())?;
                refs.payload_to_host(payload)
                    .map_err(|record| record.to_js_error())
            })
        })
    }

    fn resolve_promise(&self, promise_id: u64) -> HostPromise {
        // A settlement frame may already have arrived.
        if let Some(result) = self.conn.settled_promises.lock().unwrap().remove(&promise_id) {
            return match result {
                Ok(value) => match self.unmarshal_value(&value) {
                    Ok(value) => HostPromise::resolved(value),
                    Err(error) => HostPromise::rejected(error),
                },
                Err(record) => HostPromise::rejected(record.to_js_error()),
            };
        }
        let proxy = HostPromise::new();
        self.conn
            .promises
            .lock()
            .unwrap()
            .insert(promise_id, proxy.clone());
        proxy
    }

    fn resolve_iterator(&self, iterator_id: u64) -> HostAsyncIterator {
        HostAsyncIterator::new(RemoteIterator {
            refs: self.clone(),
            iterator_id,
        })
    }

    fn resolve_stream(&self, stream_id: u64) -> ReadableStream<HostValue> {
        match self.conn.claim_incoming_stream(stream_id) {
            Some(receiver) => self.incoming_stream(receiver, Some(stream_id)),
            None => ReadableStream::from_chunks(Vec::new()),
        }
    }
}

/// Pumps a local stream to the peer as CALLBACK_STREAM frames, honoring
/// peer-side cancellation.
async fn pump_callback_stream(refs: WireRefs, stream_id: u64, stream: ReadableStream<HostValue>) {
    refs.conn.send(&Message::CallbackStreamStart {
        request_id: 0,
        stream_id,
    });
    let reader = match stream.get_reader() {
        Ok(reader) => reader,
        Err(error) => {
            refs.conn.send(&Message::CallbackStreamEnd {
                stream_id,
                error: Some(ErrorRecord::from_js_error(ErrorCode::StreamClosed, &error)),
            });
            return;
        },
    };
    loop {
        if refs.conn.is_stream_cancelled(stream_id) {
            let _ = reader
                .cancel(JsError::error("stream cancelled by peer"))
                .await;
            reader.release_lock();
            return;
        }
        match reader.read().await {
            Ok(ReadResult::Chunk(chunk)) => match refs.marshal_value(&chunk).await {
                Ok(chunk) => {
                    refs.conn
                        .send(&Message::CallbackStreamChunk { stream_id, chunk });
                },
                Err(error) => {
                    refs.conn.send(&Message::CallbackStreamEnd {
                        stream_id,
                        error: Some(ErrorRecord::from_js_error(
                            ErrorCode::StreamClosed,
                            &error,
                        )),
                    });
                    break;
                },
            },
            Ok(ReadResult::Done) => {
                refs.conn.send(&Message::CallbackStreamEnd {
                    stream_id,
                    error: None,
                });
                break;
            },
            Err(error) => {
                refs.conn.send(&Message::CallbackStreamEnd {
                    stream_id,
                    error: Some(ErrorRecord::from_js_error(ErrorCode::StreamClosed, &error)),
                });
                break;
            },
        }
    }
    reader.release_lock();
}

/// Source feeding a host stream from incoming chunked stream frames.
struct IncomingStreamSource {
    refs: WireRefs,
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_stream_id: Option<u64>,
}

#[async_trait]
impl Source<HostValue> for IncomingStreamSource {
    async fn pull(
        &mut self,
        controller: &ReadableStreamDefaultController<HostValue>,
    ) -> Result<(), JsError> {
        match self.receiver.recv().await {
            Some(StreamEvent::Chunk(chunk)) => {
                controller.enqueue(self.refs.unmarshal_value(&chunk)?)?;
                Ok(())
            },
            Some(StreamEvent::End(None)) | None => {
                let _ = controller.close();
                Ok(())
            },
            Some(StreamEvent::End(Some(record))) => Err(record.to_js_error()),
        }
    }

    async fn cancel(&mut self, _reason: JsError) -> Result<(), JsError> {
        if let Some(stream_id) = self.cancel_stream_id {
            self.refs.conn.send(&Message::CallbackStreamCancel {
                stream_id,
                reason: None,
            });
        }
        Ok(())
    }
}

/// Remote iterator proxy driven by CALLBACK_ITERATOR frames.
struct RemoteIterator {
    refs: WireRefs,
    iterator_id: u64,
}

#[async_trait]
impl AsyncIteration for RemoteIterator {
    async fn next(&mut self) -> Result<Option<HostValue>, JsError> {
        let payload = self
            .refs
            .conn
            .iterator_next(self.iterator_id)
            .await
            .map_err(|record| record.to_js_error())?;
        let value = self
            .refs
            .payload_to_host(payload)
            .map_err(|record| record.to_js_error())?;
        let done = object_get(&value, "done");
        if done == Some(HostValue::Bool(true)) {
            return Ok(None);
        }
        Ok(object_get(&value, "value"))
    }
}

// --- remote outbound handlers (daemon side) ---

pub(crate) struct RemoteConsole {
    pub(crate) callback: HostFunction,
}

#[async_trait]
impl ConsoleHandler for RemoteConsole {
    async fn on_entry(&self, entry: ConsoleEntry) {
        let _ = self
            .callback
            .call(vec![
                HostValue::string(entry.level.as_str()),
                HostValue::array(entry.args),
            ])
            .await;
    }
}

pub(crate) struct RemoteFetch {
    pub(crate) callback: HostFunction,
}

#[async_trait]
impl FetchHandler for RemoteFetch {
    async fn fetch(&self, request: HostRequest) -> Result<HostResponse, JsError> {
        let result = self
            .callback
            .call(vec![HostValue::Request(Box::new(request))])
            .await?;
        match result {
            HostValue::Response(response) => Ok(*response),
            other => Err(JsError::type_error(format!(
                "fetch callback returned {}",
                other.kind_name()
            ))),
        }
    }
}

pub(crate) struct RemoteFs {
    pub(crate) read_file: Option<HostFunction>,
    pub(crate) write_file: Option<HostFunction>,
    pub(crate) stat: Option<HostFunction>,
    pub(crate) read_dir: Option<HostFunction>,
}

fn missing(op: &str) -> JsError {
    JsError::error(format!("fs.{op} is not registered"))
}

#[async_trait]
impl FsHandler for RemoteFs {
    async fn read_file(&self, path: &str) -> Result<Bytes, JsError> {
        let callback = self.read_file.as_ref().ok_or_else(|| missing("readFile"))?;
        match callback.call(vec![HostValue::string(path)]).await? {
            HostValue::Bytes(data) => Ok(data),
            other => Err(JsError::type_error(format!(
                "readFile returned {}",
                other.kind_name()
            ))),
        }
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<(), JsError> {
        let callback = self
            .write_file
            .as_ref()
            .ok_or_else(|| missing("writeFile"))?;
        callback
            .call(vec![HostValue::string(path), HostValue::Bytes(data)])
            .await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FsStat, JsError> {
        let callback = self.stat.as_ref().ok_or_else(|| missing("stat"))?;
        let result = callback.call(vec![HostValue::string(path)]).await?;
        let field = |name: &str| object_get(&result, name);
        Ok(FsStat {
            is_file: matches!(field("isFile"), Some(HostValue::Bool(true))),
            is_directory: matches!(field("isDirectory"), Some(HostValue::Bool(true))),
            size: match field("size") {
                Some(HostValue::Int(size)) if size >= 0 => size as u64,
                _ => 0,
            },
            modified_ms: match field("modifiedMs") {
                Some(HostValue::Int(modified)) => modified,
                _ => 0,
            },
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, JsError> {
        let callback = self.read_dir.as_ref().ok_or_else(|| missing("readDir"))?;
        match callback.call(vec![HostValue::string(path)]).await? {
            HostValue::Array(items) => items
                .lock()
                .unwrap()
                .iter()
                .map(|item| match item {
                    HostValue::String(name) => Ok(name.clone()),
                    other => Err(JsError::type_error(format!(
                        "readDir entry was {}",
                        other.kind_name()
                    ))),
                })
                .collect(),
            other => Err(JsError::type_error(format!(
                "readDir returned {}",
                other.kind_name()
            ))),
        }
    }
}

pub(crate) struct RemoteModuleLoader {
    pub(crate) callback: HostFunction,
}

#[async_trait]
impl ModuleLoader for RemoteModuleLoader {
    async fn load(&self, specifier: &str) -> Result<String, JsError> {
        match self.callback.call(vec![HostValue::string(specifier)]).await? {
            HostValue::String(source) => Ok(source),
            other => Err(JsError::type_error(format!(
                "module loader returned {}",
                other.kind_name()
            ))),
        }
    }
}

pub(crate) struct RemotePlaywright {
    pub(crate) callback: HostFunction,
}

#[async_trait]
impl PlaywrightHandler for RemotePlaywright {
    async fn op(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue, JsError> {
        self.callback
            .call(vec![HostValue::string(name), HostValue::array(args)])
            .await
    }
}
