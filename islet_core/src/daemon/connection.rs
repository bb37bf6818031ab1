// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use fxhash::{FxHashMap, FxHashSet};
use islet_bridge::{HostAsyncIterator, HostPromise};
use islet_utils::id::IdAllocator;
use islet_wire::{
    ErrorCode, ErrorRecord, FrameParser, Message, Request, RequestOp, WireError, WireValue,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace, warn};

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_frame_size: usize,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: islet_wire::DEFAULT_MAX_FRAME_SIZE,
            ping_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
        }
    }
}

/// Events routed to an incoming chunked stream.
pub(crate) enum StreamEvent {
    Chunk(WireValue),
    End(Option<ErrorRecord>),
}

/// How a pending request settled.
pub(crate) enum ResponsePayload {
    Value(WireValue),
    Stream(mpsc::UnboundedReceiver<StreamEvent>),
    Error(ErrorRecord),
}

pub(crate) type WireCallbackFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<WireValue, ErrorRecord>> + Send>>;

/// A local callable the peer can invoke with `CALLBACK_INVOKE`.
pub(crate) type WireCallback =
    Arc<dyn Fn(Vec<WireValue>) -> WireCallbackFuture + Send + Sync>;

struct IncomingStream {
    tx: mpsc::UnboundedSender<StreamEvent>,
    rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

/// Per-connection shared state: the outgoing frame queue and every
/// correlation table. Mutated only from this connection's tasks.
pub(crate) struct ConnectionState {
    outgoing: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<FxHashMap<u64, oneshot::Sender<ResponsePayload>>>,
    pub(crate) callbacks: Mutex<FxHashMap<u64, WireCallback>>,
    pub(crate) iterators: Mutex<FxHashMap<u64, HostAsyncIterator>>,
    pub(crate) promises: Mutex<FxHashMap<u64, HostPromise>>,
    /// Settlements that arrived before their PromiseRef was resolved into a
    /// proxy; claimed by `resolve_promise`.
    pub(crate) settled_promises: Mutex<FxHashMap<u64, Result<WireValue, ErrorRecord>>>,
    streams_in: Mutex<FxHashMap<u64, IncomingStream>>,
    cancelled_streams: Mutex<FxHashSet<u64>>,
    pub(crate) request_ids: IdAllocator,
    pub(crate) stream_ids: IdAllocator,
    pub(crate) callback_ids: IdAllocator,
    last_seen: Mutex<Instant>,
    alive: AtomicBool,
}

impl ConnectionState {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn send(&self, message: &Message) {
        match message.to_frame() {
            Ok(frame) => {
                let _ = self.outgoing.send(frame);
            },
            Err(error) => warn!("failed to encode outgoing frame: {error}"),
        }
    }

    /// Sends a request and suspends until the matching response arrives.
    pub(crate) async fn request(&self, op: RequestOp) -> Result<ResponsePayload, ErrorRecord> {
        if !self.is_alive() {
            return Err(connection_lost());
        }
        let request_id = self.request_ids.next();
        let receiver = self.park_pending(request_id);
        self.send(&Message::Request(Request { request_id, op }));
        if !self.is_alive() {
            // The connection died between the liveness check and the park;
            // the drain may have run before our entry existed.
            self.resolve_pending(request_id, ResponsePayload::Error(connection_lost()));
        }
        match receiver.await {
            Ok(ResponsePayload::Error(record)) => Err(record),
            Ok(payload) => Ok(payload),
            Err(_) => Err(connection_lost()),
        }
    }

    /// Invokes a callback on the peer and suspends until its response.
    pub(crate) async fn invoke_callback(
        &self,
        callback_id: u64,
        args: Vec<WireValue>,
    ) -> Result<ResponsePayload, ErrorRecord> {
        if !self.is_alive() {
            return Err(connection_lost());
        }
        let request_id = self.request_ids.next();
        let receiver = self.park_pending(request_id);
        self.send(&Message::CallbackInvoke {
            request_id,
            callback_id,
            args,
        });
        if !self.is_alive() {
            self.resolve_pending(request_id, ResponsePayload::Error(connection_lost()));
        }
        match receiver.await {
            Ok(ResponsePayload::Error(record)) => Err(record),
            Ok(payload) => Ok(payload),
            Err(_) => Err(connection_lost()),
        }
    }

    /// Drives a remote async iterator one step.
    pub(crate) async fn iterator_next(
        &self,
        iterator_id: u64,
    ) -> Result<ResponsePayload, ErrorRecord> {
        let request_id = self.request_ids.next();
        let receiver = self.park_pending(request_id);
        self.send(&Message::CallbackIteratorNext {
            request_id,
            iterator_id,
        });
        match receiver.await {
            Ok(ResponsePayload::Error(record)) => Err(record),
            Ok(payload) => Ok(payload),
            Err(_) => Err(connection_lost()),
        }
    }

    fn park_pending(&self, request_id: u64) -> oneshot::Receiver<ResponsePayload> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);
        rx
    }

    fn resolve_pending(&self, request_id: u64, payload: ResponsePayload) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&request_id) {
            let _ = tx.send(payload);
        } else {
            trace!("dropping response for unknown request {request_id}");
        }
    }

    /// Fails every in-flight request; used on connection loss.
    fn fail_all_pending(&self, record: &ErrorRecord) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, tx) in pending {
            let _ = tx.send(ResponsePayload::Error(record.clone()));
        }
    }

    pub(crate) fn register_callback(&self, callback: WireCallback) -> u64 {
        let id = self.callback_ids.next();
        self.callbacks.lock().unwrap().insert(id, callback);
        id
    }

    fn incoming_stream_sender(&self, stream_id: u64) -> mpsc::UnboundedSender<StreamEvent> {
        let mut streams = self.streams_in.lock().unwrap();
        streams
            .entry(stream_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                IncomingStream { tx, rx: Some(rx) }
            })
            .tx
            .clone()
    }

    /// Claims the receiver half of an incoming stream; frames arriving in
    /// either order (ref first or STREAM_START first) land in the same
    /// channel.
    pub(crate) fn claim_incoming_stream(
        &self,
        stream_id: u64,
    ) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut streams = self.streams_in.lock().unwrap();
        streams
            .entry(stream_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                IncomingStream { tx, rx: Some(rx) }
            })
            .rx
            .take()
    }

    fn route_stream_event(&self, stream_id: u64, event: StreamEvent) {
        let done = matches!(event, StreamEvent::End(_));
        let tx = self.incoming_stream_sender(stream_id);
        let _ = tx.send(event);
        if done {
            // Keep the entry so an unclaimed receiver can still drain it,
            // but drop our sender side.
            let mut streams = self.streams_in.lock().unwrap();
            if let Some(entry) = streams.get_mut(&stream_id) {
                if entry.rx.is_none() {
                    streams.remove(&stream_id);
                }
            }
        }
    }

    pub(crate) fn mark_stream_cancelled(&self, stream_id: u64) {
        self.cancelled_streams.lock().unwrap().insert(stream_id);
    }

    pub(crate) fn is_stream_cancelled(&self, stream_id: u64) -> bool {
        self.cancelled_streams.lock().unwrap().contains(&stream_id)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn close(&self, reason: &ErrorRecord) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("connection closed: {}", reason.message);
            self.fail_all_pending(reason);
        }
    }
}

pub(crate) fn connection_lost() -> ErrorRecord {
    ErrorRecord::new(ErrorCode::ConnectionLost, "Error", "connection lost")
}

/// Handles inbound request frames. The daemon routes them to runtime
/// operations; a pure client rejects them.
#[async_trait]
pub(crate) trait RequestHandler: Send + Sync {
    async fn handle(&self, conn: Arc<ConnectionState>, request: Request);
}

pub(crate) struct RejectAllHandler;

#[async_trait]
impl RequestHandler for RejectAllHandler {
    async fn handle(&self, conn: Arc<ConnectionState>, request: Request) {
        conn.send(&Message::ResponseError {
            request_id: request.request_id,
            error: ErrorRecord::new(
                ErrorCode::UnknownMessageType,
                "Error",
                "this side does not serve requests",
            ),
        });
    }
}

/// Spawns the read, write and heartbeat tasks for one connection and
/// returns its shared state.
pub(crate) fn spawn_connection<S>(
    io: S,
    config: ConnectionConfig,
    handler: Arc<dyn RequestHandler>,
) -> Arc<ConnectionState>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ConnectionConfig {
        max_frame_size,
        ping_interval,
        liveness_timeout,
    } = config;
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Bytes>();
    let state = Arc::new(ConnectionState {
        outgoing: outgoing_tx,
        pending: Mutex::new(FxHashMap::default()),
        callbacks: Mutex::new(FxHashMap::default()),
        iterators: Mutex::new(FxHashMap::default()),
        promises: Mutex::new(FxHashMap::default()),
        settled_promises: Mutex::new(FxHashMap::default()),
        streams_in: Mutex::new(FxHashMap::default()),
        cancelled_streams: Mutex::new(FxHashSet::default()),
        request_ids: IdAllocator::new(),
        stream_ids: IdAllocator::new(),
        callback_ids: IdAllocator::new(),
        last_seen: Mutex::new(Instant::now()),
        alive: AtomicBool::new(true),
    });

    let (mut reader, mut writer) = tokio::io::split(io);

    // Writer task: owns the write half and serializes frame writes.
    tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    // Reader task: incremental frame parsing and message dispatch.
    let read_state = state.clone();
    tokio::spawn(async move {
        let mut parser = FrameParser::new(max_frame_size);
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    read_state.close(&connection_lost());
                    return;
                },
                Ok(n) => n,
            };
            read_state.touch();
            parser.feed(&buf[..n]);
            loop {
                match parser.next_frame() {
                    Ok(Some(frame)) => match Message::from_frame(&frame) {
                        Ok(message) => dispatch(&read_state, &handler, message),
                        Err(WireError::UnknownMessageType(code)) => {
                            // Well-framed but unknown: answer with a
                            // protocol error when a request id is visible,
                            // then keep the connection.
                            debug!("unknown message type 0x{code:02x}");
                            if let Some(request_id) =
                                islet_wire::codec::decode_value(&frame.payload)
                                    .ok()
                                    .and_then(|value| {
                                        value.get("requestId").and_then(WireValue::as_u64)
                                    })
                            {
                                read_state.send(&Message::ResponseError {
                                    request_id,
                                    error: ErrorRecord::new(
                                        ErrorCode::UnknownMessageType,
                                        "Error",
                                        format!("unknown message type 0x{code:02x}"),
                                    ),
                                });
                            }
                        },
                        Err(error) => {
                            // Malformed payloads are fatal.
                            read_state.close(&ErrorRecord::new(
                                ErrorCode::MalformedFrame,
                                "Error",
                                error.to_string(),
                            ));
                            return;
                        },
                    },
                    Ok(None) => break,
                    Err(error) => {
                        read_state.close(&ErrorRecord::new(
                            error.code(),
                            "Error",
                            error.to_string(),
                        ));
                        return;
                    },
                }
            }
        }
    });

    // Heartbeat task: PING on an interval, liveness timeout fails every
    // in-flight request.
    let ping_state = state.clone();
    tokio::spawn(async move {
        let mut seq = 0u64;
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !ping_state.is_alive() {
                return;
            }
            let idle = ping_state.last_seen.lock().unwrap().elapsed();
            if idle > liveness_timeout {
                ping_state.close(&connection_lost());
                return;
            }
            seq += 1;
            ping_state.send(&Message::Ping { seq });
        }
    });

    state
}

fn dispatch(state: &Arc<ConnectionState>, handler: &Arc<dyn RequestHandler>, message: Message) {
    match message {
        Message::Request(request) => {
            // Requests run concurrently; responses correlate by id.
            let handler = handler.clone();
            let state = state.clone();
            tokio::spawn(async move {
                handler.handle(state, request).await;
            });
        },
        Message::ResponseOk { request_id, value } => {
            state.resolve_pending(request_id, ResponsePayload::Value(value));
        },
        Message::ResponseError { request_id, error } => {
            state.resolve_pending(request_id, ResponsePayload::Error(error));
        },
        Message::ResponseStreamStart {
            request_id,
            stream_id,
        } => {
            let receiver = state.claim_incoming_stream(stream_id);
            match receiver {
                Some(receiver) => {
                    state.resolve_pending(request_id, ResponsePayload::Stream(receiver));
                },
                None => warn!("stream {stream_id} already claimed"),
            }
        },
        Message::ResponseStreamChunk { stream_id, chunk }
        | Message::CallbackStreamChunk { stream_id, chunk } => {
            state.route_stream_event(stream_id, StreamEvent::Chunk(chunk));
        },
        Message::ResponseStreamEnd { stream_id, error }
        | Message::CallbackStreamEnd { stream_id, error } => {
            state.route_stream_event(stream_id, StreamEvent::End(error));
        },
        Message::CallbackInvoke {
            request_id,
            callback_id,
            args,
        } => {
            let callback = state.callbacks.lock().unwrap().get(&callback_id).cloned();
            let state = state.clone();
            tokio::spawn(async move {
                let response = match callback {
                    Some(callback) => callback(args).await,
                    None => Err(ErrorRecord::new(
                        ErrorCode::CallbackFailed,
                        "Error",
                        format!("callback {callback_id} not found"),
                    )),
                };
                match response {
                    Ok(value) => state.send(&Message::CallbackResponse { request_id, value }),
                    Err(error) => state.send(&Message::CallbackError { request_id, error }),
                }
            });
        },
        Message::CallbackResponse { request_id, value } => {
            state.resolve_pending(request_id, ResponsePayload::Value(value));
        },
        Message::CallbackError { request_id, error } => {
            state.resolve_pending(request_id, ResponsePayload::Error(error));
        },
        Message::PromiseSettle { promise_id, result } => {
            let promise = state.promises.lock().unwrap().remove(&promise_id);
            match promise {
                Some(promise) => match result {
                    Ok(value) => {
                        let refs = super::remote::WireRefs::new(state.clone());
                        match islet_bridge::unmarshal(&value, &refs) {
                            Ok(value) => {
                                promise.resolve(value);
                            },
                            Err(error) => {
                                promise.reject(error);
                            },
                        }
                    },
                    Err(record) => {
                        promise.reject(record.to_js_error());
                    },
                },
                // The settlement can overtake the response carrying the
                // ref; park it until the ref resolves.
                None => {
                    state
                        .settled_promises
                        .lock()
                        .unwrap()
                        .insert(promise_id, result);
                },
            }
        },
        Message::CallbackIteratorNext {
            request_id,
            iterator_id,
        } => {
            let iterator = state.iterators.lock().unwrap().get(&iterator_id).cloned();
            let state = state.clone();
            tokio::spawn(async move {
                let response = iterator_step(&state, iterator, iterator_id).await;
                match response {
                    Ok(value) => state.send(&Message::CallbackIteratorResult {
                        request_id,
                        value: value.0,
                        done: value.1,
                    }),
                    Err(error) => state.send(&Message::CallbackError { request_id, error }),
                }
            });
        },
        Message::CallbackIteratorResult {
            request_id,
            value,
            done,
        } => {
            state.resolve_pending(
                request_id,
                ResponsePayload::Value(WireValue::Map(vec![
                    ("value".to_string(), value),
                    ("done".to_string(), WireValue::Bool(done)),
                ])),
            );
        },
        Message::CallbackStreamStart { stream_id, .. } => {
            // Ensure the buffering channel exists before chunks arrive.
            let _ = state.incoming_stream_sender(stream_id);
        },
        Message::CallbackStreamCancel { stream_id, .. } => {
            state.mark_stream_cancelled(stream_id);
        },
        Message::Event { name, .. } => {
            debug!("peer event '{name}'");
        },
        Message::Ping { seq } => {
            state.send(&Message::Pong { seq });
        },
        Message::Pong { .. } => {},
    }
}

async fn iterator_step(
    state: &Arc<ConnectionState>,
    iterator: Option<HostAsyncIterator>,
    iterator_id: u64,
) -> Result<(WireValue, bool), ErrorRecord> {
    let Some(iterator) = iterator else {
        return Err(ErrorRecord::new(
            ErrorCode::CallbackFailed,
            "Error",
            format!("iterator {iterator_id} not found"),
        ));
    };
    let step = iterator
        .next()
        .await
        .map_err(|error| ErrorRecord::from_js_error(ErrorCode::CallbackFailed, &error))?;
    match step {
        Some(value) => {
            let refs = super::remote::WireRefs::new(state.clone());
            let marshalled = islet_bridge::marshal(&value, &refs, &Default::default())
                .await
                .map_err(|error| ErrorRecord::from_js_error(ErrorCode::CallbackFailed, &error))?;
            Ok((marshalled, false))
        },
        None => Ok((WireValue::Null, true)),
    }
}
