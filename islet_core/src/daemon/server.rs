// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use fxhash::{FxHashMap, FxHashSet};
use islet_bridge::{
    Engine, EngineError, EngineValue, HostFunction, HostValue, JsHandle, NativeCallback,
    RefResolver,
};
use islet_streams::{ReadResult, ReadableStream};
use islet_utils::id::IdAllocator;
use islet_wire::{
    ErrorCode, ErrorRecord, Message, Ref, Request, RequestOp, RuntimeOptions, WireValue,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::{
    module_loader::normalize_entry_filename,
    outbound::{CustomFunction, OutboundHandlers},
    runtime::{ContextOptions, IsolateContext, TestEnvConfig},
};

use super::{
    connection::{spawn_connection, ConnectionConfig, ConnectionState, RequestHandler},
    pool::NamespacePool,
    remote::{
        RemoteConsole, RemoteFetch, RemoteFs, RemoteModuleLoader, RemotePlaywright, WireRefs,
    },
};

pub type EngineFactory = Arc<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct DaemonConfig {
    pub connection: ConnectionConfig,
    /// Default evaluation timeout; a test environment's per-test timeout
    /// overrides it.
    pub eval_timeout: Option<Duration>,
}

/// The daemon: owns isolates, routes requests to runtime operations, and
/// brokers callbacks back to clients.
pub struct Daemon {
    engine_factory: EngineFactory,
    config: DaemonConfig,
    runtimes: Mutex<FxHashMap<u64, Arc<IsolateContext>>>,
    disposed: Mutex<FxHashSet<u64>>,
    isolate_ids: IdAllocator,
    pool: NamespacePool,
    host_functions: Mutex<FxHashMap<String, HostFunction>>,
}

impl Daemon {
    pub fn new(engine_factory: EngineFactory) -> Arc<Self> {
        Self::with_config(engine_factory, DaemonConfig::default())
    }

    pub fn with_config(engine_factory: EngineFactory, config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            engine_factory,
            config,
            runtimes: Mutex::new(FxHashMap::default()),
            disposed: Mutex::new(FxHashSet::default()),
            isolate_ids: IdAllocator::new(),
            pool: NamespacePool::default(),
            host_functions: Mutex::new(FxHashMap::default()),
        })
    }

    /// Registers a daemon-side function callable via CALL_FUNCTION. A
    /// function returning a stream produces a streaming response.
    pub fn register_host_function(&self, name: impl Into<String>, func: HostFunction) {
        self.host_functions.lock().unwrap().insert(name.into(), func);
    }

    /// Serves the protocol over a reliable in-order byte stream.
    pub fn serve<S>(self: &Arc<Self>, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handler: Arc<dyn RequestHandler> = Arc::new(DaemonRequestHandler {
            daemon: self.clone(),
        });
        spawn_connection(io, self.config.connection.clone(), handler);
    }

    pub fn live_runtimes(&self) -> usize {
        self.runtimes.lock().unwrap().len()
    }

    pub fn pooled_runtimes(&self) -> usize {
        self.pool.len()
    }

    fn runtime(&self, isolate_id: u64) -> Result<Arc<IsolateContext>, ErrorRecord> {
        if let Some(context) = self.runtimes.lock().unwrap().get(&isolate_id) {
            return Ok(context.clone());
        }
        if self.disposed.lock().unwrap().contains(&isolate_id) {
            Err(ErrorRecord::new(
                ErrorCode::IsolateDisposed,
                "Error",
                format!("isolate {isolate_id} was disposed"),
            ))
        } else {
            Err(ErrorRecord::new(
                ErrorCode::IsolateNotFound,
                "Error",
                format!("isolate {isolate_id} not found"),
            ))
        }
    }

    #[cfg(test)]
    pub(crate) fn runtime_for_tests(&self, isolate_id: u64) -> Arc<IsolateContext> {
        self.runtimes
            .lock()
            .unwrap()
            .get(&isolate_id)
            .cloned()
            .expect("runtime exists")
    }

    fn eval_timeout_for(&self, context: &IsolateContext) -> Option<Duration> {
        context
            .test_env()
            .and_then(|test_env| test_env.test_timeout_ms)
            .map(Duration::from_millis)
            .or(self.config.eval_timeout)
    }
}

struct DaemonRequestHandler {
    daemon: Arc<Daemon>,
}

enum Respond {
    Value(WireValue),
    Stream(ReadableStream<HostValue>),
}

#[async_trait]
impl RequestHandler for DaemonRequestHandler {
    async fn handle(&self, conn: Arc<ConnectionState>, request: Request) {
        let request_id = request.request_id;
        match self.dispatch(&conn, request.op).await {
            Ok(Respond::Value(value)) => {
                conn.send(&Message::ResponseOk { request_id, value });
            },
            Ok(Respond::Stream(stream)) => {
                respond_stream(&conn, request_id, stream).await;
            },
            Err(error) => {
                conn.send(&Message::ResponseError { request_id, error });
            },
        }
    }
}

impl DaemonRequestHandler {
    async fn dispatch(
        &self,
        conn: &Arc<ConnectionState>,
        op: RequestOp,
    ) -> Result<Respond, ErrorRecord> {
        let daemon = &self.daemon;
        let refs = WireRefs::new(conn.clone());
        match op {
            RequestOp::CreateRuntime(options) => self.create_runtime(&refs, options).await,
            RequestOp::DisposeRuntime { isolate_id } => self.dispose_runtime(isolate_id).await,
            RequestOp::Evaluate {
                isolate_id,
                source,
                filename,
            } => {
                let context = daemon.runtime(isolate_id)?;
                // Validates and normalizes the entry filename up front.
                if let Some(filename) = filename.as_deref() {
                    normalize_entry_filename(Some(filename))
                        .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error))?;
                }
                let result = match daemon.eval_timeout_for(&context) {
                    Some(timeout) => tokio::time::timeout(timeout, context.evaluate(&source))
                        .await
                        .unwrap_or(Err(EngineError::Timeout)),
                    None => context.evaluate(&source).await,
                };
                let value = result.map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::CallFunction {
                isolate_id,
                name,
                args,
            } => self.call_function(&refs, isolate_id, name, args).await,
            RequestOp::GetProperty {
                isolate_id,
                handle_id,
                name,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let value = context
                    .with_engine(|engine| engine.get_property(JsHandle(handle_id), &name))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::SetProperty {
                isolate_id,
                handle_id,
                name,
                value,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let host = refs
                    .unmarshal_value(&value)
                    .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error))?;
                let engine_value = host_to_engine(&context, &host).await?;
                context
                    .with_engine(|engine| engine.set_property(JsHandle(handle_id), &name, engine_value))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                Ok(Respond::Value(WireValue::Null))
            },
            RequestOp::CallMethod {
                isolate_id,
                handle_id,
                name,
                args,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let method = context
                    .with_engine(|engine| engine.get_property(JsHandle(handle_id), &name))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                let Some(method) = method.as_handle() else {
                    return Err(not_a_function(&name));
                };
                let engine_args = self.wire_args_to_engine(&refs, &context, args).await?;
                let value = context
                    .call_handle(method, engine_args)
                    .await
                    .map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::CallHandle {
                isolate_id,
                handle_id,
                args,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let engine_args = self.wire_args_to_engine(&refs, &context, args).await?;
                let value = context
                    .call_handle(JsHandle(handle_id), engine_args)
                    .await
                    .map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::AwaitPromise {
                isolate_id,
                promise_id,
            } => {
                // The engine settles a promise handle when it is called.
                let context = daemon.runtime(isolate_id)?;
                let value = context
                    .call_handle(JsHandle(promise_id), Vec::new())
                    .await
                    .map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::IteratorNext {
                isolate_id,
                iterator_id,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let next = context
                    .with_engine(|engine| engine.get_property(JsHandle(iterator_id), "next"))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                let Some(next) = next.as_handle() else {
                    return Err(not_a_function("next"));
                };
                let value = context
                    .call_handle(next, Vec::new())
                    .await
                    .map_err(engine_record)?;
                self.engine_value_response(&refs, value).await
            },
            RequestOp::IteratorReturn {
                isolate_id,
                iterator_id,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let finish = context
                    .with_engine(|engine| engine.get_property(JsHandle(iterator_id), "return"))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                if let Some(finish) = finish.as_handle() {
                    context
                        .call_handle(finish, Vec::new())
                        .await
                        .map_err(engine_record)?;
                }
                Ok(Respond::Value(WireValue::Null))
            },
            RequestOp::ReleaseHandle {
                isolate_id,
                handle_id,
            } => {
                let context = daemon.runtime(isolate_id)?;
                // Releasing an already-dead handle is not an error.
                let _ = context
                    .with_engine(|engine| engine.release_handle(JsHandle(handle_id)))
                    .await
                    .map_err(engine_record)?;
                Ok(Respond::Value(WireValue::Null))
            },
            RequestOp::ListProperties {
                isolate_id,
                handle_id,
            } => {
                let context = daemon.runtime(isolate_id)?;
                let names = context
                    .with_engine(|engine| engine.list_properties(JsHandle(handle_id)))
                    .await
                    .map_err(engine_record)?
                    .map_err(engine_record)?;
                Ok(Respond::Value(WireValue::Array(
                    names.into_iter().map(WireValue::Str).collect(),
                )))
            },
        }
    }

    async fn create_runtime(
        &self,
        refs: &WireRefs,
        options: RuntimeOptions,
    ) -> Result<Respond, ErrorRecord> {
        let daemon = &self.daemon;

        // Warm reuse from the namespace pool when possible.
        if let Some(namespace_id) = &options.namespace_id {
            if let Some(context) = daemon.pool.take(namespace_id) {
                let isolate_id = daemon.isolate_ids.next();
                context.set_id(isolate_id);
                daemon
                    .runtimes
                    .lock()
                    .unwrap()
                    .insert(isolate_id, context);
                debug!("reused pooled runtime for namespace '{namespace_id}'");
                return Ok(Respond::Value(WireValue::Ref(Ref::Isolate { isolate_id })));
            }
        }

        let outbound = outbound_from_registrations(refs, &options);
        let context_options = ContextOptions {
            memory_limit_mb: options.memory_limit_mb,
            cwd: options.cwd.unwrap_or_else(|| "/".to_string()),
            namespace_id: options.namespace_id.clone(),
            test_env: options.test_env.as_ref().map(|test_env| TestEnvConfig {
                test_timeout_ms: test_env.test_timeout_ms,
            }),
            outbound,
        };
        let engine = (daemon.engine_factory)();
        let context = IsolateContext::new(engine, context_options)
            .await
            .map_err(|error| ErrorRecord::from_js_error(ErrorCode::ScriptException, &error))?;
        let isolate_id = daemon.isolate_ids.next();
        context.set_id(isolate_id);
        daemon.runtimes.lock().unwrap().insert(isolate_id, context);
        info!("created isolate {isolate_id}");
        Ok(Respond::Value(WireValue::Ref(Ref::Isolate { isolate_id })))
    }

    async fn dispose_runtime(&self, isolate_id: u64) -> Result<Respond, ErrorRecord> {
        let daemon = &self.daemon;
        let context = daemon
            .runtimes
            .lock()
            .unwrap()
            .remove(&isolate_id)
            .ok_or_else(|| match daemon.disposed.lock().unwrap().contains(&isolate_id) {
                true => ErrorRecord::new(
                    ErrorCode::IsolateDisposed,
                    "Error",
                    format!("isolate {isolate_id} was disposed"),
                ),
                false => ErrorRecord::new(
                    ErrorCode::IsolateNotFound,
                    "Error",
                    format!("isolate {isolate_id} not found"),
                ),
            })?;
        daemon.disposed.lock().unwrap().insert(isolate_id);

        match context.namespace_id() {
            Some(namespace_id) => {
                let namespace_id = namespace_id.to_string();
                context.park().await;
                if !daemon.pool.put(&namespace_id, context.clone()) {
                    context.dispose().await;
                }
            },
            None => context.dispose().await,
        }
        Ok(Respond::Value(WireValue::Null))
    }

    async fn call_function(
        &self,
        refs: &WireRefs,
        isolate_id: u64,
        name: String,
        args: Vec<WireValue>,
    ) -> Result<Respond, ErrorRecord> {
        // Daemon-side host functions shadow guest globals.
        let host_function = self.daemon.host_functions.lock().unwrap().get(&name).cloned();
        if let Some(function) = host_function {
            let mut host_args = Vec::with_capacity(args.len());
            for value in &args {
                host_args.push(refs.unmarshal_value(value).map_err(|error| {
                    ErrorRecord::from_js_error(ErrorCode::InvalidField, &error)
                })?);
            }
            let result = function
                .call(host_args)
                .await
                .map_err(|error| ErrorRecord::from_js_error(ErrorCode::ScriptException, &error))?;
            if let HostValue::Stream(stream) = result {
                return Ok(Respond::Stream(stream));
            }
            let value = refs.marshal_value(&result).await.map_err(|error| {
                ErrorRecord::from_js_error(ErrorCode::ScriptException, &error)
            })?;
            return Ok(Respond::Value(value));
        }

        let context = self.daemon.runtime(isolate_id)?;
        let function = context
            .with_engine(|engine| {
                let global = engine.global()?;
                engine.get_property(global, &name)
            })
            .await
            .map_err(engine_record)?
            .map_err(engine_record)?;
        let Some(function) = function.as_handle() else {
            return Err(not_a_function(&name));
        };
        let engine_args = self.wire_args_to_engine(refs, &context, args).await?;
        let value = context
            .call_handle(function, engine_args)
            .await
            .map_err(engine_record)?;
        self.engine_value_response(refs, value).await
    }

    async fn wire_args_to_engine(
        &self,
        refs: &WireRefs,
        context: &Arc<IsolateContext>,
        args: Vec<WireValue>,
    ) -> Result<Vec<EngineValue>, ErrorRecord> {
        let mut engine_args = Vec::with_capacity(args.len());
        for value in &args {
            let host = refs
                .unmarshal_value(value)
                .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error))?;
            engine_args.push(host_to_engine(context, &host).await?);
        }
        Ok(engine_args)
    }

    /// Shapes an engine result for the wire: primitives and structures
    /// marshal; opaque guest values are retained and returned as handles.
    async fn engine_value_response(
        &self,
        refs: &WireRefs,
        value: EngineValue,
    ) -> Result<Respond, ErrorRecord> {
        if let EngineValue::Handle(handle) = value {
            return Ok(Respond::Value(WireValue::Map(vec![(
                "__handleId".to_string(),
                WireValue::Uint(handle.0),
            )])));
        }
        let host = HostValue::from_engine(value);
        let wire = refs
            .marshal_value(&host)
            .await
            .map_err(|error| ErrorRecord::from_js_error(ErrorCode::ScriptException, &error))?;
        Ok(Respond::Value(wire))
    }
}

/// Converts a host value into an engine value, materializing functions as
/// engine callbacks.
async fn host_to_engine(
    context: &Arc<IsolateContext>,
    value: &HostValue,
) -> Result<EngineValue, ErrorRecord> {
    if let HostValue::Function(function) = value {
        let function = function.clone();
        let callback: NativeCallback = Arc::new(move |args: Vec<EngineValue>| {
            let function = function.clone();
            Box::pin(async move {
                let host_args: Vec<HostValue> =
                    args.into_iter().map(HostValue::from_engine).collect();
                let result = function.call(host_args).await?;
                result.to_engine()
            })
        });
        let handle = context
            .with_engine(|engine| engine.create_callback(callback))
            .await
            .map_err(engine_record)?
            .map_err(engine_record)?;
        context.track_unmarshaled(handle);
        return Ok(EngineValue::Handle(handle));
    }
    value
        .to_engine()
        .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error))
}

/// Streams a response: START, one CHUNK per stream chunk, then END.
async fn respond_stream(
    conn: &Arc<ConnectionState>,
    request_id: u64,
    stream: ReadableStream<HostValue>,
) {
    let refs = WireRefs::new(conn.clone());
    let stream_id = conn.stream_ids.next();
    conn.send(&Message::ResponseStreamStart {
        request_id,
        stream_id,
    });
    let reader = match stream.get_reader() {
        Ok(reader) => reader,
        Err(error) => {
            conn.send(&Message::ResponseStreamEnd {
                stream_id,
                error: Some(ErrorRecord::from_js_error(ErrorCode::StreamClosed, &error)),
            });
            return;
        },
    };
    loop {
        match reader.read().await {
            Ok(ReadResult::Chunk(chunk)) => match refs.marshal_value(&chunk).await {
                Ok(chunk) => conn.send(&Message::ResponseStreamChunk { stream_id, chunk }),
                Err(error) => {
                    conn.send(&Message::ResponseStreamEnd {
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
                conn.send(&Message::ResponseStreamEnd {
                    stream_id,
                    error: None,
                });
                break;
            },
            Err(error) => {
                conn.send(&Message::ResponseStreamEnd {
                    stream_id,
                    error: Some(ErrorRecord::from_js_error(ErrorCode::StreamClosed, &error)),
                });
                break;
            },
        }
    }
    reader.release_lock();
}

fn outbound_from_registrations(refs: &WireRefs, options: &RuntimeOptions) -> OutboundHandlers {
    let callbacks = &options.callbacks;
    let mut outbound = OutboundHandlers::default();
    if let Some(callback_id) = callbacks.console {
        outbound.console = Some(Arc::new(RemoteConsole {
            callback: refs.resolve_callback(callback_id),
        }));
    }
    if let Some(callback_id) = callbacks.fetch {
        outbound.fetch = Some(Arc::new(RemoteFetch {
            callback: refs.resolve_callback(callback_id),
        }));
    }
    if let Some(fs) = &callbacks.fs {
        outbound.fs = Some(Arc::new(RemoteFs {
            read_file: fs.read_file.map(|id| refs.resolve_callback(id)),
            write_file: fs.write_file.map(|id| refs.resolve_callback(id)),
            stat: fs.stat.map(|id| refs.resolve_callback(id)),
            read_dir: fs.read_dir.map(|id| refs.resolve_callback(id)),
        }));
    }
    if let Some(callback_id) = callbacks.module_loader {
        outbound.module_loader = Some(Arc::new(RemoteModuleLoader {
            callback: refs.resolve_callback(callback_id),
        }));
    }
    if let Some(callback_id) = callbacks.playwright {
        outbound.playwright = Some(Arc::new(RemotePlaywright {
            callback: refs.resolve_callback(callback_id),
        }));
    }
    for custom in &callbacks.custom_functions {
        outbound.custom_functions.push(CustomFunction {
            name: custom.name.clone(),
            is_async: custom.is_async,
            func: refs.resolve_callback(custom.callback_id),
        });
    }
    outbound
}

fn engine_record(error: EngineError) -> ErrorRecord {
    match error {
        EngineError::Script(error) => {
            ErrorRecord::from_js_error(ErrorCode::ScriptException, &error)
        },
        EngineError::MemoryLimit => ErrorRecord::new(
            ErrorCode::IsolateMemoryLimit,
            "Error",
            "memory limit exceeded",
        ),
        EngineError::Timeout => {
            ErrorRecord::new(ErrorCode::IsolateTimeout, "Error", "execution timed out")
        },
        EngineError::Terminated => ErrorRecord::new(
            ErrorCode::IsolateDisposed,
            "Error",
            "isolate was disposed",
        ),
        EngineError::DeadHandle(handle) => ErrorRecord::new(
            ErrorCode::ScriptException,
            "Error",
            format!("handle {handle} is not live"),
        ),
    }
}

fn not_a_function(name: &str) -> ErrorRecord {
    ErrorRecord::new(
        ErrorCode::ScriptException,
        "TypeError",
        format!("{name} is not a function"),
    )
}
