// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use islet_bridge::{HostFunction, HostValue, RefRegistrar};
use islet_utils::error::JsError;
use islet_wire::{
    message::{CallbackRegistrations, CustomFunctionRegistration, FsCallbacks, TestEnvOptions},
    ErrorCode, ErrorRecord, Ref, RequestOp, RuntimeOptions, WireValue,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::outbound::{
    ConsoleEntry, ConsoleHandler, ConsoleLevel, CustomFunction, FetchHandler, FsHandler,
    ModuleLoader, PlaywrightHandler,
};

use super::{
    connection::{spawn_connection, ConnectionConfig, ConnectionState, RejectAllHandler},
    remote::WireRefs,
};

/// Client-side registrations for one runtime. Handlers live here; only
/// their callback ids cross the wire.
#[derive(Default)]
pub struct ClientRuntimeOptions {
    pub memory_limit_mb: Option<u32>,
    pub cwd: Option<String>,
    pub namespace_id: Option<String>,
    pub test_timeout_ms: Option<u64>,
    pub console: Option<Arc<dyn ConsoleHandler>>,
    pub fetch: Option<Arc<dyn FetchHandler>>,
    pub fs: Option<Arc<dyn FsHandler>>,
    pub module_loader: Option<Arc<dyn ModuleLoader>>,
    pub playwright: Option<Arc<dyn PlaywrightHandler>>,
    pub custom_functions: Vec<CustomFunction>,
}

/// The client half of the daemon split.
pub struct Client {
    conn: Arc<ConnectionState>,
    refs: WireRefs,
}

impl Client {
    /// Connects over any reliable in-order byte stream.
    pub fn connect<S>(io: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = spawn_connection(io, config, Arc::new(RejectAllHandler));
        let refs = WireRefs::new(conn.clone());
        Self { conn, refs }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_alive()
    }

    /// Sends CREATE_RUNTIME with this client's callback registrations.
    pub async fn create_runtime(
        &self,
        options: ClientRuntimeOptions,
    ) -> Result<RuntimeHandle, ErrorRecord> {
        let wire_options = self.runtime_options(options);
        let payload = self
            .conn
            .request(RequestOp::CreateRuntime(wire_options))
            .await?;
        let value = self.refs.payload_to_host(payload)?;
        let isolate_id = match value {
            HostValue::Wire(Ref::Isolate { isolate_id }) => isolate_id,
            other => {
                return Err(ErrorRecord::new(
                    ErrorCode::InvalidField,
                    "Error",
                    format!("expected an isolate ref, got {}", other.kind_name()),
                ));
            },
        };
        Ok(self.runtime(isolate_id))
    }

    /// Reattaches to an isolate by id.
    pub fn runtime(&self, isolate_id: u64) -> RuntimeHandle {
        RuntimeHandle {
            conn: self.conn.clone(),
            refs: self.refs.clone(),
            isolate_id,
        }
    }

    fn runtime_options(&self, options: ClientRuntimeOptions) -> RuntimeOptions {
        let mut callbacks = CallbackRegistrations::default();
        if let Some(console) = options.console {
            callbacks.console = Some(self.register(console_function(console)));
        }
        if let Some(fetch) = options.fetch {
            callbacks.fetch = Some(self.register(fetch_function(fetch)));
        }
        if let Some(fs) = options.fs {
            callbacks.fs = Some(FsCallbacks {
                read_file: Some(self.register(fs_read_function(fs.clone()))),
                write_file: Some(self.register(fs_write_function(fs.clone()))),
                stat: Some(self.register(fs_stat_function(fs.clone()))),
                read_dir: Some(self.register(fs_read_dir_function(fs))),
            });
        }
        if let Some(loader) = options.module_loader {
            callbacks.module_loader = Some(self.register(module_loader_function(loader)));
        }
        if let Some(playwright) = options.playwright {
            callbacks.playwright = Some(self.register(playwright_function(playwright)));
        }
        for custom in options.custom_functions {
            let callback_id = self.register(custom.func);
            callbacks.custom_functions.push(CustomFunctionRegistration {
                name: custom.name,
                callback_id,
                is_async: custom.is_async,
            });
        }
        RuntimeOptions {
            memory_limit_mb: options.memory_limit_mb,
            cwd: options.cwd,
            namespace_id: options.namespace_id,
            test_env: options.test_timeout_ms.map(|timeout| TestEnvOptions {
                test_timeout_ms: Some(timeout),
            }),
            callbacks,
        }
    }

    fn register(&self, func: HostFunction) -> u64 {
        match self.refs.register_function(func) {
            Ref::Callback { callback_id } => callback_id,
            _ => unreachable!("register_function returns a callback ref"),
        }
    }
}

/// A created (or reattached) isolate as seen from the client.
pub struct RuntimeHandle {
    conn: Arc<ConnectionState>,
    refs: WireRefs,
    isolate_id: u64,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("isolate_id", &self.isolate_id)
            .finish()
    }
}

impl RuntimeHandle {
    pub fn isolate_id(&self) -> u64 {
        self.isolate_id
    }

    pub async fn evaluate(&self, source: &str) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::Evaluate {
            isolate_id: self.isolate_id,
            source: source.to_string(),
            filename: None,
        })
        .await
    }

    pub async fn evaluate_file(
        &self,
        source: &str,
        filename: &str,
    ) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::Evaluate {
            isolate_id: self.isolate_id,
            source: source.to_string(),
            filename: Some(filename.to_string()),
        })
        .await
    }

    pub async fn call_function(
        &self,
        name: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue, ErrorRecord> {
        let args = self.marshal_args(args).await?;
        self.request(RequestOp::CallFunction {
            isolate_id: self.isolate_id,
            name: name.to_string(),
            args,
        })
        .await
    }

    pub async fn get_property(&self, handle_id: u64, name: &str) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::GetProperty {
            isolate_id: self.isolate_id,
            handle_id,
            name: name.to_string(),
        })
        .await
    }

    pub async fn set_property(
        &self,
        handle_id: u64,
        name: &str,
        value: HostValue,
    ) -> Result<(), ErrorRecord> {
        let value = self.marshal(&value).await?;
        self.request(RequestOp::SetProperty {
            isolate_id: self.isolate_id,
            handle_id,
            name: name.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    pub async fn call_method(
        &self,
        handle_id: u64,
        name: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue, ErrorRecord> {
        let args = self.marshal_args(args).await?;
        self.request(RequestOp::CallMethod {
            isolate_id: self.isolate_id,
            handle_id,
            name: name.to_string(),
            args,
        })
        .await
    }

    pub async fn call_handle(
        &self,
        handle_id: u64,
        args: Vec<HostValue>,
    ) -> Result<HostValue, ErrorRecord> {
        let args = self.marshal_args(args).await?;
        self.request(RequestOp::CallHandle {
            isolate_id: self.isolate_id,
            handle_id,
            args,
        })
        .await
    }

    pub async fn await_promise(&self, promise_id: u64) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::AwaitPromise {
            isolate_id: self.isolate_id,
            promise_id,
        })
        .await
    }

    pub async fn iterator_next(&self, iterator_id: u64) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::IteratorNext {
            isolate_id: self.isolate_id,
            iterator_id,
        })
        .await
    }

    pub async fn iterator_return(&self, iterator_id: u64) -> Result<HostValue, ErrorRecord> {
        self.request(RequestOp::IteratorReturn {
            isolate_id: self.isolate_id,
            iterator_id,
        })
        .await
    }

    pub async fn release_handle(&self, handle_id: u64) -> Result<(), ErrorRecord> {
        self.request(RequestOp::ReleaseHandle {
            isolate_id: self.isolate_id,
            handle_id,
        })
        .await?;
        Ok(())
    }

    pub async fn list_properties(&self, handle_id: u64) -> Result<Vec<String>, ErrorRecord> {
        let value = self
            .request(RequestOp::ListProperties {
                isolate_id: self.isolate_id,
                handle_id,
            })
            .await?;
        match value {
            HostValue::Array(items) => Ok(items
                .lock()
                .unwrap()
                .iter()
                .filter_map(|item| match item {
                    HostValue::String(name) => Some(name.clone()),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn dispose(&self) -> Result<(), ErrorRecord> {
        self.request(RequestOp::DisposeRuntime {
            isolate_id: self.isolate_id,
        })
        .await?;
        Ok(())
    }

    async fn request(&self, op: RequestOp) -> Result<HostValue, ErrorRecord> {
        let payload = self.conn.request(op).await?;
        self.refs.payload_to_host(payload)
    }

    async fn marshal(&self, value: &HostValue) -> Result<WireValue, ErrorRecord> {
        self.refs
            .marshal_value(value)
            .await
            .map_err(|error| ErrorRecord::from_js_error(ErrorCode::InvalidField, &error))
    }

    async fn marshal_args(&self, args: Vec<HostValue>) -> Result<Vec<WireValue>, ErrorRecord> {
        let mut wire_args = Vec::with_capacity(args.len());
        for value in &args {
            wire_args.push(self.marshal(value).await?);
        }
        Ok(wire_args)
    }
}

/// Extracts a retained-handle id from an EVALUATE/CALL response.
pub fn handle_id(value: &HostValue) -> Option<u64> {
    crate::setup_core::object_get(value, "__handleId")
        .as_ref()
        .and_then(|id| match id {
            HostValue::Int(id) if *id >= 0 => Some(*id as u64),
            _ => None,
        })
}

// --- handler → function adapters ---

fn console_function(handler: Arc<dyn ConsoleHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let level = match args.first() {
                Some(HostValue::String(level)) => ConsoleLevel::from_str(level),
                _ => ConsoleLevel::Log,
            };
            let entries = match args.get(1) {
                Some(HostValue::Array(items)) => items.lock().unwrap().clone(),
                _ => Vec::new(),
            };
            handler
                .on_entry(ConsoleEntry {
                    level,
                    args: entries,
                })
                .await;
            Ok(HostValue::Null)
        })
    })
}

fn fetch_function(handler: Arc<dyn FetchHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let request = match args.into_iter().next() {
                Some(HostValue::Request(request)) => *request,
                _ => return Err(JsError::type_error("Expected a Request")),
            };
            let response = handler.fetch(request).await?;
            Ok(HostValue::Response(Box::new(response)))
        })
    })
}

fn path_arg(args: &[HostValue]) -> Result<String, JsError> {
    match args.first() {
        Some(HostValue::String(path)) => Ok(path.clone()),
        _ => Err(JsError::type_error("Expected a path string")),
    }
}

fn fs_read_function(handler: Arc<dyn FsHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let path = path_arg(&args)?;
            Ok(HostValue::Bytes(handler.read_file(&path).await?))
        })
    })
}

fn fs_write_function(handler: Arc<dyn FsHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let path = path_arg(&args)?;
            let data = match args.get(1) {
                Some(HostValue::Bytes(data)) => data.clone(),
                _ => return Err(JsError::type_error("Expected file contents")),
            };
            handler.write_file(&path, data).await?;
            Ok(HostValue::Null)
        })
    })
}

fn fs_stat_function(handler: Arc<dyn FsHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let path = path_arg(&args)?;
            let stat = handler.stat(&path).await?;
            Ok(HostValue::object(vec![
                ("isFile".to_string(), HostValue::Bool(stat.is_file)),
                (
                    "isDirectory".to_string(),
                    HostValue::Bool(stat.is_directory),
                ),
                ("size".to_string(), HostValue::Int(stat.size as i64)),
                ("modifiedMs".to_string(), HostValue::Int(stat.modified_ms)),
            ]))
        })
    })
}

fn fs_read_dir_function(handler: Arc<dyn FsHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let path = path_arg(&args)?;
            let entries = handler.read_dir(&path).await?;
            Ok(HostValue::array(
                entries.into_iter().map(HostValue::String).collect(),
            ))
        })
    })
}

fn module_loader_function(handler: Arc<dyn ModuleLoader>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let specifier = path_arg(&args)?;
            Ok(HostValue::String(handler.load(&specifier).await?))
        })
    })
}

fn playwright_function(handler: Arc<dyn PlaywrightHandler>) -> HostFunction {
    HostFunction::new(move |args| {
        let handler = handler.clone();
        Box::pin(async move {
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(HostValue::String(name)) => name,
                _ => return Err(JsError::type_error("Expected an operation name")),
            };
            let op_args = match args.next() {
                Some(HostValue::Array(items)) => items.lock().unwrap().clone(),
                _ => Vec::new(),
            };
            handler.op(&name, op_args).await
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use islet_bridge::{EngineError, EngineValue};
    use islet_test::{EngineProbe, MockEngine};
    use islet_utils::error::JsError;

    use super::*;
    use crate::daemon::{Daemon, DaemonConfig, EngineFactory};
    use islet_streams::ReadableStream;

    fn test_daemon() -> (Arc<Daemon>, Arc<Mutex<Vec<EngineProbe>>>) {
        let probes: Arc<Mutex<Vec<EngineProbe>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = probes.clone();
        let factory: EngineFactory = Arc::new(move || {
            let engine = MockEngine::new();
            captured.lock().unwrap().push(engine.probe());
            Box::new(engine)
        });
        (
            Daemon::with_config(factory, DaemonConfig::default()),
            probes,
        )
    }

    fn connect(daemon: &Arc<Daemon>) -> Client {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        daemon.serve(server_io);
        Client::connect(client_io, ConnectionConfig::default())
    }

    #[tokio::test]
    async fn create_evaluate_dispose_round_trip() {
        let (daemon, probes) = test_daemon();
        let client = connect(&daemon);

        let runtime = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap();
        assert_eq!(daemon.live_runtimes(), 1);

        let probe = probes.lock().unwrap()[0].clone();
        probe.script_eval(Ok(EngineValue::Number(42.0)));
        let result = runtime.evaluate("40 + 2").await.unwrap();
        assert_eq!(result, HostValue::Int(42));
        assert!(probe.evals().iter().any(|source| source == "40 + 2"));

        // Structured results marshal into host structures.
        probe.script_eval(Ok(EngineValue::Object(vec![(
            "ok".to_string(),
            EngineValue::Bool(true),
        )])));
        let result = runtime.evaluate("({ok: true})").await.unwrap();
        assert_eq!(
            crate::setup_core::object_get(&result, "ok"),
            Some(HostValue::Bool(true))
        );

        runtime.dispose().await.unwrap();
        assert_eq!(daemon.live_runtimes(), 0);

        // Operations on the disposed isolate report ISOLATE_DISPOSED.
        let err = runtime.evaluate("1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::IsolateDisposed);
    }

    #[tokio::test]
    async fn unknown_isolates_are_distinguished_from_disposed() {
        let (daemon, _probes) = test_daemon();
        let client = connect(&daemon);

        let err = client.runtime(999).evaluate("1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::IsolateNotFound);
    }

    #[tokio::test]
    async fn guest_exceptions_surface_as_script_errors() {
        let (daemon, probes) = test_daemon();
        let client = connect(&daemon);
        let runtime = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap();

        let probe = probes.lock().unwrap()[0].clone();
        probe.script_eval(Err(EngineError::Script(JsError::type_error(
            "x is not a function",
        ))));
        let err = runtime.evaluate("x()").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ScriptException);
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "x is not a function");
    }

    #[tokio::test]
    async fn memory_limit_maps_to_its_code() {
        let (daemon, probes) = test_daemon();
        let client = connect(&daemon);
        let runtime = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap();

        let probe = probes.lock().unwrap()[0].clone();
        probe.script_eval(Err(EngineError::MemoryLimit));
        let err = runtime.evaluate("big()").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::IsolateMemoryLimit);
    }

    #[tokio::test]
    async fn custom_functions_invoke_back_into_the_client() {
        let (daemon, probes) = test_daemon();
        let client = connect(&daemon);

        let add = HostFunction::new(|args| {
            Box::pin(async move {
                let sum = args
                    .iter()
                    .map(|value| match value {
                        HostValue::Int(n) => *n,
                        _ => 0,
                    })
                    .sum();
                Ok(HostValue::Int(sum))
            })
        });
        let runtime = client
            .create_runtime(ClientRuntimeOptions {
                custom_functions: vec![CustomFunction {
                    name: "hostAdd".to_string(),
                    is_async: true,
                    func: add,
                }],
                ..ClientRuntimeOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(runtime.isolate_id(), 1);

        // The guest-side global trampolines through the daemon back to the
        // client's callback.
        let probe = probes.lock().unwrap()[0].clone();
        let result = probe
            .invoke_global(
                "hostAdd",
                vec![EngineValue::Number(19.0), EngineValue::Number(23.0)],
            )
            .await
            .unwrap();
        assert_eq!(result, EngineValue::Number(42.0));
    }

    #[tokio::test]
    async fn host_function_streams_arrive_chunked() {
        let (daemon, _probes) = test_daemon();
        daemon.register_host_function(
            "numbers",
            HostFunction::new(|_args| {
                Box::pin(async move {
                    Ok(HostValue::Stream(ReadableStream::from_chunks(vec![
                        HostValue::Int(1),
                        HostValue::Int(2),
                        HostValue::Int(3),
                    ])))
                })
            }),
        );
        let client = connect(&daemon);
        let runtime = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap();

        let result = runtime.call_function("numbers", Vec::new()).await.unwrap();
        let HostValue::Stream(stream) = result else {
            panic!("expected a stream response");
        };
        let chunks = stream.iter().unwrap().collect().await.unwrap();
        assert_eq!(
            chunks,
            vec![HostValue::Int(1), HostValue::Int(2), HostValue::Int(3)]
        );
    }

    #[tokio::test]
    async fn promise_refs_settle_across_the_wire() {
        let (daemon, _probes) = test_daemon();
        daemon.register_host_function(
            "eventually",
            HostFunction::new(|_args| {
                Box::pin(async move {
                    Ok(HostValue::Promise(islet_bridge::HostPromise::resolved(
                        HostValue::Int(7),
                    )))
                })
            }),
        );
        let client = connect(&daemon);
        let runtime = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap();

        let result = runtime.call_function("eventually", Vec::new()).await.unwrap();
        let HostValue::Promise(promise) = result else {
            panic!("expected a promise proxy");
        };
        assert_eq!(promise.wait().await.unwrap(), HostValue::Int(7));
    }

    #[tokio::test]
    async fn namespace_pool_reuses_warm_runtimes() {
        let (daemon, probes) = test_daemon();
        let client = connect(&daemon);

        let options = || ClientRuntimeOptions {
            namespace_id: Some("warm".to_string()),
            ..ClientRuntimeOptions::default()
        };
        let first = client.create_runtime(options()).await.unwrap();
        first.dispose().await.unwrap();
        assert_eq!(daemon.pooled_runtimes(), 1);

        let second = client.create_runtime(options()).await.unwrap();
        assert_ne!(first.isolate_id(), second.isolate_id());
        // Only one engine was ever built.
        assert_eq!(probes.lock().unwrap().len(), 1);
        assert_eq!(daemon.pooled_runtimes(), 0);
    }

    #[tokio::test]
    async fn connection_loss_fails_requests() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        // No daemon on the other side: the peer hangs up immediately.
        drop(server_io);
        let client = Client::connect(client_io, ConnectionConfig::default());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!client.is_connected());
        let err = client
            .create_runtime(ClientRuntimeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionLost);
    }

    #[tokio::test]
    async fn console_entries_reach_the_client_handler() {
        struct RecordingConsole {
            seen: Arc<Mutex<Vec<(ConsoleLevel, usize)>>>,
        }

        #[async_trait::async_trait]
        impl ConsoleHandler for RecordingConsole {
            async fn on_entry(&self, entry: ConsoleEntry) {
                self.seen.lock().unwrap().push((entry.level, entry.args.len()));
            }
        }

        let (daemon, _probes) = test_daemon();
        let client = connect(&daemon);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runtime = client
            .create_runtime(ClientRuntimeOptions {
                console: Some(Arc::new(RecordingConsole { seen: seen.clone() })),
                ..ClientRuntimeOptions::default()
            })
            .await
            .unwrap();

        // The daemon-side console handler forwards entries over the wire.
        let context = daemon_runtime(&daemon, runtime.isolate_id());
        let console = context.outbound.console.clone().unwrap();
        console
            .on_entry(ConsoleEntry {
                level: ConsoleLevel::Warn,
                args: vec![HostValue::string("careful"), HostValue::Int(1)],
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![(ConsoleLevel::Warn, 2)]);
    }

    fn daemon_runtime(daemon: &Arc<Daemon>, isolate_id: u64) -> Arc<crate::IsolateContext> {
        daemon.runtime_for_tests(isolate_id)
    }
}
