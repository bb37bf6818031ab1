// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridges guest-provided underlying source/sink/transformer hooks onto the
//! host stream engine. Hook invocation acquires the context's engine lock,
//! so these streams are driven from host-side tasks (pipes, daemon handle
//! operations, RPC streaming); a reentrant engine adapter is required for a
//! guest to synchronously consume its own hooked stream mid-evaluation.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use islet_bridge::{Engine, EngineError, EngineValue, HostValue, JsHandle, NativeCallback};
use islet_streams::{
    ReadableStreamDefaultController, Sink, Source, StreamResult, Transformer,
    TransformStreamDefaultController, WritableStreamDefaultController,
};
use islet_utils::error::JsError;

use crate::runtime::IsolateContext;

/// Where the guest's hooks live: either individual function handles pulled
/// out of a plain options object, or an opaque object handle resolved
/// lazily through `get_property`.
pub(crate) enum GuestHooks {
    Fields(Vec<(String, JsHandle)>),
    Object(JsHandle),
}

impl GuestHooks {
    /// Extracts hooks from a constructor argument. Plain objects carry
    /// their function fields as handles; an opaque handle is kept whole.
    pub(crate) fn from_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::EngineHandle(handle) => Some(Self::Object(*handle)),
            HostValue::Object(entries) => {
                let fields = entries
                    .lock()
                    .unwrap()
                    .iter()
                    .filter_map(|(key, entry)| match entry {
                        HostValue::EngineHandle(handle) => Some((key.clone(), *handle)),
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                Some(Self::Fields(fields))
            },
            _ => None,
        }
    }

    fn lookup(&self, engine: &mut dyn Engine, name: &str) -> Result<Option<JsHandle>, EngineError> {
        match self {
            Self::Fields(fields) => Ok(fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, handle)| *handle)),
            Self::Object(object) => {
                Ok(engine.get_property(*object, name)?.as_handle())
            },
        }
    }
}

fn reason_value(reason: &JsError) -> EngineValue {
    EngineValue::String(reason.message.clone())
}

async fn invoke_hook(
    ctx: &Weak<IsolateContext>,
    hooks: &GuestHooks,
    name: &str,
    controller: Option<&ControllerObject>,
    extra_args: Vec<EngineValue>,
) -> StreamResult<()> {
    let Some(ctx) = ctx.upgrade() else {
        return Ok(());
    };
    let prepared = ctx
        .with_engine(|engine| -> Result<Option<(JsHandle, Vec<EngineValue>)>, EngineError> {
            let Some(hook) = hooks.lookup(engine, name)? else {
                return Ok(None);
            };
            let mut args = extra_args;
            if let Some(controller) = controller {
                args.push(EngineValue::Handle(controller.ensure(engine)?));
            }
            Ok(Some((hook, args)))
        })
        .await
        .map_err(EngineError::into_js_error)?
        .map_err(EngineError::into_js_error)?;

    let Some((hook, args)) = prepared else {
        return Ok(());
    };
    ctx.call_handle(hook, args)
        .await
        .map(|_| ())
        .map_err(EngineError::into_js_error)
}

/// A guest object exposing host callbacks, allocated on first use and
/// reused for every later hook invocation.
pub(crate) struct ControllerObject {
    handle: Mutex<Option<JsHandle>>,
    callbacks: Vec<(&'static str, NativeCallback)>,
}

impl ControllerObject {
    fn new(callbacks: Vec<(&'static str, NativeCallback)>) -> Self {
        Self {
            handle: Mutex::new(None),
            callbacks,
        }
    }

    fn ensure(&self, engine: &mut dyn Engine) -> Result<JsHandle, EngineError> {
        let mut slot = self.handle.lock().unwrap();
        if let Some(handle) = *slot {
            return Ok(handle);
        }
        let mut entries = Vec::with_capacity(self.callbacks.len());
        for (name, callback) in &self.callbacks {
            let callback_handle = engine.create_callback(callback.clone())?;
            entries.push((name.to_string(), EngineValue::Handle(callback_handle)));
        }
        let handle = engine.alloc(EngineValue::Object(entries))?;
        *slot = Some(handle);
        Ok(handle)
    }
}

fn value_arg(args: &[EngineValue]) -> HostValue {
    args.first()
        .cloned()
        .map(HostValue::from_engine)
        .unwrap_or(HostValue::Undefined)
}

fn error_arg(args: &[EngineValue]) -> JsError {
    match args.first() {
        Some(EngineValue::String(message)) => JsError::error(message.clone()),
        Some(other) => JsError::error(format!("{other:?}")),
        None => JsError::error("stream errored"),
    }
}

/// Underlying source backed by guest `{start, pull, cancel}` hooks.
pub(crate) struct GuestSource {
    ctx: Weak<IsolateContext>,
    hooks: GuestHooks,
    controller: Option<ControllerObject>,
}

impl GuestSource {
    pub(crate) fn new(ctx: Weak<IsolateContext>, hooks: GuestHooks) -> Self {
        Self {
            ctx,
            hooks,
            controller: None,
        }
    }

    fn ensure_controller(&mut self, controller: &ReadableStreamDefaultController<HostValue>) {
        if self.controller.is_none() {
            let enqueue_controller = controller.clone();
            let close_controller = controller.clone();
            let error_controller = controller.clone();
            self.controller = Some(ControllerObject::new(vec![
                (
                    "enqueue",
                    Arc::new(move |args: Vec<EngineValue>| {
                        let result = enqueue_controller
                            .enqueue(value_arg(&args))
                            .map(|_| EngineValue::Undefined);
                        Box::pin(async move { result })
                    }),
                ),
                (
                    "close",
                    Arc::new(move |_args: Vec<EngineValue>| {
                        let result = close_controller.close().map(|_| EngineValue::Undefined);
                        Box::pin(async move { result })
                    }),
                ),
                (
                    "error",
                    Arc::new(move |args: Vec<EngineValue>| {
                        error_controller.error(error_arg(&args));
                        Box::pin(async move { Ok(EngineValue::Undefined) })
                    }),
                ),
            ]));
        }
    }
}

#[async_trait]
impl Source<HostValue> for GuestSource {
    async fn start(
        &mut self,
        controller: &ReadableStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "start", self.controller.as_ref(), vec![]).await
    }

    async fn pull(
        &mut self,
        controller: &ReadableStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "pull", self.controller.as_ref(), vec![]).await
    }

    async fn cancel(&mut self, reason: JsError) -> StreamResult<()> {
        invoke_hook(
            &self.ctx,
            &self.hooks,
            "cancel",
            None,
            vec![reason_value(&reason)],
        )
        .await
    }
}

/// Underlying sink backed by guest `{start, write, close, abort}` hooks.
pub(crate) struct GuestSink {
    ctx: Weak<IsolateContext>,
    hooks: GuestHooks,
    controller: Option<ControllerObject>,
}

impl GuestSink {
    pub(crate) fn new(ctx: Weak<IsolateContext>, hooks: GuestHooks) -> Self {
        Self {
            ctx,
            hooks,
            controller: None,
        }
    }

    fn ensure_controller(&mut self, controller: &WritableStreamDefaultController<HostValue>) {
        if self.controller.is_none() {
            let error_controller = controller.clone();
            self.controller = Some(ControllerObject::new(vec![(
                "error",
                Arc::new(move |args: Vec<EngineValue>| {
                    error_controller.error(error_arg(&args));
                    Box::pin(async move { Ok(EngineValue::Undefined) })
                }),
            )]));
        }
    }
}

#[async_trait]
impl Sink<HostValue> for GuestSink {
    async fn start(
        &mut self,
        controller: &WritableStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "start", self.controller.as_ref(), vec![]).await
    }

    async fn write(
        &mut self,
        chunk: HostValue,
        controller: &WritableStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let chunk = chunk.to_engine()?;
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "write", self.controller.as_ref(), vec![chunk]).await
    }

    async fn close(&mut self) -> StreamResult<()> {
        invoke_hook(&self.ctx, &self.hooks, "close", None, vec![]).await
    }

    async fn abort(&mut self, reason: JsError) -> StreamResult<()> {
        invoke_hook(
            &self.ctx,
            &self.hooks,
            "abort",
            None,
            vec![reason_value(&reason)],
        )
        .await
    }
}

/// Transformer backed by guest `{start, transform, flush}` hooks.
pub(crate) struct GuestTransformer {
    ctx: Weak<IsolateContext>,
    hooks: GuestHooks,
    controller: Option<ControllerObject>,
}

impl GuestTransformer {
    pub(crate) fn new(ctx: Weak<IsolateContext>, hooks: GuestHooks) -> Self {
        Self {
            ctx,
            hooks,
            controller: None,
        }
    }

    fn ensure_controller(&mut self, controller: &TransformStreamDefaultController<HostValue>) {
        if self.controller.is_none() {
            let enqueue_controller = controller.clone();
            let error_controller = controller.clone();
            let terminate_controller = controller.clone();
            self.controller = Some(ControllerObject::new(vec![
                (
                    "enqueue",
                    Arc::new(move |args: Vec<EngineValue>| {
                        let result = enqueue_controller
                            .enqueue(value_arg(&args))
                            .map(|_| EngineValue::Undefined);
                        Box::pin(async move { result })
                    }),
                ),
                (
                    "error",
                    Arc::new(move |args: Vec<EngineValue>| {
                        error_controller.error(error_arg(&args));
                        Box::pin(async move { Ok(EngineValue::Undefined) })
                    }),
                ),
                (
                    "terminate",
                    Arc::new(move |_args: Vec<EngineValue>| {
                        terminate_controller.terminate();
                        Box::pin(async move { Ok(EngineValue::Undefined) })
                    }),
                ),
            ]));
        }
    }
}

#[async_trait]
impl Transformer<HostValue, HostValue> for GuestTransformer {
    async fn start(
        &mut self,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "start", self.controller.as_ref(), vec![]).await
    }

    async fn transform(
        &mut self,
        chunk: HostValue,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let chunk = chunk.to_engine()?;
        self.ensure_controller(controller);
        invoke_hook(
            &self.ctx,
            &self.hooks,
            "transform",
            self.controller.as_ref(),
            vec![chunk],
        )
        .await
    }

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        self.ensure_controller(controller);
        invoke_hook(&self.ctx, &self.hooks, "flush", self.controller.as_ref(), vec![]).await
    }
}
