// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Installs the curated web-API surface into a context's global scope:
//! TextEncoder/Decoder (+ stream variants), URL/URLSearchParams,
//! DOMException, AbortController/Signal, Blob/File, the stream classes,
//! the queuing strategies and structuredClone. Everything is backed by
//! host state through the class builder; guest objects carry only their
//! instance id.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use islet_abort::{AbortController, AbortSignal};
use islet_blob::{BlobPart, BlobState, EndingType, FileState};
use islet_bridge::{
    class_builder::wrap_instance, define_async_function, define_function, ClassBuilder, ClassSpec,
    Engine, HostValue, JsHandle, MethodSpec, PropertySpec, StaticMethodSpec, StaticPropertySpec,
};
use islet_bridge::{HostFuture, InstanceRegistry};
use islet_encoding::{EncodeTransformer, TextDecoder, TextDecoderOptions, TextEncoder};
use islet_exceptions::{DOMException, CONSTANTS};
use islet_streams::{
    PipeOptions, QueuingStrategy, ReadResult, ReadableStream, ReadableStreamDefaultReader,
    StreamResult, TransformStream, TransformStreamDefaultController, Transformer, WritableStream,
    WritableStreamDefaultWriter,
};
use islet_url::{URLSearchParams, URL};
use islet_utils::error::JsError;

use crate::{
    guest_streams::{GuestHooks, GuestSink, GuestSource, GuestTransformer},
    runtime::IsolateContext,
    structured_clone::structured_clone,
};

use async_trait::async_trait;

type GuestReadable = ReadableStream<HostValue>;
type GuestWritable = WritableStream<HostValue>;
type GuestReader = ReadableStreamDefaultReader<HostValue>;
type GuestWriter = WritableStreamDefaultWriter<HostValue>;

struct AbortControllerInstance {
    controller: AbortController,
    signal_id: u64,
}

struct UrlInstance {
    url: URL,
    params_id: Option<u64>,
}

struct TransformInstance {
    readable_id: u64,
    writable_id: u64,
}

/// Installs every core guest global. Called once per context at creation.
pub async fn setup_core(ctx: &Arc<IsolateContext>) -> Result<(), JsError> {
    let builder = ClassBuilder::new(ctx.classes.clone(), ctx.instances.clone());
    let instances = ctx.instances.clone();
    let mut guard = ctx.engine_mutex().lock().await;
    let engine = &mut **guard;

    define_dom_exception(&builder, engine, &instances).await?;
    define_abort(&builder, engine, &instances, ctx).await?;
    define_text_encoding(&builder, engine, &instances).await?;
    define_queuing_strategies(&builder, engine, &instances).await?;
    define_streams(&builder, engine, &instances, ctx).await?;
    define_encoding_streams(&builder, engine, &instances).await?;
    define_url(&builder, engine, &instances).await?;
    define_blob(&builder, engine, &instances).await?;

    define_function(engine, "structuredClone", |args| {
        structured_clone(&arg(&args, 0))
    })?;

    for custom in &ctx.outbound.custom_functions {
        let func = custom.func.clone();
        define_async_function(engine, &custom.name, move |args| {
            let func = func.clone();
            Box::pin(async move { func.call(args).await })
        })?;
    }

    Ok(())
}

// --- argument helpers ---

fn arg(args: &[HostValue], index: usize) -> HostValue {
    args.get(index).cloned().unwrap_or(HostValue::Undefined)
}

fn is_absent(value: &HostValue) -> bool {
    matches!(value, HostValue::Undefined | HostValue::Null)
}

fn as_string(value: &HostValue, what: &str) -> Result<String, JsError> {
    match value {
        HostValue::String(value) => Ok(value.clone()),
        HostValue::Int(value) => Ok(value.to_string()),
        HostValue::Float(value) => Ok(value.to_string()),
        HostValue::Bool(value) => Ok(value.to_string()),
        _ => Err(JsError::type_error(format!("Expected a string for {what}"))),
    }
}

fn opt_string(value: &HostValue) -> Option<String> {
    match value {
        HostValue::String(value) => Some(value.clone()),
        _ => None,
    }
}

fn opt_i64(value: &HostValue) -> Option<i64> {
    match value {
        HostValue::Int(value) => Some(*value),
        HostValue::Float(value) => Some(*value as i64),
        _ => None,
    }
}

fn opt_f64(value: &HostValue) -> Option<f64> {
    match value {
        HostValue::Int(value) => Some(*value as f64),
        HostValue::Float(value) => Some(*value),
        _ => None,
    }
}

fn opt_bool(value: &HostValue) -> Option<bool> {
    match value {
        HostValue::Bool(value) => Some(*value),
        _ => None,
    }
}

pub(crate) fn object_get(value: &HostValue, key: &str) -> Option<HostValue> {
    match value {
        HostValue::Object(entries) => entries
            .lock()
            .unwrap()
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, entry)| entry.clone()),
        _ => None,
    }
}

/// Builder-class instances cross the trampoline as `{ __instanceRef: id }`.
fn instance_ref(value: &HostValue) -> Option<u64> {
    object_get(value, "__instanceRef").as_ref().and_then(|id| {
        opt_i64(id).and_then(|id| u64::try_from(id).ok())
    })
}

fn require_instance_ref(value: &HostValue, what: &str) -> Result<u64, JsError> {
    instance_ref(value).ok_or_else(|| JsError::type_error(format!("Expected a {what} instance")))
}

fn reason_error(value: &HostValue) -> JsError {
    match value {
        HostValue::Undefined | HostValue::Null => {
            DOMException::abort_error("This operation was aborted").into()
        },
        HostValue::String(message) => JsError::error(message.clone()),
        other => match object_get(other, "message").as_ref().and_then(opt_string) {
            Some(message) => JsError::error(message),
            None => JsError::error(format!("{other:?}")),
        },
    }
}

fn error_object(error: &JsError) -> HostValue {
    HostValue::object(vec![
        ("name".to_string(), HostValue::string(error.name())),
        ("message".to_string(), HostValue::string(&error.message)),
    ])
}

fn read_result_object(result: ReadResult<HostValue>) -> HostValue {
    match result {
        ReadResult::Chunk(value) => HostValue::object(vec![
            ("value".to_string(), value),
            ("done".to_string(), HostValue::Bool(false)),
        ]),
        ReadResult::Done => HostValue::object(vec![
            ("value".to_string(), HostValue::Undefined),
            ("done".to_string(), HostValue::Bool(true)),
        ]),
    }
}

fn async_method<F, Fut>(name: &str, func: F) -> MethodSpec
where
    F: Fn(u64, Vec<HostValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HostValue, JsError>> + Send + 'static,
{
    MethodSpec::async_method(
        name,
        Arc::new(move |id, args| -> HostFuture { Box::pin(func(id, args)) }),
    )
}

// --- DOMException ---

async fn define_dom_exception(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let mut spec = ClassSpec::new("DOMException")
        .construct({
            let instances = instances.clone();
            move |args| {
                let message = opt_string(&arg(&args, 0)).unwrap_or_default();
                let name = opt_string(&arg(&args, 1)).unwrap_or_else(|| "Error".to_string());
                Ok(instances.insert(DOMException::new(message, name)))
            }
        })
        .property(PropertySpec::getter("name", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut DOMException| {
                    HostValue::string(state.name())
                })
            }
        }))
        .property(PropertySpec::getter("message", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut DOMException| {
                    HostValue::string(state.message())
                })
            }
        }))
        .property(PropertySpec::getter("code", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut DOMException| {
                    HostValue::Int(state.code() as i64)
                })
            }
        }));

    // The full W3C legacy code table, exposed as constants.
    for (name, code) in CONSTANTS {
        let code = code as i64;
        spec = spec.static_property(StaticPropertySpec::getter(name, move |_args| {
            Ok(HostValue::Int(code))
        }));
    }

    builder.define(engine, spec).await
}

// --- AbortController / AbortSignal ---

async fn define_abort(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
    ctx: &Arc<IsolateContext>,
) -> Result<(), JsError> {
    let signal_spec = ClassSpec::new("AbortSignal")
        .property(PropertySpec::getter("aborted", {
            let instances = instances.clone();
            move |id, _args| {
                let signal = instances.get::<AbortSignal>(id)?;
                Ok(HostValue::Bool(signal.aborted()))
            }
        }))
        .property(PropertySpec::getter("reason", {
            let instances = instances.clone();
            move |id, _args| {
                let signal = instances.get::<AbortSignal>(id)?;
                Ok(match signal.reason() {
                    Some(reason) => error_object(&reason),
                    None => HostValue::Undefined,
                })
            }
        }))
        .method(MethodSpec::sync("throwIfAborted", {
            let instances = instances.clone();
            move |id, _args| {
                let signal = instances.get::<AbortSignal>(id)?;
                signal.throw_if_aborted()?;
                Ok(HostValue::Undefined)
            }
        }))
        .method(MethodSpec::sync("addEventListener", {
            let instances = instances.clone();
            let ctx = Arc::downgrade(ctx);
            move |id, args| {
                let kind = as_string(&arg(&args, 0), "event type")?;
                if kind != "abort" {
                    return Ok(HostValue::Undefined);
                }
                let listener = match arg(&args, 1) {
                    HostValue::EngineHandle(handle) => handle,
                    _ => return Err(JsError::type_error("Expected a listener function")),
                };
                let signal = instances.get::<AbortSignal>(id)?;
                let ctx = ctx.clone();
                signal.add_abort_listener(move |reason| {
                    notify_listener(ctx.clone(), listener, reason.clone());
                });
                Ok(HostValue::Undefined)
            }
        }))
        .static_method(StaticMethodSpec::sync("abort", {
            let instances = instances.clone();
            move |args| {
                let reason = match arg(&args, 0) {
                    value if is_absent(&value) => None,
                    value => Some(reason_error(&value)),
                };
                let id = instances.insert(AbortSignal::already_aborted(reason));
                Ok(wrap_instance("AbortSignal", id))
            }
        }))
        .static_method(StaticMethodSpec::sync("timeout", {
            let instances = instances.clone();
            move |args| {
                let ms = opt_i64(&arg(&args, 0))
                    .and_then(|ms| u64::try_from(ms).ok())
                    .ok_or_else(|| JsError::type_error("Expected a timeout in milliseconds"))?;
                let id = instances.insert(AbortSignal::timeout(ms));
                Ok(wrap_instance("AbortSignal", id))
            }
        }));
    builder.define(engine, signal_spec).await?;

    let controller_spec = ClassSpec::new("AbortController")
        .construct({
            let instances = instances.clone();
            move |_args| {
                let controller = AbortController::new();
                let signal_id = instances.insert(controller.signal());
                Ok(instances.insert(AbortControllerInstance {
                    controller,
                    signal_id,
                }))
            }
        })
        .property(PropertySpec::getter("signal", {
            let instances = instances.clone();
            move |id, _args| {
                let signal_id = instances
                    .with(id, |state: &mut AbortControllerInstance| state.signal_id)?;
                Ok(wrap_instance("AbortSignal", signal_id))
            }
        }))
        .method(MethodSpec::sync("abort", {
            let instances = instances.clone();
            move |id, args| {
                let reason = match arg(&args, 0) {
                    value if is_absent(&value) => None,
                    value => Some(reason_error(&value)),
                };
                instances.with(id, |state: &mut AbortControllerInstance| {
                    state.controller.abort(reason);
                })?;
                Ok(HostValue::Undefined)
            }
        }));
    builder.define(engine, controller_spec).await
}

fn notify_listener(ctx: std::sync::Weak<IsolateContext>, listener: JsHandle, reason: JsError) {
    tokio::spawn(async move {
        if let Some(ctx) = ctx.upgrade() {
            let _ = ctx
                .call_handle(
                    listener,
                    vec![islet_bridge::EngineValue::String(reason.message)],
                )
                .await;
        }
    });
}

// --- TextEncoder / TextDecoder ---

async fn define_text_encoding(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let encoder_spec = ClassSpec::new("TextEncoder")
        .construct({
            let instances = instances.clone();
            move |_args| Ok(instances.insert(TextEncoder::new()))
        })
        .property(PropertySpec::getter("encoding", {
            let instances = instances.clone();
            move |id, _args| {
                let encoder = instances.get::<TextEncoder>(id)?;
                Ok(HostValue::string(encoder.encoding()))
            }
        }))
        .method(MethodSpec::sync("encode", {
            let instances = instances.clone();
            move |id, args| {
                let encoder = instances.get::<TextEncoder>(id)?;
                let input = match arg(&args, 0) {
                    value if is_absent(&value) => String::new(),
                    value => as_string(&value, "input")?,
                };
                Ok(HostValue::Bytes(encoder.encode(&input)))
            }
        }));
    builder.define(engine, encoder_spec).await?;

    let decoder_spec = ClassSpec::new("TextDecoder")
        .construct({
            let instances = instances.clone();
            move |args| {
                let label = opt_string(&arg(&args, 0));
                let options = arg(&args, 1);
                let decoder = TextDecoder::new(
                    label.as_deref(),
                    TextDecoderOptions {
                        fatal: object_get(&options, "fatal")
                            .as_ref()
                            .and_then(opt_bool)
                            .unwrap_or(false),
                        ignore_bom: object_get(&options, "ignoreBOM")
                            .as_ref()
                            .and_then(opt_bool)
                            .unwrap_or(false),
                    },
                )?;
                Ok(instances.insert(decoder))
            }
        })
        .property(PropertySpec::getter("encoding", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut TextDecoder| {
                    HostValue::string(state.encoding())
                })
            }
        }))
        .property(PropertySpec::getter("fatal", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut TextDecoder| HostValue::Bool(state.fatal()))
            }
        }))
        .property(PropertySpec::getter("ignoreBOM", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut TextDecoder| {
                    HostValue::Bool(state.ignore_bom())
                })
            }
        }))
        .method(MethodSpec::sync("decode", {
            let instances = instances.clone();
            move |id, args| {
                let data = match arg(&args, 0) {
                    value if is_absent(&value) => Bytes::new(),
                    HostValue::Bytes(data) => data,
                    _ => return Err(JsError::type_error("Expected a BufferSource")),
                };
                let stream = object_get(&arg(&args, 1), "stream")
                    .as_ref()
                    .and_then(opt_bool)
                    .unwrap_or(false);
                let decoded = instances
                    .with(id, |state: &mut TextDecoder| state.decode(&data, stream))??;
                Ok(HostValue::String(decoded))
            }
        }));
    builder.define(engine, decoder_spec).await
}

// --- queuing strategies ---

async fn define_queuing_strategies(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let byte_length_spec = ClassSpec::new("ByteLengthQueuingStrategy")
        .construct({
            let instances = instances.clone();
            move |args| {
                let hwm = object_get(&arg(&args, 0), "highWaterMark")
                    .as_ref()
                    .and_then(opt_f64)
                    .ok_or_else(|| JsError::type_error("Expected options with highWaterMark"))?;
                Ok(instances.insert(islet_streams::ByteLengthQueuingStrategy::new(hwm)))
            }
        })
        .property(PropertySpec::getter("highWaterMark", {
            let instances = instances.clone();
            move |id, _args| {
                let strategy = instances.get::<islet_streams::ByteLengthQueuingStrategy>(id)?;
                Ok(HostValue::Float(strategy.high_water_mark))
            }
        }))
        .method(MethodSpec::sync("size", |_id, args| {
            Ok(HostValue::Float(match arg(&args, 0) {
                HostValue::Bytes(data) => data.len() as f64,
                HostValue::String(text) => text.len() as f64,
                _ => 0.0,
            }))
        }));
    builder.define(engine, byte_length_spec).await?;

    let count_spec = ClassSpec::new("CountQueuingStrategy")
        .construct({
            let instances = instances.clone();
            move |args| {
                let hwm = object_get(&arg(&args, 0), "highWaterMark")
                    .as_ref()
                    .and_then(opt_f64)
                    .ok_or_else(|| JsError::type_error("Expected options with highWaterMark"))?;
                Ok(instances.insert(islet_streams::CountQueuingStrategy::new(hwm)))
            }
        })
        .property(PropertySpec::getter("highWaterMark", {
            let instances = instances.clone();
            move |id, _args| {
                let strategy = instances.get::<islet_streams::CountQueuingStrategy>(id)?;
                Ok(HostValue::Float(strategy.high_water_mark))
            }
        }))
        .method(MethodSpec::sync("size", |_id, _args| Ok(HostValue::Float(1.0))));
    builder.define(engine, count_spec).await
}

// --- streams ---

fn strategy_from(value: &HostValue) -> QueuingStrategy<HostValue> {
    match object_get(value, "highWaterMark").as_ref().and_then(opt_f64) {
        Some(hwm) => QueuingStrategy::count(hwm),
        None => QueuingStrategy::default(),
    }
}

fn pipe_options_from(
    instances: &InstanceRegistry,
    value: &HostValue,
) -> Result<PipeOptions, JsError> {
    let mut options = PipeOptions {
        prevent_close: object_get(value, "preventClose")
            .as_ref()
            .and_then(opt_bool)
            .unwrap_or(false),
        prevent_abort: object_get(value, "preventAbort")
            .as_ref()
            .and_then(opt_bool)
            .unwrap_or(false),
        prevent_cancel: object_get(value, "preventCancel")
            .as_ref()
            .and_then(opt_bool)
            .unwrap_or(false),
        signal: None,
    };
    if let Some(signal) = object_get(value, "signal") {
        let signal_id = require_instance_ref(&signal, "AbortSignal")?;
        options.signal = Some(instances.get::<AbortSignal>(signal_id)?);
    }
    Ok(options)
}

async fn define_streams(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
    ctx: &Arc<IsolateContext>,
) -> Result<(), JsError> {
    let readable_spec = ClassSpec::new("ReadableStream")
        .construct({
            let instances = instances.clone();
            let ctx = Arc::downgrade(ctx);
            move |args| {
                let source = arg(&args, 0);
                let strategy = strategy_from(&arg(&args, 1));
                let stream = match GuestHooks::from_value(&source) {
                    Some(hooks) => GuestReadable::new(GuestSource::new(ctx.clone(), hooks), strategy),
                    None => GuestReadable::new(islet_streams::readable::source::NoopSource, strategy),
                };
                Ok(instances.insert(stream))
            }
        })
        .property(PropertySpec::getter("locked", {
            let instances = instances.clone();
            move |id, _args| {
                let stream = instances.get::<GuestReadable>(id)?;
                Ok(HostValue::Bool(stream.is_locked()))
            }
        }))
        .method(MethodSpec::sync("getReader", {
            let instances = instances.clone();
            move |id, _args| {
                let stream = instances.get::<GuestReadable>(id)?;
                let reader = stream.get_reader()?;
                Ok(wrap_instance(
                    "ReadableStreamDefaultReader",
                    instances.insert(reader),
                ))
            }
        }))
        .method(async_method("cancel", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let stream = instances.get::<GuestReadable>(id)?;
                    stream.cancel(reason_error(&arg(&args, 0))).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(MethodSpec::sync("tee", {
            let instances = instances.clone();
            move |id, _args| {
                let stream = instances.get::<GuestReadable>(id)?;
                let (first, second) = stream.tee()?;
                Ok(HostValue::array(vec![
                    wrap_instance("ReadableStream", instances.insert(first)),
                    wrap_instance("ReadableStream", instances.insert(second)),
                ]))
            }
        }))
        .method(async_method("pipeTo", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let stream = instances.get::<GuestReadable>(id)?;
                    let dest_id = require_instance_ref(&arg(&args, 0), "WritableStream")?;
                    let dest = instances.get::<GuestWritable>(dest_id)?;
                    let options = pipe_options_from(&instances, &arg(&args, 1))?;
                    stream.pipe_to(&dest, options).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(MethodSpec::sync("pipeThrough", {
            let instances = instances.clone();
            move |id, args| {
                let stream = instances.get::<GuestReadable>(id)?;
                let transform_id = require_instance_ref(&arg(&args, 0), "TransformStream")?;
                let (readable_id, writable_id) =
                    instances.with(transform_id, |state: &mut TransformInstance| {
                        (state.readable_id, state.writable_id)
                    })?;
                let writable = instances.get::<GuestWritable>(writable_id)?;
                let options = pipe_options_from(&instances, &arg(&args, 1))?;
                tokio::spawn(async move {
                    let _ = stream.pipe_to(&writable, options).await;
                });
                Ok(wrap_instance("ReadableStream", readable_id))
            }
        }));
    builder.define(engine, readable_spec).await?;

    let reader_spec = ClassSpec::new("ReadableStreamDefaultReader")
        .construct({
            let instances = instances.clone();
            move |args| {
                let stream_id = require_instance_ref(&arg(&args, 0), "ReadableStream")?;
                let stream = instances.get::<GuestReadable>(stream_id)?;
                let reader = stream.get_reader()?;
                Ok(instances.insert(reader))
            }
        })
        .method(async_method("read", {
            let instances = instances.clone();
            move |id, _args| {
                let instances = instances.clone();
                async move {
                    let reader =
                        instances.with(id, |state: &mut GuestReader| state.clone_handle())?;
                    Ok(read_result_object(reader.read().await?))
                }
            }
        }))
        .method(async_method("cancel", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let reader =
                        instances.with(id, |state: &mut GuestReader| state.clone_handle())?;
                    reader.cancel(reason_error(&arg(&args, 0))).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(async_method("closed", {
            let instances = instances.clone();
            move |id, _args| {
                let instances = instances.clone();
                async move {
                    let reader =
                        instances.with(id, |state: &mut GuestReader| state.clone_handle())?;
                    reader.closed().await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(MethodSpec::sync("releaseLock", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut GuestReader| state.release_lock())?;
                Ok(HostValue::Undefined)
            }
        }));
    builder.define(engine, reader_spec).await?;

    let writable_spec = ClassSpec::new("WritableStream")
        .construct({
            let instances = instances.clone();
            let ctx = Arc::downgrade(ctx);
            move |args| {
                let sink = arg(&args, 0);
                let strategy = strategy_from(&arg(&args, 1));
                let stream = match GuestHooks::from_value(&sink) {
                    Some(hooks) => GuestWritable::new(GuestSink::new(ctx.clone(), hooks), strategy),
                    None => GuestWritable::new(islet_streams::writable::sink::NoopSink, strategy),
                };
                Ok(instances.insert(stream))
            }
        })
        .property(PropertySpec::getter("locked", {
            let instances = instances.clone();
            move |id, _args| {
                let stream = instances.get::<GuestWritable>(id)?;
                Ok(HostValue::Bool(stream.is_locked()))
            }
        }))
        .method(MethodSpec::sync("getWriter", {
            let instances = instances.clone();
            move |id, _args| {
                let stream = instances.get::<GuestWritable>(id)?;
                let writer = stream.get_writer()?;
                Ok(wrap_instance(
                    "WritableStreamDefaultWriter",
                    instances.insert(writer),
                ))
            }
        }))
        .method(async_method("abort", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let stream = instances.get::<GuestWritable>(id)?;
                    stream.abort(reason_error(&arg(&args, 0))).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(async_method("close", {
            let instances = instances.clone();
            move |id, _args| {
                let instances = instances.clone();
                async move {
                    let stream = instances.get::<GuestWritable>(id)?;
                    // Closing a locked stream goes through its writer.
                    let writer = stream.get_writer()?;
                    let result = writer.close().await;
                    writer.release_lock();
                    result?;
                    Ok(HostValue::Undefined)
                }
            }
        }));
    builder.define(engine, writable_spec).await?;

    let writer_spec = ClassSpec::new("WritableStreamDefaultWriter")
        .construct({
            let instances = instances.clone();
            move |args| {
                let stream_id = require_instance_ref(&arg(&args, 0), "WritableStream")?;
                let stream = instances.get::<GuestWritable>(stream_id)?;
                let writer = stream.get_writer()?;
                Ok(instances.insert(writer))
            }
        })
        .property(PropertySpec::getter("desiredSize", {
            let instances = instances.clone();
            move |id, _args| {
                let writer = instances.with(id, |state: &mut GuestWriter| state.clone_handle())?;
                Ok(match writer.desired_size() {
                    Some(size) => HostValue::Float(size),
                    None => HostValue::Null,
                })
            }
        }))
        .method(async_method("write", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let writer =
                        instances.with(id, |state: &mut GuestWriter| state.clone_handle())?;
                    writer.write(arg(&args, 0)).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(async_method("close", {
            let instances = instances.clone();
            move |id, _args| {
                let instances = instances.clone();
                async move {
                    let writer =
                        instances.with(id, |state: &mut GuestWriter| state.clone_handle())?;
                    writer.close().await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(async_method("abort", {
            let instances = instances.clone();
            move |id, args| {
                let instances = instances.clone();
                async move {
                    let writer =
                        instances.with(id, |state: &mut GuestWriter| state.clone_handle())?;
                    writer.abort(reason_error(&arg(&args, 0))).await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(async_method("closed", {
            let instances = instances.clone();
            move |id, _args| {
                let instances = instances.clone();
                async move {
                    let writer =
                        instances.with(id, |state: &mut GuestWriter| state.clone_handle())?;
                    writer.closed().await?;
                    Ok(HostValue::Undefined)
                }
            }
        }))
        .method(MethodSpec::sync("releaseLock", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut GuestWriter| state.release_lock())?;
                Ok(HostValue::Undefined)
            }
        }));
    builder.define(engine, writer_spec).await?;

    let transform_spec = ClassSpec::new("TransformStream")
        .construct({
            let instances = instances.clone();
            let ctx = Arc::downgrade(ctx);
            move |args| {
                let transformer = arg(&args, 0);
                let writable_strategy = strategy_from(&arg(&args, 1));
                let readable_strategy = strategy_from(&arg(&args, 2));
                let transform = match GuestHooks::from_value(&transformer) {
                    Some(hooks) => TransformStream::with_strategies(
                        GuestTransformer::new(ctx.clone(), hooks),
                        writable_strategy,
                        readable_strategy,
                    ),
                    None => TransformStream::with_strategies(
                        islet_streams::transform::IdentityTransformer,
                        writable_strategy,
                        readable_strategy,
                    ),
                };
                Ok(insert_transform(&instances, transform))
            }
        })
        .property(PropertySpec::getter("readable", {
            let instances = instances.clone();
            move |id, _args| {
                let readable_id =
                    instances.with(id, |state: &mut TransformInstance| state.readable_id)?;
                Ok(wrap_instance("ReadableStream", readable_id))
            }
        }))
        .property(PropertySpec::getter("writable", {
            let instances = instances.clone();
            move |id, _args| {
                let writable_id =
                    instances.with(id, |state: &mut TransformInstance| state.writable_id)?;
                Ok(wrap_instance("WritableStream", writable_id))
            }
        }));
    builder.define(engine, transform_spec).await
}

fn insert_transform(
    instances: &InstanceRegistry,
    transform: TransformStream<HostValue, HostValue>,
) -> u64 {
    let readable_id = instances.insert(transform.readable());
    let writable_id = instances.insert(transform.writable());
    instances.insert(TransformInstance {
        readable_id,
        writable_id,
    })
}

// --- TextEncoderStream / TextDecoderStream ---

struct EncoderStreamTransformer {
    inner: EncodeTransformer,
}

#[async_trait]
impl Transformer<HostValue, HostValue> for EncoderStreamTransformer {
    async fn transform(
        &mut self,
        chunk: HostValue,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let text = as_string(&chunk, "chunk")?;
        let units: Vec<u16> = text.encode_utf16().collect();
        let encoded = self.inner.encode_chunk(&units);
        if !encoded.is_empty() {
            controller.enqueue(HostValue::Bytes(encoded))?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let tail = self.inner.flush_pending();
        if !tail.is_empty() {
            controller.enqueue(HostValue::Bytes(tail))?;
        }
        Ok(())
    }
}

struct DecoderStreamTransformer {
    decoder: TextDecoder,
}

#[async_trait]
impl Transformer<HostValue, HostValue> for DecoderStreamTransformer {
    async fn transform(
        &mut self,
        chunk: HostValue,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let data = match chunk {
            HostValue::Bytes(data) => data,
            _ => return Err(JsError::type_error("Expected a BufferSource chunk")),
        };
        let decoded = self.decoder.decode(&data, true)?;
        if !decoded.is_empty() {
            controller.enqueue(HostValue::String(decoded))?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<HostValue>,
    ) -> StreamResult<()> {
        let tail = self.decoder.decode(&[], false)?;
        if !tail.is_empty() {
            controller.enqueue(HostValue::String(tail))?;
        }
        Ok(())
    }
}

async fn define_encoding_streams(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let encoder_stream_spec = transform_backed_spec("TextEncoderStream", {
        let instances = instances.clone();
        move |_args| {
            let transform = TransformStream::new(EncoderStreamTransformer {
                inner: EncodeTransformer::new(),
            });
            Ok(insert_transform(&instances, transform))
        }
    }, instances);
    builder.define(engine, encoder_stream_spec).await?;

    let decoder_stream_spec = transform_backed_spec("TextDecoderStream", {
        let instances = instances.clone();
        move |args: Vec<HostValue>| {
            let label = opt_string(&arg(&args, 0));
            let options = arg(&args, 1);
            // Shares the label/options validation with TextDecoder.
            let decoder_options = TextDecoderOptions {
                fatal: object_get(&options, "fatal")
                    .as_ref()
                    .and_then(opt_bool)
                    .unwrap_or(false),
                ignore_bom: object_get(&options, "ignoreBOM")
                    .as_ref()
                    .and_then(opt_bool)
                    .unwrap_or(false),
            };
            let decoder = TextDecoder::new(label.as_deref(), decoder_options)?;
            let transform = TransformStream::new(DecoderStreamTransformer { decoder });
            Ok(insert_transform(&instances, transform))
        }
    }, instances);
    builder.define(engine, decoder_stream_spec).await
}

fn transform_backed_spec(
    name: &str,
    construct: impl Fn(Vec<HostValue>) -> Result<u64, JsError> + Send + Sync + 'static,
    instances: &InstanceRegistry,
) -> ClassSpec {
    ClassSpec::new(name)
        .construct(construct)
        .property(PropertySpec::getter("readable", {
            let instances = instances.clone();
            move |id, _args| {
                let readable_id =
                    instances.with(id, |state: &mut TransformInstance| state.readable_id)?;
                Ok(wrap_instance("ReadableStream", readable_id))
            }
        }))
        .property(PropertySpec::getter("writable", {
            let instances = instances.clone();
            move |id, _args| {
                let writable_id =
                    instances.with(id, |state: &mut TransformInstance| state.writable_id)?;
                Ok(wrap_instance("WritableStream", writable_id))
            }
        }))
}

// --- URL / URLSearchParams ---

async fn define_url(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let mut url_spec = ClassSpec::new("URL")
        .construct({
            let instances = instances.clone();
            move |args| {
                let input = as_string(&arg(&args, 0), "url")?;
                let base = opt_string(&arg(&args, 1));
                let url = URL::new(&input, base.as_deref())?;
                Ok(instances.insert(UrlInstance {
                    url,
                    params_id: None,
                }))
            }
        })
        .static_method(StaticMethodSpec::sync("canParse", |args| {
            let input = match opt_string(&arg(&args, 0)) {
                Some(input) => input,
                None => return Ok(HostValue::Bool(false)),
            };
            let base = opt_string(&arg(&args, 1));
            Ok(HostValue::Bool(URL::can_parse(&input, base.as_deref())))
        }))
        .method(MethodSpec::sync("toString", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut UrlInstance| {
                    HostValue::String(state.url.href())
                })
            }
        }))
        .method(MethodSpec::sync("toJSON", {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut UrlInstance| {
                    HostValue::String(state.url.to_json())
                })
            }
        }))
        .property(PropertySpec::getter("searchParams", {
            let instances = instances.clone();
            move |id, _args| {
                // The params view is created once and cached; it shares the
                // underlying parsed URL, so `search` writes stay visible.
                let existing = instances.with(id, |state: &mut UrlInstance| {
                    (state.params_id, state.url.search_params())
                })?;
                let params_id = match existing {
                    (Some(params_id), _) => params_id,
                    (None, params) => {
                        let params_id = instances.insert(params);
                        instances.with(id, |state: &mut UrlInstance| {
                            state.params_id = Some(params_id);
                        })?;
                        params_id
                    },
                };
                Ok(wrap_instance("URLSearchParams", params_id))
            }
        }));

    url_spec = url_string_property(url_spec, instances, "href", |url| url.href(), Some(|url: &URL, value: &str| url.set_href(value)));
    url_spec = url_spec.property(PropertySpec::getter("origin", {
        let instances = instances.clone();
        move |id, _args| {
            instances.with(id, |state: &mut UrlInstance| {
                HostValue::String(state.url.origin())
            })
        }
    }));
    url_spec = url_simple_property(url_spec, instances, "protocol", URL::protocol, URL::set_protocol);
    url_spec = url_simple_property(url_spec, instances, "username", URL::username, URL::set_username);
    url_spec = url_simple_property(url_spec, instances, "password", URL::password, URL::set_password);
    url_spec = url_simple_property(url_spec, instances, "host", URL::host, URL::set_host);
    url_spec = url_simple_property(url_spec, instances, "hostname", URL::hostname, URL::set_hostname);
    url_spec = url_simple_property(url_spec, instances, "port", URL::port, URL::set_port);
    url_spec = url_simple_property(url_spec, instances, "pathname", URL::pathname, URL::set_pathname);
    url_spec = url_simple_property(url_spec, instances, "search", URL::search, URL::set_search);
    url_spec = url_simple_property(url_spec, instances, "hash", URL::hash, URL::set_hash);

    builder.define(engine, url_spec).await?;

    let params_spec = ClassSpec::new("URLSearchParams")
        .construct({
            let instances = instances.clone();
            move |args| {
                let params = match arg(&args, 0) {
                    value if is_absent(&value) => URLSearchParams::new(),
                    HostValue::String(init) => URLSearchParams::from_str(&init),
                    HostValue::Array(items) => {
                        let mut pairs = Vec::new();
                        for item in items.lock().unwrap().iter() {
                            match item {
                                HostValue::Array(pair) => {
                                    let pair = pair.lock().unwrap();
                                    if pair.len() != 2 {
                                        return Err(JsError::type_error(
                                            "Expected [name, value] pairs",
                                        ));
                                    }
                                    pairs.push((
                                        as_string(&pair[0], "name")?,
                                        as_string(&pair[1], "value")?,
                                    ));
                                },
                                _ => {
                                    return Err(JsError::type_error(
                                        "Expected [name, value] pairs",
                                    ))
                                },
                            }
                        }
                        URLSearchParams::from_pairs(&pairs)
                    },
                    HostValue::Object(entries) => {
                        let pairs: Vec<(String, String)> = entries
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|(key, value)| Ok((key.clone(), as_string(value, "value")?)))
                            .collect::<Result<Vec<_>, JsError>>()?;
                        URLSearchParams::from_pairs(&pairs)
                    },
                    _ => return Err(JsError::type_error("Unsupported URLSearchParams init")),
                };
                Ok(instances.insert(params))
            }
        })
        .property(PropertySpec::getter("size", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::Int(params.size() as i64))
            }
        }))
        .method(MethodSpec::sync("append", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                params.append(
                    &as_string(&arg(&args, 0), "name")?,
                    &as_string(&arg(&args, 1), "value")?,
                );
                Ok(HostValue::Undefined)
            }
        }))
        .method(MethodSpec::sync("delete", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                let value = opt_string(&arg(&args, 1));
                params.delete(&as_string(&arg(&args, 0), "name")?, value.as_deref());
                Ok(HostValue::Undefined)
            }
        }))
        .method(MethodSpec::sync("get", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(match params.get(&as_string(&arg(&args, 0), "name")?) {
                    Some(value) => HostValue::String(value),
                    None => HostValue::Null,
                })
            }
        }))
        .method(MethodSpec::sync("getAll", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::array(
                    params
                        .get_all(&as_string(&arg(&args, 0), "name")?)
                        .into_iter()
                        .map(HostValue::String)
                        .collect(),
                ))
            }
        }))
        .method(MethodSpec::sync("has", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                let value = opt_string(&arg(&args, 1));
                Ok(HostValue::Bool(params.has(
                    &as_string(&arg(&args, 0), "name")?,
                    value.as_deref(),
                )))
            }
        }))
        .method(MethodSpec::sync("set", {
            let instances = instances.clone();
            move |id, args| {
                let params = instances.get::<URLSearchParams>(id)?;
                params.set(
                    &as_string(&arg(&args, 0), "name")?,
                    &as_string(&arg(&args, 1), "value")?,
                );
                Ok(HostValue::Undefined)
            }
        }))
        .method(MethodSpec::sync("sort", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                params.sort();
                Ok(HostValue::Undefined)
            }
        }))
        .method(MethodSpec::sync("entries", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::array(
                    params
                        .entries()
                        .into_iter()
                        .map(|(key, value)| {
                            HostValue::array(vec![
                                HostValue::String(key),
                                HostValue::String(value),
                            ])
                        })
                        .collect(),
                ))
            }
        }))
        .method(MethodSpec::sync("keys", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::array(
                    params.keys().into_iter().map(HostValue::String).collect(),
                ))
            }
        }))
        .method(MethodSpec::sync("values", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::array(
                    params.values().into_iter().map(HostValue::String).collect(),
                ))
            }
        }))
        .method(MethodSpec::sync("toString", {
            let instances = instances.clone();
            move |id, _args| {
                let params = instances.get::<URLSearchParams>(id)?;
                Ok(HostValue::String(params.to_string()))
            }
        }));
    builder.define(engine, params_spec).await
}

fn url_simple_property(
    spec: ClassSpec,
    instances: &InstanceRegistry,
    name: &str,
    get: fn(&URL) -> String,
    set: fn(&URL, &str),
) -> ClassSpec {
    spec.property(
        PropertySpec::getter(name, {
            let instances = instances.clone();
            move |id, _args| {
                instances.with(id, |state: &mut UrlInstance| {
                    HostValue::String(get(&state.url))
                })
            }
        })
        .with_setter({
            let instances = instances.clone();
            move |id, args| {
                let value = as_string(&arg(&args, 0), "value")?;
                instances.with(id, |state: &mut UrlInstance| set(&state.url, &value))?;
                Ok(HostValue::Undefined)
            }
        }),
    )
}

fn url_string_property(
    spec: ClassSpec,
    instances: &InstanceRegistry,
    name: &str,
    get: fn(&URL) -> String,
    set: Option<fn(&URL, &str) -> Result<(), JsError>>,
) -> ClassSpec {
    let property = PropertySpec::getter(name, {
        let instances = instances.clone();
        move |id, _args| {
            instances.with(id, |state: &mut UrlInstance| {
                HostValue::String(get(&state.url))
            })
        }
    });
    let property = match set {
        Some(set) => property.with_setter({
            let instances = instances.clone();
            move |id, args| {
                let value = as_string(&arg(&args, 0), "value")?;
                instances.with(id, |state: &mut UrlInstance| set(&state.url, &value))??;
                Ok(HostValue::Undefined)
            }
        }),
        None => property,
    };
    spec.property(property)
}

// --- Blob / File ---

fn blob_parts(instances: &InstanceRegistry, value: &HostValue) -> Result<Vec<BlobPart>, JsError> {
    match value {
        HostValue::Undefined | HostValue::Null => Ok(Vec::new()),
        HostValue::Array(items) => items
            .lock()
            .unwrap()
            .iter()
            .map(|item| blob_part(instances, item))
            .collect(),
        _ => Err(JsError::type_error(
            "Failed to construct 'Blob': The provided value cannot be converted to a sequence.",
        )),
    }
}

fn blob_part(instances: &InstanceRegistry, value: &HostValue) -> Result<BlobPart, JsError> {
    Ok(match value {
        HostValue::String(text) => BlobPart::Text(text.clone()),
        HostValue::Int(number) => BlobPart::Text(number.to_string()),
        HostValue::Float(number) => BlobPart::Text(number.to_string()),
        HostValue::Bool(flag) => BlobPart::Text(flag.to_string()),
        HostValue::Bytes(data) => BlobPart::Bytes(data.clone()),
        other => {
            if let Some(id) = instance_ref(other) {
                if let Ok(blob) = instances.get::<BlobState>(id) {
                    return Ok(BlobPart::Blob(blob));
                }
                if let Ok(file) = instances.get::<FileState>(id) {
                    return Ok(BlobPart::Blob(file.as_blob().clone()));
                }
            }
            return Err(JsError::type_error("Unsupported blob part"));
        },
    })
}

fn blob_options(value: &HostValue) -> Result<(Option<String>, EndingType), JsError> {
    let mime_type = object_get(value, "type").as_ref().and_then(opt_string);
    let endings = match object_get(value, "endings").as_ref().and_then(opt_string) {
        Some(endings) => BlobState::parse_endings(&endings)?,
        None => EndingType::Transparent,
    };
    Ok((mime_type, endings))
}

/// Reads Blob-or-File content out of the registry. File re-exposes the
/// whole Blob surface over its own state, so inherited trampolines never
/// see a mismatched type.
fn with_blob_like<R>(
    instances: &InstanceRegistry,
    id: u64,
    access: impl Fn(&BlobState) -> R,
) -> Result<R, JsError> {
    if let Ok(result) = instances.with(id, |state: &mut BlobState| access(state)) {
        return Ok(result);
    }
    instances.with(id, |state: &mut FileState| access(state.as_blob()))
}

fn blob_like_methods(spec: ClassSpec, instances: &InstanceRegistry) -> ClassSpec {
    spec.property(PropertySpec::getter("size", {
        let instances = instances.clone();
        move |id, _args| {
            Ok(HostValue::Int(
                with_blob_like(&instances, id, |blob| blob.size())? as i64,
            ))
        }
    }))
    .property(PropertySpec::getter("type", {
        let instances = instances.clone();
        move |id, _args| {
            with_blob_like(&instances, id, |blob| {
                HostValue::string(blob.mime_type())
            })
        }
    }))
    .method(async_method("text", {
        let instances = instances.clone();
        move |id, _args| {
            let instances = instances.clone();
            async move {
                with_blob_like(&instances, id, |blob| HostValue::String(blob.text()))
            }
        }
    }))
    .method(async_method("arrayBuffer", {
        let instances = instances.clone();
        move |id, _args| {
            let instances = instances.clone();
            async move {
                with_blob_like(&instances, id, |blob| HostValue::Bytes(blob.bytes()))
            }
        }
    }))
    .method(async_method("bytes", {
        let instances = instances.clone();
        move |id, _args| {
            let instances = instances.clone();
            async move {
                with_blob_like(&instances, id, |blob| HostValue::Bytes(blob.bytes()))
            }
        }
    }))
    .method(MethodSpec::sync("slice", {
        let instances = instances.clone();
        move |id, args| {
            let size = with_blob_like(&instances, id, |blob| blob.size())? as i64;
            let start = opt_i64(&arg(&args, 0)).unwrap_or(0);
            let end = opt_i64(&arg(&args, 1)).unwrap_or(size);
            let content_type = opt_string(&arg(&args, 2));
            let slice =
                with_blob_like(&instances, id, |blob| blob.slice(start, end, content_type.clone()))?;
            Ok(wrap_instance("Blob", instances.insert(slice)))
        }
    }))
    .method(MethodSpec::sync("stream", {
        let instances = instances.clone();
        move |id, _args| {
            let data = with_blob_like(&instances, id, |blob| blob.bytes())?;
            // One chunk carrying the whole content, then close.
            let chunks = if data.is_empty() {
                Vec::new()
            } else {
                vec![HostValue::Bytes(data)]
            };
            let stream = GuestReadable::from_chunks(chunks);
            Ok(wrap_instance("ReadableStream", instances.insert(stream)))
        }
    }))
}

async fn define_blob(
    builder: &ClassBuilder,
    engine: &mut dyn Engine,
    instances: &InstanceRegistry,
) -> Result<(), JsError> {
    let blob_spec = blob_like_methods(
        ClassSpec::new("Blob").construct({
            let instances = instances.clone();
            move |args| {
                let parts = blob_parts(&instances, &arg(&args, 0))?;
                let (mime_type, endings) = blob_options(&arg(&args, 1))?;
                Ok(instances.insert(BlobState::new(parts, mime_type, endings)))
            }
        }),
        instances,
    );
    builder.define(engine, blob_spec).await?;

    let file_spec = blob_like_methods(
        ClassSpec::new("File")
            .extends("Blob")
            .construct({
                let instances = instances.clone();
                move |args| {
                    let parts = blob_parts(&instances, &arg(&args, 0))?;
                    let name = as_string(&arg(&args, 1), "file name")?;
                    let options = arg(&args, 2);
                    let (mime_type, endings) = blob_options(&options)?;
                    let last_modified =
                        object_get(&options, "lastModified").as_ref().and_then(opt_i64);
                    Ok(instances.insert(FileState::new(
                        parts,
                        name,
                        mime_type,
                        last_modified,
                        endings,
                    )))
                }
            })
            .property(PropertySpec::getter("name", {
                let instances = instances.clone();
                move |id, _args| {
                    instances.with(id, |state: &mut FileState| {
                        HostValue::string(state.name())
                    })
                }
            }))
            .property(PropertySpec::getter("lastModified", {
                let instances = instances.clone();
                move |id, _args| {
                    instances.with(id, |state: &mut FileState| {
                        HostValue::Int(state.last_modified())
                    })
                }
            })),
        instances,
    );
    builder.define(engine, file_spec).await
}

#[cfg(test)]
mod tests {
    use islet_bridge::EngineValue;
    use islet_test::{EngineProbe, MockEngine};

    use super::*;
    use crate::runtime::ContextOptions;

    async fn test_context() -> (Arc<IsolateContext>, EngineProbe) {
        let engine = MockEngine::new();
        let probe = engine.probe();
        let context = IsolateContext::new(Box::new(engine), ContextOptions::default())
            .await
            .unwrap();
        (context, probe)
    }

    fn number(value: &EngineValue) -> f64 {
        value.as_number().expect("expected a number")
    }

    /// Pulls the instance id out of a `{ __wrapClass, __wrapId }` result.
    fn unwrap_id(value: &EngineValue, class: &str) -> EngineValue {
        let EngineValue::Object(entries) = value else {
            panic!("expected a wrapped instance, got {value:?}");
        };
        let field = |name: &str| {
            entries
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(
            field("__wrapClass"),
            Some(EngineValue::String(class.to_string())),
            "wrapped class mismatch"
        );
        field("__wrapId").expect("wrap id present")
    }

    fn str_value(text: &str) -> EngineValue {
        EngineValue::String(text.to_string())
    }

    fn options(entries: Vec<(&str, EngineValue)>) -> EngineValue {
        EngineValue::Object(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__Blob_construct",
                vec![
                    EngineValue::Array(vec![
                        str_value("hello"),
                        str_value(" "),
                        str_value("world"),
                    ]),
                    options(vec![("type", str_value("text/plain"))]),
                ],
            )
            .await
            .unwrap();

        let size = probe
            .invoke_global("__Blob_get_size", vec![id.clone()])
            .await
            .unwrap();
        assert_eq!(number(&size), 11.0);

        let mime_type = probe
            .invoke_global("__Blob_get_type", vec![id.clone()])
            .await
            .unwrap();
        assert_eq!(mime_type, str_value("text/plain"));

        let text = probe
            .invoke_global("__Blob_text", vec![id])
            .await
            .unwrap();
        assert_eq!(text, str_value("hello world"));
    }

    #[tokio::test]
    async fn blob_slice_normalizes_and_copies() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__Blob_construct",
                vec![EngineValue::Array(vec![str_value("hello world")])],
            )
            .await
            .unwrap();

        let slice = probe
            .invoke_global(
                "__Blob_slice",
                vec![id.clone(), EngineValue::Number(-5.0), EngineValue::Number(1000.0)],
            )
            .await
            .unwrap();
        let slice_id = unwrap_id(&slice, "Blob");
        let text = probe
            .invoke_global("__Blob_text", vec![slice_id])
            .await
            .unwrap();
        assert_eq!(text, str_value("world"));

        // slice(0, size) has content equal to the blob.
        let full = probe
            .invoke_global(
                "__Blob_slice",
                vec![id, EngineValue::Number(0.0), EngineValue::Number(11.0)],
            )
            .await
            .unwrap();
        let full_id = unwrap_id(&full, "Blob");
        let text = probe
            .invoke_global("__Blob_text", vec![full_id])
            .await
            .unwrap();
        assert_eq!(text, str_value("hello world"));
    }

    #[tokio::test]
    async fn blob_stream_delivers_one_chunk_then_done() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__Blob_construct",
                vec![EngineValue::Array(vec![str_value("stream me")])],
            )
            .await
            .unwrap();

        let stream = probe
            .invoke_global("__Blob_stream", vec![id])
            .await
            .unwrap();
        let stream_id = unwrap_id(&stream, "ReadableStream");
        let reader = probe
            .invoke_global("__ReadableStream_getReader", vec![stream_id])
            .await
            .unwrap();
        let reader_id = unwrap_id(&reader, "ReadableStreamDefaultReader");

        let first = probe
            .invoke_global("__ReadableStreamDefaultReader_read", vec![reader_id.clone()])
            .await
            .unwrap();
        let EngineValue::Object(entries) = &first else {
            panic!("expected a read result");
        };
        assert!(entries
            .iter()
            .any(|(key, value)| key == "done" && *value == EngineValue::Bool(false)));
        assert!(entries.iter().any(|(key, value)| {
            key == "value" && matches!(value, EngineValue::Bytes(data) if &data[..] == b"stream me")
        }));

        let second = probe
            .invoke_global("__ReadableStreamDefaultReader_read", vec![reader_id])
            .await
            .unwrap();
        let EngineValue::Object(entries) = &second else {
            panic!("expected a read result");
        };
        assert!(entries
            .iter()
            .any(|(key, value)| key == "done" && *value == EngineValue::Bool(true)));
    }

    #[tokio::test]
    async fn file_extends_blob_with_name_and_mtime() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__File_construct",
                vec![
                    EngineValue::Array(vec![str_value("data")]),
                    str_value("a.txt"),
                    options(vec![
                        ("type", str_value("text/plain")),
                        ("lastModified", EngineValue::Number(12345.0)),
                    ]),
                ],
            )
            .await
            .unwrap();

        let name = probe
            .invoke_global("__File_get_name", vec![id.clone()])
            .await
            .unwrap();
        assert_eq!(name, str_value("a.txt"));
        let modified = probe
            .invoke_global("__File_get_lastModified", vec![id.clone()])
            .await
            .unwrap();
        assert_eq!(number(&modified), 12345.0);
        let text = probe
            .invoke_global("__File_text", vec![id])
            .await
            .unwrap();
        assert_eq!(text, str_value("data"));
    }

    #[tokio::test]
    async fn thrown_errors_carry_the_name_prefix() {
        let (_context, probe) = test_context().await;
        // Unsupported encodings are RangeErrors across the boundary.
        let err = probe
            .invoke_global("__TextDecoder_construct", vec![str_value("utf-16le")])
            .await
            .unwrap_err();
        assert!(err.message.starts_with("[RangeError]"));

        let decoded = islet_utils::error::JsError::parse_prefixed(&err.message);
        assert_eq!(decoded.name(), "RangeError");
    }

    #[tokio::test]
    async fn url_resolves_against_base() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__URL_construct",
                vec![str_value("/path"), str_value("https://example.com")],
            )
            .await
            .unwrap();
        let href = probe
            .invoke_global("__URL_get_href", vec![id])
            .await
            .unwrap();
        assert_eq!(href, str_value("https://example.com/path"));

        let parsed = probe
            .invoke_global("__URL_static_canParse", vec![str_value("not a url")])
            .await
            .unwrap();
        assert_eq!(parsed, EngineValue::Bool(false));
    }

    #[tokio::test]
    async fn url_search_params_share_state() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global(
                "__URL_construct",
                vec![str_value("https://example.com/?a=1")],
            )
            .await
            .unwrap();
        let params = probe
            .invoke_global("__URL_get_searchParams", vec![id.clone()])
            .await
            .unwrap();
        let params_id = unwrap_id(&params, "URLSearchParams");

        let value = probe
            .invoke_global("__URLSearchParams_get", vec![params_id.clone(), str_value("a")])
            .await
            .unwrap();
        assert_eq!(value, str_value("1"));

        // Writing search invalidates previous params reads.
        probe
            .invoke_global("__URL_set_search", vec![id, str_value("?b=2")])
            .await
            .unwrap();
        let stale = probe
            .invoke_global("__URLSearchParams_get", vec![params_id.clone(), str_value("a")])
            .await
            .unwrap();
        assert_eq!(stale, EngineValue::Null);
        let fresh = probe
            .invoke_global("__URLSearchParams_get", vec![params_id, str_value("b")])
            .await
            .unwrap();
        assert_eq!(fresh, str_value("2"));
    }

    #[tokio::test]
    async fn abort_controller_aborts_its_signal_once() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global("__AbortController_construct", vec![])
            .await
            .unwrap();
        let signal = probe
            .invoke_global("__AbortController_get_signal", vec![id.clone()])
            .await
            .unwrap();
        let signal_id = unwrap_id(&signal, "AbortSignal");

        let aborted = probe
            .invoke_global("__AbortSignal_get_aborted", vec![signal_id.clone()])
            .await
            .unwrap();
        assert_eq!(aborted, EngineValue::Bool(false));

        probe
            .invoke_global("__AbortController_abort", vec![id.clone(), str_value("stop")])
            .await
            .unwrap();
        probe
            .invoke_global("__AbortController_abort", vec![id, str_value("again")])
            .await
            .unwrap();

        let aborted = probe
            .invoke_global("__AbortSignal_get_aborted", vec![signal_id.clone()])
            .await
            .unwrap();
        assert_eq!(aborted, EngineValue::Bool(true));

        let err = probe
            .invoke_global("__AbortSignal_throwIfAborted", vec![signal_id])
            .await
            .unwrap_err();
        // The first abort reason wins.
        assert!(err.message.contains("stop"));
    }

    #[tokio::test]
    async fn text_encoding_round_trips_through_the_guest_surface() {
        let (_context, probe) = test_context().await;
        let encoder = probe
            .invoke_global("__TextEncoder_construct", vec![])
            .await
            .unwrap();
        let encoded = probe
            .invoke_global("__TextEncoder_encode", vec![encoder, str_value("中")])
            .await
            .unwrap();
        assert_eq!(
            encoded,
            EngineValue::Bytes(bytes::Bytes::from_static(&[0xE4, 0xB8, 0xAD]))
        );

        let decoder = probe
            .invoke_global("__TextDecoder_construct", vec![])
            .await
            .unwrap();
        // Split multi-byte decode with the stream option.
        let empty = probe
            .invoke_global(
                "__TextDecoder_decode",
                vec![
                    decoder.clone(),
                    EngineValue::Bytes(bytes::Bytes::from_static(&[0xE4])),
                    options(vec![("stream", EngineValue::Bool(true))]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(empty, str_value(""));
        let rest = probe
            .invoke_global(
                "__TextDecoder_decode",
                vec![
                    decoder,
                    EngineValue::Bytes(bytes::Bytes::from_static(&[0xB8, 0xAD])),
                    options(vec![("stream", EngineValue::Bool(true))]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(rest, str_value("中"));
    }

    #[tokio::test]
    async fn structured_clone_copies_data_and_rejects_handles() {
        let (_context, probe) = test_context().await;
        let cloned = probe
            .invoke_global(
                "structuredClone",
                vec![options(vec![("n", EngineValue::Number(3.0))])],
            )
            .await
            .unwrap();
        assert_eq!(cloned, options(vec![("n", EngineValue::Number(3.0))]));

        let handle = probe.make_handle();
        let err = probe
            .invoke_global("structuredClone", vec![EngineValue::Handle(handle)])
            .await
            .unwrap_err();
        assert!(err.message.contains("could not be cloned"));
    }

    #[tokio::test]
    async fn transform_stream_exposes_readable_and_writable() {
        let (_context, probe) = test_context().await;
        let id = probe
            .invoke_global("__TextEncoderStream_construct", vec![])
            .await
            .unwrap();
        let readable = probe
            .invoke_global("__TextEncoderStream_get_readable", vec![id.clone()])
            .await
            .unwrap();
        unwrap_id(&readable, "ReadableStream");
        let writable = probe
            .invoke_global("__TextEncoderStream_get_writable", vec![id])
            .await
            .unwrap();
        let writable_id = unwrap_id(&writable, "WritableStream");

        // Writing a string chunk produces encoded bytes on the readable
        // side.
        let writer = probe
            .invoke_global("__WritableStream_getWriter", vec![writable_id])
            .await
            .unwrap();
        let writer_id = unwrap_id(&writer, "WritableStreamDefaultWriter");
        probe
            .invoke_global(
                "__WritableStreamDefaultWriter_write",
                vec![writer_id, str_value("hi")],
            )
            .await
            .unwrap();

        let readable_again = probe
            .invoke_global("__ReadableStream_getReader", vec![readable_probe_arg(&readable)])
            .await
            .unwrap();
        let reader_id = unwrap_id(&readable_again, "ReadableStreamDefaultReader");
        let first = probe
            .invoke_global("__ReadableStreamDefaultReader_read", vec![reader_id])
            .await
            .unwrap();
        let EngineValue::Object(entries) = &first else {
            panic!("expected a read result");
        };
        assert!(entries.iter().any(|(key, value)| {
            key == "value" && matches!(value, EngineValue::Bytes(data) if &data[..] == b"hi")
        }));
    }

    fn readable_probe_arg(wrapped: &EngineValue) -> EngineValue {
        unwrap_id(wrapped, "ReadableStream")
    }
}
