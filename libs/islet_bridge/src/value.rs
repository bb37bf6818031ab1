// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use islet_streams::ReadableStream;
use islet_utils::error::JsError;
use islet_wire::Ref;
use tokio::sync::oneshot;

use crate::engine::{EngineValue, JsHandle};

pub type HostFuture = Pin<Box<dyn Future<Output = Result<HostValue, JsError>> + Send>>;

/// A host-side callable. Calling is always async; sync host functions wrap
/// their result in a ready future.
#[derive(Clone)]
pub struct HostFunction {
    func: Arc<dyn Fn(Vec<HostValue>) -> HostFuture + Send + Sync>,
}

impl HostFunction {
    pub fn new(func: impl Fn(Vec<HostValue>) -> HostFuture + Send + Sync + 'static) -> Self {
        Self {
            func: Arc::new(func),
        }
    }

    pub fn from_sync(
        func: impl Fn(Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |args| {
            let result = func(args);
            Box::pin(async move { result })
        })
    }

    pub async fn call(&self, args: Vec<HostValue>) -> Result<HostValue, JsError> {
        (self.func)(args).await
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunction")
    }
}

enum PromiseInner {
    Pending(Vec<oneshot::Sender<Result<HostValue, JsError>>>),
    Settled(Result<HostValue, JsError>),
}

/// A host-local future standing in for a guest or remote promise. Settles
/// once; later waiters observe the stored outcome.
#[derive(Clone)]
pub struct HostPromise {
    inner: Arc<Mutex<PromiseInner>>,
}

impl HostPromise {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner::Pending(Vec::new()))),
        }
    }

    pub fn resolved(value: HostValue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner::Settled(Ok(value)))),
        }
    }

    pub fn rejected(error: JsError) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner::Settled(Err(error)))),
        }
    }

    pub fn resolve(&self, value: HostValue) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: JsError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<HostValue, JsError>) -> bool {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            match &mut *inner {
                PromiseInner::Settled(_) => return false,
                PromiseInner::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *inner = PromiseInner::Settled(outcome.clone());
                    waiters
                },
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), PromiseInner::Settled(_))
    }

    pub async fn wait(&self) -> Result<HostValue, JsError> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            match &mut *inner {
                PromiseInner::Settled(outcome) => return outcome.clone(),
                PromiseInner::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                },
            }
        };
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => match &*self.inner.lock().unwrap() {
                PromiseInner::Settled(outcome) => outcome.clone(),
                PromiseInner::Pending(_) => Err(JsError::error("promise abandoned")),
            },
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for HostPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostPromise")
    }
}

/// Pull-style async iteration, the host materialization of an
/// AsyncIteratorRef.
#[async_trait]
pub trait AsyncIteration: Send {
    /// `None` signals completion.
    async fn next(&mut self) -> Result<Option<HostValue>, JsError>;

    /// Early termination (`return()` on the guest side).
    async fn stop(&mut self) -> Result<(), JsError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct HostAsyncIterator {
    inner: Arc<tokio::sync::Mutex<Box<dyn AsyncIteration>>>,
}

impl HostAsyncIterator {
    pub fn new(iteration: impl AsyncIteration + 'static) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Box::new(iteration))),
        }
    }

    pub fn from_items(items: Vec<HostValue>) -> Self {
        struct Items(std::vec::IntoIter<HostValue>);

        #[async_trait]
        impl AsyncIteration for Items {
            async fn next(&mut self) -> Result<Option<HostValue>, JsError> {
                Ok(self.0.next())
            }
        }

        Self::new(Items(items.into_iter()))
    }

    pub async fn next(&self) -> Result<Option<HostValue>, JsError> {
        self.inner.lock().await.next().await
    }

    pub async fn stop(&self) -> Result<(), JsError> {
        self.inner.lock().await.stop().await
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostAsyncIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostAsyncIterator")
    }
}

/// Request/response body payload: settled bytes, or a byte stream that the
/// async marshaller reads to completion.
#[derive(Clone)]
pub enum HostBody {
    Bytes(Bytes),
    Stream(ReadableStream<Bytes>),
}

impl fmt::Debug for HostBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "HostBody::Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("HostBody::Stream"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HostBody>,
}

#[derive(Clone, Debug)]
pub struct HostResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HostBody>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormDataEntry {
    Text(String),
    File {
        data: Bytes,
        mime_type: String,
        name: String,
        last_modified: i64,
    },
}

pub type SharedArray = Arc<Mutex<Vec<HostValue>>>;
pub type SharedObject = Arc<Mutex<Vec<(String, HostValue)>>>;

/// The host-side value model the marshaller walks. Arrays and objects are
/// shared mutable nodes so value graphs (and cycles, which the marshaller
/// rejects) are expressible.
#[derive(Clone, Debug)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    BigInt(String),
    Bytes(Bytes),
    Array(SharedArray),
    Object(SharedObject),
    Date { epoch_ms: f64 },
    RegExp { source: String, flags: String },
    Url(String),
    Headers(Vec<(String, String)>),
    Function(HostFunction),
    Promise(HostPromise),
    AsyncIterator(HostAsyncIterator),
    Stream(ReadableStream<HostValue>),
    Blob { data: Bytes, mime_type: String },
    File {
        data: Bytes,
        mime_type: String,
        name: String,
        last_modified: i64,
    },
    Request(Box<HostRequest>),
    Response(Box<HostResponse>),
    FormData(Vec<(String, FormDataEntry)>),
    /// A pre-formed wire ref, passed through the codec verbatim.
    Wire(Ref),
    /// An opaque guest handle the host cannot introspect. Marshalling one
    /// fails with an unmarshalable-type error.
    EngineHandle(JsHandle),
}

impl HostValue {
    pub fn array(items: Vec<HostValue>) -> Self {
        Self::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(entries: Vec<(String, HostValue)>) -> Self {
        Self::Object(Arc::new(Mutex::new(entries)))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Converts an engine value. Numbers with no fraction become `Int`;
    /// handles stay opaque.
    pub fn from_engine(value: EngineValue) -> Self {
        match value {
            EngineValue::Undefined => Self::Undefined,
            EngineValue::Null => Self::Null,
            EngineValue::Bool(value) => Self::Bool(value),
            EngineValue::Number(value) => {
                if value.fract() == 0.0 && value.is_finite() && value.abs() < i64::MAX as f64 {
                    Self::Int(value as i64)
                } else {
                    Self::Float(value)
                }
            },
            EngineValue::String(value) => Self::String(value),
            EngineValue::Bytes(value) => Self::Bytes(value),
            EngineValue::Array(items) => {
                Self::array(items.into_iter().map(Self::from_engine).collect())
            },
            EngineValue::Object(entries) => Self::object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from_engine(value)))
                    .collect(),
            ),
            EngineValue::Handle(handle) => Self::EngineHandle(handle),
        }
    }

    /// Converts into an engine value. Only engine-expressible shapes
    /// convert; identity-bearing host values fail.
    pub fn to_engine(&self) -> Result<EngineValue, JsError> {
        Ok(match self {
            Self::Undefined => EngineValue::Undefined,
            Self::Null => EngineValue::Null,
            Self::Bool(value) => EngineValue::Bool(*value),
            Self::Int(value) => EngineValue::Number(*value as f64),
            Self::Float(value) => EngineValue::Number(*value),
            Self::String(value) => EngineValue::String(value.clone()),
            Self::Bytes(value) => EngineValue::Bytes(value.clone()),
            Self::Date { epoch_ms } => EngineValue::Number(*epoch_ms),
            Self::Array(items) => EngineValue::Array(
                items
                    .lock()
                    .unwrap()
                    .iter()
                    .map(HostValue::to_engine)
                    .collect::<Result<Vec<_>, JsError>>()?,
            ),
            Self::Object(entries) => EngineValue::Object(
                entries
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), value.to_engine()?)))
                    .collect::<Result<Vec<_>, JsError>>()?,
            ),
            Self::EngineHandle(handle) => EngineValue::Handle(*handle),
            other => {
                return Err(JsError::type_error(format!(
                    "Cannot pass {} to the engine directly",
                    other.kind_name()
                )));
            },
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::BigInt(_) => "bigint",
            Self::Bytes(_) => "Uint8Array",
            Self::Array(_) => "Array",
            Self::Object(_) => "Object",
            Self::Date { .. } => "Date",
            Self::RegExp { .. } => "RegExp",
            Self::Url(_) => "URL",
            Self::Headers(_) => "Headers",
            Self::Function(_) => "function",
            Self::Promise(_) => "Promise",
            Self::AsyncIterator(_) => "AsyncIterator",
            Self::Stream(_) => "ReadableStream",
            Self::Blob { .. } => "Blob",
            Self::File { .. } => "File",
            Self::Request(_) => "Request",
            Self::Response(_) => "Response",
            Self::FormData(_) => "FormData",
            Self::Wire(_) => "Ref",
            Self::EngineHandle(_) => "EngineHandle",
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                Arc::ptr_eq(a, b) || *a.lock().unwrap() == *b.lock().unwrap()
            },
            (Self::Object(a), Self::Object(b)) => {
                Arc::ptr_eq(a, b) || *a.lock().unwrap() == *b.lock().unwrap()
            },
            (Self::Date { epoch_ms: a }, Self::Date { epoch_ms: b }) => a == b,
            (
                Self::RegExp {
                    source: a,
                    flags: af,
                },
                Self::RegExp {
                    source: b,
                    flags: bf,
                },
            ) => a == b && af == bf,
            (Self::Url(a), Self::Url(b)) => a == b,
            (Self::Headers(a), Self::Headers(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Promise(a), Self::Promise(b)) => a.ptr_eq(b),
            (Self::AsyncIterator(a), Self::AsyncIterator(b)) => a.ptr_eq(b),
            (Self::Stream(a), Self::Stream(b)) => a.ptr_eq(b),
            (
                Self::Blob {
                    data: a,
                    mime_type: am,
                },
                Self::Blob {
                    data: b,
                    mime_type: bm,
                },
            ) => a == b && am == bm,
            (Self::FormData(a), Self::FormData(b)) => a == b,
            (Self::Wire(a), Self::Wire(b)) => a == b,
            (Self::EngineHandle(a), Self::EngineHandle(b)) => a == b,
            (
                Self::File {
                    data: a,
                    mime_type: am,
                    name: an,
                    last_modified: al,
                },
                Self::File {
                    data: b,
                    mime_type: bm,
                    name: bn,
                    last_modified: bl,
                },
            ) => a == b && am == bm && an == bn && al == bl,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn promises_settle_once() {
        let promise = HostPromise::new();
        assert!(promise.resolve(HostValue::Int(1)));
        assert!(!promise.reject(JsError::error("late")));
        assert_eq!(promise.wait().await.unwrap(), HostValue::Int(1));
    }

    #[tokio::test]
    async fn iterator_from_items_drains() {
        let iterator =
            HostAsyncIterator::from_items(vec![HostValue::Int(1), HostValue::Int(2)]);
        assert_eq!(iterator.next().await.unwrap(), Some(HostValue::Int(1)));
        assert_eq!(iterator.next().await.unwrap(), Some(HostValue::Int(2)));
        assert_eq!(iterator.next().await.unwrap(), None);
    }

    #[test]
    fn engine_round_trip_for_structures() {
        let value = HostValue::object(vec![
            ("n".to_string(), HostValue::Int(3)),
            (
                "list".to_string(),
                HostValue::array(vec![HostValue::Bool(true), HostValue::Null]),
            ),
        ]);
        let engine_value = value.to_engine().unwrap();
        assert_eq!(HostValue::from_engine(engine_value), value);
    }

    #[test]
    fn functions_cannot_cross_to_engine_directly() {
        let function = HostFunction::from_sync(|_| Ok(HostValue::Undefined));
        let err = HostValue::Function(function).to_engine().unwrap_err();
        assert!(err.message.contains("function"));
    }
}
