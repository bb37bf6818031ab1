// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use fxhash::{FxHashMap, FxHashSet};
use islet_streams::{ReadResult, ReadableStream};
use islet_utils::{error::JsError, id::IdAllocator};
use islet_wire::{
    refs::{BlobRef, FileRef, FormDataValue, RequestRef, ResponseRef},
    Ref, WireValue,
};

use crate::value::{
    FormDataEntry, HostAsyncIterator, HostBody, HostFunction, HostPromise, HostRequest,
    HostResponse, HostValue,
};

#[derive(Clone, Copy, Debug)]
pub struct MarshalOptions {
    pub max_depth: usize,
}

impl Default for MarshalOptions {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}

/// Mints Refs for identity-bearing values during marshalling. The daemon
/// registers against its connection tables; [`LocalRefTable`] keeps
/// everything in-process.
pub trait RefRegistrar: Send + Sync {
    fn register_function(&self, function: HostFunction) -> Ref;
    fn register_promise(&self, promise: HostPromise) -> Ref;
    fn register_iterator(&self, iterator: HostAsyncIterator) -> Ref;
    fn register_stream(&self, stream: ReadableStream<HostValue>) -> Ref;
}

/// Reconstructs host proxies for identity-bearing Refs during
/// unmarshalling. Resolution is infallible; unknown ids yield proxies that
/// fail on use.
pub trait RefResolver: Send + Sync {
    fn resolve_callback(&self, callback_id: u64) -> HostFunction;
    fn resolve_promise(&self, promise_id: u64) -> HostPromise;
    fn resolve_iterator(&self, iterator_id: u64) -> HostAsyncIterator;
    fn resolve_stream(&self, stream_id: u64) -> ReadableStream<HostValue>;
}

/// In-process registrar/resolver pair: Refs minted here resolve back to
/// the identical host value. Backs structuredClone and the test suites.
#[derive(Clone, Default)]
pub struct LocalRefTable {
    inner: Arc<LocalRefInner>,
}

#[derive(Default)]
struct LocalRefInner {
    ids: IdAllocator,
    functions: Mutex<FxHashMap<u64, HostFunction>>,
    promises: Mutex<FxHashMap<u64, HostPromise>>,
    iterators: Mutex<FxHashMap<u64, HostAsyncIterator>>,
    streams: Mutex<FxHashMap<u64, ReadableStream<HostValue>>>,
}

impl LocalRefTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefRegistrar for LocalRefTable {
    fn register_function(&self, function: HostFunction) -> Ref {
        let callback_id = self.inner.ids.next();
        self.inner
            .functions
            .lock()
            .unwrap()
            .insert(callback_id, function);
        Ref::Callback { callback_id }
    }

    fn register_promise(&self, promise: HostPromise) -> Ref {
        let promise_id = self.inner.ids.next();
        self.inner
            .promises
            .lock()
            .unwrap()
            .insert(promise_id, promise);
        Ref::Promise { promise_id }
    }

    fn register_iterator(&self, iterator: HostAsyncIterator) -> Ref {
        let iterator_id = self.inner.ids.next();
        self.inner
            .iterators
            .lock()
            .unwrap()
            .insert(iterator_id, iterator);
        Ref::AsyncIterator { iterator_id }
    }

    fn register_stream(&self, stream: ReadableStream<HostValue>) -> Ref {
        let stream_id = self.inner.ids.next();
        self.inner.streams.lock().unwrap().insert(stream_id, stream);
        Ref::Stream { stream_id }
    }
}

impl RefResolver for LocalRefTable {
    fn resolve_callback(&self, callback_id: u64) -> HostFunction {
        self.inner
            .functions
            .lock()
            .unwrap()
            .get(&callback_id)
            .cloned()
            .unwrap_or_else(|| {
                HostFunction::from_sync(move |_| {
                    Err(JsError::error(format!("Callback {callback_id} not found")))
                })
            })
    }

    fn resolve_promise(&self, promise_id: u64) -> HostPromise {
        self.inner
            .promises
            .lock()
            .unwrap()
            .get(&promise_id)
            .cloned()
            .unwrap_or_else(|| {
                HostPromise::rejected(JsError::error(format!("Promise {promise_id} not found")))
            })
    }

    fn resolve_iterator(&self, iterator_id: u64) -> HostAsyncIterator {
        self.inner
            .iterators
            .lock()
            .unwrap()
            .get(&iterator_id)
            .cloned()
            .unwrap_or_else(|| HostAsyncIterator::from_items(Vec::new()))
    }

    fn resolve_stream(&self, stream_id: u64) -> ReadableStream<HostValue> {
        self.inner
            .streams
            .lock()
            .unwrap()
            .get(&stream_id)
            .cloned()
            .unwrap_or_else(|| ReadableStream::from_chunks(Vec::new()))
    }
}

fn depth_error() -> JsError {
    JsError::range_error("Maximum marshal depth exceeded")
}

fn cycle_error() -> JsError {
    JsError::type_error("Circular reference detected")
}

fn unmarshalable(kind: &str) -> JsError {
    JsError::type_error(["Unmarshalable type: ", kind].concat())
}

/// Marshals a value graph into its wire form. The sync variant refuses
/// values whose body must be read (Blob, File, Request, Response,
/// FormData); use [`marshal`] for those.
pub fn marshal_sync(
    value: &HostValue,
    registrar: &dyn RefRegistrar,
    options: &MarshalOptions,
) -> Result<WireValue, JsError> {
    let mut seen = FxHashSet::default();
    marshal_sync_inner(value, registrar, options, 0, &mut seen)
}

fn marshal_sync_inner(
    value: &HostValue,
    registrar: &dyn RefRegistrar,
    options: &MarshalOptions,
    depth: usize,
    seen: &mut FxHashSet<usize>,
) -> Result<WireValue, JsError> {
    if depth > options.max_depth {
        return Err(depth_error());
    }
    Ok(match value {
        HostValue::Blob { .. }
        | HostValue::File { .. }
        | HostValue::Request(_)
        | HostValue::Response(_)
        | HostValue::FormData(_) => {
            return Err(JsError::type_error(format!(
                "Cannot synchronously marshal a {}; use the async marshaller",
                value.kind_name()
            )));
        },
        HostValue::Array(items) => {
            let key = Arc::as_ptr(items) as usize;
            if !seen.insert(key) {
                return Err(cycle_error());
            }
            let snapshot = items.lock().unwrap().clone();
            let mut marshalled = Vec::with_capacity(snapshot.len());
            for item in &snapshot {
                marshalled.push(marshal_sync_inner(item, registrar, options, depth + 1, seen)?);
            }
            seen.remove(&key);
            WireValue::Array(marshalled)
        },
        HostValue::Object(entries) => {
            let key = Arc::as_ptr(entries) as usize;
            if !seen.insert(key) {
                return Err(cycle_error());
            }
            let snapshot = entries.lock().unwrap().clone();
            let mut marshalled = Vec::with_capacity(snapshot.len());
            for (entry_key, entry_value) in &snapshot {
                marshalled.push((
                    entry_key.clone(),
                    marshal_sync_inner(entry_value, registrar, options, depth + 1, seen)?,
                ));
            }
            seen.remove(&key);
            WireValue::Map(marshalled)
        },
        other => marshal_leaf(other, registrar)?,
    })
}

/// Async marshaller: everything [`marshal_sync`] does, plus reading the
/// bodies of Blob/File/Request/Response/FormData values.
pub async fn marshal(
    value: &HostValue,
    registrar: &dyn RefRegistrar,
    options: &MarshalOptions,
) -> Result<WireValue, JsError> {
    let mut seen = FxHashSet::default();
    marshal_inner(value.clone(), registrar, options, 0, &mut seen).await
}

fn marshal_inner<'a>(
    value: HostValue,
    registrar: &'a dyn RefRegistrar,
    options: &'a MarshalOptions,
    depth: usize,
    seen: &'a mut FxHashSet<usize>,
) -> Pin<Box<dyn Future<Output = Result<WireValue, JsError>> + Send + 'a>> {
    Box::pin(async move {
        if depth > options.max_depth {
            return Err(depth_error());
        }
        Ok(match value {
            HostValue::Blob { data, mime_type } => {
                WireValue::Ref(Ref::Blob(BlobRef { data, mime_type }))
            },
            HostValue::File {
                data,
                mime_type,
                name,
                last_modified,
            } => WireValue::Ref(Ref::File(FileRef {
                data,
                mime_type,
                name,
                last_modified,
            })),
            HostValue::Request(request) => {
                let HostRequest {
                    url,
                    method,
                    headers,
                    body,
                } = *request;
                WireValue::Ref(Ref::Request(RequestRef {
                    url,
                    method,
                    headers,
                    body: read_body(body).await?,
                }))
            },
            HostValue::Response(response) => {
                let HostResponse {
                    status,
                    status_text,
                    headers,
                    body,
                } = *response;
                WireValue::Ref(Ref::Response(ResponseRef {
                    status,
                    status_text,
                    headers,
                    body: read_body(body).await?,
                }))
            },
            HostValue::FormData(entries) => WireValue::Ref(Ref::FormData {
                entries: entries
                    .into_iter()
                    .map(|(name, entry)| {
                        let value = match entry {
                            FormDataEntry::Text(text) => FormDataValue::Text(text),
                            FormDataEntry::File {
                                data,
                                mime_type,
                                name,
                                last_modified,
                            } => FormDataValue::File(FileRef {
                                data,
                                mime_type,
                                name,
                                last_modified,
                            }),
                        };
                        (name, value)
                    })
                    .collect(),
            }),
            HostValue::Array(items) => {
                let key = Arc::as_ptr(&items) as usize;
                if !seen.insert(key) {
                    return Err(cycle_error());
                }
                let snapshot = items.lock().unwrap().clone();
                let mut marshalled = Vec::with_capacity(snapshot.len());
                for item in snapshot {
                    marshalled.push(marshal_inner(item, registrar, options, depth + 1, seen).await?);
                }
                seen.remove(&key);
                WireValue::Array(marshalled)
            },
            HostValue::Object(entries) => {
                let key = Arc::as_ptr(&entries) as usize;
                if !seen.insert(key) {
                    return Err(cycle_error());
                }
                let snapshot = entries.lock().unwrap().clone();
                let mut marshalled = Vec::with_capacity(snapshot.len());
                for (entry_key, entry_value) in snapshot {
                    marshalled.push((
                        entry_key,
                        marshal_inner(entry_value, registrar, options, depth + 1, seen).await?,
                    ));
                }
                seen.remove(&key);
                WireValue::Map(marshalled)
            },
            other => marshal_leaf(&other, registrar)?,
        })
    })
}

fn marshal_leaf(value: &HostValue, registrar: &dyn RefRegistrar) -> Result<WireValue, JsError> {
    Ok(match value {
        HostValue::Undefined => WireValue::Ref(Ref::Undefined),
        HostValue::Null => WireValue::Null,
        HostValue::Bool(value) => WireValue::Bool(*value),
        HostValue::Int(value) => WireValue::Int(*value),
        HostValue::Float(value) => WireValue::Float(*value),
        HostValue::String(value) => WireValue::Str(value.clone()),
        HostValue::BigInt(value) => WireValue::Ref(Ref::BigInt {
            value: value.clone(),
        }),
        HostValue::Bytes(data) => WireValue::Ref(Ref::Uint8Array { data: data.clone() }),
        HostValue::Date { epoch_ms } => WireValue::Ref(Ref::Date {
            epoch_ms: *epoch_ms,
        }),
        HostValue::RegExp { source, flags } => WireValue::Ref(Ref::RegExp {
            source: source.clone(),
            flags: flags.clone(),
        }),
        HostValue::Url(href) => WireValue::Ref(Ref::Url { href: href.clone() }),
        HostValue::Headers(entries) => WireValue::Ref(Ref::Headers {
            entries: entries.clone(),
        }),
        HostValue::Function(function) => {
            WireValue::Ref(registrar.register_function(function.clone()))
        },
        HostValue::Promise(promise) => WireValue::Ref(registrar.register_promise(promise.clone())),
        HostValue::AsyncIterator(iterator) => {
            WireValue::Ref(registrar.register_iterator(iterator.clone()))
        },
        HostValue::Stream(stream) => WireValue::Ref(registrar.register_stream(stream.clone())),
        // Pre-formed Refs pass through verbatim.
        HostValue::Wire(reference) => WireValue::Ref(reference.clone()),
        HostValue::EngineHandle(_) => return Err(unmarshalable("EngineHandle")),
        HostValue::Array(_)
        | HostValue::Object(_)
        | HostValue::Blob { .. }
        | HostValue::File { .. }
        | HostValue::Request(_)
        | HostValue::Response(_)
        | HostValue::FormData(_) => unreachable!("handled by the walkers"),
    })
}

async fn read_body(body: Option<HostBody>) -> Result<Option<Bytes>, JsError> {
    match body {
        None => Ok(None),
        Some(HostBody::Bytes(bytes)) => Ok(Some(bytes)),
        Some(HostBody::Stream(stream)) => {
            let reader = stream.get_reader()?;
            let mut data = Vec::new();
            loop {
                match reader.read().await? {
                    ReadResult::Chunk(chunk) => data.extend_from_slice(&chunk),
                    ReadResult::Done => break,
                }
            }
            reader.release_lock();
            Ok(Some(Bytes::from(data)))
        },
    }
}

/// Reverse direction: reconstructs host values from the wire form.
/// Identity-bearing Refs become proxies via the resolver; data-bearing
/// Refs materialize into native host values.
pub fn unmarshal(value: &WireValue, resolver: &dyn RefResolver) -> Result<HostValue, JsError> {
    Ok(match value {
        WireValue::Null => HostValue::Null,
        WireValue::Bool(value) => HostValue::Bool(*value),
        WireValue::Int(value) => HostValue::Int(*value),
        WireValue::Uint(value) => match i64::try_from(*value) {
            Ok(signed) => HostValue::Int(signed),
            Err(_) => HostValue::Float(*value as f64),
        },
        WireValue::Float(value) => HostValue::Float(*value),
        WireValue::Str(value) => HostValue::String(value.clone()),
        WireValue::Bin(data) => HostValue::Bytes(data.clone()),
        WireValue::Array(items) => HostValue::array(
            items
                .iter()
                .map(|item| unmarshal(item, resolver))
                .collect::<Result<Vec<_>, JsError>>()?,
        ),
        WireValue::Map(entries) => HostValue::object(
            entries
                .iter()
                .map(|(key, entry)| Ok((key.clone(), unmarshal(entry, resolver)?)))
                .collect::<Result<Vec<_>, JsError>>()?,
        ),
        WireValue::Ref(reference) => match reference {
            Ref::Undefined => HostValue::Undefined,
            Ref::Date { epoch_ms } => HostValue::Date {
                epoch_ms: *epoch_ms,
            },
            Ref::RegExp { source, flags } => HostValue::RegExp {
                source: source.clone(),
                flags: flags.clone(),
            },
            Ref::BigInt { value } => HostValue::BigInt(value.clone()),
            Ref::Url { href } => HostValue::Url(href.clone()),
            Ref::Headers { entries } => HostValue::Headers(entries.clone()),
            Ref::Uint8Array { data } => HostValue::Bytes(data.clone()),
            Ref::Callback { callback_id } => {
                HostValue::Function(resolver.resolve_callback(*callback_id))
            },
            Ref::Promise { promise_id } => {
                HostValue::Promise(resolver.resolve_promise(*promise_id))
            },
            Ref::AsyncIterator { iterator_id } => {
                HostValue::AsyncIterator(resolver.resolve_iterator(*iterator_id))
            },
            Ref::Stream { stream_id } => HostValue::Stream(resolver.resolve_stream(*stream_id)),
            Ref::Blob(blob) => HostValue::Blob {
                data: blob.data.clone(),
                mime_type: blob.mime_type.clone(),
            },
            Ref::File(file) => HostValue::File {
                data: file.data.clone(),
                mime_type: file.mime_type.clone(),
                name: file.name.clone(),
                last_modified: file.last_modified,
            },
            Ref::Request(request) => HostValue::Request(Box::new(HostRequest {
                url: request.url.clone(),
                method: request.method.clone(),
                headers: request.headers.clone(),
                body: request.body.clone().map(HostBody::Bytes),
            })),
            Ref::Response(response) => HostValue::Response(Box::new(HostResponse {
                status: response.status,
                status_text: response.status_text.clone(),
                headers: response.headers.clone(),
                body: response.body.clone().map(HostBody::Bytes),
            })),
            Ref::FormData { entries } => HostValue::FormData(
                entries
                    .iter()
                    .map(|(name, entry)| {
                        let value = match entry {
                            FormDataValue::Text(text) => FormDataEntry::Text(text.clone()),
                            FormDataValue::File(file) => FormDataEntry::File {
                                data: file.data.clone(),
                                mime_type: file.mime_type.clone(),
                                name: file.name.clone(),
                                last_modified: file.last_modified,
                            },
                        };
                        Ok((name.clone(), value))
                    })
                    .collect::<Result<Vec<_>, JsError>>()?,
            ),
            Ref::Isolate { .. } => HostValue::Wire(reference.clone()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: HostValue) -> HostValue {
        let table = LocalRefTable::new();
        let wire = marshal_sync(&value, &table, &MarshalOptions::default()).unwrap();
        unmarshal(&wire, &table).unwrap()
    }

    #[test]
    fn primitives_and_natives_round_trip() {
        for value in [
            HostValue::Null,
            HostValue::Undefined,
            HostValue::Bool(true),
            HostValue::Int(-12),
            HostValue::Float(2.75),
            HostValue::string("text"),
            HostValue::BigInt("123456789012345678901234567890".to_string()),
            HostValue::Bytes(Bytes::from_static(&[1, 2, 3])),
            HostValue::Date {
                epoch_ms: 1_714_857_600_000.0,
            },
            HostValue::RegExp {
                source: "a.b".to_string(),
                flags: "g".to_string(),
            },
            HostValue::Url("https://example.com/".to_string()),
            HostValue::Headers(vec![("a".to_string(), "b".to_string())]),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn structures_round_trip() {
        let value = HostValue::object(vec![
            (
                "nested".to_string(),
                HostValue::array(vec![HostValue::Int(1), HostValue::string("two")]),
            ),
            ("flag".to_string(), HostValue::Bool(false)),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[tokio::test]
    async fn functions_become_callback_refs_that_resolve_back() {
        let table = LocalRefTable::new();
        let function = HostFunction::from_sync(|args| {
            Ok(HostValue::Int(match &args[0] {
                HostValue::Int(n) => n + 1,
                _ => 0,
            }))
        });
        let wire = marshal_sync(
            &HostValue::Function(function),
            &table,
            &MarshalOptions::default(),
        )
        .unwrap();
        assert!(matches!(wire, WireValue::Ref(Ref::Callback { .. })));

        match unmarshal(&wire, &table).unwrap() {
            HostValue::Function(resolved) => {
                let result = resolved.call(vec![HostValue::Int(41)]).await.unwrap();
                assert_eq!(result, HostValue::Int(42));
            },
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn promises_round_trip_through_proxies() {
        let table = LocalRefTable::new();
        let promise = HostPromise::resolved(HostValue::string("done"));
        let wire = marshal_sync(
            &HostValue::Promise(promise),
            &table,
            &MarshalOptions::default(),
        )
        .unwrap();

        match unmarshal(&wire, &table).unwrap() {
            HostValue::Promise(resolved) => {
                assert_eq!(resolved.wait().await.unwrap(), HostValue::string("done"));
            },
            other => panic!("expected promise, got {other:?}"),
        }
    }

    #[test]
    fn circular_references_are_rejected() {
        let node = HostValue::object(vec![]);
        if let HostValue::Object(entries) = &node {
            entries
                .lock()
                .unwrap()
                .push(("self".to_string(), node.clone()));
        }
        let table = LocalRefTable::new();
        let err = marshal_sync(&node, &table, &MarshalOptions::default()).unwrap_err();
        assert_eq!(err.message, "Circular reference detected");
    }

    #[test]
    fn dags_are_allowed() {
        let shared = HostValue::object(vec![("k".to_string(), HostValue::Int(1))]);
        let value = HostValue::object(vec![
            ("a".to_string(), shared.clone()),
            ("b".to_string(), shared),
        ]);
        let table = LocalRefTable::new();
        let wire = marshal_sync(&value, &table, &MarshalOptions::default()).unwrap();
        let reconstructed = unmarshal(&wire, &table).unwrap();
        assert_eq!(reconstructed, value);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = HostValue::Int(0);
        for _ in 0..120 {
            value = HostValue::array(vec![value]);
        }
        let table = LocalRefTable::new();
        let err = marshal_sync(&value, &table, &MarshalOptions::default()).unwrap_err();
        assert!(err.message.contains("depth"));
    }

    #[test]
    fn sync_marshal_refuses_body_bearing_values() {
        let table = LocalRefTable::new();
        let blob = HostValue::Blob {
            data: Bytes::from_static(b"abc"),
            mime_type: "text/plain".to_string(),
        };
        let err = marshal_sync(&blob, &table, &MarshalOptions::default()).unwrap_err();
        assert!(err.message.contains("async marshaller"));
    }

    #[tokio::test]
    async fn async_marshal_inlines_bodies() {
        let table = LocalRefTable::new();
        let request = HostValue::Request(Box::new(HostRequest {
            url: "https://example.com".to_string(),
            method: "POST".to_string(),
            headers: vec![],
            body: Some(HostBody::Stream(ReadableStream::from_chunks(vec![
                Bytes::from_static(b"hello "),
                Bytes::from_static(b"body"),
            ]))),
        }));
        let wire = marshal(&request, &table, &MarshalOptions::default())
            .await
            .unwrap();
        match wire {
            WireValue::Ref(Ref::Request(request)) => {
                assert_eq!(request.body.as_deref(), Some(&b"hello body"[..]));
            },
            other => panic!("expected request ref, got {other:?}"),
        }
    }

    #[test]
    fn preformed_refs_pass_through() {
        let table = LocalRefTable::new();
        let reference = Ref::Stream { stream_id: 77 };
        let wire = marshal_sync(
            &HostValue::Wire(reference.clone()),
            &table,
            &MarshalOptions::default(),
        )
        .unwrap();
        assert_eq!(wire, WireValue::Ref(reference));
    }

    #[test]
    fn engine_handles_are_unmarshalable() {
        let table = LocalRefTable::new();
        let err = marshal_sync(
            &HostValue::EngineHandle(crate::JsHandle(4)),
            &table,
            &MarshalOptions::default(),
        )
        .unwrap_err();
        assert!(err.message.contains("Unmarshalable"));
    }
}
