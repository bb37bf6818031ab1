// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The host-to-guest bridge: an abstract engine capability, handle scopes,
//! the instance-state registry, the value marshaller and the class/function
//! builders that project host implementations into the guest global scope.

pub mod class_builder;
pub mod engine;
pub mod function_builder;
pub mod instances;
pub mod marshal;
pub mod scope;
pub mod value;

pub use class_builder::{
    ClassBuilder, ClassRegistry, ClassSpec, MethodKind, MethodSpec, PropertySpec,
    StaticMethodSpec, StaticPropertySpec,
};
pub use engine::{
    CallbackFuture, Engine, EngineError, EngineResult, EngineValue, JsHandle, NativeCallback,
};
pub use function_builder::{define_async_function, define_function};
pub use instances::InstanceRegistry;
pub use marshal::{
    marshal, marshal_sync, unmarshal, LocalRefTable, MarshalOptions, RefRegistrar, RefResolver,
};
pub use scope::{with_scope, with_scope_async, HandleTracker, Scope};
pub use value::{
    AsyncIteration, FormDataEntry, HostAsyncIterator, HostBody, HostFunction, HostFuture,
    HostPromise, HostRequest, HostResponse, HostValue,
};
