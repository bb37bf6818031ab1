// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_bridge::{define_async_function, define_function, EngineValue, HostValue};
use islet_test::MockEngine;
use islet_utils::error::JsError;

#[tokio::test]
async fn sync_functions_are_invokable_from_the_guest() {
    let mut engine = MockEngine::new();
    define_function(&mut engine, "add", |args| {
        let sum = args
            .iter()
            .map(|arg| match arg {
                HostValue::Int(n) => *n,
                _ => 0,
            })
            .sum();
        Ok(HostValue::Int(sum))
    })
    .unwrap();

    let result = engine
        .probe()
        .invoke_global(
            "add",
            vec![EngineValue::Number(20.0), EngineValue::Number(22.0)],
        )
        .await
        .unwrap();
    assert_eq!(result, EngineValue::Number(42.0));
}

#[tokio::test]
async fn async_functions_settle_before_returning() {
    let mut engine = MockEngine::new();
    define_async_function(&mut engine, "delayedEcho", |args| {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(args.into_iter().next().unwrap_or(HostValue::Undefined))
        })
    })
    .unwrap();

    let result = engine
        .probe()
        .invoke_global("delayedEcho", vec![EngineValue::String("hi".to_string())])
        .await
        .unwrap();
    assert_eq!(result, EngineValue::String("hi".to_string()));
}

#[tokio::test]
async fn errors_cross_with_the_name_prefix() {
    let mut engine = MockEngine::new();
    define_function(&mut engine, "fail", |_args| {
        Err(JsError::type_error("bad argument"))
    })
    .unwrap();

    let err = engine
        .probe()
        .invoke_global("fail", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.message, "[TypeError]bad argument");
}
