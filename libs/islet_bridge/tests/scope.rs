// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_bridge::{with_scope, with_scope_async, Engine, HandleTracker, HostValue, JsHandle};
use islet_test::MockEngine;
use islet_utils::error::JsError;

#[test]
fn handles_release_in_lifo_order() {
    let mut engine = MockEngine::new();
    let first = engine.make_handle();
    let second = engine.make_handle();
    let third = engine.make_handle();

    with_scope(&mut engine, |scope, _engine| {
        scope.manage(first);
        scope.manage(second);
        scope.manage(third);
        Ok(())
    })
    .unwrap();

    assert_eq!(engine.released(), vec![third.0, second.0, first.0]);
}

#[test]
fn handles_release_even_when_body_fails() {
    let mut engine = MockEngine::new();
    let handle = engine.make_handle();

    let result: Result<(), JsError> = with_scope(&mut engine, |scope, _engine| {
        scope.manage(handle);
        Err(JsError::error("body failed"))
    });
    assert!(result.is_err());
    assert_eq!(engine.released(), vec![handle.0]);
}

#[test]
fn dead_handle_release_failures_are_swallowed() {
    let mut engine = MockEngine::new();
    let live = engine.make_handle();
    let dead = JsHandle(9999);

    with_scope(&mut engine, |scope, _engine| {
        scope.manage(live);
        scope.manage(dead);
        Ok(())
    })
    .unwrap();

    // The dead handle failed to release; the live one still did.
    assert_eq!(engine.released(), vec![live.0]);
}

#[test]
fn scope_marshal_adopts_the_allocation() {
    let mut engine = MockEngine::new();
    let probe = engine.probe();
    with_scope(&mut engine, |scope, engine| {
        let handle = scope.marshal(engine, &HostValue::string("hello"))?;
        assert_eq!(scope.len(), 1);
        assert!(probe.is_live(handle));
        Ok(())
    })
    .unwrap();
    assert_eq!(engine.released().len(), 1);
}

#[tokio::test]
async fn async_scope_releases_after_awaits() {
    let mut mock = MockEngine::new();
    let probe = mock.probe();
    let first = mock.make_handle();
    let second = mock.make_handle();
    let engine: tokio::sync::Mutex<Box<dyn Engine>> = tokio::sync::Mutex::new(Box::new(mock));

    with_scope_async(&engine, |scope| async move {
        scope.manage(first);
        tokio::task::yield_now().await;
        scope.manage(second);
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(probe.released(), vec![second.0, first.0]);
}

#[test]
fn tracker_bulk_releases() {
    let mut engine = MockEngine::new();
    let tracker = HandleTracker::new();
    let first = tracker.track(engine.make_handle());
    let second = tracker.track(engine.make_handle());
    assert_eq!(tracker.len(), 2);

    tracker.cleanup_unmarshaled_handles(&mut engine);
    assert_eq!(tracker.len(), 0);
    assert_eq!(engine.released(), vec![second.0, first.0]);
}
