//! Tests for the scripted mock adapter and the effect recorder

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use courier_core::{
    AbortController, Adapter, EffectRegistry, Method, RequestDescriptor, RequestOutcome,
    ResolvedRequest, Response, ResponseDetails, TransportErrorKind,
};
use courier_testing::{EffectRecorder, LifecycleEvent, MockAdapter, MockResponse, test_clock};
use courier_core::environment::Clock;
use serde_json::json;
use std::time::Duration;

fn resolved(descriptor: RequestDescriptor) -> ResolvedRequest {
    ResolvedRequest::new(descriptor).unwrap()
}

#[tokio::test(start_paused = true)]
async fn script_is_consumed_in_order_and_last_repeats() {
    let adapter = MockAdapter::new();
    adapter.on(
        "/users",
        [
            MockResponse::network_error("reset"),
            MockResponse::success(json!(["ada"]), 200),
        ],
    );
    let request = RequestDescriptor::new(Method::Get, "/users");

    let first = adapter.execute(resolved(request.clone()), AbortController::new().signal()).await;
    let second = adapter.execute(resolved(request.clone()), AbortController::new().signal()).await;
    let third = adapter.execute(resolved(request), AbortController::new().signal()).await;

    assert_eq!(
        first.response.error.as_ref().and_then(courier_core::RequestError::transport_kind),
        Some(TransportErrorKind::Network)
    );
    assert_eq!(second.response.data, Some(json!(["ada"])));
    assert_eq!(third.response.data, Some(json!(["ada"])));
    assert_eq!(adapter.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn cache_key_script_wins_over_endpoint_script() {
    let adapter = MockAdapter::new();
    adapter.on("/users/1", [MockResponse::success(json!("by endpoint"), 200)]);
    adapter.on("GET_/users/1", [MockResponse::success(json!("by cache key"), 200)]);

    let request = RequestDescriptor::new(Method::Get, "/users/:id").set_param("id", 1);
    let result = adapter.execute(resolved(request), AbortController::new().signal()).await;

    assert_eq!(result.response.data, Some(json!("by cache key")));
}

#[tokio::test(start_paused = true)]
async fn unscripted_request_uses_fallback_or_fails() {
    let adapter = MockAdapter::new();
    let request = RequestDescriptor::new(Method::Post, "/orders");

    let result = adapter.execute(resolved(request.clone()), AbortController::new().signal()).await;
    assert!(!result.response.is_success());

    adapter.fallback(MockResponse::success(json!({ "ok": true }), 201));
    let result = adapter.execute(resolved(request), AbortController::new().signal()).await;
    assert_eq!(result.response.status, Some(201));
}

#[tokio::test(start_paused = true)]
async fn latency_follows_tokio_clock() {
    let adapter = MockAdapter::new();
    adapter.on(
        "/slow",
        [MockResponse::success(json!(1), 200).with_latency(Duration::from_secs(2))],
    );
    let start = tokio::time::Instant::now();

    let result = adapter
        .execute(
            resolved(RequestDescriptor::new(Method::Get, "/slow")),
            AbortController::new().signal(),
        )
        .await;

    assert!(result.response.is_success());
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(adapter.max_in_flight(), 1);
    assert_eq!(adapter.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_resolves_with_abort_error() {
    let adapter = MockAdapter::new();
    adapter.on(
        "/slow",
        [MockResponse::success(json!(1), 200).with_latency(Duration::from_secs(60))],
    );
    let controller = AbortController::new();
    let attempt = adapter.execute(
        resolved(RequestDescriptor::new(Method::Get, "/slow")),
        controller.signal(),
    );

    let task = tokio::spawn(attempt);
    tokio::time::sleep(Duration::from_secs(1)).await;
    controller.abort();
    let result = task.await.unwrap();

    assert_eq!(
        result.response.error.as_ref().and_then(courier_core::RequestError::transport_kind),
        Some(TransportErrorKind::Abort)
    );
    assert_eq!(adapter.aborted_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn call_log_records_url_and_payload() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(null), 204));

    let request = RequestDescriptor::new(Method::Put, "/users/:id")
        .set_param("id", 9)
        .set_query_param("notify", false)
        .set_payload(json!({ "name": "Grace" }));
    adapter.execute(resolved(request), AbortController::new().signal()).await;

    let calls = adapter.calls_for("/users/9?notify=false");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::Put);
    assert_eq!(adapter.payloads(), vec![Some(json!({ "name": "Grace" }))]);
}

#[test]
fn recorder_captures_callbacks_in_order() {
    let registry = EffectRegistry::new();
    let recorder = EffectRecorder::new();
    let request = RequestDescriptor::new(Method::Get, "/users");
    registry.register(recorder.effect(request.effect_key()));

    let outcome = RequestOutcome {
        response: Response::success(json!([]), 200),
        details: ResponseDetails::new(test_clock().now()),
    };
    registry.trigger(&request);
    registry.start(&request);
    registry.success(&outcome, &request);
    registry.finished(&outcome, &request);

    assert_eq!(
        recorder.kinds(),
        vec![
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Success,
            LifecycleEvent::Finished,
        ]
    );
    assert_eq!(recorder.finished_outcomes(), vec![outcome]);

    recorder.clear();
    assert!(recorder.events().is_empty());
}
