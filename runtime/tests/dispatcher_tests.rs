//! Integration tests for per-key ordered execution
//!
//! Every test runs on tokio's paused clock: adapter latency, retry delays and
//! debounce windows advance virtual time only, so the start offsets asserted
//! below are exact.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::{Backoff, Method, RequestError, TransportErrorKind};
use courier_runtime::{Client, ClientConfig, DispatchError};
use courier_testing::{EffectRecorder, LifecycleEvent, ManualClock, MockAdapter, MockResponse};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Test Fixtures
// ============================================================================

fn client(adapter: &MockAdapter) -> Client {
    Client::with_clock(
        adapter.clone(),
        ClientConfig::default(),
        Arc::new(ManualClock::starting_at_epoch()),
    )
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Start offsets (relative to `start`) of every adapter call.
fn offsets(adapter: &MockAdapter, start: Instant) -> Vec<Duration> {
    adapter
        .calls()
        .iter()
        .map(|call| call.started_at - start)
        .collect()
}

// ============================================================================
// Ordering and concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn requests_on_one_key_run_one_at_a_time_in_submission_order() {
    let adapter = MockAdapter::new();
    adapter.on(
        "POST_/items",
        [MockResponse::success(json!("ok"), 200).with_latency(ms(100))],
    );
    let client = client(&adapter);
    let start = Instant::now();

    let handles: Vec<_> = (1..=3)
        .map(|n| {
            client
                .submit(client.request(Method::Post, "/items").set_payload(n))
                .unwrap()
        })
        .collect();

    for handle in &handles {
        assert!(handle.wait().await.unwrap().response.is_success());
    }

    assert_eq!(
        adapter.payloads(),
        vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]
    );
    assert_eq!(offsets(&adapter, start), vec![ms(0), ms(100), ms(200)]);
    assert_eq!(adapter.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_descriptors_share_a_key_without_waiting() {
    let adapter = MockAdapter::new();
    adapter.on(
        "GET_/feed",
        [MockResponse::success(json!([]), 200).with_latency(ms(100))],
    );
    let client = client(&adapter);
    let start = Instant::now();

    let request = client.request(Method::Get, "/feed").set_concurrent(true);
    let first = client.submit(request.clone()).unwrap();
    let second = client.submit(request).unwrap();

    first.wait().await.unwrap();
    second.wait().await.unwrap();

    assert_eq!(offsets(&adapter, start), vec![ms(0), ms(0)]);
    assert_eq!(adapter.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn different_keys_do_not_block_each_other() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(null), 200).with_latency(ms(250)));
    let client = client(&adapter);
    let start = Instant::now();

    let users = client.submit(client.request(Method::Get, "/users")).unwrap();
    let orders = client.submit(client.request(Method::Get, "/orders")).unwrap();

    users.wait().await.unwrap();
    orders.wait().await.unwrap();

    assert_eq!(offsets(&adapter, start), vec![ms(0), ms(0)]);
}

#[tokio::test(start_paused = true)]
async fn has_running_requests_tracks_execution() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(ms(50)));
    let client = client(&adapter);
    let request = client.request(Method::Get, "/status");
    let key = request.queue_key();

    assert!(!client.dispatcher().has_running_requests(&key));

    let handle = client.submit(request).unwrap();
    assert!(client.dispatcher().has_running_requests(&key));
    assert!(client.is_loading(&key));

    handle.wait().await.unwrap();
    assert!(!client.dispatcher().has_running_requests(&key));
    // The queue record outlives its last request
    assert!(client.dispatcher().queue(&key).is_some());
}

#[tokio::test(start_paused = true)]
async fn queue_snapshot_lists_running_and_pending_in_order() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(ms(100)));
    let client = client(&adapter);
    let request = client.request(Method::Post, "/batch");
    let key = request.queue_key();

    let a = client.submit(request.clone()).unwrap();
    let b = client.submit(request.clone()).unwrap();
    let c = client.submit(request).unwrap();

    let snapshot = client.dispatcher().queue(&key).unwrap();
    assert_eq!(snapshot.running, vec![a.id()]);
    assert_eq!(snapshot.pending, vec![b.id(), c.id()]);
    assert!(!snapshot.stopped);
    assert_eq!(client.dispatcher().pending_count(&key), 2);
}

// ============================================================================
// Success and failure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn success_writes_cache_then_notifies_effects() {
    let adapter = MockAdapter::new();
    adapter.on("GET_/users/7", [MockResponse::success(json!({ "id": 7 }), 200)]);
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Get, "/users/:id").set_param("id", 7);
    client.effects().register(recorder.effect(request.effect_key()));

    // Observe the cache from inside on_success
    let cache = client.cache().clone();
    let key = request.cache_key();
    let seen_in_cache = Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&seen_in_cache);
    client.effects().register(
        courier_core::RequestEffect::new(request.effect_key()).on_success(move |_, _| {
            *seen.lock().unwrap() = cache.get(&key).map(|entry| entry.response);
        }),
    );

    let outcome = client.fetch(request.clone()).await.unwrap();

    assert_eq!(outcome.response.data, Some(json!({ "id": 7 })));
    assert_eq!(outcome.details.retries, 0);
    assert!(!outcome.details.is_failed);
    assert_eq!(
        recorder.kinds(),
        vec![
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Success,
            LifecycleEvent::Finished,
        ]
    );
    assert_eq!(*seen_in_cache.lock().unwrap(), Some(outcome.response.clone()));
    assert_eq!(
        client.cache().get(&request.cache_key()).unwrap().outcome(),
        outcome
    );
}

#[tokio::test(start_paused = true)]
async fn retry_runs_before_later_submissions() {
    let adapter = MockAdapter::new();
    adapter.on(
        "POST_/jobs",
        [
            MockResponse::network_error("reset").with_latency(ms(10)),
            MockResponse::success(json!("done"), 200).with_latency(ms(10)),
        ],
    );
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client
        .request(Method::Post, "/jobs")
        .set_retry(1)
        .set_retry_time(ms(50));
    client.effects().register(recorder.effect(request.effect_key()));
    let start = Instant::now();

    let first = client.submit(request.set_payload("first")).unwrap();
    let later = client.submit(request.set_payload("later")).unwrap();

    let first_outcome = first.wait().await.unwrap();
    later.wait().await.unwrap();

    assert_eq!(
        adapter.payloads(),
        vec![Some(json!("first")), Some(json!("first")), Some(json!("later"))]
    );
    // fail at 10, retry after 50ms, succeed at 70, then the later request
    assert_eq!(offsets(&adapter, start), vec![ms(0), ms(60), ms(70)]);
    assert_eq!(first_outcome.details.retries, 1);
    assert!(first_outcome.response.is_success());

    // Retries are silent: one trigger/start pair per request
    assert_eq!(
        recorder.kinds(),
        vec![
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Success,
            LifecycleEvent::Finished,
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Success,
            LifecycleEvent::Finished,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_once_as_error() {
    let adapter = MockAdapter::new();
    adapter.on("GET_/flaky", [MockResponse::network_error("down")]);
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client
        .request(Method::Get, "/flaky")
        .set_retry(2)
        .set_retry_time(ms(100));
    client.effects().register(recorder.effect(request.effect_key()));

    let outcome = client.fetch(request.clone()).await.unwrap();

    assert_eq!(adapter.call_count(), 3);
    assert!(outcome.details.is_failed);
    assert_eq!(outcome.details.retries, 2);
    assert_eq!(
        outcome.response.error.as_ref().and_then(RequestError::transport_kind),
        Some(TransportErrorKind::Network)
    );
    assert_eq!(
        recorder.kinds(),
        vec![
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Error,
            LifecycleEvent::Finished,
        ]
    );

    let entry = client.cache().get(&request.cache_key()).unwrap();
    assert!(entry.details.is_failed);
    assert!(entry.response.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_spaces_attempts() {
    let adapter = MockAdapter::new();
    adapter.on("GET_/backoff", [MockResponse::network_error("down")]);
    let client = client(&adapter);
    let start = Instant::now();

    let request = client
        .request(Method::Get, "/backoff")
        .set_retry(3)
        .set_retry_time(ms(100))
        .set_backoff(Backoff::Exponential);
    client.fetch(request).await.unwrap();

    assert_eq!(
        offsets(&adapter, start),
        vec![ms(0), ms(100), ms(300), ms(700)]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_error_payload_is_captured() {
    let adapter = MockAdapter::new();
    adapter.on(
        "POST_/orders",
        [MockResponse::remote_error(json!({ "code": "out_of_stock" }), 409)],
    );
    let client = client(&adapter);

    let outcome = client
        .fetch(client.request(Method::Post, "/orders"))
        .await
        .unwrap();

    assert_eq!(outcome.response.status, Some(409));
    assert_eq!(
        outcome.response.error,
        Some(RequestError::Remote(json!({ "code": "out_of_stock" })))
    );
    assert!(outcome.details.is_failed);
}

#[tokio::test(start_paused = true)]
async fn unresolved_param_is_a_validation_failure_without_retry() {
    let adapter = MockAdapter::new();
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Get, "/users/:id").set_retry(3);
    client.effects().register(recorder.effect(request.effect_key()));

    let outcome = client.fetch(request.clone()).await.unwrap();

    assert!(matches!(outcome.response.error, Some(RequestError::Validation(_))));
    assert!(outcome.details.is_failed);
    assert_eq!(outcome.details.retries, 0);
    assert_eq!(adapter.call_count(), 0);
    assert_eq!(recorder.count(LifecycleEvent::Error), 1);
    assert_eq!(recorder.count(LifecycleEvent::Finished), 1);
    assert!(client.cache().get("GET_/users/:id").is_some());
}

#[tokio::test(start_paused = true)]
async fn offline_flag_is_carried_into_details() {
    let adapter = MockAdapter::new();
    adapter.on("GET_/sync", [MockResponse::network_error("offline").offline()]);
    let client = client(&adapter);

    let outcome = client.fetch(client.request(Method::Get, "/sync")).await.unwrap();

    assert!(outcome.details.is_offline);
    assert!(outcome.details.is_failed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn abort_in_flight_fires_finished_only_and_frees_the_slot() {
    let adapter = MockAdapter::new();
    adapter.on(
        "POST_/upload",
        [
            MockResponse::success(json!("slow"), 200).with_latency(Duration::from_secs(1)),
            MockResponse::success(json!("next"), 200),
        ],
    );
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Post, "/upload");
    client.effects().register(recorder.effect(request.effect_key()));
    let start = Instant::now();

    let slow = client.submit(request.clone()).unwrap();
    let next = client.submit(request).unwrap();

    tokio::time::sleep(ms(100)).await;
    assert!(slow.abort());

    let canceled = slow.wait().await.unwrap();
    let succeeded = next.wait().await.unwrap();

    assert!(canceled.details.is_canceled);
    assert!(!canceled.details.is_failed);
    assert!(canceled.response.error.is_none());
    assert_eq!(succeeded.response.data, Some(json!("next")));
    assert_eq!(offsets(&adapter, start), vec![ms(0), ms(100)]);
    assert_eq!(
        recorder.kinds(),
        vec![
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Finished,
            LifecycleEvent::Trigger,
            LifecycleEvent::Start,
            LifecycleEvent::Success,
            LifecycleEvent::Finished,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn canceled_result_is_cached_only_on_request() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(Duration::from_secs(5)));
    let client = client(&adapter);

    let plain = client.request(Method::Get, "/plain");
    let handle = client.submit(plain.clone()).unwrap();
    handle.abort();
    assert!(handle.wait().await.unwrap().details.is_canceled);
    assert!(client.cache().get(&plain.cache_key()).is_none());

    let kept = client.request(Method::Get, "/kept").set_cache_canceled(true);
    let handle = client.submit(kept.clone()).unwrap();
    handle.abort();
    handle.wait().await.unwrap();
    let entry = client.cache().get(&kept.cache_key()).unwrap();
    assert!(entry.details.is_canceled);
    assert!(entry.response.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn abort_pending_request_skips_the_adapter() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(ms(100)));
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Post, "/queue");
    client.effects().register(recorder.effect(request.effect_key()));

    let running = client.submit(request.set_payload("running")).unwrap();
    let waiting = client.submit(request.set_payload("waiting")).unwrap();

    assert!(client.dispatcher().abort(waiting.id()));
    let canceled = waiting.wait().await.unwrap();
    running.wait().await.unwrap();

    assert!(canceled.details.is_canceled);
    assert_eq!(adapter.payloads(), vec![Some(json!("running"))]);
    let finished_payloads: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| e.event == LifecycleEvent::Finished)
        .map(|e| e.payload)
        .collect();
    assert_eq!(
        finished_payloads,
        vec![Some(json!("waiting")), Some(json!("running"))]
    );
}

#[tokio::test(start_paused = true)]
async fn abort_by_key_cancels_running_and_pending() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(Duration::from_secs(1)));
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Get, "/reports");
    client.effects().register(recorder.effect(request.effect_key()));

    let a = client.submit(request.clone()).unwrap();
    let b = client.submit(request.clone()).unwrap();
    tokio::time::sleep(ms(10)).await;
    client.dispatcher().abort_by_key(&request.queue_key());

    assert!(a.wait().await.unwrap().details.is_canceled);
    assert!(b.wait().await.unwrap().details.is_canceled);
    assert_eq!(adapter.call_count(), 1);
    assert_eq!(recorder.count(LifecycleEvent::Finished), 2);
    assert_eq!(recorder.count(LifecycleEvent::Success), 0);
    assert!(!client.dispatcher().has_running_requests(&request.queue_key()));
}

#[tokio::test(start_paused = true)]
async fn descriptor_timeout_surfaces_as_timeout_error() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(Duration::from_secs(5)));
    let client = client(&adapter);

    let outcome = client
        .fetch(
            client
                .request(Method::Get, "/slow")
                .set_timeout(Some(Duration::from_secs(1))),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.response.error.as_ref().and_then(RequestError::transport_kind),
        Some(TransportErrorKind::Timeout)
    );
    assert!(outcome.details.is_failed);
    assert!(!outcome.details.is_canceled);
}

// ============================================================================
// Queue control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stopped_queue_rejects_and_holds_pending() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(ms(100)));
    let client = client(&adapter);
    let request = client.request(Method::Put, "/settings");
    let key = request.queue_key();

    let running = client.submit(request.clone()).unwrap();
    let held = client.submit(request.clone()).unwrap();
    client.dispatcher().stop(&key);

    assert_eq!(
        client.submit(request.clone()).unwrap_err(),
        DispatchError::QueueStopped(key.clone())
    );

    running.wait().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.call_count(), 1);
    assert_eq!(client.dispatcher().pending_count(&key), 1);
    assert!(client.dispatcher().is_stopped(&key));

    client.dispatcher().start(&key);
    held.wait().await.unwrap();
    assert_eq!(adapter.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn delete_removes_pending_request_silently() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200).with_latency(ms(100)));
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Post, "/drafts");
    client.effects().register(recorder.effect(request.effect_key()));

    let running = client.submit(request.set_payload("kept")).unwrap();
    let deleted = client.submit(request.set_payload("deleted")).unwrap();

    assert!(client.dispatcher().delete(deleted.id()));
    assert!(!client.dispatcher().delete(deleted.id()));
    // Running requests cannot be deleted
    assert!(!client.dispatcher().delete(running.id()));

    assert!(deleted.wait().await.is_none());
    running.wait().await.unwrap();

    assert_eq!(adapter.payloads(), vec![Some(json!("kept"))]);
    assert!(recorder.events().iter().all(|e| e.payload == Some(json!("kept"))));
}

#[tokio::test(start_paused = true)]
async fn delete_refuses_a_request_waiting_for_its_retry() {
    let adapter = MockAdapter::new();
    adapter.on(
        "PUT_/profile",
        [
            MockResponse::network_error("reset"),
            MockResponse::success(json!("saved"), 200),
        ],
    );
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client
        .request(Method::Put, "/profile")
        .set_retry(1)
        .set_retry_time(ms(500));
    client.effects().register(recorder.effect(request.effect_key()));

    let handle = client.submit(request).unwrap();
    tokio::time::sleep(ms(10)).await;
    assert_eq!(client.dispatcher().pending_count(handle.queue_key()), 1);

    assert!(!client.dispatcher().delete(handle.id()));

    // Aborting is how a started request is withdrawn; it settles exactly once
    assert!(handle.abort());
    let outcome = handle.wait().await.unwrap();
    assert!(outcome.details.is_canceled);
    assert_eq!(outcome.details.retries, 1);
    assert_eq!(
        recorder.kinds(),
        vec![LifecycleEvent::Trigger, LifecycleEvent::Start, LifecycleEvent::Finished]
    );
    assert_eq!(adapter.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn debounced_submissions_collapse_into_the_last_one() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!([]), 200));
    let client = client(&adapter);
    let search = client
        .request(Method::Get, "/search")
        .set_queue_key("search")
        .set_debounce(true)
        .set_debounce_time(ms(300));
    let start = Instant::now();

    let first = client.submit(search.set_query_param("q", "c")).unwrap();
    tokio::time::sleep(ms(100)).await;
    let second = client.submit(search.set_query_param("q", "co")).unwrap();
    tokio::time::sleep(ms(100)).await;
    let third = client.submit(search.set_query_param("q", "cou")).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.id(), third.id());

    let outcome = first.wait().await.unwrap();
    assert!(outcome.response.is_success());
    assert_eq!(third.wait().await, Some(outcome));

    let calls = adapter.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "/search?q=cou");
    // Window restarts on each submission: 200ms + 300ms
    assert_eq!(offsets(&adapter, start), vec![ms(500)]);
}

#[tokio::test(start_paused = true)]
async fn deduplicated_submissions_share_one_execution() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!({ "n": 1 }), 200).with_latency(ms(100)));
    let client = client(&adapter);
    let recorder = EffectRecorder::new();
    let request = client.request(Method::Get, "/profile").set_deduplicate(true);
    client.effects().register(recorder.effect(request.effect_key()));

    let a = client.submit(request.clone()).unwrap();
    let b = client.submit(request).unwrap();

    assert_eq!(a.id(), b.id());
    assert_eq!(a.wait().await, b.wait().await);
    assert_eq!(adapter.call_count(), 1);
    assert_eq!(recorder.count(LifecycleEvent::Trigger), 1);
}

#[tokio::test(start_paused = true)]
async fn effects_may_submit_follow_up_requests() {
    let adapter = MockAdapter::new();
    adapter.fallback(MockResponse::success(json!(1), 200));
    let client = client(&adapter);
    let request = client.request(Method::Post, "/login");

    let follow_up = client.clone();
    client.effects().register(
        courier_core::RequestEffect::new(request.effect_key()).on_success(move |_, _| {
            follow_up
                .submit(follow_up.request(Method::Get, "/me"))
                .unwrap();
        }),
    );

    client.fetch(request).await.unwrap();
    tokio::time::sleep(ms(10)).await;

    let urls: Vec<_> = adapter.calls().into_iter().map(|call| call.url).collect();
    assert_eq!(urls, vec!["/login".to_owned(), "/me".to_owned()]);
}

#[test]
fn submitting_outside_a_runtime_is_rejected() {
    let client = client(&MockAdapter::new());

    let result = client.submit(client.request(Method::Get, "/users"));

    assert_eq!(result.unwrap_err(), DispatchError::RuntimeUnavailable);
}
