//! Integration tests for gating predicates

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_ops_core::{LifecycleEvent, UnwrapError};
use composable_ops_runtime::{AsyncOperation, OperationApi};
use composable_ops_testing::helpers::recording_context;
use composable_ops_testing::{LifecycleTest, assertions};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Catalog {
    loading: HashSet<String>,
}

type Event = LifecycleEvent<String, usize, ()>;

/// Loads a page unless it is already loading; counts work invocations
fn load_page(calls: Arc<AtomicUsize>) -> AsyncOperation<String, usize, (), Catalog> {
    AsyncOperation::new(
        "catalog/load",
        move |page: String, api: OperationApi<Catalog, (), ()>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(api.fulfill(page.len()))
            }
        },
    )
    .with_condition(|page: &String, scope| !scope.read_state().loading.contains(page))
}

fn loading(page: &str) -> Catalog {
    Catalog {
        loading: std::iter::once(page.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_condition_true_runs_work() {
    let calls = Arc::new(AtomicUsize::new(0));

    LifecycleTest::new(load_page(Arc::clone(&calls)))
        .given_state(Catalog::default())
        .with_extra(())
        .when_invoked("home".to_string())
        .then_events(|events| {
            assertions::assert_event_types(events, &["catalog/load/pending", "catalog/load/fulfilled"]);
        })
        .run()
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_condition_veto_is_silent_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));

    let outcome = LifecycleTest::new(load_page(Arc::clone(&calls)))
        .given_state(loading("home"))
        .with_extra(())
        .when_invoked("home".to_string())
        .then_events(|events| assertions::assert_no_events(events))
        .then_outcome(|outcome| assertions::assert_condition_failed(outcome))
        .run()
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        outcome.error().and_then(|e| e.message()),
        Some("Aborted due to condition callback returning false.")
    );
}

#[tokio::test]
async fn test_condition_veto_dispatched_when_requested() {
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = load_page(Arc::clone(&calls)).with_dispatch_condition_rejection(true);
    let (context, sink, _state) = recording_context::<_, _, Event>(loading("home"), ());

    let handle = operation.invoke("home".to_string(), &context);
    let error = handle.unwrap().await.unwrap_err();

    assert!(error.is_condition_failed());
    assert!(!error.is_aborted());
    assertions::assert_event_types(&sink.events(), &["catalog/load/rejected"]);
    assertions::assert_condition_failed(&sink.events()[0]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_condition_reads_current_state_per_invocation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = load_page(Arc::clone(&calls));
    let (context, sink, state) = recording_context::<_, _, Event>(Catalog::default(), ());

    assert!(operation.invoke("a".to_string(), &context).unwrap().await.is_ok());

    state.set(loading("a"));
    let vetoed = operation.invoke("a".to_string(), &context).unwrap().await;
    assert!(matches!(vetoed, Err(UnwrapError::Failed(_))));

    assert!(operation.invoke("b".to_string(), &context).unwrap().await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_async_condition_veto() {
    let operation: AsyncOperation<String, usize, (), Catalog> = AsyncOperation::new(
        "catalog/load",
        |page: String, api: OperationApi<Catalog, (), ()>| async move { Ok(api.fulfill(page.len())) },
    )
    .with_async_condition(|page: String, scope| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        !scope.read_state().loading.contains(&page)
    });

    LifecycleTest::new(operation.clone())
        .given_state(loading("slow"))
        .with_extra(())
        .when_invoked("slow".to_string())
        .then_events(|events| assertions::assert_no_events(events))
        .then_outcome(|outcome| assertions::assert_condition_failed(outcome))
        .run()
        .await;

    LifecycleTest::new(operation)
        .given_state(loading("slow"))
        .with_extra(())
        .when_invoked("fast".to_string())
        .then_outcome(|outcome| {
            assert!(matches!(outcome, LifecycleEvent::Succeeded { value: 4, .. }));
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_condition_sees_request_id_and_extra() {
    let operation: AsyncOperation<String, usize, (), (), &'static str> = AsyncOperation::new(
        "catalog/tagged",
        |page: String, api: OperationApi<(), &'static str, ()>| async move {
            Ok(api.fulfill(page.len() + api.extra().len()))
        },
    )
    .with_condition(|_: &String, scope| *scope.extra() == "allowed" && !scope.request_id().as_str().is_empty());

    LifecycleTest::new(operation.clone())
        .given_state(())
        .with_extra("allowed")
        .when_invoked("abc".to_string())
        .then_outcome(|outcome| {
            assert!(matches!(outcome, LifecycleEvent::Succeeded { value: 10, .. }));
        })
        .run()
        .await;

    LifecycleTest::new(operation)
        .given_state(())
        .with_extra("denied")
        .when_invoked("abc".to_string())
        .then_outcome(|outcome| assertions::assert_condition_failed(outcome))
        .run()
        .await;
}

#[tokio::test]
async fn test_panicking_condition_fails_without_started() {
    let operation: AsyncOperation<String, usize, (), Catalog> = AsyncOperation::new(
        "catalog/load",
        |page: String, api: OperationApi<Catalog, (), ()>| async move { Ok(api.fulfill(page.len())) },
    )
    .with_condition(|page: &String, _scope| {
        assert!(!page.is_empty(), "empty page name");
        true
    });

    LifecycleTest::new(operation)
        .given_state(Catalog::default())
        .with_extra(())
        .when_invoked(String::new())
        .then_events(|events| {
            assertions::assert_event_types(events, &["catalog/load/rejected"]);
        })
        .then_outcome(|outcome| {
            assertions::assert_failed_with(outcome, "Panic", "empty page name");
            assert!(!outcome.condition_failed());
        })
        .run()
        .await;
}
