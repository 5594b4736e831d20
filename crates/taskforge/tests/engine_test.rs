//! End-to-end scenarios on the in-memory store
//!
//! These drive a full manager (dispatcher, executors, maintenance loop)
//! with short intervals and assert on observable task rows. Sweeps run
//! on whole-second arithmetic, so the retry/timeout scenarios use real
//! waits with generous deadlines.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use taskforge::prelude::*;
use taskforge::{DecodedResult, StatusUpdate};

fn fast_config() -> TaskManagerConfig {
    TaskManagerConfig::new()
        .with_worker_id("test-worker")
        .with_poll_interval_ms(20)
        .with_active_update_interval_ms(100)
}

fn new_manager(store: &Arc<InMemoryTaskStore>, config: TaskManagerConfig) -> TaskManager {
    init_tracing();
    let store: Arc<dyn TaskStore> = Arc::clone(store) as Arc<dyn TaskStore>;
    TaskManager::new(store, config)
}

/// Route engine logs through RUST_LOG when debugging a flaky scenario.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Poll a task row until `pred` holds or the deadline passes.
async fn wait_for_task<F>(manager: &TaskManager, id: u64, deadline: Duration, pred: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        let task = manager.get_task(id).await.expect("task should exist");
        if pred(&task) {
            return task;
        }
        if start.elapsed() > deadline {
            panic!(
                "task {id} did not reach expected state in {deadline:?}; \
                 currently {} (retry_count={}, stage={})",
                task.status, task.retry_count, task.stage
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ============================================
// Basic execution
// ============================================

#[tokio::test]
async fn test_async_task_completes() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    manager
        .register(
            "h",
            HandlerRegistration::new(|_ctx| async move {
                Ok(HandlerOutcome::complete(json!({"ok": true})))
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_async("h", json!({"x": 1}), SubmitOptions::new())
        .await
        .unwrap();

    let task = wait_for_task(&manager, id, Duration::from_secs(2), |t| {
        t.status == TaskStatus::Completed
    })
    .await;

    assert_eq!(task.retry_count, 0);
    assert_eq!(task.worker_id.as_deref(), Some("test-worker"));
    match task.decoded_result().unwrap() {
        Some(DecodedResult::Value(v)) => assert_eq!(v, json!({"ok": true})),
        other => panic!("expected value result, got {other:?}"),
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_task_retries_then_permanently_fails() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    manager
        .register(
            "h",
            HandlerRegistration::new(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("deliberate failure".to_string())
                }
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_async(
            "h",
            json!({}),
            SubmitOptions::new().with_max_retries(2).with_retry_interval(0),
        )
        .await
        .unwrap();

    let task = wait_for_task(&manager, id, Duration::from_secs(15), |t| {
        t.status == TaskStatus::PermanentlyFailed
    })
    .await;

    // Initial attempt plus max_retries retries
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(task.retry_count, 2);
    assert!(task.error.as_deref().unwrap().contains("deliberate failure"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_claim_order_follows_priority() {
    let store = Arc::new(InMemoryTaskStore::new());
    // One slot so execution order mirrors claim order
    let manager = new_manager(&store, fast_config().with_max_concurrent_tasks(1));

    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&order);
    manager
        .register(
            "h",
            HandlerRegistration::new(move |ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    let who = ctx.payload()["who"].as_str().unwrap_or("?").to_string();
                    sink.lock().unwrap().push(who);
                    Ok(HandlerOutcome::complete(json!(null)))
                }
            }),
        )
        .unwrap();
    manager.start().await.unwrap();
    manager.pause_all();

    let a = manager
        .submit_async("h", json!({"who": "a"}), SubmitOptions::new().with_priority(0))
        .await
        .unwrap();
    let b = manager
        .submit_async("h", json!({"who": "b"}), SubmitOptions::new().with_priority(10))
        .await
        .unwrap();
    let c = manager
        .submit_async("h", json!({"who": "c"}), SubmitOptions::new().with_priority(5))
        .await
        .unwrap();

    manager.resume_all();
    for id in [a, b, c] {
        wait_for_task(&manager, id, Duration::from_secs(5), |t| {
            t.status == TaskStatus::Completed
        })
        .await;
    }

    assert_eq!(*order.lock().unwrap(), vec!["b", "c", "a"]);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_per_type_concurrency_cap() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let (flight, peak) = (Arc::clone(&in_flight), Arc::clone(&high_water));
    manager
        .register(
            "capped",
            HandlerRegistration::new(move |_ctx| {
                let flight = Arc::clone(&flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::complete(json!(null)))
                }
            })
            .with_max_concurrent(1),
        )
        .unwrap();
    manager.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            manager
                .submit_async("capped", json!({}), SubmitOptions::new())
                .await
                .unwrap(),
        );
    }
    for id in ids {
        wait_for_task(&manager, id, Duration::from_secs(5), |t| {
            t.status == TaskStatus::Completed
        })
        .await;
    }

    assert_eq!(high_water.load(Ordering::SeqCst), 1);
    manager.stop().await.unwrap();
}

// ============================================
// Workflows
// ============================================

#[tokio::test]
async fn test_workflow_fan_out_and_rejoin() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    let reentry_stage = Arc::new(AtomicU32::new(u32::MAX));
    let seen_stage = Arc::clone(&reentry_stage);
    manager
        .register(
            "parent",
            HandlerRegistration::new(move |ctx| {
                let seen_stage = Arc::clone(&seen_stage);
                async move {
                    if ctx.stage() == 0 {
                        return Ok(HandlerOutcome::spawn(vec![
                            ChildSpec::new("c1"),
                            ChildSpec::new("c2"),
                        ]));
                    }
                    seen_stage.store(ctx.stage(), Ordering::SeqCst);
                    let results: Vec<_> = ctx
                        .child_outcomes()
                        .iter()
                        .map(|o| match o {
                            ChildOutcome::Completed { result, .. } => result.clone(),
                            ChildOutcome::Failed { error, .. } => error.clone(),
                        })
                        .collect();
                    assert_eq!(results, vec![json!({"r": 1}), json!({"r": 2})]);
                    Ok(HandlerOutcome::complete(json!({"done": true})))
                }
            }),
        )
        .unwrap();
    manager
        .register(
            "c1",
            HandlerRegistration::new(|_ctx| async move {
                Ok(HandlerOutcome::complete(json!({"r": 1})))
            }),
        )
        .unwrap();
    manager
        .register(
            "c2",
            HandlerRegistration::new(|_ctx| async move {
                Ok(HandlerOutcome::complete(json!({"r": 2})))
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_async("parent", json!({}), SubmitOptions::new())
        .await
        .unwrap();

    let parent = wait_for_task(&manager, id, Duration::from_secs(5), |t| {
        t.status == TaskStatus::Completed
    })
    .await;

    assert_eq!(reentry_stage.load(Ordering::SeqCst), 1);
    match parent.decoded_result().unwrap() {
        Some(DecodedResult::Value(v)) => assert_eq!(v, json!({"done": true})),
        other => panic!("expected value result, got {other:?}"),
    }

    let children = manager.get_children(id).await.unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.root_id, Some(id));
        assert_eq!(child.parent_id, Some(id));
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_workflow_child_failure_cascades_to_parent() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    manager
        .register(
            "parent",
            HandlerRegistration::new(|ctx| async move {
                if ctx.stage() == 0 {
                    return Ok(HandlerOutcome::spawn(vec![
                        ChildSpec::new("c1")
                            .with_options(SubmitOptions::new().with_max_retries(0)),
                        ChildSpec::new("c2"),
                    ]));
                }
                if ctx.child_outcomes().iter().any(|o| o.is_failure()) {
                    return Err("a child permanently failed".to_string());
                }
                Ok(HandlerOutcome::complete(json!({"done": true})))
            })
            .with_max_retries(0),
        )
        .unwrap();
    manager
        .register(
            "c1",
            HandlerRegistration::new(|_ctx| async move { Err("c1 exploded".to_string()) }),
        )
        .unwrap();
    manager
        .register(
            "c2",
            HandlerRegistration::new(|_ctx| async move {
                Ok(HandlerOutcome::complete(json!({"r": 2})))
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_async("parent", json!({}), SubmitOptions::new())
        .await
        .unwrap();

    let parent = wait_for_task(&manager, id, Duration::from_secs(15), |t| {
        t.status == TaskStatus::PermanentlyFailed
    })
    .await;

    // The child log survives the parent's own failure: one success entry,
    // one failure entry, ordered by child id
    let children = manager.get_children(id).await.unwrap();
    let c1 = children.iter().find(|c| c.name == "c1").unwrap();
    let c2 = children.iter().find(|c| c.name == "c2").unwrap();
    assert_eq!(c1.status, TaskStatus::PermanentlyFailed);
    assert_eq!(c2.status, TaskStatus::Completed);

    let raw = parent.result.as_deref().unwrap();
    assert!(raw.contains(&format!("{}!", c1.id)));
    assert!(raw.contains(&format!("{}:", c2.id)));

    let outcomes = parent.child_outcomes().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes.iter().filter(|o| o.is_failure()).count(), 1);

    manager.stop().await.unwrap();
}

// ============================================
// Cron
// ============================================

#[tokio::test]
async fn test_cron_task_oscillates() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    manager
        .register(
            "tick",
            HandlerRegistration::new(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::complete(json!({"ticked": true})))
                }
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_cron("tick", "* * * * * *", json!({}), SubmitOptions::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let count = invocations.load(Ordering::SeqCst);
    assert!((2..=4).contains(&count), "expected 2..=4 runs, got {count}");

    let task = wait_for_task(&manager, id, Duration::from_secs(2), |t| {
        t.status == TaskStatus::Pending
    })
    .await;
    assert!(task.next_run_time > taskforge::task::now_secs() - 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_cron_retry_exhaustion_pauses_then_manual_resume() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    manager
        .register(
            "tick",
            HandlerRegistration::new(|_ctx| async move { Err("cron blew up".to_string()) }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .submit_cron(
            "tick",
            "* * * * * *",
            json!({}),
            SubmitOptions::new().with_max_retries(1).with_retry_interval(0),
        )
        .await
        .unwrap();

    let task = wait_for_task(&manager, id, Duration::from_secs(15), |t| {
        t.status == TaskStatus::Paused
    })
    .await;
    assert_eq!(task.retry_count, 1);

    // Hold the dispatcher so the resumed row can be observed before it
    // is claimed again
    manager.pause_all();
    manager.resume(id).await.unwrap();
    let task = manager.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);

    manager.stop().await.unwrap();
}

// ============================================
// Maintenance
// ============================================

#[tokio::test]
async fn test_heartbeat_lost_then_retry() {
    let store = Arc::new(InMemoryTaskStore::new());
    // The manager's maintenance loop does the sweeping; the stalled task
    // is claimed outside the manager so nobody heartbeats it.
    let manager = new_manager(&store, fast_config().with_active_update_interval_ms(200));
    manager.start().await.unwrap();

    let id = manager
        .submit_async("orphan", json!({}), SubmitOptions::new())
        .await
        .unwrap();
    let claimed = store
        .claim(&["orphan".to_string()], "dead-worker")
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(claimed.id, id);

    let task = wait_for_task(&manager, id, Duration::from_secs(10), |t| {
        t.status != TaskStatus::Running
    })
    .await;
    assert_eq!(task.status, TaskStatus::Timeout);
    assert!(task.error.as_deref().unwrap().contains("heartbeat lost"));

    // A later sweep schedules the retry
    let task = wait_for_task(&manager, id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Pending
    })
    .await;
    assert_eq!(task.retry_count, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_expiry_gc_deletes_old_terminal_tasks() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(
        &store,
        fast_config().with_expire_seconds(1_800),
    );
    manager.start().await.unwrap();

    let old = manager
        .submit_async("done", json!({}), SubmitOptions::new())
        .await
        .unwrap();
    let fresh = manager
        .submit_async("done", json!({}), SubmitOptions::new())
        .await
        .unwrap();

    // Complete both outside the dispatcher ("done" has no handler)
    for id in [old, fresh] {
        store
            .claim(&["done".to_string()], "gc-test")
            .await
            .unwrap()
            .expect("claimable");
        store
            .update_status(id, TaskStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();
    }
    store.rewind_times(old, 3_600);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(manager.get_task(old).await.is_err());
    let kept = manager.get_task(fresh).await.unwrap();
    assert_eq!(kept.status, TaskStatus::Completed);

    manager.stop().await.unwrap();
}

// ============================================
// Claim exclusivity
// ============================================

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let store = Arc::new(InMemoryTaskStore::new());
    store
        .insert(
            vec![taskforge::NewTask::run_once(
                "solo",
                json!({}),
                taskforge::task::now_secs(),
            )],
            None,
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim(&["solo".to_string()], &format!("w{i}"))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_workflow_spawn_links_root_across_generations() {
    let store = Arc::new(InMemoryTaskStore::new());
    let manager = new_manager(&store, fast_config());

    // parent spawns mid, mid spawns leaf; root_id stays the top task
    manager
        .register(
            "parent",
            HandlerRegistration::new(|ctx| async move {
                if ctx.stage() == 0 {
                    return Ok(HandlerOutcome::spawn(vec![ChildSpec::new("mid")]));
                }
                Ok(HandlerOutcome::complete(json!("root done")))
            }),
        )
        .unwrap();
    manager
        .register(
            "mid",
            HandlerRegistration::new(|ctx| async move {
                if ctx.stage() == 0 {
                    return Ok(HandlerOutcome::spawn_with_context(
                        vec![ChildSpec::new("leaf")],
                        b"mid-state".to_vec(),
                    ));
                }
                assert_eq!(ctx.context(), Some(b"mid-state".as_ref()));
                Ok(HandlerOutcome::complete(json!("mid done")))
            }),
        )
        .unwrap();
    manager
        .register(
            "leaf",
            HandlerRegistration::new(|_ctx| async move {
                Ok(HandlerOutcome::complete(json!("leaf done")))
            }),
        )
        .unwrap();
    manager.start().await.unwrap();

    let root = manager
        .submit_async("parent", json!({}), SubmitOptions::new())
        .await
        .unwrap();

    wait_for_task(&manager, root, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Completed
    })
    .await;

    let mids = manager.get_by_name("mid").await.unwrap();
    let leaves = manager.get_by_name("leaf").await.unwrap();
    assert_eq!(mids.len(), 1);
    assert_eq!(leaves.len(), 1);
    assert_eq!(mids[0].root_id, Some(root));
    assert_eq!(leaves[0].root_id, Some(root));
    assert_eq!(leaves[0].parent_id, Some(mids[0].id));

    manager.stop().await.unwrap();
}
