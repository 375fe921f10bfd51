//! Cross-module seed scenarios (S1-S6) exercised against the `Kernel`
//! façade end-to-end, rather than against an individual module in
//! isolation. S5 (circuit breaker open/refuse/recover) is covered as a
//! `ParallelExecutor` unit test instead, since breaker-checking is scoped
//! to the executor, not the queue (see `DESIGN.md`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forge_kernel::{Kernel, KernelConfig, QueueSettings, TaskSpec};

fn config_with_one_worker() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.queue = QueueSettings { worker_count: 1, ..config.queue };
    config
}

#[tokio::test]
async fn s1_priority_then_fifo_ordering_through_the_kernel() {
    let kernel = Kernel::start(config_with_one_worker()).await;
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    for (id, priority) in [("low", 0i64), ("high-a", 5), ("high-b", 5)] {
        let order = Arc::clone(&order);
        let label = id.to_string();
        let spec = TaskSpec::new(id, move |_ctx| {
            let order = Arc::clone(&order);
            let label = label.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().await.push(label.clone());
                Ok(serde_json::json!(label))
            })
        })
        .priority(priority);
        kernel.queue().submit(spec).await.unwrap();
    }

    for id in ["low", "high-a", "high-b"] {
        kernel.queue().await_task(&id.to_string(), Some(Duration::from_secs(2))).await;
    }

    let observed = order.lock().await.clone();
    assert_eq!(observed, vec!["high-a".to_string(), "high-b".to_string(), "low".to_string()]);

    kernel.shutdown().await;
}

#[tokio::test]
async fn s2_retry_then_succeed_through_the_kernel() {
    let kernel = Kernel::start(config_with_one_worker()).await;

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let spec = TaskSpec::new("flaky", move |_ctx| {
        let calls = Arc::clone(&calls_clone);
        Box::pin(async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(serde_json::json!("recovered"))
        })
    })
    .retries(1, Duration::from_millis(10));

    kernel.queue().submit(spec).await.unwrap();
    let result = kernel.queue().await_task(&"flaky".to_string(), Some(Duration::from_secs(2))).await;

    assert_eq!(result, Some(serde_json::json!("recovered")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    kernel.shutdown().await;
}

#[tokio::test]
async fn s3_s4_dependency_batch_and_cycle_refusal_through_the_kernel() {
    let kernel = Kernel::start(KernelConfig::default()).await;

    let ready = kernel.new_executor();
    ready.add(TaskSpec::new("root", |_ctx| Box::pin(async { Ok(serde_json::json!("root")) })), []).await;
    ready
        .add(
            TaskSpec::new("leaf", |_ctx| Box::pin(async { Ok(serde_json::json!("leaf")) })),
            ["root".to_string()],
        )
        .await;
    let results = ready.execute_all().await.unwrap();
    assert_eq!(results.get("root").unwrap(), &Some(serde_json::json!("root")));
    assert_eq!(results.get("leaf").unwrap(), &Some(serde_json::json!("leaf")));

    let cyclic = kernel.new_executor();
    cyclic.add(TaskSpec::new("a", |_ctx| Box::pin(async { Ok(serde_json::json!(1)) })), ["b".to_string()]).await;
    cyclic.add(TaskSpec::new("b", |_ctx| Box::pin(async { Ok(serde_json::json!(1)) })), ["a".to_string()]).await;
    let outcome = cyclic.execute_all().await;
    assert!(outcome.is_err());

    kernel.shutdown().await;
}

#[tokio::test]
async fn s6_periodic_scheduling_reaches_the_queue_through_the_kernel() {
    let kernel = Kernel::start(config_with_one_worker()).await;

    kernel
        .scheduler()
        .schedule(
            "tick",
            None,
            Some(Duration::from_millis(20)),
            Some(3),
            Box::new(|id| TaskSpec::new(id, |_ctx| Box::pin(async { Ok(serde_json::json!("tick")) }))),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;

    let info = kernel.scheduler().lookup(&"tick".to_string()).await.unwrap();
    assert_eq!(info.runs, 3);
    assert!(!info.active);

    let stats = kernel.queue().stats().await;
    assert_eq!(stats.completed, 3);

    kernel.shutdown().await;
}
