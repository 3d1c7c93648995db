//! Stress tests aimed at the ordering, once and isolation guarantees.
//!
//! These run many emissions and transitions concurrently and with shuffled
//! registration orders.

#[cfg(test)]
mod stress_tests {
    use crate::bus::{EventBus, SubscribeOptions};
    use crate::core::{Event, Payload};
    use crate::machine::{MachineConfig, MachineRegistry, TransitionTable};
    use crate::payload;
    use crate::testing::{FailingHandler, RecordingHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn recorder(log: &Arc<Mutex<Vec<i32>>>, label: i32) -> impl crate::bus::EventHandler {
        let log = log.clone();
        move |_event: Arc<Event>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(label);
                anyhow::Ok(())
            }
        }
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[tokio::test]
    async fn test_shuffled_priorities_run_descending() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for _ in 0..20 {
            let bus = EventBus::new();
            let log = Arc::new(Mutex::new(Vec::new()));

            let mut priorities: Vec<i32> = (0..32).map(|p| p * 3 - 40).collect();
            rng.shuffle(&mut priorities);

            for &priority in &priorities {
                bus.subscribe(
                    "tick",
                    recorder(&log, priority),
                    SubscribeOptions::new().priority(priority),
                );
            }

            bus.emit("tick", Payload::new()).await;

            let mut expected = priorities.clone();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            assert_eq!(*log.lock().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_shuffled_failures_keep_order_of_survivors() {
        let mut rng = fastrand::Rng::with_seed(42);
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = FailingHandler::error("flaky");

        let mut survivors = Vec::new();
        for priority in (0..40).rev() {
            if rng.bool() {
                bus.subscribe(
                    "tick",
                    failing.clone(),
                    SubscribeOptions::new().priority(priority),
                );
            } else {
                bus.subscribe(
                    "tick",
                    recorder(&log, priority),
                    SubscribeOptions::new().priority(priority),
                );
                survivors.push(priority);
            }
        }

        let notified = bus.emit("tick", Payload::new()).await;

        assert_eq!(notified, survivors.len());
        assert_eq!(failing.calls(), 40 - survivors.len());
        assert_eq!(*log.lock().unwrap(), survivors);
    }

    // ==========================================================================
    // Concurrency
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_once_fires_once_under_concurrent_emits() {
        let bus = EventBus::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        bus.once("auth:login", move |_event: Arc<Event>| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.emit("auth:login", payload! { "attempt" => i }).await })
            })
            .collect();

        let mut delivered = 0;
        for task in tasks {
            delivered += task.await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(delivered, 1);
        assert_eq!(bus.listener_count("auth:login"), 0);
        assert_eq!(bus.history_len(), 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_history_stays_bounded_under_concurrent_emits() {
        let bus = EventBus::builder().with_history_capacity(10).build();
        let recorder = RecordingHandler::new();
        bus.on("wallet:transaction", recorder.clone());

        let tasks: Vec<_> = (0..8)
            .map(|worker| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for n in 0..25 {
                        bus.emit("wallet:transaction", payload! { "worker" => worker, "n" => n })
                            .await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(recorder.count(), 200);
        assert_eq!(bus.history_len(), 10);
        assert_eq!(bus.recent_events(100).len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscription_churn_during_emission() {
        let bus = EventBus::new();
        let stable = RecordingHandler::new();
        bus.on("churn", stable.clone());

        let churner = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let id = bus.on("churn", |_event: Arc<Event>| async { anyhow::Ok(()) });
                    tokio::task::yield_now().await;
                    assert!(bus.unsubscribe("churn", id));
                }
            })
        };

        for _ in 0..200 {
            bus.emit("churn", Payload::new()).await;
        }
        churner.await.unwrap();

        assert_eq!(stable.count(), 200);
        assert_eq!(bus.listener_count("churn"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_apply_once() {
        let machines = MachineRegistry::new();
        machines.register(
            "payment-1",
            MachineConfig::new().transitions(
                [("idle", "start", "processing")]
                    .into_iter()
                    .collect::<TransitionTable>(),
            ),
        );

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let machines = machines.clone();
                tokio::spawn(async move {
                    machines
                        .transition("payment-1", "start", payload! { "winner" => i })
                        .unwrap()
                })
            })
            .collect();

        let mut successes = Vec::new();
        for task in tasks {
            let result = task.await.unwrap();
            if result.success {
                successes.push(result);
            }
        }

        assert_eq!(successes.len(), 1);
        let machine = machines.get("payment-1").unwrap();
        assert_eq!(machine.state(), "processing");
        assert_eq!(
            machine.context().get("winner"),
            successes[0].context.as_ref().unwrap().get("winner")
        );
    }

    // ==========================================================================
    // Re-entrancy
    // ==========================================================================

    #[tokio::test]
    async fn test_deep_nested_emission() {
        let bus = EventBus::new();
        let depth = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        let counter = depth.clone();
        bus.on("recurse", move |event: Arc<Event>| {
            let bus = inner_bus.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let level = event.get("level").and_then(|v| v.as_u64()).unwrap_or(0);
                if level < 25 {
                    bus.emit("recurse", payload! { "level" => level + 1 }).await;
                }
                anyhow::Ok(())
            }
        });

        let notified = bus.emit("recurse", payload! { "level" => 0 }).await;

        assert_eq!(notified, 1);
        assert_eq!(depth.load(Ordering::SeqCst), 26);
        assert_eq!(bus.history_len(), 26);
    }
}
