//! Lifecycle guarantees of the mod host, exercised end to end through
//! `ModManager` over an in-memory catalogue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use modhost_plugins::{
    BEFORE_UNLOAD, MAX_NESTED_BROADCASTS, MemorySource, ModError, ModManager, ModState, Module,
    Teardown, UnloadOutcome, entry_fn,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

fn noop(source: &MemorySource, name: &str) {
    source.register_entry(name, entry_fn(|_ctx| async { Ok(Teardown::none()) }));
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn assert_registry_matches_active(manager: &ModManager) {
    for name in manager.loaded_names() {
        assert_eq!(manager.state_of(&name), Some(ModState::Active), "{name} is registered but not active");
    }
}

#[tokio::test]
async fn registry_keys_equal_active_set_across_operations() {
    let source = Arc::new(MemorySource::new());
    for name in ["a", "b", "c"] {
        noop(&source, name);
    }
    let manager = ModManager::from_source(source);

    assert!(manager.load_many(["a", "b", "c"]).await.is_success());
    assert_registry_matches_active(&manager);

    manager.unload("b", false).await.unwrap();
    assert_eq!(manager.loaded_names(), vec!["a", "c"]);
    assert_registry_matches_active(&manager);

    manager.reload("c").await.unwrap();
    manager.load("b").await.unwrap();
    let mut names = manager.loaded_names();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_registry_matches_active(&manager);
}

#[tokio::test(start_paused = true)]
async fn concurrent_reloads_never_overlap_instances() {
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(MemorySource::new());
    {
        let live = live.clone();
        let peak = peak.clone();
        source.register_entry(
            "counter",
            entry_fn(move |_ctx| {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(Teardown::new(move |_| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }))
                }
            }),
        );
    }
    let manager = ModManager::from_source(source);
    manager.load("counter").await.unwrap();

    let reloads = (0..5).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reload("counter").await })
    });
    for result in join_all(reloads).await {
        result.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(live.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get("counter").unwrap().generation(), 6);
}

#[tokio::test(start_paused = true)]
async fn interval_never_fires_after_unload() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(MemorySource::new());
    let counter = ticks.clone();
    source.register_entry(
        "ticker",
        entry_fn(move |ctx| {
            let counter = counter.clone();
            async move {
                ctx.set_interval(Duration::from_millis(10), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })?;
                Ok(Teardown::none())
            }
        }),
    );
    let manager = ModManager::from_source(source);
    let ctx = manager.load("ticker").await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.unload("ticker", false).await.unwrap();
    assert_eq!(ctx.active_timers(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn before_unload_runs_before_teardown() {
    let flag = Arc::new(Mutex::new(None::<bool>));
    let observed = Arc::new(Mutex::new(None::<(Option<bool>, usize)>));
    let source = Arc::new(MemorySource::new());
    {
        let flag = flag.clone();
        let observed = observed.clone();
        source.register_entry(
            "careful",
            entry_fn(move |ctx| {
                let flag = flag.clone();
                let observed = observed.clone();
                async move {
                    let seen = flag.clone();
                    ctx.on(BEFORE_UNLOAD, move |args| {
                        *seen.lock() = args.first().and_then(|value| value.as_bool());
                        Ok(())
                    });
                    let weak = ctx.downgrade();
                    Ok(Teardown::blocking(move |_| {
                        let listeners = weak
                            .upgrade()
                            .map_or(usize::MAX, |instance| instance.listener_count(BEFORE_UNLOAD));
                        *observed.lock() = Some((*flag.lock(), listeners));
                        Ok(())
                    }))
                }
            }),
        );
    }
    let manager = ModManager::from_source(source);
    manager.load("careful").await.unwrap();
    manager.unload("careful", false).await.unwrap();

    assert_eq!(*observed.lock(), Some((Some(false), 0)));
}

#[tokio::test]
async fn reload_uses_fresh_source_and_purges_cycles() {
    let source = Arc::new(MemorySource::new());
    let versions = Arc::new(Mutex::new(Vec::new()));

    let register_a = |version: &'static str| {
        let versions = versions.clone();
        source.register_entry(
            "a",
            entry_fn(move |ctx| {
                let versions = versions.clone();
                async move {
                    let tag = ctx.require_library::<String>("b")?;
                    versions.lock().push(format!("{version}+{tag}"));
                    Ok(Teardown::none())
                }
            }),
        );
    };
    register_a("v1");
    // b requires a back while compiling, closing the cycle a -> b -> a.
    source.register("b", |requirer| {
        requirer.require("a")?;
        Ok(Module::library(String::from("b")))
    });

    let manager = ModManager::from_source(source.clone());
    manager.load("a").await.unwrap();
    let compiles_after_load = source.compile_count();

    register_a("v2");
    manager.reload("a").await.unwrap();

    assert_eq!(*versions.lock(), vec!["v1+b".to_string(), "v2+b".to_string()]);
    assert_eq!(source.compile_count(), compiles_after_load + 2, "both a and b were recompiled");
    assert_eq!(manager.get("a").unwrap().generation(), 2);

    let purged = manager.uncache("a").unwrap();
    let purged: Vec<&str> = purged.iter().map(|id| id.as_str()).collect();
    assert_eq!(purged, vec!["a", "b"]);
}

#[tokio::test]
async fn unload_all_empties_the_registry() {
    let source = Arc::new(MemorySource::new());
    for name in ["one", "two", "three"] {
        noop(&source, name);
    }
    let manager = ModManager::from_source(source);
    manager.load_many(["one", "two", "three"]).await;

    let report = manager.unload_all(false).await;
    assert_eq!(report.len(), 3);
    assert!(report.results.iter().all(|(_, result)| matches!(result, Ok(UnloadOutcome::Unloaded))));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn broadcast_reaches_other_mods_and_self() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(MemorySource::new());
    for name in ["sender", "receiver"] {
        let received = received.clone();
        source.register_entry(
            name,
            entry_fn(move |ctx| {
                let received = received.clone();
                async move {
                    let me = ctx.name().to_string();
                    ctx.on("greet", move |args| {
                        received.lock().push((me.clone(), args.to_vec()));
                        Ok(())
                    });
                    Ok(Teardown::none())
                }
            }),
        );
    }
    let manager = ModManager::from_source(source);
    manager.load("sender").await.unwrap();
    manager.load("receiver").await.unwrap();

    let sender = manager.get("sender").unwrap();
    assert_eq!(sender.broadcast("greet", &[json!("hi")]), 2);
    assert_eq!(
        *received.lock(),
        vec![
            ("sender".to_string(), vec![json!("hi")]),
            ("receiver".to_string(), vec![json!("hi")]),
        ]
    );
}

#[tokio::test]
async fn batch_operations_isolate_failures() {
    let source = Arc::new(MemorySource::new());
    noop(&source, "steady");
    source.register_entry(
        "fragile",
        entry_fn(|_ctx| async {
            Ok(Teardown::blocking(|_| anyhow::bail!("disk full")))
        }),
    );
    let manager = ModManager::from_source(source);
    assert!(manager.load_many(["steady", "fragile"]).await.is_success());

    let report = manager.reload_many(["steady", "fragile"]).await;
    assert!(report.is_success(), "teardown failure during reload does not block the fresh load");

    let report = manager.unload_many(["fragile", "steady", "ghost"], false).await;
    let failed: Vec<&str> = report.failures().map(|(name, _)| name).collect();
    assert_eq!(failed, vec!["fragile"]);
    assert!(matches!(report.get("ghost"), Some(Ok(UnloadOutcome::NotLoaded))));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn concurrent_load_of_same_name_is_rejected() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(MemorySource::new());
    let wait = gate.clone();
    source.register_entry(
        "slow",
        entry_fn(move |_ctx| {
            let wait = wait.clone();
            async move {
                wait.notified().await;
                Ok(Teardown::none())
            }
        }),
    );
    let manager = ModManager::from_source(source);

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load("slow").await })
    };
    settle().await;
    assert_eq!(manager.state_of("slow"), Some(ModState::Loading));

    assert!(matches!(
        manager.load("slow").await,
        Err(ModError::AlreadyLoading(name)) if name == "slow"
    ));

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert!(manager.is_loaded("slow"));
}

#[tokio::test]
async fn unload_waits_for_in_flight_init() {
    let gate = Arc::new(Notify::new());
    let torn_down = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(MemorySource::new());
    {
        let wait = gate.clone();
        let torn_down = torn_down.clone();
        source.register_entry(
            "warming",
            entry_fn(move |_ctx| {
                let wait = wait.clone();
                let torn_down = torn_down.clone();
                async move {
                    wait.notified().await;
                    Ok(Teardown::blocking(move |_| {
                        torn_down.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                }
            }),
        );
    }
    let manager = ModManager::from_source(source);

    let load = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load("warming").await })
    };
    settle().await;
    let unload = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.unload("warming", false).await })
    };
    settle().await;
    assert!(!unload.is_finished());
    assert_eq!(manager.state_of("warming"), Some(ModState::Loading));

    gate.notify_one();
    load.await.unwrap().unwrap();
    assert_eq!(unload.await.unwrap().unwrap(), UnloadOutcome::Unloaded);
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert!(manager.is_empty());
}

#[tokio::test]
async fn autoload_reports_each_mod() {
    let source = Arc::new(MemorySource::new());
    noop(&source, "fine");
    source.register_entry("faulty", entry_fn(|_ctx| async { anyhow::bail!("bad config") }));
    let manager = ModManager::from_source(source);

    let report = manager.autoload().await.unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report.succeeded().map(|(name, _)| name).collect::<Vec<_>>(), vec!["fine"]);
    assert_eq!(manager.loaded_names(), vec!["fine"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_sharing_an_uncompiled_library_both_succeed() {
    let source = Arc::new(MemorySource::new());
    source.register("lib", |_| {
        std::thread::sleep(Duration::from_millis(200));
        Ok(Module::library(7u32))
    });
    for name in ["x", "y"] {
        source.register_entry(
            name,
            entry_fn(|ctx| async move {
                let value = ctx.require_library::<u32>("lib")?;
                assert_eq!(*value, 7);
                Ok(Teardown::none())
            }),
        );
    }
    let manager = ModManager::from_source(source);

    let loads = ["x", "y"].map(|name| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(name).await })
    });
    for (name, result) in ["x", "y"].into_iter().zip(join_all(loads).await) {
        let outcome = result.unwrap();
        assert!(outcome.is_ok(), "{name}: {:?}", outcome.err().map(|e| e.to_string()));
    }
    let mut names = manager.loaded_names();
    names.sort();
    assert_eq!(names, vec!["x", "y"]);
}

#[tokio::test]
async fn fan_out_broadcast_loop_stays_bounded() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(MemorySource::new());
    for name in ["echo-a", "echo-b"] {
        let invocations = invocations.clone();
        source.register_entry(
            name,
            entry_fn(move |ctx| {
                let invocations = invocations.clone();
                async move {
                    let weak = ctx.downgrade();
                    ctx.on("ping", move |args| {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        if let Some(instance) = weak.upgrade() {
                            instance.broadcast("ping", args);
                        }
                        Ok(())
                    });
                    Ok(Teardown::none())
                }
            }),
        );
    }
    let manager = ModManager::from_source(source);
    assert!(manager.load_many(["echo-a", "echo-b"]).await.is_success());

    assert_eq!(manager.broadcast("ping", &[json!(1)]), 2);
    let total = invocations.load(Ordering::SeqCst);
    assert!(total > 2);
    assert!(total <= 2 * MAX_NESTED_BROADCASTS, "{total} handler calls");
}
