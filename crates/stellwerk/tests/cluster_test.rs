//! End-to-end scenarios over the in-process cluster: allocation,
//! group collectives, suspension/resume, completion signalling, and
//! pool conservation.

use std::sync::{Arc, Mutex};

use stellwerk::{Cluster, KernelRegistry, TaskContext};

#[test]
fn reduction_task_end_to_end() {
    let registry = Arc::new(KernelRegistry::new());
    let result: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));

    let sink = result.clone();
    registry.register("sum_ranks", move |ctx: Arc<dyn TaskContext>| {
        let sink = sink.clone();
        async move {
            let group = ctx.group();
            let gathered: Vec<u64> = group.allgather(group.rank() as u64).await?;
            if group.is_leader() {
                *sink.lock().unwrap() = Some(gathered.iter().sum());
            }
            Ok(())
        }
    });

    let cluster = Cluster::launch(5, registry);
    let free_before = cluster.scheduler().free_units();
    assert_eq!(free_before, 4);

    // min 2: exactly two units are allocated, group ranks 0 and 1.
    let tid = cluster.spawn("sum_ranks", 2, 4);
    cluster.wait_for(tid);

    assert_eq!(*result.lock().unwrap(), Some(1));
    assert_eq!(cluster.scheduler().free_units(), free_before);
    assert_eq!(cluster.scheduler().active_tasks(), 0);

    cluster.shutdown().unwrap();
}

#[test]
fn wait_for_is_immediate_once_completed() {
    let registry = Arc::new(KernelRegistry::new());
    registry.register("noop", |_ctx| async { Ok(()) });

    let cluster = Cluster::launch(3, registry);
    let tid = cluster.spawn("noop", 1, 1);

    cluster.wait_for(tid);
    assert!(cluster.scheduler().is_completed(tid));

    // Waiting again after completion must return immediately with the
    // same observable behavior.
    cluster.wait_for(tid);
    cluster.wait_for(tid);

    cluster.shutdown().unwrap();
}

#[test]
fn suspend_resume_preserves_locals_and_ordering() {
    let registry = Arc::new(KernelRegistry::new());
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let parent_log = log.clone();
    registry.register("parent", move |ctx: Arc<dyn TaskContext>| {
        let log = parent_log.clone();
        async move {
            let group = ctx.group();
            // Local state that must survive the suspend point.
            let sentinel = 41u64;

            let child = if group.is_leader() {
                log.lock().unwrap().push("parent:before".into());
                Some(ctx.spawn("child", 1, 1).await?)
            } else {
                None
            };
            let child = group.broadcast(child).await?;

            ctx.wait_for(child).await?;

            if group.is_leader() {
                log.lock()
                    .unwrap()
                    .push(format!("parent:after:{}", sentinel + 1));
            }
            Ok(())
        }
    });

    let child_log = log.clone();
    registry.register("child", move |ctx: Arc<dyn TaskContext>| {
        let log = child_log.clone();
        async move {
            if ctx.group().is_leader() {
                log.lock().unwrap().push("child:ran".into());
            }
            Ok(())
        }
    });

    let cluster = Cluster::launch(4, registry);
    let free_before = cluster.scheduler().free_units();

    let tid = cluster.spawn("parent", 2, 2);
    cluster.wait_for(tid);

    // The parent resumed exactly after its wait_for, with locals intact.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "parent:before".to_string(),
            "child:ran".to_string(),
            "parent:after:42".to_string(),
        ]
    );
    assert_eq!(cluster.scheduler().free_units(), free_before);

    cluster.shutdown().unwrap();
}

#[test]
fn queued_task_runs_when_capacity_frees_up() {
    let registry = Arc::new(KernelRegistry::new());
    registry.register("noop", |_ctx| async { Ok(()) });

    let cluster = Cluster::launch(3, registry); // 2 worker units

    // Both need the whole node; the second must queue behind the first.
    let first = cluster.spawn("noop", 2, 2);
    let second = cluster.spawn("noop", 2, 2);

    cluster.wait_for(first);
    cluster.wait_for(second);

    assert!(cluster.scheduler().is_completed(first));
    assert!(cluster.scheduler().is_completed(second));
    assert_eq!(cluster.scheduler().free_units(), 2);

    cluster.shutdown().unwrap();
}

#[test]
fn concurrent_tasks_conserve_the_pool() {
    let registry = Arc::new(KernelRegistry::new());
    registry.register("noop", |_ctx| async { Ok(()) });

    let cluster = Cluster::launch(6, registry); // 5 worker units
    let capacity = cluster.scheduler().capacity();

    let tids: Vec<_> = (0..4).map(|_| cluster.spawn("noop", 1, 2)).collect();
    for tid in tids {
        cluster.wait_for(tid);
    }

    assert_eq!(cluster.scheduler().free_units(), capacity);
    assert_eq!(cluster.scheduler().active_tasks(), 0);

    cluster.shutdown().unwrap();
}
