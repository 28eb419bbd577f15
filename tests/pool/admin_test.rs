/*!
 * Process administration, capacity changes and garbage collection
 */

use crate::support::{app, receive, wait_until, Harness, WAIT};
use app_pool::{
    DisableResult, DummySpawnerFactory, GetError, Pool, PoolConfig, ProcessId, SpawnError,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_request_queue_overflow_is_rejected() {
    let harness = Harness::new(6);
    let options = app("queue").with_max_request_queue_size(2);
    harness.get(&options).close();
    let holding = harness.get(&options);

    harness.controller.pause();
    let first = harness.async_get(&options);
    let second = harness.async_get(&options);
    harness.wait_for_default_group("queue", |g| g.get_waitlist == 2);

    let overflow = harness.async_get(&options);
    assert!(matches!(
        receive(&overflow),
        Err(GetError::RequestQueueFull { max: 2 })
    ));

    harness.controller.resume();
    let a = receive(&first).expect("queued request served");
    let b = receive(&second).expect("queued request served");
    drop((holding, a, b));
    harness.shutdown();
}

#[test]
#[serial]
fn test_spawn_failure_fails_waiters_without_retrying() {
    let harness = Harness::new(6);
    let options = app("flaky");
    harness.controller.fail_next_spawns(1);

    let result = harness.pool.get(options.clone(), WAIT);
    assert!(matches!(
        result,
        Err(GetError::SpawnFailed(SpawnError::Handshake(_)))
    ));
    let group = harness.wait_for_default_group("flaky", |g| !g.spawning);
    assert_eq!(group.process_count(), 0);
    assert_eq!(harness.controller.spawn_count(), 1);

    // the next request tries again
    harness.get(&options).close();
    assert_eq!(harness.controller.spawn_count(), 2);
    harness.shutdown();
}

#[test]
#[serial]
fn test_process_is_recycled_after_max_requests() {
    let harness = Harness::new(6);
    let options = app("leaky").with_max_requests(2);

    let first = harness.get(&options);
    let recycled = first.pid();
    first.close();
    let second = harness.get(&options);
    assert_eq!(second.pid(), recycled);
    second.close();

    let group = harness.wait_for_default_group("leaky", |g| {
        g.enabled_count == 1 && g.processes[0].pid != recycled
    });
    assert_eq!(group.processes[0].processed, 0);
    assert!(wait_until(WAIT, || harness
        .controller
        .worker(recycled)
        .map(|w| w.is_exited())
        .unwrap_or(false)));

    let third = harness.get(&options);
    assert_ne!(third.pid(), recycled);
    third.close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_out_of_band_work_runs_once_sessions_drain() {
    let harness = Harness::new(6);
    let options = app("oobw");
    let session = harness.get(&options);
    let pid = session.pid();
    assert!(session.request_oobw());
    session.close();

    assert!(wait_until(WAIT, || harness
        .controller
        .worker(pid)
        .map(|w| w.oobw_runs() == 1)
        .unwrap_or(false)));
    let group = harness.wait_for_default_group("oobw", |g| {
        g.enabled_count == 2 && g.disabled_count == 0 && g.disabling_count == 0
    });
    assert!(group.processes.iter().any(|p| p.pid == pid));
    harness.pool.verify_invariants();
    harness.shutdown();
}

#[test]
#[serial]
fn test_detach_process_by_pid() {
    let harness = Harness::new(6);
    let options = app("detach");
    let session = harness.get(&options);
    let pid = session.pid();
    let snapshot = harness.pool.find_process_by_pid(pid).expect("process is known");
    assert_eq!(snapshot.sessions, 1);
    session.close();

    assert!(harness.pool.detach_process_by_pid(pid));
    assert!(!harness.pool.detach_process_by_pid(pid));
    assert!(!harness.pool.detach_process_by_pid(1));

    // the minimum of one process is restored
    harness.wait_for_default_group("detach", |g| g.enabled_count == 1 && g.detached_count == 0);
    assert!(harness.pool.find_process_by_pid(pid).is_none());
    harness.shutdown();
}

#[test]
#[serial]
fn test_disable_and_enable_idle_process() {
    let harness = Harness::new(6);
    let options = app("toggle").with_min_processes(2);
    harness.get(&options).close();
    let group = harness.wait_for_default_group("toggle", |g| g.enabled_count == 2 && !g.spawning);
    let target = group.processes[0].id;

    assert_eq!(
        harness.pool.disable_process_blocking(target, WAIT),
        DisableResult::Success
    );
    let group = harness.default_group("toggle").unwrap();
    assert_eq!(group.disabled_count, 1);
    assert_eq!(group.enabled_count, 1);

    // disabled processes are not routed to
    let session = harness.get(&options);
    assert_ne!(session.process_id(), target);
    session.close();

    assert!(harness.pool.enable_process(target));
    assert!(harness.pool.enable_process(target));
    assert_eq!(harness.default_group("toggle").unwrap().enabled_count, 2);

    assert_eq!(
        harness.pool.disable_process(ProcessId(u64::MAX), |_, _| {}),
        DisableResult::Noop
    );
    assert!(!harness.pool.enable_process(ProcessId(u64::MAX)));
    harness.shutdown();
}

#[test]
#[serial]
fn test_growing_capacity_serves_pool_waiters() {
    let harness = Harness::new(1);
    let holding = harness.get(&app("first"));

    let waiting = harness.async_get(&app("second"));
    assert!(wait_until(WAIT, || harness.pool.inspect().get_waitlist == 1));
    assert!(harness.super_group("second").is_none());

    harness.pool.set_max(2);
    let session = receive(&waiting).expect("served after the pool grew");
    assert_eq!(harness.pool.max(), 2);
    assert_eq!(harness.pool.capacity_used(), 2);

    drop((holding, session));
    harness.shutdown();
}

#[test]
#[serial]
fn test_idle_process_elsewhere_is_evicted_for_new_app() {
    let harness = Harness::new(1);
    let idle = harness.get(&app("first"));
    let evicted = idle.pid();
    idle.close();

    let session = harness.get(&app("second"));
    assert_ne!(session.pid(), evicted);
    assert!(wait_until(WAIT, || harness
        .controller
        .worker(evicted)
        .map(|w| w.shutdown_triggered())
        .unwrap_or(false)));
    session.close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_garbage_collector_retires_idle_applications() {
    let config = PoolConfig::testing().with_max_idle_time(Duration::from_millis(50));
    let harness = Harness::with_config(config);
    harness.get(&app("idle").with_min_processes(0)).close();
    harness.get(&app("kept")).close();

    assert!(wait_until(WAIT, || harness.super_group("idle").is_none()));
    let kept = harness.default_group("kept").expect("min processes keep the app alive");
    assert_eq!(kept.enabled_count, 1);
    harness.shutdown();
}

#[test]
#[serial]
fn test_manual_garbage_collection_sweep() {
    let max_idle = Duration::from_millis(200);
    let factory = DummySpawnerFactory::new();
    let pool = Pool::builder()
        .with_config(PoolConfig::testing().with_max_idle_time(max_idle))
        .with_spawner_factory(factory)
        .without_garbage_collector()
        .build()
        .unwrap();

    let options = app("sweep").with_min_processes(0);
    pool.get(options.clone(), WAIT).unwrap().close();
    let report = pool.garbage_collect();
    assert!(report.is_empty());
    assert!(report.next_sweep_in.is_some());

    thread::sleep(max_idle + Duration::from_millis(50));
    let report = pool.garbage_collect();
    assert_eq!(report.detached_processes, 1);
    assert_eq!(report.destroyed_super_groups, vec!["sweep".to_string()]);
    assert_eq!(pool.process_count(), 0);

    assert!(wait_until(WAIT, || pool
        .inspect()
        .super_group("sweep")
        .map(|sg| sg.state == app_pool::SuperGroupState::Destroyed)
        .unwrap_or(false)));
    let report = pool.garbage_collect();
    assert_eq!(report.forgotten_super_groups, vec!["sweep".to_string()]);
    assert_eq!(pool.super_group_count(), 0);
    assert_eq!(pool.shutdown(WAIT), app_pool::ShutdownResult::Success);
}

#[test]
#[serial]
fn test_inspection_serializes_to_json() {
    let harness = Harness::new(6);
    let session = harness.get(&app("inspect"));

    let json: serde_json::Value =
        serde_json::from_str(&harness.pool.to_json().unwrap()).unwrap();
    assert_eq!(json["super_groups"][0]["name"], "inspect");
    assert_eq!(json["super_groups"][0]["state"], "ready");
    let group = &json["super_groups"][0]["groups"][0];
    assert_eq!(group["super_group"], "inspect");
    assert_eq!(group["processes"][0]["sessions"], 1);
    assert!(group["processes"][0]["uptime"].is_u64());

    session.close();
    harness.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_checkout() {
    let harness = Harness::new(6);
    let session = harness.pool.checkout(app("async")).await.unwrap();
    assert!(harness.controller.worker(session.pid()).is_some());
    session.close();

    let concurrent = futures::future::join_all(
        (0..4).map(|_| harness.pool.checkout(app("async").with_forced_concurrency(2))),
    )
    .await;
    let sessions: Vec<_> = concurrent.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(sessions.len(), 4);
    drop(sessions);

    tokio::task::block_in_place(|| harness.shutdown());
}
