/*!
 * Restart, destroy and shutdown of applications and of the pool
 */

use crate::support::{app, receive, wait_until, Harness, WAIT};
use app_pool::{
    DisableResult, GetError, PoolLifeStatus, RestartMethod, ShutdownResult, SpawnError,
    SuperGroupState,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_rolling_restart_swaps_group_and_drains_old_one() {
    let harness = Harness::new(6);
    let options = app("api");
    let session = harness.get(&options);
    let old = harness.wait_for_default_group("api", |g| !g.spawning);

    assert!(harness.pool.restart_group_by_name("api", RestartMethod::Rolling));
    assert!(wait_until(WAIT, || harness
        .super_group("api")
        .map(|sg| sg.state == SuperGroupState::Ready && sg.default_group != Some(old.id))
        .unwrap_or(false)));

    let snapshot = harness.super_group("api").unwrap();
    assert_eq!(snapshot.groups.len(), 1);
    assert_eq!(snapshot.detached_groups.len(), 1, "old group drains its session");
    assert_eq!(snapshot.detached_groups[0].detached_count, 1);

    let new = harness.wait_for_default_group("api", |g| g.enabled_count == 1);
    let fresh = harness.get(&options);
    assert_eq!(fresh.group_id(), new.id);
    assert_ne!(fresh.pid(), session.pid());

    session.close();
    assert!(wait_until(WAIT, || harness
        .super_group("api")
        .map(|sg| sg.detached_groups.is_empty())
        .unwrap_or(false)));
    let old_worker = harness.controller.workers()[0].clone();
    assert!(old_worker.shutdown_triggered());
    harness.pool.verify_invariants();

    fresh.close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_restart_while_restarting_is_coalesced() {
    let harness = Harness::new(6);
    let options = app("api");
    harness.get(&options).close();
    let before = harness.super_group("api").unwrap().generation;

    harness.controller.pause_creates();
    assert!(harness.pool.restart_group_by_name("api", RestartMethod::Rolling));
    assert!(harness.pool.restart_group_by_name("api", RestartMethod::Rolling));
    let restarting = harness.super_group("api").unwrap();
    assert_eq!(restarting.state, SuperGroupState::Restarting);
    assert_eq!(restarting.generation, before + 1);

    // requests keep flowing to the current group meanwhile
    harness.get(&options).close();

    harness.controller.resume_creates();
    assert!(wait_until(WAIT, || harness.super_group("api").unwrap().state
        == SuperGroupState::Ready));
    assert_eq!(harness.controller.create_count(), 2);
    harness.shutdown();
}

#[test]
#[serial]
fn test_failed_rolling_restart_keeps_current_group() {
    let harness = Harness::new(6);
    let options = app("api");
    harness.get(&options).close();
    let before = harness.super_group("api").unwrap();

    harness.controller.fail_next_creates(1);
    assert!(harness.pool.restart_group_by_name("api", RestartMethod::Rolling));
    assert!(wait_until(WAIT, || harness.super_group("api").unwrap().state
        == SuperGroupState::Ready));

    let after = harness.super_group("api").unwrap();
    assert_eq!(after.default_group, before.default_group);
    assert!(after.generation > before.generation);
    harness.get(&options).close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_blocking_restart_respawns_in_place() {
    let harness = Harness::new(6);
    let options = app("api");
    let session = harness.get(&options);
    let before = harness.wait_for_default_group("api", |g| !g.spawning);

    assert!(harness.pool.restart_group_by_name("api", RestartMethod::Blocking));
    let after = harness.wait_for_default_group("api", |g| !g.restarting && g.enabled_count == 1);
    assert_eq!(after.id, before.id);
    assert_eq!(after.restarts_initiated, 1);
    assert_ne!(after.uuid, before.uuid);
    assert_eq!(after.detached_count, 1);
    assert_ne!(after.processes[0].pid, session.pid());

    session.close();
    harness.wait_for_default_group("api", |g| g.detached_count == 0);
    assert_eq!(harness.controller.create_count(), 2);
    harness.pool.verify_invariants();
    harness.shutdown();
}

#[test]
#[serial]
fn test_restart_refused_for_unknown_or_initializing_app() {
    let harness = Harness::new(6);
    assert!(!harness.pool.restart_group_by_name("ghost", RestartMethod::Rolling));

    harness.controller.pause_creates();
    let rx = harness.async_get(&app("slow"));
    assert!(!harness.pool.restart_group_by_name("slow", RestartMethod::Rolling));
    assert!(!harness.pool.restart_group_by_name("slow", RestartMethod::Blocking));

    harness.controller.resume_creates();
    receive(&rx).expect("initialization completes").close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_initialization_failure_fails_waiters_and_allows_retry() {
    let harness = Harness::new(6);
    let options = app("broken");
    harness.controller.fail_next_creates(1);

    let result = harness.pool.get(options.clone(), WAIT);
    assert!(matches!(
        result,
        Err(GetError::SpawnFailed(SpawnError::Internal(_)))
    ));
    assert_eq!(
        harness.super_group("broken").unwrap().state,
        SuperGroupState::Destroyed
    );
    assert_eq!(harness.pool.capacity_used(), 0, "the reservation is released");

    harness.get(&options).close();
    assert_eq!(harness.super_group("broken").unwrap().state, SuperGroupState::Ready);
    harness.shutdown();
}

#[test]
#[serial]
fn test_destroy_without_reinit_aborts_waiters() {
    let harness = Harness::new(6);
    harness.controller.pause_creates();
    let rx = harness.async_get(&app("gone"));

    let (tx, done) = mpsc::channel();
    assert!(harness.pool.destroy_super_group(
        "gone",
        false,
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    ));
    assert!(matches!(receive(&rx), Err(GetError::Aborted(_))));
    assert_eq!(done.recv_timeout(WAIT).unwrap(), ShutdownResult::Success);

    harness.controller.resume_creates();
    assert!(wait_until(WAIT, || harness.pool.active_background_threads() == 0));
    assert_eq!(harness.super_group("gone").unwrap().state, SuperGroupState::Destroyed);
    harness.shutdown();
}

#[test]
#[serial]
fn test_destroy_completes_after_sessions_drain() {
    let harness = Harness::new(6);
    let session = harness.get(&app("drain"));

    let (tx, done) = mpsc::channel();
    assert!(harness.pool.destroy_super_group(
        "drain",
        false,
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    ));
    assert_eq!(harness.super_group("drain").unwrap().state, SuperGroupState::Destroying);
    assert_eq!(harness.pool.process_count(), 0);
    assert!(done.recv_timeout(Duration::from_millis(50)).is_err());

    session.close();
    assert_eq!(done.recv_timeout(WAIT).unwrap(), ShutdownResult::Success);
    assert_eq!(harness.controller.running_workers(), 0);
    harness.shutdown();
}

#[test]
#[serial]
fn test_detach_super_group_by_name_forgets_it() {
    let harness = Harness::new(6);
    harness.get(&app("old")).close();
    assert_eq!(harness.pool.super_group_count(), 1);

    assert!(harness.pool.detach_super_group_by_name("old"));
    assert_eq!(harness.pool.super_group_count(), 0);
    assert!(!harness.pool.detach_super_group_by_name("old"));
    harness.shutdown();
}

#[test]
#[serial]
fn test_shutdown_rejects_new_requests_and_stops_threads() {
    let harness = Harness::new(6);
    harness.get(&app("a")).close();
    harness.get(&app("b")).close();

    assert_eq!(harness.pool.shutdown(WAIT), ShutdownResult::Success);
    assert_eq!(harness.pool.life_status(), PoolLifeStatus::ShutDown);
    assert_eq!(harness.pool.active_background_threads(), 0);
    assert_eq!(harness.pool.super_group_count(), 0);
    assert_eq!(harness.controller.running_workers(), 0);

    assert!(matches!(
        harness.pool.get(app("a"), WAIT),
        Err(GetError::PoolShuttingDown)
    ));
    assert_eq!(harness.pool.shutdown(WAIT), ShutdownResult::Success);
}

#[test]
#[serial]
fn test_shutdown_aborts_queued_requests() {
    let harness = Harness::new(6);
    harness.controller.pause();
    let rx = harness.async_get(&app("stuck"));
    harness.wait_for_default_group("stuck", |g| g.spawning);

    thread::scope(|scope| {
        let shutdown = scope.spawn(|| harness.pool.shutdown(WAIT));
        assert!(matches!(receive(&rx), Err(GetError::Aborted(_))));
        harness.controller.resume();
        assert_eq!(shutdown.join().unwrap(), ShutdownResult::Success);
    });
    assert_eq!(harness.controller.running_workers(), 0);
}

#[test]
#[serial]
fn test_rejected_replacement_reenables_disabling_process() {
    let harness = Harness::new(2);

    let idle = app("idle").with_min_processes(0).with_max_processes(1);
    let warmup = harness.get(&idle);
    let warm_process = warmup.process_id();
    warmup.close();
    assert!(harness.pool.detach_process(warm_process));
    assert!(wait_until(WAIT, || harness
        .default_group("idle")
        .map(|g| g.process_count() == 0 && g.detached_count == 0)
        .unwrap_or(false)));

    let blog = app("blog");
    let session = harness.get(&blog);
    let only = session.process_id();
    session.close();
    harness.wait_for_default_group("blog", |g| !g.spawning && g.enabled_count == 1);

    // disabling the only process starts a replacement that fills the pool
    harness.controller.pause();
    let (tx, disabled) = mpsc::channel();
    let result = harness.pool.disable_process(only, move |_, result| {
        let _ = tx.send(result);
    });
    assert_eq!(result, DisableResult::Deferred);
    harness.wait_for_default_group("blog", |g| g.spawning && g.disabling_count == 1);

    let starving = harness.async_get(&idle);
    harness.wait_for_default_group("idle", |g| g.get_waitlist == 1);

    // the replacement yields to "idle", so the disable cannot complete
    harness.controller.resume();
    assert_eq!(disabled.recv_timeout(WAIT).unwrap(), DisableResult::Error);
    let group = harness.wait_for_default_group("blog", |g| !g.spawning);
    assert_eq!(group.enabled_count, 1);
    assert_eq!(group.disabling_count, 0);
    assert_eq!(group.disable_waitlist, 0);

    let served = receive(&starving).expect("idle is served with the freed capacity");
    harness.pool.verify_invariants();
    served.close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_dropping_pool_answers_queued_requests() {
    let harness = Harness::new(6);
    let session = harness.get(&app("running"));
    let pid = session.pid();
    session.close();

    harness.controller.pause();
    let spawning = harness.async_get(&app("spawning"));
    harness.wait_for_default_group("spawning", |g| g.spawning && g.get_waitlist == 1);

    harness.controller.pause_creates();
    let initializing = harness.async_get(&app("initializing"));
    assert!(wait_until(WAIT, || harness
        .super_group("initializing")
        .map(|sg| sg.state == SuperGroupState::Initializing && sg.get_waitlist == 1)
        .unwrap_or(false)));

    let Harness { pool, controller } = harness;
    drop(pool);

    assert!(matches!(receive(&spawning), Err(GetError::PoolShuttingDown)));
    assert!(matches!(receive(&initializing), Err(GetError::PoolShuttingDown)));
    let worker = controller.worker(pid).expect("worker is known");
    assert!(worker.shutdown_triggered());

    controller.resume();
    controller.resume_creates();
}
