/*!
 * End-to-end request flows through a live pool
 */

use crate::support::{app, receive, wait_until, Harness, WAIT};
use app_pool::{DisableResult, ShutdownResult, SuperGroupState};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::mpsc;

#[test]
#[serial]
fn test_first_request_waits_for_initialization_and_spawn() {
    let harness = Harness::new(6);
    let options = app("shop");
    harness.controller.pause();

    let rx = harness.async_get(&options);
    let group = harness.wait_for_default_group("shop", |g| g.spawning && g.get_waitlist == 1);
    assert_eq!(group.process_count(), 0);
    assert_eq!(harness.super_group("shop").unwrap().state, SuperGroupState::Ready);
    assert!(rx.try_recv().is_err(), "no session before the spawn finishes");

    harness.controller.resume();
    let session = receive(&rx).expect("session after the spawn");
    assert!(harness.controller.worker(session.pid()).is_some());

    let group = harness.default_group("shop").unwrap();
    assert_eq!(group.get_waitlist, 0);
    assert_eq!(group.processes[0].sessions, 1);
    harness.pool.verify_invariants();

    session.close();
    harness.shutdown();
}

#[test]
#[serial]
fn test_disabling_last_process_defers_until_replacement_and_drain() {
    let harness = Harness::new(6);
    let options = app("blog").with_forced_concurrency(2);
    let session = harness.get(&options);
    let disabled = session.process_id();
    harness.wait_for_default_group("blog", |g| !g.spawning && g.enabled_count == 1);

    let (tx, rx) = mpsc::channel();
    let result = harness
        .pool
        .disable_process(disabled, move |process, result| {
            let _ = tx.send((process, result));
        });
    assert_eq!(result, DisableResult::Deferred);

    // the replacement attaches, but the draining process still has a session
    let group = harness.wait_for_default_group("blog", |g| g.enabled_count == 1 && !g.spawning);
    assert_eq!(group.disabling_count, 1);
    assert!(rx.try_recv().is_err());

    session.close();
    let (process, result) = rx.recv_timeout(WAIT).expect("disable callback ran");
    assert_eq!(process, disabled);
    assert_eq!(result, DisableResult::Success);

    let group = harness.default_group("blog").unwrap();
    assert_eq!(group.disabled_count, 1);
    assert_eq!(group.disabling_count, 0);
    harness.pool.verify_invariants();
    harness.shutdown();
}

#[test]
#[serial]
fn test_destroy_during_initialization_reinitializes_for_waiters() {
    let harness = Harness::new(6);
    let options = app("wiki");
    harness.controller.pause_creates();

    let (tx, rx) = mpsc::channel();
    harness.async_get_into(&options, tx.clone());
    harness.async_get_into(&options, tx.clone());
    assert!(wait_until(WAIT, || harness
        .super_group("wiki")
        .map(|sg| sg.get_waitlist == 2)
        .unwrap_or(false)));

    let (destroyed_tx, destroyed_rx) = mpsc::channel();
    let existed = harness.pool.destroy_super_group(
        "wiki",
        true,
        Some(Box::new(move |result| {
            let _ = destroyed_tx.send(result);
        })),
    );
    assert!(existed);
    assert_eq!(
        destroyed_rx.recv_timeout(WAIT).expect("destroy callback ran"),
        ShutdownResult::Canceled,
        "reinitialization superseded the destroy"
    );
    let snapshot = harness.super_group("wiki").unwrap();
    assert_eq!(snapshot.state, SuperGroupState::Initializing);
    assert_eq!(snapshot.get_waitlist, 2);

    harness.async_get_into(&options, tx);
    harness.controller.resume_creates();

    let sessions: Vec<_> = (0..3)
        .map(|_| receive(&rx).expect("every waiter gets a session"))
        .collect();
    assert_eq!(harness.super_group("wiki").unwrap().state, SuperGroupState::Ready);
    harness.pool.verify_invariants();

    drop(sessions);
    harness.shutdown();
}

#[test]
#[serial]
fn test_spawned_process_yields_to_group_waiting_for_capacity() {
    let harness = Harness::new(2);

    // "idle" keeps a group around with no processes at all
    let idle = app("idle").with_min_processes(0).with_max_processes(1);
    let warmup = harness.get(&idle);
    let warm_process = warmup.process_id();
    warmup.close();
    assert!(harness.pool.detach_process(warm_process));
    assert!(wait_until(WAIT, || harness
        .default_group("idle")
        .map(|g| g.process_count() == 0 && g.detached_count == 0)
        .unwrap_or(false)));

    // "busy" fills the pool: one process with both slots taken, one spawn in flight
    let busy = app("busy").with_forced_concurrency(2).with_max_processes(2);
    let first = harness.get(&busy);
    harness.wait_for_default_group("busy", |g| !g.spawning && g.enabled_count == 1);
    harness.controller.pause();
    let second = harness.get(&busy);
    let queued = harness.async_get(&busy);
    harness.wait_for_default_group("busy", |g| g.spawning && g.get_waitlist == 1);
    assert!(harness.pool.at_full_capacity());

    let starving = harness.async_get(&idle);
    let group = harness.wait_for_default_group("idle", |g| g.get_waitlist == 1);
    assert_eq!(group.processes_being_spawned, 0, "no capacity to spawn with");

    harness.controller.resume();
    let served = receive(&starving).expect("the starving group is served");
    assert_eq!(Some(served.group_id()), harness.super_group("idle").unwrap().default_group);

    let busy_group = harness.default_group("busy").unwrap();
    assert_eq!(busy_group.enabled_count, 1, "the busy group's new process was rejected");
    assert_eq!(busy_group.get_waitlist, 1);
    harness.pool.verify_invariants();

    first.close();
    let late = receive(&queued).expect("queued request served by the existing process");
    assert_eq!(late.process_id(), second.process_id());

    drop((second, late, served));
    harness.shutdown();
}

#[test]
#[serial]
fn test_sticky_request_follows_disabling_process() {
    let harness = Harness::new(6);
    let options = app("chat").with_forced_concurrency(4).with_min_processes(2);
    let first = harness.get(&options);
    harness.wait_for_default_group("chat", |g| g.enabled_count == 2 && !g.spawning);

    let sticky = first.sticky_session_id();
    let pinned = options.clone().with_sticky_session_id(sticky);
    let second = harness.get(&pinned);
    assert_eq!(second.process_id(), first.process_id());

    let result = harness.pool.disable_process(first.process_id(), |_, _| {});
    assert_eq!(result, DisableResult::Deferred);

    let third = harness.get(&pinned);
    assert_eq!(third.process_id(), first.process_id(), "sticky beats busyness");

    let unpinned = harness.get(&options);
    assert_ne!(unpinned.process_id(), first.process_id());
    harness.pool.verify_invariants();

    drop((first, second, third, unpinned));
    harness.shutdown();
}
