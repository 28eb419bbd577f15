/*!
 * Shared helpers for pool tests
 */

#![allow(dead_code)]

use app_pool::{
    DummyController, DummySpawnerFactory, GetResult, GroupSnapshot, Options, Pool, PoolConfig,
    Session, SuperGroupSnapshot,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub pool: Pool,
    pub controller: Arc<DummyController>,
}

impl Harness {
    /// Self-checking pool without garbage collection
    pub fn new(max_pool_size: usize) -> Self {
        Self::with_config(PoolConfig::testing().with_max_pool_size(max_pool_size))
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let factory = DummySpawnerFactory::new();
        let controller = factory.controller();
        let pool = Pool::builder()
            .with_config(config)
            .with_spawner_factory(factory)
            .build()
            .expect("pool builds");
        Self { pool, controller }
    }

    pub fn get(&self, options: &Options) -> Session {
        self.pool
            .get(options.clone(), WAIT)
            .expect("get returns a session")
    }

    /// Issue a get whose result lands on the returned receiver
    pub fn async_get(&self, options: &Options) -> Receiver<GetResult<Session>> {
        let (tx, rx) = mpsc::channel();
        self.async_get_into(options, tx);
        rx
    }

    pub fn async_get_into(&self, options: &Options, tx: Sender<GetResult<Session>>) {
        self.pool.async_get(options.clone(), move |result| {
            let _ = tx.send(result);
        });
    }

    pub fn super_group(&self, name: &str) -> Option<SuperGroupSnapshot> {
        self.pool.inspect().super_group(name).cloned()
    }

    pub fn default_group(&self, name: &str) -> Option<GroupSnapshot> {
        self.super_group(name)?.default_group().cloned()
    }

    pub fn wait_for_default_group<F>(&self, name: &str, condition: F) -> GroupSnapshot
    where
        F: Fn(&GroupSnapshot) -> bool,
    {
        let mut last = None;
        let reached = wait_until(WAIT, || {
            last = self.default_group(name);
            last.as_ref().map(&condition).unwrap_or(false)
        });
        assert!(reached, "default group of {name} never matched, last seen: {last:#?}");
        last.expect("snapshot present")
    }

    pub fn shutdown(self) {
        assert_eq!(
            self.pool.shutdown(WAIT),
            app_pool::ShutdownResult::Success,
            "pool shuts down cleanly"
        );
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn receive(rx: &Receiver<GetResult<Session>>) -> GetResult<Session> {
    rx.recv_timeout(WAIT).expect("get callback ran")
}

pub fn app(name: &str) -> Options {
    Options::new(format!("/srv/{name}")).with_app_group_name(name)
}
