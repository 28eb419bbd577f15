/*!
 * Random operation sequences against a self-checking pool
 *
 * Every commit runs the invariant checks; on top of that the test checks
 * from the outside that each request is answered exactly once and that the
 * pool can always drain and shut down.
 */

use crate::support::{app, Harness};
use app_pool::{EnabledStatus, GetResult, Options, ProcessId, RestartMethod, Session};
use proptest::prelude::*;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

const APPS: [&str; 3] = ["alpha", "beta", "gamma"];

#[derive(Debug, Clone)]
enum Op {
    Get(usize),
    Close(usize),
    Disable(usize),
    Enable(usize),
    Detach(usize),
    Restart(usize, bool),
    Destroy(usize, bool),
    SetMax(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..APPS.len()).prop_map(Op::Get),
        3 => any::<usize>().prop_map(Op::Close),
        1 => any::<usize>().prop_map(Op::Disable),
        1 => any::<usize>().prop_map(Op::Enable),
        1 => any::<usize>().prop_map(Op::Detach),
        1 => (0..APPS.len(), any::<bool>()).prop_map(|(i, rolling)| Op::Restart(i, rolling)),
        1 => (0..APPS.len(), any::<bool>()).prop_map(|(i, reinit)| Op::Destroy(i, reinit)),
        1 => (1..5usize).prop_map(Op::SetMax),
    ]
}

fn options(index: usize) -> Options {
    app(APPS[index]).with_min_processes(index % 2)
}

struct Driver {
    harness: Harness,
    results: Receiver<GetResult<Session>>,
    sender: mpsc::Sender<GetResult<Session>>,
    sessions: Vec<Session>,
    issued: usize,
    answered: usize,
}

impl Driver {
    fn new() -> Self {
        let (sender, results) = mpsc::channel();
        Self {
            harness: Harness::new(3),
            results,
            sender,
            sessions: Vec::new(),
            issued: 0,
            answered: 0,
        }
    }

    fn collect(&mut self) {
        while let Ok(result) = self.results.try_recv() {
            self.answered += 1;
            if let Ok(session) = result {
                self.sessions.push(session);
            }
        }
    }

    fn pick(&self, index: usize) -> Option<ProcessId> {
        if self.sessions.is_empty() {
            return None;
        }
        Some(self.sessions[index % self.sessions.len()].process_id())
    }

    fn apply(&mut self, op: &Op) {
        self.collect();
        let pool = &self.harness.pool;
        match *op {
            Op::Get(index) => {
                self.issued += 1;
                self.harness.async_get_into(&options(index), self.sender.clone());
            }
            Op::Close(index) => {
                if !self.sessions.is_empty() {
                    let at = index % self.sessions.len();
                    self.sessions.swap_remove(at).close();
                }
            }
            Op::Disable(index) => {
                if let Some(process) = self.pick(index) {
                    pool.disable_process(process, |_, _| {});
                }
            }
            Op::Enable(index) => {
                if let Some(process) = self.pick(index) {
                    pool.enable_process(process);
                }
            }
            Op::Detach(index) => {
                if let Some(process) = self.pick(index) {
                    pool.detach_process(process);
                }
            }
            Op::Restart(index, rolling) => {
                let method = if rolling {
                    RestartMethod::Rolling
                } else {
                    RestartMethod::Blocking
                };
                pool.restart_group_by_name(APPS[index], method);
            }
            Op::Destroy(index, reinit) => {
                pool.destroy_super_group(APPS[index], reinit, None);
            }
            Op::SetMax(max) => pool.set_max(max),
        }
        pool.verify_invariants();
    }

    /// Put everything back into rotation and close sessions until every
    /// request got its answer
    fn drain(&mut self, timeout: Duration) -> bool {
        let pool = &self.harness.pool;
        for super_group in pool.inspect().super_groups {
            for group in super_group.groups {
                for process in group.processes {
                    if matches!(
                        process.enabled,
                        EnabledStatus::Disabling | EnabledStatus::Disabled
                    ) {
                        pool.enable_process(process.id);
                    }
                }
            }
        }
        pool.set_max(6);

        let deadline = Instant::now() + timeout;
        loop {
            self.collect();
            for session in self.sessions.drain(..) {
                session.close();
            }
            if self.answered == self.issued {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_random_operations_keep_pool_consistent(ops in prop::collection::vec(op(), 1..40)) {
        let mut driver = Driver::new();
        for op in &ops {
            driver.apply(op);
        }

        let drained = driver.drain(Duration::from_secs(10));
        prop_assert!(
            drained,
            "{} of {} requests answered, pool: {:#?}",
            driver.answered,
            driver.issued,
            driver.harness.pool.inspect()
        );
        driver.harness.pool.verify_invariants();

        // no callback runs twice
        std::thread::sleep(Duration::from_millis(20));
        driver.collect();
        prop_assert_eq!(driver.answered, driver.issued);

        let Driver { harness, .. } = driver;
        harness.shutdown();
    }
}
