/*!
 * Waiters
 *
 * Queued get requests and disable commands. A waiter is resolved exactly
 * once, always through the post-lock action list.
 */

use super::options::Options;
use super::session::Session;
use crate::core::actions::PostLockActions;
use crate::core::errors::{GetError, GetResult};
use crate::core::types::{DisableResult, ProcessId, ShutdownResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives the session (or the failure) for one get request
pub type GetCallback = Box<dyn FnOnce(GetResult<Session>) + Send + 'static>;

/// Receives the final outcome of a deferred disable
pub type DisableCallback = Box<dyn FnOnce(ProcessId, DisableResult) + Send + 'static>;

/// Receives the outcome of a destroy or shutdown
pub type ShutdownCallback = Box<dyn FnOnce(ShutdownResult) + Send + 'static>;

pub(crate) struct GetWaiter {
    pub(crate) options: Options,
    callback: GetCallback,
}

impl GetWaiter {
    pub(crate) fn new(options: Options, callback: GetCallback) -> Self {
        Self { options, callback }
    }

    pub(crate) fn into_parts(self) -> (Options, GetCallback) {
        (self.options, self.callback)
    }

    pub(crate) fn succeed(self, session: Session, actions: &mut PostLockActions) {
        succeed(self.callback, session, actions);
    }

    pub(crate) fn fail(self, error: GetError, actions: &mut PostLockActions) {
        fail(self.callback, error, actions);
    }
}

impl fmt::Debug for GetWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetWaiter")
            .field("app_group_name", &self.options.app_group_name())
            .field("sticky_session_id", &self.options.sticky_session_id)
            .finish()
    }
}

pub(crate) fn succeed(callback: GetCallback, session: Session, actions: &mut PostLockActions) {
    actions.push(move || callback(Ok(session)));
}

pub(crate) fn fail(callback: GetCallback, error: GetError, actions: &mut PostLockActions) {
    actions.push(move || callback(Err(error)));
}

pub(crate) struct DisableWaiter {
    pub(crate) process: ProcessId,
    callback: DisableCallback,
}

impl DisableWaiter {
    pub(crate) fn new(process: ProcessId, callback: DisableCallback) -> Self {
        Self { process, callback }
    }

    pub(crate) fn resolve(self, result: DisableResult, actions: &mut PostLockActions) {
        let DisableWaiter { process, callback } = self;
        actions.push(move || callback(process, result));
    }
}

impl fmt::Debug for DisableWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisableWaiter")
            .field("process", &self.process)
            .finish()
    }
}

/// One-shot rendezvous used by the blocking wrappers
pub(crate) struct Ticket<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Ticket<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.ready.notify_all();
    }

    /// Wait for the value; `None` on timeout
    pub(crate) fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}
