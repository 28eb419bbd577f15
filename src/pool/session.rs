/*!
 * Session
 *
 * A lease on one process. The session never owns the process: it keeps a
 * weak handle to the pool plus the ids needed to find the process again,
 * which stays reachable in its group's detached list until it has exited.
 */

use super::state::Shared;
use crate::core::types::{GroupId, Pid, ProcessId};
use std::fmt;
use std::sync::Weak;

pub struct Session {
    pool: Weak<Shared>,
    group: GroupId,
    process: ProcessId,
    pid: Pid,
    sticky_session_id: u32,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        pool: Weak<Shared>,
        group: GroupId,
        process: ProcessId,
        pid: Pid,
        sticky_session_id: u32,
    ) -> Self {
        Self {
            pool,
            group,
            process,
            pid,
            sticky_session_id,
            closed: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    pub fn group_id(&self) -> GroupId {
        self.group
    }

    /// Sticky id of the process; clients send it back to come back here
    pub fn sticky_session_id(&self) -> u32 {
        self.sticky_session_id
    }

    /// Finish the request normally
    pub fn close(mut self) {
        self.finish(true);
    }

    /// The request could not even be sent to the process; the process is
    /// detached so no further requests are routed to it
    pub fn initiate_failed(mut self) {
        self.finish(false);
    }

    /// Ask for out-of-band work on this process once its sessions drain
    pub fn request_oobw(&self) -> bool {
        match self.pool.upgrade() {
            Some(shared) => {
                shared.with_state(|state, _| state.request_oobw(self.group, self.process))
            }
            None => false,
        }
    }

    fn finish(&mut self, success: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(shared) = self.pool.upgrade() {
            let (group, process) = (self.group, self.process);
            shared.with_state(|state, actions| {
                state.close_session(group, process, success, actions)
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("group", &self.group)
            .field("process", &self.process)
            .field("pid", &self.pid)
            .field("sticky_session_id", &self.sticky_session_id)
            .finish()
    }
}
