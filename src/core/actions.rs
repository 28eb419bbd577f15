/*!
 * Post-Lock Actions
 *
 * Everything that may run foreign code (user callbacks, worker handle calls,
 * dropping values that own sessions) is collected here while the pool lock is
 * held and executed in order once the guard has been dropped. Running an
 * action while the lock is held deadlocks as soon as the action touches the
 * pool again.
 */

use std::fmt;

type Action = Box<dyn FnOnce() + Send + 'static>;

/// Ordered list of deferred actions
#[derive(Default)]
#[must_use = "post-lock actions must be run after the pool lock is released"]
pub struct PostLockActions {
    actions: Vec<Action>,
}

impl PostLockActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Drop `value` after the lock is released instead of now
    pub fn release<T: Send + 'static>(&mut self, value: T) {
        self.push(move || drop(value));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run all actions in insertion order
    pub fn run(self) {
        for action in self.actions {
            action();
        }
    }
}

impl fmt::Debug for PostLockActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostLockActions")
            .field("pending", &self.actions.len())
            .finish()
    }
}
