//! Cross-thread steering of a running worker.
//!
//! The controller pushes commands into a worker's queue and then wakes its
//! event loop. Wakeups coalesce; one wakeup may drain any number of
//! commands. The stop decision travels only through this queue, never
//! through direct flag mutation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A directive for a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Finish in-flight requests, then exit. If connections are still alive
    /// after `timeout`, their sockets are closed forcibly.
    Stop { timeout: Duration },
    /// Change the number of active connections.
    SetConnections(usize),
}

/// Thread-safe FIFO of commands, paired with the worker's waker.
#[derive(Default)]
pub struct CommandQueue {
    commands: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue::default()
    }

    pub fn push(&self, cmd: Command) {
        self.commands
            .lock()
            .expect("command queue poisoned")
            .push_back(cmd);
    }

    pub fn pop(&self) -> Option<Command> {
        self.commands
            .lock()
            .expect("command queue poisoned")
            .pop_front()
    }
}
