// cmd_queue.rs -- bounded hand-off of movement commands to the simulation thread
//
// Network threads parse user commands and enqueue them; the simulation
// thread drains the queue once per tick and runs them in arrival order.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use q2core_common::q_shared::UserCmd;

/// One movement command for one client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedMove {
    /// client slot, not edict number
    pub client: usize,
    pub cmd: UserCmd,
}

impl QueuedMove {
    pub fn new(client: usize, cmd: UserCmd) -> Self {
        Self { client, cmd }
    }
}

/// Commands received but not yet simulated.
///
/// Backed by a bounded crossbeam channel; producers never block.
pub struct MoveCommandQueue {
    sender: Sender<QueuedMove>,
    receiver: Receiver<QueuedMove>,
}

impl MoveCommandQueue {
    /// `capacity` is clamped to `1..=MAX_MOVE_QUEUE_CAPACITY`. When full, new
    /// commands are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.clamp(1, MAX_MOVE_QUEUE_CAPACITY));
        Self { sender, receiver }
    }

    /// Producer handle for a network thread.
    pub fn sender(&self) -> MoveQueueSender {
        MoveQueueSender {
            sender: self.sender.clone(),
        }
    }

    pub fn try_recv(&self) -> Option<QueuedMove> {
        self.receiver.try_recv().ok()
    }

    /// Everything queued right now, oldest first. Commands sent while
    /// draining may or may not be included.
    pub fn drain(&self) -> Vec<QueuedMove> {
        self.receiver.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for MoveCommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MOVE_QUEUE_CAPACITY)
    }
}

#[derive(Clone)]
pub struct MoveQueueSender {
    sender: Sender<QueuedMove>,
}

impl MoveQueueSender {
    /// Returns `false` if the command was dropped.
    pub fn try_send(&self, mv: QueuedMove) -> bool {
        match self.sender.try_send(mv) {
            Ok(()) => true,
            Err(TrySendError::Full(mv)) => {
                log::debug!("move queue full, dropping command for client {}", mv.client);
                false
            }
            // simulation side has shut down
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Enough for a full server sending several commands per tick.
pub const DEFAULT_MOVE_QUEUE_CAPACITY: usize = 1024;

pub const MAX_MOVE_QUEUE_CAPACITY: usize = 8192;
