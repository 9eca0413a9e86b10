//! Serialized execution queue
//! Any thread may post work; the owner of the queue runs it in FIFO order on
//! its own thread each time it drains.

use log::debug;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::core::bluetooth::types::PeripheralId;

/// Work item executed against the queue owner's context `C`
pub type Action<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Context able to tell whether a peripheral is still registered
pub trait PeripheralLookup {
    fn is_peripheral_known(&self, id: &PeripheralId) -> bool;
}

/// Sending side of the queue, cheap to clone and usable from any thread
pub struct QueueHandle<C> {
    tx: mpsc::UnboundedSender<Action<C>>,
}

impl<C> Clone for QueueHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: 'static> QueueHandle<C> {
    /// Enqueues `action` without blocking.
    ///
    /// Returns false when the owning queue is gone, the action is then dropped.
    pub fn post(&self, action: impl FnOnce(&mut C) + Send + 'static) -> bool {
        self.tx.send(Box::new(action)).is_ok()
    }
}

impl<C: PeripheralLookup + 'static> QueueHandle<C> {
    /// Enqueues `action`, to be run only if `id` is still registered when it is dequeued
    pub fn post_if_peripheral_known(
        &self,
        id: PeripheralId,
        action: impl FnOnce(&mut C) + Send + 'static,
    ) -> bool {
        self.post(move |ctx: &mut C| {
            if ctx.is_peripheral_known(&id) {
                action(ctx);
            } else {
                debug!("[BLE] Dropping action for forgotten peripheral {}", id);
            }
        })
    }
}

/// Receiving side of the queue, owned by the designated thread
pub struct ExecutionQueue<C> {
    tx: mpsc::UnboundedSender<Action<C>>,
    rx: mpsc::UnboundedReceiver<Action<C>>,
}

impl<C> Default for ExecutionQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ExecutionQueue<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> QueueHandle<C> {
        QueueHandle {
            tx: self.tx.clone(),
        }
    }

    /// Pops the oldest queued action, if any
    pub fn try_next(&mut self) -> Option<Action<C>> {
        match self.rx.try_recv() {
            Ok(action) => Some(action),
            // The queue keeps its own sender alive, so it never disconnects
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Runs every queued action against `ctx`, including those posted while draining
    pub fn drain(&mut self, ctx: &mut C) -> usize {
        let mut count = 0;
        while let Some(action) = self.try_next() {
            action(ctx);
            count += 1;
        }
        count
    }
}
