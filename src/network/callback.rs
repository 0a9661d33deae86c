//! Request/response correlation by tag
//!
//! Each waiter is a oneshot sender. A waiter always gets exactly one value:
//! the response, or `None` when no response will ever arrive.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::protocol::Message;

/// Receives the response, or `None` if none will come
pub type CallbackSender = oneshot::Sender<Option<Message>>;

#[derive(Default)]
pub struct CallbackTable {
    waiters: Mutex<HashMap<u32, CallbackSender>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, CallbackSender>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `tx` under `tag`. A previous waiter on the same tag is
    /// released with `None` first.
    pub fn register(&self, tag: u32, tx: CallbackSender) {
        let mut waiters = self.lock();
        if let Some(old) = waiters.remove(&tag) {
            tracing::debug!("Callback tag {} replaced, releasing previous waiter", tag);
            let _ = old.send(None);
        }
        waiters.insert(tag, tx);
    }

    /// Hand `msg` to the waiter registered under its tag. Returns whether a
    /// waiter existed.
    pub fn complete(&self, msg: &Message) -> bool {
        let tag = msg.tag();
        let waiter = self.lock().remove(&tag);
        match waiter {
            Some(tx) => {
                if tx.send(Some(msg.clone())).is_err() {
                    tracing::debug!("Callback receiver for tag {} already dropped", tag);
                }
                true
            }
            None => false,
        }
    }

    /// Remove the waiter for `tag` without completing it
    pub fn take(&self, tag: u32) -> Option<CallbackSender> {
        self.lock().remove(&tag)
    }

    /// Release every waiter with `None`. Returns how many were released.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(None);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
