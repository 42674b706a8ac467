#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-lock** – Named advisory locks for the herd controller.
//!
//! Locks are advisory and keyed by arbitrary strings (`group/g1`,
//! `server/<uuid>`, `shard/7`). A holder is a procedure UUID. Acquisition is
//! all-or-nothing: either every requested key is taken or none is, and a
//! partially-acquired state is never observable from outside. Waiters queue
//! per key in FIFO order, and keys are always walked in lexicographic order
//! so that two multi-key acquisitions can never deadlock each other.
//!
//! The executor holds a procedure's locks from before its first job until
//! the procedure reaches a terminal state; two procedures with disjoint lock
//! sets run in parallel, two with overlapping sets serialize.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::trace;
use uuid::Uuid;

use herd_types::LockSet;

//─────────────────────────────
//  Internal queue state
//─────────────────────────────

struct Waiter {
    holder: Uuid,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct KeyQueue {
    holder: Option<Uuid>,
    waiters: VecDeque<Waiter>,
}

impl KeyQueue {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

//─────────────────────────────
//  Lock manager
//─────────────────────────────

/// Fairly-queued advisory locks over string keys.
///
/// Cloning is cheap; all clones share the same lock table.
#[derive(Clone)]
pub struct LockManager {
    keys: Arc<Mutex<HashMap<String, KeyQueue>>>,
    released: Arc<Notify>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(Notify::new()),
        }
    }

    /// Block until every key in `keys` is held by `holder`.
    ///
    /// Keys already held by `holder` are treated as acquired. Waiting is
    /// FIFO per key; keys are taken in lexicographic order, which `LockSet`
    /// guarantees by construction.
    pub async fn acquire(&self, holder: Uuid, keys: &LockSet) {
        for key in keys {
            self.acquire_one(holder, key).await;
        }
        trace!(%holder, count = keys.len(), "acquired lock set");
    }

    async fn acquire_one(&self, holder: Uuid, key: &str) {
        let notify = loop {
            let mut table = self.keys.lock().await;
            let queue = table.entry(key.to_string()).or_default();
            match queue.holder {
                None if queue.waiters.is_empty() => {
                    queue.holder = Some(holder);
                    return;
                }
                Some(h) if h == holder => return,
                _ => {
                    // Queue up; a releasing holder wakes the queue head.
                    let notify = Arc::new(Notify::new());
                    queue.waiters.push_back(Waiter {
                        holder,
                        notify: notify.clone(),
                    });
                    break notify;
                }
            }
        };

        loop {
            notify.notified().await;
            let mut table = self.keys.lock().await;
            let queue = table.entry(key.to_string()).or_default();
            let at_head = queue.waiters.front().map(|w| w.holder) == Some(holder);
            if queue.holder.is_none() && at_head {
                queue.waiters.pop_front();
                queue.holder = Some(holder);
                return;
            }
        }
    }

    /// Take every key in `keys` for `holder`, or none of them.
    ///
    /// Fails when any key is held by another holder *or* has waiters queued;
    /// refusing to jump a non-empty queue keeps the FIFO promise for blocked
    /// acquirers.
    pub async fn try_acquire(&self, holder: Uuid, keys: &LockSet) -> bool {
        let mut table = self.keys.lock().await;
        let free = keys.iter().all(|key| match table.get(key) {
            None => true,
            Some(queue) => {
                (queue.holder.is_none() || queue.holder == Some(holder))
                    && queue.waiters.is_empty()
            }
        });
        if !free {
            return false;
        }
        for key in keys {
            table.entry(key.clone()).or_default().holder = Some(holder);
        }
        trace!(%holder, count = keys.len(), "try-acquired lock set");
        true
    }

    /// Release every key held by `holder` and wake the head of each queue.
    pub async fn release(&self, holder: Uuid) {
        let mut table = self.keys.lock().await;
        let mut released = 0usize;
        table.retain(|_, queue| {
            if queue.holder == Some(holder) {
                queue.holder = None;
                released += 1;
                if let Some(next) = queue.waiters.front() {
                    next.notify.notify_one();
                }
            }
            !queue.is_idle()
        });
        drop(table);
        if released > 0 {
            trace!(%holder, released, "released lock set");
            self.released.notify_waiters();
        }
    }

    /// A signal fired whenever any holder releases its locks.
    ///
    /// The executor's scheduler parks on this when every queued procedure is
    /// blocked on its lock set.
    pub fn release_signal(&self) -> Arc<Notify> {
        self.released.clone()
    }

    /// Keys currently held by `holder`, mainly for assertions in tests.
    pub async fn held_by(&self, holder: Uuid) -> LockSet {
        let table = self.keys.lock().await;
        table
            .iter()
            .filter(|(_, queue)| queue.holder == Some(holder))
            .map(|(key, _)| key.clone())
            .collect()
    }
}
