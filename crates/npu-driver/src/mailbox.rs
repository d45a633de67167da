// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded request and response rings.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Mailbox transport operations
pub trait Mailbox<T>: Send + Sync {
    /// Append `item`, handing it back if the mailbox is full
    ///
    /// # Errors
    ///
    /// Returns the rejected item when no slot is free.
    fn try_push(&self, item: T) -> std::result::Result<(), T>;

    /// Remove the oldest item
    fn try_pop(&self) -> Option<T>;

    /// Whether no item is queued
    fn is_empty(&self) -> bool;

    /// Register the "work available" notification
    fn set_notifier(&self, doorbell: Arc<Doorbell>);
}

/// Wake-up signal between producers and a polling consumer
#[derive(Debug, Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    /// Unrung doorbell
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the consumer
    pub fn ring(&self) {
        *self.rung.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    /// Wait until rung or `timeout` passes; returns whether it was rung
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut rung, _) = self
            .cond
            .wait_timeout_while(rung, timeout, |rung| !*rung)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *rung, false)
    }
}

struct RingState<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

/// Fixed-capacity single-producer/single-consumer ring
pub struct Ring<T> {
    name: &'static str,
    state: Mutex<RingState<T>>,
    notifier: Mutex<Option<Arc<Doorbell>>>,
}

impl<T> Ring<T> {
    /// Ring holding up to `capacity` items (at least one)
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            state: Mutex::new(RingState {
                slots: std::iter::repeat_with(|| None).take(capacity).collect(),
                head: 0,
                tail: 0,
                len: 0,
            }),
            notifier: Mutex::new(None),
        }
    }

    /// Ring name used in logs and errors
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Queued items
    pub fn len(&self) -> usize {
        self.lock().len
    }

    fn lock(&self) -> MutexGuard<'_, RingState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let notifier = self.notifier.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(doorbell) = notifier {
            doorbell.ring();
        }
    }
}

impl<T: Send> Mailbox<T> for Ring<T> {
    fn try_push(&self, item: T) -> std::result::Result<(), T> {
        {
            let mut state = self.lock();
            let capacity = state.slots.len();
            if state.len == capacity {
                return Err(item);
            }
            let tail = state.tail;
            state.slots[tail] = Some(item);
            state.tail = (tail + 1) % capacity;
            state.len += 1;
        }
        self.notify();
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.len == 0 {
            return None;
        }
        let head = state.head;
        let item = state.slots[head].take();
        state.head = (head + 1) % state.slots.len();
        state.len -= 1;
        item
    }

    fn is_empty(&self) -> bool {
        self.lock().len == 0
    }

    fn set_notifier(&self, doorbell: Arc<Doorbell>) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(doorbell);
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("len", &state.len)
            .field("capacity", &state.slots.len())
            .finish()
    }
}
