use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Result;

/// A stack behind a single mutex, for comparison with the lock-free stacks.
#[derive(Debug, Default)]
pub struct LockedStack<T> {
    items: Mutex<Vec<T>>,
}

impl<T> LockedStack<T> {
    pub fn new() -> Self {
        LockedStack {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, val: T) -> Result<()> {
        self.lock().push(val);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave a Vec half-updated.
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A queue behind a single mutex.
#[derive(Debug, Default)]
pub struct LockedQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> LockedQueue<T> {
    pub fn new() -> Self {
        LockedQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, val: T) -> Result<()> {
        self.lock().push_back(val);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
