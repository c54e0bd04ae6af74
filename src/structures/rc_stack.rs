use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use super::backoff::Backoff;
use crate::error::Result;
use crate::memory::{try_counted_box, AtomicCountedPtr, CountedPtr};

/// A lock-free stack that reclaims nodes with split reference counts.
///
/// The top pointer carries an external count that every popping thread bumps before it
/// dereferences the node, and every node carries an internal count where threads give their
/// references back. The thread that brings the two to balance frees the node. No global
/// table is involved.
pub struct RefCountedStack<T: Send> {
    head: AtomicCountedPtr<Node<T>>,
}

#[repr(align(64))]
struct Node<T> {
    data: ManuallyDrop<T>,
    internal_count: AtomicIsize,
    next: CountedPtr<Node<T>>,
}

impl<T: Send> RefCountedStack<T> {
    pub fn new() -> Self {
        RefCountedStack {
            head: AtomicCountedPtr::new(CountedPtr::null()),
        }
    }

    /// Push a value onto the top of the stack.
    ///
    /// Fails only if the node cannot be allocated, in which case the stack is unchanged.
    pub fn push(&self, val: T) -> Result<()> {
        let node = match try_counted_box(Node::new(val)) {
            Ok(node) => Box::into_raw(node),
            Err((err, node)) => {
                drop(node.into_data());
                return Err(err);
            }
        };
        let new_head = CountedPtr::new(node, 1);
        let mut old_head = self.head.load(Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            unsafe {
                (*node).next = old_head;
            }
            match self.head.compare_exchange_weak(old_head, new_head, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => old_head = actual,
            }
            backoff.spin();
        }
    }

    /// Takes one external reference on the current top, or returns `None` without touching
    /// any count if the stack is empty.
    fn increase_head_count(&self, mut old_head: CountedPtr<Node<T>>) -> Option<CountedPtr<Node<T>>> {
        loop {
            if old_head.is_null() {
                return None;
            }
            let new_head = old_head.incremented();
            match self.head.compare_exchange(old_head, new_head, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Some(new_head),
                Err(actual) => old_head = actual,
            }
        }
    }

    /// Pop the top value, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            old_head = self.increase_head_count(old_head)?;
            let node = old_head.node;
            // The reference taken above keeps node alive until we hand it back.
            let next = unsafe { (*node).next };
            loop {
                match self.head.compare_exchange(old_head, next, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => {
                        let data = unsafe { ManuallyDrop::into_inner(ptr::read(&(*node).data)) };
                        // One reference belonged to the head, one to this thread.
                        let count_increase = old_head.external_count as isize - 2;
                        let previous = unsafe { (*node).internal_count.fetch_add(count_increase, Ordering::AcqRel) };
                        if previous == -count_increase {
                            unsafe { drop(Box::from_raw(node)) };
                        }
                        return Some(data);
                    }
                    // Only the count moved, and it still includes our reference.
                    Err(actual) if ptr::eq(actual.node, node) => old_head = actual,
                    Err(actual) => {
                        if unsafe { (*node).internal_count.fetch_sub(1, Ordering::AcqRel) } == 1 {
                            unsafe { drop(Box::from_raw(node)) };
                        }
                        old_head = actual;
                        break;
                    }
                }
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Send> Default for RefCountedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Drop for RefCountedStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T: Send> fmt::Debug for RefCountedStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RefCountedStack {{ head: {:?} }}", self.head)
    }
}

impl<T> Node<T> {
    fn new(val: T) -> Self {
        Node {
            data: ManuallyDrop::new(val),
            internal_count: AtomicIsize::new(0),
            next: CountedPtr::null(),
        }
    }

    fn into_data(self) -> T {
        ManuallyDrop::into_inner(self.data)
    }
}
