use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use log::trace;

use super::backoff::Backoff;
use crate::error::Result;
use crate::memory::{try_box_or_return, HazardHandle, HazardPointerRegistry, ReclamationList};

/// A lock-free Treiber stack whose nodes are protected by hazard pointers.
///
/// A popping thread announces the top node in the registry before reading its `next`
/// pointer, and a node is only freed once no slot of the registry designates it. Nodes that
/// are still guarded when they are popped wait in a [`ReclamationList`] that is swept at the
/// end of every pop.
pub struct HazardStack<T: Send> {
    head: AtomicPtr<Node<T>>,
    registry: Arc<HazardPointerRegistry>,
    reclaim: ReclamationList<Node<T>>,
}

struct Node<T> {
    data: ManuallyDrop<T>,
    next: *mut Node<T>,
}

unsafe impl<T: Send> Send for HazardStack<T> {}
unsafe impl<T: Send> Sync for HazardStack<T> {}

impl<T: Send> HazardStack<T> {
    pub fn new(registry: Arc<HazardPointerRegistry>) -> Self {
        HazardStack {
            head: AtomicPtr::default(),
            registry,
            reclaim: ReclamationList::new(),
        }
    }

    /// Push a value onto the top of the stack.
    ///
    /// Fails only if the node cannot be allocated, in which case the stack is unchanged.
    pub fn push(&self, val: T) -> Result<()> {
        let node = match try_box_or_return(Node::new(val)) {
            Ok(node) => Box::into_raw(node),
            Err((err, node)) => {
                drop(node.into_data());
                return Err(err);
            }
        };
        let mut backoff = Backoff::new();
        loop {
            if self.try_push(node) {
                return Ok(());
            }
            backoff.spin();
        }
    }

    fn try_push(&self, node: *mut Node<T>) -> bool {
        let old_head = self.head.load(Ordering::Relaxed);
        unsafe {
            (*node).next = old_head;
        }
        self.head
            .compare_exchange_weak(old_head, node, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Pop the top value using the calling thread's hazard slot, claiming one on first use.
    ///
    /// Returns `Ok(None)` when the stack is empty and [`Error::ResourceExhausted`] when the
    /// thread has no slot and none is free.
    ///
    /// [`Error::ResourceExhausted`]: crate::Error::ResourceExhausted
    pub fn pop(&self) -> Result<Option<T>> {
        self.registry.with_local_handle(|hp| self.pop_with(hp))
    }

    /// Pop the top value, announcing hazards through `hp`.
    ///
    /// # Panics
    /// If `hp` was acquired from a different registry than the one this stack was built with.
    pub fn pop_with(&self, hp: &HazardHandle<'_>) -> Option<T> {
        assert!(
            ptr::eq(hp.registry(), &*self.registry),
            "hazard handle belongs to a different registry"
        );
        let mut backoff = Backoff::new();
        let node = loop {
            match self.try_pop(hp) {
                Ok(node) => break node,
                Err(()) => backoff.spin(),
            }
        };
        // Our own mark has to go before we look for other threads' marks.
        hp.clear();
        if node.is_null() {
            return None;
        }

        // Unlinking made this thread the only one allowed to touch `data`; others may
        // still read `next` until their marks are cleared.
        let data = unsafe { ManuallyDrop::into_inner(ptr::read(&(*node).data)) };
        if self.registry.is_guarded(node) {
            trace!("node {:?} is still guarded, deferring", node);
            unsafe { self.reclaim.add(node) };
        } else {
            unsafe { drop(Box::from_raw(node)) };
        }
        if self.reclaim.pending() > 0 {
            self.reclaim.reclaim_ready(&self.registry);
        }
        Some(data)
    }

    fn try_pop(&self, hp: &HazardHandle<'_>) -> std::result::Result<*mut Node<T>, ()> {
        let old_head = self.head.load(Ordering::Acquire);
        if old_head.is_null() {
            return Ok(old_head);
        }
        hp.mark(old_head);
        // The mark only protects old_head if it was still the top after being published.
        if !ptr::eq(old_head, self.head.load(Ordering::SeqCst)) {
            return Err(());
        }
        let new_head = unsafe { (*old_head).next };
        // SeqCst so the unlink is ordered before the popper's later scan of the marks.
        self.head
            .compare_exchange(old_head, new_head, Ordering::SeqCst, Ordering::Relaxed)
            .map_err(|_| ())
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Number of popped nodes whose memory is still waiting on a hazard pointer.
    pub fn pending_reclaims(&self) -> usize {
        self.reclaim.pending()
    }

    pub fn registry(&self) -> &Arc<HazardPointerRegistry> {
        &self.registry
    }
}

impl<T: Send> Drop for HazardStack<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            unsafe {
                let mut node = Box::from_raw(current);
                current = node.next;
                ManuallyDrop::drop(&mut node.data);
            }
        }
    }
}

impl<T: Send> fmt::Debug for HazardStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "HazardStack {{ empty: {:?}, pending_reclaims: {:?} }}",
            self.is_empty(),
            self.pending_reclaims()
        )
    }
}

impl<T> Node<T> {
    fn new(val: T) -> Self {
        Node {
            data: ManuallyDrop::new(val),
            next: ptr::null_mut(),
        }
    }

    fn into_data(self) -> T {
        ManuallyDrop::into_inner(self.data)
    }
}
