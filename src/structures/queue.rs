use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use super::backoff::Backoff;
use crate::error::Result;
use crate::memory::{try_box, try_counted_box, AtomicCountedPtr, CountedPtr};

/// A lock-free FIFO queue that reclaims nodes with split reference counts.
///
/// The queue is a linked list of nodes that always ends in a dummy node without a value:
/// enqueueing claims the dummy by storing a value into it and links a fresh dummy behind it.
/// When `head` and `tail` designate the same node the queue is empty.
///
/// Both ends are counted pointers. A node additionally remembers how many of the two kinds of
/// pointer to it (the `tail`, and the predecessor's `next` or the `head`) are still around, and
/// is freed once both are gone and every borrowed reference has been handed back.
pub struct RefCountedQueue<T: Send> {
    head: AtomicCountedPtr<Node<T>>,
    tail: AtomicCountedPtr<Node<T>>,
}

#[repr(align(64))]
struct Node<T> {
    data: AtomicPtr<T>,
    count: AtomicU64,
    next: AtomicCountedPtr<Node<T>>,
}

/// Internal reference count and number of live external counters of a node, packed so they
/// can be updated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeCount {
    internal_count: i32,
    external_counters: u32,
}

impl<T: Send> RefCountedQueue<T> {
    /// Create a new queue holding only its dummy node.
    /// # Examples
    /// ```
    /// use splitref::structures::RefCountedQueue;
    ///
    /// let queue: RefCountedQueue<String> = RefCountedQueue::new().unwrap();
    /// assert!(queue.is_empty());
    /// ```
    pub fn new() -> Result<Self> {
        let dummy = CountedPtr::new(Box::into_raw(Node::try_alloc()?), 1);
        Ok(RefCountedQueue {
            head: AtomicCountedPtr::new(dummy),
            tail: AtomicCountedPtr::new(dummy),
        })
    }

    /// Add a new element to the back of the queue.
    ///
    /// Fails only if the value or the next dummy node cannot be allocated. The value is not
    /// published in that case.
    /// # Examples
    /// ```
    /// use splitref::structures::RefCountedQueue;
    ///
    /// let queue: RefCountedQueue<String> = RefCountedQueue::new().unwrap();
    /// queue.enqueue("hello".to_owned()).unwrap();
    /// assert_eq!(queue.dequeue(), Some("hello".to_owned()));
    /// ```
    pub fn enqueue(&self, val: T) -> Result<()> {
        // The spare dummy stays an owned box until it is linked into the queue, so any path
        // that does not publish it frees it.
        let mut spare = Node::try_alloc()?;
        let data = Box::into_raw(try_box(val)?);
        let mut old_tail = self.tail.load(Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            old_tail = self.tail.increase_external_count(old_tail);
            let tail_node = unsafe { &*old_tail.node };

            if tail_node
                .data
                .compare_exchange(ptr::null_mut(), data, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let spare_ptr = Box::into_raw(spare);
                let new_next = CountedPtr::new(spare_ptr, 1);
                let next = match tail_node.next.compare_exchange(
                    CountedPtr::null(),
                    new_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => new_next,
                    Err(helped) => {
                        // Somebody linked their own dummy for us; ours was never visible.
                        unsafe { drop(Box::from_raw(spare_ptr)) };
                        helped
                    }
                };
                unsafe { self.set_new_tail(old_tail, next) };
                return Ok(());
            }

            // Another enqueuer owns this node. Link a successor for it if it has not yet, so
            // nobody waits on that thread, then move on.
            let spare_ptr = Box::into_raw(spare);
            let linked = CountedPtr::new(spare_ptr, 1);
            let (next, used_spare) = match tail_node.next.compare_exchange(
                CountedPtr::null(),
                linked,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => (linked, true),
                Err(actual) => (actual, false),
            };
            unsafe { self.set_new_tail(old_tail, next) };
            spare = if used_spare {
                match Node::try_alloc() {
                    Ok(node) => node,
                    Err(err) => {
                        unsafe { drop(Box::from_raw(data)) };
                        return Err(err);
                    }
                }
            } else {
                unsafe { Box::from_raw(spare_ptr) }
            };
            old_tail = self.tail.load(Ordering::Relaxed);
            backoff.spin();
        }
    }

    /// Moves `tail` from `old_tail` to `new_tail` unless another thread already moved it past
    /// the same node, then gives back the reference this thread held on the old tail node.
    unsafe fn set_new_tail(&self, mut old_tail: CountedPtr<Node<T>>, new_tail: CountedPtr<Node<T>>) {
        let current = old_tail.node;
        loop {
            match self
                .tail
                .compare_exchange_weak(old_tail, new_tail, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    old_tail = actual;
                    if !ptr::eq(actual.node, current) {
                        break;
                    }
                }
            }
        }
        if ptr::eq(old_tail.node, current) {
            Node::free_external_counter(old_tail);
        } else {
            Node::release_ref(current);
        }
    }

    /// Take an element from the front of the queue, or return None if the queue is empty.
    /// # Examples
    /// ```
    /// use splitref::structures::RefCountedQueue;
    ///
    /// let queue: RefCountedQueue<u32> = RefCountedQueue::new().unwrap();
    /// assert_eq!(queue.dequeue(), None);
    /// ```
    pub fn dequeue(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            old_head = self.head.increase_external_count(old_head);
            let node = old_head.node;
            // Our reference keeps `node` alive, so its address cannot be reused for the tail.
            if ptr::eq(node, self.tail.load(Ordering::Acquire).node) {
                self.give_back_head(old_head);
                return None;
            }
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            debug_assert!(!next.is_null());
            loop {
                match self
                    .head
                    .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let data = unsafe { (*node).data.swap(ptr::null_mut(), Ordering::AcqRel) };
                        unsafe { Node::free_external_counter(old_head) };
                        debug_assert!(!data.is_null());
                        return Some(unsafe { *Box::from_raw(data) });
                    }
                    // Only the count moved, and it still includes our reference.
                    Err(actual) if ptr::eq(actual.node, node) => old_head = actual,
                    Err(actual) => {
                        unsafe { Node::release_ref(node) };
                        old_head = actual;
                        break;
                    }
                }
            }
            backoff.spin();
        }
    }

    /// Returns the external reference taken on `held` by an empty dequeue.
    ///
    /// While `head` still designates the node the reference is taken back off the counted
    /// pointer, so a run of empty dequeues leaves the head count where it was. Once `head` has
    /// moved on the reference is handed to the node instead.
    fn give_back_head(&self, mut held: CountedPtr<Node<T>>) {
        let node = held.node;
        loop {
            let back = CountedPtr::new(node, held.external_count - 1);
            match self
                .head
                .compare_exchange_weak(held, back, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) if ptr::eq(actual.node, node) => held = actual,
                Err(_) => {
                    unsafe { Node::release_ref(node) };
                    return;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        ptr::eq(head.node, self.tail.load(Ordering::Acquire).node)
    }
}

impl<T: Send> Drop for RefCountedQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        let dummy = self.head.load(Ordering::Relaxed);
        unsafe { drop(Box::from_raw(dummy.node)) };
    }
}

impl<T: Send> fmt::Debug for RefCountedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RefCountedQueue {{ head: {:?}, tail: {:?} }}",
            self.head, self.tail
        )
    }
}

impl<T> Node<T> {
    /// A dummy node referenced by the tail and by its predecessor.
    fn try_alloc() -> Result<Box<Self>> {
        try_counted_box(Node {
            data: AtomicPtr::default(),
            count: AtomicU64::new(
                NodeCount {
                    internal_count: 0,
                    external_counters: 2,
                }
                .pack(),
            ),
            next: AtomicCountedPtr::new(CountedPtr::null()),
        })
        .map_err(|(err, _)| err)
    }

    /// Hands back one borrowed reference, freeing the node if it was the last one.
    unsafe fn release_ref(node: *mut Self) {
        Self::update_count(node, |count| NodeCount {
            internal_count: count.internal_count.wrapping_sub(1),
            ..count
        })
    }

    /// Retires one external counter, folding its count into the internal one.
    ///
    /// Two of the external references are not borrowed: the pointer's own and the caller's.
    unsafe fn free_external_counter(old: CountedPtr<Self>) {
        let count_increase = old.external_count as i32 - 2;
        Self::update_count(old.node, |count| NodeCount {
            internal_count: count.internal_count.wrapping_add(count_increase),
            external_counters: count.external_counters - 1,
        })
    }

    unsafe fn update_count<F>(node: *mut Self, update: F)
    where
        F: Fn(NodeCount) -> NodeCount,
    {
        let mut old = (*node).count.load(Ordering::Relaxed);
        loop {
            let new = update(NodeCount::unpack(old));
            match (*node)
                .count
                .compare_exchange_weak(old, new.pack(), Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if new.is_released() {
                        drop(Box::from_raw(node));
                    }
                    return;
                }
                Err(actual) => old = actual,
            }
        }
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        let data = *self.data.get_mut();
        if !data.is_null() {
            unsafe { drop(Box::from_raw(data)) };
        }
    }
}

impl NodeCount {
    fn pack(self) -> u64 {
        ((self.external_counters as u64) << 32) | (self.internal_count as u32 as u64)
    }

    fn unpack(raw: u64) -> Self {
        NodeCount {
            internal_count: raw as u32 as i32,
            external_counters: (raw >> 32) as u32,
        }
    }

    fn is_released(&self) -> bool {
        self.internal_count == 0 && self.external_counters == 0
    }
}
