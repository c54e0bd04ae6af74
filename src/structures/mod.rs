//! Concurrent stacks and queues.
//!
//! Every structure implements either [`ConcurrentStack`] or [`ConcurrentQueue`], so callers
//! can pick an implementation at construction time through [`StackKind`] or [`QueueKind`]
//! and use it behind a trait object.

pub use self::locked::{LockedQueue, LockedStack};
pub use self::queue::RefCountedQueue;
pub use self::rc_stack::RefCountedStack;
pub use self::stack::HazardStack;

use std::sync::Arc;

use crate::error::Result;
use crate::memory::HazardPointerRegistry;

mod backoff;
mod locked;
mod queue;
mod rc_stack;
mod stack;

/// Operations shared by every stack in this crate.
pub trait ConcurrentStack<T>: Send + Sync {
    fn push(&self, value: T) -> Result<()>;
    /// `Ok(None)` when the stack is empty.
    fn pop(&self) -> Result<Option<T>>;
    fn is_empty(&self) -> bool;
}

/// Operations shared by every queue in this crate.
pub trait ConcurrentQueue<T>: Send + Sync {
    fn enqueue(&self, value: T) -> Result<()>;
    /// `None` when the queue is empty.
    fn dequeue(&self) -> Option<T>;
    fn is_empty(&self) -> bool;
}

/// Selects a stack implementation.
#[derive(Debug, Clone)]
pub enum StackKind {
    Locked,
    HazardPointer(Arc<HazardPointerRegistry>),
    RefCounted,
}

impl StackKind {
    pub fn build<T: Send + 'static>(self) -> Box<dyn ConcurrentStack<T>> {
        match self {
            StackKind::Locked => Box::new(LockedStack::new()),
            StackKind::HazardPointer(registry) => Box::new(HazardStack::new(registry)),
            StackKind::RefCounted => Box::new(RefCountedStack::new()),
        }
    }
}

/// Selects a queue implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Locked,
    RefCounted,
}

impl QueueKind {
    pub fn build<T: Send + 'static>(self) -> Result<Box<dyn ConcurrentQueue<T>>> {
        let queue: Box<dyn ConcurrentQueue<T>> = match self {
            QueueKind::Locked => Box::new(LockedQueue::new()),
            QueueKind::RefCounted => Box::new(RefCountedQueue::new()?),
        };
        Ok(queue)
    }
}

impl<T: Send> ConcurrentStack<T> for LockedStack<T> {
    fn push(&self, value: T) -> Result<()> {
        LockedStack::push(self, value)
    }

    fn pop(&self) -> Result<Option<T>> {
        Ok(LockedStack::pop(self))
    }

    fn is_empty(&self) -> bool {
        LockedStack::is_empty(self)
    }
}

impl<T: Send> ConcurrentStack<T> for HazardStack<T> {
    fn push(&self, value: T) -> Result<()> {
        HazardStack::push(self, value)
    }

    fn pop(&self) -> Result<Option<T>> {
        HazardStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        HazardStack::is_empty(self)
    }
}

impl<T: Send> ConcurrentStack<T> for RefCountedStack<T> {
    fn push(&self, value: T) -> Result<()> {
        RefCountedStack::push(self, value)
    }

    fn pop(&self) -> Result<Option<T>> {
        Ok(RefCountedStack::pop(self))
    }

    fn is_empty(&self) -> bool {
        RefCountedStack::is_empty(self)
    }
}

impl<T: Send> ConcurrentQueue<T> for LockedQueue<T> {
    fn enqueue(&self, value: T) -> Result<()> {
        LockedQueue::enqueue(self, value)
    }

    fn dequeue(&self) -> Option<T> {
        LockedQueue::dequeue(self)
    }

    fn is_empty(&self) -> bool {
        LockedQueue::is_empty(self)
    }
}

impl<T: Send> ConcurrentQueue<T> for RefCountedQueue<T> {
    fn enqueue(&self, value: T) -> Result<()> {
        RefCountedQueue::enqueue(self, value)
    }

    fn dequeue(&self) -> Option<T> {
        RefCountedQueue::dequeue(self)
    }

    fn is_empty(&self) -> bool {
        RefCountedQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConcurrentQueue, ConcurrentStack, QueueKind, StackKind};
    use crate::memory::HazardPointerRegistry;
    use im::Vector;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn stack_kinds() -> Vec<StackKind> {
        vec![
            StackKind::Locked,
            StackKind::HazardPointer(Arc::new(HazardPointerRegistry::new(16))),
            StackKind::RefCounted,
        ]
    }

    fn queue_kinds() -> Vec<QueueKind> {
        vec![QueueKind::Locked, QueueKind::RefCounted]
    }

    #[test]
    fn test_every_stack_is_lifo() {
        for kind in stack_kinds() {
            let stack: Box<dyn ConcurrentStack<u32>> = kind.clone().build();
            stack.push(1).unwrap();
            stack.push(2).unwrap();
            stack.push(3).unwrap();
            let popped: Vec<_> = (0..4).map(|_| stack.pop().unwrap()).collect();
            assert_eq!(popped, vec![Some(3), Some(2), Some(1), None], "{:?}", kind);
            assert!(stack.is_empty());
        }
    }

    #[test]
    fn test_every_queue_is_fifo() {
        for kind in queue_kinds() {
            let queue: Box<dyn ConcurrentQueue<u32>> = kind.build().unwrap();
            queue.enqueue(1).unwrap();
            queue.enqueue(2).unwrap();
            assert_eq!(queue.dequeue(), Some(1), "{:?}", kind);
            queue.enqueue(3).unwrap();
            assert_eq!(queue.dequeue(), Some(2), "{:?}", kind);
            assert_eq!(queue.dequeue(), Some(3), "{:?}", kind);
            assert_eq!(queue.dequeue(), None, "{:?}", kind);
        }
    }

    // Random single-threaded histories checked against a persistent vector.
    #[test]
    fn test_stacks_match_sequential_model() {
        for kind in stack_kinds() {
            let mut rng = StdRng::seed_from_u64(7);
            let stack: Box<dyn ConcurrentStack<u32>> = kind.clone().build();
            let mut model: Vector<u32> = Vector::new();
            for _ in 0..5000 {
                if rng.gen_range(0..100) < 55 {
                    let val = rng.gen();
                    stack.push(val).unwrap();
                    model.push_back(val);
                } else {
                    assert_eq!(stack.pop().unwrap(), model.pop_back(), "{:?}", kind);
                }
                assert_eq!(stack.is_empty(), model.is_empty());
            }
        }
    }

    #[test]
    fn test_queues_match_sequential_model() {
        for kind in queue_kinds() {
            let mut rng = StdRng::seed_from_u64(11);
            let queue: Box<dyn ConcurrentQueue<u32>> = kind.build().unwrap();
            let mut model: Vector<u32> = Vector::new();
            for _ in 0..5000 {
                if rng.gen_range(0..100) < 55 {
                    let val = rng.gen();
                    queue.enqueue(val).unwrap();
                    model.push_back(val);
                } else {
                    assert_eq!(queue.dequeue(), model.pop_front(), "{:?}", kind);
                }
                assert_eq!(queue.is_empty(), model.is_empty());
            }
        }
    }

    // Producers and consumers share the structure through scoped threads; every value
    // pushed must come out exactly once.
    #[test]
    fn test_every_stack_loses_nothing() {
        for kind in stack_kinds() {
            let stack: Box<dyn ConcurrentStack<u64>> = kind.clone().build();
            let stack = &*stack;
            let mut popped: Vec<u64> = crossbeam::thread::scope(|scope| {
                for t in 0..4u64 {
                    scope.spawn(move |_| {
                        for i in 0..2500 {
                            stack.push(t * 2500 + i).unwrap();
                        }
                    });
                }
                let consumers: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(move |_| {
                            let mut seen = Vec::with_capacity(2500);
                            while seen.len() < 2500 {
                                if let Some(val) = stack.pop().unwrap() {
                                    seen.push(val);
                                }
                            }
                            seen
                        })
                    })
                    .collect();
                consumers
                    .into_iter()
                    .flat_map(|h| h.join().unwrap())
                    .collect()
            })
            .unwrap();
            popped.sort();
            assert_eq!(popped, (0..10000).collect::<Vec<_>>(), "{:?}", kind);
        }
    }

    #[test]
    fn test_every_queue_loses_nothing() {
        for kind in queue_kinds() {
            let queue: Box<dyn ConcurrentQueue<u64>> = kind.build().unwrap();
            let queue = &*queue;
            let mut dequeued: Vec<u64> = crossbeam::thread::scope(|scope| {
                for t in 0..4u64 {
                    scope.spawn(move |_| {
                        for i in 0..2500 {
                            queue.enqueue(t * 2500 + i).unwrap();
                        }
                    });
                }
                let consumers: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(move |_| {
                            let mut seen = Vec::with_capacity(2500);
                            while seen.len() < 2500 {
                                if let Some(val) = queue.dequeue() {
                                    seen.push(val);
                                }
                            }
                            seen
                        })
                    })
                    .collect();
                consumers
                    .into_iter()
                    .flat_map(|h| h.join().unwrap())
                    .collect()
            })
            .unwrap();
            dequeued.sort();
            assert_eq!(dequeued, (0..10000).collect::<Vec<_>>(), "{:?}", kind);
        }
    }
}
