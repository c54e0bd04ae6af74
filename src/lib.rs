//! Lock-free stacks and queues with explicit memory reclamation for Rust.
//!
//! Removing a node from a lock-free structure is easy; freeing it is not, since another
//! thread may have read its address just before it was unlinked. This crate provides two
//! ways of deciding when a node can be freed:
//!
//! * [hazard pointers](memory::HazardPointerRegistry), where a thread announces the address
//!   it is about to dereference and nobody frees an announced address, used by
//!   [`HazardStack`](structures::HazardStack);
//! * split reference counting, where every pointer to a node carries an external count and
//!   the node carries an internal one, used by [`RefCountedStack`](structures::RefCountedStack)
//!   and [`RefCountedQueue`](structures::RefCountedQueue).
//!
//! Mutex based versions of the stack and queue implement the same
//! [`ConcurrentStack`](structures::ConcurrentStack) and
//! [`ConcurrentQueue`](structures::ConcurrentQueue) traits, so an implementation can be
//! picked at construction time.

pub mod error;
pub mod memory;
pub mod structures;

pub use error::{Error, Result};
