//! A module for lock-free memory management.
//!
//! The types in this module decide when a node unlinked from a lock-free structure can be
//! freed. They make sure no node is freed while another thread can still access it, which
//! also rules out the [ABA problem](https://en.wikipedia.org/wiki/ABA_problem) on the
//! addresses being compared.

pub use self::counted::{AtomicCountedPtr, CountedPtr, MAX_EXTERNAL_COUNT, NODE_ALIGN};
pub use self::hazardpointers::{HazardHandle, HazardPointerRegistry, RegistryConfig, DEFAULT_CAPACITY};
pub use self::reclaimlist::ReclamationList;

pub(crate) use self::alloc::{try_box, try_box_or_return};
#[cfg(test)]
pub(crate) use self::alloc::failure;
pub(crate) use self::counted::try_counted_box;

mod alloc;
mod counted;
mod hazardpointers;
mod reclaimlist;
