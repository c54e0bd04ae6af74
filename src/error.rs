use thiserror::Error;

/// Failures surfaced by the structures in this crate.
///
/// Popping from an empty structure is not an error; it is reported as `None`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every slot of the hazard pointer registry is owned by some thread.
    #[error("no free hazard pointer slot, all {capacity} slots are owned")]
    ResourceExhausted { capacity: usize },
    /// The global allocator returned null for a node or value.
    #[error("failed to allocate {size} bytes")]
    AllocationFailure { size: usize },
    /// A node landed at an address that cannot be packed next to a reference count.
    #[error("address {address:#x} cannot be packed into a counted pointer")]
    AddressOutOfRange { address: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
