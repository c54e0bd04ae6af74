use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::alloc::try_box_or_return;
use crate::error::{Error, Result};

/// Counted nodes must be aligned to this many bytes, the low bits of their address are
/// always zero and are not stored.
pub const NODE_ALIGN: usize = 1 << ALIGN_SHIFT;
/// Largest external count a `CountedPtr` can hold.
pub const MAX_EXTERNAL_COUNT: u32 = (1 << (64 - ADDR_BITS)) - 1;

const ALIGN_SHIFT: u32 = 6;
const ADDR_BITS: u32 = 42;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// A node address paired with the external reference count of the pointer holding it.
///
/// Both halves live in a single `u64` when stored in an [`AtomicCountedPtr`]: the address
/// shifted right by the node alignment in the low 42 bits and the count in the high 22.
pub struct CountedPtr<N> {
    pub external_count: u32,
    pub node: *mut N,
}

impl<N> CountedPtr<N> {
    pub fn new(node: *mut N, external_count: u32) -> Self {
        CountedPtr {
            external_count,
            node,
        }
    }

    pub fn null() -> Self {
        CountedPtr::new(ptr::null_mut(), 0)
    }

    pub fn is_null(&self) -> bool {
        self.node.is_null()
    }

    /// Whether `node` can be stored in a counted pointer without losing bits.
    pub fn fits(node: *const N) -> bool {
        let address = node as usize as u64;
        address & (NODE_ALIGN as u64 - 1) == 0 && (address >> ALIGN_SHIFT) <= ADDR_MASK
    }

    /// The same pointer with one more external reference.
    pub fn incremented(self) -> Self {
        assert!(self.external_count < MAX_EXTERNAL_COUNT, "external count overflow");
        CountedPtr::new(self.node, self.external_count + 1)
    }

    fn pack(self) -> u64 {
        debug_assert!(Self::fits(self.node));
        debug_assert!(self.external_count <= MAX_EXTERNAL_COUNT);
        ((self.external_count as u64) << ADDR_BITS) | ((self.node as usize as u64) >> ALIGN_SHIFT)
    }

    fn unpack(raw: u64) -> Self {
        CountedPtr {
            external_count: (raw >> ADDR_BITS) as u32,
            node: ((raw & ADDR_MASK) << ALIGN_SHIFT) as usize as *mut N,
        }
    }
}

impl<N> Clone for CountedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.external_count == other.external_count && ptr::eq(self.node, other.node)
    }
}

impl<N> Eq for CountedPtr<N> {}

impl<N> fmt::Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CountedPtr {{ external_count: {}, node: {:?} }}", self.external_count, self.node)
    }
}

/// A [`CountedPtr`] that is loaded, stored and compared-and-swapped as one atomic value.
pub struct AtomicCountedPtr<N> {
    raw: AtomicU64,
    _marker: PhantomData<*mut N>,
}

unsafe impl<N> Send for AtomicCountedPtr<N> {}
unsafe impl<N> Sync for AtomicCountedPtr<N> {}

impl<N> AtomicCountedPtr<N> {
    const ALIGNED: () = assert!(
        mem::align_of::<N>() >= NODE_ALIGN,
        "counted nodes must be aligned to NODE_ALIGN"
    );

    pub fn new(value: CountedPtr<N>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::ALIGNED;
        AtomicCountedPtr {
            raw: AtomicU64::new(value.pack()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> CountedPtr<N> {
        CountedPtr::unpack(self.raw.load(order))
    }

    pub fn store(&self, value: CountedPtr<N>, order: Ordering) {
        self.raw.store(value.pack(), order)
    }

    pub fn compare_exchange(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<CountedPtr<N>, CountedPtr<N>> {
        self.raw
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }

    pub fn compare_exchange_weak(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<CountedPtr<N>, CountedPtr<N>> {
        self.raw
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }

    /// Adds one external reference to whatever this pointer currently holds, starting from
    /// the guess `old`, and returns the value that was installed.
    ///
    /// Once this returns, the node it designates cannot be freed until the caller gives the
    /// reference back.
    pub fn increase_external_count(&self, mut old: CountedPtr<N>) -> CountedPtr<N> {
        loop {
            let new = old.incremented();
            match self.compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return new,
                Err(actual) => old = actual,
            }
        }
    }
}

impl<N> fmt::Debug for AtomicCountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

/// Allocates a node that is going to be reached through counted pointers, handing the node
/// back if that fails.
pub(crate) fn try_counted_box<N>(node: N) -> std::result::Result<Box<N>, (Error, N)> {
    let boxed = try_box_or_return(node)?;
    match ensure_fits(&*boxed as *const N) {
        Ok(()) => Ok(boxed),
        Err(err) => Err((err, *boxed)),
    }
}

fn ensure_fits<N>(address: *const N) -> Result<()> {
    if CountedPtr::fits(address) {
        Ok(())
    } else {
        Err(Error::AddressOutOfRange {
            address: address as usize,
        })
    }
}
