use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Number of slots in a registry built with `Default`, which also bounds the number of
/// threads that can hold a hazard pointer at the same time.
pub const DEFAULT_CAPACITY: usize = 100;

const UNOWNED: u64 = 0;

/// Construction parameters for a [`HazardPointerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// A fixed-size table of hazard pointers.
///
/// Every slot records which thread owns it and which address that thread is about to
/// dereference. A thread claims a slot with [`acquire`](Self::acquire), announces addresses
/// through the returned [`HazardHandle`], and any thread about to free a node first asks
/// [`is_guarded`](Self::is_guarded) whether somebody announced it.
///
/// Registries are plain values: structures take one as an explicit `Arc` so that
/// independent registries can coexist.
pub struct HazardPointerRegistry {
    slots: Arc<[HazardSlot]>,
}

struct HazardSlot {
    owner: AtomicU64,
    guarded: AtomicPtr<()>,
}

/// A slot a thread claimed through [`HazardPointerRegistry::with_local_handle`]. Lives in the
/// thread's `OWNED_SLOTS` and hands the slot back when the thread exits.
struct OwnedSlot {
    slots: Weak<[HazardSlot]>,
    index: usize,
}

impl Drop for OwnedSlot {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            let slot = &slots[self.index];
            slot.guarded.store(ptr::null_mut(), Ordering::SeqCst);
            slot.owner.store(UNOWNED, Ordering::Release);
            debug!("released cached hazard slot {}", self.index);
        }
    }
}

thread_local! {
    static OWNED_SLOTS: RefCell<Vec<OwnedSlot>> = RefCell::new(Vec::new());
}

impl HazardPointerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(RegistryConfig { capacity })
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let slots = (0..config.capacity)
            .map(|_| HazardSlot {
                owner: AtomicU64::new(UNOWNED),
                guarded: AtomicPtr::default(),
            })
            .collect();
        HazardPointerRegistry { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently owned by some thread.
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner.load(Ordering::Acquire) != UNOWNED)
            .count()
    }

    /// Claims a free slot for the calling thread.
    ///
    /// The slot goes back to the pool when the handle is dropped. Fails with
    /// [`Error::ResourceExhausted`] when every slot is owned.
    pub fn acquire(&self) -> Result<HazardHandle<'_>> {
        let index = self.claim_slot()?;
        Ok(HazardHandle::new(self, index, false))
    }

    /// Whether any thread has announced `address`.
    ///
    /// Scans the whole table, so the cost grows with the capacity of the registry and not with
    /// the size of the structure being protected.
    pub fn is_guarded<T>(&self, address: *const T) -> bool {
        if address.is_null() {
            return false;
        }
        let address = address as *mut ();
        self.slots
            .iter()
            .any(|slot| slot.guarded.load(Ordering::SeqCst) == address)
    }

    /// Runs `f` with the calling thread's own handle, claiming a slot on first use.
    ///
    /// The slot stays with the thread until the thread exits, then goes back to the pool.
    /// Calls must not be nested, the inner call would share and clear the outer mark.
    pub(crate) fn with_local_handle<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HazardHandle<'_>) -> R,
    {
        match OWNED_SLOTS.try_with(|owned| self.local_slot(&mut owned.borrow_mut())) {
            Ok(index) => {
                let handle = HazardHandle::new(self, index?, true);
                Ok(f(&handle))
            }
            // Thread-local storage is being torn down, fall back to a slot for this call only.
            Err(_) => {
                let handle = self.acquire()?;
                Ok(f(&handle))
            }
        }
    }

    fn local_slot(&self, owned: &mut Vec<OwnedSlot>) -> Result<usize> {
        owned.retain(|slot| slot.slots.strong_count() > 0);
        let mine = Arc::downgrade(&self.slots);
        if let Some(slot) = owned.iter().find(|slot| Weak::ptr_eq(&slot.slots, &mine)) {
            return Ok(slot.index);
        }
        let index = self.claim_slot()?;
        owned.push(OwnedSlot { slots: mine, index });
        Ok(index)
    }

    fn claim_slot(&self) -> Result<usize> {
        let token = current_thread_token();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.owner.load(Ordering::Relaxed) != UNOWNED {
                continue;
            }
            if slot
                .owner
                .compare_exchange(UNOWNED, token, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug!("thread {} claimed hazard slot {}", token, index);
                return Ok(index);
            }
        }
        warn!(
            "thread {} found no free hazard slot out of {}",
            token,
            self.slots.len()
        );
        Err(Error::ResourceExhausted {
            capacity: self.slots.len(),
        })
    }
}

impl Default for HazardPointerRegistry {
    fn default() -> Self {
        Self::with_config(RegistryConfig::default())
    }
}

impl fmt::Debug for HazardPointerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let guarded: Vec<*mut ()> = self
            .slots
            .iter()
            .map(|slot| slot.guarded.load(Ordering::Relaxed))
            .filter(|address| !address.is_null())
            .collect();
        write!(
            f,
            "HazardPointerRegistry(\n\tcapacity: {:?}, \n\tactive: {:?}, \n\tguarded: {:?})",
            self.capacity(),
            self.active_slots(),
            guarded
        )
    }
}

/// A thread's claim on one slot of a [`HazardPointerRegistry`].
///
/// Handles are tied to the thread that acquired them and cannot be sent elsewhere.
pub struct HazardHandle<'r> {
    registry: &'r HazardPointerRegistry,
    index: usize,
    cached: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'r> HazardHandle<'r> {
    fn new(registry: &'r HazardPointerRegistry, index: usize, cached: bool) -> Self {
        HazardHandle {
            registry,
            index,
            cached,
            _not_send: PhantomData,
        }
    }

    /// Announces that this thread is about to dereference `address`.
    pub fn mark<T>(&self, address: *const T) {
        self.slot()
            .guarded
            .store(address as *mut (), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.slot().guarded.store(ptr::null_mut(), Ordering::SeqCst);
    }

    /// Clears the mark and hands the slot back to the registry.
    pub fn release(self) {
        drop(self)
    }

    pub fn registry(&self) -> &'r HazardPointerRegistry {
        self.registry
    }

    pub fn slot_index(&self) -> usize {
        self.index
    }

    fn slot(&self) -> &HazardSlot {
        &self.registry.slots[self.index]
    }
}

impl<'r> Drop for HazardHandle<'r> {
    fn drop(&mut self) {
        self.clear();
        if !self.cached {
            self.slot().owner.store(UNOWNED, Ordering::Release);
            debug!("released hazard slot {}", self.index);
        }
    }
}

impl<'r> fmt::Debug for HazardHandle<'r> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "HazardHandle {{ slot: {}, guarded: {:?} }}",
            self.index,
            self.slot().guarded.load(Ordering::Relaxed)
        )
    }
}

/// A process-unique, non-zero token for the calling thread.
fn current_thread_token() -> u64 {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(UNOWNED + 1);
    thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

#[cfg(test)]
mod tests {
    use super::{HazardPointerRegistry, DEFAULT_CAPACITY};
    use crate::error::Error;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_default_capacity() {
        let registry = HazardPointerRegistry::default();
        assert_eq!(registry.capacity(), DEFAULT_CAPACITY);
        assert_eq!(registry.active_slots(), 0);
    }

    #[test]
    fn test_release_returns_slot() {
        let registry = HazardPointerRegistry::new(1);
        let handle = registry.acquire().unwrap();
        assert_eq!(registry.active_slots(), 1);
        handle.release();
        assert_eq!(registry.active_slots(), 0);
        assert!(registry.acquire().is_ok());
    }

    #[test]
    fn test_exhausted_registry() {
        let registry = HazardPointerRegistry::new(2);
        let _first = registry.acquire().unwrap();
        let _second = registry.acquire().unwrap();
        match registry.acquire() {
            Err(err) => assert_eq!(err, Error::ResourceExhausted { capacity: 2 }),
            Ok(_) => panic!("third handle out of two slots"),
        };
    }

    #[test]
    fn test_mark_and_clear() {
        let registry = HazardPointerRegistry::new(4);
        let value = Box::into_raw(Box::new(5u32));
        let handle = registry.acquire().unwrap();
        assert!(!registry.is_guarded(value));
        handle.mark(value);
        assert!(registry.is_guarded(value));
        handle.clear();
        assert!(!registry.is_guarded(value));
        handle.mark(value);
        drop(handle);
        assert!(!registry.is_guarded(value));
        unsafe { drop(Box::from_raw(value)) }
    }

    #[test]
    fn test_null_is_never_guarded() {
        let registry = HazardPointerRegistry::new(2);
        let _handle = registry.acquire().unwrap();
        assert!(!registry.is_guarded(std::ptr::null::<u8>()));
    }

    #[test]
    fn test_more_threads_than_slots() {
        let registry = HazardPointerRegistry::new(2);
        let barrier = Barrier::new(3);
        let failures = thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    scope.spawn(|| {
                        let handle = registry.acquire();
                        barrier.wait();
                        handle.is_err()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|failed| *failed)
                .count()
        });
        assert_eq!(failures, 1);
        assert_eq!(registry.active_slots(), 0);
    }

    #[test]
    fn test_local_handle_is_reused() {
        let registry = HazardPointerRegistry::new(4);
        let first = registry.with_local_handle(|hp| hp.slot_index()).unwrap();
        let second = registry.with_local_handle(|hp| hp.slot_index()).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.active_slots(), 1);
    }

    #[test]
    fn test_local_handle_returned_on_thread_exit() {
        let registry = HazardPointerRegistry::new(1);
        thread::scope(|scope| {
            scope
                .spawn(|| registry.with_local_handle(|hp| hp.slot_index()).unwrap())
                .join()
                .unwrap();
        });
        assert_eq!(registry.active_slots(), 0);
        assert!(registry.acquire().is_ok());
    }

    #[test]
    fn test_local_handles_of_other_registries_do_not_interfere() {
        let first = HazardPointerRegistry::new(1);
        let second = HazardPointerRegistry::new(1);
        thread::scope(|scope| {
            scope
                .spawn(|| first.with_local_handle(|_| ()).unwrap())
                .join()
                .unwrap();
        });
        let barrier = Barrier::new(2);
        thread::scope(|scope| {
            // Holds a cached slot of `second` while this thread uses `first`.
            scope.spawn(|| {
                second.with_local_handle(|_| ()).unwrap();
                barrier.wait();
                barrier.wait();
            });
            barrier.wait();
            assert!(first.with_local_handle(|_| ()).is_ok());
            barrier.wait();
        });
        assert_eq!(second.active_slots(), 0);
    }

    #[test]
    fn test_local_handle_outlives_dropped_registry() {
        let registry = HazardPointerRegistry::new(1);
        registry.with_local_handle(|_| ()).unwrap();
        drop(registry);
        let registry = HazardPointerRegistry::new(1);
        assert_eq!(registry.with_local_handle(|hp| hp.slot_index()).unwrap(), 0);
    }

    #[test]
    fn test_local_handle_exhaustion() {
        let registry = HazardPointerRegistry::new(1);
        let _held = registry.acquire().unwrap();
        match registry.with_local_handle(|_| ()) {
            Err(Error::ResourceExhausted { capacity }) => assert_eq!(capacity, 1),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
}
