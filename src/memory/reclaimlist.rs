use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::trace;

use super::hazardpointers::HazardPointerRegistry;

/// A lock-free list of unlinked nodes that could not be freed yet because some thread still
/// had them marked as hazardous.
///
/// Nodes are owned by the list once added and are freed with `Box::from_raw`, either by a
/// later [`reclaim_ready`](Self::reclaim_ready) pass or when the list is dropped.
pub struct ReclamationList<N> {
    head: AtomicPtr<ReclaimEntry<N>>,
    pending: AtomicUsize,
    _marker: PhantomData<Box<N>>,
}

struct ReclaimEntry<N> {
    node: *mut N,
    next: *mut ReclaimEntry<N>,
}

unsafe impl<N: Send> Send for ReclamationList<N> {}
unsafe impl<N: Send> Sync for ReclamationList<N> {}

impl<N> ReclamationList<N> {
    pub fn new() -> Self {
        ReclamationList {
            head: AtomicPtr::default(),
            pending: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Defers freeing `node`.
    ///
    /// # Safety
    /// `node` must come from `Box::into_raw`, must already be unreachable from any shared
    /// structure, and must not be added twice.
    pub unsafe fn add(&self, node: *mut N) {
        let entry = Box::into_raw(Box::new(ReclaimEntry {
            node,
            next: ptr::null_mut(),
        }));
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.push_entry(entry);
    }

    /// Frees every deferred node that no hazard pointer in `registry` designates any more and
    /// puts the rest back. Returns the number of nodes freed.
    ///
    /// Concurrent calls to `add` are fine: the whole list is detached with a single exchange,
    /// so entries added meanwhile are simply left for the next pass.
    pub fn reclaim_ready(&self, registry: &HazardPointerRegistry) -> usize {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut freed = 0;
        let mut kept = 0;
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                if registry.is_guarded((*current).node) {
                    self.push_entry(current);
                    kept += 1;
                } else {
                    let entry = Box::from_raw(current);
                    drop(Box::from_raw(entry.node));
                    freed += 1;
                }
                current = next;
            }
        }
        if freed > 0 {
            self.pending.fetch_sub(freed, Ordering::Relaxed);
        }
        if freed + kept > 0 {
            trace!("reclaim pass freed {} nodes, {} still guarded", freed, kept);
        }
        freed
    }

    /// Number of nodes waiting to be freed. Only exact while no other thread uses the list.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn push_entry(&self, entry: *mut ReclaimEntry<N>) {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe {
                (*entry).next = head;
            }
            if self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<N> Default for ReclamationList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Drop for ReclamationList<N> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            unsafe {
                let entry = Box::from_raw(current);
                drop(Box::from_raw(entry.node));
                current = entry.next;
            }
        }
    }
}

impl<N> fmt::Debug for ReclamationList<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReclamationList {{ pending: {} }}", self.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::ReclamationList;
    use crate::memory::HazardPointerRegistry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Tracked {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(drops: &Arc<AtomicUsize>) -> *mut Tracked {
        Box::into_raw(Box::new(Tracked {
            drops: drops.clone(),
        }))
    }

    #[test]
    fn test_guarded_node_is_kept() {
        let registry = HazardPointerRegistry::new(2);
        let list = ReclamationList::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let node = tracked(&drops);
        let handle = registry.acquire().unwrap();
        handle.mark(node);
        unsafe { list.add(node) };

        assert_eq!(list.reclaim_ready(&registry), 0);
        assert_eq!(list.pending(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        handle.clear();
        assert_eq!(list.reclaim_ready(&registry), 1);
        assert_eq!(list.pending(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_unguarded_nodes_are_freed() {
        let registry = HazardPointerRegistry::new(2);
        let list = ReclamationList::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let nodes: Vec<_> = (0..5).map(|_| tracked(&drops)).collect();
        let handle = registry.acquire().unwrap();
        handle.mark(nodes[2]);
        for &node in &nodes {
            unsafe { list.add(node) };
        }
        assert_eq!(list.reclaim_ready(&registry), 4);
        assert_eq!(list.pending(), 1);
        drop(handle);
        drop(list);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_add_during_reclaim() {
        let registry = Arc::new(HazardPointerRegistry::new(4));
        let list = Arc::new(ReclamationList::new());
        let drops = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let mut waitvec = Vec::new();

        for _ in 0..4 {
            let list = list.clone();
            let drops = drops.clone();
            waitvec.push(thread::spawn(move || {
                for _ in 0..2000 {
                    unsafe { list.add(tracked(&drops)) };
                }
            }));
        }
        let reclaimer = {
            let list = list.clone();
            let registry = registry.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut freed = 0;
                while !done.load(Ordering::SeqCst) {
                    freed += list.reclaim_ready(&registry);
                }
                freed
            })
        };

        for handle in waitvec {
            handle.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let freed = reclaimer.join().unwrap() + list.reclaim_ready(&registry);

        assert_eq!(freed, 8000);
        assert_eq!(list.pending(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 8000);
    }
}
