use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// Moves `value` onto the heap, reporting an allocation failure instead of aborting.
///
/// The allocation uses the global allocator with `Layout::new::<T>()`, which is what `Box`
/// expects, so the result can be freed with `Box::from_raw` like any other box.
pub(crate) fn try_box<T>(value: T) -> Result<Box<T>> {
    try_box_or_return(value).map_err(|(err, _)| err)
}

/// Like [`try_box`], but hands `value` back when it could not be moved.
pub(crate) fn try_box_or_return<T>(value: T) -> std::result::Result<Box<T>, (Error, T)> {
    let layout = Layout::new::<T>();
    #[cfg(test)]
    {
        if failure::injected() {
            return Err((Error::AllocationFailure { size: layout.size() }, value));
        }
    }
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    unsafe {
        match NonNull::new(alloc::alloc(layout) as *mut T) {
            Some(raw) => {
                ptr::write(raw.as_ptr(), value);
                Ok(Box::from_raw(raw.as_ptr()))
            }
            None => Err((Error::AllocationFailure { size: layout.size() }, value)),
        }
    }
}

/// Lets tests make the calling thread's allocations fail.
#[cfg(test)]
pub(crate) mod failure {
    use std::cell::Cell;

    thread_local! {
        static ALLOWED: Cell<Option<usize>> = Cell::new(None);
    }

    /// Lets the next `successes` allocations on this thread through and fails every one after
    /// them. `None` turns failures off again.
    pub(crate) fn fail_after(successes: Option<usize>) {
        ALLOWED.with(|allowed| allowed.set(successes));
    }

    pub(super) fn injected() -> bool {
        ALLOWED.with(|allowed| match allowed.get() {
            Some(0) => true,
            Some(left) => {
                allowed.set(Some(left - 1));
                false
            }
            None => false,
        })
    }
}
