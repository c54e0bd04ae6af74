use std::cmp;
use std::hint;

use rand::Rng;

const MAX_BACKOFF: u32 = 1024;

/// Randomized exponential backoff between failed CAS attempts.
///
/// Only spins; an operation that backs off never sleeps or waits on another thread.
pub(crate) struct Backoff {
    limit: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { limit: 1 }
    }

    pub fn spin(&mut self) {
        let spins = rand::thread_rng().gen_range(0..=self.limit);
        for _ in 0..spins {
            hint::spin_loop();
        }
        self.limit = cmp::min(self.limit * 2, MAX_BACKOFF);
    }
}
