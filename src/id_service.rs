//! Monotonic id allocation shared by the assignment graph and paint tools.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LabelError, Result};
use crate::label::{BACKGROUND, TRANSPARENT};

/// Hands out ids strictly greater than anything issued or observed so far.
///
/// `next_free` is the smallest id that may still be handed out. It only ever
/// grows; reaching `TRANSPARENT` means the id space is exhausted.
#[derive(Debug)]
pub struct IdService {
    next_free: AtomicU64,
}

impl Default for IdService {
    fn default() -> Self {
        Self::new()
    }
}

impl IdService {
    pub fn new() -> Self {
        Self {
            next_free: AtomicU64::new(BACKGROUND + 1),
        }
    }

    /// Issue a fresh id.
    pub fn next(&self) -> Result<u64> {
        self.next_free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur >= TRANSPARENT { None } else { Some(cur + 1) }
            })
            .map_err(|_| LabelError::IdSpaceExhausted)
    }

    /// Mark every id up to and including `max_observed` as in use.
    /// `TRANSPARENT` is never an observed id and is ignored.
    pub fn invalidate(&self, max_observed: u64) {
        if max_observed == TRANSPARENT {
            return;
        }
        self.next_free.fetch_max(max_observed + 1, Ordering::AcqRel);
    }

    /// The id the next call to [`next`](Self::next) would return. Persisted as
    /// the `next_id` attribute.
    pub fn peek(&self) -> u64 {
        self.next_free.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let ids = IdService::new();
        let a = ids.next().unwrap();
        let b = ids.next().unwrap();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn invalidate_bumps_past_observed() {
        let ids = IdService::new();
        ids.invalidate(41);
        assert_eq!(ids.next().unwrap(), 42);
        // Lower observations never move the counter back.
        ids.invalidate(10);
        assert_eq!(ids.next().unwrap(), 43);
        ids.invalidate(TRANSPARENT);
        assert_eq!(ids.peek(), 44);
    }

    #[test]
    fn exhaustion_is_reported() {
        let ids = IdService::new();
        ids.invalidate(TRANSPARENT - 2);
        assert_eq!(ids.next().unwrap(), TRANSPARENT - 1);
        assert!(matches!(ids.next(), Err(LabelError::IdSpaceExhausted)));
        assert!(matches!(ids.next(), Err(LabelError::IdSpaceExhausted)));
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        use rayon::prelude::*;
        let ids = IdService::new();
        let mut issued: Vec<u64> = (0..1000)
            .into_par_iter()
            .map(|_| ids.next().unwrap())
            .collect();
        issued.sort_unstable();
        issued.dedup();
        assert_eq!(issued.len(), 1000);
    }
}
