//! Steal-victim selection
//!
//! An idle worker starts at a random victim and walks the remaining workers
//! in order, so every other worker is tried exactly once per steal attempt.
//! The randomness only spreads contention; correctness never depends on it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::worker::WorkerId;

/// Per-worker random source used for victim selection
pub(crate) struct StealRng(StdRng);

impl StealRng {
    /// Seed distinctly per scheduler instance and worker
    pub(crate) fn for_worker(scheduler_id: usize, worker: WorkerId) -> Self {
        let worker = (worker.as_usize() as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let seed = ((scheduler_id as u64) << 32) ^ worker;
        Self(StdRng::seed_from_u64(seed))
    }

    fn start(&mut self, num_workers: usize) -> usize {
        self.0.gen_range(0..num_workers)
    }
}

/// Iterator over the workers a thief should try, each at most once
pub(crate) struct Victims {
    thief: usize,
    num_workers: usize,
    start: usize,
    offset: usize,
}

impl Victims {
    pub(crate) fn new(thief: WorkerId, num_workers: usize, rng: &mut StealRng) -> Self {
        let start = if num_workers > 1 { rng.start(num_workers) } else { 0 };
        Self {
            thief: thief.as_usize(),
            num_workers,
            start,
            offset: 0,
        }
    }
}

impl Iterator for Victims {
    type Item = WorkerId;

    fn next(&mut self) -> Option<WorkerId> {
        while self.offset < self.num_workers {
            let index = (self.start + self.offset) % self.num_workers;
            self.offset += 1;
            if index != self.thief {
                return Some(WorkerId(index));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victims_cover_every_other_worker_once() {
        let mut rng = StealRng::for_worker(1, WorkerId(2));
        for _ in 0..32 {
            let mut victims: Vec<usize> = Victims::new(WorkerId(2), 5, &mut rng)
                .map(|id| id.as_usize())
                .collect();
            victims.sort_unstable();
            assert_eq!(victims, vec![0, 1, 3, 4]);
        }
    }

    #[test]
    fn test_single_worker_has_no_victims() {
        let mut rng = StealRng::for_worker(1, WorkerId(0));
        assert_eq!(Victims::new(WorkerId(0), 1, &mut rng).count(), 0);
    }

    #[test]
    fn test_start_varies() {
        let mut rng = StealRng::for_worker(7, WorkerId(0));
        let starts: std::collections::HashSet<usize> = (0..64)
            .filter_map(|_| Victims::new(WorkerId(0), 8, &mut rng).next())
            .map(|id| id.as_usize())
            .collect();
        assert!(starts.len() > 1);
    }
}
