//! Seeded random-walk generator, the stock numerical task shipped with the
//! work queue.
//!
//! Each point moves from the previous one by a uniform step in
//! `[-step, step]`, drawn from a seeded PRNG so a given `(start, len, step,
//! seed)` tuple always reproduces the same sequence. Points stream out in
//! chunks, with the cancellation flag checked once per chunk.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::Result;

use super::{TaskContext, WorkTask};

/// Points per emitted chunk.
const DEFAULT_CHUNK_LEN: usize = 64;

/// Bounded random walk with deterministic output per seed.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    pub start: f64,
    pub len: usize,
    pub step: f64,
    pub seed: u64,
    pub chunk_len: usize,
}

impl RandomWalk {
    pub fn new(start: f64, len: usize, step: f64, seed: u64) -> Self {
        Self {
            start,
            len,
            step,
            seed,
            chunk_len: DEFAULT_CHUNK_LEN,
        }
    }

    /// Compute the full sequence synchronously. The streaming task is a
    /// chunked wrapper around this.
    pub fn generate(&self) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut value = self.start;
        (0..self.len)
            .map(|_| {
                value += self.step * (rng.gen::<f64>() * 2.0 - 1.0);
                value
            })
            .collect()
    }
}

impl WorkTask for RandomWalk {
    fn name(&self) -> &str {
        "random-walk"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut value = self.start;
        let chunk_len = self.chunk_len.max(1);
        let mut chunk = Vec::with_capacity(chunk_len);

        for _ in 0..self.len {
            value += self.step * (rng.gen::<f64>() * 2.0 - 1.0);
            chunk.push(value);
            if chunk.len() == chunk_len {
                ctx.emit(std::mem::take(&mut chunk));
                if ctx.is_cancelled() {
                    return Ok(());
                }
            }
        }
        if !chunk.is_empty() {
            ctx.emit(chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkQueue, WorkQueueConfig, WorkUpdate};
    use std::time::{Duration, Instant};

    #[test]
    fn same_seed_reproduces_the_same_walk() {
        let walk = RandomWalk::new(0.0, 32, 0.5, 42);
        assert_eq!(walk.generate(), walk.generate());
        assert_ne!(
            walk.generate(),
            RandomWalk::new(0.0, 32, 0.5, 43).generate()
        );
    }

    #[test]
    fn every_point_moves_by_at_most_one_step() {
        let walk = RandomWalk::new(1.0, 100, 0.25, 7);
        let points = walk.generate();
        assert_eq!(points.len(), 100);
        let mut prev = 1.0;
        for point in points {
            assert!((point - prev).abs() <= 0.25 + f64::EPSILON);
            prev = point;
        }
    }

    #[test]
    fn streamed_chunks_concatenate_to_the_synchronous_walk() {
        let queue = WorkQueue::new(WorkQueueConfig::default());
        let walk = RandomWalk {
            chunk_len: 5,
            ..RandomWalk::new(0.0, 16, 0.5, 42)
        };
        let expected = walk.generate();
        let id = queue.submit(Box::new(walk)).expect("submit");

        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match queue.poll(id) {
                Some(WorkUpdate::Chunk { values, .. }) => collected.extend(values),
                Some(WorkUpdate::Done { .. }) => break,
                Some(other) => panic!("unexpected update: {other:?}"),
                None => {
                    assert!(Instant::now() < deadline, "walk never finished");
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
        assert_eq!(collected.len(), 16);
        assert_eq!(collected, expected);
    }
}
