//! Per-epoch sampling across workers
//!
//! Each stream (labeled, unlabeled, unlabeled mix) owns an [`EpochSampler`]
//! with its own stream id, so the two unlabeled streams are shuffled
//! independently. The shuffled order is padded to a multiple of the world
//! size and strided by rank, then cut into full batches (the last partial
//! batch is dropped).

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Stream ids used to derive independent shuffles
pub const STREAM_LABELED: u64 = 0;
pub const STREAM_UNLABELED: u64 = 1;
pub const STREAM_UNLABELED_MIX: u64 = 2;
pub const STREAM_VAL: u64 = 3;

#[derive(Debug, Clone)]
pub struct EpochSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    stream: u64,
    shuffle: bool,
}

impl EpochSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64, stream: u64) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            seed,
            stream,
            shuffle: true,
        }
    }

    /// Keep dataset order (validation)
    pub fn sequential(mut self) -> Self {
        self.shuffle = false;
        self
    }

    fn stream_seed(&self, epoch: usize) -> u64 {
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((epoch as u64) << 8)
            .wrapping_add(self.stream)
    }

    /// Number of samples this rank sees per epoch
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    /// Full batches per epoch on this rank
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.num_samples() / batch_size
    }

    /// Sample indices of this rank for `epoch`
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.stream_seed(epoch));
            order.shuffle(&mut rng);
        }

        // Pad by wrapping around so every rank gets the same count
        let total = self.num_samples() * self.world_size;
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();

        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Full batches of indices for `epoch`
    pub fn batches(&self, epoch: usize, batch_size: usize) -> Vec<Vec<usize>> {
        if batch_size == 0 {
            return Vec::new();
        }
        self.indices(epoch)
            .chunks_exact(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Augmentation RNG for the `position`-th sample this rank draws
    pub fn sample_rng(&self, epoch: usize, position: usize) -> ChaCha8Rng {
        let seed = self
            .stream_seed(epoch)
            .wrapping_mul(31)
            .wrapping_add((self.rank as u64) << 32)
            .wrapping_add(position as u64);
        ChaCha8Rng::seed_from_u64(seed)
    }
}
