//! Fixed-capacity sample containers with two overflow policies: strict FIFO
//! eviction ([`SequentialBuffer`]) and probabilistic random replacement
//! ([`RandomReplacementBuffer`]).
//!
//! Buffers are homogeneous over one element type `T`; there is no
//! dict-of-columns shape.

use std::collections::VecDeque;
use std::path::Path;

use rand::{Rng, RngCore, SeedableRng};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("replace_probability must be between 0.0 and 1.0 inclusive, got {0}")]
    InvalidReplaceProbability(f64),
    #[error("cannot specify both replace_probability and expected_survival_length")]
    ConflictingReplacementParams,
    #[error("io error reading/writing buffer state: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize buffer state: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// Common shape of the bounded buffers: add one sample at a time, read all
/// stored samples back in an implementation-defined order, and persist.
pub trait DataBuffer<T> {
    fn add(&mut self, data: T);
    fn get_data(&self) -> Vec<T>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn max_size(&self) -> usize;
    fn save_state(&self, path: &Path) -> Result<()>;
    fn load_state(&mut self, path: &Path) -> Result<()>;
}

/// FIFO buffer of capacity `max_size`; the oldest element is evicted on
/// overflow. `get_data` preserves insertion order.
pub struct SequentialBuffer<T> {
    queue: VecDeque<T>,
    max_size: usize,
}

impl<T> SequentialBuffer<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size),
            max_size,
        }
    }
}

impl<T: Clone + Serialize + DeserializeOwned> DataBuffer<T> for SequentialBuffer<T> {
    fn add(&mut self, data: T) {
        if self.queue.len() >= self.max_size {
            self.queue.pop_front();
        }
        if self.max_size > 0 {
            self.queue.push_back(data);
        }
    }

    fn get_data(&self) -> Vec<T> {
        self.queue.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let items: Vec<&T> = self.queue.iter().collect();
        let bytes = bincode::serialize(&items)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let items: Vec<T> = bincode::deserialize(&bytes)?;
        self.queue = items.into_iter().collect();
        while self.queue.len() > self.max_size {
            self.queue.pop_front();
        }
        Ok(())
    }
}

/// Euler-Mascheroni constant, used to derive a replacement probability from
/// an expected survival length.
const EULER_MASCHERONI: f64 = 0.5772156649015329;

/// Until full, appends. Once full, with probability `p` overwrites a
/// uniformly chosen slot, else drops the new sample.
pub struct RandomReplacementBuffer<T> {
    data: Vec<T>,
    max_size: usize,
    replace_probability: f64,
    rng: Box<dyn RngCore + Send>,
}

impl<T> RandomReplacementBuffer<T> {
    pub fn new(max_size: usize, replace_probability: f64) -> Result<Self> {
        Self::with_rng(
            max_size,
            replace_probability,
            Box::new(rand::rngs::StdRng::from_entropy()),
        )
    }

    /// Same as [`Self::new`] but with an injectable RNG source, so tests can
    /// assert on a specific sequence of replacement draws.
    pub fn with_rng(
        max_size: usize,
        replace_probability: f64,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&replace_probability) {
            return Err(BufferError::InvalidReplaceProbability(replace_probability));
        }
        Ok(Self {
            data: Vec::with_capacity(max_size),
            max_size,
            replace_probability,
            rng,
        })
    }

    /// Deterministic RNG (seeded [`rand::rngs::StdRng`]) for reproducible
    /// tests.
    pub fn with_seed(max_size: usize, replace_probability: f64, seed: u64) -> Result<Self> {
        Self::with_rng(
            max_size,
            replace_probability,
            Box::new(rand::rngs::StdRng::seed_from_u64(seed)),
        )
    }

    pub fn with_expected_survival_length(max_size: usize, survival_length: u64) -> Result<Self> {
        let p = Self::compute_replace_probability(max_size, survival_length);
        Self::new(max_size, p)
    }

    pub fn compute_replace_probability(max_size: usize, survival_length: u64) -> f64 {
        if max_size == 0 || survival_length == 0 {
            return 1.0;
        }
        let p = (max_size as f64 / survival_length as f64)
            * ((max_size as f64).ln() + EULER_MASCHERONI);
        p.clamp(0.0, 1.0)
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.max_size
    }

    pub fn replace_probability(&self) -> f64 {
        self.replace_probability
    }
}

impl<T: Clone + Serialize + DeserializeOwned> DataBuffer<T> for RandomReplacementBuffer<T> {
    fn add(&mut self, data: T) {
        if self.max_size == 0 {
            return;
        }
        if self.is_full() {
            let roll: f64 = self.rng.gen();
            if roll > self.replace_probability {
                return;
            }
            let index = self.rng.gen_range(0..self.max_size);
            self.data[index] = data;
        } else {
            self.data.push(data);
        }
    }

    fn get_data(&self) -> Vec<T> {
        self.data.clone()
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(&self.data)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let mut items: Vec<T> = bincode::deserialize(&bytes)?;
        items.truncate(self.max_size);
        self.data = items;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_caps_at_capacity() {
        let mut buf = SequentialBuffer::new(3);
        for i in 0..10 {
            buf.add(i);
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn sequential_preserves_fifo_order() {
        let mut buf = SequentialBuffer::new(3);
        for i in 0..5 {
            buf.add(i);
        }
        assert_eq!(buf.get_data(), vec![2, 3, 4]);
    }

    #[test]
    fn sequential_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq");
        let mut buf = SequentialBuffer::new(3);
        for i in 0..5 {
            buf.add(i);
        }
        buf.save_state(&path).unwrap();

        let mut restored: SequentialBuffer<i32> = SequentialBuffer::new(3);
        restored.load_state(&path).unwrap();
        assert_eq!(restored.get_data(), vec![2, 3, 4]);
    }

    #[test]
    fn random_replacement_fills_up_to_capacity() {
        let mut buf = RandomReplacementBuffer::new(2, 1.0).unwrap();
        buf.add("a");
        buf.add("b");
        assert!(buf.is_full());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn random_replacement_with_p_zero_never_mutates_full_buffer() {
        let mut buf = RandomReplacementBuffer::new(2, 0.0).unwrap();
        buf.add(1);
        buf.add(2);
        buf.add(3);
        buf.add(4);
        let mut data = buf.get_data();
        data.sort();
        assert_eq!(data, vec![1, 2]);
    }

    #[test]
    fn random_replacement_with_p_one_always_overwrites_exactly_one_slot() {
        let mut buf = RandomReplacementBuffer::new(2, 1.0).unwrap();
        buf.add(1);
        buf.add(2);
        buf.add(3);
        assert_eq!(buf.len(), 2);
        let data = buf.get_data();
        assert!(data.contains(&3));
        assert!(data.contains(&1) || data.contains(&2));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        assert!(RandomReplacementBuffer::<i32>::new(4, 1.5).is_err());
        assert!(RandomReplacementBuffer::<i32>::new(4, -0.1).is_err());
    }

    #[test]
    fn survival_length_derives_a_probability_in_range() {
        let p = RandomReplacementBuffer::<i32>::compute_replace_probability(100, 1000);
        assert!((0.0..=1.0).contains(&p));
    }

    struct AlwaysZeroRng;

    impl RngCore for AlwaysZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    #[test]
    fn random_replacement_with_seeded_rng_overwrites_index_zero() {
        let mut buf: RandomReplacementBuffer<char> =
            RandomReplacementBuffer::with_rng(2, 1.0, Box::new(AlwaysZeroRng)).unwrap();
        buf.add('A');
        buf.add('B');
        buf.add('C');
        assert_eq!(buf.get_data(), vec!['C', 'B']);
    }

    #[test]
    fn random_replacement_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rand");
        let mut buf = RandomReplacementBuffer::new(3, 0.0).unwrap();
        buf.add(1);
        buf.add(2);
        buf.save_state(&path).unwrap();

        let mut restored: RandomReplacementBuffer<i32> = RandomReplacementBuffer::new(3, 0.0).unwrap();
        restored.load_state(&path).unwrap();
        let mut data = restored.get_data();
        data.sort();
        assert_eq!(data, vec![1, 2]);
    }
}
