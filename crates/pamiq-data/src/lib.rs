//! The timestamped producer/consumer pipeline that decouples inference
//! (producer, writes through a [`DataCollector`]) from training (consumer,
//! drains through a [`DataUser`] into a [`pamiq_buffers::DataBuffer`]).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use pamiq_buffers::DataBuffer;
use pamiq_clock::VirtualClock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("no data collector registered under name '{0}'")]
    NotFound(String),
    #[error("data collector '{0}' is already acquired")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// A capacity-bounded `(value, timestamp)` pair of deques. Overflow drops
/// the oldest entry, same as [`pamiq_buffers::SequentialBuffer`].
struct TimestampedQueue<T> {
    capacity: usize,
    items: VecDeque<(T, f64)>,
}

impl<T> TimestampedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: T, timestamp: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back((value, timestamp));
    }

    fn drain(self) -> VecDeque<(T, f64)> {
        self.items
    }
}

struct CollectorInner<T> {
    queue: TimestampedQueue<T>,
}

/// Producer-side handle: written from the inference thread via `collect`.
/// Cheaply clonable; all clones share the same underlying queue and mutex.
pub struct DataCollector<T> {
    inner: Arc<Mutex<CollectorInner<T>>>,
    clock: VirtualClock,
    capacity: usize,
}

impl<T> Clone for DataCollector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> DataCollector<T> {
    fn new(clock: VirtualClock, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorInner {
                queue: TimestampedQueue::new(capacity),
            })),
            clock,
            capacity,
        }
    }

    /// Stamps `sample` with the current virtual clock time and appends it.
    pub fn collect(&self, sample: T) {
        let mut inner = self.inner.lock();
        let ts = self.clock.time();
        inner.queue.push(sample, ts);
    }

    /// Atomically swaps in a fresh empty queue, returning the captured one.
    /// Called only by the owning [`DataUser`].
    fn swap(&self) -> TimestampedQueue<T> {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.queue, TimestampedQueue::new(self.capacity))
    }
}

/// Consumer-side handle: drained from the training thread via `update`.
/// Owns its buffer and exactly one [`DataCollector`].
pub struct DataUser<T> {
    collector: DataCollector<T>,
    buffer: Box<dyn DataBuffer<T> + Send>,
    timestamps: VecDeque<f64>,
}

impl<T: Send + 'static> DataUser<T> {
    pub fn new(clock: VirtualClock, buffer: Box<dyn DataBuffer<T> + Send>) -> Self {
        let capacity = buffer.max_size();
        Self {
            collector: DataCollector::new(clock, capacity),
            buffer,
            timestamps: VecDeque::with_capacity(capacity),
        }
    }

    /// A clonable producer-side handle to this user's collector.
    pub fn collector(&self) -> DataCollector<T> {
        self.collector.clone()
    }

    /// Swaps the collector's queue out, then drains samples and timestamps
    /// into the buffer and the aligned timestamp deque, in producer order.
    pub fn update(&mut self) {
        let queue = self.collector.swap();
        let max_size = self.buffer.max_size();
        for (sample, ts) in queue.drain() {
            self.buffer.add(sample);
            self.timestamps.push_back(ts);
        }
        while self.timestamps.len() > max_size {
            self.timestamps.pop_front();
        }
    }

    pub fn get_data(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.buffer.get_data()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Counts timestamps strictly greater than `t0`, scanning newest to
    /// oldest (timestamps are non-decreasing in insertion order).
    pub fn count_data_added_since(&self, t0: f64) -> usize {
        self.timestamps.iter().rev().take_while(|&&t| t > t0).count()
    }

    pub fn save_state(&self, path: &std::path::Path) -> pamiq_buffers::Result<()> {
        std::fs::create_dir_all(path)?;
        self.buffer.save_state(&path.join("buffer"))?;
        let bytes = bincode::serialize(&self.timestamps.iter().copied().collect::<Vec<_>>())
            .map_err(pamiq_buffers::BufferError::Bincode)?;
        std::fs::write(path.join("timestamps.bin"), bytes)?;
        Ok(())
    }

    pub fn load_state(&mut self, path: &std::path::Path) -> pamiq_buffers::Result<()> {
        self.buffer.load_state(&path.join("buffer"))?;
        let bytes = std::fs::read(path.join("timestamps.bin"))?;
        let timestamps: Vec<f64> =
            bincode::deserialize(&bytes).map_err(pamiq_buffers::BufferError::Bincode)?;
        self.timestamps = timestamps.into_iter().collect();
        Ok(())
    }
}

/// Named collection of [`DataUser`]s, all sharing one sample type `T`.
pub struct DataUsersDict<T> {
    users: HashMap<String, DataUser<T>>,
}

impl<T: Send + 'static> DataUsersDict<T> {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, user: DataUser<T>) {
        self.users.insert(name.into(), user);
    }

    pub fn get(&self, name: &str) -> Option<&DataUser<T>> {
        self.users.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DataUser<T>> {
        self.users.get_mut(name)
    }

    pub fn update_all(&mut self) {
        for user in self.users.values_mut() {
            user.update();
        }
    }

    /// The producer-facing view of the same names, each acquirable exactly
    /// once at a time.
    pub fn collectors_dict(&self) -> DataCollectorsDict<T> {
        let collectors = self
            .users
            .iter()
            .map(|(name, user)| (name.clone(), user.collector()))
            .collect();
        DataCollectorsDict {
            collectors,
            acquired: Mutex::new(HashMap::new()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.users.keys()
    }
}

impl<T: Send + 'static> Default for DataUsersDict<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived, producer-facing view over a [`DataUsersDict`]'s collectors.
/// `acquire` hands out a collector and marks it acquired; a second
/// acquisition before `release` is a conflict.
pub struct DataCollectorsDict<T> {
    collectors: HashMap<String, DataCollector<T>>,
    acquired: Mutex<HashMap<String, bool>>,
}

impl<T: Send + 'static> DataCollectorsDict<T> {
    pub fn acquire(&self, name: &str) -> Result<DataCollector<T>> {
        let collector = self
            .collectors
            .get(name)
            .ok_or_else(|| DataError::NotFound(name.to_string()))?;
        let mut acquired = self.acquired.lock();
        if *acquired.get(name).unwrap_or(&false) {
            return Err(DataError::Conflict(name.to_string()));
        }
        acquired.insert(name.to_string(), true);
        Ok(collector.clone())
    }

    pub fn release(&self, name: &str) {
        self.acquired.lock().insert(name.to_string(), false);
    }
}
