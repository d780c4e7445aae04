//! Pooled byte buffers and single-owner leases.
//!
//! Receive paths churn through buffers at packet rate; allocating per frame
//! fragments the heap under load. The pool hands out regions drawn from
//! power-of-two size buckets and takes them back when the lease drops, so
//! steady-state traffic allocates nothing.
//!
//! Two handle types:
//!
//! - [`PooledBuf`]: a rented region at full bucket capacity, mutable, used by
//!   the channel as its receive scratch space.
//! - [`BufferLease`]: an immutable `(region, length)` view created by copying
//!   exactly one framed packet; this is what travels through the incoming
//!   queue to the dispatcher.
//!
//! Both return their region to the originating bucket exactly once, on drop
//! or explicit release (idempotent via `Option::take`).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::error::ConfigError;

/// Smallest bucket capacity. Requests below this rent from the first bucket.
const MIN_BUCKET_SIZE: usize = 256;

/// Buffer pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The requested size exceeds the pool's hard cap.
    ///
    /// Surfaced to the caller; never logged at error level.
    #[error("buffer request of {requested} bytes exceeds pool maximum of {max}")]
    RequestTooLarge {
        /// Bytes requested
        requested: usize,
        /// Pool `max_buffer_size`
        max: usize,
    },
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Hard cap on a single buffer; rents above this fail.
    pub max_buffer_size: usize,
    /// Maximum idle buffers retained per bucket; surplus returns are freed.
    pub max_pooled_per_bucket: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { max_buffer_size: 64 * 1024, max_pooled_per_bucket: 64 }
    }
}

impl BufferPoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_size == 0 {
            return Err(ConfigError::must_be_positive("max_buffer_size"));
        }
        if self.max_pooled_per_bucket == 0 {
            return Err(ConfigError::must_be_positive("max_pooled_per_bucket"));
        }
        Ok(())
    }
}

/// Counters for pool observability. Snapshot via [`BufferPool::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    /// Successful rents.
    pub rents: u64,
    /// Regions returned to a bucket.
    pub returns: u64,
    /// Rents that had to allocate because the bucket was empty.
    pub fresh_allocations: u64,
    /// Returned regions dropped because the bucket was full.
    pub discards: u64,
}

/// Bucketed, thread-safe byte-buffer pool.
///
/// Buckets hold regions of capacity `MIN_BUCKET_SIZE << i`; a rent rounds up
/// to the first bucket that fits. Bucket locks are plain mutexes with short
/// critical sections and are never held across an await.
#[derive(Debug)]
pub struct BufferPool {
    buckets: Vec<Mutex<Vec<Box<[u8]>>>>,
    max_buffer_size: usize,
    max_pooled_per_bucket: usize,
    rents: AtomicU64,
    returns: AtomicU64,
    fresh_allocations: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    /// Create a pool from validated configuration.
    pub fn new(config: BufferPoolConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let mut bucket_count = 1;
        while (MIN_BUCKET_SIZE << (bucket_count - 1)) < config.max_buffer_size {
            bucket_count += 1;
        }

        let buckets = (0..bucket_count).map(|_| Mutex::new(Vec::new())).collect();

        Ok(Arc::new(Self {
            buckets,
            max_buffer_size: config.max_buffer_size,
            max_pooled_per_bucket: config.max_pooled_per_bucket,
            rents: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            fresh_allocations: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }))
    }

    /// Hard cap on a single rented buffer.
    #[must_use]
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Rent a region of at least `min_size` bytes.
    ///
    /// # Errors
    ///
    /// - [`BufferError::RequestTooLarge`] if `min_size` exceeds the cap.
    pub fn rent(self: &Arc<Self>, min_size: usize) -> Result<PooledBuf, BufferError> {
        let index = self.bucket_index(min_size)?;
        let capacity = MIN_BUCKET_SIZE << index;

        let recycled = {
            // Lock scope kept to the pop alone.
            #[allow(clippy::unwrap_used)] // bucket mutexes are never poisoned: no panics while held
            let mut bucket = self.buckets[index].lock().unwrap();
            bucket.pop()
        };

        let buf = match recycled {
            Some(buf) => buf,
            None => {
                self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; capacity].into_boxed_slice()
            },
        };

        self.rents.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuf { region: Some(buf), pool: Arc::clone(self) })
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            rents: self.rents.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            fresh_allocations: self.fresh_allocations.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }

    fn bucket_index(&self, min_size: usize) -> Result<usize, BufferError> {
        if min_size > self.max_buffer_size {
            return Err(BufferError::RequestTooLarge {
                requested: min_size,
                max: self.max_buffer_size,
            });
        }
        let mut index = 0;
        while (MIN_BUCKET_SIZE << index) < min_size {
            index += 1;
        }
        Ok(index)
    }

    fn give_back(&self, region: Box<[u8]>) {
        let capacity = region.len();
        // Only exact bucket capacities come back; anything else was never ours.
        let mut index = 0;
        while (MIN_BUCKET_SIZE << index) < capacity {
            index += 1;
        }
        if (MIN_BUCKET_SIZE << index) != capacity || index >= self.buckets.len() {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }

        #[allow(clippy::unwrap_used)] // bucket mutexes are never poisoned: no panics while held
        let mut bucket = self.buckets[index].lock().unwrap();
        if bucket.len() < self.max_pooled_per_bucket {
            bucket.push(region);
            drop(bucket);
            self.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(bucket);
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A rented region at full bucket capacity.
///
/// Single-owner; the region returns to its bucket when this drops.
#[derive(Debug)]
pub struct PooledBuf {
    region: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Usable capacity of the region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.len())
    }

    /// Immutable view of the whole region.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.region.as_deref().unwrap_or(&[])
    }

    /// Mutable view of the whole region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.region.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.give_back(region);
        }
    }
}

/// An immutable `(region, length)` view over a pooled region.
///
/// Created by copying exactly one framed packet out of the receive buffer;
/// travels through the incoming queue to the dispatcher, which reads it and
/// lets it drop. Release happens exactly once, on drop or via
/// [`BufferLease::release`].
#[derive(Debug)]
pub struct BufferLease {
    region: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    /// Rent a fresh region and copy `bytes` into it.
    ///
    /// # Errors
    ///
    /// - [`BufferError::RequestTooLarge`] if `bytes` exceeds the pool cap.
    pub fn copy_from(pool: &Arc<BufferPool>, bytes: &[u8]) -> Result<Self, BufferError> {
        // An empty lease still occupies the smallest bucket; that keeps the
        // release path uniform.
        let mut buf = pool.rent(bytes.len().max(1))?;
        buf.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);

        let region = buf.region.take();
        Ok(Self { region, len: bytes.len(), pool: Arc::clone(pool) })
    }

    /// The leased bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            Some(region) => &region[..self.len],
            None => &[],
        }
    }

    /// Length of the leased bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the lease holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the region to the pool now instead of at drop.
    pub fn release(mut self) {
        if let Some(region) = self.region.take() {
            self.pool.give_back(region);
        }
    }
}

impl AsRef<[u8]> for BufferLease {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.give_back(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolConfig { max_buffer_size: 4096, max_pooled_per_bucket: 4 })
            .unwrap()
    }

    #[test]
    fn rent_rounds_up_to_bucket_capacity() {
        let pool = pool();
        let buf = pool.rent(300).unwrap();
        assert_eq!(buf.capacity(), 512);

        let buf = pool.rent(1).unwrap();
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn oversize_rent_is_rejected() {
        let pool = pool();
        let result = pool.rent(4097);
        assert_eq!(result.unwrap_err(), BufferError::RequestTooLarge { requested: 4097, max: 4096 });
    }

    #[test]
    fn exact_cap_rent_is_accepted() {
        let pool = pool();
        let buf = pool.rent(4096).unwrap();
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn dropped_buffers_are_recycled() {
        let pool = pool();
        {
            let _buf = pool.rent(256).unwrap();
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.returns, 1);
        assert_eq!(metrics.fresh_allocations, 1);

        // Second rent of the same size reuses the region.
        let _buf = pool.rent(256).unwrap();
        assert_eq!(pool.metrics().fresh_allocations, 1);
    }

    #[test]
    fn full_bucket_discards_surplus() {
        let pool = pool();
        let bufs: Vec<_> = (0..6).map(|_| pool.rent(256).unwrap()).collect();
        drop(bufs);

        let metrics = pool.metrics();
        assert_eq!(metrics.returns, 4);
        assert_eq!(metrics.discards, 2);
    }

    #[test]
    fn lease_copies_and_reports_exact_length() {
        let pool = pool();
        let lease = BufferLease::copy_from(&pool, b"hello").unwrap();
        assert_eq!(lease.as_slice(), b"hello");
        assert_eq!(lease.len(), 5);
        assert!(!lease.is_empty());
    }

    #[test]
    fn empty_lease_is_valid() {
        let pool = pool();
        let lease = BufferLease::copy_from(&pool, b"").unwrap();
        assert!(lease.is_empty());
        assert_eq!(lease.as_slice(), b"");
    }

    #[test]
    fn release_is_exactly_once() {
        let pool = pool();
        let lease = BufferLease::copy_from(&pool, b"abc").unwrap();
        lease.release();
        // One rent, one return; drop after release must not double-count.
        assert_eq!(pool.metrics().returns, 1);
    }
}
