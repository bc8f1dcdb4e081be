//! Bounded allocator of small integer identifiers, used for communicator
//! ids and memory-registration keys. Allocation returns the lowest free id
//! so ids stay dense and recycle quickly.

use crate::error::{RailError, RailResult};
use std::sync::Mutex;

const WORD_BITS: usize = 64;

/// Bitmap id pool. A capacity of zero builds a disabled pool whose
/// `allocate` fails cleanly, letting callers treat the pool as optional.
pub struct IdPool {
    capacity: usize,
    words: Mutex<Vec<u64>>,
}

impl IdPool {
    pub fn new(capacity: usize) -> IdPool {
        let num_words = (capacity + WORD_BITS - 1) / WORD_BITS;
        let mut words = vec![u64::MAX; num_words];

        // Mask off the bits beyond capacity in the tail word.
        let tail_bits = capacity % WORD_BITS;
        if tail_bits != 0 {
            words[num_words - 1] = (1u64 << tail_bits) - 1;
        }

        IdPool {
            capacity,
            words: Mutex::new(words),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate the lowest-numbered free id.
    pub fn allocate(&self) -> RailResult<u32> {
        if self.capacity == 0 {
            return Err(RailError::Resource("id pool disabled"));
        }

        let mut words = self.words.lock().unwrap();

        for (word_idx, word) in words.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1u64 << bit);
                return Ok((word_idx * WORD_BITS + bit) as u32);
            }
        }

        Err(RailError::Resource("id pool exhausted"))
    }

    /// Return an id to the pool. Freeing an id that is out of range or not
    /// currently allocated is an error.
    pub fn free(&self, id: u32) -> RailResult<()> {
        let id = id as usize;
        if id >= self.capacity {
            return Err(RailError::Invalid("id out of range"));
        }

        let mut words = self.words.lock().unwrap();
        let mask = 1u64 << (id % WORD_BITS);
        let word = &mut words[id / WORD_BITS];

        if *word & mask != 0 {
            return Err(RailError::Invalid("double free of id"));
        }

        *word |= mask;
        Ok(())
    }

    /// True when every id is free. Used by teardown assertions.
    pub fn is_full(&self) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let words = self.words.lock().unwrap();
        let tail_bits = self.capacity % WORD_BITS;

        words.iter().enumerate().all(|(idx, word)| {
            if tail_bits != 0 && idx == words.len() - 1 {
                *word == (1u64 << tail_bits) - 1
            } else {
                *word == u64::MAX
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_first() {
        let pool = IdPool::new(130);

        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 2);

        pool.free(1).unwrap();
        assert_eq!(pool.allocate().unwrap(), 1);
    }

    #[test]
    fn test_exhaustion_and_recycle() {
        let pool = IdPool::new(65);

        for expected in 0..65 {
            assert_eq!(pool.allocate().unwrap(), expected);
        }
        assert!(pool.allocate().is_err());

        pool.free(64).unwrap();
        assert_eq!(pool.allocate().unwrap(), 64);
    }

    #[test]
    fn test_double_free() {
        let pool = IdPool::new(8);
        let id = pool.allocate().unwrap();

        pool.free(id).unwrap();
        assert_eq!(pool.free(id), Err(RailError::Invalid("double free of id")));
    }

    #[test]
    fn test_out_of_range_free() {
        let pool = IdPool::new(8);
        assert_eq!(pool.free(8), Err(RailError::Invalid("id out of range")));
    }

    #[test]
    fn test_disabled_pool() {
        let pool = IdPool::new(0);
        assert!(pool.allocate().is_err());
        assert!(pool.is_full());
    }

    #[test]
    fn test_is_full_roundtrip() {
        let pool = IdPool::new(100);
        assert!(pool.is_full());

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(!pool.is_full());

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert!(pool.is_full());
    }
}
