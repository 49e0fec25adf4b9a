//! Lossy frequency sampling.
//!
//! A fixed-capacity ring that records events without ever blocking the
//! recording thread: when the buffer is contended, the sample is simply
//! dropped. Consumers take a digest — distinct entries with occurrence
//! counts — to drive rebalancing decisions and windowed hit rates.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

pub struct FrequencyBuffer<T> {
    slots: Vec<Mutex<Option<T>>>,
    cursor: AtomicUsize,
}

impl<T: Clone + Eq + Hash> FrequencyBuffer<T> {
    /// Capacity is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record an event. Lossy: if the target slot is contended the sample is
    /// discarded rather than waiting.
    pub fn insert_record(&self, event: T) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) & (self.slots.len() - 1);
        if let Some(mut slot) = self.slots[idx].try_lock() {
            *slot = Some(event);
        }
    }

    /// Occurrence counts of the distinct recorded entries, least frequent
    /// first.
    pub fn simple_digest(&self) -> Vec<(T, u64)> {
        let mut counts: HashMap<T, u64> = HashMap::new();
        for slot in &self.slots {
            if let Some(slot) = slot.try_lock() {
                if let Some(event) = slot.as_ref() {
                    *counts.entry(event.clone()).or_insert(0) += 1;
                }
            }
        }
        let mut digest: Vec<(T, u64)> = counts.into_iter().collect();
        digest.sort_by_key(|(_, count)| *count);
        digest
    }

    /// Total number of currently occupied slots.
    pub fn sample_count(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.try_lock().map(|g| g.is_some()).unwrap_or(false))
            .count() as u64
    }

    pub fn clear(&self) {
        for slot in &self.slots {
            *slot.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(FrequencyBuffer::<u8>::new(100).capacity(), 128);
        assert_eq!(FrequencyBuffer::<u8>::new(1).capacity(), 2);
    }

    #[test]
    fn test_digest_counts_and_order() {
        let buffer = FrequencyBuffer::new(64);
        for _ in 0..10 {
            buffer.insert_record(1u64);
        }
        for _ in 0..3 {
            buffer.insert_record(2u64);
        }
        let digest = buffer.simple_digest();
        assert_eq!(digest.len(), 2);
        // least frequent first
        assert_eq!(digest[0].0, 2);
        assert_eq!(digest[0].1, 3);
        assert_eq!(digest[1].0, 1);
        assert_eq!(digest[1].1, 10);
    }

    #[test]
    fn test_overwrites_when_full() {
        let buffer = FrequencyBuffer::new(4);
        for i in 0..100u64 {
            buffer.insert_record(i);
        }
        // only the last few samples survive
        assert!(buffer.sample_count() <= 4);
    }

    #[test]
    fn test_clear() {
        let buffer = FrequencyBuffer::new(8);
        buffer.insert_record(7u32);
        buffer.clear();
        assert!(buffer.simple_digest().is_empty());
        assert_eq!(buffer.sample_count(), 0);
    }
}
