//! Fixed-capacity single-producer/single-consumer ring of word blocks.
//!
//! The acquisition thread owns the [`BlockWriter`], the writer thread owns the
//! [`BlockReader`]. Slots are allocated once; blocks move in and out by swapping
//! their storage, so neither side allocates on the hot path.
//!
//! A full ring rejects the write and the caller drops the block: the DMA poll
//! must never wait on disk.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub type Word = u32;

/// Words from one completed DMA transfer.
#[derive(Debug, Clone)]
pub struct Block {
    words: Box<[Word]>,
    len: usize,
}

impl Block {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_words(&self) -> &[Word] {
        &self.words[..self.len]
    }

    /// The whole backing storage, for the DMA copy to fill.
    pub fn storage_mut(&mut self) -> &mut [Word] {
        &mut self.words
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.words.len());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copy as many of `words` as fit. Returns the number copied.
    pub fn fill_from(&mut self, words: &[Word]) -> usize {
        let n = words.len().min(self.words.len());
        self.words[..n].copy_from_slice(&words[..n]);
        self.len = n;
        n
    }
}

#[repr(align(128))]
struct CachePadded<T>(T);

struct Ring {
    // Producer position, written only by the writer handle.
    head: CachePadded<AtomicUsize>,
    // Consumer position, written only by the reader handle.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<Block>]>,
    block_words: usize,
    overflows: AtomicU64,
}

// SAFETY: a slot is touched by the producer only while it is outside
// [tail, head) and by the consumer only while it is inside; the Release/Acquire
// pair on head/tail hands ownership across. Only one BlockWriter and one
// BlockReader exist per ring.
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

impl Ring {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn occupancy(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

/// Create a queue of `capacity` blocks, each `block_words` words long.
pub fn block_queue(capacity: usize, block_words: usize) -> (BlockWriter, BlockReader) {
    assert!(capacity > 0, "block queue capacity must be non-zero");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(Block::with_capacity(block_words)))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        head: CachePadded(AtomicUsize::new(0)),
        tail: CachePadded(AtomicUsize::new(0)),
        slots,
        block_words,
        overflows: AtomicU64::new(0),
    });
    (
        BlockWriter {
            ring: Arc::clone(&ring),
        },
        BlockReader { ring },
    )
}

pub struct BlockWriter {
    ring: Arc<Ring>,
}

impl BlockWriter {
    /// Hand `block` to the consumer. On success `block` is left holding the
    /// slot's previous (stale) storage; on failure it is untouched and the
    /// overflow count goes up by one.
    pub fn try_write(&mut self, block: &mut Block) -> bool {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= ring.capacity() {
            ring.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &ring.slots[head % ring.capacity()];
        // SAFETY: the slot is outside [tail, head), the consumer will not read it
        // until head is published below.
        unsafe {
            let stored = &mut *slot.get();
            if stored.capacity() == block.capacity() {
                std::mem::swap(stored, block);
            } else {
                stored.fill_from(block.as_words());
            }
        }
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn is_full(&self) -> bool {
        self.ring.occupancy() >= self.ring.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.occupancy() == 0
    }

    pub fn len(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn block_words(&self) -> usize {
        self.ring.block_words
    }

    pub fn overflow_count(&self) -> u64 {
        self.ring.overflows.load(Ordering::Relaxed)
    }
}

pub struct BlockReader {
    ring: Arc<Ring>,
}

impl BlockReader {
    /// Take the oldest block into `block`. `block`'s old storage goes back into
    /// the ring for reuse.
    pub fn try_read(&mut self, block: &mut Block) -> bool {
        let ring = &*self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let head = ring.head.0.load(Ordering::Acquire);
        if head == tail {
            return false;
        }
        let slot = &ring.slots[tail % ring.capacity()];
        // SAFETY: the slot is inside [tail, head), the producer will not touch it
        // until tail is published below.
        unsafe {
            let stored = &mut *slot.get();
            if stored.capacity() == block.capacity() {
                std::mem::swap(stored, block);
            } else {
                block.fill_from(stored.as_words());
            }
            stored.clear();
        }
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// A block with the same storage size as the ring slots.
    pub fn new_block(&self) -> Block {
        Block::with_capacity(self.ring.block_words)
    }

    pub fn is_full(&self) -> bool {
        self.ring.occupancy() >= self.ring.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.occupancy() == 0
    }

    pub fn len(&self) -> usize {
        self.ring.occupancy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn block_of(words: &[Word], capacity: usize) -> Block {
        let mut block = Block::with_capacity(capacity);
        block.fill_from(words);
        block
    }

    #[test]
    fn reads_back_in_push_order() {
        let (mut tx, mut rx) = block_queue(4, 3);
        for i in 0..3u32 {
            let mut block = block_of(&[i, i + 10, i + 20], 3);
            assert!(tx.try_write(&mut block));
        }
        let mut out = rx.new_block();
        for i in 0..3u32 {
            assert!(rx.try_read(&mut out));
            assert_eq!(out.as_words(), &[i, i + 10, i + 20]);
        }
        assert!(!rx.try_read(&mut out));
        assert!(rx.is_empty());
    }

    #[test]
    fn full_queue_rejects_and_counts_each_drop() {
        let (mut tx, mut rx) = block_queue(2, 2);
        assert!(tx.try_write(&mut block_of(&[1, 1], 2)));
        assert!(tx.try_write(&mut block_of(&[2, 2], 2)));
        assert!(tx.is_full());

        let mut rejected = block_of(&[3, 3], 2);
        assert!(!tx.try_write(&mut rejected));
        assert_eq!(rejected.as_words(), &[3, 3]);
        assert_eq!(tx.overflow_count(), 1);
        assert!(!tx.try_write(&mut rejected));
        assert_eq!(tx.overflow_count(), 2);

        let mut out = rx.new_block();
        assert!(rx.try_read(&mut out));
        assert_eq!(out.as_words(), &[1, 1]);
        assert!(rx.try_read(&mut out));
        assert_eq!(out.as_words(), &[2, 2]);
        assert!(rx.is_empty());
    }

    #[test]
    fn partial_blocks_keep_their_length() {
        let (mut tx, mut rx) = block_queue(2, 8);
        let mut block = block_of(&[7, 8, 9], 8);
        assert!(tx.try_write(&mut block));
        let mut out = rx.new_block();
        assert!(rx.try_read(&mut out));
        assert_eq!(out.len(), 3);
        assert_eq!(out.as_words(), &[7, 8, 9]);
    }

    #[test]
    fn mismatched_storage_is_copied() {
        let (mut tx, mut rx) = block_queue(1, 4);
        assert!(tx.try_write(&mut block_of(&[1, 2, 3, 4, 5], 5)));
        let mut out = Block::with_capacity(2);
        assert!(rx.try_read(&mut out));
        assert_eq!(out.as_words(), &[1, 2]);
    }

    #[test]
    fn crosses_threads_in_order() {
        let (mut tx, mut rx) = block_queue(8, 1);
        let total = 10_000u32;
        let producer = thread::spawn(move || {
            let mut next = 0u32;
            let mut block = Block::with_capacity(1);
            while next < total {
                block.fill_from(&[next]);
                if tx.try_write(&mut block) {
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });
        let mut out = rx.new_block();
        let mut expected = 0u32;
        while expected < total {
            if rx.try_read(&mut out) {
                assert_eq!(out.as_words(), &[expected]);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
