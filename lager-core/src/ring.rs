//! Single-producer/single-consumer serial ring buffer (C5).
//!
//! The producer side runs from the serial-RX interrupt; the consumer side
//! runs from the main loop. The two halves communicate through two
//! single-word atomics (`write_index`, `read_index`) published with
//! release/acquire ordering, per the concurrency model in §5/§9: "a
//! reasonable strategy is two single-word atomics with release/acquire
//! ordering and a plain byte buffer; lock-free SPSC is sufficient because
//! exactly one writer and one reader exist." `next_read_index` is staged
//! state the consumer alone owns between calls, so it lives on the
//! `Consumer` side rather than in the shared storage.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The shared ring storage: a byte buffer plus the two indices the ISR and
/// the consumer publish to each other, and a spill counter.
///
/// `N` must be a multiple of the storage sector size (§4.5); this is
/// asserted in `new`.
pub struct RingStorage<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    spill_counter: AtomicUsize,
}

// SAFETY: `buf` is written only by `Producer::push_isr` within `[write_index,
// advance(write_index))` and read only by `Consumer::poll` within `[read_index,
// next_read_index)`; the two ranges never overlap by the ring's invariant
// (the ISR refuses to advance `write_index` onto `read_index`), so the two
// halves never alias a byte for concurrent access.
unsafe impl<const N: usize> Sync for RingStorage<N> {}

impl<const N: usize> RingStorage<N> {
    /// Creates an empty ring. `N` is asserted to be a multiple of 512 and
    /// at least 2, so `advance` always has somewhere to go.
    pub const fn new() -> Self {
        assert!(N >= 2);
        assert!(N % 512 == 0);
        RingStorage {
            buf: UnsafeCell::new([0u8; N]),
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            spill_counter: AtomicUsize::new(0),
        }
    }

    /// Splits the storage into a producer half (for the ISR) and a consumer
    /// half (for the main loop). Takes `&'a self` rather than `self` so the
    /// storage can live in a `static`.
    pub fn split<'a>(&'a self) -> (Producer<'a, N>, Consumer<'a, N>) {
        (Producer { ring: self }, Consumer { ring: self, next_read_index: 0 })
    }

    fn advance(i: usize) -> usize {
        if i + 1 == N {
            0
        } else {
            i + 1
        }
    }
}

/// The ISR-side handle. Call `push_isr` once per received byte; it never
/// blocks.
pub struct Producer<'a, const N: usize> {
    ring: &'a RingStorage<N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    /// Stores one byte, or drops it and counts a spill if the buffer is
    /// full. Must be called from the single serial-RX ISR only.
    pub fn push_isr(&mut self, byte: u8) {
        let w = self.ring.write_index.load(Ordering::Relaxed);
        let w_next = RingStorage::<N>::advance(w);
        let r = self.ring.read_index.load(Ordering::Acquire);
        if w_next == r {
            self.ring.spill_counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // SAFETY: `w` is not in `[r, next_read_index)` by the invariant
        // above, so the consumer is not reading this slot.
        unsafe {
            (*self.ring.buf.get())[w] = byte;
        }
        self.ring.write_index.store(w_next, Ordering::Release);
    }
}

/// The consumer-side handle, owned by the main loop.
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingStorage<N>,
    /// Staged by the previous `poll`; published as the new `read_index` on
    /// entry to the next `poll` (§4.5 step 1, "Release").
    next_read_index: usize,
}

/// A chunk of bytes ready for the consumer; valid until the next `poll`.
pub struct Chunk<'a> {
    pub data: &'a [u8],
}

impl<'a, const N: usize> Consumer<'a, N> {
    /// Returns the current spill count, for diagnostics.
    pub fn spill_count(&self) -> usize {
        self.ring.spill_counter.load(Ordering::Relaxed)
    }

    /// Implements the consumer chunk contract of §4.5.
    ///
    /// `now` and `deadline_ticks_from_now` let the caller supply its own
    /// tick source without this module depending on one; `now()` is called
    /// repeatedly to spin-sample time, the same way the real consumer
    /// spin-samples the write index.
    pub fn poll<F: FnMut() -> u32>(
        &mut self,
        mut now: F,
        timeout_ticks: u32,
        preferred_align: usize,
        min_preferred_chunk: usize,
        max_return: usize,
    ) -> Chunk<'a> {
        // Step 1: release the previous chunk.
        self.ring
            .read_index
            .store(self.next_read_index, Ordering::Release);
        let r = self.next_read_index;

        // Step 2: wait until there's useful progress, or the timeout fires.
        // `now()` is assumed monotonic modulo wraparound within one timeout
        // window, per §4.1; `wrapping_sub` keeps the comparison correct
        // across a wrap.
        let start = now();
        let mut available;
        loop {
            let w = self.ring.write_index.load(Ordering::Acquire);
            available = if w < r { N - r } else { w - r };
            if w < r || available >= min_preferred_chunk {
                break;
            }
            if now().wrapping_sub(start) >= timeout_ticks {
                break;
            }
        }

        // Step 3: alignment fixup.
        if preferred_align > 0 {
            let unalign = r % preferred_align;
            if available + unalign >= preferred_align {
                available -= (r + available) % preferred_align;
            }
        }

        // Step 4: cap.
        if available > max_return {
            available = max_return;
        }

        // Step 5: stage, don't publish.
        self.next_read_index = if r + available >= N {
            r + available - N
        } else {
            r + available
        };

        // SAFETY: `[r, r + available)` (mod N, non-wrapping here since step
        // 2 only returns a wrapped-available region up to `N - r`) was not
        // written by the producer past `read_index`'s old publication, and
        // the producer will not write into `[r, next_read_index)` again
        // until the next `poll` republishes `read_index`.
        let buf = unsafe { &*self.ring.buf.get() };
        Chunk { data: &buf[r..r + available] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        static RING: RingStorage<4096> = RingStorage::new();
        let (mut p, mut c) = RING.split();
        let input: heapless::Vec<u8, 2048> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        for &b in &input {
            p.push_isr(b);
        }
        assert_eq!(c.spill_count(), 0);
        let mut out: heapless::Vec<u8, 2048> = heapless::Vec::new();
        let mut tick = 0u32;
        while out.len() < input.len() {
            let chunk = c.poll(|| { tick += 1; tick }, 1000, 1, 1, 4096);
            if chunk.data.is_empty() {
                break;
            }
            out.extend_from_slice(chunk.data).unwrap();
        }
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn next_pull_starts_where_previous_ended() {
        static RING: RingStorage<1024> = RingStorage::new();
        let (mut p, mut c) = RING.split();
        for i in 0..300u32 {
            p.push_isr((i % 256) as u8);
        }
        let mut tick = 0u32;
        let first = c.poll(|| { tick += 1; tick }, 1000, 1, 1, 100);
        let first_len = first.data.len();
        assert!(first_len <= 100);
        let second = c.poll(|| { tick += 1; tick }, 1000, 1, 1, 4096);
        // second chunk must be the bytes immediately after the first.
        assert_eq!(second.data[0], ((first_len as u32) % 256) as u8);
    }

    #[test]
    fn slow_consumer_spills_without_corrupting_stored_bytes() {
        static RING: RingStorage<16>/* small on purpose */ = RingStorage::new();
        let (mut p, mut c) = RING.split();
        // Buffer holds at most N-1 = 15 bytes before the producer must spill.
        for i in 0..40u32 {
            p.push_isr((i % 256) as u8);
        }
        assert_eq!(c.spill_count(), 40 - 15);
        let mut tick = 0u32;
        let chunk = c.poll(|| { tick += 1; tick }, 1000, 1, 1, 4096);
        assert_eq!(chunk.data.len(), 15);
        for (i, &b) in chunk.data.iter().enumerate() {
            assert_eq!(b, (i as u32 % 256) as u8);
        }
    }

    #[test]
    fn alignment_fixup_rounds_down_to_boundary() {
        static RING: RingStorage<2048> = RingStorage::new();
        let (mut p, mut c) = RING.split();
        for i in 0..600u32 {
            p.push_isr(i as u8);
        }
        let mut tick = 0u32;
        let chunk = c.poll(|| { tick += 1; tick }, 1000, 512, 1, 4096);
        assert_eq!((0 + chunk.data.len()) % 512, 0);
    }

    #[test]
    fn poll_returns_within_timeout_when_nothing_arrives() {
        static RING: RingStorage<512> = RingStorage::new();
        let (_p, mut c) = RING.split();
        let mut tick = 0u32;
        let chunk = c.poll(|| { tick += 1; tick }, 50, 512, 2560, 4096);
        assert!(chunk.data.is_empty());
        assert!(tick <= 52);
    }
}
