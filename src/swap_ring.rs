// Lock-free swap-request mailbox
//
// A fixed array of atomic slots through which any producer can tell the
// I/O thread "my read side is ready, please swap me" without locking. Each
// slot holds one machine word: either a writable marker tagged with a
// generation id (low bit set) or a pointer to the requesting ThreadLog
// (low bit clear, since every real ThreadLog is at least 2-byte aligned).
// The id in the marker detects reuse collisions when a slot's owner stalls
// for a full ring traversal.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::thread_log::ThreadLog;

/// Cache-aligned wrapper to prevent false sharing
#[repr(align(64))]
struct CacheAligned<T>(T);

/// Outcome of a consumer-side claim attempt on one slot.
pub(crate) enum Claim {
    /// The slot held a posted request; it has been returned to writable.
    Request(*const ThreadLog),
    /// The requesting producer has bumped the id counter but not finished
    /// its slot CAS yet. Retry later.
    NotPosted,
    /// The claim CAS failed, which the protocol rules out: nobody else
    /// writes a slot that holds a readable pointer. Carries the observed
    /// value for the fatal diagnostic.
    Broken(usize),
}

/// The global producer-to-I/O mailbox. Sized at `2 * max_threads` slots so
/// that a bounded number of post retries always finds a writable slot.
pub(crate) struct SwapRing {
    slots: Box<[AtomicUsize]>,
    swap_request_id: CacheAligned<AtomicUsize>,
}

impl SwapRing {
    pub(crate) fn new(max_threads: usize) -> Self {
        let slot_count = max_threads * 2;
        let slots: Vec<AtomicUsize> = (0..slot_count)
            .map(|id| AtomicUsize::new(Self::writable_marker(id)))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            swap_request_id: CacheAligned(AtomicUsize::new(0)),
        }
    }

    /// LSB of 1 marks the slot writable; the remaining bits carry the
    /// generation id the slot expects next.
    #[inline]
    pub(crate) fn writable_marker(id: usize) -> usize {
        (id << 1) | 0x1
    }

    /// Valid ThreadLog pointers never have their LSB set.
    #[inline]
    pub(crate) fn is_posted_request(value: usize) -> bool {
        value & 0x1 != 0x1
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Producer side: publish a swap request. Returns how many slots had to
    /// be skipped; a skip only happens when a different producer has just
    /// reserved the slot under a newer id, so with `2 * max_threads` slots
    /// and at most `max_threads` unread requests this terminates quickly.
    pub(crate) fn post(&self, tls: *const ThreadLog) -> usize {
        let tls_value = tls as usize;
        debug_assert!(Self::is_posted_request(tls_value));

        let mut retries = 0;
        loop {
            let id = self.swap_request_id.0.fetch_add(1, Ordering::Relaxed);
            let slot = id % self.slots.len();
            let expected = Self::writable_marker(id);
            match self.slots[slot].compare_exchange(
                expected,
                tls_value,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return retries,
                Err(_) => retries += 1,
            }
        }
    }

    /// First id not yet handed out. Everything in
    /// `[swap_request_id_read, pending_end)` is claimable by the consumer.
    pub(crate) fn pending_end(&self) -> usize {
        self.swap_request_id.0.load(Ordering::Acquire)
    }

    /// Consumer side: take the request out of `slot`, rearming it for
    /// `next_id` (the id that will map to this slot one lap later).
    pub(crate) fn claim(&self, slot: usize, next_id: usize) -> Claim {
        let value = self.slots[slot].load(Ordering::Acquire);
        if !Self::is_posted_request(value) {
            return Claim::NotPosted;
        }
        match self.slots[slot].compare_exchange(
            value,
            Self::writable_marker(next_id),
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Claim::Request(value as *const ThreadLog),
            Err(observed) => Claim::Broken(observed),
        }
    }
}
