//! Fixed-capacity multi-producer / single-consumer event ring.
//!
//! Producers are admitted by incrementing an occupancy counter; a producer that
//! would exceed capacity reverts its increment and the event is dropped (drop-new,
//! unread slots are never overwritten). An admitted producer reserves its slot
//! with one `fetch_add` on the write cursor, writes the event, then publishes the
//! slot. The single consumer walks the read cursor in FIFO order and stops at the
//! first slot that is reserved but not yet published, so a partially written
//! event is never observed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::event::{Event, EventKind, EventPayload, Severity};

pub const DEFAULT_CAPACITY: usize = 4096;

const EMPTY_EVENT: Event = Event {
    device_id: 0,
    kind: EventKind::Error,
    severity: Severity::Debug,
    timestamp_ns: 0,
    payload: EventPayload::none(),
};

struct Slot {
    published: AtomicBool,
    event: UnsafeCell<Event>,
}

pub struct EventRing {
    slots: Box<[Slot]>,
    occupancy: AtomicUsize,
    write: AtomicUsize,
    read: AtomicUsize,
}

// SAFETY: a slot's `event` cell is written only by the producer that reserved
// it (unique `write` position, admitted only while the previous occupant has
// been released) and read only by the consumer after observing `published`
// with Acquire ordering. Consumers are serialized by the pipeline.
unsafe impl Sync for EventRing {}
unsafe impl Send for EventRing {}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                published: AtomicBool::new(false),
                event: UnsafeCell::new(EMPTY_EVENT),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            occupancy: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots reserved and not yet consumed.
    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to append. Returns the occupancy after the push, or `None` when full.
    pub fn push(&self, event: Event) -> Option<usize> {
        let before = self.occupancy.fetch_add(1, Ordering::AcqRel);
        if before >= self.capacity() {
            self.occupancy.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        let pos = self.write.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[pos % self.capacity()];
        // SAFETY: admission guarantees the previous occupant of this slot was
        // released by the consumer; `pos` is unique to this producer.
        unsafe {
            *slot.event.get() = event;
        }
        slot.published.store(true, Ordering::Release);
        Some(before + 1)
    }

    /// Consume up to `max` published events in FIFO order.
    ///
    /// Must not be called concurrently with itself.
    pub(crate) fn drain_into(&self, out: &mut Vec<Event>, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            let pos = self.read.load(Ordering::Relaxed);
            if pos == self.write.load(Ordering::Acquire) {
                break;
            }
            let slot = &self.slots[pos % self.capacity()];
            if !slot.published.load(Ordering::Acquire) {
                // Reserved but still being written.
                break;
            }
            // SAFETY: `published` was observed with Acquire, so the producer's
            // write is visible; no producer can touch this slot until we release it.
            let event = unsafe { *slot.event.get() };
            slot.published.store(false, Ordering::Relaxed);
            self.read.store(pos + 1, Ordering::Relaxed);
            self.occupancy.fetch_sub(1, Ordering::AcqRel);
            out.push(event);
            taken += 1;
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ev(i: u32) -> Event {
        Event::new(i, EventKind::FrameAcquired, Severity::Debug, EventPayload::aux(i))
    }

    #[test]
    fn full_ring_drops_new_events() {
        let ring = EventRing::new(4);
        for i in 0..4 {
            assert!(ring.push(ev(i)).is_some());
        }
        assert!(ring.push(ev(99)).is_none());
        assert_eq!(ring.len(), 4);

        let mut out = Vec::new();
        ring.drain_into(&mut out, usize::MAX);
        let ids: Vec<u32> = out.iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_in_fifo_order() {
        let ring = EventRing::new(3);
        let mut out = Vec::new();
        for round in 0..5u32 {
            for i in 0..3 {
                ring.push(ev(round * 10 + i)).unwrap();
            }
            out.clear();
            assert_eq!(ring.drain_into(&mut out, 2), 2);
            assert_eq!(ring.drain_into(&mut out, 10), 1);
            let ids: Vec<u32> = out.iter().map(|e| e.device_id).collect();
            assert_eq!(ids, vec![round * 10, round * 10 + 1, round * 10 + 2]);
        }
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let ring = Arc::new(EventRing::new(DEFAULT_CAPACITY));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ring = ring.clone();
                let accepted = accepted.clone();
                std::thread::spawn(move || {
                    for i in 0..1250u32 {
                        if ring.push(ev(t * 10_000 + i)).is_some() {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let accepted = accepted.load(Ordering::Relaxed);
        assert_eq!(accepted, DEFAULT_CAPACITY);
        let mut out = Vec::new();
        assert_eq!(ring.drain_into(&mut out, usize::MAX), accepted);
    }

    #[test]
    fn producers_and_consumer_race_across_wraparound() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 20_000;

        let ring = Arc::new(EventRing::new(64));
        let done = Arc::new(AtomicBool::new(false));

        let consumer = {
            let ring = ring.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut out = Vec::new();
                loop {
                    let finished = done.load(Ordering::Acquire);
                    ring.drain_into(&mut out, 16);
                    if finished && ring.is_empty() {
                        break;
                    }
                    std::thread::yield_now();
                }
                out
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut accepted = Vec::new();
                    let mut dropped = 0u32;
                    for i in 0..PER_PRODUCER {
                        match ring.push(ev_tagged(t, i)) {
                            Some(_) => accepted.push(i),
                            None => dropped += 1,
                        }
                    }
                    (accepted, dropped)
                })
            })
            .collect();
        let results: Vec<(Vec<u32>, u32)> =
            producers.into_iter().map(|h| h.join().unwrap()).collect();
        done.store(true, Ordering::Release);
        let drained = consumer.join().unwrap();

        let mut total_accepted = 0usize;
        for (t, (accepted, dropped)) in results.iter().enumerate() {
            assert_eq!(accepted.len() as u32 + dropped, PER_PRODUCER);
            total_accepted += accepted.len();
            let seen: Vec<u32> = drained
                .iter()
                .filter(|e| e.device_id == t as u32)
                .map(|e| match e.payload.view() {
                    crate::event::PayloadView::Aux(i) => i,
                    other => panic!("unexpected payload {:?}", other),
                })
                .collect();
            // Same values in the same order: no loss, no duplicates, per-producer FIFO.
            assert_eq!(&seen, accepted, "producer {}", t);
        }
        assert_eq!(drained.len(), total_accepted);
        assert!(total_accepted > 0);
        assert!(ring.is_empty());
    }

    fn ev_tagged(producer: u32, i: u32) -> Event {
        Event::new(producer, EventKind::FrameAcquired, Severity::Debug, EventPayload::aux(i))
    }
}
