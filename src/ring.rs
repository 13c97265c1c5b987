//! Ring pointer arithmetic.
//!
//! Writers and readers count slots with local, monotonically increasing
//! counters.  What they advertise to the peer depends on the port's offset
//! mode:
//! - [`Wrapping`]: the counter modulo the ring's slot count
//! - [`Absolute`]: the raw counter
//!
//! The observing side keeps a shadow of the last pointer it saw and turns
//! each fresh observation into a slot delta.  Both strategies implement
//! [`RingCounter`]; the mode is fixed once a port has negotiated it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU64, Ordering};

use crate::wire::Capabilities;

/// How ring pointers travel between peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMode {
    Wrapping,
    Absolute,
}

impl From<Capabilities> for OffsetMode {
    fn from(caps: Capabilities) -> Self {
        if caps.absolute_offset() {
            OffsetMode::Absolute
        } else {
            OffsetMode::Wrapping
        }
    }
}

impl OffsetMode {
    pub fn advertise(self, count: u64, buf_num: u64) -> u64 {
        match self {
            OffsetMode::Wrapping => Wrapping.advertise(count, buf_num),
            OffsetMode::Absolute => Absolute.advertise(count, buf_num),
        }
    }

    pub fn observe(self, last: u64, observed: u64, buf_num: u64) -> Option<u64> {
        match self {
            OffsetMode::Wrapping => Wrapping.observe(last, observed, buf_num),
            OffsetMode::Absolute => Absolute.observe(last, observed, buf_num),
        }
    }

    pub fn headroom(self) -> u64 {
        match self {
            OffsetMode::Wrapping => Wrapping.headroom(),
            OffsetMode::Absolute => Absolute.headroom(),
        }
    }
}

/// Pointer encoding strategy.
pub trait RingCounter: Copy + Send + 'static {
    /// Pointer value to publish for local count `count`.
    fn advertise(&self, count: u64, buf_num: u64) -> u64;

    /// Slots the peer advanced between a previous observation `last` and
    /// `observed`.  Returns `None` if the pointer has not moved, in which
    /// case the shadow must be left unchanged.
    fn observe(&self, last: u64, observed: u64, buf_num: u64) -> Option<u64>;

    /// Slots a writer must hold back so that a completely full ring is
    /// distinguishable from an empty one.
    fn headroom(&self) -> u64;
}

/// Pointers are slot indices modulo `buf_num`.  A pointer lower than the
/// last one seen means the peer wrapped past the end of the ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wrapping;

impl RingCounter for Wrapping {
    fn advertise(&self, count: u64, buf_num: u64) -> u64 {
        count % buf_num
    }

    fn observe(&self, last: u64, observed: u64, buf_num: u64) -> Option<u64> {
        if observed > last {
            Some(observed - last)
        } else if observed < last {
            Some(buf_num - last + observed)
        } else {
            None
        }
    }

    fn headroom(&self) -> u64 {
        1
    }
}

/// Pointers are raw slot counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absolute;

impl RingCounter for Absolute {
    fn advertise(&self, count: u64, _buf_num: u64) -> u64 {
        count
    }

    fn observe(&self, last: u64, observed: u64, _buf_num: u64) -> Option<u64> {
        (observed > last).then(|| observed - last)
    }

    fn headroom(&self) -> u64 {
        0
    }
}

/// Per-channel slot counters.  Process-local, never transmitted.
///
/// All counters are in slots.  `receive` is advanced by the channel's
/// polling worker, everything else by the caller's thread.
#[derive(Debug, Default)]
pub struct Counters {
    /// Slots sent by the local writer
    pub send: AtomicU64,
    /// Slots the peer has announced as written
    pub receive: AtomicU64,
    /// Slots consumed by the local reader
    pub read: AtomicU64,
    /// Slots acknowledged back to the peer
    pub freed: AtomicU64,
    /// Slots the local writer may have sent: ring capacity plus every slot
    /// the peer has acknowledged
    pub reserved: AtomicU64,
    /// Shadow of the peer's last advertised read pointer
    pub peer_read: AtomicU64,
    /// Shadow of the peer's last advertised write pointer
    pub peer_write: AtomicU64,
    /// Times the peer's writer reported the ring full
    pub peer_full: AtomicU64,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub send: u64,
    pub receive: u64,
    pub read: u64,
    pub freed: u64,
    pub reserved: u64,
    pub peer_read: u64,
    pub peer_write: u64,
    pub peer_full: u64,
}

impl Counters {
    /// Start a fresh session with the whole ring available to the writer
    pub fn reset(&self, buf_num: u64) {
        self.send.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.freed.store(0, Ordering::Relaxed);
        self.peer_read.store(0, Ordering::Relaxed);
        self.peer_write.store(0, Ordering::Relaxed);
        self.peer_full.store(0, Ordering::Relaxed);
        self.reserved.store(buf_num, Ordering::Relaxed);
        self.receive.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            send: self.send.load(Ordering::Relaxed),
            receive: self.receive.load(Ordering::Acquire),
            read: self.read.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            reserved: self.reserved.load(Ordering::Relaxed),
            peer_read: self.peer_read.load(Ordering::Relaxed),
            peer_write: self.peer_write.load(Ordering::Relaxed),
            peer_full: self.peer_full.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wrapping_rollover() {
        let ring = Wrapping;
        assert_eq!(ring.observe(0, 3, 8), Some(3));
        assert_eq!(ring.observe(6, 2, 8), Some(4));
        assert_eq!(ring.observe(5, 5, 8), None);
        assert_eq!(ring.advertise(13, 8), 5);
    }

    #[test]
    fn absolute_ignores_stale_pointers() {
        let ring = Absolute;
        assert_eq!(ring.observe(10, 14, 8), Some(4));
        assert_eq!(ring.observe(14, 14, 8), None);
        assert_eq!(ring.observe(14, 2, 8), None);
        assert_eq!(ring.advertise(13, 8), 13);
    }

    #[test]
    fn mode_from_capabilities() {
        assert_eq!(
            OffsetMode::from(Capabilities::from_bits(0x07)),
            OffsetMode::Absolute
        );
        assert_eq!(
            OffsetMode::from(Capabilities::from_bits(0x03)),
            OffsetMode::Wrapping
        );
        assert_eq!(OffsetMode::Wrapping.headroom(), 1);
        assert_eq!(OffsetMode::Absolute.headroom(), 0);
    }

    #[test]
    fn reset_frees_whole_ring() {
        let counters = Counters::default();
        counters.send.store(5, Ordering::Relaxed);
        counters.receive.store(9, Ordering::Relaxed);
        counters.reset(8);
        let snap = counters.snapshot();
        assert_eq!(snap.reserved, 8);
        assert_eq!(snap.send, 0);
        assert_eq!(snap.receive, 0);
    }

    fn replay(mode: OffsetMode, buf_num: u64, advances: &[u64]) -> u64 {
        let mut count = 0;
        let mut shadow = 0;
        let mut seen = 0;
        for &k in advances {
            count += k;
            let observed = mode.advertise(count, buf_num);
            if let Some(delta) = mode.observe(shadow, observed, buf_num) {
                seen += delta;
                shadow = observed;
            }
        }
        seen
    }

    proptest! {
        #[test]
        fn wrapping_observer_tracks_writer(
            buf_num in 2u64..512,
            raw in proptest::collection::vec(0u64..512, 0..64),
        ) {
            // A wrapping writer never gets a full ring ahead of the observer
            let advances: Vec<u64> = raw.iter().map(|k| k % buf_num).collect();
            let total: u64 = advances.iter().sum();
            prop_assert_eq!(replay(OffsetMode::Wrapping, buf_num, &advances), total);
        }

        #[test]
        fn absolute_observer_tracks_writer(
            buf_num in 1u64..512,
            advances in proptest::collection::vec(0u64..4096, 0..64),
        ) {
            let total: u64 = advances.iter().sum();
            prop_assert_eq!(replay(OffsetMode::Absolute, buf_num, &advances), total);
        }

        #[test]
        fn advertised_pointers_agree_after_k_slots(
            buf_num in 1u64..1024,
            start in 0u64..1_000_000,
            k in 0u64..10_000,
        ) {
            let wrapped = OffsetMode::Wrapping.advertise(start + k, buf_num);
            prop_assert_eq!(wrapped, (OffsetMode::Wrapping.advertise(start, buf_num) + k) % buf_num);
            prop_assert_eq!(OffsetMode::Absolute.advertise(start + k, buf_num), start + k);
        }
    }
}
