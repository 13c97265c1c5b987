//! Logical channels: the control-info block and ring planning.
//!
//! See [`crate`] for a description of how channels are used.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

mod poller;
mod stream;

pub(crate) use poller::{PollTask, Poller};
pub use stream::{Channel, Received};

use core::mem::offset_of;

use crate::io::DmaRegion;
use crate::{Error, Result};

/// Size of the control-info block when published without align mode
pub const CTL_TRUE_SIZE: usize = core::mem::size_of::<ChannelCtlInfo>();

/// Control-info block for one direction of a channel.  Written by the peer
/// via DMA, read locally by the channel's polling worker and writer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCtlInfo {
    pub symbol: u32,

    /// Status flags - see [`CtlStatus`]
    pub status: u32,

    /// Writer's slot pointer, absolute or wrapped per the offset mode
    pub write_point: u64,

    /// Reader's acknowledged slot pointer, absolute or wrapped
    pub read_point: u64,
}

/// ChannelCtlInfo offsets
impl ChannelCtlInfo {
    pub const fn symbol_offset() -> usize {
        offset_of!(ChannelCtlInfo, symbol)
    }

    pub const fn status_offset() -> usize {
        offset_of!(ChannelCtlInfo, status)
    }

    pub const fn write_point_offset() -> usize {
        offset_of!(ChannelCtlInfo, write_point)
    }

    pub const fn read_point_offset() -> usize {
        offset_of!(ChannelCtlInfo, read_point)
    }

    pub fn load(region: &DmaRegion, offset: usize) -> Self {
        Self {
            symbol: region.read_u32(offset + Self::symbol_offset()),
            status: region.read_u32(offset + Self::status_offset()),
            write_point: region.read_u64(offset + Self::write_point_offset()),
            read_point: region.read_u64(offset + Self::read_point_offset()),
        }
    }
}

/// Channel status flags
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum CtlStatus {
    #[default]
    Normal = 0,
    /// Writer found the ring full
    Full = 1,
}

impl From<u32> for CtlStatus {
    fn from(value: u32) -> Self {
        match value {
            1 => CtlStatus::Full,
            _ => CtlStatus::Normal,
        }
    }
}

/// Slots needed to hold `len` bytes
pub fn slots_for(len: usize, buf_size: usize) -> u64 {
    len.div_ceil(buf_size) as u64
}

/// Where a read finds its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    /// Byte offset within the channel's cluster
    pub offset: usize,
    /// Bytes returned
    pub len: usize,
    /// Slots consumed
    pub slots: u64,
}

/// Work out the next read of up to `requested` bytes, given `receive` slots
/// announced by the peer and `read` slots already consumed.
///
/// Never crosses the end of the ring: a read that would is cut short and the
/// remainder is returned by the next read.
pub fn plan_read(
    receive: u64,
    read: u64,
    buf_num: u64,
    buf_size: usize,
    requested: usize,
) -> Result<ReadPlan> {
    let available = receive.saturating_sub(read);
    if available > buf_num {
        return Err(Error::RingOverflow);
    }

    let slot = read % buf_num;
    let available = available.min(buf_num - slot);
    let wanted = slots_for(requested, buf_size);

    let (slots, len) = if available > wanted {
        (wanted, requested)
    } else {
        (available, available as usize * buf_size)
    };

    Ok(ReadPlan {
        offset: slot as usize * buf_size,
        len,
        slots,
    })
}

/// One contiguous data DMA of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset from the caller's source address
    pub src_offset: usize,
    /// Byte offset within the peer's cluster
    pub dest_offset: usize,
    pub len: usize,
}

/// Where a write puts its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePlan {
    /// Slots the write advances the send counter by
    pub slots: u64,
    pub head: Segment,
    /// Remainder when the write crosses the end of the ring
    pub wrapped: Option<Segment>,
}

impl WritePlan {
    pub fn segments(&self) -> impl Iterator<Item = Segment> {
        core::iter::once(self.head).chain(self.wrapped)
    }
}

/// Work out a write of `len` bytes, given `send` slots already sent and
/// `reserved` slots the peer has made available.
///
/// Returns [`Error::WouldBlock`] if the ring lacks room, keeping `headroom`
/// slots back.  A write larger than the usable ring is never given room.
pub fn plan_write(
    send: u64,
    reserved: u64,
    headroom: u64,
    buf_num: u64,
    buf_size: usize,
    len: usize,
) -> Result<WritePlan> {
    let slots = slots_for(len, buf_size);
    if slots + headroom > buf_num || send + slots + headroom > reserved {
        return Err(Error::WouldBlock);
    }

    let slot = send % buf_num;
    let head_slots = slots.min(buf_num - slot);
    let head_len = len.min(head_slots as usize * buf_size);
    let head = Segment {
        src_offset: 0,
        dest_offset: slot as usize * buf_size,
        len: head_len,
    };
    let wrapped = (len > head_len).then(|| Segment {
        src_offset: head_len,
        dest_offset: 0,
        len: len - head_len,
    });

    Ok(WritePlan {
        slots,
        head,
        wrapped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KB: usize = 1024;

    #[test]
    fn ctl_info_layout() {
        assert_eq!(CTL_TRUE_SIZE, 24);
        assert_eq!(ChannelCtlInfo::status_offset(), 4);
        assert_eq!(ChannelCtlInfo::write_point_offset(), 8);
        assert_eq!(ChannelCtlInfo::read_point_offset(), 16);
        assert_eq!(CtlStatus::from(1), CtlStatus::Full);
        assert_eq!(CtlStatus::from(7), CtlStatus::Normal);
    }

    #[test]
    fn read_nothing_available() {
        let plan = plan_read(3, 3, 8, KB, 4 * KB).unwrap();
        assert_eq!(plan.slots, 0);
        assert_eq!(plan.len, 0);
        assert_eq!(plan.offset, 3 * KB);
    }

    #[test]
    fn read_fewer_than_requested() {
        let plan = plan_read(5, 2, 8, KB, 8 * KB).unwrap();
        assert_eq!(plan.slots, 3);
        assert_eq!(plan.len, 3 * KB);
        assert_eq!(plan.offset, 2 * KB);
    }

    #[test]
    fn read_more_available_than_requested() {
        let plan = plan_read(8, 0, 8, KB, 1500).unwrap();
        assert_eq!(plan.slots, 2);
        assert_eq!(plan.len, 1500);
        assert_eq!(plan.offset, 0);
    }

    #[test]
    fn read_stops_at_end_of_ring() {
        let plan = plan_read(10, 6, 8, KB, 8 * KB).unwrap();
        assert_eq!(plan.slots, 2);
        assert_eq!(plan.offset, 6 * KB);
        let plan = plan_read(10, 8, 8, KB, 8 * KB).unwrap();
        assert_eq!(plan.slots, 2);
        assert_eq!(plan.offset, 0);
    }

    #[test]
    fn read_overflow() {
        assert_eq!(plan_read(9, 0, 8, KB, KB), Err(Error::RingOverflow));
        assert!(plan_read(8, 0, 8, KB, KB).is_ok());
    }

    #[test]
    fn write_fills_ring_in_absolute_mode() {
        let plan = plan_write(0, 8, 0, 8, KB, 8 * KB).unwrap();
        assert_eq!(plan.slots, 8);
        assert_eq!(plan.wrapped, None);
        assert_eq!(plan_write(8, 8, 0, 8, KB, KB), Err(Error::WouldBlock));
        assert!(plan_write(8, 16, 0, 8, KB, KB).is_ok());
    }

    #[test]
    fn write_keeps_a_slot_in_wrapping_mode() {
        assert!(plan_write(0, 8, 1, 8, KB, 7 * KB).is_ok());
        assert_eq!(plan_write(7, 8, 1, 8, KB, KB), Err(Error::WouldBlock));
        assert_eq!(plan_write(0, 8, 1, 8, KB, 8 * KB), Err(Error::WouldBlock));
    }

    #[test]
    fn write_larger_than_ring() {
        assert_eq!(
            plan_write(0, 100, 0, 8, KB, 8 * KB + 1),
            Err(Error::WouldBlock)
        );
    }

    #[test]
    fn write_wraps_around_end() {
        let plan = plan_write(6, 14, 0, 8, KB, 3 * KB + 10).unwrap();
        assert_eq!(plan.slots, 4);
        assert_eq!(
            plan.head,
            Segment {
                src_offset: 0,
                dest_offset: 6 * KB,
                len: 2 * KB
            }
        );
        assert_eq!(
            plan.wrapped,
            Some(Segment {
                src_offset: 2 * KB,
                dest_offset: 0,
                len: KB + 10
            })
        );
        assert_eq!(plan.segments().map(|s| s.len).sum::<usize>(), 3 * KB + 10);
    }

    #[test]
    fn partial_last_slot_does_not_wrap() {
        let plan = plan_write(7, 16, 0, 8, KB, 100).unwrap();
        assert_eq!(plan.slots, 1);
        assert_eq!(plan.head.dest_offset, 7 * KB);
        assert_eq!(plan.wrapped, None);
    }

    proptest! {
        #[test]
        fn read_never_exceeds_ring(
            buf_num in 1u64..64,
            read in 0u64..10_000,
            ahead in 0u64..128,
            requested in 0usize..(128 * KB),
        ) {
            let receive = read + ahead;
            match plan_read(receive, read, buf_num, KB, requested) {
                Ok(plan) => {
                    prop_assert!(ahead <= buf_num);
                    prop_assert!(plan.slots <= ahead);
                    prop_assert!(plan.offset + plan.slots as usize * KB <= buf_num as usize * KB);
                }
                Err(e) => {
                    prop_assert_eq!(e, Error::RingOverflow);
                    prop_assert!(ahead > buf_num);
                }
            }
        }

        #[test]
        fn accepted_writes_stay_in_cluster(
            buf_num in 2u64..64,
            send in 0u64..10_000,
            len in 1usize..(64 * KB),
        ) {
            let reserved = send + buf_num;
            if let Ok(plan) = plan_write(send, reserved, 0, buf_num, KB, len) {
                prop_assert!(send + plan.slots <= reserved);
                for segment in plan.segments() {
                    prop_assert!(segment.dest_offset + segment.len <= buf_num as usize * KB);
                }
                prop_assert_eq!(plan.segments().map(|s| s.len).sum::<usize>(), len);
            }
        }
    }
}
