//! Handshake payloads, command codes and the control address layout.
//!
//! Blocks are `#[repr(C)]` and moved field by field through volatile
//! accessors on [`DmaRegion`].  Only the field semantics matter to the peer;
//! both sides of a link run this crate so the layout is whatever these
//! structs produce.  The field the receiver polls on (`cmd`, `cmd_ack`) is
//! the last in each block, so a forward DMA copy lands it after the payload.
//!
//! Control receive region layout, per port:
//!
//! ```text
//! 0x0000  head info (slave) / head response (master), 256 bytes
//! 0x0100  link status written by the peer, 256 bytes
//! 0x1000  channel 0 control slot, 1 KiB
//!           +0x000  channel-ready ack (head response)
//!           +0x100  control-info packet 1
//!           +0x200  control-info packet 2
//! 0x1400  channel 1 control slot
//! ...
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::mem::offset_of;

use crate::io::DmaRegion;

/// Number of SRIO ports
pub const PORT_NUM: usize = 2;

/// Maximum channels per port
pub const MAX_CHANNELS_PER_PORT: usize = 4;

/// Size of the channel table
pub const CHAN_NUM_MAX: usize = PORT_NUM * MAX_CHANNELS_PER_PORT;

/// DMA engines per port
pub const PORT_DMA_NUM: usize = 8;

/// SRIO address of the data window
pub const SRIO_SYS_ADDR: u32 = 0x1000_0000;

/// SRIO address of the control window
pub const SRIO_CTL_ADDR: u32 = 0x0100_0000;

/// Size of the control memory allocated per port and direction
pub const CTL_REGION_SIZE: usize = 0x20_0000;

/// Offset of the first channel control slot
pub const CTL_HEAD_SIZE: usize = 0x1000;

/// Size of one channel control slot
pub const CTL_WIN_SIZE: usize = 0x400;

/// Size of one control-info packet within a channel slot
pub const CTL_PACKET_SIZE: usize = 0x100;

/// Size of handshake and admin command transfers
pub const HANDSHAKE_SIZE: usize = 256;

/// Offset of the peer-written link status block
pub const LINK_STATUS_OFFSET: usize = 256;

/// Size of the link status block
pub const LINK_STATUS_SIZE: usize = 256;

/// Unit in which buffer sizes travel in the head info
pub const BUF_SIZE_UNIT: usize = 0x400;

/// Magic value at the start of every block
pub const SYMBOL: u32 = 0xf1a1_0001;

/// Status value carried by handshake blocks
pub const STATUS: u32 = 0x0000_0001;

/// Version bitmask a slave advertises unless configured otherwise
pub const DEFAULT_VERSION: u64 = 0x07;

/// Offset of channel `index`'s control slot within a control region
pub const fn channel_ctl_offset(index: usize) -> usize {
    CTL_HEAD_SIZE + index * CTL_WIN_SIZE
}

/// Command codes carried in [`HeadInfo::cmd`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Init = 0x0000_0001,
    Start = 0x0000_0002,
    Stop = 0x0000_0003,
}

impl TryFrom<u32> for CommandCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(CommandCode::Init),
            0x02 => Ok(CommandCode::Start),
            0x03 => Ok(CommandCode::Stop),
            other => Err(other),
        }
    }
}

/// Acknowledgment codes carried in [`HeadResponse::cmd_ack`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    InitReady = 0x0000_0101,
    StartReady = 0x0000_0102,
    StopReady = 0x0000_0103,
    ChannelReady = 0x0000_0104,
}

/// Fiber operations an application can request once a port is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberOp {
    Start,
    Stop,
}

/// Administrative command sent from master to slave over the port's
/// control address.  Every command is answered with a head response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Announce channel geometry
    Init(Geometry),
    Start,
    Stop,
}

impl AdminCommand {
    pub fn code(&self) -> CommandCode {
        match self {
            AdminCommand::Init(_) => CommandCode::Init,
            AdminCommand::Start => CommandCode::Start,
            AdminCommand::Stop => CommandCode::Stop,
        }
    }

    /// Ack the slave answers this command with
    pub fn ready(&self) -> AckCode {
        match self {
            AdminCommand::Init(_) => AckCode::InitReady,
            AdminCommand::Start => AckCode::StartReady,
            AdminCommand::Stop => AckCode::StopReady,
        }
    }

    /// Decode a received head info.  Returns `None` if no command is pending.
    pub fn from_head(head: &HeadInfo) -> Option<Self> {
        match CommandCode::try_from(head.cmd).ok()? {
            CommandCode::Init => Some(AdminCommand::Init(head.channels)),
            CommandCode::Start => Some(AdminCommand::Start),
            CommandCode::Stop => Some(AdminCommand::Stop),
        }
    }
}

impl From<FiberOp> for AdminCommand {
    fn from(op: FiberOp) -> Self {
        match op {
            FiberOp::Start => AdminCommand::Start,
            FiberOp::Stop => AdminCommand::Stop,
        }
    }
}

/// Capability bitmask exchanged in the head response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u64);

impl Capabilities {
    /// Master must wait for a channel-ready ack before using a channel
    pub const SECOND_HANDSHAKE: u64 = 0x01;
    /// Control-info blocks are published as fixed 256-byte transfers
    pub const ALIGN_256: u64 = 0x02;
    /// Ring pointers are absolute counters rather than wrapped indices
    pub const ABSOLUTE_OFFSET: u64 = 0x04;

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn second_handshake(&self) -> bool {
        self.0 & Self::SECOND_HANDSHAKE != 0
    }

    pub const fn align_256(&self) -> bool {
        self.0 & Self::ALIGN_256 != 0
    }

    pub const fn absolute_offset(&self) -> bool {
        self.0 & Self::ABSOLUTE_OFFSET != 0
    }

    /// Number of bytes transferred when publishing a control-info block
    pub const fn ctl_publish_size(&self) -> usize {
        if self.align_256() {
            CTL_PACKET_SIZE
        } else {
            crate::channel::CTL_TRUE_SIZE
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self(DEFAULT_VERSION)
    }
}

/// One direction's buffer cluster.  `buf_size` is in [`BUF_SIZE_UNIT`]s.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cluster {
    pub addr: u32,
    pub buf_num: u16,
    pub buf_size: u16,
}

impl Cluster {
    pub fn buf_size_bytes(&self) -> usize {
        self.buf_size as usize * BUF_SIZE_UNIT
    }

    pub fn size_bytes(&self) -> usize {
        self.buf_size_bytes() * self.buf_num as usize
    }

    fn store(&self, region: &DmaRegion, offset: usize) {
        region.write_u32(offset + offset_of!(Cluster, addr), self.addr);
        region.write_u32(
            offset + offset_of!(Cluster, buf_num),
            (self.buf_num as u32) | ((self.buf_size as u32) << 16),
        );
    }

    fn load(region: &DmaRegion, offset: usize) -> Self {
        let sizes = region.read_u32(offset + offset_of!(Cluster, buf_num));
        Self {
            addr: region.read_u32(offset + offset_of!(Cluster, addr)),
            buf_num: sizes as u16,
            buf_size: (sizes >> 16) as u16,
        }
    }
}

/// Receive and send clusters of one channel
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClusters {
    pub recv: Cluster,
    pub send: Cluster,
}

/// Geometry of every channel of a port, as announced by the master
pub type Geometry = [ChannelClusters; MAX_CHANNELS_PER_PORT];

/// Master to slave handshake and admin command block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadInfo {
    pub symbol: u32,
    pub status: u32,
    pub channels: Geometry,
    pub cmd: u32,
}

impl HeadInfo {
    pub fn new(cmd: CommandCode, channels: Geometry) -> Self {
        Self {
            symbol: SYMBOL,
            status: STATUS,
            cmd: cmd as u32,
            channels,
        }
    }

    pub const fn cmd_offset() -> usize {
        offset_of!(HeadInfo, cmd)
    }

    pub const fn channels_offset() -> usize {
        offset_of!(HeadInfo, channels)
    }

    pub fn store(&self, region: &DmaRegion, offset: usize) {
        region.write_u32(offset + offset_of!(HeadInfo, symbol), self.symbol);
        region.write_u32(offset + offset_of!(HeadInfo, status), self.status);
        for (i, chan) in self.channels.iter().enumerate() {
            let base = offset + Self::channels_offset() + i * size_of::<ChannelClusters>();
            chan.recv.store(region, base + offset_of!(ChannelClusters, recv));
            chan.send.store(region, base + offset_of!(ChannelClusters, send));
        }
        // Command last, it is what the slave polls for
        region.write_u32(offset + Self::cmd_offset(), self.cmd);
    }

    pub fn load(region: &DmaRegion, offset: usize) -> Self {
        let mut channels = Geometry::default();
        for (i, chan) in channels.iter_mut().enumerate() {
            let base = offset + Self::channels_offset() + i * size_of::<ChannelClusters>();
            chan.recv = Cluster::load(region, base + offset_of!(ChannelClusters, recv));
            chan.send = Cluster::load(region, base + offset_of!(ChannelClusters, send));
        }
        Self {
            symbol: region.read_u32(offset + offset_of!(HeadInfo, symbol)),
            status: region.read_u32(offset + offset_of!(HeadInfo, status)),
            cmd: region.read_u32(offset + Self::cmd_offset()),
            channels,
        }
    }
}

/// Slave to master acknowledgment block, used for admin commands and for
/// channel-ready acks.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadResponse {
    pub symbol: u32,
    pub status: u32,
    pub capabilities: u64,
    pub cmd_ack: u32,
}

impl HeadResponse {
    pub fn new(ack: AckCode, capabilities: Capabilities) -> Self {
        Self {
            symbol: SYMBOL,
            status: STATUS,
            cmd_ack: ack as u32,
            capabilities: capabilities.bits(),
        }
    }

    pub const fn cmd_ack_offset() -> usize {
        offset_of!(HeadResponse, cmd_ack)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits(self.capabilities)
    }

    pub fn store(&self, region: &DmaRegion, offset: usize) {
        region.write_u32(offset + offset_of!(HeadResponse, symbol), self.symbol);
        region.write_u32(offset + offset_of!(HeadResponse, status), self.status);
        region.write_u64(
            offset + offset_of!(HeadResponse, capabilities),
            self.capabilities,
        );
        region.write_u32(offset + Self::cmd_ack_offset(), self.cmd_ack);
    }

    pub fn load(region: &DmaRegion, offset: usize) -> Self {
        Self {
            symbol: region.read_u32(offset + offset_of!(HeadResponse, symbol)),
            status: region.read_u32(offset + offset_of!(HeadResponse, status)),
            cmd_ack: region.read_u32(offset + Self::cmd_ack_offset()),
            capabilities: region.read_u64(offset + offset_of!(HeadResponse, capabilities)),
        }
    }
}

const _: () = assert!(size_of::<HeadInfo>() <= HANDSHAKE_SIZE);
const _: () = assert!(size_of::<HeadResponse>() <= HANDSHAKE_SIZE);
const _: () = assert!(
    channel_ctl_offset(MAX_CHANNELS_PER_PORT) <= CTL_REGION_SIZE,
    "channel control slots must fit the control region"
);
