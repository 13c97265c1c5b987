//! Reliable multi-channel message passing over Serial RapidIO (SRIO) memory
//! windows and DMA.
//!
//! This crate implements a logical-channel transport between two SRIO peers.
//! There is no transport protocol underneath: each side exposes inbound
//! memory windows which the other side writes into using a DMA engine, and
//! everything else - geometry negotiation, sequencing, backpressure - is
//! carried by small control structures copied across those same windows.
//!
//! ## Architecture
//!
//! Assumes a Master and Slave architecture per physical SRIO link (a
//! **port**).  Each port multiplexes up to 4 named **channels**, each a
//! ring of fixed-size slots in the receiver's memory.
//!
//! Each side of a port owns three memory regions:
//! - **Receive region**: the peer DMAs channel data here, one cluster of
//!   `buf_num * buf_size` bytes per channel
//! - **Control receive region**: the peer DMAs handshake blocks and
//!   per-channel control-info blocks here
//! - **Control transmit region**: local mirrors of the blocks this side
//!   publishes, used as the DMA source
//!
//! Before any channel can be used, master and slave agree on channel
//! geometry and capability flags:
//! 1. The slave starts a listener thread polling its control receive region
//! 2. The master pushes a 256-byte head info block (INIT command plus every
//!    channel's buffer size and count) to the slave's control address
//! 3. The slave configures its windows to match and replies with a head
//!    response carrying `INIT_READY` and its capability bitmask
//! 4. Both sides derive the same flags from the bitmask: second handshake,
//!    align mode (256-byte vs true-size control blocks) and offset mode
//!    (absolute vs wrapping ring pointers)
//!
//! Once a channel is opened a dedicated worker thread polls the control-info
//! block the peer writes, accumulating how many slots have arrived.  Writers
//! track how many slots the peer has acknowledged and refuse to overrun the
//! ring, returning [`Error::WouldBlock`] instead.  Readers get zero-copy
//! access to the receive region and hand slots back with an explicit
//! acknowledgment.
//!
//! Only a single writer and single reader are supported per channel
//! direction.
//!
//! ## Modules
//!
//! - [`transport`] - [`TransportManager`], the public init/open/read/write API
//! - [`config`] - per-port configuration
//! - [`io`] - traits for the SRIO window driver and DMA engines, plus
//!   [`io::DmaRegion`]
//! - [`loopback`] - an in-process two-peer implementation of [`io`], used for
//!   testing
//! - [`channel`] - control-info block and the channel implementation
//! - [`port`] - port state and the handshake state machine
//! - [`ring`] - ring pointer arithmetic for both offset modes
//! - [`wire`] - handshake payloads, command codes and address layout
//! - [`window`] - window law computation
//! - [`registry`] - the static table of channel names
//! - [`dma`] - the fixed per-port pool of DMA engines
//!
//! ## Getting Started
//!
//! Both sides need an [`io::SrioDriver`] implementation.  Then:
//!
//! **Slave**:
//! 1. Create a [`TransportManager`] and call [`TransportManager::init()`]
//!    with a [`config::PortConfig::slave()`] configuration.  This returns
//!    immediately; the handshake completes when the master connects.
//! 2. [`TransportManager::open()`] channels by name, e.g. `"srio0-chan0"`.
//!    This waits for the handshake to complete.
//!
//! **Master**:
//! 1. Create a [`TransportManager`] and call [`TransportManager::init()`]
//!    with a [`config::PortConfig::master()`] configuration, listing each
//!    channel's geometry.  This blocks until the slave responds.
//! 2. [`TransportManager::open()`] channels by name.
//!
//! **Either side** can then [`TransportManager::write()`] from a physical
//! address (see [`TransportManager::alloc()`]), [`TransportManager::read()`]
//! received slots and [`TransportManager::ack_read()`] them once consumed.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod channel;
pub mod config;
pub mod dma;
pub mod io;
pub mod loopback;
pub mod port;
pub mod registry;
pub mod ring;
pub mod transport;
pub mod window;
pub mod wire;

pub use channel::Received;
pub use config::{ChannelGeometry, Mode, PollStrategy, PortConfig};
pub use registry::ChannelHandle;
pub use transport::TransportManager;
pub use wire::{Capabilities, FiberOp};

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad port or channel index, or invalid channel geometry
    Config(&'static str),
    /// Window or DMA driver setup failed
    HardwareInit,
    /// Peer did not acknowledge within the handshake timeout
    HandshakeTimeout,
    /// No channel with this name
    ChannelNotFound,
    /// Channel is already open
    ChannelAlreadyOpen,
    /// More unread slots than the ring holds - the writer outran the reader
    RingOverflow,
    /// Not enough peer-acknowledged space.  Not a failure: retry later.
    WouldBlock,
    /// DMA engine reported a failed transfer
    DmaTransferFailed,
    /// Invalid operation in the current role or state
    InvalidOperation,
    /// Port not initialized
    Uninit,
    /// Failed to start a background thread
    ThreadSpawn,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Config(reason) => write!(f, "configuration error: {reason}"),
            Error::HardwareInit => write!(f, "hardware initialization failed"),
            Error::HandshakeTimeout => write!(f, "handshake timed out"),
            Error::ChannelNotFound => write!(f, "channel not found"),
            Error::ChannelAlreadyOpen => write!(f, "channel already open"),
            Error::RingOverflow => write!(f, "ring overflow"),
            Error::WouldBlock => write!(f, "ring full, would block"),
            Error::DmaTransferFailed => write!(f, "DMA transfer failed"),
            Error::InvalidOperation => write!(f, "invalid operation"),
            Error::Uninit => write!(f, "port not initialized"),
            Error::ThreadSpawn => write!(f, "failed to spawn thread"),
        }
    }
}

impl std::error::Error for Error {}

/// Type to represent the result of a transport operation
pub type Result<T> = core::result::Result<T, Error>;
