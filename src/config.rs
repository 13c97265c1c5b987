//! Per-port configuration.
//!
//! A process initializes each SRIO port it uses with a [`PortConfig`]:
//! - `Master`: knows every channel's geometry and announces it
//! - `Slave`: knows only how many channels to expect, and which
//!   capabilities to advertise
//!
//! ```rust
//! use srio_channels::config::{ChannelGeometry, PortConfig};
//!
//! let master = PortConfig::master(0, vec![ChannelGeometry::new(1024, 8); 2])
//!     .with_ids(0x11, 0x14);
//! assert!(master.validate().is_ok());
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::time::Duration;

use crate::wire::{
    BUF_SIZE_UNIT, Capabilities, MAX_CHANNELS_PER_PORT, PORT_NUM, SRIO_SYS_ADDR,
};
use crate::{Error, Result};

/// Default device IDs, indexed by port
const DEFAULT_DEVICE_IDS: [u32; PORT_NUM] = [0x11, 0x14];

/// Default time to wait for the peer to acknowledge a handshake or command
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between checks while waiting for an acknowledgment
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default slave receive region size
pub const DEFAULT_RX_REGION_SIZE: usize = 0x100_0000;

/// Largest buffer size the head info can carry
const MAX_BUF_SIZE: usize = u16::MAX as usize * BUF_SIZE_UNIT;

/// Buffer geometry of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    /// Bytes per slot, a multiple of 1 KiB
    pub buf_size: usize,
    /// Slots in the ring
    pub buf_num: u16,
}

impl ChannelGeometry {
    pub const fn new(buf_size: usize, buf_num: u16) -> Self {
        Self { buf_size, buf_num }
    }

    /// Bytes used by this channel's cluster
    pub const fn cluster_size(&self) -> usize {
        self.buf_size * self.buf_num as usize
    }

    fn validate(&self) -> Result<()> {
        if self.buf_size == 0 || self.buf_size % BUF_SIZE_UNIT != 0 {
            return Err(Error::Config("buffer size must be a non-zero multiple of 1 KiB"));
        }
        if self.buf_size > MAX_BUF_SIZE {
            return Err(Error::Config("buffer size too large"));
        }
        if self.buf_num == 0 {
            return Err(Error::Config("buffer count must be non-zero"));
        }
        Ok(())
    }
}

/// Role of this side of the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Master {
        /// Geometry of each channel, in channel index order
        channels: Vec<ChannelGeometry>,
    },
    Slave {
        /// Number of channels the master will announce
        chan_num: usize,
        /// Capability bitmask advertised to the master
        version: Capabilities,
        /// Size of the region allocated to receive channel data
        rx_region_size: usize,
    },
}

/// How background workers wait between polls of peer-written memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Busy-spin with a CPU spin-loop hint
    Spin,
    /// Yield to the OS scheduler
    Yield,
    /// Sleep
    Sleep(Duration),
}

impl PollStrategy {
    pub fn idle(&self) {
        match self {
            PollStrategy::Spin => core::hint::spin_loop(),
            PollStrategy::Yield => std::thread::yield_now(),
            PollStrategy::Sleep(d) => std::thread::sleep(*d),
        }
    }
}

/// Configuration of one SRIO port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Port index
    pub port: u8,
    pub mode: Mode,
    /// This side's device ID
    pub source_id: u32,
    /// The peer's device ID
    pub target_id: u32,
    /// Time to wait for a handshake, admin or channel-ready acknowledgment,
    /// and for the port to become ready when opening a channel
    pub handshake_timeout: Duration,
    /// Interval between checks while waiting for an acknowledgment
    pub poll_interval: Duration,
    /// How the slave listener and channel pollers wait between polls
    pub poll_strategy: PollStrategy,
    /// Pin background threads to fixed CPUs
    pub pin_threads: bool,
}

impl PortConfig {
    fn new(port: u8, mode: Mode) -> Self {
        let id = DEFAULT_DEVICE_IDS
            .get(port as usize)
            .copied()
            .unwrap_or(DEFAULT_DEVICE_IDS[0]);
        Self {
            port,
            mode,
            source_id: id,
            target_id: id,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            poll_interval: HANDSHAKE_POLL_INTERVAL,
            poll_strategy: PollStrategy::Yield,
            pin_threads: true,
        }
    }

    /// Master port announcing `channels`
    pub fn master(port: u8, channels: Vec<ChannelGeometry>) -> Self {
        Self::new(port, Mode::Master { channels })
    }

    /// Slave port expecting `chan_num` channels, advertising the default
    /// capabilities
    pub fn slave(port: u8, chan_num: usize) -> Self {
        Self::new(
            port,
            Mode::Slave {
                chan_num,
                version: Capabilities::default(),
                rx_region_size: DEFAULT_RX_REGION_SIZE,
            },
        )
    }

    pub fn with_ids(mut self, source_id: u32, target_id: u32) -> Self {
        self.source_id = source_id;
        self.target_id = target_id;
        self
    }

    /// Set the advertised capabilities.  Ignored by a master, which adopts
    /// the slave's.
    pub fn with_version(mut self, caps: Capabilities) -> Self {
        if let Mode::Slave { version, .. } = &mut self.mode {
            *version = caps;
        }
        self
    }

    /// Set the slave's receive region size.  Ignored by a master, which
    /// sizes it from the channel geometry.
    pub fn with_rx_region_size(mut self, size: usize) -> Self {
        if let Mode::Slave { rx_region_size, .. } = &mut self.mode {
            *rx_region_size = size;
        }
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_strategy(mut self, strategy: PollStrategy) -> Self {
        self.poll_strategy = strategy;
        self
    }

    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    pub fn is_master(&self) -> bool {
        matches!(self.mode, Mode::Master { .. })
    }

    /// Number of channels on this port
    pub fn chan_num(&self) -> usize {
        match &self.mode {
            Mode::Master { channels } => channels.len(),
            Mode::Slave { chan_num, .. } => *chan_num,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port as usize >= PORT_NUM {
            return Err(Error::Config("port number out of range"));
        }
        let chan_num = self.chan_num();
        if chan_num == 0 || chan_num > MAX_CHANNELS_PER_PORT {
            return Err(Error::Config("channel count out of range"));
        }
        match &self.mode {
            Mode::Master { channels } => {
                let mut total: u64 = 0;
                for geometry in channels {
                    geometry.validate()?;
                    total += geometry.cluster_size() as u64;
                }
                if total > (u32::MAX - SRIO_SYS_ADDR) as u64 {
                    return Err(Error::Config("channel clusters exceed SRIO address space"));
                }
            }
            Mode::Slave { rx_region_size, .. } => {
                if *rx_region_size == 0 {
                    return Err(Error::Config("receive region size must be non-zero"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PortConfig::slave(1, 4);
        assert_eq!(config.source_id, 0x14);
        assert_eq!(config.target_id, 0x14);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert!(!config.is_master());
        assert!(config.validate().is_ok());
        match config.mode {
            Mode::Slave { version, .. } => assert_eq!(version.bits(), 0x07),
            Mode::Master { .. } => panic!("expected slave"),
        }
    }

    #[test]
    fn rejects_bad_ports_and_counts() {
        let geometry = ChannelGeometry::new(1024, 8);
        assert!(matches!(
            PortConfig::master(2, vec![geometry]).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PortConfig::master(0, vec![]).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PortConfig::master(0, vec![geometry; 5]).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PortConfig::slave(0, 5).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_bad_geometry() {
        for geometry in [
            ChannelGeometry::new(0, 8),
            ChannelGeometry::new(1000, 8),
            ChannelGeometry::new(1024, 0),
            ChannelGeometry::new(0x1_0000 * 1024, 1),
        ] {
            assert!(
                PortConfig::master(0, vec![geometry]).validate().is_err(),
                "{geometry:?}"
            );
        }
        assert!(
            PortConfig::master(0, vec![ChannelGeometry::new(0xffff * 1024, 0xffff)])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn slave_only_settings_ignored_by_master() {
        let config = PortConfig::master(0, vec![ChannelGeometry::new(2048, 4)])
            .with_version(Capabilities::from_bits(0))
            .with_rx_region_size(1);
        assert_eq!(
            config.mode,
            Mode::Master {
                channels: vec![ChannelGeometry::new(2048, 4)]
            }
        );
        assert_eq!(config.chan_num(), 1);
    }
}
