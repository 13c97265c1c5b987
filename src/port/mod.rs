//! Port state: memory regions, address windows, negotiated capabilities and
//! per-channel layout of one SRIO link.
//!
//! A [`Port`] is created by `init` and lives until `finish`.  Both roles
//! allocate the same three regions and configure their control windows up
//! front.  The master knows its channel geometry and sizes its data windows
//! immediately; the slave does so when the master's head info arrives (see
//! [`handshake`]).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

mod handshake;

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{Mode, PortConfig};
use crate::dma::DmaPool;
use crate::io::{DmaRegion, PortInfo, SrioDriver, Window};
use crate::ring::{Counters, OffsetMode};
use crate::window::{CTL_LAW, window_law, window_size};
use crate::wire::{
    CTL_PACKET_SIZE, CTL_REGION_SIZE, Capabilities, LINK_STATUS_OFFSET, LINK_STATUS_SIZE,
    MAX_CHANNELS_PER_PORT, SRIO_CTL_ADDR, SRIO_SYS_ADDR, channel_ctl_offset,
};
use crate::{Error, Result};

/// Which side of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Offset, within a channel control slot, of the packet the peer writes
    /// and this side polls
    pub const fn read_slot(self) -> usize {
        match self {
            Role::Master => CTL_PACKET_SIZE,
            Role::Slave => 2 * CTL_PACKET_SIZE,
        }
    }

    /// Offset, within a channel control slot, of the packet this side
    /// publishes
    pub const fn write_slot(self) -> usize {
        match self {
            Role::Master => 2 * CTL_PACKET_SIZE,
            Role::Slave => CTL_PACKET_SIZE,
        }
    }
}

/// Lifecycle of a port as driven by admin commands
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    #[default]
    Uninit = 0,
    Ready = 1,
    Started = 2,
    Stopped = 3,
}

impl From<u8> for PortStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => PortStatus::Ready,
            2 => PortStatus::Started,
            3 => PortStatus::Stopped,
            _ => PortStatus::Uninit,
        }
    }
}

/// Progress of the initial geometry handshake
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    #[default]
    Uninit = 0,
    Connecting = 1,
    /// Master: pushing head info
    SendGeometry = 2,
    /// Master: waiting for `INIT_READY`
    AwaitAck = 3,
    /// Slave: listener waiting for head info
    AwaitGeometry = 4,
    /// Slave: configuring windows and answering
    SendAck = 5,
    Ready = 6,
    Failed = 7,
}

impl From<u8> for HandshakeState {
    fn from(value: u8) -> Self {
        match value {
            1 => HandshakeState::Connecting,
            2 => HandshakeState::SendGeometry,
            3 => HandshakeState::AwaitAck,
            4 => HandshakeState::AwaitGeometry,
            5 => HandshakeState::SendAck,
            6 => HandshakeState::Ready,
            7 => HandshakeState::Failed,
            _ => HandshakeState::Uninit,
        }
    }
}

/// Where a channel lives within its port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub buf_size: usize,
    pub buf_num: u64,
    /// Byte offset of the channel's cluster in the data window
    pub data_offset: usize,
}

impl ChannelLayout {
    pub fn cluster_size(&self) -> usize {
        self.buf_size * self.buf_num as usize
    }
}

/// Lay clusters out back to back, in channel order
fn layout_from(geometry: impl IntoIterator<Item = (usize, u64)>) -> Vec<ChannelLayout> {
    let mut data_offset = 0;
    geometry
        .into_iter()
        .map(|(buf_size, buf_num)| {
            let layout = ChannelLayout {
                buf_size,
                buf_num,
                data_offset,
            };
            data_offset += layout.cluster_size();
            layout
        })
        .collect()
}

/// Pin the calling thread to `cpu`.  Failure is logged, not fatal.
pub(crate) fn pin_current(cpu: usize) {
    if core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        trace!("Pinned {:?} to CPU {cpu}", std::thread::current().name());
    } else {
        warn!(
            "Failed to pin {:?} to CPU {cpu}",
            std::thread::current().name()
        );
    }
}

/// One SRIO link
pub struct Port<D: SrioDriver> {
    pub(crate) index: u8,
    pub(crate) role: Role,
    pub(crate) config: PortConfig,
    pub(crate) driver: Arc<D>,
    pub(crate) info: PortInfo,

    /// Peer writes channel data here
    pub(crate) rx: DmaRegion,
    /// Local mirrors of every block this side publishes
    pub(crate) ctl_tx: DmaRegion,
    /// Peer writes handshake and control-info blocks here
    pub(crate) ctl_rx: DmaRegion,

    pub(crate) dma: DmaPool<D::Dma>,

    caps: AtomicU64,
    /// Local address that reaches the peer's control region
    ctl_info_start: AtomicU64,
    layout: RwLock<Vec<ChannelLayout>>,
    ready: AtomicBool,
    status: AtomicU8,
    handshake: AtomicU8,

    pub(crate) counters: [Arc<Counters>; MAX_CHANNELS_PER_PORT],

    /// Serializes port control DMA
    pub(crate) admin: Mutex<()>,

    cancel: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<D: SrioDriver> Port<D> {
    /// Allocate regions, connect the link and configure everything that does
    /// not depend on the handshake.
    pub(crate) fn bring_up(driver: Arc<D>, config: PortConfig) -> Result<Self> {
        config.validate()?;
        let index = config.port;
        let role = if config.is_master() {
            Role::Master
        } else {
            Role::Slave
        };
        info!("Port {index}: bringing up as {role:?}");

        let hw = |what: &'static str| {
            move |e: D::Error| {
                error!("Port {index}: {what} failed: {e:?}");
                Error::HardwareInit
            }
        };

        let (rx_size, layout, caps) = match &config.mode {
            Mode::Master { channels } => {
                let layout = layout_from(
                    channels
                        .iter()
                        .map(|g| (g.buf_size, g.buf_num as u64)),
                );
                let total: u64 = layout.iter().map(|l| l.cluster_size() as u64).sum();
                // Capabilities come from the slave
                (window_size(window_law(total)) as usize, layout, 0)
            }
            Mode::Slave {
                rx_region_size,
                version,
                ..
            } => (*rx_region_size, Vec::new(), version.bits()),
        };

        let info = driver.connect(index).map_err(hw("connect"))?;
        debug!(
            "Port {index}: outbound range {:#x}+{:#x}",
            info.range_start, info.range_size
        );

        let rx = driver.alloc(rx_size).map_err(hw("rx alloc"))?;
        let ctl_tx = driver.alloc(CTL_REGION_SIZE).map_err(hw("ctl tx alloc"))?;
        let ctl_rx = driver.alloc(CTL_REGION_SIZE).map_err(hw("ctl rx alloc"))?;
        rx.zero(0, rx.len());
        ctl_tx.zero(0, ctl_tx.len());
        ctl_rx.zero(0, ctl_rx.len());

        driver
            .set_inbound_window(index, Window::Control, ctl_rx.phys(), SRIO_CTL_ADDR, CTL_LAW)
            .map_err(hw("control inbound window"))?;
        driver
            .set_device_id(index, config.source_id)
            .map_err(hw("set device id"))?;

        let dma = DmaPool::new(driver.as_ref(), index)?;

        let port = Self {
            index,
            role,
            driver,
            info,
            rx,
            ctl_tx,
            ctl_rx,
            dma,
            caps: AtomicU64::new(caps),
            ctl_info_start: AtomicU64::new(0),
            layout: RwLock::new(Vec::new()),
            ready: AtomicBool::new(false),
            status: AtomicU8::new(PortStatus::Uninit as u8),
            handshake: AtomicU8::new(HandshakeState::Connecting as u8),
            counters: core::array::from_fn(|_| Arc::new(Counters::default())),
            admin: Mutex::new(()),
            cancel: AtomicBool::new(false),
            listener: Mutex::new(None),
            config,
        };

        port.set_target_ids()?;
        if role == Role::Master {
            let total = layout.iter().map(|l| l.cluster_size() as u64).sum();
            port.configure_data_windows(SRIO_SYS_ADDR, SRIO_SYS_ADDR, total)?;
            port.set_layout(layout);
        }

        Ok(port)
    }

    /// Point the data windows at `recv`/`send` and the outbound control
    /// window just past the outbound data window.
    fn configure_data_windows(&self, recv: u32, send: u32, total: u64) -> Result<()> {
        let index = self.index;
        let hw = |what: &'static str| {
            move |e: D::Error| {
                error!("Port {index}: {what} failed: {e:?}");
                Error::HardwareInit
            }
        };

        let law = window_law(total);
        let ctl_info_start = self.info.range_start + window_size(law);
        debug!(
            "Port {index}: data window law {law} for {total:#x} bytes, control at {ctl_info_start:#x}"
        );

        self.driver
            .set_inbound_window(index, Window::Data, self.rx.phys(), recv, law)
            .map_err(hw("data inbound window"))?;
        self.driver
            .set_outbound_window(index, Window::Control, ctl_info_start, SRIO_CTL_ADDR, CTL_LAW)
            .map_err(hw("control outbound window"))?;
        self.driver
            .set_outbound_window(index, Window::Data, self.info.range_start, send, law)
            .map_err(hw("data outbound window"))?;
        self.ctl_info_start.store(ctl_info_start, Ordering::Release);

        if self.role == Role::Slave {
            self.set_target_ids()?;
        }
        Ok(())
    }

    fn set_target_ids(&self) -> Result<()> {
        for window in [Window::Data, Window::Control] {
            self.driver
                .set_target_id(self.index, window, self.config.target_id)
                .map_err(|e| {
                    error!("Port {}: set target id failed: {e:?}", self.index);
                    Error::HardwareInit
                })?;
        }
        Ok(())
    }

    fn set_layout(&self, layout: Vec<ChannelLayout>) {
        for (i, channel) in layout.iter().enumerate() {
            trace!("Port {}: channel {i} {channel:?}", self.index);
            self.counters[i].reset(channel.buf_num);
        }
        *self.layout.write() = layout;
    }

    /// Layout of channel `index`, if the port has that many channels
    pub(crate) fn layout(&self, index: usize) -> Option<ChannelLayout> {
        self.layout.read().get(index).copied()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits(self.caps.load(Ordering::Acquire))
    }

    pub(crate) fn set_capabilities(&self, caps: Capabilities) {
        debug!(
            "Port {}: capabilities {:#x} second_handshake {} align_256 {} absolute_offset {}",
            self.index,
            caps.bits(),
            caps.second_handshake(),
            caps.align_256(),
            caps.absolute_offset()
        );
        self.caps.store(caps.bits(), Ordering::Release);
    }

    pub fn offset_mode(&self) -> OffsetMode {
        OffsetMode::from(self.capabilities())
    }

    pub(crate) fn ctl_info_start(&self) -> u64 {
        self.ctl_info_start.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PortStatus {
        PortStatus::from(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: PortStatus) {
        debug!("Port {}: status {status:?}", self.index);
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn handshake_state(&self) -> HandshakeState {
        HandshakeState::from(self.handshake.load(Ordering::Acquire))
    }

    fn set_handshake(&self, state: HandshakeState) {
        trace!("Port {}: handshake {state:?}", self.index);
        self.handshake.store(state as u8, Ordering::Release);
    }

    fn mark_ready(&self) {
        self.set_handshake(HandshakeState::Ready);
        self.set_status(PortStatus::Ready);
        self.ready.store(true, Ordering::Release);
        info!("Port {}: ready", self.index);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait up to the handshake timeout for the port to become ready.
    pub(crate) fn wait_ready(&self) -> Result<()> {
        let start = Instant::now();
        while !self.is_ready() {
            if start.elapsed() > self.config.handshake_timeout {
                error!("Port {}: not ready after {:?}", self.index, start.elapsed());
                return Err(Error::HandshakeTimeout);
            }
            std::thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }

    /// Start every channel's session afresh.  Pointers the peer published
    /// during the old session are cleared so they are not counted again.
    pub(crate) fn reset_channels(&self) {
        let layout = self.layout.read();
        for (i, channel) in layout.iter().enumerate() {
            let packets = channel_ctl_offset(i) + CTL_PACKET_SIZE;
            self.ctl_rx.zero(packets, 2 * CTL_PACKET_SIZE);
            self.ctl_tx.zero(packets, 2 * CTL_PACKET_SIZE);
            self.counters[i].reset(channel.buf_num);
        }
        debug!("Port {}: reset {} channels", self.index, layout.len());
    }

    /// Copy of the link status block the peer maintains
    pub(crate) fn link_status(&self) -> [u8; LINK_STATUS_SIZE] {
        let mut status = [0; LINK_STATUS_SIZE];
        self.ctl_rx.read_bytes(LINK_STATUS_OFFSET, &mut status);
        status
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Stop the listener, if any.  Idempotent.
    pub(crate) fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(listener) = self.listener.lock().take() {
            if listener.join().is_err() {
                error!("Port {}: listener panicked", self.index);
            }
        }
        debug!("Port {}: shut down", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_opposite_packets() {
        assert_eq!(Role::Master.write_slot(), Role::Slave.read_slot());
        assert_eq!(Role::Slave.write_slot(), Role::Master.read_slot());
        assert_eq!(Role::Master.read_slot(), 0x100);
        assert_eq!(Role::Master.write_slot(), 0x200);
    }

    #[test]
    fn clusters_laid_out_back_to_back() {
        let layout = layout_from([(1024, 8), (2048, 4), (4096, 1)]);
        assert_eq!(layout[0].data_offset, 0);
        assert_eq!(layout[1].data_offset, 8 * 1024);
        assert_eq!(layout[2].data_offset, 16 * 1024);
        assert_eq!(layout[2].cluster_size(), 4096);
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            PortStatus::Uninit,
            PortStatus::Ready,
            PortStatus::Started,
            PortStatus::Stopped,
        ] {
            assert_eq!(PortStatus::from(status as u8), status);
        }
        assert_eq!(HandshakeState::from(7), HandshakeState::Failed);
        assert_eq!(HandshakeState::from(200), HandshakeState::Uninit);
    }
}
