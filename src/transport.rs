//! The transport manager - owns every port and open channel of a process.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;

use crate::channel::{Channel, Received};
use crate::config::PortConfig;
use crate::io::{DmaRegion, SrioDriver};
use crate::port::{HandshakeState, Port, PortStatus, Role};
use crate::registry::{ChannelHandle, Registry};
use crate::ring::CounterSnapshot;
use crate::wire::{CHAN_NUM_MAX, FiberOp, LINK_STATUS_SIZE, PORT_NUM};
use crate::{Error, Result};

/// Entry point to the transport.
///
/// Example usage, over the in-process loopback fabric:
///
/// ```rust,no_run
/// use srio_channels::loopback::Fabric;
/// use srio_channels::{ChannelGeometry, PortConfig, TransportManager};
///
/// let (master_io, slave_io) = Fabric::pair();
/// let slave = TransportManager::new(slave_io);
/// slave.init(PortConfig::slave(0, 1).with_ids(0x14, 0x11))?;
///
/// let master = TransportManager::new(master_io);
/// master.init(
///     PortConfig::master(0, vec![ChannelGeometry::new(1024, 8)]).with_ids(0x11, 0x14),
/// )?;
///
/// let rx = slave.open("srio0-chan0")?;
/// let tx = master.open("srio0-chan0")?;
///
/// let src = master.alloc(1024)?;
/// src.write_bytes(0, b"hello");
/// master.write(tx, src.phys(), 5)?;
///
/// let received = slave.read(rx, 1024)?;
/// // ... use received.data() ...
/// slave.ack_read(rx, received.slots())?;
/// # Ok::<(), srio_channels::Error>(())
/// ```
pub struct TransportManager<D: SrioDriver> {
    driver: Arc<D>,
    registry: Registry,
    ports: [RwLock<Option<Arc<Port<D>>>>; PORT_NUM],
    channels: [RwLock<Option<Arc<Channel<D>>>>; CHAN_NUM_MAX],
    finished: bool,
}

impl<D: SrioDriver> TransportManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            registry: Registry::new(),
            ports: core::array::from_fn(|_| RwLock::new(None)),
            channels: core::array::from_fn(|_| RwLock::new(None)),
            finished: false,
        }
    }

    fn port(&self, port: u8) -> Result<Arc<Port<D>>> {
        self.ports
            .get(port as usize)
            .ok_or(Error::Config("port number out of range"))?
            .read()
            .clone()
            .ok_or(Error::Uninit)
    }

    fn channel(&self, handle: ChannelHandle) -> Result<Arc<Channel<D>>> {
        self.channels
            .get(handle.raw())
            .and_then(|slot| slot.read().clone())
            .ok_or(Error::InvalidOperation)
    }

    /// Initialize a port.
    ///
    /// A master port pushes its channel geometry to the slave and blocks until
    /// the slave acknowledges it, failing with [`Error::HandshakeTimeout`] if
    /// it does not.  A slave port starts listening for the master and returns
    /// straight away.
    ///
    /// Arguments:
    /// - `config`: Configuration of the port
    pub fn init(&self, config: PortConfig) -> Result<()> {
        config.validate()?;
        let index = config.port;
        let mut slot = self.ports[index as usize].write();
        if slot.is_some() {
            warn!("Port {index} already initialized");
            return Err(Error::InvalidOperation);
        }

        let port = Arc::new(Port::bring_up(self.driver.clone(), config)?);
        match port.role {
            Role::Master => {
                if let Err(e) = port.master_init() {
                    error!("Port {index}: handshake failed: {e}");
                    port.shutdown();
                    return Err(e);
                }
            }
            Role::Slave => port.spawn_listener()?,
        }

        *slot = Some(port);
        Ok(())
    }

    /// Open a channel by name, e.g. `"srio0-chan1"`.
    ///
    /// Waits up to the port's handshake timeout for the port to become
    /// ready.
    ///
    /// Returns:
    /// - `Ok(handle)`: Handle to pass to the other channel operations
    /// - `Err(Error::ChannelNotFound)`: No such channel, or the port has
    ///   fewer channels
    /// - `Err(Error::ChannelAlreadyOpen)`: Channel already open
    pub fn open(&self, name: &str) -> Result<ChannelHandle> {
        let handle = self.registry.find_and_reserve(name)?;
        let result = self
            .port(handle.port() as u8)
            .and_then(|port| Channel::open(handle, port));
        match result {
            Ok(channel) => {
                *self.channels[handle.raw()].write() = Some(Arc::new(channel));
                Ok(handle)
            }
            Err(e) => {
                warn!("{name}: open failed: {e}");
                self.registry.release(handle);
                Err(e)
            }
        }
    }

    /// Close a channel, stopping its poller.  Its counters survive for a
    /// later reopen.
    pub fn close(&self, handle: ChannelHandle) -> Result<()> {
        let channel = self
            .channels
            .get(handle.raw())
            .and_then(|slot| slot.write().take())
            .ok_or(Error::InvalidOperation)?;
        channel.close();
        self.registry.release(handle);
        Ok(())
    }

    /// Write `len` bytes from physical address `src` to the channel.
    ///
    /// Returns:
    /// - `Ok(())`: Data copied into the peer's ring
    /// - `Err(Error::WouldBlock)`: Peer has not freed enough slots, retry
    ///   later.  Also returned, every time, for data larger than the usable
    ///   ring.
    pub fn write(&self, handle: ChannelHandle, src: u64, len: usize) -> Result<()> {
        self.channel(handle)?.write(src, len)
    }

    /// Read received data without copying.  Returns an empty [`Received`] if
    /// nothing is waiting.
    ///
    /// Data is returned in whole slots.  If no more slots are waiting, up to
    /// the end of the ring, than `max_len` needs, all of them are returned
    /// in full: asking for 100 bytes with one 1 KiB slot waiting returns
    /// 1024 bytes.  Otherwise exactly `max_len` bytes are returned and the
    /// slots they touch are consumed.
    ///
    /// The data stays valid until acknowledged with [`Self::ack_read()`].
    ///
    /// Returns:
    /// - `Err(Error::RingOverflow)`: The peer announced more unread slots
    ///   than the ring holds
    pub fn read(&self, handle: ChannelHandle, max_len: usize) -> Result<Received<'_>> {
        // The receive region belongs to the driver, which lives as long as self
        self.channel(handle)?.read(max_len)
    }

    /// Hand `slots` read slots back to the peer's writer.
    pub fn ack_read(&self, handle: ChannelHandle, slots: u64) -> Result<()> {
        self.channel(handle)?.ack_read(slots)
    }

    /// Start or stop the fiber on a master port.
    pub fn op_command(&self, port: u8, op: FiberOp) -> Result<()> {
        self.port(port)?.op_command(op)
    }

    /// The link status block maintained by the peer.
    pub fn link_status(&self, port: u8) -> Result<[u8; LINK_STATUS_SIZE]> {
        Ok(self.port(port)?.link_status())
    }

    /// Allocate DMA-capable memory, e.g. to stage data for [`Self::write()`].
    pub fn alloc(&self, size: usize) -> Result<DmaRegion> {
        self.driver.alloc(size).map_err(|e| {
            error!("Alloc of {size} bytes failed: {e:?}");
            Error::HardwareInit
        })
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        self.port(port)
            .map(|port| port.status())
            .unwrap_or_default()
    }

    pub fn handshake_state(&self, port: u8) -> HandshakeState {
        self.port(port)
            .map(|port| port.handshake_state())
            .unwrap_or_default()
    }

    /// Snapshot of an open channel's slot counters
    pub fn counters(&self, handle: ChannelHandle) -> Result<CounterSnapshot> {
        Ok(self.channel(handle)?.counters())
    }

    /// Close every channel, stop every port and release the driver.
    /// Also performed on drop.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        for slot in &self.channels {
            if let Some(channel) = slot.write().take() {
                channel.close();
                self.registry.release(channel.handle());
            }
        }
        for slot in &self.ports {
            if let Some(port) = slot.write().take() {
                port.shutdown();
            }
        }
        self.driver.finish();
        self.finished = true;
        info!("Transport finished");
    }
}

impl<D: SrioDriver> Drop for TransportManager<D> {
    fn drop(&mut self) {
        self.finish();
    }
}
