//! An open logical channel: write, read and acknowledge.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::Ordering;
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use super::{ChannelCtlInfo, CtlStatus, PollTask, Poller, plan_read, plan_write};
use crate::dma::{DmaBlock, DmaRole};
use crate::io::{DmaRegion, SrioDriver};
use crate::port::{ChannelLayout, Port, Role};
use crate::registry::ChannelHandle;
use crate::ring::{CounterSnapshot, Counters, OffsetMode};
use crate::wire::{
    AckCode, CTL_PACKET_SIZE, HANDSHAKE_SIZE, HeadResponse, MAX_CHANNELS_PER_PORT, SYMBOL,
    channel_ctl_offset,
};
use crate::{Error, Result};

/// Slots returned by a read.  Zero-copy: `data` points into the receive
/// region and stays valid until the slots are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received<'a> {
    data: &'a [u8],
    phys: u64,
    slots: u64,
}

impl<'a> Received<'a> {
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Physical address of the first byte
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Slots consumed, to be passed to `ack_read` once done with the data
    pub fn slots(&self) -> u64 {
        self.slots
    }
}

/// Open channel
pub struct Channel<D: SrioDriver> {
    handle: ChannelHandle,
    port: Arc<Port<D>>,
    layout: ChannelLayout,
    counters: Arc<Counters>,
    mode: OffsetMode,
    publish_size: usize,

    send_dma: Arc<DmaBlock<D::Dma>>,
    feedback_dma: Arc<DmaBlock<D::Dma>>,

    /// This channel's cluster in the receive region
    data: DmaRegion,
    /// Offset of this channel's slot in the control regions
    ctl_slot: usize,
    /// Local address reaching this channel's slot in the peer's control region
    remote_ctl: u64,
    /// Local address reaching this channel's cluster in the peer's receive region
    remote_data: u64,

    poller: Mutex<Option<Poller>>,
}

impl<D: SrioDriver> Channel<D> {
    /// Bind channel `handle` to its port's resources and start polling.
    ///
    /// Waits for the port to become ready.  If the port negotiated a second
    /// handshake the slave announces the channel and the master waits for
    /// that announcement.
    pub(crate) fn open(handle: ChannelHandle, port: Arc<Port<D>>) -> Result<Self> {
        port.wait_ready()?;

        let index = handle.index();
        let layout = port.layout(index).ok_or_else(|| {
            warn!("{}: port {} has no such channel", handle.name(), port.index);
            Error::ChannelNotFound
        })?;

        let caps = port.capabilities();
        let ctl_slot = channel_ctl_offset(index);
        let data = port
            .rx
            .subregion(layout.data_offset, layout.cluster_size())
            .ok_or(Error::Config("channel cluster outside receive region"))?;
        let counters = port.counters[index].clone();
        counters
            .reserved
            .fetch_max(layout.buf_num, Ordering::Relaxed);

        let channel = Self {
            handle,
            layout,
            counters,
            mode: OffsetMode::from(caps),
            publish_size: caps.ctl_publish_size(),
            send_dma: port.dma.lease(DmaRole::ChannelSend(index)),
            feedback_dma: port.dma.lease(DmaRole::ChannelFeedback(index)),
            data,
            ctl_slot,
            remote_ctl: port.ctl_info_start() + ctl_slot as u64,
            remote_data: port.info.range_start + layout.data_offset as u64,
            poller: Mutex::new(None),
            port,
        };

        match channel.port.role {
            Role::Slave => channel.announce()?,
            Role::Master if caps.second_handshake() => {
                channel.port.wait_ack(ctl_slot, AckCode::ChannelReady)?;
                debug!("{}: peer channel ready", handle.name());
            }
            Role::Master => (),
        }

        channel.start_poller()?;
        info!(
            "{}: open, {} x {} bytes, {:?} offsets",
            handle.name(),
            layout.buf_num,
            layout.buf_size,
            channel.mode
        );
        Ok(channel)
    }

    /// Slave: tell the master this channel is ready.
    fn announce(&self) -> Result<()> {
        HeadResponse::new(AckCode::ChannelReady, self.port.capabilities())
            .store(&self.port.ctl_tx, self.ctl_slot);
        self.send_dma.send(
            self.port.ctl_tx.phys() + self.ctl_slot as u64,
            self.remote_ctl,
            HANDSHAKE_SIZE,
        )
    }

    fn start_poller(&self) -> Result<()> {
        let ctl = self
            .port
            .ctl_rx
            .subregion(self.ctl_slot + self.port.role.read_slot(), CTL_PACKET_SIZE)
            .ok_or(Error::Config("control slot outside control region"))?;
        let task = PollTask {
            ctl,
            counters: self.counters.clone(),
            buf_num: self.layout.buf_num,
            strategy: self.port.config.poll_strategy,
        };
        let fd = self.handle.raw();
        let cpu = self.port.config.pin_threads.then_some(fd + 3);
        let poller = Poller::spawn(format!("srio-ctl-{fd}"), cpu, self.mode, task)?;
        *self.poller.lock() = Some(poller);
        Ok(())
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Pick up any slots the peer has acknowledged since the last write.
    fn refresh_reserved(&self) {
        let offset = self.ctl_slot + self.port.role.write_slot();
        let observed = self
            .port
            .ctl_rx
            .read_u64(offset + ChannelCtlInfo::read_point_offset());
        let last = self.counters.peer_read.load(Ordering::Relaxed);
        if let Some(delta) = self.mode.observe(last, observed, self.layout.buf_num) {
            self.counters.peer_read.store(observed, Ordering::Relaxed);
            let reserved = self.counters.reserved.fetch_add(delta, Ordering::Relaxed) + delta;
            trace!(
                "{}: read point {last} -> {observed}, reserved {reserved}",
                self.handle.name()
            );
        }
    }

    /// Publish the local write pointer and `status` to the peer.
    fn publish_write_point(&self, send: u64, status: CtlStatus) -> Result<()> {
        let offset = self.ctl_slot + self.port.role.write_slot();
        let mirror = &self.port.ctl_tx;
        mirror.write_u32(offset + ChannelCtlInfo::symbol_offset(), SYMBOL);
        mirror.write_u32(offset + ChannelCtlInfo::status_offset(), status as u32);
        mirror.write_u64(
            offset + ChannelCtlInfo::write_point_offset(),
            self.mode.advertise(send, self.layout.buf_num),
        );
        self.send_dma.send(
            mirror.phys() + offset as u64,
            self.remote_ctl + self.port.role.write_slot() as u64,
            self.publish_size,
        )
    }

    /// Copy `len` bytes at physical address `src` into the peer's ring.
    ///
    /// Returns [`Error::WouldBlock`] without moving any data if the peer has
    /// not acknowledged enough slots, or if `len` exceeds the usable ring.
    /// Either way the peer is told the ring is full.
    pub fn write(&self, src: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.refresh_reserved();

        let send = self.counters.send.load(Ordering::Relaxed);
        let reserved = self.counters.reserved.load(Ordering::Relaxed);
        let Ok(plan) = plan_write(
            send,
            reserved,
            self.mode.headroom(),
            self.layout.buf_num,
            self.layout.buf_size,
            len,
        ) else {
            trace!(
                "{}: no room for {len} bytes, send {send} reserved {reserved}",
                self.handle.name()
            );
            self.publish_write_point(send, CtlStatus::Full)?;
            return Err(Error::WouldBlock);
        };

        for segment in plan.segments() {
            self.send_dma.send(
                src + segment.src_offset as u64,
                self.remote_data + segment.dest_offset as u64,
                segment.len,
            )?;
        }

        let send = send + plan.slots;
        self.counters.send.store(send, Ordering::Relaxed);
        trace!("{}: wrote {len} bytes, send {send}", self.handle.name());
        self.publish_write_point(send, CtlStatus::Normal)
    }

    /// Take up to `max_len` bytes of received data.
    ///
    /// The returned slice borrows memory owned by the driver; `'a` must not
    /// outlive it.
    pub(crate) fn read<'a>(&self, max_len: usize) -> Result<Received<'a>> {
        let receive = self.counters.receive.load(Ordering::Acquire);
        let read = self.counters.read.load(Ordering::Relaxed);
        let plan = plan_read(
            receive,
            read,
            self.layout.buf_num,
            self.layout.buf_size,
            max_len,
        )
        .inspect_err(|_| {
            error!(
                "{}: ring overflow, receive {receive} read {read}",
                self.handle.name()
            )
        })?;

        self.counters.read.store(read + plan.slots, Ordering::Relaxed);
        if plan.slots > 0 {
            trace!(
                "{}: read {} slots at {:#x}",
                self.handle.name(),
                plan.slots,
                plan.offset
            );
        }
        // Safe: these slots are not handed back to the writer until acked
        let data = unsafe { self.data.as_slice(plan.offset, plan.len) };
        Ok(Received {
            data,
            phys: self.data.phys() + plan.offset as u64,
            slots: plan.slots,
        })
    }

    /// Hand `slots` read slots back to the writer.
    pub fn ack_read(&self, slots: u64) -> Result<()> {
        let freed = self.counters.freed.load(Ordering::Relaxed) + slots;
        if freed > self.counters.read.load(Ordering::Relaxed) {
            warn!("{}: ack of {slots} slots exceeds reads", self.handle.name());
            return Err(Error::InvalidOperation);
        }
        self.counters.freed.store(freed, Ordering::Relaxed);

        let offset = self.ctl_slot + self.port.role.read_slot();
        let mirror = &self.port.ctl_tx;
        mirror.write_u32(offset + ChannelCtlInfo::symbol_offset(), SYMBOL);
        mirror.write_u64(
            offset + ChannelCtlInfo::read_point_offset(),
            self.mode.advertise(freed, self.layout.buf_num),
        );

        // The last channel's feedback engine is also the master's control engine
        let _guard =
            (self.handle.index() == MAX_CHANNELS_PER_PORT - 1).then(|| self.port.admin.lock());
        self.feedback_dma.send(
            mirror.phys() + offset as u64,
            self.remote_ctl + self.port.role.read_slot() as u64,
            self.publish_size,
        )
    }

    /// Stop polling.  Counters are kept for a later reopen.
    pub(crate) fn close(&self) {
        if let Some(mut poller) = self.poller.lock().take() {
            poller.stop();
        }
        info!("{}: closed", self.handle.name());
    }
}
