//! Head info / head response exchange.
//!
//! The master drives every exchange: it writes a [`HeadInfo`] to offset 0 of
//! the slave's control region and polls offset 0 of its own for the
//! matching [`HeadResponse`].  The slave runs one listener thread per port
//! which spins on the command word, acts on it and answers.  Channel-ready
//! acks use the same response block at the start of each channel's control
//! slot.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{Ordering, fence};
use std::sync::Arc;
use std::time::Instant;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{HandshakeState, Port, PortStatus, Role, layout_from, pin_current};
use crate::config::Mode;
use crate::dma::DmaRole;
use crate::io::SrioDriver;
use crate::wire::{
    AckCode, AdminCommand, BUF_SIZE_UNIT, Cluster, FiberOp, Geometry, HANDSHAKE_SIZE, HeadInfo,
    HeadResponse, SRIO_SYS_ADDR, SYMBOL,
};
use crate::{Error, Result};

impl<D: SrioDriver> Port<D> {
    /// Master: announce geometry and wait for the slave to accept it.
    pub(crate) fn master_init(&self) -> Result<()> {
        let mut geometry = Geometry::default();
        for (i, channel) in self.layout.read().iter().enumerate() {
            let cluster = Cluster {
                addr: SRIO_SYS_ADDR + channel.data_offset as u32,
                buf_num: channel.buf_num as u16,
                buf_size: (channel.buf_size / BUF_SIZE_UNIT) as u16,
            };
            geometry[i].recv = cluster;
            geometry[i].send = cluster;
        }

        self.set_handshake(HandshakeState::SendGeometry);
        let rsp = self
            .send_command(AdminCommand::Init(geometry))
            .inspect_err(|_| self.set_handshake(HandshakeState::Failed))?;

        self.set_capabilities(rsp.capabilities());
        self.mark_ready();
        Ok(())
    }

    /// Master: push `cmd` to the slave and wait for its ack.
    fn send_command(&self, cmd: AdminCommand) -> Result<HeadResponse> {
        let geometry = match cmd {
            AdminCommand::Init(geometry) => geometry,
            // Geometry travels with every command, as last announced
            _ => HeadInfo::load(&self.ctl_tx, 0).channels,
        };

        {
            let _guard = self.admin.lock();
            // Drop any stale ack before the slave can answer
            self.ctl_rx.write_u32(HeadResponse::cmd_ack_offset(), 0);
            HeadInfo::new(cmd.code(), geometry).store(&self.ctl_tx, 0);
            debug!("Port {}: sending {:?}", self.index, cmd.code());
            self.dma.lease(DmaRole::PortControl(Role::Master)).send(
                self.ctl_tx.phys(),
                self.ctl_info_start(),
                HANDSHAKE_SIZE,
            )?;
        }

        if matches!(cmd, AdminCommand::Init(_)) {
            self.set_handshake(HandshakeState::AwaitAck);
        }
        self.wait_ack(0, cmd.ready())
    }

    /// Poll the response block at `offset` of the control receive region
    /// until it carries `ack`.  The ack is consumed.
    pub(crate) fn wait_ack(&self, offset: usize, ack: AckCode) -> Result<HeadResponse> {
        let start = Instant::now();
        loop {
            if self.ctl_rx.read_u32(offset + HeadResponse::cmd_ack_offset()) == ack as u32 {
                fence(Ordering::Acquire);
                let rsp = HeadResponse::load(&self.ctl_rx, offset);
                self.ctl_rx.write_u32(offset + HeadResponse::cmd_ack_offset(), 0);
                debug!(
                    "Port {}: {ack:?} after {:?}",
                    self.index,
                    start.elapsed()
                );
                return Ok(rsp);
            }
            if start.elapsed() > self.config.handshake_timeout {
                error!(
                    "Port {}: no {ack:?} from peer within {:?}",
                    self.index, self.config.handshake_timeout
                );
                return Err(Error::HandshakeTimeout);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Master: run a fiber operation on the slave.
    pub(crate) fn op_command(&self, op: FiberOp) -> Result<()> {
        if self.role != Role::Master {
            warn!("Port {}: {op:?} requested on slave", self.index);
            return Err(Error::InvalidOperation);
        }
        match (op, self.status()) {
            (_, PortStatus::Uninit) => return Err(Error::Uninit),
            (FiberOp::Start, PortStatus::Started) | (FiberOp::Stop, PortStatus::Stopped) => {
                warn!("Port {}: already {:?}", self.index, self.status());
                return Err(Error::InvalidOperation);
            }
            _ => (),
        }

        let rsp = self.send_command(op.into())?;
        match op {
            FiberOp::Start => {
                self.set_capabilities(rsp.capabilities());
                self.set_status(PortStatus::Started);
            }
            FiberOp::Stop => {
                self.reset_channels();
                self.set_status(PortStatus::Stopped);
            }
        }
        info!("Port {}: {op:?} complete", self.index);
        Ok(())
    }

    /// Slave: start the head listener thread.
    pub(crate) fn spawn_listener(self: &Arc<Self>) -> Result<()> {
        let port = self.clone();
        let pin = self.config.pin_threads.then_some(self.index as usize + 1);
        self.set_handshake(HandshakeState::AwaitGeometry);
        let thread = std::thread::Builder::new()
            .name(format!("srio-head-p{}", self.index))
            .spawn(move || {
                if let Some(cpu) = pin {
                    pin_current(cpu);
                }
                port.listen();
            })
            .map_err(|e| {
                error!("Port {}: failed to spawn listener: {e}", self.index);
                Error::ThreadSpawn
            })?;
        *self.listener.lock() = Some(thread);
        Ok(())
    }

    fn listen(&self) {
        debug!("Port {}: listening for head info", self.index);
        while !self.cancelled() {
            if self.ctl_rx.read_u32(HeadInfo::cmd_offset()) == 0 {
                self.config.poll_strategy.idle();
                continue;
            }
            fence(Ordering::Acquire);
            let head = HeadInfo::load(&self.ctl_rx, 0);
            self.ctl_rx.write_u32(HeadInfo::cmd_offset(), 0);

            if head.symbol != SYMBOL {
                warn!(
                    "Port {}: ignoring head info with symbol {:#x}",
                    self.index, head.symbol
                );
                continue;
            }
            let Some(cmd) = AdminCommand::from_head(&head) else {
                warn!("Port {}: unknown command {:#x}", self.index, head.cmd);
                continue;
            };

            if let Err(e) = self.handle(cmd) {
                error!("Port {}: {:?} failed: {e}", self.index, cmd.code());
            }
        }
        debug!("Port {}: listener exiting", self.index);
    }

    fn handle(&self, cmd: AdminCommand) -> Result<()> {
        debug!("Port {}: received {:?}", self.index, cmd.code());
        match cmd {
            AdminCommand::Init(geometry) => {
                self.set_handshake(HandshakeState::SendAck);
                self.apply_geometry(&geometry)
                    .inspect_err(|_| self.set_handshake(HandshakeState::Failed))?;
                self.respond(cmd.ready())?;
                self.mark_ready();
            }
            AdminCommand::Start => {
                self.set_status(PortStatus::Started);
                self.respond(cmd.ready())?;
            }
            AdminCommand::Stop => {
                self.reset_channels();
                self.set_status(PortStatus::Stopped);
                self.respond(cmd.ready())?;
            }
        }
        Ok(())
    }

    /// Slave: adopt the master's geometry and size the data windows to it.
    fn apply_geometry(&self, geometry: &Geometry) -> Result<()> {
        let chan_num = match &self.config.mode {
            Mode::Slave { chan_num, .. } => *chan_num,
            Mode::Master { channels } => channels.len(),
        };

        let channels = &geometry[..chan_num];
        if channels
            .iter()
            .any(|c| c.send.buf_num == 0 || c.send.buf_size == 0)
        {
            return Err(Error::Config("peer announced an empty channel"));
        }
        let layout = layout_from(
            channels
                .iter()
                .map(|c| (c.send.buf_size_bytes(), c.send.buf_num as u64)),
        );
        let total: usize = layout.iter().map(|l| l.cluster_size()).sum();
        if total > self.rx.len() {
            error!(
                "Port {}: peer geometry needs {total:#x} bytes, receive region is {:#x}",
                self.index,
                self.rx.len()
            );
            return Err(Error::Config("receive region too small for peer geometry"));
        }

        self.configure_data_windows(geometry[0].recv.addr, geometry[0].send.addr, total as u64)?;
        self.set_layout(layout);
        Ok(())
    }

    /// Slave: answer the master with `ack` and our capabilities.
    fn respond(&self, ack: AckCode) -> Result<()> {
        let _guard = self.admin.lock();
        HeadResponse::new(ack, self.capabilities()).store(&self.ctl_tx, 0);
        self.dma.lease(DmaRole::PortControl(Role::Slave)).send(
            self.ctl_tx.phys(),
            self.ctl_info_start(),
            HANDSHAKE_SIZE,
        )?;
        debug!("Port {}: sent {ack:?}", self.index);
        Ok(())
    }
}
