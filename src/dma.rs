//! Fixed per-port pool of DMA engines.
//!
//! Every port initializes [`PORT_DMA_NUM`] engines up front and hands them
//! out by role:
//!
//! | Role                      | Engine      |
//! |---------------------------|-------------|
//! | Channel `i` data/publish  | `2i`        |
//! | Channel `i` feedback      | `2i + 1`    |
//! | Master port control       | 7           |
//! | Slave port control        | 0           |
//!
//! Port control shares an engine with a channel, so each engine is guarded
//! by its own lock.  The pool never grows and engines are never reclaimed
//! before the port is torn down.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::io::{DmaEngine, SrioDriver};
use crate::port::Role;
use crate::wire::PORT_DMA_NUM;
use crate::{Error, Result};

/// What a leased engine is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaRole {
    /// Channel data and write pointer publishes
    ChannelSend(usize),
    /// Channel read pointer publishes
    ChannelFeedback(usize),
    /// Handshake, admin commands and acks
    PortControl(Role),
}

impl DmaRole {
    fn slot(self) -> usize {
        match self {
            DmaRole::ChannelSend(index) => index * 2,
            DmaRole::ChannelFeedback(index) => index * 2 + 1,
            DmaRole::PortControl(Role::Master) => PORT_DMA_NUM - 1,
            DmaRole::PortControl(Role::Slave) => 0,
        }
    }
}

/// DMA control block - one engine bound to a port
pub struct DmaBlock<E: DmaEngine> {
    engine: Mutex<E>,
    port: u8,
    slot: usize,
}

impl<E: DmaEngine> DmaBlock<E> {
    /// Blocking copy of `len` bytes from `src` to `dest`.
    pub fn send(&self, src: u64, dest: u64, len: usize) -> Result<()> {
        trace!(
            "DMA p{}/{}: {src:#x} -> {dest:#x} {len} bytes",
            self.port, self.slot
        );
        self.engine.lock().transfer(src, dest, len).map_err(|e| {
            error!("DMA task error on port {} engine {}: {e:?}", self.port, self.slot);
            Error::DmaTransferFailed
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// The engines of one port
pub struct DmaPool<E: DmaEngine> {
    blocks: Vec<Arc<DmaBlock<E>>>,
}

impl<E: DmaEngine> DmaPool<E> {
    /// Initialize every engine of `port`.
    pub fn new<D>(driver: &D, port: u8) -> Result<Self>
    where
        D: SrioDriver<Dma = E>,
    {
        let blocks = (0..PORT_DMA_NUM)
            .map(|slot| {
                let engine = driver.dma_engine(port, slot as u8).map_err(|e| {
                    error!("Port {port} DMA engine {slot} init error: {e:?}");
                    Error::HardwareInit
                })?;
                Ok(Arc::new(DmaBlock {
                    engine: Mutex::new(engine),
                    port,
                    slot,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Port {port}: {} DMA engines ready", blocks.len());
        Ok(Self { blocks })
    }

    pub fn lease(&self, role: DmaRole) -> Arc<DmaBlock<E>> {
        self.blocks[role.slot()].clone()
    }
}
