//! In-process SRIO fabric connecting two endpoints.
//!
//! Implements [`SrioDriver`] and [`DmaEngine`] entirely in memory, so that a
//! master and a slave [`crate::TransportManager`] can talk to each other
//! within one process.  Port `p` of one endpoint is linked to port `p` of
//! the other.
//!
//! A DMA transfer whose destination falls inside one of the endpoint's
//! outbound windows is translated to an SRIO address and delivered through
//! the peer's matching inbound window, provided the window's target ID is the
//! peer's device ID.  Writes nobody is listening for are dropped, as on a
//! real link.  All other addresses must be local memory.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{Ordering, fence};
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::io::{DmaEngine, DmaRegion, PortInfo, SrioDriver, Window};
use crate::window::window_size;
use crate::wire::{PORT_DMA_NUM, PORT_NUM};

/// First physical address handed out by the allocator
const PHYS_BASE: u64 = 0x8000_0000;

/// Size of each port's outbound range
const RANGE_SIZE: u64 = 0x1_0000_0000;

/// Loopback errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackError {
    NoSuchPort(u8),
    NoSuchEngine(u8),
    NotConnected(u8),
    /// Address is neither local memory nor in an outbound window
    BadAddress(u64),
    /// Failure injected with [`LoopbackDriver::set_dma_failure()`]
    InjectedFailure,
}

/// A window mapping between local memory and SRIO addresses
#[derive(Debug, Clone, Copy)]
struct WindowMap {
    local: u64,
    srio: u32,
    size: u64,
}

impl WindowMap {
    fn local_to_srio(&self, addr: u64) -> Option<u64> {
        (addr >= self.local && addr < self.local + self.size)
            .then(|| self.srio as u64 + (addr - self.local))
    }

    fn srio_to_local(&self, srio: u64) -> Option<u64> {
        let base = self.srio as u64;
        (srio >= base && srio < base + self.size).then(|| self.local + (srio - base))
    }
}

#[derive(Debug, Default)]
struct PortState {
    connected: bool,
    device_id: Option<u32>,
    inbound: [Option<WindowMap>; 2],
    outbound: [Option<WindowMap>; 2],
    target_id: [Option<u32>; 2],
}

fn window_slot(window: Window) -> usize {
    window.index() as usize - 1
}

#[derive(Debug, Default)]
struct Endpoint {
    ports: [PortState; PORT_NUM],
    dma_failure: bool,
}

/// A block of backing memory
struct Block {
    owner: usize,
    phys: u64,
    len: usize,
    words: *mut u64,
    word_count: usize,
}

impl Block {
    fn contains(&self, phys: u64, len: usize) -> bool {
        phys >= self.phys && phys + len as u64 <= self.phys + self.len as u64
    }

    fn ptr(&self, phys: u64) -> *mut u8 {
        unsafe { (self.words as *mut u8).add((phys - self.phys) as usize) }
    }
}

struct FabricState {
    endpoints: [Endpoint; 2],
    blocks: Vec<Block>,
    next_phys: u64,
}

// Blocks are only touched under the fabric lock, or through DmaRegions
unsafe impl Send for FabricState {}

impl FabricState {
    fn block(&self, endpoint: usize, phys: u64, len: usize) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.owner == endpoint && b.contains(phys, len))
    }

    /// Resolve a DMA destination.  `Ok(None)` means the write leaves the
    /// endpoint but nobody receives it.
    fn route(
        &self,
        endpoint: usize,
        port: usize,
        dest: u64,
        len: usize,
    ) -> Result<Option<(usize, u64)>, LoopbackError> {
        let local = &self.endpoints[endpoint].ports[port];
        let outbound = local
            .outbound
            .iter()
            .enumerate()
            .find_map(|(i, w)| {
                w.and_then(|w| w.local_to_srio(dest))
                    .map(|srio| (i, srio))
            });

        let Some((slot, srio)) = outbound else {
            return match self.block(endpoint, dest, len) {
                Some(_) => Ok(Some((endpoint, dest))),
                None => Err(LoopbackError::BadAddress(dest)),
            };
        };

        let peer_endpoint = 1 - endpoint;
        let peer = &self.endpoints[peer_endpoint].ports[port];
        let target = local.target_id[slot];
        if !peer.connected || target.is_none() || target != peer.device_id {
            trace!("Dropping write to SRIO {srio:#x}: no device {target:x?}");
            return Ok(None);
        }
        match peer.inbound.iter().flatten().find_map(|w| w.srio_to_local(srio)) {
            Some(phys) => Ok(Some((peer_endpoint, phys))),
            None => {
                trace!("Dropping write to SRIO {srio:#x}: no inbound window");
                Ok(None)
            }
        }
    }

    fn transfer(
        &self,
        endpoint: usize,
        port: usize,
        src: u64,
        dest: u64,
        len: usize,
    ) -> Result<(), LoopbackError> {
        if self.endpoints[endpoint].dma_failure {
            return Err(LoopbackError::InjectedFailure);
        }
        let src_block = self
            .block(endpoint, src, len)
            .ok_or(LoopbackError::BadAddress(src))?;
        let Some((dest_endpoint, dest_phys)) = self.route(endpoint, port, dest, len)? else {
            return Ok(());
        };
        let dest_block = self
            .block(dest_endpoint, dest_phys, len)
            .ok_or(LoopbackError::BadAddress(dest_phys))?;

        unsafe { copy_forward(src_block.ptr(src), dest_block.ptr(dest_phys), len) };
        Ok(())
    }
}

/// Copy front to back, a word at a time where alignment allows, so the last
/// bytes of a block land last.
unsafe fn copy_forward(src: *const u8, dest: *mut u8, len: usize) {
    let aligned = (src as usize | dest as usize) % 8 == 0;
    let words = if aligned { len / 8 } else { 0 };
    unsafe {
        for i in 0..words {
            let word = core::ptr::read_volatile((src as *const u64).add(i));
            if i + 1 == words && words * 8 == len {
                fence(Ordering::SeqCst);
            }
            core::ptr::write_volatile((dest as *mut u64).add(i), word);
        }
        for i in words * 8..len {
            if i + 1 == len {
                fence(Ordering::SeqCst);
            }
            core::ptr::write_volatile(dest.add(i), core::ptr::read_volatile(src.add(i)));
        }
    }
    fence(Ordering::SeqCst);
}

/// Shared state of both endpoints
pub struct Fabric {
    state: Mutex<FabricState>,
}

impl Fabric {
    /// Create a fabric and return a driver for each end.
    pub fn pair() -> (LoopbackDriver, LoopbackDriver) {
        let fabric = Arc::new(Fabric {
            state: Mutex::new(FabricState {
                endpoints: Default::default(),
                blocks: Vec::new(),
                next_phys: PHYS_BASE,
            }),
        });
        (
            LoopbackDriver {
                fabric: fabric.clone(),
                endpoint: 0,
            },
            LoopbackDriver {
                fabric,
                endpoint: 1,
            },
        )
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        for block in self.state.get_mut().blocks.drain(..) {
            let words = core::ptr::slice_from_raw_parts_mut(block.words, block.word_count);
            drop(unsafe { Box::from_raw(words) });
        }
    }
}

/// One endpoint of a [`Fabric`]
#[derive(Clone)]
pub struct LoopbackDriver {
    fabric: Arc<Fabric>,
    endpoint: usize,
}

impl LoopbackDriver {
    /// Make every subsequent DMA transfer from this endpoint fail, or stop
    /// doing so.
    pub fn set_dma_failure(&self, fail: bool) {
        self.fabric.state.lock().endpoints[self.endpoint].dma_failure = fail;
    }

    /// Which end of the fabric this is, 0 or 1
    pub fn endpoint(&self) -> usize {
        self.endpoint
    }

    fn with_port<T>(
        &self,
        port: u8,
        f: impl FnOnce(&mut PortState) -> T,
    ) -> Result<T, LoopbackError> {
        let mut state = self.fabric.state.lock();
        let port_state = state.endpoints[self.endpoint]
            .ports
            .get_mut(port as usize)
            .ok_or(LoopbackError::NoSuchPort(port))?;
        Ok(f(port_state))
    }

    fn range_start(&self, port: u8) -> u64 {
        0x100_0000_0000 + self.endpoint as u64 * 0x10_0000_0000 + port as u64 * RANGE_SIZE
    }
}

impl SrioDriver for LoopbackDriver {
    type Error = LoopbackError;
    type Dma = LoopbackDma;

    fn alloc(&self, size: usize) -> Result<DmaRegion, Self::Error> {
        let word_count = size.div_ceil(8).max(1);
        let words = Box::into_raw(vec![0u64; word_count].into_boxed_slice()) as *mut u64;

        let mut state = self.fabric.state.lock();
        let phys = state.next_phys;
        // Keep blocks apart so stray writes are caught
        state.next_phys += (word_count as u64 * 8).next_multiple_of(0x1000) + 0x1000;
        state.blocks.push(Block {
            owner: self.endpoint,
            phys,
            len: size,
            words,
            word_count,
        });
        trace!("Endpoint {}: alloc {size:#x} at {phys:#x}", self.endpoint);

        // Safe: the block lives until the fabric is dropped
        unsafe { DmaRegion::from_raw_parts(words as *mut u8, phys, size) }
            .ok_or(LoopbackError::BadAddress(phys))
    }

    fn connect(&self, port: u8) -> Result<PortInfo, Self::Error> {
        self.with_port(port, |p| p.connected = true)?;
        debug!("Endpoint {}: port {port} connected", self.endpoint);
        Ok(PortInfo {
            range_start: self.range_start(port),
            range_size: RANGE_SIZE,
        })
    }

    fn set_inbound_window(
        &self,
        port: u8,
        window: Window,
        local: u64,
        srio: u32,
        law: u32,
    ) -> Result<(), Self::Error> {
        let map = WindowMap {
            local,
            srio,
            size: window_size(law),
        };
        trace!("Endpoint {}: port {port} inbound {window:?} {map:x?}", self.endpoint);
        self.with_port(port, |p| p.inbound[window_slot(window)] = Some(map))
    }

    fn set_outbound_window(
        &self,
        port: u8,
        window: Window,
        local: u64,
        srio: u32,
        law: u32,
    ) -> Result<(), Self::Error> {
        let map = WindowMap {
            local,
            srio,
            size: window_size(law),
        };
        trace!("Endpoint {}: port {port} outbound {window:?} {map:x?}", self.endpoint);
        self.with_port(port, |p| p.outbound[window_slot(window)] = Some(map))
    }

    fn set_device_id(&self, port: u8, id: u32) -> Result<(), Self::Error> {
        self.with_port(port, |p| p.device_id = Some(id))
    }

    fn set_target_id(&self, port: u8, window: Window, id: u32) -> Result<(), Self::Error> {
        self.with_port(port, |p| p.target_id[window_slot(window)] = Some(id))
    }

    fn dma_engine(&self, port: u8, index: u8) -> Result<Self::Dma, Self::Error> {
        if index as usize >= PORT_DMA_NUM {
            return Err(LoopbackError::NoSuchEngine(index));
        }
        if !self.with_port(port, |p| p.connected)? {
            return Err(LoopbackError::NotConnected(port));
        }
        Ok(LoopbackDma {
            fabric: self.fabric.clone(),
            endpoint: self.endpoint,
            port: port as usize,
        })
    }

    fn finish(&self) {
        let mut state = self.fabric.state.lock();
        for port in state.endpoints[self.endpoint].ports.iter_mut() {
            *port = PortState::default();
        }
        debug!("Endpoint {}: finished", self.endpoint);
    }
}

/// DMA engine of a [`LoopbackDriver`] port
pub struct LoopbackDma {
    fabric: Arc<Fabric>,
    endpoint: usize,
    port: usize,
}

impl DmaEngine for LoopbackDma {
    type Error = LoopbackError;

    fn transfer(&mut self, src: u64, dest: u64, len: usize) -> Result<(), Self::Error> {
        self.fabric
            .state
            .lock()
            .transfer(self.endpoint, self.port, src, dest, len)
    }
}
