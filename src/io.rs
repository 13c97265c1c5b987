//! Traits for the SRIO window driver and DMA engines, and the memory they
//! operate on.
//!
//! This module contains the hardware-facing half of the transport.  The
//! transport itself never touches registers: it asks an [`SrioDriver`] to
//! allocate DMA-capable memory, configure address windows and hand out
//! [`DmaEngine`]s, and then moves every byte with blocking DMA copies.
//!
//! # Possible implementations
//!
//! - For SRIO hardware: wrap the SoC's user-space SRIO and DMA drivers
//! - For testing: [`crate::loopback`], which connects two in-process peers
//!
//! # Address Space
//!
//! All DMA addresses are physical addresses as seen by the local DMA engine.
//! Addresses inside an outbound window are translated by the hardware into
//! SRIO addresses, which the peer's inbound windows translate back into its
//! own physical memory.  SRIO addresses are 32 bits wide.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ptr::NonNull;

/// Address window used by the transport.  Each port uses one data window and
/// one control window in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Data = 1,
    Control = 2,
}

impl Window {
    pub const fn index(self) -> u8 {
        self as u8
    }
}

/// Port details returned when a link is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Start of the local physical range backing this port's outbound windows
    pub range_start: u64,
    /// Size of that range in bytes
    pub range_size: u64,
}

/// Blocking DMA engine - one hardware DMA channel.
pub trait DmaEngine: Send + 'static {
    /// The error type returned by transfers.
    type Error: core::fmt::Debug;

    /// Copy `len` bytes from `src` to `dest`, returning once the engine
    /// reports completion.
    ///
    /// # Arguments
    ///
    /// * `src` - Local physical source address
    /// * `dest` - Local physical destination address, usually inside an
    ///   outbound window
    /// * `len` - Number of bytes to copy
    ///
    /// # Errors
    ///
    /// Returns an error if the engine reports a failed transfer.  The
    /// transport does not retry.
    fn transfer(&mut self, src: u64, dest: u64, len: usize) -> Result<(), Self::Error>;
}

/// SRIO window driver and platform memory allocator.
///
/// Methods take `&self` as a driver is shared between the caller and the
/// transport's background threads.  Implementations serialize internally.
pub trait SrioDriver: Send + Sync + 'static {
    /// The error type returned by driver operations.
    type Error: core::fmt::Debug;

    /// DMA engine type handed out by [`Self::dma_engine()`].
    type Dma: DmaEngine;

    /// Allocate a physically contiguous, DMA-capable region of `size` bytes.
    ///
    /// Regions remain valid until the driver is dropped.
    fn alloc(&self, size: usize) -> Result<DmaRegion, Self::Error>;

    /// Bring up the link on `port` and report its outbound range.
    fn connect(&self, port: u8) -> Result<PortInfo, Self::Error>;

    /// Map the SRIO range `srio..srio + 2^(law + 1)` onto local physical
    /// memory starting at `local`.
    fn set_inbound_window(
        &self,
        port: u8,
        window: Window,
        local: u64,
        srio: u32,
        law: u32,
    ) -> Result<(), Self::Error>;

    /// Map the local physical range `local..local + 2^(law + 1)` onto the
    /// SRIO range starting at `srio`.
    fn set_outbound_window(
        &self,
        port: u8,
        window: Window,
        local: u64,
        srio: u32,
        law: u32,
    ) -> Result<(), Self::Error>;

    /// Set this side's device ID on `port`.
    fn set_device_id(&self, port: u8, id: u32) -> Result<(), Self::Error>;

    /// Set the device ID that writes through `window` are addressed to.
    fn set_target_id(&self, port: u8, window: Window, id: u32) -> Result<(), Self::Error>;

    /// Initialize DMA engine `index` of `port`.
    fn dma_engine(&self, port: u8, index: u8) -> Result<Self::Dma, Self::Error>;

    /// Release driver resources.
    fn finish(&self);
}

/// Physically addressable memory.
///
/// A region is a view - it does not own the memory, which belongs to the
/// [`SrioDriver`] that allocated it.  All accessors are volatile as the peer
/// writes into these regions by DMA at any time.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
}

// Regions point into DMA memory shared with hardware and the peer.  Access
// is volatile and the protocol, not the type system, decides who writes
// what.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Create a region from its raw parts.  Returns `None` if `virt` is null
    /// or not 8-byte aligned.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` bytes for as long
    /// as the region, or any region derived from it, is used, and `phys` must
    /// be the address the local DMA engines use for `virt`.
    pub unsafe fn from_raw_parts(virt: *mut u8, phys: u64, len: usize) -> Option<Self> {
        if virt as usize % 8 != 0 {
            return None;
        }
        NonNull::new(virt).map(|virt| Self { virt, phys, len })
    }

    /// Physical address of the start of the region
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the start of the region
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Sub-view of `len` bytes starting at `offset`.  Returns `None` if it
    /// does not fit.
    pub fn subregion(&self, offset: usize, len: usize) -> Option<DmaRegion> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // Safe: offset is within the region, so the pointer is non-null.
        let virt = unsafe { NonNull::new_unchecked(self.virt.as_ptr().add(offset)) };
        Some(Self {
            virt,
            phys: self.phys + offset as u64,
            len,
        })
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let ptr = self.ptr_at(offset, 4) as *const u32;
        unsafe { core::ptr::read_volatile(ptr) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        let ptr = self.ptr_at(offset, 4) as *mut u32;
        unsafe { core::ptr::write_volatile(ptr, value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let ptr = self.ptr_at(offset, 8) as *const u64;
        unsafe { core::ptr::read_volatile(ptr) }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        let ptr = self.ptr_at(offset, 8) as *mut u64;
        unsafe { core::ptr::write_volatile(ptr, value) }
    }

    /// Bulk read, no need for atomicity
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let src = self.span_at(offset, buf.len());
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
    }

    /// Bulk write, no need for atomicity
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let dest = self.span_at(offset, data.len());
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len()) }
    }

    /// Zero `len` bytes starting at `offset`
    pub fn zero(&self, offset: usize, len: usize) {
        let dest = self.span_at(offset, len);
        unsafe { core::ptr::write_bytes(dest, 0, len) }
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// The underlying memory must outlive `'a`, and the caller must ensure
    /// the peer does not write these bytes while the slice is alive - for
    /// ring slots, that they have not yet been acknowledged back to the
    /// writer.
    pub unsafe fn as_slice<'a>(&self, offset: usize, len: usize) -> &'a [u8] {
        let ptr = self.span_at(offset, len);
        unsafe { core::slice::from_raw_parts(ptr, len) }
    }

    fn span_at(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access {offset:#x}+{len:#x} outside region of {:#x} bytes",
            self.len
        );
        unsafe { self.virt.as_ptr().add(offset) }
    }

    fn ptr_at(&self, offset: usize, size: usize) -> *mut u8 {
        let ptr = self.span_at(offset, size);
        assert!(ptr as usize % size == 0, "unaligned {size}-byte access at {offset:#x}");
        ptr
    }
}
