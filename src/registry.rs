//! Static table of channel names.
//!
//! Channels are not created at runtime: every port has
//! [`MAX_CHANNELS_PER_PORT`] named slots, `srio<port>-chan<index>`, and
//! opening a channel reserves its slot exclusively.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicBool, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::wire::{CHAN_NUM_MAX, MAX_CHANNELS_PER_PORT};
use crate::{Error, Result};

const NAMES: [&str; CHAN_NUM_MAX] = [
    "srio0-chan0",
    "srio0-chan1",
    "srio0-chan2",
    "srio0-chan3",
    "srio1-chan0",
    "srio1-chan1",
    "srio1-chan2",
    "srio1-chan3",
];

/// Handle to an open channel - its position in the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(usize);

impl ChannelHandle {
    #[cfg(test)]
    pub(crate) fn new(port: usize, index: usize) -> Self {
        Self(port * MAX_CHANNELS_PER_PORT + index)
    }

    /// Position in the channel table
    pub fn raw(&self) -> usize {
        self.0
    }

    pub fn port(&self) -> usize {
        self.0 / MAX_CHANNELS_PER_PORT
    }

    /// Index of the channel within its port
    pub fn index(&self) -> usize {
        self.0 % MAX_CHANNELS_PER_PORT
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }
}

struct Entry {
    name: &'static str,
    open: AtomicBool,
}

/// Channel name table with exclusive reservation
pub struct Registry {
    entries: [Entry; CHAN_NUM_MAX],
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: NAMES.map(|name| Entry {
                name,
                open: AtomicBool::new(false),
            }),
        }
    }

    /// Reserve the channel called `name`.
    pub fn find_and_reserve(&self, name: &str) -> Result<ChannelHandle> {
        let fd = self
            .entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or(Error::ChannelNotFound)?;

        self.entries[fd]
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ChannelAlreadyOpen)?;

        trace!("Reserved {name} as {fd}");
        Ok(ChannelHandle(fd))
    }

    pub fn release(&self, handle: ChannelHandle) {
        self.entries[handle.0].open.store(false, Ordering::Release);
    }

    pub fn is_open(&self, handle: ChannelHandle) -> bool {
        self.entries[handle.0].open.load(Ordering::Acquire)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
