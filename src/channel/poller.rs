//! Per-channel control-info polling worker.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::Arc;
use std::thread::JoinHandle;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{ChannelCtlInfo, CtlStatus};
use crate::config::PollStrategy;
use crate::io::DmaRegion;
use crate::port::pin_current;
use crate::ring::{Absolute, Counters, OffsetMode, RingCounter, Wrapping};
use crate::{Error, Result};

/// What a poller watches and where it accounts what it sees
pub(crate) struct PollTask {
    /// The control-info packet the peer's writer publishes into
    pub ctl: DmaRegion,
    pub counters: Arc<Counters>,
    pub buf_num: u64,
    pub strategy: PollStrategy,
}

impl PollTask {
    fn run<R: RingCounter>(self, ring: R, cancel: &AtomicBool) {
        let status_offset = ChannelCtlInfo::status_offset();
        let write_point_offset = ChannelCtlInfo::write_point_offset();

        while !cancel.load(Ordering::Acquire) {
            if CtlStatus::from(self.ctl.read_u32(status_offset)) == CtlStatus::Full {
                debug!("Peer found ring full");
                self.ctl.write_u32(status_offset, CtlStatus::Normal as u32);
                self.counters.peer_full.fetch_add(1, Ordering::Relaxed);
            }

            let observed = self.ctl.read_u64(write_point_offset);
            let last = self.counters.peer_write.load(Ordering::Relaxed);
            match ring.observe(last, observed, self.buf_num) {
                Some(delta) => {
                    // Data landed before the pointer that announces it
                    fence(Ordering::Acquire);
                    self.counters.peer_write.store(observed, Ordering::Relaxed);
                    let receive = self.counters.receive.fetch_add(delta, Ordering::Release);
                    trace!("Write point {last} -> {observed}, receive {}", receive + delta);
                }
                None => self.strategy.idle(),
            }
        }
    }
}

/// Handle to a running poller thread.  Stopped on drop.
pub(crate) struct Poller {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    /// Start polling `task` on a thread called `name`, optionally pinned to
    /// `cpu`.  The pointer arithmetic is fixed for the thread's lifetime.
    pub fn spawn(name: String, cpu: Option<usize>, mode: OffsetMode, task: PollTask) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(cpu) = cpu {
                    pin_current(cpu);
                }
                debug!("Polling with {mode:?} offsets");
                match mode {
                    OffsetMode::Wrapping => task.run(Wrapping, &flag),
                    OffsetMode::Absolute => task.run(Absolute, &flag),
                }
                debug!("Poller exiting");
            })
            .map_err(|e| {
                error!("Failed to spawn poller: {e}");
                Error::ThreadSpawn
            })?;

        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it.  Idempotent.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Poller panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for(what: impl Fn() -> bool) {
        let start = Instant::now();
        while !what() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn counts_peer_writes_and_clears_full() {
        let mut mem = vec![0u64; 32];
        let ctl = unsafe { DmaRegion::from_raw_parts(mem.as_mut_ptr() as *mut u8, 0, 256) }.unwrap();
        let counters = Arc::new(Counters::default());
        let task = PollTask {
            ctl,
            counters: counters.clone(),
            buf_num: 8,
            strategy: PollStrategy::Yield,
        };
        let mut poller =
            Poller::spawn("test-poller".into(), None, OffsetMode::Wrapping, task).unwrap();

        ctl.write_u64(ChannelCtlInfo::write_point_offset(), 6);
        wait_for(|| counters.receive.load(Ordering::Acquire) == 6);

        // Wrapped past the end of the ring
        ctl.write_u64(ChannelCtlInfo::write_point_offset(), 2);
        wait_for(|| counters.receive.load(Ordering::Acquire) == 10);

        ctl.write_u32(ChannelCtlInfo::status_offset(), CtlStatus::Full as u32);
        wait_for(|| ctl.read_u32(ChannelCtlInfo::status_offset()) == 0);
        assert_eq!(counters.peer_full.load(Ordering::Relaxed), 1);

        poller.stop();
        poller.stop();
        drop(mem);
    }
}
