// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Master and slave transports talking over the in-process fabric.

use std::time::{Duration, Instant};

use srio_channels::channel::{CTL_TRUE_SIZE, ChannelCtlInfo};
use srio_channels::io::{DmaEngine, SrioDriver};
use srio_channels::loopback::{Fabric, LoopbackDriver};
use srio_channels::port::{HandshakeState, PortStatus, Role};
use srio_channels::window::{window_law, window_size};
use srio_channels::wire::{SYMBOL, channel_ctl_offset};
use srio_channels::{
    Capabilities, ChannelGeometry, ChannelHandle, Error, FiberOp, PollStrategy, PortConfig,
    TransportManager,
};

const KB: usize = 1024;
const MASTER_ID: u32 = 0x11;
const SLAVE_ID: u32 = 0x14;
const RX_REGION: usize = 0x10_0000;

type Manager = TransportManager<LoopbackDriver>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn master_config(port: u8, channels: Vec<ChannelGeometry>) -> PortConfig {
    PortConfig::master(port, channels)
        .with_ids(MASTER_ID, SLAVE_ID)
        .with_handshake_timeout(Duration::from_secs(2))
        .with_poll_strategy(PollStrategy::Yield)
        .with_pinning(false)
}

fn slave_config(port: u8, chan_num: usize, version: u64) -> PortConfig {
    PortConfig::slave(port, chan_num)
        .with_ids(SLAVE_ID, MASTER_ID)
        .with_version(Capabilities::from_bits(version))
        .with_rx_region_size(RX_REGION)
        .with_handshake_timeout(Duration::from_secs(2))
        .with_poll_strategy(PollStrategy::Yield)
        .with_pinning(false)
}

struct Link {
    master: Manager,
    slave: Manager,
    master_io: LoopbackDriver,
}

/// Bring up port 0 on both sides
fn link(channels: Vec<ChannelGeometry>, version: u64) -> Link {
    init_logging();
    let (master_io, slave_io) = Fabric::pair();
    let slave = TransportManager::new(slave_io);
    slave
        .init(slave_config(0, channels.len(), version))
        .unwrap();
    let master = TransportManager::new(master_io.clone());
    master.init(master_config(0, channels)).unwrap();
    Link {
        master,
        slave,
        master_io,
    }
}

/// Open `name` on both sides, slave first so the master sees its ack
fn open_pair(link: &Link, name: &str) -> (ChannelHandle, ChannelHandle) {
    let rx = link.slave.open(name).unwrap();
    let tx = link.master.open(name).unwrap();
    (tx, rx)
}

/// Stage `data` in DMA memory and write it
fn write(manager: &Manager, handle: ChannelHandle, data: &[u8]) -> Result<(), Error> {
    let src = manager.alloc(data.len().max(1)).unwrap();
    src.write_bytes(0, data);
    manager.write(handle, src.phys(), data.len())
}

/// Read and ack until `len` bytes have arrived
fn read_exact(manager: &Manager, handle: ChannelHandle, len: usize) -> Vec<u8> {
    let start = Instant::now();
    let mut out = Vec::new();
    while out.len() < len {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "only {} of {len} bytes arrived",
            out.len()
        );
        let received = manager.read(handle, len - out.len()).unwrap();
        if received.is_empty() {
            std::thread::yield_now();
            continue;
        }
        out.extend_from_slice(received.data());
        manager.ack_read(handle, received.slots()).unwrap();
    }
    out.truncate(len);
    out
}

fn wait_for(what: impl Fn() -> bool) {
    let start = Instant::now();
    while !what() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out");
        std::thread::yield_now();
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn handshake_completes() {
    let link = link(vec![ChannelGeometry::new(KB, 8); 2], 0x07);
    assert_eq!(link.master.handshake_state(0), HandshakeState::Ready);
    assert_eq!(link.slave.handshake_state(0), HandshakeState::Ready);
    assert_eq!(link.master.port_status(0), PortStatus::Ready);
    assert_eq!(link.slave.port_status(0), PortStatus::Ready);
    assert_eq!(link.master.port_status(1), PortStatus::Uninit);
    assert_eq!(link.master.link_status(0).unwrap(), [0u8; 256]);
}

#[test]
fn handshake_times_out_without_slave() {
    init_logging();
    let (master_io, _slave_io) = Fabric::pair();
    let master = TransportManager::new(master_io);
    let config = master_config(0, vec![ChannelGeometry::new(KB, 8)])
        .with_handshake_timeout(Duration::from_millis(200));

    let start = Instant::now();
    assert_eq!(master.init(config.clone()), Err(Error::HandshakeTimeout));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(master.port_status(0), PortStatus::Uninit);
    assert_eq!(master.open("srio0-chan0"), Err(Error::Uninit));

    // The port is not left half initialized
    assert_eq!(master.init(config), Err(Error::HandshakeTimeout));
}

#[test]
fn init_twice_is_rejected() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    assert_eq!(
        link.master
            .init(master_config(0, vec![ChannelGeometry::new(KB, 8)])),
        Err(Error::InvalidOperation)
    );
    assert!(matches!(
        link.master.init(master_config(2, vec![ChannelGeometry::new(KB, 8)])),
        Err(Error::Config(_))
    ));
}

#[test]
fn open_errors() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    assert_eq!(link.master.open("srio9-chan0"), Err(Error::ChannelNotFound));
    assert_eq!(link.master.open("srio1-chan0"), Err(Error::Uninit));
    // Port 0 only has one channel
    assert_eq!(link.slave.open("srio0-chan1"), Err(Error::ChannelNotFound));

    let (tx, _rx) = open_pair(&link, "srio0-chan0");
    assert_eq!(link.master.open("srio0-chan0"), Err(Error::ChannelAlreadyOpen));
    assert_eq!(tx.name(), "srio0-chan0");
}

#[test]
fn master_open_waits_for_channel_ready() {
    init_logging();
    let (master_io, slave_io) = Fabric::pair();
    let slave = TransportManager::new(slave_io);
    slave.init(slave_config(0, 1, 0x07)).unwrap();
    let master = TransportManager::new(master_io);
    master
        .init(
            master_config(0, vec![ChannelGeometry::new(KB, 8)])
                .with_handshake_timeout(Duration::from_millis(200)),
        )
        .unwrap();

    // Slave has not opened the channel
    assert_eq!(master.open("srio0-chan0"), Err(Error::HandshakeTimeout));

    // The failed open released the name
    slave.open("srio0-chan0").unwrap();
    master.open("srio0-chan0").unwrap();
}

#[test]
fn ring_full_until_acknowledged() {
    let link = link(vec![ChannelGeometry::new(KB, 8); 2], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    let first = pattern(8 * KB, 1);
    write(&link.master, tx, &first).unwrap();
    assert_eq!(write(&link.master, tx, &[0x55; KB]), Err(Error::WouldBlock));
    let counters = link.master.counters(tx).unwrap();
    assert_eq!(counters.send, 8);
    assert_eq!(counters.reserved, 8);

    let start = Instant::now();
    let received = loop {
        let received = link.slave.read(rx, 8 * KB).unwrap();
        if !received.is_empty() {
            break received;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        std::thread::yield_now();
    };
    assert_eq!(received.slots(), 8);
    assert_eq!(received.data(), &first[..]);
    link.slave.ack_read(rx, 8).unwrap();

    write(&link.master, tx, &[0x55; KB]).unwrap();
    assert_eq!(read_exact(&link.slave, rx, KB), vec![0x55; KB]);
}

#[test]
fn oversized_and_empty_writes() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");
    // Never fits, but is reported like any other full ring
    assert_eq!(
        write(&link.master, tx, &vec![0; 8 * KB + 1]),
        Err(Error::WouldBlock)
    );
    wait_for(|| link.slave.counters(rx).unwrap().peer_full == 1);
    assert_eq!(link.slave.counters(rx).unwrap().receive, 0);

    write(&link.master, tx, &[]).unwrap();
    assert_eq!(link.master.counters(tx).unwrap().send, 0);
    assert!(link.slave.read(rx, KB).unwrap().is_empty());
    assert_eq!(link.slave.ack_read(rx, 1), Err(Error::InvalidOperation));
}

#[test]
fn blocked_write_reports_full_ring() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    write(&link.master, tx, &pattern(8 * KB, 8)).unwrap();
    wait_for(|| link.slave.counters(rx).unwrap().receive == 8);
    assert_eq!(link.slave.counters(rx).unwrap().peer_full, 0);

    assert_eq!(write(&link.master, tx, &[3; KB]), Err(Error::WouldBlock));
    wait_for(|| link.slave.counters(rx).unwrap().peer_full == 1);

    // Only the control info crossed the link
    assert_eq!(link.slave.counters(rx).unwrap().receive, 8);
    assert_eq!(link.master.counters(tx).unwrap().send, 8);
}

#[test]
fn read_returns_whole_slots() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    let data = pattern(300, 10);
    write(&link.master, tx, &data).unwrap();
    wait_for(|| link.slave.counters(rx).unwrap().receive == 1);

    let received = link.slave.read(rx, 100).unwrap();
    assert_eq!(received.slots(), 1);
    assert_eq!(received.len(), KB);
    assert_eq!(&received.data()[..300], &data[..]);
    link.slave.ack_read(rx, 1).unwrap();
}

#[test]
fn read_rejects_peer_overrunning_ring() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (_tx, rx) = open_pair(&link, "srio0-chan0");

    // Publish a write point 12 slots ahead straight into the slave's
    // control region, bypassing the writer's capacity check
    let info = link.master_io.connect(0).unwrap();
    let ctl_info_start = info.range_start + window_size(window_law(8 * KB as u64));
    let dest = ctl_info_start + (channel_ctl_offset(0) + Role::Master.write_slot()) as u64;
    let src = link.master.alloc(CTL_TRUE_SIZE).unwrap();
    src.write_u32(ChannelCtlInfo::symbol_offset(), SYMBOL);
    src.write_u64(ChannelCtlInfo::write_point_offset(), 12);
    let mut dma = link.master_io.dma_engine(0, 6).unwrap();
    dma.transfer(src.phys(), dest, CTL_TRUE_SIZE).unwrap();

    wait_for(|| link.slave.counters(rx).unwrap().receive == 12);
    assert_eq!(link.slave.read(rx, KB), Err(Error::RingOverflow));
    assert_eq!(link.slave.counters(rx).unwrap().read, 0);
}

#[test]
fn wrapping_offsets_split_across_ring_end() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x03);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    // One slot is held back in wrapping mode
    let first = pattern(7 * KB, 2);
    write(&link.master, tx, &first).unwrap();
    assert_eq!(write(&link.master, tx, &[1; KB]), Err(Error::WouldBlock));
    assert_eq!(read_exact(&link.slave, rx, 7 * KB), first);

    // Slot 7, then slots 0 and 1
    let second = pattern(3 * KB - 100, 3);
    write(&link.master, tx, &second).unwrap();
    assert_eq!(read_exact(&link.slave, rx, second.len()), second);

    let counters = link.slave.counters(rx).unwrap();
    assert_eq!(counters.receive, 10);
    assert_eq!(counters.read, 10);
    assert_eq!(counters.freed, 10);
    assert_eq!(counters.peer_write, 2);
}

#[test]
fn messages_arrive_in_order_both_ways() {
    let link = link(
        vec![ChannelGeometry::new(KB, 4), ChannelGeometry::new(2 * KB, 4)],
        0x05,
    );
    let (m0, s0) = open_pair(&link, "srio0-chan0");
    let (m1, s1) = open_pair(&link, "srio0-chan1");

    for (writer, w, reader, r, size) in [
        (&link.master, m0, &link.slave, s0, KB),
        (&link.slave, s1, &link.master, m1, 2 * KB),
    ] {
        let messages: Vec<Vec<u8>> = (0..20).map(|i| pattern(size - 24, i)).collect();
        let mut received = Vec::new();
        for message in &messages {
            let start = Instant::now();
            while write(writer, w, message) == Err(Error::WouldBlock) {
                assert!(start.elapsed() < Duration::from_secs(5));
                received.push(read_exact(reader, r, size));
            }
        }
        while received.len() < messages.len() {
            received.push(read_exact(reader, r, size));
        }
        for (message, slot) in messages.iter().zip(&received) {
            assert_eq!(&slot[..message.len()], &message[..]);
        }
    }
}

#[test]
fn true_size_control_blocks_without_second_handshake() {
    let link = link(vec![ChannelGeometry::new(4 * KB, 4)], 0x00);
    // Master does not wait for the slave here
    let tx = link.master.open("srio0-chan0").unwrap();
    let rx = link.slave.open("srio0-chan0").unwrap();

    let data = pattern(5000, 9);
    write(&link.master, tx, &data).unwrap();
    assert_eq!(read_exact(&link.slave, rx, data.len()), data);
}

#[test]
fn fiber_start_and_stop() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    assert_eq!(
        link.slave.op_command(0, FiberOp::Start),
        Err(Error::InvalidOperation)
    );
    assert_eq!(link.master.op_command(1, FiberOp::Start), Err(Error::Uninit));

    link.master.op_command(0, FiberOp::Start).unwrap();
    assert_eq!(link.master.port_status(0), PortStatus::Started);
    assert_eq!(link.slave.port_status(0), PortStatus::Started);
    assert_eq!(
        link.master.op_command(0, FiberOp::Start),
        Err(Error::InvalidOperation)
    );

    write(&link.master, tx, &pattern(3 * KB, 4)).unwrap();
    read_exact(&link.slave, rx, 3 * KB);

    link.master.op_command(0, FiberOp::Stop).unwrap();
    assert_eq!(link.master.port_status(0), PortStatus::Stopped);
    assert_eq!(link.slave.port_status(0), PortStatus::Stopped);
    assert_eq!(
        link.master.op_command(0, FiberOp::Stop),
        Err(Error::InvalidOperation)
    );
    let counters = link.master.counters(tx).unwrap();
    assert_eq!(counters.send, 0);
    assert_eq!(counters.reserved, 8);
    assert_eq!(link.slave.counters(rx).unwrap().receive, 0);

    // A fresh session starts at slot 0
    let data = pattern(8 * KB, 5);
    write(&link.master, tx, &data).unwrap();
    assert_eq!(read_exact(&link.slave, rx, data.len()), data);
}

#[test]
fn close_and_reopen() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");
    write(&link.master, tx, &pattern(2 * KB, 6)).unwrap();
    read_exact(&link.slave, rx, 2 * KB);

    link.master.close(tx).unwrap();
    link.slave.close(rx).unwrap();
    assert_eq!(link.master.close(tx), Err(Error::InvalidOperation));
    assert_eq!(link.master.write(tx, 0, 1), Err(Error::InvalidOperation));

    let (tx, rx) = open_pair(&link, "srio0-chan0");
    let counters = link.master.counters(tx).unwrap();
    assert_eq!(counters.send, 2);
    // The peer's acks are picked up on the next write
    assert_eq!(counters.reserved, 8);

    let data = pattern(7 * KB, 7);
    write(&link.master, tx, &data).unwrap();
    assert_eq!(read_exact(&link.slave, rx, data.len()), data);
}

#[test]
fn dma_failure_is_reported() {
    let link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, rx) = open_pair(&link, "srio0-chan0");

    link.master_io.set_dma_failure(true);
    assert_eq!(
        write(&link.master, tx, &[1; 100]),
        Err(Error::DmaTransferFailed)
    );
    link.master_io.set_dma_failure(false);

    write(&link.master, tx, &[2; 100]).unwrap();
    assert_eq!(read_exact(&link.slave, rx, 100), vec![2; 100]);
}

#[test]
fn finish_is_idempotent() {
    let mut link = link(vec![ChannelGeometry::new(KB, 8)], 0x07);
    let (tx, _rx) = open_pair(&link, "srio0-chan0");
    link.master.finish();
    link.master.finish();
    assert_eq!(link.master.port_status(0), PortStatus::Uninit);
    assert_eq!(link.master.counters(tx), Err(Error::InvalidOperation));
    link.slave.finish();
}
