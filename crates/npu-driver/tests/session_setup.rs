// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for graph setup, format negotiation and teardown
//!
//! Every failure path must leave no live allocation and no extra reference on
//! the caller's NCP.

mod common;

use common::{formatted_session, imb_blob, reference_blob, rig, Rig};
use npu_driver::{
    DmaAllocator, Direction, ErrorClass, Layout, LoopbackFirmware, NcpHandle, NetworkCommand, NpuError, Stage,
    FIRMWARE_ERROR,
};
use npu_ncp::{MemoryType, NcpBuilder, NcpView};

fn opened_bits() -> u32 {
    Stage::Open.bit() | Stage::Registered.bit()
}

fn address_base(blob: &[u8], index: usize) -> u32 {
    NcpView::new(blob)
        .expect("view")
        .address_vectors()
        .expect("address vectors")
        .get(index)
        .expect("entry")
        .base_address
}

fn stride(blob: &[u8], entry: usize) -> u32 {
    NcpView::new(blob)
        .expect("view")
        .memory_vectors()
        .expect("memory vectors")
        .get(entry)
        .expect("entry")
        .stride
}

/// The reference network resolves, rewrites its weight and sizes its I/O tables
#[test]
fn test_reference_network_round_trip() {
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(reference_blob());
    let mut session = rig.device.open().expect("open");
    session.set_graph(&handle).expect("set_graph");

    let resolved = session.resolved().expect("resolved tables");
    assert_eq!(resolved.counts.ifm, 1);
    assert_eq!(resolved.counts.ofm, 1);
    assert_eq!(resolved.counts.imb, 0);
    assert_eq!(resolved.counts.weight, 1);
    assert_eq!(resolved.io_vector_count(), 2);

    let base = session.ncp_daddr().expect("mapped NCP");
    assert_eq!(resolved.weights[0].daddr, base + 64);
    let rewritten = address_base(&handle.snapshot(), 2);
    assert_eq!(u64::from(rewritten), base + 64);

    let table = session.io_vectors(0).expect("slot 0 table");
    assert_eq!(table.len(), 2);
    assert_eq!((table[0].index, table[0].size), (0, 1024));
    assert_eq!((table[1].index, table[1].size), (1, 512));
    assert_eq!(session.slot_count(), rig.device.config().io_slots);
    assert!(session.is_loaded());
    assert!(session.progress().contains(Stage::ImbBuffersAllocated));
    assert_eq!(rig.firmware.stats().commands, [NetworkCommand::Load]);

    session.close().expect("close");
}

/// A memory vector naming address vector 7 of 4 fails before any allocation
#[test]
fn test_bad_address_index_allocates_nothing() {
    let blob = NcpBuilder::new(2048)
        .feature_map(MemoryType::InputFeatureMap, 1024)
        .feature_map(MemoryType::OutputFeatureMap, 512)
        .weight(64, 256)
        .address_vector(0, 16)
        .memory_vector(MemoryType::OutputFeatureMap, 7)
        .build()
        .expect("blob");
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(&blob);

    let mut session = rig.device.open().expect("open");
    let err = session.set_graph(&handle).expect_err("index 7 must be rejected");
    assert_eq!(err.class(), ErrorClass::Format);

    assert_eq!(rig.memory.alloc_attempts(), 0);
    assert_eq!(rig.memory.live_buffers(), 0);
    assert_eq!(handle.ref_count(), 1);
    assert_eq!(session.progress().bits(), opened_bits());
    assert!(rig.firmware.stats().commands.is_empty());
    assert_eq!(handle.snapshot(), blob);
}

/// An allocation failure at any stage unwinds to a freshly opened session
#[test]
fn test_injected_allocation_failure_unwinds_every_stage() {
    let blob = imb_blob();
    // four I/O tables then one IMB
    for n in 1..=5 {
        let rig = rig(LoopbackFirmware::new(16));
        let handle = NcpHandle::new(&blob);
        let mut session = rig.device.open().expect("open");

        rig.memory.fail_nth_alloc(n);
        let err = session.set_graph(&handle).expect_err("injected failure");
        assert!(matches!(err, NpuError::AllocFailed { .. }), "allocation {n}: {err}");
        assert_eq!(err.class(), ErrorClass::Resource);

        assert_eq!(rig.memory.live_buffers(), 0, "allocation {n} leaked");
        assert_eq!(handle.ref_count(), 1, "allocation {n} kept the mapping");
        assert_eq!(session.progress().bits(), opened_bits());
        assert_eq!(session.undo_depth(), 1);
        assert_eq!(handle.snapshot(), blob, "allocation {n} left patches behind");

        session.close().expect("close");
        assert!(session.progress().is_empty());
        assert_eq!(rig.device.sessions(), 0);
    }
}

/// A failed mapping leaves nothing behind
#[test]
fn test_map_failure_unwinds() {
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(reference_blob());
    let mut session = rig.device.open().expect("open");

    rig.memory.fail_nth_map(1);
    let err = session.set_graph(&handle).expect_err("map failure");
    assert!(matches!(err, NpuError::MapFailed { .. }));
    assert_eq!(handle.ref_count(), 1);
    assert_eq!(session.progress().bits(), opened_bits());
}

/// open, failing set_graph, close: the NCP reference count returns to baseline
#[test]
fn test_close_after_failed_set_graph_releases_mapping() {
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(imb_blob());
    let baseline = handle.ref_count();

    let mut session = rig.device.open().expect("open");
    rig.memory.fail_nth_alloc(5);
    assert!(session.set_graph(&handle).is_err());
    session.close().expect("close");

    assert_eq!(handle.ref_count(), baseline);
    assert_eq!(rig.memory.live_buffers(), 0);
}

/// A firmware LOAD failure is reported verbatim and unwinds the setup
#[test]
fn test_load_rejected_by_firmware() {
    let rig = rig(LoopbackFirmware::new(16).failing(NetworkCommand::Load));
    let handle = NcpHandle::new(imb_blob());
    let mut session = rig.device.open().expect("open");

    let err = session.set_graph(&handle).expect_err("LOAD fails");
    assert!(matches!(
        err,
        NpuError::Protocol {
            command: NetworkCommand::Load,
            code
        } if code == FIRMWARE_ERROR
    ));
    assert_eq!(rig.memory.live_buffers(), 0);
    assert_eq!(handle.ref_count(), 1);
    assert!(!session.is_loaded());
}

/// IMBs are allocated once per session and patched into the address table
#[test]
fn test_imb_addresses_patched() {
    let rig = rig(LoopbackFirmware::new(16));
    let blob = imb_blob();
    let handle = NcpHandle::new(&blob);
    let mut session = rig.device.open().expect("open");
    session.set_graph(&handle).expect("set_graph");

    let imbs = session.imb_daddrs();
    assert_eq!(imbs.len(), 1);
    assert_eq!(u64::from(address_base(&handle.snapshot(), 2)), imbs[0]);
    // every buffer firmware reads was synced before LOAD
    assert!(rig.memory.sync_count() >= 3);

    session.close().expect("close");
    assert_eq!(handle.snapshot(), blob);
    assert_eq!(rig.memory.live_buffers(), 0);
}

/// Operations out of order fail without side effects
#[test]
fn test_ordering_errors() {
    let rig = rig(LoopbackFirmware::new(16));
    let mut session = rig.device.open().expect("open");

    let err = session
        .set_format(Direction::Input, &[Layout::linear(1024)])
        .expect_err("format before graph");
    assert_eq!(err.class(), ErrorClass::Ordering);
    assert!(matches!(session.start(), Err(NpuError::Ordering { .. })));
    assert!(matches!(session.dequeue(Direction::Output), Err(NpuError::Ordering { .. })));
    assert_eq!(session.progress().bits(), opened_bits());

    let handle = NcpHandle::new(reference_blob());
    session.set_graph(&handle).expect("set_graph");
    assert!(matches!(
        session.set_format(Direction::Output, &[Layout::linear(512)]),
        Err(NpuError::Ordering {
            required: Stage::FormatInSet,
            ..
        })
    ));
    assert!(session.progress().contains(Stage::ImbBuffersAllocated));
    assert!(session.set_graph(&handle).is_err());
}

/// A rejected layout unwinds the session to its opened state
#[test]
fn test_bad_format_unwinds() {
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(reference_blob());
    let mut session = rig.device.open().expect("open");
    session.set_graph(&handle).expect("set_graph");

    let err = session
        .set_format(Direction::Input, &[Layout::linear(512)])
        .expect_err("layout smaller than buffer");
    assert_eq!(err.class(), ErrorClass::Usage);
    assert_eq!(session.progress().bits(), opened_bits());
    assert_eq!(rig.memory.live_buffers(), 0);
    assert_eq!(handle.ref_count(), 1);

    session.set_graph(&handle).expect("graph can be set again");
    let err = session
        .set_format(Direction::Input, &[Layout::linear(1024), Layout::linear(1024)])
        .expect_err("two layouts for one feature map");
    assert!(matches!(err, NpuError::InvalidArgument { .. }));
}

/// The negotiated stride lands in the memory vector and is restored on close
#[test]
fn test_stride_written_and_restored() {
    let blob = NcpBuilder::new(2048)
        .feature_map_with_stride(MemoryType::InputFeatureMap, 1024, 99)
        .feature_map(MemoryType::OutputFeatureMap, 512)
        .weight(64, 256)
        .build()
        .expect("blob");
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(&blob);
    let mut session = rig.device.open().expect("open");
    session.set_graph(&handle).expect("set_graph");

    let square = Layout {
        pixel_format: 8,
        width: 32,
        height: 32,
        channels: 1,
        stride: 32,
    };
    session.set_format(Direction::Input, &[square]).expect("input format");
    assert_eq!(stride(&handle.snapshot(), 0), 32);
    assert_eq!(session.resolved().expect("resolved").ifm[0].stride, 32);

    session.close().expect("close");
    assert_eq!(stride(&handle.snapshot(), 0), 99);
}

/// Close is idempotent and releases the session id and QoS requests
#[test]
fn test_close_is_idempotent() {
    let rig = rig(LoopbackFirmware::new(16));
    let handle = NcpHandle::new(reference_blob());
    let mut session = formatted_session(&rig, &handle);
    session.start().expect("start");

    session.close().expect("first close");
    session.close().expect("second close");
    assert!(session.is_closed());
    assert!(session.progress().is_empty());
    assert_eq!(rig.device.sessions(), 0);
    assert_eq!(rig.memory.live_buffers(), 0);
    assert!(matches!(session.start(), Err(NpuError::Ordering { .. })));
}

/// The registry enforces the session limit
#[test]
fn test_session_limit() {
    let config = npu_driver::DriverConfig {
        max_sessions: 2,
        ..common::config()
    };
    let Rig { device, .. } = common::rig_with(config, LoopbackFirmware::new(16));
    let _a = device.open().expect("first");
    let b = device.open().expect("second");
    assert!(matches!(device.open(), Err(NpuError::SessionLimit { max: 2 })));
    drop(b);
    device.open().expect("slot freed by drop");
}
