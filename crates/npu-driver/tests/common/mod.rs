// SPDX-License-Identifier: AGPL-3.0-only

//! Shared fixtures for the session integration tests

#![allow(dead_code)]

use npu_driver::{
    BufferSet, DeviceBuffer, Direction, DmaAllocator, DmaBuffer, DriverConfig, HostMemory, Layout,
    LoopbackFirmware, NcpHandle, NpuDevice, Session,
};
use npu_ncp::{MemoryType, NcpBuilder};
use std::sync::Arc;

/// 1 IFM (1024 B), 1 OFM (512 B), 1 weight region at offset 64 in a 2048-byte blob
pub fn reference_blob() -> Vec<u8> {
    NcpBuilder::new(2048)
        .feature_map(MemoryType::InputFeatureMap, 1024)
        .feature_map(MemoryType::OutputFeatureMap, 512)
        .weight(64, 256)
        .build()
        .expect("reference blob")
}

/// Reference network plus one 256-byte intermediate buffer
pub fn imb_blob() -> Vec<u8> {
    NcpBuilder::new(2048)
        .feature_map(MemoryType::InputFeatureMap, 1024)
        .feature_map(MemoryType::OutputFeatureMap, 512)
        .intermediate(256)
        .weight(64, 256)
        .build()
        .expect("IMB blob")
}

/// Short timeouts, four I/O slots
pub fn config() -> DriverConfig {
    DriverConfig {
        io_slots: 4,
        ..DriverConfig::fast()
    }
}

/// Device with handles on its memory and firmware
pub struct Rig {
    pub device: NpuDevice,
    pub memory: Arc<HostMemory>,
    pub firmware: Arc<LoopbackFirmware>,
}

pub fn rig(firmware: LoopbackFirmware) -> Rig {
    rig_with(config(), firmware)
}

pub fn rig_with(config: DriverConfig, firmware: LoopbackFirmware) -> Rig {
    let memory = Arc::new(HostMemory::new(false));
    let firmware = Arc::new(firmware);
    let device = NpuDevice::with_parts(config, memory.clone(), firmware.clone()).expect("device");
    Rig {
        device,
        memory,
        firmware,
    }
}

/// Open a session on the reference network and negotiate linear formats
pub fn formatted_session(rig: &Rig, handle: &NcpHandle) -> Session {
    let mut session = rig.device.open().expect("open");
    session.set_graph(handle).expect("set_graph");
    session
        .set_format(Direction::Input, &[Layout::linear(1024)])
        .expect("input format");
    session
        .set_format(Direction::Output, &[Layout::linear(512)])
        .expect("output format");
    session
}

/// Caller buffers for one frame of the reference network
pub struct Frame {
    pub input: DmaBuffer,
    pub output: DmaBuffer,
}

impl Frame {
    pub fn alloc(memory: &HostMemory) -> Self {
        Self {
            input: memory.alloc(1024).expect("input buffer"),
            output: memory.alloc(512).expect("output buffer"),
        }
    }

    pub fn sets(&self, slot: usize, frame_id: u32) -> (BufferSet, BufferSet) {
        (
            BufferSet::new(
                Direction::Input,
                slot,
                frame_id,
                vec![DeviceBuffer::of(&self.input).expect("input descriptor")],
            ),
            BufferSet::new(
                Direction::Output,
                slot,
                frame_id,
                vec![DeviceBuffer::of(&self.output).expect("output descriptor")],
            ),
        )
    }
}

/// Prepare and queue one frame
pub fn submit(session: &mut Session, frame: &Frame, slot: usize, frame_id: u32) {
    let (input, output) = frame.sets(slot, frame_id);
    session.prepare(&input).expect("prepare input");
    session.prepare(&output).expect("prepare output");
    session.queue(&input, &output).expect("queue");
}
