// SPDX-License-Identifier: AGPL-3.0-only

//! Device context shared by all sessions.

use crate::config::DriverConfig;
use crate::dispatcher::{Dispatcher, Emergency};
use crate::error::{NpuError, Result};
use crate::firmware::{Firmware, LoopbackFirmware};
use crate::memory::{DmaAllocator, HostMemory};
use crate::params::{FirmwareTestHandler, ParamChain, QosHandler, QosTable};
use crate::protocol::{NetworkCommand, SessionId};
use crate::session::Session;
use crate::worker::{WorkerHandle, WorkerParts, WorkerSnapshot};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Session id allocator
#[derive(Debug)]
pub struct SessionRegistry {
    max: usize,
    live: Mutex<BTreeSet<u32>>,
}

impl SessionRegistry {
    /// Registry handing out ids `1..=max`
    pub const fn new(max: usize) -> Self {
        Self {
            max,
            live: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lowest free id
    ///
    /// # Errors
    ///
    /// [`NpuError::SessionLimit`] when every id is taken.
    pub fn acquire(&self) -> Result<SessionId> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = u32::try_from(self.max).unwrap_or(u32::MAX);
        let id = (1..=limit)
            .find(|id| !live.contains(id))
            .ok_or(NpuError::SessionLimit { max: self.max })?;
        live.insert(id);
        tracing::debug!("Registered session {id} ({} live)", live.len());
        Ok(SessionId(id))
    }

    /// Return `id` to the pool
    pub fn release(&self, id: SessionId) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.remove(&id.0) {
            tracing::debug!("Unregistered session {id} ({} live)", live.len());
        }
    }

    /// Sessions currently registered
    pub fn len(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by the device and its sessions
#[derive(Debug)]
pub(crate) struct DeviceContext {
    pub(crate) config: DriverConfig,
    pub(crate) memory: Arc<dyn DmaAllocator>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: SessionRegistry,
    pub(crate) params: ParamChain,
    pub(crate) qos: Arc<QosTable>,
}

/// An NPU and its protocol worker
#[derive(Debug)]
pub struct NpuDevice {
    ctx: Arc<DeviceContext>,
    emergency: Arc<Emergency>,
    worker: WorkerHandle,
}

impl NpuDevice {
    /// Device backed by host memory and the loopback firmware
    ///
    /// # Errors
    ///
    /// As [`Self::with_parts`].
    pub fn loopback(config: DriverConfig) -> Result<Self> {
        let memory = Arc::new(HostMemory::new(config.lock_pages));
        let firmware = Arc::new(LoopbackFirmware::new(config.queue_depth));
        Self::with_parts(config, memory, firmware)
    }

    /// Device over caller-supplied memory and firmware
    ///
    /// # Errors
    ///
    /// [`NpuError::InvalidArgument`] if `config` fails
    /// [`DriverConfig::validate`], [`NpuError::Io`] if the worker thread
    /// cannot be spawned.
    pub fn with_parts(
        config: DriverConfig,
        memory: Arc<dyn DmaAllocator>,
        firmware: Arc<dyn Firmware>,
    ) -> Result<Self> {
        config.validate()?;
        let emergency = Arc::new(Emergency::new());
        let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&emergency)));
        let worker = WorkerHandle::spawn(WorkerParts {
            network: dispatcher.network_ring(),
            frames: dispatcher.frame_ring(),
            firmware,
            emergency: Arc::clone(&emergency),
            running: dispatcher.running_flag(),
            timeouts: config.worker,
            idle_poll: config.idle_poll,
        })?;

        let qos = Arc::new(QosTable::new());
        let mut params = ParamChain::new();
        params.push(Box::new(FirmwareTestHandler::new(Arc::clone(&dispatcher))));
        params.push(Box::new(QosHandler::new(Arc::clone(&qos))));

        tracing::info!(
            "NPU device up: {} I/O slots, {} sessions max, queue depth {}",
            config.io_slots, config.max_sessions, config.queue_depth
        );
        Ok(Self {
            ctx: Arc::new(DeviceContext {
                registry: SessionRegistry::new(config.max_sessions),
                config,
                memory,
                dispatcher,
                params,
                qos,
            }),
            emergency,
            worker,
        })
    }

    /// Open a new session
    ///
    /// # Errors
    ///
    /// [`NpuError::SessionLimit`] when every session slot is taken.
    pub fn open(&self) -> Result<Session> {
        Session::open(Arc::clone(&self.ctx))
    }

    /// Issue POWER_DOWN
    ///
    /// Firmware sees it once no session holds a loaded network.
    ///
    /// # Errors
    ///
    /// Any dispatcher error.
    pub fn power_down(&self) -> Result<()> {
        self.ctx
            .dispatcher
            .call(None, NetworkCommand::PowerDown, None, 0)
    }

    /// Whether the device entered emergency mode
    pub fn is_emergency(&self) -> bool {
        self.emergency.is_raised()
    }

    /// Enter emergency mode
    pub fn raise_emergency(&self, reason: &str) {
        self.emergency.raise(reason);
    }

    /// Configuration in use
    pub fn config(&self) -> &DriverConfig {
        &self.ctx.config
    }

    /// DMA allocator in use
    pub fn memory(&self) -> &Arc<dyn DmaAllocator> {
        &self.ctx.memory
    }

    /// Registered sessions
    pub fn sessions(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Protocol worker bookkeeping
    pub fn worker_snapshot(&self) -> WorkerSnapshot {
        self.worker.snapshot()
    }

    /// Aggregated QoS requests
    pub fn qos(&self) -> &QosTable {
        &self.ctx.qos
    }

    /// Stop the protocol worker
    ///
    /// Pending requests complete with `EMERGENCY`; later calls fail with
    /// [`NpuError::WorkerStopped`].
    pub fn shutdown(&mut self) {
        self.worker.stop();
    }
}

impl Drop for NpuDevice {
    fn drop(&mut self) {
        self.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn registry_reuses_lowest_free_id() {
        let registry = SessionRegistry::new(3);
        assert_eq!(registry.acquire().unwrap(), SessionId(1));
        assert_eq!(registry.acquire().unwrap(), SessionId(2));
        assert_eq!(registry.acquire().unwrap(), SessionId(3));
        assert!(matches!(registry.acquire(), Err(NpuError::SessionLimit { max: 3 })));

        registry.release(SessionId(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.acquire().unwrap(), SessionId(2));
    }

    #[test]
    fn open_and_close_release_the_slot() {
        let device = NpuDevice::loopback(DriverConfig::fast()).unwrap();
        let mut session = device.open().unwrap();
        assert_eq!(device.sessions(), 1);
        session.close().unwrap();
        assert_eq!(device.sessions(), 0);
        assert!(session.progress().is_empty());
    }

    #[test]
    fn dropped_session_closes_itself() {
        let device = NpuDevice::loopback(DriverConfig::fast()).unwrap();
        drop(device.open().unwrap());
        assert_eq!(device.sessions(), 0);
    }

    #[test]
    fn inverted_timeouts_are_refused() {
        let config = DriverConfig {
            accept_timeout: Duration::from_secs(6),
            complete_timeout: Duration::from_secs(2),
            ..DriverConfig::default()
        };
        assert!(matches!(NpuDevice::loopback(config), Err(NpuError::InvalidArgument { .. })));
    }

    #[test]
    fn power_down_with_no_sessions() {
        let device = NpuDevice::loopback(DriverConfig::fast()).unwrap();
        device.power_down().unwrap();
    }
}
