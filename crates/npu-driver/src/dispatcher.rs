// SPDX-License-Identifier: AGPL-3.0-only

//! Command dispatch.
//!
//! Blocking network calls wait on a [`Completion`] in two tiers: acceptance
//! by the worker, then the firmware answer.

use crate::config::{Backoff, DriverConfig};
use crate::error::{NpuError, Result, WaitPhase};
use crate::mailbox::{Mailbox, Ring};
use crate::protocol::{FrameRequest, NcpRef, NetworkCommand, NetworkRequest, RequestIds, ResultCode, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Device-wide fatal flag
///
/// Once raised it stays raised: firmware is assumed dead and every graceful
/// handshake is skipped.
#[derive(Debug, Default)]
pub struct Emergency(AtomicBool);

impl Emergency {
    /// Unraised flag
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raise the flag
    pub fn raise(&self, reason: &str) {
        if !self.0.swap(true, Ordering::AcqRel) {
            tracing::error!("NPU emergency: {reason}");
        }
    }

    /// Whether the flag is raised
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Accepted,
    Done(ResultCode),
}

/// Result slot a caller parks on while a network command is in flight
#[derive(Debug)]
pub struct Completion {
    phase: Mutex<Phase>,
    cond: Condvar,
}

impl Completion {
    /// Pending completion
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Pending),
            cond: Condvar::new(),
        }
    }

    /// Worker picked the request up
    pub fn accept(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Pending {
            *phase = Phase::Accepted;
            self.cond.notify_all();
        }
    }

    /// Terminal result arrived
    pub fn complete(&self, code: ResultCode) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = Phase::Done(code);
        self.cond.notify_all();
    }

    /// Result, if one arrived
    pub fn result(&self) -> Option<ResultCode> {
        match *self.phase.lock().unwrap_or_else(PoisonError::into_inner) {
            Phase::Done(code) => Some(code),
            _ => None,
        }
    }

    /// Wait for acceptance, then for the result
    ///
    /// # Errors
    ///
    /// [`NpuError::Timeout`] naming the phase that expired.
    pub fn wait(&self, command: NetworkCommand, accept: Duration, complete: Duration) -> Result<ResultCode> {
        let timeout = |phase, duration: Duration| NpuError::Timeout {
            command,
            phase,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        };

        let phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let (phase, _) = self
            .cond
            .wait_timeout_while(phase, accept, |phase| *phase == Phase::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Pending {
            return Err(timeout(WaitPhase::Accept, accept));
        }

        let (phase, _) = self
            .cond
            .wait_timeout_while(phase, complete, |phase| *phase == Phase::Accepted)
            .unwrap_or_else(PoisonError::into_inner);
        match *phase {
            Phase::Done(code) => Ok(code),
            _ => Err(timeout(WaitPhase::Complete, complete)),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the request rings
#[derive(Debug)]
pub struct Dispatcher {
    network: Arc<Ring<NetworkRequest>>,
    frames: Arc<Ring<FrameRequest>>,
    ids: RequestIds,
    emergency: Arc<Emergency>,
    running: Arc<AtomicBool>,
    backoff: Backoff,
    accept_timeout: Duration,
    complete_timeout: Duration,
}

impl Dispatcher {
    /// Create rings sized from `config`
    pub fn new(config: &DriverConfig, emergency: Arc<Emergency>) -> Self {
        Self {
            network: Arc::new(Ring::new("network", config.queue_depth)),
            frames: Arc::new(Ring::new("frame", config.queue_depth)),
            ids: RequestIds::new(),
            emergency,
            running: Arc::new(AtomicBool::new(false)),
            backoff: config.backoff,
            accept_timeout: config.accept_timeout,
            complete_timeout: config.complete_timeout,
        }
    }

    /// Consumer handle on the network ring
    pub fn network_ring(&self) -> Arc<Ring<NetworkRequest>> {
        Arc::clone(&self.network)
    }

    /// Consumer handle on the frame ring
    pub fn frame_ring(&self) -> Arc<Ring<FrameRequest>> {
        Arc::clone(&self.frames)
    }

    /// Flag the worker clears when it exits
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Device emergency flag
    pub fn emergency(&self) -> &Emergency {
        &self.emergency
    }

    /// Fresh request id
    pub fn next_request_id(&self) -> u32 {
        self.ids.next()
    }

    /// Issue a network command and block until firmware answers
    ///
    /// # Errors
    ///
    /// - [`NpuError::Emergency`] if the device is in emergency mode
    /// - [`NpuError::WorkerStopped`] if no worker drains the ring
    /// - [`NpuError::QueueFull`] if the ring stayed full
    /// - [`NpuError::Timeout`] if either wait tier expires; this also raises
    ///   the emergency flag
    /// - [`NpuError::Protocol`] with the firmware code on failure
    pub fn call(
        &self,
        session_id: Option<SessionId>,
        command: NetworkCommand,
        ncp: Option<NcpRef>,
        payload: u32,
    ) -> Result<()> {
        if self.emergency.is_raised() {
            return Err(NpuError::Emergency);
        }
        self.ensure_running()?;

        let completion = Arc::new(Completion::new());
        let request_id = self.ids.next();
        self.push_with_backoff(
            &self.network,
            NetworkRequest {
                session_id,
                request_id,
                command,
                ncp,
                payload,
                notify: Some(Arc::clone(&completion)),
                result: ResultCode::PENDING,
            },
        )?;
        tracing::debug!("{command} #{request_id} dispatched (session {session_id:?})");

        let code = match completion.wait(command, self.accept_timeout, self.complete_timeout) {
            Ok(code) => code,
            Err(e) => {
                self.emergency.raise(&e.to_string());
                return Err(e);
            }
        };
        if code.is_ok() {
            tracing::debug!("{command} #{request_id} completed");
            Ok(())
        } else {
            tracing::warn!("{command} #{request_id} failed: {code}");
            Err(NpuError::Protocol { command, code })
        }
    }

    /// Issue a teardown command without waiting for the result
    ///
    /// Allowed in emergency mode.
    ///
    /// # Errors
    ///
    /// [`NpuError::QueueFull`] if the ring stayed full.
    pub fn post(&self, session_id: Option<SessionId>, command: NetworkCommand) -> Result<u32> {
        let request_id = self.ids.next();
        self.push_with_backoff(
            &self.network,
            NetworkRequest {
                session_id,
                request_id,
                command,
                ncp: None,
                payload: 0,
                notify: None,
                result: ResultCode::PENDING,
            },
        )?;
        tracing::debug!("{command} #{request_id} posted (session {session_id:?})");
        Ok(request_id)
    }

    /// Push a frame request
    ///
    /// # Errors
    ///
    /// [`NpuError::Emergency`], [`NpuError::WorkerStopped`] or
    /// [`NpuError::QueueFull`]; the request is dropped in every case.
    pub fn submit_frame(&self, request: FrameRequest) -> Result<()> {
        if self.emergency.is_raised() {
            return Err(NpuError::Emergency);
        }
        self.ensure_running()?;
        self.push_with_backoff(&self.frames, request)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NpuError::WorkerStopped)
        }
    }

    fn push_with_backoff<T: Send>(&self, ring: &Ring<T>, mut item: T) -> Result<()> {
        for attempt in 0..self.backoff.attempts {
            match ring.try_push(item) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    item = back;
                    std::thread::sleep(self.backoff.delay(attempt));
                }
            }
        }
        tracing::warn!("{} ring full after {} attempts", ring.name(), self.backoff.attempts);
        Err(NpuError::QueueFull {
            queue: ring.name(),
            attempts: self.backoff.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn dispatcher(config: &DriverConfig) -> Dispatcher {
        let dispatcher = Dispatcher::new(config, Arc::new(Emergency::new()));
        dispatcher.running.store(true, Ordering::Release);
        dispatcher
    }

    #[test]
    fn completion_two_tier_wait() {
        let completion = Arc::new(Completion::new());
        let worker = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || {
                completion.accept();
                thread::sleep(Duration::from_millis(10));
                completion.complete(ResultCode::OK);
            })
        };
        let code = completion
            .wait(NetworkCommand::Load, Duration::from_secs(2), Duration::from_secs(2))
            .unwrap();
        worker.join().unwrap();
        assert_eq!(code, ResultCode::OK);
    }

    #[test]
    fn accept_tier_expires() {
        let completion = Completion::new();
        let err = completion
            .wait(NetworkCommand::StreamOn, Duration::from_millis(20), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            NpuError::Timeout {
                phase: WaitPhase::Accept,
                ..
            }
        ));
    }

    #[test]
    fn complete_tier_expires() {
        let completion = Completion::new();
        completion.accept();
        let err = completion
            .wait(NetworkCommand::Load, Duration::from_secs(1), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(
            err,
            NpuError::Timeout {
                phase: WaitPhase::Complete,
                ..
            }
        ));
    }

    #[test]
    fn call_times_out_and_raises_emergency() {
        let config = DriverConfig {
            accept_timeout: Duration::from_millis(20),
            ..DriverConfig::default()
        };
        let dispatcher = dispatcher(&config);
        let err = dispatcher.call(None, NetworkCommand::PowerDown, None, 0).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Emergency);
        assert!(dispatcher.emergency().is_raised());
        assert!(matches!(
            dispatcher.call(None, NetworkCommand::PowerDown, None, 0),
            Err(NpuError::Emergency)
        ));
        assert!(dispatcher.post(None, NetworkCommand::ClearCb).is_ok());
    }

    #[test]
    fn call_without_worker_fails_fast() {
        let dispatcher = Dispatcher::new(&DriverConfig::default(), Arc::new(Emergency::new()));
        assert!(matches!(
            dispatcher.call(None, NetworkCommand::PowerDown, None, 0),
            Err(NpuError::WorkerStopped)
        ));
    }

    #[test]
    fn full_ring_reports_queue_full() {
        let config = DriverConfig {
            queue_depth: 1,
            backoff: Backoff {
                initial: Duration::from_micros(1),
                max: Duration::from_micros(10),
                attempts: 4,
            },
            ..DriverConfig::default()
        };
        let dispatcher = dispatcher(&config);
        dispatcher.post(None, NetworkCommand::Unload).unwrap();
        assert!(matches!(
            dispatcher.post(None, NetworkCommand::Unload),
            Err(NpuError::QueueFull {
                queue: "network",
                attempts: 4
            })
        ));
    }

    #[test]
    fn firmware_failure_is_passed_through() {
        let dispatcher = Arc::new(dispatcher(&DriverConfig::default()));
        let ring = dispatcher.network_ring();
        let fake_worker = thread::spawn(move || loop {
            if let Some(request) = ring.try_pop() {
                let notify = request.notify.unwrap();
                notify.accept();
                notify.complete(ResultCode::from_raw(0x55));
                break;
            }
            thread::yield_now();
        });
        let err = dispatcher
            .call(Some(SessionId(1)), NetworkCommand::Load, None, 0)
            .unwrap_err();
        fake_worker.join().unwrap();
        assert!(matches!(
            err,
            NpuError::Protocol {
                command: NetworkCommand::Load,
                code
            } if code.raw() == 0x55
        ));
        assert!(!dispatcher.emergency().is_raised());
    }
}
