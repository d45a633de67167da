// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol worker.
//!
//! One long-lived thread drains both request rings, forwards what firmware
//! may see, matches firmware answers to requests by id and enforces
//! deadlines. It is the only place that knows whether a session is loaded,
//! streaming or stopping.
//!
//! ```text
//! REQUESTED ──forward──▶ PROCESSING ──answer──▶ COMPLETED ──▶ FREE
//!     │                      │
//!     └─SCHED_TIMEOUT        └─NPU_TIMEOUT / QUEUE_TIMEOUT ──▶ STUCK
//! ```

use crate::config::WorkerTimeouts;
use crate::dispatcher::Emergency;
use crate::firmware::Firmware;
use crate::mailbox::{Doorbell, Mailbox, Ring};
use crate::protocol::{
    FirmwareResponse, FrameDone, FrameMessage, FrameRequest, NetworkCommand, NetworkMessage, NetworkRequest,
    RequestKind, ResultCode, SessionId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle of a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Accepted from the ring, not yet forwarded
    Requested,
    /// Forwarded to firmware
    Processing,
    /// Result delivered
    Completed,
    /// Slot released
    Free,
    /// Timed out in firmware
    Stuck,
}

/// Firmware-side state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// LOAD in flight
    Loading,
    /// Loaded, not streaming
    Inactive,
    /// Streaming
    Active,
    /// STREAMOFF in flight
    Stopping,
}

/// Worker bookkeeping, published after every pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Requests not yet released
    pub tracked: usize,
    /// Requests parked as stuck
    pub stuck: usize,
    /// Sessions firmware holds a network for
    pub sessions: usize,
}

#[derive(Debug)]
struct SessionRef {
    state: RefState,
    outstanding: usize,
}

#[derive(Debug)]
struct Tracked<R> {
    request: R,
    state: RequestState,
    since: Instant,
    answer: Option<ResultCode>,
}

impl<R> Tracked<R> {
    fn new(request: R) -> Self {
        Self {
            request,
            state: RequestState::Requested,
            since: Instant::now(),
            answer: None,
        }
    }

    fn enter(&mut self, state: RequestState) {
        self.state = state;
        self.since = Instant::now();
    }

    fn is_released(&self) -> bool {
        matches!(self.state, RequestState::Completed | RequestState::Free)
    }

    fn matches_stuck(&self, request_id: u32, id: impl Fn(&R) -> u32) -> bool {
        self.state == RequestState::Stuck && id(&self.request) == request_id
    }

    fn park(&mut self) {
        self.state = RequestState::Stuck;
    }
}

/// Parts the worker thread owns
pub struct WorkerParts {
    /// Network request ring
    pub network: Arc<Ring<NetworkRequest>>,
    /// Frame request ring
    pub frames: Arc<Ring<FrameRequest>>,
    /// Firmware transport
    pub firmware: Arc<dyn Firmware>,
    /// Device emergency flag
    pub emergency: Arc<Emergency>,
    /// Cleared when the thread exits
    pub running: Arc<AtomicBool>,
    /// Deadlines
    pub timeouts: WorkerTimeouts,
    /// Sleep when idle
    pub idle_poll: Duration,
}

/// Handle on the running worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    doorbell: Arc<Doorbell>,
    snapshot: Arc<Mutex<WorkerSnapshot>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the OS refuses a new thread.
    pub fn spawn(parts: WorkerParts) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let doorbell = Arc::new(Doorbell::new());
        let snapshot = Arc::new(Mutex::new(WorkerSnapshot::default()));
        parts.network.set_notifier(Arc::clone(&doorbell));
        parts.frames.set_notifier(Arc::clone(&doorbell));
        parts.running.store(true, Ordering::Release);

        let mut worker = Worker {
            parts,
            shutdown: Arc::clone(&shutdown),
            doorbell: Arc::clone(&doorbell),
            snapshot: Arc::clone(&snapshot),
            sessions: HashMap::new(),
            network: Vec::new(),
            frames: Vec::new(),
        };
        let running = Arc::clone(&worker.parts.running);
        let thread = std::thread::Builder::new()
            .name("npu-protodrv".into())
            .spawn(move || worker.run())
            .inspect_err(|_| running.store(false, Ordering::Release))?;
        tracing::info!("Protocol worker started");
        Ok(Self {
            shutdown,
            doorbell,
            snapshot,
            thread: Some(thread),
        })
    }

    /// Bookkeeping as of the last pass
    pub fn snapshot(&self) -> WorkerSnapshot {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop and join the thread
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.doorbell.ring();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Protocol worker panicked");
            }
            tracing::info!("Protocol worker stopped");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    parts: WorkerParts,
    shutdown: Arc<AtomicBool>,
    doorbell: Arc<Doorbell>,
    snapshot: Arc<Mutex<WorkerSnapshot>>,
    sessions: HashMap<SessionId, SessionRef>,
    network: Vec<Tracked<NetworkRequest>>,
    frames: Vec<Tracked<FrameRequest>>,
}

impl Worker {
    fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let busy = self.pass();
            if !busy {
                self.doorbell.wait_timeout(self.parts.idle_poll);
            }
        }
        self.parts.running.store(false, Ordering::Release);
        self.abandon();
    }

    /// One sweep; returns whether anything happened
    fn pass(&mut self) -> bool {
        let mut busy = self.intake();
        while let Some(response) = self.parts.firmware.fetch() {
            self.on_response(response);
            busy = true;
        }
        busy |= self.process_network();
        busy |= self.process_frames();
        busy |= self.finish_drained();
        self.expire();
        self.network.retain(|tracked| !tracked.is_released());
        self.frames.retain(|tracked| !tracked.is_released());
        self.publish();
        busy
    }

    fn publish(&self) {
        let stuck = self.network.iter().filter(|t| t.state == RequestState::Stuck).count()
            + self.frames.iter().filter(|t| t.state == RequestState::Stuck).count();
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = WorkerSnapshot {
            tracked: self.network.len() + self.frames.len(),
            stuck,
            sessions: self.sessions.len(),
        };
    }

    fn intake(&mut self) -> bool {
        let mut busy = false;
        while let Some(request) = self.parts.network.try_pop() {
            tracing::trace!("{} #{} requested", request.command, request.request_id);
            self.network.push(Tracked::new(request));
            busy = true;
        }
        while let Some(request) = self.parts.frames.try_pop() {
            tracing::trace!("frame {} #{} requested", request.frame_id, request.request_id);
            self.frames.push(Tracked::new(request));
            busy = true;
        }
        busy
    }

    fn on_response(&mut self, response: FirmwareResponse) {
        let FirmwareResponse {
            kind,
            request_id,
            result,
        } = response;
        let late = match kind {
            RequestKind::Network => self
                .network
                .iter_mut()
                .find(|t| t.matches_stuck(request_id, |r| r.request_id))
                .map(|t| t.state = RequestState::Free),
            RequestKind::Frame => self
                .frames
                .iter_mut()
                .find(|t| t.matches_stuck(request_id, |r| r.request_id))
                .map(|t| t.state = RequestState::Free),
        };
        if late.is_some() {
            tracing::warn!("Late answer {result} for stuck request #{request_id} discarded");
            return;
        }
        match kind {
            RequestKind::Network => {
                let Some(index) = self.network.iter().position(|t| {
                    t.state == RequestState::Processing && t.request.request_id == request_id && t.answer.is_none()
                }) else {
                    tracing::warn!("Unknown network answer #{request_id} ({result}) discarded");
                    return;
                };
                self.on_network_answer(index, result);
            }
            RequestKind::Frame => {
                let Some(index) = self
                    .frames
                    .iter()
                    .position(|t| t.state == RequestState::Processing && t.request.request_id == request_id)
                else {
                    tracing::warn!("Unknown frame answer #{request_id} ({result}) discarded");
                    return;
                };
                let session = self.frames[index].request.session_id;
                if let Some(session_ref) = self.sessions.get_mut(&session) {
                    session_ref.outstanding = session_ref.outstanding.saturating_sub(1);
                }
                complete_frame(&mut self.frames[index], result);
            }
        }
    }

    fn on_network_answer(&mut self, index: usize, result: ResultCode) {
        let tracked = &mut self.network[index];
        let command = tracked.request.command;
        let session = tracked.request.session_id;
        tracing::debug!("{command} #{} answered {result}", tracked.request.request_id);

        match (command, session) {
            (NetworkCommand::Load, Some(session)) => {
                if result.is_ok() {
                    if let Some(session_ref) = self.sessions.get_mut(&session) {
                        session_ref.state = RefState::Inactive;
                    }
                } else {
                    self.sessions.remove(&session);
                }
                complete_network(tracked, result);
            }
            (NetworkCommand::StreamOff | NetworkCommand::Unload, Some(_)) if result.is_ok() => {
                // Finished by `finish_drained` once no frame is outstanding.
                tracked.answer = Some(result);
            }
            (NetworkCommand::StreamOff | NetworkCommand::Unload, Some(session)) => {
                tracing::warn!(session = %session, "{command} failed with {result}, state kept");
                complete_network(tracked, result);
            }
            _ => complete_network(tracked, result),
        }
    }

    fn process_network(&mut self) -> bool {
        let mut busy = false;
        let emergency = self.parts.emergency.is_raised();
        for index in 0..self.network.len() {
            if self.network[index].state != RequestState::Requested {
                continue;
            }
            if emergency {
                self.network_in_emergency(index);
                busy = true;
                continue;
            }
            match self.network_step(index) {
                Step::Done | Step::Forwarded => busy = true,
                Step::Wait => {}
                Step::MailboxFull => break,
            }
        }
        busy
    }

    fn network_in_emergency(&mut self, index: usize) {
        let command = self.network[index].request.command;
        let session = self.network[index].request.session_id;
        if let (NetworkCommand::ClearCb, Some(session)) = (command, session) {
            self.clear_session(session);
            complete_network(&mut self.network[index], ResultCode::OK);
        } else {
            tracing::debug!("{command} completed locally in emergency");
            complete_network(&mut self.network[index], ResultCode::EMERGENCY);
        }
    }

    /// Drop every callback, pending request and stuck entry of `session`
    ///
    /// Answers that still arrive for dropped requests are discarded as
    /// unknown.
    fn clear_session(&mut self, session: SessionId) {
        let mut cleared = 0usize;
        for tracked in &mut self.frames {
            if tracked.request.session_id != session || tracked.is_released() {
                continue;
            }
            tracked.request.reply = None;
            tracked.enter(RequestState::Free);
            cleared += 1;
        }
        for tracked in &mut self.network {
            let own = tracked.request.session_id == Some(session) && tracked.request.command != NetworkCommand::ClearCb;
            if !own || tracked.is_released() {
                continue;
            }
            complete_network(tracked, ResultCode::EMERGENCY);
            tracked.enter(RequestState::Free);
            cleared += 1;
        }
        self.sessions.remove(&session);
        tracing::info!(session = %session, "CLEAR_CB dropped {cleared} requests");
    }

    fn network_step(&mut self, index: usize) -> Step {
        let command = self.network[index].request.command;
        let Some(session) = self.network[index].request.session_id else {
            if command == NetworkCommand::PowerDown && !self.sessions.is_empty() {
                return Step::Wait;
            }
            return self.forward_network(index);
        };

        let state = self.sessions.get(&session).map(|r| r.state);
        match (command, state) {
            (NetworkCommand::Load, None) => {
                self.sessions.insert(
                    session,
                    SessionRef {
                        state: RefState::Loading,
                        outstanding: 0,
                    },
                );
                let step = self.forward_network(index);
                if matches!(step, Step::MailboxFull) {
                    self.sessions.remove(&session);
                }
                step
            }
            (NetworkCommand::ClearCb, _) => {
                self.clear_session(session);
                complete_network(&mut self.network[index], ResultCode::OK);
                Step::Done
            }
            (NetworkCommand::StreamOn, Some(RefState::Inactive)) => {
                self.set_ref(session, RefState::Active);
                complete_network(&mut self.network[index], ResultCode::OK);
                Step::Done
            }
            (NetworkCommand::StreamOff, Some(RefState::Active | RefState::Stopping)) => {
                let step = self.forward_network(index);
                if matches!(step, Step::Forwarded) {
                    self.set_ref(session, RefState::Stopping);
                }
                step
            }
            (NetworkCommand::Unload, Some(RefState::Inactive)) => {
                let step = self.forward_network(index);
                if matches!(step, Step::Forwarded) {
                    self.cancel_waiting_frames(session);
                }
                step
            }
            (NetworkCommand::Load, Some(_)) => Step::Wait,
            (NetworkCommand::FwTcExecute | NetworkCommand::PowerDown, _) => self.forward_network(index),
            (NetworkCommand::StreamOn | NetworkCommand::StreamOff | NetworkCommand::Unload, Some(state)) => {
                tracing::warn!(session = %session, "{command} rejected in state {state:?}");
                complete_network(&mut self.network[index], ResultCode::INVALID_STATE);
                Step::Done
            }
            (_, None) => {
                tracing::warn!(session = %session, "{command} for a session firmware does not hold");
                complete_network(&mut self.network[index], ResultCode::INVALID_SESSION);
                Step::Done
            }
        }
    }

    fn forward_network(&mut self, index: usize) -> Step {
        let tracked = &mut self.network[index];
        let request = &tracked.request;
        let message = NetworkMessage {
            request_id: request.request_id,
            session_id: request.session_id,
            command: request.command,
            ncp: request.ncp,
            payload: request.payload,
        };
        if !self.parts.firmware.post_network(message) {
            tracing::trace!("Firmware mailbox full, {} waits", request.command);
            return Step::MailboxFull;
        }
        if let Some(notify) = &request.notify {
            notify.accept();
        }
        tracked.enter(RequestState::Processing);
        tracing::trace!("{} #{} processing", tracked.request.command, tracked.request.request_id);
        Step::Forwarded
    }

    fn set_ref(&mut self, session: SessionId, state: RefState) {
        if let Some(session_ref) = self.sessions.get_mut(&session) {
            tracing::debug!(session = %session, "{:?} -> {state:?}", session_ref.state);
            session_ref.state = state;
        }
    }

    fn cancel_waiting_frames(&mut self, session: SessionId) {
        for tracked in &mut self.frames {
            if tracked.request.session_id == session && tracked.state == RequestState::Requested {
                complete_frame(tracked, ResultCode::FRAME_CANCELED);
            }
        }
    }

    fn process_frames(&mut self) -> bool {
        let mut busy = false;
        let emergency = self.parts.emergency.is_raised();
        let mut mailbox_full = false;
        for tracked in &mut self.frames {
            if tracked.state != RequestState::Requested {
                continue;
            }
            if emergency {
                complete_frame(tracked, ResultCode::EMERGENCY);
                busy = true;
                continue;
            }
            let session = tracked.request.session_id;
            let Some(session_ref) = self.sessions.get_mut(&session) else {
                complete_frame(tracked, ResultCode::INVALID_SESSION);
                busy = true;
                continue;
            };
            match session_ref.state {
                RefState::Loading | RefState::Inactive => {}
                RefState::Stopping => {
                    complete_frame(tracked, ResultCode::FRAME_CANCELED);
                    busy = true;
                }
                RefState::Active if mailbox_full => {}
                RefState::Active => {
                    let request = &tracked.request;
                    let message = FrameMessage {
                        request_id: request.request_id,
                        session_id: session,
                        frame_id: request.frame_id,
                        io_table_daddr: request.io_table_daddr,
                        vector_count: request.vector_count,
                    };
                    if self.parts.firmware.post_frame(message) {
                        session_ref.outstanding += 1;
                        tracked.enter(RequestState::Processing);
                        busy = true;
                    } else {
                        tracing::trace!("Firmware mailbox full, frame {} waits", request.frame_id);
                        mailbox_full = true;
                    }
                }
            }
        }
        busy
    }

    /// Complete accepted STREAMOFF/UNLOAD answers once the session drained
    fn finish_drained(&mut self) -> bool {
        let mut busy = false;
        for index in 0..self.network.len() {
            let tracked = &self.network[index];
            let (Some(result), Some(session)) = (tracked.answer, tracked.request.session_id) else {
                continue;
            };
            if tracked.state != RequestState::Processing {
                continue;
            }
            let outstanding = self.sessions.get(&session).map_or(0, |r| r.outstanding);
            if outstanding > 0 {
                continue;
            }
            if tracked.request.command == NetworkCommand::StreamOff {
                self.set_ref(session, RefState::Inactive);
            } else {
                self.sessions.remove(&session);
            }
            complete_network(&mut self.network[index], result);
            busy = true;
        }
        busy
    }

    /// Free stuck entries nobody answered within the grace period
    fn reclaim(&mut self, now: Instant) {
        let grace = self.parts.timeouts.stuck_grace;
        let mut orphaned = Vec::new();
        for tracked in &mut self.network {
            if tracked.state == RequestState::Stuck && now.duration_since(tracked.since) > grace {
                tracing::warn!("Reclaiming stuck {} #{}", tracked.request.command, tracked.request.request_id);
                orphaned.extend(tracked.request.session_id);
                tracked.enter(RequestState::Free);
            }
        }
        for tracked in &mut self.frames {
            if tracked.state == RequestState::Stuck && now.duration_since(tracked.since) > grace {
                tracing::warn!("Reclaiming stuck frame {} #{}", tracked.request.frame_id, tracked.request.request_id);
                tracked.enter(RequestState::Free);
            }
        }
        for session in orphaned {
            if self.sessions.remove(&session).is_some() {
                tracing::warn!(session = %session, "Dropped reference left by a stuck request");
            }
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let timeouts = self.parts.timeouts;
        let mut stuck = 0usize;
        self.reclaim(now);

        for tracked in &mut self.network {
            let elapsed = now.duration_since(tracked.since);
            let code = match tracked.state {
                RequestState::Requested if elapsed > timeouts.network_requested => ResultCode::SCHED_TIMEOUT,
                RequestState::Processing if tracked.answer.is_none() && elapsed > timeouts.network_processing => {
                    ResultCode::QUEUE_TIMEOUT
                }
                _ => continue,
            };
            tracing::warn!("{} #{} timed out: {code}", tracked.request.command, tracked.request.request_id);
            complete_network(tracked, code);
            if code.is_stuck() {
                tracked.park();
                stuck += 1;
            }
        }

        for tracked in &mut self.frames {
            let elapsed = now.duration_since(tracked.since);
            let code = match tracked.state {
                RequestState::Requested if elapsed > timeouts.frame_requested => ResultCode::SCHED_TIMEOUT,
                RequestState::Processing if elapsed > timeouts.frame_processing => ResultCode::NPU_TIMEOUT,
                _ => continue,
            };
            tracing::warn!("frame {} #{} timed out: {code}", tracked.request.frame_id, tracked.request.request_id);
            if tracked.state == RequestState::Processing {
                if let Some(session_ref) = self.sessions.get_mut(&tracked.request.session_id) {
                    session_ref.outstanding = session_ref.outstanding.saturating_sub(1);
                }
            }
            complete_frame(tracked, code);
            if code.is_stuck() {
                tracked.park();
                stuck += 1;
            }
        }

        if stuck > 0 {
            self.parts
                .emergency
                .raise(&format!("{stuck} request(s) stuck in firmware"));
        }
    }

    /// Complete everything still pending when the worker exits
    fn abandon(&mut self) {
        for tracked in &mut self.network {
            if matches!(tracked.state, RequestState::Requested | RequestState::Processing) {
                complete_network(tracked, ResultCode::EMERGENCY);
            }
        }
        for tracked in &mut self.frames {
            if matches!(tracked.state, RequestState::Requested | RequestState::Processing) {
                complete_frame(tracked, ResultCode::EMERGENCY);
            }
        }
        while let Some(mut request) = self.parts.network.try_pop() {
            if let Some(notify) = request.notify.take() {
                notify.complete(ResultCode::EMERGENCY);
            }
        }
    }
}

enum Step {
    Done,
    Forwarded,
    Wait,
    MailboxFull,
}

fn complete_network(tracked: &mut Tracked<NetworkRequest>, result: ResultCode) {
    tracked.request.result = result;
    if let Some(notify) = tracked.request.notify.take() {
        notify.complete(result);
    }
    tracked.enter(RequestState::Completed);
}

fn complete_frame(tracked: &mut Tracked<FrameRequest>, result: ResultCode) {
    let request = &mut tracked.request;
    request.result = result;
    if let Some(reply) = request.reply.take() {
        let done = FrameDone {
            request_id: request.request_id,
            frame_id: request.frame_id,
            slot: request.slot,
            input: request.input.clone(),
            output: request.output.clone(),
            result,
        };
        if reply.send(done).is_err() {
            tracing::trace!("Frame {} completed after its session went away", request.frame_id);
        }
    }
    tracked.enter(RequestState::Completed);
}
