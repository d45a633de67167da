// SPDX-License-Identifier: AGPL-3.0-only

//! Loopback firmware
//!
//! Answers every message in arrival order without touching hardware.
//!
//! ## Keep / resume
//!
//! With a [`HoldRule`], frames carrying `keep_frame_id` are held back until
//! the next frame carrying `resume_frame_id`. STREAMOFF cancels the session's
//! held frames. At most `max_held` frames are held; further keep frames pass
//! straight through.

use super::Firmware;
use crate::mailbox::{Mailbox, Ring};
use crate::protocol::{
    FirmwareResponse, FrameMessage, NetworkCommand, NetworkMessage, RequestKind, ResultCode, SessionId,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Code the loopback answers failing commands with
pub const FIRMWARE_ERROR: ResultCode = ResultCode::from_raw(0x0000_0E01);

/// Keep/resume rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldRule {
    /// Frames with this id are held
    pub keep_frame_id: u32,
    /// A frame with this id releases the held frames
    pub resume_frame_id: u32,
    /// Hold capacity
    pub max_held: usize,
}

/// What the loopback has seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Network commands in arrival order
    pub commands: Vec<NetworkCommand>,
    /// Frame ids in answer order
    pub answered_frames: Vec<u32>,
    /// Frames cancelled by STREAMOFF
    pub cancelled_frames: Vec<u32>,
}

#[derive(Debug)]
enum Inbound {
    Network(NetworkMessage),
    Frame(FrameMessage),
}

/// In-process firmware
#[derive(Debug)]
pub struct LoopbackFirmware {
    inbound: Ring<Inbound>,
    answers: Ring<FirmwareResponse>,
    held: Mutex<VecDeque<FrameMessage>>,
    delayed: Mutex<VecDeque<(Instant, FrameMessage)>>,
    stats: Mutex<LoopbackStats>,
    hold: Option<HoldRule>,
    frame_delay: Option<Duration>,
    fail_commands: Vec<NetworkCommand>,
    silent: bool,
}

impl LoopbackFirmware {
    /// Loopback with an inbound mailbox of `depth` messages
    pub fn new(depth: usize) -> Self {
        Self {
            inbound: Ring::new("firmware", depth),
            answers: Ring::new("firmware answers", depth),
            held: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(VecDeque::new()),
            stats: Mutex::new(LoopbackStats::default()),
            hold: None,
            frame_delay: None,
            fail_commands: Vec::new(),
            silent: false,
        }
    }

    /// Enable keep/resume
    #[must_use]
    pub fn with_hold(mut self, rule: HoldRule) -> Self {
        self.answers = Ring::new("firmware answers", self.inbound.capacity() + rule.max_held);
        self.hold = Some(rule);
        self
    }

    /// Answer each frame `delay` after it was taken from the mailbox
    #[must_use]
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Answer `command` with [`FIRMWARE_ERROR`]
    #[must_use]
    pub fn failing(mut self, command: NetworkCommand) -> Self {
        self.fail_commands.push(command);
        self
    }

    /// Accept messages but never answer
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Snapshot of what has been processed
    pub fn stats(&self) -> LoopbackStats {
        lock(&self.stats).clone()
    }

    /// Frames currently held
    pub fn held_frames(&self) -> usize {
        lock(&self.held).len()
    }

    fn answer(&self, kind: RequestKind, request_id: u32, result: ResultCode) {
        let response = FirmwareResponse {
            kind,
            request_id,
            result,
        };
        if self.answers.try_push(response).is_err() {
            tracing::warn!("Loopback answer ring full, dropping answer for #{request_id}");
        }
    }

    fn answer_frame(&self, frame: &FrameMessage, result: ResultCode) {
        {
            let mut stats = lock(&self.stats);
            if result == ResultCode::FRAME_CANCELED {
                stats.cancelled_frames.push(frame.frame_id);
            } else {
                stats.answered_frames.push(frame.frame_id);
            }
        }
        self.answer(RequestKind::Frame, frame.request_id, result);
    }

    fn execute_network(&self, message: &NetworkMessage) {
        lock(&self.stats).commands.push(message.command);
        if message.command == NetworkCommand::StreamOff {
            if let Some(session) = message.session_id {
                self.cancel_held(session);
            }
        }
        let result = if self.fail_commands.contains(&message.command) {
            FIRMWARE_ERROR
        } else {
            ResultCode::OK
        };
        tracing::trace!("Loopback {} #{} -> {result}", message.command, message.request_id);
        self.answer(RequestKind::Network, message.request_id, result);
    }

    fn execute_frame(&self, frame: FrameMessage) {
        let Some(rule) = self.hold else {
            self.answer_frame(&frame, ResultCode::OK);
            return;
        };

        if frame.frame_id == rule.keep_frame_id {
            let mut held = lock(&self.held);
            if held.len() < rule.max_held {
                tracing::debug!("Holding frame {} (#{})", frame.frame_id, frame.request_id);
                held.push_back(frame);
                return;
            }
            tracing::warn!("Hold capacity {} reached, passing frame {} through", rule.max_held, frame.frame_id);
        }

        if frame.frame_id == rule.resume_frame_id {
            let released: Vec<_> = lock(&self.held).drain(..).collect();
            tracing::debug!("Resume frame {} releases {} held frames", frame.frame_id, released.len());
            for held in &released {
                self.answer_frame(held, ResultCode::OK);
            }
        }
        self.answer_frame(&frame, ResultCode::OK);
    }

    fn cancel_held(&self, session: SessionId) {
        let cancelled: VecDeque<_> = {
            let mut held = lock(&self.held);
            let (cancelled, kept) = held.drain(..).partition(|frame| frame.session_id == session);
            *held = kept;
            cancelled
        };
        for frame in &cancelled {
            self.answer_frame(frame, ResultCode::FRAME_CANCELED);
        }
    }

    fn due_frame(&self) -> Option<FrameMessage> {
        let mut delayed = lock(&self.delayed);
        match delayed.front() {
            Some((due, _)) if *due <= Instant::now() => delayed.pop_front().map(|(_, frame)| frame),
            _ => None,
        }
    }
}

impl Firmware for LoopbackFirmware {
    fn post_network(&self, message: NetworkMessage) -> bool {
        self.inbound.try_push(Inbound::Network(message)).is_ok()
    }

    fn post_frame(&self, message: FrameMessage) -> bool {
        self.inbound.try_push(Inbound::Frame(message)).is_ok()
    }

    fn fetch(&self) -> Option<FirmwareResponse> {
        loop {
            if let Some(answer) = self.answers.try_pop() {
                return Some(answer);
            }
            if let Some(frame) = self.due_frame() {
                self.execute_frame(frame);
                continue;
            }
            match self.inbound.try_pop()? {
                message if self.silent => tracing::trace!("Silent loopback swallowed {message:?}"),
                Inbound::Network(message) => self.execute_network(&message),
                Inbound::Frame(frame) => match self.frame_delay {
                    Some(delay) => lock(&self.delayed).push_back((Instant::now() + delay, frame)),
                    None => self.execute_frame(frame),
                },
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(request_id: u32, frame_id: u32) -> FrameMessage {
        FrameMessage {
            request_id,
            session_id: SessionId(1),
            frame_id,
            io_table_daddr: 0x1000_0000,
            vector_count: 2,
        }
    }

    fn drain(firmware: &LoopbackFirmware) -> Vec<FirmwareResponse> {
        std::iter::from_fn(|| firmware.fetch()).collect()
    }

    #[test]
    fn answers_in_order() {
        let firmware = LoopbackFirmware::new(8);
        assert!(firmware.post_frame(frame(1, 10)));
        assert!(firmware.post_frame(frame(2, 11)));
        let ids: Vec<_> = drain(&firmware).iter().map(|r| r.request_id).collect();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn full_mailbox_rejects() {
        let firmware = LoopbackFirmware::new(1);
        assert!(firmware.post_frame(frame(1, 10)));
        assert!(!firmware.post_frame(frame(2, 11)));
    }

    #[test]
    fn keep_frames_wait_for_resume() {
        let firmware = LoopbackFirmware::new(8).with_hold(HoldRule {
            keep_frame_id: 7,
            resume_frame_id: 9,
            max_held: 4,
        });
        firmware.post_frame(frame(1, 7));
        firmware.post_frame(frame(2, 8));
        assert_eq!(drain(&firmware).iter().map(|r| r.request_id).collect::<Vec<_>>(), [2]);
        assert_eq!(firmware.held_frames(), 1);

        firmware.post_frame(frame(3, 9));
        assert_eq!(drain(&firmware).iter().map(|r| r.request_id).collect::<Vec<_>>(), [1, 3]);
        assert_eq!(firmware.stats().answered_frames, [8, 7, 9]);
    }

    #[test]
    fn hold_overflow_passes_through() {
        let firmware = LoopbackFirmware::new(8).with_hold(HoldRule {
            keep_frame_id: 7,
            resume_frame_id: 9,
            max_held: 1,
        });
        firmware.post_frame(frame(1, 7));
        firmware.post_frame(frame(2, 7));
        assert_eq!(drain(&firmware).iter().map(|r| r.request_id).collect::<Vec<_>>(), [2]);
        assert_eq!(firmware.held_frames(), 1);
    }

    #[test]
    fn streamoff_cancels_held_frames_first() {
        let firmware = LoopbackFirmware::new(8).with_hold(HoldRule {
            keep_frame_id: 7,
            resume_frame_id: 9,
            max_held: 4,
        });
        firmware.post_frame(frame(1, 7));
        firmware.post_network(NetworkMessage {
            request_id: 2,
            session_id: Some(SessionId(1)),
            command: NetworkCommand::StreamOff,
            ncp: None,
            payload: 0,
        });
        let answers = drain(&firmware);
        assert_eq!(answers[0].request_id, 1);
        assert_eq!(answers[0].result, ResultCode::FRAME_CANCELED);
        assert_eq!(answers[1].kind, RequestKind::Network);
        assert_eq!(firmware.stats().cancelled_frames, [7]);
    }

    #[test]
    fn answer_ring_keeps_every_released_frame() {
        let firmware = LoopbackFirmware::new(8).with_hold(HoldRule {
            keep_frame_id: 7,
            resume_frame_id: 9,
            max_held: 6,
        });
        for request_id in 1..=6 {
            assert!(firmware.post_frame(frame(request_id, 7)));
        }
        assert!(firmware.answers.capacity() >= firmware.inbound.capacity() + 6);
        assert!(drain(&firmware).is_empty());
        firmware.post_frame(frame(7, 9));
        assert_eq!(drain(&firmware).len(), 7);
        assert_eq!(firmware.stats().answered_frames.len(), 7);
    }

    #[test]
    fn answer_ring_is_as_deep_as_the_mailbox() {
        let firmware = LoopbackFirmware::new(16);
        assert_eq!(firmware.answers.capacity(), 16);
    }

    #[test]
    fn delayed_frames_answer_after_the_delay() {
        let firmware = LoopbackFirmware::new(4).with_frame_delay(Duration::from_millis(50));
        firmware.post_frame(frame(1, 1));
        assert!(firmware.fetch().is_none());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(firmware.fetch().unwrap().request_id, 1);
    }

    #[test]
    fn failing_and_silent() {
        let firmware = LoopbackFirmware::new(4).failing(NetworkCommand::Load);
        firmware.post_network(NetworkMessage {
            request_id: 5,
            session_id: Some(SessionId(1)),
            command: NetworkCommand::Load,
            ncp: None,
            payload: 0,
        });
        assert_eq!(firmware.fetch().unwrap().result, FIRMWARE_ERROR);

        let firmware = LoopbackFirmware::new(4).silent();
        firmware.post_frame(frame(1, 1));
        assert!(drain(&firmware).is_empty());
    }
}
