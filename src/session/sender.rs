//! The line-flow streamer (spec §4.3): keeps the firmware's receive buffer
//! full without overrunning it.
//!
//! Grounded on the teacher's `machines::grbl::streamer::stream_lines` flow
//! control (send, wait for `ok`/`error`, stop on error) but reshaped from a
//! single async function into a stateful struct so `ControllerSession` can
//! interleave it with the Feeder and react to Alarm/cancel events that
//! `stream_lines` never had to model.

use crate::controllers::StreamingProtocol;
use crate::job::JobContext;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SenderError {
    #[error("a job is already running")]
    Busy,
    #[error("no job loaded")]
    NoJob,
    #[error("protocol desync: ack with no outstanding line")]
    ProtocolDesync,
}

/// Outcome of advancing the streamer by one `next()` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NextBatch {
    /// Lines to write to the serial port, in order.
    pub lines: Vec<String>,
    /// Lines skipped because they exceeded the firmware's RX buffer; each
    /// still advances `lines_received` as if acknowledged (spec §4.3 edge
    /// case), but is never written to the wire.
    pub skipped_too_long: Vec<String>,
}

/// A terminal reply consumed by `ack` (the only two reply kinds that free a
/// window slot; `Alarm` resets the window through `rewind` instead).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    Error(u32),
}

struct WindowEntry {
    /// Byte length including terminator (CharacterCounting), or 1
    /// (SendResponse, where only entry *count* matters).
    weight: usize,
}

/// The streamer. One per `ControllerSession`.
pub struct Sender {
    protocol: StreamingProtocol,
    capacity: usize,
    window: VecDeque<WindowEntry>,
    used: usize,
    job: Option<JobContext>,
    running: bool,
    held: bool,
    hold_reason: Option<String>,
    continue_on_error: bool,
}

impl Sender {
    pub fn new(protocol: StreamingProtocol, capacity: usize, continue_on_error: bool) -> Self {
        Sender {
            protocol,
            capacity,
            window: VecDeque::new(),
            used: 0,
            job: None,
            running: false,
            held: false,
            hold_reason: None,
            continue_on_error,
        }
    }

    pub fn job(&self) -> Option<&JobContext> {
        self.job.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn hold_reason(&self) -> Option<&str> {
        self.hold_reason.as_deref()
    }

    pub fn set_continue_on_error(&mut self, value: bool) {
        self.continue_on_error = value;
    }

    /// Load a job. Fails with `Busy` if one is already running.
    pub fn load(&mut self, name: impl Into<String>, gcode_text: &str) -> Result<(), SenderError> {
        if self.running {
            return Err(SenderError::Busy);
        }
        self.job = Some(JobContext::new(name, gcode_text));
        self.window.clear();
        self.used = 0;
        self.held = false;
        self.hold_reason = None;
        Ok(())
    }

    pub fn unload(&mut self) -> Result<(), SenderError> {
        if self.running {
            return Err(SenderError::Busy);
        }
        self.job = None;
        self.window.clear();
        self.used = 0;
        Ok(())
    }

    /// Workflow transitions Idle -> Running by calling this before driving
    /// `next()` to fill the window.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Workflow transitions Running/Paused -> Idle by calling this after
    /// `rewind()`.
    pub fn stop(&mut self) {
        self.running = false;
    }

    fn candidate_weight(&self, line: &str) -> usize {
        match self.protocol {
            StreamingProtocol::CharacterCounting => line.len() + 1, // + '\n'
            StreamingProtocol::SendResponse => 1,
        }
    }

    fn fits(&self, weight: usize) -> bool {
        match self.protocol {
            StreamingProtocol::CharacterCounting => self.used + weight <= self.capacity,
            StreamingProtocol::SendResponse => self.window.len() < self.capacity,
        }
    }

    /// Advance as many lines as the window allows. Returns the lines to
    /// write (in order) plus any skipped-too-long lines.
    pub fn next(&mut self) -> NextBatch {
        let mut batch = NextBatch::default();
        if !self.running || self.held {
            return batch;
        }

        loop {
            let Some(job) = self.job.as_mut() else { break };
            if job.hold {
                break;
            }
            let Some(line) = job.next_unsent_line().map(str::to_string) else {
                break;
            };

            let weight = self.candidate_weight(&line);
            if self.protocol == StreamingProtocol::CharacterCounting
                && weight > self.capacity
            {
                // Line alone can never fit: skip it, still count as received.
                job.lines_sent += 1;
                job.lines_received += 1;
                batch.skipped_too_long.push(line);
                continue;
            }
            if !self.fits(weight) {
                break;
            }

            job.lines_sent += 1;
            self.window.push_back(WindowEntry { weight });
            self.used += weight;
            batch.lines.push(line);
        }

        self.check_invariants();
        batch
    }

    /// Consume a terminal reply that belongs to this streamer (the Runner
    /// only calls this when the Sender owns the oldest in-flight write).
    pub fn ack(&mut self, terminal: Terminal) -> Result<(), SenderError> {
        let Some(entry) = self.window.pop_front() else {
            return Err(SenderError::ProtocolDesync);
        };
        self.used -= entry.weight;

        let job = self.job.as_mut().ok_or(SenderError::NoJob)?;
        job.lines_received += 1;

        if let Terminal::Error(code) = terminal {
            if !self.continue_on_error {
                job.hold = true;
                let reason = format!("error:{code}");
                job.hold_reason = Some(reason.clone());
                self.held = true;
                self.hold_reason = Some(reason);
            }
        }

        self.check_invariants();
        Ok(())
    }

    /// Reset the window and rewind `lines_sent` back to `lines_received` so
    /// a resumed job replays from the true last-acknowledged line. Called
    /// by Workflow on cancel.
    pub fn rewind(&mut self) {
        self.window.clear();
        self.used = 0;
        if let Some(job) = self.job.as_mut() {
            job.lines_sent = job.lines_received;
        }
    }

    /// Pause dispatch without touching the window (interactive feedhold).
    pub fn hold(&mut self, reason: impl Into<String>) {
        self.held = true;
        self.hold_reason = Some(reason.into());
    }

    pub fn unhold(&mut self) {
        self.held = false;
        self.hold_reason = None;
        if let Some(job) = self.job.as_mut() {
            job.hold = false;
            job.hold_reason = None;
        }
    }

    pub fn window_line_count(&self) -> usize {
        self.window.len()
    }

    pub fn window_used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_invariants(&self) {
        if let Some(job) = &self.job {
            debug_assert!(job.lines_received <= job.lines_sent);
            debug_assert!(job.lines_sent <= job.lines_total);
            debug_assert_eq!(
                (job.lines_sent - job.lines_received) as usize,
                self.window.len()
            );
        }
        match self.protocol {
            StreamingProtocol::CharacterCounting => debug_assert!(self.used <= self.capacity),
            StreamingProtocol::SendResponse => debug_assert!(self.window.len() <= self.capacity),
        }
    }
}
