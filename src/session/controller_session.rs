//! `ControllerSession` (spec §4.9 per-port component): owns one serial
//! link, one firmware dialect, and every subsystem that shares its
//! outstanding-write window — Sender, Feeder, JogLoop — plus the Workflow
//! state machine and a handle to the shared StatusAggregator.
//!
//! This is the wiring layer: the pure modules ([`super::sender`],
//! [`super::feeder`], [`super::workflow`], [`super::jog`], [`super::runner`])
//! never touch the wire. `ControllerSession` is what actually writes bytes
//! and reads lines, and it is the only place that knows which subsystem
//! owns the oldest in-flight write.

use crate::controllers::{
    ActiveState, ControllerKind, ControllerProtocol, FeedbackKind, JogTarget, RealtimeCommand,
    Reply, Units,
};
use crate::error::CoreError;
use crate::hub::SessionHandle;
use crate::net::broadcast::Broadcaster;
use crate::net::protocol::ServerEvent;
use crate::session::dispatcher::{self, DispatchAction, Verb};
use crate::session::event_trigger::{EventTrigger, LifecycleEvent, TriggerAction};
use crate::session::feeder::{FeedItem, Feeder};
use crate::session::jog::{self, JogLoop, JogLoopConfig, JogSample};
use crate::session::runner::{self, AckOwner, RunnerEffect};
use crate::session::sender::{Sender, Terminal};
use crate::session::serial_link::SerialLink;
use crate::session::status::StatusAggregator;
use crate::session::workflow::{self, Workflow, WorkflowEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default poll interval for `?` status requests (spec §4.1), matching the
/// teacher's `poller::POLL_INTERVAL_MS`.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Workflow §5: how long `Cancelling` waits for the firmware to report
/// Idle before the watchdog forces it.
pub const CANCEL_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ControllerSession {
    pub port: String,
    pub handle: SessionHandle,
    link: SerialLink,
    protocol: Box<dyn ControllerProtocol>,
    sender: Mutex<Sender>,
    feeder: Mutex<Feeder>,
    workflow: Mutex<Workflow>,
    jog: Mutex<JogLoop>,
    status: Arc<Mutex<StatusAggregator>>,
    ack_owners: Mutex<VecDeque<AckOwner>>,
    prev_active_state: Mutex<Option<ActiveState>>,
    units: Units,
    wcs_slot: u8,
    event_trigger: Arc<EventTrigger>,
    /// Set once in `open()`, so `&self` methods can spawn watchdog tasks
    /// that need an owned `Arc<Self>` without the constructor itself
    /// having one to hand.
    self_ref: OnceLock<Weak<ControllerSession>>,
    jog_watchdog_gen: AtomicU64,
    cancel_watchdog_gen: AtomicU64,
    broadcaster: Broadcaster,
}

impl ControllerSession {
    pub fn new(
        port: impl Into<String>,
        kind: ControllerKind,
        handle: SessionHandle,
        status: Arc<Mutex<StatusAggregator>>,
        event_trigger: Arc<EventTrigger>,
        continue_on_error: bool,
        jog_config: JogLoopConfig,
        broadcaster: Broadcaster,
    ) -> Self {
        let port = port.into();
        let protocol = crate::controllers::protocol_for(kind);
        let streaming = protocol.streaming_protocol();
        let capacity = protocol.rx_buffer_capacity();
        ControllerSession {
            link: SerialLink::new(port.clone()),
            port,
            handle,
            protocol,
            sender: Mutex::new(Sender::new(streaming, capacity, continue_on_error)),
            feeder: Mutex::new(Feeder::new()),
            workflow: Mutex::new(Workflow::new()),
            jog: Mutex::new(JogLoop::new(jog_config)),
            status,
            ack_owners: Mutex::new(VecDeque::new()),
            prev_active_state: Mutex::new(None),
            units: Units::Metric,
            wcs_slot: 1,
            event_trigger,
            self_ref: OnceLock::new(),
            jog_watchdog_gen: AtomicU64::new(0),
            cancel_watchdog_gen: AtomicU64::new(0),
            broadcaster,
        }
    }

    fn arc_self(&self) -> Option<Arc<ControllerSession>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub async fn open(self: &Arc<Self>, baud_rate: u32) -> Result<(), CoreError> {
        self.link.open(baud_rate, READ_TIMEOUT).await?;
        let _ = self.self_ref.set(Arc::downgrade(self));
        self.status.lock().await.on_connect(&self.port, self.protocol.kind());
        info!(port = %self.port, "controller session opened");
        self.push_machine_status().await;
        self.fire_trigger(LifecycleEvent::Startup).await;

        let me = Arc::clone(self);
        tokio::spawn(async move { me.read_loop().await });
        let me = Arc::clone(self);
        tokio::spawn(async move { me.poll_loop().await });
        Ok(())
    }

    /// Resolve `event` against the configured trigger rules and carry out
    /// whatever actions fire — G-code goes through the Feeder, shell
    /// commands run as detached child processes.
    async fn fire_trigger(&self, event: LifecycleEvent) {
        for action in self.event_trigger.fire(&event) {
            match action {
                TriggerAction::Gcode(line) => self.queue_feed_line(line).await,
                TriggerAction::System(command) => self.run_system_trigger(command),
            }
        }
    }

    fn run_system_trigger(&self, command: String) {
        let port = self.port.clone();
        tokio::spawn(async move {
            let status = tokio::process::Command::new("sh").arg("-c").arg(&command).status().await;
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => warn!(port = %port, command = %command, code = ?s.code(), "trigger command exited non-zero"),
                Err(e) => warn!(port = %port, command = %command, error = %e, "failed to spawn trigger command"),
            }
        });
    }

    pub async fn close(&self) -> Result<(), CoreError> {
        self.link.close().await?;
        let effects = self.workflow.lock().await.handle(WorkflowEvent::PortClosed);
        self.apply_workflow_effects(effects).await;
        self.status.lock().await.on_disconnect(&self.port);
        self.push_machine_status().await;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.link.read_line(READ_TIMEOUT).await {
                Ok(line) if !line.is_empty() => self.on_line(&line).await,
                Ok(_) => {}
                Err(CoreError::NotOpen) => return,
                Err(e) => {
                    warn!(port = %self.port, error = %e, "serial read failed");
                    return;
                }
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.link.is_open().await {
                return;
            }
            let byte = self.protocol.realtime_byte(RealtimeCommand::StatusRequest);
            if self.link.write_realtime_byte(byte).await.is_err() {
                return;
            }
        }
    }

    /// Classify one raw line and route it to whichever subsystem owns the
    /// oldest in-flight write.
    async fn on_line(&self, raw: &str) {
        self.broadcaster
            .push(self.handle, ServerEvent::SerialPortRead { handle: self.handle, line: raw.to_string() })
            .await;
        let reply = self.protocol.parse_line(raw);
        let owner = if matches!(reply, Reply::Ok | Reply::Error(_)) {
            self.ack_owners.lock().await.pop_front()
        } else {
            None
        };
        let prev = self.prev_active_state.lock().await.clone();
        let effects = runner::handle_reply(&reply, owner, prev.as_ref());

        if let Reply::Status(report) = &reply {
            *self.prev_active_state.lock().await = Some(report.active_state.clone());
        }

        for effect in effects {
            self.apply_runner_effect(effect).await;
        }
    }

    async fn apply_runner_effect(&self, effect: RunnerEffect) {
        match effect {
            RunnerEffect::SenderAck(terminal) => {
                let was_held = self.sender.lock().await.is_held();
                if let Err(e) = self.sender.lock().await.ack(terminal) {
                    warn!(port = %self.port, error = %e, "sender ack failed");
                    self.status.lock().await.set_healthy(&self.port, false);
                }
                if let Terminal::Error(code) = terminal {
                    if !was_held && self.sender.lock().await.is_held() {
                        let name = self.job_name().await;
                        self.fire_trigger(LifecycleEvent::JobError { name, code }).await;
                    }
                }
                self.push_sender_status().await;
                self.pump_sender().await;
            }
            RunnerEffect::FeederAck => {
                self.feeder.lock().await.ack();
                self.push_feeder_status().await;
                self.pump_feeder().await;
            }
            RunnerEffect::JogAck(is_fence) => {
                let effects = self.jog.lock().await.on_ack(is_fence);
                self.apply_jog_effects(effects).await;
            }
            RunnerEffect::UpdateCachedState(report) => {
                if let Some(mp) = report.machine_pos {
                    if let Some(wp) = report.work_pos {
                        self.status.lock().await.update_position(&self.port, mp, wp);
                    }
                }
                if let Some(ov) = report.overrides {
                    self.status.lock().await.update_overrides(&self.port, ov);
                }
                self.status
                    .lock()
                    .await
                    .set_active_state(&self.port, report.active_state.clone());
                let jogging = matches!(&report.active_state, ActiveState::Jog);
                self.status.lock().await.set_jogging(&self.port, jogging);
                self.broadcaster
                    .push(
                        self.handle,
                        ServerEvent::ControllerState { handle: self.handle, state: report.active_state.clone() },
                    )
                    .await;
                self.push_machine_status().await;
            }
            RunnerEffect::WorkflowEvent(event) => {
                let effects = self.workflow.lock().await.handle(event);
                self.apply_workflow_effects(effects).await;
            }
            RunnerEffect::SetHomed(homed) => {
                self.status.lock().await.set_homed(&self.port, homed);
                self.push_machine_status().await;
            }
            RunnerEffect::SetAlarmActive(active) => {
                self.status.lock().await.set_alarm_active(&self.port, active);
                self.push_machine_status().await;
            }
            RunnerEffect::SurfaceAlarm(code) => {
                warn!(port = %self.port, alarm = %code, "alarm raised");
                self.fire_trigger(LifecycleEvent::Alarm { code }).await;
            }
            RunnerEffect::UpdateSetting { index, value } => {
                self.status.lock().await.update_setting(&self.port, index, value);
            }
            RunnerEffect::Feedback { kind, body } => {
                if kind == FeedbackKind::ToolChange {
                    let tool = body
                        .split(|c: char| !c.is_ascii_digit())
                        .find(|s| !s.is_empty())
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0);
                    self.fire_trigger(LifecycleEvent::ToolChange { tool }).await;
                }
            }
            RunnerEffect::ProtocolDesync => {
                warn!(port = %self.port, "protocol desync: ok/error with no outstanding write, forcing reset");
                self.status.lock().await.set_healthy(&self.port, false);
                let effects = self.workflow.lock().await.handle(WorkflowEvent::ProtocolDesync);
                self.apply_workflow_effects(effects).await;
            }
        }
    }

    async fn apply_workflow_effects(&self, effects: Vec<workflow::Effect>) {
        if effects.is_empty() {
            return;
        }
        for effect in effects {
            match effect {
                workflow::Effect::SendRealtime(cmd) => {
                    let byte = self.protocol.realtime_byte(cmd);
                    let _ = self.link.write_realtime_byte(byte).await;
                }
                workflow::Effect::SenderStart => {
                    self.sender.lock().await.start();
                    self.status
                        .lock()
                        .await
                        .set_workflow_state(&self.port, self.workflow.lock().await.state());
                }
                workflow::Effect::SenderNext => self.pump_sender().await,
                workflow::Effect::SenderHold => {
                    self.sender.lock().await.hold("feedhold");
                    let name = self.job_name().await;
                    self.fire_trigger(LifecycleEvent::JobPause { name }).await;
                }
                workflow::Effect::SenderUnhold => {
                    self.sender.lock().await.unhold();
                    self.pump_sender().await;
                    let name = self.job_name().await;
                    self.fire_trigger(LifecycleEvent::JobResume { name }).await;
                }
                workflow::Effect::SenderRewind => self.sender.lock().await.rewind(),
                workflow::Effect::SenderStop => {
                    self.sender.lock().await.stop();
                    self.status
                        .lock()
                        .await
                        .set_workflow_state(&self.port, self.workflow.lock().await.state());
                }
                workflow::Effect::ClearHomed => self.status.lock().await.set_homed(&self.port, false),
                workflow::Effect::SurfaceAlarmEvent => {
                    warn!(port = %self.port, "workflow observed alarm");
                }
                workflow::Effect::DropSession => {
                    info!(port = %self.port, "session dropped after port close");
                }
                workflow::Effect::WarnForcedIdle => {
                    warn!(port = %self.port, "cancel watchdog forced workflow to idle");
                }
                workflow::Effect::JobEnded => {
                    let name = self.job_name().await;
                    self.broadcaster
                        .push(self.handle, ServerEvent::TaskFinish { handle: self.handle, name: name.clone() })
                        .await;
                    self.fire_trigger(LifecycleEvent::JobEnd { name }).await;
                }
                workflow::Effect::StartCancelWatchdog => self.start_cancel_watchdog(),
                workflow::Effect::CancelCancelWatchdog => {
                    self.cancel_watchdog_gen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let state = self.workflow.lock().await.state();
        self.broadcaster
            .push(self.handle, ServerEvent::WorkflowStatePush { handle: self.handle, state })
            .await;
        self.push_machine_status().await;
    }

    async fn job_name(&self) -> String {
        self.sender.lock().await.job().map(|j| j.name.clone()).unwrap_or_default()
    }

    fn start_cancel_watchdog(&self) {
        let gen = self.cancel_watchdog_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(me) = self.arc_self() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_WATCHDOG_TIMEOUT).await;
            if me.cancel_watchdog_gen.load(Ordering::SeqCst) == gen {
                me.force_idle_on_cancel_timeout().await;
            }
        });
    }

    async fn apply_jog_effects(&self, effects: Vec<jog::Effect>) {
        for effect in effects {
            match effect {
                jog::Effect::SendJog(segment) => {
                    let target = JogTarget {
                        dx: segment.dx,
                        dy: segment.dy,
                        dz: segment.dz,
                        feed_mm_per_min: segment.feed_mm_per_min,
                    };
                    let line = self.protocol.format_jog(target, self.units);
                    self.write_tracked(line, AckOwner::JogSegment).await;
                }
                jog::Effect::SendJogCancelByte => {
                    let byte = self.protocol.realtime_byte(RealtimeCommand::JogCancel);
                    let _ = self.link.write_realtime_byte(byte).await;
                }
                jog::Effect::SendFenceLine => {
                    self.write_tracked(jog::CANCEL_FENCE_LINE.to_string(), AckOwner::JogFence)
                        .await;
                }
                jog::Effect::StartCancelWatchdog => {
                    let gen = self.jog_watchdog_gen.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(me) = self.arc_self() {
                        tokio::spawn(async move {
                            tokio::time::sleep(jog::CANCEL_WATCHDOG).await;
                            if me.jog_watchdog_gen.load(Ordering::SeqCst) == gen {
                                me.force_jog_cancel_timeout().await;
                            }
                        });
                    }
                }
                jog::Effect::CancelWatchdog => {
                    self.jog_watchdog_gen.fetch_add(1, Ordering::SeqCst);
                }
                jog::Effect::SoftReset => {
                    let byte = self.protocol.realtime_byte(RealtimeCommand::SoftReset);
                    let _ = self.link.write_realtime_byte(byte).await;
                }
                jog::Effect::SurfaceJogCancelTimeout => {
                    warn!(port = %self.port, "jog cancel fence timed out");
                }
            }
        }
    }

    async fn write_tracked(&self, line: String, owner: AckOwner) {
        self.ack_owners.lock().await.push_back(owner);
        if let Err(e) = self.link.write_line(&line).await {
            warn!(port = %self.port, error = %e, "write failed");
            self.ack_owners.lock().await.pop_back();
            return;
        }
        self.broadcaster
            .push(self.handle, ServerEvent::SerialPortWrite { handle: self.handle, line })
            .await;
    }

    async fn pump_sender(&self) {
        let batch = self.sender.lock().await.next();
        for line in &batch.skipped_too_long {
            let (len, capacity) = {
                let sender = self.sender.lock().await;
                (line.len(), sender.capacity())
            };
            warn!(port = %self.port, line = %line, len, capacity, "line exceeds RX buffer, skipped");
            let err = CoreError::ErrorLineTooLong { len, capacity };
            self.broadcaster.push(self.handle, ServerEvent::Error((&err).into())).await;
        }
        if !batch.lines.is_empty() || !batch.skipped_too_long.is_empty() {
            self.push_sender_status().await;
        }
        for line in batch.lines {
            self.write_tracked(line, AckOwner::Sender).await;
        }
    }

    async fn pump_feeder(&self) {
        let running = self.workflow.lock().await.is_running();
        let item = self.feeder.lock().await.next(running);
        self.push_feeder_status().await;
        if let Some(FeedItem { text, .. }) = item {
            self.write_tracked(text, AckOwner::Feeder).await;
        }
    }

    /// Push the current `StatusAggregator` snapshot (spec §4.8 `machine:status`).
    async fn push_machine_status(&self) {
        if let Some(snapshot) = self.status.lock().await.get_status(&self.port) {
            self.broadcaster
                .push(self.handle, ServerEvent::MachineStatusPush { handle: self.handle, snapshot })
                .await;
        }
    }

    /// Push Sender progress/window state (spec §4.9 `sender:status`).
    async fn push_sender_status(&self) {
        let sender = self.sender.lock().await;
        let Some(job) = sender.job() else { return };
        let event = ServerEvent::SenderStatus {
            handle: self.handle,
            lines_sent: job.lines_sent as usize,
            lines_received: job.lines_received as usize,
            lines_total: job.lines_total as usize,
            held: sender.is_held(),
        };
        drop(sender);
        self.broadcaster.push(self.handle, event).await;
    }

    /// Push Feeder queue depth (spec §4.9 `feeder:status`).
    async fn push_feeder_status(&self) {
        let queued = self.feeder.lock().await.len();
        self.broadcaster
            .push(self.handle, ServerEvent::FeederStatus { handle: self.handle, queued })
            .await;
    }

    pub async fn load_job(&self, name: impl Into<String>, gcode: &str) -> Result<(), CoreError> {
        self.sender
            .lock()
            .await
            .load(name, gcode)
            .map_err(|_| CoreError::SessionBusy)
    }

    pub async fn start_job(&self) {
        let effects = self.workflow.lock().await.handle(WorkflowEvent::Start);
        self.apply_workflow_effects(effects).await;
        let name = self.job_name().await;
        self.fire_trigger(LifecycleEvent::JobStart { name }).await;
    }

    /// Queue one line into the Feeder, unconditionally. Used by the trigger
    /// system and by dispatcher-generated G-code (e.g. `zero_wcs`), neither
    /// of which is the client-facing `write`/`write_line` path spec §4.9
    /// gates on workflow state.
    async fn queue_feed_line(&self, line: impl Into<String>) {
        self.feeder.lock().await.feed([FeedItem::new(line)]);
        self.pump_feeder().await;
    }

    /// Client-facing MDI write (spec §4.9): rejected with `SessionBusy`
    /// while a job is Running rather than parked for later, since a client
    /// expects either an immediate write or an immediate error, not a
    /// silently deferred one.
    pub async fn feed_mdi(&self, line: impl Into<String>) -> Result<(), CoreError> {
        if self.workflow.lock().await.is_running() {
            return Err(CoreError::SessionBusy);
        }
        self.queue_feed_line(line).await;
        Ok(())
    }

    pub async fn jog_input(&self, sample: JogSample) {
        let effects = self.jog.lock().await.on_input(sample);
        self.apply_jog_effects(effects).await;
    }

    pub async fn dispatch(&self, verb: Verb) -> Result<(), CoreError> {
        let status = self
            .status
            .lock()
            .await
            .get_status(&self.port)
            .map(|s| s.machine_status)
            .unwrap_or(crate::session::status::MachineStatus::NotConnected);
        let actions = dispatcher::dispatch(verb, status, self.protocol.as_ref(), self.wcs_slot)?;
        for action in actions {
            match action {
                DispatchAction::Workflow(event) => {
                    let effects = self.workflow.lock().await.handle(event);
                    self.apply_workflow_effects(effects).await;
                }
                DispatchAction::JogStop => {
                    let effects = self.jog.lock().await.stop();
                    self.apply_jog_effects(effects).await;
                }
                DispatchAction::SendRealtime(cmd) => {
                    let byte = self.protocol.realtime_byte(cmd);
                    let _ = self.link.write_realtime_byte(byte).await;
                }
                DispatchAction::SendLine(line) => {
                    self.queue_feed_line(line).await;
                }
            }
        }
        Ok(())
    }

    /// Force the Workflow's `Cancelling -> Idle` watchdog (spec §5); called
    /// by the 2s timer spawned from `StartCancelWatchdog`.
    pub async fn force_idle_on_cancel_timeout(&self) {
        let effects = self.workflow.lock().await.force_idle_on_cancel_timeout();
        self.apply_workflow_effects(effects).await;
    }

    /// Force the JogLoop's 500ms cancel-fence watchdog.
    pub async fn force_jog_cancel_timeout(&self) {
        let effects = self.jog.lock().await.on_cancel_timeout();
        self.apply_jog_effects(effects).await;
    }

    /// Feed one canned reply line into the session's read loop, as if the
    /// firmware had written it. Test-only: the in-memory transport behind
    /// this only exists without the `serial` feature.
    #[cfg(not(feature = "serial"))]
    pub async fn push_incoming_line(&self, line: impl Into<String>) {
        self.link.push_incoming_line(line).await;
    }

    #[cfg(not(feature = "serial"))]
    pub async fn written_lines(&self) -> Vec<String> {
        self.link.written_lines().await
    }

    #[cfg(not(feature = "serial"))]
    pub async fn written_realtime_bytes(&self) -> Vec<u8> {
        self.link.written_realtime_bytes().await
    }
}
