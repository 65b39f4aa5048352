//! The workflow state machine (spec §4.5).
//!
//! A pure state machine: it never touches the serial port, the Sender, or
//! the Feeder directly. Instead each transition returns the list of
//! [`Effect`]s the caller (`ControllerSession`) must carry out — the
//! "tagged variants instead of dynamic events" idiom from Design Notes §9.

use crate::controllers::RealtimeCommand;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum WorkflowState {
    Idle,
    Running,
    Paused,
    Cancelling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowEvent {
    Start,
    Pause,
    Resume,
    Stop,
    AlarmObserved,
    PortClosed,
    /// `Ok`/`Error` arrived with nothing outstanding (spec §7
    /// `ProtocolDesync`) — the session is forcibly reset.
    ProtocolDesync,
    /// The firmware's `activeState` was observed transitioning to Idle
    /// (drives the Cancelling -> Idle edge).
    StatusIdleObserved,
}

/// A side effect a transition requires the caller to perform, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    SendRealtime(RealtimeCommand),
    SenderStart,
    SenderNext,
    SenderHold,
    SenderUnhold,
    SenderRewind,
    SenderStop,
    ClearHomed,
    SurfaceAlarmEvent,
    DropSession,
    WarnForcedIdle,
    /// The loaded job reached its terminal state (completed or was
    /// cancelled) — the caller fires the `job:end` lifecycle trigger here.
    JobEnded,
    /// Entered `Cancelling`: start the 2s watchdog that forces `Idle` if
    /// the firmware never reports it.
    StartCancelWatchdog,
    /// Left `Cancelling` on its own: invalidate any outstanding watchdog.
    CancelCancelWatchdog,
}

/// The 4-state workflow. Initial state `Idle`.
pub struct Workflow {
    state: WorkflowState,
}

impl Default for Workflow {
    fn default() -> Self {
        Workflow { state: WorkflowState::Idle }
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkflowState::Running
    }

    /// Apply an event, returning the effects to perform. Events illegal in
    /// the current state are no-ops (empty effect list, state unchanged) —
    /// the Dispatcher's guard table is what should have prevented them from
    /// reaching here in the first place.
    pub fn handle(&mut self, event: WorkflowEvent) -> Vec<Effect> {
        use WorkflowEvent::*;
        use WorkflowState::*;

        // Alarm and port-close apply from any state.
        match event {
            AlarmObserved => {
                self.state = Idle;
                return vec![
                    Effect::SenderRewind,
                    Effect::SenderStop,
                    Effect::ClearHomed,
                    Effect::SurfaceAlarmEvent,
                ];
            }
            PortClosed => {
                self.state = Idle;
                return vec![
                    Effect::SenderRewind,
                    Effect::SenderStop,
                    Effect::ClearHomed,
                    Effect::DropSession,
                ];
            }
            ProtocolDesync => {
                self.state = Idle;
                return vec![
                    Effect::SendRealtime(RealtimeCommand::SoftReset),
                    Effect::SenderRewind,
                    Effect::SenderStop,
                    Effect::ClearHomed,
                ];
            }
            _ => {}
        }

        match (self.state, event) {
            (Idle, Start) => {
                self.state = Running;
                vec![Effect::SenderStart, Effect::SenderNext]
            }
            (Running, Pause) => {
                self.state = Paused;
                vec![
                    Effect::SendRealtime(RealtimeCommand::FeedHold),
                    Effect::SenderHold,
                ]
            }
            (Paused, Resume) => {
                self.state = Running;
                vec![
                    Effect::SendRealtime(RealtimeCommand::CycleStart),
                    Effect::SenderUnhold,
                    Effect::SenderNext,
                ]
            }
            (Running, Stop) => {
                self.state = Cancelling;
                vec![
                    Effect::SendRealtime(RealtimeCommand::SoftReset),
                    Effect::SenderRewind,
                    Effect::StartCancelWatchdog,
                ]
            }
            (Paused, Stop) => {
                self.state = Idle;
                vec![
                    Effect::SendRealtime(RealtimeCommand::SoftReset),
                    Effect::SenderRewind,
                    Effect::SenderStop,
                    Effect::JobEnded,
                ]
            }
            (Cancelling, StatusIdleObserved) => {
                self.state = Idle;
                vec![Effect::SenderStop, Effect::JobEnded, Effect::CancelCancelWatchdog]
            }
            (Running, StatusIdleObserved) => {
                // The firmware went idle on its own (no Stop was issued):
                // the job ran to completion.
                self.state = Idle;
                vec![Effect::SenderStop, Effect::JobEnded]
            }
            _ => vec![],
        }
    }

    /// Called by the 2s Cancelling-watchdog on expiry (spec §5): force the
    /// transition to Idle regardless of firmware state.
    pub fn force_idle_on_cancel_timeout(&mut self) -> Vec<Effect> {
        if self.state != WorkflowState::Cancelling {
            return vec![];
        }
        self.state = WorkflowState::Idle;
        vec![Effect::SenderStop, Effect::WarnForcedIdle]
    }
}
