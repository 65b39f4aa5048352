//! Binds one classified [`Reply`] to the subsystem that owns it (spec
//! §4.6): the Sender, the Feeder, or the JogLoop's outstanding window for
//! `Ok`/`Error`; the CachedState/StatusAggregator/Workflow for everything
//! else.
//!
//! Pure and stateless — `ControllerSession` is the only thing that knows
//! which subsystem sent the oldest in-flight write, so it passes that in as
//! `owner` and carries out whichever [`RunnerEffect`]s come back.

use crate::controllers::{ActiveState, AlarmCode, FeedbackKind, Reply, StatusReport};
use crate::session::sender::Terminal;
use crate::session::workflow::WorkflowEvent;

/// Which subsystem's oldest outstanding write a terminal reply resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOwner {
    Sender,
    Feeder,
    JogFence,
    JogSegment,
}

/// An action `ControllerSession` must carry out after classifying one
/// reply line.
#[derive(Clone, Debug, PartialEq)]
pub enum RunnerEffect {
    SenderAck(Terminal),
    FeederAck,
    /// `bool` is `is_fence`, passed straight to `JogLoop::on_ack`.
    JogAck(bool),
    UpdateCachedState(StatusReport),
    WorkflowEvent(WorkflowEvent),
    SetHomed(bool),
    SetAlarmActive(bool),
    SurfaceAlarm(AlarmCode),
    UpdateSetting { index: u32, value: f64 },
    Feedback { kind: FeedbackKind, body: String },
    /// `Ok`/`Error` arrived with nothing outstanding (spec §7
    /// `ProtocolDesync`): the caller marks the session unhealthy and forces
    /// a reset.
    ProtocolDesync,
}

/// Classify one reply into the effects needed to route it. `owner` is
/// `None` when `Ok`/`Error` arrives with nothing outstanding, which
/// produces a [`RunnerEffect::ProtocolDesync`] rather than the `Sender`'s
/// own `ack()` desync path (which only fires when the Sender itself owns
/// the stale window entry). `prev_active_state` is the last `Status`
/// reply's active state, used to detect the `Home -> Idle` and
/// `Run -> Idle` edges.
pub fn handle_reply(
    reply: &Reply,
    owner: Option<AckOwner>,
    prev_active_state: Option<&ActiveState>,
) -> Vec<RunnerEffect> {
    match reply {
        Reply::Ok => ack_effects(owner, Terminal::Ok),
        Reply::Error(code) => ack_effects(owner, Terminal::Error(*code)),
        Reply::Alarm(code) => vec![
            RunnerEffect::SetAlarmActive(true),
            RunnerEffect::WorkflowEvent(WorkflowEvent::AlarmObserved),
            RunnerEffect::SetHomed(false),
            RunnerEffect::SurfaceAlarm(*code),
        ],
        Reply::Status(report) => {
            let mut effects = vec![RunnerEffect::UpdateCachedState(report.clone())];
            if matches!(prev_active_state, Some(ActiveState::Home))
                && report.active_state == ActiveState::Idle
            {
                effects.push(RunnerEffect::SetHomed(true));
            }
            if matches!(prev_active_state, Some(ActiveState::Run))
                && report.active_state == ActiveState::Idle
            {
                effects.push(RunnerEffect::WorkflowEvent(WorkflowEvent::StatusIdleObserved));
            }
            effects
        }
        Reply::Feedback { kind, body } => vec![RunnerEffect::Feedback {
            kind: kind.clone(),
            body: body.clone(),
        }],
        Reply::Setting { index, value } => match value.parse::<f64>() {
            Ok(v) => vec![RunnerEffect::UpdateSetting { index: *index, value: v }],
            Err(_) => vec![],
        },
        Reply::Startup { .. } | Reply::Echo { .. } | Reply::Other { .. } => vec![],
    }
}

fn ack_effects(owner: Option<AckOwner>, terminal: Terminal) -> Vec<RunnerEffect> {
    match owner {
        Some(AckOwner::Sender) => vec![RunnerEffect::SenderAck(terminal)],
        Some(AckOwner::Feeder) => vec![RunnerEffect::FeederAck],
        Some(AckOwner::JogFence) => vec![RunnerEffect::JogAck(true)],
        Some(AckOwner::JogSegment) => vec![RunnerEffect::JogAck(false)],
        None => vec![RunnerEffect::ProtocolDesync],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::{Overrides, PinState, Position};

    fn status(active_state: ActiveState) -> StatusReport {
        StatusReport {
            active_state,
            machine_pos: Some(Position::ORIGIN),
            work_pos: Some(Position::ORIGIN),
            feed: None,
            speed: None,
            buffer: None,
            overrides: Some(Overrides::default()),
            pin_state: Some(PinState::default()),
            received_at: None,
        }
    }

    #[test]
    fn ok_routes_to_the_declared_owner() {
        let effects = handle_reply(&Reply::Ok, Some(AckOwner::Sender), None);
        assert_eq!(effects, vec![RunnerEffect::SenderAck(Terminal::Ok)]);

        let effects = handle_reply(&Reply::Ok, Some(AckOwner::Feeder), None);
        assert_eq!(effects, vec![RunnerEffect::FeederAck]);

        let effects = handle_reply(&Reply::Ok, Some(AckOwner::JogFence), None);
        assert_eq!(effects, vec![RunnerEffect::JogAck(true)]);
    }

    #[test]
    fn ok_with_no_owner_is_a_protocol_desync() {
        assert_eq!(handle_reply(&Reply::Ok, None, None), vec![RunnerEffect::ProtocolDesync]);
    }

    #[test]
    fn error_routes_with_code() {
        let effects = handle_reply(&Reply::Error(20), Some(AckOwner::Sender), None);
        assert_eq!(effects, vec![RunnerEffect::SenderAck(Terminal::Error(20))]);
    }

    #[test]
    fn alarm_surfaces_full_side_effect_set() {
        let effects = handle_reply(&Reply::Alarm(AlarmCode::HardLimit), None, None);
        assert!(effects.contains(&RunnerEffect::WorkflowEvent(WorkflowEvent::AlarmObserved)));
        assert!(effects.contains(&RunnerEffect::SetHomed(false)));
        assert!(effects.contains(&RunnerEffect::SurfaceAlarm(AlarmCode::HardLimit)));
    }

    #[test]
    fn home_to_idle_edge_sets_homed() {
        let report = status(ActiveState::Idle);
        let effects = handle_reply(&Reply::Status(report), None, Some(&ActiveState::Home));
        assert!(effects.contains(&RunnerEffect::SetHomed(true)));
    }

    #[test]
    fn run_to_idle_edge_notifies_workflow() {
        let report = status(ActiveState::Idle);
        let effects = handle_reply(&Reply::Status(report), None, Some(&ActiveState::Run));
        assert!(effects.contains(&RunnerEffect::WorkflowEvent(WorkflowEvent::StatusIdleObserved)));
    }

    #[test]
    fn idle_to_idle_is_not_an_edge() {
        let report = status(ActiveState::Idle);
        let effects = handle_reply(&Reply::Status(report), None, Some(&ActiveState::Idle));
        assert!(!effects.iter().any(|e| matches!(e, RunnerEffect::SetHomed(true))));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, RunnerEffect::WorkflowEvent(WorkflowEvent::StatusIdleObserved))));
    }

    #[test]
    fn setting_parses_numeric_value() {
        let effects = handle_reply(
            &Reply::Setting { index: 120, value: "500.000".to_string() },
            None,
            None,
        );
        assert_eq!(effects, vec![RunnerEffect::UpdateSetting { index: 120, value: 500.0 }]);
    }

    #[test]
    fn malformed_setting_value_is_dropped() {
        let effects = handle_reply(
            &Reply::Setting { index: 120, value: "not-a-number".to_string() },
            None,
            None,
        );
        assert!(effects.is_empty());
    }
}
