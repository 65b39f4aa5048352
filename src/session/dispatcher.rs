//! The guarded verb table (spec §4.10): the single entry point clients use
//! to drive the machine interactively. Each verb is checked against the
//! current computed [`MachineStatus`] before anything is sent to the wire;
//! a verb illegal in the observed state comes back as
//! [`CoreError::IllegalState`] rather than being forwarded to firmware that
//! may not handle it gracefully.
//!
//! Grounded on the teacher's `machines::grbl::commands` command table,
//! generalized from a flat list of GRBL command strings into dialect-neutral
//! verbs resolved through [`ControllerProtocol`].

use crate::controllers::{
    ControllerProtocol, OverrideStep, RapidStep, RealtimeCommand, Units, ZeroAxes,
};
use crate::error::CoreError;
use crate::session::status::MachineStatus;
use crate::session::workflow::WorkflowEvent;

/// A client-issued command, guarded against the observed machine status.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verb {
    Homing,
    Unlock,
    Reset,
    FeedHold,
    CycleStart,
    JogCancel,
    FeedOverride(OverrideStep),
    RapidOverride(RapidStep),
    SpindleOverride(OverrideStep),
    SpindleOn { rpm: Option<f64> },
    SpindleOff,
    ZeroAxes(ZeroAxes),
    EmergencyStop,
}

impl Verb {
    fn name(&self) -> &'static str {
        match self {
            Verb::Homing => "homing",
            Verb::Unlock => "unlock",
            Verb::Reset => "reset",
            Verb::FeedHold => "feedhold",
            Verb::CycleStart => "cyclestart",
            Verb::JogCancel => "jogCancel",
            Verb::FeedOverride(_) => "feedOverride",
            Verb::RapidOverride(_) => "rapidOverride",
            Verb::SpindleOverride(_) => "spindleOverride",
            Verb::SpindleOn { .. } => "spindleOn",
            Verb::SpindleOff => "spindleOff",
            Verb::ZeroAxes(_) => "zero",
            Verb::EmergencyStop => "emergencyStop",
        }
    }
}

/// What the caller (`ControllerSession`) must do once a verb clears its
/// guard. Dispatcher never touches the wire or the Workflow/JogLoop state
/// directly — it only decides whether the verb is legal right now and, if
/// so, how to realize it.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchAction {
    /// Hand off to the Workflow state machine (feedhold/cyclestart are just
    /// Pause/Resume from the machine's point of view).
    Workflow(WorkflowEvent),
    /// Tell the JogLoop the operator asked to stop.
    JogStop,
    SendRealtime(RealtimeCommand),
    SendLine(String),
}

fn illegal(verb: Verb, status: MachineStatus) -> CoreError {
    CoreError::IllegalState {
        verb: verb.name().to_string(),
        observed: format!("{:?}", status),
    }
}

/// Validate `verb` against `status` and resolve it into the actions needed
/// to carry it out. `protocol` formats any dialect-specific command text;
/// `wcs` selects the work-coordinate-system slot for zeroing verbs.
pub fn dispatch(
    verb: Verb,
    status: MachineStatus,
    protocol: &dyn ControllerProtocol,
    wcs: u8,
) -> Result<Vec<DispatchAction>, CoreError> {
    use MachineStatus::*;

    // Emergency stop bypasses every guard: it is always legal to attempt.
    if verb == Verb::EmergencyStop {
        return Ok(vec![DispatchAction::SendRealtime(RealtimeCommand::SoftReset)]);
    }

    if status == NotConnected {
        return Err(illegal(verb, status));
    }

    match verb {
        Verb::Homing => {
            if matches!(status, Running | Jogging | Homing) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendLine(protocol.format_home())])
        }
        Verb::Unlock => {
            if status != Alarm {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendLine(protocol.format_unlock())])
        }
        Verb::Reset => Ok(vec![DispatchAction::SendRealtime(RealtimeCommand::SoftReset)]),
        Verb::FeedHold => {
            if status != Running {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::Workflow(WorkflowEvent::Pause)])
        }
        Verb::CycleStart => {
            if status != Hold {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::Workflow(WorkflowEvent::Resume)])
        }
        Verb::JogCancel => {
            if status != Jogging {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::JogStop])
        }
        Verb::FeedOverride(step) => {
            if !matches!(status, Running | Hold | Jogging) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendRealtime(RealtimeCommand::FeedOverride(step))])
        }
        Verb::RapidOverride(step) => {
            if !matches!(status, Running | Hold | Jogging) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendRealtime(RealtimeCommand::RapidOverride(step))])
        }
        Verb::SpindleOverride(step) => {
            if !matches!(status, Running | Hold | Jogging) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendRealtime(RealtimeCommand::SpindleOverride(step))])
        }
        Verb::SpindleOn { rpm } => {
            if !matches!(status, ReadyHomed | ReadyUnhomed) {
                return Err(illegal(verb, status));
            }
            let line = match rpm {
                Some(rpm) => format!("M3 S{:.0}", rpm),
                None => "M3".to_string(),
            };
            Ok(vec![DispatchAction::SendLine(line)])
        }
        Verb::SpindleOff => {
            if !matches!(status, ReadyHomed | ReadyUnhomed) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendLine("M5".to_string())])
        }
        Verb::ZeroAxes(axes) => {
            if axes == ZeroAxes::All {
                if status != ReadyHomed {
                    return Err(illegal(verb, status));
                }
            } else if !matches!(status, ReadyHomed | ReadyUnhomed) {
                return Err(illegal(verb, status));
            }
            Ok(vec![DispatchAction::SendLine(protocol.format_zero_wcs(axes, wcs))])
        }
        Verb::EmergencyStop => unreachable!("handled above"),
    }
}

/// Units to use when formatting jog commands issued alongside dispatcher
/// verbs (the Dispatcher itself never jogs; this is re-exported for callers
/// that need the session-wide default).
pub const DEFAULT_UNITS: Units = Units::Metric;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::grbl::GrblProtocol;

    fn protocol() -> GrblProtocol {
        GrblProtocol
    }

    #[test]
    fn homing_rejected_while_running() {
        let err = dispatch(Verb::Homing, MachineStatus::Running, &protocol(), 1).unwrap_err();
        assert_eq!(err.kind(), "IllegalState");
    }

    #[test]
    fn homing_allowed_when_idle() {
        let actions = dispatch(Verb::Homing, MachineStatus::ReadyUnhomed, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::SendLine("$H".to_string())]);
    }

    #[test]
    fn unlock_requires_alarm() {
        assert!(dispatch(Verb::Unlock, MachineStatus::ReadyUnhomed, &protocol(), 1).is_err());
        let actions = dispatch(Verb::Unlock, MachineStatus::Alarm, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::SendLine("$X".to_string())]);
    }

    #[test]
    fn feedhold_only_while_running() {
        assert!(dispatch(Verb::FeedHold, MachineStatus::ReadyHomed, &protocol(), 1).is_err());
        let actions = dispatch(Verb::FeedHold, MachineStatus::Running, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::Workflow(WorkflowEvent::Pause)]);
    }

    #[test]
    fn cyclestart_only_while_held() {
        assert!(dispatch(Verb::CycleStart, MachineStatus::Running, &protocol(), 1).is_err());
        let actions = dispatch(Verb::CycleStart, MachineStatus::Hold, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::Workflow(WorkflowEvent::Resume)]);
    }

    #[test]
    fn jog_cancel_only_while_jogging() {
        assert!(dispatch(Verb::JogCancel, MachineStatus::ReadyHomed, &protocol(), 1).is_err());
        let actions = dispatch(Verb::JogCancel, MachineStatus::Jogging, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::JogStop]);
    }

    #[test]
    fn spindle_on_off_requires_idle() {
        assert!(dispatch(Verb::SpindleOn { rpm: Some(12000.0) }, MachineStatus::Running, &protocol(), 1).is_err());
        let actions =
            dispatch(Verb::SpindleOn { rpm: Some(12000.0) }, MachineStatus::ReadyHomed, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::SendLine("M3 S12000".to_string())]);
    }

    #[test]
    fn zero_single_axis_requires_idle_not_necessarily_homed() {
        let actions = dispatch(Verb::ZeroAxes(ZeroAxes::X), MachineStatus::ReadyUnhomed, &protocol(), 1).unwrap();
        assert_eq!(
            actions,
            vec![DispatchAction::SendLine(protocol().format_zero_wcs(ZeroAxes::X, 1))]
        );
    }

    #[test]
    fn zero_all_additionally_requires_homed() {
        assert!(dispatch(Verb::ZeroAxes(ZeroAxes::All), MachineStatus::ReadyUnhomed, &protocol(), 1).is_err());
        let actions = dispatch(Verb::ZeroAxes(ZeroAxes::All), MachineStatus::ReadyHomed, &protocol(), 1).unwrap();
        assert_eq!(
            actions,
            vec![DispatchAction::SendLine(protocol().format_zero_wcs(ZeroAxes::All, 1))]
        );
    }

    #[test]
    fn emergency_stop_bypasses_all_guards() {
        let actions = dispatch(Verb::EmergencyStop, MachineStatus::NotConnected, &protocol(), 1).unwrap();
        assert_eq!(actions, vec![DispatchAction::SendRealtime(RealtimeCommand::SoftReset)]);
    }

    #[test]
    fn not_connected_rejects_everything_else() {
        let err = dispatch(Verb::Homing, MachineStatus::NotConnected, &protocol(), 1).unwrap_err();
        assert_eq!(err.kind(), "IllegalState");
    }
}
