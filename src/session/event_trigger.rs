//! Lifecycle event triggers: user-configured rules that fire G-code into
//! the Feeder, or hand a command line to an external task runner, when a
//! session reaches a named lifecycle point (startup, job boundaries, tool
//! change, alarm).
//!
//! Generalizes the teacher's flat `machines::grbl::commands` dispatch table
//! from "one fixed command per verb" to "a configurable list of rules keyed
//! by event name," since SPEC_FULL's trigger system has to be driven by
//! user configuration rather than compiled-in behavior.

use crate::controllers::AlarmCode;
use serde::{Deserialize, Serialize};

/// A lifecycle point a rule can be keyed on.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Startup,
    JobStart { name: String },
    JobEnd { name: String },
    JobPause { name: String },
    JobResume { name: String },
    JobError { name: String, code: u32 },
    ToolChange { tool: u32 },
    Alarm { code: AlarmCode },
}

impl LifecycleEvent {
    /// The rule-matching key, independent of payload.
    pub fn key(&self) -> &'static str {
        match self {
            LifecycleEvent::Startup => "startup",
            LifecycleEvent::JobStart { .. } => "job:start",
            LifecycleEvent::JobEnd { .. } => "job:end",
            LifecycleEvent::JobPause { .. } => "job:pause",
            LifecycleEvent::JobResume { .. } => "job:resume",
            LifecycleEvent::JobError { .. } => "job:error",
            LifecycleEvent::ToolChange { .. } => "tool:change",
            LifecycleEvent::Alarm { .. } => "alarm",
        }
    }
}

/// How a matched rule's body should be carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Submit `body` to the session's Feeder as one MDI line.
    Gcode,
    /// Hand `body` to an external task runner (shell command, script path).
    System,
}

/// One configured rule: "when `event` fires, do `kind` with `body`."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerRule {
    pub event: String,
    pub kind: TriggerKind,
    pub body: String,
}

/// What the caller must do to carry out a fired rule.
#[derive(Clone, Debug, PartialEq)]
pub enum TriggerAction {
    Gcode(String),
    System(String),
}

/// The rule table, typically loaded once from [`crate::config::Config`] at
/// startup and shared read-only across sessions.
#[derive(Clone, Debug, Default)]
pub struct EventTrigger {
    rules: Vec<TriggerRule>,
}

impl EventTrigger {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        EventTrigger { rules }
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// Resolve every rule matching `event`'s key into the actions the
    /// caller must perform, in configuration order.
    pub fn fire(&self, event: &LifecycleEvent) -> Vec<TriggerAction> {
        let key = event.key();
        self.rules
            .iter()
            .filter(|r| r.event == key)
            .map(|r| match r.kind {
                TriggerKind::Gcode => TriggerAction::Gcode(r.body.clone()),
                TriggerKind::System => TriggerAction::System(r.body.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_rules_matching_the_event_key() {
        let trigger = EventTrigger::new(vec![
            TriggerRule { event: "job:start".into(), kind: TriggerKind::Gcode, body: "M8".into() },
            TriggerRule { event: "job:end".into(), kind: TriggerKind::Gcode, body: "M9".into() },
        ]);
        let actions = trigger.fire(&LifecycleEvent::JobStart { name: "part.nc".into() });
        assert_eq!(actions, vec![TriggerAction::Gcode("M8".into())]);
    }

    #[test]
    fn multiple_rules_on_the_same_event_all_fire_in_order() {
        let trigger = EventTrigger::new(vec![
            TriggerRule { event: "alarm".into(), kind: TriggerKind::System, body: "notify-send alarm".into() },
            TriggerRule { event: "alarm".into(), kind: TriggerKind::Gcode, body: "M5".into() },
        ]);
        let actions = trigger.fire(&LifecycleEvent::Alarm { code: AlarmCode::HardLimit });
        assert_eq!(
            actions,
            vec![
                TriggerAction::System("notify-send alarm".into()),
                TriggerAction::Gcode("M5".into()),
            ]
        );
    }

    #[test]
    fn no_rules_means_no_actions() {
        let trigger = EventTrigger::default();
        assert!(trigger.fire(&LifecycleEvent::Startup).is_empty());
    }

    #[test]
    fn tool_change_key_is_distinct_from_job_events() {
        let trigger = EventTrigger::new(vec![TriggerRule {
            event: "tool:change".into(),
            kind: TriggerKind::Gcode,
            body: "G4 P2".into(),
        }]);
        assert!(trigger.fire(&LifecycleEvent::JobStart { name: "x".into() }).is_empty());
        assert_eq!(
            trigger.fire(&LifecycleEvent::ToolChange { tool: 3 }),
            vec![TriggerAction::Gcode("G4 P2".into())]
        );
    }
}
