//! CachedState and the machine-status aggregator (spec §3, §4.8).
//!
//! `StatusAggregator` is the single source of truth clients read through;
//! `MachineStatus` is always computed, never written directly, from the
//! priority order in spec §3.

use crate::controllers::{ActiveState, ControllerKind, Overrides, ParserState, Position};
use crate::session::workflow::WorkflowState;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Latest observed firmware state for one session (spec §3).
#[derive(Clone, Debug, Default)]
pub struct CachedState {
    pub active_state: Option<ActiveState>,
    pub machine_pos: Position,
    pub work_pos: Position,
    pub overrides: Overrides,
    pub parser_state: ParserState,
    /// Firmware settings table: register index -> numeric value.
    pub settings: HashMap<u32, f64>,
}

/// The computed public machine-status enum (spec §3), priority order:
/// `NotConnected > Alarm > Running > Hold > Jogging > Homing > ReadyHomed > ReadyUnhomed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    NotConnected,
    Alarm,
    Running,
    Hold,
    Jogging,
    Homing,
    ReadyHomed,
    ReadyUnhomed,
}

fn compute_machine_status(
    connected: bool,
    alarm_active: bool,
    workflow: WorkflowState,
    active_state: Option<&ActiveState>,
    jogging: bool,
    homed: bool,
) -> MachineStatus {
    if !connected {
        return MachineStatus::NotConnected;
    }
    if alarm_active || matches!(active_state, Some(ActiveState::Alarm(_))) {
        return MachineStatus::Alarm;
    }
    if matches!(workflow, WorkflowState::Running | WorkflowState::Cancelling) {
        return MachineStatus::Running;
    }
    if workflow == WorkflowState::Paused || matches!(active_state, Some(ActiveState::Hold(_))) {
        return MachineStatus::Hold;
    }
    if jogging || matches!(active_state, Some(ActiveState::Jog)) {
        return MachineStatus::Jogging;
    }
    if matches!(active_state, Some(ActiveState::Home)) {
        return MachineStatus::Homing;
    }
    if homed {
        MachineStatus::ReadyHomed
    } else {
        MachineStatus::ReadyUnhomed
    }
}

/// A point-in-time snapshot served to clients (spec §4.8 `getStatus`).
#[derive(Clone, Debug, serde::Serialize)]
pub struct StatusSnapshot {
    pub port: String,
    pub connected: bool,
    pub controller_type: Option<ControllerKind>,
    pub machine_status: MachineStatus,
    pub homed: bool,
    pub job_running: bool,
    pub homing_in_progress: bool,
    pub controller_state: Option<ActiveState>,
    pub workflow_state: Option<WorkflowState>,
    /// Open Question decision #3 (SPEC_FULL §9): explicit health bit,
    /// cleared on `ProtocolDesync`, restored only by a fresh `open()`.
    pub healthy: bool,
    pub last_update_unix_ms: u128,
}

struct PortRecord {
    connected: bool,
    controller_type: Option<ControllerKind>,
    workflow: WorkflowState,
    cached: CachedState,
    alarm_active: bool,
    jogging: bool,
    homed: bool,
    healthy: bool,
    job_running: bool,
}

impl Default for PortRecord {
    fn default() -> Self {
        PortRecord {
            connected: false,
            controller_type: None,
            workflow: WorkflowState::Idle,
            cached: CachedState::default(),
            alarm_active: false,
            jogging: false,
            homed: false,
            healthy: true,
            job_running: false,
        }
    }
}

/// Per-port aggregator: the single source of truth for the computed
/// machine status (spec §4.8). One instance is shared across all
/// `ControllerSession`s in the process.
#[derive(Default)]
pub struct StatusAggregator {
    ports: HashMap<String, PortRecord>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&mut self, port: &str, controller_type: ControllerKind) {
        let rec = self.ports.entry(port.to_string()).or_default();
        rec.connected = true;
        rec.controller_type = Some(controller_type);
        rec.healthy = true;
    }

    pub fn on_disconnect(&mut self, port: &str) {
        if let Some(rec) = self.ports.get_mut(port) {
            rec.connected = false;
        }
    }

    pub fn set_workflow_state(&mut self, port: &str, state: WorkflowState) {
        let rec = self.ports.entry(port.to_string()).or_default();
        rec.workflow = state;
        rec.job_running = matches!(state, WorkflowState::Running | WorkflowState::Cancelling);
    }

    pub fn set_active_state(&mut self, port: &str, active_state: ActiveState) {
        let rec = self.ports.entry(port.to_string()).or_default();
        rec.alarm_active = matches!(active_state, ActiveState::Alarm(_));
        rec.cached.active_state = Some(active_state);
    }

    pub fn update_position(&mut self, port: &str, machine_pos: Position, work_pos: Position) {
        let rec = self.ports.entry(port.to_string()).or_default();
        rec.cached.machine_pos = machine_pos;
        rec.cached.work_pos = work_pos;
    }

    pub fn update_overrides(&mut self, port: &str, overrides: Overrides) {
        self.ports.entry(port.to_string()).or_default().cached.overrides = overrides;
    }

    pub fn update_parser_state(&mut self, port: &str, parser_state: ParserState) {
        self.ports.entry(port.to_string()).or_default().cached.parser_state = parser_state;
    }

    pub fn update_setting(&mut self, port: &str, index: u32, value: f64) {
        self.ports
            .entry(port.to_string())
            .or_default()
            .cached
            .settings
            .insert(index, value);
    }

    pub fn set_jogging(&mut self, port: &str, jogging: bool) {
        self.ports.entry(port.to_string()).or_default().jogging = jogging;
    }

    pub fn set_alarm_active(&mut self, port: &str, active: bool) {
        self.ports.entry(port.to_string()).or_default().alarm_active = active;
    }

    pub fn set_homed(&mut self, port: &str, homed: bool) {
        self.ports.entry(port.to_string()).or_default().homed = homed;
    }

    pub fn homed(&self, port: &str) -> bool {
        self.ports.get(port).map(|r| r.homed).unwrap_or(false)
    }

    pub fn set_healthy(&mut self, port: &str, healthy: bool) {
        self.ports.entry(port.to_string()).or_default().healthy = healthy;
    }

    pub fn remove_port(&mut self, port: &str) {
        self.ports.remove(port);
    }

    pub fn cached_state(&self, port: &str) -> Option<&CachedState> {
        self.ports.get(port).map(|r| &r.cached)
    }

    pub fn get_status(&self, port: &str) -> Option<StatusSnapshot> {
        let rec = self.ports.get(port)?;
        let machine_status = compute_machine_status(
            rec.connected,
            rec.alarm_active,
            rec.workflow,
            rec.cached.active_state.as_ref(),
            rec.jogging,
            rec.homed,
        );
        Some(StatusSnapshot {
            port: port.to_string(),
            connected: rec.connected,
            controller_type: rec.controller_type,
            machine_status,
            homed: rec.homed,
            job_running: rec.job_running,
            homing_in_progress: matches!(rec.cached.active_state, Some(ActiveState::Home)),
            controller_state: rec.cached.active_state.clone(),
            workflow_state: Some(rec.workflow),
            healthy: rec.healthy,
            last_update_unix_ms: now_unix_ms(),
        })
    }

    pub fn get_all_statuses(&self) -> Vec<StatusSnapshot> {
        self.ports.keys().filter_map(|p| self.get_status(p)).collect()
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
