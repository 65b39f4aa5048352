//! Wire protocol (spec §6): newline-delimited JSON over TCP. Each line is
//! one `{ "type": ..., ... }` message in either direction — a
//! [`ClientMessage`] request or a [`ServerEvent`] push/reply.
//!
//! The source's Socket API is transport-agnostic ("bidirectional,
//! message-oriented"); WebSocket/HTTP are named external collaborators, so
//! this concretizes it onto the plainest framing that satisfies the same
//! shape: `tokio::net::TcpListener` plus one JSON object per line.

use crate::controllers::{ActiveState, ControllerKind, OverrideStep, RapidStep, ZeroAxes};
use crate::error::ErrorPayload;
use crate::hub::SessionHandle;
use crate::session::status::StatusSnapshot;
use crate::session::workflow::WorkflowState;
use serde::{Deserialize, Serialize};

/// A request from a connected client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ListPorts,
    OpenSession { port: String, controller_type: ControllerKind, baud_rate: u32 },
    CloseSession { handle: SessionHandle },
    Subscribe { handle: SessionHandle },
    Unsubscribe { handle: SessionHandle },
    GetStatus { handle: SessionHandle },
    GetAllStatuses,
    LoadJob { handle: SessionHandle, name: String, gcode: String },
    StartJob { handle: SessionHandle },
    FeedMdi { handle: SessionHandle, line: String },
    Jog { handle: SessionHandle, x: f64, y: f64, z: f64 },
    Homing { handle: SessionHandle },
    Unlock { handle: SessionHandle },
    Reset { handle: SessionHandle },
    FeedHold { handle: SessionHandle },
    CycleStart { handle: SessionHandle },
    JogCancel { handle: SessionHandle },
    FeedOverride { handle: SessionHandle, step: OverrideStep },
    RapidOverride { handle: SessionHandle, step: RapidStep },
    SpindleOverride { handle: SessionHandle, step: OverrideStep },
    SpindleOn { handle: SessionHandle, rpm: Option<f64> },
    SpindleOff { handle: SessionHandle },
    ZeroAxes { handle: SessionHandle, axes: ZeroAxes },
    EmergencyStop { handle: SessionHandle },
}

/// A push or reply sent to a client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ports { ports: Vec<crate::controllers::PortInfo> },
    SessionOpened { handle: SessionHandle },
    SessionClosed { handle: SessionHandle },
    Status(StatusSnapshot),
    AllStatuses { statuses: Vec<StatusSnapshot> },
    Ack,
    Error(ErrorPayload),

    /// One raw line read from the controller (spec §4.9 `serialport:read`).
    #[serde(rename = "serialport:read")]
    SerialPortRead { handle: SessionHandle, line: String },
    /// One raw line written to the controller (`serialport:write`).
    #[serde(rename = "serialport:write")]
    SerialPortWrite { handle: SessionHandle, line: String },
    /// The firmware's `activeState` changed (`controller:state`).
    #[serde(rename = "controller:state")]
    ControllerState { handle: SessionHandle, state: ActiveState },
    /// The workflow state machine transitioned (`workflow:state`).
    #[serde(rename = "workflow:state")]
    WorkflowStatePush { handle: SessionHandle, state: WorkflowState },
    /// Sender window/progress changed (`sender:status`).
    #[serde(rename = "sender:status")]
    SenderStatus {
        handle: SessionHandle,
        lines_sent: usize,
        lines_received: usize,
        lines_total: usize,
        held: bool,
    },
    /// Feeder queue depth changed (`feeder:status`).
    #[serde(rename = "feeder:status")]
    FeederStatus { handle: SessionHandle, queued: usize },
    /// Any `StatusAggregator` field changed (`machine:status`).
    #[serde(rename = "machine:status")]
    MachineStatusPush { handle: SessionHandle, snapshot: StatusSnapshot },
    /// A loaded job reached its terminal state (`task:finish`).
    #[serde(rename = "task:finish")]
    TaskFinish { handle: SessionHandle, name: String },
}
