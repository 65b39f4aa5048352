//! Shared wire-level types for firmware dialects.
//!
//! Generalizes the teacher's `machines::grbl::state` module (previously
//! GRBL-only) into types every `ControllerProtocol` implementation parses
//! into, independent of which firmware dialect produced them.

use serde::{Deserialize, Serialize};

/// Position in machine or work coordinates. Supports an optional rotary
/// (A) axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: Option<f64>,
}

impl Position {
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        a: None,
    };
}

/// Reason for a Hold state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    FeedHold,
    SafetyDoor,
    Other(String),
}

/// Alarm code. Grbl v1.1 numbering (alarms.h, codes 1-21); other dialects
/// map their own codes onto the same enum in their `ControllerProtocol`
/// impl, falling back to `Unknown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmCode {
    HardLimit,
    SoftLimit,
    AbortCycle,
    ProbeFailInitial,
    ProbeFailContact,
    HomingFailReset,
    HomingFailDoor,
    FailPulloff,
    HomingFailApproach,
    EStop,
    HomingRequired,
    LimitsEngaged,
    ProbeProtect,
    Spindle,
    HomingFailAutoSquaringApproach,
    SelftestFailed,
    MotorFault,
    HomingFail,
    ModbusException,
    ExpanderException,
    NvsFailed,
    Unknown(u32),
}

impl From<u32> for AlarmCode {
    fn from(n: u32) -> Self {
        match n {
            1 => AlarmCode::HardLimit,
            2 => AlarmCode::SoftLimit,
            3 => AlarmCode::AbortCycle,
            4 => AlarmCode::ProbeFailInitial,
            5 => AlarmCode::ProbeFailContact,
            6 => AlarmCode::HomingFailReset,
            7 => AlarmCode::HomingFailDoor,
            8 => AlarmCode::FailPulloff,
            9 => AlarmCode::HomingFailApproach,
            10 => AlarmCode::EStop,
            11 => AlarmCode::HomingRequired,
            12 => AlarmCode::LimitsEngaged,
            13 => AlarmCode::ProbeProtect,
            14 => AlarmCode::Spindle,
            15 => AlarmCode::HomingFailAutoSquaringApproach,
            16 => AlarmCode::SelftestFailed,
            17 => AlarmCode::MotorFault,
            18 => AlarmCode::HomingFail,
            19 => AlarmCode::ModbusException,
            20 => AlarmCode::ExpanderException,
            21 => AlarmCode::NvsFailed,
            other => AlarmCode::Unknown(other),
        }
    }
}

impl std::fmt::Display for AlarmCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlarmCode::Unknown(n) => write!(f, "{}", n),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Input pin state (limit switches, probe) reported in some status lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinState {
    pub limit_x: bool,
    pub limit_y: bool,
    pub limit_z: bool,
    pub probe: bool,
    pub door: bool,
}

/// Active firmware state, the leading token of a Grbl-style status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActiveState {
    Idle,
    Run,
    Hold(HoldReason),
    Jog,
    Alarm(AlarmCode),
    Door,
    Check,
    Home,
    Sleep,
    Unknown(String),
}

/// Modal parser state (`[GC:...]` feedback), flattened to the handful of
/// modal groups clients care about.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserState {
    pub motion_mode: Option<String>,
    pub wcs: Option<String>,
    pub plane: Option<String>,
    pub units: Option<String>,
    pub distance_mode: Option<String>,
    pub feed_mode: Option<String>,
    pub program_mode: Option<String>,
    pub spindle_state: Option<String>,
    pub coolant_state: Option<String>,
    pub feed_rate: Option<f64>,
    pub spindle_speed: Option<f64>,
    pub tool: Option<u32>,
}

/// Active overrides reported in a status line (feed %, rapid %, spindle %).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub feed_percent: u16,
    pub rapid_percent: u16,
    pub spindle_percent: u16,
}

/// Which firmware dialect a session is speaking to. Exposed to clients as
/// `controllerType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    Grbl,
    Marlin,
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerKind::Grbl => write!(f, "grbl"),
            ControllerKind::Marlin => write!(f, "marlin"),
        }
    }
}
