//! Firmware dialects: the trait seam named in Design Notes §9.
//!
//! The source models "controller type" as a dynamic string dispatched over
//! at runtime; here it is a trait implemented once per dialect
//! ([`grbl`], [`marlin`]), each providing a line parser, a realtime-byte
//! table, a jog-command formatter, and a homing/zeroing command formatter.

pub mod grbl;
pub mod marlin;
pub mod types;

pub use types::*;

use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Errors produced by `ControllerProtocol::parse_line`. Parsing must never
/// panic; malformed numerics degrade to `Reply::Other` rather than erroring,
/// so this type is reserved for places a caller explicitly asked for a
/// strict parse (e.g. `$$` settings dumps).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("invalid settings line: {0}")]
    InvalidSettingsLine(String),
}

/// One classified reply line (spec §4.2).
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ok,
    Error(u32),
    Alarm(AlarmCode),
    Status(StatusReport),
    Feedback { kind: FeedbackKind, body: String },
    Setting { index: u32, value: String },
    Startup { version: String, variant: String },
    Echo { text: String, line_number: Option<u64> },
    Other { raw: String },
}

/// Bracketed `[...]` feedback kinds (spec §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedbackKind {
    ParserState,
    Message,
    ToolChange,
    Unknown,
}

/// A parsed `<...>` status report.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub active_state: ActiveState,
    pub machine_pos: Option<Position>,
    pub work_pos: Option<Position>,
    pub feed: Option<f64>,
    pub speed: Option<f64>,
    pub buffer: Option<(u32, u32)>,
    pub overrides: Option<Overrides>,
    pub pin_state: Option<PinState>,
    #[allow(dead_code)]
    pub received_at: Option<Instant>,
}

/// Firmware streaming discipline (spec §3 OutstandingWindow).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingProtocol {
    /// Window bounded by bytes of unacknowledged payload (Grbl).
    CharacterCounting,
    /// Strict stop-and-wait, one outstanding command (Marlin-class).
    SendResponse,
}

/// Realtime single-byte commands (spec §4.10, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RealtimeCommand {
    StatusRequest,
    FeedHold,
    CycleStart,
    SoftReset,
    JogCancel,
    FeedOverride(OverrideStep),
    RapidOverride(RapidStep),
    SpindleOverride(OverrideStep),
}

/// A feed/spindle override step: a relative nudge or a reset to 100%.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideStep {
    Plus10,
    Plus1,
    Minus10,
    Minus1,
    Reset100,
}

/// Rapid override presets (Grbl only has three fixed levels).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RapidStep {
    Pct25,
    Pct50,
    Pct100,
}

/// Which axes to zero in a `zero_*` dispatcher verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroAxes {
    All,
    X,
    Y,
    Z,
}

/// Linear units for jog/motion formatting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Units {
    Metric,
    Imperial,
}

/// An incremental jog target, pre-computed by [`crate::session::jog`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JogTarget {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub feed_mm_per_min: f64,
}

/// One firmware dialect: parses its replies and formats its commands.
///
/// Implementations must be stateless (safe to share via `Arc` across a
/// session) — all mutable state lives in the session components that use
/// this trait, not in the trait object itself.
pub trait ControllerProtocol: Send + Sync {
    fn kind(&self) -> ControllerKind;

    /// Classify a single already-trimmed protocol line. Never panics.
    fn parse_line(&self, line: &str) -> Reply;

    fn streaming_protocol(&self) -> StreamingProtocol;

    /// Maximum bytes of unacknowledged payload (CharacterCounting) or 1
    /// for SendResponse dialects (the window tracks *commands*, not bytes,
    /// in that mode; see [`crate::session::sender`]).
    fn rx_buffer_capacity(&self) -> usize;

    fn realtime_byte(&self, cmd: RealtimeCommand) -> u8;

    /// `$J=G91 G21 X{dx} Y{dy} Z{dz} F{feed}`-style incremental jog command,
    /// omitting zero-displacement axes.
    fn format_jog(&self, target: JogTarget, units: Units) -> String;

    /// Homing cycle command (`$H`).
    fn format_home(&self) -> String;

    /// Alarm unlock command (`$X`).
    fn format_unlock(&self) -> String;

    /// Work-coordinate-system zero command (`G10 L20 P{wcs} ...`).
    fn format_zero_wcs(&self, axes: ZeroAxes, wcs: u8) -> String;

    /// Settings request command (`$$`), if the dialect supports one.
    fn format_settings_request(&self) -> Option<String> {
        None
    }
}

/// Build the protocol implementation for a given dialect.
pub fn protocol_for(kind: ControllerKind) -> Box<dyn ControllerProtocol> {
    match kind {
        ControllerKind::Grbl => Box::new(grbl::GrblProtocol),
        ControllerKind::Marlin => Box::new(marlin::MarlinProtocol),
    }
}

/// Discoverable serial device (spec §4.9 `list_ports`).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PortInfo {
    pub name: String,
    pub title: String,
}

/// Enumerate available serial devices. Requires the `serial` feature;
/// without it, returns an empty list (used in tests and non-hardware
/// builds of the daemon).
pub fn list_ports() -> Vec<PortInfo> {
    #[cfg(feature = "serial")]
    {
        serialport::available_ports()
            .map(|ports| {
                ports
                    .into_iter()
                    .map(|p| PortInfo {
                        title: p.port_name.clone(),
                        name: p.port_name,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
    #[cfg(not(feature = "serial"))]
    {
        Vec::new()
    }
}
