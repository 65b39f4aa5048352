//! Grbl v1.1 dialect — the reference target (spec §4.2, §6).
//!
//! Grounded on the teacher crate's `machines::grbl::parser` /
//! `machines::grbl::state` / `machines::grbl::commands`, generalized from a
//! GRBL-HAL-status-only parser into the full classified-reply grammar the
//! spec requires (`ok`, `error:NN`, `ALARM:NN`, `<...>`, `[...]`, `$NN=VAL`,
//! startup banners, `>` echoes, and a catch-all).

use super::{
    ActiveState, AlarmCode, ControllerKind, ControllerProtocol, FeedbackKind, JogTarget,
    OverrideStep, Overrides, ParserState, PinState, Position, RapidStep, RealtimeCommand, Reply,
    StatusReport, StreamingProtocol, Units, ZeroAxes,
};

/// Grbl's RX ring buffer size in bytes (spec §3).
pub const RX_BUFFER_CAPACITY: usize = 128;

pub struct GrblProtocol;

impl ControllerProtocol for GrblProtocol {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Grbl
    }

    fn parse_line(&self, line: &str) -> Reply {
        parse_line(line)
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::CharacterCounting
    }

    fn rx_buffer_capacity(&self) -> usize {
        RX_BUFFER_CAPACITY
    }

    fn realtime_byte(&self, cmd: RealtimeCommand) -> u8 {
        match cmd {
            RealtimeCommand::StatusRequest => b'?',
            RealtimeCommand::FeedHold => b'!',
            RealtimeCommand::CycleStart => b'~',
            RealtimeCommand::SoftReset => 0x18,
            RealtimeCommand::JogCancel => 0x85,
            RealtimeCommand::FeedOverride(step) => match step {
                OverrideStep::Reset100 => 0x90,
                OverrideStep::Plus10 => 0x91,
                OverrideStep::Minus10 => 0x92,
                OverrideStep::Plus1 => 0x93,
                OverrideStep::Minus1 => 0x94,
            },
            RealtimeCommand::RapidOverride(step) => match step {
                RapidStep::Pct100 => 0x95,
                RapidStep::Pct50 => 0x96,
                RapidStep::Pct25 => 0x97,
            },
            RealtimeCommand::SpindleOverride(step) => match step {
                OverrideStep::Reset100 => 0x99,
                OverrideStep::Plus10 => 0x9A,
                OverrideStep::Minus10 => 0x9B,
                OverrideStep::Plus1 => 0x9C,
                OverrideStep::Minus1 => 0x9D,
            },
        }
    }

    fn format_jog(&self, target: JogTarget, units: Units) -> String {
        let unit_word = match units {
            Units::Metric => "G21",
            Units::Imperial => "G20",
        };
        let mut s = format!("$J=G91 {}", unit_word);
        if target.dx != 0.0 {
            s.push_str(&format!(" X{:.3}", target.dx));
        }
        if target.dy != 0.0 {
            s.push_str(&format!(" Y{:.3}", target.dy));
        }
        if target.dz != 0.0 {
            s.push_str(&format!(" Z{:.3}", target.dz));
        }
        s.push_str(&format!(" F{:.0}", target.feed_mm_per_min));
        s
    }

    fn format_home(&self) -> String {
        "$H".to_string()
    }

    fn format_unlock(&self) -> String {
        "$X".to_string()
    }

    fn format_zero_wcs(&self, axes: ZeroAxes, wcs: u8) -> String {
        let axes_str = match axes {
            ZeroAxes::All => "X0 Y0 Z0".to_string(),
            ZeroAxes::X => "X0".to_string(),
            ZeroAxes::Y => "Y0".to_string(),
            ZeroAxes::Z => "Z0".to_string(),
        };
        format!("G10 L20 P{} {}", wcs, axes_str)
    }

    fn format_settings_request(&self) -> Option<String> {
        Some("$$".to_string())
    }
}

/// Strip a trailing `*NN` checksum suffix some dialects append.
fn strip_checksum(line: &str) -> &str {
    if let Some(idx) = line.rfind('*') {
        let suffix = &line[idx + 1..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return line[..idx].trim_end();
        }
    }
    line
}

/// Classify a single protocol line. Never panics; malformed numerics
/// degrade to `Reply::Other`.
pub fn parse_line(line: &str) -> Reply {
    let line = strip_checksum(line.trim());
    if line.is_empty() {
        return Reply::Other { raw: String::new() };
    }

    if line.eq_ignore_ascii_case("ok") {
        return Reply::Ok;
    }
    if let Some(rest) = line.strip_prefix("error:") {
        return match rest.trim().parse::<u32>() {
            Ok(code) => Reply::Error(code),
            Err(_) => Reply::Other { raw: line.to_string() },
        };
    }
    if let Some(rest) = line.strip_prefix("ALARM:") {
        return match rest.trim().parse::<u32>() {
            Ok(code) => Reply::Alarm(AlarmCode::from(code)),
            Err(_) => Reply::Other { raw: line.to_string() },
        };
    }
    if line.starts_with('<') {
        return match parse_status(line) {
            Some(status) => Reply::Status(status),
            None => Reply::Other { raw: line.to_string() },
        };
    }
    if line.starts_with('[') {
        return parse_feedback(line);
    }
    if let Some(rest) = line.strip_prefix('$') {
        if let Some((num, value)) = rest.split_once('=') {
            if let Ok(index) = num.trim().parse::<u32>() {
                return Reply::Setting {
                    index,
                    value: value.trim().to_string(),
                };
            }
        }
        return Reply::Other { raw: line.to_string() };
    }
    if line.starts_with("Grbl") || line.starts_with("GrblHAL") {
        return parse_startup(line);
    }
    if let Some(rest) = line.strip_prefix('>') {
        return parse_echo(rest);
    }
    Reply::Other { raw: line.to_string() }
}

fn parse_startup(line: &str) -> Reply {
    // "Grbl 1.1h ['$' for help]" or "GrblHAL 1.1f ['$' for help]"
    let variant = if line.starts_with("GrblHAL") {
        "GrblHAL"
    } else {
        "Grbl"
    };
    let version = line
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .trim_end_matches(']')
        .to_string();
    Reply::Startup {
        version,
        variant: variant.to_string(),
    }
}

fn parse_echo(rest: &str) -> Reply {
    // "> line (ln=N)" — rest starts right after '>'.
    let rest = rest.trim();
    if let Some(idx) = rest.rfind("(ln=") {
        let text = rest[..idx].trim().to_string();
        let num_str = rest[idx + 4..].trim_end_matches(')').trim();
        let line_number = num_str.parse::<u64>().ok();
        return Reply::Echo { text, line_number };
    }
    Reply::Echo {
        text: rest.to_string(),
        line_number: None,
    }
}

fn parse_feedback(line: &str) -> Reply {
    let body = line
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(line)
        .to_string();
    let kind = if body.starts_with("GC:") {
        FeedbackKind::ParserState
    } else if body.starts_with("MSG:") {
        FeedbackKind::Message
    } else if body.starts_with("TLO:") || body.to_uppercase().contains("TOOL") {
        FeedbackKind::ToolChange
    } else {
        FeedbackKind::Unknown
    };
    Reply::Feedback { kind, body }
}

/// Parse `<State|MPos:...|WPos:...|FS:feed,spindle|...>`.
fn parse_status(line: &str) -> Option<StatusReport> {
    let s = line.strip_prefix('<')?.strip_suffix('>')?;
    let mut parts = s.split('|');
    let state_token = parts.next()?.trim();
    if state_token.is_empty() {
        return None;
    }
    let active_state = parse_active_state(state_token);

    let mut machine_pos = None;
    let mut work_pos = None;
    let mut feed = None;
    let mut speed = None;
    let mut buffer = None;
    let mut overrides = None;
    let mut pin_state = None;

    for part in parts {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("MPos:") {
            machine_pos = parse_position(v);
        } else if let Some(v) = part.strip_prefix("WPos:") {
            work_pos = parse_position(v);
        } else if let Some(v) = part.strip_prefix("FS:") {
            let nums: Vec<f64> = v.split(',').filter_map(|n| n.trim().parse().ok()).collect();
            feed = nums.first().copied();
            speed = nums.get(1).copied();
        } else if let Some(v) = part.strip_prefix("F:") {
            feed = v.trim().parse().ok();
        } else if let Some(v) = part.strip_prefix("Bf:") {
            let nums: Vec<u32> = v.split(',').filter_map(|n| n.trim().parse().ok()).collect();
            if nums.len() >= 2 {
                buffer = Some((nums[0], nums[1]));
            }
        } else if let Some(v) = part.strip_prefix("Ov:") {
            let nums: Vec<u16> = v.split(',').filter_map(|n| n.trim().parse().ok()).collect();
            if nums.len() >= 3 {
                overrides = Some(Overrides {
                    feed_percent: nums[0],
                    rapid_percent: nums[1],
                    spindle_percent: nums[2],
                });
            }
        } else if let Some(v) = part.strip_prefix("Pn:") {
            pin_state = Some(parse_pin_state(v));
        }
    }

    Some(StatusReport {
        active_state,
        machine_pos,
        work_pos,
        feed,
        speed,
        buffer,
        overrides,
        pin_state,
        received_at: None,
    })
}

fn parse_active_state(token: &str) -> ActiveState {
    let (base, rest) = match token.find(':') {
        Some(i) => (&token[..i], Some(&token[i + 1..])),
        None => (token, None),
    };
    match base {
        "Idle" => ActiveState::Idle,
        "Run" => ActiveState::Run,
        "Hold" => ActiveState::Hold(super::HoldReason::FeedHold),
        "Jog" => ActiveState::Jog,
        "Alarm" => {
            let code = rest
                .and_then(|r| r.trim().parse::<u32>().ok())
                .map(AlarmCode::from)
                .unwrap_or(AlarmCode::Unknown(0));
            ActiveState::Alarm(code)
        }
        "Door" => ActiveState::Door,
        "Check" => ActiveState::Check,
        "Home" => ActiveState::Home,
        "Sleep" => ActiveState::Sleep,
        _ => ActiveState::Unknown(token.to_string()),
    }
}

fn parse_position(s: &str) -> Option<Position> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    let x = parts[0].parse().ok()?;
    let y = parts[1].parse().ok()?;
    let z = parts[2].parse().ok()?;
    let a = parts.get(3).and_then(|v| v.parse().ok());
    Some(Position { x, y, z, a })
}

fn parse_pin_state(s: &str) -> PinState {
    let mut ps = PinState::default();
    for c in s.chars() {
        match c {
            'X' => ps.limit_x = true,
            'Y' => ps.limit_y = true,
            'Z' => ps.limit_z = true,
            'P' => ps.probe = true,
            'D' => ps.door = true,
            _ => {}
        }
    }
    ps
}

/// Parsed `$$` settings dump: setting index -> raw value string.
#[derive(Clone, Debug, Default)]
pub struct GrblSettings {
    pub raw: std::collections::HashMap<u32, String>,
}

/// Parse the lines of a `$$` response (one `$N=value` per line).
pub fn parse_settings(lines: &str) -> GrblSettings {
    let mut raw = std::collections::HashMap::new();
    for line in lines.lines() {
        if let Reply::Setting { index, value } = parse_line(line) {
            raw.insert(index, value);
        }
    }
    GrblSettings { raw }
}

/// Looks up an axis acceleration setting ($120/$121/$122) used by the jog
/// loop's `dt` floor, falling back to the spec's default of 500 mm/s^2.
pub fn axis_acceleration(settings: &GrblSettings, axis_setting: u32) -> f64 {
    settings
        .raw
        .get(&axis_setting)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(500.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::HoldReason;

    #[test]
    fn ok_line() {
        assert_eq!(parse_line("ok"), Reply::Ok);
        assert_eq!(parse_line("OK"), Reply::Ok);
    }

    #[test]
    fn error_line() {
        assert_eq!(parse_line("error:20"), Reply::Error(20));
    }

    #[test]
    fn alarm_line() {
        assert_eq!(parse_line("ALARM:1"), Reply::Alarm(AlarmCode::HardLimit));
    }

    #[test]
    fn unknown_alarm_code_is_unknown_not_error() {
        assert_eq!(parse_line("ALARM:99"), Reply::Alarm(AlarmCode::Unknown(99)));
    }

    #[test]
    fn status_line_basic() {
        let reply = parse_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>");
        match reply {
            Reply::Status(s) => {
                assert_eq!(s.active_state, ActiveState::Idle);
                assert_eq!(s.machine_pos.unwrap().x, 0.0);
                assert_eq!(s.feed, Some(0.0));
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn status_line_hold_with_overrides_and_buffer() {
        let reply = parse_line(
            "<Hold:0|MPos:1.000,2.000,0.000|WPos:1.000,2.000,0.000|Bf:15,128|FS:0,0|Ov:100,100,100>",
        );
        match reply {
            Reply::Status(s) => {
                assert!(matches!(s.active_state, ActiveState::Hold(HoldReason::FeedHold)));
                assert_eq!(s.buffer, Some((15, 128)));
                assert_eq!(
                    s.overrides,
                    Some(Overrides {
                        feed_percent: 100,
                        rapid_percent: 100,
                        spindle_percent: 100
                    })
                );
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn setting_line() {
        assert_eq!(
            parse_line("$120=500.000"),
            Reply::Setting {
                index: 120,
                value: "500.000".to_string()
            }
        );
    }

    #[test]
    fn startup_line() {
        match parse_line("Grbl 1.1h ['$' for help]") {
            Reply::Startup { version, variant } => {
                assert_eq!(variant, "Grbl");
                assert_eq!(version, "1.1h");
            }
            other => panic!("expected Startup, got {:?}", other),
        }
    }

    #[test]
    fn echo_line() {
        match parse_line("> G0 X10 (ln=42)") {
            Reply::Echo { text, line_number } => {
                assert_eq!(text, "G0 X10");
                assert_eq!(line_number, Some(42));
            }
            other => panic!("expected Echo, got {:?}", other),
        }
    }

    #[test]
    fn feedback_parser_state() {
        match parse_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]") {
            Reply::Feedback { kind, .. } => assert_eq!(kind, FeedbackKind::ParserState),
            other => panic!("expected Feedback, got {:?}", other),
        }
    }

    #[test]
    fn unknown_bracket_is_feedback_unknown() {
        match parse_line("[XY:something]") {
            Reply::Feedback { kind, .. } => assert_eq!(kind, FeedbackKind::Unknown),
            other => panic!("expected Feedback, got {:?}", other),
        }
    }

    #[test]
    fn malformed_numerics_degrade_to_other_never_panic() {
        assert_eq!(
            parse_line("error:notanumber"),
            Reply::Other {
                raw: "error:notanumber".to_string()
            }
        );
        assert!(matches!(parse_line("<garbage"), Reply::Other { .. }));
    }

    #[test]
    fn empty_line_yields_empty_other() {
        assert_eq!(parse_line(""), Reply::Other { raw: String::new() });
        assert_eq!(parse_line("   "), Reply::Other { raw: String::new() });
    }

    #[test]
    fn checksum_suffix_stripped_before_classification() {
        assert_eq!(parse_line("ok*1F"), Reply::Ok);
    }

    #[test]
    fn other_catch_all() {
        assert_eq!(
            parse_line("some garbage"),
            Reply::Other {
                raw: "some garbage".to_string()
            }
        );
    }

    #[test]
    fn jog_format_omits_zero_axes() {
        let target = JogTarget {
            dx: 8.944,
            dy: 0.0,
            dz: 0.0,
            feed_mm_per_min: 3000.0,
        };
        assert_eq!(
            GrblProtocol.format_jog(target, Units::Metric),
            "$J=G91 G21 X8.944 F3000"
        );
    }

    #[test]
    fn jog_format_imperial_units_word() {
        let target = JogTarget {
            dx: 1.0,
            dy: 2.0,
            dz: 0.0,
            feed_mm_per_min: 500.0,
        };
        assert_eq!(
            GrblProtocol.format_jog(target, Units::Imperial),
            "$J=G91 G20 X1.000 Y2.000 F500"
        );
    }

    #[test]
    fn realtime_bytes_match_spec() {
        assert_eq!(GrblProtocol.realtime_byte(RealtimeCommand::SoftReset), 0x18);
        assert_eq!(GrblProtocol.realtime_byte(RealtimeCommand::JogCancel), 0x85);
        assert_eq!(
            GrblProtocol.realtime_byte(RealtimeCommand::FeedOverride(OverrideStep::Reset100)),
            0x90
        );
        assert_eq!(
            GrblProtocol.realtime_byte(RealtimeCommand::SpindleOverride(OverrideStep::Minus1)),
            0x9D
        );
        assert_eq!(
            GrblProtocol.realtime_byte(RealtimeCommand::RapidOverride(RapidStep::Pct25)),
            0x97
        );
    }

    #[test]
    fn zero_wcs_formats() {
        assert_eq!(
            GrblProtocol.format_zero_wcs(ZeroAxes::All, 1),
            "G10 L20 P1 X0 Y0 Z0"
        );
        assert_eq!(GrblProtocol.format_zero_wcs(ZeroAxes::X, 1), "G10 L20 P1 X0");
    }

    #[test]
    fn settings_parse_and_lookup_with_fallback() {
        let settings = parse_settings("$120=750.000\n$121=500.000\nok\n");
        assert_eq!(axis_acceleration(&settings, 120), 750.0);
        assert_eq!(axis_acceleration(&settings, 122), 500.0); // not present -> fallback
    }
}
