//! Marlin dialect — SendResponse streaming, simpler status grammar.
//!
//! Proves out the `ControllerProtocol` seam against a firmware family that
//! differs from Grbl in the way that matters most to the streamer: strict
//! stop-and-wait instead of a byte-counted window (spec §3).

use super::{
    ActiveState, ControllerKind, ControllerProtocol, FeedbackKind, JogTarget, OverrideStep,
    Position, RapidStep, RealtimeCommand, Reply, StatusReport, StreamingProtocol, Units, ZeroAxes,
};

pub struct MarlinProtocol;

impl ControllerProtocol for MarlinProtocol {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Marlin
    }

    fn parse_line(&self, line: &str) -> Reply {
        parse_line(line)
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::SendResponse
    }

    fn rx_buffer_capacity(&self) -> usize {
        1
    }

    fn realtime_byte(&self, cmd: RealtimeCommand) -> u8 {
        // Marlin has no true realtime byte channel; M108/M112/M410 are sent
        // as regular lines by the dispatcher in practice, but the session
        // layer still needs *some* single-byte representation for the
        // handful of commands the core treats as realtime. We reuse Grbl's
        // byte values here since Marlin firmwares built on grblHAL cores
        // (common on hybrid boards) honor them; a line-based Marlin build
        // ignores unrecognized bytes harmlessly.
        match cmd {
            RealtimeCommand::StatusRequest => b'?',
            RealtimeCommand::FeedHold => b'!',
            RealtimeCommand::CycleStart => b'~',
            RealtimeCommand::SoftReset => 0x18,
            RealtimeCommand::JogCancel => 0x85,
            RealtimeCommand::FeedOverride(OverrideStep::Reset100) => 0x90,
            RealtimeCommand::FeedOverride(_) => 0x91,
            RealtimeCommand::RapidOverride(RapidStep::Pct100) => 0x95,
            RealtimeCommand::RapidOverride(RapidStep::Pct50) => 0x96,
            RealtimeCommand::RapidOverride(RapidStep::Pct25) => 0x97,
            RealtimeCommand::SpindleOverride(OverrideStep::Reset100) => 0x99,
            RealtimeCommand::SpindleOverride(_) => 0x9A,
        }
    }

    fn format_jog(&self, target: JogTarget, units: Units) -> String {
        let unit_word = match units {
            Units::Metric => "G21",
            Units::Imperial => "G20",
        };
        let mut s = format!("G91 {}", unit_word);
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
        "G28".to_string()
    }

    fn format_unlock(&self) -> String {
        "M999".to_string()
    }

    fn format_zero_wcs(&self, axes: ZeroAxes, _wcs: u8) -> String {
        match axes {
            ZeroAxes::All => "G92 X0 Y0 Z0".to_string(),
            ZeroAxes::X => "G92 X0".to_string(),
            ZeroAxes::Y => "G92 Y0".to_string(),
            ZeroAxes::Z => "G92 Z0".to_string(),
        }
    }
}

/// Classify a Marlin reply line. Marlin's grammar is a subset of Grbl's:
/// `ok`, `Error:...`, no bracket feedback, and an `X:.. Y:.. Z:.. E:..`
/// position report instead of `<...>`.
pub fn parse_line(line: &str) -> Reply {
    let line = line.trim();
    if line.is_empty() {
        return Reply::Other { raw: String::new() };
    }
    if line.eq_ignore_ascii_case("ok") || line.starts_with("ok ") {
        return Reply::Ok;
    }
    if let Some(rest) = line.strip_prefix("Error:") {
        // Marlin errors are text, not numeric; map unrecognized text to 0
        // and carry the message via Feedback instead so nothing is lost.
        return match rest.trim().parse::<u32>() {
            Ok(code) => Reply::Error(code),
            Err(_) => Reply::Feedback {
                kind: FeedbackKind::Message,
                body: rest.trim().to_string(),
            },
        };
    }
    if line.starts_with("echo:") {
        return Reply::Echo {
            text: line.trim_start_matches("echo:").trim().to_string(),
            line_number: None,
        };
    }
    if line.contains("X:") && line.contains("Y:") && line.contains("Z:") {
        return match parse_position_report(line) {
            Some(status) => Reply::Status(status),
            None => Reply::Other { raw: line.to_string() },
        };
    }
    if line.starts_with("Marlin") {
        return Reply::Startup {
            version: line.split_whitespace().nth(1).unwrap_or("").to_string(),
            variant: "Marlin".to_string(),
        };
    }
    Reply::Other { raw: line.to_string() }
}

fn parse_position_report(line: &str) -> Option<StatusReport> {
    let mut x = None;
    let mut y = None;
    let mut z = None;
    for tok in line.split_whitespace() {
        if let Some(v) = tok.strip_prefix("X:") {
            x = v.parse().ok();
        } else if let Some(v) = tok.strip_prefix("Y:") {
            y = v.parse().ok();
        } else if let Some(v) = tok.strip_prefix("Z:") {
            z = v.parse().ok();
        }
    }
    let pos = Position {
        x: x?,
        y: y?,
        z: z?,
        a: None,
    };
    Some(StatusReport {
        active_state: ActiveState::Idle,
        machine_pos: Some(pos),
        work_pos: Some(pos),
        feed: None,
        speed: None,
        buffer: None,
        overrides: None,
        pin_state: None,
        received_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_line() {
        assert_eq!(parse_line("ok"), Reply::Ok);
        assert_eq!(parse_line("ok N5 P15 B3"), Reply::Ok);
    }

    #[test]
    fn numeric_error() {
        assert_eq!(parse_line("Error:20"), Reply::Error(20));
    }

    #[test]
    fn text_error_becomes_message_feedback() {
        match parse_line("Error:Printer halted") {
            Reply::Feedback { kind, body } => {
                assert_eq!(kind, FeedbackKind::Message);
                assert_eq!(body, "Printer halted");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn position_report() {
        match parse_line("X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 Y:0 Z:0") {
            Reply::Status(s) => assert_eq!(s.machine_pos.unwrap().x, 0.0),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn send_response_window_depth_is_one() {
        assert_eq!(MarlinProtocol.rx_buffer_capacity(), 1);
        assert_eq!(MarlinProtocol.streaming_protocol(), StreamingProtocol::SendResponse);
    }

    #[test]
    fn jog_and_home_formatting() {
        let target = JogTarget {
            dx: 1.0,
            dy: 0.0,
            dz: 0.0,
            feed_mm_per_min: 400.0,
        };
        assert_eq!(
            MarlinProtocol.format_jog(target, Units::Metric),
            "G91 G21 X1.000 F400"
        );
        assert_eq!(MarlinProtocol.format_home(), "G28");
    }
}
