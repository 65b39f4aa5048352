//! Manual jog control (spec §4.7): turns continuous analog/stick input into
//! a stream of incremental `$J=`-style moves, with a window-bounded
//! outstanding count and a timed cancel fence so the firmware never keeps
//! moving after the operator lets go of the stick.
//!
//! The input-mapping math (dead zone, sensitivity curve, feed-from-magnitude,
//! incremental distance) is pure and side-effect free; the state machine
//! below follows the same tagged-effect idiom as [`crate::session::workflow`].

use std::time::Duration;

/// Raw normalized input sample, one axis component per field, each in
/// `-1.0..=1.0`. Produced by whatever input device the client is driving
/// (jog wheel, game controller, on-screen buttons).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JogSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl JogSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Named speed presets (spec §9 Open Question #2): each scales
/// `sensitivity`, never `max_feed_*`, so a preset can never push the jog
/// feed past the configured safety ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JogPreset {
    Slow,
    Medium,
    Fast,
}

impl JogPreset {
    pub fn sensitivity_scale(&self) -> f64 {
        match self {
            JogPreset::Slow => 0.4,
            JogPreset::Medium => 1.0,
            JogPreset::Fast => 1.8,
        }
    }
}

/// Tunables for the input mapping, sourced from session configuration and,
/// for acceleration, the firmware's own `$120`-`$122` settings (exposed to
/// this module by the Runner when it observes a `Setting` reply).
#[derive(Clone, Debug)]
pub struct JogLoopConfig {
    pub dead_zone: f64,
    pub sensitivity: f64,
    pub invert_x: bool,
    pub invert_y: bool,
    pub invert_z: bool,
    pub max_feed_x_mm_min: f64,
    pub max_feed_y_mm_min: f64,
    pub max_feed_z_mm_min: f64,
    pub accel_x_mm_s2: f64,
    pub accel_y_mm_s2: f64,
    pub accel_z_mm_s2: f64,
    /// Outstanding unacknowledged jog lines allowed in flight (spec caps
    /// this at 4).
    pub window_depth: usize,
    /// Firmware planner look-ahead depth (`N`, spec default 15) — distinct
    /// from `window_depth`: this is how many queued blocks the firmware's
    /// own motion planner can decelerate across, used by the `dt >=
    /// v^2/(2*a*(N-1))` floor, not how many lines the session keeps
    /// outstanding on the wire.
    pub planner_blocks: u32,
}

impl Default for JogLoopConfig {
    fn default() -> Self {
        JogLoopConfig {
            dead_zone: 0.08,
            sensitivity: 1.0,
            invert_x: false,
            invert_y: false,
            invert_z: false,
            max_feed_x_mm_min: 3000.0,
            max_feed_y_mm_min: 3000.0,
            max_feed_z_mm_min: 1000.0,
            accel_x_mm_s2: 500.0,
            accel_y_mm_s2: 500.0,
            accel_z_mm_s2: 500.0,
            window_depth: 4,
            planner_blocks: 15,
        }
    }
}

/// One mapped jog segment ready to hand to a `ControllerProtocol::format_jog`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JogSegment {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub feed_mm_per_min: f64,
}

fn apply_dead_zone(v: f64, dead_zone: f64) -> f64 {
    if v.abs() < dead_zone {
        0.0
    } else {
        // Rescale so the usable range starts at 0 just past the dead zone,
        // instead of jumping straight from 0 to dead_zone's output.
        let sign = v.signum();
        sign * (v.abs() - dead_zone) / (1.0 - dead_zone)
    }
}

/// Power-curve sensitivity mapping (spec §4.7): `sign(x) *
/// clamp(|x|,0,1)^(1/sensitivity)`, applied past the dead zone. Linear only
/// when `sensitivity == 1`; `sensitivity > 1` softens small deflections,
/// `sensitivity < 1` sharpens them.
fn apply_axis(raw: f64, dead_zone: f64, sensitivity: f64, invert: bool) -> f64 {
    let dz = apply_dead_zone(raw, dead_zone);
    let magnitude = dz.abs().clamp(0.0, 1.0);
    let curved = if magnitude == 0.0 { 0.0 } else { magnitude.powf(1.0 / sensitivity) };
    let mapped = dz.signum() * curved;
    if invert {
        -mapped
    } else {
        mapped
    }
    .clamp(-1.0, 1.0)
}

/// Map one raw sample into a dispatchable segment, or `None` if every axis
/// falls within the dead zone (the "stick released" case).
pub fn map_input(sample: JogSample, config: &JogLoopConfig) -> Option<JogSegment> {
    let x = apply_axis(sample.x, config.dead_zone, config.sensitivity, config.invert_x);
    let y = apply_axis(sample.y, config.dead_zone, config.sensitivity, config.invert_y);
    let z = apply_axis(sample.z, config.dead_zone, config.sensitivity, config.invert_z);

    if x == 0.0 && y == 0.0 && z == 0.0 {
        return None;
    }

    let feed = (x.abs() * config.max_feed_x_mm_min)
        .max(y.abs() * config.max_feed_y_mm_min)
        .max(z.abs() * config.max_feed_z_mm_min)
        .max(1.0);

    let dt_ms = incremental_dt_ms(feed, dominant_accel(x, y, z, config), config.planner_blocks);
    let dt_min = dt_ms as f64 / 60_000.0;

    Some(JogSegment {
        dx: x * feed * dt_min,
        dy: y * feed * dt_min,
        dz: z * feed * dt_min,
        feed_mm_per_min: feed,
    })
}

fn dominant_accel(x: f64, y: f64, z: f64, config: &JogLoopConfig) -> f64 {
    let mut accel = config.accel_x_mm_s2;
    let mut max_weight = x.abs();
    if y.abs() > max_weight {
        accel = config.accel_y_mm_s2;
        max_weight = y.abs();
    }
    if z.abs() > max_weight {
        accel = config.accel_z_mm_s2;
    }
    accel.max(1.0)
}

/// `dt >= 25ms` and `dt >= v^2 / (2*a*(N-1))` (spec §4.7), where `N` is the
/// firmware's planner look-ahead depth (`planner_blocks`, default 15) — the
/// segment must be long enough in time that the firmware's own motion
/// planner can still decelerate to a stop across its queued blocks without
/// an abrupt halt. Distinct from the session's outstanding-write window
/// depth, which bounds how many jog lines this session keeps unacknowledged
/// on the wire, not how deep the firmware's planner look-ahead is.
pub fn incremental_dt_ms(feed_mm_per_min: f64, accel_mm_s2: f64, planner_blocks: u32) -> u64 {
    let v_mm_s = feed_mm_per_min / 60.0;
    let n_minus_1 = (planner_blocks.max(2) - 1) as f64;
    let decel_floor_s = (v_mm_s * v_mm_s) / (2.0 * accel_mm_s2 * n_minus_1);
    let dt_s = decel_floor_s.max(0.025);
    (dt_s * 1000.0).ceil() as u64
}

pub const CANCEL_FENCE_LINE: &str = "G4 P0";
pub const CANCEL_WATCHDOG: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JogState {
    Idle,
    Jogging,
    Cancelling,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Effect {
    SendJog(JogSegment),
    SendJogCancelByte,
    SendFenceLine,
    StartCancelWatchdog,
    CancelWatchdog,
    SoftReset,
    SurfaceJogCancelTimeout,
}

/// The jog state machine: `Idle -> Jogging -> Cancelling -> Idle`.
pub struct JogLoop {
    state: JogState,
    config: JogLoopConfig,
    outstanding: usize,
    fence_pending: bool,
}

impl JogLoop {
    pub fn new(config: JogLoopConfig) -> Self {
        JogLoop {
            state: JogState::Idle,
            config,
            outstanding: 0,
            fence_pending: false,
        }
    }

    pub fn state(&self) -> JogState {
        self.state
    }

    pub fn config(&self) -> &JogLoopConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: JogLoopConfig) {
        self.config = config;
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Feed one raw input sample. Only effective in `Idle`/`Jogging`; a
    /// sample arriving mid-cancel is dropped (the operator must wait for
    /// the fence to clear before jogging again).
    pub fn on_input(&mut self, sample: JogSample) -> Vec<Effect> {
        if self.state == JogState::Cancelling {
            return vec![];
        }

        match map_input(sample, &self.config) {
            Some(segment) => {
                if self.outstanding >= self.config.window_depth {
                    return vec![];
                }
                self.state = JogState::Jogging;
                self.outstanding += 1;
                vec![Effect::SendJog(segment)]
            }
            None => {
                if self.state == JogState::Jogging {
                    self.begin_cancel()
                } else {
                    vec![]
                }
            }
        }
    }

    /// Explicit stop request (client released the control, or the
    /// Dispatcher's jogCancel verb fired directly).
    pub fn stop(&mut self) -> Vec<Effect> {
        if self.state == JogState::Jogging {
            self.begin_cancel()
        } else {
            vec![]
        }
    }

    fn begin_cancel(&mut self) -> Vec<Effect> {
        self.state = JogState::Cancelling;
        self.fence_pending = true;
        vec![
            Effect::SendJogCancelByte,
            Effect::SendFenceLine,
            Effect::StartCancelWatchdog,
        ]
    }

    /// A terminal reply (ok/error) arrived for an in-flight write. The
    /// caller tells us whether it belongs to the cancel fence line or to an
    /// ordinary jog segment — `ControllerSession` tracks which line is
    /// oldest in the outstanding window.
    pub fn on_ack(&mut self, is_fence: bool) -> Vec<Effect> {
        if is_fence {
            if self.state != JogState::Cancelling || !self.fence_pending {
                return vec![];
            }
            self.fence_pending = false;
            self.state = JogState::Idle;
            self.outstanding = 0;
            vec![Effect::CancelWatchdog]
        } else {
            self.outstanding = self.outstanding.saturating_sub(1);
            vec![]
        }
    }

    /// The 500ms cancel watchdog fired without seeing the fence's ack.
    pub fn on_cancel_timeout(&mut self) -> Vec<Effect> {
        if self.state != JogState::Cancelling {
            return vec![];
        }
        self.state = JogState::Idle;
        self.outstanding = 0;
        self.fence_pending = false;
        vec![Effect::SoftReset, Effect::SurfaceJogCancelTimeout]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> JogLoopConfig {
        JogLoopConfig::default()
    }

    #[test]
    fn dead_zone_suppresses_small_input() {
        let sample = JogSample { x: 0.05, y: 0.0, z: 0.0 };
        assert_eq!(map_input(sample, &cfg()), None);
    }

    #[test]
    fn beyond_dead_zone_produces_segment() {
        let sample = JogSample { x: 0.5, y: 0.0, z: 0.0 };
        let seg = map_input(sample, &cfg()).unwrap();
        assert!(seg.dx > 0.0);
        assert_eq!(seg.dy, 0.0);
        assert!(seg.feed_mm_per_min > 0.0);
    }

    #[test]
    fn inversion_flips_sign() {
        let mut config = cfg();
        config.invert_x = true;
        let sample = JogSample { x: 0.5, y: 0.0, z: 0.0 };
        let seg = map_input(sample, &config).unwrap();
        assert!(seg.dx < 0.0);
    }

    #[test]
    fn incremental_dt_has_25ms_floor() {
        let dt = incremental_dt_ms(10.0, 10_000.0, 15);
        assert_eq!(dt, 25);
    }

    #[test]
    fn incremental_dt_grows_with_feed_and_shrinks_with_accel() {
        let fast = incremental_dt_ms(3000.0, 200.0, 15);
        let slow_accel_floor = incremental_dt_ms(10.0, 10_000.0, 15);
        assert!(fast > slow_accel_floor);
    }

    #[test]
    fn s3_press_phase_matches_spec_example() {
        // spec §4.7's literal example: v=3000mm/min, a=500mm/s^2,
        // N=planner_blocks=15 -> dx ~= 8.9mm for the press phase.
        let dt_ms = incremental_dt_ms(3000.0, 500.0, 15);
        let dt_min = dt_ms as f64 / 60_000.0;
        let dx = 3000.0 * dt_min;
        assert!((dx - 8.9).abs() < 0.1, "dx was {dx}");
    }

    #[test]
    fn sensitivity_is_a_power_curve_not_linear() {
        let mut config = cfg();
        config.dead_zone = 0.0;
        config.sensitivity = 2.0;

        let seg = map_input(JogSample { x: 0.25, y: 0.0, z: 0.0 }, &config).unwrap();
        assert!((seg.dx.signum() - 1.0).abs() < 1e-9);
        // Recover the mapped axis value from the segment: dx = x * feed * dt,
        // feed is driven by x alone here, so dx/feed/dt_min reproduces x.
        let feed = seg.feed_mm_per_min;
        let dt_ms = incremental_dt_ms(feed, config.accel_x_mm_s2, config.planner_blocks);
        let dt_min = dt_ms as f64 / 60_000.0;
        let mapped_x = seg.dx / (feed * dt_min);
        assert!((mapped_x - 0.5).abs() < 1e-6, "mapped_x was {mapped_x}");

        let seg2 = map_input(JogSample { x: 0.81, y: 0.0, z: 0.0 }, &config).unwrap();
        let feed2 = seg2.feed_mm_per_min;
        let dt_ms2 = incremental_dt_ms(feed2, config.accel_x_mm_s2, config.planner_blocks);
        let dt_min2 = dt_ms2 as f64 / 60_000.0;
        let mapped_x2 = seg2.dx / (feed2 * dt_min2);
        assert!((mapped_x2 - 0.9).abs() < 1e-6, "mapped_x2 was {mapped_x2}");
    }

    #[test]
    fn preset_scales_sensitivity_not_ceiling() {
        assert!((JogPreset::Slow.sensitivity_scale() - 0.4).abs() < 1e-9);
        assert!((JogPreset::Medium.sensitivity_scale() - 1.0).abs() < 1e-9);
        assert!((JogPreset::Fast.sensitivity_scale() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn input_then_release_triggers_cancel_sequence() {
        let mut jog = JogLoop::new(cfg());
        let effects = jog.on_input(JogSample { x: 0.6, y: 0.0, z: 0.0 });
        assert_eq!(jog.state(), JogState::Jogging);
        assert!(matches!(effects[0], Effect::SendJog(_)));

        let release = jog.on_input(JogSample::default());
        assert_eq!(jog.state(), JogState::Cancelling);
        assert_eq!(
            release,
            vec![Effect::SendJogCancelByte, Effect::SendFenceLine, Effect::StartCancelWatchdog]
        );
    }

    #[test]
    fn fence_ack_returns_to_idle_and_cancels_watchdog() {
        let mut jog = JogLoop::new(cfg());
        jog.on_input(JogSample { x: 0.6, y: 0.0, z: 0.0 });
        jog.on_input(JogSample::default());
        assert_eq!(jog.state(), JogState::Cancelling);

        let effects = jog.on_ack(true);
        assert_eq!(jog.state(), JogState::Idle);
        assert_eq!(effects, vec![Effect::CancelWatchdog]);
        assert_eq!(jog.outstanding(), 0);
    }

    #[test]
    fn cancel_timeout_forces_idle_and_soft_resets() {
        let mut jog = JogLoop::new(cfg());
        jog.on_input(JogSample { x: 0.6, y: 0.0, z: 0.0 });
        jog.on_input(JogSample::default());
        let effects = jog.on_cancel_timeout();
        assert_eq!(jog.state(), JogState::Idle);
        assert_eq!(effects, vec![Effect::SoftReset, Effect::SurfaceJogCancelTimeout]);
    }

    #[test]
    fn window_depth_caps_outstanding_jog_sends() {
        let mut config = cfg();
        config.window_depth = 2;
        let mut jog = JogLoop::new(config);
        assert!(!jog.on_input(JogSample { x: 0.9, y: 0.0, z: 0.0 }).is_empty());
        assert!(!jog.on_input(JogSample { x: 0.9, y: 0.0, z: 0.0 }).is_empty());
        assert!(jog.on_input(JogSample { x: 0.9, y: 0.0, z: 0.0 }).is_empty()); // window full
        assert_eq!(jog.outstanding(), 2);
    }

    #[test]
    fn input_during_cancel_is_dropped() {
        let mut jog = JogLoop::new(cfg());
        jog.on_input(JogSample { x: 0.6, y: 0.0, z: 0.0 });
        jog.on_input(JogSample::default());
        assert_eq!(jog.state(), JogState::Cancelling);
        assert!(jog.on_input(JogSample { x: 0.6, y: 0.0, z: 0.0 }).is_empty());
    }
}
