//! End-to-end scenarios against an in-process session, driven entirely
//! through `SerialLink`'s in-memory test double (no real hardware). Only
//! compiled with the `serial` feature off: `cargo test --no-default-features`.

#![cfg(not(feature = "serial"))]

use cnc_core::config::Config;
use cnc_core::controllers::ControllerKind;
use cnc_core::hub::SessionHub;
use cnc_core::session::dispatcher::Verb;
use cnc_core::session::event_trigger::{TriggerKind, TriggerRule};
use cnc_core::session::jog::JogSample;
use cnc_core::session::status::MachineStatus;
use cnc_core::session::workflow::WorkflowState;
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn s1_short_job_runs_to_completion() {
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS1", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    session.load_job("s1", "G21\nG0 X10\nG0 X0\n").await.unwrap();
    session.start_job().await;
    assert_eq!(session.written_lines().await, vec!["G21", "G0 X10", "G0 X0"]);

    session.push_incoming_line("<Run|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    session.push_incoming_line("ok").await;
    session.push_incoming_line("ok").await;
    session.push_incoming_line("ok").await;
    session.push_incoming_line("<Idle|MPos:10.000,0.000,0.000|WPos:10.000,0.000,0.000|FS:0,0>").await;
    settle().await;

    // Nothing else was ever written: the job ran to completion on its own,
    // no Stop was issued.
    assert_eq!(session.written_lines().await, vec!["G21", "G0 X10", "G0 X0"]);
    let status = hub.get_status("/dev/ttyS1").await.unwrap();
    assert_eq!(status.workflow_state, Some(WorkflowState::Idle));
    assert!(!status.job_running);
}

#[tokio::test]
async fn s2_error_mid_job_halts_dispatch() {
    // Marlin's stop-and-wait streaming (one outstanding line) makes the
    // halt-on-error edge directly observable: the third line is never
    // written once the second one errors.
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS2", ControllerKind::Marlin, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    session.load_job("s2", "G0 X0\nG99 bad\nG0 X1\n").await.unwrap();
    session.start_job().await;
    settle().await;
    assert_eq!(session.written_lines().await, vec!["G0 X0"]);

    session.push_incoming_line("ok").await;
    settle().await;
    assert_eq!(session.written_lines().await, vec!["G0 X0", "G99 bad"]);

    session.push_incoming_line("Error:20").await;
    settle().await;

    // Held: the third line never goes out.
    assert_eq!(session.written_lines().await, vec!["G0 X0", "G99 bad"]);
}

#[tokio::test]
async fn s3_jog_press_and_release() {
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS3", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    // Full deflection at the default dead zone/sensitivity/feed settings
    // maps straight through to the configured max X feed (3000mm/min); the
    // incremental distance is whatever the planner-lookahead dt formula
    // yields at that feed and the default `planner_blocks=15` (179ms, so
    // 3000mm/min * 179ms = 8.95mm).
    session.jog_input(JogSample { x: 1.0, y: 0.0, z: 0.0 }).await;
    settle().await;
    let written = session.written_lines().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], "$J=G91 G21 X8.950 F3000");

    session.push_incoming_line("ok").await;
    settle().await;

    // Stick released: cancel byte, fence line, and a watchdog that the
    // fence's own ack should beat.
    session.jog_input(JogSample::default()).await;
    settle().await;
    assert_eq!(session.written_realtime_bytes().await, vec![0x85]);
    assert_eq!(session.written_lines().await.last().unwrap(), "G4 P0");

    session.push_incoming_line("ok").await;
    settle().await;

    // No further writes once the fence clears.
    assert_eq!(session.written_lines().await.len(), 2);
}

#[tokio::test]
async fn s4_alarm_mid_job_surfaces_and_stops() {
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS4", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    session.push_incoming_line("<Home|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    session.push_incoming_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    settle().await;
    assert!(hub.get_status("/dev/ttyS4").await.unwrap().homed);

    session.load_job("s4", "G0 X0\nG0 X1\nG0 X2\n").await.unwrap();
    session.start_job().await;
    settle().await;
    let before = session.written_lines().await;
    assert_eq!(before.len(), 3);

    session.push_incoming_line("<Run|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    session.push_incoming_line("ok").await;
    session.push_incoming_line("ALARM:1").await;
    settle().await;

    // Rewind doesn't write anything new to the wire.
    assert_eq!(session.written_lines().await, before);
    let status = hub.get_status("/dev/ttyS4").await.unwrap();
    assert_eq!(status.machine_status, MachineStatus::Alarm);
    assert_eq!(status.workflow_state, Some(WorkflowState::Idle));
    assert!(!status.homed);
}

#[tokio::test]
async fn s5_mdi_rejected_while_running_then_accepted_once_paused() {
    use cnc_core::error::CoreError;

    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS5", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    session.load_job("s5", "G0 X0\nG0 X1\n").await.unwrap();
    session.start_job().await;
    settle().await;
    assert_eq!(session.written_lines().await, vec!["G0 X0", "G0 X1"]);

    // A non-realtime write during Running is rejected outright (spec §4.9),
    // never parked for later.
    assert_eq!(session.feed_mdi("M7").await, Err(CoreError::SessionBusy));
    settle().await;
    assert_eq!(session.written_lines().await, vec!["G0 X0", "G0 X1"]);

    // Drain both job lines' acks, then pause: the session is no longer
    // Running, so MDI writes are accepted again.
    session.push_incoming_line("ok").await;
    session.push_incoming_line("ok").await;
    settle().await;
    session.dispatch(Verb::FeedHold).await.unwrap();
    settle().await;

    session.feed_mdi("M7").await.unwrap();
    settle().await;
    assert_eq!(session.written_lines().await, vec!["G0 X0", "G0 X1", "M7"]);

    session.push_incoming_line("ok").await;
    settle().await;

    session.feed_mdi("M8").await.unwrap();
    settle().await;
    assert_eq!(
        session.written_lines().await,
        vec!["G0 X0", "G0 X1", "M7", "M8"]
    );

    session.push_incoming_line("ok").await;
    settle().await;
}

#[tokio::test]
async fn tool_change_feedback_fires_configured_gcode_rule() {
    // A "[Tool:3]" feedback line from the firmware should fire the
    // `tool:change` rule, feeding its configured G-code through the MDI
    // queue just like job:start/job:end already do.
    let mut config = Config::default();
    config.trigger_rules.push(TriggerRule {
        event: "tool:change".into(),
        kind: TriggerKind::Gcode,
        body: "M0".into(),
    });
    let hub = SessionHub::new(&config);
    let handle = hub
        .open_session("/dev/ttyS7", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    session.push_incoming_line("[Tool:3]").await;
    settle().await;

    assert_eq!(session.written_lines().await, vec!["M0"]);
}

#[tokio::test]
async fn unexpected_ack_marks_session_unhealthy() {
    // An `ok` with nothing outstanding is a protocol desync (spec.md §7):
    // surfaced as `healthy: false` on the status snapshot rather than a
    // crash, per Open Question #3.
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS8", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    assert!(hub.get_status("/dev/ttyS8").await.unwrap().healthy);
    session.push_incoming_line("ok").await;
    settle().await;

    assert!(!hub.get_status("/dev/ttyS8").await.unwrap().healthy);
}

#[tokio::test]
async fn s6_reconnect_preserves_machine_status() {
    // "Reconnect" here is a net client dropping and a new one subscribing —
    // the underlying session and its serial link are untouched (SessionHub
    // keeps the session alive regardless of which clients are bound to it).
    let hub = SessionHub::new(&Config::default());
    let handle = hub
        .open_session("/dev/ttyS6", ControllerKind::Grbl, 115_200)
        .await
        .unwrap();
    let session = hub.session(handle).await.unwrap();

    const CLIENT_A: u64 = 1;
    const CLIENT_B: u64 = 2;
    hub.bind_client(handle, CLIENT_A).await;

    session.push_incoming_line("<Home|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    session.push_incoming_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000|FS:0,0>").await;
    settle().await;

    let status = hub.get_status("/dev/ttyS6").await.unwrap();
    assert_eq!(status.machine_status, MachineStatus::ReadyHomed);
    assert!(status.homed);

    // Client A disconnects; the session persists untouched.
    hub.drop_client(CLIENT_A).await;
    assert!(hub.bound_clients(handle).await.is_empty());

    // Client B subscribes to the same still-open port.
    let handle_b = hub.handle_for_port("/dev/ttyS6").await.unwrap();
    assert_eq!(handle, handle_b);
    hub.bind_client(handle_b, CLIENT_B).await;

    let status = hub.get_status("/dev/ttyS6").await.unwrap();
    assert_eq!(status.machine_status, MachineStatus::ReadyHomed);
    assert!(status.homed);
    assert_eq!(hub.bound_clients(handle_b).await, vec![CLIENT_B]);
}
