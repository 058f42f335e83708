//! LED controller client against the simulated firmware
//!
//! These tests drive `LedSyncClient` over the same in-memory link the `simulate`
//! command uses, covering the host-driven and autonomous exchanges end to end.

use phase_daq::core::{LedCommand, LedType, Telemetry};
use phase_daq::error::DaqError;
use phase_daq::hardware::serial::SerialConnector;
use phase_daq::hardware::simulated_controller::{SimulatedController, SimulatorSettings};
use phase_daq::protocol::client::{LedSyncClient, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_TELEMETRY_POLL};
use phase_daq::protocol::codec::FrameContext;
use std::time::Duration;

async fn connect(controller: &SimulatedController) -> LedSyncClient {
    let port = controller.connect().await.unwrap();
    LedSyncClient::new(port).with_response_timeout(Duration::from_millis(500))
}

// =============================================================================
// Host-driven exchanges
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_host_driven_pulse_reports_environment() {
    let controller = SimulatedController::new(SimulatorSettings {
        temperature_celsius: 24.5,
        humidity_percent: 41.0,
        ..SimulatorSettings::default()
    });
    let illumination = controller.illumination();
    let mut client = connect(&controller).await;

    assert!(!client.ping(DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap());

    client.select_led_type(LedType::White).await.unwrap();
    client.set_led_power(70, LedType::White).await.unwrap();
    client.set_timing(150, 20).await.unwrap();

    let pulse = client.begin_sync_pulse(false).await.unwrap();
    assert_eq!(*illumination.borrow(), LedCommand::white(70, 0));

    let sync = client
        .wait_sync_complete(pulse, Duration::from_millis(150) + client.response_timeout())
        .await
        .unwrap();
    assert!(sync.success);
    assert_eq!(sync.stabilization_ms, 150);
    assert_eq!(sync.temperature_celsius, Some(24.5));
    assert_eq!(sync.humidity_percent, Some(41.0));
}

#[tokio::test(start_paused = true)]
async fn test_dual_pulse_lights_both_channels() {
    let controller = SimulatedController::default();
    let illumination = controller.illumination();
    let mut client = connect(&controller).await;

    client.select_led_type(LedType::Dual).await.unwrap();
    client.set_led_power(80, LedType::Ir).await.unwrap();
    client.set_led_power(40, LedType::White).await.unwrap();

    let pulse = client.begin_sync_pulse(true).await.unwrap();
    assert!(pulse.dual);
    assert_eq!(*illumination.borrow(), LedCommand::dual(80, 40, 0));

    let sync = client
        .wait_sync_complete(pulse, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(sync.success);

    client.select_led_type(LedType::Off).await.unwrap();
    assert_eq!(illumination.borrow().led_type, LedType::Off);
}

#[tokio::test(start_paused = true)]
async fn test_missing_sync_complete_is_unsuccessful_not_an_error() {
    let controller = SimulatedController::new(SimulatorSettings {
        drop_sync_complete: true,
        ..SimulatorSettings::default()
    });
    let mut client = connect(&controller).await;

    client.select_led_type(LedType::Ir).await.unwrap();
    let pulse = client.begin_sync_pulse(false).await.unwrap();
    let sync = client
        .wait_sync_complete(pulse, Duration::from_millis(300))
        .await
        .unwrap();

    assert!(!sync.success);
    assert_eq!(sync.temperature_celsius, None);

    // The link stays usable for the next frame
    client.select_led_type(LedType::Ir).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fault_reply_is_a_protocol_error() {
    let controller = SimulatedController::new(SimulatorSettings {
        fault_on: Some(0x20),
        ..SimulatorSettings::default()
    });
    let mut client = connect(&controller).await;

    let err = client.select_led_type(LedType::Ir).await.unwrap_err();
    assert!(matches!(err, DaqError::Protocol(_)));
    assert!(!err.is_fatal());
}

// =============================================================================
// Autonomous timelapse
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timelapse_streams_one_telemetry_frame_per_interval() {
    let controller = SimulatedController::new(SimulatorSettings {
        temperature_celsius: 21.6,
        humidity_percent: 48.2,
        ..SimulatorSettings::default()
    });
    let mut client = connect(&controller).await;

    client
        .start_timelapse(1000, 20, DEFAULT_HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(client.frame_context(), FrameContext::Telemetry);

    let expected = Telemetry {
        temperature_celsius: 22,
        humidity_percent: 48,
    };
    for _ in 0..3 {
        let telemetry = client
            .read_telemetry(Duration::from_millis(1500), DEFAULT_TELEMETRY_POLL)
            .await
            .unwrap();
        assert_eq!(telemetry, Some(expected));
    }

    client.stop_timelapse().await.unwrap();
    assert_eq!(client.frame_context(), FrameContext::Command);

    let quiet = client
        .read_telemetry(Duration::from_millis(2500), DEFAULT_TELEMETRY_POLL)
        .await
        .unwrap();
    assert_eq!(quiet, None);
}

#[tokio::test(start_paused = true)]
async fn test_led_commands_during_timelapse_queue_telemetry() {
    let controller = SimulatedController::default();
    let illumination = controller.illumination();
    let mut client = connect(&controller).await;

    client
        .start_timelapse(200, 10, DEFAULT_HANDSHAKE_TIMEOUT)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    // Telemetry already on the wire is consumed while waiting for these replies
    client.select_led_type(LedType::White).await.unwrap();
    client.set_led_power(30, LedType::White).await.unwrap();
    assert_eq!(*illumination.borrow(), LedCommand::white(30, 0));

    let telemetry = client
        .read_telemetry(Duration::ZERO, DEFAULT_TELEMETRY_POLL)
        .await
        .unwrap();
    assert!(telemetry.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_silent_controller_fails_the_handshake() {
    let controller = SimulatedController::new(SimulatorSettings {
        silent_handshake: true,
        ..SimulatorSettings::default()
    });
    let mut client = connect(&controller).await;

    let err = client
        .start_timelapse(1000, 10, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaqError::HandshakeTimeout {
            expected: "TIMELAPSE_ACK",
            ..
        }
    ));
    assert!(err.is_fatal());

    let err = client.ping(Duration::from_millis(300)).await.unwrap_err();
    assert!(matches!(err, DaqError::HandshakeTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_is_a_transport_error() {
    let controller = SimulatedController::new(SimulatorSettings {
        disconnect_after: Some(1),
        ..SimulatorSettings::default()
    });
    let mut client = connect(&controller).await;

    client.select_led_type(LedType::Ir).await.unwrap();
    let err = client.select_led_type(LedType::Ir).await.unwrap_err();
    assert!(err.is_transport());

    // A fresh connection behaves normally again
    client.replace_port(controller.connect().await.unwrap());
    client.select_led_type(LedType::Ir).await.unwrap();
    assert_eq!(controller.connection_count(), 2);
}
