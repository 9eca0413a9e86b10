mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::*;
use pixels_central_lib::CentralConfig;
use pixels_central_lib::core::bluetooth::{
    Central, ConnectionEvent, ConnectionEventReason, MAX_MTU, PeripheralState, Request,
    RequestState, RequestStatus,
};

type Events = Rc<RefCell<Vec<(String, bool)>>>;

fn connect_recording(central: &mut Central, timeout: Duration) -> (Request<()>, Events) {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let request = central
        .connect(&die_id(), timeout, move |peripheral, ready| {
            sink.borrow_mut().push((peripheral.name.clone(), ready));
        })
        .unwrap();
    (request, events)
}

/// Acknowledges the connect and finishes the MTU exchange with `mtu_status`
fn complete_connection(transport: &MockTransport, central: &mut Central, mtu_status: RequestStatus) {
    let handle = transport.last_handle();
    transport.emit(handle, ConnectionEvent::Connecting, ConnectionEventReason::Success);
    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    transport.complete_mtu(185, mtu_status);
    central.drain();
}

#[test]
fn die_connects_and_becomes_ready_after_mtu_exchange() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let record = central.peripheral(&die_id()).unwrap();
    assert_eq!(record.discovery().address, DIE_ADDRESS);
    assert_eq!(record.discovery().rssi, -60);

    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Connecting);
    assert_eq!(transport.state().connects[0].1, vec![pixels_service()]);

    let handle = transport.last_handle();
    transport.emit(handle, ConnectionEvent::Connecting, ConnectionEventReason::Success);
    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();

    assert_eq!(transport.state().mtu_requests[0].1, MAX_MTU);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Connecting);
    assert!(request.poll_state().is_pending());
    assert!(events.borrow().is_empty());

    transport.complete_mtu(185, RequestStatus::Success);
    central.drain();

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Ready);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), true)]);
    assert_eq!(request.poll_state(), RequestState::Succeeded(()));
    assert_eq!(central.peripheral_mtu(&die_id()).unwrap(), Some(185));
    assert_eq!(central.connected_peripherals().len(), 1);
}

#[test]
fn transient_timeouts_are_retried_silently() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);

    for _ in 0..3 {
        transport.complete_connect(RequestStatus::Timeout);
        central.drain();
        assert!(request.poll_state().is_pending());
        assert!(events.borrow().is_empty());
    }
    assert_eq!(transport.state().connect_count, 4);

    complete_connection(&transport, &mut central, RequestStatus::Success);

    assert_eq!(transport.state().connect_count, 4);
    assert_eq!(transport.handle_count(), 1);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), true)]);
    assert_eq!(request.poll_state(), RequestState::Succeeded(()));
}

#[test]
fn access_denied_is_retried_but_other_failures_are_not() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);

    transport.complete_connect(RequestStatus::AccessDenied);
    central.drain();
    assert_eq!(transport.state().connect_count, 2);

    transport.complete_connect(RequestStatus::Error);
    central.drain();
    assert_eq!(transport.state().connect_count, 2);
    assert_eq!(request.poll_state(), RequestState::Failed(RequestStatus::Error));
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
}

#[test]
fn failed_connect_ends_disconnected_and_notifies() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);

    transport.complete_connect(RequestStatus::Error);
    central.drain();

    assert_eq!(request.poll_state(), RequestState::Failed(RequestStatus::Error));
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), false)]);

    // The handle survives and a new attempt can use it
    let (retry, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);
    assert_eq!(transport.handle_count(), 1);
    assert_eq!(retry.poll_state(), RequestState::Succeeded(()));
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Ready);
}

#[test]
fn bounded_retry_policy_gives_up() {
    let config = CentralConfig {
        max_connect_retries: Some(1),
        ..Default::default()
    };
    let (transport, mut central) = central_with_die(config);
    let (request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);

    transport.complete_connect(RequestStatus::Timeout);
    central.drain();
    transport.complete_connect(RequestStatus::Timeout);
    central.drain();

    assert_eq!(transport.state().connect_count, 2);
    assert_eq!(request.poll_state(), RequestState::TimedOut);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
}

#[test]
fn connect_timeout_stops_the_retry_loop() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, Duration::from_millis(20));

    std::thread::sleep(Duration::from_millis(40));
    transport.complete_connect(RequestStatus::Timeout);
    central.drain();
    central.drain();

    assert_eq!(request.poll_state(), RequestState::TimedOut);
    assert_eq!(transport.state().connect_count, 1);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(central.peripheral(&die_id()).unwrap().handle(), None);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), false)]);
}

#[test]
fn timed_out_connect_releases_the_native_connection() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, Duration::from_millis(10));
    let handle = transport.last_handle();

    std::thread::sleep(Duration::from_millis(30));
    central.drain();
    central.drain();

    assert_eq!(request.poll_state(), RequestState::TimedOut);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(central.peripheral(&die_id()).unwrap().handle(), None);
    assert_eq!(transport.state().disconnects.len(), 1);

    // Late results of the abandoned attempt
    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();

    assert_eq!(request.poll_state(), RequestState::TimedOut);
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(transport.state().mtu_request_count, 0);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), false)]);
}

#[test]
fn mtu_not_supported_still_reaches_ready() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);

    complete_connection(&transport, &mut central, RequestStatus::NotSupported);

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Ready);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), true)]);
    assert_eq!(request.poll_state(), RequestState::Succeeded(()));
}

#[test]
fn mtu_failure_is_not_fatal() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);

    complete_connection(&transport, &mut central, RequestStatus::Error);

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Ready);
    assert_eq!(request.poll_state(), RequestState::Succeeded(()));
}

#[test]
fn mtu_is_requested_once_per_connection() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (_request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    let handle = transport.last_handle();

    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    assert_eq!(transport.state().mtu_request_count, 1);

    transport.complete_mtu(185, RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    assert_eq!(transport.state().mtu_request_count, 1);

    // A new connection negotiates again
    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    central.drain();
    let (_request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    assert_eq!(transport.state().mtu_request_count, 2);
}

#[test]
fn reconnecting_reuses_the_valid_handle() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (first, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    let (second, _) = connect_recording(&mut central, CONNECT_TIMEOUT);

    assert_eq!(transport.handle_count(), 1);
    assert_eq!(first.poll_state(), RequestState::Failed(RequestStatus::Canceled));
    assert!(second.poll_state().is_pending());
    assert_eq!(
        central.peripheral(&die_id()).unwrap().handle(),
        Some(transport.last_handle())
    );
}

#[test]
fn link_loss_notifies_and_reports_disconnected() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (_request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);
    let handle = transport.last_handle();

    transport.emit(handle, ConnectionEvent::Disconnecting, ConnectionEventReason::LinkLoss);
    central.drain();
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnecting);

    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    central.drain();

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(
        *events.borrow(),
        vec![(DIE_NAME.to_string(), true), (DIE_NAME.to_string(), false)]
    );
    assert!(central.connected_peripherals().is_empty());
    assert_eq!(central.peripheral_mtu(&die_id()).unwrap(), None);
}

#[test]
fn native_reconnect_after_link_loss_becomes_ready_again() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (_request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);
    let handle = transport.last_handle();

    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    central.drain();
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);

    transport.emit(handle, ConnectionEvent::Connecting, ConnectionEventReason::Success);
    central.drain();
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Connecting);

    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    transport.complete_mtu(185, RequestStatus::Success);
    central.drain();

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Ready);
    assert_eq!(transport.state().mtu_request_count, 2);
    assert_eq!(
        *events.borrow(),
        vec![
            (DIE_NAME.to_string(), true),
            (DIE_NAME.to_string(), false),
            (DIE_NAME.to_string(), true)
        ]
    );
}

#[test]
fn mtu_result_after_link_loss_does_not_mark_ready() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    let handle = transport.last_handle();

    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Ready, ConnectionEventReason::Success);
    central.drain();
    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    central.drain();
    transport.complete_mtu(185, RequestStatus::Success);
    central.drain();

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(request.poll_state(), RequestState::Failed(RequestStatus::Disconnected));
}

#[test]
fn disconnect_invalidates_handle_before_confirmation() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (_request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);
    let handle = transport.last_handle();

    let disconnect = central.disconnect(&die_id()).unwrap();
    assert_eq!(central.peripheral(&die_id()).unwrap().handle(), None);
    assert!(disconnect.poll_state().is_pending());

    transport.complete_disconnect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::Disconnected, ConnectionEventReason::Success);
    central.drain();

    assert_eq!(disconnect.poll_state(), RequestState::Succeeded(()));
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(events.borrow().last(), Some(&(DIE_NAME.to_string(), false)));
}

#[test]
fn disconnect_cancels_pending_connect_without_retrying() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (connect, _) = connect_recording(&mut central, CONNECT_TIMEOUT);

    let _disconnect = central.disconnect(&die_id()).unwrap();
    assert_eq!(connect.poll_state(), RequestState::Failed(RequestStatus::Canceled));

    transport.complete_connect(RequestStatus::Timeout);
    central.drain();
    assert_eq!(transport.state().connect_count, 1);
}

#[test]
fn disconnect_without_handle_fails_immediately() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let disconnect = central.disconnect(&die_id()).unwrap();

    assert_eq!(disconnect.poll_state(), RequestState::Failed(RequestStatus::InvalidHandle));
    assert!(transport.state().disconnects.is_empty());
}

#[test]
fn events_from_a_released_handle_are_ignored() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (_request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);
    let old_handle = transport.last_handle();

    let _disconnect = central.disconnect(&die_id()).unwrap();
    transport.emit(old_handle, ConnectionEvent::Disconnected, ConnectionEventReason::Success);
    central.drain();

    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    assert_eq!(transport.handle_count(), 2);
    transport.emit(old_handle, ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss);
    central.drain();

    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Connecting);
    assert!(request.poll_state().is_pending());
    assert!(events.borrow().is_empty());
}

#[test]
fn failed_to_connect_after_acknowledgement_fails_request() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, events) = connect_recording(&mut central, CONNECT_TIMEOUT);
    let handle = transport.last_handle();

    transport.complete_connect(RequestStatus::Success);
    transport.emit(handle, ConnectionEvent::FailedToConnect, ConnectionEventReason::Timeout);
    central.drain();

    assert_eq!(request.poll_state(), RequestState::Failed(RequestStatus::Disconnected));
    assert_eq!(central.peripheral_state(&die_id()).unwrap(), PeripheralState::Disconnected);
    assert_eq!(*events.borrow(), vec![(DIE_NAME.to_string(), false)]);
}

#[tokio::test]
async fn connect_request_can_be_awaited() {
    let (transport, mut central) = central_with_die(CentralConfig::default());
    let (request, _) = connect_recording(&mut central, CONNECT_TIMEOUT);
    complete_connection(&transport, &mut central, RequestStatus::Success);

    assert_eq!(request.await, Ok(()));
}
