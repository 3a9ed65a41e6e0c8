//! Scan sessions over the loopback radio

use std::sync::Arc;
use std::time::Duration;

use emob_ble::{BleScope, LoopbackRadio, Scanner};
use emob_core::protocol::{ServiceDefinition, EMOB_SERVICE_UUID};
use emob_core::transport::Peripheral;
use emob_core::{EmobConfig, EmobError, ScanState};
use futures::StreamExt;
use tokio::time::Instant;

mod test_utils;
use test_utils::*;

fn scanner(radio: &LoopbackRadio) -> Scanner<emob_ble::LoopbackCentral> {
    Scanner::new(
        Arc::new(radio.central("Phone", "11:22:33:44:55:66")),
        BleScope::current(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_scan_times_out_without_advertisers() {
    let radio = LoopbackRadio::new();
    let scanner = scanner(&radio);

    let started = Instant::now();
    let session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    assert_eq!(scanner.current_state(), ScanState::Scanning);
    assert_eq!(radio.active_scans(), 1);

    let items: Vec<_> = session.collect().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

    assert_eq!(items.len(), 1);
    assert_eq!(items[0], Err(EmobError::DeviceNotFound));
    assert_eq!(scanner.current_state(), ScanState::Failed(EmobError::DeviceNotFound));
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_finds_server() {
    let radio = LoopbackRadio::new();
    let _server = open_server(&radio, &EmobConfig::default()).await;
    let scanner = scanner(&radio);

    let mut session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    let peer = session.next().await.unwrap().unwrap();
    assert_eq!(peer, server_peer());
    assert_eq!(peer.name(), SERVER_NAME);

    session.stop().await;
    assert_eq!(scanner.current_state(), ScanState::Idle);
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_sees_late_advertiser() {
    let radio = LoopbackRadio::new();
    let scanner = scanner(&radio);
    let mut session = scanner.scan(Duration::from_secs(3)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let _server = open_server(&radio, &EmobConfig::default()).await;

    let peer = session.next().await.unwrap().unwrap();
    assert_eq!(peer.address().as_str(), SERVER_ADDRESS);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sightings_can_be_collapsed() {
    let radio = LoopbackRadio::new();
    let peripheral = radio.peripheral(SERVER_NAME, SERVER_ADDRESS);
    let _events = peripheral.open_server(&ServiceDefinition::emob()).await.unwrap();
    peripheral.start_advertising(EMOB_SERVICE_UUID, SERVER_NAME).await.unwrap();

    let scanner = scanner(&radio);
    let session = scanner.scan(Duration::from_secs(1)).await.unwrap();
    peripheral.start_advertising(EMOB_SERVICE_UUID, SERVER_NAME).await.unwrap();

    let items: Vec<_> = session.unique_by_address().collect().await;
    assert_eq!(items, vec![Ok(server_peer()), Err(EmobError::DeviceNotFound)]);
}

#[tokio::test(start_paused = true)]
async fn test_scanner_failure_ends_scan() {
    let radio = LoopbackRadio::new();
    radio.fail_next_scan(2);
    let scanner = scanner(&radio);

    let items: Vec<_> = scanner
        .scan(Duration::from_secs(3))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items, vec![Err(EmobError::Scanner { code: 2 })]);
    assert_eq!(
        scanner.current_state(),
        ScanState::Failed(EmobError::Scanner { code: 2 })
    );
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_scan_is_rejected() {
    let radio = LoopbackRadio::new();
    let scanner = scanner(&radio);

    let session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    assert_eq!(
        scanner.scan(Duration::from_secs(3)).await.err(),
        Some(EmobError::ScanInProgress)
    );
    assert_eq!(radio.discovery_starts(), 1);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scan_restarts_after_failure() {
    let radio = LoopbackRadio::new();
    let scanner = scanner(&radio);

    let _: Vec<_> = scanner
        .scan(Duration::from_millis(100))
        .await
        .unwrap()
        .collect()
        .await;
    assert!(matches!(scanner.current_state(), ScanState::Failed(_)));

    let session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    assert_eq!(scanner.current_state(), ScanState::Scanning);
    session.stop().await;
    assert_eq!(scanner.current_state(), ScanState::Idle);
    assert_eq!(radio.discovery_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_session_stops_discovery() {
    let radio = LoopbackRadio::new();
    let scanner = scanner(&radio);
    let mut state = scanner.state();

    let session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    drop(session);

    within(state.wait_for(|s| *s == ScanState::Idle))
        .await
        .unwrap();
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unread_session_still_times_out() {
    let radio = LoopbackRadio::new();
    let peripheral = radio.peripheral(SERVER_NAME, SERVER_ADDRESS);
    let _events = peripheral.open_server(&ServiceDefinition::emob()).await.unwrap();

    let scanner = scanner(&radio);
    let session = scanner.scan(Duration::from_secs(3)).await.unwrap();
    for _ in 0..40 {
        peripheral.start_advertising(EMOB_SERVICE_UUID, SERVER_NAME).await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scanner.current_state(), ScanState::Failed(EmobError::DeviceNotFound));
    assert_eq!(radio.active_scans(), 0);

    let items: Vec<_> = session.collect().await;
    assert!(items.len() < 40);
    assert_eq!(items.last(), Some(&Err(EmobError::DeviceNotFound)));
    assert!(items[..items.len() - 1].iter().all(|item| item.is_ok()));
}
