//! End-to-end chat between clients and a server over the loopback radio

use emob_core::transport::{Central, GattLink};
use emob_core::{Author, DeviceAddress, EmobConfig, Frame, GattStatus};
use tokio_test::assert_ok;

mod test_utils;
use test_utils::*;

// ----------------------------------------------------------------------------
// Chat Flow
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_client_message_reaches_server() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;
    let mut inbox = server.messages();

    let client = connected_client(&radio, "Phone", "11:22:33:44:55:66", &config).await;
    assert_ok!(client.send_message("Hello").await);

    let message = next_message(&mut inbox).await;
    assert_eq!(message.text(), "Hello");
    match message.author() {
        Author::Peer(peer) => {
            assert_eq!(peer.address().as_str(), "11:22:33:44:55:66");
            assert_eq!(peer.name(), "Phone");
        }
        Author::Local => panic!("server must attribute the message to the peer"),
    }

    // Descriptor, handshake and chat writes were all answered with success
    let responses = radio.responses();
    assert!(responses.len() >= 3);
    assert!(responses.iter().all(|r| r.status == 0));
}

#[tokio::test]
async fn test_server_tracks_connected_client() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;

    let _client = connected_client(&radio, "Phone", "11:22:33:44:55:66", &config).await;

    let address = DeviceAddress::from("11:22:33:44:55:66");
    wait_for_server(&server, |s| s.connected_peers.contains(&address)).await;
    assert!(server.current_state().is_serving());
}

// ----------------------------------------------------------------------------
// Malformed Input
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_header_is_dropped_and_server_keeps_running() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;
    let mut inbox = server.messages();

    let central = radio.central("Raw", "22:22:22:22:22:22");
    let (link, _events) = central.connect(&server_peer()).await.unwrap();
    let address = DeviceAddress::from("22:22:22:22:22:22");
    wait_for_server(&server, |s| s.connected_peers.contains(&address)).await;

    assert_eq!(link.write_characteristic(&[0x05, 0x41, 0x42]).await, GattStatus::Success);
    assert_eq!(link.write_characteristic(&[]).await, GattStatus::Success);

    // A following valid frame is the first thing delivered
    let valid = Frame::plain_text("still here").to_bytes();
    assert_eq!(link.write_characteristic(&valid).await, GattStatus::Success);
    let message = next_message(&mut inbox).await;
    assert_eq!(message.text(), "still here");

    let state = server.current_state();
    assert!(state.is_running);
    assert!(state.connected_peers.contains(&address));
}

#[tokio::test]
async fn test_encrypted_frame_is_dropped() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;
    let mut inbox = server.messages();

    let central = radio.central("Raw", "33:33:33:33:33:33");
    let (link, _events) = central.connect(&server_peer()).await.unwrap();

    link.write_characteristic(&[0x02, 0xDE, 0xAD]).await;
    link.write_characteristic(&Frame::plain_text("after").to_bytes())
        .await;

    assert_eq!(next_message(&mut inbox).await.text(), "after");
    // Every write got its transport response, the dropped one included
    assert_eq!(radio.responses().len(), 2);
}

// ----------------------------------------------------------------------------
// Multiple Peers
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_two_peers_and_one_disconnects() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;
    let mut inbox = server.messages();

    let first = connected_client(&radio, "First", "01:00:00:00:00:01", &config).await;
    let second = connected_client(&radio, "Second", "01:00:00:00:00:02", &config).await;

    let first_address = DeviceAddress::from("01:00:00:00:00:01");
    let second_address = DeviceAddress::from("01:00:00:00:00:02");
    wait_for_server(&server, |s| s.connected_peers.len() == 2).await;
    assert_eq!(
        server.current_state().connected_peers.addresses(),
        vec![first_address.clone(), second_address.clone()]
    );

    first.disconnect().await;
    wait_for_server(&server, |s| !s.connected_peers.contains(&first_address)).await;
    assert_eq!(
        server.current_state().connected_peers.addresses(),
        vec![second_address]
    );

    assert_ok!(second.send_message("only me").await);
    let message = next_message(&mut inbox).await;
    assert_eq!(message.text(), "only me");
    assert_eq!(message.author().name(), "Second");
}

#[tokio::test]
async fn test_messages_from_two_peers_all_arrive() {
    let radio = emob_ble::LoopbackRadio::new();
    let config = EmobConfig::default();
    let server = open_server(&radio, &config).await;
    let mut inbox = server.messages();

    let first = connected_client(&radio, "First", "01:00:00:00:00:01", &config).await;
    let second = connected_client(&radio, "Second", "01:00:00:00:00:02", &config).await;

    first.send_message("one").await.unwrap();
    second.send_message("two").await.unwrap();
    first.send_message("three").await.unwrap();

    let mut texts = Vec::new();
    for _ in 0..3 {
        texts.push(next_message(&mut inbox).await.text().to_string());
    }
    // Per-peer order holds; "one" precedes "three"
    let one = texts.iter().position(|t| t == "one").unwrap();
    let three = texts.iter().position(|t| t == "three").unwrap();
    assert!(one < three);
    assert!(texts.contains(&"two".to_string()));
}
