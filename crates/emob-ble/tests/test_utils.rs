//! Shared fixtures for the emob-ble integration tests
//!
//! Everything runs over a [`LoopbackRadio`], so the drivers see the same
//! event sequences a real adapter produces without any hardware.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use emob_ble::{
    BleScope, ClientConnection, LoopbackCentral, LoopbackPeripheral, LoopbackRadio,
    ServerConnection,
};
use emob_core::{ConnectionState, EmobConfig, Message, PeerDevice, ServerState};
use tokio::sync::{broadcast, watch};

pub const SERVER_ADDRESS: &str = "AA:BB:CC:00:00:01";
pub const SERVER_NAME: &str = "emob";

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(30);

/// The server as a scanning client would see it
pub fn server_peer() -> PeerDevice {
    PeerDevice::new(Some(SERVER_NAME.to_string()), SERVER_ADDRESS)
}

/// Open a server on `radio` at [`SERVER_ADDRESS`]
pub async fn open_server(
    radio: &LoopbackRadio,
    config: &EmobConfig,
) -> ServerConnection<LoopbackPeripheral> {
    let peripheral = Arc::new(radio.peripheral(SERVER_NAME, SERVER_ADDRESS));
    let server = ServerConnection::with_config(peripheral, BleScope::current(), config);
    server.open().await.expect("server should open");
    wait_for_server(&server, |s| s.advertising).await;
    server
}

pub fn client(
    radio: &LoopbackRadio,
    name: &str,
    address: &str,
    config: &EmobConfig,
) -> ClientConnection<LoopbackCentral> {
    let central = Arc::new(radio.central(name, address));
    ClientConnection::with_config(central, BleScope::current(), config)
}

/// Create a client and bring it to `Connected`
pub async fn connected_client(
    radio: &LoopbackRadio,
    name: &str,
    address: &str,
    config: &EmobConfig,
) -> ClientConnection<LoopbackCentral> {
    let client = client(radio, name, address, config);
    within(client.connect_and_wait(server_peer()))
        .await
        .expect("client should connect");
    client
}

/// Await `future`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

pub async fn wait_for_server<P>(
    server: &ServerConnection<P>,
    predicate: impl FnMut(&ServerState) -> bool,
) where
    P: emob_core::transport::Peripheral,
{
    let mut state = server.state();
    wait_until(&mut state, predicate).await;
}

pub async fn wait_for_client<C>(
    client: &ClientConnection<C>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) where
    C: emob_core::transport::Central,
{
    let mut state = client.state();
    wait_until(&mut state, predicate).await;
}

async fn wait_until<T>(state: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) {
    within(state.wait_for(predicate))
        .await
        .expect("state sender dropped");
}

pub async fn next_message(messages: &mut broadcast::Receiver<Message>) -> Message {
    within(messages.recv()).await.expect("message stream closed")
}
