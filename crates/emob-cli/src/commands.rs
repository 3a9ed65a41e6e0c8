//! Command handlers for the emob CLI

use std::sync::Arc;
use std::time::Duration;

use emob_ble::{
    BleScope, BtleplugCentral, ClientConnection, LoopbackRadio, Scanner, ServerConnection,
};
use emob_core::message::LOCAL_DEVICE_NAME;
use emob_core::transport::Central;
use emob_core::{ConnectionState, EmobConfig, EmobError, MessageLog, MessageLogView, PeerDevice};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::Commands;
use crate::error::{CliError, Result};

/// Addresses of the in-process demo endpoints
const DEMO_SERVER_ADDRESS: &str = "E0:B0:00:00:00:01";
const DEMO_CLIENT_ADDRESS: &str = "E0:B0:00:00:00:02";

/// How long the demo waits for the server to report the message
const DEMO_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, config: EmobConfig) -> Result<()> {
        match command {
            Commands::Scan { duration_ms } => {
                let duration = duration_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| config.scan.duration());
                Self::handle_scan_command(duration).await
            }
            Commands::Chat { address } => Self::handle_chat_command(config, address).await,
            Commands::Demo { message } => Self::handle_demo_command(config, message).await,
        }
    }

    /// List every emob device seen during the scan window
    async fn handle_scan_command(duration: Duration) -> Result<()> {
        let scope = BleScope::current();
        let central = Arc::new(BtleplugCentral::new(scope.clone()).await?);
        let scanner = Scanner::new(central, scope);

        println!("Scanning for {} ms...", duration.as_millis());
        let mut results = scanner.scan(duration).await?.unique_by_address();
        let mut found = 0usize;
        while let Some(result) = results.next().await {
            match result {
                Ok(peer) => {
                    found += 1;
                    println!("  {}", peer);
                }
                Err(EmobError::DeviceNotFound) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if found == 0 {
            println!("No emob devices found");
        } else {
            println!("Found {} device(s)", found);
        }
        Ok(())
    }

    /// Chat with one device until stdin closes or the link drops
    async fn handle_chat_command(config: EmobConfig, address: String) -> Result<()> {
        let scope = BleScope::current();
        let central = Arc::new(BtleplugCentral::new(scope.clone()).await?);

        let peer = find_peer(central.clone(), scope.clone(), &config, &address).await?;
        let client = ClientConnection::with_config(central, scope.clone(), &config);
        client.connect_and_wait(peer.clone()).await?;
        println!("Connected to {}. Type a message and press enter, /quit to leave.", peer);

        let log = MessageLog::new();
        let view = log.subscribe();
        let merge = log.merge(client.sent_messages(), client.messages());
        let printer = scope.spawn("emob-printer", async move {
            print_messages(view).await;
            Ok(())
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut state = client.state();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let text = line.trim();
                    if text == "/quit" {
                        break;
                    }
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = client.send_message(text).await {
                        warn!("Message not sent: {}", e);
                    }
                }
                _ = link_lost(&mut state) => {
                    println!("Connection to {} lost", peer);
                    break;
                }
            }
        }

        client.disconnect().await;
        printer.abort();
        merge.abort();
        Ok(())
    }

    /// Server and client talking over the loopback radio
    async fn handle_demo_command(config: EmobConfig, message: String) -> Result<()> {
        let radio = LoopbackRadio::new();
        let scope = BleScope::current();

        let peripheral = radio.peripheral(&config.server.device_name, DEMO_SERVER_ADDRESS);
        let server = ServerConnection::with_config(Arc::new(peripheral), scope.clone(), &config);
        server.open().await?;
        let mut server_state = server.state();
        let serving = tokio::time::timeout(
            DEMO_RECEIVE_TIMEOUT,
            server_state.wait_for(|state| state.is_serving()),
        )
        .await;
        if !matches!(serving, Ok(Ok(_))) {
            warn!("Demo server is not advertising yet");
        }
        info!("Demo server listening at {}", DEMO_SERVER_ADDRESS);

        let central = Arc::new(radio.central(LOCAL_DEVICE_NAME, DEMO_CLIENT_ADDRESS));
        let peer = find_peer(central.clone(), scope.clone(), &config, DEMO_SERVER_ADDRESS).await?;
        println!("Found {}", peer);

        let client = ClientConnection::with_config(central, scope, &config);
        client.connect_and_wait(peer).await?;

        // What the client sent next to what the server received
        let log = MessageLog::new();
        let mut view = log.subscribe();
        let merge = log.merge(client.sent_messages(), server.messages());

        client.send_message(&message).await?;
        tokio::time::timeout(DEMO_RECEIVE_TIMEOUT, async {
            while view.current().len() < 2 {
                if view.changed().await.is_none() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| EmobError::transport("server did not receive the message in time"))?;

        for entry in log.snapshot() {
            println!("{}", entry);
        }

        client.disconnect().await;
        server.close().await;
        merge.abort();
        Ok(())
    }
}

/// Scan until the device with `address` shows up
async fn find_peer<C: Central>(
    central: Arc<C>,
    scope: BleScope,
    config: &EmobConfig,
    address: &str,
) -> Result<PeerDevice> {
    let scanner = Scanner::new(central, scope);
    let mut results = scanner.scan(config.scan.duration()).await?;
    let mut found = None;
    while let Some(result) = results.next().await {
        match result {
            Ok(peer) if peer.address().as_str().eq_ignore_ascii_case(address) => {
                found = Some(peer);
                break;
            }
            Ok(peer) => debug!("Ignoring {}", peer),
            Err(EmobError::DeviceNotFound) => break,
            Err(e) => return Err(e.into()),
        }
    }
    results.stop().await;
    found.ok_or_else(|| CliError::PeerNotFound(address.to_string()))
}

/// Print log entries as they are appended
async fn print_messages(mut view: MessageLogView) {
    let mut printed = view.current().len();
    while let Some(history) = view.changed().await {
        for message in history.iter().skip(printed) {
            println!("{}", message);
        }
        printed = history.len();
    }
}

/// Resolves once the connection leaves `Connected`
async fn link_lost(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| !matches!(s, ConnectionState::Connected(_)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_round_trip() {
        let result = CommandDispatcher::execute(
            Commands::Demo {
                message: "Hello".to_string(),
            },
            EmobConfig::default(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_peer_reports_missing_device() {
        let radio = LoopbackRadio::new();
        let central = Arc::new(radio.central(LOCAL_DEVICE_NAME, DEMO_CLIENT_ADDRESS));
        let config = EmobConfig::default().with_scan_duration(Duration::from_secs(1));

        let missing = "00:00:00:00:00:00";
        let result = find_peer(central, BleScope::current(), &config, missing).await;
        assert!(matches!(result, Err(CliError::PeerNotFound(address)) if address == missing));
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_find_peer_matches_address_case_insensitively() {
        let radio = LoopbackRadio::new();
        let server = ServerConnection::new(
            Arc::new(radio.peripheral("emob", "e0:b0:00:00:00:0a")),
            BleScope::current(),
        );
        server.open().await.unwrap();

        let central = Arc::new(radio.central(LOCAL_DEVICE_NAME, DEMO_CLIENT_ADDRESS));
        let config = EmobConfig::default();
        let peer = find_peer(central, BleScope::current(), &config, "E0:B0:00:00:00:0A")
            .await
            .unwrap();
        assert_eq!(peer.name(), "emob");
    }
}
