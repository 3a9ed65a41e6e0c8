//! Server role: advertise the emob service and accept peers
//!
//! [`ServerConnection::open`] registers the service, starts advertising and
//! spawns a dispatcher which consumes the transport's server events. Every
//! connected peer gets its own worker so a slow peer never stalls another,
//! while writes from one peer are handled in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use emob_core::config::ServerConfig;
use emob_core::protocol::{ServiceDefinition, EMOB_SERVICE_UUID};
use emob_core::retry::GATT_SUCCESS;
use emob_core::transport::{Peripheral, ServerEvent, ServerEvents, WriteRequest};
use emob_core::{
    DeviceAddress, EmobConfig, Frame, GattStatus, Message, PeerDevice, Result, RetryWriter,
    ServerState,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scope::BleScope;

// ----------------------------------------------------------------------------
// Server Connection
// ----------------------------------------------------------------------------

/// Local emob server accepting any number of peers
pub struct ServerConnection<P: Peripheral> {
    peripheral: Arc<P>,
    scope: BleScope,
    retry: RetryWriter,
    config: ServerConfig,
    state: watch::Sender<ServerState>,
    messages: broadcast::Sender<Message>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Peripheral> ServerConnection<P> {
    pub fn new(peripheral: Arc<P>, scope: BleScope) -> Self {
        Self::with_config(peripheral, scope, &EmobConfig::default())
    }

    pub fn with_config(peripheral: Arc<P>, scope: BleScope, config: &EmobConfig) -> Self {
        let (state, _) = watch::channel(ServerState::default());
        let (messages, _) = broadcast::channel(config.server.message_buffer_size.max(1));
        Self {
            peripheral,
            scope,
            retry: RetryWriter::from_config(&config.retry),
            config: config.server.clone(),
            state,
            messages,
            dispatcher: Mutex::new(None),
        }
    }

    /// Observe the server state
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    /// Chat messages received from any peer, in arrival order
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    /// Open the listener and start advertising
    ///
    /// Calling this while the server runs is a no-op.
    pub async fn open(&self) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if state.is_running {
                false
            } else {
                state.is_running = true;
                true
            }
        });
        if !claimed {
            info!("Server is already running");
            return Ok(());
        }

        let events = match self.peripheral.open_server(&ServiceDefinition::emob()).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to open server: {}", e);
                self.state.send_modify(|state| state.is_running = false);
                return Err(e);
            }
        };

        let dispatcher = ServerDispatcher {
            peripheral: self.peripheral.clone(),
            scope: self.scope.clone(),
            retry: self.retry,
            ack_token: Arc::from(self.config.ack_token.as_str()),
            state: self.state.clone(),
            messages: self.messages.clone(),
            workers: HashMap::new(),
        };
        let task = self.scope.spawn("emob-server", dispatcher.run(events));
        if let Some(stale) = self.lock_dispatcher().replace(task) {
            stale.abort();
        }

        info!("Server started, advertising as {}", self.config.device_name);
        if let Err(e) = self
            .peripheral
            .start_advertising(EMOB_SERVICE_UUID, &self.config.device_name)
            .await
        {
            warn!("Failed to start advertising: {}", e);
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop advertising, release the listener and forget all peers
    ///
    /// Each teardown step is skipped with a warning when the transport
    /// refuses it; the remaining steps still run. No-op if not running.
    pub async fn close(&self) {
        if !self.state.borrow().is_running {
            return;
        }

        if let Err(e) = self.peripheral.stop_advertising().await {
            warn!("Could not stop advertising: {}", e);
        }
        self.shutdown().await;
        info!("Server closed");
    }

    /// Release the listener, stop the dispatcher and reset the state
    async fn shutdown(&self) {
        if let Err(e) = self.peripheral.close_server().await {
            warn!("Could not close server: {}", e);
        }

        let dispatcher = self.lock_dispatcher().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        self.state.send_replace(ServerState::default());
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

struct ServerDispatcher<P: Peripheral> {
    peripheral: Arc<P>,
    scope: BleScope,
    retry: RetryWriter,
    ack_token: Arc<str>,
    state: watch::Sender<ServerState>,
    messages: broadcast::Sender<Message>,
    workers: HashMap<DeviceAddress, mpsc::UnboundedSender<Vec<u8>>>,
}

impl<P: Peripheral> ServerDispatcher<P> {
    async fn run(mut self, mut events: ServerEvents) -> Result<()> {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::AdvertiseStarted => {
                    info!("Advertising started");
                    self.state.send_modify(|state| state.advertising = true);
                }
                ServerEvent::AdvertiseFailed { code } => {
                    warn!("Advertising failed with code {}", code);
                    self.state.send_modify(|state| state.advertising = false);
                }
                ServerEvent::ConnectionStateChanged {
                    device,
                    status,
                    connected,
                } => {
                    debug!(
                        "Connection state of {} changed: status={}, connected={}",
                        device, status, connected
                    );
                    if connected {
                        self.on_connected(device);
                    } else {
                        self.on_disconnected(&device);
                    }
                }
                ServerEvent::CharacteristicWriteRequest(request) => self.route(request).await,
                ServerEvent::DescriptorWriteRequest(request) => {
                    debug!(
                        "Descriptor write from {}: {}",
                        request.device,
                        hex::encode_upper(request.value.as_deref().unwrap_or_default())
                    );
                    if request.response_needed {
                        self.peripheral
                            .send_response(
                                &request.device,
                                request.request_id,
                                GATT_SUCCESS,
                                0,
                                None,
                            )
                            .await;
                    }
                }
                ServerEvent::NotificationSent { device, status } => {
                    debug!("Notification sent to {}: status={}", device, status);
                }
                ServerEvent::MtuChanged { device, mtu } => {
                    debug!("MTU of {} changed to {}", device, mtu);
                }
            }
        }
        debug!("Server event stream ended");
        Ok(())
    }

    fn on_connected(&mut self, device: PeerDevice) {
        let added = self
            .state
            .send_if_modified(|state| state.connected_peers.insert(device.clone()));
        if added {
            info!("Peer connected: {}", device);
        }
        self.ensure_worker(&device);
    }

    fn on_disconnected(&mut self, device: &PeerDevice) {
        let removed = self
            .state
            .send_if_modified(|state| state.connected_peers.remove(device.address()));
        if removed {
            info!("Peer disconnected: {}", device);
        }
        self.workers.remove(device.address());
    }

    /// Answer a write on receipt, then queue its payload for the peer's worker
    async fn route(&mut self, request: WriteRequest) {
        let WriteRequest {
            device,
            request_id,
            response_needed,
            offset,
            value,
            ..
        } = request;

        let Some(value) = value else {
            warn!("Write request {} from {} carried no value", request_id, device);
            return;
        };
        debug!(
            "Write request {} from {}: {}",
            request_id,
            device,
            hex::encode_upper(&value)
        );

        if response_needed {
            self.peripheral
                .send_response(
                    &device,
                    request_id,
                    GATT_SUCCESS,
                    offset,
                    Some(value.as_slice()),
                )
                .await;
        }

        let Some(worker) = self.workers.get(device.address()) else {
            warn!("Dropping write from unregistered peer {}", device);
            return;
        };
        if worker.send(value).is_err() {
            warn!("Worker for {} is gone, dropping write", device);
        }
    }

    fn ensure_worker(&mut self, device: &PeerDevice) {
        if self.workers.contains_key(device.address()) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PeerWorker {
            peripheral: self.peripheral.clone(),
            device: device.clone(),
            retry: self.retry,
            ack_token: self.ack_token.clone(),
            messages: self.messages.clone(),
        };
        self.scope
            .spawn(format!("emob-peer-{}", device.address()), worker.run(rx));
        self.workers.insert(device.address().clone(), tx);
    }
}

// ----------------------------------------------------------------------------
// Per-peer Worker
// ----------------------------------------------------------------------------

/// Decodes one peer's writes in arrival order
struct PeerWorker<P: Peripheral> {
    peripheral: Arc<P>,
    device: PeerDevice,
    retry: RetryWriter,
    ack_token: Arc<str>,
    messages: broadcast::Sender<Message>,
}

impl<P: Peripheral> PeerWorker<P> {
    async fn run(self, mut payloads: mpsc::UnboundedReceiver<Vec<u8>>) -> Result<()> {
        while let Some(value) = payloads.recv().await {
            self.handle_write(&value).await;
        }
        Ok(())
    }

    async fn handle_write(&self, value: &[u8]) {
        let device = &self.device;
        match Frame::parse(value) {
            Ok(Frame::PlainText(text)) => {
                debug!("Message from {}: {}", device, text);
                let _ = self.messages.send(Message::from_peer(device.clone(), text));
            }
            Ok(Frame::KeyExchange(key)) => {
                debug!("KeyExchange: received={}", String::from_utf8_lossy(&key));
                self.acknowledge().await;
            }
            Err(e) => {
                warn!("Dropping frame from {}: {}", device, e);
            }
        }
    }

    async fn acknowledge(&self) {
        let device = &self.device;
        let ack = Frame::key_exchange(self.ack_token.as_bytes()).to_bytes();
        let peripheral = &self.peripheral;
        let payload = ack.as_slice();
        match self
            .retry
            .perform(move || peripheral.notify(device, payload))
            .await
        {
            Ok(GattStatus::Success) => debug!("KeyExchange: sent ack to {}", device),
            Ok(status) => warn!("Ack to {} not delivered: {}", device, status),
            Err(e) => warn!("Ack to {} not delivered: {}", device, e),
        }
    }
}
