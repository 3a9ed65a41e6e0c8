//! Client role: connect to one emob peer and chat with it
//!
//! A [`ClientConnection`] owns at most one link. Each `connect` spawns a
//! driver task which owns the transport link and processes link events and
//! user commands in order, so the state machine never races with itself:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected
//!             |             |
//!             +-> Failed <--+
//! ```
//!
//! Service discovery only begins after the transport connection succeeded,
//! notifications are enabled only after the service was found, and the
//! handshake frame is written last. The state turns `Connected` after all
//! three steps.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use emob_core::config::ClientConfig;
use emob_core::protocol::ENABLE_NOTIFICATION_VALUE;
use emob_core::retry::GATT_SUCCESS;
use emob_core::transport::{Central, GattLink, LinkEvent, LinkEvents};
use emob_core::{
    ConnectionState, EmobConfig, EmobError, Frame, Message, PeerDevice, Result, RetryWriter,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::scope::BleScope;

/// Capacity of the inbound and outbound message broadcasts
const MESSAGE_BUFFER: usize = 64;

enum ClientCommand {
    Send {
        frame: Frame,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Handles to the driver of the current connection
struct Session {
    commands: mpsc::UnboundedSender<ClientCommand>,
    cancel: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// Client Connection
// ----------------------------------------------------------------------------

/// Connection to a single emob server
pub struct ClientConnection<C: Central> {
    central: Arc<C>,
    scope: BleScope,
    retry: RetryWriter,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<Message>,
    outbound: broadcast::Sender<Message>,
    session: Mutex<Option<Session>>,
}

impl<C: Central> ClientConnection<C> {
    pub fn new(central: Arc<C>, scope: BleScope) -> Self {
        Self::with_config(central, scope, &EmobConfig::default())
    }

    pub fn with_config(central: Arc<C>, scope: BleScope, config: &EmobConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (inbound, _) = broadcast::channel(MESSAGE_BUFFER);
        let (outbound, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            central,
            scope,
            retry: RetryWriter::from_config(&config.retry),
            config: config.client.clone(),
            state,
            inbound,
            outbound,
            session: Mutex::new(None),
        }
    }

    /// Observe the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Messages received from the peer
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.inbound.subscribe()
    }

    /// Messages successfully sent to the peer
    pub fn sent_messages(&self) -> broadcast::Receiver<Message> {
        self.outbound.subscribe()
    }

    /// Begin connecting to `peer`
    ///
    /// Returns once the attempt is underway; progress is reported through
    /// [`state`](Self::state). Fails with `ConnectionInProgress` while a
    /// previous attempt is connecting or connected.
    pub fn connect(&self, peer: PeerDevice) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if state.can_connect() {
                *state = ConnectionState::Connecting(peer.clone());
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(EmobError::ConnectionInProgress);
        }
        info!("Connecting to {}", peer);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let driver = ClientDriver {
            central: self.central.clone(),
            peer,
            retry: self.retry,
            handshake_token: self.config.handshake_token.clone(),
            connect_timeout: self.config.connect_timeout(),
            state: self.state.clone(),
            inbound: self.inbound.clone(),
            commands: command_rx,
            cancel: cancel_rx,
        };
        let driver = self.scope.spawn("emob-client", driver.run());

        // A previous driver is past its terminal state and only finishing teardown
        let _ = self.lock_session().replace(Session {
            commands,
            cancel,
            driver,
        });
        Ok(())
    }

    /// Connect and wait until the link is ready or has failed
    pub async fn connect_and_wait(&self, peer: PeerDevice) -> Result<PeerDevice> {
        let mut state = self.state();
        self.connect(peer)?;
        let settled = state
            .wait_for(|s| !matches!(s, ConnectionState::Connecting(_)))
            .await
            .map_err(|_| EmobError::channel_closed("connection state"))?
            .clone();
        match settled {
            ConnectionState::Connected(peer) => Ok(peer),
            ConnectionState::Failed(_, cause) => Err(cause),
            _ => Err(EmobError::NotConnected),
        }
    }

    /// Send a chat message to the connected peer
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if !self.state.borrow().can_send_messages() {
            return Err(EmobError::NotConnected);
        }
        let commands = self
            .lock_session()
            .as_ref()
            .map(|s| s.commands.clone())
            .ok_or(EmobError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        commands
            .send(ClientCommand::Send {
                frame: Frame::plain_text(text),
                reply,
            })
            .map_err(|_| EmobError::NotConnected)?;
        response.await.map_err(|_| EmobError::NotConnected)??;

        let _ = self.outbound.send(Message::local(text));
        Ok(())
    }

    /// Tear down the connection
    ///
    /// Cancels any in-flight retry loop and waits until the transport link
    /// has been closed. Calling it again, or without a connection, is a
    /// no-op.
    pub async fn disconnect(&self) {
        let session = self.lock_session().take();
        let Some(session) = session else {
            return;
        };
        let _ = session.cancel.send(true);
        let _ = session.commands.send(ClientCommand::Disconnect);
        if let Err(e) = session.driver.await {
            error!("Client driver ended abnormally: {}", e);
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Client Driver
// ----------------------------------------------------------------------------

/// What the driver loop does after handling one input
enum Flow {
    Continue,
    Stop,
}

struct ClientDriver<C: Central> {
    central: Arc<C>,
    peer: PeerDevice,
    retry: RetryWriter,
    handshake_token: String,
    connect_timeout: Option<Duration>,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<Message>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    cancel: watch::Receiver<bool>,
}

impl<C: Central> ClientDriver<C> {
    async fn run(mut self) -> Result<()> {
        let (link, mut events) = match self.central.connect(&self.peer).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.peer, e);
                self.set_state(ConnectionState::Failed(self.peer.clone(), e));
                return Ok(());
            }
        };

        let deadline = self.connect_timeout.map(|limit| Instant::now() + limit);
        self.drive(&link, &mut events, deadline).await;

        link.disconnect().await;
        link.close().await;
        debug!("Link to {} closed", self.peer);
        Ok(())
    }

    async fn drive(&mut self, link: &C::Link, events: &mut LinkEvents, deadline: Option<Instant>) {
        loop {
            let connecting = self.is_connecting();
            let flow = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_link_event(link, event).await,
                    None if self.is_connecting() => {
                        warn!("Transport dropped the link to {} while connecting", self.peer);
                        self.fail(EmobError::channel_closed("link events"));
                        Flow::Stop
                    }
                    None => {
                        debug!("Transport dropped the link to {}", self.peer);
                        self.set_state(ConnectionState::Disconnected(self.peer.clone()));
                        Flow::Stop
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Send { frame, reply }) => {
                        let result = self.send_frame(link, &frame).await;
                        let _ = reply.send(result);
                        Flow::Continue
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        info!("Disconnecting from {}", self.peer);
                        self.set_state(ConnectionState::Disconnected(self.peer.clone()));
                        Flow::Stop
                    }
                },
                _ = deadline_elapsed(deadline), if connecting => {
                    let duration_ms = self
                        .connect_timeout
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    warn!("Connecting to {} timed out after {} ms", self.peer, duration_ms);
                    self.fail(EmobError::ConnectTimeout { duration_ms });
                    Flow::Stop
                }
            };
            if let Flow::Stop = flow {
                return;
            }
        }
    }

    async fn on_link_event(&mut self, link: &C::Link, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::ConnectionStateChanged { status, connected } => {
                debug!(
                    "Connection state changed: status={}, connected={}",
                    status, connected
                );
                if connected && status == GATT_SUCCESS {
                    if !self.is_connecting() {
                        return Flow::Continue;
                    }
                    info!("Transport connected to {}, discovering services", self.peer);
                    if !link.discover_services().await {
                        self.fail(EmobError::transport("service discovery could not start"));
                        return Flow::Stop;
                    }
                    Flow::Continue
                } else if self.is_connecting() {
                    warn!("Connection to {} failed with status {}", self.peer, status);
                    self.fail(EmobError::Connection { status });
                    Flow::Stop
                } else {
                    info!("Disconnected from {}", self.peer);
                    self.set_state(ConnectionState::Disconnected(self.peer.clone()));
                    Flow::Stop
                }
            }
            LinkEvent::ServicesDiscovered {
                status,
                service_found,
            } => {
                if !self.is_connecting() {
                    return Flow::Continue;
                }
                if status != GATT_SUCCESS || !service_found {
                    warn!(
                        "emob service not found on {} (status {})",
                        self.peer, status
                    );
                    self.fail(EmobError::ServiceNotFound { status });
                    return Flow::Stop;
                }
                match self.establish(link).await {
                    Some(Ok(())) => {
                        info!("Connected to {}", self.peer);
                        self.set_state(ConnectionState::Connected(self.peer.clone()));
                        Flow::Continue
                    }
                    Some(Err(e)) => {
                        warn!("Handshake with {} failed: {}", self.peer, e);
                        self.fail(e);
                        Flow::Stop
                    }
                    None => {
                        info!("Connection attempt to {} cancelled", self.peer);
                        self.set_state(ConnectionState::Disconnected(self.peer.clone()));
                        Flow::Stop
                    }
                }
            }
            LinkEvent::CharacteristicChanged { value } => {
                self.on_notification(&value);
                Flow::Continue
            }
        }
    }

    /// Enable notifications then write the handshake; `None` if cancelled
    async fn establish(&mut self, link: &C::Link) -> Option<Result<()>> {
        let retry = self.retry;
        let handshake = Frame::key_exchange(self.handshake_token.as_bytes()).to_bytes();
        let cancel = &mut self.cancel;

        let steps = async {
            if !link.set_characteristic_notification(true).await {
                return Err(EmobError::transport("failed to enable local notifications"));
            }
            retry
                .write(move || link.write_descriptor(&ENABLE_NOTIFICATION_VALUE))
                .await?;
            debug!("Notifications enabled, sending handshake");
            let handshake = handshake.as_slice();
            retry
                .write(move || link.write_characteristic(handshake))
                .await
        };
        until_cancelled(cancel, steps).await
    }

    async fn send_frame(&mut self, link: &C::Link, frame: &Frame) -> Result<()> {
        if !self.state.borrow().can_send_messages() {
            return Err(EmobError::NotConnected);
        }
        let bytes = frame.to_bytes();
        debug!("Sending {:?} to {}", frame, self.peer);
        let payload = bytes.as_slice();
        let write = self
            .retry
            .write(move || link.write_characteristic(payload));
        until_cancelled(&mut self.cancel, write)
            .await
            .unwrap_or(Err(EmobError::NotConnected))
    }

    fn on_notification(&self, value: &[u8]) {
        match Frame::parse(value) {
            Ok(Frame::KeyExchange(key)) => {
                debug!("KeyExchange: received={}", String::from_utf8_lossy(&key));
            }
            Ok(Frame::PlainText(text)) => {
                debug!("Message from {}: {}", self.peer, text);
                let _ = self.inbound.send(Message::from_peer(self.peer.clone(), text));
            }
            Err(e) => {
                warn!(
                    "Dropping notification {} from {}: {}",
                    hex::encode_upper(value),
                    self.peer,
                    e
                );
            }
        }
    }

    fn is_connecting(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connecting(_))
    }

    fn fail(&self, cause: EmobError) {
        self.set_state(ConnectionState::Failed(self.peer.clone(), cause));
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Client state -> {}", state.state_name());
        self.state.send_replace(state);
    }
}

/// Run `work` unless the cancel flag is (or becomes) set
async fn until_cancelled<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    work: F,
) -> Option<F::Output> {
    if *cancel.borrow() {
        return None;
    }
    tokio::select! {
        output = work => Some(output),
        _ = cancel.wait_for(|cancelled| *cancelled) => None,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
