//! In-process loopback radio
//!
//! A [`LoopbackRadio`] is a shared medium: centrals created from it discover
//! and connect to peripherals created from the same radio, and every write
//! or notification is delivered through the same event channels a real
//! transport would use. Faults (busy writes, scanner failure, failed
//! connects, missing service, denied teardown) can be injected to exercise
//! the drivers' error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use emob_core::protocol::{ServiceDefinition, EMOB_CHARACTERISTIC_UUID, ENABLE_NOTIFICATION_VALUE};
use emob_core::retry::{GattStatus, GATT_ERROR, GATT_FAILURE, GATT_SUCCESS};
use emob_core::transport::{
    Central, DiscoveryEvent, DiscoveryEvents, GattLink, LinkEvent, LinkEvents, Peripheral,
    ServerEvent, ServerEvents, WriteRequest,
};
use emob_core::{DeviceAddress, EmobError, PeerDevice, Result};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// MTU reported to the server when a link comes up
pub const LOOPBACK_MTU: u16 = 512;

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

/// Injectable transport faults
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    /// Number of upcoming writes/notifications answered with busy
    pub busy_responses: u32,
    /// Number of upcoming notifications answered with busy
    pub busy_notifications: u32,
    /// Next discovery fails with this scanner code
    pub scan_failure: Option<i32>,
    /// Next connect reports this GATT status
    pub connect_failure: Option<i32>,
    /// Next service discovery reports this GATT status
    pub service_discovery_failure: Option<i32>,
    /// Next advertise start fails with this code
    pub advertise_failure: Option<i32>,
    /// Next advertise request is refused outright
    pub refuse_advertise: bool,
    pub deny_stop_advertising: bool,
    pub deny_close_server: bool,
}

/// Response sent by a peripheral, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub device: DeviceAddress,
    pub request_id: i32,
    pub status: i32,
    pub offset: i32,
}

#[derive(Debug)]
struct ServerEndpoint {
    device: PeerDevice,
    service: Option<ServiceDefinition>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    advertised_service: Option<Uuid>,
}

#[derive(Debug)]
struct ScanRegistration {
    service: Uuid,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

#[derive(Debug)]
struct LinkEndpoint {
    central: PeerDevice,
    server: DeviceAddress,
    events: mpsc::UnboundedSender<LinkEvent>,
    connected: bool,
    notifications_enabled: bool,
    subscribed: bool,
}

#[derive(Debug, Default)]
struct RadioState {
    servers: HashMap<DeviceAddress, ServerEndpoint>,
    scans: HashMap<DeviceAddress, ScanRegistration>,
    links: HashMap<u64, LinkEndpoint>,
    next_link_id: u64,
    next_request_id: i32,
    faults: FaultPlan,
    discovery_starts: usize,
    link_closes: usize,
    responses: Vec<ResponseRecord>,
}

impl RadioState {
    fn take_busy(&mut self) -> bool {
        if self.faults.busy_responses > 0 {
            self.faults.busy_responses -= 1;
            true
        } else {
            false
        }
    }

    fn take_busy_notification(&mut self) -> bool {
        if self.faults.busy_notifications > 0 {
            self.faults.busy_notifications -= 1;
            true
        } else {
            self.take_busy()
        }
    }

    fn next_request_id(&mut self) -> i32 {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn server_sender(&self, address: &DeviceAddress) -> Option<mpsc::UnboundedSender<ServerEvent>> {
        self.servers.get(address).and_then(|s| s.events.clone())
    }

    /// Tear down a link from the radio side, telling both ends
    fn drop_link(&mut self, id: u64) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.connected {
            return;
        }
        link.connected = false;
        link.subscribed = false;
        let central = link.central.clone();
        let server = link.server.clone();
        let _ = link.events.send(LinkEvent::ConnectionStateChanged {
            status: GATT_SUCCESS,
            connected: false,
        });
        if let Some(events) = self.server_sender(&server) {
            let _ = events.send(ServerEvent::ConnectionStateChanged {
                device: central,
                status: GATT_SUCCESS,
                connected: false,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Radio
// ----------------------------------------------------------------------------

/// Shared in-process medium
#[derive(Debug, Clone, Default)]
pub struct LoopbackRadio {
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        // A panic while holding the lock only happens in a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Central endpoint with the given identity
    pub fn central(&self, name: &str, address: &str) -> LoopbackCentral {
        LoopbackCentral {
            radio: self.clone(),
            device: PeerDevice::new(Some(name.to_string()), address),
        }
    }

    /// Peripheral endpoint with the given identity
    pub fn peripheral(&self, name: &str, address: &str) -> LoopbackPeripheral {
        LoopbackPeripheral {
            radio: self.clone(),
            device: PeerDevice::new(Some(name.to_string()), address),
        }
    }

    // ---- Fault injection ----

    /// Answer the next `count` writes or notifications with busy
    pub fn inject_busy(&self, count: u32) {
        self.lock().faults.busy_responses = count;
    }

    /// Answer the next `count` notifications with busy, leaving writes alone
    pub fn inject_notify_busy(&self, count: u32) {
        self.lock().faults.busy_notifications = count;
    }

    pub fn fail_next_scan(&self, code: i32) {
        self.lock().faults.scan_failure = Some(code);
    }

    pub fn fail_next_connect(&self, status: i32) {
        self.lock().faults.connect_failure = Some(status);
    }

    pub fn fail_next_service_discovery(&self, status: i32) {
        self.lock().faults.service_discovery_failure = Some(status);
    }

    pub fn fail_next_advertise(&self, code: i32) {
        self.lock().faults.advertise_failure = Some(code);
    }

    /// Make the next `start_advertising` call return an error
    pub fn refuse_next_advertise(&self) {
        self.lock().faults.refuse_advertise = true;
    }

    /// Deny the permission needed by peripheral teardown steps
    pub fn deny_teardown(&self, stop_advertising: bool, close_server: bool) {
        let mut state = self.lock();
        state.faults.deny_stop_advertising = stop_advertising;
        state.faults.deny_close_server = close_server;
    }

    /// Simulate link loss between `central` and whatever it is connected to
    pub fn drop_connection(&self, central: &DeviceAddress) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, link)| link.central.address() == central)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.drop_link(id);
        }
    }

    // ---- Inspection ----

    /// Discoveries currently running
    pub fn active_scans(&self) -> usize {
        self.lock().scans.len()
    }

    /// Discoveries started since the radio was created
    pub fn discovery_starts(&self) -> usize {
        self.lock().discovery_starts
    }

    /// Links released with `close`
    pub fn link_closes(&self) -> usize {
        self.lock().link_closes
    }

    /// Links that are up
    pub fn connected_links(&self) -> usize {
        self.lock().links.values().filter(|l| l.connected).count()
    }

    pub fn responses(&self) -> Vec<ResponseRecord> {
        self.lock().responses.clone()
    }

    /// Whether a peripheral currently advertises
    pub fn is_advertising(&self, peripheral: &DeviceAddress) -> bool {
        self.lock()
            .servers
            .get(peripheral)
            .map(|s| s.advertised_service.is_some())
            .unwrap_or(false)
    }

    /// Whether a peripheral has an open listener
    pub fn is_listening(&self, peripheral: &DeviceAddress) -> bool {
        self.lock()
            .servers
            .get(peripheral)
            .map(|s| s.events.is_some())
            .unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Central Side
// ----------------------------------------------------------------------------

/// Central endpoint on a [`LoopbackRadio`]
#[derive(Debug, Clone)]
pub struct LoopbackCentral {
    radio: LoopbackRadio,
    device: PeerDevice,
}

impl LoopbackCentral {
    pub fn device(&self) -> &PeerDevice {
        &self.device
    }
}

#[async_trait]
impl Central for LoopbackCentral {
    type Link = LoopbackLink;

    async fn start_discovery(&self, service: Uuid) -> Result<DiscoveryEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.radio.lock();
        state.discovery_starts += 1;

        if let Some(code) = state.faults.scan_failure.take() {
            debug!("Loopback scan for {} failed with code {}", self.device, code);
            let _ = tx.send(DiscoveryEvent::Failed { code });
            return Ok(rx);
        }

        for server in state.servers.values() {
            if server.advertised_service == Some(service) {
                let _ = tx.send(DiscoveryEvent::Found(server.device.clone()));
            }
        }
        state.scans.insert(
            self.device.address().clone(),
            ScanRegistration {
                service,
                events: tx,
            },
        );
        Ok(rx)
    }

    async fn stop_discovery(&self) {
        self.radio.lock().scans.remove(self.device.address());
    }

    async fn connect(&self, peer: &PeerDevice) -> Result<(Self::Link, LinkEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.radio.lock();
        let id = state.next_link_id;
        state.next_link_id += 1;

        let failure = state.faults.connect_failure.take();
        let server_events = state.server_sender(peer.address());
        let connected = match (failure, server_events) {
            (None, Some(events)) => {
                let _ = events.send(ServerEvent::ConnectionStateChanged {
                    device: self.device.clone(),
                    status: GATT_SUCCESS,
                    connected: true,
                });
                let _ = events.send(ServerEvent::MtuChanged {
                    device: self.device.clone(),
                    mtu: LOOPBACK_MTU,
                });
                let _ = tx.send(LinkEvent::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    connected: true,
                });
                true
            }
            (failure, _) => {
                let status = failure.unwrap_or(GATT_ERROR);
                debug!("Loopback connect to {} failed with status {}", peer, status);
                let _ = tx.send(LinkEvent::ConnectionStateChanged {
                    status,
                    connected: false,
                });
                false
            }
        };

        state.links.insert(
            id,
            LinkEndpoint {
                central: self.device.clone(),
                server: peer.address().clone(),
                events: tx,
                connected,
                notifications_enabled: false,
                subscribed: false,
            },
        );

        let link = LoopbackLink {
            radio: self.radio.clone(),
            id,
        };
        Ok((link, rx))
    }
}

/// One client link on a [`LoopbackRadio`]
#[derive(Debug)]
pub struct LoopbackLink {
    radio: LoopbackRadio,
    id: u64,
}

impl LoopbackLink {
    /// Deliver a write request to the server end
    fn write_request(&self, value: &[u8], descriptor: bool) -> GattStatus {
        let mut state = self.radio.lock();
        if state.take_busy() {
            return GattStatus::Busy;
        }
        let request_id = state.next_request_id();
        let Some(link) = state.links.get_mut(&self.id) else {
            return GattStatus::Failure(GATT_FAILURE);
        };
        if !link.connected {
            return GattStatus::Failure(GATT_ERROR);
        }
        if descriptor {
            link.subscribed = value == ENABLE_NOTIFICATION_VALUE;
        }
        let request = WriteRequest {
            device: link.central.clone(),
            request_id,
            prepared_write: false,
            response_needed: true,
            offset: 0,
            value: Some(value.to_vec()),
        };
        let server = link.server.clone();
        let event = if descriptor {
            ServerEvent::DescriptorWriteRequest(request)
        } else {
            ServerEvent::CharacteristicWriteRequest(request)
        };
        match state.server_sender(&server) {
            Some(events) if events.send(event).is_ok() => GattStatus::Success,
            _ => GattStatus::Failure(GATT_FAILURE),
        }
    }
}

#[async_trait]
impl GattLink for LoopbackLink {
    async fn discover_services(&self) -> bool {
        let mut state = self.radio.lock();
        let failure = state.faults.service_discovery_failure.take();
        let Some(link) = state.links.get(&self.id) else {
            return false;
        };
        if !link.connected {
            return false;
        }
        let service_found = state
            .servers
            .get(&link.server)
            .and_then(|s| s.service.as_ref())
            .map(|s| s.characteristic(EMOB_CHARACTERISTIC_UUID).is_some())
            .unwrap_or(false);
        let event = match failure {
            Some(status) => LinkEvent::ServicesDiscovered {
                status,
                service_found: false,
            },
            None => LinkEvent::ServicesDiscovered {
                status: GATT_SUCCESS,
                service_found,
            },
        };
        link.events.send(event).is_ok()
    }

    async fn set_characteristic_notification(&self, enable: bool) -> bool {
        match self.radio.lock().links.get_mut(&self.id) {
            Some(link) if link.connected => {
                link.notifications_enabled = enable;
                true
            }
            _ => false,
        }
    }

    async fn write_characteristic(&self, value: &[u8]) -> GattStatus {
        trace!("Loopback write: {}", hex::encode_upper(value));
        self.write_request(value, false)
    }

    async fn write_descriptor(&self, value: &[u8]) -> GattStatus {
        self.write_request(value, true)
    }

    async fn disconnect(&self) {
        self.radio.lock().drop_link(self.id);
    }

    async fn close(&self) {
        let mut state = self.radio.lock();
        if state.links.remove(&self.id).is_some() {
            state.link_closes += 1;
        }
    }
}

// ----------------------------------------------------------------------------
// Peripheral Side
// ----------------------------------------------------------------------------

/// Peripheral endpoint on a [`LoopbackRadio`]
#[derive(Debug, Clone)]
pub struct LoopbackPeripheral {
    radio: LoopbackRadio,
    device: PeerDevice,
}

impl LoopbackPeripheral {
    pub fn device(&self) -> &PeerDevice {
        &self.device
    }
}

#[async_trait]
impl Peripheral for LoopbackPeripheral {
    async fn open_server(&self, service: &ServiceDefinition) -> Result<ServerEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.radio.lock();
        let endpoint = state
            .servers
            .entry(self.device.address().clone())
            .or_insert_with(|| ServerEndpoint {
                device: self.device.clone(),
                service: None,
                events: None,
                advertised_service: None,
            });
        endpoint.service = Some(service.clone());
        endpoint.events = Some(tx);
        Ok(rx)
    }

    async fn start_advertising(&self, service: Uuid, device_name: &str) -> Result<()> {
        let mut state = self.radio.lock();
        if std::mem::take(&mut state.faults.refuse_advertise) {
            return Err(EmobError::permission_denied("start advertising"));
        }
        let failure = state.faults.advertise_failure.take();
        let Some(endpoint) = state.servers.get_mut(self.device.address()) else {
            return Err(EmobError::transport("advertising requires an open server"));
        };
        let Some(events) = endpoint.events.clone() else {
            return Err(EmobError::transport("advertising requires an open server"));
        };

        if let Some(code) = failure {
            let _ = events.send(ServerEvent::AdvertiseFailed { code });
            return Ok(());
        }

        endpoint.device =
            PeerDevice::new(Some(device_name.to_string()), self.device.address().clone());
        endpoint.advertised_service = Some(service);
        let advertised = endpoint.device.clone();
        let _ = events.send(ServerEvent::AdvertiseStarted);

        for scan in state.scans.values() {
            if scan.service == service {
                let _ = scan.events.send(DiscoveryEvent::Found(advertised.clone()));
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.radio.lock();
        if state.faults.deny_stop_advertising {
            return Err(EmobError::permission_denied("stop advertising"));
        }
        if let Some(endpoint) = state.servers.get_mut(self.device.address()) {
            endpoint.advertised_service = None;
        }
        Ok(())
    }

    async fn close_server(&self) -> Result<()> {
        let mut state = self.radio.lock();
        if state.faults.deny_close_server {
            return Err(EmobError::permission_denied("close server"));
        }
        let ids: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, link)| link.server == *self.device.address())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.drop_link(id);
        }
        if let Some(endpoint) = state.servers.get_mut(self.device.address()) {
            endpoint.events = None;
            endpoint.service = None;
        }
        Ok(())
    }

    async fn send_response(
        &self,
        device: &PeerDevice,
        request_id: i32,
        status: i32,
        offset: i32,
        _value: Option<&[u8]>,
    ) -> bool {
        self.radio.lock().responses.push(ResponseRecord {
            device: device.address().clone(),
            request_id,
            status,
            offset,
        });
        true
    }

    async fn notify(&self, device: &PeerDevice, value: &[u8]) -> GattStatus {
        let mut state = self.radio.lock();
        if state.take_busy_notification() {
            return GattStatus::Busy;
        }
        let server = self.device.address();
        let link = state
            .links
            .values()
            .find(|l| {
                l.connected && l.central.address() == device.address() && &l.server == server
            });
        let Some(link) = link else {
            return GattStatus::Failure(GATT_ERROR);
        };
        if !(link.subscribed && link.notifications_enabled) {
            return GattStatus::Failure(GATT_FAILURE);
        }
        let _ = link.events.send(LinkEvent::CharacteristicChanged {
            value: value.to_vec(),
        });
        if let Some(events) = state.server_sender(server) {
            let _ = events.send(ServerEvent::NotificationSent {
                device: device.clone(),
                status: GATT_SUCCESS,
            });
        }
        GattStatus::Success
    }
}
