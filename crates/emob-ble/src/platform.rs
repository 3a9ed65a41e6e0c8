//! btleplug-backed central transport
//!
//! Runs the client role against the host Bluetooth adapter. btleplug has no
//! peripheral mode, so the server role needs another [`Peripheral`]
//! implementation (the loopback radio in tests and demos).
//!
//! [`Peripheral`]: emob_core::transport::Peripheral

use std::sync::Mutex;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use emob_core::protocol::{EMOB_CHARACTERISTIC_UUID, EMOB_SERVICE_UUID, ENABLE_NOTIFICATION_VALUE};
use emob_core::retry::{GattStatus, GATT_ERROR, GATT_FAILURE, GATT_SUCCESS};
use emob_core::transport::{
    Central, DiscoveryEvent, DiscoveryEvents, GattLink, LinkEvent, LinkEvents,
};
use emob_core::{EmobError, PeerDevice, PeerHandle, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::scope::BleScope;

/// Scanner code reported when the adapter refuses to scan
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

fn lock_tasks(
    tasks: &Mutex<Vec<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

/// Central role on the first host adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    scope: BleScope,
    scan_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Open the first available adapter
    pub async fn new(scope: BleScope) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| EmobError::transport(format!("Failed to create BLE manager: {}", e)))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| EmobError::transport(format!("Failed to get BLE adapters: {}", e)))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| EmobError::transport("No BLE adapters available"))?;
        info!("BLE adapter initialized");
        Ok(Self::with_adapter(adapter, scope))
    }

    pub fn with_adapter(adapter: Adapter, scope: BleScope) -> Self {
        Self {
            adapter,
            scope,
            scan_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Find the platform peripheral behind a discovered peer
    async fn resolve(&self, peer: &PeerDevice) -> Option<Peripheral> {
        if let Some(peripheral) = peer.handle().and_then(|h| h.downcast_ref::<Peripheral>()) {
            return Some(peripheral.clone());
        }
        let peripherals = self.adapter.peripherals().await.ok()?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string() == peer.address().as_str())
    }
}

/// Turn a discovered platform peripheral into a peer if it offers `service`
async fn to_peer(peripheral: Peripheral, service: Uuid) -> Option<PeerDevice> {
    let properties = peripheral.properties().await.ok().flatten()?;
    if !properties.services.is_empty() && !properties.services.contains(&service) {
        return None;
    }
    let address = properties.address.to_string();
    let peer = PeerDevice::new(properties.local_name, address.as_str());
    Some(peer.with_handle(PeerHandle::new(peripheral)))
}

#[async_trait]
impl Central for BtleplugCentral {
    type Link = BtleplugLink;

    async fn start_discovery(&self, service: Uuid) -> Result<DiscoveryEvents> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| EmobError::transport(format!("Failed to get adapter events: {}", e)))?;

        if let Err(e) = self.adapter.start_scan(ScanFilter { services: vec![service] }).await {
            error!("Failed to start BLE scan: {}", e);
            let _ = tx.send(DiscoveryEvent::Failed {
                code: SCAN_FAILED_INTERNAL_ERROR,
            });
            return Ok(rx);
        }

        let adapter = self.adapter.clone();
        let forwarder = self.scope.spawn("btleplug-discovery", async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(peer) = to_peer(peripheral, service).await {
                    if tx.send(DiscoveryEvent::Found(peer)).is_err() {
                        break;
                    }
                }
            }
            Ok(())
        });
        lock_tasks(&self.scan_tasks).push(forwarder);
        Ok(rx)
    }

    async fn stop_discovery(&self) {
        let tasks: Vec<_> = lock_tasks(&self.scan_tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
    }

    async fn connect(&self, peer: &PeerDevice) -> Result<(Self::Link, LinkEvents)> {
        let peripheral = self
            .resolve(peer)
            .await
            .ok_or(EmobError::Connection { status: GATT_ERROR })?;
        let (tx, rx) = mpsc::unbounded_channel();

        let link = BtleplugLink {
            peripheral: peripheral.clone(),
            scope: self.scope.clone(),
            events: tx.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        // Watch for the link going down once it is up
        let adapter = self.adapter.clone();
        let id = peripheral.id();
        let disconnects = tx.clone();
        let watcher = self.scope.spawn("btleplug-link-watch", async move {
            let mut events = adapter
                .events()
                .await
                .map_err(|e| EmobError::transport(format!("Failed to get adapter events: {}", e)))?;
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        let _ = disconnects.send(LinkEvent::ConnectionStateChanged {
                            status: GATT_SUCCESS,
                            connected: false,
                        });
                        break;
                    }
                }
            }
            Ok(())
        });

        let connecting = self.scope.spawn("btleplug-connect", async move {
            let event = match peripheral.connect().await {
                Ok(()) => LinkEvent::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    connected: true,
                },
                Err(e) => {
                    warn!("BLE connect failed: {}", e);
                    LinkEvent::ConnectionStateChanged {
                        status: GATT_ERROR,
                        connected: false,
                    }
                }
            };
            let _ = tx.send(event);
            Ok(())
        });
        lock_tasks(&link.tasks).extend([watcher, connecting]);

        debug!("Connecting to {} via btleplug", peer);
        Ok((link, rx))
    }
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// One btleplug connection
pub struct BtleplugLink {
    peripheral: Peripheral,
    scope: BleScope,
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == EMOB_CHARACTERISTIC_UUID)
    }

    fn status<E: std::fmt::Display>(
        operation: &str,
        result: std::result::Result<(), E>,
    ) -> GattStatus {
        match result {
            Ok(()) => GattStatus::Success,
            Err(e) => {
                error!("BLE {} failed: {}", operation, e);
                GattStatus::Failure(GATT_FAILURE)
            }
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn discover_services(&self) -> bool {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let task = self.scope.spawn("btleplug-services", async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    service_found: peripheral
                        .services()
                        .iter()
                        .any(|s| s.uuid == EMOB_SERVICE_UUID),
                },
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    LinkEvent::ServicesDiscovered {
                        status: GATT_ERROR,
                        service_found: false,
                    }
                }
            };
            let _ = events.send(event);
            Ok(())
        });
        lock_tasks(&self.tasks).push(task);
        true
    }

    async fn set_characteristic_notification(&self, enable: bool) -> bool {
        if !enable {
            return true;
        }
        let mut notifications = match self.peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to get notifications stream: {}", e);
                return false;
            }
        };
        let events = self.events.clone();
        let task = self.scope.spawn("btleplug-notifications", async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != EMOB_CHARACTERISTIC_UUID {
                    continue;
                }
                let event = LinkEvent::CharacteristicChanged {
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(())
        });
        lock_tasks(&self.tasks).push(task);
        true
    }

    async fn write_characteristic(&self, value: &[u8]) -> GattStatus {
        let Some(characteristic) = self.characteristic() else {
            return GattStatus::Failure(GATT_FAILURE);
        };
        let result = self
            .peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await;
        Self::status("write", result)
    }

    async fn write_descriptor(&self, value: &[u8]) -> GattStatus {
        let Some(characteristic) = self.characteristic() else {
            return GattStatus::Failure(GATT_FAILURE);
        };
        // btleplug writes the notification descriptor on (un)subscribe
        let result = if value == ENABLE_NOTIFICATION_VALUE {
            self.peripheral.subscribe(&characteristic).await
        } else {
            self.peripheral.unsubscribe(&characteristic).await
        };
        Self::status("subscribe", result)
    }

    async fn disconnect(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("BLE disconnect failed: {}", e);
        }
    }

    async fn close(&self) {
        let tasks: Vec<_> = lock_tasks(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}
