//! BLE scanning functionality.
//!
//! Provides the scanner for discovering HelpBeacon trackers by name.

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::ble::uuids::matches_name_filter;
use crate::error::{Error, Result};

/// A peripheral found during scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    /// The BLE peripheral identifier.
    pub identifier: String,
    /// Advertised local name.
    pub name: String,
    /// Signal strength in dBm at discovery time.
    pub rssi: Option<i16>,
    /// The peripheral handle.
    pub peripheral: Peripheral,
}

/// BLE scanner for discovering trackers.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Substring the advertised name must contain.
    name_filter: String,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Discovered peripherals, deduplicated by identifier.
    discovered: Arc<RwLock<HashMap<String, DiscoveredPeripheral>>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<DiscoveredPeripheral>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a new BLE scanner on an adapter.
    pub fn with_adapter(adapter: Adapter, name_filter: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            name_filter: name_filter.into(),
            is_scanning: Arc::new(RwLock::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning for trackers.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for trackers matching {:?}", self.name_filter);

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let name_filter = self.name_filter.clone();
        let is_scanning = self.is_scanning.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        match event {
                            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                                trace!("Device seen: {:?}", id);
                                Self::process_peripheral(
                                    &adapter,
                                    id,
                                    &name_filter,
                                    &discovered,
                                    &event_tx,
                                ).await;
                            }
                            _ => {}
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if !*is_scanning.read() {
                            break;
                        }
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning for trackers.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Get all discovered peripherals.
    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.discovered.read().values().cloned().collect()
    }

    /// Look up a discovered peripheral by identifier.
    pub fn get(&self, identifier: &str) -> Option<DiscoveredPeripheral> {
        self.discovered.read().get(identifier).cloned()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredPeripheral> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Record a peripheral if its name matches and it has not been seen yet.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        name_filter: &str,
        discovered: &Arc<RwLock<HashMap<String, DiscoveredPeripheral>>>,
        event_tx: &broadcast::Sender<DiscoveredPeripheral>,
    ) {
        let identifier = id.to_string();
        if discovered.read().contains_key(&identifier) {
            return;
        }

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        if !matches_name_filter(properties.local_name.as_deref(), name_filter) {
            return;
        }

        let event = DiscoveredPeripheral {
            identifier: identifier.clone(),
            name: properties.local_name.unwrap_or_default(),
            rssi: properties.rssi,
            peripheral,
        };

        info!("Discovered tracker {} ({})", event.name, identifier);

        discovered.write().insert(identifier, event.clone());

        let _ = event_tx.send(event);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
