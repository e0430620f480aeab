//! BLE connection management.
//!
//! The [`ConnectionManager`] owns the whole peripheral lifecycle:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> Disconnected -> Scanning
//! ```
//!
//! Only one tracker is connected at a time. While connected, a single event
//! loop task feeds notifications, phone location events and upload outcomes
//! into the connection's [`TelemetrySession`], so handlers never run
//! concurrently. An unsolicited disconnect tears the session down, releases
//! the radio lease and schedules one rescan after the configured delay.

use btleplug::api::{Central, CentralEvent, Peripheral as _, ValueNotification};
use btleplug::platform::{Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::TelemetryCharacteristic;
use crate::ble::lease::RadioLease;
use crate::ble::scanner::{BleScanner, DiscoveredPeripheral};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::location::arbiter::ArbiterMode;
use crate::protocol::ProtocolMessage;
use crate::session::{Collaborators, SessionChannels, TelemetrySession};
use crate::utils::now_ms;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing started yet, or shut down.
    #[default]
    Idle,
    /// Discovering trackers.
    Scanning,
    /// Establishing a connection.
    Connecting,
    /// Connected and subscribed to telemetry.
    Connected,
    /// The link was lost; a rescan is scheduled.
    Disconnected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connection attempt is underway.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Event for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A matching tracker was discovered.
    PeripheralDiscovered {
        /// Peripheral identifier.
        identifier: String,
        /// Advertised name.
        name: String,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// Peripheral identifier.
        identifier: String,
        /// Description of the failure.
        reason: String,
    },
    /// A complete telemetry message was received.
    MessageReceived {
        /// Peripheral identifier.
        device_id: String,
        /// The message.
        message: ProtocolMessage,
    },
    /// The displayed GPS state was cleared.
    GpsCleared,
}

/// A single pending delayed task that is replaced, not stacked, on reschedule.
#[derive(Default)]
pub(crate) struct RescanTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RescanTimer {
    /// Run `task` after `delay`, cancelling any previously scheduled task.
    pub(crate) fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
            debug!("Rescheduled pending rescan");
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Cancel the pending task, if any.
    pub(crate) fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Check if a task is scheduled and has not finished.
    pub(crate) fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type AdapterEventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

struct Inner {
    config: RelayConfig,
    collaborators: Collaborators,
    state: RwLock<ConnectionState>,
    lease: Mutex<Option<Arc<RadioLease>>>,
    lease_generation: AtomicU64,
    scanner: RwLock<Option<Arc<BleScanner>>>,
    discovery_forwarder: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<Option<TelemetrySession>>,
    arbiter_mode: RwLock<Option<ArbiterMode>>,
    peripheral: Mutex<Option<Peripheral>>,
    telemetry: Mutex<Option<TelemetryCharacteristic>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    rescan: RescanTimer,
    gps_output: RwLock<Option<String>>,
    event_tx: broadcast::Sender<RelayEvent>,
    scan_attempts: AtomicU64,
}

/// Owns tracker discovery, the connection and its telemetry session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager. The radio is not touched until [`start_scan`](Self::start_scan).
    pub fn new(config: RelayConfig, collaborators: Collaborators) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                config,
                collaborators,
                state: RwLock::new(ConnectionState::Idle),
                lease: Mutex::new(None),
                lease_generation: AtomicU64::new(0),
                scanner: RwLock::new(None),
                discovery_forwarder: Mutex::new(None),
                session: Mutex::new(None),
                arbiter_mode: RwLock::new(None),
                peripheral: Mutex::new(None),
                telemetry: Mutex::new(None),
                event_loop: Mutex::new(None),
                rescan: RescanTimer::default(),
                gps_output: RwLock::new(None),
                event_tx,
                scan_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Start discovering trackers.
    ///
    /// Radio and location permissions must already be granted.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is unavailable or the scan cannot start.
    pub async fn start_scan(&self) -> Result<()> {
        self.inner.start_scan().await
    }

    /// Stop discovering trackers.
    pub async fn stop_scan(&self) -> Result<()> {
        let scanner = self.inner.scanner.read().clone();
        if let Some(scanner) = scanner {
            scanner.stop_scanning().await?;
        }
        if self.state() == ConnectionState::Scanning {
            self.inner.set_state(ConnectionState::Idle);
        }
        Ok(())
    }

    /// Trackers found by the current scan, deduplicated by identifier.
    pub fn peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.inner
            .scanner
            .read()
            .as_ref()
            .map(|s| s.discovered())
            .unwrap_or_default()
    }

    /// Connect to a discovered tracker and subscribe to its telemetry.
    ///
    /// Any existing connection is torn down first. On failure the manager
    /// returns to [`ConnectionState::Scanning`].
    pub async fn connect(&self, identifier: &str) -> Result<()> {
        self.inner.connect(identifier).await
    }

    /// Disconnect from the current tracker without rescanning.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.rescan.cancel();

        let telemetry = self.inner.telemetry.lock().take();
        if let Some(telemetry) = telemetry {
            if let Err(e) = telemetry.unsubscribe().await {
                debug!("Unsubscribe before disconnect failed: {}", e);
            }
        }

        let peripheral = self.inner.end_connection();
        self.inner.set_state(ConnectionState::Idle);

        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await.map_err(Error::Bluetooth)?;
            info!("Disconnected from tracker");
        }

        Ok(())
    }

    /// Stop everything and release the radio.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down connection manager");

        self.disconnect().await?;
        self.stop_scan().await?;
        self.inner.release_radio();
        self.inner.set_state(ConnectionState::Idle);

        Ok(())
    }

    /// The last complete message, as shown to the user.
    pub fn gps_output(&self) -> Option<String> {
        self.inner.gps_output.read().clone()
    }

    /// Arbitration mode of the current session.
    ///
    /// Safe to call from collaborator callbacks.
    pub fn arbiter_mode(&self) -> Option<ArbiterMode> {
        *self.inner.arbiter_mode.read()
    }

    /// Check if a rescan is scheduled.
    pub fn is_rescan_pending(&self) -> bool {
        self.inner.rescan.is_pending()
    }

    /// Subscribe to relay events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.event_tx.subscribe()
    }
}

impl Inner {
    async fn start_scan(self: &Arc<Self>) -> Result<()> {
        if self.session.lock().is_some() || self.state.read().is_transitioning() {
            debug!("Connection active, not scanning");
            return Ok(());
        }

        let attempt = self.scan_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let existing = self.scanner.read().clone();
        if let Some(scanner) = existing {
            if scanner.is_scanning() {
                debug!("Already scanning");
                return Ok(());
            }
        }

        let lease = self.current_lease().await?;
        debug!(attempt, generation = lease.generation(), "Starting scan");
        let scanner = Arc::new(BleScanner::with_adapter(
            lease.adapter().clone(),
            self.config.name_filter.as_str(),
        ));
        scanner.start_scanning().await?;

        self.forward_discoveries(&scanner);
        *self.scanner.write() = Some(scanner);
        self.set_state(ConnectionState::Scanning);

        Ok(())
    }

    /// The current radio lease, acquiring a fresh one if none is held.
    async fn current_lease(&self) -> Result<Arc<RadioLease>> {
        let existing = self.lease.lock().clone();
        if let Some(lease) = existing {
            return Ok(lease);
        }

        let generation = self.lease_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lease = Arc::new(RadioLease::acquire(generation).await?);
        *self.lease.lock() = Some(lease.clone());

        Ok(lease)
    }

    fn forward_discoveries(&self, scanner: &BleScanner) {
        let mut rx = scanner.subscribe();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Ok(peripheral) = rx.recv().await {
                let _ = event_tx.send(RelayEvent::PeripheralDiscovered {
                    identifier: peripheral.identifier,
                    name: peripheral.name,
                });
            }
        });

        if let Some(previous) = self.discovery_forwarder.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn connect(self: &Arc<Self>, identifier: &str) -> Result<()> {
        let scanner = self
            .scanner
            .read()
            .clone()
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: identifier.to_string(),
            })?;
        let discovered = scanner
            .get(identifier)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: identifier.to_string(),
            })?;

        self.rescan.cancel();
        if let Err(e) = scanner.stop_scanning().await {
            warn!("Failed to stop scan before connecting: {}", e);
        }

        if let Some(previous) = self.end_connection() {
            if let Err(e) = previous.disconnect().await {
                debug!("Superseded connection did not disconnect cleanly: {}", e);
            }
        }

        let peripheral = discovered.peripheral.clone();
        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Cancelling stale connection to {}", identifier);
            if let Err(e) = peripheral.disconnect().await {
                debug!("Stale connection cancel failed: {}", e);
            }
        }

        info!("Connecting to tracker {} ({})", discovered.name, identifier);
        self.set_state(ConnectionState::Connecting);

        match self.establish(&scanner, &peripheral, identifier).await {
            Ok(()) => {
                info!("Connected to tracker {}", identifier);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", identifier, e);
                let _ = self.event_tx.send(RelayEvent::ConnectFailed {
                    identifier: identifier.to_string(),
                    reason: e.to_string(),
                });

                self.end_connection();
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    trace!("Cleanup disconnect failed: {}", disconnect_err);
                }
                if let Err(scan_err) = scanner.start_scanning().await {
                    warn!("Failed to resume scanning: {}", scan_err);
                }
                self.set_state(ConnectionState::Scanning);

                Err(e)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        scanner: &BleScanner,
        peripheral: &Peripheral,
        identifier: &str,
    ) -> Result<()> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| Error::ConnectionTimeout {
                seconds: timeout.as_secs(),
            })??;

        peripheral.discover_services().await?;
        let telemetry = TelemetryCharacteristic::locate(peripheral, self.config.service_uuid)?;

        tokio::time::sleep(self.config.subscribe_delay).await;

        let notifications = peripheral.notifications().await?;
        let adapter_events = scanner.adapter().events().await?;
        telemetry.subscribe().await?;

        let (session, channels) =
            TelemetrySession::new(identifier, &self.config, &self.collaborators);
        self.install_session(session);
        *self.peripheral.lock() = Some(peripheral.clone());
        let characteristic = telemetry.uuid();
        *self.telemetry.lock() = Some(telemetry);

        let handle = tokio::spawn(self.clone().run_event_loop(
            peripheral.id(),
            characteristic,
            notifications,
            adapter_events,
            channels,
        ));
        *self.event_loop.lock() = Some(handle);

        self.set_state(ConnectionState::Connected);

        Ok(())
    }

    async fn run_event_loop(
        self: Arc<Self>,
        peripheral_id: PeripheralId,
        characteristic: Uuid,
        mut notifications: NotificationStream,
        mut adapter_events: AdapterEventStream,
        mut channels: SessionChannels,
    ) {
        debug!("Telemetry event loop started");

        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(n) if n.uuid == characteristic => self.on_notification(&n.value),
                    Some(n) => trace!("Ignoring notification from {}", n.uuid),
                    None => {
                        info!("Notification stream ended");
                        self.handle_disconnect();
                        break;
                    }
                },
                event = adapter_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                        info!("Tracker disconnected");
                        self.handle_disconnect();
                        break;
                    }
                    Some(_) => {}
                    None => {
                        warn!("Adapter event stream ended");
                        self.handle_disconnect();
                        break;
                    }
                },
                Some(event) = channels.fallback_rx.recv() => {
                    self.with_session(|session| session.handle_fallback_event(event, now_ms()));
                }
                Some(outcome) = channels.outcome_rx.recv() => {
                    self.with_session(|session| session.handle_upload_outcome(outcome, now_ms()));
                }
            }
        }

        debug!("Telemetry event loop ended");
    }

    fn on_notification(&self, data: &[u8]) {
        let received = self
            .with_session(|session| {
                session
                    .handle_notification(data, now_ms())
                    .map(|message| (session.device_id().to_string(), message))
            })
            .flatten();

        if let Some((device_id, message)) = received {
            *self.gps_output.write() = Some(message.to_string());
            let _ = self
                .event_tx
                .send(RelayEvent::MessageReceived { device_id, message });
        }
    }

    /// Run `f` against the live session and refresh the published mode.
    ///
    /// Collaborators invoked by `f` must not block on the manager.
    fn with_session<R>(&self, f: impl FnOnce(&mut TelemetrySession) -> R) -> Option<R> {
        let mut guard = self.session.lock();
        let session = guard.as_mut()?;
        let result = f(session);
        *self.arbiter_mode.write() = Some(session.arbiter().mode());
        Some(result)
    }

    fn install_session(&self, session: TelemetrySession) {
        *self.arbiter_mode.write() = Some(session.arbiter().mode());
        *self.session.lock() = Some(session);
    }

    fn take_session(&self) -> Option<TelemetrySession> {
        let session = self.session.lock().take();
        *self.arbiter_mode.write() = None;
        session
    }

    /// React to an unsolicited disconnect. Safe to call repeatedly.
    fn handle_disconnect(self: &Arc<Self>) {
        let session = self.take_session();
        let had_session = session.is_some();
        if let Some(session) = session {
            session.teardown();
        }

        *self.peripheral.lock() = None;
        *self.telemetry.lock() = None;
        // Detach rather than abort: this may run inside the loop itself.
        drop(self.event_loop.lock().take());

        if had_session {
            self.clear_gps();
        }

        self.release_radio();
        self.set_state(ConnectionState::Disconnected);

        let inner = self.clone();
        self.rescan.schedule(self.config.rescan_delay, async move {
            info!("Rescanning after disconnect");
            if let Err(e) = inner.start_scan().await {
                error!("Rescan failed: {}", e);
            }
        });
    }

    /// Tear down the current connection state without scheduling a rescan.
    ///
    /// Returns the peripheral that was connected, if any.
    fn end_connection(&self) -> Option<Peripheral> {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }

        if let Some(session) = self.take_session() {
            session.teardown();
            self.clear_gps();
        }

        *self.telemetry.lock() = None;
        self.peripheral.lock().take()
    }

    fn clear_gps(&self) {
        *self.gps_output.write() = None;
        self.collaborators.map.clear();
        let _ = self.event_tx.send(RelayEvent::GpsCleared);
    }

    /// Drop the scanner and the radio lease; the next scan starts fresh.
    fn release_radio(&self) {
        if let Some(handle) = self.discovery_forwarder.lock().take() {
            handle.abort();
        }
        *self.scanner.write() = None;
        *self.lease.lock() = None;
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            let _ = self.event_tx.send(RelayEvent::StateChanged(new_state));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rescan.cancel();
        if let Some(handle) = self.event_loop.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.discovery_forwarder.get_mut().take() {
            handle.abort();
        }
    }
}
