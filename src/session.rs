//! Per-connection telemetry session.
//!
//! A [`TelemetrySession`] exists from the moment the telemetry subscription
//! is live until the connection ends. It owns the frame buffer and the
//! arbitration state; nothing of either survives a disconnect.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{IdentityProvider, LocationStore, MapDisplay, UploadDispatcher, UploadOutcome};
use crate::ble::characteristics::{decode_fragment, FragmentEncoding};
use crate::config::RelayConfig;
use crate::location::arbiter::LocationArbiter;
use crate::location::fallback::{FallbackEvent, LocationProvider, PhoneLocationFallback};
use crate::location::upload_gate::UploadGate;
use crate::protocol::{FrameAssembler, ProtocolMessage};

/// The outside parties a session talks to.
///
/// Map and location callbacks run on the connection's event loop while the
/// session is borrowed. They must not block, and may only read the manager's
/// published state ([`ConnectionManager::arbiter_mode`], `state`, `gps_output`).
///
/// [`ConnectionManager::arbiter_mode`]: crate::ble::ConnectionManager::arbiter_mode
#[derive(Clone)]
pub struct Collaborators {
    /// Backend store for uploads.
    pub store: Arc<dyn LocationStore>,
    /// Map display.
    pub map: Arc<dyn MapDisplay>,
    /// Signed-in identity.
    pub identity: Arc<dyn IdentityProvider>,
    /// Phone location sensor.
    pub location: Arc<dyn LocationProvider>,
}

/// Receivers the connection's event loop drains into the session.
pub struct SessionChannels {
    /// Phone location watch events.
    pub fallback_rx: mpsc::UnboundedReceiver<FallbackEvent>,
    /// Finished uploads.
    pub outcome_rx: mpsc::UnboundedReceiver<UploadOutcome>,
}

/// Frame buffer and arbitration state of one connection.
pub struct TelemetrySession {
    device_id: String,
    encoding: FragmentEncoding,
    assembler: FrameAssembler,
    arbiter: LocationArbiter,
}

impl TelemetrySession {
    /// Create a fresh session for `device_id`.
    pub fn new(
        device_id: impl Into<String>,
        config: &RelayConfig,
        collaborators: &Collaborators,
    ) -> (Self, SessionChannels) {
        let device_id = device_id.into();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let fallback = PhoneLocationFallback::new(
            collaborators.location.clone(),
            config.watch_options.clone(),
            fallback_tx,
        );
        let uploads = UploadDispatcher::new(
            collaborators.store.clone(),
            collaborators.identity.clone(),
            outcome_tx,
        );
        let gate = UploadGate::new(
            config.searching_notify_window_ms(),
            config.phone_distance_threshold_m,
        );
        let arbiter = LocationArbiter::new(
            device_id.as_str(),
            gate,
            fallback,
            uploads,
            collaborators.map.clone(),
        );

        info!("Telemetry session started for {}", device_id);

        let session = Self {
            device_id,
            encoding: config.fragment_encoding,
            assembler: FrameAssembler::new(config.max_frame_len),
            arbiter,
        };

        (
            session,
            SessionChannels {
                fallback_rx,
                outcome_rx,
            },
        )
    }

    /// Identifier of the connected tracker.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The arbiter driving this session.
    pub fn arbiter(&self) -> &LocationArbiter {
        &self.arbiter
    }

    /// Characters buffered since the last message boundary.
    pub fn pending_frame(&self) -> &str {
        self.assembler.pending()
    }

    /// Decode a raw notification payload and process it.
    ///
    /// Undecodable payloads are logged and dropped.
    pub fn handle_notification(&mut self, data: &[u8], now_ms: i64) -> Option<ProtocolMessage> {
        match decode_fragment(data, self.encoding) {
            Ok(fragment) => self.handle_fragment(&fragment, now_ms),
            Err(e) => {
                warn!("Dropping notification from {}: {}", self.device_id, e);
                None
            }
        }
    }

    /// Process one decoded text fragment.
    ///
    /// Returns the message the fragment completed, after the arbiter has
    /// acted on it.
    pub fn handle_fragment(&mut self, fragment: &str, now_ms: i64) -> Option<ProtocolMessage> {
        let message = self.assembler.push(fragment)?;
        debug!("Received {} from {}: {}", message.kind(), self.device_id, message);
        self.arbiter.handle_message(&message, now_ms);
        Some(message)
    }

    /// Process an event from the phone location watch.
    pub fn handle_fallback_event(&mut self, event: FallbackEvent, now_ms: i64) {
        self.arbiter.handle_fallback_event(event, now_ms);
    }

    /// Process the result of a finished upload.
    pub fn handle_upload_outcome(&mut self, outcome: UploadOutcome, now_ms: i64) {
        self.arbiter.handle_upload_outcome(outcome, now_ms);
    }

    /// End the session: stop the phone fallback and drop all state.
    pub fn teardown(mut self) {
        self.arbiter.shutdown();
        self.assembler.reset();
        info!("Telemetry session ended for {}", self.device_id);
    }
}
