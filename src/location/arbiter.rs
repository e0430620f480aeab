//! Location source arbitration.
//!
//! The [`LocationArbiter`] consumes parsed telemetry messages and phone
//! fallback events for one connection and decides which source is
//! authoritative:
//!
//! | Input            | Effect                                                    |
//! |------------------|-----------------------------------------------------------|
//! | `Searching`      | notify backend (throttled), start phone fallback          |
//! | `EmergencyFix`   | stop fallback, upload fix, show on map                    |
//! | `LocalFix`       | stop fallback, show on map only                           |
//! | phone sample     | upload if first or moved beyond threshold (fallback only) |

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::backend::{MapDisplay, UploadDispatcher, UploadOutcome};
use crate::location::fallback::{FallbackEvent, PhoneLocationFallback};
use crate::location::sample::{LocationSample, LocationSource};
use crate::location::upload_gate::UploadGate;
use crate::protocol::ProtocolMessage;

/// Which source currently drives location updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArbiterMode {
    /// Waiting for, or following, the tracker's own fixes.
    #[default]
    AwaitingFix,
    /// The tracker has no fix; the phone's sensor stands in.
    PhoneFallbackActive,
    /// Local-direct sharing; positions are displayed, never persisted.
    LocalDirect,
}

impl std::fmt::Display for ArbiterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingFix => write!(f, "AwaitingFix"),
            Self::PhoneFallbackActive => write!(f, "PhoneFallbackActive"),
            Self::LocalDirect => write!(f, "LocalDirect"),
        }
    }
}

/// Per-connection arbitration state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArbiterState {
    /// Current mode.
    pub mode: ArbiterMode,
    /// A searching notification was offered since the last fix.
    pub has_sent_initial_search: bool,
    /// Last phone sample the backend accepted during this fallback episode.
    pub last_phone_sample: Option<LocationSample>,
    /// When the last searching notification was dispatched.
    pub last_emergency_notify_at_ms: Option<i64>,
    /// When the backend last accepted any upload.
    pub last_upload_at_ms: Option<i64>,
    /// Incremented on every entry into [`ArbiterMode::PhoneFallbackActive`].
    pub fallback_episode: u64,
}

/// Decides the authoritative location source for one connection.
pub struct LocationArbiter {
    device_id: String,
    state: ArbiterState,
    gate: UploadGate,
    fallback: PhoneLocationFallback,
    uploads: UploadDispatcher,
    map: Arc<dyn MapDisplay>,
}

impl LocationArbiter {
    /// Create an arbiter in [`ArbiterMode::AwaitingFix`].
    pub fn new(
        device_id: impl Into<String>,
        gate: UploadGate,
        fallback: PhoneLocationFallback,
        uploads: UploadDispatcher,
        map: Arc<dyn MapDisplay>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            state: ArbiterState::default(),
            gate,
            fallback,
            uploads,
            map,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ArbiterState {
        &self.state
    }

    /// Current mode.
    pub fn mode(&self) -> ArbiterMode {
        self.state.mode
    }

    /// Check if the phone fallback watch is running.
    pub fn is_fallback_active(&self) -> bool {
        self.fallback.is_active()
    }

    /// Apply a parsed telemetry message.
    pub fn handle_message(&mut self, message: &ProtocolMessage, now_ms: i64) {
        match message {
            ProtocolMessage::Searching => self.on_searching(now_ms),
            ProtocolMessage::EmergencyFix {
                timestamp_ms,
                lat,
                lon,
            } => self.on_emergency_fix(*timestamp_ms, *lat, *lon, now_ms),
            ProtocolMessage::LocalFix { id, lat, lon } => self.on_local_fix(id, *lat, *lon),
        }
    }

    /// Apply an event from the phone location watch.
    pub fn handle_fallback_event(&mut self, event: FallbackEvent, now_ms: i64) {
        match event {
            FallbackEvent::Sample(fix) => {
                if self.state.mode != ArbiterMode::PhoneFallbackActive {
                    trace!("Ignoring phone sample outside fallback mode");
                    return;
                }
                let sample =
                    LocationSample::phone_fix(self.device_id.as_str(), fix.lat, fix.lon, fix.captured_at_ms)
                        .in_episode(self.state.fallback_episode);
                self.offer(sample, now_ms);
            }
            FallbackEvent::Error(reason) => {
                warn!("Phone location error: {}", reason);
            }
        }
    }

    /// Apply the result of a finished upload.
    pub fn handle_upload_outcome(&mut self, outcome: UploadOutcome, now_ms: i64) {
        if !outcome.succeeded {
            return;
        }

        // A phone sample only counts toward the episode it was taken in.
        if outcome.sample.source == LocationSource::Phone
            && (self.state.mode != ArbiterMode::PhoneFallbackActive
                || outcome.sample.episode != self.state.fallback_episode)
        {
            self.state.last_upload_at_ms = Some(now_ms);
            return;
        }

        self.gate
            .record_success(&mut self.state, &outcome.sample, now_ms);
    }

    /// Stop the phone fallback. Called on every teardown path.
    pub fn shutdown(&mut self) {
        self.fallback.stop();
    }

    fn on_searching(&mut self, now_ms: i64) {
        if self.state.has_sent_initial_search && self.state.mode == ArbiterMode::PhoneFallbackActive {
            debug!("Tracker still searching, fallback already active");
            return;
        }

        self.offer(LocationSample::searching(self.device_id.as_str(), now_ms), now_ms);
        self.state.has_sent_initial_search = true;

        if self.state.mode != ArbiterMode::PhoneFallbackActive {
            info!("Tracker {} has no fix, switching to phone GPS", self.device_id);
            self.state.last_phone_sample = None;
            self.state.fallback_episode += 1;
            self.set_mode(ArbiterMode::PhoneFallbackActive);
        }

        if let Err(e) = self.fallback.start() {
            warn!("Could not start phone location fallback: {}", e);
        }
    }

    fn on_emergency_fix(&mut self, timestamp_ms: u64, lat: f64, lon: f64, now_ms: i64) {
        self.fallback.stop();
        self.set_mode(ArbiterMode::AwaitingFix);
        self.state.has_sent_initial_search = false;

        let captured_at_ms = i64::try_from(timestamp_ms).unwrap_or(i64::MAX);
        self.offer(
            LocationSample::ble_fix(self.device_id.as_str(), lat, lon, captured_at_ms),
            now_ms,
        );
        self.map.show_position(lat, lon);
    }

    fn on_local_fix(&mut self, id: &str, lat: f64, lon: f64) {
        self.fallback.stop();
        self.set_mode(ArbiterMode::LocalDirect);
        self.state.has_sent_initial_search = false;

        self.map.show_marker(id, lat, lon, &format!("Local {}", id));
    }

    fn offer(&mut self, sample: LocationSample, now_ms: i64) {
        let decision = self.gate.evaluate(&self.state, &sample, now_ms);
        if !decision.should_upload() {
            debug!("Skipping {} upload: {}", sample.source, decision);
            return;
        }

        self.gate.record_dispatch(&mut self.state, &sample, now_ms);
        self.uploads.dispatch(sample);
    }

    fn set_mode(&mut self, mode: ArbiterMode) {
        if self.state.mode != mode {
            debug!("Arbiter mode changed: {} -> {}", self.state.mode, mode);
            self.state.mode = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{settle, RecordingStore};
    use crate::backend::{MockMapDisplay, StaticIdentity};
    use crate::location::fallback::{MockLocationProvider, PhoneFix, WatchId, WatchOptions};
    use mockall::predicate::{always, eq};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const DEVICE: &str = "AA:BB:CC";

    struct Harness {
        arbiter: LocationArbiter,
        store: Arc<RecordingStore>,
        outcomes: mpsc::UnboundedReceiver<UploadOutcome>,
    }

    impl Harness {
        fn new(provider: MockLocationProvider, map: MockMapDisplay) -> Self {
            let store = Arc::new(RecordingStore::default());
            let (fallback_tx, _fallback_rx) = mpsc::unbounded_channel();
            let (outcome_tx, outcomes) = mpsc::unbounded_channel();

            let fallback =
                PhoneLocationFallback::new(Arc::new(provider), WatchOptions::default(), fallback_tx);
            let uploads = UploadDispatcher::new(store.clone(), Arc::new(StaticIdentity(None)), outcome_tx);

            Self {
                arbiter: LocationArbiter::new(DEVICE, UploadGate::default(), fallback, uploads, Arc::new(map)),
                store,
                outcomes,
            }
        }

        /// Run pending uploads and feed their outcomes back.
        async fn pump(&mut self, now_ms: i64) {
            settle().await;
            while let Ok(outcome) = self.outcomes.try_recv() {
                self.arbiter.handle_upload_outcome(outcome, now_ms);
            }
        }
    }

    fn provider_started_once() -> MockLocationProvider {
        let mut provider = MockLocationProvider::new();
        provider
            .expect_watch()
            .times(1)
            .returning(|_, _| Ok(WatchId(1)));
        provider
            .expect_clear_watch()
            .with(eq(WatchId(1)))
            .times(1)
            .return_const(());
        provider
    }

    fn phone(lat: f64, lon: f64) -> FallbackEvent {
        FallbackEvent::Sample(PhoneFix {
            lat,
            lon,
            captured_at_ms: 0,
            accuracy_m: Some(5.0),
        })
    }

    #[tokio::test]
    async fn test_repeated_searching_uploads_once() {
        let mut h = Harness::new(provider_started_once(), MockMapDisplay::new());

        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.handle_message(&ProtocolMessage::Searching, 5_000);
        h.pump(5_000).await;

        assert_eq!(h.store.count(), 1);
        let (key, payload) = &h.store.writes()[0];
        assert_eq!(key, "AA_BB_CC");
        assert!(payload.is_initial);
        assert_eq!((payload.lat, payload.lon), (0.0, 0.0));
        assert_eq!(h.arbiter.mode(), ArbiterMode::PhoneFallbackActive);
        assert!(h.arbiter.is_fallback_active());
        assert!(h.arbiter.state().has_sent_initial_search);
    }

    #[tokio::test]
    async fn test_searching_after_fix_respects_window() {
        let mut map = MockMapDisplay::new();
        map.expect_show_position().times(1).return_const(());

        let mut provider = MockLocationProvider::new();
        provider
            .expect_watch()
            .times(2)
            .returning(|_, _| Ok(WatchId(1)));
        provider.expect_clear_watch().times(2).return_const(());

        let mut h = Harness::new(provider, map);

        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.handle_message(
            &ProtocolMessage::EmergencyFix {
                timestamp_ms: 1,
                lat: 1.0,
                lon: 2.0,
            },
            1_000,
        );
        // Re-enters fallback, but the notification is still inside the window.
        h.arbiter.handle_message(&ProtocolMessage::Searching, 10_000);
        h.pump(10_000).await;

        let initial = h
            .store
            .writes()
            .iter()
            .filter(|(_, p)| p.is_initial)
            .count();
        assert_eq!(initial, 1);
        assert_eq!(h.store.count(), 2);
        assert_eq!(h.arbiter.mode(), ArbiterMode::PhoneFallbackActive);
    }

    #[tokio::test]
    async fn test_fix_suppresses_fallback() {
        let mut map = MockMapDisplay::new();
        map.expect_show_position()
            .with(eq(52.5), eq(13.4))
            .times(1)
            .return_const(());

        let mut h = Harness::new(provider_started_once(), map);

        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.handle_fallback_event(phone(48.1351, 11.5820), 1_000);
        h.pump(1_000).await;
        assert_eq!(h.store.count(), 2);

        h.arbiter.handle_message(
            &ProtocolMessage::EmergencyFix {
                timestamp_ms: 1000,
                lat: 52.5,
                lon: 13.4,
            },
            2_000,
        );
        assert!(!h.arbiter.is_fallback_active());
        assert_eq!(h.arbiter.mode(), ArbiterMode::AwaitingFix);
        assert!(!h.arbiter.state().has_sent_initial_search);

        // Late sample from the cancelled watch is ignored.
        h.arbiter.handle_fallback_event(phone(48.2, 11.6), 3_000);
        h.pump(3_000).await;

        let writes = h.store.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2].1.source, LocationSource::Ble);
        assert_eq!(writes[2].1.boot_time_ms, 1000);
        assert!(!writes[2].1.is_initial);
    }

    #[tokio::test]
    async fn test_every_fix_is_uploaded() {
        let mut map = MockMapDisplay::new();
        map.expect_show_position().times(3).return_const(());

        let mut h = Harness::new(MockLocationProvider::new(), map);
        for i in 0..3 {
            h.arbiter.handle_message(
                &ProtocolMessage::EmergencyFix {
                    timestamp_ms: i,
                    lat: 52.5,
                    lon: 13.4,
                },
                i as i64,
            );
        }
        h.pump(10).await;

        assert_eq!(h.store.count(), 3);
        assert_eq!(h.arbiter.state().last_upload_at_ms, Some(10));
    }

    #[tokio::test]
    async fn test_local_mode_is_display_only() {
        let mut map = MockMapDisplay::new();
        map.expect_show_marker()
            .with(eq("42"), eq(48.10), eq(11.50), always())
            .times(1)
            .return_const(());

        let mut h = Harness::new(MockLocationProvider::new(), map);
        h.arbiter.handle_message(
            &ProtocolMessage::LocalFix {
                id: "42".to_string(),
                lat: 48.10,
                lon: 11.50,
            },
            0,
        );
        h.pump(0).await;

        assert_eq!(h.store.count(), 0);
        assert_eq!(h.arbiter.mode(), ArbiterMode::LocalDirect);
    }

    #[tokio::test]
    async fn test_local_fix_stops_fallback() {
        let mut map = MockMapDisplay::new();
        map.expect_show_marker().times(1).return_const(());

        let mut h = Harness::new(provider_started_once(), map);
        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.handle_message(
            &ProtocolMessage::LocalFix {
                id: "1".to_string(),
                lat: 1.0,
                lon: 1.0,
            },
            10,
        );

        assert!(!h.arbiter.is_fallback_active());
        assert!(!h.arbiter.state().has_sent_initial_search);
    }

    #[tokio::test]
    async fn test_phone_samples_throttled_by_distance() {
        let mut h = Harness::new(provider_started_once(), MockMapDisplay::new());
        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.pump(0).await;

        h.arbiter.handle_fallback_event(phone(48.1351, 11.5820), 10_000);
        h.pump(10_000).await;

        // ~5m away: dropped.
        h.arbiter.handle_fallback_event(phone(48.13514, 11.58204), 20_000);
        h.pump(20_000).await;

        // ~53m from the last uploaded sample: uploaded.
        h.arbiter.handle_fallback_event(phone(48.1355, 11.5824), 30_000);
        h.pump(30_000).await;

        let phone_writes: Vec<_> = h
            .store
            .writes()
            .into_iter()
            .filter(|(_, p)| p.source == LocationSource::Phone)
            .map(|(_, p)| (p.lat, p.lon))
            .collect();
        assert_eq!(phone_writes, vec![(48.1351, 11.5820), (48.1355, 11.5824)]);
        assert_eq!(
            h.arbiter
                .state()
                .last_phone_sample
                .as_ref()
                .map(|s| (s.lat, s.lon)),
            Some((48.1355, 11.5824))
        );
    }

    #[tokio::test]
    async fn test_failed_phone_upload_is_not_remembered() {
        let store = Arc::new(RecordingStore::failing());
        let (fallback_tx, _fallback_rx) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
        let fallback = PhoneLocationFallback::new(
            Arc::new(provider_started_once()),
            WatchOptions::default(),
            fallback_tx,
        );
        let uploads = UploadDispatcher::new(store.clone(), Arc::new(StaticIdentity(None)), outcome_tx);
        let mut arbiter = LocationArbiter::new(
            DEVICE,
            UploadGate::default(),
            fallback,
            uploads,
            Arc::new(MockMapDisplay::new()),
        );

        arbiter.handle_message(&ProtocolMessage::Searching, 0);
        arbiter.handle_fallback_event(phone(48.1351, 11.5820), 1_000);
        settle().await;
        while let Ok(outcome) = outcomes.try_recv() {
            arbiter.handle_upload_outcome(outcome, 1_000);
        }

        assert_eq!(arbiter.state().last_phone_sample, None);
        assert_eq!(arbiter.state().last_upload_at_ms, None);

        // Same spot again is still treated as the first sample.
        arbiter.handle_fallback_event(phone(48.1351, 11.5820), 2_000);
        settle().await;
        assert_eq!(store.count(), 3);
    }

    #[tokio::test]
    async fn test_outcome_from_previous_fallback_episode_is_ignored() {
        let mut map = MockMapDisplay::new();
        map.expect_show_position().times(1).return_const(());

        let mut provider = MockLocationProvider::new();
        provider
            .expect_watch()
            .times(2)
            .returning(|_, _| Ok(WatchId(1)));
        provider.expect_clear_watch().times(2).return_const(());

        let mut h = Harness::new(provider, map);

        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.handle_fallback_event(phone(48.1351, 11.5820), 1_000);
        h.arbiter.handle_message(
            &ProtocolMessage::EmergencyFix {
                timestamp_ms: 5,
                lat: 52.5,
                lon: 13.4,
            },
            2_000,
        );
        h.arbiter.handle_message(&ProtocolMessage::Searching, 40_000);
        assert_eq!(h.arbiter.state().fallback_episode, 2);

        // The first episode's upload finishes only now.
        h.pump(40_000).await;
        assert_eq!(h.arbiter.state().last_phone_sample, None);
        assert_eq!(h.arbiter.state().last_upload_at_ms, Some(40_000));

        // ~5m from the first episode's sample, but first of this episode.
        h.arbiter.handle_fallback_event(phone(48.13514, 11.58204), 50_000);
        h.pump(50_000).await;

        let phone_writes: Vec<_> = h
            .store
            .writes()
            .into_iter()
            .filter(|(_, p)| p.source == LocationSource::Phone)
            .map(|(_, p)| (p.lat, p.lon))
            .collect();
        assert_eq!(phone_writes, vec![(48.1351, 11.5820), (48.13514, 11.58204)]);
        assert_eq!(
            h.arbiter
                .state()
                .last_phone_sample
                .as_ref()
                .map(|s| (s.lat, s.lon, s.episode)),
            Some((48.13514, 11.58204, 2))
        );
    }

    #[tokio::test]
    async fn test_phone_error_is_logged_only() {
        let mut h = Harness::new(provider_started_once(), MockMapDisplay::new());
        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter
            .handle_fallback_event(FallbackEvent::Error("timeout".to_string()), 1);
        h.pump(1).await;

        assert_eq!(h.store.count(), 1);
        assert_eq!(h.arbiter.mode(), ArbiterMode::PhoneFallbackActive);
    }

    #[tokio::test]
    async fn test_shutdown_stops_fallback_once() {
        let mut h = Harness::new(provider_started_once(), MockMapDisplay::new());
        h.arbiter.handle_message(&ProtocolMessage::Searching, 0);
        h.arbiter.shutdown();
        h.arbiter.shutdown();
        assert!(!h.arbiter.is_fallback_active());
    }
}
