//! Upload throttling policy.
//!
//! Decides whether a candidate [`LocationSample`] is written to the backend:
//!
//! - "searching" notifications at most once per window per device
//! - tracker fixes always (the tracker's send interval already limits them)
//! - phone fixes when they are the first since the fallback started or have
//!   moved beyond the distance threshold from the last uploaded phone fix

use std::fmt;

use crate::location::arbiter::ArbiterState;
use crate::location::sample::{LocationSample, LocationSource};
use crate::utils::haversine_distance_m;

/// Why a sample was or was not uploaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadDecision {
    /// Upload the sample.
    Upload,
    /// A searching notification was already sent inside the window.
    WithinNotifyWindow {
        /// Milliseconds since the previous notification.
        elapsed_ms: i64,
    },
    /// The phone has not moved far enough.
    BelowDistanceThreshold {
        /// Distance from the last uploaded phone sample.
        distance_m: f64,
    },
}

impl UploadDecision {
    /// Check if the sample should be uploaded.
    pub fn should_upload(&self) -> bool {
        matches!(self, Self::Upload)
    }
}

impl fmt::Display for UploadDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::WithinNotifyWindow { elapsed_ms } => {
                write!(f, "searching already notified {}ms ago", elapsed_ms)
            }
            Self::BelowDistanceThreshold { distance_m } => {
                write!(f, "moved only {:.1}m", distance_m)
            }
        }
    }
}

/// Throttling and dedup rules for uploads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadGate {
    notify_window_ms: i64,
    distance_threshold_m: f64,
}

impl UploadGate {
    /// Create a gate with the given searching window and phone distance threshold.
    pub fn new(notify_window_ms: i64, distance_threshold_m: f64) -> Self {
        Self {
            notify_window_ms,
            distance_threshold_m,
        }
    }

    /// Evaluate a candidate sample against the connection's state.
    pub fn evaluate(&self, state: &ArbiterState, sample: &LocationSample, now_ms: i64) -> UploadDecision {
        match sample.source {
            LocationSource::Ble if sample.initial => match state.last_emergency_notify_at_ms {
                Some(last) if now_ms - last < self.notify_window_ms => {
                    UploadDecision::WithinNotifyWindow {
                        elapsed_ms: now_ms - last,
                    }
                }
                _ => UploadDecision::Upload,
            },
            LocationSource::Ble => UploadDecision::Upload,
            LocationSource::Phone => match &state.last_phone_sample {
                None => UploadDecision::Upload,
                Some(last) => {
                    let distance_m = haversine_distance_m(last.lat, last.lon, sample.lat, sample.lon);
                    if distance_m > self.distance_threshold_m {
                        UploadDecision::Upload
                    } else {
                        UploadDecision::BelowDistanceThreshold { distance_m }
                    }
                }
            },
        }
    }

    /// Record that `sample` was handed to the backend.
    pub fn record_dispatch(&self, state: &mut ArbiterState, sample: &LocationSample, now_ms: i64) {
        if sample.is_searching() {
            state.last_emergency_notify_at_ms = Some(now_ms);
        }
    }

    /// Record that the backend accepted `sample`.
    pub fn record_success(&self, state: &mut ArbiterState, sample: &LocationSample, now_ms: i64) {
        state.last_upload_at_ms = Some(now_ms);
        if sample.source == LocationSource::Phone {
            state.last_phone_sample = Some(sample.clone());
        }
    }
}

impl Default for UploadGate {
    fn default() -> Self {
        Self::new(30_000, 50.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEVICE: &str = "AA:BB";

    #[test]
    fn test_searching_window() {
        let gate = UploadGate::default();
        let mut state = ArbiterState::default();
        let first = LocationSample::searching(DEVICE, 1_000);

        assert_eq!(gate.evaluate(&state, &first, 1_000), UploadDecision::Upload);
        gate.record_dispatch(&mut state, &first, 1_000);
        assert_eq!(state.last_emergency_notify_at_ms, Some(1_000));

        let second = LocationSample::searching(DEVICE, 6_000);
        assert_eq!(
            gate.evaluate(&state, &second, 6_000),
            UploadDecision::WithinNotifyWindow { elapsed_ms: 5_000 }
        );

        let later = LocationSample::searching(DEVICE, 31_000);
        assert!(gate.evaluate(&state, &later, 31_000).should_upload());
    }

    #[test]
    fn test_ble_fix_always_uploads() {
        let gate = UploadGate::default();
        let mut state = ArbiterState::default();
        state.last_emergency_notify_at_ms = Some(0);
        state.last_upload_at_ms = Some(0);

        let fix = LocationSample::ble_fix(DEVICE, 52.5, 13.4, 1_000);
        assert!(gate.evaluate(&state, &fix, 10).should_upload());
        assert!(gate.evaluate(&state, &fix, 11).should_upload());
    }

    #[test]
    fn test_first_phone_sample_uploads() {
        let gate = UploadGate::default();
        let state = ArbiterState::default();
        let sample = LocationSample::phone_fix(DEVICE, 48.1351, 11.5820, 0);
        assert!(gate.evaluate(&state, &sample, 0).should_upload());
    }

    #[test]
    fn test_phone_distance_threshold() {
        let gate = UploadGate::default();
        let mut state = ArbiterState::default();

        let first = LocationSample::phone_fix(DEVICE, 48.1351, 11.5820, 0);
        gate.record_success(&mut state, &first, 0);

        // ~53m away
        let far = LocationSample::phone_fix(DEVICE, 48.1355, 11.5824, 10_000);
        assert!(gate.evaluate(&state, &far, 10_000).should_upload());

        // ~5m away
        let near = LocationSample::phone_fix(DEVICE, 48.13514, 11.58204, 10_000);
        match gate.evaluate(&state, &near, 10_000) {
            UploadDecision::BelowDistanceThreshold { distance_m } => {
                assert!(distance_m < 6.0, "got {}", distance_m)
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_record_success_tracks_only_phone_samples() {
        let gate = UploadGate::default();
        let mut state = ArbiterState::default();

        let fix = LocationSample::ble_fix(DEVICE, 1.0, 2.0, 5);
        gate.record_success(&mut state, &fix, 100);
        assert_eq!(state.last_upload_at_ms, Some(100));
        assert_eq!(state.last_phone_sample, None);

        let phone = LocationSample::phone_fix(DEVICE, 1.0, 2.0, 5);
        gate.record_success(&mut state, &phone, 200);
        assert_eq!(state.last_upload_at_ms, Some(200));
        assert_eq!(state.last_phone_sample, Some(phone));
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(UploadDecision::Upload.to_string(), "upload");
        assert_eq!(
            UploadDecision::BelowDistanceThreshold { distance_m: 5.26 }.to_string(),
            "moved only 5.3m"
        );
    }
}
