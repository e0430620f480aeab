//! Collaborator interfaces and the upload dispatcher.
//!
//! The relay talks to three outside parties: the backend store that keeps the
//! last known location per tracker, the map display, and the signed-in
//! identity. Uploads are fire-and-forget tasks; their outcome is reported back
//! into the connection's event loop and otherwise only logged.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::location::sample::{LocationSample, LocationSource};
use crate::utils::sanitize_device_id;

/// Record written to the backend store.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LocationPayload {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Phone wall-clock time of the upload, RFC 3339.
    pub app_timestamp: String,
    /// Tracker-reported timestamp, or the phone capture time for phone samples.
    pub boot_time_ms: i64,
    /// Unsanitized tracker identifier.
    pub device_id: String,
    /// Signed-in user, when known.
    #[cfg_attr(feature = "serde", serde(rename = "uid"))]
    pub uploader_id: Option<String>,
    /// Source of the coordinates.
    pub source: LocationSource,
    /// Zero-coordinate "searching" notification.
    pub is_initial: bool,
}

impl LocationPayload {
    /// Build the payload for `sample` at wall-clock time `now`.
    pub fn from_sample(sample: &LocationSample, uploader_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            lat: sample.lat,
            lon: sample.lon,
            app_timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            boot_time_ms: sample.captured_at_ms,
            device_id: sample.device_id.clone(),
            uploader_id,
            source: sample.source,
            is_initial: sample.initial,
        }
    }
}

/// Backend store keeping the last location per tracker.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Upsert the record stored under `key` (a sanitized device identifier).
    async fn put_location(&self, key: &str, payload: &LocationPayload) -> Result<()>;
}

/// Map display shown to the user. Calls are fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait MapDisplay: Send + Sync {
    /// Center the map on a position.
    fn show_position(&self, lat: f64, lon: f64);

    /// Place a labelled marker.
    fn show_marker(&self, id: &str, lat: f64, lon: f64, label: &str);

    /// Remove any displayed position.
    fn clear(&self);
}

/// Source of the signed-in user's identity.
pub trait IdentityProvider: Send + Sync {
    /// Identifier of the current user, if signed in.
    fn current_uploader_id(&self) -> Option<String>;
}

/// An identity that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<String>);

impl IdentityProvider for StaticIdentity {
    fn current_uploader_id(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Result of one upload, fed back into the connection's event loop.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    /// The uploaded sample.
    pub sample: LocationSample,
    /// Whether the store accepted the write.
    pub succeeded: bool,
}

/// Spawns uploads without blocking message processing.
pub struct UploadDispatcher {
    store: Arc<dyn LocationStore>,
    identity: Arc<dyn IdentityProvider>,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
}

impl UploadDispatcher {
    /// Create a dispatcher reporting outcomes to `outcomes`.
    pub fn new(
        store: Arc<dyn LocationStore>,
        identity: Arc<dyn IdentityProvider>,
        outcomes: mpsc::UnboundedSender<UploadOutcome>,
    ) -> Self {
        Self {
            store,
            identity,
            outcomes,
        }
    }

    /// Upload `sample` in the background.
    pub fn dispatch(&self, sample: LocationSample) -> JoinHandle<()> {
        let payload =
            LocationPayload::from_sample(&sample, self.identity.current_uploader_id(), Utc::now());
        let key = sanitize_device_id(&sample.device_id);
        let store = self.store.clone();
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            let succeeded = match store.put_location(&key, &payload).await {
                Ok(()) => {
                    debug!(
                        "Uploaded {} location for {} ({:.6}, {:.6})",
                        payload.source, key, payload.lat, payload.lon
                    );
                    true
                }
                Err(e) => {
                    warn!("Upload for {} failed: {}", key, e);
                    false
                }
            };

            // The session may already be gone; the outcome is then irrelevant.
            let _ = outcomes.send(UploadOutcome { sample, succeeded });
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators for tests.

    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;

    /// Store that records every write.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        writes: Mutex<Vec<(String, LocationPayload)>>,
        fail: bool,
    }

    impl RecordingStore {
        pub(crate) fn failing() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub(crate) fn writes(&self) -> Vec<(String, LocationPayload)> {
            self.writes.lock().clone()
        }

        pub(crate) fn count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    #[async_trait]
    impl LocationStore for RecordingStore {
        async fn put_location(&self, key: &str, payload: &LocationPayload) -> Result<()> {
            self.writes.lock().push((key.to_string(), payload.clone()));
            if self.fail {
                return Err(Error::Upload {
                    reason: "store offline".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Let spawned upload tasks run to completion.
    pub(crate) async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }
}
