//! Phone GPS fallback.
//!
//! While the tracker reports that it has no fix, the phone's own location
//! sensor stands in for it. [`PhoneLocationFallback`] owns at most one watch
//! on a platform [`LocationProvider`]; samples and sensor errors are delivered
//! as [`FallbackEvent`]s on the session's channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;

/// Parameters of a continuous location watch.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WatchOptions {
    /// Request the most accurate positioning available.
    pub high_accuracy: bool,
    /// Minimum movement in meters before a new sample is reported.
    pub distance_filter_m: f64,
    /// Nominal interval between samples.
    pub interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            distance_filter_m: 50.0,
            interval: Duration::from_secs(10),
        }
    }
}

/// Handle of a running platform watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// A position reported by the phone's sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct PhoneFix {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: i64,
    /// Reported horizontal accuracy in meters.
    pub accuracy_m: Option<f64>,
}

/// Event emitted by a location watch.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackEvent {
    /// A new position.
    Sample(PhoneFix),
    /// The sensor reported an error; the watch stays registered.
    Error(String),
}

/// The phone's location sensor.
///
/// Implemented by the platform layer. Permissions are acquired before the
/// relay is started.
#[cfg_attr(test, mockall::automock)]
pub trait LocationProvider: Send + Sync {
    /// Begin a continuous watch delivering events to `events`.
    fn watch(
        &self,
        options: &WatchOptions,
        events: mpsc::UnboundedSender<FallbackEvent>,
    ) -> Result<WatchId>;

    /// Cancel a watch started by [`LocationProvider::watch`].
    fn clear_watch(&self, watch: WatchId);
}

/// Owns the single phone location watch of a connection.
pub struct PhoneLocationFallback {
    provider: Arc<dyn LocationProvider>,
    options: WatchOptions,
    events: mpsc::UnboundedSender<FallbackEvent>,
    active: Option<WatchId>,
}

impl PhoneLocationFallback {
    /// Create an inactive fallback.
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        options: WatchOptions,
        events: mpsc::UnboundedSender<FallbackEvent>,
    ) -> Self {
        Self {
            provider,
            options,
            events,
            active: None,
        }
    }

    /// Start watching. No-op while a watch is already active.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the watch cannot be started.
    pub fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            debug!("Phone location watch already active");
            return Ok(());
        }

        let watch = self.provider.watch(&self.options, self.events.clone())?;
        info!("Started phone location fallback ({:?})", watch);
        self.active = Some(watch);

        Ok(())
    }

    /// Stop watching. No-op when inactive.
    pub fn stop(&mut self) {
        if let Some(watch) = self.active.take() {
            self.provider.clear_watch(watch);
            info!("Stopped phone location fallback ({:?})", watch);
        }
    }

    /// Check if a watch is running.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for PhoneLocationFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use mockall::predicate::eq;

    fn fallback(provider: MockLocationProvider) -> PhoneLocationFallback {
        let (tx, _rx) = mpsc::unbounded_channel();
        PhoneLocationFallback::new(Arc::new(provider), WatchOptions::default(), tx)
    }

    #[test]
    fn test_default_watch_options() {
        let options = WatchOptions::default();
        assert!(options.high_accuracy);
        assert!((options.distance_filter_m - 50.0).abs() < f64::EPSILON);
        assert_eq!(options.interval, Duration::from_secs(10));
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut provider = MockLocationProvider::new();
        provider
            .expect_watch()
            .times(1)
            .returning(|_, _| Ok(WatchId(7)));
        provider
            .expect_clear_watch()
            .with(eq(WatchId(7)))
            .times(1)
            .return_const(());

        let mut fallback = fallback(provider);
        fallback.start().unwrap();
        fallback.start().unwrap();
        assert!(fallback.is_active());

        fallback.stop();
        assert!(!fallback.is_active());
    }

    #[test]
    fn test_stop_when_inactive_is_noop() {
        let provider = MockLocationProvider::new();
        let mut fallback = fallback(provider);
        fallback.stop();
        fallback.stop();
        assert!(!fallback.is_active());
    }

    #[test]
    fn test_failed_start_stays_inactive() {
        let mut provider = MockLocationProvider::new();
        provider.expect_watch().times(1).returning(|_, _| {
            Err(Error::LocationUnavailable {
                reason: "denied".to_string(),
            })
        });

        let mut fallback = fallback(provider);
        assert!(fallback.start().is_err());
        assert!(!fallback.is_active());
    }

    #[test]
    fn test_drop_clears_active_watch() {
        let mut provider = MockLocationProvider::new();
        provider
            .expect_watch()
            .times(1)
            .returning(|_, _| Ok(WatchId(1)));
        provider.expect_clear_watch().times(1).return_const(());

        let mut fallback = fallback(provider);
        fallback.start().unwrap();
        drop(fallback);
    }

    #[test]
    fn test_watch_receives_sender() {
        let mut provider = MockLocationProvider::new();
        provider.expect_watch().times(1).returning(|_, events| {
            events
                .send(FallbackEvent::Error("no signal".to_string()))
                .unwrap();
            Ok(WatchId(3))
        });
        provider.expect_clear_watch().times(1).return_const(());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fallback =
            PhoneLocationFallback::new(Arc::new(provider), WatchOptions::default(), tx);
        fallback.start().unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            FallbackEvent::Error("no signal".to_string())
        );
    }
}
