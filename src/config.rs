//! Relay configuration.
//!
//! All tunables of the relay live in [`RelayConfig`]. The defaults match the
//! HelpBeacon tracker firmware and backend expectations.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::characteristics::FragmentEncoding;
use crate::ble::uuids::{DEFAULT_NAME_FILTER, TELEMETRY_SERVICE_UUID};
use crate::location::fallback::WatchOptions;

/// Configuration for the connection manager and the location relay.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelayConfig {
    /// Substring a peripheral's advertised name must contain to be listed.
    pub name_filter: String,

    /// Service carrying the telemetry characteristic.
    pub service_uuid: Uuid,

    /// Delay between an unsolicited disconnect and the next scan.
    pub rescan_delay: Duration,

    /// Upper bound for establishing the link.
    pub connect_timeout: Duration,

    /// Settle time between service discovery and subscribing.
    pub subscribe_delay: Duration,

    /// Minimum spacing between two "searching" notifications for a device.
    pub searching_notify_window: Duration,

    /// Phone samples closer than this to the last uploaded one are dropped.
    pub phone_distance_threshold_m: f64,

    /// Options for the phone location watch.
    pub watch_options: WatchOptions,

    /// How notification payloads are encoded.
    pub fragment_encoding: FragmentEncoding,

    /// Frame buffer size at which an unfinished message is abandoned.
    pub max_frame_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name_filter: DEFAULT_NAME_FILTER.to_string(),
            service_uuid: TELEMETRY_SERVICE_UUID,
            rescan_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            subscribe_delay: Duration::from_secs(1),
            searching_notify_window: Duration::from_secs(30),
            phone_distance_threshold_m: 50.0,
            watch_options: WatchOptions::default(),
            fragment_encoding: FragmentEncoding::default(),
            max_frame_len: 512,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised-name substring filter.
    pub fn with_name_filter(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = filter.into();
        self
    }

    /// Set the telemetry service UUID.
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Set the delay before rescanning after a lost connection.
    pub fn with_rescan_delay(mut self, delay: Duration) -> Self {
        self.rescan_delay = delay;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the settle time before subscribing to notifications.
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    /// Set the minimum spacing between "searching" notifications.
    pub fn with_searching_notify_window(mut self, window: Duration) -> Self {
        self.searching_notify_window = window;
        self
    }

    /// Set the phone sample distance threshold in meters.
    pub fn with_phone_distance_threshold_m(mut self, meters: f64) -> Self {
        self.phone_distance_threshold_m = meters;
        self
    }

    /// Set the phone location watch options.
    pub fn with_watch_options(mut self, options: WatchOptions) -> Self {
        self.watch_options = options;
        self
    }

    /// Set the notification payload encoding.
    pub fn with_fragment_encoding(mut self, encoding: FragmentEncoding) -> Self {
        self.fragment_encoding = encoding;
        self
    }

    /// Set the frame buffer bound.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// The searching window in milliseconds.
    pub(crate) fn searching_notify_window_ms(&self) -> i64 {
        self.searching_notify_window.as_millis() as i64
    }
}
