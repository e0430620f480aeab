//! BLE Service UUIDs and discovery constants.
//!
//! HelpBeacon trackers expose a single custom service whose notifiable
//! characteristic streams the text telemetry protocol.

use uuid::Uuid;

/// HelpBeacon telemetry service UUID.
pub const TELEMETRY_SERVICE_UUID: Uuid = Uuid::from_u128(0x4faf_c201_1fb5_459e_8fcc_c5c9c331914b);

/// Name substring advertised by HelpBeacon trackers.
pub const DEFAULT_NAME_FILTER: &str = "GPS";

/// Check if an advertised local name matches the scan filter.
pub fn matches_name_filter(local_name: Option<&str>, filter: &str) -> bool {
    local_name.map(|n| n.contains(filter)).unwrap_or(false)
}
