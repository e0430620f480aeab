//! # helpbeacon-ble
//!
//! Telemetry decoding and emergency location relay for HelpBeacon GPS
//! trackers over Bluetooth Low Energy.
//!
//! A phone connects to one tracker at a time, reassembles the tracker's
//! fragmented text notifications into messages, and relays the tracker's
//! position to a backend store. While the tracker has no GPS fix, the
//! phone's own location sensor stands in.
//!
//! ## Features
//!
//! - **Tracker Discovery**: Scan for trackers advertising a name filter
//! - **Frame Reassembly**: Rebuild messages split across notifications
//! - **Location Arbitration**: Tracker fixes take precedence over phone GPS
//! - **Upload Throttling**: Searching notifications are rate-limited and
//!   phone samples are distance-filtered
//! - **Auto Reconnect**: A lost link tears down the session and rescans
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use helpbeacon_ble::{Collaborators, ConnectionManager, RelayConfig, RelayEvent, Result};
//!
//! # async fn run(collaborators: Collaborators) -> Result<()> {
//! let manager = ConnectionManager::new(RelayConfig::default(), collaborators);
//! let mut events = manager.subscribe();
//! manager.start_scan().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RelayEvent::PeripheralDiscovered { identifier, .. } => {
//!             manager.connect(&identifier).await?;
//!         }
//!         RelayEvent::MessageReceived { message, .. } => println!("{}", message),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Notes
//!
//! Radio and location permissions must be granted before scanning.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod backend;
pub mod ble;
pub mod config;
pub mod error;
pub mod location;
pub mod protocol;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use backend::{
    IdentityProvider, LocationPayload, LocationStore, MapDisplay, StaticIdentity, UploadOutcome,
};
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use session::{Collaborators, TelemetrySession};
pub use utils::{haversine_distance_m, sanitize_device_id};

// Re-export commonly used types from submodules
pub use ble::{ConnectionManager, ConnectionState, FragmentEncoding, RelayEvent};
pub use location::{
    ArbiterMode, FallbackEvent, LocationProvider, LocationSample, LocationSource, PhoneFix,
    WatchId, WatchOptions,
};
pub use protocol::{FrameAssembler, ProtocolMessage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<ConnectionManager>();
        let _ = std::any::TypeId::of::<TelemetrySession>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ProtocolMessage>();
        let _ = std::any::TypeId::of::<LocationPayload>();
        let _ = std::any::TypeId::of::<RelayConfig>();
    }

    #[test]
    fn test_device_key() {
        assert_eq!(sanitize_device_id("AA:BB:CC"), "AA_BB_CC");
        assert!(haversine_distance_m(0.0, 0.0, 0.0, 0.0).abs() < 1e-9);
    }
}
