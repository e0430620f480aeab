//! BLE communication module.
//!
//! This module provides the radio side of the relay: discovering trackers,
//! holding the adapter, and managing the telemetry connection.

pub mod characteristics;
pub mod connection;
pub mod lease;
pub mod scanner;
pub mod uuids;

pub use characteristics::{decode_fragment, FragmentEncoding, TelemetryCharacteristic};
pub use connection::{ConnectionManager, ConnectionState, RelayEvent};
pub use lease::RadioLease;
pub use scanner::{BleScanner, DiscoveredPeripheral};
pub use uuids::*;
