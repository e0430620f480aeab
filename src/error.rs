//! Error types for the helpbeacon-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified peripheral was not found among the scan results.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// The connection attempt did not complete in time.
    #[error("Connection timed out after {seconds}s")]
    ConnectionTimeout {
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// No notifiable characteristic was found in the telemetry service.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the service that was searched.
        uuid: String,
    },

    /// A notification payload could not be decoded to text.
    #[error("Invalid fragment: {context}")]
    InvalidFragment {
        /// Description of what was invalid about the payload.
        context: String,
    },

    /// The phone's location sensor could not start a watch.
    #[error("Location unavailable: {reason}")]
    LocationUnavailable {
        /// Description reported by the location provider.
        reason: String,
    },

    /// The backend store rejected or failed a write.
    #[error("Upload failed: {reason}")]
    Upload {
        /// Description of the failure.
        reason: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
