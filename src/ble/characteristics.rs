//! GATT characteristic handling.
//!
//! Locates the telemetry characteristic on a connected tracker, manages the
//! notification subscription and decodes notification payloads to text
//! fragments.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Encoding of notification payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FragmentEncoding {
    /// Payload bytes are the UTF-8 text itself.
    #[default]
    Utf8,
    /// Payload bytes are base64 text wrapping the UTF-8 text.
    Base64,
}

/// Decode one notification payload into a trimmed text fragment.
///
/// # Errors
///
/// Returns [`Error::InvalidFragment`] if the payload is not valid for the
/// selected encoding.
pub fn decode_fragment(data: &[u8], encoding: FragmentEncoding) -> Result<String> {
    let bytes = match encoding {
        FragmentEncoding::Utf8 => data.to_vec(),
        FragmentEncoding::Base64 => {
            let encoded = std::str::from_utf8(data).map_err(|e| Error::InvalidFragment {
                context: format!("base64 text: {}", e),
            })?;
            BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::InvalidFragment {
                    context: format!("base64: {}", e),
                })?
        }
    };

    let text = String::from_utf8(bytes).map_err(|e| Error::InvalidFragment {
        context: format!("utf-8: {}", e),
    })?;

    Ok(text.trim().to_string())
}

/// The notifiable telemetry characteristic of a connected tracker.
pub struct TelemetryCharacteristic {
    /// The peripheral the characteristic belongs to.
    peripheral: Peripheral,
    /// The resolved characteristic.
    characteristic: Characteristic,
}

impl TelemetryCharacteristic {
    /// Find the first notifiable characteristic inside `service_uuid`.
    ///
    /// Services must be discovered before calling this.
    pub fn locate(peripheral: &Peripheral, service_uuid: Uuid) -> Result<Self> {
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service_uuid.to_string(),
            })?;

        let characteristic = service
            .characteristics
            .into_iter()
            .find(|c| {
                c.properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            })
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: service_uuid.to_string(),
            })?;

        debug!(
            "Found telemetry characteristic {} in service {}, properties: {:?}",
            characteristic.uuid, service_uuid, characteristic.properties
        );

        Ok(Self {
            peripheral: peripheral.clone(),
            characteristic,
        })
    }

    /// UUID of the telemetry characteristic.
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    /// Subscribe to notifications.
    pub async fn subscribe(&self) -> Result<()> {
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!(
            "Subscribed to notifications from {}",
            self.characteristic.uuid
        );

        Ok(())
    }

    /// Unsubscribe from notifications.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.peripheral
            .unsubscribe(&self.characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!(
            "Unsubscribed from notifications from {}",
            self.characteristic.uuid
        );

        Ok(())
    }
}
