//! Location sample data structures.

/// Where a location sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum LocationSource {
    /// Reported by the tracker over BLE.
    Ble,
    /// The phone's own location sensor.
    Phone,
}

impl LocationSource {
    /// Tag stored with uploads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ble => "BLE",
            Self::Phone => "PHONE",
        }
    }
}

impl std::fmt::Display for LocationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate location produced by the arbiter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocationSample {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Source of the coordinates.
    pub source: LocationSource,
    /// Capture time in milliseconds.
    ///
    /// For tracker fixes this is the tracker-reported timestamp; otherwise it
    /// is the phone's wall clock.
    pub captured_at_ms: i64,
    /// Identifier of the connected tracker.
    pub device_id: String,
    /// Zero-coordinate "searching" notification rather than a real fix.
    pub initial: bool,
    /// Phone fallback episode the sample was taken in; zero for tracker samples.
    #[cfg_attr(feature = "serde", serde(default))]
    pub episode: u64,
}

impl LocationSample {
    /// The zero-coordinate notification sent when the tracker has no fix.
    pub fn searching(device_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            source: LocationSource::Ble,
            captured_at_ms: now_ms,
            device_id: device_id.into(),
            initial: true,
            episode: 0,
        }
    }

    /// A fix reported by the tracker.
    pub fn ble_fix(device_id: impl Into<String>, lat: f64, lon: f64, timestamp_ms: i64) -> Self {
        Self {
            lat,
            lon,
            source: LocationSource::Ble,
            captured_at_ms: timestamp_ms,
            device_id: device_id.into(),
            initial: false,
            episode: 0,
        }
    }

    /// A fix from the phone's location sensor.
    pub fn phone_fix(device_id: impl Into<String>, lat: f64, lon: f64, captured_at_ms: i64) -> Self {
        Self {
            lat,
            lon,
            source: LocationSource::Phone,
            captured_at_ms,
            device_id: device_id.into(),
            initial: false,
            episode: 0,
        }
    }

    /// Tag the sample with the fallback episode it belongs to.
    pub fn in_episode(mut self, episode: u64) -> Self {
        self.episode = episode;
        self
    }

    /// Check if this is a "searching" notification.
    pub fn is_searching(&self) -> bool {
        self.initial && self.source == LocationSource::Ble
    }
}
