//! Telemetry message classification and parsing.
//!
//! The tracker speaks a line-less text protocol:
//!
//! ```text
//! EMERGENCY:SEARCHING
//! EMERGENCY:<timestamp_ms>,<lat>,<lon>
//! LOCAL:<id>,<lat>,<lon>
//! ```
//!
//! There is no length prefix or checksum. A buffer is considered complete
//! once it equals the sentinel, or once it carries a recognized prefix and
//! three non-empty comma-separated fields that all parse. Anything else is
//! reported as [`ParseOutcome::Incomplete`] so the caller keeps accumulating.

/// Prefix of emergency messages.
pub const EMERGENCY_PREFIX: &str = "EMERGENCY:";

/// Prefix of local-direct messages.
pub const LOCAL_PREFIX: &str = "LOCAL:";

/// The "no fix yet" sentinel.
pub const SEARCHING_SENTINEL: &str = "EMERGENCY:SEARCHING";

/// A complete telemetry message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolMessage {
    /// The tracker is in emergency mode but has no GPS fix.
    Searching,
    /// The tracker's own GPS fix during an emergency.
    EmergencyFix {
        /// Tracker-side timestamp (milliseconds since tracker boot).
        timestamp_ms: u64,
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },
    /// A position shared in local-direct mode; never persisted.
    LocalFix {
        /// Sender-assigned identifier.
        id: String,
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },
}

impl ProtocolMessage {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::EmergencyFix { .. } => "emergency-fix",
            Self::LocalFix { .. } => "local-fix",
        }
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Searching => write!(f, "{}", SEARCHING_SENTINEL),
            Self::EmergencyFix {
                timestamp_ms,
                lat,
                lon,
            } => write!(f, "{}{},{},{}", EMERGENCY_PREFIX, timestamp_ms, lat, lon),
            Self::LocalFix { id, lat, lon } => write!(f, "{}{},{},{}", LOCAL_PREFIX, id, lat, lon),
        }
    }
}

/// Result of evaluating a frame buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The buffer holds a complete message.
    Complete(ProtocolMessage),
    /// More fragments are needed, or the fields did not parse.
    Incomplete,
}

/// Check whether a fragment starts a new message.
pub fn starts_message(fragment: &str) -> bool {
    fragment.starts_with(EMERGENCY_PREFIX) || fragment.starts_with(LOCAL_PREFIX)
}

/// Evaluate the buffer against the completeness rules, in order.
pub fn parse(buffer: &str) -> ParseOutcome {
    if buffer == SEARCHING_SENTINEL {
        return ParseOutcome::Complete(ProtocolMessage::Searching);
    }

    if let Some(body) = buffer.strip_prefix(EMERGENCY_PREFIX) {
        return parse_emergency(body);
    }

    if let Some(body) = buffer.strip_prefix(LOCAL_PREFIX) {
        return parse_local(body);
    }

    ParseOutcome::Incomplete
}

fn parse_emergency(body: &str) -> ParseOutcome {
    let Some((timestamp, lat, lon)) = split_fields(body) else {
        return ParseOutcome::Incomplete;
    };

    match (timestamp.parse::<u64>(), parse_coordinate(lat), parse_coordinate(lon)) {
        (Ok(timestamp_ms), Some(lat), Some(lon)) => {
            ParseOutcome::Complete(ProtocolMessage::EmergencyFix {
                timestamp_ms,
                lat,
                lon,
            })
        }
        _ => ParseOutcome::Incomplete,
    }
}

fn parse_local(body: &str) -> ParseOutcome {
    let Some((id, lat, lon)) = split_fields(body) else {
        return ParseOutcome::Incomplete;
    };

    match (parse_coordinate(lat), parse_coordinate(lon)) {
        (Some(lat), Some(lon)) => ParseOutcome::Complete(ProtocolMessage::LocalFix {
            id: id.to_string(),
            lat,
            lon,
        }),
        _ => ParseOutcome::Incomplete,
    }
}

/// Split `a,b,c` into three non-empty fields. Extra commas stay in the last one.
fn split_fields(body: &str) -> Option<(&str, &str, &str)> {
    let mut parts = body.splitn(3, ',');
    let first = parts.next()?.trim();
    let second = parts.next()?.trim();
    let third = parts.next()?.trim();

    if first.is_empty() || second.is_empty() || third.is_empty() {
        return None;
    }

    Some((first, second, third))
}

fn parse_coordinate(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}
