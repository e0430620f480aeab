//! Location arbitration between the tracker and the phone.

pub mod arbiter;
pub mod fallback;
pub mod sample;
pub mod upload_gate;

pub use arbiter::{ArbiterMode, ArbiterState, LocationArbiter};
pub use fallback::{FallbackEvent, LocationProvider, PhoneFix, PhoneLocationFallback, WatchId, WatchOptions};
pub use sample::{LocationSample, LocationSource};
pub use upload_gate::{UploadDecision, UploadGate};
