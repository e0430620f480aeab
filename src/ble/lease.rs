//! Radio stack lease.
//!
//! Some platform stacks hand back stale peripheral handles after a link is
//! lost, making the next connection attempt fail. A [`RadioLease`] owns a
//! freshly created btleplug `Manager` and adapter; the connection manager
//! drops it on disconnect and acquires a new one before the next scan.

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A radio stack handle tied to one connection attempt.
pub struct RadioLease {
    /// Keeps the platform manager alive for as long as the adapter is used.
    _manager: Manager,
    adapter: Adapter,
    generation: u64,
}

impl RadioLease {
    /// Create a new radio stack handle and pick the first adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn acquire(generation: u64) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(generation, "Acquired radio lease");

        Ok(Self {
            _manager: manager,
            adapter,
            generation,
        })
    }

    /// The adapter owned by this lease.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Monotonic counter identifying this lease.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RadioLease {
    fn drop(&mut self) {
        debug!(generation = self.generation, "Released radio lease");
    }
}
