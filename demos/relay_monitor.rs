//! Relay monitor: connect to the first tracker found and log its telemetry.
//!
//! Uploads and map updates are printed instead of sent anywhere. The phone
//! location sensor reports a fixed position given on the command line.
//!
//! Run with: cargo run --example relay_monitor -- [lat lon]

use async_trait::async_trait;
use helpbeacon_ble::{
    Collaborators, ConnectionManager, FallbackEvent, LocationPayload, LocationProvider,
    LocationStore, MapDisplay, PhoneFix, RelayConfig, RelayEvent, Result, StaticIdentity, WatchId,
    WatchOptions,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct PrintStore;

#[async_trait]
impl LocationStore for PrintStore {
    async fn put_location(&self, key: &str, payload: &LocationPayload) -> Result<()> {
        println!(
            "  [upload] {} <- ({:.6}, {:.6}) source={} initial={} boot_time_ms={}",
            key, payload.lat, payload.lon, payload.source, payload.is_initial, payload.boot_time_ms
        );
        Ok(())
    }
}

struct PrintMap;

impl MapDisplay for PrintMap {
    fn show_position(&self, lat: f64, lon: f64) {
        println!("  [map] position ({:.6}, {:.6})", lat, lon);
    }

    fn show_marker(&self, id: &str, lat: f64, lon: f64, label: &str) {
        println!("  [map] marker {} '{}' at ({:.6}, {:.6})", id, label, lat, lon);
    }

    fn clear(&self) {
        println!("  [map] cleared");
    }
}

/// Reports the same position once per watch.
struct FixedLocation {
    lat: f64,
    lon: f64,
    next_id: AtomicU64,
}

impl LocationProvider for FixedLocation {
    fn watch(
        &self,
        options: &WatchOptions,
        events: mpsc::UnboundedSender<FallbackEvent>,
    ) -> Result<WatchId> {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        println!(
            "  [phone] watch {:?} started (high_accuracy={}, filter={}m)",
            id, options.high_accuracy, options.distance_filter_m
        );

        let _ = events.send(FallbackEvent::Sample(PhoneFix {
            lat: self.lat,
            lon: self.lon,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
            accuracy_m: Some(10.0),
        }));
        Ok(id)
    }

    fn clear_watch(&self, watch: WatchId) {
        println!("  [phone] watch {:?} cleared", watch);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("helpbeacon_ble=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<f64> = std::env::args()
        .skip(1)
        .filter_map(|a| a.parse().ok())
        .collect();
    let (lat, lon) = match args.as_slice() {
        [lat, lon, ..] => (*lat, *lon),
        _ => (48.1351, 11.5820),
    };

    let collaborators = Collaborators {
        store: Arc::new(PrintStore),
        map: Arc::new(PrintMap),
        identity: Arc::new(StaticIdentity(Some("relay-monitor".to_string()))),
        location: Arc::new(FixedLocation {
            lat,
            lon,
            next_id: AtomicU64::new(1),
        }),
    };

    let manager = ConnectionManager::new(RelayConfig::default(), collaborators);
    let mut events = manager.subscribe();

    println!("Scanning for HelpBeacon trackers...");
    println!("Press Ctrl+C to exit.\n");
    manager.start_scan().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event {
                    RelayEvent::StateChanged(state) => println!("State: {}", state),
                    RelayEvent::PeripheralDiscovered { identifier, name } => {
                        println!("Discovered {} ({})", name, identifier);
                        if !manager.state().is_connected() && !manager.state().is_transitioning() {
                            if let Err(e) = manager.connect(&identifier).await {
                                println!("Connect failed: {}", e);
                            }
                        }
                    }
                    RelayEvent::ConnectFailed { identifier, reason } => {
                        println!("Could not connect to {}: {}", identifier, reason);
                    }
                    RelayEvent::MessageReceived { device_id, message } => {
                        println!("{} -> {} (mode: {:?})", device_id, message, manager.arbiter_mode());
                    }
                    RelayEvent::GpsCleared => println!("GPS output cleared"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(600)) => break,
        }
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
