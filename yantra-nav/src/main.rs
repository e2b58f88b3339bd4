//! YantraNav daemon entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use yantra_nav::{Config, Result, Supervisor};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("YantraNav v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Using config: {}", path);
            Config::load(&path)?
        }
        None => {
            let default_path = "yantra.toml";
            if std::path::Path::new(default_path).exists() {
                log::info!("Using config: {}", default_path);
                Config::load(default_path)?
            } else {
                log::info!("No config file, using defaults");
                Config::default()
            }
        }
    };

    let (supervisor, _intake) = Supervisor::start(config)?;

    // The platform intake is held open for embedders; the standalone
    // daemon runs with pose/IMU/camera silent until something connects
    // through the control surface.

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| yantra_nav::NavError::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("YantraNav running. Press Ctrl-C to stop.");
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    supervisor.shutdown();
    log::info!("YantraNav stopped");
    Ok(())
}
