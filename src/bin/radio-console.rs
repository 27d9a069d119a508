//! Host console for the radio coordinator.
//!
//! Runs the polled main loop over simulated radios with a few scripted
//! devices and networks. Paired devices and saved networks persist as JSON
//! under `~/.radiolink-esp32`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin radio-console [config.json]
//! ```

use log::{error, info, warn};
use radiolink_esp32::ble::Advertisement;
use radiolink_esp32::console::{execute, ConsoleCommand};
use radiolink_esp32::persistence::{default_store_dir, JsonFileStore};
use radiolink_esp32::sim::{SimAir, SimBleRadio, SimWifiRadio};
use radiolink_esp32::{CoordinatorConfig, LogSink, RadioCoordinator};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

/// Scan time for the simulated radios, long enough to watch deferrals.
const SIM_SCAN_TIME: Duration = Duration::from_millis(800);

fn scripted_radios() -> (Arc<SimBleRadio>, Arc<SimWifiRadio>) {
    let air = SimAir::new();
    let ble = Arc::new(SimBleRadio::new(air.clone()));
    ble.set_scan_time(SIM_SCAN_TIME);
    ble.set_adverts(vec![
        Advertisement {
            address: "c4:7f:51:0a:12:9e".into(),
            name: Some("Heart Strap".into()),
            service_uuid: Some("0000180d-0000-1000-8000-00805f9b34fb".into()),
            rssi: -58,
        },
        Advertisement {
            address: "e8:9f:6d:33:01:4c".into(),
            name: Some("Bike Sensor".into()),
            service_uuid: Some("00001816-0000-1000-8000-00805f9b34fb".into()),
            rssi: -72,
        },
        Advertisement {
            address: "5a:11:be:70:c2:03".into(),
            name: None,
            service_uuid: None,
            rssi: -86,
        },
    ]);

    let wifi = Arc::new(SimWifiRadio::new(air));
    wifi.set_scan_time(SIM_SCAN_TIME);
    wifi.add_access_point("HomeNet", -52, "correct-horse");
    wifi.add_access_point("CafeFree", -67, "");
    wifi.add_access_point("Neighbour", -80, "battery-staple");
    (ble, wifi)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => CoordinatorConfig::load(&path)?,
        None => CoordinatorConfig::default(),
    };

    let store = Arc::new(Mutex::new(JsonFileStore::open(
        default_store_dir()?,
        config.ble.max_paired_devices,
        config.wifi.max_saved_networks,
    )?));
    let (ble, wifi) = scripted_radios();
    let mut coordinator = RadioCoordinator::new(
        config,
        ble,
        wifi,
        Box::new(store.clone()),
        Box::new(store),
        Arc::new(LogSink),
    )?;

    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(coordinator.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => coordinator.tick(),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = ConsoleCommand::parse(&line);
                    if command == ConsoleCommand::Quit {
                        break;
                    }
                    let output = execute(command, &mut coordinator);
                    if !output.is_empty() {
                        println!("{}", output.trim_end());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== Radio console starting ===");
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run()) {
        error!("{}", e);
        std::process::exit(1);
    }
}
