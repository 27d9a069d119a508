//! Radiolink ESP32 firmware binary.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use radiolink_esp32::ble::NimbleRadio;
    use radiolink_esp32::persistence::NvsStore;
    use radiolink_esp32::wifi::EspWifiRadio;
    use radiolink_esp32::{CoordinatorConfig, LogSink, RadioCoordinator};
    use std::sync::{Arc, Mutex};

    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("=== Radiolink ESP32 starting ===");

    let config = CoordinatorConfig::default();
    let setup = || -> Result<RadioCoordinator, Box<dyn std::error::Error>> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        let store = Arc::new(Mutex::new(NvsStore::open(
            nvs.clone(),
            config.ble.max_paired_devices,
            config.wifi.max_saved_networks,
        )?));
        let wifi = EspWifiRadio::new(peripherals.modem, sysloop, Some(nvs))?;
        Ok(RadioCoordinator::new(
            config,
            Arc::new(NimbleRadio::new()),
            Arc::new(wifi),
            Box::new(store.clone()),
            Box::new(store),
            Arc::new(LogSink),
        )?)
    };

    let mut coordinator = match setup() {
        Ok(coordinator) => coordinator,
        Err(e) => {
            log::error!("Radio setup failed: {}", e);
            return;
        }
    };

    coordinator.ble_mut().enable(true);
    coordinator.wifi_mut().enable();

    log::info!("Entering main loop...");
    let tick = coordinator.tick_interval();
    loop {
        coordinator.tick();
        std::thread::sleep(tick);
    }
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo run --bin radio-console' for the host console.");
}
