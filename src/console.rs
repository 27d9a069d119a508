//! Line-command console for driving the coordinator by hand.
//!
//! # Commands
//!
//! - `ble on|off|scan|connect <id>|disconnect|forget <id>|list`
//! - `wifi on|off|scan|auto|connect <ssid> [password]|disconnect|forget <ssid>|saved|list`
//! - `status` - Show both managers' state
//! - `help` - Show available commands
//!
//! # Example Session
//!
//! ```text
//! > ble scan
//! BLE scan started
//! > ble list
//! BLE devices:
//!   [0] Band aa:00:00:00:00:01 -60 dBm paired
//!   [1] aa:00:00:00:00:02 -45 dBm
//! > ble connect 0
//! Connecting to aa:00:00:00:00:01
//! ```

use crate::coordinator::RadioCoordinator;
use crate::registry::{ManagedDevice, PrimaryId};

/// `ble` subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleCommand {
    On,
    Off,
    Scan,
    /// Connect by list index, address or name prefix.
    Connect { id: String },
    Disconnect,
    Forget { id: String },
    List,
}

/// `wifi` subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiCommand {
    On,
    Off,
    Scan,
    /// Scan, then join the strongest saved network.
    Auto,
    Connect {
        ssid: String,
        password: Option<String>,
    },
    Disconnect,
    Forget { ssid: String },
    Saved,
    List,
}

/// Parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Ble(BleCommand),
    Wifi(WifiCommand),
    Status,
    Help,
    Quit,
    /// Unknown or invalid command, with a message for the user.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return ConsoleCommand::Unknown(String::new());
        }

        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match cmd.to_lowercase().as_str() {
            "ble" | "b" => parse_ble(args),
            "wifi" | "w" => parse_wifi(args),
            "status" | "stat" | "s" => ConsoleCommand::Status,
            "help" | "h" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            _ => ConsoleCommand::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }
}

fn split_sub(args: &str) -> (String, &str) {
    let mut parts = args.splitn(2, ' ');
    let sub = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();
    (sub, rest)
}

fn parse_ble(args: &str) -> ConsoleCommand {
    let (sub, rest) = split_sub(args);
    let command = match sub.as_str() {
        "on" => BleCommand::On,
        "off" => BleCommand::Off,
        "scan" => BleCommand::Scan,
        "connect" | "c" if !rest.is_empty() => BleCommand::Connect {
            id: rest.to_string(),
        },
        "connect" | "c" => return ConsoleCommand::Unknown("Usage: ble connect <id>".to_string()),
        "disconnect" | "d" => BleCommand::Disconnect,
        "forget" if !rest.is_empty() => BleCommand::Forget {
            id: rest.to_string(),
        },
        "forget" => return ConsoleCommand::Unknown("Usage: ble forget <id>".to_string()),
        "list" | "ls" | "l" => BleCommand::List,
        _ => {
            return ConsoleCommand::Unknown(
                "Usage: ble on|off|scan|connect <id>|disconnect|forget <id>|list".to_string(),
            )
        }
    };
    ConsoleCommand::Ble(command)
}

fn parse_wifi(args: &str) -> ConsoleCommand {
    let (sub, rest) = split_sub(args);
    let command = match sub.as_str() {
        "on" => WifiCommand::On,
        "off" => WifiCommand::Off,
        "scan" => WifiCommand::Scan,
        "auto" => WifiCommand::Auto,
        "connect" | "c" => {
            let mut parts = rest.splitn(2, ' ');
            let ssid = parts.next().unwrap_or("").to_string();
            let password = parts
                .next()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            if ssid.is_empty() {
                return ConsoleCommand::Unknown(
                    "Usage: wifi connect <ssid> [password]".to_string(),
                );
            }
            WifiCommand::Connect { ssid, password }
        }
        "disconnect" | "d" => WifiCommand::Disconnect,
        "forget" if !rest.is_empty() => WifiCommand::Forget {
            ssid: rest.to_string(),
        },
        "forget" => return ConsoleCommand::Unknown("Usage: wifi forget <ssid>".to_string()),
        "saved" => WifiCommand::Saved,
        "list" | "ls" | "l" => WifiCommand::List,
        _ => {
            return ConsoleCommand::Unknown(
                "Usage: wifi on|off|scan|auto|connect <ssid> [pw]|disconnect|forget <ssid>|saved|list"
                    .to_string(),
            )
        }
    };
    ConsoleCommand::Wifi(command)
}

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  ble on|off                  Enable or disable BLE
  ble scan                    Scan for BLE devices
  ble connect <id>            Connect by list index, address or name prefix
  ble disconnect              Disconnect the current device
  ble forget <id>             Remove a paired device
  ble list                    Show known BLE devices
  wifi on|off                 Enable or disable Wi-Fi
  wifi scan                   Scan for networks
  wifi auto                   Scan and join the strongest saved network
  wifi connect <ssid> [pw]    Join a network (new password is saved)
  wifi disconnect             Leave the current network
  wifi forget <ssid>          Forget a saved network
  wifi saved                  Show saved networks
  wifi list                   Show known networks
  status                      Show radio status
  help                        Show this help
  quit                        Exit

Shortcuts: b=ble, w=wifi, s=status, h=help, q=quit

SSIDs containing spaces are not supported here.
"#;

/// Look a device up by list index, id, or case-insensitive name prefix.
pub fn resolve_device(devices: &[ManagedDevice], id: &str) -> Option<PrimaryId> {
    if let Ok(idx) = id.parse::<usize>() {
        return devices.get(idx).map(|d| d.id.clone());
    }
    let id_lower = id.to_lowercase();
    devices
        .iter()
        .find(|d| d.id.as_str().eq_ignore_ascii_case(id))
        .or_else(|| {
            devices
                .iter()
                .find(|d| !d.name.is_empty() && d.name.to_lowercase().starts_with(&id_lower))
        })
        .map(|d| d.id.clone())
}

/// Format a device list with indices usable by `connect`.
pub fn format_devices(title: &str, devices: &[ManagedDevice]) -> String {
    if devices.is_empty() {
        return format!("No {}. Try a scan.", title.to_lowercase());
    }
    let mut output = format!("{}:\n", title);
    for (idx, device) in devices.iter().enumerate() {
        let mut line = format!("  [{}] ", idx);
        if !device.name.is_empty() && device.name != device.address {
            line.push_str(&device.name);
            line.push(' ');
        }
        line.push_str(&device.address);
        match device.rssi {
            Some(rssi) => line.push_str(&format!(" {} dBm", rssi)),
            None => line.push_str(" ?"),
        }
        if device.is_connected {
            line.push_str(" connected");
        }
        if device.is_paired {
            line.push_str(" paired");
        }
        if !device.is_online {
            line.push_str(" offline");
        }
        output.push_str(&line);
        output.push('\n');
    }
    output
}

/// Format both managers' state.
pub fn format_status(coordinator: &RadioCoordinator) -> String {
    let ble = coordinator.ble();
    let wifi = coordinator.wifi();
    let ble_link = ble
        .connected_device()
        .map_or_else(|| "-".to_string(), |d| d.display_name().to_string());
    let wifi_link = wifi.connected_network().map_or_else(
        || "-".to_string(),
        |n| match wifi.ip_address() {
            Some(ip) => format!("{} ({})", n.address, ip),
            None => n.address,
        },
    );
    format!(
        "Radio Status:\n  BLE: {:?} link {}\n  Wi-Fi: {:?} link {}\n  Busy: {}\n",
        ble.state(),
        ble_link,
        wifi.state(),
        wifi_link,
        coordinator.is_busy()
    )
}

fn accepted(ok: bool, done: String, rejected: &str) -> String {
    if ok {
        done
    } else {
        rejected.to_string()
    }
}

/// Run one command against the coordinator and describe the outcome.
///
/// Operations that spawn workers only start here; their results arrive
/// through the event sink as the coordinator ticks.
pub fn execute(command: ConsoleCommand, coordinator: &mut RadioCoordinator) -> String {
    match command {
        ConsoleCommand::Ble(command) => execute_ble(command, coordinator),
        ConsoleCommand::Wifi(command) => execute_wifi(command, coordinator),
        ConsoleCommand::Status => format_status(coordinator),
        ConsoleCommand::Help => HELP_TEXT.to_string(),
        ConsoleCommand::Quit => "Bye".to_string(),
        ConsoleCommand::Unknown(message) => message,
    }
}

fn execute_ble(command: BleCommand, coordinator: &mut RadioCoordinator) -> String {
    let ble = coordinator.ble_mut();
    match command {
        BleCommand::On => {
            ble.enable(false);
            "BLE enabled".to_string()
        }
        BleCommand::Off => {
            ble.disable();
            "BLE disabled".to_string()
        }
        BleCommand::Scan => {
            let duration = ble.config().scan_duration();
            accepted(
                ble.start_scan(duration, false, false),
                "BLE scan started".to_string(),
                "BLE scan rejected (disabled or busy)",
            )
        }
        BleCommand::Connect { id } => match resolve_device(&ble.get_display_devices(), &id) {
            Some(id) => accepted(
                ble.connect_to_device(&id),
                format!("Connecting to {}", id),
                "BLE connect rejected (disabled)",
            ),
            None => format!("No BLE device matches '{}'", id),
        },
        BleCommand::Disconnect => {
            ble.disconnect_from_device(false);
            "BLE disconnected".to_string()
        }
        BleCommand::Forget { id } => match resolve_device(&ble.get_display_devices(), &id) {
            Some(id) => accepted(
                ble.remove_paired_device(&id),
                format!("Forgot {}", id),
                "Device was not paired",
            ),
            None => format!("No BLE device matches '{}'", id),
        },
        BleCommand::List => format_devices("BLE devices", &ble.get_display_devices()),
    }
}

fn execute_wifi(command: WifiCommand, coordinator: &mut RadioCoordinator) -> String {
    let wifi = coordinator.wifi_mut();
    match command {
        WifiCommand::On => {
            wifi.enable();
            format!("Wi-Fi {:?}", wifi.state())
        }
        WifiCommand::Off => {
            wifi.disable();
            format!("Wi-Fi {:?}", wifi.state())
        }
        WifiCommand::Scan => accepted(
            wifi.start_scan(),
            "Wi-Fi scan started".to_string(),
            "Wi-Fi scan rejected (disabled or busy)",
        ),
        WifiCommand::Auto => accepted(
            wifi.start_scan_and_attempt_auto_connect(),
            "Wi-Fi auto-connect scan started".to_string(),
            "Wi-Fi scan rejected (disabled or busy)",
        ),
        WifiCommand::Connect { ssid, password } => accepted(
            wifi.connect(&ssid, password.as_deref()),
            format!("Connecting to {}", ssid),
            "Wi-Fi connect rejected (disabled or invalid credentials)",
        ),
        WifiCommand::Disconnect => {
            wifi.disconnect();
            "Wi-Fi disconnected".to_string()
        }
        WifiCommand::Forget { ssid } => accepted(
            wifi.forget_network(&ssid),
            format!("Forgot {}", ssid),
            "Network was not saved",
        ),
        WifiCommand::Saved => {
            let saved = wifi.saved_networks();
            if saved.is_empty() {
                "No saved networks".to_string()
            } else {
                format!("Saved networks:\n  {}\n", saved.join("\n  "))
            }
        }
        WifiCommand::List => format_devices("Wi-Fi networks", &wifi.get_display_networks()),
    }
}
