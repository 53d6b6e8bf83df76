//! usb-serial-bridge
//!
//! Bridges one USB serial adapter to the terminal: bytes received on the
//! port go to stdout, lines typed on stdin are written to the port.

use anyhow::{Context, Result};
use bridge::config::BridgeConfig;
use bridge::session::{self, open_port};
use bridge::usb::{HotplugWatcher, RusbHost};
use clap::Parser;
use common::{
    DeviceSelector, EventReceiver, LineParameters, SerialEvent, create_event_bridge, setup_logging,
};
use serial::{ConnectionManager, OpenOutcome};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{signal, task};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-serial-bridge")]
#[command(
    author,
    version,
    about = "USB serial bridge - talk to USB serial adapters without kernel drivers"
)]
#[command(long_about = "
Opens a USB serial adapter (CDC-ACM, FTDI, CP21xx, CH34x, Prolific) through
libusb and bridges it to the terminal. Received bytes are written to stdout;
each line read from stdin is sent to the device.

EXAMPLES:
    # Open the first serial adapter found at 115200 baud
    usb-serial-bridge

    # Open a CH340 by vendor and product id at 9600 baud
    usb-serial-bridge --device 0x1a86:0x7523 --baud 9600

    # Open a specific device node
    usb-serial-bridge --device path:/dev/bus/usb/001/004

    # List attached devices without opening anything
    usb-serial-bridge --list-devices

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-serial-bridge/bridge.toml
    3. /etc/usb-serial-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Logical port name
    #[arg(short, long, default_value = "usb0")]
    port: String,

    /// Device to open: any, path:/dev/bus/usb/BBB/DDD or VID:PID
    #[arg(short, long, value_name = "SELECTOR", default_value = "any")]
    device: DeviceSelector,

    /// Baud rate (overrides the configuration)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-serial-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let host = Arc::new(RusbHost::new().context("Failed to initialize libusb")?);
    let overrides = config.overrides().context("Invalid driver overrides")?;
    let (sender, receiver) = create_event_bridge();
    let manager = ConnectionManager::with_config(
        host.clone(),
        overrides,
        Arc::new(sender),
        config.manager_config(),
    );

    if args.list_devices {
        let manager = manager.clone();
        task::spawn_blocking(move || list_devices_mode(&manager)).await?;
        return Ok(());
    }

    let mut parameters = config.line.to_parameters()?;
    if let Some(baud) = args.baud {
        parameters = parameters.with_baud_rate(baud);
    }

    let watcher = if config.bridge.hotplug {
        match HotplugWatcher::start(host.context().clone(), manager.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Hot-plug monitoring unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let result = run_bridge(&manager, receiver, &args.port, &args.device, parameters).await;

    info!("Shutting down...");
    if let Err(e) = session::shutdown(manager, watcher).await {
        error!("{:#}", e);
    }
    info!("Shutdown complete");

    result
}

/// List serial-capable USB devices and exit
fn list_devices_mode(manager: &ConnectionManager) {
    let devices = manager.enumerate();

    if devices.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!("  {}", device.display_name());
        println!(
            "      Product: {}  Access: {}",
            device.device.product.as_deref().unwrap_or("Unknown Product"),
            if device.permission_granted {
                "granted"
            } else {
                "denied"
            }
        );
    }
}

async fn run_bridge(
    manager: &ConnectionManager,
    receiver: EventReceiver,
    port: &str,
    selector: &DeviceSelector,
    parameters: LineParameters,
) -> Result<()> {
    let outcome = open_port(manager, port, selector, parameters)
        .await
        .with_context(|| format!("Failed to open {}", port))?;
    match outcome {
        OpenOutcome::Connected => info!("Opened {} ({}) at {}", port, selector, parameters),
        OpenOutcome::AwaitingPermission => info!("Waiting for access to {}", selector),
    }

    let events = tokio::spawn(forward_events(
        manager.clone(),
        receiver,
        port.to_string(),
        selector.clone(),
        parameters,
    ));
    let input = tokio::spawn(forward_stdin(manager.clone(), port.to_string()));

    info!("Press Ctrl+C to exit");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    input.abort();
    events.abort();
    Ok(())
}

/// Print received data to stdout and lifecycle events to the log
///
/// A port lost to a detach is reopened when a device shows up again.
async fn forward_events(
    manager: ConnectionManager,
    receiver: EventReceiver,
    port: String,
    selector: DeviceSelector,
    parameters: LineParameters,
) {
    let mut stdout = tokio::io::stdout();

    while let Ok(event) = receiver.recv().await {
        match event {
            SerialEvent::DataReceived { data, .. } => {
                if let Err(e) = session::write_received(&mut stdout, &data).await {
                    error!("Failed to write to stdout: {}", e);
                    break;
                }
            }
            SerialEvent::ConnectedStateChanged { port, connected } => {
                info!(
                    "{} {}",
                    port,
                    if connected { "connected" } else { "disconnected" }
                );
            }
            SerialEvent::Error { port, message } => match port {
                Some(port) => warn!("{}: {}", port, message),
                None => warn!("{}", message),
            },
            SerialEvent::DeviceAttached(true) => {
                info!("USB device attached");
                if manager.port_state(&port).is_none() {
                    if let Err(e) = open_port(&manager, &port, &selector, parameters).await {
                        info!("Not reopening {}: {:#}", port, e);
                    }
                }
            }
            SerialEvent::DeviceAttached(false) => info!("USB device detached"),
        }
    }
}

/// Send each stdin line, newline appended, to the port
async fn forward_stdin(manager: ConnectionManager, port: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = session::write_line(&manager, &port, line).await {
                    warn!("Write to {} failed: {:#}", port, e);
                }
            }
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}
