//! Async side of a bridge session
//!
//! The connection manager blocks: opening claims and configures the device
//! through libusb, writes may wait for buffer space and shutdown joins the
//! worker threads. These helpers run those calls on tokio's blocking pool.

use crate::usb::HotplugWatcher;
use anyhow::{Context, Result};
use common::{DeviceSelector, LineParameters};
use serial::{ConnectionManager, OpenOutcome};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task;

/// How long a stdin line may wait for room in the write buffer
pub const WRITE_WAIT: Duration = Duration::from_secs(1);

pub async fn open_port(
    manager: &ConnectionManager,
    port: &str,
    selector: &DeviceSelector,
    parameters: LineParameters,
) -> Result<OpenOutcome> {
    let manager = manager.clone();
    let port = port.to_string();
    let selector = selector.clone();
    let outcome = task::spawn_blocking(move || manager.open(&port, &selector, parameters))
        .await
        .context("Open task failed")??;
    Ok(outcome)
}

/// Queue `line` plus a newline on `port`
pub async fn write_line(manager: &ConnectionManager, port: &str, mut line: String) -> Result<()> {
    line.push('\n');
    let manager = manager.clone();
    let port = port.to_string();
    task::spawn_blocking(move || manager.write(&port, line.as_bytes(), Some(WRITE_WAIT)))
        .await
        .context("Write task failed")??;
    Ok(())
}

/// Close every port, then stop hot-plug monitoring
pub async fn shutdown(manager: ConnectionManager, watcher: Option<HotplugWatcher>) -> Result<()> {
    task::spawn_blocking(move || {
        manager.shutdown();
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
    })
    .await
    .context("Shutdown task failed")
}

/// Write received bytes through to `out` right away
pub async fn write_received<W>(out: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(data).await?;
    out.flush().await
}
