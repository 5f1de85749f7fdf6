//! Switch-gesture input monitor.
//!
//! Reads raw evdev records from the configured device node and fires the
//! gesture callback when the configured number of key presses with the
//! configured code land inside the time window. What the daemon does with
//! the gesture is the manager's business; this module only watches.

use crate::config::InputConfig;
use crate::error::Result;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// `struct input_event` on 64-bit Linux: two 64-bit timeval fields,
/// type (u16), code (u16), value (i32).
const EVENT_SIZE: usize = 24;

/// Event type for key events.
const EV_KEY: u16 = 1;

/// Key-press value (1 = press, 0 = release, 2 = autorepeat).
const KEY_PRESS: i32 = 1;

/// Watches one input device for the switch gesture.
pub struct InputMonitor {
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl InputMonitor {
    /// Opens the device and starts watching. The callback fires on the
    /// monitor task every time a full gesture is recognized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the device node cannot be opened.
    pub fn start<F>(config: InputConfig, on_gesture: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let file = std::fs::File::open(&config.device)?;
        let file = tokio::fs::File::from_std(file);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(monitor_loop(file, config, stop_rx, on_gesture));
        Ok(Self { stop_tx, worker })
    }

    /// Stops the monitor task.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.worker.abort();
    }
}

async fn monitor_loop<F>(
    mut file: tokio::fs::File,
    config: InputConfig,
    mut stop_rx: watch::Receiver<bool>,
    on_gesture: F,
) where
    F: Fn() + Send + Sync + 'static,
{
    let window = Duration::from_millis(config.time_window_ms);
    let mut presses: Vec<Instant> = Vec::new();
    let mut buf = [0u8; EVENT_SIZE];

    loop {
        let read = tokio::select! {
            _ = stop_rx.changed() => return,
            read = file.read_exact(&mut buf) => read,
        };
        if let Err(e) = read {
            warn!(device = %config.device.display(), error = %e, "input monitor read failed");
            return;
        }

        let event_type = u16::from_le_bytes([buf[16], buf[17]]);
        let code = u16::from_le_bytes([buf[18], buf[19]]);
        let value = i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);

        if event_type != EV_KEY || code != config.code || value != KEY_PRESS {
            continue;
        }

        let now = Instant::now();
        presses.push(now);
        presses.retain(|t| now.duration_since(*t) <= window);

        if presses.len() as u32 >= config.num_events {
            debug!(code = config.code, "switch gesture recognized");
            presses.clear();
            on_gesture();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_layout_parsing() {
        // Build one key-press record for code 139 by hand.
        let mut record = [0u8; EVENT_SIZE];
        record[16..18].copy_from_slice(&EV_KEY.to_le_bytes());
        record[18..20].copy_from_slice(&139u16.to_le_bytes());
        record[20..24].copy_from_slice(&KEY_PRESS.to_le_bytes());

        let event_type = u16::from_le_bytes([record[16], record[17]]);
        let code = u16::from_le_bytes([record[18], record[19]]);
        let value = i32::from_le_bytes([record[20], record[21], record[22], record[23]]);
        assert_eq!(event_type, EV_KEY);
        assert_eq!(code, 139);
        assert_eq!(value, KEY_PRESS);
    }
}
