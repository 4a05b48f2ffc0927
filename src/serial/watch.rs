//! Serial device discovery
//!
//! Watches /dev for devices matching the configured patterns and keeps
//! the bridge attached to the first one present. Discovery is
//! first-wins: additional matching devices are ignored until the
//! attached one disappears.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_lite::StreamExt;
use inotify::{EventMask, Inotify, WatchMask};

use crate::context::{SharedContext, UsbStatus};
use crate::serial::SerialBridge;

const DEV_DIR: &str = "/dev";

fn compile_patterns(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|raw| match glob::Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                log::warn!("ignoring bad device pattern {raw:?}: {err}");
                None
            }
        })
        .collect()
}

fn matches_any(patterns: &[glob::Pattern], path: &Path) -> bool {
    patterns.iter().any(|p| p.matches_path(path))
}

/// First device currently present that matches any configured pattern
pub fn scan_devices(patterns: &[String]) -> Option<PathBuf> {
    for raw in patterns {
        let Ok(paths) = glob::glob(raw) else { continue };
        for path in paths.flatten() {
            return Some(path);
        }
    }
    None
}

fn attach(ctx: &SharedContext, bridge: &SerialBridge, path: PathBuf) {
    match bridge.attach(&path) {
        Ok(()) => ctx.set_usb(UsbStatus::Attached(path)),
        Err(err) => log::warn!("cannot attach {}: {err}", path.display()),
    }
}

fn detach(ctx: &SharedContext, bridge: &SerialBridge) {
    bridge.detach();
    ctx.set_usb(UsbStatus::Detached);
}

/// Attach whatever is already plugged in, then follow /dev events until
/// the inotify stream ends
pub async fn run_device_watcher(
    ctx: SharedContext,
    bridge: Arc<SerialBridge>,
) -> io::Result<()> {
    let patterns = compile_patterns(&ctx.config.serial_device_patterns);

    if let Some(path) = scan_devices(&ctx.config.serial_device_patterns) {
        log::info!("found serial device {}", path.display());
        attach(&ctx, &bridge, path);
    }

    let inotify = Inotify::init()?;
    inotify
        .watches()
        .add(DEV_DIR, WatchMask::CREATE | WatchMask::DELETE)?;
    let mut stream = inotify.into_event_stream([0u8; 1024])?;

    while let Some(event) = stream.next().await {
        let event = event?;
        let Some(name) = event.name else { continue };
        let path = Path::new(DEV_DIR).join(name);

        if !matches_any(&patterns, &path) {
            continue;
        }

        if event.mask.contains(EventMask::CREATE) {
            if bridge.is_attached() {
                log::debug!("ignoring {} while a device is attached", path.display());
            } else {
                log::info!("serial device appeared: {}", path.display());
                attach(&ctx, &bridge, path);
            }
        } else if event.mask.contains(EventMask::DELETE) {
            let current = match ctx.usb() {
                UsbStatus::Attached(current) => current,
                UsbStatus::Detached => continue,
            };
            if current == path {
                log::info!("serial device removed: {}", path.display());
                detach(&ctx, &bridge);
                // another matching device may have been waiting its turn
                if let Some(next) = scan_devices(&ctx.config.serial_device_patterns) {
                    attach(&ctx, &bridge, next);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let patterns = compile_patterns(&[
            "/dev/ttyUSB*".to_string(),
            "/dev/ttyACM*".to_string(),
        ]);
        assert_eq!(patterns.len(), 2);
        assert!(matches_any(&patterns, Path::new("/dev/ttyUSB0")));
        assert!(matches_any(&patterns, Path::new("/dev/ttyACM3")));
        assert!(!matches_any(&patterns, Path::new("/dev/ttyS0")));
        assert!(!matches_any(&patterns, Path::new("/dev/sda")));
    }

    #[test]
    fn test_bad_patterns_are_dropped() {
        let patterns = compile_patterns(&["[".to_string(), "/dev/ttyUSB*".to_string()]);
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn test_scan_misses_are_none() {
        assert_eq!(scan_devices(&["/nonexistent-dir/zzz*".to_string()]), None);
    }
}
