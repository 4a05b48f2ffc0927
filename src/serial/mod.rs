//! Virtual serial port bridge
//!
//! The sandboxed firmware stack talks to printer hardware through a pty
//! whose slave side is bound into the sandbox at a fixed device path.
//! The daemon owns the master side and relays bytes to whichever real
//! device is currently attached:
//!
//! ```text
//!   sandbox app ──▶ virtual tty ──▶ pty slave
//!                                      │
//!                      pty master ◀────┘
//!                        │  ▲
//!                outbound│  │inbound        (blocking pump threads)
//!                        ▼  │
//!                   /dev/ttyUSB0 (when attached)
//! ```
//!
//! With no device attached, outbound bytes are drained and discarded so
//! the application never blocks on a full pty buffer. The bridge holds
//! its own handle on the slave side, which keeps the master readable
//! even while the sandbox has the port closed.

pub mod events;
pub mod watch;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, FromRawFd, IntoRawFd};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{
    cfgetospeed, cfmakeraw, cfsetspeed, tcgetattr, tcsetattr, BaudRate, SetArg,
};
use thiserror::Error;

use crate::config::Config;

const POLL_INTERVAL_MS: u16 = 200;
const PUMP_BUF_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("pty setup failed: {0}")]
    Pty(#[source] nix::errno::Errno),

    #[error("unsupported baud rate {0}")]
    Baud(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn baud_to_rate(baud: u32) -> Option<BaudRate> {
    match baud {
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        460800 => Some(BaudRate::B460800),
        500000 => Some(BaudRate::B500000),
        921600 => Some(BaudRate::B921600),
        1000000 => Some(BaudRate::B1000000),
        _ => None,
    }
}

fn rate_to_baud(rate: BaudRate) -> u32 {
    match rate {
        BaudRate::B9600 => 9600,
        BaudRate::B19200 => 19200,
        BaudRate::B38400 => 38400,
        BaudRate::B57600 => 57600,
        BaudRate::B115200 => 115200,
        BaudRate::B230400 => 230400,
        BaudRate::B460800 => 460800,
        BaudRate::B500000 => 500000,
        BaudRate::B921600 => 921600,
        BaudRate::B1000000 => 1000000,
        _ => 0,
    }
}

fn make_raw(file: &File) -> Result<(), BridgeError> {
    let mut termios = tcgetattr(file).map_err(BridgeError::Pty)?;
    cfmakeraw(&mut termios);
    tcsetattr(file, SetArg::TCSANOW, &termios).map_err(BridgeError::Pty)?;
    Ok(())
}

/// Wait for readable data, returning false on timeout
fn wait_readable(file: &File) -> bool {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => {
            log::debug!("poll failed: {err}");
            false
        }
    }
}

/// Duplicate handle on the current device, held only briefly under the
/// lock so the two pumps never stall each other
fn current_device(device: &Mutex<Option<File>>) -> Option<File> {
    let guard = device.lock().ok()?;
    guard.as_ref().and_then(|dev| dev.try_clone().ok())
}

fn drop_device(device: &Mutex<Option<File>>) {
    if let Ok(mut guard) = device.lock() {
        guard.take();
    }
}

/// Relays pty master output to the attached device, discarding it while
/// no device is present
fn pump_outbound(stop: Arc<AtomicBool>, master: File, device: Arc<Mutex<Option<File>>>) {
    let mut buf = [0u8; PUMP_BUF_SIZE];

    while !stop.load(Ordering::Relaxed) {
        if !wait_readable(&master) {
            continue;
        }
        let n = match (&master).read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(err) => {
                log::error!("virtual port read failed: {err}");
                return;
            }
        };

        let Some(dev) = current_device(&device) else {
            continue;
        };
        if let Err(err) = (&dev).write_all(&buf[..n]).and_then(|_| (&dev).flush()) {
            log::warn!("device write failed, detaching: {err}");
            drop_device(&device);
        }
    }
}

/// Relays device input back into the pty master
fn pump_inbound(stop: Arc<AtomicBool>, master: File, device: Arc<Mutex<Option<File>>>) {
    let mut buf = [0u8; PUMP_BUF_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let Some(dev) = current_device(&device) else {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
            continue;
        };
        if !wait_readable(&dev) {
            continue;
        }
        let n = match (&dev).read(&mut buf) {
            Ok(0) => {
                log::warn!("device closed, detaching");
                drop_device(&device);
                continue;
            }
            Ok(n) => n,
            Err(err) => {
                log::warn!("device read failed, detaching: {err}");
                drop_device(&device);
                continue;
            }
        };

        if let Err(err) = (&master).write_all(&buf[..n]) {
            log::error!("virtual port write failed: {err}");
            return;
        }
    }
}

/// The pty pair plus the pump threads moving bytes across it
pub struct SerialBridge {
    config: Config,
    // kept open so the master never sees EIO while the sandbox side is closed
    slave: File,
    slave_path: PathBuf,
    device: Arc<Mutex<Option<File>>>,
    stop: Arc<AtomicBool>,
}

impl SerialBridge {
    /// Create the pty, publish the slave under the well-known link and
    /// start both pump threads
    pub fn spawn(config: &Config) -> Result<SerialBridge, BridgeError> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(BridgeError::Pty)?;
        grantpt(&master).map_err(BridgeError::Pty)?;
        unlockpt(&master).map_err(BridgeError::Pty)?;
        let slave_path = PathBuf::from(ptsname_r(&master).map_err(BridgeError::Pty)?);

        // unwrap the PtyMaster into a plain File for the pump threads
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        let slave = OpenOptions::new().read(true).write(true).open(&slave_path)?;

        make_raw(&master)?;
        make_raw(&slave)?;

        let link = config.serial_port_path();
        match std::fs::remove_file(&link) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(BridgeError::Io(err)),
        }
        symlink(&slave_path, &link)?;
        log::info!(
            "virtual serial port at {} -> {}",
            link.display(),
            slave_path.display()
        );

        let device = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let outbound_master = master.try_clone()?;
        {
            let stop = stop.clone();
            let device = device.clone();
            tokio::task::spawn_blocking(move || pump_outbound(stop, outbound_master, device));
        }
        {
            let stop = stop.clone();
            let device = device.clone();
            tokio::task::spawn_blocking(move || pump_inbound(stop, master, device));
        }

        Ok(SerialBridge {
            config: config.clone(),
            slave,
            slave_path,
            device,
            stop,
        })
    }

    /// Path of the pty slave backing the virtual port
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Baud rate most recently configured on the virtual port, falling
    /// back to the configured default when none was set
    pub fn requested_baud(&self) -> u32 {
        let rate = tcgetattr(&self.slave).map(|t| cfgetospeed(&t)).ok();
        match rate.map(rate_to_baud) {
            Some(baud) if baud > 0 => baud,
            _ => self.config.baud_rate,
        }
    }

    /// Open the given device, match its speed to the virtual port and
    /// start relaying
    pub fn attach(&self, path: &Path) -> Result<(), BridgeError> {
        let baud = self.requested_baud();
        let rate = baud_to_rate(baud).ok_or(BridgeError::Baud(baud))?;

        let dev = OpenOptions::new().read(true).write(true).open(path)?;
        let mut termios = tcgetattr(&dev).map_err(BridgeError::Pty)?;
        cfmakeraw(&mut termios);
        cfsetspeed(&mut termios, rate).map_err(BridgeError::Pty)?;
        tcsetattr(&dev, SetArg::TCSANOW, &termios).map_err(BridgeError::Pty)?;

        if let Ok(mut guard) = self.device.lock() {
            *guard = Some(dev);
        }
        log::info!("attached {} at {} baud", path.display(), baud);
        Ok(())
    }

    /// Drop the current device; the virtual port stays up
    pub fn detach(&self) {
        if let Ok(mut guard) = self.device.lock() {
            if guard.take().is_some() {
                log::info!("detached serial device");
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.device.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Signal the pump threads to exit; they notice within one poll
    /// interval
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.detach();
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_mapping_round_trip() {
        for baud in [9600u32, 19200, 38400, 57600, 115200, 230400, 460800, 921600] {
            let rate = baud_to_rate(baud).unwrap();
            assert_eq!(rate_to_baud(rate), baud);
        }
        assert!(baud_to_rate(1234).is_none());
        assert_eq!(rate_to_baud(BaudRate::B0), 0);
    }

    #[tokio::test]
    async fn test_bridge_publishes_slave_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        let bridge = SerialBridge::spawn(&config).unwrap();
        let link = config.serial_port_path();
        assert_eq!(std::fs::read_link(&link).unwrap(), bridge.slave_path());
        assert!(!bridge.is_attached());

        // default applies while the application never configured a speed
        let baud = bridge.requested_baud();
        assert!(baud == config.baud_rate || baud_to_rate(baud).is_some());

        bridge.stop();
    }

    #[tokio::test]
    async fn test_bridge_replaces_stale_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        std::os::unix::fs::symlink("/nonexistent", config.serial_port_path()).unwrap();
        let bridge = SerialBridge::spawn(&config).unwrap();
        assert_eq!(
            std::fs::read_link(config.serial_port_path()).unwrap(),
            bridge.slave_path()
        );
        bridge.stop();
    }
}
