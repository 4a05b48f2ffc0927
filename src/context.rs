//! Shared daemon state
//!
//! One `Context` is created at startup and handed to every component. All
//! observable state lives here behind single-writer, last-value-wins watch
//! channels; control events fan out over a bounded broadcast channel that
//! tolerates slow receivers by dropping the oldest entries.
//!
//! ```text
//!  InstallingBootstrap ─▶ InstalledBootstrap
//!          ─▶ InstallingKlipper ─▶ InstalledKlipper
//!          ─▶ InstallingMoonraker ─▶ InstalledMoonraker
//!          ─▶ InstallingMainsail ─▶ InstalledMainsail
//!          ─▶ BootingUp ─▶ Running ─▶ Stopped
//!                           │
//!                           ▼ (validation failure)
//!                       Corrupted
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::Config;

/// Capacity of the control-event broadcast queue
const CONTROL_QUEUE_DEPTH: usize = 16;

/// Consolidated daemon state, strictly forward during installation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    InstallingBootstrap,
    InstalledBootstrap,
    InstallingKlipper,
    InstalledKlipper,
    InstallingMoonraker,
    InstalledMoonraker,
    InstallingMainsail,
    InstalledMainsail,
    BootingUp,
    Running,
    Stopped,
    Corrupted,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstallingBootstrap => "installing-bootstrap",
            Self::InstalledBootstrap => "installed-bootstrap",
            Self::InstallingKlipper => "installing-klipper",
            Self::InstalledKlipper => "installed-klipper",
            Self::InstallingMoonraker => "installing-moonraker",
            Self::InstalledMoonraker => "installed-moonraker",
            Self::InstallingMainsail => "installing-mainsail",
            Self::InstalledMainsail => "installed-mainsail",
            Self::BootingUp => "booting-up",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Corrupted => "corrupted",
        }
    }

    /// True while any provisioning stage is in flight
    pub fn is_installing(&self) -> bool {
        matches!(
            self,
            Self::InstallingBootstrap
                | Self::InstalledBootstrap
                | Self::InstallingKlipper
                | Self::InstalledKlipper
                | Self::InstallingMoonraker
                | Self::InstalledMoonraker
                | Self::InstallingMainsail
                | Self::InstalledMainsail
        )
    }

    /// True once the stack answers liveness polls
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Physical serial device attachment, as seen by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UsbStatus {
    #[default]
    Detached,
    Attached(PathBuf),
}

impl UsbStatus {
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached(_))
    }

    pub fn device(&self) -> Option<&std::path::Path> {
        match self {
            Self::Attached(path) => Some(path),
            Self::Detached => None,
        }
    }
}

/// Out-of-band requests arriving over the sandbox control pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    StopServices,
    RestartServices,
}

impl ControlEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopServices => "stop",
            Self::RestartServices => "restart",
        }
    }
}

/// Shared handle owning configuration and all observable state
pub struct Context {
    pub config: Config,
    state_tx: watch::Sender<ServerStatus>,
    progress_tx: watch::Sender<u8>,
    usb_tx: watch::Sender<UsbStatus>,
    control_tx: broadcast::Sender<ControlEvent>,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(config: Config) -> SharedContext {
        let (state_tx, _) = watch::channel(ServerStatus::Stopped);
        let (progress_tx, _) = watch::channel(0);
        let (usb_tx, _) = watch::channel(UsbStatus::Detached);
        let (control_tx, _) = broadcast::channel(CONTROL_QUEUE_DEPTH);

        Arc::new(Context {
            config,
            state_tx,
            progress_tx,
            usb_tx,
            control_tx,
        })
    }

    pub fn state(&self) -> ServerStatus {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, status: ServerStatus) {
        let previous = self.state();
        if previous != status {
            log::info!("state: {} -> {}", previous.as_str(), status.as_str());
        }
        let _ = self.state_tx.send(status);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerStatus> {
        self.state_tx.subscribe()
    }

    /// Installation progress, 0-100
    pub fn progress(&self) -> u8 {
        *self.progress_tx.borrow()
    }

    pub fn set_progress(&self, percent: u8) {
        let _ = self.progress_tx.send(percent.min(100));
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress_tx.subscribe()
    }

    pub fn usb(&self) -> UsbStatus {
        self.usb_tx.borrow().clone()
    }

    pub fn set_usb(&self, status: UsbStatus) {
        match &status {
            UsbStatus::Attached(path) => log::info!("serial device attached: {}", path.display()),
            UsbStatus::Detached => log::info!("serial device detached"),
        }
        let _ = self.usb_tx.send(status);
    }

    pub fn subscribe_usb(&self) -> watch::Receiver<UsbStatus> {
        self.usb_tx.subscribe()
    }

    /// Publish a control event to every listener; events sent while no
    /// listener exists are dropped
    pub fn publish_control(&self, event: ControlEvent) {
        log::debug!("control event: {}", event.as_str());
        let _ = self.control_tx.send(event);
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }
}
