//! Daemon configuration
//!
//! Loaded from a TOML file; every field has a default so the daemon runs
//! without any configuration present. The data directory layout is derived
//! here and nowhere else:
//!
//! ```text
//! <data>/
//!   rootfs/           committed sandbox root
//!   rootfs.staging/   staging root while provisioning
//!   system_status/    <stage>.installed completion markers
//!   home/<user>/      persistent home, bind-mounted to /home
//!   scripts/          launcher + installer script artifacts
//!   cache/            downloaded archives
//!   serial-port       symlink to the pty slave
//!   event-pipe        control FIFO written from inside the sandbox
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

/// Daemon configuration, deserialized from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base data directory; everything the daemon owns lives below it
    pub data_dir: PathBuf,
    /// Remote image index (one record per line, semicolon-delimited)
    pub index_url: String,
    /// Base URL the index's relative download paths are joined to
    pub download_base_url: String,
    /// Distribution name to provision
    pub distro: String,
    /// Distribution release to provision
    pub release: String,
    /// Image build type accepted from the index ("default" or "musl")
    pub build_type: String,
    /// Local archive to provision from instead of downloading
    pub rootfs_archive: Option<PathBuf>,
    /// Unprivileged account created inside the sandbox
    pub sandbox_user: String,
    /// Supervised service units, primary first
    pub services: Vec<String>,
    /// Device path the virtual serial port is bound to inside the sandbox
    pub virtual_tty: String,
    /// Baud rate applied to attached serial devices
    pub baud_rate: u32,
    /// Globs matched against /dev entries when discovering printers
    pub serial_device_patterns: Vec<String>,
    /// Delay between liveness polls while booting
    pub boot_poll_interval_ms: u64,
    /// Liveness poll attempts before giving up; None polls forever
    pub boot_poll_limit: Option<u32>,
    /// Delay between polls while waiting for services to stop
    pub stop_poll_interval_ms: u64,
    /// Poll attempts before the stop wait gives up
    pub stop_poll_limit: u32,
    /// Launch dropbear inside the sandbox once services are up
    pub enable_ssh: bool,
    /// Extra log sink; stdout is always logged
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            index_url: "https://images.linuxcontainers.org/meta/1.0/index-user".to_string(),
            download_base_url: "https://images.linuxcontainers.org".to_string(),
            distro: "ubuntu".to_string(),
            release: "jammy".to_string(),
            build_type: "default".to_string(),
            rootfs_archive: None,
            sandbox_user: "klipper".to_string(),
            services: vec![
                "klipper".to_string(),
                "moonraker".to_string(),
                "nginx".to_string(),
            ],
            virtual_tty: "/dev/ttyPrintd0".to_string(),
            baud_rate: 115200,
            serial_device_patterns: vec![
                "/dev/ttyUSB*".to_string(),
                "/dev/ttyACM*".to_string(),
            ],
            boot_poll_interval_ms: 1000,
            boot_poll_limit: Some(120),
            stop_poll_interval_ms: 500,
            stop_poll_limit: 60,
            enable_ssh: false,
            log_file: None,
        }
    }
}

/// Default data directory: $XDG_DATA_HOME/printd, or /var/lib/printd
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("printd"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/printd"))
}

impl Config {
    /// Load configuration from an explicit path
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Load from the first config file found in the standard locations,
    /// falling back to defaults when none exists
    pub fn load_or_default() -> Result<Config, ConfigError> {
        for path in default_config_paths() {
            if path.exists() {
                return Config::load(&path);
            }
        }
        Ok(Config::default())
    }

    /// Committed sandbox root
    pub fn rootfs_dir(&self) -> PathBuf {
        self.data_dir.join("rootfs")
    }

    /// Staging root populated during provisioning
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("rootfs.staging")
    }

    /// Directory holding stage completion markers
    pub fn markers_dir(&self) -> PathBuf {
        self.data_dir.join("system_status")
    }

    /// Marker file recording a completed installation stage
    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.markers_dir().join(format!("{name}.installed"))
    }

    /// Persistent home tree bound to /home inside the sandbox
    pub fn home_dir(&self) -> PathBuf {
        self.data_dir.join("home")
    }

    /// Home of the sandbox service account
    pub fn user_home(&self) -> PathBuf {
        self.home_dir().join(&self.sandbox_user)
    }

    /// Collaborator script artifacts (launcher, installers, init shim)
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    /// The proot launcher script
    pub fn launcher_path(&self) -> PathBuf {
        self.scripts_dir().join("run-sandbox.sh")
    }

    /// Shared-library shim bound to /usr/lib/ioctlHook.so in the sandbox
    pub fn ioctl_hook_path(&self) -> PathBuf {
        self.scripts_dir().join("ioctl-hook.so")
    }

    /// Scratch directory for downloaded archives
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Host-side path of the virtual serial node
    pub fn serial_port_path(&self) -> PathBuf {
        self.data_dir.join("serial-port")
    }

    /// Control-event FIFO written from inside the sandbox
    pub fn event_pipe_path(&self) -> PathBuf {
        self.data_dir.join("event-pipe")
    }

    /// The unit whose liveness stands for the whole stack
    pub fn primary_service(&self) -> &str {
        self.services.first().map(String::as_str).unwrap_or("klipper")
    }

    /// Create the directories the daemon expects under the data dir
    pub fn ensure_layout(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.markers_dir())?;
        std::fs::create_dir_all(self.user_home())?;
        std::fs::create_dir_all(self.scripts_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}

/// Standard config locations, most specific first
fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("printd").join("printd.toml"));
    }
    paths.push(PathBuf::from("/etc/printd/printd.toml"));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.distro, "ubuntu");
        assert_eq!(config.release, "jammy");
        assert_eq!(config.services.len(), 3);
        assert_eq!(config.primary_service(), "klipper");
        assert!(config.boot_poll_limit.is_some());
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/printd");

        assert_eq!(config.rootfs_dir(), PathBuf::from("/srv/printd/rootfs"));
        assert_eq!(config.staging_dir(), PathBuf::from("/srv/printd/rootfs.staging"));
        assert_eq!(
            config.marker_path("bootstrap"),
            PathBuf::from("/srv/printd/system_status/bootstrap.installed")
        );
        assert_eq!(config.user_home(), PathBuf::from("/srv/printd/home/klipper"));
        assert_eq!(config.serial_port_path(), PathBuf::from("/srv/printd/serial-port"));
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            distro = "debian"
            release = "bookworm"
            boot_poll_limit = 10
            services = ["klipper", "moonraker"]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.distro, "debian");
        assert_eq!(parsed.release, "bookworm");
        assert_eq!(parsed.boot_poll_limit, Some(10));
        assert_eq!(parsed.services, vec!["klipper", "moonraker"]);
        // Untouched fields keep their defaults
        assert_eq!(parsed.build_type, "default");
        assert_eq!(parsed.sandbox_user, "klipper");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.distro, Config::default().distro);
        assert_eq!(parsed.baud_rate, Config::default().baud_rate);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Config::load(Path::new("/nonexistent/printd.toml"));
        assert!(matches!(err, Err(ConfigError::Read(_, _))));
    }
}
