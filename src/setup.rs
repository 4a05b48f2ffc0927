//! Installation pipeline
//!
//! Provisioning is a strictly ordered sequence of stages, each recorded by
//! a marker file once complete:
//!
//! ```text
//!   bootstrap ──▶ klipper ──▶ moonraker ──▶ mainsail ──▶ (boot services)
//!       │             │            │             │
//!       └─────────────┴────────────┴─────────────┴── system_status/<stage>.installed
//! ```
//!
//! Markers are the sole source of truth: a stage whose marker exists is
//! skipped without running any of its commands, so the pipeline can be
//! re-entered safely after a crash or restart. A failed stage leaves
//! earlier markers in place and the next run resumes there.
//!
//! The bootstrap stage provisions the root and configures it with direct
//! commands that complete on exit. The component stages each drive one
//! third-party installer script and block on its completion sentinel
//! instead of the exit code, then force-terminate the script.

use std::fs;
use std::io;

use thiserror::Error;

use crate::context::{ServerStatus, SharedContext};
use crate::images::{host_arch, ImageIndex, ResolveError};
use crate::rootfs::{self, ArchiveSource, InstallError};
use crate::sandbox::{CommandError, Runner, SandboxCommand};
use crate::services::Supervisor;

/// Line emitted by installer scripts when they are logically done
pub const DONE_SENTINEL: &str = ">> DONE INSTALLING";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("stage {stage} never reported completion")]
    Incomplete { stage: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Provisioning stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Bootstrap,
    Klipper,
    Moonraker,
    Mainsail,
}

impl InstallStage {
    pub const ALL: [InstallStage; 4] = [
        InstallStage::Bootstrap,
        InstallStage::Klipper,
        InstallStage::Moonraker,
        InstallStage::Mainsail,
    ];

    /// Marker file stem for this stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Klipper => "klipper",
            Self::Moonraker => "moonraker",
            Self::Mainsail => "mainsail",
        }
    }

    pub fn installing(&self) -> ServerStatus {
        match self {
            Self::Bootstrap => ServerStatus::InstallingBootstrap,
            Self::Klipper => ServerStatus::InstallingKlipper,
            Self::Moonraker => ServerStatus::InstallingMoonraker,
            Self::Mainsail => ServerStatus::InstallingMainsail,
        }
    }

    pub fn installed(&self) -> ServerStatus {
        match self {
            Self::Bootstrap => ServerStatus::InstalledBootstrap,
            Self::Klipper => ServerStatus::InstalledKlipper,
            Self::Moonraker => ServerStatus::InstalledMoonraker,
            Self::Mainsail => ServerStatus::InstalledMainsail,
        }
    }

    /// Progress checkpoint reported once this stage completes
    fn completed_progress(&self) -> u8 {
        match self {
            Self::Bootstrap => 35,
            Self::Klipper => 50,
            Self::Moonraker => 65,
            Self::Mainsail => 80,
        }
    }
}

/// How a step signals it is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Process exit ends the step
    Exit,
    /// The completion sentinel ends the step; the process is then killed
    Sentinel,
}

/// One command of a stage's fixed script
#[derive(Debug, Clone)]
pub struct StageStep {
    pub command: SandboxCommand,
    pub completion: Completion,
}

impl StageStep {
    fn to_exit(command: SandboxCommand) -> StageStep {
        StageStep {
            command,
            completion: Completion::Exit,
        }
    }

    fn until_sentinel(command: SandboxCommand) -> StageStep {
        StageStep {
            command,
            completion: Completion::Sentinel,
        }
    }
}

/// Root configuration commands run before the service account exists
fn bootstrap_steps() -> Vec<StageStep> {
    vec![
        StageStep::to_exit(SandboxCommand::new(
            "chmod a+x /usr/bin/nop.sh; \
             ln -sf /usr/bin/nop.sh /usr/bin/update-rc.d; \
             ln -sf /usr/bin/nop.sh /usr/bin/deb-systemd-helper",
        )),
        StageStep::to_exit(SandboxCommand::new("apt-get update --allow-releaseinfo-change")),
        StageStep::to_exit(SandboxCommand::new("apt-get install -q -y --reinstall adduser")),
        StageStep::to_exit(SandboxCommand::new(
            "apt-get install -q -y dropbear curl bash sudo git unzip inetutils-traceroute 2>&1",
        )),
        StageStep::to_exit(SandboxCommand::new(
            "mv /bin/systemctl /bin/systemctl.org; \
             mv /bin/systemctl.new /bin/systemctl; \
             chmod a+x /bin/systemctl",
        )),
        StageStep::to_exit(SandboxCommand::new("ssh-keygen -A 2>&1")),
    ]
}

/// Service-account setup; `user` is the configured sandbox account
fn account_steps(user: &str) -> Vec<StageStep> {
    vec![
        StageStep::to_exit(SandboxCommand::new(format!(
            "mkdir /home/{user}; useradd -U -m -d /home/{user} {user}"
        ))),
        StageStep::to_exit(SandboxCommand::new(format!(
            "echo '{user}     ALL=(ALL) NOPASSWD:ALL' >> /etc/sudoers"
        ))),
    ]
}

/// Build toolchain and installer fetch, run once passwords are set
fn toolchain_steps(user: &str) -> Vec<StageStep> {
    vec![
        StageStep::to_exit(SandboxCommand::new(
            "apt-get install -q -y python3 python3-virtualenv virtualenv python3-dev \
             libffi-dev build-essential libncurses-dev libusb-dev avrdude gcc-avr \
             binutils-avr avr-libc stm32flash libnewlib-arm-none-eabi gcc-arm-none-eabi \
             binutils-arm-none-eabi libusb-1.0 pkg-config dfu-util 2>&1",
        )),
        StageStep::to_exit(SandboxCommand::new(format!(
            "cd /home/{user}; chown {user} get_kiauh.sh; chmod a+x get_kiauh.sh; \
             chown -R {user} /home/{user}/scripts"
        ))),
        StageStep::to_exit(SandboxCommand::new("bash ./get_kiauh.sh").as_user()),
    ]
}

/// The single installer-script step of a component stage
fn component_steps(stage: InstallStage) -> Vec<StageStep> {
    let script = match stage {
        InstallStage::Bootstrap => return Vec::new(),
        InstallStage::Klipper => "install_klipper.sh",
        InstallStage::Moonraker => "install_moonraker.sh",
        InstallStage::Mainsail => "install_mainsail.sh",
    };

    vec![StageStep::until_sentinel(
        SandboxCommand::new(format!("cd kiauh; bash ./{script}")).as_user().bash(),
    )]
}

/// Drives the installation stages and hands off to the supervisor
pub struct Installer {
    ctx: SharedContext,
    runner: Runner,
}

impl Installer {
    pub fn new(ctx: SharedContext) -> Installer {
        let runner = Runner::new(&ctx.config);
        Installer { ctx, runner }
    }

    pub fn is_stage_installed(&self, stage: InstallStage) -> bool {
        self.ctx.config.marker_path(stage.as_str()).exists()
    }

    pub fn is_fully_installed(&self) -> bool {
        InstallStage::ALL.iter().all(|s| self.is_stage_installed(*s))
    }

    fn mark_stage_installed(&self, stage: InstallStage) -> io::Result<()> {
        fs::create_dir_all(self.ctx.config.markers_dir())?;
        let marker = self.ctx.config.marker_path(stage.as_str());
        fs::write(&marker, format!("{}\n", chrono::Utc::now().to_rfc3339()))?;
        log::debug!("wrote stage marker {}", marker.display());
        Ok(())
    }

    /// Resume at the first incomplete stage; a fully installed system
    /// reduces this to a sequence of marker checks
    pub async fn run_stages(&self) -> Result<(), SetupError> {
        self.ctx.config.ensure_layout()?;

        for stage in InstallStage::ALL {
            if self.is_stage_installed(stage) {
                log::info!("stage {} already installed, skipping", stage.as_str());
                self.ctx.set_state(stage.installed());
                continue;
            }

            self.ctx.set_state(stage.installing());
            self.run_stage(stage).await?;
            self.mark_stage_installed(stage)?;
            self.ctx.set_state(stage.installed());
            self.ctx.set_progress(stage.completed_progress());
        }
        Ok(())
    }

    /// Entry point for the daemon: install whatever is missing, then
    /// hand off to the supervisor
    pub async fn begin_installation(&self, supervisor: &Supervisor) -> Result<(), SetupError> {
        self.run_stages().await?;

        supervisor.start_all().await?;

        if self.ctx.config.enable_ssh && crate::services::is_ssh_configured(&self.ctx.config) {
            supervisor.start_ssh().await?;
        }
        Ok(())
    }

    async fn run_stage(&self, stage: InstallStage) -> Result<(), SetupError> {
        log::info!("running stage {}", stage.as_str());

        if stage == InstallStage::Bootstrap {
            return self.run_bootstrap().await;
        }
        for step in component_steps(stage) {
            self.run_step(&step, stage).await?;
        }
        Ok(())
    }

    async fn run_bootstrap(&self) -> Result<(), SetupError> {
        let config = &self.ctx.config;

        if !rootfs::is_provisioned(config) {
            let source = self.archive_source().await?;
            rootfs::provision(&self.ctx, &source).await?;
        } else {
            log::debug!("sandbox root present, skipping provisioning");
        }

        self.install_host_payload()?;
        self.ctx.set_progress(20);

        for step in bootstrap_steps() {
            self.run_step(&step, InstallStage::Bootstrap).await?;
        }
        for step in account_steps(&config.sandbox_user) {
            self.run_step(&step, InstallStage::Bootstrap).await?;
        }

        self.set_initial_passwords().await?;

        for step in toolchain_steps(&config.sandbox_user) {
            self.run_step(&step, InstallStage::Bootstrap).await?;
        }
        Ok(())
    }

    async fn archive_source(&self) -> Result<ArchiveSource, SetupError> {
        let config = &self.ctx.config;

        if let Some(path) = &config.rootfs_archive {
            return Ok(ArchiveSource::Local(path.clone()));
        }

        let index = ImageIndex::new(config)?;
        let asset = index
            .resolve(&config.distro, &config.release, host_arch())
            .await?;
        log::info!(
            "resolved {} {} ({}) image from {}",
            asset.distro,
            asset.release,
            asset.arch,
            asset.timestamp
        );
        Ok(ArchiveSource::Remote(asset))
    }

    /// Host-side files written into the fresh root before any sandboxed
    /// command runs: the no-op service hook, the init shim payload staged
    /// as /bin/systemctl.new, and the installer scripts for the service
    /// account's home.
    fn install_host_payload(&self) -> io::Result<()> {
        let config = &self.ctx.config;
        let root = config.rootfs_dir();

        let nop = root.join("usr/bin/nop.sh");
        if let Some(parent) = nop.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&nop, "#!/bin/sh\nexit 0\n")?;

        let shim = config.scripts_dir().join("systemctl3.py");
        if shim.exists() {
            fs::create_dir_all(root.join("bin"))?;
            fs::copy(&shim, root.join("bin/systemctl.new"))?;
        } else {
            log::warn!("init shim payload missing at {}", shim.display());
        }

        self.copy_installer_scripts()
    }

    /// Lay the collaborator scripts into the service account's home.
    /// get_kiauh.sh lands in the home root, the rest under scripts/.
    fn copy_installer_scripts(&self) -> io::Result<()> {
        let config = &self.ctx.config;
        let home = config.user_home();
        let scripts = home.join("scripts");
        fs::create_dir_all(&scripts)?;

        for entry in fs::read_dir(config.scripts_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !name.ends_with(".sh") || name == "run-sandbox.sh" {
                continue;
            }
            let target = if name == "get_kiauh.sh" {
                home.join(name.as_ref())
            } else {
                scripts.join(name.as_ref())
            };
            fs::copy(entry.path(), &target)?;
        }
        Ok(())
    }

    /// Initial passwords for root and the service account; both default
    /// to the account name until the user resets them
    async fn set_initial_passwords(&self) -> Result<(), SetupError> {
        let user = self.ctx.config.sandbox_user.clone();

        let mut root_pw = self.runner.spawn(&SandboxCommand::new("passwd"))?;
        root_pw.write_secret(&user).await?;
        root_pw.drain().await?;

        let mut user_pw = self.runner.spawn(&SandboxCommand::new(format!("passwd {user}")))?;
        user_pw.write_secret(&user).await?;
        user_pw.drain().await?;
        Ok(())
    }

    async fn run_step(&self, step: &StageStep, stage: InstallStage) -> Result<(), SetupError> {
        let mut handle = self.runner.spawn(&step.command)?;

        match step.completion {
            Completion::Exit => {
                handle.drain().await?;
            }
            Completion::Sentinel => {
                let output = handle.drain_until(DONE_SENTINEL).await?;
                if !output.contains(DONE_SENTINEL) {
                    return Err(SetupError::Incomplete {
                        stage: stage.as_str(),
                    });
                }
            }
        }
        Ok(())
    }
}
