//! Service supervision inside the sandbox
//!
//! Units are driven through the init shim's `service <unit> <action>`
//! surface. The shim's output is the only signal we trust: exit codes do
//! not survive the isolation boundary, so liveness is read from the
//! status text instead.
//!
//! ```text
//!   start_all ──▶ service <unit> start (each unit)
//!        │
//!        └──▶ poll: service <primary> status
//!                 "Active: active"      ──▶ Running
//!                 "could not be found"  ──▶ Corrupted (pre-start check)
//! ```
//!
//! Start and stop return once the shim commands have run; the state
//! transition to Running or Stopped is published asynchronously by a
//! bounded polling task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::context::{ControlEvent, ServerStatus, SharedContext};
use crate::sandbox::{CommandError, CommandHandle, Runner, SandboxCommand};

/// Substring of `service <unit> status` output proving the unit is up
pub const ACTIVE_MARKER: &str = "Active: active";

/// Substring of status output proving the unit was never installed
pub const MISSING_MARKER: &str = "could not be found";

/// True once the initial passwords have been replaced, which is the
/// precondition for exposing the SSH daemon
pub fn is_ssh_configured(config: &Config) -> bool {
    config.user_home().join(".ssh_configured").exists()
}

async fn unit_active(runner: &Runner, unit: &str) -> bool {
    let command = SandboxCommand::new(format!("service {unit} status"));
    match runner.run(&command).await {
        Ok(output) => output.contains(ACTIVE_MARKER),
        Err(err) => {
            log::debug!("status probe for {unit} failed: {err}");
            false
        }
    }
}

async fn stack_active(runner: &Runner, config: &Config) -> bool {
    for unit in &config.services {
        if !unit_active(runner, unit).await {
            return false;
        }
    }
    true
}

/// Background task behind [`Supervisor::start_all`]: flips the state to
/// Running once every configured unit reports active
async fn poll_booted(ctx: SharedContext, runner: Runner) {
    let interval = Duration::from_millis(ctx.config.boot_poll_interval_ms);
    let mut attempt: u32 = 0;

    loop {
        if ctx.state() != ServerStatus::BootingUp {
            log::debug!("boot poll cancelled, state moved on");
            return;
        }
        if stack_active(&runner, &ctx.config).await {
            ctx.set_state(ServerStatus::Running);
            ctx.set_progress(100);
            return;
        }
        attempt += 1;
        if let Some(max) = ctx.config.boot_poll_limit {
            if attempt >= max {
                log::error!("services did not come up after {max} status checks");
                return;
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Counterpart for stopping: waits for the primary unit to go inactive
async fn poll_stopped(ctx: &SharedContext, runner: &Runner) {
    let interval = Duration::from_millis(ctx.config.stop_poll_interval_ms);
    let primary = ctx.config.primary_service().to_string();

    for _ in 0..ctx.config.stop_poll_limit {
        if ctx.state() == ServerStatus::BootingUp {
            log::debug!("stop poll cancelled, services starting again");
            return;
        }
        if !unit_active(runner, &primary).await {
            ctx.set_state(ServerStatus::Stopped);
            return;
        }
        tokio::time::sleep(interval).await;
    }
    log::warn!(
        "{primary} still active after {} status checks",
        ctx.config.stop_poll_limit
    );
}

/// Starts, stops and watches the configured service units
pub struct Supervisor {
    ctx: SharedContext,
    runner: Runner,
    ssh: Mutex<Option<CommandHandle>>,
}

impl Supervisor {
    pub fn new(ctx: SharedContext) -> Supervisor {
        let runner = Runner::new(&ctx.config);
        Supervisor {
            ctx,
            runner,
            ssh: Mutex::new(None),
        }
    }

    pub async fn start(&self, unit: &str) -> Result<(), CommandError> {
        log::info!("starting unit {unit}");
        self.runner
            .run(&SandboxCommand::new(format!("service {unit} start")))
            .await?;
        Ok(())
    }

    pub async fn stop(&self, unit: &str) -> Result<(), CommandError> {
        log::info!("stopping unit {unit}");
        self.runner
            .run(&SandboxCommand::new(format!("service {unit} stop")))
            .await?;
        Ok(())
    }

    pub async fn is_running(&self, unit: &str) -> bool {
        unit_active(&self.runner, unit).await
    }

    /// Active flag for every configured unit, in configuration order
    pub async fn status_report(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.ctx.config.services.len());
        for unit in &self.ctx.config.services {
            let active = unit_active(&self.runner, unit).await;
            report.push((unit.clone(), active));
        }
        report
    }

    /// A root whose primary unit the shim has never heard of is not a
    /// half-started stack but a broken installation
    pub async fn installed_properly(&self) -> Result<bool, CommandError> {
        let primary = self.ctx.config.primary_service();
        let output = self
            .runner
            .run(&SandboxCommand::new(format!("service {primary} status")))
            .await?;
        Ok(!output.contains(MISSING_MARKER))
    }

    /// Start every configured unit and hand liveness detection to a
    /// bounded background poll
    pub async fn start_all(&self) -> Result<(), CommandError> {
        if !self.installed_properly().await? {
            log::error!("primary service unit is missing from the sandbox");
            self.ctx.set_state(ServerStatus::Corrupted);
            return Ok(());
        }

        self.ctx.set_state(ServerStatus::BootingUp);
        self.ctx.set_progress(90);

        for unit in &self.ctx.config.services {
            self.start(unit).await?;
        }

        let ctx = self.ctx.clone();
        let runner = self.runner.clone();
        tokio::spawn(poll_booted(ctx, runner));
        Ok(())
    }

    /// Stop every unit in reverse order; the state flips to Stopped once
    /// the primary unit confirms
    pub async fn stop_all(&self) -> Result<(), CommandError> {
        for unit in self.ctx.config.services.iter().rev() {
            self.stop(unit).await?;
        }

        let ctx = self.ctx.clone();
        let runner = self.runner.clone();
        tokio::spawn(async move { poll_stopped(&ctx, &runner).await });
        Ok(())
    }

    /// Stop and immediately start again, waiting for the stop to be
    /// confirmed in between so the two polls cannot race
    pub async fn restart_all(&self) -> Result<(), CommandError> {
        for unit in self.ctx.config.services.iter().rev() {
            self.stop(unit).await?;
        }
        poll_stopped(&self.ctx, &self.runner).await;
        self.start_all().await
    }

    pub async fn start_ssh(&self) -> Result<(), CommandError> {
        let mut guard = self.ssh.lock().await;
        if guard.is_some() {
            log::debug!("ssh daemon already running");
            return Ok(());
        }
        log::info!("starting ssh daemon on port 8022");
        let handle = self
            .runner
            .spawn(&SandboxCommand::new("/usr/sbin/dropbear -p 8022 -F 2>&1"))?;
        *guard = Some(handle);
        Ok(())
    }

    pub async fn stop_ssh(&self) -> Result<(), CommandError> {
        let mut guard = self.ssh.lock().await;
        if let Some(mut handle) = guard.take() {
            log::info!("stopping ssh daemon");
            handle.terminate().await;
            self.runner
                .run(&SandboxCommand::new("kill -9 $(pidof dropbear)"))
                .await?;
        }
        Ok(())
    }
}

/// Applies control events published through the context until the
/// channel closes
pub async fn run_control_listener(supervisor: Arc<Supervisor>) {
    let mut events = supervisor.ctx.subscribe_control();

    loop {
        match events.recv().await {
            Ok(ControlEvent::StopServices) => {
                if let Err(err) = supervisor.stop_all().await {
                    log::error!("stop request failed: {err}");
                }
            }
            Ok(ControlEvent::RestartServices) => {
                if let Err(err) = supervisor.restart_all().await {
                    log::error!("restart request failed: {err}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("control listener lagged, dropped {skipped} events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CommandOutput;

    #[test]
    fn test_liveness_markers() {
        let up = CommandOutput {
            text: "printd: service klipper status\n     Active: active (running)\n".to_string(),
            exit_code: Some(0),
        };
        assert!(up.contains(ACTIVE_MARKER));
        assert!(!up.contains(MISSING_MARKER));

        let missing = CommandOutput {
            text: "Unit klipper.service could not be found.\n".to_string(),
            exit_code: Some(4),
        };
        assert!(missing.contains(MISSING_MARKER));
        assert!(!missing.contains(ACTIVE_MARKER));
    }

    #[test]
    fn test_ssh_configured_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        assert!(!is_ssh_configured(&config));

        std::fs::create_dir_all(config.user_home()).unwrap();
        std::fs::write(config.user_home().join(".ssh_configured"), "").unwrap();
        assert!(is_ssh_configured(&config));
    }
}
