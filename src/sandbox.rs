//! Sandboxed command execution
//!
//! Commands either run inside the provisioned root through the proot
//! launcher script or directly against the host shell. Both paths get the
//! same fixed environment view: `HOME`, `TERM`, `LANG`, `PWD`, a restricted
//! `PATH`, and the `EXTRA_BIND` list the launcher turns into proot bind
//! mounts (persistent home, virtual serial node, ioctl shim).
//!
//! ```text
//!   sandboxed:  sh <data>/scripts/run-sandbox.sh <user> <shell> -c <text>
//!   host:       sh -c <text>
//! ```
//!
//! Output is one combined stdout+stderr stream. Exit codes are reported but
//! not trusted: they cross the isolation boundary, so callers match on
//! output text (sentinel lines, status markers) to decide success.

use std::io;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};

use crate::config::Config;

/// PATH injected into every invocation; host binaries outside these
/// directories do not leak into the sandbox
const RESTRICTED_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{0}': {1}")]
    Spawn(String, io::Error),

    #[error("output pipe setup failed: {0}")]
    Pipe(nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where a command executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Host,
    Sandbox,
}

/// Account the sandboxed command runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Root,
    User,
}

/// Shell interpreting the command text inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Posix,
    Bash,
}

impl Shell {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Posix => "/bin/sh",
            Self::Bash => "/bin/bash",
        }
    }
}

/// A command plus the execution flags the launcher needs
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub text: String,
    pub target: Target,
    pub privilege: Privilege,
    pub shell: Shell,
}

impl SandboxCommand {
    /// Sandboxed root command under /bin/sh; the common case
    pub fn new(text: impl Into<String>) -> SandboxCommand {
        SandboxCommand {
            text: text.into(),
            target: Target::Sandbox,
            privilege: Privilege::Root,
            shell: Shell::Posix,
        }
    }

    /// Run directly against the host shell, skipping the launcher
    pub fn host(mut self) -> SandboxCommand {
        self.target = Target::Host;
        self
    }

    /// Run as the unprivileged service account
    pub fn as_user(mut self) -> SandboxCommand {
        self.privilege = Privilege::User;
        self
    }

    /// Interpret the text with bash instead of /bin/sh
    pub fn bash(mut self) -> SandboxCommand {
        self.shell = Shell::Bash;
        self
    }
}

/// Combined output of a finished or terminated command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Interleaved stdout+stderr, one trailing newline per line
    pub text: String,
    /// None when the process was force-terminated or killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

/// The bind list handed to the launcher via EXTRA_BIND
fn extra_bind(config: &Config) -> String {
    format!(
        "-b {}:/home -b {}:{} -b {}:/usr/lib/ioctlHook.so",
        config.home_dir().display(),
        config.serial_port_path().display(),
        config.virtual_tty,
        config.ioctl_hook_path().display(),
    )
}

/// Fixed environment view shared by host and sandboxed commands
fn command_env(config: &Config) -> Vec<(&'static str, String)> {
    vec![
        ("HOME", config.data_dir.display().to_string()),
        ("TERM", "linux".to_string()),
        ("LANG", "en_US.UTF-8".to_string()),
        ("PWD", config.data_dir.display().to_string()),
        ("PATH", RESTRICTED_PATH.to_string()),
        ("EXTRA_BIND", extra_bind(config)),
    ]
}

fn exec_user<'a>(config: &'a Config, command: &SandboxCommand) -> &'a str {
    match command.privilege {
        Privilege::Root => "root",
        Privilege::User => &config.sandbox_user,
    }
}

/// Argv for a command, `sh` first
fn build_argv(config: &Config, command: &SandboxCommand) -> Vec<String> {
    match command.target {
        Target::Host => vec![
            "sh".to_string(),
            "-c".to_string(),
            command.text.clone(),
        ],
        Target::Sandbox => vec![
            "sh".to_string(),
            config.launcher_path().display().to_string(),
            exec_user(config, command).to_string(),
            command.shell.path().to_string(),
            "-c".to_string(),
            command.text.clone(),
        ],
    }
}

/// Spawns commands with the fixed environment view
#[derive(Clone)]
pub struct Runner {
    config: Config,
}

impl Runner {
    pub fn new(config: &Config) -> Runner {
        Runner {
            config: config.clone(),
        }
    }

    /// Start a command without blocking on its output
    pub fn spawn(&self, command: &SandboxCommand) -> Result<CommandHandle, CommandError> {
        let argv = build_argv(&self.config, command);
        log::info!("$> {}", command.text);

        // One pipe receives both output streams so callers see the
        // interleaving the sandboxed tool produced
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(CommandError::Pipe)?;
        let write_dup = write_fd.try_clone()?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&self.config.data_dir);
        cmd.env_clear();
        for (key, value) in command_env(&self.config) {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::from(std::fs::File::from(write_fd)));
        cmd.stderr(Stdio::from(std::fs::File::from(write_dup)));
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| CommandError::Spawn(command.text.clone(), e))?;

        let reader = tokio::fs::File::from_std(std::fs::File::from(read_fd));
        Ok(CommandHandle {
            child,
            lines: BufReader::new(reader).lines(),
            label: command.text.clone(),
        })
    }

    /// Spawn and drain to completion
    pub async fn run(&self, command: &SandboxCommand) -> Result<CommandOutput, CommandError> {
        let mut handle = self.spawn(command)?;
        Ok(handle.drain().await?)
    }

    /// Reset the service-account and root passwords, then mark SSH as
    /// configured. Each password is deleted before being set so the
    /// change never prompts for the old value.
    pub async fn reset_password(&self, value: &str) -> Result<(), CommandError> {
        let user = self.config.sandbox_user.clone();

        self.run(&SandboxCommand::new(format!("passwd -d {user}"))).await?;
        let mut handle = self.spawn(&SandboxCommand::new(format!("passwd {user}")))?;
        handle.write_secret(value).await?;
        handle.drain().await?;

        self.run(&SandboxCommand::new("passwd -d root")).await?;
        let mut handle = self.spawn(&SandboxCommand::new("passwd root"))?;
        handle.write_secret(value).await?;
        handle.drain().await?;

        self.run(&SandboxCommand::new(format!("touch /home/{user}/.ssh_configured")))
            .await?;
        Ok(())
    }
}

/// A started command: the child plus its combined output stream
pub struct CommandHandle {
    child: Child,
    lines: Lines<BufReader<tokio::fs::File>>,
    label: String,
}

impl CommandHandle {
    /// PID of the underlying process while it runs
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Feed an interactive tool its new value twice: value, newline,
    /// flush, then the confirmation repeat. This is the passwd prompt
    /// protocol and must stay exactly this sequence.
    pub async fn write_secret(&mut self, value: &str) -> io::Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin not piped"))?;

        stdin.write_all(value.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        stdin.write_all(value.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read lines until EOF, then reap the child
    pub async fn drain(&mut self) -> io::Result<CommandOutput> {
        let mut text = String::new();
        while let Some(line) = self.lines.next_line().await? {
            log::info!("{line}");
            text.push_str(&line);
            text.push('\n');
        }

        let status = self.child.wait().await?;
        if !status.success() {
            log::warn!("'{}' exited with {}", self.label, status);
        }
        Ok(CommandOutput {
            text,
            exit_code: status.code(),
        })
    }

    /// Read lines through the first one containing `marker`, then
    /// force-terminate the process. Output past the marker is never read.
    pub async fn drain_until(&mut self, marker: &str) -> io::Result<CommandOutput> {
        let mut text = String::new();
        let mut seen = false;

        while let Some(line) = self.lines.next_line().await? {
            log::info!("{line}");
            text.push_str(&line);
            text.push('\n');
            if line.contains(marker) {
                seen = true;
                break;
            }
        }

        if !seen {
            log::warn!("'{}' ended without emitting '{}'", self.label, marker);
        }
        self.terminate().await;
        Ok(CommandOutput {
            text,
            exit_code: None,
        })
    }

    /// Force-terminate and reap; exit status is discarded
    pub async fn terminate(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/printd");
        config
    }

    #[test]
    fn test_command_defaults() {
        let cmd = SandboxCommand::new("apt-get update");
        assert_eq!(cmd.target, Target::Sandbox);
        assert_eq!(cmd.privilege, Privilege::Root);
        assert_eq!(cmd.shell, Shell::Posix);
    }

    #[test]
    fn test_host_argv_shape() {
        let config = test_config();
        let cmd = SandboxCommand::new("echo hi").host();
        let argv = build_argv(&config, &cmd);
        assert_eq!(argv, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_sandbox_argv_shape() {
        let config = test_config();
        let cmd = SandboxCommand::new("cd kiauh; bash ./install_klipper.sh")
            .as_user()
            .bash();
        let argv = build_argv(&config, &cmd);

        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "/srv/printd/scripts/run-sandbox.sh");
        assert_eq!(argv[2], "klipper");
        assert_eq!(argv[3], "/bin/bash");
        assert_eq!(argv[4], "-c");
        assert_eq!(argv[5], "cd kiauh; bash ./install_klipper.sh");
    }

    #[test]
    fn test_root_runs_as_root() {
        let config = test_config();
        let argv = build_argv(&config, &SandboxCommand::new("id"));
        assert_eq!(argv[2], "root");
        assert_eq!(argv[3], "/bin/sh");
    }

    #[test]
    fn test_env_is_fixed() {
        let config = test_config();
        let env = command_env(&config);
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get("HOME"), "/srv/printd");
        assert_eq!(get("TERM"), "linux");
        assert_eq!(get("LANG"), "en_US.UTF-8");
        assert_eq!(get("PWD"), "/srv/printd");
        assert_eq!(get("PATH"), RESTRICTED_PATH);
    }

    #[test]
    fn test_extra_bind_covers_home_serial_and_shim() {
        let config = test_config();
        let bind = extra_bind(&config);
        assert!(bind.contains("-b /srv/printd/home:/home"));
        assert!(bind.contains("-b /srv/printd/serial-port:/dev/ttyPrintd0"));
        assert!(bind.contains("-b /srv/printd/scripts/ioctl-hook.so:/usr/lib/ioctlHook.so"));
    }
}
