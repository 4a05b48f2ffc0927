//! printd - sandboxed Klipper stack daemon
//!
//! `printd run` provisions a Linux userland under the data directory,
//! installs the printer stack into it and supervises the services,
//! bridging them to real hardware over a virtual serial port.
//!
//! The other subcommands are one-shot: they act on the same data
//! directory and sandbox without a running daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use printd::config::Config;
use printd::context::{Context, ServerStatus, SharedContext};
use printd::images::{host_arch, ImageIndex};
use printd::sandbox::{Runner, SandboxCommand};
use printd::serial::{self, SerialBridge};
use printd::services::{self, Supervisor};
use printd::setup::{InstallStage, Installer};

#[derive(Parser)]
#[command(name = "printd")]
#[command(about = "Klipper host stack in a proot sandbox")]
#[command(
    long_about = "printd provisions a Linux userland from container images, installs \
    Klipper, Moonraker and Mainsail inside it and supervises them, bridging the \
    sandboxed stack to printer hardware over a virtual serial port."
)]
struct Args {
    /// Path to the configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: install what is missing, start services, bridge serial
    Run,

    /// Run the installation stages and exit without starting services
    Install,

    /// Start the configured services
    Start,

    /// Stop the configured services
    Stop,

    /// Show installation and service status
    Status,

    /// Resolve the rootfs image that provisioning would download
    Resolve {
        /// Native architecture to resolve for (defaults to the host's)
        #[arg(long)]
        arch: Option<String>,
    },

    /// Reset the sandbox account and root passwords
    SetPassword {
        /// New password for both accounts
        value: String,
    },

    /// Run a command inside the sandbox
    Exec {
        /// Run against the host shell instead
        #[arg(long)]
        host: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("printd: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match args.command {
        Command::Run => run_daemon(config).await,
        Command::Install => {
            init_cli_logging("info");
            let ctx = Context::new(config);
            Installer::new(ctx).run_stages().await?;
            println!("installation complete");
            Ok(())
        }
        Command::Start => {
            init_cli_logging("warn");
            let ctx = Context::new(config);
            let supervisor = Supervisor::new(ctx.clone());
            supervisor.start_all().await?;

            let timeout = boot_timeout(&ctx.config);
            if wait_for_state(&ctx, ServerStatus::Running, timeout).await {
                print_units(&supervisor).await;
                Ok(())
            } else if ctx.state() == ServerStatus::Corrupted {
                Err("installation is corrupted; re-run `printd install`".into())
            } else {
                Err("services did not come up in time".into())
            }
        }
        Command::Stop => {
            init_cli_logging("warn");
            let ctx = Context::new(config);
            let supervisor = Supervisor::new(ctx.clone());
            supervisor.stop_all().await?;

            let timeout = stop_timeout(&ctx.config);
            if wait_for_state(&ctx, ServerStatus::Stopped, timeout).await {
                Ok(())
            } else {
                Err("services did not stop in time".into())
            }
        }
        Command::Status => {
            init_cli_logging("warn");
            let ctx = Context::new(config);
            let installer = Installer::new(ctx.clone());

            println!("Installation:");
            for stage in InstallStage::ALL {
                let mark = if installer.is_stage_installed(stage) { '●' } else { '○' };
                println!("  {} {}", mark, stage.as_str());
            }

            if installer.is_fully_installed() {
                println!("Services:");
                let supervisor = Supervisor::new(ctx.clone());
                print_units(&supervisor).await;
            }

            match serial::watch::scan_devices(&ctx.config.serial_device_patterns) {
                Some(dev) => println!("Serial device: {}", dev.display()),
                None => println!("Serial device: none"),
            }
            Ok(())
        }
        Command::Resolve { arch } => {
            init_cli_logging("warn");
            let index = ImageIndex::new(&config)?;
            let arch = arch.as_deref().unwrap_or_else(|| host_arch());
            let asset = index.resolve(&config.distro, &config.release, arch).await?;

            println!("● {} {}", asset.distro, asset.release);
            println!("     Arch: {}", asset.arch);
            println!("    Built: {}", asset.timestamp);
            println!("      URL: {}", asset.url);
            Ok(())
        }
        Command::SetPassword { value } => {
            init_cli_logging("warn");
            Runner::new(&config).reset_password(&value).await?;
            println!("passwords updated");
            Ok(())
        }
        Command::Exec { host, args } => {
            init_cli_logging("warn");
            let text = shlex::try_join(args.iter().map(String::as_str))
                .map_err(|e| format!("cannot quote command: {e}"))?;

            let command = if host {
                SandboxCommand::new(text).host()
            } else {
                SandboxCommand::new(text)
            };
            let output = Runner::new(&config).run(&command).await?;
            print!("{}", output.text);
            std::process::exit(output.exit_code.unwrap_or(0));
        }
    }
}

async fn run_daemon(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.ensure_layout()?;
    init_daemon_logging(&config)?;
    info!("printd starting, data dir {}", config.data_dir.display());

    let ctx = Context::new(config);

    let bridge = Arc::new(SerialBridge::spawn(&ctx.config)?);
    serial::events::create_event_pipe(&ctx.config)?;
    {
        let ctx = ctx.clone();
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Err(e) = serial::watch::run_device_watcher(ctx, bridge).await {
                log::error!("device watcher failed: {e}");
            }
        });
    }
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serial::events::run_event_listener(ctx).await {
                log::error!("event listener failed: {e}");
            }
        });
    }

    let supervisor = Arc::new(Supervisor::new(ctx.clone()));
    tokio::spawn(services::run_control_listener(Arc::clone(&supervisor)));

    {
        let installer = Installer::new(ctx.clone());
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if let Err(e) = installer.begin_installation(&supervisor).await {
                log::error!("installation failed: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    supervisor.stop_ssh().await?;
    supervisor.stop_all().await?;
    wait_for_state(&ctx, ServerStatus::Stopped, stop_timeout(&ctx.config)).await;
    bridge.stop();
    Ok(())
}

fn init_cli_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Daemon logging goes to stdout and a log file under the data dir
fn init_daemon_logging(config: &Config) -> Result<(), fern::InitError> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    let log_file = config
        .log_file
        .clone()
        .unwrap_or_else(|| config.data_dir.join("printd.log"));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_file)?)
        .apply()?;
    Ok(())
}

async fn print_units(supervisor: &Supervisor) {
    for (unit, active) in supervisor.status_report().await {
        println!("  {} {}", if active { '●' } else { '○' }, unit);
    }
}

fn boot_timeout(config: &Config) -> Duration {
    let polls = config.boot_poll_limit.unwrap_or(120) as u64;
    Duration::from_millis(polls * config.boot_poll_interval_ms) + Duration::from_secs(5)
}

fn stop_timeout(config: &Config) -> Duration {
    let polls = config.stop_poll_limit as u64;
    Duration::from_millis(polls * config.stop_poll_interval_ms) + Duration::from_secs(2)
}

/// Follow the state channel until `target` is reached or the timeout
/// expires
async fn wait_for_state(ctx: &SharedContext, target: ServerStatus, timeout: Duration) -> bool {
    let mut rx = ctx.subscribe_state();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if ctx.state() == target {
            return true;
        }
        if ctx.state() == ServerStatus::Corrupted {
            return false;
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            _ => return ctx.state() == target,
        }
    }
}
