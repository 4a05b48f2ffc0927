//! Control event pipe
//!
//! A named pipe next to the virtual serial port lets the sandboxed stack
//! (or anything else on the host) ask the daemon to stop or restart the
//! services. One request per line:
//!
//! ```text
//!   echo "restart server" > <data>/event-pipe
//! ```
//!
//! Unknown lines are logged and dropped. The listener keeps the pipe
//! open across writers and survives EOF, so it serves any number of
//! one-shot writers over the daemon's lifetime.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;

use crate::config::Config;
use crate::context::{ControlEvent, SharedContext};

/// Parse one request line into a control event
pub fn parse_event(line: &str) -> Option<ControlEvent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "stop" | "stop server" => Some(ControlEvent::StopServices),
        "restart" | "restart server" => Some(ControlEvent::RestartServices),
        _ => None,
    }
}

/// (Re)create the request pipe, replacing whatever sat at its path
pub fn create_event_pipe(config: &Config) -> io::Result<PathBuf> {
    let path = config.event_pipe_path();
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    mkfifo(&path, Mode::from_bits_truncate(0o666)).map_err(io::Error::from)?;
    log::debug!("event pipe at {}", path.display());
    Ok(path)
}

/// Read request lines from the pipe and publish them as control events.
/// Returns only when the pipe cannot be reopened.
pub async fn run_event_listener(ctx: SharedContext) -> io::Result<()> {
    let path = ctx.config.event_pipe_path();
    let receiver = pipe::OpenOptions::new().open_receiver(&path)?;
    let mut lines = BufReader::new(receiver).lines();

    loop {
        match lines.next_line().await? {
            Some(line) => match parse_event(&line) {
                Some(event) => ctx.publish_control(event),
                None => log::warn!("ignoring unknown control request {line:?}"),
            },
            // no writer connected right now
            None => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}
