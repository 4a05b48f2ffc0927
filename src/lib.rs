//! printd - 3D printer host stack in a proot sandbox
//!
//! A daemon that:
//! - Provisions a Linux userland from container images
//! - Installs and supervises Klipper, Moonraker and Mainsail inside it
//! - Bridges the sandboxed stack to real printer hardware over a pty
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                     printd                       │
//! ├──────────────────────────────────────────────────┤
//! │  Image Resolver │ Install Stages │  Supervisor   │
//! ├──────────────────────────────────────────────────┤
//! │   Rootfs Store  │ Command Runner │ Serial Bridge │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! All long-lived pieces hang off a shared [`context::Context`]: state
//! and progress go out over watch channels, control requests come back
//! in over a broadcast channel.

pub mod config;
pub mod context;
pub mod images;
pub mod rootfs;
pub mod sandbox;
pub mod serial;
pub mod services;
pub mod setup;

pub use config::Config;
pub use context::{Context, ServerStatus, SharedContext};
