//! Host integration for the installer: the `CommandExecutor` that actually
//! spawns processes. `command` owns process plumbing; `system` maps command
//! specs onto it.

mod command;
mod system;

pub use system::{SystemExecutor, DEFAULT_CHROOT_PATHS};
