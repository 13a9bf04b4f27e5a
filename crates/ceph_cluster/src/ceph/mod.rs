pub mod auth;
pub mod command;
pub mod mgr;
pub mod mon;
pub mod osd;
pub mod retry;
pub mod status;

#[cfg(test)]
pub mod testing;

pub use command::{CephClient, CephConnection, CommandError, CommandExecutor, CommandOutput, ProcessExecutor};
