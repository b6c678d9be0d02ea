//! Docker CLI implementation of [`ContainerRuntime`](crate::runtime::ContainerRuntime).
//!
//! Commands are rendered to shell strings and handed to an
//! [`Executor`](ws_core::Executor), so the same code drives a local daemon or
//! one reached over a remote shell.

mod cli;
mod command;

pub use cli::DockerCli;
pub use command::DockerCommand;
