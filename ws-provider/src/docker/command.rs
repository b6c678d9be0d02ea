//! Docker command builder.
//!
//! Builds a `docker` invocation with a fluent interface and renders it to a
//! single shell-quoted string suitable for `sh -c` or a remote shell.

use std::collections::BTreeMap;

use ws_core::{redact_credentials, shell_quote};

/// Flags whose `KEY=value` argument carries an environment value.
const ENV_FLAGS: [&str; 3] = ["-e", "--env", "--remote-env"];

/// Builder for Docker commands.
#[derive(Debug, Clone, Default)]
pub struct DockerCommand {
    program: String,
    subcommand: Option<String>,
    args: Vec<String>,
}

impl DockerCommand {
    pub fn new() -> Self {
        Self::program("docker")
    }

    /// Builder for another CLI that follows the same conventions (e.g. `devcontainer`).
    pub fn program<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            subcommand: None,
            args: Vec::new(),
        }
    }

    /// Set the subcommand (e.g. "ps", "exec", "create").
    pub fn subcommand<S: Into<String>>(mut self, cmd: S) -> Self {
        self.subcommand = Some(cmd.into());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add `flag value` when `value` is set.
    pub fn opt<S: Into<String>>(self, flag: &str, value: Option<S>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    /// Add `flag key=value` for every pair.
    pub fn pairs(mut self, flag: &str, pairs: &BTreeMap<String, String>) -> Self {
        for (key, value) in pairs {
            self = self.arg(flag).arg(format!("{}={}", key, value));
        }
        self
    }

    /// Render to a shell command line with every argument quoted.
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.subcommand.as_deref())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render for logs: environment values and URL credentials are masked.
    pub fn redacted(&self) -> String {
        let mut args = Vec::with_capacity(self.args.len());
        let mut env_value = false;
        for arg in &self.args {
            args.push(match arg.split_once('=') {
                Some((key, _)) if env_value => format!("{}=***", key),
                _ => redact_credentials(arg),
            });
            env_value = ENV_FLAGS.contains(&arg.as_str());
        }
        Self {
            program: self.program.clone(),
            subcommand: self.subcommand.clone(),
            args,
        }
        .render()
    }
}
