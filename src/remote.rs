//! Command execution on peer hosts.

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::process;
use std::process::Command;
use std::time::Duration;

/// Runs commands on another hypervisor host.
pub trait RemoteExec: Send + Sync {
    /// Run `command` on `host`; returns its stdout.
    fn run(&self, host: &str, command: &[String]) -> Result<String>;
}

/// Remote execution over `ssh`.
#[derive(Debug, Clone)]
pub struct SshExec {
    user: String,
    port: u16,
    connect_timeout: Duration,
}

impl SshExec {
    /// Connect as `user` on `port`.
    pub fn new(user: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            port,
            connect_timeout,
        }
    }

    /// Settings from the dispatch configuration.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(&config.ssh_user, config.ssh_port, config.ssh_connect_timeout)
    }

    fn command(&self, host: &str, command: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, host))
            .arg("--");
        cmd.args(command.iter().map(|arg| shell_quote(arg)));
        cmd
    }
}

impl RemoteExec for SshExec {
    fn run(&self, host: &str, command: &[String]) -> Result<String> {
        let output = process::run(&mut self.command(host, command))?;
        if !output.success() {
            let combined = output.combined();
            tracing::error!(host = %host, exit_code = ?output.code, output = %combined, "remote command failed");
            return Err(Error::command_failed(
                format!("ssh {} {}", host, command.join(" ")),
                combined,
            ));
        }
        Ok(output.stdout)
    }
}

/// Quote an argument for the remote shell.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/a.qcow2"), "/data/a.qcow2");
        assert_eq!(shell_quote("10G"), "10G");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_command_targets_user_and_port() {
        let ssh = SshExec::new("root", 2222, Duration::from_secs(5));
        let cmd = ssh.command("10.0.0.2", &["qemu-img".to_string(), "info".to_string()]);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"root@10.0.0.2".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert_eq!(args[args.len() - 2..], ["qemu-img", "info"]);
    }
}
