//! External command execution.

use crate::error::{Error, Result};
use std::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output followed by standard error, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Run a command to completion, capturing its output.
///
/// Fails only if the command could not be spawned; a non-zero exit is
/// reported through [`CommandOutput::code`].
pub fn run(cmd: &mut Command) -> Result<CommandOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    tracing::debug!(command = ?cmd, "running command");

    let output = cmd
        .output()
        .map_err(|e| Error::command_failed(&program, e.to_string()))?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_exit_code_and_streams() {
        let out = run(Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"])).unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr");
    }

    #[test]
    fn test_run_missing_program_is_command_failed() {
        let err = run(&mut Command::new("/nonexistent/virtnode-tool")).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_combined_with_only_stderr() {
        let out = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(out.combined(), "boom");
    }
}
