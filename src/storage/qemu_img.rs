//! `qemu-img` invocation.

use super::DiskInfo;
use crate::error::{Error, Result};
use crate::process;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Image format used for every image the agent creates.
pub const IMAGE_FORMAT: &str = "qcow2";

/// Wrapper around the disk-image tool binary.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    /// Use the tool at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Path of the tool binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `qemu-img create -f qcow2 <url> <size>G`
    pub fn create(&self, path: &Path, url: &str, size_gib: u64) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["create", "-f", IMAGE_FORMAT, url, &format!("{}G", size_gib)]);
        self.execute(cmd, path, "create image").map(|_| ())
    }

    /// `qemu-img create -f qcow2 -F qcow2 -b <backing> <url>`
    pub fn create_overlay(&self, path: &Path, url: &str, backing_url: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args([
            "create",
            "-f",
            IMAGE_FORMAT,
            "-F",
            IMAGE_FORMAT,
            "-b",
            backing_url,
            url,
        ]);
        self.execute(cmd, path, "create overlay").map(|_| ())
    }

    /// `qemu-img resize -f qcow2 <url> <size>G`
    pub fn resize(&self, path: &Path, url: &str, size_gib: u64) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["resize", "-f", IMAGE_FORMAT, url, &format!("{}G", size_gib)]);
        self.execute(cmd, path, "resize image").map(|_| ())
    }

    /// `qemu-img info --output=json -f qcow2 <url>`
    pub fn info(&self, path: &Path, url: &str) -> Result<DiskInfo> {
        let mut cmd = self.command();
        cmd.args(["info", "--output=json", "-f", IMAGE_FORMAT, url]);
        let stdout = self.execute(cmd, path, "read image info")?;

        serde_json::from_str(&stdout).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "unparseable image info");
            Error::command_exec_failed(path, format!("unparseable image info: {}", e))
        })
    }

    /// `qemu-img convert -f qcow2 -O qcow2 [-l snapshot.name=<snapshot>] <src> <dst>`
    pub fn convert(&self, path: &Path, src_url: &str, snapshot: Option<&str>, dst_url: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["convert", "-f", IMAGE_FORMAT, "-O", IMAGE_FORMAT]);
        if let Some(snapshot) = snapshot {
            cmd.arg("-l").arg(format!("snapshot.name={}", snapshot));
        }
        cmd.args([src_url, dst_url]);
        self.execute(cmd, path, "convert image").map(|_| ())
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Run the tool; on non-zero exit log and fail with the combined output.
    /// Returns stdout on success.
    fn execute(&self, mut cmd: Command, path: &Path, what: &str) -> Result<String> {
        let output = process::run(&mut cmd)?;

        if !output.success() {
            let combined = output.combined();
            tracing::error!(
                path = %path.display(),
                exit_code = ?output.code,
                output = %combined,
                "failed to {}",
                what
            );
            return Err(Error::command_exec_failed(path, combined));
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_tool;

    #[test]
    fn test_create_passes_size_in_gib() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let tool = fake_tool(dir.path(), &format!("echo \"$@\" > {}", log.display()));

        QemuImg::new(tool)
            .create(Path::new("/data/a.qcow2"), "/data/a.qcow2", 10)
            .unwrap();

        let args = std::fs::read_to_string(log).unwrap();
        assert_eq!(args.trim(), "create -f qcow2 /data/a.qcow2 10G");
    }

    #[test]
    fn test_nonzero_exit_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'Could not resize' >&2; exit 1");

        let err = QemuImg::new(tool)
            .resize(Path::new("/data/a.qcow2"), "/data/a.qcow2", 20)
            .unwrap_err();

        match err {
            Error::CommandExecFailed { path, output } => {
                assert_eq!(path, PathBuf::from("/data/a.qcow2"));
                assert!(output.contains("Could not resize"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_info_parses_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"echo '{"virtual-size": 1073741824, "filename": "x.qcow2", "format": "qcow2"}'"#,
        );

        let info = QemuImg::new(tool)
            .info(Path::new("x.qcow2"), "x.qcow2")
            .unwrap();
        assert_eq!(info.virtual_size, 1073741824);
    }

    #[test]
    fn test_info_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo not-json");

        let err = QemuImg::new(tool)
            .info(Path::new("x.qcow2"), "x.qcow2")
            .unwrap_err();
        assert!(matches!(err, Error::CommandExecFailed { .. }));
    }

    #[test]
    fn test_convert_selects_internal_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let tool = fake_tool(dir.path(), &format!("echo \"$@\" > {}", log.display()));

        QemuImg::new(tool)
            .convert(Path::new("/data/t.qcow2"), "/data/a.qcow2", Some("snap-1"), "/data/t.qcow2")
            .unwrap();

        let args = std::fs::read_to_string(log).unwrap();
        assert_eq!(
            args.trim(),
            "convert -f qcow2 -O qcow2 -l snapshot.name=snap-1 /data/a.qcow2 /data/t.qcow2"
        );
    }
}
