//! Shared test fixtures.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable shell script named `qemu-img` into `dir`.
pub fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    fake_named_tool(dir, "qemu-img", body)
}

/// Write an executable shell script named `name` into `dir`.
pub fn fake_named_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A tool that records its arguments, one invocation per line, to `log`.
pub fn recording_tool(dir: &Path, log: &Path) -> PathBuf {
    fake_tool(dir, &format!("echo \"$@\" >> {}", log.display()))
}
