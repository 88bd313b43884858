//! Discovery of external tools on the host.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Resolves a program given either as a path or as a bare name looked up in `PATH`.
pub fn resolve_program(prog: &str) -> Option<PathBuf> {
    if prog.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(prog);
        return (path.is_file() && is_executable(&path)).then_some(path);
    }
    find_in_path(prog)
}

pub fn find_in_path(prog: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let cand = dir.join(prog);
        if cand.is_file() && is_executable(&cand) {
            return Some(cand);
        }
    }
    None
}

pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Ok(meta) = std::fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
        false
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// First non-empty line printed by `<program> --version`.
pub fn tool_version(program: &Path) -> Option<String> {
    let out = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !out.status.success() {
        return None;
    }

    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
