//! Resolution of external helper binaries (mutator, port scanner).
//!
//! Search order: explicit configured path, environment variable,
//! `./vendor/bin/<name>`, then each directory on `PATH`. A tool that cannot
//! be found only disables the engine or scan method that needs it.

use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub env_var: &'static str,
}

pub const RADAMSA: ToolSpec = ToolSpec { name: "radamsa", env_var: "FUZZDECK_RADAMSA" };
pub const NMAP: ToolSpec = ToolSpec { name: "nmap", env_var: "FUZZDECK_NMAP" };

pub fn resolve_tool(tool: &ToolSpec, configured: Option<&Path>) -> Option<PathBuf> {
    let vendor = env::current_dir().ok().map(|d| d.join("vendor").join("bin"));
    resolve_in(tool, configured, env::var_os(tool.env_var).map(PathBuf::from), vendor.as_deref(), env::var_os("PATH"))
}

fn resolve_in(
    tool: &ToolSpec,
    configured: Option<&Path>,
    from_env: Option<PathBuf>,
    vendor_dir: Option<&Path>,
    path_var: Option<std::ffi::OsString>,
) -> Option<PathBuf> {
    if let Some(p) = configured {
        if is_executable(p) {
            return Some(p.to_path_buf());
        }
        tracing::warn!(tool = tool.name, path = %p.display(), "configured tool path is not executable");
    }
    if let Some(p) = from_env {
        if is_executable(&p) {
            return Some(p);
        }
    }
    if let Some(dir) = vendor_dir {
        let p = dir.join(tool.name);
        if is_executable(&p) {
            return Some(p);
        }
    }
    let path_var = path_var?;
    env::split_paths(&path_var).map(|dir| dir.join(tool.name)).find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(p).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const FAKE: ToolSpec = ToolSpec { name: "fakemut", env_var: "FUZZDECK_TEST_FAKEMUT" };

    fn make_exec(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, b"#!/bin/sh\ncat\n").unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let conf = make_exec(dir.path(), "custom-mutator");
        let vendor = tempfile::tempdir().unwrap();
        make_exec(vendor.path(), "fakemut");
        let got = resolve_in(&FAKE, Some(&conf), None, Some(vendor.path()), None);
        assert_eq!(got, Some(conf));
    }

    #[test]
    fn falls_back_to_vendor_then_path() {
        let vendor = tempfile::tempdir().unwrap();
        let on_path = tempfile::tempdir().unwrap();
        let in_path = make_exec(on_path.path(), "fakemut");
        let path_var = env::join_paths([on_path.path()]).unwrap();

        let got = resolve_in(&FAKE, None, None, Some(vendor.path()), Some(path_var.clone()));
        assert_eq!(got, Some(in_path));

        let in_vendor = make_exec(vendor.path(), "fakemut");
        let got = resolve_in(&FAKE, None, None, Some(vendor.path()), Some(path_var));
        assert_eq!(got, Some(in_vendor));
    }

    #[test]
    fn non_executable_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("fakemut");
        std::fs::write(&p, b"data").unwrap();
        let path_var = env::join_paths([dir.path()]).unwrap();
        assert_eq!(resolve_in(&FAKE, None, Some(p), None, Some(path_var)), None);
    }
}
