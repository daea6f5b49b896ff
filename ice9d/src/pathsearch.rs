//! Executable lookup along `PATH` for bare program names.

use std::env;
use std::ffi::OsStr;
use std::path::PathBuf;

/// Probes every `PATH` element for `name`, then `name` + `.exe`, and
/// returns the first candidate that exists. The `.exe` fallback keeps bare
/// Windows-style program names usable from unmodified clients.
pub fn search(name: &OsStr) -> Option<PathBuf> {
    search_in(&env::var_os("PATH")?, name)
}

fn search_in(path: &OsStr, name: &OsStr) -> Option<PathBuf> {
    for dir in env::split_paths(path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
        let mut with_exe = candidate.into_os_string();
        with_exe.push(".exe");
        let with_exe = PathBuf::from(with_exe);
        if with_exe.exists() {
            return Some(with_exe);
        }
    }
    None
}
