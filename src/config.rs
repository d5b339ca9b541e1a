//! Environment-driven configuration (§4.6, §6).

use std::path::PathBuf;

pub const DEFAULT_ROOT: &str = "/opt/minix";

/// Resolve the host root directory from `MINIXCOMPAT_DIR`, defaulting to
/// [`DEFAULT_ROOT`], and write the resolved value back into the
/// environment so child processes see the same root (§6).
pub fn root_dir() -> PathBuf {
    let root = std::env::var("MINIXCOMPAT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT));
    // SAFETY: single-threaded at startup, before any other env access.
    unsafe { std::env::set_var("MINIXCOMPAT_DIR", &root) };
    root
}

/// Resolve the initial guest cwd: `MINIXCOMPAT_PWD` if set, else the
/// host cwd if it lies under `root`, else `/`. No validation is
/// performed that `MINIXCOMPAT_PWD` actually lies under `root` (§4.6
/// open question, kept for source fidelity).
pub fn initial_guest_cwd(root: &std::path::Path) -> String {
    if let Ok(pwd) = std::env::var("MINIXCOMPAT_PWD") {
        return pwd;
    }
    if let Ok(host_cwd) = std::env::current_dir() {
        if let Ok(relative) = host_cwd.strip_prefix(root) {
            let mut guest = String::from("/");
            guest.push_str(&relative.to_string_lossy());
            return guest;
        }
    }
    "/".to_string()
}
