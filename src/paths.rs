use std::path::{Path, PathBuf};

/// Default daemon config file: `~/.config/flotilla/daemon.toml`
pub fn config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("flotilla")
        .join("daemon.toml")
}

/// Default image store: `~/.cache/flotilla/images/`
pub fn default_store_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("flotilla")
        .join("images")
}

/// Default run root holding one directory per live VM: `~/.local/share/flotilla/running/`
pub fn default_run_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("flotilla")
        .join("running")
}

/// `<store>/<channel>/<version>/`
pub fn image_dir(store: &Path, channel: &str, version: &str) -> PathBuf {
    store.join(channel).join(version)
}

/// Per-VM run directory: `<run_root>/<uuid>/`
pub fn vm_dir(run_root: &Path, uuid: &str) -> PathBuf {
    run_root.join(uuid)
}

/// Console device link the runner creates for a VM.
pub fn tty_path(run_root: &Path, uuid: &str) -> PathBuf {
    vm_dir(run_root, uuid).join("tty")
}

/// Runner output for a VM (boot log).
pub fn log_path(run_root: &Path, uuid: &str) -> PathBuf {
    vm_dir(run_root, uuid).join("log")
}

/// Daemon's own trace log.
pub fn daemon_log(run_root: &Path) -> PathBuf {
    run_root.join("flotilla.log")
}
