use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn apsbss_root(home: &Path) -> PathBuf {
    bss_core::config::apsbss_root(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    apsbss_root(home).join(DAEMON_SOCKET)
}

pub fn published_dir(home: &Path) -> PathBuf {
    apsbss_root(home).join("published")
}
