#![forbid(unsafe_code)]

//! Hardening helpers shared by the backend and the storage layer.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The backend spawns an
/// external downloader on behalf of anonymous clients and must never do that
/// with elevated privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

/// True when `name` is a single plain path segment, so joining it onto the
/// storage directory can never escape it.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
