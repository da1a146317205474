//! Best-effort platform metadata on assets and sidecars.
//!
//! Every function here swallows its own failures after logging them at
//! `debug`: filesystems without xattr support or a missing `chflags` binary
//! are expected, not errors.

use std::path::Path;

use tracing::debug;

/// Attach the QC event id to `path` as an extended attribute.
#[cfg(unix)]
pub fn tag_qc_id(path: &Path, key: &str, qc_id: &str) {
    if let Err(err) = xattr::set(path, key, qc_id.as_bytes()) {
        debug!("xattr {} on {:?} not set: {}", key, path, err);
    }
}

#[cfg(not(unix))]
pub fn tag_qc_id(path: &Path, key: &str, _qc_id: &str) {
    debug!("xattr {} on {:?} skipped: unsupported platform", key, path);
}

/// Read back the QC event id written by [`tag_qc_id`].
#[cfg(unix)]
pub fn read_qc_id(path: &Path, key: &str) -> Option<String> {
    match xattr::get(path, key) {
        Ok(Some(raw)) => String::from_utf8(raw).ok(),
        Ok(None) => None,
        Err(err) => {
            debug!("xattr {} on {:?} unreadable: {}", key, path, err);
            None
        }
    }
}

#[cfg(not(unix))]
pub fn read_qc_id(_path: &Path, _key: &str) -> Option<String> {
    None
}

/// Apply the platform hidden flag. Dot-prefixed names are already hidden on
/// Linux, so this only does work on macOS and Windows.
pub fn set_hidden(path: &Path) {
    #[cfg(target_os = "macos")]
    run_hide_command("chflags", &["hidden"], path);

    #[cfg(windows)]
    run_hide_command("attrib", &["+h"], path);

    #[cfg(not(any(target_os = "macos", windows)))]
    let _ = path;
}

#[cfg(any(target_os = "macos", windows))]
fn run_hide_command(program: &str, args: &[&str], path: &Path) {
    match std::process::Command::new(program)
        .args(args)
        .arg(path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("{} on {:?} exited with {}", program, path, status),
        Err(err) => debug!("{} on {:?} failed: {}", program, path, err),
    }
}
