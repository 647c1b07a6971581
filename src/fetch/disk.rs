use std::path::Path;

use sysinfo::Disks;
use tracing::{debug, warn};

use super::FetchError;

/// Headroom kept free on top of a task's computed requirement.
pub const SAFETY_BUFFER: u64 = 100 * 1024 * 1024;

/// Free bytes on the filesystem holding `dir`, picking the deepest mount point
/// that contains it.
pub fn available_space(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

pub fn check_space(available: u64, required: u64) -> Result<(), FetchError> {
    let needed = required.saturating_add(SAFETY_BUFFER);
    if available < needed {
        return Err(FetchError::InsufficientDiskSpace { required: needed, available });
    }
    Ok(())
}

/// Fail with `InsufficientDiskSpace` unless `dir` has `required` bytes plus
/// [`SAFETY_BUFFER`] free. A zero requirement or an undeterminable filesystem
/// is let through.
pub fn ensure_disk_space(dir: &Path, required: u64) -> Result<(), FetchError> {
    if required == 0 {
        return Ok(());
    }
    match available_space(dir) {
        Some(available) => {
            debug!("{} bytes available under {}, {} required", available, dir.display(), required);
            check_space(available, required)
        }
        None => {
            warn!("Could not determine free space for {}, skipping check", dir.display());
            Ok(())
        }
    }
}
