//! Helpers around the host filesystem backing the served tree.

use std::path::Path;

use nix::sys::stat::FileStat;

use crate::common::error::{SessionFsError, SessionFsResult};
use crate::common::util::fold_timestamp;
use crate::rpc::message::AttrResponse;

/// Stat the given path, mapping a missing entry to `NotFound`.
pub fn stat_path(path: &Path) -> SessionFsResult<FileStat> {
    nix::sys::stat::stat(path).map_err(|errno| match errno {
        nix::Error::ENOENT => SessionFsError::NotFound {
            path: path.display().to_string(),
            context: vec![],
        },
        nix::Error::EACCES => SessionFsError::PermissionDenied {
            context: vec![format!("stat {}", path.display())],
        },
        other => SessionFsError::NixErr {
            source: other,
            context: vec![format!("stat {}", path.display())],
        },
    })
}

/// The authoritative timestamp of a file: its modification time in
/// nanoseconds since the epoch, used as the version cookie for cache
/// coherence.
pub fn file_timestamp(path: &Path) -> SessionFsResult<i64> {
    let stat = stat_path(path)?;
    Ok(fold_timestamp(stat.st_mtime, stat.st_mtime_nsec))
}

/// The full attribute set served to `getattr`, timestamps in
/// nanoseconds.
pub fn stat_attr(path: &Path) -> SessionFsResult<AttrResponse> {
    let stat = stat_path(path)?;
    Ok(AttrResponse {
        size: stat.st_size,
        mode: stat.st_mode,
        nlink: stat.st_nlink,
        uid: stat.st_uid,
        gid: stat.st_gid,
        atime: fold_timestamp(stat.st_atime, stat.st_atime_nsec),
        mtime: fold_timestamp(stat.st_mtime, stat.st_mtime_nsec),
        ctime: fold_timestamp(stat.st_ctime, stat.st_ctime_nsec),
    })
}
