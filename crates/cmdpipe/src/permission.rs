//! Execute-permission remediation for stages that fail to spawn with
//! "permission denied".

use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::command::StageSpec;

/// Whether a spawn error has the "file is not executable" signature.
pub fn is_permission_denied(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EACCES)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Add the owner-execute bit to `path` if it is a regular file without any
/// execute bit. Returns whether the mode was changed.
#[cfg(unix)]
pub fn grant_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let mode = meta.permissions().mode();
    if !meta.is_file() || mode & 0o111 != 0 {
        return false;
    }
    match std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o100)) {
        Ok(()) => {
            info!(path = %path.display(), "Granted owner execute permission");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to grant execute permission");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn grant_executable(_path: &Path) -> bool {
    false
}

/// Try [`grant_executable`] on every stage program. Returns whether at
/// least one grant succeeded.
pub fn grant_all(stages: &[StageSpec]) -> bool {
    stages
        .iter()
        .map(|stage| grant_executable(Path::new(stage.program())))
        .fold(false, |any, granted| any | granted)
}
