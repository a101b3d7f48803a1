//! Process hardening for sessions that hold cleartext secrets.

use crate::error::{Error, Result};

/// Disable core dumps for the current process so the data key and decrypted
/// leaves cannot land in a crash dump.
pub fn disable_core_dumps() -> Result<()> {
    #[cfg(unix)]
    {
        use libc::{rlimit, setrlimit, RLIMIT_CORE};
        let rlim = rlimit { rlim_cur: 0, rlim_max: 0 };
        let result = unsafe { setrlimit(RLIMIT_CORE, &rlim) };
        if result == 0 {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::last_os_error()))
        }
    }
    #[cfg(not(unix))]
    {
        Ok(())
    }
}

/// Restrict a file to its owner (0600). Plaintext temp files get this before
/// any secret byte is written.
pub fn set_secure_permissions(path: &std::path::Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
