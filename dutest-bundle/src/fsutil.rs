// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use std::io;

/// Creates an entity output directory.
///
/// Tests may run as a different user than the harness, so the directory is
/// world-writable with the sticky bit set, like `/tmp`.
pub(crate) fn make_out_dir(path: &Utf8Path) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777 | 0o1000))?;
    }
    Ok(())
}
